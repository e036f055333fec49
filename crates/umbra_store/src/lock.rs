//! Pessimistic lock manager with deadlock detection.
//!
//! Locks are two-phase: acquired on first access, held until the owning
//! transaction commits or aborts. A blocked acquire waits on a condvar,
//! bounded by the transaction's deadline. Every time a transaction blocks,
//! the wait-for graph is checked for a cycle; if one is found, the youngest
//! transaction in the cycle (largest [`TxnId`]) is doomed and woken.

use crate::error::{StoreError, StoreResult};
use crate::types::{ObjectId, TxnId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// What a transaction locks: an object, a binding name, or the class table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// A stored object.
    Object(ObjectId),
    /// A name binding (internal, prefixed name).
    Binding(String),
    /// The whole class-descriptor table.
    ClassTable,
}

/// Lock strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Shared (read) access; compatible with other shared holders.
    Shared,
    /// Exclusive (write) access.
    Exclusive,
}

/// Why a transaction was asynchronously aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoomReason {
    /// Chosen as the victim of a deadlock cycle.
    Deadlock,
    /// Deadline passed.
    Timeout,
}

impl DoomReason {
    fn into_error(self, txn: TxnId) -> StoreError {
        match self {
            Self::Deadlock => StoreError::TransactionConflict {
                txn,
                deadlock: true,
            },
            Self::Timeout => StoreError::TransactionTimeout { txn },
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    writer: Option<TxnId>,
    readers: HashSet<TxnId>,
}

impl LockState {
    /// A lock is grantable when no *other* transaction holds a conflicting
    /// mode. Upgrades (sole reader requesting exclusive) are grantable.
    fn grantable(&self, txn: TxnId, mode: LockMode) -> bool {
        match mode {
            LockMode::Shared => self.writer.is_none() || self.writer == Some(txn),
            LockMode::Exclusive => {
                (self.writer.is_none() || self.writer == Some(txn))
                    && self.readers.iter().all(|r| *r == txn)
            }
        }
    }

    fn grant(&mut self, txn: TxnId, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                if self.writer != Some(txn) {
                    self.readers.insert(txn);
                }
            }
            LockMode::Exclusive => {
                self.readers.remove(&txn);
                self.writer = Some(txn);
            }
        }
    }

    /// The holders that prevent `txn` from acquiring `mode`.
    fn conflicting_holders(&self, txn: TxnId, mode: LockMode) -> Vec<TxnId> {
        let mut out = Vec::new();
        if let Some(w) = self.writer {
            if w != txn {
                out.push(w);
            }
        }
        if mode == LockMode::Exclusive {
            out.extend(self.readers.iter().copied().filter(|r| *r != txn));
        }
        out
    }

    fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty()
    }
}

#[derive(Default)]
struct LockTable {
    locks: HashMap<LockKey, LockState>,
    /// Keys held by each transaction, for release.
    held: HashMap<TxnId, HashSet<LockKey>>,
    /// What each blocked transaction is currently waiting for.
    wants: HashMap<TxnId, (LockKey, LockMode)>,
    /// Transactions marked dead; they learn of it at their next operation
    /// or when they wake from a lock wait.
    doomed: HashMap<TxnId, DoomReason>,
}

impl LockTable {
    /// Searches the wait-for graph for a cycle through `start` and returns
    /// the chosen victim: the youngest transaction on the cycle.
    fn find_victim(&self, start: TxnId) -> Option<TxnId> {
        let mut path = vec![start];
        let mut visited = HashSet::new();
        visited.insert(start);
        self.walk(start, start, &mut path, &mut visited)
    }

    fn walk(
        &self,
        start: TxnId,
        current: TxnId,
        path: &mut Vec<TxnId>,
        visited: &mut HashSet<TxnId>,
    ) -> Option<TxnId> {
        let (key, mode) = self.wants.get(&current)?;
        let state = self.locks.get(key)?;
        for holder in state.conflicting_holders(current, *mode) {
            if holder == start {
                // Cycle closed; the youngest transaction on it loses.
                return path.iter().max().copied();
            }
            if visited.insert(holder) {
                path.push(holder);
                if let Some(victim) = self.walk(start, holder, path, visited) {
                    return Some(victim);
                }
                path.pop();
            }
        }
        None
    }
}

/// The store's lock manager.
///
/// One instance per store. All lock state lives behind a single mutex; the
/// condvar is broadcast on every release or doom so blocked acquirers can
/// re-evaluate.
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Creates an empty lock manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
        }
    }

    /// Acquires `key` in `mode` for `txn`, blocking until granted, the
    /// deadline passes, or the transaction is doomed.
    ///
    /// # Errors
    ///
    /// - [`StoreError::TransactionConflict`] if `txn` is chosen as a
    ///   deadlock victim (its own cycle, or doomed by another's detection)
    /// - [`StoreError::TransactionTimeout`] if `deadline` passes first
    pub fn acquire(
        &self,
        txn: TxnId,
        key: &LockKey,
        mode: LockMode,
        deadline: Instant,
    ) -> StoreResult<()> {
        let mut table = self.table.lock();
        loop {
            if let Some(reason) = table.doomed.get(&txn).copied() {
                table.wants.remove(&txn);
                return Err(reason.into_error(txn));
            }

            let granted = {
                let state = table.locks.entry(key.clone()).or_default();
                if state.grantable(txn, mode) {
                    state.grant(txn, mode);
                    true
                } else {
                    false
                }
            };
            if granted {
                table.wants.remove(&txn);
                table.held.entry(txn).or_default().insert(key.clone());
                return Ok(());
            }

            table.wants.insert(txn, (key.clone(), mode));
            if let Some(victim) = table.find_victim(txn) {
                if victim == txn {
                    table.wants.remove(&txn);
                    return Err(StoreError::TransactionConflict {
                        txn,
                        deadlock: true,
                    });
                }
                tracing::debug!(victim = %victim, waiter = %txn, "deadlock cycle; dooming victim");
                table.doomed.insert(victim, DoomReason::Deadlock);
                self.released.notify_all();
            }

            if Instant::now() >= deadline {
                table.wants.remove(&txn);
                return Err(StoreError::TransactionTimeout { txn });
            }
            if self
                .released
                .wait_until(&mut table, deadline)
                .timed_out()
            {
                table.wants.remove(&txn);
                return Err(StoreError::TransactionTimeout { txn });
            }
        }
    }

    /// Marks `txn` dead with `reason` and wakes any waiters.
    ///
    /// Used by the deadline sweep; the transaction observes the doom at its
    /// next operation.
    pub fn doom(&self, txn: TxnId, reason: DoomReason) {
        let mut table = self.table.lock();
        table.doomed.entry(txn).or_insert(reason);
        self.released.notify_all();
    }

    /// Returns the doom reason for `txn`, if any.
    #[must_use]
    pub fn doom_reason(&self, txn: TxnId) -> Option<DoomReason> {
        self.table.lock().doomed.get(&txn).copied()
    }

    /// Fails with the doom error if `txn` has been marked dead.
    pub fn check_doom(&self, txn: TxnId) -> StoreResult<()> {
        match self.doom_reason(txn) {
            Some(reason) => Err(reason.into_error(txn)),
            None => Ok(()),
        }
    }

    /// Releases everything `txn` holds and forgets its doom state.
    pub fn release_all(&self, txn: TxnId) {
        let mut table = self.table.lock();
        if let Some(keys) = table.held.remove(&txn) {
            for key in keys {
                let mut free = false;
                if let Some(state) = table.locks.get_mut(&key) {
                    if state.writer == Some(txn) {
                        state.writer = None;
                    }
                    state.readers.remove(&txn);
                    free = state.is_free();
                }
                if free {
                    table.locks.remove(&key);
                }
            }
        }
        table.wants.remove(&txn);
        table.doomed.remove(&txn);
        self.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(10)
    }

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(50)
    }

    fn oid(n: u64) -> LockKey {
        LockKey::Object(ObjectId::new(n).unwrap())
    }

    #[test]
    fn shared_locks_coexist() {
        let lm = LockManager::new();
        lm.acquire(TxnId::new(1), &oid(1), LockMode::Shared, far())
            .unwrap();
        lm.acquire(TxnId::new(2), &oid(1), LockMode::Shared, far())
            .unwrap();
    }

    #[test]
    fn exclusive_blocks_until_release() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(TxnId::new(1), &oid(1), LockMode::Exclusive, far())
            .unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = thread::spawn(move || {
            lm2.acquire(TxnId::new(2), &oid(1), LockMode::Exclusive, far())
        });

        thread::sleep(Duration::from_millis(20));
        lm.release_all(TxnId::new(1));
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn blocked_exclusive_times_out() {
        let lm = LockManager::new();
        lm.acquire(TxnId::new(1), &oid(1), LockMode::Exclusive, far())
            .unwrap();
        let err = lm
            .acquire(TxnId::new(2), &oid(1), LockMode::Exclusive, soon())
            .unwrap_err();
        assert!(matches!(err, StoreError::TransactionTimeout { .. }));
    }

    #[test]
    fn upgrade_when_sole_reader() {
        let lm = LockManager::new();
        let txn = TxnId::new(1);
        lm.acquire(txn, &oid(1), LockMode::Shared, far()).unwrap();
        lm.acquire(txn, &oid(1), LockMode::Exclusive, far()).unwrap();
        // Another reader must now block.
        let err = lm
            .acquire(TxnId::new(2), &oid(1), LockMode::Shared, soon())
            .unwrap_err();
        assert!(matches!(err, StoreError::TransactionTimeout { .. }));
    }

    #[test]
    fn deadlock_dooms_youngest() {
        let lm = Arc::new(LockManager::new());
        let old = TxnId::new(1);
        let young = TxnId::new(2);
        lm.acquire(old, &oid(1), LockMode::Exclusive, far()).unwrap();
        lm.acquire(young, &oid(2), LockMode::Exclusive, far())
            .unwrap();

        // Young blocks on 1 (held by old).
        let lm2 = Arc::clone(&lm);
        let young_wait =
            thread::spawn(move || lm2.acquire(young, &oid(1), LockMode::Exclusive, far()));
        thread::sleep(Duration::from_millis(20));

        // Old blocks on 2 (held by young): cycle. Young is doomed and
        // wakes with the conflict; old keeps waiting for the release.
        let lm3 = Arc::clone(&lm);
        let old_wait =
            thread::spawn(move || lm3.acquire(old, &oid(2), LockMode::Exclusive, far()));

        let err = young_wait.join().unwrap().unwrap_err();
        assert!(matches!(
            err,
            StoreError::TransactionConflict { deadlock: true, .. }
        ));

        lm.release_all(young);
        old_wait.join().unwrap().unwrap();
        lm.release_all(old);
    }

    #[test]
    fn doom_wakes_waiter() {
        let lm = Arc::new(LockManager::new());
        lm.acquire(TxnId::new(1), &oid(1), LockMode::Exclusive, far())
            .unwrap();

        let lm2 = Arc::clone(&lm);
        let waiter = thread::spawn(move || {
            lm2.acquire(TxnId::new(2), &oid(1), LockMode::Exclusive, far())
        });
        thread::sleep(Duration::from_millis(20));

        lm.doom(TxnId::new(2), DoomReason::Timeout);
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, StoreError::TransactionTimeout { .. }));
    }

    #[test]
    fn release_clears_doom() {
        let lm = LockManager::new();
        let txn = TxnId::new(1);
        lm.doom(txn, DoomReason::Timeout);
        assert!(lm.check_doom(txn).is_err());
        lm.release_all(txn);
        assert!(lm.check_doom(txn).is_ok());
    }

    #[test]
    fn reacquire_held_lock_is_noop() {
        let lm = LockManager::new();
        let txn = TxnId::new(1);
        lm.acquire(txn, &oid(1), LockMode::Exclusive, far()).unwrap();
        lm.acquire(txn, &oid(1), LockMode::Shared, far()).unwrap();
        lm.acquire(txn, &oid(1), LockMode::Exclusive, far()).unwrap();
    }
}
