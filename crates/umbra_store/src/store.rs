//! The durable object store.
//!
//! Maps object IDs to serialized payloads and names to object IDs, with
//! serializable isolation: pessimistic two-phase locks, a write-ahead log,
//! and a prepare/commit/abort protocol so the store can participate in
//! two-phase commit.

use crate::dir::StoreDir;
use crate::error::{StoreError, StoreResult};
use crate::lock::{DoomReason, LockKey, LockManager, LockMode};
use crate::scheduler::{Scheduler, TaskHandle, ThreadScheduler};
use crate::snapshot::StoreImage;
use crate::txn::{TxnBody, TxnEntry, TxnPhase};
use crate::types::{ClassId, ObjectId, TxnId};
use crate::wal::{LogManager, LogRecord};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};
use umbra_storage::{FileBackend, MemoryBackend, StorageBackend};

/// Outcome of the first phase of two-phase commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// The transaction staged no writes; the commit call may be skipped.
    ReadOnly,
    /// All mutations are durably logged; awaiting commit or abort.
    Prepared,
}

/// The store contract the data service is written against.
///
/// All operations except [`begin`](Self::begin) and
/// [`shutdown`](Self::shutdown) run in the scope of a transaction handle
/// returned by `begin`. Locks taken on behalf of a transaction are held
/// until it commits or aborts.
pub trait ObjectStore: Send + Sync {
    /// Registers a new transaction with the given deadline.
    fn begin(&self, deadline: Instant) -> StoreResult<TxnId>;

    /// Allocates a fresh object ID: never previously allocated, never
    /// reused, monotonically increasing.
    fn allocate_id(&self, txn: TxnId) -> StoreResult<ObjectId>;

    /// Returns the payload of `id`, taking a read lock, or a write lock
    /// when `for_update` is set.
    fn get_object(&self, txn: TxnId, id: ObjectId, for_update: bool) -> StoreResult<Vec<u8>>;

    /// Stages a payload for `id`, upgrading to a write lock if needed.
    fn put_object(&self, txn: TxnId, id: ObjectId, bytes: Vec<u8>) -> StoreResult<()>;

    /// Stages removal of `id` under a write lock.
    fn remove_object(&self, txn: TxnId, id: ObjectId) -> StoreResult<()>;

    /// Returns the object bound to `name`.
    fn get_binding(&self, txn: TxnId, name: &str) -> StoreResult<ObjectId>;

    /// Stages a binding of `name` to `id`.
    fn set_binding(&self, txn: TxnId, name: &str, id: ObjectId) -> StoreResult<()>;

    /// Stages removal of the binding for `name`.
    fn remove_binding(&self, txn: TxnId, name: &str) -> StoreResult<()>;

    /// Returns the lexicographically next bound name after `name`, or
    /// `None` at the end, reflecting the transaction's own staged changes.
    fn next_bound_name(&self, txn: TxnId, name: &str) -> StoreResult<Option<String>>;

    /// Returns the class ID for `descriptor`, assigning the next small
    /// integer on first encounter. New assignments survive iff the
    /// transaction commits.
    fn get_class_id(&self, txn: TxnId, descriptor: &[u8]) -> StoreResult<ClassId>;

    /// Returns the descriptor for `class`. Unknown IDs are an error.
    fn get_class_descriptor(&self, txn: TxnId, class: ClassId) -> StoreResult<Vec<u8>>;

    /// First phase of commit: durably logs the staged mutations.
    fn prepare(&self, txn: TxnId) -> StoreResult<Vote>;

    /// Second phase: applies the staged mutations and releases locks.
    fn commit(&self, txn: TxnId) -> StoreResult<()>;

    /// Discards the staged mutations and releases locks.
    fn abort(&self, txn: TxnId) -> StoreResult<()>;

    /// Blocks new transactions and waits for in-flight ones to settle.
    ///
    /// Returns `Ok(true)` on a clean close, `Ok(false)` if the drain
    /// deadline passed (the store stays usable).
    fn shutdown(&self) -> StoreResult<bool>;
}

/// Configuration for opening a [`DataStore`].
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Whether to fsync the log on every commit (safer but slower).
    pub flush_on_commit: bool,
    /// How often to checkpoint; zero disables.
    pub checkpoint_interval: Duration,
    /// How often the deadline sweep runs.
    pub sweep_interval: Duration,
    /// How long `shutdown` waits for in-flight transactions to settle.
    pub shutdown_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_on_commit: true,
            checkpoint_interval: Duration::ZERO,
            sweep_interval: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl StoreConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to fsync the log on every commit.
    #[must_use]
    pub const fn flush_on_commit(mut self, value: bool) -> Self {
        self.flush_on_commit = value;
        self
    }

    /// Sets the checkpoint interval; zero disables checkpointing.
    #[must_use]
    pub const fn checkpoint_interval(mut self, value: Duration) -> Self {
        self.checkpoint_interval = value;
        self
    }

    /// Sets the deadline sweep interval.
    #[must_use]
    pub const fn sweep_interval(mut self, value: Duration) -> Self {
        self.sweep_interval = value;
        self
    }

    /// Sets the shutdown drain deadline.
    #[must_use]
    pub const fn shutdown_timeout(mut self, value: Duration) -> Self {
        self.shutdown_timeout = value;
        self
    }
}

/// Committed store state.
#[derive(Debug, Default)]
struct Tables {
    objects: HashMap<ObjectId, Vec<u8>>,
    bindings: BTreeMap<String, ObjectId>,
    classes_by_desc: HashMap<Vec<u8>, ClassId>,
    classes_by_id: HashMap<ClassId, Vec<u8>>,
    next_class_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StoreState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Where checkpoint images live.
enum SnapshotSlot {
    /// On disk, under the store directory lock.
    File(StoreDir),
    /// In memory, for tests and non-persistent stores.
    Memory(Mutex<Vec<u8>>),
}

impl SnapshotSlot {
    fn read(&self) -> StoreResult<Option<Vec<u8>>> {
        match self {
            Self::File(dir) => dir.read_snapshot(),
            Self::Memory(slot) => {
                let data = slot.lock();
                Ok(if data.is_empty() {
                    None
                } else {
                    Some(data.clone())
                })
            }
        }
    }

    fn write(&self, bytes: &[u8]) -> StoreResult<()> {
        match self {
            Self::File(dir) => dir.write_snapshot(bytes),
            Self::Memory(slot) => {
                *slot.lock() = bytes.to_vec();
                Ok(())
            }
        }
    }
}

/// The default [`ObjectStore`] implementation.
///
/// Committed state lives in memory; durability comes from the write-ahead
/// log plus periodic checkpoint snapshots. Recovery replays the log over
/// the last snapshot, applying only transactions that reached their commit
/// record.
pub struct DataStore {
    config: StoreConfig,
    tables: RwLock<Tables>,
    txns: Mutex<HashMap<TxnId, Arc<TxnEntry>>>,
    /// Notified whenever a transaction finishes, for the shutdown drain.
    drained: Condvar,
    locks: LockManager,
    log: LogManager,
    snapshot: SnapshotSlot,
    /// Serializes prepare/commit/checkpoint so the log and tables move in
    /// step. Ordinary reads and lock acquisition do not take this.
    apply_lock: Mutex<()>,
    next_txn_id: AtomicU64,
    next_object_id: AtomicU64,
    state: Mutex<StoreState>,
    handles: Mutex<Vec<Box<dyn TaskHandle>>>,
}

impl DataStore {
    /// Opens (or creates) a persistent store in `path`.
    ///
    /// Recovers from the snapshot and log, then schedules the deadline
    /// sweep (and the checkpointer, when enabled) on `scheduler`.
    pub fn open(
        path: &Path,
        config: StoreConfig,
        scheduler: &dyn Scheduler,
    ) -> StoreResult<Arc<Self>> {
        let dir = StoreDir::open(path)?;
        let wal = FileBackend::open_with_create_dirs(&dir.wal_path())?;
        Self::open_with(config, Box::new(wal), SnapshotSlot::File(dir), scheduler)
    }

    /// Opens a fresh in-memory store. Contents are lost on drop.
    pub fn open_in_memory(config: StoreConfig) -> StoreResult<Arc<Self>> {
        Self::open_with(
            config,
            Box::new(MemoryBackend::new()),
            SnapshotSlot::Memory(Mutex::new(Vec::new())),
            &ThreadScheduler::new(),
        )
    }

    fn open_with(
        config: StoreConfig,
        wal_backend: Box<dyn StorageBackend>,
        snapshot: SnapshotSlot,
        scheduler: &dyn Scheduler,
    ) -> StoreResult<Arc<Self>> {
        let log = LogManager::new(wal_backend);
        let image = match snapshot.read()? {
            Some(bytes) => Some(StoreImage::decode(&bytes)?),
            None => None,
        };
        let (tables, next_object_id) = Self::recover(image, &log)?;
        info!(
            objects = tables.objects.len(),
            bindings = tables.bindings.len(),
            next_object_id,
            "store opened"
        );

        let sweep_interval = config.sweep_interval;
        let checkpoint_interval = config.checkpoint_interval;
        let store = Arc::new(Self {
            config,
            tables: RwLock::new(tables),
            txns: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
            locks: LockManager::new(),
            log,
            snapshot,
            apply_lock: Mutex::new(()),
            next_txn_id: AtomicU64::new(1),
            next_object_id: AtomicU64::new(next_object_id),
            state: Mutex::new(StoreState::Running),
            handles: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&store);
        let sweep_handle = scheduler.schedule_recurring(
            "deadline-sweep",
            sweep_interval,
            Box::new(move || {
                if let Some(store) = weak.upgrade() {
                    store.sweep();
                }
            }),
        );
        store.handles.lock().push(sweep_handle);

        if checkpoint_interval > Duration::ZERO {
            let weak = Arc::downgrade(&store);
            let handle = scheduler.schedule_recurring(
                "checkpoint",
                checkpoint_interval,
                Box::new(move || {
                    if let Some(store) = weak.upgrade() {
                        if let Err(err) = store.checkpoint() {
                            error!(%err, "checkpoint failed");
                        }
                    }
                }),
            );
            store.handles.lock().push(handle);
        }

        Ok(store)
    }

    /// Rebuilds the committed tables from a snapshot image and the log.
    fn recover(image: Option<StoreImage>, log: &LogManager) -> StoreResult<(Tables, u64)> {
        let image = image.unwrap_or_default();
        let mut next_object_id = image.next_object_id.max(1);
        let mut tables = Tables {
            objects: image.objects.into_iter().collect(),
            bindings: image.bindings,
            classes_by_desc: image
                .classes
                .iter()
                .map(|(class, desc)| (desc.clone(), *class))
                .collect(),
            next_class_id: image
                .classes
                .keys()
                .map(|c| c.as_u32() + 1)
                .max()
                .unwrap_or(1)
                .max(image.next_class_id.max(1)),
            classes_by_id: image.classes.into_iter().collect(),
        };

        let mut pending: HashMap<TxnId, Vec<LogRecord>> = HashMap::new();
        for record in log.replay()? {
            match record {
                LogRecord::Commit {
                    txn,
                    next_object_id: high_water,
                } => {
                    next_object_id = next_object_id.max(high_water);
                    if let Some(records) = pending.remove(&txn) {
                        for staged in records {
                            Self::apply_record(&mut tables, staged, &mut next_object_id);
                        }
                    }
                }
                LogRecord::Abort { txn } => {
                    pending.remove(&txn);
                }
                LogRecord::Prepare { .. } => {}
                other => pending.entry(other.txn()).or_default().push(other),
            }
        }
        if !pending.is_empty() {
            debug!(
                transactions = pending.len(),
                "discarding unresolved transactions from log replay"
            );
        }

        Ok((tables, next_object_id))
    }

    fn apply_record(tables: &mut Tables, record: LogRecord, next_object_id: &mut u64) {
        match record {
            LogRecord::Put { id, bytes, .. } => {
                *next_object_id = (*next_object_id).max(id.as_u64() + 1);
                tables.objects.insert(id, bytes);
            }
            LogRecord::Remove { id, .. } => {
                tables.objects.remove(&id);
            }
            LogRecord::SetBinding { name, id, .. } => {
                tables.bindings.insert(name, id);
            }
            LogRecord::RemoveBinding { name, .. } => {
                tables.bindings.remove(&name);
            }
            LogRecord::ClassDef {
                class, descriptor, ..
            } => {
                tables.next_class_id = tables.next_class_id.max(class.as_u32() + 1);
                tables.classes_by_desc.insert(descriptor.clone(), class);
                tables.classes_by_id.insert(class, descriptor);
            }
            LogRecord::Prepare { .. } | LogRecord::Commit { .. } | LogRecord::Abort { .. } => {}
        }
    }

    /// Writes a checkpoint: snapshot the committed tables, then reset the
    /// log to just the records of still-prepared transactions.
    pub fn checkpoint(&self) -> StoreResult<()> {
        let _apply = self.apply_lock.lock();

        // Prepared-but-undecided transactions have records in the log that
        // the reset would destroy; carry them over.
        let pending: Vec<LogRecord> = {
            let txns = self.txns.lock();
            let mut out = Vec::new();
            for entry in txns.values() {
                let body = entry.body.lock();
                if body.phase == (TxnPhase::Prepared { read_only: false }) {
                    out.extend(body.build_records(entry.id));
                    out.push(LogRecord::Prepare { txn: entry.id });
                }
            }
            out
        };

        let image = {
            let tables = self.tables.read();
            let mut image = StoreImage {
                next_object_id: self.next_object_id.load(Ordering::SeqCst),
                next_class_id: tables.next_class_id,
                ..StoreImage::default()
            };
            image.objects = tables
                .objects
                .iter()
                .map(|(id, bytes)| (*id, bytes.clone()))
                .collect();
            image.bindings = tables.bindings.clone();
            image.classes = tables
                .classes_by_id
                .iter()
                .map(|(class, desc)| (*class, desc.clone()))
                .collect();
            image
        };

        self.snapshot.write(&image.encode()?)?;
        self.log.reset(&pending)?;
        debug!(
            objects = image.objects.len(),
            carried = pending.len(),
            "checkpoint complete"
        );
        Ok(())
    }

    /// Dooms transactions whose deadline has passed.
    fn sweep(&self) {
        let now = Instant::now();
        let txns = self.txns.lock();
        for entry in txns.values() {
            if now >= entry.deadline {
                let body = entry.body.lock();
                if body.phase == TxnPhase::Active {
                    trace!(txn = %entry.id, "deadline passed; dooming transaction");
                    self.locks.doom(entry.id, DoomReason::Timeout);
                }
            }
        }
    }

    fn lookup(&self, txn: TxnId) -> StoreResult<Arc<TxnEntry>> {
        self.txns
            .lock()
            .get(&txn)
            .cloned()
            .ok_or(StoreError::TransactionNotActive { txn })
    }

    /// Looks up `txn` and verifies it can accept operations: present,
    /// not doomed, not past its deadline, and still in the active phase.
    fn active(&self, txn: TxnId) -> StoreResult<Arc<TxnEntry>> {
        let entry = self.lookup(txn)?;
        self.locks.check_doom(txn)?;
        if Instant::now() >= entry.deadline {
            self.locks.doom(txn, DoomReason::Timeout);
            return Err(StoreError::TransactionTimeout { txn });
        }
        {
            let body = entry.body.lock();
            if body.phase != TxnPhase::Active {
                return Err(StoreError::TransactionNotActive { txn });
            }
        }
        Ok(entry)
    }

    /// Ends a transaction: releases its locks and removes it from the
    /// registry, waking any shutdown drain.
    fn finish(&self, txn: TxnId) {
        self.locks.release_all(txn);
        let mut txns = self.txns.lock();
        txns.remove(&txn);
        self.drained.notify_all();
    }

    /// Computes the successor of `name` over the committed bindings merged
    /// with the transaction's staged changes.
    fn successor(tables: &Tables, body: &TxnBody, name: &str) -> Option<String> {
        let committed = tables
            .bindings
            .range::<str, _>((Bound::Excluded(name), Bound::Unbounded))
            .find(|(bound, _)| !matches!(body.bindings.get(*bound), Some(None)))
            .map(|(bound, _)| bound.clone());
        let staged = body
            .bindings
            .range::<str, _>((Bound::Excluded(name), Bound::Unbounded))
            .find(|(_, staged)| staged.is_some())
            .map(|(bound, _)| bound.clone());
        match (committed, staged) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        }
    }

    fn apply_body(tables: &mut Tables, body: &mut TxnBody) {
        for (class, descriptor) in body.classes.drain(..) {
            tables.next_class_id = tables.next_class_id.max(class.as_u32() + 1);
            tables.classes_by_desc.insert(descriptor.clone(), class);
            tables.classes_by_id.insert(class, descriptor);
        }
        for (id, staged) in body.objects.drain() {
            match staged {
                Some(bytes) => {
                    tables.objects.insert(id, bytes);
                }
                None => {
                    tables.objects.remove(&id);
                }
            }
        }
        while let Some((name, staged)) = body.bindings.pop_first() {
            match staged {
                Some(id) => {
                    tables.bindings.insert(name, id);
                }
                None => {
                    tables.bindings.remove(&name);
                }
            }
        }
    }
}

impl ObjectStore for DataStore {
    fn begin(&self, deadline: Instant) -> StoreResult<TxnId> {
        let state = self.state.lock();
        if *state != StoreState::Running {
            return Err(StoreError::ShuttingDown);
        }
        let txn = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        self.txns
            .lock()
            .insert(txn, Arc::new(TxnEntry::new(txn, deadline)));
        drop(state);
        trace!(%txn, "begin");
        Ok(txn)
    }

    fn allocate_id(&self, txn: TxnId) -> StoreResult<ObjectId> {
        self.active(txn)?;
        let raw = self.next_object_id.fetch_add(1, Ordering::SeqCst);
        let id = ObjectId::new(raw)
            .ok_or_else(|| StoreError::corrupt("object id counter wrapped to zero"))?;
        trace!(%txn, %id, "allocate_id");
        Ok(id)
    }

    fn get_object(&self, txn: TxnId, id: ObjectId, for_update: bool) -> StoreResult<Vec<u8>> {
        let entry = self.active(txn)?;
        let mode = if for_update {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        self.locks
            .acquire(txn, &LockKey::Object(id), mode, entry.deadline)?;

        let body = entry.body.lock();
        if let Some(staged) = body.objects.get(&id) {
            return staged
                .clone()
                .ok_or(StoreError::ObjectNotFound { id });
        }
        drop(body);

        let tables = self.tables.read();
        tables
            .objects
            .get(&id)
            .cloned()
            .ok_or(StoreError::ObjectNotFound { id })
    }

    fn put_object(&self, txn: TxnId, id: ObjectId, bytes: Vec<u8>) -> StoreResult<()> {
        let entry = self.active(txn)?;
        self.locks
            .acquire(txn, &LockKey::Object(id), LockMode::Exclusive, entry.deadline)?;
        entry.body.lock().objects.insert(id, Some(bytes));
        Ok(())
    }

    fn remove_object(&self, txn: TxnId, id: ObjectId) -> StoreResult<()> {
        let entry = self.active(txn)?;
        self.locks
            .acquire(txn, &LockKey::Object(id), LockMode::Exclusive, entry.deadline)?;

        let mut body = entry.body.lock();
        match body.objects.get(&id) {
            Some(Some(_)) => {
                body.objects.insert(id, None);
                Ok(())
            }
            Some(None) => Err(StoreError::ObjectNotFound { id }),
            None => {
                if self.tables.read().objects.contains_key(&id) {
                    body.objects.insert(id, None);
                    Ok(())
                } else {
                    Err(StoreError::ObjectNotFound { id })
                }
            }
        }
    }

    fn get_binding(&self, txn: TxnId, name: &str) -> StoreResult<ObjectId> {
        let entry = self.active(txn)?;
        self.locks.acquire(
            txn,
            &LockKey::Binding(name.to_string()),
            LockMode::Shared,
            entry.deadline,
        )?;

        let body = entry.body.lock();
        if let Some(staged) = body.bindings.get(name) {
            return staged.ok_or_else(|| StoreError::NameNotBound {
                name: name.to_string(),
            });
        }
        drop(body);

        self.tables
            .read()
            .bindings
            .get(name)
            .copied()
            .ok_or_else(|| StoreError::NameNotBound {
                name: name.to_string(),
            })
    }

    fn set_binding(&self, txn: TxnId, name: &str, id: ObjectId) -> StoreResult<()> {
        let entry = self.active(txn)?;
        self.locks.acquire(
            txn,
            &LockKey::Binding(name.to_string()),
            LockMode::Exclusive,
            entry.deadline,
        )?;
        entry
            .body
            .lock()
            .bindings
            .insert(name.to_string(), Some(id));
        Ok(())
    }

    fn remove_binding(&self, txn: TxnId, name: &str) -> StoreResult<()> {
        let entry = self.active(txn)?;
        self.locks.acquire(
            txn,
            &LockKey::Binding(name.to_string()),
            LockMode::Exclusive,
            entry.deadline,
        )?;

        let mut body = entry.body.lock();
        match body.bindings.get(name) {
            Some(Some(_)) => {
                body.bindings.insert(name.to_string(), None);
                Ok(())
            }
            Some(None) => Err(StoreError::NameNotBound {
                name: name.to_string(),
            }),
            None => {
                if self.tables.read().bindings.contains_key(name) {
                    body.bindings.insert(name.to_string(), None);
                    Ok(())
                } else {
                    Err(StoreError::NameNotBound {
                        name: name.to_string(),
                    })
                }
            }
        }
    }

    fn next_bound_name(&self, txn: TxnId, name: &str) -> StoreResult<Option<String>> {
        let entry = self.active(txn)?;
        loop {
            let candidate = {
                let body = entry.body.lock();
                let tables = self.tables.read();
                Self::successor(&tables, &body, name)
            };
            let Some(candidate) = candidate else {
                return Ok(None);
            };
            // Lock the successor, then confirm it still is the successor;
            // a commit may have slipped in while we blocked.
            self.locks.acquire(
                txn,
                &LockKey::Binding(candidate.clone()),
                LockMode::Shared,
                entry.deadline,
            )?;
            let confirmed = {
                let body = entry.body.lock();
                let tables = self.tables.read();
                Self::successor(&tables, &body, name)
            };
            if confirmed.as_deref() == Some(candidate.as_str()) {
                return Ok(Some(candidate));
            }
        }
    }

    fn get_class_id(&self, txn: TxnId, descriptor: &[u8]) -> StoreResult<ClassId> {
        let entry = self.active(txn)?;
        {
            let body = entry.body.lock();
            if let Some((class, _)) = body.classes.iter().find(|(_, d)| d == descriptor) {
                return Ok(*class);
            }
        }

        self.locks
            .acquire(txn, &LockKey::ClassTable, LockMode::Shared, entry.deadline)?;
        if let Some(class) = self.tables.read().classes_by_desc.get(descriptor) {
            return Ok(*class);
        }

        // First encounter: upgrade and assign the next ID. The exclusive
        // class-table lock is held to end of transaction, so the ID stands
        // iff this transaction commits.
        self.locks.acquire(
            txn,
            &LockKey::ClassTable,
            LockMode::Exclusive,
            entry.deadline,
        )?;
        let mut body = entry.body.lock();
        let next = self.tables.read().next_class_id + u32::try_from(body.classes.len())
            .map_err(|_| StoreError::corrupt("class table overflow"))?;
        let class = ClassId::new(next);
        body.classes.push((class, descriptor.to_vec()));
        debug!(%txn, %class, "assigned class id");
        Ok(class)
    }

    fn get_class_descriptor(&self, txn: TxnId, class: ClassId) -> StoreResult<Vec<u8>> {
        let entry = self.active(txn)?;
        {
            let body = entry.body.lock();
            if let Some((_, descriptor)) = body.classes.iter().find(|(c, _)| *c == class) {
                return Ok(descriptor.clone());
            }
        }
        self.locks
            .acquire(txn, &LockKey::ClassTable, LockMode::Shared, entry.deadline)?;
        self.tables
            .read()
            .classes_by_id
            .get(&class)
            .cloned()
            .ok_or(StoreError::UnknownClass { id: class })
    }

    fn prepare(&self, txn: TxnId) -> StoreResult<Vote> {
        let entry = self.active(txn)?;
        let _apply = self.apply_lock.lock();
        let mut body = entry.body.lock();
        if body.phase != TxnPhase::Active {
            return Err(StoreError::TransactionNotActive { txn });
        }
        if !body.has_writes() {
            body.phase = TxnPhase::Prepared { read_only: true };
            trace!(%txn, "prepare: read-only");
            return Ok(Vote::ReadOnly);
        }
        let mut records = body.build_records(txn);
        records.push(LogRecord::Prepare { txn });
        self.log.append_all(&records, true)?;
        body.phase = TxnPhase::Prepared { read_only: false };
        debug!(%txn, records = records.len(), "prepared");
        Ok(Vote::Prepared)
    }

    fn commit(&self, txn: TxnId) -> StoreResult<()> {
        let entry = self.lookup(txn)?;
        let _apply = self.apply_lock.lock();
        let mut body = entry.body.lock();
        match body.phase {
            TxnPhase::Active => {
                return Err(StoreError::invalid_argument(
                    "commit called before prepare",
                ))
            }
            TxnPhase::Prepared { read_only: true } => {}
            TxnPhase::Prepared { read_only: false } => {
                self.log.append(
                    &LogRecord::Commit {
                        txn,
                        next_object_id: self.next_object_id.load(Ordering::SeqCst),
                    },
                    self.config.flush_on_commit,
                )?;
                let mut tables = self.tables.write();
                Self::apply_body(&mut tables, &mut body);
            }
        }
        drop(body);
        drop(_apply);
        self.finish(txn);
        debug!(%txn, "committed");
        Ok(())
    }

    fn abort(&self, txn: TxnId) -> StoreResult<()> {
        let entry = self.lookup(txn)?;
        {
            let _apply = self.apply_lock.lock();
            let body = entry.body.lock();
            if body.phase == (TxnPhase::Prepared { read_only: false }) {
                self.log.append(&LogRecord::Abort { txn }, true)?;
            }
        }
        self.finish(txn);
        debug!(%txn, "aborted");
        Ok(())
    }

    fn shutdown(&self) -> StoreResult<bool> {
        {
            let mut state = self.state.lock();
            match *state {
                StoreState::Shutdown => return Err(StoreError::AlreadyShutDown),
                StoreState::ShuttingDown => return Err(StoreError::ShuttingDown),
                StoreState::Running => *state = StoreState::ShuttingDown,
            }
        }
        info!("store shutting down; draining transactions");

        let deadline = Instant::now() + self.config.shutdown_timeout;
        {
            let mut txns = self.txns.lock();
            while !txns.is_empty() {
                if self.drained.wait_until(&mut txns, deadline).timed_out() {
                    warn!(
                        remaining = txns.len(),
                        "shutdown drain timed out; store stays running"
                    );
                    drop(txns);
                    *self.state.lock() = StoreState::Running;
                    return Ok(false);
                }
            }
        }

        for handle in self.handles.lock().drain(..) {
            handle.cancel();
        }
        self.log.flush()?;
        *self.state.lock() = StoreState::Shutdown;
        info!("store shut down");
        Ok(true)
    }
}
