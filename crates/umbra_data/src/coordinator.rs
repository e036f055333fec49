//! Transaction coordination: service lifecycle, participant registration,
//! two-phase commit, and the retry envelope.
//!
//! Each application task runs inside [`Coordinator::run`]: a fresh store
//! transaction is begun, a transaction slot is installed on the calling
//! thread (this is what lets references resolve without threading a
//! context argument through application code), the task body runs, and the
//! coordinator drives prepare/commit across every participant that joined.
//! A retryable failure discards the transaction and re-runs the task until
//! the wall-clock budget or the attempt cap is exhausted.

use crate::context::Context;
use crate::error::{DataError, DataResult};
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, trace};
use umbra_store::{ObjectStore, TxnId, Vote};

/// A party to two-phase commit.
///
/// Participants are driven in registration order: `prepare` across all,
/// then `commit` on those that voted [`Vote::Prepared`]. A participant
/// that votes [`Vote::ReadOnly`] has no writes and is skipped at commit.
/// If any prepare fails, every participant is aborted and the error is
/// re-raised. `abort` must be infallible; participants log their own
/// trouble.
pub trait Participant: Send + Sync {
    /// Diagnostic name of the participant.
    fn name(&self) -> &str;

    /// First phase: flush state, acquire final locks, vote.
    fn prepare(&self) -> DataResult<Vote>;

    /// Second phase: make the prepared state durable.
    fn commit(&self) -> DataResult<()>;

    /// Discard state and release resources.
    fn abort(&self);
}

/// Lifecycle state of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServiceState {
    /// Construction has not completed.
    Uninitialized,
    /// Accepting everything.
    Running,
    /// Only transactions that already joined may proceed.
    ShuttingDown,
    /// Rejecting everything.
    Shutdown,
}

/// Per-transaction slot installed on the executing thread.
pub(crate) struct TxnSlot {
    pub txn: TxnId,
    /// The data service context, once the transaction joins.
    pub context: Mutex<Option<Arc<Context>>>,
    /// Participants in registration order.
    pub participants: Mutex<Vec<Arc<dyn Participant>>>,
}

impl TxnSlot {
    fn new(txn: TxnId) -> Self {
        Self {
            txn,
            context: Mutex::new(None),
            participants: Mutex::new(Vec::new()),
        }
    }
}

thread_local! {
    static CURRENT_SLOT: RefCell<Option<Arc<TxnSlot>>> = const { RefCell::new(None) };
}

/// The slot of the transaction running on this thread, if any.
pub(crate) fn current_slot() -> Option<Arc<TxnSlot>> {
    CURRENT_SLOT.with(|slot| slot.borrow().clone())
}

/// The context of the transaction running on this thread.
///
/// Does not join: a transaction that has not touched the data service has
/// no context, and resolving a reference in it fails
/// [`DataError::TransactionNotActive`].
pub(crate) fn current_context() -> DataResult<Arc<Context>> {
    current_slot()
        .and_then(|slot| slot.context.lock().clone())
        .ok_or(DataError::TransactionNotActive)
}

/// Installs a slot on the current thread, restoring the previous one on
/// drop.
struct SlotGuard {
    previous: Option<Arc<TxnSlot>>,
}

impl SlotGuard {
    fn install(slot: Arc<TxnSlot>) -> Self {
        let previous = CURRENT_SLOT.with(|current| current.borrow_mut().replace(slot));
        Self { previous }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_SLOT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Binds contexts to transactions and drives two-phase commit.
pub(crate) struct Coordinator {
    store: Arc<dyn ObjectStore>,
    txn_timeout: Duration,
    retry_timeout: Duration,
    max_retries: u32,
    shutdown_timeout: Duration,
    state: Mutex<ServiceState>,
    state_changed: Condvar,
    /// Tasks currently inside the retry envelope.
    active: Mutex<usize>,
    drained: Condvar,
    /// Process-wide transaction → context map. Lookup and insertion are
    /// atomic under the slot's context mutex plus this map's own.
    contexts: Mutex<HashMap<TxnId, Arc<Context>>>,
    /// Transactions that were discarded and re-run.
    retries: AtomicU64,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        txn_timeout: Duration,
        retry_timeout: Duration,
        max_retries: u32,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            store,
            txn_timeout,
            retry_timeout,
            max_retries,
            shutdown_timeout,
            state: Mutex::new(ServiceState::Uninitialized),
            state_changed: Condvar::new(),
            active: Mutex::new(0),
            drained: Condvar::new(),
            contexts: Mutex::new(HashMap::new()),
            retries: AtomicU64::new(0),
        }
    }

    /// Marks construction complete.
    pub fn set_running(&self) {
        let mut state = self.state.lock();
        if *state == ServiceState::Uninitialized {
            *state = ServiceState::Running;
        }
    }

    /// Number of transactions that were discarded and retried.
    pub fn retry_count(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// State check for starting a new transaction or joining one.
    fn check_new_work(state: ServiceState) -> DataResult<()> {
        match state {
            ServiceState::Running => Ok(()),
            ServiceState::Uninitialized => Err(DataError::ServiceNotReady),
            ServiceState::ShuttingDown => Err(DataError::ServiceShuttingDown),
            ServiceState::Shutdown => Err(DataError::ServiceShutDown),
        }
    }

    /// State check for operations of an already-joined transaction.
    fn check_joined_work(state: ServiceState) -> DataResult<()> {
        match state {
            ServiceState::Running | ServiceState::ShuttingDown => Ok(()),
            ServiceState::Uninitialized => Err(DataError::ServiceNotReady),
            ServiceState::Shutdown => Err(DataError::ServiceShutDown),
        }
    }

    /// Runs `task` under a transaction, retrying on retryable aborts.
    pub fn run<F, R>(&self, mut task: F) -> DataResult<R>
    where
        F: FnMut() -> DataResult<R>,
    {
        {
            // Holding the state lock across the increment pins the state:
            // once shutdown flips it, no new task can slip past the drain.
            let state = self.state.lock();
            Self::check_new_work(*state)?;
            *self.active.lock() += 1;
        }
        let result = self.run_attempts(&mut task);
        {
            let mut active = self.active.lock();
            *active -= 1;
            if *active == 0 {
                self.drained.notify_all();
            }
        }
        result
    }

    fn run_attempts<F, R>(&self, task: &mut F) -> DataResult<R>
    where
        F: FnMut() -> DataResult<R>,
    {
        let budget_end = Instant::now() + self.retry_timeout;
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let txn = self.store.begin(Instant::now() + self.txn_timeout)?;
            let slot = Arc::new(TxnSlot::new(txn));
            let guard = SlotGuard::install(Arc::clone(&slot));
            let outcome = task();
            let settled = match outcome {
                Ok(value) => self.complete(&slot).map(|()| value),
                Err(err) => {
                    self.abort_slot(&slot);
                    Err(err)
                }
            };
            drop(guard);
            self.contexts.lock().remove(&txn);

            match settled {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if attempts >= self.max_retries || Instant::now() >= budget_end {
                        debug!(attempts, %err, "retry budget exhausted");
                        return Err(DataError::TransactionAborted { attempts });
                    }
                    self.retries.fetch_add(1, Ordering::Relaxed);
                    trace!(attempts, %err, "transaction aborted; retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Drives two-phase commit across the slot's participants.
    fn complete(&self, slot: &TxnSlot) -> DataResult<()> {
        let participants = slot.participants.lock().clone();
        if participants.is_empty() {
            // The task never touched a participant; discard the store
            // transaction that backed it.
            if let Err(err) = self.store.abort(slot.txn) {
                trace!(txn = %slot.txn, %err, "discarding untouched transaction");
            }
            return Ok(());
        }

        let mut votes = Vec::with_capacity(participants.len());
        for participant in &participants {
            match participant.prepare() {
                Ok(vote) => votes.push(vote),
                Err(err) => {
                    debug!(
                        participant = participant.name(),
                        %err,
                        "prepare failed; aborting all participants"
                    );
                    for participant in &participants {
                        participant.abort();
                    }
                    return Err(err);
                }
            }
        }

        for (participant, vote) in participants.iter().zip(&votes) {
            if *vote == Vote::Prepared {
                if let Err(err) = participant.commit() {
                    error!(
                        participant = participant.name(),
                        %err,
                        "commit failed after successful prepare"
                    );
                    return Err(err);
                }
            }
        }

        // External participants without a data service context leave the
        // backing store transaction dangling; discard it.
        if slot.context.lock().is_none() {
            let _ = self.store.abort(slot.txn);
        }
        Ok(())
    }

    fn abort_slot(&self, slot: &TxnSlot) {
        let participants = slot.participants.lock().clone();
        if participants.is_empty() {
            if let Err(err) = self.store.abort(slot.txn) {
                trace!(txn = %slot.txn, %err, "discarding untouched transaction");
            }
            return;
        }
        for participant in &participants {
            participant.abort();
        }
        if slot.context.lock().is_none() {
            let _ = self.store.abort(slot.txn);
        }
    }

    /// Returns the current transaction's context, creating and registering
    /// it on first use.
    ///
    /// A join arriving while the service is shutting down is rejected;
    /// operations of transactions that joined earlier are still served.
    pub fn join(&self, make: impl FnOnce(TxnId) -> Context) -> DataResult<Arc<Context>> {
        let slot = current_slot().ok_or(DataError::TransactionNotActive)?;
        let mut context_slot = slot.context.lock();
        if let Some(context) = context_slot.as_ref() {
            Self::check_joined_work(*self.state.lock())?;
            return Ok(Arc::clone(context));
        }

        Self::check_new_work(*self.state.lock())?;
        let context = Arc::new(make(slot.txn));
        self.contexts.lock().insert(slot.txn, Arc::clone(&context));
        slot.participants
            .lock()
            .push(Arc::clone(&context) as Arc<dyn Participant>);
        *context_slot = Some(Arc::clone(&context));
        trace!(txn = %slot.txn, "transaction joined the data service");
        Ok(context)
    }

    /// Registers an external participant with the current transaction.
    pub fn join_participant(&self, participant: Arc<dyn Participant>) -> DataResult<()> {
        let slot = current_slot().ok_or(DataError::TransactionNotActive)?;
        Self::check_new_work(*self.state.lock())?;
        debug!(txn = %slot.txn, participant = participant.name(), "participant joined");
        slot.participants.lock().push(participant);
        Ok(())
    }

    /// Shuts the service down.
    ///
    /// Waits for active tasks to drain, then shuts the store down. Returns
    /// `Ok(false)`, with the state reverted to running, if either drain
    /// times out. Concurrent callers wait for the in-flight attempt and
    /// then observe its outcome.
    pub fn shutdown(&self) -> DataResult<bool> {
        {
            let mut state = self.state.lock();
            loop {
                match *state {
                    ServiceState::ShuttingDown => self.state_changed.wait(&mut state),
                    ServiceState::Shutdown => return Err(DataError::AlreadyShutDown),
                    ServiceState::Uninitialized => return Err(DataError::ServiceNotReady),
                    ServiceState::Running => {
                        *state = ServiceState::ShuttingDown;
                        break;
                    }
                }
            }
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        {
            let mut active = self.active.lock();
            while *active > 0 {
                if self.drained.wait_until(&mut active, deadline).timed_out() {
                    debug!(active = *active, "shutdown drain timed out");
                    drop(active);
                    self.revert_to_running();
                    return Ok(false);
                }
            }
        }

        match self.store.shutdown() {
            Ok(true) => {
                let mut state = self.state.lock();
                *state = ServiceState::Shutdown;
                self.state_changed.notify_all();
                Ok(true)
            }
            Ok(false) => {
                self.revert_to_running();
                Ok(false)
            }
            Err(err) => {
                self.revert_to_running();
                Err(err.into())
            }
        }
    }

    fn revert_to_running(&self) {
        let mut state = self.state.lock();
        *state = ServiceState::Running;
        self.state_changed.notify_all();
    }
}
