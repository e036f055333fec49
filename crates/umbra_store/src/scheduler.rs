//! Recurring background task contract.
//!
//! The store publishes the work it needs done periodically (deadline
//! sweeps, checkpoints) through [`Scheduler::schedule_recurring`] and
//! expects the host to invoke the task roughly every period. Hosts embed
//! the store into their own task infrastructure by implementing
//! [`Scheduler`]; [`ThreadScheduler`] is the default standalone host.

use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Handle to a scheduled recurring task.
pub trait TaskHandle: Send {
    /// Cancels the task. Runs already in progress complete; no further runs
    /// are started.
    fn cancel(&self);
}

/// Host contract for running the store's recurring background tasks.
pub trait Scheduler: Send + Sync {
    /// Schedules `task` to run roughly every `period`.
    ///
    /// The first run happens one period after scheduling. `name` is used
    /// for diagnostics (thread names, logs).
    fn schedule_recurring(
        &self,
        name: &str,
        period: Duration,
        task: Box<dyn Fn() + Send + Sync>,
    ) -> Box<dyn TaskHandle>;
}

struct CancelFlag {
    cancelled: Mutex<bool>,
    changed: Condvar,
}

/// Handle for [`ThreadScheduler`] tasks.
struct ThreadTaskHandle {
    flag: Arc<CancelFlag>,
}

impl TaskHandle for ThreadTaskHandle {
    fn cancel(&self) {
        let mut cancelled = self.flag.cancelled.lock();
        *cancelled = true;
        self.flag.changed.notify_all();
    }
}

impl Drop for ThreadTaskHandle {
    fn drop(&mut self) {
        // Dropping the handle cancels the task, so a store that is dropped
        // without a clean shutdown does not leak its worker thread.
        self.cancel();
    }
}

/// Default scheduler: one worker thread per recurring task.
///
/// The worker sleeps on a condvar so cancellation takes effect without
/// waiting out the period. A panicking task is caught and logged; the
/// schedule keeps running.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadScheduler;

impl ThreadScheduler {
    /// Creates a thread scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule_recurring(
        &self,
        name: &str,
        period: Duration,
        task: Box<dyn Fn() + Send + Sync>,
    ) -> Box<dyn TaskHandle> {
        let flag = Arc::new(CancelFlag {
            cancelled: Mutex::new(false),
            changed: Condvar::new(),
        });
        let worker_flag = Arc::clone(&flag);
        let thread_name = format!("umbra-{name}");
        let spawn_result = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || loop {
                {
                    let mut cancelled = worker_flag.cancelled.lock();
                    if *cancelled {
                        return;
                    }
                    worker_flag.changed.wait_for(&mut cancelled, period);
                    if *cancelled {
                        return;
                    }
                }
                if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                    error!(task = %thread_name, "recurring task panicked");
                }
            });
        if let Err(err) = spawn_result {
            // Thread limits are an environment problem; surface it loudly
            // and hand back a handle that has nothing to cancel.
            error!(task = name, %err, "failed to spawn recurring task thread");
        }
        Box::new(ThreadTaskHandle { flag })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn task_runs_repeatedly() {
        let scheduler = ThreadScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = scheduler.schedule_recurring(
            "test-tick",
            Duration::from_millis(5),
            Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );
        std::thread::sleep(Duration::from_millis(60));
        handle.cancel();
        assert!(count.load(Ordering::Relaxed) >= 2);
    }

    #[test]
    fn cancel_stops_runs() {
        let scheduler = ThreadScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = scheduler.schedule_recurring(
            "test-cancel",
            Duration::from_millis(5),
            Box::new(move || {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );
        std::thread::sleep(Duration::from_millis(30));
        handle.cancel();
        let after_cancel = count.load(Ordering::Relaxed);
        std::thread::sleep(Duration::from_millis(30));
        assert!(count.load(Ordering::Relaxed) <= after_cancel + 1);
    }

    #[test]
    fn panicking_task_keeps_schedule_alive() {
        let scheduler = ThreadScheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = scheduler.schedule_recurring(
            "test-panic",
            Duration::from_millis(5),
            Box::new(move || {
                if c.fetch_add(1, Ordering::Relaxed) == 0 {
                    panic!("first run fails");
                }
            }),
        );
        std::thread::sleep(Duration::from_millis(60));
        handle.cancel();
        assert!(count.load(Ordering::Relaxed) >= 2);
    }
}
