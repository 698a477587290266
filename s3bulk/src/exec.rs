//! Bounded parallel task execution.
//!
//! One [`WorkerPool`] is built in `main` and handed to every command. Leaf
//! tasks (single-object transfers, batch sub-commands' object work) take a
//! slot from the pool before running, so at most `workers` of them execute
//! concurrently across the whole process. Composite tasks — a batch line
//! executing a full sub-command, which itself schedules leaf tasks — run
//! unslotted so a waiting parent can never starve its own children.
//!
//! A [`Waiter`] is created per command invocation: it counts submitted tasks,
//! collects their errors, and optionally cancels a token on the first
//! failure (`exit-on-error`).

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::JobError;

pub const DEFAULT_WORKER_COUNT: usize = 256;

#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Schedules a leaf task. The task waits for a pool slot, runs, and
    /// reports its result to the waiter. Panics become job errors.
    pub fn run<F>(&self, waiter: &Waiter, task: F)
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let inner = waiter.register();
        tokio::spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .expect("pool semaphore never closes");
            let result = match tokio::spawn(task).await {
                Ok(result) => result,
                Err(join_err) => Err(JobError::new(
                    "task",
                    crate::error::Error::Other(anyhow::anyhow!(
                        "task panicked: {join_err}"
                    )),
                )),
            };
            inner.complete(result);
        });
    }

    /// Schedules a composite task that holds no pool slot while it runs.
    pub fn run_composite<F>(&self, waiter: &Waiter, task: F)
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let inner = waiter.register();
        tokio::spawn(async move {
            let result = match tokio::spawn(task).await {
                Ok(result) => result,
                Err(join_err) => Err(JobError::new(
                    "task",
                    crate::error::Error::Other(anyhow::anyhow!(
                        "task panicked: {join_err}"
                    )),
                )),
            };
            inner.complete(result);
        });
    }
}

#[derive(Default)]
struct WaiterState {
    outstanding: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    errors: Mutex<Vec<JobError>>,
    notify: Notify,
    cancel_on_error: Mutex<Option<CancellationToken>>,
}

/// Per-invocation completion tracker.
#[derive(Clone, Default)]
pub struct Waiter {
    state: Arc<WaiterState>,
}

pub struct WaitSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel `token` as soon as any task fails.
    pub fn cancel_on_error(&self, token: CancellationToken) {
        *self.state.cancel_on_error.lock().expect("waiter lock") = Some(token);
    }

    fn register(&self) -> WaiterHandle {
        self.state.outstanding.fetch_add(1, Ordering::SeqCst);
        WaiterHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Records a failure that happened outside any scheduled task, e.g. a
    /// source that expanded to nothing.
    pub fn record_error(&self, err: JobError) {
        let handle = self.register();
        handle.complete(Err(err));
    }

    /// Resolves when every task submitted through this waiter has finished.
    pub async fn wait(&self) -> WaitSummary {
        loop {
            let notified = self.state.notify.notified();
            if self.state.outstanding.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        WaitSummary {
            succeeded: self.state.succeeded.load(Ordering::SeqCst),
            failed: self.state.failed.load(Ordering::SeqCst),
        }
    }

    /// Drains collected errors. Cancellations are counted as completed, not
    /// failed, and are not reported here.
    pub fn take_errors(&self) -> Vec<JobError> {
        std::mem::take(&mut *self.state.errors.lock().expect("waiter lock"))
    }
}

struct WaiterHandle {
    state: Arc<WaiterState>,
}

impl WaiterHandle {
    fn complete(self, result: Result<(), JobError>) {
        match result {
            Ok(()) => {
                self.state.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) if err.is_cancellation() => {
                self.state.succeeded.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => {
                self.state.failed.fetch_add(1, Ordering::SeqCst);
                if let Some(token) = &*self
                    .state
                    .cancel_on_error
                    .lock()
                    .expect("waiter lock")
                {
                    token.cancel();
                }
                self.state
                    .errors
                    .lock()
                    .expect("waiter lock")
                    .push(err);
            }
        }
        self.state.outstanding.fetch_sub(1, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn waits_for_all_tasks() {
        let pool = WorkerPool::new(4);
        let waiter = Waiter::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let counter = Arc::clone(&counter);
            pool.run(&waiter, async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        let summary = waiter.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(summary.succeeded, 20);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn collects_errors_without_cancelling_siblings() {
        let pool = WorkerPool::new(2);
        let waiter = Waiter::new();
        for i in 0..6 {
            pool.run(&waiter, async move {
                if i % 2 == 0 {
                    Err(JobError::new("op", Error::Usage(format!("fail {i}"))))
                } else {
                    Ok(())
                }
            });
        }
        let summary = waiter.wait().await;
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(waiter.take_errors().len(), 3);
    }

    #[tokio::test]
    async fn panics_become_errors() {
        let pool = WorkerPool::new(1);
        let waiter = Waiter::new();
        pool.run(&waiter, async { panic!("boom") });
        let summary = waiter.wait().await;
        assert_eq!(summary.failed, 1);
        let errors = waiter.take_errors();
        assert!(errors[0].to_string().contains("panicked"));
    }

    #[tokio::test]
    async fn cancellations_do_not_fail_the_command() {
        let pool = WorkerPool::new(1);
        let waiter = Waiter::new();
        pool.run(&waiter, async {
            Err(JobError::new(
                "op",
                Error::Storage(storage::StorageError::Cancelled),
            ))
        });
        let summary = waiter.wait().await;
        assert_eq!(summary.failed, 0);
        assert!(waiter.take_errors().is_empty());
    }

    #[tokio::test]
    async fn first_error_cancels_token_when_opted_in() {
        let pool = WorkerPool::new(2);
        let waiter = Waiter::new();
        let token = CancellationToken::new();
        waiter.cancel_on_error(token.clone());
        pool.run(&waiter, async {
            Err(JobError::new("op", Error::Usage("fail".to_string())))
        });
        waiter.wait().await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn composite_tasks_do_not_hold_slots() {
        // A single-slot pool: the composite parent waits for its leaf child,
        // which needs the slot. This only terminates if the parent runs
        // unslotted.
        let pool = WorkerPool::new(1);
        let waiter = Waiter::new();
        let inner_pool = pool.clone();
        pool.run_composite(&waiter, async move {
            let child_waiter = Waiter::new();
            inner_pool.run(&child_waiter, async { Ok(()) });
            let summary = child_waiter.wait().await;
            assert_eq!(summary.succeeded, 1);
            Ok(())
        });
        let summary = waiter.wait().await;
        assert_eq!(summary.failed, 0);
    }
}
