//! Bounded pool for CPU-bound grammar work.
//!
//! Jobs run on Tokio's blocking threads; a semaphore caps how many run at
//! once. The permit travels into the job, so a job whose caller stopped
//! waiting still occupies its slot until it actually returns.

use std::sync::Arc;
use std::time::Duration;

use larkline_grammar::Budget;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::LiveError;

#[derive(Debug)]
pub enum WorkOutcome<T> {
    Done(T),
    /// The wall-clock limit passed; the job's budget has been cancelled.
    TimedOut,
    /// The job panicked; carries the panic description.
    Panicked(String),
    /// The caller withdrew the job; its budget has been cancelled.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        WorkerPool {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs currently holding a permit.
    pub fn busy(&self) -> usize {
        self.size.saturating_sub(self.permits.available_permits())
    }

    /// Run `job` with a hard limit covering both queueing and execution.
    ///
    /// `budget` is handed to the job and cancelled when the limit passes, so
    /// cooperative jobs stop soon after the caller has moved on.
    pub async fn run<T, F>(&self, limit: Duration, budget: Budget, job: F) -> Result<WorkOutcome<T>, LiveError>
    where
        T: Send + 'static,
        F: FnOnce(&Budget) -> T + Send + 'static,
    {
        self.run_cancellable(limit, budget, &CancellationToken::new(), job)
            .await
    }

    /// Like [`WorkerPool::run`], but `cancel` also ends the wait. A job that
    /// already started has its budget cancelled and gives up its permit at
    /// the next budget check.
    pub async fn run_cancellable<T, F>(
        &self,
        limit: Duration,
        budget: Budget,
        cancel: &CancellationToken,
        job: F,
    ) -> Result<WorkOutcome<T>, LiveError>
    where
        T: Send + 'static,
        F: FnOnce(&Budget) -> T + Send + 'static,
    {
        let deadline = Instant::now() + limit;

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            acquired = tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned()) => Some(acquired),
        };
        let permit = match acquired {
            None => {
                budget.cancel();
                return Ok(WorkOutcome::Cancelled);
            }
            Some(Ok(Ok(permit))) => permit,
            Some(Ok(Err(_))) => return Err(LiveError::WorkerPoolClosed),
            Some(Err(_)) => {
                budget.cancel();
                return Ok(WorkOutcome::TimedOut);
            }
        };

        let job_budget = budget.clone();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            job(&job_budget)
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                budget.cancel();
                Ok(WorkOutcome::Cancelled)
            }
            joined = tokio::time::timeout_at(deadline, handle) => match joined {
                Ok(Ok(value)) => Ok(WorkOutcome::Done(value)),
                Ok(Err(join)) => Ok(WorkOutcome::Panicked(join.to_string())),
                Err(_) => {
                    budget.cancel();
                    Ok(WorkOutcome::TimedOut)
                }
            },
        }
    }

    /// Refuse new jobs. Jobs already running are not interrupted.
    pub fn close(&self) {
        self.permits.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn returns_job_value() {
        let pool = WorkerPool::new(2);
        let outcome = pool
            .run(Duration::from_secs(5), Budget::unlimited(), |_| 21 * 2)
            .await
            .unwrap();
        assert!(matches!(outcome, WorkOutcome::Done(42)));
    }

    #[tokio::test]
    async fn timeout_cancels_the_budget() {
        let pool = WorkerPool::new(1);
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let outcome = pool
            .run(Duration::from_millis(50), Budget::unlimited(), move |budget| {
                while !budget.is_exhausted() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                flag.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert!(matches!(outcome, WorkOutcome::TimedOut));

        // The abandoned job notices the cancellation and releases its permit.
        for _ in 0..100 {
            if stopped.load(Ordering::SeqCst) && pool.busy() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(stopped.load(Ordering::SeqCst));
        assert_eq!(pool.busy(), 0);
    }

    #[tokio::test]
    async fn cancelling_frees_the_slot_for_other_work() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let outcome = pool
            .run_cancellable(Duration::from_secs(10), Budget::unlimited(), &cancel, |budget| {
                while !budget.is_exhausted() {
                    std::thread::sleep(Duration::from_millis(2));
                }
            })
            .await
            .unwrap();
        assert!(matches!(outcome, WorkOutcome::Cancelled));

        // The single permit comes back long before the ten second limit.
        let next = pool
            .run(Duration::from_secs(10), Budget::unlimited(), |_| "next")
            .await
            .unwrap();
        assert!(matches!(next, WorkOutcome::Done("next")));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cancelled_before_start_never_runs() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let outcome = pool
            .run_cancellable(Duration::from_secs(1), Budget::unlimited(), &cancel, move |_| {
                flag.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert!(matches!(outcome, WorkOutcome::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn panics_are_reported() {
        let pool = WorkerPool::new(1);
        let outcome: WorkOutcome<()> = pool
            .run(Duration::from_secs(5), Budget::unlimited(), |_| panic!("boom"))
            .await
            .unwrap();
        assert!(matches!(outcome, WorkOutcome::Panicked(_)));
    }

    #[tokio::test]
    async fn closed_pool_rejects_work() {
        let pool = WorkerPool::new(1);
        pool.close();
        let err = pool
            .run(Duration::from_secs(1), Budget::unlimited(), |_| ())
            .await
            .unwrap_err();
        assert_eq!(err, LiveError::WorkerPoolClosed);
    }
}
