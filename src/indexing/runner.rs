//! Wall-clock bounded task execution
//!
//! Batch schedulers kill jobs that overrun their allocation. The runner
//! stops a task slightly before that happens so the failure is logged and
//! partial output is cleaned up instead of being left behind.

use anyhow::anyhow;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::Result;

/// Wait this long for an aborted task before warning that it is still busy
const ABORT_GRACE: Duration = Duration::from_secs(5);

/// Cooperative cancellation signal shared with a running task
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Total allocation and the part of it kept back for cleanup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget {
    pub total: Duration,
    pub safety_margin: Duration,
}

impl TimeBudget {
    pub fn new(total: Duration, safety_margin: Duration) -> Self {
        Self {
            total,
            safety_margin,
        }
    }

    /// Time the task may actually run
    pub fn effective(&self) -> Duration {
        self.total.saturating_sub(self.safety_margin)
    }
}

impl Default for TimeBudget {
    fn default() -> Self {
        Self::new(Duration::from_secs(9 * 3600), Duration::from_secs(120))
    }
}

/// How a bounded task ended
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    /// The budget ran out; no partial result is kept
    TimedOut { budget: Duration },
    /// The task returned an error or panicked
    Failed(anyhow::Error),
}

/// Runs one task at a time under a [`TimeBudget`]
#[derive(Debug, Clone, Copy)]
pub struct TimeBoundedRunner {
    budget: TimeBudget,
}

impl TimeBoundedRunner {
    pub fn new(budget: TimeBudget) -> Self {
        Self { budget }
    }

    /// Run `task` on its own tokio task, stopping it when the effective
    /// budget elapses
    pub async fn run<F, Fut, T>(&self, label: &str, task: F) -> TaskOutcome<T>
    where
        F: FnOnce(CancellationFlag) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.run_with_flag(label, CancellationFlag::new(), task).await
    }

    /// Same as [`run`](Self::run) with a caller-owned cancellation flag
    pub async fn run_with_flag<F, Fut, T>(
        &self,
        label: &str,
        cancel: CancellationFlag,
        task: F,
    ) -> TaskOutcome<T>
    where
        F: FnOnce(CancellationFlag) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let budget = self.budget.effective();
        let start = Instant::now();
        tracing::info!("Starting {} with a budget of {:?}", label, budget);

        let mut handle = tokio::spawn(task(cancel.clone()));

        tokio::select! {
            biased;

            joined = &mut handle => match joined {
                Ok(Ok(value)) => {
                    tracing::info!("{} completed in {:?}", label, start.elapsed());
                    TaskOutcome::Completed(value)
                }
                Ok(Err(e)) => {
                    tracing::error!("{} failed after {:?}: {}", label, start.elapsed(), e);
                    TaskOutcome::Failed(e.into())
                }
                Err(join_error) => {
                    tracing::error!("{} panicked: {}", label, join_error);
                    TaskOutcome::Failed(anyhow!("{} panicked: {}", label, join_error))
                }
            },

            _ = tokio::time::sleep(budget) => {
                cancel.cancel();
                handle.abort();
                // Abort only lands at an await point. Blocking sections run
                // until their next cancellation check, and the next task
                // must not start before this one is gone.
                if tokio::time::timeout(ABORT_GRACE, &mut handle).await.is_err() {
                    tracing::warn!(
                        "{} still running {:?} after the abort, waiting for it to stop",
                        label,
                        ABORT_GRACE
                    );
                    if let Err(join_error) = handle.await {
                        if join_error.is_panic() {
                            tracing::error!("{} panicked after the abort: {}", label, join_error);
                        }
                    }
                }
                tracing::error!(
                    "{} timed out after {:?} (budget {:?}, safety margin {:?})",
                    label,
                    start.elapsed(),
                    self.budget.total,
                    self.budget.safety_margin
                );
                TaskOutcome::TimedOut { budget }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;

    fn runner(secs: u64) -> TimeBoundedRunner {
        TimeBoundedRunner::new(TimeBudget::new(Duration::from_secs(secs), Duration::ZERO))
    }

    #[test]
    fn test_effective_budget() {
        let budget = TimeBudget::default();
        assert_eq!(budget.effective(), Duration::from_secs(9 * 3600 - 120));

        let tiny = TimeBudget::new(Duration::from_secs(60), Duration::from_secs(120));
        assert_eq!(tiny.effective(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_times_out_long_task() {
        let cancel = CancellationFlag::new();
        let start = Instant::now();

        let outcome = runner(1)
            .run_with_flag("sleeper", cancel.clone(), |_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;

        let elapsed = start.elapsed();
        assert!(matches!(outcome, TaskOutcome::TimedOut { .. }));
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_task_is_stopped_before_returning() {
        let finished = Arc::new(AtomicBool::new(false));
        let task_finished = Arc::clone(&finished);
        let start = Instant::now();

        let outcome = runner(1)
            .run("blocking", move |_| async move {
                std::thread::sleep(Duration::from_secs(3));
                task_finished.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(outcome, TaskOutcome::TimedOut { .. }));
        assert!(finished.load(Ordering::SeqCst));
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cooperative_blocking_task_stops_promptly() {
        let stopped = Arc::new(AtomicBool::new(false));
        let task_stopped = Arc::clone(&stopped);
        let start = Instant::now();

        let outcome: TaskOutcome<()> = runner(1)
            .run("polling", move |cancel| async move {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(20));
                }
                task_stopped.store(true, Ordering::SeqCst);
                Err(PipelineError::Cancelled)
            })
            .await;

        let elapsed = start.elapsed();
        assert!(matches!(outcome, TaskOutcome::TimedOut { .. }));
        assert!(stopped.load(Ordering::SeqCst));
        assert!(elapsed < Duration::from_secs(3), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_completes_within_budget() {
        let outcome = runner(5).run("quick", |_| async { Ok(42) }).await;
        assert!(matches!(outcome, TaskOutcome::Completed(42)));
    }

    #[tokio::test]
    async fn test_error_becomes_failed() {
        let outcome: TaskOutcome<()> = runner(5)
            .run("broken", |_| async { Err(PipelineError::Cancelled) })
            .await;
        match outcome {
            TaskOutcome::Failed(e) => assert!(e.to_string().contains("cancelled")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_panic_becomes_failed() {
        let outcome: TaskOutcome<()> = runner(5)
            .run("panicky", |_| async { panic!("boom") })
            .await;
        assert!(matches!(outcome, TaskOutcome::Failed(_)));
    }
}
