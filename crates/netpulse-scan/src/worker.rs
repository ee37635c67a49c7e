//! Bounded-concurrency execution of scan pipelines.
//!
//! A semaphore caps the number of pipelines running at once; excess
//! submissions queue until a slot frees. Failures inside a pipeline are
//! returned as values and never poison the pool or abort other tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tokio::task::JoinHandle;

use netpulse_core::types::ScanTask;

/// The result of one pipeline execution. Failures are captured here,
/// never raised into the scheduler.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub task_id: i64,
    pub success: bool,
    pub error: Option<String>,
    pub devices_found: usize,
    pub hosts_up: i64,
    /// Wall-clock duration of the scan invocation, in seconds.
    pub duration: f64,
}

impl PipelineOutcome {
    pub fn failed(task_id: i64, error: impl Into<String>) -> Self {
        Self {
            task_id,
            success: false,
            error: Some(error.into()),
            devices_found: 0,
            hosts_up: 0,
            duration: 0.0,
        }
    }

    pub fn cancelled(task_id: i64) -> Self {
        Self::failed(task_id, "cancelled before start")
    }
}

/// Executes one scan task end to end. Implemented by the scan pipeline;
/// test doubles stand in for it in pool and scheduler tests.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run the full pipeline for one task. Must not panic on expected
    /// failures; those come back as a failed outcome.
    async fn run(&self, task: ScanTask) -> PipelineOutcome;

    /// Bookkeeping for a queued task cancelled before it started.
    async fn abandon(&self, task: ScanTask) -> PipelineOutcome;
}

/// Completion callback invoked with the outcome of a submission.
pub type CompletionCallback = Box<dyn FnOnce(&PipelineOutcome) + Send>;

/// Handle to one submitted task, resolvable to its outcome.
pub struct ScanHandle {
    task_id: i64,
    rx: oneshot::Receiver<PipelineOutcome>,
}

impl ScanHandle {
    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// Wait for the pipeline to finish and return its outcome.
    pub async fn outcome(self) -> PipelineOutcome {
        let task_id = self.task_id;
        self.rx
            .await
            .unwrap_or_else(|_| PipelineOutcome::failed(task_id, "worker dropped"))
    }
}

struct ActiveTask {
    started: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Worker pool running scan pipelines with bounded concurrency.
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    runner: Arc<dyn TaskRunner>,
    active: Mutex<HashMap<i64, ActiveTask>>,
}

impl WorkerPool {
    pub fn new(max_workers: usize, runner: Arc<dyn TaskRunner>) -> Self {
        tracing::info!(max_workers, "Worker pool initialized");
        Self {
            semaphore: Arc::new(Semaphore::new(max_workers.max(1))),
            runner,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Submit a task for pipeline execution.
    ///
    /// The task waits for a worker slot, then runs to completion. The
    /// returned handle resolves to the outcome; `callback`, if given, is
    /// invoked with the same outcome when the pipeline finishes.
    pub async fn submit(&self, task: ScanTask, callback: Option<CompletionCallback>) -> ScanHandle {
        let task_id = task.id;
        let started = Arc::new(AtomicBool::new(false));
        let cancelled = Arc::new(AtomicBool::new(false));
        let (tx, rx) = oneshot::channel();

        let semaphore = self.semaphore.clone();
        let runner = self.runner.clone();
        let started_flag = started.clone();
        let cancelled_flag = cancelled.clone();

        let join = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("worker semaphore closed");

            let outcome = if cancelled_flag.load(Ordering::SeqCst) {
                runner.abandon(task).await
            } else {
                started_flag.store(true, Ordering::SeqCst);
                runner.run(task).await
            };

            if let Some(cb) = callback {
                cb(&outcome);
            }
            let _ = tx.send(outcome);
        });

        let mut active = self.active.lock().await;
        active.insert(
            task_id,
            ActiveTask {
                started,
                cancelled,
                join,
            },
        );
        tracing::debug!(task_id, "Task submitted to worker pool");

        ScanHandle { task_id, rx }
    }

    /// Best-effort cancellation: succeeds only if the pipeline has not
    /// yet started running on a worker.
    pub async fn cancel(&self, task_id: i64) -> bool {
        let active = self.active.lock().await;
        match active.get(&task_id) {
            Some(entry) if !entry.started.load(Ordering::SeqCst) => {
                entry.cancelled.store(true, Ordering::SeqCst);
                tracing::info!(task_id, "Task cancelled");
                true
            }
            _ => false,
        }
    }

    /// Number of submissions not yet finished.
    pub async fn active_count(&self) -> usize {
        let mut active = self.active.lock().await;
        active.retain(|_, entry| !entry.join.is_finished());
        active.len()
    }

    /// Wait for all outstanding submissions to finish, up to `timeout`.
    ///
    /// Finished or not, every drained task is removed from the active
    /// set; tasks still running when the timeout fires keep running
    /// detached.
    pub async fn await_all(&self, timeout: Duration) -> usize {
        let entries: Vec<(i64, ActiveTask)> = {
            let mut active = self.active.lock().await;
            active.drain().collect()
        };

        let deadline = tokio::time::Instant::now() + timeout;
        let mut finished = 0;

        for (task_id, entry) in entries {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, entry.join).await {
                Ok(Ok(())) => finished += 1,
                Ok(Err(e)) => {
                    tracing::error!(task_id, error = %e, "Worker task panicked");
                }
                Err(_) => {
                    tracing::warn!(task_id, "Timed out waiting for task completion");
                }
            }
        }

        finished
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use chrono::Utc;
    use netpulse_core::types::{TaskStatus, TaskType};

    fn task(id: i64) -> ScanTask {
        ScanTask {
            id,
            task_type: TaskType::Quick,
            target: "10.0.0.1".to_string(),
            scan_options: None,
            status: TaskStatus::Pending,
            priority: 5,
            created_at: Utc::now(),
            scheduled_at: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Runner that sleeps and tracks its peak concurrency.
    struct SlowRunner {
        current: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl SlowRunner {
        fn new(delay: Duration) -> Self {
            Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl TaskRunner for SlowRunner {
        async fn run(&self, task: ScanTask) -> PipelineOutcome {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            PipelineOutcome {
                task_id: task.id,
                success: true,
                error: None,
                devices_found: 1,
                hosts_up: 1,
                duration: 0.0,
            }
        }

        async fn abandon(&self, task: ScanTask) -> PipelineOutcome {
            PipelineOutcome::cancelled(task.id)
        }
    }

    /// Runner that panics on a chosen task id.
    struct PanickyRunner {
        poison_id: i64,
    }

    #[async_trait]
    impl TaskRunner for PanickyRunner {
        async fn run(&self, task: ScanTask) -> PipelineOutcome {
            if task.id == self.poison_id {
                panic!("boom");
            }
            PipelineOutcome {
                task_id: task.id,
                success: true,
                error: None,
                devices_found: 0,
                hosts_up: 0,
                duration: 0.0,
            }
        }

        async fn abandon(&self, task: ScanTask) -> PipelineOutcome {
            PipelineOutcome::cancelled(task.id)
        }
    }

    #[tokio::test]
    async fn concurrency_is_bounded_by_max_workers() {
        let runner = Arc::new(SlowRunner::new(Duration::from_millis(50)));
        let pool = WorkerPool::new(2, runner.clone());

        let mut handles = Vec::new();
        for id in 1..=6 {
            handles.push(pool.submit(task(id), None).await);
        }
        for handle in handles {
            assert!(handle.outcome().await.success);
        }

        assert!(runner.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancel_succeeds_only_before_start() {
        let runner = Arc::new(SlowRunner::new(Duration::from_millis(200)));
        let pool = WorkerPool::new(1, runner);

        let first = pool.submit(task(1), None).await;
        // Give the first task time to occupy the only worker slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = pool.submit(task(2), None).await;

        assert!(!pool.cancel(1).await, "running task must not be cancellable");
        assert!(pool.cancel(2).await, "queued task must be cancellable");
        assert!(!pool.cancel(99).await, "unknown task is not cancellable");

        assert!(first.outcome().await.success);
        let second_outcome = second.outcome().await;
        assert!(!second_outcome.success);
        assert!(second_outcome.error.unwrap().contains("cancelled"));
    }

    #[tokio::test]
    async fn panic_in_one_pipeline_does_not_poison_others() {
        let runner = Arc::new(PanickyRunner { poison_id: 2 });
        let pool = WorkerPool::new(4, runner);

        let h1 = pool.submit(task(1), None).await;
        let h2 = pool.submit(task(2), None).await;
        let h3 = pool.submit(task(3), None).await;

        assert!(h1.outcome().await.success);
        let poisoned = h2.outcome().await;
        assert!(!poisoned.success);
        assert!(h3.outcome().await.success);

        // The panicked join is reported but does not abort the drain.
        let finished = pool.await_all(Duration::from_secs(1)).await;
        assert_eq!(finished, 2);
        assert_eq!(pool.active_count().await, 0);
    }

    #[tokio::test]
    async fn completion_callback_receives_outcome() {
        let runner = Arc::new(SlowRunner::new(Duration::from_millis(1)));
        let pool = WorkerPool::new(2, runner);
        let (tx, rx) = oneshot::channel();

        let handle = pool
            .submit(
                task(7),
                Some(Box::new(move |outcome: &PipelineOutcome| {
                    let _ = tx.send(outcome.task_id);
                })),
            )
            .await;

        assert!(handle.outcome().await.success);
        assert_eq!(rx.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn await_all_drains_finished_handles() {
        let runner = Arc::new(SlowRunner::new(Duration::from_millis(1)));
        let pool = WorkerPool::new(4, runner);

        for id in 1..=3 {
            pool.submit(task(id), None).await;
        }
        let finished = pool.await_all(Duration::from_secs(1)).await;
        assert_eq!(finished, 3);
        assert_eq!(pool.active_count().await, 0);
    }
}
