//! Scan scheduling engine.
//!
//! Decides when tasks are materialized: interval triggers, cron
//! triggers, one-off backlog inserts, and the periodic backlog sweep
//! that promotes due pending tasks into worker execution. Triggers are
//! a registry of tokio tasks keyed by job id; re-registering an id
//! replaces the prior trigger.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

use netpulse_core::types::{NewScanTask, TaskType};
use netpulse_core::NetPulseConfig;
use netpulse_store::DeviceStore;

use crate::error::{Result, ScanError};
use crate::worker::{PipelineOutcome, WorkerPool};

/// Seconds between backlog sweeps.
const SWEEP_INTERVAL_SECS: u64 = 30;

/// Job id of the default recurring discovery scan.
pub const DISCOVERY_JOB_ID: &str = "recurring_discovery";

/// Job id of the backlog sweep.
pub const SWEEP_JOB_ID: &str = "pending_sweep";

/// How a job fires.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TriggerSpec {
    Interval { seconds: u64 },
    Cron { expression: String },
}

/// What a job does when it fires.
#[derive(Debug, Clone)]
enum JobAction {
    Scan { target: String, scan_type: TaskType },
    Sweep,
}

/// A registered job, reported through the API.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    pub trigger: TriggerSpec,
    pub target: Option<String>,
    pub scan_type: Option<TaskType>,
    pub paused: bool,
}

struct JobEntry {
    trigger: TriggerSpec,
    action: JobAction,
    paused: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// The scheduler owns the trigger registry and the backlog sweep.
pub struct ScanScheduler {
    store: Arc<DeviceStore>,
    pool: Arc<WorkerPool>,
    config: Arc<NetPulseConfig>,
    jobs: tokio::sync::Mutex<HashMap<String, JobEntry>>,
}

impl ScanScheduler {
    pub fn new(store: Arc<DeviceStore>, pool: Arc<WorkerPool>, config: Arc<NetPulseConfig>) -> Self {
        Self {
            store,
            pool,
            config,
            jobs: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Install the default jobs: the recurring discovery scan (when the
    /// configured interval is nonzero) and the backlog sweep.
    pub async fn start(&self) -> Result<()> {
        let discovery_interval = self.config.scanner.intervals.discovery;
        if discovery_interval > 0 {
            self.schedule_recurring(
                &self.config.scanner.default_network.clone(),
                TaskType::Discovery,
                discovery_interval,
                DISCOVERY_JOB_ID,
            )
            .await?;
        }

        self.register(
            SWEEP_JOB_ID,
            TriggerSpec::Interval {
                seconds: SWEEP_INTERVAL_SECS,
            },
            JobAction::Sweep,
        )
        .await;

        tracing::info!("Default scheduled jobs configured");
        Ok(())
    }

    /// Register a repeating interval trigger. Each firing creates a new
    /// pending task and executes it immediately through the worker pool,
    /// bypassing the backlog.
    pub async fn schedule_recurring(
        &self,
        target: &str,
        scan_type: TaskType,
        interval_secs: u64,
        job_id: &str,
    ) -> Result<()> {
        if interval_secs == 0 {
            return Err(ScanError::Schedule(
                "interval must be greater than zero".to_string(),
            ));
        }

        self.register(
            job_id,
            TriggerSpec::Interval {
                seconds: interval_secs,
            },
            JobAction::Scan {
                target: target.to_string(),
                scan_type,
            },
        )
        .await;

        tracing::info!(
            job_id,
            target,
            scan_type = %scan_type,
            interval_secs,
            "Scheduled recurring scan"
        );
        Ok(())
    }

    /// Register a cron-style calendar trigger. An invalid expression is
    /// a registration error and leaves any previous trigger with this id
    /// intact.
    pub async fn schedule_cron(
        &self,
        target: &str,
        scan_type: TaskType,
        cron_expr: &str,
        job_id: &str,
    ) -> Result<()> {
        // Validate before touching the registry.
        Schedule::from_str(cron_expr)
            .map_err(|e| ScanError::Schedule(format!("invalid cron expression: {e}")))?;

        self.register(
            job_id,
            TriggerSpec::Cron {
                expression: cron_expr.to_string(),
            },
            JobAction::Scan {
                target: target.to_string(),
                scan_type,
            },
        )
        .await;

        tracing::info!(job_id, target, scan_type = %scan_type, cron = cron_expr, "Scheduled cron scan");
        Ok(())
    }

    /// Insert a one-off task into the backlog. It is picked up by the
    /// sweep once `run_at` has elapsed (immediately when absent).
    pub async fn schedule_once(
        &self,
        target: &str,
        scan_type: TaskType,
        run_at: Option<DateTime<Utc>>,
    ) -> Result<i64> {
        let task_id = self.store.create_task(&NewScanTask {
            scheduled_at: run_at,
            ..NewScanTask::new(scan_type, target)
        })?;
        tracing::info!(task_id, target, scan_type = %scan_type, "Scheduled one-time scan");
        Ok(task_id)
    }

    async fn register(&self, job_id: &str, trigger: TriggerSpec, action: JobAction) {
        let paused = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_trigger_loop(
            self.store.clone(),
            self.pool.clone(),
            self.config.clone(),
            trigger.clone(),
            action.clone(),
            paused.clone(),
        ));

        let mut jobs = self.jobs.lock().await;
        if let Some(previous) = jobs.insert(
            job_id.to_string(),
            JobEntry {
                trigger,
                action,
                paused,
                handle,
            },
        ) {
            previous.handle.abort();
            tracing::debug!(job_id, "Replaced existing scheduled job");
        }
    }

    /// Remove a job from the trigger registry. Historical tasks are
    /// untouched.
    pub async fn remove_job(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        match jobs.remove(job_id) {
            Some(entry) => {
                entry.handle.abort();
                tracing::info!(job_id, "Removed scheduled job");
                true
            }
            None => false,
        }
    }

    /// Pause a job: its trigger keeps ticking but firings are skipped.
    pub async fn pause_job(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().await;
        match jobs.get(job_id) {
            Some(entry) => {
                entry.paused.store(true, Ordering::SeqCst);
                tracing::info!(job_id, "Paused job");
                true
            }
            None => false,
        }
    }

    /// Resume a paused job.
    pub async fn resume_job(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().await;
        match jobs.get(job_id) {
            Some(entry) => {
                entry.paused.store(false, Ordering::SeqCst);
                tracing::info!(job_id, "Resumed job");
                true
            }
            None => false,
        }
    }

    /// Replace a job's trigger, keeping its action.
    pub async fn reschedule(&self, job_id: &str, trigger: TriggerSpec) -> Result<()> {
        if let TriggerSpec::Cron { expression } = &trigger {
            Schedule::from_str(expression)
                .map_err(|e| ScanError::Schedule(format!("invalid cron expression: {e}")))?;
        }
        if let TriggerSpec::Interval { seconds: 0 } = trigger {
            return Err(ScanError::Schedule(
                "interval must be greater than zero".to_string(),
            ));
        }

        let action = {
            let jobs = self.jobs.lock().await;
            match jobs.get(job_id) {
                Some(entry) => entry.action.clone(),
                None => {
                    return Err(ScanError::Schedule(format!("no such job: {job_id}")));
                }
            }
        };

        self.register(job_id, trigger, action).await;
        tracing::info!(job_id, "Rescheduled job");
        Ok(())
    }

    /// Snapshot of the trigger registry.
    pub async fn jobs(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().await;
        let mut infos: Vec<JobInfo> = jobs
            .iter()
            .map(|(id, entry)| {
                let (target, scan_type) = match &entry.action {
                    JobAction::Scan { target, scan_type } => {
                        (Some(target.clone()), Some(*scan_type))
                    }
                    JobAction::Sweep => (None, None),
                };
                JobInfo {
                    id: id.clone(),
                    trigger: entry.trigger.clone(),
                    target,
                    scan_type,
                    paused: entry.paused.load(Ordering::SeqCst),
                }
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// One backlog sweep: claim due pending tasks (oldest first within
    /// the highest priority) and dispatch them to the worker pool with a
    /// logging completion callback. Returns the number dispatched.
    pub async fn sweep_once(&self) -> usize {
        sweep_backlog(&self.store, &self.pool, self.config.scheduler.sweep_batch).await
    }

    /// Abort every registered trigger.
    pub async fn shutdown(&self) {
        let mut jobs = self.jobs.lock().await;
        for (job_id, entry) in jobs.drain() {
            entry.handle.abort();
            tracing::debug!(job_id = %job_id, "Stopped scheduled job");
        }
        tracing::info!("Scheduler stopped");
    }
}

async fn run_trigger_loop(
    store: Arc<DeviceStore>,
    pool: Arc<WorkerPool>,
    config: Arc<NetPulseConfig>,
    trigger: TriggerSpec,
    action: JobAction,
    paused: Arc<AtomicBool>,
) {
    match trigger {
        TriggerSpec::Interval { seconds } => {
            let mut ticker = interval(Duration::from_secs(seconds.max(1)));
            ticker.set_missed_tick_behavior(if config.scheduler.coalesce {
                MissedTickBehavior::Skip
            } else {
                MissedTickBehavior::Burst
            });
            // The first tick completes immediately; consume it so the
            // job first fires one full interval after registration.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                fire(&store, &pool, &config, &action).await;
            }
        }
        TriggerSpec::Cron { expression } => {
            let Ok(schedule) = Schedule::from_str(&expression) else {
                tracing::error!(cron = %expression, "Cron expression failed to parse after registration");
                return;
            };
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    tracing::warn!(cron = %expression, "Cron schedule has no upcoming firings");
                    return;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                fire(&store, &pool, &config, &action).await;
            }
        }
    }
}

/// One firing of a job: create and directly execute a scan task, or run
/// a backlog sweep.
async fn fire(
    store: &Arc<DeviceStore>,
    pool: &Arc<WorkerPool>,
    config: &Arc<NetPulseConfig>,
    action: &JobAction,
) {
    match action {
        JobAction::Scan { target, scan_type } => {
            tracing::info!(target = %target, scan_type = %scan_type, "Scheduled scan triggered");
            let task = match store
                .create_task(&NewScanTask::new(*scan_type, target.clone()))
                .and_then(|id| store.get_task(id))
            {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tracing::error!(target = %target, "Created task vanished before dispatch");
                    return;
                }
                Err(e) => {
                    tracing::error!(target = %target, error = %e, "Failed to create scheduled task");
                    return;
                }
            };

            let handle = pool.submit(task, None).await;
            if config.scheduler.max_instances <= 1 {
                // Direct execution path: wait for the outcome so one job
                // never has more than one firing in flight.
                let outcome = handle.outcome().await;
                log_outcome(&outcome);
            } else {
                tokio::spawn(async move {
                    log_outcome(&handle.outcome().await);
                });
            }
        }
        JobAction::Sweep => {
            sweep_backlog(store, pool, config.scheduler.sweep_batch).await;
        }
    }
}

async fn sweep_backlog(store: &Arc<DeviceStore>, pool: &Arc<WorkerPool>, batch: usize) -> usize {
    let tasks = match store.pending_tasks(batch) {
        Ok(tasks) => tasks,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read pending backlog");
            return 0;
        }
    };
    if tasks.is_empty() {
        return 0;
    }

    tracing::info!(count = tasks.len(), "Promoting pending tasks");
    let mut dispatched = 0;
    for task in tasks {
        // Claim before dispatch so the next sweep cannot pick the same
        // task up while it waits for a worker slot.
        match store.mark_task_running(task.id) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => {
                tracing::error!(task_id = task.id, error = %e, "Failed to claim pending task");
                continue;
            }
        }
        pool.submit(task, Some(Box::new(|outcome: &PipelineOutcome| {
            log_outcome(outcome);
        })))
        .await;
        dispatched += 1;
    }
    dispatched
}

fn log_outcome(outcome: &PipelineOutcome) {
    if outcome.success {
        tracing::info!(
            task_id = outcome.task_id,
            devices_found = outcome.devices_found,
            hosts_up = outcome.hosts_up,
            "Task completed"
        );
    } else {
        tracing::error!(
            task_id = outcome.task_id,
            error = outcome.error.as_deref().unwrap_or("unknown"),
            "Task failed"
        );
    }
}
