//! # Scheduler Daemon
//!
//! Registers one cron timer per enabled `scheduler` node of every enabled
//! workflow. Each fire calls the workflow engine with a `scheduler` trigger.
//!
//! `refresh` drops every timer and rebuilds the set from the workflow
//! repository, so running it twice leaves the same jobs registered. Each job
//! key owns an [`InFlightGuard`]; a fire that finds the previous run of the
//! same job still executing is skipped. Guards outlive refresh and stop, so a
//! run started before a refresh still blocks fires registered after it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::cron::CronSpec;
use super::guard::InFlightGuard;
use crate::config::SchedulerDaemonConfig;
use crate::constants::payload_keys;
use crate::error::{TaskerError, TaskerResult};
use crate::orchestration::{
    FlowExecutor, SchedulerNodeConfig, TriggerType, WorkflowDefinition, WorkflowRepository,
};

/// Identity of a scheduled job
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobKey {
    pub flow_id: String,
    pub node_id: String,
}

impl JobKey {
    pub fn new(flow_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            flow_id: flow_id.into(),
            node_id: node_id.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.flow_id, self.node_id)
    }
}

/// A registered cron job
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub key: JobKey,
    pub spec: CronSpec,
}

struct JobHandle {
    job: ScheduledJob,
    guard: InFlightGuard,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl JobHandle {
    async fn cancel(self) {
        let _ = self.shutdown_tx.send(());
        if let Err(e) = self.task.await {
            warn!(job = %self.job.key, error = %e, "Scheduler job timer ended abnormally");
        }
    }
}

#[derive(Debug, Default)]
struct SchedulerStats {
    total_fires: AtomicU64,
    failed_fires: AtomicU64,
    skipped_overlaps: AtomicU64,
}

/// Point-in-time view of the scheduler daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub job_count: usize,
    pub total_fires: u64,
    pub failed_fires: u64,
    pub skipped_overlaps: u64,
    pub last_refresh_at: Option<DateTime<Utc>>,
}

struct SchedulerInner {
    workflows: Arc<dyn WorkflowRepository>,
    executor: Arc<dyn FlowExecutor>,
    config: SchedulerDaemonConfig,
    jobs: DashMap<JobKey, JobHandle>,
    /// Kept across refresh; pruned once a key is gone and idle
    guards: DashMap<JobKey, InFlightGuard>,
    running: AtomicBool,
    stats: SchedulerStats,
    last_refresh_at: RwLock<Option<DateTime<Utc>>>,
    rescan: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
    /// Serializes start, stop and refresh
    lifecycle: tokio::sync::Mutex<()>,
}

/// Cron-driven trigger source for workflows
#[derive(Clone)]
pub struct SchedulerDaemon {
    inner: Arc<SchedulerInner>,
}

impl fmt::Debug for SchedulerDaemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerDaemon")
            .field("running", &self.is_running())
            .field("job_count", &self.job_count())
            .finish_non_exhaustive()
    }
}

impl SchedulerDaemon {
    pub fn new(
        workflows: Arc<dyn WorkflowRepository>,
        executor: Arc<dyn FlowExecutor>,
        config: SchedulerDaemonConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                workflows,
                executor,
                config,
                jobs: DashMap::new(),
                guards: DashMap::new(),
                running: AtomicBool::new(false),
                stats: SchedulerStats::default(),
                last_refresh_at: RwLock::new(None),
                rescan: Mutex::new(None),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Scan workflows and register their timers; a no-op when already running
    pub async fn start(&self) -> TaskerResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.running.load(Ordering::Acquire) {
            debug!("Scheduler daemon already running");
            return Ok(());
        }

        self.register_all().await?;
        self.inner.running.store(true, Ordering::Release);
        self.start_rescan();

        info!(jobs = self.job_count(), "Scheduler daemon started");
        Ok(())
    }

    /// Cancel every timer; runs already in flight finish on their own
    pub async fn stop(&self) -> TaskerResult<()> {
        // The rescan task takes the lifecycle lock itself, so it is joined first
        let rescan = self.inner.rescan.lock().take();
        if let Some((shutdown_tx, task)) = rescan {
            let _ = shutdown_tx.send(());
            if let Err(e) = task.await {
                warn!(error = %e, "Scheduler rescan task ended abnormally");
            }
        }

        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            debug!("Scheduler daemon already stopped");
            return Ok(());
        }

        let cancelled = self.cancel_all().await;
        info!(cancelled, "Scheduler daemon stopped");
        Ok(())
    }

    /// Rebuild the job set from the current workflow definitions
    pub async fn refresh(&self) -> TaskerResult<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(TaskerError::InvalidState(
                "scheduler daemon is not running".to_string(),
            ));
        }

        let cancelled = self.cancel_all().await;
        self.register_all().await?;
        info!(
            cancelled,
            registered = self.job_count(),
            "Scheduler jobs refreshed"
        );
        Ok(())
    }

    /// Fire a registered job immediately, through the same overlap guard
    ///
    /// Returns `false` when the previous run of the job is still in flight.
    pub async fn trigger_now(&self, key: &JobKey) -> TaskerResult<bool> {
        let (job, guard) = match self.inner.jobs.get(key) {
            Some(entry) => (entry.job.clone(), entry.guard.clone()),
            None => {
                return Err(TaskerError::SchedulingError(format!(
                    "no scheduled job registered for {key}"
                )))
            }
        };

        let Some(_permit) = guard.try_acquire() else {
            self.inner.stats.skipped_overlaps.fetch_add(1, Ordering::Relaxed);
            warn!(job = %key, "Previous run still in flight; manual trigger skipped");
            return Ok(false);
        };
        self.inner.fire(&job, Utc::now()).await;
        Ok(true)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn job_count(&self) -> usize {
        self.inner.jobs.len()
    }

    /// Registered job keys, sorted
    pub fn job_keys(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self.inner.jobs.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn jobs(&self) -> Vec<ScheduledJob> {
        let mut jobs: Vec<ScheduledJob> =
            self.inner.jobs.iter().map(|e| e.job.clone()).collect();
        jobs.sort_by(|a, b| a.key.cmp(&b.key));
        jobs
    }

    pub fn status(&self) -> SchedulerStatus {
        let stats = &self.inner.stats;
        SchedulerStatus {
            running: self.is_running(),
            job_count: self.job_count(),
            total_fires: stats.total_fires.load(Ordering::Relaxed),
            failed_fires: stats.failed_fires.load(Ordering::Relaxed),
            skipped_overlaps: stats.skipped_overlaps.load(Ordering::Relaxed),
            last_refresh_at: *self.inner.last_refresh_at.read(),
        }
    }

    async fn register_all(&self) -> TaskerResult<()> {
        let workflows = self.inner.workflows.list_enabled_workflows().await?;

        let mut skipped = 0usize;
        for workflow in &workflows {
            for job in self.jobs_for(workflow, &mut skipped) {
                self.register(job).await;
            }
        }

        let jobs = &self.inner.jobs;
        self.inner
            .guards
            .retain(|key, guard| jobs.contains_key(key) || guard.is_in_flight());

        *self.inner.last_refresh_at.write() = Some(Utc::now());
        debug!(
            workflows = workflows.len(),
            registered = self.job_count(),
            skipped,
            "Scheduler scan complete"
        );
        Ok(())
    }

    fn jobs_for(&self, workflow: &WorkflowDefinition, skipped: &mut usize) -> Vec<ScheduledJob> {
        let mut jobs = Vec::new();
        for node in workflow.scheduler_nodes() {
            let config: SchedulerNodeConfig = match serde_json::from_value(node.config.clone()) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        flow_id = %workflow.id,
                        node_id = %node.id,
                        error = %e,
                        "Scheduler node has no usable cron config; skipping"
                    );
                    *skipped += 1;
                    continue;
                }
            };

            let timezone = config
                .timezone
                .as_deref()
                .map(str::trim)
                .filter(|tz| !tz.is_empty())
                .unwrap_or(&self.inner.config.default_timezone);

            match CronSpec::parse(&config.cron, timezone) {
                Ok(spec) => jobs.push(ScheduledJob {
                    key: JobKey::new(&workflow.id, &node.id),
                    spec,
                }),
                Err(e) => {
                    warn!(
                        flow_id = %workflow.id,
                        node_id = %node.id,
                        cron = %config.cron,
                        error = %e,
                        "Invalid cron expression; skipping scheduler node"
                    );
                    *skipped += 1;
                }
            }
        }
        jobs
    }

    async fn register(&self, job: ScheduledJob) {
        let guard = self
            .inner
            .guards
            .entry(job.key.clone())
            .or_default()
            .clone();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_job_timer(
            Arc::clone(&self.inner),
            job.clone(),
            guard.clone(),
            shutdown_rx,
        ));

        debug!(job = %job.key, cron = %job.spec.expression(), tz = %job.spec.timezone(), "Scheduler job registered");
        let handle = JobHandle {
            job,
            guard,
            shutdown_tx,
            task,
        };
        if let Some(previous) = self.inner.jobs.insert(handle.job.key.clone(), handle) {
            previous.cancel().await;
        }
    }

    async fn cancel_all(&self) -> usize {
        let keys: Vec<JobKey> = self.inner.jobs.iter().map(|e| e.key().clone()).collect();
        let mut cancelled = 0;
        for key in keys {
            if let Some((_, handle)) = self.inner.jobs.remove(&key) {
                handle.cancel().await;
                cancelled += 1;
            }
        }
        cancelled
    }

    fn start_rescan(&self) {
        let Some(expression) = self.inner.config.rescan_cron.as_deref() else {
            return;
        };
        let spec = match CronSpec::parse(expression, &self.inner.config.default_timezone) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(cron = %expression, error = %e, "Invalid rescan cron; periodic refresh disabled");
                return;
            }
        };

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let daemon = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let wait = match spec.duration_until_next(Utc::now()) {
                    Ok((_, wait)) => wait,
                    Err(e) => {
                        warn!(error = %e, "Rescan schedule exhausted");
                        break;
                    }
                };
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if let Err(e) = daemon.refresh().await {
                    warn!(error = %e, "Periodic scheduler refresh failed");
                }
            }
        });
        *self.inner.rescan.lock() = Some((shutdown_tx, task));
    }
}

impl SchedulerInner {
    async fn fire(&self, job: &ScheduledJob, scheduled_time: DateTime<Utc>) {
        self.stats.total_fires.fetch_add(1, Ordering::Relaxed);
        let mut payload = Map::new();
        payload.insert(
            payload_keys::NODE_ID.to_string(),
            Value::String(job.key.node_id.clone()),
        );
        payload.insert(
            payload_keys::SCHEDULED_TIME.to_string(),
            Value::String(scheduled_time.to_rfc3339()),
        );

        match self
            .executor
            .execute_flow(
                &job.key.flow_id,
                Value::Object(payload),
                TriggerType::Scheduler,
                false,
            )
            .await
        {
            Ok(run) => info!(
                flow_id = %job.key.flow_id,
                node_id = %job.key.node_id,
                run_id = %run.id,
                status = %run.status,
                "Scheduled flow triggered"
            ),
            Err(e) => {
                self.stats.failed_fires.fetch_add(1, Ordering::Relaxed);
                error!(
                    flow_id = %job.key.flow_id,
                    node_id = %job.key.node_id,
                    error = %e,
                    "Scheduled flow trigger failed"
                );
            }
        }
    }
}

async fn run_job_timer(
    inner: Arc<SchedulerInner>,
    job: ScheduledJob,
    guard: InFlightGuard,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        let (next, wait) = match job.spec.duration_until_next(Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                warn!(job = %job.key, error = %e, "Scheduler job has no further fire times");
                break;
            }
        };

        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = tokio::time::sleep(wait) => {}
        }

        match guard.try_acquire() {
            Some(permit) => {
                let inner = Arc::clone(&inner);
                let job = job.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    inner.fire(&job, next).await;
                });
            }
            None => {
                inner.stats.skipped_overlaps.fetch_add(1, Ordering::Relaxed);
                warn!(job = %job.key, "Previous run still in flight; skipping scheduled fire");
            }
        }
    }
}
