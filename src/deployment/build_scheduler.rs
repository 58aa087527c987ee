//! # Deployment Build Scheduler
//!
//! Once a day (cron, `0 0 3 * * *` UTC by default) every operator with
//! scheduled builds enabled gets one build job per configured target,
//! enqueued through the [`QueueManager`]. A failed enqueue is logged and
//! counted; it does not stop the rest of the scan.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use super::types::BuildRequest;
use crate::config::DeploymentBuildConfig;
use crate::error::{TaskerError, TaskerResult};
use crate::messaging::{EnqueueOptions, QueueManager};
use crate::orchestration::OperatorRepository;
use crate::scheduling::{CronSpec, InFlightGuard, InFlightPermit};

/// Counts from one scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildScanReport {
    pub scanned_at: DateTime<Utc>,
    pub operators: usize,
    pub scheduled: usize,
    pub failed: usize,
}

/// Point-in-time view of the build scheduler
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSchedulerStatus {
    pub running: bool,
    pub cron: String,
    pub timezone: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub total_builds_scheduled: u64,
    pub enqueue_failures: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
}

struct BuildSchedulerInner {
    operators: Arc<dyn OperatorRepository>,
    queue: Arc<QueueManager>,
    config: DeploymentBuildConfig,
    spec: CronSpec,
    guard: InFlightGuard,
    total_builds_scheduled: AtomicU64,
    enqueue_failures: AtomicU64,
    last_scan_at: RwLock<Option<DateTime<Utc>>>,
    timer: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

/// Daily fan-out of deployment build jobs
#[derive(Clone)]
pub struct DeploymentBuildScheduler {
    inner: Arc<BuildSchedulerInner>,
}

impl fmt::Debug for DeploymentBuildScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentBuildScheduler")
            .field("cron", &self.inner.config.cron)
            .field("topic", &self.inner.config.topic)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl DeploymentBuildScheduler {
    /// Fails when the configured cron or timezone does not parse
    pub fn new(
        operators: Arc<dyn OperatorRepository>,
        queue: Arc<QueueManager>,
        config: DeploymentBuildConfig,
    ) -> TaskerResult<Self> {
        let spec = CronSpec::parse(&config.cron, &config.timezone)?;
        Ok(Self {
            inner: Arc::new(BuildSchedulerInner {
                operators,
                queue,
                config,
                spec,
                guard: InFlightGuard::new(),
                total_builds_scheduled: AtomicU64::new(0),
                enqueue_failures: AtomicU64::new(0),
                last_scan_at: RwLock::new(None),
                timer: Mutex::new(None),
            }),
        })
    }

    pub fn start(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            debug!("Deployment build scheduler already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_scan_timer(Arc::clone(&self.inner), shutdown_rx));
        *timer = Some((shutdown_tx, task));

        info!(
            cron = %self.inner.config.cron,
            timezone = %self.inner.config.timezone,
            topic = %self.inner.config.topic,
            "Deployment build scheduler started"
        );
    }

    /// Stop the timer and wait for a scan in progress to finish
    pub async fn stop(&self) {
        let timer = self.inner.timer.lock().take();
        let Some((shutdown_tx, task)) = timer else {
            debug!("Deployment build scheduler already stopped");
            return;
        };

        let _ = shutdown_tx.send(());
        if let Err(e) = task.await {
            warn!(error = %e, "Deployment build timer ended abnormally");
        }
        info!("Deployment build scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    /// Scan operators and enqueue their builds as of `now`
    ///
    /// Fails with `InvalidState` when a scan is already in progress.
    pub async fn run_scan(&self, now: DateTime<Utc>) -> TaskerResult<BuildScanReport> {
        let permit = self.inner.guard.try_acquire().ok_or_else(|| {
            TaskerError::InvalidState("a deployment build scan is already in progress".to_string())
        })?;
        self.inner.scan(now, permit).await
    }

    pub fn status(&self) -> BuildSchedulerStatus {
        BuildSchedulerStatus {
            running: self.is_running(),
            cron: self.inner.config.cron.clone(),
            timezone: self.inner.config.timezone.clone(),
            next_run_at: self.inner.spec.next_after(Utc::now()),
            total_builds_scheduled: self.inner.total_builds_scheduled.load(Ordering::Relaxed),
            enqueue_failures: self.inner.enqueue_failures.load(Ordering::Relaxed),
            last_scan_at: *self.inner.last_scan_at.read(),
        }
    }
}

impl BuildSchedulerInner {
    async fn scan(
        &self,
        now: DateTime<Utc>,
        _permit: InFlightPermit,
    ) -> TaskerResult<BuildScanReport> {
        *self.last_scan_at.write() = Some(now);
        let operators = self.operators.list_scheduled_build_operators().await?;

        let mut report = BuildScanReport {
            scanned_at: now,
            operators: operators.len(),
            scheduled: 0,
            failed: 0,
        };
        let options = EnqueueOptions::default();

        for operator in &operators {
            for target in operator.scheduled_targets() {
                let request = BuildRequest::scheduled(&operator.id, target, now);
                let payload = serde_json::to_string(&request)?;

                match self
                    .queue
                    .enqueue_payload(&self.config.topic, payload, &options)
                    .await
                {
                    Ok(message_id) => {
                        report.scheduled += 1;
                        debug!(
                            operator_id = %operator.id,
                            target = %target,
                            message_id = %message_id,
                            "Deployment build enqueued"
                        );
                    }
                    Err(e) => {
                        report.failed += 1;
                        error!(
                            operator_id = %operator.id,
                            target = %target,
                            error = %e,
                            "Failed to enqueue deployment build"
                        );
                    }
                }
            }
        }

        self.total_builds_scheduled
            .fetch_add(report.scheduled as u64, Ordering::Relaxed);
        self.enqueue_failures
            .fetch_add(report.failed as u64, Ordering::Relaxed);

        info!(
            operators = report.operators,
            scheduled = report.scheduled,
            failed = report.failed,
            "Deployment build scan complete"
        );
        Ok(report)
    }
}

async fn run_scan_timer(inner: Arc<BuildSchedulerInner>, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut scans = JoinSet::new();

    loop {
        let wait = match inner.spec.duration_until_next(Utc::now()) {
            Ok((_, wait)) => wait,
            Err(e) => {
                warn!(error = %e, "Deployment build schedule has no further fire times");
                break;
            }
        };

        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = tokio::time::sleep(wait) => {}
        }

        while let Some(finished) = scans.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Deployment build scan panicked");
            }
        }

        let Some(permit) = inner.guard.try_acquire() else {
            warn!("Previous deployment build scan still running; skipping");
            continue;
        };

        let inner = Arc::clone(&inner);
        scans.spawn(async move {
            if let Err(e) = inner.scan(Utc::now(), permit).await {
                error!(error = %e, "Deployment build scan failed");
            }
        });
    }

    while let Some(finished) = scans.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Deployment build scan panicked");
        }
    }
}
