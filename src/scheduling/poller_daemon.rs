//! # Poller Daemon
//!
//! A fixed one-minute tick walks every enabled poller. A poller whose
//! interval has elapsed since `last_processed_at` triggers its workflow with
//! a `poller` trigger. A completed run or a "no new data" answer marks the
//! poller processed; anything else records the error and leaves
//! `last_processed_at` alone so the next tick retries.
//!
//! Ticks never overlap: a tick that fires while the previous one is still
//! running is skipped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::guard::{InFlightGuard, InFlightPermit};
use crate::config::PollerDaemonConfig;
use crate::constants::payload_keys;
use crate::error::{TaskerError, TaskerResult};
use crate::orchestration::{
    FlowExecutor, PollerState, PollerStateRepository, TriggerType, WorkflowRepository,
};

/// Result of polling one poller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    Succeeded,
    NoNewData,
    SkippedWorkflow,
    Failed,
}

/// Counts from one tick
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollTickReport {
    pub examined: usize,
    pub not_due: usize,
    /// Workflow missing or disabled
    pub skipped_workflow: usize,
    pub succeeded: usize,
    pub no_new_data: usize,
    pub failed: usize,
}

impl PollTickReport {
    /// Pollers whose workflow was invoked
    pub fn triggered(&self) -> usize {
        self.succeeded + self.no_new_data + self.failed
    }

    fn record(&mut self, outcome: PollOutcome) {
        match outcome {
            PollOutcome::Succeeded => self.succeeded += 1,
            PollOutcome::NoNewData => self.no_new_data += 1,
            PollOutcome::SkippedWorkflow => self.skipped_workflow += 1,
            PollOutcome::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Default)]
struct PollerStats {
    ticks: AtomicU64,
    skipped_ticks: AtomicU64,
    triggered: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time view of the poller daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PollerStatus {
    pub running: bool,
    pub total_ticks: u64,
    pub skipped_ticks: u64,
    pub total_triggered: u64,
    pub total_failed: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

struct PollerInner {
    pollers: Arc<dyn PollerStateRepository>,
    workflows: Arc<dyn WorkflowRepository>,
    executor: Arc<dyn FlowExecutor>,
    config: PollerDaemonConfig,
    guard: InFlightGuard,
    stats: PollerStats,
    last_tick_at: RwLock<Option<DateTime<Utc>>>,
    timer: Mutex<Option<(oneshot::Sender<()>, JoinHandle<()>)>>,
}

/// Interval-driven trigger source for polling workflows
#[derive(Clone)]
pub struct PollerDaemon {
    inner: Arc<PollerInner>,
}

impl fmt::Debug for PollerDaemon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerDaemon")
            .field("running", &self.is_running())
            .field("tick_interval", &self.inner.config.tick_interval())
            .finish_non_exhaustive()
    }
}

impl PollerDaemon {
    pub fn new(
        pollers: Arc<dyn PollerStateRepository>,
        workflows: Arc<dyn WorkflowRepository>,
        executor: Arc<dyn FlowExecutor>,
        config: PollerDaemonConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PollerInner {
                pollers,
                workflows,
                executor,
                config,
                guard: InFlightGuard::new(),
                stats: PollerStats::default(),
                last_tick_at: RwLock::new(None),
                timer: Mutex::new(None),
            }),
        }
    }

    /// Start the tick timer; the first tick runs immediately
    pub fn start(&self) {
        let mut timer = self.inner.timer.lock();
        if timer.is_some() {
            debug!("Poller daemon already running");
            return;
        }

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_tick_timer(Arc::clone(&self.inner), shutdown_rx));
        *timer = Some((shutdown_tx, task));

        info!(
            tick_seconds = self.inner.config.tick_interval_seconds,
            "Poller daemon started"
        );
    }

    /// Stop the timer and wait for a tick in progress to finish
    pub async fn stop(&self) {
        let timer = self.inner.timer.lock().take();
        let Some((shutdown_tx, task)) = timer else {
            debug!("Poller daemon already stopped");
            return;
        };

        let _ = shutdown_tx.send(());
        if let Err(e) = task.await {
            warn!(error = %e, "Poller tick timer ended abnormally");
        }
        info!("Poller daemon stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.timer.lock().is_some()
    }

    /// Run one tick as of `now`
    ///
    /// Fails with `InvalidState` when a tick is already in progress.
    pub async fn run_tick(&self, now: DateTime<Utc>) -> TaskerResult<PollTickReport> {
        let permit = self.inner.guard.try_acquire().ok_or_else(|| {
            TaskerError::InvalidState("a poller tick is already in progress".to_string())
        })?;
        self.inner.tick(now, permit).await
    }

    pub fn status(&self) -> PollerStatus {
        let stats = &self.inner.stats;
        PollerStatus {
            running: self.is_running(),
            total_ticks: stats.ticks.load(Ordering::Relaxed),
            skipped_ticks: stats.skipped_ticks.load(Ordering::Relaxed),
            total_triggered: stats.triggered.load(Ordering::Relaxed),
            total_failed: stats.failed.load(Ordering::Relaxed),
            last_tick_at: *self.inner.last_tick_at.read(),
        }
    }
}

impl PollerInner {
    async fn tick(
        &self,
        now: DateTime<Utc>,
        _permit: InFlightPermit,
    ) -> TaskerResult<PollTickReport> {
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);
        *self.last_tick_at.write() = Some(now);

        let pollers = self.pollers.list_enabled().await?;
        let mut report = PollTickReport::default();

        for state in &pollers {
            report.examined += 1;
            if !state.is_due(now) {
                report.not_due += 1;
                continue;
            }
            let outcome = self.poll(state, now).await;
            report.record(outcome);
        }

        self.stats
            .triggered
            .fetch_add(report.triggered() as u64, Ordering::Relaxed);
        self.stats
            .failed
            .fetch_add(report.failed as u64, Ordering::Relaxed);

        debug!(
            examined = report.examined,
            triggered = report.triggered(),
            failed = report.failed,
            "Poller tick complete"
        );
        Ok(report)
    }

    async fn poll(&self, state: &PollerState, now: DateTime<Utc>) -> PollOutcome {
        match self.workflows.get_workflow(&state.flow_id).await {
            Ok(Some(workflow)) if workflow.enabled => {}
            Ok(_) => {
                debug!(
                    poller_id = %state.poller_id,
                    flow_id = %state.flow_id,
                    "Workflow missing or disabled; poller skipped"
                );
                return PollOutcome::SkippedWorkflow;
            }
            Err(e) => {
                let message = format!("workflow lookup failed: {e}");
                return self.record_error(state, &message, now).await;
            }
        }

        let mut payload = Map::new();
        payload.insert(
            payload_keys::POLLER_ID.to_string(),
            Value::String(state.poller_id.clone()),
        );

        let result = self
            .executor
            .execute_flow(
                &state.flow_id,
                Value::Object(payload),
                TriggerType::Poller,
                false,
            )
            .await;

        match result {
            Ok(run) if run.status.is_completed() => {
                debug!(poller_id = %state.poller_id, run_id = %run.id, "Poller run completed");
                self.mark_processed(state, now, PollOutcome::Succeeded).await
            }
            Ok(run) => {
                let message = format!("flow run {} finished with status {}", run.id, run.status);
                self.record_error(state, &message, now).await
            }
            Err(e) if e.is_no_new_data() => {
                debug!(poller_id = %state.poller_id, reason = %e, "Poller found no new data");
                self.mark_processed(state, now, PollOutcome::NoNewData).await
            }
            Err(e) => self.record_error(state, &e.to_string(), now).await,
        }
    }

    async fn mark_processed(
        &self,
        state: &PollerState,
        now: DateTime<Utc>,
        outcome: PollOutcome,
    ) -> PollOutcome {
        match self.pollers.mark_processed(&state.poller_id, now).await {
            Ok(()) => outcome,
            Err(e) => {
                error!(
                    poller_id = %state.poller_id,
                    error = %e,
                    "Failed to mark poller processed"
                );
                PollOutcome::Failed
            }
        }
    }

    async fn record_error(
        &self,
        state: &PollerState,
        message: &str,
        now: DateTime<Utc>,
    ) -> PollOutcome {
        warn!(
            poller_id = %state.poller_id,
            flow_id = %state.flow_id,
            error = %message,
            "Poller run failed"
        );
        if let Err(e) = self.pollers.record_error(&state.poller_id, message, now).await {
            error!(
                poller_id = %state.poller_id,
                error = %e,
                "Failed to record poller error"
            );
        }
        PollOutcome::Failed
    }
}

async fn run_tick_timer(inner: Arc<PollerInner>, mut shutdown_rx: oneshot::Receiver<()>) {
    let mut interval = tokio::time::interval(inner.config.tick_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ticks = JoinSet::new();

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            _ = interval.tick() => {}
        }

        while let Some(finished) = ticks.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Poller tick panicked");
            }
        }

        let Some(permit) = inner.guard.try_acquire() else {
            inner.stats.skipped_ticks.fetch_add(1, Ordering::Relaxed);
            warn!("Previous poller tick still running; skipping");
            continue;
        };

        let inner = Arc::clone(&inner);
        ticks.spawn(async move {
            if let Err(e) = inner.tick(Utc::now(), permit).await {
                error!(error = %e, "Poller tick failed");
            }
        });
    }

    while let Some(finished) = ticks.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Poller tick panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::in_memory::{
        InMemoryPollerStateRepository, InMemoryWorkflowRepository, RecordingFlowExecutor,
    };
    use crate::orchestration::WorkflowDefinition;
    use std::time::Duration;

    fn daemon(executor: Arc<RecordingFlowExecutor>) -> PollerDaemon {
        let pollers = Arc::new(InMemoryPollerStateRepository::with_states([
            PollerState::new("p1", "wf-1", "n1", 1),
        ]));
        let workflows = Arc::new(InMemoryWorkflowRepository::with_workflows([
            WorkflowDefinition {
                id: "wf-1".to_string(),
                name: "Inbox".to_string(),
                enabled: true,
                nodes: vec![],
            },
        ]));
        PollerDaemon::new(pollers, workflows, executor, PollerDaemonConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_follow_interval() {
        let executor = Arc::new(RecordingFlowExecutor::new());
        let poller = daemon(executor.clone());

        poller.start();
        tokio::time::sleep(Duration::from_secs(185)).await;
        poller.stop().await;

        let status = poller.status();
        assert_eq!(status.total_ticks, 4);
        assert_eq!(status.skipped_ticks, 0);
        assert!(!status.running);
        // Wall-clock gating: only the first tick finds the poller due
        assert_eq!(executor.invocations().len(), 1);
    }

    #[tokio::test]
    async fn test_tick_report_counts() {
        let poller = daemon(Arc::new(RecordingFlowExecutor::new()));

        let report = tokio_test::assert_ok!(poller.run_tick(Utc::now()).await);
        assert_eq!(report.examined, 1);
        assert_eq!(report.triggered(), 1);

        let again = tokio_test::assert_ok!(poller.run_tick(Utc::now()).await);
        assert_eq!(again.not_due, 1);
        assert_eq!(again.triggered(), 0);
    }
}
