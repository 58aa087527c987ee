//! # Poller Daemon Tests
//!
//! Interval gating, outcome classification and the no-overlap rule of the
//! fixed-tick poller.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};

use common::{wait_until, workflow, ScriptedFlowExecutor};
use tasker_dispatch::config::PollerDaemonConfig;
use tasker_dispatch::orchestration::in_memory::{
    InMemoryPollerStateRepository, InMemoryWorkflowRepository,
};
use tasker_dispatch::orchestration::{
    FlowExecutionError, FlowRunStatus, PollerState, TriggerType, WorkflowDefinition,
    WorkflowRepository,
};
use tasker_dispatch::scheduling::PollerDaemon;
use tasker_dispatch::{TaskerError, TaskerResult};

struct Fixture {
    pollers: Arc<InMemoryPollerStateRepository>,
    workflows: Arc<InMemoryWorkflowRepository>,
    executor: Arc<ScriptedFlowExecutor>,
    daemon: PollerDaemon,
}

fn fixture(states: Vec<PollerState>, executor: ScriptedFlowExecutor) -> Fixture {
    let pollers = Arc::new(InMemoryPollerStateRepository::with_states(states));
    let workflows = Arc::new(InMemoryWorkflowRepository::with_workflows([
        workflow("wf-inbox", vec![]),
        workflow("wf-orders", vec![]),
    ]));
    let executor = Arc::new(executor);
    let daemon = PollerDaemon::new(
        pollers.clone(),
        workflows.clone(),
        executor.clone(),
        PollerDaemonConfig::default(),
    );
    Fixture {
        pollers,
        workflows,
        executor,
        daemon,
    }
}

/// Workflow store that is unreachable for one flow id
struct FlakyWorkflowRepository {
    inner: InMemoryWorkflowRepository,
    broken_flow: &'static str,
}

#[async_trait]
impl WorkflowRepository for FlakyWorkflowRepository {
    async fn list_enabled_workflows(&self) -> TaskerResult<Vec<WorkflowDefinition>> {
        self.inner.list_enabled_workflows().await
    }

    async fn get_workflow(&self, flow_id: &str) -> TaskerResult<Option<WorkflowDefinition>> {
        if flow_id == self.broken_flow {
            return Err(TaskerError::RepositoryError("connection reset".to_string()));
        }
        self.inner.get_workflow(flow_id).await
    }
}

fn processed_ago(mut state: PollerState, minutes: i64) -> PollerState {
    state.last_processed_at = Some(Utc::now() - ChronoDuration::minutes(minutes));
    state
}

#[tokio::test]
async fn test_only_due_pollers_trigger() {
    let f = fixture(
        vec![
            PollerState::new("never-ran", "wf-inbox", "n1", 5),
            processed_ago(PollerState::new("recent", "wf-inbox", "n2", 5), 2),
            processed_ago(PollerState::new("overdue", "wf-orders", "n3", 5), 6),
        ],
        ScriptedFlowExecutor::new(),
    );

    let now = Utc::now();
    let report = f.daemon.run_tick(now).await.expect("tick");

    assert_eq!(report.examined, 3);
    assert_eq!(report.not_due, 1);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.triggered(), 2);

    let calls = f.executor.invocations();
    let polled: Vec<&str> = calls
        .iter()
        .map(|c| c.payload["pollerId"].as_str().expect("pollerId"))
        .collect();
    assert_eq!(polled, vec!["never-ran", "overdue"]);
    assert!(calls.iter().all(|c| c.trigger_type == TriggerType::Poller && !c.dry_run));

    assert_eq!(
        f.pollers.get("overdue").and_then(|s| s.last_processed_at),
        Some(now)
    );
}

#[tokio::test]
async fn test_no_new_data_counts_as_processed() {
    let executor = ScriptedFlowExecutor::new();
    executor.script(
        "wf-inbox",
        vec![
            Err(FlowExecutionError::NoNewData("inbox empty".into())),
            Err(FlowExecutionError::Failed("No new files detected".into())),
        ],
    );
    let f = fixture(
        vec![
            PollerState::new("typed", "wf-inbox", "n1", 5),
            PollerState::new("textual", "wf-inbox", "n2", 5),
        ],
        executor,
    );

    let now = Utc::now();
    let report = f.daemon.run_tick(now).await.expect("tick");

    assert_eq!(report.no_new_data, 2);
    assert_eq!(report.failed, 0);
    for id in ["typed", "textual"] {
        let state = f.pollers.get(id).expect("state");
        assert_eq!(state.last_processed_at, Some(now));
        assert!(state.last_error.is_none());
    }
}

#[tokio::test]
async fn test_failure_records_error_and_retries_next_tick() {
    let executor = ScriptedFlowExecutor::new();
    executor.script(
        "wf-orders",
        vec![
            Err(FlowExecutionError::Unavailable("engine down".into())),
            Ok(FlowRunStatus::Failed),
        ],
    );
    let f = fixture(
        vec![processed_ago(PollerState::new("orders", "wf-orders", "n1", 5), 10)],
        executor,
    );
    let original = f.pollers.get("orders").and_then(|s| s.last_processed_at);

    let first = f.daemon.run_tick(Utc::now()).await.expect("first tick");
    assert_eq!(first.failed, 1);
    let state = f.pollers.get("orders").expect("state");
    assert_eq!(state.last_processed_at, original);
    assert!(state
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("engine down")));

    let second = f.daemon.run_tick(Utc::now()).await.expect("second tick");
    assert_eq!(second.failed, 1, "non-completed run is a failure");
    assert!(f
        .pollers
        .get("orders")
        .and_then(|s| s.last_error)
        .is_some_and(|e| e.contains("failed")));

    let third = f.daemon.run_tick(Utc::now()).await.expect("third tick");
    assert_eq!(third.succeeded, 1);
    assert!(f.pollers.get("orders").expect("state").last_error.is_none());
    assert_eq!(f.executor.invocation_count(), 3);
}

#[tokio::test]
async fn test_one_failing_poller_does_not_block_the_others() {
    let executor = ScriptedFlowExecutor::new();
    executor.script(
        "wf-orders",
        vec![Err(FlowExecutionError::Unavailable("engine down".into()))],
    );
    let f = fixture(
        vec![
            processed_ago(PollerState::new("first", "wf-inbox", "n1", 5), 10),
            processed_ago(PollerState::new("second", "wf-orders", "n2", 5), 10),
            processed_ago(PollerState::new("third", "wf-inbox", "n3", 5), 10),
        ],
        executor,
    );
    let second_before = f.pollers.get("second").and_then(|s| s.last_processed_at);

    let now = Utc::now();
    let report = f.daemon.run_tick(now).await.expect("tick");

    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(f.executor.invocation_count(), 3);

    for id in ["first", "third"] {
        let state = f.pollers.get(id).expect("state");
        assert_eq!(state.last_processed_at, Some(now));
        assert!(state.last_error.is_none());
    }
    let second = f.pollers.get("second").expect("state");
    assert_eq!(second.last_processed_at, second_before);
    assert!(second
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("engine down")));
    assert_eq!(second.last_error_at, Some(now));
}

#[tokio::test]
async fn test_workflow_lookup_error_is_recorded() {
    let pollers = Arc::new(InMemoryPollerStateRepository::with_states([
        PollerState::new("broken", "wf-orders", "n1", 5),
        PollerState::new("healthy", "wf-inbox", "n2", 5),
    ]));
    let workflows = Arc::new(FlakyWorkflowRepository {
        inner: InMemoryWorkflowRepository::with_workflows([
            workflow("wf-inbox", vec![]),
            workflow("wf-orders", vec![]),
        ]),
        broken_flow: "wf-orders",
    });
    let executor = Arc::new(ScriptedFlowExecutor::new());
    let daemon = PollerDaemon::new(
        pollers.clone(),
        workflows,
        executor.clone(),
        PollerDaemonConfig::default(),
    );

    let now = Utc::now();
    let report = daemon.run_tick(now).await.expect("tick");

    assert_eq!(report.failed, 1);
    assert_eq!(report.skipped_workflow, 0);
    assert_eq!(report.succeeded, 1);
    assert_eq!(executor.invocation_count(), 1);

    let broken = pollers.get("broken").expect("state");
    assert!(broken.last_processed_at.is_none());
    assert!(broken
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("connection reset")));
}

#[tokio::test]
async fn test_missing_or_disabled_workflow_is_skipped() {
    let f = fixture(
        vec![
            PollerState::new("orphan", "wf-deleted", "n1", 5),
            PollerState::new("paused", "wf-inbox", "n2", 5),
        ],
        ScriptedFlowExecutor::new(),
    );
    let mut paused = workflow("wf-inbox", vec![]);
    paused.enabled = false;
    f.workflows.upsert(paused);

    let report = f.daemon.run_tick(Utc::now()).await.expect("tick");

    assert_eq!(report.skipped_workflow, 2);
    assert_eq!(report.triggered(), 0);
    assert_eq!(f.executor.invocation_count(), 0);
    assert!(f.pollers.get("orphan").expect("state").last_processed_at.is_none());
}

#[tokio::test]
async fn test_ticks_never_overlap() {
    let f = fixture(
        vec![PollerState::new("slow", "wf-inbox", "n1", 1)],
        ScriptedFlowExecutor::with_delay(Duration::from_millis(300)),
    );

    let running = {
        let daemon = f.daemon.clone();
        tokio::spawn(async move { daemon.run_tick(Utc::now()).await })
    };
    assert!(wait_until(Duration::from_secs(1), || f.executor.invocation_count() == 1).await);

    assert!(matches!(
        f.daemon.run_tick(Utc::now()).await,
        Err(TaskerError::InvalidState(_))
    ));
    let report = running.await.expect("join").expect("tick");
    assert_eq!(report.succeeded, 1);
}

#[tokio::test]
async fn test_start_runs_first_tick_immediately() {
    let f = fixture(
        vec![PollerState::new("p1", "wf-inbox", "n1", 5)],
        ScriptedFlowExecutor::new(),
    );

    f.daemon.start();
    f.daemon.start();
    assert!(f.daemon.is_running());
    assert!(wait_until(Duration::from_secs(2), || f.executor.invocation_count() == 1).await);

    f.daemon.stop().await;
    assert!(!f.daemon.is_running());

    let status = f.daemon.status();
    assert_eq!(status.total_ticks, 1);
    assert_eq!(status.total_triggered, 1);
    assert!(status.last_tick_at.is_some());
}
