//! # Scheduler Daemon Tests
//!
//! Job registration from workflow definitions, idempotent refresh, fire
//! payloads and the per-job overlap guard.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;

use common::{scheduler_node, wait_until, workflow, ScriptedFlowExecutor};
use tasker_dispatch::config::SchedulerDaemonConfig;
use tasker_dispatch::orchestration::in_memory::InMemoryWorkflowRepository;
use tasker_dispatch::orchestration::TriggerType;
use tasker_dispatch::scheduling::{JobKey, SchedulerDaemon};
use tasker_dispatch::TaskerError;

const NIGHTLY: &str = "0 0 3 * * *";
const EVERY_SECOND: &str = "* * * * * *";

fn daemon(
    repo: Arc<InMemoryWorkflowRepository>,
    executor: Arc<ScriptedFlowExecutor>,
) -> SchedulerDaemon {
    SchedulerDaemon::new(repo, executor, SchedulerDaemonConfig::default())
}

#[tokio::test]
async fn test_refresh_twice_yields_same_jobs() {
    let repo = Arc::new(InMemoryWorkflowRepository::with_workflows([
        workflow(
            "wf-a",
            vec![scheduler_node("s1", NIGHTLY), scheduler_node("s2", "*/5 * * * *")],
        ),
        workflow("wf-b", vec![scheduler_node("s1", NIGHTLY)]),
    ]));
    let scheduler = daemon(Arc::clone(&repo), Arc::new(ScriptedFlowExecutor::new()));

    scheduler.start().await.expect("start");
    let initial = scheduler.job_keys();
    assert_eq!(
        initial,
        vec![
            JobKey::new("wf-a", "s1"),
            JobKey::new("wf-a", "s2"),
            JobKey::new("wf-b", "s1"),
        ]
    );

    scheduler.refresh().await.expect("refresh");
    scheduler.refresh().await.expect("refresh again");
    assert_eq!(scheduler.job_keys(), initial);
    assert_eq!(scheduler.job_count(), 3);

    scheduler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_refresh_picks_up_definition_changes() {
    let repo = Arc::new(InMemoryWorkflowRepository::with_workflows([workflow(
        "wf-a",
        vec![scheduler_node("s1", NIGHTLY)],
    )]));
    let scheduler = daemon(Arc::clone(&repo), Arc::new(ScriptedFlowExecutor::new()));
    scheduler.start().await.expect("start");

    repo.remove("wf-a");
    let mut disabled = workflow("wf-off", vec![scheduler_node("s1", NIGHTLY)]);
    disabled.enabled = false;
    repo.upsert(disabled);
    repo.upsert(workflow("wf-new", vec![scheduler_node("s9", NIGHTLY)]));

    scheduler.refresh().await.expect("refresh");
    assert_eq!(scheduler.job_keys(), vec![JobKey::new("wf-new", "s9")]);

    scheduler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_fire_sends_scheduler_trigger_payload() {
    let repo = Arc::new(InMemoryWorkflowRepository::with_workflows([workflow(
        "wf-tick",
        vec![scheduler_node("every-second", EVERY_SECOND)],
    )]));
    let executor = Arc::new(ScriptedFlowExecutor::new());
    let scheduler = daemon(repo, Arc::clone(&executor));
    scheduler.start().await.expect("start");

    assert!(wait_until(Duration::from_secs(3), || executor.invocation_count() >= 1).await);
    scheduler.stop().await.expect("stop");

    let call = &executor.invocations()[0];
    assert_eq!(call.flow_id, "wf-tick");
    assert_eq!(call.trigger_type, TriggerType::Scheduler);
    assert!(!call.dry_run);
    assert_eq!(call.payload["nodeId"], "every-second");
    let scheduled = call.payload["scheduledTime"].as_str().expect("scheduledTime string");
    assert!(DateTime::parse_from_rfc3339(scheduled).is_ok());
    assert!(scheduler.status().total_fires >= 1);
}

#[tokio::test]
async fn test_slow_run_skips_overlapping_fires() {
    let repo = Arc::new(InMemoryWorkflowRepository::with_workflows([workflow(
        "wf-slow",
        vec![scheduler_node("every-second", EVERY_SECOND)],
    )]));
    let executor = Arc::new(ScriptedFlowExecutor::with_delay(Duration::from_millis(2500)));
    let scheduler = daemon(repo, Arc::clone(&executor));
    scheduler.start().await.expect("start");

    assert!(wait_until(Duration::from_secs(5), || scheduler.status().skipped_overlaps >= 1).await);
    scheduler.stop().await.expect("stop");

    assert_eq!(executor.max_concurrent(), 1);
}

#[tokio::test]
async fn test_trigger_now_respects_in_flight_guard() {
    let repo = Arc::new(InMemoryWorkflowRepository::with_workflows([workflow(
        "wf-manual",
        vec![scheduler_node("s1", NIGHTLY)],
    )]));
    let executor = Arc::new(ScriptedFlowExecutor::with_delay(Duration::from_millis(300)));
    let scheduler = daemon(repo, Arc::clone(&executor));
    scheduler.start().await.expect("start");

    let key = JobKey::new("wf-manual", "s1");
    let background = {
        let scheduler = scheduler.clone();
        let key = key.clone();
        tokio::spawn(async move { scheduler.trigger_now(&key).await })
    };
    assert!(wait_until(Duration::from_secs(1), || executor.invocation_count() == 1).await);

    assert!(!scheduler.trigger_now(&key).await.expect("second trigger"));
    assert!(background.await.expect("join").expect("first trigger"));
    assert!(scheduler.trigger_now(&key).await.expect("third trigger"));

    assert!(matches!(
        scheduler.trigger_now(&JobKey::new("wf-manual", "missing")).await,
        Err(TaskerError::SchedulingError(_))
    ));
    scheduler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_refresh_keeps_in_flight_guard() {
    let repo = Arc::new(InMemoryWorkflowRepository::with_workflows([workflow(
        "wf-manual",
        vec![scheduler_node("s1", NIGHTLY)],
    )]));
    let executor = Arc::new(ScriptedFlowExecutor::with_delay(Duration::from_millis(800)));
    let scheduler = daemon(repo, Arc::clone(&executor));
    scheduler.start().await.expect("start");

    let key = JobKey::new("wf-manual", "s1");
    let background = {
        let scheduler = scheduler.clone();
        let key = key.clone();
        tokio::spawn(async move { scheduler.trigger_now(&key).await })
    };
    assert!(wait_until(Duration::from_secs(1), || executor.invocation_count() == 1).await);

    scheduler.refresh().await.expect("refresh");
    assert!(
        !scheduler.trigger_now(&key).await.expect("trigger after refresh"),
        "run started before refresh still holds the job"
    );

    assert!(background.await.expect("join").expect("first trigger"));
    assert_eq!(executor.max_concurrent(), 1);
    scheduler.stop().await.expect("stop");
}

#[tokio::test]
async fn test_stop_then_restart() {
    let repo = Arc::new(InMemoryWorkflowRepository::with_workflows([workflow(
        "wf-a",
        vec![scheduler_node("s1", NIGHTLY)],
    )]));
    let scheduler = daemon(repo, Arc::new(ScriptedFlowExecutor::new()));

    scheduler.start().await.expect("start");
    scheduler.start().await.expect("second start is a no-op");
    assert_eq!(scheduler.job_count(), 1);

    scheduler.stop().await.expect("stop");
    scheduler.stop().await.expect("second stop is a no-op");
    assert!(!scheduler.is_running());
    assert!(matches!(
        scheduler.refresh().await,
        Err(TaskerError::InvalidState(_))
    ));

    scheduler.start().await.expect("restart");
    assert_eq!(scheduler.job_count(), 1);
    scheduler.stop().await.expect("stop");
}
