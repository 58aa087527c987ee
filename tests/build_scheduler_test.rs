//! # Deployment Build Tests
//!
//! The daily fan-out of build jobs and the worker that consumes them on the
//! in-memory backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use common::{fast_retry, in_memory_manager, in_memory_service, wait_until, FlakyBuildRunner};
use tasker_dispatch::config::DeploymentBuildConfig;
use tasker_dispatch::deployment::{
    BuildRequest, BuildTrigger, DeploymentBuildScheduler, DeploymentBuildWorker, OperatorAccount,
    ScheduledBuildPreference,
};
use tasker_dispatch::messaging::{EnqueueOptions, QueueBackendKind, QueueManager};
use tasker_dispatch::orchestration::in_memory::InMemoryOperatorRepository;
use tasker_dispatch::TaskerError;

const TOPIC: &str = "deployment-builds-test";

fn build_config() -> DeploymentBuildConfig {
    DeploymentBuildConfig {
        topic: TOPIC.to_string(),
        worker_concurrency: 1,
        ..DeploymentBuildConfig::default()
    }
}

fn operator(id: &str, enabled: bool, targets: &[&str]) -> OperatorAccount {
    OperatorAccount {
        id: id.to_string(),
        name: format!("Operator {id}"),
        scheduled_builds: Some(ScheduledBuildPreference {
            enabled,
            targets: targets.iter().map(|t| t.to_string()).collect(),
        }),
    }
}

fn scheduler(manager: Arc<QueueManager>) -> DeploymentBuildScheduler {
    let operators = Arc::new(InMemoryOperatorRepository::new(vec![
        operator("op-1", true, &["production", "staging"]),
        operator("op-2", false, &["production"]),
        operator("op-3", true, &["production"]),
        OperatorAccount {
            id: "op-4".to_string(),
            name: "No preference".to_string(),
            scheduled_builds: None,
        },
    ]));
    DeploymentBuildScheduler::new(operators, manager, build_config()).expect("valid cron")
}

#[tokio::test]
async fn test_scan_enqueues_one_job_per_enabled_target() {
    let manager = in_memory_manager(fast_retry(3)).await;
    let builds = scheduler(Arc::clone(&manager));

    let now = Utc::now();
    let report = builds.run_scan(now).await.expect("scan");

    assert_eq!(report.operators, 2);
    assert_eq!(report.scheduled, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(
        manager.provider().expect("provider").depth(TOPIC).await.expect("depth"),
        3
    );

    let status = builds.status();
    assert_eq!(status.total_builds_scheduled, 3);
    assert_eq!(status.enqueue_failures, 0);
    assert_eq!(status.last_scan_at, Some(now));
    assert!(status.next_run_at.is_some_and(|next| next > now));
    assert!(!status.running);
}

#[tokio::test]
async fn test_enqueue_failures_are_counted_not_fatal() {
    let manager = in_memory_manager(fast_retry(3)).await;
    let builds = scheduler(Arc::clone(&manager));
    manager.close().await.expect("close");

    let report = builds.run_scan(Utc::now()).await.expect("scan still completes");

    assert_eq!(report.scheduled, 0);
    assert_eq!(report.failed, 3);
    assert_eq!(builds.status().enqueue_failures, 3);
}

#[tokio::test]
async fn test_invalid_cron_is_rejected_at_construction() {
    let manager = in_memory_manager(fast_retry(3)).await;
    let config = DeploymentBuildConfig {
        cron: "nightly".to_string(),
        ..build_config()
    };

    let result = DeploymentBuildScheduler::new(
        Arc::new(InMemoryOperatorRepository::default()),
        manager,
        config,
    );
    assert!(matches!(result, Err(TaskerError::SchedulingError(_))));
}

#[tokio::test]
async fn test_start_stop_is_idempotent() {
    let manager = in_memory_manager(fast_retry(3)).await;
    let builds = scheduler(manager);

    builds.start();
    builds.start();
    assert!(builds.is_running());
    builds.stop().await;
    builds.stop().await;
    assert!(!builds.is_running());
}

#[tokio::test]
async fn test_worker_acks_successful_builds() {
    let manager = in_memory_manager(fast_retry(3)).await;
    let runner = Arc::new(FlakyBuildRunner::failing_first(0));
    let worker = DeploymentBuildWorker::new(Arc::clone(&manager), runner.clone(), build_config());
    worker.start().await.expect("start");

    scheduler(Arc::clone(&manager))
        .run_scan(Utc::now())
        .await
        .expect("scan");

    assert!(wait_until(Duration::from_secs(3), || runner.attempt_count() == 3).await);
    worker.stop().await.expect("stop");

    let attempts = runner.attempts();
    assert!(attempts.iter().all(|r| r.trigger == BuildTrigger::Scheduled));
    assert!(attempts
        .iter()
        .any(|r| r.operator_id == "op-1" && r.target == "staging"));

    let status = worker.status().await;
    assert_eq!(status.builds_succeeded, 3);
    assert_eq!(status.builds_retried, 0);
    assert!(!status.consuming);
    assert!(in_memory_service(&manager).dead_letters(TOPIC).is_empty());
}

#[tokio::test]
async fn test_worker_retries_then_succeeds() {
    let manager = in_memory_manager(fast_retry(3)).await;
    let runner = Arc::new(FlakyBuildRunner::failing_first(2));
    let worker = DeploymentBuildWorker::new(Arc::clone(&manager), runner.clone(), build_config());
    worker.start().await.expect("start");

    let request = BuildRequest::scheduled("op-9", "production", Utc::now());
    manager
        .enqueue_payload(
            TOPIC,
            serde_json::to_string(&request).expect("serialize"),
            &EnqueueOptions::default(),
        )
        .await
        .expect("enqueue");

    assert!(wait_until(Duration::from_secs(3), || runner.attempt_count() == 3).await);
    worker.stop().await.expect("stop");

    let status = worker.status().await;
    assert_eq!(status.builds_retried, 2);
    assert_eq!(status.builds_succeeded, 1);
    assert_eq!(status.builds_dead_lettered, 0);
}

#[tokio::test]
async fn test_worker_dead_letters_when_retries_run_out() {
    let manager = in_memory_manager(fast_retry(2)).await;
    let runner = Arc::new(FlakyBuildRunner::always_failing());
    let worker = DeploymentBuildWorker::new(Arc::clone(&manager), runner.clone(), build_config());
    worker.start().await.expect("start");

    manager
        .enqueue_payload(
            TOPIC,
            serde_json::to_string(&BuildRequest::scheduled("op-1", "production", Utc::now()))
                .expect("serialize"),
            &EnqueueOptions::default(),
        )
        .await
        .expect("enqueue");
    manager
        .enqueue_payload(TOPIC, "not a build request", &EnqueueOptions::default())
        .await
        .expect("enqueue");

    let service = in_memory_service(&manager);
    assert!(wait_until(Duration::from_secs(3), || service.dead_letters(TOPIC).len() == 2).await);
    worker.stop().await.expect("stop");

    assert_eq!(runner.attempt_count(), 3, "initial attempt plus two retries");
    let status = worker.status().await;
    assert_eq!(status.builds_retried, 2);
    assert_eq!(status.builds_dead_lettered, 2);
}

#[tokio::test]
async fn test_worker_follows_backend_switch() {
    let manager = in_memory_manager(fast_retry(3)).await;
    let runner = Arc::new(FlakyBuildRunner::failing_first(0));
    let worker = DeploymentBuildWorker::new(Arc::clone(&manager), runner.clone(), build_config());
    worker.start().await.expect("start");

    manager
        .switch_backend(QueueBackendKind::InMemory)
        .await
        .expect("switch");
    manager
        .enqueue_payload(
            TOPIC,
            serde_json::to_string(&BuildRequest::scheduled("op-1", "production", Utc::now()))
                .expect("serialize"),
            &EnqueueOptions::default(),
        )
        .await
        .expect("enqueue on the new backend");

    assert!(wait_until(Duration::from_secs(3), || runner.attempt_count() == 1).await);

    assert!(worker.status().await.consuming);
    worker.stop().await.expect("stop");

    let status = worker.status().await;
    assert!(!status.consuming);
    assert_eq!(status.resubscriptions, 1);
    assert_eq!(status.builds_succeeded, 1);
}
