//! Shared fixtures for the integration tests.

#![allow(dead_code)] // Each test binary uses a different subset

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use tasker_dispatch::config::{QueueConfig, RetryDefaultsConfig};
use tasker_dispatch::deployment::BuildRequest;
use tasker_dispatch::messaging::{InMemoryQueueService, QueueBackendKind, QueueManager, QueueProvider};
use tasker_dispatch::orchestration::in_memory::{
    FlowInvocation, InMemoryQueueSettingsStore, InMemorySecretStore,
};
use tasker_dispatch::orchestration::{
    BuildRunner, FlowExecutionError, FlowExecutor, FlowNode, FlowRun, FlowRunStatus, NodeKind,
    TriggerType, WorkflowDefinition,
};

type ScriptedResponse = Result<FlowRunStatus, FlowExecutionError>;

/// Flow executor that replays scripted results per flow and records every call
///
/// Flows without a script (or whose script ran out) complete immediately.
#[derive(Default)]
pub struct ScriptedFlowExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedResponse>>>,
    invocations: Mutex<Vec<FlowInvocation>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedFlowExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call takes `delay` before answering
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn script(&self, flow_id: &str, responses: Vec<ScriptedResponse>) {
        self.scripts
            .lock()
            .entry(flow_id.to_string())
            .or_default()
            .extend(responses);
    }

    pub fn invocations(&self) -> Vec<FlowInvocation> {
        self.invocations.lock().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().len()
    }

    /// Highest number of calls that were running at once
    pub fn max_concurrent(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FlowExecutor for ScriptedFlowExecutor {
    async fn execute_flow(
        &self,
        flow_id: &str,
        trigger_payload: Value,
        trigger_type: TriggerType,
        dry_run: bool,
    ) -> Result<FlowRun, FlowExecutionError> {
        self.invocations.lock().push(FlowInvocation {
            flow_id: flow_id.to_string(),
            payload: trigger_payload,
            trigger_type,
            dry_run,
        });

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .get_mut(flow_id)
            .and_then(VecDeque::pop_front);
        match scripted.unwrap_or(Ok(FlowRunStatus::Completed)) {
            Ok(status) => Ok(FlowRun::new(flow_id, status)),
            Err(e) => Err(e),
        }
    }
}

/// Build runner that fails the first `failures` attempts of every request
pub struct FlakyBuildRunner {
    failures: usize,
    attempts: Mutex<Vec<BuildRequest>>,
}

impl FlakyBuildRunner {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures,
            attempts: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing_first(usize::MAX)
    }

    pub fn attempts(&self) -> Vec<BuildRequest> {
        self.attempts.lock().clone()
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.lock().len()
    }
}

#[async_trait]
impl BuildRunner for FlakyBuildRunner {
    async fn run_build(&self, request: &BuildRequest) -> anyhow::Result<()> {
        let previous = {
            let mut attempts = self.attempts.lock();
            let previous = attempts
                .iter()
                .filter(|r| r.operator_id == request.operator_id && r.target == request.target)
                .count();
            attempts.push(request.clone());
            previous
        };

        if previous < self.failures {
            anyhow::bail!("build {} for {} failed", request.target, request.operator_id);
        }
        Ok(())
    }
}

pub fn scheduler_node(node_id: &str, cron: &str) -> FlowNode {
    FlowNode {
        id: node_id.to_string(),
        kind: NodeKind::Scheduler,
        config: json!({ "cron": cron }),
        enabled: true,
    }
}

pub fn workflow(flow_id: &str, nodes: Vec<FlowNode>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: flow_id.to_string(),
        name: format!("{flow_id} workflow"),
        enabled: true,
        nodes,
    }
}

/// Short retry interval so retried deliveries come back within a test
pub fn fast_retry(max_retries: u32) -> RetryDefaultsConfig {
    RetryDefaultsConfig {
        max_retries,
        retry_interval_ms: 20,
    }
}

/// Initialized manager running the in-memory backend
pub async fn in_memory_manager(retry: RetryDefaultsConfig) -> Arc<QueueManager> {
    let config = QueueConfig {
        backend: QueueBackendKind::InMemory,
        retry,
        ..QueueConfig::default()
    };
    let manager = Arc::new(QueueManager::new(
        config,
        Arc::new(InMemoryQueueSettingsStore::new(None)),
        Arc::new(InMemorySecretStore::new()),
    ));
    manager.initialize().await.expect("in-memory backend initializes");
    manager
}

/// The in-memory service behind `manager`
pub fn in_memory_service(manager: &QueueManager) -> InMemoryQueueService {
    match manager.provider().expect("manager initialized") {
        QueueProvider::InMemory(service) => service,
        other => panic!("expected in-memory backend, got {}", other.provider_name()),
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .is_ok()
}
