//! In-process implementations of the orchestration ports.
//!
//! Backing store for tests and for running the dispatcher standalone. None
//! of these persist anything.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::info;

use super::ports::{
    BuildRunner, FlowExecutor, OperatorRepository, PollerStateRepository, QueueSettingsStore,
    SecretStore, WorkflowRepository,
};
use super::types::{
    FlowExecutionError, FlowRun, FlowRunStatus, PollerState, QueueSettings, TriggerType,
    WorkflowDefinition,
};
use crate::deployment::types::{BuildRequest, OperatorAccount};
use crate::error::{TaskerError, TaskerResult};

#[derive(Debug, Default)]
pub struct InMemoryWorkflowRepository {
    workflows: RwLock<HashMap<String, WorkflowDefinition>>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflows(workflows: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        let repo = Self::new();
        for workflow in workflows {
            repo.upsert(workflow);
        }
        repo
    }

    pub fn upsert(&self, workflow: WorkflowDefinition) {
        self.workflows.write().insert(workflow.id.clone(), workflow);
    }

    pub fn remove(&self, flow_id: &str) -> Option<WorkflowDefinition> {
        self.workflows.write().remove(flow_id)
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn list_enabled_workflows(&self) -> TaskerResult<Vec<WorkflowDefinition>> {
        let mut workflows: Vec<WorkflowDefinition> = self
            .workflows
            .read()
            .values()
            .filter(|w| w.enabled)
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workflows)
    }

    async fn get_workflow(&self, flow_id: &str) -> TaskerResult<Option<WorkflowDefinition>> {
        Ok(self.workflows.read().get(flow_id).cloned())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPollerStateRepository {
    states: RwLock<HashMap<String, PollerState>>,
}

impl InMemoryPollerStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_states(states: impl IntoIterator<Item = PollerState>) -> Self {
        let repo = Self::new();
        for state in states {
            repo.insert(state);
        }
        repo
    }

    pub fn insert(&self, state: PollerState) {
        self.states.write().insert(state.poller_id.clone(), state);
    }

    pub fn get(&self, poller_id: &str) -> Option<PollerState> {
        self.states.read().get(poller_id).cloned()
    }
}

#[async_trait]
impl PollerStateRepository for InMemoryPollerStateRepository {
    async fn list_enabled(&self) -> TaskerResult<Vec<PollerState>> {
        let mut states: Vec<PollerState> = self
            .states
            .read()
            .values()
            .filter(|s| s.enabled)
            .cloned()
            .collect();
        states.sort_by(|a, b| a.poller_id.cmp(&b.poller_id));
        Ok(states)
    }

    async fn mark_processed(&self, poller_id: &str, at: DateTime<Utc>) -> TaskerResult<()> {
        let mut states = self.states.write();
        let state = states.get_mut(poller_id).ok_or_else(|| {
            TaskerError::RepositoryError(format!("unknown poller '{poller_id}'"))
        })?;

        state.last_processed_at = Some(state.last_processed_at.map_or(at, |prev| prev.max(at)));
        state.last_error = None;
        state.last_error_at = None;
        Ok(())
    }

    async fn record_error(
        &self,
        poller_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> TaskerResult<()> {
        let mut states = self.states.write();
        let state = states.get_mut(poller_id).ok_or_else(|| {
            TaskerError::RepositoryError(format!("unknown poller '{poller_id}'"))
        })?;

        state.last_error = Some(message.to_string());
        state.last_error_at = Some(at);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOperatorRepository {
    operators: RwLock<Vec<OperatorAccount>>,
}

impl InMemoryOperatorRepository {
    pub fn new(operators: Vec<OperatorAccount>) -> Self {
        Self {
            operators: RwLock::new(operators),
        }
    }

    pub fn push(&self, operator: OperatorAccount) {
        self.operators.write().push(operator);
    }
}

#[async_trait]
impl OperatorRepository for InMemoryOperatorRepository {
    async fn list_scheduled_build_operators(&self) -> TaskerResult<Vec<OperatorAccount>> {
        Ok(self
            .operators
            .read()
            .iter()
            .filter(|op| op.scheduled_builds.as_ref().is_some_and(|pref| pref.enabled))
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryQueueSettingsStore {
    settings: RwLock<Option<QueueSettings>>,
    failures: RwLock<Vec<(String, DateTime<Utc>)>>,
}

impl InMemoryQueueSettingsStore {
    pub fn new(settings: Option<QueueSettings>) -> Self {
        Self {
            settings: RwLock::new(settings),
            failures: RwLock::new(Vec::new()),
        }
    }

    pub fn set(&self, settings: Option<QueueSettings>) {
        *self.settings.write() = settings;
    }

    /// Failure reasons recorded so far, oldest first
    pub fn failures(&self) -> Vec<String> {
        self.failures.read().iter().map(|(r, _)| r.clone()).collect()
    }
}

#[async_trait]
impl QueueSettingsStore for InMemoryQueueSettingsStore {
    async fn load(&self) -> TaskerResult<Option<QueueSettings>> {
        Ok(self.settings.read().clone())
    }

    async fn record_failure(&self, reason: &str, at: DateTime<Utc>) -> TaskerResult<()> {
        if let Some(settings) = self.settings.write().as_mut() {
            settings.last_error = Some(reason.to_string());
            settings.last_error_at = Some(at);
        }
        self.failures.write().push((reason.to_string(), at));
        Ok(())
    }
}

/// Lookup table from ciphertext to plaintext
#[derive(Debug, Default)]
pub struct InMemorySecretStore {
    secrets: RwLock<HashMap<String, String>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ciphertext: impl Into<String>, plaintext: impl Into<String>) {
        self.secrets.write().insert(ciphertext.into(), plaintext.into());
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn decrypt(&self, ciphertext: &str) -> TaskerResult<String> {
        self.secrets
            .read()
            .get(ciphertext)
            .cloned()
            .ok_or_else(|| TaskerError::ConfigurationError("unable to decrypt secret".to_string()))
    }
}

/// Recorded `execute_flow` call
#[derive(Debug, Clone, PartialEq)]
pub struct FlowInvocation {
    pub flow_id: String,
    pub payload: Value,
    pub trigger_type: TriggerType,
    pub dry_run: bool,
}

/// Executor that completes every flow immediately and remembers the calls
#[derive(Debug, Default)]
pub struct RecordingFlowExecutor {
    invocations: RwLock<Vec<FlowInvocation>>,
}

impl RecordingFlowExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<FlowInvocation> {
        self.invocations.read().clone()
    }
}

#[async_trait]
impl FlowExecutor for RecordingFlowExecutor {
    async fn execute_flow(
        &self,
        flow_id: &str,
        trigger_payload: Value,
        trigger_type: TriggerType,
        dry_run: bool,
    ) -> Result<FlowRun, FlowExecutionError> {
        info!(flow_id = %flow_id, trigger = %trigger_type, dry_run, "Flow triggered");
        self.invocations.write().push(FlowInvocation {
            flow_id: flow_id.to_string(),
            payload: trigger_payload,
            trigger_type,
            dry_run,
        });
        Ok(FlowRun::new(flow_id, FlowRunStatus::Completed))
    }
}

/// Build runner that logs and records every request
#[derive(Debug, Default)]
pub struct RecordingBuildRunner {
    builds: RwLock<Vec<BuildRequest>>,
}

impl RecordingBuildRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builds(&self) -> Vec<BuildRequest> {
        self.builds.read().clone()
    }
}

#[async_trait]
impl BuildRunner for RecordingBuildRunner {
    async fn run_build(&self, request: &BuildRequest) -> anyhow::Result<()> {
        info!(
            operator_id = %request.operator_id,
            target = %request.target,
            trigger = %request.trigger,
            "Running deployment build"
        );
        self.builds.write().push(request.clone());
        Ok(())
    }
}
