//! # Orchestration Ports
//!
//! Narrow interfaces to systems the dispatch subsystem does not own: the
//! workflow engine, the stores holding flow definitions, poller state,
//! operator accounts and queue settings, secret decryption and the build
//! runner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::types::{
    FlowExecutionError, FlowRun, PollerState, QueueSettings, TriggerType, WorkflowDefinition,
};
use crate::deployment::types::{BuildRequest, OperatorAccount};
use crate::error::TaskerResult;

/// The workflow engine's single entry point
#[async_trait]
pub trait FlowExecutor: Send + Sync + 'static {
    async fn execute_flow(
        &self,
        flow_id: &str,
        trigger_payload: Value,
        trigger_type: TriggerType,
        dry_run: bool,
    ) -> Result<FlowRun, FlowExecutionError>;
}

#[async_trait]
pub trait WorkflowRepository: Send + Sync + 'static {
    async fn list_enabled_workflows(&self) -> TaskerResult<Vec<WorkflowDefinition>>;

    async fn get_workflow(&self, flow_id: &str) -> TaskerResult<Option<WorkflowDefinition>>;
}

#[async_trait]
pub trait PollerStateRepository: Send + Sync + 'static {
    async fn list_enabled(&self) -> TaskerResult<Vec<PollerState>>;

    /// Record a successful poll and clear the last error
    ///
    /// `last_processed_at` must never move backwards.
    async fn mark_processed(&self, poller_id: &str, at: DateTime<Utc>) -> TaskerResult<()>;

    /// Record a failed poll; `last_processed_at` is left untouched
    async fn record_error(
        &self,
        poller_id: &str,
        message: &str,
        at: DateTime<Utc>,
    ) -> TaskerResult<()>;
}

#[async_trait]
pub trait OperatorRepository: Send + Sync + 'static {
    /// Operators whose scheduled-build preference is enabled
    async fn list_scheduled_build_operators(&self) -> TaskerResult<Vec<OperatorAccount>>;
}

#[async_trait]
pub trait QueueSettingsStore: Send + Sync + 'static {
    async fn load(&self) -> TaskerResult<Option<QueueSettings>>;

    async fn record_failure(&self, reason: &str, at: DateTime<Utc>) -> TaskerResult<()>;
}

#[async_trait]
pub trait SecretStore: Send + Sync + 'static {
    async fn decrypt(&self, ciphertext: &str) -> TaskerResult<String>;
}

/// Executes one deployment build
#[async_trait]
pub trait BuildRunner: Send + Sync + 'static {
    async fn run_build(&self, request: &BuildRequest) -> anyhow::Result<()>;
}
