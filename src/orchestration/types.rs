//! # Orchestration Types
//!
//! Records exchanged with the workflow engine and its stores: workflow
//! definitions, flow runs, poller state and persisted queue settings.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::messaging::QueueBackendKind;

/// What caused a flow run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Scheduler,
    Poller,
    Manual,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduler => write!(f, "scheduler"),
            Self::Poller => write!(f, "poller"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowRunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl FlowRunStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for FlowRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Result of `FlowExecutor::execute_flow`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowRun {
    pub id: Uuid,
    pub flow_id: String,
    pub status: FlowRunStatus,
}

impl FlowRun {
    pub fn new(flow_id: impl Into<String>, status: FlowRunStatus) -> Self {
        Self {
            id: Uuid::new_v4(),
            flow_id: flow_id.into(),
            status,
        }
    }
}

/// Failure reported by the workflow engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowExecutionError {
    /// The trigger found nothing to process; callers treat this as success
    #[error("No new data: {0}")]
    NoNewData(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Flow execution failed: {0}")]
    Failed(String),

    #[error("Workflow engine unavailable: {0}")]
    Unavailable(String),
}

impl FlowExecutionError {
    /// Whether this is the benign "nothing to do" outcome
    ///
    /// Engines that cannot return the typed variant signal it through the
    /// message text, so known phrases are matched case-insensitively.
    pub fn is_no_new_data(&self) -> bool {
        if matches!(self, Self::NoNewData(_)) {
            return true;
        }
        let message = self.to_string().to_lowercase();
        message.contains("no new data") || message.contains("no new files detected")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Scheduler,
    Poller,
    Webhook,
    Action,
    #[serde(other)]
    Other,
}

fn default_true() -> bool {
    true
}

/// One node of a workflow graph; `config` is kind-specific
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowNode {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(default)]
    pub nodes: Vec<FlowNode>,
}

impl WorkflowDefinition {
    /// Enabled nodes of kind `scheduler`
    pub fn scheduler_nodes(&self) -> impl Iterator<Item = &FlowNode> {
        self.nodes
            .iter()
            .filter(|node| node.enabled && node.kind == NodeKind::Scheduler)
    }
}

/// `config` of a scheduler node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerNodeConfig {
    pub cron: String,
    #[serde(default)]
    pub timezone: Option<String>,
}

/// Persisted state of one poller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollerState {
    pub poller_id: String,
    pub flow_id: String,
    pub node_id: String,
    pub poll_interval_minutes: u32,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PollerState {
    pub fn new(
        poller_id: impl Into<String>,
        flow_id: impl Into<String>,
        node_id: impl Into<String>,
        poll_interval_minutes: u32,
    ) -> Self {
        Self {
            poller_id: poller_id.into(),
            flow_id: flow_id.into(),
            node_id: node_id.into(),
            poll_interval_minutes,
            last_processed_at: None,
            last_error: None,
            last_error_at: None,
            enabled: true,
        }
    }

    /// A poller that never ran is always due
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_processed_at {
            None => true,
            Some(last) => {
                now - last >= chrono::Duration::minutes(i64::from(self.poll_interval_minutes))
            }
        }
    }
}

/// Operator-chosen queue backend, stored outside the config files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSettings {
    pub backend: QueueBackendKind,
    /// Overrides the configured broker URL
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    /// Ciphertext resolved through the `SecretStore` port
    #[serde(default)]
    pub encrypted_password: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
}

impl QueueSettings {
    pub fn new(backend: QueueBackendKind) -> Self {
        Self {
            backend,
            url: None,
            username: None,
            encrypted_password: None,
            last_error: None,
            last_error_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_no_new_data_detection() {
        assert!(FlowExecutionError::NoNewData("inbox empty".into()).is_no_new_data());
        assert!(FlowExecutionError::Failed("No New Files Detected in /inbox".into()).is_no_new_data());
        assert!(FlowExecutionError::Failed("poll found no new data".into()).is_no_new_data());
        assert!(!FlowExecutionError::Failed("connection refused".into()).is_no_new_data());
    }

    #[test]
    fn test_unknown_node_kind_deserializes_as_other() {
        let node: FlowNode = serde_json::from_value(json!({
            "id": "n1",
            "kind": "transform",
            "config": {}
        }))
        .expect("node");
        assert_eq!(node.kind, NodeKind::Other);
        assert!(node.enabled);
    }

    #[test]
    fn test_scheduler_nodes_filters_kind_and_enabled() {
        let workflow: WorkflowDefinition = serde_json::from_value(json!({
            "id": "wf-1",
            "name": "Nightly import",
            "enabled": true,
            "nodes": [
                {"id": "s1", "kind": "scheduler", "config": {"cron": "0 * * * *"}},
                {"id": "s2", "kind": "scheduler", "config": {"cron": "0 * * * *"}, "enabled": false},
                {"id": "p1", "kind": "poller"}
            ]
        }))
        .expect("workflow");

        let ids: Vec<&str> = workflow.scheduler_nodes().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["s1"]);
    }

    #[test]
    fn test_poller_due_boundary() {
        let now = Utc::now();
        let mut state = PollerState::new("p1", "wf-1", "n1", 5);
        assert!(state.is_due(now));

        state.last_processed_at = Some(now - chrono::Duration::minutes(4));
        assert!(!state.is_due(now));

        state.last_processed_at = Some(now - chrono::Duration::minutes(5));
        assert!(state.is_due(now));
    }
}
