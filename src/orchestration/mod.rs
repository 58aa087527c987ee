//! # Orchestration Boundary
//!
//! Types and ports through which the dispatch subsystem talks to the
//! workflow engine and its stores. The engine itself lives elsewhere; the
//! daemons reach it only through [`ports::FlowExecutor::execute_flow`].

pub mod in_memory;
pub mod ports;
pub mod types;

pub use ports::{
    BuildRunner, FlowExecutor, OperatorRepository, PollerStateRepository, QueueSettingsStore,
    SecretStore, WorkflowRepository,
};
pub use types::{
    FlowExecutionError, FlowNode, FlowRun, FlowRunStatus, NodeKind, PollerState, QueueSettings,
    SchedulerNodeConfig, TriggerType, WorkflowDefinition,
};
