//! # Deployment Builds
//!
//! Nightly build fan-out: the [`DeploymentBuildScheduler`] enqueues one job
//! per operator target, and the [`DeploymentBuildWorker`] runs them through
//! the [`BuildRunner`](crate::orchestration::BuildRunner) port.

pub mod build_scheduler;
pub mod build_worker;
pub mod types;

pub use build_scheduler::{BuildScanReport, BuildSchedulerStatus, DeploymentBuildScheduler};
pub use build_worker::{BuildWorkerStatus, DeploymentBuildWorker};
pub use types::{BuildRequest, BuildTrigger, OperatorAccount, ScheduledBuildPreference};
