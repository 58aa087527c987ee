//! # Dispatch Bootstrap
//!
//! Wires the queue manager, the build worker and the three time-driven
//! producers from one [`DispatchConfig`], and tears them down in reverse.
//!
//! Start order: queue backend, build worker, build scheduler, poller,
//! scheduler. A component disabled in configuration is simply absent from
//! the [`DispatchHandle`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::DispatchConfig;
use crate::deployment::{
    BuildSchedulerStatus, BuildWorkerStatus, DeploymentBuildScheduler, DeploymentBuildWorker,
    OperatorAccount,
};
use crate::error::{TaskerError, TaskerResult};
use crate::messaging::{BackendSelection, QueueManager};
use crate::orchestration::in_memory::{
    InMemoryOperatorRepository, InMemoryPollerStateRepository, InMemoryQueueSettingsStore,
    InMemorySecretStore, InMemoryWorkflowRepository, RecordingBuildRunner, RecordingFlowExecutor,
};
use crate::orchestration::{
    BuildRunner, FlowExecutor, OperatorRepository, PollerState, PollerStateRepository,
    QueueSettings, QueueSettingsStore, SecretStore, WorkflowDefinition, WorkflowRepository,
};
use crate::scheduling::{PollerDaemon, PollerStatus, SchedulerDaemon, SchedulerStatus};

/// External systems the dispatcher talks to
#[derive(Clone)]
pub struct DispatchPorts {
    pub workflows: Arc<dyn WorkflowRepository>,
    pub pollers: Arc<dyn PollerStateRepository>,
    pub operators: Arc<dyn OperatorRepository>,
    pub queue_settings: Arc<dyn QueueSettingsStore>,
    pub secrets: Arc<dyn SecretStore>,
    pub executor: Arc<dyn FlowExecutor>,
    pub build_runner: Arc<dyn BuildRunner>,
}

impl DispatchPorts {
    /// In-process stores seeded from `seed`, with executors that only log
    pub fn in_memory(seed: StandaloneSeed) -> Self {
        let secrets = InMemorySecretStore::new();
        for (ciphertext, plaintext) in seed.secrets {
            secrets.insert(ciphertext, plaintext);
        }

        Self {
            workflows: Arc::new(InMemoryWorkflowRepository::with_workflows(seed.workflows)),
            pollers: Arc::new(InMemoryPollerStateRepository::with_states(seed.pollers)),
            operators: Arc::new(InMemoryOperatorRepository::new(seed.operators)),
            queue_settings: Arc::new(InMemoryQueueSettingsStore::new(seed.queue_settings)),
            secrets: Arc::new(secrets),
            executor: Arc::new(RecordingFlowExecutor::new()),
            build_runner: Arc::new(RecordingBuildRunner::new()),
        }
    }
}

/// Records for running the dispatcher without external stores
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StandaloneSeed {
    pub workflows: Vec<WorkflowDefinition>,
    pub pollers: Vec<PollerState>,
    pub operators: Vec<OperatorAccount>,
    pub queue_settings: Option<QueueSettings>,
    /// Ciphertext to plaintext
    pub secrets: HashMap<String, String>,
}

impl StandaloneSeed {
    pub fn from_json_file(path: &Path) -> TaskerResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            TaskerError::ConfigurationError(format!(
                "failed to read seed file {}: {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            TaskerError::ConfigurationError(format!(
                "invalid seed file {}: {e}",
                path.display()
            ))
        })
    }
}

/// Snapshot of every running component
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStatus {
    pub queue: Option<BackendSelection>,
    pub queue_healthy: bool,
    pub scheduler: Option<SchedulerStatus>,
    pub poller: Option<PollerStatus>,
    pub build_scheduler: Option<BuildSchedulerStatus>,
    pub build_worker: Option<BuildWorkerStatus>,
}

/// Running dispatcher components
pub struct DispatchHandle {
    queue: Arc<QueueManager>,
    scheduler: Option<SchedulerDaemon>,
    poller: Option<PollerDaemon>,
    build_scheduler: Option<DeploymentBuildScheduler>,
    build_worker: Option<DeploymentBuildWorker>,
    stopped: AtomicBool,
}

impl DispatchHandle {
    fn new(queue: Arc<QueueManager>) -> Self {
        Self {
            queue,
            scheduler: None,
            poller: None,
            build_scheduler: None,
            build_worker: None,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &Arc<QueueManager> {
        &self.queue
    }

    pub fn scheduler(&self) -> Option<&SchedulerDaemon> {
        self.scheduler.as_ref()
    }

    pub fn poller(&self) -> Option<&PollerDaemon> {
        self.poller.as_ref()
    }

    pub fn build_scheduler(&self) -> Option<&DeploymentBuildScheduler> {
        self.build_scheduler.as_ref()
    }

    pub fn build_worker(&self) -> Option<&DeploymentBuildWorker> {
        self.build_worker.as_ref()
    }

    pub async fn status(&self) -> DispatchStatus {
        let queue_healthy = self.queue.health_check().await.unwrap_or(false);
        let build_worker = match &self.build_worker {
            Some(worker) => Some(worker.status().await),
            None => None,
        };

        DispatchStatus {
            queue: self.queue.selection(),
            queue_healthy,
            scheduler: self.scheduler.as_ref().map(SchedulerDaemon::status),
            poller: self.poller.as_ref().map(PollerDaemon::status),
            build_scheduler: self
                .build_scheduler
                .as_ref()
                .map(DeploymentBuildScheduler::status),
            build_worker,
        }
    }

    /// Stop producers first, then the worker, then close the queue
    ///
    /// Failures are logged and shutdown continues; the first one is returned.
    pub async fn stop(&self) -> TaskerResult<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!("Stopping dispatch components");

        let mut first_error: Option<TaskerError> = None;
        let mut note = |result: TaskerResult<()>, component: &str| {
            if let Err(e) = result {
                error!(component, error = %e, "Component failed to stop cleanly");
                first_error.get_or_insert(e);
            }
        };

        if let Some(scheduler) = &self.scheduler {
            note(scheduler.stop().await, "scheduler");
        }
        if let Some(poller) = &self.poller {
            poller.stop().await;
        }
        if let Some(build_scheduler) = &self.build_scheduler {
            build_scheduler.stop().await;
        }
        if let Some(worker) = &self.build_worker {
            note(worker.stop().await, "build_worker");
        }
        note(self.queue.close().await.map_err(Into::into), "queue");

        info!("Dispatch components stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Builds a [`DispatchHandle`] from configuration and ports
pub struct DispatchBootstrap;

impl DispatchBootstrap {
    pub async fn bootstrap(
        config: &DispatchConfig,
        ports: DispatchPorts,
    ) -> TaskerResult<DispatchHandle> {
        let queue = Arc::new(QueueManager::new(
            config.queue.clone(),
            Arc::clone(&ports.queue_settings),
            Arc::clone(&ports.secrets),
        ));
        let selection = queue.initialize().await?;
        info!(
            requested = %selection.requested,
            active = %selection.active,
            fallback = selection.is_fallback(),
            "Queue backend ready"
        );

        let mut handle = DispatchHandle::new(Arc::clone(&queue));
        if let Err(e) = Self::start_components(config, &ports, &queue, &mut handle).await {
            error!(error = %e, "Dispatch bootstrap failed; stopping started components");
            let _ = handle.stop().await;
            return Err(e);
        }

        info!(
            scheduler = handle.scheduler.is_some(),
            poller = handle.poller.is_some(),
            deployment_builds = handle.build_scheduler.is_some(),
            "Dispatch bootstrap complete"
        );
        Ok(handle)
    }

    async fn start_components(
        config: &DispatchConfig,
        ports: &DispatchPorts,
        queue: &Arc<QueueManager>,
        handle: &mut DispatchHandle,
    ) -> TaskerResult<()> {
        if config.deployment_builds.enabled {
            let worker = DeploymentBuildWorker::new(
                Arc::clone(queue),
                Arc::clone(&ports.build_runner),
                config.deployment_builds.clone(),
            );
            worker.start().await?;
            handle.build_worker = Some(worker);

            let build_scheduler = DeploymentBuildScheduler::new(
                Arc::clone(&ports.operators),
                Arc::clone(queue),
                config.deployment_builds.clone(),
            )?;
            build_scheduler.start();
            handle.build_scheduler = Some(build_scheduler);
        }

        if config.poller.enabled {
            let poller = PollerDaemon::new(
                Arc::clone(&ports.pollers),
                Arc::clone(&ports.workflows),
                Arc::clone(&ports.executor),
                config.poller.clone(),
            );
            poller.start();
            handle.poller = Some(poller);
        }

        if config.scheduler.enabled {
            let scheduler = SchedulerDaemon::new(
                Arc::clone(&ports.workflows),
                Arc::clone(&ports.executor),
                config.scheduler.clone(),
            );
            scheduler.start().await?;
            handle.scheduler = Some(scheduler);
        }

        Ok(())
    }
}
