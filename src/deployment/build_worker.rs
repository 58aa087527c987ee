//! Consumer side of the deployment build topic.
//!
//! Each delivery carries one [`BuildRequest`]. A build that succeeds is
//! acked; one that fails is retried through the delivery's retry budget and
//! dead-lettered once the budget is spent. A payload that does not decode is
//! dead-lettered immediately.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::BuildRequest;
use crate::config::DeploymentBuildConfig;
use crate::error::TaskerResult;
use crate::messaging::{
    ConsumeOptions, ConsumerHandle, Delivery, DeliveryHandler, MessagingResult, QueueManager,
};
use crate::orchestration::BuildRunner;

#[derive(Debug, Default)]
struct BuildWorkerStats {
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildWorkerStatus {
    pub consuming: bool,
    pub topic: String,
    pub builds_succeeded: u64,
    pub builds_retried: u64,
    pub builds_dead_lettered: u64,
    /// Times the worker re-attached after a backend change
    pub resubscriptions: u64,
}

struct BuildJobHandler {
    runner: Arc<dyn BuildRunner>,
    stats: Arc<BuildWorkerStats>,
}

#[async_trait]
impl DeliveryHandler for BuildJobHandler {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        let request: BuildRequest = match delivery.payload_as() {
            Ok(request) => request,
            Err(e) => {
                error!(
                    topic = %delivery.topic(),
                    error = %e,
                    "Undecodable build request; dead-lettering"
                );
                delivery.dead_letter().await?;
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        match self.runner.run_build(&request).await {
            Ok(()) => {
                delivery.ack().await?;
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    operator_id = %request.operator_id,
                    target = %request.target,
                    "Deployment build succeeded"
                );
            }
            Err(e) if delivery.envelope().is_exhausted() => {
                warn!(
                    operator_id = %request.operator_id,
                    target = %request.target,
                    retry_count = delivery.envelope().retry_count,
                    error = %e,
                    "Deployment build failed with no retries left"
                );
                delivery.dead_letter().await?;
                self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(
                    operator_id = %request.operator_id,
                    target = %request.target,
                    retry_count = delivery.envelope().retry_count,
                    error = %e,
                    "Deployment build failed; scheduling retry"
                );
                delivery.fail(None).await?;
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }
}

/// Runs deployment builds pulled from the build topic
///
/// A supervisor task follows the queue manager's backend generation: when the
/// backend is switched or re-initialized, the old consumer is stopped and the
/// topic is consumed again on the new backend.
pub struct DeploymentBuildWorker {
    queue: Arc<QueueManager>,
    handler: Arc<BuildJobHandler>,
    config: DeploymentBuildConfig,
    stats: Arc<BuildWorkerStats>,
    consumer: Arc<Mutex<Option<ConsumerHandle>>>,
    supervisor: Mutex<Option<(oneshot::Sender<()>, JoinHandle<MessagingResult<()>>)>>,
    resubscriptions: Arc<AtomicU64>,
}

impl fmt::Debug for DeploymentBuildWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentBuildWorker")
            .field("topic", &self.config.topic)
            .field("concurrency", &self.config.worker_concurrency)
            .finish_non_exhaustive()
    }
}

impl DeploymentBuildWorker {
    pub fn new(
        queue: Arc<QueueManager>,
        runner: Arc<dyn BuildRunner>,
        config: DeploymentBuildConfig,
    ) -> Self {
        let stats = Arc::new(BuildWorkerStats::default());
        Self {
            queue,
            handler: Arc::new(BuildJobHandler {
                runner,
                stats: Arc::clone(&stats),
            }),
            config,
            stats,
            consumer: Arc::new(Mutex::new(None)),
            supervisor: Mutex::new(None),
            resubscriptions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Subscribe to the build topic on the active backend
    ///
    /// Fails when the first subscription fails; later backend changes are
    /// followed by the supervisor.
    pub async fn start(&self) -> TaskerResult<()> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            debug!("Deployment build worker already consuming");
            return Ok(());
        }

        let mut changes = self.queue.subscribe_changes();
        changes.borrow_and_update();

        let handle = self.subscription().subscribe().await?;
        *self.consumer.lock().await = Some(handle);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            self.subscription(),
            Arc::clone(&self.consumer),
            Arc::clone(&self.resubscriptions),
            changes,
            shutdown_rx,
        ));
        *supervisor = Some((shutdown_tx, task));

        info!(
            topic = %self.config.topic,
            concurrency = self.config.worker_concurrency,
            "Deployment build worker started"
        );
        Ok(())
    }

    /// Stop consuming once in-flight builds have settled
    pub async fn stop(&self) -> TaskerResult<()> {
        let supervisor = self.supervisor.lock().await.take();
        let Some((shutdown_tx, task)) = supervisor else {
            debug!("Deployment build worker not consuming");
            return Ok(());
        };

        let _ = shutdown_tx.send(());
        match task.await {
            Ok(result) => result?,
            Err(e) => warn!(error = %e, "Deployment build supervisor ended abnormally"),
        }
        info!(topic = %self.config.topic, "Deployment build worker stopped");
        Ok(())
    }

    pub async fn status(&self) -> BuildWorkerStatus {
        let consuming = self
            .consumer
            .lock()
            .await
            .as_ref()
            .is_some_and(ConsumerHandle::is_consuming);
        BuildWorkerStatus {
            consuming,
            topic: self.config.topic.clone(),
            builds_succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            builds_retried: self.stats.retried.load(Ordering::Relaxed),
            builds_dead_lettered: self.stats.dead_lettered.load(Ordering::Relaxed),
            resubscriptions: self.resubscriptions.load(Ordering::Relaxed),
        }
    }

    fn subscription(&self) -> Subscription {
        Subscription {
            queue: Arc::clone(&self.queue),
            handler: Arc::clone(&self.handler) as Arc<dyn DeliveryHandler>,
            topic: self.config.topic.clone(),
            concurrency: self.config.worker_concurrency,
        }
    }
}

/// What the worker needs to (re)subscribe to the build topic
struct Subscription {
    queue: Arc<QueueManager>,
    handler: Arc<dyn DeliveryHandler>,
    topic: String,
    concurrency: u16,
}

impl Subscription {
    async fn subscribe(&self) -> MessagingResult<ConsumerHandle> {
        self.queue
            .provider()?
            .consume(
                &self.topic,
                Arc::clone(&self.handler),
                ConsumeOptions::new(self.concurrency),
            )
            .await
    }
}

async fn supervise(
    subscription: Subscription,
    consumer: Arc<Mutex<Option<ConsumerHandle>>>,
    resubscriptions: Arc<AtomicU64>,
    mut changes: watch::Receiver<u64>,
    mut shutdown_rx: oneshot::Receiver<()>,
) -> MessagingResult<()> {
    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown_rx => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    debug!(topic = %subscription.topic, "Queue manager dropped; supervisor exiting");
                    break;
                }
                let generation = *changes.borrow_and_update();

                let previous = consumer.lock().await.take();
                if let Some(previous) = previous {
                    if let Err(e) = previous.stop().await {
                        warn!(topic = %subscription.topic, error = %e, "Stopping previous build consumer failed");
                    }
                }

                match subscription.subscribe().await {
                    Ok(handle) => {
                        *consumer.lock().await = Some(handle);
                        resubscriptions.fetch_add(1, Ordering::Relaxed);
                        info!(
                            topic = %subscription.topic,
                            generation,
                            "Deployment build worker re-subscribed after backend change"
                        );
                    }
                    Err(e) => warn!(
                        topic = %subscription.topic,
                        generation,
                        error = %e,
                        "No backend to consume from; waiting for the next backend change"
                    ),
                }
            }
        }
    }

    let current = consumer.lock().await.take();
    match current {
        Some(handle) => handle.stop().await,
        None => Ok(()),
    }
}
