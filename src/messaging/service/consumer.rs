//! Bounded handler pool shared by every backend's consume loop.
//!
//! A backend loop acquires a permit before fetching, so at most
//! `concurrency` deliveries are ever outstanding. Each delivery runs on its
//! own task; when the handler returns without settling, the delivery is
//! released back to the backend for redelivery.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use super::traits::DeliveryHandler;
use super::types::ConsumerStats;
use crate::messaging::delivery::Delivery;

pub(crate) struct DispatchPool {
    topic: String,
    handler: Arc<dyn DeliveryHandler>,
    semaphore: Arc<Semaphore>,
    tasks: JoinSet<()>,
    stats: Arc<ConsumerStats>,
}

impl DispatchPool {
    pub(crate) fn new(
        topic: impl Into<String>,
        handler: Arc<dyn DeliveryHandler>,
        concurrency: u16,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            topic: topic.into(),
            handler,
            semaphore: Arc::new(Semaphore::new(usize::from(concurrency.max(1)))),
            tasks: JoinSet::new(),
            stats,
        }
    }

    /// Wait for a free handler slot
    pub(crate) async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    /// Run the handler for one delivery, holding `permit` until it settles
    pub(crate) fn spawn(&mut self, permit: OwnedSemaphorePermit, delivery: Delivery) {
        self.reap();

        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);
        let topic = self.topic.clone();

        self.tasks.spawn(async move {
            let _permit = permit;
            stats.delivered.fetch_add(1, Ordering::Relaxed);

            let outcome = AssertUnwindSafe(handler.handle(delivery.clone()))
                .catch_unwind()
                .await;

            let handler_failed = match outcome {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        topic = %topic,
                        position = %delivery.receipt().position(),
                        error = %e,
                        "Delivery handler returned an error"
                    );
                    true
                }
                Err(_) => {
                    stats.handler_errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        topic = %topic,
                        position = %delivery.receipt().position(),
                        "Delivery handler panicked"
                    );
                    true
                }
            };

            if delivery.is_settled() {
                return;
            }

            stats.unsettled.fetch_add(1, Ordering::Relaxed);
            debug!(
                topic = %topic,
                position = %delivery.receipt().position(),
                handler_failed,
                "Handler left delivery unsettled; releasing for redelivery"
            );
            if let Err(e) = delivery.release(handler_failed).await {
                error!(
                    topic = %topic,
                    position = %delivery.receipt().position(),
                    error = %e,
                    "Failed to release unsettled delivery"
                );
            }
        });
    }

    /// Collect finished handler tasks without waiting
    pub(crate) fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                error!(topic = %self.topic, error = %e, "Handler task failed to join");
            }
        }
    }

    /// Wait for every in-flight handler to finish
    pub(crate) async fn drain(&mut self) {
        let in_flight = self.tasks.len();
        if in_flight > 0 {
            debug!(topic = %self.topic, in_flight, "Draining in-flight deliveries");
        }
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(topic = %self.topic, error = %e, "Handler task failed to join");
            }
        }
    }
}
