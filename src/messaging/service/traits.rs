//! # Queue Service Traits
//!
//! Core trait definitions for backend-agnostic queueing.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::types::{ConsumeOptions, ConsumerHandle, DeliveryReceipt, MessageId};
use crate::config::RetryDefaultsConfig;
use crate::messaging::delivery::Delivery;
use crate::messaging::envelope::{EnqueueOptions, MessageEnvelope};
use crate::messaging::MessagingResult;

/// Queue contract implemented by every backend
///
/// Backends differ in their native primitives (in-process hand-off, AMQP
/// ack/nack, log offsets) but expose the same delivery lifecycle:
///
/// - `enqueue` hands an envelope to the native publish primitive
/// - `consume` pulls messages and invokes the handler with a [`Delivery`]
/// - the `commit`/`release`/`store_dead_letter` hooks back the delivery's
///   one-shot terminal actions and are not meant to be called directly
///
/// Connection errors propagate to the caller; falling back to another backend
/// is the queue manager's job, not the adapter's.
#[async_trait]
pub trait QueueService: Send + Sync + 'static {
    /// Hand an envelope to the backend's publish primitive
    async fn enqueue(&self, topic: &str, envelope: MessageEnvelope) -> MessagingResult<MessageId>;

    /// Wrap `payload` in an envelope and enqueue it
    async fn enqueue_payload(
        &self,
        topic: &str,
        payload: String,
        options: &EnqueueOptions,
    ) -> MessagingResult<MessageId> {
        let envelope = MessageEnvelope::new(payload, options, self.retry_defaults());
        self.enqueue(topic, envelope).await
    }

    /// Begin pulling messages for `topic`; the returned handle stops delivery
    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> MessagingResult<ConsumerHandle>;

    /// Messages waiting in the active topic (observability only)
    ///
    /// Log-based backends report `0`; callers must not read that as "empty".
    async fn depth(&self, topic: &str) -> MessagingResult<u64>;

    /// Messages in the topic's dead-letter store
    async fn dead_letter_depth(&self, topic: &str) -> MessagingResult<u64>;

    /// Commit the delivered message's position
    async fn commit(&self, topic: &str, receipt: &DeliveryReceipt) -> MessagingResult<()>;

    /// Return an unsettled delivery for redelivery without committing it
    async fn release(
        &self,
        topic: &str,
        receipt: &DeliveryReceipt,
        envelope: &MessageEnvelope,
        handler_failed: bool,
    ) -> MessagingResult<()>;

    /// Append an envelope to the topic's dead-letter store
    async fn store_dead_letter(&self, topic: &str, envelope: &MessageEnvelope)
        -> MessagingResult<()>;

    /// Verify the backend is reachable
    async fn health_check(&self) -> MessagingResult<bool>;

    /// Release backend connections; safe to call more than once
    async fn close(&self) -> MessagingResult<()>;

    /// Defaults applied by `enqueue_payload`
    fn retry_defaults(&self) -> &RetryDefaultsConfig;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}

/// Message handler invoked once per delivery
///
/// A handler is expected to settle the delivery with `ack`, `fail` or
/// `dead_letter`. Returning an error without settling never commits the
/// message; the backend redelivers (or, for RabbitMQ, rejects to the DLX).
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`DeliveryHandler`]
pub struct HandlerFn<F> {
    f: F,
}

/// Build a handler from an async closure
///
/// ```rust,ignore
/// let handler = handler_fn(|delivery: Delivery| async move {
///     delivery.ack().await?;
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn DeliveryHandler>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(HandlerFn { f })
}

#[async_trait]
impl<F, Fut> DeliveryHandler for HandlerFn<F>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        (self.f)(delivery).await
    }
}
