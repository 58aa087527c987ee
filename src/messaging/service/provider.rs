//! # Queue Provider Enum
//!
//! Enum dispatch over the three queue backends, avoiding trait objects on the
//! settlement hot path. Every variant is a cheap clone of an `Arc`-backed
//! service, so a [`Delivery`](crate::messaging::Delivery) can carry the
//! provider it came from.

use std::sync::Arc;

use super::providers::{InMemoryQueueService, RabbitMqQueueService, RedisStreamsQueueService};
use super::traits::{DeliveryHandler, QueueService};
use super::types::{ConsumeOptions, ConsumerHandle, DeliveryReceipt, MessageId, QueueBackendKind};
use crate::messaging::envelope::{EnqueueOptions, MessageEnvelope};
use crate::messaging::MessagingResult;

#[derive(Debug, Clone)]
pub enum QueueProvider {
    /// In-process queue; non-durable, also the fallback backend
    InMemory(InMemoryQueueService),

    /// AMQP broker via lapin
    RabbitMq(RabbitMqQueueService),

    /// Partitioned log via Redis Streams consumer groups
    RedisStreams(RedisStreamsQueueService),
}

macro_rules! dispatch {
    ($self:ident, $svc:ident => $body:expr) => {
        match $self {
            QueueProvider::InMemory($svc) => $body,
            QueueProvider::RabbitMq($svc) => $body,
            QueueProvider::RedisStreams($svc) => $body,
        }
    };
}

impl QueueProvider {
    pub fn kind(&self) -> QueueBackendKind {
        match self {
            Self::InMemory(_) => QueueBackendKind::InMemory,
            Self::RabbitMq(_) => QueueBackendKind::RabbitMq,
            Self::RedisStreams(_) => QueueBackendKind::RedisStreams,
        }
    }

    pub fn provider_name(&self) -> &'static str {
        dispatch!(self, s => s.provider_name())
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, Self::InMemory(_))
    }

    /// Enqueue a prepared envelope
    pub async fn enqueue(&self, topic: &str, envelope: MessageEnvelope) -> MessagingResult<MessageId> {
        dispatch!(self, s => s.enqueue(topic, envelope).await)
    }

    /// Wrap a payload in an envelope (applying retry defaults) and enqueue it
    pub async fn enqueue_payload(
        &self,
        topic: &str,
        payload: impl Into<String>,
        options: &EnqueueOptions,
    ) -> MessagingResult<MessageId> {
        let payload = payload.into();
        dispatch!(self, s => s.enqueue_payload(topic, payload, options).await)
    }

    pub async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> MessagingResult<ConsumerHandle> {
        dispatch!(self, s => s.consume(topic, handler, options).await)
    }

    pub async fn depth(&self, topic: &str) -> MessagingResult<u64> {
        dispatch!(self, s => s.depth(topic).await)
    }

    pub async fn dead_letter_depth(&self, topic: &str) -> MessagingResult<u64> {
        dispatch!(self, s => s.dead_letter_depth(topic).await)
    }

    pub(crate) async fn commit(&self, topic: &str, receipt: &DeliveryReceipt) -> MessagingResult<()> {
        dispatch!(self, s => s.commit(topic, receipt).await)
    }

    pub(crate) async fn release(
        &self,
        topic: &str,
        receipt: &DeliveryReceipt,
        envelope: &MessageEnvelope,
        handler_failed: bool,
    ) -> MessagingResult<()> {
        dispatch!(self, s => s.release(topic, receipt, envelope, handler_failed).await)
    }

    pub(crate) async fn store_dead_letter(
        &self,
        topic: &str,
        envelope: &MessageEnvelope,
    ) -> MessagingResult<()> {
        dispatch!(self, s => s.store_dead_letter(topic, envelope).await)
    }

    pub async fn health_check(&self) -> MessagingResult<bool> {
        dispatch!(self, s => s.health_check().await)
    }

    pub async fn close(&self) -> MessagingResult<()> {
        dispatch!(self, s => s.close().await)
    }
}

impl From<InMemoryQueueService> for QueueProvider {
    fn from(service: InMemoryQueueService) -> Self {
        Self::InMemory(service)
    }
}

impl From<RabbitMqQueueService> for QueueProvider {
    fn from(service: RabbitMqQueueService) -> Self {
        Self::RabbitMq(service)
    }
}

impl From<RedisStreamsQueueService> for QueueProvider {
    fn from(service: RedisStreamsQueueService) -> Self {
        Self::RedisStreams(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_name_agree() {
        let provider = QueueProvider::from(InMemoryQueueService::new());
        assert_eq!(provider.kind(), QueueBackendKind::InMemory);
        assert_eq!(provider.provider_name(), provider.kind().as_str());
        assert!(provider.is_in_memory());
    }
}
