//! # Queue Service Types
//!
//! Core types for the backend-agnostic queue contract.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

use crate::messaging::envelope::MessageEnvelope;
use crate::messaging::{MessagingError, MessagingResult};

/// Identifier assigned to an enqueued message
///
/// The format is backend-specific:
/// - InMemory: monotonically increasing counter
/// - RabbitMQ: UUID set as the AMQP `message_id` property
/// - Redis Streams: stream entry ID (`<ms>-<seq>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// The closed set of queue backends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueBackendKind {
    /// In-process, non-durable; also the fallback
    #[default]
    #[serde(rename = "in_memory")]
    InMemory,
    /// AMQP 0.9.1 broker
    #[serde(rename = "rabbitmq")]
    RabbitMq,
    /// Partitioned log with manual commit
    #[serde(rename = "redis_streams")]
    RedisStreams,
}

impl QueueBackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InMemory => "in_memory",
            Self::RabbitMq => "rabbitmq",
            Self::RedisStreams => "redis_streams",
        }
    }
}

impl fmt::Display for QueueBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueBackendKind {
    type Err = MessagingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "in_memory" | "memory" | "inmemory" => Ok(Self::InMemory),
            "rabbitmq" | "amqp" => Ok(Self::RabbitMq),
            "redis_streams" | "redis" | "log" => Ok(Self::RedisStreams),
            other => Err(MessagingError::configuration(
                "queue.backend",
                format!("unknown queue backend '{other}'"),
            )),
        }
    }
}

/// Options for `consume`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Upper bound on in-flight handler invocations (prefetch / permits)
    pub concurrency: u16,
}

impl ConsumeOptions {
    pub fn new(concurrency: u16) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self::new(1)
    }
}

/// An entry a Redis Streams consumer must hand out again
#[derive(Debug, Clone)]
pub struct PendingRedelivery {
    pub stream_key: String,
    pub entry_id: String,
    pub envelope: MessageEnvelope,
}

/// Backend-specific position of a delivered message, used to commit it
#[derive(Debug, Clone)]
pub enum DeliveryReceipt {
    InMemory {
        message_id: u64,
    },
    RabbitMq {
        delivery_tag: u64,
        channel: lapin::Channel,
    },
    RedisStreams {
        stream_key: String,
        entry_id: String,
        redeliver: mpsc::UnboundedSender<PendingRedelivery>,
    },
}

impl DeliveryReceipt {
    /// Human-readable position for logs and errors
    pub fn position(&self) -> String {
        match self {
            Self::InMemory { message_id } => message_id.to_string(),
            Self::RabbitMq { delivery_tag, .. } => delivery_tag.to_string(),
            Self::RedisStreams {
                stream_key,
                entry_id,
                ..
            } => format!("{stream_key}/{entry_id}"),
        }
    }
}

/// Runtime statistics for one consumer
#[derive(Debug, Default)]
pub struct ConsumerStats {
    /// Deliveries handed to the handler
    pub delivered: AtomicU64,
    /// Handler invocations that returned an error or panicked
    pub handler_errors: AtomicU64,
    /// Deliveries the handler left unsettled (released for redelivery)
    pub unsettled: AtomicU64,
}

/// Point-in-time copy of `ConsumerStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub delivered: u64,
    pub handler_errors: u64,
    pub unsettled: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            unsettled: self.unsettled.load(Ordering::Relaxed),
        }
    }
}

/// Disposer returned by `consume`
///
/// `stop()` stops fetching, waits for every in-flight handler to settle and
/// only then reports the consumer as stopped. Dropping the handle also stops
/// the consumer, but without waiting.
pub struct ConsumerHandle {
    consumer_id: Uuid,
    topic: String,
    provider: &'static str,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
    consuming: Arc<AtomicBool>,
    stats: Arc<ConsumerStats>,
}

impl fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("consumer_id", &self.consumer_id)
            .field("topic", &self.topic)
            .field("provider", &self.provider)
            .field("is_consuming", &self.is_consuming())
            .finish_non_exhaustive()
    }
}

impl ConsumerHandle {
    pub(crate) fn new(
        topic: impl Into<String>,
        provider: &'static str,
        shutdown_tx: oneshot::Sender<()>,
        task: JoinHandle<()>,
        consuming: Arc<AtomicBool>,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            consumer_id: Uuid::new_v4(),
            topic: topic.into(),
            provider,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
            consuming,
            stats,
        }
    }

    pub fn consumer_id(&self) -> Uuid {
        self.consumer_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_consuming(&self) -> bool {
        self.consuming.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop consuming; returns after the last in-flight delivery has settled
    pub async fn stop(mut self) -> MessagingResult<()> {
        debug!(
            consumer_id = %self.consumer_id,
            topic = %self.topic,
            provider = self.provider,
            "Stopping consumer"
        );

        if let Some(tx) = self.shutdown_tx.take() {
            // The loop may already have exited on backend close
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            task.await.map_err(|e| {
                MessagingError::internal(format!("consumer task for {} failed: {e}", self.topic))
            })?;
        }

        info!(
            consumer_id = %self.consumer_id,
            topic = %self.topic,
            provider = self.provider,
            delivered = self.stats.delivered.load(Ordering::Relaxed),
            "Consumer stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_serde_names() {
        assert_eq!(
            serde_json::to_string(&QueueBackendKind::RabbitMq).expect("serialize"),
            "\"rabbitmq\""
        );
        let kind: QueueBackendKind =
            serde_json::from_str("\"redis_streams\"").expect("deserialize");
        assert_eq!(kind, QueueBackendKind::RedisStreams);
    }

    #[test]
    fn test_backend_kind_from_str_aliases() {
        assert_eq!("AMQP".parse::<QueueBackendKind>().ok(), Some(QueueBackendKind::RabbitMq));
        assert_eq!("memory".parse::<QueueBackendKind>().ok(), Some(QueueBackendKind::InMemory));
        assert!("kafka".parse::<QueueBackendKind>().is_err());
    }

    #[test]
    fn test_consume_options_clamps_zero() {
        assert_eq!(ConsumeOptions::new(0).concurrency, 1);
        assert_eq!(ConsumeOptions::new(8).concurrency, 8);
    }

    #[test]
    fn test_receipt_position() {
        assert_eq!(DeliveryReceipt::InMemory { message_id: 42 }.position(), "42");
    }
}
