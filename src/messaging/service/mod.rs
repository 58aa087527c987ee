//! # Queue Service Abstraction Layer
//!
//! Backend-agnostic queue contract with enum dispatch over three backends.
//!
//! ## Architecture
//!
//! ```text
//! QueueProvider (enum)           <- enum dispatch, carried by every Delivery
//!   ├── InMemory(InMemoryQueueService)          in-process, fallback
//!   ├── RabbitMq(RabbitMqQueueService)          AMQP ack/nack + DLX
//!   └── RedisStreams(RedisStreamsQueueService)  partitioned log, XACK commit
//!
//! consume(topic, handler, options)
//!   └── DispatchPool              <- permits bound in-flight deliveries
//!         └── handler(Delivery)   <- ack / fail(retry_at) / dead_letter
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let provider = QueueProvider::from(InMemoryQueueService::new());
//! provider.enqueue_payload("builds", payload, &EnqueueOptions::default()).await?;
//!
//! let handle = provider
//!     .consume("builds", handler_fn(|d: Delivery| async move {
//!         d.ack().await?;
//!         Ok(())
//!     }), ConsumeOptions::new(4))
//!     .await?;
//! handle.stop().await?;
//! ```

pub(crate) mod consumer;
mod provider;
pub mod providers;
mod traits;
mod types;

pub use provider::QueueProvider;
pub use providers::{InMemoryQueueService, RabbitMqQueueService, RedisStreamsQueueService};
pub use traits::{handler_fn, DeliveryHandler, HandlerFn, QueueService};
pub use types::{
    ConsumeOptions, ConsumerHandle, ConsumerStats, ConsumerStatsSnapshot, DeliveryReceipt,
    MessageId, PendingRedelivery, QueueBackendKind,
};
