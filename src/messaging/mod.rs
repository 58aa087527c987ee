//! # Messaging Module
//!
//! Job dispatch over interchangeable queue backends: the message envelope,
//! the one-shot delivery handle, per-topic dead letters and the queue
//! manager that picks a backend at startup and falls back to the in-process
//! queue when the configured one is unreachable.

pub mod dead_letter;
pub mod delivery;
pub mod envelope;
pub mod errors;
pub mod manager;
pub mod service;

pub use dead_letter::{DeadLetterRecord, DeadLetterStore};
pub use delivery::{Delivery, DeliveryOutcome, Settlement};
pub use envelope::{EnqueueOptions, MessageEnvelope};
pub use errors::MessagingError;
pub use manager::{BackendSelection, QueueManager, SelectionSource};
pub use service::{
    handler_fn, ConsumeOptions, ConsumerHandle, DeliveryHandler, DeliveryReceipt,
    InMemoryQueueService, MessageId, QueueBackendKind, QueueProvider, QueueService,
    RabbitMqQueueService, RedisStreamsQueueService,
};

pub type MessagingResult<T> = Result<T, MessagingError>;
