#![allow(clippy::doc_markdown)] // Allow technical terms like RabbitMQ, XREADGROUP in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Dispatch
//!
//! Asynchronous job dispatch for the Tasker workflow engine.
//!
//! ## Overview
//!
//! Producers enqueue JSON payloads on named topics; consumers receive each
//! message wrapped in a one-shot delivery handle and settle it exactly once:
//! ack, fail (retry later) or dead-letter. The same contract runs over three
//! interchangeable backends:
//!
//! - **In-memory**: in-process queues, also the fallback when a broker is down
//! - **RabbitMQ**: AMQP queues with dead-letter exchanges and delay queues
//! - **Redis Streams**: partitioned logs read through consumer groups
//!
//! On top of the queue sit three time-driven producers: the cron
//! [`SchedulerDaemon`](scheduling::SchedulerDaemon), the fixed-tick
//! [`PollerDaemon`](scheduling::PollerDaemon) and the daily
//! [`DeploymentBuildScheduler`](deployment::DeploymentBuildScheduler).
//!
//! ## Module Organization
//!
//! - [`messaging`] - envelope, delivery handle, backends and the queue manager
//! - [`scheduling`] - cron specs, overlap guard, scheduler and poller daemons
//! - [`deployment`] - nightly build fan-out and the build worker
//! - [`orchestration`] - ports to the workflow engine and its stores
//! - [`bootstrap`] - wiring and ordered shutdown of all components
//! - [`config`] - environment-aware TOML configuration
//! - [`error`] - structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tasker_dispatch::config::QueueConfig;
//! use tasker_dispatch::messaging::{handler_fn, ConsumeOptions, Delivery, EnqueueOptions, QueueManager};
//! use tasker_dispatch::orchestration::in_memory::{InMemoryQueueSettingsStore, InMemorySecretStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = QueueManager::new(
//!     QueueConfig::default(),
//!     Arc::new(InMemoryQueueSettingsStore::new(None)),
//!     Arc::new(InMemorySecretStore::new()),
//! );
//! manager.initialize().await?;
//! manager
//!     .enqueue_payload("builds", r#"{"target":"production"}"#, &EnqueueOptions::default())
//!     .await?;
//!
//! let consumer = manager
//!     .provider()?
//!     .consume(
//!         "builds",
//!         handler_fn(|delivery: Delivery| async move {
//!             delivery.ack().await?;
//!             Ok(())
//!         }),
//!         ConsumeOptions::new(4),
//!     )
//!     .await?;
//! consumer.stop().await?;
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                                  # unit and in-memory integration tests
//! cargo test -- --ignored                     # broker tests; needs RabbitMQ and Redis
//! ```

pub mod bootstrap;
pub mod config;
pub mod constants;
pub mod deployment;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod orchestration;
pub mod scheduling;

pub use bootstrap::{DispatchBootstrap, DispatchHandle, DispatchPorts};
pub use config::{ConfigLoader, DispatchConfig};
pub use error::{TaskerError, TaskerResult};
pub use messaging::{MessagingError, MessagingResult, QueueManager};
