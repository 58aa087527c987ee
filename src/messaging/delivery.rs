//! # Delivery Handle
//!
//! One-shot settlement of a delivered message. Exactly one of `ack`, `fail`
//! or `dead_letter` takes effect; later calls report
//! [`Settlement::AlreadySettled`] and touch nothing.
//!
//! Settlement is claimed with a compare-and-swap before the backend action
//! runs. If the action fails, the claim is dropped so the handler can retry
//! or let the backend redeliver.
//!
//! `fail` and `dead_letter` write a new message (retry copy or dead letter)
//! before committing the original. Once that write succeeds its outcome is
//! staged: a later call of any action only retries the commit, so the write
//! never happens twice.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::envelope::MessageEnvelope;
use super::service::{DeliveryReceipt, QueueProvider};
use super::MessagingResult;

const PENDING: u8 = 0;
const SETTLING: u8 = 1;
const SETTLED: u8 = 2;

/// Result of a terminal action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// This call settled the delivery
    Applied,
    /// An earlier call already settled it; nothing was done
    AlreadySettled,
}

impl Settlement {
    pub fn was_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// How a delivery was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Retried {
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    },
    DeadLettered,
    /// Handler returned without settling; handed back to the backend
    Released,
}

/// A message handed to a handler, plus its one-shot settlement actions
#[derive(Clone)]
pub struct Delivery {
    inner: Arc<DeliveryInner>,
}

struct DeliveryInner {
    topic: String,
    envelope: MessageEnvelope,
    receipt: DeliveryReceipt,
    provider: QueueProvider,
    state: AtomicU8,
    outcome: Mutex<Option<DeliveryOutcome>>,
    /// Outcome whose write succeeded but whose commit has not
    staged: Mutex<Option<DeliveryOutcome>>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("topic", &self.inner.topic)
            .field("position", &self.inner.receipt.position())
            .field("retry_count", &self.inner.envelope.retry_count)
            .field("outcome", &self.outcome())
            .finish_non_exhaustive()
    }
}

impl Delivery {
    pub(crate) fn new(
        topic: impl Into<String>,
        envelope: MessageEnvelope,
        receipt: DeliveryReceipt,
        provider: QueueProvider,
    ) -> Self {
        Self {
            inner: Arc::new(DeliveryInner {
                topic: topic.into(),
                envelope,
                receipt,
                provider,
                state: AtomicU8::new(PENDING),
                outcome: Mutex::new(None),
                staged: Mutex::new(None),
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.inner.envelope
    }

    pub fn payload(&self) -> &str {
        &self.inner.envelope.payload
    }

    pub fn receipt(&self) -> &DeliveryReceipt {
        &self.inner.receipt
    }

    /// Deserialize the JSON payload
    pub fn payload_as<T: DeserializeOwned>(&self) -> MessagingResult<T> {
        Ok(serde_json::from_str(&self.inner.envelope.payload)?)
    }

    pub fn is_settled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == SETTLED
    }

    pub fn outcome(&self) -> Option<DeliveryOutcome> {
        self.inner.outcome.lock().clone()
    }

    /// Commit the message
    pub async fn ack(&self) -> MessagingResult<Settlement> {
        self.settle("ack", move || async move {
            self.provider()
                .commit(self.topic(), self.receipt())
                .await?;
            debug!(topic = %self.topic(), position = %self.receipt().position(), "Delivery acked");
            Ok(DeliveryOutcome::Acked)
        })
        .await
    }

    /// Re-enqueue with `retry_count + 1` and commit the original
    ///
    /// `retry_at` defaults to now plus the envelope's retry interval. When the
    /// next attempt would exceed `max_retries` the delivery is dead-lettered
    /// instead.
    pub async fn fail(&self, retry_at: Option<DateTime<Utc>>) -> MessagingResult<Settlement> {
        self.settle("fail", move || async move {
            let envelope = self.envelope();
            let Some(next) = envelope.next_attempt(retry_at) else {
                warn!(
                    topic = %self.topic(),
                    retry_count = envelope.retry_count,
                    max_retries = envelope.max_retries,
                    "Retry budget exhausted; dead-lettering delivery"
                );
                return self.move_to_dead_letter().await;
            };

            let retry_count = next.retry_count;
            let next_retry_at = next.next_retry_at.unwrap_or_else(Utc::now);

            self.provider().enqueue(self.topic(), next).await?;
            let outcome = self
                .stage_and_commit(DeliveryOutcome::Retried {
                    retry_count,
                    next_retry_at,
                })
                .await?;

            info!(
                topic = %self.topic(),
                retry_count,
                max_retries = envelope.max_retries,
                next_retry_at = %next_retry_at,
                "Delivery failed; retry scheduled"
            );
            Ok(outcome)
        })
        .await
    }

    /// Move the envelope to the topic's dead-letter store and commit the original
    pub async fn dead_letter(&self) -> MessagingResult<Settlement> {
        self.settle("dead_letter", move || self.move_to_dead_letter()).await
    }

    /// Hand an unsettled delivery back to the backend without committing it
    pub(crate) async fn release(&self, handler_failed: bool) -> MessagingResult<Settlement> {
        self.settle("release", move || async move {
            self.provider()
                .release(self.topic(), self.receipt(), self.envelope(), handler_failed)
                .await?;
            Ok(DeliveryOutcome::Released)
        })
        .await
    }

    async fn move_to_dead_letter(&self) -> MessagingResult<DeliveryOutcome> {
        self.provider()
            .store_dead_letter(self.topic(), self.envelope())
            .await?;
        let outcome = self.stage_and_commit(DeliveryOutcome::DeadLettered).await?;
        warn!(
            topic = %self.topic(),
            retry_count = self.envelope().retry_count,
            "Delivery dead-lettered"
        );
        Ok(outcome)
    }

    async fn stage_and_commit(&self, outcome: DeliveryOutcome) -> MessagingResult<DeliveryOutcome> {
        *self.inner.staged.lock() = Some(outcome.clone());
        self.provider()
            .commit(self.topic(), self.receipt())
            .await?;
        Ok(outcome)
    }

    /// Finish a staged settlement; only the commit is retried
    async fn commit_staged(
        &self,
        action: &'static str,
        outcome: DeliveryOutcome,
    ) -> MessagingResult<DeliveryOutcome> {
        debug!(
            topic = %self.topic(),
            position = %self.receipt().position(),
            action,
            staged = ?outcome,
            "Earlier settlement already written; retrying commit only"
        );
        self.provider()
            .commit(self.topic(), self.receipt())
            .await?;
        Ok(outcome)
    }

    fn provider(&self) -> &QueueProvider {
        &self.inner.provider
    }

    async fn settle<F, Fut>(&self, action: &'static str, op: F) -> MessagingResult<Settlement>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MessagingResult<DeliveryOutcome>>,
    {
        if self
            .inner
            .state
            .compare_exchange(PENDING, SETTLING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(
                topic = %self.topic(),
                position = %self.receipt().position(),
                action,
                "Delivery already settled; ignoring"
            );
            return Ok(Settlement::AlreadySettled);
        }

        let staged = self.inner.staged.lock().clone();
        let result = match staged {
            Some(outcome) => self.commit_staged(action, outcome).await,
            None => op().await,
        };

        match result {
            Ok(outcome) => {
                *self.inner.outcome.lock() = Some(outcome);
                self.inner.state.store(SETTLED, Ordering::Release);
                Ok(Settlement::Applied)
            }
            Err(e) => {
                self.inner.state.store(PENDING, Ordering::Release);
                warn!(
                    topic = %self.topic(),
                    position = %self.receipt().position(),
                    action,
                    error = %e,
                    "Settlement failed; delivery remains unsettled"
                );
                Err(e)
            }
        }
    }
}
