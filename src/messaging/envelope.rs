//! # Message Envelope
//!
//! The record every backend stores: the payload plus retry bookkeeping.
//!
//! Wire form (camelCase, epoch milliseconds):
//!
//! ```text
//! { payload: string, timestamp: int64, retryCount: uint,
//!   nextRetryAt: int64|null, maxRetries: uint, retryInterval: int64 }
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetryDefaultsConfig;

/// Serialized message record shared by all queue backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub payload: String,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,

    pub retry_count: u32,

    #[serde(with = "chrono::serde::ts_milliseconds_option", default)]
    pub next_retry_at: Option<DateTime<Utc>>,

    pub max_retries: u32,

    /// Retry interval in milliseconds
    #[serde(rename = "retryInterval")]
    pub retry_interval_ms: u64,
}

impl MessageEnvelope {
    /// Wrap a payload, applying `options` over `defaults`
    pub fn new(
        payload: impl Into<String>,
        options: &EnqueueOptions,
        defaults: &RetryDefaultsConfig,
    ) -> Self {
        Self {
            payload: payload.into(),
            timestamp: Utc::now(),
            retry_count: options.retry_count.unwrap_or(0),
            next_retry_at: options.next_retry_at,
            max_retries: options.max_retries.unwrap_or(defaults.max_retries),
            retry_interval_ms: options
                .retry_interval
                .map_or(defaults.retry_interval_ms, duration_millis),
        }
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Retry budget is spent; the delivery should be dead-lettered
    pub fn is_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Whether the envelope may be handed to a handler at `now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Time left until the envelope is due, zero when already due
    pub fn delay_until_due(&self, now: DateTime<Utc>) -> Duration {
        self.next_retry_at
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }

    /// Envelope for the next attempt, or `None` once that attempt would exceed `max_retries`
    pub fn next_attempt(&self, retry_at: Option<DateTime<Utc>>) -> Option<Self> {
        let retry_count = self.retry_count.checked_add(1)?;
        if retry_count > self.max_retries {
            return None;
        }

        let now = Utc::now();
        let next_retry_at = retry_at.unwrap_or_else(|| {
            now + chrono::Duration::milliseconds(
                i64::try_from(self.retry_interval_ms).unwrap_or(i64::MAX / 2),
            )
        });

        Some(Self {
            payload: self.payload.clone(),
            timestamp: now,
            retry_count,
            next_retry_at: Some(next_retry_at),
            max_retries: self.max_retries,
            retry_interval_ms: self.retry_interval_ms,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, super::MessagingError> {
        serde_json::to_vec(self).map_err(|e| super::MessagingError::message_serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, super::MessagingError> {
        serde_json::from_slice(bytes)
            .map_err(|e| super::MessagingError::message_deserialization(e.to_string()))
    }
}

/// Per-call overrides for `enqueue`
///
/// `retry_count` and `next_retry_at` are only set when re-queueing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    pub retry_count: Option<u32>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub retry_interval: Option<Duration>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    pub fn with_next_retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_retry_at = Some(at);
        self
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
