//! # Dead-Letter Store
//!
//! Per-topic, append-only record of envelopes that exhausted their retry
//! budget or were explicitly dead-lettered by a handler.
//!
//! Used directly by the in-process backend and as the auxiliary store of the
//! Redis Streams backend. That backend has no native dead-letter concept, so
//! its dead letters live only in this process and are lost on restart.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::envelope::MessageEnvelope;

/// A dead-lettered envelope and the topic it was removed from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_topic: String,
    pub envelope: MessageEnvelope,
    pub dead_lettered_at: DateTime<Utc>,
}

/// Thread-safe in-process dead-letter store
#[derive(Debug, Clone, Default)]
pub struct DeadLetterStore {
    records: Arc<RwLock<HashMap<String, Vec<DeadLetterRecord>>>>,
}

impl DeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, topic: &str, envelope: MessageEnvelope) {
        let record = DeadLetterRecord {
            original_topic: topic.to_string(),
            envelope,
            dead_lettered_at: Utc::now(),
        };
        self.records
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(record);
    }

    pub fn depth(&self, topic: &str) -> u64 {
        self.records
            .read()
            .get(topic)
            .map_or(0, |records| records.len() as u64)
    }

    /// Snapshot of a topic's dead letters, oldest first
    pub fn list(&self, topic: &str) -> Vec<DeadLetterRecord> {
        self.records.read().get(topic).cloned().unwrap_or_default()
    }

    /// Remove and return all dead letters of a topic
    pub fn drain(&self, topic: &str) -> Vec<DeadLetterRecord> {
        self.records.write().remove(topic).unwrap_or_default()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.records.read().keys().cloned().collect();
        topics.sort();
        topics
    }
}
