//! # System Constants
//!
//! Operational defaults of the dispatch subsystem. Each value can be
//! overridden through configuration; these are the fallbacks.

/// Retries allowed before an envelope must be dead-lettered
pub const DEFAULT_MAX_RETRIES: u32 = 7;

/// Delay before a failed envelope is retried (2 minutes)
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 2 * 60 * 1000;

/// Poller daemon tick (1 minute)
pub const DEFAULT_POLLER_TICK_SECONDS: u64 = 60;

/// Longest single pause of a log-based partition while a delayed retry waits
pub const MAX_PARTITION_PAUSE_MS: u64 = 5_000;

/// Topic the deployment build scheduler enqueues onto
pub const DEPLOYMENT_BUILD_TOPIC: &str = "deployment-builds";

/// Topic-name suffixes used by broker backends
pub mod suffixes {
    pub const DEAD_LETTER_EXCHANGE: &str = "_dlx";
    pub const DEAD_LETTER_QUEUE: &str = "_dlq";
    pub const DELAY_QUEUE: &str = "_delay";
}

/// Trigger-payload keys understood by the orchestrator
pub mod payload_keys {
    pub const POLLER_ID: &str = "pollerId";
    pub const NODE_ID: &str = "nodeId";
    pub const SCHEDULED_TIME: &str = "scheduledTime";
}

/// Backoff before an unsettled delivery is handed out again
pub const REDELIVERY_BACKOFF_MS: u64 = 1_000;
