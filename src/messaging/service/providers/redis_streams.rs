//! # Redis Streams Queue Service
//!
//! Log-based backend on Redis Streams consumer groups.
//!
//! - A topic is split into `partitions` streams named `{topic}:p{n}`;
//!   `enqueue` spreads entries round-robin
//! - Consumers of one topic share a consumer group; `XACK` is the commit
//! - An entry whose `nextRetryAt` is in the future pauses its partition for
//!   `min(delay, max_pause_ms)`, then the entry is checked again. Later entries
//!   of that partition wait behind it; other partitions keep flowing
//! - Unsettled deliveries go back to the front of their partition after a
//!   short backoff; entries stuck with a dead consumer are reclaimed with
//!   `XCLAIM` once idle for `claim_idle_ms`
//!
//! The backend has no native dead-letter concept. Dead letters are kept in an
//! in-process [`DeadLetterStore`] and are lost on restart. `depth` reports `0`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::loader::redact_url_credentials;
use crate::config::{RedisStreamsConfig, RetryDefaultsConfig};
use crate::constants::REDELIVERY_BACKOFF_MS;
use crate::messaging::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::messaging::delivery::Delivery;
use crate::messaging::envelope::{duration_millis, EnqueueOptions, MessageEnvelope};
use crate::messaging::service::consumer::DispatchPool;
use crate::messaging::service::provider::QueueProvider;
use crate::messaging::service::traits::{DeliveryHandler, QueueService};
use crate::messaging::service::types::{
    ConsumeOptions, ConsumerHandle, ConsumerStats, DeliveryReceipt, MessageId, PendingRedelivery,
};
use crate::messaging::{MessagingError, MessagingResult};

const PROVIDER: &str = "redis_streams";
const ENVELOPE_FIELD: &str = "envelope";
const RECLAIM_BATCH: usize = 16;
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

struct RedisStreamsInner {
    client: redis::Client,
    connection: ConnectionManager,
    config: RedisStreamsConfig,
    retry_defaults: RetryDefaultsConfig,
    dead_letters: DeadLetterStore,
    round_robin: Mutex<HashMap<String, usize>>,
    groups: RwLock<HashSet<String>>,
    closed: AtomicBool,
}

/// Redis Streams-backed queue service
#[derive(Clone)]
pub struct RedisStreamsQueueService {
    inner: Arc<RedisStreamsInner>,
}

impl fmt::Debug for RedisStreamsQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStreamsQueueService")
            .field("url", &redact_url_credentials(&self.inner.config.url))
            .field("consumer_group", &self.inner.config.consumer_group)
            .field("partitions", &self.inner.config.partitions)
            .finish_non_exhaustive()
    }
}

pub(crate) fn partition_key(topic: &str, partition: u16) -> String {
    format!("{topic}:p{partition}")
}

impl RedisStreamsQueueService {
    /// Connect and verify the server answers `PING`
    pub async fn connect(
        config: RedisStreamsConfig,
        retry_defaults: RetryDefaultsConfig,
    ) -> MessagingResult<Self> {
        let redacted = redact_url_credentials(&config.url);
        debug!(url = %redacted, "Connecting to Redis");

        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            MessagingError::configuration("redis_streams", format!("Invalid Redis URL: {e}"))
        })?;

        let timeout_seconds = u64::from(config.connection_timeout_seconds);
        let mut connection = tokio::time::timeout(
            config.connection_timeout(),
            ConnectionManager::new(client.clone()),
        )
        .await
        .map_err(|_| MessagingError::timeout("redis connect", timeout_seconds))?
        .map_err(|e| MessagingError::connection(format!("Failed to connect to Redis: {e}")))?;

        let _: String = tokio::time::timeout(
            config.connection_timeout(),
            redis::cmd("PING").query_async(&mut connection),
        )
        .await
        .map_err(|_| MessagingError::timeout("redis ping", timeout_seconds))?
        .map_err(|e| MessagingError::connection(format!("Redis PING failed: {e}")))?;

        info!(url = %redacted, partitions = config.partitions, "Connected to Redis Streams");
        Ok(Self {
            inner: Arc::new(RedisStreamsInner {
                client,
                connection,
                config,
                retry_defaults,
                dead_letters: DeadLetterStore::new(),
                round_robin: Mutex::new(HashMap::new()),
                groups: RwLock::new(HashSet::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Dead letters recorded in this process for `topic`
    pub fn dead_letters(&self, topic: &str) -> Vec<DeadLetterRecord> {
        self.inner.dead_letters.list(topic)
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.is_closed() {
            return Err(MessagingError::closed(PROVIDER));
        }
        Ok(())
    }

    fn partition_keys(&self, topic: &str) -> Vec<String> {
        (0..self.inner.config.partitions)
            .map(|p| partition_key(topic, p))
            .collect()
    }

    fn next_partition(&self, topic: &str) -> String {
        let partitions = usize::from(self.inner.config.partitions.max(1));
        let mut counters = self.inner.round_robin.lock();
        let counter = counters.entry(topic.to_string()).or_insert(0);
        let partition = *counter % partitions;
        *counter = counter.wrapping_add(1);
        partition_key(topic, partition as u16)
    }

    /// Create the consumer group on every partition (idempotent)
    async fn ensure_topic(&self, topic: &str) -> MessagingResult<()> {
        for key in self.partition_keys(topic) {
            if self.inner.groups.read().contains(&key) {
                continue;
            }

            let mut conn = self.inner.connection.clone();
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(&key)
                .arg(&self.inner.config.consumer_group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match created {
                Ok(_) => debug!(stream = %key, "Consumer group created"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => {
                    return Err(MessagingError::queue_creation(
                        &key,
                        format!("XGROUP CREATE failed: {e}"),
                    ))
                }
            }
            self.inner.groups.write().insert(key);
        }
        Ok(())
    }
}

#[async_trait]
impl QueueService for RedisStreamsQueueService {
    async fn enqueue(&self, topic: &str, envelope: MessageEnvelope) -> MessagingResult<MessageId> {
        self.ensure_open()?;
        self.ensure_topic(topic).await?;

        let key = self.next_partition(topic);
        let json = serde_json::to_string(&envelope)?;
        let mut conn = self.inner.connection.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(&key)
            .arg("*")
            .arg(ENVELOPE_FIELD)
            .arg(json)
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::send(&key, e.to_string()))?;

        debug!(topic = %topic, stream = %key, entry_id = %entry_id, "Entry appended");
        Ok(MessageId::new(format!("{key}/{entry_id}")))
    }

    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> MessagingResult<ConsumerHandle> {
        self.ensure_open()?;
        self.ensure_topic(topic).await?;

        let connection = self
            .inner
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MessagingError::connection(format!("Redis consumer connection failed: {e}")))?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (redeliver_tx, redeliver_rx) = mpsc::unbounded_channel();
        let consuming = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ConsumerStats::default());

        let consumer = StreamConsumer {
            service: self.clone(),
            provider: QueueProvider::RedisStreams(self.clone()),
            topic: topic.to_string(),
            consumer_name: format!(
                "{}-{}",
                self.inner.config.consumer_name_prefix,
                Uuid::new_v4()
            ),
            partitions: self.partition_keys(topic),
            connection,
            backlog: HashMap::new(),
            paused_until: HashMap::new(),
            redeliver_tx,
            last_reclaim: Instant::now(),
        };
        let pool = DispatchPool::new(topic, handler, options.concurrency, Arc::clone(&stats));
        let consuming_flag = Arc::clone(&consuming);

        let task = tokio::spawn(async move {
            consumer.run(pool, shutdown_rx, redeliver_rx).await;
            consuming_flag.store(false, Ordering::Release);
        });

        info!(
            topic = %topic,
            concurrency = options.concurrency,
            partitions = self.inner.config.partitions,
            provider = PROVIDER,
            "Consumer started"
        );
        Ok(ConsumerHandle::new(
            topic,
            PROVIDER,
            shutdown_tx,
            task,
            consuming,
            stats,
        ))
    }

    /// Always `0`: consumer-group lag is not a reliable depth signal
    async fn depth(&self, _topic: &str) -> MessagingResult<u64> {
        Ok(0)
    }

    async fn dead_letter_depth(&self, topic: &str) -> MessagingResult<u64> {
        Ok(self.inner.dead_letters.depth(topic))
    }

    async fn commit(&self, _topic: &str, receipt: &DeliveryReceipt) -> MessagingResult<()> {
        let DeliveryReceipt::RedisStreams {
            stream_key,
            entry_id,
            ..
        } = receipt
        else {
            return Err(MessagingError::invalid_receipt(PROVIDER));
        };

        let mut conn = self.inner.connection.clone();
        let _: u64 = redis::cmd("XACK")
            .arg(stream_key)
            .arg(&self.inner.config.consumer_group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::ack(stream_key, entry_id, e.to_string()))?;
        Ok(())
    }

    async fn release(
        &self,
        topic: &str,
        receipt: &DeliveryReceipt,
        envelope: &MessageEnvelope,
        _handler_failed: bool,
    ) -> MessagingResult<()> {
        let DeliveryReceipt::RedisStreams {
            stream_key,
            entry_id,
            redeliver,
        } = receipt
        else {
            return Err(MessagingError::invalid_receipt(PROVIDER));
        };

        let pending = PendingRedelivery {
            stream_key: stream_key.clone(),
            entry_id: entry_id.clone(),
            envelope: envelope.clone(),
        };
        if redeliver.send(pending).is_err() {
            // Consumer is gone; the entry stays pending until another consumer reclaims it
            warn!(topic = %topic, stream = %stream_key, entry_id = %entry_id,
                "Consumer stopped before redelivery; entry left pending");
        }
        Ok(())
    }

    async fn store_dead_letter(
        &self,
        topic: &str,
        envelope: &MessageEnvelope,
    ) -> MessagingResult<()> {
        self.inner.dead_letters.append(topic, envelope.clone());
        Ok(())
    }

    async fn health_check(&self) -> MessagingResult<bool> {
        if self.is_closed() {
            return Ok(false);
        }
        let mut conn = self.inner.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| MessagingError::health_check(e.to_string()))?;
        Ok(pong == "PONG")
    }

    async fn close(&self) -> MessagingResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(provider = PROVIDER, "Queue service already closed");
            return Ok(());
        }
        info!(provider = PROVIDER, "Queue service closed");
        Ok(())
    }

    fn retry_defaults(&self) -> &RetryDefaultsConfig {
        &self.inner.retry_defaults
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }
}

/// Entry fetched from a partition but not yet handed to the handler
struct BacklogEntry {
    entry_id: String,
    envelope: MessageEnvelope,
}

/// Consume loop state for one consumer of one topic
struct StreamConsumer {
    service: RedisStreamsQueueService,
    provider: QueueProvider,
    topic: String,
    consumer_name: String,
    partitions: Vec<String>,
    /// Dedicated connection; `XREADGROUP BLOCK` would stall a shared one
    connection: MultiplexedConnection,
    backlog: HashMap<String, VecDeque<BacklogEntry>>,
    paused_until: HashMap<String, Instant>,
    redeliver_tx: mpsc::UnboundedSender<PendingRedelivery>,
    last_reclaim: Instant,
}

impl StreamConsumer {
    fn config(&self) -> &RedisStreamsConfig {
        &self.service.inner.config
    }

    async fn run(
        mut self,
        mut pool: DispatchPool,
        mut shutdown_rx: oneshot::Receiver<()>,
        mut redeliver_rx: mpsc::UnboundedReceiver<PendingRedelivery>,
    ) {
        loop {
            if self.service.is_closed() {
                break;
            }
            while let Ok(pending) = redeliver_rx.try_recv() {
                self.requeue_front(pending);
            }

            let permit = tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                permit = pool.acquire() => permit,
            };
            let Some(permit) = permit else { break };

            if let Some((stream_key, entry)) = self.next_dispatchable() {
                let delivery = Delivery::new(
                    self.topic.clone(),
                    entry.envelope,
                    DeliveryReceipt::RedisStreams {
                        stream_key,
                        entry_id: entry.entry_id,
                        redeliver: self.redeliver_tx.clone(),
                    },
                    self.provider.clone(),
                );
                pool.spawn(permit, delivery);
                continue;
            }
            drop(permit);

            if self.last_reclaim.elapsed() >= self.reclaim_interval() {
                self.last_reclaim = Instant::now();
                match self.reclaim_idle().await {
                    Ok(0) => {}
                    Ok(claimed) => {
                        info!(topic = %self.topic, claimed, "Reclaimed idle entries from other consumers");
                        continue;
                    }
                    Err(e) => warn!(topic = %self.topic, error = %e, "Reclaiming idle entries failed"),
                }
            }

            let readable = self.readable_partitions();
            if readable.is_empty() {
                let wake = self.earliest_resume();
                tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    Some(pending) = redeliver_rx.recv() => self.requeue_front(pending),
                    _ = tokio::time::sleep_until(wake) => {}
                }
                continue;
            }

            let read = tokio::select! {
                biased;
                _ = &mut shutdown_rx => break,
                read = self.read(&readable) => read,
            };
            match read {
                Ok(()) => {}
                Err(e) if e.is_timeout() => {}
                Err(e) => {
                    error!(topic = %self.topic, error = %e, "XREADGROUP failed");
                    tokio::select! {
                        biased;
                        _ = &mut shutdown_rx => break,
                        _ = tokio::time::sleep(READ_ERROR_BACKOFF) => {}
                    }
                }
            }
        }

        let undispatched: usize = self.backlog.values().map(VecDeque::len).sum();
        if undispatched > 0 {
            debug!(
                topic = %self.topic,
                undispatched,
                "Leaving fetched entries pending for reclaim"
            );
        }
        pool.drain().await;
    }

    fn reclaim_interval(&self) -> Duration {
        Duration::from_millis((self.config().claim_idle_ms / 2).max(1000))
    }

    fn requeue_front(&mut self, pending: PendingRedelivery) {
        let resume_at = Instant::now() + Duration::from_millis(REDELIVERY_BACKOFF_MS);
        self.backlog
            .entry(pending.stream_key.clone())
            .or_default()
            .push_front(BacklogEntry {
                entry_id: pending.entry_id,
                envelope: pending.envelope,
            });
        self.paused_until.insert(pending.stream_key, resume_at);
    }

    fn is_paused(&self, stream_key: &str, now: Instant) -> bool {
        self.paused_until
            .get(stream_key)
            .is_some_and(|until| *until > now)
    }

    /// Pop the head of the first unpaused partition whose head is due
    ///
    /// A head that is not yet due pauses its partition instead.
    fn next_dispatchable(&mut self) -> Option<(String, BacklogEntry)> {
        let now = Instant::now();
        let wall_now = Utc::now();
        let max_pause = Duration::from_millis(self.config().max_pause_ms);

        for stream_key in self.partitions.clone() {
            if self.is_paused(&stream_key, now) {
                continue;
            }
            let Some(queue) = self.backlog.get_mut(&stream_key) else {
                continue;
            };
            let Some(head) = queue.front() else {
                continue;
            };

            if head.envelope.is_due(wall_now) {
                self.paused_until.remove(&stream_key);
                if let Some(entry) = queue.pop_front() {
                    return Some((stream_key, entry));
                }
                continue;
            }

            let pause = head.envelope.delay_until_due(wall_now).min(max_pause);
            debug!(
                topic = %self.topic,
                stream = %stream_key,
                entry_id = %head.entry_id,
                pause_ms = duration_millis(pause),
                "Head entry not due; pausing partition"
            );
            self.paused_until.insert(stream_key, now + pause);
        }
        None
    }

    fn readable_partitions(&self) -> Vec<String> {
        let now = Instant::now();
        self.partitions
            .iter()
            .filter(|key| !self.is_paused(key, now))
            .filter(|key| self.backlog.get(*key).map_or(true, VecDeque::is_empty))
            .cloned()
            .collect()
    }

    fn earliest_resume(&self) -> Instant {
        let fallback = Instant::now() + Duration::from_millis(self.config().block_ms);
        self.paused_until
            .values()
            .copied()
            .min()
            .map_or(fallback, |at| at.min(fallback))
    }

    /// Read at most one new entry per readable partition into the backlog
    async fn read(&mut self, partitions: &[String]) -> redis::RedisResult<()> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.config().consumer_group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.config().block_ms)
            .arg("STREAMS");
        for key in partitions {
            cmd.arg(key);
        }
        for _ in partitions {
            cmd.arg(">");
        }

        let reply: Option<StreamReadReply> = cmd.query_async(&mut self.connection).await?;
        let Some(reply) = reply else {
            return Ok(());
        };

        for stream in reply.keys {
            for entry in stream.ids {
                self.accept(&stream.key, entry).await;
            }
        }
        Ok(())
    }

    /// Claim entries other consumers left idle past `claim_idle_ms`
    async fn reclaim_idle(&mut self) -> redis::RedisResult<usize> {
        let group = self.config().consumer_group.clone();
        let min_idle = self.config().claim_idle_ms;
        let mut claimed_total = 0;

        for stream_key in self.partitions.clone() {
            let pending: StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(&stream_key)
                .arg(&group)
                .arg("IDLE")
                .arg(min_idle)
                .arg("-")
                .arg("+")
                .arg(RECLAIM_BATCH)
                .query_async(&mut self.connection)
                .await?;

            // Our name carries a fresh UUID per consume call, so our own pending
            // entries are still in the backlog or in flight
            let ids: Vec<String> = pending
                .ids
                .into_iter()
                .filter(|p| p.consumer != self.consumer_name)
                .map(|p| p.id)
                .collect();
            if ids.is_empty() {
                continue;
            }

            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&stream_key)
                .arg(&group)
                .arg(&self.consumer_name)
                .arg(min_idle)
                .arg(&ids)
                .query_async(&mut self.connection)
                .await?;

            for entry in claimed.ids {
                claimed_total += 1;
                self.accept(&stream_key, entry).await;
            }
        }
        Ok(claimed_total)
    }

    /// Queue a fetched entry, dead-lettering it if the envelope cannot be decoded
    async fn accept(&mut self, stream_key: &str, entry: StreamId) {
        let raw: Option<String> = entry.get(ENVELOPE_FIELD);
        let decoded = raw
            .as_deref()
            .map(|json| serde_json::from_str::<MessageEnvelope>(json));

        match decoded {
            Some(Ok(envelope)) => {
                self.backlog
                    .entry(stream_key.to_string())
                    .or_default()
                    .push_back(BacklogEntry {
                        entry_id: entry.id,
                        envelope,
                    });
            }
            other => {
                let reason = match other {
                    Some(Err(e)) => e.to_string(),
                    _ => format!("missing '{ENVELOPE_FIELD}' field"),
                };
                error!(
                    topic = %self.topic,
                    stream = %stream_key,
                    entry_id = %entry.id,
                    reason = %reason,
                    "Undecodable stream entry; dead-lettering"
                );
                let envelope = MessageEnvelope::new(
                    raw.unwrap_or_default(),
                    &EnqueueOptions::default(),
                    &self.service.inner.retry_defaults,
                );
                let receipt = DeliveryReceipt::RedisStreams {
                    stream_key: stream_key.to_string(),
                    entry_id: entry.id,
                    redeliver: self.redeliver_tx.clone(),
                };
                let dead_lettered = async {
                    self.service.store_dead_letter(&self.topic, &envelope).await?;
                    self.service.commit(&self.topic, &receipt).await
                };
                if let Err(e) = dead_lettered.await {
                    error!(topic = %self.topic, error = %e, "Failed to dead-letter undecodable entry");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_key_format() {
        assert_eq!(partition_key("deployment-builds", 0), "deployment-builds:p0");
        assert_eq!(partition_key("imports", 12), "imports:p12");
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let config = RedisStreamsConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        let result = RedisStreamsQueueService::connect(config, RetryDefaultsConfig::default()).await;
        assert!(matches!(result, Err(MessagingError::Configuration { .. })));
    }

    // Integration tests require Redis; run with `cargo test -- --ignored`
    #[tokio::test]
    #[ignore = "requires Redis running"]
    async fn test_redis_enqueue_round_robin() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| RedisStreamsConfig::default().url);
        let config = RedisStreamsConfig {
            url,
            partitions: 2,
            ..Default::default()
        };
        let service = RedisStreamsQueueService::connect(config, RetryDefaultsConfig::default())
            .await
            .unwrap();

        let topic = format!("test_rr_{}", Uuid::new_v4());
        let first = service
            .enqueue_payload(&topic, "{}".to_string(), &EnqueueOptions::default())
            .await
            .unwrap();
        let second = service
            .enqueue_payload(&topic, "{}".to_string(), &EnqueueOptions::default())
            .await
            .unwrap();

        assert!(first.as_str().starts_with(&format!("{topic}:p0/")));
        assert!(second.as_str().starts_with(&format!("{topic}:p1/")));
        assert_eq!(service.depth(&topic).await.unwrap(), 0);
    }
}
