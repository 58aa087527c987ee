//! # In-Memory Queue Service
//!
//! In-process queue backend. Also the backend the queue manager falls back to
//! when the configured one cannot be reached.
//!
//! - Delivers the first due message of a topic, FIFO among due messages
//! - Delayed retries wait in place until `nextRetryAt`
//! - Delivered messages sit in an in-flight set until committed or released
//! - Not durable: everything is lost when the process exits

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info, warn};

use crate::config::RetryDefaultsConfig;
use crate::constants::REDELIVERY_BACKOFF_MS;
use crate::messaging::dead_letter::{DeadLetterRecord, DeadLetterStore};
use crate::messaging::delivery::Delivery;
use crate::messaging::envelope::MessageEnvelope;
use crate::messaging::service::consumer::DispatchPool;
use crate::messaging::service::provider::QueueProvider;
use crate::messaging::service::traits::{DeliveryHandler, QueueService};
use crate::messaging::service::types::{
    ConsumeOptions, ConsumerHandle, ConsumerStats, DeliveryReceipt, MessageId,
};
use crate::messaging::{MessagingError, MessagingResult};

const PROVIDER: &str = "in_memory";

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    envelope: MessageEnvelope,
}

#[derive(Debug, Default)]
struct TopicQueue {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<u64, StoredMessage>,
    notify: Arc<Notify>,
}

#[derive(Debug)]
struct InMemoryInner {
    topics: Mutex<HashMap<String, TopicQueue>>,
    dead_letters: DeadLetterStore,
    retry_defaults: RetryDefaultsConfig,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Thread-safe in-process queue backend
#[derive(Debug, Clone)]
pub struct InMemoryQueueService {
    inner: Arc<InMemoryInner>,
}

impl Default for InMemoryQueueService {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueueService {
    pub fn new() -> Self {
        Self::with_retry_defaults(RetryDefaultsConfig::default())
    }

    pub fn with_retry_defaults(retry_defaults: RetryDefaultsConfig) -> Self {
        Self {
            inner: Arc::new(InMemoryInner {
                topics: Mutex::new(HashMap::new()),
                dead_letters: DeadLetterStore::new(),
                retry_defaults,
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Snapshot of the dead letters recorded for `topic`
    pub fn dead_letters(&self, topic: &str) -> Vec<DeadLetterRecord> {
        self.inner.dead_letters.list(topic)
    }

    /// Messages waiting to be delivered (excludes in-flight)
    pub fn ready_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet committed or released
    pub fn in_flight_count(&self, topic: &str) -> usize {
        self.inner
            .topics
            .lock()
            .get(topic)
            .map_or(0, |q| q.in_flight.len())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.is_closed() {
            return Err(MessagingError::closed(PROVIDER));
        }
        Ok(())
    }

    fn topic_notify(&self, topic: &str) -> Arc<Notify> {
        let mut topics = self.inner.topics.lock();
        Arc::clone(&topics.entry(topic.to_string()).or_default().notify)
    }

    /// Wait for the next due message and move it to the in-flight set
    ///
    /// Returns `None` once the service is closed.
    async fn next_due(&self, topic: &str) -> Option<StoredMessage> {
        let notify = self.topic_notify(topic);

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_closed() {
                return None;
            }

            let wait = {
                let mut topics = self.inner.topics.lock();
                let queue = topics.entry(topic.to_string()).or_default();
                let now = Utc::now();

                let due = queue.ready.iter().position(|m| m.envelope.is_due(now));
                if let Some(message) = due.and_then(|pos| queue.ready.remove(pos)) {
                    queue.in_flight.insert(message.id, message.clone());
                    return Some(message);
                }

                queue
                    .ready
                    .iter()
                    .map(|m| m.envelope.delay_until_due(now))
                    .min()
            };

            match wait {
                Some(delay) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(delay.max(Duration::from_millis(1))) => {}
                    }
                }
                None => notified.await,
            }
        }
    }
}

#[async_trait]
impl QueueService for InMemoryQueueService {
    async fn enqueue(&self, topic: &str, envelope: MessageEnvelope) -> MessagingResult<MessageId> {
        self.ensure_open()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let notify = {
            let mut topics = self.inner.topics.lock();
            let queue = topics.entry(topic.to_string()).or_default();
            queue.ready.push_back(StoredMessage { id, envelope });
            Arc::clone(&queue.notify)
        };
        notify.notify_waiters();

        debug!(topic = %topic, message_id = id, "Message enqueued");
        Ok(MessageId::from(id))
    }

    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> MessagingResult<ConsumerHandle> {
        self.ensure_open()?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let consuming = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ConsumerStats::default());

        let service = self.clone();
        let provider = QueueProvider::InMemory(self.clone());
        let topic_name = topic.to_string();
        let consuming_flag = Arc::clone(&consuming);
        let mut pool = DispatchPool::new(topic, handler, options.concurrency, Arc::clone(&stats));

        let task = tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    permit = pool.acquire() => permit,
                };
                let Some(permit) = permit else { break };

                let next = tokio::select! {
                    biased;
                    _ = &mut shutdown_rx => break,
                    message = service.next_due(&topic_name) => message,
                };
                let Some(message) = next else { break };

                let delivery = Delivery::new(
                    topic_name.clone(),
                    message.envelope,
                    DeliveryReceipt::InMemory {
                        message_id: message.id,
                    },
                    provider.clone(),
                );
                pool.spawn(permit, delivery);
            }

            pool.drain().await;
            consuming_flag.store(false, Ordering::Release);
        });

        info!(
            topic = %topic,
            concurrency = options.concurrency,
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

    async fn depth(&self, topic: &str) -> MessagingResult<u64> {
        let topics = self.inner.topics.lock();
        Ok(topics
            .get(topic)
            .map_or(0, |q| (q.ready.len() + q.in_flight.len()) as u64))
    }

    async fn dead_letter_depth(&self, topic: &str) -> MessagingResult<u64> {
        Ok(self.inner.dead_letters.depth(topic))
    }

    async fn commit(&self, topic: &str, receipt: &DeliveryReceipt) -> MessagingResult<()> {
        let DeliveryReceipt::InMemory { message_id } = receipt else {
            return Err(MessagingError::invalid_receipt(PROVIDER));
        };

        let removed = self
            .inner
            .topics
            .lock()
            .get_mut(topic)
            .and_then(|q| q.in_flight.remove(message_id));

        match removed {
            Some(_) => Ok(()),
            None => Err(MessagingError::ack(
                topic,
                message_id,
                "message is not in flight",
            )),
        }
    }

    async fn release(
        &self,
        topic: &str,
        receipt: &DeliveryReceipt,
        _envelope: &MessageEnvelope,
        _handler_failed: bool,
    ) -> MessagingResult<()> {
        let DeliveryReceipt::InMemory { message_id } = receipt else {
            return Err(MessagingError::invalid_receipt(PROVIDER));
        };

        let notify = {
            let mut topics = self.inner.topics.lock();
            let queue = topics
                .get_mut(topic)
                .ok_or_else(|| MessagingError::queue_not_found(topic))?;
            let mut message = queue.in_flight.remove(message_id).ok_or_else(|| {
                MessagingError::nack(topic, message_id, "message is not in flight")
            })?;

            let redeliver_at = Utc::now()
                + chrono::Duration::milliseconds(REDELIVERY_BACKOFF_MS as i64);
            if message.envelope.next_retry_at.map_or(true, |at| at < redeliver_at) {
                message.envelope.next_retry_at = Some(redeliver_at);
            }
            queue.ready.push_front(message);
            Arc::clone(&queue.notify)
        };
        notify.notify_waiters();

        warn!(topic = %topic, message_id, "Unsettled delivery requeued");
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
        Ok(!self.is_closed())
    }

    async fn close(&self) -> MessagingResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(provider = PROVIDER, "Queue service already closed");
            return Ok(());
        }

        let notifies: Vec<Arc<Notify>> = self
            .inner
            .topics
            .lock()
            .values()
            .map(|q| Arc::clone(&q.notify))
            .collect();
        for notify in notifies {
            notify.notify_waiters();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::envelope::EnqueueOptions;
    use crate::messaging::service::traits::handler_fn;
    use std::sync::atomic::AtomicUsize;

    fn envelope(payload: &str) -> MessageEnvelope {
        MessageEnvelope::new(payload, &EnqueueOptions::default(), &RetryDefaultsConfig::default())
    }

    #[tokio::test]
    async fn test_enqueue_increments_depth() {
        let service = InMemoryQueueService::new();
        service.enqueue("builds", envelope("a")).await.expect("enqueue");
        service.enqueue("builds", envelope("b")).await.expect("enqueue");

        assert_eq!(service.depth("builds").await.expect("depth"), 2);
        assert_eq!(service.depth("other").await.expect("depth"), 0);
    }

    #[tokio::test]
    async fn test_next_due_is_fifo_among_due_messages() {
        let service = InMemoryQueueService::new();
        let mut delayed = envelope("later");
        delayed.next_retry_at = Some(Utc::now() + chrono::Duration::hours(1));

        service.enqueue("t", delayed).await.expect("enqueue");
        service.enqueue("t", envelope("first")).await.expect("enqueue");
        service.enqueue("t", envelope("second")).await.expect("enqueue");

        let first = service.next_due("t").await.expect("due message");
        let second = service.next_due("t").await.expect("due message");
        assert_eq!(first.envelope.payload, "first");
        assert_eq!(second.envelope.payload, "second");
        assert_eq!(service.ready_count("t"), 1);
        assert_eq!(service.in_flight_count("t"), 2);
    }

    #[tokio::test]
    async fn test_commit_unknown_message_fails() {
        let service = InMemoryQueueService::new();
        let result = service
            .commit("t", &DeliveryReceipt::InMemory { message_id: 99 })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_enqueue() {
        let service = InMemoryQueueService::new();
        service.close().await.expect("first close");
        service.close().await.expect("second close");

        assert!(matches!(
            service.enqueue("t", envelope("x")).await,
            Err(MessagingError::Closed { .. })
        ));
        assert!(!service.health_check().await.expect("health"));
    }

    #[tokio::test]
    async fn test_consumer_stops_when_service_closes() {
        let service = InMemoryQueueService::new();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&handled);

        let handle = service
            .consume(
                "t",
                handler_fn(move |delivery: Delivery| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        delivery.ack().await?;
                        Ok(())
                    }
                }),
                ConsumeOptions::default(),
            )
            .await
            .expect("consume");

        service.enqueue("t", envelope("x")).await.expect("enqueue");
        tokio::time::timeout(Duration::from_secs(2), async {
            while handled.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("message handled");

        service.close().await.expect("close");
        handle.stop().await.expect("stop");
        assert_eq!(service.depth("t").await.expect("depth"), 0);
    }
}
