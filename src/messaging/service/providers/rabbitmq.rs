//! # RabbitMQ Queue Service
//!
//! AMQP 0.9.1 backend using the `lapin` crate.
//!
//! ## Topology per topic
//!
//! - `{topic}`: durable work queue, dead-letters to `{topic}_dlx`
//! - `{topic}_dlx` / `{topic}_dlq`: direct exchange and its bound dead-letter queue
//! - `{topic}_delay_{n}s`: holding queues for delayed retries, declared on
//!   first use. Each has a queue-level TTL of `n` seconds (a power of two)
//!   and dead-letters back into `{topic}` through the default exchange.
//!
//! A delay is rounded up to the next bucket, so a retry may run up to twice
//! its requested delay late but never early. Every message in a bucket shares
//! one TTL, so a long delay never holds a short one behind it. Delays beyond
//! the largest bucket come back early; the consumer parks them again until
//! their `nextRetryAt` has passed.
//!
//! ## Settlement
//!
//! - commit: `basic_ack`
//! - handler error without settlement: `basic_nack(requeue = false)`, routing
//!   the message to the DLQ through the queue's dead-letter exchange
//! - handler returned `Ok` without settlement: `basic_nack(requeue = true)`
//!
//! Each consumer gets its own channel with `basic_qos(concurrency)`.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{RabbitMqConfig, RetryDefaultsConfig};
use crate::config::loader::redact_url_credentials;
use crate::constants::suffixes;
use crate::messaging::delivery::Delivery;
use crate::messaging::envelope::{duration_millis, MessageEnvelope};
use crate::messaging::service::consumer::DispatchPool;
use crate::messaging::service::provider::QueueProvider;
use crate::messaging::service::traits::{DeliveryHandler, QueueService};
use crate::messaging::service::types::{
    ConsumeOptions, ConsumerHandle, ConsumerStats, DeliveryReceipt, MessageId,
};
use crate::messaging::{MessagingError, MessagingResult};

const PROVIDER: &str = "rabbitmq";

struct RabbitMqInner {
    connection: Connection,
    /// Publisher channel with confirms enabled
    channel: Channel,
    config: RabbitMqConfig,
    retry_defaults: RetryDefaultsConfig,
    declared_topics: RwLock<HashSet<String>>,
    declared_delay_queues: RwLock<HashSet<String>>,
    closed: AtomicBool,
}

/// RabbitMQ-backed queue service
#[derive(Clone)]
pub struct RabbitMqQueueService {
    inner: Arc<RabbitMqInner>,
}

impl fmt::Debug for RabbitMqQueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqQueueService")
            .field("url", &redact_url_credentials(&self.inner.config.url))
            .field("connection_name", &self.inner.config.connection_name)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

fn dlx_name(topic: &str) -> String {
    format!("{topic}{}", suffixes::DEAD_LETTER_EXCHANGE)
}

fn dlq_name(topic: &str) -> String {
    format!("{topic}{}", suffixes::DEAD_LETTER_QUEUE)
}

/// Largest delay bucket, about 18 hours
const MAX_DELAY_BUCKET_SECS: u64 = 1 << 16;

/// Round `delay` up to a whole power-of-two number of seconds
fn delay_bucket_secs(delay: Duration) -> u64 {
    let millis = duration_millis(delay);
    let secs = millis.div_ceil(1000).max(1);
    secs.checked_next_power_of_two()
        .map_or(MAX_DELAY_BUCKET_SECS, |bucket| bucket.min(MAX_DELAY_BUCKET_SECS))
}

fn delay_queue_name(topic: &str, bucket_secs: u64) -> String {
    format!("{topic}{}_{bucket_secs}s", suffixes::DELAY_QUEUE)
}

fn durable() -> QueueDeclareOptions {
    QueueDeclareOptions {
        durable: true,
        ..Default::default()
    }
}

fn persistent_properties(message_id: &str) -> BasicProperties {
    BasicProperties::default()
        .with_delivery_mode(2)
        .with_content_type("application/json".into())
        .with_message_id(message_id.to_string().into())
        .with_timestamp(Utc::now().timestamp().max(0) as u64)
}

impl RabbitMqQueueService {
    /// Connect to the broker, failing after `connection_timeout_seconds`
    pub async fn connect(
        config: RabbitMqConfig,
        retry_defaults: RetryDefaultsConfig,
    ) -> MessagingResult<Self> {
        let redacted = redact_url_credentials(&config.url);
        debug!(url = %redacted, "Connecting to RabbitMQ");

        let connect = Connection::connect(
            &config.url,
            ConnectionProperties::default()
                .with_connection_name(config.connection_name.clone().into()),
        );
        let connection = tokio::time::timeout(config.connection_timeout(), connect)
            .await
            .map_err(|_| {
                MessagingError::timeout(
                    "rabbitmq connect",
                    u64::from(config.connection_timeout_seconds),
                )
            })?
            .map_err(|e| MessagingError::connection(format!("RabbitMQ connection failed: {e}")))?;

        let channel = connection.create_channel().await.map_err(|e| {
            MessagingError::connection(format!("RabbitMQ channel creation failed: {e}"))
        })?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| {
                MessagingError::configuration(
                    "rabbitmq",
                    format!("Failed to enable publisher confirms: {e}"),
                )
            })?;

        info!(url = %redacted, "Connected to RabbitMQ");
        Ok(Self {
            inner: Arc::new(RabbitMqInner {
                connection,
                channel,
                config,
                retry_defaults,
                declared_topics: RwLock::new(HashSet::new()),
                declared_delay_queues: RwLock::new(HashSet::new()),
                closed: AtomicBool::new(false),
            }),
        })
    }

    fn ensure_open(&self) -> MessagingResult<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(MessagingError::closed(PROVIDER));
        }
        Ok(())
    }

    /// Declare the work queue; returns the broker's current message count
    async fn declare_work_queue(&self, topic: &str) -> MessagingResult<u32> {
        let mut args = FieldTable::default();
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dlx_name(topic).into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(topic.into()),
        );

        let queue = self
            .inner
            .channel
            .queue_declare(topic, durable(), args)
            .await
            .map_err(|e| {
                MessagingError::queue_creation(topic, format!("Queue creation failed: {e}"))
            })?;
        Ok(queue.message_count())
    }

    /// Declare the dead-letter queue; returns its current message count
    async fn declare_dead_letter_queue(&self, topic: &str) -> MessagingResult<u32> {
        let dlq = dlq_name(topic);
        let queue = self
            .inner
            .channel
            .queue_declare(&dlq, durable(), FieldTable::default())
            .await
            .map_err(|e| {
                MessagingError::queue_creation(&dlq, format!("DLQ creation failed: {e}"))
            })?;
        Ok(queue.message_count())
    }

    async fn setup_dlx(&self, topic: &str) -> MessagingResult<()> {
        let dlx = dlx_name(topic);

        self.inner
            .channel
            .exchange_declare(
                &dlx,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::queue_creation(&dlx, format!("DLX creation failed: {e}")))?;

        self.declare_dead_letter_queue(topic).await?;

        let dlq = dlq_name(topic);
        self.inner
            .channel
            .queue_bind(
                &dlq,
                &dlx,
                topic,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::queue_creation(&dlq, format!("DLQ binding failed: {e}")))?;

        Ok(())
    }

    /// Declare the delay queue for `bucket_secs` once per process
    async fn ensure_delay_queue(&self, topic: &str, bucket_secs: u64) -> MessagingResult<String> {
        let delay = delay_queue_name(topic, bucket_secs);
        if self.inner.declared_delay_queues.read().contains(&delay) {
            return Ok(delay);
        }

        let mut args = FieldTable::default();
        args.insert(
            "x-message-ttl".into(),
            AMQPValue::LongLongInt(i64::try_from(bucket_secs * 1000).unwrap_or(i64::MAX)),
        );
        args.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString("".into()),
        );
        args.insert(
            "x-dead-letter-routing-key".into(),
            AMQPValue::LongString(topic.into()),
        );

        self.inner
            .channel
            .queue_declare(&delay, durable(), args)
            .await
            .map_err(|e| {
                MessagingError::queue_creation(&delay, format!("Delay queue creation failed: {e}"))
            })?;

        self.inner.declared_delay_queues.write().insert(delay.clone());
        debug!(topic = %topic, queue = %delay, "RabbitMQ delay queue declared");
        Ok(delay)
    }

    /// Declare the topic's full topology once per process
    async fn ensure_topic(&self, topic: &str) -> MessagingResult<()> {
        if self.inner.declared_topics.read().contains(topic) {
            return Ok(());
        }

        self.setup_dlx(topic).await?;
        self.declare_work_queue(topic).await?;

        self.inner.declared_topics.write().insert(topic.to_string());
        debug!(topic = %topic, "RabbitMQ topology declared");
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> MessagingResult<()> {
        let confirm = self
            .inner
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| MessagingError::send(routing_key, format!("Publish failed: {e}")))?;

        let confirmation = confirm.await.map_err(|e| {
            MessagingError::send(routing_key, format!("Publish confirmation failed: {e}"))
        })?;
        if confirmation.is_nack() {
            return Err(MessagingError::send(routing_key, "Broker rejected publish"));
        }
        Ok(())
    }

    /// Park a delivery that came back from the longest delay bucket early
    async fn repark(
        &self,
        channel: &Channel,
        topic: &str,
        delivery_tag: u64,
        envelope: MessageEnvelope,
    ) {
        let result = match self.enqueue(topic, envelope).await {
            Ok(_) => channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await,
            Err(e) => {
                warn!(topic = %topic, delivery_tag, error = %e, "Re-parking early delivery failed");
                channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        },
                    )
                    .await
            }
        };
        if let Err(e) = result {
            error!(topic = %topic, delivery_tag, error = %e, "Settling early delivery failed");
        }
    }
}

#[async_trait]
impl QueueService for RabbitMqQueueService {
    async fn enqueue(&self, topic: &str, envelope: MessageEnvelope) -> MessagingResult<MessageId> {
        self.ensure_open()?;
        self.ensure_topic(topic).await?;

        let message_id = Uuid::new_v4().to_string();
        let payload = envelope.to_bytes()?;
        let delay = envelope.delay_until_due(Utc::now());

        if delay.is_zero() {
            self.publish("", topic, &payload, persistent_properties(&message_id))
                .await?;
        } else {
            let delay_queue = self
                .ensure_delay_queue(topic, delay_bucket_secs(delay))
                .await?;
            self.publish("", &delay_queue, &payload, persistent_properties(&message_id))
                .await?;
            debug!(
                topic = %topic,
                message_id = %message_id,
                queue = %delay_queue,
                delay_ms = duration_millis(delay),
                "Delayed message parked on delay queue"
            );
        }

        Ok(MessageId::new(message_id))
    }

    async fn consume(
        &self,
        topic: &str,
        handler: Arc<dyn DeliveryHandler>,
        options: ConsumeOptions,
    ) -> MessagingResult<ConsumerHandle> {
        self.ensure_open()?;
        self.ensure_topic(topic).await?;

        let channel = self.inner.connection.create_channel().await.map_err(|e| {
            MessagingError::connection(format!("RabbitMQ channel creation failed: {e}"))
        })?;
        channel
            .basic_qos(options.concurrency, BasicQosOptions::default())
            .await
            .map_err(|e| {
                MessagingError::configuration("rabbitmq", format!("Failed to set QoS: {e}"))
            })?;

        let consumer_tag = format!("{}-{}", self.inner.config.connection_name, Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                topic,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| MessagingError::receive(topic, format!("basic_consume failed: {e}")))?;

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let consuming = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(ConsumerStats::default());

        let service = self.clone();
        let provider = QueueProvider::RabbitMq(self.clone());
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
                    next = consumer.next() => next,
                };

                let amqp_delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        error!(topic = %topic_name, error = %e, "RabbitMQ consumer stream failed");
                        break;
                    }
                    None => {
                        warn!(topic = %topic_name, "RabbitMQ consumer stream ended");
                        break;
                    }
                };

                let delivery_tag = amqp_delivery.delivery_tag;
                match MessageEnvelope::from_bytes(&amqp_delivery.data) {
                    Ok(envelope) if !envelope.is_due(Utc::now()) => {
                        drop(permit);
                        service
                            .repark(&channel, &topic_name, delivery_tag, envelope)
                            .await;
                    }
                    Ok(envelope) => {
                        let delivery = Delivery::new(
                            topic_name.clone(),
                            envelope,
                            DeliveryReceipt::RabbitMq {
                                delivery_tag,
                                channel: channel.clone(),
                            },
                            provider.clone(),
                        );
                        pool.spawn(permit, delivery);
                    }
                    Err(e) => {
                        error!(
                            topic = %topic_name,
                            delivery_tag,
                            error = %e,
                            "Undecodable envelope; rejecting to dead-letter exchange"
                        );
                        if let Err(e) = channel
                            .basic_nack(
                                delivery_tag,
                                BasicNackOptions {
                                    requeue: false,
                                    ..Default::default()
                                },
                            )
                            .await
                        {
                            error!(topic = %topic_name, delivery_tag, error = %e, "basic_nack failed");
                        }
                    }
                }
            }

            if let Err(e) = channel
                .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                .await
            {
                debug!(topic = %topic_name, error = %e, "basic_cancel failed");
            }
            pool.drain().await;
            if let Err(e) = channel.close(200, "consumer stopped").await {
                debug!(topic = %topic_name, error = %e, "Consumer channel close failed");
            }
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
        self.ensure_open()?;
        self.ensure_topic(topic).await?;
        let count = self
            .declare_work_queue(topic)
            .await
            .map_err(|e| MessagingError::queue_stats(topic, e.to_string()))?;
        Ok(u64::from(count))
    }

    async fn dead_letter_depth(&self, topic: &str) -> MessagingResult<u64> {
        self.ensure_open()?;
        self.ensure_topic(topic).await?;
        let count = self
            .declare_dead_letter_queue(topic)
            .await
            .map_err(|e| MessagingError::queue_stats(dlq_name(topic), e.to_string()))?;
        Ok(u64::from(count))
    }

    async fn commit(&self, topic: &str, receipt: &DeliveryReceipt) -> MessagingResult<()> {
        let DeliveryReceipt::RabbitMq {
            delivery_tag,
            channel,
        } = receipt
        else {
            return Err(MessagingError::invalid_receipt(PROVIDER));
        };

        channel
            .basic_ack(*delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::ack(topic, delivery_tag, e.to_string()))
    }

    async fn release(
        &self,
        topic: &str,
        receipt: &DeliveryReceipt,
        _envelope: &MessageEnvelope,
        handler_failed: bool,
    ) -> MessagingResult<()> {
        let DeliveryReceipt::RabbitMq {
            delivery_tag,
            channel,
        } = receipt
        else {
            return Err(MessagingError::invalid_receipt(PROVIDER));
        };

        let requeue = !handler_failed;
        channel
            .basic_nack(
                *delivery_tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| MessagingError::nack(topic, delivery_tag, e.to_string()))?;

        if requeue {
            warn!(topic = %topic, delivery_tag, "Unsettled delivery requeued");
        } else {
            warn!(topic = %topic, delivery_tag, "Failed delivery rejected to dead-letter exchange");
        }
        Ok(())
    }

    async fn store_dead_letter(
        &self,
        topic: &str,
        envelope: &MessageEnvelope,
    ) -> MessagingResult<()> {
        self.ensure_open()?;
        self.ensure_topic(topic).await?;

        let payload = envelope.to_bytes()?;
        let message_id = Uuid::new_v4().to_string();
        self.publish(
            &dlx_name(topic),
            topic,
            &payload,
            persistent_properties(&message_id),
        )
        .await
        .map_err(|e| MessagingError::dead_letter(topic, e.to_string()))
    }

    async fn health_check(&self) -> MessagingResult<bool> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(false);
        }
        Ok(self.inner.connection.status().connected())
    }

    async fn close(&self) -> MessagingResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            debug!(provider = PROVIDER, "Queue service already closed");
            return Ok(());
        }

        if self.inner.connection.status().connected() {
            self.inner
                .connection
                .close(200, "closing")
                .await
                .map_err(|e| MessagingError::connection(format!("RabbitMQ close failed: {e}")))?;
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
