//! Producer side of the transport.

use async_trait::async_trait;
use engagement_core::event_bus::{EventBusError, EventPublisher};
use rdkafka::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{
    BaseRecord, DeliveryResult, FutureProducer, FutureRecord, Producer, ProducerContext,
    ThreadedProducer,
};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_QUEUE_CAPACITY: usize = 100_000;

/// What a successful [`EventPublisher::publish`] means.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Success means the message is in the local buffer. Broker failures are
    /// reported to the delivery callback, which logs them.
    #[default]
    FireAndForget,
    /// Success means the broker acknowledged the message within `timeout`.
    Acknowledged {
        /// How long to wait for local enqueue plus acknowledgement
        timeout: Duration,
    },
}

/// Delivery callback for the fire-and-forget producer.
///
/// Runs on the client's polling thread after `publish` has long returned, so
/// logging is the only thing it can do with a failure.
pub struct DeliveryLogger;

impl ClientContext for DeliveryLogger {}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _opaque: Self::DeliveryOpaque) {
        match result {
            Ok(message) => {
                tracing::debug!(
                    topic = message.topic(),
                    partition = message.partition(),
                    offset = message.offset(),
                    "Message delivered"
                );
            },
            Err((error, message)) => {
                tracing::error!(
                    topic = message.topic(),
                    partition = message.partition(),
                    error = %error,
                    payload = %String::from_utf8_lossy(message.payload().unwrap_or_default()),
                    "Message delivery failed"
                );
            },
        }
    }
}

enum Backend {
    Buffered(Arc<ThreadedProducer<DeliveryLogger>>),
    Acknowledged {
        producer: FutureProducer,
        timeout: Duration,
    },
}

/// rdkafka-backed [`EventPublisher`].
///
/// # Example
///
/// ```no_run
/// use engagement_redpanda::{DeliveryMode, RedpandaPublisher};
/// use std::time::Duration;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let publisher = RedpandaPublisher::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .delivery_mode(DeliveryMode::Acknowledged { timeout: Duration::from_secs(2) })
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RedpandaPublisher {
    backend: Backend,
    brokers: String,
    mode: DeliveryMode,
}

impl RedpandaPublisher {
    /// Fire-and-forget publisher with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the client cannot be created.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the publisher.
    #[must_use]
    pub fn builder() -> RedpandaPublisherBuilder {
        RedpandaPublisherBuilder::default()
    }

    /// The bootstrap servers this publisher was built with.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// The configured delivery mode.
    #[must_use]
    pub const fn delivery_mode(&self) -> DeliveryMode {
        self.mode
    }
}

fn publish_error(topic: &str, error: &KafkaError) -> EventBusError {
    if matches!(
        error,
        KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)
    ) {
        EventBusError::QueueFull {
            topic: topic.to_string(),
        }
    } else {
        EventBusError::PublishFailed {
            topic: topic.to_string(),
            reason: error.to_string(),
        }
    }
}

#[async_trait]
impl EventPublisher for RedpandaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), EventBusError> {
        match &self.backend {
            Backend::Buffered(producer) => {
                let record = BaseRecord::<str, [u8]>::to(topic).payload(payload);
                let record = match key {
                    Some(key) => record.key(key),
                    None => record,
                };
                producer
                    .send(record)
                    .map_err(|(error, _)| publish_error(topic, &error))
            },
            Backend::Acknowledged { producer, timeout } => {
                let record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
                let record = match key {
                    Some(key) => record.key(key),
                    None => record,
                };
                match producer.send(record, Timeout::After(*timeout)).await {
                    Ok((partition, offset)) => {
                        tracing::debug!(
                            topic = %topic,
                            partition = partition,
                            offset = offset,
                            "Message acknowledged"
                        );
                        Ok(())
                    },
                    Err((error, _)) => Err(publish_error(topic, &error)),
                }
            },
        }
    }

    fn flush(&self, timeout: Duration) -> Result<(), EventBusError> {
        let (result, in_flight) = match &self.backend {
            Backend::Buffered(producer) => (
                producer.flush(Timeout::After(timeout)),
                producer.in_flight_count(),
            ),
            Backend::Acknowledged { producer, .. } => (
                producer.flush(Timeout::After(timeout)),
                producer.in_flight_count(),
            ),
        };
        result.map_err(|error| {
            tracing::warn!(in_flight = in_flight, error = %error, "Flush timed out");
            EventBusError::PublishFailed {
                topic: String::from("*"),
                reason: format!("{in_flight} message(s) still buffered: {error}"),
            }
        })
    }
}

/// Builder for configuring a [`RedpandaPublisher`].
#[derive(Default)]
pub struct RedpandaPublisherBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    queue_capacity: Option<usize>,
    delivery_mode: DeliveryMode,
}

impl RedpandaPublisherBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "1"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// How long the client keeps retrying a buffered message before giving up.
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Maximum number of messages held in the local buffer.
    ///
    /// Default: 100 000
    #[must_use]
    pub const fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Choose between fire-and-forget and acknowledged publishing.
    #[must_use]
    pub const fn delivery_mode(mut self, mode: DeliveryMode) -> Self {
        self.delivery_mode = mode;
        self
    }

    /// Build the [`RedpandaPublisher`].
    ///
    /// No connection is made here; the client connects lazily.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if brokers are not set or
    /// the client rejects the configuration.
    pub fn build(self) -> Result<RedpandaPublisher, EventBusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let timeout = self.timeout.unwrap_or(DEFAULT_MESSAGE_TIMEOUT);
        let acks = self.producer_acks.as_deref().unwrap_or("1");
        let compression = self.compression.as_deref().unwrap_or("none");

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .set("socket.keepalive.enable", "true")
            .set("socket.timeout.ms", "5000")
            .set(
                "queue.buffering.max.messages",
                self.queue_capacity
                    .unwrap_or(DEFAULT_QUEUE_CAPACITY)
                    .to_string(),
            );

        let backend = match self.delivery_mode {
            DeliveryMode::FireAndForget => {
                config
                    .set("queue.buffering.max.ms", "1000")
                    .set("batch.num.messages", "1000");
                let producer: ThreadedProducer<DeliveryLogger> =
                    config.create_with_context(DeliveryLogger).map_err(|e| {
                        EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
                    })?;
                Backend::Buffered(Arc::new(producer))
            },
            DeliveryMode::Acknowledged { timeout: ack_timeout } => {
                config.set("queue.buffering.max.ms", "5");
                let producer: FutureProducer = config.create().map_err(|e| {
                    EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
                })?;
                Backend::Acknowledged {
                    producer,
                    timeout: ack_timeout,
                }
            },
        };

        tracing::info!(
            brokers = %brokers,
            acks = acks,
            compression = compression,
            mode = ?self.delivery_mode,
            "RedpandaPublisher created"
        );

        Ok(RedpandaPublisher {
            backend,
            brokers,
            mode: self.delivery_mode,
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    // Nothing listens here, so every message stays in the local buffer.
    const NOWHERE: &str = "127.0.0.1:1";

    #[test]
    fn publisher_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaPublisher>();
        assert_sync::<RedpandaPublisher>();
    }

    #[test]
    fn build_without_brokers_fails() {
        let result = RedpandaPublisher::builder().build();
        assert!(matches!(result, Err(EventBusError::ConnectionFailed(_))));
    }

    #[test]
    fn default_mode_is_fire_and_forget() {
        let publisher = RedpandaPublisher::new(NOWHERE).unwrap();
        assert_eq!(publisher.delivery_mode(), DeliveryMode::FireAndForget);
        assert_eq!(publisher.brokers(), NOWHERE);
    }

    #[tokio::test]
    async fn fire_and_forget_succeeds_without_a_broker() {
        let publisher = RedpandaPublisher::new(NOWHERE).unwrap();

        let result = publisher
            .publish("student-engagement", Some("user_1"), b"{}")
            .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn full_local_buffer_is_reported() {
        let publisher = RedpandaPublisher::builder()
            .brokers(NOWHERE)
            .queue_capacity(1)
            .build()
            .unwrap();

        publisher
            .publish("student-engagement", Some("user_1"), b"{}")
            .await
            .unwrap();
        let second = publisher
            .publish("student-engagement", Some("user_1"), b"{}")
            .await;

        assert_eq!(
            second,
            Err(EventBusError::QueueFull {
                topic: "student-engagement".to_string()
            })
        );
    }

    #[tokio::test]
    async fn flush_reports_undelivered_messages() {
        let publisher = RedpandaPublisher::new(NOWHERE).unwrap();
        publisher
            .publish("student-engagement", None, b"{}")
            .await
            .unwrap();

        let result = publisher.flush(Duration::from_millis(50));

        assert!(matches!(result, Err(EventBusError::PublishFailed { .. })));
    }
}
