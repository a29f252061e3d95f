//! Consumer-group side of the transport.

use async_trait::async_trait;
use engagement_core::event::{ENGAGEMENT_CONSUMER_GROUP, ENGAGEMENT_TOPIC};
use engagement_core::event_bus::{
    EventBusError, MessageSource, PollOutcome, RebalanceEvent, RebalanceReceiver,
    RebalanceSender, ReceivedMessage, TopicPartition, rebalance_channel,
};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::Message;
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, TopicPartitionList};
use std::time::Duration;

/// Settings for joining the consumer group.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Bootstrap servers, comma-separated
    pub brokers: String,
    /// Consumer group id
    pub group_id: String,
    /// The single topic to subscribe to
    pub topic: String,
    /// Where a group with no committed offset starts reading
    pub auto_offset_reset: String,
    /// Period of the background offset commit
    pub auto_commit_interval: Duration,
    /// Group session timeout
    pub session_timeout: Duration,
    /// How long to wait for broker metadata while connecting
    pub metadata_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: ENGAGEMENT_CONSUMER_GROUP.to_string(),
            topic: ENGAGEMENT_TOPIC.to_string(),
            auto_offset_reset: "earliest".to_string(),
            auto_commit_interval: Duration::from_millis(1000),
            session_timeout: Duration::from_millis(6000),
            metadata_timeout: Duration::from_secs(10),
        }
    }
}

impl ConsumerConfig {
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                self.auto_commit_interval.as_millis().to_string(),
            )
            .set("auto.offset.reset", &self.auto_offset_reset)
            .set(
                "session.timeout.ms",
                self.session_timeout.as_millis().to_string(),
            )
            .set("enable.partition.eof", "true");
        config
    }
}

fn partitions(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|element| TopicPartition::new(element.topic(), element.partition()))
        .collect()
}

/// Client context that turns rebalance callbacks into [`RebalanceEvent`]s.
///
/// Callbacks run on whichever thread is polling the consumer, so the context
/// only forwards; the consumer loop owns the assignment state.
pub struct RebalanceContext {
    events: RebalanceSender,
}

impl RebalanceContext {
    fn forward(&self, event: RebalanceEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Rebalance receiver dropped");
        }
    }
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(list) => {
                tracing::info!(partitions = list.count(), "Partitions revoked");
                self.forward(RebalanceEvent::Revoked(partitions(list)));
            },
            Rebalance::Assign(list) => {
                tracing::debug!(partitions = list.count(), "Partition assignment starting");
            },
            Rebalance::Error(error) => {
                tracing::error!(error = %error, "Rebalance failed");
                self.forward(RebalanceEvent::Failed(error.to_string()));
            },
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(list) = rebalance {
            tracing::info!(partitions = list.count(), "Partitions assigned");
            self.forward(RebalanceEvent::Assigned(partitions(list)));
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(error) = result {
            tracing::warn!(
                partitions = offsets.count(),
                error = %error,
                "Offset commit failed (messages may be redelivered)"
            );
        }
    }
}

/// rdkafka-backed [`MessageSource`] subscribed to one topic in one group.
pub struct RedpandaConsumer {
    consumer: StreamConsumer<RebalanceContext>,
    topic: String,
    closed: bool,
}

impl RedpandaConsumer {
    /// [`connect`](Self::connect) on the blocking thread pool, for callers
    /// inside an async runtime.
    ///
    /// # Errors
    ///
    /// Same as [`connect`](Self::connect); a panicked or cancelled
    /// connect task is reported as [`EventBusError::ConnectionFailed`].
    pub async fn open(config: ConsumerConfig) -> Result<(Self, RebalanceReceiver), EventBusError> {
        tokio::task::spawn_blocking(move || Self::connect(&config))
            .await
            .map_err(|e| EventBusError::ConnectionFailed(format!("Connect task failed: {e}")))?
    }

    /// Create the client, check the broker is reachable, and subscribe.
    ///
    /// Returns the source together with the receiving end of its rebalance
    /// channel. This blocks for up to `metadata_timeout` while fetching
    /// metadata.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::ConnectionFailed`] if the client cannot be created
    ///   or the broker does not answer the metadata request
    /// - [`EventBusError::SubscriptionFailed`] if the subscription is rejected
    pub fn connect(config: &ConsumerConfig) -> Result<(Self, RebalanceReceiver), EventBusError> {
        let (events, receiver) = rebalance_channel();
        let consumer: StreamConsumer<RebalanceContext> = config
            .client_config()
            .create_with_context(RebalanceContext { events })
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create consumer: {e}"))
            })?;

        consumer
            .fetch_metadata(
                Some(&config.topic),
                Timeout::After(config.metadata_timeout),
            )
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!(
                    "Broker {} unreachable: {e}",
                    config.brokers
                ))
            })?;

        consumer
            .subscribe(&[config.topic.as_str()])
            .map_err(|e| EventBusError::SubscriptionFailed {
                topics: vec![config.topic.clone()],
                reason: e.to_string(),
            })?;

        tracing::info!(
            brokers = %config.brokers,
            topic = %config.topic,
            consumer_group = %config.group_id,
            auto_offset_reset = %config.auto_offset_reset,
            auto_commit_interval_ms = config.auto_commit_interval.as_millis(),
            "Subscribed to topic"
        );

        Ok((
            Self {
                consumer,
                topic: config.topic.clone(),
                closed: false,
            },
            receiver,
        ))
    }
}

#[async_trait]
impl MessageSource for RedpandaConsumer {
    async fn poll(&mut self, timeout: Duration) -> PollOutcome {
        if self.closed {
            return PollOutcome::Closed;
        }
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => PollOutcome::TimedOut,
            Ok(Ok(message)) => PollOutcome::Message(ReceivedMessage {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                key: message.key().map(<[u8]>::to_vec),
                payload: message.payload().map(<[u8]>::to_vec),
            }),
            Ok(Err(KafkaError::PartitionEOF(partition))) => PollOutcome::PartitionEof {
                topic: self.topic.clone(),
                partition,
            },
            Ok(Err(error)) => {
                PollOutcome::TransportError(EventBusError::TransportError(error.to_string()))
            },
        }
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.consumer.unsubscribe();
        self.closed = true;
        tracing::info!(topic = %self.topic, "Consumer closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<RedpandaConsumer>();
    }

    #[test]
    fn defaults_match_the_engagement_group() {
        let config = ConsumerConfig::default();
        assert_eq!(config.topic, "student-engagement");
        assert_eq!(config.group_id, "engagement-analyzer");
        assert_eq!(config.auto_offset_reset, "earliest");
        assert_eq!(config.auto_commit_interval, Duration::from_secs(1));
    }

    #[test]
    fn client_config_enables_periodic_commit_and_eof() {
        let config = ConsumerConfig {
            auto_commit_interval: Duration::from_millis(250),
            ..ConsumerConfig::default()
        }
        .client_config();

        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("auto.commit.interval.ms"), Some("250"));
        assert_eq!(config.get("enable.partition.eof"), Some("true"));
        assert_eq!(config.get("session.timeout.ms"), Some("6000"));
    }

    #[tokio::test]
    async fn rebalance_callbacks_forward_events() {
        let (events, mut receiver) = rebalance_channel();
        let context = RebalanceContext { events };
        let mut list = TopicPartitionList::new();
        list.add_partition("student-engagement", 0);
        list.add_partition("student-engagement", 3);

        context.post_rebalance(&Rebalance::Assign(&list));
        context.pre_rebalance(&Rebalance::Revoke(&list));

        let expected = vec![
            TopicPartition::new("student-engagement", 0),
            TopicPartition::new("student-engagement", 3),
        ];
        assert_eq!(
            receiver.recv().await,
            Some(RebalanceEvent::Assigned(expected.clone()))
        );
        assert_eq!(
            receiver.recv().await,
            Some(RebalanceEvent::Revoked(expected))
        );
    }
}
