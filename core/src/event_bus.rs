//! Transport abstractions for the durable engagement log.
//!
//! Two seams separate the pipeline from the broker client:
//!
//! - [`EventPublisher`]: hands a serialized envelope to the broker client
//! - [`MessageSource`]: the consumer-group side, polled with a bounded wait
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   publish    ┌──────────────┐   poll     ┌──────────────┐
//! │  Web tier    │ ───────────► │ Durable log  │ ─────────► │   Consumer   │
//! │  (producer)  │  keyed by    │ (partitions) │  bounded   │   runtime    │
//! └──────────────┘  user id     └──────────────┘  wait      └──────┬───────┘
//!                                      │                           │
//!                                      │ rebalance events          │
//!                                      └───────── channel ─────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! - Ordering holds only within a partition, i.e. per routing key (per user)
//! - Offsets are committed periodically, so a crash replays a short window:
//!   consumers must be idempotent
//! - Partition assignment changes arrive as [`RebalanceEvent`]s on a channel
//!   owned by the consumer loop, never through shared mutable callbacks
//!
//! # Implementations
//!
//! - `RedpandaPublisher` / `RedpandaConsumer` (rdkafka) for production
//! - `InMemoryBroker` in `engagement-testing` for tests

use crate::dead_letter::MessageOrigin;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur talking to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to create or configure the client
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The broker rejected or never acknowledged a message
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// The client's local buffer is full
    #[error("Local producer queue is full for topic '{topic}'")]
    QueueFull {
        /// The topic that was being produced to
        topic: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Consumer group coordination error
    #[error("Consumer group error: {0}")]
    ConsumerGroupError(String),

    /// Network or transport error while consuming
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// A message as received from a partition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Topic the message was read from
    pub topic: String,
    /// Partition within the topic
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
    /// Routing key, if any
    pub key: Option<Vec<u8>>,
    /// Raw payload; `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

impl ReceivedMessage {
    /// Where this message came from, for diagnostics and dead letters.
    #[must_use]
    pub fn origin(&self) -> MessageOrigin {
        MessageOrigin {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// Result of one bounded-wait poll.
#[derive(Debug)]
pub enum PollOutcome {
    /// A message arrived with no transport-level error.
    Message(ReceivedMessage),
    /// The consumer caught up with the end of a partition.
    PartitionEof {
        /// Topic of the partition
        topic: String,
        /// The partition that reached its end
        partition: i32,
    },
    /// Nothing arrived within the timeout.
    TimedOut,
    /// A transient transport error; the loop keeps going.
    TransportError(EventBusError),
    /// The source has been closed and will never yield again.
    Closed,
}

/// A single partition of a topic.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
}

impl TopicPartition {
    /// Create a topic/partition pair.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// Partition ownership changes signalled by the broker during a rebalance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RebalanceEvent {
    /// The group coordinator handed these partitions to this member.
    Assigned(Vec<TopicPartition>),
    /// These partitions were taken away from this member.
    Revoked(Vec<TopicPartition>),
    /// The rebalance itself failed.
    Failed(String),
}

/// Sending half of the rebalance channel, owned by the broker client.
pub type RebalanceSender = mpsc::UnboundedSender<RebalanceEvent>;

/// Receiving half of the rebalance channel, owned by the consumer loop.
pub type RebalanceReceiver = mpsc::UnboundedReceiver<RebalanceEvent>;

/// Create a rebalance channel.
#[must_use]
pub fn rebalance_channel() -> (RebalanceSender, RebalanceReceiver) {
    mpsc::unbounded_channel()
}

/// Publishes serialized envelopes to a topic.
///
/// Implementations decide what "published" means: a fire-and-forget client
/// returns as soon as the message is in its local buffer, an acknowledging
/// client waits for the broker.
///
/// # Thread Safety
///
/// Publishers are shared across request handlers, so they must be
/// `Send + Sync`.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Hand one message to the broker client.
    ///
    /// # Errors
    ///
    /// - [`EventBusError::QueueFull`] if the local buffer cannot take the message
    /// - [`EventBusError::PublishFailed`] for any other client or broker failure
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), EventBusError>;

    /// Wait up to `timeout` for buffered messages to leave the process.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if messages are still
    /// buffered when the timeout expires.
    fn flush(&self, _timeout: Duration) -> Result<(), EventBusError> {
        Ok(())
    }
}

/// The consumer-group side of the log.
///
/// A source is subscribed to one topic under one group. Partition
/// assignment is driven by the broker; implementations report changes on the
/// [`RebalanceReceiver`] they hand out when created.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait up to `timeout` for the next message.
    async fn poll(&mut self, timeout: Duration) -> PollOutcome;

    /// Leave the group and release the broker connection.
    async fn close(&mut self);
}
