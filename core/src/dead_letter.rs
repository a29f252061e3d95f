//! Dead-letter sink for messages whose handler failed.
//!
//! The consumer never blocks the stream on a poison message: after retries
//! are exhausted the offset still advances. A [`DeadLetterSink`] keeps a copy
//! of what was lost so it can be inspected and replayed by hand.

use crate::event::EventType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Counter bumped when a dead letter is marked resolved.
pub const DEAD_LETTERS_RESOLVED: &str = "engagement_dead_letters_resolved_total";
/// Counter bumped when a dead letter is marked discarded.
pub const DEAD_LETTERS_DISCARDED: &str = "engagement_dead_letters_discarded_total";

/// Errors from dead-letter storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterError {
    /// The sink could not persist the letter
    #[error("Dead letter storage failed: {0}")]
    Storage(String),
}

/// Position of a message in the log.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MessageOrigin {
    /// Topic name
    pub topic: String,
    /// Partition number
    pub partition: i32,
    /// Offset within the partition
    pub offset: i64,
}

impl fmt::Display for MessageOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// A message that could not be applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetter {
    /// The raw payload as received
    pub payload: Vec<u8>,
    /// Event type, when the payload decoded that far
    pub event_type: Option<EventType>,
    /// Human-readable failure
    pub error_message: String,
    /// How many times the handler ran
    pub attempts: u32,
    /// Where the message was read from, when known
    pub origin: Option<MessageOrigin>,
    /// When the last attempt failed
    pub failed_at: DateTime<Utc>,
}

/// Storage for dead letters.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Persist one dead letter.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the letter could not be stored.
    async fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}
