//! Dead Letter Queue (DLQ) for engagement messages whose handler failed.
//!
//! The consumer advances past a failed message either way; this table keeps
//! the payload and failure details for investigation and manual replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engagement_core::dead_letter::{
    DEAD_LETTERS_DISCARDED, DEAD_LETTERS_RESOLVED, DeadLetter, DeadLetterError, DeadLetterSink,
    MessageOrigin,
};
use engagement_core::event::EventType;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Status of a failed event in the Dead Letter Queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DLQStatus {
    /// Waiting for investigation or replay
    Pending,
    /// Someone is working on it
    Processing,
    /// Replayed successfully
    Resolved,
    /// Will never be replayed
    Discarded,
}

impl DLQStatus {
    /// Convert status to database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from database string.
    ///
    /// # Errors
    ///
    /// Returns error if the string doesn't match a known status.
    pub fn parse(s: &str) -> Result<Self, DeadLetterError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(DeadLetterError::Storage(format!("Invalid DLQ status: {s}"))),
        }
    }
}

/// An entry in the Dead Letter Queue.
#[derive(Debug, Clone)]
pub struct FailedEvent {
    /// Unique identifier for this DLQ entry
    pub id: i64,

    /// The raw message payload
    pub payload: Vec<u8>,

    /// Wire name of the event type, when the payload decoded that far
    pub event_type: Option<String>,

    /// Error message from the last attempt
    pub error_message: String,

    /// How many times the handler ran
    pub attempts: i32,

    /// Where the message was read from
    pub origin: Option<MessageOrigin>,

    /// When this event first failed
    pub first_failed_at: DateTime<Utc>,

    /// Last status change
    pub last_failed_at: DateTime<Utc>,

    /// Current processing status
    pub status: DLQStatus,

    /// When the failure was resolved (if applicable)
    pub resolved_at: Option<DateTime<Utc>>,

    /// Who/what resolved the failure
    pub resolved_by: Option<String>,

    /// Notes about the resolution
    pub resolution_notes: Option<String>,
}

const FAILED_EVENT_COLUMNS: &str = "id, payload, event_type, error_message, attempts, \
     message_topic, message_partition, message_offset, first_failed_at, last_failed_at, \
     status, resolved_at, resolved_by, resolution_notes";

fn storage_error(e: sqlx::Error) -> DeadLetterError {
    DeadLetterError::Storage(e.to_string())
}

/// `PostgreSQL`-based Dead Letter Queue.
///
/// # Example
///
/// ```no_run
/// use engagement_postgres::{DLQStatus, DeadLetterQueue};
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let dlq = DeadLetterQueue::new(pool);
///
/// let pending = dlq.list_pending(100).await?;
/// println!("Pending failures: {}", pending.len());
///
/// dlq.update_status(pending[0].id, DLQStatus::Processing).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: PgPool,
}

impl DeadLetterQueue {
    /// Create a new Dead Letter Queue with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Add a failed message to the DLQ, returning the new entry's id.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the insert fails.
    pub async fn add_entry(&self, letter: &DeadLetter) -> Result<i64, DeadLetterError> {
        let attempts = i32::try_from(letter.attempts).unwrap_or(i32::MAX);
        let event_type = letter.event_type.map(EventType::as_str);
        let (id,): (i64,) = sqlx::query_as(
            r"
            INSERT INTO failed_events (
                payload, event_type, error_message, attempts,
                message_topic, message_partition, message_offset,
                first_failed_at, last_failed_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)
            RETURNING id
            ",
        )
        .bind(&letter.payload)
        .bind(event_type)
        .bind(&letter.error_message)
        .bind(attempts)
        .bind(letter.origin.as_ref().map(|o| o.topic.as_str()))
        .bind(letter.origin.as_ref().map(|o| o.partition))
        .bind(letter.origin.as_ref().map(|o| o.offset))
        .bind(letter.failed_at)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::warn!(
            dlq_id = id,
            event_type = event_type.unwrap_or("unknown"),
            error = %letter.error_message,
            attempts = attempts,
            "Message added to Dead Letter Queue"
        );

        Ok(id)
    }

    /// List pending failures, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FailedEvent>, DeadLetterError> {
        self.list_by_status(DLQStatus::Pending, limit).await
    }

    /// List failures by status, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn list_by_status(
        &self,
        status: DLQStatus,
        limit: usize,
    ) -> Result<Vec<FailedEvent>, DeadLetterError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {FAILED_EVENT_COLUMNS} FROM failed_events
             WHERE status = $1
             ORDER BY first_failed_at ASC, id ASC
             LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter().map(Self::row_to_failed_event).collect()
    }

    /// Get a specific entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<FailedEvent>, DeadLetterError> {
        let row = sqlx::query(&format!(
            "SELECT {FAILED_EVENT_COLUMNS} FROM failed_events WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error)?;

        row.as_ref().map(Self::row_to_failed_event).transpose()
    }

    /// Update the status of an entry.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn update_status(&self, id: i64, status: DLQStatus) -> Result<(), DeadLetterError> {
        sqlx::query("UPDATE failed_events SET status = $1, last_failed_at = NOW() WHERE id = $2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        tracing::info!(dlq_id = id, status = status.as_str(), "DLQ entry status updated");

        Ok(())
    }

    /// Mark an entry as replayed successfully.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_resolved(
        &self,
        id: i64,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::info!(dlq_id = id, resolved_by = resolved_by, "DLQ entry marked as resolved");
        metrics::counter!(DEAD_LETTERS_RESOLVED).increment(1);

        Ok(())
    }

    /// Mark an entry as permanently failed.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the update fails.
    pub async fn mark_discarded(&self, id: i64, reason: &str) -> Result<(), DeadLetterError> {
        sqlx::query(
            r"
            UPDATE failed_events
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE id = $2
            ",
        )
        .bind(reason)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        tracing::warn!(dlq_id = id, reason = reason, "DLQ entry marked as discarded");
        metrics::counter!(DEAD_LETTERS_DISCARDED).increment(1);

        Ok(())
    }

    /// Number of pending entries, for health checks.
    ///
    /// # Errors
    ///
    /// Returns [`DeadLetterError::Storage`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, DeadLetterError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM failed_events WHERE status = 'pending'")
                .fetch_one(&self.pool)
                .await
                .map_err(storage_error)?;

        Ok(count)
    }

    fn row_to_failed_event(row: &PgRow) -> Result<FailedEvent, DeadLetterError> {
        let status: String = row.try_get("status").map_err(storage_error)?;
        let topic: Option<String> = row.try_get("message_topic").map_err(storage_error)?;
        let partition: Option<i32> = row.try_get("message_partition").map_err(storage_error)?;
        let offset: Option<i64> = row.try_get("message_offset").map_err(storage_error)?;
        let origin = match (topic, partition, offset) {
            (Some(topic), Some(partition), Some(offset)) => Some(MessageOrigin {
                topic,
                partition,
                offset,
            }),
            _ => None,
        };

        Ok(FailedEvent {
            id: row.try_get("id").map_err(storage_error)?,
            payload: row.try_get("payload").map_err(storage_error)?,
            event_type: row.try_get("event_type").map_err(storage_error)?,
            error_message: row.try_get("error_message").map_err(storage_error)?,
            attempts: row.try_get("attempts").map_err(storage_error)?,
            origin,
            first_failed_at: row.try_get("first_failed_at").map_err(storage_error)?,
            last_failed_at: row.try_get("last_failed_at").map_err(storage_error)?,
            status: DLQStatus::parse(&status)?,
            resolved_at: row.try_get("resolved_at").map_err(storage_error)?,
            resolved_by: row.try_get("resolved_by").map_err(storage_error)?,
            resolution_notes: row.try_get("resolution_notes").map_err(storage_error)?,
        })
    }
}

#[async_trait]
impl DeadLetterSink for DeadLetterQueue {
    async fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        self.add_entry(letter).await.map(|_| ())
    }
}
