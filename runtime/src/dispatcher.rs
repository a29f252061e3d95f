//! Decode raw payloads and route them to exactly one handler.
//!
//! The dispatcher is the boundary that keeps one bad message from stopping
//! the stream:
//!
//! - undecodable payloads and unknown event types are logged and dropped
//! - transient handler failures are retried with backoff
//! - anything still failing is logged, optionally written to a
//!   [`DeadLetterSink`], and reported as handled so the offset advances

use crate::handlers::{EngagementHandlers, HandlerError};
use crate::metrics::ConsumerMetrics;
use crate::retry::{Attempted, RetryPolicy, retry_transient};
use engagement_core::dead_letter::{DeadLetter, DeadLetterSink, MessageOrigin};
use engagement_core::environment::Clock;
use engagement_core::event::{DecodeError, Envelope, EventType};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// What happened to one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The handler applied the event.
    Applied(EventType),
    /// The payload never reached a handler.
    Dropped(DecodeError),
    /// The handler kept failing; the message is skipped.
    Failed {
        /// Type of the failed event
        event_type: EventType,
        /// How many times the handler ran
        attempts: u32,
        /// Whether the dead-letter sink stored a copy
        dead_lettered: bool,
    },
}

/// Routes decoded envelopes to [`EngagementHandlers`].
pub struct EventDispatcher {
    handlers: EngagementHandlers,
    retry: RetryPolicy,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
    clock: Arc<dyn Clock>,
}

impl EventDispatcher {
    /// Create a dispatcher with the default retry policy and no dead-letter sink.
    #[must_use]
    pub fn new(handlers: EngagementHandlers, clock: Arc<dyn Clock>) -> Self {
        Self {
            handlers,
            retry: RetryPolicy::default(),
            dead_letters: None,
            clock,
        }
    }

    /// Retry transient handler failures with this policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Record events whose handler kept failing.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Decode, route and apply one raw payload. Never fails.
    pub async fn dispatch(&self, payload: &[u8], origin: Option<&MessageOrigin>) -> DispatchOutcome {
        let envelope = match Envelope::from_slice(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    reason = e.label(),
                    error = %e,
                    origin = ?origin,
                    payload = %String::from_utf8_lossy(payload),
                    "Dropping undecodable message"
                );
                ConsumerMetrics::record_dropped(e.label());
                return DispatchOutcome::Dropped(e);
            }
        };

        let event_type = envelope.event.event_type();
        let Attempted { result, attempts } = retry_transient(
            &self.retry,
            HandlerError::is_transient,
            || self.handlers.handle(&envelope.event),
        )
        .await;

        match result {
            Ok(()) => {
                debug!(
                    event_type = %event_type,
                    user_id = %envelope.event.user_id(),
                    origin = ?origin,
                    "Engagement event processed"
                );
                ConsumerMetrics::record_processed(event_type.as_str());
                DispatchOutcome::Applied(event_type)
            }
            Err(e) => {
                error!(
                    event_type = %event_type,
                    user_id = %envelope.event.user_id(),
                    attempts,
                    origin = ?origin,
                    payload = %String::from_utf8_lossy(payload),
                    error = %e,
                    "Handler failed, skipping message"
                );
                ConsumerMetrics::record_failed(event_type.as_str());
                let dead_lettered = self
                    .dead_letter(payload, event_type, &e, attempts, origin)
                    .await;
                DispatchOutcome::Failed {
                    event_type,
                    attempts,
                    dead_lettered,
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        payload: &[u8],
        event_type: EventType,
        error: &HandlerError,
        attempts: u32,
        origin: Option<&MessageOrigin>,
    ) -> bool {
        let Some(sink) = &self.dead_letters else {
            return false;
        };

        let letter = DeadLetter {
            payload: payload.to_vec(),
            event_type: Some(event_type),
            error_message: error.to_string(),
            attempts,
            origin: origin.cloned(),
            failed_at: self.clock.now(),
        };

        match sink.record(&letter).await {
            Ok(()) => {
                ConsumerMetrics::record_dead_letter();
                true
            }
            Err(e) => {
                error!(
                    event_type = %event_type,
                    origin = ?origin,
                    error = %e,
                    "Failed to record dead letter"
                );
                false
            }
        }
    }
}
