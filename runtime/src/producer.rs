//! Web-tier side of the pipeline: turn a domain action into a published envelope.
//!
//! [`EngagementProducer::publish`] never fails the caller. A `true` return
//! means the broker client accepted the message; with a fire-and-forget
//! publisher that is only a local buffer append, not a broker
//! acknowledgment. Failures are logged with topic and payload and counted.

use crate::metrics::ProducerMetrics;
use engagement_core::environment::Clock;
use engagement_core::event::{
    AiInteraction, CourseCompletion, CourseEnrollment, ENGAGEMENT_TOPIC, EngagementEvent,
    Envelope, LessonCompleted, LessonViewed, UserLogin,
};
use engagement_core::event_bus::{EventBusError, EventPublisher};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Publishes engagement events onto the stream.
#[derive(Clone)]
pub struct EngagementProducer {
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    topic: String,
}

impl EngagementProducer {
    /// Create a producer publishing to the `student-engagement` topic.
    #[must_use]
    pub fn new(publisher: Arc<dyn EventPublisher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            publisher,
            clock,
            topic: ENGAGEMENT_TOPIC.to_string(),
        }
    }

    /// Publish the typed wrappers to a different topic.
    #[must_use]
    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// Topic the typed wrappers publish to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Serialize and hand off one envelope.
    ///
    /// Returns `false` on any failure (serialization, full buffer,
    /// unreachable broker); never returns an error.
    pub async fn publish(&self, topic: &str, envelope: &Envelope, routing_key: Option<&str>) -> bool {
        let payload = match envelope.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(topic, envelope = %envelope, error = %e, "Failed to serialize engagement event");
                ProducerMetrics::record_failed();
                return false;
            }
        };

        match self.publisher.publish(topic, routing_key, &payload).await {
            Ok(()) => {
                debug!(
                    topic,
                    event_type = %envelope.event.event_type(),
                    user_id = %envelope.event.user_id(),
                    "Engagement event published"
                );
                ProducerMetrics::record_published();
                true
            }
            Err(e) => {
                error!(
                    topic,
                    payload = %String::from_utf8_lossy(&payload),
                    error = %e,
                    "Failed to publish engagement event"
                );
                ProducerMetrics::record_failed();
                false
            }
        }
    }

    /// Wait for buffered messages to leave the process.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError`] if messages are still buffered at the timeout.
    pub fn flush(&self, timeout: Duration) -> Result<(), EventBusError> {
        self.publisher.flush(timeout)
    }

    /// Publish a `lesson_viewed` event.
    pub async fn publish_lesson_view(&self, event: LessonViewed) -> bool {
        self.publish_event(EngagementEvent::LessonViewed(event)).await
    }

    /// Publish a `lesson_completed` event.
    pub async fn publish_lesson_completion(&self, event: LessonCompleted) -> bool {
        self.publish_event(EngagementEvent::LessonCompleted(event)).await
    }

    /// Publish a `course_enrollment` event.
    pub async fn publish_course_enrollment(&self, event: CourseEnrollment) -> bool {
        self.publish_event(EngagementEvent::CourseEnrollment(event)).await
    }

    /// Publish a `course_completion` event.
    pub async fn publish_course_completion(&self, event: CourseCompletion) -> bool {
        self.publish_event(EngagementEvent::CourseCompletion(event)).await
    }

    /// Publish a `user_login` event.
    pub async fn publish_user_login(&self, event: UserLogin) -> bool {
        self.publish_event(EngagementEvent::UserLogin(event)).await
    }

    /// Publish an `ai_interaction` event.
    pub async fn publish_ai_interaction(&self, event: AiInteraction) -> bool {
        self.publish_event(EngagementEvent::AiInteraction(event)).await
    }

    async fn publish_event(&self, event: EngagementEvent) -> bool {
        let envelope = Envelope::new(event, self.clock.now().timestamp());
        let key = envelope.routing_key();
        self.publish(&self.topic, &envelope, Some(&key)).await
    }
}
