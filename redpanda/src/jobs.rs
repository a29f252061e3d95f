//! Hand-offs to the certificate and reminder job systems.
//!
//! Both are fire-and-forget: a small JSON job is published to a topic that
//! the external worker consumes, and failures are only logged.

use async_trait::async_trait;
use engagement_core::environment::Clock;
use engagement_core::event::{CourseId, UserId};
use engagement_core::event_bus::EventPublisher;
use engagement_core::store::{CertificateIssuer, Enrollment, ReminderNotifier};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Topic consumed by the certificate generator.
pub const CERTIFICATE_TOPIC: &str = "certificate-requests";

/// Topic consumed by the notification service.
pub const REMINDER_TOPIC: &str = "course-reminders";

/// Request to generate one certificate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateJob {
    /// Learner
    pub user_id: UserId,
    /// Completed course
    pub course_id: CourseId,
    /// Seconds since the epoch
    pub requested_at: i64,
}

/// Request to nudge a learner about a stalled course.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderJob {
    /// Learner
    pub user_id: UserId,
    /// The stalled course
    pub course_id: CourseId,
    /// Progress when the reminder was requested
    pub progress_percentage: u8,
    /// Last enrollment update, seconds since the epoch
    pub last_activity_at: i64,
    /// Seconds since the epoch
    pub requested_at: i64,
}

/// Publishes job messages for [`CertificateIssuer`] and [`ReminderNotifier`].
#[derive(Clone)]
pub struct JobDispatch {
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    certificate_topic: String,
    reminder_topic: String,
}

impl JobDispatch {
    /// Dispatch jobs to the default topics.
    #[must_use]
    pub fn new(publisher: Arc<dyn EventPublisher>, clock: Arc<dyn Clock>) -> Self {
        Self {
            publisher,
            clock,
            certificate_topic: CERTIFICATE_TOPIC.to_string(),
            reminder_topic: REMINDER_TOPIC.to_string(),
        }
    }

    /// Override the job topics.
    #[must_use]
    pub fn with_topics(
        mut self,
        certificate_topic: impl Into<String>,
        reminder_topic: impl Into<String>,
    ) -> Self {
        self.certificate_topic = certificate_topic.into();
        self.reminder_topic = reminder_topic.into();
        self
    }

    async fn send<T: Serialize + Sync>(&self, topic: &str, user_id: UserId, job: &T) {
        let payload = match serde_json::to_vec(job) {
            Ok(payload) => payload,
            Err(error) => {
                tracing::error!(topic = %topic, user_id = %user_id, error = %error, "Failed to encode job");
                return;
            },
        };
        let key = format!("user_{user_id}");
        if let Err(error) = self.publisher.publish(topic, Some(&key), &payload).await {
            tracing::error!(
                topic = %topic,
                user_id = %user_id,
                error = %error,
                payload = %String::from_utf8_lossy(&payload),
                "Failed to hand off job"
            );
        }
    }
}

#[async_trait]
impl CertificateIssuer for JobDispatch {
    async fn request_certificate(&self, user_id: UserId, course_id: CourseId) {
        let job = CertificateJob {
            user_id,
            course_id,
            requested_at: self.clock.now().timestamp(),
        };
        tracing::info!(user_id = %user_id, course_id = %course_id, "Requesting certificate");
        self.send(&self.certificate_topic, user_id, &job).await;
    }
}

#[async_trait]
impl ReminderNotifier for JobDispatch {
    async fn send_course_reminder(&self, enrollment: &Enrollment) {
        let job = ReminderJob {
            user_id: enrollment.user_id,
            course_id: enrollment.course_id,
            progress_percentage: enrollment.progress_percentage,
            last_activity_at: enrollment.updated_at.timestamp(),
            requested_at: self.clock.now().timestamp(),
        };
        self.send(&self.reminder_topic, enrollment.user_id, &job)
            .await;
    }
}
