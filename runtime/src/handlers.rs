//! One handler per event type, applying idempotent mutations.
//!
//! Every mutation is either a monotonic upsert (progress, enrollment
//! percentage), an append (audit rows) or guarded by an existence check
//! (certificate requests), so replaying a message after a crash converges to
//! the same state.

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use engagement_core::environment::Clock;
use engagement_core::event::{
    AiInteraction, CourseCompletion, CourseEnrollment, CourseId, EngagementEvent,
    LessonCompleted, LessonViewed, UserId, UserLogin,
};
use engagement_core::store::{
    AuditEntry, AuditKind, CertificateIssuer, CertificateStore, CourseCatalog, EngagementLog,
    EnrollmentStore, ProgressRecord, ProgressStore, ReminderNotifier, StoreError, UserStore,
    reaches_completion,
};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Enrollments untouched for this many days get a reminder on login.
pub const STALE_AFTER_DAYS: i64 = 7;

/// Audit `source` recorded when an enrollment does not say where it came from.
const DEFAULT_ENROLLMENT_SOURCE: &str = "web";

/// Errors raised while applying an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// A collaborator store failed
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),
}

impl HandlerError {
    /// Whether applying the same event again may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
        }
    }
}

/// Everything the handlers read from or write to.
#[derive(Clone)]
pub struct Collaborators {
    /// Per (user, lesson) progress
    pub progress: Arc<dyn ProgressStore>,
    /// Lesson counts per course
    pub catalog: Arc<dyn CourseCatalog>,
    /// Per (user, course) enrollments
    pub enrollments: Arc<dyn EnrollmentStore>,
    /// Certificate records and request claims
    pub certificates: Arc<dyn CertificateStore>,
    /// Last-login bookkeeping
    pub users: Arc<dyn UserStore>,
    /// Append-only audit rows
    pub audit: Arc<dyn EngagementLog>,
    /// Certificate generation hand-off
    pub issuer: Arc<dyn CertificateIssuer>,
    /// Reminder hand-off
    pub notifier: Arc<dyn ReminderNotifier>,
}

impl Collaborators {
    /// Use one store for every persistence role.
    #[must_use]
    pub fn from_store<S>(
        store: &Arc<S>,
        issuer: Arc<dyn CertificateIssuer>,
        notifier: Arc<dyn ReminderNotifier>,
    ) -> Self
    where
        S: ProgressStore
            + CourseCatalog
            + EnrollmentStore
            + CertificateStore
            + UserStore
            + EngagementLog
            + 'static,
    {
        Self {
            progress: store.clone(),
            catalog: store.clone(),
            enrollments: store.clone(),
            certificates: store.clone(),
            users: store.clone(),
            audit: store.clone(),
            issuer,
            notifier,
        }
    }
}

/// Applies decoded events to the collaborator stores.
#[derive(Clone)]
pub struct EngagementHandlers {
    stores: Collaborators,
    clock: Arc<dyn Clock>,
}

impl EngagementHandlers {
    /// Create handlers over the given collaborators.
    #[must_use]
    pub fn new(stores: Collaborators, clock: Arc<dyn Clock>) -> Self {
        Self { stores, clock }
    }

    /// Apply one event.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] if a collaborator fails. Steps completed
    /// before the failure stay applied; they are idempotent, so the event can
    /// be applied again.
    pub async fn handle(&self, event: &EngagementEvent) -> Result<(), HandlerError> {
        match event {
            EngagementEvent::LessonViewed(e) => self.lesson_viewed(e).await,
            EngagementEvent::LessonCompleted(e) => self.lesson_completed(e).await,
            EngagementEvent::CourseEnrollment(e) => self.course_enrollment(e).await,
            EngagementEvent::CourseCompletion(e) => self.course_completion(e).await,
            EngagementEvent::UserLogin(e) => self.user_login(e).await,
            EngagementEvent::AiInteraction(e) => self.ai_interaction(e).await,
        }
    }

    async fn lesson_viewed(&self, event: &LessonViewed) -> Result<(), HandlerError> {
        let now = self.clock.now();
        let existing = self
            .stores
            .progress
            .get(event.user_id, event.lesson_id)
            .await?;
        let watched = existing
            .as_ref()
            .map_or(0, |p| p.watched_seconds)
            .max(event.viewed_seconds);

        let mut update = ProgressRecord::new(event.user_id, event.lesson_id);
        update.watched_seconds = watched;
        update.last_watched_at = Some(now);
        if event
            .lesson_duration
            .is_some_and(|duration| reaches_completion(watched, duration))
        {
            update.is_completed = true;
            update.completed_at = Some(now);
        }

        let stored = self.stores.progress.upsert(&update).await?;
        debug!(
            user_id = %event.user_id,
            lesson_id = %event.lesson_id,
            watched_seconds = stored.watched_seconds,
            is_completed = stored.is_completed,
            "Lesson progress updated"
        );

        match event.course_id {
            Some(course_id) => self.recompute_enrollment(event.user_id, course_id).await,
            None => {
                warn!(
                    user_id = %event.user_id,
                    lesson_id = %event.lesson_id,
                    "lesson_viewed without course_id, enrollment progress not recomputed"
                );
                Ok(())
            }
        }
    }

    async fn lesson_completed(&self, event: &LessonCompleted) -> Result<(), HandlerError> {
        let mut update = ProgressRecord::new(event.user_id, event.lesson_id);
        update.is_completed = true;
        update.completed_at = Some(self.clock.now());

        let stored = self.stores.progress.upsert(&update).await?;
        debug!(
            user_id = %event.user_id,
            lesson_id = %event.lesson_id,
            completed_at = ?stored.completed_at,
            "Lesson marked completed"
        );

        match event.course_id {
            Some(course_id) => self.recompute_enrollment(event.user_id, course_id).await,
            None => Ok(()),
        }
    }

    async fn course_enrollment(&self, event: &CourseEnrollment) -> Result<(), HandlerError> {
        let metadata = json!({
            "payment_method": event.payment_method,
            "source": event.source.as_deref().unwrap_or(DEFAULT_ENROLLMENT_SOURCE),
            "referrer": event.referrer,
        });
        self.audit(event.user_id, Some(event.course_id), AuditKind::Enrollment, metadata)
            .await
    }

    async fn course_completion(&self, event: &CourseCompletion) -> Result<(), HandlerError> {
        let metadata = json!({
            "total_time_seconds": event.total_time_seconds,
            "days_to_complete": event.days_to_complete,
        });
        self.audit(event.user_id, Some(event.course_id), AuditKind::Completion, metadata)
            .await?;
        self.request_certificate_once(event.user_id, event.course_id)
            .await
    }

    async fn user_login(&self, event: &UserLogin) -> Result<(), HandlerError> {
        let now = self.clock.now();
        self.stores.users.touch_last_login(event.user_id, now).await?;

        let metadata = json!({
            "ip": event.ip,
            "device": event.device,
            "platform": event.platform,
        });
        self.audit(event.user_id, None, AuditKind::Login, metadata)
            .await?;

        let stale = self
            .stores
            .enrollments
            .stale_enrollments(event.user_id, stale_cutoff(now))
            .await?;
        for enrollment in &stale {
            self.stores.notifier.send_course_reminder(enrollment).await;
        }
        if !stale.is_empty() {
            info!(
                user_id = %event.user_id,
                reminders = stale.len(),
                "Course reminders requested for stale enrollments"
            );
        }
        Ok(())
    }

    async fn ai_interaction(&self, event: &AiInteraction) -> Result<(), HandlerError> {
        let metadata = json!({
            "lesson_id": event.lesson_id,
            "tokens_used": event.tokens_used,
            "query": event.query,
        });
        self.audit(event.user_id, None, AuditKind::AiInteraction, metadata)
            .await
    }

    /// Recompute an active enrollment from the full completed/total counts.
    async fn recompute_enrollment(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<(), HandlerError> {
        let Some(mut enrollment) = self
            .stores
            .enrollments
            .find_active(user_id, course_id)
            .await?
        else {
            warn!(
                user_id = %user_id,
                course_id = %course_id,
                "No active enrollment found, progress not recomputed"
            );
            return Ok(());
        };

        let completed = self
            .stores
            .progress
            .count_completed_in_course(user_id, course_id)
            .await?;
        let total = self.stores.catalog.lesson_count(course_id).await?;

        enrollment.apply_progress(completed, total, self.clock.now());
        self.stores.enrollments.save(&enrollment).await?;
        debug!(
            user_id = %user_id,
            course_id = %course_id,
            progress = enrollment.progress_percentage,
            status = enrollment.status.as_str(),
            "Enrollment progress recomputed"
        );

        if enrollment.is_completed() {
            self.request_certificate_once(user_id, course_id).await?;
        }
        Ok(())
    }

    /// Trigger certificate generation unless one exists or was already requested.
    async fn request_certificate_once(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> Result<(), HandlerError> {
        if self
            .stores
            .certificates
            .has_certificate(user_id, course_id)
            .await?
        {
            debug!(user_id = %user_id, course_id = %course_id, "Certificate already issued");
            return Ok(());
        }

        if !self
            .stores
            .certificates
            .claim_request(user_id, course_id)
            .await?
        {
            debug!(user_id = %user_id, course_id = %course_id, "Certificate already requested");
            return Ok(());
        }

        self.stores
            .issuer
            .request_certificate(user_id, course_id)
            .await;
        info!(user_id = %user_id, course_id = %course_id, "Certificate generation requested");
        Ok(())
    }

    async fn audit(
        &self,
        user_id: UserId,
        course_id: Option<CourseId>,
        kind: AuditKind,
        metadata: serde_json::Value,
    ) -> Result<(), HandlerError> {
        let entry = AuditEntry {
            user_id,
            course_id,
            kind,
            metadata,
            created_at: self.clock.now(),
        };
        self.stores.audit.append(&entry).await?;
        Ok(())
    }
}

/// Start of the calendar day [`STALE_AFTER_DAYS`] before `now`.
///
/// Enrollments last updated before this instant are stale.
#[must_use]
pub fn stale_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    let day = now - TimeDelta::days(STALE_AFTER_DAYS);
    day.date_naive().and_time(NaiveTime::MIN).and_utc()
}
