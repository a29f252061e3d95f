//! Persistence model and the collaborator traits handlers depend on.
//!
//! Handlers never talk to a database directly. Each concern sits behind a
//! narrow trait so the same handler code runs against PostgreSQL in
//! production and against in-memory doubles in tests:
//!
//! - [`ProgressStore`]: per (user, lesson) watch progress
//! - [`CourseCatalog`]: lesson counts per course
//! - [`EnrollmentStore`]: per (user, course) enrollment aggregate
//! - [`CertificateStore`]: certificate existence and request claims
//! - [`UserStore`]: last-login bookkeeping
//! - [`EngagementLog`]: append-only audit rows
//! - [`CertificateIssuer`] / [`ReminderNotifier`]: fire-and-forget hand-offs
//!
//! # Idempotence
//!
//! Messages are redelivered after a crash, so every mutation here must be
//! safe to apply twice. [`ProgressRecord::merge`] is the single definition of
//! how two views of the same progress row combine, and store implementations
//! must produce exactly its result.

use crate::event::{CourseId, LessonId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from a collaborator store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store is temporarily unreachable (pool timeout, lost connection)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation
    #[error("Database error: {0}")]
    Database(String),

    /// A stored value could not be converted
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Fraction of the declared duration that counts as watching the whole lesson.
pub const COMPLETION_THRESHOLD_PERCENT: u64 = 90;

/// Whether `watched_seconds` covers at least 90% of `duration_seconds`.
///
/// An unknown or zero duration never completes a lesson.
#[must_use]
pub fn reaches_completion(watched_seconds: u32, duration_seconds: u32) -> bool {
    duration_seconds > 0
        && u64::from(watched_seconds) * 100
            >= u64::from(duration_seconds) * COMPLETION_THRESHOLD_PERCENT
}

/// Progress of one student through one lesson.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// Student
    pub user_id: UserId,
    /// Lesson
    pub lesson_id: LessonId,
    /// Once true, never reset
    pub is_completed: bool,
    /// Maximum seconds watched across all views
    pub watched_seconds: u32,
    /// First time the lesson was completed
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent view
    pub last_watched_at: Option<DateTime<Utc>>,
}

impl ProgressRecord {
    /// An empty record for (user, lesson).
    #[must_use]
    pub const fn new(user_id: UserId, lesson_id: LessonId) -> Self {
        Self {
            user_id,
            lesson_id,
            is_completed: false,
            watched_seconds: 0,
            completed_at: None,
            last_watched_at: None,
        }
    }

    /// Combine a stored record with an incoming update.
    ///
    /// Every field moves in one direction only: watched time takes the
    /// maximum, completion is sticky and the first completion timestamp wins.
    /// Applying the same update twice yields the same record.
    #[must_use]
    pub fn merge(&self, incoming: &Self) -> Self {
        Self {
            user_id: self.user_id,
            lesson_id: self.lesson_id,
            is_completed: self.is_completed || incoming.is_completed,
            watched_seconds: self.watched_seconds.max(incoming.watched_seconds),
            completed_at: self.completed_at.or(incoming.completed_at),
            last_watched_at: self.last_watched_at.max(incoming.last_watched_at),
        }
    }
}

/// Lifecycle of an enrollment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    /// In progress
    Active,
    /// Every lesson completed
    Completed,
    /// Access window elapsed
    Expired,
    /// Refunded or withdrawn
    Canceled,
}

impl EnrollmentStatus {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Canceled => "canceled",
        }
    }

    /// Parse the database representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "expired" => Some(Self::Expired),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// Completion percentage, rounded half up and capped at 100.
///
/// A course without lessons is 0% complete.
#[must_use]
pub fn percent_complete(completed: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let rounded = (completed.saturating_mul(200) + total) / (total * 2);
    u8::try_from(rounded.min(100)).unwrap_or(100)
}

/// A student's enrollment in a course.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrollment {
    /// Student
    pub user_id: UserId,
    /// Course
    pub course_id: CourseId,
    /// Lifecycle status
    pub status: EnrollmentStatus,
    /// 0..=100
    pub progress_percentage: u8,
    /// Set when the enrollment first reaches 100%
    pub completed_at: Option<DateTime<Utc>>,
    /// Last time progress was recomputed
    pub updated_at: DateTime<Utc>,
}

impl Enrollment {
    /// A fresh active enrollment.
    #[must_use]
    pub const fn active(user_id: UserId, course_id: CourseId, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            course_id,
            status: EnrollmentStatus::Active,
            progress_percentage: 0,
            completed_at: None,
            updated_at: now,
        }
    }

    /// Recompute progress from the completed and total lesson counts.
    ///
    /// Reaching 100% moves the enrollment to [`EnrollmentStatus::Completed`]
    /// and stamps `completed_at` the first time only.
    pub fn apply_progress(&mut self, completed: u64, total: u64, now: DateTime<Utc>) {
        self.progress_percentage = percent_complete(completed, total);
        if self.progress_percentage >= 100 && self.status != EnrollmentStatus::Completed {
            self.status = EnrollmentStatus::Completed;
            self.completed_at = Some(now);
        }
        self.updated_at = now;
    }

    /// Whether the enrollment is completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == EnrollmentStatus::Completed
    }
}

/// Kind of audit row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Course enrollment
    Enrollment,
    /// Course completion
    Completion,
    /// User login
    Login,
    /// AI assistant query
    AiInteraction,
}

impl AuditKind {
    /// Database representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enrollment => "enrollment",
            Self::Completion => "completion",
            Self::Login => "login",
            Self::AiInteraction => "ai_interaction",
        }
    }
}

/// One append-only audit row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Student
    pub user_id: UserId,
    /// Course, when the event concerns one
    pub course_id: Option<CourseId>,
    /// What happened
    pub kind: AuditKind,
    /// Event-specific details
    pub metadata: serde_json::Value,
    /// When the row was written
    pub created_at: DateTime<Utc>,
}

/// Per (user, lesson) progress.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Read the progress row, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    async fn get(&self, user_id: UserId, lesson_id: LessonId)
    -> StoreResult<Option<ProgressRecord>>;

    /// Insert or merge a progress row and return the stored result.
    ///
    /// The stored row must equal `existing.merge(record)` (or `record` when
    /// there is no existing row), computed atomically per row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    async fn upsert(&self, record: &ProgressRecord) -> StoreResult<ProgressRecord>;

    /// Number of completed lessons the user has in a course.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    async fn count_completed_in_course(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> StoreResult<u64>;
}

/// Read-only course structure.
#[async_trait]
pub trait CourseCatalog: Send + Sync {
    /// Number of lessons across all modules of a course.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    async fn lesson_count(&self, course_id: CourseId) -> StoreResult<u64>;
}

/// Per (user, course) enrollment aggregate.
#[async_trait]
pub trait EnrollmentStore: Send + Sync {
    /// The user's active enrollment in a course.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    async fn find_active(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> StoreResult<Option<Enrollment>>;

    /// Persist a recomputed enrollment.
    ///
    /// An existing row is only updated while it is still `active`, and its
    /// percentage never decreases. A row another writer already completed or
    /// canceled is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    async fn save(&self, enrollment: &Enrollment) -> StoreResult<()>;

    /// Active, incomplete enrollments last updated before `cutoff`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    async fn stale_enrollments(
        &self,
        user_id: UserId,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Enrollment>>;
}

/// Certificate records.
#[async_trait]
pub trait CertificateStore: Send + Sync {
    /// Whether a certificate was already issued for (user, course).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    async fn has_certificate(&self, user_id: UserId, course_id: CourseId) -> StoreResult<bool>;

    /// Record a certificate request; `true` only for the first caller.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    async fn claim_request(&self, user_id: UserId, course_id: CourseId) -> StoreResult<bool>;
}

/// User bookkeeping.
#[async_trait]
pub trait UserStore: Send + Sync {
    /// Set the user's last-login time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    async fn touch_last_login(&self, user_id: UserId, at: DateTime<Utc>) -> StoreResult<()>;
}

/// Append-only engagement audit log.
#[async_trait]
pub trait EngagementLog: Send + Sync {
    /// Append one row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    async fn append(&self, entry: &AuditEntry) -> StoreResult<()>;
}

/// Hand-off to the certificate generation job system.
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Ask for a certificate to be generated. Failures are the issuer's to log.
    async fn request_certificate(&self, user_id: UserId, course_id: CourseId);
}

/// Hand-off to the notification system.
#[async_trait]
pub trait ReminderNotifier: Send + Sync {
    /// Remind a student about a course they stopped working on.
    async fn send_course_reminder(&self, enrollment: &Enrollment);
}
