//! In-memory collaborator stores.
//!
//! [`InMemoryEngagementStore`] implements every store trait the handlers use
//! over one shared state, so a test can wire the same instance into each
//! slot and inspect the result afterwards.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use engagement_core::event::{CourseId, LessonId, UserId};
use engagement_core::store::{
    AuditEntry, AuditKind, CertificateStore, CourseCatalog, EngagementLog, Enrollment,
    EnrollmentStatus, EnrollmentStore, ProgressRecord, ProgressStore, StoreError, StoreResult,
    UserStore,
};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
struct State {
    lessons: HashMap<LessonId, CourseId>,
    progress: HashMap<(UserId, LessonId), ProgressRecord>,
    enrollments: HashMap<(UserId, CourseId), Enrollment>,
    certificates: HashSet<(UserId, CourseId)>,
    certificate_requests: HashSet<(UserId, CourseId)>,
    last_login: HashMap<UserId, DateTime<Utc>>,
    audit: Vec<AuditEntry>,
}

/// In-memory implementation of every collaborator store.
///
/// Cloning shares the underlying state.
///
/// # Example
///
/// ```
/// use engagement_testing::InMemoryEngagementStore;
/// use engagement_core::event::{CourseId, LessonId};
///
/// let store = InMemoryEngagementStore::new();
/// store.add_course(CourseId::new(5), &[LessonId::new(10), LessonId::new(11)]);
/// assert_eq!(store.lessons_in(CourseId::new(5)), 2);
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryEngagementStore {
    state: Arc<RwLock<State>>,
    failures_remaining: Arc<AtomicU32>,
}

impl InMemoryEngagementStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a course and its lessons.
    pub fn add_course(&self, course_id: CourseId, lessons: &[LessonId]) {
        let mut state = self.state.write().unwrap();
        for lesson in lessons {
            state.lessons.insert(*lesson, course_id);
        }
    }

    /// Number of lessons registered for a course.
    #[must_use]
    pub fn lessons_in(&self, course_id: CourseId) -> usize {
        self.state
            .read()
            .unwrap()
            .lessons
            .values()
            .filter(|c| **c == course_id)
            .count()
    }

    /// Insert or replace an enrollment.
    pub fn put_enrollment(&self, enrollment: Enrollment) {
        self.state
            .write()
            .unwrap()
            .enrollments
            .insert((enrollment.user_id, enrollment.course_id), enrollment);
    }

    /// Mark a certificate as already issued.
    pub fn add_certificate(&self, user_id: UserId, course_id: CourseId) {
        self.state
            .write()
            .unwrap()
            .certificates
            .insert((user_id, course_id));
    }

    /// Current progress row, if any.
    #[must_use]
    pub fn progress(&self, user_id: UserId, lesson_id: LessonId) -> Option<ProgressRecord> {
        self.state
            .read()
            .unwrap()
            .progress
            .get(&(user_id, lesson_id))
            .cloned()
    }

    /// Current enrollment, regardless of status.
    #[must_use]
    pub fn enrollment(&self, user_id: UserId, course_id: CourseId) -> Option<Enrollment> {
        self.state
            .read()
            .unwrap()
            .enrollments
            .get(&(user_id, course_id))
            .cloned()
    }

    /// Last login recorded for a user.
    #[must_use]
    pub fn last_login(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        self.state.read().unwrap().last_login.get(&user_id).copied()
    }

    /// Every audit row, in append order.
    #[must_use]
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.read().unwrap().audit.clone()
    }

    /// Audit rows of one kind.
    #[must_use]
    pub fn audit_entries_of(&self, kind: AuditKind) -> Vec<AuditEntry> {
        self.state
            .read()
            .unwrap()
            .audit
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect()
    }

    /// Make the next `count` store calls fail with [`StoreError::Unavailable`].
    pub fn fail_next(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        let took = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(StoreError::Unavailable(
                "injected failure".to_string(),
            )),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl ProgressStore for InMemoryEngagementStore {
    async fn get(
        &self,
        user_id: UserId,
        lesson_id: LessonId,
    ) -> StoreResult<Option<ProgressRecord>> {
        self.check_available()?;
        Ok(self.progress(user_id, lesson_id))
    }

    async fn upsert(&self, record: &ProgressRecord) -> StoreResult<ProgressRecord> {
        self.check_available()?;
        let mut state = self.state.write().unwrap();
        let key = (record.user_id, record.lesson_id);
        let merged = match state.progress.get(&key) {
            Some(existing) => existing.merge(record),
            None => record.clone(),
        };
        state.progress.insert(key, merged.clone());
        Ok(merged)
    }

    async fn count_completed_in_course(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> StoreResult<u64> {
        self.check_available()?;
        let state = self.state.read().unwrap();
        let count = state
            .progress
            .values()
            .filter(|p| {
                p.user_id == user_id
                    && p.is_completed
                    && state.lessons.get(&p.lesson_id) == Some(&course_id)
            })
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl CourseCatalog for InMemoryEngagementStore {
    async fn lesson_count(&self, course_id: CourseId) -> StoreResult<u64> {
        self.check_available()?;
        Ok(self.lessons_in(course_id) as u64)
    }
}

#[async_trait]
impl EnrollmentStore for InMemoryEngagementStore {
    async fn find_active(
        &self,
        user_id: UserId,
        course_id: CourseId,
    ) -> StoreResult<Option<Enrollment>> {
        self.check_available()?;
        Ok(self
            .enrollment(user_id, course_id)
            .filter(|e| e.status == EnrollmentStatus::Active))
    }

    async fn save(&self, enrollment: &Enrollment) -> StoreResult<()> {
        self.check_available()?;
        let mut state = self.state.write().unwrap();
        match state
            .enrollments
            .entry((enrollment.user_id, enrollment.course_id))
        {
            Entry::Vacant(slot) => {
                slot.insert(enrollment.clone());
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                // Completed or closed elsewhere
                if existing.status != EnrollmentStatus::Active {
                    return Ok(());
                }
                existing.status = enrollment.status;
                existing.progress_percentage = existing
                    .progress_percentage
                    .max(enrollment.progress_percentage);
                existing.completed_at = existing.completed_at.or(enrollment.completed_at);
                existing.updated_at = existing.updated_at.max(enrollment.updated_at);
            }
        }
        Ok(())
    }

    async fn stale_enrollments(
        &self,
        user_id: UserId,
        cutoff: DateTime<Utc>,
    ) -> StoreResult<Vec<Enrollment>> {
        self.check_available()?;
        let state = self.state.read().unwrap();
        let mut stale: Vec<Enrollment> = state
            .enrollments
            .values()
            .filter(|e| {
                e.user_id == user_id
                    && e.status == EnrollmentStatus::Active
                    && e.progress_percentage < 100
                    && e.updated_at < cutoff
            })
            .cloned()
            .collect();
        stale.sort_by_key(|e| e.course_id);
        Ok(stale)
    }
}

#[async_trait]
impl CertificateStore for InMemoryEngagementStore {
    async fn has_certificate(&self, user_id: UserId, course_id: CourseId) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .unwrap()
            .certificates
            .contains(&(user_id, course_id)))
    }

    async fn claim_request(&self, user_id: UserId, course_id: CourseId) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self
            .state
            .write()
            .unwrap()
            .certificate_requests
            .insert((user_id, course_id)))
    }
}

#[async_trait]
impl UserStore for InMemoryEngagementStore {
    async fn touch_last_login(&self, user_id: UserId, at: DateTime<Utc>) -> StoreResult<()> {
        self.check_available()?;
        self.state
            .write()
            .unwrap()
            .last_login
            .entry(user_id)
            .and_modify(|last| *last = (*last).max(at))
            .or_insert(at);
        Ok(())
    }
}

#[async_trait]
impl EngagementLog for InMemoryEngagementStore {
    async fn append(&self, entry: &AuditEntry) -> StoreResult<()> {
        self.check_available()?;
        self.state.write().unwrap().audit.push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_clock;
    use engagement_core::environment::Clock;

    #[tokio::test]
    async fn upsert_merges_with_existing_row() {
        let store = InMemoryEngagementStore::new();
        let user = UserId::new(1);
        let lesson = LessonId::new(10);

        let mut first = ProgressRecord::new(user, lesson);
        first.watched_seconds = 300;
        store.upsert(&first).await.unwrap();

        let mut second = ProgressRecord::new(user, lesson);
        second.watched_seconds = 120;
        let merged = store.upsert(&second).await.unwrap();

        assert_eq!(merged.watched_seconds, 300);
        assert_eq!(store.progress(user, lesson), Some(merged));
    }

    #[tokio::test]
    async fn completed_count_is_scoped_to_course() {
        let store = InMemoryEngagementStore::new();
        let user = UserId::new(1);
        store.add_course(CourseId::new(5), &[LessonId::new(1), LessonId::new(2)]);
        store.add_course(CourseId::new(6), &[LessonId::new(3)]);

        for lesson in [1, 3] {
            let mut record = ProgressRecord::new(user, LessonId::new(lesson));
            record.is_completed = true;
            store.upsert(&record).await.unwrap();
        }

        assert_eq!(
            store
                .count_completed_in_course(user, CourseId::new(5))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.lesson_count(CourseId::new(5)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn claim_request_succeeds_once() {
        let store = InMemoryEngagementStore::new();
        let user = UserId::new(1);
        let course = CourseId::new(5);

        assert!(store.claim_request(user, course).await.unwrap());
        assert!(!store.claim_request(user, course).await.unwrap());
    }

    #[tokio::test]
    async fn stale_save_never_reopens_or_lowers_an_enrollment() {
        let store = InMemoryEngagementStore::new();
        let (user, course) = (UserId::new(1), CourseId::new(5));
        let now = test_clock().now();

        let mut lagging = Enrollment::active(user, course, now);
        lagging.apply_progress(19, 20, now);
        let mut finished = Enrollment::active(user, course, now);
        finished.apply_progress(20, 20, now);

        store.save(&finished).await.unwrap();
        store.save(&lagging).await.unwrap();

        let stored = store.enrollment(user, course).unwrap();
        assert_eq!(stored.status, EnrollmentStatus::Completed);
        assert_eq!(stored.progress_percentage, 100);
        assert_eq!(stored.completed_at, Some(now));
    }

    #[tokio::test]
    async fn save_leaves_canceled_enrollment_alone() {
        let store = InMemoryEngagementStore::new();
        let (user, course) = (UserId::new(1), CourseId::new(5));
        let now = test_clock().now();
        let mut canceled = Enrollment::active(user, course, now);
        canceled.status = EnrollmentStatus::Canceled;
        store.put_enrollment(canceled.clone());

        let mut recomputed = Enrollment::active(user, course, now);
        recomputed.apply_progress(1, 2, now);
        store.save(&recomputed).await.unwrap();

        assert_eq!(store.enrollment(user, course), Some(canceled));
    }

    #[tokio::test]
    async fn last_login_keeps_the_latest_time() {
        let store = InMemoryEngagementStore::new();
        let user = UserId::new(1);
        let later = test_clock().now();
        let earlier = later - chrono::TimeDelta::hours(1);

        store.touch_last_login(user, later).await.unwrap();
        store.touch_last_login(user, earlier).await.unwrap();

        assert_eq!(store.last_login(user), Some(later));
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_run_out() {
        let store = InMemoryEngagementStore::new();
        store.fail_next(2);

        let user = UserId::new(1);
        let first = store.touch_last_login(user, test_clock().now()).await;
        let second = store.touch_last_login(user, test_clock().now()).await;
        let third = store.touch_last_login(user, test_clock().now()).await;

        assert!(first.unwrap_err().is_transient());
        assert!(second.is_err());
        assert!(third.is_ok());
    }
}
