//! Recording doubles for fire-and-forget hand-offs and the dead-letter sink.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Panics only on a poisoned lock

use async_trait::async_trait;
use engagement_core::dead_letter::{DeadLetter, DeadLetterError, DeadLetterSink};
use engagement_core::event::{CourseId, UserId};
use engagement_core::store::{CertificateIssuer, Enrollment, ReminderNotifier};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Records every certificate request.
#[derive(Clone, Debug, Default)]
pub struct RecordingIssuer {
    requests: Arc<RwLock<Vec<(UserId, CourseId)>>>,
}

impl RecordingIssuer {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests in the order they were made.
    #[must_use]
    pub fn requests(&self) -> Vec<(UserId, CourseId)> {
        self.requests.read().unwrap().clone()
    }
}

#[async_trait]
impl CertificateIssuer for RecordingIssuer {
    async fn request_certificate(&self, user_id: UserId, course_id: CourseId) {
        self.requests.write().unwrap().push((user_id, course_id));
    }
}

/// Records every course reminder.
#[derive(Clone, Debug, Default)]
pub struct RecordingNotifier {
    reminders: Arc<RwLock<Vec<(UserId, CourseId)>>>,
}

impl RecordingNotifier {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reminders in the order they were sent.
    #[must_use]
    pub fn reminders(&self) -> Vec<(UserId, CourseId)> {
        self.reminders.read().unwrap().clone()
    }
}

#[async_trait]
impl ReminderNotifier for RecordingNotifier {
    async fn send_course_reminder(&self, enrollment: &Enrollment) {
        self.reminders
            .write()
            .unwrap()
            .push((enrollment.user_id, enrollment.course_id));
    }
}

/// Dead-letter sink that keeps letters in memory.
#[derive(Clone, Debug, Default)]
pub struct InMemoryDeadLetterSink {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
    failing: Arc<AtomicBool>,
}

impl InMemoryDeadLetterSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Letters recorded so far.
    #[must_use]
    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters.read().unwrap().clone()
    }

    /// Make `record` fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn record(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Storage("sink unavailable".to_string()));
        }
        self.letters.write().unwrap().push(letter.clone());
        Ok(())
    }
}
