//! Shared wiring for runtime integration tests.

#![allow(dead_code)] // Not every test binary uses every helper

use engagement_core::environment::Clock;
use engagement_core::event::{CourseId, EngagementEvent, Envelope, LessonId, UserId};
use engagement_core::store::Enrollment;
use engagement_runtime::{Collaborators, EngagementHandlers, EventDispatcher, RetryPolicy};
use engagement_testing::{
    FixedClock, InMemoryDeadLetterSink, InMemoryEngagementStore, RecordingIssuer,
    RecordingNotifier, test_clock,
};
use std::sync::Arc;
use std::time::Duration;

/// Stores, recorders and a dispatcher wired together.
pub struct Harness {
    pub store: Arc<InMemoryEngagementStore>,
    pub issuer: RecordingIssuer,
    pub notifier: RecordingNotifier,
    pub dead_letters: InMemoryDeadLetterSink,
    pub clock: FixedClock,
    pub handlers: EngagementHandlers,
}

impl Harness {
    pub fn new() -> Self {
        Self::at(test_clock())
    }

    pub fn at(clock: FixedClock) -> Self {
        init_test_logging();
        let store = Arc::new(InMemoryEngagementStore::new());
        let issuer = RecordingIssuer::new();
        let notifier = RecordingNotifier::new();
        let collaborators = Collaborators::from_store(
            &store,
            Arc::new(issuer.clone()),
            Arc::new(notifier.clone()),
        );
        let handlers = EngagementHandlers::new(collaborators, Arc::new(clock.clone()));

        Self {
            store,
            issuer,
            notifier,
            dead_letters: InMemoryDeadLetterSink::new(),
            clock,
            handlers,
        }
    }

    /// Dispatcher with fast retries and the in-memory dead-letter sink.
    pub fn dispatcher(&self) -> Arc<EventDispatcher> {
        Arc::new(
            EventDispatcher::new(self.handlers.clone(), Arc::new(self.clock.clone()))
                .with_retry_policy(fast_retry())
                .with_dead_letter_sink(Arc::new(self.dead_letters.clone())),
        )
    }

    /// Register course 5 with `lessons` lessons (ids 10, 11, ...) and enroll user 1.
    pub fn course_with_enrollment(&self, lessons: i64) -> (UserId, CourseId, Vec<LessonId>) {
        let user = UserId::new(1);
        let course = CourseId::new(5);
        let lesson_ids: Vec<LessonId> = (0..lessons).map(|i| LessonId::new(10 + i)).collect();
        self.store.add_course(course, &lesson_ids);
        self.store
            .put_enrollment(Enrollment::active(user, course, self.clock.now()));
        (user, course, lesson_ids)
    }
}

/// Route runtime logs to the test writer; later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("engagement=debug")
        .with_test_writer()
        .try_init();
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(2)
        .initial_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(5))
        .build()
}

/// Encode an event the way the producer would.
#[allow(clippy::unwrap_used)]
pub fn encode(event: EngagementEvent) -> Vec<u8> {
    Envelope::new(event, 1_735_689_600).to_json().unwrap()
}
