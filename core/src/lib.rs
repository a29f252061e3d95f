//! # Engagement Core
//!
//! Shared types and seams for the student-engagement pipeline.
//!
//! The pipeline moves learner activity (lesson views, completions,
//! enrollments, logins, AI assistant queries) from the web tier into a
//! partitioned durable log, and from the log into progress records,
//! enrollment percentages, audit rows and certificate/reminder jobs.
//!
//! ## Modules
//!
//! - [`event`]: the wire envelope and typed event variants
//! - [`event_bus`]: publisher and consumer-source traits, rebalance events
//! - [`store`]: persistence model and the collaborator traits handlers use
//! - [`dead_letter`]: where messages go when their handler keeps failing
//! - [`environment`]: injected clock
//!
//! ## Example
//!
//! ```
//! use engagement_core::event::{EngagementEvent, Envelope, LessonCompleted, LessonId, UserId};
//!
//! let envelope = Envelope::new(
//!     EngagementEvent::LessonCompleted(LessonCompleted {
//!         user_id: UserId::new(7),
//!         lesson_id: LessonId::new(3),
//!         course_id: None,
//!     }),
//!     1_700_000_000,
//! );
//! assert_eq!(envelope.routing_key(), "user_7");
//! ```

pub use chrono::{DateTime, Utc};

pub mod dead_letter;
pub mod event;
pub mod event_bus;
pub mod store;

/// Injected dependencies that are not persistence.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// Handlers never call `Utc::now()` directly; completion timestamps,
    /// stale-enrollment cutoffs and producer timestamps all come from here.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
