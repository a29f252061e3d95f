//! # Engagement Testing
//!
//! Testing utilities for the student-engagement pipeline.
//!
//! This crate provides:
//! - [`FixedClock`]: deterministic time
//! - [`InMemoryEngagementStore`]: every collaborator store trait over `HashMap`s
//! - [`InMemoryBroker`]: a partitioned log with consumer groups and rebalance events
//! - [`RecordingIssuer`], [`RecordingNotifier`], [`InMemoryDeadLetterSink`]:
//!   capture hand-offs for assertions
//! - [`properties`]: proptest strategies for domain values
//!
//! ## Example
//!
//! ```
//! use engagement_testing::{InMemoryBroker, test_clock};
//! use engagement_core::environment::Clock;
//!
//! let broker = InMemoryBroker::new(4);
//! let clock = test_clock();
//! assert_eq!(broker.partition_count(), 4);
//! assert_eq!(clock.now(), clock.now());
//! ```

use chrono::{DateTime, Utc};
use engagement_core::environment::Clock;

pub mod broker;
pub mod recorders;
pub mod stores;

/// Controllable clocks.
pub mod clock {
    use super::{Clock, DateTime, Utc};
    use chrono::TimeDelta;
    use std::sync::{Arc, Mutex, PoisonError};

    /// A clock that only moves when told to.
    ///
    /// Clones share the same instant, so a test can hand one clone to the
    /// handlers and advance another.
    ///
    /// ```
    /// use engagement_testing::test_clock;
    /// use engagement_core::environment::Clock;
    /// use chrono::TimeDelta;
    ///
    /// let clock = test_clock();
    /// let shared = clock.clone();
    /// let before = clock.now();
    /// shared.advance(TimeDelta::days(8));
    /// assert_eq!(clock.now() - before, TimeDelta::days(8));
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl FixedClock {
        /// Stop the clock at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move every clone forward by `delta`.
        pub fn advance(&self, delta: TimeDelta) {
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += delta;
        }

        /// Jump every clone to `time`.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// 2025-01-01 00:00:00 UTC.
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(DateTime::<Utc>::UNIX_EPOCH + TimeDelta::seconds(1_735_689_600))
    }
}

/// Property-based testing utilities using proptest.
pub mod properties {
    use engagement_core::event::{LessonId, UserId};
    use proptest::prelude::*;

    /// Small positive user ids.
    pub fn arb_user_id() -> impl Strategy<Value = UserId> {
        (1i64..10_000).prop_map(UserId::new)
    }

    /// Small positive lesson ids.
    pub fn arb_lesson_id() -> impl Strategy<Value = LessonId> {
        (1i64..10_000).prop_map(LessonId::new)
    }

    /// A run of `viewed_seconds` values as a student scrubs through a lesson.
    ///
    /// Values are unordered: a student may seek backwards.
    pub fn arb_view_sequence(max_len: usize) -> impl Strategy<Value = Vec<u32>> {
        prop::collection::vec(0u32..3_600, 1..max_len)
    }
}

pub use broker::{AssignmentHandle, InMemoryBroker, InMemoryConsumer};
pub use clock::{FixedClock, test_clock};
pub use recorders::{InMemoryDeadLetterSink, RecordingIssuer, RecordingNotifier};
pub use stores::InMemoryEngagementStore;
