//! `PostgreSQL` stores for the student-engagement pipeline.
//!
//! - [`PostgresEngagementStore`]: every collaborator store trait from
//!   `engagement-core` (progress, catalog, enrollments, certificates, users,
//!   audit log) over one pool
//! - [`DeadLetterQueue`]: the `failed_events` table, usable as a
//!   `DeadLetterSink` and for manual triage
//!
//! Schema lives in `migrations/` and is applied with
//! [`PostgresEngagementStore::migrate`].
//!
//! # Example
//!
//! ```no_run
//! use engagement_postgres::{DeadLetterQueue, PostgresEngagementStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresEngagementStore::connect("postgres://localhost/engagement", 5).await?;
//! store.migrate().await?;
//! let dlq = DeadLetterQueue::new(store.pool().clone());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod dead_letter_queue;
mod store;

pub use dead_letter_queue::{DLQStatus, DeadLetterQueue, FailedEvent};
pub use store::PostgresEngagementStore;
