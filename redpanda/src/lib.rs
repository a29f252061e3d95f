//! Redpanda transport for the student-engagement pipeline.
//!
//! This crate implements the transport seams from `engagement-core` on top of
//! rdkafka, so it works against Redpanda or any other Kafka-protocol broker.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  publish   ┌──────────────────────┐
//! │  Web tier   │ ─────────► │  RedpandaPublisher   │──┐
//! └─────────────┘            └──────────────────────┘  │
//!                                                      ▼
//!                                        ┌──────────────────────────┐
//!                                        │  student-engagement      │
//!                                        │  (partitioned by user)   │
//!                                        └────────────┬─────────────┘
//!                                                     │
//!            rebalance channel  ┌─────────────────────┴──┐
//!          ◄─────────────────── │   RedpandaConsumer     │
//!                               └────────────────────────┘
//! ```
//!
//! # Delivery Semantics
//!
//! **Producer**: [`DeliveryMode::FireAndForget`] (the default) returns once the
//! message sits in the client's local buffer; broker failures surface later
//! in the delivery callback and are only logged. [`DeliveryMode::Acknowledged`]
//! waits for the broker instead.
//!
//! **Consumer**: offsets are auto-committed on a fixed interval, so a crash
//! replays at most one interval of messages. Handlers must be idempotent.
//!
//! # Example
//!
//! ```no_run
//! use engagement_redpanda::{ConsumerConfig, DeliveryMode, RedpandaConsumer, RedpandaPublisher};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let publisher = RedpandaPublisher::builder()
//!     .brokers("localhost:9092")
//!     .delivery_mode(DeliveryMode::FireAndForget)
//!     .build()?;
//!
//! let (consumer, rebalances) = RedpandaConsumer::connect(&ConsumerConfig::default())?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod consumer;
mod jobs;
mod publisher;

pub use consumer::{ConsumerConfig, RebalanceContext, RedpandaConsumer};
pub use jobs::{CERTIFICATE_TOPIC, CertificateJob, JobDispatch, REMINDER_TOPIC, ReminderJob};
pub use publisher::{DeliveryLogger, DeliveryMode, RedpandaPublisher, RedpandaPublisherBuilder};
