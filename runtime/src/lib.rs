//! # Engagement Runtime
//!
//! Runtime for the student-engagement pipeline: everything between the
//! transport traits in `engagement-core` and the collaborator stores.
//!
//! ## Core Components
//!
//! - **Producer** ([`producer`]): builds envelopes and hands them off without
//!   ever failing the caller
//! - **Consumer runtime** ([`consumer`]): the poll loop, rebalance tracking
//!   and graceful shutdown
//! - **Dispatcher** ([`dispatcher`]): decode, route, retry, dead-letter
//! - **Handlers** ([`handlers`]): one idempotent mutation per event type
//! - **Operational control**: [`retry`], [`shutdown`], [`metrics`]
//!
//! ## Example
//!
//! ```ignore
//! use engagement_runtime::{ConsumerRuntime, EngagementHandlers, EventDispatcher};
//!
//! let handlers = EngagementHandlers::new(collaborators, clock.clone());
//! let dispatcher = Arc::new(EventDispatcher::new(handlers, clock));
//! let (trigger, shutdown) = shutdown_channel();
//!
//! let mut runtime = ConsumerRuntime::new(source, rebalances, dispatcher, shutdown);
//! let stats = runtime.run().await?;
//! ```

/// Consumer-group poll loop
pub mod consumer;

/// Payload decoding and routing
pub mod dispatcher;

/// Per-event-type handlers
pub mod handlers;

/// Prometheus metrics for observability
pub mod metrics;

/// Web-tier producer
pub mod producer;

/// Retry logic with exponential backoff
pub mod retry;

/// Shutdown signalling
pub mod shutdown;

pub use consumer::{ConsumerError, ConsumerRuntime, ConsumerStats};
pub use dispatcher::{DispatchOutcome, EventDispatcher};
pub use handlers::{Collaborators, EngagementHandlers, HandlerError};
pub use producer::EngagementProducer;
pub use retry::RetryPolicy;
pub use shutdown::{ShutdownTrigger, Signal, shutdown_channel, wait_for_signal};
