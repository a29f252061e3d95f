//! Prometheus metrics for the engagement pipeline.
//!
//! Counters are recorded through the `metrics` facade everywhere; nothing is
//! exported unless the worker installs the Prometheus exporter with
//! [`MetricsServer::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! use engagement_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Start metrics server on port 9090
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::describe_counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::counter;

pub use engagement_core::dead_letter::{DEAD_LETTERS_DISCARDED, DEAD_LETTERS_RESOLVED};

/// Events handed to the broker client.
pub const EVENTS_PUBLISHED: &str = "engagement_events_published_total";
/// Events the producer could not hand off.
pub const EVENTS_PUBLISH_FAILED: &str = "engagement_events_publish_failed_total";
/// Events applied by a handler, by `event_type`.
pub const EVENTS_PROCESSED: &str = "engagement_events_processed_total";
/// Messages dropped before reaching a handler, by `reason`.
pub const EVENTS_DROPPED: &str = "engagement_events_dropped_total";
/// Events whose handler failed, by `event_type`.
pub const EVENTS_FAILED: &str = "engagement_events_failed_total";
/// Failed events written to the dead-letter sink.
pub const DEAD_LETTERS: &str = "engagement_dead_letters_total";
/// Partition assignment changes, by `kind`.
pub const REBALANCES: &str = "engagement_rebalances_total";
/// Transport errors seen by the poll loop.
pub const TRANSPORT_ERRORS: &str = "engagement_transport_errors_total";

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    started: bool,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            started: false,
        }
    }

    /// Install the exporter and start serving `/metrics`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if a recorder is already installed
    /// or the listener cannot bind.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .install()
            .map_err(|e| MetricsError::Install(e.to_string()))?;

        register_metrics();
        self.started = true;
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Whether the exporter is installed.
    #[must_use]
    pub const fn is_started(&self) -> bool {
        self.started
    }
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(
        EVENTS_PUBLISHED,
        "Total number of engagement events handed to the broker client"
    );
    describe_counter!(
        EVENTS_PUBLISH_FAILED,
        "Total number of engagement events the producer failed to hand off"
    );
    describe_counter!(
        EVENTS_PROCESSED,
        "Total number of engagement events applied by a handler"
    );
    describe_counter!(
        EVENTS_DROPPED,
        "Total number of messages dropped before dispatch"
    );
    describe_counter!(
        EVENTS_FAILED,
        "Total number of engagement events whose handler failed"
    );
    describe_counter!(
        DEAD_LETTERS,
        "Total number of failed events recorded to the dead-letter sink"
    );
    describe_counter!(
        DEAD_LETTERS_RESOLVED,
        "Total number of dead letters marked resolved"
    );
    describe_counter!(
        DEAD_LETTERS_DISCARDED,
        "Total number of dead letters marked discarded"
    );
    describe_counter!(REBALANCES, "Total number of partition assignment changes");
    describe_counter!(
        TRANSPORT_ERRORS,
        "Total number of transport errors seen while polling"
    );
}

/// Producer metrics recorder.
pub struct ProducerMetrics;

impl ProducerMetrics {
    /// Record a successful hand-off.
    pub fn record_published() {
        counter!(EVENTS_PUBLISHED).increment(1);
    }

    /// Record a failed hand-off.
    pub fn record_failed() {
        counter!(EVENTS_PUBLISH_FAILED).increment(1);
    }
}

/// Consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record an applied event.
    pub fn record_processed(event_type: &'static str) {
        counter!(EVENTS_PROCESSED, "event_type" => event_type).increment(1);
    }

    /// Record a dropped message.
    pub fn record_dropped(reason: &'static str) {
        counter!(EVENTS_DROPPED, "reason" => reason).increment(1);
    }

    /// Record a handler failure.
    pub fn record_failed(event_type: &'static str) {
        counter!(EVENTS_FAILED, "event_type" => event_type).increment(1);
    }

    /// Record a dead letter.
    pub fn record_dead_letter() {
        counter!(DEAD_LETTERS).increment(1);
    }

    /// Record a rebalance event.
    pub fn record_rebalance(kind: &'static str) {
        counter!(REBALANCES, "kind" => kind).increment(1);
    }

    /// Record a transport error.
    pub fn record_transport_error() {
        counter!(TRANSPORT_ERRORS).increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn counter_names_are_distinct_prometheus_totals() {
        let names = [
            EVENTS_PUBLISHED,
            EVENTS_PUBLISH_FAILED,
            EVENTS_PROCESSED,
            EVENTS_DROPPED,
            EVENTS_FAILED,
            DEAD_LETTERS,
            DEAD_LETTERS_RESOLVED,
            DEAD_LETTERS_DISCARDED,
            REBALANCES,
            TRANSPORT_ERRORS,
        ];

        let unique: HashSet<&str> = names.iter().copied().collect();
        assert_eq!(unique.len(), names.len());
        for name in names {
            assert!(name.starts_with("engagement_"), "{name}");
            assert!(name.ends_with("_total"), "{name}");
        }
    }

    #[test]
    fn describing_without_a_recorder_is_a_no_op() {
        register_metrics();
    }
}
