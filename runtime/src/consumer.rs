//! The long-running consumer-group loop.
//!
//! # Overview
//!
//! [`ConsumerRuntime`] owns one [`MessageSource`] and drives it until
//! shutdown:
//!
//! 1. Drain pending rebalance events and update the assigned partition set
//! 2. Check the shutdown flag
//! 3. Poll with a bounded wait, racing the shutdown flag
//! 4. Dispatch the message, if any, to completion
//!
//! Partition EOF and poll timeouts are no-ops. Transport errors are logged
//! and followed by a short backoff. A message being dispatched is never
//! cancelled; shutdown is observed before the next poll.
//!
//! # Offsets
//!
//! The broker client commits offsets periodically in the background. A
//! crash replays whatever was processed since the last commit, which is why
//! every handler is idempotent.

use crate::dispatcher::{DispatchOutcome, EventDispatcher};
use crate::metrics::ConsumerMetrics;
use engagement_core::event_bus::{
    MessageSource, PollOutcome, RebalanceEvent, RebalanceReceiver, ReceivedMessage, TopicPartition,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Default bounded wait per poll.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default pause after a transport error.
pub const DEFAULT_TRANSPORT_BACKOFF: Duration = Duration::from_millis(500);

/// Fatal consumer-loop errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerError {
    /// The source closed while no shutdown was requested.
    #[error("Message source closed unexpectedly")]
    SourceClosed,
}

/// Counters for one run of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Messages applied by a handler
    pub processed: u64,
    /// Messages dropped before dispatch
    pub dropped: u64,
    /// Messages whose handler kept failing
    pub failed: u64,
    /// Failed messages recorded to the dead-letter sink
    pub dead_lettered: u64,
    /// Transport errors seen while polling
    pub transport_errors: u64,
    /// End-of-partition markers seen
    pub partition_eofs: u64,
    /// Rebalance events handled
    pub rebalances: u64,
}

/// Drives a [`MessageSource`] and hands each message to the dispatcher.
pub struct ConsumerRuntime<S> {
    source: S,
    rebalances: RebalanceReceiver,
    dispatcher: Arc<EventDispatcher>,
    shutdown: watch::Receiver<bool>,
    shutdown_lost: bool,
    poll_timeout: Duration,
    transport_backoff: Duration,
    assigned: BTreeSet<TopicPartition>,
    stats: ConsumerStats,
}

impl<S: MessageSource> ConsumerRuntime<S> {
    /// Create a runtime over a subscribed source.
    ///
    /// `rebalances` is the channel the source reports assignment changes on;
    /// `shutdown` stops the loop once it reads `true`.
    #[must_use]
    pub fn new(
        source: S,
        rebalances: RebalanceReceiver,
        dispatcher: Arc<EventDispatcher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            source,
            rebalances,
            dispatcher,
            shutdown,
            shutdown_lost: false,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            transport_backoff: DEFAULT_TRANSPORT_BACKOFF,
            assigned: BTreeSet::new(),
            stats: ConsumerStats::default(),
        }
    }

    /// Set the bounded wait per poll.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the pause after a transport error.
    #[must_use]
    pub const fn with_transport_backoff(mut self, backoff: Duration) -> Self {
        self.transport_backoff = backoff;
        self
    }

    /// Partitions currently owned by this member.
    #[must_use]
    pub fn assigned_partitions(&self) -> Vec<TopicPartition> {
        self.assigned.iter().cloned().collect()
    }

    /// Counters so far.
    #[must_use]
    pub const fn stats(&self) -> ConsumerStats {
        self.stats
    }

    /// Run until shutdown, then close the source.
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerError::SourceClosed`] if the source stops yielding
    /// without a shutdown request.
    pub async fn run(&mut self) -> Result<ConsumerStats, ConsumerError> {
        info!(
            poll_timeout_ms = u64::try_from(self.poll_timeout.as_millis()).unwrap_or(u64::MAX),
            "Consumer loop started"
        );

        let result = loop {
            self.drain_rebalances();

            if self.shutdown_requested() {
                info!("Shutdown requested, leaving poll loop");
                break Ok(());
            }

            let outcome = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        warn!("Shutdown signal dropped, stopping consumer");
                        self.shutdown_lost = true;
                    }
                    continue;
                }
                outcome = self.source.poll(self.poll_timeout) => outcome,
            };

            match outcome {
                PollOutcome::Message(message) => self.handle_message(message).await,
                PollOutcome::PartitionEof { topic, partition } => {
                    debug!(topic = %topic, partition, "Reached end of partition");
                    self.stats.partition_eofs += 1;
                }
                PollOutcome::TimedOut => {}
                PollOutcome::TransportError(e) => {
                    error!(error = %e, "Transport error while polling");
                    ConsumerMetrics::record_transport_error();
                    self.stats.transport_errors += 1;
                    tokio::time::sleep(self.transport_backoff).await;
                }
                PollOutcome::Closed => {
                    if self.shutdown_requested() {
                        break Ok(());
                    }
                    error!("Message source closed without a shutdown request");
                    break Err(ConsumerError::SourceClosed);
                }
            }
        };

        self.source.close().await;
        self.drain_rebalances();
        info!(
            processed = self.stats.processed,
            dropped = self.stats.dropped,
            failed = self.stats.failed,
            transport_errors = self.stats.transport_errors,
            "Consumer loop stopped"
        );

        result.map(|()| self.stats)
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown_lost || *self.shutdown.borrow()
    }

    async fn handle_message(&mut self, message: ReceivedMessage) {
        let origin = message.origin();
        let payload = message.payload.as_deref().unwrap_or_default();

        match self.dispatcher.dispatch(payload, Some(&origin)).await {
            DispatchOutcome::Applied(_) => self.stats.processed += 1,
            DispatchOutcome::Dropped(_) => self.stats.dropped += 1,
            DispatchOutcome::Failed { dead_lettered, .. } => {
                self.stats.failed += 1;
                if dead_lettered {
                    self.stats.dead_lettered += 1;
                }
            }
        }
    }

    fn drain_rebalances(&mut self) {
        while let Ok(event) = self.rebalances.try_recv() {
            self.stats.rebalances += 1;
            match event {
                RebalanceEvent::Assigned(partitions) => {
                    info!(partitions = ?partitions, "Partitions assigned");
                    ConsumerMetrics::record_rebalance("assign");
                    self.assigned.extend(partitions);
                }
                RebalanceEvent::Revoked(partitions) => {
                    info!(partitions = ?partitions, "Partitions revoked");
                    ConsumerMetrics::record_rebalance("revoke");
                    for partition in &partitions {
                        self.assigned.remove(partition);
                    }
                }
                RebalanceEvent::Failed(reason) => {
                    warn!(reason = %reason, "Rebalance failed");
                    ConsumerMetrics::record_rebalance("error");
                }
            }
        }
    }
}
