//! Graceful shutdown signalling.
//!
//! The consumer loop watches a `tokio::sync::watch` flag; the worker flips it
//! when the process receives SIGINT or SIGTERM.
//!
//! ```ignore
//! let (trigger, signal) = shutdown_channel();
//! tokio::spawn(async move {
//!     wait_for_signal().await;
//!     trigger.trigger();
//! });
//! runtime.run().await?;
//! ```

use std::future::pending;
use tokio::sync::watch;
use tracing::{info, warn};

/// Sending side of the shutdown flag.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Ask every watcher to stop.
    pub fn trigger(&self) {
        // send_replace never fails, even with no receivers left
        self.tx.send_replace(true);
    }
}

/// Create a shutdown flag and its first watcher.
#[must_use]
pub fn shutdown_channel() -> (ShutdownTrigger, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, rx)
}

/// Which process signal ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ctrl+C / SIGINT
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// Wait for SIGTERM or Ctrl+C.
///
/// A listener that cannot be installed is logged and ignored; the other one
/// is still awaited.
pub async fn wait_for_signal() -> Signal {
    #[cfg(unix)]
    let signal = {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => first_signal(tokio::signal::ctrl_c(), sigterm.recv()).await,
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler, waiting for Ctrl+C only");
                first_signal(tokio::signal::ctrl_c(), pending()).await
            }
        }
    };
    #[cfg(not(unix))]
    let signal = first_signal(tokio::signal::ctrl_c(), pending()).await;

    match signal {
        Signal::Interrupt => info!("Received Ctrl+C"),
        Signal::Terminate => info!("Received SIGTERM"),
    }
    signal
}

/// Resolve with the first listener that actually fires.
///
/// A failing Ctrl+C listener or a closed SIGTERM stream never counts as a
/// signal.
async fn first_signal<C, T>(ctrl_c: C, terminate: T) -> Signal
where
    C: Future<Output = std::io::Result<()>>,
    T: Future<Output = Option<()>>,
{
    let interrupt = async {
        match ctrl_c.await {
            Ok(()) => Signal::Interrupt,
            Err(e) => {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                pending().await
            }
        }
    };
    let terminate = async {
        if terminate.await.is_some() {
            Signal::Terminate
        } else {
            warn!("SIGTERM stream closed");
            pending().await
        }
    };

    tokio::select! {
        signal = interrupt => signal,
        signal = terminate => signal,
    }
}
