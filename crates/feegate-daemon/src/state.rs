//! Shared daemon state.
//!
//! Provides the process-wide shutdown signal and the start time reported by
//! the health endpoint.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Creates a linked trigger/signal pair.
#[must_use]
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, ShutdownSignal { rx })
}

/// Requests shutdown of every task holding a linked [`ShutdownSignal`].
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    /// Request shutdown. Idempotent.
    pub fn request_shutdown(&self) {
        self.tx.send_replace(true);
    }

    /// Returns a new signal linked to this trigger.
    #[must_use]
    pub fn subscribe(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// Cloneable, cancellable view of the shutdown flag.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown is requested, or the trigger is dropped.
    pub async fn requested(&mut self) {
        // An Err means the trigger is gone, which also ends the process.
        let _ = self.rx.wait_for(|requested| *requested).await;
    }
}

/// Read-only state exposed by the health endpoint.
#[derive(Debug, Clone)]
pub struct DaemonState {
    started_at: DateTime<Utc>,
    shutdown: ShutdownSignal,
}

impl DaemonState {
    /// Create daemon state starting now.
    #[must_use]
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            started_at: Utc::now(),
            shutdown,
        }
    }

    /// Get the daemon start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Get daemon uptime in seconds.
    #[must_use]
    #[allow(clippy::cast_sign_loss)] // max(0) ensures non-negative
    pub fn uptime_secs(&self) -> u64 {
        (Utc::now() - self.started_at).num_seconds().max(0) as u64
    }

    /// Check if shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_shutdown_requested()
    }
}
