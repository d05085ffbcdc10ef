//! Periodic driver plumbing shared by the executor, reconciler and
//! deactivator.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feegate_core::FeeError;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::state::ShutdownSignal;

/// Counters for one pass over a set of records or scopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassReport {
    /// Items looked at.
    pub examined: usize,
    /// Items whose state changed.
    pub advanced: usize,
    /// Items that needed nothing (still unknown, already handled, leased).
    pub skipped: usize,
    /// Items whose processing failed; retried next cycle.
    pub errors: usize,
}

impl PassReport {
    /// Records a successful item.
    pub fn advance(&mut self) {
        self.examined += 1;
        self.advanced += 1;
    }

    /// Records a no-op item.
    pub fn skip(&mut self) {
        self.examined += 1;
        self.skipped += 1;
    }

    /// Records a failed item.
    pub fn error(&mut self) {
        self.examined += 1;
        self.errors += 1;
    }

    /// Logs the report at `info`, or `warn` if any item failed.
    pub fn log(&self, pass: &'static str) {
        if self.errors > 0 {
            warn!(
                pass,
                examined = self.examined,
                advanced = self.advanced,
                skipped = self.skipped,
                errors = self.errors,
                "pass completed with errors"
            );
        } else if self.examined > 0 {
            info!(
                pass,
                examined = self.examined,
                advanced = self.advanced,
                skipped = self.skipped,
                "pass completed"
            );
        }
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "examined={} advanced={} skipped={} errors={}",
            self.examined, self.advanced, self.skipped, self.errors
        )
    }
}

/// Logs a pass-level failure (the pass could not even list its work).
pub fn log_pass_error(pass: &'static str, err: &FeeError) {
    warn!(pass, error = %err, retryable = err.is_retryable(), "pass failed");
}

/// Bounds a collaborator call. A timeout is a transient failure, never a
/// transition.
pub async fn bounded<T, E>(
    limit: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, FeeError>
where
    E: Into<FeeError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(FeeError::Transient(format!("{operation} timed out"))),
    }
}

/// Converts a std duration for timestamp arithmetic.
///
/// # Errors
///
/// Returns [`FeeError::Permanent`] if `duration` does not fit a
/// `chrono::Duration`.
pub fn chrono_duration(duration: Duration) -> Result<chrono::Duration, FeeError> {
    chrono::Duration::from_std(duration)
        .map_err(|_| FeeError::Permanent(format!("duration out of range: {duration:?}")))
}

/// `true` if more than `limit` passed between `since` and `now`. A `since`
/// in the future has not elapsed.
#[must_use]
pub fn has_elapsed(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - since).to_std().is_ok_and(|age| age > limit)
}

/// Runs `cycle` every `period` until shutdown is requested.
///
/// The first cycle runs immediately. A cycle in flight when shutdown arrives
/// runs to completion; no further cycle starts.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: ShutdownSignal,
    mut cycle: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    info!(
        driver = name,
        period_secs = period.as_secs(),
        "driver starting"
    );

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.requested() => break,
            _ = ticker.tick() => {},
        }
        cycle().await;
        if shutdown.is_shutdown_requested() {
            break;
        }
    }

    info!(driver = name, "driver stopped");
}
