//! Fee module error types.

use thiserror::Error;

use super::state::{FeeId, FeeStatus};

/// Error taxonomy surfaced by every listing-fee operation.
///
/// Drivers decide what to do from the variant alone:
///
/// - `NotFound` is reported to the caller and never retried.
/// - `Conflict` means a status precondition did not hold. Drivers treat it as
///   a benign no-op; the query surface reports it as "already in progress".
/// - `Transient` is retried by the periodic driver on its next cycle.
/// - `Permanent` ends in a `failed` transition and is never retried.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FeeError {
    /// Unknown fee, scope or policy.
    #[error("{entity} not found: {key}")]
    NotFound {
        /// Kind of entity that was looked up.
        entity: &'static str,
        /// Lookup key.
        key: String,
    },

    /// Status precondition failed.
    #[error("listing fee {fee_id} is {status}: {reason}")]
    Conflict {
        /// The fee the operation targeted.
        fee_id: FeeId,
        /// Status observed when the precondition failed.
        status: FeeStatus,
        /// What the caller tried to do.
        reason: String,
    },

    /// RPC timeout, store unavailable or any other retryable failure.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Invalid configuration, malformed scope or a rejected transfer.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl FeeError {
    /// Builds a `NotFound` error.
    #[must_use]
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    /// Returns `true` if the next driver cycle may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` for status-precondition failures.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Errors from parsing persisted or user-supplied values.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Status string is not one of the four literals.
    #[error("invalid fee status: {value}")]
    InvalidStatus {
        /// The rejected value.
        value: String,
    },

    /// Amount is not a base-10 unsigned integer.
    #[error("invalid fee amount: {value}")]
    InvalidAmount {
        /// The rejected value.
        value: String,
    },

    /// Identifier is not a UUID.
    #[error("invalid identifier: {value}")]
    InvalidId {
        /// The rejected value.
        value: String,
    },

    /// Transaction references must not be empty.
    #[error("transaction reference is empty")]
    EmptyTxReference,

    /// On-chain result string is not recognised.
    #[error("invalid on-chain result: {value}")]
    InvalidOnChainResult {
        /// The rejected value.
        value: String,
    },
}

/// A signal that is not valid in the record's current state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum LifecycleError {
    /// Execution-side signals require a `pending` record.
    #[error("listing fee {fee_id} is not pending: {status}")]
    NotPending {
        /// The fee.
        fee_id: FeeId,
        /// Its current status.
        status: FeeStatus,
    },

    /// The pair is not in the transition table.
    #[error("transition from {from} to {to} is not allowed")]
    TransitionNotAllowed {
        /// Current status.
        from: FeeStatus,
        /// Requested status.
        to: FeeStatus,
    },
}

impl From<LifecycleError> for FeeError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::NotPending { fee_id, status } => Self::Conflict {
                fee_id,
                status,
                reason: "listing fee is not in pending state".to_string(),
            },
            other @ LifecycleError::TransitionNotAllowed { .. } => {
                Self::Permanent(other.to_string())
            },
        }
    }
}
