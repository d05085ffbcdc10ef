//! Fee storage contract.
//!
//! The store is the only synchronization point between drivers. Every
//! mutation is a conditional write, so implementations must make each method
//! atomic with respect to other handles on the same database, including
//! handles held by other processes.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::fee::{FeeError, FeeId, FeeRecord, FeeStatus, FeeTerms, Scope, ScopeId, Transition};

/// Errors returned by [`FeeStore`] implementations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The database could not be reached, was busy or its lock is poisoned.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The transaction reference is already attributed to another record.
    #[error("transaction reference {tx_reference} is already recorded")]
    DuplicateTxReference {
        /// The conflicting reference.
        tx_reference: String,
    },

    /// The requested pair is outside the transition table.
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition {
        /// Required current status.
        from: FeeStatus,
        /// Requested status.
        to: FeeStatus,
    },

    /// A persisted row could not be decoded or a write hit a schema guard.
    #[error("corrupt fee record: {details}")]
    Corrupt {
        /// What failed to decode.
        details: String,
    },
}

impl From<StoreError> for FeeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => Self::Transient(err.to_string()),
            StoreError::DuplicateTxReference { .. }
            | StoreError::IllegalTransition { .. }
            | StoreError::Corrupt { .. } => Self::Permanent(err.to_string()),
        }
    }
}

/// Durable, strongly-consistent storage for fee records.
///
/// Reads return `Ok(None)` for missing records; absence is never an error at
/// this layer.
pub trait FeeStore: Send + Sync {
    /// Creates a `pending` record for `scope` unless an open record exists, in
    /// which case the existing record is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the write could not be
    /// committed.
    fn create_if_absent(
        &self,
        scope: &Scope,
        terms: &FeeTerms,
        now: DateTime<Utc>,
    ) -> Result<FeeRecord, StoreError>;

    /// Loads a record by id.
    fn get(&self, id: FeeId) -> Result<Option<FeeRecord>, StoreError>;

    /// Loads the most recently created record for a (payer, target) pair.
    fn latest_for_scope(&self, payer: &str, target: &str)
    -> Result<Option<FeeRecord>, StoreError>;

    /// Loads the most recently created record owned by a policy.
    fn latest_for_scope_id(&self, scope_id: ScopeId) -> Result<Option<FeeRecord>, StoreError>;

    /// Applies `transition` if the record is still in `transition.from`.
    ///
    /// Returns `false` when another writer already moved the record. Every
    /// applied transition clears the execution lease.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IllegalTransition`] for pairs outside the table
    /// and [`StoreError::DuplicateTxReference`] if the reference belongs to
    /// another record.
    fn transition(&self, transition: &Transition, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// All records in `status`, oldest first.
    fn list_by_status(&self, status: FeeStatus) -> Result<Vec<FeeRecord>, StoreError>;

    /// Claims the execution lease until `until` if the record is `pending` and
    /// no unexpired lease is held at `now`.
    fn try_claim_execution(
        &self,
        id: FeeId,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Drops the execution lease. A no-op if none is held.
    fn release_execution_claim(&self, id: FeeId) -> Result<(), StoreError>;
}
