//! Fee lifecycle controller.
//!
//! Pure state-machine logic: given a record and an external signal, decide
//! which conditional transition (if any) the store should apply. Nothing in
//! here performs I/O, so every driver reaches the same decision for the same
//! inputs and a re-delivered signal plans the same, already-applied write.

use super::error::LifecycleError;
use super::state::{FeeId, FeeRecord, FeeStatus, OnChainResult, OracleReport, TxReference};

/// Failure reason recorded when the oracle reports a reverted transfer.
pub const REASON_FAILED_ON_CHAIN: &str = "transaction failed on-chain";

/// Failure reason recorded when the oracle reports the transfer as lost.
pub const REASON_LOST: &str = "transaction lost";

/// Something that happened to a fee, as observed by one of the drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeeSignal {
    /// An execution was requested (queue delivery or polling pass).
    ExecutionRequested,
    /// The executor broadcast the transfer.
    BroadcastSucceeded {
        /// Reference returned by the settlement collaborator.
        tx_reference: TxReference,
    },
    /// The executor hit a non-retryable error.
    ExecutionFailed {
        /// Human-readable reason stored on the record.
        reason: String,
    },
    /// The oracle reported the latest transaction for the record's scope.
    OracleObserved(OracleReport),
    /// The record's own transaction has gone unindexed for longer than the
    /// loss threshold.
    TransactionUnindexed,
}

/// Optional columns written together with a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionFields {
    /// Set on `pending -> submitted`.
    pub tx_reference: Option<TxReference>,
    /// Set on `* -> failed`.
    pub failure_reason: Option<String>,
    /// Set on `submitted -> paid` when the oracle knows the depth.
    pub confirmation_count: Option<u32>,
}

/// A conditional status change: applies only while the record is in `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Target record.
    pub fee_id: FeeId,
    /// Required current status.
    pub from: FeeStatus,
    /// New status.
    pub to: FeeStatus,
    /// Columns written with the status.
    pub fields: TransitionFields,
}

impl Transition {
    /// `pending -> submitted` carrying the broadcast reference.
    #[must_use]
    pub fn submitted(fee_id: FeeId, tx_reference: TxReference) -> Self {
        Self {
            fee_id,
            from: FeeStatus::Pending,
            to: FeeStatus::Submitted,
            fields: TransitionFields {
                tx_reference: Some(tx_reference),
                ..TransitionFields::default()
            },
        }
    }

    /// `from -> failed` carrying a reason.
    #[must_use]
    pub fn failed(fee_id: FeeId, from: FeeStatus, reason: impl Into<String>) -> Self {
        Self {
            fee_id,
            from,
            to: FeeStatus::Failed,
            fields: TransitionFields {
                failure_reason: Some(reason.into()),
                ..TransitionFields::default()
            },
        }
    }

    /// `submitted -> paid`.
    #[must_use]
    pub fn paid(fee_id: FeeId, confirmation_count: Option<u32>) -> Self {
        Self {
            fee_id,
            from: FeeStatus::Submitted,
            to: FeeStatus::Paid,
            fields: TransitionFields {
                confirmation_count,
                ..TransitionFields::default()
            },
        }
    }

    /// Checks the pair against the transition table.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::TransitionNotAllowed`] for pairs outside the
    /// table, including every transition out of a terminal state.
    pub const fn validate(&self) -> Result<(), LifecycleError> {
        if self.from.can_transition_to(self.to) {
            Ok(())
        } else {
            Err(LifecycleError::TransitionNotAllowed {
                from: self.from,
                to: self.to,
            })
        }
    }
}

/// Computes the transition a signal produces for `record`.
///
/// Returns `Ok(None)` when the signal is valid but calls for no change: an
/// execution request on a pending record (an admission check), an oracle
/// report that is still `unknown`, a report about a different transaction,
/// any report for a terminal record, or an unindexed transaction on a record
/// that is not `submitted`.
///
/// # Errors
///
/// Returns [`LifecycleError::NotPending`] for execution-side signals on a
/// record that is no longer `pending`. This is what keeps a `submitted`
/// record from ever being broadcast again.
pub fn plan(record: &FeeRecord, signal: &FeeSignal) -> Result<Option<Transition>, LifecycleError> {
    match signal {
        FeeSignal::ExecutionRequested => {
            require_pending(record)?;
            Ok(None)
        },
        FeeSignal::BroadcastSucceeded { tx_reference } => {
            require_pending(record)?;
            Ok(Some(Transition::submitted(record.id, tx_reference.clone())))
        },
        FeeSignal::ExecutionFailed { reason } => {
            require_pending(record)?;
            Ok(Some(Transition::failed(
                record.id,
                FeeStatus::Pending,
                reason.clone(),
            )))
        },
        FeeSignal::OracleObserved(report) => Ok(plan_oracle(record, report)),
        FeeSignal::TransactionUnindexed => Ok((record.status == FeeStatus::Submitted)
            .then(|| Transition::failed(record.id, FeeStatus::Submitted, REASON_LOST))),
    }
}

fn require_pending(record: &FeeRecord) -> Result<(), LifecycleError> {
    if record.status == FeeStatus::Pending {
        Ok(())
    } else {
        Err(LifecycleError::NotPending {
            fee_id: record.id,
            status: record.status,
        })
    }
}

fn plan_oracle(record: &FeeRecord, report: &OracleReport) -> Option<Transition> {
    match record.status {
        FeeStatus::Submitted => {
            if record.tx_reference.as_ref() != Some(&report.tx_reference) {
                return None;
            }
            match report.on_chain {
                OnChainResult::Success => Some(Transition::paid(record.id, report.confirmations)),
                OnChainResult::Fail => Some(Transition::failed(
                    record.id,
                    FeeStatus::Submitted,
                    REASON_FAILED_ON_CHAIN,
                )),
                OnChainResult::Unknown if report.lost => Some(Transition::failed(
                    record.id,
                    FeeStatus::Submitted,
                    REASON_LOST,
                )),
                OnChainResult::Unknown => None,
            }
        },
        FeeStatus::Pending => is_adoptable(record, report)
            .then(|| Transition::submitted(record.id, report.tx_reference.clone())),
        FeeStatus::Paid | FeeStatus::Failed => None,
    }
}

/// Returns `true` if `report` describes a transfer this pending record
/// broadcast but never recorded (crash between broadcast and status write).
///
/// The transfer must be live and must have been broadcast no earlier than
/// the record's creation, so a previous, failed record's transaction for the
/// same scope is never attributed to a new record. A report without a
/// broadcast time cannot be placed and is not adopted.
#[must_use]
pub fn is_adoptable(record: &FeeRecord, report: &OracleReport) -> bool {
    record.status == FeeStatus::Pending
        && report.is_live()
        && report
            .broadcast_at
            .is_some_and(|broadcast_at| broadcast_at >= record.created_at)
}
