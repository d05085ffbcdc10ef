//! Listing-fee executor.
//!
//! Drives `pending -> submitted` by broadcasting exactly one transfer per
//! record. Exclusivity comes from two conditional writes: the execution lease
//! (claimed before any collaborator call) and the `pending` precondition on
//! the final transition.
//!
//! # Failure handling
//!
//! | Error | Record | Lease |
//! |---|---|---|
//! | permanent (bad scope, build/broadcast rejected) | `failed` | cleared |
//! | transient before broadcast | `pending` | released |
//! | timeout or retryable error during broadcast | `pending` | held until expiry |
//!
//! Holding the lease after an ambiguous broadcast keeps other executors away
//! long enough for the oracle to index a transfer that may be in flight; the
//! next attempt then adopts it instead of paying twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use feegate_core::collaborators::{SettlementClient, TransactionOracle};
use feegate_core::fee::{FeeSignal, Transition, plan};
use feegate_core::{FeeError, FeeId, FeeRecord, FeeStatus, FeeStore, StoreError, TxReference};
use tracing::{error, info, warn};

use crate::driver::{PassReport, bounded, chrono_duration};
use crate::store::blocking;

/// Result of a successful execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// This invocation broadcast the transfer.
    Submitted {
        /// Broadcast reference.
        tx_reference: TxReference,
    },
    /// A transfer already broadcast for this record was attributed to it.
    Adopted {
        /// Adopted reference.
        tx_reference: TxReference,
    },
    /// A non-retryable error moved the record to `failed`.
    Failed {
        /// Stored failure reason.
        reason: String,
    },
}

/// Timing knobs for [`Executor`].
#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    /// Bound on each collaborator call.
    pub call_timeout: Duration,
    /// Lifetime of the execution lease.
    pub lease: Duration,
    /// Bound on one whole execution.
    pub execution_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            lease: Duration::from_secs(600),
            execution_timeout: Duration::from_secs(300),
        }
    }
}

/// Error raised after the lease was claimed.
struct ClaimedFailure {
    error: FeeError,
    /// The broadcast may have gone out; leave the lease to expire.
    keep_lease: bool,
}

impl ClaimedFailure {
    fn release(error: impl Into<FeeError>) -> Self {
        Self {
            error: error.into(),
            keep_lease: false,
        }
    }
}

/// Broadcasts listing-fee transfers.
pub struct Executor {
    store: Arc<dyn FeeStore>,
    settlement: Arc<dyn SettlementClient>,
    oracle: Arc<dyn TransactionOracle>,
    settings: ExecutorSettings,
}

impl Executor {
    /// Creates an executor.
    #[must_use]
    pub fn new(
        store: Arc<dyn FeeStore>,
        settlement: Arc<dyn SettlementClient>,
        oracle: Arc<dyn TransactionOracle>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            settlement,
            oracle,
            settings,
        }
    }

    /// Returns the executor's timing knobs.
    #[must_use]
    pub const fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    /// Executes the fee once.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown fee
    /// - `Conflict` if the fee is not `pending` or another execution holds
    ///   the lease
    /// - `Transient` if the run should be retried later; the record is still
    ///   `pending`
    pub async fn execute(&self, fee_id: FeeId) -> Result<ExecutionOutcome, FeeError> {
        let record = blocking(&self.store, move |s| s.get(fee_id))
            .await?
            .ok_or_else(|| FeeError::not_found("listing fee", fee_id))?;
        plan(&record, &FeeSignal::ExecutionRequested)?;

        let now = Utc::now();
        let until = now
            .checked_add_signed(chrono_duration(self.settings.lease)?)
            .ok_or_else(|| FeeError::Permanent("execution lease out of range".to_string()))?;
        let claimed = blocking(&self.store, move |s| {
            s.try_claim_execution(fee_id, now, until)
        })
        .await?;
        if !claimed {
            return Err(self.claim_conflict(fee_id).await);
        }

        info!(
            fee_id = %fee_id,
            scope_id = %record.scope.scope_id,
            scope = %record.scope,
            "executing listing fee payment"
        );

        match self.run_claimed(&record).await {
            Ok(outcome) => Ok(outcome),
            Err(ClaimedFailure { error, keep_lease }) => match error {
                FeeError::Permanent(reason) => self.fail(&record, reason).await,
                other => {
                    if keep_lease {
                        warn!(
                            fee_id = %fee_id,
                            lease_until = %until,
                            error = %other,
                            "broadcast outcome unknown, holding execution lease"
                        );
                    } else {
                        self.release(fee_id).await;
                    }
                    Err(other)
                },
            },
        }
    }

    /// Executes every `pending` record without a live lease.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pending records cannot be listed.
    pub async fn run_pending_pass(&self) -> Result<PassReport, FeeError> {
        let pending = blocking(&self.store, |s| s.list_by_status(FeeStatus::Pending)).await?;
        let now = Utc::now();
        let mut report = PassReport::default();

        for record in pending {
            if record.has_live_lease(now) {
                report.skip();
                continue;
            }
            match tokio::time::timeout(self.settings.execution_timeout, self.execute(record.id))
                .await
            {
                Ok(Ok(_)) => report.advance(),
                Ok(Err(err)) if err.is_conflict() => report.skip(),
                Ok(Err(err)) => {
                    warn!(fee_id = %record.id, error = %err, "pending execution failed");
                    report.error();
                },
                Err(_) => {
                    warn!(fee_id = %record.id, "pending execution timed out");
                    report.error();
                },
            }
        }

        report.log("executor");
        Ok(report)
    }

    async fn run_claimed(&self, record: &FeeRecord) -> Result<ExecutionOutcome, ClaimedFailure> {
        if let Some(tx_reference) = self.try_adopt(record).await? {
            return Ok(ExecutionOutcome::Adopted { tx_reference });
        }

        let scope = &record.scope;
        let terms = &record.terms;

        let from = bounded(
            self.settings.call_timeout,
            "resolve_address",
            self.settlement.resolve_address(scope),
        )
        .await
        .map_err(ClaimedFailure::release)?;

        let transfer = bounded(
            self.settings.call_timeout,
            "build_transfer",
            self.settlement
                .build_transfer(&from, &terms.destination, &terms.asset, terms.amount),
        )
        .await
        .map_err(ClaimedFailure::release)?;

        let tx_reference = match tokio::time::timeout(
            self.settings.call_timeout,
            self.settlement.sign_and_broadcast(scope, &transfer),
        )
        .await
        {
            Ok(Ok(tx_reference)) => tx_reference,
            Ok(Err(err)) => {
                let keep_lease = err.is_ambiguous();
                return Err(ClaimedFailure {
                    error: err.into(),
                    keep_lease,
                });
            },
            Err(_) => {
                return Err(ClaimedFailure {
                    error: FeeError::Transient("sign_and_broadcast timed out".to_string()),
                    keep_lease: true,
                });
            },
        };

        info!(
            fee_id = %record.id,
            tx_reference = %tx_reference,
            amount = %terms.amount,
            destination = %terms.destination,
            "listing fee transfer broadcast"
        );

        self.record_submitted(record, tx_reference.clone())
            .await
            .map_err(|error| ClaimedFailure {
                error,
                keep_lease: true,
            })?;
        Ok(ExecutionOutcome::Submitted { tx_reference })
    }

    /// Attributes an already-broadcast transfer to `record`, if the oracle
    /// knows one.
    async fn try_adopt(&self, record: &FeeRecord) -> Result<Option<TxReference>, ClaimedFailure> {
        let report = bounded(
            self.settings.call_timeout,
            "latest_status",
            self.oracle.latest_status(&record.scope),
        )
        .await
        .map_err(ClaimedFailure::release)?;
        let Some(report) = report else {
            return Ok(None);
        };

        let Some(transition) = plan(record, &FeeSignal::OracleObserved(report))
            .map_err(ClaimedFailure::release)?
        else {
            return Ok(None);
        };
        let Some(tx_reference) = transition.fields.tx_reference.clone() else {
            return Ok(None);
        };

        match self.apply(transition).await {
            Ok(true) => {
                info!(
                    fee_id = %record.id,
                    tx_reference = %tx_reference,
                    "adopted previously broadcast listing fee transfer"
                );
                Ok(Some(tx_reference))
            },
            Ok(false) => self
                .confirm_submitted(record.id, &tx_reference)
                .await
                .map(|()| Some(tx_reference))
                .map_err(ClaimedFailure::release),
            Err(StoreError::DuplicateTxReference { .. }) => {
                // Attributed to another record; ours still needs its own transfer.
                warn!(
                    fee_id = %record.id,
                    tx_reference = %tx_reference,
                    "oracle transaction belongs to another listing fee"
                );
                Ok(None)
            },
            Err(err) => Err(ClaimedFailure::release(err)),
        }
    }

    async fn record_submitted(
        &self,
        record: &FeeRecord,
        tx_reference: TxReference,
    ) -> Result<(), FeeError> {
        let transition = plan(
            record,
            &FeeSignal::BroadcastSucceeded {
                tx_reference: tx_reference.clone(),
            },
        )?
        .ok_or_else(|| FeeError::Permanent("broadcast produced no transition".to_string()))?;

        match self.apply(transition).await {
            Ok(true) => Ok(()),
            Ok(false) => self.confirm_submitted(record.id, &tx_reference).await,
            Err(err) => {
                error!(
                    fee_id = %record.id,
                    tx_reference = %tx_reference,
                    error = %err,
                    "failed to record broadcast listing fee transfer"
                );
                Err(err.into())
            },
        }
    }

    /// A lost race is fine if the winner recorded the same transaction.
    async fn confirm_submitted(
        &self,
        fee_id: FeeId,
        tx_reference: &TxReference,
    ) -> Result<(), FeeError> {
        let current = blocking(&self.store, move |s| s.get(fee_id))
            .await?
            .ok_or_else(|| FeeError::not_found("listing fee", fee_id))?;
        if current.status == FeeStatus::Submitted
            && current.tx_reference.as_ref() == Some(tx_reference)
        {
            return Ok(());
        }
        error!(
            fee_id = %fee_id,
            tx_reference = %tx_reference,
            status = %current.status,
            recorded = ?current.tx_reference,
            "listing fee moved while its transfer was in flight"
        );
        Err(FeeError::Conflict {
            fee_id,
            status: current.status,
            reason: "listing fee changed during execution".to_string(),
        })
    }

    async fn fail(
        &self,
        record: &FeeRecord,
        reason: String,
    ) -> Result<ExecutionOutcome, FeeError> {
        warn!(fee_id = %record.id, reason = %reason, "listing fee execution failed permanently");
        let transition = plan(
            record,
            &FeeSignal::ExecutionFailed {
                reason: reason.clone(),
            },
        )?
        .ok_or_else(|| FeeError::Permanent(reason.clone()))?;

        match self.apply(transition).await {
            Ok(true) => Ok(ExecutionOutcome::Failed { reason }),
            Ok(false) => Err(self.claim_conflict(record.id).await),
            Err(err) => {
                // Left pending with its lease; a later cycle retries.
                error!(fee_id = %record.id, error = %err, "failed to mark listing fee as failed");
                Err(err.into())
            },
        }
    }

    async fn apply(&self, transition: Transition) -> Result<bool, StoreError> {
        blocking(&self.store, move |s| s.transition(&transition, Utc::now())).await
    }

    async fn release(&self, fee_id: FeeId) {
        if let Err(err) = blocking(&self.store, move |s| s.release_execution_claim(fee_id)).await {
            warn!(fee_id = %fee_id, error = %err, "failed to release execution lease");
        }
    }

    async fn claim_conflict(&self, fee_id: FeeId) -> FeeError {
        let status = match blocking(&self.store, move |s| s.get(fee_id)).await {
            Ok(Some(record)) => record.status,
            Ok(None) => return FeeError::not_found("listing fee", fee_id),
            Err(err) => return err.into(),
        };
        FeeError::Conflict {
            fee_id,
            status,
            reason: if status == FeeStatus::Pending {
                "execution already in progress".to_string()
            } else {
                "listing fee is not in pending state".to_string()
            },
        }
    }
}
