//! Listing-fee reconciler.
//!
//! Three independent passes, each idempotent and safe to overlap with any
//! other driver:
//!
//! - discovery: creates `pending` records for eligible scopes that have none
//! - settlement: moves `submitted` records to `paid` or `failed` from oracle
//!   reports; a transfer the oracle never indexes is lost after
//!   `mark_lost_after`
//! - pending repair: adopts transfers that were broadcast for a `pending`
//!   record whose own status write never landed
//!
//! One record's failure never blocks the others; it is counted and retried on
//! the next cycle.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feegate_core::collaborators::{PolicyDirectory, TransactionOracle};
use feegate_core::fee::{FeeSignal, plan};
use feegate_core::{FeeError, FeeRecord, FeeStatus, FeeStore, FeeTerms, OracleReport, StoreError};
use tracing::{info, warn};

use crate::deactivator::Deactivator;
use crate::driver::{PassReport, bounded, has_elapsed, log_pass_error};
use crate::oracle::DEFAULT_MARK_LOST_AFTER;
use crate::store::blocking;

/// What a reconciler cycle runs.
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerSettings {
    /// Bound on each collaborator call.
    pub call_timeout: Duration,
    /// Run the discovery pass.
    pub discovery: bool,
    /// Run the pending repair pass.
    pub repair_pending: bool,
    /// Age after which a submitted transfer the oracle never reported is lost.
    pub mark_lost_after: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            discovery: true,
            repair_pending: true,
            mark_lost_after: DEFAULT_MARK_LOST_AFTER,
        }
    }
}

/// Reports from one [`Reconciler::run_cycle`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Discovery pass, if it ran and listed scopes.
    pub discovery: Option<PassReport>,
    /// Settlement pass, if it listed records.
    pub settlement: Option<PassReport>,
    /// Repair pass, if it ran and listed records.
    pub repair: Option<PassReport>,
    /// Deactivation pass, if configured and it listed records.
    pub deactivation: Option<PassReport>,
}

/// Creates and settles fee records.
pub struct Reconciler {
    store: Arc<dyn FeeStore>,
    policies: Arc<dyn PolicyDirectory>,
    oracle: Arc<dyn TransactionOracle>,
    terms: FeeTerms,
    settings: ReconcilerSettings,
    deactivator: Option<Deactivator>,
}

impl Reconciler {
    /// Creates a reconciler that stamps `terms` on discovered records.
    #[must_use]
    pub fn new(
        store: Arc<dyn FeeStore>,
        policies: Arc<dyn PolicyDirectory>,
        oracle: Arc<dyn TransactionOracle>,
        terms: FeeTerms,
        settings: ReconcilerSettings,
    ) -> Self {
        Self {
            store,
            policies,
            oracle,
            terms,
            settings,
            deactivator: None,
        }
    }

    /// Runs `deactivator` after each settlement pass.
    #[must_use]
    pub fn with_deactivator(mut self, deactivator: Deactivator) -> Self {
        self.deactivator = Some(deactivator);
        self
    }

    /// Runs every configured pass once, in order: discovery, settlement,
    /// repair, deactivation.
    pub async fn run_cycle(&self) -> CycleReport {
        let mut cycle = CycleReport::default();

        if self.settings.discovery {
            cycle.discovery = finish("discovery", self.discovery_pass().await);
        }
        cycle.settlement = finish("settlement", self.settlement_pass().await);
        if self.settings.repair_pending {
            cycle.repair = finish("repair", self.repair_pass().await);
        }
        if let Some(deactivator) = &self.deactivator {
            cycle.deactivation = finish("deactivation", deactivator.run_pass().await);
        }

        cycle
    }

    /// Creates a `pending` record for every eligible scope without one.
    ///
    /// # Errors
    ///
    /// Returns an error only if the eligible scopes cannot be listed.
    pub async fn discovery_pass(&self) -> Result<PassReport, FeeError> {
        let scopes = bounded(
            self.settings.call_timeout,
            "list_eligible_scopes",
            self.policies.list_eligible_scopes(),
        )
        .await?;
        let mut report = PassReport::default();

        for scope in scopes {
            let lookup = scope.clone();
            let existing = blocking(&self.store, move |s| {
                s.latest_for_scope(&lookup.payer, &lookup.target)
            })
            .await;
            match existing {
                Ok(Some(_)) => report.skip(),
                Ok(None) => {
                    let terms = self.terms.clone();
                    let target = scope.clone();
                    match blocking(&self.store, move |s| {
                        s.create_if_absent(&target, &terms, Utc::now())
                    })
                    .await
                    {
                        Ok(record) => {
                            info!(
                                fee_id = %record.id,
                                scope_id = %scope.scope_id,
                                scope = %scope,
                                "listing fee created"
                            );
                            report.advance();
                        },
                        Err(err) => {
                            warn!(scope = %scope, error = %err, "failed to create listing fee");
                            report.error();
                        },
                    }
                },
                Err(err) => {
                    warn!(scope = %scope, error = %err, "failed to look up listing fee");
                    report.error();
                },
            }
        }

        Ok(report)
    }

    /// Applies the oracle's verdict to every `submitted` record.
    ///
    /// # Errors
    ///
    /// Returns an error only if the submitted records cannot be listed.
    pub async fn settlement_pass(&self) -> Result<PassReport, FeeError> {
        let submitted =
            blocking(&self.store, |s| s.list_by_status(FeeStatus::Submitted)).await?;
        let mut report = PassReport::default();

        for record in submitted {
            match self.settle(&record).await {
                Ok(true) => report.advance(),
                Ok(false) => report.skip(),
                Err(err) => {
                    warn!(fee_id = %record.id, error = %err, "failed to settle listing fee");
                    report.error();
                },
            }
        }

        Ok(report)
    }

    /// Adopts stray broadcasts for `pending` records without a live lease.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pending records cannot be listed.
    pub async fn repair_pass(&self) -> Result<PassReport, FeeError> {
        let pending = blocking(&self.store, |s| s.list_by_status(FeeStatus::Pending)).await?;
        let now = Utc::now();
        let mut report = PassReport::default();

        for record in pending {
            if record.has_live_lease(now) {
                report.skip();
                continue;
            }
            match self.settle(&record).await {
                Ok(true) => report.advance(),
                Ok(false) => report.skip(),
                Err(err) => {
                    warn!(fee_id = %record.id, error = %err, "failed to repair listing fee");
                    report.error();
                },
            }
        }

        Ok(report)
    }

    /// A `submitted` record whose own transaction is missing from the
    /// oracle's latest report `mark_lost_after` past submission.
    fn unindexed_too_long(
        &self,
        record: &FeeRecord,
        report: Option<&OracleReport>,
        now: DateTime<Utc>,
    ) -> bool {
        if record.status != FeeStatus::Submitted {
            return false;
        }
        if report.is_some_and(|r| record.tx_reference.as_ref() == Some(&r.tx_reference)) {
            return false;
        }
        let since = record.submitted_at.unwrap_or(record.updated_at);
        has_elapsed(since, now, self.settings.mark_lost_after)
    }

    /// Feeds the latest oracle report for the record's scope through the
    /// lifecycle and applies the result. Returns `true` if the record moved.
    async fn settle(&self, record: &FeeRecord) -> Result<bool, FeeError> {
        let report = bounded(
            self.settings.call_timeout,
            "latest_status",
            self.oracle.latest_status(&record.scope),
        )
        .await?;
        let signal = if self.unindexed_too_long(record, report.as_ref(), Utc::now()) {
            warn!(
                fee_id = %record.id,
                tx_reference = ?record.tx_reference,
                "oracle never reported the submitted transaction"
            );
            FeeSignal::TransactionUnindexed
        } else if let Some(report) = report {
            FeeSignal::OracleObserved(report)
        } else {
            return Ok(false);
        };
        let Some(transition) = plan(record, &signal)? else {
            return Ok(false);
        };

        let to = transition.to;
        let tx_reference = transition
            .fields
            .tx_reference
            .clone()
            .or_else(|| record.tx_reference.clone());
        let reason = transition.fields.failure_reason.clone();

        match blocking(&self.store, move |s| s.transition(&transition, Utc::now())).await {
            Ok(true) => {
                match to {
                    FeeStatus::Paid => info!(
                        fee_id = %record.id,
                        tx_reference = ?tx_reference,
                        "listing fee paid"
                    ),
                    FeeStatus::Failed => warn!(
                        fee_id = %record.id,
                        tx_reference = ?tx_reference,
                        reason = ?reason,
                        "listing fee transaction failed"
                    ),
                    _ => info!(
                        fee_id = %record.id,
                        tx_reference = ?tx_reference,
                        status = %to,
                        "listing fee advanced"
                    ),
                }
                Ok(true)
            },
            Ok(false) => Ok(false),
            Err(StoreError::DuplicateTxReference { tx_reference }) => {
                warn!(
                    fee_id = %record.id,
                    tx_reference = %tx_reference,
                    "oracle transaction belongs to another listing fee"
                );
                Ok(false)
            },
            Err(err) => Err(err.into()),
        }
    }
}

fn finish(pass: &'static str, result: Result<PassReport, FeeError>) -> Option<PassReport> {
    match result {
        Ok(report) => {
            report.log(pass);
            Some(report)
        },
        Err(err) => {
            log_pass_error(pass, &err);
            None
        },
    }
}
