//! Retires scoped policies once their (payer, target) fee is `paid`.
//!
//! The pass walks active policies, not paid records: every active policy
//! whose scope already settled is deactivated, including a resubmitted
//! policy that shares the scope with the one that paid. Deactivated policies
//! drop out of the next pass.

use std::sync::Arc;
use std::time::Duration;

use feegate_core::collaborators::PolicyDirectory;
use feegate_core::{FeeError, FeeRecord, FeeStatus, FeeStore, Scope, StoreError};
use tracing::{info, warn};

use crate::driver::{PassReport, bounded};
use crate::store::blocking;

/// Deactivation reason written when none is configured.
pub const DEFAULT_REASON: &str = "completed";

/// Deactivates scoped policies whose listing fee settled.
pub struct Deactivator {
    store: Arc<dyn FeeStore>,
    policies: Arc<dyn PolicyDirectory>,
    reason: String,
    call_timeout: Duration,
}

impl Deactivator {
    /// Creates a deactivator writing `reason`.
    #[must_use]
    pub fn new(
        store: Arc<dyn FeeStore>,
        policies: Arc<dyn PolicyDirectory>,
        reason: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            policies,
            reason: reason.into(),
            call_timeout,
        }
    }

    /// Deactivates every active policy whose scope has a `paid` fee.
    ///
    /// Only settled active policies are examined; one that another process
    /// deactivated first counts as skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the active policies or their fees cannot be
    /// listed.
    pub async fn run_pass(&self) -> Result<PassReport, FeeError> {
        let active = bounded(
            self.call_timeout,
            "list_eligible_scopes",
            self.policies.list_eligible_scopes(),
        )
        .await?;
        let settled = blocking(&self.store, move |s| settled_scopes(s, active)).await?;
        let mut report = PassReport::default();

        for (scope, paid) in settled {
            match bounded(
                self.call_timeout,
                "deactivate",
                self.policies.deactivate(scope.scope_id, &self.reason),
            )
            .await
            {
                Ok(true) => {
                    info!(
                        fee_id = %paid.id,
                        scope_id = %scope.scope_id,
                        paid_by = %paid.scope.scope_id,
                        reason = %self.reason,
                        "scoped policy deactivated"
                    );
                    report.advance();
                },
                Ok(false) => report.skip(),
                Err(FeeError::NotFound { .. }) => {
                    warn!(
                        fee_id = %paid.id,
                        scope_id = %scope.scope_id,
                        "settled policy disappeared before deactivation"
                    );
                    report.skip();
                },
                Err(err) => {
                    warn!(
                        fee_id = %paid.id,
                        scope_id = %scope.scope_id,
                        error = %err,
                        "failed to deactivate scoped policy"
                    );
                    report.error();
                },
            }
        }

        Ok(report)
    }
}

/// Pairs each active policy with the `paid` fee of its (payer, target), if
/// any. At most one open record exists per pair, so a paid record is always
/// the latest one.
fn settled_scopes(
    store: &dyn FeeStore,
    active: Vec<Scope>,
) -> Result<Vec<(Scope, FeeRecord)>, StoreError> {
    let mut settled = Vec::new();
    for scope in active {
        if let Some(record) = store.latest_for_scope(&scope.payer, &scope.target)? {
            if record.status == FeeStatus::Paid {
                settled.push((scope, record));
            }
        }
    }
    Ok(settled)
}
