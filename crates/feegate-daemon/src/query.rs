//! Read and request surface for listing fees.
//!
//! Callers look fees up by id or scope, create them lazily for a policy, and
//! request execution. Execution requests are queued; the caller never waits
//! for a broadcast.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feegate_core::collaborators::{ExecutionQueue, ExecutionRequest, PolicyDirectory};
use feegate_core::{
    FeeError, FeeId, FeeRecord, FeeStatus, FeeStore, FeeTerms, ScopeId, TxReference,
};
use serde::Serialize;
use tracing::info;

use crate::driver::bounded;
use crate::store::blocking;

/// Where and how much to pay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentInstructions {
    /// Treasury address.
    pub destination: String,
    /// Base-unit amount as a decimal string.
    pub amount: String,
    /// Token contract.
    pub asset: String,
}

/// Caller-facing view of a fee record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeView {
    /// Record id.
    pub fee_id: FeeId,
    /// Owning policy.
    pub scope_id: ScopeId,
    /// Vault paying the fee.
    pub payer: String,
    /// Listing the fee gates.
    pub target: String,
    /// Current lifecycle status.
    pub status: FeeStatus,
    /// What to pay, and where.
    pub payment: PaymentInstructions,
    /// Broadcast transaction, once `submitted`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_reference: Option<TxReference>,
    /// Confirmation depth recorded when `paid`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation_count: Option<u32>,
    /// Why the fee `failed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// When the transfer was recorded as broadcast.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the oracle confirmed payment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

impl From<FeeRecord> for FeeView {
    fn from(record: FeeRecord) -> Self {
        Self {
            fee_id: record.id,
            scope_id: record.scope.scope_id,
            payer: record.scope.payer,
            target: record.scope.target,
            status: record.status,
            payment: PaymentInstructions {
                destination: record.terms.destination,
                amount: record.terms.amount.to_string(),
                asset: record.terms.asset,
            },
            tx_reference: record.tx_reference,
            confirmation_count: record.confirmation_count,
            failure_reason: record.failure_reason,
            submitted_at: record.submitted_at,
            paid_at: record.paid_at,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// Lookups, lazy creation and execution requests.
pub struct QueryService {
    store: Arc<dyn FeeStore>,
    policies: Arc<dyn PolicyDirectory>,
    queue: Arc<dyn ExecutionQueue>,
    terms: FeeTerms,
    call_timeout: Duration,
}

impl QueryService {
    /// Creates a query service that stamps `terms` on lazily created records.
    #[must_use]
    pub fn new(
        store: Arc<dyn FeeStore>,
        policies: Arc<dyn PolicyDirectory>,
        queue: Arc<dyn ExecutionQueue>,
        terms: FeeTerms,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            policies,
            queue,
            terms,
            call_timeout,
        }
    }

    /// Returns the record with this id.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub async fn get_by_id(&self, fee_id: FeeId) -> Result<FeeRecord, FeeError> {
        blocking(&self.store, move |s| s.get(fee_id))
            .await?
            .ok_or_else(|| FeeError::not_found("listing fee", fee_id))
    }

    /// Returns the latest record for (payer, target).
    ///
    /// # Errors
    ///
    /// `NotFound` if the scope never had a record.
    pub async fn get_by_scope(&self, payer: &str, target: &str) -> Result<FeeRecord, FeeError> {
        let (lookup_payer, lookup_target) = (payer.to_string(), target.to_string());
        blocking(&self.store, move |s| {
            s.latest_for_scope(&lookup_payer, &lookup_target)
        })
        .await?
        .ok_or_else(|| FeeError::not_found("listing fee", format!("{payer}:{target}")))
    }

    /// Returns the open record for the policy, creating one if the policy
    /// has none or its last record failed.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown policy
    /// - `Permanent` if the policy cannot be charged (no target)
    pub async fn get_or_create_for_scope(&self, scope_id: ScopeId) -> Result<FeeRecord, FeeError> {
        let latest = blocking(&self.store, move |s| s.latest_for_scope_id(scope_id)).await?;
        if let Some(record) = latest.filter(|r| r.status.is_open()) {
            return Ok(record);
        }

        let scope = bounded(
            self.call_timeout,
            "resolve_scope",
            self.policies.resolve_scope(scope_id),
        )
        .await?;
        let terms = self.terms.clone();
        let target = scope.clone();
        let record = blocking(&self.store, move |s| {
            s.create_if_absent(&target, &terms, Utc::now())
        })
        .await?;

        info!(
            fee_id = %record.id,
            scope_id = %scope_id,
            scope = %scope,
            status = %record.status,
            "listing fee resolved for scope"
        );
        Ok(record)
    }

    /// Queues an execution of a `pending` fee and returns without waiting.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown id
    /// - `Conflict` if the fee is not `pending` or is being executed
    /// - `Transient` if the queue is full or closed
    pub async fn request_execution(&self, fee_id: FeeId) -> Result<ExecutionRequest, FeeError> {
        let record = self.get_by_id(fee_id).await?;
        if record.status != FeeStatus::Pending {
            return Err(FeeError::Conflict {
                fee_id,
                status: record.status,
                reason: "listing fee is not in pending state".to_string(),
            });
        }
        if record.has_live_lease(Utc::now()) {
            return Err(FeeError::Conflict {
                fee_id,
                status: record.status,
                reason: "execution already in progress".to_string(),
            });
        }

        let request = ExecutionRequest {
            fee_id,
            requested_at: Utc::now(),
        };
        bounded(self.call_timeout, "enqueue", self.queue.enqueue(request.clone())).await?;
        info!(fee_id = %fee_id, "listing fee execution requested");
        Ok(request)
    }

    /// [`Self::get_by_id`] as a [`FeeView`].
    ///
    /// # Errors
    ///
    /// As [`Self::get_by_id`].
    pub async fn view(&self, fee_id: FeeId) -> Result<FeeView, FeeError> {
        self.get_by_id(fee_id).await.map(FeeView::from)
    }
}
