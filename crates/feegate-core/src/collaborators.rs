//! Contracts for the external services the fee drivers call.
//!
//! Each trait is the seam between the lifecycle and a system this crate does
//! not own: the scoped-policy service, the vault signer, the transaction
//! indexer and the task queue. Errors carry just enough classification for
//! [`FeeError`] to decide between retry and failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fee::{FeeAmount, FeeError, FeeId, OracleReport, Scope, ScopeId, TxReference};

// =============================================================================
// PolicyDirectory
// =============================================================================

/// Errors from the policy directory.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// No policy with this id.
    #[error("scoped policy not found: {scope_id}")]
    NotFound {
        /// The policy id.
        scope_id: ScopeId,
    },

    /// The policy exists but cannot be charged (no target, no payer).
    #[error("scoped policy {scope_id} is invalid: {reason}")]
    Invalid {
        /// The policy id.
        scope_id: ScopeId,
        /// What is missing.
        reason: String,
    },

    /// The directory could not be reached.
    #[error("policy directory unavailable: {0}")]
    Unavailable(String),
}

impl From<PolicyError> for FeeError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::NotFound { scope_id } => Self::not_found("scoped policy", scope_id),
            PolicyError::Invalid { .. } => Self::Permanent(err.to_string()),
            PolicyError::Unavailable(_) => Self::Transient(err.to_string()),
        }
    }
}

/// Read access to scoped policies plus the deactivation flag.
#[async_trait]
pub trait PolicyDirectory: Send + Sync {
    /// Resolves a policy id to its scope.
    async fn resolve_scope(&self, scope_id: ScopeId) -> Result<Scope, PolicyError>;

    /// Active policies with a payer and a target. Discovery creates fees for
    /// them; deactivation retires the ones whose scope has settled.
    async fn list_eligible_scopes(&self) -> Result<Vec<Scope>, PolicyError>;

    /// Deactivates the policy if it is still active.
    ///
    /// Returns `true` if this call changed the flag.
    async fn deactivate(&self, scope_id: ScopeId, reason: &str) -> Result<bool, PolicyError>;
}

// =============================================================================
// SettlementClient
// =============================================================================

/// Which settlement step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementErrorKind {
    /// Deriving the payer's address.
    AddressResolution,
    /// Building the unsigned transfer.
    Build,
    /// Signing or broadcasting.
    Broadcast,
}

/// Error from the settlement collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind:?} failed: {message}")]
pub struct SettlementError {
    /// Failed step.
    pub kind: SettlementErrorKind,
    /// `true` if the same call may succeed later.
    pub retryable: bool,
    /// Collaborator-provided detail.
    pub message: String,
}

impl SettlementError {
    /// A retryable failure.
    #[must_use]
    pub fn transient(kind: SettlementErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: true,
            message: message.into(),
        }
    }

    /// A failure that will not go away on retry.
    #[must_use]
    pub fn permanent(kind: SettlementErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: false,
            message: message.into(),
        }
    }

    /// A retryable broadcast failure may have left a transfer in flight.
    #[must_use]
    pub const fn is_ambiguous(&self) -> bool {
        self.retryable && matches!(self.kind, SettlementErrorKind::Broadcast)
    }
}

impl From<SettlementError> for FeeError {
    fn from(err: SettlementError) -> Self {
        if err.retryable {
            Self::Transient(err.to_string())
        } else {
            Self::Permanent(err.to_string())
        }
    }
}

/// An unsigned token transfer ready to be signed by the payer's vault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedTransfer {
    /// Payer settlement address.
    pub from: String,
    /// Treasury address.
    pub to: String,
    /// Token contract.
    pub asset: String,
    /// Base-unit amount.
    pub amount: FeeAmount,
    /// Collaborator-specific encoding of the transaction.
    pub encoded: String,
}

/// Vault-backed transfer construction and broadcast.
#[async_trait]
pub trait SettlementClient: Send + Sync {
    /// Returns the settlement address of the scope's payer.
    async fn resolve_address(&self, scope: &Scope) -> Result<String, SettlementError>;

    /// Builds an unsigned transfer.
    async fn build_transfer(
        &self,
        from: &str,
        to: &str,
        asset: &str,
        amount: FeeAmount,
    ) -> Result<UnsignedTransfer, SettlementError>;

    /// Signs with the payer's key and broadcasts. Returns the transaction
    /// reference.
    async fn sign_and_broadcast(
        &self,
        scope: &Scope,
        transfer: &UnsignedTransfer,
    ) -> Result<TxReference, SettlementError>;
}

// =============================================================================
// TransactionOracle
// =============================================================================

/// Error from the transaction oracle. Always retryable.
#[derive(Debug, Error)]
#[error("transaction oracle unavailable: {0}")]
pub struct OracleError(pub String);

impl From<OracleError> for FeeError {
    fn from(err: OracleError) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Scope-keyed view of the latest broadcast transaction and its outcome.
#[async_trait]
pub trait TransactionOracle: Send + Sync {
    /// Latest transaction the indexer has seen for `scope`, if any.
    async fn latest_status(&self, scope: &Scope) -> Result<Option<OracleReport>, OracleError>;
}

// =============================================================================
// ExecutionQueue
// =============================================================================

/// A request to run the executor for one fee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Fee to execute.
    pub fee_id: FeeId,
    /// When the request was accepted.
    pub requested_at: DateTime<Utc>,
}

/// Errors from enqueueing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum QueueError {
    /// Backpressure; the caller may retry.
    #[error("execution queue is full")]
    Full,
    /// The consumer is gone.
    #[error("execution queue is closed")]
    Closed,
}

impl From<QueueError> for FeeError {
    fn from(err: QueueError) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Transport that delivers execution requests to an executor.
///
/// Delivery is at-least-once; the executor tolerates duplicates.
#[async_trait]
pub trait ExecutionQueue: Send + Sync {
    /// Accepts a request without waiting for it to run.
    async fn enqueue(&self, request: ExecutionRequest) -> Result<(), QueueError>;
}
