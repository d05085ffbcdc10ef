//! Fee record types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::error::ParseError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generates a fresh random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wraps an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// Returns the underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| ParseError::InvalidId {
                        value: s.to_string(),
                    })
            }
        }
    };
}

uuid_id!(
    /// System-generated identity of a fee record.
    FeeId
);

uuid_id!(
    /// Identity of the scoped policy that owns a fee obligation.
    ScopeId
);

/// The (payer, target) pair that identifies one fee obligation, together with
/// the identity of the policy that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    /// Owning policy.
    pub scope_id: ScopeId,
    /// Payer identity (vault public key).
    pub payer: String,
    /// Target identity (the listing being published).
    pub target: String,
}

impl Scope {
    /// Creates a scope.
    #[must_use]
    pub fn new(scope_id: ScopeId, payer: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            scope_id,
            payer: payer.into(),
            target: target.into(),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.payer, self.target)
    }
}

/// Fee amount in the settlement asset's base unit.
///
/// Serialized as a decimal string so values above 2^53 survive JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeeAmount(u128);

impl FeeAmount {
    /// Wraps a base-unit amount.
    #[must_use]
    pub const fn new(base_units: u128) -> Self {
        Self(base_units)
    }

    /// Returns the amount in base units.
    #[must_use]
    pub const fn base_units(self) -> u128 {
        self.0
    }

    /// Returns `true` for a zero amount.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for FeeAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for FeeAmount {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // u128::from_str accepts a leading '+', which the persisted form never has.
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidAmount {
                value: s.to_string(),
            });
        }
        trimmed
            .parse::<u128>()
            .map(Self)
            .map_err(|_| ParseError::InvalidAmount {
                value: s.to_string(),
            })
    }
}

impl Serialize for FeeAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FeeAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// External transaction identifier (for EVM chains, the transaction hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxReference(String);

impl TxReference {
    /// Validates and wraps a reference.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::EmptyTxReference`] for blank input.
    pub fn new(value: impl Into<String>) -> Result<Self, ParseError> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(ParseError::EmptyTxReference);
        }
        Ok(Self(trimmed.to_string()))
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TxReference {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TxReference> for String {
    fn from(value: TxReference) -> Self {
        value.0
    }
}

/// Settlement parameters fixed on a record at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTerms {
    /// Settlement asset (token contract address).
    pub asset: String,
    /// Amount in the asset's base unit.
    pub amount: FeeAmount,
    /// Treasury address receiving the fee.
    pub destination: String,
}

/// Lifecycle status of a fee record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeeStatus {
    /// Created, nothing broadcast yet.
    Pending,
    /// Transfer broadcast, awaiting on-chain outcome.
    Submitted,
    /// Transfer confirmed on-chain.
    Paid,
    /// Terminal failure; a new record may be created for the scope.
    Failed,
}

impl FeeStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [Self; 4] = [Self::Pending, Self::Submitted, Self::Paid, Self::Failed];

    /// Persisted literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Paid => "paid",
            Self::Failed => "failed",
        }
    }

    /// `paid` and `failed` have no outgoing transitions.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Paid | Self::Failed)
    }

    /// Open records block creation of another record for the same scope.
    #[must_use]
    pub const fn is_open(self) -> bool {
        !matches!(self, Self::Failed)
    }

    /// Returns `true` if `self -> to` is in the transition table.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Submitted | Self::Failed)
                | (Self::Submitted, Self::Paid | Self::Failed)
        )
    }
}

impl fmt::Display for FeeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeeStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "submitted" => Ok(Self::Submitted),
            "paid" => Ok(Self::Paid),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseError::InvalidStatus {
                value: s.to_string(),
            }),
        }
    }
}

/// One fee obligation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeRecord {
    /// Immutable identity.
    pub id: FeeId,
    /// Unit of uniqueness.
    pub scope: Scope,
    /// Settlement parameters, immutable after creation.
    pub terms: FeeTerms,
    /// Current status.
    pub status: FeeStatus,
    /// Broadcast transaction, set on `submitted`.
    pub tx_reference: Option<TxReference>,
    /// Advisory confirmation depth.
    pub confirmation_count: Option<u32>,
    /// Set on `failed`.
    pub failure_reason: Option<String>,
    /// Execution claim held by an executor, if any.
    pub execution_lease_until: Option<DateTime<Utc>>,
    /// When the record entered `submitted`.
    pub submitted_at: Option<DateTime<Utc>>,
    /// When the record entered `paid`.
    pub paid_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl FeeRecord {
    /// Builds a fresh `pending` record.
    #[must_use]
    pub fn new_pending(scope: Scope, terms: FeeTerms, now: DateTime<Utc>) -> Self {
        Self {
            id: FeeId::new(),
            scope,
            terms,
            status: FeeStatus::Pending,
            tx_reference: None,
            confirmation_count: None,
            failure_reason: None,
            execution_lease_until: None,
            submitted_at: None,
            paid_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns `true` if an executor holds an unexpired claim at `now`.
    #[must_use]
    pub fn has_live_lease(&self, now: DateTime<Utc>) -> bool {
        self.execution_lease_until.is_some_and(|until| until > now)
    }
}

/// On-chain outcome as reported by the oracle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnChainResult {
    /// Mined and succeeded.
    Success,
    /// Mined and reverted.
    Fail,
    /// Not yet known.
    Unknown,
}

impl OnChainResult {
    /// Persisted literal.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for OnChainResult {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "fail" => Ok(Self::Fail),
            "unknown" => Ok(Self::Unknown),
            _ => Err(ParseError::InvalidOnChainResult {
                value: s.to_string(),
            }),
        }
    }
}

/// Latest known transaction status for a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleReport {
    /// The transaction the report is about.
    pub tx_reference: TxReference,
    /// Mined outcome.
    pub on_chain: OnChainResult,
    /// The oracle gave up waiting for confirmation.
    pub lost: bool,
    /// When the transaction was broadcast, if the oracle knows.
    pub broadcast_at: Option<DateTime<Utc>>,
    /// Confirmation depth, if known.
    pub confirmations: Option<u32>,
}

impl OracleReport {
    /// Returns `true` if the report describes a transaction that may still
    /// settle or has settled successfully.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.lost && self.on_chain != OnChainResult::Fail
    }
}
