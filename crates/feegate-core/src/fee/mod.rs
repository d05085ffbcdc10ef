//! Listing-fee data model and lifecycle management.
//!
//! A fee record represents one obligation for a (payer, target) scope. It is
//! created once in `pending`, moved forward by the executor and the
//! reconciler, and never deleted.
//!
//! # Architecture
//!
//! ```text
//! create_if_absent --> FeeRecord (PENDING)
//!                         |
//!      BroadcastSucceeded |  ExecutionFailed
//!                         v        \
//!                 FeeRecord (SUBMITTED) --> FeeRecord (FAILED)
//!                         |
//!         OracleObserved  |
//!                         v
//!                 FeeRecord (PAID) / FeeRecord (FAILED)
//! ```
//!
//! [`lifecycle::plan`] is the only place that decides which transition a
//! signal produces. Stores apply the result as a single conditional write.

mod error;
pub mod lifecycle;
mod state;

#[cfg(test)]
mod tests;

pub use error::{FeeError, LifecycleError, ParseError};
pub use lifecycle::{FeeSignal, Transition, TransitionFields, plan};
pub use state::{
    FeeAmount, FeeId, FeeRecord, FeeStatus, FeeTerms, OnChainResult, OracleReport, Scope,
    ScopeId, TxReference,
};
