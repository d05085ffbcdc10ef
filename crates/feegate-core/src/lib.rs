#![allow(clippy::doc_markdown)]

//! feegate-core - listing-fee domain model.
//!
//! This crate holds the pieces of the listing-fee service that do not touch
//! I/O: the fee record and its lifecycle state machine, the error taxonomy
//! shared by every driver, the storage contract, the collaborator contracts
//! (policy directory, settlement, oracle, execution queue) and the daemon
//! configuration.
//!
//! # Modules
//!
//! - [`fee`]: `FeeRecord`, `FeeStatus` and the lifecycle controller
//! - [`store`]: the [`store::FeeStore`] contract and `StoreError`
//! - [`collaborators`]: traits for the external services the drivers call
//! - [`config`]: TOML configuration for the daemon
//!
//! # Lifecycle
//!
//! ```text
//!            broadcast ok             oracle success
//! pending ----------------> submitted ---------------> paid
//!    |                          |
//!    | permanent error          | on-chain failure / lost
//!    v                          v
//! failed <----------------------+
//! ```

pub mod collaborators;
pub mod config;
pub mod fee;
pub mod store;

pub use fee::{
    FeeAmount, FeeError, FeeId, FeeRecord, FeeStatus, FeeTerms, LifecycleError, OnChainResult,
    OracleReport, ParseError, Scope, ScopeId, TxReference,
};
pub use store::{FeeStore, StoreError};
