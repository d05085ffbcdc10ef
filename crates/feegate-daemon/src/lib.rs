#![allow(clippy::doc_markdown)]

//! feegate-daemon - listing-fee executor, reconciler and policy deactivator.
//!
//! The daemon owns the `SQLite` fee store and runs independent drivers over
//! it. Drivers share no memory; every coordination point is a conditional
//! write in the store, so several daemon processes may run side by side on
//! one database file.
//!
//! # Modules
//!
//! - [`db`]: connection handling and schema
//! - [`store`]: [`store::SqliteFeeStore`], the `FeeStore` implementation
//! - [`executor`]: broadcasts one transfer per `pending` record
//! - [`reconciler`]: discovery, settlement and pending-repair passes
//! - [`deactivator`]: retires policies whose fee is `paid`
//! - [`query`]: lookups, lazy creation and execution requests
//! - [`queue`]: in-process execution queue and its consumer
//! - [`policy`], [`oracle`], [`settlement`]: collaborator adapters
//! - [`driver`]: periodic scheduling, timeouts and pass reports
//! - [`daemon`]: wires everything from the configuration
//! - [`health`]: `GET /healthz`
//! - [`state`]: shutdown signal and daemon state

pub mod daemon;
pub mod db;
pub mod deactivator;
pub mod driver;
pub mod executor;
pub mod health;
pub mod oracle;
pub mod policy;
pub mod query;
pub mod queue;
pub mod reconciler;
pub mod settlement;
pub mod state;
pub mod store;
