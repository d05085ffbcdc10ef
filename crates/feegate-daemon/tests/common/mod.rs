//! Shared fixtures for daemon integration tests.
//!
//! Policies and the transaction index use the real `SQLite` adapters; only
//! the signer sidecar is scripted.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use feegate_core::collaborators::{
    PolicyDirectory, SettlementClient, SettlementError, SettlementErrorKind, TransactionOracle,
    UnsignedTransfer,
};
use feegate_core::{FeeAmount, FeeStore, FeeTerms, OnChainResult, Scope, ScopeId, TxReference};
use feegate_daemon::db::Database;
use feegate_daemon::executor::{Executor, ExecutorSettings};
use feegate_daemon::oracle::{IndexedTransfer, SqliteTxIndexOracle, record_transfer};
use feegate_daemon::policy::{SqlitePolicyDirectory, upsert_policy};
use feegate_daemon::store::SqliteFeeStore;

pub const PAYER: &str = "vault-1";
pub const TARGET: &str = "listing-1";

pub fn terms() -> FeeTerms {
    FeeTerms {
        asset: "USDC".to_string(),
        amount: FeeAmount::new(100),
        destination: "D".to_string(),
    }
}

/// What the scripted sidecar does on broadcast.
#[derive(Debug, Clone)]
pub enum BroadcastBehavior {
    /// Return this reference after `delay`.
    Succeed { tx: String, delay: Duration },
    /// Return this error.
    Fail(SettlementError),
    /// Never answer.
    Hang,
}

/// Scripted signer sidecar.
pub struct ScriptedSettlement {
    broadcast: Mutex<BroadcastBehavior>,
    build_error: Mutex<Option<SettlementError>>,
    broadcasts: AtomicUsize,
}

impl ScriptedSettlement {
    pub fn succeeding(tx: &str) -> Arc<Self> {
        Self::with(BroadcastBehavior::Succeed {
            tx: tx.to_string(),
            delay: Duration::ZERO,
        })
    }

    pub fn with(behavior: BroadcastBehavior) -> Arc<Self> {
        Arc::new(Self {
            broadcast: Mutex::new(behavior),
            build_error: Mutex::new(None),
            broadcasts: AtomicUsize::new(0),
        })
    }

    pub fn fail_builds(&self, err: SettlementError) {
        *self.build_error.lock().unwrap() = Some(err);
    }

    pub fn set_broadcast(&self, behavior: BroadcastBehavior) {
        *self.broadcast.lock().unwrap() = behavior;
    }

    /// Broadcast attempts, including ones that failed or hung.
    pub fn broadcasts(&self) -> usize {
        self.broadcasts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SettlementClient for ScriptedSettlement {
    async fn resolve_address(&self, scope: &Scope) -> Result<String, SettlementError> {
        Ok(format!("addr-{}", scope.payer))
    }

    async fn build_transfer(
        &self,
        from: &str,
        to: &str,
        asset: &str,
        amount: FeeAmount,
    ) -> Result<UnsignedTransfer, SettlementError> {
        if let Some(err) = self.build_error.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(UnsignedTransfer {
            from: from.to_string(),
            to: to.to_string(),
            asset: asset.to_string(),
            amount,
            encoded: format!("{from}>{to}:{asset}:{amount}"),
        })
    }

    async fn sign_and_broadcast(
        &self,
        _scope: &Scope,
        _transfer: &UnsignedTransfer,
    ) -> Result<TxReference, SettlementError> {
        self.broadcasts.fetch_add(1, Ordering::SeqCst);
        let behavior = self.broadcast.lock().unwrap().clone();
        match behavior {
            BroadcastBehavior::Succeed { tx, delay } => {
                tokio::time::sleep(delay).await;
                TxReference::new(tx).map_err(|e| {
                    SettlementError::permanent(SettlementErrorKind::Broadcast, e.to_string())
                })
            },
            BroadcastBehavior::Fail(err) => Err(err),
            BroadcastBehavior::Hang => std::future::pending().await,
        }
    }
}

/// One database with every adapter wired to it.
pub struct Harness {
    pub db: Database,
    pub store: Arc<dyn FeeStore>,
    pub policies: Arc<dyn PolicyDirectory>,
    pub oracle: Arc<dyn TransactionOracle>,
}

impl Harness {
    pub fn in_memory() -> Self {
        Self::from_db(Database::in_memory().unwrap())
    }

    pub fn from_db(db: Database) -> Self {
        Self {
            store: Arc::new(SqliteFeeStore::new(db.clone())),
            policies: Arc::new(SqlitePolicyDirectory::new(db.clone())),
            oracle: Arc::new(SqliteTxIndexOracle::new(
                db.clone(),
                Duration::from_secs(3600),
            )),
            db,
        }
    }

    /// Inserts an active policy for (`PAYER`, `TARGET`).
    pub fn add_policy(&self) -> Scope {
        let scope_id = ScopeId::new();
        upsert_policy(&self.db, scope_id, PAYER, Some(TARGET), true).unwrap();
        Scope::new(scope_id, PAYER, TARGET)
    }

    /// Writes what the indexer would record for a broadcast.
    pub fn index(&self, tx: &str, on_chain: OnChainResult, age: chrono::Duration) {
        record_transfer(
            &self.db,
            &IndexedTransfer {
                tx_reference: TxReference::new(tx).unwrap(),
                payer: PAYER.to_string(),
                target: TARGET.to_string(),
                on_chain,
                confirmations: (on_chain == OnChainResult::Success).then_some(3),
                broadcast_at: Utc::now() - age,
            },
        )
        .unwrap();
    }

    pub fn executor(&self, settlement: Arc<ScriptedSettlement>) -> Executor {
        self.executor_with(settlement, ExecutorSettings::default())
    }

    pub fn executor_with(
        &self,
        settlement: Arc<ScriptedSettlement>,
        settings: ExecutorSettings,
    ) -> Executor {
        Executor::new(
            Arc::clone(&self.store),
            settlement,
            Arc::clone(&self.oracle),
            settings,
        )
    }
}
