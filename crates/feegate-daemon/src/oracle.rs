//! Transaction oracle backed by the indexer's `tx_index` table.
//!
//! The indexer records every transfer it sees for a (payer, target) pair and
//! updates the on-chain outcome as blocks confirm. A transfer still `unknown`
//! after `mark_lost_after` is reported as lost.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feegate_core::collaborators::{OracleError, TransactionOracle};
use feegate_core::{OnChainResult, OracleReport, Scope, StoreError, TxReference};
use rusqlite::{OptionalExtension, params};

use crate::db::{Database, from_millis, map_sqlite_error, to_millis};
use crate::driver::has_elapsed;

/// Default age after which an unconfirmed transfer counts as lost.
pub const DEFAULT_MARK_LOST_AFTER: Duration = Duration::from_secs(3600);

/// [`TransactionOracle`] over the `tx_index` table.
#[derive(Debug, Clone)]
pub struct SqliteTxIndexOracle {
    db: Database,
    mark_lost_after: Duration,
}

impl SqliteTxIndexOracle {
    /// Creates an oracle that marks transfers lost after `mark_lost_after`.
    #[must_use]
    pub const fn new(db: Database, mark_lost_after: Duration) -> Self {
        Self {
            db,
            mark_lost_after,
        }
    }

    fn latest(
        &self,
        scope: &Scope,
        now: DateTime<Utc>,
    ) -> Result<Option<OracleReport>, StoreError> {
        let conn = self.db.lock()?;
        let row: Option<(String, String, Option<i64>, i64)> = conn
            .query_row(
                "SELECT tx_reference, on_chain, confirmations, broadcast_at
                 FROM tx_index
                 WHERE payer = ?1 AND target = ?2
                 ORDER BY broadcast_at DESC, rowid DESC
                 LIMIT 1",
                params![scope.payer, scope.target],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(map_sqlite_error)?;

        let Some((tx_reference, on_chain, confirmations, broadcast_at)) = row else {
            return Ok(None);
        };

        let corrupt = |details: String| StoreError::Corrupt { details };
        let tx_reference = TxReference::new(tx_reference).map_err(|e| corrupt(e.to_string()))?;
        let on_chain = on_chain
            .parse::<OnChainResult>()
            .map_err(|e| corrupt(e.to_string()))?;
        let confirmations = confirmations
            .map(u32::try_from)
            .transpose()
            .map_err(|_| corrupt(format!("confirmations out of range for {tx_reference}")))?;
        let broadcast_at = from_millis(broadcast_at, "broadcast_at")?;

        let lost = on_chain == OnChainResult::Unknown
            && has_elapsed(broadcast_at, now, self.mark_lost_after);

        Ok(Some(OracleReport {
            tx_reference,
            on_chain,
            lost,
            broadcast_at: Some(broadcast_at),
            confirmations,
        }))
    }
}

#[async_trait]
impl TransactionOracle for SqliteTxIndexOracle {
    async fn latest_status(&self, scope: &Scope) -> Result<Option<OracleReport>, OracleError> {
        let oracle = self.clone();
        let scope = scope.clone();
        tokio::task::spawn_blocking(move || oracle.latest(&scope, Utc::now()))
            .await
            .map_err(|e| OracleError(format!("oracle task failed: {e}")))?
            .map_err(|e| OracleError(e.to_string()))
    }
}

/// An indexer observation written to `tx_index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedTransfer {
    /// Transaction hash.
    pub tx_reference: TxReference,
    /// Payer the transfer was sent for.
    pub payer: String,
    /// Target the transfer was sent for.
    pub target: String,
    /// Mined outcome.
    pub on_chain: OnChainResult,
    /// Confirmation depth, if mined.
    pub confirmations: Option<u32>,
    /// When the transfer was broadcast.
    pub broadcast_at: DateTime<Utc>,
}

/// Inserts or updates an indexer row. Used by tests and local tooling that
/// stand in for the indexer.
///
/// # Errors
///
/// Returns [`StoreError`] if the write fails.
pub fn record_transfer(db: &Database, transfer: &IndexedTransfer) -> Result<(), StoreError> {
    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO tx_index
             (tx_reference, payer, target, on_chain, confirmations, broadcast_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(tx_reference) DO UPDATE SET
             on_chain = excluded.on_chain,
             confirmations = excluded.confirmations,
             updated_at = excluded.updated_at",
        params![
            transfer.tx_reference.as_str(),
            transfer.payer,
            transfer.target,
            transfer.on_chain.as_str(),
            transfer.confirmations,
            to_millis(transfer.broadcast_at),
            to_millis(Utc::now()),
        ],
    )
    .map_err(map_sqlite_error)?;
    Ok(())
}
