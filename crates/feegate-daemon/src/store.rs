//! `SQLite`-backed fee store.
//!
//! Uniqueness is enforced by partial unique indexes, immutability and
//! append-only behavior by triggers (see `schema.sql`). Every mutation here is
//! a single conditional statement or an `IMMEDIATE` transaction, so two
//! handles on the same file never observe a torn update.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use feegate_core::fee::Transition;
use feegate_core::{
    FeeId, FeeRecord, FeeStatus, FeeStore, FeeTerms, Scope, ScopeId, StoreError, TxReference,
};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::debug;

use crate::db::{
    Database, from_millis, from_millis_opt, is_unique_violation, map_sqlite_error, to_millis,
};

const FEE_COLUMNS: &str = "id, scope_id, payer, target, asset, amount, destination, status, \
     tx_reference, confirmation_count, failure_reason, execution_lease_until, submitted_at, \
     paid_at, created_at, updated_at";

/// Durable [`FeeStore`] over a `listing_fees` table.
#[derive(Debug, Clone)]
pub struct SqliteFeeStore {
    db: Database,
}

impl SqliteFeeStore {
    /// Opens or creates a store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        Ok(Self::new(Database::open(path, busy_timeout)?))
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    /// Wraps an already-open database.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    /// The underlying database handle.
    #[must_use]
    pub const fn database(&self) -> &Database {
        &self.db
    }
}

impl FeeStore for SqliteFeeStore {
    fn create_if_absent(
        &self,
        scope: &Scope,
        terms: &FeeTerms,
        now: DateTime<Utc>,
    ) -> Result<FeeRecord, StoreError> {
        let mut conn = self.db.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(map_sqlite_error)?;

        let candidate = FeeRecord::new_pending(scope.clone(), terms.clone(), now);
        let now_ms = to_millis(now);
        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO listing_fees
                     (id, scope_id, payer, target, asset, amount, destination, status,
                      created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
                params![
                    candidate.id.to_string(),
                    scope.scope_id.to_string(),
                    scope.payer,
                    scope.target,
                    terms.asset,
                    terms.amount.to_string(),
                    terms.destination,
                    now_ms,
                ],
            )
            .map_err(map_sqlite_error)?;

        let record = select_one(
            &tx,
            &format!(
                "SELECT {FEE_COLUMNS} FROM listing_fees
                 WHERE payer = ?1 AND target = ?2 AND status IN ('pending', 'submitted', 'paid')"
            ),
            params![scope.payer, scope.target],
        )?
        .ok_or_else(|| StoreError::Corrupt {
            details: format!("no open listing fee for {scope} after insert"),
        })?;
        tx.commit().map_err(map_sqlite_error)?;

        debug!(
            fee_id = %record.id,
            scope = %scope,
            created = inserted == 1,
            status = %record.status,
            "create_if_absent"
        );
        Ok(record)
    }

    fn get(&self, id: FeeId) -> Result<Option<FeeRecord>, StoreError> {
        let conn = self.db.lock()?;
        select_one(
            &conn,
            &format!("SELECT {FEE_COLUMNS} FROM listing_fees WHERE id = ?1"),
            params![id.to_string()],
        )
    }

    fn latest_for_scope(
        &self,
        payer: &str,
        target: &str,
    ) -> Result<Option<FeeRecord>, StoreError> {
        let conn = self.db.lock()?;
        select_one(
            &conn,
            &format!(
                "SELECT {FEE_COLUMNS} FROM listing_fees
                 WHERE payer = ?1 AND target = ?2
                 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ),
            params![payer, target],
        )
    }

    fn latest_for_scope_id(&self, scope_id: ScopeId) -> Result<Option<FeeRecord>, StoreError> {
        let conn = self.db.lock()?;
        select_one(
            &conn,
            &format!(
                "SELECT {FEE_COLUMNS} FROM listing_fees
                 WHERE scope_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1"
            ),
            params![scope_id.to_string()],
        )
    }

    fn transition(&self, transition: &Transition, now: DateTime<Utc>) -> Result<bool, StoreError> {
        if !transition.from.can_transition_to(transition.to) {
            return Err(StoreError::IllegalTransition {
                from: transition.from,
                to: transition.to,
            });
        }

        let now_ms = to_millis(now);
        let submitted_at = (transition.to == FeeStatus::Submitted).then_some(now_ms);
        let paid_at = (transition.to == FeeStatus::Paid).then_some(now_ms);
        let fields = &transition.fields;

        let conn = self.db.lock()?;
        let changed = conn
            .execute(
                "UPDATE listing_fees SET
                     status = ?1,
                     tx_reference = COALESCE(?2, tx_reference),
                     failure_reason = COALESCE(?3, failure_reason),
                     confirmation_count = COALESCE(?4, confirmation_count),
                     submitted_at = COALESCE(?5, submitted_at),
                     paid_at = COALESCE(?6, paid_at),
                     execution_lease_until = NULL,
                     updated_at = ?7
                 WHERE id = ?8 AND status = ?9",
                params![
                    transition.to.as_str(),
                    fields.tx_reference.as_ref().map(TxReference::as_str),
                    fields.failure_reason,
                    fields.confirmation_count.map(i64::from),
                    submitted_at,
                    paid_at,
                    now_ms,
                    transition.fee_id.to_string(),
                    transition.from.as_str(),
                ],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::DuplicateTxReference {
                        tx_reference: fields
                            .tx_reference
                            .as_ref()
                            .map_or_else(String::new, ToString::to_string),
                    }
                } else {
                    map_sqlite_error(e)
                }
            })?;

        debug!(
            fee_id = %transition.fee_id,
            from = %transition.from,
            to = %transition.to,
            applied = changed == 1,
            "transition"
        );
        Ok(changed == 1)
    }

    fn list_by_status(&self, status: FeeStatus) -> Result<Vec<FeeRecord>, StoreError> {
        let conn = self.db.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {FEE_COLUMNS} FROM listing_fees
                 WHERE status = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ))
            .map_err(map_sqlite_error)?;
        let rows = stmt
            .query_map(params![status.as_str()], FeeRow::from_row)
            .map_err(map_sqlite_error)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(map_sqlite_error)?.into_record()?);
        }
        Ok(records)
    }

    fn try_claim_execution(
        &self,
        id: FeeId,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let changed = conn
            .execute(
                "UPDATE listing_fees SET execution_lease_until = ?1
                 WHERE id = ?2 AND status = 'pending'
                   AND (execution_lease_until IS NULL OR execution_lease_until <= ?3)",
                params![to_millis(until), id.to_string(), to_millis(now)],
            )
            .map_err(map_sqlite_error)?;
        Ok(changed == 1)
    }

    fn release_execution_claim(&self, id: FeeId) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        conn.execute(
            "UPDATE listing_fees SET execution_lease_until = NULL
             WHERE id = ?1 AND execution_lease_until IS NOT NULL",
            params![id.to_string()],
        )
        .map_err(map_sqlite_error)?;
        Ok(())
    }
}

/// Runs a store call on the blocking pool.
///
/// # Errors
///
/// Returns the call's error, or [`StoreError::Unavailable`] if the blocking
/// task panicked or was cancelled.
pub async fn blocking<T, F>(store: &Arc<dyn FeeStore>, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn FeeStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
}

fn select_one(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Option<FeeRecord>, StoreError> {
    conn.query_row(sql, params, FeeRow::from_row)
        .optional()
        .map_err(map_sqlite_error)?
        .map(FeeRow::into_record)
        .transpose()
}

/// Raw column values, decoded into a [`FeeRecord`] outside the row callback.
struct FeeRow {
    id: String,
    scope_id: String,
    payer: String,
    target: String,
    asset: String,
    amount: String,
    destination: String,
    status: String,
    tx_reference: Option<String>,
    confirmation_count: Option<i64>,
    failure_reason: Option<String>,
    execution_lease_until: Option<i64>,
    submitted_at: Option<i64>,
    paid_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
}

impl FeeRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            scope_id: row.get(1)?,
            payer: row.get(2)?,
            target: row.get(3)?,
            asset: row.get(4)?,
            amount: row.get(5)?,
            destination: row.get(6)?,
            status: row.get(7)?,
            tx_reference: row.get(8)?,
            confirmation_count: row.get(9)?,
            failure_reason: row.get(10)?,
            execution_lease_until: row.get(11)?,
            submitted_at: row.get(12)?,
            paid_at: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<FeeRecord, StoreError> {
        let corrupt = |column: &str, err: &dyn std::fmt::Display| StoreError::Corrupt {
            details: format!("listing fee {}: {column}: {err}", self.id),
        };

        let id = self.id.parse::<FeeId>().map_err(|e| corrupt("id", &e))?;
        let scope_id = self
            .scope_id
            .parse::<ScopeId>()
            .map_err(|e| corrupt("scope_id", &e))?;
        let amount = self.amount.parse().map_err(|e| corrupt("amount", &e))?;
        let status = self.status.parse().map_err(|e| corrupt("status", &e))?;
        let tx_reference = self
            .tx_reference
            .clone()
            .map(TxReference::new)
            .transpose()
            .map_err(|e| corrupt("tx_reference", &e))?;
        let confirmation_count = self
            .confirmation_count
            .map(u32::try_from)
            .transpose()
            .map_err(|e| corrupt("confirmation_count", &e))?;

        Ok(FeeRecord {
            id,
            scope: Scope {
                scope_id,
                payer: self.payer.clone(),
                target: self.target.clone(),
            },
            terms: FeeTerms {
                asset: self.asset.clone(),
                amount,
                destination: self.destination.clone(),
            },
            status,
            tx_reference,
            confirmation_count,
            failure_reason: self.failure_reason.clone(),
            execution_lease_until: from_millis_opt(
                self.execution_lease_until,
                "execution_lease_until",
            )?,
            submitted_at: from_millis_opt(self.submitted_at, "submitted_at")?,
            paid_at: from_millis_opt(self.paid_at, "paid_at")?,
            created_at: from_millis(self.created_at, "created_at")?,
            updated_at: from_millis(self.updated_at, "updated_at")?,
        })
    }
}
