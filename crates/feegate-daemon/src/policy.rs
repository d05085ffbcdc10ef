//! `SQLite` policy directory.
//!
//! Reads the `scoped_policies` table owned by the policy service. A policy is
//! eligible for a listing fee while it is active and names a target.

use async_trait::async_trait;
use chrono::Utc;
use feegate_core::collaborators::{PolicyDirectory, PolicyError};
use feegate_core::{Scope, ScopeId, StoreError};
use rusqlite::{OptionalExtension, params};

use crate::db::{Database, map_sqlite_error, to_millis};

/// [`PolicyDirectory`] over the `scoped_policies` table.
#[derive(Debug, Clone)]
pub struct SqlitePolicyDirectory {
    db: Database,
}

impl SqlitePolicyDirectory {
    /// Wraps an open database.
    #[must_use]
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    async fn run<T, F>(&self, op: F) -> Result<T, PolicyError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, PolicyError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(|e| PolicyError::Unavailable(format!("policy task failed: {e}")))?
    }
}

fn unavailable(err: StoreError) -> PolicyError {
    PolicyError::Unavailable(err.to_string())
}

fn sql(err: rusqlite::Error) -> PolicyError {
    unavailable(map_sqlite_error(err))
}

fn to_scope(
    scope_id: ScopeId,
    payer: String,
    target: Option<String>,
) -> Result<Scope, PolicyError> {
    let target = target.filter(|t| !t.trim().is_empty());
    match target {
        Some(target) if !payer.trim().is_empty() => Ok(Scope::new(scope_id, payer, target)),
        Some(_) => Err(PolicyError::Invalid {
            scope_id,
            reason: "policy has no payer".to_string(),
        }),
        None => Err(PolicyError::Invalid {
            scope_id,
            reason: "policy has no target".to_string(),
        }),
    }
}

#[async_trait]
impl PolicyDirectory for SqlitePolicyDirectory {
    async fn resolve_scope(&self, scope_id: ScopeId) -> Result<Scope, PolicyError> {
        self.run(move |db| {
            let conn = db.lock().map_err(unavailable)?;
            let row: Option<(String, Option<String>)> = conn
                .query_row(
                    "SELECT payer, target FROM scoped_policies WHERE id = ?1",
                    params![scope_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(sql)?;
            let (payer, target) = row.ok_or(PolicyError::NotFound { scope_id })?;
            to_scope(scope_id, payer, target)
        })
        .await
    }

    async fn list_eligible_scopes(&self) -> Result<Vec<Scope>, PolicyError> {
        self.run(|db| {
            let conn = db.lock().map_err(unavailable)?;
            let mut stmt = conn
                .prepare(
                    "SELECT id, payer, target FROM scoped_policies
                     WHERE active = 1 AND target IS NOT NULL AND TRIM(target) != ''
                       AND TRIM(payer) != ''
                     ORDER BY created_at ASC, id ASC",
                )
                .map_err(sql)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(sql)?;

            let mut scopes = Vec::new();
            for row in rows {
                let (id, payer, target) = row.map_err(sql)?;
                // Rows with a malformed id belong to the policy service; skip them.
                let Ok(scope_id) = id.parse::<ScopeId>() else {
                    tracing::warn!(policy_id = %id, "skipping scoped policy with invalid id");
                    continue;
                };
                scopes.push(Scope::new(scope_id, payer, target));
            }
            Ok(scopes)
        })
        .await
    }

    async fn deactivate(&self, scope_id: ScopeId, reason: &str) -> Result<bool, PolicyError> {
        let reason = reason.to_string();
        self.run(move |db| {
            let conn = db.lock().map_err(unavailable)?;
            let changed = conn
                .execute(
                    "UPDATE scoped_policies
                     SET active = 0, deactivation_reason = ?1, updated_at = ?2
                     WHERE id = ?3 AND active = 1",
                    params![reason, to_millis(Utc::now()), scope_id.to_string()],
                )
                .map_err(sql)?;
            if changed == 1 {
                return Ok(true);
            }
            let exists: bool = conn
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM scoped_policies WHERE id = ?1)",
                    params![scope_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(sql)?;
            if exists {
                Ok(false)
            } else {
                Err(PolicyError::NotFound { scope_id })
            }
        })
        .await
    }
}

/// Inserts or replaces a policy row. Used by tests and local tooling that
/// stand in for the policy service.
///
/// # Errors
///
/// Returns [`StoreError`] if the write fails.
pub fn upsert_policy(
    db: &Database,
    scope_id: ScopeId,
    payer: &str,
    target: Option<&str>,
    active: bool,
) -> Result<(), StoreError> {
    let conn = db.lock()?;
    let now = to_millis(Utc::now());
    conn.execute(
        "INSERT INTO scoped_policies (id, payer, target, active, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?5)
         ON CONFLICT(id) DO UPDATE SET
             payer = excluded.payer,
             target = excluded.target,
             active = excluded.active,
             updated_at = excluded.updated_at",
        params![scope_id.to_string(), payer, target, active, now],
    )
    .map_err(map_sqlite_error)?;
    Ok(())
}

/// Reads a policy's `(active, deactivation_reason)`.
///
/// # Errors
///
/// Returns [`StoreError`] if the read fails.
pub fn policy_status(
    db: &Database,
    scope_id: ScopeId,
) -> Result<Option<(bool, Option<String>)>, StoreError> {
    let conn = db.lock()?;
    conn.query_row(
        "SELECT active, deactivation_reason FROM scoped_policies WHERE id = ?1",
        params![scope_id.to_string()],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
    .map_err(map_sqlite_error)
}
