//! `SQLite` connection handling.
//!
//! One [`Database`] wraps one connection. The fee store, the policy directory
//! and the oracle adapter share a handle; opening the same file twice gives
//! two independent writers, which is how separate processes see each other.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use feegate_core::StoreError;
use rusqlite::{Connection, ErrorCode, OpenFlags};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// Default wait on a locked database.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared handle to an initialized connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("path", &self.path).finish()
    }
}

impl Database {
    /// Opens or creates the database at `path` and applies the schema.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the file cannot be opened or
    /// the schema cannot be applied.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(map_sqlite_error)?;
        Self::initialize_connection(&conn, busy_timeout)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::initialize_connection(&conn, DEFAULT_BUSY_TIMEOUT)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn initialize_connection(conn: &Connection, busy_timeout: Duration) -> Result<(), StoreError> {
        // Set before the schema so a concurrent opener waits instead of failing.
        conn.busy_timeout(busy_timeout).map_err(map_sqlite_error)?;
        conn.execute_batch(SCHEMA_SQL).map_err(map_sqlite_error)?;
        Ok(())
    }

    /// Database file, `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Locks the connection.
    ///
    /// # Errors
    ///
    /// A poisoned lock is reported as [`StoreError::Unavailable`].
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Unavailable(format!("connection mutex poisoned: {e}")))
    }
}

/// Classifies a rusqlite error.
///
/// Busy and locked databases are retryable. Decoding failures and schema
/// constraint violations point at bad data and are not.
pub(crate) fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            StoreError::Unavailable(err.to_string())
        },
        rusqlite::Error::SqliteFailure(code, _) if code.code == ErrorCode::ConstraintViolation => {
            StoreError::Corrupt {
                details: err.to_string(),
            }
        },
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => StoreError::Corrupt {
            details: err.to_string(),
        },
        _ => StoreError::Unavailable(err.to_string()),
    }
}

/// Returns `true` for a UNIQUE (not PRIMARY KEY, not trigger) violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(code, _)
            if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64, column: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        details: format!("{column} is out of range: {ms}"),
    })
}

pub(crate) fn from_millis_opt(
    ms: Option<i64>,
    column: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(|ms| from_millis(ms, column)).transpose()
}
