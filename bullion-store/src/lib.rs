//! SQLite-backed persistence for the brokerage state.
//!
//! All monetary columns are decimal strings; timestamps are RFC 3339 UTC.
//! The engine's multi-write operations run inside a single rusqlite
//! [`Transaction`] obtained through [`Store::with_tx`], so their writes
//! appear atomic to every reader.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row, Transaction};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

pub mod repository;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Store-specific error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested row does not exist (or is hidden by admin scoping).
    #[error("not found: {0}")]
    NotFound(String),
    /// A uniqueness constraint was violated.
    #[error("conflict: {0}")]
    Conflict(String),
    /// Any other database failure.
    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(failure, message)
                if failure.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Self::Conflict(
                    message
                        .clone()
                        .unwrap_or_else(|| "uniqueness constraint violated".into()),
                )
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS admins (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    ref_mid TEXT NOT NULL UNIQUE,
    account_head TEXT NOT NULL,
    accode TEXT NOT NULL,
    account_type TEXT NOT NULL,
    cash_balance TEXT NOT NULL,
    metal_weight TEXT NOT NULL,
    margin_pct TEXT NOT NULL,
    ask_spread TEXT NOT NULL,
    bid_spread TEXT NOT NULL,
    admin_owner TEXT NOT NULL,
    phone_number TEXT NOT NULL,
    email TEXT,
    status TEXT NOT NULL,
    kyc_status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (accode, admin_owner)
);

CREATE TABLE IF NOT EXISTS orders (
    id TEXT PRIMARY KEY,
    order_no TEXT NOT NULL UNIQUE,
    side TEXT NOT NULL,
    volume TEXT NOT NULL,
    symbol TEXT NOT NULL,
    price TEXT NOT NULL,
    opening_price TEXT NOT NULL,
    closing_price TEXT,
    required_margin TEXT NOT NULL,
    opening_date TEXT NOT NULL,
    closing_date TEXT,
    status TEXT NOT NULL,
    profit TEXT NOT NULL,
    user TEXT NOT NULL,
    admin_id TEXT NOT NULL,
    lp_position_id TEXT,
    ticket INTEGER,
    comment TEXT,
    notification_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_orders_user_status ON orders (user, status);
CREATE INDEX IF NOT EXISTS idx_orders_admin ON orders (admin_id);

CREATE TABLE IF NOT EXISTS lp_positions (
    position_id TEXT PRIMARY KEY,
    side TEXT NOT NULL,
    volume TEXT NOT NULL,
    symbol TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    current_price TEXT NOT NULL,
    closing_price TEXT,
    open_date TEXT NOT NULL,
    close_date TEXT,
    status TEXT NOT NULL,
    profit TEXT NOT NULL,
    client_order TEXT NOT NULL UNIQUE,
    admin_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger (
    entry_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    nature TEXT NOT NULL,
    reference_number TEXT NOT NULL,
    amount TEXT NOT NULL,
    running_balance TEXT NOT NULL,
    date TEXT NOT NULL,
    user TEXT NOT NULL,
    admin_id TEXT NOT NULL,
    asset TEXT,
    details TEXT NOT NULL,
    description TEXT NOT NULL,
    notes TEXT
);
CREATE INDEX IF NOT EXISTS idx_ledger_user_date ON ledger (user, date DESC);
CREATE INDEX IF NOT EXISTS idx_ledger_reference ON ledger (reference_number);

CREATE TABLE IF NOT EXISTS transactions (
    transaction_id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    asset TEXT NOT NULL,
    amount TEXT NOT NULL,
    user TEXT NOT NULL,
    admin_id TEXT NOT NULL,
    previous_balance TEXT NOT NULL,
    new_balance TEXT NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Handle to the SQLite database shared by every component.
pub struct Store {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                StoreError::Database(format!(
                    "failed to create data directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Fresh in-memory database, used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Filesystem location, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection without a transaction (reads).
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Run `f` inside a transaction. Any error rolls every write back.
    pub fn with_tx<T>(&self, f: impl FnOnce(&Transaction) -> StoreResult<T>) -> StoreResult<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }
}

pub(crate) fn invalid_column(index: usize, err: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, err.to_string().into())
}

pub(crate) fn decimal_col(row: &Row<'_>, index: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(index)?;
    Decimal::from_str(&raw).map_err(|err| invalid_column(index, err))
}

pub(crate) fn decimal_col_opt(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| Decimal::from_str(&value).map_err(|err| invalid_column(index, err)))
        .transpose()
}

pub(crate) fn date_col(row: &Row<'_>, index: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(index)?;
    raw.parse().map_err(|err| invalid_column(index, err))
}

pub(crate) fn date_col_opt(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|value| value.parse().map_err(|err| invalid_column(index, err)))
        .transpose()
}

pub(crate) fn uuid_col(row: &Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(index)?;
    Uuid::parse_str(&raw).map_err(|err| invalid_column(index, err))
}

pub(crate) fn parsed_col<T>(row: &Row<'_>, index: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.get(index)?;
    raw.parse().map_err(|err: T::Err| invalid_column(index, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_tx_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let result: StoreResult<()> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO admins (id, name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params!["a1", "desk", "desk@example.com", "2026-01-01T00:00:00Z"],
            )?;
            Err(StoreError::Database("forced failure".into()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .with_conn(|conn| {
                Ok(conn
                    .query_row("SELECT COUNT(*) FROM admins", [], |row| row.get(0))
                    .unwrap())
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn unique_violations_map_to_conflict() {
        let store = Store::open_in_memory().unwrap();
        let insert = |store: &Store| {
            store.with_tx(|tx| {
                tx.execute(
                    "INSERT INTO admins (id, name, email, created_at) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![
                        uuid::Uuid::new_v4().to_string(),
                        "desk",
                        "desk@example.com",
                        "2026-01-01T00:00:00Z"
                    ],
                )?;
                Ok(())
            })
        };
        insert(&store).unwrap();
        assert!(matches!(insert(&store), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("bullion.db");
        let store = Store::open(&path).unwrap();
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
