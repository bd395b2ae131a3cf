//! [`SafetyStore`] – SQLite connection and schema.
//!
//! # Storage layout
//!
//! Table `interlock_events`:
//!
//! | column   | type    | description                                |
//! |----------|---------|--------------------------------------------|
//! | id       | INTEGER | Autoincrement primary key (journal order)  |
//! | kind     | TEXT    | `engaged` or `reset`                       |
//! | sequence | INTEGER | Stop-sequence number                       |
//! | reason   | TEXT    | Why the interlock was engaged              |
//! | identity | TEXT    | Operator that reset it (reset rows only)   |
//! | notes    | TEXT    | Verification notes (reset rows only)       |
//! | at       | TEXT    | RFC-3339 time (UTC)                        |
//!
//! Table `safety_audit`:
//!
//! | column    | type    | description                               |
//! |-----------|---------|-------------------------------------------|
//! | id        | INTEGER | Autoincrement primary key                 |
//! | at        | TEXT    | RFC-3339 time (UTC)                       |
//! | source    | TEXT    | Emitting crate/module                     |
//! | kind      | TEXT    | Event kind, e.g. `safety_transition`      |
//! | component | TEXT    | Affected component, if any                |
//! | identity  | TEXT    | Operator identity, if any                 |
//! | payload   | TEXT    | Full event payload as JSON                |

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use coachnet_types::GatewayError;
use rusqlite::Connection;
use thiserror::Error;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that can arise from store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        GatewayError::Persistence(e.to_string())
    }
}

/// SQLite-backed interlock journal and audit trail.
///
/// The connection sits behind a mutex so the store can be shared between
/// the facade and the audit task; callers on an async runtime should use
/// `spawn_blocking`.
pub struct SafetyStore {
    conn: Mutex<Connection>,
}

impl SafetyStore {
    /// Open (or create) a persistent database at `path`, creating missing
    /// parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        // Another process holding the file waits here instead of failing a
        // journal write outright.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!(path = %path.display(), "safety store opened");
        Ok(store)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS interlock_events (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                kind     TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                reason   TEXT NOT NULL DEFAULT '',
                identity TEXT,
                notes    TEXT,
                at       TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS safety_audit (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                at        TEXT NOT NULL,
                source    TEXT NOT NULL,
                kind      TEXT NOT NULL,
                component TEXT,
                identity  TEXT,
                payload   TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS safety_audit_component ON safety_audit (component);",
        )?;
        Ok(())
    }
}

pub(crate) fn parse_time(column: usize, raw: &str) -> rusqlite::Result<chrono::DateTime<chrono::Utc>> {
    raw.parse().map_err(|e: chrono::ParseError| {
        rusqlite::Error::InvalidColumnType(column, e.to_string(), rusqlite::types::Type::Text)
    })
}
