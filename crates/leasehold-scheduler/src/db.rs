use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use leasehold_core::config::DatabaseConfig;
use rusqlite::Connection;
use tracing::info;

use crate::clock::Clock;
use crate::error::{Result, SchedulerError};

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `mutexes` and `tasks` tables (idempotent). Every instance runs
/// this on startup; concurrent runs are harmless.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS mutexes (
            id                        TEXT NOT NULL PRIMARY KEY,
            current_lock_ticket       TEXT,
            current_lock_acquired_at  TEXT,   -- RFC 3339, millisecond, UTC
            current_lock_expires_at   TEXT
        ) STRICT;

        CREATE TABLE IF NOT EXISTS tasks (
            id                      TEXT NOT NULL PRIMARY KEY,
            settings_json           TEXT NOT NULL,
            next_run_start_at       TEXT,
            current_run_ticket      TEXT,
            current_run_started_at  TEXT,
            current_run_expires_at  TEXT,
            last_run_ended_at       TEXT,
            last_run_status         TEXT,   -- 'succeeded' | 'failed'
            last_run_error          TEXT
        ) STRICT;

        -- Janitor sweep: WHERE current_run_ticket IS NOT NULL AND current_run_expires_at <= ?
        CREATE INDEX IF NOT EXISTS idx_tasks_run_expiry ON tasks (current_run_expires_at);
        ",
    )?;
    Ok(())
}

/// One instance's connection to the shared store.
///
/// Cloning shares the connection. Separate instances (or separate simulated
/// instances in tests) open their own `Database` on the same file.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (creating if needed) the store at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        init_db(&conn)?;
        info!(path = %path.as_ref().display(), "scheduler store opened");
        Ok(Self::from_connection(conn))
    }

    pub fn open_with_config(config: &DatabaseConfig) -> Result<Self> {
        Self::open(&config.path, Duration::from_millis(config.busy_timeout_ms))
    }

    /// Private in-memory store; only useful for a single instance.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self::from_connection(conn))
    }

    /// Wrap an already-open (and `init_db`-initialised) connection.
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SchedulerError::StorePoisoned)
    }
}

/// Current time at the precision the store keeps, so values handed back to
/// callers compare equal to what was written.
pub(crate) fn store_now(clock: &dyn Clock) -> DateTime<Utc> {
    clock.now().trunc_subsecs(3)
}

/// Fixed-width text form of a timestamp (`2026-01-01T00:00:00.000Z`).
///
/// Fixed width keeps SQL string comparison chronological.
pub fn to_db_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn from_db_time(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Read an optional timestamp column.
pub(crate) fn opt_time(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .as_deref()
        .map(from_db_time)
        .transpose()
}
