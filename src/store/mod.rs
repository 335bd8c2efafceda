//! SQLite-backed state for all workers.
//!
//! One database file holds aggregation cursors and their source events,
//! webhook failure state, counter buffers and leases. Timestamps that are
//! compared in SQL are stored as integer milliseconds since the Unix epoch.

mod aggregations;
mod counters;
mod hooks;
mod leases;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;

pub use counters::FlushedCounter;

/// Async-safe handle to the database.
///
/// Wraps `Db` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// thread pool via `spawn_blocking`, so synchronous SQLite I/O never ties up
/// async worker threads.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Db::new(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Db::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle").finish_non_exhaustive()
    }
}

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // Other worker processes may hold the write lock.
        self.conn
            .busy_timeout(std::time::Duration::from_secs(5))
            .context("Failed to set busy timeout")?;
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS aggregations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    target_id INTEGER NOT NULL UNIQUE,
                    enabled INTEGER NOT NULL DEFAULT 1,
                    last_incremental_run_at INTEGER,
                    last_full_run_at INTEGER,
                    cursor_updated_at INTEGER,
                    cursor_event_id INTEGER,
                    total_value INTEGER NOT NULL DEFAULT 0,
                    processed_records INTEGER NOT NULL DEFAULT 0,
                    incremental_stats TEXT NOT NULL DEFAULT '{}',
                    full_stats TEXT NOT NULL DEFAULT '{}',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS events (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    target_id INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL,
                    value INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS web_hooks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    project_id INTEGER NOT NULL,
                    url TEXT NOT NULL,
                    recent_failures INTEGER NOT NULL DEFAULT 0,
                    backoff_count INTEGER NOT NULL DEFAULT 0,
                    disabled_until INTEGER,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS hook_last_failures (
                    project_id INTEGER PRIMARY KEY,
                    failed_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS counters (
                    record_key TEXT NOT NULL,
                    attribute TEXT NOT NULL,
                    value INTEGER NOT NULL DEFAULT 0,
                    PRIMARY KEY (record_key, attribute)
                );

                CREATE TABLE IF NOT EXISTS counter_increments (
                    counter_key TEXT PRIMARY KEY,
                    pending INTEGER NOT NULL DEFAULT 0,
                    flushed INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS leases (
                    key TEXT PRIMARY KEY,
                    token TEXT NOT NULL,
                    expires_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_aggregations_incremental
                    ON aggregations(enabled, last_incremental_run_at);
                CREATE INDEX IF NOT EXISTS idx_aggregations_full
                    ON aggregations(enabled, last_full_run_at);
                CREATE INDEX IF NOT EXISTS idx_events_target_cursor
                    ON events(target_id, updated_at, id);
                CREATE INDEX IF NOT EXISTS idx_web_hooks_project ON web_hooks(project_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    /// Row counts per table, for `cronlease status`.
    pub fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        let mut counts = Vec::new();
        for table in ["aggregations", "events", "web_hooks", "counters", "leases"] {
            let count: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                    row.get(0)
                })
                .with_context(|| format!("Failed to count rows in {}", table))?;
            counts.push((table, count));
        }
        Ok(counts)
    }
}

pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .with_context(|| format!("Timestamp out of range: {}", ms))
}

pub(crate) fn from_optional_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    ms.map(from_millis).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_database_and_run_migrations() -> Result<()> {
        let db = Db::new_in_memory()?;

        let table_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN
             ('aggregations', 'events', 'web_hooks', 'hook_last_failures', 'counters', 'counter_increments', 'leases')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(table_count, 7, "Expected 7 tables to exist");

        let index_count: i32 = db.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='index' AND name IN
             ('idx_aggregations_incremental', 'idx_aggregations_full', 'idx_events_target_cursor', 'idx_web_hooks_project')",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(index_count, 4, "Expected 4 indexes to exist");

        Ok(())
    }

    #[test]
    fn test_migrations_are_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("state.db");
        Db::new(&path)?;
        let db = Db::new(&path)?;
        assert!(db.table_counts()?.iter().all(|(_, n)| *n == 0));
        Ok(())
    }

    #[test]
    fn test_millis_round_trip() -> Result<()> {
        let at = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap();
        assert_eq!(from_millis(to_millis(at))?, at);
        assert_eq!(from_optional_millis(None)?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_handle_call_runs_on_blocking_pool() -> Result<()> {
        let handle = DbHandle::open_in_memory()?;
        let counts = handle.call(|db| db.table_counts()).await?;
        assert_eq!(counts.len(), 5);
        Ok(())
    }
}
