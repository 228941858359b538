//! Shared SQLite store used as the only coordination medium between workers.
//!
//! Four tables make up the persisted layout:
//! - `jobs`: job records and their lifecycle state
//! - `workers`: registered workers and their heartbeats
//! - `control`: the shared `stop` flag
//! - `config`: operator-tunable retry policy
//!
//! The [`Store`] handle is a cheap clone around one connection pool. It is
//! built once at startup and passed to every component that needs it.

mod control;
mod settings;

pub use control::ControlChannel;
pub use settings::{ConfigEntry, ConfigStore, PolicyKey};

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};

use crate::config::StoreConfig;
use crate::error::Result;

const SCHEMA: [&str; 6] = [
    r#"
    CREATE TABLE IF NOT EXISTS jobs (
        id TEXT PRIMARY KEY,
        command TEXT NOT NULL,
        state TEXT NOT NULL CHECK (state IN ('pending', 'processing', 'completed', 'dead')),
        attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_retries INTEGER NOT NULL CHECK (max_retries >= 0),
        owner TEXT,
        next_run_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        CHECK ((owner IS NOT NULL) = (state = 'processing')),
        CHECK (state = 'dead' OR state = 'completed' OR attempts <= max_retries)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workers (
        worker_id TEXT PRIMARY KEY,
        started_at INTEGER NOT NULL,
        last_heartbeat INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS control (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS config (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS jobs_claim_order ON jobs (state, created_at, id)",
    "CREATE INDEX IF NOT EXISTS jobs_owner ON jobs (owner)",
];

/// Handle to the shared job store.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database file and bootstrap the schema.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created or the database cannot be
    /// opened. Callers treat this as fatal: a process that cannot reach the
    /// store never becomes a worker.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(config.busy_timeout());

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        tracing::debug!(
            path = %config.path.display(),
            max_connections = config.max_connections,
            "Connected to job store"
        );

        Ok(store)
    }

    /// Create missing tables and indexes. Safe to run from several processes at once.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Timestamps are persisted as Unix epoch milliseconds so SQL can compare them directly.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
}

pub(crate) fn now_millis() -> i64 {
    to_millis(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip_drops_sub_millisecond_precision() {
        let at = DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap();
        let back = from_millis(to_millis(at)).unwrap();
        assert_eq!(to_millis(back), 1_700_000_000_123);
        assert!(at - back < chrono::Duration::milliseconds(1));
    }

    #[tokio::test]
    async fn connect_creates_parent_directories_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.db");
        let store = Store::connect(&StoreConfig::new(&path)).await.unwrap();
        assert!(path.exists());

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(store.pool())
                .await
                .unwrap();
        assert_eq!(tables, vec!["config", "control", "jobs", "workers"]);

        // Bootstrapping twice is a no-op.
        store.migrate().await.unwrap();
    }
}
