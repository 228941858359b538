use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::error::{QueueError, Result};
use crate::scheduler::job::{Job, JOB_COLUMNS};
use crate::store::{from_millis, now_millis, Store};

/// A registered worker as seen in the `workers` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn is_alive(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        now.signed_duration_since(self.last_heartbeat) < timeout
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let worker_id: String = row.try_get("worker_id")?;
        let at = |column: &str| -> Result<DateTime<Utc>> {
            let ms: i64 = row.try_get(column)?;
            from_millis(ms).ok_or_else(|| {
                QueueError::Corrupt(format!("worker {} has {} = {}", worker_id, column, ms))
            })
        };
        Ok(Self {
            started_at: at("started_at")?,
            last_heartbeat: at("last_heartbeat")?,
            worker_id,
        })
    }
}

/// Result of one lease sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reclaimed {
    /// Jobs returned to `pending`.
    pub jobs: Vec<Job>,
    /// Stale worker rows removed.
    pub workers: u64,
}

/// Worker liveness and job leases.
///
/// A `processing` job is leased by its owner for as long as the owner keeps
/// heartbeating. Once the owner's row is gone, or its heartbeat is older than
/// the lease timeout, the job can be reclaimed.
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    store: Store,
}

impl WorkerRegistry {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn register(&self, worker_id: &str) -> Result<()> {
        let now = now_millis();
        sqlx::query(
            "INSERT INTO workers (worker_id, started_at, last_heartbeat) VALUES (?1, ?2, ?2) \
             ON CONFLICT(worker_id) DO UPDATE SET last_heartbeat = excluded.last_heartbeat",
        )
        .bind(worker_id)
        .bind(now)
        .execute(self.store.pool())
        .await?;

        tracing::info!(worker_id, "Worker registered");
        Ok(())
    }

    /// Refresh the heartbeat, re-registering if the row was swept.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<()> {
        let now = now_millis();
        let result = sqlx::query("UPDATE workers SET last_heartbeat = ?2 WHERE worker_id = ?1")
            .bind(worker_id)
            .bind(now)
            .execute(self.store.pool())
            .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(worker_id, "Heartbeat for unknown worker, re-registering");
            self.register(worker_id).await?;
        }
        Ok(())
    }

    pub async fn deregister(&self, worker_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM workers WHERE worker_id = ?1")
            .bind(worker_id)
            .execute(self.store.pool())
            .await?;

        tracing::info!(worker_id, "Worker deregistered");
        Ok(())
    }

    /// Most recently active first.
    pub async fn all_workers(&self) -> Result<Vec<WorkerRecord>> {
        let rows = sqlx::query(
            "SELECT worker_id, started_at, last_heartbeat FROM workers \
             ORDER BY last_heartbeat DESC, worker_id",
        )
        .fetch_all(self.store.pool())
        .await?;

        rows.iter().map(WorkerRecord::from_row).collect()
    }

    /// Return `processing` jobs whose owner is missing or stale to `pending`,
    /// then drop the stale worker rows.
    ///
    /// Attempts are left alone: the owner never reported an outcome.
    pub async fn reclaim_expired(&self, timeout: Duration) -> Result<Reclaimed> {
        let now = now_millis();
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now.saturating_sub(timeout_ms);

        let sql = format!(
            "UPDATE jobs SET state = 'pending', owner = NULL, next_run_at = NULL, updated_at = ?1 \
             WHERE state = 'processing' AND owner NOT IN ( \
                 SELECT worker_id FROM workers WHERE last_heartbeat > ?2 \
             ) \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(cutoff)
            .fetch_all(self.store.pool())
            .await?;
        let jobs = rows.iter().map(Job::from_row).collect::<Result<Vec<_>>>()?;

        let workers = sqlx::query("DELETE FROM workers WHERE last_heartbeat <= ?1")
            .bind(cutoff)
            .execute(self.store.pool())
            .await?
            .rows_affected();

        for job in &jobs {
            tracing::warn!(job_id = %job.id, attempts = job.attempts, "Reclaimed job from expired lease");
        }
        if workers > 0 {
            tracing::warn!(workers, "Removed stale workers");
        }

        Ok(Reclaimed { jobs, workers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_uses_heartbeat_age() {
        let now = Utc::now();
        let record = WorkerRecord {
            worker_id: "w".to_string(),
            started_at: now,
            last_heartbeat: now - chrono::Duration::seconds(5),
        };
        assert!(record.is_alive(Duration::from_secs(10), now));
        assert!(!record.is_alive(Duration::from_secs(5), now));
        assert!(record.is_alive(Duration::MAX, now));
    }
}
