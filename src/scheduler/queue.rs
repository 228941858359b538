use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::scheduler::backoff::{FailureOutcome, RetryPolicy};
use crate::scheduler::job::{Job, JobState, JOB_COLUMNS};
use crate::store::{now_millis, to_millis, ConfigStore, PolicyKey, Store};

/// Number of jobs in each state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StateCounts {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub dead: u64,
}

impl StateCounts {
    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Pending => self.pending,
            JobState::Processing => self.processing,
            JobState::Completed => self.completed,
            JobState::Dead => self.dead,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.dead
    }
}

/// Persistent job queue.
///
/// All state lives in the store, so any number of `JobQueue` handles, in any
/// number of processes, see the same jobs. Every worker-side transition is a
/// single guarded statement: it only applies while the caller still owns the
/// job, and reports [`QueueError::LeaseLost`] otherwise.
#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Store,
    settings: ConfigStore,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self {
            settings: ConfigStore::new(store.clone()),
            store,
        }
    }

    /// Create a pending job, snapshotting the configured `max-retries`.
    pub async fn enqueue(&self, command: impl Into<String>) -> Result<Job> {
        let max_retries = self.settings.get(PolicyKey::MaxRetries).await?.value;
        let job = Job::new(command, max_retries);
        self.add_job(&job).await?;

        tracing::info!(job_id = %job.id, command = %job.command, max_retries, "Job enqueued");
        Ok(job)
    }

    /// Insert a job record as-is.
    pub async fn add_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, command, state, attempts, max_retries, owner, next_run_at, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(job.id.to_string())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(job.owner.as_deref())
        .bind(job.next_run_at.map(to_millis))
        .bind(to_millis(job.created_at))
        .bind(to_millis(job.updated_at))
        .execute(self.store.pool())
        .await?;
        Ok(())
    }

    pub async fn get_job(&self, id: &Uuid) -> Result<Option<Job>> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(self.store.pool())
            .await?;

        row.as_ref().map(Job::from_row).transpose()
    }

    /// Atomically claim the oldest eligible pending job for `worker_id`.
    ///
    /// Selection and transition happen in one statement, so two claimers can
    /// never both win the same job. The returned job is `processing` with
    /// `owner` and `updated_at` set; attempts and retry policy are untouched.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Job>> {
        let now = now_millis();
        let sql = format!(
            "UPDATE jobs SET state = 'processing', owner = ?1, updated_at = ?2 \
             WHERE id = ( \
                 SELECT id FROM jobs \
                 WHERE state = 'pending' AND (next_run_at IS NULL OR next_run_at <= ?2) \
                 ORDER BY created_at, id LIMIT 1 \
             ) AND state = 'pending' \
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(worker_id)
            .bind(now)
            .fetch_optional(self.store.pool())
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job = Job::from_row(&row)?;
        tracing::debug!(job_id = %job.id, worker_id, attempts = job.attempts, "Job claimed");
        Ok(Some(job))
    }

    /// `processing -> completed` for a job `worker_id` still owns.
    pub async fn complete(&self, job: &Job, worker_id: &str) -> Result<Job> {
        let sql = format!(
            "UPDATE jobs SET state = 'completed', owner = NULL, next_run_at = NULL, updated_at = ?3 \
             WHERE id = ?1 AND state = 'processing' AND owner = ?2 \
             RETURNING {JOB_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(job.id.to_string())
            .bind(worker_id)
            .bind(now_millis())
            .fetch_optional(self.store.pool())
            .await?;

        let completed = owned_transition(row, job, worker_id)?;
        tracing::info!(job_id = %job.id, worker_id, "Job completed");
        Ok(completed)
    }

    /// Record a failed attempt under `policy`: back to `pending` with backoff,
    /// or `dead` once retries are exhausted.
    ///
    /// The job's `max_retries` is refreshed from `policy` so the decision and
    /// the stored record always agree.
    pub async fn fail(&self, job: &Job, worker_id: &str, policy: &RetryPolicy) -> Result<Job> {
        let now = now_millis();
        let outcome = policy.on_failure(job.attempts);

        let row = match outcome {
            FailureOutcome::Retry { attempts, delay } => {
                let sql = format!(
                    "UPDATE jobs SET state = 'pending', owner = NULL, attempts = ?4, max_retries = ?5, \
                         next_run_at = ?6, updated_at = ?7 \
                     WHERE id = ?1 AND state = 'processing' AND owner = ?2 AND attempts = ?3 \
                     RETURNING {JOB_COLUMNS}"
                );
                sqlx::query(&sql)
                    .bind(job.id.to_string())
                    .bind(worker_id)
                    .bind(i64::from(job.attempts))
                    .bind(i64::from(attempts))
                    .bind(i64::from(policy.max_retries))
                    .bind(retry_at(now, delay))
                    .bind(now)
                    .fetch_optional(self.store.pool())
                    .await?
            }
            FailureOutcome::Dead { attempts } => {
                let sql = format!(
                    "UPDATE jobs SET state = 'dead', owner = NULL, attempts = ?4, max_retries = ?5, \
                         next_run_at = NULL, updated_at = ?6 \
                     WHERE id = ?1 AND state = 'processing' AND owner = ?2 AND attempts = ?3 \
                     RETURNING {JOB_COLUMNS}"
                );
                sqlx::query(&sql)
                    .bind(job.id.to_string())
                    .bind(worker_id)
                    .bind(i64::from(job.attempts))
                    .bind(i64::from(attempts))
                    .bind(i64::from(policy.max_retries))
                    .bind(now)
                    .fetch_optional(self.store.pool())
                    .await?
            }
        };

        let failed = owned_transition(row, job, worker_id)?;
        match outcome {
            FailureOutcome::Retry { attempts, delay } => tracing::warn!(
                job_id = %job.id,
                worker_id,
                attempts,
                max_retries = policy.max_retries,
                delay_secs = delay.as_secs(),
                "Job failed, retry scheduled"
            ),
            FailureOutcome::Dead { attempts } => tracing::error!(
                job_id = %job.id,
                worker_id,
                attempts,
                max_retries = policy.max_retries,
                "Job failed, moved to dead letter queue"
            ),
        }
        Ok(failed)
    }

    /// Jobs in creation order, optionally filtered by state.
    pub async fn list(&self, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = match state {
            Some(state) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE state = ?1 ORDER BY created_at, id"
                ))
                .bind(state.as_str())
                .fetch_all(self.store.pool())
                .await?
            }
            None => {
                sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY created_at, id"))
                    .fetch_all(self.store.pool())
                    .await?
            }
        };

        rows.iter().map(Job::from_row).collect()
    }

    pub async fn counts(&self) -> Result<StateCounts> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(self.store.pool())
                .await?;

        let mut counts = StateCounts::default();
        for (state, count) in rows {
            let count = u64::try_from(count).unwrap_or_default();
            match state.parse::<JobState>() {
                Ok(JobState::Pending) => counts.pending = count,
                Ok(JobState::Processing) => counts.processing = count,
                Ok(JobState::Completed) => counts.completed = count,
                Ok(JobState::Dead) => counts.dead = count,
                Err(_) => tracing::warn!(state = %state, count, "Ignoring jobs with unknown state"),
            }
        }
        Ok(counts)
    }
}

/// Map a guarded transition's RETURNING row, or report that the lease is gone.
fn owned_transition(row: Option<SqliteRow>, job: &Job, worker_id: &str) -> Result<Job> {
    match row {
        Some(row) => Job::from_row(&row),
        None => Err(QueueError::LeaseLost {
            job_id: job.id.to_string(),
            worker_id: worker_id.to_string(),
        }),
    }
}

/// Eligibility time for a retry, clamped to what a timestamp can represent.
fn retry_at(now_ms: i64, delay: std::time::Duration) -> i64 {
    let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
    now_ms
        .saturating_add(delay_ms)
        .min(DateTime::<Utc>::MAX_UTC.timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn retry_at_adds_delay_in_millis() {
        assert_eq!(retry_at(1_000, Duration::from_secs(2)), 3_000);
    }

    #[test]
    fn retry_at_clamps_huge_delays() {
        let at = retry_at(1_000, Duration::from_secs(u64::MAX));
        assert!(crate::store::from_millis(at).is_some());
    }

    #[test]
    fn counts_total_and_lookup() {
        let counts = StateCounts {
            pending: 1,
            processing: 2,
            completed: 3,
            dead: 4,
        };
        assert_eq!(counts.total(), 10);
        assert_eq!(counts.get(JobState::Dead), 4);
    }
}
