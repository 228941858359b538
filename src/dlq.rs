use futures::stream::{BoxStream, StreamExt};
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::scheduler::job::{Job, JOB_COLUMNS};
use crate::scheduler::JobQueue;
use crate::store::{now_millis, ConfigStore, PolicyKey, Store};

/// Jobs that exhausted their retries, and the operator's way back out.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    store: Store,
    queue: JobQueue,
    settings: ConfigStore,
}

impl DeadLetterQueue {
    pub fn new(store: Store) -> Self {
        Self {
            queue: JobQueue::new(store.clone()),
            settings: ConfigStore::new(store.clone()),
            store,
        }
    }

    /// Dead jobs, most recently failed first.
    ///
    /// Rows are fetched lazily from a fresh query on every call.
    pub fn list_dead(&self) -> BoxStream<'_, Result<Job>> {
        sqlx::query(LIST_DEAD)
            .fetch(self.store.pool())
            .map(|row| row.map_err(QueueError::from).and_then(|row| Job::from_row(&row)))
            .boxed()
    }

    /// Parse `job_id` and requeue it.
    pub async fn requeue(&self, job_id: &str) -> Result<Job> {
        let id = Uuid::parse_str(job_id.trim())
            .map_err(|_| QueueError::InvalidJobId(job_id.to_string()))?;
        self.requeue_id(id).await
    }

    /// `dead -> pending` with a clean retry budget taken from current config.
    ///
    /// Rejected without any change when the job does not exist or is not dead.
    pub async fn requeue_id(&self, id: Uuid) -> Result<Job> {
        let max_retries = self.settings.get(PolicyKey::MaxRetries).await?.value;

        let sql = format!(
            "UPDATE jobs SET state = 'pending', attempts = 0, max_retries = ?2, owner = NULL, \
                 next_run_at = NULL, updated_at = ?3 \
             WHERE id = ?1 AND state = 'dead' \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .bind(i64::from(max_retries))
            .bind(now_millis())
            .fetch_optional(self.store.pool())
            .await?;

        if let Some(row) = row {
            let job = Job::from_row(&row)?;
            tracing::info!(job_id = %job.id, max_retries, "Dead job requeued");
            return Ok(job);
        }

        match self.queue.get_job(&id).await? {
            None => Err(QueueError::JobNotFound(id.to_string())),
            Some(job) => Err(QueueError::InvalidState {
                job_id: id.to_string(),
                state: job.state,
            }),
        }
    }
}

const LIST_DEAD: &str = "SELECT id, command, state, attempts, max_retries, owner, next_run_at, created_at, updated_at \
     FROM jobs WHERE state = 'dead' ORDER BY updated_at DESC, id";

#[cfg(test)]
mod tests {
    #[test]
    fn list_query_selects_every_job_column() {
        assert!(super::LIST_DEAD.starts_with(&format!("SELECT {} FROM", super::JOB_COLUMNS)));
    }
}
