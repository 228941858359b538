use thiserror::Error;

use crate::scheduler::JobState;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {job_id} is {state}, only dead jobs can be requeued")]
    InvalidState { job_id: String, state: JobState },

    #[error("Invalid job id '{0}': expected a UUID")]
    InvalidJobId(String),

    #[error("Invalid config key '{0}', allowed keys: max-retries, backoff-base")]
    InvalidConfigKey(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidConfigValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Unknown job state '{0}', expected pending, processing, completed or dead")]
    InvalidJobState(String),

    #[error("Worker {worker_id} no longer owns job {job_id}")]
    LeaseLost { job_id: String, worker_id: String },

    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Operator mistakes that are rejected before any mutation.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            QueueError::JobNotFound(_)
                | QueueError::InvalidState { .. }
                | QueueError::InvalidJobId(_)
                | QueueError::InvalidConfigKey(_)
                | QueueError::InvalidConfigValue { .. }
                | QueueError::InvalidJobState(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
