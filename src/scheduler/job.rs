use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{QueueError, Result};
use crate::store::{from_millis, to_millis};

/// Columns selected whenever a full job row is read back.
pub(crate) const JOB_COLUMNS: &str =
    "id, command, state, attempts, max_retries, owner, next_run_at, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    /// `dead` is terminal too, but an operator can requeue it.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            _ => Err(QueueError::InvalidJobState(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub state: JobState,
    pub attempts: u32,
    pub max_retries: u32,
    /// Worker holding the lease; set only while `processing`.
    pub owner: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(command: impl Into<String>, max_retries: u32) -> Self {
        Self::with_id(Uuid::new_v4(), command, max_retries, Utc::now())
    }

    pub fn with_id(
        id: Uuid,
        command: impl Into<String>,
        max_retries: u32,
        created_at: DateTime<Utc>,
    ) -> Self {
        // Stored timestamps carry millisecond precision, keep the in-memory copy identical.
        let created_at = from_millis(to_millis(created_at)).unwrap_or(created_at);
        Self {
            id,
            command: command.into(),
            state: JobState::Pending,
            attempts: 0,
            max_retries,
            owner: None,
            next_run_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self> {
        let id: String = row.try_get("id")?;
        let id = Uuid::parse_str(&id)
            .map_err(|e| QueueError::Corrupt(format!("job id '{}': {}", id, e)))?;
        let state: String = row.try_get("state")?;
        let state = state
            .parse::<JobState>()
            .map_err(|_| QueueError::Corrupt(format!("job {} has state '{}'", id, state)))?;

        let next_run_at = row
            .try_get::<Option<i64>, _>("next_run_at")?
            .map(|ms| timestamp(id, "next_run_at", ms))
            .transpose()?;

        Ok(Self {
            id,
            command: row.try_get("command")?,
            state,
            attempts: counter(id, "attempts", row.try_get("attempts")?)?,
            max_retries: counter(id, "max_retries", row.try_get("max_retries")?)?,
            owner: row.try_get("owner")?,
            next_run_at,
            created_at: timestamp(id, "created_at", row.try_get("created_at")?)?,
            updated_at: timestamp(id, "updated_at", row.try_get("updated_at")?)?,
        })
    }
}

fn counter(id: Uuid, column: &str, value: i64) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| QueueError::Corrupt(format!("job {} has {} = {}", id, column, value)))
}

fn timestamp(id: Uuid, column: &str, ms: i64) -> Result<DateTime<Utc>> {
    from_millis(ms).ok_or_else(|| QueueError::Corrupt(format!("job {} has {} = {}", id, column, ms)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_pending_without_owner() {
        let job = Job::new("echo hello", 3);
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 3);
        assert!(job.owner.is_none());
        assert!(job.next_run_at.is_none());
        assert_eq!(job.created_at, job.updated_at);
    }

    #[test]
    fn state_round_trips_through_text() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(" DEAD ".parse::<JobState>().unwrap(), JobState::Dead);
        assert!(matches!(
            "failed".parse::<JobState>(),
            Err(QueueError::InvalidJobState(_))
        ));
    }

    #[test]
    fn only_completed_and_dead_are_terminal() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Dead.is_terminal());
    }
}
