//! Worker loop: claim, execute, record the outcome, repeat.
//!
//! A worker coordinates with its peers only through the store:
//! - **Claiming** goes through [`JobQueue::claim_next`], which never hands the same job to two workers
//! - **Liveness** is its heartbeat row, refreshed every loop pass and while a command runs
//! - **Stopping** is the shared stop flag, checked at the top of every pass
//!
//! # Execution Flow
//!
//! 1. Check the stop flag and the shutdown token
//! 2. Heartbeat, check the job limit, then claim the oldest eligible job (or sleep when there is none)
//! 3. [`JobExecutor::execute`] runs the command through the shell
//! 4. Exit 0 completes the job; anything else goes through the retry policy
//!
//! A store error never ends the worker. It is logged, the worker sleeps,
//! and the pass is retried. An outcome that could not be written is kept and
//! written before anything else is claimed.

pub mod executor;
pub mod heartbeat;

pub use executor::{ExecutionResult, JobExecutor};
pub use heartbeat::HeartbeatSender;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{QueueError, Result};
use crate::scheduler::{Job, JobQueue, JobState, WorkerRegistry};
use crate::store::{ConfigStore, ControlChannel, Store};

/// Why a worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopRequested,
    Shutdown,
    LimitReached,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub worker_id: String,
    /// Commands executed, whatever their outcome.
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub dead: u64,
    pub reason: ExitReason,
}

/// A job that ran but whose outcome is not yet in the store.
struct Finished {
    job: Job,
    result: ExecutionResult,
}

pub struct Worker {
    id: String,
    config: WorkerConfig,
    queue: JobQueue,
    registry: WorkerRegistry,
    control: ControlChannel,
    settings: ConfigStore,
    executor: JobExecutor,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(store: Store, config: WorkerConfig, shutdown: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            config,
            queue: JobQueue::new(store.clone()),
            registry: WorkerRegistry::new(store.clone()),
            control: ControlChannel::new(store.clone()),
            settings: ConfigStore::new(store),
            executor: JobExecutor::new(),
            shutdown,
        }
    }

    /// Run until stopped. Only a failed registration is returned as an error.
    pub async fn run(self) -> Result<WorkerReport> {
        self.registry.register(&self.id).await?;
        tracing::info!(worker_id = %self.id, limit = ?self.config.job_limit(), "Worker started");

        let mut report = WorkerReport {
            worker_id: self.id.clone(),
            processed: 0,
            completed: 0,
            retried: 0,
            dead: 0,
            reason: ExitReason::Shutdown,
        };
        let mut unreported: Option<Finished> = None;

        report.reason = loop {
            if let Some(finished) = unreported.take() {
                if let Err(e) = self.record(&finished, &mut report).await {
                    if self.shutdown.is_cancelled() {
                        tracing::error!(
                            worker_id = %self.id,
                            job_id = %finished.job.id,
                            error = %e,
                            "Giving up on job outcome at shutdown, job will be reclaimed after its lease expires"
                        );
                        break ExitReason::Shutdown;
                    }
                    tracing::warn!(worker_id = %self.id, job_id = %finished.job.id, error = %e, "Failed to record job outcome");
                    unreported = Some(finished);
                    self.idle().await;
                    continue;
                }
            }

            if self.shutdown.is_cancelled() {
                break ExitReason::Shutdown;
            }
            match self.control.is_stop_requested().await {
                Ok(true) => break ExitReason::StopRequested,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(worker_id = %self.id, error = %e, "Failed to read stop flag");
                    self.idle().await;
                    continue;
                }
            }
            if let Err(e) = self.registry.heartbeat(&self.id).await {
                tracing::warn!(worker_id = %self.id, error = %e, "Heartbeat failed");
            }

            if self.config.job_limit().is_some_and(|limit| report.processed >= limit) {
                break ExitReason::LimitReached;
            }

            match self.queue.claim_next(&self.id).await {
                Ok(Some(job)) => {
                    let finished = self.execute(job).await;
                    report.processed += 1;
                    if let Err(e) = self.record(&finished, &mut report).await {
                        tracing::warn!(worker_id = %self.id, job_id = %finished.job.id, error = %e, "Failed to record job outcome");
                        unreported = Some(finished);
                    }
                }
                Ok(None) => {
                    tracing::debug!(worker_id = %self.id, "No eligible jobs");
                    self.idle().await;
                }
                Err(e) => {
                    tracing::warn!(worker_id = %self.id, error = %e, "Failed to claim job");
                    self.idle().await;
                }
            }
        };

        if let Err(e) = self.registry.deregister(&self.id).await {
            tracing::warn!(worker_id = %self.id, error = %e, "Failed to deregister worker");
        }
        tracing::info!(
            worker_id = %self.id,
            reason = ?report.reason,
            processed = report.processed,
            "Worker stopped"
        );

        Ok(report)
    }

    async fn execute(&self, job: Job) -> Finished {
        let heartbeat = HeartbeatSender::new(self.config.heartbeat_interval())
            .spawn(self.registry.clone(), self.id.clone());
        let result = self.executor.execute(job.id, &job.command).await;
        heartbeat.stop().await;

        Finished { job, result }
    }

    /// Write a finished job's transition. Losing the lease is logged, not retried.
    async fn record(&self, finished: &Finished, report: &mut WorkerReport) -> Result<()> {
        let Finished { job, result } = finished;

        let outcome = if result.success {
            self.queue.complete(job, &self.id).await
        } else {
            let policy = self.settings.retry_policy().await?;
            tracing::debug!(job_id = %job.id, error = ?result.error, "Command failed");
            self.queue.fail(job, &self.id, &policy).await
        };

        match outcome {
            Ok(updated) => {
                tracing::info!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    state = %updated.state,
                    attempts = updated.attempts,
                    elapsed_ms = result.duration.as_millis() as u64,
                    "Job outcome recorded"
                );
                match updated.state {
                    JobState::Completed => report.completed += 1,
                    JobState::Pending => report.retried += 1,
                    JobState::Dead => report.dead += 1,
                    JobState::Processing => {}
                }
                Ok(())
            }
            Err(e @ QueueError::LeaseLost { .. }) => {
                tracing::warn!(worker_id = %self.id, job_id = %job.id, error = %e, "Discarding outcome of reclaimed job");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Sleep between polls, waking early on shutdown.
    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.idle_sleep()) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}
