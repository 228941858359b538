use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{QueueError, Result};
use crate::scheduler::WorkerRegistry;
use crate::store::{ControlChannel, Store};
use crate::worker::{Worker, WorkerReport};

/// Starts a set of workers in this process and waits for all of them.
///
/// Alongside the workers it runs the lease reaper, which hands jobs held by
/// dead workers (from any process) back to the queue.
pub struct Supervisor {
    store: Store,
    config: WorkerConfig,
    shutdown: CancellationToken,
}

impl Supervisor {
    pub fn new(store: Store, config: WorkerConfig, shutdown: CancellationToken) -> Self {
        Self {
            store,
            config,
            shutdown,
        }
    }

    /// Raise the shared stop flag. Running workers exit after their current job.
    pub async fn stop(store: &Store) -> Result<()> {
        ControlChannel::new(store.clone()).request_stop().await?;
        tracing::info!("Stop signal sent to all workers");
        Ok(())
    }

    /// Run every worker to completion.
    ///
    /// # Errors
    ///
    /// Fails when the control row cannot be prepared, or when not a single
    /// worker managed to register.
    pub async fn run(self) -> Result<Vec<WorkerReport>> {
        let stop_pending = ControlChannel::new(self.store.clone())
            .ensure(self.config.reset_stop)
            .await?;
        if stop_pending {
            tracing::warn!("Stop flag is already set, workers will exit at once (use --reset-stop to clear it)");
        }

        let reaper_token = self.shutdown.child_token();
        let reaper = self.config.lease_timeout().map(|timeout| {
            let registry = WorkerRegistry::new(self.store.clone());
            let token = reaper_token.clone();
            tokio::spawn(async move { Self::reaper_loop(registry, timeout, token).await })
        });

        tracing::info!(count = self.config.count, "Starting workers");

        let mut handles = Vec::with_capacity(self.config.count);
        for _ in 0..self.config.count {
            let worker = Worker::new(self.store.clone(), self.config.clone(), self.shutdown.clone());
            let jitter = startup_jitter(self.config.startup_jitter_ms);
            let shutdown = self.shutdown.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(jitter) => {}
                    _ = shutdown.cancelled() => {}
                }
                worker.run().await
            }));
        }

        let results = futures::future::join_all(handles).await;

        reaper_token.cancel();
        if let Some(reaper) = reaper {
            let _ = reaper.await;
        }

        let mut reports = Vec::with_capacity(results.len());
        let mut first_error: Option<QueueError> = None;
        for result in results {
            match result {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Worker failed to start");
                    first_error.get_or_insert(e);
                }
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
            }
        }

        if reports.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let processed: u64 = reports.iter().map(|r| r.processed).sum();
        tracing::info!(workers = reports.len(), processed, "All workers stopped");
        Ok(reports)
    }

    async fn reaper_loop(registry: WorkerRegistry, timeout: Duration, cancel: CancellationToken) {
        let period = (timeout / 3).clamp(Duration::from_millis(50), Duration::from_secs(10));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = registry.reclaim_expired(timeout).await {
                        tracing::warn!(error = %e, "Lease sweep failed");
                    }
                }
            }
        }
    }
}

fn startup_jitter(max_ms: u64) -> Duration {
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
