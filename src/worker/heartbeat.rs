use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::scheduler::WorkerRegistry;

/// Keeps a worker's heartbeat fresh while it is busy running a command.
pub struct HeartbeatSender {
    interval: Duration,
}

impl HeartbeatSender {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Heartbeat until `cancel` fires. Failures are logged and retried on the next tick.
    pub async fn run(&self, registry: WorkerRegistry, worker_id: String, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = registry.heartbeat(&worker_id).await {
                        tracing::warn!(worker_id = %worker_id, error = %e, "Heartbeat failed");
                    }
                }
            }
        }
    }

    /// Run in the background until the returned guard is stopped or dropped.
    pub fn spawn(self, registry: WorkerRegistry, worker_id: String) -> HeartbeatGuard {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { self.run(registry, worker_id, token).await });
        HeartbeatGuard { cancel, handle: Some(handle) }
    }
}

pub struct HeartbeatGuard {
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatGuard {
    /// Stop ticking and wait for an in-flight heartbeat to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
