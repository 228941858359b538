use std::path::PathBuf;
use std::time::Duration;

/// Location and tuning of the shared SQLite store.
///
/// Every worker, in this process or another, coordinates through the same
/// database file, so the connection is tuned for contention:
/// - WAL journaling so readers never block the single writer
/// - A busy timeout so racing claims wait for the lock instead of failing
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the database file. Parent directories are created on connect.
    pub path: PathBuf,
    /// How long a statement waits on a locked database before giving up.
    pub busy_timeout_ms: u64,
    /// Upper bound on pooled connections shared by all workers.
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/queue.db"),
            busy_timeout_ms: 5000,
            max_connections: 8,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Raise the pool size to at least `min_connections`, never lowering it.
    pub fn with_min_connections(self, min_connections: u32) -> Self {
        let current = self.max_connections;
        self.with_max_connections(current.max(min_connections))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// Settings for a supervisor and the workers it spawns.
///
/// Retry policy is not here: `max-retries` and `backoff-base` live in the
/// config table so operators can change them while workers run.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of workers to spawn.
    pub count: usize,
    /// Jobs each worker executes before exiting. 0 means unbounded.
    pub job_limit: u64,
    /// Sleep between polls when no job is eligible.
    pub idle_sleep_ms: u64,
    /// Heartbeat cadence while a command is running.
    pub heartbeat_interval_ms: u64,
    /// Upper bound of the random delay before a worker's first claim.
    pub startup_jitter_ms: u64,
    /// Heartbeat age after which a worker's job is reclaimed. 0 disables reclaiming.
    pub lease_timeout_ms: u64,
    /// Clear a stop signal left over from an earlier `--stop` at startup.
    pub reset_stop: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 1,
            job_limit: 0,
            idle_sleep_ms: 3000,
            heartbeat_interval_ms: 1000,
            startup_jitter_ms: 250,
            lease_timeout_ms: 30_000,
            reset_stop: false,
        }
    }
}

impl WorkerConfig {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            ..Default::default()
        }
    }

    pub fn with_job_limit(mut self, job_limit: u64) -> Self {
        self.job_limit = job_limit;
        self
    }

    pub fn with_idle_sleep_ms(mut self, idle_sleep_ms: u64) -> Self {
        self.idle_sleep_ms = idle_sleep_ms;
        self
    }

    pub fn with_lease_timeout_ms(mut self, lease_timeout_ms: u64) -> Self {
        self.lease_timeout_ms = lease_timeout_ms;
        self
    }

    pub fn with_startup_jitter_ms(mut self, startup_jitter_ms: u64) -> Self {
        self.startup_jitter_ms = startup_jitter_ms;
        self
    }

    pub fn with_reset_stop(mut self, reset_stop: bool) -> Self {
        self.reset_stop = reset_stop;
        self
    }

    pub fn job_limit(&self) -> Option<u64> {
        (self.job_limit > 0).then_some(self.job_limit)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    /// Never slower than the idle sleep, so liveness data stays as fresh as the poll loop.
    pub fn heartbeat_interval(&self) -> Duration {
        let ms = self.heartbeat_interval_ms.min(self.idle_sleep_ms).max(10);
        Duration::from_millis(ms)
    }

    /// Never shorter than three heartbeat intervals, so a live worker always
    /// refreshes its lease before the reaper can see it as expired.
    pub fn lease_timeout(&self) -> Option<Duration> {
        (self.lease_timeout_ms > 0).then(|| {
            Duration::from_millis(self.lease_timeout_ms).max(self.heartbeat_interval() * 3)
        })
    }
}
