use std::time::Duration;

use serde::Serialize;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKOFF_BASE: u32 = 2;

/// Retry policy in effect when a job fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

/// What a failed attempt turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to `pending`, eligible again after `delay`.
    Retry { attempts: u32, delay: Duration },
    /// Retries exhausted.
    Dead { attempts: u32 },
}

impl RetryPolicy {
    /// `backoff_base ^ attempts` seconds, saturating instead of overflowing.
    pub fn backoff(&self, attempts: u32) -> Duration {
        Duration::from_secs(u64::from(self.backoff_base).saturating_pow(attempts))
    }

    /// Decide the fate of a job that had `attempts` failures before this one.
    pub fn on_failure(&self, attempts: u32) -> FailureOutcome {
        let attempts = attempts.saturating_add(1);
        if attempts >= self.max_retries {
            FailureOutcome::Dead { attempts }
        } else {
            FailureOutcome::Retry {
                attempts,
                delay: self.backoff(attempts),
            }
        }
    }

    /// Delays a fresh job would wait through before going dead.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..self.max_retries.min(16)).map(|n| self.backoff(n)).collect()
    }
}
