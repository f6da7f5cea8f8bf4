//! Worker pool configuration.

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the device list updater.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdaterConfig {
    /// Our own server name. Signals for users on it are rejected.
    pub local_server: String,
    /// Number of concurrent resync workers.
    pub worker_count: usize,
    /// Total attempts per task before giving up on transient failures.
    pub max_attempts: u32,
    /// Backoff before the first retry (ms). Doubles per attempt.
    pub base_backoff_ms: u64,
    /// Upper bound for a single backoff (ms).
    pub max_backoff_ms: u64,
    /// Whether to add up to 10% random jitter to backoff delays.
    pub backoff_jitter: bool,
    /// Timeout for one remote fetch (ms).
    pub request_timeout_ms: u64,
    /// How long a query waits for a triggered resync (ms).
    pub query_timeout_ms: u64,
    /// Interval for re-scanning stale users and flushing the outbox (ms). 0 disables.
    pub rescan_interval_ms: u64,
    /// Capacity of the resync report broadcast channel.
    pub report_capacity: usize,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            local_server: "localhost".to_string(),
            worker_count: 8,
            max_attempts: 5,
            base_backoff_ms: 500,
            max_backoff_ms: 60_000,
            backoff_jitter: true,
            request_timeout_ms: 30_000,
            query_timeout_ms: 10_000,
            rescan_interval_ms: 300_000,
            report_capacity: 256,
        }
    }
}

impl UpdaterConfig {
    /// Retry policy derived from the backoff settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_backoff_ms),
            max_delay: Duration::from_millis(self.max_backoff_ms),
            jitter: self.backoff_jitter,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        (self.rescan_interval_ms > 0).then(|| Duration::from_millis(self.rescan_interval_ms))
    }
}
