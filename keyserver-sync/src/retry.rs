//! Failure classification and backoff.
//!
//! Every error reaching the worker pool is mapped to exactly one
//! [`FailureClass`]; the pool's reaction depends only on that class, so the
//! policy can be tested without a network.

use crate::error::SyncError;
use keyserver_storage::StorageError;
use rand::Rng;
use std::time::Duration;

/// How a failed resync is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Retried with backoff until attempts run out.
    Transient,
    /// Resolved as an empty, non-stale device list. Not retried.
    Permanent,
    /// Store invariant broken. Fatal to this task only.
    Invariant,
    /// Abandoned at a shutdown checkpoint. The record stays stale.
    Cancelled,
}

impl SyncError {
    /// Classifies this error for the retry state machine.
    pub fn class(&self) -> FailureClass {
        match self {
            SyncError::Network(_)
            | SyncError::Timeout
            | SyncError::RemoteUnavailable { .. }
            | SyncError::Publish(_)
            | SyncError::TaskFailed(_) => FailureClass::Transient,

            SyncError::RemoteRejected { .. }
            | SyncError::UserNotFound(_)
            | SyncError::Malformed(_)
            | SyncError::InvalidSignal(_) => FailureClass::Permanent,

            SyncError::Storage(e) => match e {
                StorageError::Database(_) => FailureClass::Transient,
                StorageError::Conflict { .. }
                | StorageError::StreamRegression { .. }
                | StorageError::InvalidData(_)
                | StorageError::Serialization(_)
                | StorageError::LockPoisoned => FailureClass::Invariant,
            },

            SyncError::InvalidData(_) | SyncError::Config(_) => FailureClass::Invariant,

            SyncError::Cancelled | SyncError::ShuttingDown => FailureClass::Cancelled,
        }
    }

    /// Shorthand for `class() == Transient`.
    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Exponential backoff bounded by an attempt budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Cap for any single delay.
    pub max_delay: Duration,
    /// Adds up to 10% random jitter when set.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `failures`-th failed attempt (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }

    /// Whether `failures` failed attempts use up the budget.
    pub fn exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }
}
