//! Key change records.
//!
//! `DeviceChange` is what the engine computes from a diff, `PendingChange`
//! is the outbox row written with the store commit, and `KeyChangeRecord`
//! is the published, positioned entry consumers read.

use crate::{DeviceId, Error, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of change observed for a device.
///
/// Variant order is the emission order within one resync: removals, then
/// updates, then additions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Removed,
    Updated,
    Added,
}

impl ChangeType {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Removed => "removed",
            ChangeType::Updated => "updated",
            ChangeType::Added => "added",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "removed" => Ok(ChangeType::Removed),
            "updated" => Ok(ChangeType::Updated),
            "added" => Ok(ChangeType::Added),
            other => Err(Error::UnknownChangeType(other.to_string())),
        }
    }
}

/// A single device-level difference between local and remote state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DeviceChange {
    pub change_type: ChangeType,
    pub device_id: DeviceId,
}

impl DeviceChange {
    pub fn new(device_id: DeviceId, change_type: ChangeType) -> Self {
        Self {
            change_type,
            device_id,
        }
    }
}

/// A committed change that has not yet been appended to the change stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingChange {
    /// Global commit sequence, assigned inside the store transaction.
    pub seq: i64,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub change_type: ChangeType,
    /// Stream ID of the device list commit that produced this change.
    pub stream_id: i64,
}

/// A published entry on the key change stream.
///
/// Consumers must be idempotent on `(user_id, device_id, position)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyChangeRecord {
    /// Global, strictly increasing stream position.
    pub position: i64,
    pub user_id: UserId,
    pub device_id: DeviceId,
    pub change_type: ChangeType,
}
