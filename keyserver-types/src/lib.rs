//! Core type definitions for the keyserver.
//!
//! This crate defines the plain data types shared by the store, the sync
//! engine and downstream consumers:
//! - User, server and device identifiers
//! - Device key material and per-user device list state
//! - Key change records as they appear on the change stream

mod change;
mod device;
mod ids;

pub use change::{ChangeType, DeviceChange, KeyChangeRecord, PendingChange};
pub use device::{DeviceKeys, DeviceListState};
pub use ids::{DeviceId, ServerName, UserId};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    #[error("invalid server name: {0}")]
    InvalidServerName(String),

    #[error("invalid device id: {0}")]
    InvalidDeviceId(String),

    #[error("unknown change type: {0}")]
    UnknownChangeType(String),
}
