//! Error types for the sync layer.

use keyserver_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
///
/// See [`crate::retry::FailureClass`] for how each variant is treated by the
/// worker pool.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error talking to a remote server.
    #[error("network error: {0}")]
    Network(String),

    /// Remote request timed out.
    #[error("operation timed out")]
    Timeout,

    /// Remote server is temporarily unable to answer (5xx, rate limited).
    #[error("remote unavailable ({status}): {message}")]
    RemoteUnavailable { status: u16, message: String },

    /// Remote server actively refused the request.
    #[error("remote rejected request ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    /// Remote server does not know the user.
    #[error("user not found on remote server: {0}")]
    UserNotFound(String),

    /// Remote answered with something that is not a valid device list.
    #[error("malformed remote response: {0}")]
    Malformed(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Local data could not be processed (e.g. key material that fails to
    /// encode for fingerprinting).
    #[error("invalid data: {0}")]
    InvalidData(#[from] keyserver_types::Error),

    /// Publishing to the change log failed.
    #[error("publish error: {0}")]
    Publish(String),

    /// A staleness signal was rejected before it reached the queue.
    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Work was abandoned at a shutdown checkpoint.
    #[error("cancelled by shutdown")]
    Cancelled,

    /// The queue no longer accepts work.
    #[error("shutting down")]
    ShuttingDown,

    /// A blocking storage task panicked or was aborted.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(e: tokio::task::JoinError) -> Self {
        SyncError::TaskFailed(e.to_string())
    }
}
