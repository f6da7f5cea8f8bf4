//! Error types for the storage layer.

use keyserver_types::UserId;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row failed validation.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// The record changed between load and commit.
    #[error("commit conflict for {user_id}: expected stream id {expected}, found {found}")]
    Conflict {
        user_id: UserId,
        expected: i64,
        found: i64,
    },

    /// A commit tried to move the stream id backwards (or not forwards).
    #[error("stream id regression for {user_id}: current {current}, attempted {attempted}")]
    StreamRegression {
        user_id: UserId,
        current: i64,
        attempted: i64,
    },

    /// The connection mutex was poisoned by a panicking writer.
    #[error("storage lock poisoned")]
    LockPoisoned,
}

impl From<keyserver_types::Error> for StorageError {
    fn from(e: keyserver_types::Error) -> Self {
        StorageError::InvalidData(e.to_string())
    }
}
