//! Storage error types.

use thiserror::Error;

/// Storage operation errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("response not found: {0}")]
    NotFound(i64),

    #[error("response already exists: {0}")]
    AlreadyExists(i64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid key: {0}")]
    InvalidKey(i64),

    #[error("invalid range: {0}")]
    InvalidRange(String),

    /// Stored headers could not be decoded.
    #[error("corrupt response {response_id}: {reason}")]
    Corrupt { response_id: i64, reason: String },

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
