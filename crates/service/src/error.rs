//! Service error types.

use stowage_metadata::MetadataError;
use stowage_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the storage façade and the service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("metadata error: {0}")]
    Metadata(MetadataError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] stowage_core::Error),

    /// The metadata store could not be recovered.
    #[error("offline cache storage is disabled")]
    Disabled,

    /// Distinct from I/O failures so callers can tell "full" from "broken".
    #[error("quota exceeded for {origin}: {usage} bytes would exceed {quota}")]
    QuotaExceeded {
        origin: String,
        usage: i64,
        quota: i64,
    },

    #[error("no group for manifest {0}")]
    GroupNotFound(String),

    #[error("cache not found: {0}")]
    CacheNotFound(i64),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<MetadataError> for ServiceError {
    fn from(e: MetadataError) -> Self {
        match e {
            MetadataError::Disabled => ServiceError::Disabled,
            MetadataError::QuotaExceeded {
                origin,
                usage,
                quota,
            } => ServiceError::QuotaExceeded {
                origin,
                usage,
                quota,
            },
            other => ServiceError::Metadata(other),
        }
    }
}

impl From<url::ParseError> for ServiceError {
    fn from(e: url::ParseError) -> Self {
        ServiceError::InvalidUrl(e.to_string())
    }
}

/// Result type for service operations.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;
