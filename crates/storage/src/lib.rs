//! Response blob storage for the stowage offline cache.
//!
//! This crate provides:
//! - The [`ResponseStore`] contract: 64-bit keys, a header stream and a body stream
//! - Typed [`ResponseWriter`] / [`ResponseReader`] over a single response
//! - Backends: local filesystem and in-memory

pub mod backends;
pub mod error;
pub mod response;
pub mod traits;

pub use backends::{filesystem::FilesystemBackend, memory::MemoryBackend};
pub use error::{StorageError, StorageResult};
pub use response::{ResponseReader, ResponseWriter};
pub use traits::{ByteStream, ResponseStore, StreamIndex};

use std::sync::Arc;
use stowage_core::config::StorageConfig;

/// Create a response store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ResponseStore>> {
    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemBackend::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}
