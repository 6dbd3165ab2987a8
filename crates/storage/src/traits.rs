//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of bytes for streaming reads.
pub type ByteStream = Pin<Box<dyn Stream<Item = StorageResult<Bytes>> + Send>>;

/// The two data streams of a stored response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamIndex {
    /// Serialized status line and headers.
    Headers,
    Body,
}

impl StreamIndex {
    pub fn as_index(self) -> usize {
        match self {
            Self::Headers => 0,
            Self::Body => 1,
        }
    }
}

/// Response blob store keyed by 64-bit response id.
///
/// Entries are created empty and written at arbitrary offsets. Creating an
/// entry whose key is taken fails with `AlreadyExists`; callers doom the stale
/// entry and create again.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Create an empty entry.
    async fn create_entry(&self, key: i64) -> StorageResult<()>;

    async fn exists(&self, key: i64) -> StorageResult<bool>;

    /// Remove an entry and both of its streams.
    async fn doom_entry(&self, key: i64) -> StorageResult<()>;

    /// Read up to `len` bytes at `offset`. Short reads happen only at the end
    /// of the stream.
    async fn read_data(
        &self,
        key: i64,
        stream: StreamIndex,
        offset: u64,
        len: usize,
    ) -> StorageResult<Bytes>;

    /// Write `data` at `offset`. With `truncate` the stream ends after the
    /// written bytes.
    async fn write_data(
        &self,
        key: i64,
        stream: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> StorageResult<()>;

    async fn data_size(&self, key: i64, stream: StreamIndex) -> StorageResult<u64>;

    async fn entry_count(&self) -> StorageResult<u64>;

    /// Remove every entry.
    async fn clear(&self) -> StorageResult<()>;

    fn backend_name(&self) -> &'static str;

    /// Verify the backend is usable.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
