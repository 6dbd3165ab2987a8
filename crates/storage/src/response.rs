//! Typed reader and writer over a single stored response.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ByteStream, ResponseStore, StreamIndex};
use bytes::Bytes;
use std::sync::Arc;
use stowage_core::ResponseInfo;

/// Chunk size for streaming reads (64 KiB).
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Writes one response: headers first, then body bytes appended in order.
///
/// The entry is created lazily on the first write. A stale entry left under
/// the same id is doomed and created again.
pub struct ResponseWriter {
    store: Arc<dyn ResponseStore>,
    response_id: i64,
    created: bool,
    info_size: u64,
    body_size: u64,
}

impl ResponseWriter {
    pub fn new(store: Arc<dyn ResponseStore>, response_id: i64) -> Self {
        Self {
            store,
            response_id,
            created: false,
            info_size: 0,
            body_size: 0,
        }
    }

    pub fn response_id(&self) -> i64 {
        self.response_id
    }

    async fn ensure_created(&mut self) -> StorageResult<()> {
        if self.created {
            return Ok(());
        }
        match self.store.create_entry(self.response_id).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists(id)) => {
                tracing::warn!(response_id = id, "Dooming stale response before rewrite");
                self.store.doom_entry(id).await?;
                self.store.create_entry(id).await?;
            }
            Err(e) => return Err(e),
        }
        self.created = true;
        Ok(())
    }

    /// Write (or replace) the header stream.
    pub async fn write_info(&mut self, info: &ResponseInfo) -> StorageResult<()> {
        self.ensure_created().await?;
        let data = info.to_bytes().map_err(|e| StorageError::Corrupt {
            response_id: self.response_id,
            reason: e.to_string(),
        })?;
        let size = data.len() as u64;
        self.store
            .write_data(
                self.response_id,
                StreamIndex::Headers,
                0,
                Bytes::from(data),
                true,
            )
            .await?;
        self.info_size = size;
        Ok(())
    }

    /// Append body bytes.
    pub async fn write_data(&mut self, data: Bytes) -> StorageResult<()> {
        self.ensure_created().await?;
        let len = data.len() as u64;
        self.store
            .write_data(
                self.response_id,
                StreamIndex::Body,
                self.body_size,
                data,
                false,
            )
            .await?;
        self.body_size += len;
        Ok(())
    }

    /// Header plus body bytes written so far.
    pub fn amount_written(&self) -> u64 {
        self.info_size + self.body_size
    }
}

/// Reads one stored response.
#[derive(Clone)]
pub struct ResponseReader {
    store: Arc<dyn ResponseStore>,
    response_id: i64,
}

impl ResponseReader {
    pub fn new(store: Arc<dyn ResponseStore>, response_id: i64) -> Self {
        Self { store, response_id }
    }

    pub fn response_id(&self) -> i64 {
        self.response_id
    }

    pub async fn read_info(&self) -> StorageResult<ResponseInfo> {
        let size = self.info_size().await?;
        let len = usize::try_from(size).map_err(|_| StorageError::Corrupt {
            response_id: self.response_id,
            reason: format!("header stream of {size} bytes"),
        })?;
        let data = self
            .store
            .read_data(self.response_id, StreamIndex::Headers, 0, len)
            .await?;
        ResponseInfo::from_bytes(&data).map_err(|e| StorageError::Corrupt {
            response_id: self.response_id,
            reason: e.to_string(),
        })
    }

    pub async fn info_size(&self) -> StorageResult<u64> {
        self.store
            .data_size(self.response_id, StreamIndex::Headers)
            .await
    }

    pub async fn body_size(&self) -> StorageResult<u64> {
        self.store
            .data_size(self.response_id, StreamIndex::Body)
            .await
    }

    pub async fn read_data(&self, offset: u64, len: usize) -> StorageResult<Bytes> {
        self.store
            .read_data(self.response_id, StreamIndex::Body, offset, len)
            .await
    }

    /// Read the whole body.
    pub async fn read_to_end(&self) -> StorageResult<Bytes> {
        let size = self.body_size().await?;
        let mut body = Vec::with_capacity(usize::try_from(size).unwrap_or_default());
        let mut offset = 0u64;
        while offset < size {
            let chunk = self.read_data(offset, READ_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            body.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(body))
    }

    /// Stream the body in fixed-size chunks.
    pub fn into_body_stream(self) -> ByteStream {
        let stream = async_stream::try_stream! {
            let mut offset = 0u64;
            loop {
                let chunk = self.read_data(offset, READ_CHUNK_SIZE).await?;
                if chunk.is_empty() {
                    break;
                }
                offset += chunk.len() as u64;
                yield chunk;
            }
        };
        Box::pin(stream)
    }
}
