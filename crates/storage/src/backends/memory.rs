//! In-process response store.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ResponseStore, StreamIndex};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Response store holding every entry in memory.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<i64, [Vec<u8>; 2]>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ResponseStore for MemoryBackend {
    async fn create_entry(&self, key: i64) -> StorageResult<()> {
        if key <= 0 {
            return Err(StorageError::InvalidKey(key));
        }
        let mut entries = self.entries.write().await;
        if entries.contains_key(&key) {
            return Err(StorageError::AlreadyExists(key));
        }
        entries.insert(key, [Vec::new(), Vec::new()]);
        Ok(())
    }

    async fn exists(&self, key: i64) -> StorageResult<bool> {
        Ok(self.entries.read().await.contains_key(&key))
    }

    async fn doom_entry(&self, key: i64) -> StorageResult<()> {
        self.entries
            .write()
            .await
            .remove(&key)
            .map(|_| ())
            .ok_or(StorageError::NotFound(key))
    }

    async fn read_data(
        &self,
        key: i64,
        stream: StreamIndex,
        offset: u64,
        len: usize,
    ) -> StorageResult<Bytes> {
        let entries = self.entries.read().await;
        let data = &entries.get(&key).ok_or(StorageError::NotFound(key))?[stream.as_index()];
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(len).min(data.len());
        Ok(Bytes::copy_from_slice(&data[start..end]))
    }

    async fn write_data(
        &self,
        key: i64,
        stream: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> StorageResult<()> {
        let offset = usize::try_from(offset)
            .map_err(|_| StorageError::InvalidRange(format!("offset {offset} too large")))?;
        let mut entries = self.entries.write().await;
        let target =
            &mut entries.get_mut(&key).ok_or(StorageError::NotFound(key))?[stream.as_index()];

        let end = offset + data.len();
        if target.len() < end {
            target.resize(end, 0);
        }
        target[offset..end].copy_from_slice(&data);
        if truncate {
            target.truncate(end);
        }
        Ok(())
    }

    async fn data_size(&self, key: i64, stream: StreamIndex) -> StorageResult<u64> {
        let entries = self.entries.read().await;
        let data = &entries.get(&key).ok_or(StorageError::NotFound(key))?[stream.as_index()];
        Ok(data.len() as u64)
    }

    async fn entry_count(&self) -> StorageResult<u64> {
        Ok(self.entries.read().await.len() as u64)
    }

    async fn clear(&self) -> StorageResult<()> {
        self.entries.write().await.clear();
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
