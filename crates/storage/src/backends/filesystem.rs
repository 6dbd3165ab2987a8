//! Local filesystem response store.
//!
//! Each response is two files, `<key>.0` (headers) and `<key>.1` (body),
//! sharded into 256 directories by the low byte of the key.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ResponseStore, StreamIndex};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::instrument;

/// Maximum length of a single read (128 MiB).
const MAX_READ_SIZE: usize = 128 * 1024 * 1024;

/// Filesystem response store.
pub struct FilesystemBackend {
    root: PathBuf,
}

impl FilesystemBackend {
    /// Create a new filesystem backend.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, key: i64) -> PathBuf {
        self.root.join(format!("{:02x}", key & 0xff))
    }

    fn stream_path(&self, key: i64, stream: StreamIndex) -> StorageResult<PathBuf> {
        if key <= 0 {
            return Err(StorageError::InvalidKey(key));
        }
        Ok(self
            .shard_dir(key)
            .join(format!("{key}.{}", stream.as_index())))
    }

    fn map_not_found(key: i64) -> impl Fn(std::io::Error) -> StorageError {
        move |e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key)
            } else {
                StorageError::Io(e)
            }
        }
    }
}

#[async_trait]
impl ResponseStore for FilesystemBackend {
    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn create_entry(&self, key: i64) -> StorageResult<()> {
        let headers = self.stream_path(key, StreamIndex::Headers)?;
        let body = self.stream_path(key, StreamIndex::Body)?;
        fs::create_dir_all(self.shard_dir(key)).await?;

        // The header file marks the entry as present.
        fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&headers)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StorageError::AlreadyExists(key)
                } else {
                    StorageError::Io(e)
                }
            })?;
        fs::File::create(&body).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn exists(&self, key: i64) -> StorageResult<bool> {
        let headers = self.stream_path(key, StreamIndex::Headers)?;
        fs::try_exists(&headers).await.map_err(StorageError::Io)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn doom_entry(&self, key: i64) -> StorageResult<()> {
        let headers = self.stream_path(key, StreamIndex::Headers)?;
        let body = self.stream_path(key, StreamIndex::Body)?;
        fs::remove_file(&headers)
            .await
            .map_err(Self::map_not_found(key))?;
        match fs::remove_file(&body).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read_data(
        &self,
        key: i64,
        stream: StreamIndex,
        offset: u64,
        len: usize,
    ) -> StorageResult<Bytes> {
        if len > MAX_READ_SIZE {
            return Err(StorageError::InvalidRange(format!(
                "read of {len} bytes exceeds maximum {MAX_READ_SIZE}"
            )));
        }

        let path = self.stream_path(key, stream)?;
        let mut file = fs::File::open(&path)
            .await
            .map_err(Self::map_not_found(key))?;
        let size = file.metadata().await?.len();
        if offset >= size {
            return Ok(Bytes::new());
        }

        let available = usize::try_from(size - offset).unwrap_or(usize::MAX);
        let mut buf = vec![0u8; len.min(available)];
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn write_data(
        &self,
        key: i64,
        stream: StreamIndex,
        offset: u64,
        data: Bytes,
        truncate: bool,
    ) -> StorageResult<()> {
        let path = self.stream_path(key, stream)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(Self::map_not_found(key))?;

        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        if truncate {
            file.set_len(offset + data.len() as u64).await?;
        }
        file.sync_data().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn data_size(&self, key: i64, stream: StreamIndex) -> StorageResult<u64> {
        let path = self.stream_path(key, stream)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(Self::map_not_found(key))?;
        Ok(metadata.len())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn entry_count(&self) -> StorageResult<u64> {
        let mut count = 0u64;
        let mut shards = fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if file.file_name().to_string_lossy().ends_with(".0") {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn clear(&self) -> StorageResult<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}
