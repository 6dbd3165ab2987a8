//! Entry repository trait.

use crate::error::MetadataResult;
use crate::models::EntryRecord;
use async_trait::async_trait;
use stowage_core::EntryFlags;

/// Repository for cache entries.
#[async_trait]
pub trait EntryRepo: Send + Sync {
    async fn find_entries_for_cache(&self, cache_id: i64) -> MetadataResult<Vec<EntryRecord>>;

    /// Entries for `url` across all caches.
    async fn find_entries_for_url(&self, url: &str) -> MetadataResult<Vec<EntryRecord>>;

    async fn find_entry(&self, cache_id: i64, url: &str) -> MetadataResult<Option<EntryRecord>>;

    async fn insert_entry(&self, entry: &EntryRecord) -> MetadataResult<()>;

    /// Merge `flags` into the entry's roles.
    async fn add_entry_flags(
        &self,
        cache_id: i64,
        url: &str,
        flags: EntryFlags,
    ) -> MetadataResult<()>;

    async fn delete_entries_for_cache(&self, cache_id: i64) -> MetadataResult<u64>;

    async fn find_response_ids_for_cache(&self, cache_id: i64) -> MetadataResult<Vec<i64>>;
}
