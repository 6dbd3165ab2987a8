//! Cache repository trait.

use crate::error::MetadataResult;
use crate::models::CacheRecord;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Repository for caches and the usage figures derived from them.
#[async_trait]
pub trait CacheRepo: Send + Sync {
    async fn find_cache(&self, cache_id: i64) -> MetadataResult<Option<CacheRecord>>;

    async fn find_cache_for_group(&self, group_id: i64) -> MetadataResult<Option<CacheRecord>>;

    async fn find_caches_for_origin(&self, origin: &str) -> MetadataResult<Vec<CacheRecord>>;

    async fn insert_cache(&self, cache: &CacheRecord) -> MetadataResult<()>;

    async fn delete_cache(&self, cache_id: i64) -> MetadataResult<()>;

    /// Total cache size of every group of the origin.
    async fn get_origin_usage(&self, origin: &str) -> MetadataResult<i64>;

    async fn get_all_origin_usage(&self) -> MetadataResult<BTreeMap<String, i64>>;
}
