//! Namespace and online whitelist repository trait.

use crate::error::MetadataResult;
use crate::models::{NamespaceRecord, OnlineWhiteListRecord};
use async_trait::async_trait;

/// Intercept and fallback namespaces, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NamespaceSet {
    pub intercepts: Vec<NamespaceRecord>,
    pub fallbacks: Vec<NamespaceRecord>,
}

#[async_trait]
pub trait NamespaceRepo: Send + Sync {
    async fn find_namespaces_for_cache(&self, cache_id: i64) -> MetadataResult<NamespaceSet>;

    async fn find_namespaces_for_origin(&self, origin: &str) -> MetadataResult<NamespaceSet>;

    async fn insert_namespace(&self, record: &NamespaceRecord) -> MetadataResult<()>;

    async fn delete_namespaces_for_cache(&self, cache_id: i64) -> MetadataResult<u64>;

    async fn find_online_whitelist_for_cache(
        &self,
        cache_id: i64,
    ) -> MetadataResult<Vec<OnlineWhiteListRecord>>;

    async fn insert_online_whitelist(&self, record: &OnlineWhiteListRecord)
    -> MetadataResult<()>;

    async fn delete_online_whitelist_for_cache(&self, cache_id: i64) -> MetadataResult<u64>;
}
