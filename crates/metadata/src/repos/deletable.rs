//! Queue of response blobs waiting to be deleted.

use crate::error::MetadataResult;
use async_trait::async_trait;

#[async_trait]
pub trait DeletableResponseRepo: Send + Sync {
    /// Oldest queued ids with a rowid at or below `max_rowid`.
    async fn get_deletable_response_ids(
        &self,
        max_rowid: i64,
        limit: i64,
    ) -> MetadataResult<Vec<i64>>;

    async fn insert_deletable_response_ids(&self, response_ids: &[i64]) -> MetadataResult<()>;

    async fn delete_deletable_response_ids(&self, response_ids: &[i64]) -> MetadataResult<()>;
}
