//! Group repository trait.

use crate::error::MetadataResult;
use crate::models::GroupRecord;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for groups.
///
/// Lookups overlay last-access times buffered by `lazy_update_last_access_time`.
#[async_trait]
pub trait GroupRepo: Send + Sync {
    async fn find_group(&self, group_id: i64) -> MetadataResult<Option<GroupRecord>>;

    async fn find_group_for_manifest_url(
        &self,
        manifest_url: &str,
    ) -> MetadataResult<Option<GroupRecord>>;

    async fn find_groups_for_origin(&self, origin: &str) -> MetadataResult<Vec<GroupRecord>>;

    async fn find_group_for_cache(&self, cache_id: i64) -> MetadataResult<Option<GroupRecord>>;

    /// Origins that have at least one group.
    async fn find_origins_with_groups(&self) -> MetadataResult<Vec<String>>;

    /// Fails with `AlreadyExists` when the id or manifest URL is taken.
    async fn insert_group(&self, group: &GroupRecord) -> MetadataResult<()>;

    async fn delete_group(&self, group_id: i64) -> MetadataResult<()>;

    /// Write the last-access time immediately.
    async fn update_last_access_time(
        &self,
        group_id: i64,
        time: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// Buffer the last-access time until `commit_lazy_last_access_times`.
    fn lazy_update_last_access_time(&self, group_id: i64, time: OffsetDateTime);

    /// Write all buffered last-access times in one transaction.
    async fn commit_lazy_last_access_times(&self) -> MetadataResult<usize>;

    async fn update_eviction_times(
        &self,
        group_id: i64,
        last_full_update_check_time: Option<OffsetDateTime>,
        first_evictable_error_time: Option<OffsetDateTime>,
    ) -> MetadataResult<()>;
}
