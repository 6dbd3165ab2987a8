//! Database models mapping to the metadata schema.

use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use stowage_core::{Entry, EntryFlags, Namespace, NamespaceType};
use time::OffsetDateTime;

/// One cached application, keyed by manifest URL.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct GroupRecord {
    pub group_id: i64,
    pub origin: String,
    pub manifest_url: String,
    pub creation_time: OffsetDateTime,
    pub last_access_time: OffsetDateTime,
    pub last_full_update_check_time: Option<OffsetDateTime>,
    pub first_evictable_error_time: Option<OffsetDateTime>,
}

/// The newest complete cache of a group.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct CacheRecord {
    pub cache_id: i64,
    pub group_id: i64,
    pub online_wildcard: bool,
    pub update_time: OffsetDateTime,
    pub cache_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct EntryRecord {
    pub cache_id: i64,
    pub url: String,
    pub flags: i64,
    pub response_id: i64,
    pub response_size: i64,
}

impl EntryRecord {
    pub fn new(cache_id: i64, url: impl Into<String>, entry: &Entry) -> Self {
        Self {
            cache_id,
            url: url.into(),
            flags: i64::from(entry.flags.bits()),
            response_id: entry.response_id,
            response_size: entry.response_size,
        }
    }

    pub fn entry_flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(u32::try_from(self.flags).unwrap_or_default())
    }

    pub fn to_entry(&self) -> Entry {
        Entry::new(self.entry_flags(), self.response_id, self.response_size)
    }
}

/// A fallback or intercept namespace of one cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceRecord {
    pub cache_id: i64,
    pub origin: String,
    pub namespace: Namespace,
}

impl<'r> FromRow<'r, SqliteRow> for NamespaceRecord {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let kind: i64 = row.try_get("type")?;
        let kind = NamespaceType::from_i64(kind).ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "type".to_string(),
            source: format!("unknown namespace type {kind}").into(),
        })?;
        Ok(Self {
            cache_id: row.try_get("cache_id")?,
            origin: row.try_get("origin")?,
            namespace: Namespace::new(
                kind,
                row.try_get::<String, _>("namespace_url")?,
                row.try_get::<String, _>("target_url")?,
                row.try_get("is_pattern")?,
            ),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct OnlineWhiteListRecord {
    pub cache_id: i64,
    pub namespace_url: String,
    pub is_pattern: bool,
}

/// Highest ids in use, so allocation resumes past them after a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StorageIds {
    pub last_group_id: i64,
    pub last_cache_id: i64,
    pub last_response_id: i64,
    pub last_deletable_response_rowid: i64,
}

/// Everything written by one commit of a group's newest cache.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub group: GroupRecord,
    pub cache: CacheRecord,
    pub entries: Vec<EntryRecord>,
    pub intercept_namespaces: Vec<NamespaceRecord>,
    pub fallback_namespaces: Vec<NamespaceRecord>,
    pub online_whitelists: Vec<OnlineWhiteListRecord>,
    /// Fail with `QuotaExceeded` when the origin would use more than this.
    pub quota: Option<i64>,
}

/// Result of a successful commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Responses of the replaced cache that the new cache no longer references.
    pub deletable_response_ids: Vec<i64>,
    /// Signed change in the origin's usage.
    pub usage_delta: i64,
}

/// What a group deletion removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupDeletion {
    pub origin: String,
    pub response_ids: Vec<i64>,
    pub freed_bytes: i64,
}
