//! Enumeration records returned by `get_all_info`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Summary of one group's newest cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCacheInfo {
    pub manifest_url: String,
    pub group_id: i64,
    pub cache_id: i64,
    #[serde(with = "time::serde::timestamp")]
    pub creation_time: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub last_access_time: OffsetDateTime,
    #[serde(with = "time::serde::timestamp")]
    pub last_update_time: OffsetDateTime,
    /// Total bytes of the cache's entries.
    pub size: i64,
}

/// All known caches, grouped by origin.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppCacheInfoCollection {
    pub infos_by_origin: BTreeMap<String, Vec<AppCacheInfo>>,
}

impl AppCacheInfoCollection {
    pub fn push(&mut self, origin: impl Into<String>, info: AppCacheInfo) {
        self.infos_by_origin
            .entry(origin.into())
            .or_default()
            .push(info);
    }

    pub fn is_empty(&self) -> bool {
        self.infos_by_origin.is_empty()
    }

    /// Number of caches across all origins.
    pub fn len(&self) -> usize {
        self.infos_by_origin.values().map(Vec::len).sum()
    }

    pub fn total_size(&self) -> i64 {
        self.infos_by_origin
            .values()
            .flatten()
            .map(|info| info.size)
            .sum()
    }
}
