//! In-memory form of a group: one cached application across versions.

use crate::cache::AppCache;
use crate::host::HostHandle;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use stowage_core::{UpdateStatus, Url, origin_of};
use stowage_metadata::models::GroupRecord;
use time::OffsetDateTime;

#[derive(Debug)]
struct GroupState {
    creation_time: OffsetDateTime,
    last_access_time: OffsetDateTime,
    last_full_update_check_time: Option<OffsetDateTime>,
    first_evictable_error_time: Option<OffsetDateTime>,
    newest_complete_cache: Option<Arc<AppCache>>,
    is_obsolete: bool,
    is_being_deleted: bool,
    update_status: UpdateStatus,
    hosts: Vec<HostHandle>,
}

/// A group and its newest complete cache.
#[derive(Debug)]
pub struct AppCacheGroup {
    group_id: i64,
    manifest_url: Url,
    origin: String,
    state: RwLock<GroupState>,
}

impl AppCacheGroup {
    /// A group that has never been stored.
    pub fn new(group_id: i64, manifest_url: Url) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            group_id,
            origin: origin_of(&manifest_url),
            manifest_url,
            state: RwLock::new(GroupState {
                creation_time: now,
                last_access_time: now,
                last_full_update_check_time: None,
                first_evictable_error_time: None,
                newest_complete_cache: None,
                is_obsolete: false,
                is_being_deleted: false,
                update_status: UpdateStatus::Idle,
                hosts: Vec::new(),
            }),
        }
    }

    pub fn from_record(
        record: &GroupRecord,
        manifest_url: Url,
        newest: Option<Arc<AppCache>>,
    ) -> Self {
        let group = Self::new(record.group_id, manifest_url);
        {
            let mut state = group.write_state();
            state.creation_time = record.creation_time;
            state.last_access_time = record.last_access_time;
            state.last_full_update_check_time = record.last_full_update_check_time;
            state.first_evictable_error_time = record.first_evictable_error_time;
            state.newest_complete_cache = newest;
        }
        group
    }

    fn read_state(&self) -> RwLockReadGuard<'_, GroupState> {
        self.state.read().unwrap_or_else(|poisoned| {
            tracing::warn!(group_id = self.group_id, "Group state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, GroupState> {
        self.state.write().unwrap_or_else(|poisoned| {
            tracing::warn!(group_id = self.group_id, "Group state lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn group_id(&self) -> i64 {
        self.group_id
    }

    pub fn manifest_url(&self) -> &Url {
        &self.manifest_url
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn newest_complete_cache(&self) -> Option<Arc<AppCache>> {
        self.read_state().newest_complete_cache.clone()
    }

    pub fn set_newest_complete_cache(&self, cache: Arc<AppCache>) {
        self.write_state().newest_complete_cache = Some(cache);
    }

    pub fn is_obsolete(&self) -> bool {
        self.read_state().is_obsolete
    }

    pub fn set_obsolete(&self) {
        self.write_state().is_obsolete = true;
    }

    pub fn is_being_deleted(&self) -> bool {
        self.read_state().is_being_deleted
    }

    pub fn set_being_deleted(&self, value: bool) {
        self.write_state().is_being_deleted = value;
    }

    pub fn update_status(&self) -> UpdateStatus {
        self.read_state().update_status
    }

    pub fn set_update_status(&self, status: UpdateStatus) {
        self.write_state().update_status = status;
    }

    pub fn creation_time(&self) -> OffsetDateTime {
        self.read_state().creation_time
    }

    pub fn last_access_time(&self) -> OffsetDateTime {
        self.read_state().last_access_time
    }

    pub fn touch(&self, now: OffsetDateTime) {
        self.write_state().last_access_time = now;
    }

    pub fn last_full_update_check_time(&self) -> Option<OffsetDateTime> {
        self.read_state().last_full_update_check_time
    }

    pub fn first_evictable_error_time(&self) -> Option<OffsetDateTime> {
        self.read_state().first_evictable_error_time
    }

    pub fn set_eviction_times(
        &self,
        last_full_update_check_time: Option<OffsetDateTime>,
        first_evictable_error_time: Option<OffsetDateTime>,
    ) {
        let mut state = self.write_state();
        state.last_full_update_check_time = last_full_update_check_time;
        state.first_evictable_error_time = first_evictable_error_time;
    }

    /// Hosts currently using one of this group's caches.
    pub fn hosts(&self) -> Vec<HostHandle> {
        self.read_state().hosts.clone()
    }

    pub fn add_host(&self, host: HostHandle) {
        let mut state = self.write_state();
        if !state.hosts.contains(&host) {
            state.hosts.push(host);
        }
    }

    pub fn remove_host(&self, host: &HostHandle) {
        self.write_state().hosts.retain(|h| h != host);
    }

    pub fn to_record(&self) -> GroupRecord {
        let state = self.read_state();
        GroupRecord {
            group_id: self.group_id,
            origin: self.origin.clone(),
            manifest_url: self.manifest_url.to_string(),
            creation_time: state.creation_time,
            last_access_time: state.last_access_time,
            last_full_update_check_time: state.last_full_update_check_time,
            first_evictable_error_time: state.first_evictable_error_time,
        }
    }
}
