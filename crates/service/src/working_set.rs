//! Deduplicating registry of resident groups and caches.
//!
//! Holds weak references only: an object stays resident while someone uses
//! it, and a lookup never instantiates a second copy of a resident object.

use crate::cache::AppCache;
use crate::group::AppCacheGroup;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

#[derive(Default)]
struct Maps {
    groups: HashMap<i64, Weak<AppCacheGroup>>,
    groups_by_manifest_url: HashMap<String, Weak<AppCacheGroup>>,
    caches: HashMap<i64, Weak<AppCache>>,
}

#[derive(Default)]
pub struct WorkingSet {
    maps: Mutex<Maps>,
}

impl WorkingSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn maps(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Working set lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn get_group(&self, group_id: i64) -> Option<Arc<AppCacheGroup>> {
        self.maps().groups.get(&group_id).and_then(Weak::upgrade)
    }

    pub fn get_group_for_manifest_url(&self, manifest_url: &str) -> Option<Arc<AppCacheGroup>> {
        self.maps()
            .groups_by_manifest_url
            .get(manifest_url)
            .and_then(Weak::upgrade)
    }

    pub fn get_cache(&self, cache_id: i64) -> Option<Arc<AppCache>> {
        self.maps().caches.get(&cache_id).and_then(Weak::upgrade)
    }

    /// Register `group`, or return the copy already resident under its id.
    pub fn insert_group(&self, group: Arc<AppCacheGroup>) -> Arc<AppCacheGroup> {
        let mut maps = self.maps();
        if let Some(existing) = maps.groups.get(&group.group_id()).and_then(Weak::upgrade) {
            return existing;
        }
        maps.groups.insert(group.group_id(), Arc::downgrade(&group));
        if !group.is_obsolete() {
            maps.groups_by_manifest_url
                .insert(group.manifest_url().to_string(), Arc::downgrade(&group));
        }
        if let Some(cache) = group.newest_complete_cache() {
            maps.caches
                .entry(cache.cache_id())
                .or_insert_with(|| Arc::downgrade(&cache));
        }
        group
    }

    /// Register `cache`, or return the copy already resident under its id.
    pub fn insert_cache(&self, cache: Arc<AppCache>) -> Arc<AppCache> {
        let mut maps = self.maps();
        if let Some(existing) = maps.caches.get(&cache.cache_id()).and_then(Weak::upgrade) {
            return existing;
        }
        maps.caches.insert(cache.cache_id(), Arc::downgrade(&cache));
        cache
    }

    /// Forget the group's manifest URL so the next load creates a fresh group.
    pub fn remove_group_manifest_url(&self, group: &AppCacheGroup) {
        let mut maps = self.maps();
        let key = group.manifest_url().as_str();
        let same = maps
            .groups_by_manifest_url
            .get(key)
            .and_then(Weak::upgrade)
            .is_some_and(|resident| resident.group_id() == group.group_id());
        if same {
            maps.groups_by_manifest_url.remove(key);
        }
    }

    pub fn remove_cache(&self, cache_id: i64) {
        self.maps().caches.remove(&cache_id);
    }

    pub fn clear(&self) {
        *self.maps() = Maps::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::Url;

    #[test]
    fn resident_group_is_returned_instead_of_duplicate() {
        let set = WorkingSet::new();
        let url = Url::parse("http://a.com/manifest").unwrap();
        let first = set.insert_group(Arc::new(AppCacheGroup::new(1, url.clone())));
        let second = set.insert_group(Arc::new(AppCacheGroup::new(1, url.clone())));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(
            &set.get_group_for_manifest_url(url.as_str()).unwrap(),
            &first
        ));
    }

    #[test]
    fn dropped_objects_are_not_resident() {
        let set = WorkingSet::new();
        let cache = set.insert_cache(Arc::new(AppCache::new(7)));
        assert!(set.get_cache(7).is_some());
        drop(cache);
        assert!(set.get_cache(7).is_none());
    }

    #[test]
    fn removing_manifest_url_keeps_group_by_id() {
        let set = WorkingSet::new();
        let url = Url::parse("http://a.com/manifest").unwrap();
        let group = set.insert_group(Arc::new(AppCacheGroup::new(2, url.clone())));
        set.remove_group_manifest_url(&group);
        assert!(set.get_group_for_manifest_url(url.as_str()).is_none());
        assert!(set.get_group(2).is_some());
    }
}
