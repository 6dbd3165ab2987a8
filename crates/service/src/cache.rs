//! In-memory form of one cache version and the per-cache request lookup.

use std::collections::{BTreeMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use stowage_core::{Entry, EntryFlags, Manifest, Namespace, NamespaceType, find_namespace};
use stowage_metadata::NamespaceSet;
use stowage_metadata::models::{
    CacheRecord, EntryRecord, NamespaceRecord, OnlineWhiteListRecord,
};
use time::OffsetDateTime;

/// How a cache answers a request for a URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheLookup {
    /// The URL itself is cached.
    Entry { url: String, entry: Entry },
    /// An intercept namespace serves its target instead of the network.
    Intercept {
        namespace_url: String,
        target_url: String,
        entry: Entry,
    },
    /// The URL must go to the network.
    Network,
    /// Go to the network; serve the target if that fails.
    Fallback {
        namespace_url: String,
        target_url: String,
        entry: Entry,
    },
    /// Not available offline.
    Miss,
}

impl CacheLookup {
    pub fn entry(&self) -> Option<&Entry> {
        match self {
            CacheLookup::Entry { entry, .. }
            | CacheLookup::Intercept { entry, .. }
            | CacheLookup::Fallback { entry, .. } => Some(entry),
            CacheLookup::Network | CacheLookup::Miss => None,
        }
    }
}

/// One cache version: entries plus the routing rules of its manifest.
///
/// Everything except the entry map is fixed once the cache is built; entry
/// flags may still change (a main resource marked foreign).
#[derive(Debug)]
pub struct AppCache {
    cache_id: i64,
    entries: RwLock<BTreeMap<String, Entry>>,
    intercept_namespaces: Vec<Namespace>,
    fallback_namespaces: Vec<Namespace>,
    online_whitelist: Vec<Namespace>,
    online_wildcard: bool,
    update_time: OffsetDateTime,
}

impl AppCache {
    pub fn new(cache_id: i64) -> Self {
        Self {
            cache_id,
            entries: RwLock::new(BTreeMap::new()),
            intercept_namespaces: Vec::new(),
            fallback_namespaces: Vec::new(),
            online_whitelist: Vec::new(),
            online_wildcard: false,
            update_time: OffsetDateTime::now_utc(),
        }
    }

    /// Rebuild a stored cache.
    pub fn from_records(
        cache: &CacheRecord,
        entries: &[EntryRecord],
        namespaces: NamespaceSet,
        whitelist: &[OnlineWhiteListRecord],
    ) -> Self {
        Self {
            cache_id: cache.cache_id,
            entries: RwLock::new(
                entries
                    .iter()
                    .map(|record| (record.url.clone(), record.to_entry()))
                    .collect(),
            ),
            intercept_namespaces: namespaces
                .intercepts
                .into_iter()
                .map(|record| record.namespace)
                .collect(),
            fallback_namespaces: namespaces
                .fallbacks
                .into_iter()
                .map(|record| record.namespace)
                .collect(),
            online_whitelist: whitelist
                .iter()
                .map(|record| {
                    Namespace::new(
                        NamespaceType::Network,
                        record.namespace_url.clone(),
                        "",
                        record.is_pattern,
                    )
                })
                .collect(),
            online_wildcard: cache.online_wildcard,
            update_time: cache.update_time,
        }
    }

    /// A new version carrying over the routing rules and entries of `self`.
    pub fn copy_with_id(&self, cache_id: i64) -> Self {
        Self {
            cache_id,
            entries: RwLock::new(self.read_entries().clone()),
            intercept_namespaces: self.intercept_namespaces.clone(),
            fallback_namespaces: self.fallback_namespaces.clone(),
            online_whitelist: self.online_whitelist.clone(),
            online_wildcard: self.online_wildcard,
            update_time: OffsetDateTime::now_utc(),
        }
    }

    fn read_entries(&self) -> RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|poisoned| {
            tracing::warn!(cache_id = self.cache_id, "Entry map lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn write_entries(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|poisoned| {
            tracing::warn!(cache_id = self.cache_id, "Entry map lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    pub fn cache_id(&self) -> i64 {
        self.cache_id
    }

    pub fn online_wildcard(&self) -> bool {
        self.online_wildcard
    }

    pub fn update_time(&self) -> OffsetDateTime {
        self.update_time
    }

    pub fn intercept_namespaces(&self) -> &[Namespace] {
        &self.intercept_namespaces
    }

    pub fn fallback_namespaces(&self) -> &[Namespace] {
        &self.fallback_namespaces
    }

    pub fn online_whitelist(&self) -> &[Namespace] {
        &self.online_whitelist
    }

    /// Take routing rules from a parsed manifest.
    ///
    /// Namespaces repeating an earlier namespace URL are dropped.
    pub fn initialize_with_manifest(&mut self, manifest: &Manifest) {
        fn dedup(namespaces: &[Namespace], seen: &mut HashSet<String>) -> Vec<Namespace> {
            namespaces
                .iter()
                .filter(|ns| seen.insert(ns.namespace_url.clone()))
                .cloned()
                .collect()
        }

        let mut seen = HashSet::new();
        self.intercept_namespaces = dedup(&manifest.intercept_namespaces, &mut seen);
        self.fallback_namespaces = dedup(&manifest.fallback_namespaces, &mut seen);
        self.online_whitelist = dedup(&manifest.online_whitelist, &mut HashSet::new());
        self.online_wildcard = manifest.online_whitelist_all;
    }

    /// Add an entry, merging roles when the URL is already present.
    ///
    /// The first stored response for a URL is kept.
    pub fn add_or_modify_entry(&self, url: impl Into<String>, entry: Entry) {
        let mut entries = self.write_entries();
        let existing = entries.entry(url.into()).or_insert(Entry {
            flags: EntryFlags::empty(),
            ..entry
        });
        existing.flags |= entry.flags;
        if !existing.has_response_id() {
            existing.response_id = entry.response_id;
            existing.response_size = entry.response_size;
        }
    }

    pub fn get_entry(&self, url: &str) -> Option<Entry> {
        self.read_entries().get(url).copied()
    }

    /// Add roles to an existing entry. Returns false if the URL is not cached.
    pub fn add_entry_flags(&self, url: &str, flags: EntryFlags) -> bool {
        match self.write_entries().get_mut(url) {
            Some(entry) => {
                entry.flags |= flags;
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> Vec<(String, Entry)> {
        self.read_entries()
            .iter()
            .map(|(url, entry)| (url.clone(), *entry))
            .collect()
    }

    pub fn entry_count(&self) -> usize {
        self.read_entries().len()
    }

    /// Find the entry holding the given response.
    pub fn find_entry_by_response_id(&self, response_id: i64) -> Option<(String, Entry)> {
        self.read_entries()
            .iter()
            .find(|(_, entry)| entry.response_id == response_id)
            .map(|(url, entry)| (url.clone(), *entry))
    }

    /// Total bytes of all stored responses.
    pub fn cache_size(&self) -> i64 {
        self.read_entries()
            .values()
            .map(|entry| entry.response_size)
            .sum()
    }

    pub fn response_ids(&self) -> Vec<i64> {
        self.read_entries()
            .values()
            .filter(|entry| entry.has_response_id())
            .map(|entry| entry.response_id)
            .collect()
    }

    pub fn is_in_network_namespace(&self, url: &str) -> bool {
        self.online_whitelist.iter().any(|ns| ns.is_match(url))
    }

    fn namespace_target(&self, namespaces: &[Namespace], url: &str) -> Option<(Namespace, Entry)> {
        let namespace = find_namespace(namespaces, url)?;
        let entry = self.get_entry(&namespace.target_url)?;
        Some((namespace.clone(), entry))
    }

    /// Intercept namespace match, if any.
    pub fn find_intercept(&self, url: &str) -> Option<CacheLookup> {
        self.namespace_target(&self.intercept_namespaces, url)
            .map(|(ns, entry)| CacheLookup::Intercept {
                namespace_url: ns.namespace_url,
                target_url: ns.target_url,
                entry,
            })
    }

    /// Fallback namespace match, if any.
    pub fn find_fallback(&self, url: &str) -> Option<CacheLookup> {
        self.namespace_target(&self.fallback_namespaces, url)
            .map(|(ns, entry)| CacheLookup::Fallback {
                namespace_url: ns.namespace_url,
                target_url: ns.target_url,
                entry,
            })
    }

    /// Route a request for `url` through this cache.
    ///
    /// Order: exact entry, intercept namespace, online whitelist, fallback
    /// namespace, then the online wildcard.
    pub fn find_response_for_request(&self, url: &str) -> CacheLookup {
        if let Some(entry) = self.get_entry(url) {
            return CacheLookup::Entry {
                url: url.to_string(),
                entry,
            };
        }
        if let Some(found) = self.find_intercept(url) {
            return found;
        }
        if self.is_in_network_namespace(url) {
            return CacheLookup::Network;
        }
        if let Some(found) = self.find_fallback(url) {
            return found;
        }
        if self.online_wildcard {
            CacheLookup::Network
        } else {
            CacheLookup::Miss
        }
    }

    pub fn to_cache_record(&self, group_id: i64) -> CacheRecord {
        CacheRecord {
            cache_id: self.cache_id,
            group_id,
            online_wildcard: self.online_wildcard,
            update_time: self.update_time,
            cache_size: self.cache_size(),
        }
    }

    pub fn to_entry_records(&self) -> Vec<EntryRecord> {
        self.read_entries()
            .iter()
            .map(|(url, entry)| EntryRecord::new(self.cache_id, url.clone(), entry))
            .collect()
    }

    pub fn to_namespace_records(
        &self,
        origin: &str,
    ) -> (Vec<NamespaceRecord>, Vec<NamespaceRecord>) {
        let convert = |namespaces: &[Namespace]| {
            namespaces
                .iter()
                .map(|ns| NamespaceRecord {
                    cache_id: self.cache_id,
                    origin: origin.to_string(),
                    namespace: ns.clone(),
                })
                .collect()
        };
        (
            convert(&self.intercept_namespaces),
            convert(&self.fallback_namespaces),
        )
    }

    pub fn to_whitelist_records(&self) -> Vec<OnlineWhiteListRecord> {
        self.online_whitelist
            .iter()
            .map(|ns| OnlineWhiteListRecord {
                cache_id: self.cache_id,
                namespace_url: ns.namespace_url.clone(),
                is_pattern: ns.is_pattern,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORIGIN: &str = "http://h";

    fn cache_with_manifest(manifest: Manifest) -> AppCache {
        let mut cache = AppCache::new(1);
        cache.initialize_with_manifest(&manifest);
        cache
    }

    fn stored(flags: EntryFlags, response_id: i64) -> Entry {
        Entry::new(flags, response_id, 10)
    }

    #[test]
    fn roles_merge_and_first_response_is_kept() {
        let cache = AppCache::new(1);
        cache.add_or_modify_entry("http://h/a", stored(EntryFlags::EXPLICIT, 1));
        cache.add_or_modify_entry("http://h/a", stored(EntryFlags::MASTER, 2));

        let entry = cache.get_entry("http://h/a").unwrap();
        assert!(entry.is_explicit());
        assert!(entry.is_master());
        assert_eq!(entry.response_id, 1);
        assert_eq!(cache.entry_count(), 1);
        assert_eq!(cache.cache_size(), 10);
    }

    #[test]
    fn lookup_order() {
        let cache = cache_with_manifest(Manifest {
            intercept_namespaces: vec![Namespace::new(
                NamespaceType::Intercept,
                "http://h/i/",
                "http://h/intercept.html",
                false,
            )],
            fallback_namespaces: vec![
                Namespace::new(NamespaceType::Fallback, "http://h/", "http://h/offline.html", false),
                Namespace::new(
                    NamespaceType::Fallback,
                    "http://h/i/",
                    "http://h/unused.html",
                    false,
                ),
            ],
            online_whitelist: vec![Namespace::new(NamespaceType::Network, "http://h/api/", "", false)],
            ..Manifest::default()
        });
        cache.add_or_modify_entry("http://h/page", stored(EntryFlags::EXPLICIT, 1));
        cache.add_or_modify_entry("http://h/intercept.html", stored(EntryFlags::INTERCEPT, 2));
        cache.add_or_modify_entry("http://h/offline.html", stored(EntryFlags::FALLBACK, 3));
        cache.add_or_modify_entry("http://h/i/", stored(EntryFlags::MASTER, 4));

        // Exact entries beat namespaces.
        assert!(matches!(
            cache.find_response_for_request("http://h/i/"),
            CacheLookup::Entry { entry, .. } if entry.response_id == 4
        ));
        // Intercepts beat fallbacks; the duplicate fallback URL was dropped.
        assert_eq!(cache.fallback_namespaces().len(), 1);
        assert!(matches!(
            cache.find_response_for_request("http://h/i/x"),
            CacheLookup::Intercept { entry, .. } if entry.response_id == 2
        ));
        assert_eq!(
            cache.find_response_for_request("http://h/api/data"),
            CacheLookup::Network
        );
        assert!(matches!(
            cache.find_response_for_request("http://h/other"),
            CacheLookup::Fallback { target_url, .. } if target_url == "http://h/offline.html"
        ));
        assert_eq!(
            cache.find_response_for_request("http://elsewhere/x"),
            CacheLookup::Miss
        );
    }

    #[test]
    fn longest_fallback_namespace_wins() {
        let cache = cache_with_manifest(Manifest {
            fallback_namespaces: vec![
                Namespace::new(NamespaceType::Fallback, "http://h/a/", "http://h/a.html", false),
                Namespace::new(NamespaceType::Fallback, "http://h/a/b/", "http://h/ab.html", false),
            ],
            ..Manifest::default()
        });
        cache.add_or_modify_entry("http://h/a.html", stored(EntryFlags::FALLBACK, 1));
        cache.add_or_modify_entry("http://h/ab.html", stored(EntryFlags::FALLBACK, 2));

        match cache.find_response_for_request("http://h/a/b/c") {
            CacheLookup::Fallback { namespace_url, .. } => {
                assert_eq!(namespace_url, "http://h/a/b/")
            }
            other => panic!("unexpected lookup: {other:?}"),
        }
    }

    #[test]
    fn online_wildcard_allows_network() {
        let cache = cache_with_manifest(Manifest {
            online_whitelist_all: true,
            ..Manifest::default()
        });
        assert_eq!(
            cache.find_response_for_request("http://h/anything"),
            CacheLookup::Network
        );
    }

    #[test]
    fn records_round_trip() {
        let cache = cache_with_manifest(Manifest {
            fallback_namespaces: vec![Namespace::new(
                NamespaceType::Fallback,
                "http://h/x/",
                "http://h/offline.html",
                false,
            )],
            online_whitelist: vec![Namespace::new(NamespaceType::Network, "http://h/*.json", "", true)],
            online_whitelist_all: true,
            ..Manifest::default()
        });
        cache.add_or_modify_entry("http://h/offline.html", stored(EntryFlags::FALLBACK, 7));

        let record = cache.to_cache_record(3);
        let entries = cache.to_entry_records();
        let (intercepts, fallbacks) = cache.to_namespace_records(ORIGIN);
        let whitelist = cache.to_whitelist_records();

        let rebuilt = AppCache::from_records(
            &record,
            &entries,
            NamespaceSet {
                intercepts,
                fallbacks,
            },
            &whitelist,
        );
        assert_eq!(rebuilt.cache_id(), 1);
        assert_eq!(rebuilt.cache_size(), 10);
        assert!(rebuilt.online_wildcard());
        assert_eq!(rebuilt.fallback_namespaces(), cache.fallback_namespaces());
        assert_eq!(rebuilt.online_whitelist(), cache.online_whitelist());
        assert_eq!(rebuilt.entries(), cache.entries());
    }
}
