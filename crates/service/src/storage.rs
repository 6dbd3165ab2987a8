//! Storage façade: the working set, the metadata store and the response
//! store behind one set of async operations.

use crate::cache::{AppCache, CacheLookup};
use crate::error::{ServiceError, ServiceResult};
use crate::group::AppCacheGroup;
use crate::quota::QuotaManagerProxy;
use crate::working_set::WorkingSet;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use stowage_core::config::AppConfig;
use stowage_core::{
    AppCacheInfo, AppCacheInfoCollection, Entry, EntryFlags, Url, find_namespace,
    is_cacheable_scheme, origin_of, strip_fragment,
};
use stowage_metadata::models::{CacheRecord, CommitBatch, GroupRecord, StorageIds};
use stowage_metadata::{MetadataError, MetadataResult, MetadataStore};
use stowage_storage::{ResponseReader, ResponseStore, ResponseWriter, StorageError};
use time::OffsetDateTime;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A stored response chosen for a main-resource request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FoundResponse {
    pub manifest_url: String,
    pub group_id: i64,
    pub cache_id: i64,
    /// URL of the entry that holds the response.
    pub url: String,
    pub entry: Entry,
    /// Matching namespace for intercept and fallback responses.
    pub namespace_url: Option<String>,
}

/// Result of a main-resource lookup.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MainResponse {
    Entry(FoundResponse),
    Intercept(FoundResponse),
    /// Try the network first; serve this response if it fails.
    Fallback(FoundResponse),
    NotFound,
}

impl MainResponse {
    pub fn found(&self) -> Option<&FoundResponse> {
        match self {
            MainResponse::Entry(found)
            | MainResponse::Intercept(found)
            | MainResponse::Fallback(found) => Some(found),
            MainResponse::NotFound => None,
        }
    }
}

/// Monotonic id source seeded from the highest id on disk.
struct IdAllocator(AtomicI64);

impl IdAllocator {
    fn new(last: i64) -> Self {
        Self(AtomicI64::new(last))
    }

    fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

type Waiters<V> = Vec<oneshot::Sender<Option<Arc<V>>>>;

/// Loads in flight, keyed by what is being loaded. Every caller asking for the
/// same key while a load runs receives the single result.
struct PendingLoads<K, V> {
    waiters: Mutex<HashMap<K, Waiters<V>>>,
}

impl<K: Eq + Hash, V> PendingLoads<K, V> {
    fn new() -> Self {
        Self {
            waiters: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Waiters<V>>> {
        self.waiters.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Pending load lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Returns the receiver and whether the caller must start the load.
    fn register(&self, key: K) -> (oneshot::Receiver<Option<Arc<V>>>, bool) {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.lock();
        let list = waiters.entry(key).or_default();
        list.push(tx);
        (rx, list.len() == 1)
    }

    fn complete(&self, key: &K, value: Option<Arc<V>>) {
        let waiters = self.lock().remove(key).unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
    }
}

/// Storage façade.
pub struct AppCacheStorage {
    metadata: Arc<dyn MetadataStore>,
    responses: Arc<dyn ResponseStore>,
    quota: Arc<dyn QuotaManagerProxy>,
    working_set: WorkingSet,
    group_ids: IdAllocator,
    cache_ids: IdAllocator,
    response_ids: IdAllocator,
    usage: Mutex<BTreeMap<String, i64>>,
    group_loads: PendingLoads<String, AppCacheGroup>,
    cache_loads: PendingLoads<i64, AppCache>,
    deleter_wake: Arc<Notify>,
    flush_pending: Arc<AtomicBool>,
    access_time_flush_delay: Duration,
    shutdown: CancellationToken,
    disabled: AtomicBool,
    corruption_tx: Option<mpsc::UnboundedSender<()>>,
}

impl AppCacheStorage {
    /// Read id high-water marks and origin usage, then start the response
    /// deleter. A database that cannot be read leaves the storage disabled.
    pub async fn initialize(
        metadata: Arc<dyn MetadataStore>,
        responses: Arc<dyn ResponseStore>,
        quota: Arc<dyn QuotaManagerProxy>,
        config: &AppConfig,
        corruption_tx: Option<mpsc::UnboundedSender<()>>,
    ) -> Arc<Self> {
        let mut disabled = metadata.is_disabled();
        let ids = match metadata.find_last_storage_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read storage ids, disabling storage");
                disabled = true;
                Default::default()
            }
        };
        if !disabled && (metadata.take_recreated() || ids == StorageIds::default()) {
            clear_orphaned_responses(responses.as_ref()).await;
        }
        let usage = if disabled {
            BTreeMap::new()
        } else {
            metadata.get_all_origin_usage().await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to read origin usage");
                BTreeMap::new()
            })
        };

        let storage = Arc::new(Self {
            metadata,
            responses,
            quota,
            working_set: WorkingSet::new(),
            group_ids: IdAllocator::new(ids.last_group_id),
            cache_ids: IdAllocator::new(ids.last_cache_id),
            response_ids: IdAllocator::new(ids.last_response_id),
            usage: Mutex::new(usage),
            group_loads: PendingLoads::new(),
            cache_loads: PendingLoads::new(),
            deleter_wake: Arc::new(Notify::new()),
            flush_pending: Arc::new(AtomicBool::new(false)),
            access_time_flush_delay: config.metadata.access_time_flush_delay(),
            shutdown: CancellationToken::new(),
            disabled: AtomicBool::new(disabled),
            corruption_tx,
        });

        if disabled {
            if let Some(tx) = &storage.corruption_tx {
                let _ = tx.send(());
            }
        } else {
            tokio::spawn(run_response_deleter(
                storage.metadata.clone(),
                storage.responses.clone(),
                storage.deleter_wake.clone(),
                storage.shutdown.child_token(),
                config.service.deletion_batch_size,
                config.service.deletion_delay(),
            ));
            // Leftovers from a previous run.
            storage.deleter_wake.notify_one();
        }

        tracing::info!(
            last_group_id = ids.last_group_id,
            last_cache_id = ids.last_cache_id,
            last_response_id = ids.last_response_id,
            disabled,
            "Storage initialized"
        );
        storage
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst) || self.metadata.is_disabled()
    }

    fn ensure_enabled(&self) -> ServiceResult<()> {
        if self.is_disabled() {
            Err(ServiceError::Disabled)
        } else {
            Ok(())
        }
    }

    /// Map a metadata result, disabling the storage on corruption.
    fn db<T>(&self, result: MetadataResult<T>) -> ServiceResult<T> {
        result.map_err(|e| {
            if e.is_corruption() {
                self.on_corruption(&e);
            }
            e.into()
        })
    }

    fn on_corruption(&self, error: &MetadataError) {
        if self.disabled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(error = %error, "Metadata store corrupt, disabling storage");
        self.metadata.disable();
        if let Some(tx) = &self.corruption_tx {
            let _ = tx.send(());
        }
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    pub fn responses(&self) -> &Arc<dyn ResponseStore> {
        &self.responses
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.working_set
    }

    pub fn new_group_id(&self) -> i64 {
        self.group_ids.next()
    }

    pub fn new_cache_id(&self) -> i64 {
        self.cache_ids.next()
    }

    pub fn new_response_id(&self) -> i64 {
        self.response_ids.next()
    }

    pub fn origin_usage(&self, origin: &str) -> i64 {
        self.lock_usage().get(origin).copied().unwrap_or_default()
    }

    /// Origins with stored data.
    pub fn origins(&self) -> Vec<String> {
        self.lock_usage().keys().cloned().collect()
    }

    fn lock_usage(&self) -> MutexGuard<'_, BTreeMap<String, i64>> {
        self.usage.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Usage map lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn apply_usage_delta(&self, origin: &str, delta: i64) {
        if delta == 0 {
            return;
        }
        {
            let mut usage = self.lock_usage();
            let value = usage.entry(origin.to_string()).or_default();
            *value += delta;
            if *value <= 0 {
                usage.remove(origin);
            }
        }
        self.quota.notify_storage_modified(origin, delta);
    }

    /// Summaries of every stored group, by origin.
    pub async fn get_all_info(&self) -> ServiceResult<AppCacheInfoCollection> {
        self.ensure_enabled()?;
        let mut collection = AppCacheInfoCollection::default();
        for origin in self.db(self.metadata.find_origins_with_groups().await)? {
            for group in self.db(self.metadata.find_groups_for_origin(&origin).await)? {
                let Some(cache) = self.db(self.metadata.find_cache_for_group(group.group_id).await)?
                else {
                    continue;
                };
                collection.push(
                    origin.clone(),
                    AppCacheInfo {
                        manifest_url: group.manifest_url,
                        group_id: group.group_id,
                        cache_id: cache.cache_id,
                        creation_time: group.creation_time,
                        last_access_time: group.last_access_time,
                        last_update_time: cache.update_time,
                        size: cache.cache_size,
                    },
                );
            }
        }
        Ok(collection)
    }

    /// Manifest URLs of every stored group of `origin`.
    pub async fn manifest_urls_for_origin(&self, origin: &str) -> ServiceResult<Vec<Url>> {
        self.ensure_enabled()?;
        let groups = self.db(self.metadata.find_groups_for_origin(origin).await)?;
        Ok(groups
            .iter()
            .filter_map(|group| Url::parse(&group.manifest_url).ok())
            .collect())
    }

    /// The group for `manifest_url`, loading it or creating an unsaved one.
    ///
    /// Concurrent calls for the same URL share one database read and resolve
    /// to the same object.
    pub async fn load_or_create_group(
        self: &Arc<Self>,
        manifest_url: &Url,
    ) -> ServiceResult<Arc<AppCacheGroup>> {
        self.ensure_enabled()?;
        let manifest_url = strip_fragment(manifest_url);
        if let Some(group) = self
            .working_set
            .get_group_for_manifest_url(manifest_url.as_str())
        {
            return Ok(group);
        }

        let key = manifest_url.to_string();
        let (rx, start) = self.group_loads.register(key.clone());
        if start {
            let storage = Arc::clone(self);
            tokio::spawn(async move {
                let group = storage.read_or_create_group(&manifest_url).await;
                storage.group_loads.complete(&key, group);
            });
        }

        rx.await
            .map_err(|_| ServiceError::Internal("group load abandoned".to_string()))?
            .ok_or(ServiceError::Disabled)
    }

    async fn read_or_create_group(&self, manifest_url: &Url) -> Option<Arc<AppCacheGroup>> {
        if let Some(group) = self
            .working_set
            .get_group_for_manifest_url(manifest_url.as_str())
        {
            return Some(group);
        }

        let loaded = match self.read_group(manifest_url).await {
            Ok(group) => group,
            Err(_) if self.is_disabled() => return None,
            Err(e) => {
                tracing::warn!(
                    manifest_url = %manifest_url,
                    error = %e,
                    "Failed to load group, starting a new one"
                );
                None
            }
        };
        let group = loaded.unwrap_or_else(|| {
            let group_id = self.new_group_id();
            tracing::debug!(group_id, manifest_url = %manifest_url, "Created new group");
            Arc::new(AppCacheGroup::new(group_id, manifest_url.clone()))
        });
        Some(self.working_set.insert_group(group))
    }

    async fn read_group(&self, manifest_url: &Url) -> ServiceResult<Option<Arc<AppCacheGroup>>> {
        let Some(record) = self.db(
            self.metadata
                .find_group_for_manifest_url(manifest_url.as_str())
                .await,
        )?
        else {
            return Ok(None);
        };
        if let Some(group) = self.working_set.get_group(record.group_id) {
            return Ok(Some(group));
        }

        let cache = match self.db(self.metadata.find_cache_for_group(record.group_id).await)? {
            Some(cache) => Some(self.cache_from_record(cache).await?),
            None => None,
        };
        Ok(Some(Arc::new(AppCacheGroup::from_record(
            &record,
            manifest_url.clone(),
            cache,
        ))))
    }

    /// Build a stored cache, reusing the resident copy if there is one.
    async fn cache_from_record(&self, record: CacheRecord) -> ServiceResult<Arc<AppCache>> {
        if let Some(cache) = self.working_set.get_cache(record.cache_id) {
            return Ok(cache);
        }
        let entries = self.db(self.metadata.find_entries_for_cache(record.cache_id).await)?;
        let namespaces = self.db(self.metadata.find_namespaces_for_cache(record.cache_id).await)?;
        let whitelist = self.db(
            self.metadata
                .find_online_whitelist_for_cache(record.cache_id)
                .await,
        )?;
        let cache = AppCache::from_records(&record, &entries, namespaces, &whitelist);
        Ok(self.working_set.insert_cache(Arc::new(cache)))
    }

    /// Load a stored cache by id. Concurrent loads of one id are coalesced.
    pub async fn load_cache(self: &Arc<Self>, cache_id: i64) -> ServiceResult<Option<Arc<AppCache>>> {
        self.ensure_enabled()?;
        if let Some(cache) = self.working_set.get_cache(cache_id) {
            return Ok(Some(cache));
        }

        let (rx, start) = self.cache_loads.register(cache_id);
        if start {
            let storage = Arc::clone(self);
            tokio::spawn(async move {
                let cache = match storage.read_cache(cache_id).await {
                    Ok(cache) => cache,
                    Err(e) => {
                        tracing::warn!(cache_id, error = %e, "Failed to load cache");
                        None
                    }
                };
                storage.cache_loads.complete(&cache_id, cache);
            });
        }

        let cache = rx
            .await
            .map_err(|_| ServiceError::Internal("cache load abandoned".to_string()))?;
        if cache.is_none() {
            self.ensure_enabled()?;
        }
        Ok(cache)
    }

    async fn read_cache(&self, cache_id: i64) -> ServiceResult<Option<Arc<AppCache>>> {
        match self.db(self.metadata.find_cache(cache_id).await)? {
            Some(record) => Ok(Some(self.cache_from_record(record).await?)),
            None => Ok(None),
        }
    }

    /// Atomically store `group` with `cache` as its newest complete cache.
    ///
    /// `eviction_times` replaces the group's last full check and first
    /// evictable error times once the commit succeeds.
    pub async fn store_group_and_newest_cache(
        &self,
        group: &Arc<AppCacheGroup>,
        cache: Arc<AppCache>,
        eviction_times: (Option<OffsetDateTime>, Option<OffsetDateTime>),
    ) -> ServiceResult<()> {
        self.ensure_enabled()?;
        let origin = group.origin().to_string();
        let mut record: GroupRecord = group.to_record();
        record.last_full_update_check_time = eviction_times.0;
        record.first_evictable_error_time = eviction_times.1;
        let (intercept_namespaces, fallback_namespaces) = cache.to_namespace_records(&origin);

        let batch = CommitBatch {
            group: record,
            cache: cache.to_cache_record(group.group_id()),
            entries: cache.to_entry_records(),
            intercept_namespaces,
            fallback_namespaces,
            online_whitelists: cache.to_whitelist_records(),
            quota: self.quota.quota_for_origin(&origin).await,
        };

        let outcome = self.db(self.metadata.store_group_and_cache(&batch).await)?;

        group.set_eviction_times(eviction_times.0, eviction_times.1);
        let cache = self.working_set.insert_cache(cache);
        group.set_newest_complete_cache(cache);
        self.working_set.insert_group(group.clone());
        self.apply_usage_delta(&origin, outcome.usage_delta);
        if !outcome.deletable_response_ids.is_empty() {
            self.deleter_wake.notify_one();
        }

        tracing::info!(
            group_id = group.group_id(),
            cache_id = batch.cache.cache_id,
            entries = batch.entries.len(),
            size = batch.cache.cache_size,
            retired_responses = outcome.deletable_response_ids.len(),
            "Stored group and newest cache"
        );
        Ok(())
    }

    /// Persist the group's eviction timestamps.
    pub async fn store_eviction_times(&self, group: &AppCacheGroup) -> ServiceResult<()> {
        self.ensure_enabled()?;
        self.db(
            self.metadata
                .update_eviction_times(
                    group.group_id(),
                    group.last_full_update_check_time(),
                    group.first_evictable_error_time(),
                )
                .await,
        )
    }

    /// Delete the group and everything it stored, and mark it obsolete.
    ///
    /// A group that was never stored is only marked.
    pub async fn make_group_obsolete(&self, group: &Arc<AppCacheGroup>) -> ServiceResult<()> {
        self.ensure_enabled()?;
        group.set_being_deleted(true);
        let result = self.metadata.delete_group_and_caches(group.group_id()).await;
        group.set_being_deleted(false);

        match result {
            Ok(deletion) => {
                self.apply_usage_delta(&deletion.origin, -deletion.freed_bytes);
                if !deletion.response_ids.is_empty() {
                    self.deleter_wake.notify_one();
                }
                tracing::info!(
                    group_id = group.group_id(),
                    manifest_url = %group.manifest_url(),
                    freed_bytes = deletion.freed_bytes,
                    "Group deleted"
                );
            }
            Err(MetadataError::NotFound(_)) => {}
            Err(e) => self.db::<()>(Err(e))?,
        }

        group.set_obsolete();
        self.working_set.remove_group_manifest_url(group);
        if let Some(cache) = group.newest_complete_cache() {
            self.working_set.remove_cache(cache.cache_id());
        }
        Ok(())
    }

    /// Pick the response for a main-resource (navigation) request.
    ///
    /// Every non-obsolete group of the URL's origin is considered, the group
    /// of `preferred_manifest_url` first. Exact entries win over intercept
    /// namespaces, which win over fallback namespaces; entries marked foreign
    /// are skipped.
    pub async fn find_response_for_main_request(
        &self,
        url: &Url,
        preferred_manifest_url: Option<&Url>,
    ) -> ServiceResult<MainResponse> {
        self.ensure_enabled()?;
        if !is_cacheable_scheme(url) {
            return Ok(MainResponse::NotFound);
        }
        let url = strip_fragment(url);
        let origin = origin_of(&url);

        let groups = self.db(self.metadata.find_groups_for_origin(&origin).await)?;
        let caches = self.db(self.metadata.find_caches_for_origin(&origin).await)?;
        let cache_for_group: HashMap<i64, i64> = caches
            .iter()
            .map(|cache| (cache.group_id, cache.cache_id))
            .collect();

        let preferred = preferred_manifest_url.map(|u| strip_fragment(u).to_string());
        let mut candidates: Vec<(GroupRecord, i64)> = groups
            .into_iter()
            .filter(|group| {
                !self
                    .working_set
                    .get_group(group.group_id)
                    .is_some_and(|resident| resident.is_obsolete())
            })
            .filter_map(|group| {
                let cache_id = *cache_for_group.get(&group.group_id)?;
                Some((group, cache_id))
            })
            .collect();
        candidates.sort_by_key(|(group, _)| {
            (
                preferred.as_deref() != Some(group.manifest_url.as_str()),
                group.group_id,
            )
        });
        if candidates.is_empty() {
            return Ok(MainResponse::NotFound);
        }

        let found = |group: &GroupRecord, cache_id, entry_url: String, entry, namespace_url| {
            FoundResponse {
                manifest_url: group.manifest_url.clone(),
                group_id: group.group_id,
                cache_id,
                url: entry_url,
                entry,
                namespace_url,
            }
        };

        // Exact entries.
        let entries = self.db(self.metadata.find_entries_for_url(url.as_str()).await)?;
        for (group, cache_id) in &candidates {
            let hit = entries
                .iter()
                .find(|record| record.cache_id == *cache_id && !record.to_entry().is_foreign());
            if let Some(record) = hit {
                self.record_access(group.group_id, &origin);
                return Ok(MainResponse::Entry(found(
                    group,
                    *cache_id,
                    record.url.clone(),
                    record.to_entry(),
                    None,
                )));
            }
        }

        let namespaces = self.db(self.metadata.find_namespaces_for_origin(&origin).await)?;

        // Intercept namespaces.
        for (group, cache_id) in &candidates {
            let intercepts: Vec<_> = namespaces
                .intercepts
                .iter()
                .filter(|record| record.cache_id == *cache_id)
                .map(|record| record.namespace.clone())
                .collect();
            let Some(namespace) = find_namespace(&intercepts, url.as_str()) else {
                continue;
            };
            if let Some(target) = self.db(
                self.metadata
                    .find_entry(*cache_id, &namespace.target_url)
                    .await,
            )? {
                self.record_access(group.group_id, &origin);
                return Ok(MainResponse::Intercept(found(
                    group,
                    *cache_id,
                    target.url.clone(),
                    target.to_entry(),
                    Some(namespace.namespace_url.clone()),
                )));
            }
        }

        // Fallback namespaces, unless the cache whitelists the URL.
        for (group, cache_id) in &candidates {
            let fallbacks: Vec<_> = namespaces
                .fallbacks
                .iter()
                .filter(|record| record.cache_id == *cache_id)
                .map(|record| record.namespace.clone())
                .collect();
            let Some(namespace) = find_namespace(&fallbacks, url.as_str()) else {
                continue;
            };
            let whitelist = self.db(self.metadata.find_online_whitelist_for_cache(*cache_id).await)?;
            let whitelisted = whitelist.iter().any(|record| {
                stowage_core::Namespace::new(
                    stowage_core::NamespaceType::Network,
                    record.namespace_url.clone(),
                    "",
                    record.is_pattern,
                )
                .is_match(url.as_str())
            });
            if whitelisted {
                continue;
            }
            if let Some(target) = self.db(
                self.metadata
                    .find_entry(*cache_id, &namespace.target_url)
                    .await,
            )? {
                self.record_access(group.group_id, &origin);
                return Ok(MainResponse::Fallback(found(
                    group,
                    *cache_id,
                    target.url.clone(),
                    target.to_entry(),
                    Some(namespace.namespace_url.clone()),
                )));
            }
        }

        Ok(MainResponse::NotFound)
    }

    /// Route a subresource request through a loaded cache.
    pub async fn find_response_for_sub_request(
        self: &Arc<Self>,
        cache_id: i64,
        url: &Url,
    ) -> ServiceResult<CacheLookup> {
        let cache = self
            .load_cache(cache_id)
            .await?
            .ok_or(ServiceError::CacheNotFound(cache_id))?;
        Ok(cache.find_response_for_request(strip_fragment(url).as_str()))
    }

    /// Flag a main resource as foreign: it named a different manifest, so it
    /// must not be selected for this cache again.
    pub async fn mark_entry_as_foreign(&self, url: &Url, cache_id: i64) -> ServiceResult<()> {
        self.ensure_enabled()?;
        let url = strip_fragment(url);
        if let Some(cache) = self.working_set.get_cache(cache_id) {
            cache.add_entry_flags(url.as_str(), EntryFlags::FOREIGN);
        }
        self.db(
            self.metadata
                .add_entry_flags(cache_id, url.as_str(), EntryFlags::FOREIGN)
                .await,
        )
    }

    pub fn create_response_reader(&self, response_id: i64) -> ResponseReader {
        ResponseReader::new(self.responses.clone(), response_id)
    }

    /// A writer for a freshly allocated response id.
    pub fn create_response_writer(&self) -> ResponseWriter {
        ResponseWriter::new(self.responses.clone(), self.new_response_id())
    }

    /// Queue responses for deletion and wake the deleter.
    pub async fn doom_responses(&self, response_ids: &[i64]) -> ServiceResult<()> {
        if response_ids.is_empty() {
            return Ok(());
        }
        self.ensure_enabled()?;
        self.db(
            self.metadata
                .insert_deletable_response_ids(response_ids)
                .await,
        )?;
        self.deleter_wake.notify_one();
        Ok(())
    }

    /// Remove responses from the response store right away.
    pub async fn delete_responses(&self, response_ids: &[i64]) {
        for &id in response_ids {
            match self.responses.doom_entry(id).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => tracing::warn!(response_id = id, error = %e, "Failed to delete response"),
            }
        }
    }

    /// Buffer the group's last access time and tell the quota manager.
    fn record_access(&self, group_id: i64, origin: &str) {
        let now = OffsetDateTime::now_utc();
        if let Some(group) = self.working_set.get_group(group_id) {
            group.touch(now);
        }
        self.metadata.lazy_update_last_access_time(group_id, now);
        self.quota.notify_storage_accessed(origin);
        self.schedule_access_time_flush();
    }

    fn schedule_access_time_flush(&self) {
        if self.flush_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let metadata = self.metadata.clone();
        let pending = self.flush_pending.clone();
        let token = self.shutdown.child_token();
        let delay = self.access_time_flush_delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            pending.store(false, Ordering::SeqCst);
            match metadata.commit_lazy_last_access_times().await {
                Ok(count) => tracing::debug!(count, "Flushed last access times"),
                Err(e) => tracing::warn!(error = %e, "Failed to flush last access times"),
            }
        });
    }

    /// Stop background work, flush buffered access times and close the database.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if !self.is_disabled()
            && let Err(e) = self.metadata.commit_lazy_last_access_times().await
        {
            tracing::warn!(error = %e, "Failed to flush last access times at shutdown");
        }
        self.metadata.close().await;
        self.working_set.clear();
    }
}

/// Drain the deletable-response queue in batches until shut down.
/// Drop every stored response. Used when the database holds nothing that
/// could reference them.
async fn clear_orphaned_responses(responses: &dyn ResponseStore) {
    match responses.entry_count().await {
        Ok(0) => {}
        Ok(count) => {
            tracing::warn!(count, "Metadata database is empty, clearing orphaned responses");
            if let Err(e) = responses.clear().await {
                tracing::warn!(error = %e, "Failed to clear orphaned responses");
            }
        }
        Err(e) => tracing::warn!(error = %e, "Failed to count stored responses"),
    }
}

async fn run_response_deleter(
    metadata: Arc<dyn MetadataStore>,
    responses: Arc<dyn ResponseStore>,
    wake: Arc<Notify>,
    token: CancellationToken,
    batch_size: i64,
    delay: Duration,
) {
    loop {
        let ids = match metadata.get_deletable_response_ids(i64::MAX, batch_size).await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read deletable responses");
                Vec::new()
            }
        };

        if ids.is_empty() {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = wake.notified() => continue,
            }
        }

        for &id in &ids {
            match responses.doom_entry(id).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => tracing::warn!(response_id = id, error = %e, "Failed to delete response"),
            }
        }

        if let Err(e) = metadata.delete_deletable_response_ids(&ids).await {
            tracing::warn!(error = %e, "Failed to dequeue deleted responses");
            tokio::select! {
                _ = token.cancelled() => return,
                _ = wake.notified() => continue,
            }
        }
        tracing::debug!(count = ids.len(), "Deleted responses");

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
