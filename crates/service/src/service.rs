//! The offline cache service: runs update jobs, answers lookups and recovers
//! from a corrupt database by rebuilding its storage.

use crate::cache::CacheLookup;
use crate::error::{ServiceError, ServiceResult};
use crate::fetch::Fetcher;
use crate::group::AppCacheGroup;
use crate::host::{HostEvent, HostHandle, notify_hosts};
use crate::quota::{AppCacheQuotaClient, QuotaManagerProxy};
use crate::storage::{AppCacheStorage, MainResponse};
use crate::update::{JobShared, PendingMaster, UpdateContext, UpdateJob, UpdateOutcome};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::{Duration, Instant};
use stowage_core::config::{AppConfig, ServiceConfig};
use stowage_core::{AppCacheInfoCollection, EventId, ManifestParser, strip_fragment};
use stowage_metadata::MetadataStore;
use stowage_storage::{ResponseStore, StorageError};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use url::Url;

/// What `start_update` did with the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateStart {
    /// A new job was started.
    Started,
    /// A job was already running and accepted the request.
    Joined,
    /// The running job is past accepting masters; a new run follows it.
    Queued,
}

/// Result of validating a stored response against its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckResult {
    Ok,
    /// No stored cache for the manifest.
    GroupMissing,
    /// The group has moved on to a newer cache; nothing is deleted.
    OutOfDate,
    /// The newest cache has no entry for the response. The group was deleted.
    EntryMissing,
    /// The blob could not be read. The group was deleted.
    ReadFailed,
    /// Stored size differs from the recorded one. The group was deleted.
    SizeMismatch,
}

struct RunningUpdate {
    group: Arc<AppCacheGroup>,
    shared: Arc<JobShared>,
    cancel: CancellationToken,
    /// Masters that arrived after the job stopped accepting them.
    queued: Vec<PendingMaster>,
    done: watch::Receiver<bool>,
}

/// Delay schedule for rebuilding storage after corruption.
///
/// Delays grow 0, 30s, 60s, 120s, ... up to the maximum. After a long enough
/// healthy stretch since the last rebuild they start from zero again. Only
/// one rebuild is pending at a time.
#[derive(Debug)]
struct ReinitBackoff {
    delay: Duration,
    min_increment: Duration,
    max_delay: Duration,
    reset_after: Duration,
    last_reinit: Instant,
    pending: bool,
}

impl ReinitBackoff {
    fn new(config: &ServiceConfig, now: Instant) -> Self {
        Self {
            delay: Duration::ZERO,
            min_increment: config.reinit_min_increment(),
            max_delay: config.reinit_max_delay(),
            reset_after: config.reinit_reset_after(),
            last_reinit: now,
            pending: false,
        }
    }

    /// The delay for a new rebuild, or `None` if one is already pending.
    fn schedule(&mut self, now: Instant) -> Option<Duration> {
        if self.pending {
            return None;
        }
        if !self.delay.is_zero() && now.duration_since(self.last_reinit) > self.reset_after {
            self.delay = Duration::ZERO;
        }
        let delay = self.delay;
        let increment = delay.max(self.min_increment);
        self.delay = (delay + increment).min(self.max_delay);
        self.pending = true;
        Some(delay)
    }

    fn completed(&mut self, now: Instant) {
        self.pending = false;
        self.last_reinit = now;
    }
}

/// The offline cache service.
pub struct AppCacheService {
    config: AppConfig,
    storage: RwLock<Arc<AppCacheStorage>>,
    fetcher: Arc<dyn Fetcher>,
    parser: Arc<dyn ManifestParser>,
    quota: Arc<dyn QuotaManagerProxy>,
    jobs: Mutex<HashMap<i64, RunningUpdate>>,
    /// Groups kept resident because hosts are associated with them.
    hosted: Mutex<HashMap<i64, Arc<AppCacheGroup>>>,
    reinit: Mutex<ReinitBackoff>,
    corruption_tx: mpsc::UnboundedSender<()>,
    shutdown: CancellationToken,
}

impl AppCacheService {
    /// Open the stores named by `config` and start the service.
    pub async fn new(
        config: AppConfig,
        fetcher: Arc<dyn Fetcher>,
        parser: Arc<dyn ManifestParser>,
        quota: Arc<dyn QuotaManagerProxy>,
    ) -> ServiceResult<Arc<Self>> {
        let metadata = stowage_metadata::from_config(&config.metadata);
        let responses = stowage_storage::from_config(&config.storage).await?;
        Ok(Self::with_stores(config, metadata, responses, fetcher, parser, quota).await)
    }

    /// Start the service over existing stores.
    pub async fn with_stores(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        responses: Arc<dyn ResponseStore>,
        fetcher: Arc<dyn Fetcher>,
        parser: Arc<dyn ManifestParser>,
        quota: Arc<dyn QuotaManagerProxy>,
    ) -> Arc<Self> {
        let (corruption_tx, corruption_rx) = mpsc::unbounded_channel();
        let storage = AppCacheStorage::initialize(
            metadata,
            responses,
            quota.clone(),
            &config,
            Some(corruption_tx.clone()),
        )
        .await;

        let service = Arc::new(Self {
            reinit: Mutex::new(ReinitBackoff::new(&config.service, Instant::now())),
            config,
            storage: RwLock::new(storage),
            fetcher,
            parser,
            quota,
            jobs: Mutex::new(HashMap::new()),
            hosted: Mutex::new(HashMap::new()),
            corruption_tx,
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(watch_corruption(
            Arc::downgrade(&service),
            corruption_rx,
            service.shutdown.child_token(),
        ));
        service
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// The current storage. Replaced wholesale when storage is rebuilt.
    pub fn storage(&self) -> Arc<AppCacheStorage> {
        self.storage
            .read()
            .unwrap_or_else(|poisoned| {
                tracing::warn!("Storage lock poisoned, recovering");
                poisoned.into_inner()
            })
            .clone()
    }

    pub fn quota_client(self: &Arc<Self>) -> AppCacheQuotaClient {
        AppCacheQuotaClient::new(Arc::downgrade(self))
    }

    fn lock_jobs(&self) -> MutexGuard<'_, HashMap<i64, RunningUpdate>> {
        self.jobs.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Job table lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn lock_hosted(&self) -> MutexGuard<'_, HashMap<i64, Arc<AppCacheGroup>>> {
        self.hosted.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Hosted group lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Keep `group` resident while it has hosts.
    fn retain_if_hosted(&self, group: &Arc<AppCacheGroup>) {
        let mut hosted = self.lock_hosted();
        if group.hosts().is_empty() || group.is_obsolete() {
            hosted.remove(&group.group_id());
        } else {
            hosted.insert(group.group_id(), group.clone());
        }
    }

    /// Forget a host that went away.
    pub fn remove_host(&self, host: &HostHandle) {
        self.lock_hosted().retain(|_, group| {
            group.remove_host(host);
            !group.hosts().is_empty()
        });
    }

    fn lock_reinit(&self) -> MutexGuard<'_, ReinitBackoff> {
        self.reinit.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Reinit lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    fn ensure_running(&self) -> ServiceResult<()> {
        if self.shutdown.is_cancelled() {
            Err(ServiceError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Start or join the update of the group for `manifest_url`.
    ///
    /// With `master_url`, the document at that URL is added to the new cache
    /// and `host` is associated with the group once it is stored. Without
    /// it, `host` is associated right away.
    pub async fn start_update(
        self: &Arc<Self>,
        manifest_url: &Url,
        host: Option<HostHandle>,
        master_url: Option<Url>,
    ) -> ServiceResult<UpdateStart> {
        self.ensure_running()?;
        let masters = match master_url {
            Some(url) => vec![PendingMaster::new(strip_fragment(&url), host)],
            None => {
                if let Some(host) = host {
                    let group = self.storage().load_or_create_group(manifest_url).await?;
                    group.add_host(host);
                    self.retain_if_hosted(&group);
                }
                Vec::new()
            }
        };
        self.begin_update(manifest_url, masters).await
    }

    async fn begin_update(
        self: &Arc<Self>,
        manifest_url: &Url,
        masters: Vec<PendingMaster>,
    ) -> ServiceResult<UpdateStart> {
        self.ensure_running()?;
        let storage = self.storage();
        let group = storage.load_or_create_group(manifest_url).await?;

        let mut jobs = self.lock_jobs();
        if let Some(running) = jobs.get_mut(&group.group_id()) {
            let mut start = UpdateStart::Joined;
            for master in masters {
                if let Err(master) = running.shared.try_add_master(master) {
                    running.queued.push(master);
                    start = UpdateStart::Queued;
                }
            }
            tracing::debug!(group_id = group.group_id(), result = ?start, "Update already running");
            return Ok(start);
        }

        let group_id = group.group_id();
        let shared = Arc::new(JobShared::new(masters));
        let cancel = self.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        let ctx = Arc::new(UpdateContext {
            storage,
            fetcher: self.fetcher.clone(),
            parser: self.parser.clone(),
            config: self.config.update.clone(),
        });
        let job = UpdateJob::new(ctx, group.clone(), shared.clone(), cancel.clone());
        jobs.insert(
            group_id,
            RunningUpdate {
                group: group.clone(),
                shared,
                cancel,
                queued: Vec::new(),
                done: done_rx,
            },
        );
        drop(jobs);

        tracing::info!(group_id, manifest_url = %group.manifest_url(), "Starting update");
        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            let outcome = job.run().await;
            if let Some(service) = service.upgrade() {
                service.update_finished(&group, outcome);
            }
            let _ = done_tx.send(true);
        });
        Ok(UpdateStart::Started)
    }

    fn update_finished(self: &Arc<Self>, group: &Arc<AppCacheGroup>, outcome: UpdateOutcome) {
        let queued = self
            .lock_jobs()
            .remove(&group.group_id())
            .map(|running| running.queued)
            .unwrap_or_default();
        self.retain_if_hosted(group);

        let restart = matches!(outcome, UpdateOutcome::Failed { restart: true, .. });
        if !restart && queued.is_empty() {
            return;
        }
        let delay = if restart {
            self.config.update.manifest_changed_retry_delay()
        } else {
            Duration::ZERO
        };

        let manifest_url = group.manifest_url().clone();
        let group = group.clone();
        let service = Arc::downgrade(self);
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            // A group deleted in the meantime is not brought back by a retry.
            if queued.is_empty() && group.is_obsolete() {
                return;
            }
            let Some(service) = service.upgrade() else {
                return;
            };
            tracing::info!(manifest_url = %manifest_url, restart, "Running follow-up update");
            if let Err(e) = service.begin_update(&manifest_url, queued).await {
                tracing::warn!(manifest_url = %manifest_url, error = %e, "Follow-up update failed to start");
            }
        });
    }

    /// Wait until the update running for `manifest_url`, if any, finishes.
    pub async fn wait_for_update(&self, manifest_url: &Url) {
        let manifest_url = strip_fragment(manifest_url);
        let done = self
            .lock_jobs()
            .values()
            .find(|running| *running.group.manifest_url() == manifest_url)
            .map(|running| running.done.clone());
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    pub fn is_updating(&self, manifest_url: &Url) -> bool {
        let manifest_url = strip_fragment(manifest_url);
        self.lock_jobs()
            .values()
            .any(|running| *running.group.manifest_url() == manifest_url)
    }

    /// Cancel the running update for `manifest_url`. Returns whether one ran.
    pub fn cancel_update(&self, manifest_url: &Url) -> bool {
        let manifest_url = strip_fragment(manifest_url);
        let jobs = self.lock_jobs();
        let running = jobs
            .values()
            .find(|running| *running.group.manifest_url() == manifest_url);
        match running {
            Some(running) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel the group's running update and wait for it to end, so a commit
    /// already under way cannot land after the caller proceeds.
    async fn cancel_group_update(&self, group_id: i64) {
        let done = self.lock_jobs().get(&group_id).map(|running| {
            running.cancel.cancel();
            running.done.clone()
        });
        if let Some(mut done) = done {
            let _ = done.wait_for(|finished| *finished).await;
        }
    }

    /// Delete a group and everything it stores. Its hosts are told the
    /// group is obsolete.
    pub async fn delete_group(&self, manifest_url: &Url) -> ServiceResult<()> {
        let storage = self.storage();
        let group = storage.load_or_create_group(manifest_url).await?;
        self.cancel_group_update(group.group_id()).await;
        storage.make_group_obsolete(&group).await?;
        self.retain_if_hosted(&group);
        notify_hosts(&group.hosts(), &HostEvent::Status(EventId::Obsolete));
        Ok(())
    }

    /// Delete every group of `origin`. Returns how many were deleted.
    pub async fn delete_origin_data(&self, origin: &str) -> ServiceResult<usize> {
        let manifest_urls = self.storage().manifest_urls_for_origin(origin).await?;
        for manifest_url in &manifest_urls {
            self.delete_group(manifest_url).await?;
        }
        tracing::info!(origin, groups = manifest_urls.len(), "Deleted origin data");
        Ok(manifest_urls.len())
    }

    pub async fn get_all_info(&self) -> ServiceResult<AppCacheInfoCollection> {
        self.storage().get_all_info().await
    }

    /// Whether a navigation to `url` could be served from some cache.
    pub async fn can_handle_offline(
        &self,
        url: &Url,
        preferred_manifest_url: Option<&Url>,
    ) -> ServiceResult<bool> {
        let response = self
            .find_response_for_main_request(url, preferred_manifest_url)
            .await?;
        Ok(response.found().is_some())
    }

    pub async fn find_response_for_main_request(
        &self,
        url: &Url,
        preferred_manifest_url: Option<&Url>,
    ) -> ServiceResult<MainResponse> {
        self.storage()
            .find_response_for_main_request(url, preferred_manifest_url)
            .await
    }

    pub async fn find_response_for_sub_request(
        &self,
        cache_id: i64,
        url: &Url,
    ) -> ServiceResult<CacheLookup> {
        self.storage().find_response_for_sub_request(cache_id, url).await
    }

    pub async fn mark_entry_as_foreign(&self, url: &Url, cache_id: i64) -> ServiceResult<()> {
        self.storage().mark_entry_as_foreign(url, cache_id).await
    }

    /// Check that a response a host is about to use is intact. Damaged
    /// groups are deleted.
    pub async fn check_response(
        &self,
        manifest_url: &Url,
        cache_id: i64,
        response_id: i64,
    ) -> ServiceResult<CheckResult> {
        let storage = self.storage();
        let group = storage.load_or_create_group(manifest_url).await?;
        let Some(cache) = group.newest_complete_cache() else {
            return Ok(CheckResult::GroupMissing);
        };
        if cache.cache_id() != cache_id {
            return Ok(CheckResult::OutOfDate);
        }

        let result = match cache.find_entry_by_response_id(response_id) {
            None => CheckResult::EntryMissing,
            Some((_, entry)) => match read_response_through(&storage, response_id).await {
                Ok(size) if size == entry.response_size => CheckResult::Ok,
                Ok(size) => {
                    tracing::warn!(
                        response_id,
                        expected = entry.response_size,
                        actual = size,
                        "Stored response size differs"
                    );
                    CheckResult::SizeMismatch
                }
                Err(e) => {
                    tracing::warn!(response_id, error = %e, "Failed to read response");
                    CheckResult::ReadFailed
                }
            },
        };

        if result != CheckResult::Ok {
            tracing::warn!(
                manifest_url = %manifest_url,
                cache_id,
                response_id,
                result = ?result,
                "Damaged response, deleting group"
            );
            self.delete_group(manifest_url).await?;
        }
        Ok(result)
    }

    pub fn origin_usage(&self, origin: &str) -> i64 {
        self.storage().origin_usage(origin)
    }

    pub fn origins(&self) -> Vec<String> {
        self.storage().origins()
    }

    pub fn is_disabled(&self) -> bool {
        self.storage().is_disabled()
    }

    fn schedule_reinit(self: &Arc<Self>) {
        let Some(delay) = self.lock_reinit().schedule(Instant::now()) else {
            return;
        };
        tracing::warn!(delay_secs = delay.as_secs(), "Scheduling storage rebuild");

        let service = Arc::downgrade(self);
        let token = self.shutdown.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(service) = service.upgrade() {
                service.reinitialize().await;
            }
        });
    }

    /// Throw away all stored data and start over with empty stores.
    pub async fn reinitialize(&self) {
        let old = self.storage();
        let running: Vec<CancellationToken> = self
            .lock_jobs()
            .drain()
            .map(|(_, running)| running.cancel)
            .collect();
        for cancel in running {
            cancel.cancel();
        }
        self.lock_hosted().clear();
        old.shutdown().await;

        if let Err(e) = old.metadata().delete_and_start_over().await {
            tracing::error!(error = %e, "Failed to delete metadata database");
            old.metadata().disable();
        }
        if let Err(e) = old.responses().clear().await {
            tracing::warn!(error = %e, "Failed to clear response store");
        }

        let storage = AppCacheStorage::initialize(
            old.metadata().clone(),
            old.responses().clone(),
            self.quota.clone(),
            &self.config,
            Some(self.corruption_tx.clone()),
        )
        .await;
        let disabled = storage.is_disabled();
        *self.storage.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Storage lock poisoned, recovering");
            poisoned.into_inner()
        }) = storage;
        self.lock_reinit().completed(Instant::now());
        tracing::info!(disabled, "Storage rebuilt");
    }

    /// Cancel running updates, clear session-only origins and close storage.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for origin in &self.config.service.session_only_origins {
            if let Err(e) = self.delete_origin_data(origin).await {
                tracing::warn!(origin, error = %e, "Failed to clear session-only origin");
            }
        }
        self.storage().shutdown().await;
        tracing::info!("Service shut down");
    }
}

/// Read a response's headers and body end to end. Returns the number of
/// bytes read.
async fn read_response_through(
    storage: &AppCacheStorage,
    response_id: i64,
) -> Result<i64, StorageError> {
    let reader = storage.create_response_reader(response_id);
    reader.read_info().await?;
    let info_size = reader.info_size().await?;
    let body = reader.read_to_end().await?;
    Ok(i64::try_from(info_size + body.len() as u64).unwrap_or(i64::MAX))
}

async fn watch_corruption(
    service: Weak<AppCacheService>,
    mut rx: mpsc::UnboundedReceiver<()>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            signal = rx.recv() => {
                if signal.is_none() {
                    return;
                }
            }
        }
        let Some(service) = service.upgrade() else {
            return;
        };
        service.schedule_reinit();
    }
}
