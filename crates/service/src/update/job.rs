//! The update state machine.

use super::{
    FailureKind, JobShared, PendingMaster, UpdateContext, UpdateFailure, UpdateOutcome,
    UpdateState,
};
use crate::cache::AppCache;
use crate::error::ServiceError;
use crate::fetch::{FetchError, FetchRequest, FetchResponse, Fetcher};
use crate::group::AppCacheGroup;
use crate::host::{HostEvent, HostHandle, notify_hosts};
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use stowage_core::{
    CACHE_MANIFEST_MIME_TYPE, Entry, EntryFlags, ErrorDetails, ErrorReason, EventId, Manifest,
    ParseMode, ResponseInfo, UpdateStatus, origin_of,
};
use stowage_storage::{ResponseWriter, StorageError};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::instrument;
use url::Url;

/// Why the job stopped before finishing normally.
enum Halt {
    Cancelled,
    Failed(UpdateFailure),
}

impl From<UpdateFailure> for Halt {
    fn from(failure: UpdateFailure) -> Self {
        Halt::Failed(failure)
    }
}

type StepResult<T> = Result<T, Halt>;

fn fail(kind: FailureKind, details: ErrorDetails) -> Halt {
    Halt::Failed(UpdateFailure::new(kind, details))
}

enum FetchItem {
    /// A listed resource, with the entry the newest cache holds for it.
    Resource {
        url: Url,
        flags: EntryFlags,
        existing: Option<Entry>,
    },
    Master(Url),
}

impl FetchItem {
    fn url(&self) -> &Url {
        match self {
            FetchItem::Resource { url, .. } | FetchItem::Master(url) => url,
        }
    }
}

enum FetchOutcome {
    Stored { size: i64, info: ResponseInfo },
    NotModified,
    /// A response that is neither a success nor a 304.
    Status(ResponseInfo),
    Network(FetchError),
    Disk(StorageError),
}

struct FetchDone {
    item: FetchItem,
    response_id: i64,
    outcome: FetchOutcome,
}

/// One update attempt for one group.
pub struct UpdateJob {
    ctx: Arc<UpdateContext>,
    group: Arc<AppCacheGroup>,
    shared: Arc<JobShared>,
    cancel: CancellationToken,
    state: UpdateState,
    newest: Option<Arc<AppCache>>,
    doing_full_check: bool,
    announced: bool,
    /// Master URLs taken into this attempt, with the hosts waiting on each.
    masters: BTreeMap<String, Vec<HostHandle>>,
    /// Hosts of masters that have not failed.
    master_hosts: Vec<HostHandle>,
    /// Masters taken before the download phase started.
    initial_masters: Vec<Url>,
    /// Response ids allocated by this attempt and not committed yet.
    uncommitted: Vec<i64>,
    urls_total: u64,
    urls_complete: u64,
    masters_fetched: usize,
    masters_failed: usize,
}

impl UpdateJob {
    pub fn new(
        ctx: Arc<UpdateContext>,
        group: Arc<AppCacheGroup>,
        shared: Arc<JobShared>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            group,
            shared,
            cancel,
            state: UpdateState::FetchManifest,
            newest: None,
            doing_full_check: false,
            announced: false,
            masters: BTreeMap::new(),
            master_hosts: Vec::new(),
            initial_masters: Vec::new(),
            uncommitted: Vec::new(),
            urls_total: 0,
            urls_complete: 0,
            masters_fetched: 0,
            masters_failed: 0,
        }
    }

    /// Run the attempt to its end. Every host involved receives exactly one
    /// terminal event, except on cancellation, which is silent.
    #[instrument(skip(self), fields(group_id = self.group.group_id(), manifest_url = %self.group.manifest_url()))]
    pub async fn run(mut self) -> UpdateOutcome {
        let outcome = match self.run_steps().await {
            Ok(outcome) => outcome,
            Err(Halt::Cancelled) => self.cancelled().await,
            Err(Halt::Failed(failure)) => self.cache_failure(failure).await,
        };
        self.group.set_update_status(UpdateStatus::Idle);
        tracing::info!(outcome = ?outcome, "Update finished");
        outcome
    }

    fn set_state(&mut self, state: UpdateState) {
        tracing::debug!(from = ?self.state, to = ?state, "Update state");
        self.state = state;
    }

    async fn run_steps(&mut self) -> StepResult<UpdateOutcome> {
        self.newest = self.group.newest_complete_cache();
        self.set_state(UpdateState::FetchManifest);
        self.group.set_update_status(UpdateStatus::Checking);

        let initial = self.shared.take_pending();
        self.initial_masters = self.accept_masters(initial);
        self.notify_all(&HostEvent::Status(EventId::Checking));
        self.announced = true;

        let now = OffsetDateTime::now_utc();
        self.doing_full_check = match (&self.newest, self.group.last_full_update_check_time()) {
            (Some(_), Some(last)) => now - last >= self.ctx.config.full_update_interval(),
            _ => true,
        };

        let stored = match self.newest.clone() {
            Some(cache) => self.read_stored_manifest(&cache).await,
            None => None,
        };

        let manifest_url = self.group.manifest_url().clone();
        let mut request = FetchRequest::new(manifest_url.clone());
        if !self.doing_full_check
            && let Some((info, _)) = &stored
        {
            request = request.with_validators(info);
        }

        let response = match self.fetch(request).await? {
            Ok(response) => response,
            Err(e) => {
                return Err(fail(
                    FailureKind::Network,
                    ErrorDetails::new(format!("Manifest fetch failed ({e})"), ErrorReason::Manifest)
                        .with_url(manifest_url.as_str()),
                ));
            }
        };

        let status = response.status();
        if status == 304 && self.newest.is_some() {
            return self.no_update().await;
        }
        if matches!(status, 404 | 410) {
            if self.newest.is_some() {
                return self.obsolete().await;
            }
            return Err(fail(
                FailureKind::Manifest,
                ErrorDetails::new(format!("Manifest fetch failed ({status})"), ErrorReason::Manifest)
                    .with_url(manifest_url.as_str())
                    .with_status(status),
            ));
        }
        if response.is_redirect() {
            return Err(fail(
                FailureKind::Redirect,
                ErrorDetails::new("Manifest redirected", ErrorReason::Manifest)
                    .with_url(manifest_url.as_str())
                    .with_status(status),
            ));
        }
        if !response.is_success() {
            return Err(fail(
                FailureKind::Manifest,
                ErrorDetails::new(format!("Manifest fetch failed ({status})"), ErrorReason::Manifest)
                    .with_url(manifest_url.as_str())
                    .with_status(status),
            ));
        }
        if let Some((_, body)) = &stored
            && *body == response.body
        {
            return self.no_update().await;
        }

        let mode = if response.info.mime_type().as_deref() == Some(CACHE_MANIFEST_MIME_TYPE) {
            ParseMode::AllowInterceptNamespaces
        } else {
            ParseMode::PerStandard
        };
        let manifest = self
            .ctx
            .parser
            .parse(&manifest_url, &response.body, mode)
            .map_err(|e| {
                fail(
                    FailureKind::Manifest,
                    ErrorDetails::new(format!("Failed to parse manifest: {e}"), ErrorReason::Manifest)
                        .with_url(manifest_url.as_str()),
                )
            })?;
        if manifest.did_ignore_intercept_namespaces {
            tracing::warn!("Ignoring intercept namespaces of a manifest not served as {CACHE_MANIFEST_MIME_TYPE}");
        }

        self.download(manifest, response).await
    }

    async fn read_stored_manifest(&self, cache: &AppCache) -> Option<(ResponseInfo, Bytes)> {
        let (_, entry) = cache.entries().into_iter().find(|(_, entry)| entry.is_manifest())?;
        let reader = self.ctx.storage.create_response_reader(entry.response_id);
        let info = reader.read_info().await;
        let body = reader.read_to_end().await;
        match (info, body) {
            (Ok(info), Ok(body)) => Some((info, body)),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!(response_id = entry.response_id, error = %e, "Failed to read stored manifest");
                None
            }
        }
    }

    async fn download(&mut self, manifest: Manifest, response: FetchResponse) -> StepResult<UpdateOutcome> {
        self.set_state(UpdateState::Downloading);
        self.group.set_update_status(UpdateStatus::Downloading);
        self.notify_all(&HostEvent::Status(EventId::Downloading));

        let mut cache = AppCache::new(self.ctx.storage.new_cache_id());
        cache.initialize_with_manifest(&manifest);

        let mut queue: VecDeque<FetchItem> = self
            .initial_masters
            .drain(..)
            .map(FetchItem::Master)
            .collect();
        let resources = self.url_list(&manifest);
        self.urls_total = resources.len() as u64;
        queue.extend(resources);

        self.fetch_all(&cache, queue, true).await?;

        if self.newest.is_none() && self.masters_failed > 0 && self.masters_fetched == 0 {
            return Err(fail(
                FailureKind::Server,
                ErrorDetails::new("Every master entry failed to download", ErrorReason::Resource),
            ));
        }

        self.refetch_manifest(&cache, response).await?;
        let first = self.newest.is_none();
        let last_full_check = self.last_full_check_time();
        let cache_id = self.store(cache, last_full_check).await?;

        self.set_state(UpdateState::Completed);
        self.notify_all(&HostEvent::Progress {
            url: String::new(),
            total: self.urls_total,
            complete: self.urls_complete,
        });
        let event = if first { EventId::Cached } else { EventId::UpdateReady };
        self.notify_all(&HostEvent::Status(event));
        Ok(UpdateOutcome::Completed { cache_id, first })
    }

    /// Everything the manifest lists, plus the previous cache's master
    /// entries, with the roles of each URL merged.
    fn url_list(&self, manifest: &Manifest) -> Vec<FetchItem> {
        let mut urls: BTreeMap<String, EntryFlags> = BTreeMap::new();
        for url in &manifest.explicit_urls {
            *urls.entry(url.clone()).or_default() |= EntryFlags::EXPLICIT;
        }
        for namespace in &manifest.fallback_namespaces {
            *urls.entry(namespace.target_url.clone()).or_default() |= EntryFlags::FALLBACK;
        }
        for namespace in &manifest.intercept_namespaces {
            *urls.entry(namespace.target_url.clone()).or_default() |= EntryFlags::INTERCEPT;
        }
        if let Some(newest) = &self.newest {
            for (url, entry) in newest.entries() {
                if entry.is_master() {
                    *urls.entry(url).or_default() |= EntryFlags::MASTER;
                }
            }
        }

        urls.into_iter()
            .filter_map(|(url, flags)| {
                let existing = self.newest.as_ref().and_then(|cache| cache.get_entry(&url));
                match Url::parse(&url) {
                    Ok(url) => Some(FetchItem::Resource {
                        url,
                        flags,
                        existing,
                    }),
                    Err(e) => {
                        tracing::warn!(url, error = %e, "Skipping unparsable url");
                        None
                    }
                }
            })
            .collect()
    }

    /// Fetch every queued item, at most `max_concurrent_fetches` at a time.
    ///
    /// With `accept_masters`, masters joining the job are fetched as well;
    /// the job stops accepting them once nothing is left in flight.
    async fn fetch_all(
        &mut self,
        cache: &AppCache,
        mut queue: VecDeque<FetchItem>,
        accept_masters: bool,
    ) -> StepResult<()> {
        let limit = self.ctx.config.max_concurrent_fetches.max(1);
        let mut in_flight = FuturesUnordered::new();

        loop {
            if accept_masters {
                let joined = self.shared.take_pending();
                for url in self.accept_masters(joined) {
                    queue.push_back(FetchItem::Master(url));
                }
            }

            while in_flight.len() < limit
                && let Some(item) = queue.pop_front()
            {
                let writer = self.ctx.storage.create_response_writer();
                self.uncommitted.push(writer.response_id());
                in_flight.push(fetch_and_store(self.ctx.clone(), item, writer));
            }

            if in_flight.is_empty() {
                if accept_masters && !self.shared.close_if_idle() {
                    continue;
                }
                return Ok(());
            }

            let done = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                Some(done) = in_flight.next() => done,
                _ = self.shared.wake.notified(), if accept_masters => continue,
            };
            self.fetch_completed(cache, done)?;
        }
    }

    fn fetch_completed(&mut self, cache: &AppCache, done: FetchDone) -> StepResult<()> {
        let FetchDone {
            item,
            response_id,
            outcome,
        } = done;
        match item {
            FetchItem::Resource {
                url,
                flags,
                existing,
            } => {
                self.urls_complete += 1;
                self.resource_completed(cache, &url, flags, existing, response_id, outcome)?;
                self.notify_all(&HostEvent::Progress {
                    url: url.to_string(),
                    total: self.urls_total,
                    complete: self.urls_complete,
                });
                Ok(())
            }
            FetchItem::Master(url) => self.master_completed(cache, &url, response_id, outcome),
        }
    }

    fn resource_completed(
        &mut self,
        cache: &AppCache,
        url: &Url,
        flags: EntryFlags,
        existing: Option<Entry>,
        response_id: i64,
        outcome: FetchOutcome,
    ) -> StepResult<()> {
        let cross_origin = origin_of(url) != self.group.origin();
        let resource_error = |message: String| {
            ErrorDetails::new(message, ErrorReason::Resource)
                .with_url(url.as_str())
                .cross_origin(cross_origin)
        };

        let result = match outcome {
            FetchOutcome::Stored { size, info } => {
                if url.scheme() == "https" && cross_origin && info.has_no_store() {
                    Err(UpdateFailure::new(
                        FailureKind::Security,
                        resource_error("Cross-origin HTTPS resource forbids storing".to_string())
                            .with_status(info.status),
                    ))
                } else {
                    Ok(Entry::new(flags, response_id, size))
                }
            }
            FetchOutcome::NotModified => match existing {
                Some(old) => Ok(Entry::new(flags, old.response_id, old.response_size)),
                None => Err(UpdateFailure::new(
                    FailureKind::Server,
                    resource_error("Unexpected 304 for an uncached resource".to_string())
                        .with_status(304),
                )),
            },
            FetchOutcome::Status(info) => {
                let kind = if (300..400).contains(&info.status) {
                    FailureKind::Redirect
                } else {
                    FailureKind::Server
                };
                Err(UpdateFailure::new(
                    kind,
                    resource_error(format!("Resource fetch failed ({})", info.status))
                        .with_status(info.status),
                ))
            }
            FetchOutcome::Network(e) => Err(UpdateFailure::new(
                FailureKind::Network,
                resource_error(format!("Resource fetch failed ({e})")),
            )),
            FetchOutcome::Disk(e) => {
                return Err(fail(
                    FailureKind::Disk,
                    resource_error(format!("Failed to store resource: {e}")),
                ));
            }
        };

        match result {
            Ok(entry) => {
                cache.add_or_modify_entry(url.as_str(), entry);
                Ok(())
            }
            Err(failure) if Entry::new(flags, Entry::NO_RESPONSE_ID, 0).is_required() => {
                Err(Halt::Failed(failure))
            }
            Err(failure) => {
                let gone = matches!(failure.details.status, Some(404 | 410));
                match existing {
                    Some(old) if !gone => {
                        tracing::debug!(url = %url, "Keeping previous copy of master entry");
                        cache.add_or_modify_entry(
                            url.as_str(),
                            Entry::new(flags, old.response_id, old.response_size),
                        );
                    }
                    _ => tracing::debug!(url = %url, "Dropping master entry"),
                }
                Ok(())
            }
        }
    }

    fn master_completed(
        &mut self,
        cache: &AppCache,
        url: &Url,
        response_id: i64,
        outcome: FetchOutcome,
    ) -> StepResult<()> {
        let message = match outcome {
            FetchOutcome::Stored { size, .. } => {
                cache.add_or_modify_entry(
                    url.as_str(),
                    Entry::new(EntryFlags::MASTER, response_id, size),
                );
                self.masters_fetched += 1;
                return Ok(());
            }
            FetchOutcome::Disk(e) => {
                return Err(fail(
                    FailureKind::Disk,
                    ErrorDetails::new(format!("Failed to store master entry: {e}"), ErrorReason::Resource)
                        .with_url(url.as_str()),
                ));
            }
            FetchOutcome::Status(info) => format!("Master entry fetch failed ({})", info.status),
            FetchOutcome::NotModified => "Master entry fetch failed (304)".to_string(),
            FetchOutcome::Network(e) => format!("Master entry fetch failed ({e})"),
        };

        self.masters_failed += 1;
        tracing::warn!(url = %url, %message, "Master entry failed");
        let hosts = self.masters.get(url.as_str()).cloned().unwrap_or_default();
        notify_hosts(
            &hosts,
            &HostEvent::Error(
                ErrorDetails::new(message, ErrorReason::Resource).with_url(url.as_str()),
            ),
        );
        self.master_hosts.retain(|host| !hosts.contains(host));
        Ok(())
    }

    /// Fetch the manifest again and store it, failing if it changed.
    async fn refetch_manifest(&mut self, cache: &AppCache, first: FetchResponse) -> StepResult<()> {
        self.set_state(UpdateState::RefetchManifest);
        let manifest_url = self.group.manifest_url().clone();

        match self.fetch(FetchRequest::new(manifest_url.clone())).await? {
            Ok(response) if response.is_success() && response.body == first.body => {}
            Ok(_) => {
                return Err(fail(
                    FailureKind::ManifestChanged,
                    ErrorDetails::new("Manifest changed during update", ErrorReason::Changed)
                        .with_url(manifest_url.as_str()),
                ));
            }
            Err(e) => {
                return Err(fail(
                    FailureKind::Network,
                    ErrorDetails::new(format!("Manifest re-fetch failed ({e})"), ErrorReason::Manifest)
                        .with_url(manifest_url.as_str()),
                ));
            }
        }

        let mut writer = self.ctx.storage.create_response_writer();
        self.uncommitted.push(writer.response_id());
        let size = write_response(&mut writer, &first.info, first.body)
            .await
            .map_err(|e| {
                fail(
                    FailureKind::Disk,
                    ErrorDetails::new(format!("Failed to store manifest: {e}"), ErrorReason::Manifest)
                        .with_url(manifest_url.as_str()),
                )
            })?;
        cache.add_or_modify_entry(
            manifest_url.as_str(),
            Entry::new(EntryFlags::MANIFEST, writer.response_id(), size),
        );
        Ok(())
    }

    /// Commit `cache` as the group's newest, then retire responses this
    /// attempt wrote but the cache does not reference.
    async fn store(
        &mut self,
        cache: AppCache,
        last_full_check: Option<OffsetDateTime>,
    ) -> StepResult<i64> {
        if self.cancel.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        let cache = Arc::new(cache);
        let cache_id = cache.cache_id();
        self.ctx
            .storage
            .store_group_and_newest_cache(&self.group, cache.clone(), (last_full_check, None))
            .await
            .map_err(commit_failure)?;

        let referenced: HashSet<i64> = cache.response_ids().into_iter().collect();
        self.uncommitted.retain(|id| !referenced.contains(id));
        self.discard_uncommitted().await;

        for host in &self.master_hosts {
            self.group.add_host(host.clone());
        }
        Ok(cache_id)
    }

    async fn no_update(&mut self) -> StepResult<UpdateOutcome> {
        self.set_state(UpdateState::NoUpdate);
        let last_full_check = self.last_full_check_time();

        let mut masters: Vec<Url> = self.initial_masters.drain(..).collect();
        let late = self.shared.close();
        masters.extend(self.accept_masters(late));

        match self.newest.clone() {
            Some(newest) if !masters.is_empty() => {
                let cache = newest.copy_with_id(self.ctx.storage.new_cache_id());
                let queue = masters.into_iter().map(FetchItem::Master).collect();
                self.fetch_all(&cache, queue, false).await?;
                self.store(cache, last_full_check).await?;
            }
            _ => {
                self.group.set_eviction_times(last_full_check, None);
                if let Err(e) = self.ctx.storage.store_eviction_times(&self.group).await {
                    tracing::warn!(error = %e, "Failed to store eviction times");
                }
            }
        }

        self.set_state(UpdateState::Completed);
        self.notify_all(&HostEvent::Status(EventId::NoUpdate));
        Ok(UpdateOutcome::NoUpdate)
    }

    async fn obsolete(&mut self) -> StepResult<UpdateOutcome> {
        let late = self.shared.close();
        self.accept_masters(late);
        self.ctx
            .storage
            .make_group_obsolete(&self.group)
            .await
            .map_err(|e| {
                fail(
                    FailureKind::Database,
                    ErrorDetails::new(format!("Failed to remove obsolete group: {e}"), ErrorReason::Unknown),
                )
            })?;
        self.set_state(UpdateState::Completed);
        tracing::info!("Manifest gone, group is obsolete");
        self.notify_all(&HostEvent::Status(EventId::Obsolete));
        Ok(UpdateOutcome::Obsolete)
    }

    async fn cache_failure(&mut self, failure: UpdateFailure) -> UpdateOutcome {
        self.set_state(UpdateState::CacheFailure);
        tracing::warn!(
            kind = ?failure.kind,
            message = %failure.details.message,
            url = ?failure.details.url,
            "Update failed"
        );
        let late = self.shared.close();
        self.accept_masters(late);
        self.discard_uncommitted().await;
        self.notify_all(&HostEvent::Error(failure.details.clone()));

        if self.newest.is_some() && failure.kind.is_evictable() {
            self.record_evictable_failure().await;
        }
        UpdateOutcome::Failed {
            restart: failure.kind == FailureKind::ManifestChanged,
            failure,
        }
    }

    /// Remember the first evictable failure; once it is older than the
    /// eviction threshold, another one deletes the group.
    async fn record_evictable_failure(&self) {
        let now = OffsetDateTime::now_utc();
        match self.group.first_evictable_error_time() {
            None => {
                self.group
                    .set_eviction_times(self.group.last_full_update_check_time(), Some(now));
                if let Err(e) = self.ctx.storage.store_eviction_times(&self.group).await {
                    tracing::warn!(error = %e, "Failed to store eviction times");
                }
            }
            Some(first) if now - first > self.ctx.config.eviction_threshold() => {
                tracing::info!(first_error = %first, "Evicting group after repeated failures");
                if let Err(e) = self.ctx.storage.make_group_obsolete(&self.group).await {
                    tracing::warn!(error = %e, "Failed to evict group");
                }
            }
            Some(_) => {}
        }
    }

    async fn cancelled(&mut self) -> UpdateOutcome {
        self.set_state(UpdateState::Cancelled);
        self.shared.close();
        self.discard_uncommitted().await;
        UpdateOutcome::Cancelled
    }

    async fn discard_uncommitted(&mut self) {
        let ids = std::mem::take(&mut self.uncommitted);
        if ids.is_empty() {
            return;
        }
        if let Err(e) = self.ctx.storage.doom_responses(&ids).await {
            tracing::warn!(error = %e, count = ids.len(), "Failed to queue responses, deleting now");
            self.ctx.storage.delete_responses(&ids).await;
        }
    }

    fn last_full_check_time(&self) -> Option<OffsetDateTime> {
        if self.doing_full_check {
            Some(OffsetDateTime::now_utc())
        } else {
            self.group.last_full_update_check_time()
        }
    }

    /// Register joining masters and their hosts. Returns the URLs not yet
    /// part of this attempt.
    fn accept_masters(&mut self, masters: Vec<PendingMaster>) -> Vec<Url> {
        let group_hosts = self.group.hosts();
        let mut fresh = Vec::new();
        let mut seen: BTreeSet<String> = self.masters.keys().cloned().collect();

        for PendingMaster { url, host } in masters {
            let hosts = self.masters.entry(url.to_string()).or_default();
            if let Some(host) = &host
                && !hosts.contains(host)
            {
                hosts.push(host.clone());
            }
            if seen.insert(url.to_string()) {
                fresh.push(url);
            }

            let Some(host) = host else { continue };
            if self.master_hosts.contains(&host) || group_hosts.contains(&host) {
                continue;
            }
            if self.announced {
                self.catch_up(&host);
            }
            self.master_hosts.push(host);
        }
        fresh
    }

    /// Bring a host that joined late up to the current state.
    fn catch_up(&self, host: &HostHandle) {
        let hosts = std::slice::from_ref(host);
        notify_hosts(hosts, &HostEvent::Status(EventId::Checking));
        if self.state == UpdateState::Downloading {
            notify_hosts(hosts, &HostEvent::Status(EventId::Downloading));
        }
    }

    fn notify_all(&self, event: &HostEvent) {
        let mut hosts = self.group.hosts();
        hosts.extend(self.master_hosts.iter().cloned());
        notify_hosts(&hosts, event);
    }

    async fn fetch(&self, request: FetchRequest) -> StepResult<Result<FetchResponse, FetchError>> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Halt::Cancelled),
            response = fetch_with_retries(
                self.ctx.fetcher.as_ref(),
                request,
                self.ctx.config.max_503_retries,
            ) => Ok(response),
        }
    }
}

fn commit_failure(error: ServiceError) -> Halt {
    let (kind, reason) = match &error {
        ServiceError::QuotaExceeded { .. } => (FailureKind::Quota, ErrorReason::Quota),
        ServiceError::Storage(_) => (FailureKind::Disk, ErrorReason::Unknown),
        _ => (FailureKind::Database, ErrorReason::Unknown),
    };
    fail(
        kind,
        ErrorDetails::new(format!("Failed to commit new cache to storage: {error}"), reason),
    )
}

/// GET with retries of `503 Retry-After: 0`.
async fn fetch_with_retries(
    fetcher: &dyn Fetcher,
    request: FetchRequest,
    max_retries: u32,
) -> Result<FetchResponse, FetchError> {
    let mut retries = 0;
    loop {
        let response = fetcher.fetch(request.clone()).await?;
        let retry_now = response.status() == 503
            && response.info.header("retry-after").map(str::trim) == Some("0");
        if retry_now && retries < max_retries {
            retries += 1;
            tracing::debug!(url = %request.url, retries, "Retrying 503");
            continue;
        }
        return Ok(response);
    }
}

async fn fetch_and_store(
    ctx: Arc<UpdateContext>,
    item: FetchItem,
    mut writer: ResponseWriter,
) -> FetchDone {
    let mut request = FetchRequest::new(item.url().clone());
    if let FetchItem::Resource {
        existing: Some(entry),
        ..
    } = &item
        && entry.has_response_id()
        && let Ok(info) = ctx
            .storage
            .create_response_reader(entry.response_id)
            .read_info()
            .await
    {
        request = request.with_validators(&info);
    }

    let outcome = match fetch_with_retries(ctx.fetcher.as_ref(), request, ctx.config.max_503_retries).await {
        Err(e) => FetchOutcome::Network(e),
        Ok(response) if response.status() == 304 => FetchOutcome::NotModified,
        Ok(response) if !response.is_success() => FetchOutcome::Status(response.info),
        Ok(response) => match write_response(&mut writer, &response.info, response.body).await {
            Ok(size) => FetchOutcome::Stored {
                size,
                info: response.info,
            },
            Err(e) => FetchOutcome::Disk(e),
        },
    };

    FetchDone {
        item,
        response_id: writer.response_id(),
        outcome,
    }
}

async fn write_response(
    writer: &mut ResponseWriter,
    info: &ResponseInfo,
    body: Bytes,
) -> Result<i64, StorageError> {
    writer.write_info(info).await?;
    writer.write_data(body).await?;
    Ok(i64::try_from(writer.amount_written()).unwrap_or(i64::MAX))
}
