//! Update jobs: download a group's manifest and resources into a new cache.
//!
//! One job runs per group at a time. Documents that load while a job runs
//! join it as pending masters until the job re-fetches the manifest; after
//! that point they are queued for the next run by the service.

mod job;

pub use job::UpdateJob;

use crate::fetch::Fetcher;
use crate::host::HostHandle;
use crate::storage::AppCacheStorage;
use std::sync::{Arc, Mutex, MutexGuard};
use stowage_core::config::UpdateConfig;
use stowage_core::{ErrorDetails, ManifestParser};
use tokio::sync::Notify;
use url::Url;

/// Collaborators shared by every job.
pub struct UpdateContext {
    pub storage: Arc<AppCacheStorage>,
    pub fetcher: Arc<dyn Fetcher>,
    pub parser: Arc<dyn ManifestParser>,
    pub config: UpdateConfig,
}

/// Internal job state, logged on every transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateState {
    FetchManifest,
    NoUpdate,
    Downloading,
    RefetchManifest,
    CacheFailure,
    Cancelled,
    Completed,
}

/// Why an update attempt failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureKind {
    /// Manifest missing, unparsable or served with an error status.
    Manifest,
    Redirect,
    /// A required resource returned an error status.
    Server,
    /// Cross-origin HTTPS resource that forbids storing.
    Security,
    Network,
    Disk,
    Database,
    Quota,
    /// The manifest differed when fetched again after downloading.
    ManifestChanged,
}

impl FailureKind {
    /// Failures that count towards evicting a group that keeps failing.
    ///
    /// Only errors that point at the site itself qualify; local trouble
    /// (disk, database, quota) and transient network failures never do.
    pub fn is_evictable(self) -> bool {
        matches!(
            self,
            FailureKind::Manifest
                | FailureKind::Redirect
                | FailureKind::Server
                | FailureKind::Security
        )
    }
}

/// A failed attempt: its kind plus what hosts are told.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateFailure {
    pub kind: FailureKind,
    pub details: ErrorDetails,
}

impl UpdateFailure {
    pub fn new(kind: FailureKind, details: ErrorDetails) -> Self {
        Self { kind, details }
    }
}

/// How a job ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new cache was committed. `first` is set when the group had no cache.
    Completed { cache_id: i64, first: bool },
    NoUpdate,
    Obsolete,
    Failed {
        failure: UpdateFailure,
        /// The service should run the update again shortly.
        restart: bool,
    },
    Cancelled,
}

/// A document whose own URL should be cached as a master entry.
#[derive(Clone, Debug)]
pub struct PendingMaster {
    pub url: Url,
    pub host: Option<HostHandle>,
}

impl PendingMaster {
    pub fn new(url: Url, host: Option<HostHandle>) -> Self {
        Self { url, host }
    }
}

struct SharedState {
    accepting: bool,
    pending: Vec<PendingMaster>,
}

/// The part of a running job other tasks may touch: the pending master
/// queue and the signal that wakes the job when it grows.
pub struct JobShared {
    state: Mutex<SharedState>,
    wake: Notify,
}

impl JobShared {
    pub fn new(initial: Vec<PendingMaster>) -> Self {
        Self {
            state: Mutex::new(SharedState {
                accepting: true,
                pending: initial,
            }),
            wake: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Update job lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Hand a master to the running job. Gives it back once the job has
    /// passed the point where it can still add entries.
    pub fn try_add_master(&self, master: PendingMaster) -> Result<(), PendingMaster> {
        {
            let mut state = self.lock();
            if !state.accepting {
                return Err(master);
            }
            state.pending.push(master);
        }
        self.wake.notify_one();
        Ok(())
    }

    pub fn is_accepting(&self) -> bool {
        self.lock().accepting
    }

    fn take_pending(&self) -> Vec<PendingMaster> {
        std::mem::take(&mut self.lock().pending)
    }

    /// Stop accepting masters, returning any not yet taken.
    fn close(&self) -> Vec<PendingMaster> {
        let mut state = self.lock();
        state.accepting = false;
        std::mem::take(&mut state.pending)
    }

    /// Stop accepting only if nothing is waiting to be taken.
    fn close_if_idle(&self) -> bool {
        let mut state = self.lock();
        if state.pending.is_empty() {
            state.accepting = false;
            true
        } else {
            false
        }
    }
}
