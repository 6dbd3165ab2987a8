//! Bridge between the offline cache and an external quota manager.
//!
//! The quota manager itself is out of scope. [`QuotaManagerProxy`] is what the
//! cache reports to; [`AppCacheQuotaClient`] is what the quota manager calls
//! back into.

use crate::error::ServiceResult;
use crate::service::AppCacheService;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex, Weak};

/// Outbound half: usage and access notifications plus the per-origin quota.
#[async_trait]
pub trait QuotaManagerProxy: Send + Sync {
    fn notify_storage_accessed(&self, origin: &str);

    /// `delta` is signed: negative when data was freed.
    fn notify_storage_modified(&self, origin: &str, delta: i64);

    /// Bytes the origin may use; `None` means unlimited.
    async fn quota_for_origin(&self, origin: &str) -> Option<i64>;
}

/// No quota and nobody listening.
#[derive(Clone, Copy, Debug, Default)]
pub struct UnlimitedQuota;

#[async_trait]
impl QuotaManagerProxy for UnlimitedQuota {
    fn notify_storage_accessed(&self, _origin: &str) {}

    fn notify_storage_modified(&self, _origin: &str, _delta: i64) {}

    async fn quota_for_origin(&self, _origin: &str) -> Option<i64> {
        None
    }
}

/// Same quota for every origin; records the notifications it receives.
#[derive(Debug, Default)]
pub struct FixedQuota {
    quota: Option<i64>,
    modified: Mutex<BTreeMap<String, i64>>,
    accessed: Mutex<BTreeMap<String, u64>>,
}

impl FixedQuota {
    pub fn new(quota: i64) -> Self {
        Self {
            quota: Some(quota),
            ..Self::default()
        }
    }

    /// Sum of reported deltas for the origin.
    pub fn reported_usage(&self, origin: &str) -> i64 {
        self.modified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(origin)
            .copied()
            .unwrap_or_default()
    }

    pub fn access_count(&self, origin: &str) -> u64 {
        self.accessed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(origin)
            .copied()
            .unwrap_or_default()
    }
}

#[async_trait]
impl QuotaManagerProxy for FixedQuota {
    fn notify_storage_accessed(&self, origin: &str) {
        *self
            .accessed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(origin.to_string())
            .or_default() += 1;
    }

    fn notify_storage_modified(&self, origin: &str, delta: i64) {
        *self
            .modified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(origin.to_string())
            .or_default() += delta;
    }

    async fn quota_for_origin(&self, _origin: &str) -> Option<i64> {
        self.quota
    }
}

/// Inbound half: the interface a quota manager drives.
#[async_trait]
pub trait QuotaClient: Send + Sync {
    async fn get_origin_usage(&self, origin: &str) -> i64;

    async fn get_origins(&self) -> Vec<String>;

    async fn delete_origin_data(&self, origin: &str) -> ServiceResult<()>;
}

/// Quota client backed by an [`AppCacheService`].
///
/// Holds the service weakly: once the service is gone every call answers
/// empty and deletions succeed trivially.
pub struct AppCacheQuotaClient {
    service: Weak<AppCacheService>,
}

impl AppCacheQuotaClient {
    pub fn new(service: Weak<AppCacheService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl QuotaClient for AppCacheQuotaClient {
    async fn get_origin_usage(&self, origin: &str) -> i64 {
        match self.service.upgrade() {
            Some(service) => service.origin_usage(origin),
            None => 0,
        }
    }

    async fn get_origins(&self) -> Vec<String> {
        match self.service.upgrade() {
            Some(service) => service.origins(),
            None => Vec::new(),
        }
    }

    async fn delete_origin_data(&self, origin: &str) -> ServiceResult<()> {
        let Some(service) = self.service.upgrade() else {
            return Ok(());
        };
        service.delete_origin_data(origin).await.map(|_| ())
    }
}
