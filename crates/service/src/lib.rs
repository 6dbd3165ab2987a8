//! Offline cache service for stowage.
//!
//! This crate provides:
//! - In-memory groups and caches, deduplicated through a working set
//! - The storage façade over the metadata and response stores
//! - Update jobs that download a manifest's resources into a new cache
//! - The service: update scheduling, lookups, deletion and storage recovery
//! - Fetch and quota collaborators

pub mod cache;
pub mod error;
pub mod fetch;
pub mod group;
pub mod host;
pub mod quota;
pub mod service;
pub mod storage;
pub mod update;
pub mod working_set;

pub use cache::{AppCache, CacheLookup};
pub use error::{ServiceError, ServiceResult};
pub use fetch::{FetchError, FetchRequest, FetchResponse, Fetcher, HttpFetcher};
pub use group::AppCacheGroup;
pub use host::{ChannelFrontend, HostEvent, HostFrontend, HostHandle, HostId};
pub use quota::{
    AppCacheQuotaClient, FixedQuota, QuotaClient, QuotaManagerProxy, UnlimitedQuota,
};
pub use service::{AppCacheService, CheckResult, UpdateStart};
pub use storage::{AppCacheStorage, FoundResponse, MainResponse};
pub use update::{FailureKind, UpdateOutcome};
