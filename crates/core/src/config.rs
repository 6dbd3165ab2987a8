//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Response blob store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Response blobs as files under a directory.
    Filesystem {
        /// Root directory for response blobs.
        path: PathBuf,
    },
    /// In-process store; nothing survives a restart.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/responses"),
        }
    }
}

/// Where the metadata database lives.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DatabaseConfig {
    /// SQLite database inside `directory`. The whole directory is wiped when
    /// the database cannot be recovered.
    Sqlite { directory: PathBuf },
    /// In-memory SQLite database.
    Memory,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::Sqlite {
            directory: PathBuf::from("./data/index"),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Fingerprint of enabled experiments. A change between runs wipes the database.
    #[serde(default)]
    pub experiment_flags: String,
    /// Delay before buffered last-access times are written, in seconds.
    #[serde(default = "default_access_time_flush_secs")]
    pub access_time_flush_secs: u64,
}

fn default_access_time_flush_secs() -> u64 {
    300
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            experiment_flags: String::new(),
            access_time_flush_secs: default_access_time_flush_secs(),
        }
    }
}

impl MetadataConfig {
    pub fn access_time_flush_delay(&self) -> Duration {
        Duration::from_secs(self.access_time_flush_secs)
    }
}

/// Update job tuning.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Concurrent resource fetches per job.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Retries of a 503 response carrying `Retry-After: 0`.
    #[serde(default = "default_max_503_retries")]
    pub max_503_retries: u32,
    /// Minimum time between unconditional manifest checks, in seconds.
    #[serde(default = "default_full_update_interval_secs")]
    pub full_update_interval_secs: u64,
    /// Age of the first evictable failure after which another one deletes the group.
    #[serde(default = "default_eviction_threshold_secs")]
    pub eviction_threshold_secs: u64,
    /// Delay before retrying an update aborted by a manifest change.
    #[serde(default = "default_manifest_changed_retry_delay_ms")]
    pub manifest_changed_retry_delay_ms: u64,
}

fn default_max_concurrent_fetches() -> usize {
    2
}

fn default_max_503_retries() -> u32 {
    3
}

fn default_full_update_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_eviction_threshold_secs() -> u64 {
    14 * 24 * 60 * 60
}

fn default_manifest_changed_retry_delay_ms() -> u64 {
    1000
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: default_max_concurrent_fetches(),
            max_503_retries: default_max_503_retries(),
            full_update_interval_secs: default_full_update_interval_secs(),
            eviction_threshold_secs: default_eviction_threshold_secs(),
            manifest_changed_retry_delay_ms: default_manifest_changed_retry_delay_ms(),
        }
    }
}

impl UpdateConfig {
    pub fn full_update_interval(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.full_update_interval_secs).unwrap_or(i64::MAX))
    }

    pub fn eviction_threshold(&self) -> time::Duration {
        time::Duration::seconds(i64::try_from(self.eviction_threshold_secs).unwrap_or(i64::MAX))
    }

    pub fn manifest_changed_retry_delay(&self) -> Duration {
        Duration::from_millis(self.manifest_changed_retry_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_fetches == 0 {
            return Err("update.max_concurrent_fetches must be at least 1".to_string());
        }
        if self.eviction_threshold_secs > i64::MAX as u64 {
            return Err(format!(
                "update.eviction_threshold_secs {} exceeds maximum value {}",
                self.eviction_threshold_secs,
                i64::MAX
            ));
        }
        Ok(())
    }
}

/// Service lifecycle configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Smallest backoff increment between reinitializations, in seconds.
    #[serde(default = "default_reinit_min_increment_secs")]
    pub reinit_min_increment_secs: u64,
    /// Upper bound on the reinitialization delay, in seconds.
    #[serde(default = "default_reinit_max_delay_secs")]
    pub reinit_max_delay_secs: u64,
    /// Uptime after which the reinitialization delay starts from zero again.
    #[serde(default = "default_reinit_reset_after_secs")]
    pub reinit_reset_after_secs: u64,
    /// Responses removed per batch by the background deleter.
    #[serde(default = "default_deletion_batch_size")]
    pub deletion_batch_size: i64,
    /// Pause between deleter batches, in milliseconds.
    #[serde(default = "default_deletion_delay_ms")]
    pub deletion_delay_ms: u64,
    /// Origins whose data is cleared when the service shuts down.
    #[serde(default)]
    pub session_only_origins: Vec<String>,
}

fn default_reinit_min_increment_secs() -> u64 {
    30
}

fn default_reinit_max_delay_secs() -> u64 {
    60 * 60
}

fn default_reinit_reset_after_secs() -> u64 {
    60 * 60
}

fn default_deletion_batch_size() -> i64 {
    100
}

fn default_deletion_delay_ms() -> u64 {
    5
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            reinit_min_increment_secs: default_reinit_min_increment_secs(),
            reinit_max_delay_secs: default_reinit_max_delay_secs(),
            reinit_reset_after_secs: default_reinit_reset_after_secs(),
            deletion_batch_size: default_deletion_batch_size(),
            deletion_delay_ms: default_deletion_delay_ms(),
            session_only_origins: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn reinit_min_increment(&self) -> Duration {
        Duration::from_secs(self.reinit_min_increment_secs)
    }

    pub fn reinit_max_delay(&self) -> Duration {
        Duration::from_secs(self.reinit_max_delay_secs)
    }

    pub fn reinit_reset_after(&self) -> Duration {
        Duration::from_secs(self.reinit_reset_after_secs)
    }

    pub fn deletion_delay(&self) -> Duration {
        Duration::from_millis(self.deletion_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.deletion_batch_size <= 0 {
            return Err("service.deletion_batch_size must be positive".to_string());
        }
        if self.reinit_max_delay_secs < self.reinit_min_increment_secs {
            return Err(format!(
                "service.reinit_max_delay_secs ({}) is below reinit_min_increment_secs ({})",
                self.reinit_max_delay_secs, self.reinit_min_increment_secs
            ));
        }
        Ok(())
    }
}

/// HTTP fetcher configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_fetch_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_user_agent() -> String {
    concat!("stowage/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

impl FetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
}

impl AppConfig {
    /// In-memory database and blob store.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            storage: StorageConfig::Memory,
            metadata: MetadataConfig {
                database: DatabaseConfig::Memory,
                ..MetadataConfig::default()
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.update.validate()?;
        self.service.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_defaults() {
        let config = UpdateConfig::default();
        assert_eq!(config.max_concurrent_fetches, 2);
        assert_eq!(config.max_503_retries, 3);
        assert_eq!(config.full_update_interval(), time::Duration::hours(24));
        assert_eq!(config.eviction_threshold(), time::Duration::days(14));
        assert_eq!(config.manifest_changed_retry_delay(), Duration::from_secs(1));
    }

    #[test]
    fn storage_config_tagged_by_type() {
        let config: StorageConfig =
            serde_json::from_str(r#"{"type":"filesystem","path":"/var/lib/stowage"}"#).unwrap();
        match config {
            StorageConfig::Filesystem { path } => assert_eq!(path, PathBuf::from("/var/lib/stowage")),
            StorageConfig::Memory => panic!("expected filesystem config"),
        }

        let config: StorageConfig = serde_json::from_str(r#"{"type":"memory"}"#).unwrap();
        assert!(matches!(config, StorageConfig::Memory));
    }

    #[test]
    fn toml_sections_fill_in_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [metadata]
            experiment_flags = "intercepts-v2"

            [metadata.database]
            type = "memory"

            [update]
            max_concurrent_fetches = 4
            "#,
        )
        .unwrap();

        assert_eq!(config.metadata.experiment_flags, "intercepts-v2");
        assert!(matches!(config.metadata.database, DatabaseConfig::Memory));
        assert_eq!(config.update.max_concurrent_fetches, 4);
        assert_eq!(config.update.max_503_retries, 3);
        assert_eq!(config.service.deletion_batch_size, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = AppConfig::for_testing();
        config.update.max_concurrent_fetches = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_inverted_reinit_bounds() {
        let mut config = AppConfig::for_testing();
        config.service.reinit_max_delay_secs = 10;
        assert!(config.validate().is_err());
    }
}
