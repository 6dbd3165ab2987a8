//! Metadata store for the stowage offline cache.
//!
//! This crate provides the durable data model:
//! - Groups, their newest complete caches, entries and namespaces
//! - Online whitelists
//! - The queue of response blobs awaiting deletion
//! - Schema versioning, upgrades, and wipe-and-recreate recovery

pub mod error;
pub mod models;
pub mod repos;
mod schema;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use repos::namespaces::NamespaceSet;
pub use store::{MetadataStore, SqliteStore};

use std::sync::Arc;
use stowage_core::config::MetadataConfig;

/// Create a metadata store from configuration. Nothing is opened until first use.
pub fn from_config(config: &MetadataConfig) -> Arc<dyn MetadataStore> {
    Arc::new(SqliteStore::new(
        config.database.clone(),
        config.experiment_flags.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use stowage_core::config::DatabaseConfig;

    #[tokio::test]
    async fn test_from_config_sqlite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let directory = temp_dir.path().join("index");
        let config = MetadataConfig {
            database: DatabaseConfig::Sqlite {
                directory: directory.clone(),
            },
            ..MetadataConfig::default()
        };

        let store = from_config(&config);
        assert!(!directory.exists());
        store.health_check().await.unwrap();
        assert!(directory.join(store::DATABASE_FILE_NAME).exists());
    }
}
