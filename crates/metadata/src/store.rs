//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{CommitBatch, CommitOutcome, GroupDeletion, StorageIds};
use crate::repos::{CacheRepo, DeletableResponseRepo, EntryRepo, GroupRepo, NamespaceRepo};
use crate::schema;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite};
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stowage_core::config::DatabaseConfig;
use time::OffsetDateTime;

/// Database file name inside the metadata directory.
pub const DATABASE_FILE_NAME: &str = "Index";

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    GroupRepo + CacheRepo + EntryRepo + NamespaceRepo + DeletableResponseRepo + Send + Sync
{
    /// Check database connectivity. Opens (and creates) the database.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Highest ids in use; all zero when no database exists yet.
    async fn find_last_storage_ids(&self) -> MetadataResult<StorageIds>;

    /// Atomically write a group and its new newest cache, retiring the cache it
    /// replaces.
    async fn store_group_and_cache(&self, batch: &CommitBatch) -> MetadataResult<CommitOutcome>;

    /// Atomically delete a group with its cache, entries and namespaces. The
    /// freed response ids are queued as deletable.
    async fn delete_group_and_caches(&self, group_id: i64) -> MetadataResult<GroupDeletion>;

    /// Close the database and remove everything it stored.
    async fn delete_and_start_over(&self) -> MetadataResult<()>;

    fn is_disabled(&self) -> bool;

    /// Whether the database was wiped and recreated since the last call.
    /// Anything stored alongside it is orphaned when this returns true.
    fn take_recreated(&self) -> bool;

    /// Fail every further call with [`MetadataError::Disabled`].
    fn disable(&self);

    async fn close(&self);
}

/// SQLite-based metadata store.
///
/// The database is opened on first use. Read paths never create it: with no
/// database file they behave as if every table were empty. On open the file
/// is integrity-checked, upgraded and matched against the experiment-flag
/// fingerprint; any failure wipes the directory and starts from an empty
/// schema. When even that fails the store is disabled for good.
pub struct SqliteStore {
    location: DatabaseConfig,
    experiment_flags: String,
    pool: tokio::sync::Mutex<Option<Pool<Sqlite>>>,
    disabled: AtomicBool,
    recreated: AtomicBool,
    lazy_last_access: std::sync::Mutex<HashMap<i64, OffsetDateTime>>,
}

impl SqliteStore {
    pub fn new(location: DatabaseConfig, experiment_flags: impl Into<String>) -> Self {
        Self {
            location,
            experiment_flags: experiment_flags.into(),
            pool: tokio::sync::Mutex::new(None),
            disabled: AtomicBool::new(false),
            recreated: AtomicBool::new(false),
            lazy_last_access: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(DatabaseConfig::Memory, "")
    }

    /// Path of the database file, if stored on disk.
    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.location {
            DatabaseConfig::Sqlite { directory } => Some(directory.join(DATABASE_FILE_NAME)),
            DatabaseConfig::Memory => None,
        }
    }

    fn database_exists(&self) -> bool {
        self.database_path().is_some_and(|path| path.exists())
    }

    fn lazy_times(&self) -> std::sync::MutexGuard<'_, HashMap<i64, OffsetDateTime>> {
        self.lazy_last_access.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("lazy last-access map mutex poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Pool for read paths; `None` when no database exists yet.
    async fn reader(&self) -> MetadataResult<Option<Pool<Sqlite>>> {
        self.open(false).await
    }

    /// Pool for write paths, creating the database if needed.
    async fn writer(&self) -> MetadataResult<Pool<Sqlite>> {
        self.open(true)
            .await?
            .ok_or_else(|| MetadataError::Internal("database was not created".to_string()))
    }

    async fn open(&self, create_if_needed: bool) -> MetadataResult<Option<Pool<Sqlite>>> {
        if self.is_disabled() {
            return Err(MetadataError::Disabled);
        }

        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(Some(pool.clone()));
        }
        if !create_if_needed && !self.database_exists() {
            return Ok(None);
        }

        let pool = match self.try_open().await {
            Ok(pool) => pool,
            Err(e) => {
                tracing::warn!(error = %e, "Metadata database unusable, recreating");
                match self.recreate().await {
                    Ok(pool) => {
                        self.recreated.store(true, Ordering::SeqCst);
                        pool
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to recreate metadata database, disabling");
                        self.disabled.store(true, Ordering::SeqCst);
                        return Err(MetadataError::Disabled);
                    }
                }
            }
        };

        *guard = Some(pool.clone());
        Ok(Some(pool))
    }

    async fn connect(&self) -> MetadataResult<Pool<Sqlite>> {
        let opts = match &self.location {
            DatabaseConfig::Sqlite { directory } => {
                std::fs::create_dir_all(directory)?;
                SqliteConnectOptions::new()
                    .filename(directory.join(DATABASE_FILE_NAME))
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Normal)
                    .busy_timeout(Duration::from_secs(5))
            }
            DatabaseConfig::Memory => SqliteConnectOptions::from_str("sqlite::memory:")?,
        };

        // A single connection keeps database work FIFO and keeps an in-memory
        // database alive for the lifetime of the pool.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Ok(pool)
    }

    async fn try_open(&self) -> MetadataResult<Pool<Sqlite>> {
        let pool = self.connect().await?;
        if let Err(e) = self.ensure_schema(&pool).await {
            pool.close().await;
            return Err(e);
        }
        Ok(pool)
    }

    async fn ensure_schema(&self, pool: &Pool<Sqlite>) -> MetadataResult<()> {
        let check: Vec<String> = sqlx::query_scalar("PRAGMA quick_check")
            .fetch_all(pool)
            .await?;
        if check.len() != 1 || check[0] != "ok" {
            return Err(MetadataError::Schema(format!(
                "integrity check failed: {}",
                check.join("; ")
            )));
        }

        let has_meta: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='Meta')",
        )
        .fetch_one(pool)
        .await?;

        if !has_meta {
            let tables: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type='table'")
                    .fetch_one(pool)
                    .await?;
            if tables > 0 {
                return Err(MetadataError::Schema(
                    "database has tables but no version metadata".to_string(),
                ));
            }
            tracing::info!(version = schema::CURRENT_VERSION, "Creating metadata schema");
            return schema::create_schema(pool, &self.experiment_flags).await;
        }

        let compatible = schema::meta_version(pool, "last_compatible_version").await?;
        if compatible > schema::CURRENT_VERSION {
            return Err(MetadataError::Schema(format!(
                "database requires schema version {compatible}, this build writes {}",
                schema::CURRENT_VERSION
            )));
        }

        let version = schema::meta_version(pool, "version").await?;
        if version < schema::DEEPEST_UPGRADE_VERSION {
            return Err(MetadataError::Schema(format!(
                "schema version {version} is too old to upgrade"
            )));
        }
        if version < schema::CURRENT_VERSION {
            schema::upgrade(pool, version).await?;
            // Fill in indexes older versions did not have.
            sqlx::query(schema::SCHEMA_SQL).execute(pool).await?;
        }

        let stored_flags = schema::meta_value(pool, "experiment_flags")
            .await?
            .unwrap_or_default();
        if stored_flags != self.experiment_flags {
            return Err(MetadataError::Schema(format!(
                "experiment flags changed from '{stored_flags}' to '{}'",
                self.experiment_flags
            )));
        }

        Ok(())
    }

    async fn recreate(&self) -> MetadataResult<Pool<Sqlite>> {
        if let DatabaseConfig::Sqlite { directory } = &self.location
            && directory.exists()
        {
            std::fs::remove_dir_all(directory)?;
        }
        let pool = self.connect().await?;
        schema::create_schema(&pool, &self.experiment_flags).await?;
        tracing::info!("Recreated metadata database");
        Ok(pool)
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn health_check(&self) -> MetadataResult<()> {
        let pool = self.writer().await?;
        sqlx::query("SELECT 1").execute(&pool).await?;
        Ok(())
    }

    async fn find_last_storage_ids(&self) -> MetadataResult<StorageIds> {
        let Some(pool) = self.reader().await? else {
            return Ok(StorageIds::default());
        };

        let max = |sql: &'static str| {
            let pool = pool.clone();
            async move {
                let value: Option<i64> = sqlx::query_scalar(sql).fetch_one(&pool).await?;
                Ok::<i64, MetadataError>(value.unwrap_or(0))
            }
        };

        let last_group_id = max("SELECT MAX(group_id) FROM Groups").await?;
        let last_cache_id = max("SELECT MAX(cache_id) FROM Caches").await?;
        let last_entry_response_id = max("SELECT MAX(response_id) FROM Entries").await?;
        let last_deletable_response_id =
            max("SELECT MAX(response_id) FROM DeletableResponseIds").await?;
        let last_deletable_response_rowid =
            max("SELECT MAX(rowid) FROM DeletableResponseIds").await?;

        Ok(StorageIds {
            last_group_id,
            last_cache_id,
            last_response_id: last_entry_response_id.max(last_deletable_response_id),
            last_deletable_response_rowid,
        })
    }

    async fn store_group_and_cache(&self, batch: &CommitBatch) -> MetadataResult<CommitOutcome> {
        let pool = self.writer().await?;
        let mut tx = pool.begin().await?;

        let group = &batch.group;
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM Groups WHERE group_id = ?)")
                .bind(group.group_id)
                .fetch_one(&mut *tx)
                .await?;

        let mut old_size = 0i64;
        let mut deletable_response_ids = Vec::new();

        if exists {
            sqlx::query(
                r#"
                UPDATE Groups
                SET last_access_time = ?, last_full_update_check_time = ?,
                    first_evictable_error_time = ?
                WHERE group_id = ?
                "#,
            )
            .bind(group.last_access_time)
            .bind(group.last_full_update_check_time)
            .bind(group.first_evictable_error_time)
            .bind(group.group_id)
            .execute(&mut *tx)
            .await?;

            let old_cache: Option<(i64, i64)> =
                sqlx::query_as("SELECT cache_id, cache_size FROM Caches WHERE group_id = ?")
                    .bind(group.group_id)
                    .fetch_optional(&mut *tx)
                    .await?;

            if let Some((old_cache_id, size)) = old_cache {
                old_size = size;
                let old_ids: Vec<i64> =
                    sqlx::query_scalar("SELECT response_id FROM Entries WHERE cache_id = ?")
                        .bind(old_cache_id)
                        .fetch_all(&mut *tx)
                        .await?;

                for sql in [
                    "DELETE FROM Entries WHERE cache_id = ?",
                    "DELETE FROM Namespaces WHERE cache_id = ?",
                    "DELETE FROM OnlineWhiteLists WHERE cache_id = ?",
                    "DELETE FROM Caches WHERE cache_id = ?",
                ] {
                    sqlx::query(sql).bind(old_cache_id).execute(&mut *tx).await?;
                }

                // Responses carried over into the new cache stay alive.
                let kept: std::collections::HashSet<i64> =
                    batch.entries.iter().map(|e| e.response_id).collect();
                deletable_response_ids = old_ids
                    .into_iter()
                    .filter(|id| !kept.contains(id))
                    .collect();

                for id in &deletable_response_ids {
                    sqlx::query("INSERT OR IGNORE INTO DeletableResponseIds (response_id) VALUES (?)")
                        .bind(id)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        } else {
            let inserted = sqlx::query(
                r#"
                INSERT INTO Groups (
                    group_id, origin, manifest_url, creation_time, last_access_time,
                    last_full_update_check_time, first_evictable_error_time
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(group.group_id)
            .bind(&group.origin)
            .bind(&group.manifest_url)
            .bind(group.creation_time)
            .bind(group.last_access_time)
            .bind(group.last_full_update_check_time)
            .bind(group.first_evictable_error_time)
            .execute(&mut *tx)
            .await;
            map_unique_violation(inserted, || {
                format!("group for manifest {}", group.manifest_url)
            })?;
        }

        let new_size = batch.cache.cache_size;
        if let Some(quota) = batch.quota {
            let usage: i64 = sqlx::query_scalar(
                r#"
                SELECT COALESCE(SUM(c.cache_size), 0)
                FROM Caches c JOIN Groups g ON c.group_id = g.group_id
                WHERE g.origin = ?
                "#,
            )
            .bind(&group.origin)
            .fetch_one(&mut *tx)
            .await?;
            let new_usage = usage + new_size;
            if new_size > old_size && new_usage > quota {
                return Err(MetadataError::QuotaExceeded {
                    origin: group.origin.clone(),
                    usage: new_usage,
                    quota,
                });
            }
        }

        let cache = &batch.cache;
        sqlx::query(
            "INSERT INTO Caches (cache_id, group_id, online_wildcard, update_time, cache_size) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(cache.cache_id)
        .bind(cache.group_id)
        .bind(cache.online_wildcard)
        .bind(cache.update_time)
        .bind(cache.cache_size)
        .execute(&mut *tx)
        .await?;

        for entry in &batch.entries {
            sqlx::query(
                "INSERT INTO Entries (cache_id, url, flags, response_id, response_size) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(entry.cache_id)
            .bind(&entry.url)
            .bind(entry.flags)
            .bind(entry.response_id)
            .bind(entry.response_size)
            .execute(&mut *tx)
            .await?;
        }

        for record in batch
            .intercept_namespaces
            .iter()
            .chain(batch.fallback_namespaces.iter())
        {
            sqlx::query(
                "INSERT INTO Namespaces (cache_id, origin, type, namespace_url, target_url, is_pattern) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(record.cache_id)
            .bind(&record.origin)
            .bind(record.namespace.kind.as_i64())
            .bind(&record.namespace.namespace_url)
            .bind(&record.namespace.target_url)
            .bind(record.namespace.is_pattern)
            .execute(&mut *tx)
            .await?;
        }

        for record in &batch.online_whitelists {
            sqlx::query(
                "INSERT INTO OnlineWhiteLists (cache_id, namespace_url, is_pattern) VALUES (?, ?, ?)",
            )
            .bind(record.cache_id)
            .bind(&record.namespace_url)
            .bind(record.is_pattern)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(CommitOutcome {
            deletable_response_ids,
            usage_delta: new_size - old_size,
        })
    }

    async fn delete_group_and_caches(&self, group_id: i64) -> MetadataResult<GroupDeletion> {
        let pool = self.writer().await?;
        let mut tx = pool.begin().await?;

        let origin: Option<String> =
            sqlx::query_scalar("SELECT origin FROM Groups WHERE group_id = ?")
                .bind(group_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(origin) = origin else {
            return Err(MetadataError::NotFound(format!("group {group_id}")));
        };

        let mut deletion = GroupDeletion {
            origin,
            ..GroupDeletion::default()
        };

        let cache: Option<(i64, i64)> =
            sqlx::query_as("SELECT cache_id, cache_size FROM Caches WHERE group_id = ?")
                .bind(group_id)
                .fetch_optional(&mut *tx)
                .await?;

        if let Some((cache_id, cache_size)) = cache {
            deletion.freed_bytes = cache_size;
            deletion.response_ids =
                sqlx::query_scalar("SELECT response_id FROM Entries WHERE cache_id = ?")
                    .bind(cache_id)
                    .fetch_all(&mut *tx)
                    .await?;

            for sql in [
                "DELETE FROM Entries WHERE cache_id = ?",
                "DELETE FROM Namespaces WHERE cache_id = ?",
                "DELETE FROM OnlineWhiteLists WHERE cache_id = ?",
                "DELETE FROM Caches WHERE cache_id = ?",
            ] {
                sqlx::query(sql).bind(cache_id).execute(&mut *tx).await?;
            }

            for id in &deletion.response_ids {
                sqlx::query("INSERT OR IGNORE INTO DeletableResponseIds (response_id) VALUES (?)")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query("DELETE FROM Groups WHERE group_id = ?")
            .bind(group_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.lazy_times().remove(&group_id);
        Ok(deletion)
    }

    async fn delete_and_start_over(&self) -> MetadataResult<()> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.take() {
            pool.close().await;
        }
        self.lazy_times().clear();

        if let DatabaseConfig::Sqlite { directory } = &self.location
            && directory.exists()
        {
            std::fs::remove_dir_all(directory)?;
        }
        self.disabled.store(false, Ordering::SeqCst);
        tracing::info!("Deleted metadata database");
        Ok(())
    }

    fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn take_recreated(&self) -> bool {
        self.recreated.swap(false, Ordering::SeqCst)
    }

    fn disable(&self) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            tracing::warn!("Metadata store disabled");
        }
    }

    async fn close(&self) {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.close().await;
        }
    }
}

/// Map a UNIQUE violation to `AlreadyExists`.
fn map_unique_violation<T>(
    result: Result<T, sqlx::Error>,
    what: impl FnOnce() -> String,
) -> MetadataResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(sqlx::Error::Database(db_err)) if db_err.message().contains("UNIQUE constraint") => {
            Err(MetadataError::AlreadyExists(what()))
        }
        Err(e) => Err(e.into()),
    }
}

// Implement all the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::namespaces::NamespaceSet;
    use std::collections::BTreeMap;
    use stowage_core::{EntryFlags, NamespaceType};

    impl SqliteStore {
        fn overlay(&self, mut group: GroupRecord) -> GroupRecord {
            if let Some(time) = self.lazy_times().get(&group.group_id) {
                group.last_access_time = *time;
            }
            group
        }

        fn split_namespaces(records: Vec<NamespaceRecord>) -> NamespaceSet {
            let mut set = NamespaceSet::default();
            for record in records {
                match record.namespace.kind {
                    NamespaceType::Intercept => set.intercepts.push(record),
                    NamespaceType::Fallback => set.fallbacks.push(record),
                    NamespaceType::Network => {}
                }
            }
            set
        }
    }

    #[async_trait]
    impl GroupRepo for SqliteStore {
        async fn find_group(&self, group_id: i64) -> MetadataResult<Option<GroupRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(None);
            };
            let row = sqlx::query_as::<_, GroupRecord>("SELECT * FROM Groups WHERE group_id = ?")
                .bind(group_id)
                .fetch_optional(&pool)
                .await?;
            Ok(row.map(|g| self.overlay(g)))
        }

        async fn find_group_for_manifest_url(
            &self,
            manifest_url: &str,
        ) -> MetadataResult<Option<GroupRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(None);
            };
            let row =
                sqlx::query_as::<_, GroupRecord>("SELECT * FROM Groups WHERE manifest_url = ?")
                    .bind(manifest_url)
                    .fetch_optional(&pool)
                    .await?;
            Ok(row.map(|g| self.overlay(g)))
        }

        async fn find_groups_for_origin(&self, origin: &str) -> MetadataResult<Vec<GroupRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let rows = sqlx::query_as::<_, GroupRecord>(
                "SELECT * FROM Groups WHERE origin = ? ORDER BY group_id",
            )
            .bind(origin)
            .fetch_all(&pool)
            .await?;
            Ok(rows.into_iter().map(|g| self.overlay(g)).collect())
        }

        async fn find_group_for_cache(&self, cache_id: i64) -> MetadataResult<Option<GroupRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(None);
            };
            let row = sqlx::query_as::<_, GroupRecord>(
                "SELECT g.* FROM Groups g JOIN Caches c ON c.group_id = g.group_id WHERE c.cache_id = ?",
            )
            .bind(cache_id)
            .fetch_optional(&pool)
            .await?;
            Ok(row.map(|g| self.overlay(g)))
        }

        async fn find_origins_with_groups(&self) -> MetadataResult<Vec<String>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let origins = sqlx::query_scalar("SELECT DISTINCT origin FROM Groups ORDER BY origin")
                .fetch_all(&pool)
                .await?;
            Ok(origins)
        }

        async fn insert_group(&self, group: &GroupRecord) -> MetadataResult<()> {
            let pool = self.writer().await?;
            let result = sqlx::query(
                r#"
                INSERT INTO Groups (
                    group_id, origin, manifest_url, creation_time, last_access_time,
                    last_full_update_check_time, first_evictable_error_time
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(group.group_id)
            .bind(&group.origin)
            .bind(&group.manifest_url)
            .bind(group.creation_time)
            .bind(group.last_access_time)
            .bind(group.last_full_update_check_time)
            .bind(group.first_evictable_error_time)
            .execute(&pool)
            .await;
            map_unique_violation(result, || format!("group {}", group.group_id))?;
            Ok(())
        }

        async fn delete_group(&self, group_id: i64) -> MetadataResult<()> {
            let pool = self.writer().await?;
            self.lazy_times().remove(&group_id);
            let result = sqlx::query("DELETE FROM Groups WHERE group_id = ?")
                .bind(group_id)
                .execute(&pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("group {group_id}")));
            }
            Ok(())
        }

        async fn update_last_access_time(
            &self,
            group_id: i64,
            time: OffsetDateTime,
        ) -> MetadataResult<()> {
            let pool = self.writer().await?;
            self.lazy_times().remove(&group_id);
            sqlx::query("UPDATE Groups SET last_access_time = ? WHERE group_id = ?")
                .bind(time)
                .bind(group_id)
                .execute(&pool)
                .await?;
            Ok(())
        }

        fn lazy_update_last_access_time(&self, group_id: i64, time: OffsetDateTime) {
            self.lazy_times().insert(group_id, time);
        }

        async fn commit_lazy_last_access_times(&self) -> MetadataResult<usize> {
            let pending: Vec<(i64, OffsetDateTime)> = self.lazy_times().drain().collect();
            if pending.is_empty() {
                return Ok(0);
            }

            let pool = self.writer().await?;
            let mut tx = pool.begin().await?;
            for (group_id, time) in &pending {
                sqlx::query("UPDATE Groups SET last_access_time = ? WHERE group_id = ?")
                    .bind(time)
                    .bind(group_id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(pending.len())
        }

        async fn update_eviction_times(
            &self,
            group_id: i64,
            last_full_update_check_time: Option<OffsetDateTime>,
            first_evictable_error_time: Option<OffsetDateTime>,
        ) -> MetadataResult<()> {
            let pool = self.writer().await?;
            let result = sqlx::query(
                "UPDATE Groups SET last_full_update_check_time = ?, first_evictable_error_time = ? WHERE group_id = ?",
            )
            .bind(last_full_update_check_time)
            .bind(first_evictable_error_time)
            .bind(group_id)
            .execute(&pool)
            .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("group {group_id}")));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl CacheRepo for SqliteStore {
        async fn find_cache(&self, cache_id: i64) -> MetadataResult<Option<CacheRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(None);
            };
            let row = sqlx::query_as::<_, CacheRecord>("SELECT * FROM Caches WHERE cache_id = ?")
                .bind(cache_id)
                .fetch_optional(&pool)
                .await?;
            Ok(row)
        }

        async fn find_cache_for_group(&self, group_id: i64) -> MetadataResult<Option<CacheRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(None);
            };
            let row = sqlx::query_as::<_, CacheRecord>("SELECT * FROM Caches WHERE group_id = ?")
                .bind(group_id)
                .fetch_optional(&pool)
                .await?;
            Ok(row)
        }

        async fn find_caches_for_origin(&self, origin: &str) -> MetadataResult<Vec<CacheRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let rows = sqlx::query_as::<_, CacheRecord>(
                r#"
                SELECT c.* FROM Caches c JOIN Groups g ON c.group_id = g.group_id
                WHERE g.origin = ? ORDER BY c.cache_id
                "#,
            )
            .bind(origin)
            .fetch_all(&pool)
            .await?;
            Ok(rows)
        }

        async fn insert_cache(&self, cache: &CacheRecord) -> MetadataResult<()> {
            let pool = self.writer().await?;
            let result = sqlx::query(
                "INSERT INTO Caches (cache_id, group_id, online_wildcard, update_time, cache_size) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(cache.cache_id)
            .bind(cache.group_id)
            .bind(cache.online_wildcard)
            .bind(cache.update_time)
            .bind(cache.cache_size)
            .execute(&pool)
            .await;
            map_unique_violation(result, || format!("cache {}", cache.cache_id))?;
            Ok(())
        }

        async fn delete_cache(&self, cache_id: i64) -> MetadataResult<()> {
            let pool = self.writer().await?;
            let result = sqlx::query("DELETE FROM Caches WHERE cache_id = ?")
                .bind(cache_id)
                .execute(&pool)
                .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("cache {cache_id}")));
            }
            Ok(())
        }

        async fn get_origin_usage(&self, origin: &str) -> MetadataResult<i64> {
            let Some(pool) = self.reader().await? else {
                return Ok(0);
            };
            let usage: i64 = sqlx::query_scalar(
                r#"
                SELECT COALESCE(SUM(c.cache_size), 0)
                FROM Caches c JOIN Groups g ON c.group_id = g.group_id
                WHERE g.origin = ?
                "#,
            )
            .bind(origin)
            .fetch_one(&pool)
            .await?;
            Ok(usage)
        }

        async fn get_all_origin_usage(&self) -> MetadataResult<BTreeMap<String, i64>> {
            let Some(pool) = self.reader().await? else {
                return Ok(BTreeMap::new());
            };
            let rows: Vec<(String, i64)> = sqlx::query_as(
                r#"
                SELECT g.origin, COALESCE(SUM(c.cache_size), 0)
                FROM Groups g JOIN Caches c ON c.group_id = g.group_id
                GROUP BY g.origin
                "#,
            )
            .fetch_all(&pool)
            .await?;
            Ok(rows.into_iter().collect())
        }
    }

    #[async_trait]
    impl EntryRepo for SqliteStore {
        async fn find_entries_for_cache(&self, cache_id: i64) -> MetadataResult<Vec<EntryRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let rows = sqlx::query_as::<_, EntryRecord>(
                "SELECT * FROM Entries WHERE cache_id = ? ORDER BY url",
            )
            .bind(cache_id)
            .fetch_all(&pool)
            .await?;
            Ok(rows)
        }

        async fn find_entries_for_url(&self, url: &str) -> MetadataResult<Vec<EntryRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let rows = sqlx::query_as::<_, EntryRecord>("SELECT * FROM Entries WHERE url = ?")
                .bind(url)
                .fetch_all(&pool)
                .await?;
            Ok(rows)
        }

        async fn find_entry(&self, cache_id: i64, url: &str) -> MetadataResult<Option<EntryRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(None);
            };
            let row = sqlx::query_as::<_, EntryRecord>(
                "SELECT * FROM Entries WHERE cache_id = ? AND url = ?",
            )
            .bind(cache_id)
            .bind(url)
            .fetch_optional(&pool)
            .await?;
            Ok(row)
        }

        async fn insert_entry(&self, entry: &EntryRecord) -> MetadataResult<()> {
            let pool = self.writer().await?;
            let result = sqlx::query(
                "INSERT INTO Entries (cache_id, url, flags, response_id, response_size) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(entry.cache_id)
            .bind(&entry.url)
            .bind(entry.flags)
            .bind(entry.response_id)
            .bind(entry.response_size)
            .execute(&pool)
            .await;
            map_unique_violation(result, || {
                format!("entry {} in cache {}", entry.url, entry.cache_id)
            })?;
            Ok(())
        }

        async fn add_entry_flags(
            &self,
            cache_id: i64,
            url: &str,
            flags: EntryFlags,
        ) -> MetadataResult<()> {
            let pool = self.writer().await?;
            let result =
                sqlx::query("UPDATE Entries SET flags = flags | ? WHERE cache_id = ? AND url = ?")
                    .bind(i64::from(flags.bits()))
                    .bind(cache_id)
                    .bind(url)
                    .execute(&pool)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!(
                    "entry {url} in cache {cache_id}"
                )));
            }
            Ok(())
        }

        async fn delete_entries_for_cache(&self, cache_id: i64) -> MetadataResult<u64> {
            let pool = self.writer().await?;
            let result = sqlx::query("DELETE FROM Entries WHERE cache_id = ?")
                .bind(cache_id)
                .execute(&pool)
                .await?;
            Ok(result.rows_affected())
        }

        async fn find_response_ids_for_cache(&self, cache_id: i64) -> MetadataResult<Vec<i64>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let ids = sqlx::query_scalar("SELECT response_id FROM Entries WHERE cache_id = ?")
                .bind(cache_id)
                .fetch_all(&pool)
                .await?;
            Ok(ids)
        }
    }

    #[async_trait]
    impl NamespaceRepo for SqliteStore {
        async fn find_namespaces_for_cache(&self, cache_id: i64) -> MetadataResult<NamespaceSet> {
            let Some(pool) = self.reader().await? else {
                return Ok(NamespaceSet::default());
            };
            let rows = sqlx::query_as::<_, NamespaceRecord>(
                "SELECT * FROM Namespaces WHERE cache_id = ? ORDER BY rowid",
            )
            .bind(cache_id)
            .fetch_all(&pool)
            .await?;
            Ok(Self::split_namespaces(rows))
        }

        async fn find_namespaces_for_origin(&self, origin: &str) -> MetadataResult<NamespaceSet> {
            let Some(pool) = self.reader().await? else {
                return Ok(NamespaceSet::default());
            };
            let rows = sqlx::query_as::<_, NamespaceRecord>(
                "SELECT * FROM Namespaces WHERE origin = ? ORDER BY rowid",
            )
            .bind(origin)
            .fetch_all(&pool)
            .await?;
            Ok(Self::split_namespaces(rows))
        }

        async fn insert_namespace(&self, record: &NamespaceRecord) -> MetadataResult<()> {
            let pool = self.writer().await?;
            let result = sqlx::query(
                "INSERT INTO Namespaces (cache_id, origin, type, namespace_url, target_url, is_pattern) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(record.cache_id)
            .bind(&record.origin)
            .bind(record.namespace.kind.as_i64())
            .bind(&record.namespace.namespace_url)
            .bind(&record.namespace.target_url)
            .bind(record.namespace.is_pattern)
            .execute(&pool)
            .await;
            map_unique_violation(result, || {
                format!(
                    "namespace {} in cache {}",
                    record.namespace.namespace_url, record.cache_id
                )
            })?;
            Ok(())
        }

        async fn delete_namespaces_for_cache(&self, cache_id: i64) -> MetadataResult<u64> {
            let pool = self.writer().await?;
            let result = sqlx::query("DELETE FROM Namespaces WHERE cache_id = ?")
                .bind(cache_id)
                .execute(&pool)
                .await?;
            Ok(result.rows_affected())
        }

        async fn find_online_whitelist_for_cache(
            &self,
            cache_id: i64,
        ) -> MetadataResult<Vec<OnlineWhiteListRecord>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let rows = sqlx::query_as::<_, OnlineWhiteListRecord>(
                "SELECT * FROM OnlineWhiteLists WHERE cache_id = ? ORDER BY rowid",
            )
            .bind(cache_id)
            .fetch_all(&pool)
            .await?;
            Ok(rows)
        }

        async fn insert_online_whitelist(
            &self,
            record: &OnlineWhiteListRecord,
        ) -> MetadataResult<()> {
            let pool = self.writer().await?;
            sqlx::query(
                "INSERT INTO OnlineWhiteLists (cache_id, namespace_url, is_pattern) VALUES (?, ?, ?)",
            )
            .bind(record.cache_id)
            .bind(&record.namespace_url)
            .bind(record.is_pattern)
            .execute(&pool)
            .await?;
            Ok(())
        }

        async fn delete_online_whitelist_for_cache(&self, cache_id: i64) -> MetadataResult<u64> {
            let pool = self.writer().await?;
            let result = sqlx::query("DELETE FROM OnlineWhiteLists WHERE cache_id = ?")
                .bind(cache_id)
                .execute(&pool)
                .await?;
            Ok(result.rows_affected())
        }
    }

    #[async_trait]
    impl DeletableResponseRepo for SqliteStore {
        async fn get_deletable_response_ids(
            &self,
            max_rowid: i64,
            limit: i64,
        ) -> MetadataResult<Vec<i64>> {
            let Some(pool) = self.reader().await? else {
                return Ok(Vec::new());
            };
            let ids = sqlx::query_scalar(
                "SELECT response_id FROM DeletableResponseIds WHERE rowid <= ? ORDER BY rowid LIMIT ?",
            )
            .bind(max_rowid)
            .bind(limit)
            .fetch_all(&pool)
            .await?;
            Ok(ids)
        }

        async fn insert_deletable_response_ids(&self, response_ids: &[i64]) -> MetadataResult<()> {
            if response_ids.is_empty() {
                return Ok(());
            }
            let pool = self.writer().await?;
            let mut tx = pool.begin().await?;
            for id in response_ids {
                sqlx::query("INSERT OR IGNORE INTO DeletableResponseIds (response_id) VALUES (?)")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn delete_deletable_response_ids(&self, response_ids: &[i64]) -> MetadataResult<()> {
            if response_ids.is_empty() {
                return Ok(());
            }
            let pool = self.writer().await?;
            let mut tx = pool.begin().await?;
            for id in response_ids {
                sqlx::query("DELETE FROM DeletableResponseIds WHERE response_id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            Ok(())
        }
    }
}
