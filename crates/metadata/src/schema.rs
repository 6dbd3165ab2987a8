//! Schema definition and the version upgrade chain.

use crate::error::{MetadataError, MetadataResult};
use sqlx::{Pool, Sqlite};

/// Version written by this build.
pub(crate) const CURRENT_VERSION: i64 = 6;
/// Oldest reader that can use a database written by this build.
pub(crate) const COMPATIBLE_VERSION: i64 = 6;
/// Oldest version the upgrade chain starts from.
pub(crate) const DEEPEST_UPGRADE_VERSION: i64 = 3;

pub(crate) const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS Groups (
    group_id INTEGER PRIMARY KEY,
    origin TEXT NOT NULL,
    manifest_url TEXT NOT NULL,
    creation_time TEXT NOT NULL,
    last_access_time TEXT NOT NULL,
    last_full_update_check_time TEXT,
    first_evictable_error_time TEXT
);
CREATE INDEX IF NOT EXISTS GroupsOriginIndex ON Groups(origin);
CREATE UNIQUE INDEX IF NOT EXISTS GroupsManifestIndex ON Groups(manifest_url);

-- One newest complete cache per group
CREATE TABLE IF NOT EXISTS Caches (
    cache_id INTEGER PRIMARY KEY,
    group_id INTEGER NOT NULL,
    online_wildcard INTEGER NOT NULL CHECK(online_wildcard IN (0, 1)),
    update_time TEXT NOT NULL,
    cache_size INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS CachesGroupIndex ON Caches(group_id);

CREATE TABLE IF NOT EXISTS Entries (
    cache_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    flags INTEGER NOT NULL,
    response_id INTEGER NOT NULL,
    response_size INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS EntriesCacheAndUrlIndex ON Entries(cache_id, url);
CREATE INDEX IF NOT EXISTS EntriesUrlIndex ON Entries(url);
CREATE UNIQUE INDEX IF NOT EXISTS EntriesResponseIdIndex ON Entries(response_id);

-- Fallback (type 1) and intercept (type 2) namespaces
CREATE TABLE IF NOT EXISTS Namespaces (
    cache_id INTEGER NOT NULL,
    origin TEXT NOT NULL,
    type INTEGER NOT NULL,
    namespace_url TEXT NOT NULL,
    target_url TEXT NOT NULL,
    is_pattern INTEGER NOT NULL DEFAULT 0 CHECK(is_pattern IN (0, 1))
);
CREATE UNIQUE INDEX IF NOT EXISTS NamespacesCacheAndUrlIndex ON Namespaces(cache_id, namespace_url);
CREATE INDEX IF NOT EXISTS NamespacesOriginIndex ON Namespaces(origin);

CREATE TABLE IF NOT EXISTS OnlineWhiteLists (
    cache_id INTEGER NOT NULL,
    namespace_url TEXT NOT NULL,
    is_pattern INTEGER NOT NULL DEFAULT 0 CHECK(is_pattern IN (0, 1))
);
CREATE INDEX IF NOT EXISTS OnlineWhiteListCacheIndex ON OnlineWhiteLists(cache_id);

CREATE TABLE IF NOT EXISTS DeletableResponseIds (
    response_id INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS DeletableResponsesIdIndex ON DeletableResponseIds(response_id);

CREATE TABLE IF NOT EXISTS Meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// Layout of version 3 databases, the oldest the upgrade chain accepts.
#[cfg(test)]
pub(crate) const V3_SCHEMA_SQL: &str = r#"
CREATE TABLE Groups (
    group_id INTEGER PRIMARY KEY,
    origin TEXT NOT NULL,
    manifest_url TEXT NOT NULL,
    creation_time TEXT NOT NULL,
    last_access_time TEXT NOT NULL
);
CREATE UNIQUE INDEX GroupsManifestIndex ON Groups(manifest_url);
CREATE TABLE Caches (
    cache_id INTEGER PRIMARY KEY,
    group_id INTEGER NOT NULL,
    online_wildcard INTEGER NOT NULL CHECK(online_wildcard IN (0, 1)),
    update_time TEXT NOT NULL,
    cache_size INTEGER NOT NULL
);
CREATE TABLE Entries (
    cache_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    flags INTEGER NOT NULL,
    response_id INTEGER NOT NULL,
    response_size INTEGER NOT NULL
);
CREATE TABLE FallbackNameSpaces (
    cache_id INTEGER NOT NULL,
    origin TEXT NOT NULL,
    namespace_url TEXT NOT NULL,
    fallback_entry_url TEXT NOT NULL
);
CREATE TABLE OnlineWhiteLists (
    cache_id INTEGER NOT NULL,
    namespace_url TEXT NOT NULL
);
CREATE TABLE DeletableResponseIds (
    response_id INTEGER NOT NULL
);
CREATE TABLE Meta (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
INSERT INTO Meta (key, value) VALUES ('version', '3'), ('last_compatible_version', '3');
"#;

const UPGRADE_3_TO_4_SQL: &str = r#"
CREATE TABLE Namespaces (
    cache_id INTEGER NOT NULL,
    origin TEXT NOT NULL,
    type INTEGER NOT NULL,
    namespace_url TEXT NOT NULL,
    target_url TEXT NOT NULL
);
CREATE UNIQUE INDEX NamespacesCacheAndUrlIndex ON Namespaces(cache_id, namespace_url);
CREATE INDEX NamespacesOriginIndex ON Namespaces(origin);
INSERT INTO Namespaces (cache_id, origin, type, namespace_url, target_url)
    SELECT cache_id, origin, 1, namespace_url, fallback_entry_url FROM FallbackNameSpaces;
DROP TABLE FallbackNameSpaces;
"#;

/// Create the current schema in an empty database.
pub(crate) async fn create_schema(pool: &Pool<Sqlite>, experiment_flags: &str) -> MetadataResult<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(SCHEMA_SQL).execute(&mut *tx).await?;
    for (key, value) in [
        ("version", CURRENT_VERSION.to_string()),
        ("last_compatible_version", COMPATIBLE_VERSION.to_string()),
        ("experiment_flags", experiment_flags.to_string()),
    ] {
        sqlx::query("INSERT OR REPLACE INTO Meta (key, value) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
    }
    tx.commit().await?;
    Ok(())
}

pub(crate) async fn meta_value(pool: &Pool<Sqlite>, key: &str) -> MetadataResult<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM Meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value)
}

pub(crate) async fn meta_version(pool: &Pool<Sqlite>, key: &str) -> MetadataResult<i64> {
    meta_value(pool, key)
        .await?
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| MetadataError::Schema(format!("missing or invalid meta key '{key}'")))
}

async fn column_names(pool: &Pool<Sqlite>, table: &str) -> MetadataResult<Vec<String>> {
    let columns: Vec<(i32, String, String, i32, Option<String>, i32)> =
        sqlx::query_as(&format!("PRAGMA table_info({table})"))
            .fetch_all(pool)
            .await?;
    Ok(columns.into_iter().map(|(_, name, ..)| name).collect())
}

/// Run the upgrade chain from `version` up to the current version, one
/// transaction per step.
pub(crate) async fn upgrade(pool: &Pool<Sqlite>, mut version: i64) -> MetadataResult<()> {
    while version < CURRENT_VERSION {
        let next = version + 1;
        tracing::info!(from = version, to = next, "Upgrading metadata schema");

        // Column checks happen outside the transaction; the single pool
        // connection serializes them with the step itself.
        let mut statements: Vec<String> = Vec::new();
        match version {
            3 => statements.push(UPGRADE_3_TO_4_SQL.to_string()),
            4 => {
                for table in ["Namespaces", "OnlineWhiteLists"] {
                    if !column_names(pool, table)
                        .await?
                        .iter()
                        .any(|c| c == "is_pattern")
                    {
                        statements.push(format!(
                            "ALTER TABLE {table} ADD COLUMN is_pattern INTEGER NOT NULL DEFAULT 0"
                        ));
                    }
                }
            }
            5 => {
                let columns = column_names(pool, "Groups").await?;
                for column in ["last_full_update_check_time", "first_evictable_error_time"] {
                    if !columns.iter().any(|c| c == column) {
                        statements.push(format!("ALTER TABLE Groups ADD COLUMN {column} TEXT"));
                    }
                }
            }
            other => {
                return Err(MetadataError::Schema(format!(
                    "no upgrade path from schema version {other}"
                )));
            }
        }

        let mut tx = pool.begin().await?;
        for statement in &statements {
            sqlx::query(statement).execute(&mut *tx).await?;
        }
        for key in ["version", "last_compatible_version"] {
            sqlx::query("UPDATE Meta SET value = ? WHERE key = ?")
                .bind(next.to_string())
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        version = next;
    }
    Ok(())
}
