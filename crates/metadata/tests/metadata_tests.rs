//! Integration tests for the SQLite metadata store.

use stowage_core::{Entry, EntryFlags, Namespace, NamespaceType};
use stowage_metadata::models::*;
use stowage_metadata::repos::*;
use stowage_metadata::{MetadataError, MetadataStore, SqliteStore};
use time::{Duration, OffsetDateTime};

const ORIGIN: &str = "http://example.com";

fn t0() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
}

fn group(group_id: i64, manifest_url: &str) -> GroupRecord {
    GroupRecord {
        group_id,
        origin: ORIGIN.to_string(),
        manifest_url: manifest_url.to_string(),
        creation_time: t0(),
        last_access_time: t0(),
        last_full_update_check_time: None,
        first_evictable_error_time: None,
    }
}

fn cache(cache_id: i64, group_id: i64, size: i64) -> CacheRecord {
    CacheRecord {
        cache_id,
        group_id,
        online_wildcard: false,
        update_time: t0(),
        cache_size: size,
    }
}

fn entry(cache_id: i64, url: &str, flags: EntryFlags, response_id: i64, size: i64) -> EntryRecord {
    EntryRecord::new(cache_id, url, &Entry::new(flags, response_id, size))
}

fn batch(group: GroupRecord, cache: CacheRecord, entries: Vec<EntryRecord>) -> CommitBatch {
    let cache_id = cache.cache_id;
    CommitBatch {
        group,
        cache,
        entries,
        intercept_namespaces: Vec::new(),
        fallback_namespaces: vec![NamespaceRecord {
            cache_id,
            origin: ORIGIN.to_string(),
            namespace: Namespace::new(
                NamespaceType::Fallback,
                "http://example.com/x/",
                "http://example.com/offline.html",
                false,
            ),
        }],
        online_whitelists: vec![OnlineWhiteListRecord {
            cache_id,
            namespace_url: "http://example.com/api/".to_string(),
            is_pattern: false,
        }],
        quota: None,
    }
}

#[tokio::test]
async fn test_records_round_trip() {
    let store = SqliteStore::in_memory();

    let mut g = group(1, "http://example.com/manifest");
    g.first_evictable_error_time = Some(t0() - Duration::days(3));
    store.insert_group(&g).await.unwrap();
    assert_eq!(store.find_group(1).await.unwrap(), Some(g.clone()));
    assert_eq!(
        store
            .find_group_for_manifest_url("http://example.com/manifest")
            .await
            .unwrap(),
        Some(g.clone())
    );

    let c = cache(10, 1, 300);
    store.insert_cache(&c).await.unwrap();
    assert_eq!(store.find_cache(10).await.unwrap(), Some(c.clone()));
    assert_eq!(store.find_cache_for_group(1).await.unwrap(), Some(c));
    assert_eq!(store.find_group_for_cache(10).await.unwrap(), Some(g));

    let e = entry(10, "http://example.com/a.html", EntryFlags::EXPLICIT, 100, 300);
    store.insert_entry(&e).await.unwrap();
    assert_eq!(
        store.find_entry(10, "http://example.com/a.html").await.unwrap(),
        Some(e.clone())
    );
    assert_eq!(
        store.find_entries_for_url("http://example.com/a.html").await.unwrap(),
        vec![e]
    );

    let ns = NamespaceRecord {
        cache_id: 10,
        origin: ORIGIN.to_string(),
        namespace: Namespace::new(
            NamespaceType::Intercept,
            "http://example.com/*.php",
            "http://example.com/t.html",
            true,
        ),
    };
    store.insert_namespace(&ns).await.unwrap();
    let set = store.find_namespaces_for_cache(10).await.unwrap();
    assert_eq!(set.intercepts, vec![ns.clone()]);
    assert!(set.fallbacks.is_empty());
    assert_eq!(store.find_namespaces_for_origin(ORIGIN).await.unwrap().intercepts, vec![ns]);

    let wl = OnlineWhiteListRecord {
        cache_id: 10,
        namespace_url: "http://example.com/api/".to_string(),
        is_pattern: false,
    };
    store.insert_online_whitelist(&wl).await.unwrap();
    assert_eq!(store.find_online_whitelist_for_cache(10).await.unwrap(), vec![wl]);
}

#[tokio::test]
async fn test_duplicate_manifest_url_is_rejected() {
    let store = SqliteStore::in_memory();
    store.insert_group(&group(1, "http://example.com/m")).await.unwrap();
    let err = store
        .insert_group(&group(2, "http://example.com/m"))
        .await
        .unwrap_err();
    assert!(matches!(err, MetadataError::AlreadyExists(_)));
    assert_eq!(store.find_groups_for_origin(ORIGIN).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_add_entry_flags_merges_roles() {
    let store = SqliteStore::in_memory();
    let url = "http://example.com/page.html";
    store
        .insert_entry(&entry(10, url, EntryFlags::EXPLICIT, 1, 10))
        .await
        .unwrap();
    store
        .add_entry_flags(10, url, EntryFlags::FOREIGN)
        .await
        .unwrap();

    let found = store.find_entry(10, url).await.unwrap().unwrap();
    assert_eq!(
        found.entry_flags(),
        EntryFlags::EXPLICIT | EntryFlags::FOREIGN
    );

    let missing = store
        .add_entry_flags(10, "http://example.com/none", EntryFlags::FOREIGN)
        .await;
    assert!(matches!(missing, Err(MetadataError::NotFound(_))));
}

#[tokio::test]
async fn test_store_group_and_cache_replaces_previous_cache() {
    let store = SqliteStore::in_memory();
    let manifest = "http://example.com/manifest";

    let first = batch(
        group(1, manifest),
        cache(10, 1, 300),
        vec![
            entry(10, "http://example.com/a", EntryFlags::EXPLICIT, 100, 100),
            entry(10, "http://example.com/b", EntryFlags::EXPLICIT, 101, 200),
        ],
    );
    let outcome = store.store_group_and_cache(&first).await.unwrap();
    assert!(outcome.deletable_response_ids.is_empty());
    assert_eq!(outcome.usage_delta, 300);

    // The second generation keeps response 100 and replaces 101.
    let second = batch(
        group(1, manifest),
        cache(11, 1, 150),
        vec![
            entry(11, "http://example.com/a", EntryFlags::EXPLICIT, 100, 100),
            entry(11, "http://example.com/b", EntryFlags::EXPLICIT, 102, 50),
        ],
    );
    let outcome = store.store_group_and_cache(&second).await.unwrap();
    assert_eq!(outcome.deletable_response_ids, vec![101]);
    assert_eq!(outcome.usage_delta, -150);

    assert!(store.find_cache(10).await.unwrap().is_none());
    assert!(store.find_entries_for_cache(10).await.unwrap().is_empty());
    assert_eq!(store.find_cache_for_group(1).await.unwrap().unwrap().cache_id, 11);
    assert_eq!(store.find_namespaces_for_cache(11).await.unwrap().fallbacks.len(), 1);
    assert!(store.find_namespaces_for_cache(10).await.unwrap().fallbacks.is_empty());
    assert_eq!(store.get_deletable_response_ids(i64::MAX, 10).await.unwrap(), vec![101]);
    assert_eq!(store.get_origin_usage(ORIGIN).await.unwrap(), 150);
}

#[tokio::test]
async fn test_quota_exceeded_leaves_database_untouched() {
    let store = SqliteStore::in_memory();
    let mut too_big = batch(
        group(1, "http://example.com/m"),
        cache(10, 1, 5000),
        vec![entry(10, "http://example.com/a", EntryFlags::EXPLICIT, 100, 5000)],
    );
    too_big.quota = Some(1000);

    let err = store.store_group_and_cache(&too_big).await.unwrap_err();
    assert!(matches!(err, MetadataError::QuotaExceeded { quota: 1000, .. }));
    assert!(store.find_group(1).await.unwrap().is_none());
    assert!(store.find_cache(10).await.unwrap().is_none());
    assert!(store.find_entries_for_cache(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_group_and_caches_queues_responses() {
    let store = SqliteStore::in_memory();
    store
        .store_group_and_cache(&batch(
            group(1, "http://example.com/m"),
            cache(10, 1, 30),
            vec![
                entry(10, "http://example.com/a", EntryFlags::EXPLICIT, 100, 10),
                entry(10, "http://example.com/m", EntryFlags::MANIFEST, 101, 20),
            ],
        ))
        .await
        .unwrap();

    let deletion = store.delete_group_and_caches(1).await.unwrap();
    assert_eq!(deletion.origin, ORIGIN);
    assert_eq!(deletion.freed_bytes, 30);
    let mut ids = deletion.response_ids.clone();
    ids.sort();
    assert_eq!(ids, vec![100, 101]);

    assert!(store.find_group(1).await.unwrap().is_none());
    assert!(store.find_cache(10).await.unwrap().is_none());
    assert!(store.find_entries_for_cache(10).await.unwrap().is_empty());
    assert!(store.find_namespaces_for_cache(10).await.unwrap().fallbacks.is_empty());
    assert!(store.find_online_whitelist_for_cache(10).await.unwrap().is_empty());
    assert!(store.find_origins_with_groups().await.unwrap().is_empty());

    let mut queued = store.get_deletable_response_ids(i64::MAX, 10).await.unwrap();
    queued.sort();
    assert_eq!(queued, vec![100, 101]);

    assert!(matches!(
        store.delete_group_and_caches(1).await,
        Err(MetadataError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_lazy_last_access_times_overlay_reads() {
    let store = SqliteStore::in_memory();
    store.insert_group(&group(1, "http://example.com/m")).await.unwrap();

    let later = t0() + Duration::hours(5);
    store.lazy_update_last_access_time(1, later);
    assert_eq!(store.find_group(1).await.unwrap().unwrap().last_access_time, later);
    assert_eq!(
        store.find_groups_for_origin(ORIGIN).await.unwrap()[0].last_access_time,
        later
    );

    assert_eq!(store.commit_lazy_last_access_times().await.unwrap(), 1);
    assert_eq!(store.commit_lazy_last_access_times().await.unwrap(), 0);
    assert_eq!(store.find_group(1).await.unwrap().unwrap().last_access_time, later);
}

#[tokio::test]
async fn test_update_eviction_times() {
    let store = SqliteStore::in_memory();
    store.insert_group(&group(1, "http://example.com/m")).await.unwrap();

    let checked = t0() + Duration::days(1);
    let failed = t0() + Duration::days(2);
    store
        .update_eviction_times(1, Some(checked), Some(failed))
        .await
        .unwrap();
    let found = store.find_group(1).await.unwrap().unwrap();
    assert_eq!(found.last_full_update_check_time, Some(checked));
    assert_eq!(found.first_evictable_error_time, Some(failed));

    store.update_eviction_times(1, Some(checked), None).await.unwrap();
    assert!(store.find_group(1).await.unwrap().unwrap().first_evictable_error_time.is_none());
}

#[tokio::test]
async fn test_last_storage_ids_include_deletable_responses() {
    let store = SqliteStore::in_memory();
    store
        .store_group_and_cache(&batch(
            group(3, "http://example.com/m"),
            cache(7, 3, 10),
            vec![entry(7, "http://example.com/a", EntryFlags::EXPLICIT, 40, 10)],
        ))
        .await
        .unwrap();
    store.insert_deletable_response_ids(&[55, 41]).await.unwrap();

    let ids = store.find_last_storage_ids().await.unwrap();
    assert_eq!(ids.last_group_id, 3);
    assert_eq!(ids.last_cache_id, 7);
    assert_eq!(ids.last_response_id, 55);
    assert_eq!(ids.last_deletable_response_rowid, 2);
}

#[tokio::test]
async fn test_deletable_queue_respects_rowid_bound_and_limit() {
    let store = SqliteStore::in_memory();
    store.insert_deletable_response_ids(&[1, 2, 3]).await.unwrap();
    store.insert_deletable_response_ids(&[4]).await.unwrap();

    assert_eq!(store.get_deletable_response_ids(3, 10).await.unwrap(), vec![1, 2, 3]);
    assert_eq!(store.get_deletable_response_ids(i64::MAX, 2).await.unwrap(), vec![1, 2]);

    store.delete_deletable_response_ids(&[1, 2]).await.unwrap();
    assert_eq!(store.get_deletable_response_ids(i64::MAX, 10).await.unwrap(), vec![3, 4]);
}

#[tokio::test]
async fn test_origin_usage_across_groups() {
    let store = SqliteStore::in_memory();
    store
        .store_group_and_cache(&batch(
            group(1, "http://example.com/one"),
            cache(10, 1, 100),
            vec![entry(10, "http://example.com/a", EntryFlags::EXPLICIT, 1, 100)],
        ))
        .await
        .unwrap();

    let other = batch(
        group(2, "http://example.com/two"),
        cache(20, 2, 50),
        vec![entry(20, "http://example.com/b", EntryFlags::EXPLICIT, 2, 50)],
    );
    store.store_group_and_cache(&other).await.unwrap();

    assert_eq!(store.get_origin_usage(ORIGIN).await.unwrap(), 150);
    assert_eq!(store.get_origin_usage("http://other.com").await.unwrap(), 0);
    let all = store.get_all_origin_usage().await.unwrap();
    assert_eq!(all.get(ORIGIN), Some(&150));
    assert_eq!(store.find_caches_for_origin(ORIGIN).await.unwrap().len(), 2);
    assert_eq!(store.find_origins_with_groups().await.unwrap(), vec![ORIGIN.to_string()]);
}
