//! Update job scenarios driven through the service.

mod common;

use common::*;
use std::sync::Arc;
use stowage_core::{ErrorDetails, ErrorReason, EventId};
use stowage_service::{
    CacheLookup, FetchError, FixedQuota, HostEvent, MainResponse, UpdateStart,
};

const INDEX_URL: &str = "http://example.com/app/index.html";
const PAGE_URL: &str = "http://example.com/app/page.html";
const SCRIPT_URL: &str = "http://example.com/app/script.js";

fn error_details(events: &[(Vec<stowage_service::HostId>, HostEvent)]) -> ErrorDetails {
    events
        .iter()
        .find_map(|(_, event)| match event {
            HostEvent::Error(details) => Some(details.clone()),
            _ => None,
        })
        .expect("no error event")
}

async fn newest_cache_id(t: &TestService) -> i64 {
    let found = t
        .service
        .find_response_for_main_request(&url(INDEX_URL), None)
        .await
        .unwrap();
    found.found().expect("index not cached").cache_id
}

#[tokio::test]
async fn first_update_caches_manifest_resources_and_master() {
    let mut t = TestService::new().await;
    serve_app(&t.fetcher);

    t.update(Some(t.host(1)), Some(INDEX_URL)).await;

    let ids = t.event_ids_for(1);
    assert_eq!(&ids[..2], &[EventId::Checking, EventId::Downloading]);
    assert_eq!(ids.last(), Some(&EventId::Cached));
    assert_eq!(ids.iter().filter(|id| **id == EventId::Progress).count(), 4);
    assert_eq!(ids.iter().filter(|id| id.is_terminal()).count(), 1);

    let info = t.service.get_all_info().await.unwrap();
    assert_eq!(info.len(), 1);
    assert!(info.total_size() > 0);

    let main = t
        .service
        .find_response_for_main_request(&url(INDEX_URL), None)
        .await
        .unwrap();
    let MainResponse::Entry(found) = main else {
        panic!("expected the master entry, got {main:?}");
    };
    assert!(found.entry.is_master());
    assert_eq!(found.manifest_url, MANIFEST_URL);

    let cache = t
        .service
        .storage()
        .load_cache(found.cache_id)
        .await
        .unwrap()
        .unwrap();
    assert!(cache.get_entry(MANIFEST_URL).unwrap().is_manifest());
    assert!(cache.get_entry(PAGE_URL).unwrap().is_explicit());
    assert!(
        cache
            .get_entry("http://example.com/app/fallback.html")
            .unwrap()
            .is_fallback()
    );

    let script = t
        .service
        .find_response_for_sub_request(found.cache_id, &url(SCRIPT_URL))
        .await
        .unwrap();
    let entry = *script.entry().unwrap();
    let body = t
        .service
        .storage()
        .create_response_reader(entry.response_id)
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(&body[..], b"run();");

    let api = t
        .service
        .find_response_for_sub_request(found.cache_id, &url("http://example.com/app/api/data"))
        .await
        .unwrap();
    assert_eq!(api, CacheLookup::Network);

    let offline = t
        .service
        .find_response_for_main_request(&url("http://example.com/app/offline/list.html"), None)
        .await
        .unwrap();
    let MainResponse::Fallback(fallback) = offline else {
        panic!("expected a fallback, got {offline:?}");
    };
    assert_eq!(fallback.url, "http://example.com/app/fallback.html");
    assert_eq!(
        fallback.namespace_url.as_deref(),
        Some("http://example.com/app/offline/")
    );
}

#[tokio::test]
async fn identical_manifest_is_no_update() {
    let mut t = TestService::new().await;
    serve_app(&t.fetcher);
    t.update(Some(t.host(1)), Some(INDEX_URL)).await;
    let cache_id = newest_cache_id(&t).await;
    t.drain_events();

    t.update(None, None).await;

    assert_eq!(t.event_ids_for(1), vec![EventId::Checking, EventId::NoUpdate]);
    assert_eq!(newest_cache_id(&t).await, cache_id);
    assert_eq!(t.fetcher.request_count(PAGE_URL), 1);

    let group = t
        .service
        .storage()
        .load_or_create_group(&url(MANIFEST_URL))
        .await
        .unwrap();
    assert!(group.last_full_update_check_time().is_some());
    assert!(group.first_evictable_error_time().is_none());
}

#[tokio::test]
async fn missing_manifest_makes_group_obsolete() {
    let mut t = TestService::new().await;
    serve_app(&t.fetcher);
    t.update(Some(t.host(1)), Some(INDEX_URL)).await;
    t.drain_events();

    t.fetcher.set(MANIFEST_URL, status(404));
    t.update(None, None).await;

    assert_eq!(t.event_ids_for(1), vec![EventId::Checking, EventId::Obsolete]);
    assert!(t.service.get_all_info().await.unwrap().is_empty());
    let main = t
        .service
        .find_response_for_main_request(&url(INDEX_URL), None)
        .await
        .unwrap();
    assert_eq!(main, MainResponse::NotFound);
    t.wait_for_response_count(0).await;
}

#[tokio::test]
async fn failed_explicit_resource_fails_first_update() {
    let mut t = TestService::new().await;
    serve_app(&t.fetcher);
    t.fetcher.set(SCRIPT_URL, status(500));

    t.update(Some(t.host(1)), None).await;

    let events = t.drain_events();
    let last = events.last().unwrap();
    assert_eq!(last.1.event_id(), EventId::Error);
    let details = error_details(&events);
    assert_eq!(details.reason, ErrorReason::Resource);
    assert_eq!(details.url.as_deref(), Some(SCRIPT_URL));
    assert_eq!(details.status, Some(500));
    assert!(!details.is_cross_origin);

    assert!(t.service.get_all_info().await.unwrap().is_empty());
    t.wait_for_response_count(0).await;
}

#[tokio::test]
async fn failed_upgrade_keeps_previous_cache_and_records_error_time() {
    let mut t = TestService::new().await;
    serve_app(&t.fetcher);
    t.update(Some(t.host(1)), Some(INDEX_URL)).await;
    let cache_id = newest_cache_id(&t).await;
    t.drain_events();

    t.fetcher.set(
        MANIFEST_URL,
        manifest(r#"{"explicit": ["page.html", "script.js", "missing.js"]}"#),
    );
    t.update(None, None).await;

    let ids = t.event_ids_for(1);
    assert_eq!(ids.last(), Some(&EventId::Error));
    assert_eq!(newest_cache_id(&t).await, cache_id);

    let group = t
        .service
        .storage()
        .load_or_create_group(&url(MANIFEST_URL))
        .await
        .unwrap();
    assert!(group.first_evictable_error_time().is_some());
}

#[tokio::test]
async fn repeated_failures_past_threshold_evict_the_group() {
    let t = TestService::new().await;
    serve_app(&t.fetcher);
    t.update(None, None).await;
    assert_eq!(t.service.get_all_info().await.unwrap().len(), 1);

    t.fetcher.set(MANIFEST_URL, status(500));
    let storage = t.service.storage();
    let group = storage
        .load_or_create_group(&url(MANIFEST_URL))
        .await
        .unwrap();
    let long_ago = time::OffsetDateTime::now_utc() - time::Duration::days(15);
    group.set_eviction_times(group.last_full_update_check_time(), Some(long_ago));
    storage.store_eviction_times(&group).await.unwrap();

    t.update(None, None).await;

    assert!(group.is_obsolete());
    assert!(t.service.get_all_info().await.unwrap().is_empty());
}

#[tokio::test]
async fn network_failures_do_not_count_towards_eviction() {
    let t = TestService::new().await;
    serve_app(&t.fetcher);
    t.update(None, None).await;

    t.fetcher
        .set(MANIFEST_URL, Err(FetchError::Network("connection refused".into())));
    t.update(None, None).await;

    let group = t
        .service
        .storage()
        .load_or_create_group(&url(MANIFEST_URL))
        .await
        .unwrap();
    assert!(group.first_evictable_error_time().is_none());
    assert_eq!(t.service.get_all_info().await.unwrap().len(), 1);
}

#[tokio::test]
async fn manifest_change_during_update_restarts() {
    let mut t = TestService::new().await;
    serve_app(&t.fetcher);
    t.fetcher
        .push_once(MANIFEST_URL, manifest(r#"{"explicit": ["page.html"]}"#));
    t.fetcher.set(
        MANIFEST_URL,
        manifest(r#"{"explicit": ["page.html", "script.js"]}"#),
    );

    let started = t
        .service
        .start_update(&url(MANIFEST_URL), Some(t.host(1)), None)
        .await
        .unwrap();
    assert_eq!(started, UpdateStart::Started);

    let (_, error) = t.wait_for_event(EventId::Error).await;
    let HostEvent::Error(details) = error else {
        unreachable!()
    };
    assert_eq!(details.reason, ErrorReason::Changed);

    let (hosts, _) = t.wait_for_event(EventId::Cached).await;
    assert_eq!(hosts, vec![t.host(1).id]);
    t.service.wait_for_update(&url(MANIFEST_URL)).await;

    let info = t.service.get_all_info().await.unwrap();
    let cache_id = info.infos_by_origin["http://example.com"][0].cache_id;
    let lookup = t
        .service
        .find_response_for_sub_request(cache_id, &url(SCRIPT_URL))
        .await
        .unwrap();
    assert!(lookup.entry().is_some());
}

#[tokio::test]
async fn unavailable_with_retry_after_zero_is_retried() {
    let t = TestService::new().await;
    serve_app(&t.fetcher);
    for _ in 0..2 {
        t.fetcher
            .push_once(SCRIPT_URL, response(503, &[("Retry-After", "0")], ""));
    }

    t.update(None, None).await;

    assert_eq!(t.fetcher.request_count(SCRIPT_URL), 3);
    assert_eq!(t.service.get_all_info().await.unwrap().len(), 1);
}

#[tokio::test]
async fn retries_stop_after_the_limit() {
    let mut t = TestService::new().await;
    serve_app(&t.fetcher);
    t.fetcher
        .set(SCRIPT_URL, response(503, &[("Retry-After", "0")], ""));

    t.update(Some(t.host(1)), None).await;

    assert_eq!(t.fetcher.request_count(SCRIPT_URL), 4);
    let details = error_details(&t.drain_events());
    assert_eq!(details.status, Some(503));
}

#[tokio::test]
async fn master_joins_a_running_update() {
    let mut t = TestService::new().await;
    serve_app(&t.fetcher);
    t.fetcher
        .set("http://example.com/app/other.html", ok("<p>other</p>"));
    let gate = t.fetcher.hold(PAGE_URL);

    let manifest_url = url(MANIFEST_URL);
    let started = t
        .service
        .start_update(&manifest_url, Some(t.host(1)), Some(url(INDEX_URL)))
        .await
        .unwrap();
    assert_eq!(started, UpdateStart::Started);
    t.wait_for_event(EventId::Downloading).await;

    let joined = t
        .service
        .start_update(
            &manifest_url,
            Some(t.host(2)),
            Some(url("http://example.com/app/other.html")),
        )
        .await
        .unwrap();
    assert_eq!(joined, UpdateStart::Joined);

    gate.notify_one();
    t.service.wait_for_update(&manifest_url).await;

    let ids = t.event_ids_for(2);
    assert_eq!(ids.first(), Some(&EventId::Checking));
    assert_eq!(ids.last(), Some(&EventId::Cached));

    let other = t
        .service
        .find_response_for_main_request(&url("http://example.com/app/other.html"), None)
        .await
        .unwrap();
    assert!(other.found().unwrap().entry.is_master());
}

#[tokio::test]
async fn failed_master_only_errors_its_host() {
    let mut t = TestService::new().await;
    serve_app(&t.fetcher);
    t.update(Some(t.host(1)), Some(INDEX_URL)).await;
    t.drain_events();

    // A new manifest version; the second document no longer exists.
    t.fetcher.set(
        MANIFEST_URL,
        manifest(r#"{"explicit": ["page.html", "script.js"]}"#),
    );
    t.update(Some(t.host(2)), Some("http://example.com/app/gone.html"))
        .await;

    let events = t.drain_events();
    let for_host = |id: u64| -> Vec<EventId> {
        events
            .iter()
            .filter(|(hosts, _)| hosts.contains(&t.host(id).id))
            .map(|(_, event)| event.event_id())
            .collect()
    };
    assert_eq!(for_host(2).last(), Some(&EventId::Error));
    assert_eq!(for_host(1).last(), Some(&EventId::UpdateReady));
}

#[tokio::test]
async fn cancelled_update_is_silent_and_stores_nothing() {
    let mut t = TestService::new().await;
    serve_app(&t.fetcher);
    let _gate = t.fetcher.hold(PAGE_URL);

    let manifest_url = url(MANIFEST_URL);
    t.service
        .start_update(&manifest_url, Some(t.host(1)), None)
        .await
        .unwrap();
    t.wait_for_event(EventId::Downloading).await;

    assert!(t.service.cancel_update(&manifest_url));
    t.service.wait_for_update(&manifest_url).await;

    assert!(
        t.event_ids_for(1)
            .iter()
            .all(|id| !id.is_terminal())
    );
    assert!(t.service.get_all_info().await.unwrap().is_empty());
    t.wait_for_response_count(0).await;
}

#[tokio::test]
async fn unchanged_resources_are_revalidated_and_reused() {
    let t = TestService::new().await;
    serve_app(&t.fetcher);
    t.fetcher.set(
        PAGE_URL,
        response(200, &[("ETag", "\"v1\"")], "<p>page</p>"),
    );
    t.update(None, Some(INDEX_URL)).await;
    let old_cache_id = newest_cache_id(&t).await;
    let old_cache = t
        .service
        .storage()
        .load_cache(old_cache_id)
        .await
        .unwrap()
        .unwrap();
    let old_page = old_cache.get_entry(PAGE_URL).unwrap();

    t.fetcher.set(
        MANIFEST_URL,
        manifest(r#"{"explicit": ["page.html", "script.js", "extra.css"]}"#),
    );
    t.fetcher.set("http://example.com/app/extra.css", ok("p {}"));
    t.fetcher.set(PAGE_URL, status(304));
    t.update(None, None).await;

    let new_cache_id = newest_cache_id(&t).await;
    assert_ne!(new_cache_id, old_cache_id);
    let lookup = t
        .service
        .find_response_for_sub_request(new_cache_id, &url(PAGE_URL))
        .await
        .unwrap();
    assert_eq!(lookup.entry().unwrap().response_id, old_page.response_id);

    let last_page_request = t
        .fetcher
        .requests()
        .into_iter()
        .filter(|request| request.url.as_str() == PAGE_URL)
        .last()
        .unwrap();
    assert_eq!(last_page_request.if_none_match.as_deref(), Some("\"v1\""));

    let body = t
        .service
        .storage()
        .create_response_reader(old_page.response_id)
        .read_to_end()
        .await
        .unwrap();
    assert_eq!(&body[..], b"<p>page</p>");
}

#[tokio::test]
async fn upgrade_deletes_responses_of_the_replaced_cache() {
    let t = TestService::new().await;
    serve_app(&t.fetcher);
    t.update(None, Some(INDEX_URL)).await;
    let old_cache_id = newest_cache_id(&t).await;
    let old_ids = t
        .service
        .storage()
        .load_cache(old_cache_id)
        .await
        .unwrap()
        .unwrap()
        .response_ids();
    assert!(!old_ids.is_empty());

    t.fetcher.set(
        MANIFEST_URL,
        manifest(r#"{"explicit": ["page.html", "script.js"], "network": ["/app/api/v2/"]}"#),
    );
    t.fetcher.set(PAGE_URL, ok("<p>page v2</p>"));
    t.update(None, None).await;

    let new_cache_id = newest_cache_id(&t).await;
    assert_ne!(new_cache_id, old_cache_id);
    let new_ids = t
        .service
        .storage()
        .load_cache(new_cache_id)
        .await
        .unwrap()
        .unwrap()
        .response_ids();
    t.wait_for_response_count(new_ids.len() as u64).await;

    let responses = t.service.storage().responses().clone();
    for id in old_ids {
        assert!(!new_ids.contains(&id));
        assert!(!responses.exists(id).await.unwrap(), "response {id} survived");
    }
}

#[tokio::test]
async fn quota_exceeded_fails_the_commit() {
    let mut t = TestService::with(test_config(), Arc::new(FixedQuota::new(10))).await;
    serve_app(&t.fetcher);

    t.update(Some(t.host(1)), None).await;

    let details = error_details(&t.drain_events());
    assert_eq!(details.reason, ErrorReason::Quota);
    assert!(t.service.get_all_info().await.unwrap().is_empty());
    assert_eq!(t.service.origin_usage("http://example.com"), 0);
}

#[tokio::test]
async fn cross_origin_https_no_store_is_a_security_failure() {
    let mut t = TestService::new().await;
    let manifest_url = "https://example.com/app/manifest";
    t.fetcher.set(
        manifest_url,
        manifest(r#"{"explicit": ["https://cdn.example.net/lib.js"]}"#),
    );
    t.fetcher.set(
        "https://cdn.example.net/lib.js",
        response(200, &[("Cache-Control", "no-store")], "lib();"),
    );

    t.service
        .start_update(&url(manifest_url), Some(t.host(1)), None)
        .await
        .unwrap();
    t.service.wait_for_update(&url(manifest_url)).await;

    let details = error_details(&t.drain_events());
    assert!(details.is_cross_origin);
    assert_eq!(details.url.as_deref(), Some("https://cdn.example.net/lib.js"));
    assert!(t.service.get_all_info().await.unwrap().is_empty());
}
