//! Shared fixtures: a scripted fetcher and a service wired to in-memory stores.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stowage_core::config::AppConfig;
use stowage_core::{EventId, JsonManifestParser, ResponseInfo, Url};
use stowage_service::{
    AppCacheService, ChannelFrontend, FetchError, FetchRequest, FetchResponse, Fetcher,
    HostEvent, HostHandle, HostId, QuotaManagerProxy, UnlimitedQuota,
};
use tokio::sync::{Notify, mpsc};

pub const MANIFEST_URL: &str = "http://example.com/app/manifest";

pub type Reply = Result<FetchResponse, FetchError>;

pub fn url(value: &str) -> Url {
    Url::parse(value).unwrap()
}

pub fn response(status: u16, headers: &[(&str, &str)], body: &str) -> Reply {
    Ok(FetchResponse {
        info: ResponseInfo::new(
            status,
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        ),
        body: Bytes::from(body.to_string()),
    })
}

pub fn ok(body: &str) -> Reply {
    response(200, &[("content-type", "text/html")], body)
}

pub fn status(code: u16) -> Reply {
    response(code, &[], "")
}

pub fn manifest(json: &str) -> Reply {
    response(200, &[("content-type", "application/json")], json)
}

#[derive(Default)]
struct Route {
    once: VecDeque<Reply>,
    always: Option<Reply>,
    gate: Option<Arc<Notify>>,
}

/// Fetcher answering from a script. Unknown URLs get a 404.
#[derive(Default)]
pub struct FakeFetcher {
    routes: Mutex<HashMap<String, Route>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every request for `url` with `reply`.
    pub fn set(&self, url: &str, reply: Reply) {
        self.routes.lock().unwrap().entry(url.to_string()).or_default().always = Some(reply);
    }

    /// Answer the next request for `url` with `reply`, ahead of `set` replies.
    pub fn push_once(&self, url: &str, reply: Reply) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .once
            .push_back(reply);
    }

    /// Hold requests for `url` until the returned gate is notified.
    pub fn hold(&self, url: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.routes.lock().unwrap().entry(url.to_string()).or_default().gate = Some(gate.clone());
        gate
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request.url.as_str() == url)
            .count()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    async fn fetch(&self, request: FetchRequest) -> Reply {
        self.requests.lock().unwrap().push(request.clone());
        let gate = self
            .routes
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .and_then(|route| route.gate.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(request.url.as_str()) {
            Some(route) => match route.once.pop_front() {
                Some(reply) => reply,
                None => route.always.clone().unwrap_or_else(|| status(404)),
            },
            None => status(404),
        }
    }
}

/// A service over in-memory stores with a scripted fetcher and one frontend.
pub struct TestService {
    pub service: Arc<AppCacheService>,
    pub fetcher: Arc<FakeFetcher>,
    frontend: Arc<ChannelFrontend>,
    events: mpsc::UnboundedReceiver<(Vec<HostId>, HostEvent)>,
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::for_testing();
    config.update.manifest_changed_retry_delay_ms = 20;
    config.service.deletion_delay_ms = 1;
    config
}

impl TestService {
    pub async fn new() -> Self {
        Self::with(test_config(), Arc::new(UnlimitedQuota)).await
    }

    pub async fn with(config: AppConfig, quota: Arc<dyn QuotaManagerProxy>) -> Self {
        let fetcher = FakeFetcher::new();
        let service = AppCacheService::new(
            config,
            fetcher.clone(),
            Arc::new(JsonManifestParser),
            quota,
        )
        .await
        .unwrap();
        let (frontend, events) = ChannelFrontend::new();
        Self {
            service,
            fetcher,
            frontend: Arc::new(frontend),
            events,
        }
    }

    pub fn host(&self, id: u64) -> HostHandle {
        HostHandle::new(HostId(id), self.frontend.clone())
    }

    /// Run an update to completion.
    pub async fn update(&self, host: Option<HostHandle>, master_url: Option<&str>) {
        let manifest_url = url(MANIFEST_URL);
        self.service
            .start_update(&manifest_url, host, master_url.map(url))
            .await
            .unwrap();
        self.service.wait_for_update(&manifest_url).await;
    }

    /// Everything delivered so far.
    pub fn drain_events(&mut self) -> Vec<(Vec<HostId>, HostEvent)> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Event ids delivered to `host`, in order.
    pub fn event_ids_for(&mut self, host: u64) -> Vec<EventId> {
        self.drain_events()
            .into_iter()
            .filter(|(hosts, _)| hosts.contains(&HostId(host)))
            .map(|(_, event)| event.event_id())
            .collect()
    }

    /// Wait for the next event matching `id`, skipping others.
    pub async fn wait_for_event(&mut self, id: EventId) -> (Vec<HostId>, HostEvent) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = self.events.recv().await.expect("frontend closed");
                if event.1.event_id() == id {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    /// Wait until the response store holds `count` entries.
    pub async fn wait_for_response_count(&self, count: u64) {
        let responses = self.service.storage().responses().clone();
        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if responses.entry_count().await.unwrap() == count {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(
            result.is_ok(),
            "expected {count} responses, found {}",
            responses.entry_count().await.unwrap()
        );
    }
}

/// A small application: two explicit resources and one fallback namespace.
pub fn serve_app(fetcher: &FakeFetcher) {
    fetcher.set(
        MANIFEST_URL,
        manifest(
            r#"{
                "explicit": ["page.html", "script.js"],
                "fallback": [{"namespace": "/app/offline/", "target": "/app/fallback.html"}],
                "network": ["/app/api/"]
            }"#,
        ),
    );
    fetcher.set("http://example.com/app/page.html", ok("<p>page</p>"));
    fetcher.set("http://example.com/app/script.js", ok("run();"));
    fetcher.set("http://example.com/app/fallback.html", ok("<p>offline</p>"));
    fetcher.set("http://example.com/app/index.html", ok("<p>index</p>"));
}
