//! Operator CLI for stowage application caches.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;
use std::sync::Arc;
use stowage_core::config::AppConfig;
use stowage_core::{AppCacheInfoCollection, EventId, JsonManifestParser};
use stowage_service::{
    AppCacheService, ChannelFrontend, CheckResult, FoundResponse, HostEvent, HostHandle, HostId,
    HttpFetcher, MainResponse, UnlimitedQuota, UpdateStart,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use url::Url;

/// Host id used for the CLI's own update listener.
const CLI_HOST: HostId = HostId(1);

#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Inspect and maintain offline application caches")]
#[command(version)]
struct Cli {
    /// Configuration file path (optional; STOWAGE_ env vars override it)
    #[arg(long, short, env = "STOWAGE_CONFIG", default_value = "stowage.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List stored caches by origin
    List {
        /// Print JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Check a manifest for changes and download a new cache if needed
    Update {
        /// Manifest URL of the group
        manifest_url: Url,
        /// Document to store alongside the cache as a master entry
        #[arg(long)]
        master: Option<Url>,
    },
    /// Find the cached response for a navigation
    Lookup {
        /// Requested URL
        url: Url,
        /// Manifest to prefer when several groups could answer
        #[arg(long)]
        manifest: Option<Url>,
    },
    /// Delete the group for a manifest
    DeleteGroup {
        /// Manifest URL of the group
        manifest_url: Url,
    },
    /// Delete every group of an origin
    DeleteOrigin {
        /// Origin, e.g. https://example.com
        origin: String,
    },
    /// Verify a stored response; damaged groups are deleted
    Check {
        /// Manifest URL of the group
        manifest_url: Url,
        cache_id: i64,
        response_id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { config, command } = Cli::parse();

    // Logs go to stderr; stdout carries command output.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(Path::new(&config))?;
    let service = open_service(config).await?;

    let result = run_command(&service, command).await;
    service.shutdown().await;
    result
}

/// Merge the optional TOML file with `STOWAGE_` environment variables.
fn load_config(path: &Path) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if path.exists() {
        tracing::debug!(config_path = %path.display(), "Loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!("No config file found at {}", path.display());
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("STOWAGE_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

async fn open_service(config: AppConfig) -> Result<Arc<AppCacheService>> {
    let fetcher = HttpFetcher::new(&config.fetch).context("failed to build HTTP client")?;
    AppCacheService::new(
        config,
        Arc::new(fetcher),
        Arc::new(JsonManifestParser),
        Arc::new(UnlimitedQuota),
    )
    .await
    .context("failed to open cache storage")
}

async fn run_command(service: &Arc<AppCacheService>, command: Commands) -> Result<()> {
    match command {
        Commands::List { json } => handle_list(service, json).await,
        Commands::Update {
            manifest_url,
            master,
        } => handle_update(service, &manifest_url, master).await,
        Commands::Lookup { url, manifest } => handle_lookup(service, &url, manifest.as_ref()).await,
        Commands::DeleteGroup { manifest_url } => {
            service
                .delete_group(&manifest_url)
                .await
                .with_context(|| format!("failed to delete group for {manifest_url}"))?;
            println!("Deleted group for {manifest_url}");
            Ok(())
        }
        Commands::DeleteOrigin { origin } => {
            let deleted = service
                .delete_origin_data(&origin)
                .await
                .with_context(|| format!("failed to delete data for {origin}"))?;
            println!("Deleted {deleted} group(s) for {origin}");
            Ok(())
        }
        Commands::Check {
            manifest_url,
            cache_id,
            response_id,
        } => handle_check(service, &manifest_url, cache_id, response_id).await,
    }
}

async fn handle_list(service: &AppCacheService, json: bool) -> Result<()> {
    let info = service
        .get_all_info()
        .await
        .context("failed to enumerate caches")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
    } else {
        print!("{}", render_info(&info));
    }
    Ok(())
}

fn render_info(info: &AppCacheInfoCollection) -> String {
    if info.is_empty() {
        return "No caches stored.\n".to_string();
    }

    let mut out = String::new();
    for (origin, caches) in &info.infos_by_origin {
        out.push_str(&format!("{origin}\n"));
        for cache in caches {
            out.push_str(&format!("  {}\n", cache.manifest_url));
            out.push_str(&format!(
                "    group {} / cache {}, {}\n",
                cache.group_id,
                cache.cache_id,
                format_bytes(cache.size)
            ));
            out.push_str(&format!(
                "    created {}, updated {}, accessed {}\n",
                cache.creation_time, cache.last_update_time, cache.last_access_time
            ));
        }
    }
    out.push_str(&format!(
        "{} cache(s), {} total\n",
        info.len(),
        format_bytes(info.total_size())
    ));
    out
}

/// Run one update and print the events it delivers to the CLI's host.
async fn handle_update(
    service: &Arc<AppCacheService>,
    manifest_url: &Url,
    master: Option<Url>,
) -> Result<()> {
    let (frontend, mut events) = ChannelFrontend::new();
    let host = HostHandle::new(CLI_HOST, Arc::new(frontend));

    let start = service
        .start_update(manifest_url, Some(host.clone()), master)
        .await
        .with_context(|| format!("failed to start update of {manifest_url}"))?;
    if start == UpdateStart::Queued {
        println!("An update is already running; queued behind it");
    }

    let mut last = None;
    let finished = service.wait_for_update(manifest_url);
    tokio::pin!(finished);
    loop {
        tokio::select! {
            _ = &mut finished => break,
            Some((_, event)) = events.recv() => {
                println!("{}", describe_event(&event));
                last = Some(event);
            }
        }
    }
    while let Ok((_, event)) = events.try_recv() {
        println!("{}", describe_event(&event));
        last = Some(event);
    }
    service.remove_host(&host);

    match last {
        Some(HostEvent::Error(details)) => anyhow::bail!("update failed: {}", details.message),
        Some(event) if event.event_id().is_terminal() => Ok(()),
        _ => {
            tracing::warn!(manifest_url = %manifest_url, "Update ended without a final event");
            Ok(())
        }
    }
}

fn describe_event(event: &HostEvent) -> String {
    match event {
        HostEvent::Status(id) => id.to_string(),
        HostEvent::Progress {
            url,
            total,
            complete,
        } if url.is_empty() => format!("{} {complete}/{total}", EventId::Progress),
        HostEvent::Progress {
            url,
            total,
            complete,
        } => format!("{} {complete}/{total} {url}", EventId::Progress),
        HostEvent::Error(details) => {
            let mut line = format!("{} ({:?}): {}", EventId::Error, details.reason, details.message);
            if let Some(url) = &details.url {
                line.push_str(&format!(" [{url}"));
                if let Some(status) = details.status {
                    line.push_str(&format!(" -> {status}"));
                }
                line.push(']');
            }
            line
        }
    }
}

async fn handle_lookup(
    service: &AppCacheService,
    url: &Url,
    manifest: Option<&Url>,
) -> Result<()> {
    let response = service
        .find_response_for_main_request(url, manifest)
        .await
        .with_context(|| format!("failed to look up {url}"))?;
    print!("{}", render_lookup(&response));
    Ok(())
}

fn render_lookup(response: &MainResponse) -> String {
    let (kind, found) = match response {
        MainResponse::Entry(found) => ("entry", found),
        MainResponse::Intercept(found) => ("intercept", found),
        MainResponse::Fallback(found) => ("fallback", found),
        MainResponse::NotFound => return "Not found in any cache\n".to_string(),
    };
    render_found(kind, found)
}

fn render_found(kind: &str, found: &FoundResponse) -> String {
    let mut out = format!("Found ({kind})\n");
    out.push_str(&format!("  Manifest: {}\n", found.manifest_url));
    out.push_str(&format!(
        "  Group: {}  Cache: {}\n",
        found.group_id, found.cache_id
    ));
    out.push_str(&format!("  Entry URL: {}\n", found.url));
    if let Some(namespace) = &found.namespace_url {
        out.push_str(&format!("  Namespace: {namespace}\n"));
    }
    out.push_str(&format!(
        "  Response: {} ({})\n",
        found.entry.response_id,
        format_bytes(found.entry.response_size)
    ));
    out.push_str(&format!("  Flags: {:?}\n", found.entry.flags));
    out
}

async fn handle_check(
    service: &AppCacheService,
    manifest_url: &Url,
    cache_id: i64,
    response_id: i64,
) -> Result<()> {
    let result = service
        .check_response(manifest_url, cache_id, response_id)
        .await
        .with_context(|| format!("failed to check response {response_id}"))?;
    match result {
        CheckResult::Ok => {
            println!("Response {response_id} is intact");
            Ok(())
        }
        CheckResult::OutOfDate => {
            println!("Cache {cache_id} is no longer the newest cache of {manifest_url}");
            Ok(())
        }
        CheckResult::GroupMissing => anyhow::bail!("no stored cache for {manifest_url}"),
        damaged => anyhow::bail!("response {response_id} is damaged ({damaged:?}); group deleted"),
    }
}

fn format_bytes(bytes: i64) -> String {
    const KB: i64 = 1024;
    const MB: i64 = 1024 * KB;
    const GB: i64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
