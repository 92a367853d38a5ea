//! Thin binary wiring a runnable example crawler from configuration:
//! `CrawlerConfig::from_env()`, an on-disk `KeyValueStore` plus an
//! in-memory queue/dataset, a router with one default handler that
//! fetches each seed URL and logs its outcome, and graceful shutdown on
//! `ctrl_c()`. The interesting machinery lives in the library; this file
//! only wires collaborators together, mirroring this codebase's original
//! lib/bin split.

use std::env;
use std::sync::{Arc, Mutex as StdMutex};

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crawler_core::config::CrawlerConfig;
use crawler_core::crawler::{fetch_with_session, CrawlerRuntime};
use crawler_core::errors::CrawlError;
use crawler_core::metrics;
use crawler_core::proxy::{NoProxyConfiguration, ProxyConfiguration, RotatingProxyConfiguration};
use crawler_core::request::Request;
use crawler_core::router::{HandlerContext, HandlerResult, Router};
use crawler_core::storage::{Dataset, FileKeyValueStore, InMemoryStore, KeyValueStore, RequestQueueClient};
use crawler_core::utils::format_retry_histogram;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn build_proxy() -> Arc<dyn ProxyConfiguration> {
    match env::var("CRAWLEE_PROXY_URLS") {
        Ok(raw) if !raw.trim().is_empty() => {
            let urls: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            Arc::new(RotatingProxyConfiguration::new(urls))
        }
        _ => Arc::new(NoProxyConfiguration),
    }
}

fn seed_requests() -> Vec<Request> {
    let raw = env::var("CRAWLEE_SEED_URLS").unwrap_or_else(|_| "https://example.com".to_string());
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Request::new)
        .collect()
}

/// Demonstrates the intended shape of a request handler: pull the shared
/// session out of its mutex, fetch with cookie/redirect handling, and
/// classify the response status into success or a `CrawlError` the
/// dispatch loop can retry or terminal-fail on.
fn build_default_handler(client: reqwest::Client) -> crawler_core::router::RequestHandler {
    Arc::new(move |ctx: HandlerContext| -> HandlerResult {
        let client = client.clone();
        Box::pin(async move {
            let HandlerContext { request, session } = ctx;
            let mut session_guard = session.lock().await;
            let response = fetch_with_session(&client, &mut *session_guard, &request).await?;
            drop(session_guard);

            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 || status.as_u16() == 429 {
                return Err(CrawlError::BlockedByServer(status.as_u16()));
            }
            if status.is_server_error() {
                return Err(CrawlError::TransientTransport(format!("server error {}", status)));
            }

            info!(url = %request.url, status = %status, "page fetched");
            Ok(())
        })
    })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .json()
        .init();

    let config = CrawlerConfig::from_env()?;

    if config.purge_on_start {
        match tokio::fs::remove_dir_all(&config.storage_dir).await {
            Ok(()) => info!(dir = %config.storage_dir, "purged storage directory on start"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, dir = %config.storage_dir, "failed to purge storage directory"),
        }
    }

    metrics::register_metrics()?;
    let registry = Arc::new(StdMutex::new(prometheus::default_registry().clone()));
    let metrics_port: u16 = env::var("METRICS_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(9090);
    tokio::spawn(metrics::start_metrics_server(metrics_port, registry.clone()));

    // The queue and dataset share the in-process store; the key-value
    // store is backed by `CRAWLEE_STORAGE_DIR` so session/statistics state
    // survives a restart.
    let memory_store = InMemoryStore::new();
    let queue_client: Arc<dyn RequestQueueClient> = memory_store.clone();
    let dataset: Arc<dyn Dataset> = memory_store.clone();
    let kv_store: Arc<dyn KeyValueStore> = Arc::new(FileKeyValueStore::new(config.storage_dir.clone()));
    let proxy = build_proxy();

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let mut router = Router::new();
    router.set_default_handler(build_default_handler(client));

    let mut runtime = CrawlerRuntime::new(config, queue_client, kv_store, dataset, proxy, router).await?;

    let abort_flag = runtime.abort_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received ctrl-c, requesting graceful shutdown");
            abort_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    });

    let requests = seed_requests();
    info!(count = requests.len(), "seeding crawl");
    if let Err(e) = runtime.run(requests).await {
        error!(error = %e, "crawl exited with error");
    }

    let snapshot = runtime.statistics_snapshot().await;
    info!(
        finished = snapshot.finished,
        failed = snapshot.failed,
        per_minute = snapshot.per_minute,
        avg_duration_millis = snapshot.avg_duration_millis,
        retry_histogram = %format_retry_histogram(&snapshot.retry_histogram),
        "crawl finished"
    );
    if let Some(percentiles) = runtime.percentile_stats().await {
        info!(percentiles = %percentiles.format(), "handler duration percentiles");
    }

    Ok(())
}
