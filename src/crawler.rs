//! `CrawlerRuntime` (§4.G): the glue that binds the request queue, session
//! pool, autoscaled pool, statistics, router, and event bus into a single
//! runnable crawl. `run()` seeds the queue, wires the pool's three hooks to
//! this runtime's collaborators, and drives the crawl to completion.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::warn;

use crate::autoscaled_pool::{AutoscaledPool, PoolHooks};
use crate::config::CrawlerConfig;
use crate::errors::{CrawlError, CrawlerError};
use crate::events::{Event, EventManager};
use crate::proxy::ProxyConfiguration;
use crate::request::Request;
use crate::request_queue::{RequestQueue, RequestQueueOptions};
use crate::router::{HandlerContext, Router};
use crate::session_pool::{SessionPool, SessionPoolState};
use crate::snapshotter::{ClientErrorCounter, Snapshotter, SnapshotterOptions};
use crate::statistics::{Statistics, StatisticsState};
use crate::storage::{Dataset, KeyValueStore, RequestQueueClient};
use crate::system_status::SystemStatus;

/// Collaborators shared across every spawned task, behind one `Arc` so the
/// pool's hooks (which must be `'static`) can each hold a clone rather than
/// borrowing the runtime.
struct Inner {
    queue: RequestQueue,
    session_pool: Mutex<SessionPool>,
    statistics: Mutex<Statistics>,
    router: Router,
    events: EventManager,
    kv_store: Arc<dyn KeyValueStore>,
    dataset: Arc<dyn Dataset>,
    #[allow(dead_code)] // threaded through for handlers to consult; the core itself never calls it
    proxy: Arc<dyn ProxyConfiguration>,
    /// The snapshotter's "Client" gauge counter; `BlockedByServer` outcomes
    /// report into it so the system status monitor can fold throttling
    /// signals into the overloaded verdict.
    client_errors: Arc<ClientErrorCounter>,
    config: CrawlerConfig,
    crawler_id: String,
    processed_count: AtomicU64,
}

/// Wires a durable queue, a session pool, a statistics aggregator, and an
/// autoscaled pool into one runnable crawl.
pub struct CrawlerRuntime {
    inner: Arc<Inner>,
    snapshotter: Snapshotter,
    pool: AutoscaledPool,
}

impl CrawlerRuntime {
    pub async fn new(
        config: CrawlerConfig,
        queue_client: Arc<dyn RequestQueueClient>,
        kv_store: Arc<dyn KeyValueStore>,
        dataset: Arc<dyn Dataset>,
        proxy: Arc<dyn ProxyConfiguration>,
        router: Router,
    ) -> Result<Self, CrawlerError> {
        let crawler_id = uuid::Uuid::new_v4().to_string();
        let events = EventManager::new();

        let queue = RequestQueue::new(
            queue_client,
            RequestQueueOptions {
                internal_timeout_millis: config.internal_timeout_millis,
                request_locking: config.experiments.request_locking,
                ..Default::default()
            },
        );

        let session_pool_options = config.session_pool_options.clone();
        let persisted_session_state = kv_store
            .get_value(&session_pool_options.persist_state_key)
            .await?
            .and_then(|value| serde_json::from_value::<SessionPoolState>(value).ok());
        let session_pool = match persisted_session_state {
            Some(state) => SessionPool::from_state(state, session_pool_options, events.clone()),
            None => SessionPool::new(session_pool_options, events.clone()),
        };

        let statistics_key = Statistics::persistence_key(&crawler_id);
        let persisted_statistics_state = kv_store
            .get_value(&statistics_key)
            .await?
            .and_then(|value| serde_json::from_value::<StatisticsState>(value).ok());
        let statistics = match persisted_statistics_state {
            Some(state) => Statistics::from_state(state),
            None => Statistics::new(),
        };

        let pool = AutoscaledPool::new(config.autoscaled_pool_options);
        let snapshotter = Snapshotter::new(SnapshotterOptions::default());
        let client_errors = snapshotter.client_error_counter();

        let inner = Arc::new(Inner {
            queue,
            session_pool: Mutex::new(session_pool),
            statistics: Mutex::new(statistics),
            router,
            events,
            kv_store,
            dataset,
            proxy,
            client_errors,
            config,
            crawler_id,
            processed_count: AtomicU64::new(0),
        });

        Ok(CrawlerRuntime {
            inner,
            snapshotter,
            pool,
        })
    }

    /// Requests the crawl stop after in-flight tasks drain. Mirrors
    /// `tokio::signal::ctrl_c()`-triggered shutdown; callers wanting
    /// graceful shutdown on SIGINT should spawn a task that awaits
    /// `ctrl_c()` and calls this.
    pub fn abort(&self) {
        self.pool.abort();
    }

    /// A cloneable, `'static` handle for triggering [`CrawlerRuntime::abort`]
    /// from outside `run()`'s borrow, e.g. a `tokio::signal::ctrl_c()` task
    /// spawned before `run()` is called.
    pub fn abort_flag(&self) -> Arc<AtomicBool> {
        self.pool.abort_flag()
    }

    /// A snapshot of throughput/retry statistics as of now, for a final
    /// report after `run()` returns or while a long crawl is in progress.
    pub async fn statistics_snapshot(&self) -> crate::statistics::StatisticsSnapshot {
        self.inner.statistics.lock().await.get_current()
    }

    /// Percentile breakdown of handler durations, alongside the arithmetic
    /// mean already in [`CrawlerRuntime::statistics_snapshot`]. `None` until
    /// the first job finishes.
    pub async fn percentile_stats(&self) -> Option<crate::percentiles::PercentileStats> {
        self.inner.statistics.lock().await.percentile_stats()
    }

    /// Seeds the queue with `initial_requests`, then drives the crawl to
    /// completion: dispatch continues until the queue is drained (or
    /// `maxRequestsPerCrawl` is reached, or `abort()` is called), after
    /// which statistics and session pool state are persisted one final
    /// time regardless of outcome.
    pub async fn run(&mut self, initial_requests: Vec<Request>) -> Result<(), CrawlerError> {
        self.inner.queue.add_requests(initial_requests, false).await?;

        self.snapshotter.start();
        let system_status = SystemStatus::new(&self.snapshotter, self.inner.config.system_status_options);

        let persist_interval = Duration::from_millis(
            self.inner
                .config
                .autoscaled_pool_options
                .logging_interval_millis
                .unwrap_or(60_000),
        );
        let persist_ticker = self.inner.events.spawn_persist_ticker(persist_interval);

        let event_task = {
            let inner = self.inner.clone();
            let mut subscription = inner.events.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = subscription.recv().await {
                    match &event {
                        Event::PersistState => persist(&inner).await,
                        Event::SessionRetired { .. } => {
                            crate::metrics::SESSIONS_RETIRED_TOTAL.inc();
                            inner.session_pool.lock().await.handle_event(&event);
                        }
                    }
                }
            })
        };

        let hooks = build_hooks(self.inner.clone(), self.pool.abort_flag());
        let result = self.pool.run(hooks, &system_status).await;

        self.snapshotter.stop();
        persist_ticker.abort();
        event_task.abort();
        persist(&self.inner).await;

        result
    }
}

async fn persist(inner: &Inner) {
    let stats_state = inner.statistics.lock().await.state().clone();
    match serde_json::to_value(&stats_state) {
        Ok(value) => {
            let key = Statistics::persistence_key(&inner.crawler_id);
            if let Err(e) = inner.kv_store.set_value(&key, value).await {
                warn!(error = %e, "failed to persist statistics state");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize statistics state"),
    }

    let (pool_state, pool_key) = {
        let session_pool = inner.session_pool.lock().await;
        (session_pool.get_state(), session_pool.persistence_key().to_string())
    };
    match serde_json::to_value(&pool_state) {
        Ok(value) => {
            if let Err(e) = inner.kv_store.set_value(&pool_key, value).await {
                warn!(error = %e, "failed to persist session pool state");
            }
        }
        Err(e) => warn!(error = %e, "failed to serialize session pool state"),
    }
}

fn build_hooks(inner: Arc<Inner>, abort_flag: Arc<AtomicBool>) -> PoolHooks {
    let ready_inner = inner.clone();
    let ready_abort = abort_flag.clone();
    let finished_inner = inner.clone();
    let finished_abort = abort_flag;
    let run_task_inner = inner;

    PoolHooks {
        is_task_ready: Box::new(move || {
            let inner = ready_inner.clone();
            let abort_flag = ready_abort.clone();
            Box::pin(async move {
                if abort_flag.load(Ordering::SeqCst) {
                    return false;
                }
                !inner.queue.is_empty().await.unwrap_or(true)
            })
        }),
        is_finished: Box::new(move || {
            let inner = finished_inner.clone();
            let abort_flag = finished_abort.clone();
            Box::pin(async move {
                if abort_flag.load(Ordering::SeqCst) {
                    return true;
                }
                let queue_finished = inner.queue.is_finished().await.unwrap_or(false);
                let max_reached = inner
                    .config
                    .max_requests_per_crawl
                    .map(|max| inner.processed_count.load(Ordering::SeqCst) >= max)
                    .unwrap_or(false);
                queue_finished || max_reached
            })
        }),
        run_task: Box::new(move || {
            let inner = run_task_inner.clone();
            Box::pin(async move { run_one_request(inner).await })
        }),
    }
}

/// The per-task dispatch algorithm (§4.G): fetch, bind a session, dispatch
/// through the router under a watchdog timeout, then route the outcome to
/// success, retry, or terminal failure.
///
/// Errors from the queue/session pool collaborators are logged and
/// swallowed here rather than propagated: per §7's propagation policy, only
/// pool machinery failures (panics surfacing as `PoolFatal`) and invalid
/// configuration reject `run()`. A storage hiccup on one tick should not
/// take down the whole crawl.
async fn run_one_request(inner: Arc<Inner>) -> Result<(), CrawlerError> {
    let request = match inner.queue.fetch_next_request().await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(e) => {
            warn!(error = %e, "failed to fetch next request this tick");
            return Ok(());
        }
    };

    let mut session = {
        let mut session_pool = inner.session_pool.lock().await;
        match session_pool.get_session() {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "no usable session; reclaiming request for a later attempt");
                drop(session_pool);
                if let Err(e) = inner.queue.reclaim_request(request, false).await {
                    warn!(error = %e, "failed to reclaim request after session acquisition failure");
                }
                return Ok(());
            }
        }
    };

    inner.statistics.lock().await.start_job(&request.id);

    // Shared (not cloned) so that any cookie-jar mutations the handler makes
    // via its own fetch are still visible here once it returns.
    let shared_session = Arc::new(Mutex::new(session));
    let handler_timeout = Duration::from_secs_f64(inner.config.request_handler_timeout_secs);
    let outcome: Result<(), CrawlError> = match inner.router.resolve(&request) {
        Ok(handler) => {
            let ctx = HandlerContext {
                request: request.clone(),
                session: shared_session.clone(),
            };
            match tokio::time::timeout(handler_timeout, handler(ctx)).await {
                Ok(handler_result) => handler_result,
                Err(_) => Err(CrawlError::HandlerTimeout),
            }
        }
        // MissingRoute: terminal regardless of retryCount, per §7.
        Err(route_error) => Err(route_error),
    };
    let mut session = match Arc::try_unwrap(shared_session) {
        Ok(mutex) => mutex.into_inner(),
        Err(arc) => arc.lock().await.clone(),
    };

    match outcome {
        Ok(()) => {
            session.mark_good();
            inner.statistics.lock().await.finish_job(&request.id);
            if let Err(e) = inner.queue.mark_request_handled(request).await {
                warn!(error = %e, "failed to persist handled request");
            }
            crate::metrics::REQUESTS_TOTAL.inc();
            inner.session_pool.lock().await.return_session(session);
        }
        Err(err) => {
            session.mark_bad();
            if err.retires_session() {
                session.retire();
            }
            if matches!(err, CrawlError::BlockedByServer(_)) {
                inner.client_errors.record();
            }

            if inner.config.statistics_options.save_error_snapshots {
                let snapshot = serde_json::json!({
                    "id": session.id,
                    "usage_count": session.usage_count,
                    "error_score": session.error_score,
                    "error": err.to_string(),
                });
                if let Err(e) = inner.dataset.push_data(snapshot).await {
                    warn!(error = %e, "failed to push error snapshot");
                }
            }

            let is_terminal = err.is_terminal()
                || request.no_retry
                || request.retry_count + 1 > inner.config.max_request_retries;

            if is_terminal {
                inner.statistics.lock().await.fail_job(&request.id);
                let mut failed_request = request;
                failed_request.record_error(err.to_string());
                if let Err(e) = inner.queue.mark_request_handled(failed_request).await {
                    warn!(error = %e, "failed to persist terminally-failed request");
                }
                crate::metrics::REQUESTS_FAILED_TOTAL.inc();
            } else {
                let mut retried_request = request;
                retried_request.retry_count += 1;
                retried_request.record_error(err.to_string());
                if let Err(e) = inner.queue.reclaim_request(retried_request, false).await {
                    warn!(error = %e, "failed to reclaim request for retry");
                }
                crate::metrics::REQUESTS_RETRIED_TOTAL.inc();
            }

            inner.session_pool.lock().await.return_session(session);
        }
    }

    inner.processed_count.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

/// Performs `request` with `session`'s cookies attached, following
/// redirects manually so each hop's `Set-Cookie` headers are merged into
/// the session before the next hop fires — the behavior a real crawler's
/// request handler needs for cookie-carrying navigation (§4.G, §8 S6).
/// `client` should be built with `reqwest::redirect::Policy::none()`, since
/// this function owns redirect following itself.
pub async fn fetch_with_session(
    client: &reqwest::Client,
    session: &mut crate::session::Session,
    request: &Request,
) -> Result<reqwest::Response, CrawlError> {
    const MAX_REDIRECTS: u32 = 10;
    let mut url = request.url.clone();

    for _ in 0..MAX_REDIRECTS {
        let method: reqwest::Method = request
            .method
            .parse()
            .map_err(|_| CrawlError::MalformedInput(format!("invalid method: {}", request.method)))?;

        let mut builder = client.request(method, &url);
        let cookie_header = session.get_cookie_string(&url);
        if !cookie_header.is_empty() {
            builder = builder.header(reqwest::header::COOKIE, cookie_header);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| CrawlError::TransientTransport(e.to_string()))?;

        let set_cookie_headers: Vec<String> = response
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok().map(str::to_string))
            .collect();
        if !set_cookie_headers.is_empty() {
            session.set_cookies_from_response(&set_cookie_headers, &url);
        }

        if !response.status().is_redirection() {
            return Ok(response);
        }
        let Some(location) = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|value| value.to_str().ok())
        else {
            return Ok(response);
        };
        url = resolve_redirect_url(&url, location);
    }

    Err(CrawlError::TransientTransport("too many redirects".into()))
}

fn resolve_redirect_url(base: &str, location: &str) -> String {
    if location.starts_with("http://") || location.starts_with("https://") {
        return location.to_string();
    }
    if let Some(origin) = origin_of(base) {
        if let Some(path) = location.strip_prefix('/') {
            return format!("{}/{}", origin, path);
        }
    }
    location.to_string()
}

fn origin_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split('/').next().unwrap_or(rest);
    Some(format!("{}://{}", scheme, authority))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::NoProxyConfiguration;
    use crate::router::HandlerResult;
    use crate::storage::InMemoryStore;

    #[tokio::test]
    async fn trivial_handler_completes_all_requests() {
        let config = CrawlerConfig::for_testing();
        let store = InMemoryStore::new();
        let mut router = Router::new();
        router.set_default_handler(Arc::new(|_ctx: HandlerContext| -> HandlerResult {
            Box::pin(async { Ok(()) })
        }));

        let mut runtime = CrawlerRuntime::new(
            config,
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NoProxyConfiguration),
            router,
        )
        .await
        .unwrap();

        let requests: Vec<Request> = (0..5)
            .map(|i| Request::new(format!("https://example.com/{}", i)))
            .collect();
        runtime.run(requests).await.unwrap();

        assert!(runtime.inner.queue.is_finished().await.unwrap());
        let finished = runtime.inner.statistics.lock().await.get_current().finished;
        assert_eq!(finished, 5);
    }

    /// S4-shaped: a handler that always fails bounds retries at
    /// `max_request_retries + 1` total attempts (retryCount starts at 0, so
    /// the request terminal-fails once `retryCount + 1 > maxRequestRetries`),
    /// pushing one error snapshot per attempt, with no session exceeding its
    /// configured error budget.
    #[tokio::test]
    async fn retry_bound_pushes_one_error_snapshot_per_attempt() {
        let mut config = CrawlerConfig::for_testing();
        config.max_request_retries = 3;
        config.statistics_options.save_error_snapshots = true;
        config.session_pool_options.session_options.max_error_score = 2.0;

        let store = InMemoryStore::new();
        let mut router = Router::new();
        router.set_default_handler(Arc::new(|_ctx: HandlerContext| -> HandlerResult {
            Box::pin(async { Err(CrawlError::TransientTransport("boom".into())) })
        }));

        let mut runtime = CrawlerRuntime::new(
            config,
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NoProxyConfiguration),
            router,
        )
        .await
        .unwrap();

        runtime
            .run(vec![Request::new("https://example.com/a")])
            .await
            .unwrap();

        let items = store.dataset_items();
        assert_eq!(items.len(), 4);
        let mut session_counts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
        for item in &items {
            assert!(item["error_score"].as_f64().unwrap() <= 2.0);
            *session_counts.entry(item["id"].as_str().unwrap().to_string()).or_insert(0) += 1;
        }
        assert!(session_counts.values().all(|&count| count <= 2));

        let snapshot = runtime.inner.statistics.lock().await.get_current();
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.finished, 0);
    }

    #[tokio::test]
    async fn missing_route_terminal_fails_on_first_attempt() {
        let mut config = CrawlerConfig::for_testing();
        config.max_request_retries = 10;
        let store = InMemoryStore::new();
        let router = Router::new(); // no default handler registered

        let mut runtime = CrawlerRuntime::new(
            config,
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NoProxyConfiguration),
            router,
        )
        .await
        .unwrap();

        runtime
            .run(vec![Request::new("https://example.com/a").with_label("unhandled")])
            .await
            .unwrap();

        assert!(runtime.inner.queue.is_finished().await.unwrap());
        let snapshot = runtime.inner.statistics.lock().await.get_current();
        assert_eq!(snapshot.failed, 1);
    }

    #[tokio::test]
    async fn no_retry_request_terminal_fails_on_first_attempt() {
        let config = CrawlerConfig::for_testing();
        let store = InMemoryStore::new();
        let mut router = Router::new();
        router.set_default_handler(Arc::new(|_ctx: HandlerContext| -> HandlerResult {
            Box::pin(async { Err(CrawlError::TransientTransport("boom".into())) })
        }));

        let mut runtime = CrawlerRuntime::new(
            config,
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(NoProxyConfiguration),
            router,
        )
        .await
        .unwrap();

        runtime
            .run(vec![Request::new("https://example.com/a").with_no_retry(true)])
            .await
            .unwrap();

        assert!(runtime.inner.queue.is_finished().await.unwrap());
        let snapshot = runtime.inner.statistics.lock().await.get_current();
        assert_eq!(snapshot.failed, 1);
    }

    #[test]
    fn resolve_redirect_url_resolves_absolute_path_against_origin() {
        let resolved = resolve_redirect_url("https://example.com/a", "/b");
        assert_eq!(resolved, "https://example.com/b");
    }

    #[test]
    fn resolve_redirect_url_passes_through_absolute_urls() {
        let resolved = resolve_redirect_url("https://example.com/a", "https://other.com/b");
        assert_eq!(resolved, "https://other.com/b");
    }
}
