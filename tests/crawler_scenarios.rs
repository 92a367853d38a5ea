//! End-to-end scenario tests driving the full `CrawlerRuntime` against a
//! `wiremock::MockServer`, the same integration-test pattern as
//! `crawler_cookie_redirect_tests.rs`. S1/S2/S4 are the literal scenarios
//! from this codebase's scenario list; S3/S5/S6/S7 live elsewhere (session
//! scoring and stall recovery are pure in-memory state transitions
//! colocated with `session.rs`/`request_queue.rs`, and the redirect/cookie
//! scenario already has its own file).

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crawler_core::config::CrawlerConfig;
use crawler_core::crawler::CrawlerRuntime;
use crawler_core::errors::CrawlError;
use crawler_core::proxy::NoProxyConfiguration;
use crawler_core::request::Request;
use crawler_core::router::{HandlerContext, HandlerResult, Router};
use crawler_core::storage::InMemoryStore;

fn sequential_config() -> CrawlerConfig {
    let mut config = CrawlerConfig::for_testing();
    config.autoscaled_pool_options.min_concurrency = 1;
    config.autoscaled_pool_options.max_concurrency = 1;
    config.autoscaled_pool_options.maybe_run_interval_millis = 5;
    config.autoscaled_pool_options.logging_interval_millis = None;
    config
}

/// S1 — concurrency 1: 10 trivial requests, each taking 5ms, complete
/// sequentially within [50ms, 200ms] and in enqueue order.
#[tokio::test]
async fn s1_ten_requests_concurrency_one_completes_within_bound_in_order() {
    let server = MockServer::start().await;
    for i in 0..10 {
        Mock::given(method("GET"))
            .and(path(format!("/r{i}")))
            .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(5)))
            .expect(1)
            .mount(&server)
            .await;
    }

    let order: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    let client = reqwest::Client::new();
    let mut router = Router::new();
    let handler_order = order.clone();
    let handler_client = client.clone();
    router.set_default_handler(Arc::new(move |ctx: HandlerContext| -> HandlerResult {
        let order = handler_order.clone();
        let client = handler_client.clone();
        Box::pin(async move {
            client
                .get(&ctx.request.url)
                .send()
                .await
                .map_err(|e| CrawlError::TransientTransport(e.to_string()))?;
            order.lock().unwrap().push(ctx.request.url.clone());
            Ok(())
        })
    }));

    let store = InMemoryStore::new();
    let mut runtime = CrawlerRuntime::new(
        sequential_config(),
        store.clone(),
        store.clone(),
        store.clone(),
        Arc::new(NoProxyConfiguration),
        router,
    )
    .await
    .unwrap();

    let requests: Vec<Request> = (0..10).map(|i| Request::new(format!("{}/r{i}", server.uri()))).collect();
    let expected_order: Vec<String> = requests.iter().map(|r| r.url.clone()).collect();

    let start = Instant::now();
    runtime.run(requests).await.unwrap();
    let elapsed = start.elapsed();

    let snapshot = runtime.statistics_snapshot().await;
    assert_eq!(snapshot.finished, 10);
    assert_eq!(*order.lock().unwrap(), expected_order);
    assert!(
        elapsed.as_millis() >= 50 && elapsed.as_millis() <= 200,
        "wall time {:?} outside [50ms, 200ms]",
        elapsed
    );
}

/// S2 — concurrency 10: 100 trivial requests, each taking 5ms, all
/// complete within [50ms, 200ms].
#[tokio::test]
async fn s2_hundred_requests_concurrency_ten_completes_within_bound() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/r"))
        .respond_with(ResponseTemplate::new(200).set_delay(std::time::Duration::from_millis(5)))
        .expect(100)
        .mount(&server)
        .await;

    let client = reqwest::Client::new();
    let mut router = Router::new();
    let handler_client = client.clone();
    router.set_default_handler(Arc::new(move |ctx: HandlerContext| -> HandlerResult {
        let client = handler_client.clone();
        Box::pin(async move {
            client
                .get(&ctx.request.url)
                .send()
                .await
                .map_err(|e| CrawlError::TransientTransport(e.to_string()))?;
            Ok(())
        })
    }));

    let mut config = sequential_config();
    config.autoscaled_pool_options.min_concurrency = 10;
    config.autoscaled_pool_options.max_concurrency = 10;

    let store = InMemoryStore::new();
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

    let requests: Vec<Request> = (0..100)
        .map(|_| Request::new(format!("{}/r", server.uri())).with_unique_key(uuid::Uuid::new_v4().to_string()))
        .collect();

    let start = Instant::now();
    runtime.run(requests).await.unwrap();
    let elapsed = start.elapsed();

    let snapshot = runtime.statistics_snapshot().await;
    assert_eq!(snapshot.finished, 100);
    assert!(
        elapsed.as_millis() >= 50 && elapsed.as_millis() <= 200,
        "wall time {:?} outside [50ms, 200ms]",
        elapsed
    );
}

/// S4 — retry bound: `maxRequestRetries = 10`, `sessionOptions.maxErrorScore
/// = 2`, a handler that always throws. `retryCount` starts at 0, so the
/// request terminal-fails once `retryCount + 1 > maxRequestRetries`: exactly
/// 11 total attempts, one error-snapshot dataset push per attempt, and no
/// session id appears in more than 2 of those pushes (a session retires the
/// instant its error score reaches `maxErrorScore`).
#[tokio::test]
async fn s4_retry_bound_pushes_eleven_snapshots_no_session_reused_past_two() {
    let mut config = CrawlerConfig::for_testing();
    config.max_request_retries = 10;
    config.statistics_options.save_error_snapshots = true;
    config.session_pool_options.session_options.max_error_score = 2.0;
    config.autoscaled_pool_options.maybe_run_interval_millis = 5;

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
        .run(vec![Request::new("https://example.com/seed")])
        .await
        .unwrap();

    let items = store.dataset_items();
    assert_eq!(items.len(), 11);

    let mut session_counts: std::collections::HashMap<String, u32> = std::collections::HashMap::new();
    for item in &items {
        assert!(item.get("id").is_some());
        assert!(item.get("usage_count").is_some());
        assert!(item.get("error_score").is_some());
        *session_counts.entry(item["id"].as_str().unwrap().to_string()).or_insert(0) += 1;
    }
    assert!(session_counts.values().all(|&count| count <= 2));

    let snapshot = runtime.statistics_snapshot().await;
    assert_eq!(snapshot.failed, 1);
    assert_eq!(snapshot.finished, 0);
}
