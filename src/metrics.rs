//! Prometheus metrics for the crawling runtime, served over the same
//! lazy-static-registration + hyper-handler pattern this codebase's load
//! generator uses, with crawler-shaped gauges/counters in place of HTTP
//! load-test ones: request throughput and retries, concurrency, and
//! session churn.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, Histogram, IntCounter, Opts, Registry, TextEncoder};
use std::env;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "crawler_core".to_string());

    pub static ref REQUESTS_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_total", "Total requests successfully handled")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUESTS_RETRIED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_retried_total", "Total request attempts that were reclaimed for retry")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUESTS_FAILED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_failed_total", "Total requests that terminal-failed")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref CURRENT_CONCURRENCY: Gauge =
        Gauge::with_opts(
            Opts::new("current_concurrency", "Number of crawler tasks currently in flight")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref DESIRED_CONCURRENCY: Gauge =
        Gauge::with_opts(
            Opts::new("desired_concurrency", "AutoscaledPool's current target concurrency")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref SESSIONS_ACTIVE: Gauge =
        Gauge::with_opts(
            Opts::new("sessions_active", "Sessions currently held by the session pool")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref SESSIONS_RETIRED_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("sessions_retired_total", "Total sessions retired (blocked, expired, or max usage)")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "Per-request handler duration in seconds"
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = prometheus::default_registry();
    registry.register(Box::new(REQUESTS_TOTAL.clone()))?;
    registry.register(Box::new(REQUESTS_RETRIED_TOTAL.clone()))?;
    registry.register(Box::new(REQUESTS_FAILED_TOTAL.clone()))?;
    registry.register(Box::new(CURRENT_CONCURRENCY.clone()))?;
    registry.register(Box::new(DESIRED_CONCURRENCY.clone()))?;
    registry.register(Box::new(SESSIONS_ACTIVE.clone()))?;
    registry.register(Box::new(SESSIONS_RETIRED_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;
    Ok(())
}

/// HTTP handler for the Prometheus metrics endpoint.
pub async fn metrics_handler(
    _req: Request<Body>,
    registry: Arc<Mutex<Registry>>,
) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server.
pub async fn start_metrics_server(port: u16, registry: Arc<Mutex<Registry>>) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(move |_conn| {
        let registry_clone = registry.clone();
        async move {
            Ok::<_, hyper::Error>(service_fn(move |req| {
                let registry_clone_inner = registry_clone.clone();
                async move { metrics_handler(req, registry_clone_inner).await }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port = port, addr = %addr, "metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}

/// Gathers and encodes metrics as a string, for a final-report dump.
pub fn gather_metrics_string(registry: &Arc<Mutex<Registry>>) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.lock().unwrap().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!(error = %e, "error encoding metrics to utf-8");
        String::from("# ERROR ENCODING METRICS TO UTF-8")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_metrics_string_produces_non_empty_text() {
        let registry = Arc::new(Mutex::new(Registry::new()));
        registry
            .lock()
            .unwrap()
            .register(Box::new(REQUESTS_TOTAL.clone()))
            .ok();
        REQUESTS_TOTAL.inc();
        let text = gather_metrics_string(&registry);
        assert!(text.contains("requests_total"));
    }
}
