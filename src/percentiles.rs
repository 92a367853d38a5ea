//! Percentile latency tracking backing [`crate::statistics::Statistics`]'s
//! duration distribution, trimmed from this codebase's original
//! multi-label HDR Histogram tracker down to the single-distribution case
//! the spec calls for (one crawler instance, one duration histogram) —
//! the per-endpoint/per-scenario label tracking it also offered has no
//! counterpart here.

use hdrhistogram::Histogram;
use std::sync::Mutex;
use tracing::warn;

/// Percentile statistics for a set of latency measurements, in
/// microseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct PercentileStats {
    pub count: u64,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub p99_9: u64,
}

impl PercentileStats {
    pub fn format(&self) -> String {
        format!(
            "count={}, min={:.2}ms, max={:.2}ms, mean={:.2}ms, p50={:.2}ms, p90={:.2}ms, p95={:.2}ms, p99={:.2}ms, p99.9={:.2}ms",
            self.count,
            self.min as f64 / 1000.0,
            self.max as f64 / 1000.0,
            self.mean / 1000.0,
            self.p50 as f64 / 1000.0,
            self.p90 as f64 / 1000.0,
            self.p95 as f64 / 1000.0,
            self.p99 as f64 / 1000.0,
            self.p99_9 as f64 / 1000.0,
        )
    }
}

/// Thread-safe percentile tracker. Tracks latencies from 1μs to 60s with
/// 3 significant digits of precision.
pub struct PercentileTracker {
    histogram: Mutex<Histogram<u64>>,
}

impl PercentileTracker {
    pub fn new() -> Self {
        let histogram = Histogram::new_with_bounds(1, 60_000_000, 3).expect("failed to create histogram");
        PercentileTracker {
            histogram: Mutex::new(histogram),
        }
    }

    pub fn record_ms(&self, latency_ms: u64) {
        self.record_us(latency_ms * 1000);
    }

    pub fn record_us(&self, latency_us: u64) {
        let mut hist = self.histogram.lock().unwrap();
        let clamped = latency_us.clamp(1, 60_000_000);
        if let Err(e) = hist.record(clamped) {
            warn!(latency_us, error = %e, "failed to record latency in histogram");
        }
    }

    pub fn stats(&self) -> Option<PercentileStats> {
        let hist = self.histogram.lock().unwrap();
        if hist.is_empty() {
            return None;
        }
        Some(PercentileStats {
            count: hist.len(),
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_quantile(0.50),
            p90: hist.value_at_quantile(0.90),
            p95: hist.value_at_quantile(0.95),
            p99: hist.value_at_quantile(0.99),
            p99_9: hist.value_at_quantile(0.999),
        })
    }

    pub fn reset(&self) {
        self.histogram.lock().unwrap().clear();
    }
}

impl Default for PercentileTracker {
    fn default() -> Self {
        Self::new()
    }
}
