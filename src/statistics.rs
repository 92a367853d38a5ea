//! The Statistics aggregator (§4.C): per-job timings, throughput, and the
//! retry histogram, persisted through the `KeyValueStore` interface under
//! `SDK_CRAWLER_STATISTICS_<id>`.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::percentiles::{PercentileStats, PercentileTracker};
use crate::request::RequestId;

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// `{ startedAt, finishedAt?, retryCount }` per attempted job (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JobRecord {
    started_at: i64,
    finished_at: Option<i64>,
    retry_count: u32,
}

/// Snapshot returned by [`Statistics::get_current`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatisticsSnapshot {
    pub avg_duration_millis: f64,
    pub per_minute: f64,
    pub finished: u64,
    pub failed: u64,
    /// `retry_histogram[k]` = count of requests whose final attempt was
    /// the `(k+1)`-th.
    pub retry_histogram: Vec<u64>,
}

/// The durable form written to `KeyValueStore` under
/// `SDK_CRAWLER_STATISTICS_<id>`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StatisticsState {
    total_duration_millis: f64,
    finished_count: u64,
    failed_count: u64,
    retry_histogram: Vec<u64>,
    crawler_started_at: Option<i64>,
}

/// Per-job timings plus the running aggregates backing [`StatisticsSnapshot`].
/// The `hdrhistogram`-backed [`PercentileTracker`] is kept alongside the
/// running mean rather than replacing it: `avgDurationMillis` stays the
/// plain arithmetic mean the spec defines, with percentiles exposed as an
/// additional, not a substitute, view of the same durations.
pub struct Statistics {
    jobs: HashMap<RequestId, JobRecord>,
    state: StatisticsState,
    durations: PercentileTracker,
}

impl Default for Statistics {
    fn default() -> Self {
        Statistics::new()
    }
}

impl Statistics {
    pub fn new() -> Self {
        Statistics {
            jobs: HashMap::new(),
            state: StatisticsState {
                crawler_started_at: Some(now_millis()),
                ..Default::default()
            },
            durations: PercentileTracker::new(),
        }
    }

    /// Rehydrate from a previously persisted [`StatisticsState`]. The
    /// percentile distribution is not itself persisted (it is a debugging
    /// aid, not part of the durable contract) and starts empty.
    pub fn from_state(state: StatisticsState) -> Self {
        Statistics {
            jobs: HashMap::new(),
            state,
            durations: PercentileTracker::new(),
        }
    }

    /// Records `startedAt`; increments the job's `retryCount` if a prior
    /// record for this id already exists (i.e. this is a re-attempt).
    pub fn start_job(&mut self, job_id: &str) {
        match self.jobs.get_mut(job_id) {
            Some(record) => {
                record.retry_count += 1;
                record.started_at = now_millis();
                record.finished_at = None;
            }
            None => {
                self.jobs.insert(
                    job_id.to_string(),
                    JobRecord {
                        started_at: now_millis(),
                        finished_at: None,
                        retry_count: 0,
                    },
                );
            }
        }
    }

    /// Records `finishedAt - startedAt` into the running average;
    /// increments `finishedCount`.
    pub fn finish_job(&mut self, job_id: &str) {
        let Some(record) = self.jobs.get_mut(job_id) else {
            return;
        };
        let finished_at = now_millis();
        record.finished_at = Some(finished_at);
        let duration = (finished_at - record.started_at).max(0) as f64;
        self.state.total_duration_millis += duration;
        self.state.finished_count += 1;
        self.durations.record_ms(duration as u64);
        self.record_retry_histogram(record.retry_count);
        debug!(job_id, duration, "job finished");
    }

    /// Increments `failedCount`; does not contribute to the duration
    /// average.
    pub fn fail_job(&mut self, job_id: &str) {
        self.state.failed_count += 1;
        if let Some(record) = self.jobs.get(job_id) {
            self.record_retry_histogram(record.retry_count);
        }
        debug!(job_id, "job failed");
    }

    fn record_retry_histogram(&mut self, retry_count: u32) {
        let bucket = retry_count as usize;
        if self.state.retry_histogram.len() <= bucket {
            self.state.retry_histogram.resize(bucket + 1, 0);
        }
        self.state.retry_histogram[bucket] += 1;
    }

    pub fn get_current(&self) -> StatisticsSnapshot {
        let avg_duration_millis = if self.state.finished_count > 0 {
            self.state.total_duration_millis / self.state.finished_count as f64
        } else {
            f64::INFINITY
        };

        let elapsed_ms = self
            .state
            .crawler_started_at
            .map(|started| (now_millis() - started).max(1))
            .unwrap_or(1) as f64;
        let per_minute = (self.state.finished_count as f64 / (elapsed_ms / 60_000.0)).round();

        StatisticsSnapshot {
            avg_duration_millis,
            per_minute,
            finished: self.state.finished_count,
            failed: self.state.failed_count,
            retry_histogram: self.state.retry_histogram.clone(),
        }
    }

    pub fn state(&self) -> &StatisticsState {
        &self.state
    }

    /// The percentile distribution backing `avgDurationMillis`, exposed
    /// alongside (not instead of) the arithmetic mean in
    /// [`Statistics::get_current`]. `None` until the first job finishes.
    pub fn percentile_stats(&self) -> Option<PercentileStats> {
        self.durations.stats()
    }

    /// Key under which this crawler's statistics are persisted, per §6:
    /// `SDK_CRAWLER_STATISTICS_<id>`.
    pub fn persistence_key(crawler_id: &str) -> String {
        format!("SDK_CRAWLER_STATISTICS_{}", crawler_id)
    }
}
