//! The Snapshotter (§4.A): samples four resource gauges on independent
//! schedules and retains a bounded history per gauge for [`crate::system_status`]
//! to fold into idle/overloaded verdicts.
//!
//! Memory-limit detection (cgroup v1/v2, then host totals) and RSS sampling
//! are carried over from this codebase's original single-gauge memory guard,
//! generalized here to one of four gauges instead of the only one.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, warn};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// One of the four resource gauges §4.A folds into the overloaded signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gauge {
    Memory,
    EventLoopLag,
    Cpu,
    Client,
}

impl Gauge {
    pub const ALL: [Gauge; 4] = [Gauge::Memory, Gauge::EventLoopLag, Gauge::Cpu, Gauge::Client];
}

/// `{ createdAt, isOverloaded, payload }` for a single gauge reading.
#[derive(Debug, Clone, Copy)]
pub struct Snapshot {
    pub created_at: i64,
    pub is_overloaded: bool,
    /// The raw ratio/lag/utilization/error-count that produced the verdict;
    /// carried for observability, not consulted by [`crate::system_status`].
    pub payload: f64,
}

/// Tuning knobs for the Snapshotter, mirroring §4.A's defaults.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotterOptions {
    pub max_used_memory_ratio: f64,
    pub max_blocked_millis: u64,
    pub max_used_cpu_ratio: f64,
    pub max_client_errors: u32,
    pub memory_interval: Duration,
    pub event_loop_interval: Duration,
    pub cpu_interval: Duration,
    pub client_interval: Duration,
    /// Widest of §4.B's two windows; history older than this (plus slack)
    /// is evicted.
    pub max_window: Duration,
}

impl Default for SnapshotterOptions {
    fn default() -> Self {
        SnapshotterOptions {
            max_used_memory_ratio: 0.7,
            max_blocked_millis: 50,
            max_used_cpu_ratio: 0.95,
            max_client_errors: 1,
            memory_interval: Duration::from_millis(500),
            event_loop_interval: Duration::from_millis(500),
            cpu_interval: Duration::from_millis(1000),
            client_interval: Duration::from_millis(1000),
            max_window: Duration::from_secs(60),
        }
    }
}

const EVICTION_SLACK: Duration = Duration::from_secs(10);

#[derive(Default)]
struct GaugeHistory {
    samples: VecDeque<Snapshot>,
}

impl GaugeHistory {
    fn push(&mut self, snapshot: Snapshot, max_window: Duration) {
        self.samples.push_back(snapshot);
        let cutoff = now_millis() - (max_window + EVICTION_SLACK).as_millis() as i64;
        while matches!(self.samples.front(), Some(s) if s.created_at < cutoff) {
            self.samples.pop_front();
        }
    }

    fn since(&self, since_ms: i64) -> Vec<Snapshot> {
        let cutoff = now_millis() - since_ms;
        self.samples
            .iter()
            .copied()
            .filter(|s| s.created_at >= cutoff)
            .collect()
    }
}

/// Reports the number of throttle/429-equivalent signals observed by the
/// API client collaborator since it was last polled. The crawler's HTTP
/// client increments this; the snapshotter drains it on each tick.
#[derive(Debug, Default)]
pub struct ClientErrorCounter(AtomicU32);

impl ClientErrorCounter {
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn drain(&self) -> u32 {
        self.0.swap(0, Ordering::Relaxed)
    }
}

/// Reports the most recently measured CPU utilization ratio (0.0-1.0), set
/// externally (e.g. by a `/proc/stat` poller) since a pure async task has
/// no portable way to measure its own CPU share without blocking.
#[derive(Debug)]
pub struct CpuUtilizationGauge(std::sync::atomic::AtomicU64);

impl Default for CpuUtilizationGauge {
    fn default() -> Self {
        CpuUtilizationGauge(AtomicU64::new(0))
    }
}

impl CpuUtilizationGauge {
    pub fn set(&self, ratio: f64) {
        self.0.store(ratio.to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Periodically samples the four gauges and retains a bounded history.
/// Each gauge is a self-rescheduling cooperative task, cancelled on
/// [`Snapshotter::stop`].
pub struct Snapshotter {
    options: SnapshotterOptions,
    histories: Arc<Mutex<std::collections::HashMap<Gauge, GaugeHistory>>>,
    client_errors: Arc<ClientErrorCounter>,
    cpu_gauge: Arc<CpuUtilizationGauge>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: Option<mpsc::Sender<()>>,
}

impl Snapshotter {
    pub fn new(options: SnapshotterOptions) -> Self {
        let mut histories = std::collections::HashMap::new();
        for gauge in Gauge::ALL {
            histories.insert(gauge, GaugeHistory::default());
        }
        Snapshotter {
            options,
            histories: Arc::new(Mutex::new(histories)),
            client_errors: Arc::new(ClientErrorCounter::default()),
            cpu_gauge: Arc::new(CpuUtilizationGauge::default()),
            tasks: Vec::new(),
            shutdown: None,
        }
    }

    pub fn client_error_counter(&self) -> Arc<ClientErrorCounter> {
        self.client_errors.clone()
    }

    pub fn cpu_gauge(&self) -> Arc<CpuUtilizationGauge> {
        self.cpu_gauge.clone()
    }

    /// Starts the four self-rescheduling gauge tasks. Calling this twice
    /// without an intervening [`Snapshotter::stop`] is a no-op.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            return;
        }
        let (tx, rx) = mpsc::channel(1);
        self.shutdown = Some(tx);
        let rx = Arc::new(Mutex::new(rx));

        self.tasks.push(spawn_memory_gauge(
            self.histories.clone(),
            self.options,
            rx.clone(),
        ));
        self.tasks.push(spawn_event_loop_gauge(
            self.histories.clone(),
            self.options,
            rx.clone(),
        ));
        self.tasks.push(spawn_cpu_gauge(
            self.histories.clone(),
            self.options,
            self.cpu_gauge.clone(),
            rx.clone(),
        ));
        self.tasks.push(spawn_client_gauge(
            self.histories.clone(),
            self.options,
            self.client_errors.clone(),
            rx,
        ));
    }

    /// Cancels all four gauge tasks.
    pub fn stop(&mut self) {
        self.shutdown.take();
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    /// `getSample(gauge, sinceMs)`: the subsequence of snapshots whose
    /// `createdAt >= now - sinceMs`.
    pub async fn get_sample(&self, gauge: Gauge, since_ms: i64) -> Vec<Snapshot> {
        let histories = self.histories.lock().await;
        histories
            .get(&gauge)
            .map(|h| h.since(since_ms))
            .unwrap_or_default()
    }
}

impl Drop for Snapshotter {
    fn drop(&mut self) {
        self.stop();
    }
}

/// cgroup v2, then v1, then host `/proc/meminfo` total — identical
/// fallback chain to the original single-gauge memory guard.
#[cfg(target_os = "linux")]
fn detect_memory_cap() -> Option<u64> {
    if let Ok(content) = std::fs::read_to_string("/sys/fs/cgroup/memory.max") {
        if let Ok(limit) = content.trim().parse::<u64>() {
            if limit != u64::MAX {
                return Some(limit);
            }
        }
    }
    if let Ok(content) = std::fs::read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes") {
        if let Ok(limit) = content.trim().parse::<u64>() {
            if limit < (1u64 << 60) {
                return Some(limit);
            }
        }
    }
    if let Ok(content) = std::fs::read_to_string("/proc/meminfo") {
        for line in content.lines() {
            if let Some(rest) = line.strip_prefix("MemTotal:") {
                if let Some(kb_str) = rest.split_whitespace().next() {
                    if let Ok(kb) = kb_str.parse::<u64>() {
                        return Some(kb * 1024);
                    }
                }
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
fn detect_memory_cap() -> Option<u64> {
    None
}

#[cfg(target_os = "linux")]
fn current_rss_bytes() -> Option<u64> {
    use procfs::process::Process;
    let proc = Process::myself().ok()?;
    let stat = proc.stat().ok()?;
    Some(stat.rss * 4096)
}

#[cfg(not(target_os = "linux"))]
fn current_rss_bytes() -> Option<u64> {
    None
}

type ShutdownRx = Arc<Mutex<mpsc::Receiver<()>>>;

fn spawn_memory_gauge(
    histories: Arc<Mutex<std::collections::HashMap<Gauge, GaugeHistory>>>,
    options: SnapshotterOptions,
    shutdown: ShutdownRx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let cap = detect_memory_cap();
        if cap.is_none() {
            warn!("memory cap undetectable; memory gauge disabled");
            return;
        }
        let cap = cap.unwrap();
        let mut interval = time::interval(options.memory_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = wait_shutdown(&shutdown) => return,
            }
            let Some(rss) = current_rss_bytes() else { continue };
            let ratio = rss as f64 / cap as f64;
            let snapshot = Snapshot {
                created_at: now_millis(),
                is_overloaded: ratio > options.max_used_memory_ratio,
                payload: ratio,
            };
            histories
                .lock()
                .await
                .get_mut(&Gauge::Memory)
                .unwrap()
                .push(snapshot, options.max_window);
        }
    })
}

fn spawn_event_loop_gauge(
    histories: Arc<Mutex<std::collections::HashMap<Gauge, GaugeHistory>>>,
    options: SnapshotterOptions,
    shutdown: ShutdownRx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut next_tick = time::Instant::now() + options.event_loop_interval;
        loop {
            tokio::select! {
                _ = time::sleep_until(next_tick) => {}
                _ = wait_shutdown(&shutdown) => return,
            }
            let now = time::Instant::now();
            let overshoot = now.saturating_duration_since(next_tick);
            next_tick = now + options.event_loop_interval;

            let snapshot = Snapshot {
                created_at: now_millis(),
                is_overloaded: overshoot.as_millis() as u64 > options.max_blocked_millis,
                payload: overshoot.as_millis() as f64,
            };
            histories
                .lock()
                .await
                .get_mut(&Gauge::EventLoopLag)
                .unwrap()
                .push(snapshot, options.max_window);
        }
    })
}

fn spawn_cpu_gauge(
    histories: Arc<Mutex<std::collections::HashMap<Gauge, GaugeHistory>>>,
    options: SnapshotterOptions,
    cpu_gauge: Arc<CpuUtilizationGauge>,
    shutdown: ShutdownRx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(options.cpu_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = wait_shutdown(&shutdown) => return,
            }
            let ratio = cpu_gauge.get();
            let snapshot = Snapshot {
                created_at: now_millis(),
                is_overloaded: ratio > options.max_used_cpu_ratio,
                payload: ratio,
            };
            histories
                .lock()
                .await
                .get_mut(&Gauge::Cpu)
                .unwrap()
                .push(snapshot, options.max_window);
        }
    })
}

fn spawn_client_gauge(
    histories: Arc<Mutex<std::collections::HashMap<Gauge, GaugeHistory>>>,
    options: SnapshotterOptions,
    counter: Arc<ClientErrorCounter>,
    shutdown: ShutdownRx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(options.client_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = wait_shutdown(&shutdown) => return,
            }
            let errors = counter.drain();
            let snapshot = Snapshot {
                created_at: now_millis(),
                is_overloaded: errors >= options.max_client_errors,
                payload: errors as f64,
            };
            debug!(errors, "client gauge tick");
            histories
                .lock()
                .await
                .get_mut(&Gauge::Client)
                .unwrap()
                .push(snapshot, options.max_window);
        }
    })
}

async fn wait_shutdown(shutdown: &ShutdownRx) {
    let mut rx = shutdown.lock().await;
    rx.recv().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_history_evicts_past_max_window_plus_slack() {
        let mut history = GaugeHistory::default();
        let old = Snapshot {
            created_at: now_millis() - 120_000,
            is_overloaded: false,
            payload: 0.0,
        };
        history.samples.push_back(old);
        history.push(
            Snapshot {
                created_at: now_millis(),
                is_overloaded: false,
                payload: 0.0,
            },
            Duration::from_secs(60),
        );
        assert_eq!(history.samples.len(), 1);
    }

    #[test]
    fn get_sample_since_filters_by_age() {
        let mut history = GaugeHistory::default();
        history.push(
            Snapshot {
                created_at: now_millis() - 10_000,
                is_overloaded: true,
                payload: 1.0,
            },
            Duration::from_secs(60),
        );
        history.push(
            Snapshot {
                created_at: now_millis(),
                is_overloaded: false,
                payload: 0.0,
            },
            Duration::from_secs(60),
        );
        let recent = history.since(1_000);
        assert_eq!(recent.len(), 1);
        assert!(!recent[0].is_overloaded);
    }

    #[test]
    fn client_error_counter_drains_to_zero() {
        let counter = ClientErrorCounter::default();
        counter.record();
        counter.record();
        assert_eq!(counter.drain(), 2);
        assert_eq!(counter.drain(), 0);
    }

    #[test]
    fn cpu_gauge_roundtrips_through_atomic_bits() {
        let gauge = CpuUtilizationGauge::default();
        gauge.set(0.42);
        assert!((gauge.get() - 0.42).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn start_is_idempotent_without_stop() {
        let mut snapshotter = Snapshotter::new(SnapshotterOptions::default());
        snapshotter.start();
        let running = snapshotter.tasks.len();
        snapshotter.start();
        assert_eq!(snapshotter.tasks.len(), running);
        snapshotter.stop();
    }
}
