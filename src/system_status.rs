//! SystemStatus (§4.B): folds recent [`crate::snapshotter::Snapshot`]s into
//! `isSystemIdle` booleans over two windows, `current` (short, default 5s)
//! and `historical` (long, default 60s).

use crate::snapshotter::{Gauge, Snapshotter};

/// Per-gauge overloaded ratio plus the overall idle verdict for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub is_system_idle: bool,
    pub memory_ratio: f64,
    pub event_loop_ratio: f64,
    pub cpu_ratio: f64,
    pub client_ratio: f64,
}

/// Thresholds each gauge's overloaded-sample ratio is compared against.
/// `ratio == threshold` is idle; `ratio > threshold` is overloaded.
#[derive(Debug, Clone, Copy)]
pub struct SystemStatusOptions {
    pub current_window_millis: i64,
    pub historical_window_millis: i64,
    pub max_memory_overloaded_ratio: f64,
    pub max_event_loop_overloaded_ratio: f64,
    pub max_cpu_overloaded_ratio: f64,
    pub max_client_overloaded_ratio: f64,
}

impl Default for SystemStatusOptions {
    fn default() -> Self {
        SystemStatusOptions {
            current_window_millis: 5_000,
            historical_window_millis: 60_000,
            max_memory_overloaded_ratio: 0.7,
            max_event_loop_overloaded_ratio: 0.7,
            max_cpu_overloaded_ratio: 0.7,
            max_client_overloaded_ratio: 0.7,
        }
    }
}

pub struct SystemStatus<'a> {
    snapshotter: &'a Snapshotter,
    options: SystemStatusOptions,
}

/// `ratio = |overloaded samples| / |samples in window|`; zero samples is
/// treated as idle (ratio 0.0).
fn overloaded_ratio(samples: &[crate::snapshotter::Snapshot]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let overloaded = samples.iter().filter(|s| s.is_overloaded).count();
    overloaded as f64 / samples.len() as f64
}

impl<'a> SystemStatus<'a> {
    pub fn new(snapshotter: &'a Snapshotter, options: SystemStatusOptions) -> Self {
        SystemStatus {
            snapshotter,
            options,
        }
    }

    pub async fn get_current_status(&self) -> StatusReport {
        self.report(self.options.current_window_millis).await
    }

    pub async fn get_historical_status(&self) -> StatusReport {
        self.report(self.options.historical_window_millis).await
    }

    async fn report(&self, window_millis: i64) -> StatusReport {
        let memory_ratio =
            overloaded_ratio(&self.snapshotter.get_sample(Gauge::Memory, window_millis).await);
        let event_loop_ratio = overloaded_ratio(
            &self
                .snapshotter
                .get_sample(Gauge::EventLoopLag, window_millis)
                .await,
        );
        let cpu_ratio =
            overloaded_ratio(&self.snapshotter.get_sample(Gauge::Cpu, window_millis).await);
        let client_ratio =
            overloaded_ratio(&self.snapshotter.get_sample(Gauge::Client, window_millis).await);

        // Strict `>`: a ratio exactly at threshold is idle. Any single
        // gauge overloaded marks the whole system overloaded.
        let is_system_idle = memory_ratio <= self.options.max_memory_overloaded_ratio
            && event_loop_ratio <= self.options.max_event_loop_overloaded_ratio
            && cpu_ratio <= self.options.max_cpu_overloaded_ratio
            && client_ratio <= self.options.max_client_overloaded_ratio;

        StatusReport {
            is_system_idle,
            memory_ratio,
            event_loop_ratio,
            cpu_ratio,
            client_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshotter::Snapshot;

    fn snapshots(overloaded: usize, total: usize) -> Vec<Snapshot> {
        (0..total)
            .map(|i| Snapshot {
                created_at: 0,
                is_overloaded: i < overloaded,
                payload: 0.0,
            })
            .collect()
    }

    #[test]
    fn zero_samples_is_idle() {
        assert_eq!(overloaded_ratio(&[]), 0.0);
    }

    /// S7 — SystemStatus threshold: 100 snapshots, 50 overloaded, ratio 0.5.
    #[test]
    fn s7_ratio_at_threshold_is_idle() {
        let samples = snapshots(50, 100);
        let ratio = overloaded_ratio(&samples);
        assert_eq!(ratio, 0.5);
        assert!(ratio <= 0.5);
    }

    #[test]
    fn s7_ratio_above_threshold_is_overloaded() {
        let samples = snapshots(50, 100);
        let ratio = overloaded_ratio(&samples);
        assert!(ratio > 0.49);
    }

    #[tokio::test]
    async fn idle_when_no_snapshotter_history() {
        let snapshotter = Snapshotter::new(crate::snapshotter::SnapshotterOptions::default());
        let status = SystemStatus::new(&snapshotter, SystemStatusOptions::default());
        let report = status.get_current_status().await;
        assert!(report.is_system_idle);
    }
}
