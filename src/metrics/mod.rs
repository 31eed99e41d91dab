//! Node metrics: exchanges, cache requests and data routing.
//!
//! # Example
//!
//! ```rust
//! use cachegroup::metrics::GridMetrics;
//! use std::time::Duration;
//!
//! let metrics = GridMetrics::new();
//! metrics.record_exchange_applied(5, Duration::from_millis(12));
//! assert_eq!(metrics.snapshot().exchanges_applied, 1);
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::Counter;
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot, EXCHANGE_DURATION_BUCKETS};

use crate::types::TopologyVersion;
use std::time::Duration;

#[derive(Debug)]
pub struct GridMetrics {
    pub exchanges_started: Counter,
    pub exchanges_applied: Counter,
    pub exchanges_superseded: Counter,
    pub exchanges_failed: Counter,
    pub exchange_duration: Histogram,
    /// Last applied topology version.
    pub topology_version: Gauge,
    /// Cache start/stop requests processed by exchanges.
    pub cache_requests: Counter,
    pub cache_conflicts: Counter,
    /// Data operations routed by this node.
    pub data_requests: Counter,
    /// Routing attempts repeated after a retryable error.
    pub data_retries: Counter,
    /// Backup updates that did not reach a backup owner.
    pub backup_failures: Counter,
    pub partitions_preloaded: Counter,
}

impl GridMetrics {
    pub fn new() -> Self {
        Self {
            exchanges_started: Counter::new("exchanges_started_total", "Exchanges begun"),
            exchanges_applied: Counter::new("exchanges_applied_total", "Exchanges applied"),
            exchanges_superseded: Counter::new(
                "exchanges_superseded_total",
                "Exchanges overtaken by a newer version",
            ),
            exchanges_failed: Counter::new("exchanges_failed_total", "Exchanges that failed"),
            exchange_duration: Histogram::with_buckets(
                "exchange_duration_seconds",
                "Time from exchange start to completion",
                EXCHANGE_DURATION_BUCKETS.to_vec(),
            ),
            topology_version: Gauge::new("topology_version", "Last applied topology version"),
            cache_requests: Counter::new("cache_requests_total", "Cache start and stop requests"),
            cache_conflicts: Counter::new(
                "cache_conflicts_total",
                "Cache starts rejected by group validation",
            ),
            data_requests: Counter::new("data_requests_total", "Routed data operations"),
            data_retries: Counter::new("data_retries_total", "Retried data operation attempts"),
            backup_failures: Counter::new(
                "backup_failures_total",
                "Backup updates not applied on a backup owner",
            ),
            partitions_preloaded: Counter::new(
                "partitions_preloaded_total",
                "Partitions scheduled for preloading",
            ),
        }
    }

    pub fn record_exchange_applied(&self, version: TopologyVersion, duration: Duration) {
        self.exchanges_applied.inc();
        self.exchange_duration.observe_duration(duration);
        self.topology_version.set(version as i64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            exchanges_started: self.exchanges_started.get(),
            exchanges_applied: self.exchanges_applied.get(),
            exchanges_superseded: self.exchanges_superseded.get(),
            exchanges_failed: self.exchanges_failed.get(),
            topology_version: self.topology_version.get(),
            cache_requests: self.cache_requests.get(),
            cache_conflicts: self.cache_conflicts.get(),
            data_requests: self.data_requests.get(),
            data_retries: self.data_retries.get(),
            backup_failures: self.backup_failures.get(),
            partitions_preloaded: self.partitions_preloaded.get(),
            exchange_duration: self.exchange_duration.snapshot(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();

        for counter in [
            &self.exchanges_started,
            &self.exchanges_applied,
            &self.exchanges_superseded,
            &self.exchanges_failed,
            &self.cache_requests,
            &self.cache_conflicts,
            &self.data_requests,
            &self.data_retries,
            &self.backup_failures,
            &self.partitions_preloaded,
        ] {
            output.push_str(&format!(
                "# HELP {name} {}\n# TYPE {name} counter\n{name} {}\n",
                counter.help(),
                counter.get(),
                name = counter.name(),
            ));
        }

        output.push_str(&format!(
            "# HELP {name} {}\n# TYPE {name} gauge\n{name} {}\n",
            self.topology_version.help(),
            self.topology_version.get(),
            name = self.topology_version.name(),
        ));

        let durations = self.exchange_duration.snapshot();
        output.push_str(&format!(
            "# HELP {name} {}\n# TYPE {name} histogram\n{name}_sum {}\n{name}_count {}\n",
            self.exchange_duration.help(),
            durations.sum,
            durations.count,
            name = self.exchange_duration.name(),
        ));

        output
    }
}

impl Default for GridMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    pub exchanges_started: u64,
    pub exchanges_applied: u64,
    pub exchanges_superseded: u64,
    pub exchanges_failed: u64,
    pub topology_version: i64,
    pub cache_requests: u64,
    pub cache_conflicts: u64,
    pub data_requests: u64,
    pub data_retries: u64,
    pub backup_failures: u64,
    pub partitions_preloaded: u64,
    pub exchange_duration: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Average exchange duration in milliseconds.
    pub fn avg_exchange_ms(&self) -> f64 {
        self.exchange_duration.mean() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_prometheus() {
        let metrics = GridMetrics::new();
        metrics.exchanges_started.inc();
        metrics.exchanges_started.inc();
        metrics.exchanges_superseded.inc();
        metrics.record_exchange_applied(9, Duration::from_millis(20));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.exchanges_started, 2);
        assert_eq!(snapshot.exchanges_superseded, 1);
        assert_eq!(snapshot.topology_version, 9);
        assert!((snapshot.avg_exchange_ms() - 20.0).abs() < 0.01);

        let text = metrics.to_prometheus();
        assert!(text.contains("exchanges_started_total 2"));
        assert!(text.contains("topology_version 9"));
        assert!(text.contains("exchange_duration_seconds_count 1"));
    }
}
