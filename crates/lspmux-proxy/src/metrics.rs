//! In-process metrics for the connection registry.
//!
//! A gauge of open connections, a cumulative connection counter, and
//! per-mode histograms observed when a connection is removed: how many
//! calls it served, how many failed, and how long it stayed alive.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::stats::StatsSnapshot;

/// Bucket boundaries for calls-per-connection histograms.
const METHOD_CALL_BUCKETS: [f64; 9] = [1.0, 2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0];

/// Bucket boundaries for connection-lifetime histograms, in seconds.
/// 300 is the default idle threshold.
const ALIVE_SECONDS_BUCKETS: [f64; 6] = [1.0, 10.0, 300.0, 600.0, 900.0, 1200.0];

#[derive(Debug)]
struct Histogram {
    buckets: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    total: u64,
}

impl Histogram {
    fn new(buckets: &[f64]) -> Self {
        Self {
            buckets: buckets.to_vec(),
            counts: vec![0; buckets.len() + 1],
            sum: 0.0,
            total: 0,
        }
    }

    fn observe(&mut self, value: f64) {
        let idx = self
            .buckets
            .iter()
            .position(|&upper| value <= upper)
            .unwrap_or(self.buckets.len());
        self.counts[idx] += 1;
        self.sum += value;
        self.total += 1;
    }

    fn snapshot(&self) -> HistogramSnapshot {
        HistogramSnapshot {
            buckets: self.buckets.clone(),
            counts: self.counts.clone(),
            sum: self.sum,
            total: self.total,
        }
    }
}

/// Serializable view of one histogram. `counts` has one extra slot for
/// observations above the last bucket boundary.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramSnapshot {
    pub buckets: Vec<f64>,
    pub counts: Vec<u64>,
    pub sum: f64,
    pub total: u64,
}

/// Registry-wide metrics. Counter updates are atomic; histograms take a
/// short mutex only when a connection is removed.
#[derive(Debug)]
pub struct ProxyMetrics {
    open_connections: AtomicI64,
    connections_total: AtomicU64,
    method_calls: Mutex<HashMap<String, Histogram>>,
    failed_method_calls: Mutex<HashMap<String, Histogram>>,
    alive_seconds: Mutex<HashMap<String, Histogram>>,
}

impl ProxyMetrics {
    pub(crate) fn new() -> Self {
        Self {
            open_connections: AtomicI64::new(0),
            connections_total: AtomicU64::new(0),
            method_calls: Mutex::new(HashMap::new()),
            failed_method_calls: Mutex::new(HashMap::new()),
            alive_seconds: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_removed(&self, mode: &str, stats: &StatsSnapshot) {
        self.open_connections.fetch_sub(1, Ordering::Relaxed);
        observe(&self.method_calls, mode, &METHOD_CALL_BUCKETS, stats.total_count as f64);
        observe(
            &self.failed_method_calls,
            mode,
            &METHOD_CALL_BUCKETS,
            stats.total_error_count as f64,
        );
        observe(&self.alive_seconds, mode, &ALIVE_SECONDS_BUCKETS, stats.alive_seconds);
    }

    /// Open connections (initialized + uninitialized).
    pub fn open_connections(&self) -> i64 {
        self.open_connections.load(Ordering::Relaxed)
    }

    /// Cumulative connections since process start (open + since closed).
    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            open_connections: self.open_connections(),
            connections_total: self.connections_total(),
            method_calls: snapshot_map(&self.method_calls),
            failed_method_calls: snapshot_map(&self.failed_method_calls),
            alive_seconds: snapshot_map(&self.alive_seconds),
        }
    }
}

fn observe(map: &Mutex<HashMap<String, Histogram>>, mode: &str, buckets: &[f64], value: f64) {
    map.lock()
        .entry(mode.to_string())
        .or_insert_with(|| Histogram::new(buckets))
        .observe(value);
}

fn snapshot_map(map: &Mutex<HashMap<String, Histogram>>) -> HashMap<String, HistogramSnapshot> {
    map.lock().iter().map(|(k, v)| (k.clone(), v.snapshot())).collect()
}

/// Serializable view of all registry metrics, keyed by mode.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub open_connections: i64,
    pub connections_total: u64,
    pub method_calls: HashMap<String, HistogramSnapshot>,
    pub failed_method_calls: HashMap<String, HistogramSnapshot>,
    pub alive_seconds: HashMap<String, HistogramSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_buckets_by_upper_bound() {
        let mut h = Histogram::new(&METHOD_CALL_BUCKETS);
        h.observe(1.0);
        h.observe(3.0);
        h.observe(1000.0);

        assert_eq!(h.counts[0], 1); // <= 1
        assert_eq!(h.counts[2], 1); // <= 4
        assert_eq!(h.counts[METHOD_CALL_BUCKETS.len()], 1); // overflow slot
        assert_eq!(h.total, 3);
        assert_eq!(h.sum, 1004.0);
    }

    #[test]
    fn gauge_and_counter_track_lifecycle() {
        let metrics = ProxyMetrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.open_connections(), 2);
        assert_eq!(metrics.connections_total(), 2);

        let stats = crate::stats::ConnStats::new().snapshot();
        metrics.connection_removed("go", &stats);
        assert_eq!(metrics.open_connections(), 1);
        // Cumulative never decreases
        assert_eq!(metrics.connections_total(), 2);

        let snap = metrics.snapshot();
        assert!(snap.alive_seconds.contains_key("go"));
        assert_eq!(snap.method_calls["go"].total, 1);
    }
}
