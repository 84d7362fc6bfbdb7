//! Per-connection statistics.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;

/// Counters for one proxied backend connection, guarded by a lock scoped
/// to that connection alone.
#[derive(Debug, Clone)]
pub struct ConnStats {
    /// When the connection was registered.
    pub created: Instant,
    /// max(last request sent, last response received); the sole input to
    /// idle eviction.
    pub last: Instant,
    /// Total number of calls proxied to the backend.
    pub total_count: u64,
    /// Calls proxied to the backend, per method.
    pub counts: HashMap<String, u64>,
    /// Total number of proxied calls that failed.
    pub total_error_count: u64,
    /// Proxied calls that failed, per method.
    pub error_counts: HashMap<String, u64>,
}

impl ConnStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            created: now,
            last: now,
            total_count: 0,
            counts: HashMap::new(),
            total_error_count: 0,
            error_counts: HashMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last = Instant::now();
    }

    pub fn inc_method(&mut self, method: &str) {
        self.total_count += 1;
        *self.counts.entry(method.to_string()).or_default() += 1;
    }

    pub fn inc_method_error(&mut self, method: &str) {
        self.total_error_count += 1;
        *self.error_counts.entry(method.to_string()).or_default() += 1;
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            alive_seconds: self.last.duration_since(self.created).as_secs_f64(),
            idle_seconds: self.last.elapsed().as_secs_f64(),
            total_count: self.total_count,
            counts: self.counts.clone(),
            total_error_count: self.total_error_count,
            error_counts: self.error_counts.clone(),
        }
    }
}

impl Default for ConnStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of [`ConnStats`], serializable for the removal log
/// line and for metrics observation.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    /// Seconds between creation and the last recorded activity.
    pub alive_seconds: f64,
    /// Seconds since the last recorded activity.
    pub idle_seconds: f64,
    pub total_count: u64,
    pub counts: HashMap<String, u64>,
    pub total_error_count: u64,
    pub error_counts: HashMap<String, u64>,
}
