//! Per-rule usage metrics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Append-only counters for one rule name.
///
/// Updated with relaxed atomics; readers may observe a sample's counters
/// mid-update, which only skews a snapshot by one request.
#[derive(Debug, Default)]
pub struct MetricsRecorder {
    total_requests: AtomicU64,
    blocked_requests: AtomicU64,
    cumulative_wait_micros: AtomicU64,
    sample_count: AtomicU64,
}

/// A point-in-time view of a rule's metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub sample_count: u64,
    /// Share of requests denied, in `[0, 1]`
    pub block_rate: f64,
    /// Mean time spent deciding, in milliseconds
    pub average_wait_time_ms: f64,
}

impl MetricsRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one decision and how long it took.
    pub fn record(&self, allowed: bool, cost: Duration) {
        let micros = u64::try_from(cost.as_micros()).unwrap_or(u64::MAX);

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !allowed {
            self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        }
        self.cumulative_wait_micros.fetch_add(micros, Ordering::Relaxed);
        self.sample_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot the counters, or `None` if nothing was recorded yet.
    pub fn snapshot(&self) -> Option<MetricsSnapshot> {
        let sample_count = self.sample_count.load(Ordering::Relaxed);
        if sample_count == 0 {
            return None;
        }

        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let blocked_requests = self.blocked_requests.load(Ordering::Relaxed);
        let wait_micros = self.cumulative_wait_micros.load(Ordering::Relaxed);

        let block_rate = if total_requests == 0 {
            0.0
        } else {
            blocked_requests as f64 / total_requests as f64
        };

        Some(MetricsSnapshot {
            total_requests,
            blocked_requests,
            sample_count,
            block_rate,
            average_wait_time_ms: wait_micros as f64 / 1000.0 / sample_count as f64,
        })
    }
}
