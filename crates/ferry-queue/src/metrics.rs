//! Queue metrics.
//!
//! Process-wide metrics go through the `metrics` facade (enabled by the
//! `metrics` feature, no recorder installed by this crate). Per-destination
//! counters are also kept in [`DestinationStats`] so they can be inspected
//! without a recorder.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

// ============================================================================
// Facade Metrics
// ============================================================================

/// Destination consumption metrics
pub struct QueueMetrics;

impl QueueMetrics {
    // ---- Counters ----

    pub fn increment_deliveries(destination: &str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("ferry_queue_deliveries_total", "destination" => destination.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = destination;
    }

    pub fn increment_commits(destination: &str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("ferry_queue_commits_total", "destination" => destination.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = destination;
    }

    pub fn increment_failures(destination: &str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("ferry_queue_failures_total", "destination" => destination.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = destination;
    }

    pub fn increment_redeliveries(destination: &str) {
        #[cfg(feature = "metrics")]
        metrics::counter!(
            "ferry_queue_redeliveries_total",
            "destination" => destination.to_string()
        )
        .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = destination;
    }

    pub fn increment_dropped(destination: &str) {
        #[cfg(feature = "metrics")]
        metrics::counter!("ferry_queue_dropped_total", "destination" => destination.to_string())
            .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = destination;
    }

    pub fn increment_contended(destination: &str) {
        #[cfg(feature = "metrics")]
        metrics::counter!(
            "ferry_queue_claims_contended_total",
            "destination" => destination.to_string()
        )
        .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = destination;
    }

    pub fn increment_worker_restarts(destination: &str) {
        #[cfg(feature = "metrics")]
        metrics::counter!(
            "ferry_queue_worker_restarts_total",
            "destination" => destination.to_string()
        )
        .increment(1);
        #[cfg(not(feature = "metrics"))]
        let _ = destination;
    }

    pub fn increment_migrated_entries(count: u64) {
        #[cfg(feature = "metrics")]
        metrics::counter!("ferry_queue_migrated_entries_total").increment(count);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    // ---- Gauges ----

    pub fn set_active_destinations(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("ferry_queue_active_destinations").set(count as f64);
        #[cfg(not(feature = "metrics"))]
        let _ = count;
    }

    // ---- Histograms ----

    pub fn record_callback_latency(destination: &str, duration: Duration) {
        #[cfg(feature = "metrics")]
        metrics::histogram!(
            "ferry_queue_callback_latency_seconds",
            "destination" => destination.to_string()
        )
        .record(duration.as_secs_f64());
        #[cfg(not(feature = "metrics"))]
        let _ = (destination, duration);
    }
}

// ============================================================================
// Per-destination counters
// ============================================================================

/// Counters for one destination
#[derive(Debug, Default)]
pub struct DestinationStats {
    delivered: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    redelivered: AtomicU64,
    dropped: AtomicU64,
    contended: AtomicU64,
    expired: AtomicU64,
    worker_restarts: AtomicU64,
}

impl DestinationStats {
    pub(crate) fn record_delivery(&self, destination: &str, latency: Duration) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::increment_deliveries(destination);
        QueueMetrics::record_callback_latency(destination, latency);
    }

    pub(crate) fn record_commit(&self, destination: &str) {
        self.committed.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::increment_commits(destination);
    }

    pub(crate) fn record_failure(&self, destination: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::increment_failures(destination);
    }

    pub(crate) fn record_redelivery(&self, destination: &str) {
        self.redelivered.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::increment_redeliveries(destination);
    }

    pub(crate) fn record_drop(&self, destination: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::increment_dropped(destination);
    }

    pub(crate) fn record_contended(&self, destination: &str) {
        self.contended.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::increment_contended(destination);
    }

    pub(crate) fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_worker_restart(&self, destination: &str) {
        self.worker_restarts.fetch_add(1, Ordering::Relaxed);
        QueueMetrics::increment_worker_restarts(destination);
    }

    pub fn snapshot(&self) -> DestinationStatsSnapshot {
        DestinationStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            contended: self.contended.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            worker_restarts: self.worker_restarts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`DestinationStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationStatsSnapshot {
    /// Callback invocations
    pub delivered: u64,
    pub committed: u64,
    /// Attempts that ended with `commit == false`
    pub failed: u64,
    pub redelivered: u64,
    pub dropped: u64,
    /// Claims skipped because the record was not open
    pub contended: u64,
    pub expired: u64,
    pub worker_restarts: u64,
}
