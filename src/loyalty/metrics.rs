// Loyalty ledger metrics
//
// Counts ledger mutations, expiry work and aggregate-cache efficiency,
// and flags slow postings and sweeps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use utoipa::ToSchema;

/// Performance threshold for slow operations (100ms)
const SLOW_OPERATION_THRESHOLD_MS: u64 = 100;

/// Shared counters; clones point at the same atomics
#[derive(Debug, Clone)]
pub struct LoyaltyMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,

    credits: AtomicU64,
    debits: AtomicU64,
    clamped_debits: AtomicU64,
    points_credited: AtomicU64,
    points_debited: AtomicU64,

    expiry_sweeps: AtomicU64,
    expired_points: AtomicU64,

    // Timing metrics (in microseconds)
    postings: AtomicU64,
    total_posting_time_us: AtomicU64,
    slow_postings: AtomicU64,
    total_sweep_time_us: AtomicU64,
    slow_sweeps: AtomicU64,
}

impl LoyaltyMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn record_cache_hit(&self) {
        self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_miss(&self) {
        self.inner.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get cache hit rate (0.0 to 1.0)
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.inner.cache_hits.load(Ordering::Relaxed);
        let misses = self.inner.cache_misses.load(Ordering::Relaxed);
        let total = hits + misses;

        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn record_credit(&self, points: i64) {
        self.inner.credits.fetch_add(1, Ordering::Relaxed);
        self.inner
            .points_credited
            .fetch_add(points.unsigned_abs(), Ordering::Relaxed);
    }

    /// `requested` is what the caller asked for, `applied` what the clamp allowed
    pub fn record_debit(&self, requested: i64, applied: i64) {
        if applied > 0 {
            self.inner.debits.fetch_add(1, Ordering::Relaxed);
            self.inner
                .points_debited
                .fetch_add(applied.unsigned_abs(), Ordering::Relaxed);
        }
        if applied < requested {
            self.inner.clamped_debits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_expired(&self, points: i64) {
        self.inner
            .expired_points
            .fetch_add(points.unsigned_abs(), Ordering::Relaxed);
    }

    pub fn start_posting(&self) -> OperationTimer {
        OperationTimer::new(OperationType::Posting, self.clone())
    }

    pub fn start_expiry_sweep(&self) -> OperationTimer {
        OperationTimer::new(OperationType::ExpirySweep, self.clone())
    }

    fn record_posting(&self, duration: Duration) {
        self.inner.postings.fetch_add(1, Ordering::Relaxed);
        self.inner
            .total_posting_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        if duration.as_millis() as u64 > SLOW_OPERATION_THRESHOLD_MS {
            self.inner.slow_postings.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Slow ledger posting: {}ms", duration.as_millis());
        }
    }

    fn record_expiry_sweep(&self, duration: Duration) {
        self.inner.expiry_sweeps.fetch_add(1, Ordering::Relaxed);
        self.inner
            .total_sweep_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        if duration.as_millis() as u64 > SLOW_OPERATION_THRESHOLD_MS {
            self.inner.slow_sweeps.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("Slow expiry sweep: {}ms", duration.as_millis());
        }
    }

    /// Get average posting time in milliseconds
    pub fn avg_posting_time_ms(&self) -> f64 {
        let count = self.inner.postings.load(Ordering::Relaxed);
        let total_us = self.inner.total_posting_time_us.load(Ordering::Relaxed);

        if count == 0 {
            0.0
        } else {
            (total_us as f64 / count as f64) / 1000.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSummary {
            cache_hit_rate: self.cache_hit_rate(),
            cache_hits: load(&self.inner.cache_hits),
            cache_misses: load(&self.inner.cache_misses),
            credits: load(&self.inner.credits),
            debits: load(&self.inner.debits),
            clamped_debits: load(&self.inner.clamped_debits),
            points_credited: load(&self.inner.points_credited),
            points_debited: load(&self.inner.points_debited),
            postings: load(&self.inner.postings),
            avg_posting_time_ms: self.avg_posting_time_ms(),
            slow_postings: load(&self.inner.slow_postings),
            expiry_sweeps: load(&self.inner.expiry_sweeps),
            expired_points: load(&self.inner.expired_points),
            slow_sweeps: load(&self.inner.slow_sweeps),
        }
    }

    pub fn log_summary(&self) {
        let summary = self.summary();
        tracing::info!(
            "Loyalty ledger metrics:\n\
             Cache: {:.1}% hit rate ({} hits, {} misses)\n\
             Postings: {} ({} credits, {} debits, {} clamped), avg {:.2}ms, {} slow\n\
             Expiry: {} sweeps, {} points expired, {} slow",
            summary.cache_hit_rate * 100.0,
            summary.cache_hits,
            summary.cache_misses,
            summary.postings,
            summary.credits,
            summary.debits,
            summary.clamped_debits,
            summary.avg_posting_time_ms,
            summary.slow_postings,
            summary.expiry_sweeps,
            summary.expired_points,
            summary.slow_sweeps,
        );
    }
}

impl Default for LoyaltyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum OperationType {
    Posting,
    ExpirySweep,
}

/// Records the elapsed time when dropped
pub struct OperationTimer {
    start: Instant,
    operation_type: OperationType,
    metrics: LoyaltyMetrics,
}

impl OperationTimer {
    fn new(operation_type: OperationType, metrics: LoyaltyMetrics) -> Self {
        Self {
            start: Instant::now(),
            operation_type,
            metrics,
        }
    }

    /// Stop the timer now instead of at end of scope
    pub fn complete(self) {}
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();

        match self.operation_type {
            OperationType::Posting => self.metrics.record_posting(duration),
            OperationType::ExpirySweep => self.metrics.record_expiry_sweep(duration),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct MetricsSummary {
    pub cache_hit_rate: f64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub credits: u64,
    pub debits: u64,
    pub clamped_debits: u64,
    pub points_credited: u64,
    pub points_debited: u64,
    pub postings: u64,
    pub avg_posting_time_ms: f64,
    pub slow_postings: u64,
    pub expiry_sweeps: u64,
    pub expired_points: u64,
    pub slow_sweeps: u64,
}
