// Engine counters
//
// Process-local counts of payment sessions, callbacks, sweeps and refunds.
// Cheap to clone; every clone shares the same counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use utoipa::ToSchema;

/// Sweeps slower than this are logged
const SLOW_SWEEP_THRESHOLD_MS: u64 = 2_000;

#[derive(Debug, Clone, Default)]
pub struct EngineMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    sessions_created: AtomicU64,
    callbacks_processed: AtomicU64,
    duplicate_callbacks: AtomicU64,
    late_callbacks: AtomicU64,
    integrity_rejections: AtomicU64,
    amount_mismatches: AtomicU64,
    sweep_runs: AtomicU64,
    sweeps_skipped: AtomicU64,
    total_sweep_time_us: AtomicU64,
    auto_cancelled: AtomicU64,
    auto_completed: AtomicU64,
    refunds_executed: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct MetricsSnapshot {
    pub sessions_created: u64,
    pub callbacks_processed: u64,
    pub duplicate_callbacks: u64,
    pub late_callbacks: u64,
    pub integrity_rejections: u64,
    pub amount_mismatches: u64,
    pub sweep_runs: u64,
    pub sweeps_skipped: u64,
    pub avg_sweep_time_ms: f64,
    pub auto_cancelled: u64,
    pub auto_completed: u64,
    pub refunds_executed: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_created(&self) {
        self.inner.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_processed(&self) {
        self.inner.callbacks_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate_callback(&self) {
        self.inner.duplicate_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_late_callback(&self) {
        self.inner.late_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_integrity_rejection(&self) {
        self.inner.integrity_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_amount_mismatch(&self) {
        self.inner.amount_mismatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sweep_skipped(&self) {
        self.inner.sweeps_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refund_executed(&self) {
        self.inner.refunds_executed.fetch_add(1, Ordering::Relaxed);
    }

    /// Start timing a sweep run
    pub fn start_sweep(&self) -> SweepTimer {
        SweepTimer {
            start: Instant::now(),
            metrics: self.clone(),
        }
    }

    fn record_sweep(&self, duration: Duration, cancelled: u64, completed: u64) {
        self.inner.sweep_runs.fetch_add(1, Ordering::Relaxed);
        self.inner
            .total_sweep_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.inner.auto_cancelled.fetch_add(cancelled, Ordering::Relaxed);
        self.inner.auto_completed.fetch_add(completed, Ordering::Relaxed);

        if duration.as_millis() as u64 > SLOW_SWEEP_THRESHOLD_MS {
            tracing::warn!("Slow sweep run: {}ms", duration.as_millis());
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let runs = load(&self.inner.sweep_runs);
        let total_us = load(&self.inner.total_sweep_time_us);

        MetricsSnapshot {
            sessions_created: load(&self.inner.sessions_created),
            callbacks_processed: load(&self.inner.callbacks_processed),
            duplicate_callbacks: load(&self.inner.duplicate_callbacks),
            late_callbacks: load(&self.inner.late_callbacks),
            integrity_rejections: load(&self.inner.integrity_rejections),
            amount_mismatches: load(&self.inner.amount_mismatches),
            sweep_runs: runs,
            sweeps_skipped: load(&self.inner.sweeps_skipped),
            avg_sweep_time_ms: if runs == 0 {
                0.0
            } else {
                (total_us as f64 / runs as f64) / 1000.0
            },
            auto_cancelled: load(&self.inner.auto_cancelled),
            auto_completed: load(&self.inner.auto_completed),
            refunds_executed: load(&self.inner.refunds_executed),
        }
    }
}

/// Measures one sweep; call `finish` with the number of transitions applied
pub struct SweepTimer {
    start: Instant,
    metrics: EngineMetrics,
}

impl SweepTimer {
    pub fn finish(self, cancelled: u64, completed: u64) {
        self.metrics.record_sweep(self.start.elapsed(), cancelled, completed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_counters() {
        let metrics = EngineMetrics::new();
        let clone = metrics.clone();

        metrics.record_callback_processed();
        clone.record_callback_processed();
        clone.record_duplicate_callback();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.callbacks_processed, 2);
        assert_eq!(snapshot.duplicate_callbacks, 1);
    }

    #[test]
    fn test_sweep_timer_accumulates_transitions() {
        let metrics = EngineMetrics::new();
        metrics.start_sweep().finish(2, 1);
        metrics.start_sweep().finish(0, 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sweep_runs, 2);
        assert_eq!(snapshot.auto_cancelled, 2);
        assert_eq!(snapshot.auto_completed, 4);
        assert!(snapshot.avg_sweep_time_ms >= 0.0);
    }
}
