use std::sync::atomic::{AtomicU64, Ordering};

/// Optional counters for monitoring table and queue behavior.
///
/// Every field here may be written from any thread, so each is its own
/// atomic rather than a plain `u64` snapshot struct.
#[derive(Debug, Default)]
pub struct Metrics {
    resizes_triggered: AtomicU64,
    resizes_promoted: AtomicU64,
    backpressure_sleeps: AtomicU64,
    copy_units_completed: AtomicU64,
}

impl Metrics {
    pub(crate) fn record_resize_triggered(&self) {
        self.resizes_triggered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_resize_promoted(&self) {
        self.resizes_promoted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_backpressure_sleep(&self) {
        self.backpressure_sleeps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_copy_units(&self, n: u64) {
        self.copy_units_completed.fetch_add(n, Ordering::Relaxed);
    }

    /// Takes a point-in-time, individually-atomic (not cross-field
    /// consistent) snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            resizes_triggered: self.resizes_triggered.load(Ordering::Relaxed),
            resizes_promoted: self.resizes_promoted.load(Ordering::Relaxed),
            backpressure_sleeps: self.backpressure_sleeps.load(Ordering::Relaxed),
            copy_units_completed: self.copy_units_completed.load(Ordering::Relaxed),
        }
    }
}

/// Plain-data snapshot of [`Metrics`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub resizes_triggered: u64,
    pub resizes_promoted: u64,
    pub backpressure_sleeps: u64,
    pub copy_units_completed: u64,
}
