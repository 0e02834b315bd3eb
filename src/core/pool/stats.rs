//! Backend utilization counters
//!
//! Lock-free counters updated on every synthesis completion. Values only grow
//! until [`UtilizationStats::reset`] is called explicitly.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::engine::BackendKind;

#[derive(Debug, Default)]
struct KindCounters {
    requests: AtomicU64,
    failures: AtomicU64,
    retries_to_baseline: AtomicU64,
    processing_us: AtomicU64,
    active: AtomicU64,
    peak_active: AtomicU64,
}

impl KindCounters {
    fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.retries_to_baseline.store(0, Ordering::Relaxed);
        self.processing_us.store(0, Ordering::Relaxed);
        self.peak_active
            .store(self.active.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

/// Utilization counters for the backend pool
#[derive(Debug)]
pub struct UtilizationStats {
    kinds: [KindCounters; 3],
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
    since: Mutex<Instant>,
}

impl Default for UtilizationStats {
    fn default() -> Self {
        Self::new()
    }
}

impl UtilizationStats {
    pub fn new() -> Self {
        Self {
            kinds: Default::default(),
            in_flight: AtomicU64::new(0),
            peak_in_flight: AtomicU64::new(0),
            since: Mutex::new(Instant::now()),
        }
    }

    /// Mark a synthesis call as executing on `kind` until the guard drops
    pub fn begin(self: &Arc<Self>, kind: BackendKind) -> ActiveGuard {
        let counters = &self.kinds[kind.slot()];
        let active = counters.active.fetch_add(1, Ordering::AcqRel) + 1;
        counters.peak_active.fetch_max(active, Ordering::AcqRel);

        let in_flight = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(in_flight, Ordering::AcqRel);

        ActiveGuard {
            stats: Arc::clone(self),
            kind,
        }
    }

    /// Record a completed call, attributing its time to the backend that ran it
    pub fn record(&self, kind: BackendKind, elapsed: Duration, success: bool) {
        let counters = &self.kinds[kind.slot()];
        counters.requests.fetch_add(1, Ordering::Relaxed);
        counters
            .processing_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if !success {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a transient failure on `from` that was retried on the baseline
    pub fn record_retry(&self, from: BackendKind) {
        self.kinds[from.slot()]
            .retries_to_baseline
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Calls currently executing across all backends
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn peak_in_flight(&self) -> u64 {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    /// Clear counters; peaks restart from the current activity
    pub fn reset(&self) {
        for counters in &self.kinds {
            counters.reset();
        }
        self.peak_in_flight
            .store(self.in_flight.load(Ordering::Relaxed), Ordering::Relaxed);
        *self.since.lock() = Instant::now();
    }

    pub fn snapshot(&self) -> UtilizationSnapshot {
        let backends = BackendKind::ALL
            .into_iter()
            .map(|kind| {
                let c = &self.kinds[kind.slot()];
                let requests = c.requests.load(Ordering::Relaxed);
                let processing_us = c.processing_us.load(Ordering::Relaxed);
                BackendUtilization {
                    kind,
                    requests,
                    failures: c.failures.load(Ordering::Relaxed),
                    retries_to_baseline: c.retries_to_baseline.load(Ordering::Relaxed),
                    processing_ms: processing_us as f64 / 1000.0,
                    avg_processing_ms: if requests > 0 {
                        processing_us as f64 / requests as f64 / 1000.0
                    } else {
                        0.0
                    },
                    active: c.active.load(Ordering::Relaxed),
                    peak_active: c.peak_active.load(Ordering::Relaxed),
                }
            })
            .collect();

        UtilizationSnapshot {
            backends,
            in_flight: self.in_flight(),
            peak_in_flight: self.peak_in_flight(),
            window_secs: self.since.lock().elapsed().as_secs(),
        }
    }
}

/// Decrements the active counters when a synthesis call finishes
#[derive(Debug)]
pub struct ActiveGuard {
    stats: Arc<UtilizationStats>,
    kind: BackendKind,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.stats.kinds[self.kind.slot()]
            .active
            .fetch_sub(1, Ordering::AcqRel);
        self.stats.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackendUtilization {
    pub kind: BackendKind,
    pub requests: u64,
    pub failures: u64,
    pub retries_to_baseline: u64,
    pub processing_ms: f64,
    pub avg_processing_ms: f64,
    pub active: u64,
    pub peak_active: u64,
}

/// Point-in-time copy of [`UtilizationStats`]
#[derive(Debug, Clone, Serialize)]
pub struct UtilizationSnapshot {
    pub backends: Vec<BackendUtilization>,
    pub in_flight: u64,
    pub peak_in_flight: u64,
    /// Seconds since the counters were created or last reset
    pub window_secs: u64,
}

impl UtilizationSnapshot {
    pub fn backend(&self, kind: BackendKind) -> Option<&BackendUtilization> {
        self.backends.iter().find(|b| b.kind == kind)
    }

    pub fn total_requests(&self) -> u64 {
        self.backends.iter().map(|b| b.requests).sum()
    }
}
