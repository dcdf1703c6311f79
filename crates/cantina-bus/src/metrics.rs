//! Lock-free rolling counters for the bus, read by `DebugService`.
//!
//! Mirrors the atomic-snapshot shape used for real-time pipeline metrics
//! elsewhere in this codebase's lineage: plain `Atomic*` fields updated from
//! the hot emit path, with a `snapshot()` for reporting.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BusMetrics {
    emits: AtomicU64,
    handler_invocations: AtomicU64,
    handler_errors: AtomicU64,
    handler_timeouts: AtomicU64,
    bad_topic_emits: AtomicU64,
}

impl BusMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_emit(&self) {
        self.emits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invocation(&self) {
        self.handler_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.handler_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.handler_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_bad_topic(&self) {
        self.bad_topic_emits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> BusMetricsSnapshot {
        BusMetricsSnapshot {
            emits: self.emits.load(Ordering::Relaxed),
            handler_invocations: self.handler_invocations.load(Ordering::Relaxed),
            handler_errors: self.handler_errors.load(Ordering::Relaxed),
            handler_timeouts: self.handler_timeouts.load(Ordering::Relaxed),
            bad_topic_emits: self.bad_topic_emits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusMetricsSnapshot {
    pub emits: u64,
    pub handler_invocations: u64,
    pub handler_errors: u64,
    pub handler_timeouts: u64,
    pub bad_topic_emits: u64,
}
