//! Rolling per-component performance windows (spec.md §4.10: "min/avg/max
//! over a rolling window"). Grounded on `PipelineStatus`'s atomic-snapshot
//! shape, adapted from single running counters to a fixed-size sample
//! window since min/avg/max over a *window* (not all-time) requires
//! retaining recent samples rather than folding into one atomic.

use std::collections::HashMap;
use std::sync::Mutex;

use std::collections::VecDeque;

pub const WINDOW_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfSummary {
    pub min_ms: f64,
    pub avg_ms: f64,
    pub max_ms: f64,
    pub count: usize,
}

#[derive(Default)]
struct Window {
    samples: VecDeque<f64>,
}

impl Window {
    fn push(&mut self, sample_ms: f64) {
        if self.samples.len() >= WINDOW_SIZE {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
    }

    fn summary(&self) -> Option<PerfSummary> {
        if self.samples.is_empty() {
            return None;
        }
        let min_ms = self.samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let max_ms = self.samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg_ms = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        Some(PerfSummary {
            min_ms,
            avg_ms,
            max_ms,
            count: self.samples.len(),
        })
    }
}

/// Per-component rolling windows, guarded by a single mutex: sample
/// volume here is low (one push per logged duration), so contention is
/// not a concern worth a lock-free structure per component.
#[derive(Default)]
pub struct PerformanceTracker {
    windows: Mutex<HashMap<String, Window>>,
}

impl PerformanceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, component: &str, duration_ms: f64) {
        let mut windows = self.windows.lock().expect("performance tracker lock poisoned");
        windows.entry(component.to_string()).or_default().push(duration_ms);
    }

    pub fn summary(&self, component: &str) -> Option<PerfSummary> {
        let windows = self.windows.lock().expect("performance tracker lock poisoned");
        windows.get(component).and_then(Window::summary)
    }

    /// All components with at least one recorded sample, sorted by name
    /// for deterministic `debug performance show` output.
    pub fn all_summaries(&self) -> Vec<(String, PerfSummary)> {
        let windows = self.windows.lock().expect("performance tracker lock poisoned");
        let mut out: Vec<_> = windows
            .iter()
            .filter_map(|(name, window)| window.summary().map(|s| (name.clone(), s)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}
