//! Bounded async log queue (spec.md §4.10): "default 10k entries, overflow
//! drops oldest with a warning counter." Same bounded-`VecDeque` +
//! `Notify` shape as WebBridge's `Outbox`, simplified since there is only
//! one drop policy here (always the oldest entry) rather than a
//! status/non-status distinction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use cantina_events::DebugLogPayload;
use tokio::sync::Notify;

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct LogQueue {
    entries: Mutex<VecDeque<DebugLogPayload>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

impl LogQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn push(&self, entry: DebugLogPayload) {
        let mut entries = self.entries.lock().expect("log queue lock poisoned");
        if entries.len() >= self.capacity {
            entries.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        entries.push_back(entry);
        drop(entries);
        self.notify.notify_one();
    }

    pub async fn recv(&self) -> DebugLogPayload {
        loop {
            {
                let mut entries = self.entries.lock().expect("log queue lock poisoned");
                if let Some(entry) = entries.pop_front() {
                    return entry;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("log queue lock poisoned").len()
    }
}
