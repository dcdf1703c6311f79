//! The event bus: hierarchical-topic pub/sub with per-handler isolation.
//!
//! See spec.md §4.1 for the full contract. Key guarantees implemented here:
//! - `subscribe_sync` returns only once the handler is visible to `emit`.
//! - `emit` awaits every handler independently, under a per-handler timeout,
//!   and never lets one handler's failure stop delivery to the others.
//! - Handler identity is a stable counter-assigned token, not closure
//!   equality, so `unsubscribe` is reliable (spec.md §9).

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use cantina_events::{require_registered, BadTopic};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::metrics::{BusMetrics, BusMetricsSnapshot};

/// Default per-handler emit timeout (spec.md §5).
pub const DEFAULT_HANDLER_TIMEOUT: Duration = Duration::from_secs(2);

/// Number of consecutive timeouts before a handler is logged as "suspect".
const SUSPECT_THRESHOLD: u32 = 3;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;
pub type Handler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

/// A stable, unique token identifying one `subscribe_sync` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// A live registration; pass to [`EventBus::unsubscribe`] to remove it.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub topic: String,
    pub id: HandlerId,
}

#[derive(Debug, thiserror::Error)]
pub enum EmitError {
    #[error(transparent)]
    BadTopic(#[from] BadTopic),
    #[error("handler {0} raised: {1}")]
    Propagated(u64, String),
}

struct Entry {
    id: HandlerId,
    handler: Handler,
}

struct TopicHandlers {
    entries: Vec<Entry>,
}

pub struct EventBus {
    handlers: RwLock<HashMap<String, TopicHandlers>>,
    next_id: AtomicU64,
    handler_timeout: Duration,
    propagate_errors: AtomicBool,
    consecutive_timeouts: RwLock<HashMap<u64, u32>>,
    metrics: BusMetrics,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HANDLER_TIMEOUT)
    }

    pub fn with_timeout(handler_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            handler_timeout,
            propagate_errors: AtomicBool::new(false),
            consecutive_timeouts: RwLock::new(HashMap::new()),
            metrics: BusMetrics::new(),
        }
    }

    /// Test-harness escape hatch: rethrow the first handler error after all
    /// handlers have been attempted (spec.md §4.1).
    pub fn set_propagate_errors(&self, enabled: bool) {
        self.propagate_errors.store(enabled, Ordering::Relaxed);
    }

    pub fn metrics(&self) -> BusMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Register `handler` on `topic`. Returns only after the handler is
    /// visible to subsequent `emit` calls (it always is: the write lock is
    /// released before this function returns).
    pub fn subscribe_sync<F, Fut>(&self, topic: &str, handler: F) -> Result<Subscription, BadTopic>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        require_registered(topic)?;
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let boxed: Handler = Arc::new(move |v| Box::pin(handler(v)));

        let mut guard = self.handlers.write().expect("bus handler registry poisoned");
        guard
            .entry(topic.to_string())
            .or_insert_with(|| TopicHandlers { entries: Vec::new() })
            .entries
            .push(Entry { id, handler: boxed });
        drop(guard);

        debug!(topic, handler_id = id.0, "subscribed");
        Ok(Subscription {
            topic: topic.to_string(),
            id,
        })
    }

    /// Remove a subscription. Idempotent: removing twice, or removing an
    /// already-expired subscription, is a no-op.
    pub fn unsubscribe(&self, sub: &Subscription) {
        let mut guard = self.handlers.write().expect("bus handler registry poisoned");
        if let Some(topic_handlers) = guard.get_mut(&sub.topic) {
            topic_handlers.entries.retain(|e| e.id != sub.id);
        }
        drop(guard);
        self.consecutive_timeouts
            .write()
            .expect("bus timeout map poisoned")
            .remove(&sub.id.0);
        debug!(topic = %sub.topic, handler_id = sub.id.0, "unsubscribed");
    }

    /// Publish `payload` (already a dict-shaped JSON value) to `topic`.
    ///
    /// Every currently-registered handler is invoked in registration order
    /// and awaited to completion (or timeout). A handler's failure never
    /// prevents delivery to the next handler.
    pub async fn emit(&self, topic: &str, payload: Value) -> Result<(), EmitError> {
        if require_registered(topic).is_err() {
            self.metrics.record_bad_topic();
            warn!(topic, "emit to unknown topic rejected");
            return Err(BadTopic(topic.to_string()).into());
        }
        self.metrics.record_emit();

        let snapshot: Vec<Entry> = {
            let guard = self.handlers.read().expect("bus handler registry poisoned");
            match guard.get(topic) {
                Some(topic_handlers) => topic_handlers
                    .entries
                    .iter()
                    .map(|e| Entry {
                        id: e.id,
                        handler: Arc::clone(&e.handler),
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut first_error: Option<(u64, String)> = None;

        for entry in snapshot {
            self.metrics.record_invocation();
            let fut = (entry.handler)(payload.clone());
            let guarded = AssertUnwindSafe(fut).catch_unwind();

            match tokio::time::timeout(self.handler_timeout, guarded).await {
                Ok(Ok(Ok(()))) => {
                    self.reset_timeout_count(entry.id.0);
                }
                Ok(Ok(Err(msg))) => {
                    self.metrics.record_error();
                    self.reset_timeout_count(entry.id.0);
                    error!(topic, handler_id = entry.id.0, error = %msg, "handler failed");
                    if first_error.is_none() {
                        first_error = Some((entry.id.0, msg));
                    }
                    self.report_service_error(topic, &msg).await;
                }
                Ok(Err(panic)) => {
                    self.metrics.record_error();
                    self.reset_timeout_count(entry.id.0);
                    let msg = panic_message(&panic);
                    error!(topic, handler_id = entry.id.0, error = %msg, "handler panicked");
                    if first_error.is_none() {
                        first_error = Some((entry.id.0, msg.clone()));
                    }
                    self.report_service_error(topic, &msg).await;
                }
                Err(_elapsed) => {
                    self.metrics.record_timeout();
                    let consecutive = self.bump_timeout_count(entry.id.0);
                    warn!(
                        topic,
                        handler_id = entry.id.0,
                        timeout_ms = self.handler_timeout.as_millis() as u64,
                        consecutive,
                        "handler timed out"
                    );
                    if consecutive >= SUSPECT_THRESHOLD {
                        warn!(
                            topic,
                            handler_id = entry.id.0,
                            "handler marked suspect after repeated timeouts"
                        );
                    }
                }
            }
        }

        if self.propagate_errors.load(Ordering::Relaxed) {
            if let Some((id, msg)) = first_error {
                return Err(EmitError::Propagated(id, msg));
            }
        }

        Ok(())
    }

    async fn report_service_error(&self, topic: &str, message: &str) {
        if topic == cantina_events::topics::SERVICE_ERROR {
            // Avoid unbounded recursion if the SERVICE_ERROR pipeline itself fails.
            return;
        }
        let payload = serde_json::json!({
            "source": "event_bus",
            "message": message,
            "topic": topic,
        });
        // Best-effort: a failure emitting SERVICE_ERROR is only logged.
        if let Err(err) = Box::pin(self.emit(cantina_events::topics::SERVICE_ERROR, payload)).await
        {
            error!(error = %err, "failed to emit SERVICE_ERROR");
        }
    }

    fn bump_timeout_count(&self, id: u64) -> u32 {
        let mut guard = self
            .consecutive_timeouts
            .write()
            .expect("bus timeout map poisoned");
        let counter = guard.entry(id).or_insert(0);
        *counter += 1;
        *counter
    }

    fn reset_timeout_count(&self, id: u64) {
        self.consecutive_timeouts
            .write()
            .expect("bus timeout map poisoned")
            .remove(&id);
    }

    /// Number of handlers currently registered on `topic`. Test/debug only.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.handlers
            .read()
            .expect("bus handler registry poisoned")
            .get(topic)
            .map(|t| t.entries.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with non-string payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantina_events::topics;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn subscribe_then_emit_delivers_to_handler() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);

        bus.subscribe_sync(topics::CLI_COMMAND, move |_v| {
            let count = Arc::clone(&count2);
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        bus.emit(topics::CLI_COMMAND, serde_json::json!({"command": "engage"}))
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_then_subscribe_delivers_exactly_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        let sub1 = bus
            .subscribe_sync(topics::CLI_COMMAND, move |_v| {
                let c = Arc::clone(&c1);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        bus.unsubscribe(&sub1);
        bus.unsubscribe(&sub1); // idempotent

        let c2 = Arc::clone(&count);
        bus.subscribe_sync(topics::CLI_COMMAND, move |_v| {
            let c = Arc::clone(&c2);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        bus.emit(topics::CLI_COMMAND, serde_json::json!({})).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn emit_to_unknown_topic_is_rejected() {
        let bus = EventBus::new();
        let err = bus.emit("/not/a/topic", serde_json::json!({})).await;
        assert!(err.is_err());
        assert_eq!(bus.metrics().bad_topic_emits, 1);
    }

    #[tokio::test]
    async fn one_failing_handler_does_not_block_others() {
        let bus = EventBus::new();
        let ran = Arc::new(AtomicUsize::new(0));

        bus.subscribe_sync(topics::CLI_COMMAND, |_v| async move {
            Err("boom".to_string())
        })
        .unwrap();

        let ran2 = Arc::clone(&ran);
        bus.subscribe_sync(topics::CLI_COMMAND, move |_v| {
            let ran = Arc::clone(&ran2);
            async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        bus.emit(topics::CLI_COMMAND, serde_json::json!({})).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(bus.metrics().handler_errors, 1);
    }

    #[tokio::test]
    async fn propagate_errors_flag_surfaces_first_failure() {
        let bus = EventBus::new();
        bus.set_propagate_errors(true);
        bus.subscribe_sync(topics::CLI_COMMAND, |_v| async move {
            Err("boom".to_string())
        })
        .unwrap();

        let result = bus.emit(topics::CLI_COMMAND, serde_json::json!({})).await;
        assert!(matches!(result, Err(EmitError::Propagated(_, _))));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_times_out_without_blocking_the_caller() {
        let bus = EventBus::with_timeout(StdDuration::from_millis(50));
        bus.subscribe_sync(topics::CLI_COMMAND, |_v| async move {
            tokio::time::sleep(StdDuration::from_secs(10)).await;
            Ok(())
        })
        .unwrap();

        bus.emit(topics::CLI_COMMAND, serde_json::json!({})).await.unwrap();
        assert_eq!(bus.metrics().handler_timeouts, 1);
    }

    #[tokio::test]
    async fn double_unsubscribe_is_a_no_op() {
        let bus = EventBus::new();
        let sub = bus
            .subscribe_sync(topics::CLI_COMMAND, |_v| async move { Ok(()) })
            .unwrap();
        bus.unsubscribe(&sub);
        bus.unsubscribe(&sub);
        assert_eq!(bus.subscriber_count(topics::CLI_COMMAND), 0);
    }
}
