//! MemoryStore: shared working memory with waitable predicates (spec.md §3,
//! §4.10 data model / §9 "single-writer actor").
//!
//! Slots (`mode`, `music_playing`, `current_track`, `last_intent`,
//! `chat_history`) live behind an `RwLock<HashMap<_>>` so readers never
//! block each other; writes are short critical sections followed by a
//! `MEMORY_UPDATED` emit and a `Notify` wakeup for `wait_for` callers,
//! grounded on the event-driven debounce wait in this workspace's tools
//! router (`notify.notified()` racing a timer rather than polling).
//!
//! `mode`/`music_playing`/`current_track` are kept current automatically
//! from bus events (`SYSTEM_MODE_CHANGE`, music lifecycle); `last_intent`
//! and `chat_history` are written directly by BrainService through `set`/
//! `append_chat` on a cloned [`Memory`] handle rather than another
//! subscription round-trip.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use cantina_bus::EventBus;
use cantina_events::{topics, MemoryUpdatedPayload, MusicPlaybackEventPayload, SystemModeChangePayload};
use cantina_service::{Service, ServiceCore, ServiceError, ServiceHandle};
use serde_json::Value;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Default bound on `chat_history` (spec.md §3).
pub const DEFAULT_CHAT_HISTORY_CAPACITY: usize = 10;

/// The shared, `Clone`-able memory surface. Cheap to hold in any number of
/// services; all mutation funnels through `&self` methods that take their
/// own short-lived locks.
#[derive(Clone)]
pub struct Memory {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    handle: ServiceHandle,
    slots: RwLock<HashMap<String, Value>>,
    chat_history: RwLock<VecDeque<String>>,
    chat_capacity: usize,
    notify: Notify,
}

impl Memory {
    fn new(handle: ServiceHandle, chat_capacity: usize) -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                handle,
                slots: RwLock::new(HashMap::new()),
                chat_history: RwLock::new(VecDeque::new()),
                chat_capacity,
                notify: Notify::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner
            .slots
            .read()
            .expect("memory slots lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.inner
            .slots
            .read()
            .expect("memory slots lock poisoned")
            .clone()
    }

    /// Set `key` to `value`, emitting `MEMORY_UPDATED` and waking any
    /// `wait_for` callers whose predicate may now hold.
    pub async fn set(&self, key: impl Into<String>, value: Value) {
        let key = key.into();
        {
            let mut slots = self.inner.slots.write().expect("memory slots lock poisoned");
            slots.insert(key.clone(), value.clone());
        }
        self.inner.notify.notify_waiters();
        let payload = MemoryUpdatedPayload { key, value };
        let json = serde_json::to_value(payload).expect("memory payload always serializes");
        self.inner.handle.emit(topics::MEMORY_UPDATED, json).await;
    }

    /// Append a line to the bounded `chat_history` ring, dropping the
    /// oldest entry once `chat_capacity` is exceeded.
    pub async fn append_chat(&self, line: impl Into<String>) {
        let history_value = {
            let mut history = self
                .inner
                .chat_history
                .write()
                .expect("chat history lock poisoned");
            history.push_back(line.into());
            while history.len() > self.inner.chat_capacity {
                history.pop_front();
            }
            serde_json::to_value(history.iter().cloned().collect::<Vec<_>>())
                .expect("chat history always serializes")
        };
        {
            let mut slots = self.inner.slots.write().expect("memory slots lock poisoned");
            slots.insert("chat_history".to_string(), history_value.clone());
        }
        self.inner.notify.notify_waiters();
        let payload = MemoryUpdatedPayload {
            key: "chat_history".to_string(),
            value: history_value,
        };
        let json = serde_json::to_value(payload).expect("memory payload always serializes");
        self.inner.handle.emit(topics::MEMORY_UPDATED, json).await;
    }

    /// Wait until `predicate(snapshot)` holds or `timeout` elapses. Returns
    /// `true` if the predicate was observed true, `false` on timeout.
    pub async fn wait_for<F>(&self, mut predicate: F, timeout: Duration) -> bool
    where
        F: FnMut(&HashMap<String, Value>) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if predicate(&self.snapshot()) {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            // Re-check right after waking: the notified slot may not be the
            // one the predicate cares about.
            if tokio::time::timeout(remaining, self.inner.notify.notified())
                .await
                .is_err()
            {
                return false;
            }
        }
    }
}

pub struct MemoryStore {
    core: ServiceCore,
    memory: Memory,
}

impl MemoryStore {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self::with_chat_capacity(bus, DEFAULT_CHAT_HISTORY_CAPACITY)
    }

    pub fn with_chat_capacity(bus: Arc<EventBus>, chat_capacity: usize) -> Self {
        let core = ServiceCore::new("memory_store", bus);
        let memory = Memory::new(core.handle(), chat_capacity);
        Self { core, memory }
    }

    /// A cloneable handle other services (BrainService) hold directly.
    pub fn memory(&self) -> Memory {
        self.memory.clone()
    }
}

#[async_trait]
impl Service for MemoryStore {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), ServiceError> {
        let memory = self.memory.clone();
        self.core.subscribe(topics::SYSTEM_MODE_CHANGE, move |payload| {
            let memory = memory.clone();
            async move {
                let change: SystemModeChangePayload =
                    serde_json::from_value(payload).map_err(|e| e.to_string())?;
                memory
                    .set("mode", Value::String(change.to.to_string()))
                    .await;
                Ok(())
            }
        })?;

        let memory = self.memory.clone();
        self.core.subscribe(topics::MUSIC_PLAYBACK_STARTED, move |payload| {
            let memory = memory.clone();
            async move {
                let event: MusicPlaybackEventPayload =
                    serde_json::from_value(payload).map_err(|e| e.to_string())?;
                memory.set("music_playing", Value::Bool(true)).await;
                let track = serde_json::to_value(&event.track).map_err(|e| e.to_string())?;
                memory.set("current_track", track).await;
                Ok(())
            }
        })?;

        let memory = self.memory.clone();
        self.core.subscribe(topics::MUSIC_PLAYBACK_STOPPED, move |_payload| {
            let memory = memory.clone();
            async move {
                memory.set("music_playing", Value::Bool(false)).await;
                memory.set("current_track", Value::Null).await;
                Ok(())
            }
        })?;

        // `last_intent` and `chat_history` are written directly by
        // BrainService via the cloned `Memory` handle (spec.md §3: "mutated
        // ... by explicit set/append_chat calls from the Brain"), not
        // auto-derived here.

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantina_events::MusicPlaybackEventPayload;
    use cantina_events::{Track, TrackProvider};
    use cantina_service::start_service;
    use std::time::Duration;

    fn sample_track() -> Track {
        Track {
            track_id: "t1".into(),
            title: "Cantina Band".into(),
            artist: "Figrin D'an".into(),
            duration_seconds: 180.0,
            provider: TrackProvider::Local,
            source_path: "/music/cantina.mp3".into(),
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let bus = Arc::new(EventBus::new());
        let store = MemoryStore::new(bus);
        let memory = store.memory();
        memory.set("foo", Value::String("bar".into())).await;
        assert_eq!(memory.get("foo"), Some(Value::String("bar".into())));
    }

    #[tokio::test]
    async fn chat_history_is_bounded() {
        let bus = Arc::new(EventBus::new());
        let store = MemoryStore::with_chat_capacity(bus, 3);
        let memory = store.memory();
        for i in 0..5 {
            memory.append_chat(format!("line {i}")).await;
        }
        let history = memory.get("chat_history").unwrap();
        let entries = history.as_array().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0], Value::String("line 2".into()));
    }

    #[tokio::test]
    async fn wait_for_returns_true_once_predicate_holds() {
        let bus = Arc::new(EventBus::new());
        let store = MemoryStore::new(bus);
        let memory = store.memory();

        let waiter = {
            let memory = memory.clone();
            tokio::spawn(async move {
                memory
                    .wait_for(
                        |slots| slots.get("ready") == Some(&Value::Bool(true)),
                        Duration::from_secs(1),
                    )
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        memory.set("ready", Value::Bool(true)).await;
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_for_times_out_when_predicate_never_holds() {
        let bus = Arc::new(EventBus::new());
        let store = MemoryStore::new(bus);
        let memory = store.memory();
        let ok = memory
            .wait_for(|slots| slots.contains_key("never"), Duration::from_millis(20))
            .await;
        assert!(!ok);
    }

    #[tokio::test]
    async fn music_playback_started_updates_slots() {
        let bus = Arc::new(EventBus::new());
        let store = MemoryStore::new(Arc::clone(&bus));
        start_service(&store).await.unwrap();

        let payload = MusicPlaybackEventPayload {
            track: sample_track(),
            start_timestamp: 0,
            duration_seconds: 180.0,
            position_seconds: None,
            conversation_id: None,
        };
        bus.emit(
            topics::MUSIC_PLAYBACK_STARTED,
            serde_json::to_value(payload).unwrap(),
        )
        .await
        .unwrap();

        let memory = store.memory();
        assert_eq!(memory.get("music_playing"), Some(Value::Bool(true)));
        assert!(memory.get("current_track").is_some());
    }
}
