//! BrainService: the planner half of the planner/executor pair (spec.md
//! §4.5). Consumes `INTENT_DETECTED` and music lifecycle events, forwards
//! intents as domain commands, and — once the resulting track starts
//! playing — asks a [`DialogCollaborator`] for a short introduction line
//! and hands it to TimelineExecutor as a one-step foreground [`Plan`].
//!
//! The LLM collaborator itself is an external contract (spec.md §1 "Out of
//! scope"); [`DialogCollaborator`] is the seam, mirroring how this
//! workspace's tool executor takes a generic `Tool` trait rather than
//! hardcoding a model backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use cantina_bus::EventBus;
use cantina_events::{
    topics, IntentDetectedPayload, Layer, MusicCommandPayload, MusicPlaybackEventPayload, Plan,
    PlanReadyPayload, PlanStep, Track,
};
use cantina_memory::Memory;
use cantina_service::{Service, ServiceCore, ServiceError, ServiceHandle};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("dialog collaborator failed: {0}")]
    Failed(String),
}

/// The LLM collaborator's narrow contract for this service: given the track
/// that just started and the utterance that triggered it, produce a short
/// spoken introduction with no further tool use.
#[async_trait]
pub trait DialogCollaborator: Send + Sync {
    async fn introduce_track(
        &self,
        track: &Track,
        utterance: &str,
    ) -> Result<String, CollaboratorError>;
}

struct PendingIntent {
    utterance: String,
}

pub struct BrainService {
    core: ServiceCore,
    memory: Memory,
    collaborator: Arc<dyn DialogCollaborator>,
    pending: Arc<Mutex<HashMap<String, PendingIntent>>>,
}

impl BrainService {
    pub fn new(bus: Arc<EventBus>, memory: Memory, collaborator: Arc<dyn DialogCollaborator>) -> Self {
        Self {
            core: ServiceCore::new("brain", bus),
            memory,
            collaborator,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn handle_intent_detected(
        handle: ServiceHandle,
        memory: Memory,
        pending: Arc<Mutex<HashMap<String, PendingIntent>>>,
        payload: serde_json::Value,
    ) -> Result<(), String> {
        let intent: IntentDetectedPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;

        let intent_value = serde_json::to_value(&intent).map_err(|e| e.to_string())?;
        memory.set("last_intent", intent_value).await;
        memory.append_chat(intent.utterance.clone()).await;

        if intent.intent_name == "play_music" {
            let track_query = intent
                .parameters
                .get("track")
                .and_then(|v| v.as_str())
                .map(str::to_string);

            pending.lock().expect("pending intents lock poisoned").insert(
                intent.conversation_id.clone(),
                PendingIntent {
                    utterance: intent.utterance.clone(),
                },
            );

            let command = MusicCommandPayload {
                action: "play".to_string(),
                track_query,
                conversation_id: Some(intent.conversation_id),
            };
            let value = serde_json::to_value(command).map_err(|e| e.to_string())?;
            handle.emit(topics::MUSIC_COMMAND, value).await;
        }
        Ok(())
    }

    async fn handle_music_playback_started(
        handle: ServiceHandle,
        collaborator: Arc<dyn DialogCollaborator>,
        pending: Arc<Mutex<HashMap<String, PendingIntent>>>,
        payload: serde_json::Value,
    ) -> Result<(), String> {
        let event: MusicPlaybackEventPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;

        let Some(conversation_id) = event.conversation_id.clone() else {
            return Ok(());
        };
        let utterance = {
            let mut pending = pending.lock().expect("pending intents lock poisoned");
            match pending.remove(&conversation_id) {
                Some(p) => p.utterance,
                None => return Ok(()),
            }
        };

        match collaborator.introduce_track(&event.track, &utterance).await {
            Ok(intro) => {
                let mut plan = Plan::new(Layer::Foreground, vec![PlanStep::speak(Uuid::new_v4().to_string(), intro)]);
                plan.conversation_id = Some(conversation_id);
                let value = serde_json::to_value(PlanReadyPayload { plan }).map_err(|e| e.to_string())?;
                handle.emit(topics::PLAN_READY, value).await;
            }
            Err(err) => {
                warn!(%err, "dialog collaborator failed to produce track introduction");
                handle.emit_error(err.to_string()).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Service for BrainService {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), ServiceError> {
        let handle = self.core.handle();
        let memory = self.memory.clone();
        let pending = Arc::clone(&self.pending);
        self.core.subscribe(topics::INTENT_DETECTED, move |payload| {
            let handle = handle.clone();
            let memory = memory.clone();
            let pending = Arc::clone(&pending);
            async move { Self::handle_intent_detected(handle, memory, pending, payload).await }
        })?;

        let handle = self.core.handle();
        let collaborator = Arc::clone(&self.collaborator);
        let pending = Arc::clone(&self.pending);
        self.core
            .subscribe(topics::MUSIC_PLAYBACK_STARTED, move |payload| {
                let handle = handle.clone();
                let collaborator = Arc::clone(&collaborator);
                let pending = Arc::clone(&pending);
                async move {
                    Self::handle_music_playback_started(handle, collaborator, pending, payload).await
                }
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantina_events::{TrackProvider};
    use cantina_memory::MemoryStore;
    use cantina_service::start_service;

    struct StubCollaborator {
        reply: String,
    }

    #[async_trait]
    impl DialogCollaborator for StubCollaborator {
        async fn introduce_track(&self, _track: &Track, _utterance: &str) -> Result<String, CollaboratorError> {
            Ok(self.reply.clone())
        }
    }

    struct FailingCollaborator;

    #[async_trait]
    impl DialogCollaborator for FailingCollaborator {
        async fn introduce_track(&self, _track: &Track, _utterance: &str) -> Result<String, CollaboratorError> {
            Err(CollaboratorError::Failed("collaborator offline".into()))
        }
    }

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
    async fn play_music_intent_forwards_music_command() {
        let bus = Arc::new(EventBus::new());
        let memory_store = MemoryStore::new(Arc::clone(&bus));
        let brain = BrainService::new(
            Arc::clone(&bus),
            memory_store.memory(),
            Arc::new(StubCollaborator { reply: "Enjoy!".into() }),
        );
        start_service(&brain).await.unwrap();

        let received: Arc<Mutex<Option<MusicCommandPayload>>> = Arc::new(Mutex::new(None));
        let received2 = Arc::clone(&received);
        bus.subscribe_sync(topics::MUSIC_COMMAND, move |v| {
            let received = Arc::clone(&received2);
            async move {
                *received.lock().unwrap() = Some(serde_json::from_value(v).unwrap());
                Ok(())
            }
        })
        .unwrap();

        let intent = IntentDetectedPayload {
            conversation_id: "c1".into(),
            intent_name: "play_music".into(),
            parameters: serde_json::json!({"track": "funky"}),
            utterance: "play something funky".into(),
        };
        bus.emit(topics::INTENT_DETECTED, serde_json::to_value(intent).unwrap())
            .await
            .unwrap();

        let command = received.lock().unwrap().clone().unwrap();
        assert_eq!(command.action, "play");
        assert_eq!(command.track_query.as_deref(), Some("funky"));

        let memory = memory_store.memory();
        assert!(memory.get("last_intent").is_some());
        let history = memory.get("chat_history").unwrap();
        assert_eq!(
            history.as_array().unwrap().last().unwrap(),
            "play something funky"
        );
    }

    #[tokio::test]
    async fn playback_started_for_tracked_intent_emits_plan_ready() {
        let bus = Arc::new(EventBus::new());
        let memory_store = MemoryStore::new(Arc::clone(&bus));
        let brain = BrainService::new(
            Arc::clone(&bus),
            memory_store.memory(),
            Arc::new(StubCollaborator {
                reply: "Here's some Cantina Band!".into(),
            }),
        );
        start_service(&brain).await.unwrap();

        let intent = IntentDetectedPayload {
            conversation_id: "c1".into(),
            intent_name: "play_music".into(),
            parameters: serde_json::json!({"track": "cantina"}),
            utterance: "play cantina band".into(),
        };
        bus.emit(topics::INTENT_DETECTED, serde_json::to_value(intent).unwrap())
            .await
            .unwrap();

        let plan_ready: Arc<Mutex<Option<PlanReadyPayload>>> = Arc::new(Mutex::new(None));
        let plan_ready2 = Arc::clone(&plan_ready);
        bus.subscribe_sync(topics::PLAN_READY, move |v| {
            let plan_ready = Arc::clone(&plan_ready2);
            async move {
                *plan_ready.lock().unwrap() = Some(serde_json::from_value(v).unwrap());
                Ok(())
            }
        })
        .unwrap();

        let started = MusicPlaybackEventPayload {
            track: sample_track(),
            start_timestamp: 0,
            duration_seconds: 180.0,
            position_seconds: None,
            conversation_id: Some("c1".into()),
        };
        bus.emit(
            topics::MUSIC_PLAYBACK_STARTED,
            serde_json::to_value(started).unwrap(),
        )
        .await
        .unwrap();

        let plan = plan_ready.lock().unwrap().clone().unwrap().plan;
        assert_eq!(plan.layer, Layer::Foreground);
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].text.as_deref(), Some("Here's some Cantina Band!"));
    }

    #[tokio::test]
    async fn unrelated_playback_start_is_ignored() {
        let bus = Arc::new(EventBus::new());
        let memory_store = MemoryStore::new(Arc::clone(&bus));
        let brain = BrainService::new(
            Arc::clone(&bus),
            memory_store.memory(),
            Arc::new(StubCollaborator { reply: "hi".into() }),
        );
        start_service(&brain).await.unwrap();

        let plan_count = Arc::new(Mutex::new(0usize));
        let plan_count2 = Arc::clone(&plan_count);
        bus.subscribe_sync(topics::PLAN_READY, move |_v| {
            let plan_count = Arc::clone(&plan_count2);
            async move {
                *plan_count.lock().unwrap() += 1;
                Ok(())
            }
        })
        .unwrap();

        let started = MusicPlaybackEventPayload {
            track: sample_track(),
            start_timestamp: 0,
            duration_seconds: 180.0,
            position_seconds: None,
            conversation_id: Some("no-such-conversation".into()),
        };
        bus.emit(
            topics::MUSIC_PLAYBACK_STARTED,
            serde_json::to_value(started).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(*plan_count.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn collaborator_failure_emits_service_error_not_plan() {
        let bus = Arc::new(EventBus::new());
        let memory_store = MemoryStore::new(Arc::clone(&bus));
        let brain = BrainService::new(Arc::clone(&bus), memory_store.memory(), Arc::new(FailingCollaborator));
        start_service(&brain).await.unwrap();

        let intent = IntentDetectedPayload {
            conversation_id: "c2".into(),
            intent_name: "play_music".into(),
            parameters: serde_json::json!({"track": "funky"}),
            utterance: "play something funky".into(),
        };
        bus.emit(topics::INTENT_DETECTED, serde_json::to_value(intent).unwrap())
            .await
            .unwrap();

        let errors = Arc::new(Mutex::new(0usize));
        let errors2 = Arc::clone(&errors);
        bus.subscribe_sync(topics::SERVICE_ERROR, move |_v| {
            let errors = Arc::clone(&errors2);
            async move {
                *errors.lock().unwrap() += 1;
                Ok(())
            }
        })
        .unwrap();

        let started = MusicPlaybackEventPayload {
            track: sample_track(),
            start_timestamp: 0,
            duration_seconds: 180.0,
            position_seconds: None,
            conversation_id: Some("c2".into()),
        };
        bus.emit(
            topics::MUSIC_PLAYBACK_STARTED,
            serde_json::to_value(started).unwrap(),
        )
        .await
        .unwrap();

        assert_eq!(*errors.lock().unwrap(), 1);
    }
}
