//! WebBridge: bidirectional translator between dashboard Socket.IO-style
//! messages and the event bus (spec.md §4.8).
//!
//! Socket.IO's event-name/payload framing is modeled as a small JSON
//! envelope `{"event": ..., "data": ...}` over a plain `axum` WebSocket
//! rather than pulling in a vendor `socketio` crate — no such crate
//! appears anywhere in the retrieved example corpus. The `WebSocketUpgrade`
//! handler/loop shape is grounded on `RobertBendun-harmonia::harmonia.rs`'s
//! `link_status_websocket_handler`/`_loop`, generalized from a one-way
//! status push into this bidirectional, multi-message-type bridge.

mod outbox;
mod throttle;
mod validation;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use cantina_bus::EventBus;
use cantina_events::topics;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cantina_service::{Service, ServiceCore, ServiceError, ServiceHandle};

pub use outbox::{Kind as OutboxKind, Outbox, OutboundMessage};
pub use throttle::Throttle;
pub use validation::{validate_event, Canonical, FieldError, ValidationFailure};

const STATUS_TOPICS: &[&str] = &[
    topics::MUSIC_PLAYBACK_STARTED,
    topics::MUSIC_PLAYBACK_PAUSED,
    topics::MUSIC_PLAYBACK_RESUMED,
    topics::MUSIC_PLAYBACK_STOPPED,
    topics::VOICE_LISTENING_STARTED,
    topics::VOICE_LISTENING_STOPPED,
    topics::TRANSCRIPTION_INTERIM,
    topics::TRANSCRIPTION_FINAL,
    topics::SPEECH_SYNTHESIS_STARTED,
    topics::SPEECH_SYNTHESIS_ENDED,
    topics::VOICE_BEAT,
    topics::SYSTEM_MODE_CHANGE,
    topics::SERVICE_STATUS_UPDATE,
    topics::SERVICE_ERROR,
];

/// Maps an internal bus topic to the outbound Socket.IO event name and a
/// reshaped payload, per the translation table in spec.md §6.
///
/// No producer currently emits on `/dj/command`'s companion status topic
/// (spec.md §2 names no DJ core module), so `dj_status` has no entry here;
/// the event name is still reserved for forward compatibility.
fn translate(topic: &str, payload: &Value) -> Option<(&'static str, Value)> {
    match topic {
        t if t == topics::MUSIC_PLAYBACK_STARTED => {
            Some(("music_status", tagged("started", payload)))
        }
        t if t == topics::MUSIC_PLAYBACK_PAUSED => Some(("music_status", tagged("paused", payload))),
        t if t == topics::MUSIC_PLAYBACK_RESUMED => {
            Some(("music_status", tagged("resumed", payload)))
        }
        t if t == topics::MUSIC_PLAYBACK_STOPPED => {
            Some(("music_status", tagged("stopped", payload)))
        }
        t if t == topics::VOICE_LISTENING_STARTED => {
            Some(("voice_status", tagged("listening_started", payload)))
        }
        t if t == topics::VOICE_LISTENING_STOPPED => {
            Some(("voice_status", tagged("listening_stopped", payload)))
        }
        t if t == topics::TRANSCRIPTION_INTERIM => {
            Some(("voice_status", tagged("transcription_interim", payload)))
        }
        t if t == topics::TRANSCRIPTION_FINAL => {
            Some(("voice_status", tagged("transcription_final", payload)))
        }
        t if t == topics::SPEECH_SYNTHESIS_STARTED => {
            Some(("voice_status", tagged("synthesis_started", payload)))
        }
        t if t == topics::SPEECH_SYNTHESIS_ENDED => {
            Some(("voice_status", tagged("synthesis_ended", payload)))
        }
        t if t == topics::VOICE_BEAT => Some(("voice_status", tagged("beat", payload))),
        t if t == topics::SYSTEM_MODE_CHANGE => Some(("system_status", tagged("mode_change", payload))),
        t if t == topics::SERVICE_STATUS_UPDATE => {
            Some(("service_status", tagged("status_update", payload)))
        }
        t if t == topics::SERVICE_ERROR => Some(("service_status", tagged("error", payload))),
        _ => None,
    }
}

fn tagged(kind: &str, payload: &Value) -> Value {
    serde_json::json!({ "kind": kind, "payload": payload })
}

/// Throttle-then-fan-out a translated status event to every connected
/// client's [`Outbox`]. A free function (not a `&self` method) because the
/// subscription handler closure only holds `Arc`-cloned pieces of the
/// bridge, not `self` (spec.md §5: no handler holds a borrow across an
/// await boundary it doesn't own).
fn broadcast_to(clients: &ClientRegistry, throttle: &Throttle, event: &'static str, payload: Value) {
    if !throttle.allow(event, &payload) {
        return;
    }
    let guard = clients.read().expect("web bridge client registry poisoned");
    for outbox in guard.values() {
        outbox.push(OutboundMessage {
            event,
            payload: payload.clone(),
            kind: OutboxKind::Status,
        });
    }
}

/// Registry of connected clients, each with its own [`Outbox`].
type ClientRegistry = RwLock<HashMap<Uuid, Arc<Outbox>>>;

pub struct WebBridge {
    core: ServiceCore,
    clients: Arc<ClientRegistry>,
    throttle: Arc<Throttle>,
}

impl WebBridge {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            core: ServiceCore::new("web_bridge", bus),
            clients: Arc::new(RwLock::new(HashMap::new())),
            throttle: Arc::new(Throttle::default()),
        }
    }

    /// Builds the `axum` router exposing the `/ws` upgrade endpoint. The
    /// composition root mounts this on its HTTP server.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(self))
    }

    fn register_client(&self) -> (Uuid, Arc<Outbox>) {
        let id = Uuid::new_v4();
        let outbox = Arc::new(Outbox::new(outbox::DEFAULT_CAPACITY));
        self.clients
            .write()
            .expect("web bridge client registry poisoned")
            .insert(id, Arc::clone(&outbox));
        (id, outbox)
    }

    fn unregister_client(&self, id: Uuid) {
        self.clients
            .write()
            .expect("web bridge client registry poisoned")
            .remove(&id);
    }
}

#[async_trait]
impl Service for WebBridge {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), ServiceError> {
        for topic in STATUS_TOPICS {
            let clients = Arc::clone(&self.clients);
            let throttle = Arc::clone(&self.throttle);
            let topic_owned: &'static str = *topic;
            self.core.subscribe(topic_owned, move |payload| {
                let clients = Arc::clone(&clients);
                let throttle = Arc::clone(&throttle);
                async move {
                    if let Some((event, outbound)) = translate(topic_owned, &payload) {
                        broadcast_to(&clients, &throttle, event, outbound);
                    }
                    Ok(())
                }
            })?;
        }
        Ok(())
    }
}

async fn ws_handler(
    State(bridge): State<Arc<WebBridge>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection_loop(socket, bridge))
}

async fn connection_loop(socket: WebSocket, bridge: Arc<WebBridge>) {
    let (client_id, outbox) = bridge.register_client();
    info!(%client_id, "websocket client connected");

    let (mut sender, mut receiver) = socket.split();

    let writer = {
        let outbox = Arc::clone(&outbox);
        tokio::spawn(async move {
            loop {
                let message = outbox.recv().await;
                let envelope = serde_json::json!({
                    "event": message.event,
                    "data": message.payload,
                });
                if sender.send(Message::Text(envelope.to_string().into())).await.is_err() {
                    break;
                }
            }
        })
    };

    let reader = {
        let handle = bridge.core.handle();
        tokio::spawn(async move {
            while let Some(Ok(message)) = receiver.next().await {
                let Message::Text(text) = message else {
                    continue;
                };
                handle_inbound(&handle, &outbox, text.as_str()).await;
            }
        })
    };

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    bridge.unregister_client(client_id);
    info!(%client_id, "websocket client disconnected");
}

async fn handle_inbound(handle: &ServiceHandle, outbox: &Outbox, text: &str) {
    let parsed: Result<Value, _> = serde_json::from_str(text);
    let envelope = match parsed {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "malformed websocket envelope");
            return;
        }
    };

    let event = envelope.get("event").and_then(Value::as_str).unwrap_or("");
    let data = envelope.get("data").cloned().unwrap_or(Value::Null);

    match validate_event(event, &data) {
        Ok(Canonical { topic, payload }) => {
            handle.emit(topic, payload).await;
            ack(outbox, "command_response", serde_json::json!({"success": true, "message": "ok"}));
        }
        Err(failure) => {
            debug!(event, errors = ?failure.errors, "inbound command failed validation");
            ack(
                outbox,
                "command_error",
                serde_json::json!({
                    "error": "validation failed",
                    "error_code": failure.error_code,
                    "validation_errors": failure.errors,
                    "retry_allowed": true,
                }),
            );
        }
    }
}

fn ack(outbox: &Outbox, event: &'static str, payload: Value) {
    outbox.push(OutboundMessage {
        event,
        payload,
        kind: OutboxKind::Status,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantina_events::{
        MusicPlaybackEventPayload, ServiceErrorPayload, ServiceStatusPayload, Track, TrackProvider,
    };
    use cantina_service::start_service;

    fn sample_track() -> Track {
        Track {
            track_id: "t1".into(),
            title: "Cantina Band".into(),
            artist: "Figrin D'an".into(),
            duration_seconds: 120.0,
            provider: TrackProvider::Local,
            source_path: "cantina.mp3".into(),
        }
    }

    #[test]
    fn translate_maps_music_playback_started_to_music_status() {
        let payload = serde_json::to_value(MusicPlaybackEventPayload {
            track: sample_track(),
            start_timestamp: 0,
            duration_seconds: 120.0,
            position_seconds: None,
            conversation_id: None,
        })
        .unwrap();
        let (event, outbound) = translate(topics::MUSIC_PLAYBACK_STARTED, &payload).unwrap();
        assert_eq!(event, "music_status");
        assert_eq!(outbound["kind"], "started");
    }

    #[test]
    fn translate_ignores_unmapped_topics() {
        assert!(translate(topics::CLI_COMMAND, &serde_json::json!({})).is_none());
    }

    #[tokio::test]
    async fn service_status_update_is_broadcast_to_registered_clients() {
        let bus = Arc::new(EventBus::new());
        let bridge = Arc::new(WebBridge::new(Arc::clone(&bus)));
        start_service(bridge.as_ref()).await.unwrap();

        let (_id, outbox) = bridge.register_client();

        let payload = ServiceStatusPayload {
            service: "music_coordinator".into(),
            status: cantina_events::ServiceStatus::Running,
            message: None,
        };
        bus.emit(topics::SERVICE_STATUS_UPDATE, serde_json::to_value(payload).unwrap())
            .await
            .unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_secs(1), outbox.recv())
            .await
            .unwrap();
        assert_eq!(message.event, "service_status");
        assert_eq!(message.payload["kind"], "status_update");
    }

    #[tokio::test]
    async fn service_error_is_broadcast_as_service_status() {
        let bus = Arc::new(EventBus::new());
        let bridge = Arc::new(WebBridge::new(Arc::clone(&bus)));
        start_service(bridge.as_ref()).await.unwrap();

        let (_id, outbox) = bridge.register_client();

        let payload = ServiceErrorPayload {
            source: "tts".into(),
            message: "synthesis backend offline".into(),
            topic: None,
        };
        bus.emit(topics::SERVICE_ERROR, serde_json::to_value(payload).unwrap())
            .await
            .unwrap();

        let message = tokio::time::timeout(std::time::Duration::from_secs(1), outbox.recv())
            .await
            .unwrap();
        assert_eq!(message.event, "service_status");
        assert_eq!(message.payload["kind"], "error");
    }

    #[tokio::test]
    async fn handle_inbound_rejects_invalid_voice_command_without_touching_bus() {
        let bus = Arc::new(EventBus::new());
        let core = ServiceCore::new("test_sender", Arc::clone(&bus));
        let handle = core.handle();
        let outbox = Outbox::new(outbox::DEFAULT_CAPACITY);

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe_sync(topics::SYSTEM_SET_MODE_REQUEST, move |_| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        handle_inbound(
            &handle,
            &outbox,
            r#"{"event":"voice_command","data":{"action":"levitate"}}"#,
        )
        .await;

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 0);
        let response = outbox.recv().await;
        assert_eq!(response.event, "command_error");
    }

    #[tokio::test]
    async fn handle_inbound_accepts_valid_voice_command() {
        let bus = Arc::new(EventBus::new());
        let core = ServiceCore::new("test_sender", Arc::clone(&bus));
        let handle = core.handle();
        let outbox = Outbox::new(outbox::DEFAULT_CAPACITY);

        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe_sync(topics::SYSTEM_SET_MODE_REQUEST, move |_| {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        })
        .unwrap();

        handle_inbound(
            &handle,
            &outbox,
            r#"{"event":"voice_command","data":{"action":"start"}}"#,
        )
        .await;

        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
        let response = outbox.recv().await;
        assert_eq!(response.event, "command_response");
    }
}
