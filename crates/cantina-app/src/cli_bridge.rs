//! Translates the CLI-surface verbs (`engage`/`disengage`/
//! `ambient`/`reset`/`status`, `list|play|stop music`, `eye ...`) into the
//! typed payloads their owning services actually expect.
//!
//! `CommandDispatcher` forwards a generic [`StandardCommandPayload`] to
//! whichever topic a verb is registered against; `ModeManager` and
//! `MusicCoordinator` each expect their own narrow payload on their own
//! topic ([`SystemSetModeRequestPayload`] on `SYSTEM_SET_MODE_REQUEST`,
//! [`MusicCommandPayload`] on `MUSIC_COMMAND`). This service is the
//! adapter between the two, the same role `cantina-web`'s `validation.rs`
//! plays for WebSocket commands, applied to CLI tokens instead.

use std::sync::Arc;

use async_trait::async_trait;
use cantina_bus::EventBus;
use cantina_events::{
    topics, CliResponsePayload, MusicCommandPayload, StandardCommandPayload, SystemMode,
    SystemSetModeRequestPayload,
};
use cantina_mode::ModeManager;
use cantina_service::{Service, ServiceCore, ServiceError, ServiceHandle};
use serde_json::Value;

pub struct CliBridge {
    core: ServiceCore,
    mode: Arc<ModeManager>,
}

impl CliBridge {
    pub fn new(bus: Arc<EventBus>, mode: Arc<ModeManager>) -> Self {
        Self {
            core: ServiceCore::new("cli_bridge", bus),
            mode,
        }
    }

    async fn ack(handle: &ServiceHandle, message: impl Into<String>, is_error: bool) {
        let payload = CliResponsePayload {
            message: message.into(),
            is_error,
        };
        handle
            .emit(
                topics::CLI_RESPONSE,
                serde_json::to_value(payload).expect("cli response payload always serializes"),
            )
            .await;
    }

    async fn handle_mode(handle: ServiceHandle, mode: Arc<ModeManager>, payload: Value) -> Result<(), String> {
        let command: StandardCommandPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        match command.command.as_str() {
            "status" => {
                let current = mode.current_mode().await;
                Self::ack(&handle, format!("mode: {current}"), false).await;
            }
            "engage" => {
                Self::request_mode(&handle, SystemMode::Interactive).await;
                Self::ack(&handle, "Interactive mode engaged.", false).await;
            }
            "disengage" => {
                Self::request_mode(&handle, SystemMode::Idle).await;
                Self::ack(&handle, "Disengaging.", false).await;
            }
            "ambient" => {
                Self::request_mode(&handle, SystemMode::Ambient).await;
                Self::ack(&handle, "Entering ambient mode.", false).await;
            }
            "reset" => {
                Self::request_mode(&handle, SystemMode::Idle).await;
                Self::ack(&handle, "Resetting to idle.", false).await;
            }
            other => Self::ack(&handle, format!("unknown mode command: {other}"), true).await,
        }
        Ok(())
    }

    async fn request_mode(handle: &ServiceHandle, mode: SystemMode) {
        let payload = SystemSetModeRequestPayload { mode };
        handle
            .emit(
                topics::SYSTEM_SET_MODE_REQUEST,
                serde_json::to_value(payload).expect("set mode request payload always serializes"),
            )
            .await;
    }

    async fn handle_music(handle: ServiceHandle, payload: Value) -> Result<(), String> {
        let command: StandardCommandPayload = serde_json::from_value(payload).map_err(|e| e.to_string())?;
        let action = match command.command.as_str() {
            "list" => "list",
            "play" => "play",
            "stop" => "stop",
            other => {
                Self::ack(&handle, format!("unknown music command: {other}"), true).await;
                return Ok(());
            }
        };

        if action == "play" && command.args.is_empty() {
            Self::ack(&handle, "usage: play music <n|name>", true).await;
            return Ok(());
        }

        let track_query = (action == "play").then(|| command.args.join(" "));
        let music_payload = MusicCommandPayload {
            action: action.to_string(),
            track_query,
            conversation_id: None,
        };
        handle
            .emit(
                topics::MUSIC_COMMAND,
                serde_json::to_value(music_payload).expect("music command payload always serializes"),
            )
            .await;
        Ok(())
    }

    async fn handle_eye(handle: ServiceHandle, _payload: Value) -> Result<(), String> {
        Self::ack(&handle, "LED hardware not available in this build.", true).await;
        Ok(())
    }
}

#[async_trait]
impl Service for CliBridge {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), ServiceError> {
        let handle = self.core.handle();
        let mode = Arc::clone(&self.mode);
        self.core.subscribe(topics::CLI_BRIDGE_MODE, move |payload| {
            let handle = handle.clone();
            let mode = Arc::clone(&mode);
            async move { Self::handle_mode(handle, mode, payload).await }
        })?;

        let handle = self.core.handle();
        self.core.subscribe(topics::CLI_BRIDGE_MUSIC, move |payload| {
            let handle = handle.clone();
            async move { Self::handle_music(handle, payload).await }
        })?;

        let handle = self.core.handle();
        self.core.subscribe(topics::CLI_BRIDGE_EYE, move |payload| {
            let handle = handle.clone();
            async move { Self::handle_eye(handle, payload).await }
        })?;

        Ok(())
    }
}

/// Registers the CLI verbs this bridge translates. Called once at startup
/// after `CommandDispatcher` and `CliBridge` both exist.
pub fn register_verbs(dispatcher: &cantina_dispatcher::CommandDispatcher) -> Result<(), cantina_dispatcher::DispatcherError> {
    for verb in ["engage", "disengage", "ambient", "reset", "status"] {
        dispatcher.register(verb, None::<String>, topics::CLI_BRIDGE_MODE)?;
    }
    for verb in ["list", "play", "stop"] {
        dispatcher.register(verb, Some("music"), topics::CLI_BRIDGE_MUSIC)?;
    }
    for verb in ["pattern", "test", "status"] {
        dispatcher.register("eye", Some(verb), topics::CLI_BRIDGE_EYE)?;
    }
    dispatcher.register("debug", Some("level"), topics::DEBUG_COMMAND)?;
    dispatcher.register("debug", Some("trace"), topics::DEBUG_COMMAND)?;
    dispatcher.register("debug", Some("performance"), topics::DEBUG_COMMAND)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantina_events::{CliCommandPayload, SystemModeChangePayload};
    use cantina_service::start_service;
    use std::sync::Mutex;

    async fn emit_cli(bus: &EventBus, command: &str, args: &[&str]) {
        let payload = CliCommandPayload {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            raw_input: std::iter::once(command).chain(args.iter().copied()).collect::<Vec<_>>().join(" "),
        };
        bus.emit(topics::CLI_COMMAND, serde_json::to_value(payload).unwrap())
            .await
            .unwrap();
    }

    async fn wire(bus: &Arc<EventBus>) -> (Arc<ModeManager>, Arc<CliBridge>, Arc<cantina_dispatcher::CommandDispatcher>) {
        let mode = Arc::new(ModeManager::new(Arc::clone(bus)));
        let bridge = Arc::new(CliBridge::new(Arc::clone(bus), Arc::clone(&mode)));
        let dispatcher = Arc::new(cantina_dispatcher::CommandDispatcher::new(Arc::clone(bus)));
        register_verbs(&dispatcher).unwrap();
        start_service(mode.as_ref()).await.unwrap();
        start_service(bridge.as_ref()).await.unwrap();
        start_service(dispatcher.as_ref()).await.unwrap();
        (mode, bridge, dispatcher)
    }

    #[tokio::test]
    async fn engage_transitions_mode_to_interactive() {
        let bus = Arc::new(EventBus::new());
        let (mode, _bridge, _dispatcher) = wire(&bus).await;

        let changes: Arc<Mutex<Vec<SystemModeChangePayload>>> = Arc::new(Mutex::new(Vec::new()));
        let c = Arc::clone(&changes);
        bus.subscribe_sync(topics::SYSTEM_MODE_CHANGE, move |payload| {
            let c = Arc::clone(&c);
            async move {
                c.lock().unwrap().push(serde_json::from_value(payload).unwrap());
                Ok(())
            }
        })
        .unwrap();

        emit_cli(&bus, "engage", &[]).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(mode.current_mode().await, SystemMode::Interactive);
        assert_eq!(changes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn play_music_without_a_name_is_rejected_before_reaching_music_coordinator() {
        let bus = Arc::new(EventBus::new());
        let (_mode, _bridge, _dispatcher) = wire(&bus).await;

        let music_commands: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let m = Arc::clone(&music_commands);
        bus.subscribe_sync(topics::MUSIC_COMMAND, move |_| {
            let m = Arc::clone(&m);
            async move {
                *m.lock().unwrap() += 1;
                Ok(())
            }
        })
        .unwrap();

        let responses: Arc<Mutex<Vec<CliResponsePayload>>> = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&responses);
        bus.subscribe_sync(topics::CLI_RESPONSE, move |payload| {
            let r = Arc::clone(&r);
            async move {
                r.lock().unwrap().push(serde_json::from_value(payload).unwrap());
                Ok(())
            }
        })
        .unwrap();

        emit_cli(&bus, "play", &["music"]).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(*music_commands.lock().unwrap(), 0);
        assert!(responses.lock().unwrap()[0].is_error);
    }

    #[tokio::test]
    async fn eye_commands_always_report_unavailable() {
        let bus = Arc::new(EventBus::new());
        let (_mode, _bridge, _dispatcher) = wire(&bus).await;

        let responses: Arc<Mutex<Vec<CliResponsePayload>>> = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&responses);
        bus.subscribe_sync(topics::CLI_RESPONSE, move |payload| {
            let r = Arc::clone(&r);
            async move {
                r.lock().unwrap().push(serde_json::from_value(payload).unwrap());
                Ok(())
            }
        })
        .unwrap();

        emit_cli(&bus, "eye", &["test"]).await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(responses.lock().unwrap()[0].is_error);
    }
}
