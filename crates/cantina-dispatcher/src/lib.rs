//! CommandDispatcher: normalizes CLI tokens and routes them to the topic a
//! service registered for that verb (spec.md §4.3).
//!
//! Registration is generic — the dispatcher has no domain knowledge of
//! `engage`/`play music`/`debug level`; each owning service registers its
//! verbs at startup, the way this workspace's tool registry is populated by
//! each tool rather than hardcoded into the router.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use cantina_bus::EventBus;
use cantina_events::{topics, BadTopic, CliCommandPayload, CliResponsePayload, StandardCommandPayload};
use cantina_service::{Service, ServiceCore, ServiceError};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("command {command:?} subcommand {subcommand:?} already registered")]
    DuplicateRegistration {
        command: String,
        subcommand: Option<String>,
    },
    #[error("bad topic: {0}")]
    BadTopic(#[from] BadTopic),
}

type RegistrationKey = (String, Option<String>);

fn default_aliases() -> HashMap<String, Vec<String>> {
    let mut aliases = HashMap::new();
    aliases.insert("e".to_string(), vec!["engage".to_string()]);
    aliases.insert("d".to_string(), vec!["disengage".to_string()]);
    aliases.insert("a".to_string(), vec!["ambient".to_string()]);
    aliases.insert("r".to_string(), vec!["reset".to_string()]);
    aliases.insert("s".to_string(), vec!["status".to_string()]);
    aliases.insert("q".to_string(), vec!["quit".to_string()]);
    aliases.insert("exit".to_string(), vec!["quit".to_string()]);
    aliases.insert("l".to_string(), vec!["list".to_string(), "music".to_string()]);
    aliases.insert("p".to_string(), vec!["play".to_string(), "music".to_string()]);
    aliases
}

pub struct CommandDispatcher {
    core: ServiceCore,
    aliases: Arc<HashMap<String, Vec<String>>>,
    registrations: Arc<Mutex<HashMap<RegistrationKey, String>>>,
}

impl CommandDispatcher {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            core: ServiceCore::new("command_dispatcher", bus),
            aliases: Arc::new(default_aliases()),
            registrations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register `command[, subcommand]` to route to `target_topic`.
    /// Duplicate registration of the same (command, subcommand) pair is a
    /// startup error.
    pub fn register(
        &self,
        command: impl Into<String>,
        subcommand: Option<impl Into<String>>,
        target_topic: impl Into<String>,
    ) -> Result<(), DispatcherError> {
        let command = command.into();
        let subcommand = subcommand.map(Into::into);
        let mut registrations = self
            .registrations
            .lock()
            .expect("dispatcher registrations lock poisoned");
        let key = (command.clone(), subcommand.clone());
        if registrations.contains_key(&key) {
            return Err(DispatcherError::DuplicateRegistration { command, subcommand });
        }
        registrations.insert(key, target_topic.into());
        Ok(())
    }

    async fn handle_cli_command(
        core_handle: cantina_service::ServiceHandle,
        registrations: Arc<Mutex<HashMap<RegistrationKey, String>>>,
        aliases: Arc<HashMap<String, Vec<String>>>,
        payload: serde_json::Value,
    ) -> Result<(), String> {
        let command_payload: CliCommandPayload =
            serde_json::from_value(payload).map_err(|e| e.to_string())?;

        let mut tokens = aliases
            .get(&command_payload.command)
            .cloned()
            .unwrap_or_else(|| vec![command_payload.command.clone()]);
        tokens.extend(command_payload.args.iter().cloned());

        if tokens.is_empty() {
            return Ok(());
        }

        let first = tokens[0].clone();
        let (subcommand, target_topic, remaining) = {
            let regs = registrations.lock().expect("dispatcher registrations lock poisoned");
            let compound_key = (first.clone(), tokens.get(1).cloned());
            if let (Some(sub), Some(topic)) = (tokens.get(1).cloned(), regs.get(&compound_key)) {
                (Some(sub), Some(topic.clone()), tokens[2..].to_vec())
            } else if let Some(topic) = regs.get(&(first.clone(), None)) {
                (None, Some(topic.clone()), tokens[1..].to_vec())
            } else {
                (None, None, Vec::new())
            }
        };

        let Some(target_topic) = target_topic else {
            warn!(raw_input = %command_payload.raw_input, "unknown command");
            let response = CliResponsePayload {
                message: format!("Unknown command: {}", command_payload.raw_input),
                is_error: true,
            };
            let value = serde_json::to_value(response).map_err(|e| e.to_string())?;
            core_handle.emit(topics::CLI_RESPONSE, value).await;
            return Ok(());
        };

        let standard = StandardCommandPayload {
            command: first,
            subcommand,
            args: remaining,
            raw_input: command_payload.raw_input,
            source: "cli".to_string(),
        };
        let value = serde_json::to_value(standard).map_err(|e| e.to_string())?;
        core_handle.emit(&target_topic, value).await;
        Ok(())
    }
}

#[async_trait]
impl Service for CommandDispatcher {
    fn core(&self) -> &ServiceCore {
        &self.core
    }

    async fn setup_subscriptions(&self) -> Result<(), ServiceError> {
        let handle = self.core.handle();
        // Shared behind `Arc` (not copied) so registrations added after
        // `start_service` via `register` are visible to the live handler.
        let registrations = Arc::clone(&self.registrations);
        let aliases = Arc::clone(&self.aliases);

        self.core.subscribe(topics::CLI_COMMAND, move |payload| {
            let handle = handle.clone();
            let registrations = Arc::clone(&registrations);
            let aliases = Arc::clone(&aliases);
            async move { Self::handle_cli_command(handle, registrations, aliases, payload).await }
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cantina_service::start_service;

    async fn emit_command(bus: &EventBus, command: &str, args: &[&str]) {
        let payload = CliCommandPayload {
            command: command.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            raw_input: std::iter::once(command)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" "),
        };
        bus.emit(topics::CLI_COMMAND, serde_json::to_value(payload).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn alias_and_canonical_produce_identical_emission() {
        let bus = Arc::new(EventBus::new());
        let dispatcher = CommandDispatcher::new(Arc::clone(&bus));
        dispatcher
            .register("engage", None::<String>, "/test/engage")
            .unwrap();
        start_service(&dispatcher).await.unwrap();

        let received: Arc<Mutex<Vec<StandardCommandPayload>>> = Arc::new(Mutex::new(Vec::new()));
        let received2 = Arc::clone(&received);
        bus.subscribe_sync("/test/engage", move |v| {
            let received = Arc::clone(&received2);
            async move {
                let payload: StandardCommandPayload = serde_json::from_value(v).unwrap();
                received.lock().unwrap().push(payload);
                Ok(())
            }
        })
        .unwrap();

        emit_command(&bus, "e", &[]).await;
        emit_command(&bus, "engage", &[]).await;

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].command, received[1].command);
        assert_eq!(received[0].subcommand, received[1].subcommand);
    }

    #[tokio::test]
    async fn compound_command_is_matched_before_single_token() {
        let bus = Arc::new(EventBus::new());
        let dispatcher = CommandDispatcher::new(Arc::clone(&bus));
        dispatcher
            .register("play", None::<String>, "/test/play")
            .unwrap();
        dispatcher
            .register("play", Some("music"), "/test/play_music")
            .unwrap();
        start_service(&dispatcher).await.unwrap();

        let received: Arc<Mutex<Option<StandardCommandPayload>>> = Arc::new(Mutex::new(None));
        let received2 = Arc::clone(&received);
        bus.subscribe_sync("/test/play_music", move |v| {
            let received = Arc::clone(&received2);
            async move {
                *received.lock().unwrap() = Some(serde_json::from_value(v).unwrap());
                Ok(())
            }
        })
        .unwrap();

        emit_command(&bus, "play", &["music", "Cantina", "Band"]).await;

        let received = received.lock().unwrap().clone().unwrap();
        assert_eq!(received.subcommand.as_deref(), Some("music"));
        assert_eq!(received.args, vec!["Cantina", "Band"]);
    }

    #[tokio::test]
    async fn unknown_command_produces_cli_error_response() {
        let bus = Arc::new(EventBus::new());
        let dispatcher = CommandDispatcher::new(Arc::clone(&bus));
        start_service(&dispatcher).await.unwrap();

        let received: Arc<Mutex<Option<CliResponsePayload>>> = Arc::new(Mutex::new(None));
        let received2 = Arc::clone(&received);
        bus.subscribe_sync(topics::CLI_RESPONSE, move |v| {
            let received = Arc::clone(&received2);
            async move {
                *received.lock().unwrap() = Some(serde_json::from_value(v).unwrap());
                Ok(())
            }
        })
        .unwrap();

        emit_command(&bus, "frobnicate", &[]).await;

        let received = received.lock().unwrap().clone().unwrap();
        assert!(received.is_error);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let bus = Arc::new(EventBus::new());
        let dispatcher = CommandDispatcher::new(bus);
        dispatcher
            .register("status", None::<String>, "/test/status")
            .unwrap();
        let err = dispatcher
            .register("status", None::<String>, "/test/status_again")
            .unwrap_err();
        assert!(matches!(err, DispatcherError::DuplicateRegistration { .. }));
    }
}
