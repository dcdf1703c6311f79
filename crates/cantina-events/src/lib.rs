//! Shared event contracts for cross-service communication on the bus.
//!
//! This crate defines the formal topic registry and payload DTOs that flow
//! between CantinaOS services. Using shared types prevents runtime
//! deserialization drift between emitters and subscribers; the registry
//! prevents typos turning into silently-dropped events.

mod domain;
mod envelope;
pub mod topics;

pub use domain::{
    Layer, LogLevel, Plan, PlanStep, ServiceStatus, StepState, StepType, Track, TrackProvider,
};
pub use envelope::{Envelope, EnvelopeError};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Error returned when a topic is not part of the registry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown topic: {0}")]
pub struct BadTopic(pub String);

fn registry() -> &'static HashSet<&'static str> {
    static REGISTRY: OnceLock<HashSet<&'static str>> = OnceLock::new();
    REGISTRY.get_or_init(|| topics::ALL.iter().copied().collect())
}

/// Returns true if `topic` is a known, registered topic.
pub fn is_registered(topic: &str) -> bool {
    registry().contains(topic)
}

/// Validate that `topic` is registered, returning [`BadTopic`] otherwise.
pub fn require_registered(topic: &str) -> Result<(), BadTopic> {
    if is_registered(topic) {
        Ok(())
    } else {
        Err(BadTopic(topic.to_string()))
    }
}

// --- Command pipeline payloads -------------------------------------------

/// Raw command as produced by the CLI, before dispatcher normalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliCommandPayload {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub raw_input: String,
}

/// A textual response routed back to the CLI (or any response sink).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliResponsePayload {
    pub message: String,
    #[serde(default)]
    pub is_error: bool,
}

/// Normalized command emitted by the dispatcher to a service-specific topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardCommandPayload {
    pub command: String,
    #[serde(default)]
    pub subcommand: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    pub raw_input: String,
    pub source: String,
}

// --- Service lifecycle payloads ------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatusPayload {
    pub service: String,
    pub status: ServiceStatus,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceErrorPayload {
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub topic: Option<String>,
}

// --- Mode payloads ---------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemMode {
    Idle,
    Ambient,
    Interactive,
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SystemMode::Idle => "IDLE",
            SystemMode::Ambient => "AMBIENT",
            SystemMode::Interactive => "INTERACTIVE",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSetModeRequestPayload {
    pub mode: SystemMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemModeChangePayload {
    pub from: SystemMode,
    pub to: SystemMode,
}

// --- Speech / transcription payloads --------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceListeningPayload {
    pub session_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionPayload {
    pub conversation_id: String,
    pub session_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDetectedPayload {
    pub conversation_id: String,
    pub intent_name: String,
    pub parameters: serde_json::Value,
    pub utterance: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsGenerateRequestPayload {
    pub request_id: String,
    pub conversation_id: String,
    pub text: String,
    #[serde(default)]
    pub voice_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechSynthesisEventPayload {
    pub request_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceBeatPayload {
    pub request_id: String,
    pub amplitude: f32,
}

// --- Music payloads --------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicCommandPayload {
    pub action: String,
    #[serde(default)]
    pub track_query: Option<String>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MusicPlaybackEventPayload {
    pub track: Track,
    pub start_timestamp: i64,
    pub duration_seconds: f64,
    #[serde(default)]
    pub position_seconds: Option<f64>,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDuckingPayload {
    pub reason: String,
}

// --- Plan / timeline payloads ----------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReadyPayload {
    pub plan: Plan,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLifecyclePayload {
    pub plan_id: String,
    pub layer: Layer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLifecyclePayload {
    pub plan_id: String,
    pub step_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

// --- Memory payloads ---------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUpdatedPayload {
    pub key: String,
    pub value: serde_json::Value,
}

// --- Debug payloads ----------------------------------------------------------

/// A structured log record, emitted by any service on `DEBUG_LOG` for
/// DebugService to queue and print. `duration_ms`, when present, also feeds
/// that component's rolling performance window (spec.md §4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugLogPayload {
    pub component: String,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub duration_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_core_topics() {
        assert!(is_registered(topics::CLI_COMMAND));
        assert!(is_registered(topics::MUSIC_PLAYBACK_STARTED));
        assert!(!is_registered("/made/up/topic"));
    }

    #[test]
    fn require_registered_rejects_unknown() {
        let err = require_registered("/nope").unwrap_err();
        assert_eq!(err.0, "/nope");
    }

    #[test]
    fn mode_display_matches_wire_format() {
        assert_eq!(SystemMode::Interactive.to_string(), "INTERACTIVE");
    }

    #[test]
    fn standard_command_round_trips() {
        let payload = StandardCommandPayload {
            command: "play".into(),
            subcommand: Some("music".into()),
            args: vec!["Cantina".into(), "Band".into()],
            raw_input: "play music Cantina Band".into(),
            source: "cli".into(),
        };
        let json = serde_json::to_string(&payload).unwrap();
        let back: StandardCommandPayload = serde_json::from_str(&json).unwrap();
        assert_eq!(back.args, payload.args);
        assert_eq!(back.subcommand, payload.subcommand);
    }
}
