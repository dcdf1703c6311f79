//! Domain types shared by the mode, music, brain, and timeline modules.

use serde::{Deserialize, Serialize};

/// Service lifecycle status (spec.md §3 "Service Record").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Initializing,
    Running,
    Degraded,
    Stopping,
    Stopped,
    Error,
}

/// Log severity, ordered low to high so a per-component threshold can be
/// compared directly (spec.md §4.10 "per-component log levels").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// A music track, owned by the music coordinator but shared as a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub track_id: String,
    pub title: String,
    pub artist: String,
    pub duration_seconds: f64,
    pub provider: TrackProvider,
    pub source_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackProvider {
    Local,
}

/// Concurrency lane for plan execution, in precedence order (spec.md §3/§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    Ambient,
    Foreground,
    Override,
}

impl Layer {
    /// Higher value wins: override > foreground > ambient.
    pub fn precedence(self) -> u8 {
        match self {
            Layer::Ambient => 0,
            Layer::Foreground => 1,
            Layer::Override => 2,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Layer::Ambient => "ambient",
            Layer::Foreground => "foreground",
            Layer::Override => "override",
        };
        write!(f, "{s}")
    }
}

/// One atomic action within a [`Plan`] (spec.md §3 "Plan").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    #[serde(rename = "type")]
    pub step_type: StepType,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub clip_id: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub event_predicate: Option<serde_json::Value>,
    #[serde(default)]
    pub delay_seconds: Option<f64>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub track_query: Option<String>,
    #[serde(skip, default = "default_step_state")]
    pub state: StepState,
}

fn default_step_state() -> StepState {
    StepState::Pending
}

impl PlanStep {
    fn bare(id: impl Into<String>, step_type: StepType) -> Self {
        Self {
            id: id.into(),
            step_type,
            text: None,
            clip_id: None,
            event: None,
            event_predicate: None,
            delay_seconds: None,
            pattern: None,
            track_query: None,
            state: StepState::Pending,
        }
    }

    pub fn speak(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::bare(id, StepType::Speak)
        }
    }

    pub fn play_music(id: impl Into<String>, track_query: impl Into<String>) -> Self {
        Self {
            track_query: Some(track_query.into()),
            ..Self::bare(id, StepType::PlayMusic)
        }
    }

    pub fn wait_for_event(id: impl Into<String>, event: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            ..Self::bare(id, StepType::WaitForEvent)
        }
    }

    pub fn delay(id: impl Into<String>, seconds: f64) -> Self {
        Self {
            delay_seconds: Some(seconds),
            ..Self::bare(id, StepType::Delay)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    PlayMusic,
    Speak,
    WaitForEvent,
    Delay,
    EyePattern,
    Move,
}

/// Step state machine: pending -> ready -> running -> done | cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    #[default]
    Pending,
    Ready,
    Running,
    Done,
    Cancelled,
    Failed,
}

/// An ordered sequence of steps submitted to one layer (spec.md §3 "Plan").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub layer: Layer,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn new(layer: Layer, steps: Vec<PlanStep>) -> Self {
        Self {
            plan_id: uuid::Uuid::new_v4().to_string(),
            layer,
            conversation_id: None,
            steps,
        }
    }
}
