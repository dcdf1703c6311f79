//! Inbound message validation (spec.md §4.8): each of the four client
//! message types is checked against its schema before being converted to a
//! canonical bus topic + payload. A failure never reaches the bus — it
//! produces a `command_error` response to the sender instead.

use cantina_events::{topics, MusicCommandPayload, SystemMode, SystemSetModeRequestPayload};
use serde_json::Value;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationFailure {
    pub error_code: &'static str,
    pub errors: Vec<FieldError>,
}

impl ValidationFailure {
    fn single(field: &str, message: impl Into<String>) -> Self {
        Self {
            error_code: "VALIDATION_ERROR",
            errors: vec![FieldError {
                field: field.to_string(),
                message: message.into(),
            }],
        }
    }
}

/// The result of successfully validating one inbound client message:
/// the canonical topic to emit on, plus its bus payload.
pub struct Canonical {
    pub topic: &'static str,
    pub payload: Value,
}

fn str_field<'a>(data: &'a Value, field: &str) -> Result<&'a str, ValidationFailure> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationFailure::single(field, format!("missing or non-string field {field:?}")))
}

/// `voice_command {action: "start"|"stop"}`.
///
/// Maps onto the mode transition that already owns mic capture
/// (spec.md §4.4: `IDLE → INTERACTIVE` "enable mic capture contract"),
/// rather than a dedicated voice topic — there is no separate inbound
/// voice-control entry point in the core, only the mode request
/// SpeechCoordinator already reacts to.
pub fn validate_voice_command(data: &Value) -> Result<Canonical, ValidationFailure> {
    let action = str_field(data, "action")?;
    let mode = match action {
        "start" => SystemMode::Interactive,
        "stop" => SystemMode::Ambient,
        other => {
            return Err(ValidationFailure::single(
                "action",
                format!("invalid voice action {other:?}"),
            ))
        }
    };
    let payload = serde_json::to_value(SystemSetModeRequestPayload { mode })
        .expect("set mode request payload always serializes");
    Ok(Canonical {
        topic: topics::SYSTEM_SET_MODE_REQUEST,
        payload,
    })
}

/// `music_command {action, track_name?, track_id?, volume?}`.
///
/// Only `play`/`pause`/`resume`/`stop` are forwarded: the MusicCoordinator
/// implements a single-track Stopped/Playing/Paused state machine with no
/// queueing (spec.md §4.6, §9 "multi-provider music... out of scope"), so
/// `next`/`queue` are accepted by the schema (matching spec.md §6's client
/// action set) but rejected as unsupported rather than silently dropped.
pub fn validate_music_command(data: &Value) -> Result<Canonical, ValidationFailure> {
    let action = str_field(data, "action")?;
    match action {
        "play" | "pause" | "resume" | "stop" => {}
        "next" | "queue" => {
            return Err(ValidationFailure::single(
                "action",
                format!("action {action:?} is not supported by this music coordinator"),
            ))
        }
        other => {
            return Err(ValidationFailure::single(
                "action",
                format!("invalid music action {other:?}"),
            ))
        }
    }

    let track_query = data
        .get("track_name")
        .and_then(Value::as_str)
        .or_else(|| data.get("track_id").and_then(Value::as_str))
        .map(str::to_string);

    let payload = serde_json::to_value(MusicCommandPayload {
        action: action.to_string(),
        track_query,
        conversation_id: None,
    })
    .expect("music command payload always serializes");
    Ok(Canonical {
        topic: topics::MUSIC_COMMAND,
        payload,
    })
}

/// `dj_command {action: "start"|"stop"|"next", auto_transition?}`.
///
/// No core module owns automated DJ transitions (spec.md §2's component
/// table has no DJ entry); WebBridge's job is only to validate and
/// canonicalize (spec.md §4.8), so this is forwarded on `/dj/command`
/// with no in-core subscriber yet — the same "specified only by contract"
/// framing spec.md §1 applies to out-of-scope collaborators.
pub fn validate_dj_command(data: &Value) -> Result<Canonical, ValidationFailure> {
    let action = str_field(data, "action")?;
    if !matches!(action, "start" | "stop" | "next") {
        return Err(ValidationFailure::single(
            "action",
            format!("invalid dj action {action:?}"),
        ));
    }
    let auto_transition = data.get("auto_transition").and_then(Value::as_bool).unwrap_or(false);
    let payload = serde_json::json!({
        "action": action,
        "auto_transition": auto_transition,
    });
    Ok(Canonical {
        topic: topics::DJ_COMMAND,
        payload,
    })
}

/// `system_command {action: "set_mode"|"restart"|"refresh_config", mode?}`.
pub fn validate_system_command(data: &Value) -> Result<Canonical, ValidationFailure> {
    let action = str_field(data, "action")?;
    match action {
        "set_mode" => {
            let mode_str = str_field(data, "mode")?;
            let mode = match mode_str {
                "IDLE" => SystemMode::Idle,
                "AMBIENT" => SystemMode::Ambient,
                "INTERACTIVE" => SystemMode::Interactive,
                other => {
                    return Err(ValidationFailure::single(
                        "mode",
                        format!("invalid mode {other:?}"),
                    ))
                }
            };
            let payload = serde_json::to_value(SystemSetModeRequestPayload { mode })
                .expect("set mode request payload always serializes");
            Ok(Canonical {
                topic: topics::SYSTEM_SET_MODE_REQUEST,
                payload,
            })
        }
        "restart" | "refresh_config" => Ok(Canonical {
            topic: topics::SYSTEM_COMMAND,
            payload: serde_json::json!({ "action": action }),
        }),
        other => Err(ValidationFailure::single(
            "action",
            format!("invalid system action {other:?}"),
        )),
    }
}

/// Dispatches a `{"event": ..., "data": ...}` inbound envelope to the
/// matching validator.
pub fn validate_event(event: &str, data: &Value) -> Result<Canonical, ValidationFailure> {
    match event {
        "voice_command" => validate_voice_command(data),
        "music_command" => validate_music_command(data),
        "dj_command" => validate_dj_command(data),
        "system_command" => validate_system_command(data),
        other => Err(ValidationFailure::single(
            "event",
            format!("unknown event {other:?}"),
        )),
    }
}
