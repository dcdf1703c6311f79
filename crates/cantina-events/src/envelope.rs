//! The envelope every payload rides on the bus in: timestamp, source, and
//! (for dialog-scoped events) a conversation id, as required by spec.md §3.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum EnvelopeError {
    #[error("payload does not serialize to a JSON object: {0}")]
    NotAnObject(Value),
    #[error("json error: {0}")]
    Json(String),
}

/// Wraps a typed payload with the metadata every bus message carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Monotonic-comparable timestamp in milliseconds.
    pub timestamp: i64,
    /// Name of the emitting service.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(flatten)]
    pub payload: T,
}

impl<T> Envelope<T> {
    pub fn new(source: impl Into<String>, timestamp: i64, payload: T) -> Self {
        Self {
            timestamp,
            source: source.into(),
            conversation_id: None,
            payload,
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }
}

impl<T: Serialize> Envelope<T> {
    /// Convert to the dict-shaped JSON view every subscriber ultimately sees,
    /// regardless of whether it asked for the typed form (spec.md §4.1).
    pub fn to_value(&self) -> Result<Value, EnvelopeError> {
        let value = serde_json::to_value(self).map_err(|e| EnvelopeError::Json(e.to_string()))?;
        if value.is_object() {
            Ok(value)
        } else {
            Err(EnvelopeError::NotAnObject(value))
        }
    }
}

impl<T: for<'de> Deserialize<'de>> Envelope<T> {
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        serde_json::from_value(value).map_err(|e| EnvelopeError::Json(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn envelope_flattens_payload_into_dict_view() {
        let env = Envelope::new("cli", 100, Ping { n: 1 }).with_conversation("conv-1");
        let value = env.to_value().unwrap();
        assert_eq!(value["source"], "cli");
        assert_eq!(value["n"], 1);
        assert_eq!(value["conversation_id"], "conv-1");
    }

    #[test]
    fn envelope_round_trips_through_value() {
        let env = Envelope::new("cli", 100, Ping { n: 7 });
        let value = env.to_value().unwrap();
        let back: Envelope<Ping> = Envelope::from_value(value).unwrap();
        assert_eq!(back.payload, Ping { n: 7 });
        assert_eq!(back.timestamp, 100);
    }
}
