use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::{encode_frame, FrameError};

/// Name of the envelope carrying the result of a correlated call.
pub const EXECUTE_CALLBACK: &str = "executeCallback";

/// Name of the envelope carrying a broadcast event: `[eventName, argsJson]`.
pub const DISPATCH_EVENT: &str = "DispatchJSEvent";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Typed argument slot of an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arg {
    Int(i64),
    Str(String),
    Json(serde_json::Value),
}

impl Arg {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Arg::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Arg::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<i64> for Arg {
    fn from(value: i64) -> Self {
        Arg::Int(value)
    }
}

impl From<&str> for Arg {
    fn from(value: &str) -> Self {
        Arg::Str(value.to_string())
    }
}

impl From<String> for Arg {
    fn from(value: String) -> Self {
        Arg::Str(value)
    }
}

impl From<serde_json::Value> for Arg {
    fn from(value: serde_json::Value) -> Self {
        Arg::Json(value)
    }
}

/// Named message with ordered arguments and an optional correlation id.
///
/// Envelopes are immutable once built; all fields are read through accessors.
/// On the wire an envelope is a JSON object inside a single frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    name: String,
    #[serde(default)]
    args: Vec<Arg>,
}

impl Envelope {
    pub fn new(name: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            id: None,
            name: name.into(),
            args,
        }
    }

    /// Request half of a correlated call.
    pub fn call(id: u64, name: impl Into<String>, args: Vec<Arg>) -> Self {
        Self {
            id: Some(id),
            name: name.into(),
            args,
        }
    }

    /// Response to the call `id`; `slot` echoes the caller's first argument.
    pub fn callback(id: u64, slot: i64, result_json: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            name: EXECUTE_CALLBACK.to_string(),
            args: vec![Arg::Int(slot), Arg::Str(result_json.into())],
        }
    }

    /// Broadcast event; carries no correlation id.
    pub fn event(event_name: impl Into<String>, args_json: impl Into<String>) -> Self {
        Self::new(
            DISPATCH_EVENT,
            vec![Arg::Str(event_name.into()), Arg::Str(args_json.into())],
        )
    }

    pub fn id(&self) -> Option<u64> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Arg] {
        &self.args
    }

    pub fn int_arg(&self, index: usize) -> Option<i64> {
        self.args.get(index).and_then(Arg::as_int)
    }

    pub fn str_arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Arg::as_str)
    }

    pub fn is_callback(&self) -> bool {
        self.name == EXECUTE_CALLBACK
    }

    /// `(eventName, argsJson)` when this envelope is a broadcast event.
    pub fn event_parts(&self) -> Option<(&str, &str)> {
        if self.name != DISPATCH_EVENT {
            return None;
        }
        Some((self.str_arg(0)?, self.str_arg(1).unwrap_or("")))
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Serializes and frames the envelope, ready for `PipeTransport::write_message`.
    pub fn encode(&self, max_frame_len: u32) -> Result<Vec<u8>, EnvelopeError> {
        let payload = self.to_payload()?;
        Ok(encode_frame(&payload, max_frame_len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameDecoder, DEFAULT_MAX_FRAME_LEN};
    use pretty_assertions::assert_eq;

    #[test]
    fn callback_layout_matches_wire_contract() {
        let envelope = Envelope::callback(7, 3, r#"{"recording":true}"#);
        let json: serde_json::Value =
            serde_json::from_slice(&envelope.to_payload().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "id": 7,
                "name": "executeCallback",
                "args": [{"int": 3}, {"str": "{\"recording\":true}"}]
            })
        );
        assert!(envelope.is_callback());
    }

    #[test]
    fn events_carry_no_id() {
        let envelope = Envelope::event("obsRecordingStarted", "");
        let payload = envelope.to_payload().unwrap();
        let text = String::from_utf8(payload).unwrap();
        assert!(!text.contains("\"id\""));
        assert_eq!(envelope.event_parts(), Some(("obsRecordingStarted", "")));
    }

    #[test]
    fn framed_envelope_survives_decoder() {
        let envelope = Envelope::call(
            1,
            "getStatus",
            vec![Arg::Int(0), Arg::Json(serde_json::json!({"verbose": true}))],
        );
        let bytes = envelope.encode(DEFAULT_MAX_FRAME_LEN).unwrap();
        let mut decoder = FrameDecoder::default();
        let frames = decoder.decode(&bytes).unwrap();
        assert_eq!(Envelope::from_payload(&frames[0]).unwrap(), envelope);
    }

    #[test]
    fn missing_args_default_to_empty() {
        let envelope = Envelope::from_payload(br#"{"name":"getCurrentScene"}"#).unwrap();
        assert_eq!(envelope.id(), None);
        assert!(envelope.args().is_empty());
        assert_eq!(envelope.int_arg(0), None);
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(matches!(
            Envelope::from_payload(b"not json"),
            Err(EnvelopeError::Json(_))
        ));
    }
}
