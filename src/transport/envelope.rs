//! Command envelope and its text-frame codec.
//!
//! Every frame on the wire is one JSON object:
//!
//! ```text
//! { "id": "...", "type": "...", "payload": ..., "timestamp": 1700000000000,
//!   "status": "pending" | "success" | "error", "error": "...", "senderID": "..." }
//! ```
//!
//! `error` is only written for error replies and `senderID` only when the
//! sender identifies itself. Decoding is lenient about every field except
//! `id` and `type`: a missing, `null`, or oddly typed timestamp, status,
//! error, or sender falls back to a default instead of dropping the frame.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::constants::{RESPONSE_TYPE, UNKNOWN_REMOTE_ERROR};

/// Reply status carried by an envelope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Request or notification; no outcome yet.
    #[default]
    Pending,
    /// Reply carrying a successful result.
    Success,
    /// Reply carrying a failure in `error`.
    Error,
}

/// The unit exchanged over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id, generated for new calls and echoed by replies.
    pub id: String,
    /// Command name; `"response"` is reserved for replies.
    #[serde(rename = "type")]
    pub command_type: String,
    /// Command-specific data, opaque to the transport.
    #[serde(default)]
    pub payload: Value,
    /// Creation time in milliseconds since the Unix epoch. Informational.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub timestamp: i64,
    /// Reply status.
    #[serde(default, deserialize_with = "lenient_status")]
    pub status: Status,
    /// Failure description, present only when `status` is `error`.
    #[serde(
        default,
        deserialize_with = "lenient_error",
        skip_serializing_if = "Option::is_none"
    )]
    pub error: Option<String>,
    /// Originating process, absent in the minimal protocol.
    #[serde(
        rename = "senderID",
        default,
        deserialize_with = "lenient_sender",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_id: Option<String>,
}

impl Envelope {
    /// Build a request (or notification) with a fresh correlation id.
    pub fn request(command_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: new_id(),
            command_type: command_type.into(),
            payload,
            timestamp: now_millis(),
            status: Status::Pending,
            error: None,
            sender_id: None,
        }
    }

    /// Build a successful reply echoing `id`.
    pub fn success(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            command_type: RESPONSE_TYPE.to_string(),
            payload,
            timestamp: now_millis(),
            status: Status::Success,
            error: None,
            sender_id: None,
        }
    }

    /// Build an error reply echoing `id`.
    pub fn failure(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command_type: RESPONSE_TYPE.to_string(),
            payload: Value::Null,
            timestamp: now_millis(),
            status: Status::Error,
            error: Some(message.into()),
            sender_id: None,
        }
    }

    /// Attach (or clear) the sender identifier.
    pub fn with_sender(mut self, sender_id: Option<&str>) -> Self {
        self.sender_id = sender_id.map(str::to_string);
        self
    }

    /// Whether this envelope is a reply to a call.
    pub fn is_response(&self) -> bool {
        self.command_type == RESPONSE_TYPE
    }

    /// Interpret this envelope as the outcome of a call.
    ///
    /// `error` replies become `Err` with the remote message; anything else
    /// resolves with the payload.
    pub fn into_outcome(self) -> Result<Value, String> {
        match self.status {
            Status::Error => Err(self
                .error
                .filter(|msg| !msg.is_empty())
                .unwrap_or_else(|| UNKNOWN_REMOTE_ERROR.to_string())),
            Status::Pending | Status::Success => Ok(self.payload),
        }
    }
}

/// Generate a collision-resistant correlation id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Any JSON number, truncated to whole milliseconds; anything else is 0.
fn lenient_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let Value::Number(n) = Value::deserialize(deserializer)? else {
        return Ok(0);
    };
    #[allow(clippy::cast_possible_truncation, reason = "saturating float to millis")]
    let millis = n
        .as_i64()
        .or_else(|| n.as_f64().map(|f| f as i64))
        .unwrap_or_default();
    Ok(millis)
}

/// Unknown or `null` status reads as `pending`.
fn lenient_status<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Status, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(Status::deserialize(value).unwrap_or_default())
}

/// Non-string errors are kept as their JSON text.
fn lenient_error<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn lenient_sender<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

/// Errors produced while decoding a text frame.
#[derive(Debug)]
pub enum DecodeError {
    /// The frame is not well-formed JSON, or a field has the wrong shape.
    Malformed(String),
    /// A required field is absent, empty, or not a string.
    MissingField(&'static str),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "Malformed frame: {msg}"),
            Self::MissingField(field) => write!(f, "Frame has no usable `{field}`"),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Serialize an envelope into a text frame.
///
/// `serde_json::Value` payloads cannot be cyclic and map keys are always
/// strings, so this only fails for hand-built non-finite numbers.
pub fn encode(envelope: &Envelope) -> Result<String, serde_json::Error> {
    serde_json::to_string(envelope)
}

/// Parse a text frame into an envelope.
pub fn decode(frame: &str) -> Result<Envelope, DecodeError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let Value::Object(ref fields) = value else {
        return Err(DecodeError::Malformed("frame is not a JSON object".to_string()));
    };
    for field in ["id", "type"] {
        match fields.get(field) {
            Some(Value::String(s)) if !s.is_empty() => {}
            _ => return Err(DecodeError::MissingField(field)),
        }
    }

    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_preserves_request() {
        let envelope = Envelope::request("setSettings", json!({ "volume": 7, "tags": ["a", "b"] }))
            .with_sender(Some("plugin-1"));
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_round_trip_preserves_error_reply() {
        let envelope = Envelope::failure("abc", "disk full");
        let decoded = decode(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(decoded, envelope);
        assert!(decoded.is_response());
    }

    #[test]
    fn test_encode_uses_wire_field_names() {
        let envelope = Envelope::request("startup", json!({ "pluginID": "p" })).with_sender(Some("p"));
        let value: Value = serde_json::from_str(&encode(&envelope).unwrap()).unwrap();
        assert_eq!(value["type"], "startup");
        assert_eq!(value["status"], "pending");
        assert_eq!(value["senderID"], "p");
        assert!(value.get("error").is_none());
        assert!(value.get("command_type").is_none());
    }

    #[test]
    fn test_encode_omits_absent_sender() {
        let envelope = Envelope::success("id-1", json!(1));
        let value: Value = serde_json::from_str(&encode(&envelope).unwrap()).unwrap();
        assert!(value.get("senderID").is_none());
        assert_eq!(value["status"], "success");
    }

    #[test]
    fn test_decode_fills_optional_fields() {
        let envelope = decode(r#"{"id":"x","type":"keyDown"}"#).unwrap();
        assert_eq!(envelope.command_type, "keyDown");
        assert_eq!(envelope.payload, Value::Null);
        assert_eq!(envelope.status, Status::Pending);
        assert_eq!(envelope.timestamp, 0);
        assert!(envelope.sender_id.is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode("not json"), Err(DecodeError::Malformed(_))));
        assert!(matches!(decode("[1,2,3]"), Err(DecodeError::Malformed(_))));
    }

    #[test]
    fn test_decode_rejects_missing_id() {
        let err = decode(r#"{"type":"keyDown","payload":{}}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField("id")));
    }

    #[test]
    fn test_decode_rejects_empty_or_non_string_type() {
        assert!(matches!(
            decode(r#"{"id":"x","type":""}"#),
            Err(DecodeError::MissingField("type"))
        ));
        assert!(matches!(
            decode(r#"{"id":"x","type":42}"#),
            Err(DecodeError::MissingField("type"))
        ));
    }

    #[test]
    fn test_decode_tolerates_odd_timestamps() {
        let float = decode(r#"{"id":"x","type":"response","status":"success","payload":1,"timestamp":1700000000000.5}"#)
            .unwrap();
        assert_eq!(float.timestamp, 1_700_000_000_000);
        assert_eq!(float.status, Status::Success);
        assert_eq!(float.payload, json!(1));

        let null = decode(r#"{"id":"x","type":"response","timestamp":null}"#).unwrap();
        assert_eq!(null.timestamp, 0);

        let text = decode(r#"{"id":"x","type":"response","timestamp":"yesterday"}"#).unwrap();
        assert_eq!(text.timestamp, 0);
    }

    #[test]
    fn test_decode_tolerates_null_or_unknown_status() {
        let null = decode(r#"{"id":"x","type":"response","status":null,"payload":2}"#).unwrap();
        assert_eq!(null.status, Status::Pending);
        assert_eq!(null.into_outcome(), Ok(json!(2)));

        let weird = decode(r#"{"id":"x","type":"response","status":"weird"}"#).unwrap();
        assert_eq!(weird.status, Status::Pending);
    }

    #[test]
    fn test_decode_tolerates_odd_error_and_sender() {
        let envelope = decode(
            r#"{"id":"x","type":"response","status":"error","error":{"code":5},"senderID":42}"#,
        )
        .unwrap();
        assert_eq!(envelope.error.as_deref(), Some(r#"{"code":5}"#));
        assert!(envelope.sender_id.is_none());

        let null_error = decode(r#"{"id":"x","type":"response","status":"error","error":null}"#).unwrap();
        assert_eq!(null_error.into_outcome(), Err(UNKNOWN_REMOTE_ERROR.to_string()));
    }

    #[test]
    fn test_into_outcome() {
        assert_eq!(Envelope::success("a", json!({"ok": true})).into_outcome(), Ok(json!({"ok": true})));
        assert_eq!(Envelope::failure("a", "boom").into_outcome(), Err("boom".to_string()));

        let mut bare = Envelope::failure("a", "");
        bare.error = None;
        assert_eq!(bare.into_outcome(), Err(UNKNOWN_REMOTE_ERROR.to_string()));
    }

    fn json_strategy() -> impl Strategy<Value = serde_json::Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            ".{0,12}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::btree_map("[a-zA-Z_]{1,8}", inner, 0..6)
                    .prop_map(|fields| Value::Object(fields.into_iter().collect())),
            ]
        })
    }

    fn envelope_strategy() -> impl Strategy<Value = Envelope> {
        let status = prop_oneof![Just(Status::Pending), Just(Status::Success), Just(Status::Error)];
        (
            "[a-zA-Z0-9-]{1,36}",
            "[a-zA-Z][a-zA-Z0-9_.]{0,20}",
            json_strategy(),
            any::<i64>(),
            status,
            proptest::option::of(".{0,20}"),
            proptest::option::of("[a-zA-Z0-9-]{1,12}"),
        )
            .prop_map(|(id, command_type, payload, timestamp, status, error, sender_id)| Envelope {
                id,
                command_type,
                payload,
                timestamp,
                status,
                error,
                sender_id,
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 128, .. ProptestConfig::default() })]

        #[test]
        fn test_round_trip_preserves_any_envelope(envelope in envelope_strategy()) {
            let frame = encode(&envelope).unwrap();
            prop_assert_eq!(decode(&frame).unwrap(), envelope);
        }
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = Envelope::request("x", Value::Null);
        let b = Envelope::request("x", Value::Null);
        assert_ne!(a.id, b.id);
    }
}
