//! Wire protocol for remote object sessions.
//!
//! Every envelope carries a `"$"` meta object. Client calls put the call
//! token there; server envelopes put a numeric message type (plus a token
//! and status where the message is correlated to a call).
//!
//! ```json
//! {"$": {"token": "6f1c..."}, "id": 42, "name": "home", "args": ["a"]}
//! {"$": {"type": 1, "token": "6f1c..."}}
//! {"$": {"type": 0, "token": "6f1c...", "status": "success"}, "data": {"i": 7, "t": 8, "v": {}}}
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use thiserror::Error;
use uuid::Uuid;

/// Key of the meta object inside every envelope.
pub const META_KEY: &str = "$";

/// Status string of a successful result.
pub const STATUS_SUCCESS: &str = "success";
/// Status string of a failed result.
pub const STATUS_FAILURE: &str = "error";

/// Attribute mapping of an object or type payload.
pub type Attributes = Map<String, Value>;

/// Identifier of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(pub u64);

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u64> for ObjectId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Opaque correlation token chosen by the client for one call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(String);

impl Token {
    /// Generate a fresh random token.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the token text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Token {
    fn from(token: &str) -> Self {
        Self(token.to_string())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server to client message types.
///
/// These values must match the server counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Result of a call, correlated by token.
    Result = 0,
    /// Call accepted, result pending.
    Ack = 1,
    /// Uncorrelated push from the server.
    Notification = 2,
    /// Handshake envelope with the root object.
    Control = 3,
    /// Call rejected before execution.
    Nack = 4,
}

impl MessageType {
    /// Wire discriminant.
    #[must_use]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Look up a wire discriminant.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Result),
            1 => Some(Self::Ack),
            2 => Some(Self::Notification),
            3 => Some(Self::Control),
            4 => Some(Self::Nack),
            _ => None,
        }
    }
}

/// Outcome carried by a result envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Failure,
}

impl CallStatus {
    fn parse(status: Option<&str>) -> Self {
        if status == Some(STATUS_SUCCESS) {
            Self::Success
        } else {
            Self::Failure
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Success => STATUS_SUCCESS,
            Self::Failure => STATUS_FAILURE,
        }
    }
}

/// Instance or type payload: `{"i": id, "t": type id, "v": attributes}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "i")]
    pub id: ObjectId,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<ObjectId>,
    #[serde(rename = "v", default)]
    pub value: Attributes,
}

impl Descriptor {
    /// Read a top-level payload. Anything without an id is not a descriptor.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let id = object.get("i")?.as_u64()?;
        let type_id = object.get("t").and_then(Value::as_u64);
        let value = object
            .get("v")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Some(Self {
            id: ObjectId(id),
            type_id: type_id.map(ObjectId),
            value,
        })
    }

    /// Read an attribute value that embeds another object.
    ///
    /// Nested payloads must carry both a type id and attributes.
    #[must_use]
    pub fn nested(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        if !object.get("v").is_some_and(Value::is_object) {
            return None;
        }
        let descriptor = Self::from_value(value)?;
        descriptor.type_id.map(|_| descriptor)
    }

    /// Encode back to the wire shape.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("i".into(), json!(self.id));
        if let Some(type_id) = self.type_id {
            object.insert("t".into(), json!(type_id));
        }
        object.insert("v".into(), Value::Object(self.value.clone()));
        Value::Object(object)
    }
}

/// Meta object of a client call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallMeta {
    pub token: Token,
}

/// Client to server call envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallEnvelope {
    #[serde(rename = "$")]
    pub meta: CallMeta,
    /// Target object, or `None` for the session level dispatcher.
    pub id: Option<ObjectId>,
    pub name: String,
    pub args: Vec<Value>,
}

impl CallEnvelope {
    #[must_use]
    pub fn new(token: Token, id: Option<ObjectId>, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            meta: CallMeta { token },
            id,
            name: name.into(),
            args,
        }
    }

    /// Serialize to a JSON value.
    ///
    /// # Errors
    /// Returns error if an argument cannot be represented as JSON.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Parse a call envelope, as a server would.
    ///
    /// # Errors
    /// Returns error if the value is not a call envelope.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }
}

/// Envelope decode error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0:?} envelope without a token")]
    MissingToken(MessageType),
}

#[derive(Deserialize)]
struct RawMeta {
    #[serde(rename = "type")]
    kind: Option<i64>,
    token: Option<Token>,
    status: Option<String>,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "$")]
    meta: RawMeta,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    root: Value,
    #[serde(rename = "type", default)]
    root_type: Value,
    #[serde(default)]
    reason: Value,
}

/// Decoded server to client envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Handshake with the root instance and its type.
    Control { root: Value, root_type: Value },
    /// Settlement of a call.
    Result {
        token: Token,
        status: CallStatus,
        data: Value,
    },
    Ack { token: Token },
    Nack { token: Token, reason: String },
    Notification { data: Value },
    /// Message type this client does not know about.
    Unrecognized { kind: Option<i64> },
}

impl Incoming {
    /// Decode an envelope received from the transport.
    ///
    /// # Errors
    /// Returns error if the meta object is missing or a correlated
    /// envelope has no token.
    pub fn decode(envelope: Value) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_value(envelope)?;
        let Some(kind) = raw.meta.kind.and_then(MessageType::from_code) else {
            return Ok(Self::Unrecognized {
                kind: raw.meta.kind,
            });
        };

        let token = || raw.meta.token.clone().ok_or(DecodeError::MissingToken(kind));

        Ok(match kind {
            MessageType::Control => Self::Control {
                root: raw.root,
                root_type: raw.root_type,
            },
            MessageType::Result => Self::Result {
                token: token()?,
                status: CallStatus::parse(raw.meta.status.as_deref()),
                data: raw.data,
            },
            MessageType::Ack => Self::Ack { token: token()? },
            MessageType::Nack => Self::Nack {
                token: token()?,
                reason: reason_text(&raw.reason),
            },
            MessageType::Notification => Self::Notification { data: raw.data },
        })
    }

    /// Encode as the server would send it.
    #[must_use]
    pub fn encode(&self) -> Value {
        match self {
            Self::Control { root, root_type } => json!({
                "$": {"type": MessageType::Control.code()},
                "root": root,
                "type": root_type,
            }),
            Self::Result {
                token,
                status,
                data,
            } => json!({
                "$": {
                    "type": MessageType::Result.code(),
                    "token": token,
                    "status": status.as_str(),
                },
                "data": data,
            }),
            Self::Ack { token } => json!({
                "$": {"type": MessageType::Ack.code(), "token": token},
            }),
            Self::Nack { token, reason } => json!({
                "$": {"type": MessageType::Nack.code(), "token": token},
                "reason": reason,
            }),
            Self::Notification { data } => json!({
                "$": {"type": MessageType::Notification.code()},
                "data": data,
            }),
            Self::Unrecognized { kind } => json!({
                "$": {"type": kind},
            }),
        }
    }
}

/// Render a reason or failure payload for an error message.
#[must_use]
pub fn reason_text(reason: &Value) -> String {
    match reason {
        Value::String(text) => text.clone(),
        Value::Null => "no reason given".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_envelope_shape() {
        let envelope = CallEnvelope::new(
            Token::from("id-1"),
            Some(ObjectId(123)),
            "method_name",
            vec![json!(1), json!(2), json!(3)],
        );
        assert_eq!(
            envelope.to_value().unwrap(),
            json!({"$": {"token": "id-1"}, "id": 123, "name": "method_name", "args": [1, 2, 3]})
        );
    }

    #[test]
    fn test_call_envelope_null_target() {
        let envelope = CallEnvelope::new(Token::from("t"), None, "get_object_by_id", vec![json!(5)]);
        let value = envelope.to_value().unwrap();
        assert!(value["id"].is_null());
    }

    #[test]
    fn test_tokens_are_unique() {
        let a = Token::generate();
        let b = Token::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_decode_result() {
        let incoming = Incoming::decode(json!({
            "$": {"type": 0, "token": "T1", "status": "success"},
            "data": {"i": 42, "t": 43, "v": {}}
        }))
        .unwrap();

        match incoming {
            Incoming::Result {
                token,
                status,
                data,
            } => {
                assert_eq!(token.as_str(), "T1");
                assert_eq!(status, CallStatus::Success);
                assert_eq!(data["i"], 42);
            }
            other => panic!("Expected Result, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_failure_status() {
        let incoming = Incoming::decode(json!({
            "$": {"type": 0, "token": "T1", "status": "error"},
            "data": "ahhh"
        }))
        .unwrap();
        assert!(matches!(
            incoming,
            Incoming::Result {
                status: CallStatus::Failure,
                ..
            }
        ));
    }

    #[test]
    fn test_decode_nack() {
        let incoming =
            Incoming::decode(json!({"$": {"type": 4, "token": "T2"}, "reason": "bad token"}))
                .unwrap();
        assert_eq!(
            incoming,
            Incoming::Nack {
                token: Token::from("T2"),
                reason: "bad token".into()
            }
        );
    }

    #[test]
    fn test_decode_control() {
        let incoming = Incoming::decode(json!({
            "$": {"type": 3},
            "root": {"i": 4, "t": 5, "v": {}},
            "type": {"i": 5, "t": 3, "v": {}}
        }))
        .unwrap();
        match incoming {
            Incoming::Control { root, root_type } => {
                assert_eq!(root["i"], 4);
                assert_eq!(root_type["i"], 5);
            }
            other => panic!("Expected Control, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_not_an_error() {
        let incoming = Incoming::decode(json!({"$": {"type": 99}})).unwrap();
        assert_eq!(incoming, Incoming::Unrecognized { kind: Some(99) });
    }

    #[test]
    fn test_decode_ack_without_token() {
        let err = Incoming::decode(json!({"$": {"type": 1}})).unwrap_err();
        assert!(matches!(err, DecodeError::MissingToken(MessageType::Ack)));
    }

    #[test]
    fn test_decode_without_meta() {
        assert!(Incoming::decode(json!({"data": 1})).is_err());
    }

    #[test]
    fn test_encode_matches_decode() {
        let ack = Incoming::Ack {
            token: Token::from("abc"),
        };
        assert_eq!(ack.encode(), json!({"$": {"type": 1, "token": "abc"}}));
        assert_eq!(Incoming::decode(ack.encode()).unwrap(), ack);
    }

    #[test]
    fn test_descriptor_from_value() {
        let descriptor = Descriptor::from_value(&json!({"i": 4, "t": 5, "v": {"foo": "bar"}})).unwrap();
        assert_eq!(descriptor.id, ObjectId(4));
        assert_eq!(descriptor.type_id, Some(ObjectId(5)));
        assert_eq!(descriptor.value["foo"], "bar");

        assert!(Descriptor::from_value(&json!({"t": 5, "v": {}})).is_none());
        assert!(Descriptor::from_value(&json!("plain")).is_none());
    }

    #[test]
    fn test_nested_requires_type_and_attributes() {
        assert!(Descriptor::nested(&json!({"i": 1, "t": 2, "v": {}})).is_some());
        assert!(Descriptor::nested(&json!({"i": 1, "v": {}})).is_none());
        assert!(Descriptor::nested(&json!({"i": 1, "t": 2})).is_none());
        assert!(Descriptor::nested(&json!({})).is_none());
    }

    #[test]
    fn test_reason_text() {
        assert_eq!(reason_text(&json!("oops")), "oops");
        assert_eq!(reason_text(&json!({"code": 1})), r#"{"code":1}"#);
        assert_eq!(reason_text(&Value::Null), "no reason given");
    }
}
