//! Error taxonomy for sessions and transports.

use std::{fmt, time::Duration};

use serde_json::Value;
use thiserror::Error;

use crate::protocol::ObjectId;
use crate::traits::ReadyState;

/// Result alias used across the session layer.
pub type Result<T> = std::result::Result<T, Error>;

/// Method name and arguments of a call, for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct CallSite {
    pub target: Option<ObjectId>,
    pub method: String,
    pub args: Vec<Value>,
}

impl CallSite {
    #[must_use]
    pub fn new(target: Option<ObjectId>, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            target,
            method: method.into(),
            args,
        }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.method)?;
        for (index, arg) in self.args.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            match arg {
                Value::String(text) => f.write_str(text)?,
                other => write!(f, "{other}")?,
            }
        }
        f.write_str(")")
    }
}

/// Transport error.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport is not open ({0:?})")]
    NotOpen(ReadyState),
    #[error("Transport is closed")]
    Closed,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Socket error: {0}")]
    Socket(String),
}

/// Session error.
///
/// Every variant is terminal for the operation that raised it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Handshake timeout after {0:?}")]
    HandshakeTimeout(Duration),
    #[error("Timeout getting control message after {0:?}")]
    ControlTimeout(Duration),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Error in {call}: ACK timeout")]
    AckTimeout { call: CallSite },
    #[error("Error in {call}: Result timeout")]
    ResultTimeout { call: CallSite },
    #[error("Error in {call}: Received NACK with {reason}")]
    Nack { call: CallSite, reason: String },
    #[error("Error in {call}: {reason}")]
    RemoteFailure { call: CallSite, reason: String },
    /// Transport failure observed by a pending call.
    #[error("Error in {call}: {reason}")]
    CallAborted { call: CallSite, reason: String },
    #[error("Timed out closing session after {0:?}")]
    CloseTimeout(Duration),
    #[error("Session is closed")]
    SessionClosed,
    #[error("Remote object {id} has no method {method}")]
    UnknownMethod { id: ObjectId, method: String },
    #[error("Proxy error: {0}")]
    Proxy(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is one of the deadline failures.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::HandshakeTimeout(_)
                | Self::ControlTimeout(_)
                | Self::AckTimeout { .. }
                | Self::ResultTimeout { .. }
                | Self::CloseTimeout(_)
        )
    }

    /// Call this error belongs to, if it was raised by a call.
    #[must_use]
    pub const fn call_site(&self) -> Option<&CallSite> {
        match self {
            Self::AckTimeout { call }
            | Self::ResultTimeout { call }
            | Self::Nack { call, .. }
            | Self::RemoteFailure { call, .. }
            | Self::CallAborted { call, .. } => Some(call),
            _ => None,
        }
    }
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        Self::Transport(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn site() -> CallSite {
        CallSite::new(Some(ObjectId(123)), "method_name", vec![json!(1), json!(2), json!(3)])
    }

    #[test]
    fn test_call_site_display() {
        assert_eq!(site().to_string(), "method_name(1, 2, 3)");
        let strings = CallSite::new(None, "move_to", vec![json!("A1"), json!({"x": 1})]);
        assert_eq!(strings.to_string(), r#"move_to(A1, {"x":1})"#);
        assert_eq!(CallSite::new(None, "home", vec![]).to_string(), "home()");
    }

    #[test]
    fn test_nack_message() {
        let err = Error::Nack {
            call: site(),
            reason: "You done messed up".into(),
        };
        assert_eq!(
            err.to_string(),
            "Error in method_name(1, 2, 3): Received NACK with You done messed up"
        );
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_timeouts_are_flagged() {
        assert!(Error::AckTimeout { call: site() }.is_timeout());
        assert!(Error::ControlTimeout(Duration::from_secs(3)).is_timeout());
        assert!(
            Error::ControlTimeout(Duration::from_secs(3))
                .to_string()
                .to_lowercase()
                .contains("timeout")
        );
        assert!(!Error::SessionClosed.is_timeout());
    }

    #[test]
    fn test_call_site_lookup() {
        let err = Error::RemoteFailure {
            call: site(),
            reason: "ahhh".into(),
        };
        assert_eq!(err.call_site().map(|c| c.method.as_str()), Some("method_name"));
        assert!(Error::SessionClosed.call_site().is_none());
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: Error = TransportError::NotOpen(ReadyState::Closed).into();
        assert!(matches!(err, Error::Transport(ref msg) if msg.contains("not open")));
    }
}
