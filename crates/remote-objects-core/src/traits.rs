//! Transport contract consumed by sessions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    /// Connecting, `open` not yet emitted.
    Connecting = 0,
    Open = 1,
    /// Close requested, waiting for the peer.
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    /// Decode a state stored as a byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Event emitted by a transport, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The connection is established.
    Open,
    /// One decoded inbound envelope.
    Message(Value),
    /// The connection is gone. Always the last event.
    Close {
        code: Option<u16>,
        reason: String,
        was_clean: bool,
    },
    /// Transport failure. A `Close` usually follows.
    Error(String),
}

/// Receiver of transport events.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Duplex JSON channel to the server.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Serialize and send one envelope.
    async fn send(&self, envelope: Value) -> Result<(), TransportError>;

    /// Request the connection to close.
    ///
    /// Completion is reported by a `Close` event.
    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), TransportError>;

    /// Current connection state.
    fn ready_state(&self) -> ReadyState;
}

/// Opens transports to an address.
///
/// `dial` returns at once with a transport in `Connecting` state; the
/// outcome of the connection attempt arrives as `Open` or `Error` events.
pub trait Dialer: Send + Sync {
    fn dial(&self, address: &str) -> (Arc<dyn Transport>, TransportEvents);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_state_round_trip() {
        for state in [
            ReadyState::Connecting,
            ReadyState::Open,
            ReadyState::Closing,
            ReadyState::Closed,
        ] {
            assert_eq!(ReadyState::from_u8(state as u8), state);
        }
        assert_eq!(ReadyState::from_u8(200), ReadyState::Closed);
    }
}
