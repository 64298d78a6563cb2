//! In-memory transport.
//!
//! [`MemoryDialer`] hands out transports whose server side is driven by a
//! [`MemoryPeer`]: the peer decides when the connection opens, reads the
//! envelopes the client sent, and pushes server envelopes back.
//!
//! ```ignore
//! let (dialer, mut peer) = MemoryDialer::new();
//! let connect = tokio::spawn(async move { connector.connect("memory").await });
//! peer.open();
//! peer.control(json!({"i": 1, "t": 2, "v": {}}), json!({"i": 2, "t": 3, "v": {}}));
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use remote_objects_core::{
    Dialer, Incoming, ReadyState, Token, Transport, TransportError, TransportEvent,
    TransportEvents, protocol::{CallEnvelope, CallStatus},
};
use serde_json::Value;
use tokio::sync::mpsc;

/// What the peer does when the client asks to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseBehavior {
    /// Complete the close handshake at once.
    #[default]
    Acknowledge,
    /// Stay in `Closing` until the peer closes explicitly.
    Ignore,
}

struct LinkState {
    ready_state: ReadyState,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    close_behavior: CloseBehavior,
    close_requests: usize,
}

impl LinkState {
    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn finish(&mut self, code: Option<u16>, reason: String, was_clean: bool) {
        self.ready_state = ReadyState::Closed;
        self.emit(TransportEvent::Close {
            code,
            reason,
            was_clean,
        });
        self.events = None;
    }
}

struct Link {
    state: Mutex<LinkState>,
    sent: mpsc::UnboundedSender<Value>,
    /// Events of the first connection, buffered until it is dialed.
    undialed: Mutex<Option<TransportEvents>>,
}

/// Client side of an in-memory connection.
pub struct MemoryTransport {
    link: Arc<Link>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, envelope: Value) -> Result<(), TransportError> {
        let state = self.link.state.lock();
        if state.ready_state != ReadyState::Open {
            return Err(TransportError::NotOpen(state.ready_state));
        }
        self.link
            .sent
            .send(envelope)
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), TransportError> {
        let mut state = self.link.state.lock();
        state.close_requests += 1;
        if state.ready_state == ReadyState::Closed {
            return Ok(());
        }

        match state.close_behavior {
            CloseBehavior::Acknowledge => {
                state.finish(code.or(Some(1000)), reason.unwrap_or_default(), true);
            }
            CloseBehavior::Ignore => state.ready_state = ReadyState::Closing,
        }
        Ok(())
    }

    fn ready_state(&self) -> ReadyState {
        self.link.state.lock().ready_state
    }
}

/// Dialer for in-memory transports.
///
/// The peer may script the first connection before it is dialed. Every
/// later dial replaces the previous connection of the same peer.
#[derive(Clone)]
pub struct MemoryDialer {
    link: Arc<Link>,
}

impl MemoryDialer {
    /// Create a dialer together with the peer that plays the server.
    #[must_use]
    pub fn new() -> (Self, MemoryPeer) {
        let (sent, sent_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            state: Mutex::new(LinkState {
                ready_state: ReadyState::Connecting,
                events: Some(events),
                close_behavior: CloseBehavior::default(),
                close_requests: 0,
            }),
            sent,
            undialed: Mutex::new(Some(events_rx)),
        });

        let peer = MemoryPeer {
            link: Arc::clone(&link),
            sent: sent_rx,
        };
        (Self { link }, peer)
    }
}

impl Dialer for MemoryDialer {
    fn dial(&self, address: &str) -> (Arc<dyn Transport>, TransportEvents) {
        tracing::debug!(address, "Dialing in-memory peer");
        let events_rx = self.link.undialed.lock().take().unwrap_or_else(|| {
            let (events, events_rx) = mpsc::unbounded_channel();
            let mut state = self.link.state.lock();
            state.ready_state = ReadyState::Connecting;
            state.events = Some(events);
            events_rx
        });

        let transport = MemoryTransport {
            link: Arc::clone(&self.link),
        };
        (Arc::new(transport), events_rx)
    }
}

/// Server side of an in-memory connection.
pub struct MemoryPeer {
    link: Arc<Link>,
    sent: mpsc::UnboundedReceiver<Value>,
}

impl MemoryPeer {
    /// Complete the connection.
    pub fn open(&self) {
        let mut state = self.link.state.lock();
        state.ready_state = ReadyState::Open;
        state.emit(TransportEvent::Open);
    }

    /// Deliver a raw envelope to the client.
    pub fn push(&self, envelope: Value) {
        self.link
            .state
            .lock()
            .emit(TransportEvent::Message(envelope));
    }

    /// Deliver a decoded server envelope.
    pub fn send(&self, incoming: &Incoming) {
        self.push(incoming.encode());
    }

    pub fn control(&self, root: Value, root_type: Value) {
        self.send(&Incoming::Control { root, root_type });
    }

    pub fn ack(&self, token: &Token) {
        self.send(&Incoming::Ack {
            token: token.clone(),
        });
    }

    pub fn nack(&self, token: &Token, reason: &str) {
        self.send(&Incoming::Nack {
            token: token.clone(),
            reason: reason.to_string(),
        });
    }

    /// Settle a call successfully.
    pub fn result(&self, token: &Token, data: Value) {
        self.send(&Incoming::Result {
            token: token.clone(),
            status: CallStatus::Success,
            data,
        });
    }

    /// Settle a call with a failure status.
    pub fn fail(&self, token: &Token, data: Value) {
        self.send(&Incoming::Result {
            token: token.clone(),
            status: CallStatus::Failure,
            data,
        });
    }

    pub fn notify(&self, data: Value) {
        self.send(&Incoming::Notification { data });
    }

    /// Report a transport failure without closing.
    pub fn error(&self, reason: &str) {
        self.link
            .state
            .lock()
            .emit(TransportEvent::Error(reason.to_string()));
    }

    /// Close the connection from the server side.
    pub fn close(&self, code: u16, reason: &str) {
        let mut state = self.link.state.lock();
        if state.ready_state != ReadyState::Closed {
            state.finish(Some(code), reason.to_string(), true);
        }
    }

    /// Next envelope sent by the client, raw.
    pub async fn next_envelope(&mut self) -> Option<Value> {
        self.sent.recv().await
    }

    /// Next call sent by the client.
    ///
    /// Returns `None` if the client sent something that is not a call
    /// envelope.
    pub async fn next_call(&mut self) -> Option<CallEnvelope> {
        let envelope = self.sent.recv().await?;
        CallEnvelope::from_value(envelope).ok()
    }

    /// Call envelope already sent, without waiting.
    pub fn try_next_call(&mut self) -> Option<CallEnvelope> {
        let envelope = self.sent.try_recv().ok()?;
        CallEnvelope::from_value(envelope).ok()
    }

    pub fn set_close_behavior(&self, behavior: CloseBehavior) {
        self.link.state.lock().close_behavior = behavior;
    }

    /// Number of close requests issued by the client.
    #[must_use]
    pub fn close_requests(&self) -> usize {
        self.link.state.lock().close_requests
    }

    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.link.state.lock().ready_state
    }
}
