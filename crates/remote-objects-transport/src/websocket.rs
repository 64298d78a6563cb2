//! WebSocket transport.
//!
//! Each dial spawns one socket task that owns the connection. Envelopes are
//! exchanged as JSON text frames; binary frames holding UTF-8 JSON are
//! accepted too.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use remote_objects_core::{
    Dialer, ReadyState, Transport, TransportError, TransportEvent, TransportEvents,
    config::CLOSE_TIMEOUT,
};
use serde_json::Value;
use tokio::{sync::mpsc, time};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

enum Outgoing {
    Frame(String),
    Close { code: Option<u16>, reason: String },
}

/// Dials `ws://` addresses.
///
/// TLS is not compiled in: `wss://` addresses fail with an `Error` event
/// followed by `Close`. Must be used within a tokio runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketDialer;

impl Dialer for WebSocketDialer {
    fn dial(&self, address: &str) -> (Arc<dyn Transport>, TransportEvents) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AtomicU8::new(ReadyState::Connecting as u8));

        tokio::spawn(run_socket(
            address.to_string(),
            Arc::clone(&state),
            outgoing_rx,
            events,
        ));

        let transport = WebSocketTransport { state, outgoing };
        (Arc::new(transport), events_rx)
    }
}

/// Client side of a WebSocket connection.
///
/// Dropping the last handle ends the connection: the socket task sends a
/// close frame and waits for the reply before exiting.
pub struct WebSocketTransport {
    state: Arc<AtomicU8>,
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&self, envelope: Value) -> Result<(), TransportError> {
        let state = self.ready_state();
        if state != ReadyState::Open {
            return Err(TransportError::NotOpen(state));
        }
        let text = serde_json::to_string(&envelope)?;
        self.outgoing
            .send(Outgoing::Frame(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self, code: Option<u16>, reason: Option<String>) -> Result<(), TransportError> {
        if matches!(self.ready_state(), ReadyState::Closing | ReadyState::Closed) {
            return Ok(());
        }
        self.state.store(ReadyState::Closing as u8, Ordering::SeqCst);
        self.outgoing
            .send(Outgoing::Close {
                code,
                reason: reason.unwrap_or_default(),
            })
            .map_err(|_| TransportError::Closed)
    }

    fn ready_state(&self) -> ReadyState {
        ReadyState::from_u8(self.state.load(Ordering::SeqCst))
    }
}

/// Read until the peer ends the stream, flushing any queued close reply.
///
/// Returns false if the stream failed or did not end in time.
async fn drain<S>(stream: &mut S) -> bool
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let ended = time::timeout(CLOSE_TIMEOUT, async {
        while let Some(frame) = stream.next().await {
            if let Err(e) = frame {
                tracing::debug!("WebSocket error while closing: {e}");
                return false;
            }
        }
        true
    })
    .await;
    ended.unwrap_or(false)
}

fn deliver(events: &mpsc::UnboundedSender<TransportEvent>, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(envelope) => {
            let _ = events.send(TransportEvent::Message(envelope));
        }
        Err(e) => tracing::warn!("Dropping malformed frame: {e}"),
    }
}

async fn run_socket(
    address: String,
    state: Arc<AtomicU8>,
    mut outgoing: mpsc::UnboundedReceiver<Outgoing>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let socket = match connect_async(address.as_str()).await {
        Ok((socket, _response)) => socket,
        Err(e) => {
            tracing::error!(%address, "WebSocket connect failed: {e}");
            state.store(ReadyState::Closed as u8, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Error(e.to_string()));
            let _ = events.send(TransportEvent::Close {
                code: None,
                reason: e.to_string(),
                was_clean: false,
            });
            return;
        }
    };

    // A close requested while connecting keeps the Closing state.
    let _ = state.compare_exchange(
        ReadyState::Connecting as u8,
        ReadyState::Open as u8,
        Ordering::SeqCst,
        Ordering::SeqCst,
    );
    tracing::debug!(%address, "WebSocket open");
    let _ = events.send(TransportEvent::Open);

    let (mut sink, mut stream) = socket.split();

    let (code, reason, was_clean) = loop {
        tokio::select! {
            request = outgoing.recv() => match request {
                Some(Outgoing::Frame(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break (None, e.to_string(), false);
                    }
                }
                Some(Outgoing::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: code.map_or(CloseCode::Normal, CloseCode::from),
                        reason: reason.into(),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break (None, e.to_string(), false);
                    }
                }
                None => {
                    let sent = sink.send(Message::Close(None)).await.is_ok();
                    break (None, "Transport dropped".to_string(), sent);
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => deliver(&events, text.as_str()),
                Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                    Ok(text) => deliver(&events, text),
                    Err(_) => tracing::warn!("Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((None, String::new()), |frame| {
                        (Some(u16::from(frame.code)), frame.reason.to_string())
                    });
                    break (code, reason, true);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!(%address, "WebSocket error: {e}");
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    break (None, e.to_string(), false);
                }
                None => break (None, String::new(), false),
            },
        }
    };

    // Only clean if the close reply went out and the peer ended the stream.
    let was_clean = was_clean && drain(&mut stream).await;

    state.store(ReadyState::Closed as u8, Ordering::SeqCst);
    tracing::debug!(%address, ?code, was_clean, "WebSocket closed");
    let _ = events.send(TransportEvent::Close {
        code,
        reason,
        was_clean,
    });
}
