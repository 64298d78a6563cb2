//! Session establishment.

use remote_objects_core::{Dialer, Error, Result, SessionConfig, TransportEvent, TransportEvents};
use tokio::time;

use crate::proxy::ProxyBuilder;
use crate::session::{Readiness, Session};

/// Opens sessions through a dialer.
#[derive(Debug, Clone)]
pub struct Connector<D, B> {
    dialer: D,
    builder: B,
    config: SessionConfig,
}

impl<D, B> Connector<D, B>
where
    D: Dialer,
    B: ProxyBuilder + Clone,
{
    #[must_use]
    pub fn new(dialer: D, builder: B) -> Self {
        Self {
            dialer,
            builder,
            config: SessionConfig::default(),
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a transport to `address` and wait for the root object.
    ///
    /// The transport must open within the handshake deadline and the
    /// control envelope must be resolved within the control deadline.
    ///
    /// No close is requested on failure. The transport handle is dropped,
    /// though, and a transport that owns its connection releases it then.
    /// The WebSocket transport ends its socket with a close handshake.
    ///
    /// # Errors
    /// Returns `HandshakeTimeout`, `ControlTimeout`, or the transport error
    /// that ended the attempt.
    pub async fn connect(&self, address: &str) -> Result<Session<B>> {
        tracing::info!(address, "Connecting");
        let (transport, mut events) = self.dialer.dial(address);

        let handshake = self.config.handshake_timeout;
        time::timeout(handshake, wait_for_open(&mut events))
            .await
            .map_err(|_| Error::HandshakeTimeout(handshake))??;
        tracing::debug!(address, "Transport open");

        let session = Session::start(transport, events, self.builder.clone(), self.config);

        let mut readiness = session.readiness();
        let control = self.config.control_timeout;
        let outcome = time::timeout(
            control,
            readiness.wait_for(|state| *state != Readiness::AwaitingControl),
        )
        .await
        .map_err(|_| Error::ControlTimeout(control))?
        .map(|state| state.clone());

        match outcome {
            Ok(Readiness::Ready) => Ok(session),
            Ok(Readiness::Failed(reason)) => Err(Error::Transport(reason)),
            Ok(Readiness::AwaitingControl) | Err(_) => Err(Error::SessionClosed),
        }
    }
}

async fn wait_for_open(events: &mut TransportEvents) -> Result<()> {
    loop {
        match events.recv().await {
            Some(TransportEvent::Open) => return Ok(()),
            Some(TransportEvent::Error(reason)) => return Err(Error::Transport(reason)),
            Some(TransportEvent::Close { code, reason, .. }) => {
                return Err(Error::Transport(format!(
                    "Connection closed before opening (code {code:?}): {reason}"
                )));
            }
            Some(TransportEvent::Message(_)) => {
                tracing::warn!("Ignoring envelope received before open");
            }
            None => return Err(Error::Transport("Transport event stream ended".into())),
        }
    }
}
