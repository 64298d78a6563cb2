//! Call correlation: token allocation and the per-call state machine.
//!
//! A call moves `AwaitingAck -> AwaitingResult -> settled`, or goes straight
//! from `AwaitingAck` to settled on a NACK. Each phase has its own deadline;
//! the result deadline starts when the ACK arrives.

use parking_lot::Mutex;
use remote_objects_core::{CallSite, Error, ObjectId, Result, Token, protocol::CallEnvelope};
use serde_json::Value;
use tokio::{sync::mpsc, time};

use crate::proxy::ProxyBuilder;
use crate::session::{Shared, State};

/// Phase of a pending call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CallPhase {
    AwaitingAck,
    AwaitingResult,
}

/// Event delivered to a waiting call.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CallEvent {
    Ack,
    Nack(String),
    Success(Value),
    Failure(String),
    /// Transport failure or close.
    Aborted(String),
}

impl CallEvent {
    /// Whether the event is legal for a call in `phase`.
    pub(crate) const fn allowed_in(&self, phase: CallPhase) -> bool {
        match self {
            Self::Ack | Self::Nack(_) => matches!(phase, CallPhase::AwaitingAck),
            Self::Success(_) | Self::Failure(_) => matches!(phase, CallPhase::AwaitingResult),
            Self::Aborted(_) => true,
        }
    }

    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Ack => "ACK",
            Self::Nack(_) => "NACK",
            Self::Success(_) | Self::Failure(_) => "RESULT",
            Self::Aborted(_) => "abort",
        }
    }
}

/// Entry of the pending call table.
pub(crate) struct PendingCall {
    pub(crate) site: CallSite,
    pub(crate) phase: CallPhase,
    events: mpsc::UnboundedSender<CallEvent>,
}

impl PendingCall {
    /// Move to `AwaitingResult`. Returns false if the call was already acknowledged.
    pub(crate) fn acknowledge(&mut self) -> bool {
        if self.phase != CallPhase::AwaitingAck {
            return false;
        }
        self.phase = CallPhase::AwaitingResult;
        let _ = self.events.send(CallEvent::Ack);
        true
    }

    /// Deliver the terminal event. The entry must already be out of the table.
    pub(crate) fn settle(self, event: CallEvent) {
        let _ = self.events.send(event);
    }
}

/// Removes the table entry when the waiting call goes away, whatever the
/// outcome.
struct PendingGuard<'a, P> {
    state: &'a Mutex<State<P>>,
    token: Token,
}

impl<P> Drop for PendingGuard<'_, P> {
    fn drop(&mut self) {
        self.state.lock().pending.remove(&self.token);
    }
}

impl<B: ProxyBuilder> Shared<B> {
    pub(crate) async fn call_raw(
        &self,
        target: Option<ObjectId>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let site = CallSite::new(target, method, args.clone());
        let (events, mut rx) = mpsc::unbounded_channel();

        let token = {
            let mut state = self.state.lock();
            let mut token = Token::generate();
            while state.pending.contains_key(&token) {
                token = Token::generate();
            }
            state.pending.insert(
                token.clone(),
                PendingCall {
                    site: site.clone(),
                    phase: CallPhase::AwaitingAck,
                    events,
                },
            );
            token
        };
        let _guard = PendingGuard {
            state: &self.state,
            token: token.clone(),
        };

        let envelope = CallEnvelope::new(token.clone(), target, method, args).to_value()?;
        tracing::debug!(%token, call = %site, "Sending call");
        if let Err(e) = self.transport.send(envelope).await {
            return Err(Error::CallAborted {
                call: site,
                reason: e.to_string(),
            });
        }

        let mut phase = CallPhase::AwaitingAck;
        loop {
            let deadline = match phase {
                CallPhase::AwaitingAck => self.config.ack_timeout,
                CallPhase::AwaitingResult => self.config.result_timeout,
            };

            let event = match time::timeout(deadline, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(Error::SessionClosed),
                Err(_) => {
                    tracing::warn!(%token, call = %site, ?phase, "Call timed out");
                    return Err(match phase {
                        CallPhase::AwaitingAck => Error::AckTimeout { call: site },
                        CallPhase::AwaitingResult => Error::ResultTimeout { call: site },
                    });
                }
            };

            match event {
                CallEvent::Ack => {
                    tracing::trace!(%token, "Call acknowledged");
                    phase = CallPhase::AwaitingResult;
                }
                CallEvent::Nack(reason) => return Err(Error::Nack { call: site, reason }),
                CallEvent::Success(payload) => return Ok(payload),
                CallEvent::Failure(reason) => {
                    return Err(Error::RemoteFailure { call: site, reason });
                }
                CallEvent::Aborted(reason) => {
                    return Err(Error::CallAborted { call: site, reason });
                }
            }
        }
    }
}
