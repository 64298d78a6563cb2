//! Session: envelope dispatch, metadata caching and teardown.
//!
//! A session owns one transport. A background task reads transport events
//! strictly in arrival order and applies every state transition (pending
//! calls, metadata cache, readiness) synchronously under a single lock, so
//! no asynchronous step can reorder them. Proxy construction for the root
//! object and for notifications happens on a second task, also in order,
//! because builders may need to issue calls of their own.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Weak},
};

use futures::{Stream, StreamExt, future};
use parking_lot::Mutex;
use remote_objects_core::{
    Attributes, Descriptor, Error, Incoming, MetadataCache, ObjectId, ObjectRole, ReadyState,
    Result, SessionConfig, Token, Transport, TransportEvent, TransportEvents, TypeLookup,
    protocol::{CallStatus, reason_text},
};
use serde_json::{Value, json};
use tokio::{
    sync::{OnceCell, broadcast, mpsc, watch},
    task::AbortHandle,
    time,
};
use tokio_stream::wrappers::BroadcastStream;

use crate::call::{CallEvent, PendingCall};
use crate::proxy::ProxyBuilder;

/// Method on the session level dispatcher that returns any object by id.
pub const GET_OBJECT_BY_ID: &str = "get_object_by_id";

const EVENT_CAPACITY: usize = 256;

/// Handshake progress of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Waiting for the control envelope to be resolved.
    AwaitingControl,
    /// Root object available.
    Ready,
    /// A session error happened before the session became ready.
    Failed(String),
}

/// Event broadcast by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent<P> {
    /// The control envelope was resolved into the root proxy.
    Ready,
    /// Server push, already materialized.
    Notification(P),
    /// Transport or session failure.
    Error(String),
    /// The transport closed. No further events follow.
    Closed {
        code: Option<u16>,
        reason: String,
        was_clean: bool,
    },
}

pub(crate) struct State<P> {
    pub(crate) root: Option<P>,
    pub(crate) pending: HashMap<Token, PendingCall>,
    pub(crate) metadata: MetadataCache,
}

enum Materialize {
    Root(Value),
    Notification(Value),
}

pub(crate) struct Shared<B: ProxyBuilder> {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) builder: B,
    pub(crate) config: SessionConfig,
    pub(crate) state: Mutex<State<B::Proxy>>,
    type_fetches: Mutex<HashMap<ObjectId, Arc<OnceCell<Attributes>>>>,
    events: broadcast::Sender<SessionEvent<B::Proxy>>,
    readiness: watch::Sender<Readiness>,
    materialize: mpsc::UnboundedSender<Materialize>,
    tasks: Mutex<Vec<AbortHandle>>,
}

impl<B: ProxyBuilder> Drop for Shared<B> {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Client session over one transport.
///
/// Cheap to clone; all clones share the same connection and state.
pub struct Session<B: ProxyBuilder> {
    shared: Arc<Shared<B>>,
}

impl<B: ProxyBuilder> fmt::Debug for Session<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("ready_state", &self.ready_state())
            .field("readiness", &*self.shared.readiness.borrow())
            .finish_non_exhaustive()
    }
}

impl<B: ProxyBuilder> Clone for Session<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Non-owning session handle, held by proxies.
pub struct WeakSession<B: ProxyBuilder> {
    shared: Weak<Shared<B>>,
}

impl<B: ProxyBuilder> Clone for WeakSession<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Weak::clone(&self.shared),
        }
    }
}

impl<B: ProxyBuilder> WeakSession<B> {
    /// Get the session back, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Session<B>> {
        self.shared.upgrade().map(|shared| Session { shared })
    }
}

impl<B: ProxyBuilder> Session<B> {
    /// Start a session on an open transport.
    ///
    /// Spawns the dispatch task; must be called within a tokio runtime.
    /// The session becomes ready once a control envelope arrives.
    #[must_use]
    pub fn start(
        transport: Arc<dyn Transport>,
        events: TransportEvents,
        builder: B,
        config: SessionConfig,
    ) -> Self {
        let (materialize, jobs) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (readiness, _) = watch::channel(Readiness::AwaitingControl);

        let shared = Arc::new(Shared {
            transport,
            builder,
            config,
            state: Mutex::new(State {
                root: None,
                pending: HashMap::new(),
                metadata: MetadataCache::new(),
            }),
            type_fetches: Mutex::new(HashMap::new()),
            events: events_tx,
            readiness,
            materialize,
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        let dispatch = tokio::spawn(run_dispatch(Arc::downgrade(&shared), events));
        let materializer = tokio::spawn(run_materializer(Arc::downgrade(&shared), jobs));
        shared
            .tasks
            .lock()
            .extend([dispatch.abort_handle(), materializer.abort_handle()]);

        Self { shared }
    }

    /// Invoke a remote method and materialize its result.
    ///
    /// `target` is `None` for calls on the session level dispatcher.
    ///
    /// # Errors
    /// Returns the call failure (ACK or result timeout, NACK, remote
    /// failure, transport error) or the proxy builder's failure.
    pub async fn call(
        &self,
        target: Option<ObjectId>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<B::Proxy> {
        let payload = self.call_raw(target, method, args).await?;
        self.shared.builder.build(self, payload).await
    }

    /// Invoke a remote method and return the raw result payload.
    ///
    /// # Errors
    /// Returns the call failure.
    pub async fn call_raw(
        &self,
        target: Option<ObjectId>,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.shared.call_raw(target, method, args).await
    }

    /// Attribute mapping of an instance's type.
    ///
    /// Answered from the metadata cache when possible; otherwise the type
    /// descriptor is fetched once with `get_object_by_id`, and concurrent
    /// requests for the same type share that fetch.
    ///
    /// # Errors
    /// Returns the failure of the descriptor fetch.
    pub async fn resolve_type_values(&self, instance: &Descriptor) -> Result<Attributes> {
        let lookup = self.shared.state.lock().metadata.lookup(instance);
        let type_id = match lookup {
            TypeLookup::Resolved(values) => return Ok(values),
            TypeLookup::Fetch(type_id) => type_id,
        };

        let fetch = Arc::clone(self.shared.type_fetches.lock().entry(type_id).or_default());
        let values = fetch
            .get_or_try_init(|| async {
                tracing::debug!(%type_id, "Fetching type descriptor");
                let payload = self
                    .call_raw(None, GET_OBJECT_BY_ID, vec![json!(type_id)])
                    .await?;
                Ok::<_, Error>(
                    Descriptor::from_value(&payload)
                        .map(|descriptor| descriptor.value)
                        .unwrap_or_default(),
                )
            })
            .await
            .cloned();

        let mut fetches = self.shared.type_fetches.lock();
        if fetches.get(&type_id).is_some_and(|cell| Arc::ptr_eq(cell, &fetch)) {
            fetches.remove(&type_id);
        }
        values
    }

    /// Close the transport.
    ///
    /// Resolves immediately if the transport is already closed. Pending
    /// calls are failed by the resulting close event.
    ///
    /// # Errors
    /// Returns `CloseTimeout` if the transport does not close in time, or
    /// the transport error reported while closing.
    pub async fn close(&self) -> Result<()> {
        let transport = &self.shared.transport;
        if transport.ready_state() == ReadyState::Closed {
            return Ok(());
        }

        let mut events = self.shared.events.subscribe();
        if transport.ready_state() == ReadyState::Closed {
            return Ok(());
        }

        transport.close(None, None).await?;

        let timeout = self.shared.config.close_timeout;
        let outcome = time::timeout(timeout, async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Closed { .. }) | Err(broadcast::error::RecvError::Closed) => {
                        return None;
                    }
                    Ok(SessionEvent::Error(reason)) => return Some(reason),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                }
            }
        })
        .await;

        match outcome {
            Err(_) => Err(Error::CloseTimeout(timeout)),
            Ok(_) if transport.ready_state() == ReadyState::Closed => Ok(()),
            Ok(Some(reason)) => Err(Error::Transport(reason)),
            Ok(None) => Err(Error::Transport("Transport is not closed".to_string())),
        }
    }

    /// Root proxy, once the control envelope has been resolved.
    #[must_use]
    pub fn root(&self) -> Option<B::Proxy> {
        self.shared.state.lock().root.clone()
    }

    /// Whether the root proxy is available.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        *self.shared.readiness.borrow() == Readiness::Ready
    }

    /// Watch the handshake progress.
    #[must_use]
    pub fn readiness(&self) -> watch::Receiver<Readiness> {
        self.shared.readiness.subscribe()
    }

    /// Subscribe to session events.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<SessionEvent<B::Proxy>> {
        self.shared.events.subscribe()
    }

    /// Stream of notification proxies, in arrival order.
    #[must_use]
    pub fn notifications(&self) -> impl Stream<Item = B::Proxy> + Send + 'static {
        BroadcastStream::new(self.shared.events.subscribe()).filter_map(|event| {
            future::ready(match event {
                Ok(SessionEvent::Notification(proxy)) => Some(proxy),
                _ => None,
            })
        })
    }

    /// Number of calls still waiting for settlement.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Transport connection state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.shared.transport.ready_state()
    }

    /// Role learned for an object id.
    #[must_use]
    pub fn role_of(&self, id: ObjectId) -> Option<ObjectRole> {
        self.shared.state.lock().metadata.role(id)
    }

    /// Cached type descriptor.
    #[must_use]
    pub fn cached_type(&self, id: ObjectId) -> Option<Descriptor> {
        self.shared.state.lock().metadata.type_payload(id).cloned()
    }

    /// Deadlines used by this session.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Non-owning handle to this session.
    #[must_use]
    pub fn downgrade(&self) -> WeakSession<B> {
        WeakSession {
            shared: Arc::downgrade(&self.shared),
        }
    }
}

impl<B: ProxyBuilder> Shared<B> {
    fn dispatch(&self, envelope: Value) {
        let incoming = match Incoming::decode(envelope) {
            Ok(incoming) => incoming,
            Err(e) => {
                tracing::warn!("Ignoring envelope: {e}");
                return;
            }
        };

        match incoming {
            Incoming::Control { root, root_type } => {
                tracing::debug!("Received control envelope");
                {
                    let mut state = self.state.lock();
                    state.metadata.ingest(&root);
                    state.metadata.ingest(&root_type);
                }
                let _ = self.materialize.send(Materialize::Root(root));
            }
            Incoming::Result {
                token,
                status: CallStatus::Success,
                data,
            } => {
                self.state.lock().metadata.ingest(&data);
                self.settle(&token, CallEvent::Success(data));
            }
            Incoming::Result {
                token,
                status: CallStatus::Failure,
                data,
            } => self.settle(&token, CallEvent::Failure(reason_text(&data))),
            Incoming::Ack { token } => self.acknowledge(&token),
            Incoming::Nack { token, reason } => self.settle(&token, CallEvent::Nack(reason)),
            Incoming::Notification { data } => {
                self.state.lock().metadata.ingest(&data);
                let _ = self.materialize.send(Materialize::Notification(data));
            }
            Incoming::Unrecognized { kind } => {
                tracing::debug!(?kind, "Ignoring unrecognized envelope");
            }
        }
    }

    fn acknowledge(&self, token: &Token) {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.get_mut(token) else {
            tracing::warn!(%token, "Ignoring ACK for unknown call");
            return;
        };
        if !pending.acknowledge() {
            tracing::warn!(%token, call = %pending.site, "Ignoring repeated ACK");
        }
    }

    fn settle(&self, token: &Token, event: CallEvent) {
        let mut state = self.state.lock();
        let Some(pending) = state.pending.get(token) else {
            tracing::warn!(%token, "Ignoring {} for unknown call", event.name());
            return;
        };
        if !event.allowed_in(pending.phase) {
            tracing::warn!(
                %token,
                call = %pending.site,
                phase = ?pending.phase,
                "Ignoring out of phase {}",
                event.name()
            );
            return;
        }
        let removed = state.pending.remove(token);
        drop(state);
        if let Some(pending) = removed {
            pending.settle(event);
        }
    }

    fn abort_pending(&self, reason: &str) {
        let aborted: Vec<PendingCall> = self.state.lock().pending.drain().map(|(_, p)| p).collect();
        for pending in aborted {
            pending.settle(CallEvent::Aborted(reason.to_string()));
        }
    }

    fn fail_handshake(&self, reason: &str) {
        self.readiness.send_if_modified(|readiness| {
            if *readiness == Readiness::AwaitingControl {
                *readiness = Readiness::Failed(reason.to_string());
                true
            } else {
                false
            }
        });
    }

    fn handle_error(&self, reason: String) {
        tracing::error!("Transport error: {reason}");
        self.abort_pending(&reason);
        self.fail_handshake(&reason);
        let _ = self.events.send(SessionEvent::Error(reason));
    }

    fn handle_close(&self, code: Option<u16>, reason: String, was_clean: bool) {
        tracing::info!(?code, %reason, was_clean, "Session transport closed");
        let message = match code {
            Some(code) => format!("Connection closed with code {code}"),
            None => "Connection closed".to_string(),
        };
        self.abort_pending(&message);
        self.fail_handshake(&message);
        let _ = self.events.send(SessionEvent::Closed {
            code,
            reason,
            was_clean,
        });
    }
}

async fn run_dispatch<B: ProxyBuilder>(shared: Weak<Shared<B>>, mut events: TransportEvents) {
    loop {
        let event = events.recv().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match event {
            Some(TransportEvent::Message(envelope)) => {
                tracing::trace!(%envelope, "Received envelope");
                shared.dispatch(envelope);
            }
            Some(TransportEvent::Error(reason)) => shared.handle_error(reason),
            Some(TransportEvent::Close {
                code,
                reason,
                was_clean,
            }) => {
                shared.handle_close(code, reason, was_clean);
                break;
            }
            Some(TransportEvent::Open) => tracing::debug!("Ignoring repeated open event"),
            None => {
                shared.handle_close(None, "Transport event stream ended".to_string(), false);
                break;
            }
        }
    }
    tracing::debug!("Session dispatch loop ended");
}

async fn run_materializer<B: ProxyBuilder>(
    shared: Weak<Shared<B>>,
    mut jobs: mpsc::UnboundedReceiver<Materialize>,
) {
    while let Some(job) = jobs.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let session = Session { shared };

        match job {
            Materialize::Root(payload) => {
                match session.shared.builder.build(&session, payload).await {
                    Ok(root) => {
                        session.shared.state.lock().root = Some(root);
                        session.shared.readiness.send_replace(Readiness::Ready);
                        let _ = session.shared.events.send(SessionEvent::Ready);
                        tracing::info!("Session ready");
                    }
                    Err(e) => {
                        let reason = format!("Failed to resolve root object: {e}");
                        tracing::error!("{reason}");
                        session.shared.fail_handshake(&reason);
                        let _ = session.shared.events.send(SessionEvent::Error(reason));
                    }
                }
            }
            Materialize::Notification(payload) => {
                match session.shared.builder.build(&session, payload).await {
                    Ok(proxy) => {
                        let _ = session.shared.events.send(SessionEvent::Notification(proxy));
                    }
                    Err(e) => tracing::error!("Failed to resolve notification: {e}"),
                }
            }
        }
    }
}
