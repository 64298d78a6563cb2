//! Client sessions for remote objects.
//!
//! Provides:
//! - `Connector` - Dial a server and wait for the root object
//! - `Session` - Correlate calls, cache type metadata, deliver notifications
//! - `RemoteObject` - Proxy with properties and callable methods

mod call;
pub mod connector;
pub mod proxy;
pub mod remote_object;
pub mod session;

pub use connector::Connector;
pub use proxy::{ProxyBuilder, RawPayloads};
pub use remote_object::{RemoteObject, RemoteObjectBuilder, RemoteValue};
pub use session::{GET_OBJECT_BY_ID, Readiness, Session, SessionEvent, WeakSession};

/// Session materializing [`RemoteObject`] proxies.
pub type RemoteSession = Session<RemoteObjectBuilder>;
