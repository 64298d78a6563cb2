//! Transports for remote object sessions.
//!
//! Provides:
//! - In-memory transport with a scriptable server side
//! - WebSocket dialer (feature: websocket)

pub mod memory;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use memory::{CloseBehavior, MemoryDialer, MemoryPeer, MemoryTransport};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketDialer, WebSocketTransport};
