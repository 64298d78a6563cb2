//! Core abstractions for remote object sessions.
//!
//! This crate provides the building blocks shared by sessions and transports:
//! - `protocol` - Wire envelopes, message types, descriptors and tokens
//! - `MetadataCache` - Object roles and cached type descriptors
//! - `SessionConfig` - Per-phase deadlines
//! - Transport traits and the error taxonomy

pub mod config;
pub mod error;
pub mod metadata;
pub mod protocol;
pub mod traits;

pub use config::SessionConfig;
pub use error::{CallSite, Error, Result, TransportError};
pub use metadata::{MetadataCache, ObjectRole, TypeLookup};
pub use protocol::{Attributes, Descriptor, Incoming, MessageType, ObjectId, Token};
pub use traits::{Dialer, ReadyState, Transport, TransportEvent, TransportEvents};
