//! Proxy construction contract.

use async_trait::async_trait;
use remote_objects_core::Result;
use serde_json::Value;

use crate::Session;

/// Builds local proxies from wire payloads.
///
/// Builders may issue further calls through the session, for example to
/// resolve type metadata. A build failure fails the call that produced the
/// payload.
#[async_trait]
pub trait ProxyBuilder: Send + Sync + Sized + 'static {
    /// Local stand-in for a remote value.
    type Proxy: Clone + Send + Sync + 'static;

    /// Build a proxy for one payload.
    async fn build(&self, session: &Session<Self>, payload: Value) -> Result<Self::Proxy>;
}

/// Builder whose proxies are the raw payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct RawPayloads;

#[async_trait]
impl ProxyBuilder for RawPayloads {
    type Proxy = Value;

    async fn build(&self, _session: &Session<Self>, payload: Value) -> Result<Value> {
        Ok(payload)
    }
}
