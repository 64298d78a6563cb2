//! Local proxies for remote objects.
//!
//! A descriptor payload becomes a [`RemoteObject`]: its attributes are
//! exposed as properties, and the attributes of its type become callable
//! methods. Nested descriptors are materialized the same way.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};

use async_trait::async_trait;
use futures::{FutureExt, future::BoxFuture};
use remote_objects_core::{Descriptor, Error, ObjectId, Result};
use serde_json::Value;

use crate::proxy::ProxyBuilder;
use crate::session::{Session, WeakSession};

/// Materialized result, property or notification.
#[derive(Debug, Clone)]
pub enum RemoteValue {
    Object(RemoteObject),
    Value(Value),
}

impl RemoteValue {
    #[must_use]
    pub const fn as_object(&self) -> Option<&RemoteObject> {
        match self {
            Self::Object(object) => Some(object),
            Self::Value(_) => None,
        }
    }

    #[must_use]
    pub const fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Object(_) => None,
            Self::Value(value) => Some(value),
        }
    }

    /// Take the object out.
    ///
    /// # Errors
    /// Returns error if the value is not a remote object.
    pub fn into_object(self) -> Result<RemoteObject> {
        match self {
            Self::Object(object) => Ok(object),
            Self::Value(value) => Err(Error::Proxy(format!("Expected a remote object, got {value}"))),
        }
    }
}

struct Inner {
    id: ObjectId,
    type_id: Option<ObjectId>,
    properties: BTreeMap<String, RemoteValue>,
    methods: BTreeSet<String>,
    session: WeakSession<RemoteObjectBuilder>,
}

/// Proxy for one remote object.
#[derive(Clone)]
pub struct RemoteObject {
    inner: Arc<Inner>,
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("id", &self.inner.id)
            .field("type_id", &self.inner.type_id)
            .field("properties", &self.inner.properties)
            .field("methods", &self.inner.methods)
            .finish_non_exhaustive()
    }
}

impl RemoteObject {
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    #[must_use]
    pub fn type_id(&self) -> Option<ObjectId> {
        self.inner.type_id
    }

    #[must_use]
    pub fn property(&self, name: &str) -> Option<&RemoteValue> {
        self.inner.properties.get(name)
    }

    #[must_use]
    pub fn properties(&self) -> &BTreeMap<String, RemoteValue> {
        &self.inner.properties
    }

    /// Names of the methods exposed by the object's type.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.inner.methods.iter().map(String::as_str)
    }

    #[must_use]
    pub fn has_method(&self, name: &str) -> bool {
        self.inner.methods.contains(name)
    }

    /// Invoke a method on the remote object.
    ///
    /// # Errors
    /// Returns `UnknownMethod` if the object's type does not expose
    /// `method`, `SessionClosed` if the session is gone, or the call failure.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<RemoteValue> {
        if !self.has_method(method) {
            return Err(Error::UnknownMethod {
                id: self.inner.id,
                method: method.to_string(),
            });
        }
        let session = self.inner.session.upgrade().ok_or(Error::SessionClosed)?;
        session.call(Some(self.inner.id), method, args).await
    }
}

/// Builds [`RemoteValue`] proxies.
#[derive(Debug, Default, Clone, Copy)]
pub struct RemoteObjectBuilder;

impl RemoteObjectBuilder {
    fn materialize<'a>(
        session: &'a Session<Self>,
        payload: Value,
        nested: bool,
    ) -> BoxFuture<'a, Result<RemoteValue>> {
        async move {
            let descriptor = if nested {
                Descriptor::nested(&payload)
            } else {
                Descriptor::from_value(&payload)
            };
            let Some(descriptor) = descriptor else {
                return Ok(RemoteValue::Value(payload));
            };

            let methods = session
                .resolve_type_values(&descriptor)
                .await?
                .into_iter()
                .map(|(name, _)| name)
                .collect();

            let mut properties = BTreeMap::new();
            for (name, value) in descriptor.value {
                let value = Self::materialize(session, value, true).await?;
                properties.insert(name, value);
            }

            Ok(RemoteValue::Object(RemoteObject {
                inner: Arc::new(Inner {
                    id: descriptor.id,
                    type_id: descriptor.type_id,
                    properties,
                    methods,
                    session: session.downgrade(),
                }),
            }))
        }
        .boxed()
    }
}

#[async_trait]
impl ProxyBuilder for RemoteObjectBuilder {
    type Proxy = RemoteValue;

    async fn build(&self, session: &Session<Self>, payload: Value) -> Result<RemoteValue> {
        Self::materialize(session, payload, false).await
    }
}
