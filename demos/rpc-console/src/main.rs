//! Console client for a remote object server.
//!
//! Run with: cargo run -p rpc-console -- [URL] [METHOD [JSON_ARGS]]
//!
//! The URL defaults to `$REMOTE_OBJECTS_URL`, then `ws://127.0.0.1:31950`.
//! With a method, it is called on the root object with the given JSON
//! array of arguments. Notifications are printed until Ctrl-C or until the
//! server closes the connection.

use anyhow::{Context, bail};
use remote_objects_session::{
    Connector, RemoteObject, RemoteObjectBuilder, RemoteValue, SessionEvent,
};
use remote_objects_transport::WebSocketDialer;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_URL: &str = "ws://127.0.0.1:31950";

fn describe(value: &RemoteValue) -> String {
    match value {
        RemoteValue::Value(value) => value.to_string(),
        RemoteValue::Object(object) => describe_object(object),
    }
}

fn describe_object(object: &RemoteObject) -> String {
    let type_id = object
        .type_id()
        .map_or_else(|| "?".to_string(), |id| id.to_string());
    let methods: Vec<&str> = object.methods().collect();
    let properties: Vec<String> = object
        .properties()
        .iter()
        .map(|(name, value)| format!("{name}={}", describe(value)))
        .collect();
    format!(
        "<object {} of type {type_id}> methods: [{}] properties: [{}]",
        object.id(),
        methods.join(", "),
        properties.join(", ")
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let url = args
        .next()
        .or_else(|| std::env::var("REMOTE_OBJECTS_URL").ok())
        .unwrap_or_else(|| DEFAULT_URL.to_string());
    let method = args.next();
    let call_args: Vec<Value> = match args.next() {
        Some(raw) => serde_json::from_str(&raw).context("Arguments must be a JSON array")?,
        None => Vec::new(),
    };

    let session = Connector::new(WebSocketDialer, RemoteObjectBuilder)
        .connect(&url)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;

    let Some(RemoteValue::Object(root)) = session.root() else {
        bail!("Server root is not an object");
    };
    println!("root: {}", describe_object(&root));

    if let Some(method) = method {
        let result = root.call(&method, call_args).await?;
        println!("{method}: {}", describe(&result));
    }

    let mut events = session.events();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::Notification(notification)) => {
                    println!("notification: {}", describe(&notification));
                }
                Ok(SessionEvent::Error(reason)) => tracing::warn!("Session error: {reason}"),
                Ok(SessionEvent::Closed { code, reason, .. }) => {
                    tracing::info!(?code, %reason, "Server closed the session");
                    return Ok(());
                }
                Ok(SessionEvent::Ready) => {}
                Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "Dropped notifications"),
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    session.close().await?;
    tracing::info!("Session closed");
    Ok(())
}
