//! Core traits for the message bus and durable object storage.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Stream of payloads delivered to one subscriber.
pub type Subscription = BoxStream<'static, Bytes>;

/// Bus error.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Bus closed")]
    Closed,
    #[error("Bus error: {0}")]
    Internal(String),
}

/// Publish/subscribe capability.
///
/// Routing keys are opaque to implementations; see [`crate::RoutingKey`]
/// for the structure transports use.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publish a payload under a routing key.
    async fn publish(&self, routing_key: &str, payload: Bytes) -> Result<(), BusError>;

    /// Subscribe to every payload published under `routing_key` from now on.
    async fn subscribe(&self, routing_key: &str) -> Result<Subscription, BusError>;
}

/// Publish a value as JSON.
///
/// # Errors
/// Returns error if serialization or publishing fails.
pub async fn publish_json<B, T>(bus: &B, routing_key: &str, value: &T) -> Result<(), BusError>
where
    B: MessageBus + ?Sized,
    T: Serialize + Sync,
{
    let payload = serde_json::to_vec(value)?;
    bus.publish(routing_key, Bytes::from(payload)).await
}

/// Decode a JSON payload received from a subscription.
///
/// # Errors
/// Returns error if the payload is not a valid `T`.
pub fn decode_json<T: DeserializeOwned>(payload: &[u8]) -> Result<T, BusError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Run `handler` for every JSON payload under `routing_key`.
///
/// The subscription is in place when this returns. Payloads that do not
/// decode as `T` are logged and skipped. Handlers run one at a time in
/// arrival order.
///
/// # Errors
/// Returns error if the subscription cannot be created.
pub async fn consume<B, T, F, Fut>(
    bus: &B,
    routing_key: &str,
    handler: F,
) -> Result<JoinHandle<()>, BusError>
where
    B: MessageBus + ?Sized,
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    use futures::StreamExt;

    let mut subscription = bus.subscribe(routing_key).await?;
    let routing_key = routing_key.to_string();
    Ok(tokio::spawn(async move {
        while let Some(payload) = subscription.next().await {
            match decode_json::<T>(&payload) {
                Ok(value) => handler(value).await,
                Err(e) => tracing::warn!(routing_key = %routing_key, "Dropping payload: {e}"),
            }
        }
    }))
}

/// Object store error.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable bucket/key document storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store a document, replacing any previous value.
    async fn store(&self, bucket: &str, key: &str, value: Value) -> Result<(), ObjectStoreError>;

    /// Load a document.
    async fn load(&self, bucket: &str, key: &str) -> Result<Value, ObjectStoreError>;

    /// Delete every document in buckets owned by this store.
    ///
    /// Returns the number of documents removed.
    async fn purge_all(&self) -> Result<usize, ObjectStoreError>;
}
