//! In-process message bus and routing key conventions.

use std::{collections::HashMap, fmt, sync::RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::traits::{BusError, MessageBus, Subscription};

/// Per-key channel capacity.
const CHANNEL_CAPACITY: usize = 1024;

/// Structured routing key: `<direction>.<transport_name>[.<suffix>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Messages from the far end, consumed by applications.
    #[must_use]
    pub fn inbound(transport_name: &str) -> Self {
        Self(format!("inbound.{transport_name}"))
    }

    /// Messages from applications, consumed by the transport.
    #[must_use]
    pub fn outbound(transport_name: &str) -> Self {
        Self(format!("outbound.{transport_name}"))
    }

    /// Delivery acknowledgements.
    #[must_use]
    pub fn ack(transport_name: &str) -> Self {
        Self(format!("ack.{transport_name}"))
    }

    /// Delivery status receipts.
    #[must_use]
    pub fn receipt(transport_name: &str) -> Self {
        Self(format!("receipt.{transport_name}"))
    }

    /// Narrow the key to a target queue.
    #[must_use]
    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.0.push('.');
        self.0.push_str(suffix);
        self
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RoutingKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Broadcast-backed bus for single-process deployments and tests.
///
/// Every subscriber of a key receives every payload published after it
/// subscribed. Payloads published to a key nobody listens on are dropped.
pub struct MemoryBus {
    channels: RwLock<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn sender(&self, routing_key: &str) -> Result<broadcast::Sender<Bytes>, BusError> {
        if let Some(sender) = self
            .channels
            .read()
            .map_err(|e| BusError::Internal(e.to_string()))?
            .get(routing_key)
        {
            return Ok(sender.clone());
        }

        let mut channels = self
            .channels
            .write()
            .map_err(|e| BusError::Internal(e.to_string()))?;
        Ok(channels
            .entry(routing_key.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn publish(&self, routing_key: &str, payload: Bytes) -> Result<(), BusError> {
        let sender = self.sender(routing_key)?;
        if sender.send(payload).is_err() {
            tracing::debug!(routing_key, "No subscribers, payload dropped");
        }
        Ok(())
    }

    async fn subscribe(&self, routing_key: &str) -> Result<Subscription, BusError> {
        let rx = self.sender(routing_key)?.subscribe();
        let key = routing_key.to_string();

        Ok(BroadcastStream::new(rx)
            .filter_map(move |res| {
                let item = match res {
                    Ok(payload) => Some(payload),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        tracing::warn!(routing_key = %key, skipped, "Subscriber lagged");
                        None
                    }
                };
                futures::future::ready(item)
            })
            .boxed())
    }
}
