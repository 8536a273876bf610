//! Bus wiring shared by all transports.
//!
//! Inbound messages go through the middleware stack and out to
//! `inbound.<name>`. Outbound messages are consumed from `outbound.<name>`,
//! run through the same stack, and handed to the transport, one task per
//! message.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;
use switchboard_core::{
    BusError, CanonicalMessage, DEFAULT_ENDPOINT, MessageBus, MiddlewareStack, RoutingKey,
    traits::{decode_json, publish_json},
};
use tokio::task::{JoinHandle, JoinSet};

use crate::TransportError;

/// A protocol adapter between wire traffic and canonical messages.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Transport name, used in routing keys.
    fn name(&self) -> &str;

    /// HTTP routes for this transport's wire endpoints.
    fn router(self: Arc<Self>) -> Router;

    /// Deliver an outbound message that already passed the middleware stack.
    async fn handle_outbound(&self, message: CanonicalMessage) -> Result<(), TransportError>;

    /// Release background resources.
    async fn shutdown(&self) {}
}

/// Publishes decoded inbound messages through the middleware stack.
#[derive(Clone)]
pub struct InboundPublisher {
    bus: Arc<dyn MessageBus>,
    pipeline: MiddlewareStack,
    routing_key: RoutingKey,
}

impl InboundPublisher {
    /// Create a publisher for one transport.
    #[must_use]
    pub fn new(bus: Arc<dyn MessageBus>, pipeline: MiddlewareStack, transport_name: &str) -> Self {
        Self {
            bus,
            pipeline,
            routing_key: RoutingKey::inbound(transport_name),
        }
    }

    /// Apply the inbound stack and publish.
    ///
    /// Returns the message as published.
    ///
    /// # Errors
    /// Returns error if a middleware stage fails (nothing is published)
    /// or the bus rejects the payload.
    pub async fn publish(
        &self,
        message: CanonicalMessage,
    ) -> Result<CanonicalMessage, TransportError> {
        let message = self.pipeline.apply_inbound(message, DEFAULT_ENDPOINT).await?;
        publish_json(self.bus.as_ref(), self.routing_key.as_str(), &message).await?;
        tracing::debug!(
            message_id = %message.message_id,
            routing_key = %self.routing_key,
            "Published inbound message"
        );
        Ok(message)
    }

    /// Publish an event that bypasses the middleware stack.
    ///
    /// # Errors
    /// Returns error if the bus rejects the payload.
    pub async fn publish_event<T>(&self, routing_key: &RoutingKey, event: &T) -> Result<(), BusError>
    where
        T: Serialize + Sync,
    {
        publish_json(self.bus.as_ref(), routing_key.as_str(), event).await
    }
}

/// Consumes `outbound.<name>` and feeds messages to a transport.
pub struct OutboundWorker;

impl OutboundWorker {
    /// Subscribe and start consuming.
    ///
    /// The subscription is in place when this returns, so nothing
    /// published afterwards is missed. Aborting the returned handle also
    /// aborts any messages still in flight.
    ///
    /// # Errors
    /// Returns error if the subscription cannot be created.
    pub async fn spawn<T>(
        transport: Arc<T>,
        bus: Arc<dyn MessageBus>,
        pipeline: MiddlewareStack,
    ) -> Result<JoinHandle<()>, BusError>
    where
        T: Transport + ?Sized,
    {
        let routing_key = RoutingKey::outbound(transport.name());
        let mut subscription = bus.subscribe(routing_key.as_str()).await?;
        tracing::info!(routing_key = %routing_key, "Consuming outbound messages");

        Ok(tokio::spawn(async move {
            let mut in_flight = JoinSet::new();
            loop {
                tokio::select! {
                    next = subscription.next() => {
                        let Some(payload) = next else { break };
                        let transport = Arc::clone(&transport);
                        let pipeline = pipeline.clone();
                        in_flight.spawn(async move {
                            if let Err(e) = process(transport.as_ref(), &pipeline, &payload).await {
                                tracing::error!(
                                    transport = transport.name(),
                                    "Outbound message failed: {e}"
                                );
                            }
                        });
                    }
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(e) = joined {
                            tracing::error!("Outbound task panicked: {e}");
                        }
                    }
                }
            }
            while in_flight.join_next().await.is_some() {}
        }))
    }
}

async fn process<T>(
    transport: &T,
    pipeline: &MiddlewareStack,
    payload: &Bytes,
) -> Result<(), TransportError>
where
    T: Transport + ?Sized,
{
    let message: CanonicalMessage = decode_json(payload)?;
    let message = pipeline.apply_outbound(message, DEFAULT_ENDPOINT).await?;
    transport.handle_outbound(message).await
}
