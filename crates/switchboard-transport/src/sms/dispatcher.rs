//! Outbound SMS delivery with acknowledgement correlation.

use std::sync::Arc;

use reqwest::header::USER_AGENT;
use serde_json::Value;
use switchboard_core::{
    AckEvent, BusError, CanonicalMessage, MessageBus, RoutingKey, traits::publish_json,
};

use super::{
    SmsConfig,
    charset::{CharsetPolicy, EncodingError, validate_characters},
};

/// Response header carrying the provider's delivery id.
pub const SMS_ID_HEADER: &str = "X-VAS2Nets-SmsId";

/// Dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),
    #[error("No X-VAS2Nets-SmsId header for message {message_id}, content: {body}")]
    Delivery { message_id: String, body: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Result of a successful delivery.
#[derive(Debug, Clone)]
pub struct Delivered {
    /// The acknowledgement that was published.
    pub ack: AckEvent,
    /// Length policy implied by the content.
    pub policy: CharsetPolicy,
}

/// Posts outbound messages to the provider and publishes acks.
#[derive(Clone)]
pub struct OutboundDispatcher {
    client: reqwest::Client,
    config: Arc<SmsConfig>,
    bus: Arc<dyn MessageBus>,
    ack_key: RoutingKey,
}

impl OutboundDispatcher {
    /// Create a dispatcher.
    ///
    /// # Errors
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: Arc<SmsConfig>, bus: Arc<dyn MessageBus>) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        let ack_key = RoutingKey::ack(&config.transport_name);
        Ok(Self {
            client,
            config,
            bus,
            ack_key,
        })
    }

    /// Form parameters for the remote call, credentials included.
    fn request_params(&self, message: &CanonicalMessage, text: &str) -> Vec<(&'static str, String)> {
        let config = &self.config;
        let message_id = message
            .in_reply_to
            .clone()
            .unwrap_or_else(|| message.message_id.clone());
        let provider = message.metadata_str("network_id").unwrap_or_default();
        let tariff = match message.get_metadata("tariff") {
            Some(Value::String(tariff)) => tariff.clone(),
            Some(tariff) => tariff.to_string(),
            None => "0".to_string(),
        };

        vec![
            ("username", config.username.clone()),
            ("password", config.password.clone()),
            ("owner", config.owner.clone()),
            ("service", config.service.clone()),
            ("subservice", config.subservice.clone()),
            ("call-number", message.to_addr.clone()),
            ("origin", message.from_addr.clone()),
            ("messageid", message_id),
            ("provider", provider.to_string()),
            ("tariff", tariff),
            ("text", text.to_string()),
        ]
    }

    /// Deliver one message and publish its acknowledgement.
    ///
    /// Nothing is retried here; redelivery is up to the bus.
    ///
    /// # Errors
    /// - `Encoding` if the content has an illegal character; no remote
    ///   call is made.
    /// - `Delivery` if the provider answered without a delivery id; no
    ///   ack is published.
    /// - `Http` / `Bus` for transport failures.
    pub async fn dispatch(&self, message: &CanonicalMessage) -> Result<Delivered, DispatchError> {
        let text = message.content.as_deref().unwrap_or_default();
        let policy = validate_characters(text)?;
        if policy.is_reduced() {
            tracing::warn!(
                message_id = %message.message_id,
                "Double-width characters, max SMS length is {} chars",
                policy.max_length()
            );
        }

        let response = self
            .client
            .post(&self.config.url)
            .header(USER_AGENT, &self.config.user_agent)
            .form(&self.request_params(message, text))
            .send()
            .await?;

        let delivery_id = response
            .headers()
            .get(SMS_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        let Some(delivery_id) = delivery_id else {
            return Err(DispatchError::Delivery {
                message_id: message.message_id.clone(),
                body,
            });
        };

        let ack = AckEvent::new(
            message.message_id.clone(),
            delivery_id,
            self.config.transport_name.clone(),
        );
        publish_json(self.bus.as_ref(), self.ack_key.as_str(), &ack).await?;
        tracing::info!(
            message_id = %ack.message_id,
            transport_message_id = %ack.transport_message_id,
            "Message delivered"
        );

        Ok(Delivered { ack, policy })
    }
}
