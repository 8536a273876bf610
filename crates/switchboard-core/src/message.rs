//! Canonical message envelope shared by every transport.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Metadata key under which session-aware transports record the session id.
pub const SESSION_ID_KEY: &str = "session_id";

/// Direction of travel relative to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// From the far end towards applications.
    Inbound,
    /// From applications towards the far end.
    Outbound,
}

/// Session lifecycle tag carried by a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEvent {
    /// First message of a dialog.
    New,
    /// Continuation of an existing dialog.
    Resume,
    /// Final message; the dialog ends after it.
    Close,
    /// Not part of a dialog.
    #[default]
    None,
}

impl SessionEvent {
    /// Whether the message participates in a dialog.
    #[must_use]
    pub const fn is_session(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// The transport-agnostic unit routed over the bus.
///
/// Each processing step takes the message by value and hands it on,
/// so no component holds one beyond its own step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Bus-unique opaque identifier.
    pub message_id: String,
    pub direction: Direction,
    pub from_addr: String,
    pub to_addr: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub session_event: SessionEvent,
    pub transport_name: String,
    #[serde(default)]
    pub transport_type: String,
    /// Arbitrary transport-specific values, e.g. the session id.
    #[serde(default)]
    pub transport_metadata: HashMap<String, Value>,
    /// Id of the message being answered.
    #[serde(default)]
    pub in_reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CanonicalMessage {
    /// Create an inbound message with a fresh id.
    #[must_use]
    pub fn inbound(
        transport_name: impl Into<String>,
        from_addr: impl Into<String>,
        to_addr: impl Into<String>,
        content: Option<String>,
    ) -> Self {
        Self::with_id(
            Uuid::new_v4().to_string(),
            Direction::Inbound,
            transport_name.into(),
            from_addr.into(),
            to_addr.into(),
            content,
        )
    }

    /// Create an outbound message with a fresh id.
    #[must_use]
    pub fn outbound(
        transport_name: impl Into<String>,
        from_addr: impl Into<String>,
        to_addr: impl Into<String>,
        content: Option<String>,
    ) -> Self {
        Self::with_id(
            Uuid::new_v4().to_string(),
            Direction::Outbound,
            transport_name.into(),
            from_addr.into(),
            to_addr.into(),
            content,
        )
    }

    fn with_id(
        message_id: String,
        direction: Direction,
        transport_name: String,
        from_addr: String,
        to_addr: String,
        content: Option<String>,
    ) -> Self {
        Self {
            message_id,
            direction,
            from_addr,
            to_addr,
            content,
            session_event: SessionEvent::None,
            transport_name,
            transport_type: String::new(),
            transport_metadata: HashMap::new(),
            in_reply_to: None,
            timestamp: Utc::now(),
        }
    }

    /// Build the outbound reply to this message, swapping the addresses.
    #[must_use]
    pub fn reply(&self, content: impl Into<String>, session_event: SessionEvent) -> Self {
        let mut reply = Self::outbound(
            self.transport_name.clone(),
            self.to_addr.clone(),
            self.from_addr.clone(),
            Some(content.into()),
        );
        reply.session_event = session_event;
        reply.transport_type.clone_from(&self.transport_type);
        reply.transport_metadata = self.transport_metadata.clone();
        reply.in_reply_to = Some(self.message_id.clone());
        reply
    }

    #[must_use]
    pub fn with_session_event(mut self, session_event: SessionEvent) -> Self {
        self.session_event = session_event;
        self
    }

    #[must_use]
    pub fn with_transport_type(mut self, transport_type: impl Into<String>) -> Self {
        self.transport_type = transport_type.into();
        self
    }

    /// Get a metadata value by key.
    #[must_use]
    pub fn get_metadata(&self, key: &str) -> Option<&Value> {
        self.transport_metadata.get(key)
    }

    /// Get a metadata value as a string slice.
    #[must_use]
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.transport_metadata.get(key).and_then(Value::as_str)
    }

    /// Set a metadata value.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.transport_metadata.insert(key.into(), value.into());
    }

    /// The session id recorded by a session-aware transport.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.metadata_str(SESSION_ID_KEY)
    }
}

/// Acknowledgement correlating an outbound message with the provider's delivery id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEvent {
    /// Id of the outbound message that was delivered.
    pub message_id: String,
    /// Delivery id assigned by the provider.
    pub transport_message_id: String,
    pub transport_name: String,
    pub timestamp: DateTime<Utc>,
}

impl AckEvent {
    #[must_use]
    pub fn new(
        message_id: impl Into<String>,
        transport_message_id: impl Into<String>,
        transport_name: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            transport_message_id: transport_message_id.into(),
            transport_name: transport_name.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Delivery status reported back by a provider after an ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    /// Id of the original outbound message.
    pub message_id: String,
    pub transport_message_id: String,
    pub transport_name: String,
    /// Provider status code, passed through untouched.
    pub status: String,
    pub status_message: String,
    pub network_id: String,
    pub to_addr: String,
    pub timestamp: DateTime<Utc>,
}
