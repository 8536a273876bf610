//! SMS transport: form-post receive and receipt endpoints plus outbound
//! delivery through an HTTP provider.

pub mod charset;
pub mod dispatcher;

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Form, Router,
    extract::State,
    http::{StatusCode, header::CONTENT_TYPE},
    response::IntoResponse,
    routing::post,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_core::{CanonicalMessage, DeliveryReport, MessageBus, MiddlewareStack, RoutingKey};

use crate::{InboundPublisher, Transport, TransportError};

pub use charset::{CharsetPolicy, EncodingError, validate_characters};
pub use dispatcher::{Delivered, DispatchError, OutboundDispatcher, SMS_ID_HEADER};

/// Timestamp layout used by the provider.
const PROVIDER_TIME_FORMAT: &str = "%Y.%m.%d %H:%M:%S";

/// SMS transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmsConfig {
    pub transport_name: String,
    pub transport_type: String,
    /// Provider endpoint for outbound messages.
    pub url: String,
    pub username: String,
    pub password: String,
    pub owner: String,
    pub service: String,
    pub subservice: String,
    pub receive_path: String,
    pub receipt_path: String,
    pub user_agent: String,
    /// Remote call timeout in seconds.
    pub request_timeout: u64,
}

impl Default for SmsConfig {
    fn default() -> Self {
        Self {
            transport_name: "sms".to_string(),
            transport_type: "sms".to_string(),
            url: String::new(),
            username: String::new(),
            password: String::new(),
            owner: String::new(),
            service: String::new(),
            subservice: String::new(),
            receive_path: "/sms/receive".to_string(),
            receipt_path: "/sms/receipt".to_string(),
            user_agent: "Switchboard SMS Transport".to_string(),
            request_timeout: 30,
        }
    }
}

impl SmsConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Normalize an MSISDN to international `+` form.
#[must_use]
pub fn normalize_msisdn(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !matches!(c, '-' | '(' | ')'))
        .collect();

    if cleaned.starts_with('+') {
        cleaned
    } else if let Some(rest) = cleaned.strip_prefix("00") {
        format!("+{rest}")
    } else if !cleaned.is_empty() && cleaned.chars().all(|c| c.is_ascii_digit()) {
        format!("+{cleaned}")
    } else {
        cleaned
    }
}

/// Parse a provider timestamp, taken to be UTC.
///
/// # Errors
/// Returns `MalformedRequest` if the value does not match the provider layout.
pub fn parse_provider_time(raw: &str) -> Result<DateTime<Utc>, TransportError> {
    NaiveDateTime::parse_from_str(raw, PROVIDER_TIME_FORMAT)
        .map(|ts| ts.and_utc())
        .map_err(|e| TransportError::MalformedRequest(format!("Invalid time '{raw}': {e}")))
}

struct FormFields(HashMap<String, String>);

impl FormFields {
    fn required(&self, key: &str) -> Result<&str, TransportError> {
        self.0
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| TransportError::missing_field(key))
    }
}

/// Form-post SMS transport.
pub struct SmsTransport {
    config: Arc<SmsConfig>,
    publisher: InboundPublisher,
    dispatcher: OutboundDispatcher,
    receipt_key: RoutingKey,
}

impl SmsTransport {
    /// Create the transport.
    ///
    /// # Errors
    /// Returns error if the outbound HTTP client cannot be built.
    pub fn new(
        config: SmsConfig,
        bus: Arc<dyn MessageBus>,
        pipeline: MiddlewareStack,
    ) -> Result<Self, DispatchError> {
        let config = Arc::new(config);
        let publisher = InboundPublisher::new(Arc::clone(&bus), pipeline, &config.transport_name);
        let dispatcher = OutboundDispatcher::new(Arc::clone(&config), bus)?;
        let receipt_key = RoutingKey::receipt(&config.transport_name);
        Ok(Self {
            config,
            publisher,
            dispatcher,
            receipt_key,
        })
    }

    #[must_use]
    pub fn config(&self) -> &SmsConfig {
        &self.config
    }

    /// Decode a receive-endpoint form into a canonical message.
    fn decode_inbound(&self, fields: &FormFields) -> Result<CanonicalMessage, TransportError> {
        let transport_message_id = fields.required("messageid")?;
        let timestamp = parse_provider_time(fields.required("time")?)?;
        let network_id = fields.required("provider")?;
        let keyword = fields.required("keyword")?;
        let to_addr = normalize_msisdn(fields.required("destination")?);
        let from_addr = normalize_msisdn(fields.required("sender")?);
        let text = fields.required("text")?;

        let mut message = CanonicalMessage::inbound(
            self.config.transport_name.clone(),
            from_addr,
            to_addr,
            Some(text.to_string()),
        )
        .with_transport_type(self.config.transport_type.clone());
        message.timestamp = timestamp;
        message.set_metadata("transport_message_id", transport_message_id);
        message.set_metadata("network_id", network_id);
        message.set_metadata("keyword", keyword);
        message.set_metadata("transport_timestamp", timestamp.to_rfc3339());
        Ok(message)
    }

    /// Decode a receipt-endpoint form into a delivery report.
    fn decode_receipt(&self, fields: &FormFields) -> Result<DeliveryReport, TransportError> {
        Ok(DeliveryReport {
            transport_message_id: fields.required("smsid")?.to_string(),
            status: fields.required("status")?.to_string(),
            status_message: fields.required("text")?.to_string(),
            timestamp: parse_provider_time(fields.required("time")?)?,
            network_id: fields.required("provider")?.to_string(),
            to_addr: normalize_msisdn(fields.required("sender")?),
            message_id: fields.required("messageid")?.to_string(),
            transport_name: self.config.transport_name.clone(),
        })
    }

    /// Handle a mobile-originated message.
    ///
    /// # Errors
    /// Returns `MalformedRequest` for missing fields; nothing is published.
    pub async fn receive(&self, form: HashMap<String, String>) -> Result<(), TransportError> {
        let message = self.decode_inbound(&FormFields(form))?;
        let message = self.publisher.publish(message).await?;
        tracing::info!(message_id = %message.message_id, "Received SMS");
        Ok(())
    }

    /// Deliver an outbound message and report the length policy its
    /// content was sent under.
    ///
    /// # Errors
    /// Returns `Dispatch` if the provider call fails or the content has an
    /// illegal character.
    pub async fn send(&self, message: &CanonicalMessage) -> Result<Delivered, TransportError> {
        let delivered = self.dispatcher.dispatch(message).await?;
        tracing::debug!(
            message_id = %message.message_id,
            policy = ?delivered.policy,
            max_length = delivered.policy.max_length(),
            "Sent SMS"
        );
        Ok(delivered)
    }

    /// Handle a delivery status callback.
    ///
    /// # Errors
    /// Returns `MalformedRequest` for missing fields; nothing is published.
    pub async fn receipt(&self, form: HashMap<String, String>) -> Result<(), TransportError> {
        let report = self.decode_receipt(&FormFields(form))?;
        self.publisher
            .publish_event(&self.receipt_key, &report)
            .await?;
        tracing::info!(
            message_id = %report.message_id,
            status = %report.status,
            "Received delivery receipt"
        );
        Ok(())
    }
}

async fn receive_handler(
    State(transport): State<Arc<SmsTransport>>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<impl IntoResponse, TransportError> {
    transport.receive(form).await?;
    Ok((StatusCode::OK, [(CONTENT_TYPE, "text/plain")], ""))
}

async fn receipt_handler(
    State(transport): State<Arc<SmsTransport>>,
    Form(form): Form<HashMap<String, String>>,
) -> Result<impl IntoResponse, TransportError> {
    transport.receipt(form).await?;
    Ok((StatusCode::OK, [(CONTENT_TYPE, "text/plain")], ""))
}

#[async_trait]
impl Transport for SmsTransport {
    fn name(&self) -> &str {
        &self.config.transport_name
    }

    fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(&self.config.receive_path, post(receive_handler))
            .route(&self.config.receipt_path, post(receipt_handler))
            .with_state(self)
    }

    async fn handle_outbound(&self, message: CanonicalMessage) -> Result<(), TransportError> {
        self.send(&message).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::{body::Body, http::Request};
    use futures::StreamExt;
    use switchboard_core::{MemoryBus, traits::decode_json};
    use tower::ServiceExt;
    use wiremock::{Mock, MockServer, ResponseTemplate, matchers::method};

    use super::*;

    const RECEIVE_FORM: &str = "messageid=abc&time=2024.03.01+12%3A30%3A00&provider=MTN\
        &keyword=HELLO&destination=12345&sender=0027831234567&text=hi+there";

    const RECEIPT_FORM: &str = "smsid=sms-1&status=2&text=Delivered&time=2024.03.01+12%3A31%3A00\
        &provider=MTN&sender=27831234567&messageid=out-1";

    fn transport(bus: &Arc<dyn MessageBus>) -> Arc<SmsTransport> {
        Arc::new(
            SmsTransport::new(
                SmsConfig {
                    transport_name: "vas2nets".into(),
                    ..SmsConfig::default()
                },
                Arc::clone(bus),
                MiddlewareStack::default(),
            )
            .unwrap(),
        )
    }

    fn form_post(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(body))
            .unwrap()
    }

    #[test]
    fn test_normalize_msisdn() {
        assert_eq!(normalize_msisdn("+27831234567"), "+27831234567");
        assert_eq!(normalize_msisdn("0027831234567"), "+27831234567");
        assert_eq!(normalize_msisdn("27 83 123-4567"), "+27831234567");
        assert_eq!(normalize_msisdn("*120#"), "*120#");
    }

    #[test]
    fn test_parse_provider_time() {
        let ts = parse_provider_time("2024.03.01 12:30:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-01T12:30:00+00:00");
        assert!(parse_provider_time("2024-03-01T12:30:00").is_err());
    }

    #[tokio::test]
    async fn test_receive_publishes_inbound() {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let mut inbound = bus.subscribe("inbound.vas2nets").await.unwrap();
        let app = transport(&bus).router();

        let response = app
            .oneshot(form_post("/sms/receive", RECEIVE_FORM))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let msg: CanonicalMessage = decode_json(&inbound.next().await.unwrap()).unwrap();
        assert_eq!(msg.from_addr, "+27831234567");
        assert_eq!(msg.to_addr, "+12345");
        assert_eq!(msg.content.as_deref(), Some("hi there"));
        assert_eq!(msg.metadata_str("transport_message_id"), Some("abc"));
        assert_eq!(msg.metadata_str("network_id"), Some("MTN"));
        assert_eq!(msg.metadata_str("keyword"), Some("HELLO"));
        assert_eq!(msg.transport_type, "sms");
    }

    #[tokio::test]
    async fn test_receive_missing_field_is_bad_request() {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let mut inbound = bus.subscribe("inbound.vas2nets").await.unwrap();
        let app = transport(&bus).router();

        let response = app
            .oneshot(form_post("/sms/receive", "messageid=abc&time=2024.03.01+12%3A30%3A00"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&body).contains("Missing request key: provider"));

        let nothing =
            tokio::time::timeout(std::time::Duration::from_millis(50), inbound.next()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_receipt_publishes_report() {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let mut receipts = bus.subscribe("receipt.vas2nets").await.unwrap();
        let app = transport(&bus).router();

        let response = app
            .oneshot(form_post("/sms/receipt", RECEIPT_FORM))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let report: DeliveryReport = decode_json(&receipts.next().await.unwrap()).unwrap();
        assert_eq!(report.message_id, "out-1");
        assert_eq!(report.transport_message_id, "sms-1");
        assert_eq!(report.status, "2");
        assert_eq!(report.status_message, "Delivered");
        assert_eq!(report.to_addr, "+27831234567");
    }

    #[tokio::test]
    async fn test_send_reports_length_policy() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).insert_header(SMS_ID_HEADER, "sms-3"))
            .expect(2)
            .mount(&server)
            .await;

        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let transport = SmsTransport::new(
            SmsConfig {
                transport_name: "vas2nets".into(),
                url: format!("{}/send", server.uri()),
                ..SmsConfig::default()
            },
            bus,
            MiddlewareStack::default(),
        )
        .unwrap();

        let reply = CanonicalMessage::outbound("vas2nets", "12345", "+27831234567", Some("5€ off".into()));
        let delivered = transport.send(&reply).await.unwrap();
        assert_eq!(delivered.policy, CharsetPolicy::DoubleWidth);
        assert_eq!(delivered.policy.max_length(), 70);
        assert_eq!(delivered.ack.transport_message_id, "sms-3");

        let plain = CanonicalMessage::outbound("vas2nets", "12345", "+27831234567", Some("ok".into()));
        tokio_test::assert_ok!(transport.handle_outbound(plain).await);
    }
}
