//! Session-aware USSD transport.
//!
//! Each dialog step arrives as an XML POST. The request is held open until
//! the application publishes the reply for it, which is rendered as the
//! response page. Session continuity lives entirely in the session store,
//! so any number of instances can serve the same dialog.

pub mod page;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    Router,
    extract::State,
    http::header::CONTENT_TYPE,
    response::IntoResponse,
    routing::post,
};
use serde::{Deserialize, Serialize};
use switchboard_core::{
    CanonicalMessage, MessageBus, MiddlewareStack, SessionEvent, message::SESSION_ID_KEY,
};
use switchboard_session::{NewSession, SessionCache, SessionConfig, SessionManager};

use crate::{InboundPublisher, PendingRequests, Transport, TransportError};

pub use page::{NEW_SESSION_PAGE, UssdPage, UssdRequest};

const XML_CONTENT_TYPE: &str = "text/xml; charset=utf-8";

/// USSD transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UssdConfig {
    pub transport_name: String,
    pub transport_type: String,
    /// Request endpoint path.
    pub path: String,
    /// Session store settings. Without one, keys live under
    /// `mtech_ussd:<transport_name>`.
    pub session: Option<SessionConfig>,
    /// Request field holding the subscriber address on new sessions.
    pub from_addr_field: String,
    /// Request field holding the service address on new sessions.
    pub to_addr_field: String,
    /// Seconds to hold a request open waiting for the reply.
    pub reply_timeout: u64,
}

impl Default for UssdConfig {
    fn default() -> Self {
        Self {
            transport_name: "mtech_ussd".to_string(),
            transport_type: "ussd".to_string(),
            path: "/ussd".to_string(),
            session: None,
            from_addr_field: "mobile_number".to_string(),
            to_addr_field: "gate".to_string(),
            reply_timeout: 10,
        }
    }
}

impl UssdConfig {
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        self.session.clone().unwrap_or_else(|| {
            SessionConfig::with_prefix(format!("mtech_ussd:{}", self.transport_name))
        })
    }

    #[must_use]
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout)
    }
}

/// XML-over-HTTP USSD transport.
pub struct UssdTransport<C: SessionCache> {
    config: UssdConfig,
    sessions: SessionManager<C>,
    publisher: InboundPublisher,
    pending: PendingRequests,
}

impl<C: SessionCache + 'static> UssdTransport<C> {
    #[must_use]
    pub fn new(
        config: UssdConfig,
        cache: C,
        bus: Arc<dyn MessageBus>,
        pipeline: MiddlewareStack,
    ) -> Self {
        let sessions = SessionManager::new(cache, config.session_config());
        let publisher = InboundPublisher::new(bus, pipeline, &config.transport_name);
        Self {
            config,
            sessions,
            publisher,
            pending: PendingRequests::new(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &UssdConfig {
        &self.config
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionManager<C> {
        &self.sessions
    }

    #[must_use]
    pub const fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Turn a request into a canonical message, creating or resuming the
    /// session it belongs to.
    ///
    /// # Errors
    /// - `MalformedRequest` if a mandatory field is missing, or an address
    ///   field of a new dialog is blank.
    /// - `Session(Duplicate)` for a new dialog on a live session id.
    /// - `Session(NotFound)` when resuming an unknown or expired session.
    pub async fn decode(&self, request: &UssdRequest) -> Result<CanonicalMessage, TransportError> {
        let session_id = request.required("session_id")?;
        let page_id = request.required("page_id")?;
        let data = request.required("data")?;

        let (session, session_event) = if page_id == NEW_SESSION_PAGE {
            let from_addr = request.required_non_empty(&self.config.from_addr_field)?;
            let to_addr = request.required_non_empty(&self.config.to_addr_field)?;
            let session = self
                .sessions
                .create_session(session_id, NewSession::new(from_addr, to_addr))
                .await?;
            (session, SessionEvent::New)
        } else {
            (self.sessions.load_session(session_id).await?, SessionEvent::Resume)
        };

        let content = (!data.is_empty()).then(|| data.to_string());
        let mut message = CanonicalMessage::inbound(
            self.config.transport_name.clone(),
            session.from_addr,
            session.to_addr,
            content,
        )
        .with_session_event(session_event)
        .with_transport_type(self.config.transport_type.clone());
        message.set_metadata(SESSION_ID_KEY, session_id);
        Ok(message)
    }

    /// Render an outbound message as a response page.
    ///
    /// # Errors
    /// Returns `InvalidOutbound` if the message carries no session id.
    pub fn encode(&self, message: &CanonicalMessage) -> Result<String, TransportError> {
        let session_id = message.session_id().ok_or_else(|| {
            TransportError::InvalidOutbound(format!(
                "message {} has no {SESSION_ID_KEY}",
                message.message_id
            ))
        })?;

        let mut page = UssdPage::new(session_id);
        page.add_text(message.content.as_deref().unwrap_or_default());
        if message.session_event != SessionEvent::Close {
            page.add_freetext_option();
        }
        page.render()
    }

    /// Close the session if the reply ends the dialog, then render its page.
    async fn close_and_render(&self, message: &CanonicalMessage) -> Result<String, TransportError> {
        let page = self.encode(message)?;
        if message.session_event == SessionEvent::Close {
            if let Some(session_id) = message.session_id() {
                self.sessions.close_session(session_id).await?;
                tracing::debug!(session_id, "Session closed");
            }
        }
        Ok(page)
    }

    /// Serve one dialog step and return the reply page.
    ///
    /// # Errors
    /// Returns the decode errors of [`Self::decode`], pipeline and bus
    /// failures, `ReplyFailed` if the reply cannot be rendered, or
    /// `Timeout` if the application does not reply in time.
    pub async fn handle_request(&self, body: &str) -> Result<String, TransportError> {
        let request = UssdRequest::parse(body)?;
        let message = self.decode(&request).await?;
        let created = message
            .session_id()
            .filter(|_| message.session_event == SessionEvent::New)
            .map(str::to_string);

        let reply = self.pending.register(&message.message_id);
        if let Err(e) = self.publisher.publish(message).await {
            if let Some(session_id) = created {
                self.sessions.close_session(&session_id).await?;
            }
            return Err(e);
        }
        reply.wait(self.config.reply_timeout()).await
    }
}

async fn request_handler<C: SessionCache + 'static>(
    State(transport): State<Arc<UssdTransport<C>>>,
    body: String,
) -> Result<impl IntoResponse, TransportError> {
    let page = transport.handle_request(&body).await?;
    Ok(([(CONTENT_TYPE, XML_CONTENT_TYPE)], page))
}

#[async_trait]
impl<C: SessionCache + 'static> Transport for UssdTransport<C> {
    fn name(&self) -> &str {
        &self.config.transport_name
    }

    fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(&self.config.path, post(request_handler::<C>))
            .with_state(self)
    }

    async fn handle_outbound(&self, message: CanonicalMessage) -> Result<(), TransportError> {
        let in_reply_to = message.in_reply_to.as_deref().ok_or_else(|| {
            TransportError::InvalidOutbound(format!(
                "message {} is not a reply",
                message.message_id
            ))
        })?;

        let page = match self.close_and_render(&message).await {
            Ok(page) => page,
            Err(e) => {
                self.pending.fail(in_reply_to, e.to_string());
                return Err(e);
            }
        };

        if !self.pending.finish(in_reply_to, page) {
            tracing::warn!(
                message_id = %message.message_id,
                in_reply_to,
                "Reply arrived after the request was closed"
            );
        }
        Ok(())
    }

    async fn shutdown(&self) {
        self.sessions.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::{Body, to_bytes},
        http::{Request, StatusCode},
    };
    use futures::StreamExt;
    use switchboard_core::{
        MemoryBus,
        traits::{consume, decode_json, publish_json},
    };
    use switchboard_session::MemoryCache;
    use tokio::task::JoinHandle;
    use tower::ServiceExt;

    use super::*;
    use crate::OutboundWorker;

    fn new_request(session_id: &str) -> String {
        format!(
            "<page><session_id>{session_id}</session_id><page_id>0</page_id>\
             <data>*120*8864*1123#</data><mobile_number>27831234567</mobile_number>\
             <gate>8864</gate></page>"
        )
    }

    fn resume_request(session_id: &str, data: &str) -> String {
        format!(
            "<page><session_id>{session_id}</session_id><page_id>3</page_id>\
             <data>{data}</data></page>"
        )
    }

    fn post_xml(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/ussd")
            .header(CONTENT_TYPE, "text/xml")
            .body(Body::from(body))
            .unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    struct Gateway {
        bus: Arc<dyn MessageBus>,
        transport: Arc<UssdTransport<MemoryCache>>,
        tasks: Vec<JoinHandle<()>>,
    }

    impl Gateway {
        fn router(&self) -> Router {
            Arc::clone(&self.transport).router()
        }
    }

    impl Drop for Gateway {
        fn drop(&mut self) {
            for task in &self.tasks {
                task.abort();
            }
        }
    }

    /// Transport plus an application that echoes input and closes on "bye".
    async fn gateway(with_app: bool) -> Gateway {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let transport = Arc::new(UssdTransport::new(
            UssdConfig::default(),
            MemoryCache::new(),
            Arc::clone(&bus),
            MiddlewareStack::default(),
        ));
        let mut tasks = Vec::new();

        if with_app {
            tasks.push(
                OutboundWorker::spawn(
                    Arc::clone(&transport),
                    Arc::clone(&bus),
                    MiddlewareStack::default(),
                )
                .await
                .unwrap(),
            );

            let app_bus = Arc::clone(&bus);
            tasks.push(
                consume(bus.as_ref(), "inbound.mtech_ussd", move |msg: CanonicalMessage| {
                    let bus = Arc::clone(&app_bus);
                    async move {
                        let input = msg.content.clone().unwrap_or_default();
                        let event = if input == "bye" {
                            SessionEvent::Close
                        } else {
                            SessionEvent::Resume
                        };
                        let reply = msg.reply(format!("You said: {input}"), event);
                        publish_json(bus.as_ref(), "outbound.mtech_ussd", &reply)
                            .await
                            .unwrap();
                    }
                })
                .await
                .unwrap(),
            );
        }

        Gateway {
            bus,
            transport,
            tasks,
        }
    }

    #[tokio::test]
    async fn test_new_then_resume() {
        let gw = gateway(true).await;
        let mut inbound = gw.bus.subscribe("inbound.mtech_ussd").await.unwrap();

        let response = gw.router().oneshot(post_xml(new_request("1234"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], XML_CONTENT_TYPE);
        let page = body_text(response).await;
        assert!(page.contains("<session_id>1234</session_id>"));
        assert!(page.contains("<div>You said: *120*8864*1123#</div>"));
        assert!(page.contains(r#"<link accesskey="*" pageId="indexX"/>"#));

        let first: CanonicalMessage = decode_json(&inbound.next().await.unwrap()).unwrap();
        assert_eq!(first.session_event, SessionEvent::New);
        assert_eq!(first.from_addr, "27831234567");
        assert_eq!(first.to_addr, "8864");
        assert_eq!(first.session_id(), Some("1234"));
        assert_eq!(first.transport_type, "ussd");

        let response = gw
            .router()
            .oneshot(post_xml(resume_request("1234", "2")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("<div>You said: 2</div>"));

        let second: CanonicalMessage = decode_json(&inbound.next().await.unwrap()).unwrap();
        assert_eq!(second.session_event, SessionEvent::Resume);
        assert_eq!(second.from_addr, "27831234567");
        assert_eq!(second.to_addr, "8864");
        assert_eq!(second.content.as_deref(), Some("2"));
        assert!(gw.transport.pending().is_empty());
    }

    #[tokio::test]
    async fn test_close_ends_session() {
        let gw = gateway(true).await;

        let response = gw.router().oneshot(post_xml(new_request("77"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = gw
            .router()
            .oneshot(post_xml(resume_request("77", "bye")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = body_text(response).await;
        assert!(page.contains("<div>You said: bye</div>"));
        assert!(!page.contains("<navigation>"));

        let response = gw
            .router()
            .oneshot(post_xml(resume_request("77", "again")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_duplicate_new_is_conflict() {
        let gw = gateway(true).await;

        let first = gw.router().oneshot(post_xml(new_request("5"))).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = gw.router().oneshot(post_xml(new_request("5"))).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_resume_unknown_session_is_bad_request() {
        let gw = gateway(false).await;
        let mut inbound = gw.bus.subscribe("inbound.mtech_ussd").await.unwrap();

        let response = gw
            .router()
            .oneshot(post_xml(resume_request("never-seen", "1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        tokio_test::assert_pending!(tokio_test::task::spawn(inbound.next()).poll());
    }

    #[tokio::test]
    async fn test_malformed_requests() {
        let gw = gateway(false).await;

        let missing_session = "<page><page_id>0</page_id><data/></page>".to_string();
        let response = gw.router().oneshot(post_xml(missing_session)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("session_id"));

        let missing_gate = "<page><session_id>9</session_id><page_id>0</page_id><data/>\
                            <mobile_number>1</mobile_number></page>"
            .to_string();
        let response = gw.router().oneshot(post_xml(missing_gate)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(gw.transport.sessions().load_session("9").await.is_err());

        let blank_addresses = "<page><session_id>1</session_id><page_id>0</page_id><data/>\
                               <mobile_number/><gate/></page>"
            .to_string();
        let response = gw.router().oneshot(post_xml(blank_addresses)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_text(response).await.contains("mobile_number"));
        assert!(gw.transport.sessions().load_session("1").await.is_err());

        let response = gw
            .router()
            .oneshot(post_xml("not xml <".to_string()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_configurable_address_fields() {
        let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
        let transport = UssdTransport::new(
            UssdConfig {
                to_addr_field: "service_code".into(),
                ..UssdConfig::default()
            },
            MemoryCache::new(),
            bus,
            MiddlewareStack::default(),
        );

        let request = UssdRequest::parse(
            "<page><session_id>3</session_id><page_id>0</page_id><data></data>\
             <mobile_number>2783</mobile_number><service_code>*120#</service_code></page>",
        )
        .unwrap();
        let message = transport.decode(&request).await.unwrap();
        assert_eq!(message.to_addr, "*120#");
        assert_eq!(message.content, None);
        assert_eq!(
            transport.sessions().config().key_prefix,
            "mtech_ussd:mtech_ussd"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reply_times_out() {
        let gw = gateway(false).await;

        let response = gw.router().oneshot(post_xml(new_request("42"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(gw.transport.pending().is_empty());
    }

    #[tokio::test]
    async fn test_late_reply_is_discarded() {
        let gw = gateway(false).await;
        let request = UssdRequest::parse(&new_request("8")).unwrap();
        let inbound = gw.transport.decode(&request).await.unwrap();

        let reply = inbound.reply("too late", SessionEvent::Close);
        gw.transport.handle_outbound(reply).await.unwrap();
        assert!(gw.transport.sessions().load_session("8").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrenderable_reply_fails_request() {
        let gw = gateway(false).await;
        let mut inbound = gw.bus.subscribe("inbound.mtech_ussd").await.unwrap();

        let transport = Arc::clone(&gw.transport);
        let request =
            tokio::spawn(async move { transport.handle_request(&new_request("31")).await });

        let msg: CanonicalMessage = decode_json(&inbound.next().await.unwrap()).unwrap();
        let mut reply = msg.reply("lost", SessionEvent::Resume);
        reply.transport_metadata.remove(SESSION_ID_KEY);
        let started = tokio::time::Instant::now();
        let err = gw.transport.handle_outbound(reply).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidOutbound(_)));

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, TransportError::ReplyFailed(_)));
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(started.elapsed() < gw.transport.config().reply_timeout());
        assert!(gw.transport.pending().is_empty());
    }

    #[tokio::test]
    async fn test_outbound_must_be_a_reply() {
        let gw = gateway(false).await;
        let message = CanonicalMessage::outbound("mtech_ussd", "a", "b", Some("hi".into()));
        let err = gw.transport.handle_outbound(message).await.unwrap_err();
        assert!(matches!(err, TransportError::InvalidOutbound(_)));
    }
}
