//! Wire transports for the messaging gateway.
//!
//! Provides:
//! - `UssdTransport` - XML-over-HTTP dialogs backed by the session store
//! - `SmsTransport` - Form-post receive/receipt endpoints and outbound delivery
//! - `InboundPublisher` / `OutboundWorker` - Bus wiring through the middleware stack
//! - Gateway router with a liveness probe

pub mod error;
pub mod http;
pub mod rpc;
pub mod sms;
pub mod ussd;
pub mod worker;

pub use error::TransportError;
pub use http::{create_gateway_router, health};
pub use rpc::{PendingReply, PendingRequests};
pub use sms::{SmsConfig, SmsTransport};
pub use ussd::{UssdConfig, UssdTransport};
pub use worker::{InboundPublisher, OutboundWorker, Transport};
