//! Transport error and its HTTP representation.

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use switchboard_core::{BusError, middleware::MiddlewareError};
use switchboard_session::SessionError;

use crate::sms::DispatchError;

/// Transport error.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Malformed request: {0}")]
    MalformedRequest(String),
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
    #[error("Invalid outbound message: {0}")]
    InvalidOutbound(String),
    #[error("Middleware error: {0}")]
    Pipeline(#[from] MiddlewareError),
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("Encode error: {0}")]
    Encode(String),
    #[error("Reply failed: {0}")]
    ReplyFailed(String),
    #[error("No reply within {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Missing mandatory wire field.
    #[must_use]
    pub fn missing_field(field: &str) -> Self {
        Self::MalformedRequest(format!("Missing request key: {field}"))
    }

    /// HTTP status reported to the wire caller.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) | Self::Session(SessionError::NotFound(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::Session(SessionError::Duplicate(_)) => StatusCode::CONFLICT,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for TransportError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {self}");
        } else {
            tracing::warn!("Request rejected: {self}");
        }
        (status, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            TransportError::missing_field("sender").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TransportError::Session(SessionError::NotFound("s".into())).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            TransportError::Session(SessionError::Duplicate("s".into())).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(1)).status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            TransportError::ReplyFailed("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            TransportError::Encode("x".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_missing_field_message() {
        let err = TransportError::missing_field("sender");
        assert_eq!(err.to_string(), "Malformed request: Missing request key: sender");
    }
}
