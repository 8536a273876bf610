//! Gateway HTTP surface: transport endpoints plus a liveness probe.

use std::sync::Arc;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

use crate::Transport;

/// Liveness probe path.
pub const HEALTH_PATH: &str = "/health";

/// Liveness probe. Always answers `OK`.
pub async fn health() -> &'static str {
    "OK"
}

/// Merge the routes of every transport with the liveness probe.
#[must_use]
pub fn create_gateway_router(transports: &[Arc<dyn Transport>]) -> Router {
    transports
        .iter()
        .fold(Router::new().route(HEALTH_PATH, get(health)), |app, transport| {
            app.merge(Arc::clone(transport).router())
        })
        .layer(TraceLayer::new_for_http())
}
