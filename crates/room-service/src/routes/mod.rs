//! HTTP routes for the Room Service.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers;
use crate::signaling::SignalingContext;

use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout for the lifecycle API. WebSocket routes are long-lived
/// and are not subject to it.
pub const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Service configuration.
    pub config: Config,

    /// Shared services used by signaling connections and the lifecycle API.
    pub signaling: SignalingContext,
}

/// Build the application routes.
///
/// - `/api/v1/meetings...` - meeting lifecycle API (bearer token), 30s timeout
/// - `/ws/rooms/:room_id` - participant signaling
/// - `/ws/meetings/:id/host` - host waiting-room channel
/// - TraceLayer for request logging
///
/// Health and `/metrics` are served on the separate health listener.
pub fn build_routes(state: Arc<AppState>) -> Router {
    let api_routes = Router::new()
        .route("/api/v1/meetings", post(handlers::create_meeting))
        .route("/api/v1/meetings/:id", get(handlers::get_meeting))
        .route("/api/v1/meetings/:id/join", post(handlers::join_meeting))
        .route("/api/v1/meetings/:id/leave", post(handlers::leave_meeting))
        .route("/api/v1/meetings/:id/end", post(handlers::end_meeting))
        .route("/api/v1/meetings/:id/cancel", post(handlers::cancel_meeting))
        .layer(TimeoutLayer::new(API_TIMEOUT))
        .with_state(state.clone());

    let ws_routes = Router::new()
        .route("/ws/rooms/:room_id", get(handlers::room_socket))
        .route("/ws/meetings/:id/host", get(handlers::host_socket))
        .with_state(state);

    api_routes
        .merge(ws_routes)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }
}
