//! Room Service error types.
//!
//! `RoomError` is the taxonomy surfaced to clients. On a signaling connection
//! every per-request failure becomes an `error` frame carrying [`RoomError::kind`]
//! and [`RoomError::client_message`]; on the HTTP surface the same error maps
//! to a status code. Internal details are logged server-side but not exposed
//! to clients.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Room Service error type.
///
/// Maps to wire kinds and HTTP status codes:
/// - `NotFound`: 404
/// - `Forbidden`: 403
/// - `Unauthorized`: 401
/// - `Full`, `Ended`, `AlreadyEnded`, `InvalidState`: 409
/// - `CannotConsume`, `BadRequest`: 400
/// - `RoutingEngineUnavailable`, `Draining`: 503
/// - `EngineTimeout`: 504
/// - `Store`, `Internal`: 500
#[derive(Debug, Error)]
pub enum RoomError {
    /// Meeting, room, transport, producer or consumer unknown to the caller.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Role or ownership violation.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Bad meeting password or invalid access token.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Meeting is at capacity.
    #[error("Meeting is full: {0}")]
    Full(String),

    /// Join attempted on an ended or cancelled meeting.
    #[error("Meeting has ended")]
    Ended,

    /// End or cancel attempted on an ended or cancelled meeting.
    #[error("Meeting already ended")]
    AlreadyEnded,

    /// Lifecycle or connection-state violation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Consumer capabilities are incompatible with the producer.
    #[error("Cannot consume producer {0}")]
    CannotConsume(String),

    /// Media engine cannot create routers.
    #[error("Routing engine unavailable: {0}")]
    RoutingEngineUnavailable(String),

    /// Media engine call exceeded the bounded wait.
    #[error("Engine call timed out: {0}")]
    EngineTimeout(String),

    /// Malformed request.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Service is shutting down and no longer creates rooms.
    #[error("Room service is draining")]
    Draining,

    /// Meeting store operation failed.
    #[error("Store error: {0}")]
    Store(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RoomError {
    /// Returns the wire taxonomy name carried in `error` frames.
    pub fn kind(&self) -> &'static str {
        match self {
            RoomError::NotFound(_) => "NotFound",
            RoomError::Forbidden(_) => "Forbidden",
            RoomError::Unauthorized(_) => "Unauthorized",
            RoomError::Full(_) => "Full",
            RoomError::Ended => "Ended",
            RoomError::AlreadyEnded => "AlreadyEnded",
            RoomError::InvalidState(_) => "InvalidState",
            RoomError::CannotConsume(_) => "CannotConsume",
            RoomError::RoutingEngineUnavailable(_) | RoomError::Draining => {
                "RoutingEngineUnavailable"
            }
            RoomError::EngineTimeout(_) => "EngineTimeout",
            RoomError::BadRequest(_) => "BadRequest",
            RoomError::Store(_) | RoomError::Internal(_) => "Internal",
        }
    }

    /// Returns a client-safe error message (no internal details).
    pub fn client_message(&self) -> String {
        match self {
            RoomError::NotFound(what) => format!("{what} not found"),
            RoomError::Forbidden(msg)
            | RoomError::InvalidState(msg)
            | RoomError::BadRequest(msg) => msg.clone(),
            RoomError::Unauthorized(_) => "Not authorized to join this meeting".to_string(),
            RoomError::Full(_) => "Meeting is full".to_string(),
            RoomError::Ended => "Meeting has ended".to_string(),
            RoomError::AlreadyEnded => "Meeting has already ended".to_string(),
            RoomError::CannotConsume(_) => {
                "Receive capabilities are incompatible with this producer".to_string()
            }
            RoomError::RoutingEngineUnavailable(_) => {
                "Media routing is unavailable, please try again".to_string()
            }
            RoomError::EngineTimeout(_) => "Media engine did not respond in time".to_string(),
            RoomError::Draining => "Server is shutting down, please reconnect".to_string(),
            RoomError::Store(_) | RoomError::Internal(_) => {
                "An internal error occurred".to_string()
            }
        }
    }

    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RoomError::NotFound(_) => StatusCode::NOT_FOUND,
            RoomError::Forbidden(_) => StatusCode::FORBIDDEN,
            RoomError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RoomError::Full(_)
            | RoomError::Ended
            | RoomError::AlreadyEnded
            | RoomError::InvalidState(_) => StatusCode::CONFLICT,
            RoomError::CannotConsume(_) | RoomError::BadRequest(_) => StatusCode::BAD_REQUEST,
            RoomError::RoutingEngineUnavailable(_) | RoomError::Draining => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RoomError::EngineTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RoomError::Store(_) | RoomError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Meeting store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Stored document is malformed: {0}")]
    Malformed(String),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Malformed(err.to_string())
    }
}

impl From<StoreError> for RoomError {
    fn from(err: StoreError) -> Self {
        RoomError::Store(err.to_string())
    }
}

/// Event bus errors. Never propagated to lifecycle callers; publishes are
/// fire-and-forget and failures are logged.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Bus backend error: {0}")]
    Backend(String),

    #[error("Event encoding failed: {0}")]
    Encoding(String),
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Encoding(err.to_string())
    }
}

/// Media engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine cannot serve requests (worker died, not started).
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// The handle was already closed.
    #[error("{0} is closed")]
    Closed(String),

    /// The producer referenced by a consume call does not exist on this router.
    #[error("Unknown producer: {0}")]
    UnknownProducer(String),

    /// Capabilities cannot receive the producer's codec.
    #[error("Incompatible capabilities for producer {0}")]
    Incompatible(String),

    /// Parameters rejected by the engine.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),
}

impl From<EngineError> for RoomError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => RoomError::RoutingEngineUnavailable(msg),
            EngineError::Closed(what) => RoomError::InvalidState(format!("{what} is closed")),
            EngineError::UnknownProducer(_) => RoomError::NotFound("Producer".to_string()),
            EngineError::Incompatible(id) => RoomError::CannotConsume(id),
            EngineError::InvalidParameters(msg) => RoomError::BadRequest(msg),
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    kind: &'static str,
}

impl IntoResponse for RoomError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            // Log actual error server-side, return generic message to client
            tracing::error!(target: "rs.api", error = %self, "Request failed");
        }

        let body = ErrorResponse {
            error: self.client_message(),
            kind: self.kind(),
        };

        let mut response = (status, Json(body)).into_response();

        if status == StatusCode::UNAUTHORIZED {
            if let Ok(header_value) = "Bearer realm=\"dark-tower-rooms\"".parse() {
                response
                    .headers_mut()
                    .insert("WWW-Authenticate", header_value);
            }
        }

        response
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(RoomError::NotFound("Transport".into()).kind(), "NotFound");
        assert_eq!(RoomError::Forbidden("not owner".into()).kind(), "Forbidden");
        assert_eq!(RoomError::Unauthorized("pw".into()).kind(), "Unauthorized");
        assert_eq!(RoomError::Full("2/2".into()).kind(), "Full");
        assert_eq!(RoomError::Ended.kind(), "Ended");
        assert_eq!(RoomError::AlreadyEnded.kind(), "AlreadyEnded");
        assert_eq!(RoomError::InvalidState("x".into()).kind(), "InvalidState");
        assert_eq!(RoomError::CannotConsume("p".into()).kind(), "CannotConsume");
        assert_eq!(
            RoomError::RoutingEngineUnavailable("down".into()).kind(),
            "RoutingEngineUnavailable"
        );
        assert_eq!(RoomError::Draining.kind(), "RoutingEngineUnavailable");
        assert_eq!(RoomError::EngineTimeout("consume".into()).kind(), "EngineTimeout");
        assert_eq!(RoomError::Store("conn".into()).kind(), "Internal");
    }

    #[test]
    fn test_client_messages_hide_internal_details() {
        let store_err: RoomError =
            StoreError::Backend("connection refused at 10.0.0.7:6379".to_string()).into();
        assert!(!store_err.client_message().contains("10.0.0.7"));
        assert_eq!(store_err.client_message(), "An internal error occurred");

        let unauthorized = RoomError::Unauthorized("password mismatch for meeting".into());
        assert!(!unauthorized.client_message().contains("password"));
    }

    #[test]
    fn test_engine_error_conversion() {
        let err: RoomError = EngineError::Incompatible("p-1".into()).into();
        assert!(matches!(err, RoomError::CannotConsume(ref id) if id == "p-1"));

        let err: RoomError = EngineError::Unavailable("worker died".into()).into();
        assert_eq!(err.kind(), "RoutingEngineUnavailable");

        let err: RoomError = EngineError::UnknownProducer("p-2".into()).into();
        assert_eq!(err.client_message(), "Producer not found");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(RoomError::NotFound("Meeting".into()).status_code(), 404);
        assert_eq!(RoomError::Forbidden("x".into()).status_code(), 403);
        assert_eq!(RoomError::Unauthorized("x".into()).status_code(), 401);
        assert_eq!(RoomError::Full("x".into()).status_code(), 409);
        assert_eq!(RoomError::AlreadyEnded.status_code(), 409);
        assert_eq!(RoomError::Draining.status_code(), 503);
        assert_eq!(RoomError::Internal("x".into()).status_code(), 500);
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            format!("{}", RoomError::Store("timeout".to_string())),
            "Store error: timeout"
        );
        assert_eq!(
            format!("{}", EngineError::Closed("Transport".to_string())),
            "Transport is closed"
        );
    }
}
