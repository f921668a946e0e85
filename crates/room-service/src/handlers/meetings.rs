//! Meeting lifecycle API.
//!
//! - `POST /api/v1/meetings` - create a meeting
//! - `GET /api/v1/meetings/{id}` - read a meeting
//! - `POST /api/v1/meetings/{id}/join` - join (or enter the waiting room)
//! - `POST /api/v1/meetings/{id}/leave` - leave
//! - `POST /api/v1/meetings/{id}/end` - end (host only)
//! - `POST /api/v1/meetings/{id}/cancel` - cancel (host only)
//!
//! # Security
//!
//! - Every endpoint requires a bearer access token; guests use the
//!   signaling endpoint instead
//! - Passwords are compared in constant time and never echoed back
//! - Error messages are generic to prevent information leakage

use crate::auth::Identity;
use crate::errors::RoomError;
use crate::meetings::{
    AdmissionStatus, CreateMeeting, MeetingSettings, MeetingStatus, MeetingView, ParticipantRole,
};
use crate::routes::AppState;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use common::types::{MeetingId, RoomId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Body of `POST /api/v1/meetings/{id}/join`.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMeetingRequest {
    #[serde(default)]
    pub password: Option<String>,
}

/// Response of `POST /api/v1/meetings/{id}/join`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinMeetingResponse {
    pub meeting_id: MeetingId,
    pub room_id: RoomId,
    pub role: ParticipantRole,
    pub status: MeetingStatus,
    pub admission_status: AdmissionStatus,
    pub requires_approval: bool,
    pub settings: MeetingSettings,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Identity, RoomError> {
    state.signaling.identity.authenticate(bearer_token(headers))
}

/// Parse a JSON body, answering 400 rather than axum's 422. An empty body
/// is the default request.
fn parse_body<T: serde::de::DeserializeOwned + Default>(body: &[u8]) -> Result<T, RoomError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        debug!(target: "rs.handlers.meetings", error = %e, "Invalid request body");
        RoomError::BadRequest("Invalid request body".to_string())
    })
}

/// Handler for `POST /api/v1/meetings`.
///
/// # Response
///
/// - 201 Created: the meeting
/// - 400 Bad Request: invalid body
/// - 401 Unauthorized: missing or invalid token
#[instrument(skip_all, name = "rs.meeting.create")]
pub async fn create_meeting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<(StatusCode, Json<MeetingView>), RoomError> {
    let host = authenticate(&state, &headers)?;
    let request: CreateMeeting = parse_body(&body)?;
    let meeting = state.signaling.lifecycle.create(&host, request).await?;
    info!(
        target: "rs.handlers.meetings",
        meeting_id = %meeting.id,
        room_id = %meeting.room_id,
        "Meeting created"
    );
    Ok((StatusCode::CREATED, Json(meeting.view())))
}

/// Handler for `GET /api/v1/meetings/{id}`.
#[instrument(skip_all, name = "rs.meeting.get", fields(meeting_id = %meeting_id))]
pub async fn get_meeting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(meeting_id): Path<MeetingId>,
) -> Result<Json<MeetingView>, RoomError> {
    authenticate(&state, &headers)?;
    let meeting = state.signaling.lifecycle.get(meeting_id).await?;
    Ok(Json(meeting.view()))
}

/// Handler for `POST /api/v1/meetings/{id}/join`.
///
/// Records the caller as approved, or pending when the waiting room applies.
/// Media starts when the signaling connection is opened.
///
/// # Response
///
/// - 200 OK: join accepted (check `requiresApproval`)
/// - 401 Unauthorized: bad token or wrong password
/// - 404 Not Found: no such meeting
/// - 409 Conflict: meeting full or ended
#[instrument(skip_all, name = "rs.meeting.join", fields(meeting_id = %meeting_id))]
pub async fn join_meeting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(meeting_id): Path<MeetingId>,
    body: axum::body::Bytes,
) -> Result<Json<JoinMeetingResponse>, RoomError> {
    let identity = authenticate(&state, &headers)?;
    let request: JoinMeetingRequest = parse_body(&body)?;
    let grant = state
        .signaling
        .lifecycle
        .join(meeting_id, &identity, request.password.as_deref(), None)
        .await?;

    Ok(Json(JoinMeetingResponse {
        meeting_id: grant.meeting.id,
        room_id: grant.meeting.room_id.clone(),
        role: grant.role,
        status: grant.meeting.status,
        admission_status: grant.participant.admission_status,
        requires_approval: grant.requires_approval,
        settings: grant.meeting.settings.clone(),
    }))
}

/// Handler for `POST /api/v1/meetings/{id}/leave`.
#[instrument(skip_all, name = "rs.meeting.leave", fields(meeting_id = %meeting_id))]
pub async fn leave_meeting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(meeting_id): Path<MeetingId>,
) -> Result<StatusCode, RoomError> {
    let identity = authenticate(&state, &headers)?;
    state
        .signaling
        .lifecycle
        .leave(meeting_id, &identity.user_id, None)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /api/v1/meetings/{id}/end`.
///
/// Host only. Every live connection receives `meeting-ended` and the room's
/// media resources are released.
#[instrument(skip_all, name = "rs.meeting.end", fields(meeting_id = %meeting_id))]
pub async fn end_meeting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(meeting_id): Path<MeetingId>,
) -> Result<StatusCode, RoomError> {
    let identity = authenticate(&state, &headers)?;
    state
        .signaling
        .lifecycle
        .end(meeting_id, &identity.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Handler for `POST /api/v1/meetings/{id}/cancel`.
#[instrument(skip_all, name = "rs.meeting.cancel", fields(meeting_id = %meeting_id))]
pub async fn cancel_meeting(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(meeting_id): Path<MeetingId>,
) -> Result<StatusCode, RoomError> {
    let identity = authenticate(&state, &headers)?;
    state
        .signaling
        .lifecycle
        .cancel(meeting_id, &identity.user_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, "Bearer abc.def".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("abc.def"));
    }

    #[test]
    fn test_empty_body_is_default_request() {
        let request: JoinMeetingRequest = parse_body(b"").unwrap();
        assert!(request.password.is_none());

        let request: JoinMeetingRequest = parse_body(br#"{"password":"pw"}"#).unwrap();
        assert_eq!(request.password.as_deref(), Some("pw"));

        assert!(matches!(
            parse_body::<JoinMeetingRequest>(b"{not json"),
            Err(RoomError::BadRequest(_))
        ));
    }
}
