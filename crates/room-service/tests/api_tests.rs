//! Integration tests for the meeting lifecycle API.
//!
//! Requests go through the full router with `tower::ServiceExt::oneshot`,
//! backed by the in-memory store and the mock media engine.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use common::types::RoomId;
use http_body_util::BodyExt;
use room_service::handlers::meetings::JoinMeetingResponse;
use room_service::meetings::{AdmissionStatus, MeetingStatus, ParticipantRole};
use room_test_utils::{expired_token, mint_token, Harness};
use serde_json::{json, Value};
use tower::ServiceExt;

async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        request = request.header(header::AUTHORIZATION, format!("Bearer {}", mint_token(user, None)));
    }
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn create(app: &Router, host: &str, body: Value) -> Value {
    let (status, meeting) = call(app, Method::POST, "/api/v1/meetings", Some(host), Some(body)).await;
    assert_eq!(status, StatusCode::CREATED);
    meeting
}

fn id_of(meeting: &Value) -> String {
    meeting.get("id").and_then(Value::as_str).unwrap().to_string()
}

#[tokio::test]
async fn test_create_meeting() {
    let harness = Harness::new();
    let app = harness.router();

    let meeting = create(
        &app,
        "alice",
        json!({
            "title": "Standup",
            "roomId": "room-standup",
            "password": "sesame",
            "maxParticipants": 8,
            "flags": {"isWaitingRoomEnabled": true},
            "settings": {"muteOnEntry": true}
        }),
    )
    .await;

    assert_eq!(meeting.get("title"), Some(&json!("Standup")));
    assert_eq!(meeting.get("roomId"), Some(&json!("room-standup")));
    assert_eq!(meeting.get("hostId"), Some(&json!("alice")));
    assert_eq!(meeting.get("isPasswordProtected"), Some(&json!(true)));
    assert_eq!(meeting.get("maxParticipants"), Some(&json!(8)));
    assert!(meeting.get("password").is_none());
    assert!(!meeting.to_string().contains("sesame"));
}

#[tokio::test]
async fn test_create_meeting_with_empty_body_uses_defaults() {
    let harness = Harness::new();
    let app = harness.router();

    let (status, meeting) = call(&app, Method::POST, "/api/v1/meetings", Some("alice"), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(meeting.get("roomId").and_then(Value::as_str).is_some());
    assert_eq!(meeting.get("isPasswordProtected"), Some(&json!(false)));
}

#[tokio::test]
async fn test_requests_without_token_are_unauthorized() {
    let harness = Harness::new();
    let app = harness.router();

    let (status, body) = call(&app, Method::POST, "/api/v1/meetings", None, Some(json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body.get("kind"), Some(&json!("Unauthorized")));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/meetings")
        .header(header::AUTHORIZATION, format!("Bearer {}", expired_token("alice")))
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
}

#[tokio::test]
async fn test_invalid_body_is_bad_request() {
    let harness = Harness::new();
    let app = harness.router();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/meetings")
        .header(header::AUTHORIZATION, format!("Bearer {}", mint_token("alice", None)))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_get_meeting() {
    let harness = Harness::new();
    let app = harness.router();
    let meeting = create(&app, "alice", json!({"title": "Review"})).await;
    let id = id_of(&meeting);

    let (status, fetched) = call(&app, Method::GET, &format!("/api/v1/meetings/{id}"), Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched.get("id"), meeting.get("id"));
    assert_eq!(fetched.get("status"), Some(&json!("active")));

    let missing = uuid::Uuid::new_v4();
    let (status, body) = call(&app, Method::GET, &format!("/api/v1/meetings/{missing}"), Some("bob"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body.get("kind"), Some(&json!("NotFound")));
}

#[tokio::test]
async fn test_join_meeting_checks_password() {
    let harness = Harness::new();
    let app = harness.router();
    let start = chrono::Utc::now() + chrono::Duration::hours(1);
    let meeting = create(&app, "alice", json!({"password": "sesame", "startTime": start})).await;
    assert_eq!(meeting.get("status"), Some(&json!("scheduled")));
    let join = format!("/api/v1/meetings/{}/join", id_of(&meeting));

    let (status, _) = call(&app, Method::POST, &join, Some("bob"), Some(json!({"password": "wrong"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = call(&app, Method::POST, &join, Some("bob"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(&app, Method::POST, &join, Some("bob"), Some(json!({"password": "sesame"}))).await;
    assert_eq!(status, StatusCode::OK);
    let grant: JoinMeetingResponse = serde_json::from_value(body).unwrap();
    assert_eq!(grant.role, ParticipantRole::Participant);
    assert_eq!(grant.admission_status, AdmissionStatus::Approved);
    assert_eq!(grant.status, MeetingStatus::Scheduled);
    assert!(!grant.requires_approval);

    // The first join starts a scheduled meeting.
    let stored = harness.meeting(grant.meeting_id).await;
    assert_eq!(stored.status, MeetingStatus::Active);
}

#[tokio::test]
async fn test_join_with_waiting_room_requires_approval() {
    let harness = Harness::new();
    let app = harness.router();
    let meeting = create(&app, "alice", json!({"flags": {"isWaitingRoomEnabled": true}})).await;
    let join = format!("/api/v1/meetings/{}/join", id_of(&meeting));

    let (status, body) = call(&app, Method::POST, &join, Some("bob"), None).await;
    assert_eq!(status, StatusCode::OK);
    let grant: JoinMeetingResponse = serde_json::from_value(body).unwrap();
    assert!(grant.requires_approval);
    assert_eq!(grant.admission_status, AdmissionStatus::Pending);

    let (_, body) = call(&app, Method::POST, &join, Some("alice"), None).await;
    let grant: JoinMeetingResponse = serde_json::from_value(body).unwrap();
    assert_eq!(grant.role, ParticipantRole::Host);
    assert!(!grant.requires_approval);
}

#[tokio::test]
async fn test_end_meeting() {
    let harness = Harness::new();
    let app = harness.router();
    let meeting = create(&app, "alice", json!({})).await;
    let end = format!("/api/v1/meetings/{}/end", id_of(&meeting));

    let (status, body) = call(&app, Method::POST, &end, Some("bob"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body.get("kind"), Some(&json!("Forbidden")));

    let (status, body) = call(&app, Method::POST, &end, Some("alice"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (status, body) = call(&app, Method::POST, &end, Some("alice"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body.get("kind"), Some(&json!("AlreadyEnded")));

    let join = format!("/api/v1/meetings/{}/join", id_of(&meeting));
    let (status, body) = call(&app, Method::POST, &join, Some("bob"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body.get("kind"), Some(&json!("Ended")));
}

#[tokio::test]
async fn test_cancel_meeting() {
    let harness = Harness::new();
    let app = harness.router();
    let meeting = create(&app, "alice", json!({})).await;
    let id = id_of(&meeting);

    let (status, _) = call(&app, Method::POST, &format!("/api/v1/meetings/{id}/cancel"), Some("alice"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, fetched) = call(&app, Method::GET, &format!("/api/v1/meetings/{id}"), Some("alice"), None).await;
    assert_eq!(fetched.get("status"), Some(&json!("cancelled")));

    let (status, _) = call(&app, Method::POST, &format!("/api/v1/meetings/{id}/end"), Some("alice"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_leave_meeting() {
    let harness = Harness::new();
    let app = harness.router();
    let meeting = create(&app, "alice", json!({})).await;
    let id = id_of(&meeting);

    call(&app, Method::POST, &format!("/api/v1/meetings/{id}/join"), Some("bob"), None).await;
    let (status, _) = call(&app, Method::POST, &format!("/api/v1/meetings/{id}/leave"), Some("bob"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, fetched) = call(&app, Method::GET, &format!("/api/v1/meetings/{id}"), Some("alice"), None).await;
    let bob = fetched
        .get("participants")
        .and_then(Value::as_array)
        .and_then(|participants| {
            participants
                .iter()
                .find(|p| p.get("userId") == Some(&json!("bob")))
        })
        .cloned()
        .unwrap();
    assert_eq!(bob.get("admissionStatus"), Some(&json!("disconnected")));
    assert!(bob.get("leftAt").is_some());
}

#[tokio::test]
async fn test_leave_meeting_closes_signaling_connection() {
    let harness = Harness::new();
    let app = harness.router();
    let meeting = create(&app, "alice", json!({"roomId": "room-http-leave"})).await;
    let id = id_of(&meeting);

    let room_id = RoomId::from("room-http-leave");
    let mut bob = harness.connect(&room_id, "bob");
    bob.joined().await;

    let (status, _) = call(&app, Method::POST, &format!("/api/v1/meetings/{id}/leave"), Some("bob"), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    // The socket is released and the room closes with its last peer.
    bob.closed().await;
    harness.wait_for_no_rooms().await;
}
