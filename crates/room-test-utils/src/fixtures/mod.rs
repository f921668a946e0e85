//! Pre-configured test data fixtures for Room Service testing.
//!
//! Provides:
//! - Access tokens signed with the test secret
//! - Service configuration matching that secret
//! - Meeting creation requests
//! - Media parameters a client would send

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{Duration as ChronoDuration, Utc};
use common::secret::SecretString;
use common::types::{RoomId, UserId};
use jsonwebtoken::{encode, EncodingKey, Header};
use room_service::auth::Claims;
use room_service::config::Config;
use room_service::media::{default_media_codecs, MediaKind, RtpCapabilities};
use room_service::media::engine::{DtlsFingerprint, DtlsParameters, RtpParameters};
use room_service::meetings::{CreateMeeting, MeetingFlags, MeetingSettings};
use std::collections::HashMap;

/// HS256 secret shared by the fixtures and [`test_config`].
pub const TEST_JWT_SECRET: &[u8] = b"room-service-test-secret-32bytes!";

/// Configuration for tests: the test secret, short timeouts, guests allowed.
#[must_use]
pub fn test_config() -> Config {
    let vars = HashMap::from([
        ("ROOM_JWT_SECRET".to_string(), STANDARD.encode(TEST_JWT_SECRET)),
        ("ROOM_ENGINE_TIMEOUT_MS".to_string(), "2000".to_string()),
        ("ROOM_OUTBOUND_BUFFER".to_string(), "64".to_string()),
        ("ROOM_SHUTDOWN_GRACE_SECONDS".to_string(), "1".to_string()),
    ]);
    Config::from_vars(&vars).expect("test configuration is valid")
}

/// Token for `user_id`, valid for an hour.
#[must_use]
pub fn mint_token(user_id: &str, name: Option<&str>) -> String {
    sign(Claims {
        sub: user_id.to_string(),
        name: name.map(str::to_string),
        exp: (Utc::now() + ChronoDuration::hours(1)).timestamp(),
        iat: Utc::now().timestamp(),
    })
}

/// Token that expired an hour ago.
#[must_use]
pub fn expired_token(user_id: &str) -> String {
    sign(Claims {
        sub: user_id.to_string(),
        name: None,
        exp: (Utc::now() - ChronoDuration::hours(1)).timestamp(),
        iat: (Utc::now() - ChronoDuration::hours(2)).timestamp(),
    })
}

fn sign(claims: Claims) -> String {
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(TEST_JWT_SECRET),
    )
    .expect("token signs")
}

/// Meeting creation request builder.
#[derive(Debug, Clone, Default)]
pub struct TestMeeting {
    request: CreateMeeting,
}

impl TestMeeting {
    /// Active meeting bound to `room_id`.
    #[must_use]
    pub fn new(room_id: &str) -> Self {
        Self {
            request: CreateMeeting {
                title: Some(format!("Meeting in {room_id}")),
                room_id: Some(RoomId::from(room_id)),
                ..CreateMeeting::default()
            },
        }
    }

    #[must_use]
    pub fn with_password(mut self, password: &str) -> Self {
        self.request.password = Some(SecretString::from(password.to_string()));
        self
    }

    #[must_use]
    pub fn with_max_participants(mut self, max: u32) -> Self {
        self.request.max_participants = Some(max);
        self
    }

    #[must_use]
    pub fn with_waiting_room(mut self) -> Self {
        self.request.flags.is_waiting_room_enabled = true;
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: MeetingFlags) -> Self {
        self.request.flags = flags;
        self
    }

    #[must_use]
    pub fn with_settings(mut self, settings: MeetingSettings) -> Self {
        self.request.settings = settings;
        self
    }

    /// Host leaving ends the meeting.
    #[must_use]
    pub fn ending_when_host_leaves(mut self) -> Self {
        self.request.settings.end_when_host_leaves = true;
        self
    }

    #[must_use]
    pub fn scheduled_in(mut self, delay: ChronoDuration) -> Self {
        self.request.start_time = Some(Utc::now() + delay);
        self
    }

    #[must_use]
    pub fn with_co_host(mut self, user_id: &str) -> Self {
        self.request.co_host_ids.push(UserId::from(user_id));
        self
    }

    #[must_use]
    pub fn build(self) -> CreateMeeting {
        self.request
    }
}

/// Receive capabilities supporting every codec rooms are created with.
#[must_use]
pub fn full_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs(),
        header_extensions: Vec::new(),
    }
}

/// Receive capabilities with audio codecs only.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs()
            .into_iter()
            .filter(|codec| codec.kind == MediaKind::Audio)
            .collect(),
        header_extensions: Vec::new(),
    }
}

#[must_use]
pub fn dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: Some("client".to_string()),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89:AB:CD:EF:01:23:45:67:89".to_string(),
        }],
    }
}

/// Send-side RTP parameters for `kind`.
#[must_use]
pub fn rtp_parameters(kind: MediaKind) -> RtpParameters {
    let (mime_type, clock_rate) = match kind {
        MediaKind::Audio => ("audio/opus", 48_000),
        MediaKind::Video => ("video/VP8", 90_000),
    };
    serde_json::json!({
        "codecs": [{ "mimeType": mime_type, "payloadType": 100, "clockRate": clock_rate }],
        "encodings": [{ "ssrc": 1111 }],
    })
}
