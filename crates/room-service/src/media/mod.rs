//! Media routing engine seam.
//!
//! - `engine` - capability traits and parameter types
//! - `loopback` - in-process engine for development and tests

pub mod engine;
pub mod loopback;

pub use engine::{
    EngineEvent, EngineEventSender, MediaConsumer, MediaEngine, MediaKind, MediaProducer,
    MediaRouter, MediaSource, MediaTransport, RtpCapabilities, RtpCodecCapability,
    TransportDirection,
};
pub use loopback::LoopbackEngine;

use crate::errors::{EngineError, RoomError};
use crate::observability::metrics;

use std::future::Future;
use std::time::{Duration, Instant};
use tracing::warn;

/// Codec set every room router is created with.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut opus_parameters = serde_json::Map::new();
    opus_parameters.insert("useinbandfec".to_string(), 1.into());

    let mut h264_parameters = serde_json::Map::new();
    h264_parameters.insert("packetization-mode".to_string(), 1.into());
    h264_parameters.insert("profile-level-id".to_string(), "42e01f".into());
    h264_parameters.insert("level-asymmetry-allowed".to_string(), 1.into());

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48_000,
            channels: Some(2),
            parameters: opus_parameters,
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90_000,
            channels: None,
            parameters: serde_json::Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: None,
            clock_rate: 90_000,
            channels: None,
            parameters: h264_parameters,
        },
    ]
}

/// Run one engine call under a bounded wait.
///
/// A call that does not resolve within `limit` fails with
/// [`RoomError::EngineTimeout`] naming `operation`.
pub async fn bounded<T>(
    limit: Duration,
    operation: &'static str,
    call: impl Future<Output = Result<T, EngineError>>,
) -> Result<T, RoomError> {
    let started = Instant::now();
    let outcome = tokio::time::timeout(limit, call).await;
    metrics::record_engine_call(operation, started.elapsed());

    match outcome {
        Ok(result) => result.map_err(RoomError::from),
        Err(_) => {
            metrics::record_engine_timeout(operation);
            warn!(
                target: "rs.engine",
                operation,
                timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                "Media engine call timed out"
            );
            Err(RoomError::EngineTimeout(operation.to_string()))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let never = std::future::pending::<Result<(), EngineError>>();
        let result = bounded(Duration::from_secs(10), "create_transport", never).await;
        assert!(matches!(result, Err(RoomError::EngineTimeout(op)) if op == "create_transport"));
    }

    #[tokio::test]
    async fn test_bounded_maps_engine_errors() {
        let call = async { Err::<(), _>(EngineError::Incompatible("p".into())) };
        let result = bounded(Duration::from_secs(1), "consume", call).await;
        assert!(matches!(result, Err(RoomError::CannotConsume(_))));
    }

    #[test]
    fn test_default_codecs_cover_both_kinds() {
        let codecs = default_media_codecs();
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Audio));
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Video));
    }
}
