//! Media routing engine capability interface.
//!
//! The room service never forwards media itself. It asks an engine (an SFU)
//! for routers, transports, producers and consumers through these traits and
//! keeps the returned handles in its own maps. Handles are referenced across
//! owners by id only.
//!
//! Lifecycle notifications that originate inside the engine (a transport whose
//! DTLS state closed, a consumer whose producer went away) are not delivered
//! as callbacks. The engine pushes [`EngineEvent`]s onto the channel handed
//! to [`MediaRouter::create_transport`], and the owning peer session handles
//! them on its own turn.

use crate::errors::EngineError;

use async_trait::async_trait;
use common::types::{ConsumerId, PeerId, ProducerId, RouterId, TransportId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Opaque RTP parameters. The coordinator relays them between client and
/// engine without interpreting them.
pub type RtpParameters = serde_json::Value;

/// Media kind of a producer or consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

/// What a producer captures. Screen shares travel as video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    Microphone,
    Camera,
    Screen,
}

impl MediaSource {
    /// Source assumed when the client does not name one.
    #[must_use]
    pub const fn default_for(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => MediaSource::Microphone,
            MediaKind::Video => MediaSource::Camera,
        }
    }
}

/// Transport direction, from the client's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// One codec a router (or a receiving client) supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// RTP capabilities of a router or a receiving client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Everything the far end needs to establish a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParameters {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    pub direction: TransportDirection,
    pub peer_id: PeerId,
}

/// Producer creation request. `peer_id` plays the role of application data
/// so engine-side tooling can attribute streams.
#[derive(Debug, Clone)]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub peer_id: PeerId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
}

/// Lifecycle notifications raised by the engine itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Transport closed underneath its owner (DTLS failure, router closed).
    TransportClosed { transport_id: TransportId },
    /// Producer closed because its transport closed.
    ProducerClosed { producer_id: ProducerId },
    /// Consumer closed because its producer or its transport closed.
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
}

/// Sender side of the engine event channel. Unbounded because the engine
/// raises events from contexts that cannot await.
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Entry point of a media routing engine.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Whether the engine can create routers. False after a structural
    /// failure (worker died).
    fn is_available(&self) -> bool;

    /// Create a router supporting the given codec set.
    async fn create_router(
        &self,
        codecs: &[RtpCodecCapability],
    ) -> Result<Arc<dyn MediaRouter>, EngineError>;
}

/// Per-room router.
#[async_trait]
pub trait MediaRouter: Send + Sync {
    fn id(&self) -> RouterId;

    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether a client with `rtp_capabilities` can receive `producer_id`.
    fn can_consume(&self, producer_id: ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_transport(
        &self,
        options: TransportOptions,
        events: EngineEventSender,
    ) -> Result<Arc<dyn MediaTransport>, EngineError>;

    /// Close the router and everything created on it.
    async fn close(&self);
}

#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> TransportId;

    fn parameters(&self) -> TransportParameters;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> Result<(), EngineError>;

    async fn produce(&self, request: ProduceRequest) -> Result<Arc<dyn MediaProducer>, EngineError>;

    /// Create a consumer. Consumers start paused.
    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<Arc<dyn MediaConsumer>, EngineError>;

    async fn restart_ice(&self) -> Result<IceParameters, EngineError>;

    /// Close the transport, cascading to its producers and consumers.
    async fn close(&self);
}

#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    async fn pause(&self) -> Result<(), EngineError>;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn consumer_type(&self) -> ConsumerType;

    fn producer_paused(&self) -> bool;

    async fn resume(&self) -> Result<(), EngineError>;

    async fn close(&self);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_wire_shape() {
        let json = serde_json::json!({
            "codecs": [
                {"kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2},
                {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000}
            ]
        });

        let caps: RtpCapabilities = serde_json::from_value(json).unwrap();
        assert_eq!(caps.codecs.len(), 2);
        assert_eq!(caps.codecs.first().map(|c| c.kind), Some(MediaKind::Audio));

        let back = serde_json::to_value(&caps).unwrap();
        assert!(back.get("headerExtensions").is_none());
        assert_eq!(
            back.pointer("/codecs/1/mimeType"),
            Some(&serde_json::json!("video/VP8"))
        );
    }

    #[test]
    fn test_default_source() {
        assert_eq!(MediaSource::default_for(MediaKind::Audio), MediaSource::Microphone);
        assert_eq!(MediaSource::default_for(MediaKind::Video), MediaSource::Camera);
    }

    #[test]
    fn test_ice_candidate_type_field() {
        let candidate = IceCandidate {
            foundation: "udpcandidate".into(),
            priority: 1_076_302_079,
            ip: "127.0.0.1".into(),
            port: 40000,
            protocol: "udp".into(),
            candidate_type: "host".into(),
        };
        let json = serde_json::to_value(&candidate).unwrap();
        assert_eq!(json.get("type"), Some(&serde_json::json!("host")));
    }
}
