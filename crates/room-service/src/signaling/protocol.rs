//! Signaling wire protocol.
//!
//! Frames are JSON objects `{type, ...fields}` with kebab-case `type` and
//! camelCase fields. The room channel carries [`ClientMessage`] and
//! [`ServerMessage`]; the host's waiting-room channel carries
//! [`HostClientMessage`] and [`HostServerMessage`].

use crate::actors::messages::{PeerSummary, ProducerSummary};
use crate::errors::RoomError;
use crate::media::engine::{
    ConsumerType, DtlsParameters, IceCandidate, IceParameters, RtpParameters,
};
use crate::media::{MediaKind, MediaSource, RtpCapabilities, TransportDirection};
use crate::meetings::model::MeetingSettings;

use chrono::{DateTime, Utc};
use common::types::{ConsumerId, MeetingId, PeerId, ProducerId, RoomId, TransportId, UserId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Requests a room participant can send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    GetRouterCapabilities,
    CreateTransport {
        direction: TransportDirection,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<MediaSource>,
    },
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        consumer_id: ConsumerId,
    },
    CloseProducer {
        producer_id: ProducerId,
    },
    MuteProducer {
        producer_id: ProducerId,
        mute: bool,
    },
    RestartIce {
        transport_id: TransportId,
    },
    RaiseHand {
        raised: bool,
    },
    Leave,
    Ping,
}

impl ClientMessage {
    /// Wire name, used as a metric label and echoed in `error` frames.
    #[must_use]
    pub const fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::GetRouterCapabilities => "get-router-capabilities",
            ClientMessage::CreateTransport { .. } => "create-transport",
            ClientMessage::ConnectTransport { .. } => "connect-transport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ResumeConsumer { .. } => "resume-consumer",
            ClientMessage::CloseProducer { .. } => "close-producer",
            ClientMessage::MuteProducer { .. } => "mute-producer",
            ClientMessage::RestartIce { .. } => "restart-ice",
            ClientMessage::RaiseHand { .. } => "raise-hand",
            ClientMessage::Leave => "leave",
            ClientMessage::Ping => "ping",
        }
    }
}

/// Frames the server sends on a room channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Room snapshot sent once on admission.
    RoomInfo {
        room_id: RoomId,
        meeting_id: MeetingId,
        peer_id: PeerId,
        router_rtp_capabilities: RtpCapabilities,
        peers: Vec<PeerSummary>,
        producers: Vec<ProducerSummary>,
        settings: MeetingSettings,
    },
    RouterCapabilities {
        rtp_capabilities: RtpCapabilities,
    },
    TransportCreated {
        transport_id: TransportId,
        direction: TransportDirection,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },
    TransportConnected {
        transport_id: TransportId,
    },
    ProducerCreated {
        producer_id: ProducerId,
        kind: MediaKind,
        source: MediaSource,
    },
    NewProducer(ProducerSummary),
    ProducerClosed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    ProducerMuted {
        producer_id: ProducerId,
        peer_id: PeerId,
        paused: bool,
    },
    ConsumerCreated {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        consumer_type: ConsumerType,
        producer_paused: bool,
        peer_id: PeerId,
        user_id: UserId,
        display_name: String,
    },
    ConsumerResumed {
        consumer_id: ConsumerId,
    },
    ConsumerClosed {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
    },
    PeerJoined(PeerSummary),
    PeerLeft {
        peer_id: PeerId,
        user_id: UserId,
    },
    HandRaised {
        peer_id: PeerId,
        raised: bool,
    },
    IceRestarted {
        transport_id: TransportId,
        ice_parameters: IceParameters,
    },
    Pong,
    Error {
        kind: String,
        error: String,
        /// Type of the request that failed, when there was one.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request: Option<String>,
    },
    WaitingRoom {
        meeting_id: MeetingId,
        message: String,
    },
    MeetingEnded {
        reason: String,
    },
}

impl ServerMessage {
    /// `error` frame for a failed request. Carries the client-safe message
    /// only.
    #[must_use]
    pub fn error(err: &RoomError, request: Option<&str>) -> Self {
        ServerMessage::Error {
            kind: err.kind().to_string(),
            error: err.client_message(),
            request: request.map(str::to_string),
        }
    }
}

/// Requests on the host's waiting-room channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HostClientMessage {
    ApproveParticipant { participant_id: UserId, approved: bool },
    Ping,
}

/// Frames the server sends on the host's waiting-room channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum HostServerMessage {
    ParticipantWaiting {
        meeting_id: MeetingId,
        participant_id: UserId,
        display_name: String,
        requested_at: DateTime<Utc>,
    },
    ParticipantResponse {
        participant_id: UserId,
        approved: bool,
    },
    Pong,
    Error {
        kind: String,
        error: String,
    },
    MeetingEnded {
        reason: String,
    },
}

impl HostServerMessage {
    #[must_use]
    pub fn error(err: &RoomError) -> Self {
        HostServerMessage::Error {
            kind: err.kind().to_string(),
            error: err.client_message(),
        }
    }
}

/// One decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<M> {
    Message(M),
    /// Frame was not a valid request. Answered with `BadRequest`.
    Malformed { reason: String },
}

impl<M: DeserializeOwned> Inbound<M> {
    /// Decode a text frame.
    pub fn decode(text: &str) -> Self {
        match serde_json::from_str(text) {
            Ok(message) => Inbound::Message(message),
            Err(e) => Inbound::Malformed {
                reason: e.to_string(),
            },
        }
    }
}
