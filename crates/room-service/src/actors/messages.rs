//! Message types for room actor communication.
//!
//! Request/response messages carry a `oneshot` sender in `respond_to`.
//! Room broadcasts reach peer sessions as [`PeerEvent`]s on the bounded
//! channel each session registers at join time.

use crate::errors::RoomError;
use crate::media::{MediaKind, MediaSource, RtpCapabilities};
use crate::meetings::model::ParticipantRole;

use chrono::{DateTime, Utc};
use common::types::{MeetingId, PeerId, ProducerId, RoomId, RouterId, UserId};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A peer as seen by the other peers of its room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub display_name: String,
    pub role: ParticipantRole,
    pub hand_raised: bool,
    pub joined_at: DateTime<Utc>,
}

/// A consumable producer in the room directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub display_name: String,
    pub kind: MediaKind,
    pub source: MediaSource,
    pub paused: bool,
}

/// Events a room delivers to a peer session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    PeerJoined(PeerSummary),
    PeerLeft {
        peer_id: PeerId,
        user_id: UserId,
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
    HandRaised {
        peer_id: PeerId,
        raised: bool,
    },
    MeetingEnded {
        reason: String,
    },
}

/// A peer session asking to enter a room.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub info: PeerSummary,
    /// Room events for this peer. Bounded; a full queue evicts the peer.
    pub events: mpsc::Sender<PeerEvent>,
    /// Cancelled by the room when it evicts the peer.
    pub cancel: CancellationToken,
}

/// Room snapshot returned to a joiner.
#[derive(Debug, Clone)]
pub struct JoinAck {
    /// Peers already in the room, excluding the joiner.
    pub peers: Vec<PeerSummary>,
    pub producers: Vec<ProducerSummary>,
    pub router_rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Whether the peer was still registered.
    pub removed: bool,
    /// Peers left in the room.
    pub remaining: usize,
}

#[derive(Debug, Clone)]
pub struct RoomState {
    pub room_id: RoomId,
    pub meeting_id: MeetingId,
    pub router_id: RouterId,
    pub peers: Vec<PeerSummary>,
    pub producers: Vec<ProducerSummary>,
}

/// Messages handled by `RoomActor`.
#[derive(Debug)]
pub enum RoomMessage {
    Join {
        request: JoinRequest,
        respond_to: oneshot::Sender<Result<JoinAck, RoomError>>,
    },

    Leave {
        peer_id: PeerId,
        respond_to: oneshot::Sender<LeaveOutcome>,
    },

    /// Remove a peer and cancel its session. Replies whether it was present.
    Evict {
        peer_id: PeerId,
        respond_to: oneshot::Sender<bool>,
    },

    /// Publish a producer to the room directory and announce it.
    RegisterProducer {
        producer: ProducerSummary,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    /// Remove a producer from the directory. Returns whether it was listed.
    ProducerClosed {
        producer_id: ProducerId,
        peer_id: PeerId,
        respond_to: oneshot::Sender<bool>,
    },

    ProducerMuted {
        producer_id: ProducerId,
        peer_id: PeerId,
        paused: bool,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    HandRaised {
        peer_id: PeerId,
        raised: bool,
        respond_to: oneshot::Sender<Result<(), RoomError>>,
    },

    LookupProducer {
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Option<ProducerSummary>>,
    },

    GetState {
        respond_to: oneshot::Sender<RoomState>,
    },

    /// Close the room if no peers remain. Returns whether it closed.
    CloseIfEmpty {
        respond_to: oneshot::Sender<bool>,
    },

    /// Meeting ended: notify peers and close the room.
    Teardown {
        reason: String,
        respond_to: oneshot::Sender<()>,
    },
}
