//! Event bus for meeting and room notifications.
//!
//! Publishing is fire-and-forget: lifecycle code calls [`publish_logged`],
//! which logs failures and never returns them. Subscriptions are live once
//! [`EventBus::subscribe`] returns, so a caller can subscribe and then
//! publish a request without missing the reply.
//!
//! - [`LocalEventBus`] - in-process, one broadcast channel per topic
//! - [`redis::RedisEventBus`] - Redis pub/sub, for multi-node deployments

pub mod redis;

use crate::errors::BusError;
use crate::media::MediaSource;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MeetingId, PeerId, ProducerId, RoomId, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Buffered events per subscription before the forwarder waits.
const SUBSCRIPTION_BUFFER: usize = 64;

/// Capacity of each local broadcast channel.
const LOCAL_TOPIC_CAPACITY: usize = 256;

/// Bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    MeetingCreated,
    MeetingStarted,
    ParticipantJoined,
    ParticipantLeft,
    MeetingEnded,
    MeetingCancelled,
    WaitingRoomJoin,
    WaitingRoomResponse,
    PeerJoined,
    PeerLeft,
    ProducerCreated,
    ProducerClosed,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::MeetingCreated => "meeting:created",
            Topic::MeetingStarted => "meeting:started",
            Topic::ParticipantJoined => "meeting:participant:joined",
            Topic::ParticipantLeft => "meeting:participant:left",
            Topic::MeetingEnded => "meeting:ended",
            Topic::MeetingCancelled => "meeting:cancelled",
            Topic::WaitingRoomJoin => "meeting:waiting-room:join",
            Topic::WaitingRoomResponse => "meeting:waiting-room:response",
            Topic::PeerJoined => "room:peer:joined",
            Topic::PeerLeft => "room:peer:left",
            Topic::ProducerCreated => "room:producer:created",
            Topic::ProducerClosed => "room:producer:closed",
        }
    }
}

/// A live subscription. Dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<serde_json::Value>,
    _guard: DropGuard,
}

impl Subscription {
    /// Wrap a receiver fed by a forwarding task that stops when `cancel`
    /// fires.
    pub fn new(receiver: mpsc::Receiver<serde_json::Value>, cancel: CancellationToken) -> Self {
        Self {
            receiver,
            _guard: cancel.drop_guard(),
        }
    }

    /// Next event, or `None` once the bus side has gone away.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        self.receiver.recv().await
    }
}

#[async_trait]
pub trait EventBus: Send + Sync + 'static {
    async fn publish(&self, topic: Topic, payload: serde_json::Value) -> Result<(), BusError>;

    async fn subscribe(&self, topic: Topic) -> Result<Subscription, BusError>;
}

/// Publish and log a failure instead of returning it.
pub async fn publish_logged<T: Serialize + Sync>(bus: &dyn EventBus, topic: Topic, payload: &T) {
    let payload = match serde_json::to_value(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!(target: "rs.bus", topic = topic.as_str(), error = %e, "Failed to encode event");
            return;
        }
    };
    if let Err(e) = bus.publish(topic, payload).await {
        warn!(target: "rs.bus", topic = topic.as_str(), error = %e, "Failed to publish event");
    }
}

/// In-process bus.
#[derive(Debug)]
pub struct LocalEventBus {
    topics: Mutex<HashMap<Topic, broadcast::Sender<serde_json::Value>>>,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn sender(&self, topic: Topic) -> broadcast::Sender<serde_json::Value> {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        topics
            .entry(topic)
            .or_insert_with(|| broadcast::channel(LOCAL_TOPIC_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, topic: Topic, payload: serde_json::Value) -> Result<(), BusError> {
        // No subscribers is not an error.
        let delivered = self.sender(topic).send(payload).unwrap_or(0);
        debug!(target: "rs.bus", topic = topic.as_str(), delivered, "Published event");
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> Result<Subscription, BusError> {
        let mut source = self.sender(topic).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let cancel = CancellationToken::new();
        let stop = cancel.clone();

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    () = stop.cancelled() => break,
                    next = source.recv() => next,
                };
                match next {
                    Ok(payload) => {
                        if tx.send(payload).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "rs.bus",
                            topic = topic.as_str(),
                            skipped,
                            "Subscriber lagged, events dropped"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx, cancel))
    }
}

/// Host-notification payload for a participant parked in the waiting room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingRoomJoinEvent {
    pub meeting_id: MeetingId,
    pub host_id: UserId,
    pub participant_id: UserId,
    pub display_name: String,
    pub requested_at: DateTime<Utc>,
}

/// Host decision on a waiting participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WaitingRoomResponseEvent {
    pub meeting_id: MeetingId,
    pub participant_id: UserId,
    pub approved: bool,
}

/// Lifecycle payload shared by created/started/ended/cancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingEvent {
    pub meeting_id: MeetingId,
    pub room_id: RoomId,
    pub host_id: UserId,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantEvent {
    pub meeting_id: MeetingId,
    pub user_id: UserId,
    pub display_name: String,
    pub at: DateTime<Utc>,
}

/// Room membership payload for `room:peer:*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPeerEvent {
    pub room_id: RoomId,
    pub meeting_id: MeetingId,
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub display_name: String,
    pub at: DateTime<Utc>,
}

/// Producer directory payload for `room:producer:*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomProducerEvent {
    pub room_id: RoomId,
    pub meeting_id: MeetingId,
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub source: MediaSource,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribe_then_publish_delivers() {
        let bus = LocalEventBus::new();
        let mut sub = bus.subscribe(Topic::MeetingEnded).await.unwrap();
        bus.publish(Topic::MeetingEnded, serde_json::json!({"n": 1}))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, serde_json::json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let bus = LocalEventBus::new();
        let mut ended = bus.subscribe(Topic::MeetingEnded).await.unwrap();
        bus.publish(Topic::MeetingCreated, serde_json::json!({}))
            .await
            .unwrap();

        let nothing = tokio::time::timeout(Duration::from_millis(50), ended.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = LocalEventBus::new();
        assert!(bus
            .publish(Topic::PeerJoined, serde_json::json!({}))
            .await
            .is_ok());
    }

    #[test]
    fn test_waiting_room_payload_shape() {
        let event = WaitingRoomResponseEvent {
            meeting_id: MeetingId::new(),
            participant_id: UserId::from("u-7"),
            approved: true,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json.get("participantId"), Some(&serde_json::json!("u-7")));
        assert_eq!(Topic::WaitingRoomJoin.as_str(), "meeting:waiting-room:join");
    }
}
