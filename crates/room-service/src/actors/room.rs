//! `RoomActor` - per-room actor that owns the live room state.
//!
//! Each `RoomActor`:
//! - Owns the room's media router and closes it exactly once
//! - Owns the peer map and the producer directory (single writer)
//! - Fans room events out to peer sessions
//!
//! Engine calls made on behalf of a peer (transports, produce, consume) run
//! in that peer's session, not here; the actor only registers and
//! deregisters the results, so a slow engine call never blocks the room.
//!
//! # Slow Peers
//!
//! Events are delivered with `try_send`. A peer whose queue is full is
//! evicted from the room and its session cancelled, so one stalled
//! connection cannot hold back the rest of the room.

use crate::errors::RoomError;
use crate::media::MediaRouter;
use crate::observability::metrics;

use super::messages::{
    JoinAck, JoinRequest, LeaveOutcome, PeerEvent, PeerSummary, ProducerSummary, RoomMessage,
    RoomState,
};
use super::metrics::{ActorType, MailboxMonitor};

use common::types::{MeetingId, PeerId, ProducerId, RoomId, RouterId, UserId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 500;

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: RoomId,
    meeting_id: MeetingId,
    router: Arc<dyn MediaRouter>,
}

impl RoomHandle {
    #[must_use]
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    #[must_use]
    pub fn meeting_id(&self) -> MeetingId {
        self.meeting_id
    }

    /// The room's router. Peer sessions call the engine through it directly.
    #[must_use]
    pub fn router(&self) -> Arc<dyn MediaRouter> {
        Arc::clone(&self.router)
    }

    /// Router id, which also identifies this room instance.
    #[must_use]
    pub fn router_id(&self) -> RouterId {
        self.router.id()
    }

    /// Whether the room has closed or is closing.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomMessage,
    ) -> Result<T, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|e| RoomError::Internal(format!("channel send failed: {e}")))?;
        rx.await
            .map_err(|e| RoomError::Internal(format!("response receive failed: {e}")))
    }

    /// Register a peer. Existing peers are told before the snapshot returns.
    pub async fn join(&self, request: JoinRequest) -> Result<JoinAck, RoomError> {
        self.request(|respond_to| RoomMessage::Join {
            request,
            respond_to,
        })
        .await?
    }

    pub async fn leave(&self, peer_id: PeerId) -> Result<LeaveOutcome, RoomError> {
        self.request(|respond_to| RoomMessage::Leave {
            peer_id,
            respond_to,
        })
        .await
    }

    /// Remove a peer whose participant left out of band. Its session is
    /// cancelled and runs its own disconnect path.
    pub async fn evict(&self, peer_id: PeerId) -> Result<bool, RoomError> {
        self.request(|respond_to| RoomMessage::Evict {
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn register_producer(&self, producer: ProducerSummary) -> Result<(), RoomError> {
        self.request(|respond_to| RoomMessage::RegisterProducer {
            producer,
            respond_to,
        })
        .await?
    }

    pub async fn producer_closed(
        &self,
        producer_id: ProducerId,
        peer_id: PeerId,
    ) -> Result<bool, RoomError> {
        self.request(|respond_to| RoomMessage::ProducerClosed {
            producer_id,
            peer_id,
            respond_to,
        })
        .await
    }

    pub async fn producer_muted(
        &self,
        producer_id: ProducerId,
        peer_id: PeerId,
        paused: bool,
    ) -> Result<(), RoomError> {
        self.request(|respond_to| RoomMessage::ProducerMuted {
            producer_id,
            peer_id,
            paused,
            respond_to,
        })
        .await?
    }

    pub async fn hand_raised(&self, peer_id: PeerId, raised: bool) -> Result<(), RoomError> {
        self.request(|respond_to| RoomMessage::HandRaised {
            peer_id,
            raised,
            respond_to,
        })
        .await?
    }

    pub async fn lookup_producer(
        &self,
        producer_id: ProducerId,
    ) -> Result<Option<ProducerSummary>, RoomError> {
        self.request(|respond_to| RoomMessage::LookupProducer {
            producer_id,
            respond_to,
        })
        .await
    }

    pub async fn get_state(&self) -> Result<RoomState, RoomError> {
        self.request(|respond_to| RoomMessage::GetState { respond_to })
            .await
    }

    pub async fn close_if_empty(&self) -> Result<bool, RoomError> {
        self.request(|respond_to| RoomMessage::CloseIfEmpty { respond_to })
            .await
    }

    pub async fn teardown(&self, reason: impl Into<String>) -> Result<(), RoomError> {
        let reason = reason.into();
        self.request(|respond_to| RoomMessage::Teardown { reason, respond_to })
            .await
    }
}

struct PeerEntry {
    info: PeerSummary,
    events: mpsc::Sender<PeerEvent>,
    cancel: CancellationToken,
}

/// Which peers a broadcast goes to.
#[derive(Debug, Clone, Copy)]
enum Audience {
    All,
    AllExcept(PeerId),
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: RoomId,
    meeting_id: MeetingId,
    router: Arc<dyn MediaRouter>,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    peers: HashMap<PeerId, PeerEntry>,
    /// Join order, for stable snapshots.
    peer_order: Vec<PeerId>,
    producers: HashMap<ProducerId, ProducerSummary>,
    producer_order: Vec<ProducerId>,
    engine_timeout: Duration,
    router_closed: bool,
    mailbox: MailboxMonitor,
}

impl RoomActor {
    /// Spawn a room actor around an already created router.
    pub fn spawn(
        room_id: RoomId,
        meeting_id: MeetingId,
        router: Arc<dyn MediaRouter>,
        engine_timeout: Duration,
        cancel_token: CancellationToken,
    ) -> (RoomHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            meeting_id,
            router: Arc::clone(&router),
            receiver,
            cancel_token: cancel_token.clone(),
            peers: HashMap::new(),
            peer_order: Vec::new(),
            producers: HashMap::new(),
            producer_order: Vec::new(),
            engine_timeout,
            router_closed: false,
            mailbox: MailboxMonitor::new(ActorType::Room, room_id.as_str()),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomHandle {
            sender,
            cancel_token,
            room_id,
            meeting_id,
            router,
        };

        (handle, task_handle)
    }

    #[instrument(
        skip_all,
        name = "rs.actor.room",
        fields(room_id = %self.room_id, meeting_id = %self.meeting_id)
    )]
    async fn run(mut self) {
        info!(
            target: "rs.room",
            room_id = %self.room_id,
            router_id = %self.router.id(),
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "rs.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    self.notify_all(PeerEvent::MeetingEnded {
                        reason: "Server shutting down".to_string(),
                    });
                    self.close_resources().await;
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.observe(self.receiver.len());
                            if self.handle_message(message).await {
                                break;
                            }
                        }
                        None => {
                            self.close_resources().await;
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "rs.room",
            room_id = %self.room_id,
            messages_processed = self.mailbox.messages_processed(),
            "RoomActor stopped"
        );
    }

    /// Handle one message. Returns true when the actor should exit.
    async fn handle_message(&mut self, message: RoomMessage) -> bool {
        match message {
            RoomMessage::Join {
                request,
                respond_to,
            } => {
                let ack = self.handle_join(request);
                let _ = respond_to.send(Ok(ack));
            }

            RoomMessage::Leave {
                peer_id,
                respond_to,
            } => {
                let removed = self.remove_peer(peer_id);
                let _ = respond_to.send(LeaveOutcome {
                    removed,
                    remaining: self.peers.len(),
                });
            }

            RoomMessage::Evict {
                peer_id,
                respond_to,
            } => {
                if let Some(entry) = self.peers.get(&peer_id) {
                    entry.cancel.cancel();
                }
                let _ = respond_to.send(self.remove_peer(peer_id));
            }

            RoomMessage::RegisterProducer {
                producer,
                respond_to,
            } => {
                let result = self.handle_register_producer(producer);
                let _ = respond_to.send(result);
            }

            RoomMessage::ProducerClosed {
                producer_id,
                peer_id,
                respond_to,
            } => {
                let listed = self
                    .producers
                    .get(&producer_id)
                    .is_some_and(|p| p.peer_id == peer_id);
                if listed {
                    self.unlist_producer(producer_id);
                    self.broadcast(
                        Audience::All,
                        PeerEvent::ProducerClosed {
                            producer_id,
                            peer_id,
                        },
                    );
                }
                let _ = respond_to.send(listed);
            }

            RoomMessage::ProducerMuted {
                producer_id,
                peer_id,
                paused,
                respond_to,
            } => {
                let result = match self.producers.get_mut(&producer_id) {
                    Some(producer) if producer.peer_id == peer_id => {
                        producer.paused = paused;
                        Ok(())
                    }
                    Some(_) => Err(RoomError::Forbidden(
                        "Only the owner may mute this producer".to_string(),
                    )),
                    None => Err(RoomError::NotFound("Producer".to_string())),
                };
                if result.is_ok() {
                    self.broadcast(
                        Audience::All,
                        PeerEvent::ProducerMuted {
                            producer_id,
                            peer_id,
                            paused,
                        },
                    );
                }
                let _ = respond_to.send(result);
            }

            RoomMessage::HandRaised {
                peer_id,
                raised,
                respond_to,
            } => {
                let result = match self.peers.get_mut(&peer_id) {
                    Some(entry) => {
                        entry.info.hand_raised = raised;
                        Ok(())
                    }
                    None => Err(RoomError::InvalidState(
                        "Peer is not in the room".to_string(),
                    )),
                };
                if result.is_ok() {
                    self.broadcast(Audience::All, PeerEvent::HandRaised { peer_id, raised });
                }
                let _ = respond_to.send(result);
            }

            RoomMessage::LookupProducer {
                producer_id,
                respond_to,
            } => {
                let _ = respond_to.send(self.producers.get(&producer_id).cloned());
            }

            RoomMessage::GetState { respond_to } => {
                let _ = respond_to.send(RoomState {
                    room_id: self.room_id.clone(),
                    meeting_id: self.meeting_id,
                    router_id: self.router.id(),
                    peers: self.peer_snapshot(None),
                    producers: self.producer_snapshot(),
                });
            }

            RoomMessage::CloseIfEmpty { respond_to } => {
                if self.peers.is_empty() {
                    self.close_resources().await;
                    let _ = respond_to.send(true);
                    return true;
                }
                let _ = respond_to.send(false);
            }

            RoomMessage::Teardown { reason, respond_to } => {
                info!(
                    target: "rs.room",
                    room_id = %self.room_id,
                    peers = self.peers.len(),
                    "Tearing down room"
                );
                self.notify_all(PeerEvent::MeetingEnded { reason });
                self.close_resources().await;
                let _ = respond_to.send(());
                return true;
            }
        }
        false
    }

    fn handle_join(&mut self, request: JoinRequest) -> JoinAck {
        let JoinRequest {
            info,
            events,
            cancel,
        } = request;
        let peer_id = info.peer_id;

        // A newer connection of the same user replaces the older one.
        if let Some(previous) = self.peer_of_user(&info.user_id, peer_id) {
            info!(
                target: "rs.room",
                room_id = %self.room_id,
                user_id = %info.user_id,
                superseded_peer_id = %previous,
                "Superseding previous connection of user"
            );
            if let Some(entry) = self.peers.get(&previous) {
                entry.cancel.cancel();
            }
            self.remove_peer(previous);
        }

        let ack = JoinAck {
            peers: self.peer_snapshot(Some(peer_id)),
            producers: self.producer_snapshot(),
            router_rtp_capabilities: self.router.rtp_capabilities(),
        };

        // Existing peers hear about the joiner before it can produce.
        self.broadcast(Audience::AllExcept(peer_id), PeerEvent::PeerJoined(info.clone()));

        self.peers.insert(
            peer_id,
            PeerEntry {
                info,
                events,
                cancel,
            },
        );
        self.peer_order.push(peer_id);

        debug!(
            target: "rs.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            peers = self.peers.len(),
            "Peer joined room"
        );
        ack
    }

    fn handle_register_producer(&mut self, producer: ProducerSummary) -> Result<(), RoomError> {
        if !self.peers.contains_key(&producer.peer_id) {
            return Err(RoomError::InvalidState("Peer is not in the room".to_string()));
        }
        let owner = producer.peer_id;
        let producer_id = producer.producer_id;
        self.producers.insert(producer_id, producer.clone());
        self.producer_order.push(producer_id);
        self.broadcast(Audience::AllExcept(owner), PeerEvent::NewProducer(producer));
        Ok(())
    }

    fn peer_of_user(&self, user_id: &UserId, except: PeerId) -> Option<PeerId> {
        self.peers
            .iter()
            .find(|(id, entry)| **id != except && &entry.info.user_id == user_id)
            .map(|(id, _)| *id)
    }

    /// Remove a peer, unlisting its producers. Returns whether it was present.
    fn remove_peer(&mut self, peer_id: PeerId) -> bool {
        let mut pending = vec![peer_id];
        let mut removed_requested = false;

        // Evicting slow peers during these broadcasts can remove more peers.
        while let Some(next) = pending.pop() {
            let Some(entry) = self.peers.remove(&next) else {
                continue;
            };
            if next == peer_id {
                removed_requested = true;
            }
            self.peer_order.retain(|id| *id != next);

            let owned: Vec<ProducerId> = self
                .producer_order
                .iter()
                .filter(|id| self.producers.get(*id).is_some_and(|p| p.peer_id == next))
                .copied()
                .collect();
            for producer_id in owned {
                self.unlist_producer(producer_id);
                pending.extend(self.deliver(
                    Audience::All,
                    &PeerEvent::ProducerClosed {
                        producer_id,
                        peer_id: next,
                    },
                ));
            }

            pending.extend(self.deliver(
                Audience::All,
                &PeerEvent::PeerLeft {
                    peer_id: next,
                    user_id: entry.info.user_id.clone(),
                },
            ));

            debug!(
                target: "rs.room",
                room_id = %self.room_id,
                peer_id = %next,
                remaining = self.peers.len(),
                "Peer removed from room"
            );
        }
        removed_requested
    }

    fn unlist_producer(&mut self, producer_id: ProducerId) {
        self.producers.remove(&producer_id);
        self.producer_order.retain(|id| *id != producer_id);
    }

    fn broadcast(&mut self, audience: Audience, event: PeerEvent) {
        let slow = self.deliver(audience, &event);
        for peer_id in slow {
            self.remove_peer(peer_id);
        }
    }

    /// Enqueue `event` for `audience`. Returns peers that must be evicted.
    fn deliver(&self, audience: Audience, event: &PeerEvent) -> Vec<PeerId> {
        let mut slow = Vec::new();
        for peer_id in &self.peer_order {
            if let Audience::AllExcept(excluded) = audience {
                if *peer_id == excluded {
                    continue;
                }
            }
            let Some(entry) = self.peers.get(peer_id) else {
                continue;
            };
            match entry.events.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        target: "rs.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        "Peer event queue full, evicting slow peer"
                    );
                    metrics::record_slow_peer_eviction();
                    entry.cancel.cancel();
                    slow.push(*peer_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Session already gone; its leave is on the way.
                }
            }
        }
        slow
    }

    /// Best-effort notice to every peer, without eviction.
    fn notify_all(&self, event: PeerEvent) {
        for entry in self.peers.values() {
            if entry.events.try_send(event.clone()).is_err() {
                entry.cancel.cancel();
            }
        }
    }

    fn peer_snapshot(&self, exclude: Option<PeerId>) -> Vec<PeerSummary> {
        self.peer_order
            .iter()
            .filter(|id| Some(**id) != exclude)
            .filter_map(|id| self.peers.get(id))
            .map(|entry| entry.info.clone())
            .collect()
    }

    fn producer_snapshot(&self) -> Vec<ProducerSummary> {
        self.producer_order
            .iter()
            .filter_map(|id| self.producers.get(id))
            .cloned()
            .collect()
    }

    /// Close the router once and mark the room closed.
    async fn close_resources(&mut self) {
        // Mark closed first so racing callers stop routing joins here.
        self.cancel_token.cancel();

        if self.router_closed {
            return;
        }
        self.router_closed = true;

        self.peers.clear();
        self.peer_order.clear();
        self.producers.clear();
        self.producer_order.clear();

        if tokio::time::timeout(self.engine_timeout, self.router.close())
            .await
            .is_err()
        {
            metrics::record_engine_timeout("close_router");
            warn!(
                target: "rs.room",
                room_id = %self.room_id,
                "Router close timed out"
            );
        }

        info!(
            target: "rs.room",
            room_id = %self.room_id,
            router_id = %self.router.id(),
            "Room closed"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::{default_media_codecs, LoopbackEngine, MediaEngine, MediaKind, MediaSource};
    use crate::meetings::model::ParticipantRole;
    use chrono::Utc;

    async fn spawn_room() -> (RoomHandle, JoinHandle<()>) {
        let engine = LoopbackEngine::new();
        let router = engine.create_router(&default_media_codecs()).await.unwrap();
        RoomActor::spawn(
            RoomId::from("room-1"),
            MeetingId::new(),
            router,
            Duration::from_secs(5),
            CancellationToken::new(),
        )
    }

    fn summary(user: &str) -> PeerSummary {
        PeerSummary {
            peer_id: PeerId::new(),
            user_id: UserId::from(user),
            display_name: user.to_string(),
            role: ParticipantRole::Participant,
            hand_raised: false,
            joined_at: Utc::now(),
        }
    }

    fn join_request(info: PeerSummary, capacity: usize) -> (JoinRequest, mpsc::Receiver<PeerEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            JoinRequest {
                info,
                events: tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    fn producer_of(peer: &PeerSummary) -> ProducerSummary {
        ProducerSummary {
            producer_id: ProducerId::new(),
            peer_id: peer.peer_id,
            user_id: peer.user_id.clone(),
            display_name: peer.display_name.clone(),
            kind: MediaKind::Video,
            source: MediaSource::Camera,
            paused: false,
        }
    }

    #[tokio::test]
    async fn test_join_snapshot_excludes_self_and_notifies_others() {
        let (room, _task) = spawn_room().await;
        let alice = summary("alice");
        let bob = summary("bob");

        let (req_a, mut events_a) = join_request(alice.clone(), 16);
        let ack_a = room.join(req_a).await.unwrap();
        assert!(ack_a.peers.is_empty());
        assert!(!ack_a.router_rtp_capabilities.codecs.is_empty());

        let (req_b, _events_b) = join_request(bob.clone(), 16);
        let ack_b = room.join(req_b).await.unwrap();
        assert_eq!(ack_b.peers, vec![alice.clone()]);

        assert_eq!(events_a.recv().await, Some(PeerEvent::PeerJoined(bob)));
    }

    #[tokio::test]
    async fn test_new_producer_goes_to_others_only() {
        let (room, _task) = spawn_room().await;
        let alice = summary("alice");
        let bob = summary("bob");
        let (req_a, mut events_a) = join_request(alice.clone(), 16);
        room.join(req_a).await.unwrap();
        let (req_b, mut events_b) = join_request(bob.clone(), 16);
        room.join(req_b).await.unwrap();
        let _ = events_a.recv().await; // peer-joined bob

        let producer = producer_of(&alice);
        room.register_producer(producer.clone()).await.unwrap();

        assert_eq!(events_b.recv().await, Some(PeerEvent::NewProducer(producer.clone())));
        assert!(events_a.try_recv().is_err());

        // Late joiner sees it in the snapshot.
        let (req_c, _events_c) = join_request(summary("carol"), 16);
        let ack_c = room.join(req_c).await.unwrap();
        assert_eq!(ack_c.producers, vec![producer]);
    }

    #[tokio::test]
    async fn test_leave_unlists_producers_then_announces() {
        let (room, _task) = spawn_room().await;
        let alice = summary("alice");
        let bob = summary("bob");
        let (req_a, _events_a) = join_request(alice.clone(), 16);
        room.join(req_a).await.unwrap();
        let (req_b, mut events_b) = join_request(bob.clone(), 16);
        room.join(req_b).await.unwrap();

        let producer = producer_of(&alice);
        room.register_producer(producer.clone()).await.unwrap();
        let _ = events_b.recv().await; // new-producer

        let outcome = room.leave(alice.peer_id).await.unwrap();
        assert!(outcome.removed);
        assert_eq!(outcome.remaining, 1);

        assert_eq!(
            events_b.recv().await,
            Some(PeerEvent::ProducerClosed {
                producer_id: producer.producer_id,
                peer_id: alice.peer_id
            })
        );
        assert_eq!(
            events_b.recv().await,
            Some(PeerEvent::PeerLeft {
                peer_id: alice.peer_id,
                user_id: alice.user_id.clone()
            })
        );

        // Leaving twice is harmless.
        let again = room.leave(alice.peer_id).await.unwrap();
        assert!(!again.removed);
    }

    #[tokio::test]
    async fn test_mute_requires_owner() {
        let (room, _task) = spawn_room().await;
        let alice = summary("alice");
        let bob = summary("bob");
        let (req_a, _a) = join_request(alice.clone(), 16);
        room.join(req_a).await.unwrap();
        let (req_b, _b) = join_request(bob.clone(), 16);
        room.join(req_b).await.unwrap();

        let producer = producer_of(&alice);
        room.register_producer(producer.clone()).await.unwrap();

        let result = room.producer_muted(producer.producer_id, bob.peer_id, true).await;
        assert!(matches!(result, Err(RoomError::Forbidden(_))));

        room.producer_muted(producer.producer_id, alice.peer_id, true)
            .await
            .unwrap();
        let state = room.get_state().await.unwrap();
        assert!(state.producers.first().unwrap().paused);
    }

    #[tokio::test]
    async fn test_slow_peer_is_evicted() {
        let (room, _task) = spawn_room().await;
        let slow = summary("slow");
        let (req_slow, _events_slow) = join_request(slow.clone(), 1);
        let slow_cancel = req_slow.cancel.clone();
        room.join(req_slow).await.unwrap();

        // Fills the single slot.
        let (req_a, _a) = join_request(summary("a"), 16);
        room.join(req_a).await.unwrap();
        // Overflows it.
        let (req_b, _b) = join_request(summary("b"), 16);
        room.join(req_b).await.unwrap();

        assert!(slow_cancel.is_cancelled());
        let state = room.get_state().await.unwrap();
        assert_eq!(state.peers.len(), 2);
        assert!(state.peers.iter().all(|p| p.peer_id != slow.peer_id));
    }

    #[tokio::test]
    async fn test_same_user_supersedes_previous_connection() {
        let (room, _task) = spawn_room().await;
        let first = summary("alice");
        let (req_1, _e1) = join_request(first.clone(), 16);
        let first_cancel = req_1.cancel.clone();
        room.join(req_1).await.unwrap();

        let second = summary("alice");
        let (req_2, _e2) = join_request(second.clone(), 16);
        let ack = room.join(req_2).await.unwrap();

        assert!(ack.peers.is_empty());
        assert!(first_cancel.is_cancelled());
        let state = room.get_state().await.unwrap();
        assert_eq!(state.peers, vec![second]);
    }

    #[tokio::test]
    async fn test_evict_cancels_session_and_notifies_others() {
        let (room, _task) = spawn_room().await;
        let alice = summary("alice");
        let bob = summary("bob");
        let (req_a, mut events_a) = join_request(alice.clone(), 16);
        room.join(req_a).await.unwrap();
        let (req_b, _events_b) = join_request(bob.clone(), 16);
        let bob_cancel = req_b.cancel.clone();
        room.join(req_b).await.unwrap();
        let _ = events_a.recv().await; // peer-joined bob

        assert!(room.evict(bob.peer_id).await.unwrap());
        assert!(bob_cancel.is_cancelled());
        assert_eq!(
            events_a.recv().await,
            Some(PeerEvent::PeerLeft {
                peer_id: bob.peer_id,
                user_id: bob.user_id.clone(),
            })
        );
        let state = room.get_state().await.unwrap();
        assert_eq!(state.peers, vec![alice]);

        // Already gone.
        assert!(!room.evict(bob.peer_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_close_if_empty_only_when_empty() {
        let (room, task) = spawn_room().await;
        let alice = summary("alice");
        let (req, _events) = join_request(alice.clone(), 16);
        room.join(req).await.unwrap();

        assert!(!room.close_if_empty().await.unwrap());
        room.leave(alice.peer_id).await.unwrap();
        assert!(room.close_if_empty().await.unwrap());

        task.await.unwrap();
        assert!(room.is_closed());
        assert!(room.get_state().await.is_err());
    }

    #[tokio::test]
    async fn test_teardown_notifies_peers() {
        let (room, task) = spawn_room().await;
        let (req, mut events) = join_request(summary("alice"), 16);
        room.join(req).await.unwrap();

        room.teardown("Meeting ended by host").await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(PeerEvent::MeetingEnded {
                reason: "Meeting ended by host".to_string()
            })
        );
        task.await.unwrap();
        assert!(room.is_closed());
    }
}
