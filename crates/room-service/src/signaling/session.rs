//! Participant connection handler.
//!
//! One task per connection drives the whole lifecycle:
//!
//! ```text
//! connecting -> admitted -> joined -> closed
//!      \-> waiting -/
//! ```
//!
//! Requests from the connection are handled one at a time in arrival order.
//! Room events and engine events are interleaved with requests on the same
//! task, so the peer session is never touched concurrently. A failed request
//! becomes an `error` frame and the connection stays up.

use super::protocol::{ClientMessage, Inbound, ServerMessage};
use super::{SignalingContext, PEER_EVENT_BUFFER};

use crate::actors::messages::{JoinRequest, PeerEvent, PeerSummary, ProducerSummary};
use crate::actors::metrics::{ActorType, MailboxMonitor};
use crate::actors::peer::{EngineNotice, PeerSession};
use crate::auth::Identity;
use crate::bus::{publish_logged, RoomPeerEvent, RoomProducerEvent, Topic};
use crate::errors::RoomError;
use crate::media::{EngineEvent, MediaKind, MediaSource};
use crate::meetings::{JoinGrant, ParticipantUpdate};
use crate::observability::metrics;

use chrono::Utc;
use common::types::{MeetingId, PeerId, ProducerId, RoomId, UserId};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Sent to a participant parked in the waiting room.
pub const WAITING_MESSAGE: &str = "Waiting for the host to let you in";

/// Reason sent to connections closed by a service shutdown.
const SHUTDOWN_REASON: &str = "Server shutting down";

/// Connection parameters, as given on the upgrade request.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub room_id: RoomId,
    pub token: Option<String>,
    pub display_name: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Connection dropped.
    Disconnected,
    /// Client sent `leave`.
    Left,
    /// Evicted by the room or the service is stopping.
    Cancelled,
    MeetingEnded,
}

impl Exit {
    const fn as_str(self) -> &'static str {
        match self {
            Exit::Disconnected => "disconnected",
            Exit::Left => "left",
            Exit::Cancelled => "cancelled",
            Exit::MeetingEnded => "meeting_ended",
        }
    }
}

enum Waiting {
    Approved,
    Rejected,
    Abandoned,
}

/// Outbound half of the connection.
struct Outbound {
    sender: mpsc::Sender<ServerMessage>,
}

impl Outbound {
    async fn send(&self, message: ServerMessage) {
        // A closed writer means the connection is gone; the inbound side
        // reports the disconnect.
        if self.sender.send(message).await.is_err() {
            debug!(target: "rs.session", "Outbound channel closed");
        }
    }

    async fn error(&self, err: &RoomError, request: Option<&str>) {
        self.send(ServerMessage::error(err, request)).await;
    }
}

/// Run a participant connection to completion.
///
/// `inbound` yields decoded frames and ends when the connection drops.
/// Every frame for the client goes to `outbound`.
#[instrument(skip_all, name = "rs.session", fields(room_id = %request.room_id, peer_id = tracing::field::Empty))]
pub async fn run_session(
    ctx: SignalingContext,
    request: ConnectRequest,
    mut inbound: mpsc::Receiver<Inbound<ClientMessage>>,
    outbound: mpsc::Sender<ServerMessage>,
) {
    let peer_id = PeerId::new();
    tracing::Span::current().record("peer_id", tracing::field::display(peer_id));
    let out = Outbound { sender: outbound };

    let identity = match ctx
        .identity
        .resolve(request.token.as_deref(), request.display_name.as_deref())
    {
        Ok(identity) => identity,
        Err(e) => {
            debug!(target: "rs.session", error = %e, "Connection rejected");
            out.error(&e, None).await;
            return;
        }
    };

    let cancel = ctx.shutdown.child_token();
    let Some(grant) = admit(&ctx, &request, &identity, peer_id, &mut inbound, &out, &cancel).await
    else {
        return;
    };

    let meeting_id = grant.meeting.id;
    let room_id = grant.meeting.room_id.clone();
    let (events_tx, mut room_events) = mpsc::channel(PEER_EVENT_BUFFER);
    let info = PeerSummary {
        peer_id,
        user_id: identity.user_id.clone(),
        display_name: identity.display_name.clone(),
        role: grant.role,
        hand_raised: grant.participant.hand_raised,
        joined_at: grant.participant.joined_at,
    };

    let (room, ack) = match ctx
        .registry
        .join(
            &room_id,
            meeting_id,
            JoinRequest {
                info,
                events: events_tx,
                cancel: cancel.clone(),
            },
        )
        .await
    {
        Ok(joined) => joined,
        Err(e) => {
            warn!(target: "rs.session", error = %e, "Room join failed");
            out.error(&e, None).await;
            if let Err(e) = ctx
                .lifecycle
                .leave(meeting_id, &identity.user_id, Some(peer_id))
                .await
            {
                warn!(target: "rs.session", error = %e, "Failed to record leave");
            }
            return;
        }
    };

    metrics::peer_joined();
    info!(
        target: "rs.session",
        user_id = %identity.user_id,
        role = ?grant.role,
        peers = ack.peers.len(),
        producers = ack.producers.len(),
        "Peer joined room"
    );

    out.send(ServerMessage::RoomInfo {
        room_id: room_id.clone(),
        meeting_id,
        peer_id,
        router_rtp_capabilities: ack.router_rtp_capabilities,
        peers: ack.peers,
        producers: ack.producers,
        settings: grant.meeting.settings.clone(),
    })
    .await;

    let (peer, engine_events) = PeerSession::new(
        peer_id,
        identity.user_id.clone(),
        identity.display_name.clone(),
        room,
        ctx.engine_timeout,
    );
    let mut connection = Connection {
        monitor: MailboxMonitor::new(ActorType::Peer, peer_id.to_string()),
        ctx,
        out,
        peer,
        peer_id,
        room_id,
        meeting_id,
        user_id: identity.user_id,
        display_name: identity.display_name,
    };
    connection.publish_peer(Topic::PeerJoined).await;

    let exit = connection
        .run(&mut inbound, &mut room_events, engine_events, &cancel)
        .await;
    connection.disconnect(exit).await;
}

/// Admission: lifecycle join, plus the waiting room when it applies.
/// Returns `None` once the connection has been answered and cleaned up.
async fn admit(
    ctx: &SignalingContext,
    request: &ConnectRequest,
    identity: &Identity,
    peer_id: PeerId,
    inbound: &mut mpsc::Receiver<Inbound<ClientMessage>>,
    out: &Outbound,
    cancel: &CancellationToken,
) -> Option<JoinGrant> {
    loop {
        let grant = match ctx
            .lifecycle
            .join_room(
                &request.room_id,
                identity,
                request.password.as_deref(),
                Some(peer_id),
            )
            .await
        {
            Ok(grant) => grant,
            Err(e) => {
                debug!(target: "rs.session", error = %e, "Admission refused");
                out.error(&e, None).await;
                return None;
            }
        };

        if !grant.requires_approval {
            return Some(grant);
        }

        match wait_for_host(ctx, &grant, inbound, out, cancel).await {
            // Approved: run the normal admission path again.
            Waiting::Approved => continue,
            Waiting::Rejected => {
                info!(target: "rs.session", user_id = %identity.user_id, "Admission declined by host");
                out.error(
                    &RoomError::Forbidden("The host declined your request to join".to_string()),
                    None,
                )
                .await;
                return None;
            }
            Waiting::Abandoned => {
                if let Err(e) = ctx
                    .lifecycle
                    .leave(grant.meeting.id, &identity.user_id, Some(peer_id))
                    .await
                {
                    warn!(target: "rs.session", error = %e, "Failed to withdraw waiting participant");
                }
                return None;
            }
        }
    }
}

/// Hold the connection until the host decides. Only `ping` is served.
async fn wait_for_host(
    ctx: &SignalingContext,
    grant: &JoinGrant,
    inbound: &mut mpsc::Receiver<Inbound<ClientMessage>>,
    out: &Outbound,
    cancel: &CancellationToken,
) -> Waiting {
    let mut ticket = match ctx.waiting_room.park(&grant.meeting, &grant.participant).await {
        Ok(ticket) => ticket,
        Err(e) => {
            out.error(&e, None).await;
            return Waiting::Abandoned;
        }
    };

    out.send(ServerMessage::WaitingRoom {
        meeting_id: ticket.meeting_id(),
        message: WAITING_MESSAGE.to_string(),
    })
    .await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return Waiting::Abandoned,

            decision = ticket.decision() => {
                return match decision {
                    Some(true) => Waiting::Approved,
                    Some(false) => Waiting::Rejected,
                    None => Waiting::Abandoned,
                };
            }

            frame = inbound.recv() => match frame {
                None | Some(Inbound::Message(ClientMessage::Leave)) => return Waiting::Abandoned,
                Some(Inbound::Message(ClientMessage::Ping)) => out.send(ServerMessage::Pong).await,
                Some(Inbound::Message(other)) => {
                    out.error(
                        &RoomError::InvalidState("Waiting for the host to admit you".to_string()),
                        Some(other.type_name()),
                    )
                    .await;
                }
                Some(Inbound::Malformed { reason }) => {
                    debug!(target: "rs.session", reason, "Malformed frame while waiting");
                    out.error(&RoomError::BadRequest("Malformed frame".to_string()), None).await;
                }
            },
        }
    }
}

/// A connection admitted to its room.
struct Connection {
    ctx: SignalingContext,
    out: Outbound,
    peer: PeerSession,
    peer_id: PeerId,
    room_id: RoomId,
    meeting_id: MeetingId,
    user_id: UserId,
    display_name: String,
    monitor: MailboxMonitor,
}

impl Connection {
    async fn run(
        &mut self,
        inbound: &mut mpsc::Receiver<Inbound<ClientMessage>>,
        room_events: &mut mpsc::Receiver<PeerEvent>,
        mut engine_events: mpsc::UnboundedReceiver<EngineEvent>,
        cancel: &CancellationToken,
    ) -> Exit {
        loop {
            tokio::select! {
                () = cancel.cancelled() => return Exit::Cancelled,

                frame = inbound.recv() => match frame {
                    None => return Exit::Disconnected,
                    Some(Inbound::Message(ClientMessage::Leave)) => return Exit::Left,
                    Some(Inbound::Message(message)) => self.dispatch(message).await,
                    Some(Inbound::Malformed { reason }) => {
                        debug!(target: "rs.session", reason, "Malformed frame");
                        self.out
                            .error(&RoomError::BadRequest("Malformed frame".to_string()), None)
                            .await;
                    }
                },

                Some(event) = room_events.recv() => {
                    self.monitor.observe(room_events.len());
                    if let PeerEvent::MeetingEnded { reason } = event {
                        self.out.send(ServerMessage::MeetingEnded { reason }).await;
                        return Exit::MeetingEnded;
                    }
                    self.on_room_event(event).await;
                }

                Some(event) = engine_events.recv() => self.on_engine_event(event).await,
            }
        }
    }

    async fn dispatch(&mut self, message: ClientMessage) {
        let request = message.type_name();
        let started = Instant::now();
        let result = self.handle_request(message).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::record_signaling_message(request, outcome, started.elapsed());

        if let Err(e) = result {
            debug!(target: "rs.session", request, error = %e, "Request failed");
            self.out.error(&e, Some(request)).await;
        }
    }

    async fn handle_request(&mut self, message: ClientMessage) -> Result<(), RoomError> {
        match message {
            ClientMessage::GetRouterCapabilities => {
                self.out
                    .send(ServerMessage::RouterCapabilities {
                        rtp_capabilities: self.peer.router_capabilities(),
                    })
                    .await;
            }

            ClientMessage::CreateTransport { direction } => {
                let parameters = self.peer.create_transport(direction).await?;
                self.out
                    .send(ServerMessage::TransportCreated {
                        transport_id: parameters.id,
                        direction,
                        ice_parameters: parameters.ice_parameters,
                        ice_candidates: parameters.ice_candidates,
                        dtls_parameters: parameters.dtls_parameters,
                    })
                    .await;
            }

            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                self.peer
                    .connect_transport(transport_id, dtls_parameters)
                    .await?;
                self.out
                    .send(ServerMessage::TransportConnected { transport_id })
                    .await;
            }

            ClientMessage::Produce {
                transport_id,
                kind,
                rtp_parameters,
                source,
            } => {
                let producer = self
                    .peer
                    .produce(transport_id, kind, rtp_parameters, source)
                    .await?;
                self.out
                    .send(ServerMessage::ProducerCreated {
                        producer_id: producer.producer_id,
                        kind: producer.kind,
                        source: producer.source,
                    })
                    .await;
                if producer.source == MediaSource::Screen {
                    self.update_participant(ParticipantUpdate::ScreenSharing(true))
                        .await;
                }
                self.publish_producer(Topic::ProducerCreated, &producer)
                    .await;
            }

            ClientMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let consumed = self
                    .peer
                    .consume(transport_id, producer_id, rtp_capabilities)
                    .await?;
                let consumer_id = consumed.consumer_id;
                self.out
                    .send(ServerMessage::ConsumerCreated {
                        consumer_id,
                        producer_id,
                        transport_id: consumed.transport_id,
                        kind: consumed.kind,
                        rtp_parameters: consumed.rtp_parameters,
                        consumer_type: consumed.consumer_type,
                        producer_paused: consumed.producer_paused,
                        peer_id: consumed.producer.peer_id,
                        user_id: consumed.producer.user_id,
                        display_name: consumed.producer.display_name,
                    })
                    .await;
                self.peer.resume_consumer(consumer_id).await?;
                self.out
                    .send(ServerMessage::ConsumerResumed { consumer_id })
                    .await;
            }

            ClientMessage::ResumeConsumer { consumer_id } => {
                self.peer.resume_consumer(consumer_id).await?;
                self.out
                    .send(ServerMessage::ConsumerResumed { consumer_id })
                    .await;
            }

            ClientMessage::CloseProducer { producer_id } => {
                // The room broadcasts producer-closed, to this peer as well.
                let source = self.peer.close_producer(producer_id).await?;
                self.producer_gone(producer_id, source).await;
            }

            ClientMessage::MuteProducer { producer_id, mute } => {
                let (kind, source) = self.peer.mute_producer(producer_id, mute).await?;
                let update = match (kind, source) {
                    (MediaKind::Audio, _) => Some(ParticipantUpdate::AudioEnabled(!mute)),
                    (MediaKind::Video, MediaSource::Camera) => {
                        Some(ParticipantUpdate::VideoEnabled(!mute))
                    }
                    (MediaKind::Video, _) => None,
                };
                if let Some(update) = update {
                    self.update_participant(update).await;
                }
            }

            ClientMessage::RestartIce { transport_id } => {
                let ice_parameters = self.peer.restart_ice(transport_id).await?;
                self.out
                    .send(ServerMessage::IceRestarted {
                        transport_id,
                        ice_parameters,
                    })
                    .await;
            }

            ClientMessage::RaiseHand { raised } => {
                self.peer.room().hand_raised(self.peer_id, raised).await?;
                self.update_participant(ParticipantUpdate::HandRaised(raised))
                    .await;
            }

            ClientMessage::Ping => self.out.send(ServerMessage::Pong).await,

            // Handled by the connection loop.
            ClientMessage::Leave => {}
        }
        Ok(())
    }

    async fn on_room_event(&mut self, event: PeerEvent) {
        let frame = match event {
            PeerEvent::PeerJoined(peer) => ServerMessage::PeerJoined(peer),
            PeerEvent::PeerLeft { peer_id, user_id } => ServerMessage::PeerLeft { peer_id, user_id },
            PeerEvent::NewProducer(producer) => ServerMessage::NewProducer(producer),
            PeerEvent::ProducerClosed {
                producer_id,
                peer_id,
            } => {
                if peer_id != self.peer_id {
                    for consumer_id in self.peer.on_remote_producer_closed(producer_id).await {
                        self.out
                            .send(ServerMessage::ConsumerClosed {
                                consumer_id,
                                producer_id,
                            })
                            .await;
                    }
                }
                ServerMessage::ProducerClosed {
                    producer_id,
                    peer_id,
                }
            }
            PeerEvent::ProducerMuted {
                producer_id,
                peer_id,
                paused,
            } => ServerMessage::ProducerMuted {
                producer_id,
                peer_id,
                paused,
            },
            PeerEvent::HandRaised { peer_id, raised } => {
                ServerMessage::HandRaised { peer_id, raised }
            }
            PeerEvent::MeetingEnded { reason } => ServerMessage::MeetingEnded { reason },
        };
        self.out.send(frame).await;
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        for notice in self.peer.on_engine_event(event).await {
            match notice {
                EngineNotice::ConsumerClosed {
                    consumer_id,
                    producer_id,
                } => {
                    self.out
                        .send(ServerMessage::ConsumerClosed {
                            consumer_id,
                            producer_id,
                        })
                        .await;
                }
                EngineNotice::ProducerClosed {
                    producer_id,
                    source,
                } => self.producer_gone(producer_id, source).await,
                EngineNotice::TransportClosed { transport_id } => {
                    debug!(target: "rs.session", transport_id = %transport_id, "Transport dropped from session");
                }
            }
        }
    }

    /// Bookkeeping after one of this peer's producers closed.
    async fn producer_gone(&self, producer_id: ProducerId, source: MediaSource) {
        if source == MediaSource::Screen {
            self.update_participant(ParticipantUpdate::ScreenSharing(false))
                .await;
        }
        publish_logged(
            self.ctx.bus.as_ref(),
            Topic::ProducerClosed,
            &RoomProducerEvent {
                room_id: self.room_id.clone(),
                meeting_id: self.meeting_id,
                producer_id,
                peer_id: self.peer_id,
                source,
                at: Utc::now(),
            },
        )
        .await;
    }

    /// Best-effort write of per-participant state.
    async fn update_participant(&self, update: ParticipantUpdate) {
        if let Err(e) = self
            .ctx
            .store
            .update_participant(self.meeting_id, &self.user_id, update)
            .await
        {
            warn!(target: "rs.session", error = %e, "Failed to update participant state");
        }
    }

    async fn publish_producer(&self, topic: Topic, producer: &ProducerSummary) {
        publish_logged(
            self.ctx.bus.as_ref(),
            topic,
            &RoomProducerEvent {
                room_id: self.room_id.clone(),
                meeting_id: self.meeting_id,
                producer_id: producer.producer_id,
                peer_id: self.peer_id,
                source: producer.source,
                at: Utc::now(),
            },
        )
        .await;
    }

    async fn publish_peer(&self, topic: Topic) {
        publish_logged(
            self.ctx.bus.as_ref(),
            topic,
            &RoomPeerEvent {
                room_id: self.room_id.clone(),
                meeting_id: self.meeting_id,
                peer_id: self.peer_id,
                user_id: self.user_id.clone(),
                display_name: self.display_name.clone(),
                at: Utc::now(),
            },
        )
        .await;
    }

    /// Disconnect path. Every step runs even if an earlier one failed.
    async fn disconnect(mut self, exit: Exit) {
        if exit == Exit::Cancelled && self.ctx.shutdown.is_cancelled() {
            self.out
                .send(ServerMessage::MeetingEnded {
                    reason: SHUTDOWN_REASON.to_string(),
                })
                .await;
        }

        for (producer_id, source) in self.peer.close_all().await {
            self.producer_gone(producer_id, source).await;
        }

        let room = self.peer.room().clone();
        match room.leave(self.peer_id).await {
            Ok(outcome) => {
                debug!(
                    target: "rs.session",
                    removed = outcome.removed,
                    remaining = outcome.remaining,
                    "Left room"
                );
            }
            Err(e) => debug!(target: "rs.session", error = %e, "Room already closed"),
        }

        if let Err(e) = self
            .ctx
            .lifecycle
            .leave(self.meeting_id, &self.user_id, Some(self.peer_id))
            .await
        {
            warn!(target: "rs.session", error = %e, "Failed to record leave");
        }

        self.ctx.registry.remove_if_empty(&room).await;
        self.publish_peer(Topic::PeerLeft).await;
        metrics::peer_left();

        info!(
            target: "rs.session",
            user_id = %self.user_id,
            reason = exit.as_str(),
            messages = self.monitor.messages_processed(),
            "Peer disconnected"
        );
    }
}
