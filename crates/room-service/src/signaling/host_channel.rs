//! The host's waiting-room channel.
//!
//! Host only. On open the host is sent every participant already waiting,
//! then live `participant-waiting` and `participant-response` forwards from
//! the event bus until the meeting ends or the connection closes.

use super::protocol::{HostClientMessage, HostServerMessage, Inbound};
use super::SignalingContext;

use crate::bus::{MeetingEvent, Subscription, Topic, WaitingRoomJoinEvent, WaitingRoomResponseEvent};
use crate::errors::RoomError;
use crate::meetings::lifecycle::{REASON_CANCELLED, REASON_ENDED};

use chrono::{DateTime, Utc};
use common::types::{MeetingId, UserId};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

async fn send(outbound: &mpsc::Sender<HostServerMessage>, message: HostServerMessage) {
    if outbound.send(message).await.is_err() {
        debug!(target: "rs.host_channel", "Outbound channel closed");
    }
}

fn decode<T: DeserializeOwned>(payload: serde_json::Value) -> Option<T> {
    match serde_json::from_value(payload) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(target: "rs.host_channel", error = %e, "Undecodable bus event");
            None
        }
    }
}

struct Feeds {
    joins: Subscription,
    responses: Subscription,
    ended: Subscription,
    cancelled: Subscription,
}

async fn subscribe(ctx: &SignalingContext) -> Result<Feeds, RoomError> {
    let subscribe = |topic: Topic| async move {
        ctx.bus
            .subscribe(topic)
            .await
            .map_err(|e| RoomError::Internal(format!("subscribe to {} failed: {e}", topic.as_str())))
    };
    Ok(Feeds {
        joins: subscribe(Topic::WaitingRoomJoin).await?,
        responses: subscribe(Topic::WaitingRoomResponse).await?,
        ended: subscribe(Topic::MeetingEnded).await?,
        cancelled: subscribe(Topic::MeetingCancelled).await?,
    })
}

/// Run a host waiting-room connection to completion.
#[instrument(skip_all, name = "rs.host_channel", fields(meeting_id = %meeting_id))]
pub async fn run_host_channel(
    ctx: SignalingContext,
    meeting_id: MeetingId,
    token: Option<String>,
    mut inbound: mpsc::Receiver<Inbound<HostClientMessage>>,
    outbound: mpsc::Sender<HostServerMessage>,
) {
    let host = match ctx.identity.authenticate(token.as_deref()) {
        Ok(identity) => identity,
        Err(e) => {
            send(&outbound, HostServerMessage::error(&e)).await;
            return;
        }
    };
    let meeting = match ctx.lifecycle.get(meeting_id).await {
        Ok(meeting) => meeting,
        Err(e) => {
            send(&outbound, HostServerMessage::error(&e)).await;
            return;
        }
    };
    if meeting.host_id != host.user_id {
        let err = RoomError::Forbidden("Only the host may manage the waiting room".to_string());
        send(&outbound, HostServerMessage::error(&err)).await;
        return;
    }
    if meeting.status.is_terminal() {
        send(&outbound, HostServerMessage::error(&RoomError::Ended)).await;
        return;
    }

    // Subscribe before reading the queue so nothing falls between the two.
    let mut feeds = match subscribe(&ctx).await {
        Ok(feeds) => feeds,
        Err(e) => {
            warn!(target: "rs.host_channel", error = %e, "Host channel unavailable");
            send(&outbound, HostServerMessage::error(&e)).await;
            return;
        }
    };

    let snapshot_at: DateTime<Utc> = Utc::now();
    let mut replayed: HashSet<UserId> = HashSet::new();
    match ctx.waiting_room.pending(meeting_id).await {
        Ok(pending) => {
            for participant in pending {
                replayed.insert(participant.user_id.clone());
                send(
                    &outbound,
                    HostServerMessage::ParticipantWaiting {
                        meeting_id,
                        participant_id: participant.user_id,
                        display_name: participant.display_name,
                        requested_at: participant.joined_at,
                    },
                )
                .await;
            }
        }
        Err(e) => send(&outbound, HostServerMessage::error(&e)).await,
    }

    info!(target: "rs.host_channel", waiting = replayed.len(), "Host channel open");
    let cancel = ctx.shutdown.child_token();

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,

            frame = inbound.recv() => match frame {
                None => break,
                Some(Inbound::Message(HostClientMessage::Ping)) => {
                    send(&outbound, HostServerMessage::Pong).await;
                }
                Some(Inbound::Message(HostClientMessage::ApproveParticipant { participant_id, approved })) => {
                    // The decision comes back through the response feed.
                    if let Err(e) = ctx
                        .waiting_room
                        .decide(meeting_id, &host.user_id, &participant_id, approved)
                        .await
                    {
                        send(&outbound, HostServerMessage::error(&e)).await;
                    }
                }
                Some(Inbound::Malformed { reason }) => {
                    debug!(target: "rs.host_channel", reason, "Malformed frame");
                    let err = RoomError::BadRequest("Malformed frame".to_string());
                    send(&outbound, HostServerMessage::error(&err)).await;
                }
            },

            Some(payload) = feeds.joins.recv() => {
                let Some(event) = decode::<WaitingRoomJoinEvent>(payload) else { continue };
                if event.meeting_id != meeting_id {
                    continue;
                }
                // Already sent in the replay.
                if event.requested_at <= snapshot_at && replayed.remove(&event.participant_id) {
                    continue;
                }
                send(
                    &outbound,
                    HostServerMessage::ParticipantWaiting {
                        meeting_id,
                        participant_id: event.participant_id,
                        display_name: event.display_name,
                        requested_at: event.requested_at,
                    },
                )
                .await;
            }

            Some(payload) = feeds.responses.recv() => {
                let Some(event) = decode::<WaitingRoomResponseEvent>(payload) else { continue };
                if event.meeting_id == meeting_id {
                    send(
                        &outbound,
                        HostServerMessage::ParticipantResponse {
                            participant_id: event.participant_id,
                            approved: event.approved,
                        },
                    )
                    .await;
                }
            }

            Some(payload) = feeds.ended.recv() => {
                if decode::<MeetingEvent>(payload).is_some_and(|e| e.meeting_id == meeting_id) {
                    send(&outbound, HostServerMessage::MeetingEnded { reason: REASON_ENDED.to_string() }).await;
                    break;
                }
            }

            Some(payload) = feeds.cancelled.recv() => {
                if decode::<MeetingEvent>(payload).is_some_and(|e| e.meeting_id == meeting_id) {
                    send(&outbound, HostServerMessage::MeetingEnded { reason: REASON_CANCELLED.to_string() }).await;
                    break;
                }
            }
        }
    }

    debug!(target: "rs.host_channel", "Host channel closed");
}
