//! Meeting lifecycle controller.
//!
//! Owns every status transition of a meeting and every participant
//! join/leave. Status changes go through the store's compare-and-set, so
//! concurrent `end` calls produce exactly one `ended` transition and the
//! loser observes `AlreadyEnded`.
//!
//! Lifecycle events are published after the store write succeeds and never
//! fail the operation.

use crate::actors::RoomRegistry;
use crate::auth::Identity;
use crate::bus::{publish_logged, EventBus, MeetingEvent, ParticipantEvent, Topic};
use crate::errors::RoomError;
use crate::meetings::model::{
    AdmissionStatus, ConnectionInfo, Meeting, MeetingFlags, MeetingSettings, MeetingStatus,
    Participant, ParticipantRole, ParticipantUpdate,
};
use crate::meetings::store::{MeetingStore, UpsertOutcome};
use crate::meetings::waiting_room::WaitingRoom;
use crate::observability::metrics;

use chrono::{DateTime, Utc};
use common::secret::{secrets_match, SecretString};
use common::types::{MeetingId, PeerId, RoomId, UserId};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Capacity used when a meeting is created without one.
pub const DEFAULT_MAX_PARTICIPANTS: u32 = 100;

/// Reason carried in `meeting-ended` when the host ends the meeting.
pub const REASON_ENDED: &str = "Meeting ended by host";
/// Reason carried in `meeting-ended` when the host cancels the meeting.
pub const REASON_CANCELLED: &str = "Meeting cancelled by host";

/// Meeting creation request.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateMeeting {
    #[serde(default)]
    pub title: Option<String>,
    /// Room id to bind. Generated when absent.
    #[serde(default)]
    pub room_id: Option<RoomId>,
    #[serde(default)]
    pub password: Option<SecretString>,
    #[serde(default)]
    pub max_participants: Option<u32>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub co_host_ids: Vec<UserId>,
    #[serde(default)]
    pub flags: MeetingFlags,
    #[serde(default)]
    pub settings: MeetingSettings,
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinGrant {
    pub meeting: Meeting,
    pub participant: Participant,
    pub role: ParticipantRole,
    /// The participant was parked in the waiting room.
    pub requires_approval: bool,
}

pub struct MeetingLifecycle {
    store: Arc<dyn MeetingStore>,
    bus: Arc<dyn EventBus>,
    registry: Arc<RoomRegistry>,
    waiting_room: Arc<WaitingRoom>,
}

impl MeetingLifecycle {
    pub fn new(
        store: Arc<dyn MeetingStore>,
        bus: Arc<dyn EventBus>,
        registry: Arc<RoomRegistry>,
        waiting_room: Arc<WaitingRoom>,
    ) -> Self {
        Self {
            store,
            bus,
            registry,
            waiting_room,
        }
    }

    #[must_use]
    pub fn waiting_room(&self) -> &Arc<WaitingRoom> {
        &self.waiting_room
    }

    /// Schedule a meeting. It starts `active` if its start time has passed.
    #[instrument(skip_all, fields(host_id = %host.user_id))]
    pub async fn create(&self, host: &Identity, request: CreateMeeting) -> Result<Meeting, RoomError> {
        if host.is_guest {
            return Err(RoomError::Forbidden("Guests cannot create meetings".to_string()));
        }
        let max_participants = request.max_participants.unwrap_or(DEFAULT_MAX_PARTICIPANTS);
        if max_participants == 0 {
            return Err(RoomError::BadRequest(
                "maxParticipants must be at least 1".to_string(),
            ));
        }

        let now = Utc::now();
        let scheduled_start = request.start_time.unwrap_or(now);
        let status = if scheduled_start <= now {
            MeetingStatus::Active
        } else {
            MeetingStatus::Scheduled
        };
        let id = MeetingId::new();
        let meeting = Meeting {
            id,
            title: request.title.unwrap_or_else(|| "Untitled meeting".to_string()),
            host_id: host.user_id.clone(),
            co_host_ids: request.co_host_ids,
            room_id: request
                .room_id
                .unwrap_or_else(|| RoomId::from(format!("room-{id}"))),
            password: request.password,
            max_participants,
            flags: request.flags,
            settings: request.settings,
            status,
            participants: Vec::new(),
            scheduled_start,
            created_at: now,
            started_at: (status == MeetingStatus::Active).then_some(now),
            ended_at: None,
        };

        self.store.insert(meeting.clone()).await?;

        info!(
            target: "rs.lifecycle",
            meeting_id = %meeting.id,
            room_id = %meeting.room_id,
            status = meeting.status.as_str(),
            "Meeting created"
        );
        metrics::record_lifecycle_transition("created");
        self.publish_meeting(Topic::MeetingCreated, &meeting, now)
            .await;
        Ok(meeting)
    }

    pub async fn get(&self, meeting_id: MeetingId) -> Result<Meeting, RoomError> {
        self.store
            .find(meeting_id)
            .await?
            .ok_or_else(|| RoomError::NotFound("Meeting".to_string()))
    }

    /// Join by room id, as a signaling connection does.
    pub async fn join_room(
        &self,
        room_id: &RoomId,
        identity: &Identity,
        password: Option<&str>,
        connection: Option<PeerId>,
    ) -> Result<JoinGrant, RoomError> {
        let meeting = self
            .store
            .find_by_room(room_id)
            .await?
            .ok_or_else(|| RoomError::NotFound("Meeting".to_string()))?;
        self.admit(meeting, identity, password, connection).await
    }

    /// Join by meeting id.
    ///
    /// With a `connection`, a participant who needs no approval is recorded
    /// `connected`; without one (HTTP join) they are recorded `approved`
    /// and occupy no capacity until a connection binds.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Ended`, `Unauthorized` (password mismatch, for every
    /// role), `Full`.
    pub async fn join(
        &self,
        meeting_id: MeetingId,
        identity: &Identity,
        password: Option<&str>,
        connection: Option<PeerId>,
    ) -> Result<JoinGrant, RoomError> {
        let meeting = self.get(meeting_id).await?;
        self.admit(meeting, identity, password, connection).await
    }

    #[instrument(skip_all, fields(meeting_id = %meeting.id, user_id = %identity.user_id))]
    async fn admit(
        &self,
        meeting: Meeting,
        identity: &Identity,
        password: Option<&str>,
        connection: Option<PeerId>,
    ) -> Result<JoinGrant, RoomError> {
        if meeting.status.is_terminal() {
            return Err(RoomError::Ended);
        }
        if let Some(stored) = &meeting.password {
            if !password.is_some_and(|candidate| secrets_match(stored, candidate)) {
                return Err(RoomError::Unauthorized("meeting password mismatch".to_string()));
            }
        }

        let role = meeting.role_of(&identity.user_id);
        let existing = meeting.participant(&identity.user_id);
        let already_live = existing.is_some_and(Participant::is_live);
        let requires_approval = meeting.flags.is_waiting_room_enabled
            && role != ParticipantRole::Host
            && !existing.is_some_and(|p| {
                matches!(
                    p.admission_status,
                    AdmissionStatus::Approved | AdmissionStatus::Connected
                )
            });

        let capacity = meeting.max_participants;
        if !already_live && meeting.live_participant_count() >= capacity as usize {
            return Err(RoomError::Full(meeting.id.to_string()));
        }

        let now = Utc::now();
        let admission_status = match (requires_approval, connection) {
            (true, _) => AdmissionStatus::Pending,
            (false, Some(_)) => AdmissionStatus::Connected,
            (false, None) => AdmissionStatus::Approved,
        };
        // Per-user media state carries over from an earlier session.
        let (audio_enabled, video_enabled, hand_raised) = match existing {
            Some(p) => (p.audio_enabled, p.video_enabled, p.hand_raised),
            None => (
                !meeting.settings.mute_on_entry,
                !meeting.settings.disable_video_on_entry,
                false,
            ),
        };
        let participant = Participant {
            user_id: identity.user_id.clone(),
            display_name: identity.display_name.clone(),
            role,
            joined_at: now,
            left_at: None,
            audio_enabled,
            video_enabled,
            hand_raised,
            screen_sharing: false,
            admission_status,
            connection: connection.map(|peer_id| ConnectionInfo {
                peer_id,
                bound_at: now,
            }),
        };

        let participant = match self
            .store
            .upsert_participant(meeting.id, participant, Some(capacity))
            .await?
        {
            UpsertOutcome::Inserted(p) | UpsertOutcome::Updated(p) => p,
            UpsertOutcome::Full => return Err(RoomError::Full(meeting.id.to_string())),
            UpsertOutcome::Ended => return Err(RoomError::Ended),
            UpsertOutcome::MeetingMissing => {
                return Err(RoomError::NotFound("Meeting".to_string()))
            }
        };

        if meeting.status == MeetingStatus::Scheduled
            && self
                .store
                .transition_status(
                    meeting.id,
                    &[MeetingStatus::Scheduled],
                    MeetingStatus::Active,
                    now,
                )
                .await?
        {
            info!(target: "rs.lifecycle", meeting_id = %meeting.id, "Meeting started");
            metrics::record_lifecycle_transition("started");
            self.publish_meeting(Topic::MeetingStarted, &meeting, now)
                .await;
        }

        if !requires_approval {
            publish_logged(
                self.bus.as_ref(),
                Topic::ParticipantJoined,
                &ParticipantEvent {
                    meeting_id: meeting.id,
                    user_id: participant.user_id.clone(),
                    display_name: participant.display_name.clone(),
                    at: now,
                },
            )
            .await;
        }

        debug!(
            target: "rs.lifecycle",
            role = ?role,
            admission = participant.admission_status.as_str(),
            "Participant admitted"
        );

        Ok(JoinGrant {
            meeting,
            participant,
            role,
            requires_approval,
        })
    }

    /// Record a participant leaving.
    ///
    /// With a `peer_id`, only that connection's leave counts; a connection
    /// superseded by a reconnect leaves nothing behind. Without one, a bound
    /// signaling connection is evicted from its room first so the room never
    /// holds a peer whose participant has left. Returns whether the record
    /// changed. Ends the meeting if the host left and `endWhenHostLeaves` is
    /// set.
    #[instrument(skip_all, fields(meeting_id = %meeting_id, user_id = %user_id))]
    pub async fn leave(
        &self,
        meeting_id: MeetingId,
        user_id: &UserId,
        peer_id: Option<PeerId>,
    ) -> Result<bool, RoomError> {
        let peer_id = match peer_id {
            Some(peer_id) => Some(peer_id),
            None => self.evict_bound_peer(meeting_id, user_id).await?,
        };

        let now = Utc::now();
        let Some(participant) = self
            .store
            .update_participant(
                meeting_id,
                user_id,
                ParticipantUpdate::Disconnected { peer_id, at: now },
            )
            .await?
        else {
            return Ok(false);
        };

        publish_logged(
            self.bus.as_ref(),
            Topic::ParticipantLeft,
            &ParticipantEvent {
                meeting_id,
                user_id: participant.user_id.clone(),
                display_name: participant.display_name.clone(),
                at: now,
            },
        )
        .await;

        if participant.role == ParticipantRole::Host {
            let meeting = self.get(meeting_id).await?;
            if meeting.settings.end_when_host_leaves && !meeting.status.is_terminal() {
                info!(target: "rs.lifecycle", "Host left, ending meeting");
                match self.end(meeting_id, user_id).await {
                    Ok(()) | Err(RoomError::AlreadyEnded) => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(true)
    }

    /// Evict the live peer bound to `user_id`, if any. Returns its id.
    async fn evict_bound_peer(
        &self,
        meeting_id: MeetingId,
        user_id: &UserId,
    ) -> Result<Option<PeerId>, RoomError> {
        let meeting = self.get(meeting_id).await?;
        let Some(peer_id) = meeting
            .participant(user_id)
            .filter(|p| p.is_live())
            .and_then(|p| p.connection.as_ref())
            .map(|c| c.peer_id)
        else {
            return Ok(None);
        };

        if let Some(room) = self
            .registry
            .handle(&meeting.room_id)
            .filter(|room| room.meeting_id() == meeting_id)
        {
            match room.evict(peer_id).await {
                Ok(removed) => debug!(
                    target: "rs.lifecycle",
                    peer_id = %peer_id,
                    removed,
                    "Evicted bound peer on leave"
                ),
                Err(e) => debug!(target: "rs.lifecycle", error = %e, "Room already closed"),
            }
        }
        Ok(Some(peer_id))
    }

    /// End an active or scheduled meeting. Host only.
    pub async fn end(&self, meeting_id: MeetingId, caller: &UserId) -> Result<(), RoomError> {
        self.finish(meeting_id, caller, MeetingStatus::Ended).await
    }

    /// Cancel a scheduled or active meeting. Host only.
    pub async fn cancel(&self, meeting_id: MeetingId, caller: &UserId) -> Result<(), RoomError> {
        self.finish(meeting_id, caller, MeetingStatus::Cancelled)
            .await
    }

    #[instrument(skip_all, fields(meeting_id = %meeting_id, to = to.as_str()))]
    async fn finish(
        &self,
        meeting_id: MeetingId,
        caller: &UserId,
        to: MeetingStatus,
    ) -> Result<(), RoomError> {
        let meeting = self.get(meeting_id).await?;
        if &meeting.host_id != caller {
            return Err(RoomError::Forbidden(format!(
                "Only the host may {} this meeting",
                if to == MeetingStatus::Cancelled { "cancel" } else { "end" }
            )));
        }
        if meeting.status.is_terminal() {
            return Err(RoomError::AlreadyEnded);
        }

        let now = Utc::now();
        let applied = self
            .store
            .transition_status(
                meeting_id,
                &[MeetingStatus::Scheduled, MeetingStatus::Active],
                to,
                now,
            )
            .await?;
        if !applied {
            return Err(RoomError::AlreadyEnded);
        }

        // Guests parked between the read above and the transition are only
        // in the stored document.
        let current = match self.store.find(meeting_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(target: "rs.lifecycle", error = %e, "Failed to re-read meeting on end");
                None
            }
        };
        self.waiting_room
            .reject_all(current.as_ref().unwrap_or(&meeting))
            .await;

        match self.store.mark_all_left(meeting_id, now).await {
            Ok(left) => debug!(target: "rs.lifecycle", left = left.len(), "Participants marked left"),
            Err(e) => warn!(
                target: "rs.lifecycle",
                error = %e,
                "Failed to stamp leave times on meeting end"
            ),
        }

        let (topic, reason, transition) = if to == MeetingStatus::Cancelled {
            (Topic::MeetingCancelled, REASON_CANCELLED, "cancelled")
        } else {
            (Topic::MeetingEnded, REASON_ENDED, "ended")
        };
        self.registry.teardown(&meeting.room_id, reason).await;

        info!(target: "rs.lifecycle", room_id = %meeting.room_id, "Meeting finished");
        metrics::record_lifecycle_transition(transition);
        self.publish_meeting(topic, &meeting, now).await;
        Ok(())
    }

    async fn publish_meeting(&self, topic: Topic, meeting: &Meeting, at: DateTime<Utc>) {
        publish_logged(
            self.bus.as_ref(),
            topic,
            &MeetingEvent {
                meeting_id: meeting.id,
                room_id: meeting.room_id.clone(),
                host_id: meeting.host_id.clone(),
                at,
            },
        )
        .await;
    }
}
