//! Waiting room coordinator.
//!
//! Admission state lives on the participant record (`pending`, `approved`,
//! `rejected`); there is no separate queue. A held connection learns the
//! host's decision from the `meeting:waiting-room:response` topic.

use crate::bus::{
    publish_logged, EventBus, Subscription, Topic, WaitingRoomJoinEvent, WaitingRoomResponseEvent,
};
use crate::errors::RoomError;
use crate::meetings::model::{AdmissionStatus, Meeting, Participant, ParticipantUpdate};
use crate::meetings::store::MeetingStore;
use crate::observability::metrics;

use chrono::Utc;
use common::types::{MeetingId, UserId};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub struct WaitingRoom {
    store: Arc<dyn MeetingStore>,
    bus: Arc<dyn EventBus>,
}

/// A parked connection waiting for the host's decision.
pub struct WaitingTicket {
    meeting_id: MeetingId,
    participant_id: UserId,
    decided: Option<bool>,
    subscription: Subscription,
}

impl WaitingTicket {
    #[must_use]
    pub fn meeting_id(&self) -> MeetingId {
        self.meeting_id
    }

    /// Wait for the host's decision. `None` if the bus went away.
    ///
    /// Cancel safe: dropping the future loses no decision addressed to
    /// this participant.
    pub async fn decision(&mut self) -> Option<bool> {
        if let Some(approved) = self.decided {
            return Some(approved);
        }
        loop {
            let payload = self.subscription.recv().await?;
            let Ok(event) = serde_json::from_value::<WaitingRoomResponseEvent>(payload) else {
                continue;
            };
            if event.meeting_id == self.meeting_id && event.participant_id == self.participant_id
            {
                self.decided = Some(event.approved);
                return Some(event.approved);
            }
        }
    }
}

impl WaitingRoom {
    pub fn new(store: Arc<dyn MeetingStore>, bus: Arc<dyn EventBus>) -> Self {
        Self { store, bus }
    }

    /// Hold a pending participant and notify the host.
    ///
    /// The response subscription is live before the join event goes out,
    /// and the record is re-read afterwards, so a decision made at any
    /// point after the participant turned pending is observed. Fails with
    /// `Ended` if the meeting finished in the meantime.
    #[instrument(skip_all, fields(meeting_id = %meeting.id, user_id = %participant.user_id))]
    pub async fn park(
        &self,
        meeting: &Meeting,
        participant: &Participant,
    ) -> Result<WaitingTicket, RoomError> {
        let subscription = self
            .bus
            .subscribe(Topic::WaitingRoomResponse)
            .await
            .map_err(|e| RoomError::Internal(format!("waiting room subscribe failed: {e}")))?;

        publish_logged(
            self.bus.as_ref(),
            Topic::WaitingRoomJoin,
            &WaitingRoomJoinEvent {
                meeting_id: meeting.id,
                host_id: meeting.host_id.clone(),
                participant_id: participant.user_id.clone(),
                display_name: participant.display_name.clone(),
                requested_at: Utc::now(),
            },
        )
        .await;

        let current = self.store.find(meeting.id).await?;
        if current.as_ref().is_some_and(|m| m.status.is_terminal()) {
            return Err(RoomError::Ended);
        }
        let decided = current
            .and_then(|m| m.participant(&participant.user_id).cloned())
            .and_then(|p| match p.admission_status {
                AdmissionStatus::Approved => Some(true),
                AdmissionStatus::Rejected => Some(false),
                _ => None,
            });

        info!(target: "rs.waiting_room", "Participant waiting for admission");

        Ok(WaitingTicket {
            meeting_id: meeting.id,
            participant_id: participant.user_id.clone(),
            decided,
            subscription,
        })
    }

    /// Apply the host's decision on a pending participant.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the meeting does not exist
    /// - `Forbidden` if `caller` is not the host
    /// - `InvalidState` if the participant is not waiting
    #[instrument(skip_all, fields(meeting_id = %meeting_id, participant_id = %participant_id, approved))]
    pub async fn decide(
        &self,
        meeting_id: MeetingId,
        caller: &UserId,
        participant_id: &UserId,
        approved: bool,
    ) -> Result<Participant, RoomError> {
        let meeting = self
            .store
            .find(meeting_id)
            .await?
            .ok_or_else(|| RoomError::NotFound("Meeting".to_string()))?;

        if &meeting.host_id != caller {
            return Err(RoomError::Forbidden(
                "Only the host may admit participants".to_string(),
            ));
        }

        let participant = self
            .store
            .update_participant(
                meeting_id,
                participant_id,
                ParticipantUpdate::Decide { approved },
            )
            .await?
            .ok_or_else(|| RoomError::InvalidState("Participant is not waiting".to_string()))?;

        self.publish_response(meeting_id, participant_id, approved)
            .await;
        metrics::record_waiting_room_decision(approved);
        info!(target: "rs.waiting_room", "Admission decided");
        Ok(participant)
    }

    /// Participants currently waiting in a meeting.
    pub async fn pending(&self, meeting_id: MeetingId) -> Result<Vec<Participant>, RoomError> {
        let meeting = self
            .store
            .find(meeting_id)
            .await?
            .ok_or_else(|| RoomError::NotFound("Meeting".to_string()))?;
        Ok(meeting.pending_participants().cloned().collect())
    }

    /// Reject everyone still waiting, releasing their held connections.
    /// Best effort. Returns how many were rejected.
    pub async fn reject_all(&self, meeting: &Meeting) -> usize {
        let mut rejected = 0;
        for participant in meeting.pending_participants() {
            match self
                .store
                .update_participant(
                    meeting.id,
                    &participant.user_id,
                    ParticipantUpdate::Decide { approved: false },
                )
                .await
            {
                Ok(Some(_)) => {
                    self.publish_response(meeting.id, &participant.user_id, false)
                        .await;
                    rejected += 1;
                }
                Ok(None) => {
                    debug!(
                        target: "rs.waiting_room",
                        user_id = %participant.user_id,
                        "Participant decided concurrently"
                    );
                }
                Err(e) => {
                    warn!(
                        target: "rs.waiting_room",
                        meeting_id = %meeting.id,
                        user_id = %participant.user_id,
                        error = %e,
                        "Failed to reject waiting participant"
                    );
                }
            }
        }
        rejected
    }

    async fn publish_response(&self, meeting_id: MeetingId, participant_id: &UserId, approved: bool) {
        publish_logged(
            self.bus.as_ref(),
            Topic::WaitingRoomResponse,
            &WaitingRoomResponseEvent {
                meeting_id,
                participant_id: participant_id.clone(),
                approved,
            },
        )
        .await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::bus::LocalEventBus;
    use crate::meetings::model::{
        MeetingFlags, MeetingSettings, MeetingStatus, ParticipantRole,
    };
    use crate::meetings::store::InMemoryMeetingStore;
    use common::types::RoomId;
    use std::time::Duration;

    fn meeting() -> Meeting {
        Meeting {
            id: MeetingId::new(),
            title: "Standup".to_string(),
            host_id: UserId::from("host"),
            co_host_ids: Vec::new(),
            room_id: RoomId::from("room-wr"),
            password: None,
            max_participants: 10,
            flags: MeetingFlags {
                is_waiting_room_enabled: true,
                ..MeetingFlags::default()
            },
            settings: MeetingSettings::default(),
            status: MeetingStatus::Active,
            participants: Vec::new(),
            scheduled_start: Utc::now(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: None,
        }
    }

    fn pending(user: &str) -> Participant {
        Participant {
            user_id: UserId::from(user),
            display_name: user.to_string(),
            role: ParticipantRole::Participant,
            joined_at: Utc::now(),
            left_at: None,
            audio_enabled: true,
            video_enabled: true,
            hand_raised: false,
            screen_sharing: false,
            admission_status: AdmissionStatus::Pending,
            connection: None,
        }
    }

    async fn setup() -> (WaitingRoom, Arc<LocalEventBus>, Meeting, Participant) {
        let store = Arc::new(InMemoryMeetingStore::new());
        let bus = Arc::new(LocalEventBus::new());
        let meeting = meeting();
        store.insert(meeting.clone()).await.unwrap();
        let guest = pending("guest-1");
        store
            .upsert_participant(meeting.id, guest.clone(), None)
            .await
            .unwrap();
        let bus_dyn: Arc<dyn EventBus> = bus.clone();
        (WaitingRoom::new(store, bus_dyn), bus, meeting, guest)
    }

    #[tokio::test]
    async fn test_park_notifies_host_and_receives_decision() {
        let (waiting_room, bus, meeting, guest) = setup().await;
        let mut host_feed = bus.subscribe(Topic::WaitingRoomJoin).await.unwrap();

        let mut ticket = waiting_room.park(&meeting, &guest).await.unwrap();
        let notice = host_feed.recv().await.unwrap();
        assert_eq!(notice.get("participantId"), Some(&serde_json::json!("guest-1")));

        waiting_room
            .decide(meeting.id, &meeting.host_id, &guest.user_id, true)
            .await
            .unwrap();

        let decision = tokio::time::timeout(Duration::from_secs(1), ticket.decision())
            .await
            .unwrap();
        assert_eq!(decision, Some(true));
    }

    #[tokio::test]
    async fn test_decision_before_park_is_not_lost() {
        let (waiting_room, _bus, meeting, guest) = setup().await;
        waiting_room
            .decide(meeting.id, &meeting.host_id, &guest.user_id, false)
            .await
            .unwrap();

        let mut ticket = waiting_room.park(&meeting, &guest).await.unwrap();
        assert_eq!(ticket.decision().await, Some(false));
    }

    #[tokio::test]
    async fn test_non_host_cannot_decide() {
        let (waiting_room, _bus, meeting, guest) = setup().await;
        let err = waiting_room
            .decide(meeting.id, &UserId::from("someone"), &guest.user_id, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Forbidden");
    }

    #[tokio::test]
    async fn test_second_decision_is_invalid_state() {
        let (waiting_room, _bus, meeting, guest) = setup().await;
        waiting_room
            .decide(meeting.id, &meeting.host_id, &guest.user_id, true)
            .await
            .unwrap();
        let err = waiting_room
            .decide(meeting.id, &meeting.host_id, &guest.user_id, true)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidState");
        assert!(waiting_room.pending(meeting.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_park_after_meeting_ended_fails() {
        let (waiting_room, _bus, meeting, guest) = setup().await;
        // The end lands after the guest's record turned pending.
        waiting_room
            .store
            .transition_status(meeting.id, &[MeetingStatus::Active], MeetingStatus::Ended, Utc::now())
            .await
            .unwrap();

        match waiting_room.park(&meeting, &guest).await {
            Err(err) => assert_eq!(err.kind(), "Ended"),
            Ok(_) => panic!("parked in an ended meeting"),
        }
    }

    #[tokio::test]
    async fn test_reject_all_releases_waiters() {
        let (waiting_room, _bus, meeting, guest) = setup().await;
        let mut ticket = waiting_room.park(&meeting, &guest).await.unwrap();

        let current = waiting_room.store.find(meeting.id).await.unwrap().unwrap();
        assert_eq!(waiting_room.reject_all(&current).await, 1);
        assert_eq!(ticket.decision().await, Some(false));
    }
}
