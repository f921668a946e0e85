//! Meeting store.
//!
//! Every mutation is a read-modify-write of one meeting document. The
//! mutation bodies live here as plain functions over [`Meeting`] so the
//! in-memory store and the Redis store apply exactly the same rules; the
//! backends only differ in how they make the read-modify-write atomic.

use crate::errors::StoreError;
use crate::meetings::model::{AdmissionStatus, Meeting, MeetingStatus, Participant, ParticipantUpdate};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MeetingId, RoomId, UserId};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Result of [`MeetingStore::upsert_participant`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(Participant),
    Updated(Participant),
    /// Accepting the record would exceed the capacity given.
    Full,
    /// Meeting is ended or cancelled.
    Ended,
    MeetingMissing,
}

/// Persistence for meeting documents.
#[async_trait]
pub trait MeetingStore: Send + Sync + 'static {
    /// Insert a new meeting. Fails if the id or room id is taken.
    async fn insert(&self, meeting: Meeting) -> Result<(), StoreError>;

    async fn find(&self, meeting_id: MeetingId) -> Result<Option<Meeting>, StoreError>;

    async fn find_by_room(&self, room_id: &RoomId) -> Result<Option<Meeting>, StoreError>;

    /// Insert or replace the participant record keyed by its user id.
    ///
    /// When `capacity` is given and the record would newly occupy a live
    /// slot, the write is refused with [`UpsertOutcome::Full`] if the meeting
    /// already has `capacity` live participants. The check and the write are
    /// one atomic step.
    async fn upsert_participant(
        &self,
        meeting_id: MeetingId,
        participant: Participant,
        capacity: Option<u32>,
    ) -> Result<UpsertOutcome, StoreError>;

    /// Apply a guarded update. Returns the updated record, or `None` when the
    /// participant is unknown or the guard refused the update.
    async fn update_participant(
        &self,
        meeting_id: MeetingId,
        user_id: &UserId,
        update: ParticipantUpdate,
    ) -> Result<Option<Participant>, StoreError>;

    /// Move the meeting to `to` if its current status is one of `from`.
    async fn transition_status(
        &self,
        meeting_id: MeetingId,
        from: &[MeetingStatus],
        to: MeetingStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Mark every connected participant as left. Returns their user ids.
    async fn mark_all_left(
        &self,
        meeting_id: MeetingId,
        at: DateTime<Utc>,
    ) -> Result<Vec<UserId>, StoreError>;
}

pub(crate) fn apply_upsert(
    meeting: &mut Meeting,
    participant: Participant,
    capacity: Option<u32>,
) -> UpsertOutcome {
    if meeting.status.is_terminal() {
        return UpsertOutcome::Ended;
    }

    let already_live = meeting
        .participant(&participant.user_id)
        .is_some_and(Participant::is_live);

    if let Some(capacity) = capacity {
        let live = meeting.live_participant_count();
        if participant.is_live() && !already_live && live >= capacity as usize {
            return UpsertOutcome::Full;
        }
    }

    match meeting.participant_mut(&participant.user_id) {
        Some(existing) => {
            *existing = participant.clone();
            UpsertOutcome::Updated(participant)
        }
        None => {
            meeting.participants.push(participant.clone());
            UpsertOutcome::Inserted(participant)
        }
    }
}

pub(crate) fn apply_update(
    meeting: &mut Meeting,
    user_id: &UserId,
    update: &ParticipantUpdate,
) -> Option<Participant> {
    let participant = meeting.participant_mut(user_id)?;
    if participant.apply(update) {
        Some(participant.clone())
    } else {
        None
    }
}

pub(crate) fn apply_transition(
    meeting: &mut Meeting,
    from: &[MeetingStatus],
    to: MeetingStatus,
    at: DateTime<Utc>,
) -> bool {
    if !from.contains(&meeting.status) {
        return false;
    }
    meeting.status = to;
    match to {
        MeetingStatus::Active => {
            meeting.started_at.get_or_insert(at);
        }
        MeetingStatus::Ended | MeetingStatus::Cancelled => meeting.ended_at = Some(at),
        MeetingStatus::Scheduled => {}
    }
    true
}

pub(crate) fn apply_mark_all_left(meeting: &mut Meeting, at: DateTime<Utc>) -> Vec<UserId> {
    meeting
        .participants
        .iter_mut()
        .filter(|p| p.admission_status == AdmissionStatus::Connected)
        .map(|p| {
            p.admission_status = AdmissionStatus::Disconnected;
            p.left_at = Some(at);
            p.hand_raised = false;
            p.screen_sharing = false;
            p.user_id.clone()
        })
        .collect()
}

/// Process-local store used when no Redis URL is configured, and in tests.
#[derive(Debug, Default)]
pub struct InMemoryMeetingStore {
    meetings: RwLock<HashMap<MeetingId, Meeting>>,
}

impl InMemoryMeetingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MeetingStore for InMemoryMeetingStore {
    async fn insert(&self, meeting: Meeting) -> Result<(), StoreError> {
        let mut meetings = self.meetings.write().await;
        if meetings.contains_key(&meeting.id) {
            return Err(StoreError::Backend(format!(
                "meeting {} already exists",
                meeting.id
            )));
        }
        if meetings.values().any(|m| m.room_id == meeting.room_id) {
            return Err(StoreError::Backend(format!(
                "room {} already bound",
                meeting.room_id
            )));
        }
        meetings.insert(meeting.id, meeting);
        Ok(())
    }

    async fn find(&self, meeting_id: MeetingId) -> Result<Option<Meeting>, StoreError> {
        Ok(self.meetings.read().await.get(&meeting_id).cloned())
    }

    async fn find_by_room(&self, room_id: &RoomId) -> Result<Option<Meeting>, StoreError> {
        Ok(self
            .meetings
            .read()
            .await
            .values()
            .find(|m| &m.room_id == room_id)
            .cloned())
    }

    async fn upsert_participant(
        &self,
        meeting_id: MeetingId,
        participant: Participant,
        capacity: Option<u32>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut meetings = self.meetings.write().await;
        Ok(match meetings.get_mut(&meeting_id) {
            Some(meeting) => apply_upsert(meeting, participant, capacity),
            None => UpsertOutcome::MeetingMissing,
        })
    }

    async fn update_participant(
        &self,
        meeting_id: MeetingId,
        user_id: &UserId,
        update: ParticipantUpdate,
    ) -> Result<Option<Participant>, StoreError> {
        let mut meetings = self.meetings.write().await;
        Ok(meetings
            .get_mut(&meeting_id)
            .and_then(|meeting| apply_update(meeting, user_id, &update)))
    }

    async fn transition_status(
        &self,
        meeting_id: MeetingId,
        from: &[MeetingStatus],
        to: MeetingStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut meetings = self.meetings.write().await;
        Ok(meetings
            .get_mut(&meeting_id)
            .is_some_and(|meeting| apply_transition(meeting, from, to, at)))
    }

    async fn mark_all_left(
        &self,
        meeting_id: MeetingId,
        at: DateTime<Utc>,
    ) -> Result<Vec<UserId>, StoreError> {
        let mut meetings = self.meetings.write().await;
        Ok(meetings
            .get_mut(&meeting_id)
            .map(|meeting| apply_mark_all_left(meeting, at))
            .unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::meetings::model::{MeetingFlags, MeetingSettings, ParticipantRole};
    use common::types::PeerId;

    fn meeting(max_participants: u32) -> Meeting {
        Meeting {
            id: MeetingId::new(),
            title: "Standup".to_string(),
            host_id: UserId::from("host"),
            co_host_ids: Vec::new(),
            room_id: RoomId::generate(),
            password: None,
            max_participants,
            flags: MeetingFlags::default(),
            settings: MeetingSettings::default(),
            status: MeetingStatus::Scheduled,
            participants: Vec::new(),
            scheduled_start: Utc::now(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    fn connected(user: &str) -> Participant {
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
            admission_status: AdmissionStatus::Connected,
            connection: Some(crate::meetings::model::ConnectionInfo {
                peer_id: PeerId::new(),
                bound_at: Utc::now(),
            }),
        }
    }

    #[tokio::test]
    async fn test_capacity_is_enforced_on_new_live_slots_only() {
        let store = InMemoryMeetingStore::new();
        let m = meeting(1);
        let id = m.id;
        store.insert(m).await.unwrap();

        let first = store
            .upsert_participant(id, connected("a"), Some(1))
            .await
            .unwrap();
        assert!(matches!(first, UpsertOutcome::Inserted(_)));

        let second = store
            .upsert_participant(id, connected("b"), Some(1))
            .await
            .unwrap();
        assert_eq!(second, UpsertOutcome::Full);

        // The same user reconnecting does not need a new slot.
        let again = store
            .upsert_participant(id, connected("a"), Some(1))
            .await
            .unwrap();
        assert!(matches!(again, UpsertOutcome::Updated(_)));

        let stored = store.find(id).await.unwrap().unwrap();
        assert_eq!(stored.participants.len(), 1);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_set() {
        let store = InMemoryMeetingStore::new();
        let m = meeting(5);
        let id = m.id;
        store.insert(m).await.unwrap();

        let live = [MeetingStatus::Scheduled, MeetingStatus::Active];
        assert!(store
            .transition_status(id, &live, MeetingStatus::Ended, Utc::now())
            .await
            .unwrap());
        assert!(!store
            .transition_status(id, &live, MeetingStatus::Ended, Utc::now())
            .await
            .unwrap());

        let stored = store.find(id).await.unwrap().unwrap();
        assert_eq!(stored.status, MeetingStatus::Ended);
        assert!(stored.ended_at.is_some());

        let outcome = store
            .upsert_participant(id, connected("late"), Some(5))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::Ended);
    }

    #[tokio::test]
    async fn test_room_ids_are_unique() {
        let store = InMemoryMeetingStore::new();
        let first = meeting(5);
        let mut second = meeting(5);
        second.room_id = first.room_id.clone();
        store.insert(first.clone()).await.unwrap();
        assert!(store.insert(second).await.is_err());

        let found = store.find_by_room(&first.room_id).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
    }

    #[tokio::test]
    async fn test_mark_all_left_touches_connected_only() {
        let store = InMemoryMeetingStore::new();
        let m = meeting(5);
        let id = m.id;
        store.insert(m).await.unwrap();
        store
            .upsert_participant(id, connected("a"), None)
            .await
            .unwrap();
        let mut waiting = connected("b");
        waiting.admission_status = AdmissionStatus::Pending;
        store.upsert_participant(id, waiting, None).await.unwrap();

        let left = store.mark_all_left(id, Utc::now()).await.unwrap();
        assert_eq!(left, vec![UserId::from("a")]);

        let stored = store.find(id).await.unwrap().unwrap();
        assert_eq!(stored.live_participant_count(), 0);
        assert_eq!(stored.pending_participants().count(), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_participant_is_none() {
        let store = InMemoryMeetingStore::new();
        let m = meeting(5);
        let id = m.id;
        store.insert(m).await.unwrap();

        let result = store
            .update_participant(id, &UserId::from("ghost"), ParticipantUpdate::HandRaised(true))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
