//! Redis-backed meeting store.
//!
//! # Key Patterns
//!
//! - `meeting:{id}` - Meeting document (JSON), participants included
//! - `meeting:room:{room_id}` - Meeting id bound to a room
//!
//! # Connection Pattern
//!
//! The `MultiplexedConnection` is cloned per operation. No locking is needed.

use crate::errors::StoreError;
use crate::meetings::lua_scripts;
use crate::meetings::model::{Meeting, MeetingStatus, Participant, ParticipantUpdate};
use crate::meetings::store::{
    apply_mark_all_left, apply_transition, apply_update, apply_upsert, MeetingStore,
    UpsertOutcome,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{MeetingId, RoomId, UserId};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use tracing::{debug, error, instrument, warn};

/// Attempts before a contended compare-and-swap gives up.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Reply of the [`lua_scripts::COMPARE_AND_SWAP`] script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CasReply {
    Swapped,
    Missing,
    Conflict,
}

impl CasReply {
    fn from_code(code: i64) -> Self {
        match code {
            1 => CasReply::Swapped,
            -1 => CasReply::Missing,
            _ => CasReply::Conflict,
        }
    }
}

fn meeting_key(meeting_id: MeetingId) -> String {
    format!("meeting:{meeting_id}")
}

fn room_key(room_id: &RoomId) -> String {
    format!("meeting:room:{room_id}")
}

/// Meeting store on a shared Redis instance.
///
/// Cheaply cloneable.
#[derive(Clone)]
pub struct RedisMeetingStore {
    connection: MultiplexedConnection,
    insert_script: Script,
    cas_script: Script,
}

impl RedisMeetingStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, StoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do not log the URL, it may carry credentials.
            error!(target: "rs.store.redis", error = %e, "Failed to open Redis client");
            StoreError::Backend(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "rs.store.redis", error = %e, "Failed to connect to Redis");
                StoreError::Backend(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self::from_connection(connection))
    }

    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            insert_script: Script::new(lua_scripts::INSERT_MEETING),
            cas_script: Script::new(lua_scripts::COMPARE_AND_SWAP),
        }
    }

    async fn load_raw(&self, meeting_id: MeetingId) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = conn.get(meeting_key(meeting_id)).await?;
        Ok(raw)
    }

    /// Read-modify-write one meeting document.
    ///
    /// `change` returns its result and whether the document changed. An
    /// unchanged document is not written back. Returns `None` when the
    /// meeting does not exist.
    async fn mutate<T, F>(&self, meeting_id: MeetingId, mut change: F) -> Result<Option<T>, StoreError>
    where
        F: FnMut(&mut Meeting) -> (T, bool) + Send,
        T: Send,
    {
        let key = meeting_key(meeting_id);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let Some(raw) = self.load_raw(meeting_id).await? else {
                return Ok(None);
            };
            let mut meeting: Meeting = serde_json::from_str(&raw)?;
            let (result, changed) = change(&mut meeting);
            if !changed {
                return Ok(Some(result));
            }

            let updated = serde_json::to_string(&meeting)?;
            let mut conn = self.connection.clone();
            let swapped: i64 = self
                .cas_script
                .key(&key)
                .arg(&raw)
                .arg(&updated)
                .invoke_async(&mut conn)
                .await?;

            match CasReply::from_code(swapped) {
                CasReply::Swapped => return Ok(Some(result)),
                CasReply::Missing => return Ok(None),
                CasReply::Conflict => {
                    debug!(
                        target: "rs.store.redis",
                        meeting_id = %meeting_id,
                        attempt,
                        "Meeting document changed concurrently, retrying"
                    );
                }
            }
        }

        warn!(
            target: "rs.store.redis",
            meeting_id = %meeting_id,
            "Compare-and-swap retries exhausted"
        );
        Err(StoreError::Backend(format!(
            "meeting {meeting_id} is under write contention"
        )))
    }
}

#[async_trait]
impl MeetingStore for RedisMeetingStore {
    #[instrument(skip_all, fields(meeting_id = %meeting.id))]
    async fn insert(&self, meeting: Meeting) -> Result<(), StoreError> {
        let document = serde_json::to_string(&meeting)?;
        let mut conn = self.connection.clone();
        let inserted: i64 = self
            .insert_script
            .key(meeting_key(meeting.id))
            .key(room_key(&meeting.room_id))
            .arg(&document)
            .arg(meeting.id.to_string())
            .invoke_async(&mut conn)
            .await?;

        match inserted {
            1 => Ok(()),
            0 => Err(StoreError::Backend(format!(
                "meeting {} already exists",
                meeting.id
            ))),
            _ => Err(StoreError::Backend(format!(
                "room {} already bound",
                meeting.room_id
            ))),
        }
    }

    async fn find(&self, meeting_id: MeetingId) -> Result<Option<Meeting>, StoreError> {
        match self.load_raw(meeting_id).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn find_by_room(&self, room_id: &RoomId) -> Result<Option<Meeting>, StoreError> {
        let mut conn = self.connection.clone();
        let bound: Option<String> = conn.get(room_key(room_id)).await?;
        let Some(bound) = bound else {
            return Ok(None);
        };
        let meeting_id: MeetingId = bound
            .parse()
            .map_err(|e| StoreError::Malformed(format!("room index for {room_id}: {e}")))?;
        self.find(meeting_id).await
    }

    #[instrument(skip_all, fields(meeting_id = %meeting_id, user_id = %participant.user_id))]
    async fn upsert_participant(
        &self,
        meeting_id: MeetingId,
        participant: Participant,
        capacity: Option<u32>,
    ) -> Result<UpsertOutcome, StoreError> {
        let outcome = self
            .mutate(meeting_id, |meeting| {
                let outcome = apply_upsert(meeting, participant.clone(), capacity);
                let changed = matches!(
                    outcome,
                    UpsertOutcome::Inserted(_) | UpsertOutcome::Updated(_)
                );
                (outcome, changed)
            })
            .await?;
        Ok(outcome.unwrap_or(UpsertOutcome::MeetingMissing))
    }

    async fn update_participant(
        &self,
        meeting_id: MeetingId,
        user_id: &UserId,
        update: ParticipantUpdate,
    ) -> Result<Option<Participant>, StoreError> {
        let updated = self
            .mutate(meeting_id, |meeting| {
                let updated = apply_update(meeting, user_id, &update);
                let changed = updated.is_some();
                (updated, changed)
            })
            .await?;
        Ok(updated.flatten())
    }

    async fn transition_status(
        &self,
        meeting_id: MeetingId,
        from: &[MeetingStatus],
        to: MeetingStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let moved = self
            .mutate(meeting_id, |meeting| {
                let moved = apply_transition(meeting, from, to, at);
                (moved, moved)
            })
            .await?;
        Ok(moved.unwrap_or(false))
    }

    async fn mark_all_left(
        &self,
        meeting_id: MeetingId,
        at: DateTime<Utc>,
    ) -> Result<Vec<UserId>, StoreError> {
        let left = self
            .mutate(meeting_id, |meeting| {
                let left = apply_mark_all_left(meeting, at);
                let changed = !left.is_empty();
                (left, changed)
            })
            .await?;
        Ok(left.unwrap_or_default())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::meetings::model::{MeetingFlags, MeetingSettings};

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string())
    }

    fn meeting(room: &str) -> Meeting {
        Meeting {
            id: MeetingId::new(),
            title: "Standup".to_string(),
            host_id: UserId::from("host"),
            co_host_ids: Vec::new(),
            room_id: RoomId::from(format!("{room}-{}", MeetingId::new())),
            password: None,
            max_participants: 10,
            flags: MeetingFlags::default(),
            settings: MeetingSettings::default(),
            status: MeetingStatus::Active,
            participants: Vec::new(),
            scheduled_start: Utc::now(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            ended_at: None,
        }
    }

    /// Overwrite the stored document from outside the store, as another
    /// instance would.
    fn write_behind_back(key: &str, meeting: &Meeting) {
        let client = Client::open(redis_url()).unwrap();
        let mut conn = client.get_connection().unwrap();
        redis::cmd("SET")
            .arg(key)
            .arg(serde_json::to_string(meeting).unwrap())
            .query::<()>(&mut conn)
            .unwrap();
    }

    #[test]
    fn test_key_patterns() {
        let meeting_id: MeetingId = "6f1c1c55-6d5c-4c8a-9b0e-3c1f7e2f9a10".parse().unwrap_or_default();
        assert_eq!(
            meeting_key(meeting_id),
            "meeting:6f1c1c55-6d5c-4c8a-9b0e-3c1f7e2f9a10"
        );
        assert_eq!(room_key(&RoomId::from("abc")), "meeting:room:abc");
    }

    #[test]
    fn test_cas_reply_codes() {
        assert_eq!(CasReply::from_code(1), CasReply::Swapped);
        assert_eq!(CasReply::from_code(-1), CasReply::Missing);
        assert_eq!(CasReply::from_code(0), CasReply::Conflict);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires Redis at REDIS_URL"]
    async fn test_mutate_retries_after_concurrent_write() {
        let store = RedisMeetingStore::connect(&redis_url()).await.unwrap();
        let original = meeting("room-cas-retry");
        store.insert(original.clone()).await.unwrap();
        let key = meeting_key(original.id);

        let mut attempts = 0;
        let applied = store
            .mutate(original.id, |meeting| {
                attempts += 1;
                if attempts == 1 {
                    let mut other = meeting.clone();
                    other.title = "Renamed elsewhere".to_string();
                    write_behind_back(&key, &other);
                }
                meeting.max_participants = 3;
                (attempts, true)
            })
            .await
            .unwrap();

        assert_eq!(applied, Some(2));
        let stored = store.find(original.id).await.unwrap().unwrap();
        // Both writes survive.
        assert_eq!(stored.title, "Renamed elsewhere");
        assert_eq!(stored.max_participants, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires Redis at REDIS_URL"]
    async fn test_mutate_gives_up_under_contention() {
        let store = RedisMeetingStore::connect(&redis_url()).await.unwrap();
        let original = meeting("room-cas-busy");
        store.insert(original.clone()).await.unwrap();
        let key = meeting_key(original.id);

        let mut attempts = 0;
        let result = store
            .mutate(original.id, |meeting| {
                attempts += 1;
                let mut other = meeting.clone();
                other.title = format!("Write {attempts}");
                write_behind_back(&key, &other);
                meeting.max_participants = 3;
                ((), true)
            })
            .await;

        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(attempts, MAX_CAS_ATTEMPTS);
        let stored = store.find(original.id).await.unwrap().unwrap();
        assert_eq!(stored.max_participants, 10);
    }

    #[tokio::test]
    #[ignore = "requires Redis at REDIS_URL"]
    async fn test_mutate_on_missing_meeting_is_none() {
        let store = RedisMeetingStore::connect(&redis_url()).await.unwrap();
        let outcome = store
            .upsert_participant(MeetingId::new(), meeting_participant("alice"), Some(2))
            .await
            .unwrap();
        assert_eq!(outcome, UpsertOutcome::MeetingMissing);
        assert!(!store
            .transition_status(MeetingId::new(), &[MeetingStatus::Active], MeetingStatus::Ended, Utc::now())
            .await
            .unwrap());
    }

    fn meeting_participant(user: &str) -> Participant {
        Participant {
            user_id: UserId::from(user),
            display_name: user.to_string(),
            role: crate::meetings::model::ParticipantRole::Participant,
            joined_at: Utc::now(),
            left_at: None,
            audio_enabled: true,
            video_enabled: true,
            hand_raised: false,
            screen_sharing: false,
            admission_status: crate::meetings::model::AdmissionStatus::Approved,
            connection: None,
        }
    }
}
