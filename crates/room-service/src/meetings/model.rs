//! Meeting documents.
//!
//! A `Meeting` is the persisted record owned by the lifecycle controller. Its
//! participants are keyed by user id, so a reconnecting user updates the same
//! record rather than appending a new one.

use chrono::{DateTime, Utc};
use common::secret::{ExposeSecret, SecretString};
use common::types::{MeetingId, PeerId, RoomId, UserId};
use serde::{Deserialize, Serialize, Serializer};

/// Meeting status enumeration.
///
/// `Scheduled -> Active` happens on first join. `Ended` and `Cancelled` are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    /// Meeting is scheduled but nobody has joined yet.
    Scheduled,

    /// Meeting is in progress.
    Active,

    /// Meeting was ended by its host.
    Ended,

    /// Meeting was cancelled by its host.
    Cancelled,
}

impl MeetingStatus {
    /// Returns the string representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            MeetingStatus::Scheduled => "scheduled",
            MeetingStatus::Active => "active",
            MeetingStatus::Ended => "ended",
            MeetingStatus::Cancelled => "cancelled",
        }
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MeetingStatus::Ended | MeetingStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParticipantRole {
    Host,
    CoHost,
    Participant,
    Guest,
}

/// Admission status of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionStatus {
    /// Held in the waiting room.
    Pending,
    /// Approved by the host, not yet connected.
    Approved,
    /// Rejected by the host.
    Rejected,
    /// Joined to the live room.
    Connected,
    /// Left or dropped.
    Disconnected,
}

impl AdmissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionStatus::Pending => "pending",
            AdmissionStatus::Approved => "approved",
            AdmissionStatus::Rejected => "rejected",
            AdmissionStatus::Connected => "connected",
            AdmissionStatus::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingFlags {
    #[serde(default)]
    pub is_recording_enabled: bool,
    #[serde(default)]
    pub is_transcription_enabled: bool,
    #[serde(default)]
    pub is_waiting_room_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingSettings {
    #[serde(default)]
    pub mute_on_entry: bool,
    #[serde(default)]
    pub disable_video_on_entry: bool,
    #[serde(default)]
    pub end_when_host_leaves: bool,
}

/// Metadata of the signaling connection currently bound to a participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub peer_id: PeerId,
    pub bound_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<DateTime<Utc>>,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub hand_raised: bool,
    pub screen_sharing: bool,
    pub admission_status: AdmissionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionInfo>,
}

/// A single-participant mutation. Every store applies it with
/// [`Participant::apply`], so guards behave identically across backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantUpdate {
    /// Host decision. Applies only while the participant is pending.
    Decide { approved: bool },
    /// Participant left. With a `peer_id`, applies only if that peer is
    /// still the bound connection; `None` is an explicit leave through the
    /// HTTP API. Hand and audio/video state survive.
    Disconnected {
        peer_id: Option<PeerId>,
        at: DateTime<Utc>,
    },
    HandRaised(bool),
    AudioEnabled(bool),
    VideoEnabled(bool),
    ScreenSharing(bool),
}

impl Participant {
    /// Apply `update`, returning whether anything changed.
    pub fn apply(&mut self, update: &ParticipantUpdate) -> bool {
        match update {
            ParticipantUpdate::Decide { approved } => {
                if self.admission_status != AdmissionStatus::Pending {
                    return false;
                }
                self.admission_status = if *approved {
                    AdmissionStatus::Approved
                } else {
                    AdmissionStatus::Rejected
                };
                true
            }
            ParticipantUpdate::Disconnected { peer_id, at } => {
                let bound = peer_id.map_or(true, |peer_id| {
                    self.connection
                        .as_ref()
                        .is_some_and(|connection| connection.peer_id == peer_id)
                });
                let live = matches!(
                    self.admission_status,
                    AdmissionStatus::Connected | AdmissionStatus::Pending | AdmissionStatus::Approved
                );
                if !bound || !live {
                    return false;
                }
                self.admission_status = AdmissionStatus::Disconnected;
                self.left_at = Some(*at);
                // Screen producers die with the connection. Hand state is
                // kept for a reconnect.
                self.screen_sharing = false;
                true
            }
            ParticipantUpdate::HandRaised(raised) => replace(&mut self.hand_raised, *raised),
            ParticipantUpdate::AudioEnabled(enabled) => replace(&mut self.audio_enabled, *enabled),
            ParticipantUpdate::VideoEnabled(enabled) => replace(&mut self.video_enabled, *enabled),
            ParticipantUpdate::ScreenSharing(sharing) => {
                replace(&mut self.screen_sharing, *sharing)
            }
        }
    }

    /// Whether this participant occupies a capacity slot.
    pub fn is_live(&self) -> bool {
        self.admission_status == AdmissionStatus::Connected
    }
}

fn replace(field: &mut bool, value: bool) -> bool {
    let changed = *field != value;
    *field = value;
    changed
}

/// Persisted meeting document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Meeting {
    pub id: MeetingId,
    pub title: String,
    pub host_id: UserId,
    #[serde(default)]
    pub co_host_ids: Vec<UserId>,
    pub room_id: RoomId,
    #[serde(
        default,
        serialize_with = "serialize_password",
        skip_serializing_if = "Option::is_none"
    )]
    pub password: Option<SecretString>,
    pub max_participants: u32,
    #[serde(default)]
    pub flags: MeetingFlags,
    #[serde(default)]
    pub settings: MeetingSettings,
    pub status: MeetingStatus,
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub scheduled_start: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

fn serialize_password<S: Serializer>(
    password: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    password
        .as_ref()
        .map(|p| p.expose_secret())
        .serialize(serializer)
}

impl Meeting {
    pub fn is_password_protected(&self) -> bool {
        self.password.is_some()
    }

    pub fn participant(&self, user_id: &UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &UserId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.user_id == user_id)
    }

    /// Participants occupying a capacity slot.
    pub fn live_participant_count(&self) -> usize {
        self.participants.iter().filter(|p| p.is_live()).count()
    }

    pub fn role_of(&self, user_id: &UserId) -> ParticipantRole {
        if &self.host_id == user_id {
            ParticipantRole::Host
        } else if self.co_host_ids.contains(user_id) {
            ParticipantRole::CoHost
        } else if user_id.is_guest() {
            ParticipantRole::Guest
        } else {
            ParticipantRole::Participant
        }
    }

    pub fn pending_participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants
            .iter()
            .filter(|p| p.admission_status == AdmissionStatus::Pending)
    }

    /// Client-facing view without the password.
    pub fn view(&self) -> MeetingView {
        MeetingView {
            id: self.id,
            title: self.title.clone(),
            host_id: self.host_id.clone(),
            room_id: self.room_id.clone(),
            is_password_protected: self.is_password_protected(),
            max_participants: self.max_participants,
            flags: self.flags.clone(),
            settings: self.settings.clone(),
            status: self.status,
            participants: self.participants.clone(),
            scheduled_start: self.scheduled_start,
            created_at: self.created_at,
            started_at: self.started_at,
            ended_at: self.ended_at,
        }
    }
}

/// Meeting as returned by the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingView {
    pub id: MeetingId,
    pub title: String,
    pub host_id: UserId,
    pub room_id: RoomId,
    pub is_password_protected: bool,
    pub max_participants: u32,
    pub flags: MeetingFlags,
    pub settings: MeetingSettings,
    pub status: MeetingStatus,
    pub participants: Vec<Participant>,
    pub scheduled_start: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn participant(status: AdmissionStatus, peer: Option<PeerId>) -> Participant {
        Participant {
            user_id: UserId::from("u-1"),
            display_name: "Ada".to_string(),
            role: ParticipantRole::Participant,
            joined_at: Utc::now(),
            left_at: None,
            audio_enabled: true,
            video_enabled: true,
            hand_raised: true,
            screen_sharing: false,
            admission_status: status,
            connection: peer.map(|peer_id| ConnectionInfo {
                peer_id,
                bound_at: Utc::now(),
            }),
        }
    }

    #[test]
    fn test_decide_applies_only_to_pending() {
        let mut p = participant(AdmissionStatus::Pending, None);
        assert!(p.apply(&ParticipantUpdate::Decide { approved: true }));
        assert_eq!(p.admission_status, AdmissionStatus::Approved);

        // A second decision is not a state change.
        assert!(!p.apply(&ParticipantUpdate::Decide { approved: false }));
        assert_eq!(p.admission_status, AdmissionStatus::Approved);
    }

    #[test]
    fn test_disconnect_requires_bound_peer() {
        let current = PeerId::new();
        let stale = PeerId::new();
        let mut p = participant(AdmissionStatus::Connected, Some(current));

        assert!(!p.apply(&ParticipantUpdate::Disconnected {
            peer_id: Some(stale),
            at: Utc::now()
        }));
        assert_eq!(p.admission_status, AdmissionStatus::Connected);

        assert!(p.apply(&ParticipantUpdate::Disconnected {
            peer_id: Some(current),
            at: Utc::now()
        }));
        assert_eq!(p.admission_status, AdmissionStatus::Disconnected);
        assert!(p.left_at.is_some());
        assert!(p.hand_raised);

        // Already disconnected.
        assert!(!p.apply(&ParticipantUpdate::Disconnected {
            peer_id: Some(current),
            at: Utc::now()
        }));
    }

    #[test]
    fn test_explicit_leave_ignores_connection() {
        let mut p = participant(AdmissionStatus::Approved, None);
        assert!(p.apply(&ParticipantUpdate::Disconnected {
            peer_id: None,
            at: Utc::now()
        }));
        assert_eq!(p.admission_status, AdmissionStatus::Disconnected);
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&MeetingStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert_eq!(
            serde_json::to_string(&ParticipantRole::CoHost).unwrap(),
            "\"co-host\""
        );
        assert!(MeetingStatus::Ended.is_terminal());
        assert!(!MeetingStatus::Active.is_terminal());
    }

    #[test]
    fn test_password_round_trips_but_is_not_in_view() {
        let meeting = Meeting {
            id: MeetingId::new(),
            title: "Design review".to_string(),
            host_id: UserId::from("host"),
            co_host_ids: vec![UserId::from("deputy")],
            room_id: RoomId::from("room-1"),
            password: Some(SecretString::from("letmein")),
            max_participants: 10,
            flags: MeetingFlags::default(),
            settings: MeetingSettings::default(),
            status: MeetingStatus::Scheduled,
            participants: Vec::new(),
            scheduled_start: Utc::now(),
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };

        let stored = serde_json::to_string(&meeting).unwrap();
        let back: Meeting = serde_json::from_str(&stored).unwrap();
        assert_eq!(
            back.password.as_ref().map(|p| p.expose_secret().to_string()),
            Some("letmein".to_string())
        );

        let view = serde_json::to_string(&meeting.view()).unwrap();
        assert!(!view.contains("letmein"));
        assert!(view.contains("\"isPasswordProtected\":true"));

        assert!(!format!("{meeting:?}").contains("letmein"));
        assert_eq!(meeting.role_of(&UserId::from("host")), ParticipantRole::Host);
        assert_eq!(meeting.role_of(&UserId::from("deputy")), ParticipantRole::CoHost);
        assert_eq!(meeting.role_of(&UserId::guest()), ParticipantRole::Guest);
    }
}
