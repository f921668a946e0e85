//! Meetings: persisted documents, their store, lifecycle and admission.
//!
//! - [`model`] - meeting and participant documents
//! - [`store`] - `MeetingStore` trait and the in-memory store
//! - [`redis_store`] - Redis-backed store
//! - [`lua_scripts`] - atomic Redis scripts used by the Redis store
//! - [`lifecycle`] - `MeetingLifecycle`, status transitions and joins
//! - [`waiting_room`] - host admission of waiting participants

pub mod lifecycle;
pub mod lua_scripts;
pub mod model;
pub mod redis_store;
pub mod store;
pub mod waiting_room;

pub use lifecycle::{CreateMeeting, JoinGrant, MeetingLifecycle};
pub use model::{
    AdmissionStatus, Meeting, MeetingFlags, MeetingSettings, MeetingStatus, MeetingView,
    Participant, ParticipantRole, ParticipantUpdate,
};
pub use redis_store::RedisMeetingStore;
pub use store::{InMemoryMeetingStore, MeetingStore, UpsertOutcome};
pub use waiting_room::{WaitingRoom, WaitingTicket};
