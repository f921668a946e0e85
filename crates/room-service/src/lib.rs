//! Room Service Library
//!
//! Real-time meeting room coordinator. The service:
//!
//! - Schedules meetings and drives their lifecycle (scheduled, active,
//!   ended, cancelled)
//! - Admits participants: passwords, capacity, and a host-controlled
//!   waiting room
//! - Runs one live room per active meeting, each owning a media router
//! - Relays WebSocket signaling so peers can send and receive media
//!   through the room's router
//!
//! # Architecture
//!
//! ```text
//! HTTP / WebSocket (routes, handlers)
//! ├── MeetingLifecycle + WaitingRoom (meetings) ── MeetingStore, EventBus
//! └── signaling session per connection
//!     └── PeerSession ── RoomActor ── MediaRouter (media)
//!                        └── owned by RoomRegistry
//! ```
//!
//! # Key Design Decisions
//!
//! - **Single writer per room**: every room mutation goes through its actor,
//!   so snapshots and broadcasts are consistently ordered
//! - **Store as source of truth**: meeting and participant records live in
//!   the `MeetingStore`; the room holds only live media state
//! - **Bounded engine calls**: every media engine call has a timeout
//!
//! # Modules
//!
//! - [`actors`] - Room registry, room actors, peer sessions
//! - [`auth`] - Access token validation and guest identities
//! - [`bus`] - Event bus (in-process or Redis pub/sub)
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with client-safe messages
//! - [`handlers`] - HTTP and WebSocket handlers
//! - [`media`] - Media engine seam and the loopback engine
//! - [`meetings`] - Meeting records, store, lifecycle, waiting room
//! - [`observability`] - Metrics and health endpoints
//! - [`routes`] - Router and application state
//! - [`signaling`] - Signaling protocol and connection handlers

pub mod actors;
pub mod auth;
pub mod bus;
pub mod config;
pub mod errors;
pub mod handlers;
pub mod media;
pub mod meetings;
pub mod observability;
pub mod routes;
pub mod signaling;
