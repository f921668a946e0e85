//! Actor model for live rooms.
//!
//! ```text
//! RoomRegistry (one per process)
//! └── RoomActor (one per live room)
//!     ├── owns the media router and the producer directory
//!     └── fans events out to N peer sessions
//!         └── PeerSession (one per signaling connection)
//!             └── owns transports, producers and consumers
//! ```
//!
//! - **Create-if-absent**: the registry serializes room creation per room id,
//!   so concurrent first joiners share one router
//! - **CancellationToken propagation**: rooms run on child tokens of the
//!   registry's token
//! - **Mailbox monitoring**: Room 100/500, Peer 50/200
//!
//! # Modules
//!
//! - [`registry`] - `RoomRegistry`, room id to live room
//! - [`room`] - `RoomActor` per live room
//! - [`peer`] - `PeerSession` per signaling connection
//! - [`messages`] - Message types for actor communication
//! - [`metrics`] - Mailbox monitoring

pub mod messages;
pub mod metrics;
pub mod peer;
pub mod registry;
pub mod room;

pub use messages::*;
pub use metrics::{ActorType, MailboxLevel, MailboxMonitor};
pub use peer::{ConsumeOutcome, EngineNotice, PeerSession};
pub use registry::RoomRegistry;
pub use room::{RoomActor, RoomHandle};
