//! Signaling: per-connection protocol handlers.
//!
//! Handlers are transport agnostic. They read decoded frames from an
//! `mpsc::Receiver` and write frames to a bounded `mpsc::Sender`; the
//! WebSocket layer in `handlers::ws` (and the test harness) bridges those
//! channels to a real connection. Dropping the inbound sender is a
//! disconnect.
//!
//! - [`protocol`] - wire frames
//! - [`session`] - participant connection: admission, room join, dispatch
//! - [`host_channel`] - the host's waiting-room connection

pub mod host_channel;
pub mod protocol;
pub mod session;

use crate::actors::RoomRegistry;
use crate::auth::IdentityResolver;
use crate::bus::EventBus;
use crate::meetings::{MeetingLifecycle, MeetingStore, WaitingRoom};

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use host_channel::run_host_channel;
pub use protocol::{ClientMessage, HostClientMessage, HostServerMessage, Inbound, ServerMessage};
pub use session::{run_session, ConnectRequest};

/// Events a peer session buffers before the room treats it as slow.
pub const PEER_EVENT_BUFFER: usize = 256;

/// Everything a signaling connection needs.
#[derive(Clone)]
pub struct SignalingContext {
    pub identity: Arc<IdentityResolver>,
    pub store: Arc<dyn MeetingStore>,
    pub bus: Arc<dyn EventBus>,
    pub registry: Arc<RoomRegistry>,
    pub lifecycle: Arc<MeetingLifecycle>,
    pub waiting_room: Arc<WaitingRoom>,
    pub engine_timeout: Duration,
    /// Cancelled when the service stops; connections run on child tokens.
    pub shutdown: CancellationToken,
}
