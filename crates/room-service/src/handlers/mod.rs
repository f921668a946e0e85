//! HTTP and WebSocket request handlers for the Room Service.

pub mod meetings;
pub mod ws;

pub use meetings::{
    cancel_meeting, create_meeting, end_meeting, get_meeting, join_meeting, leave_meeting,
};
pub use ws::{host_socket, room_socket};
