//! # Room Test Utilities
//!
//! Shared test utilities for the Room Service.
//!
//! This crate provides a mock media engine, fixtures and an in-process
//! harness for testing the service without real infrastructure.
//!
//! ## Modules
//!
//! - `mock_engine` - Media engine with failure injection and router counters
//! - `fixtures` - Tokens, configuration, meeting requests, media parameters
//! - `harness` - The signaling stack wired over channels
//!
//! ## Usage
//!
//! ```rust,ignore
//! use room_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = Harness::new();
//!     let meeting = harness.create_meeting("alice", TestMeeting::new("room-1").build()).await;
//!
//!     let mut alice = harness.connect(&meeting.room_id, "alice");
//!     let info = alice.joined().await;
//!     assert!(info.peers.is_empty());
//! }
//! ```

pub mod fixtures;
pub mod harness;
pub mod mock_engine;

pub use fixtures::*;
pub use harness::*;
pub use mock_engine::*;
