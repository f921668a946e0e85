//! Common types shared across the room coordinator crates.

#![warn(clippy::pedantic)]

/// Identifier newtypes
pub mod types;

/// Module for secret types that prevent accidental logging
pub mod secret;
