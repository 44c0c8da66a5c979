//! Shared types for the Radio Paradise now-playing daemon and its clients.

pub mod channels;
pub mod config;
pub mod platform;
pub mod protocol;
pub mod state;
