//! Vocalis API Library Crate
//!
//! This library contains the core logic for the Vocalis voice-assistant
//! service: configuration, shared engine state, the WebSocket session
//! protocol, and routing. The `bin/api.rs` binary is a thin wrapper around
//! this library.

pub mod config;
pub mod prompts;
pub mod router;
pub mod state;
pub mod ws;
