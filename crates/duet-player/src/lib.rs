//! Players for the Duet protocol
//!
//! This crate provides:
//! - `Player`: numbers outgoing messages and answers every message it receives
//! - `CountingPlayer`: a player that tracks sent/received counts and stops
//!   answering once the initiator has exchanged enough messages

pub mod counting;
pub mod player;

pub use counting::{
    CountingPlayer, DEFAULT_MAX_MESSAGES, DEFAULT_POLL_INTERVAL, SessionSummary, stop_condition,
};
pub use player::{Player, PlayerState};
