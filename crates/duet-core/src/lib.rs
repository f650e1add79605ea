//! # duet-core
//!
//! Core types shared by every Duet crate.
//!
//! This crate provides:
//! - The `Message` value exchanged between two players
//! - The error taxonomy used by transports and players

pub mod error;
pub mod message;

pub use error::{DuetError, Result};
pub use message::Message;
