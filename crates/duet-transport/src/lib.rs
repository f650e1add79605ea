//! Transports for the Duet player protocol
//!
//! This crate provides:
//! - `MessageHandler`/`Transport` traits shared by every delivery mechanism
//! - Binary wire protocol for messages crossing a process boundary
//! - Queue-backed in-process transport
//! - TCP transport with listener and connector roles

pub mod in_process;
pub mod protocol;
pub mod tcp;
pub mod transport;

pub use in_process::InProcessTransport;
pub use tcp::{TcpConfig, TcpRole, TcpTransport};
pub use transport::{DEFAULT_JOIN_TIMEOUT, HandlerSlot, MessageHandler, Transport};
