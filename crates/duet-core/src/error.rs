//! Error types for Duet

use thiserror::Error;

/// Result type for Duet operations
pub type Result<T> = std::result::Result<T, DuetError>;

/// Duet error types
///
/// Each variant names the phase that failed so a driver can report it
/// before the session ends.
#[derive(Debug, Error)]
pub enum DuetError {
    /// Listening socket could not be opened or accept failed
    #[error("Bind error: {0}")]
    BindError(String),

    /// Connector exhausted its retries
    #[error("Connect error: {0}")]
    ConnectError(String),

    /// Message could not be handed to the channel
    #[error("Send error: {0}")]
    SendError(String),

    /// Incoming stream failed or carried an undecodable frame
    #[error("Receive error: {0}")]
    ReceiveError(String),

    /// Peer spoke a different wire protocol
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Transport has no established connection
    #[error("Transport not connected")]
    NotConnected,
}

impl DuetError {
    /// Short name of the failing phase, used in driver output
    pub fn phase(&self) -> &'static str {
        match self {
            DuetError::BindError(_) => "bind",
            DuetError::ConnectError(_) => "connect",
            DuetError::SendError(_) | DuetError::NotConnected => "send",
            DuetError::ReceiveError(_) | DuetError::ProtocolError(_) => "receive",
        }
    }
}
