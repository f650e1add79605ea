//! Wire protocol for messages crossing a process boundary
//!
//! A connection starts with a 6-byte stream header (`b"DUET"` followed by a
//! little-endian `u16` version) written by each side. After that the stream
//! is a sequence of frames:
//!
//! ```text
//! [u32 content length][content length bytes of UTF-8][i32 counter]
//! ```
//!
//! All integers are little-endian. A truncated or malformed frame is terminal
//! for the connection.

use duet_core::{DuetError, Message, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Stream header magic
pub const MAGIC: [u8; 4] = *b"DUET";

/// Wire protocol version written in the stream header
pub const PROTOCOL_VERSION: u16 = 1;

/// Stream header length in bytes
pub const HEADER_LEN: usize = 6;

/// Largest accepted content field (16MB)
pub const MAX_CONTENT_LEN: usize = 16 * 1024 * 1024;

/// Stream header bytes for the current protocol version
pub fn header() -> [u8; HEADER_LEN] {
    let version = PROTOCOL_VERSION.to_le_bytes();
    [MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], version[0], version[1]]
}

/// Validate a peer's stream header
pub fn check_header(bytes: &[u8; HEADER_LEN]) -> Result<()> {
    if bytes[..4] != MAGIC {
        return Err(DuetError::ProtocolError(format!(
            "Bad stream magic: {:02x?}",
            &bytes[..4]
        )));
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != PROTOCOL_VERSION {
        return Err(DuetError::ProtocolError(format!(
            "Unsupported protocol version {} (expected {})",
            version, PROTOCOL_VERSION
        )));
    }
    Ok(())
}

/// Serialize a message into one frame
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let body = message.content().as_bytes();
    if body.len() > MAX_CONTENT_LEN {
        return Err(DuetError::SendError(format!(
            "Message too large: {} bytes",
            body.len()
        )));
    }

    let mut buf = Vec::with_capacity(4 + body.len() + 4);
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    buf.extend_from_slice(&message.counter().to_le_bytes());
    Ok(buf)
}

/// Parse exactly one frame
///
/// Trailing bytes after the counter are rejected.
pub fn decode(data: &[u8]) -> Result<Message> {
    if data.len() < 8 {
        return Err(DuetError::ReceiveError(format!(
            "Frame too short: {} bytes",
            data.len()
        )));
    }

    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len > MAX_CONTENT_LEN {
        return Err(DuetError::ReceiveError(format!(
            "Message too large: {} bytes",
            len
        )));
    }
    if data.len() != 4 + len + 4 {
        return Err(DuetError::ReceiveError(format!(
            "Frame length mismatch: content says {} bytes, frame has {}",
            len,
            data.len()
        )));
    }

    let content = std::str::from_utf8(&data[4..4 + len])
        .map_err(|e| DuetError::ReceiveError(format!("Content is not UTF-8: {}", e)))?;
    let tail = &data[4 + len..];
    let counter = i32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);

    Ok(Message::new(content, counter))
}

/// Write and flush the stream header
pub async fn write_header<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<()> {
    writer
        .write_all(&header())
        .await
        .map_err(|e| DuetError::SendError(format!("Header write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| DuetError::SendError(format!("Header flush failed: {}", e)))
}

/// Read and validate the peer's stream header
pub async fn read_header<R: AsyncRead + Unpin>(reader: &mut R) -> Result<()> {
    let mut bytes = [0u8; HEADER_LEN];
    reader
        .read_exact(&mut bytes)
        .await
        .map_err(|e| DuetError::ReceiveError(format!("Header read failed: {}", e)))?;
    check_header(&bytes)
}

/// Read one frame from the stream
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| DuetError::ReceiveError(format!("Read length failed: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    // Reject before allocating
    if len > MAX_CONTENT_LEN {
        return Err(DuetError::ReceiveError(format!(
            "Message too large: {} bytes",
            len
        )));
    }

    let mut frame = vec![0u8; 4 + len + 4];
    frame[..4].copy_from_slice(&len_bytes);
    reader
        .read_exact(&mut frame[4..])
        .await
        .map_err(|e| DuetError::ReceiveError(format!("Read frame failed: {}", e)))?;

    decode(&frame)
}

/// Write one frame and flush it
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    let frame = encode(message)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| DuetError::SendError(format!("Write failed: {}", e)))?;
    writer
        .flush()
        .await
        .map_err(|e| DuetError::SendError(format!("Flush failed: {}", e)))
}
