//! Async frame codec over any [`AsyncRead`]/[`AsyncWrite`] stream.
//!
//! Each frame is a 9-byte header followed by `payload_len` payload bytes:
//!
//! ```text
//! offset 0 : u8   msg_type
//! offset 1 : u32  correlation_id   (big-endian; 0 for unsolicited)
//! offset 5 : u32  payload_len      (big-endian)
//! offset 9 : payload
//! ```
//!
//! Probing readers (the cancel peek) inspect only the header and leave the
//! stream untouched; dispatching readers consume the full frame.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Message;

/// Fixed header size preceding every payload.
pub const HEADER_LEN: usize = 9;

/// Maximum allowed frame payload (16 MiB).
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// One-byte message tag.
    pub msg_type: u8,
    /// Request/response correlation id; 0 for unsolicited frames.
    pub correlation_id: u32,
    /// Number of payload bytes that follow the header.
    pub payload_len: u32,
}

impl Header {
    /// Parses the fixed 9-byte header.
    pub const fn parse(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            msg_type: bytes[0],
            correlation_id: u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]),
            payload_len: u32::from_be_bytes([bytes[5], bytes[6], bytes[7], bytes[8]]),
        }
    }

    /// Serializes the header.
    pub const fn to_bytes(self) -> [u8; HEADER_LEN] {
        let cid = self.correlation_id.to_be_bytes();
        let len = self.payload_len.to_be_bytes();
        [
            self.msg_type,
            cid[0],
            cid[1],
            cid[2],
            cid[3],
            len[0],
            len[1],
            len[2],
            len[3],
        ]
    }
}

/// Serializes a complete frame (header + payload) into one buffer.
///
/// This is the byte sequence [`send`] writes; nodes use it to forward guest
/// frames upstream verbatim inside `TASK_EVENT`.
#[allow(clippy::cast_possible_truncation)]
pub fn encode_frame(correlation_id: u32, msg: &Message) -> Vec<u8> {
    let payload = msg.encode_payload();
    let header = Header {
        msg_type: msg.tag(),
        correlation_id,
        payload_len: payload.len() as u32,
    };
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Decodes a complete frame from a buffer (the inverse of [`encode_frame`]).
pub fn decode_frame(frame: &[u8]) -> io::Result<(u32, Message)> {
    if frame.len() < HEADER_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame shorter than header",
        ));
    }
    let mut hdr = [0u8; HEADER_LEN];
    hdr.copy_from_slice(&frame[..HEADER_LEN]);
    let header = Header::parse(&hdr);
    let payload = &frame[HEADER_LEN..];
    if payload.len() != header.payload_len as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame length does not match header",
        ));
    }
    let msg = Message::decode_payload(header.msg_type, payload)?;
    Ok((header.correlation_id, msg))
}

/// Sends one framed message.
///
/// The frame is pre-assembled to minimize syscalls, then flushed.
pub async fn send(
    w: &mut (impl AsyncWrite + Unpin),
    correlation_id: u32,
    msg: &Message,
) -> io::Result<()> {
    let frame = encode_frame(correlation_id, msg);
    w.write_all(&frame).await?;
    w.flush().await
}

/// Receives one framed message, returning its correlation id.
pub async fn recv(r: &mut (impl AsyncRead + Unpin)) -> io::Result<(u32, Message)> {
    let mut hdr = [0u8; HEADER_LEN];
    r.read_exact(&mut hdr).await?;
    let header = Header::parse(&hdr);
    if header.payload_len > MAX_PAYLOAD {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    let mut payload = vec![0u8; header.payload_len as usize];
    r.read_exact(&mut payload).await?;
    let msg = Message::decode_payload(header.msg_type, &payload)?;
    Ok((header.correlation_id, msg))
}
