//! RCON wire framing.
//!
//! ```text
//! [u32 LE length of the rest][u8 type][u32 LE sequence id][UTF-8 payload]
//!                                      └─ omitted for Async frames
//! ```
//!
//! A frame whose length prefix exceeds [`MAX_FRAME_LEN`] is unrecoverable
//! (framing is lost). A frame with a sane length but a malformed body is a
//! protocol error: it is consumed whole and the stream stays aligned.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::error::RconError;

pub const MAX_FRAME_LEN: usize = 1024 * 1024;

const AUTH_ACCEPTED: &str = "\u{1}";
const AUTH_REJECTED: &str = "\u{0}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Auth = 0x00,
    AuthResponse = 0x01,
    Command = 0x02,
    CommandResponse = 0x03,
    Async = 0x04,
    Heartbeat = 0x05,
}

impl FrameType {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            0x00 => FrameType::Auth,
            0x01 => FrameType::AuthResponse,
            0x02 => FrameType::Command,
            0x03 => FrameType::CommandResponse,
            0x04 => FrameType::Async,
            0x05 => FrameType::Heartbeat,
            _ => return None,
        })
    }

    /// The frame type a server answers this request type with.
    pub fn response(&self) -> Option<FrameType> {
        match self {
            FrameType::Auth => Some(FrameType::AuthResponse),
            FrameType::Command => Some(FrameType::CommandResponse),
            FrameType::Heartbeat => Some(FrameType::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameType,
    /// `None` exactly for [`FrameType::Async`].
    pub seq: Option<u32>,
    pub payload: String,
}

impl Frame {
    pub fn request(kind: FrameType, seq: u32, payload: impl Into<String>) -> Self {
        Self {
            kind,
            seq: Some(seq),
            payload: payload.into(),
        }
    }

    pub fn async_message(payload: impl Into<String>) -> Self {
        Self {
            kind: FrameType::Async,
            seq: None,
            payload: payload.into(),
        }
    }

    pub fn auth_response(seq: u32, accepted: bool) -> Self {
        let payload = if accepted { AUTH_ACCEPTED } else { AUTH_REJECTED };
        Self::request(FrameType::AuthResponse, seq, payload)
    }

    pub fn auth_accepted(&self) -> bool {
        self.kind == FrameType::AuthResponse && self.payload == AUTH_ACCEPTED
    }

    /// Bytes after the length prefix.
    pub fn body_len(&self) -> usize {
        1 + if self.seq.is_some() { 4 } else { 0 } + self.payload.len()
    }

    /// Length-prefixed bytes ready for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.body_len();
        let mut out = Vec::with_capacity(4 + body_len);
        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.push(self.kind as u8);
        if let Some(seq) = self.seq {
            out.extend_from_slice(&seq.to_le_bytes());
        }
        out.extend_from_slice(self.payload.as_bytes());
        out
    }

    /// Decodes a frame body (everything after the length prefix).
    pub fn decode(body: &[u8]) -> Result<Self, RconError> {
        let (&type_byte, rest) = body
            .split_first()
            .ok_or_else(|| RconError::Protocol("empty frame".into()))?;
        let kind = FrameType::from_byte(type_byte)
            .ok_or_else(|| RconError::Protocol(format!("unknown frame type 0x{:02x}", type_byte)))?;

        let (seq, payload) = if kind == FrameType::Async {
            (None, rest)
        } else {
            if rest.len() < 4 {
                return Err(RconError::Protocol(format!(
                    "{:?} frame too short for a sequence id",
                    kind
                )));
            }
            let (id, payload) = rest.split_at(4);
            (Some(u32::from_le_bytes([id[0], id[1], id[2], id[3]])), payload)
        };

        let payload = std::str::from_utf8(payload)
            .map_err(|e| RconError::Protocol(format!("payload is not UTF-8: {}", e)))?
            .to_string();
        Ok(Self { kind, seq, payload })
    }
}

/// Reads one frame. `Protocol` errors leave the stream aligned; anything else
/// means the transport is unusable.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, RconError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RconError::Connection(format!(
            "frame length {} exceeds limit {}",
            len, MAX_FRAME_LEN
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    trace!(len, "Read RCON frame");
    Frame::decode(&body)
}

/// Refuses frames the peer's [`read_frame`] would reject, before writing anything.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), RconError> {
    check_len(frame)?;
    writer.write_all(&frame.encode()).await?;
    writer.flush().await?;
    Ok(())
}

pub(crate) fn check_len(frame: &Frame) -> Result<(), RconError> {
    let len = frame.body_len();
    if len > MAX_FRAME_LEN {
        return Err(RconError::Protocol(format!(
            "frame length {} exceeds limit {}",
            len, MAX_FRAME_LEN
        )));
    }
    Ok(())
}
