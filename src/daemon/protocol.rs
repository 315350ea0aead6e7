//! Control socket messages, serialized with rkyv.
//!
//! Wire format: `[4-byte length (little-endian)][rkyv bytes]`, one request and
//! one response per connection.

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::WardenError;
use crate::service::ServiceState;
use crate::tailer::LogEntry;

/// Largest accepted message body.
pub const MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Liveness check
    Ping,
    /// Stop all services and exit the daemon
    Shutdown,
    StartAll,
    StopAll,
    ServiceState { name: String },
    ListServices,
    /// Send a console command to the game server
    Rcon { command: String },
    /// Clear a failed process supervisor
    ResetProcess,
    /// Last `lines` entries of a log source
    Logs { source: String, lines: u32 },
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub enum Response {
    Pong { uptime_secs: u64, version: String },
    Ok,
    /// `kind` is the stable error label
    Error { kind: String, message: String },
    State { name: String, state: WireState },
    Services { list: Vec<ServiceInfo> },
    RconReply { response: String },
    Logs { source: String, lines: Vec<WireLogLine> },
}

impl Response {
    pub fn error(err: &WardenError) -> Self {
        Response::Error {
            kind: err.as_label().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct ServiceInfo {
    pub name: String,
    pub state: WireState,
    pub stateful: bool,
    pub depends_on: Vec<String>,
    /// Only set for the process service while it is alive
    pub pid: Option<u32>,
    pub restarts: u32,
}

#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq)]
#[rkyv(derive(Debug))]
pub struct WireLogLine {
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: i64,
    pub line: String,
}

impl From<LogEntry> for WireLogLine {
    fn from(entry: LogEntry) -> Self {
        Self {
            timestamp_ms: entry.timestamp.timestamp_millis(),
            line: entry.line,
        }
    }
}

/// [`ServiceState`] on the wire.
#[derive(Archive, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum WireState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl WireState {
    pub fn as_str(&self) -> &'static str {
        ServiceState::from(*self).as_str()
    }
}

impl From<ServiceState> for WireState {
    fn from(state: ServiceState) -> Self {
        match state {
            ServiceState::Stopped => WireState::Stopped,
            ServiceState::Starting => WireState::Starting,
            ServiceState::Running => WireState::Running,
            ServiceState::Stopping => WireState::Stopping,
            ServiceState::Failed => WireState::Failed,
        }
    }
}

impl From<WireState> for ServiceState {
    fn from(state: WireState) -> Self {
        match state {
            WireState::Stopped => ServiceState::Stopped,
            WireState::Starting => ServiceState::Starting,
            WireState::Running => ServiceState::Running,
            WireState::Stopping => ServiceState::Stopping,
            WireState::Failed => ServiceState::Failed,
        }
    }
}

/// Message frame for wire protocol
pub struct MessageFrame;

impl MessageFrame {
    pub fn encode_request(request: &Request) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::prefix(&bytes))
    }

    pub fn encode_response(response: &Response) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::prefix(&bytes))
    }

    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    /// Reads one length-prefixed body into an aligned buffer ready for `rkyv::access`.
    pub async fn read_body<R>(reader: &mut R) -> std::io::Result<AlignedVec>
    where
        R: AsyncRead + Unpin,
    {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await?;
        let len = Self::read_length(&len_buf);
        if len > MAX_MESSAGE_LEN {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("message of {} bytes exceeds limit", len),
            ));
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;

        let mut aligned = AlignedVec::with_capacity(len);
        aligned.extend_from_slice(&body);
        Ok(aligned)
    }

    fn prefix(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }
}
