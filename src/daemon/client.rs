use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::trace;

use super::protocol::{MessageFrame, Request, Response};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// One-shot requests against a running [`ControlServer`](super::ControlServer).
pub struct ControlClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn is_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Returns daemon uptime and version.
    pub async fn ping(&self) -> Result<(Duration, String)> {
        match self.request(&Request::Ping).await? {
            Response::Pong {
                uptime_secs,
                version,
            } => Ok((Duration::from_secs(uptime_secs), version)),
            other => anyhow::bail!("Unexpected response to ping: {:?}", other),
        }
    }

    pub async fn request(&self, request: &Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.exchange(request))
            .await
            .with_context(|| format!("No response from daemon within {:?}", self.timeout))?
    }

    async fn exchange(&self, request: &Request) -> Result<Response> {
        #[cfg(unix)]
        let mut stream = tokio::net::UnixStream::connect(&self.socket_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to warden at {} (is `warden run` active?)",
                    self.socket_path.display()
                )
            })?;

        #[cfg(not(unix))]
        let mut stream = {
            let port = crate::clienv::tcp_port();
            tokio::net::TcpStream::connect(("127.0.0.1", port))
                .await
                .with_context(|| format!("Failed to connect to warden on port {}", port))?
        };

        trace!(request = ?request, "Sending control request");
        let bytes = MessageFrame::encode_request(request)
            .map_err(|e| anyhow::anyhow!("Failed to encode request: {}", e))?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;

        let body = MessageFrame::read_body(&mut stream).await?;
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(&body)
            .map_err(|e| anyhow::anyhow!("Failed to decode response: {}", e))
    }
}
