use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::protocol::{ArchivedRequest, MessageFrame, Response, ServiceInfo, WireLogLine};
use crate::orchestrator::{Orchestrator, PROCESS_SERVICE};

/// Serves the orchestrator API on a local socket until shut down.
pub struct ControlServer {
    orchestrator: Arc<Orchestrator>,
    socket_path: PathBuf,
    started_at: Instant,
    version: String,
    shutdown: CancellationToken,
}

impl ControlServer {
    pub fn new(orchestrator: Arc<Orchestrator>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            orchestrator,
            socket_path: socket_path.into(),
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling `token` stops the accept loop. A `Shutdown` request cancels it too.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accepts connections until the shutdown token fires. Does not stop services.
    pub async fn run(self) -> Result<()> {
        #[cfg(unix)]
        let listener = {
            if self.socket_path.exists() {
                std::fs::remove_file(&self.socket_path).with_context(|| {
                    format!("Failed to remove stale socket {}", self.socket_path.display())
                })?;
            }
            if let Some(parent) = self.socket_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let listener = tokio::net::UnixListener::bind(&self.socket_path)
                .with_context(|| format!("Failed to bind {}", self.socket_path.display()))?;

            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            std::fs::set_permissions(&self.socket_path, perms)?;

            info!(socket = %self.socket_path.display(), "Control socket listening");
            listener
        };

        #[cfg(not(unix))]
        let listener = {
            let port = crate::clienv::tcp_port();
            let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
                .await
                .with_context(|| format!("Failed to bind 127.0.0.1:{}", port))?;
            info!(port, "Control socket listening");
            listener
        };

        let server = Arc::new(self);
        loop {
            tokio::select! {
                conn = listener.accept() => {
                    match conn {
                        Ok((stream, _)) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!("Connection handler error: {:#}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = server.shutdown.cancelled() => {
                    debug!("Control server shutting down");
                    break;
                }
            }
        }

        #[cfg(unix)]
        {
            if server.socket_path.exists() {
                std::fs::remove_file(&server.socket_path)?;
            }
        }
        info!("Control socket closed");
        Ok(())
    }

    async fn handle_connection<S>(&self, mut stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        trace!("New connection accepted");

        let body = MessageFrame::read_body(&mut stream).await?;
        let archived = rkyv::access::<ArchivedRequest, rkyv::rancor::Error>(&body)
            .map_err(|e| anyhow::anyhow!("Failed to deserialize request: {}", e))?;

        let response = self.handle_request(archived).await;

        let response_bytes = MessageFrame::encode_response(&response)
            .map_err(|e| anyhow::anyhow!("Failed to encode response: {}", e))?;
        stream.write_all(&response_bytes).await?;
        stream.flush().await?;

        trace!("Response sent");
        Ok(())
    }

    async fn handle_request(&self, request: &ArchivedRequest) -> Response {
        let orch = &self.orchestrator;
        match request {
            ArchivedRequest::Ping => {
                debug!("Handling: Ping");
                Response::Pong {
                    uptime_secs: self.started_at.elapsed().as_secs(),
                    version: self.version.clone(),
                }
            }

            ArchivedRequest::Shutdown => {
                info!("Shutdown requested over control socket");
                self.shutdown.cancel();
                Response::Ok
            }

            ArchivedRequest::StartAll => {
                debug!("Handling: StartAll");
                match orch.start_all().await {
                    Ok(()) => Response::Ok,
                    Err(e) => Response::error(&e),
                }
            }

            ArchivedRequest::StopAll => {
                debug!("Handling: StopAll");
                match orch.stop_all().await {
                    Ok(()) => Response::Ok,
                    Err(e) => Response::error(&e),
                }
            }

            ArchivedRequest::ServiceState { name } => {
                debug!("Handling: ServiceState({})", name);
                match orch.get_service_state(name.as_str()) {
                    Ok(state) => Response::State {
                        name: name.to_string(),
                        state: state.into(),
                    },
                    Err(e) => Response::error(&e),
                }
            }

            ArchivedRequest::ListServices => {
                debug!("Handling: ListServices");
                let handle = orch.process_handle();
                let list = orch
                    .services()
                    .into_iter()
                    .map(|d| {
                        let is_process = d.name == PROCESS_SERVICE;
                        ServiceInfo {
                            pid: handle.as_ref().filter(|_| is_process).and_then(|h| h.pid),
                            restarts: if is_process { orch.restart_count() } else { 0 },
                            state: d.state.into(),
                            stateful: d.stateful,
                            depends_on: d.depends_on,
                            name: d.name,
                        }
                    })
                    .collect();
                Response::Services { list }
            }

            ArchivedRequest::Rcon { command } => {
                debug!("Handling: Rcon({})", command);
                match orch.send_rcon_command(command.as_str()).await {
                    Ok(response) => Response::RconReply { response },
                    Err(e) => Response::error(&e),
                }
            }

            ArchivedRequest::ResetProcess => {
                info!("Handling: ResetProcess");
                match orch.reset_process() {
                    Ok(()) => Response::Ok,
                    Err(e) => Response::error(&e),
                }
            }

            ArchivedRequest::Logs { source, lines } => {
                let n = lines.to_native() as usize;
                debug!("Handling: Logs({}, lines: {})", source, n);
                match orch.tail_logs(source.as_str(), n) {
                    Ok(entries) => Response::Logs {
                        source: source.to_string(),
                        lines: entries.into_iter().map(WireLogLine::from).collect(),
                    },
                    Err(e) => Response::error(&e),
                }
            }
        }
    }
}
