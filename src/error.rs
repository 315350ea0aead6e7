use std::time::Duration;
use thiserror::Error;

/// Errors raised by [`ServiceRegistry`](crate::registry::ServiceRegistry).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("service '{0}' is already registered")]
    DuplicateService(String),

    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("service '{service}' could not be started: {reason}")]
    DependencyUnmet { service: String, reason: String },

    #[error("unknown service '{0}'")]
    UnknownService(String),
}

impl RegistryError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::DuplicateService(_) => "duplicate_service",
            Self::CyclicDependency { .. } => "cyclic_dependency",
            Self::DependencyUnmet { .. } => "dependency_unmet",
            Self::UnknownService(_) => "unknown_service",
        }
    }
}

/// Errors raised by [`ProcessSupervisor`](crate::supervisor::ProcessSupervisor).
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to launch '{executable}': {source}")]
    Launch {
        executable: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server process is already running (pid {0:?})")]
    AlreadyRunning(Option<u32>),

    #[error("server process is not running")]
    NotRunning,

    #[error("restart budget exhausted, operator reset required")]
    Failed,

    #[error("operation cancelled by shutdown")]
    Cancelled,
}

impl SupervisorError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Launch { .. } => "process_launch",
            Self::AlreadyRunning(_) => "process_already_running",
            Self::NotRunning => "process_not_running",
            Self::Failed => "process_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Errors raised by [`RconClient`](crate::rcon::RconClient).
///
/// Cloneable so a single disconnect can fail every pending request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RconError {
    #[error("rcon connection error: {0}")]
    Connection(String),

    #[error("rcon authentication rejected")]
    Auth,

    #[error("rcon protocol error: {0}")]
    Protocol(String),

    #[error("rcon request timed out after {0:?}")]
    Timeout(Duration),

    #[error("rcon operation cancelled")]
    Cancelled,

    #[error("rcon session is not connected")]
    NotConnected,
}

impl RconError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Connection(_) => "rcon_connection",
            Self::Auth => "rcon_auth",
            Self::Protocol(_) => "rcon_protocol",
            Self::Timeout(_) => "rcon_timeout",
            Self::Cancelled => "cancelled",
            Self::NotConnected => "rcon_not_connected",
        }
    }

    /// Transient errors are retried by the reconnect loop; `Auth` is not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::Protocol(_) | Self::NotConnected
        )
    }
}

impl From<std::io::Error> for RconError {
    fn from(e: std::io::Error) -> Self {
        RconError::Connection(e.to_string())
    }
}

/// Error crossing the [`Service`](crate::service::Service) seam.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Rcon(#[from] RconError),

    #[error("{0}")]
    Other(String),
}

/// Umbrella error of the orchestrator API.
#[derive(Error, Debug)]
pub enum WardenError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Rcon(#[from] RconError),

    #[error("unknown log source '{0}'")]
    UnknownLogSource(String),
}

impl WardenError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Registry(e) => e.as_label(),
            Self::Supervisor(e) => e.as_label(),
            Self::Rcon(e) => e.as_label(),
            Self::UnknownLogSource(_) => "unknown_log_source",
        }
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
