use async_trait::async_trait;
use serde::Serialize;

use crate::error::ServiceError;

/// Lifecycle state of a registered service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Terminal until an operator intervenes.
    Failed,
}

impl ServiceState {
    pub fn is_running(&self) -> bool {
        matches!(self, ServiceState::Running)
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability set every orchestrated service implements.
#[async_trait]
pub trait Service: Send + Sync {
    fn name(&self) -> &str;

    /// Resolves once the service is confirmed running.
    async fn start(&self) -> Result<(), ServiceError>;

    /// Graceful stop; the registry bounds it with a timeout.
    async fn stop(&self) -> Result<(), ServiceError>;

    /// Forced teardown after the stop timeout elapsed. Must not block.
    fn kill(&self);

    /// The service's own view of its state (may report `Failed` at runtime).
    fn state(&self) -> ServiceState;
}

/// Registration record for a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    /// Stateful services hold session/process state and are torn down in reverse start order.
    pub stateful: bool,
    pub depends_on: Vec<String>,
    pub state: ServiceState,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stateful: true,
            depends_on: Vec::new(),
            state: ServiceState::Stopped,
        }
    }

    pub fn stateful(mut self, stateful: bool) -> Self {
        self.stateful = stateful;
        self
    }

    /// Duplicate names are collapsed; declaration order is kept.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.depends_on.contains(&dep) {
                self.depends_on.push(dep);
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_state() {
        assert!(ServiceState::Running.is_running());
        assert!(!ServiceState::Stopped.is_running());
        assert!(ServiceState::Stopped.is_stopped());
        assert!(ServiceState::Failed.is_stopped());
        assert!(!ServiceState::Stopping.is_stopped());
    }

    #[test]
    fn test_descriptor_builder() {
        let desc = ServiceDescriptor::new("rcon")
            .stateful(true)
            .depends_on(["process", "process", "logs"]);

        assert_eq!(desc.name, "rcon");
        assert!(desc.stateful);
        assert_eq!(desc.depends_on, vec!["process", "logs"]);
        assert_eq!(desc.state, ServiceState::Stopped);
    }
}
