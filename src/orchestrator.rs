//! The caller-facing API: one registry, one bus, and the three built-in services.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::WardenConfig;
use crate::error::{RconError, RegistryError, Result, WardenError};
use crate::events::{EventBus, EventFilter, LogSubscriber, Subscription};
use crate::rcon::{ConnectionState, RconClient};
use crate::registry::ServiceRegistry;
use crate::service::{Service, ServiceDescriptor, ServiceState};
use crate::supervisor::{ProcessHandle, ProcessSupervisor};
use crate::tailer::{LogEntry, LogTailer};

pub const PROCESS_SERVICE: &str = "process";
pub const LOGS_SERVICE: &str = "logs";
pub const RCON_SERVICE: &str = "rcon";

/// Extra time the registry grants a stop beyond the process' own
/// terminate-then-kill window.
const STOP_GRACE: Duration = Duration::from_secs(5);

pub struct Orchestrator {
    bus: EventBus,
    registry: ServiceRegistry,
    shutdown: CancellationToken,
    supervisor: Option<Arc<ProcessSupervisor>>,
    rcon: Option<Arc<RconClient>>,
    tailer: Option<Arc<LogTailer>>,
    log_worker: StdMutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// An orchestrator with no services registered.
    pub fn new(bus: EventBus) -> Self {
        Self {
            registry: ServiceRegistry::new(bus.clone()),
            bus,
            shutdown: CancellationToken::new(),
            supervisor: None,
            rcon: None,
            tailer: None,
            log_worker: StdMutex::new(None),
        }
    }

    /// Builds the bus and registers `process`, then `logs` and `rcon` on top of it.
    pub fn from_config(config: &WardenConfig) -> Result<Self> {
        let bus = EventBus::with_capacity(config.orchestrator.event_queue_capacity);
        let shutdown = CancellationToken::new();
        let registry = ServiceRegistry::new(bus.clone())
            .with_timeouts(config.start_timeout(), config.stop_timeout() + STOP_GRACE);

        let supervisor = Arc::new(
            ProcessSupervisor::new(config.launch_spec(), config.supervisor_settings(), bus.clone())
                .with_shutdown(shutdown.child_token()),
        );
        registry.register(
            ServiceDescriptor::new(PROCESS_SERVICE).stateful(true),
            supervisor.clone(),
        )?;

        let tailer = Arc::new(
            LogTailer::new(config.tail_sources(), config.tailer_settings(), bus.clone())
                .with_shutdown(shutdown.child_token()),
        );
        registry.register(
            ServiceDescriptor::new(LOGS_SERVICE)
                .stateful(true)
                .depends_on([PROCESS_SERVICE]),
            tailer.clone(),
        )?;

        let rcon = if config.rcon.enabled {
            let client = Arc::new(
                RconClient::new(config.rcon_settings(), bus.clone())
                    .with_shutdown(shutdown.child_token()),
            );
            registry.register(
                ServiceDescriptor::new(RCON_SERVICE)
                    .stateful(true)
                    .depends_on([PROCESS_SERVICE]),
                client.clone(),
            )?;
            Some(client)
        } else {
            debug!("RCON disabled in config");
            None
        };

        info!(
            executable = %config.server.executable.display(),
            rcon = config.rcon.enabled,
            log_sources = config.logs.sources.len(),
            "Orchestrator configured"
        );

        Ok(Self {
            bus,
            registry,
            shutdown,
            supervisor: Some(supervisor),
            rcon,
            tailer: Some(tailer),
            log_worker: StdMutex::new(None),
        })
    }

    /// Mirrors every bus event into the tracing log.
    pub fn with_event_log(mut self) -> Self {
        let worker = self.log_worker.get_mut().unwrap_or_else(|p| p.into_inner());
        if worker.is_none() {
            *worker = Some(self.bus.spawn_subscriber(Arc::new(LogSubscriber)));
        }
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn register_service(
        &self,
        descriptor: ServiceDescriptor,
        service: Arc<dyn Service>,
    ) -> Result<()> {
        Ok(self.registry.register(descriptor, service)?)
    }

    pub async fn start_all(&self) -> Result<()> {
        Ok(self.registry.start_all().await?)
    }

    pub async fn stop_all(&self) -> Result<()> {
        Ok(self.registry.stop_all().await?)
    }

    /// Restarts `name`; a stateful service takes its dependents with it.
    pub async fn restart_service(&self, name: &str) -> Result<()> {
        Ok(self.registry.restart(name).await?)
    }

    pub fn get_service_state(&self, name: &str) -> Result<ServiceState> {
        Ok(self.registry.get_service_state(name)?)
    }

    /// Descriptors in registration order with their current state.
    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.registry.services()
    }

    pub async fn send_rcon_command(&self, command: &str) -> Result<String> {
        let rcon = self.rcon.as_ref().ok_or(RconError::NotConnected)?;
        Ok(rcon.send_command(command).await?)
    }

    /// Clears a `Failed` process supervisor. The process is not relaunched.
    pub fn reset_process(&self) -> Result<()> {
        let supervisor = self.supervisor()?;
        Ok(supervisor.reset()?)
    }

    pub fn process_handle(&self) -> Option<ProcessHandle> {
        self.supervisor.as_ref().map(|s| s.handle())
    }

    pub fn restart_count(&self) -> u32 {
        self.supervisor.as_ref().map_or(0, |s| s.restart_count())
    }

    pub fn rcon_state(&self) -> Option<ConnectionState> {
        self.rcon.as_ref().map(|r| r.connection_state())
    }

    /// History of `source` strictly newer than `since`.
    pub fn fetch_logs(&self, source: &str, since: Option<DateTime<Utc>>) -> Result<Vec<LogEntry>> {
        self.tailer
            .as_ref()
            .and_then(|t| t.fetch(source, since))
            .ok_or_else(|| WardenError::UnknownLogSource(source.to_string()))
    }

    /// The last `lines` history entries of `source`.
    pub fn tail_logs(&self, source: &str, lines: usize) -> Result<Vec<LogEntry>> {
        self.tailer
            .as_ref()
            .and_then(|t| t.tail(source, lines))
            .ok_or_else(|| WardenError::UnknownLogSource(source.to_string()))
    }

    pub fn log_sources(&self) -> Vec<String> {
        self.tailer
            .as_ref()
            .map(|t| t.sources().map(String::from).collect())
            .unwrap_or_default()
    }

    pub fn subscribe(&self, filter: impl Into<EventFilter>) -> Subscription {
        self.bus.subscribe(filter)
    }

    /// Stops every service, then raises the shutdown signal and closes the bus.
    pub async fn shutdown(&self) -> Result<()> {
        let stopped = self.registry.stop_all().await;
        self.shutdown.cancel();
        self.bus.close();
        let worker = self
            .log_worker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        info!("Orchestrator shut down");
        Ok(stopped?)
    }

    fn supervisor(&self) -> Result<&ProcessSupervisor> {
        self.supervisor
            .as_deref()
            .ok_or_else(|| RegistryError::UnknownService(PROCESS_SERVICE.to_string()).into())
    }
}
