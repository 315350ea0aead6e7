//! Remote console client.
//!
//! [`RconClient`] owns at most one [`Session`] at a time. While started, a
//! keeper task watches the session and reconnects with backoff when it drops,
//! giving up (state `Failed`) once the reconnect budget is spent.

pub mod protocol;
mod session;

pub use protocol::{Frame, FrameType, MAX_FRAME_LEN};
pub use session::SessionSettings;

use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffPolicy, CrashBudget, RestartDecision, RestartTracker};
use crate::error::{RconError, ServiceError};
use crate::events::{Event, EventBus, EventPayload};
use crate::service::{Service, ServiceState};
use session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Authenticated,
    /// Reconnect budget exhausted or credentials rejected.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Authenticated => "authenticated",
            ConnectionState::Failed => "failed",
        }
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub password: String,
}

impl Credentials {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("password", &"***").finish()
    }
}

#[derive(Debug, Clone)]
pub struct RconSettings {
    /// `host:port`
    pub endpoint: String,
    pub credentials: Credentials,
    pub command_timeout: Duration,
    /// Command sent once after each successful authentication.
    pub greeting: Option<String>,
    pub session: SessionSettings,
    pub reconnect: BackoffPolicy,
    pub max_reconnects: u32,
    pub reconnect_window: Duration,
    /// A session that lived this long resets the reconnect backoff.
    pub healthy_uptime: Duration,
}

impl Default for RconSettings {
    fn default() -> Self {
        Self {
            endpoint: "127.0.0.1:2306".to_string(),
            credentials: Credentials::default(),
            command_timeout: Duration::from_secs(10),
            greeting: None,
            session: SessionSettings::default(),
            reconnect: BackoffPolicy::default(),
            max_reconnects: 10,
            reconnect_window: Duration::from_secs(600),
            healthy_uptime: Duration::from_secs(300),
        }
    }
}

impl RconSettings {
    fn tracker(&self) -> RestartTracker {
        RestartTracker::new(
            self.reconnect,
            CrashBudget::new(self.max_reconnects, self.reconnect_window),
            self.healthy_uptime,
        )
    }
}

struct Target {
    endpoint: String,
    credentials: Credentials,
}

struct Inner {
    name: String,
    settings: RconSettings,
    bus: EventBus,
    target: StdMutex<Target>,
    session: RwLock<Option<Arc<Session>>>,
    state: watch::Sender<ConnectionState>,
    /// Token of the running keeper; cancelled by `disconnect` and `kill`.
    current: StdMutex<Option<CancellationToken>>,
}

impl Inner {
    fn set_state(&self, to: ConnectionState, reason: Option<String>) {
        let from = self.state.send_replace(to);
        if from == to {
            return;
        }
        debug!(service = %self.name, from = from.as_str(), to = to.as_str(), "RCON state");
        if to == ConnectionState::Failed {
            self.bus.publish(Event::state_changed(
                &self.name,
                as_service_state(from),
                ServiceState::Failed,
                reason,
            ));
        }
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn install(&self, session: Option<Arc<Session>>) -> Option<Arc<Session>> {
        std::mem::replace(
            &mut *self.session.write().unwrap_or_else(|p| p.into_inner()),
            session,
        )
    }

    /// One connect + auth + greeting attempt against the current target.
    async fn establish(&self, shutdown: &CancellationToken) -> Result<Arc<Session>, RconError> {
        let (endpoint, password) = {
            let target = self.target.lock().unwrap_or_else(|p| p.into_inner());
            (target.endpoint.clone(), target.credentials.password.clone())
        };
        let session = match Session::open(
            &endpoint,
            &password,
            self.settings.session.clone(),
            self.bus.clone(),
            shutdown,
            &self.state,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        if let Some(greeting) = &self.settings.greeting {
            if let Err(e) = session
                .request(FrameType::Command, greeting, self.settings.command_timeout)
                .await
            {
                warn!(endpoint = %endpoint, error = %e, "RCON greeting failed");
            }
        }

        self.install(Some(Arc::clone(&session)));
        self.set_state(ConnectionState::Authenticated, None);
        self.bus.publish(Event::new(EventPayload::RconConnected {
            endpoint: endpoint.clone(),
        }));
        Ok(session)
    }

    /// Retries `establish` with backoff until success, a non-retryable error,
    /// an exhausted budget or cancellation.
    async fn establish_with_retry(
        &self,
        tracker: &mut RestartTracker,
        mut uptime: Duration,
        shutdown: &CancellationToken,
    ) -> Result<Arc<Session>, RconError> {
        loop {
            let last = match self.establish(shutdown).await {
                Ok(session) => return Ok(session),
                Err(e) if !e.is_retryable() => {
                    let reason = e.to_string();
                    if e != RconError::Cancelled {
                        error!(service = %self.name, error = %reason, "RCON connect failed permanently");
                        self.set_state(ConnectionState::Failed, Some(reason));
                    }
                    return Err(e);
                }
                Err(e) => e,
            };

            match tracker.on_failure(uptime, Instant::now()) {
                RestartDecision::GiveUp { failures } => {
                    error!(service = %self.name, failures, error = %last, "RCON reconnect budget exhausted");
                    self.set_state(
                        ConnectionState::Failed,
                        Some(format!("{} failed connection attempts: {}", failures, last)),
                    );
                    return Err(last);
                }
                RestartDecision::Restart { delay, attempt } => {
                    info!(service = %self.name, attempt, delay = ?delay, error = %last, "RCON connect failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.cancelled() => return Err(RconError::Cancelled),
                    }
                }
            }
            uptime = Duration::ZERO;
        }
    }
}

fn as_service_state(state: ConnectionState) -> ServiceState {
    match state {
        ConnectionState::Disconnected => ServiceState::Stopped,
        ConnectionState::Connecting | ConnectionState::Authenticating => ServiceState::Starting,
        ConnectionState::Authenticated => ServiceState::Running,
        ConnectionState::Failed => ServiceState::Failed,
    }
}

/// Authenticated, reconnecting RCON client.
pub struct RconClient {
    inner: Arc<Inner>,
    keeper: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl RconClient {
    pub fn new(settings: RconSettings, bus: EventBus) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let target = Target {
            endpoint: settings.endpoint.clone(),
            credentials: settings.credentials.clone(),
        };
        Self {
            inner: Arc::new(Inner {
                name: "rcon".to_string(),
                settings,
                bus,
                target: StdMutex::new(target),
                session: RwLock::new(None),
                state,
                current: StdMutex::new(None),
            }),
            keeper: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Single connection attempt. On success the session is kept alive and
    /// re-established on loss.
    pub async fn connect(
        &self,
        endpoint: impl Into<String>,
        credentials: Credentials,
    ) -> Result<(), RconError> {
        {
            let mut target = self.inner.target.lock().unwrap_or_else(|p| p.into_inner());
            target.endpoint = endpoint.into();
            target.credentials = credentials;
        }
        self.open(false).await
    }

    /// Disconnects and stops reconnecting. Idempotent.
    pub async fn disconnect(&self) {
        let mut keeper = self.keeper.lock().await;
        if let Some(token) = self
            .inner
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            token.cancel();
        }
        if let Some(task) = keeper.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "RCON keeper task ended abnormally");
            }
        }
        if let Some(session) = self.inner.install(None) {
            session.close("client disconnect");
        }
        if self.connection_state() != ConnectionState::Failed {
            self.inner.set_state(ConnectionState::Disconnected, None);
        }
    }

    /// Sends a command and waits for its correlated response.
    pub async fn send_command(&self, command: &str) -> Result<String, RconError> {
        let session = self.inner.session().ok_or(RconError::NotConnected)?;
        debug!(command, "Sending RCON command");
        session
            .request(FrameType::Command, command, self.inner.settings.command_timeout)
            .await
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// When the last heartbeat of the current session was answered.
    pub fn last_heartbeat_at(&self) -> Option<Instant> {
        self.inner.session().and_then(|s| s.last_heartbeat_at())
    }

    /// Requests currently waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.session().map_or(0, |s| s.pending_len())
    }

    async fn open(&self, retry: bool) -> Result<(), RconError> {
        if self.shutdown.is_cancelled() {
            return Err(RconError::Cancelled);
        }
        self.disconnect().await;
        let mut keeper = self.keeper.lock().await;

        let token = self.shutdown.child_token();
        let mut tracker = self.inner.settings.tracker();
        let session = if retry {
            self.inner
                .establish_with_retry(&mut tracker, Duration::ZERO, &token)
                .await?
        } else {
            self.inner.establish(&token).await?
        };

        *self.inner.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(token.clone());
        *keeper = Some(tokio::spawn(keep_alive(
            Arc::clone(&self.inner),
            session,
            tracker,
            token,
        )));
        Ok(())
    }
}

async fn keep_alive(
    inner: Arc<Inner>,
    mut session: Arc<Session>,
    mut tracker: RestartTracker,
    token: CancellationToken,
) {
    loop {
        let connected_at = Instant::now();
        tokio::select! {
            _ = session.closed() => {}
            _ = token.cancelled() => {
                session.close("client disconnect");
                inner.install(None);
                if *inner.state.borrow() != ConnectionState::Failed {
                    inner.set_state(ConnectionState::Disconnected, None);
                }
                inner.bus.publish(Event::new(EventPayload::RconDisconnected {
                    endpoint: session.endpoint().to_string(),
                    reason: "client disconnect".to_string(),
                }));
                return;
            }
        }

        let reason = session.close_reason().unwrap_or_else(|| "closed".to_string());
        warn!(endpoint = %session.endpoint(), reason = %reason, "RCON session lost");
        inner.install(None);
        inner.set_state(ConnectionState::Disconnected, None);
        inner.bus.publish(Event::new(EventPayload::RconDisconnected {
            endpoint: session.endpoint().to_string(),
            reason,
        }));

        match inner
            .establish_with_retry(&mut tracker, connected_at.elapsed(), &token)
            .await
        {
            Ok(next) => session = next,
            Err(_) => return,
        }
    }
}

#[async_trait]
impl Service for RconClient {
    fn name(&self) -> &str {
        &self.inner.name
    }

    /// Connects with retries; the server usually opens RCON some time after launch.
    async fn start(&self) -> Result<(), ServiceError> {
        Ok(self.open(true).await?)
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        self.disconnect().await;
        Ok(())
    }

    fn kill(&self) {
        if let Some(token) = self
            .inner
            .current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
        {
            token.cancel();
        }
        if let Some(session) = self.inner.session() {
            session.close("killed");
        }
        if self.connection_state() != ConnectionState::Failed {
            self.inner.set_state(ConnectionState::Disconnected, None);
        }
    }

    fn state(&self) -> ServiceState {
        as_service_state(self.connection_state())
    }
}
