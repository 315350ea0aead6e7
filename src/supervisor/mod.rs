//! Server process supervision.
//!
//! ```text
//! NotRunning ──start──► Launching ──spawned──► Running ──exit(abnormal)──► Crashed
//!      ▲                                          │                          │
//!      └───────────── stop / clean exit ◄─────────┘       backoff + relaunch ┘
//!                                                      budget exhausted ──► Failed
//! ```
//!
//! A single monitor task owns the [`Child`] and writes the [`ProcessHandle`]
//! for every relaunch and exit. The first launch is the exception: it runs on
//! the caller of [`ProcessSupervisor::launch`] so a spawn error is returned
//! there, and the monitor only starts once the child exists. Callers talk to
//! the monitor through a stop channel and a cancellation token.
//!
//! While the process runs, the monitor also samples its CPU usage every
//! `poll_interval` and publishes `ProcessStuck` when it goes flat.

mod process;
mod stuck;

pub use process::{ExitInfo, LaunchSpec};
pub use stuck::StuckPolicy;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::{BackoffPolicy, CrashBudget, RestartDecision, RestartTracker};
use crate::error::{ServiceError, SupervisorError};
use crate::events::{Event, EventBus, EventPayload};
use crate::service::{Service, ServiceState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisorState {
    NotRunning,
    Launching,
    Running,
    Crashed,
    Stopping,
    Failed,
}

impl SupervisorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupervisorState::NotRunning => "not_running",
            SupervisorState::Launching => "launching",
            SupervisorState::Running => "running",
            SupervisorState::Crashed => "crashed",
            SupervisorState::Stopping => "stopping",
            SupervisorState::Failed => "failed",
        }
    }

    fn as_service_state(&self) -> ServiceState {
        match self {
            SupervisorState::NotRunning => ServiceState::Stopped,
            SupervisorState::Launching | SupervisorState::Crashed => ServiceState::Starting,
            SupervisorState::Running => ServiceState::Running,
            SupervisorState::Stopping => ServiceState::Stopping,
            SupervisorState::Failed => ServiceState::Failed,
        }
    }
}

/// Snapshot of the supervised process.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit_code: Option<i32>,
    pub status: SupervisorState,
}

impl Default for ProcessHandle {
    fn default() -> Self {
        Self {
            pid: None,
            started_at: None,
            last_exit_code: None,
            status: SupervisorState::NotRunning,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Exit code treated as a clean shutdown.
    pub expected_exit_code: i32,
    /// While this file exists, automatic restarts are deferred.
    pub lock_file: Option<PathBuf>,
    /// Re-check interval for the lock file.
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub max_crashes: u32,
    pub crash_window: Duration,
    pub healthy_uptime: Duration,
    /// Sampled every `poll_interval` while the process runs.
    pub stuck: StuckPolicy,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            expected_exit_code: 0,
            lock_file: None,
            poll_interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            max_crashes: 5,
            crash_window: Duration::from_secs(600),
            healthy_uptime: Duration::from_secs(300),
            stuck: StuckPolicy::default(),
        }
    }
}

impl SupervisorSettings {
    fn tracker(&self) -> RestartTracker {
        RestartTracker::new(
            self.backoff,
            CrashBudget::new(self.max_crashes, self.crash_window),
            self.healthy_uptime,
        )
    }
}

struct StopRequest {
    timeout: Duration,
    ack: oneshot::Sender<()>,
}

struct Shared {
    name: String,
    spec: LaunchSpec,
    settings: SupervisorSettings,
    bus: EventBus,
    state: watch::Sender<SupervisorState>,
    handle: StdMutex<ProcessHandle>,
    tracker: StdMutex<RestartTracker>,
    restarts: AtomicU32,
    /// Token of the current monitor task; cancelled by `kill`.
    current: StdMutex<Option<CancellationToken>>,
}

impl Shared {
    fn set_state(&self, to: SupervisorState, reason: Option<String>) {
        let from = self.state.send_replace(to);
        self.handle.lock().unwrap_or_else(|p| p.into_inner()).status = to;
        if from == to {
            return;
        }
        debug!(service = %self.name, from = from.as_str(), to = to.as_str(), "Supervisor state");
        let (from_svc, to_svc) = (from.as_service_state(), to.as_service_state());
        if to == SupervisorState::Failed || (from_svc != to_svc && reason.is_some()) {
            self.bus
                .publish(Event::state_changed(&self.name, from_svc, to_svc, reason));
        }
    }

    fn launch(&self, restart: u32) -> Result<Child, SupervisorError> {
        self.set_state(SupervisorState::Launching, None);
        let child = self.spec.spawn()?;
        let pid = child.id();
        {
            let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
            handle.pid = pid;
            handle.started_at = Some(Utc::now());
        }
        let reason = (restart > 0).then(|| format!("restart #{}", restart));
        self.set_state(SupervisorState::Running, reason);
        info!(service = %self.name, pid = ?pid, restart, executable = %self.spec.executable.display(), "Launched server process");
        self.bus
            .publish(Event::new(EventPayload::ProcessStarted { pid, restart }));
        Ok(child)
    }

    fn record_exit(&self, code: Option<i32>) -> Option<u32> {
        let mut handle = self.handle.lock().unwrap_or_else(|p| p.into_inner());
        handle.last_exit_code = code;
        handle.started_at = None;
        handle.pid.take()
    }

    fn publish_stopped(&self, pid: Option<u32>, exit_code: Option<i32>, forced: bool) {
        self.bus.publish(Event::new(EventPayload::ProcessStopped {
            pid,
            exit_code,
            forced,
        }));
    }

    async fn lock_file_present(&self) -> bool {
        match &self.settings.lock_file {
            Some(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            None => false,
        }
    }
}

struct Monitor {
    stop_tx: mpsc::Sender<StopRequest>,
    task: JoinHandle<()>,
}

/// Launches, watches and restarts the game server process.
pub struct ProcessSupervisor {
    shared: Arc<Shared>,
    monitor: Mutex<Option<Monitor>>,
    shutdown: CancellationToken,
}

impl ProcessSupervisor {
    pub fn new(spec: LaunchSpec, settings: SupervisorSettings, bus: EventBus) -> Self {
        let (state, _) = watch::channel(SupervisorState::NotRunning);
        let tracker = settings.tracker();
        Self {
            shared: Arc::new(Shared {
                name: "process".to_string(),
                spec,
                settings,
                bus,
                state,
                handle: StdMutex::new(ProcessHandle::default()),
                tracker: StdMutex::new(tracker),
                restarts: AtomicU32::new(0),
                current: StdMutex::new(None),
            }),
            monitor: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    /// Ties the monitor to a parent shutdown token.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Spawns the process and starts monitoring it.
    pub async fn launch(&self) -> Result<(), SupervisorError> {
        if self.shutdown.is_cancelled() {
            return Err(SupervisorError::Cancelled);
        }
        let mut monitor = self.monitor.lock().await;
        match self.state() {
            SupervisorState::Failed => return Err(SupervisorError::Failed),
            SupervisorState::NotRunning => {}
            _ => return Err(SupervisorError::AlreadyRunning(self.handle().pid)),
        }
        if let Some(old) = monitor.take() {
            let _ = old.task.await;
        }

        self.shared
            .tracker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .reset();
        self.shared.restarts.store(0, Ordering::Relaxed);

        let child = match self.shared.launch(0) {
            Ok(child) => child,
            Err(e) => {
                error!(service = %self.shared.name, error = %e, "Failed to launch server process");
                self.shared.set_state(SupervisorState::NotRunning, None);
                return Err(e);
            }
        };

        let cancel = self.shutdown.child_token();
        *self.shared.current.lock().unwrap_or_else(|p| p.into_inner()) = Some(cancel.clone());
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let task = tokio::spawn(monitor_loop(Arc::clone(&self.shared), child, stop_rx, cancel));
        *monitor = Some(Monitor { stop_tx, task });
        Ok(())
    }

    /// Graceful stop bounded by `timeout`, then force-kill. Idempotent.
    ///
    /// A supervisor in `Failed` stays `Failed`; use [`reset`](Self::reset).
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let mut monitor = self.monitor.lock().await;
        let Some(current) = monitor.take() else {
            return Ok(());
        };
        let (ack, ack_rx) = oneshot::channel();
        if current.stop_tx.send(StopRequest { timeout, ack }).await.is_ok() {
            let _ = ack_rx.await;
        }
        if let Err(e) = current.task.await {
            warn!(service = %self.shared.name, error = %e, "Monitor task ended abnormally");
        }
        Ok(())
    }

    /// Operator action: leaves `Failed`, clears crash history. Does not relaunch.
    pub fn reset(&self) -> Result<(), SupervisorError> {
        match self.state() {
            SupervisorState::NotRunning | SupervisorState::Failed => {}
            _ => return Err(SupervisorError::AlreadyRunning(self.handle().pid)),
        }
        self.shared
            .tracker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .reset();
        self.shared.restarts.store(0, Ordering::Relaxed);
        if self.state() == SupervisorState::Failed {
            info!(service = %self.shared.name, "Supervisor reset by operator");
            self.shared
                .set_state(SupervisorState::NotRunning, Some("operator reset".to_string()));
        }
        Ok(())
    }

    pub fn state(&self) -> SupervisorState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SupervisorState> {
        self.shared.state.subscribe()
    }

    pub fn handle(&self) -> ProcessHandle {
        self.shared
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Automatic restarts since the last explicit launch.
    pub fn restart_count(&self) -> u32 {
        self.shared.restarts.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Service for ProcessSupervisor {
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn start(&self) -> Result<(), ServiceError> {
        Ok(self.launch().await?)
    }

    async fn stop(&self) -> Result<(), ServiceError> {
        Ok(self.shutdown(self.shared.settings.stop_timeout).await?)
    }

    fn kill(&self) {
        let current = self.shared.current.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(token) = current.as_ref() {
            token.cancel();
        }
    }

    fn state(&self) -> ServiceState {
        ProcessSupervisor::state(self).as_service_state()
    }
}

enum Wake {
    Elapsed,
    Stop(StopRequest),
    Cancelled,
}

async fn pause(
    delay: Duration,
    stop_rx: &mut mpsc::Receiver<StopRequest>,
    cancel: &CancellationToken,
) -> Wake {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Wake::Elapsed,
        Some(req) = stop_rx.recv() => Wake::Stop(req),
        _ = cancel.cancelled() => Wake::Cancelled,
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Stop(StopRequest),
    Cancelled,
    Sample,
}

fn sample_ticker(settings: &SupervisorSettings) -> Option<tokio::time::Interval> {
    if !settings.stuck.enabled() || settings.poll_interval.is_zero() {
        return None;
    }
    let period = settings.poll_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    Some(ticker)
}

async fn next_sample(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn monitor_loop(
    shared: Arc<Shared>,
    child: Child,
    mut stop_rx: mpsc::Receiver<StopRequest>,
    cancel: CancellationToken,
) {
    let mut child = child;
    let mut launched_at = Instant::now();
    let mut ticker = sample_ticker(&shared.settings);
    let mut sampler = stuck::CpuSampler::new();
    let mut detector = stuck::StuckDetector::new(shared.settings.stuck);

    loop {
        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            Some(req) = stop_rx.recv() => Outcome::Stop(req),
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = next_sample(&mut ticker) => Outcome::Sample,
        };

        match outcome {
            Outcome::Sample => {
                let Some(pid) = child.id() else {
                    continue;
                };
                let Some(cpu) = sampler.sample(pid) else {
                    continue;
                };
                if let Some(mean) = detector.record(cpu) {
                    warn!(service = %shared.name, pid, cpu_percent = mean, "Server process possibly stuck");
                    shared.bus.publish(Event::new(EventPayload::ProcessStuck {
                        pid: Some(pid),
                        cpu_percent: mean,
                        samples: shared.settings.stuck.samples,
                    }));
                }
            }
            Outcome::Exited(status) => {
                let uptime = launched_at.elapsed();
                let (code, signal, clean) = match status {
                    Ok(status) => {
                        let info = ExitInfo::classify(status, shared.settings.expected_exit_code);
                        (info.code, info.signal, info.clean)
                    }
                    Err(e) => {
                        warn!(service = %shared.name, error = %e, "Lost track of server process");
                        (None, None, false)
                    }
                };
                let pid = shared.record_exit(code);
                if clean {
                    info!(service = %shared.name, pid = ?pid, exit_code = ?code, "Server process exited cleanly");
                    shared.publish_stopped(pid, code, false);
                    shared.set_state(SupervisorState::NotRunning, Some("clean exit".to_string()));
                    break;
                }
                warn!(service = %shared.name, pid = ?pid, exit_code = ?code, signal = ?signal, uptime = ?uptime, "Server process crashed");
                shared.bus.publish(Event::new(EventPayload::ProcessCrashed {
                    pid,
                    exit_code: code,
                    signal,
                    uptime_ms: uptime.as_millis() as u64,
                }));
                shared.set_state(
                    SupervisorState::Crashed,
                    Some(match signal {
                        Some(sig) => format!("killed by signal {}", sig),
                        None => format!("exited with code {:?}", code),
                    }),
                );
                match schedule_restart(&shared, uptime, &mut stop_rx, &cancel).await {
                    Some(next) => {
                        child = next;
                        launched_at = Instant::now();
                        detector.clear();
                    }
                    None => break,
                }
            }
            Outcome::Stop(req) => {
                shared.set_state(SupervisorState::Stopping, None);
                let (status, forced) = process::terminate(&mut child, req.timeout).await;
                let code = status.and_then(|s| s.code());
                let pid = shared.record_exit(code);
                info!(service = %shared.name, pid = ?pid, exit_code = ?code, forced, "Server process stopped");
                shared.publish_stopped(pid, code, forced);
                shared.set_state(SupervisorState::NotRunning, None);
                let _ = req.ack.send(());
                break;
            }
            Outcome::Cancelled => {
                if let Err(e) = child.kill().await {
                    warn!(service = %shared.name, error = %e, "Failed to kill server process");
                }
                let code = child.wait().await.ok().and_then(|s| s.code());
                let pid = shared.record_exit(code);
                warn!(service = %shared.name, pid = ?pid, "Server process killed");
                shared.publish_stopped(pid, code, true);
                shared.set_state(SupervisorState::NotRunning, None);
                break;
            }
        }
    }

    shared
        .current
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .take();
}

/// Backoff, honour the restart lock, relaunch. `None` ends the monitor.
async fn schedule_restart(
    shared: &Shared,
    mut uptime: Duration,
    stop_rx: &mut mpsc::Receiver<StopRequest>,
    cancel: &CancellationToken,
) -> Option<Child> {
    loop {
        let decision = shared
            .tracker
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .on_failure(uptime, Instant::now());

        let delay = match decision {
            RestartDecision::GiveUp { failures } => {
                error!(service = %shared.name, failures, "Restart budget exhausted, giving up");
                shared.set_state(
                    SupervisorState::Failed,
                    Some(format!("{} crashes within {:?}", failures, shared.settings.crash_window)),
                );
                return None;
            }
            RestartDecision::Restart { delay, attempt } => {
                info!(service = %shared.name, attempt, delay = ?delay, "Restarting server process");
                delay
            }
        };

        if !wait_or_stop(shared, delay, stop_rx, cancel).await {
            return None;
        }
        while shared.lock_file_present().await {
            debug!(service = %shared.name, "Restart lock present, deferring restart");
            if !wait_or_stop(shared, shared.settings.poll_interval, stop_rx, cancel).await {
                return None;
            }
        }

        let restart = shared.restarts.fetch_add(1, Ordering::Relaxed) + 1;
        match shared.launch(restart) {
            Ok(child) => return Some(child),
            Err(e) => {
                // counts against the crash budget like any other failed run
                error!(service = %shared.name, error = %e, "Relaunch failed");
                shared.set_state(SupervisorState::Crashed, None);
                uptime = Duration::ZERO;
            }
        }
    }
}

/// `false` when a stop or cancellation arrived while waiting.
async fn wait_or_stop(
    shared: &Shared,
    delay: Duration,
    stop_rx: &mut mpsc::Receiver<StopRequest>,
    cancel: &CancellationToken,
) -> bool {
    match pause(delay, stop_rx, cancel).await {
        Wake::Elapsed => true,
        Wake::Stop(req) => {
            debug!(service = %shared.name, "Stop requested while waiting to restart");
            shared.publish_stopped(None, shared.handle.lock().unwrap_or_else(|p| p.into_inner()).last_exit_code, false);
            shared.set_state(SupervisorState::NotRunning, None);
            let _ = req.ack.send(());
            false
        }
        Wake::Cancelled => {
            shared.set_state(SupervisorState::NotRunning, None);
            false
        }
    }
}
