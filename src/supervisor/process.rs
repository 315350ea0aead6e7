use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::SupervisorError;

/// What to launch and how.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Overrides applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Default::default()
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub(crate) fn spawn(&self) -> Result<Child, SupervisorError> {
        let mut cmd = Command::new(&self.executable);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Launch {
            executable: self.executable.display().to_string(),
            source,
        })?;
        forward_output(&mut child);
        Ok(child)
    }
}

/// Console output goes to the log; the server's real logs are tailed from disk.
fn forward_output(child: &mut Child) {
    let pid = child.id();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(pid = ?pid, stream = "stdout", "{}", line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(pid = ?pid, stream = "stderr", "{}", line);
            }
        });
    }
}

/// How a process exit is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// `true` only for the expected exit code; any signal is abnormal.
    pub clean: bool,
}

impl ExitInfo {
    pub fn classify(status: ExitStatus, expected_code: i32) -> Self {
        let code = status.code();
        let signal = exit_signal(&status);
        Self {
            code,
            signal,
            clean: signal.is_none() && code == Some(expected_code),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// SIGTERM, wait up to `timeout`, then SIGKILL. Returns the exit status and
/// whether the kill was needed.
pub(crate) async fn terminate(child: &mut Child, timeout: Duration) -> (Option<ExitStatus>, bool) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // SAFETY: plain kill(2) on a pid we spawned and have not reaped.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = child.start_kill();
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (Some(status), false),
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to wait for server process");
            (None, false)
        }
        Err(_) => {
            warn!(timeout = ?timeout, "Server process ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill server process");
            }
            (child.wait().await.ok(), true)
        }
    }
}
