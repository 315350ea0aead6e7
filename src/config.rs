//! TOML configuration.
//!
//! Every field has a default, so an empty or missing file yields a working
//! config. Durations are integers with a `_ms` or `_secs` suffix. Relative
//! paths resolve against `server.working_dir` (or the current directory).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::clienv;
use crate::rcon::{Credentials, RconSettings, SessionSettings};
use crate::supervisor::{LaunchSpec, StuckPolicy, SupervisorSettings};
use crate::tailer::{LogSource, TailSource, TailerSettings};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub server: ServerSection,
    pub restart: RestartSection,
    pub rcon: RconSection,
    pub logs: LogsSection,
    pub orchestrator: OrchestratorSection,
    pub daemon: DaemonSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub executable: PathBuf,
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub expected_exit_code: i32,
    /// While this file exists, crash restarts wait.
    pub lock_file: PathBuf,
    /// How often a deferred restart re-checks the lock file, and how often
    /// CPU usage is sampled for stuck detection.
    pub poll_interval_ms: u64,
    /// Idle samples in a row before the server is reported stuck. 0 disables.
    pub stuck_samples: u32,
    pub stuck_cpu_percent: f32,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("./DayZServer"),
            args: vec![
                "-config=serverDZ.cfg".to_string(),
                "-port=2302".to_string(),
                "-profiles=profiles".to_string(),
            ],
            working_dir: None,
            env: BTreeMap::new(),
            expected_exit_code: 0,
            lock_file: PathBuf::from("RESTART_LOCK"),
            poll_interval_ms: 30_000,
            stuck_samples: 5,
            stuck_cpu_percent: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartSection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// Uptime after which the backoff and crash window reset.
    pub healthy_uptime_secs: u64,
    /// Crashes within `crash_window_secs` that move the process to Failed.
    pub max_crashes: u32,
    pub crash_window_secs: u64,
}

impl Default for RestartSection {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            factor: 2.0,
            healthy_uptime_secs: 300,
            max_crashes: 5,
            crash_window_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RconSection {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub password: String,
    pub connect_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub max_missed_heartbeats: u32,
    pub max_protocol_errors: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnects: u32,
    pub reconnect_window_secs: u64,
}

impl Default for RconSection {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 2306,
            password: String::new(),
            connect_timeout_ms: 10_000,
            command_timeout_ms: 10_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 5_000,
            max_missed_heartbeats: 2,
            max_protocol_errors: 10,
            greeting: Some("say -1 Warden connected.".to_string()),
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 30_000,
            max_reconnects: 10,
            reconnect_window_secs: 600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSourceConfig {
    pub name: String,
    /// Fixed file. Takes precedence over the directory form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Directory to pick the newest matching file from; defaults to `logs.profiles_dir`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
}

impl LogSourceConfig {
    fn newest(name: &str, prefix: Option<&str>, suffix: &str) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            dir: None,
            prefix: prefix.map(String::from),
            suffix: Some(suffix.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsSection {
    pub poll_interval_ms: u64,
    pub history_lines: usize,
    pub profiles_dir: PathBuf,
    pub sources: Vec<LogSourceConfig>,
}

impl Default for LogsSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            history_lines: 10_000,
            profiles_dir: PathBuf::from("profiles"),
            sources: vec![
                LogSourceConfig::newest("SCRIPT", Some("script"), ".log"),
                LogSourceConfig::newest("ADM", None, ".adm"),
                LogSourceConfig::newest("RPT", None, ".rpt"),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorSection {
    pub start_timeout_secs: u64,
    pub stop_timeout_secs: u64,
    pub event_queue_capacity: usize,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            start_timeout_secs: 120,
            stop_timeout_secs: 30,
            event_queue_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

impl WardenConfig {
    /// Loads `path`, or defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::trace!(path = %path.display(), "Loading config");

        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        tracing::trace!(executable = %config.server.executable.display(), sources = config.logs.sources.len(), "Config loaded");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config to TOML")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        fs::write(path, self.to_toml()?)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        tracing::debug!(path = %path.display(), "Config saved");
        Ok(())
    }

    /// Base for relative paths.
    pub fn server_dir(&self) -> PathBuf {
        self.server
            .working_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.server_dir().join(path)
        }
    }

    pub fn launch_spec(&self) -> LaunchSpec {
        let mut spec = LaunchSpec::new(&self.server.executable).args(self.server.args.iter().cloned());
        if let Some(dir) = &self.server.working_dir {
            spec = spec.working_dir(dir);
        }
        for (key, value) in &self.server.env {
            spec = spec.env(key, value);
        }
        spec
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        let r = &self.restart;
        SupervisorSettings {
            expected_exit_code: self.server.expected_exit_code,
            lock_file: Some(self.resolve(&self.server.lock_file)),
            poll_interval: Duration::from_millis(self.server.poll_interval_ms),
            stop_timeout: Duration::from_secs(self.orchestrator.stop_timeout_secs),
            backoff: BackoffPolicy {
                base: Duration::from_millis(r.base_delay_ms),
                max: Duration::from_millis(r.max_delay_ms),
                factor: r.factor,
            },
            max_crashes: r.max_crashes,
            crash_window: Duration::from_secs(r.crash_window_secs),
            healthy_uptime: Duration::from_secs(r.healthy_uptime_secs),
            stuck: StuckPolicy {
                samples: self.server.stuck_samples,
                cpu_percent: self.server.stuck_cpu_percent,
            },
        }
    }

    /// `$WARDEN_RCON_PASSWORD` overrides `rcon.password`.
    pub fn rcon_settings(&self) -> RconSettings {
        let c = &self.rcon;
        RconSettings {
            endpoint: format!("{}:{}", c.host, c.port),
            credentials: Credentials::new(clienv::rcon_password().unwrap_or_else(|| c.password.clone())),
            command_timeout: Duration::from_millis(c.command_timeout_ms),
            greeting: c.greeting.clone().filter(|g| !g.trim().is_empty()),
            session: SessionSettings {
                connect_timeout: Duration::from_millis(c.connect_timeout_ms),
                heartbeat_interval: Duration::from_millis(c.heartbeat_interval_ms),
                heartbeat_timeout: Duration::from_millis(c.heartbeat_timeout_ms),
                max_missed_heartbeats: c.max_missed_heartbeats.max(1),
                max_protocol_errors: c.max_protocol_errors.max(1),
            },
            reconnect: BackoffPolicy {
                base: Duration::from_millis(c.reconnect_base_ms),
                max: Duration::from_millis(c.reconnect_max_ms),
                factor: self.restart.factor,
            },
            max_reconnects: c.max_reconnects,
            reconnect_window: Duration::from_secs(c.reconnect_window_secs),
            healthy_uptime: Duration::from_secs(self.restart.healthy_uptime_secs),
        }
    }

    pub fn tail_sources(&self) -> Vec<TailSource> {
        let profiles = self.resolve(&self.logs.profiles_dir);
        self.logs
            .sources
            .iter()
            .map(|s| {
                let source = match (&s.path, &s.dir) {
                    (Some(path), _) => LogSource::File(self.resolve(path)),
                    (None, dir) => LogSource::newest(
                        dir.as_deref().map(|d| self.resolve(d)).unwrap_or_else(|| profiles.clone()),
                        s.prefix.as_deref(),
                        s.suffix.as_deref(),
                    ),
                };
                TailSource::new(&s.name, source)
            })
            .collect()
    }

    pub fn tailer_settings(&self) -> TailerSettings {
        TailerSettings {
            poll_interval: Duration::from_millis(self.logs.poll_interval_ms),
            history_lines: self.logs.history_lines,
        }
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.start_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.orchestrator.stop_timeout_secs)
    }

    pub fn socket_path(&self) -> PathBuf {
        clienv::socket_path(self.daemon.socket_path.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = WardenConfig::from_toml("").unwrap();
        assert_eq!(config, WardenConfig::default());
        assert_eq!(config.logs.sources.len(), 3);
        assert_eq!(config.rcon.max_missed_heartbeats, 2);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = WardenConfig::from_toml(
            r#"
            [server]
            executable = "/srv/dayz/DayZServer"
            working_dir = "/srv/dayz"

            [restart]
            max_crashes = 3

            [[logs.sources]]
            name = "console"
            path = "console.log"
            "#,
        )
        .unwrap();

        assert_eq!(config.restart.max_crashes, 3);
        assert_eq!(config.restart.base_delay_ms, 1_000);
        assert_eq!(config.server.expected_exit_code, 0);

        let settings = config.supervisor_settings();
        assert_eq!(settings.lock_file, Some(PathBuf::from("/srv/dayz/RESTART_LOCK")));

        let sources = config.tail_sources();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].source, LogSource::File(PathBuf::from("/srv/dayz/console.log")));
    }

    #[test]
    fn default_sources_follow_profiles_dir() {
        let mut config = WardenConfig::default();
        config.server.working_dir = Some(PathBuf::from("/srv/dayz"));
        let sources = config.tail_sources();
        assert_eq!(sources[0].name, "SCRIPT");
        assert_eq!(
            sources[0].source,
            LogSource::newest("/srv/dayz/profiles", Some("script"), Some(".log"))
        );
    }

    #[test]
    fn stuck_detection_settings() {
        let settings = WardenConfig::default().supervisor_settings();
        assert_eq!(settings.stuck.samples, 5);
        assert!(settings.stuck.enabled());

        let config = WardenConfig::from_toml("[server]\nstuck_samples = 0").unwrap();
        assert!(!config.supervisor_settings().stuck.enabled());
    }

    #[test]
    fn rejects_wrong_types() {
        assert!(WardenConfig::from_toml("[rcon]\nport = \"abc\"").is_err());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("warden.toml");
        let mut config = WardenConfig::default();
        config.rcon.port = 2310;
        config.save(&path).unwrap();
        assert_eq!(WardenConfig::load(&path).unwrap().rcon.port, 2310);
        assert_eq!(
            WardenConfig::load(&dir.path().join("missing.toml")).unwrap(),
            WardenConfig::default()
        );
    }
}
