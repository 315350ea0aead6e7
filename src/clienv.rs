use std::path::{Path, PathBuf};

/// Environment variables warden reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvVar {
    WardenConfig,
    WardenConfigDir,
    WardenSocket,
    WardenTcpPort,
    WardenRconPassword,
}

impl EnvVar {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvVar::WardenConfig => "WARDEN_CONFIG",
            EnvVar::WardenConfigDir => "WARDEN_CONFIG_DIR",
            EnvVar::WardenSocket => "WARDEN_SOCKET",
            EnvVar::WardenTcpPort => "WARDEN_TCP_PORT",
            EnvVar::WardenRconPassword => "WARDEN_RCON_PASSWORD",
        }
    }
}

/// Non-empty value of an env var.
fn env_opt(var: EnvVar) -> Option<String> {
    std::env::var(var.as_str()).ok().filter(|v| !v.is_empty())
}

const FALLBACK_CONFIG_DIR: &str = "~/.config";
const FALLBACK_DATA_DIR: &str = "~/.local/share";
const WARDEN_SUBDIR: &str = "warden";
const CONFIG_FILE: &str = "warden.toml";
const SOCKET_FILE: &str = "warden.sock";
const DEFAULT_TCP_PORT: u16 = 14732;

/// Config directory ($WARDEN_CONFIG_DIR or ~/.config/warden)
pub fn config_dir() -> PathBuf {
    let dir = env_opt(EnvVar::WardenConfigDir)
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from(FALLBACK_CONFIG_DIR))
                .join(WARDEN_SUBDIR)
        });
    tracing::trace!(dir = %dir.display(), "Resolved config directory");
    dir
}

/// Data directory (~/.local/share/warden)
pub fn data_dir() -> PathBuf {
    let dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(FALLBACK_DATA_DIR))
        .join(WARDEN_SUBDIR);
    tracing::trace!(dir = %dir.display(), "Resolved data directory");
    dir
}

/// Config file: `--config` flag > $WARDEN_CONFIG > <config_dir>/warden.toml
pub fn config_path(flag: Option<&Path>) -> PathBuf {
    let path = flag
        .map(Path::to_path_buf)
        .or_else(|| env_opt(EnvVar::WardenConfig).map(PathBuf::from))
        .unwrap_or_else(|| config_dir().join(CONFIG_FILE));
    tracing::trace!(path = %path.display(), "Config path");
    path
}

/// Control socket: $WARDEN_SOCKET > configured > <data_dir>/warden.sock
pub fn socket_path(configured: Option<&Path>) -> PathBuf {
    let path = env_opt(EnvVar::WardenSocket)
        .map(PathBuf::from)
        .or_else(|| configured.map(Path::to_path_buf))
        .unwrap_or_else(|| data_dir().join(SOCKET_FILE));
    tracing::trace!(path = %path.display(), "Control socket path");
    path
}

/// Control port for non-Unix platforms ($WARDEN_TCP_PORT or 14732)
pub fn tcp_port() -> u16 {
    env_opt(EnvVar::WardenTcpPort)
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_TCP_PORT)
}

/// RCON password override, keeps secrets out of the config file ($WARDEN_RCON_PASSWORD)
pub fn rcon_password() -> Option<String> {
    let val = env_opt(EnvVar::WardenRconPassword);
    tracing::trace!(set = val.is_some(), "WARDEN_RCON_PASSWORD env var");
    val
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_wins_over_everything() {
        let path = config_path(Some(Path::new("/etc/warden/custom.toml")));
        assert_eq!(path, PathBuf::from("/etc/warden/custom.toml"));
    }

    #[test]
    fn default_paths_end_in_warden_dir() {
        assert!(data_dir().ends_with(WARDEN_SUBDIR));
        assert_eq!(EnvVar::WardenSocket.as_str(), "WARDEN_SOCKET");
    }
}
