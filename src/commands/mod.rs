pub(crate) mod config;
pub(crate) mod control;
pub(crate) mod run;

use std::path::Path;

use warden::{clienv, WardenConfig};

/// Loads the config selected by `--config`, `$WARDEN_CONFIG` or the default path.
pub(crate) fn load_config(flag: Option<&Path>) -> anyhow::Result<WardenConfig> {
    WardenConfig::load(&clienv::config_path(flag))
}
