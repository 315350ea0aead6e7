use std::path::Path;

use warden::{clienv, WardenConfig};

pub(crate) fn cmd_config(config_flag: Option<&Path>, init: bool, json: bool) -> anyhow::Result<()> {
    let path = clienv::config_path(config_flag);

    if init {
        if path.exists() {
            println!("Config already exists: {}", path.display());
        } else {
            WardenConfig::default().save(&path)?;
            println!("Wrote default config to {}", path.display());
        }
        return Ok(());
    }

    let config = WardenConfig::load(&path)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let origin = if path.exists() { "" } else { " (not found, showing defaults)" };
    println!("# {}{}", path.display(), origin);
    println!("# control socket: {}", config.socket_path().display());
    println!();
    print!("{}", config.to_toml()?);
    Ok(())
}
