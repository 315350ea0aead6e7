use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Supervise a game server process with RCON and log tailing", long_about = None)]
pub(crate) struct Cli {
    /// Config file (default: $WARDEN_CONFIG or ~/.config/warden/warden.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Run the server, RCON and log tailers in the foreground (Ctrl+C to stop)
    Run {
        /// Only open the control socket, start services later with `warden start`
        #[arg(long)]
        no_start: bool,
    },

    /// Show the state of every service
    Status,

    /// Start all services in dependency order
    Start,

    /// Stop all services in reverse start order
    Stop,

    /// Stop all services and exit the running warden
    Shutdown,

    /// Send a console command to the game server
    Rcon {
        /// Command text, e.g. `players` or `say -1 Restart in 5 minutes`
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Clear a failed server process after too many crashes
    Reset,

    /// Show recent lines of a log source
    Logs {
        /// Log source name (e.g., SCRIPT, ADM, RPT)
        source: String,

        /// Number of recent lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: u32,
    },

    /// Show the config file path and effective configuration
    Config {
        /// Write a default config file if none exists
        #[arg(long)]
        init: bool,

        /// Print the effective configuration as JSON
        #[arg(long, conflicts_with = "init")]
        json: bool,
    },
}
