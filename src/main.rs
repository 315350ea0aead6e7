mod args;
mod commands;

use args::{Cli, Commands};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Run { no_start } => commands::run::cmd_run(config, no_start).await?,
        Commands::Status => commands::control::cmd_status(config).await?,
        Commands::Start => commands::control::cmd_start(config).await?,
        Commands::Stop => commands::control::cmd_stop(config).await?,
        Commands::Shutdown => commands::control::cmd_shutdown(config).await?,
        Commands::Rcon { command } => commands::control::cmd_rcon(config, &command.join(" ")).await?,
        Commands::Reset => commands::control::cmd_reset(config).await?,
        Commands::Logs { source, lines } => {
            commands::control::cmd_logs(config, &source, lines).await?
        }
        Commands::Config { init, json } => commands::config::cmd_config(config, init, json)?,
    }

    Ok(())
}
