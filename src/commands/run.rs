use std::path::Path;
use std::sync::Arc;

use warden::daemon::ControlServer;
use warden::{shutdown, Orchestrator};

pub(crate) async fn cmd_run(config_flag: Option<&Path>, no_start: bool) -> anyhow::Result<()> {
    let config = super::load_config(config_flag)?;
    let socket_path = config.socket_path();

    let orchestrator = Arc::new(Orchestrator::from_config(&config)?.with_event_log());
    let server = ControlServer::new(Arc::clone(&orchestrator), &socket_path);
    let stop = server.shutdown_token();
    let signals = shutdown::cancel_on_signal(stop.clone());
    let control = tokio::spawn(server.run());

    println!("Warden running (Ctrl+C to stop)");
    println!("  Server: {}", config.server.executable.display());
    println!("  Socket: {}", socket_path.display());

    if no_start {
        tracing::info!("Services not started, waiting for `warden start`");
    } else if let Err(e) = orchestrator.start_all().await {
        // control socket stays up for `warden status` / `warden start`
        tracing::error!(error = %e, kind = e.as_label(), "Failed to start services");
    }

    stop.cancelled().await;
    let stopped = orchestrator.shutdown().await;
    signals.abort();
    control.await??;
    stopped?;

    println!("Warden stopped");
    Ok(())
}
