use tokio_util::sync::CancellationToken;
use tracing::info;

/// Resolves on SIGINT, SIGTERM or SIGQUIT (Ctrl+C elsewhere).
pub async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigquit = signal(SignalKind::quit())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigquit.recv() => info!("Received SIGQUIT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}

/// Cancels `token` on the first termination signal.
pub fn cancel_on_signal(token: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = wait_for_signal() => {
                if let Err(e) = res {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
                token.cancel();
            }
            _ = token.cancelled() => {}
        }
    })
}
