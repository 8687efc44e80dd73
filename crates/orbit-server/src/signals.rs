//! Termination signal handling.
//!
//! On Unix the server stops on SIGINT, SIGTERM or SIGQUIT; elsewhere only on
//! Ctrl-C.

use tracing::{info, warn};

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}

/// Resolve once the process is asked to terminate.
///
/// If signal handlers cannot be installed, falls back to Ctrl-C alone.
pub async fn shutdown_signal() {
    match wait_for_signal().await {
        Ok(name) => info!("Received {}", name),
        Err(e) => {
            warn!(error = %e, "Failed to install signal handlers, waiting for Ctrl-C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to wait for Ctrl-C");
            }
        }
    }
}
