//! Shutdown signal handling.

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Wait for SIGINT, SIGTERM or SIGQUIT.
///
/// If the handlers cannot be installed this falls back to Ctrl-C only.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let handlers = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );
    let (mut sigint, mut sigterm, mut sigquit) = match handlers {
        (Ok(int), Ok(term), Ok(quit)) => (int, term, quit),
        _ => {
            warn!("Failed to install signal handlers, listening for Ctrl-C only");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!(signal = "SIGINT", "Signal received"),
        _ = sigterm.recv() => info!(signal = "SIGTERM", "Signal received"),
        _ = sigquit.recv() => info!(signal = "SIGQUIT", "Signal received"),
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!(signal = "SIGINT", "Signal received"),
        Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C"),
    }
}

/// Cancel `shutdown` when a shutdown signal arrives.
pub fn cancel_on_signal(shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => shutdown.cancel(),
            _ = shutdown.cancelled() => {}
        }
    })
}
