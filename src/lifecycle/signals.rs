//! OS signal handling.
//!
//! # Responsibilities
//! - Register signal handlers (SIGTERM, SIGINT)
//! - Translate signals into [`Shutdown`] triggers
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The first SIGTERM/SIGINT asks for a graceful stop, the second forces it

use crate::lifecycle::Shutdown;

/// Spawn a task that triggers `shutdown` on every SIGINT or SIGTERM.
pub fn spawn_signal_handler(shutdown: Shutdown) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let signal = match wait_for_signal().await {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::error!(error = %err, "Failed to listen for signals");
                    return;
                }
            };
            if shutdown.is_triggered() {
                tracing::warn!(signal, "Second signal received, forcing shutdown");
            } else {
                tracing::info!(signal, "Signal received, shutting down gracefully");
            }
            shutdown.trigger();
        }
    })
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "ctrl-c")
}
