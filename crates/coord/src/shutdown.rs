//! Process-wide termination signal handling.
//!
//! Signal listeners are registered at most once per process, no matter how
//! many components ask for a shutdown receiver.

use std::sync::OnceLock;

use tokio::sync::watch;

static SHUTDOWN: OnceLock<watch::Sender<bool>> = OnceLock::new();

/// Subscribe to the process shutdown signal, installing the SIGTERM/SIGINT
/// listeners on first use. Must be called from within a tokio runtime.
pub fn shutdown_receiver() -> watch::Receiver<bool> {
    let tx = SHUTDOWN.get_or_init(|| {
        let (tx, _) = watch::channel(false);
        let notifier = tx.clone();

        tokio::spawn(async move {
            wait_for_signal().await;
            tracing::info!("Termination signal received, shutting down");
            let _ = notifier.send(true);
        });

        tx
    });
    tx.subscribe()
}

/// Trigger shutdown programmatically (explicit stop, tests).
pub fn trigger_shutdown() {
    if let Some(tx) = SHUTDOWN.get() {
        let _ = tx.send(true);
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
