//! Cooperative shutdown signal shared by the background loops

use tokio::sync::watch;

/// Sender side flips to `true` once; loops observe it between ticks.
pub fn channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

pub fn is_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow()
}

/// Resolves once shutdown is requested or the sender is gone.
pub async fn requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Receiver that flips when the process gets Ctrl-C.
pub fn on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for shutdown signal"),
        }
        let _ = tx.send(true);
    });
    rx
}
