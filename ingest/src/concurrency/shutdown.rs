//! Graceful shutdown signaling.
//!
//! A single watch channel fans the shutdown flag out to every worker.
//! Workers observe it at their loop boundary (queue dequeue, uploader
//! tick); in-flight work finishes before the worker exits.

use tokio::sync::watch;

/// Transmitter side of the shutdown signal, held by the service lifecycle.
pub type ShutdownTx = watch::Sender<bool>;

/// Receiver side, cloned into every worker.
pub type ShutdownRx = watch::Receiver<bool>;

/// Creates the shutdown channel in the running state.
pub fn create_shutdown() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Current value of the flag without consuming a change notification.
pub fn is_shutting_down(rx: &ShutdownRx) -> bool {
    *rx.borrow()
}
