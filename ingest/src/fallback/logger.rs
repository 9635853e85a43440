use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use crate::logfiles::RotatingWriter;

/// Default bounded capacity of the logger channel. Overflow blocks the
/// producer rather than dropping events.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 20_000;

/// Asynchronous JSON-lines writer.
///
/// One instance serves one destination and one purpose (fallback or
/// archive). Producers send values into a bounded channel; a single drain
/// task owns the rotating file writer. Closing the logger closes the
/// channel and lets the drain task flush what's left.
pub struct AsyncLogger {
    tx: Mutex<Option<mpsc::Sender<Value>>>,
    drain: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncLogger {
    pub fn new(mut writer: RotatingWriter, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<Value>(capacity.max(1));

        let drain = tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                match serde_json::to_string(&value) {
                    Ok(line) => {
                        if let Err(err) = writer.write_line(&line) {
                            error!(error = %err, "failed to write log line");
                        }
                    }
                    Err(err) => error!(error = %err, "failed to encode log line"),
                }
            }

            if let Err(err) = writer.flush() {
                error!(error = %err, "failed to flush log writer on close");
            }
        });

        Self {
            tx: Mutex::new(Some(tx)),
            drain: Mutex::new(Some(drain)),
        }
    }

    /// Enqueues a value for writing. Blocks (asynchronously) when the
    /// channel is full; events are never dropped here.
    pub async fn consume(&self, value: Value) {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(value).await.is_err() {
                    warn!("log line dropped: writer task is gone");
                }
            }
            None => warn!("log line dropped: logger is closed"),
        }
    }

    /// Serializes and enqueues anything serializable.
    pub async fn consume_any<T: serde::Serialize>(&self, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => self.consume(value).await,
            Err(err) => error!(error = %err, "failed to encode value for logging"),
        }
    }

    /// Closes the channel and waits for the drain task to flush.
    pub async fn close(&self) {
        let tx = self.tx.lock().take();
        drop(tx);

        let drain = self.drain.lock().take();
        if let Some(drain) = drain
            && let Err(err) = drain.await
        {
            error!(error = %err, "log drain task failed");
        }
    }
}

impl std::fmt::Debug for AsyncLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncLogger")
            .field("closed", &self.tx.lock().is_none())
            .finish()
    }
}
