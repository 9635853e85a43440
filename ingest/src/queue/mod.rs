//! File-backed FIFO of accepted events.
//!
//! Each streaming destination owns one queue directory under the events
//! path. Records are JSON lines in an append-only log; the consumer offset
//! is persisted next to it, so a restart resumes exactly where the previous
//! process stopped. The log is compacted on open and whenever the consumed
//! prefix grows large.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::ingest_error;
use crate::types::{Event, TokenId};

/// Queue directory name per destination: `queue.dst=<destination id>`.
pub fn queue_dir_name(destination_id: &str) -> String {
    format!("queue.dst={destination_id}")
}

const LOG_FILE: &str = "events.log";
const OFFSET_FILE: &str = "offset";

/// Compact the log once this many consumed records accumulate at its head.
const COMPACTION_THRESHOLD: u64 = 10_000;

/// One queued event. `not_before` is set for delayed re-enqueues after a
/// transient failure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueuedEvent {
    pub payload: Event,
    #[serde(default)]
    pub not_before: Option<DateTime<Utc>>,
    pub token_id: TokenId,
}

struct QueueState {
    pending: VecDeque<QueuedEvent>,
    log: File,
    /// Records consumed from the head of the log file.
    consumed: u64,
    closed: bool,
}

/// Durable per-destination FIFO.
///
/// Ordering is preserved for records without `not_before`; delayed records
/// are appended at the tail on re-enqueue and may therefore be observed out
/// of order relative to later non-delayed records.
pub struct PersistentQueue {
    destination_id: String,
    dir: PathBuf,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl PersistentQueue {
    /// Opens (or creates) the queue directory and replays the unconsumed
    /// suffix of the log into memory.
    pub fn open(events_dir: &Path, destination_id: &str) -> IngestResult<Arc<Self>> {
        let dir = events_dir.join(queue_dir_name(destination_id));
        std::fs::create_dir_all(&dir)
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to create queue dir", err))?;

        let consumed = read_offset(&dir.join(OFFSET_FILE));
        let log_path = dir.join(LOG_FILE);
        let mut pending = VecDeque::new();

        if log_path.exists() {
            let reader = BufReader::new(
                File::open(&log_path)
                    .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to open queue log", err))?,
            );

            for (index, line) in reader.lines().enumerate() {
                let line = line.map_err(|err| {
                    ingest_error!(ErrorKind::QueueCorrupted, "Failed to read queue log", err)
                })?;
                if (index as u64) < consumed || line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<QueuedEvent>(&line) {
                    Ok(record) => pending.push_back(record),
                    Err(err) => {
                        // One bad record does not poison the queue.
                        warn!(
                            destination = destination_id,
                            line = index,
                            error = %err,
                            "dropping corrupt queue record"
                        );
                    }
                }
            }
        }

        // Compact on open: rewrite the surviving records and reset the
        // offset so the consumed prefix doesn't grow across restarts.
        write_log(&log_path, pending.iter())?;
        write_offset(&dir.join(OFFSET_FILE), 0)?;

        let log = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&log_path)
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to open queue log", err))?;

        debug!(
            destination = destination_id,
            pending = pending.len(),
            "opened persistent queue"
        );

        Ok(Arc::new(Self {
            destination_id: destination_id.to_owned(),
            dir,
            state: Mutex::new(QueueState {
                pending,
                log,
                consumed: 0,
                closed: false,
            }),
            notify: Notify::new(),
        }))
    }

    /// Appends an event at the tail.
    pub fn enqueue(&self, payload: Event, token_id: &str) -> IngestResult<()> {
        self.push(QueuedEvent {
            payload,
            not_before: None,
            token_id: token_id.to_owned(),
        })
    }

    /// Re-enqueues an event with a delivery delay, used by the streaming
    /// worker on transient insert failures.
    pub fn consume_timed(
        &self,
        payload: Event,
        not_before: DateTime<Utc>,
        token_id: &str,
    ) -> IngestResult<()> {
        self.push(QueuedEvent {
            payload,
            not_before: Some(not_before),
            token_id: token_id.to_owned(),
        })
    }

    fn push(&self, record: QueuedEvent) -> IngestResult<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(closed_error(&self.destination_id));
        }

        let mut line = serde_json::to_string(&record).map_err(|err| {
            ingest_error!(ErrorKind::SerializationFailed, "Failed to encode queue record", err)
        })?;
        line.push('\n');
        state
            .log
            .write_all(line.as_bytes())
            .and_then(|_| state.log.flush())
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to append queue record", err))?;

        state.pending.push_back(record);
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Removes and returns the head record, waiting until one is available.
    /// Returns [`ErrorKind::QueueClosed`] once the queue is closed and
    /// drained.
    pub async fn dequeue_block(&self) -> IngestResult<QueuedEvent> {
        loop {
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock();
                if let Some(record) = state.pending.pop_front() {
                    state.consumed += 1;
                    let consumed = state.consumed;
                    persist_offset_locked(&self.dir, &mut state, consumed);
                    return Ok(record);
                }
                if state.closed {
                    return Err(closed_error(&self.destination_id));
                }
            }

            notified.await;
        }
    }

    /// Number of records waiting in memory.
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue. Pending records stay on disk for the next start;
    /// blocked consumers are woken and observe [`ErrorKind::QueueClosed`].
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
        debug!(destination = %self.destination_id, "closed persistent queue");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

fn closed_error(destination_id: &str) -> IngestError {
    ingest_error!(ErrorKind::QueueClosed, "Queue is closed", destination_id)
}

fn read_offset(path: &Path) -> u64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

fn write_offset(path: &Path, offset: u64) -> IngestResult<()> {
    std::fs::write(path, offset.to_string())
        .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to persist queue offset", err))
}

fn persist_offset_locked(dir: &Path, state: &mut QueueState, consumed: u64) {
    if let Err(err) = write_offset(&dir.join(OFFSET_FILE), consumed) {
        // The offset is best-effort: losing it means re-delivery after a
        // crash, which downstream PK merge absorbs.
        warn!(error = %err, "failed to persist queue offset");
    }

    if consumed >= COMPACTION_THRESHOLD {
        let log_path = dir.join(LOG_FILE);
        match write_log(&log_path, state.pending.iter()) {
            Ok(()) => {
                if let Ok(log) = OpenOptions::new().append(true).open(&log_path) {
                    state.log = log;
                    state.consumed = 0;
                    let _ = write_offset(&dir.join(OFFSET_FILE), 0);
                }
            }
            Err(err) => warn!(error = %err, "queue compaction failed"),
        }
    }
}

fn write_log<'a>(
    path: &Path,
    records: impl Iterator<Item = &'a QueuedEvent>,
) -> IngestResult<()> {
    let mut file = File::create(path)
        .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to rewrite queue log", err))?;

    for record in records {
        let line = serde_json::to_string(record).map_err(|err| {
            ingest_error!(ErrorKind::SerializationFailed, "Failed to encode queue record", err)
        })?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to rewrite queue log", err))?;
    }

    file.flush()
        .and_then(|_| file.sync_all())
        .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to sync queue log", err))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: &str) -> Event {
        Event::new(
            json!({"eventn_ctx": {"event_id": id}})
                .as_object()
                .unwrap()
                .clone(),
        )
    }

    #[tokio::test]
    async fn fifo_order_is_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PersistentQueue::open(dir.path(), "dst").unwrap();

        queue.enqueue(event("1"), "tok").unwrap();
        queue.enqueue(event("2"), "tok").unwrap();
        queue.enqueue(event("3"), "tok").unwrap();

        for expected in ["1", "2", "3"] {
            let record = queue.dequeue_block().await.unwrap();
            assert_eq!(record.payload.event_id(), expected);
            assert!(record.not_before.is_none());
        }
    }

    #[tokio::test]
    async fn survives_restart() {
        let dir = tempfile::tempdir().unwrap();

        {
            let queue = PersistentQueue::open(dir.path(), "dst").unwrap();
            queue.enqueue(event("1"), "tok").unwrap();
            queue.enqueue(event("2"), "tok").unwrap();
            // Consume one so the offset is non-zero at "crash" time.
            queue.dequeue_block().await.unwrap();
        }

        let reopened = PersistentQueue::open(dir.path(), "dst").unwrap();
        assert_eq!(reopened.len(), 1);
        let record = reopened.dequeue_block().await.unwrap();
        assert_eq!(record.payload.event_id(), "2");
        assert_eq!(record.token_id, "tok");
    }

    #[tokio::test]
    async fn consume_timed_carries_not_before() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PersistentQueue::open(dir.path(), "dst").unwrap();

        let later = Utc::now() + chrono::Duration::seconds(20);
        queue.consume_timed(event("1"), later, "tok").unwrap();

        let record = queue.dequeue_block().await.unwrap();
        assert_eq!(record.not_before, Some(later));
    }

    #[tokio::test]
    async fn close_wakes_blocked_consumer() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PersistentQueue::open(dir.path(), "dst").unwrap();

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue_block().await })
        };

        // Give the consumer a chance to block.
        tokio::task::yield_now().await;
        queue.close();

        let err = consumer.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueClosed);
        assert!(queue.enqueue(event("1"), "tok").is_err());
    }

    #[tokio::test]
    async fn drains_pending_records_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PersistentQueue::open(dir.path(), "dst").unwrap();

        queue.enqueue(event("1"), "tok").unwrap();
        queue.close();

        // The already-enqueued record is still delivered.
        let record = queue.dequeue_block().await.unwrap();
        assert_eq!(record.payload.event_id(), "1");

        let err = queue.dequeue_block().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueClosed);
    }
}
