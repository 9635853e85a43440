use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;

/// Upload state of one table of one staged or fallback file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TableStatus {
    pub uploaded: bool,
    #[serde(default)]
    pub error: String,
}

/// destination id -> table name -> status.
type FileStatuses = HashMap<String, HashMap<String, TableStatus>>;

/// Per-file table-level progress, persisted as a `<file>.status` JSON
/// sidecar so a crashed run resumes without re-inserting tables that
/// already made it.
#[derive(Debug)]
pub struct StatusManager {
    dir: PathBuf,
    // Sidecar writes are small; the lock serializes read-modify-write.
    io: Mutex<()>,
}

impl StatusManager {
    pub fn new(dir: impl Into<PathBuf>) -> IngestResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to create status dir", err))?;
        Ok(Self {
            dir,
            io: Mutex::new(()),
        })
    }

    /// Table statuses recorded for `(file, destination)`.
    pub fn get_table_statuses(
        &self,
        file_name: &str,
        destination_id: &str,
    ) -> HashMap<String, TableStatus> {
        let _guard = self.io.lock();
        self.read(file_name)
            .remove(destination_id)
            .unwrap_or_default()
    }

    /// Records the outcome of one table upload.
    pub fn update_status(
        &self,
        file_name: &str,
        destination_id: &str,
        table_name: &str,
        error: Option<&str>,
    ) {
        let _guard = self.io.lock();
        let mut statuses = self.read(file_name);
        statuses
            .entry(destination_id.to_owned())
            .or_default()
            .insert(
                table_name.to_owned(),
                TableStatus {
                    uploaded: error.is_none(),
                    error: error.unwrap_or("").to_owned(),
                },
            );

        let path = self.status_path(file_name);
        match serde_json::to_vec_pretty(&statuses) {
            Ok(payload) => {
                if let Err(err) = std::fs::write(&path, payload) {
                    warn!(file = file_name, error = %err, "failed to persist upload status");
                }
            }
            Err(err) => warn!(file = file_name, error = %err, "failed to encode upload status"),
        }
    }

    /// Removes the sidecar once the file is fully processed and archived.
    pub fn clean_up(&self, file_name: &str) {
        let _guard = self.io.lock();
        let path = self.status_path(file_name);
        if path.exists()
            && let Err(err) = std::fs::remove_file(&path)
        {
            warn!(file = file_name, error = %err, "failed to remove status sidecar");
        }
    }

    fn read(&self, file_name: &str) -> FileStatuses {
        let path = self.status_path(file_name);
        match std::fs::read(&path) {
            Ok(payload) => serde_json::from_slice(&payload).unwrap_or_else(|err| {
                warn!(file = file_name, error = %err, "corrupt status sidecar, starting fresh");
                FileStatuses::default()
            }),
            Err(_) => FileStatuses::default(),
        }
    }

    fn status_path(&self, file_name: &str) -> PathBuf {
        self.dir.join(format!("{file_name}.status"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_survive_a_new_manager() {
        let dir = tempfile::tempdir().unwrap();

        {
            let manager = StatusManager::new(dir.path()).unwrap();
            manager.update_status("f.ndjson", "dst", "events", None);
            manager.update_status("f.ndjson", "dst", "users", Some("boom"));
        }

        // A fresh manager over the same dir sees the same state, which is
        // what makes a crashed batch run resumable.
        let manager = StatusManager::new(dir.path()).unwrap();
        let statuses = manager.get_table_statuses("f.ndjson", "dst");
        assert!(statuses["events"].uploaded);
        assert!(!statuses["users"].uploaded);
        assert_eq!(statuses["users"].error, "boom");
    }

    #[test]
    fn destinations_are_separate() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StatusManager::new(dir.path()).unwrap();
        manager.update_status("f.ndjson", "a", "events", None);
        assert!(manager.get_table_statuses("f.ndjson", "b").is_empty());
    }

    #[test]
    fn clean_up_removes_the_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StatusManager::new(dir.path()).unwrap();
        manager.update_status("f.ndjson", "dst", "events", None);
        manager.clean_up("f.ndjson");
        assert!(manager.get_table_statuses("f.ndjson", "dst").is_empty());
    }
}
