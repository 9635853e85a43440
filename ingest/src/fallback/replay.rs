use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::bail;
use crate::error::{ErrorKind, IngestError, IngestResult};
use crate::ingest_error;
use crate::logfiles::{
    ARCHIVE_DIR, Archiver, FAILED_DIR, FALLBACK_PREFIX, FallbackFileName, StatusManager,
    TableStatus,
};
use crate::routing::DestinationRegistry;
use crate::schema::{parse_fallback, parse_json};

/// Operator-initiated replay of fallback logs.
///
/// A fallback file is replayed at most once at a time (per-file in-process
/// lock), previously uploaded tables are skipped via the status manager,
/// and a fully replayed file is archived. Partial failure leaves the file
/// in place and reports every table error at once.
pub struct FallbackService {
    fallback_dir: PathBuf,
    status_manager: StatusManager,
    archiver: Archiver,
    registry: Arc<DestinationRegistry>,
    locks: Mutex<HashSet<String>>,
}

impl FallbackService {
    pub fn new(events_dir: &Path, registry: Arc<DestinationRegistry>) -> IngestResult<Self> {
        let fallback_dir = events_dir.join(FAILED_DIR);
        std::fs::create_dir_all(&fallback_dir)
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to create fallback dir", err))?;

        Ok(Self {
            status_manager: StatusManager::new(&fallback_dir)?,
            archiver: Archiver::new(events_dir.join(ARCHIVE_DIR))?,
            fallback_dir,
            registry,
            locks: Mutex::new(HashSet::new()),
        })
    }

    /// Replays one fallback file into a destination.
    ///
    /// `destination_id` may be empty, in which case it is recovered from
    /// the file name. With `raw_mode` the file is treated as plain event
    /// lines instead of [`crate::types::FailedEvent`] envelopes.
    pub async fn replay(
        &self,
        file_name: &str,
        destination_id: &str,
        raw_mode: bool,
    ) -> IngestResult<()> {
        if file_name.is_empty() {
            bail!(ErrorKind::ValidationFailed, "File name can't be empty");
        }

        // Absolute paths are accepted as-is; bare names resolve into the
        // fallback directory.
        let (file_path, file_name) = if Path::new(file_name).is_absolute() {
            let path = PathBuf::from(file_name);
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
                .ok_or_else(|| {
                    ingest_error!(ErrorKind::MalformedFileName, "Invalid file path", file_name)
                })?;
            (path, name)
        } else {
            (self.fallback_dir.join(file_name), file_name.to_owned())
        };

        let _lock = FileLock::acquire(&self.locks, &file_name)?;

        let payload = std::fs::read(&file_path)
            .map_err(|err| ingest_error!(ErrorKind::Io, "Failed to read fallback file", err))?;

        let destination_id = if destination_id.is_empty() {
            FallbackFileName::parse(&file_name)?.destination_id
        } else {
            destination_id.to_owned()
        };

        let Some(proxy) = self.registry.storage_by_id(&destination_id) else {
            bail!(ErrorKind::DestinationNotFound, "Unknown destination", destination_id);
        };
        let Some(storage) = proxy.get() else {
            bail!(
                ErrorKind::DestinationNotReady,
                "Destination hasn't been initialized yet",
                destination_id
            );
        };
        if storage.is_staging() {
            bail!(
                ErrorKind::StagedDestination,
                "Staged destinations only support dry-run",
                destination_id
            );
        }

        let already_uploaded: HashSet<String> = self
            .status_manager
            .get_table_statuses(&file_name, storage.id())
            .into_iter()
            .filter(|(_, status)| status.uploaded)
            .map(|(table, _)| table)
            .collect();

        let parse = if raw_mode { parse_json } else { parse_fallback };

        let report = storage
            .store_with_parse_fn(&file_name, &payload, &already_uploaded, parse)
            .await?;

        let mut table_errors = Vec::new();
        for (table_name, result) in &report.per_table {
            self.status_manager.update_status(
                &file_name,
                storage.id(),
                table_name,
                result.error.as_deref(),
            );
            if let Some(err) = &result.error {
                error!(
                    destination = %storage.id(),
                    table = %table_name,
                    file = %file_name,
                    error = %err,
                    "replay failed for table"
                );
                table_errors.push(ingest_error!(
                    ErrorKind::QueryFailed,
                    "Replay failed for table",
                    format!("{table_name}: {err}")
                ));
            }
        }

        if table_errors.is_empty() {
            info!(destination = %storage.id(), file = %file_name, "fallback file replayed");
            self.archiver.archive(&file_path)?;
            self.status_manager.clean_up(&file_name);
            Ok(())
        } else {
            Err(IngestError::from_many(table_errors, "Replay partially failed"))
        }
    }

    /// Fallback files currently on disk, optionally filtered by destination.
    pub fn file_statuses(&self, destination_filter: Option<&str>) -> Vec<FallbackFileStatus> {
        let mut out = Vec::new();

        let Ok(entries) = std::fs::read_dir(&self.fallback_dir) else {
            return out;
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(FALLBACK_PREFIX) {
                continue;
            }

            let Ok(parsed) = FallbackFileName::parse(name) else {
                error!(file = name, "malformed fallback file name");
                continue;
            };

            if let Some(filter) = destination_filter
                && parsed.destination_id != filter
            {
                continue;
            }

            let tables = self
                .status_manager
                .get_table_statuses(name, &parsed.destination_id);

            out.push(FallbackFileStatus {
                file_name: name.to_owned(),
                destination_id: parsed.destination_id,
                tables,
            });
        }

        out
    }
}

/// Per-file status view exposed to operators.
#[derive(Debug)]
pub struct FallbackFileStatus {
    pub file_name: String,
    pub destination_id: String,
    pub tables: std::collections::HashMap<String, TableStatus>,
}

/// In-process per-file lock, released on drop.
struct FileLock<'a> {
    locks: &'a Mutex<HashSet<String>>,
    file_name: String,
}

impl<'a> FileLock<'a> {
    fn acquire(locks: &'a Mutex<HashSet<String>>, file_name: &str) -> IngestResult<Self> {
        let mut held = locks.lock();
        if !held.insert(file_name.to_owned()) {
            bail!(
                ErrorKind::FileAlreadyLocked,
                "File is already being replayed",
                file_name
            );
        }
        Ok(Self {
            locks,
            file_name: file_name.to_owned(),
        })
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        self.locks.lock().remove(&self.file_name);
    }
}
