use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::concurrency::ShutdownRx;
use crate::error::ErrorKind;
use crate::logfiles::{Archiver, StagedFileName, StatusManager, names::STAGED_EXTENSION};
use crate::sink::Storage;

/// One uploader task per batch destination.
///
/// Every tick the staging directory is scanned; each staged file is loaded
/// atomically into the sink, archived on success, left in place for the
/// next tick on failure, and moved to the failed directory once the retry
/// budget is spent. Before loading, the status manager is consulted so a
/// `(file, table)` pair that already made it is never inserted twice; this
/// is what lets a crashed run resume without duplicates.
pub struct BatchWorker {
    storage: Arc<dyn Storage>,
    staging_dir: PathBuf,
    failed_dir: PathBuf,
    status_manager: Arc<StatusManager>,
    archiver: Archiver,
    tick: Duration,
    retry_budget: u32,
    attempts: HashMap<String, u32>,
    shutdown: ShutdownRx,
}

impl BatchWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<dyn Storage>,
        staging_dir: PathBuf,
        failed_dir: PathBuf,
        status_manager: Arc<StatusManager>,
        archiver: Archiver,
        tick: Duration,
        retry_budget: u32,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            storage,
            staging_dir,
            failed_dir,
            status_manager,
            archiver,
            tick,
            retry_budget: retry_budget.max(1),
            attempts: HashMap::new(),
            shutdown,
        }
    }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let destination_id = self.storage.id().to_owned();
        info!(destination = %destination_id, tick = ?self.tick, "batch worker started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {}
                _ = self.shutdown.changed() => {}
            }
            if *self.shutdown.borrow() {
                break;
            }
            if self.storage.is_staging() {
                continue;
            }

            self.tick_once(&destination_id).await;
        }

        info!(destination = %destination_id, "batch worker stopped");
    }

    async fn tick_once(&mut self, destination_id: &str) {
        let mut staged = self.list_staged();
        staged.sort();

        for path in staged {
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_owned)
            else {
                continue;
            };

            let parsed = match StagedFileName::parse(&file_name) {
                Ok(parsed) => parsed,
                Err(err) if err.kind() == ErrorKind::MalformedFileName => {
                    // Terminal for this file: it can never be accounted for.
                    error!(destination = %destination_id, file = %file_name, error = %err, "malformed staged file name");
                    self.move_to_failed(&path, &file_name);
                    continue;
                }
                Err(err) => {
                    error!(destination = %destination_id, file = %file_name, error = %err, "failed to parse staged file name");
                    continue;
                }
            };

            let already_uploaded: HashSet<String> = self
                .status_manager
                .get_table_statuses(&file_name, destination_id)
                .into_iter()
                .filter(|(_, status)| status.uploaded)
                .map(|(table, _)| table)
                .collect();

            let payload = match std::fs::read(&path) {
                Ok(payload) => payload,
                Err(err) => {
                    error!(destination = %destination_id, file = %file_name, error = %err, "failed to read staged file");
                    continue;
                }
            };

            match self
                .storage
                .store(&file_name, &payload, &already_uploaded)
                .await
            {
                Ok(report) => {
                    for (table_name, result) in &report.per_table {
                        self.status_manager.update_status(
                            &file_name,
                            destination_id,
                            table_name,
                            result.error.as_deref(),
                        );
                    }

                    if report.all_succeeded() {
                        metrics::counter!("ingest_uploaded_rows_total", "destination" => destination_id.to_owned(), "token" => parsed.token_id.clone())
                            .increment(parsed.rows as u64);
                        info!(
                            destination = %destination_id,
                            file = %file_name,
                            rows = parsed.rows,
                            "staged file uploaded"
                        );

                        if let Err(err) = self.archiver.archive(&path) {
                            error!(destination = %destination_id, file = %file_name, error = %err, "failed to archive staged file");
                        } else {
                            self.status_manager.clean_up(&file_name);
                            self.attempts.remove(&file_name);
                        }
                    } else {
                        self.register_failure(destination_id, &path, &file_name);
                    }
                }
                Err(err) => {
                    error!(destination = %destination_id, file = %file_name, error = %err, "failed to store staged file");
                    self.register_failure(destination_id, &path, &file_name);
                }
            }
        }
    }

    fn list_staged(&self) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(&self.staging_dir) else {
            return Vec::new();
        };

        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e == STAGED_EXTENSION)
            })
            .collect()
    }

    fn register_failure(&mut self, destination_id: &str, path: &PathBuf, file_name: &str) {
        let attempts = self.attempts.entry(file_name.to_owned()).or_insert(0);
        *attempts += 1;

        if *attempts >= self.retry_budget {
            warn!(
                destination = %destination_id,
                file = %file_name,
                attempts = *attempts,
                "retry budget spent, moving staged file to failed dir"
            );
            self.move_to_failed(path, file_name);
            self.attempts.remove(file_name);
        }
    }

    fn move_to_failed(&self, path: &PathBuf, file_name: &str) {
        if let Err(err) = std::fs::create_dir_all(&self.failed_dir)
            .and_then(|_| std::fs::rename(path, self.failed_dir.join(file_name)))
        {
            error!(file = %file_name, error = %err, "failed to move staged file to failed dir");
        }
    }
}
