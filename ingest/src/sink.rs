//! The two contracts every destination is built from.
//!
//! A [`SinkAdapter`] speaks one sink's wire protocol: DDL, schema reads and
//! inserts. A [`Storage`] is the per-destination wrapper that owns the
//! adapter, the processor, the table helper and the fallback logger, and is
//! what the workers and the router see.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::IngestResult;
use crate::schema::{BatchHeader, ParseFn};
use crate::table::Table;
use crate::types::{Event, FailedEvent};

/// Capability contract of a single sink.
///
/// SQL sinks implement the full set. HTTP-API sinks (conversion APIs)
/// implement `insert` only; their DDL surface vacuously succeeds and their
/// `test_connection` doubles as the access check.
#[async_trait]
pub trait SinkAdapter: Send + Sync {
    /// Sink type name, e.g. `postgres`.
    fn sink_type(&self) -> &'static str;

    /// Verifies connectivity and credentials.
    async fn test_connection(&self) -> IngestResult<()>;

    /// Reads the live schema of `table_name`. A non-existent table is not
    /// an error: the returned table has no columns.
    async fn get_table_schema(&self, table_name: &str) -> IngestResult<Table>;

    /// Creates the table, including its primary key when configured.
    async fn create_table(&self, table: &Table) -> IngestResult<()>;

    /// Applies a patch: adds the patch's columns and reconciles the primary
    /// key (dropping it first when `delete_pk_fields` is set).
    async fn patch_table_schema(&self, patch: &Table) -> IngestResult<()>;

    /// Inserts a single row (streaming path).
    async fn insert(&self, table: &Table, row: &Event) -> IngestResult<()>;

    /// Inserts a batch of rows in one transaction. Used when the table has
    /// no primary key.
    async fn bulk_insert(&self, table: &Table, rows: &[Event]) -> IngestResult<()>;

    /// Merges a batch of rows in one transaction with conflict resolution
    /// on the primary key.
    async fn bulk_update(&self, table: &Table, rows: &[Event]) -> IngestResult<()>;

    /// Releases pools and clients.
    async fn close(&self) -> IngestResult<()>;
}

/// Outcome of storing one table group of a file payload.
#[derive(Debug)]
pub struct TableResult {
    pub rows: usize,
    pub error: Option<String>,
}

impl TableResult {
    pub fn ok(rows: usize) -> Self {
        TableResult { rows, error: None }
    }

    pub fn failed(rows: usize, error: impl ToString) -> Self {
        TableResult {
            rows,
            error: Some(error.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Per-table results plus failed-row accounting for one stored file.
#[derive(Debug, Default)]
pub struct StoreReport {
    pub per_table: HashMap<String, TableResult>,
    pub failed_rows: usize,
}

impl StoreReport {
    pub fn all_succeeded(&self) -> bool {
        self.per_table.values().all(TableResult::is_ok)
    }
}

/// A fully wired destination, as seen by the workers, the batch uploader
/// and the replay surface.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Destination id from the configuration.
    fn id(&self) -> &str;

    /// Sink type name.
    fn sink_type(&self) -> &'static str;

    /// A staged destination is validated and schema-prepared but accepts no
    /// writes.
    fn is_staging(&self) -> bool;

    /// Stores a newline-delimited JSON file payload, skipping tables listed
    /// in `already_uploaded`. Returns per-table results; an `Err` means the
    /// payload could not be processed at all.
    async fn store(
        &self,
        file_name: &str,
        payload: &[u8],
        already_uploaded: &HashSet<String>,
    ) -> IngestResult<StoreReport>;

    /// Same as [`Storage::store`] with an explicit line parser; the replay
    /// surface passes the fallback-envelope parser here.
    async fn store_with_parse_fn(
        &self,
        file_name: &str,
        payload: &[u8],
        already_uploaded: &HashSet<String>,
        parse: ParseFn,
    ) -> IngestResult<StoreReport>;

    /// Stores already-parsed objects with merge semantics, optionally under
    /// an overridden header. Returns the stored row count. Used by the
    /// recognized-users backfill.
    async fn sync_store(
        &self,
        overridden_header: Option<&BatchHeader>,
        objects: Vec<Event>,
    ) -> IngestResult<usize>;

    /// Ensures the header's table and inserts one processed row
    /// (streaming path).
    async fn insert(&self, header: &BatchHeader, row: Event) -> IngestResult<()>;

    /// Appends failed events to this destination's fallback log.
    async fn fallback(&self, events: &[FailedEvent]);

    /// Closes the adapter, the workers' loggers and the queue consumer.
    async fn close(&self) -> IngestResult<()>;
}
