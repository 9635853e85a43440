//! In-memory test doubles for the sink contracts.
//!
//! [`MockAdapter`] behaves like a small SQL sink: it keeps table schemas,
//! applies patches, and merges rows on the primary key the way a real
//! `bulk_update` would. Failures can be scripted per write call, which is
//! how the retry and fallback paths are exercised without a network.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{IngestError, IngestResult};
use crate::ingest_error;
use crate::schema::{BatchHeader, ParseFn};
use crate::sink::{SinkAdapter, Storage, StoreReport};
use crate::table::{SqlColumn, Table};
use crate::types::{Event, FailedEvent};

#[derive(Default)]
struct MockAdapterInner {
    tables: HashMap<String, Table>,
    rows: HashMap<String, Vec<Event>>,
    create_calls: usize,
    patch_calls: usize,
    insert_calls: usize,
    scripted_errors: VecDeque<IngestError>,
}

impl MockAdapterInner {
    fn next_scripted_error(&mut self) -> Option<IngestError> {
        self.scripted_errors.pop_front()
    }

    fn upsert(&mut self, table: &Table, row: Event) {
        let rows = self.rows.entry(table.name.clone()).or_default();

        if table.has_pk() {
            let key: Vec<_> = table
                .pk_fields
                .iter()
                .map(|f| row.as_map().get(f).cloned())
                .collect();
            if let Some(existing) = rows.iter_mut().find(|r| {
                table
                    .pk_fields
                    .iter()
                    .map(|f| r.as_map().get(f).cloned())
                    .collect::<Vec<_>>()
                    == key
            }) {
                *existing = row;
                return;
            }
        }

        rows.push(row);
    }
}

/// Scriptable in-memory sink adapter.
#[derive(Default)]
pub struct MockAdapter {
    inner: Mutex<MockAdapterInner>,
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an error returned by the next write call (insert or bulk).
    pub fn fail_next(&self, error: IngestError) {
        self.inner.lock().scripted_errors.push_back(error);
    }

    pub fn create_calls(&self) -> usize {
        self.inner.lock().create_calls
    }

    pub fn patch_calls(&self) -> usize {
        self.inner.lock().patch_calls
    }

    pub fn insert_calls(&self) -> usize {
        self.inner.lock().insert_calls
    }

    pub fn table(&self, name: &str) -> Option<Table> {
        self.inner.lock().tables.get(name).cloned()
    }

    pub fn rows(&self, table: &str) -> Vec<Event> {
        self.inner.lock().rows.get(table).cloned().unwrap_or_default()
    }

    /// Mutates a live schema behind the helper's back, simulating DDL from
    /// another node.
    pub fn add_column(&self, table: &str, column: &str, sql_type: &str) {
        let mut inner = self.inner.lock();
        if let Some(t) = inner.tables.get_mut(table) {
            t.columns
                .insert(column.to_owned(), SqlColumn::new(sql_type, None));
        }
    }
}

#[async_trait]
impl SinkAdapter for MockAdapter {
    fn sink_type(&self) -> &'static str {
        "mock"
    }

    async fn test_connection(&self) -> IngestResult<()> {
        Ok(())
    }

    async fn get_table_schema(&self, table_name: &str) -> IngestResult<Table> {
        let inner = self.inner.lock();
        Ok(inner
            .tables
            .get(table_name)
            .cloned()
            .unwrap_or_else(|| Table::new(table_name)))
    }

    async fn create_table(&self, table: &Table) -> IngestResult<()> {
        let mut inner = self.inner.lock();
        inner.create_calls += 1;
        inner.tables.insert(table.name.clone(), table.clone());
        Ok(())
    }

    async fn patch_table_schema(&self, patch: &Table) -> IngestResult<()> {
        let mut inner = self.inner.lock();
        inner.patch_calls += 1;

        let table = inner
            .tables
            .entry(patch.name.clone())
            .or_insert_with(|| Table::new(&patch.name));

        for (name, column) in &patch.columns {
            table
                .columns
                .entry(name.clone())
                .or_insert_with(|| column.clone());
        }

        if patch.delete_pk_fields {
            table.pk_fields.clear();
        }
        if !patch.pk_fields.is_empty() {
            table.pk_fields = patch.pk_fields.clone();
        }

        Ok(())
    }

    async fn insert(&self, table: &Table, row: &Event) -> IngestResult<()> {
        let mut inner = self.inner.lock();
        inner.insert_calls += 1;
        if let Some(err) = inner.next_scripted_error() {
            return Err(err);
        }
        inner.upsert(table, row.clone());
        Ok(())
    }

    async fn bulk_insert(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.next_scripted_error() {
            return Err(err);
        }
        let stored = inner.rows.entry(table.name.clone()).or_default();
        stored.extend(rows.iter().cloned());
        Ok(())
    }

    async fn bulk_update(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.next_scripted_error() {
            return Err(err);
        }
        for row in rows {
            inner.upsert(table, row.clone());
        }
        Ok(())
    }

    async fn close(&self) -> IngestResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockStorageInner {
    inserted: Vec<(String, Event)>,
    fallback: Vec<FailedEvent>,
    stored_files: Vec<String>,
    store_calls: Vec<(String, HashSet<String>)>,
    scripted_insert_errors: VecDeque<IngestError>,
    scripted_store_reports: VecDeque<StoreReport>,
    closed: bool,
}

/// Scriptable in-memory [`Storage`] for worker tests.
pub struct MockStorage {
    id: String,
    staging: bool,
    inner: Arc<Mutex<MockStorageInner>>,
}

impl MockStorage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            staging: false,
            inner: Arc::default(),
        }
    }

    pub fn staged(mut self) -> Self {
        self.staging = true;
        self
    }

    /// Queues an error returned by the next streaming insert.
    pub fn fail_next_insert(&self, error: IngestError) {
        self.inner.lock().scripted_insert_errors.push_back(error);
    }

    pub fn inserted(&self) -> Vec<(String, Event)> {
        self.inner.lock().inserted.clone()
    }

    pub fn fallback_events(&self) -> Vec<FailedEvent> {
        self.inner.lock().fallback.clone()
    }

    pub fn stored_files(&self) -> Vec<String> {
        self.inner.lock().stored_files.clone()
    }

    /// File name and skip set of every `store` call, in order.
    pub fn store_calls(&self) -> Vec<(String, HashSet<String>)> {
        self.inner.lock().store_calls.clone()
    }

    /// Queues the report returned by the next `store` call. Without a
    /// scripted report, `store` reports full success with no tables.
    pub fn script_store_report(&self, report: StoreReport) {
        self.inner.lock().scripted_store_reports.push_back(report);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[async_trait]
impl Storage for MockStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn sink_type(&self) -> &'static str {
        "mock"
    }

    fn is_staging(&self) -> bool {
        self.staging
    }

    async fn store(
        &self,
        file_name: &str,
        _payload: &[u8],
        already_uploaded: &HashSet<String>,
    ) -> IngestResult<StoreReport> {
        let mut inner = self.inner.lock();
        inner.stored_files.push(file_name.to_owned());
        inner
            .store_calls
            .push((file_name.to_owned(), already_uploaded.clone()));
        Ok(inner
            .scripted_store_reports
            .pop_front()
            .unwrap_or_default())
    }

    async fn store_with_parse_fn(
        &self,
        file_name: &str,
        payload: &[u8],
        already_uploaded: &HashSet<String>,
        _parse: ParseFn,
    ) -> IngestResult<StoreReport> {
        self.store(file_name, payload, already_uploaded).await
    }

    async fn sync_store(
        &self,
        _overridden_header: Option<&BatchHeader>,
        objects: Vec<Event>,
    ) -> IngestResult<usize> {
        Ok(objects.len())
    }

    async fn insert(&self, header: &BatchHeader, row: Event) -> IngestResult<()> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.scripted_insert_errors.pop_front() {
            return Err(err);
        }
        inner.inserted.push((header.table_name.clone(), row));
        Ok(())
    }

    async fn fallback(&self, events: &[FailedEvent]) {
        self.inner.lock().fallback.extend(events.iter().cloned());
    }

    async fn close(&self) -> IngestResult<()> {
        self.inner.lock().closed = true;
        Ok(())
    }
}

/// Convenience constructor for a connection-refused style transient error.
pub fn transient_error() -> IngestError {
    ingest_error!(
        crate::error::ErrorKind::QueryFailed,
        "Insert failed",
        "dial tcp 127.0.0.1:5432: connection refused"
    )
}

/// Convenience constructor for a permanent SQL error.
pub fn permanent_error() -> IngestError {
    ingest_error!(
        crate::error::ErrorKind::QueryFailed,
        "Insert failed",
        "pq: syntax error at or near \"VALUES\""
    )
}
