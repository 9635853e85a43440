//! The per-destination storage wrapper: one adapter, one processor, one
//! table helper, one fallback logger, behind the [`Storage`] contract the
//! workers and the replay surface drive.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error};

use ingest::cache::EventsCache;
use ingest::error::{ErrorKind, IngestResult};
use ingest::fallback::AsyncLogger;
use ingest::ingest_error;
use ingest::schema::{BatchHeader, ParseFn, ProcessedGroup, Processor, parse_json};
use ingest::sink::{SinkAdapter, Storage, StoreReport, TableResult};
use ingest::table::TableHelper;
use ingest::types::{Event, FailedEvent};

pub struct DestinationStorage {
    id: String,
    sink_type: &'static str,
    adapter: Arc<dyn SinkAdapter>,
    table_helper: TableHelper,
    processor: Arc<Processor>,
    cache: Arc<EventsCache>,
    fallback_logger: Arc<AsyncLogger>,
    staged: bool,
}

impl DestinationStorage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        sink_type: &'static str,
        adapter: Arc<dyn SinkAdapter>,
        table_helper: TableHelper,
        processor: Arc<Processor>,
        cache: Arc<EventsCache>,
        fallback_logger: Arc<AsyncLogger>,
        staged: bool,
    ) -> Self {
        Self {
            id: id.into(),
            sink_type,
            adapter,
            table_helper,
            processor,
            cache,
            fallback_logger,
            staged,
        }
    }

    pub fn processor(&self) -> Arc<Processor> {
        Arc::clone(&self.processor)
    }

    /// Ensures the group's table and writes its rows in one transaction,
    /// merging on the primary key when one is configured.
    async fn store_group(&self, group: &ProcessedGroup) -> IngestResult<()> {
        let table = self.table_helper.map_table_schema(&group.header);
        let live = self.table_helper.ensure_table(&self.id, &table).await?;

        let start = Instant::now();
        if live.has_pk() {
            self.adapter.bulk_update(&live, &group.rows).await?;
        } else {
            self.adapter.bulk_insert(&live, &group.rows).await?;
        }
        metrics::histogram!(
            "ingest_store_duration_seconds",
            "destination" => self.id.clone(),
            "table" => live.name.clone()
        )
        .record(start.elapsed().as_secs_f64());

        debug!(
            destination = %self.id,
            table = %live.name,
            rows = group.rows.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "stored rows"
        );
        Ok(())
    }

    fn record_group_outcome(&self, group: &ProcessedGroup, error: Option<&str>) {
        for row in &group.rows {
            let event_id = row.event_id();
            match error {
                Some(err) => self.cache.error(&self.id, &event_id, err),
                None => self.cache.succeed(
                    &self.id,
                    &event_id,
                    Value::Object(row.as_map().clone()),
                    &group.header.table_name,
                ),
            }
        }
    }
}

#[async_trait]
impl Storage for DestinationStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn sink_type(&self) -> &'static str {
        self.sink_type
    }

    fn is_staging(&self) -> bool {
        self.staged
    }

    async fn store(
        &self,
        file_name: &str,
        payload: &[u8],
        already_uploaded: &HashSet<String>,
    ) -> IngestResult<StoreReport> {
        self.store_with_parse_fn(file_name, payload, already_uploaded, parse_json)
            .await
    }

    async fn store_with_parse_fn(
        &self,
        file_name: &str,
        payload: &[u8],
        already_uploaded: &HashSet<String>,
        parse: ParseFn,
    ) -> IngestResult<StoreReport> {
        let processed =
            self.processor
                .process_file_payload(file_name, payload, already_uploaded, parse)?;

        for failed in &processed.failed {
            self.cache.error(&self.id, &failed.event_id, &failed.error);
        }

        let mut report = StoreReport {
            failed_rows: processed.failed.len(),
            ..Default::default()
        };

        let mut all_stored = true;
        for group in &processed.groups {
            match self.store_group(group).await {
                Ok(()) => {
                    self.record_group_outcome(group, None);
                    report
                        .per_table
                        .insert(group.header.table_name.clone(), TableResult::ok(group.len()));
                }
                Err(err) => {
                    error!(
                        destination = %self.id,
                        table = %group.header.table_name,
                        file = file_name,
                        error = %err,
                        "failed to store table group"
                    );
                    all_stored = false;
                    self.record_group_outcome(group, Some(&err.to_string()));
                    report.per_table.insert(
                        group.header.table_name.clone(),
                        TableResult::failed(group.len(), err),
                    );
                }
            }
        }

        // Rows that failed processing reach the fallback log only when the
        // rest of the file landed; otherwise the whole file is retried and
        // they would be duplicated.
        if all_stored && !processed.failed.is_empty() {
            self.fallback(&processed.failed).await;
        }

        Ok(report)
    }

    async fn sync_store(
        &self,
        overridden_header: Option<&BatchHeader>,
        objects: Vec<Event>,
    ) -> IngestResult<usize> {
        let groups = self.processor.process_objects(objects)?;
        let rows_count = groups.iter().map(ProcessedGroup::len).sum();

        match overridden_header {
            Some(overridden) if !overridden.fields.is_empty() => {
                // Collapse table multiplexing: all rows land in the
                // overridden table, whose header picks up any new fields.
                let mut header = overridden.clone();
                let mut rows = Vec::with_capacity(rows_count);
                for group in groups {
                    for (field, data_type) in &group.header.fields {
                        header
                            .fields
                            .entry(field.clone())
                            .and_modify(|t| *t = t.widen(*data_type))
                            .or_insert(*data_type);
                    }
                    rows.extend(group.rows);
                }

                let table = self.table_helper.map_table_schema(&header);
                let live = self.table_helper.ensure_table(&self.id, &table).await?;
                self.adapter.bulk_update(&live, &rows).await?;
            }
            _ => {
                for group in &groups {
                    let mut header = group.header.clone();
                    if let Some(overridden) = overridden_header
                        && !overridden.table_name.is_empty()
                    {
                        header.table_name = overridden.table_name.clone();
                    }

                    let table = self.table_helper.map_table_schema(&header);
                    let live = self.table_helper.ensure_table(&self.id, &table).await?;
                    self.adapter.bulk_update(&live, &group.rows).await?;
                }
            }
        }

        Ok(rows_count)
    }

    async fn insert(&self, header: &BatchHeader, row: Event) -> IngestResult<()> {
        if self.staged {
            return Err(ingest_error!(
                ErrorKind::StagedDestination,
                "Staged destination refuses writes",
                self.id.clone()
            ));
        }

        let table = self.table_helper.map_table_schema(header);
        let live = self.table_helper.ensure_table(&self.id, &table).await?;

        match self.adapter.insert(&live, &row).await {
            Ok(()) => Ok(()),
            Err(err) => {
                // The live schema may have drifted under us; refresh it,
                // re-ensure and retry once before giving up.
                debug!(
                    destination = %self.id,
                    table = %live.name,
                    error = %err,
                    "insert failed, refreshing schema and retrying"
                );
                self.table_helper
                    .refresh_table_schema(&self.id, &table.name)
                    .await?;
                let live = self.table_helper.ensure_table(&self.id, &table).await?;
                self.adapter.insert(&live, &row).await
            }
        }
    }

    async fn fallback(&self, events: &[FailedEvent]) {
        for event in events {
            self.fallback_logger.consume_any(event).await;
        }
    }

    async fn close(&self) -> IngestResult<()> {
        self.fallback_logger.close().await;
        self.adapter.close().await
    }
}

impl std::fmt::Debug for DestinationStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationStorage")
            .field("id", &self.id)
            .field("sink_type", &self.sink_type)
            .field("staged", &self.staged)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest::coordination::InMemoryCoordination;
    use ingest::logfiles::RotatingWriter;
    use ingest::schema::{DataType, FieldMapper, Flattener, TableNameTemplate, TypeResolver};
    use ingest::test_utils::{MockAdapter, permanent_error};
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn sql_type(data_type: DataType) -> &'static str {
        match data_type {
            DataType::String | DataType::Unknown => "text",
            DataType::Int64 => "bigint",
            DataType::Float64 => "double precision",
            DataType::Timestamp => "timestamp",
            DataType::Bool => "boolean",
        }
    }

    fn storage_with(
        dir: &std::path::Path,
        adapter: Arc<MockAdapter>,
        pk: &[&str],
    ) -> DestinationStorage {
        let helper = TableHelper::new(
            Arc::clone(&adapter) as Arc<dyn SinkAdapter>,
            Arc::new(InMemoryCoordination::new()),
            pk.iter().map(|f| f.to_string()).collect::<BTreeSet<_>>(),
            sql_type,
            Default::default(),
            0,
        );
        let processor = Arc::new(Processor::new(
            "dst",
            TableNameTemplate::parse(Some("events")).unwrap(),
            FieldMapper::identity(),
            Vec::new(),
            Flattener::Full,
            TypeResolver::Full,
            false,
            0,
        ));
        let writer =
            RotatingWriter::new(dir, Duration::from_secs(3600), 0, |_| "failed.log".to_owned())
                .unwrap();

        DestinationStorage::new(
            "dst",
            "mock",
            adapter,
            helper,
            processor,
            Arc::new(EventsCache::default()),
            Arc::new(AsyncLogger::new(writer, 64)),
            false,
        )
    }

    fn line(id: &str, extra: serde_json::Value) -> String {
        let mut map = extra.as_object().unwrap().clone();
        map.insert("eventn_ctx".into(), json!({"event_id": id}));
        serde_json::to_string(&map).unwrap()
    }

    #[tokio::test]
    async fn store_groups_and_bulk_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let storage = storage_with(dir.path(), Arc::clone(&adapter), &[]);

        let payload = format!(
            "{}\n{}\n",
            line("1", json!({"v": 1})),
            line("2", json!({"v": 2}))
        );
        let report = storage
            .store("f.ndjson", payload.as_bytes(), &HashSet::new())
            .await
            .unwrap();

        assert!(report.all_succeeded());
        assert_eq!(report.per_table["events"].rows, 2);
        assert_eq!(adapter.rows("events").len(), 2);
        assert!(adapter.table("events").is_some());
    }

    #[tokio::test]
    async fn pk_merge_collapses_duplicate_rows() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let storage = storage_with(dir.path(), Arc::clone(&adapter), &["email"]);

        let mut payload = String::new();
        for _ in 0..5 {
            payload.push_str(&line("1", json!({"email": "a@x", "name": "A"})));
            payload.push('\n');
        }

        storage
            .store("f.ndjson", payload.as_bytes(), &HashSet::new())
            .await
            .unwrap();

        assert_eq!(adapter.rows("events").len(), 1);
    }

    #[tokio::test]
    async fn type_widening_across_stores() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let storage = storage_with(dir.path(), Arc::clone(&adapter), &[]);

        storage
            .store(
                "a.ndjson",
                format!("{}\n", line("1", json!({"v": 1}))).as_bytes(),
                &HashSet::new(),
            )
            .await
            .unwrap();
        storage
            .store(
                "b.ndjson",
                format!("{}\n", line("2", json!({"v": 1.5}))).as_bytes(),
                &HashSet::new(),
            )
            .await
            .unwrap();

        // Both rows present; the column was created as bigint and kept.
        assert_eq!(adapter.rows("events").len(), 2);
        let table = adapter.table("events").unwrap();
        assert!(table.columns.contains_key("v"));
    }

    #[tokio::test]
    async fn failed_table_blocks_fallback_of_bad_rows() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let storage = storage_with(dir.path(), Arc::clone(&adapter), &[]);

        adapter.fail_next(permanent_error());
        let payload = format!("{}\nnot json\n", line("1", json!({"v": 1})));
        let report = storage
            .store("f.ndjson", payload.as_bytes(), &HashSet::new())
            .await
            .unwrap();

        assert!(!report.all_succeeded());
        assert_eq!(report.failed_rows, 1);
    }

    #[tokio::test]
    async fn staged_storage_refuses_streaming_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let mut storage = storage_with(dir.path(), adapter, &[]);
        storage.staged = true;

        let header = BatchHeader {
            table_name: "events".into(),
            fields: [("v".to_owned(), DataType::Int64)].into(),
        };
        let err = storage.insert(&header, Event::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StagedDestination);
    }

    #[tokio::test]
    async fn insert_retries_after_schema_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(MockAdapter::new());
        let storage = storage_with(dir.path(), Arc::clone(&adapter), &[]);

        let header = BatchHeader {
            table_name: "events".into(),
            fields: [
                ("eventn_ctx_event_id".to_owned(), DataType::String),
                ("v".to_owned(), DataType::Int64),
            ]
            .into(),
        };
        let row = Event::new(
            json!({"eventn_ctx_event_id": "1", "v": 7})
                .as_object()
                .unwrap()
                .clone(),
        );

        adapter.fail_next(permanent_error());
        storage.insert(&header, row).await.unwrap();

        assert_eq!(adapter.insert_calls(), 2);
        assert_eq!(adapter.rows("events").len(), 1);
    }
}
