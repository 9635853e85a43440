//! S3 sink adapter: write-only object storage. There is no schema to
//! reconcile; every bulk write lands as one NDJSON object.

use async_trait::async_trait;
use chrono::Utc;

use ingest::error::IngestResult;
use ingest::logfiles::StagedFileName;
use ingest::sink::SinkAdapter;
use ingest::table::Table;
use ingest::types::Event;
use ingest_config::S3Config;

use crate::stage::ObjectStage;

pub struct S3Adapter {
    stage: ObjectStage,
}

impl S3Adapter {
    pub fn new(config: &S3Config) -> IngestResult<Self> {
        Ok(Self {
            stage: ObjectStage::s3(config)?,
        })
    }

    async fn write_object(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let file_name = StagedFileName {
            table: table.name.clone(),
            token_id: "batch".to_owned(),
            rows: rows.len(),
            date: Utc::now(),
        }
        .render();

        self.stage.put_rows(&file_name, rows).await
    }
}

#[async_trait]
impl SinkAdapter for S3Adapter {
    fn sink_type(&self) -> &'static str {
        "s3"
    }

    async fn test_connection(&self) -> IngestResult<()> {
        // Probe with an empty marker object; overwritten on every check.
        self.stage.put_bytes(".ingest-access-check", Vec::new()).await
    }

    async fn get_table_schema(&self, table_name: &str) -> IngestResult<Table> {
        Ok(Table::new(table_name))
    }

    async fn create_table(&self, _table: &Table) -> IngestResult<()> {
        Ok(())
    }

    async fn patch_table_schema(&self, _patch: &Table) -> IngestResult<()> {
        Ok(())
    }

    async fn insert(&self, table: &Table, row: &Event) -> IngestResult<()> {
        self.write_object(table, std::slice::from_ref(row)).await
    }

    async fn bulk_insert(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        self.write_object(table, rows).await
    }

    async fn bulk_update(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        self.write_object(table, rows).await
    }

    async fn close(&self) -> IngestResult<()> {
        Ok(())
    }
}
