//! BigQuery sink adapter.
//!
//! DDL and schema reads go through SQL jobs; streaming inserts use the
//! tabledata insert API with per-row insert ids for dedup. Batch loads
//! stage NDJSON on GCS and run a `LOAD DATA` job when a bucket is
//! configured, and fall back to chunked streaming inserts otherwise.

use async_trait::async_trait;
use chrono::Utc;
use gcp_bigquery_client::Client;
use gcp_bigquery_client::client_builder::ClientBuilder;
use gcp_bigquery_client::error::BQError;
use gcp_bigquery_client::model::dataset::Dataset;
use gcp_bigquery_client::model::query_request::QueryRequest;
use gcp_bigquery_client::model::table_data_insert_all_request::TableDataInsertAllRequest;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use ingest::error::{ErrorKind, IngestResult};
use ingest::ingest_error;
use ingest::logfiles::StagedFileName;
use ingest::schema::DataType;
use ingest::sink::SinkAdapter;
use ingest::table::{SqlColumn, Table};
use ingest::types::Event;
use ingest_config::GoogleConfig;

use crate::stage::ObjectStage;

/// Streaming insert row cap per request.
const INSERT_ALL_BATCH: usize = 500;

/// BigQuery SQL types per logical type.
pub fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::String | DataType::Unknown => "STRING",
        DataType::Int64 => "INT64",
        DataType::Float64 => "FLOAT64",
        DataType::Timestamp => "TIMESTAMP",
        DataType::Bool => "BOOL",
    }
}

pub struct BigQueryAdapter {
    client: Client,
    project: String,
    dataset: String,
    stage: Option<ObjectStage>,
}

impl BigQueryAdapter {
    pub async fn connect(config: &GoogleConfig) -> IngestResult<Self> {
        config
            .validate()
            .map_err(|err| ingest_error!(ErrorKind::ValidationFailed, "Invalid Google config", err))?;

        let dataset = config.dataset.clone().unwrap_or_else(|| "default".to_owned());

        let client = ClientBuilder::new()
            .build_from_service_account_key_file(&config.key_file)
            .await
            .map_err(|err| {
                ingest_error!(ErrorKind::ValidationFailed, "Invalid BigQuery service account key")
                    .with_source(err)
            })?;

        let stage = match &config.bucket {
            Some(_) => Some(ObjectStage::gcs(config)?),
            None => None,
        };

        let adapter = Self {
            client,
            project: config.project.clone(),
            dataset,
            stage,
        };
        adapter.ensure_dataset().await?;

        Ok(adapter)
    }

    async fn ensure_dataset(&self) -> IngestResult<()> {
        let existing = self.client.dataset().get(&self.project, &self.dataset).await;
        match existing {
            Ok(_) => Ok(()),
            Err(BQError::ResponseError { error }) if error.error.code == 404 => {
                info!(dataset = %self.dataset, "creating BigQuery dataset");
                self.client
                    .dataset()
                    .create(Dataset::new(&self.project, &self.dataset))
                    .await
                    .map(|_| ())
                    .map_err(|err| {
                        ingest_error!(ErrorKind::DdlFailed, "Failed to create dataset").with_source(err)
                    })
            }
            Err(err) => {
                Err(ingest_error!(ErrorKind::ConnectionFailed, "Failed to read dataset").with_source(err))
            }
        }
    }

    fn full_table_name(&self, table_name: &str) -> String {
        format!("`{}.{}.{}`", self.project, self.dataset, table_name)
    }

    async fn run_query(&self, sql: String) -> IngestResult<gcp_bigquery_client::model::query_response::ResultSet> {
        debug!(query = %sql, "running BigQuery job");
        self.client
            .job()
            .query(&self.project, QueryRequest::new(sql.clone()))
            .await
            .map(gcp_bigquery_client::model::query_response::ResultSet::new_from_query_response)
            .map_err(|err| {
                ingest_error!(ErrorKind::QueryFailed, "BigQuery job failed", sql).with_source(err)
            })
    }

    async fn stream_rows(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        for chunk in rows.chunks(INSERT_ALL_BATCH) {
            let mut request = TableDataInsertAllRequest::new();
            for row in chunk {
                request
                    .add_row(
                        Some(Uuid::new_v4().to_string()),
                        Value::Object(row.as_map().clone()),
                    )
                    .map_err(|err| {
                        ingest_error!(ErrorKind::SerializationFailed, "Failed to encode row")
                            .with_source(err)
                    })?;
            }

            let response = self
                .client
                .tabledata()
                .insert_all(&self.project, &self.dataset, &table.name, request)
                .await
                .map_err(|err| {
                    ingest_error!(ErrorKind::QueryFailed, "BigQuery insert failed", table.name.clone())
                        .with_source(err)
                })?;

            if let Some(errors) = response.insert_errors
                && !errors.is_empty()
            {
                return Err(ingest_error!(
                    ErrorKind::QueryFailed,
                    "BigQuery rejected rows",
                    format!("table {}, {} row errors", table.name, errors.len())
                ));
            }
        }

        Ok(())
    }

    async fn load_via_stage(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        let Some(stage) = &self.stage else {
            return self.stream_rows(table, rows).await;
        };

        let file_name = StagedFileName {
            table: table.name.clone(),
            token_id: "load".to_owned(),
            rows: rows.len(),
            date: Utc::now(),
        }
        .render();

        stage.put_rows(&file_name, rows).await?;

        let load = format!(
            "LOAD DATA INTO {} FROM FILES (format = 'NEWLINE_DELIMITED_JSON', uris = ['{}'])",
            self.full_table_name(&table.name),
            stage.uri(&file_name)
        );
        let result = self.run_query(load).await.map(|_| ());

        let _ = stage.delete(&file_name).await;
        result
    }
}

#[async_trait]
impl SinkAdapter for BigQueryAdapter {
    fn sink_type(&self) -> &'static str {
        "bigquery"
    }

    async fn test_connection(&self) -> IngestResult<()> {
        self.run_query("SELECT 1".to_owned()).await.map(|_| ())
    }

    async fn get_table_schema(&self, table_name: &str) -> IngestResult<Table> {
        let sql = format!(
            "SELECT column_name, data_type FROM `{}.{}.INFORMATION_SCHEMA.COLUMNS` WHERE table_name = '{}'",
            self.project,
            self.dataset,
            table_name.replace('\'', "")
        );
        let mut result = self.run_query(sql).await?;

        let mut table = Table::new(table_name);
        while result.next_row() {
            let column = result
                .get_string_by_name("column_name")
                .ok()
                .flatten()
                .unwrap_or_default();
            let db_type = result
                .get_string_by_name("data_type")
                .ok()
                .flatten()
                .unwrap_or_default();
            if column.is_empty() {
                continue;
            }
            table
                .columns
                .insert(column, SqlColumn::new(db_type.clone(), data_type_from_db(&db_type)));
        }

        Ok(table)
    }

    async fn create_table(&self, table: &Table) -> IngestResult<()> {
        let columns = table
            .columns
            .iter()
            .map(|(name, column)| format!("`{name}` {}", column.sql_type))
            .collect::<Vec<_>>()
            .join(", ");

        self.run_query(format!(
            "CREATE TABLE {} ({columns})",
            self.full_table_name(&table.name)
        ))
        .await
        .map(|_| ())
    }

    async fn patch_table_schema(&self, patch: &Table) -> IngestResult<()> {
        for (name, column) in &patch.columns {
            self.run_query(format!(
                "ALTER TABLE {} ADD COLUMN `{name}` {}",
                self.full_table_name(&patch.name),
                column.sql_type
            ))
            .await?;
        }
        Ok(())
    }

    async fn insert(&self, table: &Table, row: &Event) -> IngestResult<()> {
        self.stream_rows(table, std::slice::from_ref(row)).await
    }

    async fn bulk_insert(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.load_via_stage(table, rows).await
    }

    async fn bulk_update(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        // BigQuery tables carry no primary key; dedup happens on the
        // insert-id and downstream materialization.
        self.bulk_insert(table, rows).await
    }

    async fn close(&self) -> IngestResult<()> {
        Ok(())
    }
}

fn data_type_from_db(db_type: &str) -> Option<DataType> {
    match db_type {
        "STRING" => Some(DataType::String),
        "INT64" => Some(DataType::Int64),
        "FLOAT64" => Some(DataType::Float64),
        "BOOL" => Some(DataType::Bool),
        "TIMESTAMP" | "DATETIME" => Some(DataType::Timestamp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bigquery_types_map_back() {
        assert_eq!(data_type_from_db("INT64"), Some(DataType::Int64));
        assert_eq!(data_type_from_db("TIMESTAMP"), Some(DataType::Timestamp));
        assert_eq!(data_type_from_db("GEOGRAPHY"), None);
    }

    #[test]
    fn logical_types_map_to_bigquery() {
        assert_eq!(sql_type(DataType::Unknown), "STRING");
        assert_eq!(sql_type(DataType::Bool), "BOOL");
    }
}
