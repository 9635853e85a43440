//! Redshift sink adapter: Postgres wire protocol plus S3 COPY for bulk
//! loads.

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use ingest::error::{ErrorKind, IngestResult};
use ingest::ingest_error;
use ingest::logfiles::StagedFileName;
use ingest::schema::DataType;
use ingest::sink::SinkAdapter;
use ingest::table::Table;
use ingest::types::Event;
use ingest_config::{DataSourceConfig, S3Config};

use crate::postgres::PostgresAdapter;
use crate::stage::ObjectStage;

/// Redshift SQL types per logical type. Strings use the widest varchar
/// because Redshift has no unbounded text type.
pub fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::String | DataType::Unknown => "character varying(65535)",
        DataType::Int64 => "bigint",
        DataType::Float64 => "double precision",
        DataType::Timestamp => "timestamp",
        DataType::Bool => "boolean",
    }
}

/// Redshift adapter. DDL, schema reads and streaming inserts ride the
/// Postgres layer; bulk loads stage NDJSON on S3 and COPY it in, falling
/// back to parameterized inserts when no stage is configured.
pub struct RedshiftAdapter {
    pg: PostgresAdapter,
    stage: Option<(ObjectStage, S3Config)>,
}

impl RedshiftAdapter {
    pub async fn connect(
        datasource: &DataSourceConfig,
        s3: Option<&S3Config>,
    ) -> IngestResult<Self> {
        let pg = PostgresAdapter::connect(datasource, "redshift").await?;

        let stage = match s3 {
            Some(config) => Some((ObjectStage::s3(config)?, config.clone())),
            None => None,
        };

        Ok(Self { pg, stage })
    }

    async fn copy_from_stage(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        let Some((stage, s3)) = &self.stage else {
            return self.pg.write_rows_tx(table, rows, false).await;
        };

        let file_name = StagedFileName {
            table: table.name.clone(),
            token_id: "copy".to_owned(),
            rows: rows.len(),
            date: Utc::now(),
        }
        .render();

        stage.put_rows(&file_name, rows).await?;

        let statement = copy_statement(
            &self.pg.qualified_name(&table.name),
            &stage.uri(&file_name),
            s3,
        );
        debug!(table = %table.name, rows = rows.len(), "copying staged rows into redshift");
        let copy_result = self.pg.execute_statement(&statement, &[]).await;

        // The staged object is transient either way; a delete failure only
        // leaks an object, it doesn't affect the load result.
        let _ = stage.delete(&file_name).await;

        copy_result.map_err(|err| {
            ingest_error!(
                ErrorKind::QueryFailed,
                "Redshift COPY failed",
                table.name.clone()
            )
            .with_source(err)
        })
    }

    /// Deletes rows matching the batch's primary keys, then bulk loads.
    /// Redshift has no ON CONFLICT; merge is delete-then-insert.
    async fn merge_rows(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        if !table.has_pk() {
            return self.copy_from_stage(table, rows).await;
        }

        let pk_fields: Vec<&String> = table.pk_fields.iter().collect();
        let mut params: Vec<Option<String>> = Vec::new();
        let mut tuples = Vec::with_capacity(rows.len());

        for row in rows {
            let mut placeholders = Vec::with_capacity(pk_fields.len());
            for field in &pk_fields {
                params.push(row.as_map().get(*field).map(|value| match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                }));
                placeholders.push(format!("${}", params.len()));
            }
            tuples.push(format!("({})", placeholders.join(", ")));
        }

        let key_list = pk_fields
            .iter()
            .map(|f| format!("\"{f}\""))
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!(
            "DELETE FROM {} WHERE ({key_list}) IN ({})",
            self.pg.qualified_name(&table.name),
            tuples.join(", ")
        );

        self.pg.execute_statement(&statement, &params).await?;
        self.copy_from_stage(table, rows).await
    }
}

#[async_trait]
impl SinkAdapter for RedshiftAdapter {
    fn sink_type(&self) -> &'static str {
        "redshift"
    }

    async fn test_connection(&self) -> IngestResult<()> {
        self.pg.test_connection().await
    }

    async fn get_table_schema(&self, table_name: &str) -> IngestResult<Table> {
        self.pg.get_table_schema(table_name).await
    }

    async fn create_table(&self, table: &Table) -> IngestResult<()> {
        self.pg.create_table(table).await
    }

    async fn patch_table_schema(&self, patch: &Table) -> IngestResult<()> {
        self.pg.patch_table_schema(patch).await
    }

    async fn insert(&self, table: &Table, row: &Event) -> IngestResult<()> {
        self.pg.insert(table, row).await
    }

    async fn bulk_insert(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.copy_from_stage(table, rows).await
    }

    async fn bulk_update(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        self.merge_rows(table, rows).await
    }

    async fn close(&self) -> IngestResult<()> {
        self.pg.close().await
    }
}

fn copy_statement(qualified: &str, uri: &str, s3: &S3Config) -> String {
    let credentials = match (&s3.access_key_id, &s3.secret_access_key) {
        (Some(key), Some(secret)) => format!(
            " ACCESS_KEY_ID '{key}' SECRET_ACCESS_KEY '{}'",
            secret.expose_secret()
        ),
        _ => String::new(),
    };

    format!(
        "COPY {qualified} FROM '{uri}'{credentials} REGION '{}' FORMAT AS JSON 'auto'",
        s3.region
    )
}
