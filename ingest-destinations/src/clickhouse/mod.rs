//! ClickHouse sink adapter.
//!
//! Speaks the HTTP interface through the `clickhouse` client. DDL and
//! schema reads go to one node; inserts rotate across the configured DSNs.
//! In cluster mode every DDL statement carries `ON CLUSTER`, tables use the
//! replicated engine, and a `dist_<table>` Distributed shim is dropped and
//! recreated on every schema patch.

pub mod schema;

pub use schema::sql_type;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use clickhouse::Client;
use serde::Deserialize;
use tracing::debug;

use ingest::error::{ErrorKind, IngestResult};
use ingest::ingest_error;
use ingest::schema::DataType;
use ingest::sink::SinkAdapter;
use ingest::table::{SqlColumn, Table};
use ingest::types::Event;
use ingest_config::ClickHouseConfig;

use crate::values::{SqlValue, row_values};
use schema::{TableStatementFactory, columns_clause, dist_table_name};

const TABLE_SCHEMA_QUERY: &str =
    "SELECT name, type FROM system.columns WHERE database = ? AND table = ?";

#[derive(Debug, clickhouse::Row, Deserialize)]
struct ColumnRow {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

pub struct ClickHouseAdapter {
    clients: Vec<Client>,
    next_client: AtomicUsize,
    factory: TableStatementFactory,
    nullable_fields: Vec<String>,
}

impl ClickHouseAdapter {
    pub async fn connect(config: &ClickHouseConfig) -> IngestResult<Arc<Self>> {
        config
            .validate()
            .map_err(|err| ingest_error!(ErrorKind::ValidationFailed, "Invalid ClickHouse config", err))?;

        let clients = config
            .dsns
            .iter()
            .map(|dsn| {
                let mut client = Client::default()
                    .with_url(dsn)
                    .with_database(&config.db);
                if let Some(user) = &config.username {
                    client = client.with_user(user);
                }
                if let Some(password) = &config.password {
                    client = client.with_password(password.expose_secret());
                }
                client
            })
            .collect();

        let nullable_fields = config
            .engine
            .as_ref()
            .map(|engine| engine.nullable_fields.clone())
            .unwrap_or_default();

        let adapter = Arc::new(Self {
            clients,
            next_client: AtomicUsize::new(0),
            factory: TableStatementFactory::new(config),
            nullable_fields,
        });

        adapter.create_database().await?;
        Ok(adapter)
    }

    fn client(&self) -> &Client {
        let index = self.next_client.fetch_add(1, Ordering::Relaxed);
        &self.clients[index % self.clients.len()]
    }

    async fn create_database(&self) -> IngestResult<()> {
        let statement = format!(
            "CREATE DATABASE IF NOT EXISTS \"{}\"{}",
            self.factory.database(),
            self.factory.on_cluster_clause()
        );
        self.execute_ddl(&statement).await
    }

    async fn execute_ddl(&self, statement: &str) -> IngestResult<()> {
        debug!(ddl = statement, "executing DDL");
        self.client()
            .query(statement)
            .execute()
            .await
            .map_err(|err| ingest_error!(ErrorKind::DdlFailed, "ClickHouse DDL failed", statement).with_source(err))
    }

    /// Drops and recreates the Distributed shim. Serialized by the named
    /// DDL lock of the table helper; concurrent inserts during the window
    /// land on the underlying table unaffected.
    async fn recreate_distributed(&self, table_name: &str) -> IngestResult<()> {
        if let Some(drop) = self.factory.drop_distributed_statement(table_name) {
            self.execute_ddl(&drop).await?;
        }
        if let Some(create) = self.factory.create_distributed_statement(table_name) {
            self.execute_ddl(&create).await?;
        }
        Ok(())
    }

    fn render_insert(&self, table: &Table, rows: &[Event]) -> String {
        let columns: Vec<(&String, &SqlColumn)> = table.columns.iter().collect();

        let column_list = columns
            .iter()
            .map(|(name, _)| format!("\"{name}\""))
            .collect::<Vec<_>>()
            .join(", ");

        let tuples = rows
            .iter()
            .map(|row| {
                let rendered = row_values(row, &columns)
                    .iter()
                    .zip(&columns)
                    .map(|(value, (name, column))| {
                        let nullable = self.nullable_fields.iter().any(|f| f == *name);
                        render_value(value, &column.sql_type, nullable)
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({rendered})")
            })
            .collect::<Vec<_>>()
            .join(", ");

        format!(
            "INSERT INTO \"{}\".\"{}\" ({column_list}) VALUES {tuples}",
            self.factory.database(),
            table.name
        )
    }

    async fn insert_rows(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        if rows.is_empty() || table.columns.is_empty() {
            return Ok(());
        }

        let statement = self.render_insert(table, rows);
        self.client()
            .query(&statement)
            .execute()
            .await
            .map_err(|err| {
                ingest_error!(
                    ErrorKind::QueryFailed,
                    "ClickHouse insert failed",
                    format!("table {}, {} rows", table.name, rows.len())
                )
                .with_source(err)
            })
    }
}

#[async_trait]
impl SinkAdapter for ClickHouseAdapter {
    fn sink_type(&self) -> &'static str {
        "clickhouse"
    }

    async fn test_connection(&self) -> IngestResult<()> {
        self.client()
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map(|_| ())
            .map_err(|err| {
                ingest_error!(ErrorKind::ConnectionFailed, "ClickHouse connectivity check failed")
                    .with_source(err)
            })
    }

    async fn get_table_schema(&self, table_name: &str) -> IngestResult<Table> {
        let rows: Vec<ColumnRow> = self
            .client()
            .query(TABLE_SCHEMA_QUERY)
            .bind(self.factory.database())
            .bind(table_name)
            .fetch_all()
            .await
            .map_err(|err| {
                ingest_error!(ErrorKind::QueryFailed, "Failed to read table schema", table_name)
                    .with_source(err)
            })?;

        let mut table = Table::new(table_name);
        for row in rows {
            table.columns.insert(
                row.name,
                SqlColumn::new(
                    row.column_type.clone(),
                    data_type_from_db(&row.column_type),
                ),
            );
        }

        Ok(table)
    }

    async fn create_table(&self, table: &Table) -> IngestResult<()> {
        let clause = columns_clause(table, &self.nullable_fields);
        let statement = self.factory.create_table_statement(&table.name, &clause);
        self.execute_ddl(&statement).await?;

        self.recreate_distributed(&table.name).await
    }

    async fn patch_table_schema(&self, patch: &Table) -> IngestResult<()> {
        for (name, column) in &patch.columns {
            let nullable = self.nullable_fields.iter().any(|f| f == name);
            let column_type = if nullable {
                format!("Nullable({})", column.sql_type)
            } else {
                column.sql_type.clone()
            };

            self.execute_ddl(&format!(
                "ALTER TABLE \"{}\".\"{}\"{}ADD COLUMN \"{name}\" {column_type}",
                self.factory.database(),
                patch.name,
                self.factory.on_cluster_clause()
            ))
            .await?;
        }

        // The shim's schema is frozen at creation; recreate it so it picks
        // up the new columns.
        self.recreate_distributed(&patch.name).await
    }

    async fn insert(&self, table: &Table, row: &Event) -> IngestResult<()> {
        self.insert_rows(table, std::slice::from_ref(row)).await
    }

    async fn bulk_insert(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        self.insert_rows(table, rows).await
    }

    async fn bulk_update(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        // ReplacingMergeTree collapses rows sharing the ordering key, with
        // `_timestamp` as the version column; a merge is a plain insert.
        self.insert_rows(table, rows).await
    }

    async fn close(&self) -> IngestResult<()> {
        Ok(())
    }
}

/// Renders one value as a ClickHouse literal. Booleans become UInt8 0/1;
/// NULL is only emitted for explicitly nullable columns, other columns get
/// the type default.
fn render_value(value: &SqlValue, sql_type: &str, nullable: bool) -> String {
    match value {
        SqlValue::Null => {
            if nullable {
                "NULL".to_owned()
            } else {
                type_default(sql_type)
            }
        }
        SqlValue::Bool(b) => if *b { "1" } else { "0" }.to_owned(),
        SqlValue::Int(i) => i.to_string(),
        SqlValue::Float(f) => f.to_string(),
        SqlValue::Timestamp(ts) => format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S")),
        SqlValue::Text(s) => format!("'{}'", escape_string(s)),
    }
}

fn type_default(sql_type: &str) -> String {
    let base = sql_type
        .strip_prefix("Nullable(")
        .and_then(|t| t.strip_suffix(')'))
        .unwrap_or(sql_type);

    match base {
        "Int64" | "UInt8" | "Float64" => "0".to_owned(),
        "DateTime" => "'1970-01-01 00:00:00'".to_owned(),
        _ => "''".to_owned(),
    }
}

fn escape_string(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}

fn data_type_from_db(db_type: &str) -> Option<DataType> {
    let base = db_type
        .strip_prefix("Nullable(")
        .and_then(|t| t.strip_suffix(')'))
        .unwrap_or(db_type);

    match base {
        "String" => Some(DataType::String),
        "Int64" => Some(DataType::Int64),
        "Float64" => Some(DataType::Float64),
        "UInt8" => Some(DataType::Bool),
        "DateTime" => Some(DataType::Timestamp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn values_render_as_clickhouse_literals() {
        assert_eq!(render_value(&SqlValue::Bool(true), "UInt8", false), "1");
        assert_eq!(render_value(&SqlValue::Bool(false), "UInt8", false), "0");
        assert_eq!(
            render_value(&SqlValue::Text("O'Brien".into()), "String", false),
            "'O\\'Brien'"
        );
        assert_eq!(render_value(&SqlValue::Null, "Int64", false), "0");
        assert_eq!(render_value(&SqlValue::Null, "String", true), "NULL");
    }

    #[test]
    fn nullable_type_names_unwrap_for_defaults() {
        assert_eq!(type_default("Nullable(Int64)"), "0");
        assert_eq!(type_default("String"), "''");
    }

    #[test]
    fn db_types_map_back() {
        assert_eq!(data_type_from_db("Nullable(Float64)"), Some(DataType::Float64));
        assert_eq!(data_type_from_db("UInt8"), Some(DataType::Bool));
        assert_eq!(data_type_from_db("Array(String)"), None);
    }

    #[test]
    fn insert_statement_shape() {
        let mut table = Table::new("events");
        table
            .columns
            .insert("v".into(), SqlColumn::new("Int64", Some(DataType::Int64)));
        table.columns.insert(
            "name".into(),
            SqlColumn::new("String", Some(DataType::String)),
        );

        let config = ClickHouseConfig {
            dsns: vec!["http://localhost:8123".into()],
            db: "db".into(),
            username: None,
            password: None,
            cluster: None,
            engine: None,
        };
        let adapter = ClickHouseAdapter {
            clients: vec![Client::default()],
            next_client: AtomicUsize::new(0),
            factory: TableStatementFactory::new(&config),
            nullable_fields: Vec::new(),
        };

        let row = Event::new(json!({"v": 7, "name": "x"}).as_object().unwrap().clone());
        let statement = adapter.render_insert(&table, &[row]);
        assert_eq!(
            statement,
            "INSERT INTO \"db\".\"events\" (\"name\", \"v\") VALUES ('x', 7)"
        );
    }
}
