//! Postgres sink adapter. Also the wire layer for Redshift, which speaks
//! the Postgres protocol.

use std::collections::BTreeSet;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_postgres::NoTls;
use tracing::{debug, warn};

use ingest::error::{ErrorKind, IngestResult};
use ingest::ingest_error;
use ingest::schema::DataType;
use ingest::sink::SinkAdapter;
use ingest::table::{SqlColumn, Table};
use ingest::types::Event;
use ingest_config::DataSourceConfig;

use crate::values::{SqlValue, row_values};

/// Postgres wire parameter cap; bulk statements are split to stay under it.
pub const PARAMETER_LIMIT: usize = 65_535;

const TABLE_SCHEMA_QUERY: &str = "SELECT column_name, data_type \
     FROM information_schema.columns \
     WHERE table_schema = $1 AND table_name = $2";

const PRIMARY_KEY_QUERY: &str = "SELECT a.attname \
     FROM pg_index i \
     JOIN pg_class c ON c.oid = i.indrelid \
     JOIN pg_namespace n ON n.oid = c.relnamespace \
     JOIN pg_attribute a ON a.attrelid = c.oid AND a.attnum = ANY(i.indkey) \
     WHERE n.nspname = $1 AND c.relname = $2 AND i.indisprimary";

/// Postgres SQL types per logical type.
pub fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::String | DataType::Unknown => "text",
        DataType::Int64 => "bigint",
        DataType::Float64 => "double precision",
        DataType::Timestamp => "timestamp",
        DataType::Bool => "boolean",
    }
}

/// Adapter over one Postgres connection.
///
/// All values are bound as text parameters and cast server-side per column
/// (`$n::text::bigint`), so the explicit cast hints from the mapping stage
/// and the widened column types coerce uniformly.
pub struct PostgresAdapter {
    client: Mutex<tokio_postgres::Client>,
    schema: String,
    sink_type: &'static str,
}

impl PostgresAdapter {
    /// Connects and ensures the target db schema exists.
    pub async fn connect(config: &DataSourceConfig, sink_type: &'static str) -> IngestResult<Self> {
        config
            .validate()
            .map_err(|err| ingest_error!(ErrorKind::ValidationFailed, "Invalid datasource config", err))?;

        let schema = config.schema.clone().unwrap_or_else(|| "public".to_owned());
        let port = config.port.unwrap_or(5432);

        let mut pg_config = tokio_postgres::Config::new();
        pg_config
            .host(&config.host)
            .port(port)
            .dbname(&config.db)
            .user(&config.username)
            .password(config.password());
        for (key, value) in &config.parameters {
            if key.as_str() == "connect_timeout"
                && let Ok(secs) = value.parse()
            {
                pg_config.connect_timeout(std::time::Duration::from_secs(secs));
            }
        }

        let (client, connection) = pg_config.connect(NoTls).await.map_err(|err| {
            ingest_error!(
                ErrorKind::ConnectionFailed,
                "Failed to connect to Postgres",
                format!("{}:{port}/{}", config.host, config.db)
            )
            .with_source(err)
        })?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                warn!(error = %err, "postgres connection terminated");
            }
        });

        let adapter = Self {
            client: Mutex::new(client),
            schema,
            sink_type,
        };
        adapter.create_db_schema().await?;

        Ok(adapter)
    }

    /// Issues `CREATE SCHEMA IF NOT EXISTS`.
    pub async fn create_db_schema(&self) -> IngestResult<()> {
        let statement = format!("CREATE SCHEMA IF NOT EXISTS {}", quote(&self.schema));
        self.execute_ddl(&statement).await
    }

    /// Executes one statement outside a transaction. Used by the Redshift
    /// wrapper for COPY and DELETE statements.
    pub(crate) async fn execute_statement(
        &self,
        statement: &str,
        params: &[Option<String>],
    ) -> IngestResult<()> {
        let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = params
            .iter()
            .map(|value| value as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();

        let client = self.client.lock().await;
        client
            .execute(statement, &refs)
            .await
            .map(|_| ())
            .map_err(|err| {
                ingest_error!(ErrorKind::QueryFailed, "Statement failed").with_source(err)
            })
    }

    /// Fully qualified, quoted table name.
    pub(crate) fn qualified_name(&self, table_name: &str) -> String {
        self.qualified(table_name)
    }

    /// Parameterized multi-row write, exposed for the Redshift wrapper.
    pub(crate) async fn write_rows_tx(
        &self,
        table: &Table,
        rows: &[Event],
        merge: bool,
    ) -> IngestResult<()> {
        self.write_rows(table, rows, merge).await
    }

    async fn execute_ddl(&self, statement: &str) -> IngestResult<()> {
        debug!(sink = self.sink_type, ddl = statement, "executing DDL");
        let client = self.client.lock().await;
        client
            .batch_execute(statement)
            .await
            .map_err(|err| ingest_error!(ErrorKind::DdlFailed, "DDL failed", statement).with_source(err))
    }

    fn qualified(&self, table_name: &str) -> String {
        format!("{}.{}", quote(&self.schema), quote(table_name))
    }

    fn insert_statement<'t>(
        &self,
        table: &'t Table,
        row_count: usize,
    ) -> (String, Vec<(&'t String, &'t SqlColumn)>) {
        let columns: Vec<(&String, &SqlColumn)> = table.columns.iter().collect();

        let column_list = columns
            .iter()
            .map(|(name, _)| quote(name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut tuples = Vec::with_capacity(row_count);
        let mut param = 1;
        for _ in 0..row_count {
            let placeholders = columns
                .iter()
                .map(|(_, column)| {
                    let p = placeholder(param, &column.sql_type);
                    param += 1;
                    p
                })
                .collect::<Vec<_>>()
                .join(", ");
            tuples.push(format!("({placeholders})"));
        }

        let statement = format!(
            "INSERT INTO {} ({column_list}) VALUES {}",
            self.qualified(&table.name),
            tuples.join(", ")
        );

        (statement, columns)
    }

    fn merge_clause(table: &Table, columns: &[(&String, &SqlColumn)]) -> String {
        let updates = columns
            .iter()
            .map(|(name, _)| format!("{0} = excluded.{0}", quote(name)))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            " ON CONFLICT ON CONSTRAINT {} DO UPDATE SET {updates}",
            quote(&pk_constraint(&table.name))
        )
    }

    async fn write_rows(&self, table: &Table, rows: &[Event], merge: bool) -> IngestResult<()> {
        if rows.is_empty() || table.columns.is_empty() {
            return Ok(());
        }

        let per_row = table.columns.len();
        let rows_per_batch = (PARAMETER_LIMIT / per_row).max(1);

        let mut client = self.client.lock().await;
        let tx = client
            .transaction()
            .await
            .map_err(|err| ingest_error!(ErrorKind::QueryFailed, "Failed to open transaction").with_source(err))?;

        for chunk in rows.chunks(rows_per_batch) {
            let (mut statement, columns) = self.insert_statement(table, chunk.len());
            if merge {
                statement.push_str(&Self::merge_clause(table, &columns));
            }

            let rendered: Vec<Option<String>> = chunk
                .iter()
                .flat_map(|row| {
                    row_values(row, &columns)
                        .iter()
                        .map(SqlValue::render)
                        .collect::<Vec<_>>()
                })
                .collect();
            let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = rendered
                .iter()
                .map(|value| value as &(dyn tokio_postgres::types::ToSql + Sync))
                .collect();

            if let Err(err) = tx.execute(statement.as_str(), &params).await {
                // Transaction drops on return, rolling back every chunk.
                return Err(ingest_error!(
                    ErrorKind::QueryFailed,
                    "Bulk write failed",
                    format!("table {}, {} rows", table.name, chunk.len())
                )
                .with_source(err));
            }
        }

        tx.commit()
            .await
            .map_err(|err| ingest_error!(ErrorKind::QueryFailed, "Failed to commit transaction").with_source(err))
    }
}

#[async_trait]
impl SinkAdapter for PostgresAdapter {
    fn sink_type(&self) -> &'static str {
        self.sink_type
    }

    async fn test_connection(&self) -> IngestResult<()> {
        let client = self.client.lock().await;
        client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|err| {
                ingest_error!(ErrorKind::ConnectionFailed, "Postgres connectivity check failed")
                    .with_source(err)
            })
    }

    async fn get_table_schema(&self, table_name: &str) -> IngestResult<Table> {
        let client = self.client.lock().await;

        let rows = client
            .query(TABLE_SCHEMA_QUERY, &[&self.schema, &table_name])
            .await
            .map_err(|err| {
                ingest_error!(ErrorKind::QueryFailed, "Failed to read table schema", table_name)
                    .with_source(err)
            })?;

        let mut table = Table::new(table_name);
        for row in rows {
            let column: String = row.get(0);
            let db_type: String = row.get(1);
            table.columns.insert(
                column,
                SqlColumn::new(db_type.clone(), data_type_from_db(&db_type)),
            );
        }

        if table.exists() {
            let pk_rows = client
                .query(PRIMARY_KEY_QUERY, &[&self.schema, &table_name])
                .await
                .map_err(|err| {
                    ingest_error!(ErrorKind::QueryFailed, "Failed to read primary key", table_name)
                        .with_source(err)
                })?;
            table.pk_fields = pk_rows
                .iter()
                .map(|row| row.get::<_, String>(0))
                .collect::<BTreeSet<String>>();
        }

        Ok(table)
    }

    async fn create_table(&self, table: &Table) -> IngestResult<()> {
        let columns = table
            .columns
            .iter()
            .map(|(name, column)| format!("{} {}", quote(name), column.sql_type))
            .collect::<Vec<_>>()
            .join(", ");

        self.execute_ddl(&format!(
            "CREATE TABLE {} ({columns})",
            self.qualified(&table.name)
        ))
        .await?;

        if table.has_pk() {
            self.execute_ddl(&add_pk_statement(&self.qualified(&table.name), table))
                .await?;
        }

        Ok(())
    }

    async fn patch_table_schema(&self, patch: &Table) -> IngestResult<()> {
        let qualified = self.qualified(&patch.name);

        for (name, column) in &patch.columns {
            self.execute_ddl(&format!(
                "ALTER TABLE {qualified} ADD COLUMN {} {}",
                quote(name),
                column.sql_type
            ))
            .await?;
        }

        if patch.delete_pk_fields {
            self.execute_ddl(&format!(
                "ALTER TABLE {qualified} DROP CONSTRAINT IF EXISTS {}",
                quote(&pk_constraint(&patch.name))
            ))
            .await?;
        }
        if patch.has_pk() {
            self.execute_ddl(&add_pk_statement(&qualified, patch)).await?;
        }

        Ok(())
    }

    async fn insert(&self, table: &Table, row: &Event) -> IngestResult<()> {
        let (statement, columns) = self.insert_statement(table, 1);
        let rendered: Vec<Option<String>> = row_values(row, &columns)
            .iter()
            .map(SqlValue::render)
            .collect();
        let params: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> = rendered
            .iter()
            .map(|value| value as &(dyn tokio_postgres::types::ToSql + Sync))
            .collect();

        let client = self.client.lock().await;
        client
            .execute(statement.as_str(), &params)
            .await
            .map(|_| ())
            .map_err(|err| {
                ingest_error!(ErrorKind::QueryFailed, "Insert failed", table.name.clone())
                    .with_source(err)
            })
    }

    async fn bulk_insert(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        self.write_rows(table, rows, false).await
    }

    async fn bulk_update(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        self.write_rows(table, rows, true).await
    }

    async fn close(&self) -> IngestResult<()> {
        // Dropping the client ends the connection task.
        Ok(())
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', ""))
}

fn placeholder(index: usize, sql_type: &str) -> String {
    if sql_type.eq_ignore_ascii_case("text") {
        format!("${index}")
    } else {
        format!("${index}::text::{sql_type}")
    }
}

fn pk_constraint(table_name: &str) -> String {
    format!("{table_name}_pk")
}

fn add_pk_statement(qualified: &str, table: &Table) -> String {
    let fields = table
        .pk_fields
        .iter()
        .map(|field| quote(field))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "ALTER TABLE {qualified} ADD CONSTRAINT {} PRIMARY KEY ({fields})",
        quote(&pk_constraint(&table.name))
    )
}

/// Maps a Postgres catalog type name back onto a logical type. Unknown
/// types stay untyped; diffing only cares about column presence.
fn data_type_from_db(db_type: &str) -> Option<DataType> {
    match db_type {
        "text" | "character varying" | "varchar" => Some(DataType::String),
        "bigint" | "integer" | "smallint" => Some(DataType::Int64),
        "double precision" | "numeric" | "real" => Some(DataType::Float64),
        "boolean" => Some(DataType::Bool),
        t if t.starts_with("timestamp") => Some(DataType::Timestamp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_cast_server_side() {
        assert_eq!(placeholder(1, "text"), "$1");
        assert_eq!(placeholder(2, "bigint"), "$2::text::bigint");
        assert_eq!(placeholder(3, "double precision"), "$3::text::double precision");
    }

    #[test]
    fn pk_statement_names_the_constraint() {
        let mut table = Table::new("events");
        table.pk_fields.insert("email".to_owned());
        let statement = add_pk_statement("\"public\".\"events\"", &table);
        assert_eq!(
            statement,
            "ALTER TABLE \"public\".\"events\" ADD CONSTRAINT \"events_pk\" PRIMARY KEY (\"email\")"
        );
    }

    #[test]
    fn db_types_map_back_to_logical_types() {
        assert_eq!(data_type_from_db("bigint"), Some(DataType::Int64));
        assert_eq!(
            data_type_from_db("timestamp without time zone"),
            Some(DataType::Timestamp)
        );
        assert_eq!(data_type_from_db("uuid"), None);
    }

    #[test]
    fn quoting_strips_embedded_quotes() {
        assert_eq!(quote("weird\"name"), "\"weirdname\"");
    }
}
