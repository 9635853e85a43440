//! MySQL sink adapter over a sqlx connection pool.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions};
use sqlx::{Executor, Row};
use tracing::debug;

use ingest::error::{ErrorKind, IngestResult};
use ingest::ingest_error;
use ingest::schema::DataType;
use ingest::sink::SinkAdapter;
use ingest::table::{SqlColumn, Table};
use ingest::types::Event;
use ingest_config::DataSourceConfig;

use crate::values::{SqlValue, row_values};

/// Bound-parameter cap per statement; bulk writes are split to stay under.
const PARAMETER_LIMIT: usize = 65_535;

/// MySQL SQL types per logical type.
pub fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::String | DataType::Unknown => "text",
        DataType::Int64 => "bigint",
        DataType::Float64 => "double",
        DataType::Timestamp => "datetime(6)",
        DataType::Bool => "boolean",
    }
}

pub struct MysqlAdapter {
    pool: MySqlPool,
    database: String,
}

impl MysqlAdapter {
    pub async fn connect(config: &DataSourceConfig) -> IngestResult<Self> {
        config
            .validate()
            .map_err(|err| ingest_error!(ErrorKind::ValidationFailed, "Invalid datasource config", err))?;

        let options = MySqlConnectOptions::new()
            .host(&config.host)
            .port(config.port.unwrap_or(3306))
            .database(&config.db)
            .username(&config.username)
            .password(config.password());

        let pool = MySqlPoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|err| {
                ingest_error!(
                    ErrorKind::ConnectionFailed,
                    "Failed to connect to MySQL",
                    format!("{}/{}", config.host, config.db)
                )
                .with_source(err)
            })?;

        Ok(Self {
            pool,
            database: config.db.clone(),
        })
    }

    fn qualified(&self, table_name: &str) -> String {
        format!("{}.{}", quote(&self.database), quote(table_name))
    }

    async fn execute_ddl(&self, statement: &str) -> IngestResult<()> {
        debug!(ddl = statement, "executing DDL");
        self.pool
            .execute(statement)
            .await
            .map(|_| ())
            .map_err(|err| ingest_error!(ErrorKind::DdlFailed, "DDL failed", statement).with_source(err))
    }

    async fn write_rows(&self, table: &Table, rows: &[Event], merge: bool) -> IngestResult<()> {
        if rows.is_empty() || table.columns.is_empty() {
            return Ok(());
        }

        let columns: Vec<(&String, &SqlColumn)> = table.columns.iter().collect();
        let rows_per_batch = (PARAMETER_LIMIT / columns.len()).max(1);

        let mut tx = self.pool.begin().await.map_err(|err| {
            ingest_error!(ErrorKind::QueryFailed, "Failed to open transaction").with_source(err)
        })?;

        for chunk in rows.chunks(rows_per_batch) {
            let statement = build_insert(&self.qualified(&table.name), &columns, chunk.len(), merge);

            let mut query = sqlx::query(&statement);
            for row in chunk {
                for value in row_values(row, &columns) {
                    query = match value {
                        SqlValue::Null => query.bind(Option::<String>::None),
                        SqlValue::Bool(b) => query.bind(b),
                        SqlValue::Int(i) => query.bind(i),
                        SqlValue::Float(f) => query.bind(f),
                        SqlValue::Timestamp(ts) => query.bind(ts.naive_utc()),
                        SqlValue::Text(s) => query.bind(s),
                    };
                }
            }

            if let Err(err) = query.execute(&mut *tx).await {
                // Dropping the transaction rolls back every chunk.
                return Err(ingest_error!(
                    ErrorKind::QueryFailed,
                    "Bulk write failed",
                    format!("table {}, {} rows", table.name, chunk.len())
                )
                .with_source(err));
            }
        }

        tx.commit().await.map_err(|err| {
            ingest_error!(ErrorKind::QueryFailed, "Failed to commit transaction").with_source(err)
        })
    }
}

#[async_trait]
impl SinkAdapter for MysqlAdapter {
    fn sink_type(&self) -> &'static str {
        "mysql"
    }

    async fn test_connection(&self) -> IngestResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|err| {
                ingest_error!(ErrorKind::ConnectionFailed, "MySQL connectivity check failed")
                    .with_source(err)
            })
    }

    async fn get_table_schema(&self, table_name: &str) -> IngestResult<Table> {
        let rows = sqlx::query(
            "SELECT COLUMN_NAME, DATA_TYPE FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ?",
        )
        .bind(&self.database)
        .bind(table_name)
        .fetch_all(&self.pool)
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
            let pk_rows = sqlx::query(
                "SELECT COLUMN_NAME FROM information_schema.key_column_usage \
                 WHERE table_schema = ? AND table_name = ? AND constraint_name = 'PRIMARY'",
            )
            .bind(&self.database)
            .bind(table_name)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| {
                ingest_error!(ErrorKind::QueryFailed, "Failed to read primary key", table_name)
                    .with_source(err)
            })?;

            table.pk_fields = pk_rows
                .iter()
                .map(|row| row.get::<String, _>(0))
                .collect::<BTreeSet<String>>();
        }

        Ok(table)
    }

    async fn create_table(&self, table: &Table) -> IngestResult<()> {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|(name, column)| format!("{} {}", quote(name), column.sql_type))
            .collect();

        if table.has_pk() {
            parts.push(format!("PRIMARY KEY ({})", pk_columns(table)));
        }

        self.execute_ddl(&format!(
            "CREATE TABLE {} ({})",
            self.qualified(&table.name),
            parts.join(", ")
        ))
        .await
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
            self.execute_ddl(&format!("ALTER TABLE {qualified} DROP PRIMARY KEY"))
                .await?;
        }
        if patch.has_pk() {
            self.execute_ddl(&format!(
                "ALTER TABLE {qualified} ADD PRIMARY KEY ({})",
                pk_columns(patch)
            ))
            .await?;
        }

        Ok(())
    }

    async fn insert(&self, table: &Table, row: &Event) -> IngestResult<()> {
        let columns: Vec<(&String, &SqlColumn)> = table.columns.iter().collect();
        let statement = build_insert(&self.qualified(&table.name), &columns, 1, false);

        let mut query = sqlx::query(&statement);
        for value in row_values(row, &columns) {
            query = match value {
                SqlValue::Null => query.bind(Option::<String>::None),
                SqlValue::Bool(b) => query.bind(b),
                SqlValue::Int(i) => query.bind(i),
                SqlValue::Float(f) => query.bind(f),
                SqlValue::Timestamp(ts) => query.bind(ts.naive_utc()),
                SqlValue::Text(s) => query.bind(s),
            };
        }

        query.execute(&self.pool).await.map(|_| ()).map_err(|err| {
            ingest_error!(ErrorKind::QueryFailed, "Insert failed", table.name.clone()).with_source(err)
        })
    }

    async fn bulk_insert(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        self.write_rows(table, rows, false).await
    }

    async fn bulk_update(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        self.write_rows(table, rows, true).await
    }

    async fn close(&self) -> IngestResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

fn quote(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', ""))
}

/// MySQL requires a key length for text columns in a primary key.
fn pk_columns(table: &Table) -> String {
    table
        .pk_fields
        .iter()
        .map(|field| {
            let is_text = table
                .columns
                .get(field)
                .is_some_and(|c| c.sql_type.eq_ignore_ascii_case("text"));
            if is_text {
                format!("{}(255)", quote(field))
            } else {
                quote(field)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

fn build_insert(
    qualified: &str,
    columns: &[(&String, &SqlColumn)],
    row_count: usize,
    merge: bool,
) -> String {
    let column_list = columns
        .iter()
        .map(|(name, _)| quote(name))
        .collect::<Vec<_>>()
        .join(", ");

    let tuple = format!(
        "({})",
        columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ")
    );
    let tuples = vec![tuple; row_count].join(", ");

    let mut statement = format!("INSERT INTO {qualified} ({column_list}) VALUES {tuples}");

    if merge {
        let updates = columns
            .iter()
            .map(|(name, _)| format!("{0} = VALUES({0})", quote(name)))
            .collect::<Vec<_>>()
            .join(", ");
        statement.push_str(&format!(" ON DUPLICATE KEY UPDATE {updates}"));
    }

    statement
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(columns: &[(&str, &str)], pk: &[&str]) -> Table {
        let mut table = Table::new("events");
        for (name, sql_type) in columns {
            table
                .columns
                .insert(name.to_string(), SqlColumn::new(*sql_type, None));
        }
        table.pk_fields = pk.iter().map(|f| f.to_string()).collect();
        table
    }

    #[test]
    fn merge_statement_uses_on_duplicate_key() {
        let table = table_with(&[("email", "text"), ("name", "text")], &["email"]);
        let columns: Vec<(&String, &SqlColumn)> = table.columns.iter().collect();

        let statement = build_insert("`db`.`events`", &columns, 2, true);
        assert_eq!(
            statement,
            "INSERT INTO `db`.`events` (`email`, `name`) VALUES (?, ?), (?, ?) \
             ON DUPLICATE KEY UPDATE `email` = VALUES(`email`), `name` = VALUES(`name`)"
        );
    }

    #[test]
    fn text_pk_columns_get_a_key_length() {
        let table = table_with(&[("email", "text"), ("n", "bigint")], &["email", "n"]);
        assert_eq!(pk_columns(&table), "`email`(255), `n`");
    }
}
