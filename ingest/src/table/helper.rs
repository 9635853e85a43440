use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::bail;
use crate::coordination::CoordinationService;
use crate::error::{ErrorKind, IngestResult};
use crate::schema::BatchHeader;
use crate::sink::SinkAdapter;
use crate::table::{SqlColumn, SqlTypeMapper, Table};

#[derive(Debug, Clone)]
struct CachedTable {
    table: Table,
    version: i64,
}

/// Turns derived batch headers into live sink tables whose columns are a
/// superset of the header.
///
/// The cache holds the last known schema per table together with the
/// coordination version it was read at; a version bump by any worker (on
/// this or another node) invalidates the entry. The cache lock is never
/// held across an await: reads are taken, the lock dropped, and DDL runs
/// under the named coordination lock only.
pub struct TableHelper {
    adapter: Arc<dyn SinkAdapter>,
    coordination: Arc<dyn CoordinationService>,
    pk_fields: BTreeSet<String>,
    sql_type_mapper: SqlTypeMapper,
    /// Per-column SQL type overrides contributed by mapping `cast` rules.
    sql_type_hints: HashMap<String, String>,
    /// Cap on physical column count; 0 disables the cap.
    max_columns: usize,
    cache: RwLock<HashMap<String, CachedTable>>,
}

impl TableHelper {
    pub fn new(
        adapter: Arc<dyn SinkAdapter>,
        coordination: Arc<dyn CoordinationService>,
        pk_fields: BTreeSet<String>,
        sql_type_mapper: SqlTypeMapper,
        sql_type_hints: HashMap<String, String>,
        max_columns: usize,
    ) -> Self {
        Self {
            adapter,
            coordination,
            pk_fields,
            sql_type_mapper,
            sql_type_hints,
            max_columns,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Maps a derived header onto the sink's table shape: applies the
    /// configured primary key, SQL cast overrides and the per-sink type map.
    /// Pure; no I/O.
    pub fn map_table_schema(&self, header: &BatchHeader) -> Table {
        let columns = header
            .fields
            .iter()
            .map(|(name, data_type)| {
                let sql_type = self
                    .sql_type_hints
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| (self.sql_type_mapper)(*data_type).to_owned());
                (name.clone(), SqlColumn::new(sql_type, Some(*data_type)))
            })
            .collect();

        Table {
            name: header.table_name.clone(),
            columns,
            pk_fields: self.pk_fields.clone(),
            delete_pk_fields: false,
        }
    }

    /// Idempotently makes the live table a superset of `table`.
    ///
    /// The fast path is a cache hit with an empty delta and a current
    /// version. Otherwise the named `(destination, table)` lock serializes
    /// DDL: the live schema is re-read under the lock, the delta recomputed
    /// against it, and `CREATE TABLE` or a patch issued only if the delta
    /// survived. Every successful DDL bumps the coordination version.
    pub async fn ensure_table(&self, destination_id: &str, table: &Table) -> IngestResult<Table> {
        let current_version = self
            .coordination
            .get_version(destination_id, &table.name)
            .await?;

        {
            let cache = self.cache.read();
            if let Some(cached) = cache.get(&table.name)
                && cached.version == current_version
                && !table.diff(&cached.table).has_changes()
            {
                return Ok(cached.table.clone());
            }
        }

        let _guard = self
            .coordination
            .try_lock(destination_id, &table.name)
            .await?;

        // The live schema is authoritative; whatever we cached before taking
        // the lock may have been outrun by another worker.
        let live = self.adapter.get_table_schema(&table.name).await?;

        let mut issued_ddl = false;
        let merged = if !live.exists() {
            self.check_column_cap(table, table.columns.len())?;

            info!(
                destination = destination_id,
                table = %table.name,
                columns = table.columns.len(),
                "creating table"
            );
            self.adapter.create_table(table).await?;
            issued_ddl = true;
            table.clone()
        } else {
            let delta = table.diff(&live);
            if delta.has_changes() {
                self.check_column_cap(table, live.columns.len() + delta.columns.len())?;

                info!(
                    destination = destination_id,
                    table = %table.name,
                    new_columns = delta.columns.len(),
                    pk_delta = !delta.pk_fields.is_empty() || delta.delete_pk_fields,
                    "patching table schema"
                );
                self.adapter.patch_table_schema(&delta).await?;
                issued_ddl = true;
            } else {
                debug!(
                    destination = destination_id,
                    table = %table.name,
                    "live schema already up to date"
                );
            }
            table.merged_with(&live)
        };

        // Only real DDL invalidates other workers' caches; a no-op ensure
        // keeps the current version so the fast path stays hot.
        let version = if issued_ddl {
            self.coordination
                .increment_version(destination_id, &table.name)
                .await?
        } else {
            self.coordination
                .get_version(destination_id, &table.name)
                .await?
        };

        self.cache.write().insert(
            table.name.clone(),
            CachedTable {
                table: merged.clone(),
                version,
            },
        );

        Ok(merged)
    }

    /// Forces a live schema read into the cache. Used after an insert
    /// failure that suggests drift.
    pub async fn refresh_table_schema(
        &self,
        destination_id: &str,
        table_name: &str,
    ) -> IngestResult<Table> {
        let live = self.adapter.get_table_schema(table_name).await?;
        let version = self
            .coordination
            .get_version(destination_id, table_name)
            .await?;

        self.cache.write().insert(
            table_name.to_owned(),
            CachedTable {
                table: live.clone(),
                version,
            },
        );

        Ok(live)
    }

    fn check_column_cap(&self, table: &Table, resulting_columns: usize) -> IngestResult<()> {
        if self.max_columns > 0 && resulting_columns > self.max_columns {
            bail!(
                ErrorKind::MaxColumns,
                "Ensure would exceed the column cap",
                format!(
                    "table {} would have {resulting_columns} columns, cap is {}",
                    table.name, self.max_columns
                )
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for TableHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableHelper")
            .field("pk_fields", &self.pk_fields)
            .field("max_columns", &self.max_columns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordination;
    use crate::schema::DataType;
    use crate::test_utils::MockAdapter;

    fn sql_type(data_type: DataType) -> &'static str {
        match data_type {
            DataType::String | DataType::Unknown => "text",
            DataType::Int64 => "bigint",
            DataType::Float64 => "double precision",
            DataType::Timestamp => "timestamp",
            DataType::Bool => "boolean",
        }
    }

    fn header(fields: &[(&str, DataType)]) -> BatchHeader {
        BatchHeader {
            table_name: "events".to_owned(),
            fields: fields
                .iter()
                .map(|(name, t)| (name.to_string(), *t))
                .collect(),
        }
    }

    fn helper(adapter: Arc<MockAdapter>, pk: &[&str], max_columns: usize) -> TableHelper {
        TableHelper::new(
            adapter,
            Arc::new(InMemoryCoordination::new()),
            pk.iter().map(|f| f.to_string()).collect(),
            sql_type,
            HashMap::new(),
            max_columns,
        )
    }

    #[tokio::test]
    async fn ensure_creates_missing_table_once() {
        let adapter = Arc::new(MockAdapter::new());
        let helper = helper(Arc::clone(&adapter), &[], 0);

        let table = helper.map_table_schema(&header(&[("v", DataType::Int64)]));
        let ensured = helper.ensure_table("dst", &table).await.unwrap();
        assert_eq!(ensured.columns["v"].sql_type, "bigint");
        assert_eq!(adapter.create_calls(), 1);

        // Second ensure with the same shape is served from cache.
        helper.ensure_table("dst", &table).await.unwrap();
        assert_eq!(adapter.create_calls(), 1);
        assert_eq!(adapter.patch_calls(), 0);
    }

    #[tokio::test]
    async fn ensure_patches_new_columns() {
        let adapter = Arc::new(MockAdapter::new());
        let helper = helper(Arc::clone(&adapter), &[], 0);

        let first = helper.map_table_schema(&header(&[("v", DataType::Int64)]));
        helper.ensure_table("dst", &first).await.unwrap();

        let second = helper.map_table_schema(&header(&[
            ("v", DataType::Int64),
            ("name", DataType::String),
        ]));
        let ensured = helper.ensure_table("dst", &second).await.unwrap();

        assert_eq!(adapter.patch_calls(), 1);
        assert!(ensured.columns.contains_key("name"));
        assert!(ensured.columns.contains_key("v"));
    }

    #[tokio::test]
    async fn cast_hints_override_the_type_map() {
        let adapter = Arc::new(MockAdapter::new());
        let hints = HashMap::from([("utc_time".to_owned(), "timestamp".to_owned())]);
        let helper = TableHelper::new(
            adapter,
            Arc::new(InMemoryCoordination::new()),
            BTreeSet::new(),
            sql_type,
            hints,
            0,
        );

        let table = helper.map_table_schema(&header(&[("utc_time", DataType::String)]));
        assert_eq!(table.columns["utc_time"].sql_type, "timestamp");
    }

    #[tokio::test]
    async fn column_cap_blocks_ddl() {
        let adapter = Arc::new(MockAdapter::new());
        let helper = helper(Arc::clone(&adapter), &[], 2);

        let table = helper.map_table_schema(&header(&[
            ("a", DataType::Int64),
            ("b", DataType::Int64),
            ("c", DataType::Int64),
        ]));

        let err = helper.ensure_table("dst", &table).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MaxColumns);
        assert_eq!(adapter.create_calls(), 0);
    }

    #[tokio::test]
    async fn pk_removal_flows_into_the_patch() {
        let adapter = Arc::new(MockAdapter::new());

        // First ensure with a primary key.
        let with_pk = helper(Arc::clone(&adapter), &["email"], 0);
        let table = with_pk.map_table_schema(&header(&[("email", DataType::String)]));
        with_pk.ensure_table("dst", &table).await.unwrap();
        assert!(adapter.table("events").unwrap().has_pk());

        // Reload without primary key fields: fresh helper, same adapter.
        let without_pk = helper(Arc::clone(&adapter), &[], 0);
        let table = without_pk.map_table_schema(&header(&[("email", DataType::String)]));
        without_pk.ensure_table("dst", &table).await.unwrap();

        assert_eq!(adapter.patch_calls(), 1);
        assert!(!adapter.table("events").unwrap().has_pk());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_ensures_issue_ddl_once_per_delta() {
        let adapter = Arc::new(MockAdapter::new());
        let helper = Arc::new(helper(Arc::clone(&adapter), &[], 0));

        let table = helper.map_table_schema(&header(&[("v", DataType::Int64)]));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let helper = Arc::clone(&helper);
                let table = table.clone();
                tokio::spawn(async move { helper.ensure_table("dst", &table).await })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // One create; the losers of the race re-read the live schema and
        // find an empty delta.
        assert_eq!(adapter.create_calls(), 1);
        assert_eq!(adapter.patch_calls(), 0);
    }

    #[tokio::test]
    async fn refresh_reads_live_schema() {
        let adapter = Arc::new(MockAdapter::new());
        let helper = helper(Arc::clone(&adapter), &[], 0);

        let table = helper.map_table_schema(&header(&[("v", DataType::Int64)]));
        helper.ensure_table("dst", &table).await.unwrap();

        // Simulate drift behind the helper's back.
        adapter.add_column("events", "added_elsewhere", "text");

        let refreshed = helper.refresh_table_schema("dst", "events").await.unwrap();
        assert!(refreshed.columns.contains_key("added_elsewhere"));
    }
}
