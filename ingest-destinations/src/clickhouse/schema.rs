//! ClickHouse DDL construction: engine selection, cluster clauses, and the
//! Distributed shim naming.

use ingest::schema::DataType;
use ingest::table::Table;
use ingest_config::{ClickHouseConfig, ClickHouseEngineConfig};

/// Default partitioning of event tables.
const DEFAULT_PARTITION: &str = "PARTITION BY (toYYYYMM(_timestamp))";
/// Default ordering key; doubles as the dedup key of ReplacingMergeTree.
const DEFAULT_ORDER_BY: &str = "ORDER BY (eventn_ctx_event_id)";

/// ClickHouse column types per logical type. Booleans are stored as UInt8.
pub fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::String | DataType::Unknown => "String",
        DataType::Int64 => "Int64",
        DataType::Float64 => "Float64",
        DataType::Timestamp => "DateTime",
        DataType::Bool => "UInt8",
    }
}

/// Name of the Distributed shim table fronting a replicated table.
pub fn dist_table_name(table_name: &str) -> String {
    format!("dist_{table_name}")
}

/// Builds CREATE TABLE statements from the destination's engine settings.
///
/// Single-node deployments get `ReplacingMergeTree(_timestamp)`; cluster
/// deployments get `ReplicatedReplacingMergeTree` with the conventional
/// ZooKeeper path plus a Distributed shim created separately.
#[derive(Debug, Clone)]
pub struct TableStatementFactory {
    database: String,
    cluster: Option<String>,
    raw_engine: Option<String>,
    partition_clause: String,
    order_by_clause: String,
    primary_key_clause: String,
}

impl TableStatementFactory {
    pub fn new(config: &ClickHouseConfig) -> Self {
        let engine = config.engine.clone().unwrap_or_default();
        let ClickHouseEngineConfig {
            raw_statement,
            partition_fields,
            order_fields,
            primary_keys,
            ..
        } = engine;

        let partition_clause = if partition_fields.is_empty() {
            DEFAULT_PARTITION.to_owned()
        } else {
            format!("PARTITION BY ({})", partition_fields.join(", "))
        };
        let order_by_clause = if order_fields.is_empty() {
            DEFAULT_ORDER_BY.to_owned()
        } else {
            format!("ORDER BY ({})", order_fields.join(", "))
        };
        let primary_key_clause = if primary_keys.is_empty() {
            String::new()
        } else {
            format!("PRIMARY KEY ({})", primary_keys.join(", "))
        };

        Self {
            database: config.db.clone(),
            cluster: config.cluster.clone().filter(|c| !c.is_empty()),
            raw_engine: raw_statement.filter(|s| !s.is_empty()),
            partition_clause,
            order_by_clause,
            primary_key_clause,
        }
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub fn on_cluster_clause(&self) -> String {
        match &self.cluster {
            Some(cluster) => format!(" ON CLUSTER \"{cluster}\" "),
            None => String::new(),
        }
    }

    fn engine_statement(&self, table_name: &str) -> String {
        if let Some(raw) = &self.raw_engine {
            return raw.clone();
        }

        match &self.cluster {
            Some(_) => format!(
                "ENGINE = ReplicatedReplacingMergeTree('/clickhouse/tables/{{shard}}/{}/{table_name}', '{{replica}}', _timestamp)",
                self.database
            ),
            None => "ENGINE = ReplacingMergeTree(_timestamp)".to_owned(),
        }
    }

    /// Full CREATE TABLE statement for the underlying (possibly replicated)
    /// table.
    pub fn create_table_statement(&self, table_name: &str, columns_clause: &str) -> String {
        let trailer = if self.raw_engine.is_some() {
            // A raw engine statement overrides partitioning and ordering too.
            self.engine_statement(table_name)
        } else {
            format!(
                "{} {} {} {}",
                self.engine_statement(table_name),
                self.partition_clause,
                self.order_by_clause,
                self.primary_key_clause
            )
        };

        format!(
            "CREATE TABLE \"{}\".\"{table_name}\"{}({columns_clause}) {}",
            self.database,
            self.on_cluster_clause(),
            trailer.trim_end()
        )
    }

    /// CREATE statement of the Distributed shim over the replicated table.
    pub fn create_distributed_statement(&self, table_name: &str) -> Option<String> {
        let cluster = self.cluster.as_ref()?;
        Some(format!(
            "CREATE TABLE \"{0}\".\"{1}\"{2}AS \"{0}\".\"{3}\" ENGINE = Distributed(\"{4}\", \"{0}\", \"{3}\", rand())",
            self.database,
            dist_table_name(table_name),
            self.on_cluster_clause(),
            table_name,
            cluster
        ))
    }

    /// DROP statement of the Distributed shim.
    pub fn drop_distributed_statement(&self, table_name: &str) -> Option<String> {
        self.cluster.as_ref()?;
        Some(format!(
            "DROP TABLE IF EXISTS \"{}\".\"{}\"{}",
            self.database,
            dist_table_name(table_name),
            self.on_cluster_clause()
        ))
    }
}

/// Renders the column clause of a CREATE TABLE, wrapping the explicitly
/// allowed columns in `Nullable(...)`.
pub fn columns_clause(table: &Table, nullable_fields: &[String]) -> String {
    table
        .columns
        .iter()
        .map(|(name, column)| {
            let base = column.sql_type.as_str();
            if nullable_fields.iter().any(|f| f == name) {
                format!("\"{name}\" Nullable({base})")
            } else {
                format!("\"{name}\" {base}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest::table::SqlColumn;

    fn config(cluster: Option<&str>) -> ClickHouseConfig {
        ClickHouseConfig {
            dsns: vec!["http://localhost:8123".into()],
            db: "events_db".into(),
            username: None,
            password: None,
            cluster: cluster.map(str::to_owned),
            engine: None,
        }
    }

    fn table() -> Table {
        let mut table = Table::new("events");
        table.columns.insert(
            "eventn_ctx_event_id".into(),
            SqlColumn::new("String", Some(DataType::String)),
        );
        table.columns.insert(
            "_timestamp".into(),
            SqlColumn::new("DateTime", Some(DataType::Timestamp)),
        );
        table
    }

    #[test]
    fn single_node_uses_replacing_merge_tree() {
        let factory = TableStatementFactory::new(&config(None));
        let ddl = factory.create_table_statement("events", &columns_clause(&table(), &[]));

        assert!(ddl.contains("ENGINE = ReplacingMergeTree(_timestamp)"));
        assert!(ddl.contains("PARTITION BY (toYYYYMM(_timestamp))"));
        assert!(ddl.contains("ORDER BY (eventn_ctx_event_id)"));
        assert!(!ddl.contains("ON CLUSTER"));
    }

    #[test]
    fn cluster_mode_uses_replicated_engine_and_shard_path() {
        let factory = TableStatementFactory::new(&config(Some("main")));
        let ddl = factory.create_table_statement("events", &columns_clause(&table(), &[]));

        assert!(ddl.contains("ON CLUSTER \"main\""));
        assert!(ddl.contains(
            "ReplicatedReplacingMergeTree('/clickhouse/tables/{shard}/events_db/events', '{replica}', _timestamp)"
        ));
    }

    #[test]
    fn distributed_shim_statements_exist_only_on_cluster() {
        let single = TableStatementFactory::new(&config(None));
        assert!(single.create_distributed_statement("events").is_none());

        let clustered = TableStatementFactory::new(&config(Some("main")));
        let create = clustered.create_distributed_statement("events").unwrap();
        assert!(create.contains("\"events_db\".\"dist_events\""));
        assert!(create.contains("ENGINE = Distributed(\"main\", \"events_db\", \"events\", rand())"));

        let drop = clustered.drop_distributed_statement("events").unwrap();
        assert!(drop.starts_with("DROP TABLE IF EXISTS \"events_db\".\"dist_events\""));
    }

    #[test]
    fn nullable_columns_only_when_listed() {
        let clause = columns_clause(&table(), &["_timestamp".to_owned()]);
        assert!(clause.contains("\"_timestamp\" Nullable(DateTime)"));
        assert!(clause.contains("\"eventn_ctx_event_id\" String"));
    }

    #[test]
    fn raw_engine_statement_overrides_everything() {
        let mut cfg = config(None);
        cfg.engine = Some(ClickHouseEngineConfig {
            raw_statement: Some("ENGINE = MergeTree() ORDER BY tuple()".into()),
            ..Default::default()
        });
        let factory = TableStatementFactory::new(&cfg);
        let ddl = factory.create_table_statement("events", "\"a\" String");
        assert!(ddl.ends_with("ENGINE = MergeTree() ORDER BY tuple()"));
        assert!(!ddl.contains("PARTITION BY"));
    }
}
