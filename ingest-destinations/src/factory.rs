//! Builds a fully wired destination from its configuration: adapter,
//! processor, table helper, fallback/archive loggers, queue and driver
//! worker. Unknown destination types are rejected here, at parse time.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use ingest::cache::EventsCache;
use ingest::concurrency::ShutdownRx;
use ingest::coordination::CoordinationService;
use ingest::enrichment::{self, IpResolver, Rule, UaResolver};
use ingest::error::{ErrorKind, IngestResult};
use ingest::fallback::{AsyncLogger, DEFAULT_CHANNEL_CAPACITY};
use ingest::ingest_error;
use ingest::logfiles::{
    ARCHIVE_DIR, Archiver, FAILED_DIR, FallbackFileName, RotatingWriter, STAGING_DIR, StatusManager,
};
use ingest::queue::PersistentQueue;
use ingest::routing::{CreatedDestination, StorageFactory};
use ingest::schema::{FieldMapper, Flattener, Processor, TableNameTemplate, TypeResolver};
use ingest::sink::SinkAdapter;
use ingest::table::{SqlTypeMapper, TableHelper};
use ingest::workers::{BatchWorker, StreamingWorker};
use ingest_config::{
    DestinationConfig, DestinationMode, FieldMappingAction, Mapping, MappingField, UsersRecognition,
};

use crate::storage::DestinationStorage;
use crate::{bigquery, clickhouse, facebook, google_analytics, mysql, postgres, redshift, s3, snowflake};

/// Destination type names accepted in configuration.
pub const POSTGRES_TYPE: &str = "postgres";
pub const MYSQL_TYPE: &str = "mysql";
pub const REDSHIFT_TYPE: &str = "redshift";
pub const CLICKHOUSE_TYPE: &str = "clickhouse";
pub const BIGQUERY_TYPE: &str = "bigquery";
pub const SNOWFLAKE_TYPE: &str = "snowflake";
pub const S3_TYPE: &str = "s3";
pub const FACEBOOK_TYPE: &str = "facebook";
pub const GOOGLE_ANALYTICS_TYPE: &str = "google_analytics";

/// Builds destinations for the router.
pub struct DestinationFactory {
    events_dir: PathBuf,
    log_rotation: Duration,
    coordination: Arc<dyn CoordinationService>,
    cache: Arc<EventsCache>,
    global_users_recognition: Option<UsersRecognition>,
    global_max_columns: usize,
    ip_resolver: IpResolver,
    ua_resolver: UaResolver,
    shutdown: ShutdownRx,
}

impl DestinationFactory {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events_dir: PathBuf,
        log_rotation: Duration,
        coordination: Arc<dyn CoordinationService>,
        cache: Arc<EventsCache>,
        global_users_recognition: Option<UsersRecognition>,
        global_max_columns: usize,
        ip_resolver: IpResolver,
        ua_resolver: UaResolver,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            events_dir,
            log_rotation,
            coordination,
            cache,
            global_users_recognition,
            global_max_columns,
            ip_resolver,
            ua_resolver,
            shutdown,
        }
    }

    fn build_processor(
        &self,
        id: &str,
        kind: &str,
        config: &DestinationConfig,
    ) -> IngestResult<(Arc<Processor>, HashMap<String, String>, usize, BTreeSet<String>)> {
        let layout = config.data_layout.clone().unwrap_or_default();

        let template = TableNameTemplate::parse(layout.table_name_template.as_deref())?;
        if template.is_constant() {
            info!(destination = id, "constant table name template");
        }

        let pk_fields: BTreeSet<String> = layout.primary_key_fields.iter().cloned().collect();
        if pk_fields.is_empty() {
            info!(destination = id, "no primary key fields configured");
        } else {
            info!(destination = id, pk = ?layout.primary_key_fields, "primary key fields configured");
        }

        let max_columns = if layout.max_columns > 0 {
            info!(destination = id, max_columns = layout.max_columns, "column cap configured");
            layout.max_columns
        } else {
            self.global_max_columns
        };

        let (mapper, sql_type_hints) = match &layout.mappings {
            Some(mapping) => {
                let mapping = with_system_fields(mapping, is_sql_type(kind));
                FieldMapper::new(&mapping)?
            }
            None => (FieldMapper::identity(), HashMap::new()),
        };

        // Default browser-event rules first, configured rules after.
        let mut rules: Vec<Box<dyn Rule>> = vec![
            Box::new(enrichment::IpLookup::default_js(Arc::clone(&self.ip_resolver))),
            Box::new(enrichment::UserAgentParse::default_js(Arc::clone(
                &self.ua_resolver,
            ))),
        ];
        for rule_config in &config.enrichment {
            rules.push(enrichment::build_rule(
                rule_config,
                Arc::clone(&self.ip_resolver),
                Arc::clone(&self.ua_resolver),
            )?);
        }

        // Conversion APIs receive the nested payload shape untouched.
        let (flattener, type_resolver) = if is_http_api_type(kind) {
            (Flattener::Passthrough, TypeResolver::Passthrough)
        } else {
            (Flattener::Full, TypeResolver::Full)
        };

        let processor = Processor::new(
            id,
            template,
            mapper,
            rules,
            flattener,
            type_resolver,
            config.break_on_error,
            if is_http_api_type(kind) { 0 } else { max_columns },
        );

        Ok((Arc::new(processor), sql_type_hints, max_columns, pk_fields))
    }

    fn validate_users_recognition(&self, id: &str, kind: &str, config: &DestinationConfig, pk_fields: &BTreeSet<String>) {
        let settings = config
            .users_recognition
            .as_ref()
            .or(self.global_users_recognition.as_ref());
        let Some(settings) = settings else {
            info!(destination = id, "users recognition isn't configured");
            return;
        };

        if let Err(err) = settings.validate() {
            warn!(destination = id, error = %err, "invalid users recognition configuration");
            return;
        }

        // PK-less SQL sinks would duplicate rows on backfill.
        if settings.is_enabled()
            && matches!(kind, POSTGRES_TYPE | REDSHIFT_TYPE)
            && pk_fields.is_empty()
        {
            error!(
                destination = id,
                "users recognition disabled: primary_key_fields must be configured, \
                 otherwise the backfill would duplicate rows"
            );
        }
    }

    async fn build_adapter(
        &self,
        id: &str,
        kind: &str,
        config: &DestinationConfig,
    ) -> IngestResult<(Arc<dyn SinkAdapter>, SqlTypeMapper, bool)> {
        let missing = |block: &str| {
            ingest_error!(
                ErrorKind::ValidationFailed,
                "Missing sink credentials block",
                format!("destination {id} of type {kind} requires `{block}`")
            )
        };

        let adapter: (Arc<dyn SinkAdapter>, SqlTypeMapper, bool) = match kind {
            POSTGRES_TYPE => {
                let ds = config.datasource.as_ref().ok_or_else(|| missing("datasource"))?;
                let adapter = postgres::PostgresAdapter::connect(ds, "postgres").await?;
                (Arc::new(adapter), postgres::sql_type, true)
            }
            MYSQL_TYPE => {
                let ds = config.datasource.as_ref().ok_or_else(|| missing("datasource"))?;
                let adapter = mysql::MysqlAdapter::connect(ds).await?;
                (Arc::new(adapter), mysql::sql_type, true)
            }
            REDSHIFT_TYPE => {
                let ds = config.datasource.as_ref().ok_or_else(|| missing("datasource"))?;
                let adapter = redshift::RedshiftAdapter::connect(ds, config.s3.as_ref()).await?;
                (Arc::new(adapter), redshift::sql_type, true)
            }
            CLICKHOUSE_TYPE => {
                let ch = config.clickhouse.as_ref().ok_or_else(|| missing("clickhouse"))?;
                let adapter = clickhouse::ClickHouseAdapter::connect(ch).await?;
                // ReplacingMergeTree dedups through the engine; the helper
                // must not chase primary key constraints.
                (adapter, clickhouse::sql_type, false)
            }
            BIGQUERY_TYPE => {
                let google = config.google.as_ref().ok_or_else(|| missing("google"))?;
                let adapter = bigquery::BigQueryAdapter::connect(google).await?;
                (Arc::new(adapter), bigquery::sql_type, false)
            }
            SNOWFLAKE_TYPE => {
                let sf = config.snowflake.as_ref().ok_or_else(|| missing("snowflake"))?;
                let adapter = snowflake::SnowflakeAdapter::connect(sf, config.s3.as_ref()).await?;
                (Arc::new(adapter), snowflake::sql_type, true)
            }
            S3_TYPE => {
                let s3_config = config.s3.as_ref().ok_or_else(|| missing("s3"))?;
                let adapter = s3::S3Adapter::new(s3_config)?;
                (Arc::new(adapter), postgres::sql_type, false)
            }
            FACEBOOK_TYPE => {
                let fb = config.facebook.as_ref().ok_or_else(|| missing("facebook"))?;
                let adapter = facebook::FacebookAdapter::new(fb.clone())?;
                (Arc::new(adapter), postgres::sql_type, false)
            }
            GOOGLE_ANALYTICS_TYPE => {
                let ga = config
                    .google_analytics
                    .as_ref()
                    .ok_or_else(|| missing("google_analytics"))?;
                let adapter = google_analytics::GoogleAnalyticsAdapter::new(ga.clone())?;
                (Arc::new(adapter), postgres::sql_type, false)
            }
            unknown => {
                return Err(ingest_error!(
                    ErrorKind::ValidationFailed,
                    "Unknown destination type",
                    unknown
                ));
            }
        };

        Ok(adapter)
    }

    fn fallback_logger(&self, id: &str) -> IngestResult<Arc<AsyncLogger>> {
        let destination_id = id.to_owned();
        let writer = RotatingWriter::new(
            self.events_dir.join(FAILED_DIR),
            self.log_rotation,
            0,
            move |date| {
                FallbackFileName {
                    destination_id: destination_id.clone(),
                    date,
                }
                .render()
            },
        )?;
        Ok(Arc::new(AsyncLogger::new(writer, DEFAULT_CHANNEL_CAPACITY)))
    }

    fn archive_logger(&self, id: &str) -> IngestResult<Arc<AsyncLogger>> {
        let destination_id = id.to_owned();
        let writer = RotatingWriter::new(
            self.events_dir.join(ARCHIVE_DIR),
            self.log_rotation,
            0,
            move |date| {
                format!(
                    "archive.dst={destination_id}-{}.log",
                    ingest::logfiles::names::file_timestamp(date)
                )
            },
        )?;
        Ok(Arc::new(AsyncLogger::new(writer, DEFAULT_CHANNEL_CAPACITY)))
    }
}

#[async_trait]
impl StorageFactory for DestinationFactory {
    async fn create(
        &self,
        destination_id: &str,
        config: &DestinationConfig,
    ) -> IngestResult<CreatedDestination> {
        let kind = if config.kind.is_empty() {
            destination_id.to_owned()
        } else {
            config.kind.clone()
        };

        info!(
            destination = destination_id,
            kind = %kind,
            mode = ?config.mode,
            staged = config.staged,
            "initializing destination"
        );

        if kind == S3_TYPE && config.mode == DestinationMode::Stream {
            return Err(ingest_error!(
                ErrorKind::ValidationFailed,
                "S3 destinations only support batch mode",
                destination_id
            ));
        }

        let (processor, sql_type_hints, max_columns, pk_fields) =
            self.build_processor(destination_id, &kind, config)?;
        self.validate_users_recognition(destination_id, &kind, config, &pk_fields);

        let (adapter, sql_type_mapper, supports_pk) =
            self.build_adapter(destination_id, &kind, config).await?;

        let table_helper = TableHelper::new(
            Arc::clone(&adapter),
            Arc::clone(&self.coordination),
            if supports_pk { pk_fields } else { BTreeSet::new() },
            sql_type_mapper,
            sql_type_hints,
            if is_http_api_type(&kind) { 0 } else { max_columns },
        );

        let sink_type = adapter.sink_type();
        let storage = Arc::new(DestinationStorage::new(
            destination_id,
            sink_type,
            adapter,
            table_helper,
            Arc::clone(&processor),
            Arc::clone(&self.cache),
            self.fallback_logger(destination_id)?,
            config.staged,
        ));

        let queue = match config.mode {
            DestinationMode::Stream => {
                let queue = PersistentQueue::open(&self.events_dir, destination_id)?;

                StreamingWorker::new(
                    Arc::clone(&queue),
                    processor,
                    Arc::clone(&storage) as Arc<dyn ingest::sink::Storage>,
                    Arc::clone(&self.cache),
                    self.archive_logger(destination_id)?,
                    self.shutdown.clone(),
                )
                .start();

                Some(queue)
            }
            DestinationMode::Batch => {
                let staging_dir = self.events_dir.join(STAGING_DIR).join(destination_id);
                std::fs::create_dir_all(&staging_dir).map_err(|err| {
                    ingest_error!(ErrorKind::Io, "Failed to create staging dir").with_source(err)
                })?;

                BatchWorker::new(
                    Arc::clone(&storage) as Arc<dyn ingest::sink::Storage>,
                    staging_dir.clone(),
                    self.events_dir.join(FAILED_DIR),
                    Arc::new(StatusManager::new(&staging_dir)?),
                    Archiver::new(self.events_dir.join(ARCHIVE_DIR))?,
                    Duration::from_secs(config.uploader_tick_secs.max(1)),
                    config.uploader_retries,
                    self.shutdown.clone(),
                )
                .start();

                None
            }
        };

        Ok(CreatedDestination {
            storage,
            queue,
        })
    }
}

fn is_sql_type(kind: &str) -> bool {
    matches!(
        kind,
        POSTGRES_TYPE
            | MYSQL_TYPE
            | REDSHIFT_TYPE
            | CLICKHOUSE_TYPE
            | BIGQUERY_TYPE
            | SNOWFLAKE_TYPE
            | S3_TYPE
    )
}

fn is_http_api_type(kind: &str) -> bool {
    matches!(kind, FACEBOOK_TYPE | GOOGLE_ANALYTICS_TYPE)
}

/// SQL sinks in strict mapping mode still need the two system fields; add
/// move rules for them unless the configuration already covers them.
fn with_system_fields(mapping: &Mapping, sql_sink: bool) -> Mapping {
    let mut mapping = mapping.clone();
    if !sql_sink || mapping.keeps_unmapped() {
        return mapping;
    }

    let mut has_event_id = false;
    let mut has_timestamp = false;
    for field in &mapping.fields {
        if field.src.as_deref() == Some("/eventn_ctx/event_id") {
            has_event_id = true;
        }
        if field.src.as_deref() == Some("/_timestamp") {
            has_timestamp = true;
        }
    }

    if !has_event_id {
        warn!("adding default system field mapping for /eventn_ctx/event_id");
        mapping.fields.push(MappingField {
            src: Some("/eventn_ctx/event_id".to_owned()),
            dst: Some("/eventn_ctx/event_id".to_owned()),
            action: FieldMappingAction::Move,
            column_type: None,
            value: None,
        });
    }
    if !has_timestamp {
        warn!("adding default system field mapping for /_timestamp");
        mapping.fields.push(MappingField {
            src: Some("/_timestamp".to_owned()),
            dst: Some("/_timestamp".to_owned()),
            action: FieldMappingAction::Move,
            column_type: None,
            value: None,
        });
    }

    mapping
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn strict_sql_mappings_gain_system_fields() {
        let enriched = with_system_fields(
            &mapping("keep_unmapped: false\nfields:\n  - src: /a\n    dst: /b\n    action: move"),
            true,
        );
        assert_eq!(enriched.fields.len(), 3);
        assert!(
            enriched
                .fields
                .iter()
                .any(|f| f.src.as_deref() == Some("/eventn_ctx/event_id"))
        );
    }

    #[test]
    fn lenient_mappings_are_left_alone() {
        let original = mapping("fields:\n  - src: /a\n    dst: /b\n    action: move");
        assert_eq!(with_system_fields(&original, true).fields.len(), 1);
        // Non-SQL sinks never get system columns.
        let strict = mapping("keep_unmapped: false\nfields: []");
        assert!(with_system_fields(&strict, false).fields.is_empty());
    }

    #[test]
    fn type_classification() {
        assert!(is_sql_type("postgres"));
        assert!(is_sql_type("s3"));
        assert!(!is_sql_type("facebook"));
        assert!(is_http_api_type("google_analytics"));
        assert!(!is_http_api_type("clickhouse"));
    }
}
