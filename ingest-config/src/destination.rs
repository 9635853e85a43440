use serde::{Deserialize, Serialize};

use crate::ValidationError;
use crate::sensitive::SensitiveString;

/// Delivery mode of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DestinationMode {
    /// Per-file delivery from rotated/staged logs. The default.
    #[default]
    Batch,
    /// Per-event delivery through a persistent queue.
    Stream,
}

/// Immutable definition of a single destination.
///
/// `type` selects the sink adapter; the matching per-sink block carries the
/// credentials. Unknown types are rejected at parse time by the factory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DestinationConfig {
    /// Sink type; defaults to the destination name when omitted.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub mode: DestinationMode,
    /// Tokens routed to this destination; empty means all tokens.
    #[serde(default)]
    pub only_tokens: Vec<String>,
    #[serde(default)]
    pub data_layout: Option<DataLayout>,
    #[serde(default)]
    pub enrichment: Vec<EnrichmentRuleConfig>,
    #[serde(default)]
    pub users_recognition: Option<UsersRecognition>,
    /// A staged destination is validated and schema-prepared but accepts no
    /// writes (dry-run mode).
    #[serde(default)]
    pub staged: bool,
    /// Abort the whole batch on the first bad row instead of accumulating
    /// failed rows for the fallback log.
    #[serde(default)]
    pub break_on_error: bool,
    /// Batch worker tick in seconds.
    #[serde(default = "default_uploader_tick_secs")]
    pub uploader_tick_secs: u64,
    /// Failed-tick budget before a staged file is moved to the failed dir.
    #[serde(default = "default_uploader_retries")]
    pub uploader_retries: u32,

    #[serde(default)]
    pub datasource: Option<DataSourceConfig>,
    #[serde(default)]
    pub clickhouse: Option<ClickHouseConfig>,
    #[serde(default)]
    pub google: Option<GoogleConfig>,
    #[serde(default)]
    pub snowflake: Option<SnowflakeConfig>,
    #[serde(default)]
    pub s3: Option<S3Config>,
    #[serde(default)]
    pub facebook: Option<FacebookConfig>,
    #[serde(default)]
    pub google_analytics: Option<GoogleAnalyticsConfig>,
}

impl DestinationConfig {
    pub const DEFAULT_UPLOADER_TICK_SECS: u64 = 30;
    pub const DEFAULT_UPLOADER_RETRIES: u32 = 5;
}

fn default_uploader_tick_secs() -> u64 {
    DestinationConfig::DEFAULT_UPLOADER_TICK_SECS
}

fn default_uploader_retries() -> u32 {
    DestinationConfig::DEFAULT_UPLOADER_RETRIES
}

/// Table layout settings shared by all SQL sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DataLayout {
    /// Table name template; constants plus `{{/json/path}}` placeholders.
    #[serde(default)]
    pub table_name_template: Option<String>,
    #[serde(default)]
    pub primary_key_fields: Vec<String>,
    /// Cap on physical column count; 0 disables the cap.
    #[serde(default)]
    pub max_columns: usize,
    #[serde(default)]
    pub mappings: Option<Mapping>,
}

/// Field mapping rules applied before flattening.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mapping {
    /// Keep fields not mentioned by any rule. Defaults to true.
    #[serde(default)]
    pub keep_unmapped: Option<bool>,
    #[serde(default)]
    pub fields: Vec<MappingField>,
}

impl Mapping {
    pub fn keeps_unmapped(&self) -> bool {
        self.keep_unmapped.unwrap_or(true)
    }
}

/// Action of a single mapping rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldMappingAction {
    /// Move the value from `src` to `dst`.
    Move,
    /// Erase the value at `src`.
    Remove,
    /// Record a SQL cast hint for the column at `dst`.
    Cast,
    /// Write a constant `value` at `dst`.
    Constant,
}

/// One rename/erase/cast/constant rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingField {
    #[serde(default)]
    pub src: Option<String>,
    #[serde(default)]
    pub dst: Option<String>,
    pub action: FieldMappingAction,
    /// SQL type for `cast` rules, e.g. `bigint` or `timestamp`.
    #[serde(rename = "type", default)]
    pub column_type: Option<String>,
    /// Literal for `constant` rules.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

/// A single enrichment rule reference: a named rule wired from a source
/// node to a destination node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentRuleConfig {
    pub name: String,
    pub from: String,
    pub to: String,
}

/// Retrospective users-recognition settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UsersRecognition {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub anonymous_id_node: Option<String>,
    #[serde(default)]
    pub user_id_node: Option<String>,
}

impl UsersRecognition {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.enabled {
            if self.anonymous_id_node.as_deref().unwrap_or("").is_empty() {
                return Err(ValidationError::missing("users_recognition.anonymous_id_node"));
            }
            if self.user_id_node.as_deref().unwrap_or("").is_empty() {
                return Err(ValidationError::missing("users_recognition.user_id_node"));
            }
        }
        Ok(())
    }
}

/// Connection settings for Postgres-wire sinks (Postgres, Redshift, MySQL).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub db: String,
    #[serde(default)]
    pub schema: Option<String>,
    pub username: String,
    #[serde(default)]
    pub password: Option<SensitiveString>,
    #[serde(default)]
    pub parameters: std::collections::BTreeMap<String, String>,
}

impl DataSourceConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.is_empty() {
            return Err(ValidationError::missing("datasource.host"));
        }
        if self.db.is_empty() {
            return Err(ValidationError::missing("datasource.db"));
        }
        if self.username.is_empty() {
            return Err(ValidationError::missing("datasource.username"));
        }
        Ok(())
    }

    pub fn password(&self) -> &str {
        self.password
            .as_ref()
            .map(SensitiveString::expose_secret)
            .unwrap_or("")
    }
}

/// ClickHouse connection and engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    /// One or more HTTP endpoints; more than one requires `cluster`.
    pub dsns: Vec<String>,
    pub db: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<SensitiveString>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub engine: Option<ClickHouseEngineConfig>,
}

/// Optional engine overrides for ClickHouse table creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ClickHouseEngineConfig {
    /// Raw engine statement; overrides every other engine setting.
    #[serde(default)]
    pub raw_statement: Option<String>,
    /// Columns allowed to be Nullable.
    #[serde(default)]
    pub nullable_fields: Vec<String>,
    #[serde(default)]
    pub partition_fields: Vec<String>,
    #[serde(default)]
    pub order_fields: Vec<String>,
    #[serde(default)]
    pub primary_keys: Vec<String>,
}

impl ClickHouseConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.dsns.is_empty() {
            return Err(ValidationError::missing("clickhouse.dsns"));
        }
        for dsn in &self.dsns {
            if !dsn.starts_with("http://") && !dsn.starts_with("https://") {
                return Err(ValidationError::invalid(
                    "clickhouse.dsns",
                    "DSNs must have http:// or https:// prefix",
                ));
            }
        }
        if self.dsns.len() > 1 && self.cluster.as_deref().unwrap_or("").is_empty() {
            return Err(ValidationError::invalid(
                "clickhouse.cluster",
                "required when dsns count > 1",
            ));
        }
        if self.db.is_empty() {
            return Err(ValidationError::missing("clickhouse.db"));
        }
        Ok(())
    }
}

/// Google Cloud settings shared by BigQuery and GCS staging.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleConfig {
    pub project: String,
    #[serde(default)]
    pub dataset: Option<String>,
    /// GCS bucket used as the batch staging area.
    #[serde(default)]
    pub bucket: Option<String>,
    /// Path to the service account key file.
    pub key_file: String,
}

impl GoogleConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.project.is_empty() {
            return Err(ValidationError::missing("google.project"));
        }
        if self.key_file.is_empty() {
            return Err(ValidationError::missing("google.key_file"));
        }
        Ok(())
    }
}

/// Snowflake connection settings (key-pair JWT auth).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnowflakeConfig {
    pub account: String,
    pub warehouse: String,
    pub db: String,
    #[serde(default)]
    pub schema: Option<String>,
    pub username: String,
    /// Path to the PKCS#8 private key file (PEM).
    pub private_key_path: String,
    /// Named stage used for COPY INTO loads.
    #[serde(default)]
    pub stage: Option<String>,
}

impl SnowflakeConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.account.is_empty() {
            return Err(ValidationError::missing("snowflake.account"));
        }
        if self.warehouse.is_empty() {
            return Err(ValidationError::missing("snowflake.warehouse"));
        }
        if self.db.is_empty() {
            return Err(ValidationError::missing("snowflake.db"));
        }
        if self.username.is_empty() {
            return Err(ValidationError::missing("snowflake.username"));
        }
        if self.private_key_path.is_empty() {
            return Err(ValidationError::missing("snowflake.private_key_path"));
        }
        Ok(())
    }
}

/// S3 bucket settings, used both as a write-only sink and as the staging
/// area for Redshift/Snowflake COPY loads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<SensitiveString>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub folder: Option<String>,
}

impl S3Config {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bucket.is_empty() {
            return Err(ValidationError::missing("s3.bucket"));
        }
        if self.region.is_empty() {
            return Err(ValidationError::missing("s3.region"));
        }
        Ok(())
    }
}

/// Facebook Conversions API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacebookConfig {
    pub pixel_id: String,
    pub access_token: SensitiveString,
}

impl FacebookConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.pixel_id.is_empty() {
            return Err(ValidationError::missing("facebook.pixel_id"));
        }
        if self.access_token.is_empty() {
            return Err(ValidationError::missing("facebook.access_token"));
        }
        Ok(())
    }
}

/// Google Analytics Measurement Protocol settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleAnalyticsConfig {
    pub tracking_id: String,
}

impl GoogleAnalyticsConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.tracking_id.is_empty() {
            return Err(ValidationError::missing("google_analytics.tracking_id"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_defaults_to_batch() {
        let cfg: DestinationConfig = serde_yaml::from_str("type: postgres").unwrap();
        assert_eq!(cfg.mode, DestinationMode::Batch);
        assert_eq!(
            cfg.uploader_tick_secs,
            DestinationConfig::DEFAULT_UPLOADER_TICK_SECS
        );
    }

    #[test]
    fn full_destination_block_parses() {
        let yaml = r#"
type: postgres
mode: stream
only_tokens: [tok1, tok2]
data_layout:
  table_name_template: "events_{{/event_type}}"
  primary_key_fields: [email]
  max_columns: 100
  mappings:
    keep_unmapped: false
    fields:
      - src: /payload/raw
        dst: /raw
        action: move
      - src: /internal
        action: remove
      - dst: /amount
        action: cast
        type: numeric
datasource:
  host: localhost
  db: events
  username: ingest
  password: secret
"#;
        let cfg: DestinationConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.mode, DestinationMode::Stream);
        let layout = cfg.data_layout.unwrap();
        assert_eq!(layout.primary_key_fields, vec!["email"]);
        assert_eq!(layout.max_columns, 100);
        let mapping = layout.mappings.unwrap();
        assert!(!mapping.keeps_unmapped());
        assert_eq!(mapping.fields.len(), 3);
        assert_eq!(mapping.fields[2].action, FieldMappingAction::Cast);
        cfg.datasource.unwrap().validate().unwrap();
    }

    #[test]
    fn clickhouse_validation() {
        let mut cfg = ClickHouseConfig {
            dsns: vec!["http://localhost:8123".into()],
            db: "events".into(),
            username: None,
            password: None,
            cluster: None,
            engine: None,
        };
        cfg.validate().unwrap();

        cfg.dsns.push("http://other:8123".into());
        assert!(cfg.validate().is_err());

        cfg.cluster = Some("main".into());
        cfg.validate().unwrap();

        cfg.dsns[0] = "tcp://localhost:9000".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn users_recognition_requires_both_nodes() {
        let ur = UsersRecognition {
            enabled: true,
            anonymous_id_node: Some("/eventn_ctx/user/anonymous_id".into()),
            user_id_node: None,
        };
        assert!(ur.validate().is_err());

        let ur = UsersRecognition {
            enabled: false,
            anonymous_id_node: None,
            user_id_node: None,
        };
        ur.validate().unwrap();
    }
}
