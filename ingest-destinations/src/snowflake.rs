//! Snowflake sink adapter over the SQL REST API with key-pair JWT auth.
//!
//! Bulk loads stage NDJSON on S3 and `COPY INTO` the target table; without
//! a stage, rows are inserted as rendered literals. Snowflake folds
//! unquoted identifiers to upper case, so schema reads normalize names
//! back to lower case before diffing.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use parking_lot::Mutex;
use rsa::RsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use ingest::error::{ErrorKind, IngestResult};
use ingest::ingest_error;
use ingest::logfiles::StagedFileName;
use ingest::schema::DataType;
use ingest::sink::SinkAdapter;
use ingest::table::{SqlColumn, Table};
use ingest::types::Event;
use ingest_config::{S3Config, SnowflakeConfig};

use crate::stage::ObjectStage;
use crate::values::{SqlValue, row_values};

/// JWT lifetime; Snowflake caps key-pair tokens at one hour.
const TOKEN_LIFETIME_SECS: u64 = 3540;
/// Refresh margin before expiry.
const TOKEN_REFRESH_BUFFER: Duration = Duration::from_secs(300);

/// Snowflake SQL types per logical type.
pub fn sql_type(data_type: DataType) -> &'static str {
    match data_type {
        DataType::String | DataType::Unknown => "text",
        DataType::Int64 => "bigint",
        DataType::Float64 => "double precision",
        DataType::Timestamp => "timestamp_ntz(6)",
        DataType::Bool => "boolean",
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims {
    iss: String,
    sub: String,
    iat: u64,
    exp: u64,
}

/// Key-pair JWT state: issuer/subject derived from the RSA key fingerprint,
/// refreshed shortly before expiry.
struct KeyPairJwt {
    encoding_key: EncodingKey,
    issuer: String,
    subject: String,
    token: String,
    expires_at: SystemTime,
}

impl KeyPairJwt {
    fn new(account: &str, user: &str, private_key_pem: &str) -> IngestResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(private_key_pem).map_err(|err| {
            ingest_error!(ErrorKind::ValidationFailed, "Failed to parse Snowflake private key")
                .with_source(err)
        })?;

        // Fingerprint: SHA-256 over the DER-encoded public key.
        let public_key_der = private_key.to_public_key().to_public_key_der().map_err(|err| {
            ingest_error!(ErrorKind::ValidationFailed, "Failed to encode public key").with_source(err)
        })?;
        let fingerprint = base64::engine::general_purpose::STANDARD
            .encode(Sha256::digest(public_key_der.as_bytes()));

        let account = account.to_uppercase();
        let user = user.to_uppercase();
        let issuer = format!("{account}.{user}.SHA256:{fingerprint}");
        let subject = format!("{account}.{user}");

        let private_key_der = private_key.to_pkcs8_der().map_err(|err| {
            ingest_error!(ErrorKind::ValidationFailed, "Failed to encode private key").with_source(err)
        })?;
        let encoding_key = EncodingKey::from_rsa_der(private_key_der.as_bytes());

        let mut jwt = Self {
            encoding_key,
            issuer,
            subject,
            token: String::new(),
            expires_at: UNIX_EPOCH,
        };
        jwt.refresh()?;
        Ok(jwt)
    }

    fn refresh(&mut self) -> IngestResult<()> {
        let iat = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| ingest_error!(ErrorKind::Unknown, "System clock error").with_source(err))?
            .as_secs();
        let exp = iat + TOKEN_LIFETIME_SECS;

        let claims = JwtClaims {
            iss: self.issuer.clone(),
            sub: self.subject.clone(),
            iat,
            exp,
        };
        self.token = encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|err| {
                ingest_error!(ErrorKind::ValidationFailed, "Failed to sign Snowflake JWT")
                    .with_source(err)
            })?;
        self.expires_at = UNIX_EPOCH + Duration::from_secs(exp);
        Ok(())
    }

    fn token(&mut self) -> IngestResult<String> {
        let refresh_at = self.expires_at - TOKEN_REFRESH_BUFFER;
        if SystemTime::now() >= refresh_at {
            self.refresh()?;
        }
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct StatementResponse {
    #[serde(default)]
    data: Option<Vec<Vec<Option<String>>>>,
    #[serde(default)]
    message: Option<String>,
}

pub struct SnowflakeAdapter {
    http: reqwest::Client,
    base_url: String,
    jwt: Mutex<KeyPairJwt>,
    warehouse: String,
    database: String,
    schema: String,
    stage: Option<(ObjectStage, S3Config)>,
}

impl SnowflakeAdapter {
    pub async fn connect(config: &SnowflakeConfig, s3: Option<&S3Config>) -> IngestResult<Self> {
        config
            .validate()
            .map_err(|err| ingest_error!(ErrorKind::ValidationFailed, "Invalid Snowflake config", err))?;

        let private_key_pem = std::fs::read_to_string(&config.private_key_path).map_err(|err| {
            ingest_error!(
                ErrorKind::ValidationFailed,
                "Failed to read Snowflake private key",
                config.private_key_path.clone()
            )
            .with_source(err)
        })?;
        let jwt = KeyPairJwt::new(&config.account, &config.username, &private_key_pem)?;

        let stage = match s3 {
            Some(s3) => Some((ObjectStage::s3(s3)?, s3.clone())),
            None => None,
        };

        let adapter = Self {
            http: reqwest::Client::new(),
            base_url: format!(
                "https://{}.snowflakecomputing.com",
                config.account.to_lowercase()
            ),
            jwt: Mutex::new(jwt),
            warehouse: config.warehouse.clone(),
            database: config.db.clone(),
            schema: config.schema.clone().unwrap_or_else(|| "public".to_owned()),
            stage,
        };

        adapter
            .execute(format!(
                "CREATE SCHEMA IF NOT EXISTS {}.{}",
                adapter.database, adapter.schema
            ))
            .await?;

        Ok(adapter)
    }

    fn qualified(&self, table_name: &str) -> String {
        format!("{}.{}.{table_name}", self.database, self.schema)
    }

    async fn execute(&self, statement: String) -> IngestResult<StatementResponse> {
        debug!(statement = %statement, "executing Snowflake statement");

        let token = self.jwt.lock().token()?;
        let body = serde_json::json!({
            "statement": statement,
            "warehouse": self.warehouse,
            "database": self.database,
            "schema": self.schema,
            "timeout": 60,
        });

        let response = self
            .http
            .post(format!("{}/api/v2/statements", self.base_url))
            .bearer_auth(token)
            .header("X-Snowflake-Authorization-Token-Type", "KEYPAIR_JWT")
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                ingest_error!(ErrorKind::ConnectionFailed, "Snowflake request failed").with_source(err)
            })?;

        let status = response.status();
        let parsed: StatementResponse = response.json().await.unwrap_or(StatementResponse {
            data: None,
            message: None,
        });

        if status.is_success() {
            return Ok(parsed);
        }

        let message = parsed.message.unwrap_or_else(|| status.to_string());
        let kind = if status.is_server_error() || status.as_u16() == 429 {
            ErrorKind::ApiThrottled
        } else {
            ErrorKind::QueryFailed
        };
        Err(ingest_error!(kind, "Snowflake statement failed", message))
    }

    async fn copy_from_stage(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        let Some((stage, s3)) = &self.stage else {
            return self.insert_literals(table, rows).await;
        };

        let file_name = StagedFileName {
            table: table.name.clone(),
            token_id: "copy".to_owned(),
            rows: rows.len(),
            date: Utc::now(),
        }
        .render();

        stage.put_rows(&file_name, rows).await?;

        let credentials = match (&s3.access_key_id, &s3.secret_access_key) {
            (Some(key), Some(secret)) => format!(
                " CREDENTIALS = (AWS_KEY_ID = '{key}' AWS_SECRET_KEY = '{}')",
                secret.expose_secret()
            ),
            _ => String::new(),
        };

        let copy = format!(
            "COPY INTO {} FROM '{}'{credentials} \
             FILE_FORMAT = (TYPE = JSON) MATCH_BY_COLUMN_NAME = CASE_INSENSITIVE",
            self.qualified(&table.name),
            stage.uri(&file_name)
        );
        let result = self.execute(copy).await.map(|_| ());

        let _ = stage.delete(&file_name).await;
        result
    }

    async fn insert_literals(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        let columns: Vec<(&String, &SqlColumn)> = table.columns.iter().collect();

        let column_list = columns
            .iter()
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        let tuples = rows
            .iter()
            .map(|row| {
                let rendered = row_values(row, &columns)
                    .iter()
                    .map(render_literal)
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({rendered})")
            })
            .collect::<Vec<_>>()
            .join(", ");

        self.execute(format!(
            "INSERT INTO {} ({column_list}) VALUES {tuples}",
            self.qualified(&table.name)
        ))
        .await
        .map(|_| ())
    }

    /// Snowflake's PK constraints are informational; merge is delete then
    /// load, like Redshift.
    async fn merge_rows(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        if table.has_pk() {
            let key_list = table
                .pk_fields
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            let tuples = rows
                .iter()
                .map(|row| {
                    let keys = table
                        .pk_fields
                        .iter()
                        .map(|field| {
                            let value = row
                                .as_map()
                                .get(field)
                                .map(|v| SqlValue::from_json(v, &SqlColumn::new("text", None)))
                                .unwrap_or(SqlValue::Null);
                            render_literal(&value)
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({keys})")
                })
                .collect::<Vec<_>>()
                .join(", ");

            self.execute(format!(
                "DELETE FROM {} WHERE ({key_list}) IN ({tuples})",
                self.qualified(&table.name)
            ))
            .await?;
        }

        self.copy_from_stage(table, rows).await
    }
}

#[async_trait]
impl SinkAdapter for SnowflakeAdapter {
    fn sink_type(&self) -> &'static str {
        "snowflake"
    }

    async fn test_connection(&self) -> IngestResult<()> {
        self.execute("SELECT 1".to_owned()).await.map(|_| ())
    }

    async fn get_table_schema(&self, table_name: &str) -> IngestResult<Table> {
        let response = self
            .execute(format!(
                "SELECT column_name, data_type FROM {}.information_schema.columns \
                 WHERE table_schema = UPPER('{}') AND table_name = UPPER('{}')",
                self.database,
                self.schema.replace('\'', ""),
                table_name.replace('\'', "")
            ))
            .await?;

        let mut table = Table::new(table_name);
        for row in response.data.unwrap_or_default() {
            let (Some(Some(column)), Some(Some(db_type))) = (row.first(), row.get(1)) else {
                continue;
            };
            // Unquoted identifiers come back upper-cased.
            table.columns.insert(
                column.to_lowercase(),
                SqlColumn::new(db_type.clone(), data_type_from_db(db_type)),
            );
        }

        Ok(table)
    }

    async fn create_table(&self, table: &Table) -> IngestResult<()> {
        let mut parts: Vec<String> = table
            .columns
            .iter()
            .map(|(name, column)| format!("{name} {}", column.sql_type))
            .collect();

        if table.has_pk() {
            let fields = table
                .pk_fields
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!(
                "CONSTRAINT {}_pk PRIMARY KEY ({fields})",
                table.name
            ));
        }

        self.execute(format!(
            "CREATE TABLE {} ({})",
            self.qualified(&table.name),
            parts.join(", ")
        ))
        .await
        .map(|_| ())
    }

    async fn patch_table_schema(&self, patch: &Table) -> IngestResult<()> {
        let qualified = self.qualified(&patch.name);

        for (name, column) in &patch.columns {
            self.execute(format!(
                "ALTER TABLE {qualified} ADD COLUMN {name} {}",
                column.sql_type
            ))
            .await?;
        }

        if patch.delete_pk_fields {
            self.execute(format!(
                "ALTER TABLE {qualified} DROP CONSTRAINT IF EXISTS {}_pk",
                patch.name
            ))
            .await?;
        }
        if patch.has_pk() {
            let fields = patch
                .pk_fields
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            self.execute(format!(
                "ALTER TABLE {qualified} ADD CONSTRAINT {}_pk PRIMARY KEY ({fields})",
                patch.name
            ))
            .await?;
        }

        Ok(())
    }

    async fn insert(&self, table: &Table, row: &Event) -> IngestResult<()> {
        self.insert_literals(table, std::slice::from_ref(row)).await
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
        Ok(())
    }
}

fn render_literal(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => "NULL".to_owned(),
        SqlValue::Bool(b) => b.to_string(),
        SqlValue::Int(i) => i.to_string(),
        SqlValue::Float(f) => f.to_string(),
        SqlValue::Timestamp(ts) => format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S%.6f")),
        SqlValue::Text(s) => format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''")),
    }
}

fn data_type_from_db(db_type: &str) -> Option<DataType> {
    match db_type {
        "TEXT" | "VARCHAR" | "STRING" => Some(DataType::String),
        "NUMBER" => Some(DataType::Int64),
        "FLOAT" | "DOUBLE" | "REAL" => Some(DataType::Float64),
        "BOOLEAN" => Some(DataType::Bool),
        t if t.starts_with("TIMESTAMP") => Some(DataType::Timestamp),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_escape_quotes() {
        assert_eq!(render_literal(&SqlValue::Text("O'Brien".into())), "'O''Brien'");
        assert_eq!(render_literal(&SqlValue::Null), "NULL");
        assert_eq!(render_literal(&SqlValue::Bool(true)), "true");
    }

    #[test]
    fn snowflake_types_map_back() {
        assert_eq!(data_type_from_db("NUMBER"), Some(DataType::Int64));
        assert_eq!(data_type_from_db("TIMESTAMP_NTZ"), Some(DataType::Timestamp));
        assert_eq!(data_type_from_db("VARIANT"), None);
    }
}
