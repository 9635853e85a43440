//! Facebook Conversions API sink. HTTP-API sinks have no DDL surface:
//! schema calls vacuously succeed and only `insert` writes.

use async_trait::async_trait;
use serde_json::Value;

use ingest::error::{ErrorKind, IngestResult};
use ingest::ingest_error;
use ingest::sink::SinkAdapter;
use ingest::table::Table;
use ingest::types::Event;
use ingest_config::FacebookConfig;

const GRAPH_API_BASE: &str = "https://graph.facebook.com/v11.0";

/// Classifies an HTTP-API sink response status: throttling and server
/// errors retry, client errors go to fallback.
pub(crate) fn classify_status(status: reqwest::StatusCode) -> ErrorKind {
    if status.is_server_error() || status.as_u16() == 429 {
        ErrorKind::ApiThrottled
    } else {
        ErrorKind::ApiRejected
    }
}

pub struct FacebookAdapter {
    http: reqwest::Client,
    config: FacebookConfig,
}

impl FacebookAdapter {
    pub fn new(config: FacebookConfig) -> IngestResult<Self> {
        config
            .validate()
            .map_err(|err| ingest_error!(ErrorKind::ValidationFailed, "Invalid Facebook config", err))?;

        Ok(Self {
            http: reqwest::Client::new(),
            config,
        })
    }

    fn events_url(&self) -> String {
        format!("{GRAPH_API_BASE}/{}/events", self.config.pixel_id)
    }
}

#[async_trait]
impl SinkAdapter for FacebookAdapter {
    fn sink_type(&self) -> &'static str {
        "facebook"
    }

    /// Access check standing in for a schema check.
    async fn test_connection(&self) -> IngestResult<()> {
        let response = self
            .http
            .get(format!("{GRAPH_API_BASE}/{}", self.config.pixel_id))
            .query(&[("access_token", self.config.access_token.expose_secret())])
            .send()
            .await
            .map_err(|err| {
                ingest_error!(ErrorKind::ConnectionFailed, "Facebook API unreachable").with_source(err)
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ingest_error!(
                classify_status(status),
                "Facebook access check failed",
                status.to_string()
            ))
        }
    }

    async fn get_table_schema(&self, table_name: &str) -> IngestResult<Table> {
        Ok(Table::new(table_name))
    }

    async fn create_table(&self, _table: &Table) -> IngestResult<()> {
        Ok(())
    }

    async fn patch_table_schema(&self, _patch: &Table) -> IngestResult<()> {
        Ok(())
    }

    async fn insert(&self, _table: &Table, row: &Event) -> IngestResult<()> {
        let body = serde_json::json!({
            "data": [Value::Object(row.as_map().clone())],
        });

        let response = self
            .http
            .post(self.events_url())
            .query(&[("access_token", self.config.access_token.expose_secret())])
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                ingest_error!(ErrorKind::ConnectionFailed, "Facebook API unreachable").with_source(err)
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let detail = response.text().await.unwrap_or_else(|_| status.to_string());
            Err(ingest_error!(
                classify_status(status),
                "Facebook event rejected",
                detail
            ))
        }
    }

    async fn bulk_insert(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        for row in rows {
            self.insert(table, row).await?;
        }
        Ok(())
    }

    async fn bulk_update(&self, table: &Table, rows: &[Event]) -> IngestResult<()> {
        self.bulk_insert(table, rows).await
    }

    async fn close(&self) -> IngestResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            ErrorKind::ApiThrottled
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY),
            ErrorKind::ApiThrottled
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_REQUEST),
            ErrorKind::ApiRejected
        );
    }
}
