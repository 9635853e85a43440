//! Google Analytics Measurement Protocol sink. Insert-only, like every
//! HTTP-API sink.

use async_trait::async_trait;
use serde_json::Value;

use ingest::error::{ErrorKind, IngestResult};
use ingest::ingest_error;
use ingest::sink::SinkAdapter;
use ingest::table::Table;
use ingest::types::Event;
use ingest_config::GoogleAnalyticsConfig;

use crate::facebook::classify_status;

const COLLECT_URL: &str = "https://www.google-analytics.com/collect";

pub struct GoogleAnalyticsAdapter {
    http: reqwest::Client,
    config: GoogleAnalyticsConfig,
}

impl GoogleAnalyticsAdapter {
    pub fn new(config: GoogleAnalyticsConfig) -> IngestResult<Self> {
        config.validate().map_err(|err| {
            ingest_error!(ErrorKind::ValidationFailed, "Invalid Google Analytics config", err)
        })?;

        Ok(Self {
            http: reqwest::Client::new(),
            config,
        })
    }

    /// Renders the flat event as Measurement Protocol form parameters.
    /// Scalars map to their string form; the event id doubles as the
    /// client id when none is present.
    fn form_params(&self, row: &Event) -> Vec<(String, String)> {
        let mut params = vec![
            ("v".to_owned(), "1".to_owned()),
            ("tid".to_owned(), self.config.tracking_id.clone()),
            ("t".to_owned(), "event".to_owned()),
        ];

        let mut has_cid = false;
        for (key, value) in row.as_map() {
            let rendered = match value {
                Value::Null => continue,
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if key == "cid" {
                has_cid = true;
            }
            params.push((key.clone(), rendered));
        }

        if !has_cid {
            params.push(("cid".to_owned(), row.event_id()));
        }

        params
    }
}

#[async_trait]
impl SinkAdapter for GoogleAnalyticsAdapter {
    fn sink_type(&self) -> &'static str {
        "google_analytics"
    }

    async fn test_connection(&self) -> IngestResult<()> {
        self.http
            .get("https://www.google-analytics.com")
            .send()
            .await
            .map(|_| ())
            .map_err(|err| {
                ingest_error!(ErrorKind::ConnectionFailed, "Google Analytics unreachable")
                    .with_source(err)
            })
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
        let response = self
            .http
            .post(COLLECT_URL)
            .form(&self.form_params(row))
            .send()
            .await
            .map_err(|err| {
                ingest_error!(ErrorKind::ConnectionFailed, "Google Analytics unreachable")
                    .with_source(err)
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ingest_error!(
                classify_status(status),
                "Google Analytics hit rejected",
                status.to_string()
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
