//! Cloud object staging shared by the object-store-backed sinks.
//!
//! One `object_store` wrapper covers every provider: S3 for the write-only
//! sink and the Redshift/Snowflake COPY stages, GCS for BigQuery batch
//! loads. Staged objects are NDJSON renderings of processed rows.

use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};

use ingest::error::{ErrorKind, IngestResult};
use ingest::ingest_error;
use ingest::types::Event;
use ingest_config::{GoogleConfig, S3Config};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provider {
    S3,
    Gcs,
}

/// A bucket (plus optional folder prefix) the pipeline stages batches into.
pub struct ObjectStage {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    folder: Option<String>,
    provider: Provider,
}

impl ObjectStage {
    pub fn s3(config: &S3Config) -> IngestResult<Self> {
        config
            .validate()
            .map_err(|err| ingest_error!(ErrorKind::ValidationFailed, "Invalid S3 config", err))?;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region);

        if let Some(access_key_id) = &config.access_key_id {
            builder = builder.with_access_key_id(access_key_id);
        }
        if let Some(secret) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret.expose_secret());
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint).with_allow_http(true);
        }

        let store = builder.build().map_err(|err| {
            ingest_error!(ErrorKind::ValidationFailed, "Failed to build S3 store").with_source(err)
        })?;

        Ok(Self {
            store: Arc::new(store),
            bucket: config.bucket.clone(),
            folder: config.folder.clone().filter(|f| !f.is_empty()),
            provider: Provider::S3,
        })
    }

    pub fn gcs(config: &GoogleConfig) -> IngestResult<Self> {
        config
            .validate()
            .map_err(|err| ingest_error!(ErrorKind::ValidationFailed, "Invalid Google config", err))?;

        let bucket = config.bucket.clone().ok_or_else(|| {
            ingest_error!(
                ErrorKind::ValidationFailed,
                "google.bucket is required for GCS staging"
            )
        })?;

        let store = GoogleCloudStorageBuilder::new()
            .with_bucket_name(&bucket)
            .with_service_account_path(&config.key_file)
            .build()
            .map_err(|err| {
                ingest_error!(ErrorKind::ValidationFailed, "Failed to build GCS store")
                    .with_source(err)
            })?;

        Ok(Self {
            store: Arc::new(store),
            bucket,
            folder: None,
            provider: Provider::Gcs,
        })
    }

    /// Object key of a staged file, folder prefix included.
    pub fn key(&self, file_name: &str) -> String {
        match &self.folder {
            Some(folder) => format!("{folder}/{file_name}"),
            None => file_name.to_owned(),
        }
    }

    /// Provider URI of a staged object, as consumed by COPY/load statements
    /// (`s3://bucket/key` or `gs://bucket/key`).
    pub fn uri(&self, file_name: &str) -> String {
        let scheme = match self.provider {
            Provider::S3 => "s3",
            Provider::Gcs => "gs",
        };
        format!("{scheme}://{}/{}", self.bucket, self.key(file_name))
    }

    /// Uploads raw bytes under the staged file name.
    pub async fn put_bytes(&self, file_name: &str, bytes: Vec<u8>) -> IngestResult<()> {
        let path = ObjectPath::from(self.key(file_name));
        self.store
            .put(&path, PutPayload::from(bytes))
            .await
            .map(|_| ())
            .map_err(|err| {
                ingest_error!(ErrorKind::QueryFailed, "Failed to upload staged object", file_name)
                    .with_source(err)
            })
    }

    /// Renders rows as NDJSON and uploads them.
    pub async fn put_rows(&self, file_name: &str, rows: &[Event]) -> IngestResult<()> {
        self.put_bytes(file_name, render_ndjson(rows)).await
    }

    pub async fn delete(&self, file_name: &str) -> IngestResult<()> {
        let path = ObjectPath::from(self.key(file_name));
        self.store.delete(&path).await.map_err(|err| {
            ingest_error!(ErrorKind::QueryFailed, "Failed to delete staged object", file_name)
                .with_source(err)
        })
    }
}

impl std::fmt::Debug for ObjectStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStage")
            .field("bucket", &self.bucket)
            .field("folder", &self.folder)
            .field("provider", &self.provider)
            .finish()
    }
}

/// One JSON object per line, trailing newline included.
pub fn render_ndjson(rows: &[Event]) -> Vec<u8> {
    let mut out = Vec::new();
    for row in rows {
        out.extend_from_slice(row.serialize().as_bytes());
        out.push(b'\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_and_uris_include_the_folder() {
        let config = S3Config {
            bucket: "events-bucket".into(),
            region: "eu-central-1".into(),
            access_key_id: Some("key".into()),
            secret_access_key: Some("secret".into()),
            endpoint: None,
            folder: Some("staged".into()),
        };
        let stage = ObjectStage::s3(&config).unwrap();

        assert_eq!(stage.key("f.ndjson"), "staged/f.ndjson");
        assert_eq!(stage.uri("f.ndjson"), "s3://events-bucket/staged/f.ndjson");
    }

    #[test]
    fn ndjson_rendering_is_line_per_row() {
        let rows = vec![
            Event::new(json!({"a": 1}).as_object().unwrap().clone()),
            Event::new(json!({"b": 2}).as_object().unwrap().clone()),
        ];
        assert_eq!(render_ndjson(&rows), b"{\"a\":1}\n{\"b\":2}\n");
    }
}
