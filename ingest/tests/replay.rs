//! End-to-end replay tests: fallback files fed back through a destination,
//! with table-level idempotence across partial failures.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::json;

use ingest::error::{ErrorKind, IngestResult};
use ingest::fallback::FallbackService;
use ingest::logfiles::{FALLBACK_PREFIX, FallbackFileName};
use ingest::routing::{CreatedDestination, DestinationRegistry, StorageFactory};
use ingest::schema::{BatchHeader, ParseFn};
use ingest::sink::{Storage, StoreReport, TableResult};
use ingest::types::{Event, FailedEvent};
use ingest_config::AppConfig;

/// A storage that parses the payload with the provided parser, records the
/// replayed events, and returns scripted per-table reports.
struct RecordingStorage {
    id: String,
    inner: Mutex<Recorded>,
}

#[derive(Default)]
struct Recorded {
    replayed: Vec<Event>,
    skip_sets: Vec<HashSet<String>>,
    reports: VecDeque<StoreReport>,
}

impl RecordingStorage {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            inner: Mutex::new(Recorded::default()),
        })
    }

    fn script_report(&self, report: StoreReport) {
        self.inner.lock().reports.push_back(report);
    }

    fn replayed_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .replayed
            .iter()
            .map(Event::event_id)
            .collect()
    }

    fn skip_sets(&self) -> Vec<HashSet<String>> {
        self.inner.lock().skip_sets.clone()
    }
}

#[async_trait]
impl Storage for RecordingStorage {
    fn id(&self) -> &str {
        &self.id
    }

    fn sink_type(&self) -> &'static str {
        "recording"
    }

    fn is_staging(&self) -> bool {
        false
    }

    async fn store(
        &self,
        file_name: &str,
        payload: &[u8],
        already_uploaded: &HashSet<String>,
    ) -> IngestResult<StoreReport> {
        self.store_with_parse_fn(file_name, payload, already_uploaded, ingest::schema::parse_json)
            .await
    }

    async fn store_with_parse_fn(
        &self,
        _file_name: &str,
        payload: &[u8],
        already_uploaded: &HashSet<String>,
        parse: ParseFn,
    ) -> IngestResult<StoreReport> {
        let mut inner = self.inner.lock();
        inner.skip_sets.push(already_uploaded.clone());

        for line in payload.split(|b| *b == b'\n') {
            if line.is_empty() {
                continue;
            }
            inner.replayed.push(parse(line)?);
        }

        Ok(inner.reports.pop_front().unwrap_or_default())
    }

    async fn sync_store(
        &self,
        _overridden_header: Option<&BatchHeader>,
        objects: Vec<Event>,
    ) -> IngestResult<usize> {
        Ok(objects.len())
    }

    async fn insert(&self, _header: &BatchHeader, _row: Event) -> IngestResult<()> {
        Ok(())
    }

    async fn fallback(&self, _events: &[FailedEvent]) {}

    async fn close(&self) -> IngestResult<()> {
        Ok(())
    }
}

struct RecordingFactory {
    storage: Arc<RecordingStorage>,
}

#[async_trait]
impl StorageFactory for RecordingFactory {
    async fn create(
        &self,
        _destination_id: &str,
        _config: &ingest_config::DestinationConfig,
    ) -> IngestResult<CreatedDestination> {
        Ok(CreatedDestination {
            storage: Arc::clone(&self.storage) as Arc<dyn Storage>,
            queue: None,
        })
    }
}

fn app_config() -> AppConfig {
    serde_yaml::from_str(
        r#"
tokens:
  js: ["tok"]
destinations:
  dst:
    type: postgres
"#,
    )
    .unwrap()
}

fn fallback_line(id: &str) -> String {
    serde_json::to_string(&FailedEvent {
        event: json!({"eventn_ctx": {"event_id": id}, "v": 1}),
        error: "syntax error".into(),
        event_id: id.into(),
    })
    .unwrap()
}

async fn setup(
    events_dir: &std::path::Path,
) -> (Arc<RecordingStorage>, FallbackService, String) {
    let storage = RecordingStorage::new("dst");
    let registry = DestinationRegistry::new(
        Arc::new(RecordingFactory {
            storage: Arc::clone(&storage),
        }),
        &app_config(),
        1,
    )
    .await;
    let service = FallbackService::new(events_dir, registry).unwrap();

    let file_name = FallbackFileName {
        destination_id: "dst".into(),
        date: Utc::now(),
    }
    .render();
    let content = format!("{}\n{}\n", fallback_line("e1"), fallback_line("e2"));
    std::fs::write(events_dir.join("failed").join(&file_name), content).unwrap();

    (storage, service, file_name)
}

#[tokio::test]
async fn replay_unwraps_envelopes_and_archives_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, service, file_name) = setup(dir.path()).await;

    service.replay(&file_name, "", false).await.unwrap();

    // The destination id was recovered from the file name and the
    // FailedEvent envelopes were unwrapped back into events.
    assert_eq!(storage.replayed_ids(), vec!["e1", "e2"]);

    // Fully replayed files are archived out of the fallback dir.
    assert!(!dir.path().join("failed").join(&file_name).exists());
    assert!(dir.path().join("archive").join(&file_name).exists());
}

#[tokio::test]
async fn partial_failure_reports_and_resumes_per_table() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, service, file_name) = setup(dir.path()).await;

    let mut report = StoreReport::default();
    report.per_table.insert("events".into(), TableResult::ok(1));
    report
        .per_table
        .insert("users".into(), TableResult::failed(1, "boom"));
    storage.script_report(report);

    let err = service.replay(&file_name, "dst", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Many);
    assert!(err.to_string().contains("users"));

    // The file stays in place for the next attempt.
    assert!(dir.path().join("failed").join(&file_name).exists());

    // Second replay: the uploaded table is skipped.
    let mut report = StoreReport::default();
    report.per_table.insert("users".into(), TableResult::ok(1));
    storage.script_report(report);

    service.replay(&file_name, "dst", false).await.unwrap();

    let skip_sets = storage.skip_sets();
    assert_eq!(skip_sets.len(), 2);
    assert!(skip_sets[0].is_empty());
    assert!(skip_sets[1].contains("events"));
    assert!(!skip_sets[1].contains("users"));

    assert!(dir.path().join("archive").join(&file_name).exists());
}

#[tokio::test]
async fn unknown_destination_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (_storage, service, file_name) = setup(dir.path()).await;

    let err = service.replay(&file_name, "missing", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DestinationNotFound);
}

#[tokio::test]
async fn malformed_file_name_is_terminal_without_explicit_destination() {
    let dir = tempfile::tempdir().unwrap();
    let (_storage, service, _file_name) = setup(dir.path()).await;

    let bad_name = format!("{FALLBACK_PREFIX}oops.log");
    std::fs::write(dir.path().join("failed").join(&bad_name), "{}\n").unwrap();

    let err = service.replay(&bad_name, "", false).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedFileName);
}

#[tokio::test]
async fn raw_mode_bypasses_the_envelope() {
    let dir = tempfile::tempdir().unwrap();
    let (storage, service, _file_name) = setup(dir.path()).await;

    let raw_name = FallbackFileName {
        destination_id: "dst".into(),
        date: Utc::now() + chrono::Duration::seconds(1),
    }
    .render();
    std::fs::write(
        dir.path().join("failed").join(&raw_name),
        "{\"eventn_ctx\":{\"event_id\":\"raw1\"}}\n",
    )
    .unwrap();

    service.replay(&raw_name, "dst", true).await.unwrap();
    assert_eq!(storage.replayed_ids(), vec!["raw1"]);
}
