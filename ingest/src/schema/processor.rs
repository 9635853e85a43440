use std::collections::{BTreeMap, HashMap, HashSet};

use serde_json::Value;

use crate::enrichment::Rule;
use crate::error::{ErrorKind, IngestResult};
use crate::{bail, ingest_error};
use crate::schema::flatten::Flattener;
use crate::schema::mapper::FieldMapper;
use crate::schema::template::TableNameTemplate;
use crate::schema::typing::{DataType, TypeResolver};
use crate::types::{Event, FailedEvent};

/// The derived `(table name, typed columns)` shape of a group of rows.
///
/// Two rows share a header iff their column set and per-column types are
/// identical; the sink-side reconciliation is responsible for widening
/// across headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchHeader {
    pub table_name: String,
    pub fields: BTreeMap<String, DataType>,
}

impl BatchHeader {
    /// An empty header groups nothing and must be dropped silently.
    pub fn exists(&self) -> bool {
        !self.table_name.is_empty() && !self.fields.is_empty()
    }

    /// Stable grouping key: table name plus every `column:type` pair.
    pub fn key(&self) -> String {
        use std::fmt::Write;

        let mut key = self.table_name.clone();
        for (column, data_type) in &self.fields {
            let _ = write!(key, "|{column}:{data_type:?}");
        }
        key
    }
}

/// Rows sharing one derived header, in arrival order.
#[derive(Debug, Clone)]
pub struct ProcessedGroup {
    pub header: BatchHeader,
    pub rows: Vec<Event>,
}

impl ProcessedGroup {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Outcome of processing a file payload: row groups, rows that failed, and
/// the number of rows skipped via the `already_uploaded` set or
/// [`ErrorKind::SkipObject`].
#[derive(Debug, Default)]
pub struct ProcessedPayload {
    pub groups: Vec<ProcessedGroup>,
    pub failed: Vec<FailedEvent>,
    pub skipped: usize,
}

/// Per-line parser used by the batch and replay paths.
pub type ParseFn = fn(&[u8]) -> IngestResult<Event>;

/// Parses one JSON event line.
pub fn parse_json(line: &[u8]) -> IngestResult<Event> {
    Event::from_slice(line)
        .map_err(|err| ingest_error!(ErrorKind::SerializationFailed, "Malformed event line", err))
}

/// Parses one fallback log line, unwrapping the [`FailedEvent`] envelope and
/// returning the original event.
pub fn parse_fallback(line: &[u8]) -> IngestResult<Event> {
    let failed: FailedEvent = serde_json::from_slice(line).map_err(|err| {
        ingest_error!(ErrorKind::SerializationFailed, "Malformed fallback line", err)
    })?;

    match failed.event {
        Value::Object(map) => Ok(Event::new(map)),
        other => Err(ingest_error!(
            ErrorKind::SerializationFailed,
            "Fallback line does not wrap an object",
            other
        )),
    }
}

/// Composes enrichment, mapping, flattening and typing into the per-event
/// transform, and groups rows by their derived [`BatchHeader`].
pub struct Processor {
    destination_id: String,
    template: TableNameTemplate,
    mapper: FieldMapper,
    rules: Vec<Box<dyn Rule>>,
    flattener: Flattener,
    type_resolver: TypeResolver,
    break_on_error: bool,
    max_columns: usize,
}

impl Processor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        destination_id: impl Into<String>,
        template: TableNameTemplate,
        mapper: FieldMapper,
        rules: Vec<Box<dyn Rule>>,
        flattener: Flattener,
        type_resolver: TypeResolver,
        break_on_error: bool,
        max_columns: usize,
    ) -> Self {
        Self {
            destination_id: destination_id.into(),
            template,
            mapper,
            rules,
            flattener,
            type_resolver,
            break_on_error,
            max_columns,
        }
    }

    pub fn destination_id(&self) -> &str {
        &self.destination_id
    }

    /// Processes a single event for the streaming path.
    ///
    /// Returns the derived header and the flattened, mapped row. Rows
    /// without an event id and rows whose table name cannot be rendered
    /// surface as [`ErrorKind::SkipObject`].
    pub fn process_event(&self, event: Event) -> IngestResult<(BatchHeader, Event)> {
        let mut event = event;
        for rule in &self.rules {
            rule.apply(&mut event);
        }

        let table_name = match self.template.render(&event) {
            Ok(name) => name,
            Err(err) if err.kind() == ErrorKind::TemplateFailed => {
                return Err(ingest_error!(
                    ErrorKind::SkipObject,
                    "Table name template evaluated empty",
                    err
                ));
            }
            Err(err) => return Err(err),
        };

        let row = match self.flattener {
            Flattener::Full => {
                let flat = self.flattener.flatten(&event)?;
                self.mapper.map_flat(flat)?
            }
            Flattener::Passthrough => {
                let mapped = self.mapper.map(event)?;
                self.flattener.flatten(&mapped)?
            }
        };

        let row = Event::new(row);
        if row.event_id().is_empty() {
            bail!(
                ErrorKind::SkipObject,
                "Event has no event id after processing"
            );
        }

        let fields = self.type_resolver.resolve(row.as_map());
        if self.max_columns > 0 && fields.len() > self.max_columns {
            bail!(
                ErrorKind::MaxColumns,
                "Derived header exceeds the column cap",
                format!(
                    "table {table_name} derived {} columns, cap is {}",
                    fields.len(),
                    self.max_columns
                )
            );
        }

        Ok((BatchHeader { table_name, fields }, row))
    }

    /// Processes a newline-delimited file payload for the batch and replay
    /// paths.
    ///
    /// Rows whose table name is in `already_uploaded` are skipped, which is
    /// what makes a crashed batch run resumable. With `break_on_error`
    /// the first bad row aborts; otherwise bad rows are accumulated as
    /// [`FailedEvent`]s for the caller to persist to fallback.
    pub fn process_file_payload(
        &self,
        file_name: &str,
        payload: &[u8],
        already_uploaded: &HashSet<String>,
        parse: ParseFn,
    ) -> IngestResult<ProcessedPayload> {
        let mut out = ProcessedPayload::default();
        let mut group_index: HashMap<String, usize> = HashMap::new();

        for line in payload.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let event = match parse(line) {
                Ok(event) => event,
                Err(err) => {
                    if self.break_on_error {
                        return Err(err);
                    }
                    tracing::warn!(
                        destination = %self.destination_id,
                        file = file_name,
                        error = %err,
                        "skipping malformed line"
                    );
                    out.failed.push(FailedEvent {
                        event: Value::String(String::from_utf8_lossy(line).into_owned()),
                        error: err.to_string(),
                        event_id: String::new(),
                    });
                    continue;
                }
            };

            match self.process_event(event.clone()) {
                Ok((header, row)) => {
                    if already_uploaded.contains(&header.table_name) {
                        out.skipped += 1;
                        continue;
                    }

                    let key = header.key();
                    match group_index.get(&key) {
                        Some(&i) => out.groups[i].rows.push(row),
                        None => {
                            group_index.insert(key, out.groups.len());
                            out.groups.push(ProcessedGroup {
                                header,
                                rows: vec![row],
                            });
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::SkipObject => {
                    out.skipped += 1;
                }
                Err(err) => {
                    if self.break_on_error {
                        return Err(err);
                    }
                    out.failed.push(FailedEvent::new(&event, &err));
                }
            }
        }

        Ok(out)
    }

    /// Processes already-parsed objects, aborting on the first error. Used
    /// by the recognized-users backfill path.
    pub fn process_objects(&self, objects: Vec<Event>) -> IngestResult<Vec<ProcessedGroup>> {
        let mut groups: Vec<ProcessedGroup> = Vec::new();
        let mut group_index: HashMap<String, usize> = HashMap::new();

        for event in objects {
            let (header, row) = match self.process_event(event) {
                Ok(processed) => processed,
                Err(err) if err.kind() == ErrorKind::SkipObject => continue,
                Err(err) => return Err(err),
            };

            let key = header.key();
            match group_index.get(&key) {
                Some(&i) => groups[i].rows.push(row),
                None => {
                    group_index.insert(key, groups.len());
                    groups.push(ProcessedGroup {
                        header,
                        rows: vec![row],
                    });
                }
            }
        }

        Ok(groups)
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("destination_id", &self.destination_id)
            .field("flattener", &self.flattener)
            .field("break_on_error", &self.break_on_error)
            .field("max_columns", &self.max_columns)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: serde_json::Value) -> Event {
        Event::new(value.as_object().unwrap().clone())
    }

    fn processor(max_columns: usize, break_on_error: bool) -> Processor {
        Processor::new(
            "dst",
            TableNameTemplate::parse(Some("events")).unwrap(),
            FieldMapper::identity(),
            Vec::new(),
            Flattener::Full,
            TypeResolver::Full,
            break_on_error,
            max_columns,
        )
    }

    fn line_payload(events: &[serde_json::Value]) -> Vec<u8> {
        let mut out = Vec::new();
        for e in events {
            out.extend_from_slice(serde_json::to_string(e).unwrap().as_bytes());
            out.push(b'\n');
        }
        out
    }

    #[test]
    fn process_event_derives_header_and_flat_row() {
        let p = processor(0, false);
        let (header, row) = p
            .process_event(event(json!({
                "eventn_ctx": {"event_id": "e1"},
                "user": {"email": "a@x"},
                "value": 3
            })))
            .unwrap();

        assert_eq!(header.table_name, "events");
        assert_eq!(header.fields["user_email"], DataType::String);
        assert_eq!(header.fields["value"], DataType::Int64);
        assert_eq!(row.as_map().get("eventn_ctx_event_id"), Some(&json!("e1")));
    }

    #[test]
    fn missing_event_id_skips() {
        let p = processor(0, false);
        let err = p.process_event(event(json!({"value": 3}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SkipObject);
    }

    #[test]
    fn unrenderable_table_name_skips() {
        let p = Processor::new(
            "dst",
            TableNameTemplate::parse(Some("events_{{/kind}}")).unwrap(),
            FieldMapper::identity(),
            Vec::new(),
            Flattener::Full,
            TypeResolver::Full,
            false,
            0,
        );
        let err = p
            .process_event(event(json!({"eventn_ctx": {"event_id": "e1"}})))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SkipObject);
    }

    #[test]
    fn column_cap_is_enforced_on_the_header() {
        let p = processor(2, false);
        let err = p
            .process_event(event(json!({
                "eventn_ctx": {"event_id": "e1"},
                "a": 1,
                "b": 2
            })))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MaxColumns);
    }

    #[test]
    fn file_payload_groups_by_header() {
        let p = processor(0, false);
        let payload = line_payload(&[
            json!({"eventn_ctx": {"event_id": "1"}, "v": 1}),
            json!({"eventn_ctx": {"event_id": "2"}, "v": 2}),
            json!({"eventn_ctx": {"event_id": "3"}, "v": 1.5}),
        ]);

        let result = p
            .process_file_payload("f.ndjson", &payload, &HashSet::new(), parse_json)
            .unwrap();

        // Int64 and Float64 rows derive distinct headers.
        assert_eq!(result.groups.len(), 2);
        assert_eq!(result.groups[0].rows.len(), 2);
        assert_eq!(result.groups[0].header.fields["v"], DataType::Int64);
        assert_eq!(result.groups[1].header.fields["v"], DataType::Float64);
        assert!(result.failed.is_empty());
    }

    #[test]
    fn already_uploaded_tables_are_skipped() {
        let p = processor(0, false);
        let payload = line_payload(&[json!({"eventn_ctx": {"event_id": "1"}, "v": 1})]);

        let uploaded: HashSet<String> = ["events".to_owned()].into();
        let result = p
            .process_file_payload("f.ndjson", &payload, &uploaded, parse_json)
            .unwrap();
        assert!(result.groups.is_empty());
        assert_eq!(result.skipped, 1);
    }

    #[test]
    fn malformed_lines_accumulate_as_failed_events() {
        let p = processor(0, false);
        let mut payload = line_payload(&[json!({"eventn_ctx": {"event_id": "1"}, "v": 1})]);
        payload.extend_from_slice(b"not json\n");

        let result = p
            .process_file_payload("f.ndjson", &payload, &HashSet::new(), parse_json)
            .unwrap();
        assert_eq!(result.groups.len(), 1);
        assert_eq!(result.failed.len(), 1);
    }

    #[test]
    fn break_on_error_aborts_the_batch() {
        let p = processor(0, true);
        let payload = b"not json\n".to_vec();
        assert!(
            p.process_file_payload("f.ndjson", &payload, &HashSet::new(), parse_json)
                .is_err()
        );
    }

    #[test]
    fn fallback_parser_unwraps_the_envelope() {
        let line = serde_json::to_string(&FailedEvent {
            event: json!({"eventn_ctx": {"event_id": "e9"}, "v": 7}),
            error: "syntax error".into(),
            event_id: "e9".into(),
        })
        .unwrap();

        let event = parse_fallback(line.as_bytes()).unwrap();
        assert_eq!(event.event_id(), "e9");
    }
}
