use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::JsonPath;

/// Alias for the JSON object map every event is made of.
pub type ObjectMap = serde_json::Map<String, Value>;

/// Alias for the opaque token id attached to every accepted event.
pub type TokenId = String;

/// Key of the nested system context object.
pub const EVENTN_CTX: &str = "eventn_ctx";
/// Key of the event id inside [`EVENTN_CTX`].
pub const EVENT_ID_KEY: &str = "event_id";
/// Flat form of the event id column after flattening.
pub const FLAT_EVENT_ID_KEY: &str = "eventn_ctx_event_id";
/// Key of the ingest timestamp set by the router on accept.
pub const TIMESTAMP_KEY: &str = "_timestamp";

/// A semi-structured event payload keyed by string.
///
/// Events are opaque to the pipeline apart from two system fields: the
/// stable event id at `/eventn_ctx/event_id` and the ingest timestamp at
/// `/_timestamp`. Everything else is user-defined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Event(pub ObjectMap);

impl Event {
    pub fn new(map: ObjectMap) -> Self {
        Event(map)
    }

    /// Parses an event from a JSON byte slice. The payload must be a JSON
    /// object; any other JSON value is rejected.
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn as_map(&self) -> &ObjectMap {
        &self.0
    }

    pub fn as_map_mut(&mut self) -> &mut ObjectMap {
        &mut self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the stable event id, looking at the nested
    /// `/eventn_ctx/event_id` location first and the flattened
    /// `eventn_ctx_event_id` column second. Returns an empty string when
    /// neither is present, mirroring how the id is threaded through logs.
    pub fn event_id(&self) -> String {
        let nested = self
            .0
            .get(EVENTN_CTX)
            .and_then(Value::as_object)
            .and_then(|ctx| ctx.get(EVENT_ID_KEY));

        nested
            .or_else(|| self.0.get(FLAT_EVENT_ID_KEY))
            .map(value_to_id)
            .unwrap_or_default()
    }

    /// Sets the ingest timestamp if the event doesn't carry one already.
    pub fn ensure_timestamp(&mut self, now: DateTime<Utc>) {
        self.0.entry(TIMESTAMP_KEY.to_owned()).or_insert_with(|| {
            Value::String(now.to_rfc3339_opts(SecondsFormat::Micros, true))
        });
    }

    /// Assigns a fresh event id when none is present.
    pub fn ensure_event_id(&mut self, id: impl Into<String>) {
        if self.event_id().is_empty() {
            JsonPath::parse("/eventn_ctx/event_id").set(&mut self.0, Value::String(id.into()));
        }
    }

    /// Serializes the event to its canonical single-line JSON form.
    pub fn serialize(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_owned())
    }
}

impl From<ObjectMap> for Event {
    fn from(map: ObjectMap) -> Self {
        Event(map)
    }
}

fn value_to_id(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// An event the pipeline could not deliver, persisted as one JSON line in
/// the destination's fallback log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEvent {
    /// The original (pre-flattening) event payload.
    pub event: Value,
    /// The rendered error that caused the failure.
    pub error: String,
    /// The extracted event id, empty if the event never had one.
    #[serde(default)]
    pub event_id: String,
}

impl FailedEvent {
    pub fn new(event: &Event, error: impl ToString) -> Self {
        FailedEvent {
            event: Value::Object(event.0.clone()),
            error: error.to_string(),
            event_id: event.event_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: serde_json::Value) -> Event {
        Event(value.as_object().unwrap().clone())
    }

    #[test]
    fn event_id_reads_nested_then_flat() {
        let nested = event(json!({"eventn_ctx": {"event_id": "abc"}}));
        assert_eq!(nested.event_id(), "abc");

        let flat = event(json!({"eventn_ctx_event_id": "def"}));
        assert_eq!(flat.event_id(), "def");

        let both = event(json!({
            "eventn_ctx": {"event_id": "nested"},
            "eventn_ctx_event_id": "flat"
        }));
        assert_eq!(both.event_id(), "nested");

        assert_eq!(event(json!({})).event_id(), "");
    }

    #[test]
    fn ensure_timestamp_keeps_existing() {
        let mut e = event(json!({"_timestamp": "2020-01-01T00:00:00Z"}));
        e.ensure_timestamp(Utc::now());
        assert_eq!(
            e.as_map().get(TIMESTAMP_KEY),
            Some(&json!("2020-01-01T00:00:00Z"))
        );

        let mut fresh = event(json!({}));
        fresh.ensure_timestamp(Utc::now());
        assert!(fresh.as_map().contains_key(TIMESTAMP_KEY));
    }

    #[test]
    fn failed_event_round_trips_as_json_line() {
        let e = event(json!({"eventn_ctx": {"event_id": "x1"}, "v": 1}));
        let failed = FailedEvent::new(&e, "syntax error");
        let line = serde_json::to_string(&failed).unwrap();
        let parsed: FailedEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.event_id, "x1");
        assert_eq!(parsed.error, "syntax error");
        assert_eq!(parsed.event, json!({"eventn_ctx": {"event_id": "x1"}, "v": 1}));
    }
}
