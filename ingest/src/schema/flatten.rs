use serde_json::Value;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::types::{Event, ObjectMap};

/// Per-destination flattening strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flattener {
    /// Nested objects are collapsed into `parent_child` columns, arrays are
    /// rendered as JSON strings, nulls are dropped. Used by SQL sinks.
    Full,
    /// The event is passed through untouched. Used by HTTP-API sinks where
    /// the nested payload shape matters.
    Passthrough,
}

impl Flattener {
    /// Flattens an event into a single-level column map.
    pub fn flatten(&self, event: &Event) -> IngestResult<ObjectMap> {
        match self {
            Flattener::Passthrough => Ok(event.as_map().clone()),
            Flattener::Full => {
                let mut flat = ObjectMap::new();
                flatten_into("", event.as_map(), &mut flat)?;
                Ok(flat)
            }
        }
    }
}

fn flatten_into(prefix: &str, object: &ObjectMap, out: &mut ObjectMap) -> IngestResult<()> {
    for (key, value) in object {
        let column = if prefix.is_empty() {
            sanitize_identifier(key)
        } else {
            format!("{prefix}_{}", sanitize_identifier(key))
        };

        match value {
            Value::Null => {}
            Value::Object(nested) => flatten_into(&column, nested, out)?,
            Value::Array(_) => {
                let rendered = serde_json::to_string(value).map_err(|err| {
                    ingest_error!(
                        ErrorKind::SerializationFailed,
                        "Failed to render array as JSON string",
                        err
                    )
                })?;
                out.insert(column, Value::String(rendered));
            }
            scalar => {
                out.insert(column, scalar.clone());
            }
        }
    }

    Ok(())
}

/// Normalizes a key into a safe SQL identifier fragment: lowercase ASCII,
/// digits and underscores only.
pub fn sanitize_identifier(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for c in key.chars() {
        if c.is_ascii_alphanumeric() {
            out.extend(c.to_lowercase());
        } else {
            out.push('_');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: serde_json::Value) -> Event {
        Event::new(value.as_object().unwrap().clone())
    }

    #[test]
    fn nested_objects_collapse_with_underscores() {
        let e = event(json!({
            "eventn_ctx": {"event_id": "a1", "location": {"country": "DE"}},
            "top": 1
        }));

        let flat = Flattener::Full.flatten(&e).unwrap();
        assert_eq!(flat.get("eventn_ctx_event_id"), Some(&json!("a1")));
        assert_eq!(flat.get("eventn_ctx_location_country"), Some(&json!("DE")));
        assert_eq!(flat.get("top"), Some(&json!(1)));
    }

    #[test]
    fn arrays_become_json_strings() {
        let e = event(json!({"tags": ["a", "b"]}));
        let flat = Flattener::Full.flatten(&e).unwrap();
        assert_eq!(flat.get("tags"), Some(&json!("[\"a\",\"b\"]")));
    }

    #[test]
    fn nulls_are_dropped() {
        let e = event(json!({"present": 1, "absent": null}));
        let flat = Flattener::Full.flatten(&e).unwrap();
        assert!(flat.contains_key("present"));
        assert!(!flat.contains_key("absent"));
    }

    #[test]
    fn keys_are_sanitized() {
        let e = event(json!({"Weird Key!": {"Sub-Key": true}}));
        let flat = Flattener::Full.flatten(&e).unwrap();
        assert_eq!(flat.get("weird_key__sub_key"), Some(&json!(true)));
    }

    #[test]
    fn passthrough_keeps_shape() {
        let e = event(json!({"nested": {"kept": true}}));
        let flat = Flattener::Passthrough.flatten(&e).unwrap();
        assert_eq!(flat.get("nested"), Some(&json!({"kept": true})));
    }
}
