use serde_json::Value;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::schema::flatten::sanitize_identifier;
use crate::types::{Event, JsonPath};

/// Default table name when no template is configured.
pub const DEFAULT_TABLE_NAME: &str = "events";

#[derive(Debug, Clone)]
enum Part {
    Text(String),
    Field(JsonPath),
}

/// Deterministic per-event table name template.
///
/// A template is a constant string with `{{/json/path}}` placeholders
/// resolved against the (pre-flattening) event. Rendering is pure; a
/// placeholder that resolves to nothing, or a render that produces an empty
/// name, yields [`ErrorKind::TemplateFailed`], which the processor turns
/// into a skipped event.
#[derive(Debug, Clone)]
pub struct TableNameTemplate {
    parts: Vec<Part>,
}

impl TableNameTemplate {
    /// Parses a template string. `None`/empty falls back to the default
    /// constant table name.
    pub fn parse(template: Option<&str>) -> IngestResult<Self> {
        let template = match template {
            Some(t) if !t.trim().is_empty() => t.trim(),
            _ => DEFAULT_TABLE_NAME,
        };

        let mut parts = Vec::new();
        let mut rest = template;

        while let Some(open) = rest.find("{{") {
            let Some(close_rel) = rest[open..].find("}}") else {
                bail_template(template, "unclosed placeholder")?;
                unreachable!()
            };
            let close = open + close_rel;

            if open > 0 {
                parts.push(Part::Text(rest[..open].to_owned()));
            }

            let placeholder = rest[open + 2..close].trim();
            if placeholder.is_empty() {
                bail_template(template, "empty placeholder")?;
            }
            parts.push(Part::Field(JsonPath::parse(placeholder)));

            rest = &rest[close + 2..];
        }

        if !rest.is_empty() {
            parts.push(Part::Text(rest.to_owned()));
        }

        Ok(TableNameTemplate { parts })
    }

    /// True when the template has no placeholders, i.e. every event maps to
    /// the same table.
    pub fn is_constant(&self) -> bool {
        self.parts
            .iter()
            .all(|part| matches!(part, Part::Text(_)))
    }

    /// Renders the table name for an event.
    pub fn render(&self, event: &Event) -> IngestResult<String> {
        let mut out = String::new();

        for part in &self.parts {
            match part {
                Part::Text(text) => out.push_str(text),
                Part::Field(path) => {
                    let value = path.get(event.as_map());
                    let rendered = match value {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Null) | None => String::new(),
                        Some(other) => other.to_string(),
                    };
                    if rendered.is_empty() {
                        return Err(ingest_error!(
                            ErrorKind::TemplateFailed,
                            "Table name placeholder resolved to nothing",
                            path.to_string()
                        ));
                    }
                    out.push_str(&sanitize_identifier(&rendered));
                }
            }
        }

        let name = out.trim().to_owned();
        if name.is_empty() {
            return Err(ingest_error!(
                ErrorKind::TemplateFailed,
                "Table name rendered empty"
            ));
        }

        Ok(name)
    }
}

fn bail_template(template: &str, reason: &str) -> IngestResult<()> {
    Err(ingest_error!(
        ErrorKind::ValidationFailed,
        "Invalid table name template",
        format!("{template}: {reason}")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: serde_json::Value) -> Event {
        Event::new(value.as_object().unwrap().clone())
    }

    #[test]
    fn constant_template() {
        let template = TableNameTemplate::parse(Some("events")).unwrap();
        assert!(template.is_constant());
        assert_eq!(template.render(&event(json!({}))).unwrap(), "events");
    }

    #[test]
    fn default_when_unset() {
        let template = TableNameTemplate::parse(None).unwrap();
        assert_eq!(
            template.render(&event(json!({}))).unwrap(),
            DEFAULT_TABLE_NAME
        );
    }

    #[test]
    fn placeholder_renders_event_field() {
        let template = TableNameTemplate::parse(Some("events_{{/event_type}}")).unwrap();
        assert!(!template.is_constant());
        let name = template
            .render(&event(json!({"event_type": "Page View"})))
            .unwrap();
        assert_eq!(name, "events_page_view");
    }

    #[test]
    fn missing_placeholder_value_fails_render() {
        let template = TableNameTemplate::parse(Some("events_{{/missing}}")).unwrap();
        let err = template.render(&event(json!({}))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TemplateFailed);
    }

    #[test]
    fn unclosed_placeholder_is_a_config_error() {
        let err = TableNameTemplate::parse(Some("events_{{/oops")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ValidationFailed);
    }
}
