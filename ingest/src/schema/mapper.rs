use std::collections::HashMap;

use ingest_config::{FieldMappingAction, Mapping, MappingField};
use serde_json::Value;

use crate::error::{ErrorKind, IngestResult};
use crate::ingest_error;
use crate::types::{Event, JsonPath, ObjectMap};

/// One compiled mapping rule.
#[derive(Debug, Clone)]
struct CompiledRule {
    src: Option<JsonPath>,
    dst: Option<JsonPath>,
    action: FieldMappingAction,
    value: Option<Value>,
}

/// Rule-driven rename/move/erase/constant stage, applied to the nested event
/// before flattening.
///
/// Cast rules do not touch the event; they are collected into the SQL type
/// hint map handed to the table helper, so the sink server coerces values
/// via placeholder casts.
#[derive(Debug, Clone, Default)]
pub struct FieldMapper {
    rules: Vec<CompiledRule>,
    keep_unmapped: bool,
}

impl FieldMapper {
    /// Identity mapper: keeps every field, produces no cast hints.
    pub fn identity() -> Self {
        FieldMapper {
            rules: Vec::new(),
            keep_unmapped: true,
        }
    }

    /// Compiles a mapping config into a mapper plus the per-column SQL cast
    /// hints contributed by `cast` rules (keyed by flat column name).
    pub fn new(mapping: &Mapping) -> IngestResult<(Self, HashMap<String, String>)> {
        let mut rules = Vec::with_capacity(mapping.fields.len());
        let mut sql_type_hints = HashMap::new();

        for field in &mapping.fields {
            validate_rule(field)?;

            let src = field.src.as_deref().map(JsonPath::parse);
            let dst = field.dst.as_deref().map(JsonPath::parse);

            if field.action == FieldMappingAction::Cast {
                let dst = dst.as_ref().expect("cast rules are validated to have dst");
                let column_type = field
                    .column_type
                    .clone()
                    .expect("cast rules are validated to have a type");
                sql_type_hints.insert(dst.flat_name(), column_type);
                continue;
            }

            // Move rules may also carry an inline cast.
            if field.action == FieldMappingAction::Move
                && let (Some(dst), Some(column_type)) = (&dst, &field.column_type)
            {
                sql_type_hints.insert(dst.flat_name(), column_type.clone());
            }

            rules.push(CompiledRule {
                src,
                dst,
                action: field.action,
                value: field.value.clone(),
            });
        }

        Ok((
            FieldMapper {
                rules,
                keep_unmapped: mapping.keeps_unmapped(),
            },
            sql_type_hints,
        ))
    }

    /// Applies the rules to an event. With `keep_unmapped = false` the result
    /// contains only rule-written fields; otherwise the event is mutated in
    /// place.
    pub fn map(&self, event: Event) -> IngestResult<Event> {
        if self.rules.is_empty() && self.keep_unmapped {
            return Ok(event);
        }

        let mut source = event.0;
        let mut target = if self.keep_unmapped {
            None
        } else {
            Some(ObjectMap::new())
        };

        for rule in &self.rules {
            match rule.action {
                FieldMappingAction::Move => {
                    let src = rule.src.as_ref().expect("move rules have src");
                    let dst = rule.dst.as_ref().expect("move rules have dst");
                    if let Some(value) = src.remove(&mut source) {
                        match target.as_mut() {
                            Some(target) => dst.set(target, value),
                            None => dst.set(&mut source, value),
                        }
                    }
                }
                FieldMappingAction::Remove => {
                    let src = rule.src.as_ref().expect("remove rules have src");
                    src.remove(&mut source);
                }
                FieldMappingAction::Constant => {
                    let dst = rule.dst.as_ref().expect("constant rules have dst");
                    let value = rule.value.clone().unwrap_or(Value::Null);
                    match target.as_mut() {
                        Some(target) => dst.set(target, value),
                        None => dst.set(&mut source, value),
                    }
                }
                FieldMappingAction::Cast => unreachable!("cast rules are compiled away"),
            }
        }

        Ok(Event(target.unwrap_or(source)))
    }
}

impl FieldMapper {
    /// Applies the rules to an already-flattened row, addressing columns by
    /// the flat form of the rule paths (`/payload/amount` acts on
    /// `payload_amount`). This is the stage used by SQL sinks, where mapping
    /// runs after flattening.
    pub fn map_flat(&self, row: ObjectMap) -> IngestResult<ObjectMap> {
        if self.rules.is_empty() && self.keep_unmapped {
            return Ok(row);
        }

        let mut source = row;
        let mut target = if self.keep_unmapped {
            None
        } else {
            Some(ObjectMap::new())
        };

        for rule in &self.rules {
            match rule.action {
                FieldMappingAction::Move => {
                    let src = rule.src.as_ref().expect("move rules have src").flat_name();
                    let dst = rule.dst.as_ref().expect("move rules have dst").flat_name();
                    if let Some(value) = source.remove(&src) {
                        match target.as_mut() {
                            Some(target) => target.insert(dst, value),
                            None => source.insert(dst, value),
                        };
                    }
                }
                FieldMappingAction::Remove => {
                    let src = rule.src.as_ref().expect("remove rules have src").flat_name();
                    source.remove(&src);
                }
                FieldMappingAction::Constant => {
                    let dst = rule.dst.as_ref().expect("constant rules have dst").flat_name();
                    let value = rule.value.clone().unwrap_or(Value::Null);
                    match target.as_mut() {
                        Some(target) => target.insert(dst, value),
                        None => source.insert(dst, value),
                    };
                }
                FieldMappingAction::Cast => unreachable!("cast rules are compiled away"),
            }
        }

        Ok(target.unwrap_or(source))
    }
}

fn validate_rule(field: &MappingField) -> IngestResult<()> {
    let has_src = field.src.as_deref().is_some_and(|s| !s.is_empty());
    let has_dst = field.dst.as_deref().is_some_and(|d| !d.is_empty());

    let valid = match field.action {
        FieldMappingAction::Move => has_src && has_dst,
        FieldMappingAction::Remove => has_src,
        FieldMappingAction::Cast => has_dst && field.column_type.is_some(),
        FieldMappingAction::Constant => has_dst,
    };

    if !valid {
        return Err(ingest_error!(
            ErrorKind::ValidationFailed,
            "Invalid mapping rule",
            format!(
                "action {:?} with src={:?} dst={:?} type={:?}",
                field.action, field.src, field.dst, field.column_type
            )
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: serde_json::Value) -> Event {
        Event::new(value.as_object().unwrap().clone())
    }

    fn mapping(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn move_relocates_nested_values() {
        let (mapper, hints) = FieldMapper::new(&mapping(
            r#"
fields:
  - src: /payload/amount
    dst: /amount
    action: move
"#,
        ))
        .unwrap();
        assert!(hints.is_empty());

        let mapped = mapper
            .map(event(json!({"payload": {"amount": 5}, "other": true})))
            .unwrap();
        assert_eq!(mapped.as_map().get("amount"), Some(&json!(5)));
        assert_eq!(mapped.as_map().get("other"), Some(&json!(true)));
        assert_eq!(
            JsonPath::parse("/payload/amount").get(mapped.as_map()),
            None
        );
    }

    #[test]
    fn remove_erases_values() {
        let (mapper, _) = FieldMapper::new(&mapping(
            r#"
fields:
  - src: /secret
    action: remove
"#,
        ))
        .unwrap();

        let mapped = mapper.map(event(json!({"secret": "x", "keep": 1}))).unwrap();
        assert!(!mapped.as_map().contains_key("secret"));
        assert!(mapped.as_map().contains_key("keep"));
    }

    #[test]
    fn cast_rules_produce_hints_only() {
        let (mapper, hints) = FieldMapper::new(&mapping(
            r#"
fields:
  - dst: /eventn_ctx/utc_time
    action: cast
    type: timestamp
"#,
        ))
        .unwrap();
        assert_eq!(hints["eventn_ctx_utc_time"], "timestamp");

        let original = event(json!({"eventn_ctx": {"utc_time": "2020-01-01T00:00:00Z"}}));
        let mapped = mapper.map(original.clone()).unwrap();
        assert_eq!(mapped, original);
    }

    #[test]
    fn strict_mode_drops_unmapped_fields() {
        let (mapper, _) = FieldMapper::new(&mapping(
            r#"
keep_unmapped: false
fields:
  - src: /a
    dst: /renamed
    action: move
  - dst: /fixed
    action: constant
    value: 42
"#,
        ))
        .unwrap();

        let mapped = mapper.map(event(json!({"a": 1, "dropped": true}))).unwrap();
        assert_eq!(mapped.as_map().get("renamed"), Some(&json!(1)));
        assert_eq!(mapped.as_map().get("fixed"), Some(&json!(42)));
        assert!(!mapped.as_map().contains_key("dropped"));
    }

    #[test]
    fn flat_mapping_addresses_flat_columns() {
        let (mapper, _) = FieldMapper::new(&mapping(
            r#"
fields:
  - src: /payload/amount
    dst: /amount
    action: move
  - src: /payload/secret
    action: remove
"#,
        ))
        .unwrap();

        let row = json!({"payload_amount": 5, "payload_secret": "x", "kept": true});
        let mapped = mapper.map_flat(row.as_object().unwrap().clone()).unwrap();
        assert_eq!(mapped.get("amount"), Some(&json!(5)));
        assert!(!mapped.contains_key("payload_amount"));
        assert!(!mapped.contains_key("payload_secret"));
        assert_eq!(mapped.get("kept"), Some(&json!(true)));
    }

    #[test]
    fn invalid_rules_are_rejected() {
        let result = FieldMapper::new(&mapping(
            r#"
fields:
  - dst: /x
    action: move
"#,
        ));
        assert!(result.is_err());
    }
}
