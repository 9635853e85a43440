use serde_json::Value;

use crate::types::ObjectMap;

/// A parsed slash-separated path into a nested JSON object
/// (e.g. `/eventn_ctx/event_id`).
///
/// Paths address object members only; array elements are not addressable.
/// An empty path is valid and addresses nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JsonPath {
    segments: Vec<String>,
}

impl JsonPath {
    /// Parses a path from its slash-separated form. A leading slash is
    /// optional; empty segments are dropped.
    pub fn parse(path: &str) -> Self {
        let segments = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(str::to_owned)
            .collect();

        Self { segments }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The path rendered as a flat column name with `_` separators, the way
    /// the flattener will name the destination column.
    pub fn flat_name(&self) -> String {
        self.segments.join("_")
    }

    /// Returns a reference to the value at this path, if present.
    pub fn get<'a>(&self, object: &'a ObjectMap) -> Option<&'a Value> {
        let (last, prefix) = self.segments.split_last()?;

        let mut current = object;
        for segment in prefix {
            current = current.get(segment)?.as_object()?;
        }

        current.get(last)
    }

    /// Sets the value at this path, creating intermediate objects as needed.
    /// Intermediate non-object values are overwritten.
    pub fn set(&self, object: &mut ObjectMap, value: Value) {
        let Some((last, prefix)) = self.segments.split_last() else {
            return;
        };

        let mut current = object;
        for segment in prefix {
            let entry = current
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(ObjectMap::new()));
            if !entry.is_object() {
                *entry = Value::Object(ObjectMap::new());
            }
            current = entry.as_object_mut().expect("entry was just made an object");
        }

        current.insert(last.clone(), value);
    }

    /// Removes and returns the value at this path, if present.
    pub fn remove(&self, object: &mut ObjectMap) -> Option<Value> {
        let (last, prefix) = self.segments.split_last()?;

        let mut current = object;
        for segment in prefix {
            current = current.get_mut(segment)?.as_object_mut()?;
        }

        current.remove(last)
    }
}

impl std::fmt::Display for JsonPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "/{}", self.segments.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> ObjectMap {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn get_nested() {
        let obj = object(json!({"a": {"b": {"c": 42}}}));
        let path = JsonPath::parse("/a/b/c");
        assert_eq!(path.get(&obj), Some(&json!(42)));
        assert_eq!(JsonPath::parse("/a/missing").get(&obj), None);
    }

    #[test]
    fn set_creates_intermediate_objects() {
        let mut obj = ObjectMap::new();
        JsonPath::parse("/x/y").set(&mut obj, json!("v"));
        assert_eq!(JsonPath::parse("/x/y").get(&obj), Some(&json!("v")));
    }

    #[test]
    fn remove_returns_value() {
        let mut obj = object(json!({"a": {"b": 1}, "keep": true}));
        let removed = JsonPath::parse("/a/b").remove(&mut obj);
        assert_eq!(removed, Some(json!(1)));
        assert_eq!(JsonPath::parse("/keep").get(&obj), Some(&json!(true)));
    }

    #[test]
    fn flat_name_joins_with_underscores() {
        assert_eq!(JsonPath::parse("/eventn_ctx/event_id").flat_name(), "eventn_ctx_event_id");
    }
}
