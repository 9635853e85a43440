use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::Value;

/// Logical column type inferred from event values.
///
/// Types only ever widen over the life of a column; see [`DataType::widen`]
/// for the lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Unknown,
    Bool,
    Int64,
    Float64,
    Timestamp,
    String,
}

impl DataType {
    /// Infers the logical type of a single JSON value.
    ///
    /// Arrays and objects are typed as strings because the flattener renders
    /// them as JSON text. Nulls carry no type information.
    pub fn from_value(value: &Value) -> DataType {
        match value {
            Value::Null => DataType::Unknown,
            Value::Bool(_) => DataType::Bool,
            Value::Number(n) => {
                if n.is_i64() || n.is_u64() {
                    DataType::Int64
                } else {
                    DataType::Float64
                }
            }
            Value::String(s) => {
                if parse_timestamp(s).is_some() {
                    DataType::Timestamp
                } else {
                    DataType::String
                }
            }
            Value::Array(_) | Value::Object(_) => DataType::String,
        }
    }

    /// Widens two observed types into the narrowest common type.
    ///
    /// `Unknown` yields to any concrete type, `Int64` and `Float64` widen to
    /// `Float64`, equal types are kept, and every other combination widens
    /// to `String`.
    pub fn widen(self, other: DataType) -> DataType {
        use DataType::*;

        match (self, other) {
            (a, b) if a == b => a,
            (Unknown, t) | (t, Unknown) => t,
            (Int64, Float64) | (Float64, Int64) => Float64,
            _ => String,
        }
    }
}

/// Timestamp layouts accepted for string values, beyond RFC 3339.
const TIMESTAMP_LAYOUTS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

/// Parses a string as a timestamp, accepting RFC 3339 and the space-separated
/// SQL layout.
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }

    for layout in TIMESTAMP_LAYOUTS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, layout) {
            return Some(naive.and_utc());
        }
    }

    None
}

/// Per-destination strategy for resolving row values into column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeResolver {
    /// Full inference with widening, used by SQL sinks.
    Full,
    /// No inference; every field is typed `Unknown`. Used by HTTP-API sinks
    /// where the payload shape is forwarded as-is and no DDL ever happens.
    Passthrough,
}

impl TypeResolver {
    /// Resolves the type of every field of a flat row.
    pub fn resolve(&self, row: &crate::types::ObjectMap) -> std::collections::BTreeMap<String, DataType> {
        match self {
            TypeResolver::Full => row
                .iter()
                .map(|(name, value)| (name.clone(), DataType::from_value(value)))
                .collect(),
            TypeResolver::Passthrough => row
                .keys()
                .map(|name| (name.clone(), DataType::Unknown))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn value_typing() {
        assert_eq!(DataType::from_value(&json!(true)), DataType::Bool);
        assert_eq!(DataType::from_value(&json!(7)), DataType::Int64);
        assert_eq!(DataType::from_value(&json!(7.5)), DataType::Float64);
        assert_eq!(DataType::from_value(&json!("plain")), DataType::String);
        assert_eq!(
            DataType::from_value(&json!("2023-04-01T10:00:00Z")),
            DataType::Timestamp
        );
        assert_eq!(
            DataType::from_value(&json!("2023-04-01 10:00:00")),
            DataType::Timestamp
        );
        assert_eq!(DataType::from_value(&json!(null)), DataType::Unknown);
    }

    #[test]
    fn widening_lattice() {
        use DataType::*;

        assert_eq!(Int64.widen(Float64), Float64);
        assert_eq!(Float64.widen(Int64), Float64);
        assert_eq!(Unknown.widen(Bool), Bool);
        assert_eq!(Bool.widen(Unknown), Bool);
        assert_eq!(Timestamp.widen(Timestamp), Timestamp);

        // Undefined pairs widen to String.
        assert_eq!(Int64.widen(Bool), String);
        assert_eq!(Timestamp.widen(Int64), String);
        assert_eq!(Bool.widen(Timestamp), String);
    }
}
