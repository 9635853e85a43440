//! JSON-to-SQL value conversion shared by the SQL adapters.
//!
//! Rows reach the adapters as flattened JSON objects; each column of the
//! target table knows its logical type. Conversion coerces the value toward
//! the column type (widening only), so an INT64 value lands as FLOAT64 in a
//! widened column, and timestamps parse from their string form.

use chrono::{DateTime, Utc};
use serde_json::Value;

use ingest::schema::{DataType, parse_timestamp};
use ingest::table::SqlColumn;

/// A scalar ready for parameter binding.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Text(String),
}

impl SqlValue {
    /// Converts a JSON value for a column, coercing toward the column's
    /// logical type.
    pub fn from_json(value: &Value, column: &SqlColumn) -> SqlValue {
        match column.data_type {
            Some(DataType::String) | Some(DataType::Unknown) => {
                return match value {
                    Value::Null => SqlValue::Null,
                    Value::String(s) => SqlValue::Text(s.clone()),
                    other => SqlValue::Text(other.to_string()),
                };
            }
            Some(DataType::Float64) => {
                if let Some(f) = value.as_f64() {
                    return SqlValue::Float(f);
                }
            }
            Some(DataType::Int64) => {
                if let Some(i) = value.as_i64() {
                    return SqlValue::Int(i);
                }
            }
            Some(DataType::Bool) => {
                if let Some(b) = value.as_bool() {
                    return SqlValue::Bool(b);
                }
            }
            Some(DataType::Timestamp) => {
                if let Some(ts) = value.as_str().and_then(parse_timestamp) {
                    return SqlValue::Timestamp(ts);
                }
            }
            _ => {}
        }

        // Fall back to the value's own shape.
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Int(i)
                } else {
                    SqlValue::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }

    /// Renders the value as SQL text, `None` for NULL. The timestamp form
    /// (`YYYY-MM-DD HH:MM:SS.ffffff`) is accepted by every SQL sink we
    /// target; the adapters pair it with a server-side cast per column.
    pub fn render(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(b) => Some(b.to_string()),
            SqlValue::Int(i) => Some(i.to_string()),
            SqlValue::Float(f) => Some(f.to_string()),
            SqlValue::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            SqlValue::Text(s) => Some(s.clone()),
        }
    }
}

/// Converts one row into column-ordered values for the given table columns.
/// Missing columns bind as NULL.
pub fn row_values(row: &ingest::types::Event, columns: &[(&String, &SqlColumn)]) -> Vec<SqlValue> {
    columns
        .iter()
        .map(|(name, column)| {
            row.as_map()
                .get(*name)
                .map(|value| SqlValue::from_json(value, column))
                .unwrap_or(SqlValue::Null)
        })
        .collect()
}
