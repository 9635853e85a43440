pub mod helper;

pub use helper::TableHelper;

use std::collections::{BTreeMap, BTreeSet};

use crate::schema::DataType;

/// Maps a logical type onto the sink's SQL type name. Each adapter ships
/// its own map.
pub type SqlTypeMapper = fn(DataType) -> &'static str;

/// One sink-side column: the SQL type plus the logical type it was derived
/// from (absent for columns read back from a live schema).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlColumn {
    pub sql_type: String,
    pub data_type: Option<DataType>,
}

impl SqlColumn {
    pub fn new(sql_type: impl Into<String>, data_type: Option<DataType>) -> Self {
        Self {
            sql_type: sql_type.into(),
            data_type,
        }
    }
}

/// Sink-side table shape. The helper's cached copy is advisory; the sink
/// owns the truth.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Table {
    pub name: String,
    pub columns: BTreeMap<String, SqlColumn>,
    pub pk_fields: BTreeSet<String>,
    /// Set when a config reload removed the primary key; the next patch
    /// drops the constraint.
    pub delete_pk_fields: bool,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table {
            name: name.into(),
            ..Default::default()
        }
    }

    /// A table with no columns does not exist on the sink.
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn has_pk(&self) -> bool {
        !self.pk_fields.is_empty()
    }

    /// Column names in stable order, used for deterministic statements.
    pub fn sorted_column_names(&self) -> Vec<&str> {
        self.columns.keys().map(String::as_str).collect()
    }

    /// Computes the patch needed to bring `live` up to this table: columns
    /// present here but absent live, plus the primary key delta.
    ///
    /// Column type differences are deliberately not part of the delta; the
    /// sink keeps the wider type and value coercion happens at insert time.
    pub fn diff(&self, live: &Table) -> Table {
        let columns: BTreeMap<String, SqlColumn> = self
            .columns
            .iter()
            .filter(|(name, _)| !live.columns.contains_key(*name))
            .map(|(name, column)| (name.clone(), column.clone()))
            .collect();

        let pk_changed = self.pk_fields != live.pk_fields;

        Table {
            name: self.name.clone(),
            columns,
            pk_fields: if pk_changed {
                self.pk_fields.clone()
            } else {
                BTreeSet::new()
            },
            delete_pk_fields: pk_changed && live.has_pk(),
        }
    }

    /// True when applying this patch would change the sink.
    pub fn has_changes(&self) -> bool {
        !self.columns.is_empty() || !self.pk_fields.is_empty() || self.delete_pk_fields
    }

    /// Union of this table and `other`'s columns, keeping this table's
    /// primary key. Used to maintain the cached superset after an ensure.
    pub fn merged_with(&self, other: &Table) -> Table {
        let mut merged = self.clone();
        for (name, column) in &other.columns {
            merged
                .columns
                .entry(name.clone())
                .or_insert_with(|| column.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, columns: &[(&str, &str)], pk: &[&str]) -> Table {
        Table {
            name: name.to_owned(),
            columns: columns
                .iter()
                .map(|(c, t)| (c.to_string(), SqlColumn::new(*t, None)))
                .collect(),
            pk_fields: pk.iter().map(|f| f.to_string()).collect(),
            delete_pk_fields: false,
        }
    }

    #[test]
    fn diff_yields_missing_columns_only() {
        let desired = table("events", &[("a", "text"), ("b", "bigint")], &[]);
        let live = table("events", &[("a", "text")], &[]);

        let patch = desired.diff(&live);
        assert_eq!(patch.columns.len(), 1);
        assert!(patch.columns.contains_key("b"));
        assert!(patch.has_changes());
        assert!(!patch.delete_pk_fields);
    }

    #[test]
    fn identical_tables_produce_empty_diff() {
        let desired = table("events", &[("a", "text")], &["a"]);
        let live = table("events", &[("a", "text")], &["a"]);
        assert!(!desired.diff(&live).has_changes());
    }

    #[test]
    fn type_differences_are_not_a_delta() {
        let desired = table("events", &[("v", "bigint")], &[]);
        let live = table("events", &[("v", "double precision")], &[]);
        assert!(!desired.diff(&live).has_changes());
    }

    #[test]
    fn pk_removal_requests_constraint_drop() {
        let desired = table("events", &[("email", "text")], &[]);
        let live = table("events", &[("email", "text")], &["email"]);

        let patch = desired.diff(&live);
        assert!(patch.delete_pk_fields);
        assert!(patch.pk_fields.is_empty());
        assert!(patch.has_changes());
    }

    #[test]
    fn pk_addition_carries_the_new_key() {
        let desired = table("events", &[("email", "text")], &["email"]);
        let live = table("events", &[("email", "text")], &[]);

        let patch = desired.diff(&live);
        assert!(!patch.delete_pk_fields);
        assert_eq!(patch.pk_fields.len(), 1);
    }

    #[test]
    fn merge_is_a_column_union() {
        let a = table("events", &[("a", "text")], &["a"]);
        let b = table("events", &[("b", "bigint")], &[]);
        let merged = a.merged_with(&b);
        assert_eq!(merged.columns.len(), 2);
        assert_eq!(merged.pk_fields.len(), 1);
    }
}
