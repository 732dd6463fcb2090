//! Raw rows.

use crate::types::VersionToken;
use faultdb_codec::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Attribute name to value, ordered by name.
pub type RowValues = BTreeMap<String, Value>;

/// One persisted row: ordered attribute values tagged with a version.
///
/// Relationship columns are stored alongside attributes: a to-one column holds
/// the destination's primary key as `Integer` (or `Null`), a to-many column
/// holds an `Array` of primary keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    values: RowValues,
    version: VersionToken,
}

impl Row {
    /// Creates a row.
    #[must_use]
    pub fn new(values: RowValues, version: VersionToken) -> Self {
        Self { values, version }
    }

    /// The version token.
    #[must_use]
    pub fn version(&self) -> VersionToken {
        self.version
    }

    /// All values.
    #[must_use]
    pub fn values(&self) -> &RowValues {
        &self.values
    }

    /// Consumes the row, returning its values.
    #[must_use]
    pub fn into_values(self) -> RowValues {
        self.values
    }

    /// Value of one column, if present.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Value of one column, `Null` when absent.
    #[must_use]
    pub fn get_or_null(&self, name: &str) -> Value {
        self.values.get(name).cloned().unwrap_or(Value::Null)
    }

    /// Replaces the version token.
    #[must_use]
    pub fn with_version(mut self, version: VersionToken) -> Self {
        self.version = version;
        self
    }

    /// Approximate heap footprint, for cache accounting.
    #[must_use]
    pub fn approx_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self
                .values
                .iter()
                .map(|(k, v)| k.len() + v.approx_size())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_columns_read_as_null() {
        let mut values = RowValues::new();
        values.insert("name".into(), Value::from("France"));
        let row = Row::new(values, VersionToken(1));
        assert_eq!(row.get_or_null("name"), Value::from("France"));
        assert_eq!(row.get_or_null("code"), Value::Null);
        assert_eq!(row.with_version(VersionToken(2)).version(), VersionToken(2));
    }

    #[test]
    fn size_grows_with_content() {
        let empty = Row::default().approx_size();
        let mut values = RowValues::new();
        values.insert("blob".into(), Value::Bytes(vec![0; 256]));
        assert!(Row::new(values, VersionToken(1)).approx_size() > empty + 256);
    }
}
