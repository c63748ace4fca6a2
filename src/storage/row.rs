use super::column::Value;
use std::collections::HashMap;

/// Exact-match selection criteria: every listed (field, value) pair must be
/// present and equal on a record for it to match.
pub type Criteria = HashMap<String, Value>;

/// A stored record: column name to value.
///
/// Records are structurally open: fields not covered by the table schema
/// may ride along and are ignored by validation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub inner: HashMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Record {
            inner: HashMap::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.inner.get(column)
    }

    pub fn set(&mut self, column: &str, value: Value) {
        self.inner.insert(column.to_string(), value);
    }

    pub fn contains(&self, column: &str) -> bool {
        self.inner.contains_key(column)
    }

    /// Convenience accessor for string-typed columns.
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column)?.as_str()
    }

    /// Overlays every field of `changes` onto this record. Existing fields
    /// are replaced, absent ones created.
    pub fn merge_from(&mut self, changes: &Record) {
        for (column, value) in &changes.inner {
            self.inner.insert(column.clone(), value.clone());
        }
    }

    /// Whether every (field, value) pair in the criteria is present and
    /// equal here. Fields the criteria leave out are ignored.
    pub fn matches(&self, criteria: &Criteria) -> bool {
        criteria
            .iter()
            .all(|(column, expected)| self.inner.get(column) == Some(expected))
    }
}

impl FromIterator<(String, Value)> for Record {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Record {
            inner: iter.into_iter().collect(),
        }
    }
}

/// Builds a record from field-value pairs.
///
/// # Examples
/// ```
/// use ledgerlite::record;
/// let row = record! { "username" => "alice", "balance" => 10.5 };
/// assert_eq!(row.get_str("username"), Some("alice"));
/// ```
#[macro_export]
macro_rules! record {
    ($($column:expr => $value:expr),* $(,)?) => {{
        let mut record = $crate::storage::row::Record::new();
        $(record.set($column, $crate::storage::column::Value::from($value));)*
        record
    }};
}
