use super::column::{ColumnType, Value};
use super::row::Record;
use crate::errors::Error;

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnSchema>,
    pub version: u32,
}

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub type_: ColumnType,
    pub default: Option<Value>,
    pub is_primary: bool,
    pub is_nullable: bool,
    pub is_unique: bool,
}

impl TableSchema {
    /// Looks up a column by name. `None` means "no such column", a
    /// different condition from the engine's "no such table".
    pub fn get_column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|column| column.name == name)
    }

    /// The single primary-key column.
    ///
    /// # Errors
    /// Returns `Error::Schema` if the schema declares none; schemas are
    /// built at startup with exactly one.
    pub fn primary_column(&self) -> Result<&ColumnSchema, Error> {
        self.columns
            .iter()
            .find(|column| column.is_primary)
            .ok_or_else(|| err!(Schema, "Table '{}' has no primary-key column", self.table))
    }

    /// Columns flagged unique, primary key excluded.
    pub fn unique_columns(&self) -> impl Iterator<Item = &ColumnSchema> {
        self.columns
            .iter()
            .filter(|column| column.is_unique && !column.is_primary)
    }

    /// Structural validation of a record against this schema.
    ///
    /// A record is valid iff every non-nullable column has a present,
    /// type-matching value. Nullable columns may be absent, but a present
    /// value still has to match its declared type. Fields the schema does
    /// not know are permitted and ignored.
    ///
    /// # Errors
    /// Returns `Error::Schema` naming the offending column.
    pub fn validate_record(&self, record: &Record) -> Result<(), Error> {
        for column in &self.columns {
            match record.get(&column.name) {
                None => {
                    if !column.is_nullable {
                        return Err(err!(
                            Schema,
                            "Missing value for column: {}",
                            column.name
                        ));
                    }
                }
                Some(value) => {
                    if !value.matches_type(&column.type_) {
                        return Err(err!(
                            Schema,
                            "Column '{}' expects {}, got '{}'",
                            column.name,
                            column.type_,
                            value
                        ));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;

    fn sample_schema() -> TableSchema {
        TableSchema {
            table: "users".into(),
            columns: vec![
                ColumnSchema {
                    name: "id".into(),
                    type_: ColumnType::INT,
                    default: None,
                    is_primary: true,
                    is_nullable: false,
                    is_unique: false,
                },
                ColumnSchema {
                    name: "username".into(),
                    type_: ColumnType::VARCHAR(32),
                    default: None,
                    is_primary: false,
                    is_nullable: false,
                    is_unique: true,
                },
                ColumnSchema {
                    name: "note".into(),
                    type_: ColumnType::TEXT,
                    default: None,
                    is_primary: false,
                    is_nullable: true,
                    is_unique: false,
                },
            ],
            version: 0,
        }
    }

    #[test]
    fn test_valid_record_passes() {
        let schema = sample_schema();
        let record = record! { "id" => 1i64, "username" => "alice" };
        assert!(schema.validate_record(&record).is_ok());
    }

    #[test]
    fn test_missing_non_nullable_fails() {
        let schema = sample_schema();
        let record = record! { "id" => 1i64 };
        let err = schema.validate_record(&record).unwrap_err();
        assert_eq!(err.code(), 5000);
    }

    #[test]
    fn test_nullable_may_be_absent_but_must_type_check() {
        let schema = sample_schema();
        let absent = record! { "id" => 1i64, "username" => "alice" };
        assert!(schema.validate_record(&absent).is_ok());

        let mut wrong = absent.clone();
        wrong.set("note", Value::Int(3));
        assert!(schema.validate_record(&wrong).is_err());
    }

    #[test]
    fn test_type_mismatch_fails() {
        let schema = sample_schema();
        let record = record! { "id" => "not-a-number", "username" => "alice" };
        assert!(schema.validate_record(&record).is_err());
    }

    #[test]
    fn test_extra_fields_are_ignored() {
        let schema = sample_schema();
        let record = record! { "id" => 1i64, "username" => "alice", "ghost" => "boo" };
        assert!(schema.validate_record(&record).is_ok());
    }

    #[test]
    fn test_get_column_and_primary() {
        let schema = sample_schema();
        assert!(schema.get_column("username").is_some());
        assert!(schema.get_column("nope").is_none());
        assert_eq!(schema.primary_column().unwrap().name, "id");
        let unique: Vec<&str> = schema.unique_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(unique, vec!["username"]);
    }
}
