//! Storage layer: the B+ tree index structure and the table building blocks
//! (columns, records, schemas, secondary indexes) that sit on top of it.

pub mod btree;
pub mod column;
pub mod index;
pub mod node;
pub mod row;
pub mod schema;

/// Primary identifier of a stored record. Assigned by the engine at insert,
/// monotonically increasing per table.
pub type RecordId = u64;

pub use btree::BPlusTree;
pub use column::{ColumnType, Value};
pub use index::Index;
pub use row::{Criteria, Record};
pub use schema::{ColumnSchema, TableSchema};
