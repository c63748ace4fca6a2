//! Tiny embedded storage engine.
//!
//! Everything lives in process memory: tables are B+ trees keyed by an
//! auto-incrementing record id, secondary lookups go through postings-list
//! indexes, and a record-level undo log makes any sequence of table
//! mutations reversible.
//!
//! The [`engine::DataEngine`] is the public surface. It is a plain value:
//! construct one per scope you need, there is no global instance.

#[macro_use]
pub mod errors;
pub mod engine;
pub mod storage;

pub use engine::DataEngine;
pub use errors::Error;
pub use storage::btree::BPlusTree;
pub use storage::column::{ColumnType, Value};
pub use storage::row::{Criteria, Record};
