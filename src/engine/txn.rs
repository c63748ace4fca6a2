//! The record-level transaction log.
//!
//! While a transaction is open, every table mutation appends one [`UndoOp`]
//! capturing enough pre-state to invert it. Rollback replays the log in
//! strict reverse order; commit just drops it.

use crate::storage::row::Record;
use crate::storage::RecordId;
use std::collections::HashMap;
use uuid::Uuid;

/// One reversible table mutation.
#[derive(Debug)]
pub enum UndoOp {
    /// A record was inserted; undo removes it.
    Insert { table: String, id: RecordId },
    /// A record was rewritten; undo restores the pre-image.
    Update {
        table: String,
        id: RecordId,
        before: Record,
    },
    /// A record was removed; undo re-inserts the pre-image.
    Delete {
        table: String,
        id: RecordId,
        before: Record,
    },
}

/// An open transaction: identity, undo log, and the auto-increment counters
/// captured at begin so rollback can restore them.
pub struct Transaction {
    pub id: Uuid,
    pub(crate) log: Vec<UndoOp>,
    pub(crate) next_ids: HashMap<String, RecordId>,
}

impl Transaction {
    pub fn begin(next_ids: HashMap<String, RecordId>) -> Self {
        Transaction {
            id: Uuid::new_v4(),
            log: Vec::new(),
            next_ids,
        }
    }

    pub fn record(&mut self, op: UndoOp) {
        self.log.push(op);
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }
}
