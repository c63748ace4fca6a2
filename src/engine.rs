//! The data engine: a table-oriented store over B+ trees.
//!
//! Three fixed tables (`users`, `accounts`, `transactions`) each live in
//! their own primary tree keyed by record id. Unique columns are enforced
//! through fast-path maps before any write happens, secondary indexes keep
//! postings lists per indexed value, and an undo log makes every mutation
//! between `begin_transaction` and `rollback_transaction` reversible.
//!
//! Callers identify themselves by bank name and routing number; the pair
//! must have been admitted through [`DataEngine::register_bank`] before any
//! table operation.

pub mod txn;

use self::txn::{Transaction, UndoOp};
use crate::errors::Error;
use crate::storage::btree::{BPlusTree, DEFAULT_ORDER};
use crate::storage::column::{ColumnType, Value};
use crate::storage::index::Index;
use crate::storage::row::{Criteria, Record};
use crate::storage::schema::{ColumnSchema, TableSchema};
use crate::storage::RecordId;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const TABLE_USERS: &str = "users";
pub const TABLE_ACCOUNTS: &str = "accounts";
pub const TABLE_TRANSACTIONS: &str = "transactions";

fn column(name: &str, type_: ColumnType) -> ColumnSchema {
    ColumnSchema {
        name: name.into(),
        type_,
        default: None,
        is_primary: false,
        is_nullable: false,
        is_unique: false,
    }
}

pub static USERS_SCHEMA: Lazy<TableSchema> = Lazy::new(|| TableSchema {
    table: TABLE_USERS.into(),
    columns: vec![
        ColumnSchema {
            is_primary: true,
            ..column("id", ColumnType::INT)
        },
        ColumnSchema {
            is_unique: true,
            ..column("username", ColumnType::VARCHAR(32))
        },
        column("password", ColumnType::VARCHAR(255)),
        ColumnSchema {
            is_unique: true,
            ..column("email", ColumnType::VARCHAR(255))
        },
        column("createdAt", ColumnType::INT),
    ],
    version: 0,
});

pub static ACCOUNTS_SCHEMA: Lazy<TableSchema> = Lazy::new(|| TableSchema {
    table: TABLE_ACCOUNTS.into(),
    columns: vec![
        ColumnSchema {
            is_primary: true,
            ..column("id", ColumnType::INT)
        },
        column("ownerUsername", ColumnType::VARCHAR(32)),
        column("accountName", ColumnType::VARCHAR(64)),
        column("balance", ColumnType::DOUBLE),
        column("type", ColumnType::VARCHAR(16)),
        ColumnSchema {
            default: Some(Value::VarChar("active".into())),
            ..column("status", ColumnType::VARCHAR(16))
        },
        column("createdAt", ColumnType::INT),
    ],
    version: 0,
});

pub static TRANSACTIONS_SCHEMA: Lazy<TableSchema> = Lazy::new(|| TableSchema {
    table: TABLE_TRANSACTIONS.into(),
    columns: vec![
        ColumnSchema {
            is_primary: true,
            ..column("id", ColumnType::INT)
        },
        ColumnSchema {
            is_nullable: true,
            ..column("fromUser", ColumnType::VARCHAR(32))
        },
        ColumnSchema {
            is_nullable: true,
            ..column("toUser", ColumnType::VARCHAR(32))
        },
        ColumnSchema {
            is_nullable: true,
            ..column("fromAccount", ColumnType::VARCHAR(64))
        },
        ColumnSchema {
            is_nullable: true,
            ..column("toAccount", ColumnType::VARCHAR(64))
        },
        column("amount", ColumnType::DOUBLE),
        column("transactionType", ColumnType::VARCHAR(16)),
        column("bankName", ColumnType::VARCHAR(64)),
        column("routingNumber", ColumnType::VARCHAR(16)),
        ColumnSchema {
            is_nullable: true,
            ..column("description", ColumnType::TEXT)
        },
        column("status", ColumnType::VARCHAR(16)),
        column("createdAt", ColumnType::INT),
    ],
    version: 0,
});

struct TableState {
    schema: TableSchema,
    tree: BPlusTree<RecordId, Record>,
    next_id: RecordId,
}

/// The embedded data store. Construct one per scope; independent engines
/// share nothing.
pub struct DataEngine {
    order: usize,
    banks: HashMap<String, String>,
    tables: HashMap<String, TableState>,
    username_ids: HashMap<String, RecordId>,
    email_ids: HashMap<String, RecordId>,
    account_ids: HashMap<(String, String), RecordId>,
    username_index: Index,
    email_index: Index,
    owner_index: Index,
    transaction: Option<Transaction>,
}

impl Default for DataEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl DataEngine {
    /// Creates an engine with the three built-in bank tables installed.
    pub fn new() -> Self {
        Self::with_order(DEFAULT_ORDER)
    }

    /// Same as [`DataEngine::new`] but with an explicit tree order. Small
    /// orders force rebalancing early and are what the tests use.
    pub fn with_order(order: usize) -> Self {
        let mut engine = DataEngine {
            order,
            banks: HashMap::new(),
            tables: HashMap::new(),
            username_ids: HashMap::new(),
            email_ids: HashMap::new(),
            account_ids: HashMap::new(),
            username_index: Index::new("users_by_username", false, order),
            email_index: Index::new("users_by_email", false, order),
            owner_index: Index::new("accounts_by_owner", false, order),
            transaction: None,
        };
        engine.install_table(&USERS_SCHEMA);
        engine.install_table(&ACCOUNTS_SCHEMA);
        engine.install_table(&TRANSACTIONS_SCHEMA);
        engine
    }

    fn install_table(&mut self, schema: &TableSchema) {
        self.tables.insert(
            schema.table.clone(),
            TableState {
                schema: schema.clone(),
                tree: BPlusTree::new(self.order),
                next_id: 1,
            },
        );
    }

    /// Admits a bank identity. Every table operation must present a name
    /// and routing number that resolve to the same registered bank.
    ///
    /// # Errors
    /// Returns `Error::Engine` when the name is already taken.
    pub fn register_bank(&mut self, bank: &str, routing: &str) -> Result<(), Error> {
        if self.banks.contains_key(bank) {
            return Err(err!(Engine, "Bank '{}' is already registered", bank));
        }
        self.banks.insert(bank.to_string(), routing.to_string());
        info!(bank, routing, "Registered a bank.");
        Ok(())
    }

    /// The schema of a registered table.
    ///
    /// # Errors
    /// Returns `Error::Engine` for an unknown table; an unknown column
    /// within a known schema is the schema's `get_column` returning `None`.
    pub fn schema(&self, table: &str) -> Result<&TableSchema, Error> {
        Ok(&self.table_state(table)?.schema)
    }

    // --- CRUD surface ---

    /// Inserts a record. Injects the auto-increment id, the creation
    /// timestamp, and schema column defaults; validates; enforces unique
    /// columns; then writes and reindexes.
    pub fn insert(
        &mut self,
        bank: &str,
        routing: &str,
        table: &str,
        mut record: Record,
    ) -> Result<RecordId, Error> {
        self.check_identity(bank, routing)?;
        let state = self.table_state(table)?;

        let id = state.next_id;
        record.set("id", Value::Int(id as i64));
        if state.schema.get_column("createdAt").is_some() && !record.contains("createdAt") {
            record.set("createdAt", Value::Int(unix_timestamp_now()));
        }
        for column in &state.schema.columns {
            if let Some(default) = &column.default {
                if !record.contains(&column.name) {
                    record.set(&column.name, default.clone());
                }
            }
        }

        // Everything is checked before the first write.
        state.schema.validate_record(&record)?;
        self.check_unique_constraints(table, &record, None)?;

        self.table_state_mut(table)?.tree.insert(id, record.clone())?;
        self.link_record(table, id, &record)?;
        self.table_state_mut(table)?.next_id = id + 1;
        self.log_undo(UndoOp::Insert {
            table: table.to_string(),
            id,
        });
        debug!(table, id, "Inserted a record.");
        Ok(id)
    }

    /// All records matching every (field, value) pair of the criteria, in
    /// ascending id order. Uniquely-keyed criteria take the O(log n) fast
    /// path; anything else is a full ordered scan.
    pub fn select(
        &self,
        bank: &str,
        routing: &str,
        table: &str,
        criteria: &Criteria,
    ) -> Result<Vec<Record>, Error> {
        self.check_identity(bank, routing)?;
        let state = self.table_state(table)?;

        if criteria.len() == 1 {
            if let Some(id) = criteria.get("id").and_then(Value::as_record_id) {
                return Ok(state.tree.get(&id).into_iter().cloned().collect());
            }
        }
        if let Some(id) = self.fast_path_id(table, criteria) {
            return Ok(state.tree.get(&id).into_iter().cloned().collect());
        }

        Ok(state
            .tree
            .values()
            .filter(|record| record.matches(criteria))
            .cloned()
            .collect())
    }

    /// The first matching record, if any.
    pub fn select_one(
        &self,
        bank: &str,
        routing: &str,
        table: &str,
        criteria: &Criteria,
    ) -> Result<Option<Record>, Error> {
        Ok(self.select(bank, routing, table, criteria)?.into_iter().next())
    }

    /// Every record of a table, in ascending id order.
    pub fn select_all(&self, bank: &str, routing: &str, table: &str) -> Result<Vec<Record>, Error> {
        self.check_identity(bank, routing)?;
        Ok(self.table_state(table)?.tree.values().cloned().collect())
    }

    pub fn exists(
        &self,
        bank: &str,
        routing: &str,
        table: &str,
        criteria: &Criteria,
    ) -> Result<bool, Error> {
        Ok(!self.select(bank, routing, table, criteria)?.is_empty())
    }

    /// Merges `changes` into every matching record at its existing id.
    /// Returns how many records changed.
    ///
    /// # Errors
    /// Returns `Error::InvalidOperation` when `changes` touches the primary
    /// key, `Error::Schema`/`Error::Constraint` when a merged record fails
    /// validation. All of it is detected before the first record is
    /// rewritten.
    pub fn update(
        &mut self,
        bank: &str,
        routing: &str,
        table: &str,
        criteria: &Criteria,
        changes: &Record,
    ) -> Result<usize, Error> {
        self.check_identity(bank, routing)?;
        let matched = self.matching_records(table, criteria)?;
        if matched.is_empty() {
            return Ok(0);
        }

        let primary = self.table_state(table)?.schema.primary_column()?.name.clone();
        if let Some(new_pk) = changes.get(&primary) {
            for (id, _) in &matched {
                if new_pk.as_record_id() != Some(*id) {
                    return Err(err!(
                        InvalidOperation,
                        "Primary-key column '{}' cannot be changed",
                        primary
                    ));
                }
            }
        }

        // Validate the whole batch, including collisions the batch would
        // create among its own rows, before touching anything.
        let mut batch = Vec::new();
        let mut claimed = HashSet::new();
        for (id, before) in matched {
            let mut merged = before.clone();
            merged.merge_from(changes);
            self.table_state(table)?.schema.validate_record(&merged)?;
            self.check_unique_constraints(table, &merged, Some(id))?;
            for claim in self.unique_claims(table, &merged) {
                if !claimed.insert(claim) {
                    return Err(err!(
                        Constraint,
                        "Update assigns the same unique value to multiple records"
                    ));
                }
            }
            batch.push((id, before, merged));
        }

        let count = batch.len();
        for (id, before, merged) in batch {
            self.put_record(table, id, merged)?;
            self.log_undo(UndoOp::Update {
                table: table.to_string(),
                id,
                before,
            });
            debug!(table, id, "Updated a record.");
        }
        Ok(count)
    }

    /// Removes every matching record. Returns how many were removed.
    pub fn delete(
        &mut self,
        bank: &str,
        routing: &str,
        table: &str,
        criteria: &Criteria,
    ) -> Result<usize, Error> {
        self.check_identity(bank, routing)?;
        let matched = self.matching_records(table, criteria)?;
        for (id, before) in &matched {
            self.remove_record(table, *id)?;
            self.log_undo(UndoOp::Delete {
                table: table.to_string(),
                id: *id,
                before: before.clone(),
            });
            debug!(table, id, "Deleted a record.");
        }
        Ok(matched.len())
    }

    // --- transactions ---

    /// Opens the process-wide transaction. At most one may be active.
    ///
    /// # Errors
    /// Returns `Error::Transaction` when one is already open.
    pub fn begin_transaction(&mut self) -> Result<Uuid, Error> {
        if self.transaction.is_some() {
            return Err(err!(Transaction, "Transaction already in progress"));
        }
        let next_ids = self
            .tables
            .iter()
            .map(|(name, state)| (name.clone(), state.next_id))
            .collect();
        let txn = Transaction::begin(next_ids);
        let id = txn.id;
        info!(id = %id, "Transaction started.");
        self.transaction = Some(txn);
        Ok(id)
    }

    /// Makes everything since `begin_transaction` permanent by discarding
    /// the undo log.
    ///
    /// # Errors
    /// Returns `Error::Transaction` when no transaction is open.
    pub fn commit_transaction(&mut self) -> Result<(), Error> {
        let txn = self
            .transaction
            .take()
            .ok_or_else(|| err!(Transaction, "No active transaction to commit"))?;
        info!(id = %txn.id, entries = txn.len(), "Transaction committed.");
        Ok(())
    }

    /// Replays the undo log in strict reverse order, restoring every table,
    /// fast-path map, secondary index, and auto-increment counter to its
    /// state at `begin_transaction`. Uniqueness is not re-validated: the
    /// state being restored was valid when it was captured.
    ///
    /// # Errors
    /// Returns `Error::Transaction` when no transaction is open.
    pub fn rollback_transaction(&mut self) -> Result<(), Error> {
        let txn = self
            .transaction
            .take()
            .ok_or_else(|| err!(Transaction, "No active transaction to roll back"))?;
        info!(id = %txn.id, entries = txn.len(), "Rolling back transaction...");

        let Transaction { log, next_ids, .. } = txn;
        for op in log.into_iter().rev() {
            match op {
                UndoOp::Insert { table, id } => {
                    self.remove_record(&table, id)?;
                }
                UndoOp::Update { table, id, before } | UndoOp::Delete { table, id, before } => {
                    self.put_record(&table, id, before)?;
                }
            }
        }
        for (table, next_id) in next_ids {
            if let Some(state) = self.tables.get_mut(&table) {
                state.next_id = next_id;
            }
        }
        Ok(())
    }

    // --- internals ---

    fn check_identity(&self, bank: &str, routing: &str) -> Result<(), Error> {
        match self.banks.get(bank) {
            Some(registered) if registered == routing => Ok(()),
            Some(_) => Err(err!(
                Engine,
                "Routing number '{}' does not belong to bank '{}'",
                routing,
                bank
            )),
            None => Err(err!(Engine, "Bank '{}' is not registered", bank)),
        }
    }

    fn table_state(&self, table: &str) -> Result<&TableState, Error> {
        self.tables
            .get(table)
            .ok_or_else(|| err!(Engine, "Table '{}' is not registered", table))
    }

    fn table_state_mut(&mut self, table: &str) -> Result<&mut TableState, Error> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| err!(Engine, "Table '{}' is not registered", table))
    }

    fn matching_records(
        &self,
        table: &str,
        criteria: &Criteria,
    ) -> Result<Vec<(RecordId, Record)>, Error> {
        Ok(self
            .table_state(table)?
            .tree
            .entries()
            .filter(|(_, record)| record.matches(criteria))
            .map(|(id, record)| (*id, record.clone()))
            .collect())
    }

    /// Resolves criteria that exactly cover a uniquely-keyed path to the
    /// record id behind it.
    fn fast_path_id(&self, table: &str, criteria: &Criteria) -> Option<RecordId> {
        match table {
            TABLE_USERS => {
                if criteria.len() != 1 {
                    return None;
                }
                if let Some(username) = criteria.get("username").and_then(|v| v.as_str()) {
                    return self.username_ids.get(username).copied();
                }
                if let Some(email) = criteria.get("email").and_then(|v| v.as_str()) {
                    return self.email_ids.get(email).copied();
                }
                None
            }
            TABLE_ACCOUNTS => {
                if criteria.len() != 2 {
                    return None;
                }
                let owner = criteria.get("ownerUsername")?.as_str()?;
                let name = criteria.get("accountName")?.as_str()?;
                self.account_ids
                    .get(&(owner.to_string(), name.to_string()))
                    .copied()
            }
            _ => None,
        }
    }

    /// Rejects records whose unique columns collide with an already-stored
    /// record, `exclude` being the id whose own values do not count.
    fn check_unique_constraints(
        &self,
        table: &str,
        record: &Record,
        exclude: Option<RecordId>,
    ) -> Result<(), Error> {
        match table {
            TABLE_USERS => {
                if let Some(username) = record.get_str("username") {
                    if let Some(existing) = self.username_ids.get(username) {
                        if Some(*existing) != exclude {
                            warn!(username, "Rejected duplicate username.");
                            return Err(err!(
                                Constraint,
                                "Duplicate value for unique column 'username': {}",
                                username
                            ));
                        }
                    }
                }
                if let Some(email) = record.get_str("email") {
                    if let Some(existing) = self.email_ids.get(email) {
                        if Some(*existing) != exclude {
                            warn!(email, "Rejected duplicate email.");
                            return Err(err!(
                                Constraint,
                                "Duplicate value for unique column 'email': {}",
                                email
                            ));
                        }
                    }
                }
            }
            TABLE_ACCOUNTS => {
                if let (Some(owner), Some(name)) = (
                    record.get_str("ownerUsername"),
                    record.get_str("accountName"),
                ) {
                    let key = (owner.to_string(), name.to_string());
                    if let Some(existing) = self.account_ids.get(&key) {
                        if Some(*existing) != exclude {
                            warn!(owner, name, "Rejected duplicate account name.");
                            return Err(err!(
                                Constraint,
                                "Owner '{}' already has an account named '{}'",
                                owner,
                                name
                            ));
                        }
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// The unique-constraint keys a record occupies; used to detect
    /// collisions inside one update batch.
    fn unique_claims(&self, table: &str, record: &Record) -> Vec<(String, String)> {
        let mut claims = Vec::new();
        match table {
            TABLE_USERS => {
                if let Some(username) = record.get_str("username") {
                    claims.push(("username".to_string(), username.to_string()));
                }
                if let Some(email) = record.get_str("email") {
                    claims.push(("email".to_string(), email.to_string()));
                }
            }
            TABLE_ACCOUNTS => {
                if let (Some(owner), Some(name)) = (
                    record.get_str("ownerUsername"),
                    record.get_str("accountName"),
                ) {
                    claims.push(("account".to_string(), format!("{}/{}", owner, name)));
                }
            }
            _ => {}
        }
        claims
    }

    /// Writes a record at a fixed id, reconciling fast-path maps and
    /// secondary indexes. No validation happens here: rollback replays
    /// previously-valid state through this same path.
    fn put_record(&mut self, table: &str, id: RecordId, record: Record) -> Result<(), Error> {
        let old = self.table_state(table)?.tree.get(&id).cloned();
        if let Some(old) = old {
            self.unlink_record(table, id, &old)?;
        }
        self.table_state_mut(table)?.tree.insert(id, record.clone())?;
        self.link_record(table, id, &record)
    }

    /// Removes a record by id, reconciling fast-path maps and secondary
    /// indexes.
    fn remove_record(&mut self, table: &str, id: RecordId) -> Result<Record, Error> {
        let record = self.table_state_mut(table)?.tree.delete(&id)?;
        self.unlink_record(table, id, &record)?;
        Ok(record)
    }

    fn link_record(&mut self, table: &str, id: RecordId, record: &Record) -> Result<(), Error> {
        match table {
            TABLE_USERS => {
                if let Some(username) = record.get_str("username") {
                    self.username_ids.insert(username.to_string(), id);
                    self.username_index.add_posting(username, id)?;
                }
                if let Some(email) = record.get_str("email") {
                    self.email_ids.insert(email.to_string(), id);
                    self.email_index.add_posting(email, id)?;
                }
            }
            TABLE_ACCOUNTS => {
                if let (Some(owner), Some(name)) = (
                    record.get_str("ownerUsername"),
                    record.get_str("accountName"),
                ) {
                    self.account_ids.insert((owner.to_string(), name.to_string()), id);
                }
                if let Some(owner) = record.get_str("ownerUsername") {
                    self.owner_index.add_posting(owner, id)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn unlink_record(&mut self, table: &str, id: RecordId, record: &Record) -> Result<(), Error> {
        match table {
            TABLE_USERS => {
                if let Some(username) = record.get_str("username") {
                    if self.username_ids.get(username) == Some(&id) {
                        self.username_ids.remove(username);
                    }
                    self.username_index.remove_posting(username, id)?;
                }
                if let Some(email) = record.get_str("email") {
                    if self.email_ids.get(email) == Some(&id) {
                        self.email_ids.remove(email);
                    }
                    self.email_index.remove_posting(email, id)?;
                }
            }
            TABLE_ACCOUNTS => {
                if let (Some(owner), Some(name)) = (
                    record.get_str("ownerUsername"),
                    record.get_str("accountName"),
                ) {
                    let key = (owner.to_string(), name.to_string());
                    if self.account_ids.get(&key) == Some(&id) {
                        self.account_ids.remove(&key);
                    }
                }
                if let Some(owner) = record.get_str("ownerUsername") {
                    self.owner_index.remove_posting(owner, id)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn log_undo(&mut self, op: UndoOp) {
        if let Some(txn) = self.transaction.as_mut() {
            txn.record(op);
        }
    }
}

fn unix_timestamp_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}
