//! Authoritative tables and atomic transactions over them.
//!
//! A transaction reads through to the committed tables and copies a table
//! into its private staging area on first write. Committing swaps the
//! staged tables in; dropping the transaction discards them, so a failed
//! reducer leaves no trace.

use super::procedures::ReducerResult;
use crate::error::{Result, SyncError};
use crate::protocol::{RowOp, TableSnapshot, TableUpdate};
use crate::schema::{encode, Row, SchemaRegistry};
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::marker::PhantomData;

/// Committed rows of one table.
#[derive(Clone, Debug)]
pub struct ServerTable<R: Row> {
    rows: BTreeMap<R::Key, R>,
    /// Next auto-increment value.
    next_id: u64,
}

impl<R: Row> ServerTable<R> {
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn find(&self, key: &R::Key) -> Option<&R> {
        self.rows.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    fn insert(&mut self, mut row: R) -> ReducerResult<R> {
        if R::AUTO_INC {
            match row.auto_inc_key() {
                Some(key) => self.next_id = self.next_id.max(key.saturating_add(1)),
                None => {
                    if !row.set_auto_inc(self.next_id) {
                        return Err(format!("{} has run out of auto-increment keys", R::TABLE));
                    }
                    self.next_id += 1;
                }
            }
        }
        let key = row.primary_key();
        if self.rows.contains_key(&key) {
            return Err(format!("duplicate key {:?} in {}", key, R::TABLE));
        }
        self.rows.insert(key, row.clone());
        Ok(row)
    }

    fn update(&mut self, row: R) -> ReducerResult<R> {
        let key = row.primary_key();
        match self.rows.get_mut(&key) {
            Some(slot) => Ok(std::mem::replace(slot, row)),
            None => Err(format!("no row with key {:?} in {}", key, R::TABLE)),
        }
    }

    fn delete(&mut self, key: &R::Key) -> Option<R> {
        self.rows.remove(key)
    }
}

impl<R: Row> Default for ServerTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Type-erased authoritative table.
pub trait AnyServerTable: Send + Sync {
    fn table_name(&self) -> &'static str;

    fn len(&self) -> usize;

    fn clone_box(&self) -> Box<dyn AnyServerTable>;

    /// Every row, encoded, in key order.
    fn encode_rows(&self) -> Result<Vec<Vec<u8>>>;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<R: Row> AnyServerTable for ServerTable<R> {
    fn table_name(&self) -> &'static str {
        R::TABLE
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn clone_box(&self) -> Box<dyn AnyServerTable> {
        Box::new(self.clone())
    }

    fn encode_rows(&self) -> Result<Vec<Vec<u8>>> {
        self.rows.values().map(encode).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// All committed tables of a module.
pub struct Database {
    tables: HashMap<&'static str, Box<dyn AnyServerTable>>,
}

impl Database {
    pub fn new(schema: &SchemaRegistry) -> Self {
        let tables = schema.tables().map(|t| (t.name, t.new_store())).collect();
        Self { tables }
    }

    pub fn table<R: Row>(&self) -> Option<&ServerTable<R>> {
        self.tables
            .get(R::TABLE)
            .and_then(|t| t.as_any().downcast_ref::<ServerTable<R>>())
    }

    /// Encoded contents of the named tables.
    pub fn snapshot(&self, tables: &[String]) -> Result<Vec<TableSnapshot>> {
        tables
            .iter()
            .map(|name| {
                let table = self
                    .tables
                    .get(name.as_str())
                    .ok_or_else(|| SyncError::UnknownTable(name.clone()))?;
                Ok(TableSnapshot {
                    table: name.clone(),
                    rows: table.encode_rows()?,
                })
            })
            .collect()
    }

    pub fn begin(&self) -> Transaction<'_> {
        Transaction {
            base: self,
            staged: HashMap::new(),
            ops: Vec::new(),
        }
    }

    /// Install the tables a transaction staged.
    pub fn commit(&mut self, commit: Commit) -> Vec<TableUpdate> {
        self.tables.extend(commit.staged);
        commit.updates
    }
}

/// Staged writes of a successful transaction, ready to install.
pub struct Commit {
    staged: HashMap<&'static str, Box<dyn AnyServerTable>>,
    updates: Vec<TableUpdate>,
}

impl Commit {
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// An open transaction.
pub struct Transaction<'a> {
    base: &'a Database,
    staged: HashMap<&'static str, Box<dyn AnyServerTable>>,
    ops: Vec<(&'static str, RowOp)>,
}

impl<'a> Transaction<'a> {
    pub fn table<R: Row>(&mut self) -> TableHandle<'_, 'a, R> {
        TableHandle {
            tx: self,
            _row: PhantomData,
        }
    }

    fn read<R: Row>(&self) -> Option<&ServerTable<R>> {
        match self.staged.get(R::TABLE) {
            Some(table) => table.as_any().downcast_ref::<ServerTable<R>>(),
            None => self.base.table::<R>(),
        }
    }

    fn write<R: Row>(&mut self) -> ReducerResult<&mut ServerTable<R>> {
        if !self.staged.contains_key(R::TABLE) {
            let base = self
                .base
                .tables
                .get(R::TABLE)
                .ok_or_else(|| format!("table {} is not registered", R::TABLE))?;
            self.staged.insert(R::TABLE, base.clone_box());
        }
        self.staged
            .get_mut(R::TABLE)
            .and_then(|t| t.as_any_mut().downcast_mut::<ServerTable<R>>())
            .ok_or_else(|| format!("table {} has a different row type", R::TABLE))
    }

    fn record(&mut self, table: &'static str, op: RowOp) {
        self.ops.push((table, op));
    }

    /// Close the transaction, grouping its diffs per table. Tables appear
    /// in order of first write; ops keep their order within a table.
    pub fn into_commit(self) -> Commit {
        let mut updates: Vec<TableUpdate> = Vec::new();
        for (table, op) in self.ops {
            match updates.iter_mut().find(|u| u.table == table) {
                Some(update) => update.ops.push(op),
                None => updates.push(TableUpdate {
                    table: table.to_string(),
                    ops: vec![op],
                }),
            }
        }
        Commit {
            staged: self.staged,
            updates,
        }
    }
}

/// Typed access to one table inside a transaction.
pub struct TableHandle<'t, 'a, R: Row> {
    tx: &'t mut Transaction<'a>,
    _row: PhantomData<R>,
}

impl<'t, 'a, R: Row> TableHandle<'t, 'a, R> {
    pub fn find(&self, key: &R::Key) -> Option<R> {
        self.tx.read::<R>().and_then(|t| t.find(key)).cloned()
    }

    pub fn iter(&self) -> Vec<R> {
        self.tx
            .read::<R>()
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.tx.read::<R>().map(|t| t.len()).unwrap_or(0)
    }

    /// Insert a row, assigning its auto-increment key if it has none.
    pub fn insert(&mut self, row: R) -> ReducerResult<R> {
        let row = self.tx.write::<R>()?.insert(row)?;
        self.tx
            .record(R::TABLE, RowOp::Insert(encode(&row).map_err(|e| e.to_string())?));
        Ok(row)
    }

    /// Replace the row with the same key. Fails if there is none.
    pub fn update(&mut self, row: R) -> ReducerResult<R> {
        let old = self.tx.write::<R>()?.update(row.clone())?;
        let op = RowOp::Update {
            old: encode(&old).map_err(|e| e.to_string())?,
            new: encode(&row).map_err(|e| e.to_string())?,
        };
        self.tx.record(R::TABLE, op);
        Ok(row)
    }

    /// Delete by key, returning the removed row.
    pub fn delete(&mut self, key: &R::Key) -> ReducerResult<Option<R>> {
        let removed = self.tx.write::<R>()?.delete(key);
        if let Some(row) = &removed {
            self.tx
                .record(R::TABLE, RowOp::Delete(encode(row).map_err(|e| e.to_string())?));
        }
        Ok(removed)
    }
}
