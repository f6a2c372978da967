//! Client-side replicated table cache.
//!
//! The cache is only ever mutated by applying what the host sends:
//! - An initial snapshot, swapped in atomically once fully decoded
//! - Ordered per-table diffs from each committed transaction
//!
//! UI code reads it through [`EventContext`](crate::client::EventContext)
//! or [`DbConnection::db`](crate::client::DbConnection::db).

mod table;

pub use table::{AnyTableCache, AppliedOps, RowDiff, TableCache};

use crate::error::{Result, SyncError};
use crate::protocol::{TableSnapshot, TableUpdate};
use crate::schema::{Row, SchemaRegistry};
use std::collections::HashMap;

/// Diffs applied by one snapshot or transaction, in table order.
#[derive(Default)]
pub struct CacheDelta {
    pub(crate) tables: Vec<AppliedOps>,
    /// Ops that were skipped.
    pub violations: Vec<SyncError>,
}

impl CacheDelta {
    /// Number of applied row diffs.
    pub fn len(&self) -> usize {
        self.tables.iter().map(|t| t.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tables(&self) -> impl Iterator<Item = &AppliedOps> {
        self.tables.iter()
    }
}

/// All cached tables of one connection.
pub struct ClientCache {
    tables: HashMap<&'static str, Box<dyn AnyTableCache>>,
}

impl ClientCache {
    /// Empty cache with one table per registered table.
    pub fn new(schema: &SchemaRegistry) -> Self {
        let tables = schema.tables().map(|t| (t.name, t.new_cache())).collect();
        Self { tables }
    }

    pub fn table<R: Row>(&self) -> Option<&TableCache<R>> {
        self.tables
            .get(R::TABLE)
            .and_then(|t| t.as_any().downcast_ref::<TableCache<R>>())
    }

    pub fn find<R: Row>(&self, key: &R::Key) -> Option<&R> {
        self.table::<R>().and_then(|t| t.find(key))
    }

    /// Rows of `R`'s table; empty if the table is not registered.
    pub fn iter<R: Row>(&self) -> impl Iterator<Item = &R> {
        self.table::<R>().into_iter().flat_map(|t| t.iter())
    }

    pub fn count<R: Row>(&self) -> usize {
        self.table::<R>().map(|t| t.len()).unwrap_or(0)
    }

    /// Total rows across all tables.
    pub fn total_rows(&self) -> usize {
        self.tables.values().map(|t| t.len()).sum()
    }

    /// Replace the cache contents with a subscription snapshot.
    ///
    /// Every table is decoded before anything is swapped in, so a failing
    /// snapshot leaves the cache exactly as it was. Tables missing from the
    /// snapshot are emptied. A table listed twice fails the snapshot.
    pub fn apply_snapshot(&mut self, snapshot: &[TableSnapshot]) -> Result<CacheDelta> {
        let mut fresh: HashMap<&'static str, Box<dyn AnyTableCache>> = HashMap::new();
        let mut delta = CacheDelta::default();

        for table in snapshot {
            let current = self
                .tables
                .get(table.table.as_str())
                .ok_or_else(|| SyncError::UnknownTable(table.table.clone()))?;
            if fresh.contains_key(current.table_name()) {
                return Err(SyncError::ProtocolViolation {
                    table: table.table.clone(),
                    reason: "table appears twice in snapshot".into(),
                });
            }
            let (cache, inserts) = current.from_snapshot(&table.rows)?;
            fresh.insert(current.table_name(), cache);
            delta.tables.push(inserts);
        }

        for (name, table) in self.tables.iter_mut() {
            match fresh.remove(name) {
                Some(cache) => *table = cache,
                None => *table = table.empty(),
            }
        }

        Ok(delta)
    }

    /// Apply one transaction's diffs in delivery order.
    pub fn apply_updates(&mut self, updates: &[TableUpdate]) -> CacheDelta {
        let mut delta = CacheDelta::default();

        for update in updates {
            let Some(table) = self.tables.get_mut(update.table.as_str()) else {
                delta
                    .violations
                    .push(SyncError::UnknownTable(update.table.clone()));
                continue;
            };
            let (applied, violations) = table.apply_ops(&update.ops);
            delta.tables.push(applied);
            delta.violations.extend(violations);
        }

        delta
    }
}
