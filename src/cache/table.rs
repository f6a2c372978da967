//! Per-table client cache.

use crate::error::{Result, SyncError};
use crate::protocol::RowOp;
use crate::schema::{decode, Row};
use std::any::Any;
use std::collections::BTreeMap;

/// A decoded row diff. Updates carry both values so observers can compare
/// individual fields.
#[derive(Clone, Debug, PartialEq)]
pub enum RowDiff<R> {
    Insert(R),
    Update { old: R, new: R },
    Delete(R),
}

impl<R: Row> RowDiff<R> {
    pub fn decode(op: &RowOp) -> Result<Self> {
        Ok(match op {
            RowOp::Insert(row) => RowDiff::Insert(decode(row)?),
            RowOp::Update { old, new } => RowDiff::Update {
                old: decode(old)?,
                new: decode(new)?,
            },
            RowOp::Delete(row) => RowDiff::Delete(decode(row)?),
        })
    }
}

/// Current rows of one table, keyed by primary key.
#[derive(Clone, Debug)]
pub struct TableCache<R: Row> {
    rows: BTreeMap<R::Key, R>,
}

impl<R: Row> TableCache<R> {
    pub fn new() -> Self {
        Self {
            rows: BTreeMap::new(),
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

    /// Rows in primary key order.
    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    /// Apply one diff. Inserting a present key, or updating or deleting an
    /// absent one, is a protocol violation and leaves the cache unchanged.
    pub fn apply(&mut self, diff: &RowDiff<R>) -> Result<()> {
        match diff {
            RowDiff::Insert(row) => {
                let key = row.primary_key();
                if self.rows.contains_key(&key) {
                    return Err(SyncError::violation(
                        R::TABLE,
                        format!("insert of existing key {:?}", key),
                    ));
                }
                self.rows.insert(key, row.clone());
            }
            RowDiff::Update { old, new } => {
                let key = old.primary_key();
                if key != new.primary_key() {
                    return Err(SyncError::violation(
                        R::TABLE,
                        format!("update changes key {:?} to {:?}", key, new.primary_key()),
                    ));
                }
                match self.rows.get_mut(&key) {
                    Some(slot) => *slot = new.clone(),
                    None => {
                        return Err(SyncError::violation(
                            R::TABLE,
                            format!("update of absent key {:?}", key),
                        ))
                    }
                }
            }
            RowDiff::Delete(row) => {
                let key = row.primary_key();
                if self.rows.remove(&key).is_none() {
                    return Err(SyncError::violation(
                        R::TABLE,
                        format!("delete of absent key {:?}", key),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Build a table from a full snapshot. Duplicate keys are rejected.
    pub fn with_rows(rows: Vec<R>) -> Result<Self> {
        let mut table = Self::new();
        for row in rows {
            table.apply(&RowDiff::Insert(row))?;
        }
        Ok(table)
    }
}

impl<R: Row> Default for TableCache<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Diffs applied to one table, kept for dispatch.
pub struct AppliedOps {
    pub(crate) table: &'static str,
    /// `Vec<RowDiff<R>>` for the table's row type, in application order.
    pub(crate) events: Box<dyn Any + Send>,
    pub(crate) count: usize,
}

impl AppliedOps {
    pub fn table(&self) -> &'static str {
        self.table
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Typed view of the applied diffs.
    pub fn diffs<R: Row>(&self) -> Option<&[RowDiff<R>]> {
        self.events
            .downcast_ref::<Vec<RowDiff<R>>>()
            .map(|v| v.as_slice())
    }
}

/// Type-erased table cache, so tables can be driven by name.
pub trait AnyTableCache: Send {
    fn table_name(&self) -> &'static str;

    fn len(&self) -> usize;

    /// Decode and apply ops in delivery order. Ops that fail to decode or
    /// violate the cache invariants are skipped and reported.
    fn apply_ops(&mut self, ops: &[RowOp]) -> (AppliedOps, Vec<SyncError>);

    /// Fresh cache holding exactly `rows`, plus the inserts to announce.
    fn from_snapshot(&self, rows: &[Vec<u8>]) -> Result<(Box<dyn AnyTableCache>, AppliedOps)>;

    /// Empty cache of the same row type.
    fn empty(&self) -> Box<dyn AnyTableCache>;

    fn as_any(&self) -> &dyn Any;
}

impl<R: Row> AnyTableCache for TableCache<R> {
    fn table_name(&self) -> &'static str {
        R::TABLE
    }

    fn len(&self) -> usize {
        self.rows.len()
    }

    fn apply_ops(&mut self, ops: &[RowOp]) -> (AppliedOps, Vec<SyncError>) {
        let mut applied: Vec<RowDiff<R>> = Vec::with_capacity(ops.len());
        let mut violations = Vec::new();

        for op in ops {
            let result = RowDiff::<R>::decode(op).and_then(|diff| {
                self.apply(&diff)?;
                Ok(diff)
            });
            match result {
                Ok(diff) => applied.push(diff),
                Err(e) => violations.push(e),
            }
        }

        let count = applied.len();
        (
            AppliedOps {
                table: R::TABLE,
                events: Box::new(applied),
                count,
            },
            violations,
        )
    }

    fn from_snapshot(&self, rows: &[Vec<u8>]) -> Result<(Box<dyn AnyTableCache>, AppliedOps)> {
        let decoded = rows
            .iter()
            .map(|bytes| decode::<R>(bytes))
            .collect::<Result<Vec<R>>>()?;

        let table = TableCache::with_rows(decoded.clone())?;
        let inserts: Vec<RowDiff<R>> = decoded.into_iter().map(RowDiff::Insert).collect();
        let count = inserts.len();

        Ok((
            Box::new(table),
            AppliedOps {
                table: R::TABLE,
                events: Box::new(inserts),
                count,
            },
        ))
    }

    fn empty(&self) -> Box<dyn AnyTableCache> {
        Box::new(TableCache::<R>::new())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{encode, User};
    use crate::types::{Identity, Timestamp};

    fn user(token: &str, name: Option<&str>, online: bool) -> User {
        User {
            identity: Identity::from_token(token),
            name: name.map(String::from),
            online,
            last_seen: Timestamp(1),
        }
    }

    #[test]
    fn test_insert_update_delete() {
        let mut table = TableCache::<User>::new();
        let a = user("a", None, true);
        let renamed = user("a", Some("Alice"), true);

        table.apply(&RowDiff::Insert(a.clone())).unwrap();
        assert_eq!(table.len(), 1);

        table
            .apply(&RowDiff::Update {
                old: a.clone(),
                new: renamed.clone(),
            })
            .unwrap();
        assert_eq!(table.find(&a.identity), Some(&renamed));

        table.apply(&RowDiff::Delete(renamed)).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn test_update_of_absent_key_is_violation() {
        let mut table = TableCache::<User>::new();
        let a = user("a", None, true);
        let result = table.apply(&RowDiff::Update {
            old: a.clone(),
            new: a.clone(),
        });
        assert!(matches!(result, Err(SyncError::ProtocolViolation { .. })));
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_insert_and_missing_delete_are_violations() {
        let mut table = TableCache::<User>::new();
        let a = user("a", None, true);
        table.apply(&RowDiff::Insert(a.clone())).unwrap();
        assert!(table.apply(&RowDiff::Insert(a.clone())).is_err());
        assert!(table.apply(&RowDiff::Delete(user("b", None, false))).is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_update_cannot_change_key() {
        let mut table = TableCache::<User>::new();
        let a = user("a", None, true);
        table.apply(&RowDiff::Insert(a.clone())).unwrap();
        let result = table.apply(&RowDiff::Update {
            old: a.clone(),
            new: user("b", None, true),
        });
        assert!(result.is_err());
        assert_eq!(table.find(&a.identity), Some(&a));
    }

    #[test]
    fn test_apply_ops_skips_bad_ops_and_keeps_order() {
        let mut table = TableCache::<User>::new();
        let a = user("a", None, true);
        let a2 = user("a", Some("A"), true);
        let ops = vec![
            RowOp::Insert(encode(&a).unwrap()),
            RowOp::Insert(vec![0xc1]),
            RowOp::Update {
                old: encode(&a).unwrap(),
                new: encode(&a2).unwrap(),
            },
        ];

        let (applied, violations) = table.apply_ops(&ops);
        assert_eq!(violations.len(), 1);
        assert_eq!(applied.len(), 2);
        let diffs = applied.diffs::<User>().unwrap();
        assert!(matches!(diffs[0], RowDiff::Insert(_)));
        assert!(matches!(diffs[1], RowDiff::Update { .. }));
        assert_eq!(table.find(&a.identity), Some(&a2));
    }

    #[test]
    fn test_snapshot_rejects_duplicate_keys() {
        let a = user("a", None, true);
        let rows = vec![encode(&a).unwrap(), encode(&a).unwrap()];
        let result = TableCache::<User>::new().from_snapshot(&rows);
        assert!(result.is_err());
    }
}
