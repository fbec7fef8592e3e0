use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::StorageError;
use crate::projected_row::{ProjectedRow, ProjectedRowInitializer};
use crate::transaction::{Timestamp, TransactionContext, TS_ABORTED, TS_PENDING};

/// Physical location of a tuple inside a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleSlot(pub u32);

impl fmt::Display for TupleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}

struct TupleVersion {
    row: ProjectedRow,
    created_by: Timestamp,
    created_at: AtomicU64,
    deleted_by: AtomicU64,
    deleted_at: AtomicU64,
}

impl TupleVersion {
    fn new(row: ProjectedRow, created_by: Timestamp) -> Self {
        TupleVersion {
            row,
            created_by,
            created_at: AtomicU64::new(TS_PENDING),
            deleted_by: AtomicU64::new(0),
            deleted_at: AtomicU64::new(TS_PENDING),
        }
    }

    /// Snapshot visibility at `start_ts`, with read-own-writes for the
    /// transaction that stamped the version.
    fn visible_to(&self, start_ts: Timestamp) -> bool {
        let created_at = self.created_at.load(Ordering::Acquire);
        let own_write = self.created_by == start_ts;
        if !own_write && !(created_at != TS_PENDING && created_at != TS_ABORTED && created_at <= start_ts) {
            return false;
        }
        let deleted_by = self.deleted_by.load(Ordering::Acquire);
        if deleted_by == start_ts {
            return false;
        }
        if deleted_by != 0 {
            let deleted_at = self.deleted_at.load(Ordering::Acquire);
            if deleted_at != TS_PENDING && deleted_at != TS_ABORTED && deleted_at <= start_ts {
                return false;
            }
        }
        true
    }

    /// True when another transaction holds an uncommitted write on this
    /// version, or a writer committed after `start_ts`.
    fn conflicts_with(&self, start_ts: Timestamp) -> bool {
        let created_at = self.created_at.load(Ordering::Acquire);
        if self.created_by != start_ts {
            if created_at == TS_PENDING {
                return true;
            }
            if created_at != TS_ABORTED && created_at > start_ts {
                return true;
            }
        }
        let deleted_by = self.deleted_by.load(Ordering::Acquire);
        if deleted_by != 0 && deleted_by != start_ts {
            let deleted_at = self.deleted_at.load(Ordering::Acquire);
            if deleted_at == TS_PENDING || (deleted_at != TS_ABORTED && deleted_at > start_ts) {
                return true;
            }
        }
        false
    }
}

/// An MVCC-versioned in-memory table. Every tuple slot carries a version
/// chain (newest last); writers stamp versions with their start timestamp
/// and finalize them through commit/abort actions on the transaction.
pub struct SqlTable {
    layout: ProjectedRowInitializer,
    slots: RwLock<Vec<Vec<TupleVersion>>>,
}

impl SqlTable {
    /// `layout` must project every column of the table.
    pub fn new(layout: ProjectedRowInitializer) -> Self {
        SqlTable {
            layout,
            slots: RwLock::new(Vec::new()),
        }
    }

    pub fn layout(&self) -> &ProjectedRowInitializer {
        &self.layout
    }

    pub fn num_slots(&self) -> u32 {
        self.slots.read().unwrap().len() as u32
    }

    /// Insert a full row image. Visibility is deferred to commit; abort
    /// poisons the version so it is never observed.
    pub fn insert(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        row: ProjectedRow,
    ) -> Result<TupleSlot, StorageError> {
        let slot = {
            let mut slots = self.slots.write().unwrap();
            slots.push(vec![TupleVersion::new(row, txn.start_ts())]);
            TupleSlot(slots.len() as u32 - 1)
        };

        // The insert created the chain, so its version sits at index 0; the
        // same transaction may grow the chain before commit.
        let table = Arc::clone(self);
        txn.register_commit_action(move |finish| {
            let slots = table.slots.read().unwrap();
            if let Some(version) = slots[slot.0 as usize].first() {
                version.created_at.store(finish, Ordering::Release);
            }
        });
        let table = Arc::clone(self);
        txn.register_abort_action(move |_| {
            let slots = table.slots.read().unwrap();
            if let Some(version) = slots[slot.0 as usize].first() {
                version.created_at.store(TS_ABORTED, Ordering::Release);
            }
        });
        Ok(slot)
    }

    /// Overwrite the columns carried by `delta` in the visible version of
    /// `slot`, installing a new version. Returns false when no version is
    /// visible to the transaction.
    pub fn update(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        slot: TupleSlot,
        delta: &ProjectedRow,
    ) -> Result<bool, StorageError> {
        let start_ts = txn.start_ts();
        let new_version_idx;
        {
            let mut slots = self.slots.write().unwrap();
            let chain = slots
                .get_mut(slot.0 as usize)
                .ok_or(StorageError::InvalidSlot(slot))?;
            let newest = chain.last().ok_or(StorageError::InvalidSlot(slot))?;
            if newest.conflicts_with(start_ts) {
                return Err(StorageError::WriteWriteConflict(slot));
            }
            if !newest.visible_to(start_ts) {
                return Ok(false);
            }

            let mut row = newest.row.clone();
            for pos in 0..delta.num_columns() {
                let col_id = delta.column_ids()[pos as usize];
                if let Some(dst) = row.position_of(col_id) {
                    row.set_value(dst, &delta.value(pos))?;
                }
            }
            // Supersede the old version and install the new image in one step.
            newest.deleted_by.store(start_ts, Ordering::Release);
            chain.push(TupleVersion::new(row, start_ts));
            new_version_idx = chain.len() - 1;
        }

        let table = Arc::clone(self);
        txn.register_commit_action(move |finish| {
            let slots = table.slots.read().unwrap();
            let chain = &slots[slot.0 as usize];
            chain[new_version_idx - 1].deleted_at.store(finish, Ordering::Release);
            chain[new_version_idx].created_at.store(finish, Ordering::Release);
        });
        let table = Arc::clone(self);
        txn.register_abort_action(move |_| {
            let slots = table.slots.read().unwrap();
            let chain = &slots[slot.0 as usize];
            chain[new_version_idx - 1].deleted_by.store(0, Ordering::Release);
            chain[new_version_idx - 1].deleted_at.store(TS_PENDING, Ordering::Release);
            chain[new_version_idx].created_at.store(TS_ABORTED, Ordering::Release);
        });
        Ok(true)
    }

    /// Logically delete the visible version of `slot`.
    pub fn delete(
        self: &Arc<Self>,
        txn: &Arc<TransactionContext>,
        slot: TupleSlot,
    ) -> Result<bool, StorageError> {
        let start_ts = txn.start_ts();
        let version_idx;
        {
            let slots = self.slots.read().unwrap();
            let chain = slots
                .get(slot.0 as usize)
                .ok_or(StorageError::InvalidSlot(slot))?;
            let newest = chain.last().ok_or(StorageError::InvalidSlot(slot))?;
            if newest.conflicts_with(start_ts) {
                return Err(StorageError::WriteWriteConflict(slot));
            }
            if !newest.visible_to(start_ts) {
                return Ok(false);
            }
            newest.deleted_by.store(start_ts, Ordering::Release);
            version_idx = chain.len() - 1;
        }

        let table = Arc::clone(self);
        txn.register_commit_action(move |finish| {
            let slots = table.slots.read().unwrap();
            slots[slot.0 as usize][version_idx]
                .deleted_at
                .store(finish, Ordering::Release);
        });
        let table = Arc::clone(self);
        txn.register_abort_action(move |_| {
            let slots = table.slots.read().unwrap();
            let version = &slots[slot.0 as usize][version_idx];
            version.deleted_by.store(0, Ordering::Release);
            version.deleted_at.store(TS_PENDING, Ordering::Release);
        });
        Ok(true)
    }

    /// Project the visible version of `slot` into a row shaped by `out_init`.
    pub fn select(
        &self,
        txn: &TransactionContext,
        slot: TupleSlot,
        out_init: &ProjectedRowInitializer,
    ) -> Option<ProjectedRow> {
        let slots = self.slots.read().unwrap();
        let chain = slots.get(slot.0 as usize)?;
        let visible = chain.iter().rev().find(|v| v.visible_to(txn.start_ts()))?;
        let mut out = out_init.initialize_row();
        visible.row.project_into(&mut out).ok()?;
        Some(out)
    }

    /// Scan every slot visible at the transaction's snapshot.
    pub fn scan(
        &self,
        txn: &TransactionContext,
        out_init: &ProjectedRowInitializer,
    ) -> Vec<(TupleSlot, ProjectedRow)> {
        self.scan_partition(txn, out_init, 0, u32::MAX)
    }

    /// Scan a slot range, for partitioned parallel pipelines.
    pub fn scan_partition(
        &self,
        txn: &TransactionContext,
        out_init: &ProjectedRowInitializer,
        begin: u32,
        end: u32,
    ) -> Vec<(TupleSlot, ProjectedRow)> {
        let slots = self.slots.read().unwrap();
        let hi = (end as usize).min(slots.len());
        let mut result = Vec::new();
        for idx in (begin as usize)..hi {
            if let Some(visible) = slots[idx].iter().rev().find(|v| v.visible_to(txn.start_ts())) {
                let mut out = out_init.initialize_row();
                if visible.row.project_into(&mut out).is_ok() {
                    result.push((TupleSlot(idx as u32), out));
                }
            }
        }
        result
    }
}

impl fmt::Debug for SqlTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlTable")
            .field("num_slots", &self.num_slots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionManager;
    use crate::value::{SqlTypeId, SqlValue};

    fn table() -> Arc<SqlTable> {
        let layout = ProjectedRowInitializer::new(&[
            (0, SqlTypeId::Integer),
            (1, SqlTypeId::Varchar),
        ])
        .unwrap();
        Arc::new(SqlTable::new(layout))
    }

    fn make_row(table: &SqlTable, a: i32, b: &str) -> ProjectedRow {
        let mut row = table.layout().initialize_row();
        let pos_a = row.position_of(0).unwrap();
        let pos_b = row.position_of(1).unwrap();
        row.set_value(pos_a, &SqlValue::Integer(a)).unwrap();
        row.set_value(pos_b, &SqlValue::Varchar(b.into())).unwrap();
        row
    }

    #[test]
    fn uncommitted_insert_is_private() {
        let mgr = TransactionManager::new();
        let table = table();

        let writer = mgr.begin();
        let slot = table.insert(&writer, make_row(&table, 1, "one")).unwrap();

        let reader = mgr.begin();
        assert!(table.select(&reader, slot, table.layout()).is_none());
        // The writer reads its own write.
        assert!(table.select(&writer, slot, table.layout()).is_some());

        mgr.commit(&writer);
        // Snapshot taken before the commit still cannot see it.
        assert!(table.select(&reader, slot, table.layout()).is_none());
        let late = mgr.begin();
        assert!(table.select(&late, slot, table.layout()).is_some());
    }

    #[test]
    fn aborted_insert_never_becomes_visible() {
        let mgr = TransactionManager::new();
        let table = table();
        let writer = mgr.begin();
        let slot = table.insert(&writer, make_row(&table, 1, "gone")).unwrap();
        mgr.abort(&writer);
        let reader = mgr.begin();
        assert!(table.select(&reader, slot, table.layout()).is_none());
    }

    #[test]
    fn write_write_conflict_detected() {
        let mgr = TransactionManager::new();
        let table = table();
        let setup = mgr.begin();
        let slot = table.insert(&setup, make_row(&table, 1, "base")).unwrap();
        mgr.commit(&setup);

        let t1 = mgr.begin();
        let t2 = mgr.begin();
        assert!(table.delete(&t1, slot).unwrap());
        let err = table.delete(&t2, slot).unwrap_err();
        assert!(matches!(err, StorageError::WriteWriteConflict(_)));
    }

    #[test]
    fn update_installs_new_version_old_snapshot_reads_old() {
        let mgr = TransactionManager::new();
        let table = table();
        let setup = mgr.begin();
        let slot = table.insert(&setup, make_row(&table, 1, "v1")).unwrap();
        mgr.commit(&setup);

        let old_reader = mgr.begin();
        let writer = mgr.begin();
        let mut delta = table.layout().initialize_row();
        let pos = delta.position_of(1).unwrap();
        delta.set_value(pos, &SqlValue::Varchar("v2".into())).unwrap();
        assert!(table.update(&writer, slot, &delta).unwrap());
        mgr.commit(&writer);

        let old_row = table.select(&old_reader, slot, table.layout()).unwrap();
        assert_eq!(old_row.value_by_col_id(1), SqlValue::Varchar("v1".into()));
        let new_reader = mgr.begin();
        let new_row = table.select(&new_reader, slot, table.layout()).unwrap();
        assert_eq!(new_row.value_by_col_id(1), SqlValue::Varchar("v2".into()));
    }

    #[test]
    fn scan_skips_deleted_rows() {
        let mgr = TransactionManager::new();
        let table = table();
        let setup = mgr.begin();
        table.insert(&setup, make_row(&table, 1, "keep")).unwrap();
        let victim = table.insert(&setup, make_row(&table, 2, "drop")).unwrap();
        mgr.commit(&setup);

        let deleter = mgr.begin();
        assert!(table.delete(&deleter, victim).unwrap());
        mgr.commit(&deleter);

        let reader = mgr.begin();
        let rows = table.scan(&reader, table.layout());
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1.value_by_col_id(0), SqlValue::Integer(1));
    }
}
