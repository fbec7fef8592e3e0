//! The Postgres-style metadata tables. Grouping follows the catalog's
//! internal split: `core` holds the relation-shaped tables (`pg_namespace`,
//! `pg_class`, `pg_attribute`, `pg_index`, `pg_constraint`); types,
//! languages, procedures and statistics each get their own module.

pub mod core;
pub mod language;
pub mod proc;
pub mod statistic;
pub mod types;

use std::sync::Arc;

use quill_storage::{
    ColId, ProjectedRowInitializer, SqlTable, SqlTypeId, SqlValue, TransactionContext, TupleSlot,
};

use crate::error::CatalogError;

/// A metadata table: a plain [`SqlTable`] whose rows are addressed by the
/// declared column positions. Catalog rows go through exactly the same
/// MVCC projected-row path as user data.
pub(crate) struct MetaTable {
    table: Arc<SqlTable>,
    layout: ProjectedRowInitializer,
}

impl MetaTable {
    pub fn new(columns: &[(ColId, SqlTypeId)]) -> Self {
        let layout = ProjectedRowInitializer::new(columns)
            .expect("metadata table layouts are statically well-formed");
        MetaTable {
            table: Arc::new(SqlTable::new(layout.clone())),
            layout,
        }
    }

    /// Insert a row; `values[i]` is the value of declared column `i`.
    pub fn insert(
        &self,
        txn: &Arc<TransactionContext>,
        values: &[SqlValue],
    ) -> Result<TupleSlot, CatalogError> {
        let mut row = self.layout.initialize_row();
        for (col_id, value) in values.iter().enumerate() {
            let pos = row
                .position_of(col_id as ColId)
                .expect("declared column present in layout");
            row.set_value(pos, value)?;
        }
        Ok(self.table.insert(txn, row)?)
    }

    /// Visible rows, each materialized as declared-position-ordered values.
    pub fn scan(&self, txn: &TransactionContext) -> Vec<(TupleSlot, Vec<SqlValue>)> {
        self.table
            .scan(txn, &self.layout)
            .into_iter()
            .map(|(slot, row)| {
                let values = (0..self.layout.num_columns())
                    .map(|i| row.value_by_col_id(i))
                    .collect();
                (slot, values)
            })
            .collect()
    }

    pub fn delete(
        &self,
        txn: &Arc<TransactionContext>,
        slot: TupleSlot,
    ) -> Result<bool, CatalogError> {
        Ok(self.table.delete(txn, slot)?)
    }

    pub fn num_slots(&self) -> u32 {
        self.table.num_slots()
    }
}

pub(crate) fn oid_value(oid: u32) -> SqlValue {
    SqlValue::Integer(oid as i32)
}

pub(crate) fn value_oid(value: &SqlValue) -> u32 {
    value.as_i64().unwrap_or(0) as u32
}
