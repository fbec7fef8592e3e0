//! `pg_statistic`: per-column synopses and per-table aggregates consumed by
//! the optimizer's cost model.

use std::sync::Arc;

use quill_storage::{SqlTypeId, SqlValue, TransactionContext, TupleSlot};

use crate::error::CatalogError;
use crate::oid::{ColumnOid, TableOid};
use crate::pg::{oid_value, value_oid, MetaTable};
use crate::statistics::ColumnStatistics;

pub(crate) struct PgStatistics {
    statistics: MetaTable,
}

impl PgStatistics {
    pub fn new() -> Self {
        PgStatistics {
            statistics: MetaTable::new(&[
                (0, SqlTypeId::Integer), // starelid
                (1, SqlTypeId::Integer), // staattoid
                (2, SqlTypeId::BigInt),  // row count
                (3, SqlTypeId::BigInt),  // non-null count
                (4, SqlTypeId::BigInt),  // distinct estimate
            ]),
        }
    }

    pub fn record(
        &self,
        txn: &Arc<TransactionContext>,
        table: TableOid,
        column: ColumnOid,
        stats: ColumnStatistics,
    ) -> Result<TupleSlot, CatalogError> {
        // Replace any previous synopsis for the column.
        for (slot, rel, col) in self.entries(txn) {
            if rel == table && col == column {
                self.statistics.delete(txn, slot)?;
            }
        }
        self.statistics.insert(
            txn,
            &[
                oid_value(table.0),
                oid_value(column.0),
                SqlValue::BigInt(stats.num_rows as i64),
                SqlValue::BigInt(stats.non_null_rows as i64),
                SqlValue::BigInt(stats.distinct_values as i64),
            ],
        )
    }

    pub fn get(
        &self,
        txn: &TransactionContext,
        table: TableOid,
        column: ColumnOid,
    ) -> Option<ColumnStatistics> {
        self.statistics
            .scan(txn)
            .into_iter()
            .find(|(_, v)| {
                TableOid(value_oid(&v[0])) == table && ColumnOid(value_oid(&v[1])) == column
            })
            .map(|(_, v)| ColumnStatistics {
                num_rows: v[2].as_i64().unwrap_or(0) as u64,
                non_null_rows: v[3].as_i64().unwrap_or(0) as u64,
                distinct_values: v[4].as_i64().unwrap_or(0) as u64,
            })
    }

    fn entries(&self, txn: &TransactionContext) -> Vec<(TupleSlot, TableOid, ColumnOid)> {
        self.statistics
            .scan(txn)
            .into_iter()
            .map(|(slot, v)| {
                (
                    slot,
                    TableOid(value_oid(&v[0])),
                    ColumnOid(value_oid(&v[1])),
                )
            })
            .collect()
    }

    pub fn delete_for_table(
        &self,
        txn: &Arc<TransactionContext>,
        table: TableOid,
    ) -> Result<(), CatalogError> {
        for (slot, rel, _) in self.entries(txn) {
            if rel == table {
                self.statistics.delete(txn, slot)?;
            }
        }
        Ok(())
    }

    pub fn num_rows(&self) -> u32 {
        self.statistics.num_slots()
    }
}
