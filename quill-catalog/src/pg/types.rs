//! `pg_type`: the builtin SQL types. Bootstrapped once per database with the
//! reserved type OIDs; user-defined types are out of scope.

use std::sync::Arc;

use quill_storage::{SqlTypeId, SqlValue, TransactionContext, TupleSlot};

use crate::error::CatalogError;
use crate::oid::{postgres, type_len, TypeOid};
use crate::pg::{oid_value, value_oid, MetaTable};

pub struct TypeRow {
    pub oid: TypeOid,
    pub name: String,
    pub len: i16,
    pub by_val: bool,
}

pub(crate) struct PgTypes {
    types: MetaTable,
}

impl PgTypes {
    pub fn new() -> Self {
        PgTypes {
            types: MetaTable::new(&[
                (0, SqlTypeId::Integer),  // oid
                (1, SqlTypeId::Varchar),  // typname
                (2, SqlTypeId::SmallInt), // typlen, -1 for varlen
                (3, SqlTypeId::Boolean),  // typbyval
            ]),
        }
    }

    pub fn bootstrap(&self, txn: &Arc<TransactionContext>) -> Result<(), CatalogError> {
        for (oid, type_id) in postgres::builtin_types() {
            self.types.insert(
                txn,
                &[
                    oid_value(oid.0),
                    SqlValue::Varchar(type_id.name().to_string()),
                    SqlValue::SmallInt(type_len(*type_id)),
                    SqlValue::Boolean(*type_id != SqlTypeId::Varchar),
                ],
            )?;
        }
        Ok(())
    }

    pub fn types(&self, txn: &TransactionContext) -> Vec<(TupleSlot, TypeRow)> {
        self.types
            .scan(txn)
            .into_iter()
            .map(|(slot, v)| {
                (
                    slot,
                    TypeRow {
                        oid: TypeOid(value_oid(&v[0])),
                        name: v[1].as_str().unwrap_or_default().to_string(),
                        len: v[2].as_i64().unwrap_or(-1) as i16,
                        by_val: v[3].as_bool().unwrap_or(false),
                    },
                )
            })
            .collect()
    }

    pub fn num_rows(&self) -> u32 {
        self.types.num_slots()
    }
}
