//! `pg_language`: procedure languages. Only the builtin `internal` and
//! `sql` entries exist; loading user languages is out of scope.

use std::sync::Arc;

use quill_storage::{SqlTypeId, SqlValue, TransactionContext, TupleSlot};

use crate::error::CatalogError;
use crate::oid::{postgres, LanguageOid};
use crate::pg::{oid_value, value_oid, MetaTable};

pub struct LanguageRow {
    pub oid: LanguageOid,
    pub name: String,
}

pub(crate) struct PgLanguages {
    languages: MetaTable,
}

impl PgLanguages {
    pub fn new() -> Self {
        PgLanguages {
            languages: MetaTable::new(&[(0, SqlTypeId::Integer), (1, SqlTypeId::Varchar)]),
        }
    }

    pub fn bootstrap(&self, txn: &Arc<TransactionContext>) -> Result<(), CatalogError> {
        for (oid, name) in [
            (postgres::INTERNAL_LANGUAGE_OID, "internal"),
            (postgres::SQL_LANGUAGE_OID, "sql"),
        ] {
            self.languages
                .insert(txn, &[oid_value(oid.0), SqlValue::Varchar(name.to_string())])?;
        }
        Ok(())
    }

    pub fn languages(&self, txn: &TransactionContext) -> Vec<(TupleSlot, LanguageRow)> {
        self.languages
            .scan(txn)
            .into_iter()
            .map(|(slot, v)| {
                (
                    slot,
                    LanguageRow {
                        oid: LanguageOid(value_oid(&v[0])),
                        name: v[1].as_str().unwrap_or_default().to_string(),
                    },
                )
            })
            .collect()
    }

    pub fn num_rows(&self) -> u32 {
        self.languages.num_slots()
    }
}
