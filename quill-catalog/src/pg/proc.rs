//! `pg_proc`: builtin scalar functions resolvable by the binder. Each row
//! names the function, its argument types and its return type; the bodies
//! live in the execution engine's function registry.

use std::sync::Arc;

use quill_storage::{SqlTypeId, SqlValue, TransactionContext, TupleSlot};

use crate::error::CatalogError;
use crate::oid::{postgres, LanguageOid, OidAllocator, ProcOid, TypeOid};
use crate::pg::{oid_value, value_oid, MetaTable};

pub struct ProcRow {
    pub oid: ProcOid,
    pub name: String,
    pub language: LanguageOid,
    pub ret_type: TypeOid,
    pub arg_types: Vec<TypeOid>,
}

/// Builtin functions registered at bootstrap: `(name, args, return)`.
const BUILTINS: &[(&str, &[SqlTypeId], SqlTypeId)] = &[
    ("lower", &[SqlTypeId::Varchar], SqlTypeId::Varchar),
    ("upper", &[SqlTypeId::Varchar], SqlTypeId::Varchar),
    ("length", &[SqlTypeId::Varchar], SqlTypeId::Integer),
    ("abs", &[SqlTypeId::BigInt], SqlTypeId::BigInt),
    ("round", &[SqlTypeId::Real], SqlTypeId::Real),
    ("version", &[], SqlTypeId::Varchar),
];

pub(crate) struct PgProcs {
    procs: MetaTable,
}

impl PgProcs {
    pub fn new() -> Self {
        PgProcs {
            procs: MetaTable::new(&[
                (0, SqlTypeId::Integer), // oid
                (1, SqlTypeId::Varchar), // proname
                (2, SqlTypeId::Integer), // prolang
                (3, SqlTypeId::Integer), // prorettype
                (4, SqlTypeId::Varchar), // argument type oids, comma-joined
            ]),
        }
    }

    pub fn bootstrap(
        &self,
        txn: &Arc<TransactionContext>,
        oids: &OidAllocator,
    ) -> Result<(), CatalogError> {
        for (name, args, ret) in BUILTINS {
            let arg_oids = args
                .iter()
                .map(|a| postgres::type_oid_for(*a).0.to_string())
                .collect::<Vec<_>>()
                .join(",");
            self.procs.insert(
                txn,
                &[
                    oid_value(oids.next_proc().0),
                    SqlValue::Varchar(name.to_string()),
                    oid_value(postgres::INTERNAL_LANGUAGE_OID.0),
                    oid_value(postgres::type_oid_for(*ret).0),
                    SqlValue::Varchar(arg_oids),
                ],
            )?;
        }
        Ok(())
    }

    pub fn procs(&self, txn: &TransactionContext) -> Vec<(TupleSlot, ProcRow)> {
        self.procs
            .scan(txn)
            .into_iter()
            .map(|(slot, v)| {
                let arg_types = v[4]
                    .as_str()
                    .unwrap_or_default()
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| TypeOid(s.parse().unwrap_or(0)))
                    .collect();
                (
                    slot,
                    ProcRow {
                        oid: ProcOid(value_oid(&v[0])),
                        name: v[1].as_str().unwrap_or_default().to_string(),
                        language: LanguageOid(value_oid(&v[2])),
                        ret_type: TypeOid(value_oid(&v[3])),
                        arg_types,
                    },
                )
            })
            .collect()
    }

    pub fn find(&self, txn: &TransactionContext, name: &str) -> Option<ProcRow> {
        self.procs(txn)
            .into_iter()
            .map(|(_, row)| row)
            .find(|row| row.name.eq_ignore_ascii_case(name))
    }

    pub fn num_rows(&self) -> u32 {
        self.procs.num_slots()
    }
}
