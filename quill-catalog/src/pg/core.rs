//! `pg_namespace`, `pg_class`, `pg_attribute`, `pg_index` and
//! `pg_constraint`: the relation-shaped core of the catalog. Tables and
//! indexes are unified in `pg_class`; every index additionally has a
//! `pg_index` row, and every class column a `pg_attribute` row.

use std::sync::Arc;

use quill_storage::{SqlTypeId, SqlValue, TransactionContext, TupleSlot};

use crate::error::CatalogError;
use crate::oid::{
    postgres, ColumnOid, ConstraintOid, IndexOid, NamespaceOid, TableOid,
};
use crate::pg::{oid_value, value_oid, MetaTable};
use crate::schema::{Column, IndexColumn, IndexSchema, RelKind, Schema};

pub struct NamespaceRow {
    pub oid: NamespaceOid,
    pub name: String,
}

pub struct ClassRow {
    pub oid: u32,
    pub name: String,
    pub namespace: NamespaceOid,
    pub kind: RelKind,
}

pub struct AttributeRow {
    pub oid: ColumnOid,
    pub rel_oid: TableOid,
    pub name: String,
    pub type_id: SqlTypeId,
    pub col_id: u16,
    pub nullable: bool,
    pub default: Option<String>,
}

pub struct IndexRow {
    pub oid: IndexOid,
    pub table_oid: TableOid,
    pub unique: bool,
    pub keys: Vec<IndexColumn>,
}

pub struct ConstraintRow {
    pub oid: ConstraintOid,
    pub name: String,
    pub rel_oid: TableOid,
    pub index_oid: IndexOid,
}

/// The five relation-shaped metadata tables of one database.
pub(crate) struct PgCore {
    namespaces: MetaTable,
    classes: MetaTable,
    attributes: MetaTable,
    indexes: MetaTable,
    constraints: MetaTable,
}

impl PgCore {
    pub fn new() -> Self {
        PgCore {
            namespaces: MetaTable::new(&[(0, SqlTypeId::Integer), (1, SqlTypeId::Varchar)]),
            classes: MetaTable::new(&[
                (0, SqlTypeId::Integer), // oid
                (1, SqlTypeId::Varchar), // relname
                (2, SqlTypeId::Integer), // relnamespace
                (3, SqlTypeId::TinyInt), // relkind
                (4, SqlTypeId::BigInt),  // rel_ptr handle, set once per (oid, generation)
            ]),
            attributes: MetaTable::new(&[
                (0, SqlTypeId::Integer), // attr oid
                (1, SqlTypeId::Integer), // attrelid
                (2, SqlTypeId::Varchar), // attname
                (3, SqlTypeId::Integer), // atttypid
                (4, SqlTypeId::Integer), // storage col id
                (5, SqlTypeId::Boolean), // nullable
                (6, SqlTypeId::Varchar), // default expression, null when absent
            ]),
            indexes: MetaTable::new(&[
                (0, SqlTypeId::Integer), // index oid
                (1, SqlTypeId::Integer), // indexed table oid
                (2, SqlTypeId::Boolean), // unique
                (3, SqlTypeId::Varchar), // key columns, "col_oid[:d]" comma-joined
            ]),
            constraints: MetaTable::new(&[
                (0, SqlTypeId::Integer), // constraint oid
                (1, SqlTypeId::Varchar), // name
                (2, SqlTypeId::Integer), // constrained table
                (3, SqlTypeId::Integer), // backing index
            ]),
        }
    }

    // ---- pg_namespace ----

    pub fn insert_namespace(
        &self,
        txn: &Arc<TransactionContext>,
        oid: NamespaceOid,
        name: &str,
    ) -> Result<TupleSlot, CatalogError> {
        self.namespaces
            .insert(txn, &[oid_value(oid.0), SqlValue::Varchar(name.to_string())])
    }

    pub fn namespaces(&self, txn: &TransactionContext) -> Vec<(TupleSlot, NamespaceRow)> {
        self.namespaces
            .scan(txn)
            .into_iter()
            .map(|(slot, v)| {
                (
                    slot,
                    NamespaceRow {
                        oid: NamespaceOid(value_oid(&v[0])),
                        name: v[1].as_str().unwrap_or_default().to_string(),
                    },
                )
            })
            .collect()
    }

    pub fn delete_namespace(
        &self,
        txn: &Arc<TransactionContext>,
        slot: TupleSlot,
    ) -> Result<bool, CatalogError> {
        self.namespaces.delete(txn, slot)
    }

    // ---- pg_class ----

    pub fn insert_class(
        &self,
        txn: &Arc<TransactionContext>,
        oid: u32,
        name: &str,
        namespace: NamespaceOid,
        kind: RelKind,
    ) -> Result<TupleSlot, CatalogError> {
        self.classes.insert(
            txn,
            &[
                oid_value(oid),
                SqlValue::Varchar(name.to_string()),
                oid_value(namespace.0),
                SqlValue::TinyInt(kind.as_i8()),
                SqlValue::BigInt(oid as i64),
            ],
        )
    }

    pub fn classes(&self, txn: &TransactionContext) -> Vec<(TupleSlot, ClassRow)> {
        self.classes
            .scan(txn)
            .into_iter()
            .filter_map(|(slot, v)| {
                let kind = match &v[3] {
                    SqlValue::TinyInt(k) => RelKind::from_i8(*k)?,
                    _ => return None,
                };
                Some((
                    slot,
                    ClassRow {
                        oid: value_oid(&v[0]),
                        name: v[1].as_str().unwrap_or_default().to_string(),
                        namespace: NamespaceOid(value_oid(&v[2])),
                        kind,
                    },
                ))
            })
            .collect()
    }

    pub fn delete_class(
        &self,
        txn: &Arc<TransactionContext>,
        slot: TupleSlot,
    ) -> Result<bool, CatalogError> {
        self.classes.delete(txn, slot)
    }

    // ---- pg_attribute ----

    pub fn insert_attributes(
        &self,
        txn: &Arc<TransactionContext>,
        rel_oid: TableOid,
        schema: &Schema,
    ) -> Result<(), CatalogError> {
        for column in schema.columns() {
            self.attributes.insert(
                txn,
                &[
                    oid_value(column.oid().0),
                    oid_value(rel_oid.0),
                    SqlValue::Varchar(column.name().to_string()),
                    oid_value(postgres::type_oid_for(column.type_id()).0),
                    SqlValue::Integer(column.col_id() as i32),
                    SqlValue::Boolean(column.nullable()),
                    match column.default() {
                        Some(v) => SqlValue::Varchar(v.to_string()),
                        None => SqlValue::Null,
                    },
                ],
            )?;
        }
        Ok(())
    }

    pub fn attributes(&self, txn: &TransactionContext) -> Vec<(TupleSlot, AttributeRow)> {
        self.attributes
            .scan(txn)
            .into_iter()
            .map(|(slot, v)| {
                (
                    slot,
                    AttributeRow {
                        oid: ColumnOid(value_oid(&v[0])),
                        rel_oid: TableOid(value_oid(&v[1])),
                        name: v[2].as_str().unwrap_or_default().to_string(),
                        type_id: postgres::sql_type_for(crate::oid::TypeOid(value_oid(&v[3]))),
                        col_id: value_oid(&v[4]) as u16,
                        nullable: v[5].as_bool().unwrap_or(true),
                        default: v[6].as_str().map(str::to_string),
                    },
                )
            })
            .collect()
    }

    pub fn delete_attribute(
        &self,
        txn: &Arc<TransactionContext>,
        slot: TupleSlot,
    ) -> Result<bool, CatalogError> {
        self.attributes.delete(txn, slot)
    }

    // ---- pg_index ----

    pub fn insert_index(
        &self,
        txn: &Arc<TransactionContext>,
        schema: &IndexSchema,
    ) -> Result<TupleSlot, CatalogError> {
        let keys = schema
            .columns()
            .iter()
            .map(|k| {
                if k.descending {
                    format!("{}:d", k.column_oid.0)
                } else {
                    k.column_oid.0.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        self.indexes.insert(
            txn,
            &[
                oid_value(schema.oid().0),
                oid_value(schema.table_oid().0),
                SqlValue::Boolean(schema.unique()),
                SqlValue::Varchar(keys),
            ],
        )
    }

    pub fn indexes(&self, txn: &TransactionContext) -> Vec<(TupleSlot, IndexRow)> {
        self.indexes
            .scan(txn)
            .into_iter()
            .map(|(slot, v)| {
                let keys = v[3]
                    .as_str()
                    .unwrap_or_default()
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|part| {
                        let descending = part.ends_with(":d");
                        let oid = part.trim_end_matches(":d").parse::<u32>().unwrap_or(0);
                        IndexColumn {
                            column_oid: ColumnOid(oid),
                            descending,
                        }
                    })
                    .collect();
                (
                    slot,
                    IndexRow {
                        oid: IndexOid(value_oid(&v[0])),
                        table_oid: TableOid(value_oid(&v[1])),
                        unique: v[2].as_bool().unwrap_or(false),
                        keys,
                    },
                )
            })
            .collect()
    }

    pub fn delete_index(
        &self,
        txn: &Arc<TransactionContext>,
        slot: TupleSlot,
    ) -> Result<bool, CatalogError> {
        self.indexes.delete(txn, slot)
    }

    // ---- pg_constraint ----

    pub fn insert_constraint(
        &self,
        txn: &Arc<TransactionContext>,
        oid: ConstraintOid,
        name: &str,
        rel_oid: TableOid,
        index_oid: IndexOid,
    ) -> Result<TupleSlot, CatalogError> {
        self.constraints.insert(
            txn,
            &[
                oid_value(oid.0),
                SqlValue::Varchar(name.to_string()),
                oid_value(rel_oid.0),
                oid_value(index_oid.0),
            ],
        )
    }

    pub fn constraints(&self, txn: &TransactionContext) -> Vec<(TupleSlot, ConstraintRow)> {
        self.constraints
            .scan(txn)
            .into_iter()
            .map(|(slot, v)| {
                (
                    slot,
                    ConstraintRow {
                        oid: ConstraintOid(value_oid(&v[0])),
                        name: v[1].as_str().unwrap_or_default().to_string(),
                        rel_oid: TableOid(value_oid(&v[2])),
                        index_oid: IndexOid(value_oid(&v[3])),
                    },
                )
            })
            .collect()
    }

    pub fn delete_constraint(
        &self,
        txn: &Arc<TransactionContext>,
        slot: TupleSlot,
    ) -> Result<bool, CatalogError> {
        self.constraints.delete(txn, slot)
    }

    pub fn num_rows(&self) -> u32 {
        self.namespaces.num_slots()
            + self.classes.num_slots()
            + self.attributes.num_slots()
            + self.indexes.num_slots()
            + self.constraints.num_slots()
    }
}

/// Build an attribute-backed [`Schema`] for readers that only hold catalog
/// rows (recovery, introspection).
pub fn schema_from_attributes(mut rows: Vec<AttributeRow>) -> Schema {
    rows.sort_by_key(|r| r.col_id);
    let columns = rows
        .into_iter()
        .map(|r| {
            let mut column = Column::new(r.name, r.type_id, r.nullable);
            if let Some(default) = r.default {
                column = column.with_default(SqlValue::Varchar(default));
            }
            column
        })
        .collect();
    Schema::new(columns)
}
