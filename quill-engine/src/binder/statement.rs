//! Resolved statement trees produced by the binder and consumed by the
//! logical-plan transformer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use quill_catalog::{Column, DatabaseOid, IndexColumn, IndexOid, NamespaceOid, Schema, TableOid};
use quill_storage::SqlTypeId;

use crate::binder::expr::BoundExpr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
    Cross,
}

#[derive(Debug, Clone)]
pub struct BoundBaseTable {
    pub db_oid: DatabaseOid,
    pub table_oid: TableOid,
    pub alias: String,
    pub schema: Arc<Schema>,
}

#[derive(Debug, Clone)]
pub enum BoundTableRef {
    Base(BoundBaseTable),
    Join {
        kind: JoinKind,
        left: Box<BoundTableRef>,
        right: Box<BoundTableRef>,
        condition: Option<BoundExpr>,
    },
    Subquery {
        select: Box<BoundSelect>,
        alias: String,
        columns: Vec<(String, SqlTypeId)>,
    },
    CteReference {
        cte_index: usize,
        alias: String,
        columns: Vec<(String, SqlTypeId)>,
    },
}

#[derive(Debug, Clone)]
pub struct BoundOrderBy {
    pub expr: BoundExpr,
    pub descending: bool,
}

/// A bound non-recursive common table expression.
#[derive(Debug, Clone)]
pub struct BoundCte {
    pub name: String,
    pub select: BoundSelect,
    pub columns: Vec<(String, SqlTypeId)>,
}

#[derive(Debug, Clone, Default)]
pub struct BoundSelect {
    pub ctes: Vec<BoundCte>,
    pub table: Option<BoundTableRef>,
    pub select_list: Vec<BoundExpr>,
    pub output_names: Vec<String>,
    pub predicate: Option<BoundExpr>,
    pub group_by: Vec<BoundExpr>,
    pub having: Option<BoundExpr>,
    pub order_by: Vec<BoundOrderBy>,
    pub limit: Option<u64>,
    pub offset: u64,
    pub distinct: bool,
    pub depth: u32,
}

impl BoundSelect {
    pub fn output_types(&self) -> Vec<SqlTypeId> {
        self.select_list.iter().map(|e| e.type_id()).collect()
    }

    pub fn is_aggregate(&self) -> bool {
        !self.group_by.is_empty()
            || self.having.is_some()
            || self.select_list.iter().any(|e| e.has_aggregate())
    }
}

#[derive(Debug, Clone)]
pub enum InsertSource {
    Values(Vec<Vec<BoundExpr>>),
    Select(Box<BoundSelect>),
}

#[derive(Debug, Clone)]
pub struct BoundInsert {
    pub table: BoundBaseTable,
    /// Target columns in the order values are supplied.
    pub column_indexes: Vec<usize>,
    pub source: InsertSource,
}

#[derive(Debug, Clone)]
pub struct BoundUpdate {
    pub table: BoundBaseTable,
    /// `(schema column index, new value)` pairs.
    pub assignments: Vec<(usize, BoundExpr)>,
    pub predicate: Option<BoundExpr>,
}

#[derive(Debug, Clone)]
pub struct BoundDelete {
    pub table: BoundBaseTable,
    pub predicate: Option<BoundExpr>,
}

#[derive(Debug, Clone)]
pub struct BoundCreateTable {
    pub namespace: NamespaceOid,
    pub name: String,
    pub columns: Vec<Column>,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone)]
pub struct BoundCreateIndex {
    pub namespace: NamespaceOid,
    pub name: String,
    pub table_oid: TableOid,
    pub key_columns: Vec<IndexColumn>,
    pub unique: bool,
    pub if_not_exists: bool,
}

#[derive(Debug, Clone)]
pub struct BoundDropTable {
    pub name: String,
    pub table_oid: Option<TableOid>,
    pub if_exists: bool,
}

#[derive(Debug, Clone)]
pub struct BoundDropIndex {
    pub name: String,
    pub index_oid: Option<IndexOid>,
    pub if_exists: bool,
}

/// `COPY table FROM 'file.csv'` bulk load.
#[derive(Debug, Clone)]
pub struct BoundCopy {
    pub table: BoundBaseTable,
    pub path: String,
}

#[derive(Debug, Clone)]
pub enum BoundStatement {
    Select(BoundSelect),
    Insert(BoundInsert),
    Update(BoundUpdate),
    Delete(BoundDelete),
    Copy(BoundCopy),
    CreateTable(BoundCreateTable),
    CreateIndex(BoundCreateIndex),
    DropTable(BoundDropTable),
    DropIndex(BoundDropIndex),
    Explain(Box<BoundStatement>),
}

impl BoundStatement {
    /// Output column `(name, type)` pairs for RowDescription.
    pub fn output_schema(&self) -> Vec<(String, SqlTypeId)> {
        match self {
            BoundStatement::Select(select) => select
                .output_names
                .iter()
                .cloned()
                .zip(select.output_types())
                .collect(),
            BoundStatement::Explain(_) => {
                vec![("QUERY PLAN".to_string(), SqlTypeId::Varchar)]
            }
            _ => Vec::new(),
        }
    }
}
