//! Logical operators. One variant per operator; the `op_type` tag is the
//! node-type discriminant in the JSON form, which also serves as the memo's
//! content-hash input.

use serde::{Deserialize, Serialize};

use quill_catalog::{Column, DatabaseOid, IndexColumn, IndexOid, NamespaceOid, TableOid};
use quill_storage::SqlTypeId;

use crate::binder::expr::BoundExpr;
use crate::binder::statement::JoinKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub expr: BoundExpr,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op_type")]
pub enum LogicalOp {
    /// Base-table access, with pushed-down predicates.
    Get {
        db_oid: DatabaseOid,
        table_oid: TableOid,
        alias: String,
        predicates: Vec<BoundExpr>,
    },
    Filter {
        predicates: Vec<BoundExpr>,
    },
    Projection {
        exprs: Vec<BoundExpr>,
        names: Vec<String>,
    },
    /// Renames child outputs under a derived-table alias.
    Alias {
        alias: String,
        names: Vec<String>,
    },
    InnerJoin {
        condition: Option<BoundExpr>,
    },
    LeftJoin {
        condition: Option<BoundExpr>,
    },
    OuterJoin {
        condition: Option<BoundExpr>,
    },
    /// Existential subquery join: emits a boolean mark column.
    MarkJoin {
        condition: Option<BoundExpr>,
    },
    /// Scalar subquery join: at most one right row per left row.
    SingleJoin {
        condition: Option<BoundExpr>,
    },
    /// Correlated subquery join awaiting unnesting.
    DependentJoin {
        condition: Option<BoundExpr>,
    },
    Aggregate {
        group_by: Vec<BoundExpr>,
        aggregates: Vec<BoundExpr>,
        having: Option<BoundExpr>,
    },
    Limit {
        limit: u64,
        offset: u64,
        sort_keys: Vec<SortKey>,
    },
    Values {
        rows: Vec<Vec<BoundExpr>>,
        types: Vec<SqlTypeId>,
    },
    Insert {
        db_oid: DatabaseOid,
        table_oid: TableOid,
        column_indexes: Vec<usize>,
        rows: Vec<Vec<BoundExpr>>,
    },
    InsertSelect {
        db_oid: DatabaseOid,
        table_oid: TableOid,
        column_indexes: Vec<usize>,
    },
    Update {
        db_oid: DatabaseOid,
        table_oid: TableOid,
        assignments: Vec<(usize, BoundExpr)>,
    },
    Delete {
        db_oid: DatabaseOid,
        table_oid: TableOid,
    },
    CteScan {
        cte_index: usize,
        alias: String,
        columns: Vec<(String, SqlTypeId)>,
    },
    CsvScan {
        path: String,
        columns: Vec<(String, SqlTypeId)>,
    },
    CreateTable {
        namespace: NamespaceOid,
        name: String,
        columns: Vec<Column>,
        if_not_exists: bool,
    },
    CreateIndex {
        namespace: NamespaceOid,
        name: String,
        table_oid: TableOid,
        key_columns: Vec<IndexColumn>,
        unique: bool,
        if_not_exists: bool,
    },
    DropTable {
        table_oid: Option<TableOid>,
        name: String,
        if_exists: bool,
    },
    DropIndex {
        index_oid: Option<IndexOid>,
        name: String,
        if_exists: bool,
    },
}

impl LogicalOp {
    pub fn name(&self) -> &'static str {
        match self {
            LogicalOp::Get { .. } => "LogicalGet",
            LogicalOp::Filter { .. } => "LogicalFilter",
            LogicalOp::Projection { .. } => "LogicalProjection",
            LogicalOp::Alias { .. } => "LogicalAlias",
            LogicalOp::InnerJoin { .. } => "LogicalInnerJoin",
            LogicalOp::LeftJoin { .. } => "LogicalLeftJoin",
            LogicalOp::OuterJoin { .. } => "LogicalOuterJoin",
            LogicalOp::MarkJoin { .. } => "LogicalMarkJoin",
            LogicalOp::SingleJoin { .. } => "LogicalSingleJoin",
            LogicalOp::DependentJoin { .. } => "LogicalDependentJoin",
            LogicalOp::Aggregate { .. } => "LogicalAggregate",
            LogicalOp::Limit { .. } => "LogicalLimit",
            LogicalOp::Values { .. } => "LogicalValues",
            LogicalOp::Insert { .. } => "LogicalInsert",
            LogicalOp::InsertSelect { .. } => "LogicalInsertSelect",
            LogicalOp::Update { .. } => "LogicalUpdate",
            LogicalOp::Delete { .. } => "LogicalDelete",
            LogicalOp::CteScan { .. } => "LogicalCteScan",
            LogicalOp::CsvScan { .. } => "LogicalCsvScan",
            LogicalOp::CreateTable { .. } => "LogicalCreateTable",
            LogicalOp::CreateIndex { .. } => "LogicalCreateIndex",
            LogicalOp::DropTable { .. } => "LogicalDropTable",
            LogicalOp::DropIndex { .. } => "LogicalDropIndex",
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(
            self,
            LogicalOp::InnerJoin { .. }
                | LogicalOp::LeftJoin { .. }
                | LogicalOp::OuterJoin { .. }
                | LogicalOp::MarkJoin { .. }
                | LogicalOp::SingleJoin { .. }
                | LogicalOp::DependentJoin { .. }
        )
    }

    pub fn join_kind(&self) -> Option<JoinKind> {
        match self {
            LogicalOp::InnerJoin { .. } => Some(JoinKind::Inner),
            LogicalOp::LeftJoin { .. } => Some(JoinKind::Left),
            LogicalOp::OuterJoin { .. } => Some(JoinKind::Full),
            _ => None,
        }
    }
}

/// A logical operator tree, the optimizer's input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalPlan {
    pub op: LogicalOp,
    pub children: Vec<LogicalPlan>,
}

impl LogicalPlan {
    pub fn leaf(op: LogicalOp) -> Self {
        LogicalPlan {
            op,
            children: Vec::new(),
        }
    }

    pub fn unary(op: LogicalOp, child: LogicalPlan) -> Self {
        LogicalPlan {
            op,
            children: vec![child],
        }
    }

    pub fn binary(op: LogicalOp, left: LogicalPlan, right: LogicalPlan) -> Self {
        LogicalPlan {
            op,
            children: vec![left, right],
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("logical plans are serializable")
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_carries_the_op_tag() {
        let plan = LogicalPlan::unary(
            LogicalOp::Filter { predicates: vec![] },
            LogicalPlan::leaf(LogicalOp::Get {
                db_oid: DatabaseOid(1),
                table_oid: TableOid(42),
                alias: "a".into(),
                predicates: vec![],
            }),
        );
        let json = plan.to_json();
        assert_eq!(json["op"]["op_type"], "Filter");
        assert_eq!(json["children"][0]["op"]["op_type"], "Get");
        let back = LogicalPlan::from_json(&json).unwrap();
        assert_eq!(back, plan);
    }
}
