//! Physical operators and plan-tree nodes. Each node carries its output
//! columns as bound expressions so parents (and the compiler's expression
//! translators) resolve references by structural matching.

use serde::{Deserialize, Serialize};

use quill_catalog::{Column, DatabaseOid, IndexColumn, IndexOid, NamespaceOid, TableOid};
use quill_storage::SqlTypeId;

use crate::binder::expr::BoundExpr;
use crate::binder::statement::JoinKind;
use crate::plan::logical::SortKey;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plan_node_type")]
pub enum PhysicalOp {
    SeqScan {
        db_oid: DatabaseOid,
        table_oid: TableOid,
        alias: String,
        predicates: Vec<BoundExpr>,
    },
    IndexScan {
        db_oid: DatabaseOid,
        table_oid: TableOid,
        index_oid: IndexOid,
        alias: String,
        predicates: Vec<BoundExpr>,
        descending: bool,
    },
    Filter {
        predicates: Vec<BoundExpr>,
    },
    Projection {
        exprs: Vec<BoundExpr>,
        names: Vec<String>,
    },
    Alias {
        alias: String,
        names: Vec<String>,
    },
    HashJoin {
        kind: JoinKind,
        left_keys: Vec<BoundExpr>,
        right_keys: Vec<BoundExpr>,
        residual: Option<BoundExpr>,
    },
    NestedLoopJoin {
        kind: JoinKind,
        condition: Option<BoundExpr>,
    },
    IndexNestedLoopJoin {
        kind: JoinKind,
        db_oid: DatabaseOid,
        table_oid: TableOid,
        index_oid: IndexOid,
        alias: String,
        outer_keys: Vec<BoundExpr>,
    },
    HashAggregate {
        group_by: Vec<BoundExpr>,
        aggregates: Vec<BoundExpr>,
        having: Option<BoundExpr>,
    },
    /// Streaming aggregate over input sorted on the group-by columns.
    SortAggregate {
        group_by: Vec<BoundExpr>,
        aggregates: Vec<BoundExpr>,
        having: Option<BoundExpr>,
    },
    /// Aggregate without grouping: a single payload in the query state.
    StaticAggregate {
        aggregates: Vec<BoundExpr>,
        having: Option<BoundExpr>,
    },
    Sort {
        sort_keys: Vec<SortKey>,
    },
    Limit {
        limit: u64,
        offset: u64,
        /// Non-empty for top-K: the sort pushed into the limit.
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

impl PhysicalOp {
    pub fn name(&self) -> &'static str {
        match self {
            PhysicalOp::SeqScan { .. } => "SeqScan",
            PhysicalOp::IndexScan { .. } => "IndexScan",
            PhysicalOp::Filter { .. } => "Filter",
            PhysicalOp::Projection { .. } => "Projection",
            PhysicalOp::Alias { .. } => "Alias",
            PhysicalOp::HashJoin { .. } => "HashJoin",
            PhysicalOp::NestedLoopJoin { .. } => "NestedLoopJoin",
            PhysicalOp::IndexNestedLoopJoin { .. } => "IndexNestedLoopJoin",
            PhysicalOp::HashAggregate { .. } => "HashAggregate",
            PhysicalOp::SortAggregate { .. } => "SortAggregate",
            PhysicalOp::StaticAggregate { .. } => "StaticAggregate",
            PhysicalOp::Sort { .. } => "Sort",
            PhysicalOp::Limit { .. } => "Limit",
            PhysicalOp::Values { .. } => "Values",
            PhysicalOp::Insert { .. } => "Insert",
            PhysicalOp::InsertSelect { .. } => "InsertSelect",
            PhysicalOp::Update { .. } => "Update",
            PhysicalOp::Delete { .. } => "Delete",
            PhysicalOp::CteScan { .. } => "CteScan",
            PhysicalOp::CsvScan { .. } => "CsvScan",
            PhysicalOp::CreateTable { .. } => "CreateTable",
            PhysicalOp::CreateIndex { .. } => "CreateIndex",
            PhysicalOp::DropTable { .. } => "DropTable",
            PhysicalOp::DropIndex { .. } => "DropIndex",
        }
    }

    pub fn is_dml(&self) -> bool {
        matches!(
            self,
            PhysicalOp::Insert { .. }
                | PhysicalOp::InsertSelect { .. }
                | PhysicalOp::Update { .. }
                | PhysicalOp::Delete { .. }
        )
    }

    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            PhysicalOp::CreateTable { .. }
                | PhysicalOp::CreateIndex { .. }
                | PhysicalOp::DropTable { .. }
                | PhysicalOp::DropIndex { .. }
        )
    }
}

/// One output column of a plan node: the display name, the value type, and
/// the bound expression computing it in terms of the node's inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputColumn {
    pub name: String,
    pub type_id: SqlTypeId,
    pub expr: BoundExpr,
}

/// A physical plan tree node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub op: PhysicalOp,
    pub children: Vec<PlanNode>,
    pub output: Vec<OutputColumn>,
}

impl PlanNode {
    pub fn output_types(&self) -> Vec<SqlTypeId> {
        self.output.iter().map(|c| c.type_id).collect()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("physical plans are serializable")
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    /// Indented single-plan rendering for EXPLAIN.
    pub fn explain_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.explain_into(0, &mut lines);
        lines
    }

    fn explain_into(&self, indent: usize, lines: &mut Vec<String>) {
        let pad = "  ".repeat(indent);
        let detail = match &self.op {
            PhysicalOp::SeqScan { alias, predicates, .. } => {
                if predicates.is_empty() {
                    format!(" on {alias}")
                } else {
                    let preds: Vec<String> = predicates.iter().map(|p| p.display()).collect();
                    format!(" on {alias} filter={}", preds.join(" AND "))
                }
            }
            PhysicalOp::IndexScan { alias, index_oid, .. } => {
                format!(" on {alias} using index {index_oid}")
            }
            PhysicalOp::HashJoin { left_keys, right_keys, .. } => {
                let pairs: Vec<String> = left_keys
                    .iter()
                    .zip(right_keys)
                    .map(|(l, r)| format!("{} = {}", l.display(), r.display()))
                    .collect();
                format!(" on {}", pairs.join(" AND "))
            }
            PhysicalOp::Projection { exprs, .. } => {
                let cols: Vec<String> = exprs.iter().map(|e| e.display()).collect();
                format!(" [{}]", cols.join(", "))
            }
            PhysicalOp::Sort { sort_keys } | PhysicalOp::Limit { sort_keys, .. }
                if !sort_keys.is_empty() =>
            {
                let keys: Vec<String> = sort_keys
                    .iter()
                    .map(|k| {
                        format!(
                            "{}{}",
                            k.expr.display(),
                            if k.descending { " DESC" } else { "" }
                        )
                    })
                    .collect();
                format!(" by {}", keys.join(", "))
            }
            _ => String::new(),
        };
        lines.push(format!("{pad}{}{detail}", self.op.name()));
        for child in &self.children {
            child.explain_into(indent + 1, lines);
        }
    }
}

/// The optimizer's final artifact: the main plan plus one materialized plan
/// per CTE, in definition order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicalPlan {
    pub root: PlanNode,
    pub ctes: Vec<PlanNode>,
}

impl PhysicalPlan {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("physical plans are serializable")
    }

    pub fn from_json(value: &serde_json::Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }

    pub fn explain_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (i, cte) in self.ctes.iter().enumerate() {
            lines.push(format!("CTE {i}:"));
            lines.extend(cte.explain_lines().into_iter().map(|l| format!("  {l}")));
        }
        lines.extend(self.root.explain_lines());
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_json_round_trip() {
        let node = PlanNode {
            op: PhysicalOp::Limit {
                limit: 10,
                offset: 0,
                sort_keys: vec![],
            },
            children: vec![PlanNode {
                op: PhysicalOp::SeqScan {
                    db_oid: DatabaseOid(1),
                    table_oid: TableOid(9),
                    alias: "t".into(),
                    predicates: vec![],
                },
                children: vec![],
                output: vec![],
            }],
            output: vec![],
        };
        let json = node.to_json();
        assert_eq!(json["op"]["plan_node_type"], "Limit");
        let back = PlanNode::from_json(&json).unwrap();
        assert_eq!(back, node);
    }
}
