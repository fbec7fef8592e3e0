//! Plan layer: logical and physical operator sum types plus the transformer
//! that lowers bound statements into logical operator trees. ORDER BY is not
//! an operator; it becomes the required sort property handed to the
//! optimizer alongside the tree.

pub mod logical;
pub mod physical;

use quill_storage::SqlTypeId;

use crate::binder::expr::BoundExpr;
use crate::binder::statement::{
    BoundSelect, BoundStatement, BoundTableRef, InsertSource, JoinKind,
};
use crate::error::QueryError;

pub use logical::{LogicalOp, LogicalPlan, SortKey};
pub use physical::{OutputColumn, PhysicalOp, PhysicalPlan, PlanNode};

/// Transformer output: the main tree, the root's required sort, the CTE
/// trees, and how many leading output columns are user-visible (hidden sort
/// columns may follow them).
#[derive(Debug, Clone)]
pub struct TransformResult {
    pub plan: LogicalPlan,
    pub required_sort: Vec<SortKey>,
    pub ctes: Vec<LogicalPlan>,
    pub visible_columns: usize,
}

/// Lower a bound statement into a logical operator tree.
pub fn transform(statement: &BoundStatement) -> Result<TransformResult, QueryError> {
    match statement {
        BoundStatement::Select(select) => transform_select_root(select),
        BoundStatement::Insert(insert) => {
            let (plan, ctes) = match &insert.source {
                InsertSource::Values(rows) => (
                    LogicalPlan::leaf(LogicalOp::Insert {
                        db_oid: insert.table.db_oid,
                        table_oid: insert.table.table_oid,
                        column_indexes: insert.column_indexes.clone(),
                        rows: rows.clone(),
                    }),
                    Vec::new(),
                ),
                InsertSource::Select(select) => {
                    let inner = transform_select_root(select)?;
                    (
                        LogicalPlan::unary(
                            LogicalOp::InsertSelect {
                                db_oid: insert.table.db_oid,
                                table_oid: insert.table.table_oid,
                                column_indexes: insert.column_indexes.clone(),
                            },
                            inner.plan,
                        ),
                        inner.ctes,
                    )
                }
            };
            Ok(TransformResult {
                plan,
                required_sort: Vec::new(),
                ctes,
                visible_columns: 0,
            })
        }
        BoundStatement::Update(update) => {
            let mut child = LogicalPlan::leaf(LogicalOp::Get {
                db_oid: update.table.db_oid,
                table_oid: update.table.table_oid,
                alias: update.table.alias.clone(),
                predicates: Vec::new(),
            });
            if let Some(predicate) = &update.predicate {
                child = LogicalPlan::unary(
                    LogicalOp::Filter {
                        predicates: predicate.clone().split_conjunction(),
                    },
                    child,
                );
            }
            Ok(TransformResult {
                plan: LogicalPlan::unary(
                    LogicalOp::Update {
                        db_oid: update.table.db_oid,
                        table_oid: update.table.table_oid,
                        assignments: update.assignments.clone(),
                    },
                    child,
                ),
                required_sort: Vec::new(),
                ctes: Vec::new(),
                visible_columns: 0,
            })
        }
        BoundStatement::Delete(delete) => {
            let mut child = LogicalPlan::leaf(LogicalOp::Get {
                db_oid: delete.table.db_oid,
                table_oid: delete.table.table_oid,
                alias: delete.table.alias.clone(),
                predicates: Vec::new(),
            });
            if let Some(predicate) = &delete.predicate {
                child = LogicalPlan::unary(
                    LogicalOp::Filter {
                        predicates: predicate.clone().split_conjunction(),
                    },
                    child,
                );
            }
            Ok(TransformResult {
                plan: LogicalPlan::unary(
                    LogicalOp::Delete {
                        db_oid: delete.table.db_oid,
                        table_oid: delete.table.table_oid,
                    },
                    child,
                ),
                required_sort: Vec::new(),
                ctes: Vec::new(),
                visible_columns: 0,
            })
        }
        BoundStatement::Copy(copy) => {
            let columns: Vec<(String, SqlTypeId)> = copy
                .table
                .schema
                .columns()
                .iter()
                .map(|c| (c.name().to_string(), c.type_id()))
                .collect();
            let scan = LogicalPlan::leaf(LogicalOp::CsvScan {
                path: copy.path.clone(),
                columns,
            });
            Ok(TransformResult {
                plan: LogicalPlan::unary(
                    LogicalOp::InsertSelect {
                        db_oid: copy.table.db_oid,
                        table_oid: copy.table.table_oid,
                        column_indexes: (0..copy.table.schema.columns().len()).collect(),
                    },
                    scan,
                ),
                required_sort: Vec::new(),
                ctes: Vec::new(),
                visible_columns: 0,
            })
        }
        BoundStatement::CreateTable(create) => Ok(ddl_result(LogicalOp::CreateTable {
            namespace: create.namespace,
            name: create.name.clone(),
            columns: create.columns.clone(),
            if_not_exists: create.if_not_exists,
        })),
        BoundStatement::CreateIndex(create) => Ok(ddl_result(LogicalOp::CreateIndex {
            namespace: create.namespace,
            name: create.name.clone(),
            table_oid: create.table_oid,
            key_columns: create.key_columns.clone(),
            unique: create.unique,
            if_not_exists: create.if_not_exists,
        })),
        BoundStatement::DropTable(drop) => Ok(ddl_result(LogicalOp::DropTable {
            table_oid: drop.table_oid,
            name: drop.name.clone(),
            if_exists: drop.if_exists,
        })),
        BoundStatement::DropIndex(drop) => Ok(ddl_result(LogicalOp::DropIndex {
            index_oid: drop.index_oid,
            name: drop.name.clone(),
            if_exists: drop.if_exists,
        })),
        BoundStatement::Explain(inner) => transform(inner),
    }
}

fn ddl_result(op: LogicalOp) -> TransformResult {
    TransformResult {
        plan: LogicalPlan::leaf(op),
        required_sort: Vec::new(),
        ctes: Vec::new(),
        visible_columns: 0,
    }
}

fn transform_select_root(select: &BoundSelect) -> Result<TransformResult, QueryError> {
    let mut ctes = Vec::with_capacity(select.ctes.len());
    for cte in &select.ctes {
        ctes.push(transform_select(&cte.select)?);
    }

    let visible = select.select_list.len();
    let (plan, required_sort) = transform_select_with_order(select)?;
    Ok(TransformResult {
        plan,
        required_sort,
        ctes,
        visible_columns: visible,
    })
}

/// Lower one SELECT block. The returned plan ends in a projection whose
/// outputs are the select list plus hidden columns for ORDER BY expressions
/// that are not in the select list.
fn transform_select(select: &BoundSelect) -> Result<LogicalPlan, QueryError> {
    Ok(transform_select_with_order(select)?.0)
}

fn transform_select_with_order(
    select: &BoundSelect,
) -> Result<(LogicalPlan, Vec<SortKey>), QueryError> {
    let mut plan = match &select.table {
        Some(table) => transform_table_ref(table)?,
        None => LogicalPlan::leaf(LogicalOp::Values {
            rows: vec![Vec::new()],
            types: Vec::new(),
        }),
    };

    if let Some(predicate) = &select.predicate {
        plan = LogicalPlan::unary(
            LogicalOp::Filter {
                predicates: predicate.clone().split_conjunction(),
            },
            plan,
        );
    }

    // Projection outputs: the select list plus hidden ORDER BY columns.
    let mut exprs = select.select_list.clone();
    let mut names = select.output_names.clone();
    let mut sort_keys = Vec::with_capacity(select.order_by.len());
    for order in &select.order_by {
        if !exprs.iter().any(|e| e == &order.expr) {
            names.push(format!("__sort_{}", exprs.len()));
            exprs.push(order.expr.clone());
        }
        sort_keys.push(SortKey {
            expr: order.expr.clone(),
            descending: order.descending,
        });
    }

    if select.is_aggregate() {
        let mut aggregates = Vec::new();
        let mut sources: Vec<&BoundExpr> = exprs.iter().collect();
        if let Some(having) = &select.having {
            sources.push(having);
        }
        for expr in sources {
            collect_aggregates(expr, &mut aggregates);
        }
        plan = LogicalPlan::unary(
            LogicalOp::Aggregate {
                group_by: select.group_by.clone(),
                aggregates,
                having: select.having.clone(),
            },
            plan,
        );
    }

    plan = LogicalPlan::unary(
        LogicalOp::Projection {
            exprs: exprs.clone(),
            names: names.clone(),
        },
        plan,
    );

    if select.distinct {
        // DISTINCT is a group-by over the projection's own outputs; the
        // keys re-resolve against the projection by structural match.
        plan = LogicalPlan::unary(
            LogicalOp::Aggregate {
                group_by: exprs.clone(),
                aggregates: Vec::new(),
                having: None,
            },
            plan,
        );
    }

    if select.limit.is_some() || select.offset > 0 {
        plan = LogicalPlan::unary(
            LogicalOp::Limit {
                limit: select.limit.unwrap_or(u64::MAX),
                offset: select.offset,
                sort_keys: sort_keys.clone(),
            },
            plan,
        );
    }

    Ok((plan, sort_keys))
}

fn transform_table_ref(table: &BoundTableRef) -> Result<LogicalPlan, QueryError> {
    match table {
        BoundTableRef::Base(base) => Ok(LogicalPlan::leaf(LogicalOp::Get {
            db_oid: base.db_oid,
            table_oid: base.table_oid,
            alias: base.alias.clone(),
            predicates: Vec::new(),
        })),
        BoundTableRef::Join {
            kind,
            left,
            right,
            condition,
        } => {
            let left_plan = transform_table_ref(left)?;
            let right_plan = transform_table_ref(right)?;
            let condition = condition.clone();
            Ok(match kind {
                JoinKind::Inner | JoinKind::Cross => LogicalPlan::binary(
                    LogicalOp::InnerJoin { condition },
                    left_plan,
                    right_plan,
                ),
                JoinKind::Left => LogicalPlan::binary(
                    LogicalOp::LeftJoin { condition },
                    left_plan,
                    right_plan,
                ),
                // A right join is a left join with the inputs swapped.
                JoinKind::Right => LogicalPlan::binary(
                    LogicalOp::LeftJoin { condition },
                    right_plan,
                    left_plan,
                ),
                JoinKind::Full => LogicalPlan::binary(
                    LogicalOp::OuterJoin { condition },
                    left_plan,
                    right_plan,
                ),
            })
        }
        BoundTableRef::Subquery {
            select,
            alias,
            columns,
        } => {
            let inner = transform_select(select)?;
            Ok(LogicalPlan::unary(
                LogicalOp::Alias {
                    alias: alias.clone(),
                    names: columns.iter().map(|(n, _)| n.clone()).collect(),
                },
                inner,
            ))
        }
        BoundTableRef::CteReference {
            cte_index,
            alias,
            columns,
        } => Ok(LogicalPlan::leaf(LogicalOp::CteScan {
            cte_index: *cte_index,
            alias: alias.clone(),
            columns: columns.clone(),
        })),
    }
}

fn collect_aggregates(expr: &BoundExpr, out: &mut Vec<BoundExpr>) {
    match expr {
        BoundExpr::Aggregate(_) => {
            if !out.iter().any(|e| e == expr) {
                out.push(expr.clone());
            }
        }
        BoundExpr::Comparison { left, right, .. } => {
            collect_aggregates(left, out);
            collect_aggregates(right, out);
        }
        BoundExpr::Arithmetic { left, right, .. } => {
            collect_aggregates(left, out);
            collect_aggregates(right, out);
        }
        BoundExpr::Conjunction { children, .. } => {
            for child in children {
                collect_aggregates(child, out);
            }
        }
        BoundExpr::Unary { child, .. } | BoundExpr::NullCheck { child, .. } => {
            collect_aggregates(child, out)
        }
        BoundExpr::Function(f) => {
            for arg in &f.args {
                collect_aggregates(arg, out);
            }
        }
        _ => {}
    }
}
