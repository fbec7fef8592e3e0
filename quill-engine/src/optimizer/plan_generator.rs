//! Lowest-cost plan extraction from the memo, with bottom-up output-column
//! derivation.

use quill_catalog::CatalogAccessor;

use crate::binder::expr::{BoundExpr, ColumnValueExpr};
use crate::optimizer::memo::{GroupId, Memo};
use crate::optimizer::property::PropertySet;
use crate::plan::{OutputColumn, PhysicalOp, PlanNode};

pub fn build_plan(
    memo: &Memo,
    group: GroupId,
    required: &PropertySet,
    accessor: &CatalogAccessor,
) -> Option<PlanNode> {
    let entry = memo.group(group).best_for(required)?.clone();
    if let Some(sort_keys) = entry.enforcer_sort {
        let child = build_plan(memo, group, &PropertySet::empty(), accessor)?;
        let output = child.output.clone();
        return Some(PlanNode {
            op: PhysicalOp::Sort { sort_keys },
            children: vec![child],
            output,
        });
    }

    let expr = memo.expr(entry.expr?);
    let mut children = Vec::with_capacity(expr.children.len());
    for (child_group, child_props) in expr.children.iter().zip(&entry.child_properties) {
        children.push(build_plan(memo, *child_group, child_props, accessor)?);
    }
    let op = expr.op.physical()?.clone();
    let output = derive_output(&op, &children, accessor);
    Some(PlanNode {
        op,
        children,
        output,
    })
}

/// Output columns of one operator given its children's outputs.
pub fn derive_output(
    op: &PhysicalOp,
    children: &[PlanNode],
    accessor: &CatalogAccessor,
) -> Vec<OutputColumn> {
    match op {
        PhysicalOp::SeqScan {
            db_oid,
            table_oid,
            alias,
            ..
        }
        | PhysicalOp::IndexScan {
            db_oid,
            table_oid,
            alias,
            ..
        } => table_output(accessor, *db_oid, *table_oid, alias),

        PhysicalOp::Filter { .. } | PhysicalOp::Limit { .. } | PhysicalOp::Sort { .. } => {
            children.first().map(|c| c.output.clone()).unwrap_or_default()
        }

        PhysicalOp::Projection { exprs, names } => exprs
            .iter()
            .zip(names)
            .map(|(expr, name)| OutputColumn {
                name: name.clone(),
                type_id: expr.type_id(),
                expr: expr.clone(),
            })
            .collect(),

        PhysicalOp::Alias { alias, names } => children
            .first()
            .map(|child| {
                child
                    .output
                    .iter()
                    .zip(names)
                    .map(|(column, name)| OutputColumn {
                        name: name.clone(),
                        type_id: column.type_id,
                        expr: BoundExpr::ColumnValue(ColumnValueExpr {
                            db_oid: quill_catalog::DatabaseOid::INVALID,
                            table_oid: quill_catalog::TableOid::INVALID,
                            column_oid: quill_catalog::ColumnOid::INVALID,
                            type_id: column.type_id,
                            depth: 0,
                            table_alias: alias.clone(),
                            column_name: name.clone(),
                        }),
                    })
                    .collect()
            })
            .unwrap_or_default(),

        PhysicalOp::HashJoin { .. } | PhysicalOp::NestedLoopJoin { .. } => {
            let mut output = children
                .first()
                .map(|c| c.output.clone())
                .unwrap_or_default();
            if let Some(right) = children.get(1) {
                output.extend(right.output.clone());
            }
            output
        }

        PhysicalOp::IndexNestedLoopJoin {
            db_oid,
            table_oid,
            alias,
            ..
        } => {
            let mut output = children
                .first()
                .map(|c| c.output.clone())
                .unwrap_or_default();
            output.extend(table_output(accessor, *db_oid, *table_oid, alias));
            output
        }

        PhysicalOp::HashAggregate {
            group_by,
            aggregates,
            ..
        }
        | PhysicalOp::SortAggregate {
            group_by,
            aggregates,
            ..
        } => group_by
            .iter()
            .chain(aggregates)
            .map(|expr| OutputColumn {
                name: expr.display(),
                type_id: expr.type_id(),
                expr: expr.clone(),
            })
            .collect(),

        PhysicalOp::StaticAggregate { aggregates, .. } => aggregates
            .iter()
            .map(|expr| OutputColumn {
                name: expr.display(),
                type_id: expr.type_id(),
                expr: expr.clone(),
            })
            .collect(),

        PhysicalOp::Values { types, .. } => types
            .iter()
            .enumerate()
            .map(|(i, type_id)| OutputColumn {
                name: format!("column{}", i + 1),
                type_id: *type_id,
                expr: BoundExpr::Derived {
                    index: i,
                    type_id: *type_id,
                },
            })
            .collect(),

        PhysicalOp::CteScan { alias, columns, .. } => virtual_output(alias, columns),
        PhysicalOp::CsvScan { columns, .. } => virtual_output("csv", columns),

        _ => Vec::new(),
    }
}

fn table_output(
    accessor: &CatalogAccessor,
    db_oid: quill_catalog::DatabaseOid,
    table_oid: quill_catalog::TableOid,
    alias: &str,
) -> Vec<OutputColumn> {
    let Some(schema) = accessor.get_schema(table_oid) else {
        return Vec::new();
    };
    schema
        .columns()
        .iter()
        .map(|column| OutputColumn {
            name: column.name().to_string(),
            type_id: column.type_id(),
            expr: BoundExpr::ColumnValue(ColumnValueExpr {
                db_oid,
                table_oid,
                column_oid: column.oid(),
                type_id: column.type_id(),
                depth: 0,
                table_alias: alias.to_string(),
                column_name: column.name().to_string(),
            }),
        })
        .collect()
}

fn virtual_output(alias: &str, columns: &[(String, quill_storage::SqlTypeId)]) -> Vec<OutputColumn> {
    columns
        .iter()
        .map(|(name, type_id)| OutputColumn {
            name: name.clone(),
            type_id: *type_id,
            expr: BoundExpr::ColumnValue(ColumnValueExpr {
                db_oid: quill_catalog::DatabaseOid::INVALID,
                table_oid: quill_catalog::TableOid::INVALID,
                column_oid: quill_catalog::ColumnOid::INVALID,
                type_id: *type_id,
                depth: 0,
                table_alias: alias.to_string(),
                column_name: name.clone(),
            }),
        })
        .collect()
}
