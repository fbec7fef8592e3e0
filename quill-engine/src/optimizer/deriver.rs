//! Child-property derivation: for each physical operator, the ways it can
//! satisfy its parent's requirements, as `(provided, [child required])`
//! pairs.

use quill_catalog::CatalogAccessor;

use crate::binder::expr::BoundExpr;
use crate::optimizer::memo::{GroupId, Memo};
use crate::optimizer::property::PropertySet;
use crate::plan::{PhysicalOp, SortKey};

pub fn derive_properties(
    op: &PhysicalOp,
    required: &PropertySet,
    children: &[GroupId],
    memo: &Memo,
    accessor: &CatalogAccessor,
) -> Vec<(PropertySet, Vec<PropertySet>)> {
    match op {
        // A heap scan provides nothing.
        PhysicalOp::SeqScan { .. } => vec![(PropertySet::empty(), Vec::new())],

        PhysicalOp::IndexScan {
            table_oid,
            index_oid,
            ..
        } => {
            let mut alternatives = vec![(PropertySet::empty(), Vec::new())];
            if !required.is_empty()
                && index_provides_sort(accessor, *table_oid, *index_oid, &required.sort_keys)
            {
                alternatives.push((required.clone(), Vec::new()));
            }
            alternatives
        }

        // Order-preserving unary operators forward the requirement when the
        // sort keys remain resolvable below them.
        PhysicalOp::Filter { .. } | PhysicalOp::Projection { .. } | PhysicalOp::Alias { .. } => {
            let mut alternatives = vec![(PropertySet::empty(), vec![PropertySet::empty()])];
            if !required.is_empty() && sort_keys_pass_through(&required.sort_keys) {
                alternatives.push((required.clone(), vec![required.clone()]));
            }
            alternatives
        }

        PhysicalOp::HashAggregate { .. } => {
            vec![(PropertySet::empty(), vec![PropertySet::empty()])]
        }

        // Streaming aggregation requires its input sorted ascending on the
        // group-by columns and emits groups in that order.
        PhysicalOp::SortAggregate { group_by, .. } => {
            let child_sort = PropertySet::with_sort(
                group_by
                    .iter()
                    .map(|expr| SortKey {
                        expr: expr.clone(),
                        descending: false,
                    })
                    .collect(),
            );
            vec![(child_sort.clone(), vec![child_sort])]
        }

        PhysicalOp::StaticAggregate { .. } => {
            vec![(PropertySet::empty(), vec![PropertySet::empty()])]
        }

        // Top-K pushes its sort into the child; a plain limit forwards the
        // parent requirement unchanged.
        PhysicalOp::Limit { sort_keys, .. } => {
            if sort_keys.is_empty() {
                vec![(required.clone(), vec![required.clone()])]
            } else {
                let sort = PropertySet::with_sort(sort_keys.clone());
                vec![(sort.clone(), vec![sort])]
            }
        }

        // The probe side of a hash join may stream a sort through when
        // every sort column binds to probe-side aliases only.
        PhysicalOp::HashJoin { .. } => {
            let mut alternatives = vec![(
                PropertySet::empty(),
                vec![PropertySet::empty(), PropertySet::empty()],
            )];
            if !required.is_empty() && children.len() == 2 {
                let probe_aliases = memo.aliases(children[1]);
                if sort_keys_within(&required.sort_keys, &probe_aliases) {
                    alternatives.push((
                        required.clone(),
                        vec![PropertySet::empty(), required.clone()],
                    ));
                }
            }
            alternatives
        }

        // The outer side of a nested-loop join drives emission order.
        PhysicalOp::NestedLoopJoin { .. } => {
            let mut alternatives = vec![(
                PropertySet::empty(),
                vec![PropertySet::empty(), PropertySet::empty()],
            )];
            if !required.is_empty() && children.len() == 2 {
                let outer_aliases = memo.aliases(children[0]);
                if sort_keys_within(&required.sort_keys, &outer_aliases) {
                    alternatives.push((
                        required.clone(),
                        vec![required.clone(), PropertySet::empty()],
                    ));
                }
            }
            alternatives
        }

        PhysicalOp::IndexNestedLoopJoin { .. } => {
            vec![(PropertySet::empty(), vec![PropertySet::empty()])]
        }

        PhysicalOp::Sort { sort_keys } => {
            vec![(
                PropertySet::with_sort(sort_keys.clone()),
                vec![PropertySet::empty()],
            )]
        }

        PhysicalOp::Values { .. } | PhysicalOp::CteScan { .. } | PhysicalOp::CsvScan { .. } => {
            vec![(PropertySet::empty(), Vec::new())]
        }

        // DML and DDL forward requirements unchanged to their inputs.
        op if op.is_dml() || op.is_ddl() => {
            vec![(required.clone(), vec![required.clone(); children.len()])]
        }

        _ => vec![(PropertySet::empty(), vec![PropertySet::empty(); children.len()])],
    }
}

/// True when the required sort keys are a prefix of the index key columns,
/// same columns and directions, verified against the catalog's index schema.
pub fn index_provides_sort(
    accessor: &CatalogAccessor,
    table_oid: quill_catalog::TableOid,
    index_oid: quill_catalog::IndexOid,
    sort_keys: &[SortKey],
) -> bool {
    let Some(index_schema) = accessor.get_index_schema(index_oid) else {
        return false;
    };
    if sort_keys.len() > index_schema.columns().len() {
        return false;
    }
    sort_keys
        .iter()
        .zip(index_schema.columns())
        .all(|(sort, index_col)| match &sort.expr {
            BoundExpr::ColumnValue(column) => {
                column.table_oid == table_oid
                    && column.column_oid == index_col.column_oid
                    && sort.descending == index_col.descending
            }
            _ => false,
        })
}

fn sort_keys_pass_through(sort_keys: &[SortKey]) -> bool {
    sort_keys.iter().all(|k| {
        matches!(
            k.expr,
            BoundExpr::ColumnValue(_) | BoundExpr::Aggregate(_)
        )
    })
}

fn sort_keys_within(sort_keys: &[SortKey], aliases: &std::collections::HashSet<String>) -> bool {
    sort_keys.iter().all(|key| {
        let mut columns = Vec::new();
        key.expr.collect_columns(&mut columns);
        !columns.is_empty() && Memo::columns_within(&columns, aliases)
    })
}
