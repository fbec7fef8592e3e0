//! Rewrite and implementation rules. Transformation rules produce new
//! logical expressions in the same group (subquery-join unnesting, predicate
//! pushdown); implementation rules produce the physical operators.

use quill_catalog::CatalogAccessor;

use crate::binder::expr::{BoundExpr, ColumnValueExpr, ComparisonOp};
use crate::optimizer::memo::{GroupId, Memo, Operator};
use crate::plan::{LogicalOp, PhysicalOp};

pub trait Rule: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_transformation(&self) -> bool;
    fn matches(&self, op: &Operator, children: &[GroupId], memo: &Memo) -> bool;
    fn apply(
        &self,
        op: &Operator,
        children: &[GroupId],
        memo: &Memo,
        accessor: &CatalogAccessor,
    ) -> Vec<(Operator, Vec<GroupId>)>;
}

pub fn default_rules() -> Vec<Box<dyn Rule>> {
    vec![
        Box::new(PushFilterIntoGet),
        Box::new(UnnestSubqueryJoin),
        Box::new(ImplementScan),
        Box::new(ImplementIndexScan),
        Box::new(ImplementHashJoin),
        Box::new(ImplementNestedLoopJoin),
        Box::new(ImplementIndexJoin),
        Box::new(ImplementAggregate),
        Box::new(ImplementTrivial),
    ]
}

/// Filter over a bare Get folds its predicates into the scan.
struct PushFilterIntoGet;

impl Rule for PushFilterIntoGet {
    fn name(&self) -> &'static str {
        "PushFilterIntoGet"
    }

    fn is_transformation(&self) -> bool {
        true
    }

    fn matches(&self, op: &Operator, children: &[GroupId], memo: &Memo) -> bool {
        matches!(op.logical(), Some(LogicalOp::Filter { .. }))
            && children.len() == 1
            && matches!(memo.leader(children[0]), Some(LogicalOp::Get { .. }))
    }

    fn apply(
        &self,
        op: &Operator,
        children: &[GroupId],
        memo: &Memo,
        _accessor: &CatalogAccessor,
    ) -> Vec<(Operator, Vec<GroupId>)> {
        let Some(LogicalOp::Filter { predicates }) = op.logical() else {
            return Vec::new();
        };
        let Some(LogicalOp::Get {
            db_oid,
            table_oid,
            alias,
            predicates: existing,
        }) = memo.leader(children[0])
        else {
            return Vec::new();
        };
        let mut merged = existing.clone();
        merged.extend(predicates.clone());
        vec![(
            Operator::Logical(LogicalOp::Get {
                db_oid: *db_oid,
                table_oid: *table_oid,
                alias: alias.clone(),
                predicates: merged,
            }),
            Vec::new(),
        )]
    }
}

/// Mark-, single- and dependent-joins rewrite to standard inner joins.
struct UnnestSubqueryJoin;

impl Rule for UnnestSubqueryJoin {
    fn name(&self) -> &'static str {
        "UnnestSubqueryJoin"
    }

    fn is_transformation(&self) -> bool {
        true
    }

    fn matches(&self, op: &Operator, _children: &[GroupId], _memo: &Memo) -> bool {
        matches!(
            op.logical(),
            Some(LogicalOp::MarkJoin { .. })
                | Some(LogicalOp::SingleJoin { .. })
                | Some(LogicalOp::DependentJoin { .. })
        )
    }

    fn apply(
        &self,
        op: &Operator,
        children: &[GroupId],
        _memo: &Memo,
        _accessor: &CatalogAccessor,
    ) -> Vec<(Operator, Vec<GroupId>)> {
        let condition = match op.logical() {
            Some(LogicalOp::MarkJoin { condition })
            | Some(LogicalOp::SingleJoin { condition })
            | Some(LogicalOp::DependentJoin { condition }) => condition.clone(),
            _ => return Vec::new(),
        };
        vec![(
            Operator::Logical(LogicalOp::InnerJoin { condition }),
            children.to_vec(),
        )]
    }
}

struct ImplementScan;

impl Rule for ImplementScan {
    fn name(&self) -> &'static str {
        "GetToSeqScan"
    }

    fn is_transformation(&self) -> bool {
        false
    }

    fn matches(&self, op: &Operator, _children: &[GroupId], _memo: &Memo) -> bool {
        matches!(op.logical(), Some(LogicalOp::Get { .. }))
    }

    fn apply(
        &self,
        op: &Operator,
        _children: &[GroupId],
        _memo: &Memo,
        _accessor: &CatalogAccessor,
    ) -> Vec<(Operator, Vec<GroupId>)> {
        let Some(LogicalOp::Get {
            db_oid,
            table_oid,
            alias,
            predicates,
        }) = op.logical()
        else {
            return Vec::new();
        };
        vec![(
            Operator::Physical(PhysicalOp::SeqScan {
                db_oid: *db_oid,
                table_oid: *table_oid,
                alias: alias.clone(),
                predicates: predicates.clone(),
            }),
            Vec::new(),
        )]
    }
}

struct ImplementIndexScan;

impl Rule for ImplementIndexScan {
    fn name(&self) -> &'static str {
        "GetToIndexScan"
    }

    fn is_transformation(&self) -> bool {
        false
    }

    fn matches(&self, op: &Operator, _children: &[GroupId], _memo: &Memo) -> bool {
        matches!(op.logical(), Some(LogicalOp::Get { .. }))
    }

    fn apply(
        &self,
        op: &Operator,
        _children: &[GroupId],
        _memo: &Memo,
        accessor: &CatalogAccessor,
    ) -> Vec<(Operator, Vec<GroupId>)> {
        let Some(LogicalOp::Get {
            db_oid,
            table_oid,
            alias,
            predicates,
        }) = op.logical()
        else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for index_oid in accessor.get_index_oids(*table_oid) {
            let Some(index_schema) = accessor.get_index_schema(index_oid) else {
                continue;
            };
            let first_key = match index_schema.columns().first() {
                Some(col) => col.column_oid,
                None => continue,
            };
            // Useful either as a key-range scan or as a pure order provider.
            let keyed = predicates
                .iter()
                .any(|p| predicate_keys_column(p, first_key));
            if keyed || predicates.is_empty() {
                out.push((
                    Operator::Physical(PhysicalOp::IndexScan {
                        db_oid: *db_oid,
                        table_oid: *table_oid,
                        index_oid,
                        alias: alias.clone(),
                        predicates: predicates.clone(),
                        descending: false,
                    }),
                    Vec::new(),
                ));
            }
        }
        out
    }
}

fn predicate_keys_column(predicate: &BoundExpr, column_oid: quill_catalog::ColumnOid) -> bool {
    match predicate {
        BoundExpr::Comparison { left, right, .. } => {
            let keyed = |side: &BoundExpr, other: &BoundExpr| {
                matches!(side, BoundExpr::ColumnValue(c) if c.column_oid == column_oid)
                    && matches!(
                        other,
                        BoundExpr::Constant { .. } | BoundExpr::Parameter { .. }
                    )
            };
            keyed(left, right) || keyed(right, left)
        }
        _ => false,
    }
}

/// Split an inner/left join condition into equi-key pairs and a residual.
fn extract_join_keys(
    condition: &Option<BoundExpr>,
    left_aliases: &std::collections::HashSet<String>,
    right_aliases: &std::collections::HashSet<String>,
) -> Option<(Vec<BoundExpr>, Vec<BoundExpr>, Option<BoundExpr>)> {
    let condition = condition.as_ref()?;
    let mut left_keys = Vec::new();
    let mut right_keys = Vec::new();
    let mut residual = Vec::new();
    for term in condition.clone().split_conjunction() {
        let mut matched = false;
        if let BoundExpr::Comparison {
            op: ComparisonOp::Eq,
            left,
            right,
        } = &term
        {
            let side_of = |expr: &BoundExpr| -> Option<bool> {
                let mut columns: Vec<&ColumnValueExpr> = Vec::new();
                expr.collect_columns(&mut columns);
                if columns.is_empty() {
                    return None;
                }
                if Memo::columns_within(&columns, left_aliases) {
                    Some(true)
                } else if Memo::columns_within(&columns, right_aliases) {
                    Some(false)
                } else {
                    None
                }
            };
            match (side_of(left), side_of(right)) {
                (Some(true), Some(false)) => {
                    left_keys.push((**left).clone());
                    right_keys.push((**right).clone());
                    matched = true;
                }
                (Some(false), Some(true)) => {
                    left_keys.push((**right).clone());
                    right_keys.push((**left).clone());
                    matched = true;
                }
                _ => {}
            }
        }
        if !matched {
            residual.push(term);
        }
    }
    if left_keys.is_empty() {
        None
    } else {
        Some((left_keys, right_keys, BoundExpr::conjoin(residual)))
    }
}

struct ImplementHashJoin;

impl Rule for ImplementHashJoin {
    fn name(&self) -> &'static str {
        "JoinToHashJoin"
    }

    fn is_transformation(&self) -> bool {
        false
    }

    fn matches(&self, op: &Operator, children: &[GroupId], _memo: &Memo) -> bool {
        children.len() == 2
            && matches!(
                op.logical(),
                Some(LogicalOp::InnerJoin { .. }) | Some(LogicalOp::LeftJoin { .. })
            )
    }

    fn apply(
        &self,
        op: &Operator,
        children: &[GroupId],
        memo: &Memo,
        _accessor: &CatalogAccessor,
    ) -> Vec<(Operator, Vec<GroupId>)> {
        let (kind, condition) = match op.logical() {
            Some(LogicalOp::InnerJoin { condition }) => {
                (crate::binder::statement::JoinKind::Inner, condition)
            }
            Some(LogicalOp::LeftJoin { condition }) => {
                (crate::binder::statement::JoinKind::Left, condition)
            }
            _ => return Vec::new(),
        };
        let left_aliases = memo.aliases(children[0]);
        let right_aliases = memo.aliases(children[1]);
        match extract_join_keys(condition, &left_aliases, &right_aliases) {
            Some((left_keys, right_keys, residual)) => vec![(
                Operator::Physical(PhysicalOp::HashJoin {
                    kind,
                    left_keys,
                    right_keys,
                    residual,
                }),
                children.to_vec(),
            )],
            None => Vec::new(),
        }
    }
}

struct ImplementNestedLoopJoin;

impl Rule for ImplementNestedLoopJoin {
    fn name(&self) -> &'static str {
        "JoinToNestedLoop"
    }

    fn is_transformation(&self) -> bool {
        false
    }

    fn matches(&self, op: &Operator, children: &[GroupId], _memo: &Memo) -> bool {
        children.len() == 2
            && matches!(
                op.logical(),
                Some(LogicalOp::InnerJoin { .. })
                    | Some(LogicalOp::LeftJoin { .. })
                    | Some(LogicalOp::OuterJoin { .. })
            )
    }

    fn apply(
        &self,
        op: &Operator,
        children: &[GroupId],
        _memo: &Memo,
        _accessor: &CatalogAccessor,
    ) -> Vec<(Operator, Vec<GroupId>)> {
        let (kind, condition) = match op.logical() {
            Some(LogicalOp::InnerJoin { condition }) => {
                (crate::binder::statement::JoinKind::Inner, condition.clone())
            }
            Some(LogicalOp::LeftJoin { condition }) => {
                (crate::binder::statement::JoinKind::Left, condition.clone())
            }
            Some(LogicalOp::OuterJoin { condition }) => {
                (crate::binder::statement::JoinKind::Full, condition.clone())
            }
            _ => return Vec::new(),
        };
        vec![(
            Operator::Physical(PhysicalOp::NestedLoopJoin { kind, condition }),
            children.to_vec(),
        )]
    }
}

/// Inner join against a bare Get whose index prefix matches the join key
/// becomes an index nested-loop join over the outer side only.
struct ImplementIndexJoin;

impl Rule for ImplementIndexJoin {
    fn name(&self) -> &'static str {
        "JoinToIndexJoin"
    }

    fn is_transformation(&self) -> bool {
        false
    }

    fn matches(&self, op: &Operator, children: &[GroupId], memo: &Memo) -> bool {
        children.len() == 2
            && matches!(op.logical(), Some(LogicalOp::InnerJoin { .. }))
            && matches!(
                memo.leader(children[1]),
                Some(LogicalOp::Get { predicates, .. }) if predicates.is_empty()
            )
    }

    fn apply(
        &self,
        op: &Operator,
        children: &[GroupId],
        memo: &Memo,
        accessor: &CatalogAccessor,
    ) -> Vec<(Operator, Vec<GroupId>)> {
        let Some(LogicalOp::InnerJoin { condition }) = op.logical() else {
            return Vec::new();
        };
        let Some(LogicalOp::Get {
            db_oid,
            table_oid,
            alias,
            ..
        }) = memo.leader(children[1])
        else {
            return Vec::new();
        };
        let left_aliases = memo.aliases(children[0]);
        let right_aliases = memo.aliases(children[1]);
        let Some((left_keys, right_keys, residual)) =
            extract_join_keys(condition, &left_aliases, &right_aliases)
        else {
            return Vec::new();
        };
        if residual.is_some() || left_keys.len() != 1 {
            return Vec::new();
        }
        let BoundExpr::ColumnValue(inner_column) = &right_keys[0] else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for index_oid in accessor.get_index_oids(*table_oid) {
            let Some(index_schema) = accessor.get_index_schema(index_oid) else {
                continue;
            };
            let prefix_matches = index_schema
                .columns()
                .first()
                .map(|c| c.column_oid == inner_column.column_oid)
                .unwrap_or(false);
            if prefix_matches {
                out.push((
                    Operator::Physical(PhysicalOp::IndexNestedLoopJoin {
                        kind: crate::binder::statement::JoinKind::Inner,
                        db_oid: *db_oid,
                        table_oid: *table_oid,
                        index_oid,
                        alias: alias.clone(),
                        outer_keys: vec![left_keys[0].clone()],
                    }),
                    vec![children[0]],
                ));
            }
        }
        out
    }
}

struct ImplementAggregate;

impl Rule for ImplementAggregate {
    fn name(&self) -> &'static str {
        "ImplementAggregate"
    }

    fn is_transformation(&self) -> bool {
        false
    }

    fn matches(&self, op: &Operator, _children: &[GroupId], _memo: &Memo) -> bool {
        matches!(op.logical(), Some(LogicalOp::Aggregate { .. }))
    }

    fn apply(
        &self,
        op: &Operator,
        children: &[GroupId],
        _memo: &Memo,
        _accessor: &CatalogAccessor,
    ) -> Vec<(Operator, Vec<GroupId>)> {
        let Some(LogicalOp::Aggregate {
            group_by,
            aggregates,
            having,
        }) = op.logical()
        else {
            return Vec::new();
        };
        if group_by.is_empty() {
            return vec![(
                Operator::Physical(PhysicalOp::StaticAggregate {
                    aggregates: aggregates.clone(),
                    having: having.clone(),
                }),
                children.to_vec(),
            )];
        }
        let mut out = vec![(
            Operator::Physical(PhysicalOp::HashAggregate {
                group_by: group_by.clone(),
                aggregates: aggregates.clone(),
                having: having.clone(),
            }),
            children.to_vec(),
        )];
        // Streaming variant only when the group keys are plain columns an
        // index or sort below can order on.
        if group_by
            .iter()
            .all(|g| matches!(g, BoundExpr::ColumnValue(_)))
        {
            out.push((
                Operator::Physical(PhysicalOp::SortAggregate {
                    group_by: group_by.clone(),
                    aggregates: aggregates.clone(),
                    having: having.clone(),
                }),
                children.to_vec(),
            ));
        }
        out
    }
}

/// One-to-one implementations for the operators with a single physical
/// counterpart.
struct ImplementTrivial;

impl Rule for ImplementTrivial {
    fn name(&self) -> &'static str {
        "ImplementTrivial"
    }

    fn is_transformation(&self) -> bool {
        false
    }

    fn matches(&self, op: &Operator, _children: &[GroupId], _memo: &Memo) -> bool {
        matches!(
            op.logical(),
            Some(
                LogicalOp::Filter { .. }
                    | LogicalOp::Projection { .. }
                    | LogicalOp::Alias { .. }
                    | LogicalOp::Limit { .. }
                    | LogicalOp::Values { .. }
                    | LogicalOp::Insert { .. }
                    | LogicalOp::InsertSelect { .. }
                    | LogicalOp::Update { .. }
                    | LogicalOp::Delete { .. }
                    | LogicalOp::CteScan { .. }
                    | LogicalOp::CsvScan { .. }
                    | LogicalOp::CreateTable { .. }
                    | LogicalOp::CreateIndex { .. }
                    | LogicalOp::DropTable { .. }
                    | LogicalOp::DropIndex { .. }
            )
        )
    }

    fn apply(
        &self,
        op: &Operator,
        children: &[GroupId],
        _memo: &Memo,
        _accessor: &CatalogAccessor,
    ) -> Vec<(Operator, Vec<GroupId>)> {
        let physical = match op.logical() {
            Some(LogicalOp::Filter { predicates }) => PhysicalOp::Filter {
                predicates: predicates.clone(),
            },
            Some(LogicalOp::Projection { exprs, names }) => PhysicalOp::Projection {
                exprs: exprs.clone(),
                names: names.clone(),
            },
            Some(LogicalOp::Alias { alias, names }) => PhysicalOp::Alias {
                alias: alias.clone(),
                names: names.clone(),
            },
            Some(LogicalOp::Limit {
                limit,
                offset,
                sort_keys,
            }) => PhysicalOp::Limit {
                limit: *limit,
                offset: *offset,
                sort_keys: sort_keys.clone(),
            },
            Some(LogicalOp::Values { rows, types }) => PhysicalOp::Values {
                rows: rows.clone(),
                types: types.clone(),
            },
            Some(LogicalOp::Insert {
                db_oid,
                table_oid,
                column_indexes,
                rows,
            }) => PhysicalOp::Insert {
                db_oid: *db_oid,
                table_oid: *table_oid,
                column_indexes: column_indexes.clone(),
                rows: rows.clone(),
            },
            Some(LogicalOp::InsertSelect {
                db_oid,
                table_oid,
                column_indexes,
            }) => PhysicalOp::InsertSelect {
                db_oid: *db_oid,
                table_oid: *table_oid,
                column_indexes: column_indexes.clone(),
            },
            Some(LogicalOp::Update {
                db_oid,
                table_oid,
                assignments,
            }) => PhysicalOp::Update {
                db_oid: *db_oid,
                table_oid: *table_oid,
                assignments: assignments.clone(),
            },
            Some(LogicalOp::Delete { db_oid, table_oid }) => PhysicalOp::Delete {
                db_oid: *db_oid,
                table_oid: *table_oid,
            },
            Some(LogicalOp::CteScan {
                cte_index,
                alias,
                columns,
            }) => PhysicalOp::CteScan {
                cte_index: *cte_index,
                alias: alias.clone(),
                columns: columns.clone(),
            },
            Some(LogicalOp::CsvScan { path, columns }) => PhysicalOp::CsvScan {
                path: path.clone(),
                columns: columns.clone(),
            },
            Some(LogicalOp::CreateTable {
                namespace,
                name,
                columns,
                if_not_exists,
            }) => PhysicalOp::CreateTable {
                namespace: *namespace,
                name: name.clone(),
                columns: columns.clone(),
                if_not_exists: *if_not_exists,
            },
            Some(LogicalOp::CreateIndex {
                namespace,
                name,
                table_oid,
                key_columns,
                unique,
                if_not_exists,
            }) => PhysicalOp::CreateIndex {
                namespace: *namespace,
                name: name.clone(),
                table_oid: *table_oid,
                key_columns: key_columns.clone(),
                unique: *unique,
                if_not_exists: *if_not_exists,
            },
            Some(LogicalOp::DropTable {
                table_oid,
                name,
                if_exists,
            }) => PhysicalOp::DropTable {
                table_oid: *table_oid,
                name: name.clone(),
                if_exists: *if_exists,
            },
            Some(LogicalOp::DropIndex {
                index_oid,
                name,
                if_exists,
            }) => PhysicalOp::DropIndex {
                index_oid: *index_oid,
                name: name.clone(),
                if_exists: *if_exists,
            },
            _ => return Vec::new(),
        };
        vec![(Operator::Physical(physical), children.to_vec())]
    }
}
