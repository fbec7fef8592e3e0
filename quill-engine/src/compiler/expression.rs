//! Expression translation: bound expressions lower to typed IR against the
//! output columns of the translator's child. Whole-expression structural
//! matches (group-by keys, aggregates above an aggregation boundary) win
//! before recursion, so column references synthesize uniformly.

use crate::binder::expr::{BoundExpr, UnaryOp};
use crate::error::QueryError;
use crate::exec::ir::{BuiltinFn, IrExpr};
use crate::plan::OutputColumn;

/// Lower `expr` against the child's output columns.
pub fn translate(expr: &BoundExpr, inputs: &[OutputColumn]) -> Result<IrExpr, QueryError> {
    // A child output computing exactly this expression becomes a slot read.
    if let Some(index) = inputs.iter().position(|c| exprs_match(&c.expr, expr)) {
        return Ok(IrExpr::Slot {
            index,
            type_id: inputs[index].type_id,
        });
    }

    match expr {
        BoundExpr::ColumnValue(column) => {
            // Alias-qualified first, bare name as fallback.
            let by_alias = inputs.iter().position(|c| match &c.expr {
                BoundExpr::ColumnValue(input) => {
                    input.table_alias.eq_ignore_ascii_case(&column.table_alias)
                        && input.column_name.eq_ignore_ascii_case(&column.column_name)
                }
                _ => false,
            });
            let index = by_alias
                .or_else(|| {
                    inputs.iter().position(|c| {
                        c.name.eq_ignore_ascii_case(&column.column_name)
                    })
                })
                .ok_or_else(|| {
                    QueryError::Codegen(format!(
                        "column {}.{} is not produced by the child pipeline",
                        column.table_alias, column.column_name
                    ))
                })?;
            Ok(IrExpr::Slot {
                index,
                type_id: inputs[index].type_id,
            })
        }
        BoundExpr::Constant { value, .. } => Ok(IrExpr::Constant {
            value: value.clone(),
        }),
        BoundExpr::Parameter { index, type_id } => Ok(IrExpr::Param {
            index: *index,
            type_id: *type_id,
        }),
        BoundExpr::Comparison { op, left, right } => Ok(IrExpr::Compare {
            cmp: *op,
            left: Box::new(translate(left, inputs)?),
            right: Box::new(translate(right, inputs)?),
        }),
        BoundExpr::Conjunction { op, children } => Ok(IrExpr::Conjunction {
            conj: *op,
            children: children
                .iter()
                .map(|child| translate(child, inputs))
                .collect::<Result<_, _>>()?,
        }),
        BoundExpr::Arithmetic {
            op,
            left,
            right,
            type_id,
        } => Ok(IrExpr::Arithmetic {
            arith: *op,
            left: Box::new(translate(left, inputs)?),
            right: Box::new(translate(right, inputs)?),
            type_id: *type_id,
        }),
        BoundExpr::Unary { op, child, type_id } => match op {
            UnaryOp::Minus => Ok(IrExpr::Negate {
                child: Box::new(translate(child, inputs)?),
                type_id: *type_id,
            }),
            UnaryOp::Not => Ok(IrExpr::Not {
                child: Box::new(translate(child, inputs)?),
            }),
        },
        BoundExpr::NullCheck { negated, child } => Ok(IrExpr::IsNull {
            negated: *negated,
            child: Box::new(translate(child, inputs)?),
        }),
        BoundExpr::Function(function) => {
            let builtin = BuiltinFn::by_name(&function.name).ok_or_else(|| {
                QueryError::NotImplemented(format!("function {}", function.name))
            })?;
            Ok(IrExpr::Call {
                function: builtin,
                args: function
                    .args
                    .iter()
                    .map(|arg| translate(arg, inputs))
                    .collect::<Result<_, _>>()?,
            })
        }
        BoundExpr::Aggregate(_) => Err(QueryError::Codegen(
            "aggregate expression outside an aggregation boundary".to_string(),
        )),
        BoundExpr::Derived { index, type_id } => Ok(IrExpr::Slot {
            index: *index,
            type_id: *type_id,
        }),
        BoundExpr::Star => Err(QueryError::Codegen(
            "star expression survived binding".to_string(),
        )),
    }
}

/// Structural equality for resolution: column values match on their
/// `(table, column)` identity (or alias/name for virtual columns), depth
/// and database excluded; everything else matches exactly.
pub fn exprs_match(produced: &BoundExpr, wanted: &BoundExpr) -> bool {
    match (produced, wanted) {
        (BoundExpr::ColumnValue(a), BoundExpr::ColumnValue(b)) => {
            if a.column_oid.is_valid() && b.column_oid.is_valid() {
                a.table_oid == b.table_oid
                    && a.column_oid == b.column_oid
                    && a.table_alias.eq_ignore_ascii_case(&b.table_alias)
            } else {
                a.table_alias.eq_ignore_ascii_case(&b.table_alias)
                    && a.column_name.eq_ignore_ascii_case(&b.column_name)
            }
        }
        (BoundExpr::Comparison { op: oa, left: la, right: ra },
         BoundExpr::Comparison { op: ob, left: lb, right: rb }) => {
            oa == ob && exprs_match(la, lb) && exprs_match(ra, rb)
        }
        (BoundExpr::Arithmetic { op: oa, left: la, right: ra, .. },
         BoundExpr::Arithmetic { op: ob, left: lb, right: rb, .. }) => {
            oa == ob && exprs_match(la, lb) && exprs_match(ra, rb)
        }
        (BoundExpr::Conjunction { op: oa, children: ca },
         BoundExpr::Conjunction { op: ob, children: cb }) => {
            oa == ob
                && ca.len() == cb.len()
                && ca.iter().zip(cb).all(|(a, b)| exprs_match(a, b))
        }
        (BoundExpr::Unary { op: oa, child: ca, .. }, BoundExpr::Unary { op: ob, child: cb, .. }) => {
            oa == ob && exprs_match(ca, cb)
        }
        (
            BoundExpr::NullCheck {
                negated: na,
                child: ca,
            },
            BoundExpr::NullCheck {
                negated: nb,
                child: cb,
            },
        ) => na == nb && exprs_match(ca, cb),
        (BoundExpr::Function(fa), BoundExpr::Function(fb)) => {
            fa.name == fb.name
                && fa.args.len() == fb.args.len()
                && fa.args.iter().zip(&fb.args).all(|(a, b)| exprs_match(a, b))
        }
        (BoundExpr::Aggregate(aa), BoundExpr::Aggregate(ab)) => {
            aa.kind == ab.kind
                && aa.distinct == ab.distinct
                && match (&aa.arg, &ab.arg) {
                    (None, None) => true,
                    (Some(a), Some(b)) => exprs_match(a, b),
                    _ => false,
                }
        }
        (a, b) => a == b,
    }
}
