//! Scan translators: sequential scan with a vectorized filter manager, and
//! index scan with key-range bounds derived from prefix predicates.

use quill_catalog::ColumnOid;

use crate::binder::expr::{BoundExpr, ComparisonOp};
use crate::compiler::{expression, CompilationContext, CompiledInput};
use crate::error::QueryError;
use crate::exec::filter::FilterManager;
use crate::exec::ir::IrExpr;
use crate::exec::pipeline::SourceStep;
use crate::plan::{OutputColumn, PhysicalOp, PlanNode};

impl CompilationContext<'_> {
    pub(crate) fn translate_seq_scan(
        &mut self,
        node: &PlanNode,
    ) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::SeqScan {
            db_oid,
            table_oid,
            predicates,
            ..
        } = &node.op
        else {
            return Err(QueryError::Codegen("expected a sequential scan".into()));
        };
        let column_oids = scan_columns(&node.output);
        let filter = build_filter(predicates, &node.output)?;
        let pipeline = self.new_pipeline(SourceStep::SeqScan {
            db_oid: *db_oid,
            table_oid: *table_oid,
            column_oids,
            filter,
        });
        Ok(CompiledInput {
            pipeline,
            outputs: node.output.clone(),
        })
    }

    pub(crate) fn translate_index_scan(
        &mut self,
        node: &PlanNode,
    ) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::IndexScan {
            db_oid,
            table_oid,
            index_oid,
            predicates,
            descending,
            ..
        } = &node.op
        else {
            return Err(QueryError::Codegen("expected an index scan".into()));
        };
        let column_oids = scan_columns(&node.output);

        // Key-range bounds from predicates on the leading index column; the
        // full predicate set stays on the filter for exactness.
        let (lo, hi) = match self.accessor.get_index_schema(*index_oid) {
            Some(index_schema) => {
                let first_key = index_schema
                    .columns()
                    .first()
                    .map(|c| c.column_oid)
                    .unwrap_or(ColumnOid::INVALID);
                index_bounds(predicates, first_key)?
            }
            None => (None, None),
        };
        let filter = build_filter(predicates, &node.output)?;
        let pipeline = self.new_pipeline(SourceStep::IndexScan {
            db_oid: *db_oid,
            table_oid: *table_oid,
            index_oid: *index_oid,
            column_oids,
            lo,
            hi,
            descending: *descending,
            filter,
        });
        Ok(CompiledInput {
            pipeline,
            outputs: node.output.clone(),
        })
    }
}

fn scan_columns(outputs: &[OutputColumn]) -> Vec<ColumnOid> {
    outputs
        .iter()
        .map(|column| match &column.expr {
            BoundExpr::ColumnValue(c) => c.column_oid,
            _ => ColumnOid::INVALID,
        })
        .collect()
}

fn build_filter(
    predicates: &[BoundExpr],
    outputs: &[OutputColumn],
) -> Result<Option<FilterManager>, QueryError> {
    if predicates.is_empty() {
        return Ok(None);
    }
    let predicate = BoundExpr::conjoin(predicates.to_vec())
        .ok_or_else(|| QueryError::Codegen("empty scan predicate".into()))?;
    let ir = expression::translate(&predicate, outputs)?;
    Ok(Some(FilterManager::build(&ir)?))
}

/// Inclusive lo/hi key bounds from comparisons against the leading index
/// column. Non-column-leading comparisons contribute nothing.
fn index_bounds(
    predicates: &[BoundExpr],
    first_key: ColumnOid,
) -> Result<(Option<Vec<IrExpr>>, Option<Vec<IrExpr>>), QueryError> {
    let mut lo = None;
    let mut hi = None;
    for predicate in predicates {
        let BoundExpr::Comparison { op, left, right } = predicate else {
            continue;
        };
        let (value_side, op) = match (left.as_ref(), right.as_ref()) {
            (BoundExpr::ColumnValue(c), value) if c.column_oid == first_key => (value, *op),
            (value, BoundExpr::ColumnValue(c)) if c.column_oid == first_key => {
                // Flip the operator so the column reads on the left.
                let flipped = match op {
                    ComparisonOp::Lt => ComparisonOp::Gt,
                    ComparisonOp::LtEq => ComparisonOp::GtEq,
                    ComparisonOp::Gt => ComparisonOp::Lt,
                    ComparisonOp::GtEq => ComparisonOp::LtEq,
                    other => *other,
                };
                (value, flipped)
            }
            _ => continue,
        };
        if !matches!(
            value_side,
            BoundExpr::Constant { .. } | BoundExpr::Parameter { .. }
        ) {
            continue;
        }
        let key_expr = expression::translate(value_side, &[])?;
        match op {
            ComparisonOp::Eq => {
                lo = Some(vec![key_expr.clone()]);
                hi = Some(vec![key_expr]);
            }
            ComparisonOp::Gt | ComparisonOp::GtEq => lo = Some(vec![key_expr]),
            ComparisonOp::Lt | ComparisonOp::LtEq => hi = Some(vec![key_expr]),
            ComparisonOp::NotEq => {}
        }
    }
    Ok((lo, hi))
}
