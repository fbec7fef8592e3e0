//! Join translators. A hash join splits into a build pipeline (left child)
//! and a probe pipeline (right child); left outer joins drain the unmatched
//! build rows through an extra pipeline into a shared buffer. Nested-loop
//! joins materialize the inner child into a buffer iterated per outer row.

use quill_catalog::ColumnOid;

use crate::binder::expr::BoundExpr;
use crate::binder::statement::JoinKind;
use crate::compiler::{expression, CompilationContext, CompiledInput};
use crate::error::QueryError;
use crate::exec::pipeline::{PipelineStep, SourceStep, StateInit};
use crate::plan::{PhysicalOp, PlanNode};

impl CompilationContext<'_> {
    pub(crate) fn translate_hash_join(
        &mut self,
        node: &PlanNode,
    ) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::HashJoin {
            kind,
            left_keys,
            right_keys,
            residual,
        } = &node.op
        else {
            return Err(QueryError::Codegen("expected a hash join".into()));
        };
        if !matches!(kind, JoinKind::Inner | JoinKind::Left) {
            return Err(QueryError::Codegen(format!(
                "hash join does not support {kind:?} joins"
            )));
        }

        // Build side first: the left child's pipeline sinks into the table.
        let join_slot = self.alloc_object_slot(|slot| StateInit::JoinTable { slot });
        let build = self.compile_node(&node.children[0])?;
        let mut build_keys = Vec::with_capacity(left_keys.len());
        for key in left_keys {
            build_keys.push(expression::translate(key, &build.outputs)?);
        }
        self.push_step(
            build.pipeline,
            PipelineStep::HashJoinBuild {
                slot: join_slot,
                keys: build_keys,
            },
        );

        // Probe side continues the right child's pipeline.
        let probe = self.compile_node(&node.children[1])?;
        let mut probe_keys = Vec::with_capacity(right_keys.len());
        for key in right_keys {
            probe_keys.push(expression::translate(key, &probe.outputs)?);
        }
        let residual_ir = match residual {
            Some(expr) => Some(expression::translate(expr, &node.output)?),
            None => None,
        };
        self.push_step(
            probe.pipeline,
            PipelineStep::HashJoinProbe {
                slot: join_slot,
                keys: probe_keys,
                kind: *kind,
                build_arity: build.outputs.len(),
                residual: residual_ir,
            },
        );

        if *kind == JoinKind::Left {
            // Matched and unmatched halves meet in a shared buffer; the
            // open pipeline reads it back.
            let buffer_slot = self.alloc_object_slot(|slot| StateInit::Buffer { slot });
            self.push_step(probe.pipeline, PipelineStep::BufferFill { slot: buffer_slot });
            let drain = self.new_pipeline(SourceStep::UnmatchedBuildIter {
                slot: join_slot,
                probe_arity: probe.outputs.len(),
            });
            self.push_step(drain, PipelineStep::BufferFill { slot: buffer_slot });
            let pipeline = self.new_pipeline(SourceStep::BufferIter { slot: buffer_slot });
            return Ok(CompiledInput {
                pipeline,
                outputs: node.output.clone(),
            });
        }

        Ok(CompiledInput {
            pipeline: probe.pipeline,
            outputs: node.output.clone(),
        })
    }

    pub(crate) fn translate_nested_loop_join(
        &mut self,
        node: &PlanNode,
    ) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::NestedLoopJoin { kind, condition } = &node.op else {
            return Err(QueryError::Codegen("expected a nested-loop join".into()));
        };
        if *kind == JoinKind::Full {
            return Err(QueryError::Codegen(
                "full outer join is not supported".into(),
            ));
        }

        // Materialize the inner (right) child, then iterate it per outer row.
        let buffer_slot = self.alloc_object_slot(|slot| StateInit::Buffer { slot });
        let inner = self.compile_node(&node.children[1])?;
        self.push_step(inner.pipeline, PipelineStep::BufferFill { slot: buffer_slot });

        let outer = self.compile_node(&node.children[0])?;
        let condition_ir = match condition {
            Some(expr) => Some(expression::translate(expr, &node.output)?),
            None => None,
        };
        self.push_step(
            outer.pipeline,
            PipelineStep::NestedLoop {
                buffer_slot,
                kind: *kind,
                condition: condition_ir,
                inner_arity: inner.outputs.len(),
            },
        );
        Ok(CompiledInput {
            pipeline: outer.pipeline,
            outputs: node.output.clone(),
        })
    }

    pub(crate) fn translate_index_join(
        &mut self,
        node: &PlanNode,
    ) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::IndexNestedLoopJoin {
            db_oid,
            table_oid,
            index_oid,
            outer_keys,
            ..
        } = &node.op
        else {
            return Err(QueryError::Codegen("expected an index join".into()));
        };

        let outer = self.compile_node(&node.children[0])?;
        let mut keys = Vec::with_capacity(outer_keys.len());
        for key in outer_keys {
            keys.push(expression::translate(key, &outer.outputs)?);
        }
        let column_oids: Vec<ColumnOid> = node.output[outer.outputs.len()..]
            .iter()
            .map(|column| match &column.expr {
                BoundExpr::ColumnValue(c) => c.column_oid,
                _ => ColumnOid::INVALID,
            })
            .collect();
        self.push_step(
            outer.pipeline,
            PipelineStep::IndexJoin {
                db_oid: *db_oid,
                table_oid: *table_oid,
                index_oid: *index_oid,
                keys,
                column_oids,
            },
        );
        Ok(CompiledInput {
            pipeline: outer.pipeline,
            outputs: node.output.clone(),
        })
    }
}
