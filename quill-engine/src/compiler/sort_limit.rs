//! Sort and limit translators. A sort is a materializing boundary (build
//! into the sorter, iterate in a new pipeline); a limit with a pushed-down
//! sort becomes a bounded top-K sorter; a plain limit is a pass-through
//! counter in the scalar query state.

use crate::compiler::{expression, CompilationContext, CompiledInput};
use crate::error::QueryError;
use crate::exec::pipeline::{PipelineStep, SourceStep, StateInit};
use crate::plan::{PhysicalOp, PlanNode, SortKey};

impl CompilationContext<'_> {
    pub(crate) fn translate_sort(&mut self, node: &PlanNode) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::Sort { sort_keys } = &node.op else {
            return Err(QueryError::Codegen("expected a sort".into()));
        };
        let slot = self.alloc_object_slot(|slot| StateInit::Sorter { slot, limit: None });
        let child = self.compile_node(&node.children[0])?;
        let keys = translate_sort_keys(sort_keys, &child.outputs)?;
        self.push_step(child.pipeline, PipelineStep::SortBuild { slot, keys });
        let pipeline = self.new_pipeline(SourceStep::SorterIter { slot });
        Ok(CompiledInput {
            pipeline,
            outputs: node.output.clone(),
        })
    }

    /// A limit is a pass-through counter. When it carries pushed-down sort
    /// keys the child was already required to deliver that order (by an
    /// index or a sort enforcer below), so only the counting remains here.
    pub(crate) fn translate_limit(&mut self, node: &PlanNode) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::Limit { limit, offset, .. } = &node.op else {
            return Err(QueryError::Codegen("expected a limit".into()));
        };
        let child = self.compile_node(&node.children[0])?;
        let counter_offset = self.alloc_counter();
        self.push_step(
            child.pipeline,
            PipelineStep::Limit {
                counter_offset,
                limit: *limit,
                offset: *offset,
            },
        );
        Ok(CompiledInput {
            pipeline: child.pipeline,
            outputs: node.output.clone(),
        })
    }
}

fn translate_sort_keys(
    sort_keys: &[SortKey],
    outputs: &[crate::plan::OutputColumn],
) -> Result<Vec<(crate::exec::ir::IrExpr, bool)>, QueryError> {
    sort_keys
        .iter()
        .map(|key| Ok((expression::translate(&key.expr, outputs)?, key.descending)))
        .collect()
}
