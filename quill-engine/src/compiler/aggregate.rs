//! Aggregation translators: hash aggregation (build + iterate pipelines),
//! streaming aggregation over sorted input, and the static single-payload
//! aggregate for queries without GROUP BY.

use crate::binder::expr::BoundExpr;
use crate::compiler::{expression, CompilationContext, CompiledInput};
use crate::error::QueryError;
use crate::exec::ir::AggSpec;
use crate::exec::pipeline::{PipelineStep, SourceStep, StateInit};
use crate::plan::{OutputColumn, PhysicalOp, PlanNode};

impl CompilationContext<'_> {
    pub(crate) fn translate_hash_aggregate(
        &mut self,
        node: &PlanNode,
    ) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::HashAggregate {
            group_by,
            aggregates,
            having,
        } = &node.op
        else {
            return Err(QueryError::Codegen("expected a hash aggregate".into()));
        };

        let agg_slot = self.alloc_object_slot(|slot| StateInit::AggTable { slot });
        let child = self.compile_node(&node.children[0])?;
        let mut group = Vec::with_capacity(group_by.len());
        for key in group_by {
            group.push(expression::translate(key, &child.outputs)?);
        }
        let aggs = agg_specs(aggregates, &child.outputs)?;
        self.push_step(
            child.pipeline,
            PipelineStep::AggBuild {
                slot: agg_slot,
                group,
                aggs,
            },
        );

        let having_ir = translate_having(having, &node.output)?;
        let pipeline = self.new_pipeline(SourceStep::AggIter {
            slot: agg_slot,
            having: having_ir,
        });
        Ok(CompiledInput {
            pipeline,
            outputs: node.output.clone(),
        })
    }

    pub(crate) fn translate_sort_aggregate(
        &mut self,
        node: &PlanNode,
    ) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::SortAggregate {
            group_by,
            aggregates,
            having,
        } = &node.op
        else {
            return Err(QueryError::Codegen("expected a sort aggregate".into()));
        };

        let run_slot = self.alloc_object_slot(|slot| StateInit::Run { slot });
        let child = self.compile_node(&node.children[0])?;
        let mut group = Vec::with_capacity(group_by.len());
        for key in group_by {
            group.push(expression::translate(key, &child.outputs)?);
        }
        let aggs = agg_specs(aggregates, &child.outputs)?;
        let having_ir = translate_having(having, &node.output)?;
        // Streaming: stays in the child's pipeline, no materialization.
        self.push_step(
            child.pipeline,
            PipelineStep::SortedAgg {
                slot: run_slot,
                group,
                aggs,
                having: having_ir,
            },
        );
        Ok(CompiledInput {
            pipeline: child.pipeline,
            outputs: node.output.clone(),
        })
    }

    pub(crate) fn translate_static_aggregate(
        &mut self,
        node: &PlanNode,
    ) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::StaticAggregate { aggregates, having } = &node.op else {
            return Err(QueryError::Codegen("expected a static aggregate".into()));
        };

        let child = self.compile_node(&node.children[0])?;
        let aggs = agg_specs(aggregates, &child.outputs)?;
        let payload_aggs = aggs.clone();
        let slot = self.alloc_object_slot(move |slot| StateInit::StaticAgg {
            slot,
            aggs: payload_aggs,
        });
        self.push_step(
            child.pipeline,
            PipelineStep::StaticAggBuild { slot, aggs },
        );

        let having_ir = translate_having(having, &node.output)?;
        let pipeline = self.new_pipeline(SourceStep::StaticAggRead {
            slot,
            having: having_ir,
        });
        Ok(CompiledInput {
            pipeline,
            outputs: node.output.clone(),
        })
    }
}

/// Lower aggregate expressions into build specs against the child layout.
fn agg_specs(
    aggregates: &[BoundExpr],
    child_outputs: &[OutputColumn],
) -> Result<Vec<AggSpec>, QueryError> {
    let mut specs = Vec::with_capacity(aggregates.len());
    for aggregate in aggregates {
        let BoundExpr::Aggregate(agg) = aggregate else {
            return Err(QueryError::Codegen(
                "aggregation list holds a non-aggregate expression".into(),
            ));
        };
        let arg = match &agg.arg {
            Some(expr) => Some(expression::translate(expr, child_outputs)?),
            None => None,
        };
        specs.push(AggSpec {
            kind: agg.kind,
            arg,
            distinct: agg.distinct,
            type_id: agg.type_id,
        });
    }
    Ok(specs)
}

fn translate_having(
    having: &Option<BoundExpr>,
    agg_outputs: &[OutputColumn],
) -> Result<Option<crate::exec::ir::IrExpr>, QueryError> {
    match having {
        Some(expr) => Ok(Some(expression::translate(expr, agg_outputs)?)),
        None => Ok(None),
    }
}
