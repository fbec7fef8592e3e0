//! The compiler: walks a physical plan, instantiates one translator per
//! operator, and emits pipelines of typed-IR steps plus the query-state
//! layout. `OneShot` packages every pipeline into a single fragment;
//! `Interleaved` emits one fragment per pipeline in dependency order.

pub mod expression;

mod aggregate;
mod dml;
mod join;
mod scan;
mod sort_limit;

use std::sync::Arc;

use quill_catalog::CatalogAccessor;

use crate::error::QueryError;
use crate::exec::pipeline::{
    DdlOp, Fragment, FunctionBody, IrFunction, Module, PipelineProgram, PipelineStep, SourceStep,
    StateInit,
};
use crate::exec::{ExecutableQuery, OperatingUnitFeature};
use crate::plan::{OutputColumn, PhysicalOp, PhysicalPlan, PlanNode};
use crate::settings::{CompilationMode, ExecutionSettings};

const NO_PIPELINE: usize = usize::MAX;

/// A pipeline being built: one source plus the step chain appended by the
/// translators along it.
pub(crate) struct PipelineBuilder {
    pub source: SourceStep,
    pub steps: Vec<PipelineStep>,
}

/// What a translator hands its parent: the still-open pipeline and the row
/// layout flowing through it.
pub(crate) struct CompiledInput {
    pub pipeline: usize,
    pub outputs: Vec<OutputColumn>,
}

pub struct CompilationContext<'a> {
    pub(crate) accessor: &'a CatalogAccessor,
    pub(crate) settings: ExecutionSettings,
    pub(crate) pipelines: Vec<PipelineBuilder>,
    pub(crate) state_inits: Vec<StateInit>,
    pub(crate) teardown_slots: Vec<usize>,
    pub(crate) ddl_ops: Vec<DdlOp>,
    pub(crate) next_object_slot: usize,
    pub(crate) state_bytes: usize,
    pub(crate) cte_slots: Vec<usize>,
}

impl<'a> CompilationContext<'a> {
    /// Compile a physical plan. `visible_columns` bounds the user-facing
    /// output arity; hidden sort columns beyond it are trimmed at the sink.
    pub fn compile(
        plan: Arc<PhysicalPlan>,
        accessor: &'a CatalogAccessor,
        settings: ExecutionSettings,
        visible_columns: usize,
    ) -> Result<ExecutableQuery, QueryError> {
        let mut ctx = CompilationContext {
            accessor,
            settings,
            pipelines: Vec::new(),
            state_inits: Vec::new(),
            teardown_slots: Vec::new(),
            ddl_ops: Vec::new(),
            next_object_slot: 0,
            state_bytes: 0,
            cte_slots: Vec::new(),
        };

        // CTE bodies materialize first, in definition order.
        for cte in &plan.ctes {
            let slot = ctx.alloc_object_slot(|slot| StateInit::Buffer { slot });
            ctx.cte_slots.push(slot);
            let compiled = ctx.compile_node(cte)?;
            ctx.push_step(compiled.pipeline, PipelineStep::BufferFill { slot });
        }

        let effect_only = plan.root.op.is_dml() || plan.root.op.is_ddl();
        let compiled = ctx.compile_node(&plan.root)?;
        if !effect_only {
            let arity = if visible_columns == 0 {
                compiled.outputs.len()
            } else {
                visible_columns.min(compiled.outputs.len())
            };
            ctx.push_step(compiled.pipeline, PipelineStep::Output { arity });
        }

        Ok(ctx.assemble(plan))
    }

    // ---- pipeline plumbing ----

    pub(crate) fn new_pipeline(&mut self, source: SourceStep) -> usize {
        self.pipelines.push(PipelineBuilder {
            source,
            steps: Vec::new(),
        });
        self.pipelines.len() - 1
    }

    pub(crate) fn push_step(&mut self, pipeline: usize, step: PipelineStep) {
        if pipeline != NO_PIPELINE {
            self.pipelines[pipeline].steps.push(step);
        }
    }

    /// Allocate a query-state object slot with matched init and teardown.
    pub(crate) fn alloc_object_slot(&mut self, make: impl FnOnce(usize) -> StateInit) -> usize {
        let slot = self.next_object_slot;
        self.next_object_slot += 1;
        self.state_inits.push(make(slot));
        self.teardown_slots.push(slot);
        slot
    }

    /// Allocate an 8-byte counter in the scalar state region.
    pub(crate) fn alloc_counter(&mut self) -> usize {
        let offset = self.state_bytes;
        self.state_bytes += 8;
        offset
    }

    // ---- dispatch ----

    pub(crate) fn compile_node(&mut self, node: &PlanNode) -> Result<CompiledInput, QueryError> {
        match &node.op {
            PhysicalOp::SeqScan { .. } => self.translate_seq_scan(node),
            PhysicalOp::IndexScan { .. } => self.translate_index_scan(node),
            PhysicalOp::Filter { predicates } => {
                let predicates = predicates.clone();
                let child = self.compile_node(&node.children[0])?;
                let predicate = crate::binder::expr::BoundExpr::conjoin(predicates)
                    .ok_or_else(|| QueryError::Codegen("empty filter".into()))?;
                let ir = expression::translate(&predicate, &child.outputs)?;
                self.push_step(child.pipeline, PipelineStep::Filter { predicate: ir });
                Ok(CompiledInput {
                    pipeline: child.pipeline,
                    outputs: node.output.clone(),
                })
            }
            PhysicalOp::Projection { exprs, .. } => {
                let exprs = exprs.clone();
                let child = self.compile_node(&node.children[0])?;
                let mut translated = Vec::with_capacity(exprs.len());
                for expr in &exprs {
                    translated.push(expression::translate(expr, &child.outputs)?);
                }
                self.push_step(child.pipeline, PipelineStep::Project { exprs: translated });
                Ok(CompiledInput {
                    pipeline: child.pipeline,
                    outputs: node.output.clone(),
                })
            }
            PhysicalOp::Alias { .. } => {
                // Renaming only; no runtime work.
                let child = self.compile_node(&node.children[0])?;
                Ok(CompiledInput {
                    pipeline: child.pipeline,
                    outputs: node.output.clone(),
                })
            }
            PhysicalOp::HashJoin { .. } => self.translate_hash_join(node),
            PhysicalOp::NestedLoopJoin { .. } => self.translate_nested_loop_join(node),
            PhysicalOp::IndexNestedLoopJoin { .. } => self.translate_index_join(node),
            PhysicalOp::HashAggregate { .. } => self.translate_hash_aggregate(node),
            PhysicalOp::SortAggregate { .. } => self.translate_sort_aggregate(node),
            PhysicalOp::StaticAggregate { .. } => self.translate_static_aggregate(node),
            PhysicalOp::Sort { .. } => self.translate_sort(node),
            PhysicalOp::Limit { .. } => self.translate_limit(node),
            PhysicalOp::Values { .. } => self.translate_values(node),
            PhysicalOp::Insert { .. } => self.translate_insert(node),
            PhysicalOp::InsertSelect { .. } => self.translate_insert_select(node),
            PhysicalOp::Update { .. } => self.translate_update(node),
            PhysicalOp::Delete { .. } => self.translate_delete(node),
            PhysicalOp::CteScan { cte_index, .. } => {
                let slot = *self
                    .cte_slots
                    .get(*cte_index)
                    .ok_or_else(|| QueryError::Codegen("CTE scan before its definition".into()))?;
                let pipeline = self.new_pipeline(SourceStep::BufferIter { slot });
                Ok(CompiledInput {
                    pipeline,
                    outputs: node.output.clone(),
                })
            }
            PhysicalOp::CsvScan { path, .. } => {
                let types = node.output.iter().map(|c| c.type_id).collect();
                let pipeline = self.new_pipeline(SourceStep::CsvScan {
                    path: path.clone(),
                    types,
                });
                Ok(CompiledInput {
                    pipeline,
                    outputs: node.output.clone(),
                })
            }
            PhysicalOp::CreateTable {
                namespace,
                name,
                columns,
                if_not_exists,
            } => {
                self.ddl_ops.push(DdlOp::CreateTable {
                    namespace: *namespace,
                    name: name.clone(),
                    columns: columns.clone(),
                    if_not_exists: *if_not_exists,
                });
                Ok(CompiledInput {
                    pipeline: NO_PIPELINE,
                    outputs: Vec::new(),
                })
            }
            PhysicalOp::CreateIndex {
                namespace,
                name,
                table_oid,
                key_columns,
                unique,
                if_not_exists,
            } => {
                self.ddl_ops.push(DdlOp::CreateIndex {
                    namespace: *namespace,
                    name: name.clone(),
                    table_oid: *table_oid,
                    key_columns: key_columns.clone(),
                    unique: *unique,
                    if_not_exists: *if_not_exists,
                });
                Ok(CompiledInput {
                    pipeline: NO_PIPELINE,
                    outputs: Vec::new(),
                })
            }
            PhysicalOp::DropTable {
                table_oid,
                if_exists,
                ..
            } => {
                self.ddl_ops.push(DdlOp::DropTable {
                    table_oid: *table_oid,
                    if_exists: *if_exists,
                });
                Ok(CompiledInput {
                    pipeline: NO_PIPELINE,
                    outputs: Vec::new(),
                })
            }
            PhysicalOp::DropIndex {
                index_oid,
                if_exists,
                ..
            } => {
                self.ddl_ops.push(DdlOp::DropIndex {
                    index_oid: *index_oid,
                    if_exists: *if_exists,
                });
                Ok(CompiledInput {
                    pipeline: NO_PIPELINE,
                    outputs: Vec::new(),
                })
            }
        }
    }

    // ---- assembly ----

    fn assemble(self, plan: Arc<PhysicalPlan>) -> ExecutableQuery {
        let CompilationContext {
            settings,
            pipelines,
            state_inits,
            teardown_slots,
            ddl_ops,
            next_object_slot,
            state_bytes,
            accessor,
            ..
        } = self;

        // Prepare pass: record operating-unit features per pipeline before
        // emission.
        let mut features = Vec::new();
        let mut programs = Vec::with_capacity(pipelines.len());
        for (id, builder) in pipelines.into_iter().enumerate() {
            let parallel = pipeline_is_parallel(&builder);
            let (operator, rows) = describe_pipeline(&builder, accessor);
            features.push(OperatingUnitFeature::new(id, operator).with_rows(rows));
            programs.push(PipelineProgram {
                id,
                source: builder.source,
                steps: builder.steps,
                parallel,
            });
        }

        let mut module = Module::default();
        module.declare(IrFunction {
            name: "init".to_string(),
            body: FunctionBody::InitState(state_inits),
        });
        for (i, op) in ddl_ops.into_iter().enumerate() {
            module.declare(IrFunction {
                name: format!("ddl{i}"),
                body: FunctionBody::Ddl(op),
            });
        }
        let mut work_names = Vec::new();
        for program in programs {
            let name = format!("pipeline{}_run", program.id);
            work_names.push(name.clone());
            module.declare(IrFunction {
                name,
                body: FunctionBody::PipelineWork(program),
            });
        }
        module.declare(IrFunction {
            name: "teardown".to_string(),
            body: FunctionBody::TearDown(teardown_slots),
        });
        // Empty init/teardown pads so that every interleaved fragment still
        // begins with an Init and ends with a TearDown.
        module.declare(IrFunction {
            name: "init_noop".to_string(),
            body: FunctionBody::InitState(Vec::new()),
        });
        module.declare(IrFunction {
            name: "teardown_noop".to_string(),
            body: FunctionBody::TearDown(Vec::new()),
        });

        let ddl_names: Vec<String> = module
            .function_names()
            .iter()
            .filter(|n| n.starts_with("ddl"))
            .map(|n| n.to_string())
            .collect();

        let fragments = match settings.compilation_mode() {
            CompilationMode::OneShot => {
                let mut functions = vec!["init".to_string()];
                functions.extend(ddl_names);
                functions.extend(work_names);
                vec![Fragment {
                    module,
                    functions,
                    teardowns: vec!["teardown".to_string()],
                }]
            }
            CompilationMode::Interleaved => {
                let mut fragments = Vec::new();
                let mut units: Vec<Vec<String>> = Vec::new();
                if !ddl_names.is_empty() {
                    units.push(ddl_names);
                }
                for name in work_names {
                    units.push(vec![name]);
                }
                if units.is_empty() {
                    units.push(Vec::new());
                }
                let last = units.len() - 1;
                for (i, unit) in units.into_iter().enumerate() {
                    let mut functions = vec![if i == 0 {
                        "init".to_string()
                    } else {
                        "init_noop".to_string()
                    }];
                    functions.extend(unit);
                    fragments.push(Fragment {
                        module: module.clone(),
                        functions,
                        teardowns: vec![if i == last {
                            "teardown".to_string()
                        } else {
                            "teardown_noop".to_string()
                        }],
                    });
                }
                fragments
            }
        };

        ExecutableQuery::new(
            plan,
            settings,
            fragments,
            state_bytes,
            next_object_slot,
            features,
        )
    }
}

/// A pipeline may run parallel when its source partitions (sequential
/// scans) and every step tolerates concurrent workers. Serial-only sinks
/// (DML, limits, streaming aggregation) and ordered consumers keep it
/// sequential.
fn pipeline_is_parallel(builder: &PipelineBuilder) -> bool {
    if !matches!(builder.source, SourceStep::SeqScan { .. }) {
        return false;
    }
    if builder.steps.iter().any(|s| s.is_serial_only()) {
        return false;
    }
    matches!(
        builder.steps.last(),
        Some(
            PipelineStep::HashJoinBuild { .. }
                | PipelineStep::AggBuild { .. }
                | PipelineStep::StaticAggBuild { .. }
        )
    )
}

fn describe_pipeline(builder: &PipelineBuilder, accessor: &CatalogAccessor) -> (String, u64) {
    let (source, rows) = match &builder.source {
        SourceStep::SeqScan { table_oid, .. } => (
            "seq_scan",
            accessor.get_table_statistics(*table_oid).num_rows,
        ),
        SourceStep::IndexScan { table_oid, .. } => (
            "index_scan",
            accessor.get_table_statistics(*table_oid).num_rows,
        ),
        SourceStep::AggIter { .. } => ("agg_iter", 0),
        SourceStep::StaticAggRead { .. } => ("static_agg_read", 1),
        SourceStep::SorterIter { .. } => ("sorter_iter", 0),
        SourceStep::BufferIter { .. } => ("buffer_iter", 0),
        SourceStep::UnmatchedBuildIter { .. } => ("unmatched_iter", 0),
        SourceStep::Values { rows } => ("values", rows.len() as u64),
        SourceStep::CsvScan { .. } => ("csv_scan", 0),
    };
    let sink = builder
        .steps
        .last()
        .map(|step| match step {
            PipelineStep::HashJoinBuild { .. } => "/hash_join_build",
            PipelineStep::AggBuild { .. } => "/agg_build",
            PipelineStep::StaticAggBuild { .. } => "/static_agg_build",
            PipelineStep::SortBuild { .. } => "/sort_build",
            PipelineStep::BufferFill { .. } => "/buffer_fill",
            PipelineStep::Output { .. } => "/output",
            PipelineStep::InsertSink { .. } => "/insert",
            PipelineStep::UpdateSink { .. } => "/update",
            PipelineStep::DeleteSink { .. } => "/delete",
            _ => "",
        })
        .unwrap_or("");
    (format!("{source}{sink}"), rows)
}
