//! DML translators. Inserts project their source into full table-column
//! order (defaults and nulls filled in) before the serial storage sink;
//! updates and deletes ride the tuple slots their scan children carry.
//! Modification pipelines are strictly serial.

use std::sync::Arc;

use quill_catalog::{Schema, TableOid};
use quill_storage::SqlValue;

use crate::compiler::{expression, CompilationContext, CompiledInput};
use crate::error::QueryError;
use crate::exec::ir::IrExpr;
use crate::exec::pipeline::{PipelineStep, SourceStep, StateInit};
use crate::plan::{PhysicalOp, PlanNode};

impl CompilationContext<'_> {
    pub(crate) fn translate_values(&mut self, node: &PlanNode) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::Values { rows, .. } = &node.op else {
            return Err(QueryError::Codegen("expected a values node".into()));
        };
        let mut ir_rows = Vec::with_capacity(rows.len());
        for row in rows {
            let mut ir_row = Vec::with_capacity(row.len());
            for expr in row {
                ir_row.push(expression::translate(expr, &[])?);
            }
            ir_rows.push(ir_row);
        }
        let pipeline = self.new_pipeline(SourceStep::Values { rows: ir_rows });
        Ok(CompiledInput {
            pipeline,
            outputs: node.output.clone(),
        })
    }

    pub(crate) fn translate_insert(&mut self, node: &PlanNode) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::Insert {
            db_oid,
            table_oid,
            column_indexes,
            rows,
        } = &node.op
        else {
            return Err(QueryError::Codegen("expected an insert".into()));
        };
        let schema = self.table_schema(*table_oid)?;

        // Each VALUES row becomes a full-width row: listed columns from the
        // bound expressions, everything else from column defaults.
        let mut ir_rows = Vec::with_capacity(rows.len());
        for row in rows {
            let mut full_row = Vec::with_capacity(schema.columns().len());
            for (schema_index, column) in schema.columns().iter().enumerate() {
                match column_indexes.iter().position(|ci| *ci == schema_index) {
                    Some(position) => {
                        full_row.push(expression::translate(&row[position], &[])?)
                    }
                    None => full_row.push(default_expr(column)),
                }
            }
            ir_rows.push(full_row);
        }

        let pipeline = self.new_pipeline(SourceStep::Values { rows: ir_rows });
        let writer_slot = self.writer_slot(*db_oid, *table_oid);
        self.push_step(pipeline, PipelineStep::InsertSink { writer_slot });
        Ok(CompiledInput {
            pipeline,
            outputs: Vec::new(),
        })
    }

    pub(crate) fn translate_insert_select(
        &mut self,
        node: &PlanNode,
    ) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::InsertSelect {
            db_oid,
            table_oid,
            column_indexes,
        } = &node.op
        else {
            return Err(QueryError::Codegen("expected an insert-select".into()));
        };
        let schema = self.table_schema(*table_oid)?;

        let child = self.compile_node(&node.children[0])?;
        let mut full_row = Vec::with_capacity(schema.columns().len());
        for (schema_index, column) in schema.columns().iter().enumerate() {
            match column_indexes.iter().position(|ci| *ci == schema_index) {
                Some(position) => full_row.push(IrExpr::Slot {
                    index: position,
                    type_id: child
                        .outputs
                        .get(position)
                        .map(|c| c.type_id)
                        .unwrap_or(column.type_id()),
                }),
                None => full_row.push(default_expr(column)),
            }
        }
        self.push_step(child.pipeline, PipelineStep::Project { exprs: full_row });

        let writer_slot = self.writer_slot(*db_oid, *table_oid);
        self.push_step(child.pipeline, PipelineStep::InsertSink { writer_slot });
        Ok(CompiledInput {
            pipeline: child.pipeline,
            outputs: Vec::new(),
        })
    }

    pub(crate) fn translate_update(&mut self, node: &PlanNode) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::Update {
            db_oid,
            table_oid,
            assignments,
        } = &node.op
        else {
            return Err(QueryError::Codegen("expected an update".into()));
        };
        let child = self.compile_node(&node.children[0])?;
        let mut ir_assignments = Vec::with_capacity(assignments.len());
        for (column_index, expr) in assignments {
            ir_assignments.push((*column_index, expression::translate(expr, &child.outputs)?));
        }
        let writer_slot = self.writer_slot(*db_oid, *table_oid);
        self.push_step(
            child.pipeline,
            PipelineStep::UpdateSink {
                writer_slot,
                assignments: ir_assignments,
            },
        );
        Ok(CompiledInput {
            pipeline: child.pipeline,
            outputs: Vec::new(),
        })
    }

    pub(crate) fn translate_delete(&mut self, node: &PlanNode) -> Result<CompiledInput, QueryError> {
        let PhysicalOp::Delete { db_oid, table_oid } = &node.op else {
            return Err(QueryError::Codegen("expected a delete".into()));
        };
        let child = self.compile_node(&node.children[0])?;
        let writer_slot = self.writer_slot(*db_oid, *table_oid);
        self.push_step(child.pipeline, PipelineStep::DeleteSink { writer_slot });
        Ok(CompiledInput {
            pipeline: child.pipeline,
            outputs: Vec::new(),
        })
    }

    fn writer_slot(&mut self, db_oid: quill_catalog::DatabaseOid, table_oid: TableOid) -> usize {
        self.alloc_object_slot(move |slot| StateInit::Writer {
            slot,
            db_oid,
            table_oid,
        })
    }

    fn table_schema(&self, table_oid: TableOid) -> Result<Arc<Schema>, QueryError> {
        self.accessor
            .get_schema(table_oid)
            .ok_or_else(|| QueryError::Codegen(format!("schema for {table_oid} vanished")))
    }
}

fn default_expr(column: &quill_catalog::Column) -> IrExpr {
    IrExpr::Constant {
        value: column.default().cloned().unwrap_or(SqlValue::Null),
    }
}
