//! Compiled pipeline programs, modules and fragments: the operator half of
//! the typed IR. A pipeline is a maximal chain of non-materializing steps
//! fed by one source; materializing boundaries (hash builds, sorts, buffer
//! fills) end a pipeline and start a dependency.

use quill_catalog::{Column, ColumnOid, DatabaseOid, IndexColumn, IndexOid, NamespaceOid, TableOid};
use quill_storage::SqlTypeId;

use crate::binder::statement::JoinKind;
use crate::exec::filter::FilterManager;
use crate::exec::ir::{AggSpec, IrExpr};

/// Row sources. Scans read storage; the rest iterate materialized state
/// built by an upstream pipeline.
#[derive(Debug, Clone)]
pub enum SourceStep {
    SeqScan {
        db_oid: DatabaseOid,
        table_oid: TableOid,
        column_oids: Vec<ColumnOid>,
        filter: Option<FilterManager>,
    },
    IndexScan {
        db_oid: DatabaseOid,
        table_oid: TableOid,
        index_oid: IndexOid,
        column_oids: Vec<ColumnOid>,
        /// Inclusive key bounds, evaluated once per pipeline run.
        lo: Option<Vec<IrExpr>>,
        hi: Option<Vec<IrExpr>>,
        descending: bool,
        filter: Option<FilterManager>,
    },
    AggIter {
        slot: usize,
        having: Option<IrExpr>,
    },
    StaticAggRead {
        slot: usize,
        having: Option<IrExpr>,
    },
    SorterIter {
        slot: usize,
    },
    BufferIter {
        slot: usize,
    },
    /// Unmatched build rows of a left outer hash join, padded with nulls.
    UnmatchedBuildIter {
        slot: usize,
        probe_arity: usize,
    },
    Values {
        rows: Vec<Vec<IrExpr>>,
    },
    CsvScan {
        path: String,
        types: Vec<SqlTypeId>,
    },
}

/// Non-source pipeline steps. Sinks terminate the pipeline.
#[derive(Debug, Clone)]
pub enum PipelineStep {
    Filter {
        predicate: IrExpr,
    },
    Project {
        exprs: Vec<IrExpr>,
    },
    HashJoinBuild {
        slot: usize,
        keys: Vec<IrExpr>,
    },
    HashJoinProbe {
        slot: usize,
        keys: Vec<IrExpr>,
        kind: JoinKind,
        build_arity: usize,
        residual: Option<IrExpr>,
    },
    /// Block nested loop over a materialized inner buffer.
    NestedLoop {
        buffer_slot: usize,
        kind: JoinKind,
        condition: Option<IrExpr>,
        inner_arity: usize,
    },
    /// Per-row index lookup into the inner table.
    IndexJoin {
        db_oid: DatabaseOid,
        table_oid: TableOid,
        index_oid: IndexOid,
        keys: Vec<IrExpr>,
        column_oids: Vec<ColumnOid>,
    },
    AggBuild {
        slot: usize,
        group: Vec<IrExpr>,
        aggs: Vec<AggSpec>,
    },
    /// Streaming aggregation over sorted input; emits a group whenever the
    /// key changes and flushes the final group at pipeline finish.
    SortedAgg {
        slot: usize,
        group: Vec<IrExpr>,
        aggs: Vec<AggSpec>,
        having: Option<IrExpr>,
    },
    StaticAggBuild {
        slot: usize,
        aggs: Vec<AggSpec>,
    },
    SortBuild {
        slot: usize,
        keys: Vec<(IrExpr, bool)>,
    },
    BufferFill {
        slot: usize,
    },
    Limit {
        counter_offset: usize,
        limit: u64,
        offset: u64,
    },
    Output {
        arity: usize,
    },
    InsertSink {
        writer_slot: usize,
    },
    UpdateSink {
        writer_slot: usize,
        assignments: Vec<(usize, IrExpr)>,
    },
    DeleteSink {
        writer_slot: usize,
    },
}

impl PipelineStep {
    /// Sinks may not be crossed by parallel workers other than through
    /// their own synchronization.
    pub fn is_sink(&self) -> bool {
        matches!(
            self,
            PipelineStep::HashJoinBuild { .. }
                | PipelineStep::AggBuild { .. }
                | PipelineStep::StaticAggBuild { .. }
                | PipelineStep::SortBuild { .. }
                | PipelineStep::BufferFill { .. }
                | PipelineStep::Output { .. }
                | PipelineStep::InsertSink { .. }
                | PipelineStep::UpdateSink { .. }
                | PipelineStep::DeleteSink { .. }
        )
    }

    /// Serial-only steps reject parallel pipelines outright.
    pub fn is_serial_only(&self) -> bool {
        matches!(
            self,
            PipelineStep::InsertSink { .. }
                | PipelineStep::UpdateSink { .. }
                | PipelineStep::DeleteSink { .. }
                | PipelineStep::Limit { .. }
                | PipelineStep::SortedAgg { .. }
        )
    }
}

#[derive(Debug, Clone)]
pub struct PipelineProgram {
    pub id: usize,
    pub source: SourceStep,
    pub steps: Vec<PipelineStep>,
    pub parallel: bool,
}

/// State-slot construction performed by a fragment's Init function.
#[derive(Debug, Clone)]
pub enum StateInit {
    JoinTable {
        slot: usize,
    },
    AggTable {
        slot: usize,
    },
    StaticAgg {
        slot: usize,
        aggs: Vec<AggSpec>,
    },
    Sorter {
        slot: usize,
        limit: Option<usize>,
    },
    Buffer {
        slot: usize,
    },
    Run {
        slot: usize,
    },
    Writer {
        slot: usize,
        db_oid: DatabaseOid,
        table_oid: TableOid,
    },
}

/// DDL executed directly against the catalog accessor.
#[derive(Debug, Clone)]
pub enum DdlOp {
    CreateTable {
        namespace: NamespaceOid,
        name: String,
        columns: Vec<Column>,
        if_not_exists: bool,
    },
    CreateIndex {
        namespace: NamespaceOid,
        name: String,
        table_oid: TableOid,
        key_columns: Vec<IndexColumn>,
        unique: bool,
        if_not_exists: bool,
    },
    DropTable {
        table_oid: Option<TableOid>,
        if_exists: bool,
    },
    DropIndex {
        index_oid: Option<IndexOid>,
        if_exists: bool,
    },
}

#[derive(Debug, Clone)]
pub enum FunctionBody {
    InitState(Vec<StateInit>),
    PipelineWork(PipelineProgram),
    TearDown(Vec<usize>),
    Ddl(DdlOp),
}

/// A named function in a compiled module.
#[derive(Debug, Clone)]
pub struct IrFunction {
    pub name: String,
    pub body: FunctionBody,
}

#[derive(Debug, Clone, Default)]
pub struct Module {
    functions: Vec<IrFunction>,
}

impl Module {
    pub fn declare(&mut self, function: IrFunction) {
        self.functions.push(function);
    }

    pub fn get(&self, name: &str) -> Option<&IrFunction> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn function_names(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.name.as_str()).collect()
    }
}

/// A compiled fragment: a module plus the ordered entry points to invoke
/// and the teardown functions to run during query shutdown. The first
/// invoked function is the fragment's Init, the teardowns run last.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub module: Module,
    pub functions: Vec<String>,
    pub teardowns: Vec<String>,
}
