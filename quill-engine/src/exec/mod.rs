//! Execution: the typed IR, its interpreter, the query-state model and the
//! executable-query container.

mod context;
mod executable;
pub mod filter;
pub mod interpreter;
pub mod ir;
pub mod pipeline;
pub mod state;
mod telemetry;

pub use context::ExecutionContext;
pub use executable::ExecutableQuery;
pub use filter::{FilterClause, FilterManager, FilterOperand, FilterTerm};
pub use ir::{AggSpec, AggState, BuiltinFn, IrExpr};
pub use pipeline::{
    DdlOp, Fragment, FunctionBody, IrFunction, Module, PipelineProgram, PipelineStep, SourceStep,
    StateInit,
};
pub use state::QueryState;
pub use telemetry::OperatingUnitFeature;
