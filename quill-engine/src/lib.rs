//! The quill query engine: parser façade, binder, cost-based optimizer,
//! operator/expression translators and the typed-IR interpreter runtime.
//!
//! A statement flows parse → bind → transform → optimize → compile → run;
//! every stage is CPU-bound and synchronous. The wire protocol frontend
//! drives the stages and owns statement caching.

pub mod binder;
pub mod compiler;
mod error;
pub mod exec;
pub mod optimizer;
mod parser;
pub mod plan;
mod settings;

pub use error::{BinderError, QueryError, RuntimeError};
pub use parser::{classify, parse, ParseResult, QueryType};
pub use settings::{CompilationMode, ExecutionMode, ExecutionSettings};
