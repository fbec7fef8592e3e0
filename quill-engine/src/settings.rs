use getset::{CopyGetters, Setters};
use serde::{Deserialize, Serialize};

/// How the compiler packages pipelines into fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompilationMode {
    /// Compile every fragment up-front into one unit.
    OneShot,
    /// One fragment per pipeline, compiled lazily in dependency order.
    Interleaved,
}

/// How compiled fragments execute. JIT target code generation is out of
/// scope; `Jit` and `Adaptive` are accepted and run through the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Interpret,
    Jit,
    Adaptive,
}

/// Process-level execution settings, snapshotted per query. None of these
/// change observable query semantics, only timing and telemetry.
#[derive(Debug, Clone, CopyGetters, Setters, Serialize, Deserialize)]
#[getset(get_copy = "pub", set = "pub")]
pub struct ExecutionSettings {
    compilation_mode: CompilationMode,
    execution_mode: ExecutionMode,
    /// Optimizer task budget in milliseconds.
    optimizer_timeout_ms: u64,
    counters_enabled: bool,
    pipeline_metrics_enabled: bool,
    command_metrics_enabled: bool,
    parallel_execution: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        ExecutionSettings {
            compilation_mode: CompilationMode::OneShot,
            execution_mode: ExecutionMode::Interpret,
            optimizer_timeout_ms: 5000,
            counters_enabled: false,
            pipeline_metrics_enabled: false,
            command_metrics_enabled: false,
            parallel_execution: false,
        }
    }
}
