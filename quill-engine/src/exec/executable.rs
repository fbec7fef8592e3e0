//! The compiled, runnable form of a query: an ordered list of fragments
//! over a shared query-state layout, plus the telemetry features recorded
//! at pipeline-prepare time.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::QueryError;
use crate::exec::context::ExecutionContext;
use crate::exec::interpreter;
use crate::exec::pipeline::Fragment;
use crate::exec::state::QueryState;
use crate::exec::telemetry::OperatingUnitFeature;
use crate::plan::PhysicalPlan;
use crate::settings::{ExecutionMode, ExecutionSettings};

static NEXT_QUERY_ID: AtomicU64 = AtomicU64::new(1);

pub struct ExecutableQuery {
    plan: Arc<PhysicalPlan>,
    settings: ExecutionSettings,
    fragments: Vec<Fragment>,
    query_state_size: usize,
    object_slots: usize,
    features: Vec<OperatingUnitFeature>,
    query_id: u64,
}

impl ExecutableQuery {
    pub(crate) fn new(
        plan: Arc<PhysicalPlan>,
        settings: ExecutionSettings,
        fragments: Vec<Fragment>,
        query_state_size: usize,
        object_slots: usize,
        features: Vec<OperatingUnitFeature>,
    ) -> Self {
        ExecutableQuery {
            plan,
            settings,
            fragments,
            query_state_size,
            object_slots,
            features,
            query_id: NEXT_QUERY_ID.fetch_add(1, Ordering::AcqRel),
        }
    }

    pub fn plan(&self) -> &Arc<PhysicalPlan> {
        &self.plan
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }

    pub fn query_state_size(&self) -> usize {
        self.query_state_size
    }

    pub fn features(&self) -> &[OperatingUnitFeature] {
        &self.features
    }

    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    /// Override the query id when replaying captured plans.
    pub fn set_query_id(&mut self, query_id: u64) {
        self.query_id = query_id;
    }

    /// Execute every fragment in order, invoking each function on the
    /// shared query state; teardown functions run in reverse declaration
    /// order even when a fragment fails.
    pub fn run(
        &self,
        ctx: &ExecutionContext<'_>,
        mode: ExecutionMode,
    ) -> Result<(), QueryError> {
        if mode != ExecutionMode::Interpret {
            // JIT target code generation is out of scope; the interpreter
            // executes every mode.
            debug!("query {} requested {mode:?}, interpreting", self.query_id);
        }
        let state = QueryState::new(self.query_state_size, self.object_slots);

        let mut result = Ok(());
        'fragments: for fragment in &self.fragments {
            for name in &fragment.functions {
                let Some(function) = fragment.module.get(name) else {
                    result = Err(QueryError::Codegen(format!(
                        "fragment references unknown function {name}"
                    )));
                    break 'fragments;
                };
                if let Err(e) = interpreter::run_function(function, ctx, &state) {
                    result = Err(e);
                    break 'fragments;
                }
            }
        }

        for fragment in self.fragments.iter().rev() {
            for name in fragment.teardowns.iter().rev() {
                if let Some(function) = fragment.module.get(name) {
                    if let Err(e) = interpreter::run_function(function, ctx, &state) {
                        debug!("teardown {name} failed: {e}");
                    }
                }
            }
        }
        result
    }
}

impl std::fmt::Debug for ExecutableQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableQuery")
            .field("query_id", &self.query_id)
            .field("fragments", &self.fragments.len())
            .field("query_state_size", &self.query_state_size)
            .finish()
    }
}
