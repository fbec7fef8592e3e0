//! Per-execution context: the transaction-scoped catalog accessor, bound
//! parameter values, the settings snapshot, the output buffer and the DML
//! rows-affected counter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use quill_catalog::CatalogAccessor;
use quill_storage::SqlValue;

use crate::settings::ExecutionSettings;

pub struct ExecutionContext<'a> {
    accessor: &'a CatalogAccessor,
    params: Vec<SqlValue>,
    settings: ExecutionSettings,
    output: Mutex<Vec<Vec<SqlValue>>>,
    rows_affected: AtomicU64,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(
        accessor: &'a CatalogAccessor,
        params: Vec<SqlValue>,
        settings: ExecutionSettings,
    ) -> Self {
        ExecutionContext {
            accessor,
            params,
            settings,
            output: Mutex::new(Vec::new()),
            rows_affected: AtomicU64::new(0),
        }
    }

    pub fn accessor(&self) -> &CatalogAccessor {
        self.accessor
    }

    pub fn params(&self) -> &[SqlValue] {
        &self.params
    }

    pub fn settings(&self) -> &ExecutionSettings {
        &self.settings
    }

    pub fn push_output(&self, row: Vec<SqlValue>) {
        self.output.lock().unwrap().push(row);
    }

    pub fn take_output(&self) -> Vec<Vec<SqlValue>> {
        std::mem::take(&mut *self.output.lock().unwrap())
    }

    pub fn add_rows_affected(&self, n: u64) {
        self.rows_affected.fetch_add(n, Ordering::AcqRel);
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected.load(Ordering::Acquire)
    }
}
