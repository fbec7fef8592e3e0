//! Operating-unit features: one record per pipeline stage summarizing the
//! work it will do, recorded while pipelines are prepared and retained on
//! the executable for the self-driving collaborator.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatingUnitFeature {
    pub pipeline_id: usize,
    pub operator: String,
    pub estimated_rows: u64,
    pub key_size: u16,
    pub cardinality_estimate: u64,
}

impl OperatingUnitFeature {
    pub fn new(pipeline_id: usize, operator: impl Into<String>) -> Self {
        OperatingUnitFeature {
            pipeline_id,
            operator: operator.into(),
            estimated_rows: 0,
            key_size: 0,
            cardinality_estimate: 0,
        }
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.estimated_rows = rows;
        self.cardinality_estimate = rows;
        self
    }

    pub fn with_key_size(mut self, key_size: u16) -> Self {
        self.key_size = key_size;
        self
    }
}
