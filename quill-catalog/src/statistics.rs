use serde::{Deserialize, Serialize};

/// Per-column synopsis stored in `pg_statistic`. An absent entry is reported
/// as the zero stub, which the optimizer treats as "unknown".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ColumnStatistics {
    pub num_rows: u64,
    pub non_null_rows: u64,
    pub distinct_values: u64,
}

impl ColumnStatistics {
    pub fn is_stub(&self) -> bool {
        self.num_rows == 0
    }

    pub fn null_fraction(&self) -> f64 {
        if self.num_rows == 0 {
            0.0
        } else {
            1.0 - self.non_null_rows as f64 / self.num_rows as f64
        }
    }
}

/// Per-table aggregate over the column synopses.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TableStatistics {
    pub num_rows: u64,
    pub num_columns: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_statistics_report_unknown() {
        let stub = ColumnStatistics::default();
        assert!(stub.is_stub());
        assert_eq!(stub.null_fraction(), 0.0);
    }

    #[test]
    fn null_fraction_from_counts() {
        let stats = ColumnStatistics {
            num_rows: 10,
            non_null_rows: 8,
            distinct_values: 5,
        };
        assert!((stats.null_fraction() - 0.2).abs() < 1e-9);
    }
}
