//! Pluggable costing. The shipped model is deliberately trivial: constant
//! per-operator factors over estimated input cardinalities, enough to prefer
//! hash joins over nested loops and index-provided order over explicit
//! sorts. Production-quality coefficients are an extension point.

use quill_catalog::CatalogAccessor;

use crate::optimizer::property::PropertySet;
use crate::plan::PhysicalOp;

/// Row estimate assumed for tables without statistics.
const DEFAULT_TABLE_ROWS: f64 = 1000.0;

pub trait CostModel: Send + Sync {
    fn compute_cost(
        &self,
        op: &PhysicalOp,
        provided: &PropertySet,
        child_costs: &[f64],
        accessor: &CatalogAccessor,
    ) -> f64;
}

#[derive(Debug, Default)]
pub struct TrivialCostModel;

impl TrivialCostModel {
    fn table_rows(accessor: &CatalogAccessor, table_oid: quill_catalog::TableOid) -> f64 {
        let stats = accessor.get_table_statistics(table_oid);
        if stats.num_rows == 0 {
            DEFAULT_TABLE_ROWS
        } else {
            stats.num_rows as f64
        }
    }
}

impl CostModel for TrivialCostModel {
    fn compute_cost(
        &self,
        op: &PhysicalOp,
        _provided: &PropertySet,
        child_costs: &[f64],
        accessor: &CatalogAccessor,
    ) -> f64 {
        let children: f64 = child_costs.iter().sum();
        children
            + match op {
                PhysicalOp::SeqScan {
                    table_oid,
                    predicates,
                    ..
                } => {
                    let rows = Self::table_rows(accessor, *table_oid);
                    if predicates.is_empty() {
                        rows
                    } else {
                        // Selection at the scan shrinks everything
                        // downstream; cheaper than a detached filter.
                        rows * 0.9
                    }
                }
                PhysicalOp::IndexScan {
                    table_oid,
                    predicates,
                    ..
                } => {
                    let rows = Self::table_rows(accessor, *table_oid);
                    if predicates.is_empty() {
                        // Full index walk: ordered, but pays random lookups.
                        rows * 1.2
                    } else {
                        rows * 0.4
                    }
                }
                PhysicalOp::Filter { .. } => 0.2,
                PhysicalOp::Projection { .. } | PhysicalOp::Alias { .. } => 0.1,
                PhysicalOp::HashJoin { .. } => 2.0,
                PhysicalOp::NestedLoopJoin { .. } => {
                    let left = child_costs.first().copied().unwrap_or(1.0).max(1.0);
                    let right = child_costs.get(1).copied().unwrap_or(1.0).max(1.0);
                    2.0 + left * right * 0.01
                }
                PhysicalOp::IndexNestedLoopJoin { .. } => 1.5,
                PhysicalOp::HashAggregate { .. } => 1.5,
                PhysicalOp::SortAggregate { .. } => 0.8,
                PhysicalOp::StaticAggregate { .. } => 0.5,
                PhysicalOp::Sort { .. } => {
                    // The explicit enforcer should lose to an order-providing
                    // index when one exists.
                    children.max(1.0) * 0.4 + 2.0
                }
                PhysicalOp::Limit { .. } => 0.1,
                PhysicalOp::Values { .. } => 0.1,
                PhysicalOp::Insert { .. }
                | PhysicalOp::InsertSelect { .. }
                | PhysicalOp::Update { .. }
                | PhysicalOp::Delete { .. } => 1.0,
                PhysicalOp::CteScan { .. } => 1.0,
                PhysicalOp::CsvScan { .. } => DEFAULT_TABLE_ROWS,
                PhysicalOp::CreateTable { .. }
                | PhysicalOp::CreateIndex { .. }
                | PhysicalOp::DropTable { .. }
                | PhysicalOp::DropIndex { .. } => 1.0,
            }
    }
}
