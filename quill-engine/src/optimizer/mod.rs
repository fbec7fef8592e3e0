//! Memo-based cost-driven plan search. `optimize` seeds a LIFO task stack
//! with the root group and required properties and iterates until the stack
//! drains or the task budget expires; on timeout the best complete plan
//! found so far wins, and the loop keeps going until at least one exists.

pub mod cost;
pub mod deriver;
pub mod memo;
mod plan_generator;
pub mod property;
pub mod rules;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use log::debug;

use quill_catalog::CatalogAccessor;

use crate::error::QueryError;
use crate::plan::{PhysicalOp, PhysicalPlan, PlanNode, TransformResult};

pub use cost::{CostModel, TrivialCostModel};
pub use memo::{BestPlanEntry, Group, GroupExprId, GroupExpression, GroupId, Memo, Operator};
pub use property::PropertySet;

use deriver::derive_properties;
use rules::{default_rules, Rule};

/// One frontier entry: a group optimized under one property requirement.
#[derive(Debug, Clone)]
struct OptimizationContext {
    group: GroupId,
    required: PropertySet,
}

enum Task {
    OptimizeGroup(OptimizationContext),
    OptimizeExpression {
        expr: GroupExprId,
        required: PropertySet,
    },
    ExploreGroup {
        group: GroupId,
    },
    ExploreExpression {
        expr: GroupExprId,
    },
    ApplyRule {
        rule: usize,
        expr: GroupExprId,
        required: PropertySet,
    },
    OptimizeInputs {
        expr: GroupExprId,
        required: PropertySet,
        alternative: usize,
        child: usize,
        waiting: bool,
    },
    AddEnforcer(OptimizationContext),
}

pub struct Optimizer {
    cost_model: Box<dyn CostModel>,
    rules: Vec<Box<dyn Rule>>,
    task_execution_timeout: Duration,
}

impl Optimizer {
    pub fn new(cost_model: Box<dyn CostModel>, task_execution_timeout_ms: u64) -> Self {
        Optimizer {
            cost_model,
            rules: default_rules(),
            task_execution_timeout: Duration::from_millis(task_execution_timeout_ms),
        }
    }

    /// Optimize a transformed statement: every CTE tree first (unordered),
    /// then the main tree under the root's required sort.
    pub fn optimize(
        &self,
        accessor: &CatalogAccessor,
        transformed: &TransformResult,
    ) -> Result<PhysicalPlan, QueryError> {
        let mut ctes = Vec::with_capacity(transformed.ctes.len());
        for cte in &transformed.ctes {
            ctes.push(self.optimize_tree(accessor, cte, PropertySet::empty())?);
        }
        let required = PropertySet::with_sort(transformed.required_sort.clone());
        let root = self.optimize_tree(accessor, &transformed.plan, required)?;
        Ok(PhysicalPlan { root, ctes })
    }

    fn optimize_tree(
        &self,
        accessor: &CatalogAccessor,
        plan: &crate::plan::LogicalPlan,
        required: PropertySet,
    ) -> Result<PlanNode, QueryError> {
        let mut memo = Memo::new();
        let root_group = memo.insert_plan(plan);
        self.execute_task_stack(&mut memo, root_group, &required, accessor);
        plan_generator::build_plan(&memo, root_group, &required, accessor).ok_or_else(|| {
            QueryError::Optimizer(format!(
                "no physical plan produced for {}",
                plan.op.name()
            ))
        })
    }

    /// Drive the task stack. The timeout is only honored once the root
    /// group has at least one complete plan for its requirement.
    fn execute_task_stack(
        &self,
        memo: &mut Memo,
        root_group: GroupId,
        root_required: &PropertySet,
        accessor: &CatalogAccessor,
    ) {
        let started = Instant::now();
        let mut scheduled: HashSet<(usize, String)> = HashSet::new();
        let mut stack = Vec::new();
        Self::schedule_group(
            &mut stack,
            &mut scheduled,
            OptimizationContext {
                group: root_group,
                required: root_required.clone(),
            },
        );

        let mut executed = 0usize;
        while let Some(task) = stack.pop() {
            if started.elapsed() > self.task_execution_timeout
                && memo.group(root_group).best_for(root_required).is_some()
            {
                debug!(
                    "optimizer timeout after {executed} tasks, emitting best plan found so far"
                );
                break;
            }
            executed += 1;
            self.execute_task(task, memo, &mut stack, &mut scheduled, accessor);
        }
        debug!(
            "optimizer finished: {executed} tasks, {} groups",
            memo.num_groups()
        );
    }

    fn schedule_group(
        stack: &mut Vec<Task>,
        scheduled: &mut HashSet<(usize, String)>,
        context: OptimizationContext,
    ) {
        let key = (context.group.0, context.required.key());
        if scheduled.insert(key) {
            stack.push(Task::OptimizeGroup(context));
        }
    }

    fn execute_task(
        &self,
        task: Task,
        memo: &mut Memo,
        stack: &mut Vec<Task>,
        scheduled: &mut HashSet<(usize, String)>,
        accessor: &CatalogAccessor,
    ) {
        match task {
            Task::OptimizeGroup(context) => {
                // The enforcer consideration runs after every expression of
                // this group has been costed (LIFO: pushed first, popped
                // last), and needs the unordered best as its input.
                stack.push(Task::AddEnforcer(context.clone()));
                if !context.required.is_empty() {
                    Self::schedule_group(
                        stack,
                        scheduled,
                        OptimizationContext {
                            group: context.group,
                            required: PropertySet::empty(),
                        },
                    );
                }
                let group = memo.group(context.group);
                for expr in group.physical_exprs.clone() {
                    stack.push(Task::OptimizeInputs {
                        expr,
                        required: context.required.clone(),
                        alternative: 0,
                        child: 0,
                        waiting: false,
                    });
                }
                for expr in group.logical_exprs.clone() {
                    stack.push(Task::OptimizeExpression {
                        expr,
                        required: context.required.clone(),
                    });
                }
            }

            Task::OptimizeExpression { expr, required } => {
                let children = memo.expr(expr).children.clone();
                for child in children {
                    if !memo.group(child).explored {
                        stack.push(Task::ExploreGroup { group: child });
                    }
                }
                // Implementation rules first in push order so transformation
                // rules pop (and rewrite) before implementations run.
                for (index, rule) in self.rules.iter().enumerate() {
                    if rule.is_transformation() {
                        continue;
                    }
                    self.push_rule(index, expr, &required, memo, stack);
                }
                for (index, rule) in self.rules.iter().enumerate() {
                    if !rule.is_transformation() {
                        continue;
                    }
                    self.push_rule(index, expr, &required, memo, stack);
                }
            }

            Task::ExploreGroup { group } => {
                if memo.group(group).explored {
                    return;
                }
                memo.group_mut(group).explored = true;
                for expr in memo.group(group).logical_exprs.clone() {
                    stack.push(Task::ExploreExpression { expr });
                }
            }

            Task::ExploreExpression { expr } => {
                for (index, rule) in self.rules.iter().enumerate() {
                    if rule.is_transformation() {
                        self.push_rule(index, expr, &PropertySet::empty(), memo, stack);
                    }
                }
            }

            Task::ApplyRule {
                rule,
                expr,
                required,
            } => {
                if memo.expr(expr).rules_applied.contains(&rule) {
                    return;
                }
                memo.expr_mut(expr).rules_applied.insert(rule);
                let (op, children, group) = {
                    let e = memo.expr(expr);
                    (e.op.clone(), e.children.clone(), e.group)
                };
                let rule_ref = &self.rules[rule];
                if !rule_ref.matches(&op, &children, memo) {
                    return;
                }
                for (new_op, new_children) in rule_ref.apply(&op, &children, memo, accessor) {
                    let is_logical = matches!(new_op, Operator::Logical(_));
                    let (new_expr, inserted) = memo.insert(new_op, new_children, Some(group));
                    if !inserted {
                        continue;
                    }
                    if is_logical {
                        stack.push(Task::OptimizeExpression {
                            expr: new_expr,
                            required: required.clone(),
                        });
                    } else {
                        stack.push(Task::OptimizeInputs {
                            expr: new_expr,
                            required: required.clone(),
                            alternative: 0,
                            child: 0,
                            waiting: false,
                        });
                    }
                }
            }

            Task::OptimizeInputs {
                expr,
                required,
                alternative,
                child,
                waiting,
            } => {
                self.optimize_inputs(
                    expr,
                    required,
                    alternative,
                    child,
                    waiting,
                    memo,
                    stack,
                    scheduled,
                    accessor,
                );
            }

            Task::AddEnforcer(context) => {
                if context.required.is_empty() {
                    return;
                }
                let Some(base) = memo.group(context.group).best_for(&PropertySet::empty()) else {
                    return;
                };
                let base_cost = base.cost;
                let sort_op = PhysicalOp::Sort {
                    sort_keys: context.required.sort_keys.clone(),
                };
                let cost = self.cost_model.compute_cost(
                    &sort_op,
                    &context.required,
                    &[base_cost],
                    accessor,
                );
                memo.update_best(
                    context.group,
                    &context.required,
                    BestPlanEntry {
                        cost,
                        expr: None,
                        child_properties: Vec::new(),
                        enforcer_sort: Some(context.required.sort_keys.clone()),
                    },
                );
            }
        }
    }

    fn push_rule(
        &self,
        rule: usize,
        expr: GroupExprId,
        required: &PropertySet,
        memo: &Memo,
        stack: &mut Vec<Task>,
    ) {
        let e = memo.expr(expr);
        if e.rules_applied.contains(&rule) {
            return;
        }
        if self.rules[rule].matches(&e.op, &e.children, memo) {
            stack.push(Task::ApplyRule {
                rule,
                expr,
                required: required.clone(),
            });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn optimize_inputs(
        &self,
        expr_id: GroupExprId,
        required: PropertySet,
        mut alternative: usize,
        mut child_start: usize,
        mut waiting: bool,
        memo: &mut Memo,
        stack: &mut Vec<Task>,
        scheduled: &mut HashSet<(usize, String)>,
        accessor: &CatalogAccessor,
    ) {
        let (op, children, group) = {
            let e = memo.expr(expr_id);
            let Some(op) = e.op.physical().cloned() else {
                return;
            };
            (op, e.children.clone(), e.group)
        };
        let alternatives = derive_properties(&op, &required, &children, memo, accessor);

        while alternative < alternatives.len() {
            let (provided, child_requirements) = &alternatives[alternative];
            if !required.satisfied_by(provided) {
                alternative += 1;
                child_start = 0;
                waiting = false;
                continue;
            }

            let mut child_costs = Vec::with_capacity(children.len());
            let mut missing = None;
            for (index, (child_group, child_required)) in
                children.iter().zip(child_requirements).enumerate()
            {
                match memo.group(*child_group).best_for(child_required) {
                    Some(entry) => child_costs.push(entry.cost),
                    None => {
                        missing = Some((index, *child_group, child_required.clone()));
                        break;
                    }
                }
            }

            if let Some((index, child_group, child_required)) = missing {
                if waiting && index <= child_start {
                    // The child could not produce the requirement; this
                    // alternative is a dead end.
                    alternative += 1;
                    child_start = 0;
                    waiting = false;
                    continue;
                }
                stack.push(Task::OptimizeInputs {
                    expr: expr_id,
                    required: required.clone(),
                    alternative,
                    child: index,
                    waiting: true,
                });
                Self::schedule_group(
                    stack,
                    scheduled,
                    OptimizationContext {
                        group: child_group,
                        required: child_required,
                    },
                );
                return;
            }

            let total = self
                .cost_model
                .compute_cost(&op, provided, &child_costs, accessor);
            memo.update_best(
                group,
                &required,
                BestPlanEntry {
                    cost: total,
                    expr: Some(expr_id),
                    child_properties: child_requirements.clone(),
                    enforcer_sort: None,
                },
            );
            // A stronger provided set also satisfies weaker frontiers that
            // may be visited later.
            if provided != &required {
                memo.update_best(
                    group,
                    provided,
                    BestPlanEntry {
                        cost: total,
                        expr: Some(expr_id),
                        child_properties: child_requirements.clone(),
                        enforcer_sort: None,
                    },
                );
            }
            alternative += 1;
            child_start = 0;
            waiting = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::expr::{BoundExpr, ColumnValueExpr, ComparisonOp};
    use crate::plan::{LogicalOp, LogicalPlan};
    use quill_catalog::{Catalog, Column, Schema, TableOid};
    use quill_storage::{SqlTypeId, TransactionManager};
    use std::sync::Arc;

    struct Fixture {
        _txn_manager: Arc<TransactionManager>,
        accessor: quill_catalog::CatalogAccessor,
        a: TableOid,
        b: TableOid,
    }

    fn fixture() -> Fixture {
        let txn_manager = Arc::new(TransactionManager::new());
        let catalog = Arc::new(Catalog::new(Arc::clone(&txn_manager)));
        let boot = txn_manager.begin();
        let db = catalog.create_database(&boot, "opt_test").unwrap();
        let dbc = catalog.get_database_catalog(db).unwrap();
        let ns = quill_catalog::postgres::DEFAULT_NAMESPACE_OID;
        let a = dbc
            .create_table(
                &boot,
                ns,
                "a",
                Schema::new(vec![Column::new("x", SqlTypeId::Integer, false)]),
            )
            .unwrap();
        let b = dbc
            .create_table(
                &boot,
                ns,
                "b",
                Schema::new(vec![Column::new("y", SqlTypeId::Integer, false)]),
            )
            .unwrap();
        txn_manager.commit(&boot);
        let txn = txn_manager.begin();
        let accessor = catalog.accessor(db, txn).unwrap();
        Fixture {
            _txn_manager: txn_manager,
            accessor,
            a,
            b,
        }
    }

    fn column(
        fixture: &Fixture,
        table: TableOid,
        alias: &str,
        name: &str,
    ) -> BoundExpr {
        let schema = fixture.accessor.get_schema(table).unwrap();
        let column = schema.find_column(name).unwrap().1;
        BoundExpr::ColumnValue(ColumnValueExpr {
            db_oid: fixture.accessor.db_oid(),
            table_oid: table,
            column_oid: column.oid(),
            type_id: column.type_id(),
            depth: 0,
            table_alias: alias.to_string(),
            column_name: name.to_string(),
        })
    }

    fn get_op(fixture: &Fixture, table: TableOid, alias: &str) -> LogicalPlan {
        LogicalPlan::leaf(LogicalOp::Get {
            db_oid: fixture.accessor.db_oid(),
            table_oid: table,
            alias: alias.to_string(),
            predicates: vec![],
        })
    }

    fn join_condition(fixture: &Fixture) -> BoundExpr {
        BoundExpr::Comparison {
            op: ComparisonOp::Eq,
            left: Box::new(column(fixture, fixture.a, "a", "x")),
            right: Box::new(column(fixture, fixture.b, "b", "y")),
        }
    }

    fn optimize_one(fixture: &Fixture, plan: LogicalPlan) -> crate::plan::PlanNode {
        let optimizer = Optimizer::new(Box::<TrivialCostModel>::default(), 5000);
        optimizer
            .optimize_tree(&fixture.accessor, &plan, PropertySet::empty())
            .unwrap()
    }

    #[test]
    fn subquery_joins_unnest_into_standard_joins() {
        let fixture = fixture();
        let makes: [fn(Option<BoundExpr>) -> LogicalOp; 3] = [
            |c| LogicalOp::MarkJoin { condition: c },
            |c| LogicalOp::SingleJoin { condition: c },
            |c| LogicalOp::DependentJoin { condition: c },
        ];
        for make in makes {
            let plan = LogicalPlan::binary(
                make(Some(join_condition(&fixture))),
                get_op(&fixture, fixture.a, "a"),
                get_op(&fixture, fixture.b, "b"),
            );
            let physical = optimize_one(&fixture, plan);
            assert!(
                matches!(
                    physical.op,
                    PhysicalOp::HashJoin { .. }
                        | PhysicalOp::NestedLoopJoin { .. }
                        | PhysicalOp::IndexNestedLoopJoin { .. }
                ),
                "{:?}",
                physical.op
            );
        }
    }

    #[test]
    fn equi_joins_prefer_the_hash_implementation() {
        let fixture = fixture();
        let plan = LogicalPlan::binary(
            LogicalOp::InnerJoin {
                condition: Some(join_condition(&fixture)),
            },
            get_op(&fixture, fixture.a, "a"),
            get_op(&fixture, fixture.b, "b"),
        );
        let physical = optimize_one(&fixture, plan);
        assert!(matches!(physical.op, PhysicalOp::HashJoin { .. }));
    }

    #[test]
    fn filters_push_into_scans() {
        let fixture = fixture();
        let predicate = BoundExpr::Comparison {
            op: ComparisonOp::Lt,
            left: Box::new(column(&fixture, fixture.a, "a", "x")),
            right: Box::new(BoundExpr::Constant {
                value: quill_storage::SqlValue::Integer(5),
                type_id: SqlTypeId::Integer,
            }),
        };
        let plan = LogicalPlan::unary(
            LogicalOp::Filter {
                predicates: vec![predicate],
            },
            get_op(&fixture, fixture.a, "a"),
        );
        let physical = optimize_one(&fixture, plan);
        match &physical.op {
            PhysicalOp::SeqScan { predicates, .. } => assert_eq!(predicates.len(), 1),
            other => panic!("expected a filtered scan, got {other:?}"),
        }
    }

    #[test]
    fn expired_budget_still_emits_a_complete_plan() {
        let fixture = fixture();
        let optimizer = Optimizer::new(Box::<TrivialCostModel>::default(), 0);
        let plan = LogicalPlan::unary(
            LogicalOp::Projection {
                exprs: vec![column(&fixture, fixture.a, "a", "x")],
                names: vec!["x".into()],
            },
            get_op(&fixture, fixture.a, "a"),
        );
        let physical = optimizer
            .optimize_tree(&fixture.accessor, &plan, PropertySet::empty())
            .unwrap();
        assert!(matches!(physical.op, PhysicalOp::Projection { .. }));
    }

    #[test]
    fn sort_requirements_produce_an_enforcer_when_no_index_helps() {
        let fixture = fixture();
        let required = PropertySet::with_sort(vec![crate::plan::SortKey {
            expr: column(&fixture, fixture.a, "a", "x"),
            descending: false,
        }]);
        let optimizer = Optimizer::new(Box::<TrivialCostModel>::default(), 5000);
        let physical = optimizer
            .optimize_tree(&fixture.accessor, &get_op(&fixture, fixture.a, "a"), required)
            .unwrap();
        assert!(matches!(physical.op, PhysicalOp::Sort { .. }), "{:?}", physical.op);
    }
}
