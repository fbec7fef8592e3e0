//! The optimizer's memo: groups of equivalent expressions, deduplicated by
//! content hash over `(operator, child groups)`.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

use crate::binder::expr::ColumnValueExpr;
use crate::optimizer::property::PropertySet;
use crate::plan::{LogicalOp, LogicalPlan, PhysicalOp, SortKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupExprId(pub usize);

/// A logical or physical operator inside the memo.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Operator {
    Logical(LogicalOp),
    Physical(PhysicalOp),
}

impl Operator {
    pub fn logical(&self) -> Option<&LogicalOp> {
        match self {
            Operator::Logical(op) => Some(op),
            Operator::Physical(_) => None,
        }
    }

    pub fn physical(&self) -> Option<&PhysicalOp> {
        match self {
            Operator::Physical(op) => Some(op),
            Operator::Logical(_) => None,
        }
    }
}

#[derive(Debug)]
pub struct GroupExpression {
    pub id: GroupExprId,
    pub group: GroupId,
    pub op: Operator,
    pub children: Vec<GroupId>,
    /// Rule indexes already applied to this expression.
    pub rules_applied: HashSet<usize>,
}

/// Lowest-cost implementation of a group under one property requirement.
#[derive(Debug, Clone)]
pub struct BestPlanEntry {
    pub cost: f64,
    /// The winning expression, or `None` when the entry is an enforcer over
    /// the group's unordered best plan.
    pub expr: Option<GroupExprId>,
    pub child_properties: Vec<PropertySet>,
    pub enforcer_sort: Option<Vec<SortKey>>,
}

#[derive(Debug, Default)]
pub struct Group {
    pub logical_exprs: Vec<GroupExprId>,
    pub physical_exprs: Vec<GroupExprId>,
    pub best: HashMap<String, BestPlanEntry>,
    pub explored: bool,
}

impl Group {
    pub fn best_for(&self, required: &PropertySet) -> Option<&BestPlanEntry> {
        self.best.get(&required.key())
    }
}

#[derive(Debug, Default)]
pub struct Memo {
    groups: Vec<Group>,
    exprs: Vec<GroupExpression>,
    dedup: HashMap<String, GroupExprId>,
}

impl Memo {
    pub fn new() -> Self {
        Memo::default()
    }

    pub fn group(&self, id: GroupId) -> &Group {
        &self.groups[id.0]
    }

    pub fn group_mut(&mut self, id: GroupId) -> &mut Group {
        &mut self.groups[id.0]
    }

    pub fn expr(&self, id: GroupExprId) -> &GroupExpression {
        &self.exprs[id.0]
    }

    pub fn expr_mut(&mut self, id: GroupExprId) -> &mut GroupExpression {
        &mut self.exprs[id.0]
    }

    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    /// Insert an expression, deduplicating on `(operator, children)`.
    /// Returns the expression id and whether it was newly inserted.
    pub fn insert(
        &mut self,
        op: Operator,
        children: Vec<GroupId>,
        target: Option<GroupId>,
    ) -> (GroupExprId, bool) {
        let key = serde_json::to_string(&(
            &op,
            children.iter().map(|c| c.0).collect::<Vec<_>>(),
        ))
        .expect("operators are serializable");
        if let Some(existing) = self.dedup.get(&key) {
            return (*existing, false);
        }

        let group = target.unwrap_or_else(|| {
            self.groups.push(Group::default());
            GroupId(self.groups.len() - 1)
        });
        let id = GroupExprId(self.exprs.len());
        let is_physical = matches!(op, Operator::Physical(_));
        self.exprs.push(GroupExpression {
            id,
            group,
            op,
            children,
            rules_applied: HashSet::new(),
        });
        if is_physical {
            self.groups[group.0].physical_exprs.push(id);
        } else {
            self.groups[group.0].logical_exprs.push(id);
        }
        self.dedup.insert(key, id);
        (id, true)
    }

    /// Copy a logical plan tree into the memo, returning its root group.
    pub fn insert_plan(&mut self, plan: &LogicalPlan) -> GroupId {
        let children: Vec<GroupId> = plan
            .children
            .iter()
            .map(|child| self.insert_plan(child))
            .collect();
        let (expr, _) = self.insert(Operator::Logical(plan.op.clone()), children, None);
        self.expr(expr).group
    }

    /// The original logical operator a group was created from.
    pub fn leader(&self, group: GroupId) -> Option<&LogicalOp> {
        self.group(group)
            .logical_exprs
            .first()
            .and_then(|id| self.expr(*id).op.logical())
    }

    /// Table aliases produced under a group, derived from its leader chain.
    /// Drives join-side analysis for hash-join keys and sort pass-through.
    pub fn aliases(&self, group: GroupId) -> HashSet<String> {
        let mut out = HashSet::new();
        self.collect_aliases(group, &mut out);
        out
    }

    fn collect_aliases(&self, group: GroupId, out: &mut HashSet<String>) {
        let Some(leader_id) = self.group(group).logical_exprs.first() else {
            return;
        };
        let expr = self.expr(*leader_id);
        match &expr.op {
            Operator::Logical(LogicalOp::Get { alias, .. })
            | Operator::Logical(LogicalOp::Alias { alias, .. })
            | Operator::Logical(LogicalOp::CteScan { alias, .. }) => {
                out.insert(alias.to_lowercase());
            }
            _ => {
                for child in expr.children.clone() {
                    self.collect_aliases(child, out);
                }
            }
        }
    }

    /// True when every column referenced by `keys` binds to one of
    /// `aliases`.
    pub fn columns_within(keys: &[&ColumnValueExpr], aliases: &HashSet<String>) -> bool {
        keys.iter()
            .all(|c| aliases.contains(&c.table_alias.to_lowercase()))
    }

    pub fn update_best(
        &mut self,
        group: GroupId,
        required: &PropertySet,
        entry: BestPlanEntry,
    ) -> bool {
        let best = &mut self.group_mut(group).best;
        let key = required.key();
        match best.get(&key) {
            Some(existing) if existing.cost <= entry.cost => false,
            _ => {
                best.insert(key, entry);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_catalog::{DatabaseOid, TableOid};

    fn get_op(alias: &str) -> LogicalOp {
        LogicalOp::Get {
            db_oid: DatabaseOid(1),
            table_oid: TableOid(7),
            alias: alias.into(),
            predicates: vec![],
        }
    }

    #[test]
    fn identical_expressions_deduplicate() {
        let mut memo = Memo::new();
        let (a, inserted_a) = memo.insert(Operator::Logical(get_op("t")), vec![], None);
        let (b, inserted_b) = memo.insert(Operator::Logical(get_op("t")), vec![], None);
        assert!(inserted_a);
        assert!(!inserted_b);
        assert_eq!(a, b);
        assert_eq!(memo.num_groups(), 1);
    }

    #[test]
    fn plan_copy_in_builds_group_tree() {
        let mut memo = Memo::new();
        let plan = LogicalPlan::unary(
            LogicalOp::Filter { predicates: vec![] },
            LogicalPlan::leaf(get_op("t")),
        );
        let root = memo.insert_plan(&plan);
        assert_eq!(memo.num_groups(), 2);
        assert!(matches!(
            memo.leader(root),
            Some(LogicalOp::Filter { .. })
        ));
        let aliases = memo.aliases(root);
        assert!(aliases.contains("t"));
    }
}
