//! Filter managers. A predicate in disjunctive normal form becomes one
//! clause per top-level disjunct; consecutive conjunctions stay in the same
//! clause. Column-versus-literal and column-versus-parameter comparisons
//! lower to the vectorized filter builtin, everything else to a generic
//! per-tuple evaluator.

use serde::{Deserialize, Serialize};

use quill_storage::SqlValue;

use crate::binder::expr::{ComparisonOp, ConjunctionOp};
use crate::error::QueryError;
use crate::exec::ir::IrExpr;

/// Right-hand side of a vectorized term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterOperand {
    Literal(SqlValue),
    Parameter(usize),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterTerm {
    /// `column <op> literal|parameter`, evaluated by the vectorized
    /// comparison builtin.
    Vectorized {
        slot: usize,
        cmp: ComparisonOp,
        operand: FilterOperand,
    },
    /// Anything else: a per-tuple IR evaluation.
    Generic(IrExpr),
}

impl FilterTerm {
    fn matches(&self, row: &[SqlValue], params: &[SqlValue]) -> Result<bool, QueryError> {
        match self {
            FilterTerm::Vectorized { slot, cmp, operand } => {
                let left = row.get(*slot).cloned().unwrap_or(SqlValue::Null);
                let right = match operand {
                    FilterOperand::Literal(value) => value.clone(),
                    FilterOperand::Parameter(index) => params
                        .get(*index)
                        .cloned()
                        .ok_or(crate::error::RuntimeError::UnboundParameter(index + 1))?,
                };
                Ok(match left.compare(&right) {
                    None => false,
                    Some(ordering) => match cmp {
                        ComparisonOp::Eq => ordering.is_eq(),
                        ComparisonOp::NotEq => !ordering.is_eq(),
                        ComparisonOp::Lt => ordering.is_lt(),
                        ComparisonOp::LtEq => ordering.is_le(),
                        ComparisonOp::Gt => ordering.is_gt(),
                        ComparisonOp::GtEq => ordering.is_ge(),
                    },
                })
            }
            FilterTerm::Generic(expr) => expr.eval_predicate(row, params),
        }
    }
}

/// One conjunctive clause of the DNF.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FilterClause {
    pub terms: Vec<FilterTerm>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FilterManager {
    pub clauses: Vec<FilterClause>,
}

impl FilterManager {
    /// Build a filter manager from an already-slot-resolved predicate.
    /// A literal on the left of a mixed comparison is rejected.
    pub fn build(predicate: &IrExpr) -> Result<FilterManager, QueryError> {
        let disjuncts = split_disjuncts(predicate);
        let mut clauses = Vec::with_capacity(disjuncts.len());
        for disjunct in disjuncts {
            let mut clause = FilterClause::default();
            for term in split_conjuncts(disjunct) {
                clause.terms.push(lower_term(term)?);
            }
            clauses.push(clause);
        }
        Ok(FilterManager { clauses })
    }

    /// A row passes when any clause has every term true.
    pub fn matches(&self, row: &[SqlValue], params: &[SqlValue]) -> Result<bool, QueryError> {
        if self.clauses.is_empty() {
            return Ok(true);
        }
        'clauses: for clause in &self.clauses {
            for term in &clause.terms {
                if !term.matches(row, params)? {
                    continue 'clauses;
                }
            }
            return Ok(true);
        }
        Ok(false)
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }
}

fn split_disjuncts(expr: &IrExpr) -> Vec<&IrExpr> {
    match expr {
        IrExpr::Conjunction {
            conj: ConjunctionOp::Or,
            children,
        } => children.iter().flat_map(split_disjuncts).collect(),
        other => vec![other],
    }
}

fn split_conjuncts(expr: &IrExpr) -> Vec<&IrExpr> {
    match expr {
        IrExpr::Conjunction {
            conj: ConjunctionOp::And,
            children,
        } => children.iter().flat_map(split_conjuncts).collect(),
        other => vec![other],
    }
}

fn lower_term(expr: &IrExpr) -> Result<FilterTerm, QueryError> {
    if let IrExpr::Compare { cmp, left, right } = expr {
        match (left.as_ref(), right.as_ref()) {
            (IrExpr::Slot { index, .. }, IrExpr::Constant { value }) => {
                return Ok(FilterTerm::Vectorized {
                    slot: *index,
                    cmp: *cmp,
                    operand: FilterOperand::Literal(value.clone()),
                });
            }
            (IrExpr::Slot { index, .. }, IrExpr::Param { index: param, .. }) => {
                return Ok(FilterTerm::Vectorized {
                    slot: *index,
                    cmp: *cmp,
                    operand: FilterOperand::Parameter(*param),
                });
            }
            (IrExpr::Constant { .. }, IrExpr::Slot { .. })
            | (IrExpr::Param { .. }, IrExpr::Slot { .. }) => {
                return Err(QueryError::NotImplemented(
                    "literal on the left-hand side of a scan predicate".to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(FilterTerm::Generic(expr.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_storage::SqlTypeId;

    fn slot(i: usize) -> IrExpr {
        IrExpr::Slot {
            index: i,
            type_id: SqlTypeId::Integer,
        }
    }

    fn lit(v: i32) -> IrExpr {
        IrExpr::Constant {
            value: SqlValue::Integer(v),
        }
    }

    fn cmp(op: ComparisonOp, l: IrExpr, r: IrExpr) -> IrExpr {
        IrExpr::Compare {
            cmp: op,
            left: Box::new(l),
            right: Box::new(r),
        }
    }

    #[test]
    fn one_clause_per_disjunct() {
        let predicate = IrExpr::Conjunction {
            conj: ConjunctionOp::Or,
            children: vec![
                IrExpr::Conjunction {
                    conj: ConjunctionOp::And,
                    children: vec![
                        cmp(ComparisonOp::Gt, slot(0), lit(1)),
                        cmp(ComparisonOp::Lt, slot(0), lit(10)),
                    ],
                },
                cmp(ComparisonOp::Eq, slot(1), lit(0)),
            ],
        };
        let manager = FilterManager::build(&predicate).unwrap();
        assert_eq!(manager.clauses.len(), 2);
        assert_eq!(manager.clauses[0].terms.len(), 2);
        assert!(manager
            .clauses
            .iter()
            .flat_map(|c| &c.terms)
            .all(|t| matches!(t, FilterTerm::Vectorized { .. })));

        let row = vec![SqlValue::Integer(5), SqlValue::Integer(7)];
        assert!(manager.matches(&row, &[]).unwrap());
        let miss = vec![SqlValue::Integer(50), SqlValue::Integer(7)];
        assert!(!manager.matches(&miss, &[]).unwrap());
    }

    #[test]
    fn literal_on_the_left_is_rejected() {
        let predicate = cmp(ComparisonOp::Lt, lit(5), slot(0));
        let err = FilterManager::build(&predicate).unwrap_err();
        assert!(matches!(err, QueryError::NotImplemented(_)));
    }

    #[test]
    fn non_simple_terms_become_generic() {
        let predicate = cmp(
            ComparisonOp::Eq,
            IrExpr::Arithmetic {
                arith: crate::binder::expr::ArithmeticOp::Add,
                left: Box::new(slot(0)),
                right: Box::new(lit(1)),
                type_id: SqlTypeId::Integer,
            },
            lit(3),
        );
        let manager = FilterManager::build(&predicate).unwrap();
        assert!(matches!(
            manager.clauses[0].terms[0],
            FilterTerm::Generic(_)
        ));
        assert!(manager
            .matches(&[SqlValue::Integer(2)], &[])
            .unwrap());
    }

    #[test]
    fn parameter_comparisons_vectorize() {
        let predicate = cmp(
            ComparisonOp::Eq,
            slot(0),
            IrExpr::Param {
                index: 0,
                type_id: SqlTypeId::Integer,
            },
        );
        let manager = FilterManager::build(&predicate).unwrap();
        assert!(matches!(
            manager.clauses[0].terms[0],
            FilterTerm::Vectorized {
                operand: FilterOperand::Parameter(0),
                ..
            }
        ));
        assert!(manager
            .matches(&[SqlValue::Integer(42)], &[SqlValue::Integer(42)])
            .unwrap());
    }
}
