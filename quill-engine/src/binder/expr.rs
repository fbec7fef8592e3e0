//! Resolved expression trees. One variant per expression kind; visitors are
//! exhaustive matches and JSON round-trips through the `expr_type` tag.

use serde::{Deserialize, Serialize};

use quill_catalog::{ColumnOid, DatabaseOid, ProcOid, TableOid};
use quill_storage::{SqlTypeId, SqlValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComparisonOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl ComparisonOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOp::Eq => "=",
            ComparisonOp::NotEq => "<>",
            ComparisonOp::Lt => "<",
            ComparisonOp::LtEq => "<=",
            ComparisonOp::Gt => ">",
            ComparisonOp::GtEq => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConjunctionOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Minus,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggKind {
    CountStar,
    Count,
    Sum,
    Min,
    Max,
    Avg,
}

impl AggKind {
    pub fn name(&self) -> &'static str {
        match self {
            AggKind::CountStar | AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Min => "min",
            AggKind::Max => "max",
            AggKind::Avg => "avg",
        }
    }
}

/// A column resolved against the catalog: the `(db, table, column)` triple,
/// the declared type and the lexical scope depth it resolved at. Virtual
/// columns (subquery and CTE outputs) carry invalid OIDs and resolve by
/// `(table_alias, column_name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnValueExpr {
    pub db_oid: DatabaseOid,
    pub table_oid: TableOid,
    pub column_oid: ColumnOid,
    pub type_id: SqlTypeId,
    pub depth: u32,
    pub table_alias: String,
    pub column_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionExpr {
    pub name: String,
    pub proc_oid: ProcOid,
    pub args: Vec<BoundExpr>,
    pub type_id: SqlTypeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateExpr {
    pub kind: AggKind,
    pub arg: Option<Box<BoundExpr>>,
    pub distinct: bool,
    pub type_id: SqlTypeId,
}

/// A bound expression. The `expr_type` tag is the node-type discriminant in
/// the JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "expr_type")]
pub enum BoundExpr {
    ColumnValue(ColumnValueExpr),
    Constant {
        value: SqlValue,
        type_id: SqlTypeId,
    },
    Parameter {
        index: usize,
        type_id: SqlTypeId,
    },
    Comparison {
        op: ComparisonOp,
        left: Box<BoundExpr>,
        right: Box<BoundExpr>,
    },
    Conjunction {
        op: ConjunctionOp,
        children: Vec<BoundExpr>,
    },
    Arithmetic {
        op: ArithmeticOp,
        left: Box<BoundExpr>,
        right: Box<BoundExpr>,
        type_id: SqlTypeId,
    },
    Unary {
        op: UnaryOp,
        child: Box<BoundExpr>,
        type_id: SqlTypeId,
    },
    NullCheck {
        negated: bool,
        child: Box<BoundExpr>,
    },
    Function(FunctionExpr),
    Aggregate(AggregateExpr),
    /// Reference to a select-list item by position, used above aggregation
    /// boundaries and for ORDER BY ordinals/aliases.
    Derived {
        index: usize,
        type_id: SqlTypeId,
    },
    Star,
}

impl BoundExpr {
    pub fn type_id(&self) -> SqlTypeId {
        match self {
            BoundExpr::ColumnValue(c) => c.type_id,
            BoundExpr::Constant { type_id, .. } => *type_id,
            BoundExpr::Parameter { type_id, .. } => *type_id,
            BoundExpr::Comparison { .. } => SqlTypeId::Boolean,
            BoundExpr::Conjunction { .. } => SqlTypeId::Boolean,
            BoundExpr::Arithmetic { type_id, .. } => *type_id,
            BoundExpr::Unary { type_id, .. } => *type_id,
            BoundExpr::NullCheck { .. } => SqlTypeId::Boolean,
            BoundExpr::Function(f) => f.type_id,
            BoundExpr::Aggregate(a) => a.type_id,
            BoundExpr::Derived { type_id, .. } => *type_id,
            BoundExpr::Star => SqlTypeId::Invalid,
        }
    }

    pub fn is_constant(&self) -> bool {
        matches!(self, BoundExpr::Constant { .. })
    }

    pub fn has_aggregate(&self) -> bool {
        match self {
            BoundExpr::Aggregate(_) => true,
            BoundExpr::Comparison { left, right, .. } => {
                left.has_aggregate() || right.has_aggregate()
            }
            BoundExpr::Arithmetic { left, right, .. } => {
                left.has_aggregate() || right.has_aggregate()
            }
            BoundExpr::Conjunction { children, .. } => children.iter().any(|c| c.has_aggregate()),
            BoundExpr::Unary { child, .. } => child.has_aggregate(),
            BoundExpr::NullCheck { child, .. } => child.has_aggregate(),
            BoundExpr::Function(f) => f.args.iter().any(|a| a.has_aggregate()),
            _ => false,
        }
    }

    /// Collect every column reference in the tree.
    pub fn collect_columns<'a>(&'a self, out: &mut Vec<&'a ColumnValueExpr>) {
        match self {
            BoundExpr::ColumnValue(c) => out.push(c),
            BoundExpr::Comparison { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            BoundExpr::Arithmetic { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            BoundExpr::Conjunction { children, .. } => {
                for child in children {
                    child.collect_columns(out);
                }
            }
            BoundExpr::Unary { child, .. } | BoundExpr::NullCheck { child, .. } => {
                child.collect_columns(out)
            }
            BoundExpr::Function(f) => {
                for arg in &f.args {
                    arg.collect_columns(out);
                }
            }
            BoundExpr::Aggregate(a) => {
                if let Some(arg) = &a.arg {
                    arg.collect_columns(out);
                }
            }
            _ => {}
        }
    }

    /// Split a conjunction into its top-level AND terms.
    pub fn split_conjunction(self) -> Vec<BoundExpr> {
        match self {
            BoundExpr::Conjunction {
                op: ConjunctionOp::And,
                children,
            } => children
                .into_iter()
                .flat_map(BoundExpr::split_conjunction)
                .collect(),
            other => vec![other],
        }
    }

    /// Conjoin a list of predicates back into one expression.
    pub fn conjoin(mut predicates: Vec<BoundExpr>) -> Option<BoundExpr> {
        match predicates.len() {
            0 => None,
            1 => predicates.pop(),
            _ => Some(BoundExpr::Conjunction {
                op: ConjunctionOp::And,
                children: predicates,
            }),
        }
    }

    /// Render for EXPLAIN and error messages.
    pub fn display(&self) -> String {
        match self {
            BoundExpr::ColumnValue(c) => {
                if c.table_alias.is_empty() {
                    c.column_name.clone()
                } else {
                    format!("{}.{}", c.table_alias, c.column_name)
                }
            }
            BoundExpr::Constant { value, .. } => value.to_string(),
            BoundExpr::Parameter { index, .. } => format!("${}", index + 1),
            BoundExpr::Comparison { op, left, right } => {
                format!("({} {} {})", left.display(), op.symbol(), right.display())
            }
            BoundExpr::Conjunction { op, children } => {
                let sep = match op {
                    ConjunctionOp::And => " AND ",
                    ConjunctionOp::Or => " OR ",
                };
                format!(
                    "({})",
                    children
                        .iter()
                        .map(|c| c.display())
                        .collect::<Vec<_>>()
                        .join(sep)
                )
            }
            BoundExpr::Arithmetic { op, left, right, .. } => {
                let symbol = match op {
                    ArithmeticOp::Add => "+",
                    ArithmeticOp::Subtract => "-",
                    ArithmeticOp::Multiply => "*",
                    ArithmeticOp::Divide => "/",
                    ArithmeticOp::Modulo => "%",
                };
                format!("({} {} {})", left.display(), symbol, right.display())
            }
            BoundExpr::Unary { op, child, .. } => match op {
                UnaryOp::Minus => format!("(-{})", child.display()),
                UnaryOp::Not => format!("(NOT {})", child.display()),
            },
            BoundExpr::NullCheck { negated, child } => {
                if *negated {
                    format!("({} IS NOT NULL)", child.display())
                } else {
                    format!("({} IS NULL)", child.display())
                }
            }
            BoundExpr::Function(f) => format!(
                "{}({})",
                f.name,
                f.args
                    .iter()
                    .map(|a| a.display())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            BoundExpr::Aggregate(a) => match (&a.kind, &a.arg) {
                (AggKind::CountStar, _) => "count(*)".to_string(),
                (kind, Some(arg)) => format!("{}({})", kind.name(), arg.display()),
                (kind, None) => format!("{}()", kind.name()),
            },
            BoundExpr::Derived { index, .. } => format!("#{index}"),
            BoundExpr::Star => "*".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str) -> BoundExpr {
        BoundExpr::ColumnValue(ColumnValueExpr {
            db_oid: DatabaseOid(1),
            table_oid: TableOid(2),
            column_oid: ColumnOid(3),
            type_id: SqlTypeId::Integer,
            depth: 0,
            table_alias: "a".into(),
            column_name: name.into(),
        })
    }

    #[test]
    fn json_round_trip_preserves_structure() {
        let expr = BoundExpr::Comparison {
            op: ComparisonOp::Lt,
            left: Box::new(column("a1")),
            right: Box::new(BoundExpr::Constant {
                value: SqlValue::Integer(100),
                type_id: SqlTypeId::Integer,
            }),
        };
        let json = serde_json::to_string(&expr).unwrap();
        assert!(json.contains("\"expr_type\":\"Comparison\""));
        let back: BoundExpr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expr);
    }

    #[test]
    fn conjunction_splitting_flattens_nested_ands() {
        let expr = BoundExpr::Conjunction {
            op: ConjunctionOp::And,
            children: vec![
                column("a"),
                BoundExpr::Conjunction {
                    op: ConjunctionOp::And,
                    children: vec![column("b"), column("c")],
                },
            ],
        };
        let parts = expr.split_conjunction();
        assert_eq!(parts.len(), 3);
        let rejoined = BoundExpr::conjoin(parts).unwrap();
        assert!(matches!(rejoined, BoundExpr::Conjunction { .. }));
    }

    #[test]
    fn aggregate_detection_sees_through_arithmetic() {
        let agg = BoundExpr::Aggregate(AggregateExpr {
            kind: AggKind::Sum,
            arg: Some(Box::new(column("a1"))),
            distinct: false,
            type_id: SqlTypeId::BigInt,
        });
        let expr = BoundExpr::Arithmetic {
            op: ArithmeticOp::Add,
            left: Box::new(agg),
            right: Box::new(column("a2")),
            type_id: SqlTypeId::BigInt,
        };
        assert!(expr.has_aggregate());
        assert!(!column("a1").has_aggregate());
    }
}
