//! The typed intermediate representation for expressions, and its
//! interpreter. Translators emit `IrExpr` trees whose leaves are input-row
//! slots, constants and parameters; evaluation is row-at-a-time with
//! three-valued logic.

use serde::{Deserialize, Serialize};

use quill_storage::{SqlValue, SqlTypeId};

use crate::binder::expr::{AggKind, ArithmeticOp, ComparisonOp, ConjunctionOp};
use crate::error::{QueryError, RuntimeError};

/// Builtin scalar functions, the bodies behind `pg_proc` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuiltinFn {
    Lower,
    Upper,
    Length,
    Abs,
    Round,
    Version,
}

impl BuiltinFn {
    pub fn by_name(name: &str) -> Option<BuiltinFn> {
        match name {
            "lower" => Some(BuiltinFn::Lower),
            "upper" => Some(BuiltinFn::Upper),
            "length" => Some(BuiltinFn::Length),
            "abs" => Some(BuiltinFn::Abs),
            "round" => Some(BuiltinFn::Round),
            "version" => Some(BuiltinFn::Version),
            _ => None,
        }
    }
}

/// A typed IR expression over the current pipeline row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum IrExpr {
    Slot {
        index: usize,
        type_id: SqlTypeId,
    },
    Constant {
        value: SqlValue,
    },
    Param {
        index: usize,
        type_id: SqlTypeId,
    },
    Compare {
        cmp: ComparisonOp,
        left: Box<IrExpr>,
        right: Box<IrExpr>,
    },
    Conjunction {
        conj: ConjunctionOp,
        children: Vec<IrExpr>,
    },
    Arithmetic {
        arith: ArithmeticOp,
        left: Box<IrExpr>,
        right: Box<IrExpr>,
        type_id: SqlTypeId,
    },
    Negate {
        child: Box<IrExpr>,
        type_id: SqlTypeId,
    },
    Not {
        child: Box<IrExpr>,
    },
    IsNull {
        negated: bool,
        child: Box<IrExpr>,
    },
    Call {
        function: BuiltinFn,
        args: Vec<IrExpr>,
    },
}

impl IrExpr {
    pub fn eval(&self, row: &[SqlValue], params: &[SqlValue]) -> Result<SqlValue, QueryError> {
        match self {
            IrExpr::Slot { index, .. } => {
                Ok(row.get(*index).cloned().unwrap_or(SqlValue::Null))
            }
            IrExpr::Constant { value } => Ok(value.clone()),
            IrExpr::Param { index, .. } => params
                .get(*index)
                .cloned()
                .ok_or_else(|| RuntimeError::UnboundParameter(*index + 1).into()),
            IrExpr::Compare { cmp, left, right } => {
                let l = left.eval(row, params)?;
                let r = right.eval(row, params)?;
                Ok(match l.compare(&r) {
                    None => SqlValue::Null,
                    Some(ordering) => SqlValue::Boolean(match cmp {
                        ComparisonOp::Eq => ordering.is_eq(),
                        ComparisonOp::NotEq => !ordering.is_eq(),
                        ComparisonOp::Lt => ordering.is_lt(),
                        ComparisonOp::LtEq => ordering.is_le(),
                        ComparisonOp::Gt => ordering.is_gt(),
                        ComparisonOp::GtEq => ordering.is_ge(),
                    }),
                })
            }
            IrExpr::Conjunction { conj, children } => {
                let mut saw_null = false;
                for child in children {
                    match child.eval(row, params)? {
                        SqlValue::Null => saw_null = true,
                        SqlValue::Boolean(b) => match conj {
                            ConjunctionOp::And if !b => return Ok(SqlValue::Boolean(false)),
                            ConjunctionOp::Or if b => return Ok(SqlValue::Boolean(true)),
                            _ => {}
                        },
                        other => {
                            return Err(QueryError::Codegen(format!(
                                "boolean operand expected, got {}",
                                other.type_id()
                            )))
                        }
                    }
                }
                Ok(if saw_null {
                    SqlValue::Null
                } else {
                    SqlValue::Boolean(matches!(conj, ConjunctionOp::And))
                })
            }
            IrExpr::Arithmetic {
                arith,
                left,
                right,
                type_id,
            } => {
                let l = left.eval(row, params)?;
                let r = right.eval(row, params)?;
                if l.is_null() || r.is_null() {
                    return Ok(SqlValue::Null);
                }
                eval_arithmetic(*arith, &l, &r, *type_id)
            }
            IrExpr::Negate { child, .. } => match child.eval(row, params)? {
                SqlValue::Null => Ok(SqlValue::Null),
                SqlValue::TinyInt(v) => Ok(SqlValue::TinyInt(-v)),
                SqlValue::SmallInt(v) => Ok(SqlValue::SmallInt(-v)),
                SqlValue::Integer(v) => Ok(SqlValue::Integer(-v)),
                SqlValue::BigInt(v) => Ok(SqlValue::BigInt(-v)),
                SqlValue::Real(v) => Ok(SqlValue::Real(-v)),
                other => Err(QueryError::Codegen(format!(
                    "cannot negate {}",
                    other.type_id()
                ))),
            },
            IrExpr::Not { child } => match child.eval(row, params)? {
                SqlValue::Null => Ok(SqlValue::Null),
                SqlValue::Boolean(b) => Ok(SqlValue::Boolean(!b)),
                other => Err(QueryError::Codegen(format!(
                    "NOT expects boolean, got {}",
                    other.type_id()
                ))),
            },
            IrExpr::IsNull { negated, child } => {
                let value = child.eval(row, params)?;
                Ok(SqlValue::Boolean(value.is_null() != *negated))
            }
            IrExpr::Call { function, args } => {
                let mut evaluated = Vec::with_capacity(args.len());
                for arg in args {
                    evaluated.push(arg.eval(row, params)?);
                }
                eval_builtin(*function, &evaluated)
            }
        }
    }

    /// Evaluate as a predicate: SQL's three-valued logic collapses null to
    /// false.
    pub fn eval_predicate(
        &self,
        row: &[SqlValue],
        params: &[SqlValue],
    ) -> Result<bool, QueryError> {
        Ok(matches!(self.eval(row, params)?, SqlValue::Boolean(true)))
    }
}

fn eval_arithmetic(
    op: ArithmeticOp,
    left: &SqlValue,
    right: &SqlValue,
    type_id: SqlTypeId,
) -> Result<SqlValue, QueryError> {
    if type_id == SqlTypeId::Real
        || matches!(left, SqlValue::Real(_))
        || matches!(right, SqlValue::Real(_))
    {
        let l = left
            .as_f64()
            .ok_or_else(|| QueryError::Codegen("numeric operand expected".into()))?;
        let r = right
            .as_f64()
            .ok_or_else(|| QueryError::Codegen("numeric operand expected".into()))?;
        let result = match op {
            ArithmeticOp::Add => l + r,
            ArithmeticOp::Subtract => l - r,
            ArithmeticOp::Multiply => l * r,
            ArithmeticOp::Divide => {
                if r == 0.0 {
                    return Err(RuntimeError::DivisionByZero.into());
                }
                l / r
            }
            ArithmeticOp::Modulo => {
                if r == 0.0 {
                    return Err(RuntimeError::DivisionByZero.into());
                }
                l % r
            }
        };
        return Ok(SqlValue::Real(result));
    }

    let l = left
        .as_i64()
        .ok_or_else(|| QueryError::Codegen("numeric operand expected".into()))?;
    let r = right
        .as_i64()
        .ok_or_else(|| QueryError::Codegen("numeric operand expected".into()))?;
    let result = match op {
        ArithmeticOp::Add => l.checked_add(r),
        ArithmeticOp::Subtract => l.checked_sub(r),
        ArithmeticOp::Multiply => l.checked_mul(r),
        ArithmeticOp::Divide => {
            if r == 0 {
                return Err(RuntimeError::DivisionByZero.into());
            }
            l.checked_div(r)
        }
        ArithmeticOp::Modulo => {
            if r == 0 {
                return Err(RuntimeError::DivisionByZero.into());
            }
            l.checked_rem(r)
        }
    }
    .ok_or(RuntimeError::NumericOverflow(type_id))?;

    Ok(match type_id {
        SqlTypeId::TinyInt => SqlValue::TinyInt(
            i8::try_from(result).map_err(|_| RuntimeError::NumericOverflow(type_id))?,
        ),
        SqlTypeId::SmallInt => SqlValue::SmallInt(
            i16::try_from(result).map_err(|_| RuntimeError::NumericOverflow(type_id))?,
        ),
        SqlTypeId::Integer => SqlValue::Integer(
            i32::try_from(result).map_err(|_| RuntimeError::NumericOverflow(type_id))?,
        ),
        _ => SqlValue::BigInt(result),
    })
}

fn eval_builtin(function: BuiltinFn, args: &[SqlValue]) -> Result<SqlValue, QueryError> {
    if function != BuiltinFn::Version && args.iter().any(|a| a.is_null()) {
        return Ok(SqlValue::Null);
    }
    Ok(match function {
        BuiltinFn::Lower => SqlValue::Varchar(
            args.first()
                .and_then(|a| a.as_str())
                .unwrap_or_default()
                .to_lowercase(),
        ),
        BuiltinFn::Upper => SqlValue::Varchar(
            args.first()
                .and_then(|a| a.as_str())
                .unwrap_or_default()
                .to_uppercase(),
        ),
        BuiltinFn::Length => SqlValue::Integer(
            args.first()
                .and_then(|a| a.as_str())
                .map(|s| s.chars().count() as i32)
                .unwrap_or(0),
        ),
        BuiltinFn::Abs => match args.first() {
            Some(SqlValue::Real(v)) => SqlValue::Real(v.abs()),
            Some(v) => SqlValue::BigInt(
                v.as_i64()
                    .ok_or_else(|| QueryError::Codegen("abs expects a number".into()))?
                    .abs(),
            ),
            None => SqlValue::Null,
        },
        BuiltinFn::Round => match args.first() {
            Some(SqlValue::Real(v)) => SqlValue::Real(v.round()),
            Some(v) => v.clone(),
            None => SqlValue::Null,
        },
        BuiltinFn::Version => SqlValue::Varchar("PostgreSQL 15.0 (quill 0.1)".to_string()),
    })
}

/// One aggregate computed by a build step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggSpec {
    pub kind: AggKind,
    pub arg: Option<IrExpr>,
    pub distinct: bool,
    pub type_id: SqlTypeId,
}

/// Accumulator for one aggregate within one group.
#[derive(Debug)]
pub struct AggState {
    kind: AggKind,
    output_type: SqlTypeId,
    count: i64,
    sum_int: i64,
    sum_real: f64,
    extreme: SqlValue,
    seen: Option<std::collections::HashSet<Vec<u8>>>,
}

impl AggState {
    pub fn new(spec: &AggSpec) -> Self {
        AggState {
            kind: spec.kind,
            output_type: spec.type_id,
            count: 0,
            sum_int: 0,
            sum_real: 0.0,
            extreme: SqlValue::Null,
            seen: if spec.distinct {
                Some(std::collections::HashSet::new())
            } else {
                None
            },
        }
    }

    pub fn update(&mut self, value: &SqlValue) -> Result<(), QueryError> {
        if self.kind != AggKind::CountStar && value.is_null() {
            return Ok(());
        }
        if let Some(seen) = &mut self.seen {
            let mut key = Vec::new();
            quill_storage::encode_sort_key(value, &mut key);
            if !seen.insert(key) {
                return Ok(());
            }
        }
        match self.kind {
            AggKind::CountStar | AggKind::Count => self.count += 1,
            AggKind::Sum | AggKind::Avg => {
                self.count += 1;
                match value {
                    SqlValue::Real(v) => self.sum_real += v,
                    other => {
                        let v = other.as_i64().ok_or_else(|| {
                            QueryError::Codegen("sum expects a numeric argument".into())
                        })?;
                        self.sum_int = self
                            .sum_int
                            .checked_add(v)
                            .ok_or(RuntimeError::NumericOverflow(SqlTypeId::BigInt))?;
                        self.sum_real += v as f64;
                    }
                }
            }
            AggKind::Min => {
                if self.extreme.is_null()
                    || value.compare(&self.extreme) == Some(std::cmp::Ordering::Less)
                {
                    self.extreme = value.clone();
                }
            }
            AggKind::Max => {
                if self.extreme.is_null()
                    || value.compare(&self.extreme) == Some(std::cmp::Ordering::Greater)
                {
                    self.extreme = value.clone();
                }
            }
        }
        Ok(())
    }

    pub fn finalize(&self) -> SqlValue {
        match self.kind {
            AggKind::CountStar | AggKind::Count => SqlValue::BigInt(self.count),
            AggKind::Sum => {
                if self.count == 0 {
                    SqlValue::Null
                } else if self.output_type == SqlTypeId::Real {
                    SqlValue::Real(self.sum_real)
                } else {
                    SqlValue::BigInt(self.sum_int)
                }
            }
            AggKind::Avg => {
                if self.count == 0 {
                    SqlValue::Null
                } else {
                    SqlValue::Real(self.sum_real / self.count as f64)
                }
            }
            AggKind::Min | AggKind::Max => self.extreme.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i32) -> IrExpr {
        IrExpr::Constant {
            value: SqlValue::Integer(v),
        }
    }

    #[test]
    fn comparison_with_null_is_null() {
        let expr = IrExpr::Compare {
            cmp: ComparisonOp::Lt,
            left: Box::new(int(1)),
            right: Box::new(IrExpr::Constant {
                value: SqlValue::Null,
            }),
        };
        assert_eq!(expr.eval(&[], &[]).unwrap(), SqlValue::Null);
        assert!(!expr.eval_predicate(&[], &[]).unwrap());
    }

    #[test]
    fn division_by_zero_is_a_runtime_error() {
        let expr = IrExpr::Arithmetic {
            arith: ArithmeticOp::Divide,
            left: Box::new(int(10)),
            right: Box::new(int(0)),
            type_id: SqlTypeId::Integer,
        };
        let err = expr.eval(&[], &[]).unwrap_err();
        assert_eq!(err.sqlstate(), "22012");
    }

    #[test]
    fn integer_overflow_is_detected() {
        let expr = IrExpr::Arithmetic {
            arith: ArithmeticOp::Add,
            left: Box::new(IrExpr::Constant {
                value: SqlValue::Integer(i32::MAX),
            }),
            right: Box::new(int(1)),
            type_id: SqlTypeId::Integer,
        };
        let err = expr.eval(&[], &[]).unwrap_err();
        assert_eq!(err.sqlstate(), "22003");
    }

    #[test]
    fn three_valued_and() {
        let expr = IrExpr::Conjunction {
            conj: ConjunctionOp::And,
            children: vec![
                IrExpr::Constant {
                    value: SqlValue::Boolean(true),
                },
                IrExpr::Constant {
                    value: SqlValue::Null,
                },
            ],
        };
        assert_eq!(expr.eval(&[], &[]).unwrap(), SqlValue::Null);
        let short_circuit = IrExpr::Conjunction {
            conj: ConjunctionOp::And,
            children: vec![
                IrExpr::Constant {
                    value: SqlValue::Boolean(false),
                },
                IrExpr::Constant {
                    value: SqlValue::Null,
                },
            ],
        };
        assert_eq!(
            short_circuit.eval(&[], &[]).unwrap(),
            SqlValue::Boolean(false)
        );
    }

    #[test]
    fn aggregate_states_accumulate_and_finalize() {
        let spec = AggSpec {
            kind: AggKind::Avg,
            arg: None,
            distinct: false,
            type_id: SqlTypeId::Real,
        };
        let mut state = AggState::new(&spec);
        for v in [1, 2, 3] {
            state.update(&SqlValue::Integer(v)).unwrap();
        }
        state.update(&SqlValue::Null).unwrap();
        assert_eq!(state.finalize(), SqlValue::Real(2.0));

        let empty = AggState::new(&AggSpec {
            kind: AggKind::Sum,
            arg: None,
            distinct: false,
            type_id: SqlTypeId::BigInt,
        });
        assert_eq!(empty.finalize(), SqlValue::Null);
    }

    #[test]
    fn distinct_count_deduplicates() {
        let spec = AggSpec {
            kind: AggKind::Count,
            arg: None,
            distinct: true,
            type_id: SqlTypeId::BigInt,
        };
        let mut state = AggState::new(&spec);
        for v in [1, 1, 2, 2, 3] {
            state.update(&SqlValue::Integer(v)).unwrap();
        }
        assert_eq!(state.finalize(), SqlValue::BigInt(3));
    }
}
