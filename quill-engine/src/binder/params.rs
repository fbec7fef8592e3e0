//! Fast-path parameter promotion for prepared statements: re-binding the
//! same statement with new parameter values only casts the constants to the
//! desired types recorded by the first full bind, without re-running the
//! binder. Integer widening is always permitted, narrowing requires a range
//! check, and cross-family casts fail.

use quill_storage::{SqlTypeId, SqlValue};

use crate::error::{BinderError, QueryError};

/// Promote every parameter to its desired type in place.
pub fn promote_parameters(
    parameters: &mut [SqlValue],
    desired_types: &[SqlTypeId],
) -> Result<(), QueryError> {
    for (index, value) in parameters.iter_mut().enumerate() {
        let desired = desired_types
            .get(index)
            .copied()
            .unwrap_or(SqlTypeId::Invalid);
        if desired == SqlTypeId::Invalid {
            continue;
        }
        check_and_promote(index, value, desired)?;
    }
    Ok(())
}

/// Attempt to convert one value to the desired type. Promotion may be an
/// upcast or a downcast size-wise; downcasts that do not fit fail.
pub fn check_and_promote(
    index: usize,
    value: &mut SqlValue,
    desired: SqlTypeId,
) -> Result<(), QueryError> {
    if value.is_null() || value.type_id() == desired {
        return Ok(());
    }
    let current = value.type_id();
    let converted = match (&*value, desired) {
        (v, _) if v.type_id().is_integral() && desired.is_integral() => {
            let raw = v.as_i64().unwrap();
            cast_integral(raw, desired)
                .ok_or(BinderError::ParameterConversion(index + 1, current, desired))?
        }
        (v, SqlTypeId::Real) if v.type_id().is_integral() => {
            SqlValue::Real(v.as_i64().unwrap() as f64)
        }
        (SqlValue::Real(f), _) if desired.is_integral() => {
            if f.fract() != 0.0 {
                return Err(
                    BinderError::ParameterConversion(index + 1, current, desired).into(),
                );
            }
            cast_integral(*f as i64, desired)
                .ok_or(BinderError::ParameterConversion(index + 1, current, desired))?
        }
        _ => {
            // Cross-family casts (e.g. int <-> varchar) fail the fast path.
            return Err(BinderError::ParameterConversion(index + 1, current, desired).into());
        }
    };
    *value = converted;
    Ok(())
}

/// True when `value` fits the output type.
pub fn is_representable(value: i64, desired: SqlTypeId) -> bool {
    match desired {
        SqlTypeId::TinyInt => i8::try_from(value).is_ok(),
        SqlTypeId::SmallInt => i16::try_from(value).is_ok(),
        SqlTypeId::Integer => i32::try_from(value).is_ok(),
        SqlTypeId::BigInt => true,
        _ => false,
    }
}

fn cast_integral(value: i64, desired: SqlTypeId) -> Option<SqlValue> {
    if !is_representable(value, desired) {
        return None;
    }
    Some(match desired {
        SqlTypeId::TinyInt => SqlValue::TinyInt(value as i8),
        SqlTypeId::SmallInt => SqlValue::SmallInt(value as i16),
        SqlTypeId::Integer => SqlValue::Integer(value as i32),
        SqlTypeId::BigInt => SqlValue::BigInt(value),
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widening_always_succeeds() {
        let mut params = vec![SqlValue::SmallInt(42)];
        promote_parameters(&mut params, &[SqlTypeId::BigInt]).unwrap();
        assert_eq!(params[0], SqlValue::BigInt(42));
    }

    #[test]
    fn narrowing_checks_the_range() {
        let mut ok = vec![SqlValue::BigInt(100)];
        promote_parameters(&mut ok, &[SqlTypeId::TinyInt]).unwrap();
        assert_eq!(ok[0], SqlValue::TinyInt(100));

        let mut too_big = vec![SqlValue::BigInt(40_000)];
        let err = promote_parameters(&mut too_big, &[SqlTypeId::SmallInt]).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Binder(BinderError::ParameterConversion(1, _, _))
        ));
    }

    #[test]
    fn cross_family_casts_fail() {
        let mut params = vec![SqlValue::Integer(1)];
        let err = promote_parameters(&mut params, &[SqlTypeId::Varchar]).unwrap_err();
        assert!(matches!(
            err,
            QueryError::Binder(BinderError::ParameterConversion(..))
        ));
    }

    #[test]
    fn nulls_and_unknowns_pass_through() {
        let mut params = vec![SqlValue::Null, SqlValue::Varchar("x".into())];
        promote_parameters(&mut params, &[SqlTypeId::Integer, SqlTypeId::Invalid]).unwrap();
        assert!(params[0].is_null());
        assert_eq!(params[1], SqlValue::Varchar("x".into()));
    }

    #[test]
    fn integer_to_real_promotes() {
        let mut params = vec![SqlValue::Integer(3)];
        promote_parameters(&mut params, &[SqlTypeId::Real]).unwrap();
        assert_eq!(params[0], SqlValue::Real(3.0));
    }
}
