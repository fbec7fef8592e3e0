use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// SQL type identifiers understood by the engine. The set matches the types
/// the binder promotes between; everything wider (decimal, arrays, ...) is
/// out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlTypeId {
    Invalid,
    Boolean,
    TinyInt,
    SmallInt,
    Integer,
    BigInt,
    Real,
    Varchar,
    Date,
    Timestamp,
}

impl SqlTypeId {
    /// Byte width of the value slot in a projected row.
    pub fn size(&self) -> usize {
        match self {
            SqlTypeId::Boolean | SqlTypeId::TinyInt => 1,
            SqlTypeId::SmallInt => 2,
            SqlTypeId::Integer | SqlTypeId::Date => 4,
            SqlTypeId::BigInt | SqlTypeId::Real | SqlTypeId::Timestamp => 8,
            // length prefix + 12 bytes inline or a varlen heap reference
            SqlTypeId::Varchar => 16,
            SqlTypeId::Invalid => 0,
        }
    }

    /// Alignment requirement of the value slot.
    pub fn align(&self) -> usize {
        match self {
            SqlTypeId::Boolean | SqlTypeId::TinyInt => 1,
            SqlTypeId::SmallInt => 2,
            SqlTypeId::Integer | SqlTypeId::Date => 4,
            SqlTypeId::BigInt | SqlTypeId::Real | SqlTypeId::Timestamp => 8,
            SqlTypeId::Varchar => 8,
            SqlTypeId::Invalid => 1,
        }
    }

    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            SqlTypeId::TinyInt | SqlTypeId::SmallInt | SqlTypeId::Integer | SqlTypeId::BigInt
        )
    }

    pub fn is_numeric(&self) -> bool {
        self.is_integral() || *self == SqlTypeId::Real
    }

    pub fn name(&self) -> &'static str {
        match self {
            SqlTypeId::Invalid => "invalid",
            SqlTypeId::Boolean => "boolean",
            SqlTypeId::TinyInt => "tinyint",
            SqlTypeId::SmallInt => "smallint",
            SqlTypeId::Integer => "integer",
            SqlTypeId::BigInt => "bigint",
            SqlTypeId::Real => "real",
            SqlTypeId::Varchar => "varchar",
            SqlTypeId::Date => "date",
            SqlTypeId::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for SqlTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A runtime SQL value. `Null` is untyped; the surrounding expression or
/// schema supplies the type where one is needed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Boolean(bool),
    TinyInt(i8),
    SmallInt(i16),
    Integer(i32),
    BigInt(i64),
    Real(f64),
    Varchar(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl SqlValue {
    pub fn type_id(&self) -> SqlTypeId {
        match self {
            SqlValue::Null => SqlTypeId::Invalid,
            SqlValue::Boolean(_) => SqlTypeId::Boolean,
            SqlValue::TinyInt(_) => SqlTypeId::TinyInt,
            SqlValue::SmallInt(_) => SqlTypeId::SmallInt,
            SqlValue::Integer(_) => SqlTypeId::Integer,
            SqlValue::BigInt(_) => SqlTypeId::BigInt,
            SqlValue::Real(_) => SqlTypeId::Real,
            SqlValue::Varchar(_) => SqlTypeId::Varchar,
            SqlValue::Date(_) => SqlTypeId::Date,
            SqlValue::Timestamp(_) => SqlTypeId::Timestamp,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Widest integral view of a numeric value, if it has one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::TinyInt(v) => Some(*v as i64),
            SqlValue::SmallInt(v) => Some(*v as i64),
            SqlValue::Integer(v) => Some(*v as i64),
            SqlValue::BigInt(v) => Some(*v),
            SqlValue::Boolean(v) => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Real(v) => Some(*v),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Varchar(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Three-way comparison with numeric-family coercion. Returns `None` when
    /// either side is null or the types are incomparable.
    pub fn compare(&self, other: &SqlValue) -> Option<Ordering> {
        if self.is_null() || other.is_null() {
            return None;
        }
        match (self, other) {
            (SqlValue::Varchar(a), SqlValue::Varchar(b)) => Some(a.cmp(b)),
            (SqlValue::Boolean(a), SqlValue::Boolean(b)) => Some(a.cmp(b)),
            (SqlValue::Date(a), SqlValue::Date(b)) => Some(a.cmp(b)),
            (SqlValue::Timestamp(a), SqlValue::Timestamp(b)) => Some(a.cmp(b)),
            (a, b) if a.type_id().is_integral() && b.type_id().is_integral() => {
                Some(a.as_i64().unwrap().cmp(&b.as_i64().unwrap()))
            }
            (a, b) if a.type_id().is_numeric() && b.type_id().is_numeric() => {
                a.as_f64().unwrap().partial_cmp(&b.as_f64().unwrap())
            }
            _ => None,
        }
    }
}

impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Some(Ordering::Equal)
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Boolean(v) => write!(f, "{}", if *v { "t" } else { "f" }),
            SqlValue::TinyInt(v) => write!(f, "{v}"),
            SqlValue::SmallInt(v) => write!(f, "{v}"),
            SqlValue::Integer(v) => write!(f, "{v}"),
            SqlValue::BigInt(v) => write!(f, "{v}"),
            SqlValue::Real(v) => write!(f, "{v}"),
            SqlValue::Varchar(v) => f.write_str(v),
            SqlValue::Date(v) => write!(f, "{v}"),
            SqlValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.6f")),
        }
    }
}

/// Append an order-preserving (memcmp-comparable) encoding of `value` to
/// `out`. Nulls sort before every non-null value. Used for index keys and
/// for hashing group-by/join keys.
pub fn encode_sort_key(value: &SqlValue, out: &mut Vec<u8>) {
    match value {
        SqlValue::Null => out.push(0),
        present => {
            out.push(1);
            match present {
                SqlValue::Boolean(v) => out.push(*v as u8),
                SqlValue::TinyInt(v) => out.push((*v as u8) ^ 0x80),
                SqlValue::SmallInt(v) => {
                    out.extend_from_slice(&((*v as u16) ^ 0x8000).to_be_bytes())
                }
                SqlValue::Integer(v) => {
                    out.extend_from_slice(&((*v as u32) ^ 0x8000_0000).to_be_bytes())
                }
                SqlValue::BigInt(v) => {
                    out.extend_from_slice(&((*v as u64) ^ 0x8000_0000_0000_0000).to_be_bytes())
                }
                SqlValue::Real(v) => {
                    let bits = v.to_bits();
                    let flipped = if *v >= 0.0 {
                        bits ^ 0x8000_0000_0000_0000
                    } else {
                        !bits
                    };
                    out.extend_from_slice(&flipped.to_be_bytes());
                }
                SqlValue::Varchar(s) => {
                    out.extend_from_slice(s.as_bytes());
                    out.push(0);
                }
                SqlValue::Date(d) => {
                    let days = d.signed_duration_since(epoch_date()).num_days() as i32;
                    out.extend_from_slice(&((days as u32) ^ 0x8000_0000).to_be_bytes());
                }
                SqlValue::Timestamp(ts) => {
                    let micros = ts.and_utc().timestamp_micros();
                    out.extend_from_slice(
                        &((micros as u64) ^ 0x8000_0000_0000_0000).to_be_bytes(),
                    );
                }
                SqlValue::Null => unreachable!(),
            }
        }
    }
}

pub(crate) fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_comparison_coerces_families() {
        assert_eq!(
            SqlValue::Integer(3).compare(&SqlValue::BigInt(3)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            SqlValue::SmallInt(2).compare(&SqlValue::Real(2.5)),
            Some(Ordering::Less)
        );
        assert_eq!(SqlValue::Null.compare(&SqlValue::Integer(1)), None);
        assert_eq!(
            SqlValue::Varchar("abc".into()).compare(&SqlValue::Integer(1)),
            None
        );
    }

    #[test]
    fn sort_key_encoding_preserves_order() {
        let values = [
            SqlValue::Null,
            SqlValue::Integer(i32::MIN),
            SqlValue::Integer(-1),
            SqlValue::Integer(0),
            SqlValue::Integer(42),
            SqlValue::Integer(i32::MAX),
        ];
        let keys: Vec<Vec<u8>> = values
            .iter()
            .map(|v| {
                let mut k = Vec::new();
                encode_sort_key(v, &mut k);
                k
            })
            .collect();
        for window in keys.windows(2) {
            assert!(window[0] < window[1]);
        }
    }

    #[test]
    fn sort_key_encoding_orders_reals() {
        let mut keys: Vec<Vec<u8>> = [-10.5f64, -0.25, 0.0, 1.0, 1e9]
            .iter()
            .map(|v| {
                let mut k = Vec::new();
                encode_sort_key(&SqlValue::Real(*v), &mut k);
                k
            })
            .collect();
        let sorted = keys.clone();
        keys.sort();
        assert_eq!(keys, sorted);
    }
}
