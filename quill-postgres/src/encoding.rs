//! Mapping between engine values and the Postgres wire protocol: type OIDs,
//! RowDescription fields, DataRow encoding and portal parameter decoding.

use std::sync::Arc;

use futures::stream;
use pgwire::api::portal::{Format, Portal};
use pgwire::api::results::{DataRowEncoder, FieldInfo, QueryResponse};
use pgwire::api::Type;
use pgwire::error::{PgWireError, PgWireResult};
use pgwire::messages::data::DataRow;

use quill_storage::{SqlTypeId, SqlValue};

pub fn pg_type_of(type_id: SqlTypeId) -> Type {
    match type_id {
        SqlTypeId::Boolean => Type::BOOL,
        SqlTypeId::TinyInt => Type::CHAR,
        SqlTypeId::SmallInt => Type::INT2,
        SqlTypeId::Integer => Type::INT4,
        SqlTypeId::BigInt => Type::INT8,
        SqlTypeId::Real => Type::FLOAT8,
        SqlTypeId::Varchar => Type::VARCHAR,
        SqlTypeId::Date => Type::DATE,
        SqlTypeId::Timestamp => Type::TIMESTAMP,
        SqlTypeId::Invalid => Type::UNKNOWN,
    }
}

pub fn sql_type_of(pg_type: &Type) -> SqlTypeId {
    match *pg_type {
        Type::BOOL => SqlTypeId::Boolean,
        Type::CHAR => SqlTypeId::TinyInt,
        Type::INT2 => SqlTypeId::SmallInt,
        Type::INT4 => SqlTypeId::Integer,
        Type::INT8 => SqlTypeId::BigInt,
        Type::FLOAT4 | Type::FLOAT8 | Type::NUMERIC => SqlTypeId::Real,
        Type::VARCHAR | Type::TEXT | Type::BPCHAR => SqlTypeId::Varchar,
        Type::DATE => SqlTypeId::Date,
        Type::TIMESTAMP => SqlTypeId::Timestamp,
        _ => SqlTypeId::Invalid,
    }
}

/// RowDescription fields for an output schema, honoring the per-column
/// result formats the portal requested.
pub fn schema_to_fields(schema: &[(String, SqlTypeId)], format: &Format) -> Vec<FieldInfo> {
    schema
        .iter()
        .enumerate()
        .map(|(idx, (name, type_id))| {
            FieldInfo::new(
                name.clone(),
                None,
                None,
                pg_type_of(*type_id),
                format.format_for(idx),
            )
        })
        .collect()
}

fn encode_value(encoder: &mut DataRowEncoder, value: &SqlValue) -> PgWireResult<()> {
    match value {
        SqlValue::Null => encoder.encode_field(&None::<&str>),
        SqlValue::Boolean(v) => encoder.encode_field(v),
        SqlValue::TinyInt(v) => encoder.encode_field(v),
        SqlValue::SmallInt(v) => encoder.encode_field(v),
        SqlValue::Integer(v) => encoder.encode_field(v),
        SqlValue::BigInt(v) => encoder.encode_field(v),
        SqlValue::Real(v) => encoder.encode_field(v),
        SqlValue::Varchar(v) => encoder.encode_field(v),
        // Temporal values travel in their text form.
        SqlValue::Date(v) => encoder.encode_field(&v.to_string()),
        SqlValue::Timestamp(v) => encoder.encode_field(&v.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
    }
}

/// Encode result rows into a `QueryResponse` for the wire.
pub fn encode_rows<'a>(
    schema: Vec<FieldInfo>,
    rows: Vec<Vec<SqlValue>>,
) -> PgWireResult<QueryResponse<'a>> {
    let schema = Arc::new(schema);
    let mut encoded: Vec<PgWireResult<DataRow>> = Vec::with_capacity(rows.len());
    for row in rows {
        let mut encoder = DataRowEncoder::new(Arc::clone(&schema));
        for value in &row {
            encode_value(&mut encoder, value)?;
        }
        encoded.push(Ok(encoder.take_row()));
    }
    Ok(QueryResponse::new(schema, stream::iter(encoded)))
}

/// A single-column textual response, used by SHOW and EXPLAIN.
pub fn single_column_response<'a>(
    name: &str,
    values: impl IntoIterator<Item = String>,
) -> PgWireResult<QueryResponse<'a>> {
    let schema = vec![(name.to_string(), SqlTypeId::Varchar)];
    let fields = schema_to_fields(&schema, &Format::UnifiedText);
    encode_rows(
        fields,
        values
            .into_iter()
            .map(|v| vec![SqlValue::Varchar(v)])
            .collect(),
    )
}

/// Decode the portal's bound parameters into engine values, driven by the
/// desired parameter types the binder recorded.
pub fn decode_parameters<S: Clone>(
    portal: &Portal<S>,
    desired_types: &[SqlTypeId],
) -> PgWireResult<Vec<SqlValue>> {
    let mut params = Vec::with_capacity(portal.parameter_len());
    for index in 0..portal.parameter_len() {
        let type_id = desired_types
            .get(index)
            .copied()
            .unwrap_or(SqlTypeId::Varchar);
        let pg_type = pg_type_of(type_id);
        let value = match type_id {
            SqlTypeId::Boolean => portal
                .parameter::<bool>(index, &pg_type)?
                .map(SqlValue::Boolean),
            SqlTypeId::TinyInt => portal
                .parameter::<i16>(index, &Type::INT2)?
                .map(|v| SqlValue::TinyInt(v as i8)),
            SqlTypeId::SmallInt => portal
                .parameter::<i16>(index, &pg_type)?
                .map(SqlValue::SmallInt),
            SqlTypeId::Integer => portal
                .parameter::<i32>(index, &pg_type)?
                .map(SqlValue::Integer),
            SqlTypeId::BigInt => portal
                .parameter::<i64>(index, &pg_type)?
                .map(SqlValue::BigInt),
            SqlTypeId::Real => portal
                .parameter::<f64>(index, &pg_type)?
                .map(SqlValue::Real),
            SqlTypeId::Date => portal
                .parameter::<String>(index, &Type::VARCHAR)?
                .map(|text| parse_date(&text))
                .transpose()?,
            SqlTypeId::Timestamp => portal
                .parameter::<String>(index, &Type::VARCHAR)?
                .map(|text| parse_timestamp(&text))
                .transpose()?,
            SqlTypeId::Varchar | SqlTypeId::Invalid => portal
                .parameter::<String>(index, &Type::VARCHAR)?
                .map(SqlValue::Varchar),
        };
        params.push(value.unwrap_or(SqlValue::Null));
    }
    Ok(params)
}

fn parse_date(text: &str) -> PgWireResult<SqlValue> {
    chrono::NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map(SqlValue::Date)
        .map_err(|e| PgWireError::ApiError(Box::new(e)))
}

fn parse_timestamp(text: &str) -> PgWireResult<SqlValue> {
    chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .map(SqlValue::Timestamp)
        .map_err(|e| PgWireError::ApiError(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_mapping_round_trips() {
        for type_id in [
            SqlTypeId::Boolean,
            SqlTypeId::SmallInt,
            SqlTypeId::Integer,
            SqlTypeId::BigInt,
            SqlTypeId::Real,
            SqlTypeId::Varchar,
            SqlTypeId::Date,
            SqlTypeId::Timestamp,
        ] {
            assert_eq!(sql_type_of(&pg_type_of(type_id)), type_id);
        }
    }

    #[test]
    fn fields_carry_requested_formats() {
        let schema = vec![
            ("a".to_string(), SqlTypeId::Integer),
            ("b".to_string(), SqlTypeId::Varchar),
        ];
        let fields = schema_to_fields(&schema, &Format::UnifiedText);
        assert_eq!(fields.len(), 2);
        assert_eq!(*fields[0].datatype(), Type::INT4);
    }
}
