//! PostgreSQL value binding and row decoding shared by the warehouse and the
//! Postgres source connector.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgArguments, PgRow, Postgres};
use sqlx::query::Query;
use sqlx::{Column, Row, TypeInfo};

use crate::value::{RowSet, ScalarValue};

pub fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &ScalarValue,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        ScalarValue::Null => query.bind(None::<String>),
        ScalarValue::Boolean(v) => query.bind(*v),
        ScalarValue::Integer(v) => query.bind(*v),
        ScalarValue::Float(v) => query.bind(*v),
        ScalarValue::Decimal(v) => query.bind(*v),
        ScalarValue::Text(v) => query.bind(v.clone()),
        ScalarValue::Date(v) => query.bind(*v),
        ScalarValue::Timestamp(v) => query.bind(*v),
    }
}

/// Builds a query with every parameter bound in order.
pub fn prepare<'q>(sql: &'q str, params: &[ScalarValue]) -> Query<'q, Postgres, PgArguments> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

pub fn decode_rows(rows: &[PgRow]) -> Result<RowSet, sqlx::Error> {
    let Some(first) = rows.first() else {
        return Ok(RowSet::default());
    };
    let columns = first
        .columns()
        .iter()
        .map(|column| column.name().to_owned())
        .collect::<Vec<_>>();

    let mut out = RowSet::new(columns);
    for row in rows {
        let values = (0..row.len())
            .map(|index| decode_value(row, index))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(values);
    }
    Ok(out)
}

fn decode_value(row: &PgRow, index: usize) -> Result<ScalarValue, sqlx::Error> {
    let type_name = row.column(index).type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "BOOL" => row
            .try_get::<Option<bool>, _>(index)?
            .map(ScalarValue::Boolean),
        "INT2" => row
            .try_get::<Option<i16>, _>(index)?
            .map(|v| ScalarValue::Integer(v.into())),
        "INT4" => row
            .try_get::<Option<i32>, _>(index)?
            .map(|v| ScalarValue::Integer(v.into())),
        "INT8" => row
            .try_get::<Option<i64>, _>(index)?
            .map(ScalarValue::Integer),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|v| ScalarValue::Float(v.into())),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(index)?
            .map(ScalarValue::Float),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(index)?
            .map(ScalarValue::Decimal),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)?
            .map(ScalarValue::Date),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(ScalarValue::Timestamp),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|v| ScalarValue::Timestamp(v.naive_utc())),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)?
            .map(|v| ScalarValue::Text(v.to_string())),
        "TEXT" | "VARCHAR" | "BPCHAR" | "CHAR" | "NAME" | "CITEXT" => row
            .try_get::<Option<String>, _>(index)?
            .map(ScalarValue::Text),
        other => {
            return Err(sqlx::Error::Decode(
                format!(
                    "column '{}' has unsupported type {other}; cast it to text in the source",
                    row.column(index).name()
                )
                .into(),
            ))
        }
    };
    Ok(value.unwrap_or(ScalarValue::Null))
}
