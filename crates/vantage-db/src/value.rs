//! Typed cell values and row sets shared by connectors, the interpreter and
//! the warehouse writer.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Declared column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Decimal,
    Float,
    Text,
    Date,
    Timestamp,
    Boolean,
}

impl ColumnType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Decimal => "decimal",
            ColumnType::Float => "float",
            ColumnType::Text => "text",
            ColumnType::Date => "date",
            ColumnType::Timestamp => "timestamp",
            ColumnType::Boolean => "boolean",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ColumnType::Integer | ColumnType::Decimal | ColumnType::Float
        )
    }

    /// Whether values of `other` can be stored in a column of this type
    /// without a lossy conversion.
    pub fn accepts(&self, other: ColumnType) -> bool {
        if *self == other || *self == ColumnType::Text {
            return true;
        }
        match self {
            ColumnType::Decimal => other == ColumnType::Integer,
            ColumnType::Float => matches!(other, ColumnType::Integer | ColumnType::Decimal),
            ColumnType::Timestamp => other == ColumnType::Date,
            _ => false,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ColumnType {
    type Err = UnknownColumnType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "integer" | "int" | "bigint" => Ok(ColumnType::Integer),
            "decimal" | "numeric" => Ok(ColumnType::Decimal),
            "float" | "double" => Ok(ColumnType::Float),
            "text" | "string" | "varchar" => Ok(ColumnType::Text),
            "date" => Ok(ColumnType::Date),
            "timestamp" | "datetime" => Ok(ColumnType::Timestamp),
            "boolean" | "bool" => Ok(ColumnType::Boolean),
            _ => Err(UnknownColumnType(s.to_owned())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown column type '{0}'")]
pub struct UnknownColumnType(pub String);

/// One cell.
#[derive(Debug, Clone, PartialEq)]
pub enum ScalarValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    pub fn column_type(&self) -> Option<ColumnType> {
        match self {
            ScalarValue::Null => None,
            ScalarValue::Boolean(_) => Some(ColumnType::Boolean),
            ScalarValue::Integer(_) => Some(ColumnType::Integer),
            ScalarValue::Float(_) => Some(ColumnType::Float),
            ScalarValue::Decimal(_) => Some(ColumnType::Decimal),
            ScalarValue::Text(_) => Some(ColumnType::Text),
            ScalarValue::Date(_) => Some(ColumnType::Date),
            ScalarValue::Timestamp(_) => Some(ColumnType::Timestamp),
        }
    }

    /// Numeric view used by comparisons and arithmetic. Floats that are not
    /// finite have no decimal representation.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            ScalarValue::Integer(v) => Some(Decimal::from(*v)),
            ScalarValue::Decimal(v) => Some(*v),
            ScalarValue::Float(v) => Decimal::from_f64(*v),
            _ => None,
        }
    }

    /// Converts a JSON literal from a pipeline descriptor. Numbers with a
    /// fractional part become exact decimals.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, UnsupportedLiteral> {
        match value {
            serde_json::Value::Null => Ok(ScalarValue::Null),
            serde_json::Value::Bool(b) => Ok(ScalarValue::Boolean(*b)),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    return Ok(ScalarValue::Integer(i));
                }
                let text = n.to_string();
                if let Ok(d) = Decimal::from_str(&text).or_else(|_| Decimal::from_scientific(&text))
                {
                    return Ok(ScalarValue::Decimal(d));
                }
                n.as_f64()
                    .map(ScalarValue::Float)
                    .ok_or_else(|| UnsupportedLiteral(text))
            }
            serde_json::Value::String(s) => Ok(ScalarValue::Text(s.clone())),
            other => Err(UnsupportedLiteral(other.to_string())),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ScalarValue::Null => serde_json::Value::Null,
            ScalarValue::Boolean(b) => serde_json::Value::Bool(*b),
            ScalarValue::Integer(i) => serde_json::Value::from(*i),
            ScalarValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            other => serde_json::Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => f.write_str("NULL"),
            ScalarValue::Boolean(b) => write!(f, "{b}"),
            ScalarValue::Integer(i) => write!(f, "{i}"),
            ScalarValue::Float(v) => write!(f, "{v}"),
            ScalarValue::Decimal(d) => write!(f, "{}", d.normalize()),
            ScalarValue::Text(s) => f.write_str(s),
            ScalarValue::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            ScalarValue::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S%.f")),
        }
    }
}

/// Literal that has no scalar representation (JSON arrays and objects).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("literal {0} is not a scalar value")]
pub struct UnsupportedLiteral(pub String);

/// Ordered columns plus rows aligned with them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ScalarValue>>,
}

impl RowSet {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Vec<ScalarValue>>) -> Self {
        Self { columns, rows }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: Vec<ScalarValue>) {
        self.rows.push(row);
    }
}
