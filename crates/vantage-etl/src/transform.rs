//! Row-level rule interpreter: casts, arithmetic, predicates and the
//! in-memory relational operators used by staged plans.
//!
//! Everything here is pure. Row errors come back as `Err(String)` and the
//! caller decides what to do with them through [`RowErrorPolicy`].

use std::cmp::Ordering;
use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::warn;
use vantage_db::sql::{ArithmeticOp, CompareOp, JoinKind};
use vantage_db::{ColumnType, ScalarValue};

use crate::error::EtlError;

/// What happens to a row whose rule cannot be evaluated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorPolicy {
    #[default]
    NullOut,
    SkipRow,
    Abort,
}

/// Result of applying a policy to a failed rule.
#[derive(Debug, Clone, PartialEq)]
pub enum RowAction {
    Keep(ScalarValue),
    Skip,
}

/// Row-level warnings collected during a run. Only the first `cap` messages
/// are kept, the total counts all of them.
#[derive(Debug, Clone, Default)]
pub struct Warnings {
    messages: Vec<String>,
    total: usize,
    cap: usize,
}

impl Warnings {
    pub fn new(cap: usize) -> Self {
        Self {
            messages: Vec::new(),
            total: 0,
            cap,
        }
    }

    pub fn push(&mut self, message: String) {
        self.total += 1;
        if self.messages.len() < self.cap {
            warn!(warning = %message, "row warning");
            self.messages.push(message);
        }
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn into_messages(self) -> Vec<String> {
        self.messages
    }
}

/// Applies `policy` to a rule failure on `row`.
pub fn recover(
    policy: RowErrorPolicy,
    rule: &str,
    row: usize,
    error: String,
    warnings: &mut Warnings,
) -> Result<RowAction, EtlError> {
    match policy {
        RowErrorPolicy::NullOut => {
            warnings.push(format!("{rule}, row {row}: {error}; value set to NULL"));
            Ok(RowAction::Keep(ScalarValue::Null))
        }
        RowErrorPolicy::SkipRow => {
            warnings.push(format!("{rule}, row {row}: {error}; row skipped"));
            Ok(RowAction::Skip)
        }
        RowErrorPolicy::Abort => Err(EtlError::CastError(format!("{rule}, row {row}: {error}"))),
    }
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d", "%d.%m.%Y"];
const TIMESTAMP_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];
const SERIAL_DATE_MAX: i64 = 2_958_465;

fn serial_epoch() -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(1899, 12, 30)
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.naive_utc());
    }
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
}

pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(text, format).ok())
        .or_else(|| parse_timestamp(text).map(|ts| ts.date()))
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "1" => Some(true),
        "false" | "f" | "no" | "n" | "0" => Some(false),
        _ => None,
    }
}

/// Days since 1899-12-30 as used by spreadsheet applications.
fn from_serial(serial: Decimal) -> Result<NaiveDateTime, String> {
    let days = serial.floor();
    let whole = days
        .to_i64()
        .filter(|d| (1..=SERIAL_DATE_MAX).contains(d))
        .ok_or_else(|| format!("{serial} is outside the spreadsheet date range"))?;
    let millis = ((serial - days) * Decimal::from(86_400_000))
        .round()
        .to_i64()
        .unwrap_or(0);
    serial_epoch()
        .map(|epoch| epoch.and_time(NaiveTime::MIN))
        .map(|midnight| midnight + Duration::days(whole) + Duration::milliseconds(millis))
        .ok_or_else(|| "invalid spreadsheet epoch".to_string())
}

fn round_to_i64(value: Decimal) -> Result<i64, String> {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .ok_or_else(|| format!("{value} is out of range for integer"))
}

fn cannot_cast(value: &ScalarValue, target: ColumnType) -> String {
    let source = value.column_type().map(|ty| ty.as_str()).unwrap_or("null");
    format!("cannot cast {source} '{value}' to {target}")
}

/// Converts `value` to `target`. Null stays null.
pub fn cast_value(value: &ScalarValue, target: ColumnType) -> Result<ScalarValue, String> {
    if value.is_null() {
        return Ok(ScalarValue::Null);
    }
    let fail = || cannot_cast(value, target);
    let cast = match (target, value) {
        (ColumnType::Text, v) => ScalarValue::Text(v.to_string()),

        (ColumnType::Integer, ScalarValue::Integer(i)) => ScalarValue::Integer(*i),
        (ColumnType::Integer, ScalarValue::Boolean(b)) => ScalarValue::Integer(i64::from(*b)),
        (ColumnType::Integer, ScalarValue::Decimal(d)) => ScalarValue::Integer(round_to_i64(*d)?),
        (ColumnType::Integer, ScalarValue::Float(f)) => {
            let d = Decimal::from_f64(*f).ok_or_else(fail)?;
            ScalarValue::Integer(round_to_i64(d)?)
        }
        (ColumnType::Integer, ScalarValue::Text(s)) => match s.trim().parse::<i64>() {
            Ok(i) => ScalarValue::Integer(i),
            Err(_) => ScalarValue::Integer(round_to_i64(parse_decimal(s).ok_or_else(fail)?)?),
        },

        (ColumnType::Decimal, ScalarValue::Boolean(b)) => {
            ScalarValue::Decimal(Decimal::from(i64::from(*b)))
        }
        (ColumnType::Decimal, ScalarValue::Text(s)) => {
            ScalarValue::Decimal(parse_decimal(s).ok_or_else(fail)?)
        }
        (ColumnType::Decimal, v @ (ScalarValue::Integer(_) | ScalarValue::Decimal(_) | ScalarValue::Float(_))) => {
            ScalarValue::Decimal(v.as_decimal().ok_or_else(fail)?)
        }

        (ColumnType::Float, ScalarValue::Float(f)) => ScalarValue::Float(*f),
        (ColumnType::Float, ScalarValue::Integer(i)) => ScalarValue::Float(*i as f64),
        (ColumnType::Float, ScalarValue::Decimal(d)) => {
            ScalarValue::Float(d.to_f64().ok_or_else(fail)?)
        }
        (ColumnType::Float, ScalarValue::Boolean(b)) => {
            ScalarValue::Float(if *b { 1.0 } else { 0.0 })
        }
        (ColumnType::Float, ScalarValue::Text(s)) => {
            let f = s.trim().parse::<f64>().map_err(|_| fail())?;
            if !f.is_finite() {
                return Err(fail());
            }
            ScalarValue::Float(f)
        }

        (ColumnType::Date, ScalarValue::Date(d)) => ScalarValue::Date(*d),
        (ColumnType::Date, ScalarValue::Timestamp(ts)) => ScalarValue::Date(ts.date()),
        (ColumnType::Date, ScalarValue::Text(s)) => ScalarValue::Date(parse_date(s).ok_or_else(fail)?),
        (ColumnType::Date, v @ (ScalarValue::Integer(_) | ScalarValue::Decimal(_) | ScalarValue::Float(_))) => {
            let serial = v.as_decimal().ok_or_else(fail)?;
            ScalarValue::Date(from_serial(serial)?.date())
        }

        (ColumnType::Timestamp, ScalarValue::Timestamp(ts)) => ScalarValue::Timestamp(*ts),
        (ColumnType::Timestamp, ScalarValue::Date(d)) => {
            ScalarValue::Timestamp(d.and_time(NaiveTime::MIN))
        }
        (ColumnType::Timestamp, ScalarValue::Text(s)) => {
            let text = s.trim();
            let ts = parse_timestamp(text)
                .or_else(|| parse_date(text).map(|d| d.and_time(NaiveTime::MIN)))
                .ok_or_else(fail)?;
            ScalarValue::Timestamp(ts)
        }
        (ColumnType::Timestamp, v @ (ScalarValue::Integer(_) | ScalarValue::Decimal(_) | ScalarValue::Float(_))) => {
            let serial = v.as_decimal().ok_or_else(fail)?;
            ScalarValue::Timestamp(from_serial(serial)?)
        }

        (ColumnType::Boolean, ScalarValue::Boolean(b)) => ScalarValue::Boolean(*b),
        (ColumnType::Boolean, ScalarValue::Integer(i)) => ScalarValue::Boolean(*i != 0),
        (ColumnType::Boolean, ScalarValue::Decimal(d)) => ScalarValue::Boolean(!d.is_zero()),
        (ColumnType::Boolean, ScalarValue::Float(f)) => ScalarValue::Boolean(*f != 0.0),
        (ColumnType::Boolean, ScalarValue::Text(s)) => {
            ScalarValue::Boolean(parse_bool(s).ok_or_else(fail)?)
        }

        _ => return Err(fail()),
    };
    Ok(cast)
}

/// Numeric view of an arithmetic operand. Numeric text is accepted since
/// spreadsheet columns often carry numbers as strings.
fn numeric_operand(value: &ScalarValue) -> Result<ScalarValue, String> {
    match value {
        ScalarValue::Integer(_) | ScalarValue::Decimal(_) | ScalarValue::Float(_) => {
            Ok(value.clone())
        }
        ScalarValue::Text(s) => match s.trim().parse::<i64>() {
            Ok(i) => Ok(ScalarValue::Integer(i)),
            Err(_) => parse_decimal(s)
                .map(ScalarValue::Decimal)
                .ok_or_else(|| format!("'{s}' is not a number")),
        },
        other => Err(format!("'{other}' is not a number")),
    }
}

fn is_zero(value: &ScalarValue) -> bool {
    match value {
        ScalarValue::Integer(i) => *i == 0,
        ScalarValue::Decimal(d) => d.is_zero(),
        ScalarValue::Float(f) => *f == 0.0,
        _ => false,
    }
}

enum Step {
    Value(ScalarValue),
    DivideByZero,
}

fn apply_step(op: ArithmeticOp, left: &ScalarValue, right: &ScalarValue) -> Result<Step, String> {
    if op == ArithmeticOp::Divide && is_zero(right) {
        return Ok(Step::DivideByZero);
    }
    let overflow = || format!("{left} {} {right} overflows", op.as_sql());

    if let (ScalarValue::Integer(a), ScalarValue::Integer(b)) = (left, right) {
        let value = match op {
            ArithmeticOp::Add => a.checked_add(*b).map(ScalarValue::Integer),
            ArithmeticOp::Subtract => a.checked_sub(*b).map(ScalarValue::Integer),
            ArithmeticOp::Multiply => a.checked_mul(*b).map(ScalarValue::Integer),
            ArithmeticOp::Divide => Decimal::from(*a)
                .checked_div(Decimal::from(*b))
                .map(ScalarValue::Decimal),
        };
        return value.map(Step::Value).ok_or_else(overflow);
    }

    if matches!(left, ScalarValue::Float(_)) || matches!(right, ScalarValue::Float(_)) {
        let a = as_f64(left).ok_or_else(overflow)?;
        let b = as_f64(right).ok_or_else(overflow)?;
        let result = match op {
            ArithmeticOp::Add => a + b,
            ArithmeticOp::Subtract => a - b,
            ArithmeticOp::Multiply => a * b,
            ArithmeticOp::Divide => a / b,
        };
        if !result.is_finite() {
            return Err(overflow());
        }
        return Ok(Step::Value(ScalarValue::Float(result)));
    }

    let a = left.as_decimal().ok_or_else(overflow)?;
    let b = right.as_decimal().ok_or_else(overflow)?;
    let result = match op {
        ArithmeticOp::Add => a.checked_add(b),
        ArithmeticOp::Subtract => a.checked_sub(b),
        ArithmeticOp::Multiply => a.checked_mul(b),
        ArithmeticOp::Divide => a.checked_div(b),
    };
    result
        .map(|d| Step::Value(ScalarValue::Decimal(d)))
        .ok_or_else(overflow)
}

fn as_f64(value: &ScalarValue) -> Option<f64> {
    match value {
        ScalarValue::Float(f) => Some(*f),
        ScalarValue::Integer(i) => Some(*i as f64),
        ScalarValue::Decimal(d) => d.to_f64(),
        _ => None,
    }
}

/// Folds `operands` left to right. A zero divisor yields `divide_by_zero`
/// for the whole expression; a null operand yields null.
pub fn evaluate_arithmetic(
    op: ArithmeticOp,
    operands: &[ScalarValue],
    divide_by_zero: &ScalarValue,
) -> Result<ScalarValue, String> {
    if operands.iter().any(ScalarValue::is_null) {
        return Ok(ScalarValue::Null);
    }
    let mut values = operands.iter().map(numeric_operand);
    let mut acc = match values.next() {
        Some(first) => first?,
        None => return Err("arithmetic needs at least one operand".into()),
    };
    for value in values {
        match apply_step(op, &acc, &value?)? {
            Step::Value(next) => acc = next,
            Step::DivideByZero => return Ok(divide_by_zero.clone()),
        }
    }
    Ok(acc)
}

/// Result type of an arithmetic expression over operands of these types.
pub fn arithmetic_result_type(op: ArithmeticOp, operands: &[Option<ColumnType>]) -> Option<ColumnType> {
    if operands.iter().any(|ty| ty.is_none()) {
        return None;
    }
    let has = |wanted: ColumnType| operands.iter().any(|ty| *ty == Some(wanted));
    if has(ColumnType::Float) {
        Some(ColumnType::Float)
    } else if has(ColumnType::Decimal) || op == ArithmeticOp::Divide {
        Some(ColumnType::Decimal)
    } else {
        Some(ColumnType::Integer)
    }
}

/// Orders two values across compatible types. `None` when the values are not
/// comparable (or either is null).
pub fn compare_values(left: &ScalarValue, right: &ScalarValue) -> Option<Ordering> {
    use ScalarValue as V;
    match (left, right) {
        (V::Null, _) | (_, V::Null) => None,
        (V::Text(a), V::Text(b)) => Some(a.cmp(b)),
        (V::Boolean(a), V::Boolean(b)) => Some(a.cmp(b)),
        (V::Boolean(a), V::Text(b)) => parse_bool(b).map(|b| a.cmp(&b)),
        (V::Text(a), V::Boolean(b)) => parse_bool(a).map(|a| a.cmp(b)),
        (V::Date(a), V::Date(b)) => Some(a.cmp(b)),
        (V::Timestamp(a), V::Timestamp(b)) => Some(a.cmp(b)),
        (V::Date(a), V::Timestamp(b)) => Some(a.and_time(NaiveTime::MIN).cmp(b)),
        (V::Timestamp(a), V::Date(b)) => Some(a.cmp(&b.and_time(NaiveTime::MIN))),
        (V::Date(a), V::Text(b)) => parse_date(b).map(|b| a.cmp(&b)),
        (V::Text(a), V::Date(b)) => parse_date(a).map(|a| a.cmp(b)),
        (V::Timestamp(a), V::Text(b)) => parse_timestamp(b.trim()).map(|b| a.cmp(&b)),
        (V::Text(a), V::Timestamp(b)) => parse_timestamp(a.trim()).map(|a| a.cmp(b)),
        (V::Text(a), b) => compare_numbers(&V::Decimal(parse_decimal(a)?), b),
        (a, V::Text(b)) => compare_numbers(a, &V::Decimal(parse_decimal(b)?)),
        (a, b) => compare_numbers(a, b),
    }
}

fn compare_numbers(left: &ScalarValue, right: &ScalarValue) -> Option<Ordering> {
    match (left.as_decimal(), right.as_decimal()) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => as_f64(left)?.partial_cmp(&as_f64(right)?),
    }
}

/// Right-hand side of a row-level comparison.
#[derive(Debug, Clone, PartialEq)]
pub enum CompareOperand {
    None,
    Value(ScalarValue),
    List(Vec<ScalarValue>),
}

/// SQL three-valued comparison: `None` stands for UNKNOWN.
pub fn compare(left: &ScalarValue, op: CompareOp, right: &CompareOperand) -> Option<bool> {
    match op {
        CompareOp::IsNull => return Some(left.is_null()),
        CompareOp::IsNotNull => return Some(!left.is_null()),
        _ => {}
    }
    if left.is_null() {
        return None;
    }
    match (op, right) {
        (CompareOp::In, CompareOperand::List(values)) => {
            let mut unknown = false;
            for value in values {
                match compare_values(left, value) {
                    Some(Ordering::Equal) => return Some(true),
                    None if value.is_null() => unknown = true,
                    _ => {}
                }
            }
            if unknown {
                None
            } else {
                Some(false)
            }
        }
        (CompareOp::Like, CompareOperand::Value(ScalarValue::Text(pattern))) => {
            Some(like_match(&left.to_string(), pattern))
        }
        (CompareOp::Like, CompareOperand::Value(ScalarValue::Null)) => None,
        (CompareOp::Like, CompareOperand::Value(other)) => {
            Some(like_match(&left.to_string(), &other.to_string()))
        }
        (_, CompareOperand::Value(value)) => {
            let ordering = compare_values(left, value)?;
            Some(match op {
                CompareOp::Eq => ordering == Ordering::Equal,
                CompareOp::NotEq => ordering != Ordering::Equal,
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::GtEq => ordering != Ordering::Less,
                CompareOp::LtEq => ordering != Ordering::Greater,
                _ => return None,
            })
        }
        _ => None,
    }
}

enum LikeToken {
    AnyRun,
    AnyOne,
    Literal(char),
}

fn tokenize_like(pattern: &str) -> Vec<LikeToken> {
    let mut tokens = Vec::new();
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        tokens.push(match c {
            '%' => LikeToken::AnyRun,
            '_' => LikeToken::AnyOne,
            '\\' => LikeToken::Literal(chars.next().unwrap_or('\\')),
            other => LikeToken::Literal(other),
        });
    }
    tokens
}

/// SQL `LIKE`: `%` matches any run, `_` one character, `\` escapes.
pub fn like_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let tokens = tokenize_like(pattern);

    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        match tokens.get(p) {
            Some(LikeToken::AnyRun) => {
                backtrack = Some((p, t));
                p += 1;
            }
            Some(LikeToken::AnyOne) => {
                t += 1;
                p += 1;
            }
            Some(LikeToken::Literal(c)) if *c == text[t] => {
                t += 1;
                p += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    t = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    tokens[p..].iter().all(|token| matches!(token, LikeToken::AnyRun))
}

/// Join key with numbers normalized so `1`, `1.0` and `1.00` match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum JoinKey {
    Number(Decimal),
    Text(String),
    Boolean(bool),
    Timestamp(NaiveDateTime),
}

fn join_key(value: &ScalarValue) -> Option<JoinKey> {
    match value {
        ScalarValue::Null => None,
        ScalarValue::Integer(_) | ScalarValue::Decimal(_) | ScalarValue::Float(_) => {
            value.as_decimal().map(|d| JoinKey::Number(d.normalize()))
        }
        ScalarValue::Text(s) => Some(JoinKey::Text(s.clone())),
        ScalarValue::Boolean(b) => Some(JoinKey::Boolean(*b)),
        ScalarValue::Date(d) => Some(JoinKey::Timestamp(d.and_time(NaiveTime::MIN))),
        ScalarValue::Timestamp(ts) => Some(JoinKey::Timestamp(*ts)),
    }
}

/// Equality hash join. Output rows are left cells followed by right cells.
/// Null keys never match; a left join pads unmatched rows with nulls.
pub fn hash_join(
    left: Vec<Vec<ScalarValue>>,
    left_key: usize,
    right: &[Vec<ScalarValue>],
    right_key: usize,
    right_width: usize,
    kind: JoinKind,
) -> Vec<Vec<ScalarValue>> {
    let mut index: HashMap<JoinKey, Vec<usize>> = HashMap::new();
    for (position, row) in right.iter().enumerate() {
        if let Some(key) = row.get(right_key).and_then(join_key) {
            index.entry(key).or_default().push(position);
        }
    }

    let mut out = Vec::with_capacity(left.len());
    for row in left {
        let matches = row
            .get(left_key)
            .and_then(join_key)
            .and_then(|key| index.get(&key));
        match matches {
            Some(positions) => {
                for &position in positions {
                    let mut joined = row.clone();
                    joined.extend(right[position].iter().cloned());
                    out.push(joined);
                }
            }
            None if kind == JoinKind::Left => {
                let mut joined = row;
                joined.extend(std::iter::repeat(ScalarValue::Null).take(right_width));
                out.push(joined);
            }
            None => {}
        }
    }
    out
}

/// Best-effort column type for values with no declared type.
pub fn sniff_type(value: &ScalarValue) -> Option<ColumnType> {
    match value {
        ScalarValue::Float(_) => Some(ColumnType::Decimal),
        other => other.column_type(),
    }
}
