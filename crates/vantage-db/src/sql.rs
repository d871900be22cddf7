//! Identifier quoting and parameterized query composition.
//!
//! Table and column names reaching this module are untrusted. Every
//! identifier goes through [`quote_ident`] and every literal becomes a bound
//! parameter, except `NULL`, which is rendered as the keyword. Placeholders
//! are numbered by [`SqlWriter`] in textual order, so fragments can be
//! composed freely.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::{ColumnType, ScalarValue};

/// SQL dialects the query builder renders for. The warehouse speaks
/// [`SqlDialect::Postgres`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Postgres,
    MySql,
    Firebird,
}

impl SqlDialect {
    pub fn quote_char(&self) -> char {
        match self {
            SqlDialect::MySql => '`',
            SqlDialect::Postgres | SqlDialect::Firebird => '"',
        }
    }

    fn max_identifier_len(&self, name: &str) -> (usize, usize, &'static str) {
        match self {
            SqlDialect::Postgres => (name.len(), 63, "bytes"),
            SqlDialect::MySql => (name.chars().count(), 64, "characters"),
            SqlDialect::Firebird => (name.chars().count(), 63, "characters"),
        }
    }

    /// Target type used in `CAST(... AS <type>)`. MySQL has no boolean cast.
    pub fn cast_type(&self, ty: ColumnType) -> Option<&'static str> {
        match (self, ty) {
            (SqlDialect::Postgres, ColumnType::Integer) => Some("BIGINT"),
            (SqlDialect::Postgres, ColumnType::Decimal) => Some("NUMERIC"),
            (SqlDialect::Postgres, ColumnType::Float) => Some("DOUBLE PRECISION"),
            (SqlDialect::Postgres, ColumnType::Text) => Some("TEXT"),
            (SqlDialect::Postgres, ColumnType::Date) => Some("DATE"),
            (SqlDialect::Postgres, ColumnType::Timestamp) => Some("TIMESTAMP"),
            (SqlDialect::Postgres, ColumnType::Boolean) => Some("BOOLEAN"),
            (SqlDialect::MySql, ColumnType::Integer) => Some("SIGNED"),
            (SqlDialect::MySql, ColumnType::Decimal) => Some("DECIMAL(38, 10)"),
            (SqlDialect::MySql, ColumnType::Float) => Some("DOUBLE"),
            (SqlDialect::MySql, ColumnType::Text) => Some("CHAR"),
            (SqlDialect::MySql, ColumnType::Date) => Some("DATE"),
            (SqlDialect::MySql, ColumnType::Timestamp) => Some("DATETIME"),
            (SqlDialect::MySql, ColumnType::Boolean) => None,
            (SqlDialect::Firebird, ColumnType::Integer) => Some("BIGINT"),
            (SqlDialect::Firebird, ColumnType::Decimal) => Some("DECIMAL(18, 4)"),
            (SqlDialect::Firebird, ColumnType::Float) => Some("DOUBLE PRECISION"),
            (SqlDialect::Firebird, ColumnType::Text) => Some("VARCHAR(8191)"),
            (SqlDialect::Firebird, ColumnType::Date) => Some("DATE"),
            (SqlDialect::Firebird, ColumnType::Timestamp) => Some("TIMESTAMP"),
            (SqlDialect::Firebird, ColumnType::Boolean) => Some("BOOLEAN"),
        }
    }

    /// Cast applied to the numerator so integer division yields a fraction.
    fn division_cast(&self) -> Option<&'static str> {
        match self {
            SqlDialect::Postgres => Some("NUMERIC"),
            SqlDialect::Firebird => Some("DOUBLE PRECISION"),
            SqlDialect::MySql => None,
        }
    }

    fn write_placeholder(&self, out: &mut String, index: usize) {
        match self {
            SqlDialect::Postgres => {
                out.push('$');
                out.push_str(&index.to_string());
            }
            SqlDialect::MySql | SqlDialect::Firebird => out.push('?'),
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SqlDialect::Postgres => "postgres",
            SqlDialect::MySql => "mysql",
            SqlDialect::Firebird => "firebird",
        })
    }
}

/// Errors raised while composing SQL.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SqlError {
    #[error("invalid identifier {name:?}: {reason}")]
    InvalidIdentifier { name: String, reason: String },
    #[error("unsupported operator '{0}'")]
    UnsupportedOperator(String),
    #[error("{0}")]
    InvalidOperand(String),
    #[error("{dialect} has no CAST to {target}")]
    UnsupportedCast {
        dialect: SqlDialect,
        target: ColumnType,
    },
}

impl SqlError {
    fn identifier(name: &str, reason: impl Into<String>) -> Self {
        SqlError::InvalidIdentifier {
            name: name.to_owned(),
            reason: reason.into(),
        }
    }
}

fn validate_ident(name: &str, dialect: SqlDialect) -> Result<(), SqlError> {
    if name.is_empty() {
        return Err(SqlError::identifier(name, "identifier is empty"));
    }
    if name.chars().any(char::is_control) {
        return Err(SqlError::identifier(
            name,
            "identifier contains control characters",
        ));
    }
    if name.contains(';') && (name.contains("--") || name.contains("/*")) {
        return Err(SqlError::identifier(
            name,
            "identifier combines a statement terminator with a comment marker",
        ));
    }
    let (len, max, unit) = dialect.max_identifier_len(name);
    if len > max {
        return Err(SqlError::identifier(
            name,
            format!("identifier is longer than {max} {unit}"),
        ));
    }
    Ok(())
}

/// Quotes a single identifier, doubling embedded quote characters.
pub fn quote_ident(name: &str, dialect: SqlDialect) -> Result<String, SqlError> {
    validate_ident(name, dialect)?;
    let quote = dialect.quote_char();
    let mut out = String::with_capacity(name.len() + 2);
    out.push(quote);
    for ch in name.chars() {
        if ch == quote {
            out.push(quote);
        }
        out.push(ch);
    }
    out.push(quote);
    Ok(out)
}

/// Inverse of [`quote_ident`].
pub fn unquote_ident(quoted: &str, dialect: SqlDialect) -> Result<String, SqlError> {
    let quote = dialect.quote_char();
    let inner = quoted
        .strip_prefix(quote)
        .and_then(|rest| rest.strip_suffix(quote))
        .ok_or_else(|| SqlError::identifier(quoted, "identifier is not quoted"))?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == quote && chars.next() != Some(quote) {
            return Err(SqlError::identifier(quoted, "unescaped quote character"));
        }
        out.push(ch);
    }
    validate_ident(&out, dialect)?;
    Ok(out)
}

/// Splits `schema.table` on unquoted dots. Segments may already be quoted
/// with either `"` or `` ` ``.
pub fn split_qualified(path: &str) -> Result<Vec<String>, SqlError> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut closed = false;
    let mut chars = path.chars().peekable();

    while let Some(ch) = chars.next() {
        match quote {
            Some(q) if ch == q => {
                if chars.peek() == Some(&q) {
                    chars.next();
                    current.push(q);
                } else {
                    quote = None;
                    closed = true;
                }
            }
            Some(_) => current.push(ch),
            None => match ch {
                '.' => {
                    segments.push(std::mem::take(&mut current));
                    closed = false;
                }
                '"' | '`' if current.is_empty() && !closed => quote = Some(ch),
                _ if closed => {
                    return Err(SqlError::identifier(
                        path,
                        "unexpected text after a quoted segment",
                    ))
                }
                _ => current.push(ch),
            },
        }
    }
    if quote.is_some() {
        return Err(SqlError::identifier(path, "unterminated quoted segment"));
    }
    segments.push(current);
    Ok(segments)
}

/// Quotes `table` or `schema.table`.
pub fn quote_qualified(path: &str, dialect: SqlDialect) -> Result<String, SqlError> {
    let segments = split_qualified(path)?;
    if segments.len() > 2 {
        return Err(SqlError::identifier(
            path,
            "expected `table` or `schema.table`",
        ));
    }
    let quoted = segments
        .iter()
        .map(|segment| quote_ident(segment, dialect))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(quoted.join("."))
}

/// Comparison operators accepted in filters and predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Gt,
    Lt,
    GtEq,
    LtEq,
    Like,
    In,
    IsNull,
    IsNotNull,
}

impl CompareOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::NotEq => "<>",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::GtEq => ">=",
            CompareOp::LtEq => "<=",
            CompareOp::Like => "LIKE",
            CompareOp::In => "IN",
            CompareOp::IsNull => "IS NULL",
            CompareOp::IsNotNull => "IS NOT NULL",
        }
    }

    /// `IS NULL` and `IS NOT NULL` take no right-hand operand.
    pub fn takes_operand(&self) -> bool {
        !matches!(self, CompareOp::IsNull | CompareOp::IsNotNull)
    }
}

impl FromStr for CompareOp {
    type Err = SqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.split_whitespace().collect::<Vec<_>>().join(" ");
        match normalized.to_ascii_uppercase().as_str() {
            "=" | "==" => Ok(CompareOp::Eq),
            "!=" | "<>" => Ok(CompareOp::NotEq),
            ">" => Ok(CompareOp::Gt),
            "<" => Ok(CompareOp::Lt),
            ">=" => Ok(CompareOp::GtEq),
            "<=" => Ok(CompareOp::LtEq),
            "LIKE" => Ok(CompareOp::Like),
            "IN" => Ok(CompareOp::In),
            "IS NULL" => Ok(CompareOp::IsNull),
            "IS NOT NULL" => Ok(CompareOp::IsNotNull),
            _ => Err(SqlError::UnsupportedOperator(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticOp {
    Add,
    Subtract,
    Multiply,
    Divide,
}

impl ArithmeticOp {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ArithmeticOp::Add => "+",
            ArithmeticOp::Subtract => "-",
            ArithmeticOp::Multiply => "*",
            ArithmeticOp::Divide => "/",
        }
    }
}

impl FromStr for ArithmeticOp {
    type Err = SqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "+" => Ok(ArithmeticOp::Add),
            "-" => Ok(ArithmeticOp::Subtract),
            "*" => Ok(ArithmeticOp::Multiply),
            "/" => Ok(ArithmeticOp::Divide),
            _ => Err(SqlError::UnsupportedOperator(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
}

impl JoinKind {
    pub fn as_sql(&self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
        }
    }
}

impl FromStr for JoinKind {
    type Err = SqlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inner" | "inner join" => Ok(JoinKind::Inner),
            "left" | "left join" | "left outer" | "left outer join" => Ok(JoinKind::Left),
            _ => Err(SqlError::UnsupportedOperator(format!("{s} join"))),
        }
    }
}

/// Right-hand side of a WHERE condition.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
}

/// One `{column, operator, value}` triple.
#[derive(Debug, Clone, PartialEq)]
pub struct WhereCondition {
    pub column: String,
    pub operator: String,
    pub value: Option<FilterValue>,
}

impl WhereCondition {
    pub fn new(column: impl Into<String>, operator: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            operator: operator.into(),
            value: None,
        }
    }

    pub fn value(mut self, value: ScalarValue) -> Self {
        self.value = Some(FilterValue::Scalar(value));
        self
    }

    pub fn values(mut self, values: Vec<ScalarValue>) -> Self {
        self.value = Some(FilterValue::List(values));
        self
    }
}

/// Rendered SQL together with its bound parameters, in placeholder order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<ScalarValue>,
}

/// Builds ` WHERE a = $1 AND b IN ($2, $3)`. No conditions render an empty
/// fragment. Column names may be `table.column`.
pub fn build_where_clause(
    conditions: &[WhereCondition],
    dialect: SqlDialect,
) -> Result<SqlFragment, SqlError> {
    let mut predicates = Vec::with_capacity(conditions.len());
    for condition in conditions {
        let op = CompareOp::from_str(&condition.operator)?;
        let segments = split_qualified(&condition.column)?;
        let left = match segments.as_slice() {
            [column] => SqlExpr::column(None, column.clone()),
            [table, column] => SqlExpr::column(Some(table.clone()), column.clone()),
            _ => {
                return Err(SqlError::identifier(
                    &condition.column,
                    "expected `column` or `table.column`",
                ))
            }
        };
        let right = match (op, &condition.value) {
            (CompareOp::IsNull | CompareOp::IsNotNull, _) => PredicateOperand::None,
            (CompareOp::In, Some(FilterValue::List(values))) => {
                PredicateOperand::List(values.clone())
            }
            (CompareOp::In, Some(FilterValue::Scalar(value))) => {
                PredicateOperand::List(vec![value.clone()])
            }
            (_, Some(FilterValue::Scalar(value))) => {
                PredicateOperand::Expr(SqlExpr::Literal(value.clone()))
            }
            (_, Some(FilterValue::List(_))) => {
                return Err(SqlError::InvalidOperand(format!(
                    "operator {} takes a single value, not a list",
                    op.as_sql()
                )))
            }
            (_, None) => {
                return Err(SqlError::InvalidOperand(format!(
                    "operator {} on {:?} requires a value",
                    op.as_sql(),
                    condition.column
                )))
            }
        };
        predicates.push(SqlPredicate { left, op, right });
    }

    let mut writer = SqlWriter::new(dialect);
    writer.push_where(&predicates)?;
    Ok(writer.finish())
}

/// Builds `LEFT JOIN "right" ON "left"."a" = "right"."b"`.
pub fn build_join_clause(
    left_table: &str,
    right_table: &str,
    left_column: &str,
    right_column: &str,
    join_type: &str,
    dialect: SqlDialect,
) -> Result<String, SqlError> {
    let kind = JoinKind::from_str(join_type)?;
    let left = quote_qualified(left_table, dialect)?;
    let right = quote_qualified(right_table, dialect)?;
    Ok(format!(
        "{} {right} ON {left}.{} = {right}.{}",
        kind.as_sql(),
        quote_ident(left_column, dialect)?,
        quote_ident(right_column, dialect)?,
    ))
}

/// Column expressions tracked over base-table aliases.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlExpr {
    Column {
        table: Option<String>,
        column: String,
    },
    Literal(ScalarValue),
    Cast {
        expr: Box<SqlExpr>,
        target: ColumnType,
    },
    Binary {
        op: ArithmeticOp,
        left: Box<SqlExpr>,
        right: Box<SqlExpr>,
    },
    /// `CASE WHEN n IS NULL OR d IS NULL THEN NULL WHEN d = 0 THEN sentinel
    /// ELSE n / d END`. A null operand wins over a zero divisor.
    SafeDivide {
        numerator: Box<SqlExpr>,
        denominator: Box<SqlExpr>,
        sentinel: ScalarValue,
    },
    Case {
        when: Box<SqlPredicate>,
        then: Box<SqlExpr>,
        otherwise: Box<SqlExpr>,
    },
}

impl SqlExpr {
    pub fn column(table: Option<String>, column: impl Into<String>) -> Self {
        SqlExpr::Column {
            table,
            column: column.into(),
        }
    }

    pub fn is_plain_column(&self) -> bool {
        matches!(self, SqlExpr::Column { .. })
    }

    /// False only for non-null literals.
    pub fn may_be_null(&self) -> bool {
        !matches!(self, SqlExpr::Literal(value) if !value.is_null())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredicateOperand {
    None,
    Expr(SqlExpr),
    List(Vec<ScalarValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SqlPredicate {
    pub left: SqlExpr,
    pub op: CompareOp,
    pub right: PredicateOperand,
}

/// A table or a derived table in FROM / JOIN position.
#[derive(Debug, Clone, PartialEq)]
pub enum FromItem {
    Table { path: String, alias: String },
    Derived { query: Box<SelectQuery>, alias: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    Expr { expr: SqlExpr, alias: String },
    /// `"alias".*`
    Wildcard { table: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinItem {
    pub kind: JoinKind,
    pub item: FromItem,
    pub on: Vec<SqlPredicate>,
}

/// A flattened `SELECT ... FROM ... JOIN ... WHERE ...`.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    pub projection: Vec<SelectItem>,
    pub from: FromItem,
    pub joins: Vec<JoinItem>,
    pub filters: Vec<SqlPredicate>,
}

impl SelectQuery {
    pub fn from_table(path: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            projection: Vec::new(),
            from: FromItem::Table {
                path: path.into(),
                alias: alias.into(),
            },
            joins: Vec::new(),
            filters: Vec::new(),
        }
    }

    pub fn render(&self, dialect: SqlDialect) -> Result<SqlFragment, SqlError> {
        let mut writer = SqlWriter::new(dialect);
        writer.push_select(self)?;
        Ok(writer.finish())
    }
}

/// Accumulates SQL text and parameters, numbering placeholders as they are
/// written.
#[derive(Debug)]
pub struct SqlWriter {
    dialect: SqlDialect,
    sql: String,
    params: Vec<ScalarValue>,
}

impl SqlWriter {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub fn push(&mut self, text: &str) -> &mut Self {
        self.sql.push_str(text);
        self
    }

    pub fn push_ident(&mut self, name: &str) -> Result<&mut Self, SqlError> {
        let quoted = quote_ident(name, self.dialect)?;
        self.sql.push_str(&quoted);
        Ok(self)
    }

    pub fn push_qualified(&mut self, path: &str) -> Result<&mut Self, SqlError> {
        let quoted = quote_qualified(path, self.dialect)?;
        self.sql.push_str(&quoted);
        Ok(self)
    }

    /// Binds a literal. `NULL` is written as the keyword.
    pub fn push_param(&mut self, value: ScalarValue) -> &mut Self {
        let Some(ty) = value.column_type() else {
            self.sql.push_str("NULL");
            return self;
        };
        self.params.push(value);
        let index = self.params.len();
        // Firebird cannot infer parameter types in the select list.
        let typed = match self.dialect {
            SqlDialect::Firebird => self.dialect.cast_type(ty),
            _ => None,
        };
        match typed {
            Some(target) => {
                self.sql.push_str("CAST(");
                self.dialect.write_placeholder(&mut self.sql, index);
                self.sql.push_str(" AS ");
                self.sql.push_str(target);
                self.sql.push(')');
            }
            None => self.dialect.write_placeholder(&mut self.sql, index),
        }
        self
    }

    pub fn push_expr(&mut self, expr: &SqlExpr) -> Result<(), SqlError> {
        match expr {
            SqlExpr::Column { table, column } => {
                if let Some(table) = table {
                    self.push_ident(table)?.push(".");
                }
                self.push_ident(column)?;
            }
            SqlExpr::Literal(value) => {
                self.push_param(value.clone());
            }
            SqlExpr::Cast { expr, target } => {
                let type_name =
                    self.dialect
                        .cast_type(*target)
                        .ok_or(SqlError::UnsupportedCast {
                            dialect: self.dialect,
                            target: *target,
                        })?;
                self.push("CAST(");
                self.push_expr(expr)?;
                self.push(" AS ").push(type_name).push(")");
            }
            SqlExpr::Binary { op, left, right } => {
                self.push("(");
                if *op == ArithmeticOp::Divide {
                    self.push_numerator(left)?;
                } else {
                    self.push_expr(left)?;
                }
                self.push(" ").push(op.as_sql()).push(" ");
                self.push_expr(right)?;
                self.push(")");
            }
            SqlExpr::SafeDivide {
                numerator,
                denominator,
                sentinel,
            } => {
                self.push("CASE ");
                let nullable: Vec<&SqlExpr> = [numerator.as_ref(), denominator.as_ref()]
                    .into_iter()
                    .filter(|expr| expr.may_be_null())
                    .collect();
                if !nullable.is_empty() {
                    self.push("WHEN ");
                    for (index, expr) in nullable.into_iter().enumerate() {
                        if index > 0 {
                            self.push(" OR ");
                        }
                        self.push_expr(expr)?;
                        self.push(" IS NULL");
                    }
                    self.push(" THEN NULL ");
                }
                self.push("WHEN ");
                self.push_expr(denominator)?;
                self.push(" = 0 THEN ");
                self.push_param(sentinel.clone());
                self.push(" ELSE (");
                self.push_numerator(numerator)?;
                self.push(" / ");
                self.push_expr(denominator)?;
                self.push(") END");
            }
            SqlExpr::Case {
                when,
                then,
                otherwise,
            } => {
                self.push("CASE WHEN ");
                self.push_predicate(when)?;
                self.push(" THEN ");
                self.push_expr(then)?;
                self.push(" ELSE ");
                self.push_expr(otherwise)?;
                self.push(" END");
            }
        }
        Ok(())
    }

    fn push_numerator(&mut self, expr: &SqlExpr) -> Result<(), SqlError> {
        match self.dialect.division_cast() {
            Some(target) => {
                self.push("CAST(");
                self.push_expr(expr)?;
                self.push(" AS ").push(target).push(")");
                Ok(())
            }
            None => self.push_expr(expr),
        }
    }

    pub fn push_predicate(&mut self, predicate: &SqlPredicate) -> Result<(), SqlError> {
        self.push_expr(&predicate.left)?;
        match (&predicate.op, &predicate.right) {
            (CompareOp::IsNull | CompareOp::IsNotNull, _) => {
                self.push(" ").push(predicate.op.as_sql());
            }
            (CompareOp::In, PredicateOperand::List(values)) => {
                if values.is_empty() {
                    return Err(SqlError::InvalidOperand(
                        "IN requires a non-empty value list".into(),
                    ));
                }
                self.push(" IN (");
                for (index, value) in values.iter().enumerate() {
                    if index > 0 {
                        self.push(", ");
                    }
                    self.push_param(value.clone());
                }
                self.push(")");
            }
            (CompareOp::In, _) => {
                return Err(SqlError::InvalidOperand(
                    "IN requires a list of values".into(),
                ))
            }
            (op, PredicateOperand::Expr(SqlExpr::Literal(value))) if value.is_null() => {
                return Err(SqlError::InvalidOperand(format!(
                    "{} NULL never matches; use IS NULL or IS NOT NULL",
                    op.as_sql()
                )))
            }
            (op, PredicateOperand::Expr(right)) => {
                self.push(" ").push(op.as_sql()).push(" ");
                self.push_expr(right)?;
            }
            (op, _) => {
                return Err(SqlError::InvalidOperand(format!(
                    "operator {} requires a single operand",
                    op.as_sql()
                )))
            }
        }
        Ok(())
    }

    fn push_conjunction(&mut self, predicates: &[SqlPredicate]) -> Result<(), SqlError> {
        for (index, predicate) in predicates.iter().enumerate() {
            if index > 0 {
                self.push(" AND ");
            }
            self.push_predicate(predicate)?;
        }
        Ok(())
    }

    /// Writes ` WHERE ...` when there is at least one predicate.
    pub fn push_where(&mut self, predicates: &[SqlPredicate]) -> Result<(), SqlError> {
        if predicates.is_empty() {
            return Ok(());
        }
        self.push(" WHERE ");
        self.push_conjunction(predicates)
    }

    fn push_from_item(&mut self, item: &FromItem) -> Result<(), SqlError> {
        match item {
            FromItem::Table { path, alias } => {
                self.push_qualified(path)?.push(" ");
                self.push_ident(alias)?;
            }
            FromItem::Derived { query, alias } => {
                self.push("(");
                self.push_select(query)?;
                self.push(") ");
                self.push_ident(alias)?;
            }
        }
        Ok(())
    }

    pub fn push_select(&mut self, query: &SelectQuery) -> Result<(), SqlError> {
        self.push("SELECT ");
        if query.projection.is_empty() {
            self.push("*");
        }
        for (index, item) in query.projection.iter().enumerate() {
            if index > 0 {
                self.push(", ");
            }
            match item {
                SelectItem::Expr { expr, alias } => {
                    self.push_expr(expr)?;
                    self.push(" AS ");
                    self.push_ident(alias)?;
                }
                SelectItem::Wildcard { table } => {
                    self.push_ident(table)?.push(".*");
                }
            }
        }
        self.push(" FROM ");
        self.push_from_item(&query.from)?;
        for join in &query.joins {
            self.push(" ").push(join.kind.as_sql()).push(" ");
            self.push_from_item(&join.item)?;
            self.push(" ON ");
            self.push_conjunction(&join.on)?;
        }
        self.push_where(&query.filters)
    }

    pub fn finish(self) -> SqlFragment {
        SqlFragment {
            sql: self.sql,
            params: self.params,
        }
    }
}
