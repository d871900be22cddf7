//! Compiles a validated [`Graph`] into a plan.
//!
//! Nodes are folded, in topological order, into SQL stages while their
//! inputs stay on one push-down capable connection. Each stage tracks its
//! columns as [`SqlExpr`] trees over base-table aliases, so later filters
//! inline expressions instead of referencing select-list aliases. The first
//! node that cannot be expressed in SQL materializes its input and everything
//! after it runs in memory.

mod frame;

use std::collections::HashSet;

use tracing::debug;
use vantage_db::sql::{
    quote_qualified, CompareOp, FromItem, JoinItem, JoinKind, PredicateOperand, SelectItem,
    SelectQuery, SqlExpr, SqlPredicate,
};
use vantage_db::{ColumnType, ScalarValue, SqlDialect, SqlFragment};

use crate::connector::Dialect;
use crate::error::EtlError;
use crate::pipeline::{
    ArithmeticRule, CastRule, ColumnRef, Comparison, ConditionRule, Graph, JoinNode, NodeOp,
    Operand, RightOperand, SinkPlan, SourceNode,
};
use crate::transform::{arithmetic_result_type, cast_value, RowErrorPolicy};

pub use frame::{output_names, Frame};

/// A column of a materialized row set.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanColumn {
    pub qualifier: Option<String>,
    pub name: String,
    pub ty: Option<ColumnType>,
}

/// How result columns of a query map back to plan columns. A wildcard spans
/// whatever the database returns beyond the fixed columns.
#[derive(Debug, Clone, PartialEq)]
pub enum LayoutItem {
    Column(PlanColumn),
    Wildcard {
        qualifier: String,
        declared: Option<Vec<(String, Option<ColumnType>)>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub connection: String,
    pub fragment: SqlFragment,
    pub layout: Vec<LayoutItem>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanNode {
    Query(QueryPlan),
    Join {
        left: Box<PlanNode>,
        right: Box<PlanNode>,
        join: JoinNode,
    },
    Filter {
        input: Box<PlanNode>,
        conditions: Vec<Comparison>,
    },
    Cast {
        input: Box<PlanNode>,
        rule: CastRule,
    },
    Arithmetic {
        input: Box<PlanNode>,
        rule: ArithmeticRule,
        output_type: Option<ColumnType>,
    },
    Condition {
        input: Box<PlanNode>,
        rule: ConditionRule,
    },
}

impl PlanNode {
    /// Queries in execution order.
    pub fn queries(&self) -> Vec<&QueryPlan> {
        let mut out = Vec::new();
        self.collect_queries(&mut out);
        out
    }

    fn collect_queries<'a>(&'a self, out: &mut Vec<&'a QueryPlan>) {
        match self {
            PlanNode::Query(query) => out.push(query),
            PlanNode::Join { left, right, .. } => {
                left.collect_queries(out);
                right.collect_queries(out);
            }
            PlanNode::Filter { input, .. }
            | PlanNode::Cast { input, .. }
            | PlanNode::Arithmetic { input, .. }
            | PlanNode::Condition { input, .. } => input.collect_queries(out),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub root: PlanNode,
    pub sink: SinkPlan,
    pub policy: RowErrorPolicy,
}

#[derive(Debug, Clone)]
struct SchemaColumn {
    qualifier: Option<String>,
    name: String,
    ty: Option<ColumnType>,
    expr: Option<SqlExpr>,
}

#[derive(Debug, Clone)]
enum SchemaItem {
    Column(SchemaColumn),
    /// Every column of a source without declared columns. `sql_table` is the
    /// alias its columns are reachable through.
    Open { qualifier: String, sql_table: String },
}

#[derive(Debug, Clone, Default)]
struct Schema {
    items: Vec<SchemaItem>,
}

enum Resolved {
    Column(usize),
    Open { sql_table: String, name: String },
}

fn unresolved(reference: &ColumnRef, detail: &str) -> EtlError {
    EtlError::UnresolvedReference(format!("column '{reference}' {detail}"))
}

impl Schema {
    fn columns(&self) -> impl Iterator<Item = (usize, &SchemaColumn)> {
        self.items.iter().enumerate().filter_map(|(index, item)| match item {
            SchemaItem::Column(column) => Some((index, column)),
            SchemaItem::Open { .. } => None,
        })
    }

    fn opens(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items.iter().filter_map(|item| match item {
            SchemaItem::Open {
                qualifier,
                sql_table,
            } => Some((qualifier.as_str(), sql_table.as_str())),
            SchemaItem::Column(_) => None,
        })
    }

    fn open_count(&self) -> usize {
        self.opens().count()
    }

    /// Qualified references match exactly. Unqualified ones prefer computed
    /// columns, then any unique column name, then the single open source.
    fn resolve(&self, reference: &ColumnRef) -> Result<Resolved, EtlError> {
        let name = reference.name.as_str();
        let open = |sql_table: &str| Resolved::Open {
            sql_table: sql_table.to_owned(),
            name: name.to_owned(),
        };

        if let Some(qualifier) = &reference.qualifier {
            let hits: Vec<usize> = self
                .columns()
                .filter(|(_, c)| {
                    c.qualifier.as_deref() == Some(qualifier.as_str()) && c.name == name
                })
                .map(|(index, _)| index)
                .collect();
            return match hits.as_slice() {
                [index] => Ok(Resolved::Column(*index)),
                [] => self
                    .opens()
                    .find(|(q, _)| *q == qualifier.as_str())
                    .map(|(_, sql_table)| open(sql_table))
                    .ok_or_else(|| unresolved(reference, "is not produced by any input")),
                _ => Err(unresolved(reference, "is ambiguous")),
            };
        }

        let computed: Vec<usize> = self
            .columns()
            .filter(|(_, c)| c.qualifier.is_none() && c.name == name)
            .map(|(index, _)| index)
            .collect();
        if let [index] = computed.as_slice() {
            return Ok(Resolved::Column(*index));
        }

        let hits: Vec<usize> = self
            .columns()
            .filter(|(_, c)| c.name == name)
            .map(|(index, _)| index)
            .collect();
        match hits.as_slice() {
            [index] => Ok(Resolved::Column(*index)),
            [] => {
                let opens: Vec<&str> = self.opens().map(|(_, sql_table)| sql_table).collect();
                match opens.as_slice() {
                    [sql_table] => Ok(open(sql_table)),
                    [] => Err(unresolved(reference, "is not produced by any input")),
                    _ => Err(unresolved(
                        reference,
                        "is ambiguous; qualify it with a source alias",
                    )),
                }
            }
            _ => Err(unresolved(
                reference,
                "is ambiguous; qualify it with a source alias",
            )),
        }
    }

    fn column(&self, index: usize) -> Option<&SchemaColumn> {
        match self.items.get(index) {
            Some(SchemaItem::Column(column)) => Some(column),
            _ => None,
        }
    }

    fn ty(&self, resolved: &Resolved) -> Option<ColumnType> {
        match resolved {
            Resolved::Column(index) => self.column(*index).and_then(|c| c.ty),
            Resolved::Open { .. } => None,
        }
    }

    fn expr(&self, resolved: &Resolved) -> Option<SqlExpr> {
        match resolved {
            Resolved::Column(index) => self.column(*index).and_then(|c| c.expr.clone()),
            Resolved::Open { sql_table, name } => {
                Some(SqlExpr::column(Some(sql_table.clone()), name.clone()))
            }
        }
    }

    /// Adds a rule output, replacing an earlier rule output of the same name.
    fn put_computed(&mut self, name: &str, ty: Option<ColumnType>, expr: Option<SqlExpr>) {
        let column = SchemaColumn {
            qualifier: None,
            name: name.to_owned(),
            ty,
            expr,
        };
        let existing = self
            .columns()
            .find(|(_, c)| c.qualifier.is_none() && c.name == name)
            .map(|(index, _)| index);
        match existing {
            Some(index) => self.items[index] = SchemaItem::Column(column),
            None => self.items.push(SchemaItem::Column(column)),
        }
    }

    fn without_exprs(mut self) -> Schema {
        for item in &mut self.items {
            if let SchemaItem::Column(column) = item {
                column.expr = None;
            }
        }
        self
    }

    fn has_computed(&self) -> bool {
        self.columns()
            .any(|(_, c)| !matches!(c.expr, Some(SqlExpr::Column { .. })))
    }

    fn concat(mut self, other: Schema) -> Schema {
        self.items.extend(other.items);
        self
    }
}

#[derive(Debug, Clone)]
struct SqlStage {
    connection: String,
    dialect: Dialect,
    from: FromItem,
    joins: Vec<JoinItem>,
    filters: Vec<SqlPredicate>,
    tables: Vec<String>,
    schema: Schema,
}

impl SqlStage {
    fn sql_dialect(&self) -> SqlDialect {
        self.dialect.sql_dialect()
    }

    fn select(&self) -> Result<(SelectQuery, Vec<LayoutItem>), EtlError> {
        let mut projection = Vec::with_capacity(self.schema.items.len());
        let mut layout = Vec::with_capacity(self.schema.items.len());
        for (index, item) in self.schema.items.iter().enumerate() {
            match item {
                SchemaItem::Column(column) => {
                    let expr = column.expr.clone().ok_or_else(|| {
                        EtlError::InvalidPipeline(format!(
                            "column '{}' has no SQL expression",
                            column.name
                        ))
                    })?;
                    projection.push(SelectItem::Expr {
                        expr,
                        alias: format!("__c{index}"),
                    });
                    layout.push(LayoutItem::Column(PlanColumn {
                        qualifier: column.qualifier.clone(),
                        name: column.name.clone(),
                        ty: column.ty,
                    }));
                }
                SchemaItem::Open {
                    qualifier,
                    sql_table,
                } => {
                    projection.push(SelectItem::Wildcard {
                        table: sql_table.clone(),
                    });
                    layout.push(LayoutItem::Wildcard {
                        qualifier: qualifier.clone(),
                        declared: None,
                    });
                }
            }
        }
        let query = SelectQuery {
            projection,
            from: self.from.clone(),
            joins: self.joins.clone(),
            filters: self.filters.clone(),
        };
        Ok((query, layout))
    }

    fn materialize(self) -> Result<(PlanNode, Schema), EtlError> {
        let (query, layout) = self.select()?;
        let fragment = query.render(self.sql_dialect())?;
        debug!(connection = %self.connection, sql = %fragment.sql, "stage compiled");
        let node = PlanNode::Query(QueryPlan {
            connection: self.connection,
            fragment,
            layout,
        });
        Ok((node, self.schema.without_exprs()))
    }
}

#[derive(Debug, Clone)]
enum Stage {
    Sql(SqlStage),
    Memory(PlanNode, Schema),
}

impl Stage {
    fn schema(&self) -> &Schema {
        match self {
            Stage::Sql(stage) => &stage.schema,
            Stage::Memory(_, schema) => schema,
        }
    }

    fn materialize(self) -> Result<(PlanNode, Schema), EtlError> {
        match self {
            Stage::Sql(stage) => stage.materialize(),
            Stage::Memory(node, schema) => Ok((node, schema)),
        }
    }
}

/// Numeric literals compare against any numeric column as they are; other
/// literals are converted to the column type.
fn coerce_literal(
    value: &ScalarValue,
    ty: Option<ColumnType>,
    context: &str,
) -> Result<ScalarValue, EtlError> {
    let (Some(ty), Some(own)) = (ty, value.column_type()) else {
        return Ok(value.clone());
    };
    if own == ty || (ty.is_numeric() && own.is_numeric()) {
        return Ok(value.clone());
    }
    cast_value(value, ty).map_err(|err| EtlError::IncompatibleTypes(format!("{context}: {err}")))
}

/// Common type of two branches. Text only absorbs other types when declared.
fn common_type(a: ColumnType, b: ColumnType) -> Option<ColumnType> {
    if a == b {
        Some(a)
    } else if a != ColumnType::Text && a.accepts(b) {
        Some(a)
    } else if b != ColumnType::Text && b.accepts(a) {
        Some(b)
    } else {
        None
    }
}

fn sql_expr(schema: &Schema, reference: &ColumnRef) -> Result<SqlExpr, EtlError> {
    let resolved = schema.resolve(reference)?;
    schema.expr(&resolved).ok_or_else(|| {
        EtlError::InvalidPipeline(format!("column '{reference}' has no SQL expression"))
    })
}

fn coerce_comparison(
    schema: &Schema,
    comparison: &Comparison,
    context: &str,
) -> Result<Comparison, EtlError> {
    let left = schema.resolve(&comparison.column)?;
    let ty = schema.ty(&left);
    let right = match &comparison.right {
        RightOperand::Value(value) if comparison.op != CompareOp::Like => {
            RightOperand::Value(coerce_literal(value, ty, context)?)
        }
        RightOperand::List(values) => RightOperand::List(
            values
                .iter()
                .map(|value| coerce_literal(value, ty, context))
                .collect::<Result<_, _>>()?,
        ),
        RightOperand::Column(reference) => {
            schema.resolve(reference)?;
            RightOperand::Column(reference.clone())
        }
        other => other.clone(),
    };
    Ok(Comparison {
        column: comparison.column.clone(),
        op: comparison.op,
        right,
    })
}

fn sql_predicate(schema: &Schema, comparison: &Comparison) -> Result<SqlPredicate, EtlError> {
    let right = match &comparison.right {
        RightOperand::None => PredicateOperand::None,
        RightOperand::Value(value) => PredicateOperand::Expr(SqlExpr::Literal(value.clone())),
        RightOperand::List(values) => PredicateOperand::List(values.clone()),
        RightOperand::Column(reference) => PredicateOperand::Expr(sql_expr(schema, reference)?),
    };
    Ok(SqlPredicate {
        left: sql_expr(schema, &comparison.column)?,
        op: comparison.op,
        right,
    })
}

fn arithmetic_expr(
    rule: &ArithmeticRule,
    exprs: Vec<SqlExpr>,
) -> Result<SqlExpr, EtlError> {
    let Some((first, rest)) = exprs.split_first() else {
        return Err(EtlError::InvalidPipeline(format!(
            "arithmetic '{}' has no operands",
            rule.output
        )));
    };

    if rule.op == vantage_db::sql::ArithmeticOp::Divide {
        if let [denominator] = rest {
            return Ok(SqlExpr::SafeDivide {
                numerator: Box::new(first.clone()),
                denominator: Box::new(denominator.clone()),
                sentinel: rule.divide_by_zero.clone(),
            });
        }
    }

    let core = rest.iter().fold(first.clone(), |acc, next| SqlExpr::Binary {
        op: rule.op,
        left: Box::new(acc),
        right: Box::new(next.clone()),
    });
    if rule.op != vantage_db::sql::ArithmeticOp::Divide {
        return Ok(core);
    }
    // Any zero divisor short-circuits to the sentinel. A null operand wins
    // over both.
    let guarded = rest.iter().rev().fold(core, |otherwise, denominator| SqlExpr::Case {
        when: Box::new(SqlPredicate {
            left: denominator.clone(),
            op: CompareOp::Eq,
            right: PredicateOperand::Expr(SqlExpr::Literal(ScalarValue::Integer(0))),
        }),
        then: Box::new(SqlExpr::Literal(rule.divide_by_zero.clone())),
        otherwise: Box::new(otherwise),
    });
    Ok(exprs
        .iter()
        .filter(|expr| expr.may_be_null())
        .fold(guarded, |otherwise, operand| SqlExpr::Case {
            when: Box::new(SqlPredicate {
                left: operand.clone(),
                op: CompareOp::IsNull,
                right: PredicateOperand::None,
            }),
            then: Box::new(SqlExpr::Literal(ScalarValue::Null)),
            otherwise: Box::new(otherwise),
        }))
}

struct Branch {
    operand: Operand,
    ty: Option<ColumnType>,
    expr: Option<SqlExpr>,
}

fn branch(
    schema: &Schema,
    operand: &Operand,
    declared: Option<ColumnType>,
    context: &str,
) -> Result<Branch, EtlError> {
    match operand {
        Operand::Column(reference) => {
            let resolved = schema.resolve(reference)?;
            let ty = schema.ty(&resolved);
            if let (Some(declared), Some(ty)) = (declared, ty) {
                if !declared.accepts(ty) {
                    return Err(EtlError::IncompatibleTypes(format!(
                        "{context}: branch column '{reference}' is {ty}, output is {declared}"
                    )));
                }
            }
            Ok(Branch {
                operand: operand.clone(),
                ty,
                expr: schema.expr(&resolved),
            })
        }
        Operand::Literal(value) => {
            let value = match declared {
                Some(declared) if !value.is_null() => cast_value(value, declared).map_err(|err| {
                    EtlError::IncompatibleTypes(format!("{context}: {err}"))
                })?,
                _ => value.clone(),
            };
            Ok(Branch {
                ty: value.column_type(),
                expr: Some(SqlExpr::Literal(value.clone())),
                operand: Operand::Literal(value),
            })
        }
    }
}

#[derive(Default)]
struct Compiler {
    derived: usize,
}

/// Compiles a validated graph. Every identifier is quoted here, so a plan
/// that compiles renders no further identifiers except sink columns.
pub fn compile(graph: &Graph) -> Result<Plan, EtlError> {
    let mut compiler = Compiler::default();
    let mut stages: Vec<Stage> = Vec::with_capacity(graph.steps.len());
    for step in &graph.steps {
        let input = |position: usize| -> Result<Stage, EtlError> {
            step.inputs
                .get(position)
                .and_then(|index| stages.get(*index))
                .cloned()
                .ok_or_else(|| {
                    EtlError::InvalidPipeline(format!("node '{}' is missing an input", step.id))
                })
        };
        let stage = match &step.op {
            NodeOp::Source(source) => source_stage(source)?,
            NodeOp::Filter(conditions) => filter(input(0)?, conditions, &step.id)?,
            NodeOp::Cast(rule) => cast(input(0)?, rule, &step.id)?,
            NodeOp::Arithmetic(rule) => arithmetic(input(0)?, rule, &step.id)?,
            NodeOp::Condition(rule) => condition(input(0)?, rule, &step.id)?,
            NodeOp::Join(join) => compiler.join(input(0)?, input(1)?, join, &step.id)?,
        };
        stages.push(stage);
    }

    let output = stages.get(graph.output).cloned().ok_or_else(|| {
        EtlError::InvalidPipeline("the sink input was not compiled".into())
    })?;
    let (root, _) = output.materialize()?;
    Ok(Plan {
        root,
        sink: graph.sink.clone(),
        policy: graph.policy,
    })
}

fn source_stage(source: &SourceNode) -> Result<Stage, EtlError> {
    let alias = source.alias.clone();
    let schema = match &source.columns {
        Some(columns) => Schema {
            items: columns
                .iter()
                .map(|(name, ty)| {
                    SchemaItem::Column(SchemaColumn {
                        qualifier: Some(alias.clone()),
                        name: name.clone(),
                        ty: *ty,
                        expr: Some(SqlExpr::column(Some(alias.clone()), name.clone())),
                    })
                })
                .collect(),
        },
        None => Schema {
            items: vec![SchemaItem::Open {
                qualifier: alias.clone(),
                sql_table: alias.clone(),
            }],
        },
    };

    if source.dialect.supports_push_down() {
        return Ok(Stage::Sql(SqlStage {
            connection: source.connection.clone(),
            dialect: source.dialect,
            from: FromItem::Table {
                path: source.table.clone(),
                alias: alias.clone(),
            },
            joins: Vec::new(),
            filters: Vec::new(),
            tables: vec![alias],
            schema,
        }));
    }

    let sql = format!(
        "SELECT * FROM {}",
        quote_qualified(&source.table, source.dialect.sql_dialect())?
    );
    let node = PlanNode::Query(QueryPlan {
        connection: source.connection.clone(),
        fragment: SqlFragment {
            sql,
            params: Vec::new(),
        },
        layout: vec![LayoutItem::Wildcard {
            qualifier: alias,
            declared: source.columns.clone(),
        }],
    });
    Ok(Stage::Memory(node, schema.without_exprs()))
}

fn filter(stage: Stage, conditions: &[Comparison], node: &str) -> Result<Stage, EtlError> {
    let context = format!("filter '{node}'");
    let coerced = conditions
        .iter()
        .map(|c| coerce_comparison(stage.schema(), c, &context))
        .collect::<Result<Vec<_>, _>>()?;

    match stage {
        Stage::Sql(mut sql) => {
            for comparison in &coerced {
                let predicate = sql_predicate(&sql.schema, comparison)?;
                sql.filters.push(predicate);
            }
            Ok(Stage::Sql(sql))
        }
        Stage::Memory(input, schema) => Ok(Stage::Memory(
            PlanNode::Filter {
                input: Box::new(input),
                conditions: coerced,
            },
            schema,
        )),
    }
}

fn cast(stage: Stage, rule: &CastRule, node: &str) -> Result<Stage, EtlError> {
    let resolved = stage.schema().resolve(&rule.column)?;

    if let (Stage::Sql(sql), Resolved::Column(index)) = (&stage, &resolved) {
        let has_cast = sql.sql_dialect().cast_type(rule.target).is_some();
        if rule.policy == RowErrorPolicy::Abort && has_cast {
            let mut sql = sql.clone();
            if let Some(SchemaItem::Column(column)) = sql.schema.items.get_mut(*index) {
                if let Some(expr) = column.expr.take() {
                    column.expr = Some(SqlExpr::Cast {
                        expr: Box::new(expr),
                        target: rule.target,
                    });
                    column.ty = Some(rule.target);
                    return Ok(Stage::Sql(sql));
                }
            }
        }
    }

    debug!(node, "cast runs in memory");
    let (input, mut schema) = stage.materialize()?;
    match resolved {
        Resolved::Column(index) => {
            if let Some(SchemaItem::Column(column)) = schema.items.get_mut(index) {
                column.ty = Some(rule.target);
            }
        }
        Resolved::Open { .. } => {
            // Shadow the open column so later nodes see its new type.
            let qualifier = match &rule.column.qualifier {
                Some(qualifier) => Some(qualifier.clone()),
                None => schema.opens().next().map(|(q, _)| q.to_owned()),
            };
            schema.items.push(SchemaItem::Column(SchemaColumn {
                qualifier,
                name: rule.column.name.clone(),
                ty: Some(rule.target),
                expr: None,
            }));
        }
    }
    Ok(Stage::Memory(
        PlanNode::Cast {
            input: Box::new(input),
            rule: rule.clone(),
        },
        schema,
    ))
}

fn arithmetic(stage: Stage, rule: &ArithmeticRule, node: &str) -> Result<Stage, EtlError> {
    let schema = stage.schema();
    let mut types = Vec::with_capacity(rule.operands.len());
    let mut exprs = Vec::with_capacity(rule.operands.len());
    for operand in &rule.operands {
        match operand {
            Operand::Column(reference) => {
                let resolved = schema.resolve(reference)?;
                types.push(schema.ty(&resolved));
                exprs.push(schema.expr(&resolved));
            }
            Operand::Literal(value) => {
                types.push(value.column_type());
                exprs.push(Some(SqlExpr::Literal(value.clone())));
            }
        }
    }
    let output_type = arithmetic_result_type(rule.op, &types);
    let non_numeric = types.iter().flatten().any(|ty| !ty.is_numeric());

    if let Stage::Sql(sql) = &stage {
        let exprs: Option<Vec<SqlExpr>> = exprs.into_iter().collect();
        if let (false, Some(exprs)) = (non_numeric, exprs) {
            let expr = arithmetic_expr(rule, exprs)?;
            let mut sql = sql.clone();
            sql.schema.put_computed(&rule.output, output_type, Some(expr));
            return Ok(Stage::Sql(sql));
        }
    }

    debug!(node, "arithmetic runs in memory");
    let (input, mut schema) = stage.materialize()?;
    schema.put_computed(&rule.output, output_type, None);
    Ok(Stage::Memory(
        PlanNode::Arithmetic {
            input: Box::new(input),
            rule: rule.clone(),
            output_type,
        },
        schema,
    ))
}

fn condition(stage: Stage, rule: &ConditionRule, node: &str) -> Result<Stage, EtlError> {
    let context = format!("condition '{node}'");
    let schema = stage.schema();
    let predicate = coerce_comparison(schema, &rule.predicate, &context)?;
    let then = branch(schema, &rule.then, rule.output_type, &context)?;
    let otherwise = branch(schema, &rule.otherwise, rule.output_type, &context)?;

    let output_type = match (rule.output_type, then.ty, otherwise.ty) {
        (Some(declared), _, _) => Some(declared),
        (None, Some(a), Some(b)) => Some(common_type(a, b).ok_or_else(|| {
            EtlError::IncompatibleTypes(format!(
                "{context}: branches are {a} and {b}; set outputType to combine them"
            ))
        })?),
        (None, a, b) => a.or(b),
    };

    let resolved = ConditionRule {
        predicate,
        then: then.operand.clone(),
        otherwise: otherwise.operand.clone(),
        output: rule.output.clone(),
        output_type,
        policy: rule.policy,
    };

    if let Stage::Sql(sql) = &stage {
        let dialect = sql.sql_dialect();
        let fit = |b: &Branch| -> Option<SqlExpr> {
            let expr = b.expr.clone()?;
            match (output_type, b.ty) {
                (Some(target), Some(ty)) if target != ty => {
                    dialect.cast_type(target)?;
                    Some(SqlExpr::Cast {
                        expr: Box::new(expr),
                        target,
                    })
                }
                _ => Some(expr),
            }
        };
        if let (Some(then_expr), Some(else_expr)) = (fit(&then), fit(&otherwise)) {
            let when = sql_predicate(&sql.schema, &resolved.predicate)?;
            let expr = SqlExpr::Case {
                when: Box::new(when),
                then: Box::new(then_expr),
                otherwise: Box::new(else_expr),
            };
            let mut sql = sql.clone();
            sql.schema.put_computed(&rule.output, output_type, Some(expr));
            return Ok(Stage::Sql(sql));
        }
    }

    debug!(node, "condition runs in memory");
    let (input, mut schema) = stage.materialize()?;
    schema.put_computed(&rule.output, output_type, None);
    Ok(Stage::Memory(
        PlanNode::Condition {
            input: Box::new(input),
            rule: resolved,
        },
        schema,
    ))
}

impl Compiler {
    fn join(&mut self, left: Stage, right: Stage, join: &JoinNode, node: &str) -> Result<Stage, EtlError> {
        left.schema().resolve(&join.left_column)?;
        right.schema().resolve(&join.right_column)?;

        match (left, right) {
            (Stage::Sql(left), Stage::Sql(right)) if Self::can_fuse(&left, &right, join) => {
                self.fuse(left, right, join)
            }
            (left, right) => {
                debug!(node, "join runs in memory");
                let (left, left_schema) = left.materialize()?;
                let (right, right_schema) = right.materialize()?;
                Ok(Stage::Memory(
                    PlanNode::Join {
                        left: Box::new(left),
                        right: Box::new(right),
                        join: join.clone(),
                    },
                    left_schema.concat(right_schema),
                ))
            }
        }
    }

    /// A derived right side can only be projected through its fixed columns,
    /// so an open source inside one keeps the join in memory.
    fn can_fuse(left: &SqlStage, right: &SqlStage, join: &JoinNode) -> bool {
        let disjoint = {
            let tables: HashSet<&String> = left.tables.iter().collect();
            right.tables.iter().all(|table| !tables.contains(table))
        };
        left.connection == right.connection
            && left.dialect == right.dialect
            && left.schema.open_count() + right.schema.open_count() <= 1
            && !(Self::needs_derived(right, join) && right.schema.open_count() > 0)
            && disjoint
    }

    fn needs_derived(right: &SqlStage, join: &JoinNode) -> bool {
        !right.joins.is_empty() || (join.kind == JoinKind::Left && right.schema.has_computed())
    }

    fn fuse(&mut self, mut left: SqlStage, right: SqlStage, join: &JoinNode) -> Result<Stage, EtlError> {
        let (item, mut on, right_schema, right_tables) = if Self::needs_derived(&right, join) {
            self.derived += 1;
            let alias = format!("__d{}", self.derived);
            let (query, _) = right.select()?;
            let schema = Schema {
                items: right
                    .schema
                    .items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| match item {
                        SchemaItem::Column(column) => SchemaItem::Column(SchemaColumn {
                            expr: Some(SqlExpr::column(Some(alias.clone()), format!("__c{index}"))),
                            ..column.clone()
                        }),
                        SchemaItem::Open { qualifier, .. } => SchemaItem::Open {
                            qualifier: qualifier.clone(),
                            sql_table: alias.clone(),
                        },
                    })
                    .collect(),
            };
            let item = FromItem::Derived {
                query: Box::new(query),
                alias: alias.clone(),
            };
            (item, Vec::new(), schema, vec![alias])
        } else {
            // Right-side filters belong to the ON clause so a left join keeps
            // unmatched rows.
            (right.from, right.filters, right.schema, right.tables)
        };

        let key = SqlPredicate {
            left: sql_expr(&left.schema, &join.left_column)?,
            op: CompareOp::Eq,
            right: PredicateOperand::Expr(sql_expr(&right_schema, &join.right_column)?),
        };
        on.insert(0, key);

        left.joins.push(JoinItem {
            kind: join.kind,
            item,
            on,
        });
        left.tables.extend(right_tables);
        left.schema = left.schema.concat(right_schema);
        Ok(Stage::Sql(left))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{ConnectionDescriptor, ConnectionMap};
    use crate::pipeline::{validate, PipelineDescriptor};
    use crate::ErrorKind;
    use serde_json::{json, Value};

    fn connections() -> ConnectionMap {
        [("pg", "postgres"), ("pg2", "postgres"), ("xlsx", "excel")]
            .into_iter()
            .map(|(id, dialect)| {
                let descriptor: ConnectionDescriptor = serde_json::from_value(json!({
                    "id": id,
                    "dialect": dialect,
                    "host": "localhost",
                    "database": "shop",
                    "user": "etl"
                }))
                .unwrap();
                (id.to_string(), descriptor)
            })
            .collect()
    }

    fn plan(value: Value) -> Result<Plan, EtlError> {
        let pipeline: PipelineDescriptor = serde_json::from_value(value).unwrap();
        compile(&validate(&pipeline, &connections())?)
    }

    fn chain(nodes: Vec<Value>) -> Value {
        let ids: Vec<String> = nodes
            .iter()
            .map(|n| n["id"].as_str().unwrap().to_string())
            .collect();
        let mut edges: Vec<Value> = ids
            .windows(2)
            .map(|pair| json!({"from": pair[0], "to": pair[1]}))
            .collect();
        let last = ids.last().unwrap().clone();
        edges.push(json!({"from": last, "to": "out"}));
        let mut nodes = nodes;
        nodes.push(json!({"id": "out", "kind": "sink"}));
        json!({"nodes": nodes, "edges": edges, "sink": {"tableName": "report"}})
    }

    fn sales(columns: Option<Value>) -> Value {
        let mut config = json!({"connection": "pg", "table": "public.sales"});
        if let Some(columns) = columns {
            config["columns"] = columns;
        }
        json!({"id": "src", "kind": "source", "config": config})
    }

    fn only_query(plan: &Plan) -> &QueryPlan {
        match &plan.root {
            PlanNode::Query(query) => query,
            other => panic!("expected a single query, got {other:?}"),
        }
    }

    #[test]
    fn filters_push_down_and_lenient_casts_stay_in_memory() {
        let plan = plan(chain(vec![
            sales(None),
            json!({"id": "f", "kind": "filter", "config": {"conditions": [
                {"column": "amount", "operator": ">", "value": 100}
            ]}}),
            json!({"id": "c", "kind": "cast", "config": {"column": "amount", "targetType": "decimal"}}),
        ]))
        .unwrap();

        let PlanNode::Cast { input, rule } = &plan.root else {
            panic!("expected a cast, got {:?}", plan.root);
        };
        assert_eq!(rule.target, ColumnType::Decimal);
        let PlanNode::Query(query) = input.as_ref() else {
            panic!("expected a query under the cast");
        };
        assert_eq!(
            query.fragment.sql,
            r#"SELECT "sales".* FROM "public"."sales" "sales" WHERE "sales"."amount" > $1"#
        );
        assert_eq!(query.fragment.params, vec![ScalarValue::Integer(100)]);
    }

    #[test]
    fn strict_casts_on_declared_columns_push_down() {
        let mut value = chain(vec![
            sales(Some(json!([
                {"name": "id", "type": "integer"},
                {"name": "amount", "type": "text"}
            ]))),
            json!({"id": "c", "kind": "cast", "config": {"column": "amount", "targetType": "decimal"}}),
            json!({"id": "f", "kind": "filter", "config": {"conditions": [
                {"column": "amount", "operator": ">", "value": 100}
            ]}}),
        ]);
        value["settings"] = json!({"onError": "abort"});

        let plan = plan(value).unwrap();
        let query = only_query(&plan);
        assert_eq!(
            query.fragment.sql,
            concat!(
                r#"SELECT "sales"."id" AS "__c0", CAST("sales"."amount" AS NUMERIC) AS "__c1" "#,
                r#"FROM "public"."sales" "sales" WHERE CAST("sales"."amount" AS NUMERIC) > $1"#
            )
        );
        assert_eq!(
            query.layout[1],
            LayoutItem::Column(PlanColumn {
                qualifier: Some("sales".into()),
                name: "amount".into(),
                ty: Some(ColumnType::Decimal),
            })
        );
    }

    fn join_pipeline(customer_connection: &str) -> Value {
        json!({
            "nodes": [
                {"id": "s", "kind": "source", "config": {
                    "connection": "pg", "table": "public.sales", "alias": "s",
                    "columns": [{"name": "id"}, {"name": "customer_id"}, {"name": "amount"}]
                }},
                {"id": "c", "kind": "source", "config": {
                    "connection": customer_connection, "table": "public.customers", "alias": "c",
                    "columns": [{"name": "id"}, {"name": "name"}]
                }},
                {"id": "j", "kind": "join", "config": {
                    "left": "s", "right": "c",
                    "leftColumn": "s.customer_id", "rightColumn": "c.id"
                }},
                {"id": "out", "kind": "sink"}
            ],
            "edges": [
                {"from": "s", "to": "j"},
                {"from": "c", "to": "j"},
                {"from": "j", "to": "out"}
            ],
            "sink": {"tableName": "sales_by_customer"}
        })
    }

    #[test]
    fn joins_on_one_connection_become_one_query() {
        let plan = plan(join_pipeline("pg")).unwrap();
        let query = only_query(&plan);
        assert!(query.fragment.sql.contains(
            r#"FROM "public"."sales" "s" INNER JOIN "public"."customers" "c" ON "s"."customer_id" = "c"."id""#
        ));
        assert_eq!(query.layout.len(), 5);
    }

    fn credit_join(join_type: &str) -> Value {
        json!({
            "nodes": [
                {"id": "s", "kind": "source", "config": {
                    "connection": "pg", "table": "public.sales", "alias": "s",
                    "columns": [{"name": "id"}, {"name": "customer_id"}]
                }},
                {"id": "c", "kind": "source", "config": {
                    "connection": "pg", "table": "public.customers", "alias": "c"
                }},
                {"id": "a", "kind": "arithmetic", "config": {
                    "operands": [{"column": "c.credit"}, 2],
                    "operator": "*",
                    "outputColumn": "double_credit"
                }},
                {"id": "j", "kind": "join", "config": {
                    "left": "s", "right": "a", "joinType": join_type,
                    "leftColumn": "s.customer_id", "rightColumn": "c.id"
                }},
                {"id": "out", "kind": "sink"}
            ],
            "edges": [
                {"from": "s", "to": "j"},
                {"from": "c", "to": "a"},
                {"from": "a", "to": "j"},
                {"from": "j", "to": "out"}
            ],
            "sink": {"tableName": "sales_credit"}
        })
    }

    #[test]
    fn left_join_on_open_computed_side_runs_in_memory() {
        let plan = plan(credit_join("left")).unwrap();
        let PlanNode::Join { join, .. } = &plan.root else {
            panic!("expected an in-memory join, got {:?}", plan.root);
        };
        assert_eq!(join.kind, JoinKind::Left);
        let queries = plan.root.queries();
        assert_eq!(queries.len(), 2);
        assert!(queries.iter().all(|q| !q.fragment.sql.contains("__d")));
    }

    #[test]
    fn inner_join_on_open_computed_side_stays_in_sql() {
        let plan = plan(credit_join("inner")).unwrap();
        let query = only_query(&plan);
        assert!(query.fragment.sql.contains(r#"INNER JOIN "public"."customers" "c""#));
        assert!(!query.fragment.sql.contains("__d"));
    }

    #[test]
    fn joins_across_connections_run_in_memory() {
        let plan = plan(join_pipeline("pg2")).unwrap();
        assert!(matches!(plan.root, PlanNode::Join { .. }));
        let connections: Vec<&str> = plan
            .root
            .queries()
            .iter()
            .map(|q| q.connection.as_str())
            .collect();
        assert_eq!(connections, vec!["pg", "pg2"]);
    }

    #[test]
    fn spreadsheet_sources_are_read_whole() {
        let plan = plan(chain(vec![
            json!({"id": "src", "kind": "source", "config": {"connection": "xlsx", "table": "uploads.budget"}}),
            json!({"id": "a", "kind": "arithmetic", "config": {
                "operands": [{"column": "amount"}, 2],
                "operator": "*",
                "outputColumn": "doubled"
            }}),
        ]))
        .unwrap();

        let PlanNode::Arithmetic { input, .. } = &plan.root else {
            panic!("expected in-memory arithmetic, got {:?}", plan.root);
        };
        let PlanNode::Query(query) = input.as_ref() else {
            panic!("expected a query under the arithmetic");
        };
        assert_eq!(query.fragment.sql, r#"SELECT * FROM "uploads"."budget""#);
        assert_eq!(query.connection, "xlsx");
    }

    #[test]
    fn pushed_division_guards_against_zero() {
        let plan = plan(chain(vec![
            sales(Some(json!([
                {"name": "revenue", "type": "integer"},
                {"name": "units", "type": "integer"}
            ]))),
            json!({"id": "a", "kind": "arithmetic", "config": {
                "operands": [{"column": "revenue"}, {"column": "units"}],
                "operator": "/",
                "outputColumn": "per_unit",
                "divideByZero": 0
            }}),
        ]))
        .unwrap();

        let query = only_query(&plan);
        assert!(query
            .fragment
            .sql
            .contains(concat!(
                r#"CASE WHEN "sales"."revenue" IS NULL OR "sales"."units" IS NULL THEN NULL "#,
                r#"WHEN "sales"."units" = 0 THEN $1 ELSE"#
            )));
        assert_eq!(query.fragment.params, vec![ScalarValue::Integer(0)]);
        assert_eq!(
            query.layout[2],
            LayoutItem::Column(PlanColumn {
                qualifier: None,
                name: "per_unit".into(),
                ty: Some(ColumnType::Decimal),
            })
        );
    }

    #[test]
    fn chained_division_checks_nulls_before_zero_divisors() {
        let plan = plan(chain(vec![
            sales(Some(json!([
                {"name": "revenue", "type": "integer"},
                {"name": "units", "type": "integer"}
            ]))),
            json!({"id": "a", "kind": "arithmetic", "config": {
                "operands": [{"column": "revenue"}, {"column": "units"}, 2],
                "operator": "/",
                "outputColumn": "half_per_unit",
                "divideByZero": 0
            }}),
        ]))
        .unwrap();

        let sql = &only_query(&plan).fragment.sql;
        let nulls = sql.find(r#"CASE WHEN "sales"."units" IS NULL THEN NULL"#).unwrap();
        let zeros = sql.find(r#"CASE WHEN "sales"."units" = $"#).unwrap();
        assert!(nulls < zeros, "{sql}");
        assert!(sql.contains(r#"CASE WHEN "sales"."revenue" IS NULL THEN NULL"#));
    }

    #[test]
    fn branches_without_a_common_type_are_rejected() {
        let err = plan(chain(vec![
            sales(Some(json!([{"name": "amount", "type": "decimal"}]))),
            json!({"id": "t", "kind": "condition", "config": {
                "predicate": {"column": "amount", "operator": ">", "value": 1000},
                "thenValue": "high",
                "elseValue": 0,
                "outputColumn": "tier"
            }}),
        ]))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IncompatibleTypes);
    }

    #[test]
    fn conditions_push_down_as_case_expressions() {
        let plan = plan(chain(vec![
            sales(Some(json!([{"name": "amount", "type": "decimal"}]))),
            json!({"id": "t", "kind": "condition", "config": {
                "predicate": {"column": "amount", "operator": ">", "value": 1000},
                "thenValue": "high",
                "elseValue": "low",
                "outputColumn": "tier"
            }}),
        ]))
        .unwrap();
        let query = only_query(&plan);
        assert!(query
            .fragment
            .sql
            .contains(r#"CASE WHEN "sales"."amount" > $1 THEN $2 ELSE $3 END AS "__c1""#));
    }

    #[test]
    fn unknown_columns_fail_to_compile() {
        let err = plan(chain(vec![
            sales(Some(json!([{"name": "amount"}]))),
            json!({"id": "f", "kind": "filter", "config": {"conditions": [
                {"column": "region", "operator": "=", "value": "EU"}
            ]}}),
        ]))
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnresolvedReference);
    }
}
