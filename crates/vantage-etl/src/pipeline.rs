//! Pipeline descriptors and their structural validation.
//!
//! [`validate`] turns the loosely typed descriptor into a [`Graph`] of
//! closed enums in topological order. It never touches a connector.

use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use vantage_db::sql::{quote_ident, quote_qualified, split_qualified, ArithmeticOp, CompareOp, JoinKind};
use vantage_db::{ColumnType, ScalarValue, SqlDialect, WriteMode};

use crate::connector::{ConnectionMap, Dialect};
use crate::error::EtlError;
use crate::transform::RowErrorPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineDescriptor {
    pub nodes: Vec<NodeDescriptor>,
    #[serde(default)]
    pub edges: Vec<EdgeDescriptor>,
    pub sink: SinkDescriptor,
    #[serde(default)]
    pub settings: PipelineSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Source,
    Join,
    Filter,
    Cast,
    Arithmetic,
    Condition,
    Sink,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDescriptor {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkDescriptor {
    pub table_name: String,
    /// Column name to declared type.
    #[serde(default)]
    pub schema: Option<HashMap<String, String>>,
    #[serde(default)]
    pub mode: WriteMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSettings {
    #[serde(default)]
    pub on_error: RowErrorPolicy,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct SourceConfig {
    connection: String,
    table: String,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    columns: Option<Vec<ColumnDecl>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ColumnDecl {
    name: String,
    #[serde(default, rename = "type")]
    ty: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct JoinConfig {
    left: String,
    right: String,
    left_column: String,
    right_column: String,
    #[serde(default = "default_join_type")]
    join_type: String,
}

fn default_join_type() -> String {
    "inner".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterConfig {
    conditions: Vec<ConditionEntry>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConditionEntry {
    column: String,
    operator: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct CastConfig {
    column: String,
    target_type: String,
    #[serde(default)]
    on_error: Option<RowErrorPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ArithmeticConfig {
    operands: Vec<OperandConfig>,
    operator: String,
    output_column: String,
    #[serde(default)]
    divide_by_zero: Option<serde_json::Value>,
    #[serde(default)]
    on_error: Option<RowErrorPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ConditionConfig {
    predicate: PredicateConfig,
    then_value: OperandConfig,
    else_value: OperandConfig,
    output_column: String,
    #[serde(default)]
    output_type: Option<String>,
    #[serde(default)]
    on_error: Option<RowErrorPolicy>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct PredicateConfig {
    column: String,
    operator: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
    #[serde(default)]
    value_column: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OperandConfig {
    Column { column: String },
    Literal { literal: serde_json::Value },
    Bare(serde_json::Value),
}

/// `column` or `alias.column`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub qualifier: Option<String>,
    pub name: String,
}

impl ColumnRef {
    pub fn parse(reference: &str) -> Result<Self, EtlError> {
        let segments = split_qualified(reference.trim())?;
        let parsed = match segments.as_slice() {
            [name] => ColumnRef {
                qualifier: None,
                name: name.clone(),
            },
            [qualifier, name] => ColumnRef {
                qualifier: Some(qualifier.clone()),
                name: name.clone(),
            },
            _ => {
                return Err(EtlError::InvalidIdentifier(format!(
                    "column reference {reference:?} must be `column` or `alias.column`"
                )))
            }
        };
        if parsed.name.is_empty() || parsed.qualifier.as_deref() == Some("") {
            return Err(EtlError::InvalidIdentifier(format!(
                "column reference {reference:?} has an empty segment"
            )));
        }
        Ok(parsed)
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.qualifier {
            Some(qualifier) => write!(f, "{qualifier}.{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Column(ColumnRef),
    Literal(ScalarValue),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RightOperand {
    None,
    Value(ScalarValue),
    List(Vec<ScalarValue>),
    Column(ColumnRef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub column: ColumnRef,
    pub op: CompareOp,
    pub right: RightOperand,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourceNode {
    pub connection: String,
    pub dialect: Dialect,
    pub table: String,
    pub alias: String,
    pub columns: Option<Vec<(String, Option<ColumnType>)>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinNode {
    pub kind: JoinKind,
    pub left_column: ColumnRef,
    pub right_column: ColumnRef,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CastRule {
    pub column: ColumnRef,
    pub target: ColumnType,
    pub policy: RowErrorPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArithmeticRule {
    pub operands: Vec<Operand>,
    pub op: ArithmeticOp,
    pub output: String,
    pub divide_by_zero: ScalarValue,
    pub policy: RowErrorPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionRule {
    pub predicate: Comparison,
    pub then: Operand,
    pub otherwise: Operand,
    pub output: String,
    pub output_type: Option<ColumnType>,
    pub policy: RowErrorPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeOp {
    Source(SourceNode),
    /// Inputs are `[left, right]`.
    Join(JoinNode),
    Filter(Vec<Comparison>),
    Cast(CastRule),
    Arithmetic(ArithmeticRule),
    Condition(ConditionRule),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub id: String,
    pub op: NodeOp,
    /// Indices of earlier steps.
    pub inputs: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkPlan {
    pub table: String,
    pub schema: HashMap<String, ColumnType>,
    pub mode: WriteMode,
}

/// A validated pipeline with steps in topological order.
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub steps: Vec<Step>,
    /// Step feeding the sink.
    pub output: usize,
    pub sink: SinkPlan,
    pub policy: RowErrorPolicy,
}

const CAST_TARGETS: &[ColumnType] = &[
    ColumnType::Integer,
    ColumnType::Decimal,
    ColumnType::Text,
    ColumnType::Date,
    ColumnType::Boolean,
];

fn invalid(message: impl Into<String>) -> EtlError {
    EtlError::InvalidPipeline(message.into())
}

fn parse_config<T: DeserializeOwned>(node: &NodeDescriptor) -> Result<T, EtlError> {
    serde_json::from_value(node.config.clone())
        .map_err(|err| invalid(format!("node '{}' has an invalid {:?} config: {err}", node.id, node.kind)))
}

fn parse_type(name: &str, context: &str) -> Result<ColumnType, EtlError> {
    ColumnType::from_str(name).map_err(|err| invalid(format!("{context}: {err}")))
}

fn literal(value: &serde_json::Value, context: &str) -> Result<ScalarValue, EtlError> {
    ScalarValue::from_json(value).map_err(|err| invalid(format!("{context}: {err}")))
}

fn operand(config: &OperandConfig, context: &str) -> Result<Operand, EtlError> {
    match config {
        OperandConfig::Column { column } => Ok(Operand::Column(ColumnRef::parse(column)?)),
        OperandConfig::Literal { literal: value } | OperandConfig::Bare(value) => {
            Ok(Operand::Literal(literal(value, context)?))
        }
    }
}

fn output_name(name: &str, node: &str) -> Result<String, EtlError> {
    let name = name.trim();
    quote_ident(name, SqlDialect::Postgres)
        .map_err(|err| EtlError::InvalidIdentifier(format!("node '{node}' output column: {err}")))?;
    Ok(name.to_owned())
}

fn comparison(
    column: &str,
    operator: &str,
    value: Option<&serde_json::Value>,
    value_column: Option<&str>,
    node: &str,
) -> Result<Comparison, EtlError> {
    let column = ColumnRef::parse(column)?;
    let op = CompareOp::from_str(operator)?;
    let context = format!("node '{node}' condition on {column}");

    let right = match (op, value, value_column) {
        (CompareOp::IsNull | CompareOp::IsNotNull, _, _) => RightOperand::None,
        (_, Some(_), Some(_)) => {
            return Err(invalid(format!("{context}: set either value or valueColumn, not both")))
        }
        (CompareOp::In, _, Some(_)) => {
            return Err(invalid(format!("{context}: IN compares against a value list")))
        }
        (_, None, Some(other)) => RightOperand::Column(ColumnRef::parse(other)?),
        (CompareOp::In, Some(serde_json::Value::Array(items)), None) => {
            if items.is_empty() {
                return Err(invalid(format!("{context}: IN requires a non-empty list")));
            }
            RightOperand::List(
                items
                    .iter()
                    .map(|item| literal(item, &context))
                    .collect::<Result<_, _>>()?,
            )
        }
        (CompareOp::In, Some(_), None) => {
            return Err(invalid(format!("{context}: IN requires a list of values")))
        }
        (_, Some(value), None) => RightOperand::Value(literal(value, &context)?),
        (_, None, None) => {
            return Err(invalid(format!(
                "{context}: operator {} requires a non-null value; use 'is null' to match nulls",
                op.as_sql()
            )))
        }
    };
    Ok(Comparison { column, op, right })
}

/// Kahn's algorithm. Ties keep descriptor order.
fn topological_order(
    count: usize,
    edges: &[(usize, usize)],
) -> Result<Vec<usize>, Vec<usize>> {
    let mut indegree = vec![0usize; count];
    let mut outgoing = vec![Vec::new(); count];
    for &(from, to) in edges {
        indegree[to] += 1;
        outgoing[from].push(to);
    }

    let mut ready: VecDeque<usize> = (0..count).filter(|&n| indegree[n] == 0).collect();
    let mut order = Vec::with_capacity(count);
    while let Some(node) = ready.pop_front() {
        order.push(node);
        for &next in &outgoing[node] {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push_back(next);
            }
        }
    }
    if order.len() == count {
        Ok(order)
    } else {
        Err((0..count).filter(|&n| indegree[n] > 0).collect())
    }
}

/// Validates the descriptor against the known connections.
pub fn validate(pipeline: &PipelineDescriptor, connections: &ConnectionMap) -> Result<Graph, EtlError> {
    let nodes = &pipeline.nodes;
    let mut index_of = HashMap::with_capacity(nodes.len());
    for (index, node) in nodes.iter().enumerate() {
        if node.id.trim().is_empty() {
            return Err(invalid("node ids must not be empty"));
        }
        if index_of.insert(node.id.as_str(), index).is_some() {
            return Err(invalid(format!("duplicate node id '{}'", node.id)));
        }
    }

    let mut edges = Vec::with_capacity(pipeline.edges.len());
    let mut seen = HashSet::new();
    for edge in &pipeline.edges {
        let lookup = |id: &str| {
            index_of
                .get(id)
                .copied()
                .ok_or_else(|| invalid(format!("edge {} -> {} references unknown node '{id}'", edge.from, edge.to)))
        };
        let pair = (lookup(&edge.from)?, lookup(&edge.to)?);
        if pair.0 == pair.1 {
            return Err(EtlError::CyclicPipeline(format!("node '{}' feeds itself", edge.from)));
        }
        if !seen.insert(pair) {
            return Err(invalid(format!("duplicate edge {} -> {}", edge.from, edge.to)));
        }
        edges.push(pair);
    }

    let sinks: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, node)| node.kind == NodeKind::Sink)
        .map(|(index, _)| index)
        .collect();
    let sink = match sinks.as_slice() {
        [sink] => *sink,
        [] => return Err(invalid("pipeline has no sink node")),
        _ => return Err(invalid(format!("pipeline has {} sink nodes, expected one", sinks.len()))),
    };

    let order = topological_order(nodes.len(), &edges).map_err(|stuck| {
        let ids: Vec<&str> = stuck.iter().map(|&n| nodes[n].id.as_str()).collect();
        EtlError::CyclicPipeline(format!("pipeline contains a cycle through {}", ids.join(", ")))
    })?;

    let mut inputs: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut outputs: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for &(from, to) in &edges {
        inputs[to].push(from);
        outputs[from].push(to);
    }

    for (index, node) in nodes.iter().enumerate() {
        let expected = match node.kind {
            NodeKind::Source => 0,
            NodeKind::Join => 2,
            _ => 1,
        };
        if inputs[index].len() != expected {
            return Err(invalid(format!(
                "{:?} node '{}' needs {expected} input(s), found {}",
                node.kind,
                node.id,
                inputs[index].len()
            )));
        }
        if node.kind == NodeKind::Sink && !outputs[index].is_empty() {
            return Err(invalid("the sink node cannot feed other nodes"));
        }
    }

    // Every node must contribute to the sink.
    let mut feeds_sink = vec![false; nodes.len()];
    let mut pending = vec![sink];
    while let Some(node) = pending.pop() {
        if !std::mem::replace(&mut feeds_sink[node], true) {
            pending.extend(inputs[node].iter().copied());
        }
    }
    if let Some(dangling) = (0..nodes.len()).find(|&n| !feeds_sink[n]) {
        return Err(invalid(format!("node '{}' does not lead to the sink", nodes[dangling].id)));
    }

    let policy = pipeline.settings.on_error;
    let mut step_of = HashMap::with_capacity(nodes.len());
    let mut steps = Vec::with_capacity(nodes.len().saturating_sub(1));
    let mut aliases = HashSet::new();

    for &index in &order {
        let node = &nodes[index];
        if node.kind == NodeKind::Sink {
            continue;
        }
        let step_inputs: Vec<usize> = inputs[index]
            .iter()
            .filter_map(|input| step_of.get(input).copied())
            .collect();

        let (op, step_inputs) = match node.kind {
            NodeKind::Source => {
                let source = source_node(node, connections)?;
                if !aliases.insert(source.alias.clone()) {
                    return Err(invalid(format!(
                        "source alias '{}' is used more than once; set a distinct alias",
                        source.alias
                    )));
                }
                (NodeOp::Source(source), step_inputs)
            }
            NodeKind::Join => {
                let config: JoinConfig = parse_config(node)?;
                let side = |id: &str| {
                    index_of
                        .get(id)
                        .filter(|n| inputs[index].contains(*n))
                        .and_then(|n| step_of.get(n).copied())
                        .ok_or_else(|| {
                            invalid(format!("join '{}' side '{id}' is not one of its inputs", node.id))
                        })
                };
                let (left, right) = (side(&config.left)?, side(&config.right)?);
                if left == right {
                    return Err(invalid(format!("join '{}' uses the same input twice", node.id)));
                }
                let join = JoinNode {
                    kind: JoinKind::from_str(&config.join_type)?,
                    left_column: ColumnRef::parse(&config.left_column)?,
                    right_column: ColumnRef::parse(&config.right_column)?,
                };
                (NodeOp::Join(join), vec![left, right])
            }
            NodeKind::Filter => {
                let config: FilterConfig = parse_config(node)?;
                let conditions = config
                    .conditions
                    .iter()
                    .map(|c| comparison(&c.column, &c.operator, c.value.as_ref(), None, &node.id))
                    .collect::<Result<Vec<_>, _>>()?;
                (NodeOp::Filter(conditions), step_inputs)
            }
            NodeKind::Cast => {
                let config: CastConfig = parse_config(node)?;
                let target = ColumnType::from_str(&config.target_type)
                    .ok()
                    .filter(|ty| CAST_TARGETS.contains(ty))
                    .ok_or_else(|| {
                        EtlError::UnsupportedOperator(format!(
                            "cast '{}' target type '{}' must be one of integer, decimal, text, date or boolean",
                            node.id, config.target_type
                        ))
                    })?;
                let rule = CastRule {
                    column: ColumnRef::parse(&config.column)?,
                    target,
                    policy: config.on_error.unwrap_or(policy),
                };
                (NodeOp::Cast(rule), step_inputs)
            }
            NodeKind::Arithmetic => {
                let config: ArithmeticConfig = parse_config(node)?;
                let context = format!("arithmetic '{}'", node.id);
                if config.operands.len() < 2 {
                    return Err(invalid(format!("{context} needs at least two operands")));
                }
                let rule = ArithmeticRule {
                    operands: config
                        .operands
                        .iter()
                        .map(|o| operand(o, &context))
                        .collect::<Result<_, _>>()?,
                    op: ArithmeticOp::from_str(&config.operator)?,
                    output: output_name(&config.output_column, &node.id)?,
                    divide_by_zero: match &config.divide_by_zero {
                        Some(value) => literal(value, &context)?,
                        None => ScalarValue::Null,
                    },
                    policy: config.on_error.unwrap_or(policy),
                };
                (NodeOp::Arithmetic(rule), step_inputs)
            }
            NodeKind::Condition => {
                let config: ConditionConfig = parse_config(node)?;
                let context = format!("condition '{}'", node.id);
                let p = &config.predicate;
                let rule = ConditionRule {
                    predicate: comparison(
                        &p.column,
                        &p.operator,
                        p.value.as_ref(),
                        p.value_column.as_deref(),
                        &node.id,
                    )?,
                    then: operand(&config.then_value, &context)?,
                    otherwise: operand(&config.else_value, &context)?,
                    output: output_name(&config.output_column, &node.id)?,
                    output_type: config
                        .output_type
                        .as_deref()
                        .map(|ty| parse_type(ty, &context))
                        .transpose()?,
                    policy: config.on_error.unwrap_or(policy),
                };
                (NodeOp::Condition(rule), step_inputs)
            }
            NodeKind::Sink => continue,
        };

        step_of.insert(index, steps.len());
        steps.push(Step {
            id: node.id.clone(),
            op,
            inputs: step_inputs,
        });
    }

    let output = inputs[sink]
        .first()
        .and_then(|input| step_of.get(input).copied())
        .ok_or_else(|| invalid("the sink node has no input"))?;

    quote_qualified(&pipeline.sink.table_name, SqlDialect::Postgres)?;
    let schema = pipeline
        .sink
        .schema
        .iter()
        .flatten()
        .map(|(column, ty)| -> Result<(String, ColumnType), EtlError> {
            Ok((column.clone(), parse_type(ty, &format!("sink column '{column}'"))?))
        })
        .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(Graph {
        steps,
        output,
        sink: SinkPlan {
            table: pipeline.sink.table_name.clone(),
            schema,
            mode: pipeline.sink.mode,
        },
        policy,
    })
}

fn source_node(node: &NodeDescriptor, connections: &ConnectionMap) -> Result<SourceNode, EtlError> {
    let config: SourceConfig = parse_config(node)?;
    let descriptor = connections.get(&config.connection).ok_or_else(|| {
        EtlError::UnknownConnection(format!(
            "source '{}' references connection '{}', which is not defined",
            node.id, config.connection
        ))
    })?;
    let dialect = descriptor.dialect.sql_dialect();
    let segments = split_qualified(&config.table)?;
    quote_qualified(&config.table, dialect)?;

    let alias = match &config.alias {
        Some(alias) => alias.trim().to_owned(),
        None => segments.last().cloned().unwrap_or_default(),
    };
    quote_ident(&alias, dialect)?;

    let columns = match config.columns {
        Some(declared) => {
            let mut names = HashSet::new();
            let mut columns = Vec::with_capacity(declared.len());
            for column in declared {
                quote_ident(&column.name, dialect)?;
                if !names.insert(column.name.clone()) {
                    return Err(invalid(format!(
                        "source '{}' declares column '{}' twice",
                        node.id, column.name
                    )));
                }
                let ty = column
                    .ty
                    .as_deref()
                    .map(|ty| parse_type(ty, &format!("source '{}' column '{}'", node.id, column.name)))
                    .transpose()?;
                columns.push((column.name, ty));
            }
            Some(columns)
        }
        None => None,
    };

    Ok(SourceNode {
        connection: config.connection,
        dialect: descriptor.dialect,
        table: config.table,
        alias,
        columns,
    })
}
