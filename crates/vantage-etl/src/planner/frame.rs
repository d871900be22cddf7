//! Materialized row sets and the in-memory operators applied to them once a
//! plan leaves SQL.

use std::collections::{HashMap, HashSet};

use vantage_db::{ColumnType, RowSet, ScalarValue};

use super::{LayoutItem, PlanColumn};
use crate::connector::ConnectorError;
use crate::error::EtlError;
use crate::pipeline::{
    ArithmeticRule, CastRule, ColumnRef, Comparison, ConditionRule, JoinNode, Operand,
    RightOperand,
};
use crate::transform::{
    cast_value, compare, evaluate_arithmetic, hash_join, recover, CompareOperand, RowAction,
    Warnings,
};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    pub columns: Vec<PlanColumn>,
    pub rows: Vec<Vec<ScalarValue>>,
}

impl Frame {
    /// Maps a query result onto its layout. The wildcard takes every result
    /// column the fixed items do not account for.
    pub fn from_query(layout: &[LayoutItem], result: RowSet) -> Result<Frame, EtlError> {
        let fixed = layout
            .iter()
            .filter(|item| matches!(item, LayoutItem::Column(_)))
            .count();
        let wildcards = layout.len() - fixed;
        if wildcards > 1 {
            return Err(EtlError::InvalidPipeline(
                "a query may expand at most one wildcard".into(),
            ));
        }

        // Some drivers report no column names for an empty result.
        let nameless = result.columns.is_empty() && result.rows.is_empty();
        let width = result.columns.len();
        let open_width = if nameless {
            0
        } else if width >= fixed && (wildcards == 1 || width == fixed) {
            width - fixed
        } else {
            return Err(ConnectorError::QueryError(format!(
                "query returned {width} columns, expected {fixed}"
            ))
            .into());
        };

        let mut columns = Vec::new();
        let mut sources: Vec<usize> = Vec::new();
        let mut position = 0;
        for item in layout {
            match item {
                LayoutItem::Column(column) => {
                    columns.push(column.clone());
                    sources.push(position);
                    position += 1;
                }
                LayoutItem::Wildcard {
                    qualifier,
                    declared: Some(declared),
                } => {
                    let names = &result.columns[position..position + open_width];
                    for (name, ty) in declared {
                        let offset = match names.iter().position(|n| n == name) {
                            Some(offset) => offset,
                            None if nameless => 0,
                            None => {
                                return Err(EtlError::UnresolvedReference(format!(
                                    "column '{qualifier}.{name}' is not in the source"
                                )))
                            }
                        };
                        columns.push(PlanColumn {
                            qualifier: Some(qualifier.clone()),
                            name: name.clone(),
                            ty: *ty,
                        });
                        sources.push(position + offset);
                    }
                    position += open_width;
                }
                LayoutItem::Wildcard {
                    qualifier,
                    declared: None,
                } => {
                    for name in &result.columns[position..position + open_width] {
                        columns.push(PlanColumn {
                            qualifier: Some(qualifier.clone()),
                            name: name.clone(),
                            ty: None,
                        });
                        sources.push(position);
                        position += 1;
                    }
                }
            }
        }

        let projected = sources.iter().enumerate().all(|(i, source)| i == *source)
            && sources.len() == width;
        let rows = if projected {
            result.rows
        } else {
            result
                .rows
                .into_iter()
                .map(|row| {
                    sources
                        .iter()
                        .map(|&source| row.get(source).cloned().unwrap_or(ScalarValue::Null))
                        .collect()
                })
                .collect()
        };
        Ok(Frame { columns, rows })
    }

    /// Same rules as compile-time resolution, over concrete columns.
    pub fn resolve(&self, reference: &ColumnRef) -> Result<usize, EtlError> {
        let name = reference.name.as_str();
        let find = |keep: &dyn Fn(&PlanColumn) -> bool| -> Vec<usize> {
            self.columns
                .iter()
                .enumerate()
                .filter(|(_, column)| keep(column))
                .map(|(index, _)| index)
                .collect()
        };

        let hits = match &reference.qualifier {
            Some(qualifier) => {
                find(&|c| c.qualifier.as_deref() == Some(qualifier.as_str()) && c.name == name)
            }
            None => {
                let computed = find(&|c| c.qualifier.is_none() && c.name == name);
                if computed.len() == 1 {
                    computed
                } else {
                    find(&|c| c.name == name)
                }
            }
        };
        match hits.as_slice() {
            [index] => Ok(*index),
            [] => Err(EtlError::UnresolvedReference(format!(
                "column '{reference}' is not produced by any input"
            ))),
            _ => Err(EtlError::UnresolvedReference(format!(
                "column '{reference}' is ambiguous; qualify it with a source alias"
            ))),
        }
    }

    fn operand(&self, operand: &Operand) -> Result<OperandSource, EtlError> {
        Ok(match operand {
            Operand::Column(reference) => OperandSource::Column(self.resolve(reference)?),
            Operand::Literal(value) => OperandSource::Literal(value.clone()),
        })
    }

    fn predicate(&self, comparison: &Comparison) -> Result<BoundPredicate, EtlError> {
        let right = match &comparison.right {
            RightOperand::None => BoundRight::Fixed(CompareOperand::None),
            RightOperand::Value(value) => BoundRight::Fixed(CompareOperand::Value(value.clone())),
            RightOperand::List(values) => BoundRight::Fixed(CompareOperand::List(values.clone())),
            RightOperand::Column(reference) => BoundRight::Column(self.resolve(reference)?),
        };
        Ok(BoundPredicate {
            left: self.resolve(&comparison.column)?,
            op: comparison.op,
            right,
        })
    }

    /// Keeps rows for which every condition is TRUE.
    pub fn filter(mut self, conditions: &[Comparison]) -> Result<Frame, EtlError> {
        let bound = conditions
            .iter()
            .map(|c| self.predicate(c))
            .collect::<Result<Vec<_>, _>>()?;
        self.rows
            .retain(|row| bound.iter().all(|p| p.evaluate(row) == Some(true)));
        Ok(self)
    }

    pub fn cast(mut self, rule: &CastRule, warnings: &mut Warnings) -> Result<Frame, EtlError> {
        let index = self.resolve(&rule.column)?;
        let label = format!("cast of '{}' to {}", rule.column, rule.target);
        let mut rows = Vec::with_capacity(self.rows.len());
        for (number, mut row) in self.rows.into_iter().enumerate() {
            match cast_value(&row[index], rule.target) {
                Ok(value) => row[index] = value,
                Err(err) => match recover(rule.policy, &label, number + 1, err, warnings)? {
                    RowAction::Keep(value) => row[index] = value,
                    RowAction::Skip => continue,
                },
            }
            rows.push(row);
        }
        self.rows = rows;
        self.columns[index].ty = Some(rule.target);
        Ok(self)
    }

    pub fn arithmetic(
        mut self,
        rule: &ArithmeticRule,
        output_type: Option<ColumnType>,
        warnings: &mut Warnings,
    ) -> Result<Frame, EtlError> {
        let operands = rule
            .operands
            .iter()
            .map(|o| self.operand(o))
            .collect::<Result<Vec<_>, _>>()?;
        let label = format!("arithmetic '{}'", rule.output);
        let column = self.computed_slot(&rule.output, output_type);

        let mut rows = Vec::with_capacity(self.rows.len());
        let mut values = Vec::with_capacity(operands.len());
        for (number, mut row) in self.rows.into_iter().enumerate() {
            values.clear();
            values.extend(operands.iter().map(|o| o.value(&row)));
            let value = match evaluate_arithmetic(rule.op, &values, &rule.divide_by_zero) {
                Ok(value) => value,
                Err(err) => match recover(rule.policy, &label, number + 1, err, warnings)? {
                    RowAction::Keep(value) => value,
                    RowAction::Skip => continue,
                },
            };
            put(&mut row, column, value);
            rows.push(row);
        }
        self.rows = rows;
        Ok(self)
    }

    pub fn condition(mut self, rule: &ConditionRule, warnings: &mut Warnings) -> Result<Frame, EtlError> {
        let predicate = self.predicate(&rule.predicate)?;
        let then = self.operand(&rule.then)?;
        let otherwise = self.operand(&rule.otherwise)?;
        let label = format!("condition '{}'", rule.output);
        let column = self.computed_slot(&rule.output, rule.output_type);

        let mut rows = Vec::with_capacity(self.rows.len());
        for (number, mut row) in self.rows.into_iter().enumerate() {
            let chosen = if predicate.evaluate(&row) == Some(true) {
                then.value(&row)
            } else {
                otherwise.value(&row)
            };
            let value = match rule.output_type {
                Some(target) if !chosen.is_null() && chosen.column_type() != Some(target) => {
                    match cast_value(&chosen, target) {
                        Ok(value) => value,
                        Err(err) => match recover(rule.policy, &label, number + 1, err, warnings)? {
                            RowAction::Keep(value) => value,
                            RowAction::Skip => continue,
                        },
                    }
                }
                _ => chosen,
            };
            put(&mut row, column, value);
            rows.push(row);
        }
        self.rows = rows;
        Ok(self)
    }

    pub fn join(self, right: Frame, join: &JoinNode) -> Result<Frame, EtlError> {
        let left_key = self.resolve(&join.left_column)?;
        let right_key = right.resolve(&join.right_column)?;
        let rows = hash_join(
            self.rows,
            left_key,
            &right.rows,
            right_key,
            right.columns.len(),
            join.kind,
        );
        let mut columns = self.columns;
        columns.extend(right.columns);
        Ok(Frame { columns, rows })
    }

    /// Index of a rule output column. An earlier rule output of the same name
    /// is overwritten; otherwise a column is appended.
    fn computed_slot(&mut self, name: &str, ty: Option<ColumnType>) -> Slot {
        let existing = self
            .columns
            .iter()
            .position(|c| c.qualifier.is_none() && c.name == name);
        match existing {
            Some(index) => {
                self.columns[index].ty = ty;
                Slot::Replace(index)
            }
            None => {
                self.columns.push(PlanColumn {
                    qualifier: None,
                    name: name.to_owned(),
                    ty,
                });
                Slot::Append
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Slot {
    Replace(usize),
    Append,
}

fn put(row: &mut Vec<ScalarValue>, slot: Slot, value: ScalarValue) {
    match slot {
        Slot::Replace(index) => row[index] = value,
        Slot::Append => row.push(value),
    }
}

enum OperandSource {
    Column(usize),
    Literal(ScalarValue),
}

impl OperandSource {
    fn value(&self, row: &[ScalarValue]) -> ScalarValue {
        match self {
            OperandSource::Column(index) => row[*index].clone(),
            OperandSource::Literal(value) => value.clone(),
        }
    }
}

enum BoundRight {
    Fixed(CompareOperand),
    Column(usize),
}

struct BoundPredicate {
    left: usize,
    op: vantage_db::sql::CompareOp,
    right: BoundRight,
}

impl BoundPredicate {
    fn evaluate(&self, row: &[ScalarValue]) -> Option<bool> {
        match &self.right {
            BoundRight::Fixed(operand) => compare(&row[self.left], self.op, operand),
            BoundRight::Column(index) => compare(
                &row[self.left],
                self.op,
                &CompareOperand::Value(row[*index].clone()),
            ),
        }
    }
}

/// Sink column names. Names shared by several inputs are prefixed with their
/// source alias, and any remaining clash gets a numeric suffix.
pub fn output_names(columns: &[PlanColumn]) -> Vec<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for column in columns {
        *counts.entry(column.name.as_str()).or_default() += 1;
    }

    let mut used = HashSet::new();
    columns
        .iter()
        .map(|column| {
            let base = match &column.qualifier {
                Some(qualifier) if counts[column.name.as_str()] > 1 => {
                    format!("{qualifier}_{}", column.name)
                }
                _ => column.name.clone(),
            };
            let mut name = base.clone();
            let mut suffix = 2;
            while !used.insert(name.clone()) {
                name = format!("{base}_{suffix}");
                suffix += 1;
            }
            name
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::RowErrorPolicy;
    use crate::ErrorKind;
    use rust_decimal::Decimal;
    use vantage_db::sql::{ArithmeticOp, CompareOp, JoinKind};

    fn column(qualifier: Option<&str>, name: &str) -> PlanColumn {
        PlanColumn {
            qualifier: qualifier.map(str::to_owned),
            name: name.into(),
            ty: None,
        }
    }

    fn reference(text: &str) -> ColumnRef {
        ColumnRef::parse(text).unwrap()
    }

    fn int(v: i64) -> ScalarValue {
        ScalarValue::Integer(v)
    }

    fn text(v: &str) -> ScalarValue {
        ScalarValue::Text(v.into())
    }

    fn sales() -> Frame {
        Frame {
            columns: vec![column(Some("s"), "id"), column(Some("s"), "amount")],
            rows: vec![
                vec![int(1), text("150")],
                vec![int(2), text("n/a")],
                vec![int(3), text("90")],
            ],
        }
    }

    #[test]
    fn wildcards_take_the_remaining_columns() {
        let layout = vec![
            LayoutItem::Column(column(None, "total")),
            LayoutItem::Wildcard {
                qualifier: "s".into(),
                declared: None,
            },
        ];
        let result = RowSet::with_rows(
            vec!["__c0".into(), "id".into(), "amount".into()],
            vec![vec![int(10), int(1), int(5)]],
        );
        let frame = Frame::from_query(&layout, result).unwrap();
        assert_eq!(frame.columns.len(), 3);
        assert_eq!(frame.columns[1], column(Some("s"), "id"));
        assert_eq!(frame.rows[0], vec![int(10), int(1), int(5)]);
    }

    #[test]
    fn declared_spreadsheet_columns_are_projected_by_name() {
        let layout = vec![LayoutItem::Wildcard {
            qualifier: "b".into(),
            declared: Some(vec![("amount".into(), Some(ColumnType::Decimal))]),
        }];
        let result = RowSet::with_rows(
            vec!["item".into(), "amount".into()],
            vec![vec![text("rent"), text("1200")]],
        );
        let frame = Frame::from_query(&layout, result).unwrap();
        assert_eq!(frame.columns.len(), 1);
        assert_eq!(frame.rows, vec![vec![text("1200")]]);

        let missing = vec![LayoutItem::Wildcard {
            qualifier: "b".into(),
            declared: Some(vec![("cost".into(), None)]),
        }];
        let result = RowSet::with_rows(vec!["item".into()], vec![vec![text("rent")]]);
        let err = Frame::from_query(&missing, result).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnresolvedReference);
    }

    #[test]
    fn empty_results_without_names_give_no_open_columns() {
        let layout = vec![LayoutItem::Wildcard {
            qualifier: "s".into(),
            declared: None,
        }];
        let frame = Frame::from_query(&layout, RowSet::new(Vec::new())).unwrap();
        assert!(frame.columns.is_empty());
        assert!(frame.rows.is_empty());
    }

    #[test]
    fn width_mismatches_are_query_errors() {
        let layout = vec![LayoutItem::Column(column(Some("s"), "id"))];
        let result = RowSet::with_rows(vec!["a".into(), "b".into()], vec![]);
        let err = Frame::from_query(&layout, result).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryError);
    }

    #[test]
    fn casts_apply_the_row_policy() {
        let rule = |policy| CastRule {
            column: reference("amount"),
            target: ColumnType::Decimal,
            policy,
        };

        let mut warnings = Warnings::new(10);
        let frame = sales().cast(&rule(RowErrorPolicy::NullOut), &mut warnings).unwrap();
        assert_eq!(frame.rows[1][1], ScalarValue::Null);
        assert_eq!(frame.rows[0][1], ScalarValue::Decimal(Decimal::from(150)));
        assert_eq!(warnings.total(), 1);
        assert!(warnings.messages()[0].contains("row 2"));

        let mut warnings = Warnings::new(10);
        let frame = sales().cast(&rule(RowErrorPolicy::SkipRow), &mut warnings).unwrap();
        assert_eq!(frame.rows.len(), 2);

        let err = sales()
            .cast(&rule(RowErrorPolicy::Abort), &mut Warnings::new(10))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CastError);
    }

    #[test]
    fn filters_keep_only_true_rows() {
        let frame = sales()
            .cast(
                &CastRule {
                    column: reference("amount"),
                    target: ColumnType::Decimal,
                    policy: RowErrorPolicy::NullOut,
                },
                &mut Warnings::new(10),
            )
            .unwrap()
            .filter(&[Comparison {
                column: reference("s.amount"),
                op: CompareOp::Gt,
                right: RightOperand::Value(int(100)),
            }])
            .unwrap();
        assert_eq!(frame.rows.len(), 1);
        assert_eq!(frame.rows[0][0], int(1));
    }

    #[test]
    fn rule_outputs_replace_earlier_outputs() {
        let doubled = ArithmeticRule {
            operands: vec![Operand::Column(reference("id")), Operand::Literal(int(2))],
            op: ArithmeticOp::Multiply,
            output: "score".into(),
            divide_by_zero: ScalarValue::Null,
            policy: RowErrorPolicy::NullOut,
        };
        let mut warnings = Warnings::new(10);
        let frame = sales().arithmetic(&doubled, Some(ColumnType::Integer), &mut warnings).unwrap();
        assert_eq!(frame.columns.len(), 3);
        assert_eq!(frame.rows[2][2], int(6));

        let tier = ConditionRule {
            predicate: Comparison {
                column: reference("score"),
                op: CompareOp::GtEq,
                right: RightOperand::Value(int(4)),
            },
            then: Operand::Literal(text("high")),
            otherwise: Operand::Literal(text("low")),
            output: "score".into(),
            output_type: Some(ColumnType::Text),
            policy: RowErrorPolicy::NullOut,
        };
        let frame = frame.condition(&tier, &mut warnings).unwrap();
        assert_eq!(frame.columns.len(), 3);
        assert_eq!(frame.rows[0][2], text("low"));
        assert_eq!(frame.rows[2][2], text("high"));
    }

    #[test]
    fn joins_concatenate_columns() {
        let customers = Frame {
            columns: vec![column(Some("c"), "id"), column(Some("c"), "name")],
            rows: vec![vec![int(1), text("Acme")]],
        };
        let join = JoinNode {
            kind: JoinKind::Left,
            left_column: reference("s.id"),
            right_column: reference("c.id"),
        };
        let frame = sales().join(customers, &join).unwrap();
        assert_eq!(frame.columns.len(), 4);
        assert_eq!(frame.rows.len(), 3);
        assert_eq!(frame.rows[0][3], text("Acme"));
        assert_eq!(frame.rows[1][3], ScalarValue::Null);

        assert_eq!(
            frame.resolve(&reference("id")).unwrap_err().kind(),
            ErrorKind::UnresolvedReference
        );
        assert_eq!(
            output_names(&frame.columns),
            vec!["s_id", "amount", "c_id", "name"]
        );
    }

    #[test]
    fn clashing_output_names_get_suffixes() {
        let columns = vec![
            column(None, "total"),
            column(Some("a"), "x_total"),
            column(Some("a"), "total"),
            column(Some("x"), "total"),
        ];
        assert_eq!(
            output_names(&columns),
            vec!["total", "x_total", "a_total", "x_total_2"]
        );
    }
}
