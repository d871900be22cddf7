//! Executes pipelines against a run record.
//!
//! A run is claimed (`pending -> processing`), compiled, evaluated through a
//! run-scoped session cache and written to the warehouse in sequential
//! batches. Every exit path closes the sessions it opened and leaves the run
//! in a terminal state.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use vantage_db::{
    ColumnSpec, ColumnType, RunStatus, RunStore, RunTransition, ScalarValue, TableSpec,
    TableWriter, Warehouse,
};
use vantage_secrets::SecretCodec;

use crate::connector::{
    open_session, reveal_password, ConnectionDescriptor, ConnectionMap, ConnectorConfig,
    ConnectorRegistry, SessionCache,
};
use crate::error::{ErrorKind, EtlError};
use crate::pipeline::{validate, PipelineDescriptor};
use crate::planner::{compile, output_names, Frame, Plan, PlanNode};
use crate::transform::{cast_value, recover, sniff_type, RowAction, Warnings};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Rows per INSERT statement.
    pub batch_size: usize,
    /// Row warnings kept in an execution result.
    pub max_warnings: usize,
    pub connector: ConnectorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_warnings: 100,
            connector: ConnectorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSuccess {
    pub ok: bool,
    pub rows_written: u64,
    pub table_name: String,
    pub warnings: Vec<String>,
    pub warning_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionFailure {
    pub ok: bool,
    pub error_kind: ErrorKind,
    pub message: String,
}

/// `{ok: true, rowsWritten, ...}` or `{ok: false, errorKind, message}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecutionResult {
    Success(ExecutionSuccess),
    Failure(ExecutionFailure),
}

impl ExecutionResult {
    pub fn failure(err: &EtlError) -> Self {
        ExecutionResult::Failure(ExecutionFailure {
            ok: false,
            error_kind: err.kind(),
            message: failure_message(err),
        })
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ExecutionResult::Success(_))
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ExecutionResult::Success(_) => None,
            ExecutionResult::Failure(failure) => Some(failure.error_kind),
        }
    }
}

fn failure_message(err: &EtlError) -> String {
    let message = err.to_string();
    if message.trim().is_empty() {
        format!("run failed with {}", err.kind())
    } else {
        message
    }
}

pub struct EtlEngine {
    store: Arc<dyn RunStore>,
    warehouse: Arc<dyn Warehouse>,
    connectors: Arc<dyn ConnectorRegistry>,
    codec: SecretCodec,
    config: EngineConfig,
}

impl EtlEngine {
    pub fn new(
        store: Arc<dyn RunStore>,
        warehouse: Arc<dyn Warehouse>,
        connectors: Arc<dyn ConnectorRegistry>,
        codec: SecretCodec,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            warehouse,
            connectors,
            codec,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn codec(&self) -> &SecretCodec {
        &self.codec
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Executes `pipeline` for a `pending` run. Runs in any other state are
    /// left untouched.
    #[instrument(skip_all, fields(run_id = %run_id, table = %pipeline.sink.table_name))]
    pub async fn execute(
        &self,
        run_id: Uuid,
        pipeline: &PipelineDescriptor,
        connections: &[ConnectionDescriptor],
    ) -> ExecutionResult {
        if let Err(err) = self.claim(run_id).await {
            warn!(error = %err, "run not started");
            return ExecutionResult::failure(&err);
        }
        info!("run started");

        let mut rows_written = 0;
        let outcome = self
            .run(run_id, pipeline, connections, &mut rows_written)
            .await;
        let outcome = match outcome {
            Ok(success) => self.complete(run_id, success).await,
            Err(err) => Err(err),
        };

        match outcome {
            Ok(success) => {
                info!(rows_written = success.rows_written, warnings = success.warning_count, "run completed");
                ExecutionResult::Success(success)
            }
            Err(err) => {
                self.fail(run_id, &err, rows_written).await;
                ExecutionResult::failure(&err)
            }
        }
    }

    async fn claim(&self, run_id: Uuid) -> Result<(), EtlError> {
        if self.store.transition(run_id, RunTransition::start()).await? {
            return Ok(());
        }
        match self.store.fetch_run(run_id).await? {
            Some(record) => Err(EtlError::Storage(format!(
                "run {run_id} is {} and cannot be executed",
                record.status
            ))),
            None => Err(EtlError::Storage(format!("run {run_id} does not exist"))),
        }
    }

    async fn run(
        &self,
        run_id: Uuid,
        pipeline: &PipelineDescriptor,
        connections: &[ConnectionDescriptor],
        rows_written: &mut u64,
    ) -> Result<ExecutionSuccess, EtlError> {
        let connections = connection_map(connections)?;
        let graph = validate(pipeline, &connections)?;
        let plan = compile(&graph)?;
        info!(queries = plan.root.queries().len(), "pipeline compiled");

        let mut warnings = Warnings::new(self.config.max_warnings);
        let mut sessions = SessionCache::new(
            self.connectors.as_ref(),
            &self.codec,
            &self.config.connector,
            &connections,
        );
        let frame = evaluate(&plan.root, &mut sessions, &mut warnings).await;
        sessions.close_all().await;
        let frame = frame?;
        info!(rows = frame.rows.len(), columns = frame.columns.len(), "plan evaluated");

        let (target, rows) = sink_table(&plan, frame, &mut warnings)?;
        self.write(run_id, &target, &rows, rows_written).await?;

        Ok(ExecutionSuccess {
            ok: true,
            rows_written: *rows_written,
            table_name: target.table,
            warning_count: warnings.total(),
            warnings: warnings.into_messages(),
        })
    }

    async fn write(
        &self,
        run_id: Uuid,
        target: &TableSpec,
        rows: &[Vec<ScalarValue>],
        rows_written: &mut u64,
    ) -> Result<(), EtlError> {
        let mut writer = self.warehouse.begin_write(target).await?;
        let written = self
            .write_batches(run_id, writer.as_mut(), rows, rows_written)
            .await;
        let finished = writer.finish().await;
        written?;
        finished?;
        Ok(())
    }

    /// Batches bound each insert statement, not memory: `rows` is the whole
    /// evaluated frame, since every connector reads its result in full.
    async fn write_batches(
        &self,
        run_id: Uuid,
        writer: &mut dyn TableWriter,
        rows: &[Vec<ScalarValue>],
        rows_written: &mut u64,
    ) -> Result<(), EtlError> {
        for (number, batch) in rows.chunks(self.config.batch_size.max(1)).enumerate() {
            let inserted = writer.write_batch(batch).await.map_err(|err| {
                EtlError::WriteError(format!(
                    "batch {} failed after {} rows were written: {err}",
                    number + 1,
                    rows_written
                ))
            })?;
            *rows_written += inserted;
            if !self.store.record_progress(run_id, *rows_written).await? {
                return Err(EtlError::Storage(format!(
                    "run {run_id} stopped processing while rows were being written"
                )));
            }
        }
        Ok(())
    }

    async fn complete(&self, run_id: Uuid, success: ExecutionSuccess) -> Result<ExecutionSuccess, EtlError> {
        if self
            .store
            .transition(run_id, RunTransition::complete(success.rows_written))
            .await?
        {
            Ok(success)
        } else {
            Err(EtlError::Storage(format!(
                "run {run_id} was no longer processing when it finished"
            )))
        }
    }

    async fn fail(&self, run_id: Uuid, err: &EtlError, rows_written: u64) {
        warn!(kind = %err.kind(), error = %err, rows_written, "run failed");
        let change = RunTransition::fail(
            RunStatus::Processing,
            err.kind().as_str(),
            failure_message(err),
            Some(rows_written),
        );
        match self.store.transition(run_id, change).await {
            Ok(true) => {}
            Ok(false) => warn!("run was already terminal; failure not recorded"),
            Err(store_err) => warn!(error = %store_err, "failed to record run failure"),
        }
    }

    /// Connects, runs the dialect's probe query and disconnects.
    #[instrument(skip_all, fields(connection = %descriptor.id, dialect = %descriptor.dialect))]
    pub async fn test_connection(&self, descriptor: &ConnectionDescriptor) -> Result<(), EtlError> {
        let connector = self.connectors.connector(descriptor.dialect).ok_or_else(|| {
            EtlError::UnknownConnection(format!(
                "no connector is registered for {} connections",
                descriptor.dialect
            ))
        })?;
        let password = reveal_password(&self.codec, descriptor)?;
        let mut session = open_session(
            connector.as_ref(),
            descriptor,
            password.as_ref(),
            &self.config.connector,
        )
        .await?;

        let probed = match descriptor.dialect.probe_sql() {
            Some(sql) => session.query(sql, &[]).await.map(|_| ()),
            None => Ok(()),
        };
        let closed = session.disconnect().await;
        probed?;
        closed?;
        info!("connection test passed");
        Ok(())
    }
}

fn connection_map(connections: &[ConnectionDescriptor]) -> Result<ConnectionMap, EtlError> {
    let mut map = HashMap::with_capacity(connections.len());
    for connection in connections {
        if map.insert(connection.id.clone(), connection.clone()).is_some() {
            return Err(EtlError::InvalidPipeline(format!(
                "connection '{}' is listed more than once",
                connection.id
            )));
        }
    }
    Ok(map)
}

fn evaluate<'a, 'c: 'a>(
    node: &'a PlanNode,
    sessions: &'a mut SessionCache<'c>,
    warnings: &'a mut Warnings,
) -> BoxFuture<'a, Result<Frame, EtlError>> {
    async move {
        match node {
            PlanNode::Query(query) => {
                let result = sessions
                    .query(&query.connection, &query.fragment.sql, &query.fragment.params)
                    .await?;
                Frame::from_query(&query.layout, result)
            }
            PlanNode::Join { left, right, join } => {
                let left = evaluate(left, sessions, warnings).await?;
                let right = evaluate(right, sessions, warnings).await?;
                left.join(right, join)
            }
            PlanNode::Filter { input, conditions } => {
                evaluate(input, sessions, warnings).await?.filter(conditions)
            }
            PlanNode::Cast { input, rule } => {
                let frame = evaluate(input, sessions, warnings).await?;
                frame.cast(rule, warnings)
            }
            PlanNode::Arithmetic {
                input,
                rule,
                output_type,
            } => {
                let frame = evaluate(input, sessions, warnings).await?;
                frame.arithmetic(rule, *output_type, warnings)
            }
            PlanNode::Condition { input, rule } => {
                let frame = evaluate(input, sessions, warnings).await?;
                frame.condition(rule, warnings)
            }
        }
    }
    .boxed()
}

/// Names and types the sink columns, then coerces every cell to its column
/// type under the pipeline policy.
fn sink_table(
    plan: &Plan,
    frame: Frame,
    warnings: &mut Warnings,
) -> Result<(TableSpec, Vec<Vec<ScalarValue>>), EtlError> {
    let names = output_names(&frame.columns);
    if let Some(unknown) = plan.sink.schema.keys().find(|name| !names.contains(*name)) {
        return Err(EtlError::UnresolvedReference(format!(
            "sink schema column '{unknown}' is not produced by the pipeline"
        )));
    }

    let columns: Vec<ColumnSpec> = names
        .into_iter()
        .zip(&frame.columns)
        .enumerate()
        .map(|(index, (name, column))| {
            let ty = plan
                .sink
                .schema
                .get(&name)
                .copied()
                .or(column.ty)
                .or_else(|| {
                    frame
                        .rows
                        .iter()
                        .map(|row| &row[index])
                        .find(|value| !value.is_null())
                        .and_then(sniff_type)
                })
                .unwrap_or(ColumnType::Text);
            ColumnSpec::new(name, ty)
        })
        .collect();

    let mut rows = Vec::with_capacity(frame.rows.len());
    'rows: for (number, mut row) in frame.rows.into_iter().enumerate() {
        for (cell, column) in row.iter_mut().zip(&columns) {
            if cell.is_null() || cell.column_type() == Some(column.ty) {
                continue;
            }
            match cast_value(cell, column.ty) {
                Ok(value) => *cell = value,
                Err(err) => {
                    let rule = format!("sink column '{}'", column.name);
                    match recover(plan.policy, &rule, number + 1, err, warnings)? {
                        RowAction::Keep(value) => *cell = value,
                        RowAction::Skip => continue 'rows,
                    }
                }
            }
        }
        rows.push(row);
    }

    let target = TableSpec {
        table: plan.sink.table.clone(),
        columns,
        mode: plan.sink.mode,
    };
    Ok((target, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SinkPlan;
    use crate::planner::{PlanColumn, QueryPlan};
    use crate::transform::RowErrorPolicy;
    use rust_decimal::Decimal;
    use vantage_db::{SqlFragment, WriteMode};

    fn plan(schema: &[(&str, ColumnType)], policy: RowErrorPolicy) -> Plan {
        Plan {
            root: PlanNode::Query(QueryPlan {
                connection: "pg".into(),
                fragment: SqlFragment {
                    sql: "SELECT 1".into(),
                    params: Vec::new(),
                },
                layout: Vec::new(),
            }),
            sink: SinkPlan {
                table: "report".into(),
                schema: schema
                    .iter()
                    .map(|(name, ty)| (name.to_string(), *ty))
                    .collect(),
                mode: WriteMode::Replace,
            },
            policy,
        }
    }

    fn column(qualifier: &str, name: &str, ty: Option<ColumnType>) -> PlanColumn {
        PlanColumn {
            qualifier: Some(qualifier.into()),
            name: name.into(),
            ty,
        }
    }

    #[test]
    fn sink_types_prefer_schema_then_declared_then_sniffed() {
        let frame = Frame {
            columns: vec![
                column("s", "id", None),
                column("s", "amount", Some(ColumnType::Decimal)),
                column("s", "code", None),
                column("s", "note", None),
                column("s", "ratio", None),
            ],
            rows: vec![
                vec![
                    ScalarValue::Null,
                    ScalarValue::Text("12.50".into()),
                    ScalarValue::Integer(7),
                    ScalarValue::Null,
                    ScalarValue::Float(0.5),
                ],
                vec![
                    ScalarValue::Integer(2),
                    ScalarValue::Integer(3),
                    ScalarValue::Integer(8),
                    ScalarValue::Null,
                    ScalarValue::Float(0.25),
                ],
            ],
        };
        let plan = plan(&[("code", ColumnType::Text)], RowErrorPolicy::NullOut);
        let (target, rows) = sink_table(&plan, frame, &mut Warnings::new(10)).unwrap();

        let types: Vec<ColumnType> = target.columns.iter().map(|c| c.ty).collect();
        assert_eq!(
            types,
            vec![
                ColumnType::Integer,
                ColumnType::Decimal,
                ColumnType::Text,
                ColumnType::Text,
                ColumnType::Decimal,
            ]
        );
        assert_eq!(rows[0][1], ScalarValue::Decimal(Decimal::new(1250, 2)));
        assert_eq!(rows[0][2], ScalarValue::Text("7".into()));
        assert_eq!(rows[1][4], ScalarValue::Decimal(Decimal::new(25, 2)));
    }

    #[test]
    fn sink_coercion_follows_the_policy() {
        let frame = Frame {
            columns: vec![column("s", "amount", Some(ColumnType::Integer))],
            rows: vec![
                vec![ScalarValue::Text("4".into())],
                vec![ScalarValue::Text("four".into())],
            ],
        };

        let mut warnings = Warnings::new(10);
        let (_, rows) = sink_table(
            &plan(&[], RowErrorPolicy::SkipRow),
            frame.clone(),
            &mut warnings,
        )
        .unwrap();
        assert_eq!(rows, vec![vec![ScalarValue::Integer(4)]]);
        assert_eq!(warnings.total(), 1);

        let err = sink_table(&plan(&[], RowErrorPolicy::Abort), frame, &mut Warnings::new(10))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CastError);
    }

    #[test]
    fn unknown_sink_schema_columns_are_rejected() {
        let frame = Frame {
            columns: vec![column("s", "amount", None)],
            rows: Vec::new(),
        };
        let err = sink_table(
            &plan(&[("total", ColumnType::Decimal)], RowErrorPolicy::NullOut),
            frame,
            &mut Warnings::new(10),
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnresolvedReference);
    }

    #[test]
    fn duplicate_connection_ids_are_invalid() {
        let descriptor: ConnectionDescriptor =
            serde_json::from_value(serde_json::json!({"id": "pg", "dialect": "postgres"})).unwrap();
        let err = connection_map(&[descriptor.clone(), descriptor]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPipeline);
    }

    #[test]
    fn results_serialize_in_camel_case() {
        let success = ExecutionResult::Success(ExecutionSuccess {
            ok: true,
            rows_written: 3,
            table_name: "sales_filtered".into(),
            warnings: Vec::new(),
            warning_count: 0,
        });
        let json = serde_json::to_value(&success).unwrap();
        assert_eq!(json["rowsWritten"], 3);
        assert_eq!(json["tableName"], "sales_filtered");

        let failure = ExecutionResult::failure(&EtlError::StaleTimeout("timed out".into()));
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["ok"], false);
        assert_eq!(json["errorKind"], "StaleTimeout");

        let back: ExecutionResult = serde_json::from_value(json).unwrap();
        assert_eq!(back.error_kind(), Some(ErrorKind::StaleTimeout));
    }
}
