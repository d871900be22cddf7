//! Warehouse writer: target table DDL, batched inserts and the reads that
//! back spreadsheet-derived sources.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Connection, PgConnection, Postgres, QueryBuilder};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pg;
use crate::sql::{quote_ident, quote_qualified, split_qualified, SqlDialect, SqlError};
use crate::value::{ColumnType, RowSet, ScalarValue};

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarehouseConfig {
    pub dsn: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Take a session advisory lock on the target table while writing.
    pub single_writer_lock: bool,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            dsn: "postgres://localhost:5432/vantage".to_string(),
            max_connections: 8,
            acquire_timeout: Duration::from_secs(30),
            single_writer_lock: false,
        }
    }
}

/// How the sink treats an existing target table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Drop and recreate.
    #[default]
    Replace,
    /// Empty an existing table, creating it when missing.
    Truncate,
    /// Create when missing, then insert.
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Target table of a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSpec {
    /// `table` or `schema.table`.
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub mode: WriteMode,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WarehouseError {
    #[error(transparent)]
    InvalidIdentifier(#[from] SqlError),
    #[error("target table '{0}' is locked by another writer")]
    Locked(String),
    #[error("warehouse query failed: {0}")]
    Query(String),
    #[error("warehouse write failed: {0}")]
    Write(String),
}

impl From<sqlx::Error> for WarehouseError {
    fn from(err: sqlx::Error) -> Self {
        WarehouseError::Query(format_pg_error(&err))
    }
}

/// Renders a driver error with its SQLSTATE when there is one.
pub fn format_pg_error(err: &sqlx::Error) -> String {
    match err {
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => format!("{} (SQLSTATE {code})", db.message()),
            None => db.message().to_string(),
        },
        other => other.to_string(),
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn query(&self, sql: &str, params: &[ScalarValue]) -> Result<RowSet, WarehouseError>;

    /// Prepares the target table per its mode and returns a writer bound to it.
    async fn begin_write(&self, target: &TableSpec) -> Result<Box<dyn TableWriter>, WarehouseError>;
}

#[async_trait]
pub trait TableWriter: Send {
    /// Inserts one batch and returns the number of rows written.
    async fn write_batch(&mut self, rows: &[Vec<ScalarValue>]) -> Result<u64, WarehouseError>;

    /// Releases the writer. Call on both success and failure paths.
    async fn finish(self: Box<Self>) -> Result<(), WarehouseError>;
}

pub fn ddl_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Integer => "BIGINT",
        ColumnType::Decimal => "NUMERIC",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Text => "TEXT",
        ColumnType::Date => "DATE",
        ColumnType::Timestamp => "TIMESTAMP",
        ColumnType::Boolean => "BOOLEAN",
    }
}

fn column_definitions(columns: &[ColumnSpec]) -> Result<String, SqlError> {
    let defs = columns
        .iter()
        .map(|column| {
            Ok(format!(
                "{} {}",
                quote_ident(&column.name, SqlDialect::Postgres)?,
                ddl_type(column.ty)
            ))
        })
        .collect::<Result<Vec<_>, SqlError>>()?;
    Ok(defs.join(", "))
}

fn check_rows(rows: &[Vec<ScalarValue>], columns: &[ColumnSpec]) -> Result<(), WarehouseError> {
    for (index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(WarehouseError::Write(format!(
                "row {index} has {} values, target has {} columns",
                row.len(),
                columns.len()
            )));
        }
        for (value, column) in row.iter().zip(columns) {
            if let Some(ty) = value.column_type() {
                if ty != column.ty {
                    return Err(WarehouseError::Write(format!(
                        "row {index}: {ty} value for {} column '{}'",
                        column.ty, column.name
                    )));
                }
            }
        }
    }
    Ok(())
}

/// PostgreSQL warehouse.
#[derive(Clone, Debug)]
pub struct PgWarehouse {
    pool: PgPool,
    config: WarehouseConfig,
}

impl PgWarehouse {
    pub async fn connect(config: WarehouseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.dsn)
            .await?;
        Ok(Self { pool, config })
    }

    pub fn from_pool(pool: PgPool, config: WarehouseConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Warehouse for PgWarehouse {
    async fn query(&self, sql: &str, params: &[ScalarValue]) -> Result<RowSet, WarehouseError> {
        let rows = pg::prepare(sql, params).fetch_all(&self.pool).await?;
        Ok(pg::decode_rows(&rows)?)
    }

    async fn begin_write(&self, target: &TableSpec) -> Result<Box<dyn TableWriter>, WarehouseError> {
        let qualified = quote_qualified(&target.table, SqlDialect::Postgres)?;
        let definitions = column_definitions(&target.columns)?;
        let column_list = target
            .columns
            .iter()
            .map(|column| quote_ident(&column.name, SqlDialect::Postgres))
            .collect::<Result<Vec<_>, _>>()?
            .join(", ");

        let mut conn = self.pool.acquire().await?;

        let lock_key = if self.config.single_writer_lock {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock(hashtext($1))")
                .bind(&qualified)
                .fetch_one(&mut *conn)
                .await?;
            if !acquired {
                return Err(WarehouseError::Locked(target.table.clone()));
            }
            debug!(table = %target.table, "advisory lock acquired");
            Some(qualified.clone())
        } else {
            None
        };

        if let Err(err) = prepare_table(&mut conn, &qualified, &definitions, target.mode).await {
            release_lock(&mut conn, lock_key.as_deref()).await;
            return Err(err);
        }
        info!(table = %target.table, mode = ?target.mode, columns = target.columns.len(), "target table prepared");

        Ok(Box::new(PgTableWriter {
            conn: Some(conn),
            insert_prefix: format!("INSERT INTO {qualified} ({column_list}) "),
            columns: target.columns.clone(),
            lock_key,
        }))
    }
}

async fn prepare_table(
    conn: &mut PgConnection,
    qualified: &str,
    definitions: &str,
    mode: WriteMode,
) -> Result<(), WarehouseError> {
    let mut statements = Vec::with_capacity(2);
    match mode {
        WriteMode::Replace => {
            statements.push(format!("DROP TABLE IF EXISTS {qualified}"));
            statements.push(format!("CREATE TABLE {qualified} ({definitions})"));
        }
        WriteMode::Truncate => {
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {qualified} ({definitions})"
            ));
            statements.push(format!("TRUNCATE TABLE {qualified}"));
        }
        WriteMode::Append => {
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {qualified} ({definitions})"
            ));
        }
    }

    let mut tx = conn.begin().await?;
    for statement in &statements {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn release_lock(conn: &mut PgConnection, lock_key: Option<&str>) {
    let Some(key) = lock_key else {
        return;
    };
    if let Err(err) = sqlx::query("SELECT pg_advisory_unlock(hashtext($1))")
        .bind(key)
        .execute(&mut *conn)
        .await
    {
        warn!(error = %format_pg_error(&err), "failed to release advisory lock");
    }
}

struct PgTableWriter {
    conn: Option<PoolConnection<Postgres>>,
    insert_prefix: String,
    columns: Vec<ColumnSpec>,
    lock_key: Option<String>,
}

fn push_bind_value(
    values: &mut Separated<'_, '_, Postgres, &'static str>,
    value: &ScalarValue,
    ty: ColumnType,
) {
    match (value, ty) {
        (ScalarValue::Null, ColumnType::Integer) => {
            values.push_bind(None::<i64>);
        }
        (ScalarValue::Null, ColumnType::Decimal) => {
            values.push_bind(None::<rust_decimal::Decimal>);
        }
        (ScalarValue::Null, ColumnType::Float) => {
            values.push_bind(None::<f64>);
        }
        (ScalarValue::Null, ColumnType::Date) => {
            values.push_bind(None::<chrono::NaiveDate>);
        }
        (ScalarValue::Null, ColumnType::Timestamp) => {
            values.push_bind(None::<chrono::NaiveDateTime>);
        }
        (ScalarValue::Null, ColumnType::Boolean) => {
            values.push_bind(None::<bool>);
        }
        (ScalarValue::Null, ColumnType::Text) => {
            values.push_bind(None::<String>);
        }
        (ScalarValue::Boolean(v), _) => {
            values.push_bind(*v);
        }
        (ScalarValue::Integer(v), _) => {
            values.push_bind(*v);
        }
        (ScalarValue::Float(v), _) => {
            values.push_bind(*v);
        }
        (ScalarValue::Decimal(v), _) => {
            values.push_bind(*v);
        }
        (ScalarValue::Text(v), _) => {
            values.push_bind(v.clone());
        }
        (ScalarValue::Date(v), _) => {
            values.push_bind(*v);
        }
        (ScalarValue::Timestamp(v), _) => {
            values.push_bind(*v);
        }
    }
}

#[async_trait]
impl TableWriter for PgTableWriter {
    async fn write_batch(&mut self, rows: &[Vec<ScalarValue>]) -> Result<u64, WarehouseError> {
        if rows.is_empty() {
            return Ok(0);
        }
        if self.columns.is_empty() {
            return Err(WarehouseError::Write("target table has no columns".into()));
        }
        check_rows(rows, &self.columns)?;
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| WarehouseError::Write("writer already finished".into()))?;

        let rows_per_statement = (MAX_BIND_PARAMS / self.columns.len()).max(1);
        let mut written = 0;
        for chunk in rows.chunks(rows_per_statement) {
            let mut builder = QueryBuilder::<Postgres>::new(&self.insert_prefix);
            let columns = &self.columns;
            builder.push_values(chunk, |mut values, row| {
                for (value, column) in row.iter().zip(columns) {
                    push_bind_value(&mut values, value, column.ty);
                }
            });
            let result = builder
                .build()
                .execute(&mut **conn)
                .await
                .map_err(|err| WarehouseError::Write(format_pg_error(&err)))?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    async fn finish(mut self: Box<Self>) -> Result<(), WarehouseError> {
        if let Some(mut conn) = self.conn.take() {
            release_lock(&mut conn, self.lock_key.take().as_deref()).await;
        }
        Ok(())
    }
}

impl Drop for PgTableWriter {
    fn drop(&mut self) {
        // A session lock dies with its connection; never hand it back to the pool.
        if self.lock_key.is_some() {
            if let Some(conn) = self.conn.take() {
                drop(conn.detach());
            }
        }
    }
}

/// In-process warehouse used by tests and local development. Reads support
/// `SELECT * FROM <table>` only.
#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    tables: RwLock<HashMap<String, MemoryTable>>,
    locked: RwLock<HashSet<String>>,
    fail_after_batches: RwLock<Option<usize>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryTable {
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<ScalarValue>>,
}

impl MemoryTable {
    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|column| column.name == name)
    }

    pub fn values(&self, name: &str) -> Vec<ScalarValue> {
        let Some(index) = self.columns.iter().position(|column| column.name == name) else {
            return Vec::new();
        };
        self.rows.iter().map(|row| row[index].clone()).collect()
    }
}

fn table_key(table: &str) -> Result<String, SqlError> {
    Ok(split_qualified(table)?.join("."))
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_table(
        &self,
        table: &str,
        columns: Vec<ColumnSpec>,
        rows: Vec<Vec<ScalarValue>>,
    ) -> Result<(), SqlError> {
        let key = table_key(table)?;
        self.state
            .tables
            .write()
            .insert(key, MemoryTable { columns, rows });
        Ok(())
    }

    pub fn table(&self, table: &str) -> Option<MemoryTable> {
        let key = table_key(table).ok()?;
        self.state.tables.read().get(&key).cloned()
    }

    /// Marks a table as held by another writer.
    pub fn lock_table(&self, table: &str) -> Result<(), SqlError> {
        self.state.locked.write().insert(table_key(table)?);
        Ok(())
    }

    /// Makes every batch after the first `n` fail.
    pub fn fail_after_batches(&self, n: usize) {
        *self.state.fail_after_batches.write() = Some(n);
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn query(&self, sql: &str, _params: &[ScalarValue]) -> Result<RowSet, WarehouseError> {
        let target = sql.trim().strip_prefix("SELECT * FROM ").ok_or_else(|| {
            WarehouseError::Query("memory warehouse only serves full-table reads".into())
        })?;
        let key = table_key(target)?;
        let tables = self.state.tables.read();
        let table = tables
            .get(&key)
            .ok_or_else(|| WarehouseError::Query(format!("relation {target} does not exist")))?;
        Ok(RowSet::with_rows(
            table.columns.iter().map(|c| c.name.clone()).collect(),
            table.rows.clone(),
        ))
    }

    async fn begin_write(&self, target: &TableSpec) -> Result<Box<dyn TableWriter>, WarehouseError> {
        quote_qualified(&target.table, SqlDialect::Postgres)?;
        column_definitions(&target.columns)?;
        let key = table_key(&target.table)?;
        if self.state.locked.read().contains(&key) {
            return Err(WarehouseError::Locked(target.table.clone()));
        }

        let mut tables = self.state.tables.write();
        let fresh = MemoryTable {
            columns: target.columns.clone(),
            rows: Vec::new(),
        };
        match target.mode {
            WriteMode::Replace => {
                tables.insert(key.clone(), fresh);
            }
            WriteMode::Truncate => {
                tables
                    .entry(key.clone())
                    .and_modify(|table| table.rows.clear())
                    .or_insert(fresh);
            }
            WriteMode::Append => {
                tables.entry(key.clone()).or_insert(fresh);
            }
        }
        let columns = tables
            .get(&key)
            .map(|table| table.columns.clone())
            .unwrap_or_default();

        Ok(Box::new(MemoryTableWriter {
            state: Arc::clone(&self.state),
            key,
            columns,
            batches: 0,
        }))
    }
}

struct MemoryTableWriter {
    state: Arc<MemoryState>,
    key: String,
    columns: Vec<ColumnSpec>,
    batches: usize,
}

#[async_trait]
impl TableWriter for MemoryTableWriter {
    async fn write_batch(&mut self, rows: &[Vec<ScalarValue>]) -> Result<u64, WarehouseError> {
        if let Some(limit) = *self.state.fail_after_batches.read() {
            if self.batches >= limit {
                return Err(WarehouseError::Write(format!(
                    "simulated failure after {limit} batches"
                )));
            }
        }
        check_rows(rows, &self.columns)?;
        let mut tables = self.state.tables.write();
        let table = tables
            .get_mut(&self.key)
            .ok_or_else(|| WarehouseError::Write(format!("table {} vanished", self.key)))?;
        table.rows.extend(rows.iter().cloned());
        self.batches += 1;
        Ok(rows.len() as u64)
    }

    async fn finish(self: Box<Self>) -> Result<(), WarehouseError> {
        Ok(())
    }
}
