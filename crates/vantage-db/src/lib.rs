//! Vantage persistence layer.
//!
//! Holds the pieces of the ETL engine that talk to storage:
//! the typed value model, dialect-aware SQL composition, the run status
//! store (SQLite via sqlx, with embedded migrations) and the warehouse
//! writer that materializes pipeline output into PostgreSQL tables.

use std::{fmt, path::Path, str::FromStr, sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::TryStreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Row, SqlitePool,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub mod pg;
pub mod sql;
pub mod value;
pub mod warehouse;

pub use sql::{SqlDialect, SqlError, SqlFragment};
pub use value::{ColumnType, RowSet, ScalarValue};
pub use warehouse::{
    ColumnSpec, MemoryWarehouse, PgWarehouse, TableSpec, TableWriter, Warehouse,
    WarehouseConfig, WarehouseError, WriteMode,
};

/// Default SQLite busy timeout in milliseconds when the DB is under load.
const SQLITE_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Run lifecycle: `pending -> processing -> {completed | failed}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Processing)
                | (RunStatus::Pending, RunStatus::Failed)
                | (RunStatus::Processing, RunStatus::Completed)
                | (RunStatus::Processing, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "processing" => Ok(RunStatus::Processing),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(anyhow!("unknown run status: {}", other)),
        }
    }
}

/// Persisted run/import status row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    pub status: RunStatus,
    pub rows_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewRun {
    pub pipeline_id: Option<String>,
    pub table_name: Option<String>,
}

/// Failure details stored on a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFailure {
    pub kind: String,
    pub message: String,
}

/// A conditional status change. It applies only while the run is still in
/// `from` and, when `observed_updated_at` is set, has not been touched since.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTransition {
    pub from: RunStatus,
    pub to: RunStatus,
    pub observed_updated_at: Option<DateTime<Utc>>,
    pub rows_written: Option<u64>,
    pub failure: Option<RunFailure>,
}

impl RunTransition {
    pub fn start() -> Self {
        Self {
            from: RunStatus::Pending,
            to: RunStatus::Processing,
            observed_updated_at: None,
            rows_written: None,
            failure: None,
        }
    }

    pub fn complete(rows_written: u64) -> Self {
        Self {
            from: RunStatus::Processing,
            to: RunStatus::Completed,
            observed_updated_at: None,
            rows_written: Some(rows_written),
            failure: None,
        }
    }

    pub fn fail(
        from: RunStatus,
        kind: impl Into<String>,
        message: impl Into<String>,
        rows_written: Option<u64>,
    ) -> Self {
        Self {
            from,
            to: RunStatus::Failed,
            observed_updated_at: None,
            rows_written,
            failure: Some(RunFailure {
                kind: kind.into(),
                message: message.into(),
            }),
        }
    }

    pub fn observed_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.observed_updated_at = Some(updated_at);
        self
    }
}

/// Errors returned by the run store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("run '{0}' not found")]
    NotFound(Uuid),
    #[error("illegal run transition {from} -> {to}")]
    IllegalTransition { from: RunStatus, to: RunStatus },
}

/// Storage contract consumed by the executor and the stale-run reconciler.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, new: NewRun) -> Result<RunRecord>;

    async fn fetch_run(&self, id: Uuid) -> Result<Option<RunRecord>>;

    /// Runs that are `pending` or `processing`.
    async fn list_active_runs(&self) -> Result<Vec<RunRecord>>;

    /// Applies a conditional transition. Returns whether the record changed.
    async fn transition(&self, id: Uuid, change: RunTransition) -> Result<bool>;

    /// Updates the running row count of a `processing` run.
    async fn record_progress(&self, id: Uuid, rows_written: u64) -> Result<bool>;
}

/// SQLite-backed run store.
#[derive(Clone, Debug)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes (or creates) a connection pool to the SQLite database located at
    /// the given URL (e.g. `sqlite:///var/lib/vantage/state.db`).
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(SQLITE_BUSY_TIMEOUT_MS));

        // every connection to `sqlite::memory:` opens its own database
        let max_connections = if database_url.contains(":memory:") { 1 } else { 8 };

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    /// Connects to a file path via `sqlite://` scheme.
    pub async fn connect_file(path: &Path) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        Self::connect(&url).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RunStore for Database {
    async fn create_run(&self, new: NewRun) -> Result<RunRecord> {
        let now = format_timestamp(Utc::now());
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO etl_runs (
                id, pipeline_id, table_name, status, rows_written, created_at, updated_at
            ) VALUES (?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&new.pipeline_id)
        .bind(&new.table_name)
        .bind(RunStatus::Pending.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        self.fetch_run(id)
            .await?
            .ok_or_else(|| anyhow!("run {} inserted but missing when reloaded", id))
    }

    async fn fetch_run(&self, id: Uuid) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM etl_runs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(map_run).transpose()
    }

    async fn list_active_runs(&self) -> Result<Vec<RunRecord>> {
        let mut rows = sqlx::query(
            "SELECT * FROM etl_runs WHERE status IN ('pending', 'processing') ORDER BY updated_at",
        )
        .fetch(&self.pool);

        let mut out = Vec::new();
        while let Some(row) = rows.try_next().await? {
            out.push(map_run(row)?);
        }
        Ok(out)
    }

    async fn transition(&self, id: Uuid, change: RunTransition) -> Result<bool> {
        if !change.from.can_transition_to(change.to) {
            return Err(StoreError::IllegalTransition {
                from: change.from,
                to: change.to,
            }
            .into());
        }

        let observed = change.observed_updated_at.map(format_timestamp);
        let (error_kind, error_message) = match change.failure {
            Some(failure) => (Some(failure.kind), Some(failure.message)),
            None => (None, None),
        };

        let result = sqlx::query(
            r#"
            UPDATE etl_runs
            SET status = ?,
                updated_at = ?,
                rows_written = COALESCE(?, rows_written),
                error_kind = COALESCE(?, error_kind),
                error_message = COALESCE(?, error_message)
            WHERE id = ? AND status = ? AND (? IS NULL OR updated_at = ?)
            "#,
        )
        .bind(change.to.as_str())
        .bind(format_timestamp(Utc::now()))
        .bind(change.rows_written.map(|rows| rows as i64))
        .bind(error_kind)
        .bind(error_message)
        .bind(id.to_string())
        .bind(change.from.as_str())
        .bind(&observed)
        .bind(&observed)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_progress(&self, id: Uuid, rows_written: u64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE etl_runs
            SET rows_written = ?, updated_at = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(rows_written as i64)
        .bind(format_timestamp(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

/// Fixed precision keeps stored timestamps comparable as strings.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(value: String) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| anyhow!("invalid RFC3339 timestamp '{}': {}", value, err))
}

fn map_run(row: SqliteRow) -> Result<RunRecord> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;

    Ok(RunRecord {
        id: Uuid::parse_str(&id)?,
        pipeline_id: row.try_get("pipeline_id")?,
        table_name: row.try_get("table_name")?,
        status: RunStatus::from_str(&status)?,
        rows_written: row.try_get::<i64, _>("rows_written")?.max(0) as u64,
        error_kind: row.try_get("error_kind")?,
        error_message: row.try_get("error_message")?,
        created_at: parse_datetime(row.try_get("created_at")?)?,
        updated_at: parse_datetime(row.try_get("updated_at")?)?,
    })
}

/// Helper trait for background jobs that need a graceful shutdown.
#[async_trait]
pub trait BackgroundWorker: Send + Sync {
    async fn run(self: Arc<Self>) -> Result<()>;
}

/// A guard that owns the join handle of a running worker.
pub struct WorkerGuard {
    handle: JoinHandle<Result<()>>,
}

impl WorkerGuard {
    pub fn new(handle: JoinHandle<Result<()>>) -> Self {
        Self { handle }
    }

    pub async fn join(self) -> Result<()> {
        self.handle.await??;
        Ok(())
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Owns the join handles of the daemon's background workers.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<Vec<WorkerGuard>>,
}

impl WorkerRegistry {
    pub fn register(&self, handle: JoinHandle<Result<()>>) {
        self.workers.write().push(WorkerGuard::new(handle));
    }

    pub fn spawn<W>(&self, worker: Arc<W>)
    where
        W: BackgroundWorker + 'static,
    {
        self.register(tokio::spawn(worker.run()));
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }

    /// Stops every worker without waiting for it.
    pub fn abort_all(&self) {
        for guard in self.workers.read().iter() {
            guard.abort();
        }
    }

    pub async fn wait_all(self) -> Result<()> {
        for guard in self.workers.into_inner() {
            guard.join().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DB_URL: &str = "sqlite::memory:";

    async fn setup_db() -> Database {
        Database::connect(TEST_DB_URL).await.unwrap()
    }

    fn new_run() -> NewRun {
        NewRun {
            pipeline_id: Some("pipeline-7".into()),
            table_name: Some("sales_by_region".into()),
        }
    }

    #[tokio::test]
    async fn create_and_fetch_run_roundtrip() {
        let db = setup_db().await;
        let record = db.create_run(new_run()).await.unwrap();

        assert_eq!(record.status, RunStatus::Pending);
        assert_eq!(record.rows_written, 0);

        let fetched = db.fetch_run(record.id).await.unwrap().unwrap();
        assert_eq!(fetched, record);
        assert!(db.fetch_run(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lifecycle_transitions_and_progress() {
        let db = setup_db().await;
        let run = db.create_run(new_run()).await.unwrap();

        assert!(db.transition(run.id, RunTransition::start()).await.unwrap());
        // a second start observes `processing` and does nothing
        assert!(!db.transition(run.id, RunTransition::start()).await.unwrap());

        assert!(db.record_progress(run.id, 500).await.unwrap());
        assert_eq!(db.fetch_run(run.id).await.unwrap().unwrap().rows_written, 500);

        assert!(db.transition(run.id, RunTransition::complete(730)).await.unwrap());
        let done = db.fetch_run(run.id).await.unwrap().unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.rows_written, 730);

        // terminal runs never move again
        let again = RunTransition::fail(RunStatus::Processing, "Unknown", "late failure", None);
        assert!(!db.transition(run.id, again).await.unwrap());
        assert!(!db.record_progress(run.id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn failures_keep_message_and_partial_count() {
        let db = setup_db().await;
        let run = db.create_run(new_run()).await.unwrap();
        db.transition(run.id, RunTransition::start()).await.unwrap();
        db.record_progress(run.id, 1000).await.unwrap();

        let failed = RunTransition::fail(
            RunStatus::Processing,
            "WriteError",
            "batch 3 failed",
            None,
        );
        assert!(db.transition(run.id, failed).await.unwrap());

        let record = db.fetch_run(run.id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.rows_written, 1000);
        assert_eq!(record.error_kind.as_deref(), Some("WriteError"));
        assert_eq!(record.error_message.as_deref(), Some("batch 3 failed"));
    }

    #[tokio::test]
    async fn observed_timestamp_guards_the_update() {
        let db = setup_db().await;
        let run = db.create_run(new_run()).await.unwrap();

        let stale_view = run.updated_at - chrono::Duration::seconds(5);
        let guarded = RunTransition::fail(RunStatus::Pending, "StaleTimeout", "timed out", None)
            .observed_at(stale_view);
        assert!(!db.transition(run.id, guarded).await.unwrap());

        let current = RunTransition::fail(RunStatus::Pending, "StaleTimeout", "timed out", None)
            .observed_at(run.updated_at);
        assert!(db.transition(run.id, current).await.unwrap());
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let db = setup_db().await;
        let run = db.create_run(NewRun::default()).await.unwrap();
        let change = RunTransition {
            from: RunStatus::Completed,
            to: RunStatus::Processing,
            observed_updated_at: None,
            rows_written: None,
            failure: None,
        };
        let err = db.transition(run.id, change).await.unwrap_err();
        assert!(matches!(
            err.downcast::<StoreError>().unwrap(),
            StoreError::IllegalTransition { .. }
        ));
    }

    #[tokio::test]
    async fn active_runs_exclude_terminal_ones() {
        let db = setup_db().await;
        let pending = db.create_run(new_run()).await.unwrap();
        let finished = db.create_run(new_run()).await.unwrap();
        db.transition(finished.id, RunTransition::start()).await.unwrap();
        db.transition(finished.id, RunTransition::complete(0)).await.unwrap();

        let active = db.list_active_runs().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, pending.id);
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_pools() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let id = {
            let db = Database::connect_file(&path).await.unwrap();
            db.create_run(new_run()).await.unwrap().id
        };
        let reopened = Database::connect_file(&path).await.unwrap();
        assert!(reopened.fetch_run(id).await.unwrap().is_some());
    }
}
