use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use uuid::Uuid;
use vantage_db::{Database, NewRun, RunRecord, RunStatus, RunStore, RunTransition, WorkerRegistry};
use vantage_etl::{ReconcileOutcome, ReconcilerConfig, StaleRunReconciler, SweepWorker};

/// Counts the writes that reach the underlying store.
struct CountingStore {
    inner: Arc<Database>,
    writes: AtomicUsize,
}

#[async_trait]
impl RunStore for CountingStore {
    async fn create_run(&self, new: NewRun) -> Result<RunRecord> {
        self.inner.create_run(new).await
    }

    async fn fetch_run(&self, id: Uuid) -> Result<Option<RunRecord>> {
        self.inner.fetch_run(id).await
    }

    async fn list_active_runs(&self) -> Result<Vec<RunRecord>> {
        self.inner.list_active_runs().await
    }

    async fn transition(&self, id: Uuid, change: RunTransition) -> Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.transition(id, change).await
    }

    async fn record_progress(&self, id: Uuid, rows_written: u64) -> Result<bool> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.record_progress(id, rows_written).await
    }
}

async fn processing_run(db: &Database) -> Uuid {
    let run = db
        .create_run(NewRun {
            pipeline_id: Some("nightly".into()),
            table_name: Some("sales_filtered".into()),
        })
        .await
        .unwrap();
    db.transition(run.id, RunTransition::start()).await.unwrap();
    run.id
}

async fn backdate(db: &Database, id: Uuid, minutes: i64) {
    let updated_at = (Utc::now() - chrono::Duration::minutes(minutes))
        .to_rfc3339_opts(SecondsFormat::Micros, true);
    sqlx::query("UPDATE etl_runs SET updated_at = ? WHERE id = ?")
        .bind(updated_at)
        .bind(id.to_string())
        .execute(db.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn abandoned_runs_are_failed_exactly_once() {
    let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
    let store = Arc::new(CountingStore {
        inner: db.clone(),
        writes: AtomicUsize::new(0),
    });
    let reconciler = StaleRunReconciler::new(store.clone(), ReconcilerConfig::default());
    let id = processing_run(&db).await;
    backdate(&db, id, 20).await;

    let outcome = reconciler.reconcile(id, Utc::now()).await.unwrap();
    let ReconcileOutcome::Reaped(record) = outcome else {
        panic!("expected the run to be reaped, got {outcome:?}");
    };
    assert_eq!(record.status, RunStatus::Failed);
    assert_eq!(record.error_kind.as_deref(), Some("StaleTimeout"));
    assert_eq!(store.writes.load(Ordering::SeqCst), 1);

    let again = reconciler.reconcile(id, Utc::now()).await.unwrap();
    assert_eq!(again, ReconcileOutcome::Terminal(RunStatus::Failed));
    assert_eq!(store.writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn recently_updated_runs_survive() {
    let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
    let reconciler = StaleRunReconciler::new(db.clone(), ReconcilerConfig::default());
    let id = processing_run(&db).await;
    backdate(&db, id, 5).await;

    assert_eq!(
        reconciler.reconcile(id, Utc::now()).await.unwrap(),
        ReconcileOutcome::Fresh
    );
    let record = db.fetch_run(id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Processing);
}

#[tokio::test]
async fn the_sweep_worker_reaps_in_the_background() {
    let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
    let id = processing_run(&db).await;
    backdate(&db, id, 30).await;

    let reconciler = Arc::new(StaleRunReconciler::new(db.clone(), ReconcilerConfig::default()));
    let workers = WorkerRegistry::default();
    workers.spawn(Arc::new(SweepWorker::new(reconciler, Duration::from_millis(20))));

    let mut status = RunStatus::Processing;
    for _ in 0..50 {
        status = db.fetch_run(id).await.unwrap().unwrap().status;
        if status == RunStatus::Failed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    workers.abort_all();
    assert_eq!(status, RunStatus::Failed);
}
