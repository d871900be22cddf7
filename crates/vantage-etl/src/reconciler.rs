//! Marks abandoned runs as failed.
//!
//! A run that stays `pending` or `processing` without an update for longer
//! than the threshold is failed with `StaleTimeout`. The transition is
//! conditional on the observed status and `updated_at`, so a run that makes
//! progress in the meantime is left alone.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vantage_db::{BackgroundWorker, RunRecord, RunStatus, RunStore, RunTransition};

use crate::error::ErrorKind;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub stale_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(12 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    NotFound,
    Terminal(RunStatus),
    Fresh,
    /// The run was failed; holds the record as it is now stored.
    Reaped(RunRecord),
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ReconcileOutcome::Reaped(_))
    }
}

pub struct StaleRunReconciler {
    store: Arc<dyn RunStore>,
    config: ReconcilerConfig,
}

impl StaleRunReconciler {
    pub fn new(store: Arc<dyn RunStore>, config: ReconcilerConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn is_stale(&self, record: &RunRecord, now: DateTime<Utc>) -> bool {
        let idle = now.signed_duration_since(record.updated_at);
        idle.to_std()
            .map(|idle| idle > self.config.stale_after)
            .unwrap_or(false)
    }

    pub async fn reconcile(&self, id: Uuid, now: DateTime<Utc>) -> Result<ReconcileOutcome> {
        let Some(record) = self.store.fetch_run(id).await? else {
            return Ok(ReconcileOutcome::NotFound);
        };
        if record.status.is_terminal() {
            return Ok(ReconcileOutcome::Terminal(record.status));
        }
        if !self.is_stale(&record, now) {
            return Ok(ReconcileOutcome::Fresh);
        }

        let minutes = self.config.stale_after.as_secs() / 60;
        let message = format!(
            "run timed out: no progress for more than {minutes} minutes while {} (last update {})",
            record.status,
            record.updated_at.to_rfc3339()
        );
        let change = RunTransition::fail(
            record.status,
            ErrorKind::StaleTimeout.as_str(),
            message,
            None,
        )
        .observed_at(record.updated_at);

        if !self.store.transition(id, change).await? {
            debug!(run_id = %id, "run changed concurrently; not reaped");
            return Ok(ReconcileOutcome::Fresh);
        }
        info!(run_id = %id, status = %record.status, "stale run failed");

        match self.store.fetch_run(id).await? {
            Some(updated) => Ok(ReconcileOutcome::Reaped(updated)),
            None => Ok(ReconcileOutcome::NotFound),
        }
    }

    /// Reconciles every active run. Returns the ids that were failed.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut reaped = Vec::new();
        for record in self.store.list_active_runs().await? {
            match self.reconcile(record.id, now).await {
                Ok(outcome) if outcome.changed() => reaped.push(record.id),
                Ok(_) => {}
                Err(err) => warn!(run_id = %record.id, error = %err, "reconcile failed"),
            }
        }
        Ok(reaped)
    }
}

/// Runs [`StaleRunReconciler::sweep`] on a fixed interval.
pub struct SweepWorker {
    reconciler: Arc<StaleRunReconciler>,
    interval: Duration,
}

impl SweepWorker {
    pub fn new(reconciler: Arc<StaleRunReconciler>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
        }
    }
}

#[async_trait]
impl BackgroundWorker for SweepWorker {
    async fn run(self: Arc<Self>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.reconciler.sweep(Utc::now()).await {
                Ok(reaped) if !reaped.is_empty() => {
                    info!(count = reaped.len(), "stale runs failed");
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "stale-run sweep failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use vantage_db::{Database, NewRun};

    async fn store() -> Arc<Database> {
        Arc::new(Database::connect("sqlite::memory:").await.unwrap())
    }

    fn new_run() -> NewRun {
        NewRun {
            pipeline_id: Some("pipe-1".into()),
            table_name: Some("sales_filtered".into()),
        }
    }

    #[tokio::test]
    async fn fresh_and_terminal_runs_are_left_alone() {
        let db = store().await;
        let reconciler = StaleRunReconciler::new(db.clone(), ReconcilerConfig::default());
        let run = db.create_run(new_run()).await.unwrap();

        let outcome = reconciler.reconcile(run.id, Utc::now()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Fresh);

        db.transition(run.id, RunTransition::start()).await.unwrap();
        db.transition(run.id, RunTransition::complete(3)).await.unwrap();
        let later = Utc::now() + ChronoDuration::hours(1);
        let outcome = reconciler.reconcile(run.id, later).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Terminal(RunStatus::Completed));

        let outcome = reconciler.reconcile(Uuid::new_v4(), later).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::NotFound);
    }

    #[tokio::test]
    async fn stale_runs_are_failed_once() {
        let db = store().await;
        let reconciler = StaleRunReconciler::new(db.clone(), ReconcilerConfig::default());
        let run = db.create_run(new_run()).await.unwrap();
        db.transition(run.id, RunTransition::start()).await.unwrap();

        let later = Utc::now() + ChronoDuration::minutes(20);
        let ReconcileOutcome::Reaped(record) = reconciler.reconcile(run.id, later).await.unwrap()
        else {
            panic!("expected the run to be reaped");
        };
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.error_kind.as_deref(), Some("StaleTimeout"));
        assert!(record.error_message.unwrap().contains("timed out"));

        let again = reconciler.reconcile(run.id, later).await.unwrap();
        assert_eq!(again, ReconcileOutcome::Terminal(RunStatus::Failed));
    }

    #[tokio::test]
    async fn sweep_reaps_only_stale_runs() {
        let db = store().await;
        let reconciler = StaleRunReconciler::new(
            db.clone(),
            ReconcilerConfig {
                stale_after: Duration::from_secs(60),
            },
        );
        let stale = db.create_run(new_run()).await.unwrap();
        let now = stale.updated_at + ChronoDuration::minutes(5);

        let reaped = reconciler.sweep(now).await.unwrap();
        assert_eq!(reaped, vec![stale.id]);
        assert!(reconciler.sweep(now).await.unwrap().is_empty());
    }
}
