//! Runs against a real warehouse when `VANTAGE_TEST_POSTGRES_URL` is set.

use std::sync::Arc;

use serde_json::json;
use vantage_db::{Database, NewRun, PgWarehouse, RunStatus, RunStore, Warehouse, WarehouseConfig};
use vantage_etl::{ConnectorConfig, DefaultConnectors, EngineConfig, EtlEngine, PipelineDescriptor};
use vantage_secrets::SecretCodec;

fn dsn() -> Option<String> {
    std::env::var("VANTAGE_TEST_POSTGRES_URL")
        .ok()
        .filter(|url| !url.trim().is_empty())
}

#[tokio::test]
async fn spreadsheet_upload_is_filtered_into_a_new_table() {
    let Some(dsn) = dsn() else {
        eprintln!("VANTAGE_TEST_POSTGRES_URL not set; skipping");
        return;
    };
    let warehouse = PgWarehouse::connect(WarehouseConfig {
        dsn,
        ..WarehouseConfig::default()
    })
    .await
    .unwrap();
    let pool = warehouse.pool().clone();
    for statement in [
        "DROP TABLE IF EXISTS public.vantage_it_budget",
        "DROP TABLE IF EXISTS public.vantage_it_budget_out",
        "CREATE TABLE public.vantage_it_budget (item TEXT, amount BIGINT)",
        "INSERT INTO public.vantage_it_budget VALUES ('rent', 1200), ('coffee', 40), ('laptops', 5400)",
    ] {
        sqlx::query(statement).execute(&pool).await.unwrap();
    }

    let warehouse: Arc<dyn Warehouse> = Arc::new(warehouse);
    let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
    let engine = EtlEngine::new(
        db.clone(),
        Arc::clone(&warehouse),
        Arc::new(DefaultConnectors::new(ConnectorConfig::default(), warehouse)),
        SecretCodec::unconfigured(),
        EngineConfig::default(),
    );
    let run = db
        .create_run(NewRun {
            pipeline_id: Some("live".into()),
            table_name: Some("public.vantage_it_budget_out".into()),
        })
        .await
        .unwrap();
    let pipeline: PipelineDescriptor = serde_json::from_value(json!({
        "nodes": [
            {"id": "src", "kind": "source", "config": {"connection": "xlsx", "table": "public.vantage_it_budget"}},
            {"id": "big", "kind": "filter", "config": {"conditions": [
                {"column": "amount", "operator": ">=", "value": 1000}
            ]}},
            {"id": "out", "kind": "sink"}
        ],
        "edges": [{"from": "src", "to": "big"}, {"from": "big", "to": "out"}],
        "sink": {"tableName": "public.vantage_it_budget_out"}
    }))
    .unwrap();
    let connections = vec![serde_json::from_value(json!({"id": "xlsx", "dialect": "excel"})).unwrap()];

    let result = engine.execute(run.id, &pipeline, &connections).await;
    assert!(result.is_ok(), "{result:?}");

    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM public.vantage_it_budget_out")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 2);
    let record = db.fetch_run(run.id).await.unwrap().unwrap();
    assert_eq!(record.status, RunStatus::Completed);
    assert_eq!(record.rows_written, 2);
}
