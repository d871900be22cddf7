use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;
use vantage_db::{
    Database, NewRun, PgWarehouse, RunRecord, RunStore, Warehouse, WarehouseConfig,
    WorkerRegistry,
};
use vantage_etl::{
    ConnectionDescriptor, DefaultConnectors, EngineConfig, EtlEngine, ExecutionResult,
    PipelineDescriptor, ReconcileOutcome, ReconcilerConfig, StaleRunReconciler, SweepWorker,
};
use vantage_secrets::{SecretCodec, SecretConfig, SecretError};

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    let db = Database::connect(&config.state_dsn)
        .await
        .context("failed to open run store")?;
    let warehouse = PgWarehouse::connect(config.warehouse.clone())
        .await
        .context("failed to connect to the warehouse")?;

    let state = Arc::new(AppState::new(&config, Arc::new(db), Arc::new(warehouse)));

    let workers = WorkerRegistry::default();
    if let Some(interval) = config.reconcile_interval {
        workers.spawn(Arc::new(SweepWorker::new(
            Arc::clone(&state.reconciler),
            interval,
        )));
        info!(interval_secs = interval.as_secs(), "stale-run sweep enabled");
    }

    let app = build_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;

    info!(addr = %config.listen_addr, "vantage-daemon listening");
    let served = axum::serve(listener, app).await.context("HTTP server exited");
    workers.abort_all();
    served
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/v1/connections/test", post(test_connection))
        .route("/api/v1/secrets/encrypt", post(encrypt_secret))
        .route("/api/v1/runs", post(create_run))
        .route("/api/v1/runs/:id", get(get_run))
        .route("/api/v1/runs/:id/execute", post(execute_run))
        .route("/api/v1/runs/:id/reconcile", post(reconcile_run))
        .route("/api/v1/pipelines/run", post(run_pipeline))
        .with_state(state)
}

struct AppState {
    store: Arc<dyn RunStore>,
    engine: EtlEngine,
    reconciler: Arc<StaleRunReconciler>,
}

impl AppState {
    fn new(config: &AppConfig, store: Arc<dyn RunStore>, warehouse: Arc<dyn Warehouse>) -> Self {
        let connectors =
            DefaultConnectors::new(config.engine.connector.clone(), Arc::clone(&warehouse));
        let engine = EtlEngine::new(
            Arc::clone(&store),
            warehouse,
            Arc::new(connectors),
            SecretCodec::new(&config.secrets),
            config.engine.clone(),
        );
        let reconciler = Arc::new(StaleRunReconciler::new(
            Arc::clone(&store),
            config.reconciler.clone(),
        ));
        Self {
            store,
            engine,
            reconciler,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub state_dsn: String,
    pub warehouse: WarehouseConfig,
    pub secrets: SecretConfig,
    pub engine: EngineConfig,
    pub reconciler: ReconcilerConfig,
    /// Period of the background stale-run sweep; `None` disables it.
    pub reconcile_interval: Option<Duration>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|key| env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| var(key).filter(|value| !value.trim().is_empty());

        let listen_addr = var("VANTAGE_API_ADDR")
            .unwrap_or_else(|| "127.0.0.1:8080".to_string())
            .parse()
            .context("invalid VANTAGE_API_ADDR")?;

        let state_dsn =
            var("VANTAGE_STATE_DSN").unwrap_or_else(|| "sqlite://vantage-state.db".to_string());

        let warehouse = WarehouseConfig {
            dsn: var("VANTAGE_WAREHOUSE_DSN").context("VANTAGE_WAREHOUSE_DSN must be configured")?,
            single_writer_lock: parse_bool(var("VANTAGE_SINGLE_WRITER_LOCK"))
                .context("invalid VANTAGE_SINGLE_WRITER_LOCK")?
                .unwrap_or(false),
            ..WarehouseConfig::default()
        };

        let secrets = SecretConfig {
            key: var("VANTAGE_ENCRYPTION_KEY"),
        };

        let mut engine = EngineConfig::default();
        if let Some(size) = parse_number::<usize>(var("VANTAGE_BATCH_SIZE"))
            .context("invalid VANTAGE_BATCH_SIZE")?
        {
            anyhow::ensure!(size > 0, "VANTAGE_BATCH_SIZE must be positive");
            engine.batch_size = size;
        }
        if let Some(secs) = parse_number::<u64>(var("VANTAGE_CONNECT_TIMEOUT_SECS"))
            .context("invalid VANTAGE_CONNECT_TIMEOUT_SECS")?
        {
            engine.connector.connect_timeout = Duration::from_secs(secs);
        }

        let mut reconciler = ReconcilerConfig::default();
        if let Some(secs) = parse_number::<u64>(var("VANTAGE_STALE_AFTER_SECS"))
            .context("invalid VANTAGE_STALE_AFTER_SECS")?
        {
            reconciler.stale_after = Duration::from_secs(secs);
        }

        let reconcile_interval = parse_number::<u64>(var("VANTAGE_RECONCILE_INTERVAL_SECS"))
            .context("invalid VANTAGE_RECONCILE_INTERVAL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Ok(Self {
            listen_addr,
            state_dsn,
            warehouse,
            secrets,
            engine,
            reconciler,
            reconcile_interval,
        })
    }
}

fn parse_number<T>(raw: Option<String>) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.map(|value| value.trim().parse::<T>())
        .transpose()
        .map_err(Into::into)
}

fn parse_bool(raw: Option<String>) -> Result<Option<bool>> {
    let Some(value) = raw else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        other => anyhow::bail!("'{other}' is not a boolean"),
    }
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Service is healthy"))
)]
async fn healthz() -> StatusCode {
    StatusCode::OK
}

#[utoipa::path(
    post,
    path = "/api/v1/connections/test",
    request_body = TestConnectionBody,
    responses((status = 200, description = "Outcome of the connection probe", body = ConnectionTestResponse))
)]
async fn test_connection(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TestConnectionBody>,
) -> Json<ConnectionTestResponse> {
    let response = match state.engine.test_connection(&payload.connection).await {
        Ok(()) => ConnectionTestResponse {
            ok: true,
            error_kind: None,
            message: None,
        },
        Err(err) => ConnectionTestResponse {
            ok: false,
            error_kind: Some(err.kind().as_str().to_string()),
            message: Some(err.to_string()),
        },
    };
    Json(response)
}

#[utoipa::path(
    post,
    path = "/api/v1/secrets/encrypt",
    request_body = EncryptBody,
    responses(
        (status = 200, description = "Encrypted blob", body = EncryptResponse),
        (status = 503, description = "No encryption key configured", body = ErrorBody)
    )
)]
async fn encrypt_secret(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<EncryptBody>,
) -> Result<Json<EncryptResponse>, ApiError> {
    let ciphertext = state.engine.codec().encrypt(&payload.plaintext)?;
    Ok(Json(EncryptResponse { ciphertext }))
}

#[utoipa::path(
    post,
    path = "/api/v1/runs",
    request_body = CreateRunBody,
    responses((status = 201, description = "Run created", body = RunResponse))
)]
async fn create_run(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateRunBody>,
) -> Result<(StatusCode, Json<RunResponse>), ApiError> {
    let record = state
        .store
        .create_run(NewRun {
            pipeline_id: payload.pipeline_id,
            table_name: payload.table_name,
        })
        .await
        .map_err(ApiError::internal)?;
    Ok((StatusCode::CREATED, Json(RunResponse::from(record))))
}

#[utoipa::path(
    get,
    path = "/api/v1/runs/{id}",
    params(("id" = Uuid, Path, description = "Run identifier")),
    responses(
        (status = 200, description = "Run record", body = RunResponse),
        (status = 404, description = "Run not found", body = ErrorBody)
    )
)]
async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<RunResponse>, ApiError> {
    let record = fetch_run(&state, id).await?;
    Ok(Json(RunResponse::from(record)))
}

#[utoipa::path(
    post,
    path = "/api/v1/runs/{id}/execute",
    params(("id" = Uuid, Path, description = "Run identifier")),
    request_body = ExecuteRunBody,
    responses(
        (status = 200, description = "Execution result", body = ExecutionResponse),
        (status = 404, description = "Run not found", body = ErrorBody)
    )
)]
async fn execute_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ExecuteRunBody>,
) -> Result<Json<ExecutionResponse>, ApiError> {
    fetch_run(&state, id).await?;
    let result = state
        .engine
        .execute(id, &payload.pipeline, &payload.connections)
        .await;
    Ok(Json(ExecutionResponse::new(id, result)))
}

#[utoipa::path(
    post,
    path = "/api/v1/pipelines/run",
    request_body = RunPipelineBody,
    responses((status = 200, description = "Execution result of a fresh run", body = ExecutionResponse))
)]
async fn run_pipeline(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RunPipelineBody>,
) -> Result<Json<ExecutionResponse>, ApiError> {
    let record = state
        .store
        .create_run(NewRun {
            pipeline_id: payload.pipeline_id,
            table_name: Some(payload.pipeline.sink.table_name.clone()),
        })
        .await
        .map_err(ApiError::internal)?;
    let result = state
        .engine
        .execute(record.id, &payload.pipeline, &payload.connections)
        .await;
    Ok(Json(ExecutionResponse::new(record.id, result)))
}

#[utoipa::path(
    post,
    path = "/api/v1/runs/{id}/reconcile",
    params(("id" = Uuid, Path, description = "Run identifier")),
    responses(
        (status = 200, description = "Reconciled run", body = ReconcileResponse),
        (status = 404, description = "Run not found", body = ErrorBody)
    )
)]
async fn reconcile_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReconcileResponse>, ApiError> {
    let outcome = state
        .reconciler
        .reconcile(id, Utc::now())
        .await
        .map_err(ApiError::internal)?;
    let (changed, record) = match outcome {
        ReconcileOutcome::NotFound => return Err(ApiError::run_not_found(id)),
        ReconcileOutcome::Reaped(record) => (true, record),
        ReconcileOutcome::Fresh | ReconcileOutcome::Terminal(_) => {
            (false, fetch_run(&state, id).await?)
        }
    };
    Ok(Json(ReconcileResponse {
        changed,
        run: RunResponse::from(record),
    }))
}

async fn fetch_run(state: &AppState, id: Uuid) -> Result<RunRecord, ApiError> {
    state
        .store
        .fetch_run(id)
        .await
        .map_err(ApiError::internal)?
        .ok_or_else(|| ApiError::run_not_found(id))
}

#[derive(Debug, Deserialize, ToSchema)]
struct TestConnectionBody {
    #[schema(value_type = Object)]
    connection: ConnectionDescriptor,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ConnectionTestResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

#[derive(Deserialize, ToSchema)]
struct EncryptBody {
    plaintext: String,
}

#[derive(Debug, Serialize, ToSchema)]
struct EncryptResponse {
    ciphertext: String,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct CreateRunBody {
    #[serde(default)]
    pipeline_id: Option<String>,
    #[serde(default)]
    table_name: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
struct ExecuteRunBody {
    #[schema(value_type = Object)]
    pipeline: PipelineDescriptor,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    connections: Vec<ConnectionDescriptor>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct RunPipelineBody {
    #[serde(default)]
    pipeline_id: Option<String>,
    #[schema(value_type = Object)]
    pipeline: PipelineDescriptor,
    #[serde(default)]
    #[schema(value_type = Vec<Object>)]
    connections: Vec<ConnectionDescriptor>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct RunResponse {
    id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pipeline_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    table_name: Option<String>,
    status: String,
    rows_written: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<RunRecord> for RunResponse {
    fn from(record: RunRecord) -> Self {
        Self {
            id: record.id,
            pipeline_id: record.pipeline_id,
            table_name: record.table_name,
            status: record.status.to_string(),
            rows_written: record.rows_written,
            error_kind: record.error_kind,
            error_message: record.error_message,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

/// An execution result tagged with its run id.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
struct ExecutionResponse {
    run_id: Uuid,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rows_written: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    table_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ExecutionResponse {
    fn new(run_id: Uuid, result: ExecutionResult) -> Self {
        match result {
            ExecutionResult::Success(success) => Self {
                run_id,
                ok: true,
                rows_written: Some(success.rows_written),
                table_name: Some(success.table_name),
                warnings: Some(success.warnings),
                warning_count: Some(success.warning_count),
                error_kind: None,
                message: None,
            },
            ExecutionResult::Failure(failure) => Self {
                run_id,
                ok: false,
                rows_written: None,
                table_name: None,
                warnings: None,
                warning_count: None,
                error_kind: Some(failure.error_kind.as_str().to_string()),
                message: Some(failure.message),
            },
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ReconcileResponse {
    changed: bool,
    run: RunResponse,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }

    fn run_not_found(id: Uuid) -> Self {
        Self::new(StatusCode::NOT_FOUND, format!("run {id} not found"))
    }
}

impl From<SecretError> for ApiError {
    fn from(err: SecretError) -> Self {
        match err {
            SecretError::EncryptionKeyMissing => {
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
            }
            SecretError::DecryptionError(_) => ApiError::new(StatusCode::BAD_REQUEST, err.to_string()),
            SecretError::EncryptionError(_) => ApiError::internal(err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(status = %self.status, message = %self.message, "api error");
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

pub mod docs {
    use super::*;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Vantage ETL API", version = "0.1.0"),
        paths(
            healthz,
            test_connection,
            encrypt_secret,
            create_run,
            get_run,
            execute_run,
            run_pipeline,
            reconcile_run
        ),
        components(schemas(
            TestConnectionBody,
            ConnectionTestResponse,
            EncryptBody,
            EncryptResponse,
            CreateRunBody,
            ExecuteRunBody,
            RunPipelineBody,
            RunResponse,
            ExecutionResponse,
            ReconcileResponse,
            ErrorBody
        ))
    )]
    pub struct ApiDoc;
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use vantage_db::{ColumnSpec, ColumnType, MemoryWarehouse, RunStatus, RunTransition, ScalarValue};

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_vars(|key| vars.get(key).cloned())
    }

    async fn setup_test_app(key: Option<&str>) -> (Arc<AppState>, Router, TempDir) {
        let temp = TempDir::new().expect("tempdir");
        let db_path = temp.path().join(format!("state-{}.sqlite", Uuid::new_v4()));
        let db = Database::connect_file(&db_path).await.expect("db");

        let warehouse = MemoryWarehouse::new();
        warehouse
            .insert_table(
                "uploads.budget",
                vec![
                    ColumnSpec::new("item", ColumnType::Text),
                    ColumnSpec::new("amount", ColumnType::Integer),
                ],
                vec![
                    vec![ScalarValue::Text("rent".into()), ScalarValue::Integer(1200)],
                    vec![ScalarValue::Text("coffee".into()), ScalarValue::Integer(40)],
                    vec![ScalarValue::Text("laptops".into()), ScalarValue::Integer(5400)],
                ],
            )
            .expect("seed table");

        let mut vars = vec![("VANTAGE_WAREHOUSE_DSN", "postgres://unused/warehouse")];
        if let Some(key) = key {
            vars.push(("VANTAGE_ENCRYPTION_KEY", key));
        }
        let config = config(&vars).expect("config");
        let state = Arc::new(AppState::new(&config, Arc::new(db), Arc::new(warehouse)));
        let router = build_router(state.clone());
        (state, router, temp)
    }

    async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = match body {
            Some(value) => Body::from(serde_json::to_vec(&value).unwrap()),
            None => Body::empty(),
        };
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn budget_pipeline() -> Value {
        json!({
            "nodes": [
                {"id": "src", "kind": "source", "config": {"connection": "xlsx", "table": "uploads.budget"}},
                {"id": "big", "kind": "filter", "config": {"conditions": [
                    {"column": "amount", "operator": ">=", "value": 1000}
                ]}},
                {"id": "out", "kind": "sink"}
            ],
            "edges": [{"from": "src", "to": "big"}, {"from": "big", "to": "out"}],
            "sink": {"tableName": "budget_big"}
        })
    }

    fn budget_connections() -> Value {
        json!([{"id": "xlsx", "dialect": "excel"}])
    }

    #[test]
    fn config_defaults_and_overrides() {
        let defaults = config(&[("VANTAGE_WAREHOUSE_DSN", "postgres://wh/analytics")]).unwrap();
        assert_eq!(defaults.listen_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(defaults.engine.batch_size, 500);
        assert_eq!(defaults.reconciler.stale_after, Duration::from_secs(720));
        assert!(defaults.reconcile_interval.is_none());
        assert!(!defaults.warehouse.single_writer_lock);
        assert!(defaults.secrets.key.is_none());

        let tuned = config(&[
            ("VANTAGE_WAREHOUSE_DSN", "postgres://wh/analytics"),
            ("VANTAGE_API_ADDR", "0.0.0.0:9000"),
            ("VANTAGE_BATCH_SIZE", "250"),
            ("VANTAGE_CONNECT_TIMEOUT_SECS", "3"),
            ("VANTAGE_STALE_AFTER_SECS", "60"),
            ("VANTAGE_RECONCILE_INTERVAL_SECS", "30"),
            ("VANTAGE_SINGLE_WRITER_LOCK", "yes"),
        ])
        .unwrap();
        assert_eq!(tuned.listen_addr.port(), 9000);
        assert_eq!(tuned.engine.batch_size, 250);
        assert_eq!(tuned.engine.connector.connect_timeout, Duration::from_secs(3));
        assert_eq!(tuned.reconciler.stale_after, Duration::from_secs(60));
        assert_eq!(tuned.reconcile_interval, Some(Duration::from_secs(30)));
        assert!(tuned.warehouse.single_writer_lock);
    }

    #[test]
    fn config_rejects_missing_or_malformed_values() {
        assert!(config(&[]).is_err());
        let err = config(&[
            ("VANTAGE_WAREHOUSE_DSN", "postgres://wh/analytics"),
            ("VANTAGE_BATCH_SIZE", "many"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("VANTAGE_BATCH_SIZE"));
        assert!(config(&[
            ("VANTAGE_WAREHOUSE_DSN", "postgres://wh/analytics"),
            ("VANTAGE_SINGLE_WRITER_LOCK", "sometimes"),
        ])
        .is_err());
    }

    #[tokio::test]
    async fn healthz_is_ok() {
        let (_state, router, _tmp) = setup_test_app(None).await;
        let (status, _) = send(&router, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn runs_can_be_created_and_fetched() {
        let (_state, router, _tmp) = setup_test_app(None).await;
        let (status, created) = send(
            &router,
            "POST",
            "/api/v1/runs",
            Some(json!({"pipelineId": "p-7", "tableName": "budget_big"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "pending");
        assert_eq!(created["rowsWritten"], 0);

        let id = created["id"].as_str().unwrap();
        let (status, fetched) = send(&router, "GET", &format!("/api/v1/runs/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(fetched["pipelineId"], "p-7");

        let (status, body) = send(&router, "GET", &format!("/api/v1/runs/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn pipeline_runs_execute_once() {
        let (_state, router, _tmp) = setup_test_app(None).await;
        let (status, result) = send(
            &router,
            "POST",
            "/api/v1/pipelines/run",
            Some(json!({
                "pipelineId": "budget",
                "pipeline": budget_pipeline(),
                "connections": budget_connections()
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["ok"], true, "{result}");
        assert_eq!(result["rowsWritten"], 2);
        assert_eq!(result["tableName"], "budget_big");

        let id = result["runId"].as_str().unwrap().to_string();
        let (_, run) = send(&router, "GET", &format!("/api/v1/runs/{id}"), None).await;
        assert_eq!(run["status"], "completed");
        assert_eq!(run["tableName"], "budget_big");

        let (status, again) = send(
            &router,
            "POST",
            &format!("/api/v1/runs/{id}/execute"),
            Some(json!({"pipeline": budget_pipeline(), "connections": budget_connections()})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["ok"], false);
        assert_eq!(again["errorKind"], "StorageError");
    }

    #[tokio::test]
    async fn compile_errors_come_back_as_results() {
        let (_state, router, _tmp) = setup_test_app(None).await;
        let mut pipeline = budget_pipeline();
        pipeline["nodes"][1]["config"]["conditions"][0]["operator"] = json!("~=");

        let (status, result) = send(
            &router,
            "POST",
            "/api/v1/pipelines/run",
            Some(json!({"pipeline": pipeline, "connections": budget_connections()})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["ok"], false);
        assert_eq!(result["errorKind"], "UnsupportedOperator");
    }

    #[tokio::test]
    async fn encrypt_requires_a_key() {
        let (_state, router, _tmp) = setup_test_app(None).await;
        let (status, _) = send(
            &router,
            "POST",
            "/api/v1/secrets/encrypt",
            Some(json!({"plaintext": "hunter2"})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        let (state, router, _tmp) = setup_test_app(Some("daemon-test-passphrase")).await;
        let (status, body) = send(
            &router,
            "POST",
            "/api/v1/secrets/encrypt",
            Some(json!({"plaintext": "hunter2"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let ciphertext = body["ciphertext"].as_str().unwrap();
        assert_ne!(ciphertext, "hunter2");
        let secret = state.engine.codec().decrypt(ciphertext).unwrap();
        assert_eq!(secret.expose(), "hunter2");
    }

    #[tokio::test]
    async fn connection_tests_report_failures_in_the_body() {
        let (_state, router, _tmp) = setup_test_app(Some("daemon-test-passphrase")).await;
        let (status, body) = send(
            &router,
            "POST",
            "/api/v1/connections/test",
            Some(json!({"connection": {"id": "xlsx", "dialect": "excel"}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true}));

        let (_, body) = send(
            &router,
            "POST",
            "/api/v1/connections/test",
            Some(json!({"connection": {
                "id": "xlsx",
                "dialect": "excel",
                "encryptedPassword": "plain-text-password"
            }})),
        )
        .await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["errorKind"], "DecryptionError");
    }

    #[tokio::test]
    async fn reconcile_leaves_fresh_runs_alone() {
        let (state, router, _tmp) = setup_test_app(None).await;
        let run = state.store.create_run(NewRun::default()).await.unwrap();
        state
            .store
            .transition(run.id, RunTransition::start())
            .await
            .unwrap();

        let (status, body) = send(
            &router,
            "POST",
            &format!("/api/v1/runs/{}/reconcile", run.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["changed"], false);
        assert_eq!(body["run"]["status"], RunStatus::Processing.to_string());

        let (status, _) = send(
            &router,
            "POST",
            &format!("/api/v1/runs/{}/reconcile", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn openapi_lists_every_route() {
        let doc = docs::ApiDoc::openapi();
        for path in [
            "/healthz",
            "/api/v1/connections/test",
            "/api/v1/secrets/encrypt",
            "/api/v1/runs",
            "/api/v1/runs/{id}",
            "/api/v1/runs/{id}/execute",
            "/api/v1/runs/{id}/reconcile",
            "/api/v1/pipelines/run",
        ] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
