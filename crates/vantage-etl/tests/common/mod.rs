#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;
use vantage_db::{Database, MemoryWarehouse, NewRun, RowSet, RunStore, ScalarValue, Warehouse};
use vantage_etl::connector::WarehouseConnector;
use vantage_etl::{
    ConnectionDescriptor, Connector, ConnectorError, ConnectorRegistry, Dialect, EngineConfig,
    EtlEngine, PipelineDescriptor, Session,
};
use vantage_secrets::{Secret, SecretCodec};

#[derive(Debug, Default)]
pub struct Calls {
    pub connects: usize,
    pub disconnects: usize,
    pub queries: Vec<(String, Vec<ScalarValue>)>,
    pub passwords: Vec<Option<String>>,
}

/// A source database that returns one canned result for every query.
pub struct FakeConnector {
    result: RowSet,
    connect_error: Option<ConnectorError>,
    query_error: Option<ConnectorError>,
    pub calls: Arc<Mutex<Calls>>,
}

impl FakeConnector {
    pub fn returning(result: RowSet) -> Self {
        Self {
            result,
            connect_error: None,
            query_error: None,
            calls: Arc::default(),
        }
    }

    pub fn failing(err: ConnectorError) -> Self {
        Self {
            result: RowSet::new(Vec::new()),
            connect_error: Some(err),
            query_error: None,
            calls: Arc::default(),
        }
    }

    /// Connects fine, then fails every query.
    pub fn failing_query(err: ConnectorError) -> Self {
        Self {
            result: RowSet::new(Vec::new()),
            connect_error: None,
            query_error: Some(err),
            calls: Arc::default(),
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(
        &self,
        _descriptor: &ConnectionDescriptor,
        password: Option<&Secret>,
    ) -> Result<Box<dyn Session>, ConnectorError> {
        {
            let mut calls = self.calls.lock();
            calls.connects += 1;
            calls.passwords.push(password.map(|p| p.expose().to_owned()));
        }
        if let Some(err) = &self.connect_error {
            return Err(err.clone());
        }
        Ok(Box::new(FakeSession {
            result: self.result.clone(),
            error: self.query_error.clone(),
            calls: Arc::clone(&self.calls),
        }))
    }
}

struct FakeSession {
    result: RowSet,
    error: Option<ConnectorError>,
    calls: Arc<Mutex<Calls>>,
}

#[async_trait]
impl Session for FakeSession {
    async fn query(&mut self, sql: &str, params: &[ScalarValue]) -> Result<RowSet, ConnectorError> {
        self.calls
            .lock()
            .queries
            .push((sql.to_owned(), params.to_vec()));
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(self.result.clone()),
        }
    }

    async fn disconnect(self: Box<Self>) -> Result<(), ConnectorError> {
        self.calls.lock().disconnects += 1;
        Ok(())
    }
}

/// Routes spreadsheet connections to the warehouse and everything else to
/// the fake.
pub struct SpyRegistry {
    fake: Arc<FakeConnector>,
    excel: Arc<dyn Connector>,
}

impl ConnectorRegistry for SpyRegistry {
    fn connector(&self, dialect: Dialect) -> Option<Arc<dyn Connector>> {
        match dialect {
            Dialect::Excel => Some(Arc::clone(&self.excel)),
            _ => Some(self.fake.clone() as Arc<dyn Connector>),
        }
    }
}

pub struct Harness {
    pub engine: EtlEngine,
    pub db: Arc<Database>,
    pub warehouse: MemoryWarehouse,
    pub calls: Arc<Mutex<Calls>>,
}

impl Harness {
    pub async fn new(fake: FakeConnector) -> Self {
        Self::with(fake, EngineConfig::default(), SecretCodec::unconfigured()).await
    }

    pub async fn with(fake: FakeConnector, config: EngineConfig, codec: SecretCodec) -> Self {
        let db = Arc::new(
            Database::connect("sqlite::memory:")
                .await
                .expect("run store opens"),
        );
        let warehouse = MemoryWarehouse::new();
        let calls = Arc::clone(&fake.calls);
        let shared: Arc<dyn Warehouse> = Arc::new(warehouse.clone());
        let registry = SpyRegistry {
            fake: Arc::new(fake),
            excel: Arc::new(WarehouseConnector::new(Arc::clone(&shared))),
        };
        let engine = EtlEngine::new(db.clone(), shared, Arc::new(registry), codec, config);
        Self {
            engine,
            db,
            warehouse,
            calls,
        }
    }

    pub async fn new_run(&self) -> Uuid {
        self.db
            .create_run(NewRun {
                pipeline_id: Some("pipe-1".into()),
                table_name: Some("sales_filtered".into()),
            })
            .await
            .expect("run is created")
            .id
    }
}

pub fn connection(id: &str, dialect: &str) -> ConnectionDescriptor {
    serde_json::from_value(json!({
        "id": id,
        "dialect": dialect,
        "host": "db.internal",
        "database": "shop",
        "user": "etl"
    }))
    .expect("descriptor parses")
}

pub fn pipeline(value: Value) -> PipelineDescriptor {
    serde_json::from_value(value).expect("pipeline parses")
}

/// source sales -> filter amount > 100 -> cast amount to decimal -> sink.
pub fn filtered_sales() -> Value {
    json!({
        "nodes": [
            {"id": "src", "kind": "source", "config": {"connection": "pg", "table": "public.sales"}},
            {"id": "big", "kind": "filter", "config": {"conditions": [
                {"column": "amount", "operator": ">", "value": 100}
            ]}},
            {"id": "dec", "kind": "cast", "config": {"column": "amount", "targetType": "decimal"}},
            {"id": "out", "kind": "sink"}
        ],
        "edges": [
            {"from": "src", "to": "big"},
            {"from": "big", "to": "dec"},
            {"from": "dec", "to": "out"}
        ],
        "sink": {"tableName": "sales_filtered"}
    })
}

pub fn sales_rows() -> RowSet {
    RowSet::with_rows(
        vec!["id".into(), "amount".into()],
        vec![
            vec![ScalarValue::Integer(1), ScalarValue::Text("150.50".into())],
            vec![ScalarValue::Integer(2), ScalarValue::Text("220".into())],
            vec![ScalarValue::Integer(3), ScalarValue::Text("101".into())],
        ],
    )
}
