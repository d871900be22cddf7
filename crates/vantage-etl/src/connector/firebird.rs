//! Firebird over the pure-Rust wire client. The client is blocking, so every
//! call runs on tokio's blocking pool with the connection moved in and out.

use async_trait::async_trait;
use rsfbclient::{Connection, FbError, Queryable, Row, SqlType};
use rsfbclient_core::FirebirdClient;
use tracing::debug;
use vantage_db::{RowSet, ScalarValue};
use vantage_secrets::Secret;

use super::{ConnectionDescriptor, Connector, ConnectorConfig, ConnectorError, Endpoint, Session};

trait FbHandle: Send {
    fn run_query(&mut self, sql: &str, params: Vec<SqlType>) -> Result<Vec<Row>, FbError>;

    fn close(self: Box<Self>) -> Result<(), FbError>;
}

impl<C> FbHandle for Connection<C>
where
    C: FirebirdClient,
    Connection<C>: Send,
{
    fn run_query(&mut self, sql: &str, params: Vec<SqlType>) -> Result<Vec<Row>, FbError> {
        self.query(sql, params)
    }

    fn close(self: Box<Self>) -> Result<(), FbError> {
        (*self).close()
    }
}

pub struct FirebirdConnector {
    config: ConnectorConfig,
}

impl FirebirdConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for FirebirdConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        password: Option<&Secret>,
    ) -> Result<Box<dyn Session>, ConnectorError> {
        let endpoint = Endpoint::new(descriptor, &self.config);
        let password = password.map(|p| p.expose().to_owned()).unwrap_or_default();

        debug!(endpoint = %endpoint, "connecting to firebird");
        let target = endpoint.clone();
        let connected = tokio::task::spawn_blocking(move || {
            let mut builder = rsfbclient::builder_pure_rust();
            builder
                .host(target.host.as_str())
                .port(target.port)
                .db_name(target.database.as_str())
                .user(target.user.as_str())
                .pass(password.as_str());
            builder
                .connect()
                .map(|conn| Box::new(conn) as Box<dyn FbHandle>)
        })
        .await
        .map_err(|err| ConnectorError::Unknown(format!("firebird connect task failed: {err}")))?;

        let handle = connected.map_err(|err| classify(&endpoint, &err))?;
        Ok(Box::new(FirebirdSession {
            handle: Some(handle),
            endpoint,
        }))
    }
}

struct FirebirdSession {
    handle: Option<Box<dyn FbHandle>>,
    endpoint: Endpoint,
}

#[async_trait]
impl Session for FirebirdSession {
    async fn query(&mut self, sql: &str, params: &[ScalarValue]) -> Result<RowSet, ConnectorError> {
        let mut handle = self.handle.take().ok_or_else(|| {
            ConnectorError::Unknown(format!("session to {} was lost", self.endpoint))
        })?;
        let sql = sql.to_owned();
        let params = params.iter().map(to_sql_type).collect::<Vec<_>>();

        let (handle, result) = tokio::task::spawn_blocking(move || {
            let result = handle.run_query(&sql, params);
            (handle, result)
        })
        .await
        .map_err(|err| ConnectorError::Unknown(format!("firebird query task failed: {err}")))?;
        self.handle = Some(handle);

        let rows = result.map_err(|err| classify(&self.endpoint, &err))?;
        Ok(decode_rows(rows))
    }

    async fn disconnect(mut self: Box<Self>) -> Result<(), ConnectorError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let endpoint = self.endpoint.clone();
        tokio::task::spawn_blocking(move || handle.close())
            .await
            .map_err(|err| ConnectorError::Unknown(format!("firebird close task failed: {err}")))?
            .map_err(|err| ConnectorError::Unknown(format!("closing {endpoint}: {err}")))
    }
}

fn to_sql_type(value: &ScalarValue) -> SqlType {
    match value {
        ScalarValue::Null => SqlType::Null,
        ScalarValue::Boolean(v) => SqlType::Boolean(*v),
        ScalarValue::Integer(v) => SqlType::Integer(*v),
        ScalarValue::Float(v) => SqlType::Floating(*v),
        ScalarValue::Timestamp(v) => SqlType::Timestamp(*v),
        // Sent as text and converted by the CAST around the placeholder.
        ScalarValue::Decimal(_) | ScalarValue::Text(_) | ScalarValue::Date(_) => {
            SqlType::Text(value.to_string())
        }
    }
}

fn to_scalar(value: SqlType) -> ScalarValue {
    match value {
        SqlType::Null => ScalarValue::Null,
        SqlType::Boolean(v) => ScalarValue::Boolean(v),
        SqlType::Integer(v) => ScalarValue::Integer(v),
        SqlType::Floating(v) => ScalarValue::Float(v),
        SqlType::Text(v) => ScalarValue::Text(v),
        // DATE columns arrive as midnight timestamps.
        SqlType::Timestamp(v) => ScalarValue::Timestamp(v),
        SqlType::Binary(v) => ScalarValue::Text(String::from_utf8_lossy(&v).into_owned()),
    }
}

fn decode_rows(rows: Vec<Row>) -> RowSet {
    let columns = rows
        .first()
        .map(|row| row.cols.iter().map(|col| col.name.trim().to_owned()).collect())
        .unwrap_or_default();
    let mut out = RowSet::new(columns);
    for row in rows {
        out.push(row.cols.into_iter().map(|col| to_scalar(col.value)).collect());
    }
    out
}

fn vpn_hint(err: ConnectorError, endpoint: &Endpoint) -> ConnectorError {
    let hint = format!(
        ". Firebird servers are often reachable only through the office VPN; confirm the VPN is up and port {} is open",
        endpoint.port
    );
    match err {
        ConnectorError::HostUnreachable(message) => {
            ConnectorError::HostUnreachable(message + &hint)
        }
        ConnectorError::ConnectionRefused(message) => {
            ConnectorError::ConnectionRefused(message + &hint)
        }
        ConnectorError::ConnectionTimeout(message) => {
            ConnectorError::ConnectionTimeout(message + &hint)
        }
        other => other,
    }
}

fn classify(endpoint: &Endpoint, err: &FbError) -> ConnectorError {
    let message = err.to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("user name and password") {
        return endpoint.auth_failed();
    }
    if lower.contains("i/o error") && lower.contains("open") {
        return endpoint.unknown_database();
    }
    if let Some(classified) = endpoint.sniff(&message) {
        return vpn_hint(classified, endpoint);
    }
    match err {
        FbError::Sql { .. } => ConnectorError::QueryError(message),
        _ => ConnectorError::Unknown(format!("firebird at {endpoint}: {message}")),
    }
}
