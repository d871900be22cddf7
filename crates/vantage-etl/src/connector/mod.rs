//! Per-dialect connection lifecycle: connect, query, disconnect.
//!
//! Each adapter turns its driver's errors into [`ConnectorError`] with a
//! hint a user can act on. Raw driver text only surfaces for query errors,
//! where it names the offending column or relation.

mod firebird;
mod mysql;
mod postgres;
mod warehouse;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use vantage_db::{RowSet, ScalarValue, SqlDialect, Warehouse};
use vantage_secrets::{Secret, SecretCodec};

use crate::error::{ErrorKind, EtlError};

pub use firebird::FirebirdConnector;
pub use mysql::MySqlConnector;
pub use postgres::PostgresConnector;
pub use warehouse::WarehouseConnector;

/// Source kinds a connection can point at. Spreadsheet uploads live in the
/// warehouse and are read through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    Postgres,
    MySql,
    Firebird,
    Excel,
}

impl Dialect {
    /// SQL flavour of queries sent through this kind of connection.
    pub fn sql_dialect(&self) -> SqlDialect {
        match self {
            Dialect::Postgres | Dialect::Excel => SqlDialect::Postgres,
            Dialect::MySql => SqlDialect::MySql,
            Dialect::Firebird => SqlDialect::Firebird,
        }
    }

    /// Spreadsheet sources are always materialized and processed in memory.
    pub fn supports_push_down(&self) -> bool {
        !matches!(self, Dialect::Excel)
    }

    pub fn probe_sql(&self) -> Option<&'static str> {
        match self {
            Dialect::Postgres | Dialect::MySql => Some("SELECT 1"),
            Dialect::Firebird => Some("SELECT 1 FROM RDB$DATABASE"),
            Dialect::Excel => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Firebird => "firebird",
            Dialect::Excel => "excel",
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials and location of one external data source. The password is
/// only ever carried in its encrypted form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDescriptor {
    pub id: String,
    pub dialect: Dialect,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub encrypted_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
}

pub type ConnectionMap = HashMap<String, ConnectionDescriptor>;

#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub connect_timeout: Duration,
    pub postgres_port: u16,
    pub mysql_port: u16,
    pub firebird_port: u16,
}

impl ConnectorConfig {
    pub fn default_port(&self, dialect: Dialect) -> u16 {
        match dialect {
            Dialect::Postgres | Dialect::Excel => self.postgres_port,
            Dialect::MySql => self.mysql_port,
            Dialect::Firebird => self.firebird_port,
        }
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(8),
            postgres_port: 5432,
            mysql_port: 3306,
            firebird_port: 3050,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    #[error("{0}")]
    ConnectionTimeout(String),
    #[error("{0}")]
    AuthFailed(String),
    #[error("{0}")]
    HostUnreachable(String),
    #[error("{0}")]
    ConnectionRefused(String),
    #[error("{0}")]
    QueryError(String),
    #[error("{0}")]
    Unknown(String),
}

impl ConnectorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::ConnectionTimeout(_) => ErrorKind::ConnectionTimeout,
            ConnectorError::AuthFailed(_) => ErrorKind::AuthFailed,
            ConnectorError::HostUnreachable(_) => ErrorKind::HostUnreachable,
            ConnectorError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            ConnectorError::QueryError(_) => ErrorKind::QueryError,
            ConnectorError::Unknown(_) => ErrorKind::Unknown,
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        password: Option<&Secret>,
    ) -> Result<Box<dyn Session>, ConnectorError>;
}

#[async_trait]
pub trait Session: Send {
    async fn query(&mut self, sql: &str, params: &[ScalarValue]) -> Result<RowSet, ConnectorError>;

    async fn disconnect(self: Box<Self>) -> Result<(), ConnectorError>;
}

/// Resolves the adapter for a dialect.
pub trait ConnectorRegistry: Send + Sync {
    fn connector(&self, dialect: Dialect) -> Option<Arc<dyn Connector>>;
}

/// The production adapters.
pub struct DefaultConnectors {
    postgres: Arc<dyn Connector>,
    mysql: Arc<dyn Connector>,
    firebird: Arc<dyn Connector>,
    excel: Arc<dyn Connector>,
}

impl DefaultConnectors {
    pub fn new(config: ConnectorConfig, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            postgres: Arc::new(PostgresConnector::new(config.clone())),
            mysql: Arc::new(MySqlConnector::new(config.clone())),
            firebird: Arc::new(FirebirdConnector::new(config)),
            excel: Arc::new(WarehouseConnector::new(warehouse)),
        }
    }
}

impl ConnectorRegistry for DefaultConnectors {
    fn connector(&self, dialect: Dialect) -> Option<Arc<dyn Connector>> {
        let connector = match dialect {
            Dialect::Postgres => &self.postgres,
            Dialect::MySql => &self.mysql,
            Dialect::Firebird => &self.firebird,
            Dialect::Excel => &self.excel,
        };
        Some(Arc::clone(connector))
    }
}

/// Host, port and login of a connection attempt, used in hints.
#[derive(Debug, Clone)]
pub(crate) struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
}

impl Endpoint {
    pub fn new(descriptor: &ConnectionDescriptor, config: &ConnectorConfig) -> Self {
        Self {
            host: descriptor.host.clone(),
            port: descriptor
                .port
                .unwrap_or_else(|| config.default_port(descriptor.dialect)),
            user: descriptor.user.clone(),
            database: descriptor.database.clone(),
        }
    }

    pub fn auth_failed(&self) -> ConnectorError {
        ConnectorError::AuthFailed(format!(
            "authentication failed for user '{}' on {self}; check the connection's username and password",
            self.user
        ))
    }

    pub fn unreachable(&self) -> ConnectorError {
        ConnectorError::HostUnreachable(format!(
            "host {self} is unreachable; check the host name, firewall rules and VPN connection"
        ))
    }

    pub fn refused(&self) -> ConnectorError {
        ConnectorError::ConnectionRefused(format!(
            "connection to {self} was refused; check that the database server is running and accepts remote connections on port {}",
            self.port
        ))
    }

    pub fn timed_out(&self, after: Duration) -> ConnectorError {
        ConnectorError::ConnectionTimeout(format!(
            "connection to {self} timed out after {}s; the host may be behind a firewall or VPN",
            after.as_secs()
        ))
    }

    pub fn unknown_database(&self) -> ConnectorError {
        ConnectorError::QueryError(format!(
            "database '{}' does not exist on {self}",
            self.database
        ))
    }

    /// Maps socket errors. Unreachable networks only show up in the message.
    pub fn classify_io(&self, err: &std::io::Error) -> ConnectorError {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => self.refused(),
            std::io::ErrorKind::TimedOut => ConnectorError::ConnectionTimeout(format!(
                "connection to {self} timed out; the host may be behind a firewall or VPN"
            )),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::AddrNotAvailable => {
                self.unreachable()
            }
            _ => self
                .sniff(&err.to_string())
                .unwrap_or_else(|| ConnectorError::Unknown(format!("cannot reach {self}: {err}"))),
        }
    }

    /// Recognizes connectivity failures from their message text.
    pub fn sniff(&self, message: &str) -> Option<ConnectorError> {
        let lower = message.to_ascii_lowercase();
        let any = |needles: &[&str]| needles.iter().any(|needle| lower.contains(needle));

        if any(&["econnrefused", "connection refused"]) {
            Some(self.refused())
        } else if any(&[
            "enetunreach",
            "ehostunreach",
            "network is unreachable",
            "no route to host",
            "failed to lookup address",
            "name or service not known",
            "nodename nor servname",
        ]) {
            Some(self.unreachable())
        } else if any(&["timed out", "etimedout"]) {
            Some(ConnectorError::ConnectionTimeout(format!(
                "connection to {self} timed out; the host may be behind a firewall or VPN"
            )))
        } else if any(&["password authentication failed", "access denied", "login failed"]) {
            Some(self.auth_failed())
        } else {
            None
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens a session within the configured connect timeout.
pub async fn open_session(
    connector: &dyn Connector,
    descriptor: &ConnectionDescriptor,
    password: Option<&Secret>,
    config: &ConnectorConfig,
) -> Result<Box<dyn Session>, ConnectorError> {
    match tokio::time::timeout(
        config.connect_timeout,
        connector.connect(descriptor, password),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(Endpoint::new(descriptor, config).timed_out(config.connect_timeout)),
    }
}

/// Decrypts a descriptor's password immediately before use.
pub fn reveal_password(
    codec: &SecretCodec,
    descriptor: &ConnectionDescriptor,
) -> Result<Option<Secret>, EtlError> {
    match descriptor.encrypted_password.as_deref() {
        Some(blob) if !blob.trim().is_empty() => Ok(Some(codec.decrypt(blob)?)),
        _ => Ok(None),
    }
}

/// Everything needed to open a session. Held apart from the open sessions
/// so opening never borrows them.
#[derive(Clone, Copy)]
struct SessionOpener<'a> {
    registry: &'a dyn ConnectorRegistry,
    codec: &'a SecretCodec,
    config: &'a ConnectorConfig,
    connections: &'a ConnectionMap,
}

impl SessionOpener<'_> {
    async fn open(self, connection_id: &str) -> Result<Box<dyn Session>, EtlError> {
        let descriptor = self.connections.get(connection_id).ok_or_else(|| {
            EtlError::UnknownConnection(format!("connection '{connection_id}' is not defined"))
        })?;
        let connector = self.registry.connector(descriptor.dialect).ok_or_else(|| {
            EtlError::UnknownConnection(format!(
                "no connector is registered for {} connections",
                descriptor.dialect
            ))
        })?;

        let password = reveal_password(self.codec, descriptor)?;
        let session =
            open_session(connector.as_ref(), descriptor, password.as_ref(), self.config).await?;
        info!(connection = connection_id, dialect = %descriptor.dialect, "session opened");
        Ok(session)
    }
}

/// One session per connection id for the lifetime of a run.
pub(crate) struct SessionCache<'a> {
    opener: SessionOpener<'a>,
    sessions: HashMap<String, Box<dyn Session>>,
}

impl<'a> SessionCache<'a> {
    pub fn new(
        registry: &'a dyn ConnectorRegistry,
        codec: &'a SecretCodec,
        config: &'a ConnectorConfig,
        connections: &'a ConnectionMap,
    ) -> Self {
        Self {
            opener: SessionOpener {
                registry,
                codec,
                config,
                connections,
            },
            sessions: HashMap::new(),
        }
    }

    pub async fn query(
        &mut self,
        connection_id: &str,
        sql: &str,
        params: &[ScalarValue],
    ) -> Result<RowSet, EtlError> {
        if !self.sessions.contains_key(connection_id) {
            let session = self.opener.open(connection_id).await?;
            self.sessions.insert(connection_id.to_owned(), session);
        }
        let session = self
            .sessions
            .get_mut(connection_id)
            .ok_or_else(|| EtlError::UnknownConnection(connection_id.to_owned()))?;

        debug!(connection = connection_id, sql, params = params.len(), "running query");
        Ok(session.query(sql, params).await?)
    }

    /// Disconnects every open session. Disconnect errors are only logged.
    pub async fn close_all(self) {
        for (connection_id, session) in self.sessions {
            if let Err(err) = session.disconnect().await {
                warn!(connection = %connection_id, error = %err, "disconnect failed");
            }
        }
    }
}
