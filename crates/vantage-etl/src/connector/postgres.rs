use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::Connection;
use tracing::debug;
use vantage_db::warehouse::format_pg_error;
use vantage_db::{pg, RowSet, ScalarValue};
use vantage_secrets::Secret;

use super::{ConnectionDescriptor, Connector, ConnectorConfig, ConnectorError, Endpoint, Session};

pub struct PostgresConnector {
    config: ConnectorConfig,
}

impl PostgresConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        password: Option<&Secret>,
    ) -> Result<Box<dyn Session>, ConnectorError> {
        let endpoint = Endpoint::new(descriptor, &self.config);
        let mut options = PgConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&endpoint.user)
            .database(&endpoint.database);
        if let Some(password) = password {
            options = options.password(password.expose());
        }

        debug!(endpoint = %endpoint, "connecting to postgres");
        let conn = PgConnection::connect_with(&options)
            .await
            .map_err(|err| classify_connect(&endpoint, &err))?;
        Ok(Box::new(PostgresSession { conn, endpoint }))
    }
}

struct PostgresSession {
    conn: PgConnection,
    endpoint: Endpoint,
}

#[async_trait]
impl Session for PostgresSession {
    async fn query(&mut self, sql: &str, params: &[ScalarValue]) -> Result<RowSet, ConnectorError> {
        let rows = pg::prepare(sql, params)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|err| classify_query(&self.endpoint, &err))?;
        pg::decode_rows(&rows).map_err(|err| ConnectorError::QueryError(err.to_string()))
    }

    async fn disconnect(self: Box<Self>) -> Result<(), ConnectorError> {
        self.conn
            .close()
            .await
            .map_err(|err| ConnectorError::Unknown(format!("closing {}: {err}", self.endpoint)))
    }
}

fn classify_connect(endpoint: &Endpoint, err: &sqlx::Error) -> ConnectorError {
    match err {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("28P01") | Some("28000") => endpoint.auth_failed(),
            Some("3D000") => endpoint.unknown_database(),
            _ => ConnectorError::QueryError(format_pg_error(err)),
        },
        sqlx::Error::Io(io) => endpoint.classify_io(io),
        other => endpoint
            .sniff(&other.to_string())
            .unwrap_or_else(|| ConnectorError::Unknown(format!("connecting to {endpoint}: {other}"))),
    }
}

fn classify_query(endpoint: &Endpoint, err: &sqlx::Error) -> ConnectorError {
    match err {
        sqlx::Error::Io(io) => endpoint.classify_io(io),
        other => ConnectorError::QueryError(format_pg_error(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn endpoint() -> Endpoint {
        Endpoint {
            host: "pg.internal".into(),
            port: 5432,
            user: "report".into(),
            database: "sales".into(),
        }
    }

    #[test]
    fn io_failures_while_connecting_are_classified() {
        let err = sqlx::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(classify_connect(&endpoint(), &err).kind(), ErrorKind::ConnectionRefused);
    }

    #[test]
    fn protocol_errors_fall_back_to_unknown() {
        let err = sqlx::Error::Protocol("unexpected message".into());
        let classified = classify_connect(&endpoint(), &err);
        assert_eq!(classified.kind(), ErrorKind::Unknown);
        assert!(classified.to_string().contains("pg.internal:5432"));
    }
}
