use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use sqlx::mysql::{MySqlArguments, MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlRow};
use sqlx::query::Query;
use sqlx::{Column, Connection, MySql, Row, TypeInfo};
use tracing::debug;
use vantage_db::{RowSet, ScalarValue};
use vantage_secrets::Secret;

use super::{ConnectionDescriptor, Connector, ConnectorConfig, ConnectorError, Endpoint, Session};

const ER_ACCESS_DENIED: u16 = 1045;
const ER_DBACCESS_DENIED: u16 = 1044;
const ER_BAD_DB: u16 = 1049;

pub struct MySqlConnector {
    config: ConnectorConfig,
}

impl MySqlConnector {
    pub fn new(config: ConnectorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for MySqlConnector {
    async fn connect(
        &self,
        descriptor: &ConnectionDescriptor,
        password: Option<&Secret>,
    ) -> Result<Box<dyn Session>, ConnectorError> {
        let endpoint = Endpoint::new(descriptor, &self.config);
        let mut options = MySqlConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&endpoint.user)
            .database(&endpoint.database);
        if let Some(password) = password {
            options = options.password(password.expose());
        }

        debug!(endpoint = %endpoint, "connecting to mysql");
        let conn = MySqlConnection::connect_with(&options)
            .await
            .map_err(|err| classify_connect(&endpoint, &err))?;
        Ok(Box::new(MySqlSession { conn, endpoint }))
    }
}

struct MySqlSession {
    conn: MySqlConnection,
    endpoint: Endpoint,
}

#[async_trait]
impl Session for MySqlSession {
    async fn query(&mut self, sql: &str, params: &[ScalarValue]) -> Result<RowSet, ConnectorError> {
        let rows = params
            .iter()
            .fold(sqlx::query(sql), bind_value)
            .fetch_all(&mut self.conn)
            .await
            .map_err(|err| match &err {
                sqlx::Error::Io(io) => self.endpoint.classify_io(io),
                other => ConnectorError::QueryError(format_error(other)),
            })?;
        decode_rows(&rows).map_err(|err| ConnectorError::QueryError(err.to_string()))
    }

    async fn disconnect(self: Box<Self>) -> Result<(), ConnectorError> {
        self.conn
            .close()
            .await
            .map_err(|err| ConnectorError::Unknown(format!("closing {}: {err}", self.endpoint)))
    }
}

fn bind_value<'q>(
    query: Query<'q, MySql, MySqlArguments>,
    value: &ScalarValue,
) -> Query<'q, MySql, MySqlArguments> {
    match value {
        ScalarValue::Null => query.bind(None::<String>),
        ScalarValue::Boolean(v) => query.bind(*v),
        ScalarValue::Integer(v) => query.bind(*v),
        ScalarValue::Float(v) => query.bind(*v),
        ScalarValue::Decimal(v) => query.bind(*v),
        ScalarValue::Text(v) => query.bind(v.clone()),
        ScalarValue::Date(v) => query.bind(*v),
        ScalarValue::Timestamp(v) => query.bind(*v),
    }
}

fn mysql_error_number(err: &sqlx::Error) -> Option<u16> {
    match err {
        sqlx::Error::Database(db) => db
            .try_downcast_ref::<MySqlDatabaseError>()
            .map(MySqlDatabaseError::number),
        _ => None,
    }
}

fn format_error(err: &sqlx::Error) -> String {
    match (err, mysql_error_number(err)) {
        (sqlx::Error::Database(db), Some(number)) => format!("{} (error {number})", db.message()),
        (other, _) => other.to_string(),
    }
}

fn classify_connect(endpoint: &Endpoint, err: &sqlx::Error) -> ConnectorError {
    match mysql_error_number(err) {
        Some(ER_ACCESS_DENIED) | Some(ER_DBACCESS_DENIED) => return endpoint.auth_failed(),
        Some(ER_BAD_DB) => return endpoint.unknown_database(),
        _ => {}
    }
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("28000") => endpoint.auth_failed(),
        sqlx::Error::Database(_) => ConnectorError::QueryError(format_error(err)),
        sqlx::Error::Io(io) => endpoint.classify_io(io),
        other => endpoint
            .sniff(&other.to_string())
            .unwrap_or_else(|| ConnectorError::Unknown(format!("connecting to {endpoint}: {other}"))),
    }
}

fn decode_rows(rows: &[MySqlRow]) -> Result<RowSet, sqlx::Error> {
    let Some(first) = rows.first() else {
        return Ok(RowSet::default());
    };
    let columns = first
        .columns()
        .iter()
        .map(|column| column.name().to_owned())
        .collect();

    let mut out = RowSet::new(columns);
    for row in rows {
        let values = (0..row.len())
            .map(|index| decode_value(row, index))
            .collect::<Result<Vec<_>, _>>()?;
        out.push(values);
    }
    Ok(out)
}

fn decode_value(row: &MySqlRow, index: usize) -> Result<ScalarValue, sqlx::Error> {
    let type_name = row.column(index).type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "NULL" => None,
        "BOOLEAN" => row.try_get::<Option<bool>, _>(index)?.map(ScalarValue::Boolean),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" | "YEAR" => row
            .try_get::<Option<i64>, _>(index)?
            .map(ScalarValue::Integer),
        name if name.ends_with(" UNSIGNED") => row
            .try_get::<Option<u64>, _>(index)?
            .map(|v| match i64::try_from(v) {
                Ok(v) => ScalarValue::Integer(v),
                Err(_) => ScalarValue::Decimal(Decimal::from(v)),
            }),
        "FLOAT" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|v| ScalarValue::Float(f64::from(v))),
        "DOUBLE" => row.try_get::<Option<f64>, _>(index)?.map(ScalarValue::Float),
        "DECIMAL" => row
            .try_get::<Option<Decimal>, _>(index)?
            .map(ScalarValue::Decimal),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)?
            .map(ScalarValue::Date),
        "DATETIME" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(ScalarValue::Timestamp),
        "TIMESTAMP" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|v| ScalarValue::Timestamp(v.naive_utc())),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" | "BIT" => row
            .try_get::<Option<Vec<u8>>, _>(index)?
            .map(|v| ScalarValue::Text(String::from_utf8_lossy(&v).into_owned())),
        _ => row
            .try_get::<Option<String>, _>(index)?
            .map(ScalarValue::Text),
    };
    Ok(value.unwrap_or(ScalarValue::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn connection_resets_surface_as_refused_or_unknown() {
        let endpoint = Endpoint {
            host: "erp.internal".into(),
            port: 3306,
            user: "etl".into(),
            database: "erp".into(),
        };
        let refused = sqlx::Error::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert_eq!(classify_connect(&endpoint, &refused).kind(), ErrorKind::ConnectionRefused);

        let closed = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "early eof",
        ));
        assert_eq!(classify_connect(&endpoint, &closed).kind(), ErrorKind::Unknown);
    }
}
