//! Error taxonomy surfaced in execution results and run records.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vantage_db::{SqlError, WarehouseError};
use vantage_secrets::SecretError;

use crate::connector::ConnectorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidIdentifier,
    UnsupportedOperator,
    CyclicPipeline,
    UnresolvedReference,
    CastError,
    ConnectionTimeout,
    AuthFailed,
    HostUnreachable,
    ConnectionRefused,
    QueryError,
    EncryptionKeyMissing,
    DecryptionError,
    StaleTimeout,
    InvalidPipeline,
    IncompatibleTypes,
    UnknownConnection,
    WriteError,
    TargetLocked,
    StorageError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidIdentifier => "InvalidIdentifier",
            ErrorKind::UnsupportedOperator => "UnsupportedOperator",
            ErrorKind::CyclicPipeline => "CyclicPipeline",
            ErrorKind::UnresolvedReference => "UnresolvedReference",
            ErrorKind::CastError => "CastError",
            ErrorKind::ConnectionTimeout => "ConnectionTimeout",
            ErrorKind::AuthFailed => "AuthFailed",
            ErrorKind::HostUnreachable => "HostUnreachable",
            ErrorKind::ConnectionRefused => "ConnectionRefused",
            ErrorKind::QueryError => "QueryError",
            ErrorKind::EncryptionKeyMissing => "EncryptionKeyMissing",
            ErrorKind::DecryptionError => "DecryptionError",
            ErrorKind::StaleTimeout => "StaleTimeout",
            ErrorKind::InvalidPipeline => "InvalidPipeline",
            ErrorKind::IncompatibleTypes => "IncompatibleTypes",
            ErrorKind::UnknownConnection => "UnknownConnection",
            ErrorKind::WriteError => "WriteError",
            ErrorKind::TargetLocked => "TargetLocked",
            ErrorKind::StorageError => "StorageError",
            ErrorKind::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EtlError {
    #[error("{0}")]
    InvalidIdentifier(String),
    #[error("{0}")]
    UnsupportedOperator(String),
    #[error("{0}")]
    CyclicPipeline(String),
    #[error("{0}")]
    UnresolvedReference(String),
    #[error("{0}")]
    CastError(String),
    #[error("{0}")]
    InvalidPipeline(String),
    #[error("{0}")]
    IncompatibleTypes(String),
    #[error("{0}")]
    UnknownConnection(String),
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("{0}")]
    EncryptionKeyMissing(String),
    #[error("{0}")]
    DecryptionError(String),
    #[error("{0}")]
    StaleTimeout(String),
    #[error("{0}")]
    WriteError(String),
    #[error("{0}")]
    TargetLocked(String),
    #[error("{0}")]
    Storage(String),
}

impl EtlError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EtlError::InvalidIdentifier(_) => ErrorKind::InvalidIdentifier,
            EtlError::UnsupportedOperator(_) => ErrorKind::UnsupportedOperator,
            EtlError::CyclicPipeline(_) => ErrorKind::CyclicPipeline,
            EtlError::UnresolvedReference(_) => ErrorKind::UnresolvedReference,
            EtlError::CastError(_) => ErrorKind::CastError,
            EtlError::InvalidPipeline(_) => ErrorKind::InvalidPipeline,
            EtlError::IncompatibleTypes(_) => ErrorKind::IncompatibleTypes,
            EtlError::UnknownConnection(_) => ErrorKind::UnknownConnection,
            EtlError::Connector(err) => err.kind(),
            EtlError::EncryptionKeyMissing(_) => ErrorKind::EncryptionKeyMissing,
            EtlError::DecryptionError(_) => ErrorKind::DecryptionError,
            EtlError::StaleTimeout(_) => ErrorKind::StaleTimeout,
            EtlError::WriteError(_) => ErrorKind::WriteError,
            EtlError::TargetLocked(_) => ErrorKind::TargetLocked,
            EtlError::Storage(_) => ErrorKind::StorageError,
        }
    }

    /// Whether the error is raised by validation, before any connector opens.
    pub fn is_compile_time(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::InvalidIdentifier
                | ErrorKind::UnsupportedOperator
                | ErrorKind::CyclicPipeline
                | ErrorKind::UnresolvedReference
                | ErrorKind::InvalidPipeline
                | ErrorKind::IncompatibleTypes
                | ErrorKind::UnknownConnection
        )
    }
}

impl From<SqlError> for EtlError {
    fn from(err: SqlError) -> Self {
        let message = err.to_string();
        match err {
            SqlError::InvalidIdentifier { .. } => EtlError::InvalidIdentifier(message),
            SqlError::UnsupportedOperator(_) | SqlError::UnsupportedCast { .. } => {
                EtlError::UnsupportedOperator(message)
            }
            SqlError::InvalidOperand(_) => EtlError::InvalidPipeline(message),
        }
    }
}

impl From<SecretError> for EtlError {
    fn from(err: SecretError) -> Self {
        let message = err.to_string();
        match err {
            SecretError::EncryptionKeyMissing => EtlError::EncryptionKeyMissing(message),
            SecretError::DecryptionError(_) | SecretError::EncryptionError(_) => {
                EtlError::DecryptionError(message)
            }
        }
    }
}

impl From<WarehouseError> for EtlError {
    fn from(err: WarehouseError) -> Self {
        match err {
            WarehouseError::InvalidIdentifier(sql) => sql.into(),
            WarehouseError::Locked(_) => EtlError::TargetLocked(err.to_string()),
            WarehouseError::Query(_) => {
                EtlError::Connector(ConnectorError::QueryError(err.to_string()))
            }
            WarehouseError::Write(_) => EtlError::WriteError(err.to_string()),
        }
    }
}

impl From<anyhow::Error> for EtlError {
    fn from(err: anyhow::Error) -> Self {
        EtlError::Storage(format!("run store error: {err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_serialize_in_pascal_case() {
        let json = serde_json::to_string(&ErrorKind::UnresolvedReference).unwrap();
        assert_eq!(json, "\"UnresolvedReference\"");
        assert_eq!(ErrorKind::StorageError.to_string(), "StorageError");
    }

    #[test]
    fn sql_errors_keep_their_kind() {
        let err: EtlError = SqlError::UnsupportedOperator("~".into()).into();
        assert_eq!(err.kind(), ErrorKind::UnsupportedOperator);
        assert!(err.is_compile_time());

        let err: EtlError = SecretError::EncryptionKeyMissing.into();
        assert_eq!(err.kind(), ErrorKind::EncryptionKeyMissing);
        assert!(!err.is_compile_time());
    }

    #[test]
    fn warehouse_lock_maps_to_target_locked() {
        let err: EtlError = WarehouseError::Locked("analytics.totals".into()).into();
        assert_eq!(err.kind(), ErrorKind::TargetLocked);
        assert!(err.to_string().contains("analytics.totals"));
    }
}
