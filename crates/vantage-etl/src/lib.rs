//! Vantage ETL engine.
//!
//! Turns a declarative pipeline (sources, joins, filters, casts, arithmetic
//! and conditional rules) into pushed-down SQL or staged in-memory work,
//! runs it through per-dialect connectors and writes the result into a
//! warehouse table while tracking the run record.

pub mod connector;
pub mod error;
pub mod executor;
pub mod pipeline;
pub mod planner;
pub mod reconciler;
pub mod transform;

pub use connector::{
    ConnectionDescriptor, Connector, ConnectorConfig, ConnectorError, ConnectorRegistry,
    DefaultConnectors, Dialect, Session,
};
pub use error::{ErrorKind, EtlError};
pub use executor::{EngineConfig, EtlEngine, ExecutionFailure, ExecutionResult, ExecutionSuccess};
pub use pipeline::{PipelineDescriptor, PipelineSettings, SinkDescriptor};
pub use reconciler::{ReconcileOutcome, ReconcilerConfig, StaleRunReconciler, SweepWorker};
pub use transform::RowErrorPolicy;
