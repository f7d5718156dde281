// fiber-etl: Queue consumer library
// One batch per iteration: atomic pop, normalize, dedup, node cache, engine
// fan-out, bulk insert with conflict audit, status heartbeat.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod alerts;
pub mod analytics;
pub mod config;
pub mod metrics;
pub mod worker;

pub use alerts::{Alert, AlertConfig, AlertDispatcher, AlertEngine, AlertRule, Severity};
pub use analytics::{AnalyticsEngine, ComputedMetric};
pub use config::EtlConfig;
pub use metrics::{BatchMetrics, BatchSummary};
pub use worker::EtlWorker;

use thiserror::Error;

/// ETL result type
pub type EtlResult<T> = Result<T, EtlError>;

/// ETL error types
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("Store error: {0}")]
    Store(#[from] fiber_store::StoreError),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}
