// fiber-store: Persistence facade
// Redis kv-store (queue, nonce, idempotency, dedup, caches, DLQ) and
// TimescaleDB repositories, plus the window-aware aggregate query layer.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod aggregate;
pub mod kv;
pub mod scripts;
pub mod tsdb;

pub use aggregate::{
    AggregateService, AggregatedRow, BreakerState, ClusterOverview, Dimension, QueryOutcome,
};
pub use kv::{Kv, RateDecision};
pub use tsdb::{Db, DbConfig, NodeRow};

use thiserror::Error;

/// Store result type
pub type StoreResult<T> = Result<T, StoreError>;

/// Store error types
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Kv-store error: {0}")]
    Kv(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("Query timeout after {0}ms")]
    Timeout(u64),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Unique-constraint violations get a dedicated path in the ETL.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Db(sqlx::Error::Database(db_err)) => {
                db_err.code().as_deref() == Some("23505")
            }
            _ => false,
        }
    }
}
