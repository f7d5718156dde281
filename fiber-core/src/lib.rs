// fiber-core: Shared domain types and primitives
// Metric/Batch/Node models, normalization, canonical signing material, RBAC tables

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod canonical;
pub mod normalize;
pub mod rbac;
pub mod secrets;
pub mod trace;
pub mod types;

pub use canonical::{canonical_json, sha256_hex, sign_message, signing_message, verify_signature};
pub use normalize::{normalize_metric, validate_normalized, NormalizedMetric};
pub use rbac::Role;
pub use types::{Batch, IngestMeta, Metric, Node, NodeStatus, SCHEMA_VERSION};

use thiserror::Error;

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Shared domain errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Signing error: {0}")]
    Signing(String),
}
