// fiber-probe: Probe agent library
// Durable disk FIFO, priority-based failover with stickiness, and the
// HMAC-signing federation transport client.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod buffer;
pub mod client;
pub mod collector;
pub mod config;
pub mod failover;
pub mod heartbeat;
pub mod monitor;

pub use buffer::{BufferConfig, BufferedItem, DurableBuffer};
pub use client::{FederationClient, RetryPolicy, TargetConfig};
pub use config::ProbeConfig;
pub use failover::{FailoverConfig, FailoverController};
pub use monitor::StatsTracker;

use thiserror::Error;

/// Probe result type
pub type ProbeResult<T> = Result<T, ProbeError>;

/// Probe error types
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Buffer error: {0}")]
    Buffer(#[from] sqlx::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Circuit breaker is open for target {0}")]
    CircuitOpen(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
