// fiber-auth: Authentication and audit
// Dual-token JWT (access/refresh) with rotation, Redis-backed jti revocation,
// env-sourced credential store, append-only hash-chained audit trail.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod audit;
pub mod credentials;
pub mod revocation;
pub mod tokens;

pub use audit::{AuditEntry, AuditLog, AuditStats};
pub use credentials::CredentialStore;
pub use tokens::{Claims, TokenConfig, TokenPair, TokenType};

use thiserror::Error;

/// Auth result type
pub type AuthResult<T> = Result<T, AuthError>;

/// Auth error types
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Token revoked")]
    TokenRevoked,

    #[error("Wrong token type: expected {expected}, got {got}")]
    WrongTokenType { expected: &'static str, got: String },

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Revocation store unavailable: {0}")]
    RevocationUnavailable(String),

    #[error("Audit log error: {0}")]
    Audit(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
