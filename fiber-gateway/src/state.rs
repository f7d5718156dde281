// fiber-gateway: Shared application state
// Process-wide singletons live here and are passed explicitly to handlers.

use std::sync::Arc;

use fiber_auth::{AuditLog, CredentialStore, TokenConfig};
use fiber_core::Role;
use fiber_store::{AggregateService, Db, Kv};
use tokio::sync::{Mutex, RwLock};

use crate::config::GatewayConfig;
use crate::limiter::RateLimiter;

/// Authenticated (or anonymous) request identity, set by the auth
/// middleware and read by handlers.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub username: String,
    pub role: Role,
    pub jti: Option<String>,
    pub exp: Option<i64>,
}

impl CurrentUser {
    pub fn anonymous() -> Self {
        Self {
            username: "anonymous".to_string(),
            role: Role::Anonymous,
            jti: None,
            exp: None,
        }
    }

    pub fn federation_probe() -> Self {
        Self {
            username: "federation_probe".to_string(),
            role: Role::Operator,
            jti: Some("static-federation-token".to_string()),
            exp: None,
        }
    }
}

/// Request trace id, echoed on every response.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

#[derive(Clone)]
pub struct AppState {
    pub kv: Kv,
    // Behind a lock so SIGHUP can rebuild the pool without dropping
    // in-flight requests (they hold clones of the old pool).
    pub db: Arc<RwLock<Db>>,
    pub tokens: TokenConfig,
    pub credentials: Arc<CredentialStore>,
    pub audit: Arc<Mutex<AuditLog>>,
    pub limiter: Arc<RateLimiter>,
    pub aggregates: Arc<AggregateService>,
    pub config: Arc<GatewayConfig>,
}

impl AppState {
    /// Snapshot of the current pool handle.
    pub async fn db(&self) -> Db {
        self.db.read().await.clone()
    }
}
