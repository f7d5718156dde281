// fiber-gateway: Route table and shared response envelope

pub mod audit;
pub mod auth;
pub mod federation;
pub mod ingest;
pub mod metrics;
pub mod nodes;
pub mod status;

use axum::routing::{delete, get, post};
use axum::Router;
use fiber_core::Role;
use serde::Serialize;
use serde_json::Value;

use crate::error::ApiError;
use crate::state::{AppState, CurrentUser};

/// Uniform response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl ApiResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            status: "ok".to_string(),
            message: None,
            data: Some(data),
            meta: None,
        }
    }

    pub fn with_meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    pub fn accepted(message: impl Into<String>) -> Self {
        Self {
            status: "accepted".to_string(),
            message: Some(message.into()),
            data: None,
            meta: None,
        }
    }

    pub fn status_only(status: impl Into<String>, data: Value) -> Self {
        Self {
            status: status.into(),
            message: None,
            data: Some(data),
            meta: None,
        }
    }
}

/// Handlers call this before touching protected resources.
pub fn require_auth(user: &CurrentUser) -> Result<(), ApiError> {
    if user.role == Role::Anonymous {
        return Err(ApiError::Unauthorized(
            "Authentication required".to_string(),
        ));
    }
    Ok(())
}

pub fn require_permission(user: &CurrentUser, permission: &str) -> Result<(), ApiError> {
    require_auth(user)?;
    if !user.role.has_permission(permission) {
        return Err(ApiError::Forbidden("Insufficient permissions".to_string()));
    }
    Ok(())
}

/// Everything under `/api`.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status::get_status))
        .route("/ingest", post(ingest::ingest_batch))
        .route("/push", post(ingest::push_single))
        .route("/metrics", get(metrics::get_metrics))
        .route("/metrics/aggregated", get(metrics::get_aggregated))
        .route("/metrics/cluster", get(metrics::get_cluster))
        .route("/nodes", get(nodes::list_nodes).post(nodes::create_node))
        .route("/nodes/{node_id}", delete(nodes::delete_node))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/me", get(auth::me))
        .route("/probe/heartbeat", post(federation::probe_heartbeat))
        .route("/federation/status", get(federation::federation_status))
        .route("/audit/verify", get(audit::verify_chain))
        .route("/audit/stats", get(audit::audit_stats))
}
