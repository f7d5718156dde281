// fiber-gateway: Audit trail admin surface

use std::path::PathBuf;

use axum::extract::State;
use axum::{Extension, Json};
use fiber_auth::AuditLog;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::routes::{require_permission, ApiResponse};
use crate::state::{AppState, CurrentUser};

/// Replay the hash chain and report the first broken line, if any.
pub async fn verify_chain(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<ApiResponse>> {
    require_permission(&user, "admin:audit")?;

    let path = PathBuf::from(&state.config.audit_log_path);
    let (valid, break_at_line) = tokio::task::spawn_blocking(move || AuditLog::verify_chain(&path))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(ApiResponse::ok(json!({
        "valid": valid,
        "break_at_line": break_at_line,
    }))))
}

pub async fn audit_stats(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<ApiResponse>> {
    require_permission(&user, "admin:audit")?;

    let path = PathBuf::from(&state.config.audit_log_path);
    let stats = tokio::task::spawn_blocking(move || AuditLog::stats(&path))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok(Json(ApiResponse::ok(serde_json::to_value(stats).map_err(
        |e| ApiError::Internal(e.to_string()),
    )?)))
}
