// fiber-gateway: Node lifecycle management

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{Extension, Json};
use fiber_core::{Node, NodeStatus};
use fiber_store::tsdb;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::routes::{require_permission, ApiResponse};
use crate::state::{AppState, CurrentUser};

async fn audit(
    state: &AppState,
    user: &CurrentUser,
    action: &str,
    resource: &str,
    details: serde_json::Value,
) {
    let mut log = state.audit.lock().await;
    if let Err(e) = log.append(&user.username, user.role.as_str(), action, resource, details) {
        tracing::error!(error = %e, "audit write failed");
    }
}

/// GET /api/nodes — all non-deleted nodes with their latest metric time.
pub async fn list_nodes(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<ApiResponse>> {
    require_permission(&user, "monitor:nodes")?;

    let db = state.db().await;
    let nodes = tsdb::list_nodes(&db).await?;
    Ok(Json(ApiResponse::ok(
        serde_json::to_value(nodes).map_err(|e| ApiError::Internal(e.to_string()))?,
    )))
}

/// POST /api/nodes — register a metadata shell, lifecycle starts at
/// `registered`.
pub async fn create_node(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(node): Json<Node>,
) -> ApiResult<(StatusCode, Json<ApiResponse>)> {
    require_permission(&user, "write:node:create")?;

    node.validate()
        .map_err(|e| ApiError::Unprocessable(e.to_string()))?;
    if node.status != NodeStatus::Registered {
        return Err(ApiError::Validation {
            code: "INVALID_STATUS",
            message: "New nodes must start as 'registered'".to_string(),
            batch_id: None,
        });
    }

    let db = state.db().await;
    tsdb::create_node(&db, &node).await?;

    audit(
        &state,
        &user,
        "CREATE_NODE",
        &node.node_id,
        json!({"country": node.country, "region": node.region}),
    )
    .await;

    tracing::info!(node_id = %node.node_id, "registered new node");
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse {
            status: "created".to_string(),
            message: Some("Node registered successfully".to_string()),
            data: None,
            meta: None,
        }),
    ))
}

/// DELETE /api/nodes/{node_id} — soft delete; metric rows remain.
pub async fn delete_node(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<ApiResponse>> {
    require_permission(&user, "write:node:delete")?;

    let db = state.db().await;
    tsdb::soft_delete_node(&db, &node_id).await?;

    audit(&state, &user, "DELETE_NODE", &node_id, json!({})).await;

    tracing::info!(node_id = %node_id, "soft deleted node");
    Ok(Json(ApiResponse {
        status: "ok".to_string(),
        message: Some("Node deleted".to_string()),
        data: None,
        meta: None,
    }))
}
