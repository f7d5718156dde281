// fiber-gateway: Probe heartbeats and the federation overview

use axum::extract::State;
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::routes::{require_auth, ApiResponse};
use crate::state::{AppState, CurrentUser};

const HEARTBEAT_TTL_SEC: u64 = 60;

#[derive(Debug, Deserialize)]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub active_target: String,
    pub timestamp: DateTime<Utc>,
}

/// Store a probe's federation heartbeat. TTL-bound, so a silent probe ages
/// out of the overview on its own.
pub async fn probe_heartbeat(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Json(payload): Json<HeartbeatPayload>,
) -> ApiResult<Json<ApiResponse>> {
    require_auth(&user)?;
    if payload.node_id.is_empty() || payload.node_id.len() > 50 {
        return Err(ApiError::Unprocessable(
            "node_id must be 1-50 characters".to_string(),
        ));
    }

    let stored = json!({
        "node_id": payload.node_id,
        "active_target": payload.active_target,
        "timestamp": payload.timestamp.to_rfc3339(),
        "received_at": Utc::now().to_rfc3339(),
    });
    state
        .kv
        .set_probe_heartbeat(&payload.node_id, &stored.to_string(), HEARTBEAT_TTL_SEC)
        .await?;

    Ok(Json(ApiResponse::ok(json!({"node_id": payload.node_id}))))
}

/// Aggregated view of live probe heartbeats.
pub async fn federation_status(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<ApiResponse>> {
    require_auth(&user)?;

    let raw = state.kv.probe_heartbeats().await?;
    let probes: Vec<Value> = raw
        .iter()
        .filter_map(|entry| serde_json::from_str(entry).ok())
        .collect();

    Ok(Json(ApiResponse::ok(json!({
        "count": probes.len(),
        "probes": probes,
    }))))
}
