// fiber-gateway: Liveness and deep status

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::routes::ApiResponse;
use crate::state::AppState;

/// Shallow liveness for orchestrators.
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub async fn root() -> Json<Value> {
    Json(json!({"message": "FiberStack API v0.9.0"}))
}

/// Deep status: kv-store reachability plus the ETL heartbeat state machine
/// (healthy <= 30s lag, degraded <= 60s, down beyond that).
pub async fn get_status(State(state): State<AppState>) -> Json<ApiResponse> {
    let mut status_data = json!({
        "api": "ok",
        "redis": "unknown",
        "etl": {"state": "unknown", "lag_s": null},
    });

    if let Err(e) = state.kv.ping().await {
        tracing::error!(error = %e, "kv-store health check failed");
        status_data["redis"] = json!("error");
        return Json(ApiResponse::status_only("degraded", status_data));
    }
    status_data["redis"] = json!("ok");

    match state.kv.etl_status().await {
        Ok(etl_status) if etl_status.is_empty() => {
            status_data["etl"] = json!({"state": "down", "message": "No status data found"});
        }
        Ok(etl_status) => {
            let last_heartbeat = etl_status
                .get("last_heartbeat_ts")
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc));
            match last_heartbeat {
                Some(ts) => {
                    let lag = (Utc::now() - ts).num_milliseconds() as f64 / 1000.0;
                    let etl_state = if lag <= 30.0 {
                        "healthy"
                    } else if lag <= 60.0 {
                        "degraded"
                    } else {
                        "down"
                    };
                    status_data["etl"] = json!({
                        "state": etl_state,
                        "lag_s": (lag * 10.0).round() / 10.0,
                        "last_batch_size": etl_status
                            .get("last_batch_size")
                            .and_then(|v| v.parse::<i64>().ok())
                            .unwrap_or(0),
                        "error_rate": etl_status
                            .get("error_rate")
                            .and_then(|v| v.parse::<f64>().ok())
                            .unwrap_or(0.0),
                    });
                }
                None => {
                    status_data["etl"] =
                        json!({"state": "down", "message": "No heartbeat timestamp"});
                }
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "ETL status check failed");
            status_data["etl"] = json!({"state": "error", "message": e.to_string()});
        }
    }

    // Aggregate breaker states round out the operational picture.
    let breakers: Vec<Value> = state
        .aggregates
        .breaker_states()
        .into_iter()
        .map(|(table, breaker_state)| json!({"table": table, "state": breaker_state}))
        .collect();
    status_data["aggregate_breakers"] = json!(breakers);

    Json(ApiResponse::ok(status_data))
}
