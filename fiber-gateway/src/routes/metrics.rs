// fiber-gateway: Metric query endpoints
// Raw pagination plus the windowed aggregate views with source annotation.

use axum::extract::{Query, State};
use axum::{Extension, Json};
use chrono::{DateTime, Duration, Utc};
use fiber_store::tsdb::{self, MetricsFilter};
use fiber_store::Dimension;
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::routes::{require_permission, ApiResponse};
use crate::state::{AppState, CurrentUser};

const MAX_CLUSTER_WINDOW_SEC: i64 = 7 * 86_400;

#[derive(Debug, Deserialize)]
pub struct MetricsParams {
    pub node_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "MetricsParams::default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

impl MetricsParams {
    fn default_limit() -> i64 {
        100
    }
}

/// GET /api/metrics — paginated raw metrics, most recent first.
pub async fn get_metrics(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Query(params): Query<MetricsParams>,
) -> ApiResult<Json<ApiResponse>> {
    require_permission(&user, "view:metrics")?;

    let filter = MetricsFilter {
        node_id: params.node_id,
        start_time: params.start_time,
        end_time: params.end_time,
        limit: params.limit.clamp(1, 1000),
        offset: params.offset.max(0),
    };

    let db = state.db().await;
    let rows = tsdb::query_metrics(&db, &filter).await?;

    Ok(Json(ApiResponse::ok(json!({
        "count": rows.len(),
        "limit": filter.limit,
        "offset": filter.offset,
        "order": "time DESC",
        "metrics": rows,
    }))))
}

#[derive(Debug, Deserialize)]
pub struct AggregatedParams {
    pub dimension: Dimension,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub prefer_freshness: bool,
}

fn window_defaults(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let now = Utc::now();
    let end = end.unwrap_or(now);
    let start = start.unwrap_or(end - Duration::hours(24));
    (start, end)
}

/// GET /api/metrics/aggregated — windowed aggregates by node or region.
pub async fn get_aggregated(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Query(params): Query<AggregatedParams>,
) -> ApiResult<Json<ApiResponse>> {
    require_permission(&user, "view:metrics")?;

    let (start, end) = window_defaults(params.start_time, params.end_time);
    if end <= start {
        return Err(ApiError::Validation {
            code: "INVALID_WINDOW",
            message: "end_time must be after start_time".to_string(),
            batch_id: None,
        });
    }

    let db = state.db().await;
    let outcome = state
        .aggregates
        .query_aggregated(&db, params.dimension, start, end, params.prefer_freshness)
        .await?;

    Ok(Json(
        ApiResponse::ok(serde_json::to_value(&outcome.data).map_err(|e| ApiError::Internal(e.to_string()))?)
            .with_meta(json!({
                "source": outcome.source,
                "window_seconds": outcome.window_seconds,
            })),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ClusterParams {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default = "ClusterParams::default_top_n")]
    pub top_n: i64,
}

impl ClusterParams {
    fn default_top_n() -> i64 {
        5
    }
}

/// GET /api/metrics/cluster — fleet summary and top-N problematic nodes.
pub async fn get_cluster(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Query(params): Query<ClusterParams>,
) -> ApiResult<Json<ApiResponse>> {
    require_permission(&user, "view:metrics")?;

    let (start, end) = window_defaults(params.start_time, params.end_time);
    if (end - start).num_seconds() > MAX_CLUSTER_WINDOW_SEC {
        return Err(ApiError::Validation {
            code: "WINDOW_TOO_LARGE",
            message: "Max query window is 7 days".to_string(),
            batch_id: None,
        });
    }
    let top_n = params.top_n.clamp(1, 20);

    let db = state.db().await;
    let outcome = state.aggregates.query_cluster(&db, start, end, top_n).await?;

    Ok(Json(
        ApiResponse::ok(serde_json::to_value(&outcome.data).map_err(|e| ApiError::Internal(e.to_string()))?)
            .with_meta(json!({"source": outcome.source})),
    ))
}
