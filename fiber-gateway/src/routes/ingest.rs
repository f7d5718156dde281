// fiber-gateway: Batch ingest
// Order matters: raw body first, HMAC over those exact bytes, then parse,
// identity, idempotency, region, enrichment, enqueue.

use std::net::SocketAddr;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use fiber_core::{signing_message, verify_signature, Batch, IngestMeta, Metric, SCHEMA_VERSION};
use fiber_store::aggregate::cache;
use fiber_store::kv::INGEST_REJECTION_KEY;
use serde_json::json;
use uuid::Uuid;

use crate::config::ValidationMode;
use crate::error::{ApiError, ApiResult};
use crate::limiter::{RateHeaders, RateOutcome};
use crate::routes::{require_auth, ApiResponse};
use crate::state::{AppState, CurrentUser, TraceId};

/// Anti-replay window for signed requests.
const REPLAY_WINDOW_SEC: i64 = 300;
/// Nonce and idempotency key lifetime.
const REPLAY_TTL_SEC: u64 = 600;

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn attach_headers(mut response: Response, rate: &RateHeaders) -> Response {
    for (name, value) in rate.as_pairs() {
        if let (Ok(name), Ok(value)) = (name.parse::<HeaderName>(), HeaderValue::from_str(&value)) {
            response.headers_mut().insert(name, value);
        }
    }
    response
}

async fn check_rate_limit(
    state: &AppState,
    user: &CurrentUser,
    headers: &HeaderMap,
    peer: &SocketAddr,
) -> ApiResult<RateHeaders> {
    let client_ip = state
        .limiter
        .client_ip(header_str(headers, "X-Forwarded-For"), &peer.ip().to_string());
    let key = state.limiter.identity_key(user, &client_ip);
    match state.limiter.check_ingest(&state.kv, &key).await {
        RateOutcome::Allowed(h) => Ok(h),
        RateOutcome::Rejected(h) => Err(ApiError::RateLimited {
            headers: h.as_pairs(),
        }),
        RateOutcome::Overloaded => Err(ApiError::Overloaded),
    }
}

/// HMAC verification over the raw body. Returns whether the signed path was
/// taken.
async fn verify_hmac(
    state: &AppState,
    headers: &HeaderMap,
    batch_id: &str,
    body: &[u8],
) -> ApiResult<bool> {
    let Some(signature) = header_str(headers, "X-Fiber-Signature") else {
        return Ok(false);
    };
    let timestamp = header_str(headers, "X-Fiber-Timestamp")
        .ok_or_else(|| ApiError::Unauthorized("Missing X-Fiber-Timestamp".to_string()))?;
    let nonce = header_str(headers, "X-Fiber-Nonce")
        .ok_or_else(|| ApiError::Unauthorized("Missing X-Fiber-Nonce".to_string()))?;

    // Freshness: explicit-offset timestamps only, within the replay window.
    let ts = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| ApiError::Unauthorized("Invalid timestamp format".to_string()))?
        .with_timezone(&Utc);
    if (Utc::now() - ts).num_seconds().abs() > REPLAY_WINDOW_SEC {
        return Err(ApiError::Unauthorized(
            "Request timestamp too old".to_string(),
        ));
    }

    // Nonce: first sight claims it; anything else is a replay.
    let nonce_key = format!("nonce:{}", nonce);
    if !state.kv.set_nx_ex(&nonce_key, REPLAY_TTL_SEC).await? {
        return Err(ApiError::Unauthorized("Nonce replay detected".to_string()));
    }

    let message = signing_message(batch_id, timestamp, nonce, body);
    if !verify_signature(&state.config.federation_secret, &message, signature) {
        tracing::warn!(batch_id = %batch_id, "signature mismatch");
        return Err(ApiError::Unauthorized("Invalid HMAC signature".to_string()));
    }

    tracing::info!(batch_id = %batch_id, "verified HMAC");
    Ok(true)
}

fn resolve_region(headers: &HeaderMap, batch: &Batch) -> String {
    if let Some(region) = header_str(headers, "X-Region-ID") {
        return region.to_string();
    }
    if let Some(first) = batch.metrics.first() {
        let country = first.country.to_lowercase();
        let region = first.region.to_lowercase().replace(' ', "-");
        return format!("{}-{}", country, region);
    }
    "unknown".to_string()
}

/// POST /api/ingest — probe batch ingest (federation path).
pub async fn ingest_batch(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    // Idempotency key is mandatory on this path.
    let batch_id = header_str(&headers, "X-Batch-ID")
        .ok_or_else(|| ApiError::Validation {
            code: "MISSING_BATCH_ID",
            message: "X-Batch-ID header is required".to_string(),
            batch_id: None,
        })?
        .to_string();
    if Uuid::parse_str(&batch_id).is_err() {
        return Err(ApiError::Validation {
            code: "INVALID_BATCH_ID",
            message: "X-Batch-ID must be a UUID".to_string(),
            batch_id: Some(batch_id),
        });
    }

    let rate_headers = check_rate_limit(&state, &user, &headers, &peer).await?;

    // 1-2. HMAC over the raw bytes, before any parsing.
    let signed = verify_hmac(&state, &headers, &batch_id, &body).await?;

    // 3. Parse the validated body.
    let batch: Batch = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Unprocessable(format!("Invalid payload: {}", e)))?;
    for metric in &batch.metrics {
        metric
            .validate()
            .map_err(|e| ApiError::Unprocessable(e.to_string()))?;
    }

    // 4. Identity: access token or the federation secret as bearer.
    if require_auth(&user).is_err() {
        return Err(ApiError::Unauthorized(
            "Missing Authorization header".to_string(),
        ));
    }
    let auth_path = if signed { "hmac+bearer" } else { "bearer-only" };

    // 5. Idempotency: a replayed batch id acknowledges without enqueueing.
    let idempotency_key = format!("idempotency:batch:{}", batch_id);
    if !state.kv.set_nx_ex(&idempotency_key, REPLAY_TTL_SEC).await? {
        let response = ApiResponse::accepted("Batch already processed (Idempotent)");
        return Ok(attach_headers(
            (StatusCode::ACCEPTED, Json(response)).into_response(),
            &rate_headers,
        ));
    }

    // 6. Region resolution and validation.
    let source_region = resolve_region(&headers, &batch);
    if source_region != "unknown" && !state.config.allowed_regions.contains(&source_region) {
        if state.config.validation_mode == ValidationMode::Strict
            && state.config.node_role == "central"
        {
            if let Err(e) = state.kv.incr(INGEST_REJECTION_KEY).await {
                tracing::warn!(error = %e, "rejection counter update failed");
            }
            tracing::warn!(batch_id = %batch_id, region = %source_region, "rejected batch: unknown region");
            return Err(ApiError::Validation {
                code: "INVALID_REGION",
                message: format!("Unknown region: {}", source_region),
                batch_id: Some(batch_id),
            });
        }
        tracing::warn!(batch_id = %batch_id, region = %source_region, "accepted batch with unknown region (lenient mode)");
    }

    // 7. Enrichment and single-pipeline enqueue.
    let ingested_at = Utc::now();
    let mut payloads = Vec::with_capacity(batch.metrics.len());
    for metric in &batch.metrics {
        if metric.node_id != batch.node_id {
            tracing::warn!(
                metric_node = %metric.node_id,
                batch_node = %batch.node_id,
                "metric node_id mismatch, dropping row"
            );
            continue;
        }
        let mut enriched = metric.clone();
        enriched.meta = Some(IngestMeta {
            schema_version: SCHEMA_VERSION,
            ingested_at,
            ingested_by: state.config.node_role.clone(),
            source_region: source_region.clone(),
            trace_id: trace_id.clone(),
        });
        payloads.push(
            serde_json::to_string(&enriched)
                .map_err(|e| ApiError::Internal(e.to_string()))?,
        );
    }

    let count = state
        .kv
        .enqueue_payloads(&state.config.queue_key, &payloads)
        .await
        .map_err(|e| {
            tracing::error!(batch_id = %batch_id, error = %e, "enqueue failed");
            ApiError::Unavailable("Ingestion failed".to_string())
        })?;

    if let Err(e) = cache::invalidate_on_ingest(&state.kv).await {
        tracing::warn!(error = %e, "dashboard cache invalidation failed");
    }

    tracing::info!(
        batch_id = %batch_id,
        node_id = %batch.node_id,
        source_region = %source_region,
        count,
        auth_path,
        "ingested batch"
    );

    let response = ApiResponse {
        status: "accepted".to_string(),
        message: Some(format!("Queued {} metrics", count)),
        data: Some(json!({"batch_id": batch_id, "source_region": source_region})),
        meta: None,
    };
    Ok(attach_headers(
        (StatusCode::ACCEPTED, Json(response)).into_response(),
        &rate_headers,
    ))
}

/// POST /api/push — single-metric ingest (legacy dashboard path).
pub async fn push_single(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
    Extension(TraceId(trace_id)): Extension<TraceId>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(metric): Json<Metric>,
) -> ApiResult<Response> {
    require_auth(&user)?;
    let rate_headers = check_rate_limit(&state, &user, &headers, &peer).await?;
    metric
        .validate()
        .map_err(|e| ApiError::Unprocessable(e.to_string()))?;

    let source_region = format!(
        "{}-{}",
        metric.country.to_lowercase(),
        metric.region.to_lowercase().replace(' ', "-")
    );
    let mut enriched = metric;
    enriched.meta = Some(IngestMeta {
        schema_version: SCHEMA_VERSION,
        ingested_at: Utc::now(),
        ingested_by: state.config.node_role.clone(),
        source_region: source_region.clone(),
        trace_id,
    });

    let payload =
        serde_json::to_string(&enriched).map_err(|e| ApiError::Internal(e.to_string()))?;
    state
        .kv
        .enqueue_payloads(&state.config.queue_key, &[payload])
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "push enqueue failed");
            ApiError::Unavailable("Ingestion failed".to_string())
        })?;

    let response = ApiResponse::accepted("Queued 1 metric");
    Ok(attach_headers(
        (StatusCode::ACCEPTED, Json(response)).into_response(),
        &rate_headers,
    ))
}
