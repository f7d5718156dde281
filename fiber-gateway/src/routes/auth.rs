// fiber-gateway: Auth endpoints
// Login, refresh rotation with reuse detection, logout revocation, and the
// identity echo.

use axum::extract::State;
use axum::{Extension, Json};
use chrono::Utc;
use fiber_auth::{revocation, tokens, TokenPair};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ApiError, ApiResult};
use crate::routes::{require_auth, ApiResponse};
use crate::state::{AppState, CurrentUser};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

async fn audit(state: &AppState, user: &str, role: &str, action: &str, details: serde_json::Value) {
    let mut log = state.audit.lock().await;
    if let Err(e) = log.append(user, role, action, "auth", details) {
        tracing::error!(error = %e, "audit write failed");
    }
}

/// Username/password login issuing an access/refresh pair.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<TokenPair>> {
    if !state.credentials.verify(&request.username, &request.password) {
        audit(
            &state,
            &request.username,
            "ANONYMOUS",
            "LOGIN_FAILED",
            json!({}),
        )
        .await;
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }

    let role = state.credentials.role_of(&request.username);
    let pair = tokens::issue_tokens(&state.tokens, &request.username, role)?;
    audit(
        &state,
        &request.username,
        role.as_str(),
        "LOGIN_SUCCESS",
        json!({}),
    )
    .await;
    Ok(Json(pair))
}

/// Rotate a refresh token: the presented jti is revoked before the new pair
/// is issued, so a replayed refresh token yields 401.
pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    let mut conn = state.kv.manager();
    let pair = revocation::rotate_refresh_token(
        &mut conn,
        &state.tokens,
        &state.credentials,
        &request.refresh_token,
    )
    .await?;
    Ok(Json(pair))
}

/// Revoke the presented access token's jti until its natural expiry.
pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<ApiResponse>> {
    require_auth(&user)?;
    let Some(jti) = &user.jti else {
        return Err(ApiError::Unauthorized("No token to revoke".to_string()));
    };

    let ttl = user
        .exp
        .map(|exp| (exp - Utc::now().timestamp()).max(0))
        .unwrap_or(0);
    let mut conn = state.kv.manager();
    revocation::revoke_jti(&mut conn, jti, ttl).await?;

    audit(&state, &user.username, user.role.as_str(), "LOGOUT", json!({})).await;
    Ok(Json(ApiResponse::ok(json!({"revoked": true}))))
}

/// Identity and effective permissions for the presented token.
pub async fn me(
    Extension(user): Extension<CurrentUser>,
) -> ApiResult<Json<ApiResponse>> {
    require_auth(&user)?;
    Ok(Json(ApiResponse::ok(json!({
        "username": user.username,
        "role": user.role.as_str(),
        "permissions": user.role.permissions(),
    }))))
}
