// fiber-gateway: API error taxonomy
// Maps the failure modes onto status codes: validation 4xx, auth 401/403,
// rate limit 429, transient persistence 503.

use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use fiber_auth::AuthError;
use fiber_store::StoreError;
use serde_json::json;

/// Gateway result type
pub type ApiResult<T> = Result<T, ApiError>;

/// Gateway error types
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        code: &'static str,
        message: String,
        batch_id: Option<String>,
    },

    #[error("Invalid payload: {0}")]
    Unprocessable(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Rate limit exceeded")]
    RateLimited { headers: Vec<(String, String)> },

    #[error("System overload")]
    Overloaded,

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Validation {
                code,
                message,
                batch_id,
            } => {
                let body = json!({
                    "status": "error",
                    "code": code,
                    "message": message,
                    "batch_id": batch_id,
                });
                (StatusCode::BAD_REQUEST, Json(body)).into_response()
            }
            ApiError::Unprocessable(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"detail": message})),
            )
                .into_response(),
            ApiError::Unauthorized(message) => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"detail": message})),
            )
                .into_response(),
            ApiError::Forbidden(message) => {
                (StatusCode::FORBIDDEN, Json(json!({"detail": message}))).into_response()
            }
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({"detail": message}))).into_response()
            }
            ApiError::Conflict(message) => {
                (StatusCode::CONFLICT, Json(json!({"detail": message}))).into_response()
            }
            ApiError::RateLimited { headers } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({"detail": "Rate limit exceeded"})),
                )
                    .into_response();
                for (name, value) in headers {
                    if let (Ok(name), Ok(value)) = (
                        name.parse::<HeaderName>(),
                        HeaderValue::from_str(&value),
                    ) {
                        response.headers_mut().insert(name, value);
                    }
                }
                response
            }
            ApiError::Overloaded => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"detail": "System Overload"})),
            )
                .into_response(),
            ApiError::Unavailable(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"detail": message})),
            )
                .into_response(),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({"detail": message})),
                )
                    .into_response()
            }
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(m) => ApiError::NotFound(m),
            StoreError::Conflict(m) => ApiError::Conflict(m),
            StoreError::Kv(e) => ApiError::Unavailable(format!("Kv-store unavailable: {}", e)),
            StoreError::Timeout(ms) => ApiError::Unavailable(format!("Query timeout after {}ms", ms)),
            StoreError::Db(e) => ApiError::Internal(format!("Database query failed: {}", e)),
            StoreError::Serialization(e) => ApiError::Internal(e.to_string()),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::RevocationUnavailable(_) => {
                ApiError::Unavailable("Auth Persistence Unavailable".to_string())
            }
            AuthError::Config(m) | AuthError::Audit(m) => ApiError::Internal(m),
            other => ApiError::Unauthorized(other.to_string()),
        }
    }
}
