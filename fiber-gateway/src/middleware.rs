// fiber-gateway: Request middleware
// Trace propagation, bearer identity (fail-closed on revocation except the
// legacy capture paths), and the hardening headers.

use axum::extract::{Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fiber_auth::{revocation, tokens};
use fiber_core::trace::generate_trace_id;
use serde_json::json;

use crate::state::{AppState, CurrentUser, TraceId};

/// Paths reachable without identity.
const PUBLIC_PATHS: [&str; 4] = ["/", "/health", "/api/auth/login", "/api/status"];

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn unauthorized(detail: &str, trace_id: &str) -> Response {
    let mut response =
        (StatusCode::UNAUTHORIZED, Json(json!({"detail": detail}))).into_response();
    echo_trace(&mut response, trace_id);
    response
}

fn echo_trace(response: &mut Response, trace_id: &str) {
    if let Ok(value) = HeaderValue::from_str(trace_id) {
        response.headers_mut().insert("X-Request-ID", value.clone());
        response.headers_mut().insert("X-Trace-ID", value);
    }
}

/// Identity middleware. Leaves anonymous users in place for public paths
/// and for handlers that do their own auth (the ingest legacy path).
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    // Inbound trace id wins; otherwise mint one.
    let trace_id = request
        .headers()
        .get("X-Trace-ID")
        .or_else(|| request.headers().get("X-Request-ID"))
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(generate_trace_id);
    request.extensions_mut().insert(TraceId(trace_id.clone()));

    let path = request.uri().path().to_string();

    if PUBLIC_PATHS.contains(&path.as_str()) {
        request.extensions_mut().insert(CurrentUser::anonymous());
        let mut response = next.run(request).await;
        echo_trace(&mut response, &trace_id);
        return response;
    }

    let Some(token) = bearer_token(&request) else {
        request.extensions_mut().insert(CurrentUser::anonymous());
        let mut response = next.run(request).await;
        echo_trace(&mut response, &trace_id);
        return response;
    };

    // Federation secret presented as bearer: the legacy probe path, granted
    // OPERATOR.
    if !state.config.federation_secret.is_empty() && token == state.config.federation_secret {
        request
            .extensions_mut()
            .insert(CurrentUser::federation_probe());
        let mut response = next.run(request).await;
        echo_trace(&mut response, &trace_id);
        return response;
    }

    match tokens::verify_typed(&state.tokens, &token, fiber_auth::TokenType::Access) {
        Ok(claims) => {
            // Stateful revocation check, fail-closed. The legacy push path
            // fails open to preserve data capture.
            let mut conn = state.kv.manager();
            match revocation::is_jti_revoked(&mut conn, &claims.jti).await {
                Ok(true) => {
                    tracing::warn!(jti = %claims.jti, "rejected revoked token");
                    return unauthorized("Token revoked", &trace_id);
                }
                Ok(false) => {}
                Err(e) => {
                    if path == "/api/push" {
                        tracing::warn!(error = %e, "kv-store down during push auth, failing open");
                    } else {
                        tracing::error!(error = %e, "kv-store down during auth check");
                        let mut response = (
                            StatusCode::SERVICE_UNAVAILABLE,
                            Json(json!({"detail": "Auth Persistence Unavailable"})),
                        )
                            .into_response();
                        echo_trace(&mut response, &trace_id);
                        return response;
                    }
                }
            }

            let role = state.credentials.role_of(&claims.sub);
            request.extensions_mut().insert(CurrentUser {
                username: claims.sub,
                role,
                jti: Some(claims.jti),
                exp: Some(claims.exp),
            });
        }
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "auth failed");
            // The signed ingest path keeps its own auth; let the handler
            // decide (HMAC plus legacy bearer).
            if path != "/api/ingest" {
                return unauthorized(&e.to_string(), &trace_id);
            }
            request.extensions_mut().insert(CurrentUser::anonymous());
        }
    }

    let mut response = next.run(request).await;
    echo_trace(&mut response, &trace_id);
    response
}

/// Hardening headers on every response.
pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "Strict-Transport-Security",
        HeaderValue::from_static("max-age=63072000; includeSubDomains; preload"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static(
            "default-src 'self'; img-src 'self' data: https:; \
             script-src 'self' 'unsafe-inline'; style-src 'self' 'unsafe-inline';",
        ),
    );
    headers.insert("Server", HeaderValue::from_static("FiberStack"));
    response
}
