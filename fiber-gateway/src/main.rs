// fiber-gateway: Ingestion gateway entrypoint
// Exit codes: 0 on clean shutdown, 1 on missing secrets or startup failure.
// SIGHUP rebuilds the store pool for credential rotation without dropping
// in-flight requests.

mod config;
mod error;
mod limiter;
mod middleware;
mod routes;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use fiber_auth::{AuditLog, CredentialStore, TokenConfig};
use fiber_store::{AggregateService, Db, Kv};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::limiter::RateLimiter;
use crate::state::AppState;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("ENV").as_deref() == Ok("dev") {
        builder.init();
    } else {
        builder.json().init();
    }
}

fn build_cors(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new()
        .allow_origin(parsed)
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_credentials(true)
}

/// Rebuild the store pool on SIGHUP (certificate rotation). The old pool
/// drains gracefully once replaced.
fn spawn_sighup_reload(db_slot: Arc<RwLock<Db>>, db_config: fiber_store::DbConfig) {
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "SIGHUP handler unavailable");
                return;
            }
        };
        while hangup.recv().await.is_some() {
            tracing::info!("received SIGHUP, rebuilding store connection pool");
            match Db::connect(&db_config).await {
                Ok(new_db) => {
                    let old = {
                        let mut slot = db_slot.write().await;
                        std::mem::replace(&mut *slot, new_db)
                    };
                    old.close().await;
                    tracing::info!("store pool reloaded");
                }
                Err(e) => {
                    tracing::error!(error = %e, "store pool reload failed, keeping old pool");
                }
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() {
    init_tracing();

    let config = match GatewayConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    let kv = match Kv::connect(&config.redis_url).await {
        Ok(kv) => kv,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to kv-store");
            std::process::exit(1);
        }
    };
    let db = match Db::connect(&config.db).await {
        Ok(db) => db,
        Err(e) => {
            tracing::error!(error = %e, "failed to connect to store");
            std::process::exit(1);
        }
    };
    let credentials = match CredentialStore::from_config(
        &config.user_credentials,
        config.admin_users.clone(),
        config.operator_users.clone(),
    ) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "credential store error");
            std::process::exit(1);
        }
    };
    tracing::info!(
        admins = config.admin_users.len(),
        users = credentials.user_count(),
        "RBAC loaded"
    );

    let audit = match AuditLog::open(&config.audit_log_path) {
        Ok(log) => log,
        Err(e) => {
            tracing::error!(error = %e, "failed to open audit log");
            std::process::exit(1);
        }
    };

    let db_slot = Arc::new(RwLock::new(db));
    spawn_sighup_reload(Arc::clone(&db_slot), config.db.clone());

    let state = AppState {
        kv: kv.clone(),
        db: db_slot,
        tokens: TokenConfig::new(config.jwt_secret.clone()),
        credentials: Arc::new(credentials),
        audit: Arc::new(Mutex::new(audit)),
        limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
        aggregates: Arc::new(AggregateService::new(kv)),
        config: Arc::new(config.clone()),
    };

    let app = Router::new()
        .route("/", get(routes::status::root))
        .route("/health", get(routes::status::health))
        .nest("/api", routes::api_router())
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .layer(axum::middleware::from_fn(middleware::security_headers))
        .layer(build_cors(&config.cors_origins))
        // Per-request deadline propagated to every downstream await.
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = match TcpListener::bind(&config.bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(addr = %config.bind_addr, error = %e, "failed to bind");
            std::process::exit(1);
        }
    };
    tracing::info!(addr = %config.bind_addr, "fiber-gateway listening");

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = serve.await {
        tracing::error!(error = %e, "server error");
        std::process::exit(1);
    }
}
