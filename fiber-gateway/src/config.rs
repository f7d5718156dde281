// fiber-gateway: Configuration
// Env-driven with file-based secret support. Missing required secrets are
// fatal at startup (exit code 1).

use fiber_core::secrets::{env_list, env_or, get_secret};
use fiber_core::CoreError;
use fiber_store::DbConfig;

/// Region validation behavior at the central node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Strict,
    Lenient,
}

/// Gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    pub redis_url: String,
    pub db: DbConfig,
    pub jwt_secret: String,
    pub federation_secret: String,
    pub user_credentials: String,
    pub admin_users: Vec<String>,
    pub operator_users: Vec<String>,
    pub queue_key: String,
    pub allowed_regions: Vec<String>,
    pub node_role: String,
    pub validation_mode: ValidationMode,
    pub cors_origins: Vec<String>,
    pub audit_log_path: String,
    pub rate_limit: RateLimitSettings,
}

/// Rate limiter tunables (§ two-tier limiter).
#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub ingest_rate_per_sec: f64,
    pub ingest_burst: i64,
    pub local_rate_per_sec: u32,
    pub global_max: u32,
    pub trusted_proxies: Vec<String>,
}

impl GatewayConfig {
    pub fn load() -> Result<Self, CoreError> {
        let jwt_secret = get_secret("JWT_SECRET", None, true)?;
        let federation_secret = get_secret("FEDERATION_SECRET", None, true)?;
        let user_credentials = get_secret("USER_CREDENTIALS", None, true)?;

        let validation_mode = if env_or("REGION_VALIDATION", "strict") == "strict" {
            ValidationMode::Strict
        } else {
            ValidationMode::Lenient
        };

        Ok(Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8000"),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379/0"),
            db: DbConfig::from_env(),
            jwt_secret,
            federation_secret,
            user_credentials,
            admin_users: env_list("ADMIN_USERS", "admin"),
            operator_users: env_list("OPERATOR_USERS", "operator"),
            queue_key: env_or("ETL_QUEUE_KEY", "fiber:etl:queue"),
            allowed_regions: env_list("ALLOWED_REGIONS", "gh-accra,ng-lagos,ke-nairobi"),
            node_role: env_or("NODE_ROLE", "central"),
            validation_mode,
            cors_origins: env_list(
                "CORS_ORIGINS",
                "http://localhost:3000,http://localhost:8000",
            ),
            audit_log_path: env_or("AUDIT_LOG_PATH", "/var/lib/fiberstack/audit.jsonl"),
            rate_limit: RateLimitSettings {
                ingest_rate_per_sec: env_or("RATE_LIMIT_INGEST_RATE", "1.0").parse().unwrap_or(1.0),
                ingest_burst: env_or("RATE_LIMIT_INGEST_BURST", "10").parse().unwrap_or(10),
                local_rate_per_sec: env_or("RATE_LIMIT_LOCAL_RATE", "5").parse().unwrap_or(5),
                global_max: env_or("RATE_LIMIT_GLOBAL_MAX", "200").parse().unwrap_or(200),
                trusted_proxies: env_list("RATE_LIMIT_TRUSTED_PROXIES", "127.0.0.1"),
            },
        })
    }
}
