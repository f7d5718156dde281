// fiber-etl: Worker configuration

use fiber_core::secrets::env_or;

/// Worker settings, env-driven like the rest of the deployment.
#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub redis_url: String,
    pub batch_size: usize,
    pub dedup_ttl_sec: u64,
    pub use_copy: bool,
    pub dedup_enabled: bool,
    pub node_cache_enabled: bool,
    pub idle_sleep_ms: u64,
}

impl EtlConfig {
    pub fn from_env() -> Self {
        Self {
            redis_url: env_or("REDIS_URL", "redis://localhost:6379/0"),
            batch_size: env_or("ETL_BATCH_SIZE", "100").parse().unwrap_or(100),
            dedup_ttl_sec: env_or("DEDUP_TTL_SEC", "180").parse().unwrap_or(180),
            use_copy: env_or("ETL_USE_COPY", "true").to_lowercase() == "true",
            dedup_enabled: env_or("ETL_DEDUP_ENABLED", "true").to_lowercase() == "true",
            node_cache_enabled: env_or("ETL_NODE_CACHE_ENABLED", "true").to_lowercase() == "true",
            idle_sleep_ms: 100,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EtlConfig::from_env();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.dedup_ttl_sec, 180);
        assert!(config.use_copy);
        assert!(config.dedup_enabled);
    }
}
