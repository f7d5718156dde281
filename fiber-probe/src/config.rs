// fiber-probe: Configuration
// TOML federation config with environment overrides; legacy env-only
// fallback when no file is present.

use fiber_core::secrets::env_or;
use serde::Deserialize;
use uuid::Uuid;

use crate::client::TargetConfig;
use crate::{ProbeError, ProbeResult};

const DEFAULT_CONFIG_PATH: &str = "configs/federation.toml";

/// Probe agent configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "ProbeConfig::default_node_id")]
    pub node_id: String,
    #[serde(default = "ProbeConfig::default_country")]
    pub country: String,
    #[serde(default = "ProbeConfig::default_region")]
    pub region: String,
    #[serde(default = "ProbeConfig::default_interval_sec")]
    pub interval_sec: u64,
    #[serde(default = "ProbeConfig::default_heartbeat_interval_sec")]
    pub heartbeat_interval_sec: u64,
    #[serde(default = "ProbeConfig::default_monitor_interval_sec")]
    pub monitor_interval_sec: u64,
    #[serde(default = "ProbeConfig::default_buffer_path")]
    pub buffer_path: String,
    #[serde(default = "ProbeConfig::default_buffer_max_bytes")]
    pub buffer_max_bytes: i64,
    #[serde(default = "ProbeConfig::default_batch_size")]
    pub batch_size: i64,
    #[serde(default = "ProbeConfig::default_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl ProbeConfig {
    fn default_node_id() -> String {
        Uuid::new_v4().to_string()
    }
    fn default_country() -> String {
        "GH".to_string()
    }
    fn default_region() -> String {
        "Accra".to_string()
    }
    fn default_interval_sec() -> u64 {
        30
    }
    fn default_heartbeat_interval_sec() -> u64 {
        60
    }
    fn default_monitor_interval_sec() -> u64 {
        60
    }
    fn default_buffer_path() -> String {
        "/data/buffer.db".to_string()
    }
    fn default_buffer_max_bytes() -> i64 {
        100 * 1024 * 1024
    }
    fn default_batch_size() -> i64 {
        50
    }
    fn default_api_base() -> String {
        "http://localhost:8000".to_string()
    }

    fn defaults() -> Self {
        Self {
            node_id: Self::default_node_id(),
            country: Self::default_country(),
            region: Self::default_region(),
            interval_sec: Self::default_interval_sec(),
            heartbeat_interval_sec: Self::default_heartbeat_interval_sec(),
            monitor_interval_sec: Self::default_monitor_interval_sec(),
            buffer_path: Self::default_buffer_path(),
            buffer_max_bytes: Self::default_buffer_max_bytes(),
            batch_size: Self::default_batch_size(),
            api_base: Self::default_api_base(),
            targets: Vec::new(),
        }
    }

    /// Load config from `CONFIG_PATH` (TOML) or fall back to legacy env
    /// vars, then apply environment overrides.
    pub fn load() -> ProbeResult<Self> {
        let path = env_or("CONFIG_PATH", DEFAULT_CONFIG_PATH);
        let mut config = if std::path::Path::new(&path).exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ProbeError::Config(format!("failed to read {}: {}", path, e)))?;
            let parsed: ProbeConfig = toml::from_str(&contents)
                .map_err(|e| ProbeError::Config(format!("failed to parse {}: {}", path, e)))?;
            tracing::info!(path = %path, "loaded federation config");
            parsed
        } else {
            tracing::warn!(path = %path, "config not found, using legacy env vars");
            let mut config = Self::defaults();
            if let Ok(api_url) = std::env::var("API_URL") {
                config.targets.push(TargetConfig {
                    name: "legacy-env".to_string(),
                    url: api_url,
                    priority: 1,
                    enabled: true,
                    token_env: Some("FEDERATION_TOKEN_CLOUD".to_string()),
                    retry: None,
                });
            }
            config
        };

        config.apply_env_overrides();
        config.targets.retain(|t| t.enabled);
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("NODE_ID") {
            self.node_id = v;
        }
        if let Ok(v) = std::env::var("COUNTRY") {
            self.country = v;
        }
        if let Ok(v) = std::env::var("REGION") {
            self.region = v;
        }
        if let Ok(v) = std::env::var("PROBE_INTERVAL") {
            if let Ok(n) = v.parse() {
                self.interval_sec = n;
            }
        }
        if let Ok(v) = std::env::var("HEARTBEAT_INTERVAL") {
            if let Ok(n) = v.parse() {
                self.heartbeat_interval_sec = n;
            }
        }
        if let Ok(v) = std::env::var("BUFFER_PATH") {
            self.buffer_path = v;
        }
        if let Ok(v) = std::env::var("API_URL") {
            // Derive the API base for heartbeats from the ingest URL.
            self.api_base = v
                .split("/api/")
                .next()
                .unwrap_or(&v)
                .trim_end_matches('/')
                .to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_round_trip_with_targets() {
        let raw = r#"
            node_id = "probe-accra-01"
            country = "GH"
            region = "Accra"
            interval_sec = 15

            [[targets]]
            name = "central"
            url = "http://central:8000/api/ingest"
            priority = 1

            [[targets]]
            name = "edge"
            url = "http://edge:8000/api/ingest"
            priority = 2
            enabled = false
        "#;
        let config: ProbeConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.node_id, "probe-accra-01");
        assert_eq!(config.interval_sec, 15);
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.targets[0].priority, 1);
        assert!(!config.targets[1].enabled);
        // Untouched fields keep defaults.
        assert_eq!(config.batch_size, 50);
    }

    #[test]
    fn test_defaults_have_no_targets() {
        let config = ProbeConfig::defaults();
        assert!(config.targets.is_empty());
        assert_eq!(config.interval_sec, 30);
    }
}
