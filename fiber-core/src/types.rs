// fiber-core: Wire and store models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::CoreError;

/// Version stamped into the `_meta` envelope at ingest.
pub const SCHEMA_VERSION: u32 = 1;

/// A single probe measurement.
///
/// `latency_ms` is optional on the wire: self-monitor health metrics omit it
/// so they do not skew latency aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub node_id: String,
    pub country: String,
    pub region: String,
    #[serde(default)]
    pub latency_ms: Option<f64>,
    pub uptime_pct: f64,
    pub packet_loss: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probe_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(rename = "_meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<IngestMeta>,
}

impl Metric {
    /// Boundary validation for gateway-facing payloads.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.node_id.is_empty() || self.node_id.len() > 50 {
            return Err(CoreError::Validation(
                "node_id must be 1-50 characters".to_string(),
            ));
        }
        if self.country.len() != 2 || !self.country.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(CoreError::Validation(format!(
                "country must be ISO 3166-1 alpha-2, got '{}'",
                self.country
            )));
        }
        if let Some(latency) = self.latency_ms {
            if !(0.0..=10_000.0).contains(&latency) {
                return Err(CoreError::Validation(format!(
                    "latency_ms out of range: {}",
                    latency
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.uptime_pct) {
            return Err(CoreError::Validation(format!(
                "uptime_pct out of range: {}",
                self.uptime_pct
            )));
        }
        if !(0.0..=100.0).contains(&self.packet_loss) {
            return Err(CoreError::Validation(format!(
                "packet_loss out of range: {}",
                self.packet_loss
            )));
        }
        Ok(())
    }
}

/// Batch of metrics from a single probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub node_id: String,
    pub metrics: Vec<Metric>,
}

/// Enrichment envelope attached to each metric at ingest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestMeta {
    pub schema_version: u32,
    pub ingested_at: DateTime<Utc>,
    pub ingested_by: String,
    pub source_region: String,
    pub trace_id: String,
}

/// Node lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Registered,
    Reporting,
    Inactive,
    Deleted,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Registered => "registered",
            NodeStatus::Reporting => "reporting",
            NodeStatus::Inactive => "inactive",
            NodeStatus::Deleted => "deleted",
        }
    }
}

/// Node metadata shell. Metric rows outlive a deleted node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    pub status: NodeStatus,
    pub country: String,
    pub region: String,
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

impl Node {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.node_id.is_empty() || self.node_id.len() > 50 {
            return Err(CoreError::Validation(
                "node_id must be 1-50 characters".to_string(),
            ));
        }
        if self.country.len() != 2 || !self.country.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(CoreError::Validation(format!(
                "country must be ISO 3166-1 alpha-2, got '{}'",
                self.country
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metric() -> Metric {
        Metric {
            node_id: "probe-accra-01".to_string(),
            country: "GH".to_string(),
            region: "Accra".to_string(),
            latency_ms: Some(42.5),
            uptime_pct: 99.9,
            packet_loss: 0.1,
            timestamp: Utc::now(),
            target_host: None,
            probe_type: Some("ping".to_string()),
            metadata: None,
            meta: None,
        }
    }

    #[test]
    fn test_valid_metric_passes() {
        assert!(sample_metric().validate().is_ok());
    }

    #[test]
    fn test_latency_out_of_range_rejected() {
        let mut m = sample_metric();
        m.latency_ms = Some(10_001.0);
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_lowercase_country_rejected() {
        let mut m = sample_metric();
        m.country = "gh".to_string();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_node_id_length_bounds() {
        let mut m = sample_metric();
        m.node_id = "x".repeat(51);
        assert!(m.validate().is_err());
        m.node_id = String::new();
        assert!(m.validate().is_err());
    }

    #[test]
    fn test_missing_latency_allowed() {
        let mut m = sample_metric();
        m.latency_ms = None;
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_naive_timestamp_rejected_on_parse() {
        let raw = r#"{
            "node_id": "probe-1", "country": "GH", "region": "Accra",
            "latency_ms": 10.0, "uptime_pct": 100.0, "packet_loss": 0.0,
            "timestamp": "2026-01-15T10:30:00"
        }"#;
        assert!(serde_json::from_str::<Metric>(raw).is_err());
    }

    #[test]
    fn test_offset_timestamp_accepted() {
        let raw = r#"{
            "node_id": "probe-1", "country": "GH", "region": "Accra",
            "latency_ms": 10.0, "uptime_pct": 100.0, "packet_loss": 0.0,
            "timestamp": "2026-01-15T10:30:00Z"
        }"#;
        assert!(serde_json::from_str::<Metric>(raw).is_ok());
    }
}
