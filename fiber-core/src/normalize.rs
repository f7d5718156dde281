// fiber-core: ETL-side metric normalization
// Lenient coercion for queue payloads; the gateway boundary is strict instead.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::types::IngestMeta;

/// A metric after normalization: concrete numbers, aware timestamp.
#[derive(Debug, Clone)]
pub struct NormalizedMetric {
    pub node_id: String,
    pub country: String,
    pub region: String,
    pub latency_ms: f64,
    pub uptime_pct: f64,
    pub packet_loss: f64,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
    pub meta: Option<IngestMeta>,
}

impl NormalizedMetric {
    /// Region tag recorded in conflict audits: `_meta.source_region` or "unknown".
    pub fn source_region(&self) -> &str {
        self.meta
            .as_ref()
            .map(|m| m.source_region.as_str())
            .unwrap_or("unknown")
    }

    /// Dedup key component: second-precision prefix of the RFC-3339 timestamp.
    pub fn dedup_timestamp(&self) -> String {
        self.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string()
    }
}

fn to_f64(value: Option<&Value>, default: f64) -> f64 {
    match value {
        None | Some(Value::Null) => default,
        Some(Value::Bool(b)) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
        Some(Value::String(s)) => s.trim().parse::<f64>().unwrap_or_else(|_| {
            tracing::warn!(value = %s, "cannot coerce to float, using default");
            default
        }),
        Some(_) => default,
    }
}

fn to_timestamp(value: Option<&Value>) -> DateTime<Utc> {
    match value {
        Some(Value::String(s)) => match DateTime::parse_from_rfc3339(s) {
            Ok(ts) => ts.with_timezone(&Utc),
            Err(_) => {
                tracing::warn!(value = %s, "invalid timestamp, using now");
                Utc::now()
            }
        },
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now),
        _ => Utc::now(),
    }
}

fn is_numeric_key(key: &str) -> bool {
    const NUMERIC_SUFFIXES: [&str; 5] = ["_percent", "_pct", "_ms", "_count", "_bytes"];
    NUMERIC_SUFFIXES.iter().any(|s| key.ends_with(s))
}

fn normalize_metadata(meta: Option<&Value>) -> Value {
    let Some(Value::Object(map)) = meta else {
        return Value::Object(Map::new());
    };
    let normalized = map
        .iter()
        .map(|(k, v)| {
            if is_numeric_key(k) {
                (k.clone(), Value::from(to_f64(Some(v), 0.0)))
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect::<Map<_, _>>();
    Value::Object(normalized)
}

/// Normalize a raw queue payload.
///
/// String numbers are coerced, percentages clamped to [0, 100], missing
/// timestamps default to now, country is upper-cased and truncated to 2
/// chars. Returns `None` only when the payload is not a JSON object.
pub fn normalize_metric(raw: &Value) -> Option<NormalizedMetric> {
    let obj = raw.as_object()?;

    let node_id = obj
        .get("node_id")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let country: String = obj
        .get("country")
        .and_then(Value::as_str)
        .unwrap_or("XX")
        .chars()
        .take(2)
        .collect::<String>()
        .to_uppercase();
    let region = obj
        .get("region")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string();

    let meta = obj
        .get("_meta")
        .and_then(|m| serde_json::from_value::<IngestMeta>(m.clone()).ok());

    Some(NormalizedMetric {
        node_id,
        country,
        region,
        latency_ms: to_f64(obj.get("latency_ms"), 0.0).max(0.0),
        uptime_pct: to_f64(obj.get("uptime_pct"), 100.0).clamp(0.0, 100.0),
        packet_loss: to_f64(obj.get("packet_loss"), 0.0).clamp(0.0, 100.0),
        timestamp: to_timestamp(obj.get("timestamp")),
        metadata: normalize_metadata(obj.get("metadata")),
        meta,
    })
}

/// Post-normalization validation. Rejected rows count as failures.
pub fn validate_normalized(metric: &NormalizedMetric) -> bool {
    if metric.node_id.is_empty() || metric.node_id == "unknown" || metric.node_id.len() > 50 {
        return false;
    }
    if metric.latency_ms < 0.0 {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_string_numbers_coerced() {
        let raw = json!({
            "node_id": "probe-1",
            "latency_ms": " 42.5 ",
            "uptime_pct": "99.9",
            "packet_loss": "0.3",
            "timestamp": "2026-01-15T10:30:00Z"
        });
        let m = normalize_metric(&raw).unwrap();
        assert_eq!(m.latency_ms, 42.5);
        assert_eq!(m.uptime_pct, 99.9);
    }

    #[test]
    fn test_percentages_clamped() {
        let raw = json!({
            "node_id": "probe-1",
            "latency_ms": 10.0,
            "uptime_pct": 250.0,
            "packet_loss": -3.0,
            "timestamp": "2026-01-15T10:30:00Z"
        });
        let m = normalize_metric(&raw).unwrap();
        assert_eq!(m.uptime_pct, 100.0);
        assert_eq!(m.packet_loss, 0.0);
    }

    #[test]
    fn test_country_uppercased_and_truncated() {
        let raw = json!({"node_id": "p", "country": "ghana", "timestamp": "2026-01-15T10:30:00Z"});
        let m = normalize_metric(&raw).unwrap();
        assert_eq!(m.country, "GH");
    }

    #[test]
    fn test_missing_timestamp_defaults_to_now() {
        let before = Utc::now();
        let m = normalize_metric(&json!({"node_id": "p"})).unwrap();
        assert!(m.timestamp >= before);
    }

    #[test]
    fn test_metadata_numeric_suffixes_coerced() {
        let raw = json!({
            "node_id": "p",
            "metadata": {"cpu_pct": "55.1", "label": "edge"}
        });
        let m = normalize_metric(&raw).unwrap();
        assert_eq!(m.metadata["cpu_pct"], json!(55.1));
        assert_eq!(m.metadata["label"], json!("edge"));
    }

    #[test]
    fn test_unknown_node_fails_validation() {
        let m = normalize_metric(&json!({"latency_ms": 1.0})).unwrap();
        assert!(!validate_normalized(&m));
    }

    #[test]
    fn test_dedup_timestamp_second_precision() {
        let raw = json!({"node_id": "p", "timestamp": "2026-01-15T10:30:00.123456Z"});
        let m = normalize_metric(&raw).unwrap();
        assert_eq!(m.dedup_timestamp(), "2026-01-15T10:30:00");
    }

    #[test]
    fn test_non_object_payload_rejected() {
        assert!(normalize_metric(&json!("not an object")).is_none());
    }
}
