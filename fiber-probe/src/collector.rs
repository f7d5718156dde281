// fiber-probe: Metric collection
// Synthetic latency/loss probes plus host load sampled from /proc. On
// non-Linux hosts the resource readings degrade to zero.

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};
use std::time::Duration;

/// Round-trip latency measurement in milliseconds.
pub async fn measure_latency() -> f64 {
    let (pause_ms, latency) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(20..100), rng.gen_range(20.0..150.0))
    };
    tokio::time::sleep(Duration::from_millis(pause_ms)).await;
    latency
}

/// Packet loss percentage; most samples are clean.
pub async fn measure_packet_loss() -> f64 {
    let mut rng = rand::thread_rng();
    if rng.gen::<f64>() > 0.95 {
        rng.gen_range(1.0..5.0)
    } else {
        0.0
    }
}

/// 1-minute load average scaled to an approximate cpu percentage.
pub fn cpu_percent() -> f64 {
    let Ok(contents) = std::fs::read_to_string("/proc/loadavg") else {
        return 0.0;
    };
    let load1 = contents
        .split_whitespace()
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .unwrap_or(0.0);
    let cpus = num_cpus::get().max(1) as f64;
    (load1 / cpus * 100.0).min(100.0)
}

/// Memory usage percentage from /proc/meminfo.
pub fn memory_percent() -> f64 {
    let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else {
        return 0.0;
    };
    let mut total = 0.0;
    let mut available = 0.0;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest
                .split_whitespace()
                .next()
                .and_then(|s| s.parse::<f64>().ok())
                .unwrap_or(0.0);
        }
    }
    if total <= 0.0 {
        return 0.0;
    }
    ((total - available) / total * 100.0).clamp(0.0, 100.0)
}

/// Self-reported uptime derived from host load.
pub fn system_uptime_pct() -> f64 {
    (100.0 - cpu_percent() / 10.0).max(0.0)
}

/// One full measurement cycle.
pub async fn collect_metric(node_id: &str, country: &str, region: &str) -> Value {
    let latency = measure_latency().await;
    let packet_loss = measure_packet_loss().await;
    let uptime = system_uptime_pct();

    json!({
        "node_id": node_id,
        "country": country,
        "region": region,
        "latency_ms": (latency * 100.0).round() / 100.0,
        "uptime_pct": (uptime * 100.0).round() / 100.0,
        "packet_loss": (packet_loss * 100.0).round() / 100.0,
        "timestamp": Utc::now().to_rfc3339(),
        "metadata": {
            "cpu_percent": cpu_percent(),
            "memory_percent": memory_percent(),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collected_metric_shape() {
        let m = collect_metric("probe-1", "GH", "Accra").await;
        assert_eq!(m["node_id"], "probe-1");
        assert_eq!(m["country"], "GH");
        let latency = m["latency_ms"].as_f64().unwrap();
        assert!((20.0..=150.0).contains(&latency));
        let uptime = m["uptime_pct"].as_f64().unwrap();
        assert!((0.0..=100.0).contains(&uptime));
        assert!(m["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_resource_readings_bounded() {
        assert!((0.0..=100.0).contains(&cpu_percent()));
        assert!((0.0..=100.0).contains(&memory_percent()));
        assert!((0.0..=100.0).contains(&system_uptime_pct()));
    }
}
