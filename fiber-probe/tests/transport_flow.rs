// Integration: durable buffer feeding the failover transport.
// Metrics are buffered, peeked, delivered to a mock gateway, and only
// acknowledged (deleted) after a successful push.

use std::sync::Arc;
use std::time::Duration;

use fiber_probe::buffer::{BufferConfig, DurableBuffer};
use fiber_probe::client::{FederationClient, RetryPolicy, TargetConfig};
use fiber_probe::failover::{FailoverConfig, FailoverController};
use fiber_probe::monitor::StatsTracker;
use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn make_client(name: &str, url: String, priority: u32) -> Arc<FederationClient> {
    let target = TargetConfig {
        name: name.to_string(),
        url,
        priority,
        enabled: true,
        token_env: None,
        retry: Some(RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }),
    };
    Arc::new(FederationClient::new(
        &target,
        "it-secret".to_string(),
        Arc::new(StatsTracker::new()),
    ))
}

fn fast_failover() -> FailoverConfig {
    FailoverConfig {
        stickiness: Duration::from_secs(120),
        promotion_threshold: 5,
        push_timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(4),
    }
}

#[tokio::test]
async fn buffered_metrics_survive_until_delivery() {
    let dir = tempdir().unwrap();
    let buffer = DurableBuffer::open(&BufferConfig {
        path: dir.path().join("buffer.db").display().to_string(),
        max_bytes: 1024 * 1024,
        evict_fraction: 0.10,
    })
    .await
    .unwrap();

    for i in 0..3 {
        assert!(
            buffer
                .push(&json!({
                    "node_id": "probe-it-1",
                    "country": "GH",
                    "region": "Accra",
                    "latency_ms": 40.0 + i as f64,
                    "uptime_pct": 99.0,
                    "packet_loss": 0.0,
                    "timestamp": "2026-01-15T10:30:00Z",
                }))
                .await
        );
    }

    let gateway = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/ingest"))
        .and(header_exists("X-Fiber-Signature"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&gateway)
        .await;

    let controller = FailoverController::new(
        vec![make_client("central", format!("{}/api/ingest", gateway.uri()), 1)],
        fast_failover(),
    );

    let items = buffer.peek_batch(50).await.unwrap();
    assert_eq!(items.len(), 3);
    // Peek keeps rows around until the push is acknowledged.
    assert_eq!(buffer.depth().await.unwrap(), 3);

    let ids: Vec<i64> = items.iter().map(|i| i.id).collect();
    let payloads: Vec<serde_json::Value> = items.into_iter().map(|i| i.data).collect();

    let http = reqwest::Client::new();
    let (ok, target) = controller.push(&http, &payloads, "probe-it-1").await;
    assert!(ok);
    assert_eq!(target.as_deref(), Some("central"));

    buffer.acknowledge(&ids).await.unwrap();
    assert_eq!(buffer.depth().await.unwrap(), 0);
}

#[tokio::test]
async fn failed_delivery_keeps_items_queued() {
    let dir = tempdir().unwrap();
    let buffer = DurableBuffer::open(&BufferConfig {
        path: dir.path().join("buffer.db").display().to_string(),
        max_bytes: 1024 * 1024,
        evict_fraction: 0.10,
    })
    .await
    .unwrap();

    buffer.push(&json!({"node_id": "probe-it-2"})).await;

    let controller = FailoverController::new(
        vec![make_client("dead", "http://localhost:1".to_string(), 1)],
        fast_failover(),
    );

    let items = buffer.peek_batch(50).await.unwrap();
    let payloads: Vec<serde_json::Value> = items.into_iter().map(|i| i.data).collect();

    let http = reqwest::Client::new();
    let (ok, _) = controller.push(&http, &payloads, "probe-it-2").await;
    assert!(!ok);

    // No acknowledgement: the metric stays durable for the next attempt.
    assert_eq!(buffer.depth().await.unwrap(), 1);
}
