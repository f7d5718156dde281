// fiber-probe: Federation heartbeat
// Periodic POST of the probe's active target so the gateway can render a
// federation overview. Best-effort: failures are logged, never fatal.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;

/// Emit one heartbeat. The gateway stores it with a 60 s TTL, so a silent
/// probe ages out on its own.
pub async fn emit_heartbeat(
    http: &reqwest::Client,
    api_base: &str,
    bearer_token: &str,
    node_id: &str,
    active_target: &str,
) {
    let url = format!("{}/api/probe/heartbeat", api_base.trim_end_matches('/'));
    let payload = json!({
        "node_id": node_id,
        "active_target": active_target,
        "timestamp": Utc::now().to_rfc3339(),
    });

    let result = http
        .post(&url)
        .timeout(Duration::from_secs(5))
        .header("Authorization", format!("Bearer {}", bearer_token))
        .json(&payload)
        .send()
        .await;

    match result {
        Ok(resp) if resp.status().is_success() => {
            tracing::debug!(active_target, "heartbeat sent");
        }
        Ok(resp) => {
            tracing::warn!(status = resp.status().as_u16(), "heartbeat rejected");
        }
        Err(e) => {
            tracing::debug!(error = %e, "heartbeat failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_heartbeat_posts_payload_with_bearer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/probe/heartbeat"))
            .and(header("Authorization", "Bearer fed-secret"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let http = reqwest::Client::new();
        emit_heartbeat(&http, &server.uri(), "fed-secret", "probe-1", "central").await;
    }
}
