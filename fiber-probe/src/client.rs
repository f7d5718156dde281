// fiber-probe: Federation transport client
// Signed batch submission with retry, backoff, and a per-target circuit
// breaker. One client per upstream target.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fiber_core::{canonical_json, sign_message, signing_message};
use serde_json::Value;
use uuid::Uuid;

use crate::monitor::StatsTracker;

const CIRCUIT_FAILURE_THRESHOLD: u32 = 5;
const CIRCUIT_RESET: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Retry policy for one target.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "RetryPolicy::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryPolicy::default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "RetryPolicy::default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_base_delay_ms() -> u64 {
        500
    }
    fn default_max_delay_ms() -> u64 {
        10_000
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

/// One upstream target from the federation config.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "TargetConfig::default_priority")]
    pub priority: u32,
    #[serde(default = "TargetConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
}

impl TargetConfig {
    fn default_priority() -> u32 {
        99
    }
    fn default_enabled() -> bool {
        true
    }
}

#[derive(Debug)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

/// Transport client for one target.
pub struct FederationClient {
    pub name: String,
    pub url: String,
    pub priority: u32,
    auth_token: String,
    secret: String,
    retry: RetryPolicy,
    stats: Arc<StatsTracker>,
    circuit: Mutex<CircuitState>,
}

impl FederationClient {
    pub fn new(target: &TargetConfig, secret: String, stats: Arc<StatsTracker>) -> Self {
        let auth_token = target
            .token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .unwrap_or_else(|| secret.clone());
        tracing::info!(
            target = %target.name,
            token_present = !auth_token.is_empty(),
            "resolved auth token"
        );
        Self {
            name: target.name.clone(),
            url: target.url.clone(),
            priority: target.priority,
            auth_token,
            secret,
            retry: target.retry.clone().unwrap_or_default(),
            stats,
            circuit: Mutex::new(CircuitState {
                consecutive_failures: 0,
                open_until: None,
            }),
        }
    }

    /// Whether the circuit is currently rejecting pushes. An elapsed reset
    /// window closes the circuit for the next attempt.
    pub fn is_circuit_open(&self) -> bool {
        let Ok(mut circuit) = self.circuit.lock() else {
            return false;
        };
        match circuit.open_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                circuit.open_until = None;
                circuit.consecutive_failures = 0;
                false
            }
            None => false,
        }
    }

    /// Push a batch with signing and retries. Returns delivery success.
    pub async fn push_batch(
        &self,
        http: &reqwest::Client,
        batch: &[Value],
        node_id: &str,
    ) -> bool {
        if self.is_circuit_open() {
            tracing::warn!(target = %self.name, "circuit open, skipping push");
            return false;
        }
        if batch.is_empty() {
            return true;
        }

        let batch_id = Uuid::new_v4().to_string();
        let timestamp = chrono::Utc::now().to_rfc3339();
        let nonce = Uuid::new_v4().to_string();

        let payload = serde_json::json!({
            "node_id": node_id,
            "metrics": batch,
        });
        // The exact signed bytes are sent as the body.
        let body = match canonical_json(&payload) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(target = %self.name, error = %e, "payload serialization failed");
                return false;
            }
        };
        let message = signing_message(&batch_id, &timestamp, &nonce, body.as_bytes());
        let signature = match sign_message(&self.secret, &message) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(target = %self.name, error = %e, "signing failed");
                return false;
            }
        };

        for attempt in 1..=self.retry.max_attempts {
            let request = http
                .post(&self.url)
                .timeout(REQUEST_TIMEOUT)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", self.auth_token))
                .header("X-Batch-ID", &batch_id)
                .header("X-Fiber-Timestamp", &timestamp)
                .header("X-Fiber-Nonce", &nonce)
                .header("X-Fiber-Signature", &signature)
                .body(body.clone());

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if (200..300).contains(&status) {
                        self.record_success(batch.len(), &batch_id);
                        return true;
                    }
                    // 4xx except 408 is non-recoverable for this batch.
                    if (400..500).contains(&status) && status != 408 {
                        let text = resp.text().await.unwrap_or_default();
                        tracing::error!(
                            target = %self.name,
                            batch_id = %batch_id,
                            status,
                            body = %text.chars().take(100).collect::<String>(),
                            "target rejected batch"
                        );
                        return false;
                    }
                    tracing::warn!(
                        target = %self.name,
                        status,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        "push failed"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target = %self.name,
                        error = %e,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        "network error"
                    );
                }
            }

            if attempt < self.retry.max_attempts {
                let delay = (self.retry.base_delay_ms * 2u64.pow(attempt - 1))
                    .min(self.retry.max_delay_ms);
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }

        self.record_failure();
        false
    }

    fn record_success(&self, count: usize, batch_id: &str) {
        self.stats.inc_success();
        if let Ok(mut circuit) = self.circuit.lock() {
            if circuit.open_until.is_some() {
                tracing::info!(target = %self.name, "circuit closed (recovered)");
            }
            circuit.consecutive_failures = 0;
            circuit.open_until = None;
        }
        tracing::info!(target = %self.name, batch_id = %batch_id, count, "pushed metrics");
    }

    fn record_failure(&self) {
        self.stats.inc_error();
        if let Ok(mut circuit) = self.circuit.lock() {
            circuit.consecutive_failures += 1;
            if circuit.consecutive_failures >= CIRCUIT_FAILURE_THRESHOLD {
                circuit.open_until = Some(Instant::now() + CIRCUIT_RESET);
                tracing::error!(
                    target = %self.name,
                    failures = circuit.consecutive_failures,
                    "circuit tripped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(url: String, max_attempts: u32) -> FederationClient {
        let target = TargetConfig {
            name: "test".to_string(),
            url,
            priority: 1,
            enabled: true,
            token_env: None,
            retry: Some(RetryPolicy {
                max_attempts,
                base_delay_ms: 1,
                max_delay_ms: 5,
            }),
        };
        FederationClient::new(&target, "secret".to_string(), Arc::new(StatsTracker::new()))
    }

    fn batch() -> Vec<Value> {
        vec![serde_json::json!({"node_id": "p1", "latency_ms": 10.0})]
    }

    #[tokio::test]
    async fn test_accepted_batch_carries_signature_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/ingest"))
            .and(header_exists("X-Batch-ID"))
            .and(header_exists("X-Fiber-Signature"))
            .and(header_exists("X-Fiber-Timestamp"))
            .and(header_exists("X-Fiber-Nonce"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(format!("{}/api/ingest", server.uri()), 3);
        let http = reqwest::Client::new();
        assert!(client.push_batch(&http, &batch(), "p1").await);
    }

    #[tokio::test]
    async fn test_4xx_is_terminal_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(server.uri(), 3);
        let http = reqwest::Client::new();
        assert!(!client.push_batch(&http, &batch(), "p1").await);
    }

    #[tokio::test]
    async fn test_5xx_retries_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(server.uri(), 3);
        let http = reqwest::Client::new();
        assert!(client.push_batch(&http, &batch(), "p1").await);
    }

    #[tokio::test]
    async fn test_circuit_opens_after_consecutive_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(5)
            .mount(&server)
            .await;

        let client = test_client(server.uri(), 1);
        let http = reqwest::Client::new();
        for _ in 0..5 {
            assert!(!client.push_batch(&http, &batch(), "p1").await);
        }
        assert!(client.is_circuit_open());
        // Short-circuits without another request (mock expects exactly 5).
        assert!(!client.push_batch(&http, &batch(), "p1").await);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_noop_success() {
        let client = test_client("http://localhost:1".to_string(), 1);
        let http = reqwest::Client::new();
        assert!(client.push_batch(&http, &[], "p1").await);
    }
}
