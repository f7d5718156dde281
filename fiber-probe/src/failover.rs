// fiber-probe: Failover controller with stickiness
// Priority-ordered targets, per-target timeout, jittered exponential
// backoff, monotonic-clock stickiness so a wall-clock jump cannot trigger
// premature promotion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::client::FederationClient;

/// Tunables. Defaults match production behavior; tests shrink them.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub stickiness: Duration,
    pub promotion_threshold: u32,
    pub push_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            stickiness: Duration::from_secs(120),
            promotion_threshold: 5,
            push_timeout: Duration::from_secs(10),
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct FailoverState {
    active_index: usize,
    cooldown_until: Option<Instant>,
    consecutive_successes: u32,
    consecutive_failures: u32,
    backoff: Duration,
}

/// Priority-based failover across upstream targets.
pub struct FailoverController {
    clients: Vec<Arc<FederationClient>>,
    config: FailoverConfig,
    state: Mutex<FailoverState>,
}

impl FailoverController {
    pub fn new(mut clients: Vec<Arc<FederationClient>>, config: FailoverConfig) -> Self {
        clients.sort_by_key(|c| c.priority);
        tracing::info!(targets = clients.len(), "failover controller initialized");
        for (i, c) in clients.iter().enumerate() {
            tracing::info!(index = i, target = %c.name, priority = c.priority, "  target");
        }
        let initial_backoff = config.initial_backoff;
        Self {
            clients,
            config,
            state: Mutex::new(FailoverState {
                active_index: 0,
                cooldown_until: None,
                consecutive_successes: 0,
                consecutive_failures: 0,
                backoff: initial_backoff,
            }),
        }
    }

    /// Push through the active target, falling back across the rest in
    /// priority order. Returns `(success, active_target_name)`.
    pub async fn push(
        &self,
        http: &reqwest::Client,
        batch: &[Value],
        node_id: &str,
    ) -> (bool, Option<String>) {
        if self.clients.is_empty() {
            tracing::error!("no targets configured");
            return (false, None);
        }

        let mut state = self.state.lock().await;
        let active = Arc::clone(&self.clients[state.active_index]);

        if self.try_push(&active, http, batch, node_id).await {
            self.record_success(&mut state);
            return (true, Some(active.name.clone()));
        }

        state.consecutive_failures += 1;
        state.consecutive_successes = 0;

        // Jittered backoff before probing the fallbacks.
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let delay = state.backoff.mul_f64(jitter);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "backoff before fallback");
        tokio::time::sleep(delay).await;
        state.backoff = (state.backoff * 2).min(self.config.max_backoff);

        let active_index = state.active_index;
        for (i, client) in self.clients.iter().enumerate() {
            if i == active_index {
                continue;
            }
            if self.try_push(client, http, batch, node_id).await {
                self.failover_to(&mut state, i);
                return (true, Some(client.name.clone()));
            }
        }

        tracing::error!("all targets failed");
        (false, None)
    }

    async fn try_push(
        &self,
        client: &FederationClient,
        http: &reqwest::Client,
        batch: &[Value],
        node_id: &str,
    ) -> bool {
        match tokio::time::timeout(
            self.config.push_timeout,
            client.push_batch(http, batch, node_id),
        )
        .await
        {
            Ok(ok) => ok,
            Err(_) => {
                tracing::warn!(
                    target = %client.name,
                    timeout_sec = self.config.push_timeout.as_secs(),
                    "push timed out"
                );
                false
            }
        }
    }

    fn record_success(&self, state: &mut FailoverState) {
        state.consecutive_successes += 1;
        state.consecutive_failures = 0;
        state.backoff = self.config.initial_backoff;

        let past_cooldown = state
            .cooldown_until
            .map(|t| Instant::now() >= t)
            .unwrap_or(true);
        if state.active_index > 0
            && state.consecutive_successes >= self.config.promotion_threshold
            && past_cooldown
        {
            let from = self.clients[state.active_index].name.clone();
            state.active_index = 0;
            state.consecutive_successes = 0;
            tracing::info!(
                from_target = %from,
                to_target = %self.clients[0].name,
                "promotion back to primary"
            );
        }
    }

    fn failover_to(&self, state: &mut FailoverState, new_index: usize) {
        let from = self.clients[state.active_index].name.clone();
        state.active_index = new_index;
        state.cooldown_until = Some(Instant::now() + self.config.stickiness);
        state.consecutive_successes = 0;
        state.backoff = self.config.initial_backoff;
        tracing::warn!(
            from_target = %from,
            to_target = %self.clients[new_index].name,
            stickiness_sec = self.config.stickiness.as_secs(),
            "failover"
        );
    }

    pub async fn active_target(&self) -> Option<String> {
        let state = self.state.lock().await;
        self.clients
            .get(state.active_index)
            .map(|c| c.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{RetryPolicy, TargetConfig};
    use crate::monitor::StatsTracker;
    use wiremock::matchers::method;
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
            "secret".to_string(),
            Arc::new(StatsTracker::new()),
        ))
    }

    fn fast_config() -> FailoverConfig {
        FailoverConfig {
            stickiness: Duration::from_secs(120),
            promotion_threshold: 2,
            push_timeout: Duration::from_secs(2),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    fn batch() -> Vec<Value> {
        vec![serde_json::json!({"node_id": "p1"})]
    }

    #[tokio::test]
    async fn test_primary_success_stays_on_primary() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&primary)
            .await;

        let controller = FailoverController::new(
            vec![
                make_client("primary", primary.uri(), 1),
                make_client("secondary", "http://localhost:1".to_string(), 2),
            ],
            fast_config(),
        );

        let http = reqwest::Client::new();
        let (ok, target) = controller.push(&http, &batch(), "p1").await;
        assert!(ok);
        assert_eq!(target.as_deref(), Some("primary"));
    }

    #[tokio::test]
    async fn test_failover_switches_and_sticks() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&primary)
            .await;
        let secondary = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&secondary)
            .await;

        let controller = FailoverController::new(
            vec![
                make_client("primary", primary.uri(), 1),
                make_client("secondary", secondary.uri(), 2),
            ],
            fast_config(),
        );

        let http = reqwest::Client::new();
        let (ok, target) = controller.push(&http, &batch(), "p1").await;
        assert!(ok);
        assert_eq!(target.as_deref(), Some("secondary"));

        // Primary recovers immediately, but stickiness (120s of monotonic
        // time) holds the controller on the secondary.
        primary.reset().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&primary)
            .await;

        for _ in 0..5 {
            let (ok, target) = controller.push(&http, &batch(), "p1").await;
            assert!(ok);
            assert_eq!(target.as_deref(), Some("secondary"));
        }
        assert_eq!(controller.active_target().await.as_deref(), Some("secondary"));
    }

    #[tokio::test]
    async fn test_promotion_after_cooldown_and_streak() {
        let primary = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&primary)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&primary)
            .await;
        let secondary = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(202))
            .mount(&secondary)
            .await;

        let mut config = fast_config();
        config.stickiness = Duration::from_millis(10);
        let controller = FailoverController::new(
            vec![
                make_client("primary", primary.uri(), 1),
                make_client("secondary", secondary.uri(), 2),
            ],
            config,
        );

        let http = reqwest::Client::new();
        // First push fails over to the secondary.
        let (_, target) = controller.push(&http, &batch(), "p1").await;
        assert_eq!(target.as_deref(), Some("secondary"));

        // After the (shrunk) cooldown and a success streak, the controller
        // promotes back to index 0.
        tokio::time::sleep(Duration::from_millis(20)).await;
        for _ in 0..2 {
            controller.push(&http, &batch(), "p1").await;
        }
        assert_eq!(controller.active_target().await.as_deref(), Some("primary"));
    }

    #[tokio::test]
    async fn test_all_targets_down_reports_failure() {
        let controller = FailoverController::new(
            vec![
                make_client("a", "http://localhost:1".to_string(), 1),
                make_client("b", "http://localhost:2".to_string(), 2),
            ],
            fast_config(),
        );
        let http = reqwest::Client::new();
        let (ok, target) = controller.push(&http, &batch(), "p1").await;
        assert!(!ok);
        assert!(target.is_none());
    }
}
