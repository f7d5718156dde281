// fiber-etl: Alert engine
// Threshold rules over incoming metrics, kv-backed dedup and quotas, and
// dispatch with retry falling through to a dead-letter queue.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use fiber_core::secrets::env_or;
use fiber_core::NormalizedMetric;
use fiber_store::Kv;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::{EtlError, EtlResult};

const DISPATCH_ATTEMPTS: u32 = 3;
const DISPATCH_BACKOFF_MIN: Duration = Duration::from_secs(2);
const DISPATCH_BACKOFF_MAX: Duration = Duration::from_secs(10);
/// Burst capacity of the global bucket.
const GLOBAL_BUCKET_CAPACITY: i64 = 10;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// An emitted alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub alert_id: String,
    pub node_id: String,
    pub severity: Severity,
    pub metric_name: String,
    pub value: f64,
    pub threshold: f64,
    pub timestamp: String,
    pub message: String,
}

impl Alert {
    /// Dedup key: one live alert per node/metric/severity.
    pub fn dedup_key(&self) -> String {
        format!(
            "alert:dedup:{}:{}:{}",
            self.node_id,
            self.metric_name,
            self.severity.as_str()
        )
    }
}

/// Comparison operator for threshold rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Gt,
    Lt,
}

/// A single threshold comparison.
#[derive(Debug, Clone)]
pub struct ThresholdRule {
    pub metric_key: &'static str,
    pub op: Op,
    pub threshold: f64,
    pub severity: Severity,
    pub template: &'static str,
}

impl ThresholdRule {
    fn metric_value(&self, metric: &NormalizedMetric) -> Option<f64> {
        match self.metric_key {
            "latency_ms" => Some(metric.latency_ms),
            "packet_loss" => Some(metric.packet_loss),
            "uptime_pct" => Some(metric.uptime_pct),
            _ => None,
        }
    }

    pub fn evaluate(&self, metric: &NormalizedMetric) -> Option<Alert> {
        let value = self.metric_value(metric)?;
        let triggered = match self.op {
            Op::Gt => value > self.threshold,
            Op::Lt => value < self.threshold,
        };
        if !triggered {
            return None;
        }
        let message = self
            .template
            .replace("{id}", &metric.node_id)
            .replace("{val}", &format!("{:.2}", value))
            .replace("{limit}", &format!("{}", self.threshold));
        Some(Alert {
            alert_id: Uuid::new_v4().to_string(),
            node_id: metric.node_id.clone(),
            severity: self.severity,
            metric_name: self.metric_key.to_string(),
            value,
            threshold: self.threshold,
            timestamp: Utc::now().to_rfc3339(),
            message,
        })
    }
}

/// Rule variants. Only threshold comparisons exist today; the enum keeps
/// the evaluation dispatch closed and explicit.
#[derive(Debug, Clone)]
pub enum AlertRule {
    Threshold(ThresholdRule),
}

impl AlertRule {
    pub fn evaluate(&self, metric: &NormalizedMetric) -> Option<Alert> {
        match self {
            AlertRule::Threshold(rule) => rule.evaluate(metric),
        }
    }
}

/// Alerting configuration, env-tunable thresholds.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub latency_warn: f64,
    pub latency_crit: f64,
    pub loss_warn: f64,
    pub loss_crit: f64,
    pub uptime_warn: f64,
    pub cooldown_sec: u64,
    pub node_rate_limit: i64,
    pub global_rate_limit: i64,
    pub webhook_url: Option<String>,
}

impl AlertConfig {
    pub fn from_env() -> Self {
        Self {
            latency_warn: env_or("ALERT_LATENCY_WARN", "200.0").parse().unwrap_or(200.0),
            latency_crit: env_or("ALERT_LATENCY_CRIT", "500.0").parse().unwrap_or(500.0),
            loss_warn: env_or("ALERT_LOSS_WARN", "1.0").parse().unwrap_or(1.0),
            loss_crit: env_or("ALERT_LOSS_CRIT", "5.0").parse().unwrap_or(5.0),
            uptime_warn: env_or("ALERT_UPTIME_WARN", "95.0").parse().unwrap_or(95.0),
            cooldown_sec: env_or("ALERT_LOOP_COOLDOWN_SEC", "900").parse().unwrap_or(900),
            node_rate_limit: env_or("ALERT_NODE_RATE_LIMIT", "5").parse().unwrap_or(5),
            global_rate_limit: env_or("ALERT_GLOBAL_RATE_LIMIT", "100").parse().unwrap_or(100),
            webhook_url: std::env::var("ALERT_WEBHOOK_URL").ok().filter(|s| !s.is_empty()),
        }
    }

    pub fn default_rules(&self) -> Vec<AlertRule> {
        vec![
            AlertRule::Threshold(ThresholdRule {
                metric_key: "latency_ms",
                op: Op::Gt,
                threshold: self.latency_crit,
                severity: Severity::Critical,
                template: "CRITICAL LATENCY on {id}: {val}ms",
            }),
            AlertRule::Threshold(ThresholdRule {
                metric_key: "latency_ms",
                op: Op::Gt,
                threshold: self.latency_warn,
                severity: Severity::Warning,
                template: "High Latency on {id}: {val}ms",
            }),
            AlertRule::Threshold(ThresholdRule {
                metric_key: "packet_loss",
                op: Op::Gt,
                threshold: self.loss_crit,
                severity: Severity::Critical,
                template: "CRITICAL PACKET LOSS on {id}: {val}%",
            }),
            AlertRule::Threshold(ThresholdRule {
                metric_key: "packet_loss",
                op: Op::Gt,
                threshold: self.loss_warn,
                severity: Severity::Warning,
                template: "Packet Loss Detected on {id}: {val}%",
            }),
            AlertRule::Threshold(ThresholdRule {
                metric_key: "uptime_pct",
                op: Op::Lt,
                threshold: self.uptime_warn,
                severity: Severity::Warning,
                template: "Low Uptime on {id}: {val}%",
            }),
        ]
    }
}

/// Dispatch sink for alerts.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn dispatch(&self, alert: &Alert) -> EtlResult<()>;
}

/// Log-only dispatcher, the default when no webhook is configured.
pub struct LogDispatcher;

#[async_trait]
impl AlertDispatcher for LogDispatcher {
    async fn dispatch(&self, alert: &Alert) -> EtlResult<()> {
        tracing::warn!(
            alert_id = %alert.alert_id,
            node_id = %alert.node_id,
            severity = alert.severity.as_str(),
            metric = %alert.metric_name,
            value = alert.value,
            message = %alert.message,
            "alert fired"
        );
        Ok(())
    }
}

/// Webhook dispatcher with Slack-style block payloads.
pub struct WebhookDispatcher {
    url: String,
    http: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(url: String) -> Self {
        Self {
            url,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl AlertDispatcher for WebhookDispatcher {
    async fn dispatch(&self, alert: &Alert) -> EtlResult<()> {
        let color = match alert.severity {
            Severity::Critical => "#EF4444",
            Severity::Warning => "#F59E0B",
        };
        let payload = json!({
            "attachments": [{
                "color": color,
                "blocks": [
                    {
                        "type": "section",
                        "text": {
                            "type": "mrkdwn",
                            "text": format!("*{}*: {}", alert.severity.as_str().to_uppercase(), alert.message)
                        }
                    },
                    {
                        "type": "context",
                        "elements": [{
                            "type": "mrkdwn",
                            "text": format!("Node: `{}` | Time: {}", alert.node_id, alert.timestamp)
                        }]
                    }
                ]
            }]
        });

        let resp = self
            .http
            .post(&self.url)
            .timeout(Duration::from_secs(5))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EtlError::Dispatch(e.to_string()))?;
        if resp.status().as_u16() >= 400 {
            return Err(EtlError::Dispatch(format!("HTTP {}", resp.status())));
        }
        Ok(())
    }
}

/// Evaluates rules and shepherds alerts through dedup, quotas, and dispatch.
pub struct AlertEngine {
    kv: Kv,
    dispatcher: Box<dyn AlertDispatcher>,
    rules: Vec<AlertRule>,
    config: AlertConfig,
}

impl AlertEngine {
    pub fn new(kv: Kv, dispatcher: Box<dyn AlertDispatcher>, config: AlertConfig) -> Self {
        let rules = config.default_rules();
        Self {
            kv,
            dispatcher,
            rules,
            config,
        }
    }

    /// Evaluate one metric. Never fatal to the batch: every error path is
    /// logged and swallowed by the caller.
    pub async fn process(&self, metric: &NormalizedMetric) -> EtlResult<()> {
        for rule in &self.rules {
            let Some(alert) = rule.evaluate(metric) else {
                continue;
            };

            if self.is_duplicate(&alert).await? {
                tracing::debug!(key = %alert.dedup_key(), "alert deduped");
                continue;
            }
            if !self.check_rate_limits(&alert).await? {
                continue;
            }

            if let Err(e) = self.dispatch_with_retry(&alert).await {
                tracing::error!(alert_id = %alert.alert_id, error = %e, "dispatch exhausted, sending to DLQ");
                self.send_to_dlq(&alert).await?;
            }
        }
        Ok(())
    }

    async fn is_duplicate(&self, alert: &Alert) -> EtlResult<bool> {
        let was_set = self
            .kv
            .set_nx_ex(&alert.dedup_key(), self.config.cooldown_sec)
            .await?;
        Ok(!was_set)
    }

    async fn check_rate_limits(&self, alert: &Alert) -> EtlResult<bool> {
        // Per-node fixed-window quota.
        let node_key = format!("alerts:quota:node:{}", alert.node_id);
        let count = self.kv.incr_fixed_window(&node_key, 3600).await?;
        if count > self.config.node_rate_limit {
            tracing::debug!(node_id = %alert.node_id, count, "alert dropped by node quota");
            return Ok(false);
        }

        // Global token bucket, refilled at the hourly limit spread per second.
        let refill = self.config.global_rate_limit as f64 / 3600.0;
        if !self
            .kv
            .alert_bucket_take(refill, GLOBAL_BUCKET_CAPACITY)
            .await?
        {
            tracing::debug!("alert dropped by global bucket");
            return Ok(false);
        }

        Ok(true)
    }

    async fn dispatch_with_retry(&self, alert: &Alert) -> EtlResult<()> {
        let mut delay = DISPATCH_BACKOFF_MIN;
        for attempt in 1..=DISPATCH_ATTEMPTS {
            match self.dispatcher.dispatch(alert).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < DISPATCH_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "alert dispatch failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(DISPATCH_BACKOFF_MAX);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn send_to_dlq(&self, alert: &Alert) -> EtlResult<()> {
        let payload = serde_json::to_string(alert)?;
        self.kv.push_dlq(&payload).await?;
        tracing::error!(alert_id = %alert.alert_id, "alert sent to DLQ");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn metric(latency: f64, loss: f64, uptime: f64) -> NormalizedMetric {
        NormalizedMetric {
            node_id: "probe-1".to_string(),
            country: "GH".to_string(),
            region: "Accra".to_string(),
            latency_ms: latency,
            uptime_pct: uptime,
            packet_loss: loss,
            timestamp: Utc::now(),
            metadata: json!({}),
            meta: None,
        }
    }

    fn config() -> AlertConfig {
        AlertConfig {
            latency_warn: 200.0,
            latency_crit: 500.0,
            loss_warn: 1.0,
            loss_crit: 5.0,
            uptime_warn: 95.0,
            cooldown_sec: 900,
            node_rate_limit: 5,
            global_rate_limit: 100,
            webhook_url: None,
        }
    }

    #[test]
    fn test_healthy_metric_fires_nothing() {
        let rules = config().default_rules();
        let m = metric(50.0, 0.0, 99.9);
        assert!(rules.iter().all(|r| r.evaluate(&m).is_none()));
    }

    #[test]
    fn test_critical_latency_fires_both_latency_rules() {
        let rules = config().default_rules();
        let m = metric(600.0, 0.0, 99.9);
        let alerts: Vec<Alert> = rules.iter().filter_map(|r| r.evaluate(&m)).collect();
        assert_eq!(alerts.len(), 2);
        assert!(alerts.iter().any(|a| a.severity == Severity::Critical));
        assert!(alerts.iter().any(|a| a.severity == Severity::Warning));
    }

    #[test]
    fn test_low_uptime_fires_warning() {
        let rules = config().default_rules();
        let m = metric(50.0, 0.0, 90.0);
        let alerts: Vec<Alert> = rules.iter().filter_map(|r| r.evaluate(&m)).collect();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metric_name, "uptime_pct");
    }

    #[test]
    fn test_message_template_renders() {
        let rule = ThresholdRule {
            metric_key: "latency_ms",
            op: Op::Gt,
            threshold: 200.0,
            severity: Severity::Warning,
            template: "High Latency on {id}: {val}ms",
        };
        let alert = rule.evaluate(&metric(321.5, 0.0, 100.0)).unwrap();
        assert_eq!(alert.message, "High Latency on probe-1: 321.50ms");
    }

    #[test]
    fn test_dedup_key_shape() {
        let rules = config().default_rules();
        let alert = rules[0].evaluate(&metric(600.0, 0.0, 100.0)).unwrap();
        assert_eq!(alert.dedup_key(), "alert:dedup:probe-1:latency_ms:critical");
    }

    #[tokio::test]
    async fn test_webhook_dispatcher_posts_blocks() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dispatcher = WebhookDispatcher::new(format!("{}/hook", server.uri()));
        let rules = config().default_rules();
        let alert = rules[0].evaluate(&metric(600.0, 0.0, 100.0)).unwrap();
        assert!(dispatcher.dispatch(&alert).await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_dispatcher_maps_4xx_to_error() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let dispatcher = WebhookDispatcher::new(server.uri());
        let rules = config().default_rules();
        let alert = rules[0].evaluate(&metric(600.0, 0.0, 100.0)).unwrap();
        assert!(dispatcher.dispatch(&alert).await.is_err());
    }
}
