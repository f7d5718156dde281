// fiber-etl: Worker loop
// One iteration, one batch. Errors never surface to a caller: log, count,
// audit, move on. A poisoned row fails its own row; the batch continues.

use std::collections::HashSet;

use chrono::Utc;
use fiber_core::{normalize_metric, trace::generate_trace_id, validate_normalized, NormalizedMetric};
use fiber_store::kv::ETL_QUEUE_KEY;
use fiber_store::{tsdb, Db, Kv};
use tracing::Instrument;

use crate::alerts::AlertEngine;
use crate::analytics::AnalyticsEngine;
use crate::config::EtlConfig;
use crate::metrics::BatchMetrics;

/// ETL worker. Replicas compete over the shared queue; the atomic pop is
/// the only serialization between them.
const INSERT_BACKOFF_INITIAL: std::time::Duration = std::time::Duration::from_millis(500);
const INSERT_BACKOFF_MAX: std::time::Duration = std::time::Duration::from_secs(30);

pub struct EtlWorker {
    kv: Kv,
    db: Db,
    alert_engine: AlertEngine,
    analytics: AnalyticsEngine,
    metrics: BatchMetrics,
    config: EtlConfig,
    insert_failed: bool,
    insert_backoff: std::time::Duration,
}

impl EtlWorker {
    pub fn new(
        kv: Kv,
        db: Db,
        alert_engine: AlertEngine,
        analytics: AnalyticsEngine,
        config: EtlConfig,
    ) -> Self {
        Self {
            kv,
            db,
            alert_engine,
            analytics,
            metrics: BatchMetrics::new(),
            config,
            insert_failed: false,
            insert_backoff: INSERT_BACKOFF_INITIAL,
        }
    }

    /// Drain the queue forever. Sleeps when the queue is empty, and backs
    /// off progressively while the store keeps rejecting bulk inserts
    /// (heartbeat lag surfaces the stall via /status).
    pub async fn run(mut self) {
        tracing::info!("ETL worker loop started");
        loop {
            let processed = self.process_batch().await;
            if self.insert_failed {
                tracing::warn!(
                    backoff_ms = self.insert_backoff.as_millis() as u64,
                    "store rejecting inserts, backing off"
                );
                tokio::time::sleep(self.insert_backoff).await;
                self.insert_backoff = (self.insert_backoff * 2).min(INSERT_BACKOFF_MAX);
            } else {
                self.insert_backoff = INSERT_BACKOFF_INITIAL;
                if processed == 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(
                        self.config.idle_sleep_ms,
                    ))
                    .await;
                }
            }
        }
    }

    /// Process one batch. Returns the number of queue entries consumed.
    pub async fn process_batch(&mut self) -> usize {
        let raw = match self.kv.batch_pop(ETL_QUEUE_KEY, self.config.batch_size).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!(error = %e, "queue batch pop failed");
                return 0;
            }
        };
        if raw.is_empty() {
            return 0;
        }

        // Trace context is inherited from the first payload in the batch.
        let trace_id = raw
            .first()
            .and_then(|msg| serde_json::from_str::<serde_json::Value>(msg).ok())
            .and_then(|v| {
                v.get("_meta")
                    .and_then(|m| m.get("trace_id"))
                    .and_then(|t| t.as_str().map(str::to_string))
            })
            .unwrap_or_else(generate_trace_id);
        let span = tracing::info_span!("etl_process_batch", trace_id = %trace_id);

        let count = raw.len();
        async {
            self.metrics.start_batch();

            let valid = self.parse_and_validate(&raw);
            if valid.is_empty() {
                return;
            }

            let cleaned = if self.config.dedup_enabled {
                self.dedupe(valid).await
            } else {
                valid
            };
            if cleaned.is_empty() {
                return;
            }

            self.fan_out(&cleaned).await;
            self.ensure_nodes_cached(&cleaned).await;
            self.insert_batch(&cleaned).await;

            let distinct: HashSet<&str> = cleaned.iter().map(|m| m.node_id.as_str()).collect();
            self.metrics.set_active_probes(distinct.len());

            self.finish_batch().await;
        }
        .instrument(span)
        .await;

        count
    }

    fn parse_and_validate(&mut self, raw: &[String]) -> Vec<NormalizedMetric> {
        let mut valid = Vec::with_capacity(raw.len());
        for msg in raw {
            let parsed = serde_json::from_str::<serde_json::Value>(msg)
                .ok()
                .and_then(|v| normalize_metric(&v));
            match parsed {
                Some(metric) if validate_normalized(&metric) => valid.push(metric),
                _ => self.metrics.record_row(false),
            }
        }
        valid
    }

    async fn dedupe(&mut self, batch: Vec<NormalizedMetric>) -> Vec<NormalizedMetric> {
        let keys: Vec<String> = batch
            .iter()
            .map(|m| format!("dedup:{}:{}", m.node_id, m.dedup_timestamp()))
            .collect();
        let flags = match self.kv.set_nx_ex_many(&keys, self.config.dedup_ttl_sec).await {
            Ok(flags) => flags,
            Err(e) => {
                tracing::warn!(error = %e, "dedup check failed, passing batch through");
                return batch;
            }
        };

        let mut cleaned = Vec::with_capacity(batch.len());
        let mut duplicates = 0u64;
        for (metric, is_new) in batch.into_iter().zip(flags) {
            if is_new {
                cleaned.push(metric);
            } else {
                duplicates += 1;
                self.metrics.record_duplicate();
            }
        }
        if duplicates > 0 {
            tracing::debug!(duplicates, "deduped metrics from batch");
        }
        cleaned
    }

    /// Alerting and analytics, asynchronous with respect to the primary
    /// insert. Failures are logged and swallowed.
    async fn fan_out(&mut self, batch: &[NormalizedMetric]) {
        for metric in batch {
            if let Err(e) = self.alert_engine.process(metric).await {
                tracing::warn!(node_id = %metric.node_id, error = %e, "alert engine hook failed");
            }
            match self.analytics.compute(metric).await {
                Ok(computed) => {
                    if let Err(e) = tsdb::insert_aggregated(
                        &self.db,
                        metric,
                        computed.latency_avg_window,
                        computed.latency_std_window,
                        computed.packet_loss_spike,
                        computed.anomaly_score,
                    )
                    .await
                    {
                        tracing::warn!(node_id = %metric.node_id, error = %e, "analytics insert failed");
                    }
                }
                Err(e) => {
                    tracing::warn!(node_id = %metric.node_id, error = %e, "analytics hook failed");
                }
            }
        }
    }

    /// Known-node set lives in the kv-store; misses upsert the node shell
    /// and join the set. Metadata failures never fail the batch.
    async fn ensure_nodes_cached(&mut self, batch: &[NormalizedMetric]) {
        let mut seen = HashSet::new();
        let node_ids: Vec<String> = batch
            .iter()
            .filter(|m| seen.insert(m.node_id.clone()))
            .map(|m| m.node_id.clone())
            .collect();

        let misses: Vec<String> = if self.config.node_cache_enabled {
            match self.kv.nodes_cached(&node_ids).await {
                Ok(flags) => node_ids
                    .iter()
                    .zip(flags)
                    .filter(|(_, cached)| !cached)
                    .map(|(id, _)| id.clone())
                    .collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "node cache check failed, upserting all");
                    node_ids.clone()
                }
            }
        } else {
            node_ids.clone()
        };
        if misses.is_empty() {
            return;
        }

        // First occurrence of each new node carries its metadata.
        let mut to_insert = Vec::new();
        for miss in &misses {
            if let Some(m) = batch.iter().find(|m| &m.node_id == miss) {
                to_insert.push((m.node_id.clone(), m.country.clone(), m.region.clone()));
            }
        }

        if let Err(e) = tsdb::upsert_observed_nodes(&self.db, &to_insert).await {
            tracing::error!(error = %e, "failed to upsert nodes");
            return;
        }
        if self.config.node_cache_enabled {
            if let Err(e) = self.kv.cache_nodes(&misses).await {
                tracing::warn!(error = %e, "failed to update node cache set");
            }
        }
    }

    /// Bulk insert through COPY inside a transaction; on a duplicate key the
    /// whole batch falls back to audited per-row inserts.
    async fn insert_batch(&mut self, batch: &[NormalizedMetric]) {
        self.insert_failed = false;
        if !self.config.use_copy {
            self.insert_rows_legacy(batch).await;
            return;
        }

        let mut tx = match self.db.pool().begin().await {
            Ok(tx) => tx,
            Err(e) => {
                tracing::error!(error = %e, "failed to open insert transaction");
                self.insert_failed = true;
                for _ in batch {
                    self.metrics.record_row(false);
                }
                return;
            }
        };

        match tsdb::copy_insert_metrics(&mut tx, batch).await {
            Ok(rows) => match tx.commit().await {
                Ok(()) => self.metrics.record_rows(rows),
                Err(e) => {
                    tracing::error!(error = %e, "insert commit failed");
                    self.insert_failed = true;
                    for _ in batch {
                        self.metrics.record_row(false);
                    }
                }
            },
            Err(e) if e.is_unique_violation() => {
                let _ = tx.rollback().await;
                tracing::warn!("batch contains duplicates, falling back to audit mode");
                self.insert_rows_audited(batch).await;
            }
            Err(e) => {
                let _ = tx.rollback().await;
                tracing::error!(error = %e, "bulk copy failed");
                self.insert_failed = true;
                for _ in batch {
                    self.metrics.record_row(false);
                }
            }
        }
    }

    /// Row-by-row with conflict audit: a suppressed insert writes the second
    /// arrival into `metric_conflicts` instead of dropping it silently.
    async fn insert_rows_audited(&mut self, batch: &[NormalizedMetric]) {
        for metric in batch {
            match tsdb::insert_metric_row(&self.db, metric).await {
                Ok(true) => self.metrics.record_row(true),
                Ok(false) => {
                    self.metrics.record_duplicate();
                    match tsdb::record_conflict(&self.db, metric).await {
                        Ok(()) => {
                            tracing::info!(node_id = %metric.node_id, "audited conflict")
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "conflict audit failed")
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(node_id = %metric.node_id, error = %e, "row insert failed");
                    self.metrics.record_row(false);
                }
            }
        }
    }

    /// Legacy path without COPY: conflict-suppressed row inserts.
    async fn insert_rows_legacy(&mut self, batch: &[NormalizedMetric]) {
        for metric in batch {
            match tsdb::insert_metric_row(&self.db, metric).await {
                Ok(_) => self.metrics.record_row(true),
                Err(e) => {
                    tracing::error!(node_id = %metric.node_id, error = %e, "row insert failed");
                    self.metrics.record_row(false);
                }
            }
        }
    }

    async fn finish_batch(&mut self) {
        let summary = self.metrics.summary();
        if summary.rows_processed > 0 || summary.duplicate_count > 0 {
            tracing::info!(
                event = "ETL_BATCH_COMPLETE",
                rows_processed = summary.rows_processed,
                rows_failed = summary.rows_failed,
                duplicate_count = summary.duplicate_count,
                active_probes = summary.active_probes,
                duration_ms = summary.duration_ms,
                error_rate = summary.error_rate,
                "batch complete"
            );
        }

        let fields = [
            ("last_processed_ts", Utc::now().to_rfc3339()),
            ("last_batch_size", summary.rows_processed.to_string()),
            ("error_rate", summary.error_rate.to_string()),
        ];
        if let Err(e) = self.kv.set_status_fields(&fields).await {
            tracing::warn!(error = %e, "status update failed");
        }
    }
}

/// Liveness heartbeat, independent of queue activity.
pub async fn heartbeat_loop(kv: Kv) {
    tracing::info!("heartbeat loop started");
    loop {
        let fields = [("last_heartbeat_ts", Utc::now().to_rfc3339())];
        if let Err(e) = kv.set_status_fields(&fields).await {
            tracing::warn!(error = %e, "heartbeat write failed");
        }
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    }
}
