// fiber-store: Aggregate query layer
// Window-aware source selection with freshness gates, per-table circuit
// breakers, a dashboard cache, and silent fallback to raw metrics.

pub mod breaker;
pub mod cache;
pub mod selection;

pub use breaker::{BreakerRegistry, BreakerState, TableBreaker};
pub use selection::{select_table, AggregateTable, Dimension};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;

use crate::kv::{Kv, AGGREGATION_DISABLED_KEY};
use crate::tsdb::Db;
use crate::{StoreError, StoreResult};

const QUERY_TIMEOUT_MS: u64 = 5000;
const BREAKER_FAILURE_THRESHOLD: u32 = 5;
const BREAKER_RESET_SEC: u64 = 60;
/// This many simultaneously-open breakers disables aggregation globally.
const AUTO_ROLLBACK_OPEN_BREAKERS: usize = 3;
const AGGREGATION_DISABLED_TTL_SEC: u64 = 300;

/// Query result plus the source actually used, so clients can reason about
/// freshness.
#[derive(Debug, Clone)]
pub struct QueryOutcome<T> {
    pub data: T,
    pub source: String,
    pub window_seconds: i64,
}

/// One row of the aggregated endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedRow {
    pub dimension: String,
    pub avg_latency: f64,
    pub min_latency: f64,
    pub max_latency: f64,
    pub p95_latency: f64,
    pub avg_packet_loss: f64,
    pub reporting_count: i64,
    pub downtime_intervals: i64,
    pub availability_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSummary {
    pub total_nodes: i64,
    pub avg_latency_ms: f64,
    pub avg_uptime_pct: f64,
    pub avg_loss_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionalBreakdown {
    pub region: String,
    pub nodes: i64,
    pub avg_latency: f64,
    pub avg_uptime: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemNode {
    pub node_id: String,
    pub region: String,
    pub score: f64,
    pub avg_latency: f64,
    pub avg_loss: f64,
}

/// Cluster-wide summary with top-N problematic nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterOverview {
    pub time_range: TimeRange,
    pub fleet_summary: FleetSummary,
    pub regional_breakdown: Vec<RegionalBreakdown>,
    pub top_problematic_nodes: Vec<ProblemNode>,
}

/// Aggregate query service. Shared across handlers; holds the breakers and
/// the kv handle, takes the (rebuildable) db handle per call.
pub struct AggregateService {
    kv: Kv,
    breakers: BreakerRegistry,
    query_timeout: Duration,
}

impl AggregateService {
    pub fn new(kv: Kv) -> Self {
        Self {
            kv,
            breakers: BreakerRegistry::new(
                BREAKER_FAILURE_THRESHOLD,
                Duration::from_secs(BREAKER_RESET_SEC),
            ),
            query_timeout: Duration::from_millis(QUERY_TIMEOUT_MS),
        }
    }

    pub fn breaker_states(&self) -> Vec<(String, &'static str)> {
        self.breakers
            .states()
            .into_iter()
            .map(|(t, s)| (t, s.as_str()))
            .collect()
    }

    /// Windowed aggregates grouped by node or region.
    pub async fn query_aggregated(
        &self,
        db: &Db,
        dimension: Dimension,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        prefer_freshness: bool,
    ) -> StoreResult<QueryOutcome<Vec<AggregatedRow>>> {
        let window_seconds = (end - start).num_seconds();
        let ttl = if window_seconds < 600 {
            cache::TTL_REALTIME_SEC
        } else {
            cache::TTL_CLUSTER_SEC
        };

        let key = cache::cache_key(
            "aggregated",
            &serde_json::json!({
                "dim": dimension.as_str(),
                "start": start.to_rfc3339(),
                "end": end.to_rfc3339(),
                "fresh": prefer_freshness,
            }),
        );
        if let Some(hit) = cache::get_cached::<Vec<AggregatedRow>>(&self.kv, &key, ttl).await? {
            return Ok(QueryOutcome {
                data: hit,
                source: "cache".to_string(),
                window_seconds,
            });
        }

        let (table, source) = self
            .resolve_table(db, window_seconds, dimension, prefer_freshness)
            .await;

        let (rows, source) = match self
            .run_aggregated(db, table, dimension, start, end)
            .await
        {
            Ok(rows) => {
                if table.is_aggregate() {
                    self.breakers.get(table.name()).record_success();
                }
                (rows, source)
            }
            Err(e) if table.is_aggregate() => {
                tracing::warn!(table = table.name(), error = %e, "aggregate query failed, falling back to raw");
                self.record_aggregate_failure(table).await;
                let rows = self
                    .run_aggregated(db, AggregateTable::Metrics, dimension, start, end)
                    .await?;
                (rows, "metrics (fallback)".to_string())
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = cache::set_cached(&self.kv, &key, &rows, ttl).await {
            tracing::warn!(error = %e, "dashboard cache write failed");
        }

        Ok(QueryOutcome {
            data: rows,
            source,
            window_seconds,
        })
    }

    /// Fleet summary, regional breakdown, and top-N problematic nodes.
    pub async fn query_cluster(
        &self,
        db: &Db,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        top_n: i64,
    ) -> StoreResult<QueryOutcome<ClusterOverview>> {
        let window_seconds = (end - start).num_seconds();
        let key = cache::cache_key(
            "cluster",
            &serde_json::json!({
                "start": start.to_rfc3339(),
                "end": end.to_rfc3339(),
                "top": top_n,
            }),
        );
        if let Some(hit) =
            cache::get_cached::<ClusterOverview>(&self.kv, &key, cache::TTL_CLUSTER_SEC).await?
        {
            return Ok(QueryOutcome {
                data: hit,
                source: "cache".to_string(),
                window_seconds,
            });
        }

        let (table, source) = self
            .resolve_table(db, window_seconds, Dimension::Node, false)
            .await;

        let (overview, source) = match self.run_cluster(db, table, start, end, top_n).await {
            Ok(o) => {
                if table.is_aggregate() {
                    self.breakers.get(table.name()).record_success();
                }
                (o, source)
            }
            Err(e) if table.is_aggregate() => {
                tracing::warn!(table = table.name(), error = %e, "cluster query failed, falling back to raw");
                self.record_aggregate_failure(table).await;
                let o = self
                    .run_cluster(db, AggregateTable::Metrics, start, end, top_n)
                    .await?;
                (o, "metrics (fallback)".to_string())
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = cache::set_cached(&self.kv, &key, &overview, cache::TTL_CLUSTER_SEC).await {
            tracing::warn!(error = %e, "dashboard cache write failed");
        }

        Ok(QueryOutcome {
            data: overview,
            source,
            window_seconds,
        })
    }

    /// Pick the source table, applying the global rollback flag, the
    /// per-table breaker, and the freshness gate. Staleness is not a breaker
    /// failure.
    async fn resolve_table(
        &self,
        db: &Db,
        window_seconds: i64,
        dimension: Dimension,
        prefer_freshness: bool,
    ) -> (AggregateTable, String) {
        let (table, check_health) = select_table(window_seconds, dimension, prefer_freshness);
        if !table.is_aggregate() {
            return (table, table.name().to_string());
        }

        if self
            .kv
            .flag_set(AGGREGATION_DISABLED_KEY)
            .await
            .unwrap_or(false)
        {
            return (AggregateTable::Metrics, "metrics (fallback)".to_string());
        }

        if check_health {
            match self.aggregate_lag_sec(db, table).await {
                Ok(lag) if lag <= table.max_lag_sec() => {}
                Ok(lag) => {
                    tracing::warn!(table = table.name(), lag_sec = lag, "aggregate stale, using raw metrics");
                    return (AggregateTable::Metrics, "metrics (fallback)".to_string());
                }
                Err(e) => {
                    tracing::warn!(table = table.name(), error = %e, "aggregate health check failed, using raw metrics");
                    return (AggregateTable::Metrics, "metrics (fallback)".to_string());
                }
            }
        }

        // Breaker gate last: a consumed half-open probe slot is always
        // released by the query's success or failure.
        if !self.breakers.get(table.name()).allow() {
            tracing::debug!(table = table.name(), "breaker open, using raw metrics");
            return (AggregateTable::Metrics, "metrics (fallback)".to_string());
        }

        (table, table.name().to_string())
    }

    async fn aggregate_lag_sec(&self, db: &Db, table: AggregateTable) -> StoreResult<i64> {
        let sql = format!(
            "SELECT EXTRACT(EPOCH FROM (now() - MAX({col})))::bigint AS lag FROM {table}",
            col = table.bucket_col(),
            table = table.name(),
        );
        let lag: Option<i64> = sqlx::query_scalar(&sql).fetch_one(db.pool()).await?;
        // An empty view has no freshest bucket at all.
        Ok(lag.unwrap_or(i64::MAX))
    }

    async fn record_aggregate_failure(&self, table: AggregateTable) {
        self.breakers.get(table.name()).record_failure();
        if self.breakers.open_count() >= AUTO_ROLLBACK_OPEN_BREAKERS {
            tracing::error!("multiple aggregate breakers open, disabling aggregation globally");
            if let Err(e) = self
                .kv
                .set_flag(AGGREGATION_DISABLED_KEY, AGGREGATION_DISABLED_TTL_SEC)
                .await
            {
                tracing::warn!(error = %e, "failed to set aggregation rollback flag");
            }
        }
    }

    async fn run_aggregated(
        &self,
        db: &Db,
        table: AggregateTable,
        dimension: Dimension,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<AggregatedRow>> {
        let sql = aggregated_sql(table, dimension);
        let fut = sqlx::query(&sql)
            .bind(start)
            .bind(end)
            .fetch_all(db.pool());
        let rows = tokio::time::timeout(self.query_timeout, fut)
            .await
            .map_err(|_| StoreError::Timeout(QUERY_TIMEOUT_MS))??;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let total: i64 = row.try_get::<Option<i64>, _>("total_count")?.unwrap_or(0);
            let downtime: i64 = row.try_get::<Option<i64>, _>("downtime_count")?.unwrap_or(0);
            let availability = if total > 0 {
                100.0 * (1.0 - downtime as f64 / total as f64)
            } else {
                0.0
            };
            out.push(AggregatedRow {
                dimension: row
                    .try_get::<Option<String>, _>("dim_key")?
                    .unwrap_or_else(|| "Unknown".to_string()),
                avg_latency: row.try_get::<Option<f64>, _>("avg_lat")?.unwrap_or(0.0),
                min_latency: row.try_get::<Option<f64>, _>("min_lat")?.unwrap_or(0.0),
                max_latency: row.try_get::<Option<f64>, _>("max_lat")?.unwrap_or(0.0),
                p95_latency: row.try_get::<Option<f64>, _>("p95_lat")?.unwrap_or(0.0),
                avg_packet_loss: row.try_get::<Option<f64>, _>("avg_loss")?.unwrap_or(0.0),
                reporting_count: total,
                downtime_intervals: downtime,
                availability_pct: availability,
            });
        }
        Ok(out)
    }

    async fn run_cluster(
        &self,
        db: &Db,
        table: AggregateTable,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        top_n: i64,
    ) -> StoreResult<ClusterOverview> {
        let fleet_fut = async {
            let row = sqlx::query(&fleet_sql(table))
                .bind(start)
                .bind(end)
                .fetch_one(db.pool())
                .await?;
            Ok::<FleetSummary, StoreError>(FleetSummary {
                total_nodes: row.try_get::<Option<i64>, _>("total_nodes")?.unwrap_or(0),
                avg_latency_ms: row.try_get::<Option<f64>, _>("avg_latency")?.unwrap_or(0.0),
                avg_uptime_pct: row.try_get::<Option<f64>, _>("avg_uptime")?.unwrap_or(0.0),
                avg_loss_pct: row.try_get::<Option<f64>, _>("avg_loss")?.unwrap_or(0.0),
            })
        };
        let fleet = tokio::time::timeout(self.query_timeout, fleet_fut)
            .await
            .map_err(|_| StoreError::Timeout(QUERY_TIMEOUT_MS))??;

        let regional_rows = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(&regional_sql(table))
                .bind(start)
                .bind(end)
                .fetch_all(db.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout(QUERY_TIMEOUT_MS))??;

        let mut regional = Vec::with_capacity(regional_rows.len());
        for row in regional_rows {
            regional.push(RegionalBreakdown {
                region: row
                    .try_get::<Option<String>, _>("region_key")?
                    .unwrap_or_else(|| "unknown".to_string()),
                nodes: row.try_get::<Option<i64>, _>("nodes")?.unwrap_or(0),
                avg_latency: row.try_get::<Option<f64>, _>("avg_latency")?.unwrap_or(0.0),
                avg_uptime: row.try_get::<Option<f64>, _>("avg_uptime")?.unwrap_or(0.0),
            });
        }

        let problem_rows = tokio::time::timeout(
            self.query_timeout,
            sqlx::query(&problematic_sql(table))
                .bind(start)
                .bind(end)
                .bind(top_n)
                .fetch_all(db.pool()),
        )
        .await
        .map_err(|_| StoreError::Timeout(QUERY_TIMEOUT_MS))??;

        let mut problematic = Vec::with_capacity(problem_rows.len());
        for row in problem_rows {
            problematic.push(ProblemNode {
                node_id: row.try_get("node_id")?,
                region: row
                    .try_get::<Option<String>, _>("region_key")?
                    .unwrap_or_else(|| "unknown".to_string()),
                score: row.try_get::<Option<f64>, _>("score")?.unwrap_or(0.0),
                avg_latency: row.try_get::<Option<f64>, _>("avg_lat")?.unwrap_or(0.0),
                avg_loss: row.try_get::<Option<f64>, _>("avg_loss")?.unwrap_or(0.0),
            });
        }

        Ok(ClusterOverview {
            time_range: TimeRange { start, end },
            fleet_summary: fleet,
            regional_breakdown: regional,
            top_problematic_nodes: problematic,
        })
    }
}

fn aggregated_sql(table: AggregateTable, dimension: Dimension) -> String {
    match (table, dimension) {
        (AggregateTable::Metrics, Dimension::Node) => "\
            SELECT m.node_id AS dim_key, \
                   AVG(m.latency_ms) AS avg_lat, MIN(m.latency_ms) AS min_lat, \
                   MAX(m.latency_ms) AS max_lat, \
                   percentile_cont(0.95) WITHIN GROUP (ORDER BY m.latency_ms) AS p95_lat, \
                   AVG(m.packet_loss) AS avg_loss, \
                   COUNT(*)::bigint AS total_count, \
                   (COUNT(*) FILTER (WHERE m.uptime_pct < 100))::bigint AS downtime_count \
            FROM metrics m \
            WHERE m.time >= $1 AND m.time <= $2 \
            GROUP BY m.node_id"
            .to_string(),
        (AggregateTable::Metrics, Dimension::Region) => "\
            SELECT n.region || '/' || n.country AS dim_key, \
                   AVG(m.latency_ms) AS avg_lat, MIN(m.latency_ms) AS min_lat, \
                   MAX(m.latency_ms) AS max_lat, \
                   percentile_cont(0.95) WITHIN GROUP (ORDER BY m.latency_ms) AS p95_lat, \
                   AVG(m.packet_loss) AS avg_loss, \
                   COUNT(*)::bigint AS total_count, \
                   (COUNT(*) FILTER (WHERE m.uptime_pct < 100))::bigint AS downtime_count \
            FROM metrics m \
            LEFT JOIN nodes n ON m.node_id = n.node_id \
            WHERE m.time >= $1 AND m.time <= $2 \
            GROUP BY n.region, n.country"
            .to_string(),
        (AggregateTable::Agg5mRegion, _) => format!(
            "SELECT a.region AS dim_key, \
                    AVG(a.{avg}) AS avg_lat, MIN(a.{min}) AS min_lat, MAX(a.{max}) AS max_lat, \
                    AVG(a.{avg}) * 1.5 AS p95_lat, \
                    AVG(a.{loss}) AS avg_loss, \
                    SUM(a.{samples})::bigint AS total_count, \
                    SUM(CASE WHEN a.{uptime} < 100 THEN a.{samples} ELSE 0 END)::bigint AS downtime_count \
             FROM {table} a \
             WHERE a.{bucket} >= $1 AND a.{bucket} <= $2 \
             GROUP BY a.region",
            avg = table.avg_latency_col(),
            min = table.min_latency_col(),
            max = table.max_latency_col(),
            loss = table.avg_loss_col(),
            samples = table.samples_col(),
            uptime = table.avg_uptime_col(),
            table = table.name(),
            bucket = table.bucket_col(),
        ),
        (_, Dimension::Region) => format!(
            // Node-keyed view queried by region: join the node shells.
            "SELECT n.region || '/' || n.country AS dim_key, \
                    AVG(a.{avg}) AS avg_lat, MIN(a.{min}) AS min_lat, MAX(a.{max}) AS max_lat, \
                    AVG(a.{avg}) * 1.5 AS p95_lat, \
                    AVG(a.{loss}) AS avg_loss, \
                    SUM(a.{samples})::bigint AS total_count, \
                    SUM(CASE WHEN a.{uptime} < 100 THEN a.{samples} ELSE 0 END)::bigint AS downtime_count \
             FROM {table} a \
             LEFT JOIN nodes n ON a.node_id = n.node_id \
             WHERE a.{bucket} >= $1 AND a.{bucket} <= $2 \
             GROUP BY n.region, n.country",
            avg = table.avg_latency_col(),
            min = table.min_latency_col(),
            max = table.max_latency_col(),
            loss = table.avg_loss_col(),
            samples = table.samples_col(),
            uptime = table.avg_uptime_col(),
            table = table.name(),
            bucket = table.bucket_col(),
        ),
        (_, Dimension::Node) => format!(
            "SELECT a.node_id AS dim_key, \
                    AVG(a.{avg}) AS avg_lat, MIN(a.{min}) AS min_lat, MAX(a.{max}) AS max_lat, \
                    AVG(a.{avg}) * 1.5 AS p95_lat, \
                    AVG(a.{loss}) AS avg_loss, \
                    SUM(a.{samples})::bigint AS total_count, \
                    SUM(CASE WHEN a.{uptime} < 100 THEN a.{samples} ELSE 0 END)::bigint AS downtime_count \
             FROM {table} a \
             WHERE a.{bucket} >= $1 AND a.{bucket} <= $2 \
             GROUP BY a.node_id",
            avg = table.avg_latency_col(),
            min = table.min_latency_col(),
            max = table.max_latency_col(),
            loss = table.avg_loss_col(),
            samples = table.samples_col(),
            uptime = table.avg_uptime_col(),
            table = table.name(),
            bucket = table.bucket_col(),
        ),
    }
}

fn fleet_sql(table: AggregateTable) -> String {
    if table == AggregateTable::Metrics {
        "SELECT COUNT(DISTINCT node_id)::bigint AS total_nodes, \
                AVG(latency_ms) AS avg_latency, AVG(uptime_pct) AS avg_uptime, \
                AVG(packet_loss) AS avg_loss \
         FROM metrics WHERE time >= $1 AND time <= $2"
            .to_string()
    } else {
        format!(
            "SELECT COUNT(DISTINCT node_id)::bigint AS total_nodes, \
                    AVG({avg}) AS avg_latency, AVG({uptime}) AS avg_uptime, \
                    AVG({loss}) AS avg_loss \
             FROM {table} WHERE {bucket} >= $1 AND {bucket} <= $2",
            avg = table.avg_latency_col(),
            uptime = table.avg_uptime_col(),
            loss = table.avg_loss_col(),
            table = table.name(),
            bucket = table.bucket_col(),
        )
    }
}

fn regional_sql(table: AggregateTable) -> String {
    if table == AggregateTable::Metrics {
        "SELECT LOWER(n.country) || '-' || LOWER(REPLACE(n.region, ' ', '-')) AS region_key, \
                COUNT(DISTINCT m.node_id)::bigint AS nodes, \
                AVG(m.latency_ms) AS avg_latency, AVG(m.uptime_pct) AS avg_uptime \
         FROM metrics m JOIN nodes n ON m.node_id = n.node_id \
         WHERE m.time >= $1 AND m.time <= $2 \
         GROUP BY n.country, n.region"
            .to_string()
    } else {
        format!(
            "SELECT LOWER(n.country) || '-' || LOWER(REPLACE(n.region, ' ', '-')) AS region_key, \
                    COUNT(DISTINCT a.node_id)::bigint AS nodes, \
                    AVG(a.{avg}) AS avg_latency, AVG(a.{uptime}) AS avg_uptime \
             FROM {table} a JOIN nodes n ON a.node_id = n.node_id \
             WHERE a.{bucket} >= $1 AND a.{bucket} <= $2 \
             GROUP BY n.country, n.region",
            avg = table.avg_latency_col(),
            uptime = table.avg_uptime_col(),
            table = table.name(),
            bucket = table.bucket_col(),
        )
    }
}

fn problematic_sql(table: AggregateTable) -> String {
    if table == AggregateTable::Metrics {
        "SELECT m.node_id, \
                LOWER(n.country) || '-' || LOWER(REPLACE(n.region, ' ', '-')) AS region_key, \
                AVG(m.latency_ms) AS avg_lat, AVG(m.packet_loss) AS avg_loss, \
                AVG(m.uptime_pct) AS avg_uptime, \
                (AVG(m.latency_ms)/50.0 + AVG(m.packet_loss)*10.0 + (100.0-AVG(m.uptime_pct))*2.0) AS score \
         FROM metrics m JOIN nodes n ON m.node_id = n.node_id \
         WHERE m.time >= $1 AND m.time <= $2 \
         GROUP BY m.node_id, n.country, n.region \
         ORDER BY score DESC LIMIT $3"
            .to_string()
    } else {
        format!(
            "SELECT a.node_id, \
                    LOWER(n.country) || '-' || LOWER(REPLACE(n.region, ' ', '-')) AS region_key, \
                    AVG(a.{avg}) AS avg_lat, AVG(a.{loss}) AS avg_loss, \
                    AVG(a.{uptime}) AS avg_uptime, \
                    (AVG(a.{avg})/50.0 + AVG(a.{loss})*10.0 + (100.0-AVG(a.{uptime}))*2.0) AS score \
             FROM {table} a JOIN nodes n ON a.node_id = n.node_id \
             WHERE a.{bucket} >= $1 AND a.{bucket} <= $2 \
             GROUP BY a.node_id, n.country, n.region \
             ORDER BY score DESC LIMIT $3",
            avg = table.avg_latency_col(),
            loss = table.avg_loss_col(),
            uptime = table.avg_uptime_col(),
            table = table.name(),
            bucket = table.bucket_col(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregated_sql_uses_daily_columns() {
        let sql = aggregated_sql(AggregateTable::AggDaily, Dimension::Node);
        assert!(sql.contains("avg_latency_ms"));
        assert!(sql.contains("sample_count"));
        assert!(sql.contains("a.time >="));
    }

    #[test]
    fn test_region_dimension_joins_nodes() {
        let sql = aggregated_sql(AggregateTable::Agg1m, Dimension::Region);
        assert!(sql.contains("JOIN nodes"));
        assert!(sql.contains("a.bucket >="));
    }

    #[test]
    fn test_raw_metrics_uses_percentile() {
        let sql = aggregated_sql(AggregateTable::Metrics, Dimension::Node);
        assert!(sql.contains("percentile_cont"));
    }
}
