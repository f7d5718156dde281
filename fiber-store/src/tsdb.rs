// fiber-store: TimescaleDB repositories
// Bulk metric writes (COPY with per-row fallback), conflict audit, node
// lifecycle, and raw metric queries. Tables are pre-provisioned.

use chrono::{DateTime, Utc};
use fiber_core::{NormalizedMetric, Node, NodeStatus};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder, Row, Transaction};

use crate::{StoreError, StoreResult};

/// Database connection settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub pool_min: u32,
    pub pool_max: u32,
}

impl DbConfig {
    pub fn from_env() -> Self {
        use fiber_core::secrets::env_or;
        Self {
            host: env_or("DB_HOST", "localhost"),
            user: env_or("DB_USER", "postgres"),
            password: env_or("DB_PASS", "postgres"),
            database: env_or("DB_NAME", "fiberstack"),
            pool_min: env_or("DB_POOL_MIN", "5").parse().unwrap_or(5),
            pool_max: env_or("DB_POOL_MAX", "20").parse().unwrap_or(20),
        }
    }
}

/// Pool handle. Rebuilt wholesale on SIGHUP for credential rotation.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    pub async fn connect(config: &DbConfig) -> StoreResult<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);
        let pool = PgPoolOptions::new()
            .min_connections(config.pool_min)
            .max_connections(config.pool_max)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn csv_escape(field: &str) -> String {
    format!("\"{}\"", field.replace('"', "\"\""))
}

/// Bulk insert through the COPY path. Fails as a unit on any duplicate so the
/// caller can fall back to the audited per-row path.
pub async fn copy_insert_metrics(
    tx: &mut Transaction<'_, Postgres>,
    metrics: &[NormalizedMetric],
) -> StoreResult<u64> {
    let mut csv = String::new();
    for m in metrics {
        let metadata = serde_json::to_string(&m.metadata)?;
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            m.timestamp.to_rfc3339(),
            csv_escape(&m.node_id),
            m.latency_ms,
            m.uptime_pct,
            m.packet_loss,
            csv_escape(&metadata),
        ));
    }

    let conn: &mut PgConnection = &mut *tx;
    let mut copy = conn
        .copy_in_raw(
            "COPY metrics (time, node_id, latency_ms, uptime_pct, packet_loss, metadata) \
             FROM STDIN WITH (FORMAT csv)",
        )
        .await?;
    copy.send(csv.as_bytes()).await?;
    let rows = copy.finish().await?;
    Ok(rows)
}

/// Per-row insert with conflict suppression. Returns true when a row landed.
/// Runs pool-side so one poisoned row cannot abort the rest of the batch.
pub async fn insert_metric_row(db: &Db, metric: &NormalizedMetric) -> StoreResult<bool> {
    let result = sqlx::query(
        "INSERT INTO metrics (time, node_id, latency_ms, uptime_pct, packet_loss, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         ON CONFLICT (time, node_id) DO NOTHING",
    )
    .bind(metric.timestamp)
    .bind(&metric.node_id)
    .bind(metric.latency_ms)
    .bind(metric.uptime_pct)
    .bind(metric.packet_loss)
    .bind(&metric.metadata)
    .execute(db.pool())
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Audit a `(time, node_id)` collision instead of discarding it silently.
pub async fn record_conflict(db: &Db, metric: &NormalizedMetric) -> StoreResult<()> {
    let payload = serde_json::json!({
        "node_id": metric.node_id,
        "country": metric.country,
        "region": metric.region,
        "latency_ms": metric.latency_ms,
        "uptime_pct": metric.uptime_pct,
        "packet_loss": metric.packet_loss,
        "timestamp": metric.timestamp.to_rfc3339(),
        "metadata": metric.metadata,
    });
    sqlx::query(
        "INSERT INTO metric_conflicts (time, node_id, payload, ingest_region) \
         VALUES ($1, $2, $3, $4)",
    )
    .bind(metric.timestamp)
    .bind(&metric.node_id)
    .bind(payload)
    .bind(metric.source_region())
    .execute(db.pool())
    .await?;
    Ok(())
}

/// Analytics output row for the `metrics_aggregated` hypertable.
pub async fn insert_aggregated(
    db: &Db,
    metric: &NormalizedMetric,
    latency_avg_window: Option<f64>,
    latency_std_window: Option<f64>,
    packet_loss_spike: bool,
    anomaly_score: f64,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO metrics_aggregated \
         (time, node_id, latency_avg_window, latency_std_window, packet_loss_spike, anomaly_score, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(metric.timestamp)
    .bind(&metric.node_id)
    .bind(latency_avg_window)
    .bind(latency_std_window)
    .bind(packet_loss_spike)
    .bind(anomaly_score)
    .bind(serde_json::json!({"source": "etl-analytics"}))
    .execute(db.pool())
    .await?;
    Ok(())
}

/// Upsert node shells observed by the ETL; existing rows only refresh
/// `last_seen_at`.
pub async fn upsert_observed_nodes(
    db: &Db,
    nodes: &[(String, String, String)],
) -> StoreResult<()> {
    for (node_id, country, region) in nodes {
        let short: String = node_id.chars().take(8).collect();
        sqlx::query(
            "INSERT INTO nodes (node_id, node_name, country, region) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (node_id) DO UPDATE SET last_seen_at = NOW()",
        )
        .bind(node_id)
        .bind(format!("probe-{}", short))
        .bind(country)
        .bind(region)
        .execute(db.pool())
        .await?;
    }
    Ok(())
}

/// Stored metric row as returned to the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRow {
    pub node_id: String,
    pub country: String,
    pub region: String,
    pub latency_ms: f64,
    pub uptime_pct: f64,
    pub packet_loss: f64,
    pub time: DateTime<Utc>,
    pub metadata: Option<Value>,
}

/// Filter for the raw metrics listing.
#[derive(Debug, Clone, Default)]
pub struct MetricsFilter {
    pub node_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Paginated raw metrics, most recent first.
pub async fn query_metrics(db: &Db, filter: &MetricsFilter) -> StoreResult<Vec<MetricRow>> {
    let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
        "SELECT m.node_id, n.country, n.region, m.latency_ms, m.uptime_pct, \
         m.packet_loss, m.time, m.metadata \
         FROM metrics m LEFT JOIN nodes n ON m.node_id = n.node_id WHERE 1=1",
    );
    if let Some(node_id) = &filter.node_id {
        qb.push(" AND m.node_id = ").push_bind(node_id);
    }
    if let Some(start) = filter.start_time {
        qb.push(" AND m.time >= ").push_bind(start);
    }
    if let Some(end) = filter.end_time {
        qb.push(" AND m.time <= ").push_bind(end);
    }
    qb.push(" ORDER BY m.time DESC LIMIT ")
        .push_bind(filter.limit)
        .push(" OFFSET ")
        .push_bind(filter.offset);

    let rows = qb.build().fetch_all(db.pool()).await?;
    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(MetricRow {
            node_id: row.try_get("node_id")?,
            country: row
                .try_get::<Option<String>, _>("country")?
                .unwrap_or_else(|| "XX".to_string()),
            region: row
                .try_get::<Option<String>, _>("region")?
                .unwrap_or_else(|| "Unknown".to_string()),
            latency_ms: row.try_get("latency_ms")?,
            uptime_pct: row.try_get("uptime_pct")?,
            packet_loss: row.try_get("packet_loss")?,
            time: row.try_get("time")?,
            metadata: row.try_get("metadata")?,
        });
    }
    Ok(out)
}

/// Node listing row, joined with the latest metric timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct NodeRow {
    pub node_id: String,
    pub status: String,
    pub country: String,
    pub region: String,
    pub lat: f64,
    pub lng: f64,
    pub last_seen: Option<DateTime<Utc>>,
}

/// All non-deleted nodes.
pub async fn list_nodes(db: &Db) -> StoreResult<Vec<NodeRow>> {
    let rows = sqlx::query(
        "SELECT n.node_id, n.status, n.country, n.region, n.lat, n.lng, \
         MAX(m.time) AS last_seen \
         FROM nodes n LEFT JOIN metrics m ON n.node_id = m.node_id \
         WHERE n.status != 'deleted' \
         GROUP BY n.node_id, n.status, n.country, n.region, n.lat, n.lng \
         ORDER BY n.country, n.region",
    )
    .fetch_all(db.pool())
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(NodeRow {
            node_id: row.try_get("node_id")?,
            status: row.try_get("status")?,
            country: row
                .try_get::<Option<String>, _>("country")?
                .unwrap_or_else(|| "XX".to_string()),
            region: row
                .try_get::<Option<String>, _>("region")?
                .unwrap_or_else(|| "Unknown".to_string()),
            lat: row.try_get::<Option<f64>, _>("lat")?.unwrap_or(0.0),
            lng: row.try_get::<Option<f64>, _>("lng")?.unwrap_or(0.0),
            last_seen: row.try_get("last_seen")?,
        });
    }
    Ok(out)
}

/// Register a new node shell. Lifecycle must start at `registered`.
pub async fn create_node(db: &Db, node: &Node) -> StoreResult<()> {
    if node.status != NodeStatus::Registered {
        return Err(StoreError::Conflict(
            "new nodes must start as 'registered'".to_string(),
        ));
    }
    let existing: Option<i32> = sqlx::query_scalar("SELECT 1 FROM nodes WHERE node_id = $1")
        .bind(&node.node_id)
        .fetch_optional(db.pool())
        .await?;
    if existing.is_some() {
        return Err(StoreError::Conflict("node id already exists".to_string()));
    }
    sqlx::query(
        "INSERT INTO nodes (node_id, status, country, region, lat, lng) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&node.node_id)
    .bind(node.status.as_str())
    .bind(&node.country)
    .bind(&node.region)
    .bind(node.lat)
    .bind(node.lng)
    .execute(db.pool())
    .await?;
    Ok(())
}

/// Soft delete: tombstone the shell, metric rows remain.
pub async fn soft_delete_node(db: &Db, node_id: &str) -> StoreResult<()> {
    let result = sqlx::query("UPDATE nodes SET status = 'deleted' WHERE node_id = $1")
        .bind(node_id)
        .execute(db.pool())
        .await?;
    if result.rows_affected() == 0 {
        return Err(StoreError::NotFound(format!("node {}", node_id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_escape_doubles_quotes() {
        assert_eq!(csv_escape(r#"a"b"#), r#""a""b""#);
        assert_eq!(csv_escape("plain"), "\"plain\"");
    }

    #[test]
    fn test_filter_defaults_are_inert() {
        let f = MetricsFilter {
            limit: 100,
            ..Default::default()
        };
        assert!(f.node_id.is_none());
        assert_eq!(f.offset, 0);
    }
}
