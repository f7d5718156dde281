// fiber-probe: Durable SQLite buffer
// Crash-safe FIFO: WAL journal, NORMAL synchronous, byte-size quota with
// oldest-first eviction. Single writer (pool capped at one connection).

use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};

use crate::ProbeResult;

/// Buffer settings. Eviction drops the oldest `evict_fraction` of rows when
/// the byte quota would be exceeded (prefer freshness over history).
#[derive(Debug, Clone)]
pub struct BufferConfig {
    pub path: String,
    pub max_bytes: i64,
    pub evict_fraction: f64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            path: "/data/buffer.db".to_string(),
            max_bytes: 100 * 1024 * 1024,
            evict_fraction: 0.10,
        }
    }
}

/// A buffered metric with its row id, preserved for acknowledgement.
#[derive(Debug, Clone)]
pub struct BufferedItem {
    pub id: i64,
    pub data: Value,
}

/// SQLite-backed FIFO queue for metrics awaiting upstream delivery.
pub struct DurableBuffer {
    pool: SqlitePool,
    max_bytes: i64,
    evict_fraction: f64,
}

impl DurableBuffer {
    pub async fn open(config: &BufferConfig) -> ProbeResult<Self> {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue ( \
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 payload TEXT NOT NULL, \
                 size_bytes INTEGER NOT NULL, \
                 created_at REAL DEFAULT (unixepoch()) \
             )",
        )
        .execute(&pool)
        .await?;

        tracing::info!(path = %config.path, "durable buffer initialized");
        Ok(Self {
            pool,
            max_bytes: config.max_bytes,
            evict_fraction: config.evict_fraction,
        })
    }

    /// Push a metric. Reports failure instead of panicking; the metric is
    /// lost only if the caller cannot retry.
    pub async fn push(&self, metric: &Value) -> bool {
        let payload = match serde_json::to_string(metric) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(error = %e, "buffer push failed to serialize");
                return false;
            }
        };
        let size = payload.len() as i64;

        let current = self.size_bytes().await.unwrap_or(0);
        if current + size > self.max_bytes {
            tracing::warn!(
                current_bytes = current,
                max_bytes = self.max_bytes,
                "buffer full, dropping oldest"
            );
            if let Err(e) = self.evict_oldest().await {
                tracing::error!(error = %e, "eviction failed");
            }
        }

        match sqlx::query("INSERT INTO queue (payload, size_bytes) VALUES (?, ?)")
            .bind(&payload)
            .bind(size)
            .execute(&self.pool)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(error = %e, "buffer push failed");
                false
            }
        }
    }

    /// Read up to `limit` items in id order without deleting them. Corrupt
    /// payloads are purged on sight.
    pub async fn peek_batch(&self, limit: i64) -> ProbeResult<Vec<BufferedItem>> {
        let rows = sqlx::query("SELECT id, payload FROM queue ORDER BY id ASC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let payload: String = row.try_get("payload")?;
            match serde_json::from_str::<Value>(&payload) {
                Ok(data) => items.push(BufferedItem { id, data }),
                Err(_) => {
                    tracing::error!(id, "corrupt payload in buffer, purging");
                    sqlx::query("DELETE FROM queue WHERE id = ?")
                        .bind(id)
                        .execute(&self.pool)
                        .await?;
                }
            }
        }
        Ok(items)
    }

    /// Delete delivered rows.
    pub async fn acknowledge(&self, ids: &[i64]) -> ProbeResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let id_list = ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        sqlx::query(&format!("DELETE FROM queue WHERE id IN ({})", id_list))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn depth(&self) -> ProbeResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn size_bytes(&self) -> ProbeResult<i64> {
        let size: Option<i64> = sqlx::query_scalar("SELECT SUM(size_bytes) FROM queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(size.unwrap_or(0))
    }

    async fn evict_oldest(&self) -> ProbeResult<()> {
        let count = self.depth().await?;
        let to_drop = ((count as f64 * self.evict_fraction).floor() as i64).max(1);
        sqlx::query("DELETE FROM queue WHERE id IN (SELECT id FROM queue ORDER BY id ASC LIMIT ?)")
            .bind(to_drop)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn open_buffer(max_bytes: i64) -> (tempfile::TempDir, DurableBuffer) {
        let dir = tempdir().unwrap();
        let config = BufferConfig {
            path: dir.path().join("buffer.db").display().to_string(),
            max_bytes,
            evict_fraction: 0.10,
        };
        let buffer = DurableBuffer::open(&config).await.unwrap();
        (dir, buffer)
    }

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let (_dir, buffer) = open_buffer(1024 * 1024).await;
        for i in 0..5 {
            assert!(buffer.push(&json!({"seq": i})).await);
        }
        let items = buffer.peek_batch(10).await.unwrap();
        let seqs: Vec<i64> = items.iter().map(|i| i.data["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_peek_does_not_consume_until_ack() {
        let (_dir, buffer) = open_buffer(1024 * 1024).await;
        buffer.push(&json!({"seq": 1})).await;
        buffer.push(&json!({"seq": 2})).await;

        let first = buffer.peek_batch(10).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(buffer.depth().await.unwrap(), 2);

        let ids: Vec<i64> = first.iter().map(|i| i.id).collect();
        buffer.acknowledge(&ids).await.unwrap();
        assert_eq!(buffer.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_payload_purged_on_peek() {
        let (_dir, buffer) = open_buffer(1024 * 1024).await;
        buffer.push(&json!({"ok": true})).await;
        sqlx::query("INSERT INTO queue (payload, size_bytes) VALUES ('{not-json', 9)")
            .execute(&buffer.pool)
            .await
            .unwrap();

        let items = buffer.peek_batch(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(buffer.depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_quota_evicts_oldest() {
        // Each payload ~22 bytes; quota fits about 4 of them.
        let (_dir, buffer) = open_buffer(90).await;
        for i in 0..8 {
            buffer.push(&json!({"seq": i, "pad": "xxxx"})).await;
        }
        let items = buffer.peek_batch(100).await.unwrap();
        // The oldest entries were evicted to make room.
        assert!(items.first().unwrap().data["seq"].as_i64().unwrap() > 0);
        assert!(buffer.size_bytes().await.unwrap() <= 120);
    }

    #[tokio::test]
    async fn test_depth_and_size_track_contents() {
        let (_dir, buffer) = open_buffer(1024 * 1024).await;
        assert_eq!(buffer.depth().await.unwrap(), 0);
        assert_eq!(buffer.size_bytes().await.unwrap(), 0);
        buffer.push(&json!({"a": 1})).await;
        assert_eq!(buffer.depth().await.unwrap(), 1);
        assert!(buffer.size_bytes().await.unwrap() > 0);
    }
}
