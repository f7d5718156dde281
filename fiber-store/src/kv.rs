// fiber-store: Shared kv-store facade
// All Redis access for the gateway, ETL, and engines flows through here.
// Single-key primitives or server-side scripts only; no cross-key
// transactions.

use std::collections::HashMap;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::scripts::{ALERT_BUCKET_LUA, BATCH_POP_LUA, RATE_LIMIT_LUA};
use crate::{StoreError, StoreResult};

/// Shared ETL work queue.
pub const ETL_QUEUE_KEY: &str = "fiber:etl:queue";
/// ETL status hash (heartbeat, batch stats).
pub const ETL_STATUS_KEY: &str = "fiber:etl:status";
/// Known-nodes set used by the ETL node cache.
pub const NODE_CACHE_KEY: &str = "cache:nodes";
/// Dead-letter list for alerts whose dispatch exhausted retries.
pub const ALERT_DLQ_KEY: &str = "alerts:dlq";
/// Global alert token bucket.
pub const ALERT_GLOBAL_BUCKET_KEY: &str = "alerts:quota:global";
/// Kv flag forcing raw-metrics selection while aggregates misbehave.
pub const AGGREGATION_DISABLED_KEY: &str = "aggregation:disabled";
/// Counter of strict-mode region rejections.
pub const INGEST_REJECTION_KEY: &str = "fiber:metrics:ingest_rejection_count";
/// Pub/sub channel for dashboard cache invalidation.
pub const CACHE_INVALIDATE_CHANNEL: &str = "fiberstack:cache:invalidate";
/// Probe heartbeat key prefix, TTL-bound.
pub const PROBE_HEARTBEAT_PREFIX: &str = "probe:heartbeat:";

/// Outcome of the distributed token bucket.
#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: f64,
    pub reset_ts: i64,
    pub retry_after_sec: i64,
}

/// Cheap-to-clone handle over a multiplexed Redis connection.
#[derive(Clone)]
pub struct Kv {
    manager: ConnectionManager,
}

impl Kv {
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self { manager })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Raw connection handle for collaborators with their own command sets
    /// (the auth revocation list).
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    // --- Queue ---

    /// Right-push serialized payloads in a single pipelined operation.
    pub async fn enqueue_payloads(&self, queue_key: &str, payloads: &[String]) -> StoreResult<usize> {
        if payloads.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        for p in payloads {
            pipe.rpush(queue_key, p).ignore();
        }
        let mut conn = self.conn();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(payloads.len())
    }

    /// Atomically pop up to `limit` entries from the queue head.
    pub async fn batch_pop(&self, queue_key: &str, limit: usize) -> StoreResult<Vec<String>> {
        let script = redis::Script::new(BATCH_POP_LUA);
        let mut conn = self.conn();
        let items: Vec<String> = script
            .key(queue_key)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(items)
    }

    pub async fn queue_depth(&self, queue_key: &str) -> StoreResult<i64> {
        let mut conn = self.conn();
        Ok(conn.llen(queue_key).await?)
    }

    // --- Set-if-absent primitives (nonce, idempotency, dedup) ---

    /// SET NX EX. Returns true when the key was newly set.
    pub async fn set_nx_ex(&self, key: &str, ttl_sec: u64) -> StoreResult<bool> {
        let mut conn = self.conn();
        let res: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_sec)
            .query_async(&mut conn)
            .await?;
        Ok(res.is_some())
    }

    /// Pipelined SET NX EX over many keys; result aligns with input order.
    pub async fn set_nx_ex_many(&self, keys: &[String], ttl_sec: u64) -> StoreResult<Vec<bool>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("SET").arg(key).arg("1").arg("NX").arg("EX").arg(ttl_sec);
        }
        let mut conn = self.conn();
        let results: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
        Ok(results.into_iter().map(|r| r.is_some()).collect())
    }

    pub async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn();
        Ok(conn.exists(key).await?)
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_sec: u64) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.set_ex::<_, _, ()>(key, value, ttl_sec).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    pub async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    // --- Node cache ---

    /// Multi-membership check against the known-nodes set.
    pub async fn nodes_cached(&self, node_ids: &[String]) -> StoreResult<Vec<bool>> {
        if node_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn();
        let flags: Vec<i64> = redis::cmd("SMISMEMBER")
            .arg(NODE_CACHE_KEY)
            .arg(node_ids)
            .query_async(&mut conn)
            .await?;
        Ok(flags.into_iter().map(|f| f == 1).collect())
    }

    pub async fn cache_nodes(&self, node_ids: &[String]) -> StoreResult<()> {
        if node_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn();
        conn.sadd::<_, _, ()>(NODE_CACHE_KEY, node_ids).await?;
        Ok(())
    }

    // --- ETL status ---

    pub async fn set_status_fields(&self, fields: &[(&str, String)]) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(ETL_STATUS_KEY, fields).await?;
        Ok(())
    }

    pub async fn etl_status(&self) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.conn();
        Ok(conn.hgetall(ETL_STATUS_KEY).await?)
    }

    // --- Counters ---

    pub async fn incr(&self, key: &str) -> StoreResult<i64> {
        let mut conn = self.conn();
        Ok(conn.incr(key, 1).await?)
    }

    /// Fixed-window counter: INCR, with TTL set on the first hit.
    pub async fn incr_fixed_window(&self, key: &str, window_sec: i64) -> StoreResult<i64> {
        let mut conn = self.conn();
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            conn.expire::<_, ()>(key, window_sec).await?;
        }
        Ok(count)
    }

    // --- Alert DLQ ---

    pub async fn push_dlq(&self, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.lpush::<_, _, ()>(ALERT_DLQ_KEY, payload).await?;
        Ok(())
    }

    pub async fn dlq_depth(&self) -> StoreResult<i64> {
        let mut conn = self.conn();
        Ok(conn.llen(ALERT_DLQ_KEY).await?)
    }

    // --- Probe heartbeats ---

    pub async fn set_probe_heartbeat(
        &self,
        node_id: &str,
        payload: &str,
        ttl_sec: u64,
    ) -> StoreResult<()> {
        let key = format!("{}{}", PROBE_HEARTBEAT_PREFIX, node_id);
        self.set_ex(&key, payload, ttl_sec).await
    }

    /// Collect live probe heartbeats: SCAN the prefix, fetch survivors.
    pub async fn probe_heartbeats(&self) -> StoreResult<Vec<String>> {
        let pattern = format!("{}*", PROBE_HEARTBEAT_PREFIX);
        let keys = self.scan_keys(&pattern).await?;
        let mut out = Vec::with_capacity(keys.len());
        let mut conn = self.conn();
        for key in keys {
            let val: Option<String> = conn.get(&key).await?;
            if let Some(v) = val {
                out.push(v);
            }
        }
        Ok(out)
    }

    // --- Sliding latency window (analytics) ---

    /// Push a sample, trim to the window, return the current samples
    /// (newest first) in one pipelined round trip.
    pub async fn latency_window_push(
        &self,
        node_id: &str,
        latency: f64,
        window: usize,
    ) -> StoreResult<Vec<f64>> {
        let key = format!("state:latency:{}", node_id);
        let mut pipe = redis::pipe();
        pipe.lpush(&key, latency).ignore();
        pipe.ltrim(&key, 0, window as isize - 1).ignore();
        pipe.lrange(&key, 0, -1);
        let mut conn = self.conn();
        let (raw,): (Vec<String>,) = pipe.query_async(&mut conn).await?;
        Ok(raw.iter().filter_map(|s| s.parse::<f64>().ok()).collect())
    }

    // --- Scripts ---

    /// Distributed token bucket check.
    pub async fn rate_limit(
        &self,
        key: &str,
        rate_per_sec: f64,
        capacity: i64,
        requested: i64,
        ttl_sec: i64,
    ) -> StoreResult<RateDecision> {
        let script = redis::Script::new(RATE_LIMIT_LUA);
        let mut conn = self.conn();
        let (allowed, remaining, reset_ts, limit, retry_after): (i64, String, i64, i64, i64) =
            script
                .key(key)
                .arg(rate_per_sec)
                .arg(capacity)
                .arg(requested)
                .arg(Utc::now().timestamp())
                .arg(ttl_sec)
                .invoke_async(&mut conn)
                .await?;
        Ok(RateDecision {
            allowed: allowed == 1,
            limit,
            remaining: remaining.parse().unwrap_or(0.0),
            reset_ts,
            retry_after_sec: retry_after,
        })
    }

    /// Take one token from the global alert bucket.
    pub async fn alert_bucket_take(&self, refill_per_sec: f64, capacity: i64) -> StoreResult<bool> {
        let script = redis::Script::new(ALERT_BUCKET_LUA);
        let mut conn = self.conn();
        let taken: i64 = script
            .key(ALERT_GLOBAL_BUCKET_KEY)
            .arg(refill_per_sec)
            .arg(capacity)
            .arg(Utc::now().timestamp())
            .invoke_async(&mut conn)
            .await?;
        Ok(taken == 1)
    }

    // --- Cache & pub/sub ---

    pub async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.conn();
        conn.publish::<_, _, ()>(channel, message).await?;
        Ok(())
    }

    async fn scan_keys(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn();
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    /// Scan-and-delete keys matching a pattern. Returns the delete count.
    pub async fn delete_pattern(&self, pattern: &str) -> StoreResult<usize> {
        let keys = self.scan_keys(pattern).await?;
        if keys.is_empty() {
            return Ok(0);
        }
        let count = keys.len();
        let mut conn = self.conn();
        conn.del::<_, ()>(keys).await?;
        Ok(count)
    }

    // --- Flags ---

    pub async fn set_flag(&self, key: &str, ttl_sec: u64) -> StoreResult<()> {
        self.set_ex(key, "1", ttl_sec).await
    }

    pub async fn flag_set(&self, key: &str) -> StoreResult<bool> {
        self.exists(key).await
    }
}

impl std::fmt::Debug for Kv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kv").finish_non_exhaustive()
    }
}
