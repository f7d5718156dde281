// fiber-store: Dashboard query cache
// Keys hash the sorted query params; entries carry their write time so a
// client with a stale clock on the kv-store side still ages out.

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::kv::{Kv, CACHE_INVALIDATE_CHANNEL};
use crate::StoreResult;

const CACHE_PREFIX: &str = "fiberstack:cache:dashboard";

/// TTL for real-time windows (< 600 s).
pub const TTL_REALTIME_SEC: u64 = 10;
/// TTL for cluster-wide queries.
pub const TTL_CLUSTER_SEC: u64 = 60;

/// Cache key: prefix + 12 hex chars of md5 over canonical (sorted) params.
pub fn cache_key(prefix: &str, params: &Value) -> String {
    let canonical = serde_json::to_string(params).unwrap_or_default();
    let mut hasher = Md5::new();
    hasher.update(canonical.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}:{}:{}", CACHE_PREFIX, prefix, &digest[..12])
}

#[derive(serde::Serialize, serde::Deserialize)]
struct Envelope {
    cached_at: DateTime<Utc>,
    data: Value,
}

/// Fetch a cached result. Entries older than 2×TTL are treated as stale and
/// dropped even if the kv-store has not expired them yet.
pub async fn get_cached<T: DeserializeOwned>(
    kv: &Kv,
    key: &str,
    ttl_sec: u64,
) -> StoreResult<Option<T>> {
    let Some(raw) = kv.get(key).await? else {
        return Ok(None);
    };
    let envelope: Envelope = match serde_json::from_str(&raw) {
        Ok(e) => e,
        Err(_) => {
            kv.del(key).await?;
            return Ok(None);
        }
    };
    let age = (Utc::now() - envelope.cached_at).num_seconds();
    if age < 0 || age as u64 > 2 * ttl_sec {
        kv.del(key).await?;
        return Ok(None);
    }
    Ok(serde_json::from_value(envelope.data).ok())
}

pub async fn set_cached<T: Serialize>(kv: &Kv, key: &str, data: &T, ttl_sec: u64) -> StoreResult<()> {
    let envelope = Envelope {
        cached_at: Utc::now(),
        data: serde_json::to_value(data)?,
    };
    kv.set_ex(key, &serde_json::to_string(&envelope)?, ttl_sec)
        .await
}

/// Ingest-side invalidation: broadcast the pattern for other processes and
/// scan-and-delete our own keys.
pub async fn invalidate_on_ingest(kv: &Kv) -> StoreResult<usize> {
    let pattern = format!("{}:*", CACHE_PREFIX);
    kv.publish(CACHE_INVALIDATE_CHANNEL, &pattern).await?;
    kv.delete_pattern(&pattern).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cache_key_is_stable_under_key_order() {
        let a = cache_key("aggregated", &json!({"dim": "node", "start": "s", "end": "e"}));
        let b = cache_key("aggregated", &json!({"end": "e", "start": "s", "dim": "node"}));
        assert_eq!(a, b);
    }

    #[test]
    fn test_cache_key_differs_per_params() {
        let a = cache_key("aggregated", &json!({"dim": "node"}));
        let b = cache_key("aggregated", &json!({"dim": "region"}));
        assert_ne!(a, b);
    }

    #[test]
    fn test_cache_key_shape() {
        let k = cache_key("cluster", &json!({"top": 5}));
        assert!(k.starts_with("fiberstack:cache:dashboard:cluster:"));
        let digest = k.rsplit(':').next().unwrap();
        assert_eq!(digest.len(), 12);
    }
}
