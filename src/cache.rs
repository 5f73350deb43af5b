//! Read-path cache: in-process key/value store with TTL and prefix deletion.
//!
//! The cache is never authoritative; the task store is. Failures here
//! (serialization, poisoned entries) degrade to a miss and are logged, never
//! propagated: the API is infallible by construction. Staleness is bounded by
//! the TTL even if an invalidation is lost.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::warn;

use crate::telemetry::metrics;
use opentelemetry::KeyValue;

struct Entry {
    value: serde_json::Value,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

/// In-process cache with per-entry TTL.
pub struct Cache {
    default_ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl Cache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            default_ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a value. Expired or undeserializable entries count as misses;
    /// expired entries are dropped lazily.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let now = Instant::now();
        let value = {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
                Some(_) => None,
                None => {
                    record_lookup("miss");
                    return None;
                }
            }
        };

        let Some(value) = value else {
            // Expired: evict under the write lock, re-checking expiry in
            // case a concurrent set refreshed the entry in between.
            let mut entries = self.entries.write().await;
            if entries.get(key).is_some_and(|e| e.is_expired(now)) {
                entries.remove(key);
            }
            record_lookup("expired");
            return None;
        };

        match serde_json::from_value(value) {
            Ok(v) => {
                record_lookup("hit");
                Some(v)
            }
            Err(e) => {
                warn!(key, "cache entry failed to deserialize, treating as miss: {e}");
                record_lookup("miss");
                None
            }
        }
    }

    /// Store a value with an explicit TTL. Serialization failures are logged
    /// and dropped, since the surrounding operation must never fail on the cache.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let value = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                warn!(key, "cache entry failed to serialize, skipping: {e}");
                return;
            }
        };

        let entry = Entry {
            value,
            expires_at: Instant::now() + ttl,
        };
        self.entries.write().await.insert(key.to_string(), entry);
    }

    pub async fn delete(&self, key: &str) {
        self.entries.write().await.remove(key);
    }

    /// Remove every key starting with `prefix`. Also sweeps expired entries
    /// while it holds the write lock anyway.
    pub async fn delete_prefix(&self, prefix: &str) {
        let now = Instant::now();
        self.entries
            .write()
            .await
            .retain(|key, entry| !key.starts_with(prefix) && !entry.is_expired(now));
    }

    #[cfg(test)]
    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

fn record_lookup(outcome: &'static str) {
    metrics::cache_lookups().add(1, &[KeyValue::new("outcome", outcome)]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let cache = Cache::new(Duration::from_secs(300));
        cache.set("task:id:1", &vec![1, 2, 3], cache.default_ttl()).await;

        let got: Option<Vec<i32>> = cache.get("task:id:1").await;
        assert_eq!(got, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn expired_entries_miss_and_evict() {
        let cache = Cache::new(Duration::from_secs(300));
        cache.set("tasks:stats", &7u32, Duration::ZERO).await;

        let got: Option<u32> = cache.get("tasks:stats").await;
        assert_eq!(got, None);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn delete_prefix_removes_only_matching_keys() {
        let cache = Cache::new(Duration::from_secs(300));
        let ttl = cache.default_ttl();
        cache.set("tasks:list:pending:-:1:20", &1u32, ttl).await;
        cache.set("tasks:list:-:high:2:20", &2u32, ttl).await;
        cache.set("task:id:abc", &3u32, ttl).await;

        cache.delete_prefix("tasks:list:").await;

        assert_eq!(cache.get::<u32>("tasks:list:pending:-:1:20").await, None);
        assert_eq!(cache.get::<u32>("tasks:list:-:high:2:20").await, None);
        assert_eq!(cache.get::<u32>("task:id:abc").await, Some(3));
    }

    #[tokio::test]
    async fn wrong_type_degrades_to_miss() {
        let cache = Cache::new(Duration::from_secs(300));
        cache.set("task:id:1", &"not a number", cache.default_ttl()).await;

        let got: Option<u64> = cache.get("task:id:1").await;
        assert_eq!(got, None);
    }
}
