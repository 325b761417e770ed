//! Result cache with TTL, upsert semantics and single-flight computes.
//!
//! The cache is keyed by a 16-byte digest (rendered as 32 hex characters)
//! over the normalized query, the canonicalized context and the
//! canonicalized options. Storage goes through the [`CacheStore`] trait —
//! Postgres (`search_cache` table) in production, [`MemoryCacheStore`] in
//! tests — and every storage failure degrades to a miss or a discarded
//! write, never to a request failure.
//!
//! Concurrent misses on one key are serialized by a keyed mutex: exactly one
//! request computes, the rest wait (subject to their own deadline) and then
//! serve from the freshly stored entry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::Row;
use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard};
use tracing::warn;

use crate::models::SearchOptions;

/// One cached entry. The cache owns its entries; readers always get copies.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub normalized_query: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub hit_count: i64,
    pub last_access: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub approx_bytes: u64,
}

/// Storage backend for cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch the raw entry, expired or not. Expiry policy lives in
    /// [`ResultCache`].
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Record a hit: `hit_count += 1`, `last_access := now`.
    async fn touch(&self, key: &str) -> Result<()>;

    /// Upsert. A fresh key stores with `hit_count = 1`; an existing key gets
    /// its payload and expiry replaced and `hit_count += 1`.
    async fn put(&self, entry: CacheEntry) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Remove entries whose normalized query contains `pattern`.
    async fn invalidate(&self, pattern: &str) -> Result<u64>;

    /// Remove expired entries; returns how many went away.
    async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64>;

    /// (entry count, approximate payload bytes).
    async fn usage(&self) -> Result<(u64, u64)>;
}

// ============ Cache key ============

/// Render a JSON value with all object keys sorted, recursively, so that
/// semantically equal contexts digest identically.
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", rendered.join(","))
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Compute the cache key for one request:
/// `digest(normalized_query || 0x1f || canonical(context) || 0x1f || canonical(options))`,
/// truncated to 16 bytes and rendered as 32 lowercase hex characters.
pub fn cache_key(
    normalized_query: &str,
    context: &serde_json::Value,
    options: &SearchOptions,
) -> String {
    let options_value = serde_json::to_value(options).unwrap_or(serde_json::Value::Null);

    let mut hasher = Sha256::new();
    hasher.update(normalized_query.as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_json(context).as_bytes());
    hasher.update([0x1f]);
    hasher.update(canonical_json(&options_value).as_bytes());
    let digest = hasher.finalize();

    digest[..16].iter().map(|b| format!("{:02x}", b)).collect()
}

// ============ Postgres store ============

/// [`CacheStore`] over the `search_cache` table.
pub struct PgCacheStore {
    pool: PgPool,
}

impl PgCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheStore for PgCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            "SELECT key, normalized_query, payload, created_at, expires_at, hit_count, last_access \
             FROM search_cache WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| CacheEntry {
            key: r.get("key"),
            normalized_query: r.get("normalized_query"),
            payload: r.get("payload"),
            created_at: r.get("created_at"),
            expires_at: r.get("expires_at"),
            hit_count: r.get::<i32, _>("hit_count") as i64,
            last_access: r.get("last_access"),
        }))
    }

    async fn touch(&self, key: &str) -> Result<()> {
        sqlx::query(
            "UPDATE search_cache SET hit_count = hit_count + 1, last_access = NOW() WHERE key = $1",
        )
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO search_cache (key, normalized_query, payload, created_at, expires_at, hit_count, last_access) \
             VALUES ($1, $2, $3, $4, $5, 1, $6) \
             ON CONFLICT (key) DO UPDATE SET \
               payload = EXCLUDED.payload, \
               expires_at = EXCLUDED.expires_at, \
               last_access = EXCLUDED.last_access, \
               hit_count = search_cache.hit_count + 1",
        )
        .bind(&entry.key)
        .bind(&entry.normalized_query)
        .bind(&entry.payload)
        .bind(entry.created_at)
        .bind(entry.expires_at)
        .bind(entry.last_access)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM search_cache WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> Result<u64> {
        let escaped = pattern.replace('%', "\\%").replace('_', "\\_");
        let result = sqlx::query("DELETE FROM search_cache WHERE normalized_query LIKE $1")
            .bind(format!("%{}%", escaped))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM search_cache WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn usage(&self) -> Result<(u64, u64)> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS entries, COALESCE(SUM(pg_column_size(payload)), 0) AS bytes \
             FROM search_cache",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok((
            row.get::<i64, _>("entries") as u64,
            row.get::<i64, _>("bytes") as u64,
        ))
    }
}

// ============ In-memory store ============

/// In-memory [`CacheStore`] for tests and cache-less deployments. Evicts the
/// least recently accessed entry when full.
pub struct MemoryCacheStore {
    entries: StdMutex<HashMap<String, CacheEntry>>,
    max_entries: usize,
}

impl MemoryCacheStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: StdMutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn touch(&self, key: &str) -> Result<()> {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(key) {
            entry.hit_count += 1;
            entry.last_access = Utc::now();
        }
        Ok(())
    }

    async fn put(&self, mut entry: CacheEntry) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(&entry.key) {
            entry.hit_count = existing.hit_count + 1;
            entry.created_at = existing.created_at;
        } else {
            entry.hit_count = 1;
            if entries.len() >= self.max_entries {
                let oldest = entries
                    .values()
                    .min_by_key(|e| e.last_access)
                    .map(|e| e.key.clone());
                if let Some(k) = oldest {
                    entries.remove(&k);
                }
            }
        }
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn invalidate(&self, pattern: &str) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| !e.normalized_query.contains(pattern));
        Ok((before - entries.len()) as u64)
    }

    async fn cleanup(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        Ok((before - entries.len()) as u64)
    }

    async fn usage(&self) -> Result<(u64, u64)> {
        let entries = self.entries.lock().unwrap();
        let bytes: usize = entries
            .values()
            .map(|e| e.payload.to_string().len())
            .sum();
        Ok((entries.len() as u64, bytes as u64))
    }
}

// ============ Service ============

/// The cache service used by the pipeline: expiry policy, hit/miss counters
/// and the single-flight keyed mutex live here; storage is behind the trait.
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    ttl: ChronoDuration,
    hits: AtomicU64,
    misses: AtomicU64,
    inflight: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, ttl_secs: u64) -> Self {
        Self {
            store,
            ttl: ChronoDuration::seconds(ttl_secs as i64),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    /// Acquire the per-key compute lock. Callers hold the guard across the
    /// whole miss-then-compute-then-put window so identical concurrent
    /// requests wait instead of recomputing.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut inflight = self.inflight.lock().unwrap();
            // Drop slots nobody is waiting on anymore.
            inflight.retain(|k, v| k == key || Arc::strong_count(v) > 1);
            inflight
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(TokioMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Look up a key. Expired entries count as misses and are deleted.
    /// Store failures degrade to a miss.
    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        let entry = match self.store.get(key).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "cache store get failed, treating as miss");
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match entry {
            Some(entry) if entry.expires_at > Utc::now() => {
                if let Err(e) = self.store.touch(key).await {
                    warn!(error = %e, "cache touch failed");
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.payload)
            }
            Some(entry) => {
                // Expired: report a miss and drop the stale entry.
                if let Err(e) = self.store.delete(&entry.key).await {
                    warn!(error = %e, "stale cache delete failed");
                }
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Upsert a payload under the default TTL. Store failures discard the
    /// write.
    pub async fn put(&self, key: &str, normalized_query: &str, payload: serde_json::Value) {
        let now = Utc::now();
        let entry = CacheEntry {
            key: key.to_string(),
            normalized_query: normalized_query.to_string(),
            payload,
            created_at: now,
            expires_at: now + self.ttl,
            hit_count: 1,
            last_access: now,
        };
        if let Err(e) = self.store.put(entry).await {
            warn!(error = %e, "cache store put failed, discarding entry");
        }
    }

    pub async fn invalidate(&self, pattern: &str) -> u64 {
        match self.store.invalidate(pattern).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "cache invalidate failed");
                0
            }
        }
    }

    pub async fn cleanup(&self) -> u64 {
        match self.store.cleanup(Utc::now()).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "cache cleanup failed");
                0
            }
        }
    }

    pub async fn stats(&self) -> CacheStats {
        let (entries, approx_bytes) = self.store.usage().await.unwrap_or((0, 0));
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            approx_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::normalize_query;

    fn memory_cache(ttl_secs: u64) -> ResultCache {
        ResultCache::new(Arc::new(MemoryCacheStore::new(100)), ttl_secs)
    }

    #[test]
    fn key_is_32_lowercase_hex() {
        let key = cache_key("고객 목록", &serde_json::json!({}), &SearchOptions::default());
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn key_is_normalization_invariant() {
        let options = SearchOptions::default();
        let ctx = serde_json::json!({"dept": "sales"});
        let a = cache_key(&normalize_query("  고객   목록 "), &ctx, &options);
        let b = cache_key(&normalize_query("고객 목록"), &ctx, &options);
        assert_eq!(a, b);
    }

    #[test]
    fn key_ignores_context_key_order() {
        let options = SearchOptions::default();
        let a = cache_key("q", &serde_json::json!({"a": 1, "b": 2}), &options);
        let b = cache_key("q", &serde_json::json!({"b": 2, "a": 1}), &options);
        assert_eq!(a, b);
    }

    #[test]
    fn key_differs_per_options() {
        let mut options = SearchOptions::default();
        let a = cache_key("q", &serde_json::json!({}), &options);
        options.limit = 50;
        let b = cache_key("q", &serde_json::json!({}), &options);
        assert_ne!(a, b);
    }

    #[test]
    fn canonical_json_sorts_nested_objects() {
        let v = serde_json::json!({"z": {"b": 1, "a": [{"y": 2, "x": 3}]}, "a": null});
        assert_eq!(
            canonical_json(&v),
            r#"{"a":null,"z":{"a":[{"x":3,"y":2}],"b":1}}"#
        );
    }

    #[tokio::test]
    async fn put_then_get_hits() {
        let cache = memory_cache(300);
        cache.put("k1", "고객 목록", serde_json::json!({"rows": []})).await;
        assert!(cache.get("k1").await.is_some());
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn hit_count_follows_put_then_gets() {
        let store = Arc::new(MemoryCacheStore::new(10));
        let cache = ResultCache::new(store.clone(), 300);

        cache.put("k", "q", serde_json::json!(1)).await;
        assert_eq!(store.get("k").await.unwrap().unwrap().hit_count, 1);

        cache.get("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap().hit_count, 2);
    }

    #[tokio::test]
    async fn expired_entry_is_a_miss_and_gets_dropped() {
        let store = Arc::new(MemoryCacheStore::new(10));
        let cache = ResultCache::new(store.clone(), 300);

        let past = Utc::now() - ChronoDuration::seconds(10);
        store
            .put(CacheEntry {
                key: "old".to_string(),
                normalized_query: "q".to_string(),
                payload: serde_json::json!(1),
                created_at: past,
                expires_at: past,
                hit_count: 1,
                last_access: past,
            })
            .await
            .unwrap();

        assert!(cache.get("old").await.is_none());
        assert!(store.get("old").await.unwrap().is_none());
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn upsert_bumps_hit_count_and_replaces_payload() {
        let store = Arc::new(MemoryCacheStore::new(10));
        let cache = ResultCache::new(store.clone(), 300);

        cache.put("k", "q", serde_json::json!("v1")).await;
        cache.put("k", "q", serde_json::json!("v2")).await;

        let entry = store.get("k").await.unwrap().unwrap();
        assert_eq!(entry.hit_count, 2);
        assert_eq!(entry.payload, serde_json::json!("v2"));
    }

    #[tokio::test]
    async fn invalidate_matches_substring_of_normalized_query() {
        let cache = memory_cache(300);
        cache.put("k1", "고객 목록", serde_json::json!(1)).await;
        cache.put("k2", "메모 검색", serde_json::json!(2)).await;

        assert_eq!(cache.invalidate("고객").await, 1);
        assert!(cache.get("k1").await.is_none());
        assert!(cache.get("k2").await.is_some());
    }

    #[tokio::test]
    async fn cleanup_sweeps_expired_only() {
        let store = Arc::new(MemoryCacheStore::new(10));
        let cache = ResultCache::new(store.clone(), 300);

        let past = Utc::now() - ChronoDuration::seconds(5);
        store
            .put(CacheEntry {
                key: "stale".into(),
                normalized_query: "q".into(),
                payload: serde_json::json!(1),
                created_at: past,
                expires_at: past,
                hit_count: 1,
                last_access: past,
            })
            .await
            .unwrap();
        cache.put("fresh", "q", serde_json::json!(2)).await;

        assert_eq!(cache.cleanup().await, 1);
        assert!(cache.get("fresh").await.is_some());
    }

    #[tokio::test]
    async fn single_flight_serializes_computes() {
        use std::sync::atomic::AtomicU32;

        let cache = Arc::new(memory_cache(300));
        let computes = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let computes = computes.clone();
            handles.push(tokio::spawn(async move {
                let _guard = cache.lock_key("shared").await;
                if cache.get("shared").await.is_none() {
                    computes.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    cache.put("shared", "q", serde_json::json!("computed")).await;
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(computes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_store_degrades_to_noop() {
        struct FailingStore;

        #[async_trait]
        impl CacheStore for FailingStore {
            async fn get(&self, _key: &str) -> Result<Option<CacheEntry>> {
                anyhow::bail!("backing store unavailable")
            }
            async fn touch(&self, _key: &str) -> Result<()> {
                anyhow::bail!("backing store unavailable")
            }
            async fn put(&self, _entry: CacheEntry) -> Result<()> {
                anyhow::bail!("backing store unavailable")
            }
            async fn delete(&self, _key: &str) -> Result<()> {
                anyhow::bail!("backing store unavailable")
            }
            async fn invalidate(&self, _pattern: &str) -> Result<u64> {
                anyhow::bail!("backing store unavailable")
            }
            async fn cleanup(&self, _now: DateTime<Utc>) -> Result<u64> {
                anyhow::bail!("backing store unavailable")
            }
            async fn usage(&self) -> Result<(u64, u64)> {
                anyhow::bail!("backing store unavailable")
            }
        }

        let cache = ResultCache::new(Arc::new(FailingStore), 300);
        assert!(cache.get("k").await.is_none());
        cache.put("k", "q", serde_json::json!(1)).await; // discarded silently
        assert_eq!(cache.invalidate("q").await, 0);
        assert_eq!(cache.cleanup().await, 0);
        let stats = cache.stats().await;
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn memory_store_evicts_least_recently_accessed() {
        let store = MemoryCacheStore::new(2);
        let now = Utc::now();
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            store
                .put(CacheEntry {
                    key: key.to_string(),
                    normalized_query: key.to_string(),
                    payload: serde_json::json!(i),
                    created_at: now,
                    expires_at: now + ChronoDuration::seconds(60),
                    hit_count: 1,
                    last_access: now + ChronoDuration::milliseconds(i as i64),
                })
                .await
                .unwrap();
        }
        let (count, _) = store.usage().await.unwrap();
        assert_eq!(count, 2);
        assert!(store.get("a").await.unwrap().is_none());
    }
}
