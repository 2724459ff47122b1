use async_trait::async_trait;
use desk_protocol::QueryHints;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Injected cache interface so the orchestration logic stays testable with
/// an in-memory fake. Values are serialized JSON; writes are idempotent
/// (last-writer-wins), which is safe since values derive from the key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<serde_json::Value>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration);
}

pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

struct Envelope {
    created_ms: u64,
    ttl_ms: u64,
    value: serde_json::Value,
}

impl Envelope {
    fn expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.created_ms) > self.ttl_ms
    }
}

struct Inner {
    map: HashMap<String, Envelope>,
    order: VecDeque<String>,
}

impl Inner {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
        self.order.push_front(key.to_string());
    }
}

/// In-memory TTL cache with LRU capacity eviction. Expiry is checked on
/// read; `sweep` reclaims expired entries that are never read again.
pub struct MemoryCache {
    capacity: usize,
    inner: Mutex<Inner>,
    hits: AtomicU64,
    lookups: AtomicU64,
}

impl MemoryCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            hits: AtomicU64::new(0),
            lookups: AtomicU64::new(0),
        }
    }

    /// Fraction of lookups served from cache since startup.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.lookups.load(Ordering::Relaxed);
        if lookups == 0 {
            return 0.0;
        }
        self.hits.load(Ordering::Relaxed) as f64 / lookups as f64
    }

    pub fn sweep(&self) {
        let now = unix_ms_now();
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let expired: Vec<String> = inner
            .map
            .iter()
            .filter(|(_, env)| env.expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.map.remove(&key);
            if let Some(pos) = inner.order.iter().position(|k| *k == key) {
                inner.order.remove(pos);
            }
        }
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        let expired = match inner.map.get(key) {
            Some(env) => env.expired(unix_ms_now()),
            None => return None,
        };
        if expired {
            inner.map.remove(key);
            if let Some(pos) = inner.order.iter().position(|k| k == key) {
                inner.order.remove(pos);
            }
            return None;
        }
        inner.touch(key);
        self.hits.fetch_add(1, Ordering::Relaxed);
        inner.map.get(key).map(|env| env.value.clone())
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let mut inner = self.inner.lock().expect("cache mutex poisoned");
        inner.map.insert(
            key.to_string(),
            Envelope {
                created_ms: unix_ms_now(),
                ttl_ms: u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX),
                value,
            },
        );
        inner.touch(key);
        while inner.order.len() > self.capacity {
            if let Some(old) = inner.order.pop_back() {
                inner.map.remove(&old);
            }
        }
    }
}

/// Periodic sweep task; stops when `shutdown` flips.
pub fn spawn_sweeper(
    cache: Arc<MemoryCache>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => cache.sweep(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Lowercase, whitespace-collapsed form of a query used for cache keying.
#[must_use]
pub fn normalize_query(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['?', '!', '.'])
        .to_string()
}

/// Cache key over the normalized query, session and the parameters that can
/// change the answer.
#[must_use]
pub fn answer_cache_key(query_text: &str, session_id: &str, hints: &QueryHints) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(normalize_query(query_text).as_bytes());
    hasher.update(b"|");
    hasher.update(session_id.as_bytes());
    hasher.update(b"|");
    hasher.update(hints.model.as_deref().unwrap_or("").as_bytes());
    hasher.update(b"|");
    hasher.update(format!("{:?}", hints.temperature).as_bytes());
    hasher.update(b"|");
    hasher.update(if hints.use_consensus { b"1" } else { b"0" });
    hasher.finalize().to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_after_set_within_ttl() {
        let cache = MemoryCache::new(4);
        cache
            .set("k", serde_json::json!({"v": 1}), Duration::from_secs(60))
            .await;
        assert_eq!(cache.get("k").await.unwrap()["v"], 1);
        assert!(cache.hit_rate() > 0.99);
    }

    #[tokio::test]
    async fn expired_entries_are_dropped_on_read() {
        let cache = MemoryCache::new(4);
        cache
            .set("k", serde_json::json!(1), Duration::from_millis(0))
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let cache = MemoryCache::new(2);
        cache.set("a", serde_json::json!(1), Duration::from_secs(60)).await;
        cache.set("b", serde_json::json!(2), Duration::from_secs(60)).await;
        // Touch "a" so "b" becomes the eviction victim.
        let _ = cache.get("a").await;
        cache.set("c", serde_json::json!(3), Duration::from_secs(60)).await;
        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
    }

    #[test]
    fn normalization_ignores_case_whitespace_and_trailing_punctuation() {
        assert_eq!(
            normalize_query("  How do I   reset DNS? "),
            normalize_query("how do i reset dns")
        );
    }

    #[test]
    fn key_depends_on_session_and_parameters() {
        let hints = QueryHints::default();
        let base = answer_cache_key("q", "s1", &hints);
        assert_eq!(base, answer_cache_key("q", "s1", &hints));
        assert_ne!(base, answer_cache_key("q", "s2", &hints));
        let consensus = QueryHints {
            use_consensus: true,
            ..QueryHints::default()
        };
        assert_ne!(base, answer_cache_key("q", "s1", &consensus));
    }

    #[test]
    fn sweep_reclaims_expired_entries() {
        let cache = MemoryCache::new(8);
        futures_block(cache.set("k", serde_json::json!(1), Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        cache.sweep();
        let inner = cache.inner.lock().unwrap();
        assert!(inner.map.is_empty());
        assert!(inner.order.is_empty());
    }

    fn futures_block<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap()
            .block_on(fut)
    }
}
