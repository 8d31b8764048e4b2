use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    stored_at: Instant,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    /// Bumped by every invalidation.
    generation: u64,
}

/// Short-lived memo of read results, keyed by canonical query signature.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    ttl: Duration,
    inner: Arc<Mutex<CacheState>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(Mutex::new(CacheState::default())),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Fresh value for `key`; a stale entry is removed on the way out.
    pub async fn get(&self, key: &str) -> Option<Value> {
        let mut state = self.inner.lock().await;
        let map = &mut state.entries;
        let fresh = match map.get(key) {
            Some(entry) => entry.stored_at.elapsed() < self.ttl,
            None => return None,
        };
        if fresh {
            map.get(key).map(|entry| entry.value.clone())
        } else {
            trace!(key, "cache entry expired");
            map.remove(key);
            None
        }
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) {
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
        };
        self.inner.lock().await.entries.insert(key.into(), entry);
    }

    /// Current invalidation generation. A read captures it before going to
    /// the network and hands it back to [`ResponseCache::set_if_current`].
    pub async fn generation(&self) -> u64 {
        self.inner.lock().await.generation
    }

    /// Store `value` unless an invalidation ran since `generation` was read,
    /// in which case the value may predate a write and is dropped.
    pub async fn set_if_current(&self, key: impl Into<String>, value: Value, generation: u64) -> bool {
        let mut state = self.inner.lock().await;
        if state.generation != generation {
            trace!(generation, current = state.generation, "read raced an invalidation, not cached");
            return false;
        }
        let entry = CacheEntry {
            value,
            stored_at: Instant::now(),
        };
        state.entries.insert(key.into(), entry);
        true
    }

    /// Drop every key containing `prefix`, or everything when `None`.
    /// Returns how many entries were removed.
    pub async fn invalidate(&self, prefix: Option<&str>) -> usize {
        let mut state = self.inner.lock().await;
        state.generation = state.generation.wrapping_add(1);
        let map = &mut state.entries;
        let before = map.len();
        match prefix {
            Some(fragment) => map.retain(|key, _| !key.contains(fragment)),
            None => map.clear(),
        }
        let removed = before - map.len();
        trace!(prefix = prefix.unwrap_or("*"), removed, "cache invalidated");
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.entries.is_empty()
    }
}

/// `<path segments joined by '_'>_<params as JSON with sorted keys>`.
///
/// The params map is ordered, so the same filters given in any insertion
/// order yield the same key.
pub fn cache_key(path: &str, params: &BTreeMap<String, String>) -> String {
    let resource = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>()
        .join("_");
    let params = serde_json::to_string(params).unwrap_or_else(|_| "{}".to_string());
    format!("{}_{}", resource, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn value_expires_after_ttl() {
        let cache = ResponseCache::default();
        let patients = json!([{"id": 1}, {"id": 2}]);
        cache.set("patients_{}", patients.clone()).await;

        assert_eq!(cache.get("patients_{}").await, Some(patients.clone()));

        tokio::time::advance(DEFAULT_TTL - Duration::from_secs(1)).await;
        assert_eq!(cache.get("patients_{}").await, Some(patients));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("patients_{}").await, None);
        assert!(cache.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn set_overwrites_and_restarts_clock() {
        let cache = ResponseCache::new(Duration::from_secs(10));
        cache.set("k", json!(1)).await;
        tokio::time::advance(Duration::from_secs(8)).await;
        cache.set("k", json!(2)).await;
        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(cache.get("k").await, Some(json!(2)));
    }

    #[tokio::test]
    async fn invalidate_by_substring_leaves_unrelated_keys() {
        let cache = ResponseCache::default();
        cache.set("patients_{}", json!([])).await;
        cache.set(r#"patients_{"search":"ama"}"#, json!([])).await;
        cache.set("patients_stats_{}", json!({})).await;
        cache.set("inventory_x", json!([])).await;

        assert_eq!(cache.invalidate(Some("patients")).await, 3);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get("inventory_x").await.is_some());
    }

    #[tokio::test]
    async fn read_started_before_invalidation_is_not_stored() {
        let cache = ResponseCache::default();
        let generation = cache.generation().await;

        cache.invalidate(Some("patients")).await;

        assert!(!cache.set_if_current("patients_{}", json!(["old"]), generation).await);
        assert!(cache.get("patients_{}").await.is_none());

        let generation = cache.generation().await;
        assert!(cache.set_if_current("patients_{}", json!(["new"]), generation).await);
        assert_eq!(cache.get("patients_{}").await, Some(json!(["new"])));
    }

    #[tokio::test]
    async fn invalidate_everything() {
        let cache = ResponseCache::default();
        cache.set("a", json!(1)).await;
        cache.set("b", json!(2)).await;
        assert_eq!(cache.invalidate(None).await, 2);
        assert!(cache.is_empty().await);
    }

    #[test]
    fn key_is_canonical() {
        let mut first = BTreeMap::new();
        first.insert("search".to_string(), "ama".to_string());
        first.insert("gender".to_string(), "F".to_string());

        let mut second = BTreeMap::new();
        second.insert("gender".to_string(), "F".to_string());
        second.insert("search".to_string(), "ama".to_string());

        assert_eq!(cache_key("/patients/", &first), cache_key("patients", &second));
        assert_eq!(
            cache_key("/patients/", &first),
            r#"patients_{"gender":"F","search":"ama"}"#
        );
    }

    #[test]
    fn key_for_nested_path_without_params() {
        assert_eq!(cache_key("/patients/", &BTreeMap::new()), "patients_{}");
        assert_eq!(
            cache_key("/billing/invoices/pending/", &BTreeMap::new()),
            "billing_invoices_pending_{}"
        );
    }
}
