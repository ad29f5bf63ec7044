//! Capacity and TTL bounded cache.
//!
//! LRU eviction once `capacity` is reached, plus per-entry expiry checked on
//! read. Values are cloned out so callers never hold the lock.

use lru::LruCache;
use std::borrow::Borrow;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Slot<V> {
    value: V,
    expires_at: Instant,
}

pub struct TtlCache<K: Hash + Eq, V> {
    name: &'static str,
    default_ttl: Duration,
    inner: Mutex<LruCache<K, Slot<V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(name: &'static str, capacity: usize, default_ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { name, default_ttl, inner: Mutex::new(LruCache::new(capacity)) }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<K, Slot<V>>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut cache = self.lock();
        let expired = match cache.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => return Some(slot.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            cache.pop(key);
            tracing::trace!("[Cache:{}] expired entry dropped", self.name);
        }
        None
    }

    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get(key).is_some()
    }

    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.default_ttl);
    }

    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let slot = Slot { value, expires_at: Instant::now() + ttl };
        self.lock().put(key, slot);
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lock().pop(key).map(|slot| slot.value)
    }

    /// Drop every entry whose key matches `predicate`. Returns how many went.
    pub fn remove_where(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let mut cache = self.lock();
        let doomed: Vec<K> = cache.iter().filter(|(k, _)| predicate(k)).map(|(k, _)| k.clone()).collect();
        for key in &doomed {
            cache.pop(key);
        }
        doomed.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry() {
        let cache: TtlCache<String, u64> = TtlCache::new("test", 8, Duration::from_secs(60));
        cache.insert_with_ttl("short".into(), 1, Duration::from_millis(20));
        cache.insert("long".into(), 2);

        assert_eq!(cache.get("short"), Some(1));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_evicts_least_recent() {
        let cache: TtlCache<&'static str, u64> = TtlCache::new("test", 2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_remove_where() {
        let cache: TtlCache<String, u64> = TtlCache::new("test", 8, Duration::from_secs(60));
        for key in ["a", "a/b", "c"] {
            cache.insert(key.to_string(), 0);
        }
        assert_eq!(cache.remove_where(|k| k.starts_with('a')), 2);
        assert!(cache.contains("c"));
        assert!(!cache.contains("a/b"));
    }
}
