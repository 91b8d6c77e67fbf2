// Bounded synchronized cache for compiled patterns and match results.

use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

/// Capacity used by the engine's pattern caches.
pub const DEFAULT_CACHE_SIZE: usize = 100;

/// An LRU cache behind a mutex. Values are cloned out so callers never hold
/// the lock; the cached types (compiled regexes, glob matchers, bools) are
/// cheap to clone.
pub struct SyncLruCache<K: Hash + Eq, V: Clone> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> SyncLruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        SyncLruCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        self.inner.lock().put(key, value);
    }

    /// Looks up `key`, computing and caching the value on a miss.
    pub fn get_or_try_insert<E>(
        &self,
        key: K,
        build: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E>
    where
        K: Clone,
    {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }
        let value = build()?;
        self.put(key, value.clone());
        Ok(value)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}
