use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Whole-response cache keyed by route, each entry valid for `ttl`.
pub struct PageCache<V> {
    ttl: Duration,
    inner: Mutex<Inner<V>>,
}

struct Inner<V> {
    /// Bumped by every `invalidate_all`.
    generation: u64,
    entries: HashMap<String, (Instant, V)>,
}

impl<V: Clone> PageCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(Inner {
                generation: 0,
                entries: HashMap::new(),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let mut inner = self.inner.lock().ok()?;
        let (stored, value) = inner.entries.get(key)?;
        if now.duration_since(*stored) < self.ttl {
            return Some(value.clone());
        }
        inner.entries.remove(key);
        None
    }

    /// Current generation; take it before loading a value to insert.
    pub fn generation(&self) -> u64 {
        self.inner.lock().map(|inner| inner.generation).unwrap_or(u64::MAX)
    }

    #[cfg(test)]
    pub fn insert(&self, key: &str, value: V) {
        let generation = self.generation();
        self.insert_if_current(key, value, generation);
    }

    /// Store `value` only if no invalidation happened since `generation`
    /// was read. Returns whether it was stored.
    pub fn insert_if_current(&self, key: &str, value: V, generation: u64) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        if inner.generation != generation {
            return false;
        }
        inner.entries.insert(key.to_string(), (Instant::now(), value));
        true
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.generation = inner.generation.wrapping_add(1);
            inner.entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_then_expire() {
        let cache = PageCache::new(Duration::from_secs(60));
        cache.insert("/records", 7);
        assert_eq!(cache.get("/records"), Some(7));
        assert_eq!(cache.get("/duplicates"), None);

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(cache.get_at("/records", later), None);
        // Expired entries are evicted
        assert_eq!(cache.get("/records"), None);
    }

    #[test]
    fn test_zero_ttl_never_hits() {
        let cache = PageCache::new(Duration::ZERO);
        cache.insert("/records", "x".to_string());
        assert_eq!(cache.get("/records"), None);
    }

    #[test]
    fn test_invalidate_all() {
        let cache = PageCache::new(Duration::from_secs(60));
        cache.insert("/records", 1);
        cache.insert("/duplicates", 2);
        cache.invalidate_all();
        assert_eq!(cache.get("/records"), None);
        assert_eq!(cache.get("/duplicates"), None);
    }

    #[test]
    fn test_value_loaded_before_invalidation_is_not_cached() {
        let cache = PageCache::new(Duration::from_secs(60));
        let generation = cache.generation();

        // A write lands and clears the cache while the old rows are in hand
        cache.invalidate_all();

        assert!(!cache.insert_if_current("/records", "stale".to_string(), generation));
        assert_eq!(cache.get("/records"), None);

        let generation = cache.generation();
        assert!(cache.insert_if_current("/records", "fresh".to_string(), generation));
        assert_eq!(cache.get("/records"), Some("fresh".to_string()));
    }
}
