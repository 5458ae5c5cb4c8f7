use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Entry-count-bounded LRU cache, safe under concurrent access.
/// Used for embeddings and search results; values are cloned out.
pub struct LruCache<V: Clone> {
    inner: Mutex<LruInner<V>>,
    capacity: usize,
}

struct LruInner<V> {
    map: HashMap<String, V>,
    // Front = least recently used. Keys may appear once.
    order: VecDeque<String>,
}

impl<V: Clone> LruCache<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();
        let value = inner.map.get(key)?.clone();

        if let Some(pos) = inner.order.iter().position(|k| k == key) {
            inner.order.remove(pos);
        }
        inner.order.push_back(key.to_string());

        Some(value)
    }

    pub fn put(&self, key: String, value: V) {
        let mut inner = self.inner.lock();

        if inner.map.insert(key.clone(), value).is_some() {
            if let Some(pos) = inner.order.iter().position(|k| *k == key) {
                inner.order.remove(pos);
            }
        }
        inner.order.push_back(key);

        while inner.map.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.map.remove(&evicted);
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_get() {
        let cache: LruCache<i32> = LruCache::new(4);
        cache.put("a".into(), 1);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
    }

    #[test]
    fn test_eviction_is_least_recently_used() {
        let cache: LruCache<i32> = LruCache::new(2);
        cache.put("a".into(), 1);
        cache.put("b".into(), 2);

        // Touch "a" so "b" becomes the eviction candidate.
        cache.get("a");
        cache.put("c".into(), 3);

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_overwrite_does_not_grow() {
        let cache: LruCache<i32> = LruCache::new(2);
        cache.put("a".into(), 1);
        cache.put("a".into(), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a"), Some(2));
    }

    #[test]
    fn test_capacity_floor_of_one() {
        let cache: LruCache<i32> = LruCache::new(0);
        cache.put("a".into(), 1);
        cache.put("b".into(), 2);
        assert_eq!(cache.len(), 1);
    }
}
