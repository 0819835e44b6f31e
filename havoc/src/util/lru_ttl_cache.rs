use std::time::{Duration, Instant};

use hashlink::LinkedHashMap;

/// A bounded LRU cache where every entry carries its own expiry deadline.
///
/// Lookups refresh recency; expired entries are treated as absent and evicted
/// on contact. Inserting past the capacity evicts the least recently used
/// entries first.
pub struct LruTtlCache<K, V> {
  cache: LinkedHashMap<K, (V, Instant)>,
  max_size: usize,
}

impl<K, V> LruTtlCache<K, V>
where
  K: std::cmp::Eq + std::hash::Hash + Clone,
  V: Clone,
{
  pub fn new(max_size: usize) -> Self {
    Self {
      cache: LinkedHashMap::new(),
      max_size,
    }
  }

  /// Inserts an entry that expires after `ttl`, evicting LRU entries to stay
  /// within the size bound.
  pub fn insert(&mut self, key: K, value: V, ttl: Duration) {
    self.insert_until(key, value, Instant::now() + ttl);
  }

  /// Inserts an entry with an absolute expiry deadline.
  pub fn insert_until(&mut self, key: K, value: V, expiry: Instant) {
    self.cache.remove(&key);
    while self.cache.len() >= self.max_size {
      self.cache.pop_front();
    }
    self.cache.insert(key, (value, expiry));
  }

  /// Returns a clone of the live entry and marks it most recently used.
  pub fn get(&mut self, key: &K) -> Option<V> {
    let (value, expiry) = match self.cache.to_back(key) {
      Some(entry) => entry.clone(),
      None => return None,
    };
    if expiry <= Instant::now() {
      self.cache.remove(key);
      return None;
    }
    Some(value)
  }

  #[allow(dead_code)]
  pub fn remove(&mut self, key: &K) -> Option<V> {
    self.cache.remove(key).map(|(value, _)| value)
  }

  pub fn len(&self) -> usize {
    self.cache.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_insert_and_get() {
    let mut cache = LruTtlCache::new(10);
    cache.insert("key1", "value1", Duration::from_secs(5));

    assert_eq!(cache.get(&"key1"), Some("value1"));
  }

  #[test]
  fn test_get_expired() {
    let mut cache = LruTtlCache::new(10);
    cache.insert_until("key1", "value1", Instant::now() - Duration::from_secs(1));

    assert_eq!(cache.get(&"key1"), None);
    assert_eq!(cache.len(), 0);
  }

  #[test]
  fn test_lru_eviction_order() {
    let mut cache = LruTtlCache::new(2);
    cache.insert("key1", 1, Duration::from_secs(60));
    cache.insert("key2", 2, Duration::from_secs(60));

    // Touch key1 so that key2 becomes the eviction candidate
    assert_eq!(cache.get(&"key1"), Some(1));
    cache.insert("key3", 3, Duration::from_secs(60));

    assert_eq!(cache.get(&"key2"), None);
    assert_eq!(cache.get(&"key1"), Some(1));
    assert_eq!(cache.get(&"key3"), Some(3));
  }

  #[test]
  fn test_reinsert_replaces_entry() {
    let mut cache = LruTtlCache::new(2);
    cache.insert("key1", 1, Duration::from_secs(60));
    cache.insert("key1", 2, Duration::from_secs(60));

    assert_eq!(cache.len(), 1);
    assert_eq!(cache.get(&"key1"), Some(2));
  }
}
