//! Caches the decompressed artifacts a query walk touches most: per-index
//! SSTable index blocks and per-SSTable value logs. Both are bounded by
//! total byte weight rather than entry count, so a handful of large value
//! logs can't starve the cache the way a pure count-based bound would.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::sstable::SsTableIndex;

/// Identifies one cached artifact. `index_id` is `None` for a value log,
/// since a value log is shared by every index of its SSTable rather than
/// belonging to one of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub database_id: u64,
    pub table_id: u64,
    pub index_id: Option<u64>,
    pub level: u32,
    pub sstable_id: u64,
}

impl CacheKey {
    pub fn for_index(database_id: u64, table_id: u64, index_id: u64, level: u32, sstable_id: u64) -> Self {
        CacheKey { database_id, table_id, index_id: Some(index_id), level, sstable_id }
    }

    pub fn for_value_log(database_id: u64, table_id: u64, level: u32, sstable_id: u64) -> Self {
        CacheKey { database_id, table_id, index_id: None, level, sstable_id }
    }
}

/// Byte-weighted LRU over `Arc<V>` values, shared freely by cache hits
/// without re-cloning the underlying data.
struct ArcLruCache<V> {
    entries: HashMap<CacheKey, Arc<V>>,
    order: VecDeque<CacheKey>,
    weights: HashMap<CacheKey, usize>,
    size_bytes: usize,
    capacity_bytes: usize,
}

impl<V> ArcLruCache<V> {
    fn new(capacity_bytes: usize) -> Self {
        ArcLruCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
            weights: HashMap::new(),
            size_bytes: 0,
            capacity_bytes,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<Arc<V>> {
        if self.entries.contains_key(key) {
            self.touch(key);
            self.entries.get(key).cloned()
        } else {
            None
        }
    }

    fn put(&mut self, key: CacheKey, value: Arc<V>, weight: usize) {
        if let Some(old_weight) = self.weights.remove(&key) {
            self.size_bytes -= old_weight;
            self.order.retain(|k| k != &key);
        }
        self.size_bytes += weight;
        self.order.push_back(key);
        self.weights.insert(key, weight);
        self.entries.insert(key, value);

        while self.size_bytes > self.capacity_bytes {
            match self.order.pop_front() {
                Some(evicted_key) => {
                    self.entries.remove(&evicted_key);
                    if let Some(w) = self.weights.remove(&evicted_key) {
                        self.size_bytes -= w;
                    }
                }
                None => break,
            }
        }
    }

    fn touch(&mut self, key: &CacheKey) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Holds decoded SSTable indexes and decompressed value logs behind one
/// byte budget each, keyed by where in the level/sstable/index hierarchy
/// they came from.
pub struct SstableCache {
    indexes: ArcLruCache<SsTableIndex>,
    value_logs: ArcLruCache<Vec<u8>>,
}

impl SstableCache {
    pub fn new(index_capacity_bytes: usize, value_log_capacity_bytes: usize) -> Self {
        SstableCache {
            indexes: ArcLruCache::new(index_capacity_bytes),
            value_logs: ArcLruCache::new(value_log_capacity_bytes),
        }
    }

    pub fn get_index(&mut self, key: &CacheKey) -> Option<Arc<SsTableIndex>> {
        self.indexes.get(key)
    }

    pub fn put_index(&mut self, key: CacheKey, index: Arc<SsTableIndex>) {
        let weight = index.items.len() * 64 + 64;
        self.indexes.put(key, index, weight);
    }

    pub fn get_value_log(&mut self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        self.value_logs.get(key)
    }

    pub fn put_value_log(&mut self, key: CacheKey, log: Arc<Vec<u8>>) {
        let weight = log.len();
        self.value_logs.put(key, log, weight);
    }

    pub fn index_len(&self) -> usize {
        self.indexes.len()
    }

    pub fn value_log_len(&self) -> usize {
        self.value_logs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn index(item_count: usize) -> SsTableIndex {
        let mut bloom = crate::bloom::BloomFilter::new(item_count.max(1), 0.01);
        let items: Vec<_> = (0..item_count)
            .map(|i| {
                let key = vec![i as u8];
                bloom.insert(&key);
                crate::sstable::IndexItem {
                    key_hash: crate::memtable::key_hash(&key),
                    key,
                    record_id: vec![i as u8],
                    tombstone: false,
                    sstable_id: 1,
                    level: 1,
                    offset: 0,
                    length: 0,
                }
            })
            .collect();
        SsTableIndex { bloom, items }
    }

    #[test]
    fn caches_and_returns_an_index_by_its_full_key() {
        let mut cache = SstableCache::new(1 << 20, 1 << 20);
        let key = CacheKey::for_index(1, 2, 3, 1, 7);
        cache.put_index(key, Arc::new(index(4)));
        assert!(cache.get_index(&key).is_some());
        assert!(cache.get_index(&CacheKey::for_index(1, 2, 3, 1, 8)).is_none());
    }

    #[test]
    fn value_log_key_has_no_index_component() {
        let mut cache = SstableCache::new(1 << 20, 1 << 20);
        let key = CacheKey::for_value_log(1, 2, 1, 7);
        cache.put_value_log(key, Arc::new(vec![1, 2, 3]));
        assert!(cache.get_value_log(&key).is_some());
        assert_eq!(key.index_id, None);
    }

    #[test]
    fn evicts_oldest_value_log_when_over_capacity() {
        let mut cache = SstableCache::new(1 << 20, 10);
        cache.put_value_log(CacheKey::for_value_log(1, 1, 1, 1), Arc::new(vec![0u8; 4]));
        cache.put_value_log(CacheKey::for_value_log(1, 1, 1, 2), Arc::new(vec![0u8; 4]));
        cache.put_value_log(CacheKey::for_value_log(1, 1, 1, 3), Arc::new(vec![0u8; 4]));
        assert!(cache.get_value_log(&CacheKey::for_value_log(1, 1, 1, 1)).is_none());
        assert!(cache.get_value_log(&CacheKey::for_value_log(1, 1, 1, 3)).is_some());
    }
}
