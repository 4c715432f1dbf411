//! In-memory write buffer: one append-only record log plus one sorted,
//! bloom-guarded index per table index (primary, unique, or secondary).
//! Deletes are tombstones so a flush can still shadow older SSTable entries
//! for the same key.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::bloom::BloomFilter;
use crate::record::Record;
use crate::schema::IndexKind;

/// Flush threshold: once a memtable's estimated byte size crosses this, the
/// caller should flush it to an SSTable and start a fresh one.
pub const FLUSH_THRESHOLD_BYTES: usize = 4 * 1024 * 1024;

const BLOOM_FALSE_POSITIVE_RATE: f64 = 0.01;
const BLOOM_INITIAL_CAPACITY: usize = 256;

pub fn key_hash(key: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for &byte in key {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// One entry in a single index's in-memory sorted set. `record_id` is the
/// owning record's primary key; for the primary index itself `record_id ==
/// key`. `offset`/`length` address the record's encoded bytes in this
/// memtable's shared value buffer -- valid even for secondary/unique items,
/// since every index of a record is written against the same memtable
/// generation and therefore the same value buffer.
#[derive(Debug, Clone)]
pub struct MemtableIndexItem {
    pub key_hash: u64,
    pub key: Vec<u8>,
    pub record_id: Vec<u8>,
    pub tombstone: bool,
    pub offset: u64,
    pub length: u32,
}

struct IndexMemtable {
    kind: IndexKind,
    items: BTreeMap<(u64, Vec<u8>, Vec<u8>), MemtableIndexItem>,
    bloom: BloomFilter,
    bloom_capacity: usize,
}

impl IndexMemtable {
    fn new(kind: IndexKind) -> Self {
        IndexMemtable {
            kind,
            items: BTreeMap::new(),
            bloom: BloomFilter::new(BLOOM_INITIAL_CAPACITY, BLOOM_FALSE_POSITIVE_RATE),
            bloom_capacity: BLOOM_INITIAL_CAPACITY,
        }
    }

    fn insert(&mut self, item: MemtableIndexItem) {
        self.bloom.insert(&item.key);
        if self.items.len() + 1 > self.bloom_capacity {
            self.bloom_capacity *= 2;
            let mut rebuilt = BloomFilter::new(self.bloom_capacity, BLOOM_FALSE_POSITIVE_RATE);
            for existing in self.items.values() {
                rebuilt.insert(&existing.key);
            }
            rebuilt.insert(&item.key);
            self.bloom = rebuilt;
        }
        self.items.insert((item.key_hash, item.key.clone(), item.record_id.clone()), item);
    }

    /// `None` means "no entry for this key"; `Some(item)` may itself be a
    /// tombstone -- callers distinguish via `item.tombstone`. For a
    /// non-unique secondary index with several live records sharing `key`,
    /// returns the most recently inserted one.
    fn lookup(&self, key: &[u8]) -> Option<&MemtableIndexItem> {
        if !self.bloom.contains(key) {
            return None;
        }
        let hash = key_hash(key);
        self.items
            .iter()
            .filter(|((h, k, _), _)| *h == hash && k.as_slice() == key)
            .next_back()
            .map(|(_, v)| v)
    }

    fn iter_sorted(&self) -> impl Iterator<Item = &MemtableIndexItem> {
        self.items.values()
    }
}

pub struct Memtable {
    value_buf: Vec<u8>,
    primary_index_id: u64,
    indexes: HashMap<u64, IndexMemtable>,
    record_count: usize,
    size_bytes: usize,
}

impl Memtable {
    /// `indexes` lists every index this table maintains (including the
    /// primary one) as `(index_id, kind)`.
    pub fn new(primary_index_id: u64, indexes: &[(u64, IndexKind)]) -> Self {
        let mut map = HashMap::new();
        for &(id, kind) in indexes {
            map.insert(id, IndexMemtable::new(kind));
        }
        Memtable { value_buf: Vec::new(), primary_index_id, indexes: map, record_count: 0, size_bytes: 0 }
    }

    pub fn primary_index_id(&self) -> u64 {
        self.primary_index_id
    }

    pub fn index_ids(&self) -> impl Iterator<Item = &u64> {
        self.indexes.keys()
    }

    pub fn index_kind(&self, index_id: u64) -> Option<IndexKind> {
        self.indexes.get(&index_id).map(|i| i.kind)
    }

    /// Appends `record`'s encoded bytes once and inserts one item per
    /// `(index_id, key_bytes)` pair (the primary entry must be included).
    pub fn put(&mut self, record: &Record, index_keys: &[(u64, Vec<u8>)]) {
        let encoded = record.encode();
        let offset = self.value_buf.len() as u64;
        let length = encoded.len() as u32;
        self.value_buf.extend_from_slice(&encoded);
        self.size_bytes += encoded.len();

        let primary_key = index_keys
            .iter()
            .find(|(id, _)| *id == self.primary_index_id)
            .map(|(_, k)| k.clone())
            .unwrap_or_default();

        for (index_id, key) in index_keys {
            if let Some(index) = self.indexes.get_mut(index_id) {
                self.size_bytes += key.len();
                index.insert(MemtableIndexItem {
                    key_hash: key_hash(key),
                    key: key.clone(),
                    record_id: primary_key.clone(),
                    tombstone: false,
                    offset,
                    length,
                });
            }
        }
        self.record_count += 1;
    }

    /// Tombstones `record_id` in every index listed in `index_keys` --
    /// callers resolve the old record's indexed key values before deleting
    /// so every secondary/unique index is shadowed too, not just the
    /// primary one.
    pub fn delete(&mut self, record_id: Vec<u8>, index_keys: &[(u64, Vec<u8>)]) {
        for (index_id, key) in index_keys {
            if let Some(index) = self.indexes.get_mut(index_id) {
                index.insert(MemtableIndexItem {
                    key_hash: key_hash(key),
                    key: key.clone(),
                    record_id: record_id.clone(),
                    tombstone: true,
                    offset: 0,
                    length: 0,
                });
            }
        }
    }

    /// Looks up `key` against `index_id`'s sorted set, decoding the backing
    /// record if the hit is live. `None` means "not present here"; `Some(None)`
    /// means "tombstoned, stop looking".
    pub fn get(&self, index_id: u64, key: &[u8]) -> Option<Option<Record>> {
        let index = self.indexes.get(&index_id)?;
        let item = index.lookup(key)?;
        if item.tombstone {
            return Some(None);
        }
        let start = item.offset as usize;
        let end = start + item.length as usize;
        self.value_buf.get(start..end).and_then(|bytes| Record::decode(bytes).ok()).map(Some)
    }

    pub fn iter_index(&self, index_id: u64) -> impl Iterator<Item = &MemtableIndexItem> {
        self.indexes.get(&index_id).into_iter().flat_map(|i| i.iter_sorted())
    }

    pub fn len(&self) -> usize {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    pub fn should_flush(&self) -> bool {
        self.size_bytes >= FLUSH_THRESHOLD_BYTES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::Value;

    const PRIMARY: u64 = 1;
    const BY_NAME: u64 = 2;

    fn indexes() -> [(u64, IndexKind); 2] {
        [(PRIMARY, IndexKind::Primary), (BY_NAME, IndexKind::Secondary)]
    }

    #[test]
    fn put_then_get_round_trips_through_primary_index() {
        let mut mt = Memtable::new(PRIMARY, &indexes());
        let mut record = Record::new();
        record.set(1, Value::Int64(7));
        mt.put(&record, &[(PRIMARY, b"k1".to_vec()), (BY_NAME, b"alice".to_vec())]);
        assert_eq!(mt.get(PRIMARY, b"k1"), Some(Some(record)));
    }

    #[test]
    fn secondary_index_resolves_the_same_record() {
        let mut mt = Memtable::new(PRIMARY, &indexes());
        let mut record = Record::new();
        record.set(1, Value::Int64(7));
        mt.put(&record, &[(PRIMARY, b"k1".to_vec()), (BY_NAME, b"alice".to_vec())]);
        assert_eq!(mt.get(BY_NAME, b"alice"), Some(Some(record)));
    }

    #[test]
    fn delete_shadows_every_index_with_a_tombstone() {
        let mut mt = Memtable::new(PRIMARY, &indexes());
        let mut record = Record::new();
        record.set(1, Value::Int64(7));
        mt.put(&record, &[(PRIMARY, b"k1".to_vec()), (BY_NAME, b"alice".to_vec())]);
        mt.delete(b"k1".to_vec(), &[(PRIMARY, b"k1".to_vec()), (BY_NAME, b"alice".to_vec())]);
        assert_eq!(mt.get(PRIMARY, b"k1"), Some(None));
        assert_eq!(mt.get(BY_NAME, b"alice"), Some(None));
    }

    #[test]
    fn missing_key_is_none() {
        let mt = Memtable::new(PRIMARY, &indexes());
        assert_eq!(mt.get(PRIMARY, b"missing"), None);
    }
}
