//! Immutable, sorted, compressed on-disk tables produced by flushing a
//! memtable, or by compacting a set of older SSTables into the next level.
//!
//! Layout: one value log block per SSTable holds every record's encoded
//! bytes concatenated then compressed as a unit; one index block per table
//! index holds a bloom filter plus a list of `(key_hash, key, record_id,
//! offset, size, tombstone)` items sorted by key hash first, then by a
//! byte-wise key comparison -- so lookups can reject on the bloom filter
//! before paying for a binary search. Secondary/unique index items carry
//! `record_id` (the owning record's primary key) alongside their own key,
//! so `get_keys` can dedup by record rather than by secondary key.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp::Ordering;

use crate::block::{BlockStore, BlockType};
use crate::bloom::BloomFilter;
use crate::compress;
use crate::error::TosdbError;
use crate::memtable::{key_hash, Memtable};
use crate::record::Record;

/// Threshold on the number of SSTables at one level before they're merged
/// into the next.
pub const COMPACTION_TRIGGER_COUNT: usize = 4;

#[derive(Debug, Clone)]
pub struct IndexItem {
    pub key_hash: u64,
    pub key: Vec<u8>,
    pub record_id: Vec<u8>,
    pub tombstone: bool,
    /// Which SSTable's value log holds the record and at what level --
    /// always the enclosing SSTable today since indexes of one record are
    /// always written and compacted together as one unit; carried
    /// explicitly so a future compactor that splits indexes across units
    /// doesn't need a format change.
    pub sstable_id: u64,
    pub level: u32,
    pub offset: u64,
    pub length: u32,
}

fn compare_items(a_hash: u64, a_key: &[u8], b_hash: u64, b_key: &[u8]) -> Ordering {
    match a_hash.cmp(&b_hash) {
        Ordering::Equal => a_key.cmp(b_key),
        other => other,
    }
}

pub struct SsTableIndex {
    pub bloom: BloomFilter,
    pub items: Vec<IndexItem>,
}

impl SsTableIndex {
    /// Bloom-reject first; only binary-search the sorted item list if the
    /// filter says the key might be present.
    pub fn lookup(&self, key: &[u8]) -> Option<&IndexItem> {
        if !self.bloom.contains(key) {
            return None;
        }
        let hash = key_hash(key);
        let idx = self.items.binary_search_by(|item| compare_items(item.key_hash, &item.key, hash, key)).ok()?;
        Some(&self.items[idx])
    }

    fn encode(&self) -> Vec<u8> {
        let bloom_bytes = self.bloom.serialize();
        let mut out = Vec::new();
        out.extend_from_slice(&(bloom_bytes.len() as u64).to_le_bytes());
        out.extend_from_slice(&bloom_bytes);
        out.extend_from_slice(&(self.items.len() as u64).to_le_bytes());
        for item in &self.items {
            out.extend_from_slice(&item.key_hash.to_le_bytes());
            out.extend_from_slice(&(item.key.len() as u32).to_le_bytes());
            out.extend_from_slice(&item.key);
            out.extend_from_slice(&(item.record_id.len() as u32).to_le_bytes());
            out.extend_from_slice(&item.record_id);
            out.extend_from_slice(&item.sstable_id.to_le_bytes());
            out.extend_from_slice(&item.level.to_le_bytes());
            out.extend_from_slice(&item.offset.to_le_bytes());
            out.extend_from_slice(&item.length.to_le_bytes());
            out.push(item.tombstone as u8);
        }
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, TosdbError> {
        if buf.len() < 8 {
            return Err(TosdbError::InvalidArgument);
        }
        let bloom_len = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
        let mut pos = 8;
        let bloom = BloomFilter::deserialize(buf.get(pos..pos + bloom_len).ok_or(TosdbError::InvalidArgument)?)
            .ok_or(TosdbError::InvalidArgument)?;
        pos += bloom_len;

        let count = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        pos += 8;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let key_hash = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let key_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            let key = buf[pos..pos + key_len].to_vec();
            pos += key_len;
            let record_id_len = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            let record_id = buf[pos..pos + record_id_len].to_vec();
            pos += record_id_len;
            let sstable_id = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let level = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let offset = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            let length = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            pos += 4;
            let tombstone = buf[pos] != 0;
            pos += 1;
            items.push(IndexItem { key_hash, key, record_id, tombstone, sstable_id, level, offset, length });
        }
        Ok(SsTableIndex { bloom, items })
    }
}

#[derive(Debug, Clone)]
pub struct SsTableIndexPointer {
    pub index_id: u64,
    pub index_location: u64,
    pub index_size: u64,
}

/// Pointer to one SSTable's persisted blocks, as would live in the
/// per-table sstable list.
#[derive(Debug, Clone)]
pub struct SsTableListItem {
    pub sstable_id: u64,
    pub level: u32,
    pub record_count: u64,
    pub value_log_location: u64,
    pub value_log_size: u64,
    pub indexes: Vec<SsTableIndexPointer>,
}

impl SsTableListItem {
    pub fn index_pointer(&self, index_id: u64) -> Option<&SsTableIndexPointer> {
        self.indexes.iter().find(|p| p.index_id == index_id)
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sstable_id.to_le_bytes());
        out.extend_from_slice(&self.level.to_le_bytes());
        out.extend_from_slice(&self.record_count.to_le_bytes());
        out.extend_from_slice(&self.value_log_location.to_le_bytes());
        out.extend_from_slice(&self.value_log_size.to_le_bytes());
        out.extend_from_slice(&(self.indexes.len() as u32).to_le_bytes());
        for pointer in &self.indexes {
            out.extend_from_slice(&pointer.index_id.to_le_bytes());
            out.extend_from_slice(&pointer.index_location.to_le_bytes());
            out.extend_from_slice(&pointer.index_size.to_le_bytes());
        }
    }

    fn decode_from(buf: &[u8], pos: &mut usize) -> Result<Self, TosdbError> {
        let read_u64 = |buf: &[u8], pos: &mut usize| -> Result<u64, TosdbError> {
            let v = u64::from_le_bytes(buf.get(*pos..*pos + 8).ok_or(TosdbError::InvalidArgument)?.try_into().unwrap());
            *pos += 8;
            Ok(v)
        };
        let sstable_id = read_u64(buf, pos)?;
        let level = u32::from_le_bytes(buf.get(*pos..*pos + 4).ok_or(TosdbError::InvalidArgument)?.try_into().unwrap());
        *pos += 4;
        let record_count = read_u64(buf, pos)?;
        let value_log_location = read_u64(buf, pos)?;
        let value_log_size = read_u64(buf, pos)?;
        let index_count = u32::from_le_bytes(buf.get(*pos..*pos + 4).ok_or(TosdbError::InvalidArgument)?.try_into().unwrap());
        *pos += 4;
        let mut indexes = Vec::with_capacity(index_count as usize);
        for _ in 0..index_count {
            let index_id = read_u64(buf, pos)?;
            let index_location = read_u64(buf, pos)?;
            let index_size = read_u64(buf, pos)?;
            indexes.push(SsTableIndexPointer { index_id, index_location, index_size });
        }
        Ok(SsTableListItem { sstable_id, level, record_count, value_log_location, value_log_size, indexes })
    }
}

/// Encodes every SSTable a table currently has across all levels into one
/// SSTableList block payload.
pub fn encode_sstable_list(items: &[SsTableListItem]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(items.len() as u64).to_le_bytes());
    for item in items {
        item.encode_into(&mut out);
    }
    out
}

pub fn decode_sstable_list(buf: &[u8]) -> Result<Vec<SsTableListItem>, TosdbError> {
    if buf.len() < 8 {
        return Err(TosdbError::InvalidArgument);
    }
    let count = u64::from_le_bytes(buf[0..8].try_into().unwrap());
    let mut pos = 8usize;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        items.push(SsTableListItem::decode_from(buf, &mut pos)?);
    }
    Ok(items)
}

async fn write_value_log(store: &Arc<BlockStore>, log_buf: &[u8]) -> Result<(u64, u64), TosdbError> {
    let compressed = compress::compress(log_buf);
    let location = store.block_write(BlockType::ValueLog, &compressed).await?;
    Ok((location, compressed.len() as u64))
}

async fn write_index(store: &Arc<BlockStore>, index: &SsTableIndex) -> Result<(u64, u64), TosdbError> {
    let encoded = index.encode();
    let location = store.block_write(BlockType::SsTableIndex, &encoded).await?;
    Ok((location, encoded.len() as u64))
}

/// Flushes a memtable to a new level-1 SSTable, returning the list item to
/// record in the table's sstable list. One index block is written per index
/// the memtable tracks; all indexes share the same value log, since flush
/// writes every record's bytes exactly once regardless of how many indexes
/// reference it.
pub async fn flush_memtable(store: &Arc<BlockStore>, memtable: &Memtable, sstable_id: u64) -> Result<SsTableListItem, TosdbError> {
    let primary_id = memtable.primary_index_id();
    let primary_items: Vec<_> = memtable.iter_index(primary_id).cloned().collect();

    let mut log_buf = Vec::new();
    let mut remapped_offset: alloc::collections::BTreeMap<(u64, u32), (u64, u32)> = alloc::collections::BTreeMap::new();
    for item in &primary_items {
        if item.tombstone {
            continue;
        }
        let encoded = &memtable_record_bytes(memtable, item)?;
        let new_offset = log_buf.len() as u64;
        log_buf.extend_from_slice(encoded);
        remapped_offset.insert((item.offset, item.length), (new_offset, encoded.len() as u32));
    }
    let (value_log_location, value_log_size) = write_value_log(store, &log_buf).await?;

    let mut indexes = Vec::new();
    let mut index_ids: Vec<u64> = memtable.index_ids().copied().collect();
    index_ids.sort();
    for index_id in index_ids {
        let mut items: Vec<IndexItem> = memtable
            .iter_index(index_id)
            .map(|m| {
                let (offset, length) = if m.tombstone {
                    (0, 0)
                } else {
                    remapped_offset.get(&(m.offset, m.length)).copied().unwrap_or((0, 0))
                };
                IndexItem {
                    key_hash: m.key_hash,
                    key: m.key.clone(),
                    record_id: m.record_id.clone(),
                    tombstone: m.tombstone,
                    sstable_id,
                    level: 1,
                    offset,
                    length,
                }
            })
            .collect();
        items.sort_by(|a, b| compare_items(a.key_hash, &a.key, b.key_hash, &b.key));

        let mut bloom = BloomFilter::new(items.len().max(1), 0.01);
        for item in &items {
            bloom.insert(&item.key);
        }
        let (index_location, index_size) = write_index(store, &SsTableIndex { bloom, items }).await?;
        indexes.push(SsTableIndexPointer { index_id, index_location, index_size });
    }

    Ok(SsTableListItem {
        sstable_id,
        level: 1,
        record_count: primary_items.iter().filter(|i| !i.tombstone).count() as u64,
        value_log_location,
        value_log_size,
        indexes,
    })
}

fn memtable_record_bytes(memtable: &Memtable, item: &crate::memtable::MemtableIndexItem) -> Result<Vec<u8>, TosdbError> {
    match memtable.get(memtable.primary_index_id(), &item.key) {
        Some(Some(record)) => Ok(record.encode()),
        _ => Err(TosdbError::InvalidArgument),
    }
}

pub async fn load_index(store: &Arc<BlockStore>, pointer: &SsTableIndexPointer) -> Result<SsTableIndex, TosdbError> {
    let encoded = store.block_read(pointer.index_location, pointer.index_size, BlockType::SsTableIndex).await?;
    SsTableIndex::decode(&encoded)
}

/// Decompresses an SSTable's value log in full; callers slice out the
/// record they need by `(offset, length)`.
pub async fn load_value_log(store: &Arc<BlockStore>, item: &SsTableListItem) -> Result<Vec<u8>, TosdbError> {
    let compressed = store.block_read(item.value_log_location, item.value_log_size, BlockType::ValueLog).await?;
    compress::decompress(&compressed)
}

/// Looks up `key` against `index_id` in one SSTable, returning the decoded
/// record (`Some`) or tombstone (`None` wrapped in `Some`) if the index has
/// an entry, or `None` if the key isn't in this table at all.
pub async fn get(store: &Arc<BlockStore>, item: &SsTableListItem, index_id: u64, key: &[u8]) -> Result<Option<Option<Record>>, TosdbError> {
    let pointer = match item.index_pointer(index_id) {
        Some(p) => p,
        None => return Ok(None),
    };
    let index = load_index(store, pointer).await?;
    let found = match index.lookup(key) {
        Some(found) => found.clone(),
        None => return Ok(None),
    };
    if found.tombstone {
        return Ok(Some(None));
    }
    let log_buf = load_value_log(store, item).await?;
    let start = found.offset as usize;
    let end = start + found.length as usize;
    if end > log_buf.len() {
        return Err(TosdbError::InvalidArgument);
    }
    let record = Record::decode(&log_buf[start..end])?;
    Ok(Some(Some(record)))
}

/// Merges the oldest `COMPACTION_TRIGGER_COUNT` SSTables at one level into a
/// single SSTable one level up, for every index the table maintains.
/// `items` must be sorted oldest-first (the same order they appear in the
/// table's per-level list); the returned item replaces all of them.
///
/// Per index, entries are merged by `(key_hash, key)` with newer SSTables
/// (later in `items`) winning ties. A tombstone is dropped -- rather than
/// carried into the merged item -- only when `is_base_level` is true, i.e.
/// there is no lower (older) level left that could still be shadowed by it;
/// otherwise dropping it would resurrect a deleted key still visible
/// through an even-older SSTable this pass didn't touch.
pub async fn compact(
    store: &Arc<BlockStore>,
    items: &[SsTableListItem],
    new_sstable_id: u64,
    new_level: u32,
    is_base_level: bool,
) -> Result<SsTableListItem, TosdbError> {
    if items.is_empty() {
        return Err(TosdbError::InvalidArgument);
    }

    let mut index_ids: Vec<u64> = items.iter().flat_map(|it| it.indexes.iter().map(|p| p.index_id)).collect();
    index_ids.sort();
    index_ids.dedup();

    // Load every source SSTable's value log once, keyed by sstable_id, so
    // every index can look up record bytes without re-reading blocks.
    let mut value_logs: alloc::collections::BTreeMap<u64, Vec<u8>> = alloc::collections::BTreeMap::new();
    for item in items {
        value_logs.insert(item.sstable_id, load_value_log(store, item).await?);
    }

    let mut merged_log = Vec::new();
    let mut merged_indexes = Vec::new();
    let mut total_live: u64 = 0;

    for index_id in index_ids {
        // Newest SSTable's entry for a given (key_hash, key) wins; iterate
        // oldest-to-newest so a later insert overwrites an earlier one.
        let mut latest: alloc::collections::BTreeMap<(u64, Vec<u8>), IndexItem> = alloc::collections::BTreeMap::new();
        for item in items {
            let pointer = match item.index_pointer(index_id) {
                Some(p) => p,
                None => continue,
            };
            let index = load_index(store, pointer).await?;
            for entry in index.items {
                latest.insert((entry.key_hash, entry.key.clone()), entry);
            }
        }

        let mut merged_items = Vec::with_capacity(latest.len());
        for ((_, _), entry) in latest {
            if entry.tombstone {
                if is_base_level {
                    continue;
                }
                merged_items.push(entry);
                continue;
            }

            let source = value_logs.get(&entry.sstable_id).ok_or(TosdbError::InvalidArgument)?;
            let start = entry.offset as usize;
            let end = start + entry.length as usize;
            let bytes = source.get(start..end).ok_or(TosdbError::InvalidArgument)?;
            let new_offset = merged_log.len() as u64;
            merged_log.extend_from_slice(bytes);

            merged_items.push(IndexItem {
                key_hash: entry.key_hash,
                key: entry.key,
                record_id: entry.record_id,
                tombstone: false,
                sstable_id: new_sstable_id,
                level: new_level,
                offset: new_offset,
                length: bytes.len() as u32,
            });
        }
        merged_items.sort_by(|a, b| compare_items(a.key_hash, &a.key, b.key_hash, &b.key));

        total_live = total_live.max(merged_items.iter().filter(|i| !i.tombstone).count() as u64);

        let mut bloom = BloomFilter::new(merged_items.len().max(1), 0.01);
        for item in &merged_items {
            bloom.insert(&item.key);
        }
        let (index_location, index_size) = write_index(store, &SsTableIndex { bloom, items: merged_items }).await?;
        merged_indexes.push(SsTableIndexPointer { index_id, index_location, index_size });
    }

    let (value_log_location, value_log_size) = write_value_log(store, &merged_log).await?;

    Ok(SsTableListItem {
        sstable_id: new_sstable_id,
        level: new_level,
        record_count: total_live,
        value_log_location,
        value_log_size,
        indexes: merged_indexes,
    })
}

/// Whether `level`'s SSTable count has crossed the compaction trigger.
pub fn needs_compaction(level_items: &[SsTableListItem]) -> bool {
    level_items.len() > COMPACTION_TRIGGER_COUNT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockStore;
    use crate::bson::Value;
    use crate::schema::IndexKind;
    use alloc::vec;

    const PRIMARY: u64 = 1;

    fn indexes() -> [(u64, IndexKind); 1] {
        [(PRIMARY, IndexKind::Primary)]
    }

    fn test_store() -> Arc<BlockStore> {
        Arc::new(BlockStore::new(crate::block::tests::test_backend(4 << 20)))
    }

    fn block_on<F: core::future::Future>(fut: F) -> F::Output {
        crate::block::tests::block_on(fut)
    }

    #[test]
    fn flush_produces_a_level_one_sstable() {
        let store = test_store();
        let mut mt = Memtable::new(PRIMARY, &indexes());
        let mut record = Record::new();
        record.set(1, Value::Int64(99));
        mt.put(&record, &[(PRIMARY, b"alpha".to_vec())]);
        mt.delete(b"beta".to_vec(), &[(PRIMARY, b"beta".to_vec())]);

        let item = block_on(flush_memtable(&store, &mt, 1)).unwrap();
        assert_eq!(item.level, 1);
        assert_eq!(block_on(get(&store, &item, PRIMARY, b"alpha")).unwrap(), Some(Some(record)));
        assert_eq!(block_on(get(&store, &item, PRIMARY, b"beta")).unwrap(), Some(None));
        assert_eq!(block_on(get(&store, &item, PRIMARY, b"gamma")).unwrap(), None);
    }

    #[test]
    fn compaction_preserves_the_newest_value_for_each_key() {
        let store = test_store();

        let mut mt1 = Memtable::new(PRIMARY, &indexes());
        let mut old_record = Record::new();
        old_record.set(1, Value::Int64(1));
        mt1.put(&old_record, &[(PRIMARY, b"k".to_vec())]);
        let item1 = block_on(flush_memtable(&store, &mt1, 1)).unwrap();

        let mut mt2 = Memtable::new(PRIMARY, &indexes());
        let mut new_record = Record::new();
        new_record.set(1, Value::Int64(2));
        mt2.put(&new_record, &[(PRIMARY, b"k".to_vec())]);
        let item2 = block_on(flush_memtable(&store, &mt2, 2)).unwrap();

        let compacted = block_on(compact(&store, &vec![item1, item2], 100, 2, true)).unwrap();
        assert_eq!(block_on(get(&store, &compacted, PRIMARY, b"k")).unwrap(), Some(Some(new_record)));
    }

    #[test]
    fn base_level_compaction_drops_tombstones() {
        let store = test_store();

        let mut mt1 = Memtable::new(PRIMARY, &indexes());
        let mut record = Record::new();
        record.set(1, Value::Int64(1));
        mt1.put(&record, &[(PRIMARY, b"k".to_vec())]);
        let item1 = block_on(flush_memtable(&store, &mt1, 1)).unwrap();

        let mut mt2 = Memtable::new(PRIMARY, &indexes());
        mt2.delete(b"k".to_vec(), &[(PRIMARY, b"k".to_vec())]);
        let item2 = block_on(flush_memtable(&store, &mt2, 2)).unwrap();

        let compacted = block_on(compact(&store, &vec![item1, item2], 100, 2, true)).unwrap();
        let pointer = compacted.index_pointer(PRIMARY).unwrap();
        let index = block_on(load_index(&store, pointer)).unwrap();
        assert!(index.items.is_empty());
    }

    #[test]
    fn non_base_level_compaction_keeps_tombstones() {
        let store = test_store();

        let mut mt1 = Memtable::new(PRIMARY, &indexes());
        let mut record = Record::new();
        record.set(1, Value::Int64(1));
        mt1.put(&record, &[(PRIMARY, b"k".to_vec())]);
        let item1 = block_on(flush_memtable(&store, &mt1, 1)).unwrap();

        let mut mt2 = Memtable::new(PRIMARY, &indexes());
        mt2.delete(b"k".to_vec(), &[(PRIMARY, b"k".to_vec())]);
        let item2 = block_on(flush_memtable(&store, &mt2, 2)).unwrap();

        let compacted = block_on(compact(&store, &vec![item1, item2], 100, 2, false)).unwrap();
        assert_eq!(block_on(get(&store, &compacted, PRIMARY, b"k")).unwrap(), Some(None));
    }

    #[test]
    fn sstable_list_round_trips_through_encode_decode() {
        let store = test_store();
        let mut mt = Memtable::new(PRIMARY, &indexes());
        let mut record = Record::new();
        record.set(1, Value::Int64(1));
        mt.put(&record, &[(PRIMARY, b"k".to_vec())]);
        let item = block_on(flush_memtable(&store, &mt, 1)).unwrap();

        let encoded = encode_sstable_list(&vec![item]);
        let decoded = decode_sstable_list(&encoded).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].sstable_id, 1);
        assert_eq!(decoded[0].level, 1);
        assert_eq!(decoded[0].indexes.len(), 1);
    }
}
