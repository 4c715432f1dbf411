//! Key lookup and key-set scan across a table's in-memory and on-disk
//! sources, through one index at a time.
//!
//! Lookup order mirrors the original key-get walk: newest memtable to
//! oldest, then level-1 SSTables newest to oldest, then level 2, and so on
//! -- the first source with any entry for the key (live or tombstone) wins,
//! since everything behind it is strictly older. Decoded SSTable indexes
//! and value logs pass through a per-database cache keyed by where in that
//! walk they came from, so a hot key doesn't re-decompress its SSTable on
//! every lookup.

use alloc::collections::BTreeSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::HashSet;

use crate::block::BlockStore;
use crate::cache::{CacheKey, SstableCache};
use crate::error::TosdbError;
use crate::memtable::Memtable;
use crate::record::Record;
use crate::schema::IndexKind;
use crate::sstable::{self, SsTableIndex, SsTableIndexPointer, SsTableListItem};

/// `memtables[0]` is the active (newest) memtable; later entries are
/// immutable memtables already queued for flush, newest first.
/// `levels[0]` is level 1's SSTables (newest first), `levels[1]` level 2, etc.
pub struct TableRuntime {
    pub database_id: u64,
    pub table_id: u64,
    pub primary_index_id: u64,
    pub memtables: Vec<Memtable>,
    pub levels: Vec<Vec<SsTableListItem>>,
}

impl TableRuntime {
    pub fn new(database_id: u64, table_id: u64, primary_index_id: u64, indexes: &[(u64, IndexKind)]) -> Self {
        TableRuntime {
            database_id,
            table_id,
            primary_index_id,
            memtables: alloc::vec![Memtable::new(primary_index_id, indexes)],
            levels: Vec::new(),
        }
    }

    async fn cached_index(
        &self,
        store: &Arc<BlockStore>,
        cache: &mut SstableCache,
        index_id: u64,
        level: u32,
        sstable_id: u64,
        pointer: &SsTableIndexPointer,
    ) -> Result<Arc<SsTableIndex>, TosdbError> {
        let key = CacheKey::for_index(self.database_id, self.table_id, index_id, level, sstable_id);
        if let Some(hit) = cache.get_index(&key) {
            return Ok(hit);
        }
        let index = Arc::new(sstable::load_index(store, pointer).await?);
        cache.put_index(key, index.clone());
        Ok(index)
    }

    async fn cached_value_log(
        &self,
        store: &Arc<BlockStore>,
        cache: &mut SstableCache,
        item: &SsTableListItem,
    ) -> Result<Arc<Vec<u8>>, TosdbError> {
        let key = CacheKey::for_value_log(self.database_id, self.table_id, item.level, item.sstable_id);
        if let Some(hit) = cache.get_value_log(&key) {
            return Ok(hit);
        }
        let log = Arc::new(sstable::load_value_log(store, item).await?);
        cache.put_value_log(key, log.clone());
        Ok(log)
    }

    /// Looks up `key` against `index_id`. `None` covers both "no entry
    /// anywhere" and "tombstoned" -- callers that need to tell the two
    /// apart should resolve through the primary index only, where a
    /// tombstone always means "this record was deleted".
    pub async fn get(&self, store: &Arc<BlockStore>, cache: &mut SstableCache, index_id: u64, key: &[u8]) -> Result<Option<Record>, TosdbError> {
        for mt in &self.memtables {
            if let Some(found) = mt.get(index_id, key) {
                return Ok(found);
            }
        }

        for level in &self.levels {
            for item in level {
                let pointer = match item.index_pointer(index_id) {
                    Some(p) => p,
                    None => continue,
                };
                let index = self.cached_index(store, cache, index_id, item.level, item.sstable_id, pointer).await?;
                let found = match index.lookup(key) {
                    Some(found) => found.clone(),
                    None => continue,
                };
                if found.tombstone {
                    return Ok(None);
                }
                let log = self.cached_value_log(store, cache, item).await?;
                let start = found.offset as usize;
                let end = start + found.length as usize;
                let bytes = log.get(start..end).ok_or(TosdbError::InvalidArgument)?;
                return Ok(Some(Record::decode(bytes)?));
            }
        }
        Ok(None)
    }

    /// Collects every live key visible through `index_id`, newest write
    /// winning for each underlying record. Dedup is by `record_id` rather
    /// than by the index's own key: for a non-unique secondary index this
    /// also means a primary-key delete (which tombstones every index entry
    /// for that record, see `Memtable::delete`) stays invisible here even
    /// though this scan never touches the primary index directly.
    pub async fn get_keys(&self, store: &Arc<BlockStore>, cache: &mut SstableCache, index_id: u64) -> Result<BTreeSet<Vec<u8>>, TosdbError> {
        let mut seen: HashSet<Vec<u8>> = HashSet::new();
        let mut live: BTreeSet<Vec<u8>> = BTreeSet::new();

        for mt in &self.memtables {
            for item in mt.iter_index(index_id) {
                if seen.insert(item.record_id.clone()) && !item.tombstone {
                    live.insert(item.key.clone());
                }
            }
        }

        for level in &self.levels {
            for item in level {
                let pointer = match item.index_pointer(index_id) {
                    Some(p) => p,
                    None => continue,
                };
                let index = self.cached_index(store, cache, index_id, item.level, item.sstable_id, pointer).await?;
                for entry in &index.items {
                    if seen.insert(entry.record_id.clone()) && !entry.tombstone {
                        live.insert(entry.key.clone());
                    }
                }
            }
        }

        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockStore;
    use crate::bson::Value;
    use alloc::boxed::Box;
    use alloc::vec;
    use spin::Mutex;
    use turnstone_block::{BlockBackend, BlockError, BlockFuture};

    const PRIMARY: u64 = 1;
    const BY_NAME: u64 = 2;

    fn indexes() -> [(u64, IndexKind); 2] {
        [(PRIMARY, IndexKind::Primary), (BY_NAME, IndexKind::Secondary)]
    }

    struct MemBackend {
        data: Mutex<Vec<u8>>,
    }

    impl MemBackend {
        fn new(size: usize) -> Self {
            MemBackend { data: Mutex::new(vec![0u8; size]) }
        }
    }

    impl BlockBackend for MemBackend {
        fn read(&self, pos: u64, size: usize) -> BlockFuture<Vec<u8>> {
            let data = self.data.lock();
            let pos = pos as usize;
            if pos + size > data.len() {
                return BlockFuture::ready(Err(BlockError::OutOfBounds));
            }
            BlockFuture::ready(Ok(data[pos..pos + size].to_vec()))
        }

        fn write(&self, pos: u64, bytes: Vec<u8>) -> BlockFuture<()> {
            let mut data = self.data.lock();
            let pos = pos as usize;
            if pos + bytes.len() > data.len() {
                return BlockFuture::ready(Err(BlockError::OutOfBounds));
            }
            data[pos..pos + bytes.len()].copy_from_slice(&bytes);
            BlockFuture::ready(Ok(()))
        }

        fn flush(&self) -> BlockFuture<()> {
            BlockFuture::ready(Ok(()))
        }

        fn capacity(&self) -> u64 {
            self.data.lock().len() as u64
        }
    }

    fn block_on<F: core::future::Future>(fut: F) -> F::Output {
        use core::task::{Context, RawWaker, RawWakerVTable, Waker};
        fn noop(_: *const ()) {}
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(core::ptr::null(), &VTABLE)
        }
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        let waker = unsafe { Waker::from_raw(RawWaker::new(core::ptr::null(), &VTABLE)) };
        let mut cx = Context::from_waker(&waker);
        let mut fut = core::pin::pin!(fut);
        loop {
            if let core::task::Poll::Ready(v) = fut.as_mut().poll(&mut cx) {
                return v;
            }
        }
    }

    fn test_cache() -> SstableCache {
        SstableCache::new(1 << 20, 1 << 20)
    }

    #[test]
    fn newer_memtable_shadows_older_sstable() {
        let store = Arc::new(BlockStore::new(Box::new(MemBackend::new(1 << 20))));
        let mut cache = test_cache();
        let mut old_mt = Memtable::new(PRIMARY, &indexes());
        let mut old_record = Record::new();
        old_record.set(1, Value::Int64(1));
        old_mt.put(&old_record, &[(PRIMARY, b"k".to_vec()), (BY_NAME, b"alice".to_vec())]);
        let flushed = block_on(sstable::flush_memtable(&store, &old_mt, 1)).unwrap();

        let mut runtime = TableRuntime::new(1, 1, PRIMARY, &indexes());
        runtime.levels.push(vec![flushed]);
        let mut new_record = Record::new();
        new_record.set(1, Value::Int64(2));
        runtime.memtables[0].put(&new_record, &[(PRIMARY, b"k".to_vec()), (BY_NAME, b"alice".to_vec())]);

        let result = block_on(runtime.get(&store, &mut cache, PRIMARY, b"k")).unwrap();
        assert_eq!(result, Some(new_record));
    }

    #[test]
    fn tombstone_in_memtable_hides_older_sstable_value() {
        let store = Arc::new(BlockStore::new(Box::new(MemBackend::new(1 << 20))));
        let mut cache = test_cache();
        let mut old_mt = Memtable::new(PRIMARY, &indexes());
        let mut old_record = Record::new();
        old_record.set(1, Value::Int64(1));
        old_mt.put(&old_record, &[(PRIMARY, b"k".to_vec()), (BY_NAME, b"alice".to_vec())]);
        let flushed = block_on(sstable::flush_memtable(&store, &old_mt, 1)).unwrap();

        let mut runtime = TableRuntime::new(1, 1, PRIMARY, &indexes());
        runtime.levels.push(vec![flushed]);
        runtime.memtables[0].delete(b"k".to_vec(), &[(PRIMARY, b"k".to_vec()), (BY_NAME, b"alice".to_vec())]);

        let result = block_on(runtime.get(&store, &mut cache, PRIMARY, b"k")).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn get_keys_excludes_tombstoned_entries() {
        let store = Arc::new(BlockStore::new(Box::new(MemBackend::new(1 << 20))));
        let mut cache = test_cache();
        let mut runtime = TableRuntime::new(1, 1, PRIMARY, &indexes());
        let mut record = Record::new();
        record.set(1, Value::Int64(1));
        runtime.memtables[0].put(&record, &[(PRIMARY, b"keep".to_vec()), (BY_NAME, b"a".to_vec())]);
        runtime.memtables[0].delete(b"gone".to_vec(), &[(PRIMARY, b"gone".to_vec()), (BY_NAME, b"b".to_vec())]);

        let keys = block_on(runtime.get_keys(&store, &mut cache, PRIMARY)).unwrap();
        assert!(keys.contains(&b"keep".to_vec()));
        assert!(!keys.contains(&b"gone".to_vec()));
    }

    #[test]
    fn a_primary_key_delete_is_invisible_through_a_secondary_index_scan() {
        let store = Arc::new(BlockStore::new(Box::new(MemBackend::new(1 << 20))));
        let mut cache = test_cache();
        let mut old_mt = Memtable::new(PRIMARY, &indexes());
        let mut record = Record::new();
        record.set(1, Value::Int64(1));
        old_mt.put(&record, &[(PRIMARY, b"k".to_vec()), (BY_NAME, b"alice".to_vec())]);
        let flushed = block_on(sstable::flush_memtable(&store, &old_mt, 1)).unwrap();

        let mut runtime = TableRuntime::new(1, 1, PRIMARY, &indexes());
        runtime.levels.push(vec![flushed]);
        // Deleting the record tombstones every index, including BY_NAME,
        // using the old record's resolved key values.
        runtime.memtables[0].delete(b"k".to_vec(), &[(PRIMARY, b"k".to_vec()), (BY_NAME, b"alice".to_vec())]);

        let by_name_keys = block_on(runtime.get_keys(&store, &mut cache, BY_NAME)).unwrap();
        assert!(!by_name_keys.contains(&b"alice".to_vec()));

        let by_name_get = block_on(runtime.get(&store, &mut cache, BY_NAME, b"alice")).unwrap();
        assert_eq!(by_name_get, None);
    }

    #[test]
    fn repeated_lookups_populate_the_cache() {
        let store = Arc::new(BlockStore::new(Box::new(MemBackend::new(1 << 20))));
        let mut cache = test_cache();
        let mut old_mt = Memtable::new(PRIMARY, &indexes());
        let mut record = Record::new();
        record.set(1, Value::Int64(1));
        old_mt.put(&record, &[(PRIMARY, b"k".to_vec()), (BY_NAME, b"alice".to_vec())]);
        let flushed = block_on(sstable::flush_memtable(&store, &old_mt, 1)).unwrap();

        let mut runtime = TableRuntime::new(1, 1, PRIMARY, &indexes());
        runtime.levels.push(vec![flushed]);

        assert_eq!(cache.index_len(), 0);
        block_on(runtime.get(&store, &mut cache, PRIMARY, b"k")).unwrap();
        assert_eq!(cache.index_len(), 1);
        assert_eq!(cache.value_log_len(), 1);
        block_on(runtime.get(&store, &mut cache, PRIMARY, b"k")).unwrap();
        assert_eq!(cache.index_len(), 1);
    }
}
