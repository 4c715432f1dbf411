//! Block layer: checksummed, versioned, typed records over a
//! `BlockBackend`, linked by `prev_block_location` into per-chain revision
//! history, with a primary+shadow superblock as the recovery root.
//!
//! Mirrors the on-disk block-type DAG -- a superblock pointing at the
//! current head of the database list, which points at table lists, which
//! point at column/index/sstable lists, which point at sstable index and
//! value-log blocks.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use turnstone_block::DynBlockBackend;

use crate::error::TosdbError;

pub const BLOCK_FORMAT_VERSION_MAJOR: u16 = 1;
pub const BLOCK_FORMAT_VERSION_MINOR: u16 = 0;
const BLOCK_SIGNATURE: u64 = 0x544f_5344_4231_4c4b; // "TOSDB1LK" little-endian tag

/// `signature(8) checksum(8) block_type(1) version_major(2) version_minor(2)
/// pad(3) block_size(8) prev_block_location(8) prev_block_size(8)
/// prev_block_invalid(1) pad(7)`.
pub const HEADER_SIZE: usize = 56;

const OFF_SIGNATURE: usize = 0;
const OFF_CHECKSUM: usize = 8;
const OFF_BLOCK_TYPE: usize = 16;
const OFF_VERSION_MAJOR: usize = 17;
const OFF_VERSION_MINOR: usize = 19;
const OFF_BLOCK_SIZE: usize = 24;
const OFF_PREV_LOCATION: usize = 32;
const OFF_PREV_SIZE: usize = 40;
const OFF_PREV_INVALID: usize = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockType {
    Superblock = 0,
    DatabaseList = 1,
    TableList = 2,
    ColumnList = 3,
    IndexList = 4,
    Table = 5,
    SsTableListItem = 6,
    SsTableIndex = 7,
    ValueLog = 8,
    Memtable = 9,
    Database = 10,
    SequenceList = 11,
}

impl BlockType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => BlockType::Superblock,
            1 => BlockType::DatabaseList,
            2 => BlockType::TableList,
            3 => BlockType::ColumnList,
            4 => BlockType::IndexList,
            5 => BlockType::Table,
            6 => BlockType::SsTableListItem,
            7 => BlockType::SsTableIndex,
            8 => BlockType::ValueLog,
            9 => BlockType::Memtable,
            10 => BlockType::Database,
            11 => BlockType::SequenceList,
            _ => return None,
        })
    }
}

/// Where in the chain a block sits: the location/size of the revision it
/// supersedes, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrevBlock {
    pub location: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
struct BlockHeader {
    block_type: BlockType,
    version_major: u16,
    version_minor: u16,
    block_size: u64,
    prev_block_location: u64,
    prev_block_size: u64,
    prev_block_invalid: bool,
    checksum: u64,
}

impl BlockHeader {
    /// Encodes the header with the checksum field zeroed, for checksum
    /// computation (the checksum covers header-with-checksum-zeroed plus body).
    fn encode_zeroed(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[OFF_SIGNATURE..OFF_SIGNATURE + 8].copy_from_slice(&BLOCK_SIGNATURE.to_le_bytes());
        out[OFF_BLOCK_TYPE] = self.block_type as u8;
        out[OFF_VERSION_MAJOR..OFF_VERSION_MAJOR + 2].copy_from_slice(&self.version_major.to_le_bytes());
        out[OFF_VERSION_MINOR..OFF_VERSION_MINOR + 2].copy_from_slice(&self.version_minor.to_le_bytes());
        out[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 8].copy_from_slice(&self.block_size.to_le_bytes());
        out[OFF_PREV_LOCATION..OFF_PREV_LOCATION + 8].copy_from_slice(&self.prev_block_location.to_le_bytes());
        out[OFF_PREV_SIZE..OFF_PREV_SIZE + 8].copy_from_slice(&self.prev_block_size.to_le_bytes());
        out[OFF_PREV_INVALID] = self.prev_block_invalid as u8;
        out
    }

    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = self.encode_zeroed();
        out[OFF_CHECKSUM..OFF_CHECKSUM + 8].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, TosdbError> {
        if buf.len() < HEADER_SIZE {
            return Err(TosdbError::InvalidArgument);
        }
        let signature = u64::from_le_bytes(buf[OFF_SIGNATURE..OFF_SIGNATURE + 8].try_into().unwrap());
        if signature != BLOCK_SIGNATURE {
            return Err(TosdbError::ChecksumMismatch);
        }
        let checksum = u64::from_le_bytes(buf[OFF_CHECKSUM..OFF_CHECKSUM + 8].try_into().unwrap());
        let block_type = BlockType::from_u8(buf[OFF_BLOCK_TYPE]).ok_or(TosdbError::InvalidArgument)?;
        let version_major = u16::from_le_bytes(buf[OFF_VERSION_MAJOR..OFF_VERSION_MAJOR + 2].try_into().unwrap());
        let version_minor = u16::from_le_bytes(buf[OFF_VERSION_MINOR..OFF_VERSION_MINOR + 2].try_into().unwrap());
        let block_size = u64::from_le_bytes(buf[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 8].try_into().unwrap());
        let prev_block_location = u64::from_le_bytes(buf[OFF_PREV_LOCATION..OFF_PREV_LOCATION + 8].try_into().unwrap());
        let prev_block_size = u64::from_le_bytes(buf[OFF_PREV_SIZE..OFF_PREV_SIZE + 8].try_into().unwrap());
        let prev_block_invalid = buf[OFF_PREV_INVALID] != 0;
        Ok(BlockHeader {
            block_type,
            version_major,
            version_minor,
            block_size,
            prev_block_location,
            prev_block_size,
            prev_block_invalid,
            checksum,
        })
    }
}

fn checksum_of(header_zeroed: &[u8], body: &[u8]) -> u64 {
    let mut hash = 0xcbf29ce484222325u64;
    for &byte in header_zeroed.iter().chain(body.iter()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

pub const SUPERBLOCK_SIGNATURE: [u8; 16] = *b"TURNSTONE OS DB\0";
pub const SUPERBLOCK_SIZE: u64 = 4096;
const SUPERBLOCK_PRIMARY_LOCATION: u64 = 0;
const SUPERBLOCK_SHADOW_LOCATION: u64 = SUPERBLOCK_SIZE;
const FIRST_BLOCK_LOCATION: u64 = SUPERBLOCK_SIZE * 2;

/// Capacity, page size, free-space cursor, root pointer to the database
/// list, and next database id (spec's superblock fields).
#[derive(Debug, Clone, Copy, Default)]
pub struct Superblock {
    pub capacity: u64,
    pub page_size: u64,
    pub free_space_cursor: u64,
    pub database_list_location: u64,
    pub database_list_size: u64,
    pub next_database_id: u64,
}

impl Superblock {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + 48);
        out.extend_from_slice(&SUPERBLOCK_SIGNATURE);
        out.extend_from_slice(&self.capacity.to_le_bytes());
        out.extend_from_slice(&self.page_size.to_le_bytes());
        out.extend_from_slice(&self.free_space_cursor.to_le_bytes());
        out.extend_from_slice(&self.database_list_location.to_le_bytes());
        out.extend_from_slice(&self.database_list_size.to_le_bytes());
        out.extend_from_slice(&self.next_database_id.to_le_bytes());
        out
    }

    fn decode(buf: &[u8]) -> Result<Self, TosdbError> {
        if buf.len() < 16 + 48 || buf[0..16] != SUPERBLOCK_SIGNATURE {
            return Err(TosdbError::ChecksumMismatch);
        }
        let mut pos = 16;
        let mut next_u64 = || {
            let v = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
            pos += 8;
            v
        };
        Ok(Superblock {
            capacity: next_u64(),
            page_size: next_u64(),
            free_space_cursor: next_u64(),
            database_list_location: next_u64(),
            database_list_size: next_u64(),
            next_database_id: next_u64(),
        })
    }
}

/// Append-only, checksummed block store layered over a `BlockBackend`.
/// The write cursor starts past the primary+shadow superblock slots.
pub struct BlockStore {
    backend: DynBlockBackend,
    next_location: AtomicU64,
}

impl BlockStore {
    pub fn new(backend: DynBlockBackend) -> Self {
        BlockStore { backend, next_location: AtomicU64::new(FIRST_BLOCK_LOCATION) }
    }

    /// Recovery per the block-layer contract: read the primary superblock;
    /// if its checksum fails, fall back to the shadow.
    pub async fn read_superblock(&self) -> Result<Superblock, TosdbError> {
        match self.read_superblock_slot(SUPERBLOCK_PRIMARY_LOCATION).await {
            Ok(sb) => Ok(sb),
            Err(_) => self.read_superblock_slot(SUPERBLOCK_SHADOW_LOCATION).await,
        }
    }

    async fn read_superblock_slot(&self, location: u64) -> Result<Superblock, TosdbError> {
        let bytes = self.backend.read(location, SUPERBLOCK_SIZE as usize).await?;
        let stored_checksum = u64::from_le_bytes(bytes[SUPERBLOCK_SIZE as usize - 8..].try_into().unwrap());
        let body = &bytes[0..SUPERBLOCK_SIZE as usize - 8];
        if checksum_of(&[], body) != stored_checksum {
            return Err(TosdbError::ChecksumMismatch);
        }
        Superblock::decode(body)
    }

    /// Writes the shadow first, then the primary, so a crash mid-write
    /// leaves at least one intact copy: the shadow if the primary write was
    /// torn, or the (now-superseded) primary if the shadow write was torn
    /// but the primary had already landed on a previous call.
    pub async fn persist_superblock(&self, sb: &Superblock) -> Result<(), TosdbError> {
        let mut body = sb.encode();
        body.resize(SUPERBLOCK_SIZE as usize - 8, 0);
        let checksum = checksum_of(&[], &body);
        let mut slot = body.clone();
        slot.extend_from_slice(&checksum.to_le_bytes());

        self.backend.write(SUPERBLOCK_SHADOW_LOCATION, slot.clone()).await?;
        self.backend.flush().await?;
        self.backend.write(SUPERBLOCK_PRIMARY_LOCATION, slot).await?;
        self.backend.flush().await?;
        Ok(())
    }

    /// Rewrites the superblock to point at `database_list_location`/`size`,
    /// the recovery action taken when neither the primary nor the shadow
    /// superblock is intact but a later scan has located the most recent
    /// valid database-list block.
    pub async fn repair(&self, database_list_location: u64, database_list_size: u64) -> Result<Superblock, TosdbError> {
        let sb = Superblock {
            capacity: self.backend.capacity(),
            page_size: crate::memtable::FLUSH_THRESHOLD_BYTES as u64, // placeholder until page-size config exists
            free_space_cursor: self.next_location.load(Ordering::SeqCst),
            database_list_location,
            database_list_size,
            next_database_id: 0,
        };
        self.persist_superblock(&sb).await?;
        Ok(sb)
    }

    /// Appends a new block with no predecessor, returning its location.
    pub async fn block_write(&self, block_type: BlockType, payload: &[u8]) -> Result<u64, TosdbError> {
        self.write_revision(block_type, payload, None).await
    }

    /// Appends a new revision of a chained block. If `prev` is given, the
    /// previous revision is rewritten with `prev_block_invalid = true` once
    /// the new revision has landed -- the commit point for that chain.
    pub async fn write_revision(
        &self,
        block_type: BlockType,
        payload: &[u8],
        prev: Option<PrevBlock>,
    ) -> Result<u64, TosdbError> {
        let page_size = 4096u64;
        let raw_size = HEADER_SIZE as u64 + payload.len() as u64;
        let padded_size = raw_size.div_ceil(page_size) * page_size;
        let location = self.next_location.fetch_add(padded_size, Ordering::SeqCst);

        let header = BlockHeader {
            block_type,
            version_major: BLOCK_FORMAT_VERSION_MAJOR,
            version_minor: BLOCK_FORMAT_VERSION_MINOR,
            block_size: payload.len() as u64,
            prev_block_location: prev.map(|p| p.location).unwrap_or(0),
            prev_block_size: prev.map(|p| p.size).unwrap_or(0),
            prev_block_invalid: false,
            checksum: 0,
        };
        let zeroed = header.encode_zeroed();
        let checksum = checksum_of(&zeroed, payload);
        let header = BlockHeader { checksum, ..header };

        let mut bytes = Vec::with_capacity(padded_size as usize);
        bytes.extend_from_slice(&header.encode());
        bytes.extend_from_slice(payload);
        bytes.resize(padded_size as usize, 0);
        self.backend.write(location, bytes).await?;

        if let Some(prev) = prev {
            self.invalidate(prev.location, prev.size).await?;
        }

        Ok(location)
    }

    /// Flips `prev_block_invalid` on the block at `location` (whose logical
    /// payload is `size` bytes), recomputing its checksum.
    async fn invalidate(&self, location: u64, size: u64) -> Result<(), TosdbError> {
        let header_bytes = self.backend.read(location, HEADER_SIZE).await?;
        let mut header = BlockHeader::decode(&header_bytes)?;
        let body = self.backend.read(location + HEADER_SIZE as u64, size as usize).await?;

        header.prev_block_invalid = true;
        let zeroed = header.encode_zeroed();
        header.checksum = checksum_of(&zeroed, &body);

        self.backend.write(location, header.encode().to_vec()).await?;
        Ok(())
    }

    /// Reads a block's payload, rejecting on signature/type/version/checksum
    /// mismatch. `size` is the logical payload length, tracked by whatever
    /// list item pointed at this block (the block layer's own contract:
    /// `block_read(tdb, location, size)`).
    pub async fn block_read(&self, location: u64, size: u64, expected_type: BlockType) -> Result<Vec<u8>, TosdbError> {
        let header_bytes = self.backend.read(location, HEADER_SIZE).await?;
        let header = BlockHeader::decode(&header_bytes)?;
        if header.block_type as u8 != expected_type as u8 {
            return Err(TosdbError::InvalidArgument);
        }
        if header.version_major != BLOCK_FORMAT_VERSION_MAJOR {
            return Err(TosdbError::VersionMismatch);
        }
        if header.block_size != size {
            return Err(TosdbError::InvalidArgument);
        }
        let body = self.backend.read(location + HEADER_SIZE as u64, size as usize).await?;
        let zeroed = header.encode_zeroed();
        if checksum_of(&zeroed, &body) != header.checksum {
            return Err(TosdbError::ChecksumMismatch);
        }
        Ok(body)
    }

    /// Whether the successor at `location` (with the given logical size) is
    /// still the live tip of its chain, i.e. its own successor (if any)
    /// hasn't marked it invalid. Exposed for repair/diagnostic code that
    /// needs to walk a chain without fully decoding each block's payload.
    pub async fn is_invalidated(&self, location: u64) -> Result<bool, TosdbError> {
        let header_bytes = self.backend.read(location, HEADER_SIZE).await?;
        let header = BlockHeader::decode(&header_bytes)?;
        Ok(header.prev_block_invalid)
    }

    pub fn backend(&self) -> &DynBlockBackend {
        &self.backend
    }

    /// The write cursor's current position -- the superblock's
    /// `free_space_cursor` on the next persist.
    pub fn next_location(&self) -> u64 {
        self.next_location.load(Ordering::SeqCst)
    }
}

pub fn block_store(backend: DynBlockBackend) -> Arc<BlockStore> {
    Arc::new(BlockStore::new(backend))
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;
    use alloc::vec;
    use spin::Mutex;
    use turnstone_block::{BlockBackend, BlockError, BlockFuture};

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

    pub(crate) fn block_on<F: core::future::Future>(fut: F) -> F::Output {
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

    pub(crate) fn test_backend(size: usize) -> Box<dyn BlockBackend> {
        Box::new(MemBackend::new(size))
    }

    #[test]
    fn block_write_then_read_round_trips() {
        let store = BlockStore::new(test_backend(1 << 20));
        let payload = b"hello tosdb".to_vec();
        let location = block_on(store.block_write(BlockType::Table, &payload)).unwrap();
        let read_back = block_on(store.block_read(location, payload.len() as u64, BlockType::Table)).unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let store = BlockStore::new(test_backend(1 << 20));
        let payload = b"hello tosdb".to_vec();
        let location = block_on(store.block_write(BlockType::Table, &payload)).unwrap();
        block_on(store.backend().write(location + HEADER_SIZE as u64, b"HELLO TOSDB".to_vec())).unwrap();
        assert_eq!(
            block_on(store.block_read(location, payload.len() as u64, BlockType::Table)),
            Err(TosdbError::ChecksumMismatch)
        );
    }

    #[test]
    fn superblock_persists_and_reloads() {
        let store = BlockStore::new(test_backend(1 << 20));
        let sb = Superblock { capacity: 1 << 20, page_size: 4096, free_space_cursor: FIRST_BLOCK_LOCATION, database_list_location: 8192, database_list_size: 64, next_database_id: 1 };
        block_on(store.persist_superblock(&sb)).unwrap();
        let reloaded = block_on(store.read_superblock()).unwrap();
        assert_eq!(reloaded.database_list_location, sb.database_list_location);
        assert_eq!(reloaded.next_database_id, sb.next_database_id);
    }

    #[test]
    fn superblock_falls_back_to_shadow_on_primary_corruption() {
        let store = BlockStore::new(test_backend(1 << 20));
        let sb = Superblock { capacity: 1 << 20, page_size: 4096, free_space_cursor: FIRST_BLOCK_LOCATION, database_list_location: 8192, database_list_size: 64, next_database_id: 3 };
        block_on(store.persist_superblock(&sb)).unwrap();

        // Corrupt the primary slot only.
        block_on(store.backend().write(SUPERBLOCK_PRIMARY_LOCATION, vec![0xffu8; SUPERBLOCK_SIZE as usize])).unwrap();

        let reloaded = block_on(store.read_superblock()).unwrap();
        assert_eq!(reloaded.next_database_id, 3);
    }

    #[test]
    fn writing_a_new_revision_invalidates_the_previous_one() {
        let store = BlockStore::new(test_backend(1 << 20));
        let first = b"v1".to_vec();
        let loc1 = block_on(store.block_write(BlockType::DatabaseList, &first)).unwrap();
        assert!(!block_on(store.is_invalidated(loc1)).unwrap());

        let second = b"v2".to_vec();
        let _loc2 = block_on(store.write_revision(
            BlockType::DatabaseList,
            &second,
            Some(PrevBlock { location: loc1, size: first.len() as u64 }),
        ))
        .unwrap();

        assert!(block_on(store.is_invalidated(loc1)).unwrap());
        // The invalidated block's payload and checksum remain internally
        // consistent.
        let reread = block_on(store.block_read(loc1, first.len() as u64, BlockType::DatabaseList)).unwrap();
        assert_eq!(reread, first);
    }
}
