//! Block backend boundary.
//!
//! `turnstone_block::BlockBackend` is the trait TOSDB and the linker drive;
//! this module provides the in-memory backend used during early boot and
//! in host tests, and re-exports the trait/error kind so kernel code has a
//! single import path for both.

extern crate alloc;

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
pub use turnstone_block::{BlockBackend, BlockError, BlockFuture};

/// A flat `Vec<u8>`-backed block store. Resolves every future inline since
/// there is no real device latency to hide.
pub struct MemoryBackend {
    data: Mutex<Vec<u8>>,
}

impl MemoryBackend {
    pub fn new(capacity: usize) -> Self {
        MemoryBackend { data: Mutex::new(vec![0u8; capacity]) }
    }
}

impl BlockBackend for MemoryBackend {
    fn read(&self, pos: u64, size: usize) -> BlockFuture<Vec<u8>> {
        let data = self.data.lock();
        let pos = pos as usize;
        if pos.checked_add(size).map_or(true, |end| end > data.len()) {
            return BlockFuture::ready(Err(BlockError::OutOfBounds));
        }
        BlockFuture::ready(Ok(data[pos..pos + size].to_vec()))
    }

    fn write(&self, pos: u64, bytes: Vec<u8>) -> BlockFuture<()> {
        let mut data = self.data.lock();
        let pos = pos as usize;
        if pos.checked_add(bytes.len()).map_or(true, |end| end > data.len()) {
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

#[test_case]
fn memory_backend_write_then_read_round_trips() {
    use futures_util::FutureExt;
    let backend = MemoryBackend::new(4096);
    backend.write(0, vec![1, 2, 3, 4]).now_or_never().unwrap().unwrap();
    let read = backend.read(0, 4).now_or_never().unwrap().unwrap();
    assert_eq!(read, vec![1, 2, 3, 4]);
}

#[test_case]
fn memory_backend_out_of_bounds_read_errors() {
    use futures_util::FutureExt;
    let backend = MemoryBackend::new(16);
    let result = backend.read(10, 16).now_or_never().unwrap();
    assert_eq!(result, Err(BlockError::OutOfBounds));
}
