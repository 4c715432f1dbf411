//! Block and value-log compression (grounded on the original `zpack` calls
//! wrapping sstable indexes and value logs; `lz4_flex` fills that role here).

use alloc::vec::Vec;

pub fn compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress_prepend_size(data)
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, crate::error::TosdbError> {
    lz4_flex::block::decompress_size_prepended(data).map_err(|_| crate::error::TosdbError::ChecksumMismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let data = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let compressed = compress(&data);
        let restored = decompress(&compressed).unwrap();
        assert_eq!(restored, data);
    }
}
