//! Fixed-size bloom filter used to reject misses before an SSTable index
//! binary search (grounded on the bloom-then-binary-search lookup order in
//! the original sstable reader).

use alloc::vec;
use alloc::vec::Vec;

pub struct BloomFilter {
    bits: Vec<u8>,
    bit_count: u64,
    hash_count: u32,
}

impl BloomFilter {
    /// `expected_items` and `false_positive_rate` pick the bit array size and
    /// hash count using the standard optimal-bloom-filter formulas.
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let expected_items = expected_items.max(1) as f64;
        let m = (-(expected_items * false_positive_rate.ln()) / (core::f64::consts::LN_2 * core::f64::consts::LN_2)).ceil();
        let bit_count = (m as u64).max(64);
        let k = ((bit_count as f64 / expected_items) * core::f64::consts::LN_2).round().max(1.0);
        let hash_count = k as u32;
        let byte_len = ((bit_count + 7) / 8) as usize;
        BloomFilter { bits: vec![0u8; byte_len], bit_count, hash_count }
    }

    fn hashes(&self, key: &[u8]) -> (u64, u64) {
        (fnv1a(key, 0xcbf29ce484222325), fnv1a(key, 0x100000001b3))
    }

    pub fn insert(&mut self, key: &[u8]) {
        let (h1, h2) = self.hashes(key);
        for i in 0..self.hash_count as u64 {
            let idx = (h1.wrapping_add(i.wrapping_mul(h2))) % self.bit_count;
            self.set_bit(idx);
        }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let (h1, h2) = self.hashes(key);
        for i in 0..self.hash_count as u64 {
            let idx = (h1.wrapping_add(i.wrapping_mul(h2))) % self.bit_count;
            if !self.get_bit(idx) {
                return false;
            }
        }
        true
    }

    fn set_bit(&mut self, idx: u64) {
        let byte = (idx / 8) as usize;
        let bit = (idx % 8) as u8;
        self.bits[byte] |= 1 << bit;
    }

    fn get_bit(&self, idx: u64) -> bool {
        let byte = (idx / 8) as usize;
        let bit = (idx % 8) as u8;
        self.bits[byte] & (1 << bit) != 0
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bits.len() + 12);
        out.extend_from_slice(&self.bit_count.to_le_bytes());
        out.extend_from_slice(&self.hash_count.to_le_bytes());
        out.extend_from_slice(&self.bits);
        out
    }

    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() < 12 {
            return None;
        }
        let bit_count = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let hash_count = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let bits = buf[12..].to_vec();
        Some(BloomFilter { bits, bit_count, hash_count })
    }
}

fn fnv1a(data: &[u8], seed: u64) -> u64 {
    let mut hash = seed;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_false_negatives() {
        let mut bf = BloomFilter::new(100, 0.01);
        let keys: Vec<Vec<u8>> = (0..100u32).map(|i| i.to_le_bytes().to_vec()).collect();
        for k in &keys {
            bf.insert(k);
        }
        for k in &keys {
            assert!(bf.contains(k));
        }
    }

    #[test]
    fn round_trips_serialization() {
        let mut bf = BloomFilter::new(10, 0.01);
        bf.insert(b"hello");
        let bytes = bf.serialize();
        let restored = BloomFilter::deserialize(&bytes).unwrap();
        assert!(restored.contains(b"hello"));
    }
}
