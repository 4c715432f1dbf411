//! Cache-and-refill id sequences. A sequence's persisted `next_value` is
//! always `cache_size` ahead of the last value actually handed out; the
//! in-memory side hands out the unused cache suffix and only touches the
//! backend again once that suffix is exhausted.

use alloc::string::String;

use crate::error::TosdbError;

pub const DEFAULT_CACHE_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: i64,
    pub name: String,
    cache_size: i64,
    next_value: i64,
    cache_current_size: i64,
}

/// Callback the sequence uses to persist a refill: given the new persisted
/// `next_value`, write it back to the hidden sequence table.
pub trait SequenceStore {
    fn persist_next_value(&mut self, id: i64, next_value: i64) -> Result<(), TosdbError>;
}

impl Sequence {
    /// `persisted_next_value` is what's currently stored in the hidden
    /// sequence table for this id.
    pub fn new(id: i64, name: String, persisted_next_value: i64, cache_size: i64) -> Self {
        Sequence {
            id,
            name,
            cache_size,
            next_value: persisted_next_value,
            cache_current_size: 0,
        }
    }

    /// Returns the next id, refilling the persisted cache window first if
    /// the in-memory cache is exhausted.
    pub fn next(&mut self, store: &mut impl SequenceStore) -> Result<i64, TosdbError> {
        if self.cache_current_size == 0 {
            let new_next_value = self.next_value + self.cache_size;
            store.persist_next_value(self.id, new_next_value)?;
            self.cache_current_size = self.cache_size;
        }

        let value = self.next_value;
        self.next_value += 1;
        self.cache_current_size -= 1;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct RecordingStore {
        persisted: Vec<(i64, i64)>,
    }

    impl SequenceStore for RecordingStore {
        fn persist_next_value(&mut self, id: i64, next_value: i64) -> Result<(), TosdbError> {
            self.persisted.push((id, next_value));
            Ok(())
        }
    }

    #[test]
    fn hands_out_values_from_cache_before_refilling() {
        let mut seq = Sequence::new(1, "orders_id".into(), 0, 4);
        let mut store = RecordingStore { persisted: Vec::new() };

        let values: Vec<i64> = (0..10).map(|_| seq.next(&mut store).unwrap()).collect();
        assert_eq!(values, (0..10).collect::<Vec<_>>());

        // Refills happen once per `cache_size` values: at 0, 4, 8.
        assert_eq!(store.persisted, vec![(1, 4), (1, 8), (1, 12)]);
    }

    #[test]
    fn resumes_from_persisted_next_value() {
        let mut seq = Sequence::new(1, "orders_id".into(), 40, 10);
        let mut store = RecordingStore { persisted: Vec::new() };
        assert_eq!(seq.next(&mut store).unwrap(), 40);
        assert_eq!(store.persisted, vec![(1, 50)]);
    }
}
