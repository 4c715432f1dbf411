//! A record is a sparse map from column id to value, encoded as a sequence
//! of bson nodes named by the column id (decimal, since node names are
//! strings).

use alloc::string::ToString;
use alloc::vec::Vec;
use hashbrown::HashMap;

use crate::bson::{self, Value};
use crate::error::TosdbError;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    pub fields: HashMap<u64, Value>,
}

impl Record {
    pub fn new() -> Self {
        Record { fields: HashMap::new() }
    }

    pub fn set(&mut self, column_id: u64, value: Value) {
        self.fields.insert(column_id, value);
    }

    pub fn get(&self, column_id: u64) -> Option<&Value> {
        self.fields.get(&column_id)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut ids: Vec<&u64> = self.fields.keys().collect();
        ids.sort();
        let mut out = Vec::new();
        out.extend_from_slice(&(ids.len() as u64).to_le_bytes());
        for id in ids {
            let value = &self.fields[id];
            let node = bson::encode_node(&id.to_string(), value);
            out.extend_from_slice(&node);
        }
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TosdbError> {
        if buf.len() < 8 {
            return Err(TosdbError::InvalidArgument);
        }
        let count = u64::from_le_bytes(buf[0..8].try_into().unwrap());
        let mut pos = 8;
        let mut record = Record::new();
        for _ in 0..count {
            let (name, value, consumed) = bson::decode_node(&buf[pos..])?;
            let id: u64 = name.parse().map_err(|_| TosdbError::InvalidArgument)?;
            record.fields.insert(id, value);
            pos += consumed;
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_record() {
        let mut record = Record::new();
        record.set(1, Value::Int64(42));
        record.set(2, Value::String("row".into()));
        let encoded = record.encode();
        let decoded = Record::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}
