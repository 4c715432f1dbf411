//! Length-prefixed, recursively-typed record encoding.
//!
//! Each node is: `u64` total length (including itself), `u8` type tag, the
//! field name as a `u32`-length-prefixed UTF-8 string, then (for variable
//! width types) a `u64` payload length followed by the payload. This mirrors
//! the node shape used by the original `data_bson` format -- a length
//! header wrapping a typed, named value -- but drops its name-as-a-nested-node
//! indirection in favor of a flat length-prefixed string, since records here
//! never need a name node to itself carry a type.

use alloc::string::String;
use alloc::vec::Vec;
use alloc::vec;

use crate::error::TosdbError;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
}

const TYPE_NULL: u8 = 0;
const TYPE_BOOLEAN: u8 = 1;
const TYPE_INT8: u8 = 2;
const TYPE_INT16: u8 = 3;
const TYPE_INT32: u8 = 4;
const TYPE_INT64: u8 = 5;
const TYPE_FLOAT32: u8 = 6;
const TYPE_FLOAT64: u8 = 7;
const TYPE_STRING: u8 = 8;
const TYPE_BYTES: u8 = 9;
const TYPE_ARRAY: u8 = 10;

/// Encodes `value` under field `name` as a single length-prefixed node.
pub fn encode_node(name: &str, value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&0u64.to_le_bytes()); // length placeholder

    let type_tag = type_tag_of(value);
    out.push(type_tag);

    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(name.as_bytes());

    encode_value_body(value, &mut out);

    let len = out.len() as u64;
    out[0..8].copy_from_slice(&len.to_le_bytes());
    out
}

fn type_tag_of(value: &Value) -> u8 {
    match value {
        Value::Null => TYPE_NULL,
        Value::Boolean(_) => TYPE_BOOLEAN,
        Value::Int8(_) => TYPE_INT8,
        Value::Int16(_) => TYPE_INT16,
        Value::Int32(_) => TYPE_INT32,
        Value::Int64(_) => TYPE_INT64,
        Value::Float32(_) => TYPE_FLOAT32,
        Value::Float64(_) => TYPE_FLOAT64,
        Value::String(_) => TYPE_STRING,
        Value::Bytes(_) => TYPE_BYTES,
        Value::Array(_) => TYPE_ARRAY,
    }
}

fn encode_value_body(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => {}
        Value::Boolean(b) => out.push(*b as u8),
        Value::Int8(v) => out.push(*v as u8),
        Value::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Float32(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::Float64(v) => out.extend_from_slice(&v.to_le_bytes()),
        Value::String(s) => {
            out.extend_from_slice(&(s.len() as u64).to_le_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        Value::Bytes(b) => {
            out.extend_from_slice(&(b.len() as u64).to_le_bytes());
            out.extend_from_slice(b);
        }
        Value::Array(items) => {
            out.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for item in items {
                let encoded = encode_node("", item);
                out.extend_from_slice(&encoded);
            }
        }
    }
}

/// Decodes a single length-prefixed node, returning the field name, value,
/// and number of bytes consumed from `buf`.
pub fn decode_node(buf: &[u8]) -> Result<(String, Value, usize), TosdbError> {
    if buf.len() < 13 {
        return Err(TosdbError::InvalidArgument);
    }
    let len = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
    if len > buf.len() {
        return Err(TosdbError::InvalidArgument);
    }
    let type_tag = buf[8];
    let name_len = u32::from_le_bytes(buf[9..13].try_into().unwrap()) as usize;
    let mut pos = 13;
    if pos + name_len > len {
        return Err(TosdbError::InvalidArgument);
    }
    let name = String::from_utf8(buf[pos..pos + name_len].to_vec())
        .map_err(|_| TosdbError::InvalidArgument)?;
    pos += name_len;

    let value = decode_value_body(type_tag, &buf[pos..len])?;
    Ok((name, value, len))
}

fn decode_value_body(type_tag: u8, body: &[u8]) -> Result<Value, TosdbError> {
    let need = |n: usize| -> Result<(), TosdbError> {
        if body.len() < n { Err(TosdbError::InvalidArgument) } else { Ok(()) }
    };
    Ok(match type_tag {
        TYPE_NULL => Value::Null,
        TYPE_BOOLEAN => {
            need(1)?;
            Value::Boolean(body[0] != 0)
        }
        TYPE_INT8 => {
            need(1)?;
            Value::Int8(body[0] as i8)
        }
        TYPE_INT16 => {
            need(2)?;
            Value::Int16(i16::from_le_bytes(body[0..2].try_into().unwrap()))
        }
        TYPE_INT32 => {
            need(4)?;
            Value::Int32(i32::from_le_bytes(body[0..4].try_into().unwrap()))
        }
        TYPE_INT64 => {
            need(8)?;
            Value::Int64(i64::from_le_bytes(body[0..8].try_into().unwrap()))
        }
        TYPE_FLOAT32 => {
            need(4)?;
            Value::Float32(f32::from_le_bytes(body[0..4].try_into().unwrap()))
        }
        TYPE_FLOAT64 => {
            need(8)?;
            Value::Float64(f64::from_le_bytes(body[0..8].try_into().unwrap()))
        }
        TYPE_STRING => {
            need(8)?;
            let slen = u64::from_le_bytes(body[0..8].try_into().unwrap()) as usize;
            need(8 + slen)?;
            let s = String::from_utf8(body[8..8 + slen].to_vec())
                .map_err(|_| TosdbError::InvalidArgument)?;
            Value::String(s)
        }
        TYPE_BYTES => {
            need(8)?;
            let blen = u64::from_le_bytes(body[0..8].try_into().unwrap()) as usize;
            need(8 + blen)?;
            Value::Bytes(body[8..8 + blen].to_vec())
        }
        TYPE_ARRAY => {
            need(8)?;
            let count = u64::from_le_bytes(body[0..8].try_into().unwrap()) as usize;
            let mut items = vec![];
            let mut pos = 8;
            for _ in 0..count {
                let (_, value, consumed) = decode_node(&body[pos..])?;
                items.push(value);
                pos += consumed;
            }
            Value::Array(items)
        }
        _ => return Err(TosdbError::InvalidArgument),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_scalars() {
        for value in [
            Value::Null,
            Value::Boolean(true),
            Value::Int64(-12345),
            Value::Float64(3.25),
            Value::String("hello".into()),
            Value::Bytes(vec![1, 2, 3, 4]),
        ] {
            let encoded = encode_node("field", &value);
            let (name, decoded, consumed) = decode_node(&encoded).unwrap();
            assert_eq!(name, "field");
            assert_eq!(decoded, value);
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn round_trips_nested_array() {
        let value = Value::Array(vec![Value::Int32(1), Value::Int32(2), Value::String("x".into())]);
        let encoded = encode_node("arr", &value);
        let (name, decoded, _) = decode_node(&encoded).unwrap();
        assert_eq!(name, "arr");
        assert_eq!(decoded, value);
    }

    #[test]
    fn rejects_truncated_buffer() {
        let encoded = encode_node("field", &Value::Int64(7));
        assert!(decode_node(&encoded[..encoded.len() - 1]).is_err());
    }
}
