//! Tagged-value decoder for the data and metadata sections
//!
//! Every value starts with a control byte: the top three bits select the type,
//! the low five bits carry the payload size. Type 0 escapes to an extended type
//! stored in the following byte (plus 7). Sizes 29, 30 and 31 mean the real size
//! follows in one, two or three bytes, biased by 29, 285 and 65821.

use super::error::DecodeError;
use serde_json::json;

const TYPE_POINTER: u16 = 1;
const TYPE_STRING: u16 = 2;
const TYPE_DOUBLE: u16 = 3;
const TYPE_BYTES: u16 = 4;
const TYPE_UINT16: u16 = 5;
const TYPE_UINT32: u16 = 6;
const TYPE_MAP: u16 = 7;
const TYPE_INT32: u16 = 8;
const TYPE_UINT64: u16 = 9;
const TYPE_ARRAY: u16 = 11;
const TYPE_BOOL: u16 = 14;
const TYPE_FLOAT: u16 = 15;

/// Pointer-to-pointer chains are not produced by any writer; bound them anyway.
const MAX_POINTER_DEPTH: usize = 32;

/// Deepest map/array nesting accepted; real records stay in single digits.
const MAX_NESTING_DEPTH: usize = 128;

/// uint64 values are truncated to their low 48 bits.
const UINT64_MASK: u64 = (1 << 48) - 1;

/// A decoded value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Double(f64),
    Bytes(Vec<u8>),
    Uint(u64),
    Int(i32),
    /// Entries in encoded order.
    Map(Vec<(String, Value)>),
    Array(Vec<Value>),
    Bool(bool),
    Float(f32),
}

impl Value {
    /// Look up a key in a map value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Map(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Follow a chain of map keys.
    pub fn get_path(&self, path: &[&str]) -> Option<&Value> {
        path.iter().try_fold(self, |value, key| value.get(key))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint(v) => Some(*v),
            Value::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Convert to JSON for display. Byte strings become arrays of numbers.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::String(s) => json!(s),
            Value::Double(v) => json!(v),
            Value::Bytes(b) => json!(b),
            Value::Uint(v) => json!(v),
            Value::Int(v) => json!(v),
            Value::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Bool(v) => json!(v),
            Value::Float(v) => json!(v),
        }
    }
}

/// Decoder over a buffer whose pointers are relative to `base`.
pub struct Decoder<'a> {
    buf: &'a [u8],
    base: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], base: usize) -> Self {
        Self { buf, base }
    }

    /// Decode the value at `offset`, returning it with the offset just past it.
    ///
    /// A pointer resolves to the value it targets, but the returned offset is
    /// the one after the pointer itself.
    pub fn decode(&self, offset: usize) -> Result<(Value, usize), DecodeError> {
        self.decode_at(offset, 0, 0)
    }

    fn decode_at(
        &self,
        offset: usize,
        depth: usize,
        nesting: usize,
    ) -> Result<(Value, usize), DecodeError> {
        let ctrl = self.byte(offset)?;
        let mut cursor = offset + 1;

        let mut kind = u16::from(ctrl >> 5);
        let size = usize::from(ctrl & 0x1f);
        if kind == 0 {
            kind = u16::from(self.byte(cursor)?) + 7;
            cursor += 1;
        }

        if kind == TYPE_POINTER {
            if depth >= MAX_POINTER_DEPTH {
                return Err(DecodeError::PointerDepth {
                    depth: MAX_POINTER_DEPTH,
                    offset,
                });
            }
            let (target, next) = self.pointer(size, cursor)?;
            let (value, _) = self.decode_at(self.base + target, depth + 1, nesting)?;
            return Ok((value, next));
        }

        let (size, cursor) = self.extended_size(size, cursor)?;
        self.payload(kind, size, cursor, depth, nesting)
    }

    fn payload(
        &self,
        kind: u16,
        size: usize,
        offset: usize,
        depth: usize,
        nesting: usize,
    ) -> Result<(Value, usize), DecodeError> {
        if (kind == TYPE_MAP || kind == TYPE_ARRAY) && nesting >= MAX_NESTING_DEPTH {
            return Err(DecodeError::NestingDepth {
                depth: MAX_NESTING_DEPTH,
                offset,
            });
        }
        let value = match kind {
            TYPE_STRING => {
                let bytes = self.slice(offset, size)?;
                Value::String(String::from_utf8_lossy(bytes).into_owned())
            }
            TYPE_DOUBLE => {
                let bytes = self.fixed::<8>("double", offset, size)?;
                Value::Double(f64::from_be_bytes(bytes))
            }
            TYPE_BYTES => Value::Bytes(self.slice(offset, size)?.to_vec()),
            TYPE_UINT16 => Value::Uint(self.unsigned("uint16", offset, size, 2)?),
            TYPE_UINT32 => Value::Uint(self.unsigned("uint32", offset, size, 4)?),
            TYPE_UINT64 => Value::Uint(self.unsigned("uint64", offset, size, 8)? & UINT64_MASK),
            TYPE_INT32 => {
                let raw = self.unsigned("int32", offset, size, 4)?;
                let value = if size > 0 && (raw >> (size * 8 - 1)) & 1 == 1 {
                    raw as i64 - (1i64 << (size * 8))
                } else {
                    raw as i64
                };
                Value::Int(value as i32)
            }
            TYPE_FLOAT => {
                let bytes = self.fixed::<4>("float", offset, size)?;
                Value::Float(f32::from_be_bytes(bytes))
            }
            TYPE_BOOL => return Ok((Value::Bool(size != 0), offset)),
            TYPE_MAP => {
                let mut entries = Vec::with_capacity(size.min(64));
                let mut cursor = offset;
                for _ in 0..size {
                    let key_offset = cursor;
                    let (key, next) = self.decode_at(cursor, depth, nesting + 1)?;
                    let Value::String(key) = key else {
                        return Err(DecodeError::InvalidMapKey(key_offset));
                    };
                    let (value, next) = self.decode_at(next, depth, nesting + 1)?;
                    entries.push((key, value));
                    cursor = next;
                }
                return Ok((Value::Map(entries), cursor));
            }
            TYPE_ARRAY => {
                let mut items = Vec::with_capacity(size.min(64));
                let mut cursor = offset;
                for _ in 0..size {
                    let (value, next) = self.decode_at(cursor, depth, nesting + 1)?;
                    items.push(value);
                    cursor = next;
                }
                return Ok((Value::Array(items), cursor));
            }
            // uint128, data cache containers, end markers and anything newer:
            // keep the cursor aligned and move on.
            _ => Value::Null,
        };
        Ok((value, offset + size))
    }

    /// Returns the pointer target (relative to `base`) and the offset after it.
    fn pointer(&self, size: usize, offset: usize) -> Result<(usize, usize), DecodeError> {
        let len = ((size >> 3) & 0x3) + 1;
        let bytes = self.slice(offset, len)?;
        let high = size & 0x7;
        let target = match len {
            1 => (high << 8) | be_uint(bytes) as usize,
            2 => ((high << 16) | be_uint(bytes) as usize) + 2048,
            3 => ((high << 24) | be_uint(bytes) as usize) + 526_336,
            _ => be_uint(bytes) as usize,
        };
        Ok((target, offset + len))
    }

    fn extended_size(&self, size: usize, offset: usize) -> Result<(usize, usize), DecodeError> {
        match size {
            29 => Ok((29 + usize::from(self.byte(offset)?), offset + 1)),
            30 => Ok((285 + be_uint(self.slice(offset, 2)?) as usize, offset + 2)),
            31 => Ok((65_821 + be_uint(self.slice(offset, 3)?) as usize, offset + 3)),
            _ => Ok((size, offset)),
        }
    }

    fn unsigned(
        &self,
        kind: &'static str,
        offset: usize,
        size: usize,
        max: usize,
    ) -> Result<u64, DecodeError> {
        if size > max {
            return Err(DecodeError::InvalidSize { kind, size, offset });
        }
        Ok(be_uint(self.slice(offset, size)?))
    }

    fn fixed<const N: usize>(
        &self,
        kind: &'static str,
        offset: usize,
        size: usize,
    ) -> Result<[u8; N], DecodeError> {
        if size != N {
            return Err(DecodeError::InvalidSize { kind, size, offset });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(self.slice(offset, N)?);
        Ok(out)
    }

    fn byte(&self, offset: usize) -> Result<u8, DecodeError> {
        Ok(self.slice(offset, 1)?[0])
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], DecodeError> {
        offset
            .checked_add(len)
            .and_then(|end| self.buf.get(offset..end))
            .ok_or(DecodeError::OutOfBounds {
                offset,
                len,
                size: self.buf.len(),
            })
    }
}

fn be_uint(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}
