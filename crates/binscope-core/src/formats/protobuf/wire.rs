//! Protobuf wire format primitives.
//!
//! Each field is encoded as a varint key followed by a payload whose shape
//! depends on the wire type in the key's low three bits:
//! - 0: VARINT (int32, int64, uint32, uint64, sint32, sint64, bool, enum)
//! - 1: I64 (fixed64, sfixed64, double)
//! - 2: LEN (string, bytes, embedded messages, packed repeated fields)
//! - 3, 4: SGROUP / EGROUP (deprecated, not decoded)
//! - 5: I32 (fixed32, sfixed32, float)

use crate::error::{Error, Result};
use std::fmt;

/// Protobuf wire types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    /// Variable-length integer
    Varint = 0,
    /// 64-bit fixed-width
    I64 = 1,
    /// Length-delimited (strings, bytes, embedded messages)
    Len = 2,
    /// 32-bit fixed-width
    I32 = 5,
}

impl WireType {
    /// Decodes the low three bits of a field key.
    ///
    /// Groups (3, 4) and the unassigned values (6, 7) fail with
    /// [`Error::UnsupportedConstruct`].
    pub fn from_key(key: u64, offset: usize) -> Result<Self> {
        match key & 0x07 {
            0 => Ok(Self::Varint),
            1 => Ok(Self::I64),
            2 => Ok(Self::Len),
            5 => Ok(Self::I32),
            3 | 4 => Err(Error::unsupported(offset, "protobuf groups")),
            n => Err(Error::unsupported(offset, format!("wire type {n}"))),
        }
    }
}

impl fmt::Display for WireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Varint => "Varint",
            Self::I64 => "I64",
            Self::Len => "Len",
            Self::I32 => "I32",
        };
        f.write_str(name)
    }
}

/// Maximum valid protobuf field number (2^29 - 1)
pub const MAX_FIELD_NUMBER: u64 = 536_870_911;

/// Varints are at most 10 bytes for a 64-bit value
const MAX_VARINT_LEN: usize = 10;

/// Decoded field key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldKey {
    /// Field number from the schema
    pub number: u64,
    /// Payload encoding
    pub wire_type: WireType,
}

impl FieldKey {
    /// Splits a raw key varint found at `offset` into number and wire type
    pub fn from_raw(raw: u64, offset: usize) -> Result<Self> {
        let wire_type = WireType::from_key(raw, offset)?;
        let number = raw >> 3;
        if number == 0 || number > MAX_FIELD_NUMBER {
            return Err(Error::unsupported(offset, format!("field number {number}")));
        }
        Ok(Self { number, wire_type })
    }
}

/// Decode a little-endian base-128 varint from the start of `data`.
///
/// Returns the decoded value and the number of bytes consumed. `offset` is
/// only used for error reporting.
pub fn decode_varint(data: &[u8], offset: usize) -> Result<(u64, usize)> {
    let mut result: u64 = 0;

    for (i, &byte) in data.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(Error::malformed_length(offset, "varint longer than 10 bytes"));
        }

        result |= u64::from(byte & 0x7F).checked_shl(7 * i as u32).unwrap_or(0);

        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }

    Err(Error::truncated(offset, data.len() + 1, data.len()))
}

/// Zig-zag decoding used by `sint32` / `sint64`
pub fn zigzag(raw: u64) -> i64 {
    ((raw >> 1) as i64) ^ -((raw & 1) as i64)
}
