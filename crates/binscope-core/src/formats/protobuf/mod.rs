//! Schema-less Protocol Buffers decoding.
//!
//! Without a schema every field is decoded from its wire type alone:
//!
//! ```text
//! message := field*
//! field   := key (varint: number << 3 | wire type) | payload
//! ```
//!
//! Varint payloads are shown zig-zag decoded, with the raw value as the
//! interpretation. A length-delimited payload is first tried as a nested
//! message; when that fails it is kept as opaque bytes, since strings,
//! bytes and embedded messages share the same encoding.

pub mod wire;

use super::{check_nesting, Decoder};
use crate::cursor::{Cursor, MemoValue};
use crate::error::{Error, Result};
use crate::region::{NumericValue, Region, RegionKind};
use crate::registry::ParsingOptions;
use bytes::Bytes;
use tracing::trace;
use wire::{decode_varint, zigzag, FieldKey, WireType};

/// Decoder for binary protobuf messages
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtobufDecoder;

impl Decoder for ProtobufDecoder {
    fn id(&self) -> &'static str {
        "protobuf"
    }

    fn name(&self) -> &'static str {
        "Protocol Buffers (wire format)"
    }

    fn sniff(&self, _filename: &str, extension: &str, _buffer: &[u8]) -> bool {
        matches!(extension, "pb" | "proto" | "protobuf")
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer);
        parse_message(&mut c, 0)
    }
}

/// Decodes fields until the cursor limit
fn parse_message(c: &mut Cursor<'_>, depth: usize) -> Result<Vec<Region>> {
    check_nesting(depth, c.position(), "protobuf message")?;
    let mut fields = Vec::new();
    while !c.is_at_end() {
        fields.push(parse_field(c, depth)?);
    }
    Ok(fields)
}

fn parse_field(c: &mut Cursor<'_>, depth: usize) -> Result<Region> {
    let at = c.position();
    let (raw, tag) = read_varint(c, "tag", RegionKind::Number)?;
    let key = FieldKey::from_raw(raw, at)?;
    let tag = tag.with_description(format!("{}: {}", key.number, key.wire_type));
    trace!("protobuf field {} ({}) at {}", key.number, key.wire_type, at);

    let value = match key.wire_type {
        WireType::Varint => {
            let (raw, mut region) = read_varint(c, "Varint", RegionKind::SignedNumber)?;
            region.numeric_value = Some(NumericValue::Signed(i128::from(zigzag(raw))));
            region.with_interpretation(raw.to_string())
        }
        WireType::I64 => c.number(8, "I64")?,
        WireType::I32 => c.number(4, "I32")?,
        WireType::Len => parse_length_delimited(c, depth)?,
    };

    Ok(c.compound("message", vec![tag, value])
        .with_text(format!("field {}", key.number)))
}

fn parse_length_delimited(c: &mut Cursor<'_>, depth: usize) -> Result<Region> {
    let (len, len_region) = read_varint(c, "Len", RegionKind::Size)?;
    let start = c.position();
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| len <= c.remaining())
        .ok_or_else(|| {
            Error::malformed_length(len_region.start, format!("{len} bytes, {} remain", c.remaining()))
        })?;

    let content = match parse_message(&mut c.fork(start, len), depth + 1) {
        Ok(fields) if !fields.is_empty() => Region::compound("Content", start, fields),
        Ok(_) => Region::new("Content", RegionKind::General, start, start),
        Err(e) if e.is_recoverable() => {
            trace!("length-delimited field at {} kept as bytes: {}", start, e);
            opaque(c.peek(start, len)?, start)
        }
        Err(e) => return Err(e),
    };
    c.at(start + len);

    Ok(c.compound("LengthDelimited", vec![len_region, content]))
}

/// Raw bytes of a field that is not a nested message, with a text preview
/// when the bytes are printable UTF-8
fn opaque(bytes: &[u8], start: usize) -> Region {
    let region = Region::new("Content", RegionKind::General, start, start + bytes.len());
    match std::str::from_utf8(bytes) {
        Ok(text) if text.chars().all(|ch| !ch.is_control() || ch.is_whitespace()) => {
            region.with_text(text)
        }
        _ => region,
    }
}

/// Carves a varint at the cursor into a region of the given kind
fn read_varint(c: &mut Cursor<'_>, id: &str, kind: RegionKind) -> Result<(u64, Region)> {
    let at = c.position();
    let (value, width) = decode_varint(c.peek(at, c.remaining())?, at)?;

    let mut region = Region::new(id, kind, at, at + width);
    let numeric = NumericValue::Unsigned(u128::from(value));
    region.numeric_value = Some(numeric);
    c.remember(id, MemoValue::Number(numeric));
    c.at(region.end);
    Ok((value, region))
}
