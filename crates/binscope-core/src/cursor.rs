//! Stateful reader that carves regions out of a byte buffer.
//!
//! A [`Cursor`] tracks a read position, a limit, the current endianness and
//! text encoding, and a memo of the values it has read. Each `read_*` call
//! creates one [`Region`] starting at the current position and advances the
//! position to the region's end. Use [`Cursor::at`] to move first:
//!
//! ```
//! use binscope_core::Cursor;
//!
//! let data = [0x4D, 0x5A, 0x00, 0x00, 0x80, 0x00, 0x00, 0x00];
//! let mut c = Cursor::new(&data);
//! let magic = c.magic(b"MZ", "e_magic")?;
//! let lfanew = c.at(4).offset(4, "e_lfanew")?;
//! assert_eq!((magic.start, magic.end), (0, 2));
//! assert_eq!(lfanew.num(), Some(0x80));
//! assert_eq!(c.num("e_lfanew")?, 0x80);
//! # Ok::<(), binscope_core::Error>(())
//! ```
//!
//! Offsets are always absolute: a forked sub-cursor shares the buffer and
//! only narrows the limit.

use crate::error::{Error, Result};
use crate::region::{Endian, FlagDef, NumericValue, Region, RegionKind, ValueDefinition};
use crate::text::TextEncoding;
use crate::time::TimeEpoch;
use std::collections::HashMap;

/// Value recorded in the cursor memo
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoValue {
    /// Result of a numeric read
    Number(NumericValue),
    /// Result of a string read
    Text(String),
}

/// Direction of a pattern search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// From the current position towards the limit
    Forward,
    /// From the limit back towards the current position
    Backward,
}

/// Region-building reader over a borrowed buffer
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    buf: &'a [u8],
    position: usize,
    limit: usize,
    endian: Endian,
    encoding: TextEncoding,
    memo: HashMap<String, MemoValue>,
}

impl<'a> Cursor<'a> {
    /// Creates a little-endian, UTF-8 cursor at offset 0
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            position: 0,
            limit: buf.len(),
            endian: Endian::Little,
            encoding: TextEncoding::Utf8,
            memo: HashMap::new(),
        }
    }

    /// Sets the endianness and returns the cursor
    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Returns a sub-cursor over `[pos, pos + len)`, positioned at `pos`.
    ///
    /// The range is clamped to this cursor's limit. Endianness and encoding
    /// are inherited; the memo starts empty.
    pub fn fork(&self, pos: usize, len: usize) -> Cursor<'a> {
        let limit = pos.saturating_add(len).min(self.limit);
        Cursor {
            buf: self.buf,
            position: pos.min(limit),
            limit,
            endian: self.endian,
            encoding: self.encoding,
            memo: HashMap::new(),
        }
    }

    /// The whole underlying buffer
    pub fn buffer(&self) -> &'a [u8] {
        self.buf
    }

    /// Current read position
    pub fn position(&self) -> usize {
        self.position
    }

    /// End of the readable range
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes left before the limit
    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.position)
    }

    /// Returns true when the position has reached the limit
    pub fn is_at_end(&self) -> bool {
        self.position >= self.limit
    }

    /// Current endianness
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Sets the endianness for subsequent numeric reads
    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    /// Current text encoding
    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    /// Sets the default text encoding for subsequent string reads
    pub fn set_encoding(&mut self, encoding: TextEncoding) {
        self.encoding = encoding;
    }

    /// Moves to an absolute position
    pub fn at(&mut self, pos: usize) -> &mut Self {
        self.position = pos;
        self
    }

    /// Advances the position without creating a region
    pub fn skip(&mut self, n: usize) -> &mut Self {
        self.position = self.position.saturating_add(n);
        self
    }

    /// Borrows `width` bytes at `pos` without moving
    pub fn peek(&self, pos: usize, width: usize) -> Result<&'a [u8]> {
        let end = pos
            .checked_add(width)
            .filter(|&end| end <= self.limit)
            .ok_or_else(|| Error::truncated(pos, width, self.limit.saturating_sub(pos)))?;
        Ok(&self.buf[pos..end])
    }

    /// Reads one byte at `pos` without moving
    pub fn peek_u8(&self, pos: usize) -> Result<u8> {
        Ok(self.peek(pos, 1)?[0])
    }

    /// Reads an unsigned integer of `width` bytes at `pos` in the current
    /// endianness, without moving or recording
    pub fn peek_uint(&self, pos: usize, width: usize) -> Result<u64> {
        let bytes = self.peek(pos, width)?;
        u64::try_from(decode_unsigned(bytes, self.endian, pos)?)
            .map_err(|_| Error::unsupported(pos, format!("{width}-byte value exceeds 64 bits")))
    }

    /// Reads a `width`-byte integer into a region of the given numeric kind
    pub fn read_number(
        &mut self,
        kind: RegionKind,
        signed: bool,
        width: usize,
        id: &str,
    ) -> Result<Region> {
        let pos = self.position;
        let bytes = self.peek(pos, width)?;
        let value = if signed {
            NumericValue::Signed(decode_signed(bytes, self.endian, pos)?)
        } else {
            NumericValue::Unsigned(decode_unsigned(bytes, self.endian, pos)?)
        };

        let mut region = Region::new(id, kind, pos, pos + width);
        region.endian = Some(self.endian);
        region.numeric_value = Some(value);
        self.memo.insert(id.to_string(), MemoValue::Number(value));
        self.position = region.end;
        Ok(region)
    }

    /// Unsigned number
    pub fn number(&mut self, width: usize, id: &str) -> Result<Region> {
        self.read_number(RegionKind::Number, false, width, id)
    }

    /// Signed number
    pub fn signed(&mut self, width: usize, id: &str) -> Result<Region> {
        self.read_number(RegionKind::SignedNumber, true, width, id)
    }

    /// Pointer or file offset
    pub fn offset(&mut self, width: usize, id: &str) -> Result<Region> {
        self.read_number(RegionKind::Offset, false, width, id)
    }

    /// Length or count
    pub fn size(&mut self, width: usize, id: &str) -> Result<Region> {
        self.read_number(RegionKind::Size, false, width, id)
    }

    /// Bit field interpreted with a flag table
    pub fn flags(&mut self, width: usize, id: &str, definition: &'static [FlagDef]) -> Result<Region> {
        Ok(self
            .read_number(RegionKind::Flags, false, width, id)?
            .with_flags(definition))
    }

    /// Enumerated value interpreted with a value table
    pub fn enumerated(
        &mut self,
        width: usize,
        id: &str,
        definition: ValueDefinition,
    ) -> Result<Region> {
        Ok(self.number(width, id)?.with_values(definition))
    }

    /// Timestamp counted in seconds from `epoch`
    pub fn time(&mut self, width: usize, id: &str, epoch: TimeEpoch) -> Result<Region> {
        let mut region = self.read_number(RegionKind::Time, false, width, id)?;
        region.interpreted_value = region.num().and_then(|s| epoch.render(s));
        Ok(region)
    }

    /// Decodes `width` bytes as text.
    ///
    /// With `null_terminated`, the value stops at the first zero code unit
    /// but the region still spans all `width` bytes.
    pub fn read_string(
        &mut self,
        width: usize,
        id: &str,
        encoding: TextEncoding,
        null_terminated: bool,
    ) -> Result<Region> {
        let pos = self.position;
        let text = encoding.decode(self.peek(pos, width)?, null_terminated);
        let mut region = Region::new(id, RegionKind::String, pos, pos + width).with_text(text.clone());
        region.endian = Some(self.endian);
        self.memo.insert(id.to_string(), MemoValue::Text(text));
        self.position = region.end;
        Ok(region)
    }

    /// Fixed-width string in the current encoding
    pub fn string(&mut self, width: usize, id: &str) -> Result<Region> {
        self.read_string(width, id, self.encoding, false)
    }

    /// Fixed-width string in the current encoding, cut at the first NUL
    pub fn padded_string(&mut self, width: usize, id: &str) -> Result<Region> {
        self.read_string(width, id, self.encoding, true)
    }

    /// Zero-terminated string in `encoding`; the region includes the
    /// terminator, or runs to the limit if there is none
    pub fn zstring_with(&mut self, id: &str, encoding: TextEncoding) -> Result<Region> {
        let pos = self.position;
        let tail = self.peek(pos, self.remaining())?;
        let width = match encoding.terminator_offset(tail) {
            Some(i) => i + encoding.unit_width(),
            None => tail.len(),
        };
        self.read_string(width, id, encoding, true)
    }

    /// Zero-terminated string in the current encoding
    pub fn zstring(&mut self, id: &str) -> Result<Region> {
        self.zstring_with(id, self.encoding)
    }

    /// Untyped byte span
    pub fn read_general(&mut self, width: usize, id: &str) -> Result<Region> {
        let pos = self.position;
        self.peek(pos, width)?;
        let region = Region::new(id, RegionKind::General, pos, pos + width);
        self.position = region.end;
        Ok(region)
    }

    /// Untyped span from the position up to the limit
    pub fn rest(&mut self, id: &str) -> Result<Region> {
        self.read_general(self.remaining(), id)
    }

    /// Untyped span of at most `width` bytes, shortened at the limit
    pub fn general_clamped(&mut self, width: usize, id: &str) -> Result<Region> {
        self.read_general(width.min(self.remaining()), id)
    }

    /// Validates `literal` at the current position and carves it as an
    /// untyped region
    pub fn magic(&mut self, literal: &[u8], id: &str) -> Result<Region> {
        self.expect_bytes(self.position, literal)?;
        self.read_general(literal.len(), id)
    }

    /// Groups `children` under a compound; does not move the cursor
    pub fn compound(&self, id: &str, children: Vec<Region>) -> Region {
        Region::compound(id, self.position, children)
    }

    /// Fails with [`Error::FormatMismatch`] unless `literal` is found at
    /// `offset`
    pub fn expect_bytes(&self, offset: usize, literal: &[u8]) -> Result<()> {
        if self.check_bytes(offset, literal) {
            Ok(())
        } else {
            Err(Error::mismatch(offset, format!("{literal:02X?}")))
        }
    }

    /// Returns true if `literal` is found at `offset`
    pub fn check_bytes(&self, offset: usize, literal: &[u8]) -> bool {
        self.peek(offset, literal.len())
            .map(|bytes| bytes == literal)
            .unwrap_or(false)
    }

    /// Finds `pattern` between the current position and the limit
    pub fn search(&self, pattern: &[u8], direction: Direction) -> Option<usize> {
        let haystack = self.buf.get(self.position..self.limit)?;
        let found = match direction {
            Direction::Forward => find_subsequence(haystack, pattern),
            Direction::Backward => rfind_subsequence(haystack, pattern),
        };
        found.map(|i| i + self.position)
    }

    /// Records a value under `id`, replacing any earlier one
    pub fn remember(&mut self, id: &str, value: MemoValue) {
        self.memo.insert(id.to_string(), value);
    }

    /// Returns the value last recorded under `id`
    pub fn value(&self, id: &str) -> Option<&MemoValue> {
        self.memo.get(id)
    }

    /// Returns the number last recorded under `id`
    pub fn num(&self, id: &str) -> Result<u64> {
        match self.memo.get(id) {
            Some(MemoValue::Number(n)) => n.as_u64().ok_or_else(|| Error::missing_field(id)),
            _ => Err(Error::missing_field(id)),
        }
    }

    /// Returns the number last recorded under `id` as a `usize`
    pub fn len_of(&self, id: &str) -> Result<usize> {
        let n = self.num(id)?;
        usize::try_from(n).map_err(|_| Error::malformed_length(self.position, format!("{id} = {n}")))
    }

    /// Returns the string last recorded under `id`
    pub fn text(&self, id: &str) -> Result<&str> {
        match self.memo.get(id) {
            Some(MemoValue::Text(s)) => Ok(s),
            _ => Err(Error::missing_field(id)),
        }
    }
}

/// Widest integer a numeric region can hold
const MAX_WIDTH: usize = 16;

fn decode_unsigned(bytes: &[u8], endian: Endian, pos: usize) -> Result<u128> {
    if bytes.len() > MAX_WIDTH {
        return Err(Error::unsupported(
            pos,
            format!("{}-byte integer is wider than {MAX_WIDTH} bytes", bytes.len()),
        ));
    }
    let fold = |acc: u128, &b: &u8| (acc << 8) | u128::from(b);
    Ok(match endian {
        Endian::Big => bytes.iter().fold(0, fold),
        Endian::Little => bytes.iter().rev().fold(0, fold),
    })
}

fn decode_signed(bytes: &[u8], endian: Endian, pos: usize) -> Result<i128> {
    let raw = decode_unsigned(bytes, endian, pos)?;
    let bits = bytes.len() * 8;
    if bits == 0 {
        return Ok(0);
    }
    // Sign-extend from the read width
    let shift = 128 - bits;
    Ok(((raw << shift) as i128) >> shift)
}

/// Find a subsequence within a byte slice
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Find the last occurrence of a subsequence within a byte slice
fn rfind_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(haystack.len());
    }
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_subsequence() {
        let data = b"PK..PK..tail";
        assert_eq!(find_subsequence(data, b"PK"), Some(0));
        assert_eq!(rfind_subsequence(data, b"PK"), Some(4));
        assert_eq!(find_subsequence(data, b"missing"), None);
    }

    #[test]
    fn test_numbers_and_endianness() {
        let data = [0x01, 0x02, 0x03, 0x04];
        let mut c = Cursor::new(&data);
        assert_eq!(c.number(2, "a").unwrap().num(), Some(0x0201));
        c.set_endian(Endian::Big);
        let r = c.number(2, "b").unwrap();
        assert_eq!(r.num(), Some(0x0304));
        assert_eq!(r.endian, Some(Endian::Big));
        assert_eq!((r.start, r.end), (2, 4));
        assert_eq!(c.position(), 4);
        assert!(c.is_at_end());
    }

    #[test]
    fn test_signed_twos_complement() {
        let data = [0xFF, 0xFE, 0xFF, 0x7F];
        let mut c = Cursor::new(&data);
        assert_eq!(c.signed(1, "a").unwrap().numeric_value, Some(NumericValue::Signed(-1)));
        // 0xFFFE big endian = -2
        let mut c = Cursor::new(&data[..2]).with_endian(Endian::Big);
        assert_eq!(c.signed(2, "b").unwrap().numeric_value, Some(NumericValue::Signed(-2)));
        let mut c = Cursor::new(&data[2..]);
        assert_eq!(c.signed(2, "c").unwrap().numeric_value, Some(NumericValue::Signed(0x7FFF)));
    }

    #[test]
    fn test_wide_numbers_keep_precision() {
        let data = [0xFF; 16];
        let mut c = Cursor::new(&data);
        let r = c.number(16, "wide").unwrap();
        assert_eq!(r.numeric_value, Some(NumericValue::Unsigned(u128::MAX)));
        let mut c = Cursor::new(&data);
        let r = c.signed(16, "wide").unwrap();
        assert_eq!(r.numeric_value, Some(NumericValue::Signed(-1)));

        let data = [0u8; 17];
        let mut c = Cursor::new(&data);
        assert!(matches!(
            c.number(17, "too_wide"),
            Err(Error::UnsupportedConstruct { .. })
        ));
    }

    #[test]
    fn test_truncated_read() {
        let data = [0u8; 3];
        let mut c = Cursor::new(&data);
        c.at(2);
        assert!(matches!(
            c.number(2, "x"),
            Err(Error::TruncatedBuffer { offset: 2, needed: 2, available: 1 })
        ));
        // a failed read does not move the cursor
        assert_eq!(c.position(), 2);
    }

    #[test]
    fn test_strings() {
        let data = b"abc\0def\0";
        let mut c = Cursor::new(data);
        let r = c.zstring("first").unwrap();
        assert_eq!((r.start, r.end), (0, 4));
        assert_eq!(r.text(), Some("abc"));
        let r = c.padded_string(4, "second").unwrap();
        assert_eq!(r.text(), Some("def"));
        assert_eq!(c.text("first").unwrap(), "abc");

        let mut c = Cursor::new(b"no-nul");
        let r = c.zstring("s").unwrap();
        assert_eq!((r.start, r.end), (0, 6));
    }

    #[test]
    fn test_memo_last_write_wins() {
        let data = [1, 2];
        let mut c = Cursor::new(&data);
        c.number(1, "n").unwrap();
        c.number(1, "n").unwrap();
        assert_eq!(c.num("n").unwrap(), 2);
        assert!(matches!(c.num("missing"), Err(Error::MissingField { .. })));
    }

    #[test]
    fn test_magic_and_expect() {
        let data = b"MZxx";
        let mut c = Cursor::new(data);
        assert!(c.magic(b"MZ", "sig").is_ok());
        assert!(matches!(c.magic(b"PE", "sig"), Err(Error::FormatMismatch { offset: 2, .. })));
        assert!(!c.check_bytes(3, b"xx"));
    }

    #[test]
    fn test_fork_is_bounded() {
        let data = [0u8; 10];
        let c = Cursor::new(&data);
        let mut sub = c.fork(2, 4);
        assert_eq!((sub.position(), sub.limit()), (2, 6));
        let r = sub.rest("all").unwrap();
        assert_eq!((r.start, r.end), (2, 6));
        assert!(sub.number(1, "past").is_err());

        let clamped = c.fork(8, 100);
        assert_eq!(clamped.limit(), 10);
    }

    #[test]
    fn test_search_directions() {
        let data = b"xxABxxABxx";
        let mut c = Cursor::new(data);
        assert_eq!(c.search(b"AB", Direction::Forward), Some(2));
        assert_eq!(c.search(b"AB", Direction::Backward), Some(6));
        c.at(3);
        assert_eq!(c.search(b"AB", Direction::Forward), Some(6));
        assert_eq!(c.search(b"ZZ", Direction::Backward), None);
    }
}
