//! ZIP archives, including ZIP64.
//!
//! ## Layout
//! ```text
//! [local file header + data]*        one per entry
//! [central directory header]*        one per entry, at cdOffset
//! [ZIP64 end of central directory]   only when a trailer field overflows
//! [ZIP64 end of central directory locator]
//! [end of central directory]         found by scanning backwards
//! ```
//!
//! Both record tables are lazy: their child count comes from the trailer
//! and entries are decoded on first access. Central directory entries are
//! variable-length, so entry `i` is located by walking forward from the
//! nearest decoded entry using the three length fields at offsets 28, 30
//! and 32. Local entries are located through the `localHeaderOffset` of the
//! matching central directory entry.

use super::{starts_with, Decoder};
use crate::cursor::{Cursor, Direction};
use crate::error::{Error, Result};
use crate::region::{
    ChildSource, Children, FlagDef, KnownChildren, LazyChildren, Region, RegionKind, ValueDefinition,
};
use crate::registry::{OptionDef, ParsingOptions};
use crate::text::TextEncoding;
use crate::time::dos_date_time;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const LOCAL_SIG: &[u8] = b"PK\x03\x04";
const CENTRAL_SIG: &[u8] = b"PK\x01\x02";
const EOCD_SIG: &[u8] = b"PK\x05\x06";
const ZIP64_EOCD_SIG: &[u8] = b"PK\x06\x06";
const ZIP64_LOCATOR_SIG: &[u8] = b"PK\x06\x07";
const DESCRIPTOR_SIG: &[u8] = b"PK\x07\x08";

const CENTRAL_HEADER_LEN: usize = 46;
const LOCATOR_LEN: usize = 20;
/// Fixed part of the ZIP64 end record counted by its `recordSize`
const ZIP64_EOCD_FIXED: usize = 44;

const U16_SENTINEL: u64 = 0xFFFF;
const U32_SENTINEL: u64 = 0xFFFF_FFFF;

const FLAG_DATA_DESCRIPTOR: u64 = 1 << 3;
const FLAG_UTF8: u64 = 1 << 11;

const ZIP64_EXTRA: u64 = 0x0001;

const COMPRESSION_METHODS: ValueDefinition = &[
    (0, "Stored"),
    (1, "Shrunk"),
    (2, "Reduced (factor 1)"),
    (3, "Reduced (factor 2)"),
    (4, "Reduced (factor 3)"),
    (5, "Reduced (factor 4)"),
    (6, "Imploded"),
    (8, "Deflated"),
    (9, "Deflate64"),
    (10, "PKWARE DCL Imploded"),
    (12, "BZIP2"),
    (14, "LZMA"),
    (18, "IBM TERSE"),
    (19, "IBM LZ77 z"),
    (93, "Zstandard"),
    (95, "XZ"),
    (96, "JPEG"),
    (97, "WavPack"),
    (98, "PPMd"),
    (99, "AES encrypted"),
];

const EXTRA_HEADERS: ValueDefinition = &[
    (0x0001, "ZIP64 extended information"),
    (0x0007, "AV info"),
    (0x000A, "NTFS"),
    (0x000D, "UNIX"),
    (0x0017, "Strong encryption"),
    (0x5455, "Extended timestamp"),
    (0x6375, "Unicode comment"),
    (0x7075, "Unicode path"),
    (0x7875, "Unix UID/GID"),
    (0x9901, "AES encryption"),
];

const GENERIC_FLAGS: &[FlagDef] = &[
    FlagDef::bit(0, "Encrypted", "entry is encrypted"),
    FlagDef::bit(3, "DataDescriptor", "sizes and CRC follow the data"),
    FlagDef::bit(4, "EnhancedDeflation", "reserved for enhanced deflating"),
    FlagDef::bit(5, "PatchedData", "compressed patched data"),
    FlagDef::bit(6, "StrongEncryption", "strong encryption"),
    FlagDef::bit(11, "UTF8", "name and comment are UTF-8"),
    FlagDef::bit(13, "MaskedHeader", "local header values are masked"),
];

const IMPLODE_FLAGS: &[FlagDef] = &[
    FlagDef::bit(0, "Encrypted", "entry is encrypted"),
    FlagDef::bit(1, "8KDictionary", "8K sliding dictionary (4K when clear)"),
    FlagDef::bit(2, "3Trees", "3 Shannon-Fano trees (2 when clear)"),
    FlagDef::bit(3, "DataDescriptor", "sizes and CRC follow the data"),
    FlagDef::bit(4, "EnhancedDeflation", "reserved for enhanced deflating"),
    FlagDef::bit(5, "PatchedData", "compressed patched data"),
    FlagDef::bit(6, "StrongEncryption", "strong encryption"),
    FlagDef::bit(11, "UTF8", "name and comment are UTF-8"),
    FlagDef::bit(13, "MaskedHeader", "local header values are masked"),
];

const DEFLATE_FLAGS: &[FlagDef] = &[
    FlagDef::bit(0, "Encrypted", "entry is encrypted"),
    FlagDef::field(1, 2, 0, "Normal", "normal compression"),
    FlagDef::field(1, 2, 1, "Maximum", "maximum compression"),
    FlagDef::field(1, 2, 2, "Fast", "fast compression"),
    FlagDef::field(1, 2, 3, "SuperFast", "super fast compression"),
    FlagDef::bit(3, "DataDescriptor", "sizes and CRC follow the data"),
    FlagDef::bit(4, "EnhancedDeflation", "reserved for enhanced deflating"),
    FlagDef::bit(5, "PatchedData", "compressed patched data"),
    FlagDef::bit(6, "StrongEncryption", "strong encryption"),
    FlagDef::bit(11, "UTF8", "name and comment are UTF-8"),
    FlagDef::bit(13, "MaskedHeader", "local header values are masked"),
];

const LZMA_FLAGS: &[FlagDef] = &[
    FlagDef::bit(0, "Encrypted", "entry is encrypted"),
    FlagDef::bit(1, "EOSMarker", "an end-of-stream marker terminates the data"),
    FlagDef::bit(3, "DataDescriptor", "sizes and CRC follow the data"),
    FlagDef::bit(4, "EnhancedDeflation", "reserved for enhanced deflating"),
    FlagDef::bit(5, "PatchedData", "compressed patched data"),
    FlagDef::bit(6, "StrongEncryption", "strong encryption"),
    FlagDef::bit(11, "UTF8", "name and comment are UTF-8"),
    FlagDef::bit(13, "MaskedHeader", "local header values are masked"),
];

/// General purpose flag table, which depends on the compression method
fn flag_table(method: u64) -> &'static [FlagDef] {
    match method {
        6 => IMPLODE_FLAGS,
        8 | 9 => DEFLATE_FLAGS,
        14 => LZMA_FLAGS,
        _ => GENERIC_FLAGS,
    }
}

/// Decoder for ZIP archives and the many formats built on them
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipDecoder;

impl Decoder for ZipDecoder {
    fn id(&self) -> &'static str {
        "zip"
    }

    fn name(&self) -> &'static str {
        "ZIP archive"
    }

    fn sniff(&self, _filename: &str, extension: &str, buffer: &[u8]) -> bool {
        matches!(extension, "zip" | "jar" | "apk" | "xpi")
            || starts_with(buffer, LOCAL_SIG)
            || starts_with(buffer, EOCD_SIG)
    }

    fn parse(&self, buffer: &Bytes, options: &ParsingOptions) -> Result<Vec<Region>> {
        let encoding = name_encoding(options);
        let mut c = Cursor::new(buffer);
        c.set_encoding(encoding);

        let eocd_at = c
            .search(EOCD_SIG, Direction::Backward)
            .ok_or_else(|| Error::mismatch(0, "end of central directory record"))?;
        debug!("ZIP end of central directory at {}", eocd_at);
        let eocd = parse_eocd(c.at(eocd_at))?;

        let mut zip64 = Vec::new();
        if needs_zip64(&c)? {
            let mut z = c.clone();
            match parse_zip64(&mut z, eocd_at) {
                Ok(records) => {
                    zip64 = records;
                    c = z;
                }
                Err(e) if e.is_recoverable() => warn!("ZIP64 records not decoded: {}", e),
                Err(e) => return Err(e),
            }
        }

        let cd_offset = c.len_of("cdOffset")?;
        if cd_offset > buffer.len() {
            return Err(Error::malformed_length(
                eocd_at,
                format!("central directory at {cd_offset} in a {} byte file", buffer.len()),
            ));
        }
        let cd_end = cd_offset.saturating_add(c.len_of("cdSize")?).min(buffer.len());
        let mut count = c.len_of("cdRecords")?;
        let room = (cd_end - cd_offset) / CENTRAL_HEADER_LEN;
        if count > room {
            warn!("ZIP declares {} entries but the central directory holds at most {}", count, room);
            count = room;
        }
        debug!("ZIP central directory [{}..{}) with {} entries", cd_offset, cd_end, count);

        let central = Arc::new(LazyChildren::new(
            count,
            CentralEntries {
                buffer: buffer.clone(),
                start: cd_offset,
                encoding,
            },
        ));
        let locals = LazyChildren::new(
            count,
            LocalEntries {
                buffer: buffer.clone(),
                central: Arc::clone(&central),
                encoding,
            },
        );

        let mut directory = Region::new("CentralDirectory", RegionKind::Compound, cd_offset, cd_end)
            .with_description("central directory");
        directory.children = Children::Lazy(central);

        let mut regions = vec![
            Region::lazy("LocalFiles", 0, cd_offset, locals).with_description("local file entries"),
            directory,
        ];
        regions.extend(zip64);
        regions.push(eocd);
        Ok(regions)
    }

    fn parsing_options(&self) -> Vec<OptionDef> {
        vec![OptionDef {
            id: "encoding",
            name: "File name encoding",
            description: "Encoding of names and comments in entries without the UTF-8 flag",
            default: "utf-8",
        }]
    }
}

fn name_encoding(options: &ParsingOptions) -> TextEncoding {
    match options.get("encoding") {
        None => TextEncoding::Utf8,
        Some(label) => TextEncoding::from_label(label).unwrap_or_else(|| {
            warn!("Unknown ZIP name encoding '{}', using UTF-8", label);
            TextEncoding::Utf8
        }),
    }
}

fn parse_eocd(c: &mut Cursor<'_>) -> Result<Region> {
    let mut fields = vec![
        c.magic(EOCD_SIG, "signature")?,
        c.number(2, "diskNumber")?,
        c.number(2, "cdDisk")?,
        c.size(2, "cdRecordsOnDisk")?,
        c.size(2, "cdRecords")?,
        c.size(4, "cdSize")?,
        c.offset(4, "cdOffset")?,
        c.size(2, "commentLength")?,
    ];
    let len = c.len_of("commentLength")?;
    if len > 0 {
        if len > c.remaining() {
            warn!("ZIP comment of {} bytes is cut at the end of the file", len);
        }
        fields.push(c.read_string(len.min(c.remaining()), "comment", c.encoding(), false)?);
    }
    Ok(c.compound("EndOfCentralDirectory", fields)
        .with_description("end of central directory record"))
}

fn needs_zip64(c: &Cursor<'_>) -> Result<bool> {
    Ok(c.num("cdRecords")? == U16_SENTINEL
        || c.num("cdSize")? == U32_SENTINEL
        || c.num("cdOffset")? == U32_SENTINEL)
}

/// Decodes the ZIP64 locator before the trailer and the ZIP64 end record it
/// points to. The 64-bit counts replace the trailer's values in the memo.
fn parse_zip64(c: &mut Cursor<'_>, eocd_at: usize) -> Result<Vec<Region>> {
    let at = eocd_at
        .checked_sub(LOCATOR_LEN)
        .ok_or_else(|| Error::mismatch(0, "ZIP64 end of central directory locator"))?;
    c.at(at);
    let locator = vec![
        c.magic(ZIP64_LOCATOR_SIG, "signature")?,
        c.number(4, "zip64EndDisk")?,
        c.offset(8, "zip64EndOffset")?,
        c.number(4, "totalDisks")?,
    ];
    let locator = c
        .compound("Zip64Locator", locator)
        .with_description("ZIP64 end of central directory locator");

    let end_at = c.len_of("zip64EndOffset")?;
    c.at(end_at);
    let mut record = vec![
        c.magic(ZIP64_EOCD_SIG, "signature")?,
        c.size(8, "recordSize")?,
        c.number(2, "versionMadeBy")?,
        c.number(2, "versionNeeded")?,
        c.number(4, "diskNumber")?,
        c.number(4, "cdDisk")?,
        c.size(8, "cdRecordsOnDisk")?,
        c.size(8, "cdRecords")?,
        c.size(8, "cdSize")?,
        c.offset(8, "cdOffset")?,
    ];
    let extensible = c.len_of("recordSize")?.saturating_sub(ZIP64_EOCD_FIXED);
    if extensible > 0 {
        record.push(c.general_clamped(extensible, "extensibleData")?);
    }
    let record = c
        .compound("Zip64EndOfCentralDirectory", record)
        .with_description("ZIP64 end of central directory record");
    debug!("ZIP64 end record at {}", end_at);

    let mut out = vec![record, locator];
    out.sort_by_key(|r| r.start);
    Ok(out)
}

/// Lazily decoded central directory entries
struct CentralEntries {
    buffer: Bytes,
    start: usize,
    encoding: TextEncoding,
}

impl ChildSource for CentralEntries {
    fn fetch(&self, index: usize, known: KnownChildren<'_>) -> Result<Region> {
        let mut c = Cursor::new(&self.buffer);
        let (mut i, mut pos) = match known.nearest_before(index) {
            Some((j, entry)) => (j, entry.start),
            None => (0, self.start),
        };
        trace!("ZIP central entry {} walked from entry {} at {}", index, i, pos);
        while i < index {
            pos = next_central_entry(&c, pos)?;
            i += 1;
        }
        parse_central_entry(c.at(pos), self.encoding)
    }
}

/// Offset of the central directory entry after the one at `pos`, computed
/// from its name, extra and comment lengths
fn next_central_entry(c: &Cursor<'_>, pos: usize) -> Result<usize> {
    c.expect_bytes(pos, CENTRAL_SIG)?;
    let variable = c.peek_uint(pos + 28, 2)? + c.peek_uint(pos + 30, 2)? + c.peek_uint(pos + 32, 2)?;
    Ok(pos + CENTRAL_HEADER_LEN + variable as usize)
}

/// Lazily decoded local file entries, each located through its central
/// directory entry
struct LocalEntries {
    buffer: Bytes,
    central: Arc<LazyChildren>,
    encoding: TextEncoding,
}

impl ChildSource for LocalEntries {
    fn fetch(&self, index: usize, _known: KnownChildren<'_>) -> Result<Region> {
        let entry = self.central.get(index)?;
        let offset = last_value(&entry, "localHeaderOffset")
            .ok_or_else(|| Error::missing_field("localHeaderOffset"))?;
        let compressed = last_value(&entry, "compressedSize")
            .ok_or_else(|| Error::missing_field("compressedSize"))?;

        let mut c = Cursor::new(&self.buffer);
        let offset = usize::try_from(offset)
            .map_err(|_| Error::malformed_length(entry.start, format!("local header at {offset}")))?;
        parse_local_entry(c.at(offset), compressed, self.encoding)
    }
}

/// Value of the last region named `id` in the tree. A ZIP64 extra field
/// follows the fixed header, so its values win over the sentinels.
fn last_value(entry: &Region, id: &str) -> Option<u64> {
    let mut value = None;
    entry.walk(&mut |r| {
        if r.id == id && r.num().is_some() {
            value = r.num();
        }
    });
    value
}

/// Which fixed header fields overflowed into a ZIP64 extra field
#[derive(Debug, Clone, Copy, Default)]
struct Overflow {
    uncompressed: bool,
    compressed: bool,
    offset: bool,
    disk: bool,
}

/// Fields shared by local and central headers, from `versionNeeded` through
/// `extraFieldLength`. Returns the general purpose flags.
fn parse_shared_header(c: &mut Cursor<'_>, fields: &mut Vec<Region>) -> Result<u64> {
    fields.push(c.number(2, "versionNeeded")?);
    let method = c.peek_uint(c.position() + 2, 2)?;
    fields.push(c.flags(2, "generalPurpose", flag_table(method))?);
    fields.push(c.enumerated(2, "compressionMethod", COMPRESSION_METHODS)?);

    let time = c.number(2, "lastModTime")?;
    let date = c.number(2, "lastModDate")?;
    let stamp = dos_date_time(c.num("lastModDate")? as u16, c.num("lastModTime")? as u16);
    let mut modified = c.compound("lastModified", vec![time, date]);
    modified.interpreted_value = stamp;
    fields.push(modified);

    fields.extend([
        c.number(4, "crc32")?,
        c.size(4, "compressedSize")?,
        c.size(4, "uncompressedSize")?,
        c.size(2, "filenameLength")?,
        c.size(2, "extraFieldLength")?,
    ]);
    c.num("generalPurpose")
}

fn entry_encoding(flags: u64, default: TextEncoding) -> TextEncoding {
    if flags & FLAG_UTF8 != 0 {
        TextEncoding::Utf8
    } else {
        default
    }
}

fn parse_central_entry(c: &mut Cursor<'_>, encoding: TextEncoding) -> Result<Region> {
    let mut fields = vec![c.magic(CENTRAL_SIG, "signature")?, c.number(2, "versionMadeBy")?];
    let flags = parse_shared_header(c, &mut fields)?;
    fields.extend([
        c.size(2, "commentLength")?,
        c.number(2, "diskNumberStart")?,
        c.number(2, "internalAttributes")?,
        c.number(4, "externalAttributes")?,
        c.offset(4, "localHeaderOffset")?,
    ]);
    let overflow = Overflow {
        uncompressed: c.num("uncompressedSize")? == U32_SENTINEL,
        compressed: c.num("compressedSize")? == U32_SENTINEL,
        offset: c.num("localHeaderOffset")? == U32_SENTINEL,
        disk: c.num("diskNumberStart")? == U16_SENTINEL,
    };

    let encoding = entry_encoding(flags, encoding);
    let name = c.read_string(c.len_of("filenameLength")?, "filename", encoding, false)?;
    let filename = name.text().unwrap_or_default().to_string();
    fields.push(name);

    let extra_len = c.len_of("extraFieldLength")?;
    if extra_len > 0 {
        fields.push(parse_extra_field(c, extra_len, overflow)?.0);
    }
    let comment_len = c.len_of("commentLength")?;
    if comment_len > 0 {
        fields.push(c.read_string(comment_len, "comment", encoding, false)?);
    }
    trace!("ZIP central entry '{}' at {}", filename, fields[0].start);

    Ok(c.compound("CentralDirectoryEntry", fields)
        .with_text(filename)
        .with_description("central directory file header"))
}

/// Decodes a local header followed by `compressed` bytes of data and, if
/// flagged, a data descriptor
fn parse_local_entry(c: &mut Cursor<'_>, compressed: u64, encoding: TextEncoding) -> Result<Region> {
    let mut fields = vec![c.magic(LOCAL_SIG, "signature")?];
    let flags = parse_shared_header(c, &mut fields)?;
    let overflow = Overflow {
        uncompressed: c.num("uncompressedSize")? == U32_SENTINEL,
        compressed: c.num("compressedSize")? == U32_SENTINEL,
        ..Overflow::default()
    };

    let encoding = entry_encoding(flags, encoding);
    let name = c.read_string(c.len_of("filenameLength")?, "filename", encoding, false)?;
    let filename = name.text().unwrap_or_default().to_string();
    fields.push(name);

    let mut zip64 = false;
    let extra_len = c.len_of("extraFieldLength")?;
    if extra_len > 0 {
        let (extra, has_zip64) = parse_extra_field(c, extra_len, overflow)?;
        fields.push(extra);
        zip64 = has_zip64;
    }

    let compressed = usize::try_from(compressed).unwrap_or(usize::MAX);
    if compressed > c.remaining() {
        warn!("ZIP entry '{}' data runs past the end of the file", filename);
    }
    if compressed > 0 {
        fields.push(c.general_clamped(compressed, "compressedData")?);
    }

    if flags & FLAG_DATA_DESCRIPTOR != 0 {
        let mut sub = c.clone();
        match parse_data_descriptor(&mut sub, zip64) {
            Ok(descriptor) => {
                fields.push(descriptor);
                *c = sub;
            }
            Err(e) if e.is_recoverable() => warn!("ZIP data descriptor of '{}' not decoded: {}", filename, e),
            Err(e) => return Err(e),
        }
    }

    Ok(c.compound("LocalFile", fields)
        .with_text(filename)
        .with_description("local file header"))
}

fn parse_data_descriptor(c: &mut Cursor<'_>, zip64: bool) -> Result<Region> {
    let mut fields = Vec::new();
    if c.check_bytes(c.position(), DESCRIPTOR_SIG) {
        fields.push(c.magic(DESCRIPTOR_SIG, "signature")?);
    }
    let width = if zip64 { 8 } else { 4 };
    fields.extend([
        c.number(4, "crc32")?,
        c.size(width, "compressedSize")?,
        c.size(width, "uncompressedSize")?,
    ]);
    Ok(c.compound("dataDescriptor", fields))
}

/// Decodes the extra field blocks of an entry. Returns the region and
/// whether a ZIP64 block was present. Blocks that cannot be segmented leave
/// the whole field as raw bytes.
fn parse_extra_field(c: &mut Cursor<'_>, len: usize, overflow: Overflow) -> Result<(Region, bool)> {
    let start = c.position();
    let len = len.min(c.remaining());
    let mut sub = c.fork(start, len);
    let mut zip64 = false;

    let mut blocks = Vec::new();
    let mut parsed = Ok(());
    while sub.remaining() >= 4 {
        match parse_extra_block(&mut sub, overflow) {
            Ok((block, is_zip64)) => {
                zip64 |= is_zip64;
                blocks.push(block);
            }
            Err(e) => {
                parsed = Err(e);
                break;
            }
        }
    }
    c.at(start + len);

    let region = match parsed {
        Ok(()) => {
            if !sub.is_at_end() {
                blocks.push(sub.rest("padding")?);
            }
            Region::compound("extraField", start, blocks)
        }
        Err(e) if e.is_recoverable() => {
            warn!("ZIP extra field at {} kept as bytes: {}", start, e);
            zip64 = false;
            Region::new("extraField", RegionKind::General, start, start + len)
        }
        Err(e) => return Err(e),
    };
    Ok((region, zip64))
}

fn parse_extra_block(c: &mut Cursor<'_>, overflow: Overflow) -> Result<(Region, bool)> {
    let mut fields = vec![
        c.enumerated(2, "headerId", EXTRA_HEADERS)?,
        c.size(2, "dataSize")?,
    ];
    let id = c.num("headerId")?;
    let size = c.len_of("dataSize")?;
    let body = c.position();
    if size > c.remaining() {
        return Err(Error::truncated(body, size, c.remaining()));
    }
    let label = fields[0]
        .interpreted_value
        .clone()
        .unwrap_or_else(|| format!("{id:#06x}"));

    let mut sub = c.fork(body, size);
    if id == ZIP64_EXTRA {
        if overflow.uncompressed {
            fields.push(sub.size(8, "uncompressedSize")?);
        }
        if overflow.compressed {
            fields.push(sub.size(8, "compressedSize")?);
        }
        if overflow.offset {
            fields.push(sub.offset(8, "localHeaderOffset")?);
        }
        if overflow.disk {
            fields.push(sub.number(4, "diskNumberStart")?);
        }
    }
    if !sub.is_at_end() {
        fields.push(sub.rest("data")?);
    }
    c.at(body + size);
    Ok((c.compound("extra", fields).with_text(label), id == ZIP64_EXTRA))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assert_well_formed, outline};
    use pretty_assertions::assert_eq;
    use std::slice;

    fn u16le(out: &mut Vec<u8>, v: u16) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32le(out: &mut Vec<u8>, v: u32) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn u64le(out: &mut Vec<u8>, v: u64) {
        out.extend_from_slice(&v.to_le_bytes());
    }

    fn local(name: &[u8], data: &[u8], flags: u16, declared: u32) -> Vec<u8> {
        let mut out = LOCAL_SIG.to_vec();
        u16le(&mut out, 20);
        u16le(&mut out, flags);
        u16le(&mut out, 0);
        u16le(&mut out, 0);
        u16le(&mut out, 0x21);
        u32le(&mut out, 0);
        u32le(&mut out, declared);
        u32le(&mut out, declared);
        u16le(&mut out, name.len() as u16);
        u16le(&mut out, 0);
        out.extend_from_slice(name);
        out.extend_from_slice(data);
        out
    }

    struct Central<'a> {
        name: &'a [u8],
        size: u32,
        offset: u32,
        flags: u16,
        extra: &'a [u8],
    }

    fn central(e: &Central<'_>) -> Vec<u8> {
        let mut out = CENTRAL_SIG.to_vec();
        u16le(&mut out, 20);
        u16le(&mut out, 20);
        u16le(&mut out, e.flags);
        u16le(&mut out, 0);
        u16le(&mut out, 0);
        u16le(&mut out, 0x21);
        u32le(&mut out, 0);
        u32le(&mut out, e.size);
        u32le(&mut out, e.size);
        u16le(&mut out, e.name.len() as u16);
        u16le(&mut out, e.extra.len() as u16);
        u16le(&mut out, 0);
        u16le(&mut out, 0);
        u16le(&mut out, 0);
        u32le(&mut out, 0);
        u32le(&mut out, e.offset);
        out.extend_from_slice(e.name);
        out.extend_from_slice(e.extra);
        out
    }

    fn eocd(count: u16, size: u32, offset: u32) -> Vec<u8> {
        let mut out = EOCD_SIG.to_vec();
        u16le(&mut out, 0);
        u16le(&mut out, 0);
        u16le(&mut out, count);
        u16le(&mut out, count);
        u32le(&mut out, size);
        u32le(&mut out, offset);
        u16le(&mut out, 0);
        out
    }

    /// Stored entries with plain 32-bit headers
    fn archive(entries: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut data = Vec::new();
        let mut offsets = Vec::new();
        for (name, body) in entries {
            offsets.push(data.len() as u32);
            data.extend(local(name, body, 0, body.len() as u32));
        }
        let cd_offset = data.len();
        for ((name, body), offset) in entries.iter().zip(offsets) {
            data.extend(central(&Central {
                name,
                size: body.len() as u32,
                offset,
                flags: 0,
                extra: &[],
            }));
        }
        let cd_size = data.len() - cd_offset;
        data.extend(eocd(entries.len() as u16, cd_size as u32, cd_offset as u32));
        data
    }

    fn decode(data: &Bytes) -> Vec<Region> {
        ZipDecoder.parse(data, &ParsingOptions::new()).unwrap()
    }

    fn entry(region: &Region, index: usize) -> Arc<Region> {
        match &region.children {
            Children::Lazy(lazy) => lazy.get(index).unwrap(),
            _ => panic!("'{}' is not lazy", region.id),
        }
    }

    #[test]
    fn test_archive_layout() {
        let data = Bytes::from(archive(&[(b"a.txt", b"hello"), (b"dir/b.bin", b"\x00\x01\x02")]));
        let regions = decode(&data);
        assert_well_formed(&regions, data.len());

        let ids: Vec<_> = regions.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["LocalFiles", "CentralDirectory", "EndOfCentralDirectory"]);
        assert_eq!(regions[1].child_count(), 2);
        assert_eq!(regions[0].end, regions[1].start);

        let first = entry(&regions[1], 0);
        assert_eq!(first.text(), Some("a.txt"));
        assert_eq!(
            first.child("lastModified").unwrap().interpreted_value.as_deref(),
            Some("1980-01-01 00:00:00")
        );
        assert_eq!(
            first.child("compressionMethod").unwrap().interpreted_value.as_deref(),
            Some("Stored")
        );
    }

    #[test]
    fn test_local_entry_follows_central_offset() {
        let data = Bytes::from(archive(&[(b"a.txt", b"hello"), (b"b.txt", b"world!")]));
        let regions = decode(&data);

        let second = entry(&regions[0], 1);
        assert_eq!(second.text(), Some("b.txt"));
        assert_eq!(second.start, 30 + 5 + 5);
        let body = second.child("compressedData").unwrap();
        assert_eq!(&data[body.start..body.end], b"world!");
    }

    #[test]
    fn test_lazy_fetch_is_order_independent() {
        let entries: &[(&[u8], &[u8])] = &[(b"one", b"1"), (b"two-two", b"22"), (b"three", b"333"), (b"4", b"")];
        let data = Bytes::from(archive(entries));

        let forward = decode(&data);
        let backward = decode(&data);
        let Children::Lazy(lazy) = &backward[1].children else {
            panic!("central directory is lazy");
        };
        lazy.get(3).unwrap();
        assert_eq!(lazy.materialized(), 1);
        lazy.get(1).unwrap();

        for i in [3, 0, 2, 1] {
            let a = entry(&forward[1], i);
            let b = entry(&backward[1], i);
            assert_eq!(outline(slice::from_ref(&*a)), outline(slice::from_ref(&*b)));
        }
    }

    #[test]
    fn test_zip64_trailer() {
        let mut data = local(b"big.bin", b"abc", 0, 3);
        let cd_offset = data.len();
        data.extend(central(&Central {
            name: b"big.bin",
            size: 3,
            offset: 0,
            flags: 0,
            extra: &[],
        }));
        let cd_size = data.len() - cd_offset;

        let zip64_at = data.len();
        data.extend_from_slice(ZIP64_EOCD_SIG);
        u64le(&mut data, ZIP64_EOCD_FIXED as u64);
        u16le(&mut data, 45);
        u16le(&mut data, 45);
        u32le(&mut data, 0);
        u32le(&mut data, 0);
        u64le(&mut data, 1);
        u64le(&mut data, 1);
        u64le(&mut data, cd_size as u64);
        u64le(&mut data, cd_offset as u64);

        data.extend_from_slice(ZIP64_LOCATOR_SIG);
        u32le(&mut data, 0);
        u64le(&mut data, zip64_at as u64);
        u32le(&mut data, 1);

        data.extend(eocd(0xFFFF, 0xFFFF_FFFF, 0xFFFF_FFFF));
        let data = Bytes::from(data);
        let regions = decode(&data);
        assert_well_formed(&regions, data.len());

        let ids: Vec<_> = regions.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "LocalFiles",
                "CentralDirectory",
                "Zip64EndOfCentralDirectory",
                "Zip64Locator",
                "EndOfCentralDirectory"
            ]
        );
        assert_eq!((regions[1].start, regions[1].end), (cd_offset, cd_offset + cd_size));
        assert_eq!(regions[1].child_count(), 1);
        assert_eq!(regions[2].start, zip64_at);
        assert_eq!(entry(&regions[1], 0).text(), Some("big.bin"));
    }

    #[test]
    fn test_zip64_extra_overrides_sentinels() {
        let mut data = local(b"x", b"data", 0, 4);
        let cd_offset = data.len();
        let mut extra = Vec::new();
        u16le(&mut extra, 0x0001);
        u16le(&mut extra, 24);
        u64le(&mut extra, 4);
        u64le(&mut extra, 4);
        u64le(&mut extra, 0);
        let mut record = central(&Central {
            name: b"x",
            size: 0xFFFF_FFFF,
            offset: 0xFFFF_FFFF,
            flags: 0,
            extra: &extra,
        });
        data.append(&mut record);
        let cd_size = data.len() - cd_offset;
        data.extend(eocd(1, cd_size as u32, cd_offset as u32));
        let data = Bytes::from(data);
        let regions = decode(&data);
        assert_well_formed(&regions, data.len());

        let cd = entry(&regions[1], 0);
        assert_eq!(last_value(&cd, "compressedSize"), Some(4));
        assert_eq!(last_value(&cd, "localHeaderOffset"), Some(0));
        let extra = cd.child("extraField").unwrap();
        assert_eq!(extra.eager_children()[0].text(), Some("ZIP64 extended information"));

        let local = entry(&regions[0], 0);
        let body = local.child("compressedData").unwrap();
        assert_eq!(&data[body.start..body.end], b"data");
    }

    #[test]
    fn test_data_descriptor() {
        let mut data = local(b"s", b"stream", FLAG_DATA_DESCRIPTOR as u16, 0);
        data.extend_from_slice(DESCRIPTOR_SIG);
        u32le(&mut data, 0xDEAD_BEEF);
        u32le(&mut data, 6);
        u32le(&mut data, 6);
        let cd_offset = data.len();
        data.extend(central(&Central {
            name: b"s",
            size: 6,
            offset: 0,
            flags: FLAG_DATA_DESCRIPTOR as u16,
            extra: &[],
        }));
        let cd_size = data.len() - cd_offset;
        data.extend(eocd(1, cd_size as u32, cd_offset as u32));
        let data = Bytes::from(data);
        let regions = decode(&data);
        assert_well_formed(&regions, data.len());

        let local = entry(&regions[0], 0);
        assert_eq!(local.end, cd_offset);
        let descriptor = local.child("dataDescriptor").unwrap();
        assert_eq!(descriptor.child("compressedSize").unwrap().num(), Some(6));
        assert_eq!(
            local.child("generalPurpose").unwrap().interpreted_value.as_deref(),
            Some("DataDescriptor")
        );
    }

    #[test]
    fn test_name_encoding_option() {
        let data = Bytes::from(archive(&[(b"caf\xE9", b"")]));

        let regions = decode(&data);
        assert_eq!(entry(&regions[1], 0).text(), Some("caf\u{FFFD}"));

        let options = ParsingOptions::from([("encoding".to_string(), "latin1".to_string())]);
        let regions = ZipDecoder.parse(&data, &options).unwrap();
        assert_eq!(entry(&regions[1], 0).text(), Some("café"));
    }

    #[test]
    fn test_flags_depend_on_method() {
        let interpret = |method: u64, raw: u128| {
            let mut region = Region::new("generalPurpose", RegionKind::Flags, 0, 2);
            region.numeric_value = Some(crate::region::NumericValue::Unsigned(raw));
            region.with_flags(flag_table(method)).interpreted_value
        };
        assert_eq!(interpret(8, 0b10).as_deref(), Some("Maximum"));
        assert_eq!(interpret(9, 0b110).as_deref(), Some("SuperFast"));
        assert_eq!(interpret(6, 0b110).as_deref(), Some("8KDictionary | 3Trees"));
        assert_eq!(interpret(14, 0b10).as_deref(), Some("EOSMarker"));
        assert_eq!(interpret(0, 0b10), None);
        assert_eq!(interpret(0, 0b1010).as_deref(), Some("DataDescriptor"));
    }

    #[test]
    fn test_missing_trailer() {
        let data = Bytes::from(local(b"a", b"b", 0, 1));
        assert!(matches!(
            ZipDecoder.parse(&data, &ParsingOptions::new()),
            Err(Error::FormatMismatch { .. })
        ));
    }
}
