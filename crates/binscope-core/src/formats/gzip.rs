//! GZIP member format (RFC 1952).
//!
//! ## Layout
//! ```text
//! [0x00] ID1 ID2         (1F 8B)
//! [0x02] CM              (8 = deflate)
//! [0x03] FLG
//! [0x04] MTIME           (u32 LE, Unix seconds)
//! [0x08] XFL
//! [0x09] OS
//!        FEXTRA   -> XLEN (u16 LE) + subfields
//!        FNAME    -> zero-terminated name
//!        FCOMMENT -> zero-terminated comment
//!        FHCRC    -> CRC16 of the header
//!        compressed blocks
//! [-8]   CRC32           (u32 LE)
//! [-4]   ISIZE           (u32 LE)
//! ```

use super::{starts_with, Decoder};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::region::{FlagDef, Region, ValueDefinition};
use crate::registry::ParsingOptions;
use crate::text::TextEncoding;
use crate::time::TimeEpoch;
use bytes::Bytes;

const MAGIC: &[u8] = &[0x1F, 0x8B];
const TRAILER_SIZE: usize = 8;

const FHCRC: u64 = 0x02;
const FEXTRA: u64 = 0x04;
const FNAME: u64 = 0x08;
const FCOMMENT: u64 = 0x10;

const COMPRESSION_METHODS: ValueDefinition = &[(8, "Deflate")];

const FLAGS: &[FlagDef] = &[
    FlagDef::bit(0, "FTEXT", "file is probably ASCII text"),
    FlagDef::bit(1, "FHCRC", "a CRC16 of the header is present"),
    FlagDef::bit(2, "FEXTRA", "optional extra fields are present"),
    FlagDef::bit(3, "FNAME", "an original file name is present"),
    FlagDef::bit(4, "FCOMMENT", "a file comment is present"),
];

const EXTRA_FLAGS: &[FlagDef] = &[
    FlagDef::bit(1, "slowest", "compressor used maximum compression"),
    FlagDef::bit(2, "fastest", "compressor used the fastest algorithm"),
];

const OPERATING_SYSTEMS: ValueDefinition = &[
    (0, "FAT filesystem (MS-DOS, OS/2, NT/Win32)"),
    (1, "Amiga"),
    (2, "VMS (or OpenVMS)"),
    (3, "Unix"),
    (4, "VM/CMS"),
    (5, "Atari TOS"),
    (6, "HPFS filesystem (OS/2, NT)"),
    (7, "Macintosh"),
    (8, "Z-System"),
    (9, "CP/M"),
    (10, "TOPS-20"),
    (11, "NTFS filesystem (NT)"),
    (12, "QDOS"),
    (13, "Acorn RISCOS"),
    (255, "unknown"),
];

/// Decoder for `.gz` files
#[derive(Debug, Clone, Copy, Default)]
pub struct GzipDecoder;

impl Decoder for GzipDecoder {
    fn id(&self) -> &'static str {
        "gzip"
    }

    fn name(&self) -> &'static str {
        "GZIP"
    }

    fn sniff(&self, _filename: &str, _extension: &str, buffer: &[u8]) -> bool {
        starts_with(buffer, MAGIC)
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer);
        // Header strings are ISO-8859-1 per RFC 1952
        c.set_encoding(TextEncoding::Latin1);

        let mut fields = vec![
            c.magic(MAGIC, "Signature")?.with_description("GZip file magic header"),
            c.enumerated(1, "CompressionMethod", COMPRESSION_METHODS)?
                .with_description("Compression method"),
            c.flags(1, "Flag", FLAGS)?,
            c.time(4, "ModificationTime", TimeEpoch::Unix)?,
            c.flags(1, "ExtraFlag", EXTRA_FLAGS)?,
            c.enumerated(1, "OS", OPERATING_SYSTEMS)?,
        ];
        let flag = c.num("Flag")?;

        if flag & FEXTRA != 0 {
            let xlen = c.size(2, "XLEN")?;
            let end = xlen.end + c.len_of("XLEN")?;
            let mut extra = vec![xlen];
            extra.extend(parse_extra_fields(&mut c.fork(c.position(), end - c.position()))?);
            c.at(end);
            fields.push(c.compound("ExtraFields", extra));
        }
        if flag & FNAME != 0 {
            fields.push(c.zstring("FileName")?);
        }
        if flag & FCOMMENT != 0 {
            fields.push(c.zstring("FileComment")?);
        }
        if flag & FHCRC != 0 {
            fields.push(c.number(2, "HeaderCRC16")?);
        }

        let body = c
            .limit()
            .checked_sub(TRAILER_SIZE)
            .filter(|&end| end >= c.position())
            .ok_or_else(|| Error::truncated(c.position(), TRAILER_SIZE, c.remaining()))?
            - c.position();
        fields.push(c.read_general(body, "CompressedData")?);
        fields.push(c.number(4, "CRC32")?);
        fields.push(c.size(4, "ISIZE")?.with_description("uncompressed size modulo 2^32"));

        Ok(vec![c
            .compound("gzip", fields)
            .with_description("gzip file format")])
    }
}

fn parse_extra_fields(c: &mut Cursor<'_>) -> Result<Vec<Region>> {
    let mut regions = Vec::new();
    while !c.is_at_end() {
        let si = c.string(2, "SI")?.with_description("subfield id");
        let len = c.size(2, "LEN")?;
        let content = c.read_general(c.len_of("LEN")?, "ExtraContent")?;
        regions.push(c.compound("ExtraField", vec![si, len, content]));
    }
    Ok(regions)
}
