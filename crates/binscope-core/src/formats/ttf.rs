//! TrueType and OpenType fonts.
//!
//! ## Layout
//! ```text
//! [0x00] sfntVersion     (0x00010000, 'true' or 'OTTO')
//! [0x04] numTables       (u16 BE)
//! [0x06] searchRange     (u16 BE)
//! [0x08] entrySelector   (u16 BE)
//! [0x0A] rangeShift      (u16 BE)
//! [0x0C] table records   (numTables × 16 bytes: tag, checksum, offset, length)
//! ```
//! Table bodies live at the offsets named by the records. Only `head` is
//! decoded field by field.

use super::Decoder;
use crate::cursor::Cursor;
use crate::error::Result;
use crate::region::{Endian, FlagDef, Region, ValueDefinition};
use crate::registry::ParsingOptions;
use crate::text::TextEncoding;
use crate::time::TimeEpoch;
use bytes::Bytes;
use tracing::{debug, warn};

const RECORD_SIZE: usize = 16;
const HEAD_MAGIC: u64 = 0x5F0F_3CF5;

const SCALER_TYPES: ValueDefinition = &[
    (0x0001_0000, "TrueType"),
    (0x7472_7565, "TrueType (Apple 'true')"),
    (0x4F54_544F, "OpenType CFF ('OTTO')"),
    (0x7479_7031, "PostScript ('typ1')"),
];

const MAC_STYLE: &[FlagDef] = &[
    FlagDef::bit(0, "Bold", "bold"),
    FlagDef::bit(1, "Italic", "italic"),
    FlagDef::bit(2, "Underline", "underline"),
    FlagDef::bit(3, "Outline", "outline"),
    FlagDef::bit(4, "Shadow", "shadow"),
    FlagDef::bit(5, "Condensed", "condensed"),
    FlagDef::bit(6, "Extended", "extended"),
];

const LOCA_FORMATS: ValueDefinition = &[(0, "short offsets"), (1, "long offsets")];

/// Decoder for `.ttf` / `.otf` fonts
#[derive(Debug, Clone, Copy, Default)]
pub struct TtfDecoder;

impl Decoder for TtfDecoder {
    fn id(&self) -> &'static str {
        "ttf"
    }

    fn name(&self) -> &'static str {
        "TrueType / OpenType font"
    }

    fn sniff(&self, _filename: &str, extension: &str, buffer: &[u8]) -> bool {
        matches!(extension, "ttf" | "otf")
            || buffer.starts_with(&[0x00, 0x01, 0x00, 0x00, 0x00])
            || buffer.starts_with(b"OTTO")
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer).with_endian(Endian::Big);
        c.set_encoding(TextEncoding::Ascii);

        let offset_table = vec![
            c.enumerated(4, "scalarType", SCALER_TYPES)?
                .with_description("font outline flavor"),
            c.size(2, "numTables")?,
            c.number(2, "searchRange")?,
            c.number(2, "entrySelector")?,
            c.number(2, "rangeShift")?,
        ];
        let count = c.len_of("numTables")?;
        debug!("Font with {} tables", count);

        let mut records = Vec::with_capacity(count);
        let mut tables = Vec::with_capacity(count);
        for i in 0..count {
            c.at(12 + RECORD_SIZE * i);
            records.push(parse_record(&mut c)?);

            let tag = c.text("tag")?.to_string();
            let (offset, length) = (c.len_of("offset")?, c.len_of("length")?);
            if offset >= buffer.len() {
                warn!("Font table '{}' starts past the end of the file", tag);
                continue;
            }
            tables.push(parse_table(&c.fork(offset, length), &tag)?);
        }

        let offset_table = c.compound("offsetSubTable", offset_table);
        let directory = Region::compound("TableDirectory", offset_table.end, records);
        let mut regions = vec![offset_table, directory];
        if !tables.is_empty() {
            tables.sort_by_key(|t| t.start);
            regions.push(Region::compound("Tables", tables[0].start, tables));
        }
        Ok(regions)
    }
}

fn parse_record(c: &mut Cursor<'_>) -> Result<Region> {
    let fields = vec![
        c.string(4, "tag")?,
        c.number(4, "checksum")?,
        c.offset(4, "offset")?,
        c.size(4, "length")?,
    ];
    let tag = c.text("tag")?.to_string();
    Ok(c.compound("TableRecord", fields).with_text(tag))
}

fn parse_table(c: &Cursor<'_>, tag: &str) -> Result<Region> {
    let mut sub = c.clone();
    if tag == "head" {
        match parse_head(&mut sub) {
            Ok(head) => return Ok(head.with_text(tag)),
            Err(e) if e.is_recoverable() => warn!("Font 'head' table not decoded: {}", e),
            Err(e) => return Err(e),
        }
    }
    let mut sub = c.clone();
    Ok(sub.rest("table")?.with_text(tag))
}

fn parse_head(c: &mut Cursor<'_>) -> Result<Region> {
    let mut fields = vec![
        c.number(2, "majorVersion")?,
        c.number(2, "minorVersion")?,
        c.number(4, "fontRevision")?,
        c.number(4, "checkSumAdjustment")?,
        c.number(4, "magicNumber")?,
    ];
    if c.num("magicNumber")? != HEAD_MAGIC {
        warn!("Font 'head' magic is {:#x}", c.num("magicNumber")?);
    }
    let revision = c.num("fontRevision")? as f64 / 65536.0;
    fields[2].interpreted_value = Some(format!("{revision:.3}"));

    fields.extend([
        c.number(2, "flags")?,
        c.number(2, "unitsPerEm")?,
        c.time(8, "created", TimeEpoch::Mac)?,
        c.time(8, "modified", TimeEpoch::Mac)?,
        c.signed(2, "xMin")?,
        c.signed(2, "yMin")?,
        c.signed(2, "xMax")?,
        c.signed(2, "yMax")?,
        c.flags(2, "macStyle", MAC_STYLE)?,
        c.number(2, "lowestRecPPEM")?,
        c.signed(2, "fontDirectionHint")?,
        c.signed(2, "indexToLocFormat")?.with_values(LOCA_FORMATS),
        c.signed(2, "glyphDataFormat")?,
    ]);
    Ok(c.compound("head", fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::NumericValue;
    use crate::test_support::{assert_well_formed, find_deep};
    use pretty_assertions::assert_eq;

    fn head() -> Vec<u8> {
        let mut t = Vec::new();
        t.extend_from_slice(&[0, 1, 0, 0]);
        t.extend_from_slice(&0x0001_8000u32.to_be_bytes());
        t.extend_from_slice(&0u32.to_be_bytes());
        t.extend_from_slice(&(HEAD_MAGIC as u32).to_be_bytes());
        t.extend_from_slice(&0u16.to_be_bytes());
        t.extend_from_slice(&2048u16.to_be_bytes());
        t.extend_from_slice(&0u64.to_be_bytes());
        t.extend_from_slice(&0u64.to_be_bytes());
        for v in [-100i16, -200, 1000, 900] {
            t.extend_from_slice(&v.to_be_bytes());
        }
        t.extend_from_slice(&3u16.to_be_bytes());
        t.extend_from_slice(&8u16.to_be_bytes());
        t.extend_from_slice(&2i16.to_be_bytes());
        t.extend_from_slice(&1i16.to_be_bytes());
        t.extend_from_slice(&0i16.to_be_bytes());
        t
    }

    fn font() -> Vec<u8> {
        let head = head();
        let mut data = vec![0, 1, 0, 0, 0, 2, 0, 32, 0, 1, 0, 0];
        let head_offset = 12 + 2 * RECORD_SIZE as u32;
        let name_offset = head_offset + head.len() as u32;

        data.extend_from_slice(b"head");
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&head_offset.to_be_bytes());
        data.extend_from_slice(&(head.len() as u32).to_be_bytes());
        data.extend_from_slice(b"name");
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&name_offset.to_be_bytes());
        data.extend_from_slice(&6u32.to_be_bytes());

        data.extend(head);
        data.extend_from_slice(&[0; 6]);
        data
    }

    #[test]
    fn test_table_directory() {
        let data = Bytes::from(font());
        let regions = TtfDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        assert_well_formed(&regions, data.len());

        let offset_table = &regions[0];
        assert_eq!((offset_table.start, offset_table.end), (0, 12));
        assert_eq!(
            offset_table.child("scalarType").unwrap().interpreted_value.as_deref(),
            Some("TrueType")
        );

        let tags: Vec<_> = regions[1].eager_children().iter().filter_map(|r| r.text()).collect();
        assert_eq!(tags, vec!["head", "name"]);
        assert_eq!(regions[1].end, 44);

        let tables = &regions[2];
        assert_eq!(tables.eager_children()[1].text(), Some("name"));
        assert_eq!(tables.eager_children()[1].len(), 6);
    }

    #[test]
    fn test_head_table() {
        let data = Bytes::from(font());
        let regions = TtfDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        let head = find_deep(&regions, "head").unwrap();
        assert_eq!(head.len(), 54);
        assert_eq!(head.child("unitsPerEm").unwrap().num(), Some(2048));
        assert_eq!(
            head.child("xMin").unwrap().numeric_value,
            Some(NumericValue::Signed(-100))
        );
        assert_eq!(
            head.child("macStyle").unwrap().interpreted_value.as_deref(),
            Some("Bold | Italic")
        );
        assert_eq!(
            head.child("fontRevision").unwrap().interpreted_value.as_deref(),
            Some("1.500")
        );
        assert_eq!(
            head.child("created").unwrap().interpreted_value.as_deref(),
            Some("1904-01-01 00:00:00 UTC")
        );
        assert_eq!(
            head.child("indexToLocFormat").unwrap().interpreted_value.as_deref(),
            Some("long offsets")
        );
    }

    #[test]
    fn test_table_past_end_is_skipped() {
        let mut data = vec![0, 1, 0, 0, 0, 1, 0, 16, 0, 0, 0, 0];
        data.extend_from_slice(b"glyf");
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&5000u32.to_be_bytes());
        data.extend_from_slice(&10u32.to_be_bytes());
        let data = Bytes::from(data);
        let regions = TtfDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        assert_eq!(regions.len(), 2);
    }
}
