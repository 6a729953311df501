//! PNG images.
//!
//! ## Layout
//! ```text
//! [0x00] Signature       89 50 4E 47 0D 0A 1A 0A
//! [0x08] chunk*          Length (u32 BE) | Type (4 ASCII) | Data | CRC (u32 BE)
//! ```
//!
//! The walk stops after `IEND`; anything behind it is reported as trailing
//! data.

use super::{starts_with, Decoder};
use crate::cursor::Cursor;
use crate::error::Result;
use crate::region::{Endian, Region, ValueDefinition};
use crate::registry::ParsingOptions;
use crate::text::TextEncoding;
use bytes::Bytes;
use tracing::{debug, trace, warn};

const SIGNATURE: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

const COLOR_TYPES: ValueDefinition = &[
    (0, "Grayscale"),
    (2, "Truecolor"),
    (3, "Indexed-color"),
    (4, "Grayscale with alpha"),
    (6, "Truecolor with alpha"),
];

const INTERLACE_METHODS: ValueDefinition = &[(0, "None"), (1, "Adam7")];

const UNIT_SPECIFIERS: ValueDefinition = &[(0, "unknown"), (1, "meter")];

/// Decoder for PNG images
#[derive(Debug, Clone, Copy, Default)]
pub struct PngDecoder;

impl Decoder for PngDecoder {
    fn id(&self) -> &'static str {
        "png"
    }

    fn name(&self) -> &'static str {
        "PNG"
    }

    fn sniff(&self, _filename: &str, extension: &str, buffer: &[u8]) -> bool {
        extension == "png" || starts_with(buffer, SIGNATURE)
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer).with_endian(Endian::Big);
        c.set_encoding(TextEncoding::Latin1);

        let mut regions = vec![c.magic(SIGNATURE, "signature")?];
        while c.remaining() >= 12 {
            let chunk = parse_chunk(&mut c)?;
            let last = chunk.text() == Some("IEND");
            regions.push(chunk);
            if last {
                break;
            }
        }
        if !c.is_at_end() {
            debug!("{} bytes after the last PNG chunk", c.remaining());
            regions.push(c.rest("trailingData")?);
        }
        Ok(regions)
    }
}

fn parse_chunk(c: &mut Cursor<'_>) -> Result<Region> {
    let length = c.size(4, "Length")?;
    let kind = c.string(4, "Type")?;
    let tag = c.text("Type")?.to_string();
    let declared = c.len_of("Length")?;

    let body = c.position();
    let available = c.remaining();
    let body_len = if declared > available {
        warn!("PNG chunk '{}' at {} runs past the end", tag, length.start);
        available
    } else {
        declared
    };
    trace!("PNG chunk '{}' [{}..{})", tag, body, body + body_len);

    let data = match parse_data(&mut c.fork(body, body_len), &tag) {
        Ok(data) => data,
        Err(e) if e.is_recoverable() => {
            warn!("PNG chunk '{}' payload not decoded: {}", tag, e);
            c.fork(body, body_len).rest("Data")?
        }
        Err(e) => return Err(e),
    };

    let mut fields = vec![length, kind, data];
    c.at(body + body_len);
    if c.remaining() >= 4 {
        fields.push(c.number(4, "CRC")?);
    }
    Ok(c.compound("chunk", fields).with_text(tag))
}

fn parse_data(c: &mut Cursor<'_>, tag: &str) -> Result<Region> {
    let fields = match tag {
        "IHDR" => vec![
            c.number(4, "Width")?,
            c.number(4, "Height")?,
            c.number(1, "BitDepth")?,
            c.enumerated(1, "ColorType", COLOR_TYPES)?,
            c.number(1, "CompressionMethod")?,
            c.number(1, "FilterMethod")?,
            c.enumerated(1, "InterlaceMethod", INTERLACE_METHODS)?,
        ],
        "tEXt" => {
            let keyword = c.zstring("Keyword")?;
            let value = c.rest("Text")?;
            let text = TextEncoding::Latin1.decode(c.peek(value.start, value.len())?, false);
            let label = format!("{}: {}", c.text("Keyword")?, text);
            let value = value.with_text(text);
            return Ok(c.compound("Data", vec![keyword, value]).with_text(label));
        }
        "tIME" => {
            let fields = vec![
                c.number(2, "Year")?,
                c.number(1, "Month")?,
                c.number(1, "Day")?,
                c.number(1, "Hour")?,
                c.number(1, "Minute")?,
                c.number(1, "Second")?,
            ];
            let stamp = format!(
                "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                c.num("Year")?,
                c.num("Month")?,
                c.num("Day")?,
                c.num("Hour")?,
                c.num("Minute")?,
                c.num("Second")?
            );
            return Ok(c.compound("Data", fields).with_interpretation(stamp));
        }
        "pHYs" => vec![
            c.number(4, "PixelsPerUnitX")?,
            c.number(4, "PixelsPerUnitY")?,
            c.enumerated(1, "Unit", UNIT_SPECIFIERS)?,
        ],
        "gAMA" => {
            let gamma = c.number(4, "Gamma")?;
            let value = c.num("Gamma")? as f64 / 100_000.0;
            vec![gamma.with_interpretation(format!("{value}"))]
        }
        _ => return c.rest("Data"),
    };
    Ok(c.compound("Data", fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assert_well_formed, find_deep};
    use pretty_assertions::assert_eq;

    fn chunk(tag: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(tag);
        out.extend_from_slice(body);
        out.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        out
    }

    fn image() -> Vec<u8> {
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&16u32.to_be_bytes());
        ihdr.extend_from_slice(&8u32.to_be_bytes());
        ihdr.extend_from_slice(&[8, 6, 0, 0, 1]);

        let mut data = SIGNATURE.to_vec();
        data.extend(chunk(b"IHDR", &ihdr));
        data.extend(chunk(b"tEXt", b"Title\0Sunset"));
        data.extend(chunk(b"IDAT", &[0x78, 0x9C, 0x01]));
        data.extend(chunk(b"IEND", &[]));
        data
    }

    #[test]
    fn test_chunks() {
        let data = Bytes::from(image());
        let regions = PngDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        assert_well_formed(&regions, data.len());

        let tags: Vec<_> = regions[1..].iter().filter_map(|r| r.text()).collect();
        assert_eq!(tags, vec!["IHDR", "tEXt", "IDAT", "IEND"]);

        assert_eq!(find_deep(&regions, "Width").unwrap().num(), Some(16));
        assert_eq!(
            find_deep(&regions, "ColorType").unwrap().interpreted_value.as_deref(),
            Some("Truecolor with alpha")
        );
        assert_eq!(
            find_deep(&regions, "InterlaceMethod").unwrap().interpreted_value.as_deref(),
            Some("Adam7")
        );

        let text = regions[2].child("Data").unwrap();
        assert_eq!(text.text(), Some("Title: Sunset"));

        let crc = regions[3].child("CRC").unwrap();
        assert_eq!(crc.num(), Some(0xDEAD_BEEF));
    }

    #[test]
    fn test_trailing_data_after_iend() {
        let mut data = image();
        data.extend_from_slice(b"junk");
        let data = Bytes::from(data);
        let regions = PngDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        let last = regions.last().unwrap();
        assert_eq!(last.id, "trailingData");
        assert_eq!(last.len(), 4);
    }

    #[test]
    fn test_short_ihdr_degrades() {
        let mut data = SIGNATURE.to_vec();
        data.extend(chunk(b"IHDR", &[0, 0, 0, 1]));
        let data = Bytes::from(data);
        let regions = PngDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        assert_well_formed(&regions, data.len());
        let payload = regions[1].child("Data").unwrap();
        assert_eq!(payload.len(), 4);
        assert!(payload.eager_children().is_empty());
    }

    #[test]
    fn test_bad_signature() {
        let data = Bytes::from_static(b"\x89PNX\r\n\x1a\n");
        assert!(PngDecoder.parse(&data, &ParsingOptions::new()).is_err());
    }
}
