//! JPEG / JFIF images.
//!
//! A JPEG file is a run of marker segments:
//! ```text
//! FF xx                    standalone marker (SOI, EOI, RSTn, TEM)
//! FF xx | Length (u16 BE) | payload (Length - 2 bytes)
//! ```
//! After a start-of-scan (`SOS`) segment comes entropy-coded data, which
//! runs until the next `FF` that is neither stuffing (`FF 00`) nor a
//! restart marker (`FF D0`..`FF D7`).

use super::{starts_with, Decoder};
use crate::cursor::Cursor;
use crate::error::Result;
use crate::region::{Endian, Region, ValueDefinition};
use crate::registry::ParsingOptions;
use crate::text::TextEncoding;
use bytes::Bytes;
use tracing::{debug, trace, warn};

const SOI: &[u8] = &[0xFF, 0xD8];

const SOS: u8 = 0xDA;
const EOI: u8 = 0xD9;
const TEM: u8 = 0x01;

const MARKERS: ValueDefinition = &[
    (0xFF01, "TEM"),
    (0xFFC0, "SOF0 (baseline DCT)"),
    (0xFFC1, "SOF1 (extended sequential DCT)"),
    (0xFFC2, "SOF2 (progressive DCT)"),
    (0xFFC3, "SOF3 (lossless)"),
    (0xFFC4, "DHT"),
    (0xFFC5, "SOF5"),
    (0xFFC6, "SOF6"),
    (0xFFC7, "SOF7"),
    (0xFFC8, "JPG"),
    (0xFFC9, "SOF9"),
    (0xFFCA, "SOF10"),
    (0xFFCB, "SOF11"),
    (0xFFCC, "DAC"),
    (0xFFCD, "SOF13"),
    (0xFFCE, "SOF14"),
    (0xFFCF, "SOF15"),
    (0xFFD0, "RST0"),
    (0xFFD1, "RST1"),
    (0xFFD2, "RST2"),
    (0xFFD3, "RST3"),
    (0xFFD4, "RST4"),
    (0xFFD5, "RST5"),
    (0xFFD6, "RST6"),
    (0xFFD7, "RST7"),
    (0xFFD8, "SOI"),
    (0xFFD9, "EOI"),
    (0xFFDA, "SOS"),
    (0xFFDB, "DQT"),
    (0xFFDC, "DNL"),
    (0xFFDD, "DRI"),
    (0xFFDE, "DHP"),
    (0xFFDF, "EXP"),
    (0xFFE0, "APP0"),
    (0xFFE1, "APP1"),
    (0xFFE2, "APP2"),
    (0xFFE3, "APP3"),
    (0xFFE4, "APP4"),
    (0xFFE5, "APP5"),
    (0xFFE6, "APP6"),
    (0xFFE7, "APP7"),
    (0xFFE8, "APP8"),
    (0xFFE9, "APP9"),
    (0xFFEA, "APP10"),
    (0xFFEB, "APP11"),
    (0xFFEC, "APP12"),
    (0xFFED, "APP13"),
    (0xFFEE, "APP14"),
    (0xFFEF, "APP15"),
    (0xFFFE, "COM"),
];

const DENSITY_UNITS: ValueDefinition = &[
    (0, "no units (aspect ratio)"),
    (1, "dots per inch"),
    (2, "dots per centimeter"),
];

/// Decoder for JPEG images
#[derive(Debug, Clone, Copy, Default)]
pub struct JpegDecoder;

impl Decoder for JpegDecoder {
    fn id(&self) -> &'static str {
        "jpeg"
    }

    fn name(&self) -> &'static str {
        "JPEG"
    }

    fn sniff(&self, _filename: &str, extension: &str, buffer: &[u8]) -> bool {
        matches!(extension, "jpg" | "jpeg" | "jfif") || starts_with(buffer, SOI)
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer).with_endian(Endian::Big);
        c.set_encoding(TextEncoding::Latin1);
        c.expect_bytes(0, SOI)?;

        let mut regions = Vec::new();
        while c.remaining() >= 2 {
            let pos = c.position();
            if c.peek_u8(pos)? != 0xFF {
                warn!("JPEG marker expected at {}", pos);
                break;
            }
            let code = c.peek_u8(pos + 1)?;
            if code == 0xFF {
                regions.push(c.read_general(1, "Fill")?);
                continue;
            }
            if is_standalone(code) {
                let marker = c.enumerated(2, "Marker", MARKERS)?;
                let name = marker.interpreted_value.clone().unwrap_or_default();
                regions.push(c.compound("Segment", vec![marker]).with_text(name));
                if code == EOI {
                    break;
                }
                continue;
            }
            regions.push(parse_segment(&mut c, code)?);
        }
        if !c.is_at_end() {
            debug!("{} bytes after the last JPEG segment", c.remaining());
            regions.push(c.rest("TrailingData")?);
        }
        Ok(regions)
    }
}

/// Markers that carry no length field
fn is_standalone(code: u8) -> bool {
    matches!(code, 0xD0..=0xD7 | 0xD8 | EOI | TEM)
}

fn parse_segment(c: &mut Cursor<'_>, code: u8) -> Result<Region> {
    let marker = c.enumerated(2, "Marker", MARKERS)?;
    let name = marker
        .interpreted_value
        .clone()
        .unwrap_or_else(|| format!("FF{code:02X}"));
    let length = c.size(2, "Length")?;
    let declared = c.len_of("Length")?.saturating_sub(2);

    let body = c.position();
    let body_len = declared.min(c.remaining());
    if body_len < declared {
        warn!("JPEG segment {} at {} runs past the end", name, marker.start);
    }
    trace!("JPEG segment {} [{}..{})", name, body, body + body_len);

    let mut fields = vec![marker, length];
    let mut sub = c.fork(body, body_len);
    let payload = match code {
        0xE0 if sub.check_bytes(body, b"JFIF\0") => parse_jfif(&mut sub),
        0xC0..=0xC3 | 0xC5..=0xC7 | 0xC9..=0xCB | 0xCD..=0xCF => parse_frame(&mut sub),
        0xDD => sub.number(2, "RestartInterval").map(|r| vec![r]),
        0xFE => sub.string(body_len, "Comment").map(|r| vec![r]),
        _ => sub.rest("Data").map(|r| vec![r]),
    };
    match payload {
        Ok(payload) => fields.extend(payload),
        Err(e) if e.is_recoverable() => {
            warn!("JPEG segment {} payload not decoded: {}", name, e);
            fields.push(c.fork(body, body_len).rest("Data")?);
        }
        Err(e) => return Err(e),
    }
    c.at(body + body_len);

    if code == SOS {
        let scan_end = find_scan_end(c.buffer(), c.position());
        fields.push(c.read_general(scan_end - c.position(), "ScanData")?);
    }
    Ok(c.compound("Segment", fields).with_text(name))
}

/// Offset of the first marker after entropy-coded data starting at `from`
fn find_scan_end(buf: &[u8], from: usize) -> usize {
    let mut i = from;
    while i + 1 < buf.len() {
        if buf[i] == 0xFF && !matches!(buf[i + 1], 0x00 | 0xD0..=0xD7) {
            return i;
        }
        i += 1;
    }
    buf.len().max(from)
}

fn parse_jfif(c: &mut Cursor<'_>) -> Result<Vec<Region>> {
    let mut fields = vec![
        c.padded_string(5, "Identifier")?,
        c.number(1, "VersionMajor")?,
        c.number(1, "VersionMinor")?,
        c.enumerated(1, "DensityUnits", DENSITY_UNITS)?,
        c.number(2, "XDensity")?,
        c.number(2, "YDensity")?,
        c.number(1, "XThumbnail")?,
        c.number(1, "YThumbnail")?,
    ];
    if !c.is_at_end() {
        fields.push(c.rest("Thumbnail")?);
    }
    Ok(fields)
}

fn parse_frame(c: &mut Cursor<'_>) -> Result<Vec<Region>> {
    let mut fields = vec![
        c.number(1, "Precision")?,
        c.number(2, "Height")?,
        c.number(2, "Width")?,
        c.size(1, "ComponentCount")?,
    ];
    let mut components = Vec::new();
    for _ in 0..c.len_of("ComponentCount")? {
        let parts = vec![
            c.number(1, "ComponentId")?,
            c.number(1, "Sampling")?,
            c.number(1, "QuantTable")?,
        ];
        components.push(c.compound("Component", parts));
    }
    fields.push(c.compound("Components", components));
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assert_well_formed, find_deep};
    use pretty_assertions::assert_eq;

    fn segment(code: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0xFF, code];
        out.extend_from_slice(&((body.len() + 2) as u16).to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    fn image() -> Vec<u8> {
        let mut data = vec![0xFF, 0xD8];
        data.extend(segment(0xE0, b"JFIF\0\x01\x02\x01\x00\x48\x00\x48\x00\x00"));
        data.extend(segment(0xC0, &[8, 0, 16, 0, 32, 1, 1, 0x11, 0]));
        data.extend(segment(0xDA, &[1, 1, 0, 0, 63, 0]));
        // entropy data with a stuffed FF 00 and a restart marker
        data.extend_from_slice(&[0x12, 0xFF, 0x00, 0x34, 0xFF, 0xD0, 0x56]);
        data.extend_from_slice(&[0xFF, 0xD9]);
        data
    }

    #[test]
    fn test_segments() {
        let data = Bytes::from(image());
        let regions = JpegDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        assert_well_formed(&regions, data.len());

        let names: Vec<_> = regions.iter().filter_map(|r| r.text()).collect();
        assert_eq!(names, vec!["SOI", "APP0", "SOF0 (baseline DCT)", "SOS", "EOI"]);

        assert_eq!(find_deep(&regions, "Identifier").unwrap().text(), Some("JFIF"));
        assert_eq!(
            find_deep(&regions, "DensityUnits").unwrap().interpreted_value.as_deref(),
            Some("dots per inch")
        );
        assert_eq!(find_deep(&regions, "Width").unwrap().num(), Some(32));
        assert_eq!(find_deep(&regions, "Height").unwrap().num(), Some(16));
    }

    #[test]
    fn test_scan_data_skips_stuffing_and_restarts() {
        let data = Bytes::from(image());
        let regions = JpegDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        let scan = find_deep(&regions, "ScanData").unwrap();
        assert_eq!(scan.len(), 7);
        assert_eq!(scan.end, data.len() - 2);
    }

    #[test]
    fn test_restart_range_is_inclusive() {
        assert!(is_standalone(0xD0));
        assert!(is_standalone(0xD7));
        assert!(!is_standalone(0xDA));
        let buf = [0x00, 0xFF, 0xD7, 0x00, 0xFF, 0xC4];
        assert_eq!(find_scan_end(&buf, 0), 4);
    }

    #[test]
    fn test_trailing_data_after_eoi() {
        let mut data = image();
        data.extend_from_slice(b"tail");
        let data = Bytes::from(data);
        let regions = JpegDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        assert_eq!(regions.last().unwrap().id, "TrailingData");
    }

    #[test]
    fn test_missing_soi() {
        let data = Bytes::from_static(&[0x00, 0x01, 0x02]);
        assert!(JpegDecoder.parse(&data, &ParsingOptions::new()).is_err());
    }
}
