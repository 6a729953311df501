//! ISO base media files (MP4, MOV, M4A, HEIF).
//!
//! ## Box header
//! ```text
//! [0x00] Size            (u32 BE; 1 = LargeSize follows, 0 = to end of parent)
//! [0x04] Type            (4 ASCII)
//! [0x08] LargeSize       (u64 BE, only when Size == 1)
//!        UserType        (16 bytes, only when Type == "uuid")
//! ```
//!
//! Container boxes hold nothing but child boxes and are walked recursively.
//! `meta` is a full box: version and flags precede its children.

use super::{check_nesting, Decoder};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::region::{Endian, Region};
use crate::registry::ParsingOptions;
use crate::text::TextEncoding;
use crate::time::TimeEpoch;
use bytes::Bytes;
use tracing::{trace, warn};

const CONTAINERS: &[&str] = &[
    "moov", "trak", "mdia", "minf", "stbl", "edts", "dinf", "udta", "mvex", "moof", "traf", "mfra",
    "ilst",
];

/// Decoder for ISO base media files
#[derive(Debug, Clone, Copy, Default)]
pub struct Mp4Decoder;

impl Decoder for Mp4Decoder {
    fn id(&self) -> &'static str {
        "mp4"
    }

    fn name(&self) -> &'static str {
        "MP4 / ISO-BMFF"
    }

    fn sniff(&self, _filename: &str, extension: &str, buffer: &[u8]) -> bool {
        matches!(extension, "mp4" | "m4a" | "m4v" | "mov" | "3gp" | "heic")
            || buffer.get(4..8) == Some(b"ftyp".as_slice())
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer).with_endian(Endian::Big);
        c.set_encoding(TextEncoding::Latin1);
        parse_boxes(&mut c, 0)
    }
}

fn parse_boxes(c: &mut Cursor<'_>, depth: usize) -> Result<Vec<Region>> {
    check_nesting(depth, c.position(), "MP4 box")?;
    let mut boxes = Vec::new();
    while c.remaining() >= 8 {
        boxes.push(parse_box(c, depth)?);
    }
    if !c.is_at_end() {
        boxes.push(c.rest("trailing")?);
    }
    Ok(boxes)
}

fn parse_box(c: &mut Cursor<'_>, depth: usize) -> Result<Region> {
    let start = c.position();
    let mut header = vec![c.size(4, "Size")?, c.string(4, "Type")?];
    let kind = c.text("Type")?.to_string();

    let declared = match c.num("Size")? {
        1 => {
            header.push(c.size(8, "LargeSize")?);
            Some(c.num("LargeSize")?)
        }
        0 => None,
        n => Some(n),
    };
    if kind == "uuid" {
        header.push(c.read_general(16, "UserType")?);
    }

    let header_end = c.position();
    let end = match declared {
        None => c.limit(),
        Some(n) => {
            let n = usize::try_from(n)
                .map_err(|_| Error::malformed_length(start, format!("box size {n}")))?;
            let end = start.saturating_add(n);
            if end < header_end {
                return Err(Error::malformed_length(
                    start,
                    format!("box '{kind}' size {n} is smaller than its header"),
                ));
            }
            if end > c.limit() {
                warn!("MP4 box '{}' at {} runs past its parent", kind, start);
            }
            end.min(c.limit())
        }
    };
    trace!("MP4 box '{}' [{}..{})", kind, start, end);

    let mut fields = header;
    if end > header_end {
        let mut sub = c.fork(header_end, end - header_end);
        match parse_payload(&mut sub, &kind, depth) {
            Ok(payload) => fields.extend(payload),
            Err(e) if e.is_recoverable() => {
                warn!("MP4 box '{}' payload not decoded: {}", kind, e);
                fields.push(c.fork(header_end, end - header_end).rest("Data")?);
            }
            Err(e) => return Err(e),
        }
    }
    c.at(end);
    Ok(c.compound("Box", fields).with_text(kind))
}

fn parse_payload(c: &mut Cursor<'_>, kind: &str, depth: usize) -> Result<Vec<Region>> {
    if CONTAINERS.contains(&kind) {
        return parse_boxes(c, depth + 1);
    }
    match kind {
        "ftyp" | "styp" => parse_file_type(c),
        "mvhd" => parse_movie_header(c),
        "hdlr" => parse_handler(c),
        "meta" => {
            let mut fields = full_box_header(c)?;
            fields.extend(parse_boxes(c, depth + 1)?);
            Ok(fields)
        }
        _ => Ok(vec![c.rest("Data")?]),
    }
}

fn full_box_header(c: &mut Cursor<'_>) -> Result<Vec<Region>> {
    Ok(vec![c.number(1, "Version")?, c.number(3, "Flags")?])
}

fn parse_file_type(c: &mut Cursor<'_>) -> Result<Vec<Region>> {
    let major = c.string(4, "MajorBrand")?;
    let minor = c.number(4, "MinorVersion")?;
    let mut brands = Vec::new();
    while c.remaining() >= 4 {
        brands.push(c.string(4, "Brand")?);
    }
    Ok(vec![major, minor, c.compound("CompatibleBrands", brands)])
}

fn parse_movie_header(c: &mut Cursor<'_>) -> Result<Vec<Region>> {
    let mut fields = full_box_header(c)?;
    let wide = if c.num("Version")? == 1 { 8 } else { 4 };
    fields.extend([
        c.time(wide, "CreationTime", TimeEpoch::Mac)?,
        c.time(wide, "ModificationTime", TimeEpoch::Mac)?,
        c.number(4, "Timescale")?.with_description("time units per second"),
        c.number(wide, "Duration")?,
    ]);

    let (rate, volume) = (c.number(4, "Rate")?, c.number(2, "Volume")?);
    let rate_value = c.num("Rate")? as f64 / 65536.0;
    let volume_value = c.num("Volume")? as f64 / 256.0;
    fields.push(rate.with_interpretation(format!("{rate_value}")));
    fields.push(volume.with_interpretation(format!("{volume_value}")));

    fields.extend([
        c.read_general(10, "Reserved")?,
        c.read_general(36, "Matrix")?,
        c.read_general(24, "PreDefined")?,
        c.number(4, "NextTrackId")?,
    ]);
    let timescale = c.num("Timescale")?;
    if timescale > 0 {
        let seconds = c.num("Duration")? / timescale;
        if let Some(duration) = fields.iter_mut().find(|r| r.id == "Duration") {
            duration.interpreted_value = Some(format!("{seconds} s"));
        }
    }
    Ok(fields)
}

fn parse_handler(c: &mut Cursor<'_>) -> Result<Vec<Region>> {
    let mut fields = full_box_header(c)?;
    fields.extend([
        c.number(4, "PreDefined")?,
        c.string(4, "HandlerType")?,
        c.read_general(12, "Reserved")?,
    ]);
    if !c.is_at_end() {
        fields.push(c.zstring("Name")?);
    }
    Ok(fields)
}
