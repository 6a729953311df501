//! RIFF chunk files (WAVE, AVI, ANI, WebP).
//!
//! ## Layout
//! ```text
//! chunk := FourCC (4 ASCII) | Size (u32) | payload (Size bytes) | pad (Size odd)
//!
//! "RIFF" payload := FormType (4 ASCII) | chunk*
//! "LIST" payload := ListType (4 ASCII) | chunk*
//! ```
//!
//! Sizes are little-endian, except in `RIFX` files where they are big-endian.
//! Inside a `LIST INFO` chunk every sub-chunk holds a zero-terminated string.

use super::{check_nesting, Decoder};
use crate::cursor::Cursor;
use crate::error::Result;
use crate::region::{Endian, Region, ValueDefinition};
use crate::registry::ParsingOptions;
use crate::text::TextEncoding;
use bytes::Bytes;
use tracing::{debug, trace, warn};

const CHUNK_HEADER: usize = 8;

const WAVE_FORMATS: ValueDefinition = &[
    (0x0001, "PCM"),
    (0x0002, "Microsoft ADPCM"),
    (0x0003, "IEEE float"),
    (0x0006, "A-law"),
    (0x0007, "mu-law"),
    (0x0011, "IMA ADPCM"),
    (0x0055, "MPEG Layer 3"),
    (0xFFFE, "Extensible"),
];

/// Decoder for RIFF and RIFX containers
#[derive(Debug, Clone, Copy, Default)]
pub struct RiffDecoder;

impl Decoder for RiffDecoder {
    fn id(&self) -> &'static str {
        "riff"
    }

    fn name(&self) -> &'static str {
        "RIFF (WAVE / AVI / ANI)"
    }

    fn sniff(&self, _filename: &str, extension: &str, buffer: &[u8]) -> bool {
        matches!(extension, "wav" | "ani" | "avi")
            || (buffer.len() >= 12 && (buffer.starts_with(b"RIFF") || buffer.starts_with(b"RIFX")))
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer);
        c.set_encoding(TextEncoding::Ascii);
        if c.check_bytes(0, b"RIFX") {
            debug!("Big-endian RIFX container");
            c.set_endian(Endian::Big);
        }
        parse_chunks(&mut c, &Scope::default())
    }
}

/// What the enclosing chunks say about the chunks being walked
#[derive(Debug, Clone, Default)]
struct Scope {
    form_type: String,
    in_info_list: bool,
    depth: usize,
}

fn parse_chunks(c: &mut Cursor<'_>, scope: &Scope) -> Result<Vec<Region>> {
    check_nesting(scope.depth, c.position(), "RIFF chunk")?;
    let mut chunks = Vec::new();
    while c.remaining() >= CHUNK_HEADER {
        chunks.push(parse_chunk(c, scope)?);
    }
    if !c.is_at_end() {
        chunks.push(c.rest("trailing")?);
    }
    Ok(chunks)
}

fn parse_chunk(c: &mut Cursor<'_>, scope: &Scope) -> Result<Region> {
    let fourcc = c.string(4, "FourCC")?.with_description("RIFF FourCC tag");
    let tag = c.text("FourCC")?.trim_end().to_string();
    let size = c.size(4, "Size")?.with_description("RIFF chunk size");
    let declared = c.len_of("Size")?;

    let body = c.position();
    let available = c.remaining();
    if declared > available {
        warn!(
            "RIFF chunk '{}' at {} declares {} bytes, only {} remain",
            tag,
            fourcc.start,
            declared,
            available
        );
    }
    let body_len = declared.min(available);
    trace!("RIFF chunk '{}' [{}..{})", tag, body, body + body_len);

    let mut fields = vec![fourcc, size];
    let mut sub = c.fork(body, body_len);
    match parse_content(&mut sub, &tag, scope) {
        Ok(content) => fields.extend(content),
        Err(e) if e.is_recoverable() => {
            warn!("RIFF chunk '{}' payload not decoded: {}", tag, e);
            fields.push(c.fork(body, body_len).rest("data")?);
        }
        Err(e) => return Err(e),
    }

    c.at(body + body_len);
    if declared % 2 == 1 && !c.is_at_end() {
        fields.push(c.read_general(1, "Padding")?.with_description("pad byte to even size"));
    }
    Ok(c.compound("Chunk", fields).with_text(tag))
}

fn parse_content(c: &mut Cursor<'_>, tag: &str, scope: &Scope) -> Result<Vec<Region>> {
    match tag {
        "RIFF" | "RIFX" => {
            let form = c.string(4, "FormType")?;
            let inner = Scope {
                form_type: c.text("FormType")?.trim_end().to_string(),
                in_info_list: false,
                depth: scope.depth + 1,
            };
            debug!("RIFF form type '{}'", inner.form_type);
            let mut regions = vec![form];
            regions.extend(parse_chunks(c, &inner)?);
            Ok(regions)
        }
        "LIST" => {
            let name = c.string(4, "ListName")?;
            let inner = Scope {
                form_type: scope.form_type.clone(),
                in_info_list: c.text("ListName")? == "INFO",
                depth: scope.depth + 1,
            };
            let mut regions = vec![name];
            regions.extend(parse_chunks(c, &inner)?);
            Ok(regions)
        }
        "fmt" if scope.form_type == "WAVE" => parse_wave_format(c),
        _ if scope.in_info_list => Ok(vec![c.padded_string(c.remaining(), "Text")?]),
        _ => Ok(vec![c.rest("data")?]),
    }
}

/// `WAVEFORMATEX`, optionally followed by the `WAVEFORMATEXTENSIBLE` tail
fn parse_wave_format(c: &mut Cursor<'_>) -> Result<Vec<Region>> {
    let mut fields = vec![
        c.enumerated(2, "formatTag", WAVE_FORMATS)?,
        c.number(2, "channels")?,
        c.number(4, "samplesPerSecond")?,
        c.number(4, "avgBytesPerSecond")?,
        c.number(2, "blockAlign")?,
        c.number(2, "bitsPerSample")?,
    ];
    if c.remaining() >= 2 {
        fields.push(c.size(2, "cbSize")?.with_description("size of the extension"));
        let extension = c.len_of("cbSize")?;
        if c.num("formatTag")? == 0xFFFE && extension >= 22 {
            fields.push(c.number(2, "validBitsPerSample")?);
            fields.push(c.number(4, "channelMask")?);
            fields.push(c.read_general(16, "subFormat")?.with_description("format GUID"));
        } else if extension > 0 {
            fields.push(c.general_clamped(extension, "extension")?);
        }
    }
    if !c.is_at_end() {
        fields.push(c.rest("unknown")?);
    }
    Ok(fields)
}
