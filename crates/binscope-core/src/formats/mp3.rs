//! MP3 files with ID3 tags.
//!
//! ## Layout
//! ```text
//! [0x00] "ID3"           ID3v2 tag header (10 bytes)
//!        major, revision, flags, size (4 × 7-bit syncsafe)
//!        [extended header]
//!        frame*          id | size | flags | content
//!        [padding]
//!        audio frames
//! [-128] "TAG"           ID3v1 trailer (optional)
//! ```
//!
//! Frame headers depend on the tag version: v2.2 uses 3-byte ids and sizes
//! without flags, v2.3 plain 32-bit sizes, v2.4 syncsafe sizes.

use super::{starts_with, Decoder};
use crate::cursor::{Cursor, MemoValue};
use crate::error::{Error, Result};
use crate::region::{Endian, FlagDef, NumericValue, Region, RegionKind, ValueDefinition};
use crate::registry::ParsingOptions;
use crate::text::TextEncoding;
use bytes::Bytes;
use tracing::{debug, trace, warn};

const ID3V2_MAGIC: &[u8] = b"ID3";
const ID3V1_MAGIC: &[u8] = b"TAG";
const ID3V1_SIZE: usize = 128;
const HEADER_SIZE: usize = 10;

const TAG_FLAGS: &[FlagDef] = &[
    FlagDef::bit(7, "Unsynchronisation", "unsynchronisation applied to all frames"),
    FlagDef::bit(6, "ExtendedHeader", "an extended header follows"),
    FlagDef::bit(5, "Experimental", "tag is experimental"),
    FlagDef::bit(4, "Footer", "a footer is present"),
];

const FRAME_FLAGS_V3: &[FlagDef] = &[
    FlagDef::bit(15, "TagAlterPreservation", "discard frame if the tag is altered"),
    FlagDef::bit(14, "FileAlterPreservation", "discard frame if the file is altered"),
    FlagDef::bit(13, "ReadOnly", "frame is read only"),
    FlagDef::bit(7, "Compression", "frame is zlib compressed"),
    FlagDef::bit(6, "Encryption", "frame is encrypted"),
    FlagDef::bit(5, "GroupingIdentity", "frame belongs to a group"),
];

const FRAME_FLAGS_V4: &[FlagDef] = &[
    FlagDef::bit(14, "TagAlterPreservation", "discard frame if the tag is altered"),
    FlagDef::bit(13, "FileAlterPreservation", "discard frame if the file is altered"),
    FlagDef::bit(12, "ReadOnly", "frame is read only"),
    FlagDef::bit(6, "GroupingIdentity", "frame belongs to a group"),
    FlagDef::bit(3, "Compression", "frame is zlib compressed"),
    FlagDef::bit(2, "Encryption", "frame is encrypted"),
    FlagDef::bit(1, "Unsynchronisation", "frame is unsynchronised"),
    FlagDef::bit(0, "DataLengthIndicator", "a data length indicator is present"),
];

const TEXT_ENCODINGS: ValueDefinition = &[
    (0, "iso-8859-1"),
    (1, "utf-16 with BOM"),
    (2, "utf-16be"),
    (3, "utf-8"),
];

/// Decoder for `.mp3` files
#[derive(Debug, Clone, Copy, Default)]
pub struct Mp3Decoder;

impl Decoder for Mp3Decoder {
    fn id(&self) -> &'static str {
        "mp3"
    }

    fn name(&self) -> &'static str {
        "MP3 / ID3"
    }

    fn sniff(&self, _filename: &str, extension: &str, buffer: &[u8]) -> bool {
        extension == "mp3" || starts_with(buffer, ID3V2_MAGIC)
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer).with_endian(Endian::Big);
        c.set_encoding(TextEncoding::Latin1);

        let mut regions = Vec::new();
        if c.check_bytes(0, ID3V2_MAGIC) {
            regions.push(parse_id3v2(&mut c)?);
        }

        let trailer = buffer
            .len()
            .checked_sub(ID3V1_SIZE)
            .filter(|&at| at >= c.position() && c.check_bytes(at, ID3V1_MAGIC));
        let audio_end = trailer.unwrap_or(buffer.len());
        if audio_end > c.position() {
            regions.push(c.read_general(audio_end - c.position(), "AudioData")?);
        }
        if let Some(at) = trailer {
            regions.push(parse_id3v1(c.at(at))?);
        }
        Ok(regions)
    }
}

/// Reads a 4-byte syncsafe integer (7 bits per byte)
fn syncsafe(c: &mut Cursor<'_>, id: &str) -> Result<Region> {
    let mut region = c.read_number(RegionKind::Size, false, 4, id)?;
    let raw = c.num(id)?;
    let value = ((raw >> 3) & 0x0FE0_0000)
        | ((raw >> 2) & 0x001F_C000)
        | ((raw >> 1) & 0x0000_3F80)
        | (raw & 0x7F);
    let value = NumericValue::Unsigned(u128::from(value));
    region.numeric_value = Some(value);
    region.description = "syncsafe integer".to_string();
    c.remember(id, MemoValue::Number(value));
    Ok(region)
}

fn parse_id3v2(c: &mut Cursor<'_>) -> Result<Region> {
    let header = vec![
        c.magic(ID3V2_MAGIC, "FileID")?,
        c.number(1, "MajorVersion")?,
        c.number(1, "RevisionNumber")?,
        c.flags(1, "Flags", TAG_FLAGS)?,
        syncsafe(c, "TagSize")?,
    ];
    let version = c.num("MajorVersion")?;
    let flags = c.num("Flags")?;
    let mut tag_end = HEADER_SIZE + c.len_of("TagSize")?;
    if flags & 0x10 != 0 {
        tag_end += HEADER_SIZE;
    }
    if tag_end > c.limit() {
        warn!("ID3v2 tag of {} bytes runs past the end", tag_end);
        tag_end = c.limit();
    }
    debug!("ID3v2.{} tag [0..{})", version, tag_end);

    let mut fields = vec![c.compound("TagHeader", header)];
    let mut body = c.fork(HEADER_SIZE, tag_end - HEADER_SIZE);
    if flags & 0x40 != 0 && version >= 3 {
        fields.push(parse_extended_header(&mut body, version)?);
    }
    if matches!(version, 2..=4) {
        fields.extend(parse_frames(&mut body, version)?);
    } else {
        warn!("Unknown ID3v2 major version {}", version);
        if !body.is_at_end() {
            fields.push(body.rest("Frames")?);
        }
    }
    c.at(tag_end);
    Ok(c.compound("ID3v2", fields)
        .with_description(format!("ID3v2.{version} tag")))
}

fn parse_extended_header(c: &mut Cursor<'_>, version: u64) -> Result<Region> {
    let start = c.position();
    let (size, len) = if version == 4 {
        // v2.4 counts the size field itself
        let size = syncsafe(c, "ExtendedHeaderSize")?;
        (size, c.len_of("ExtendedHeaderSize")?.saturating_sub(4))
    } else {
        let size = c.size(4, "ExtendedHeaderSize")?;
        (size, c.len_of("ExtendedHeaderSize")?)
    };
    let rest = c.general_clamped(len, "ExtendedHeaderData")?;
    trace!("ID3v2 extended header at {}", start);
    Ok(c.compound("ExtendedHeader", vec![size, rest]))
}

fn parse_frames(c: &mut Cursor<'_>, version: u64) -> Result<Vec<Region>> {
    let (id_len, header_len) = if version == 2 { (3, 6) } else { (4, 10) };
    let mut frames = Vec::new();
    while c.remaining() >= header_len {
        if c.peek_u8(c.position())? == 0 {
            frames.push(c.rest("Padding")?);
            break;
        }

        let mut header = vec![c.string(id_len, "ID")?];
        let id = c.text("ID")?.to_string();
        header.push(match version {
            4 => syncsafe(c, "Size")?,
            _ => c.size(id_len, "Size")?,
        });
        match version {
            3 => header.push(c.flags(2, "Flags", FRAME_FLAGS_V3)?),
            4 => header.push(c.flags(2, "Flags", FRAME_FLAGS_V4)?),
            _ => {}
        }

        let declared = c.len_of("Size")?;
        let body = c.position();
        let body_len = declared.min(c.remaining());
        trace!("ID3 frame '{}' [{}..{})", id, body, body + body_len);

        let mut fields = header;
        let mut summary = None;
        if body_len > 0 {
            match parse_frame_content(&mut c.fork(body, body_len), &id) {
                Ok((content, text)) => {
                    fields.extend(content);
                    summary = text;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("ID3 frame '{}' not decoded: {}", id, e);
                    fields.push(c.fork(body, body_len).rest("Content")?);
                }
                Err(e) => return Err(e),
            }
        }
        c.at(body + body_len);

        let mut frame = c.compound("Frame", fields).with_text(id.clone());
        if let Some(text) = summary {
            frame.interpreted_value = Some(format!("{id} {text}"));
        }
        frames.push(frame);
    }
    if !c.is_at_end() {
        frames.push(c.rest("Padding")?);
    }
    Ok(frames)
}

type FrameContent = (Vec<Region>, Option<String>);

fn parse_frame_content(c: &mut Cursor<'_>, id: &str) -> Result<FrameContent> {
    let mut regions = Vec::new();
    let text = match id {
        "TXXX" | "TXX" => {
            let encoding = text_encoding(c, &mut regions)?;
            let description = encoded_text(c, &mut regions, "Description", encoding, true)?;
            let value = encoded_text(c, &mut regions, "Value", encoding, false)?;
            Some(format!("{description}: {value}"))
        }
        _ if id.starts_with('T') => {
            let encoding = text_encoding(c, &mut regions)?;
            Some(encoded_text(c, &mut regions, "Text", encoding, false)?)
        }
        "COMM" | "COM" => {
            let encoding = text_encoding(c, &mut regions)?;
            regions.push(c.string(3, "Language")?);
            encoded_text(c, &mut regions, "Description", encoding, true)?;
            Some(encoded_text(c, &mut regions, "Text", encoding, false)?)
        }
        "APIC" => {
            let encoding = text_encoding(c, &mut regions)?;
            regions.push(c.zstring_with("MimeType", TextEncoding::Latin1)?);
            regions.push(c.number(1, "PictureType")?);
            encoded_text(c, &mut regions, "Description", encoding, true)?;
            let mime = c.text("MimeType")?.to_string();
            regions.push(c.rest("PictureData")?);
            Some(mime)
        }
        _ => {
            regions.push(c.rest("Content")?);
            None
        }
    };
    Ok((regions, text))
}

/// The encoding byte that opens text frames. `None` stands for UTF-16 whose
/// byte order comes from a BOM in front of each string.
fn text_encoding(c: &mut Cursor<'_>, regions: &mut Vec<Region>) -> Result<Option<TextEncoding>> {
    regions.push(c.enumerated(1, "Encoding", TEXT_ENCODINGS)?);
    match c.num("Encoding")? {
        0 => Ok(Some(TextEncoding::Latin1)),
        1 => Ok(None),
        2 => Ok(Some(TextEncoding::Utf16Be)),
        3 => Ok(Some(TextEncoding::Utf8)),
        n => Err(Error::unsupported(
            c.position() - 1,
            format!("ID3 text encoding {n}"),
        )),
    }
}

fn encoded_text(
    c: &mut Cursor<'_>,
    regions: &mut Vec<Region>,
    id: &str,
    encoding: Option<TextEncoding>,
    terminated: bool,
) -> Result<String> {
    let encoding = match encoding {
        Some(e) => e,
        None => {
            let pos = c.position();
            if c.check_bytes(pos, &[0xFE, 0xFF]) {
                regions.push(c.read_general(2, "BOM")?);
                TextEncoding::Utf16Be
            } else {
                if c.check_bytes(pos, &[0xFF, 0xFE]) {
                    regions.push(c.read_general(2, "BOM")?);
                }
                TextEncoding::Utf16Le
            }
        }
    };
    let region = if terminated {
        c.zstring_with(id, encoding)?
    } else {
        c.read_string(c.remaining(), id, encoding, true)?
    };
    let text = region.text().unwrap_or_default().to_string();
    regions.push(region);
    Ok(text)
}

fn parse_id3v1(c: &mut Cursor<'_>) -> Result<Region> {
    let mut fields = vec![
        c.magic(ID3V1_MAGIC, "Identifier")?,
        c.padded_string(30, "Title")?,
        c.padded_string(30, "Artist")?,
        c.padded_string(30, "Album")?,
        c.padded_string(4, "Year")?,
    ];
    let comment = c.position();
    // ID3v1.1 keeps the track number in the last two comment bytes
    if c.peek_u8(comment + 28)? == 0 && c.peek_u8(comment + 29)? != 0 {
        fields.push(c.padded_string(28, "Comment")?);
        fields.push(c.read_general(1, "Zero")?);
        fields.push(c.number(1, "Track")?);
    } else {
        fields.push(c.padded_string(30, "Comment")?);
    }
    fields.push(c.number(1, "Genre")?);
    Ok(c.compound("ID3v1", fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assert_well_formed, find_deep};
    use pretty_assertions::assert_eq;

    fn frame(id: &[u8; 4], content: &[u8]) -> Vec<u8> {
        let mut out = id.to_vec();
        out.extend_from_slice(&(content.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(content);
        out
    }

    fn id3v1() -> Vec<u8> {
        let mut t = b"TAG".to_vec();
        let mut field = |s: &[u8], n: usize| {
            let mut f = s.to_vec();
            f.resize(n, 0);
            t.extend(f);
        };
        field(b"Title", 30);
        field(b"Artist", 30);
        field(b"Album", 30);
        field(b"1999", 4);
        field(b"nice", 28);
        t.extend_from_slice(&[0, 7, 13]);
        t
    }

    fn song() -> Vec<u8> {
        let mut frames = frame(b"TIT2", b"\0Hello");
        frames.extend(frame(
            b"TXXX",
            &[1, 0xFF, 0xFE, b'k', 0, 0, 0, 0xFF, 0xFE, b'v', 0],
        ));
        frames.extend_from_slice(&[0; 5]);

        let mut data = b"ID3\x03\x00\x00".to_vec();
        data.extend_from_slice(&[0, 0, 0, frames.len() as u8]);
        data.extend(frames);
        data.extend_from_slice(&[0xFF, 0xFB, 0x90, 0x00]);
        data.extend(id3v1());
        data
    }

    #[test]
    fn test_tag_audio_and_trailer() {
        let data = Bytes::from(song());
        let regions = Mp3Decoder.parse(&data, &ParsingOptions::new()).unwrap();
        assert_well_formed(&regions, data.len());

        let ids: Vec<_> = regions.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["ID3v2", "AudioData", "ID3v1"]);
        assert_eq!(regions[0].end, 52);
        assert_eq!(regions[1].len(), 4);
        assert_eq!(regions[2].len(), ID3V1_SIZE);

        let size = find_deep(&regions, "TagSize").unwrap();
        assert_eq!(size.num(), Some(42));
    }

    #[test]
    fn test_text_frames() {
        let data = Bytes::from(song());
        let regions = Mp3Decoder.parse(&data, &ParsingOptions::new()).unwrap();
        let frames: Vec<_> = regions[0]
            .eager_children()
            .iter()
            .filter(|r| r.id == "Frame")
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].interpreted_value.as_deref(), Some("TIT2 Hello"));
        assert_eq!(frames[1].interpreted_value.as_deref(), Some("TXXX k: v"));
        assert!(frames[1].child("BOM").is_some());
        assert!(regions[0].child("Padding").is_some());
    }

    #[test]
    fn test_id3v1_track() {
        let data = Bytes::from(song());
        let regions = Mp3Decoder.parse(&data, &ParsingOptions::new()).unwrap();
        let v1 = &regions[2];
        assert_eq!(v1.child("Title").unwrap().text(), Some("Title"));
        assert_eq!(v1.child("Comment").unwrap().text(), Some("nice"));
        assert_eq!(v1.child("Track").unwrap().num(), Some(7));
        assert_eq!(v1.child("Genre").unwrap().num(), Some(13));
    }

    #[test]
    fn test_syncsafe_decoding() {
        let data = [0x00, 0x00, 0x02, 0x01];
        let mut c = Cursor::new(&data).with_endian(Endian::Big);
        let r = syncsafe(&mut c, "size").unwrap();
        assert_eq!(r.num(), Some(257));
        assert_eq!(c.num("size").unwrap(), 257);
    }

    #[test]
    fn test_plain_audio_without_tags() {
        let data = Bytes::from_static(&[0xFF, 0xFB, 0x90, 0x00, 0x11]);
        let regions = Mp3Decoder.parse(&data, &ParsingOptions::new()).unwrap();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].id, "AudioData");
    }
}
