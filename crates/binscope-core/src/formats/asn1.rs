//! ASN.1 BER / DER encoded data.
//!
//! Every element is a tag-length-value triple:
//! ```text
//! Type    class (2 bits) | constructed (1 bit) | tag (5 bits)
//!         tag 31 = high tag number, continued in base-128 octets
//! Length  0xxxxxxx               short form
//!         1nnnnnnn + n octets    long form (big-endian)
//!         10000000               indefinite, closed by 00 00
//! Value   nested elements if constructed, raw octets otherwise
//! ```

use super::{check_nesting, Decoder};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::region::{Endian, FlagDef, NumericValue, Region, RegionKind};
use crate::registry::ParsingOptions;
use crate::text::TextEncoding;
use bytes::Bytes;
use tracing::{trace, warn};

const HIGH_TAG: u8 = 0x1F;
const INDEFINITE: u8 = 0x80;
const END_OF_CONTENTS: &[u8] = &[0x00, 0x00];
const MAX_LENGTH_OCTETS: usize = 8;

const IDENTIFIER: &[FlagDef] = &[
    FlagDef::field(6, 2, 0, "Universal", "universal class"),
    FlagDef::field(6, 2, 1, "Application", "application class"),
    FlagDef::field(6, 2, 2, "Context-specific", "context-specific class"),
    FlagDef::field(6, 2, 3, "Private", "private class"),
    FlagDef::bit(5, "Constructed", "value holds nested elements"),
];

const UNIVERSAL_TAGS: &[&str] = &[
    "EOC",
    "BOOLEAN",
    "INTEGER",
    "BIT STRING",
    "OCTET STRING",
    "NULL",
    "OBJECT IDENTIFIER",
    "ObjectDescriptor",
    "EXTERNAL",
    "REAL",
    "ENUMERATED",
    "EMBEDDED PDV",
    "UTF8String",
    "RELATIVE-OID",
    "TIME",
    "Reserved",
    "SEQUENCE",
    "SET",
    "NumericString",
    "PrintableString",
    "T61String",
    "VideotexString",
    "IA5String",
    "UTCTime",
    "GeneralizedTime",
    "GraphicString",
    "VisibleString",
    "GeneralString",
    "UniversalString",
    "CHARACTER STRING",
    "BMPString",
    "DATE",
    "TIME-OF-DAY",
    "DATE-TIME",
    "DURATION",
    "OID-IRI",
    "RELATIVE-OID-IRI",
];

/// Decoder for BER / DER files
#[derive(Debug, Clone, Copy, Default)]
pub struct Asn1Decoder;

impl Decoder for Asn1Decoder {
    fn id(&self) -> &'static str {
        "asn1"
    }

    fn name(&self) -> &'static str {
        "ASN.1 BER / DER"
    }

    fn sniff(&self, _filename: &str, extension: &str, _buffer: &[u8]) -> bool {
        matches!(
            extension,
            "ber" | "der" | "cer" | "crt" | "p7b" | "p7s" | "p12" | "pfx"
        )
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer).with_endian(Endian::Big);
        let mut elements = Vec::new();
        while !c.is_at_end() {
            elements.push(parse_element(&mut c, 0)?);
        }
        Ok(elements)
    }
}

/// Decoded identifier octets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Tag {
    class: u8,
    constructed: bool,
    number: u64,
}

impl Tag {
    fn name(&self) -> String {
        match self.class {
            0 => UNIVERSAL_TAGS
                .get(self.number as usize)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("UNIVERSAL {}", self.number)),
            1 => format!("[APPLICATION {}]", self.number),
            2 => format!("[{}]", self.number),
            _ => format!("[PRIVATE {}]", self.number),
        }
    }

    fn is_universal(&self, number: u64) -> bool {
        self.class == 0 && self.number == number
    }
}

/// Content length: a byte count, or `None` for the indefinite form
type Length = Option<usize>;

fn parse_element(c: &mut Cursor<'_>, depth: usize) -> Result<Region> {
    check_nesting(depth, c.position(), "ASN.1 element")?;
    let (tag, type_region) = parse_type(c)?;
    let (length, length_region) = parse_length(c)?;
    let name = tag.name();
    trace!("ASN.1 {} at {}", name, type_region.start);

    let value = match length {
        Some(len) => {
            let start = c.position();
            if len > c.remaining() {
                return Err(Error::malformed_length(
                    length_region.start,
                    format!("{name} declares {len} bytes, {} remain", c.remaining()),
                ));
            }
            let value = if tag.constructed {
                parse_constructed(&mut c.fork(start, len), start, depth)?
            } else {
                parse_primitive(c, tag, len)?
            };
            c.at(start + len);
            value
        }
        None => {
            if !tag.constructed {
                return Err(Error::malformed_length(
                    length_region.start,
                    format!("primitive {name} with indefinite length"),
                ));
            }
            parse_indefinite(c, depth)?
        }
    };

    Ok(c.compound("TLV", vec![type_region, length_region, value])
        .with_text(name))
}

fn parse_type(c: &mut Cursor<'_>) -> Result<(Tag, Region)> {
    let first = c.peek_u8(c.position())?;
    let identifier = c.flags(1, "Identifier", IDENTIFIER)?;
    let mut tag = Tag {
        class: first >> 6,
        constructed: first & 0x20 != 0,
        number: u64::from(first & HIGH_TAG),
    };

    let region = if tag.number == u64::from(HIGH_TAG) {
        let start = c.position();
        let mut number = 0u64;
        let mut end = start;
        loop {
            let octet = c.peek_u8(end)?;
            number = number
                .checked_mul(128)
                .ok_or_else(|| Error::unsupported(start, "tag number exceeds 64 bits"))?
                | u64::from(octet & 0x7F);
            end += 1;
            if octet & 0x80 == 0 {
                break;
            }
        }
        tag.number = number;
        let mut tag_number = Region::new("TagNumber", RegionKind::Number, start, end);
        tag_number.numeric_value = Some(NumericValue::Unsigned(u128::from(number)));
        c.at(end);
        c.compound("Type", vec![identifier, tag_number])
    } else {
        let mut identifier = identifier;
        identifier.id = "Type".to_string();
        identifier
    };
    Ok((tag, region.with_interpretation(tag.name())))
}

fn parse_length(c: &mut Cursor<'_>) -> Result<(Length, Region)> {
    let start = c.position();
    let first = c.peek_u8(start)?;

    if first == INDEFINITE {
        let region = c.size(1, "Length")?.with_interpretation("indefinite");
        return Ok((None, region));
    }
    if first < INDEFINITE {
        let region = c.size(1, "Length")?;
        return Ok((Some(usize::from(first)), region));
    }

    let count = usize::from(first & 0x7F);
    if count > MAX_LENGTH_OCTETS {
        return Err(Error::malformed_length(
            start,
            format!("{count} length octets"),
        ));
    }
    let value = c.peek_uint(start + 1, count)?;
    let len = usize::try_from(value)
        .map_err(|_| Error::malformed_length(start, format!("length {value}")))?;

    let mut region = Region::new("Length", RegionKind::Size, start, start + 1 + count);
    region.endian = Some(Endian::Big);
    region.numeric_value = Some(NumericValue::Unsigned(u128::from(value)));
    region.description = format!("long form, {count} octets");
    c.at(region.end);
    Ok((Some(len), region))
}

/// Nested elements of a definite-length constructed value
fn parse_constructed(c: &mut Cursor<'_>, start: usize, depth: usize) -> Result<Region> {
    let mut children = Vec::new();
    while !c.is_at_end() {
        let at = c.position();
        match parse_element(c, depth + 1) {
            Ok(child) => children.push(child),
            Err(e) if e.is_recoverable() => {
                warn!("ASN.1 nested element not decoded: {}", e);
                children.push(c.at(at).rest("Content")?);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Region::compound("Value", start, children))
}

/// Nested elements up to and including the end-of-contents marker
fn parse_indefinite(c: &mut Cursor<'_>, depth: usize) -> Result<Region> {
    let start = c.position();
    let mut children = Vec::new();
    loop {
        if c.is_at_end() {
            return Err(Error::malformed_length(
                start,
                "indefinite length without end-of-contents",
            ));
        }
        if c.check_bytes(c.position(), END_OF_CONTENTS) {
            children.push(c.read_general(2, "EndOfContents")?);
            break;
        }
        children.push(parse_element(c, depth + 1)?);
    }
    Ok(Region::compound("Value", start, children))
}

fn parse_primitive(c: &mut Cursor<'_>, tag: Tag, len: usize) -> Result<Region> {
    let start = c.position();
    let bytes = c.peek(start, len)?;
    let value = c.read_general(len, "Value")?;

    let interpreted = if tag.class != 0 {
        None
    } else {
        match tag.number {
            1 if len == 1 => Some(if bytes[0] == 0 { "FALSE" } else { "TRUE" }.to_string()),
            2 | 10 if (1..=16).contains(&len) => {
                let mut sub = c.fork(start, len);
                let n = sub.signed(len, "n")?.numeric_value;
                n.map(|n| n.to_string())
            }
            3 if !bytes.is_empty() => Some(format!("{} unused bits", bytes[0])),
            5 => Some("NULL".to_string()),
            6 => decode_oid(bytes),
            12 => Some(TextEncoding::Utf8.decode(bytes, false)),
            18 | 19 | 22 | 23 | 24 | 26 => Some(TextEncoding::Ascii.decode(bytes, false)),
            20 | 25 | 27 => Some(TextEncoding::Latin1.decode(bytes, false)),
            30 => Some(TextEncoding::Utf16Be.decode(bytes, false)),
            _ => None,
        }
    };

    let mut value = value;
    if tag.is_universal(4) || tag.is_universal(3) {
        value.description = format!("{len} bytes");
    }
    if let Some(text) = interpreted {
        value.interpreted_value = Some(text);
    }
    Ok(value)
}

/// Dotted form of an OBJECT IDENTIFIER
fn decode_oid(bytes: &[u8]) -> Option<String> {
    let mut arcs = Vec::new();
    let mut acc = 0u64;
    for &b in bytes {
        acc = acc.checked_mul(128)? | u64::from(b & 0x7F);
        if b & 0x80 == 0 {
            arcs.push(acc);
            acc = 0;
        }
    }
    let (&first, rest) = arcs.split_first()?;
    let (a, b) = match first {
        0..=39 => (0, first),
        40..=79 => (1, first - 40),
        _ => (2, first - 80),
    };
    let mut out = format!("{a}.{b}");
    for arc in rest {
        out.push('.');
        out.push_str(&arc.to_string());
    }
    Some(out)
}
