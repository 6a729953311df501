//! Format decoders.
//!
//! Every decoder follows the same conventions:
//!
//! * **Sniff, never fail** - [`Decoder::sniff`] looks at the extension
//!   and/or magic bytes and returns `false` on any doubt.
//! * **One cursor per call** - `parse` builds a fresh [`crate::Cursor`] over
//!   the buffer, so decodes of independent buffers share no state.
//! * **Permissive** - malformed input is segmented as far as possible.
//!   Optional sub-tables that fail degrade to an opaque region instead of
//!   failing the file.
//!
//! ## Format overview
//!
//! | Module       | Format        | Shape |
//! |--------------|---------------|-------|
//! | [`ico`]      | ICO / CUR     | Fixed directory of image entries |
//! | [`zip`]      | ZIP / ZIP64   | Tail-located central directory, lazy record tables |
//! | [`pe`]       | PE / COFF     | Header tables, sections, RVA-addressed directories |
//! | [`riff`]     | RIFF / WAVE   | FourCC chunks with nested lists |
//! | [`ttf`]      | TrueType      | Offset table and table directory |
//! | [`mp3`]      | MP3 / ID3     | ID3v2 frames, audio, ID3v1 trailer |
//! | [`mp4`]      | ISO-BMFF      | Size/type boxes with large-size escape |
//! | [`asn1`]     | ASN.1 BER/DER | Recursive tag-length-value |
//! | [`png`]      | PNG           | Length/type/data/CRC chunks |
//! | [`jpeg`]     | JPEG          | Marker segments and entropy-coded scans |
//! | [`gzip`]     | GZIP          | Flag-driven header, deflate body, trailer |
//! | [`protobuf`] | Protobuf wire | Schema-less field decode |

pub mod asn1;
pub mod gzip;
pub mod ico;
pub mod jpeg;
pub mod mp3;
pub mod mp4;
pub mod pe;
pub mod png;
pub mod protobuf;
pub mod riff;
pub mod ttf;
pub mod zip;

use crate::error::{Error, Result};
use crate::region::Region;
use crate::registry::{OptionDef, ParsingOptions};
use bytes::Bytes;

/// Contract every format plugin implements
///
/// # Example
///
/// ```
/// use binscope_core::{Decoder, ParsingOptions, Region, RegionKind, Result};
/// use bytes::Bytes;
///
/// struct Raw;
///
/// impl Decoder for Raw {
///     fn id(&self) -> &'static str { "raw" }
///     fn name(&self) -> &'static str { "Raw bytes" }
///     fn sniff(&self, _: &str, ext: &str, _: &[u8]) -> bool { ext == "raw" }
///     fn parse(&self, buffer: &Bytes, _: &ParsingOptions) -> Result<Vec<Region>> {
///         Ok(vec![Region::new("data", RegionKind::General, 0, buffer.len())])
///     }
/// }
/// ```
pub trait Decoder: Send + Sync {
    /// Stable format id used for forcing and options
    fn id(&self) -> &'static str;

    /// Human-readable format name
    fn name(&self) -> &'static str;

    /// Returns true if this decoder should handle the file
    fn sniff(&self, filename: &str, extension: &str, buffer: &[u8]) -> bool;

    /// Decodes the whole buffer into top-level regions
    fn parse(&self, buffer: &Bytes, options: &ParsingOptions) -> Result<Vec<Region>>;

    /// Options this decoder understands
    fn parsing_options(&self) -> Vec<OptionDef> {
        Vec::new()
    }
}

/// All built-in decoders in sniffing order
pub fn builtin() -> Vec<Box<dyn Decoder>> {
    vec![
        Box::new(ico::IcoDecoder),
        Box::new(zip::ZipDecoder),
        Box::new(pe::PeDecoder),
        Box::new(riff::RiffDecoder),
        Box::new(ttf::TtfDecoder),
        Box::new(mp3::Mp3Decoder),
        Box::new(mp4::Mp4Decoder),
        Box::new(asn1::Asn1Decoder),
        Box::new(png::PngDecoder),
        Box::new(jpeg::JpegDecoder),
        Box::new(gzip::GzipDecoder),
        Box::new(protobuf::ProtobufDecoder),
    ]
}

/// Returns true if `buffer` starts with `magic`
pub(crate) fn starts_with(buffer: &[u8], magic: &[u8]) -> bool {
    buffer.get(..magic.len()) == Some(magic)
}

/// Deepest container nesting a recursive decoder walks into
pub(crate) const MAX_NESTING: usize = 64;

/// Fails with [`Error::UnsupportedConstruct`] once `depth` reaches
/// [`MAX_NESTING`], so that the caller keeps the nested bytes opaque
pub(crate) fn check_nesting(depth: usize, offset: usize, what: &str) -> Result<()> {
    if depth >= MAX_NESTING {
        return Err(Error::unsupported(
            offset,
            format!("{what} nested deeper than {MAX_NESTING} levels"),
        ));
    }
    Ok(())
}
