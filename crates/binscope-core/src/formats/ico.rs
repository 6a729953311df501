//! ICO / CUR - Windows icon and cursor resources.
//!
//! ## Layout
//! ```text
//! [0x00] Reserved        (u16 LE, 0)
//! [0x02] Type            (u16 LE, 1 = icon, 2 = cursor)
//! [0x04] Count           (u16 LE)
//! [0x06] Directory       (Count × 16 bytes)
//!        ... image data at the offsets named by each entry
//! ```
//!
//! ## Directory entry (16 bytes)
//! ```text
//! [0x00] Width           (u8, 0 means 256)
//! [0x01] Height          (u8, 0 means 256)
//! [0x02] PaletteColors   (u8)
//! [0x03] Reserved        (u8)
//! [0x04] Planes / HotspotX
//! [0x06] BitCount / HotspotY
//! [0x08] Size            (u32 LE)
//! [0x0C] Offset          (u32 LE)
//! ```

use super::Decoder;
use crate::cursor::{Cursor, MemoValue};
use crate::error::Result;
use crate::region::{NumericValue, Region};
use crate::registry::ParsingOptions;
use bytes::Bytes;
use tracing::{debug, warn};

const ICON_SIGNATURE: &[u8] = &[0, 0, 1, 0];
const CURSOR_SIGNATURE: &[u8] = &[0, 0, 2, 0];
const ENTRY_SIZE: usize = 16;

/// Decoder for `.ico` and `.cur` files
#[derive(Debug, Clone, Copy, Default)]
pub struct IcoDecoder;

impl Decoder for IcoDecoder {
    fn id(&self) -> &'static str {
        "ico"
    }

    fn name(&self) -> &'static str {
        "Windows icon / cursor"
    }

    fn sniff(&self, _filename: &str, extension: &str, _buffer: &[u8]) -> bool {
        matches!(extension, "ico" | "cur")
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer);
        let is_cursor = c.check_bytes(0, CURSOR_SIGNATURE);
        let signature = if is_cursor {
            c.magic(CURSOR_SIGNATURE, "signature")?
                .with_description("CUR file signature (00 00 02 00)")
        } else {
            c.magic(ICON_SIGNATURE, "signature")?
                .with_description("ICO file signature (00 00 01 00)")
        };
        let image_size = c
            .size(2, "imageSize")?
            .with_description("number of images the file contains");
        let count = c.len_of("imageSize")?;
        debug!("ICO with {} images (cursor: {})", count, is_cursor);

        let mut directories = Vec::with_capacity(count);
        let mut images = Vec::with_capacity(count);
        for i in 0..count {
            c.at(6 + ENTRY_SIZE * i);
            directories.push(parse_entry(&mut c, is_cursor)?);

            let (offset, size) = (c.len_of("offset")?, c.len_of("size")?);
            if offset > buffer.len() {
                warn!("ICO image {} starts past the end of the file", i);
                continue;
            }
            images.push(c.at(offset).general_clamped(size, "image")?);
        }

        let directories = Region::compound("iconDirectories", 6, directories);
        let images = Region::compound("images", directories.end, images);
        Ok(vec![signature, image_size, directories, images])
    }
}

fn parse_entry(c: &mut Cursor<'_>, is_cursor: bool) -> Result<Region> {
    let width = full_size(c, "width", "image width in pixels")?;
    let height = full_size(c, "height", "image height in pixels")?;
    let mut fields = vec![
        width,
        height,
        c.number(1, "paletteNumber")?
            .with_description("number of colors in the color palette"),
        c.number(1, "reserved")?.with_description("should be 0"),
    ];
    if is_cursor {
        fields.push(c.number(2, "hotspotX")?.with_description("horizontal hotspot in pixels"));
        fields.push(c.number(2, "hotspotY")?.with_description("vertical hotspot in pixels"));
    } else {
        fields.push(c.number(2, "planes")?.with_description("color planes"));
        fields.push(c.number(2, "bits")?.with_description("bits per pixel"));
    }
    fields.push(c.size(4, "size")?.with_description("image size in bytes"));
    fields.push(c.offset(4, "offset")?.with_description("offset of the image data"));

    let description = if is_cursor {
        format!("{}x{} cursor", c.num("width")?, c.num("height")?)
    } else {
        format!("{}x{} {} bits", c.num("width")?, c.num("height")?, c.num("bits")?)
    };
    Ok(c.compound("iconDirectory", fields).with_description(description))
}

/// One-byte dimension where 0 stands for 256
fn full_size(c: &mut Cursor<'_>, id: &str, description: &str) -> Result<Region> {
    let mut region = c.number(1, id)?.with_description(description);
    if region.num() == Some(0) {
        let value = NumericValue::Unsigned(256);
        region.numeric_value = Some(value);
        region.interpreted_value = Some("256".to_string());
        c.remember(id, MemoValue::Number(value));
    }
    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assert_well_formed, find_all};

    fn entry(width: u8, height: u8, bits: u16, size: u32, offset: u32) -> Vec<u8> {
        let mut e = vec![width, height, 0, 0];
        e.extend_from_slice(&1u16.to_le_bytes());
        e.extend_from_slice(&bits.to_le_bytes());
        e.extend_from_slice(&size.to_le_bytes());
        e.extend_from_slice(&offset.to_le_bytes());
        e
    }

    fn two_icon_file() -> Vec<u8> {
        let mut data = vec![0, 0, 1, 0, 2, 0];
        // images start after the 6-byte header and two 16-byte entries
        data.extend(entry(16, 16, 32, 4, 38));
        data.extend(entry(0, 0, 8, 2, 42));
        data.extend([0xAA; 4]);
        data.extend([0xBB; 2]);
        data
    }

    #[test]
    fn test_two_entry_icon() {
        let data = Bytes::from(two_icon_file());
        let regions = IcoDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        assert_well_formed(&regions, data.len());

        let sizes = find_all(&regions, "imageSize");
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].num(), Some(2));

        let dirs = find_all(&regions, "iconDirectories")[0];
        let entries: Vec<_> = dirs
            .eager_children()
            .iter()
            .filter(|r| r.id == "iconDirectory")
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].child("width").unwrap().num(), Some(16));
        assert_eq!(entries[1].child("width").unwrap().num(), Some(256));
        assert_eq!(entries[1].child("height").unwrap().num(), Some(256));
        assert_eq!(entries[1].description, "256x256 8 bits");

        let images = find_all(&regions, "images")[0];
        let spans: Vec<_> = images
            .eager_children()
            .iter()
            .map(|r| (r.start, r.end))
            .collect();
        assert_eq!(spans, vec![(38, 42), (42, 44)]);
    }

    #[test]
    fn test_cursor_hotspots() {
        let mut data = vec![0, 0, 2, 0, 1, 0];
        data.extend(entry(32, 32, 7, 0, 22));
        let data = Bytes::from(data);
        let regions = IcoDecoder.parse(&data, &ParsingOptions::new()).unwrap();
        let dir = &regions[2].eager_children()[0];
        assert_eq!(dir.child("hotspotY").unwrap().num(), Some(7));
        assert_eq!(dir.description, "32x32 cursor");
    }

    #[test]
    fn test_bad_signature() {
        let data = Bytes::from_static(&[1, 2, 3, 4, 0, 0]);
        assert!(IcoDecoder.parse(&data, &ParsingOptions::new()).is_err());
    }

    #[test]
    fn test_sniff() {
        assert!(IcoDecoder.sniff("favicon.ico", "ico", &[]));
        assert!(IcoDecoder.sniff("arrow.cur", "cur", &[]));
        assert!(!IcoDecoder.sniff("a.png", "png", &[]));
    }
}
