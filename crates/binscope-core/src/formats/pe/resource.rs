//! Resource directory tree.
//!
//! ```text
//! directory := header (16 bytes) | entry (8 bytes) × (named + id entries)
//! entry     := NameOrId (u32) | OffsetToData (u32)
//! ```
//! Offsets are relative to the start of the resource section. The high bit
//! of `NameOrId` selects a length-prefixed UTF-16 name; the high bit of
//! `OffsetToData` selects a subdirectory instead of a data entry. The three
//! levels are conventionally type, name and language.

use super::tables::{self, RESOURCE_TYPES};
use super::Image;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::region::Region;
use crate::text::TextEncoding;
use crate::time::TimeEpoch;
use tracing::trace;

const HIGH_BIT: u64 = 0x8000_0000;
const ENTRY_LEN: usize = 8;
const MAX_DEPTH: usize = 8;

pub(super) fn parse_resources(c: &mut Cursor<'_>, image: &Image) -> Result<Region> {
    let base = c.position();
    parse_directory(c, image, base, 0)
}

fn parse_directory(c: &mut Cursor<'_>, image: &Image, base: usize, depth: usize) -> Result<Region> {
    if depth >= MAX_DEPTH {
        return Err(Error::unsupported(
            c.position(),
            format!("resource tree deeper than {MAX_DEPTH} levels"),
        ));
    }
    let mut fields = vec![
        c.number(4, "Characteristics")?,
        c.time(4, "TimeDateStamp", TimeEpoch::Unix)?,
        c.number(2, "MajorVersion")?,
        c.number(2, "MinorVersion")?,
        c.size(2, "NumberOfNamedEntries")?,
        c.size(2, "NumberOfIdEntries")?,
    ];
    let count = c.len_of("NumberOfNamedEntries")? + c.len_of("NumberOfIdEntries")?;
    trace!("PE resource directory at {:#x}, level {}, {} entries", fields[0].start, depth, count);

    let entries_at = c.position();
    for i in 0..count {
        c.at(entries_at + i * ENTRY_LEN);
        fields.push(parse_entry(c, image, base, depth)?);
    }
    Ok(Region::compound("ResourceDirectory", entries_at, fields))
}

fn parse_entry(c: &mut Cursor<'_>, image: &Image, base: usize, depth: usize) -> Result<Region> {
    let mut fields = vec![c.number(4, "NameOrId")?, c.number(4, "OffsetToData")?];
    let name_or_id = c.num("NameOrId")?;
    let target = c.num("OffsetToData")?;

    let label = if name_or_id & HIGH_BIT != 0 {
        let mut sub = at(c, base, name_or_id)?;
        let name_at = sub.position();
        let mut name = vec![sub.size(2, "Length")?];
        let len = sub.len_of("Length")? * 2;
        name.push(sub.read_string(len, "Name", TextEncoding::Utf16Le, false)?);
        let text = sub.text("Name")?.to_string();
        fields.push(Region::compound("ResourceName", name_at, name).with_text(text.clone()));
        text
    } else if depth == 0 {
        tables::label(RESOURCE_TYPES, name_or_id)
            .map(str::to_string)
            .unwrap_or_else(|| name_or_id.to_string())
    } else {
        format!("#{name_or_id}")
    };

    let mut sub = at(c, base, target)?;
    if target & HIGH_BIT != 0 {
        fields.push(parse_directory(&mut sub, image, base, depth + 1)?);
    } else {
        fields.push(parse_data_entry(&mut sub, image)?);
    }
    Ok(Region::compound("ResourceEntry", fields[0].start, fields).with_text(label))
}

/// A cursor at `base` plus the low 31 bits of `offset`
fn at<'a>(c: &Cursor<'a>, base: usize, offset: u64) -> Result<Cursor<'a>> {
    let pos = base + (offset & !HIGH_BIT) as usize;
    if pos >= c.buffer().len() {
        return Err(Error::malformed_length(c.position(), format!("resource offset {offset:#x}")));
    }
    let mut sub = c.fork(0, c.buffer().len());
    sub.at(pos);
    Ok(sub)
}

fn parse_data_entry(c: &mut Cursor<'_>, image: &Image) -> Result<Region> {
    let mut fields = vec![
        c.offset(4, "DataRVA")?,
        c.size(4, "Size")?,
        c.number(4, "CodePage")?,
        c.number(4, "Reserved")?,
    ];
    let size = c.len_of("Size")?;
    if let Ok(mut data) = image.seek(c, c.num("DataRVA")?) {
        fields.push(data.general_clamped(size, "Data")?);
    }
    Ok(c.compound("ResourceDataEntry", fields))
}
