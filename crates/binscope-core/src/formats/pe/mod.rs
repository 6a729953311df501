//! PE/COFF executables and object files.
//!
//! ## Layout
//! ```text
//! [0x00]      DOS header ('MZ', e_lfanew at 0x3C)      only in images
//! [0x40]      DOS stub program
//! [e_lfanew]  'PE\0\0'
//!             COFF header (20 bytes)
//!             optional header (PE32 or PE32+, SizeOfOptionalHeader bytes)
//!               data directories (RVA, size) × NumberOfRvaAndSizes
//!             section headers (40 bytes × NumberOfSections)
//! [...]       raw section data
//! ```
//!
//! Data directories are addressed by RVA. An RVA is mapped to a file offset
//! through the section whose virtual range contains it:
//! `offset = rva - section.VirtualAddress + section.PointerToRawData`.
//! Each directory is decoded on its own; one that fails is kept as raw
//! bytes and the rest of the image is unaffected.

mod directories;
mod resource;
mod tables;

use super::{starts_with, Decoder};
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::region::Region;
use crate::registry::ParsingOptions;
use crate::text::TextEncoding;
use crate::time::TimeEpoch;
use bytes::Bytes;
use tables::*;
use tracing::{debug, trace, warn};

const MZ: &[u8] = b"MZ";
const PE_SIGNATURE: &[u8] = b"PE\0\0";

const DOS_HEADER_LEN: usize = 0x40;
const SECTION_HEADER_LEN: usize = 40;
const PE32_PLUS: u64 = 0x20B;

const EXPORT: usize = 0;
const IMPORT: usize = 1;
const RESOURCE: usize = 2;
/// The certificate table is addressed by file offset, not RVA
const CERTIFICATE: usize = 4;
const TLS: usize = 9;

/// Decoder for Windows executables, DLLs and drivers
#[derive(Debug, Clone, Copy, Default)]
pub struct PeDecoder;

impl Decoder for PeDecoder {
    fn id(&self) -> &'static str {
        "pe"
    }

    fn name(&self) -> &'static str {
        "Portable Executable (PE/COFF)"
    }

    fn sniff(&self, _filename: &str, extension: &str, buffer: &[u8]) -> bool {
        matches!(
            extension,
            "exe" | "dll" | "scr" | "sys" | "ocx" | "mui" | "efi" | "drv" | "cpl" | "acm" | "ax" | "tsp"
        ) || starts_with(buffer, MZ)
    }

    fn parse(&self, buffer: &Bytes, _options: &ParsingOptions) -> Result<Vec<Region>> {
        let mut c = Cursor::new(buffer);
        c.set_encoding(TextEncoding::Latin1);
        let mut regions = Vec::new();

        let mut coff_at = 0;
        if c.check_bytes(0, MZ) {
            regions.push(parse_dos_header(&mut c)?);
            let pe_at = c.len_of("e_lfanew")?;
            if pe_at > DOS_HEADER_LEN {
                regions.push(
                    c.at(DOS_HEADER_LEN)
                        .general_clamped(pe_at - DOS_HEADER_LEN, "DosStub")?
                        .with_description("MS-DOS stub program"),
                );
            }
            regions.push(c.at(pe_at).magic(PE_SIGNATURE, "PeSignature")?);
            coff_at = c.position();
        }

        regions.push(parse_coff(c.at(coff_at))?);
        let optional_at = c.position();
        let optional_len = c.len_of("SizeOfOptionalHeader")?;
        let section_count = c.len_of("NumberOfSections")?;
        debug!(
            "COFF header at {}: {} sections, {} byte optional header",
            coff_at, section_count, optional_len
        );

        let mut image = Image {
            len: buffer.len(),
            ..Image::default()
        };
        let mut directories = Vec::new();
        if optional_len > 0 {
            let mut sub = c.fork(optional_at, optional_len);
            match parse_optional_header(&mut sub, &mut image, &mut directories) {
                Ok(header) => regions.push(header),
                Err(e) if e.is_recoverable() => {
                    warn!("PE optional header not decoded: {}", e);
                    directories.clear();
                    regions.push(c.fork(optional_at, optional_len).rest("OptionalHeader")?);
                }
                Err(e) => return Err(e),
            }
        }

        let table_at = optional_at + optional_len;
        if section_count > 0 {
            c.at(table_at);
            match parse_section_headers(&mut c, section_count, &mut image.sections) {
                Ok(headers) => regions.push(Region::compound("SectionTable", table_at, headers)),
                Err(e) if e.is_recoverable() => {
                    warn!(
                        "PE section table degraded after {} of {} headers: {}",
                        image.sections.len(),
                        section_count,
                        e
                    );
                    regions.push(
                        c.fork(table_at, section_count * SECTION_HEADER_LEN)
                            .rest("SectionTable")?,
                    );
                }
                Err(e) => return Err(e),
            }
        }

        let data = section_data(&c, &image)?;
        if !data.is_empty() {
            regions.push(Region::compound("Sections", data[0].start, data));
        }

        let decoded: Vec<Region> = directories
            .iter()
            .filter_map(|dir| decode_directory(&c, &image, dir).transpose())
            .collect::<Result<_>>()?;
        if !decoded.is_empty() {
            regions.push(Region::compound("Directories", decoded[0].start, decoded));
        }
        Ok(regions)
    }
}

/// One section as far as address translation is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Section {
    pub(super) name: String,
    pub(super) virtual_address: u64,
    pub(super) virtual_size: u64,
    pub(super) raw_offset: u64,
    pub(super) raw_size: u64,
}

impl Section {
    fn contains(&self, rva: u64) -> bool {
        let size = if self.virtual_size == 0 {
            self.raw_size
        } else {
            self.virtual_size
        };
        rva >= self.virtual_address && rva - self.virtual_address < size
    }
}

/// Address-space facts the directory decoders need
#[derive(Debug, Clone, Default)]
pub(super) struct Image {
    pub(super) sections: Vec<Section>,
    pub(super) pe32_plus: bool,
    pub(super) image_base: u64,
    pub(super) len: usize,
}

impl Image {
    /// Maps an RVA to a file offset inside the buffer
    pub(super) fn offset_of(&self, rva: u64) -> Result<usize> {
        let section = self
            .sections
            .iter()
            .find(|s| s.contains(rva))
            .ok_or_else(|| Error::malformed_length(0, format!("RVA {rva:#x} is outside every section")))?;
        let offset = rva - section.virtual_address + section.raw_offset;
        usize::try_from(offset)
            .ok()
            .filter(|&o| o < self.len)
            .ok_or_else(|| {
                Error::malformed_length(0, format!("RVA {rva:#x} maps past the end of the file"))
            })
    }

    /// A cursor over the whole buffer positioned at `rva`
    pub(super) fn seek<'a>(&self, c: &Cursor<'a>, rva: u64) -> Result<Cursor<'a>> {
        let mut sub = c.fork(0, c.buffer().len());
        sub.at(self.offset_of(rva)?);
        Ok(sub)
    }

    /// Width of VA-sized fields
    pub(super) fn pointer_width(&self) -> usize {
        if self.pe32_plus {
            8
        } else {
            4
        }
    }
}

/// Data directory slot from the optional header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataDirectory {
    index: usize,
    rva: u64,
    size: u64,
}

fn parse_dos_header(c: &mut Cursor<'_>) -> Result<Region> {
    let fields = vec![
        c.magic(MZ, "e_magic")?,
        c.number(2, "e_cblp")?.with_description("bytes on last page"),
        c.number(2, "e_cp")?.with_description("pages in file"),
        c.number(2, "e_crlc")?.with_description("relocations"),
        c.number(2, "e_cparhdr")?.with_description("header size in paragraphs"),
        c.number(2, "e_minalloc")?,
        c.number(2, "e_maxalloc")?,
        c.number(2, "e_ss")?,
        c.number(2, "e_sp")?,
        c.number(2, "e_csum")?,
        c.number(2, "e_ip")?,
        c.number(2, "e_cs")?,
        c.offset(2, "e_lfarlc")?,
        c.number(2, "e_ovno")?,
        c.read_general(8, "e_res")?,
        c.number(2, "e_oemid")?,
        c.number(2, "e_oeminfo")?,
        c.read_general(20, "e_res2")?,
        c.offset(4, "e_lfanew")?.with_description("Pointer to PE header"),
    ];
    Ok(c.compound("DosHeader", fields))
}

fn parse_coff(c: &mut Cursor<'_>) -> Result<Region> {
    let fields = vec![
        c.enumerated(2, "Machine", MACHINES)?,
        c.size(2, "NumberOfSections")?,
        c.time(4, "TimeDateStamp", TimeEpoch::Unix)?,
        c.offset(4, "PointerToSymbolTable")?,
        c.size(4, "NumberOfSymbols")?,
        c.size(2, "SizeOfOptionalHeader")?,
        c.flags(2, "Characteristics", CHARACTERISTICS)?,
    ];
    Ok(c.compound("COFF", fields))
}

/// Decodes the optional header, recording the image format and base in
/// `image` and the non-empty data directories in `directories`
fn parse_optional_header(
    c: &mut Cursor<'_>,
    image: &mut Image,
    directories: &mut Vec<DataDirectory>,
) -> Result<Region> {
    let mut fields = vec![c.enumerated(2, "Magic", OPTIONAL_MAGIC)?];
    image.pe32_plus = c.num("Magic")? == PE32_PLUS;
    let wide = image.pointer_width();

    fields.extend([
        c.number(1, "MajorLinkerVersion")?,
        c.number(1, "MinorLinkerVersion")?,
        c.size(4, "SizeOfCode")?,
        c.size(4, "SizeOfInitializedData")?,
        c.size(4, "SizeOfUninitializedData")?,
        c.offset(4, "AddressOfEntryPoint")?,
        c.offset(4, "BaseOfCode")?,
    ]);
    if !image.pe32_plus {
        fields.push(c.offset(4, "BaseOfData")?);
    }
    fields.extend([
        c.offset(wide, "ImageBase")?
            .with_description("preferred address of the first byte of the image when loaded"),
        c.number(4, "SectionAlignment")?
            .with_description("alignment of sections when loaded into memory"),
        c.number(4, "FileAlignment")?
            .with_description("alignment of raw section data in the file"),
        c.number(2, "MajorOperatingSystemVersion")?,
        c.number(2, "MinorOperatingSystemVersion")?,
        c.number(2, "MajorImageVersion")?,
        c.number(2, "MinorImageVersion")?,
        c.number(2, "MajorSubsystemVersion")?,
        c.number(2, "MinorSubsystemVersion")?,
        c.number(4, "Win32VersionValue")?.with_description("reserved, must be zero"),
        c.size(4, "SizeOfImage")?,
        c.size(4, "SizeOfHeaders")?
            .with_description("DOS stub, PE header and section headers, rounded to FileAlignment"),
        c.number(4, "CheckSum")?,
        c.enumerated(2, "Subsystem", SUBSYSTEMS)?,
        c.flags(2, "DllCharacteristics", DLL_CHARACTERISTICS)?,
        c.size(wide, "SizeOfStackReserve")?,
        c.size(wide, "SizeOfStackCommit")?,
        c.size(wide, "SizeOfHeapReserve")?,
        c.size(wide, "SizeOfHeapCommit")?,
        c.number(4, "LoaderFlags")?,
        c.size(4, "NumberOfRvaAndSizes")?,
    ]);
    image.image_base = c.num("ImageBase")?;

    let declared = c.len_of("NumberOfRvaAndSizes")?;
    let count = declared.min(DIRECTORY_NAMES.len()).min(c.remaining() / 8);
    if count < declared {
        warn!("PE optional header declares {} data directories, decoding {}", declared, count);
    }

    let mut slots = Vec::with_capacity(count);
    for (index, name) in DIRECTORY_NAMES.iter().enumerate().take(count) {
        let entry = vec![c.offset(4, "VirtualAddress")?, c.size(4, "Size")?];
        let dir = DataDirectory {
            index,
            rva: c.num("VirtualAddress")?,
            size: c.num("Size")?,
        };
        if dir.rva != 0 && dir.size != 0 {
            directories.push(dir);
        }
        slots.push(c.compound("DataDirectory", entry).with_text(*name));
    }
    if !slots.is_empty() {
        fields.push(c.compound("DataDirectories", slots));
    }
    if !c.is_at_end() {
        fields.push(c.rest("Padding")?);
    }
    Ok(c.compound("OptionalHeader", fields))
}

/// Decodes `count` section headers, appending each section to `sections`
/// as soon as its header is read
fn parse_section_headers(
    c: &mut Cursor<'_>,
    count: usize,
    sections: &mut Vec<Section>,
) -> Result<Vec<Region>> {
    let mut headers = Vec::with_capacity(count.min(c.remaining() / SECTION_HEADER_LEN));
    for _ in 0..count {
        let at = c.position();
        if c.remaining() < SECTION_HEADER_LEN {
            return Err(Error::truncated(at, SECTION_HEADER_LEN, c.remaining()));
        }
        let fields = vec![
            c.padded_string(8, "Name")?,
            c.size(4, "VirtualSize")?,
            c.offset(4, "VirtualAddress")?,
            c.size(4, "SizeOfRawData")?,
            c.offset(4, "PointerToRawData")?,
            c.offset(4, "PointerToRelocations")?,
            c.offset(4, "PointerToLinenumbers")?,
            c.size(2, "NumberOfRelocations")?,
            c.size(2, "NumberOfLinenumbers")?,
            c.flags(4, "Characteristics", SECTION_CHARACTERISTICS)?,
        ];
        let section = Section {
            name: c.text("Name")?.to_string(),
            virtual_address: c.num("VirtualAddress")?,
            virtual_size: c.num("VirtualSize")?,
            raw_offset: c.num("PointerToRawData")?,
            raw_size: c.num("SizeOfRawData")?,
        };
        trace!(
            "PE section '{}' va {:#x} raw [{:#x}+{:#x}]",
            section.name,
            section.virtual_address,
            section.raw_offset,
            section.raw_size
        );
        headers.push(c.compound("SectionHeader", fields).with_text(section.name.clone()));
        sections.push(section);
    }
    Ok(headers)
}

/// Raw data of every section that has bytes in the file, by file offset
fn section_data(c: &Cursor<'_>, image: &Image) -> Result<Vec<Region>> {
    let mut data = Vec::new();
    for section in &image.sections {
        let Ok(offset) = usize::try_from(section.raw_offset) else {
            continue;
        };
        if section.raw_size == 0 || offset >= image.len {
            continue;
        }
        let size = usize::try_from(section.raw_size).unwrap_or(usize::MAX);
        if size > image.len - offset {
            warn!("PE section '{}' raw data runs past the end of the file", section.name);
        }
        let mut sub = c.fork(offset, size);
        data.push(sub.rest("SectionData")?.with_text(section.name.clone()));
    }
    data.sort_by_key(|r| r.start);
    Ok(data)
}

/// Decodes one data directory. Returns `None` when its address does not
/// resolve; a directory that fails to decode is kept as raw bytes.
fn decode_directory(c: &Cursor<'_>, image: &Image, dir: &DataDirectory) -> Result<Option<Region>> {
    let name = DIRECTORY_NAMES[dir.index];
    let offset = if dir.index == CERTIFICATE {
        usize::try_from(dir.rva).ok().filter(|&o| o < image.len)
    } else {
        match image.offset_of(dir.rva) {
            Ok(offset) => Some(offset),
            Err(e) => {
                warn!("PE {} directory skipped: {}", name, e);
                None
            }
        }
    };
    let Some(offset) = offset else {
        return Ok(None);
    };
    let size = usize::try_from(dir.size).unwrap_or(usize::MAX);
    debug!("PE {} directory at {:#x} ({} bytes)", name, offset, size);

    let mut sub = c.fork(0, c.buffer().len());
    sub.at(offset);
    let decoded = match dir.index {
        EXPORT => directories::parse_exports(&mut sub, image),
        IMPORT => directories::parse_imports(&mut sub, image),
        RESOURCE => resource::parse_resources(&mut sub, image),
        TLS => directories::parse_tls(&mut sub, image),
        _ => sub.general_clamped(size, "Directory"),
    };
    let region = match decoded {
        Ok(region) => region,
        Err(e) if e.is_recoverable() => {
            warn!("PE {} directory kept as bytes: {}", name, e);
            c.fork(offset, size).rest("Directory")?
        }
        Err(e) => return Err(e),
    };
    Ok(Some(region.with_text(name)))
}
