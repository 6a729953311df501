//! Export, import and TLS directories.
//!
//! All three are reached through RVAs, and each points at further
//! RVA-addressed tables (name strings, lookup tables, callback arrays), so
//! their regions are scattered over the section that holds them.

use super::Image;
use crate::cursor::Cursor;
use crate::error::{Error, Result};
use crate::region::Region;
use crate::time::TimeEpoch;
use tracing::{trace, warn};

const IMPORT_DESCRIPTOR_LEN: usize = 20;
const RVA_MASK: u64 = 0x7FFF_FFFF;
const MAX_TLS_CALLBACKS: usize = 256;

/// Fails unless `count` entries of `width` bytes can fit in the file
fn check_count(c: &Cursor<'_>, count: usize, width: usize, what: &str) -> Result<()> {
    if count.saturating_mul(width) > c.buffer().len() {
        return Err(Error::malformed_length(
            c.position(),
            format!("{count} {what} entries cannot fit in the file"),
        ));
    }
    Ok(())
}

pub(super) fn parse_exports(c: &mut Cursor<'_>, image: &Image) -> Result<Region> {
    let header = vec![
        c.number(4, "Characteristics")?,
        c.time(4, "TimeDateStamp", TimeEpoch::Unix)?,
        c.number(2, "MajorVersion")?,
        c.number(2, "MinorVersion")?,
        c.offset(4, "Name")?,
        c.number(4, "Base")?.with_description("first ordinal number"),
        c.size(4, "NumberOfFunctions")?,
        c.size(4, "NumberOfNames")?,
        c.offset(4, "AddressOfFunctions")?,
        c.offset(4, "AddressOfNames")?,
        c.offset(4, "AddressOfNameOrdinals")?,
    ];
    let mut fields = vec![c.compound("ExportHeader", header)];

    let functions = c.len_of("NumberOfFunctions")?;
    let names = c.len_of("NumberOfNames")?;
    check_count(c, functions, 4, "export address")?;
    check_count(c, names, 4, "export name")?;
    let base = c.num("Base")?;

    if c.num("Name")? != 0 {
        fields.push(image.seek(c, c.num("Name")?)?.zstring("DllName")?);
    }

    if functions > 0 {
        let mut table = image.seek(c, c.num("AddressOfFunctions")?)?;
        let table_at = table.position();
        let entries = (0..functions)
            .map(|i| {
                Ok(table
                    .offset(4, "Function")?
                    .with_description(format!("ordinal {}", base + i as u64)))
            })
            .collect::<Result<Vec<_>>>()?;
        fields.push(Region::compound("ExportAddressTable", table_at, entries));
    }

    if names > 0 {
        let mut pointers = image.seek(c, c.num("AddressOfNames")?)?;
        let mut ordinals = image.seek(c, c.num("AddressOfNameOrdinals")?)?;
        let (pointers_at, ordinals_at) = (pointers.position(), ordinals.position());
        let (mut pointer_table, mut ordinal_table, mut strings) = (Vec::new(), Vec::new(), Vec::new());
        for _ in 0..names {
            pointer_table.push(pointers.offset(4, "NamePointer")?);
            let name = image.seek(c, pointers.num("NamePointer")?)?.zstring("Name")?;
            let label = name.text().unwrap_or_default().to_string();
            strings.push(name);

            let ordinal = ordinals.number(2, "Ordinal")?;
            let biased = base + ordinals.num("Ordinal")?;
            ordinal_table.push(ordinal.with_interpretation(biased.to_string()).with_text(label));
        }
        trace!("PE export table with {} names", names);
        let names_at = strings.first().map_or(pointers_at, |name| name.start);
        fields.push(Region::compound("NamePointerTable", pointers_at, pointer_table));
        fields.push(Region::compound("OrdinalTable", ordinals_at, ordinal_table));
        fields.push(Region::compound("ExportNames", names_at, strings));
    }

    Ok(c.compound("ExportDirectory", fields))
}

pub(super) fn parse_imports(c: &mut Cursor<'_>, image: &Image) -> Result<Region> {
    let mut descriptors = Vec::new();
    let mut modules = Vec::new();
    loop {
        let at = c.position();
        if c.peek(at, IMPORT_DESCRIPTOR_LEN)?.iter().all(|&b| b == 0) {
            descriptors.push(c.read_general(IMPORT_DESCRIPTOR_LEN, "Terminator")?);
            break;
        }
        let fields = vec![
            c.offset(4, "OriginalFirstThunk")?.with_description("RVA of the import lookup table"),
            c.time(4, "TimeDateStamp", TimeEpoch::Unix)?,
            c.number(4, "ForwarderChain")?,
            c.offset(4, "Name")?,
            c.offset(4, "FirstThunk")?.with_description("RVA of the import address table"),
        ];
        let dll = image.seek(c, c.num("Name")?)?.zstring("DllName")?;
        let dll_name = dll.text().unwrap_or_default().to_string();
        trace!("PE import descriptor for '{}' at {:#x}", dll_name, at);

        modules.push(parse_module(
            c,
            image,
            dll,
            c.num("OriginalFirstThunk")?,
            c.num("FirstThunk")?,
        )?);
        descriptors.push(c.compound("ImportDescriptor", fields).with_text(dll_name));
    }
    descriptors.extend(modules);
    Ok(c.compound("ImportDirectory", descriptors))
}

/// Lookup table, hint/name entries and IAT of one imported DLL
fn parse_module(
    c: &Cursor<'_>,
    image: &Image,
    dll: Region,
    original_first_thunk: u64,
    first_thunk: u64,
) -> Result<Region> {
    let width = image.pointer_width();
    let ordinal_flag = 1u64 << (width * 8 - 1);
    let dll_name = dll.text().unwrap_or_default().to_string();
    let module_at = dll.start;
    let mut parts = vec![dll];

    let lookup_rva = if original_first_thunk != 0 {
        original_first_thunk
    } else {
        first_thunk
    };
    let mut lookup = image.seek(c, lookup_rva)?;
    let lookup_at = lookup.position();
    let mut thunks = Vec::new();
    let mut hint_names = Vec::new();
    loop {
        let thunk = lookup.number(width, "Thunk")?;
        let value = lookup.num("Thunk")?;
        if value == 0 {
            thunks.push(thunk.with_interpretation("end"));
            break;
        }
        if value & ordinal_flag != 0 {
            thunks.push(thunk.with_interpretation(format!("ordinal {}", value & 0xFFFF)));
            continue;
        }
        let mut entry = image.seek(c, value & RVA_MASK)?;
        let hint = entry.number(2, "Hint")?;
        let name = entry.zstring("Name")?;
        let label = name.text().unwrap_or_default().to_string();
        hint_names.push(Region::compound("HintName", hint.start, vec![hint, name]).with_text(label.clone()));
        thunks.push(thunk.with_interpretation(label));
    }
    let count = thunks.len();
    parts.push(Region::compound("ImportLookupTable", lookup_at, thunks));

    if original_first_thunk != 0 && first_thunk != 0 {
        match image.seek(c, first_thunk) {
            Ok(mut iat) => {
                let iat_at = iat.position();
                let entries = (0..count)
                    .map(|_| iat.number(width, "IatEntry"))
                    .collect::<Result<Vec<_>>>()?;
                parts.push(Region::compound("ImportAddressTable", iat_at, entries));
            }
            Err(e) => warn!("PE import address table of '{}' not decoded: {}", dll_name, e),
        }
    }
    if let Some(first) = hint_names.first() {
        let hints_at = first.start;
        parts.push(Region::compound("HintNames", hints_at, hint_names));
    }
    Ok(Region::compound("ImportedModule", module_at, parts).with_text(dll_name))
}

pub(super) fn parse_tls(c: &mut Cursor<'_>, image: &Image) -> Result<Region> {
    let width = image.pointer_width();
    let mut fields = vec![
        c.offset(width, "StartAddressOfRawData")?,
        c.offset(width, "EndAddressOfRawData")?,
        c.offset(width, "AddressOfIndex")?,
        c.offset(width, "AddressOfCallBacks")?.with_description("VA of a null-terminated callback array"),
        c.size(4, "SizeOfZeroFill")?,
        c.number(4, "Characteristics")?,
    ];

    let callbacks_va = c.num("AddressOfCallBacks")?;
    if callbacks_va != 0 {
        let rva = callbacks_va.wrapping_sub(image.image_base);
        match image.seek(c, rva) {
            Ok(mut table) => {
                let table_at = table.position();
                let mut callbacks = Vec::new();
                while callbacks.len() < MAX_TLS_CALLBACKS {
                    let callback = table.offset(width, "Callback")?;
                    let end = table.num("Callback")? == 0;
                    callbacks.push(callback);
                    if end {
                        break;
                    }
                }
                fields.push(Region::compound("Callbacks", table_at, callbacks));
            }
            Err(e) => warn!("PE TLS callbacks not decoded: {}", e),
        }
    }
    Ok(c.compound("TlsDirectory", fields))
}
