//! Value and flag tables for PE/COFF headers.

use crate::region::{FlagDef, ValueDefinition};

pub(super) const MACHINES: ValueDefinition = &[
    (0x0000, "Unknown"),
    (0x014C, "Intel 386"),
    (0x0166, "MIPS R4000"),
    (0x01A2, "Hitachi SH3"),
    (0x01A6, "Hitachi SH4"),
    (0x01C0, "ARM"),
    (0x01C2, "ARM Thumb"),
    (0x01C4, "ARM Thumb-2"),
    (0x01F0, "PowerPC"),
    (0x0200, "Intel Itanium"),
    (0x0EBC, "EFI byte code"),
    (0x5032, "RISC-V 32"),
    (0x5064, "RISC-V 64"),
    (0x6232, "LoongArch 32"),
    (0x6264, "LoongArch 64"),
    (0x8664, "x64"),
    (0x9041, "Mitsubishi M32R"),
    (0xAA64, "ARM64"),
];

pub(super) const CHARACTERISTICS: &[FlagDef] = &[
    FlagDef::bit(0, "RELOCS_STRIPPED", "base relocations removed"),
    FlagDef::bit(1, "EXECUTABLE_IMAGE", "image is valid and can run"),
    FlagDef::bit(2, "LINE_NUMS_STRIPPED", "COFF line numbers removed"),
    FlagDef::bit(3, "LOCAL_SYMS_STRIPPED", "COFF local symbols removed"),
    FlagDef::bit(4, "AGGRESSIVE_WS_TRIM", "aggressively trim working set"),
    FlagDef::bit(5, "LARGE_ADDRESS_AWARE", "can handle addresses above 2 GB"),
    FlagDef::bit(7, "BYTES_REVERSED_LO", "little endian"),
    FlagDef::bit(8, "32BIT_MACHINE", "32-bit word architecture"),
    FlagDef::bit(9, "DEBUG_STRIPPED", "debug information removed"),
    FlagDef::bit(10, "REMOVABLE_RUN_FROM_SWAP", "copy to swap when on removable media"),
    FlagDef::bit(11, "NET_RUN_FROM_SWAP", "copy to swap when on network media"),
    FlagDef::bit(12, "SYSTEM", "system file"),
    FlagDef::bit(13, "DLL", "dynamic-link library"),
    FlagDef::bit(14, "UP_SYSTEM_ONLY", "uniprocessor machines only"),
    FlagDef::bit(15, "BYTES_REVERSED_HI", "big endian"),
];

pub(super) const OPTIONAL_MAGIC: ValueDefinition = &[
    (0x010B, "PE32"),
    (0x020B, "PE32+"),
    (0x0107, "ROM image"),
];

pub(super) const SUBSYSTEMS: ValueDefinition = &[
    (0, "Unknown"),
    (1, "Native"),
    (2, "Windows GUI"),
    (3, "Windows CUI"),
    (5, "OS/2 CUI"),
    (7, "POSIX CUI"),
    (8, "Native Win9x driver"),
    (9, "Windows CE GUI"),
    (10, "EFI application"),
    (11, "EFI boot service driver"),
    (12, "EFI runtime driver"),
    (13, "EFI ROM"),
    (14, "Xbox"),
    (16, "Windows boot application"),
];

pub(super) const DLL_CHARACTERISTICS: &[FlagDef] = &[
    FlagDef::bit(5, "HIGH_ENTROPY_VA", "64-bit high entropy ASLR"),
    FlagDef::bit(6, "DYNAMIC_BASE", "can be relocated at load time"),
    FlagDef::bit(7, "FORCE_INTEGRITY", "code integrity checks are enforced"),
    FlagDef::bit(8, "NX_COMPAT", "compatible with DEP"),
    FlagDef::bit(9, "NO_ISOLATION", "isolation aware, but do not isolate"),
    FlagDef::bit(10, "NO_SEH", "no structured exception handling"),
    FlagDef::bit(11, "NO_BIND", "do not bind the image"),
    FlagDef::bit(12, "APPCONTAINER", "must run in an AppContainer"),
    FlagDef::bit(13, "WDM_DRIVER", "WDM driver"),
    FlagDef::bit(14, "GUARD_CF", "supports Control Flow Guard"),
    FlagDef::bit(15, "TERMINAL_SERVER_AWARE", "terminal server aware"),
];

pub(super) const SECTION_CHARACTERISTICS: &[FlagDef] = &[
    FlagDef::bit(3, "TYPE_NO_PAD", "no padding to the next boundary"),
    FlagDef::bit(5, "CNT_CODE", "executable code"),
    FlagDef::bit(6, "CNT_INITIALIZED_DATA", "initialized data"),
    FlagDef::bit(7, "CNT_UNINITIALIZED_DATA", "uninitialized data"),
    FlagDef::bit(9, "LNK_INFO", "comments or other information"),
    FlagDef::bit(11, "LNK_REMOVE", "not part of the image"),
    FlagDef::bit(12, "LNK_COMDAT", "COMDAT data"),
    FlagDef::bit(15, "GPREL", "referenced through the global pointer"),
    FlagDef::field(20, 4, 1, "ALIGN_1BYTES", "align on a 1-byte boundary"),
    FlagDef::field(20, 4, 2, "ALIGN_2BYTES", "align on a 2-byte boundary"),
    FlagDef::field(20, 4, 3, "ALIGN_4BYTES", "align on a 4-byte boundary"),
    FlagDef::field(20, 4, 4, "ALIGN_8BYTES", "align on an 8-byte boundary"),
    FlagDef::field(20, 4, 5, "ALIGN_16BYTES", "align on a 16-byte boundary"),
    FlagDef::field(20, 4, 6, "ALIGN_32BYTES", "align on a 32-byte boundary"),
    FlagDef::field(20, 4, 7, "ALIGN_64BYTES", "align on a 64-byte boundary"),
    FlagDef::field(20, 4, 8, "ALIGN_128BYTES", "align on a 128-byte boundary"),
    FlagDef::field(20, 4, 9, "ALIGN_256BYTES", "align on a 256-byte boundary"),
    FlagDef::field(20, 4, 10, "ALIGN_512BYTES", "align on a 512-byte boundary"),
    FlagDef::field(20, 4, 11, "ALIGN_1024BYTES", "align on a 1024-byte boundary"),
    FlagDef::field(20, 4, 12, "ALIGN_2048BYTES", "align on a 2048-byte boundary"),
    FlagDef::field(20, 4, 13, "ALIGN_4096BYTES", "align on a 4096-byte boundary"),
    FlagDef::field(20, 4, 14, "ALIGN_8192BYTES", "align on an 8192-byte boundary"),
    FlagDef::bit(24, "LNK_NRELOC_OVFL", "extended relocations"),
    FlagDef::bit(25, "MEM_DISCARDABLE", "can be discarded as needed"),
    FlagDef::bit(26, "MEM_NOT_CACHED", "cannot be cached"),
    FlagDef::bit(27, "MEM_NOT_PAGED", "not pageable"),
    FlagDef::bit(28, "MEM_SHARED", "can be shared in memory"),
    FlagDef::bit(29, "MEM_EXECUTE", "can be executed as code"),
    FlagDef::bit(30, "MEM_READ", "can be read"),
    FlagDef::bit(31, "MEM_WRITE", "can be written to"),
];

/// Names of the data directory slots, by index
pub(super) const DIRECTORY_NAMES: [&str; 16] = [
    "Export",
    "Import",
    "Resource",
    "Exception",
    "Certificate",
    "BaseRelocation",
    "Debug",
    "Architecture",
    "GlobalPtr",
    "TLS",
    "LoadConfig",
    "BoundImport",
    "IAT",
    "DelayImport",
    "CLRRuntime",
    "Reserved",
];

pub(super) const RESOURCE_TYPES: ValueDefinition = &[
    (1, "CURSOR"),
    (2, "BITMAP"),
    (3, "ICON"),
    (4, "MENU"),
    (5, "DIALOG"),
    (6, "STRING"),
    (7, "FONTDIR"),
    (8, "FONT"),
    (9, "ACCELERATOR"),
    (10, "RCDATA"),
    (11, "MESSAGETABLE"),
    (12, "GROUP_CURSOR"),
    (14, "GROUP_ICON"),
    (16, "VERSION"),
    (17, "DLGINCLUDE"),
    (19, "PLUGPLAY"),
    (20, "VXD"),
    (21, "ANICURSOR"),
    (22, "ANIICON"),
    (23, "HTML"),
    (24, "MANIFEST"),
];

/// Looks up `value` in a table
pub(super) fn label(definition: ValueDefinition, value: u64) -> Option<&'static str> {
    definition
        .iter()
        .find(|(code, _)| *code == value)
        .map(|(_, name)| *name)
}
