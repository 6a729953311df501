//! Text encodings understood by string regions.
//!
//! Container formats predate Unicode in many places. ZIP names are often
//! code-page text, ID3 frames switch between Latin-1 and UTF-16 per frame,
//! and PE resource strings are UTF-16LE. Decoding is lossy and never fails.

use std::fmt;

/// Named text encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    /// UTF-8, invalid sequences replaced
    #[default]
    Utf8,
    /// ISO-8859-1, one byte per code point
    Latin1,
    /// 7-bit ASCII, high bytes replaced
    Ascii,
    /// UTF-16 little endian
    Utf16Le,
    /// UTF-16 big endian
    Utf16Be,
}

impl TextEncoding {
    /// Looks up an encoding by its common label, case-insensitively
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(Self::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" | "iso8859-1" => Some(Self::Latin1),
            "ascii" | "us-ascii" => Some(Self::Ascii),
            "utf-16le" | "utf16le" | "utf-16" => Some(Self::Utf16Le),
            "utf-16be" | "utf16be" => Some(Self::Utf16Be),
            _ => None,
        }
    }

    /// Canonical label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Utf8 => "utf-8",
            Self::Latin1 => "iso-8859-1",
            Self::Ascii => "ascii",
            Self::Utf16Le => "utf-16le",
            Self::Utf16Be => "utf-16be",
        }
    }

    /// Width of one code unit in bytes
    pub fn unit_width(&self) -> usize {
        match self {
            Self::Utf16Le | Self::Utf16Be => 2,
            _ => 1,
        }
    }

    /// Decodes `bytes`; with `null_terminated`, stops at the first zero code
    /// unit
    pub fn decode(&self, bytes: &[u8], null_terminated: bool) -> String {
        let bytes = if null_terminated {
            &bytes[..self.terminator_offset(bytes).unwrap_or(bytes.len())]
        } else {
            bytes
        };

        match self {
            Self::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            Self::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Self::Ascii => bytes
                .iter()
                .map(|&b| if b.is_ascii() { char::from(b) } else { char::REPLACEMENT_CHARACTER })
                .collect(),
            Self::Utf16Le | Self::Utf16Be => {
                let units = bytes.chunks_exact(2).map(|pair| {
                    let pair = [pair[0], pair[1]];
                    if *self == Self::Utf16Le {
                        u16::from_le_bytes(pair)
                    } else {
                        u16::from_be_bytes(pair)
                    }
                });
                char::decode_utf16(units)
                    .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect()
            }
        }
    }

    /// Byte offset of the first zero code unit, if any
    pub fn terminator_offset(&self, bytes: &[u8]) -> Option<usize> {
        let width = self.unit_width();
        bytes
            .chunks_exact(width)
            .position(|unit| unit.iter().all(|&b| b == 0))
            .map(|i| i * width)
    }
}

impl fmt::Display for TextEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Strips trailing NUL characters
pub fn trim_nul(s: &str) -> &str {
    s.trim_end_matches('\0')
}
