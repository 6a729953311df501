//! Error types for the binscope-core library.
//!
//! Decoders report failures through a single `thiserror` enum. Most variants
//! carry the absolute byte offset where decoding stopped so that degraded
//! sub-trees can say where they gave up.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for binscope operations
pub type Result<T> = std::result::Result<T, Error>;

/// Comprehensive error type for all binscope operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Failed to read input file
    #[error("failed to read file '{path}': {source}")]
    FileRead {
        /// Path to the file that failed to read
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A magic number or fixed-content check failed
    #[error("format mismatch at offset {offset}: expected {expected}")]
    FormatMismatch {
        /// Byte offset of the checked content
        offset: usize,
        /// What the decoder expected to find
        expected: String,
    },

    /// A length field is inconsistent with the data around it
    #[error("malformed length at offset {offset}: {details}")]
    MalformedLength {
        /// Byte offset of the length field
        offset: usize,
        /// Detailed description of the issue
        details: String,
    },

    /// A read would run past the end of the buffer
    #[error("truncated buffer: {needed} bytes needed at offset {offset}, {available} available")]
    TruncatedBuffer {
        /// Byte offset where the read started
        offset: usize,
        /// Number of bytes requested
        needed: usize,
        /// Number of bytes available before the limit
        available: usize,
    },

    /// A forced format id is not registered
    #[error("unknown format '{id}'")]
    UnknownFormat {
        /// The requested format id
        id: String,
    },

    /// The data uses a construct the decoder cannot segment
    #[error("unsupported construct at offset {offset}: {details}")]
    UnsupportedConstruct {
        /// Byte offset of the construct
        offset: usize,
        /// Detailed description of the construct
        details: String,
    },

    /// A decoder asked for a named value that was never read
    #[error("no value recorded for field '{id}'")]
    MissingField {
        /// The field id looked up in the cursor memo
        id: String,
    },

    /// A child index past the declared child count was requested
    #[error("child index {index} out of range (count {count})")]
    IndexOutOfRange {
        /// The requested index
        index: usize,
        /// The declared number of children
        count: usize,
    },
}

impl Error {
    /// Creates a new file read error
    pub fn file_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileRead {
            path: path.into(),
            source,
        }
    }

    /// Creates a new format mismatch error
    pub fn mismatch(offset: usize, expected: impl Into<String>) -> Self {
        Self::FormatMismatch {
            offset,
            expected: expected.into(),
        }
    }

    /// Creates a new malformed length error
    pub fn malformed_length(offset: usize, details: impl Into<String>) -> Self {
        Self::MalformedLength {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new truncated buffer error
    pub fn truncated(offset: usize, needed: usize, available: usize) -> Self {
        Self::TruncatedBuffer {
            offset,
            needed,
            available,
        }
    }

    /// Creates a new unknown format error
    pub fn unknown_format(id: impl Into<String>) -> Self {
        Self::UnknownFormat { id: id.into() }
    }

    /// Creates a new unsupported construct error
    pub fn unsupported(offset: usize, details: impl Into<String>) -> Self {
        Self::UnsupportedConstruct {
            offset,
            details: details.into(),
        }
    }

    /// Creates a new missing field error
    pub fn missing_field(id: impl Into<String>) -> Self {
        Self::MissingField { id: id.into() }
    }

    /// Returns true if a best-effort sub-table may swallow this error and
    /// degrade to an opaque region
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::FormatMismatch { .. }
                | Self::MalformedLength { .. }
                | Self::TruncatedBuffer { .. }
                | Self::UnsupportedConstruct { .. }
                | Self::MissingField { .. }
        )
    }
}
