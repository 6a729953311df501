//! # binscope-core
//!
//! A library for decoding binary container formats into a uniform tree of
//! annotated byte regions.
//!
//! This crate provides the core functionality for:
//! - Describing byte ranges as typed, nested [`Region`]s
//! - Carving regions out of a buffer with a stateful [`Cursor`]
//! - Picking a format decoder by sniffing and running it
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`region`]: The region model, including lazily materialized children
//! - [`cursor`]: Region-building reader shared by all decoders
//! - [`registry`]: Decoder selection, options and dispatch
//! - [`formats`]: One decoder per supported format
//! - [`error`]: Error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use binscope_core::Registry;
//! use std::fs;
//!
//! let data = fs::read("setup.exe")?;
//! let dom = Registry::new().parse(data, "setup.exe", None)?;
//!
//! for region in &dom.regions {
//!     println!("{} [{}..{})", region.id, region.start, region.end);
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Extensibility
//!
//! New formats implement the [`Decoder`] trait and are added with
//! [`Registry::register`]. Record tables too large to decode eagerly can
//! expose their children through a [`ChildSource`].

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

pub mod cursor;
pub mod error;
pub mod formats;
pub mod region;
pub mod registry;
pub mod text;
pub mod time;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export primary types for convenience
pub use cursor::{Cursor, Direction, MemoValue};
pub use error::{Error, Result};
pub use formats::Decoder;
pub use region::{
    ChildRef, ChildSource, Children, Endian, FlagDef, KnownChildren, LazyChildren, NumericValue,
    Region, RegionKind, ValueDefinition,
};
pub use registry::{
    decode_file, FileDom, OptionDef, OptionsMap, ParsingOptions, Registry, RegistryConfig,
};
pub use text::TextEncoding;
pub use time::TimeEpoch;

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
