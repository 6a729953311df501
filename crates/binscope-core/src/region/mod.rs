//! The region model: typed, positioned annotations over a byte buffer.
//!
//! Every decoder produces a list of [`Region`]s. A region names a half-open
//! byte range `[start, end)` of the original buffer, says what kind of value
//! lives there, and may contain child regions. Children are either decoded
//! eagerly or declared with a count and materialized on demand through a
//! [`LazyChildren`] arena.

mod lazy;

use crate::error::Result;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

pub use lazy::{ChildSource, KnownChildren, LazyChildren};

/// What a region holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Unsigned integer
    Number,
    /// Two's-complement signed integer
    SignedNumber,
    /// Unsigned integer used as a pointer or file offset
    Offset,
    /// Unsigned integer used as a length or count
    Size,
    /// Bit field described by a flag definition
    Flags,
    /// Timestamp; `interpreted_value` carries the rendered date
    Time,
    /// Decoded text
    String,
    /// Untyped bytes
    General,
    /// Container with no value of its own
    Compound,
}

impl RegionKind {
    /// Returns true for the kinds that carry a numeric value
    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Self::Number | Self::SignedNumber | Self::Offset | Self::Size | Self::Flags | Self::Time
        )
    }

    /// Short lowercase name used in listings
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::SignedNumber => "signed",
            Self::Offset => "offset",
            Self::Size => "size",
            Self::Flags => "flags",
            Self::Time => "time",
            Self::String => "string",
            Self::General => "bytes",
            Self::Compound => "compound",
        }
    }
}

/// Byte order of a numeric region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    /// Most significant byte first
    Big,
    /// Least significant byte first
    #[default]
    Little,
}

/// Integer value of a numeric region, wide enough for 16-byte fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumericValue {
    /// Value read as unsigned
    Unsigned(u128),
    /// Value read as two's-complement signed
    Signed(i128),
}

impl NumericValue {
    /// Returns the value as `u64` if it is non-negative and fits
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::Unsigned(v) => u64::try_from(v).ok(),
            Self::Signed(v) => u64::try_from(v).ok(),
        }
    }

    /// Returns the value as `i128` if it fits
    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            Self::Unsigned(v) => i128::try_from(v).ok(),
            Self::Signed(v) => Some(v),
        }
    }

    /// Returns the value as `usize` if it is non-negative and fits
    pub fn as_usize(&self) -> Option<usize> {
        self.as_u64().and_then(|v| usize::try_from(v).ok())
    }
}

impl fmt::Display for NumericValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsigned(v) => write!(f, "{v}"),
            Self::Signed(v) => write!(f, "{v}"),
        }
    }
}

/// Code to label table for enumerated fields
pub type ValueDefinition = &'static [(u64, &'static str)];

/// One entry of a flag table.
///
/// The entry matches when the `width` bits starting at `bit` equal `value`.
/// Single-bit flags use a width of 1 and a value of 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlagDef {
    /// Lowest bit of the field
    pub bit: u32,
    /// Number of bits in the field
    pub width: u32,
    /// Pattern the field must equal
    pub value: u64,
    /// Short name
    pub name: &'static str,
    /// Long description
    pub description: &'static str,
}

impl FlagDef {
    /// A single-bit flag
    pub const fn bit(bit: u32, name: &'static str, description: &'static str) -> Self {
        Self {
            bit,
            width: 1,
            value: 1,
            name,
            description,
        }
    }

    /// A multi-bit field matching one pattern
    pub const fn field(
        bit: u32,
        width: u32,
        value: u64,
        name: &'static str,
        description: &'static str,
    ) -> Self {
        Self {
            bit,
            width,
            value,
            name,
            description,
        }
    }

    /// Returns true if this entry matches the raw value
    pub fn matches(&self, raw: u64) -> bool {
        let mask = if self.width >= 64 {
            u64::MAX
        } else {
            (1u64 << self.width) - 1
        };
        (raw.checked_shr(self.bit).unwrap_or(0) & mask) == self.value
    }
}

/// Child regions of a region
#[derive(Debug, Clone, Default)]
pub enum Children {
    /// Leaf region
    #[default]
    None,
    /// Fully decoded, ordered children
    Eager(Vec<Region>),
    /// Declared count, decoded on first access
    Lazy(Arc<LazyChildren>),
}

impl Children {
    /// Number of children, declared or decoded
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Eager(v) => v.len(),
            Self::Lazy(l) => l.count(),
        }
    }

    /// Returns true if there are no children
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if children are materialized on demand
    pub fn is_lazy(&self) -> bool {
        matches!(self, Self::Lazy(_))
    }
}

/// A child obtained by index, borrowed from an eager list or shared from a
/// lazy arena
#[derive(Debug, Clone)]
pub enum ChildRef<'a> {
    /// Borrowed from an eager child list
    Borrowed(&'a Region),
    /// Shared from a lazy arena
    Shared(Arc<Region>),
}

impl Deref for ChildRef<'_> {
    type Target = Region;

    fn deref(&self) -> &Region {
        match self {
            Self::Borrowed(r) => r,
            Self::Shared(r) => r,
        }
    }
}

/// A named, typed, positioned annotation over a byte range
#[derive(Debug, Clone)]
pub struct Region {
    /// Field name, unique among the fields of one record
    pub id: String,
    /// What the region holds
    pub kind: RegionKind,
    /// Human-readable description
    pub description: String,
    /// Decoded meaning of the value (enum label, date, flag names)
    pub interpreted_value: Option<String>,
    /// Enum table used to interpret the value
    pub value_definition: Option<ValueDefinition>,
    /// Flag table used to interpret the value
    pub flag_definition: Option<&'static [FlagDef]>,
    /// Absolute start offset (inclusive)
    pub start: usize,
    /// Absolute end offset (exclusive)
    pub end: usize,
    /// Byte order the value was read in
    pub endian: Option<Endian>,
    /// Value of numeric regions
    pub numeric_value: Option<NumericValue>,
    /// Value of string regions, or a display label for compounds
    pub text_value: Option<String>,
    /// Child regions
    pub children: Children,
}

impl Region {
    /// Creates a bare region of the given kind over `[start, end)`
    pub fn new(id: impl Into<String>, kind: RegionKind, start: usize, end: usize) -> Self {
        Self {
            id: id.into(),
            kind,
            description: String::new(),
            interpreted_value: None,
            value_definition: None,
            flag_definition: None,
            start,
            end: end.max(start),
            endian: None,
            numeric_value: None,
            text_value: None,
            children: Children::None,
        }
    }

    /// Creates a compound whose span is derived from its children.
    ///
    /// With no children the compound is empty and sits at `at`.
    pub fn compound(id: impl Into<String>, at: usize, children: Vec<Region>) -> Self {
        let start = children.iter().map(|c| c.start).min().unwrap_or(at);
        let end = children.iter().map(|c| c.end).max().unwrap_or(start);
        let mut region = Self::new(id, RegionKind::Compound, start, end);
        region.children = Children::Eager(children);
        region
    }

    /// Creates a compound over `[start, end)` whose children are decoded on
    /// demand
    pub fn lazy(id: impl Into<String>, start: usize, end: usize, children: LazyChildren) -> Self {
        let mut region = Self::new(id, RegionKind::Compound, start, end);
        region.children = Children::Lazy(Arc::new(children));
        region
    }

    /// Sets the description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Sets the interpreted value
    pub fn with_interpretation(mut self, value: impl Into<String>) -> Self {
        self.interpreted_value = Some(value.into());
        self
    }

    /// Sets the text value
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_value = Some(text.into());
        self
    }

    /// Attaches an enum table and interprets the current value with it
    pub fn with_values(mut self, definition: ValueDefinition) -> Self {
        self.value_definition = Some(definition);
        if let Some(label) = self
            .num()
            .and_then(|v| definition.iter().find(|(code, _)| *code == v))
            .map(|(_, label)| *label)
        {
            self.interpreted_value = Some(label.to_string());
        }
        self
    }

    /// Attaches a flag table and interprets the current value with it
    pub fn with_flags(mut self, definition: &'static [FlagDef]) -> Self {
        self.flag_definition = Some(definition);
        if let Some(raw) = self.num() {
            let names: Vec<&str> = definition
                .iter()
                .filter(|f| f.matches(raw))
                .map(|f| f.name)
                .collect();
            if !names.is_empty() {
                self.interpreted_value = Some(names.join(" | "));
            }
        }
        self
    }

    /// Length of the region in bytes
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns true if the region covers no bytes
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Numeric value as `u64`, if present and non-negative
    pub fn num(&self) -> Option<u64> {
        self.numeric_value.as_ref().and_then(NumericValue::as_u64)
    }

    /// Text value, if present
    pub fn text(&self) -> Option<&str> {
        self.text_value.as_deref()
    }

    /// Returns the eager children, or an empty slice for leaf and lazy
    /// regions
    pub fn eager_children(&self) -> &[Region] {
        match &self.children {
            Children::Eager(v) => v,
            _ => &[],
        }
    }

    /// Returns the first eager child with the given id
    pub fn child(&self, id: &str) -> Option<&Region> {
        self.eager_children().iter().find(|c| c.id == id)
    }

    /// Number of children, declared or decoded
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Returns child `index`, materializing it if the children are lazy
    pub fn child_at(&self, index: usize) -> Result<Option<ChildRef<'_>>> {
        match &self.children {
            Children::None => Ok(None),
            Children::Eager(v) => Ok(v.get(index).map(ChildRef::Borrowed)),
            Children::Lazy(l) => {
                if index >= l.count() {
                    return Ok(None);
                }
                l.get(index).map(|r| Some(ChildRef::Shared(r)))
            }
        }
    }

    /// Visits this region and every eager descendant depth-first
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Region)) {
        visit(self);
        for child in self.eager_children() {
            child.walk(visit);
        }
    }

    /// Short display string for the value of this region
    pub fn display_value(&self) -> String {
        let raw = match (&self.numeric_value, &self.text_value) {
            (Some(n), _) => n.to_string(),
            (None, Some(t)) => format!("{t:?}"),
            (None, None) => String::new(),
        };
        match &self.interpreted_value {
            Some(i) if raw.is_empty() => i.clone(),
            Some(i) => format!("{raw} ({i})"),
            None => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COLORS: ValueDefinition = &[(0, "black"), (1, "white")];
    const BITS: &[FlagDef] = &[
        FlagDef::bit(0, "A", "first"),
        FlagDef::bit(3, "D", "fourth"),
        FlagDef::field(1, 2, 2, "MODE2", "mode two"),
    ];

    fn number(id: &str, start: usize, end: usize, v: u128) -> Region {
        let mut r = Region::new(id, RegionKind::Number, start, end);
        r.numeric_value = Some(NumericValue::Unsigned(v));
        r
    }

    #[test]
    fn test_compound_span_from_children() {
        let c = Region::compound("c", 0, vec![number("a", 4, 6, 1), number("b", 6, 10, 2)]);
        assert_eq!((c.start, c.end), (4, 10));
        assert_eq!(c.child_count(), 2);
        assert_eq!(c.child("b").and_then(Region::num), Some(2));

        let empty = Region::compound("e", 7, Vec::new());
        assert_eq!((empty.start, empty.end), (7, 7));
    }

    #[test]
    fn test_value_definition_interpretation() {
        let r = number("color", 0, 1, 1).with_values(COLORS);
        assert_eq!(r.interpreted_value.as_deref(), Some("white"));
        let r = number("color", 0, 1, 9).with_values(COLORS);
        assert_eq!(r.interpreted_value, None);
    }

    #[test]
    fn test_flag_matching() {
        // 0b1101: bit0 set, bits1-2 = 0b10, bit3 set
        let r = number("flags", 0, 1, 0b1101).with_flags(BITS);
        assert_eq!(r.interpreted_value.as_deref(), Some("A | D | MODE2"));
        assert!(!BITS[2].matches(0b0010));
    }

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(NumericValue::Signed(-1).as_u64(), None);
        assert_eq!(NumericValue::Unsigned(u128::MAX).as_i128(), None);
        assert_eq!(NumericValue::Unsigned(300).as_usize(), Some(300));
    }

    #[test]
    fn test_display_value() {
        let r = number("color", 0, 1, 0).with_values(COLORS);
        assert_eq!(r.display_value(), "0 (black)");
        let s = Region::new("s", RegionKind::String, 0, 2).with_text("hi");
        assert_eq!(s.display_value(), "\"hi\"");
    }
}
