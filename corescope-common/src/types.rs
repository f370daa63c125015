//! Common types used across the `corescope` crates.

use std::fmt;

/// Byte order of a target machine, section, or individual type.
///
/// DWARF allows individual types to override the byte order of the ELF file
/// via `DW_AT_endianity`, so this is carried per scalar type rather than
/// assumed from the platform.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ByteOrder {
    /// Least significant byte first.
    Little,
    /// Most significant byte first.
    Big,
}

impl ByteOrder {
    /// Creates a byte order from a little-endian flag.
    pub fn from_little_endian(little_endian: bool) -> Self {
        if little_endian {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }

    /// Returns whether this is [`ByteOrder::Little`].
    pub fn is_little_endian(self) -> bool {
        matches!(self, ByteOrder::Little)
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteOrder::Little => write!(f, "little-endian"),
            ByteOrder::Big => write!(f, "big-endian"),
        }
    }
}

/// Source language of a compilation unit.
///
/// Only the languages with dedicated lookup and formatting behavior are
/// distinguished; everything else maps to [`Language::Unknown`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Language {
    /// The C programming language (any standard revision).
    C,
    /// The C++ programming language (any standard revision).
    Cpp,
    /// Any language without dedicated support.
    Unknown,
}

impl Language {
    /// The fallback language used when a compilation unit does not declare
    /// one.
    pub const DEFAULT: Language = Language::C;
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Language::C => write!(f, "C"),
            Language::Cpp => write!(f, "C++"),
            Language::Unknown => write!(f, "unknown"),
        }
    }
}
