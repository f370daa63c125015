//! The error type for DWARF processing.

use thiserror::Error;

use crate::module::SectionId;

/// An error handling DWARF debugging information.
///
/// [`DwarfError::NotFound`] doubles as a sentinel for control flow: a type
/// that does not exist, a register whose value is unknown, or a program
/// counter outside every FDE all surface as `NotFound` so that callers can
/// degrade gracefully (e.g. report an object as absent) instead of failing.
/// Everything else is a real error. Malformed or unsupported DWARF is always
/// reported loudly; unknown opcodes and augmentations are never silently
/// skipped.
#[non_exhaustive]
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum DwarfError {
    /// The requested entity does not exist.
    #[error("not found")]
    NotFound,

    /// Type construction recursed too deeply.
    #[error("maximum DWARF type parsing depth exceeded")]
    Recursion,

    /// Arithmetic on factored offsets or ranges overflowed.
    #[error("{0}")]
    Overflow(&'static str),

    /// Malformed data in a debug section, anchored to the byte that could
    /// not be decoded.
    #[error("{module}: {section} + {offset:#x}: {message}")]
    Parse {
        /// Name of the module the section belongs to.
        module: String,
        /// Section the error occurred in.
        section: SectionId,
        /// Byte offset of the error from the start of the section.
        offset: u64,
        /// Description of the problem.
        message: String,
    },

    /// A module-level problem that cannot be anchored to a section offset,
    /// such as a missing section.
    #[error("{module}: {message}")]
    Module {
        /// Name of the module.
        module: String,
        /// Description of the problem.
        message: String,
    },

    /// A structural problem independent of any particular module.
    #[error("{0}")]
    Other(String),

    /// The underlying DWARF reader rejected the data.
    #[error("corrupted DWARF data: {0}")]
    Corrupt(#[from] gimli::Error),
}

/// A `Result` with [`DwarfError`] as the error type.
pub type Result<T, E = DwarfError> = std::result::Result<T, E>;
