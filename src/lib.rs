//! Corescope turns DWARF debugging information into a queryable model of a
//! program's types, objects, and call-frame unwind rules.
//!
//! This crate is a facade over the individual `corescope-*` crates and can be
//! used in parts. The heavy lifting lives in [`dwarf`]; shared machine-level
//! types (platforms, registers, call-frame rules) live in [`common`].

#![warn(missing_docs)]

#[doc(inline)]
pub use corescope_common as common;
#[doc(inline)]
pub use corescope_dwarf as dwarf;
