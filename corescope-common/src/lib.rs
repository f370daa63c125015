//! Common machine-level functionality for `corescope`.
//!
//! This crate exposes the pieces of a debugging session that are about the
//! *target machine* rather than about any particular debug-information
//! format:
//!
//!  - [`Platform`] and [`Arch`]: word size, byte order, and the register
//!    model of the architecture being inspected.
//!  - [`CfiRow`] and [`CfiRule`]: the per-register unwind rules produced by
//!    call-frame information.
//!  - [`RegisterState`]: an immutable snapshot of register values for one
//!    stack frame.
//!  - Bit- and byte-level copy helpers used when moving values between
//!    target memory, registers, and host integers.
//!
//! This crate is part of the `corescope` workspace.

#![warn(missing_docs)]

mod bits;
mod cfi;
mod platform;
mod regstate;
mod types;

pub use crate::bits::*;
pub use crate::cfi::*;
pub use crate::platform::*;
pub use crate::regstate::*;
pub use crate::types::*;
