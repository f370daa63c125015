//! Register-state snapshots.

use crate::platform::{Platform, RegisterNumber};

/// An immutable snapshot of the register values of one stack frame.
///
/// Not every register has to be known: unwinding recovers registers rule by
/// rule, and location descriptions are expected to cope with partially known
/// state. Readers must therefore check [`RegisterState::has_register`]
/// before consuming a value.
#[derive(Clone, Debug)]
pub struct RegisterState {
    platform: Platform,
    buf: Vec<u8>,
    known: Vec<bool>,
    pc: Option<u64>,
    cfa: Option<u64>,
    interrupted: bool,
}

impl RegisterState {
    /// Creates an empty snapshot for a platform.
    pub fn new(platform: Platform) -> Self {
        let num = usize::from(platform.num_registers());
        RegisterState {
            platform,
            buf: vec![0; num * 8],
            known: vec![false; num],
            pc: None,
            cfa: None,
            interrupted: false,
        }
    }

    /// Returns the platform this snapshot belongs to.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Returns whether a register value is known.
    pub fn has_register(&self, regno: RegisterNumber) -> bool {
        self.known.get(usize::from(regno)).copied().unwrap_or(false)
    }

    /// Returns the raw bytes of a register, in target byte order.
    pub fn register_bytes(&self, regno: RegisterNumber) -> Option<&[u8]> {
        if !self.has_register(regno) {
            return None;
        }
        let layout = self.platform.register_layout(regno)?;
        Some(&self.buf[layout.offset..layout.offset + layout.size])
    }

    /// Stores a register value from raw bytes in target byte order.
    pub fn set_register_bytes(&mut self, regno: RegisterNumber, bytes: &[u8]) {
        if let Some(layout) = self.platform.register_layout(regno) {
            let n = layout.size.min(bytes.len());
            self.buf[layout.offset..layout.offset + n].copy_from_slice(&bytes[..n]);
            self.known[usize::from(regno)] = true;
        }
    }

    /// Stores a register value from a host integer.
    pub fn set_register(&mut self, regno: RegisterNumber, value: u64) {
        let bytes = if self.platform.is_little_endian() {
            value.to_le_bytes()
        } else {
            value.to_be_bytes()
        };
        self.set_register_bytes(regno, &bytes);
    }

    /// Returns the program counter, if known.
    pub fn pc(&self) -> Option<u64> {
        self.pc
    }

    /// Sets the program counter.
    pub fn set_pc(&mut self, pc: u64) {
        self.pc = Some(pc);
    }

    /// Returns the canonical frame address, if known.
    pub fn cfa(&self) -> Option<u64> {
        self.cfa
    }

    /// Sets the canonical frame address.
    pub fn set_cfa(&mut self, cfa: u64) {
        self.cfa = Some(cfa);
    }

    /// Returns whether this frame was interrupted (e.g. by a signal or trap)
    /// rather than stopped at a call.
    ///
    /// For a frame that is stopped at a call, the program counter is the
    /// return address, which points one past the call instruction; PC-based
    /// lookups must then use `pc - 1` to stay inside the caller.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Sets the interrupted flag.
    pub fn set_interrupted(&mut self, interrupted: bool) {
        self.interrupted = interrupted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_roundtrip() {
        let mut regs = RegisterState::new(Platform::x86_64());
        assert!(!regs.has_register(7));
        regs.set_register(7, 0x7fff_0000_1234);
        assert!(regs.has_register(7));
        assert_eq!(
            regs.register_bytes(7).unwrap(),
            &0x7fff_0000_1234u64.to_le_bytes()
        );
    }

    #[test]
    fn test_unknown_register() {
        let regs = RegisterState::new(Platform::x86_64());
        assert_eq!(regs.register_bytes(999), None);
    }
}
