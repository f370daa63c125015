//! Target platform and register model.
//!
//! A [`Platform`] describes the machine whose debug information is being
//! inspected: word size, byte order, and the architecture's register file.
//! Registers are identified by an *internal* register number that indexes a
//! per-architecture layout table; DWARF register numbers are translated
//! through [`Platform::dwarf_regno_to_internal`] so that consumers never
//! handle raw DWARF numbering.

use crate::bits::uint_max;
use crate::cfi::{CfiRow, CfiRule};

/// Internal register number, an index into the architecture's register
/// layout.
pub type RegisterNumber = u16;

/// Location of one register inside a register-state buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterLayout {
    /// Byte offset of the register in the buffer.
    pub offset: usize,
    /// Size of the register in bytes.
    pub size: usize,
}

/// Names for x86-64 registers in DWARF numbering.
static X86_64_REGISTERS: &[&str] = &[
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];

/// Names for AArch64 registers in DWARF numbering.
static AARCH64_REGISTERS: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "x29", "x30", "sp",
];

/// DWARF register numbers of the registers a function must preserve across
/// calls on x86-64 (System V ABI).
static X86_64_CALLEE_SAVED: &[RegisterNumber] = &[3, 6, 12, 13, 14, 15];

/// DWARF register numbers of the registers a function must preserve across
/// calls on AArch64 (AAPCS64), including the frame pointer, link register,
/// and stack pointer.
static AARCH64_CALLEE_SAVED: &[RegisterNumber] = &[
    19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29, 30, 31,
];

/// A supported CPU architecture.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum Arch {
    /// 64-bit x86.
    X86_64,
    /// 64-bit ARM.
    Aarch64,
}

impl Arch {
    fn registers(self) -> &'static [&'static str] {
        match self {
            Arch::X86_64 => X86_64_REGISTERS,
            Arch::Aarch64 => AARCH64_REGISTERS,
        }
    }

    fn callee_saved(self) -> &'static [RegisterNumber] {
        match self {
            Arch::X86_64 => X86_64_CALLEE_SAVED,
            Arch::Aarch64 => AARCH64_CALLEE_SAVED,
        }
    }
}

/// Description of the machine a module was compiled for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Platform {
    arch: Arch,
    little_endian: bool,
    address_size: u8,
}

impl Platform {
    /// Creates a platform description.
    pub fn new(arch: Arch, little_endian: bool, address_size: u8) -> Self {
        Platform {
            arch,
            little_endian,
            address_size,
        }
    }

    /// The little-endian x86-64 platform.
    pub fn x86_64() -> Self {
        Platform::new(Arch::X86_64, true, 8)
    }

    /// The little-endian AArch64 platform.
    pub fn aarch64() -> Self {
        Platform::new(Arch::Aarch64, true, 8)
    }

    /// Returns the architecture.
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Returns whether the platform is little-endian.
    pub fn is_little_endian(&self) -> bool {
        self.little_endian
    }

    /// Returns whether target and host byte order differ.
    pub fn bswap(&self) -> bool {
        self.little_endian != cfg!(target_endian = "little")
    }

    /// Returns the size of an address in bytes.
    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    /// Returns the mask covering all addressable bits.
    pub fn address_mask(&self) -> u64 {
        uint_max(self.address_size)
    }

    /// Returns the number of registers in the internal numbering.
    pub fn num_registers(&self) -> u16 {
        self.arch.registers().len() as u16
    }

    /// Translates a DWARF register number to an internal register number.
    ///
    /// Returns `None` for registers that are not part of the tracked
    /// register file (e.g. vector registers).
    pub fn dwarf_regno_to_internal(&self, dwarf_regno: u64) -> Option<RegisterNumber> {
        if dwarf_regno < u64::from(self.num_registers()) {
            Some(dwarf_regno as RegisterNumber)
        } else {
            None
        }
    }

    /// Returns the layout of a register inside a register-state buffer.
    pub fn register_layout(&self, regno: RegisterNumber) -> Option<RegisterLayout> {
        if regno < self.num_registers() {
            Some(RegisterLayout {
                offset: usize::from(regno) * 8,
                size: 8,
            })
        } else {
            None
        }
    }

    /// Returns the name of a register.
    pub fn register_name(&self, regno: RegisterNumber) -> Option<&'static str> {
        self.arch.registers().get(usize::from(regno)).copied()
    }

    /// Returns the unwind rules that hold before any call-frame information
    /// has been executed.
    ///
    /// Callee-saved registers of the architecture keep their value across a
    /// call; everything else, including the CFA, is undefined until CIE
    /// initial instructions define it.
    pub fn default_cfi_row(&self) -> CfiRow<'static> {
        let mut row = CfiRow::new();
        for &regno in self.arch.callee_saved() {
            row.set_register(regno, CfiRule::same_value(regno));
        }
        row
    }
}
