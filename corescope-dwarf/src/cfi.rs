//! Call frame information.
//!
//! `.debug_frame` and `.eh_frame` describe, for every program counter, how
//! to recover the caller's registers. Entries come in two kinds: CIEs carry
//! per-function-group defaults (alignment factors, the return-address
//! register, initial unwind rules), FDEs cover one address range each and
//! refine the CIE's rules with a small instruction stream.
//!
//! Both sections are parsed together; FDEs are sorted by initial location
//! and deduplicated with `.debug_frame` preferred over `.eh_frame`, so one
//! PC lies in at most one FDE. The table is built lazily on the first
//! lookup in a module and cached; a parse failure fails every CFI lookup in
//! the module, but type and object queries are unaffected.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use gimli::constants;

use corescope_common::{copy_lsbytes, uint_max, CfiRow, CfiRule, RegisterNumber, RegisterState};

use crate::buffer::Buffer;
use crate::error::{DwarfError, Result};
use crate::expr::{eval_dwarf_expression, ExprContext, MAX_DWARF_EXPR_OPS};
use crate::module::{ModuleDwarf, SectionId};
use crate::MemoryReader;

/// A parsed Common Information Entry.
pub(crate) struct Cie<'data> {
    /// Whether this CIE is from `.eh_frame`.
    is_eh: bool,
    /// Size of an address in this CIE in bytes.
    address_size: u8,
    /// `DW_EH_PE_*` encoding of addresses in this CIE.
    address_encoding: u8,
    /// Whether this CIE has a `z` augmentation.
    have_augmentation_length: bool,
    /// Whether this CIE is for a signal handler (`S` augmentation).
    signal_frame: bool,
    return_address_register: RegisterNumber,
    code_alignment_factor: u64,
    data_alignment_factor: i64,
    initial_instructions: &'data [u8],
}

/// A parsed Frame Description Entry.
pub(crate) struct Fde<'data> {
    cie: usize,
    initial_location: u64,
    address_range: u64,
    instructions: &'data [u8],
}

/// The per-module CFI table: interned CIEs plus sorted, deduplicated FDEs.
pub(crate) struct CfiTable<'data> {
    cies: Vec<Cie<'data>>,
    fdes: Vec<Fde<'data>>,
}

/// The result of a CFI lookup: the unwind rule row at the requested PC.
#[derive(Clone, Debug)]
pub struct DwarfCfi<'data> {
    /// Unwind rules for the caller's registers and the CFA.
    pub row: CfiRow<'data>,
    /// Whether the frame is a signal handler frame.
    pub signal_frame: bool,
    /// The register holding the return address.
    pub return_address_register: RegisterNumber,
}

/// Reads a `DW_EH_PE_*`-encoded pointer.
///
/// `func_addr` is the FDE's initial location, used by `DW_EH_PE_funcrel`.
fn read_encoded(
    buf: &mut Buffer<'_, '_>,
    module: &ModuleDwarf<'_>,
    address_size: u8,
    encoding: u8,
    func_addr: u64,
) -> Result<u64> {
    // DW_EH_PE_indirect is not currently used for CFI.
    if encoding & constants::DW_EH_PE_indirect.0 != 0 {
        return Err(buf.error(format!("unknown EH encoding {encoding:#x}")));
    }

    let pos = buf.pos() as u64;
    let base = match constants::DwEhPe(encoding & 0x70) {
        constants::DW_EH_PE_absptr => 0,
        constants::DW_EH_PE_pcrel => module.pcrel_base.wrapping_add(pos),
        constants::DW_EH_PE_textrel => module.textrel_base,
        constants::DW_EH_PE_datarel => module.datarel_base,
        // Relative to the FDE's initial location.
        constants::DW_EH_PE_funcrel => func_addr,
        constants::DW_EH_PE_aligned => {
            let align = usize::from(address_size);
            if buf.pos() % align != 0 {
                buf.skip(align - buf.pos() % align)?;
            }
            0
        }
        _ => return Err(buf.error(format!("unknown EH encoding {encoding:#x}"))),
    };

    let offset = match constants::DwEhPe(encoding & 0x0f) {
        constants::DW_EH_PE_absptr => buf.read_uint(address_size)?,
        constants::DW_EH_PE_uleb128 => buf.read_uleb128()?,
        constants::DW_EH_PE_udata2 => u64::from(buf.read_u16()?),
        constants::DW_EH_PE_udata4 => u64::from(buf.read_u32()?),
        constants::DW_EH_PE_udata8 => buf.read_u64()?,
        constants::DW_EH_PE_sleb128 => buf.read_sleb128()? as u64,
        constants::DW_EH_PE_sdata2 => buf.read_i16()? as u64,
        constants::DW_EH_PE_sdata4 => buf.read_i32()? as u64,
        constants::DW_EH_PE_sdata8 => buf.read_i64()? as u64,
        _ => return Err(buf.error(format!("unknown EH encoding {encoding:#x}"))),
    };

    Ok(base.wrapping_add(offset) & uint_max(address_size))
}

fn parse_cie<'data>(
    module: &ModuleDwarf<'data>,
    section: SectionId,
    cie_pointer: usize,
) -> Result<Cie<'data>> {
    let is_eh = section == SectionId::EhFrame;
    let mut buf = module.section_buffer(section)?;
    buf.set_pos(cie_pointer);

    let first = buf.read_u32()?;
    let is_64_bit = first == u32::MAX;
    let length = if is_64_bit {
        buf.read_u64()?
    } else {
        u64::from(first)
    };
    if length > buf.remaining() as u64 {
        return Err(buf.error("entry length is out of bounds"));
    }
    buf.set_end(buf.pos() + length as usize);

    let (cie_id, expected_cie_id) = if is_64_bit {
        (buf.read_u64()?, if is_eh { 0 } else { u64::MAX })
    } else {
        (
            u64::from(buf.read_u32()?),
            if is_eh { 0 } else { u64::from(u32::MAX) },
        )
    };
    if cie_id != expected_cie_id {
        return Err(buf.error("invalid CIE ID"));
    }

    let version = buf.read_u8()?;
    if version < 1 || version == 2 || version > 4 {
        return Err(buf.error(format!("unknown CIE version {version}")));
    }

    let augmentation = buf.read_string()?.to_vec();
    let have_augmentation_length = augmentation.first() == Some(&b'z');
    let mut signal_frame = false;
    for (i, &c) in augmentation.iter().enumerate() {
        let known = match c {
            b'z' => i == 0,
            b'L' | b'P' | b'R' => augmentation[0] == b'z',
            b'S' => {
                signal_frame = true;
                true
            }
            _ => false,
        };
        if !known {
            // We could ignore this CIE and all FDEs that reference it, or
            // skip the augmentation if we have its length, but fail loudly
            // instead so that we find out about missing support.
            return Err(buf.error(format!(
                "unknown CFI augmentation {}",
                String::from_utf8_lossy(&augmentation)
            )));
        }
    }

    let address_size = if version >= 4 {
        let address_size = buf.read_u8()?;
        if !(1..=8).contains(&address_size) {
            return Err(buf.error(format!("unsupported address size {address_size}")));
        }
        let segment_selector_size = buf.read_u8()?;
        if segment_selector_size != 0 {
            return Err(buf.error(format!(
                "unsupported segment selector size {segment_selector_size}"
            )));
        }
        address_size
    } else {
        module.platform().address_size()
    };

    let code_alignment_factor = buf.read_uleb128()?;
    let data_alignment_factor = buf.read_sleb128()?;
    let return_address_register = if version >= 3 {
        buf.read_uleb128()?
    } else {
        u64::from(buf.read_u8()?)
    };
    let return_address_register = module
        .platform()
        .dwarf_regno_to_internal(return_address_register)
        .ok_or_else(|| buf.error("unknown return address register"))?;

    let mut address_encoding = constants::DW_EH_PE_absptr.0;
    if have_augmentation_length {
        for &c in &augmentation {
            match c {
                b'z' => buf.skip_leb128()?,
                b'L' => buf.skip(1)?,
                b'P' => {
                    // The personality routine is not needed; decode and
                    // discard it without dereferencing.
                    let encoding = buf.read_u8()? & !constants::DW_EH_PE_indirect.0;
                    read_encoded(&mut buf, module, address_size, encoding, 0)?;
                }
                b'R' => address_encoding = buf.read_u8()?,
                _ => {}
            }
        }
    }

    let remaining = buf.remaining();
    let initial_instructions = buf.read_block(remaining)?;
    Ok(Cie {
        is_eh,
        address_size,
        address_encoding,
        have_augmentation_length,
        signal_frame,
        return_address_register,
        code_alignment_factor,
        data_alignment_factor,
        initial_instructions,
    })
}

fn parse_frames_section<'data>(
    module: &ModuleDwarf<'data>,
    section: SectionId,
    cies: &mut Vec<Cie<'data>>,
    fdes: &mut Vec<Fde<'data>>,
) -> Result<()> {
    let is_eh = section == SectionId::EhFrame;
    if !module.has_section(section) {
        return Ok(());
    }
    let mut buf = module.section_buffer(section)?;
    let section_end = buf.end();

    let mut cie_map: HashMap<usize, usize> = HashMap::new();
    while buf.has_next() {
        let first = buf.read_u32()?;
        let is_64_bit = first == u32::MAX;
        let length = if is_64_bit {
            buf.read_u64()?
        } else {
            u64::from(first)
        };
        // Technically, a length of zero is only a terminator in .eh_frame,
        // but other consumers (binutils, elfutils, GDB) treat .debug_frame
        // the same way.
        if length == 0 {
            break;
        }
        if length > buf.remaining() as u64 {
            return Err(buf.error("entry length is out of bounds"));
        }
        let entry_end = buf.pos() + length as usize;
        buf.set_end(entry_end);

        // The LSB Core Specification states that the CIE ID in .eh_frame is
        // always 4 bytes, but other consumers treat it like .debug_frame
        // (8 bytes in the 64-bit format).
        let (cie_pointer, cie_id) = if is_64_bit {
            (buf.read_u64()?, if is_eh { 0 } else { u64::MAX })
        } else {
            (
                u64::from(buf.read_u32()?),
                if is_eh { 0 } else { u64::from(u32::MAX) },
            )
        };

        if cie_pointer != cie_id {
            // This is an FDE; find its CIE. In .eh_frame the pointer is
            // relative to its own field, in .debug_frame it is absolute.
            let cie_offset = if is_eh {
                let pointer_offset = buf.pos() - if is_64_bit { 8 } else { 4 };
                if cie_pointer > pointer_offset as u64 {
                    return Err(buf.error("CIE pointer is out of bounds"));
                }
                pointer_offset - cie_pointer as usize
            } else {
                if cie_pointer > section_end as u64 {
                    return Err(buf.error("CIE pointer is out of bounds"));
                }
                cie_pointer as usize
            };

            let cie_index = match cie_map.entry(cie_offset) {
                Entry::Occupied(entry) => *entry.get(),
                Entry::Vacant(entry) => {
                    let index = cies.len();
                    cies.push(parse_cie(module, section, cie_offset)?);
                    entry.insert(index);
                    index
                }
            };
            let (address_size, address_encoding, have_augmentation_length) = {
                let cie = &cies[cie_index];
                (
                    cie.address_size,
                    cie.address_encoding,
                    cie.have_augmentation_length,
                )
            };

            let initial_location =
                read_encoded(&mut buf, module, address_size, address_encoding, 0)?;
            let address_range =
                read_encoded(&mut buf, module, address_size, address_encoding & 0x0f, 0)?;
            if have_augmentation_length {
                let augmentation_length = buf.read_uleb128()?;
                if augmentation_length > buf.remaining() as u64 {
                    return Err(buf.error("augmentation length is out of bounds"));
                }
                buf.skip(augmentation_length as usize)?;
            }
            let remaining = buf.remaining();
            let instructions = buf.read_block(remaining)?;
            fdes.push(Fde {
                cie: cie_index,
                initial_location,
                address_range,
                instructions,
            });
        }

        buf.set_end(section_end);
        buf.set_pos(entry_end);
    }
    Ok(())
}

/// Parses `.debug_frame` and `.eh_frame` into one sorted FDE table.
pub(crate) fn parse_frames<'data>(module: &ModuleDwarf<'data>) -> Result<CfiTable<'data>> {
    let mut cies = Vec::new();
    let mut fdes = Vec::new();
    parse_frames_section(module, SectionId::DebugFrame, &mut cies, &mut fdes)?;
    parse_frames_section(module, SectionId::EhFrame, &mut cies, &mut fdes)?;

    // Sort FDEs and remove duplicates, preferring .debug_frame over
    // .eh_frame. The lists are nearly sorted already.
    dmsort::sort_by_key(&mut fdes, |fde| (fde.initial_location, cies[fde.cie].is_eh));
    fdes.dedup_by_key(|fde| fde.initial_location);

    Ok(CfiTable { cies, fdes })
}

/// Binary-searches the FDE containing `unbiased_pc`.
fn find_fde<'t, 'data>(table: &'t CfiTable<'data>, unbiased_pc: u64) -> Option<&'t Fde<'data>> {
    let mut lo = 0;
    let mut hi = table.fdes.len();
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        let fde = &table.fdes[mid];
        if unbiased_pc < fde.initial_location {
            hi = mid;
        } else if unbiased_pc - fde.initial_location >= fde.address_range {
            lo = mid + 1;
        } else {
            return Some(fde);
        }
    }
    None
}

fn read_cfi_offset(buf: &mut Buffer<'_, '_>) -> Result<i64> {
    let offset = buf.read_uleb128()?;
    i64::try_from(offset).map_err(|_| buf.error("offset is too large"))
}

fn read_cfi_offset_f(buf: &mut Buffer<'_, '_>, cie: &Cie<'_>) -> Result<i64> {
    let factored = buf.read_uleb128()?;
    let offset = i128::from(factored) * i128::from(cie.data_alignment_factor);
    i64::try_from(offset).map_err(|_| buf.error("offset is too large"))
}

fn read_cfi_offset_sf(buf: &mut Buffer<'_, '_>, cie: &Cie<'_>) -> Result<i64> {
    let factored = buf.read_sleb128()?;
    let offset = i128::from(factored) * i128::from(cie.data_alignment_factor);
    i64::try_from(offset).map_err(|_| buf.error("offset is too large"))
}

fn read_cfi_block<'data>(buf: &mut Buffer<'_, 'data>) -> Result<&'data [u8]> {
    let size = buf.read_uleb128()?;
    if size > buf.remaining() as u64 {
        return Err(buf.error("block is out of bounds"));
    }
    buf.read_block(size as usize)
}

/// Executes one CFI instruction stream against `row`, stopping as soon as
/// the current location advances past `target`.
///
/// For the CIE's initial instructions `initial_row` is `None`; location
/// advance and restore opcodes are illegal there.
fn eval_cfi<'data>(
    module: &ModuleDwarf<'data>,
    cie: &Cie<'data>,
    fde: &Fde<'data>,
    initial_row: Option<&CfiRow<'data>>,
    target: u64,
    instructions: &'data [u8],
    row: &mut CfiRow<'data>,
) -> Result<()> {
    let platform = *module.platform();
    let mut pc = fde.initial_location;
    let mut state_stack: Vec<CfiRow<'data>> = Vec::new();

    // Position the buffer inside the owning section rather than over the
    // instruction slice alone: encoded pointers in DW_CFA_set_loc are
    // relative to section offsets.
    let section = if cie.is_eh {
        SectionId::EhFrame
    } else {
        SectionId::DebugFrame
    };
    let mut buf = module.section_buffer(section)?;
    let (located, start) = module.locate(instructions).ok_or_else(|| {
        module.missing_section_error("CFI instructions are not in their section")
    })?;
    debug_assert_eq!(located, section);
    buf.set_end(start + instructions.len());
    buf.set_pos(start);

    let invalid_for_initial = |buf: &Buffer<'_, '_>, opcode: u8| {
        buf.error(format!("invalid initial DWARF CFI opcode {opcode:#x}"))
    };

    while buf.has_next() {
        let opcode = buf.read_u8()?;
        let primary = opcode & 0xc0;
        let instruction = if primary != 0 {
            constants::DwCfa(primary)
        } else {
            constants::DwCfa(opcode)
        };

        match instruction {
            constants::DW_CFA_set_loc => {
                if initial_row.is_none() {
                    return Err(invalid_for_initial(&buf, opcode));
                }
                let loc = read_encoded(
                    &mut buf,
                    module,
                    cie.address_size,
                    cie.address_encoding,
                    fde.initial_location,
                )?;
                if loc <= pc {
                    return Err(buf.error(
                        "DW_CFA_set_loc location is not greater than current location",
                    ));
                }
                pc = loc;
                if pc > target {
                    break;
                }
            }
            constants::DW_CFA_advance_loc
            | constants::DW_CFA_advance_loc1
            | constants::DW_CFA_advance_loc2
            | constants::DW_CFA_advance_loc4 => {
                if initial_row.is_none() {
                    return Err(invalid_for_initial(&buf, opcode));
                }
                let delta = match instruction {
                    constants::DW_CFA_advance_loc => u64::from(opcode & 0x3f),
                    constants::DW_CFA_advance_loc1 => u64::from(buf.read_u8()?),
                    constants::DW_CFA_advance_loc2 => u64::from(buf.read_u16()?),
                    _ => u64::from(buf.read_u32()?),
                };
                pc = delta
                    .checked_mul(cie.code_alignment_factor)
                    .and_then(|delta| pc.checked_add(delta))
                    .filter(|&pc| pc <= uint_max(cie.address_size))
                    .ok_or(DwarfError::Overflow("DW_CFA_advance_loc* overflows location"))?;
                if pc > target {
                    break;
                }
            }
            constants::DW_CFA_def_cfa | constants::DW_CFA_def_cfa_sf => {
                let dwarf_regno = buf.read_uleb128()?;
                let offset = if instruction == constants::DW_CFA_def_cfa {
                    read_cfi_offset(&mut buf)?
                } else {
                    read_cfi_offset_sf(&mut buf, cie)?
                };
                let rule = match platform.dwarf_regno_to_internal(dwarf_regno) {
                    Some(regno) => CfiRule::RegisterPlusOffset { regno, offset },
                    None => CfiRule::Undefined,
                };
                row.set_cfa(rule);
            }
            constants::DW_CFA_def_cfa_register => {
                let CfiRule::RegisterPlusOffset { offset, .. } = row.cfa() else {
                    return Err(
                        buf.error("DW_CFA_def_cfa_register with incompatible CFA rule")
                    );
                };
                let dwarf_regno = buf.read_uleb128()?;
                let rule = match platform.dwarf_regno_to_internal(dwarf_regno) {
                    Some(regno) => CfiRule::RegisterPlusOffset { regno, offset },
                    None => CfiRule::Undefined,
                };
                row.set_cfa(rule);
            }
            constants::DW_CFA_def_cfa_offset | constants::DW_CFA_def_cfa_offset_sf => {
                let CfiRule::RegisterPlusOffset { regno, .. } = row.cfa() else {
                    return Err(buf.error(format!(
                        "{instruction} with incompatible CFA rule"
                    )));
                };
                let offset = if instruction == constants::DW_CFA_def_cfa_offset {
                    read_cfi_offset(&mut buf)?
                } else {
                    read_cfi_offset_sf(&mut buf, cie)?
                };
                row.set_cfa(CfiRule::RegisterPlusOffset { regno, offset });
            }
            constants::DW_CFA_def_cfa_expression => {
                let expr = read_cfi_block(&mut buf)?;
                row.set_cfa(CfiRule::DwarfExpression {
                    expr,
                    push_cfa: false,
                });
            }
            constants::DW_CFA_undefined => {
                let dwarf_regno = buf.read_uleb128()?;
                if let Some(regno) = platform.dwarf_regno_to_internal(dwarf_regno) {
                    row.set_register(regno, CfiRule::Undefined);
                }
            }
            constants::DW_CFA_same_value => {
                let dwarf_regno = buf.read_uleb128()?;
                if let Some(regno) = platform.dwarf_regno_to_internal(dwarf_regno) {
                    row.set_register(regno, CfiRule::same_value(regno));
                }
            }
            constants::DW_CFA_offset => {
                let offset = read_cfi_offset_f(&mut buf, cie)?;
                if let Some(regno) = platform.dwarf_regno_to_internal(u64::from(opcode & 0x3f)) {
                    row.set_register(regno, CfiRule::AtCfaPlusOffset { offset });
                }
            }
            constants::DW_CFA_offset_extended | constants::DW_CFA_val_offset => {
                let dwarf_regno = buf.read_uleb128()?;
                let offset = read_cfi_offset_f(&mut buf, cie)?;
                if let Some(regno) = platform.dwarf_regno_to_internal(dwarf_regno) {
                    let rule = if instruction == constants::DW_CFA_offset_extended {
                        CfiRule::AtCfaPlusOffset { offset }
                    } else {
                        CfiRule::CfaPlusOffset { offset }
                    };
                    row.set_register(regno, rule);
                }
            }
            constants::DW_CFA_offset_extended_sf | constants::DW_CFA_val_offset_sf => {
                let dwarf_regno = buf.read_uleb128()?;
                let offset = read_cfi_offset_sf(&mut buf, cie)?;
                if let Some(regno) = platform.dwarf_regno_to_internal(dwarf_regno) {
                    let rule = if instruction == constants::DW_CFA_offset_extended_sf {
                        CfiRule::AtCfaPlusOffset { offset }
                    } else {
                        CfiRule::CfaPlusOffset { offset }
                    };
                    row.set_register(regno, rule);
                }
            }
            constants::DW_CFA_register => {
                let dwarf_regno = buf.read_uleb128()?;
                let dwarf_regno2 = buf.read_uleb128()?;
                if let Some(regno) = platform.dwarf_regno_to_internal(dwarf_regno) {
                    let rule = match platform.dwarf_regno_to_internal(dwarf_regno2) {
                        Some(regno2) => CfiRule::RegisterPlusOffset {
                            regno: regno2,
                            offset: 0,
                        },
                        None => CfiRule::Undefined,
                    };
                    row.set_register(regno, rule);
                }
            }
            constants::DW_CFA_expression | constants::DW_CFA_val_expression => {
                let dwarf_regno = buf.read_uleb128()?;
                let expr = read_cfi_block(&mut buf)?;
                if let Some(regno) = platform.dwarf_regno_to_internal(dwarf_regno) {
                    let rule = if instruction == constants::DW_CFA_expression {
                        CfiRule::AtDwarfExpression {
                            expr,
                            push_cfa: true,
                        }
                    } else {
                        CfiRule::DwarfExpression {
                            expr,
                            push_cfa: true,
                        }
                    };
                    row.set_register(regno, rule);
                }
            }
            constants::DW_CFA_restore | constants::DW_CFA_restore_extended => {
                let Some(initial_row) = initial_row else {
                    return Err(invalid_for_initial(&buf, opcode));
                };
                let dwarf_regno = if instruction == constants::DW_CFA_restore {
                    u64::from(opcode & 0x3f)
                } else {
                    buf.read_uleb128()?
                };
                if let Some(regno) = platform.dwarf_regno_to_internal(dwarf_regno) {
                    row.set_register(regno, initial_row.register(regno));
                }
            }
            constants::DW_CFA_remember_state => {
                state_stack.push(row.clone());
            }
            constants::DW_CFA_restore_state => {
                let state = state_stack
                    .pop()
                    .ok_or_else(|| buf.error("DW_CFA_restore_state with empty state stack"))?;
                *row = state;
            }
            constants::DW_CFA_nop => {}
            _ => {
                return Err(buf.error(format!("unknown DWARF CFI opcode {opcode:#x}")));
            }
        }
    }
    Ok(())
}

fn find_cfi_in_fde<'data>(
    module: &ModuleDwarf<'data>,
    table: &CfiTable<'data>,
    fde: &Fde<'data>,
    unbiased_pc: u64,
) -> Result<CfiRow<'data>> {
    let cie = &table.cies[fde.cie];
    let mut initial_row: CfiRow<'data> = module.platform().default_cfi_row();
    eval_cfi(
        module,
        cie,
        fde,
        None,
        unbiased_pc,
        cie.initial_instructions,
        &mut initial_row,
    )?;
    let mut row = initial_row.clone();
    eval_cfi(
        module,
        cie,
        fde,
        Some(&initial_row),
        unbiased_pc,
        fde.instructions,
        &mut row,
    )?;
    Ok(row)
}

impl<'data> ModuleDwarf<'data> {
    /// Finds the call-frame unwind rules for an (unbiased) program counter.
    ///
    /// The CFI table is parsed on the first call and cached. Returns
    /// [`DwarfError::NotFound`] when no FDE covers `unbiased_pc`.
    pub fn find_dwarf_cfi(&self, unbiased_pc: u64) -> Result<DwarfCfi<'data>> {
        let table = self.cfi.borrow_with(|| parse_frames(self));
        let table = table.as_ref().map_err(|err| err.clone())?;
        let fde = find_fde(table, unbiased_pc).ok_or(DwarfError::NotFound)?;
        let row = find_cfi_in_fde(self, table, fde, unbiased_pc)?;
        let cie = &table.cies[fde.cie];
        Ok(DwarfCfi {
            row,
            signal_frame: cie.signal_frame,
            return_address_register: cie.return_address_register,
        })
    }
}

/// Evaluates a `DwarfExpression` or `AtDwarfExpression` CFI rule into
/// `buf`.
///
/// For an `AtDwarfExpression` rule the expression's result is an address
/// from which `buf.len()` bytes are read; for a `DwarfExpression` rule the
/// result itself is written to `buf` in target byte order.
pub fn eval_dwarf_cfi_rule<'data>(
    module: &ModuleDwarf<'data>,
    rule: &CfiRule<'data>,
    regs: &RegisterState,
    mem: &dyn MemoryReader,
    buf: &mut [u8],
) -> Result<()> {
    let (expr, push_cfa, indirect) = match *rule {
        CfiRule::DwarfExpression { expr, push_cfa } => (expr, push_cfa, false),
        CfiRule::AtDwarfExpression { expr, push_cfa } => (expr, push_cfa, true),
        _ => {
            return Err(DwarfError::Other(
                "CFI rule is not a DWARF expression".to_owned(),
            ))
        }
    };

    let mut stack = Vec::new();
    if push_cfa {
        stack.push(regs.cfa().ok_or(DwarfError::NotFound)?);
    }

    let mut remaining_ops = MAX_DWARF_EXPR_OPS;
    let mut ctx = ExprContext::new(module, None, None, Some(regs), mem, expr)?;
    eval_dwarf_expression(&mut ctx, &mut stack, &mut remaining_ops)?;
    if ctx.buf.has_next() {
        let opcode = ctx.buf.read_u8()?;
        return Err(ctx
            .buf
            .error(format!("invalid opcode {opcode:#x} for CFI expression")));
    }
    let top = *stack.last().ok_or(DwarfError::NotFound)?;
    if indirect {
        mem.read(buf, top, false)
    } else {
        copy_lsbytes(buf, module.is_little_endian(), &top.to_le_bytes(), true);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use gimli::constants::*;
    use similar_asserts::assert_eq;

    use crate::testutil::{test_module, TestFile, TestMemory};

    fn entry(id: u32, body: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&((body.len() + 4) as u32).to_le_bytes());
        bytes.extend_from_slice(&id.to_le_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    /// A version 3 CIE with no augmentation, code alignment 1, data
    /// alignment -8, and return address register 16.
    fn cie_v3(initial_instructions: &[u8]) -> Vec<u8> {
        let mut body = vec![3, 0, 1, 0x78, 16];
        body.extend_from_slice(initial_instructions);
        body
    }

    fn debug_frame_cie(initial_instructions: &[u8]) -> Vec<u8> {
        entry(u32::MAX, &cie_v3(initial_instructions))
    }

    fn debug_frame_fde(
        cie_offset: u32,
        initial_location: u64,
        address_range: u64,
        instructions: &[u8],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&initial_location.to_le_bytes());
        body.extend_from_slice(&address_range.to_le_bytes());
        body.extend_from_slice(instructions);
        entry(cie_offset, &body)
    }

    fn debug_frame_module(
        initial_instructions: &[u8],
        initial_location: u64,
        address_range: u64,
        instructions: &[u8],
    ) -> TestFile {
        let mut section = debug_frame_cie(initial_instructions);
        section.extend_from_slice(&debug_frame_fde(
            0,
            initial_location,
            address_range,
            instructions,
        ));
        let mut file = TestFile::new(8);
        file.add_section(SectionId::DebugFrame, 0, section);
        file
    }

    // CIE initial: def_cfa(rsp, 8); offset(rip, cfa - 8).
    const INITIAL: &[u8] = &[0x0c, 7, 8, 0x80 | 16, 1];

    #[test]
    fn test_row_for_pc() {
        // FDE: advance_loc(4); def_cfa_offset(16).
        let file = debug_frame_module(INITIAL, 0x1000, 0x100, &[0x40 | 4, 0x0e, 16]);
        let module = test_module(&file);

        let cfi = module.find_dwarf_cfi(0x1003).unwrap();
        assert_eq!(
            cfi.row.cfa(),
            CfiRule::RegisterPlusOffset {
                regno: 7,
                offset: 8
            }
        );
        assert_eq!(cfi.row.register(16), CfiRule::AtCfaPlusOffset { offset: -8 });
        assert_eq!(cfi.return_address_register, 16);
        assert!(!cfi.signal_frame);

        let cfi = module.find_dwarf_cfi(0x100a).unwrap();
        assert_eq!(
            cfi.row.cfa(),
            CfiRule::RegisterPlusOffset {
                regno: 7,
                offset: 16
            }
        );
        assert_eq!(cfi.row.register(16), CfiRule::AtCfaPlusOffset { offset: -8 });
    }

    #[test]
    fn test_pc_outside_every_fde() {
        let file = debug_frame_module(INITIAL, 0x1000, 0x100, &[]);
        let module = test_module(&file);
        assert_eq!(module.find_dwarf_cfi(0x1100).unwrap_err(), DwarfError::NotFound);
        assert_eq!(module.find_dwarf_cfi(0xfff).unwrap_err(), DwarfError::NotFound);
    }

    #[test]
    fn test_default_row_keeps_callee_saved() {
        let file = debug_frame_module(INITIAL, 0x1000, 0x100, &[]);
        let module = test_module(&file);
        let cfi = module.find_dwarf_cfi(0x1000).unwrap();
        // rbx is callee-saved and untouched by the CIE.
        assert_eq!(cfi.row.register(3), CfiRule::same_value(3));
        assert_eq!(cfi.row.register(0), CfiRule::Undefined);
    }

    #[test]
    fn test_remember_restore_state() {
        // advance 2; remember; def_cfa_offset 32; advance 2; restore_state;
        // advance 2.
        let instructions = [
            0x40 | 2,
            DW_CFA_remember_state.0,
            0x0e,
            32,
            0x40 | 2,
            DW_CFA_restore_state.0,
            0x40 | 2,
        ];
        let file = debug_frame_module(INITIAL, 0x1000, 0x100, &instructions);
        let module = test_module(&file);

        // Between the two advances the CFA offset is 32.
        let cfi = module.find_dwarf_cfi(0x1003).unwrap();
        assert_eq!(
            cfi.row.cfa(),
            CfiRule::RegisterPlusOffset {
                regno: 7,
                offset: 32
            }
        );
        // After restore_state the original rule is back.
        let cfi = module.find_dwarf_cfi(0x1005).unwrap();
        assert_eq!(
            cfi.row.cfa(),
            CfiRule::RegisterPlusOffset {
                regno: 7,
                offset: 8
            }
        );
    }

    #[test]
    fn test_restore_copies_initial_rule() {
        // Change rip's rule, then restore it past an advance.
        let instructions = [
            DW_CFA_undefined.0,
            16,
            0x40 | 2,
            0xc0 | 16, // DW_CFA_restore rip
            0x40 | 2,
        ];
        let file = debug_frame_module(INITIAL, 0x1000, 0x100, &instructions);
        let module = test_module(&file);

        let cfi = module.find_dwarf_cfi(0x1001).unwrap();
        assert_eq!(cfi.row.register(16), CfiRule::Undefined);
        let cfi = module.find_dwarf_cfi(0x1003).unwrap();
        assert_eq!(cfi.row.register(16), CfiRule::AtCfaPlusOffset { offset: -8 });
    }

    #[test]
    fn test_def_cfa_register_requires_register_rule() {
        // CIE defines the CFA with an expression; def_cfa_register must be
        // rejected rather than silently losing the offset.
        let initial = [DW_CFA_def_cfa_expression.0, 1, DW_OP_lit0.0];
        let file = debug_frame_module(&initial, 0x1000, 0x100, &[0x0d, 7]);
        let module = test_module(&file);
        assert!(module.find_dwarf_cfi(0x1000).is_err());
    }

    #[test]
    fn test_advance_in_initial_instructions_is_invalid() {
        let file = debug_frame_module(&[0x40 | 1], 0x1000, 0x100, &[]);
        let module = test_module(&file);
        assert!(module.find_dwarf_cfi(0x1000).is_err());
    }

    #[test]
    fn test_unknown_augmentation_is_loud() {
        let mut body = vec![3];
        body.extend_from_slice(b"zQ\0");
        body.extend_from_slice(&[1, 0x78, 16]);
        let mut section = entry(u32::MAX, &body);
        section.extend_from_slice(&debug_frame_fde(0, 0x1000, 0x100, &[]));
        let mut file = TestFile::new(8);
        file.add_section(SectionId::DebugFrame, 0, section);
        let module = test_module(&file);
        assert!(module.find_dwarf_cfi(0x1000).is_err());
    }

    #[test]
    fn test_cie_version_2_rejected() {
        let mut body = vec![2, 0, 1, 0x78, 16];
        body.extend_from_slice(INITIAL);
        let mut section = entry(u32::MAX, &body);
        section.extend_from_slice(&debug_frame_fde(0, 0x1000, 0x100, &[]));
        let mut file = TestFile::new(8);
        file.add_section(SectionId::DebugFrame, 0, section);
        let module = test_module(&file);
        assert!(module.find_dwarf_cfi(0x1000).is_err());
    }

    #[test]
    fn test_signal_frame_augmentation() {
        // Version 3, augmentation "zS", augmentation data length 0.
        let mut body = vec![3];
        body.extend_from_slice(b"zS\0");
        body.extend_from_slice(&[1, 0x78, 16, 0]);
        body.extend_from_slice(INITIAL);
        let mut section = entry(u32::MAX, &body);
        // The FDE of a 'z' CIE carries an augmentation length too.
        let mut fde_body = Vec::new();
        fde_body.extend_from_slice(&0x1000u64.to_le_bytes());
        fde_body.extend_from_slice(&0x100u64.to_le_bytes());
        fde_body.push(0);
        section.extend_from_slice(&entry(0, &fde_body));
        let mut file = TestFile::new(8);
        file.add_section(SectionId::DebugFrame, 0, section);
        let module = test_module(&file);

        let cfi = module.find_dwarf_cfi(0x1000).unwrap();
        assert!(cfi.signal_frame);
    }

    #[test]
    fn test_debug_frame_preferred_over_eh_frame() {
        // The same PC is covered by both sections with different CFA
        // offsets; .debug_frame wins.
        let file = {
            let mut file = TestFile::new(8);
            let mut debug_frame = debug_frame_cie(INITIAL);
            debug_frame.extend_from_slice(&debug_frame_fde(0, 0x1000, 0x100, &[]));
            file.add_section(SectionId::DebugFrame, 0, debug_frame);

            // .eh_frame: CIE id 0; CFA offset 24 instead of 8.
            let eh_initial: &[u8] = &[0x0c, 7, 24, 0x80 | 16, 1];
            let mut eh_frame = entry(0, &cie_v3(eh_initial));
            let fde_offset = eh_frame.len();
            let mut fde_body = Vec::new();
            fde_body.extend_from_slice(&0x1000u64.to_le_bytes());
            fde_body.extend_from_slice(&0x100u64.to_le_bytes());
            // The CIE pointer is relative to its own field.
            eh_frame.extend_from_slice(&entry((fde_offset + 4) as u32, &fde_body));
            file.add_section(SectionId::EhFrame, 0, eh_frame);
            file
        };
        let module = test_module(&file);

        let cfi = module.find_dwarf_cfi(0x1080).unwrap();
        assert_eq!(
            cfi.row.cfa(),
            CfiRule::RegisterPlusOffset {
                regno: 7,
                offset: 8
            }
        );
    }

    #[test]
    fn test_eh_frame_pcrel_encoding() {
        // Version 3 CIE with a "zR" augmentation selecting
        // pcrel | sdata4 FDE addresses.
        let mut body = vec![3];
        body.extend_from_slice(b"zR\0");
        body.extend_from_slice(&[1, 0x78, 16]);
        body.push(1); // augmentation data length
        body.push(
            DW_EH_PE_pcrel.0 | DW_EH_PE_sdata4.0,
        );
        body.extend_from_slice(INITIAL);
        let mut eh_frame = entry(0, &body);

        let fde_offset = eh_frame.len();
        let mut fde_body = Vec::new();
        // initial_location field lives at fde_offset + 8; the section is
        // loaded at 0x7000. Encode 0x8000 as a PC-relative value.
        let field_address = 0x7000u64 + fde_offset as u64 + 8;
        fde_body.extend_from_slice(&((0x8000i64 - field_address as i64) as i32).to_le_bytes());
        fde_body.extend_from_slice(&0x100i32.to_le_bytes());
        fde_body.push(0); // augmentation data length
        eh_frame.extend_from_slice(&entry((fde_offset + 4) as u32, &fde_body));

        let mut file = TestFile::new(8);
        file.add_section(SectionId::EhFrame, 0x7000, eh_frame);
        let module = test_module(&file);

        let cfi = module.find_dwarf_cfi(0x8010).unwrap();
        assert_eq!(
            cfi.row.cfa(),
            CfiRule::RegisterPlusOffset {
                regno: 7,
                offset: 8
            }
        );
        assert!(module.find_dwarf_cfi(0x7fff).is_err());
    }

    #[test]
    fn test_eval_cfi_expression_rule() {
        // CFA + 8, written directly.
        let expr = [DW_OP_plus_uconst.0, 8];
        let file = TestFile::new(8);
        let module = test_module(&file);
        let mut regs = RegisterState::new(*module.platform());
        regs.set_cfa(0x5000);
        let mem = TestMemory::default();

        let rule = CfiRule::DwarfExpression {
            expr: &expr,
            push_cfa: true,
        };
        let mut out = [0u8; 8];
        eval_dwarf_cfi_rule(&module, &rule, &regs, &mem, &mut out).unwrap();
        assert_eq!(u64::from_le_bytes(out), 0x5008);
    }

    #[test]
    fn test_eval_cfi_at_expression_rule() {
        let expr = [DW_OP_plus_uconst.0, 8];
        let file = TestFile::new(8);
        let module = test_module(&file);
        let mut regs = RegisterState::new(*module.platform());
        regs.set_cfa(0x5000);
        let mut mem = TestMemory::default();
        mem.insert(0x5008, 0xfeed_faceu64.to_le_bytes().to_vec());

        let rule = CfiRule::AtDwarfExpression {
            expr: &expr,
            push_cfa: true,
        };
        let mut out = [0u8; 8];
        eval_dwarf_cfi_rule(&module, &rule, &regs, &mem, &mut out).unwrap();
        assert_eq!(u64::from_le_bytes(out), 0xfeed_face);
    }

    #[test]
    fn test_location_description_rejected_in_cfi_expression() {
        let expr = [DW_OP_reg0.0];
        let file = TestFile::new(8);
        let module = test_module(&file);
        let mut regs = RegisterState::new(*module.platform());
        regs.set_cfa(0x5000);
        let mem = TestMemory::default();

        let rule = CfiRule::DwarfExpression {
            expr: &expr,
            push_cfa: true,
        };
        let mut out = [0u8; 8];
        assert!(eval_dwarf_cfi_rule(&module, &rule, &regs, &mem, &mut out).is_err());
    }

    #[test]
    fn test_missing_cfa_for_push_cfa_rule() {
        let expr = [DW_OP_lit0.0];
        let file = TestFile::new(8);
        let module = test_module(&file);
        let regs = RegisterState::new(*module.platform());
        let mem = TestMemory::default();

        let rule = CfiRule::DwarfExpression {
            expr: &expr,
            push_cfa: true,
        };
        let mut out = [0u8; 8];
        assert_eq!(
            eval_dwarf_cfi_rule(&module, &rule, &regs, &mem, &mut out).unwrap_err(),
            DwarfError::NotFound
        );
    }

    #[test]
    fn test_fde_sorting_and_lookup() {
        // Two FDEs emitted out of order.
        let mut section = debug_frame_cie(INITIAL);
        section.extend_from_slice(&debug_frame_fde(0, 0x2000, 0x100, &[]));
        section.extend_from_slice(&debug_frame_fde(0, 0x1000, 0x100, &[]));
        let mut file = TestFile::new(8);
        file.add_section(SectionId::DebugFrame, 0, section);
        let module = test_module(&file);

        assert!(module.find_dwarf_cfi(0x1010).is_ok());
        assert!(module.find_dwarf_cfi(0x2010).is_ok());
        assert!(module.find_dwarf_cfi(0x1810).is_err());
    }
}
