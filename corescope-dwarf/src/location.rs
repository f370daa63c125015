//! Resolution of location attributes to DWARF expressions.
//!
//! A `DW_AT_location`-class attribute comes in three shapes: the expression
//! bytes inline (block and `exprloc` forms), an offset into the DWARF 4
//! `.debug_loc` section, or an offset or index into the DWARF 5
//! `.debug_loclists` section. The latter two are PC-indexed tables; this
//! module walks them and selects the expression active at the program
//! counter of the register snapshot.
//!
//! An empty expression is returned when the attribute has a location list
//! but no program counter is known, or when no list entry covers the PC;
//! downstream code reports the object as absent in that case.

use gimli::{constants, AttributeValue};

use corescope_common::RegisterState;

use crate::buffer::Buffer;
use crate::error::{DwarfError, Result};
use crate::expr::check_address_size;
use crate::module::{Die, ModuleDwarf, SectionId, Slice, UnitData};

/// Resolves a location-class attribute to the expression active at the
/// snapshot's program counter.
pub(crate) fn attr_location<'data>(
    die: Die<'_, 'data>,
    value: AttributeValue<Slice<'data>>,
    regs: Option<&RegisterState>,
) -> Result<&'data [u8]> {
    match value {
        AttributeValue::Exprloc(expr) => Ok(expr.0.slice()),
        AttributeValue::Block(block) => Ok(block.slice()),
        // DWARF 3 loclistptr.
        AttributeValue::Data4(offset) => location_list(die, u64::from(offset), regs),
        AttributeValue::Data8(offset) => location_list(die, offset, regs),
        // DWARF 4-5 sec_offset.
        AttributeValue::SecOffset(offset) => location_list(die, offset as u64, regs),
        AttributeValue::LocationListsRef(offset) => location_list(die, offset.0 as u64, regs),
        // DWARF 5 loclistx.
        AttributeValue::DebugLocListsIndex(index) => {
            let offset = read_loclistx(die.module, die.unit, index.0 as u64)?;
            location_list(die, offset, regs)
        }
        _ => Err(DwarfError::Other(
            "unsupported location attribute form".to_owned(),
        )),
    }
}

fn location_list<'data>(
    die: Die<'_, 'data>,
    offset: u64,
    regs: Option<&RegisterState>,
) -> Result<&'data [u8]> {
    let unit = die.unit;
    let module = die.module;
    check_address_size(unit.address_size)?;

    let pc = match regs.and_then(|regs| regs.pc()) {
        Some(pc) => pc,
        None => return Ok(&[]),
    };
    // For a frame stopped at a call, the PC is the return address, which may
    // already be in the next source statement; step back inside the call.
    let interrupted = regs.map_or(false, |regs| regs.interrupted());
    let pc = pc
        .wrapping_sub(u64::from(!interrupted))
        .wrapping_sub(module.bias());

    if unit.version >= 5 {
        dwarf5_location_list(module, Some(unit), offset, unit.address_size, pc)
    } else {
        dwarf4_location_list(module, offset, unit.low_pc, unit.address_size, pc)
    }
}

/// Resolves a `DW_FORM_loclistx` index through the `.debug_loclists` offset
/// table at `DW_AT_loclists_base`.
pub(crate) fn read_loclistx(
    module: &ModuleDwarf<'_>,
    unit: &UnitData<'_>,
    index: u64,
) -> Result<u64> {
    let base = match unit.unit.entry(unit.root_offset)?.attr_value(constants::DW_AT_loclists_base)?
    {
        Some(AttributeValue::DebugLocListsBase(base)) => base.0,
        Some(AttributeValue::SecOffset(offset)) => offset,
        Some(value) => match value.udata_value() {
            Some(offset) => offset as usize,
            None => {
                return Err(DwarfError::Other(
                    "invalid DW_AT_loclists_base".to_owned(),
                ))
            }
        },
        None => {
            return Err(DwarfError::Other(
                "DW_FORM_loclistx without DW_AT_loclists_base".to_owned(),
            ))
        }
    };

    let section = module.section(SectionId::DebugLoclists).ok_or_else(|| {
        module.missing_section_error("DW_FORM_loclistx without .debug_loclists section")
    })?;
    let data = section.data;
    if base > data.len() {
        return Err(module.missing_section_error("DW_AT_loclists_base is out of bounds"));
    }
    let offset_size = usize::from(unit.offset_size);
    debug_assert!(offset_size == 4 || offset_size == 8);
    if index >= ((data.len() - base) / offset_size) as u64 {
        return Err(module.missing_section_error("DW_FORM_loclistx is out of bounds"));
    }

    let mut buf = module.section_buffer(SectionId::DebugLoclists)?;
    buf.set_pos(base + index as usize * offset_size);
    let offset = if offset_size == 8 {
        buf.read_u64()?
    } else {
        u64::from(buf.read_u32()?)
    };
    Ok(base as u64 + offset)
}

/// Walks a DWARF 5 `.debug_loclists` list and selects the expression for
/// `pc`.
///
/// A `DW_LLE_default_location` entry applies only if no ranged entry covers
/// `pc`; the walker records it and keeps scanning.
pub(crate) fn dwarf5_location_list<'data>(
    module: &ModuleDwarf<'data>,
    unit: Option<&UnitData<'data>>,
    offset: u64,
    address_size: u8,
    pc: u64,
) -> Result<&'data [u8]> {
    if !module.has_section(SectionId::DebugLoclists) {
        return Err(module.missing_section_error("loclist without .debug_loclists section"));
    }
    let mut buf = module.section_buffer(SectionId::DebugLoclists)?;
    if offset > buf.remaining() as u64 {
        return Err(module.missing_section_error("loclist is out of bounds"));
    }
    buf.set_pos(offset as usize);

    let mut addr_base = None;
    let mut base = 0u64;
    let mut base_valid = false;
    // Unknown by default; may be overridden by DW_LLE_default_location.
    let mut default_expr: &'data [u8] = &[];

    fn list_addrx<'a, 'data>(
        buf: &mut Buffer<'a, 'data>,
        module: &'a ModuleDwarf<'data>,
        unit: Option<&'a UnitData<'data>>,
        address_size: u8,
        addr_base: &mut Option<usize>,
    ) -> Result<u64> {
        let unit = unit.ok_or_else(|| {
            DwarfError::Other("indirect address without compilation unit".to_owned())
        })?;
        read_addrx(buf, module, unit, address_size, addr_base)
    }

    loop {
        let kind = buf.read_u8()?;
        let range = match constants::DwLle(kind) {
            constants::DW_LLE_end_of_list => return Ok(default_expr),
            constants::DW_LLE_base_addressx => {
                base = list_addrx(&mut buf, module, unit, address_size, &mut addr_base)?;
                base_valid = true;
                None
            }
            constants::DW_LLE_startx_endx => {
                let start = list_addrx(&mut buf, module, unit, address_size, &mut addr_base)?;
                let end = list_addrx(&mut buf, module, unit, address_size, &mut addr_base)?;
                Some((start, end.wrapping_sub(start)))
            }
            constants::DW_LLE_startx_length => {
                let start = list_addrx(&mut buf, module, unit, address_size, &mut addr_base)?;
                let length = buf.read_uleb128()?;
                Some((start, length))
            }
            constants::DW_LLE_offset_pair => {
                let start = buf.read_uleb128()?;
                let end = buf.read_uleb128()?;
                if !base_valid {
                    let low_pc = unit.and_then(|unit| unit.low_pc).ok_or_else(|| {
                        module.missing_section_error("location list has no base address")
                    })?;
                    base = low_pc;
                    base_valid = true;
                }
                Some((base.wrapping_add(start), end.wrapping_sub(start)))
            }
            constants::DW_LLE_default_location => {
                let expr_size = buf.read_uleb128()?;
                if expr_size > buf.remaining() as u64 {
                    return Err(buf.error("location description size is out of bounds"));
                }
                default_expr = buf.read_block(expr_size as usize)?;
                None
            }
            constants::DW_LLE_base_address => {
                base = buf.read_uint(address_size)?;
                base_valid = true;
                None
            }
            constants::DW_LLE_start_end => {
                let start = buf.read_uint(address_size)?;
                let end = buf.read_uint(address_size)?;
                Some((start, end.wrapping_sub(start)))
            }
            constants::DW_LLE_start_length => {
                let start = buf.read_uint(address_size)?;
                let length = buf.read_uleb128()?;
                Some((start, length))
            }
            _ => {
                return Err(buf.error(format!("unknown location list entry kind {kind:#x}")));
            }
        };

        if let Some((start, length)) = range {
            let expr_size = buf.read_uleb128()?;
            if expr_size > buf.remaining() as u64 {
                return Err(buf.error("location description size is out of bounds"));
            }
            if pc >= start && pc - start < length {
                return buf.read_block(expr_size as usize);
            }
            buf.skip(expr_size as usize)?;
        }
    }
}

/// Walks a DWARF 4 `.debug_loc` list and selects the expression for `pc`.
pub(crate) fn dwarf4_location_list<'data>(
    module: &ModuleDwarf<'data>,
    offset: u64,
    cu_low_pc: Option<u64>,
    address_size: u8,
    pc: u64,
) -> Result<&'data [u8]> {
    if !module.has_section(SectionId::DebugLoc) {
        return Err(module.missing_section_error("loclistptr without .debug_loc section"));
    }
    let mut buf = module.section_buffer(SectionId::DebugLoc)?;
    if offset > buf.remaining() as u64 {
        return Err(module.missing_section_error("loclistptr is out of bounds"));
    }
    buf.set_pos(offset as usize);

    let address_max = corescope_common::uint_max(address_size);
    let mut base = 0u64;
    let mut base_valid = false;
    loop {
        let start = buf.read_uint(address_size)?;
        let end = buf.read_uint(address_size)?;
        if start == 0 && end == 0 {
            return Ok(&[]);
        } else if start == address_max {
            base = end;
            base_valid = true;
        } else {
            if !base_valid {
                base = cu_low_pc.ok_or_else(|| {
                    module.missing_section_error("location list has no base address")
                })?;
                base_valid = true;
            }
            let expr_size = buf.read_u16()?;
            if usize::from(expr_size) > buf.remaining() {
                return Err(buf.error("location description size is out of bounds"));
            }
            if base.wrapping_add(start) <= pc && pc < base.wrapping_add(end) {
                return buf.read_block(usize::from(expr_size));
            }
            buf.skip(usize::from(expr_size))?;
        }
    }
}

/// Reads an address out of `.debug_addr` by index, resolving
/// `DW_AT_addr_base` on first use.
///
/// The index itself is a ULEB128 read from `buf` (the shape used by
/// `DW_OP_addrx`, `DW_OP_constx`, and the `DW_LLE_*x` entry kinds).
pub(crate) fn read_addrx<'data>(
    buf: &mut Buffer<'_, 'data>,
    module: &ModuleDwarf<'data>,
    unit: &UnitData<'data>,
    address_size: u8,
    addr_base: &mut Option<usize>,
) -> Result<u64> {
    let base = match *addr_base {
        Some(base) => base,
        None => {
            let value = unit
                .unit
                .entry(unit.root_offset)?
                .attr_value(constants::DW_AT_addr_base)?;
            let base = match value {
                Some(AttributeValue::DebugAddrBase(base)) => base.0,
                Some(AttributeValue::SecOffset(offset)) => offset,
                Some(value) => match value.udata_value() {
                    Some(offset) => offset as usize,
                    None => {
                        return Err(DwarfError::Other("invalid DW_AT_addr_base".to_owned()))
                    }
                },
                None => {
                    return Err(DwarfError::Other(
                        "indirect address without DW_AT_addr_base".to_owned(),
                    ))
                }
            };
            let section = module.section(SectionId::DebugAddr).ok_or_else(|| {
                module.missing_section_error("indirect address without .debug_addr section")
            })?;
            if base > section.data.len() || base == 0 {
                return Err(module.missing_section_error("DW_AT_addr_base is out of bounds"));
            }
            // DW_AT_addr_base points past the header; the byte before it is
            // the segment selector size.
            let segment_selector_size = section.data[base - 1];
            if segment_selector_size != 0 {
                return Err(DwarfError::Other(format!(
                    "unsupported segment selector size {segment_selector_size}"
                )));
            }
            *addr_base = Some(base);
            base
        }
    };

    let index = buf.read_uleb128()?;
    let data = module
        .section(SectionId::DebugAddr)
        .expect("checked above")
        .data;
    if index >= ((data.len() - base) / usize::from(address_size)) as u64 {
        return Err(buf.error("address index is out of bounds"));
    }
    let start = base + index as usize * usize::from(address_size);
    let mut value = [0u8; 8];
    corescope_common::copy_lsbytes(
        &mut value,
        true,
        &data[start..start + usize::from(address_size)],
        module.is_little_endian(),
    );
    Ok(u64::from_le_bytes(value))
}
