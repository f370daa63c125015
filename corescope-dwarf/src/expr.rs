//! The DWARF expression stack machine.
//!
//! Location descriptions, frame bases, and call-frame rules all bottom out
//! in DWARF expressions. [`eval_dwarf_expression`] interprets one expression
//! against a module, an optional compilation-unit context, and an optional
//! register snapshot, stopping either at the end of the expression or just
//! before a location-description operation (`DW_OP_reg*`,
//! `DW_OP_implicit_value`, `DW_OP_stack_value`, `DW_OP_piece`,
//! `DW_OP_bit_piece`), which the caller interprets.
//!
//! Every result pushed by an arithmetic operation is masked to the context's
//! address size so that wrap-around matches the target's semantics. An
//! expression that consults a register whose value is not in the snapshot
//! fails with [`DwarfError::NotFound`], which callers render as an absent
//! object rather than an error.

use gimli::constants;

use corescope_common::{copy_lsbytes, truncate_signed, uint_max, RegisterState};

use crate::buffer::Buffer;
use crate::error::{DwarfError, Result};
use crate::location::{self, read_addrx};
use crate::module::{Die, ModuleDwarf, UnitData};
use crate::MemoryReader;

/// Limit on the number of operations executed in one expression, to bound
/// expressions with backward branches.
pub(crate) const MAX_DWARF_EXPR_OPS: i32 = 10_000;

const DW_OP_LIT0: u8 = constants::DW_OP_lit0.0;
const DW_OP_LIT31: u8 = constants::DW_OP_lit31.0;
const DW_OP_REG0: u8 = constants::DW_OP_reg0.0;
const DW_OP_REG31: u8 = constants::DW_OP_reg31.0;
const DW_OP_BREG0: u8 = constants::DW_OP_breg0.0;
const DW_OP_BREG31: u8 = constants::DW_OP_breg31.0;

/// A DWARF expression and the context it is evaluated in.
pub(crate) struct ExprContext<'a, 'data> {
    pub(crate) buf: Buffer<'a, 'data>,
    pub(crate) module: &'a ModuleDwarf<'data>,
    /// Compilation-unit context, required by `DW_OP_addrx`/`DW_OP_constx`.
    pub(crate) unit: Option<&'a UnitData<'data>>,
    /// Resolved `DW_AT_addr_base`, filled on first use.
    pub(crate) addr_base: Option<usize>,
    /// Enclosing subprogram, required by `DW_OP_fbreg`.
    pub(crate) function: Option<Die<'a, 'data>>,
    pub(crate) regs: Option<&'a RegisterState>,
    pub(crate) mem: &'a dyn MemoryReader,
    pub(crate) address_size: u8,
}

impl<'a, 'data> ExprContext<'a, 'data> {
    pub(crate) fn new(
        module: &'a ModuleDwarf<'data>,
        unit: Option<&'a UnitData<'data>>,
        function: Option<Die<'a, 'data>>,
        regs: Option<&'a RegisterState>,
        mem: &'a dyn MemoryReader,
        expr: &'data [u8],
    ) -> Result<Self> {
        let address_size = match unit {
            Some(unit) => unit.address_size,
            None => module.platform().address_size(),
        };
        check_address_size(address_size)?;
        Ok(ExprContext {
            buf: module.expr_buffer(expr),
            module,
            unit,
            addr_base: None,
            function,
            regs,
            mem,
            address_size,
        })
    }
}

pub(crate) fn check_address_size(address_size: u8) -> Result<()> {
    if !(1..=8).contains(&address_size) {
        return Err(DwarfError::Other(format!(
            "unsupported address size {address_size}"
        )));
    }
    Ok(())
}

/// Reads the value of a register from the context's snapshot as a host
/// integer, without masking.
pub(crate) fn register_value(ctx: &ExprContext<'_, '_>, dwarf_regno: u64) -> Result<u64> {
    let regs = ctx.regs.ok_or(DwarfError::NotFound)?;
    let regno = ctx
        .module
        .platform()
        .dwarf_regno_to_internal(dwarf_regno)
        .ok_or(DwarfError::NotFound)?;
    let bytes = regs.register_bytes(regno).ok_or(DwarfError::NotFound)?;
    let mut value = [0u8; 8];
    copy_lsbytes(&mut value, true, bytes, ctx.module.is_little_endian());
    Ok(u64::from_le_bytes(value))
}

/// Evaluates a DWARF expression up to the next location-description
/// operation or the end of the expression.
///
/// The buffer is left positioned at the unconsumed location-description
/// opcode when one stops evaluation.
pub(crate) fn eval_dwarf_expression(
    ctx: &mut ExprContext<'_, '_>,
    stack: &mut Vec<u64>,
    remaining_ops: &mut i32,
) -> Result<()> {
    let little_endian = ctx.module.is_little_endian();
    let address_size = ctx.address_size;
    let address_bits = u32::from(address_size) * 8;
    let address_mask = uint_max(address_size);

    while ctx.buf.has_next() {
        if *remaining_ops <= 0 {
            return Err(ctx
                .buf
                .error("DWARF expression executed too many operations"));
        }
        *remaining_ops -= 1;
        let opcode = ctx.buf.read_u8()?;
        match opcode {
            // Literal encodings.
            DW_OP_LIT0..=DW_OP_LIT31 => stack.push(u64::from(opcode - DW_OP_LIT0)),
            // Register-relative values.
            DW_OP_BREG0..=DW_OP_BREG31 => {
                let value = register_value(ctx, u64::from(opcode - DW_OP_BREG0))?;
                let offset = ctx.buf.read_sleb128()?;
                stack.push(value.wrapping_add(offset as u64) & address_mask);
            }
            // Location descriptions are the caller's business.
            DW_OP_REG0..=DW_OP_REG31 => {
                ctx.buf.rewind();
                return Ok(());
            }
            _ => match constants::DwOp(opcode) {
                constants::DW_OP_regx
                | constants::DW_OP_implicit_value
                | constants::DW_OP_stack_value
                | constants::DW_OP_piece
                | constants::DW_OP_bit_piece => {
                    ctx.buf.rewind();
                    return Ok(());
                }
                constants::DW_OP_addr => {
                    let value = ctx.buf.read_uint(address_size)?;
                    stack.push(value);
                }
                constants::DW_OP_const1u => {
                    let value = ctx.buf.read_u8()?;
                    stack.push(u64::from(value));
                }
                constants::DW_OP_const2u => {
                    let value = ctx.buf.read_u16()?;
                    stack.push(u64::from(value) & address_mask);
                }
                constants::DW_OP_const4u => {
                    let value = ctx.buf.read_u32()?;
                    stack.push(u64::from(value) & address_mask);
                }
                constants::DW_OP_const8u => {
                    let value = ctx.buf.read_u64()?;
                    stack.push(value & address_mask);
                }
                constants::DW_OP_const1s => {
                    let value = ctx.buf.read_i8()?;
                    stack.push(value as u64 & address_mask);
                }
                constants::DW_OP_const2s => {
                    let value = ctx.buf.read_i16()?;
                    stack.push(value as u64 & address_mask);
                }
                constants::DW_OP_const4s => {
                    let value = ctx.buf.read_i32()?;
                    stack.push(value as u64 & address_mask);
                }
                constants::DW_OP_const8s => {
                    let value = ctx.buf.read_i64()?;
                    stack.push(value as u64 & address_mask);
                }
                constants::DW_OP_constu => {
                    let value = ctx.buf.read_uleb128()?;
                    stack.push(value & address_mask);
                }
                constants::DW_OP_consts => {
                    let value = ctx.buf.read_sleb128()?;
                    stack.push(value as u64 & address_mask);
                }
                constants::DW_OP_addrx | constants::DW_OP_constx => {
                    let Some(unit) = ctx.unit else {
                        // No compilation-unit context; let the caller deal
                        // with the opcode.
                        ctx.buf.rewind();
                        return Ok(());
                    };
                    let value = read_addrx(
                        &mut ctx.buf,
                        ctx.module,
                        unit,
                        address_size,
                        &mut ctx.addr_base,
                    )?;
                    stack.push(value);
                }
                constants::DW_OP_fbreg => {
                    let base = frame_base(
                        ctx.module,
                        ctx.function,
                        ctx.regs,
                        ctx.mem,
                        remaining_ops,
                    )?;
                    let offset = ctx.buf.read_sleb128()?;
                    stack.push(base.wrapping_add(offset as u64) & address_mask);
                }
                constants::DW_OP_bregx => {
                    let dwarf_regno = ctx.buf.read_uleb128()?;
                    let value = register_value(ctx, dwarf_regno)?;
                    let offset = ctx.buf.read_sleb128()?;
                    stack.push(value.wrapping_add(offset as u64) & address_mask);
                }
                // Stack operations.
                constants::DW_OP_dup => {
                    let value = *peek(ctx, stack, 0)?;
                    stack.push(value);
                }
                constants::DW_OP_drop => {
                    peek(ctx, stack, 0)?;
                    stack.pop();
                }
                constants::DW_OP_pick => {
                    let index = ctx.buf.read_u8()?;
                    let value = *peek(ctx, stack, usize::from(index))?;
                    stack.push(value);
                }
                constants::DW_OP_over => {
                    let value = *peek(ctx, stack, 1)?;
                    stack.push(value);
                }
                constants::DW_OP_swap => {
                    peek(ctx, stack, 1)?;
                    let len = stack.len();
                    stack.swap(len - 1, len - 2);
                }
                constants::DW_OP_rot => {
                    peek(ctx, stack, 2)?;
                    let len = stack.len();
                    let top = stack[len - 1];
                    stack[len - 1] = stack[len - 2];
                    stack[len - 2] = stack[len - 3];
                    stack[len - 3] = top;
                }
                constants::DW_OP_deref | constants::DW_OP_deref_size => {
                    let deref_size = if constants::DwOp(opcode) == constants::DW_OP_deref {
                        address_size
                    } else {
                        let size = ctx.buf.read_u8()?;
                        if size > address_size {
                            return Err(ctx.buf.error("DW_OP_deref_size has invalid size"));
                        }
                        size
                    };
                    let address = *peek(ctx, stack, 0)?;
                    let mut deref_buf = [0u8; 8];
                    ctx.mem
                        .read(&mut deref_buf[..usize::from(deref_size)], address, false)?;
                    let mut value = [0u8; 8];
                    copy_lsbytes(
                        &mut value,
                        true,
                        &deref_buf[..usize::from(deref_size)],
                        little_endian,
                    );
                    *stack.last_mut().unwrap() = u64::from_le_bytes(value);
                }
                constants::DW_OP_call_frame_cfa => {
                    // The DWARF 5 specification says that DW_OP_call_frame_cfa
                    // cannot be used for CFI. For DW_CFA_def_cfa_expression it
                    // is clearly invalid to define the CFA in terms of the
                    // CFA, and it fails naturally below. The restriction does
                    // not make sense for DW_CFA_expression and
                    // DW_CFA_val_expression, as they push the CFA and thus
                    // depend on it anyway, so it is not enforced there.
                    let cfa = ctx
                        .regs
                        .and_then(|regs| regs.cfa())
                        .ok_or(DwarfError::NotFound)?;
                    stack.push(cfa);
                }
                // Arithmetic and logical operations.
                constants::DW_OP_abs => {
                    let value = *peek(ctx, stack, 0)?;
                    if value & (1u64 << (address_bits - 1)) != 0 {
                        *stack.last_mut().unwrap() = value.wrapping_neg() & address_mask;
                    }
                }
                constants::DW_OP_and => {
                    let (a, b) = binop(ctx, stack)?;
                    stack.push(a & b);
                }
                constants::DW_OP_div => {
                    let (a, b) = binop(ctx, stack)?;
                    if b == 0 {
                        return Err(ctx.buf.error("division by zero in DWARF expression"));
                    }
                    let quotient = truncate_signed(a, address_bits)
                        .wrapping_div(truncate_signed(b, address_bits));
                    stack.push(quotient as u64 & address_mask);
                }
                constants::DW_OP_minus => {
                    let (a, b) = binop(ctx, stack)?;
                    stack.push(a.wrapping_sub(b) & address_mask);
                }
                constants::DW_OP_mod => {
                    let (a, b) = binop(ctx, stack)?;
                    if b == 0 {
                        return Err(ctx.buf.error("modulo by zero in DWARF expression"));
                    }
                    stack.push(a % b);
                }
                constants::DW_OP_mul => {
                    let (a, b) = binop(ctx, stack)?;
                    stack.push(a.wrapping_mul(b) & address_mask);
                }
                constants::DW_OP_neg => {
                    let value = *peek(ctx, stack, 0)?;
                    *stack.last_mut().unwrap() = value.wrapping_neg() & address_mask;
                }
                constants::DW_OP_not => {
                    let value = *peek(ctx, stack, 0)?;
                    *stack.last_mut().unwrap() = !value & address_mask;
                }
                constants::DW_OP_or => {
                    let (a, b) = binop(ctx, stack)?;
                    stack.push(a | b);
                }
                constants::DW_OP_plus => {
                    let (a, b) = binop(ctx, stack)?;
                    stack.push(a.wrapping_add(b) & address_mask);
                }
                constants::DW_OP_plus_uconst => {
                    let value = *peek(ctx, stack, 0)?;
                    let addend = ctx.buf.read_uleb128()?;
                    *stack.last_mut().unwrap() = value.wrapping_add(addend) & address_mask;
                }
                constants::DW_OP_shl => {
                    let (a, b) = binop(ctx, stack)?;
                    if b < u64::from(address_bits) {
                        stack.push((a << b) & address_mask);
                    } else {
                        stack.push(0);
                    }
                }
                constants::DW_OP_shr => {
                    let (a, b) = binop(ctx, stack)?;
                    if b < u64::from(address_bits) {
                        stack.push(a >> b);
                    } else {
                        stack.push(0);
                    }
                }
                constants::DW_OP_shra => {
                    let (a, b) = binop(ctx, stack)?;
                    if b < u64::from(address_bits) {
                        let shifted = truncate_signed(a, address_bits) >> b;
                        stack.push(shifted as u64 & address_mask);
                    } else if a & (1u64 << (address_bits - 1)) != 0 {
                        stack.push(address_mask);
                    } else {
                        stack.push(0);
                    }
                }
                constants::DW_OP_xor => {
                    let (a, b) = binop(ctx, stack)?;
                    stack.push(a ^ b);
                }
                // Control flow operations; relationals compare as signed.
                constants::DW_OP_le => {
                    let (a, b) = relop(ctx, stack, address_bits)?;
                    stack.push((a <= b) as u64);
                }
                constants::DW_OP_ge => {
                    let (a, b) = relop(ctx, stack, address_bits)?;
                    stack.push((a >= b) as u64);
                }
                constants::DW_OP_eq => {
                    let (a, b) = relop(ctx, stack, address_bits)?;
                    stack.push((a == b) as u64);
                }
                constants::DW_OP_lt => {
                    let (a, b) = relop(ctx, stack, address_bits)?;
                    stack.push((a < b) as u64);
                }
                constants::DW_OP_gt => {
                    let (a, b) = relop(ctx, stack, address_bits)?;
                    stack.push((a > b) as u64);
                }
                constants::DW_OP_ne => {
                    let (a, b) = relop(ctx, stack, address_bits)?;
                    stack.push((a != b) as u64);
                }
                constants::DW_OP_skip => {
                    let skip = ctx.buf.read_i16()?;
                    branch(ctx, skip)?;
                }
                constants::DW_OP_bra => {
                    let condition = *peek(ctx, stack, 0)?;
                    stack.pop();
                    let skip = ctx.buf.read_i16()?;
                    if condition != 0 {
                        branch(ctx, skip)?;
                    }
                }
                // Special operations.
                constants::DW_OP_nop => {}
                // Not supported: DW_OP_push_object_address,
                // DW_OP_form_tls_address, DW_OP_entry_value,
                // DW_OP_implicit_pointer, procedure calls (DW_OP_call2,
                // DW_OP_call4, DW_OP_call_ref), typed operations
                // (DW_OP_const_type, DW_OP_regval_type, DW_OP_deref_type,
                // DW_OP_convert, DW_OP_reinterpret), and multiple address
                // spaces (DW_OP_xderef*).
                _ => {
                    return Err(ctx
                        .buf
                        .error(format!("unknown DWARF expression opcode {opcode:#x}")));
                }
            },
        }
    }
    Ok(())
}

fn peek<'s>(
    ctx: &ExprContext<'_, '_>,
    stack: &'s mut Vec<u64>,
    index: usize,
) -> Result<&'s mut u64> {
    let len = stack.len();
    if index >= len {
        return Err(ctx.buf.error("DWARF expression stack underflow"));
    }
    Ok(&mut stack[len - 1 - index])
}

/// Pops the two operands of a binary operation, second-from-top first.
fn binop(ctx: &ExprContext<'_, '_>, stack: &mut Vec<u64>) -> Result<(u64, u64)> {
    if stack.len() < 2 {
        return Err(ctx.buf.error("DWARF expression stack underflow"));
    }
    let b = stack.pop().unwrap();
    let a = stack.pop().unwrap();
    Ok((a, b))
}

fn relop(ctx: &ExprContext<'_, '_>, stack: &mut Vec<u64>, address_bits: u32) -> Result<(i64, i64)> {
    let (a, b) = binop(ctx, stack)?;
    Ok((
        truncate_signed(a, address_bits),
        truncate_signed(b, address_bits),
    ))
}

fn branch(ctx: &mut ExprContext<'_, '_>, skip: i16) -> Result<()> {
    let pos = ctx.buf.pos();
    if (skip >= 0 && skip as usize > ctx.buf.remaining())
        || (skip < 0 && -i64::from(skip) as usize > pos)
    {
        return Err(ctx.buf.error("DWARF expression branch is out of bounds"));
    }
    ctx.buf.set_pos((pos as i64 + i64::from(skip)) as usize);
    Ok(())
}

/// Computes the frame base of a function for `DW_OP_fbreg`.
///
/// Reads `DW_AT_frame_base` of the enclosing subprogram and evaluates it.
/// A single trailing register location description yields the register's
/// value directly; otherwise the result is the top of the stack.
pub(crate) fn frame_base<'a, 'data>(
    module: &ModuleDwarf<'data>,
    function: Option<Die<'a, 'data>>,
    regs: Option<&RegisterState>,
    mem: &dyn MemoryReader,
    remaining_ops: &mut i32,
) -> Result<u64> {
    let function = function.ok_or(DwarfError::NotFound)?;
    let (attr_die, value) = function
        .attr_integrate(constants::DW_AT_frame_base)?
        .ok_or(DwarfError::NotFound)?;
    let expr = location::attr_location(attr_die, value, regs)?;

    let mut ctx = ExprContext::new(module, Some(function.unit), None, regs, mem, expr)?;
    let mut stack = Vec::new();
    eval_dwarf_expression(&mut ctx, &mut stack, remaining_ops)?;
    if ctx.buf.has_next() {
        let opcode = ctx.buf.read_u8()?;
        let dwarf_regno = match opcode {
            DW_OP_REG0..=DW_OP_REG31 => u64::from(opcode - DW_OP_REG0),
            _ if constants::DwOp(opcode) == constants::DW_OP_regx => ctx.buf.read_uleb128()?,
            _ => {
                return Err(ctx.buf.error(format!(
                    "invalid opcode {opcode:#x} for DW_AT_frame_base expression"
                )))
            }
        };
        // The caller masks the result to the address size.
        let value = register_value(&ctx, dwarf_regno)?;
        if ctx.buf.has_next() {
            return Err(ctx
                .buf
                .error("stray operations in DW_AT_frame_base expression"));
        }
        Ok(value)
    } else if let Some(&top) = stack.last() {
        Ok(top)
    } else {
        Err(DwarfError::NotFound)
    }
}
