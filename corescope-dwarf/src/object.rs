//! Materialization of objects from location descriptions.
//!
//! An object is a typed value at rest: in memory, in registers, implied by
//! the expression itself, or absent. The materializer repeatedly evaluates a
//! location expression (C4 stops just before each location-description
//! operation), interprets one *piece* per round, and stitches the pieces
//! into a single description.
//!
//! Not everything a DWARF location can describe fits this model: an object
//! that is partially known and partially unknown is reported as absent, and
//! an object that mixes memory with registers or implicit values, or that
//! lives at non-contiguous addresses, is spilled into a value buffer with
//! one memory read per memory piece.

use gimli::constants;

use corescope_common::{copy_bits, copy_lsbytes, truncate_signed, RegisterState};

use crate::error::{DwarfError, Result};
use crate::expr::{eval_dwarf_expression, ExprContext, MAX_DWARF_EXPR_OPS};
use crate::location;
use crate::module::{Die, ModuleDwarf};
use crate::types::{QualifiedType, TemplateParameter, Type, TypeGraph, TypeKind, Typer};
use crate::{DieRef, MemoryReader};

const DW_OP_REG0: u8 = constants::DW_OP_reg0.0;
const DW_OP_REG31: u8 = constants::DW_OP_reg31.0;

/// How the bytes of an object are interpreted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ObjectEncoding {
    /// A signed integer.
    Signed,
    /// An unsigned integer (also used for booleans and pointers).
    Unsigned,
    /// A floating-point number.
    Float,
    /// An uninterpreted buffer (arrays, compound types).
    Buffer,
}

/// Where an object's bytes live.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ObjectValue {
    /// The object's location or value is not known.
    Absent,
    /// The object lives in the program's memory.
    Reference {
        /// Address of the byte containing the object's first bit.
        address: u64,
        /// Bit offset of the object within that byte (0 to 7).
        bit_offset: u8,
    },
    /// The object's bytes are known directly, in target byte order.
    Value(Vec<u8>),
}

/// A typed object resolved from debugging information.
#[derive(Clone, Debug)]
pub struct Object {
    /// The object's type.
    pub type_: QualifiedType,
    /// How the object's bytes are interpreted.
    pub encoding: ObjectEncoding,
    /// Whether the object's bytes are little-endian.
    pub little_endian: bool,
    /// Size of the object in bits.
    pub bit_size: u64,
    /// The object's location or value.
    pub value: ObjectValue,
}

impl Object {
    /// Returns whether the object is absent.
    pub fn is_absent(&self) -> bool {
        matches!(self.value, ObjectValue::Absent)
    }

    /// Returns a value object's bytes as an unsigned integer.
    pub fn to_u64(&self) -> Option<u64> {
        match &self.value {
            ObjectValue::Value(bytes) => {
                let mut value = [0u8; 8];
                copy_lsbytes(&mut value, true, bytes, self.little_endian);
                Some(u64::from_le_bytes(value))
            }
            _ => None,
        }
    }

    /// Returns a value object's bytes as a signed integer.
    pub fn to_i64(&self) -> Option<i64> {
        let value = self.to_u64()?;
        if self.bit_size == 0 || self.bit_size >= 64 {
            return Some(value as i64);
        }
        Some(truncate_signed(value, self.bit_size as u32))
    }
}

/// The encoding, byte order, and bit size an object of `qualified_type`
/// has.
pub(crate) fn object_type(
    graph: &TypeGraph,
    module: &ModuleDwarf<'_>,
    qualified_type: QualifiedType,
    bit_field_size: Option<u64>,
) -> Result<(ObjectEncoding, bool, u64)> {
    let underlying = graph.underlying(qualified_type.id);
    let kind = graph.kind(underlying);
    let encoding = match kind {
        TypeKind::Int | TypeKind::Enum => {
            if graph.is_signed(underlying) {
                ObjectEncoding::Signed
            } else {
                ObjectEncoding::Unsigned
            }
        }
        TypeKind::Bool | TypeKind::Pointer => ObjectEncoding::Unsigned,
        TypeKind::Float => ObjectEncoding::Float,
        _ => ObjectEncoding::Buffer,
    };
    // Function and void objects carry no bytes; they can still be
    // references (e.g. the address of a function).
    let bit_size = match kind {
        TypeKind::Void | TypeKind::Function => 0,
        _ => graph.bit_size(underlying)?,
    };
    let bit_size = match bit_field_size {
        Some(bit_field_size) if bit_field_size > 0 => bit_field_size,
        _ => bit_size,
    };
    let default = corescope_common::ByteOrder::from_little_endian(module.is_little_endian());
    let little_endian = graph.byte_order(underlying, default).is_little_endian();
    Ok((encoding, little_endian, bit_size))
}

fn value_size(bit_size: u64) -> usize {
    ((bit_size + 7) / 8) as usize
}

fn absent_object(
    die: Die<'_, '_>,
    qualified_type: QualifiedType,
    encoding: ObjectEncoding,
    little_endian: bool,
    bit_size: u64,
) -> Result<Object> {
    if die.tag()? == constants::DW_TAG_template_value_parameter {
        return Err(DwarfError::Other(
            "DW_TAG_template_value_parameter is missing value".to_owned(),
        ));
    }
    Ok(Object {
        type_: qualified_type,
        encoding,
        little_endian,
        bit_size,
        value: ObjectValue::Absent,
    })
}

/// Reads `bit_size` bits from target memory at `src` (plus `src_bit_offset`
/// bits) into `dst` at `dst_bit_offset` bits, preserving surrounding bits.
pub(crate) fn read_bits(
    mem: &dyn MemoryReader,
    dst: &mut [u8],
    dst_bit_offset: u64,
    src: u64,
    src_bit_offset: u64,
    bit_size: u64,
    lsb0: bool,
) -> Result<()> {
    debug_assert!(src_bit_offset < 8);
    if bit_size == 0 {
        return Ok(());
    }
    let src_bytes = ((src_bit_offset + bit_size - 1) / 8 + 1) as usize;
    let mut tmp = vec![0u8; src_bytes];
    mem.read(&mut tmp, src, false)?;
    copy_bits(dst, dst_bit_offset, &tmp, src_bit_offset, bit_size, lsb0);
    Ok(())
}

/// Materializes an object from its type and location expression.
pub(crate) fn object_from_dwarf_location<'data>(
    graph: &TypeGraph,
    module: &ModuleDwarf<'data>,
    die: Die<'_, 'data>,
    qualified_type: QualifiedType,
    expr: &'data [u8],
    function: Option<Die<'_, 'data>>,
    regs: Option<&RegisterState>,
    mem: &dyn MemoryReader,
) -> Result<Object> {
    let little_endian = module.is_little_endian();
    let address_mask = module.platform().address_mask();
    let (encoding, object_little_endian, bit_size) =
        object_type(graph, module, qualified_type, None)?;
    let value_len = value_size(bit_size);

    let mut value_buf: Option<Vec<u8>> = None;
    let mut address = 0u64;
    // -1 means that we do not have an address.
    let mut bit_offset: i64 = -1;
    let mut bit_pos = 0u64;

    let mut remaining_ops = MAX_DWARF_EXPR_OPS;
    let mut ctx = ExprContext::new(module, Some(die.unit), function, regs, mem, expr)?;
    let mut stack: Vec<u64> = Vec::new();

    loop {
        stack.clear();
        match eval_dwarf_expression(&mut ctx, &mut stack, &mut remaining_ops) {
            Ok(()) => {}
            Err(DwarfError::NotFound) => {
                return absent_object(die, qualified_type, encoding, object_little_endian, bit_size)
            }
            Err(err) => return Err(err),
        }

        let mut word_buf = [0u8; 8];
        let mut src: Option<&[u8]> = None;
        if ctx.buf.has_next() {
            let opcode = ctx.buf.read_u8()?;
            let dwarf_regno = match opcode {
                DW_OP_REG0..=DW_OP_REG31 => Some(u64::from(opcode - DW_OP_REG0)),
                _ if constants::DwOp(opcode) == constants::DW_OP_regx => {
                    Some(ctx.buf.read_uleb128()?)
                }
                _ => None,
            };
            if let Some(dwarf_regno) = dwarf_regno {
                let Some(regs) = regs else {
                    return absent_object(
                        die,
                        qualified_type,
                        encoding,
                        object_little_endian,
                        bit_size,
                    );
                };
                let bytes = module
                    .platform()
                    .dwarf_regno_to_internal(dwarf_regno)
                    .and_then(|regno| regs.register_bytes(regno));
                match bytes {
                    Some(bytes) => src = Some(bytes),
                    None => {
                        return absent_object(
                            die,
                            qualified_type,
                            encoding,
                            object_little_endian,
                            bit_size,
                        )
                    }
                }
            } else if constants::DwOp(opcode) == constants::DW_OP_implicit_value {
                let len = ctx.buf.read_uleb128()?;
                if len > ctx.buf.remaining() as u64 {
                    return Err(ctx.buf.error("DW_OP_implicit_value size is out of bounds"));
                }
                src = Some(ctx.buf.read_block(len as usize)?);
            } else if constants::DwOp(opcode) == constants::DW_OP_stack_value {
                match stack.last() {
                    Some(&top) => {
                        word_buf = if little_endian {
                            top.to_le_bytes()
                        } else {
                            top.to_be_bytes()
                        };
                        src = Some(&word_buf);
                    }
                    None => {
                        return absent_object(
                            die,
                            qualified_type,
                            encoding,
                            object_little_endian,
                            bit_size,
                        )
                    }
                }
            } else {
                ctx.buf.rewind();
            }
        }

        let (piece_bit_size, mut piece_bit_offset) = if ctx.buf.has_next() {
            let opcode = ctx.buf.read_u8()?;
            match constants::DwOp(opcode) {
                constants::DW_OP_piece => {
                    let byte_size = ctx.buf.read_uleb128()?;
                    // It is probably bogus for the piece size to exceed the
                    // remaining value size, but the DWARF 5 specification
                    // does not say so explicitly; clamp it instead.
                    let piece_bit_size = byte_size
                        .checked_mul(8)
                        .filter(|&size| size <= bit_size - bit_pos)
                        .unwrap_or(bit_size - bit_pos);
                    (piece_bit_size, 0)
                }
                constants::DW_OP_bit_piece => {
                    let mut piece_bit_size = ctx.buf.read_uleb128()?;
                    let piece_bit_offset = ctx.buf.read_uleb128()?;
                    if piece_bit_size > bit_size - bit_pos {
                        piece_bit_size = bit_size - bit_pos;
                    }
                    (piece_bit_size, piece_bit_offset)
                }
                _ => {
                    return Err(ctx.buf.error(format!(
                        "unknown DWARF expression opcode {opcode:#x} after simple location \
                         description"
                    )));
                }
            }
        } else {
            (bit_size - bit_pos, 0)
        };

        if let Some(src) = src {
            if piece_bit_size == 0 {
                // Ignore empty value.
            } else {
                if value_buf.is_none() {
                    value_buf = Some(vec![0u8; value_len]);
                }
                if bit_offset >= 0 {
                    // We previously had an address. Read it into the value.
                    read_bits(
                        mem,
                        value_buf.as_mut().unwrap(),
                        0,
                        address,
                        bit_offset as u64,
                        bit_pos,
                        little_endian,
                    )?;
                    bit_offset = -1;
                }
                let src_bit_size = 8 * src.len() as u64;
                if piece_bit_offset > src_bit_size {
                    piece_bit_offset = src_bit_size;
                }
                let copy_bit_size = piece_bit_size.min(src_bit_size - piece_bit_offset);
                let mut copy_bit_offset = bit_pos;
                if !little_endian {
                    copy_bit_offset += piece_bit_size - copy_bit_size;
                    piece_bit_offset = src_bit_size - copy_bit_size - piece_bit_offset;
                }
                copy_bits(
                    value_buf.as_mut().unwrap(),
                    copy_bit_offset,
                    src,
                    piece_bit_offset,
                    copy_bit_size,
                    little_endian,
                );
            }
        } else if let Some(&top) = stack.last() {
            let mut piece_address = top.wrapping_add(piece_bit_offset / 8) & address_mask;
            let mut piece_bit_offset = piece_bit_offset % 8;
            if bit_pos > 0 && bit_offset >= 0 {
                // We already had an address. Merge the pieces if the
                // addresses are contiguous, otherwise convert to a value.
                //
                // The obvious way to write the end address is
                // address + (bit_pos + bit_offset) / 8, but
                // bit_pos + bit_offset can overflow.
                let end_address = address
                    .wrapping_add(bit_pos / 8)
                    .wrapping_add((bit_pos % 8 + bit_offset as u64) / 8)
                    & address_mask;
                let end_bit_offset = (bit_offset as u64 + bit_pos) % 8;
                if piece_bit_size == 0
                    || (piece_address == end_address && piece_bit_offset == end_bit_offset)
                {
                    // Piece is contiguous.
                    piece_address = address;
                    piece_bit_offset = bit_offset as u64;
                } else {
                    if value_buf.is_none() {
                        value_buf = Some(vec![0u8; value_len]);
                    }
                    read_bits(
                        mem,
                        value_buf.as_mut().unwrap(),
                        0,
                        address,
                        bit_offset as u64,
                        bit_pos,
                        little_endian,
                    )?;
                    bit_offset = -1;
                }
            }
            if let Some(value_buf) = &mut value_buf {
                // We already have a value. Read into it.
                read_bits(
                    mem,
                    value_buf,
                    bit_pos,
                    piece_address,
                    piece_bit_offset,
                    piece_bit_size,
                    little_endian,
                )?;
            } else {
                address = piece_address;
                bit_offset = piece_bit_offset as i64;
            }
        } else if piece_bit_size > 0 {
            return absent_object(die, qualified_type, encoding, object_little_endian, bit_size);
        }
        bit_pos += piece_bit_size;

        if !ctx.buf.has_next() {
            break;
        }
    }

    if bit_pos < bit_size || (bit_offset < 0 && value_buf.is_none()) {
        absent_object(die, qualified_type, encoding, object_little_endian, bit_size)
    } else if bit_offset >= 0 {
        // If the address is not in the module's mapped range, it is probably
        // something special like a per-CPU variable (which is not an address
        // but an offset); do not apply the bias then.
        let (start, end) = module.address_range();
        let biased = address.wrapping_add(module.bias());
        let address = if start <= biased && biased < end {
            biased
        } else {
            address
        };
        Ok(Object {
            type_: qualified_type,
            encoding,
            little_endian: object_little_endian,
            bit_size,
            value: ObjectValue::Reference {
                address,
                bit_offset: bit_offset as u8,
            },
        })
    } else {
        Ok(Object {
            type_: qualified_type,
            encoding,
            little_endian: object_little_endian,
            bit_size,
            value: ObjectValue::Value(value_buf.unwrap()),
        })
    }
}

/// Builds a value object holding a host integer, truncated to the object's
/// size.
fn scalar_object(
    qualified_type: QualifiedType,
    encoding: ObjectEncoding,
    little_endian: bool,
    bit_size: u64,
    value: u64,
) -> Object {
    let mut bytes = vec![0u8; value_size(bit_size)];
    copy_lsbytes(&mut bytes, little_endian, &value.to_le_bytes(), true);
    Object {
        type_: qualified_type,
        encoding,
        little_endian,
        bit_size,
        value: ObjectValue::Value(bytes),
    }
}

/// Materializes an object from a `DW_AT_const_value` attribute.
fn object_from_dwarf_constant<'data>(
    graph: &TypeGraph,
    die: Die<'_, 'data>,
    qualified_type: QualifiedType,
    value: gimli::AttributeValue<crate::module::Slice<'data>>,
) -> Result<Object> {
    let (encoding, little_endian, bit_size) = object_type(graph, die.module, qualified_type, None)?;
    let block = match &value {
        gimli::AttributeValue::Block(block) => Some(block.slice()),
        gimli::AttributeValue::Exprloc(expression) => Some(expression.0.slice()),
        _ => None,
    };
    if let Some(block) = block {
        let len = value_size(bit_size);
        if block.len() < len {
            return Err(DwarfError::Other(
                "DW_AT_const_value block is too small".to_owned(),
            ));
        }
        return Ok(Object {
            type_: qualified_type,
            encoding,
            little_endian,
            bit_size,
            value: ObjectValue::Value(block[..len].to_vec()),
        });
    }
    match encoding {
        ObjectEncoding::Signed => {
            let signed = value.sdata_value().or_else(|| {
                value.udata_value().map(|unsigned| unsigned as i64)
            });
            match signed {
                Some(signed) => Ok(scalar_object(
                    qualified_type,
                    encoding,
                    little_endian,
                    bit_size,
                    signed as u64,
                )),
                None => Err(DwarfError::Other("invalid DW_AT_const_value".to_owned())),
            }
        }
        ObjectEncoding::Unsigned => match value.udata_value() {
            Some(unsigned) => Ok(scalar_object(
                qualified_type,
                encoding,
                little_endian,
                bit_size,
                unsigned,
            )),
            None => Err(DwarfError::Other("invalid DW_AT_const_value".to_owned())),
        },
        _ => Err(DwarfError::Other(
            "unknown DW_AT_const_value form".to_owned(),
        )),
    }
}

/// Materializes a function object from a `DW_TAG_subprogram` DIE.
fn object_from_dwarf_subprogram<'i, 'data>(
    typer: &mut Typer<'i, 'data>,
    die: Die<'i, 'data>,
) -> Result<Object> {
    let qualified_type = typer.type_from_dwarf(die.die_ref())?;
    let (encoding, little_endian, bit_size) =
        object_type(&typer.tables.graph, die.module, qualified_type, None)?;
    let low_pc = match die.attr_integrate(constants::DW_AT_low_pc)? {
        Some((_, gimli::AttributeValue::Addr(addr))) => Some(addr),
        Some((attr_die, gimli::AttributeValue::DebugAddrIndex(index))) => {
            Some(attr_die.module.dwarf.address(&attr_die.unit.unit, index)?)
        }
        _ => None,
    };
    match low_pc {
        Some(low_pc) => Ok(Object {
            type_: qualified_type,
            encoding,
            little_endian,
            bit_size,
            value: ObjectValue::Reference {
                address: low_pc.wrapping_add(die.module.bias()),
                bit_offset: 0,
            },
        }),
        None => Ok(Object {
            type_: qualified_type,
            encoding,
            little_endian,
            bit_size,
            value: ObjectValue::Absent,
        }),
    }
}

/// Materializes an object from a data-object or subprogram DIE.
///
/// The object's type comes from `type_die` if given, otherwise from the
/// DIE's `DW_AT_type`. The object's location comes from `DW_AT_location`,
/// falling back to `DW_AT_const_value`, falling back to absent.
pub(crate) fn object_from_dwarf<'i, 'data>(
    typer: &mut Typer<'i, 'data>,
    mem: &dyn MemoryReader,
    die_ref: DieRef,
    type_die: Option<DieRef>,
    function_die: Option<DieRef>,
    regs: Option<&RegisterState>,
) -> Result<Object> {
    let die = typer.die(die_ref)?;
    if die.tag()? == constants::DW_TAG_subprogram {
        return object_from_dwarf_subprogram(typer, die);
    }

    // Data object entries can have DW_AT_endianity according to DWARF 5,
    // but that does not seem to be used in practice; the type's byte order
    // wins.
    let qualified_type = match type_die {
        Some(type_die) => typer.type_from_dwarf(type_die)?,
        None => typer.type_from_attr(die, None, true, true)?.0,
    };

    let function = match function_die {
        Some(function_die) => Some(typer.die(function_die)?),
        None => None,
    };

    if let Some((attr_die, value)) = die.attr_integrate(constants::DW_AT_location)? {
        let expr = location::attr_location(attr_die, value, regs)?;
        object_from_dwarf_location(
            &typer.tables.graph,
            die.module,
            die,
            qualified_type,
            expr,
            function,
            regs,
            mem,
        )
    } else if let Some((_, value)) = die.attr_integrate(constants::DW_AT_const_value)? {
        object_from_dwarf_constant(&typer.tables.graph, die, qualified_type, value)
    } else {
        object_from_dwarf_location(
            &typer.tables.graph,
            die.module,
            die,
            qualified_type,
            &[],
            function,
            regs,
            mem,
        )
    }
}

/// Materializes the object named by an enumerator of `enum_die`.
pub(crate) fn object_from_dwarf_enumerator<'i, 'data>(
    typer: &mut Typer<'i, 'data>,
    enum_die: DieRef,
    name: &str,
) -> Result<Object> {
    let qualified_type = typer.type_from_dwarf(enum_die)?;
    let die = typer.die(enum_die)?;
    let graph = &typer.tables.graph;
    let (encoding, little_endian, bit_size) =
        object_type(graph, die.module, qualified_type, None)?;
    let underlying = graph.underlying(qualified_type.id);
    let Type::Enum { enumerators, .. } = graph.get(underlying) else {
        return Err(DwarfError::Other(
            "cannot look up enumerator in non-enumeration type".to_owned(),
        ));
    };
    for enumerator in enumerators {
        if enumerator.name != name {
            continue;
        }
        let value = match enumerator.value {
            crate::types::EnumValue::Signed(value) => value as u64,
            crate::types::EnumValue::Unsigned(value) => value,
        };
        return Ok(scalar_object(
            qualified_type,
            encoding,
            little_endian,
            bit_size,
            value,
        ));
    }
    Err(DwarfError::NotFound)
}

/// Materializes the argument of a template parameter.
///
/// Type parameters produce an absent object of the parameter's type; value
/// parameters must have a value and produce it.
pub(crate) fn template_parameter_object<'i, 'data>(
    typer: &mut Typer<'i, 'data>,
    mem: &dyn MemoryReader,
    parameter: &TemplateParameter,
) -> Result<Object> {
    if parameter.is_value {
        return object_from_dwarf(typer, mem, parameter.die, None, None, None);
    }
    let die = typer.die(parameter.die)?;
    let (qualified_type, _) = typer.type_from_attr(die, None, true, true)?;
    let (encoding, little_endian, bit_size) =
        object_type(&typer.tables.graph, die.module, qualified_type, None)?;
    Ok(Object {
        type_: qualified_type,
        encoding,
        little_endian,
        bit_size,
        value: ObjectValue::Absent,
    })
}
