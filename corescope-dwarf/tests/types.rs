//! End-to-end type construction tests over synthesized DWARF.

mod common;

use gimli::constants::*;
use gimli::write::{AttributeValue, DwarfUnit, UnitEntryId};
use similar_asserts::assert_eq;

use corescope_dwarf::{
    DebugInfo, DwarfError, Qualifiers, Type, TypeKind,
};

use common::{children_with_tag, unit_root, SimpleIndex, TestSections};

fn set_language(dwarf: &mut DwarfUnit) {
    let root = dwarf.unit.root();
    dwarf
        .unit
        .get_mut(root)
        .set(DW_AT_language, AttributeValue::Language(DW_LANG_C99));
}

fn add_base_type(dwarf: &mut DwarfUnit, name: &str, encoding: DwAte, size: u64) -> UnitEntryId {
    let root = dwarf.unit.root();
    let id = dwarf.unit.add(root, DW_TAG_base_type);
    let die = dwarf.unit.get_mut(id);
    die.set(DW_AT_name, AttributeValue::String(name.as_bytes().to_vec()));
    die.set(DW_AT_encoding, AttributeValue::Encoding(encoding));
    die.set(DW_AT_byte_size, AttributeValue::Udata(size));
    id
}

fn add_int(dwarf: &mut DwarfUnit) -> UnitEntryId {
    add_base_type(dwarf, "int", DW_ATE_signed, 4)
}

fn add_member(
    dwarf: &mut DwarfUnit,
    parent: UnitEntryId,
    name: &str,
    type_id: UnitEntryId,
    byte_offset: u64,
) -> UnitEntryId {
    let id = dwarf.unit.add(parent, DW_TAG_member);
    let die = dwarf.unit.get_mut(id);
    die.set(DW_AT_name, AttributeValue::String(name.as_bytes().to_vec()));
    die.set(DW_AT_type, AttributeValue::UnitRef(type_id));
    die.set(
        DW_AT_data_member_location,
        AttributeValue::Udata(byte_offset),
    );
    id
}

#[test]
fn test_find_int_type() {
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        add_int(dwarf);
    });
    let mut info = DebugInfo::new();
    info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let qualified = info
        .find_type(&index, TypeKind::Int, "int", None)
        .unwrap();
    assert!(qualified.qualifiers.is_empty());
    match info.type_(qualified.id) {
        Type::Int { name, size, signed, .. } => {
            assert_eq!(name, "int");
            assert_eq!(*size, 4);
            assert!(*signed);
        }
        other => panic!("unexpected type: {other:?}"),
    }

    // Memoization: looking the type up again yields the same node.
    let again = info.find_type(&index, TypeKind::Int, "int", None).unwrap();
    assert_eq!(qualified.id, again.id);

    // The name is a base type, not a float.
    assert_eq!(
        info.find_type(&index, TypeKind::Float, "int", None)
            .unwrap_err(),
        DwarfError::NotFound
    );
}

#[test]
fn test_pointer_identity() {
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let int = add_int(dwarf);
        let root = dwarf.unit.root();
        for _ in 0..2 {
            let pointer = dwarf.unit.add(root, DW_TAG_pointer_type);
            dwarf
                .unit
                .get_mut(pointer)
                .set(DW_AT_type, AttributeValue::UnitRef(int));
        }
        let const_type = dwarf.unit.add(root, DW_TAG_const_type);
        dwarf
            .unit
            .get_mut(const_type)
            .set(DW_AT_type, AttributeValue::UnitRef(int));
        let const_pointer = dwarf.unit.add(root, DW_TAG_pointer_type);
        dwarf
            .unit
            .get_mut(const_pointer)
            .set(DW_AT_type, AttributeValue::UnitRef(const_type));
    });
    let mut info = DebugInfo::new();
    let module = info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let root = unit_root(&info, module);
    let pointers = children_with_tag(&info, root, DW_TAG_pointer_type);
    assert_eq!(pointers.len(), 3);

    // Two distinct DIEs describing `int *` produce the same node.
    let first = info.type_from_dwarf(&index, pointers[0]).unwrap();
    let second = info.type_from_dwarf(&index, pointers[1]).unwrap();
    assert_eq!(first.id, second.id);

    // `const int *` points at a differently qualified type, so it is a
    // different node.
    let const_pointer = info.type_from_dwarf(&index, pointers[2]).unwrap();
    assert_ne!(first.id, const_pointer.id);
    match info.type_(const_pointer.id) {
        Type::Pointer { referenced, .. } => {
            assert!(referenced.qualifiers.contains(Qualifiers::CONST));
        }
        other => panic!("unexpected type: {other:?}"),
    }
}

#[test]
fn test_struct_members() {
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let int = add_int(dwarf);
        let root = dwarf.unit.root();
        let point = dwarf.unit.add(root, DW_TAG_structure_type);
        {
            let die = dwarf.unit.get_mut(point);
            die.set(DW_AT_name, AttributeValue::String(b"point".to_vec()));
            die.set(DW_AT_byte_size, AttributeValue::Udata(8));
        }
        add_member(dwarf, point, "x", int, 0);
        add_member(dwarf, point, "y", int, 4);
    });
    let mut info = DebugInfo::new();
    info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let qualified = info
        .find_type(&index, TypeKind::Struct, "point", None)
        .unwrap();
    let (members, size) = match info.type_(qualified.id) {
        Type::Compound { members, size, complete: true, .. } => (members.clone(), *size),
        other => panic!("unexpected type: {other:?}"),
    };
    assert_eq!(size, 8);
    assert_eq!(members.len(), 2);
    assert_eq!(members[0].name.as_deref(), Some("x"));
    assert_eq!(members[0].bit_offset, 0);
    assert_eq!(members[1].name.as_deref(), Some("y"));
    assert_eq!(members[1].bit_offset, 32);

    let member_type = info.member_type(&index, &members[0]).unwrap();
    assert_eq!(info.type_kind(member_type.id), TypeKind::Int);
}

#[test]
fn test_bit_field_offsets() {
    // struct { int a : 3; int b : 5; } with the DWARF <= 3 bit-field form:
    // DW_AT_bit_offset counts from the most significant bit of the
    // containing byte.
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let int = add_int(dwarf);
        let root = dwarf.unit.root();
        let flags = dwarf.unit.add(root, DW_TAG_structure_type);
        {
            let die = dwarf.unit.get_mut(flags);
            die.set(DW_AT_name, AttributeValue::String(b"flags".to_vec()));
            die.set(DW_AT_byte_size, AttributeValue::Udata(1));
        }
        for (name, bit_size, bit_offset) in [("a", 3u64, 5u64), ("b", 5, 0)] {
            let member = add_member(dwarf, flags, name, int, 0);
            let die = dwarf.unit.get_mut(member);
            die.set(DW_AT_byte_size, AttributeValue::Udata(1));
            die.set(DW_AT_bit_size, AttributeValue::Udata(bit_size));
            die.set(DW_AT_bit_offset, AttributeValue::Udata(bit_offset));
        }
    });
    let mut info = DebugInfo::new();
    info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let qualified = info
        .find_type(&index, TypeKind::Struct, "flags", None)
        .unwrap();
    let Type::Compound { members, .. } = info.type_(qualified.id) else {
        panic!("not a compound type");
    };
    // On a little-endian target, bit_offset(a) = 8 * 1 - 5 - 3 = 0 and
    // bit_offset(b) = 8 * 1 - 0 - 5 = 3.
    assert_eq!(members[0].bit_offset, 0);
    assert_eq!(members[0].bit_field_size, Some(3));
    assert_eq!(members[1].bit_offset, 3);
    assert_eq!(members[1].bit_field_size, Some(5));
}

#[test]
fn test_data_bit_offset_equivalence() {
    // The same layout in the DWARF 4 form gives the same offsets.
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let int = add_int(dwarf);
        let root = dwarf.unit.root();
        let flags = dwarf.unit.add(root, DW_TAG_structure_type);
        {
            let die = dwarf.unit.get_mut(flags);
            die.set(DW_AT_name, AttributeValue::String(b"flags".to_vec()));
            die.set(DW_AT_byte_size, AttributeValue::Udata(1));
        }
        for (name, bit_size, data_bit_offset) in [("a", 3u64, 0u64), ("b", 5, 3)] {
            let member = dwarf.unit.add(flags, DW_TAG_member);
            let die = dwarf.unit.get_mut(member);
            die.set(DW_AT_name, AttributeValue::String(name.as_bytes().to_vec()));
            die.set(DW_AT_type, AttributeValue::UnitRef(int));
            die.set(DW_AT_bit_size, AttributeValue::Udata(bit_size));
            die.set(DW_AT_data_bit_offset, AttributeValue::Udata(data_bit_offset));
        }
    });
    let mut info = DebugInfo::new();
    info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let qualified = info
        .find_type(&index, TypeKind::Struct, "flags", None)
        .unwrap();
    let Type::Compound { members, .. } = info.type_(qualified.id) else {
        panic!("not a compound type");
    };
    assert_eq!(members[0].bit_offset, 0);
    assert_eq!(members[1].bit_offset, 3);
}

#[test]
fn test_self_referential_struct() {
    // struct X { struct X *next; }
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let root = dwarf.unit.root();
        let x = dwarf.unit.add(root, DW_TAG_structure_type);
        {
            let die = dwarf.unit.get_mut(x);
            die.set(DW_AT_name, AttributeValue::String(b"X".to_vec()));
            die.set(DW_AT_byte_size, AttributeValue::Udata(8));
        }
        let pointer = dwarf.unit.add(root, DW_TAG_pointer_type);
        dwarf
            .unit
            .get_mut(pointer)
            .set(DW_AT_type, AttributeValue::UnitRef(x));
        add_member(dwarf, x, "next", pointer, 0);
    });
    let mut info = DebugInfo::new();
    info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let qualified = info.find_type(&index, TypeKind::Struct, "X", None).unwrap();
    let Type::Compound { members, .. } = info.type_(qualified.id) else {
        panic!("not a compound type");
    };
    let members = members.clone();
    let next_type = info.member_type(&index, &members[0]).unwrap();
    match info.type_(next_type.id) {
        Type::Pointer { referenced, .. } => {
            // The memoized outer struct breaks the cycle: the pointer's
            // referenced type is the same node we started from.
            assert_eq!(referenced.id, qualified.id);
        }
        other => panic!("unexpected type: {other:?}"),
    }
}

#[test]
fn test_typedef() {
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let uint = add_base_type(dwarf, "unsigned int", DW_ATE_unsigned, 4);
        let root = dwarf.unit.root();
        let typedef = dwarf.unit.add(root, DW_TAG_typedef);
        let die = dwarf.unit.get_mut(typedef);
        die.set(DW_AT_name, AttributeValue::String(b"u32".to_vec()));
        die.set(DW_AT_type, AttributeValue::UnitRef(uint));
    });
    let mut info = DebugInfo::new();
    info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let qualified = info
        .find_type(&index, TypeKind::Typedef, "u32", None)
        .unwrap();
    match info.type_(qualified.id) {
        Type::Typedef { name, aliased, .. } => {
            assert_eq!(name, "u32");
            assert_eq!(info.type_kind(aliased.id), TypeKind::Int);
        }
        other => panic!("unexpected type: {other:?}"),
    }
    assert_eq!(info.underlying(qualified.id), {
        let Type::Typedef { aliased, .. } = info.type_(qualified.id) else {
            unreachable!()
        };
        aliased.id
    });
}

fn add_enum(dwarf: &mut DwarfUnit, compatible: Option<UnitEntryId>) -> UnitEntryId {
    let root = dwarf.unit.root();
    let color = dwarf.unit.add(root, DW_TAG_enumeration_type);
    {
        let die = dwarf.unit.get_mut(color);
        die.set(DW_AT_name, AttributeValue::String(b"color".to_vec()));
        die.set(DW_AT_byte_size, AttributeValue::Udata(4));
        if let Some(compatible) = compatible {
            die.set(DW_AT_type, AttributeValue::UnitRef(compatible));
        }
    }
    for (name, value) in [("RED", 0u64), ("GREEN", 1), ("BLUE", 2)] {
        let enumerator = dwarf.unit.add(color, DW_TAG_enumerator);
        let die = dwarf.unit.get_mut(enumerator);
        die.set(DW_AT_name, AttributeValue::String(name.as_bytes().to_vec()));
        die.set(DW_AT_const_value, AttributeValue::Udata(value));
    }
    color
}

#[test]
fn test_enum() {
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let int = add_int(dwarf);
        add_enum(dwarf, Some(int));
    });
    let mut info = DebugInfo::new();
    info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let qualified = info
        .find_type(&index, TypeKind::Enum, "color", None)
        .unwrap();
    match info.type_(qualified.id) {
        Type::Enum { enumerators, compatible, complete: true, .. } => {
            assert_eq!(enumerators.len(), 3);
            assert_eq!(enumerators[1].name, "GREEN");
            let compatible = compatible.expect("enum has a compatible type");
            assert_eq!(info.type_kind(compatible), TypeKind::Int);
        }
        other => panic!("unexpected type: {other:?}"),
    }
    assert_eq!(info.byte_size(qualified.id).unwrap(), 4);
}

#[test]
fn test_enum_compatible_type_fallback() {
    // Without DW_AT_type the compatible integer type is synthesized, with
    // the signedness inferred from the enumerators.
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let color = add_enum(dwarf, None);
        let negative = dwarf.unit.add(color, DW_TAG_enumerator);
        let die = dwarf.unit.get_mut(negative);
        die.set(DW_AT_name, AttributeValue::String(b"INVALID".to_vec()));
        die.set(DW_AT_const_value, AttributeValue::Sdata(-1));
    });
    let mut info = DebugInfo::new();
    info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let qualified = info
        .find_type(&index, TypeKind::Enum, "color", None)
        .unwrap();
    let Type::Enum { compatible, .. } = info.type_(qualified.id) else {
        panic!("not an enum");
    };
    match info.type_(compatible.unwrap()) {
        Type::Int { name, size, signed, .. } => {
            assert_eq!(name, "<unknown>");
            assert_eq!(*size, 4);
            assert!(*signed);
        }
        other => panic!("unexpected type: {other:?}"),
    }
}

#[test]
fn test_array_lengths() {
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let int = add_int(dwarf);
        let root = dwarf.unit.root();
        // int [3] via DW_AT_count.
        let by_count = dwarf.unit.add(root, DW_TAG_array_type);
        dwarf
            .unit
            .get_mut(by_count)
            .set(DW_AT_type, AttributeValue::UnitRef(int));
        let subrange = dwarf.unit.add(by_count, DW_TAG_subrange_type);
        dwarf
            .unit
            .get_mut(subrange)
            .set(DW_AT_count, AttributeValue::Udata(3));
        // int [3] via DW_AT_upper_bound.
        let by_bound = dwarf.unit.add(root, DW_TAG_array_type);
        dwarf
            .unit
            .get_mut(by_bound)
            .set(DW_AT_type, AttributeValue::UnitRef(int));
        let subrange = dwarf.unit.add(by_bound, DW_TAG_subrange_type);
        dwarf
            .unit
            .get_mut(subrange)
            .set(DW_AT_upper_bound, AttributeValue::Udata(2));
    });
    let mut info = DebugInfo::new();
    let module = info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let root = unit_root(&info, module);
    let arrays = children_with_tag(&info, root, DW_TAG_array_type);
    assert_eq!(arrays.len(), 2);

    let by_count = info.type_from_dwarf(&index, arrays[0]).unwrap();
    let by_bound = info.type_from_dwarf(&index, arrays[1]).unwrap();
    match info.type_(by_count.id) {
        Type::Array { length: Some(3), .. } => {}
        other => panic!("unexpected type: {other:?}"),
    }
    // Equal constructions intern to the same node.
    assert_eq!(by_count.id, by_bound.id);
    assert_eq!(info.byte_size(by_count.id).unwrap(), 12);
}

fn flexible_array_struct(dwarf: &mut DwarfUnit, with_leading_member: bool) {
    let int = add_int(dwarf);
    let root = dwarf.unit.root();
    let array = dwarf.unit.add(root, DW_TAG_array_type);
    dwarf
        .unit
        .get_mut(array)
        .set(DW_AT_type, AttributeValue::UnitRef(int));

    let s = dwarf.unit.add(root, DW_TAG_structure_type);
    {
        let die = dwarf.unit.get_mut(s);
        die.set(DW_AT_name, AttributeValue::String(b"s".to_vec()));
        die.set(DW_AT_byte_size, AttributeValue::Udata(4));
    }
    if with_leading_member {
        add_member(dwarf, s, "n", int, 0);
    }
    add_member(dwarf, s, "a", array, 4);
}

#[test]
fn test_flexible_array_member() {
    // struct s { int n; int a[]; }: the last member of a structure with
    // other members may be a flexible array.
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        flexible_array_struct(dwarf, true);
    });
    let mut info = DebugInfo::new();
    info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let qualified = info.find_type(&index, TypeKind::Struct, "s", None).unwrap();
    let Type::Compound { members, .. } = info.type_(qualified.id) else {
        panic!("not a compound type");
    };
    let members = members.clone();
    let array = info.member_type(&index, &members[1]).unwrap();
    match info.type_(array.id) {
        Type::Array { length: None, .. } => {}
        other => panic!("unexpected type: {other:?}"),
    }
}

#[test]
fn test_lone_incomplete_array_member_is_zero_length() {
    // struct s { int a[]; }: zero-length arrays are allowed as the only
    // member, flexible arrays are not, so the encoding must mean length
    // zero.
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        flexible_array_struct(dwarf, false);
    });
    let mut info = DebugInfo::new();
    info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let qualified = info.find_type(&index, TypeKind::Struct, "s", None).unwrap();
    let Type::Compound { members, .. } = info.type_(qualified.id) else {
        panic!("not a compound type");
    };
    let members = members.clone();
    let array = info.member_type(&index, &members[0]).unwrap();
    match info.type_(array.id) {
        Type::Array { length: Some(0), .. } => {}
        other => panic!("unexpected type: {other:?}"),
    }
}

#[test]
fn test_declaration_resolves_to_definition() {
    let declaration_sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let root = dwarf.unit.root();
        let declaration = dwarf.unit.add(root, DW_TAG_structure_type);
        let die = dwarf.unit.get_mut(declaration);
        die.set(DW_AT_name, AttributeValue::String(b"foo".to_vec()));
        die.set(DW_AT_declaration, AttributeValue::Flag(true));
    });
    let definition_sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let int = add_int(dwarf);
        let root = dwarf.unit.root();
        let definition = dwarf.unit.add(root, DW_TAG_structure_type);
        {
            let die = dwarf.unit.get_mut(definition);
            die.set(DW_AT_name, AttributeValue::String(b"foo".to_vec()));
            die.set(DW_AT_byte_size, AttributeValue::Udata(4));
        }
        add_member(dwarf, definition, "x", int, 0);
    });

    let mut info = DebugInfo::new();
    let declaration_module = info.add_module(declaration_sections.load());
    info.add_module(definition_sections.load());
    let index = SimpleIndex::build(&info);

    let root = unit_root(&info, declaration_module);
    let declaration = children_with_tag(&info, root, DW_TAG_structure_type)[0];
    let qualified = info.type_from_dwarf(&index, declaration).unwrap();
    match info.type_(qualified.id) {
        Type::Compound { members, complete: true, .. } => {
            assert_eq!(members.len(), 1);
        }
        other => panic!("unexpected type: {other:?}"),
    }
}

#[test]
fn test_unresolved_declaration_stays_incomplete() {
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let root = dwarf.unit.root();
        let declaration = dwarf.unit.add(root, DW_TAG_structure_type);
        let die = dwarf.unit.get_mut(declaration);
        die.set(DW_AT_name, AttributeValue::String(b"foo".to_vec()));
        die.set(DW_AT_declaration, AttributeValue::Flag(true));
    });
    let mut info = DebugInfo::new();
    let module = info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let root = unit_root(&info, module);
    let declaration = children_with_tag(&info, root, DW_TAG_structure_type)[0];
    let qualified = info.type_from_dwarf(&index, declaration).unwrap();
    match info.type_(qualified.id) {
        Type::Compound { complete: false, .. } => {}
        other => panic!("unexpected type: {other:?}"),
    }
    assert!(info.byte_size(qualified.id).is_err());
}

#[test]
fn test_function_type() {
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let int = add_int(dwarf);
        let root = dwarf.unit.root();
        let subroutine = dwarf.unit.add(root, DW_TAG_subroutine_type);
        dwarf
            .unit
            .get_mut(subroutine)
            .set(DW_AT_type, AttributeValue::UnitRef(int));
        let parameter = dwarf.unit.add(subroutine, DW_TAG_formal_parameter);
        {
            let die = dwarf.unit.get_mut(parameter);
            die.set(DW_AT_name, AttributeValue::String(b"x".to_vec()));
            die.set(DW_AT_type, AttributeValue::UnitRef(int));
        }
        dwarf.unit.add(subroutine, DW_TAG_unspecified_parameters);
    });
    let mut info = DebugInfo::new();
    let module = info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let root = unit_root(&info, module);
    let subroutine = children_with_tag(&info, root, DW_TAG_subroutine_type)[0];
    let qualified = info.type_from_dwarf(&index, subroutine).unwrap();
    let (parameters, variadic, return_type) = match info.type_(qualified.id) {
        Type::Function { parameters, variadic, return_type, .. } => {
            (parameters.clone(), *variadic, *return_type)
        }
        other => panic!("unexpected type: {other:?}"),
    };
    assert!(variadic);
    assert_eq!(parameters.len(), 1);
    assert_eq!(parameters[0].name.as_deref(), Some("x"));
    assert_eq!(info.type_kind(return_type.id), TypeKind::Int);
    let parameter_type = info.parameter_type(&index, &parameters[0]).unwrap();
    assert_eq!(info.type_kind(parameter_type.id), TypeKind::Int);
}

#[test]
fn test_qualifier_chain() {
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let int = add_int(dwarf);
        let root = dwarf.unit.root();
        let volatile = dwarf.unit.add(root, DW_TAG_volatile_type);
        dwarf
            .unit
            .get_mut(volatile)
            .set(DW_AT_type, AttributeValue::UnitRef(int));
        let const_type = dwarf.unit.add(root, DW_TAG_const_type);
        dwarf
            .unit
            .get_mut(const_type)
            .set(DW_AT_type, AttributeValue::UnitRef(volatile));
    });
    let mut info = DebugInfo::new();
    let module = info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let root = unit_root(&info, module);
    let const_die = children_with_tag(&info, root, DW_TAG_const_type)[0];
    let qualified = info.type_from_dwarf(&index, const_die).unwrap();
    assert!(qualified.qualifiers.contains(Qualifiers::CONST));
    assert!(qualified.qualifiers.contains(Qualifiers::VOLATILE));
    assert_eq!(info.type_kind(qualified.id), TypeKind::Int);
}

#[test]
fn test_recursion_limit() {
    // A chain of pointer types deeper than the recursion cap.
    let sections = TestSections::from_dwarf(|dwarf| {
        set_language(dwarf);
        let int = add_int(dwarf);
        let root = dwarf.unit.root();
        let mut pointers = Vec::new();
        for _ in 0..1100 {
            pointers.push(dwarf.unit.add(root, DW_TAG_pointer_type));
        }
        for i in 0..1100 {
            let target = if i + 1 < 1100 {
                pointers[i + 1]
            } else {
                int
            };
            dwarf
                .unit
                .get_mut(pointers[i])
                .set(DW_AT_type, AttributeValue::UnitRef(target));
        }
    });
    let mut info = DebugInfo::new();
    let module = info.add_module(sections.load());
    let index = SimpleIndex::build(&info);

    let root = unit_root(&info, module);
    let first = children_with_tag(&info, root, DW_TAG_pointer_type)[0];
    assert_eq!(
        info.type_from_dwarf(&index, first).unwrap_err(),
        DwarfError::Recursion
    );
}
