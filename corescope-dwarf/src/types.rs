//! Type construction from DWARF debugging information entries.
//!
//! [`Typer::type_from_dwarf`] walks the DIE graph of a module and
//! materializes an immutable type node for every type it encounters. Nodes
//! live in a [`TypeGraph`] arena and are referenced by [`TypeId`]; pointer,
//! array, and primitive constructions are structurally interned, so equal
//! constructions yield the same id and downstream equality stays cheap.
//!
//! Construction is memoized per DIE. Member and parameter types are *lazy*:
//! a member records the DIE its type comes from and the type is only built
//! when first asked for. Combined with the memoization this breaks the
//! cycles of self-referential types such as `struct X { struct X *next; }`:
//! the outer struct is cached before any member type is forced.

use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use gimli::{constants, AttributeValue};
use indexmap::IndexMap;

use corescope_common::{ByteOrder, Language};

use crate::buffer::Buffer;
use crate::error::{DwarfError, Result};
use crate::module::{Die, ModuleDwarf, Slice};
use crate::{DieRef, DwarfIndex};

/// Limit on type construction recursion, to bound malformed DWARF with
/// reference cycles that memoization cannot break.
const MAX_TYPE_DEPTH: u32 = 1000;

/// Identifies a type node within its owning [`DebugInfo`](crate::DebugInfo).
///
/// Ids are only meaningful together with the `DebugInfo` that created them.
/// Two ids compare equal exactly when they are the same node, which for
/// pointer, array, and primitive types also means structural equality.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TypeId(u32);

/// Type qualifiers, as a bitset.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct Qualifiers(u8);

impl Qualifiers {
    /// No qualifiers.
    pub const NONE: Qualifiers = Qualifiers(0);
    /// `const`
    pub const CONST: Qualifiers = Qualifiers(1 << 0);
    /// `volatile`
    pub const VOLATILE: Qualifiers = Qualifiers(1 << 1);
    /// `restrict`
    pub const RESTRICT: Qualifiers = Qualifiers(1 << 2);
    /// `_Atomic`
    pub const ATOMIC: Qualifiers = Qualifiers(1 << 3);

    /// Returns whether all qualifiers in `other` are set.
    pub fn contains(self, other: Qualifiers) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns whether no qualifier is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Qualifiers {
    type Output = Qualifiers;

    fn bitor(self, rhs: Qualifiers) -> Qualifiers {
        Qualifiers(self.0 | rhs.0)
    }
}

impl BitOrAssign for Qualifiers {
    fn bitor_assign(&mut self, rhs: Qualifiers) {
        self.0 |= rhs.0;
    }
}

/// A type node together with its qualifiers.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct QualifiedType {
    /// The unqualified type.
    pub id: TypeId,
    /// Qualifiers applied on top of it.
    pub qualifiers: Qualifiers,
}

impl QualifiedType {
    /// A type with no qualifiers.
    pub fn unqualified(id: TypeId) -> Self {
        QualifiedType {
            id,
            qualifiers: Qualifiers::NONE,
        }
    }
}

/// The kind of a type node.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TypeKind {
    /// `void`
    Void,
    /// Signed or unsigned integer.
    Int,
    /// Boolean.
    Bool,
    /// Floating point.
    Float,
    /// Pointer.
    Pointer,
    /// Array.
    Array,
    /// Structure.
    Struct,
    /// Union.
    Union,
    /// Class.
    Class,
    /// Enumeration.
    Enum,
    /// Typedef.
    Typedef,
    /// Function.
    Function,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TypeKind::Void => "void",
            TypeKind::Int => "int",
            TypeKind::Bool => "bool",
            TypeKind::Float => "float",
            TypeKind::Pointer => "pointer",
            TypeKind::Array => "array",
            TypeKind::Struct => "struct",
            TypeKind::Union => "union",
            TypeKind::Class => "class",
            TypeKind::Enum => "enum",
            TypeKind::Typedef => "typedef",
            TypeKind::Function => "function",
        };
        f.write_str(name)
    }
}

/// Which flavor of compound type a [`Type::Compound`] is.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CompoundKind {
    /// `struct`
    Struct,
    /// `union`
    Union,
    /// `class`
    Class,
}

impl CompoundKind {
    fn type_kind(self) -> TypeKind {
        match self {
            CompoundKind::Struct => TypeKind::Struct,
            CompoundKind::Union => TypeKind::Union,
            CompoundKind::Class => TypeKind::Class,
        }
    }
}

/// A member of a compound type.
///
/// The member's type is lazy: it is resolved through
/// [`DebugInfo::member_type`](crate::DebugInfo::member_type) on first use.
#[derive(Clone, Debug)]
pub struct Member {
    /// The member's name, absent for anonymous members.
    pub name: Option<String>,
    /// Offset of the member from the start of the containing type, in bits.
    pub bit_offset: u64,
    /// Size of a bit-field member in bits, absent for ordinary members.
    pub bit_field_size: Option<u64>,
    pub(crate) die: DieRef,
    pub(crate) can_be_incomplete_array: bool,
}

/// A template parameter of a compound or function type.
#[derive(Clone, Debug)]
pub struct TemplateParameter {
    /// The parameter's name.
    pub name: Option<String>,
    /// Whether the argument was defaulted.
    pub defaulted: bool,
    pub(crate) die: DieRef,
    pub(crate) is_value: bool,
}

impl TemplateParameter {
    /// Returns whether this is a value parameter (as opposed to a type
    /// parameter).
    pub fn is_value(&self) -> bool {
        self.is_value
    }
}

/// A formal parameter of a function type. The parameter's type is lazy,
/// like member types.
#[derive(Clone, Debug)]
pub struct Parameter {
    /// The parameter's name.
    pub name: Option<String>,
    pub(crate) die: DieRef,
}

/// The value of one enumerator.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnumValue {
    /// Value of an enumerator with a signed compatible type.
    Signed(i64),
    /// Value of an enumerator with an unsigned compatible type.
    Unsigned(u64),
}

/// One enumerator of an enumeration type.
#[derive(Clone, Debug)]
pub struct Enumerator {
    /// The enumerator's name.
    pub name: String,
    /// The enumerator's value.
    pub value: EnumValue,
}

/// An immutable type node.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Type {
    /// `void`
    Void {
        /// Language of the unit the type came from.
        language: Language,
    },
    /// An integer type.
    Int {
        /// The type's name.
        name: String,
        /// Size in bytes.
        size: u64,
        /// Whether the type is signed.
        signed: bool,
        /// Byte order of values of this type.
        byte_order: ByteOrder,
    },
    /// A boolean type.
    Bool {
        /// The type's name.
        name: String,
        /// Size in bytes.
        size: u64,
        /// Byte order of values of this type.
        byte_order: ByteOrder,
    },
    /// A floating-point type.
    Float {
        /// The type's name.
        name: String,
        /// Size in bytes.
        size: u64,
        /// Byte order of values of this type.
        byte_order: ByteOrder,
    },
    /// A pointer type.
    Pointer {
        /// The referenced type.
        referenced: QualifiedType,
        /// Size in bytes.
        size: u64,
        /// Byte order of values of this type.
        byte_order: ByteOrder,
    },
    /// An array type. A missing length means the array type is incomplete.
    Array {
        /// The element type.
        element: QualifiedType,
        /// Number of elements, absent for an incomplete array.
        length: Option<u64>,
    },
    /// A structure, union, or class type.
    Compound {
        /// Which flavor of compound type this is.
        kind: CompoundKind,
        /// The type's tag, absent for anonymous types.
        tag: Option<String>,
        /// Size in bytes, 0 for incomplete types.
        size: u64,
        /// The type's members, in declaration order.
        members: Vec<Member>,
        /// Template parameters, for C++ types.
        template_parameters: Vec<TemplateParameter>,
        /// Whether the type is complete (has a definition).
        complete: bool,
        /// Language of the unit the type came from.
        language: Language,
    },
    /// An enumeration type.
    Enum {
        /// The type's tag, absent for anonymous types.
        tag: Option<String>,
        /// The compatible integer type, absent for incomplete enums.
        compatible: Option<TypeId>,
        /// The enumerators, in declaration order.
        enumerators: Vec<Enumerator>,
        /// Whether the type is complete.
        complete: bool,
        /// Language of the unit the type came from.
        language: Language,
    },
    /// A typedef.
    Typedef {
        /// The typedef's name.
        name: String,
        /// The aliased type.
        aliased: QualifiedType,
        /// Language of the unit the type came from.
        language: Language,
    },
    /// A function type.
    Function {
        /// The return type.
        return_type: QualifiedType,
        /// The formal parameters.
        parameters: Vec<Parameter>,
        /// Whether the function takes variadic arguments.
        variadic: bool,
        /// Template parameters, for C++ functions.
        template_parameters: Vec<TemplateParameter>,
        /// Language of the unit the type came from.
        language: Language,
    },
}

impl Type {
    /// Returns the node's kind.
    pub fn kind(&self) -> TypeKind {
        match self {
            Type::Void { .. } => TypeKind::Void,
            Type::Int { .. } => TypeKind::Int,
            Type::Bool { .. } => TypeKind::Bool,
            Type::Float { .. } => TypeKind::Float,
            Type::Pointer { .. } => TypeKind::Pointer,
            Type::Array { .. } => TypeKind::Array,
            Type::Compound { kind, .. } => kind.type_kind(),
            Type::Enum { .. } => TypeKind::Enum,
            Type::Typedef { .. } => TypeKind::Typedef,
            Type::Function { .. } => TypeKind::Function,
        }
    }
}

#[derive(Clone, Eq, Hash, PartialEq)]
struct PrimitiveKey {
    kind: TypeKind,
    name: String,
    size: u64,
    signed: bool,
    byte_order: ByteOrder,
}

/// The arena owning all type nodes of a [`DebugInfo`](crate::DebugInfo).
pub(crate) struct TypeGraph {
    types: Vec<Type>,
    void_types: IndexMap<Language, TypeId>,
    primitive_types: IndexMap<PrimitiveKey, TypeId>,
    pointer_types: IndexMap<(QualifiedType, u64, ByteOrder), TypeId>,
    array_types: IndexMap<(QualifiedType, Option<u64>), TypeId>,
}

impl TypeGraph {
    pub(crate) fn new() -> Self {
        TypeGraph {
            types: Vec::new(),
            void_types: IndexMap::new(),
            primitive_types: IndexMap::new(),
            pointer_types: IndexMap::new(),
            array_types: IndexMap::new(),
        }
    }

    fn insert(&mut self, ty: Type) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    pub(crate) fn get(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub(crate) fn kind(&self, id: TypeId) -> TypeKind {
        self.get(id).kind()
    }

    pub(crate) fn void_type(&mut self, language: Language) -> TypeId {
        if let Some(&id) = self.void_types.get(&language) {
            return id;
        }
        let id = self.insert(Type::Void { language });
        self.void_types.insert(language, id);
        id
    }

    fn primitive_type(&mut self, key: PrimitiveKey, ty: Type) -> TypeId {
        if let Some(&id) = self.primitive_types.get(&key) {
            return id;
        }
        let id = self.insert(ty);
        self.primitive_types.insert(key, id);
        id
    }

    pub(crate) fn int_type(
        &mut self,
        name: String,
        size: u64,
        signed: bool,
        byte_order: ByteOrder,
    ) -> TypeId {
        let key = PrimitiveKey {
            kind: TypeKind::Int,
            name: name.clone(),
            size,
            signed,
            byte_order,
        };
        self.primitive_type(
            key,
            Type::Int {
                name,
                size,
                signed,
                byte_order,
            },
        )
    }

    pub(crate) fn bool_type(&mut self, name: String, size: u64, byte_order: ByteOrder) -> TypeId {
        let key = PrimitiveKey {
            kind: TypeKind::Bool,
            name: name.clone(),
            size,
            signed: false,
            byte_order,
        };
        self.primitive_type(
            key,
            Type::Bool {
                name,
                size,
                byte_order,
            },
        )
    }

    pub(crate) fn float_type(&mut self, name: String, size: u64, byte_order: ByteOrder) -> TypeId {
        let key = PrimitiveKey {
            kind: TypeKind::Float,
            name: name.clone(),
            size,
            signed: true,
            byte_order,
        };
        self.primitive_type(
            key,
            Type::Float {
                name,
                size,
                byte_order,
            },
        )
    }

    pub(crate) fn pointer_type(
        &mut self,
        referenced: QualifiedType,
        size: u64,
        byte_order: ByteOrder,
    ) -> TypeId {
        if let Some(&id) = self.pointer_types.get(&(referenced, size, byte_order)) {
            return id;
        }
        let id = self.insert(Type::Pointer {
            referenced,
            size,
            byte_order,
        });
        self.pointer_types.insert((referenced, size, byte_order), id);
        id
    }

    pub(crate) fn array_type(&mut self, element: QualifiedType, length: Option<u64>) -> TypeId {
        if let Some(&id) = self.array_types.get(&(element, length)) {
            return id;
        }
        let id = self.insert(Type::Array { element, length });
        self.array_types.insert((element, length), id);
        id
    }

    /// Strips typedefs.
    pub(crate) fn underlying(&self, id: TypeId) -> TypeId {
        let mut id = id;
        while let Type::Typedef { aliased, .. } = self.get(id) {
            id = aliased.id;
        }
        id
    }

    /// Returns the size of a type in bytes.
    pub(crate) fn byte_size(&self, id: TypeId) -> Result<u64> {
        match self.get(id) {
            Type::Void { .. } => Err(DwarfError::Other(
                "cannot get size of void type".to_owned(),
            )),
            Type::Int { size, .. } | Type::Bool { size, .. } | Type::Float { size, .. } => {
                Ok(*size)
            }
            Type::Pointer { size, .. } => Ok(*size),
            Type::Array { element, length } => match length {
                Some(length) => length
                    .checked_mul(self.byte_size(element.id)?)
                    .ok_or(DwarfError::Overflow("array type is too large")),
                None => Err(DwarfError::Other(
                    "cannot get size of incomplete array type".to_owned(),
                )),
            },
            Type::Compound { size, complete, .. } => {
                if *complete {
                    Ok(*size)
                } else {
                    Err(DwarfError::Other(
                        "cannot get size of incomplete type".to_owned(),
                    ))
                }
            }
            Type::Enum { compatible, .. } => match compatible {
                Some(compatible) => self.byte_size(*compatible),
                None => Err(DwarfError::Other(
                    "cannot get size of incomplete enumeration type".to_owned(),
                )),
            },
            Type::Typedef { aliased, .. } => self.byte_size(aliased.id),
            Type::Function { .. } => Err(DwarfError::Other(
                "cannot get size of function type".to_owned(),
            )),
        }
    }

    /// Returns the size of a type in bits.
    pub(crate) fn bit_size(&self, id: TypeId) -> Result<u64> {
        self.byte_size(id)?
            .checked_mul(8)
            .ok_or(DwarfError::Overflow("type is too large"))
    }

    /// Returns the byte order values of this type are stored in.
    pub(crate) fn byte_order(&self, id: TypeId, default: ByteOrder) -> ByteOrder {
        match self.get(id) {
            Type::Int { byte_order, .. }
            | Type::Bool { byte_order, .. }
            | Type::Float { byte_order, .. }
            | Type::Pointer { byte_order, .. } => *byte_order,
            Type::Enum { compatible, .. } => match compatible {
                Some(compatible) => self.byte_order(*compatible, default),
                None => default,
            },
            Type::Typedef { aliased, .. } => self.byte_order(aliased.id, default),
            _ => default,
        }
    }

    /// Returns whether values of this type are interpreted as signed.
    pub(crate) fn is_signed(&self, id: TypeId) -> bool {
        match self.get(self.underlying(id)) {
            Type::Int { signed, .. } => *signed,
            Type::Enum {
                compatible: Some(compatible),
                ..
            } => self.is_signed(*compatible),
            _ => false,
        }
    }
}

#[derive(Clone, Copy)]
struct TypeMapEntry {
    id: TypeId,
    qualifiers: Qualifiers,
    is_incomplete_array: bool,
}

/// Memoization state of the type constructor.
pub(crate) struct TypeTables {
    pub(crate) graph: TypeGraph,
    types: HashMap<DieRef, TypeMapEntry>,
    /// Specialization of `types` for positions where an incomplete array
    /// encoding must be read as a zero-length array.
    cant_be_incomplete_array_types: HashMap<DieRef, TypeMapEntry>,
    depth: u32,
}

impl TypeTables {
    pub(crate) fn new() -> Self {
        TypeTables {
            graph: TypeGraph::new(),
            types: HashMap::new(),
            cant_be_incomplete_array_types: HashMap::new(),
            depth: 0,
        }
    }
}

/// The type constructor: borrows the modules, the type tables, and the name
/// index for the duration of one lookup.
pub(crate) struct Typer<'i, 'data> {
    pub(crate) modules: &'i [ModuleDwarf<'data>],
    pub(crate) tables: &'i mut TypeTables,
    pub(crate) index: &'i dyn DwarfIndex,
}

impl<'i, 'data> Typer<'i, 'data> {
    /// Resolves a [`DieRef`] to a [`Die`] handle.
    pub(crate) fn die(&self, die_ref: DieRef) -> Result<Die<'i, 'data>> {
        let modules = self.modules;
        let module = modules.get(die_ref.module).ok_or_else(|| {
            DwarfError::Other(format!("module index {} out of range", die_ref.module))
        })?;
        let (unit, offset) = module.unit_containing(die_ref.offset)?;
        Ok(Die {
            module_index: die_ref.module,
            module,
            unit,
            offset,
        })
    }

    /// Parses a type from a DWARF debugging information entry.
    pub(crate) fn type_from_dwarf(&mut self, die_ref: DieRef) -> Result<QualifiedType> {
        self.type_from_dwarf_internal(die_ref, true)
            .map(|(qualified_type, _)| qualified_type)
    }

    /// Parses a type, controlling whether an incomplete array encoding is
    /// acceptable.
    ///
    /// GCC before 9.0 encodes zero-length array types the same as incomplete
    /// array types. In positions where an incomplete array cannot appear (a
    /// non-last struct member, a union member, an array element), what looks
    /// like an incomplete array must actually have length zero, and callers
    /// pass `can_be_incomplete_array = false`. The second return value
    /// reports whether the *encoding* was an incomplete array (or a typedef
    /// of one), regardless of the flag.
    fn type_from_dwarf_internal(
        &mut self,
        die_ref: DieRef,
        can_be_incomplete_array: bool,
    ) -> Result<(QualifiedType, bool)> {
        if self.tables.depth >= MAX_TYPE_DEPTH {
            return Err(DwarfError::Recursion);
        }

        let mut die = self.die(die_ref)?;

        // If the DIE has a type unit signature, follow it.
        if let Some((attr_die, value)) = die.attr_integrate(constants::DW_AT_signature)? {
            die = attr_die.resolve_ref(value)?;
        }

        // If we got a declaration, try to find the definition.
        if die.flag(constants::DW_AT_declaration)? {
            if let Some(definition) = self.index.find_definition(die.die_ref()) {
                die = self.die(definition)?;
            }
        }

        let die_ref = die.die_ref();
        if let Some(&entry) = self.tables.types.get(&die_ref) {
            if !can_be_incomplete_array && entry.is_incomplete_array {
                if let Some(&entry) = self.tables.cant_be_incomplete_array_types.get(&die_ref) {
                    return Ok(entry_result(entry));
                }
            } else {
                return Ok(entry_result(entry));
            }
        }

        let language = die.language(true).unwrap_or(Language::DEFAULT);
        let tag = die.tag()?;

        self.tables.depth += 1;
        let result = self.build_type(die, tag, language, can_be_incomplete_array);
        self.tables.depth -= 1;
        let (qualified_type, is_incomplete_array) = result?;

        let entry = TypeMapEntry {
            id: qualified_type.id,
            qualifiers: qualified_type.qualifiers,
            is_incomplete_array,
        };
        if !can_be_incomplete_array && is_incomplete_array {
            self.tables
                .cant_be_incomplete_array_types
                .insert(die_ref, entry);
        } else {
            self.tables.types.insert(die_ref, entry);
        }
        Ok((qualified_type, is_incomplete_array))
    }

    fn build_type(
        &mut self,
        die: Die<'i, 'data>,
        tag: constants::DwTag,
        language: Language,
        can_be_incomplete_array: bool,
    ) -> Result<(QualifiedType, bool)> {
        let qualifier = match tag {
            constants::DW_TAG_const_type => Some(Qualifiers::CONST),
            constants::DW_TAG_volatile_type => Some(Qualifiers::VOLATILE),
            constants::DW_TAG_restrict_type => Some(Qualifiers::RESTRICT),
            constants::DW_TAG_atomic_type => Some(Qualifiers::ATOMIC),
            _ => None,
        };
        if let Some(qualifier) = qualifier {
            let (mut qualified_type, is_incomplete_array) =
                self.type_from_attr(die, Some(language), true, can_be_incomplete_array)?;
            qualified_type.qualifiers |= qualifier;
            return Ok((qualified_type, is_incomplete_array));
        }

        let mut is_incomplete_array = false;
        let id = match tag {
            constants::DW_TAG_base_type => self.base_type_from_dwarf(die)?,
            constants::DW_TAG_structure_type => {
                self.compound_type_from_dwarf(die, language, CompoundKind::Struct)?
            }
            constants::DW_TAG_union_type => {
                self.compound_type_from_dwarf(die, language, CompoundKind::Union)?
            }
            constants::DW_TAG_class_type => {
                self.compound_type_from_dwarf(die, language, CompoundKind::Class)?
            }
            constants::DW_TAG_enumeration_type => self.enum_type_from_dwarf(die, language)?,
            constants::DW_TAG_typedef => {
                let (id, incomplete) =
                    self.typedef_type_from_dwarf(die, language, can_be_incomplete_array)?;
                is_incomplete_array = incomplete;
                id
            }
            constants::DW_TAG_pointer_type => self.pointer_type_from_dwarf(die, language)?,
            constants::DW_TAG_array_type => {
                let (id, incomplete) =
                    self.array_type_from_dwarf(die, language, can_be_incomplete_array)?;
                is_incomplete_array = incomplete;
                id
            }
            constants::DW_TAG_subroutine_type | constants::DW_TAG_subprogram => {
                self.function_type_from_dwarf(die, language)?
            }
            _ => {
                return Err(DwarfError::Other(format!("unknown DWARF type tag {tag}")));
            }
        };
        Ok((QualifiedType::unqualified(id), is_incomplete_array))
    }

    /// Parses a type from the `DW_AT_type` attribute of a DIE.
    ///
    /// A missing attribute is interpreted as `void` when `can_be_void` is
    /// set and is an error otherwise.
    pub(crate) fn type_from_attr(
        &mut self,
        die: Die<'i, 'data>,
        language: Option<Language>,
        can_be_void: bool,
        can_be_incomplete_array: bool,
    ) -> Result<(QualifiedType, bool)> {
        match die.type_die()? {
            Some(type_die) => {
                self.type_from_dwarf_internal(type_die.die_ref(), can_be_incomplete_array)
            }
            None if can_be_void => {
                let language = language
                    .or_else(|| die.language(true))
                    .unwrap_or(Language::DEFAULT);
                let id = self.tables.graph.void_type(language);
                Ok((QualifiedType::unqualified(id), false))
            }
            None => Err(DwarfError::Other(format!(
                "{} is missing DW_AT_type",
                die.tag()?
            ))),
        }
    }

    fn base_type_from_dwarf(&mut self, die: Die<'i, 'data>) -> Result<TypeId> {
        let name = die.name()?.ok_or_else(|| {
            DwarfError::Other("DW_TAG_base_type has missing or invalid DW_AT_name".to_owned())
        })?;

        let encoding = match die.attr_integrate(constants::DW_AT_encoding)? {
            Some((_, AttributeValue::Encoding(encoding))) => encoding,
            Some((_, value)) => match value.udata_value() {
                Some(encoding) => constants::DwAte(encoding as u8),
                None => {
                    return Err(DwarfError::Other(
                        "DW_TAG_base_type has missing or invalid DW_AT_encoding".to_owned(),
                    ))
                }
            },
            None => {
                return Err(DwarfError::Other(
                    "DW_TAG_base_type has missing or invalid DW_AT_encoding".to_owned(),
                ))
            }
        };
        let size = die.udata_integrate(constants::DW_AT_byte_size)?.ok_or_else(|| {
            DwarfError::Other("DW_TAG_base_type has missing or invalid DW_AT_byte_size".to_owned())
        })?;
        let byte_order = die_byte_order(die, true)?;

        let graph = &mut self.tables.graph;
        match encoding {
            constants::DW_ATE_boolean => Ok(graph.bool_type(name, size, byte_order)),
            constants::DW_ATE_float => Ok(graph.float_type(name, size, byte_order)),
            constants::DW_ATE_signed | constants::DW_ATE_signed_char => {
                Ok(graph.int_type(name, size, true, byte_order))
            }
            constants::DW_ATE_unsigned | constants::DW_ATE_unsigned_char => {
                Ok(graph.int_type(name, size, false, byte_order))
            }
            // Complex floats are not supported.
            _ => Err(DwarfError::Other(format!(
                "DW_TAG_base_type has unknown DWARF encoding {:#x}",
                encoding.0
            ))),
        }
    }

    /// Tries to find the complete type for a declaration through the index.
    ///
    /// The index does not contain declarations, so any match is a complete
    /// type. If more than one type matches, we cannot know which one was
    /// meant, so the declaration stays incomplete rather than guessing.
    fn find_complete(&mut self, tag: constants::DwTag, name: &str) -> Result<TypeId> {
        let index = self.index;
        let mut matches = index.iter_matches(&[], name, &[tag]);
        let first = matches.next().ok_or(DwarfError::NotFound)?;
        if matches.next().is_some() {
            return Err(DwarfError::NotFound);
        }
        drop(matches);
        let qualified_type = self.type_from_dwarf(first)?;
        Ok(qualified_type.id)
    }

    fn compound_type_from_dwarf(
        &mut self,
        die: Die<'i, 'data>,
        language: Language,
        kind: CompoundKind,
    ) -> Result<TypeId> {
        let tag_name = die.name()?;
        let declaration = die.flag(constants::DW_AT_declaration)?;
        if declaration {
            if let Some(tag_name) = &tag_name {
                match self.find_complete(die.tag()?, tag_name) {
                    Ok(id) => return Ok(id),
                    Err(DwarfError::NotFound) => {}
                    Err(err) => return Err(err),
                }
            }
        }

        let little_endian = die_byte_order(die, false)?.is_little_endian();
        let size = if declaration {
            0
        } else {
            die.udata_integrate(constants::DW_AT_byte_size)?.ok_or_else(|| {
                DwarfError::Other(format!(
                    "{} has missing or invalid DW_AT_byte_size",
                    die.tag().unwrap_or(constants::DW_TAG_structure_type)
                ))
            })?
        };

        let mut members = Vec::new();
        let mut template_parameters = Vec::new();
        // Defer each member until the next one is seen: whether an
        // incomplete array encoding can be taken at face value depends on
        // whether the member is the last one.
        let mut pending_member: Option<Die<'i, 'data>> = None;
        let mut children = die.children()?;
        while let Some(child) = children.next()? {
            match child.tag()? {
                constants::DW_TAG_member => {
                    if !declaration {
                        if let Some(previous) = pending_member.take() {
                            self.parse_member(previous, little_endian, false, &mut members)?;
                        }
                        pending_member = Some(child);
                    }
                }
                constants::DW_TAG_template_type_parameter => {
                    template_parameters.push(self.parse_template_parameter(child, false)?);
                }
                constants::DW_TAG_template_value_parameter => {
                    template_parameters.push(self.parse_template_parameter(child, true)?);
                }
                _ => {}
            }
        }
        // Flexible array members are only allowed as the last member of a
        // structure with at least one other member.
        if let Some(previous) = pending_member.take() {
            let can_be_incomplete_array = kind != CompoundKind::Union && !members.is_empty();
            self.parse_member(previous, little_endian, can_be_incomplete_array, &mut members)?;
        }

        Ok(self.tables.graph.insert(Type::Compound {
            kind,
            tag: tag_name,
            size,
            members,
            template_parameters,
            complete: !declaration,
            language,
        }))
    }

    fn parse_member(
        &mut self,
        die: Die<'i, 'data>,
        little_endian: bool,
        can_be_incomplete_array: bool,
        members: &mut Vec<Member>,
    ) -> Result<()> {
        let name = die.name()?;
        let bit_field_size = die.udata_integrate(constants::DW_AT_bit_size)?;
        let bit_offset =
            self.parse_member_offset(die, little_endian, bit_field_size, can_be_incomplete_array)?;
        members.push(Member {
            name,
            bit_offset,
            bit_field_size,
            die: die.die_ref(),
            can_be_incomplete_array,
        });
        Ok(())
    }

    fn parse_member_offset(
        &mut self,
        die: Die<'i, 'data>,
        little_endian: bool,
        bit_field_size: Option<u64>,
        can_be_incomplete_array: bool,
    ) -> Result<u64> {
        // The simplest case is DW_AT_data_bit_offset, which is already the
        // offset in bits from the beginning of the containing object to the
        // beginning of the member.
        if let Some((_, value)) = die.attr_integrate(constants::DW_AT_data_bit_offset)? {
            return value.udata_value().ok_or_else(|| {
                DwarfError::Other("DW_TAG_member has invalid DW_AT_data_bit_offset".to_owned())
            });
        }

        // Otherwise, we might have DW_AT_data_member_location, the offset
        // in bytes from the beginning of the containing object.
        let mut offset = match die.attr_integrate(constants::DW_AT_data_member_location)? {
            Some((_, value)) => parse_data_member_location(die.module, value)?
                .checked_mul(8)
                .ok_or(DwarfError::Overflow("DW_AT_data_member_location is too large"))?,
            None => 0,
        };

        // A bit field might additionally have DW_AT_bit_offset, the offset
        // in bits of the most significant bit of the field from the most
        // significant bit of the containing object.
        if let Some((_, value)) = die.attr_integrate(constants::DW_AT_bit_offset)? {
            let bit_offset = value.udata_value().ok_or_else(|| {
                DwarfError::Other("DW_TAG_member has invalid DW_AT_bit_offset".to_owned())
            })?;
            if little_endian {
                // On little-endian machines we must compute the location of
                // the most significant bit from the size of the member, then
                // subtract the bit offset and bit size to get the location
                // of the beginning of the bit field.
                let byte_size = match die.udata_integrate(constants::DW_AT_byte_size)? {
                    Some(byte_size) => byte_size,
                    None => {
                        let (member_type, _) =
                            self.type_from_attr(die, None, false, can_be_incomplete_array)?;
                        self.tables.graph.byte_size(member_type.id)?
                    }
                };
                let bit_size = match bit_field_size {
                    Some(bit_size) => bit_size,
                    None => byte_size.wrapping_mul(8),
                };
                offset = offset
                    .wrapping_add(byte_size.wrapping_mul(8))
                    .wrapping_sub(bit_offset)
                    .wrapping_sub(bit_size);
            } else {
                // On big-endian machines the most significant bit of the
                // bit field is its beginning.
                offset = offset.wrapping_add(bit_offset);
            }
        }

        Ok(offset)
    }

    fn parse_template_parameter(
        &mut self,
        die: Die<'i, 'data>,
        is_value: bool,
    ) -> Result<TemplateParameter> {
        let name = die.name()?;
        let defaulted = die.flag_integrate(constants::DW_AT_default_value)?;
        Ok(TemplateParameter {
            name,
            defaulted,
            die: die.die_ref(),
            is_value,
        })
    }

    fn enum_type_from_dwarf(&mut self, die: Die<'i, 'data>, language: Language) -> Result<TypeId> {
        let tag_name = die.name()?;
        let declaration = die.flag(constants::DW_AT_declaration)?;
        if declaration {
            if let Some(tag_name) = &tag_name {
                match self.find_complete(constants::DW_TAG_enumeration_type, tag_name) {
                    Ok(id) => return Ok(id),
                    Err(DwarfError::NotFound) => {}
                    Err(err) => return Err(err),
                }
            }
            return Ok(self.tables.graph.insert(Type::Enum {
                tag: tag_name,
                compatible: None,
                enumerators: Vec::new(),
                complete: false,
                language,
            }));
        }

        let mut enumerators = Vec::new();
        // GCC before 7.1 did not include DW_AT_encoding for
        // DW_TAG_enumeration_type DIEs, so we have to guess the signedness
        // for the compatible-type fallback.
        let mut is_signed = false;
        let mut children = die.children()?;
        while let Some(child) = children.next()? {
            if child.tag()? != constants::DW_TAG_enumerator {
                continue;
            }
            let name = child.name()?.ok_or_else(|| {
                DwarfError::Other(
                    "DW_TAG_enumerator has missing or invalid DW_AT_name".to_owned(),
                )
            })?;
            let value = match child.attr_integrate(constants::DW_AT_const_value)? {
                Some((_, AttributeValue::Sdata(value))) => {
                    if value < 0 {
                        is_signed = true;
                    }
                    EnumValue::Signed(value)
                }
                Some((_, value)) => match value.udata_value() {
                    Some(value) => EnumValue::Unsigned(value),
                    None => {
                        return Err(DwarfError::Other(
                            "DW_TAG_enumerator has invalid DW_AT_const_value".to_owned(),
                        ))
                    }
                },
                None => {
                    return Err(DwarfError::Other(
                        "DW_TAG_enumerator is missing DW_AT_const_value".to_owned(),
                    ))
                }
            };
            enumerators.push(Enumerator { name, value });
        }

        let compatible = match die.type_die()? {
            Some(type_die) => {
                let qualified_type = self.type_from_dwarf(type_die.die_ref())?;
                let underlying = self.tables.graph.underlying(qualified_type.id);
                if self.tables.graph.kind(underlying) != TypeKind::Int {
                    return Err(DwarfError::Other(
                        "DW_AT_type of DW_TAG_enumeration_type is not an integer type".to_owned(),
                    ));
                }
                underlying
            }
            None => {
                // GCC before 5.1 did not include DW_AT_type for
                // DW_TAG_enumeration_type DIEs, so we have to fabricate the
                // compatible type.
                let size = die.udata_integrate(constants::DW_AT_byte_size)?.ok_or_else(|| {
                    DwarfError::Other(
                        "DW_TAG_enumeration_type has missing or invalid DW_AT_byte_size"
                            .to_owned(),
                    )
                })?;
                let byte_order = die_byte_order(die, false)?;
                self.tables
                    .graph
                    .int_type("<unknown>".to_owned(), size, is_signed, byte_order)
            }
        };

        Ok(self.tables.graph.insert(Type::Enum {
            tag: tag_name,
            compatible: Some(compatible),
            enumerators,
            complete: true,
            language,
        }))
    }

    fn typedef_type_from_dwarf(
        &mut self,
        die: Die<'i, 'data>,
        language: Language,
        can_be_incomplete_array: bool,
    ) -> Result<(TypeId, bool)> {
        let name = die.name()?.ok_or_else(|| {
            DwarfError::Other("DW_TAG_typedef has missing or invalid DW_AT_name".to_owned())
        })?;
        let (aliased, is_incomplete_array) =
            self.type_from_attr(die, Some(language), true, can_be_incomplete_array)?;
        let id = self.tables.graph.insert(Type::Typedef {
            name,
            aliased,
            language,
        });
        Ok((id, is_incomplete_array))
    }

    fn pointer_type_from_dwarf(
        &mut self,
        die: Die<'i, 'data>,
        language: Language,
    ) -> Result<TypeId> {
        let (referenced, _) = self.type_from_attr(die, Some(language), true, true)?;
        let size = match die.udata_integrate(constants::DW_AT_byte_size)? {
            Some(size) => size,
            None => u64::from(die.module.platform().address_size()),
        };
        // GCC as of 10.2 does not emit DW_AT_endianity for pointers even
        // when scalar_storage_order is used, but it probably should.
        let byte_order = die_byte_order(die, false)?;
        Ok(self.tables.graph.pointer_type(referenced, size, byte_order))
    }

    fn array_type_from_dwarf(
        &mut self,
        die: Die<'i, 'data>,
        language: Language,
        can_be_incomplete_array: bool,
    ) -> Result<(TypeId, bool)> {
        let mut dimensions = Vec::new();
        let mut children = die.children()?;
        while let Some(child) = children.next()? {
            if child.tag()? == constants::DW_TAG_subrange_type {
                dimensions.push(subrange_length(child)?);
            }
        }
        if dimensions.is_empty() {
            dimensions.push(None);
        }

        let (element_type, _) = self.type_from_attr(die, Some(language), false, false)?;

        let is_incomplete_array = dimensions[0].is_none();
        let mut qualified_type = element_type;
        while let Some(dimension) = dimensions.pop() {
            let length = match dimension {
                Some(length) => Some(length),
                // An inner dimension or a position that cannot hold an
                // incomplete array must be a zero-length array.
                None if !dimensions.is_empty() || !can_be_incomplete_array => Some(0),
                None => None,
            };
            let id = self.tables.graph.array_type(qualified_type, length);
            qualified_type = QualifiedType::unqualified(id);
        }
        Ok((qualified_type.id, is_incomplete_array))
    }

    fn function_type_from_dwarf(
        &mut self,
        die: Die<'i, 'data>,
        language: Language,
    ) -> Result<TypeId> {
        let mut parameters = Vec::new();
        let mut template_parameters = Vec::new();
        let mut variadic = false;
        let mut children = die.children()?;
        while let Some(child) = children.next()? {
            match child.tag()? {
                constants::DW_TAG_formal_parameter => {
                    if variadic {
                        return Err(DwarfError::Other(format!(
                            "{} has DW_TAG_formal_parameter child after \
                             DW_TAG_unspecified_parameters child",
                            die.tag()?
                        )));
                    }
                    parameters.push(Parameter {
                        name: child.name()?,
                        die: child.die_ref(),
                    });
                }
                constants::DW_TAG_unspecified_parameters => {
                    if variadic {
                        return Err(DwarfError::Other(format!(
                            "{} has multiple DW_TAG_unspecified_parameters children",
                            die.tag()?
                        )));
                    }
                    variadic = true;
                }
                constants::DW_TAG_template_type_parameter => {
                    template_parameters.push(self.parse_template_parameter(child, false)?);
                }
                constants::DW_TAG_template_value_parameter => {
                    template_parameters.push(self.parse_template_parameter(child, true)?);
                }
                _ => {}
            }
        }

        let (return_type, _) = self.type_from_attr(die, Some(language), true, true)?;
        Ok(self.tables.graph.insert(Type::Function {
            return_type,
            parameters,
            variadic,
            template_parameters,
            language,
        }))
    }

    /// Resolves the lazy type of a compound member.
    pub(crate) fn member_type(&mut self, member: &Member) -> Result<QualifiedType> {
        let die = self.die(member.die)?;
        self.type_from_attr(die, None, false, member.can_be_incomplete_array)
            .map(|(qualified_type, _)| qualified_type)
    }

    /// Resolves the lazy type of a function parameter.
    pub(crate) fn parameter_type(&mut self, parameter: &Parameter) -> Result<QualifiedType> {
        let die = self.die(parameter.die)?;
        self.type_from_attr(die, None, false, true)
            .map(|(qualified_type, _)| qualified_type)
    }

    /// Finds a type by kind and name through the index.
    pub(crate) fn find_type(
        &mut self,
        kind: TypeKind,
        name: &str,
        filename: Option<&str>,
    ) -> Result<QualifiedType> {
        let tag = match kind {
            TypeKind::Int | TypeKind::Bool | TypeKind::Float => constants::DW_TAG_base_type,
            TypeKind::Struct => constants::DW_TAG_structure_type,
            TypeKind::Union => constants::DW_TAG_union_type,
            TypeKind::Class => constants::DW_TAG_class_type,
            TypeKind::Enum => constants::DW_TAG_enumeration_type,
            TypeKind::Typedef => constants::DW_TAG_typedef,
            _ => {
                return Err(DwarfError::Other(format!(
                    "cannot look up {kind} type by name"
                )))
            }
        };

        let index = self.index;
        for die_ref in index.iter_matches(&[], name, &[tag]) {
            let die = self.die(die_ref)?;
            if !die_matches_filename(die, filename)? {
                continue;
            }
            let qualified_type = self.type_from_dwarf(die_ref)?;
            // For DW_TAG_base_type, check that the type we found was the
            // right kind.
            if self.tables.graph.kind(qualified_type.id) == kind {
                return Ok(qualified_type);
            }
        }
        Err(DwarfError::NotFound)
    }
}

fn entry_result(entry: TypeMapEntry) -> (QualifiedType, bool) {
    (
        QualifiedType {
            id: entry.id,
            qualifiers: entry.qualifiers,
        },
        entry.is_incomplete_array,
    )
}

/// Returns the byte order of a DIE, honoring `DW_AT_endianity` when
/// `check_attr` is set and falling back to the module's byte order.
pub(crate) fn die_byte_order(die: Die<'_, '_>, check_attr: bool) -> Result<ByteOrder> {
    let endianity = if check_attr {
        match die.attr_integrate(constants::DW_AT_endianity)? {
            Some((_, AttributeValue::Endianity(endianity))) => Some(endianity),
            Some((_, value)) => match value.udata_value() {
                Some(endianity) => Some(constants::DwEnd(endianity as u8)),
                None => return Err(DwarfError::Other("invalid DW_AT_endianity".to_owned())),
            },
            None => None,
        }
    } else {
        None
    };
    match endianity.unwrap_or(constants::DW_END_default) {
        constants::DW_END_default => Ok(ByteOrder::from_little_endian(
            die.module.is_little_endian(),
        )),
        constants::DW_END_little => Ok(ByteOrder::Little),
        constants::DW_END_big => Ok(ByteOrder::Big),
        _ => Err(DwarfError::Other("unknown DW_AT_endianity".to_owned())),
    }
}

/// Parses `DW_AT_data_member_location` into a byte offset.
///
/// In DWARF 2 the attribute is a location description; a
/// `DW_OP_plus_uconst` expression translates to a constant offset, and any
/// other expression is unsupported. Later versions use a plain constant.
fn parse_data_member_location(
    module: &ModuleDwarf<'_>,
    value: AttributeValue<Slice<'_>>,
) -> Result<u64> {
    let block = match value {
        AttributeValue::Exprloc(expression) => Some(expression.0.slice()),
        AttributeValue::Block(block) => Some(block.slice()),
        _ => None,
    };
    if let Some(block) = block {
        // Only u8 and ULEB128 are parsed here, so the byte order does not
        // matter.
        let mut buf = Buffer::new(block, true, module.name(), None);
        let opcode = buf.read_u8().map_err(|_| invalid_data_member_location())?;
        if constants::DwOp(opcode) != constants::DW_OP_plus_uconst {
            return Err(unsupported_data_member_location());
        }
        let offset = buf
            .read_uleb128()
            .map_err(|_| invalid_data_member_location())?;
        if buf.has_next() {
            return Err(unsupported_data_member_location());
        }
        return Ok(offset);
    }
    match value {
        // A section offset means a location list, which is unsupported
        // here.
        AttributeValue::SecOffset(_) | AttributeValue::LocationListsRef(_) => {
            Err(unsupported_data_member_location())
        }
        _ => value.udata_value().ok_or_else(invalid_data_member_location),
    }
}

fn invalid_data_member_location() -> DwarfError {
    DwarfError::Other("DW_TAG_member has invalid DW_AT_data_member_location".to_owned())
}

fn unsupported_data_member_location() -> DwarfError {
    DwarfError::Other("DW_TAG_member has unsupported DW_AT_data_member_location".to_owned())
}

/// Reads the length of one array dimension from a `DW_TAG_subrange_type`
/// DIE. `None` means the dimension is incomplete.
fn subrange_length(die: Die<'_, '_>) -> Result<Option<u64>> {
    let (is_upper_bound, value) = match die.attr_integrate(constants::DW_AT_upper_bound)? {
        Some((_, value)) => (true, value),
        None => match die.attr_integrate(constants::DW_AT_count)? {
            Some((_, value)) => (false, value),
            None => return Ok(None),
        },
    };

    // GCC emits a DW_FORM_sdata DW_AT_upper_bound of -1 for empty array
    // variables without an explicit size (e.g., `int arr[] = {};`).
    if is_upper_bound {
        if let AttributeValue::Sdata(-1) = value {
            return Ok(Some(0));
        }
    }

    let word = value.udata_value().ok_or_else(|| {
        DwarfError::Other(format!(
            "DW_TAG_subrange_type has invalid {}",
            if is_upper_bound {
                "DW_AT_upper_bound"
            } else {
                "DW_AT_count"
            }
        ))
    })?;

    if is_upper_bound {
        if word == u64::MAX {
            return Err(DwarfError::Overflow("DW_AT_upper_bound is too large"));
        }
        Ok(Some(word + 1))
    } else {
        Ok(Some(word))
    }
}

/// Returns whether a DIE was declared in `filename`.
///
/// A missing filter matches everything; otherwise the DIE's declaration
/// file must end with `filename`'s path components.
pub(crate) fn die_matches_filename(die: Die<'_, '_>, filename: Option<&str>) -> Result<bool> {
    let Some(filename) = filename else {
        return Ok(true);
    };
    if filename.is_empty() {
        return Ok(true);
    }

    let Some(file_index) = die.udata_integrate(constants::DW_AT_decl_file)? else {
        return Ok(false);
    };
    let Some(program) = die.unit.unit.line_program.as_ref() else {
        return Ok(false);
    };
    let header = program.header();
    let Some(file) = header.file(file_index) else {
        return Ok(false);
    };

    let mut path = String::new();
    if let Some(directory) = file.directory(header) {
        if let Some(directory) = die.string_value(directory) {
            path.push_str(&directory);
        }
    }
    if !path.is_empty() && !path.ends_with('/') {
        path.push('/');
    }
    if let Some(name) = die.string_value(file.path_name()) {
        path.push_str(&name);
    }

    Ok(path_ends_with(&path, filename))
}

/// Compares paths by trailing components, so that a filter of `dir/file.c`
/// matches `/src/dir/file.c`.
fn path_ends_with(path: &str, suffix: &str) -> bool {
    let mut path_components = path.split('/').filter(|c| !c.is_empty()).rev();
    let mut suffix_components = suffix.split('/').filter(|c| !c.is_empty()).rev();
    loop {
        match (path_components.next(), suffix_components.next()) {
            (_, None) => return true,
            (None, Some(_)) => return false,
            (Some(a), Some(b)) => {
                if a != b {
                    return false;
                }
            }
        }
    }
}
