//! The DWARF core of `corescope`.
//!
//! This crate turns raw ELF debug sections into a queryable model of a
//! program's types, objects, and call-frame unwind rules. It is the piece a
//! debugger-like tool uses to answer: "what type is this symbol?", "where
//! does this variable live at this program counter?", "how do I unwind one
//! stack frame?".
//!
//! The embedder supplies three collaborators:
//!
//!  - [`ObjectFile`]: section bytes and load geometry for each module.
//!  - [`DwarfIndex`]: a name index mapping `(name, tag)` to DIEs.
//!  - [`MemoryReader`]: access to the target's memory.
//!
//! and drives lookups through [`DebugInfo`], which owns the per-module
//! DWARF state ([`ModuleDwarf`]) and the type graph. Call-frame lookups go
//! through [`ModuleDwarf::find_dwarf_cfi`].
//!
//! All lookups are synchronous, and nothing here is thread-safe: callers
//! that want to parallelize across modules create independent [`DebugInfo`]
//! instances.

#![warn(missing_docs)]

mod buffer;
mod cfi;
mod cursor;
mod error;
mod expr;
mod location;
mod module;
mod object;
#[cfg(test)]
mod testutil;
mod types;

use gimli::constants;

use corescope_common::{Language, RegisterState};

#[doc(hidden)]
pub use gimli;
pub use gimli::{DwTag, RunTimeEndian};

pub use crate::cfi::{eval_dwarf_cfi_rule, DwarfCfi};
pub use crate::cursor::DieCursor;
pub use crate::error::{DwarfError, Result};
pub use crate::module::{DwarfSection, ModuleDwarf, ObjectFile, SectionId};
pub use crate::object::{Object, ObjectEncoding, ObjectValue};
pub use crate::types::{
    CompoundKind, EnumValue, Enumerator, Member, Parameter, QualifiedType, Qualifiers,
    TemplateParameter, Type, TypeId, TypeKind,
};

use crate::module::Die;
use crate::types::{TypeTables, Typer};

/// A reference to one DIE: a module index plus the DIE's global offset
/// within `.debug_info` or `.debug_types` of that module.
///
/// References are stable for as long as the owning [`DebugInfo`] holds the
/// module.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DieRef {
    /// Index of the module within its [`DebugInfo`].
    pub module: usize,
    /// Global offset of the DIE within its section.
    pub offset: gimli::UnitSectionOffset<usize>,
}

/// Reads the target program's memory.
pub trait MemoryReader {
    /// Reads `buf.len()` bytes at `address`.
    ///
    /// `physical` selects a physical rather than virtual address for
    /// targets that distinguish them (e.g. kernel core dumps).
    fn read(&self, buf: &mut [u8], address: u64, physical: bool) -> Result<()>;
}

/// A [`MemoryReader`] for targets without accessible memory.
///
/// Every read fails; lookups that do not need memory work normally.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoMemory;

impl MemoryReader for NoMemory {
    fn read(&self, _buf: &mut [u8], address: u64, _physical: bool) -> Result<()> {
        Err(DwarfError::Other(format!(
            "cannot read memory at {address:#x}"
        )))
    }
}

/// A name index over the DIEs of all modules.
///
/// The index maps `(namespace, name, tag)` to the DIEs that define that
/// name. Two contracts matter to this crate:
///
///  - Declarations (`DW_AT_declaration`) are not indexed, so every match is
///    a definition.
///  - A match for `DW_TAG_enumerator` yields the enclosing
///    `DW_TAG_enumeration_type` DIE, not the enumerator itself.
pub trait DwarfIndex {
    /// Iterates over the definitions of `name` with one of the given tags,
    /// within `namespace` (a path of `::`-separated components, empty for
    /// the global namespace).
    fn iter_matches(
        &self,
        namespace: &[&str],
        name: &str,
        tags: &[DwTag],
    ) -> Box<dyn Iterator<Item = DieRef> + '_>;

    /// Finds the definition corresponding to a declaration DIE, possibly in
    /// another module.
    fn find_definition(&self, declaration: DieRef) -> Option<DieRef>;
}

/// Which kinds of objects [`DebugInfo::find_object`] looks for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FindObjectFlags(u8);

impl FindObjectFlags {
    /// Enumerators.
    pub const CONSTANT: FindObjectFlags = FindObjectFlags(1 << 0);
    /// Functions.
    pub const FUNCTION: FindObjectFlags = FindObjectFlags(1 << 1);
    /// Variables.
    pub const VARIABLE: FindObjectFlags = FindObjectFlags(1 << 2);
    /// Any kind of object.
    pub const ANY: FindObjectFlags = FindObjectFlags(0b111);

    /// Returns whether all flags in `other` are set.
    pub fn contains(self, other: FindObjectFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FindObjectFlags {
    type Output = FindObjectFlags;

    fn bitor(self, rhs: FindObjectFlags) -> FindObjectFlags {
        FindObjectFlags(self.0 | rhs.0)
    }
}

/// A name found in a scope chain by [`DebugInfo::find_in_dwarf_scopes`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ScopeMatch {
    /// The matching DIE: a variable, formal parameter, subprogram, or
    /// enumerator.
    pub die: DieRef,
    /// For an enumerator match, the enclosing enumeration type DIE.
    pub enumeration: Option<DieRef>,
}

/// Debugging information for a set of loaded modules.
///
/// Owns the type graph: all [`TypeId`]s handed out by lookups point into
/// it and stay valid until the `DebugInfo` is dropped.
pub struct DebugInfo<'data> {
    modules: Vec<ModuleDwarf<'data>>,
    tables: TypeTables,
}

impl<'data> Default for DebugInfo<'data> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'data> DebugInfo<'data> {
    /// Creates an empty `DebugInfo`.
    pub fn new() -> Self {
        DebugInfo {
            modules: Vec::new(),
            tables: TypeTables::new(),
        }
    }

    /// Adds a module and returns its index.
    pub fn add_module(&mut self, module: ModuleDwarf<'data>) -> usize {
        self.modules.push(module);
        self.modules.len() - 1
    }

    /// Returns the loaded modules.
    pub fn modules(&self) -> &[ModuleDwarf<'data>] {
        &self.modules
    }

    /// Returns one module.
    pub fn module(&self, index: usize) -> Option<&ModuleDwarf<'data>> {
        self.modules.get(index)
    }

    fn die(&self, die_ref: DieRef) -> Result<Die<'_, 'data>> {
        let module = self.modules.get(die_ref.module).ok_or_else(|| {
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

    fn typer<'i>(&'i mut self, index: &'i dyn DwarfIndex) -> Typer<'i, 'data> {
        Typer {
            modules: &self.modules,
            tables: &mut self.tables,
            index,
        }
    }

    /// Returns a type node.
    pub fn type_(&self, id: TypeId) -> &Type {
        self.tables.graph.get(id)
    }

    /// Returns a type's kind.
    pub fn type_kind(&self, id: TypeId) -> TypeKind {
        self.tables.graph.kind(id)
    }

    /// Returns a type's size in bytes. Incomplete, void, and function
    /// types have no size.
    pub fn byte_size(&self, id: TypeId) -> Result<u64> {
        self.tables.graph.byte_size(id)
    }

    /// Returns a type's size in bits.
    pub fn bit_size(&self, id: TypeId) -> Result<u64> {
        self.tables.graph.bit_size(id)
    }

    /// Strips typedefs from a type.
    pub fn underlying(&self, id: TypeId) -> TypeId {
        self.tables.graph.underlying(id)
    }

    /// Parses the type described by a DIE.
    ///
    /// Results are memoized: parsing the same DIE twice yields the same
    /// [`TypeId`].
    pub fn type_from_dwarf(
        &mut self,
        index: &dyn DwarfIndex,
        die: DieRef,
    ) -> Result<QualifiedType> {
        self.typer(index).type_from_dwarf(die)
    }

    /// Finds a type by kind and name.
    ///
    /// `filename`, when given, restricts matches to types declared in a
    /// file whose path ends with it.
    pub fn find_type(
        &mut self,
        index: &dyn DwarfIndex,
        kind: TypeKind,
        name: &str,
        filename: Option<&str>,
    ) -> Result<QualifiedType> {
        self.typer(index).find_type(kind, name, filename)
    }

    /// Resolves the lazy type of a compound member.
    pub fn member_type(&mut self, index: &dyn DwarfIndex, member: &Member) -> Result<QualifiedType> {
        self.typer(index).member_type(member)
    }

    /// Resolves the lazy type of a function parameter.
    pub fn parameter_type(
        &mut self,
        index: &dyn DwarfIndex,
        parameter: &Parameter,
    ) -> Result<QualifiedType> {
        self.typer(index).parameter_type(parameter)
    }

    /// Materializes the argument of a template parameter.
    pub fn template_parameter_object(
        &mut self,
        index: &dyn DwarfIndex,
        mem: &dyn MemoryReader,
        parameter: &TemplateParameter,
    ) -> Result<Object> {
        object::template_parameter_object(&mut self.typer(index), mem, parameter)
    }

    /// Materializes an object from a data-object or subprogram DIE.
    ///
    /// The object's type comes from `type_die` when given, otherwise from
    /// the DIE itself. `function_die` is the enclosing subprogram, needed
    /// when the location uses `DW_OP_fbreg`. `regs` supplies the program
    /// counter for location lists and the registers location descriptions
    /// may name; without it, objects whose location depends on registers
    /// are reported as absent.
    pub fn object_from_dwarf(
        &mut self,
        index: &dyn DwarfIndex,
        mem: &dyn MemoryReader,
        die: DieRef,
        type_die: Option<DieRef>,
        function_die: Option<DieRef>,
        regs: Option<&RegisterState>,
    ) -> Result<Object> {
        object::object_from_dwarf(&mut self.typer(index), mem, die, type_die, function_die, regs)
    }

    /// Finds an object (constant, function, or variable) by name.
    ///
    /// Names may be qualified with `::` separators; a leading `::` selects
    /// the global namespace explicitly.
    pub fn find_object(
        &mut self,
        index: &dyn DwarfIndex,
        mem: &dyn MemoryReader,
        name: &str,
        filename: Option<&str>,
        flags: FindObjectFlags,
    ) -> Result<Object> {
        // An explicit global namespace prefix is the default anyway.
        let name = name.strip_prefix("::").unwrap_or(name);
        let mut namespace = Vec::new();
        let mut rest = name;
        while let Some(pos) = rest.find("::") {
            namespace.push(&rest[..pos]);
            rest = &rest[pos + 2..];
        }
        let name = rest;

        let mut tags = Vec::new();
        if flags.contains(FindObjectFlags::CONSTANT) {
            tags.push(constants::DW_TAG_enumerator);
        }
        if flags.contains(FindObjectFlags::FUNCTION) {
            tags.push(constants::DW_TAG_subprogram);
        }
        if flags.contains(FindObjectFlags::VARIABLE) {
            tags.push(constants::DW_TAG_variable);
        }

        let matches: Vec<DieRef> = index.iter_matches(&namespace, name, &tags).collect();
        for die_ref in matches {
            let (tag, matches_file) = {
                let die = self.die(die_ref)?;
                (
                    die.tag()?,
                    types::die_matches_filename(die, filename)?,
                )
            };
            if !matches_file {
                continue;
            }
            if tag == constants::DW_TAG_enumeration_type {
                return object::object_from_dwarf_enumerator(&mut self.typer(index), die_ref, name);
            }
            return object::object_from_dwarf(
                &mut self.typer(index),
                mem,
                die_ref,
                None,
                None,
                None,
            );
        }
        Err(DwarfError::NotFound)
    }

    /// Finds the chain of DIEs whose address ranges contain `pc`.
    ///
    /// `pc` is a biased address; the returned bias was subtracted before
    /// searching. The chain is outermost first (unit DIE down to the
    /// innermost block) and empty when nothing covers the PC.
    pub fn find_dwarf_scopes(
        &self,
        module_index: usize,
        pc: u64,
    ) -> Result<(u64, Vec<DieRef>)> {
        let module = self.modules.get(module_index).ok_or_else(|| {
            DwarfError::Other(format!("module index {module_index} out of range"))
        })?;
        let bias = module.bias();
        let scopes = cursor::find_scopes(module, module_index, pc.wrapping_sub(bias))?;
        Ok((bias, scopes))
    }

    /// Reconstructs the ancestors of a DIE, outermost first, not including
    /// the DIE itself.
    pub fn find_die_ancestors(&self, die: DieRef) -> Result<Vec<DieRef>> {
        let module = self.modules.get(die.module).ok_or_else(|| {
            DwarfError::Other(format!("module index {} out of range", die.module))
        })?;
        cursor::find_die_ancestors(module, die.module, die)
    }

    /// Searches a scope chain, innermost first, for a variable, formal
    /// parameter, subprogram, or enumerator named `name`.
    ///
    /// A declaration without a definition in an inner scope shadows outer
    /// scopes, so the search stops there.
    pub fn find_in_dwarf_scopes(
        &self,
        scopes: &[DieRef],
        name: &str,
    ) -> Result<Option<ScopeMatch>> {
        for &scope in scopes.iter().rev() {
            let scope_die = self.die(scope)?;
            let mut declaration = None;
            let mut children = scope_die.children()?;
            while let Some(child) = children.next()? {
                match child.tag()? {
                    constants::DW_TAG_variable
                    | constants::DW_TAG_formal_parameter
                    | constants::DW_TAG_subprogram => {
                        if child.name()?.as_deref() == Some(name) {
                            if child.flag(constants::DW_AT_declaration)? {
                                declaration = Some(child.die_ref());
                            } else {
                                return Ok(Some(ScopeMatch {
                                    die: child.die_ref(),
                                    enumeration: None,
                                }));
                            }
                        }
                    }
                    constants::DW_TAG_enumeration_type => {
                        // Enumerators of a scoped enumeration are not
                        // visible in the enclosing scope.
                        if child.flag_integrate(constants::DW_AT_enum_class)? {
                            continue;
                        }
                        let mut enumerators = child.children()?;
                        while let Some(enumerator) = enumerators.next()? {
                            if enumerator.tag()? == constants::DW_TAG_enumerator
                                && enumerator.name()?.as_deref() == Some(name)
                            {
                                return Ok(Some(ScopeMatch {
                                    die: enumerator.die_ref(),
                                    enumeration: Some(child.die_ref()),
                                }));
                            }
                        }
                    }
                    _ => {}
                }
            }
            if let Some(die) = declaration {
                return Ok(Some(ScopeMatch {
                    die,
                    enumeration: None,
                }));
            }
        }
        Ok(None)
    }

    /// Reports the language of the compilation unit defining `main`, used
    /// by embedders to pick a default language.
    pub fn main_language(&self, index: &dyn DwarfIndex) -> Result<Option<Language>> {
        for die_ref in index.iter_matches(&[], "main", &[constants::DW_TAG_subprogram]) {
            let Ok(die) = self.die(die_ref) else {
                continue;
            };
            if let Some(language) = die.language(false) {
                return Ok(Some(language));
            }
        }
        Ok(None)
    }

    /// Creates a cursor over all DIEs of a module.
    pub fn die_cursor(&self, module_index: usize) -> Result<DieCursor<'_, 'data>> {
        let module = self.modules.get(module_index).ok_or_else(|| {
            DwarfError::Other(format!("module index {module_index} out of range"))
        })?;
        Ok(DieCursor::new(module, module_index))
    }

    /// Returns the tag of a DIE.
    pub fn die_tag(&self, die: DieRef) -> Result<DwTag> {
        self.die(die)?.tag()
    }

    /// Returns the name of a DIE, following `DW_AT_abstract_origin` and
    /// `DW_AT_specification`.
    pub fn die_name(&self, die: DieRef) -> Result<Option<String>> {
        self.die(die)?.name()
    }

    /// Returns whether a DIE has `DW_AT_declaration` set.
    pub fn die_is_declaration(&self, die: DieRef) -> Result<bool> {
        self.die(die)?.flag(constants::DW_AT_declaration)
    }

    /// Returns the children of a DIE.
    pub fn die_children(&self, die: DieRef) -> Result<Vec<DieRef>> {
        let die = self.die(die)?;
        let mut children = die.children()?;
        let mut result = Vec::new();
        while let Some(child) = children.next()? {
            result.push(child.die_ref());
        }
        Ok(result)
    }
}
