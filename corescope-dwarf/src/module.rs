//! Debug sections and per-module DWARF state.
//!
//! A [`ModuleDwarf`] owns everything this crate knows about one loaded
//! module: its debug section bytes, the parsed compilation and type units,
//! the section base addresses needed to decode EH-frame pointers, and the
//! lazily built call-frame table. Section bytes are obtained through the
//! [`ObjectFile`] trait, which is implemented by the embedder on top of
//! whatever container format it loads (ELF, core dumps, test fixtures).

use std::collections::HashMap;
use std::fmt;

use gimli::{constants, AttributeValue, RunTimeEndian, UnitSectionOffset};
use lazycell::LazyCell;

use corescope_common::{Language, Platform};

use crate::buffer::Buffer;
use crate::cfi::CfiTable;
use crate::error::{DwarfError, Result};
use crate::DieRef;

pub(crate) type Slice<'data> = gimli::EndianSlice<'data, RunTimeEndian>;
pub(crate) type Unit<'data> = gimli::Unit<Slice<'data>>;
pub(crate) type Entry<'a, 'data> = gimli::DebuggingInformationEntry<'a, 'a, Slice<'data>, usize>;
pub(crate) type UnitOffset = gimli::UnitOffset<usize>;

/// Identifies one of the sections this crate reads.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum SectionId {
    /// `.debug_info`
    DebugInfo,
    /// `.debug_types`
    DebugTypes,
    /// `.debug_abbrev`
    DebugAbbrev,
    /// `.debug_str`
    DebugStr,
    /// `.debug_str_offsets`
    DebugStrOffsets,
    /// `.debug_line_str`
    DebugLineStr,
    /// `.debug_line`
    DebugLine,
    /// `.debug_addr`
    DebugAddr,
    /// `.debug_loc`
    DebugLoc,
    /// `.debug_loclists`
    DebugLoclists,
    /// `.debug_frame`
    DebugFrame,
    /// `.eh_frame`
    EhFrame,
    /// `.text`
    Text,
    /// `.got`
    Got,
}

impl SectionId {
    /// All section ids, in index order.
    pub const ALL: [SectionId; 14] = [
        SectionId::DebugInfo,
        SectionId::DebugTypes,
        SectionId::DebugAbbrev,
        SectionId::DebugStr,
        SectionId::DebugStrOffsets,
        SectionId::DebugLineStr,
        SectionId::DebugLine,
        SectionId::DebugAddr,
        SectionId::DebugLoc,
        SectionId::DebugLoclists,
        SectionId::DebugFrame,
        SectionId::EhFrame,
        SectionId::Text,
        SectionId::Got,
    ];

    /// The section's name in ELF.
    pub fn name(self) -> &'static str {
        match self {
            SectionId::DebugInfo => ".debug_info",
            SectionId::DebugTypes => ".debug_types",
            SectionId::DebugAbbrev => ".debug_abbrev",
            SectionId::DebugStr => ".debug_str",
            SectionId::DebugStrOffsets => ".debug_str_offsets",
            SectionId::DebugLineStr => ".debug_line_str",
            SectionId::DebugLine => ".debug_line",
            SectionId::DebugAddr => ".debug_addr",
            SectionId::DebugLoc => ".debug_loc",
            SectionId::DebugLoclists => ".debug_loclists",
            SectionId::DebugFrame => ".debug_frame",
            SectionId::EhFrame => ".eh_frame",
            SectionId::Text => ".text",
            SectionId::Got => ".got",
        }
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Section bytes and load address, as provided by an [`ObjectFile`].
#[derive(Clone, Copy, Debug)]
pub struct DwarfSection<'data> {
    /// Address the section is mapped at (unbiased), or 0 if it is not
    /// allocated.
    pub address: u64,
    /// The section contents.
    pub data: &'data [u8],
}

/// Provides access to the debug sections and load geometry of one module,
/// independent of the container file format.
pub trait ObjectFile<'data> {
    /// A name for the module, used in error messages.
    fn name(&self) -> &str;

    /// Returns whether the file was compiled for a big-endian or
    /// little-endian machine.
    fn endianity(&self) -> RunTimeEndian;

    /// Returns the platform the module was compiled for.
    fn platform(&self) -> Platform;

    /// Returns one section's data, or `None` if the module does not have
    /// it. Absence is valid for every section.
    fn section(&self, id: SectionId) -> Option<DwarfSection<'data>>;

    /// Returns the load bias: the difference between the addresses the
    /// module is mapped at and the addresses recorded in its file.
    fn bias(&self) -> u64 {
        0
    }

    /// Returns the `[start, end)` range of addresses the module is mapped
    /// at, after applying the bias.
    fn address_range(&self) -> (u64, u64) {
        (0, 0)
    }
}

/// Whether a unit lives in `.debug_info` or `.debug_types`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum UnitSection {
    Info,
    Types,
}

/// A parsed unit plus the per-unit facts the rest of the crate needs.
pub(crate) struct UnitData<'data> {
    pub unit: Unit<'data>,
    pub section: UnitSection,
    /// Offset of the unit header within its section.
    pub offset: usize,
    /// Offset one past the end of the unit within its section.
    pub end: usize,
    /// Offset of the unit's root DIE within the unit.
    pub root_offset: UnitOffset,
    pub version: u16,
    pub address_size: u8,
    /// Size in bytes of offsets in this unit (4 or 8).
    pub offset_size: u8,
    pub language: Language,
    /// `DW_AT_low_pc` of the unit DIE, if present.
    pub low_pc: Option<u64>,
}

impl<'data> UnitData<'data> {
    /// Converts a unit-relative offset to a section-global offset.
    pub(crate) fn global_offset(&self, offset: UnitOffset) -> UnitSectionOffset<usize> {
        match self.section {
            UnitSection::Info => {
                UnitSectionOffset::DebugInfoOffset(gimli::DebugInfoOffset(self.offset + offset.0))
            }
            UnitSection::Types => {
                UnitSectionOffset::DebugTypesOffset(gimli::DebugTypesOffset(self.offset + offset.0))
            }
        }
    }
}

/// The DWARF state of one loaded module.
pub struct ModuleDwarf<'data> {
    name: String,
    platform: Platform,
    endian: RunTimeEndian,
    bias: u64,
    address_range: (u64, u64),
    sections: [Option<DwarfSection<'data>>; SectionId::ALL.len()],
    pub(crate) dwarf: gimli::Dwarf<Slice<'data>>,
    pub(crate) units: Vec<UnitData<'data>>,
    pub(crate) type_units: Vec<UnitData<'data>>,
    /// Type-unit signature to `(type_units index, offset of the type DIE)`.
    type_signatures: HashMap<u64, (usize, UnitOffset)>,
    /// Base addresses for EH-frame pointer encodings.
    pub(crate) pcrel_base: u64,
    pub(crate) textrel_base: u64,
    pub(crate) datarel_base: u64,
    pub(crate) cfi: LazyCell<Result<CfiTable<'data>>>,
}

impl<'data> ModuleDwarf<'data> {
    /// Loads a module's DWARF state from its sections.
    ///
    /// This parses all compilation and type unit headers up front; DIEs,
    /// location lists, and call-frame information are only decoded on
    /// demand.
    pub fn load(file: &impl ObjectFile<'data>) -> Result<Self> {
        let endian = file.endianity();
        let mut sections = [None; SectionId::ALL.len()];
        for id in SectionId::ALL {
            sections[id as usize] = file.section(id);
        }

        let section_slice = |id: SectionId| -> &'data [u8] {
            sections[id as usize].map_or(&[], |section| section.data)
        };

        let dwarf = gimli::Dwarf::load(|gimli_id| -> std::result::Result<_, gimli::Error> {
            let data = match gimli_id {
                gimli::SectionId::DebugInfo => section_slice(SectionId::DebugInfo),
                gimli::SectionId::DebugAbbrev => section_slice(SectionId::DebugAbbrev),
                gimli::SectionId::DebugStr => section_slice(SectionId::DebugStr),
                gimli::SectionId::DebugStrOffsets => section_slice(SectionId::DebugStrOffsets),
                gimli::SectionId::DebugLineStr => section_slice(SectionId::DebugLineStr),
                gimli::SectionId::DebugLine => section_slice(SectionId::DebugLine),
                gimli::SectionId::DebugAddr => section_slice(SectionId::DebugAddr),
                _ => &[],
            };
            Ok(gimli::EndianSlice::new(data, endian))
        })?;

        let mut units = Vec::new();
        let mut headers = dwarf.units();
        while let Some(header) = headers.next()? {
            let offset = header
                .offset()
                .as_debug_info_offset()
                .expect("compilation unit outside .debug_info")
                .0;
            let end = offset + header.length_including_self();
            let unit = dwarf.unit(header)?;
            units.push(Self::unit_data(&dwarf, unit, UnitSection::Info, offset, end)?);
        }

        let mut type_units = Vec::new();
        let mut type_signatures = HashMap::new();
        let debug_types =
            gimli::DebugTypes::new(section_slice(SectionId::DebugTypes), endian);
        let mut headers = debug_types.units();
        while let Some(header) = headers.next()? {
            let offset = header
                .offset()
                .as_debug_types_offset()
                .expect("type unit outside .debug_types")
                .0;
            let end = offset + header.length_including_self();
            if let gimli::UnitType::Type {
                type_signature,
                type_offset,
            } = header.type_()
            {
                type_signatures.insert(type_signature.0, (type_units.len(), type_offset));
            }
            let unit = dwarf.unit(header)?;
            type_units.push(Self::unit_data(&dwarf, unit, UnitSection::Types, offset, end)?);
        }

        let section_address =
            |id: SectionId| sections[id as usize].map_or(0, |section| section.address);

        Ok(ModuleDwarf {
            name: file.name().to_owned(),
            platform: file.platform(),
            endian,
            bias: file.bias(),
            address_range: file.address_range(),
            sections,
            dwarf,
            units,
            type_units,
            type_signatures,
            pcrel_base: section_address(SectionId::EhFrame),
            textrel_base: section_address(SectionId::Text),
            datarel_base: section_address(SectionId::Got),
            cfi: LazyCell::new(),
        })
    }

    fn unit_data(
        dwarf: &gimli::Dwarf<Slice<'data>>,
        unit: Unit<'data>,
        section: UnitSection,
        offset: usize,
        end: usize,
    ) -> Result<UnitData<'data>> {
        let mut language = Language::Unknown;
        let mut low_pc = None;
        let root_offset;
        {
            let mut entries = unit.entries();
            let root = match entries.next_dfs()? {
                Some((_, root)) => root,
                None => return Err(gimli::Error::MissingUnitDie.into()),
            };
            root_offset = root.offset();
            if let Some(AttributeValue::Language(lang)) =
                root.attr_value(constants::DW_AT_language)?
            {
                language = language_from_dwarf(lang);
            }
            match root.attr_value(constants::DW_AT_low_pc)? {
                Some(AttributeValue::Addr(addr)) => low_pc = Some(addr),
                Some(AttributeValue::DebugAddrIndex(index)) => {
                    low_pc = Some(dwarf.address(&unit, index)?)
                }
                _ => {}
            }
        }
        let encoding = unit.encoding();
        let version = encoding.version;
        let address_size = encoding.address_size;
        let offset_size = encoding.format.word_size();
        Ok(UnitData {
            unit,
            section,
            offset,
            end,
            root_offset,
            version,
            address_size,
            offset_size,
            language,
            low_pc,
        })
    }

    /// The module's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The module's platform.
    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// The module's byte order.
    pub fn endian(&self) -> RunTimeEndian {
        self.endian
    }

    pub(crate) fn is_little_endian(&self) -> bool {
        self.platform.is_little_endian()
    }

    /// The module's load bias.
    pub fn bias(&self) -> u64 {
        self.bias
    }

    /// The `[start, end)` address range the module is mapped at.
    pub fn address_range(&self) -> (u64, u64) {
        self.address_range
    }

    /// Returns a section, or `None` if the module does not have it.
    pub fn section(&self, id: SectionId) -> Option<&DwarfSection<'data>> {
        self.sections[id as usize].as_ref()
    }

    pub(crate) fn has_section(&self, id: SectionId) -> bool {
        self.sections[id as usize].is_some()
    }

    pub(crate) fn missing_section_error(&self, message: &str) -> DwarfError {
        DwarfError::Module {
            module: self.name.clone(),
            message: message.to_owned(),
        }
    }

    /// Creates a buffer over a whole section.
    pub(crate) fn section_buffer(&self, id: SectionId) -> Result<Buffer<'_, 'data>> {
        let section = self
            .section(id)
            .ok_or_else(|| self.missing_section_error(&format!("no {id} section")))?;
        Ok(Buffer::new(
            section.data,
            self.is_little_endian(),
            &self.name,
            Some((id, 0)),
        ))
    }

    /// Locates the section containing a slice of bytes.
    ///
    /// A pointer one past the end of a section is legal in DWARF and
    /// resolves to that section; strict containment wins over an
    /// end-of-section match.
    pub(crate) fn locate(&self, data: &[u8]) -> Option<(SectionId, usize)> {
        let p = data.as_ptr() as usize;
        let mut end_match = None;
        for id in SectionId::ALL {
            let Some(section) = self.section(id) else {
                continue;
            };
            let start = section.data.as_ptr() as usize;
            let end = start + section.data.len();
            if start <= p {
                if p < end {
                    return Some((id, p - start));
                } else if p == end {
                    end_match = Some((id, p - start));
                }
            }
        }
        end_match
    }

    /// Creates a buffer over expression bytes, anchoring errors to the
    /// owning section when the bytes come from one.
    pub(crate) fn expr_buffer(&self, expr: &'data [u8]) -> Buffer<'_, 'data> {
        let anchor = self
            .locate(expr)
            .map(|(id, offset)| (id, offset as u64));
        Buffer::new(expr, self.is_little_endian(), &self.name, anchor)
    }

    /// Finds the unit containing a section-global offset.
    pub(crate) fn unit_containing(
        &self,
        offset: UnitSectionOffset<usize>,
    ) -> Result<(&UnitData<'data>, UnitOffset)> {
        let (units, pos) = match offset {
            UnitSectionOffset::DebugInfoOffset(o) => (&self.units, o.0),
            UnitSectionOffset::DebugTypesOffset(o) => (&self.type_units, o.0),
        };
        let index = match units.binary_search_by_key(&pos, |unit| unit.offset) {
            Ok(index) => index,
            Err(0) => {
                return Err(DwarfError::Module {
                    module: self.name.clone(),
                    message: format!("DIE offset {pos:#x} is not in any unit"),
                })
            }
            Err(index) => index - 1,
        };
        let unit = &units[index];
        if pos >= unit.end {
            return Err(DwarfError::Module {
                module: self.name.clone(),
                message: format!("DIE offset {pos:#x} is not in any unit"),
            });
        }
        Ok((unit, gimli::UnitOffset(pos - unit.offset)))
    }

    /// Resolves a type-unit signature to the offset of its type DIE.
    pub(crate) fn signature_target(&self, signature: u64) -> Option<(&UnitData<'data>, UnitOffset)> {
        let &(index, offset) = self.type_signatures.get(&signature)?;
        Some((&self.type_units[index], offset))
    }
}

/// Maps a DWARF language code to a [`Language`].
pub(crate) fn language_from_dwarf(lang: constants::DwLang) -> Language {
    match lang {
        constants::DW_LANG_C
        | constants::DW_LANG_C89
        | constants::DW_LANG_C99
        | constants::DW_LANG_C11 => Language::C,
        constants::DW_LANG_C_plus_plus
        | constants::DW_LANG_C_plus_plus_03
        | constants::DW_LANG_C_plus_plus_11
        | constants::DW_LANG_C_plus_plus_14 => Language::Cpp,
        _ => Language::Unknown,
    }
}

/// A DIE with its module and unit context resolved.
///
/// This is the working handle the rest of the crate passes around; it is
/// cheap to copy and re-reads the underlying entry on demand.
#[derive(Clone, Copy)]
pub(crate) struct Die<'a, 'data> {
    pub module_index: usize,
    pub module: &'a ModuleDwarf<'data>,
    pub unit: &'a UnitData<'data>,
    pub offset: UnitOffset,
}

impl<'a, 'data> Die<'a, 'data> {
    pub(crate) fn entry(&self) -> Result<Entry<'a, 'data>> {
        Ok(self.unit.unit.entry(self.offset)?)
    }

    pub(crate) fn tag(&self) -> Result<constants::DwTag> {
        Ok(self.entry()?.tag())
    }

    pub(crate) fn die_ref(&self) -> DieRef {
        DieRef {
            module: self.module_index,
            offset: self.unit.global_offset(self.offset),
        }
    }

    /// Returns an attribute of this DIE, without integration.
    pub(crate) fn attr_value(
        &self,
        name: constants::DwAt,
    ) -> Result<Option<AttributeValue<Slice<'data>>>> {
        Ok(self.entry()?.attr_value(name)?)
    }

    /// Returns an attribute, following `DW_AT_abstract_origin` and
    /// `DW_AT_specification` references like `dwarf_attr_integrate`.
    ///
    /// The DIE the attribute was found on is returned alongside the value so
    /// that unit-relative references and strings resolve in the right
    /// context.
    pub(crate) fn attr_integrate(
        &self,
        name: constants::DwAt,
    ) -> Result<Option<(Die<'a, 'data>, AttributeValue<Slice<'data>>)>> {
        let mut die = *self;
        for _ in 0..16 {
            if let Some(value) = die.attr_value(name)? {
                return Ok(Some((die, value)));
            }
            let reference = match die.attr_value(constants::DW_AT_abstract_origin)? {
                Some(value) => value,
                None => match die.attr_value(constants::DW_AT_specification)? {
                    Some(value) => value,
                    None => return Ok(None),
                },
            };
            die = die.resolve_ref(reference)?;
        }
        Ok(None)
    }

    /// Resolves a reference-class attribute value to the DIE it points at.
    pub(crate) fn resolve_ref(&self, value: AttributeValue<Slice<'data>>) -> Result<Die<'a, 'data>> {
        match value {
            AttributeValue::UnitRef(offset) => Ok(Die { offset, ..*self }),
            AttributeValue::DebugInfoRef(offset) => {
                let (unit, offset) = self
                    .module
                    .unit_containing(UnitSectionOffset::DebugInfoOffset(offset))?;
                Ok(Die {
                    module_index: self.module_index,
                    module: self.module,
                    unit,
                    offset,
                })
            }
            AttributeValue::DebugTypesRef(signature) => {
                let (unit, offset) =
                    self.module.signature_target(signature.0).ok_or_else(|| {
                        DwarfError::Module {
                            module: self.module.name().to_owned(),
                            message: format!("unknown type signature {:#x}", signature.0),
                        }
                    })?;
                Ok(Die {
                    module_index: self.module_index,
                    module: self.module,
                    unit,
                    offset,
                })
            }
            _ => Err(DwarfError::Other(
                "unsupported DIE reference form".to_owned(),
            )),
        }
    }

    /// Resolves a string-class attribute value.
    pub(crate) fn string_value(&self, value: AttributeValue<Slice<'data>>) -> Option<String> {
        let slice = self.module.dwarf.attr_string(&self.unit.unit, value).ok()?;
        Some(String::from_utf8_lossy(slice.slice()).into_owned())
    }

    /// Returns the DIE's `DW_AT_name`, with integration.
    pub(crate) fn name(&self) -> Result<Option<String>> {
        match self.attr_integrate(constants::DW_AT_name)? {
            Some((die, value)) => Ok(die.string_value(value)),
            None => Ok(None),
        }
    }

    /// Returns a flag attribute, defaulting to false, without integration.
    pub(crate) fn flag(&self, name: constants::DwAt) -> Result<bool> {
        match self.attr_value(name)? {
            Some(AttributeValue::Flag(flag)) => Ok(flag),
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Returns a flag attribute, defaulting to false, with integration.
    pub(crate) fn flag_integrate(&self, name: constants::DwAt) -> Result<bool> {
        match self.attr_integrate(name)? {
            Some((_, AttributeValue::Flag(flag))) => Ok(flag),
            Some(_) => Ok(true),
            None => Ok(false),
        }
    }

    /// Returns an unsigned constant attribute, with integration.
    pub(crate) fn udata_integrate(&self, name: constants::DwAt) -> Result<Option<u64>> {
        Ok(self
            .attr_integrate(name)?
            .and_then(|(_, value)| value.udata_value()))
    }

    /// Resolves the DIE's `DW_AT_type` to its type DIE, with integration.
    pub(crate) fn type_die(&self) -> Result<Option<Die<'a, 'data>>> {
        match self.attr_integrate(constants::DW_AT_type)? {
            Some((die, value)) => Ok(Some(die.resolve_ref(value)?)),
            None => Ok(None),
        }
    }

    /// Returns the source language of the DIE's unit, with a fallback.
    pub(crate) fn language(&self, fall_back: bool) -> Option<Language> {
        match self.unit.language {
            Language::Unknown if fall_back => Some(Language::DEFAULT),
            Language::Unknown => None,
            language => Some(language),
        }
    }

    /// Iterates over this DIE's children.
    pub(crate) fn children(&self) -> Result<DieChildren<'a, 'data>> {
        let mut cursor = self.unit.unit.entries_at_offset(self.offset)?;
        cursor.next_entry()?;
        let has_children = match cursor.current() {
            Some(entry) => entry.has_children(),
            None => false,
        };
        Ok(DieChildren {
            parent: *self,
            cursor,
            state: if has_children {
                ChildState::First
            } else {
                ChildState::Done
            },
        })
    }

    /// Returns whether any of the DIE's address ranges contains `pc`.
    pub(crate) fn contains_pc(&self, pc: u64) -> Result<bool> {
        let entry = self.entry()?;
        let mut ranges = self.module.dwarf.die_ranges(&self.unit.unit, &entry)?;
        while let Some(range) = ranges.next()? {
            if range.begin <= pc && pc < range.end {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

enum ChildState {
    First,
    Rest,
    Done,
}

/// Iterator over the children of one DIE.
pub(crate) struct DieChildren<'a, 'data> {
    parent: Die<'a, 'data>,
    cursor: gimli::EntriesCursor<'a, 'a, Slice<'data>>,
    state: ChildState,
}

impl<'a, 'data> DieChildren<'a, 'data> {
    pub(crate) fn next(&mut self) -> Result<Option<Die<'a, 'data>>> {
        let offset = match self.state {
            ChildState::First => {
                // The next entry in the stream is the first child, unless
                // the child list is immediately terminated.
                self.cursor.next_entry()?;
                match self.cursor.current() {
                    Some(entry) => {
                        self.state = ChildState::Rest;
                        entry.offset()
                    }
                    None => {
                        self.state = ChildState::Done;
                        return Ok(None);
                    }
                }
            }
            ChildState::Rest => match self.cursor.next_sibling()? {
                Some(entry) => entry.offset(),
                None => {
                    self.state = ChildState::Done;
                    return Ok(None);
                }
            },
            ChildState::Done => return Ok(None),
        };
        Ok(Some(Die {
            offset,
            ..self.parent
        }))
    }
}
