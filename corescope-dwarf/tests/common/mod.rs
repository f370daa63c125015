//! Shared helpers for the integration tests: DWARF synthesis, in-memory
//! object files, and a simple name index.

#![allow(dead_code)]

use std::collections::HashMap;

use gimli::write::{DwarfUnit, EndianVec, Sections};
use gimli::{constants, RunTimeEndian};

use corescope_common::{Arch, Platform};
use corescope_dwarf::{
    DebugInfo, DieRef, DwTag, DwarfIndex, DwarfSection, ModuleDwarf, ObjectFile, SectionId,
};

/// Sections assembled for one test module.
pub struct TestSections {
    pub platform: Platform,
    pub bias: u64,
    pub range: (u64, u64),
    pub sections: HashMap<SectionId, (u64, Vec<u8>)>,
}

impl TestSections {
    pub fn empty() -> Self {
        TestSections {
            platform: Platform::x86_64(),
            bias: 0,
            range: (0, 0),
            sections: HashMap::new(),
        }
    }

    /// Builds a module's sections by emitting one compilation unit.
    pub fn from_dwarf(build: impl FnOnce(&mut DwarfUnit)) -> Self {
        let encoding = gimli::Encoding {
            format: gimli::Format::Dwarf32,
            version: 4,
            address_size: 8,
        };
        let mut dwarf = DwarfUnit::new(encoding);
        build(&mut dwarf);

        let mut sections = Sections::new(EndianVec::new(gimli::LittleEndian));
        dwarf.write(&mut sections).expect("writing DWARF");

        let mut out = TestSections::empty();
        sections
            .for_each(|id, data| {
                let section_id = match id {
                    gimli::SectionId::DebugInfo => Some(SectionId::DebugInfo),
                    gimli::SectionId::DebugAbbrev => Some(SectionId::DebugAbbrev),
                    gimli::SectionId::DebugStr => Some(SectionId::DebugStr),
                    gimli::SectionId::DebugStrOffsets => Some(SectionId::DebugStrOffsets),
                    gimli::SectionId::DebugLine => Some(SectionId::DebugLine),
                    gimli::SectionId::DebugLineStr => Some(SectionId::DebugLineStr),
                    gimli::SectionId::DebugAddr => Some(SectionId::DebugAddr),
                    gimli::SectionId::DebugLoc => Some(SectionId::DebugLoc),
                    gimli::SectionId::DebugLocLists => Some(SectionId::DebugLoclists),
                    _ => None,
                };
                if let Some(section_id) = section_id {
                    let bytes = data.slice().to_vec();
                    if !bytes.is_empty() {
                        out.sections.insert(section_id, (0, bytes));
                    }
                }
                Ok::<_, gimli::Error>(())
            })
            .unwrap();
        out
    }

    pub fn add_section(&mut self, id: SectionId, address: u64, data: Vec<u8>) {
        self.sections.insert(id, (address, data));
    }

    pub fn load(&self) -> ModuleDwarf<'_> {
        ModuleDwarf::load(&TestObject(self)).expect("loading test module")
    }
}

pub struct TestObject<'a>(pub &'a TestSections);

impl<'a> ObjectFile<'a> for TestObject<'a> {
    fn name(&self) -> &str {
        "test"
    }

    fn endianity(&self) -> RunTimeEndian {
        RunTimeEndian::Little
    }

    fn platform(&self) -> Platform {
        self.0.platform
    }

    fn section(&self, id: SectionId) -> Option<DwarfSection<'a>> {
        self.0
            .sections
            .get(&id)
            .map(|(address, data)| DwarfSection {
                address: *address,
                data,
            })
    }

    fn bias(&self) -> u64 {
        self.0.bias
    }

    fn address_range(&self) -> (u64, u64) {
        self.0.range
    }
}

/// Returns the root DIE of the first unit of a module.
pub fn unit_root(info: &DebugInfo, module_index: usize) -> DieRef {
    let mut cursor = info.die_cursor(module_index).unwrap();
    cursor.next(false, 0).unwrap().expect("module has a unit")
}

/// Returns the children of `parent` with the given tag.
pub fn children_with_tag(info: &DebugInfo, parent: DieRef, tag: DwTag) -> Vec<DieRef> {
    info.die_children(parent)
        .unwrap()
        .into_iter()
        .filter(|&child| info.die_tag(child).unwrap() == tag)
        .collect()
}

/// A toy name index over a [`DebugInfo`], good enough for tests.
///
/// Indexes the top-level DIEs of every unit (recursing into namespaces),
/// skips declarations, and maps enumerator names to their enumeration type
/// DIE, matching the contract of [`DwarfIndex`].
#[derive(Default)]
pub struct SimpleIndex {
    definitions: HashMap<(Vec<String>, String, DwTag), Vec<DieRef>>,
    declarations: HashMap<DieRef, (Vec<String>, String, DwTag)>,
}

impl SimpleIndex {
    pub fn build(info: &DebugInfo) -> Self {
        let mut index = SimpleIndex::default();
        for module_index in 0..info.modules().len() {
            let mut roots = Vec::new();
            let mut cursor = info.die_cursor(module_index).unwrap();
            while let Some(root) = cursor.next(false, 0).unwrap() {
                roots.push(root);
            }
            for root in roots {
                index.add_scope(info, root, &[]);
            }
        }
        index
    }

    fn add_scope(&mut self, info: &DebugInfo, scope: DieRef, namespace: &[String]) {
        for child in info.die_children(scope).unwrap() {
            let tag = info.die_tag(child).unwrap();
            let name = info.die_name(child).unwrap();
            match tag {
                constants::DW_TAG_namespace => {
                    if let Some(name) = name {
                        let mut namespace = namespace.to_vec();
                        namespace.push(name);
                        self.add_scope(info, child, &namespace);
                    }
                }
                constants::DW_TAG_base_type
                | constants::DW_TAG_structure_type
                | constants::DW_TAG_union_type
                | constants::DW_TAG_class_type
                | constants::DW_TAG_enumeration_type
                | constants::DW_TAG_typedef
                | constants::DW_TAG_subprogram
                | constants::DW_TAG_variable => {
                    let Some(name) = name else { continue };
                    let key = (namespace.to_vec(), name, tag);
                    if info.die_is_declaration(child).unwrap() {
                        self.declarations.insert(child, key);
                    } else {
                        self.definitions.entry(key).or_default().push(child);
                    }
                    if tag == constants::DW_TAG_enumeration_type {
                        for enumerator in info.die_children(child).unwrap() {
                            if info.die_tag(enumerator).unwrap() != constants::DW_TAG_enumerator {
                                continue;
                            }
                            if let Some(name) = info.die_name(enumerator).unwrap() {
                                self.definitions
                                    .entry((
                                        namespace.to_vec(),
                                        name,
                                        constants::DW_TAG_enumerator,
                                    ))
                                    .or_default()
                                    .push(child);
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }
}

impl DwarfIndex for SimpleIndex {
    fn iter_matches(
        &self,
        namespace: &[&str],
        name: &str,
        tags: &[DwTag],
    ) -> Box<dyn Iterator<Item = DieRef> + '_> {
        let namespace: Vec<String> = namespace.iter().map(|s| s.to_string()).collect();
        let mut matches = Vec::new();
        for &tag in tags {
            if let Some(dies) =
                self.definitions
                    .get(&(namespace.clone(), name.to_owned(), tag))
            {
                matches.extend_from_slice(dies);
            }
        }
        Box::new(matches.into_iter())
    }

    fn find_definition(&self, declaration: DieRef) -> Option<DieRef> {
        let key = self.declarations.get(&declaration)?;
        self.definitions.get(key)?.first().copied()
    }
}
