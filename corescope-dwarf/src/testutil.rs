//! In-crate helpers for unit tests: in-memory object files and memory.

use std::collections::HashMap;

use gimli::RunTimeEndian;

use corescope_common::{Arch, Platform};

use crate::error::{DwarfError, Result};
use crate::module::{DwarfSection, ModuleDwarf, ObjectFile, SectionId};
use crate::MemoryReader;

/// An object file assembled from raw section bytes.
pub(crate) struct TestFile {
    platform: Platform,
    sections: Vec<(SectionId, u64, Vec<u8>)>,
}

impl TestFile {
    pub(crate) fn new(address_size: u8) -> Self {
        TestFile {
            platform: Platform::new(Arch::X86_64, true, address_size),
            sections: Vec::new(),
        }
    }

    pub(crate) fn add_section(&mut self, id: SectionId, address: u64, data: Vec<u8>) {
        self.sections.push((id, address, data));
    }
}

struct TestFileRef<'a>(&'a TestFile);

impl<'a> ObjectFile<'a> for TestFileRef<'a> {
    fn name(&self) -> &str {
        "test"
    }

    fn endianity(&self) -> RunTimeEndian {
        if self.0.platform.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        }
    }

    fn platform(&self) -> Platform {
        self.0.platform
    }

    fn section(&self, id: SectionId) -> Option<DwarfSection<'a>> {
        self.0
            .sections
            .iter()
            .find(|(section_id, _, _)| *section_id == id)
            .map(|(_, address, data)| DwarfSection {
                address: *address,
                data,
            })
    }
}

pub(crate) fn test_module(file: &TestFile) -> ModuleDwarf<'_> {
    ModuleDwarf::load(&TestFileRef(file)).expect("loading test module")
}

/// Memory backed by a map of segments.
#[derive(Default)]
pub(crate) struct TestMemory {
    segments: HashMap<u64, Vec<u8>>,
}

impl TestMemory {
    pub(crate) fn insert(&mut self, address: u64, bytes: Vec<u8>) {
        self.segments.insert(address, bytes);
    }
}

impl MemoryReader for TestMemory {
    fn read(&self, buf: &mut [u8], address: u64, _physical: bool) -> Result<()> {
        for (&start, bytes) in &self.segments {
            let end = start + bytes.len() as u64;
            if address >= start && address + buf.len() as u64 <= end {
                let offset = (address - start) as usize;
                buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
                return Ok(());
            }
        }
        Err(DwarfError::Other(format!(
            "cannot read memory at {address:#x}"
        )))
    }
}
