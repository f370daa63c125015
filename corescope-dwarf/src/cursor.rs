//! Pre-order iteration over DIEs.
//!
//! [`DieCursor`] walks every DIE of a module in pre-order, visiting all of
//! `.debug_info` and then all of `.debug_types`, while keeping the stack of
//! ancestors of the current DIE. The caller decides after every step whether
//! to descend into the current DIE's children, and can bound the walk to the
//! subtree rooted at any DIE on the stack. This is what powers PC-to-scope
//! resolution and ancestor reconstruction.

use gimli::constants;

use crate::error::{DwarfError, Result};
use crate::module::{Die, ModuleDwarf, UnitData, UnitOffset};
use crate::DieRef;

/// Reads the offset of the first child of the DIE at `offset`, if any.
fn first_child(unit: &UnitData<'_>, offset: UnitOffset) -> Result<Option<UnitOffset>> {
    let mut cursor = unit.unit.entries_at_offset(offset)?;
    cursor.next_entry()?;
    match cursor.current() {
        Some(entry) if entry.has_children() => {}
        _ => return Ok(None),
    }
    // The next entry in the stream is the first child, unless the child
    // list is immediately terminated.
    cursor.next_entry()?;
    Ok(cursor.current().map(|entry| entry.offset()))
}

/// Reads the offset of the next sibling of the DIE at `offset`, if any.
fn next_sibling(unit: &UnitData<'_>, offset: UnitOffset) -> Result<Option<UnitOffset>> {
    let mut cursor = unit.unit.entries_at_offset(offset)?;
    cursor.next_entry()?;
    if cursor.current().is_none() {
        return Ok(None);
    }
    Ok(cursor.next_sibling()?.map(|entry| entry.offset()))
}

/// Iterator over the DIEs of a module.
pub struct DieCursor<'a, 'data> {
    module: &'a ModuleDwarf<'data>,
    module_index: usize,
    /// Ancestor stack; the last entry is the current DIE.
    stack: Vec<UnitOffset>,
    unit: Option<&'a UnitData<'data>>,
    next_unit: usize,
    in_type_units: bool,
}

impl<'a, 'data> DieCursor<'a, 'data> {
    /// Creates a cursor over all DIEs of a module.
    ///
    /// `module_index` is the index of the module within its
    /// [`DebugInfo`](crate::DebugInfo) and is only used to label the
    /// returned [`DieRef`]s.
    pub fn new(module: &'a ModuleDwarf<'data>, module_index: usize) -> Self {
        DieCursor {
            module,
            module_index,
            stack: Vec::new(),
            unit: None,
            next_unit: 0,
            in_type_units: false,
        }
    }

    /// Returns the depth of the ancestor stack, current DIE included.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Returns the current DIE.
    pub fn current(&self) -> Option<DieRef> {
        let unit = self.unit?;
        let offset = *self.stack.last()?;
        Some(DieRef {
            module: self.module_index,
            offset: unit.global_offset(offset),
        })
    }

    /// Returns the current DIE and its ancestors, outermost first.
    pub fn dies(&self) -> Vec<DieRef> {
        match self.unit {
            Some(unit) => self
                .stack
                .iter()
                .map(|&offset| DieRef {
                    module: self.module_index,
                    offset: unit.global_offset(offset),
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub(crate) fn current_die(&self) -> Option<Die<'a, 'data>> {
        let unit = self.unit?;
        let offset = *self.stack.last()?;
        Some(Die {
            module_index: self.module_index,
            module: self.module,
            unit,
            offset,
        })
    }

    /// Moves to the next DIE in pre-order.
    ///
    /// The first call returns the root DIE of the first unit. If `children`
    /// is true and the current DIE has children, the next DIE is its first
    /// child; otherwise it is the next DIE at the same or a shallower depth:
    /// the current DIE's sibling, an ancestor's sibling, or the next unit's
    /// root DIE.
    ///
    /// If `subtree` is non-zero, iteration is bounded to the subtree rooted
    /// at the DIE that was at stack depth `subtree` when it was returned;
    /// exhaustion pops the stack back to that depth and returns `None`.
    pub fn next(&mut self, children: bool, subtree: usize) -> Result<Option<DieRef>> {
        debug_assert!(subtree <= self.stack.len() || self.stack.is_empty());
        if self.stack.is_empty() {
            return self.next_unit_root();
        }

        let unit = self.unit.expect("cursor has a stack but no unit");
        if children {
            let top = *self.stack.last().unwrap();
            if let Some(child) = first_child(unit, top)? {
                self.stack.push(child);
                return Ok(self.current());
            }
        }

        loop {
            if self.stack.len() == subtree {
                // Back at the root of the bounded subtree.
                return Ok(None);
            }
            if self.stack.len() == 1 {
                return self.next_unit_root();
            }
            let top = *self.stack.last().unwrap();
            if let Some(sibling) = next_sibling(unit, top)? {
                *self.stack.last_mut().unwrap() = sibling;
                return Ok(self.current());
            }
            self.stack.pop();
        }
    }

    fn next_unit_root(&mut self) -> Result<Option<DieRef>> {
        loop {
            let units = if self.in_type_units {
                &self.module.type_units
            } else {
                &self.module.units
            };
            match units.get(self.next_unit) {
                Some(unit) => {
                    self.next_unit += 1;
                    self.unit = Some(unit);
                    self.stack.clear();
                    self.stack.push(unit.root_offset);
                    return Ok(self.current());
                }
                None if !self.in_type_units => {
                    self.in_type_units = true;
                    self.next_unit = 0;
                }
                None => return Ok(None),
            }
        }
    }
}

/// Finds the chain of DIEs whose address ranges contain `pc`.
///
/// Walks every unit, descending only into DIEs that contain `pc`; once one
/// does, iteration is bounded to its subtree. The resulting stack is the
/// scope chain from the unit DIE down to the innermost block containing
/// `pc`. Returns an empty chain when no DIE covers `pc`.
pub(crate) fn find_scopes(
    module: &ModuleDwarf<'_>,
    module_index: usize,
    pc: u64,
) -> Result<Vec<DieRef>> {
    let mut cursor = DieCursor::new(module, module_index);
    let mut children = false;
    let mut subtree = 0;
    while cursor.next(children, subtree)?.is_some() {
        let die = cursor.current_die().unwrap();
        children = die.contains_pc(pc)?;
        if children {
            subtree = cursor.depth();
        }
    }
    if subtree == 0 {
        return Ok(Vec::new());
    }
    Ok(cursor.dies())
}

/// Reconstructs the ancestor chain of a DIE from its address alone.
///
/// Starting from the DIE's unit root, each step decides whether the target
/// lies in the current DIE's subtree: `DW_AT_sibling` gives the subtree
/// boundary when present, otherwise children are scanned in order. Returns
/// the ancestors outermost first, not including the DIE itself.
pub(crate) fn find_die_ancestors(
    module: &ModuleDwarf<'_>,
    module_index: usize,
    die: DieRef,
) -> Result<Vec<DieRef>> {
    let (unit, target) = module.unit_containing(die.offset)?;

    let mut stack = vec![unit.root_offset];
    loop {
        let top = *stack.last().unwrap();
        if top == target {
            stack.pop();
            return Ok(stack
                .into_iter()
                .map(|offset| DieRef {
                    module: module_index,
                    offset: unit.global_offset(offset),
                })
                .collect());
        }
        if top.0 > target.0 {
            return Err(DwarfError::Other(
                "could not find DWARF DIE ancestors".to_owned(),
            ));
        }

        let top_die = Die {
            module_index,
            module,
            unit,
            offset: top,
        };
        let mut sibling = None;
        if let Some(value) = top_die.attr_value(constants::DW_AT_sibling)? {
            let resolved = top_die.resolve_ref(value)?;
            if !std::ptr::eq(resolved.unit, unit) || resolved.offset.0 <= top.0 {
                return Err(DwarfError::Other("invalid DW_AT_sibling".to_owned()));
            }
            sibling = Some(resolved.offset);
        }

        if let Some(sibling) = sibling {
            if sibling.0 <= target.0 {
                // The subtree of the top DIE ends before the target; skip
                // over it entirely.
                *stack.last_mut().unwrap() = sibling;
                continue;
            }
        }

        // The target must be a descendant of the top DIE.
        if let Some(child) = first_child(unit, top)? {
            stack.push(child);
            continue;
        }

        // No children, so the target is between this DIE and the next one
        // without being reachable; advance and let the bounds check above
        // report it.
        loop {
            let top = *stack.last().unwrap();
            match next_sibling(unit, top)? {
                Some(next) => {
                    *stack.last_mut().unwrap() = next;
                    break;
                }
                None => {
                    stack.pop();
                    if stack.is_empty() {
                        return Err(DwarfError::Other(
                            "could not find DWARF DIE ancestors".to_owned(),
                        ));
                    }
                }
            }
        }
    }
}
