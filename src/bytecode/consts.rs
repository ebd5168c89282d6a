//! Constant and class-variable slot tables.
//!
//! Both tables share one layout: slots are laid out back to back in a flat
//! memory region owned by the interpreter, each as a 1-byte "initialized"
//! flag followed by the payload. Reads and writes go through the lazy-init
//! guard the compiler emits at every site, so a slot's initializer runs at
//! most once per session. Simple-literal constants never allocate a payload
//! read; the literal is re-emitted at each use site instead.

use crate::prelude::*;
use crate::ast::Node;
use crate::types::{TypeId, TypeTable};
use super::DefHandle;

/// Width of the initialized flag preceding every slot payload.
pub const SLOT_FLAG_SIZE: u32 = 1;

/// One constant or class-variable slot.
#[derive(Debug)]
pub struct Slot {
    pub name: String,
    pub ty: TypeId,
    /// Byte offset of the slot (its flag byte) within the table's region.
    pub offset: u32,
    /// Compiled initializer, absent for zero-initialized class vars.
    pub initializer: Option<DefHandle>,
    /// Simple-literal value inlined at use sites, skipping the guard.
    pub literal: Option<Node>,
}

/// Indexed slots for constants or class variables. Append-only.
#[derive(Debug, Default)]
pub struct SlotTable {
    slots: Vec<Slot>,
    by_name: UnorderedMap<String, usize>,
    bytesize: u32,
}

impl SlotTable {
    pub fn new() -> Self {
        SlotTable::default()
    }

    pub fn get(&self, name: &str) -> Option<&Slot> {
        self.by_name.get(name).map(|&index| &self.slots[index])
    }

    /// Declares a slot with a compiled initializer; returns its offset.
    pub fn declare(
        &mut self,
        name: impl Into<String>,
        ty: TypeId,
        initializer: Option<DefHandle>,
        types: &TypeTable,
    ) -> u32 {
        self.insert(name.into(), ty, initializer, None, types)
    }

    /// Declares a simple-literal constant, inlined at use sites.
    pub fn declare_literal(
        &mut self,
        name: impl Into<String>,
        ty: TypeId,
        literal: Node,
        types: &TypeTable,
    ) -> u32 {
        self.insert(name.into(), ty, None, Some(literal), types)
    }

    fn insert(
        &mut self,
        name: String,
        ty: TypeId,
        initializer: Option<DefHandle>,
        literal: Option<Node>,
        types: &TypeTable,
    ) -> u32 {
        if let Some(&index) = self.by_name.get(&name) {
            return self.slots[index].offset;
        }
        let offset = self.bytesize;
        self.bytesize += SLOT_FLAG_SIZE + types.aligned_size(ty);
        self.by_name.insert(name.clone(), self.slots.len());
        self.slots.push(Slot { name, ty, offset, initializer, literal });
        offset
    }

    /// Total byte size of the backing region, flags included.
    pub fn bytesize(&self) -> u32 {
        self.bytesize
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
