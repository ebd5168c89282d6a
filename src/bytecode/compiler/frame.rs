//! Local-variable frame: stack-slot offsets per block nesting level.

use crate::types::{TypeId, TypeTable};

/// A single named slot of a frame.
#[derive(Clone, Debug)]
pub struct LocalSlot {
    pub name: String,
    pub ty: TypeId,
    pub offset: u32,
    pub block_level: u32,
}

/// Maps names to byte offsets relative to the frame pointer. Blocks push a
/// scope; a name in an outer scope stays visible, and a slot's offset never
/// changes once declared. A block's slots occupy the contiguous region
/// between the frame size at push and at the end of its declarations.
#[derive(Clone, Debug, Default)]
pub struct LocalFrame {
    slots: Vec<LocalSlot>,
    bytesize: u32,
    max_bytesize: u32,
    block_level: u32,
    scopes: Vec<(u32, usize)>,
}

impl LocalFrame {
    pub fn new() -> Self {
        LocalFrame::default()
    }

    /// Appends a slot of the type's aligned size at the current frame end.
    pub fn declare(&mut self, name: impl Into<String>, ty: TypeId, types: &TypeTable) -> u32 {
        self.declare_raw(name, ty, types.aligned_size(ty))
    }

    /// Appends a slot with an explicit width. Used for the receiver slot,
    /// which holds a pointer when the receiver is a struct.
    pub fn declare_raw(&mut self, name: impl Into<String>, ty: TypeId, width: u32) -> u32 {
        let offset = self.bytesize;
        self.slots.push(LocalSlot {
            name: name.into(),
            ty,
            offset,
            block_level: self.block_level,
        });
        self.bytesize += width;
        self.max_bytesize = self.max_bytesize.max(self.bytesize);
        offset
    }

    /// Scans from the innermost block level outward.
    pub fn resolve(&self, name: &str) -> Option<&LocalSlot> {
        self.slots
            .iter()
            .rev()
            .find(|slot| slot.block_level <= self.block_level && slot.name == name)
    }

    /// Whether the name was declared in the current block scope itself.
    pub fn declared_in_current_block(&self, name: &str) -> bool {
        self.slots
            .iter()
            .rev()
            .take_while(|slot| slot.block_level == self.block_level)
            .any(|slot| slot.name == name)
    }

    pub fn push_block(&mut self) {
        self.scopes.push((self.bytesize, self.slots.len()));
        self.block_level += 1;
    }

    /// Drops the block's slots; their byte region becomes reusable by
    /// whatever the enclosing scope declares next.
    pub fn pop_block(&mut self) {
        let (bytesize, slot_count) = self.scopes.pop().expect("pop_block without push_block");
        self.slots.truncate(slot_count);
        self.bytesize = bytesize;
        self.block_level -= 1;
    }

    /// Current frame end in bytes.
    pub fn bytesize(&self) -> u32 {
        self.bytesize
    }

    /// High-water frame size, including popped block regions.
    pub fn max_bytesize(&self) -> u32 {
        self.max_bytesize
    }

    pub fn block_level(&self) -> u32 {
        self.block_level
    }
}
