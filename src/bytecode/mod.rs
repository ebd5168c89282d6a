//! Bytecode generation: compiled artifacts and the shared session context.

mod buffer;
mod consts;
mod opcodes;
pub mod compiler;

pub use buffer::{Buffer, NodeMap};
pub use consts::{Slot, SlotTable, SLOT_FLAG_SIZE};
pub use opcodes::{dump, OpCode};
pub use compiler::{compile_program, Compiler};

use crate::prelude::*;
use crate::ast::{Block, Def};
use crate::types::{FfiType, TypeId, TypeTable};
use compiler::frame::LocalFrame;

/// Handle of a [`CompiledDef`] in the context's side table. Embedded in
/// `call`/`call_with_block` operands instead of a raw pointer.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct DefHandle(pub u32);

/// Handle of a [`CompiledBlock`].
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BlockHandle(pub u32);

/// Handle of a [`LibFunction`] descriptor.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct FunHandle(pub u32);

/// Handle of an interned string.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct StringHandle(pub u32);

/// Lowered bytecode and frame metadata for one method instantiation.
///
/// Executing `instructions` with `args_bytesize` bytes prepopulated on the
/// stack and the frame pointer positioned below them produces exactly one
/// value of the def's (merged) return type on normal completion.
#[derive(Debug)]
pub struct CompiledDef {
    pub def: Rc<Def>,
    pub instructions: Buffer,
    pub node_map: NodeMap,
    pub locals: LocalFrame,
    pub args_bytesize: u32,
}

/// Lowered bytecode for a block, inlined into its caller: the block body
/// executes against the caller's frame. `locals_start..locals_end` is the
/// caller-frame byte region holding the block's own args and vars.
#[derive(Debug)]
pub struct CompiledBlock {
    pub block: Rc<Block>,
    pub instructions: Buffer,
    pub node_map: NodeMap,
    pub args_bytesize: u32,
    pub locals_start: u32,
    pub locals_end: u32,
    pub block_level: u32,
}

/// Prebuilt call descriptor for a foreign function.
#[derive(Clone, Debug)]
pub struct LibFunction {
    pub lib: String,
    pub symbol: String,
    pub arg_types: Vec<FfiType>,
    pub arg_bytesizes: Vec<u32>,
    pub ret_type: FfiType,
    pub ret_bytesize: u32,
    pub variadic: bool,
}

/// One element move of an `unpack_tuple` instruction: the interpreter pops
/// the tuple, then for each element pushes `size` bytes read at
/// `tuple_offset`, widened to `target_size` (tagging when `union_tag` is
/// set) so the following `call_block` pops a regular argument layout.
#[derive(Clone, Debug)]
pub struct UnpackElement {
    pub tuple_offset: u32,
    pub size: u32,
    pub target_size: u32,
    pub union_tag: Option<TypeId>,
}

/// Descriptor of a yield-site tuple unpack across block parameters.
#[derive(Clone, Debug)]
pub struct TupleUnpack {
    pub tuple_size: u32,
    pub elements: Vec<UnpackElement>,
}

pub(crate) type DispatchKey = (Vec<usize>, Vec<TypeId>);

/// Session-wide compiler state, owned by the REPL driver and shared across
/// top-level compilations. Everything in here is append-only; the only
/// mutation is insertion.
pub struct Context {
    pub types: TypeTable,
    strings: Vec<String>,
    string_map: UnorderedMap<String, u32>,
    symbols: Vec<String>,
    symbol_map: UnorderedMap<String, u32>,
    pub consts: SlotTable,
    pub class_vars: SlotTable,
    class_var_initializers: UnorderedMap<String, Rc<Def>>,
    defs: Vec<CompiledDef>,
    blocks: Vec<CompiledBlock>,
    def_cache: UnorderedMap<usize, DefHandle>,
    dispatch_cache: UnorderedMap<DispatchKey, DefHandle>,
    lib_functions: Vec<LibFunction>,
    lib_cache: UnorderedMap<(String, String), FunHandle>,
    tuple_unpacks: Vec<TupleUnpack>,
}

impl Context {
    pub fn new(types: TypeTable) -> Self {
        Context {
            types,
            strings: Vec::new(),
            string_map: UnorderedMap::default(),
            symbols: Vec::new(),
            symbol_map: UnorderedMap::default(),
            consts: SlotTable::new(),
            class_vars: SlotTable::new(),
            class_var_initializers: UnorderedMap::default(),
            defs: Vec::new(),
            blocks: Vec::new(),
            def_cache: UnorderedMap::default(),
            dispatch_cache: UnorderedMap::default(),
            lib_functions: Vec::new(),
            lib_cache: UnorderedMap::default(),
            tuple_unpacks: Vec::new(),
        }
    }

    /// Interns a string; interned strings double as the GC root list for
    /// string literals.
    pub fn intern_string(&mut self, value: &str) -> StringHandle {
        if let Some(&handle) = self.string_map.get(value) {
            return StringHandle(handle);
        }
        let handle = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.string_map.insert(value.to_string(), handle);
        StringHandle(handle)
    }

    pub fn string(&self, handle: StringHandle) -> &str {
        &self.strings[handle.0 as usize]
    }

    /// Interns a symbol, returning its symbol-table index.
    pub fn intern_symbol(&mut self, name: &str) -> u32 {
        if let Some(&index) = self.symbol_map.get(name) {
            return index;
        }
        let index = self.symbols.len() as u32;
        self.symbols.push(name.to_string());
        self.symbol_map.insert(name.to_string(), index);
        index
    }

    pub fn symbol(&self, index: u32) -> &str {
        &self.symbols[index as usize]
    }

    /// Registers a class variable's initializer def. The compiler picks it
    /// up on the first reference to the class var.
    pub fn register_class_var_initializer(&mut self, name: impl Into<String>, def: Rc<Def>) {
        self.class_var_initializers.insert(name.into(), def);
    }

    pub(crate) fn class_var_initializer(&self, name: &str) -> Option<Rc<Def>> {
        self.class_var_initializers.get(name).cloned()
    }

    /// Reserves a def handle before its body is lowered, so recursive calls
    /// resolve to the handle under construction.
    pub(crate) fn reserve_def(&mut self, def: Rc<Def>) -> DefHandle {
        let handle = DefHandle(self.defs.len() as u32);
        self.defs.push(CompiledDef {
            def,
            instructions: Buffer::new(),
            node_map: NodeMap::new(),
            locals: LocalFrame::new(),
            args_bytesize: 0,
        });
        handle
    }

    pub(crate) fn finish_def(
        &mut self,
        handle: DefHandle,
        instructions: Buffer,
        node_map: NodeMap,
        locals: LocalFrame,
        args_bytesize: u32,
    ) {
        let slot = &mut self.defs[handle.0 as usize];
        slot.instructions = instructions;
        slot.node_map = node_map;
        slot.locals = locals;
        slot.args_bytesize = args_bytesize;
    }

    pub fn compiled_def(&self, handle: DefHandle) -> &CompiledDef {
        &self.defs[handle.0 as usize]
    }

    pub fn compiled_defs(&self) -> &[CompiledDef] {
        &self.defs
    }

    pub(crate) fn add_block(&mut self, block: CompiledBlock) -> BlockHandle {
        let handle = BlockHandle(self.blocks.len() as u32);
        self.blocks.push(block);
        handle
    }

    pub fn compiled_block(&self, handle: BlockHandle) -> &CompiledBlock {
        &self.blocks[handle.0 as usize]
    }

    pub fn compiled_blocks(&self) -> &[CompiledBlock] {
        &self.blocks
    }

    pub(crate) fn cached_def(&self, key: usize) -> Option<DefHandle> {
        self.def_cache.get(&key).copied()
    }

    pub(crate) fn cache_def(&mut self, key: usize, handle: DefHandle) {
        self.def_cache.insert(key, handle);
    }

    pub(crate) fn cached_dispatch(&self, key: &DispatchKey) -> Option<DefHandle> {
        self.dispatch_cache.get(key).copied()
    }

    pub(crate) fn cache_dispatch(&mut self, key: DispatchKey, handle: DefHandle) {
        self.dispatch_cache.insert(key, handle);
    }

    /// Looks up or builds a lib-function descriptor. Fixed-arity descriptors
    /// are cached per (lib, symbol); variadic ones are parameterized by the
    /// actual argument list and rebuilt per call site.
    pub(crate) fn lib_function(&mut self, function: LibFunction) -> FunHandle {
        let key = (function.lib.clone(), function.symbol.clone());
        if !function.variadic {
            if let Some(&handle) = self.lib_cache.get(&key) {
                return handle;
            }
        }
        let handle = FunHandle(self.lib_functions.len() as u32);
        self.lib_functions.push(function);
        if !self.lib_functions[handle.0 as usize].variadic {
            self.lib_cache.insert(key, handle);
        }
        handle
    }

    pub fn lib_functions(&self) -> &[LibFunction] {
        &self.lib_functions
    }

    pub(crate) fn add_tuple_unpack(&mut self, unpack: TupleUnpack) -> u32 {
        self.tuple_unpacks.push(unpack);
        (self.tuple_unpacks.len() - 1) as u32
    }

    pub fn tuple_unpack(&self, index: u32) -> &TupleUnpack {
        &self.tuple_unpacks[index as usize]
    }
}
