//! Bytecode emitter. Lowers the typed AST to instructions.
//!
//! The pass walks the tree once, one rule per node kind, emitting stack
//! operations through the opcode table and back-patching jump targets as
//! their destinations are reached. Two ambient flags steer every rule:
//!
//! - `wants_value`: when false, the visited expression leaves nothing on the
//!   stack. Sequences discard all but their last expression this way.
//! - `wants_struct_pointer`: when true, the expression leaves a region of
//!   the value's aligned size followed by a pointer to a live value, so
//!   mutable struct methods get a self pointer no matter how the receiver
//!   was computed. Producers that cannot hand out a stable address push the
//!   value itself and a pointer to it; the region is popped out from under
//!   the result after the call.
//!
//! Both flags are saved and restored around every descent that should not
//! inherit them.

pub(crate) mod frame;
pub mod error;
mod dispatch;
mod widen;

use crate::prelude::*;
use crate::ast::{Block, Call, Def, Location, Node, NodeKind, NumberValue};
use crate::types::{NumKind, TypeId, TypeKind, TypeTable, UNION_TAG_SIZE};
use super::{BlockHandle, Buffer, CompiledBlock, Context, DefHandle, LibFunction, NodeMap, TupleUnpack, UnpackElement};
use crate::types::FfiType;
use error::{CompileError, CompileErrorKind, CompileResult};
use frame::LocalFrame;
use tracing::trace;

/// A call-site block attached to the def compiled against it. Yield sites
/// inside the def invoke the block through this handle.
#[derive(Clone)]
pub(crate) struct BlockAttachment {
    pub handle: BlockHandle,
    pub block: Rc<Block>,
}

/// Jump-patch bookkeeping for the innermost while loop.
struct WhileContext {
    ty: TypeId,
    breaks: Vec<u32>,
    nexts: Vec<u32>,
}

/// Set while emitting a block body: break/next/return leave the block, the
/// yielding call, or the block's home def respectively.
struct BlockContext {
    block: Rc<Block>,
    /// Merged return type of the def the block lexically belongs to.
    home_merged_ty: TypeId,
    /// Merged result type of the call the block is attached to.
    break_merged_ty: TypeId,
}

/// Per-def emission state. One instance exists per def (or block) being
/// lowered; target defs of calls get their own nested instance.
pub struct Compiler<'ctx> {
    context: &'ctx mut Context,
    instructions: Buffer,
    node_map: NodeMap,
    locals: LocalFrame,
    def: Rc<Def>,
    merged_return_ty: TypeId,
    self_type: Option<TypeId>,
    wants_value: bool,
    wants_struct_pointer: bool,
    whiles: Vec<WhileContext>,
    compiling_block: Option<BlockContext>,
    attached_block: Option<BlockAttachment>,
    /// Location of the node being visited, for emit-time bug reports.
    location: Location,
}

/// Compiles one top-level expression (REPL line or file) into a synthetic
/// program-scope def and returns its handle. `vars` is the frontend's
/// program-scope local table, persisted across REPL lines by the driver.
pub fn compile_program(
    context: &mut Context,
    program: &Node,
    vars: &[(String, TypeId)],
) -> CompileResult<DefHandle> {
    let def = Rc::new(Def {
        name: "<program>".to_string(),
        owner: None,
        params: Vec::new(),
        vars: vars.to_vec(),
        body: program.clone(),
        ty: program.ty,
        accepts_block: false,
        block_param: None,
        closure: false,
        external: None,
    });
    lower_def(context, def, None)
}

/// Fetches or builds the `CompiledDef` for a target def. Defs compiled
/// against a block are re-emitted per call site (the block is inlined);
/// everything else is cached by def identity.
pub(crate) fn lower_def(
    context: &mut Context,
    def: Rc<Def>,
    block: Option<BlockAttachment>,
) -> CompileResult<DefHandle> {
    let key = Rc::as_ptr(&def) as usize;
    let cacheable = block.is_none() && !def.accepts_block;
    if cacheable {
        if let Some(handle) = context.cached_def(key) {
            return Ok(handle);
        }
    }
    trace!(def = def.name.as_str(), "lowering def");

    let mut locals = LocalFrame::new();
    let mut args_bytesize = 0u32;
    if let Some(owner) = def.owner {
        let width = if context.types.passed_by_value(owner) {
            8
        } else {
            context.types.aligned_size(owner)
        };
        locals.declare_raw("self", owner, width);
        args_bytesize += width;
    }
    for param in &def.params {
        locals.declare(&param.name, param.ty, &context.types);
        args_bytesize += context.types.aligned_size(param.ty);
    }
    if let Some(block_param) = &def.block_param {
        locals.declare(&block_param.name, block_param.ty, &context.types);
        args_bytesize += context.types.aligned_size(block_param.ty);
    }
    for (name, ty) in &def.vars {
        if locals.resolve(name).is_none() {
            locals.declare(name, *ty, &context.types);
        }
    }

    let merged = merged_result(&context.types, def.ty, block.as_ref().and_then(|b| b.block.break_type))
        .ok_or_else(|| {
            CompileError::new(
                def.body.location,
                CompileErrorKind::Bug(format!("no merged return type for '{}'", def.name)),
            )
        })?;

    let handle = context.reserve_def(def.clone());
    if cacheable {
        context.cache_def(key, handle);
    }

    let (instructions, node_map, locals, result) = {
        let mut compiler = Compiler {
            context,
            instructions: Buffer::new(),
            node_map: NodeMap::new(),
            locals,
            def: def.clone(),
            merged_return_ty: merged,
            self_type: def.owner,
            wants_value: true,
            wants_struct_pointer: false,
            whiles: Vec::new(),
            compiling_block: None,
            attached_block: block,
            location: def.body.location,
        };
        let result = compiler.compile_body(merged);
        (compiler.instructions, compiler.node_map, compiler.locals, result)
    };
    result?;
    context.finish_def(handle, instructions, node_map, locals, args_bytesize);
    Ok(handle)
}

/// A def's observable return type: its own type merged with the block's
/// break type, where a block that can break is attached.
fn merged_result(types: &TypeTable, def_ty: TypeId, break_ty: Option<TypeId>) -> Option<TypeId> {
    match break_ty {
        Some(break_ty) => types.type_merge(def_ty, break_ty),
        None => Some(def_ty),
    }
}

/// Kinds that honor `wants_struct_pointer` themselves instead of the
/// generic value-then-pointer fallback.
fn propagates_struct_pointer(kind: &NodeKind) -> bool {
    matches!(
        kind,
        NodeKind::Var(_)
            | NodeKind::InstanceVar(_)
            | NodeKind::ClassVar(_)
            | NodeKind::Path(_)
            | NodeKind::If { .. }
            | NodeKind::Expressions(_)
            | NodeKind::ExceptionHandler { .. }
    )
}

impl<'ctx> Compiler<'ctx> {
    fn compile_body(&mut self, merged: TypeId) -> CompileResult {
        let def = self.def.clone();
        let size = self.aligned(merged);
        if size == 0 {
            self.visit_discard(&def.body)?;
            self.instructions.put_nil();
        } else {
            self.visit_value(&def.body)?;
            self.upcast(def.body.ty, merged)?;
        }
        self.instructions.leave(size);
        Ok(())
    }

    /// Visits one node with the inherited flag pair.
    fn visit(&mut self, node: &Node) -> CompileResult {
        self.location = node.location;
        self.node_map.record(self.instructions.len(), node.location);

        // Producers without an addressable home: push the value, then a
        // pointer to it. The cleanup pass pops the value back out once the
        // callee returns.
        if self.wants_struct_pointer && !propagates_struct_pointer(&node.kind) {
            self.visit_value(node)?;
            let size = self.aligned(node.ty);
            self.instructions.put_stack_top_pointer(size);
            return Ok(());
        }

        match &node.kind {
            NodeKind::NilLiteral => {
                if self.wants_value {
                    self.instructions.put_nil();
                }
                Ok(())
            }
            NodeKind::BoolLiteral(value) => {
                if self.wants_value {
                    if *value {
                        self.instructions.put_true();
                    } else {
                        self.instructions.put_false();
                    }
                }
                Ok(())
            }
            NodeKind::NumberLiteral(value) => {
                if self.wants_value {
                    self.write_number(node, node.ty, *value)?;
                }
                Ok(())
            }
            NodeKind::CharLiteral(value) => {
                if self.wants_value {
                    self.instructions.put_i32(*value as u32 as i32);
                }
                Ok(())
            }
            NodeKind::StringLiteral(value) => {
                if self.wants_value {
                    let handle = self.context.intern_string(value);
                    self.instructions.put_string(handle.0);
                }
                Ok(())
            }
            NodeKind::SymbolLiteral(name) => {
                if self.wants_value {
                    let index = self.context.intern_symbol(name);
                    self.instructions.put_symbol(index);
                }
                Ok(())
            }
            NodeKind::TupleLiteral(elements) => self.compile_tuple_literal(node, elements),
            NodeKind::NamedTupleLiteral(entries) => self.compile_named_tuple_literal(node, entries),

            NodeKind::Var(name) => self.compile_var(node, name),
            NodeKind::InstanceVar(name) => self.compile_instance_var(node, name),
            NodeKind::ClassVar(name) => self.compile_class_var(node, name),
            NodeKind::Path(name) => self.compile_path(node, name),
            NodeKind::Underscore => Err(self.bug(node, "underscore outside assignment")),
            NodeKind::UninitializedVar(name) => {
                // the slot exists; reading it yields whatever is there
                let (offset, slot_ty) = self.resolve_local(node, name)?;
                if self.wants_value {
                    let size = self.aligned(slot_ty);
                    self.instructions.get_local(offset, size);
                    self.downcast(slot_ty, node.ty)?;
                }
                Ok(())
            }

            NodeKind::Assign { target, value } => self.compile_assign(node, target, value),
            NodeKind::If { cond, then_branch, else_branch, truthiness } => {
                self.compile_if(node, cond, then_branch, else_branch, *truthiness)
            }
            NodeKind::While { cond, body } => self.compile_while(node, cond, body),
            NodeKind::Return(value) => self.compile_return(node, value.as_deref()),
            NodeKind::Break(value) => self.compile_break(node, value.as_deref()),
            NodeKind::Next(value) => self.compile_next(node, value.as_deref()),
            NodeKind::Yield(args) => self.compile_yield(node, args),
            NodeKind::Call(call) => self.compile_call(node, call),
            NodeKind::Expressions(nodes) => self.compile_expressions(node, nodes),

            NodeKind::PointerOf(exp) => self.compile_pointerof(node, exp),
            NodeKind::SizeOf(ty) => {
                if self.wants_value {
                    let size = self.aligned(*ty);
                    self.instructions.put_i32(size as i32);
                }
                Ok(())
            }
            NodeKind::TypeOf(ty) => {
                if self.wants_value {
                    let ty = self.context.types.remove_indirection(*ty);
                    self.instructions.put_type(ty.0);
                }
                Ok(())
            }
            NodeKind::IsA { receiver, target } => {
                if !self.wants_value {
                    return self.visit_discard(receiver);
                }
                self.visit_value(receiver)?;
                self.write_is_a(receiver.ty, *target);
                Ok(())
            }
            NodeKind::Cast { receiver, target } => self.compile_cast(node, receiver, *target),
            NodeKind::NilableCast { receiver, target } => {
                self.compile_nilable_cast(node, receiver, *target)
            }
            NodeKind::Not(exp) => {
                if !self.wants_value {
                    return self.visit_discard(exp);
                }
                self.visit_value(exp)?;
                self.write_value_to_bool(exp.ty);
                self.instructions.logical_not();
                Ok(())
            }
            NodeKind::ReadInstanceVar { receiver, name } => {
                self.compile_read_instance_var(node, receiver, name)
            }
            NodeKind::Out(_) => Err(self.bug(node, "out argument outside a lib call")),
            NodeKind::ProcLiteral(def) => {
                if def.closure {
                    return Err(self.error(node.location, CompileErrorKind::Unsupported("closures".into())));
                }
                let handle = lower_def(self.context, def.clone(), None)?;
                if self.wants_value {
                    // two-word proc: compiled def identity + null context
                    self.instructions.put_i64(handle.0 as i64);
                    self.instructions.put_i64(0);
                }
                Ok(())
            }
            NodeKind::ExceptionHandler { body, rescues, else_branch, ensure } => {
                if !rescues.is_empty() || else_branch.is_some() {
                    return Err(self.error(
                        node.location,
                        CompileErrorKind::Unsupported("rescue/else clauses".into()),
                    ));
                }
                self.visit(body)?;
                if self.wants_value && !self.wants_struct_pointer {
                    self.upcast(body.ty, node.ty)?;
                }
                if let Some(ensure) = ensure {
                    self.visit_discard(ensure)?;
                }
                Ok(())
            }
            NodeKind::Primitive(name) => {
                let name = name.clone();
                self.compile_primitive_body(node, &name)
            }

            NodeKind::ClassDef { body } | NodeKind::ModuleDef { body } => {
                if let Some(body) = body {
                    self.visit_discard(body)?;
                }
                if self.wants_value {
                    self.instructions.put_nil();
                }
                Ok(())
            }
            NodeKind::EnumDef
            | NodeKind::LibDef
            | NodeKind::FunDef
            | NodeKind::MacroDef
            | NodeKind::AliasDef
            | NodeKind::AnnotationDef
            | NodeKind::Include
            | NodeKind::Extend
            | NodeKind::TypeDeclaration { .. } => {
                if self.wants_value {
                    self.instructions.put_nil();
                }
                Ok(())
            }
            NodeKind::VisibilityModifier(exp) => self.visit(exp),

            NodeKind::FileNode { body, filename, vars } => {
                let file_def = Rc::new(Def {
                    name: format!("<{}>", filename),
                    owner: None,
                    params: Vec::new(),
                    vars: vars.clone(),
                    body: (**body).clone(),
                    ty: TypeTable::NIL,
                    accepts_block: false,
                    block_param: None,
                    closure: false,
                    external: None,
                });
                let handle = lower_def(self.context, file_def, None)?;
                self.instructions.call(handle.0);
                if self.wants_value {
                    self.instructions.put_nil();
                }
                Ok(())
            }
            NodeKind::Unreachable => {
                let message = self.context.intern_string("unreachable");
                self.instructions.unreachable(message.0);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // flag scoping

    fn visit_value(&mut self, node: &Node) -> CompileResult {
        let saved = (self.wants_value, self.wants_struct_pointer);
        self.wants_value = true;
        self.wants_struct_pointer = false;
        let result = self.visit(node);
        (self.wants_value, self.wants_struct_pointer) = saved;
        result
    }

    fn visit_discard(&mut self, node: &Node) -> CompileResult {
        let saved = (self.wants_value, self.wants_struct_pointer);
        self.wants_value = false;
        self.wants_struct_pointer = false;
        let result = self.visit(node);
        (self.wants_value, self.wants_struct_pointer) = saved;
        result
    }

    fn visit_struct_pointer(&mut self, node: &Node) -> CompileResult {
        let saved = (self.wants_value, self.wants_struct_pointer);
        self.wants_value = true;
        self.wants_struct_pointer = true;
        let result = self.visit(node);
        (self.wants_value, self.wants_struct_pointer) = saved;
        result
    }

    // ------------------------------------------------------------------
    // literals

    fn compile_tuple_literal(&mut self, node: &Node, elements: &[Node]) -> CompileResult {
        if !self.wants_value {
            for element in elements {
                self.visit_discard(element)?;
            }
            return Ok(());
        }
        let element_types: Vec<TypeId> = {
            let ty = self.context.types.remove_indirection(node.ty);
            match self.context.types.kind(ty) {
                TypeKind::Tuple { elements } => elements.clone(),
                _ => return Err(self.bug(node, "tuple literal with non-tuple type")),
            }
        };
        self.compile_tuple_elements(node, elements.iter().collect(), element_types)
    }

    fn compile_named_tuple_literal(
        &mut self,
        node: &Node,
        literal_entries: &[(String, Node)],
    ) -> CompileResult {
        if !self.wants_value {
            for (_, entry) in literal_entries {
                self.visit_discard(entry)?;
            }
            return Ok(());
        }
        // entries are laid out in the type's declaration order, not the
        // literal's spelling order
        let type_entries: Vec<(String, TypeId)> = {
            let ty = self.context.types.remove_indirection(node.ty);
            match self.context.types.kind(ty) {
                TypeKind::NamedTuple { entries } => entries.clone(),
                _ => return Err(self.bug(node, "named-tuple literal with non-named-tuple type")),
            }
        };
        let mut ordered = Vec::with_capacity(type_entries.len());
        let mut element_types = Vec::with_capacity(type_entries.len());
        for (name, entry_ty) in &type_entries {
            let entry = literal_entries
                .iter()
                .find(|(entry_name, _)| entry_name == name)
                .map(|(_, entry)| entry)
                .ok_or_else(|| self.bug(node, format!("missing named-tuple entry '{}'", name)))?;
            ordered.push(entry);
            element_types.push(*entry_ty);
        }
        self.compile_tuple_elements(node, ordered, element_types)
    }

    /// Realizes a tuple's memory layout directly on the stack: elements in
    /// declaration order with zero padding between their aligned slots.
    fn compile_tuple_elements(
        &mut self,
        node: &Node,
        elements: Vec<&Node>,
        element_types: Vec<TypeId>,
    ) -> CompileResult {
        let total = self.aligned(node.ty);
        let mut current = 0u32;
        for (index, element) in elements.iter().enumerate() {
            let target = element_types[index];
            let offset = self.context.types.tuple_offset(node.ty, index);
            if offset > current {
                self.write_push_zeros(offset - current);
            }
            self.visit_value(element)?;
            self.upcast(element.ty, target)?;
            current = offset + self.aligned(target);
        }
        if total > current {
            self.write_push_zeros(total - current);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // variables

    fn compile_var(&mut self, node: &Node, name: &str) -> CompileResult {
        if name == "self" {
            if let Some(owner) = self.self_type {
                if self.context.types.passed_by_value(owner) {
                    // self is a pointer slot when the receiver is a struct
                    let (offset, _) = self.resolve_local(node, "self")?;
                    if self.wants_struct_pointer {
                        self.write_push_zeros(self.aligned(node.ty));
                        self.instructions.get_local(offset, 8);
                    } else if self.wants_value {
                        let size = self.aligned(owner);
                        self.instructions.get_self_ivar(0, size);
                        self.downcast(owner, node.ty)?;
                    }
                    return Ok(());
                }
            }
        }
        let (offset, slot_ty) = self.resolve_local(node, name)?;
        if self.wants_struct_pointer {
            self.write_push_zeros(self.aligned(node.ty));
            self.instructions.pointerof_var(offset);
            if self.context.types.is_mixed_union(slot_ty) && !self.context.types.is_mixed_union(node.ty) {
                // skip the union tag to reach the payload
                self.instructions.put_i64(UNION_TAG_SIZE as i64);
                self.instructions.pointer_add(1);
            }
        } else if self.wants_value {
            let size = self.aligned(slot_ty);
            self.instructions.get_local(offset, size);
            self.downcast(slot_ty, node.ty)?;
        }
        Ok(())
    }

    fn compile_instance_var(&mut self, node: &Node, name: &str) -> CompileResult {
        let Some(self_ty) = self.self_type else {
            if self.wants_value {
                self.instructions.put_nil();
            }
            return Ok(());
        };
        let (offset, ivar_ty) = self
            .context
            .types
            .lookup_instance_var(self_ty, name)
            .ok_or_else(|| self.bug(node, format!("undefined instance var {}", name)))?;
        if self.wants_struct_pointer {
            self.write_push_zeros(self.aligned(node.ty));
            self.instructions.pointerof_self_ivar(offset);
        } else if self.wants_value {
            let size = self.aligned(ivar_ty);
            self.instructions.get_self_ivar(offset, size);
            self.downcast(ivar_ty, node.ty)?;
        }
        Ok(())
    }

    fn compile_class_var(&mut self, node: &Node, name: &str) -> CompileResult {
        let (offset, slot_ty, initializer) = self.ensure_class_var(name, node.ty)?;
        let size = self.aligned(slot_ty);
        if self.wants_struct_pointer {
            self.emit_class_var_guard(offset, size, initializer);
            self.write_push_zeros(self.aligned(node.ty));
            self.instructions.pointerof_class_var(offset);
        } else if self.wants_value {
            self.emit_class_var_guard(offset, size, initializer);
            self.instructions.get_class_var(offset, size);
            self.downcast(slot_ty, node.ty)?;
        }
        Ok(())
    }

    fn compile_path(&mut self, node: &Node, name: &str) -> CompileResult {
        let slot = self
            .context
            .consts
            .get(name)
            .map(|slot| (slot.offset, slot.ty, slot.initializer, slot.literal.clone()));
        if let Some((offset, slot_ty, initializer, literal)) = slot {
            if let Some(literal) = literal {
                if self.wants_value {
                    self.visit_value(&literal)?;
                }
                return Ok(());
            }
            let size = self.aligned(slot_ty);
            if self.wants_struct_pointer {
                self.emit_const_guard(offset, size, initializer);
                self.write_push_zeros(self.aligned(node.ty));
                self.instructions.get_const_pointer(offset);
            } else if self.wants_value {
                self.emit_const_guard(offset, size, initializer);
                self.instructions.get_const(offset, size);
                self.downcast(slot_ty, node.ty)?;
            }
            return Ok(());
        }
        // a path that is not a constant names a type
        let ty = self.context.types.remove_indirection(node.ty);
        match self.context.types.kind(ty) {
            TypeKind::Metaclass { instance } => {
                if self.wants_value {
                    self.instructions.put_type(instance.0);
                }
                Ok(())
            }
            TypeKind::VirtualMetaclass { base } => {
                if self.wants_value {
                    self.instructions.put_type(base.0);
                }
                Ok(())
            }
            _ => Err(self.error(node.location, CompileErrorKind::UndefinedConstant(name.to_string()))),
        }
    }

    fn resolve_local(&self, node: &Node, name: &str) -> CompileResult<(u32, TypeId)> {
        self.locals
            .resolve(name)
            .map(|slot| (slot.offset, slot.ty))
            .ok_or_else(|| self.error(node.location, CompileErrorKind::UndefinedLocal(name.to_string())))
    }

    // ------------------------------------------------------------------
    // assignment

    fn compile_assign(&mut self, node: &Node, target: &Node, value: &Node) -> CompileResult {
        match &target.kind {
            NodeKind::Var(name) => {
                let name = name.clone();
                self.visit_value(value)?;
                let (offset, slot_ty) = self.resolve_local(target, &name)?;
                if self.wants_value {
                    self.write_dup(self.aligned(value.ty));
                }
                self.upcast(value.ty, slot_ty)?;
                let size = self.aligned(slot_ty);
                self.instructions.set_local(offset, size);
                Ok(())
            }
            NodeKind::InstanceVar(_) | NodeKind::ClassVar(_) if self.self_type.is_none() => {
                // outside a method body these silently yield nil
                self.visit_discard(value)?;
                if self.wants_value {
                    self.instructions.put_nil();
                }
                Ok(())
            }
            NodeKind::InstanceVar(name) => {
                let self_ty = self.self_type.expect("checked above");
                let (offset, ivar_ty) = self
                    .context
                    .types
                    .lookup_instance_var(self_ty, name)
                    .ok_or_else(|| self.bug(target, format!("undefined instance var {}", name)))?;
                self.visit_value(value)?;
                if self.wants_value {
                    self.write_dup(self.aligned(value.ty));
                }
                self.upcast(value.ty, ivar_ty)?;
                let size = self.aligned(ivar_ty);
                self.instructions.set_self_ivar(offset, size);
                Ok(())
            }
            NodeKind::ClassVar(name) => {
                let name = name.clone();
                let (offset, slot_ty, initializer) = self.ensure_class_var(&name, target.ty)?;
                let size = self.aligned(slot_ty);
                self.emit_class_var_guard(offset, size, initializer);
                self.visit_value(value)?;
                if self.wants_value {
                    self.write_dup(self.aligned(value.ty));
                }
                self.upcast(value.ty, slot_ty)?;
                self.instructions.set_class_var(offset, size);
                Ok(())
            }
            NodeKind::Underscore => {
                if self.wants_value {
                    self.visit_value(value)
                } else {
                    self.visit_discard(value)
                }
            }
            NodeKind::Path(_) => self.compile_const_assign(node, target, value),
            _ => Err(self.bug(node, "unsupported assignment target")),
        }
    }

    /// Top-level constant assignment: the value becomes a lazily-run
    /// initializer def, and the site emits the standard guard so the slot
    /// is populated the first time execution reaches it.
    fn compile_const_assign(&mut self, node: &Node, target: &Node, value: &Node) -> CompileResult {
        let NodeKind::Path(name) = &target.kind else {
            return Err(self.bug(node, "constant assignment without a path target"));
        };
        let name = name.clone();
        if value.simple_literal() {
            let context = &mut *self.context;
            context
                .consts
                .declare_literal(name, value.ty, value.clone(), &context.types);
            if self.wants_value {
                self.visit_value(value)?;
            }
            return Ok(());
        }
        let init_def = Rc::new(Def {
            name: format!("{}::init", name),
            owner: None,
            params: Vec::new(),
            vars: Vec::new(),
            body: value.clone(),
            ty: value.ty,
            accepts_block: false,
            block_param: None,
            closure: false,
            external: None,
        });
        let initializer = lower_def(self.context, init_def, None)?;
        let offset = {
            let context = &mut *self.context;
            context
                .consts
                .declare(name, target.ty, Some(initializer), &context.types)
        };
        let size = self.aligned(target.ty);
        self.emit_const_guard(offset, size, Some(initializer));
        if self.wants_value {
            self.instructions.get_const(offset, size);
            self.downcast(target.ty, node.ty)?;
        }
        Ok(())
    }

    /// The lazy-init pattern emitted at every guarded slot site.
    fn emit_const_guard(&mut self, offset: u32, size: u32, initializer: Option<DefHandle>) {
        let Some(initializer) = initializer else { return };
        self.instructions.const_initialized(offset);
        self.instructions.branch_if(0);
        let done = self.instructions.patch_location();
        self.instructions.call(initializer.0);
        self.instructions.set_const(offset, size);
        self.instructions.patch_jump(done);
    }

    fn emit_class_var_guard(&mut self, offset: u32, size: u32, initializer: Option<DefHandle>) {
        let Some(initializer) = initializer else { return };
        self.instructions.class_var_initialized(offset);
        self.instructions.branch_if(0);
        let done = self.instructions.patch_location();
        self.instructions.call(initializer.0);
        self.instructions.set_class_var(offset, size);
        self.instructions.patch_jump(done);
    }

    /// Looks up or declares a class-var slot. A driver-registered
    /// initializer def is compiled on first reference; without one the
    /// payload starts zeroed and the flag is set on first write.
    fn ensure_class_var(
        &mut self,
        name: &str,
        ty_hint: TypeId,
    ) -> CompileResult<(u32, TypeId, Option<DefHandle>)> {
        if let Some(slot) = self.context.class_vars.get(name) {
            return Ok((slot.offset, slot.ty, slot.initializer));
        }
        let init_def = self.context.class_var_initializer(name);
        let (ty, initializer) = match init_def {
            Some(def) => {
                let ty = def.ty;
                (ty, Some(lower_def(self.context, def, None)?))
            }
            None => (ty_hint, None),
        };
        let context = &mut *self.context;
        let offset = context
            .class_vars
            .declare(name.to_string(), ty, initializer, &context.types);
        Ok((offset, ty, initializer))
    }

    // ------------------------------------------------------------------
    // control flow

    fn compile_if(
        &mut self,
        node: &Node,
        cond: &Node,
        then_branch: &Node,
        else_branch: &Node,
        truthiness: Option<bool>,
    ) -> CompileResult {
        // compile-time-known conditions lower only the live branch
        if let Some(known) = truthiness {
            let live = if known { then_branch } else { else_branch };
            self.visit(live)?;
            if self.wants_value && !self.wants_struct_pointer {
                self.upcast(live.ty, node.ty)?;
            }
            return Ok(());
        }
        self.visit_value(cond)?;
        self.write_value_to_bool(cond.ty);
        self.instructions.branch_unless(0);
        let else_patch = self.instructions.patch_location();
        self.visit(then_branch)?;
        if self.wants_value && !self.wants_struct_pointer {
            self.upcast(then_branch.ty, node.ty)?;
        }
        self.instructions.jump(0);
        let end_patch = self.instructions.patch_location();
        self.instructions.patch_jump(else_patch);
        self.visit(else_branch)?;
        if self.wants_value && !self.wants_struct_pointer {
            self.upcast(else_branch.ty, node.ty)?;
        }
        self.instructions.patch_jump(end_patch);
        Ok(())
    }

    fn compile_while(&mut self, node: &Node, cond: &Node, body: &Node) -> CompileResult {
        let ty = node.ty;
        self.instructions.jump(0);
        let cond_patch = self.instructions.patch_location();
        let body_index = self.instructions.len();
        self.whiles.push(WhileContext { ty, breaks: Vec::new(), nexts: Vec::new() });
        let body_result = self.visit_discard(body);
        let ctx = self.whiles.pop().expect("while context missing");
        body_result?;
        // next jumps continue at the condition
        for patch in ctx.nexts {
            self.instructions.patch_jump(patch);
        }
        self.instructions.patch_jump(cond_patch);
        self.visit_value(cond)?;
        self.write_value_to_bool(cond.ty);
        self.instructions.branch_if(body_index);
        self.upcast(TypeTable::NIL, ty)?;
        for patch in ctx.breaks {
            self.instructions.patch_jump(patch);
        }
        if !self.wants_value {
            self.write_pop(self.aligned(ty));
        }
        Ok(())
    }

    fn compile_return(&mut self, _node: &Node, value: Option<&Node>) -> CompileResult {
        let merged = self
            .compiling_block
            .as_ref()
            .map(|ctx| ctx.home_merged_ty)
            .unwrap_or(self.merged_return_ty);
        match value {
            Some(value) => {
                self.visit_value(value)?;
                self.upcast(value.ty, merged)?;
            }
            None => self.upcast(TypeTable::NIL, merged)?,
        }
        let size = self.aligned(merged);
        if self.compiling_block.is_some() {
            self.instructions.leave_def(size);
        } else {
            self.instructions.leave(size);
        }
        Ok(())
    }

    fn compile_break(&mut self, node: &Node, value: Option<&Node>) -> CompileResult {
        if !self.whiles.is_empty() {
            let ty = self.whiles.last().expect("while context").ty;
            match value {
                Some(value) => {
                    self.visit_value(value)?;
                    self.upcast(value.ty, ty)?;
                }
                None => self.upcast(TypeTable::NIL, ty)?,
            }
            self.instructions.jump(0);
            let patch = self.instructions.patch_location();
            self.whiles.last_mut().expect("while context").breaks.push(patch);
            Ok(())
        } else if let Some(break_ty) = self.compiling_block.as_ref().map(|ctx| ctx.break_merged_ty) {
            match value {
                Some(value) => {
                    self.visit_value(value)?;
                    self.upcast(value.ty, break_ty)?;
                }
                None => self.upcast(TypeTable::NIL, break_ty)?,
            }
            let size = self.aligned(break_ty);
            self.instructions.break_block(size);
            Ok(())
        } else {
            Err(self.error(node.location, CompileErrorKind::InvalidBreak))
        }
    }

    fn compile_next(&mut self, node: &Node, value: Option<&Node>) -> CompileResult {
        if !self.whiles.is_empty() {
            // next's value is discarded
            if let Some(value) = value {
                self.visit_discard(value)?;
            }
            self.instructions.jump(0);
            let patch = self.instructions.patch_location();
            self.whiles.last_mut().expect("while context").nexts.push(patch);
            Ok(())
        } else if let Some(block_ty) = self.compiling_block.as_ref().map(|ctx| ctx.block.ty) {
            match value {
                Some(value) => {
                    self.visit_value(value)?;
                    self.upcast(value.ty, block_ty)?;
                }
                None => self.upcast(TypeTable::NIL, block_ty)?,
            }
            let size = self.aligned(block_ty);
            self.instructions.leave(size);
            Ok(())
        } else {
            Err(self.error(node.location, CompileErrorKind::InvalidNext))
        }
    }

    fn compile_expressions(&mut self, node: &Node, nodes: &[Node]) -> CompileResult {
        let Some((last, rest)) = nodes.split_last() else {
            if self.wants_value {
                self.instructions.put_nil();
            }
            return Ok(());
        };
        for expression in rest {
            self.visit_discard(expression)?;
        }
        self.visit(last)?;
        if self.wants_value && !self.wants_struct_pointer {
            self.upcast(last.ty, node.ty)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // calls

    fn compile_call(&mut self, node: &Node, call: &Call) -> CompileResult {
        if call.target_defs.is_empty() {
            return Err(self.error(node.location, CompileErrorKind::MissingTargets(call.name.clone())));
        }
        if let Some(receiver) = &call.receiver {
            let receiver_ty = self.context.types.remove_indirection(receiver.ty);
            if matches!(self.context.types.kind(receiver_ty), TypeKind::Lib) {
                return self.compile_lib_call(node, call);
            }
        }
        if call.target_defs.len() > 1 {
            return self.compile_dispatch_call(node, call);
        }
        let target = call.target_defs[0].clone();
        if let NodeKind::Primitive(name) = &target.body.kind {
            let name = name.clone();
            return self.compile_primitive_call(node, call, &target, &name);
        }

        // an inlined block is compiled first so yield sites in the target
        // can reference it; a proc-literal block travels as a plain arg
        let inline_block = match (&call.block, &call.block_arg) {
            (Some(block), None) => Some(block.clone()),
            _ => None,
        };
        let attachment = match &inline_block {
            Some(block) => Some(self.compile_block(block, &target)?),
            None => None,
        };
        let compiled = lower_def(self.context, target.clone(), attachment.clone())?;

        // receiver
        let mut receiver_struct_bytes = 0u32;
        match (&call.receiver, target.owner) {
            (Some(receiver), Some(owner)) => {
                if self.context.types.passed_by_value(owner) {
                    receiver_struct_bytes = self.compile_struct_receiver(receiver)?;
                } else {
                    self.visit_value(receiver)?;
                    self.upcast(receiver.ty, owner)?;
                }
            }
            (None, Some(owner)) => {
                // receiverless call inside a method: pass self along
                let (offset, _) = self.resolve_local(node, "self")?;
                let width = if self.context.types.passed_by_value(owner) {
                    8
                } else {
                    self.aligned(owner)
                };
                self.instructions.get_local(offset, width);
            }
            (Some(receiver), None) => {
                // program-scope def with an explicit receiver (e.g. a
                // namespace path): evaluate for effect only
                self.visit_discard(receiver)?;
            }
            (None, None) => {}
        }

        // positional args, then named args in the target's parameter order
        for (index, arg) in call.args.iter().enumerate() {
            let param_ty = target
                .params
                .get(index)
                .map(|param| param.ty)
                .ok_or_else(|| self.bug(node, "more arguments than parameters"))?;
            self.compile_arg(arg, param_ty)?;
        }
        for param in target.params.iter().skip(call.args.len()) {
            let arg = call
                .named_args
                .iter()
                .find(|(name, _)| name == &param.name)
                .map(|(_, arg)| arg)
                .ok_or_else(|| self.bug(node, format!("missing argument '{}'", param.name)))?;
            self.compile_arg(arg, param.ty)?;
        }
        if let Some(block_arg) = &call.block_arg {
            let param_ty = target
                .block_param
                .as_ref()
                .map(|param| param.ty)
                .ok_or_else(|| self.bug(node, "captured block without a block parameter"))?;
            self.compile_arg(block_arg, param_ty)?;
        }

        match &attachment {
            Some(_) => self.instructions.call_with_block(compiled.0),
            None => self.instructions.call(compiled.0),
        };

        let produced = match &inline_block {
            Some(block) => merged_result(&self.context.types, target.ty, block.break_type)
                .ok_or_else(|| self.bug(node, "no merged result type"))?,
            None => target.ty,
        };
        let result_size = self.aligned(produced);
        if receiver_struct_bytes > 0 {
            // drop the receiver's backing copy out from under the result
            self.instructions.pop_from_offset(receiver_struct_bytes, result_size);
        }
        if self.wants_value {
            self.upcast(produced, node.ty)?;
        } else {
            self.write_pop(result_size);
        }
        Ok(())
    }

    /// Emits a struct receiver as a pointer. Addressable receivers hand out
    /// their own address; everything else materializes the struct and takes
    /// the address of the fresh copy, which the caller pops after the call.
    /// Returns the byte size of that backing copy (0 when none was pushed).
    fn compile_struct_receiver(&mut self, receiver: &Node) -> CompileResult<u32> {
        match &receiver.kind {
            NodeKind::Var(name) if name == "self" => {
                let (offset, _) = self.resolve_local(receiver, "self")?;
                self.instructions.get_local(offset, 8);
                Ok(0)
            }
            NodeKind::Var(name) => {
                let (offset, slot_ty) = self.resolve_local(receiver, name)?;
                self.instructions.pointerof_var(offset);
                if self.context.types.is_mixed_union(slot_ty)
                    && self.context.types.is_struct(receiver.ty)
                {
                    self.instructions.put_i64(UNION_TAG_SIZE as i64);
                    self.instructions.pointer_add(1);
                }
                Ok(0)
            }
            NodeKind::InstanceVar(name) => {
                let self_ty = self
                    .self_type
                    .ok_or_else(|| self.bug(receiver, "instance var receiver outside a method"))?;
                let (offset, _) = self
                    .context
                    .types
                    .lookup_instance_var(self_ty, name)
                    .ok_or_else(|| self.bug(receiver, format!("undefined instance var {}", name)))?;
                self.instructions.pointerof_self_ivar(offset);
                Ok(0)
            }
            NodeKind::ClassVar(name) => {
                let name = name.clone();
                let (offset, slot_ty, initializer) = self.ensure_class_var(&name, receiver.ty)?;
                let size = self.aligned(slot_ty);
                self.emit_class_var_guard(offset, size, initializer);
                self.instructions.pointerof_class_var(offset);
                Ok(0)
            }
            NodeKind::Path(name) => {
                let slot = self
                    .context
                    .consts
                    .get(name)
                    .map(|slot| (slot.offset, slot.ty, slot.initializer))
                    .ok_or_else(|| {
                        self.error(receiver.location, CompileErrorKind::UndefinedConstant(name.clone()))
                    })?;
                let (offset, slot_ty, initializer) = slot;
                self.emit_const_guard(offset, self.aligned(slot_ty), initializer);
                self.instructions.get_const_pointer(offset);
                Ok(0)
            }
            _ if self.context.types.needs_struct_pointer(receiver.ty) => {
                self.visit_struct_pointer(receiver)?;
                Ok(self.aligned(receiver.ty))
            }
            _ => {
                self.visit_value(receiver)?;
                let size = self.aligned(receiver.ty);
                self.instructions.put_stack_top_pointer(size);
                Ok(size)
            }
        }
    }

    /// Lowers one call argument: autocasts literals into the parameter's
    /// numeric or enum kind, then widens to the declared parameter type.
    fn compile_arg(&mut self, arg: &Node, param_ty: TypeId) -> CompileResult {
        if let NodeKind::NumberLiteral(value) = &arg.kind {
            let from = self.context.types.num_kind(arg.ty);
            let to = self.context.types.num_kind(param_ty);
            if let (Some(from), Some(to)) = (from, to) {
                if from != to {
                    return self.write_number(arg, param_ty, *value);
                }
            }
        }
        if let NodeKind::SymbolLiteral(name) = &arg.kind {
            if let Some(value) = self.context.types.lookup_enum_member(param_ty, name) {
                let base = {
                    let ty = self.context.types.remove_indirection(param_ty);
                    match self.context.types.kind(ty) {
                        TypeKind::Enum { base, .. } => *base,
                        _ => unreachable!("enum member on non-enum"),
                    }
                };
                return self.write_number(arg, base, NumberValue::Int(value));
            }
        }
        self.visit_value(arg)?;
        self.upcast(arg.ty, param_ty)
    }

    /// Inlines an intrinsic def body at the call site, one emit rule per
    /// primitive.
    fn compile_primitive_call(
        &mut self,
        node: &Node,
        call: &Call,
        target: &Rc<Def>,
        name: &str,
    ) -> CompileResult {
        let receiver = call.receiver.as_ref();
        match name {
            "add" | "sub" | "mul" | "div" | "rem" | "and" | "or" | "xor" | "shl" | "shr"
            | "lt" | "le" | "gt" | "ge" | "eq" | "ne" => {
                let receiver = receiver.ok_or_else(|| self.bug(node, "binary primitive without receiver"))?;
                let operand_ty = receiver.ty;
                self.visit_value(receiver)?;
                let param_ty = target
                    .params
                    .first()
                    .map(|param| param.ty)
                    .ok_or_else(|| self.bug(node, "binary primitive without parameter"))?;
                self.compile_arg(&call.args[0], param_ty)?;
                self.write_binary(node, name, operand_ty)?;
                self.finish_primitive(node);
                Ok(())
            }
            "convert" | "unchecked_convert" => {
                let receiver = receiver.ok_or_else(|| self.bug(node, "convert without receiver"))?;
                self.visit_value(receiver)?;
                let from = self
                    .context
                    .types
                    .num_kind(receiver.ty)
                    .ok_or_else(|| self.bug(node, "convert on non-numeric receiver"))?;
                let to = self
                    .context
                    .types
                    .num_kind(node.ty)
                    .ok_or_else(|| self.bug(node, "convert to non-numeric type"))?;
                if from != to {
                    self.instructions.convert(from.code(), to.code());
                }
                self.finish_primitive(node);
                Ok(())
            }
            "allocate" => {
                if let Some(receiver) = receiver {
                    self.visit_discard(receiver)?;
                }
                let instance = self.context.types.remove_indirection(node.ty);
                if self.context.types.is_struct(instance) {
                    self.write_push_zeros(self.aligned(instance));
                } else {
                    let size = self.context.types.instance_size(instance);
                    self.instructions.allocate_class(size, instance.0);
                }
                self.finish_primitive(node);
                Ok(())
            }
            "pointer_malloc" => {
                if let Some(receiver) = receiver {
                    self.visit_discard(receiver)?;
                }
                self.compile_arg(&call.args[0], TypeTable::U64)?;
                let element = self.pointer_element(node, node.ty)?;
                let element_size = self.aligned(element);
                self.instructions.pointer_malloc(element_size);
                self.finish_primitive(node);
                Ok(())
            }
            "pointer_new" => {
                if let Some(receiver) = receiver {
                    self.visit_discard(receiver)?;
                }
                // the address value is the pointer representation
                self.compile_arg(&call.args[0], TypeTable::U64)?;
                self.finish_primitive(node);
                Ok(())
            }
            "pointer_address" => {
                let receiver = receiver.ok_or_else(|| self.bug(node, "pointer primitive without receiver"))?;
                self.visit_value(receiver)?;
                self.finish_primitive(node);
                Ok(())
            }
            "pointer_get" => {
                let receiver = receiver.ok_or_else(|| self.bug(node, "pointer primitive without receiver"))?;
                self.visit_value(receiver)?;
                let element = self.pointer_element(node, receiver.ty)?;
                let size = self.aligned(element);
                self.instructions.pointer_get(size);
                self.finish_primitive(node);
                Ok(())
            }
            "pointer_set" => {
                let receiver = receiver.ok_or_else(|| self.bug(node, "pointer primitive without receiver"))?;
                let element = self.pointer_element(node, receiver.ty)?;
                self.compile_arg(&call.args[0], element)?;
                if self.wants_value {
                    // the assigned value is also the expression's result
                    self.write_dup(self.aligned(element));
                }
                self.visit_value(receiver)?;
                let size = self.aligned(element);
                self.instructions.pointer_set(size);
                Ok(())
            }
            "pointer_add" => {
                let receiver = receiver.ok_or_else(|| self.bug(node, "pointer primitive without receiver"))?;
                self.visit_value(receiver)?;
                self.compile_arg(&call.args[0], TypeTable::I64)?;
                let element = self.pointer_element(node, receiver.ty)?;
                let element_size = self.aligned(element);
                self.instructions.pointer_add(element_size);
                self.finish_primitive(node);
                Ok(())
            }
            "tuple_get" => {
                let receiver = receiver.ok_or_else(|| self.bug(node, "tuple primitive without receiver"))?;
                self.visit_value(receiver)?;
                let NodeKind::NumberLiteral(NumberValue::Int(index)) = call.args[0].kind else {
                    return Err(self.bug(node, "tuple index must be a literal"));
                };
                let offset = self.context.types.tuple_offset(receiver.ty, index as usize);
                let tuple_size = self.aligned(receiver.ty);
                let size = self.aligned(node.ty);
                self.instructions.tuple_get(tuple_size, offset, size);
                self.finish_primitive(node);
                Ok(())
            }
            _ => Err(self.bug(node, format!("unimplemented primitive '{}'", name))),
        }
    }

    fn finish_primitive(&mut self, node: &Node) {
        if !self.wants_value {
            self.write_pop(self.aligned(node.ty));
        }
    }

    fn pointer_element(&self, node: &Node, ty: TypeId) -> CompileResult<TypeId> {
        let ty = self.context.types.remove_indirection(ty);
        match self.context.types.kind(ty) {
            TypeKind::Pointer { element } => Ok(*element),
            _ => Err(self.bug(node, "pointer primitive on non-pointer type")),
        }
    }

    /// A primitive def body reached through a compiled def (e.g. as a
    /// dispatch candidate): re-push the receiver and parameters from the
    /// frame, then apply the intrinsic.
    fn compile_primitive_body(&mut self, node: &Node, name: &str) -> CompileResult {
        let def = self.def.clone();
        let receiver_ty = match def.owner {
            Some(owner) => {
                if self.context.types.passed_by_value(owner) {
                    return Err(self.bug(node, "struct receiver on a primitive body"));
                }
                let (offset, _) = self.resolve_local(node, "self")?;
                let width = self.aligned(owner);
                self.instructions.get_local(offset, width);
                Some(owner)
            }
            None => None,
        };
        for param in &def.params {
            let (offset, slot_ty) = self.resolve_local(node, &param.name)?;
            let size = self.aligned(slot_ty);
            self.instructions.get_local(offset, size);
        }
        match name {
            "add" | "sub" | "mul" | "div" | "rem" | "and" | "or" | "xor" | "shl" | "shr"
            | "lt" | "le" | "gt" | "ge" | "eq" | "ne" => {
                let operand_ty =
                    receiver_ty.ok_or_else(|| self.bug(node, "binary primitive without receiver"))?;
                self.write_binary(node, name, operand_ty)
            }
            "convert" | "unchecked_convert" => {
                let from = receiver_ty
                    .and_then(|ty| self.context.types.num_kind(ty))
                    .ok_or_else(|| self.bug(node, "convert on non-numeric receiver"))?;
                let to = self
                    .context
                    .types
                    .num_kind(node.ty)
                    .ok_or_else(|| self.bug(node, "convert to non-numeric type"))?;
                if from != to {
                    self.instructions.convert(from.code(), to.code());
                }
                Ok(())
            }
            _ => Err(self.bug(node, format!("primitive '{}' requires call-site lowering", name))),
        }
    }

    // ------------------------------------------------------------------
    // blocks and yield

    /// Compiles a call-site block into a `CompiledBlock`. The block's args
    /// and vars are declared as a scope of the *current* frame; its body is
    /// emitted into its own buffer against that frame.
    fn compile_block(&mut self, block: &Rc<Block>, target: &Rc<Def>) -> CompileResult<BlockAttachment> {
        self.locals.push_block();
        let locals_start = self.locals.bytesize();
        let mut args_bytesize = 0u32;
        for param in &block.params {
            self.locals.declare(&param.name, param.ty, &self.context.types);
            args_bytesize += self.aligned(param.ty);
        }
        for (name, ty) in &block.vars {
            if !self.locals.declared_in_current_block(name) {
                self.locals.declare(name, *ty, &self.context.types);
            }
        }
        let locals_end = self.locals.bytesize();
        let block_level = self.locals.block_level();

        let break_merged_ty = merged_result(&self.context.types, target.ty, block.break_type)
            .ok_or_else(|| self.bug(&block.body, "no merged break type"))?;
        let home_merged_ty = match &self.compiling_block {
            Some(ctx) => ctx.home_merged_ty,
            None => self.merged_return_ty,
        };

        // the block body is emitted into its own buffer; whiles must not
        // leak across the boundary (break inside a block leaves the call)
        let saved_instructions = std::mem::take(&mut self.instructions);
        let saved_node_map = std::mem::take(&mut self.node_map);
        let saved_whiles = std::mem::take(&mut self.whiles);
        let saved_block = self.compiling_block.take();
        self.compiling_block = Some(BlockContext {
            block: block.clone(),
            home_merged_ty,
            break_merged_ty,
        });

        let result = self.compile_block_body(block);

        let instructions = std::mem::replace(&mut self.instructions, saved_instructions);
        let node_map = std::mem::replace(&mut self.node_map, saved_node_map);
        self.whiles = saved_whiles;
        self.compiling_block = saved_block;
        self.locals.pop_block();
        result?;

        let handle = self.context.add_block(CompiledBlock {
            block: block.clone(),
            instructions,
            node_map,
            args_bytesize,
            locals_start,
            locals_end,
            block_level,
        });
        Ok(BlockAttachment { handle, block: block.clone() })
    }

    fn compile_block_body(&mut self, block: &Rc<Block>) -> CompileResult {
        let size = self.aligned(block.ty);
        if size == 0 {
            self.visit_discard(&block.body)?;
            self.instructions.put_nil();
        } else {
            self.visit_value(&block.body)?;
            self.upcast(block.body.ty, block.ty)?;
        }
        self.instructions.leave(size);
        Ok(())
    }

    fn compile_yield(&mut self, node: &Node, args: &[Node]) -> CompileResult {
        let attachment = self
            .attached_block
            .clone()
            .ok_or_else(|| self.bug(node, "yield outside a def with a block"))?;
        let block = attachment.block.clone();

        let unpacks = args.len() == 1
            && block.params.len() >= 2
            && matches!(
                self.context.types.kind(self.context.types.remove_indirection(args[0].ty)),
                TypeKind::Tuple { .. }
            );
        if unpacks {
            self.visit_value(&args[0])?;
            self.compile_tuple_unpack(&args[0], &block)?;
        } else {
            let count = args.len().max(block.params.len());
            for index in 0..count {
                match (args.get(index), block.params.get(index)) {
                    (Some(arg), Some(param)) => self.compile_arg(arg, param.ty)?,
                    // extra yield values are evaluated and dropped
                    (Some(arg), None) => self.visit_discard(arg)?,
                    // missing block params default to nil
                    (None, Some(param)) => self.upcast(TypeTable::NIL, param.ty)?,
                    (None, None) => unreachable!(),
                }
            }
        }
        self.instructions.call_block(attachment.handle.0);

        let produced = block.ty;
        if self.wants_value {
            self.upcast(produced, node.ty)?;
        } else {
            self.write_pop(self.aligned(produced));
        }
        Ok(())
    }

    /// One tuple yielded across several block params: spread the elements
    /// into the block's argument layout.
    fn compile_tuple_unpack(&mut self, arg: &Node, block: &Rc<Block>) -> CompileResult {
        let tuple_ty = self.context.types.remove_indirection(arg.ty);
        let elements: Vec<TypeId> = match self.context.types.kind(tuple_ty) {
            TypeKind::Tuple { elements } => elements.clone(),
            _ => return Err(self.bug(arg, "tuple unpack on non-tuple")),
        };
        let mut unpack_elements = Vec::with_capacity(block.params.len());
        for (index, param) in block.params.iter().enumerate() {
            let element = *elements
                .get(index)
                .ok_or_else(|| self.bug(arg, "tuple too short for block parameters"))?;
            let union_tag = if self.context.types.is_mixed_union(param.ty)
                && !self.context.types.is_mixed_union(element)
            {
                Some(self.context.types.remove_indirection(element))
            } else {
                None
            };
            unpack_elements.push(UnpackElement {
                tuple_offset: self.context.types.tuple_offset(tuple_ty, index),
                size: self.aligned(element),
                target_size: self.aligned(param.ty),
                union_tag,
            });
        }
        let descriptor = self.context.add_tuple_unpack(TupleUnpack {
            tuple_size: self.aligned(tuple_ty),
            elements: unpack_elements,
        });
        self.instructions.unpack_tuple(descriptor);
        Ok(())
    }

    // ------------------------------------------------------------------
    // foreign calls

    fn compile_lib_call(&mut self, node: &Node, call: &Call) -> CompileResult {
        let target = call.target_defs[0].clone();
        let external = target
            .external
            .clone()
            .ok_or_else(|| self.bug(node, "lib call without external linkage"))?;

        let mut arg_types = Vec::with_capacity(call.args.len());
        let mut arg_bytesizes = Vec::with_capacity(call.args.len());
        for (index, arg) in call.args.iter().enumerate() {
            let param_ty = target.params.get(index).map(|param| param.ty);
            match &arg.kind {
                NodeKind::NilLiteral => {
                    // nil crosses the boundary as a null pointer
                    self.instructions.put_i64(0);
                    arg_types.push(FfiType::Pointer);
                    arg_bytesizes.push(8);
                }
                NodeKind::Out(inner) => {
                    let NodeKind::Var(name) = &inner.kind else {
                        return Err(self.bug(arg, "out requires a variable"));
                    };
                    let (offset, _) = self.resolve_local(inner, name)?;
                    self.instructions.pointerof_var(offset);
                    arg_types.push(FfiType::Pointer);
                    arg_bytesizes.push(8);
                }
                _ => {
                    // variadic tail args travel at their own static types
                    let ty = param_ty.unwrap_or(arg.ty);
                    self.compile_arg(arg, ty)?;
                    arg_types.push(self.context.types.ffi_type(ty));
                    arg_bytesizes.push(self.aligned(ty));
                }
            }
        }

        let ret_ty = target.ty;
        let function = LibFunction {
            lib: external.lib,
            symbol: external.symbol,
            arg_types,
            arg_bytesizes,
            ret_type: self.context.types.ffi_type(ret_ty),
            ret_bytesize: self.aligned(ret_ty),
            variadic: external.variadic,
        };
        let handle = self.context.lib_function(function);
        self.instructions.lib_call(handle.0);

        if self.wants_value {
            self.upcast(ret_ty, node.ty)?;
        } else {
            self.write_pop(self.aligned(ret_ty));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // pointerof and casts

    fn compile_pointerof(&mut self, node: &Node, exp: &Node) -> CompileResult {
        if !self.wants_value {
            return Ok(());
        }
        match &exp.kind {
            NodeKind::Var(name) => {
                let (offset, _) = self.resolve_local(exp, name)?;
                self.instructions.pointerof_var(offset);
                Ok(())
            }
            NodeKind::InstanceVar(name) => {
                let self_ty = self
                    .self_type
                    .ok_or_else(|| self.bug(node, "pointerof instance var outside a method"))?;
                let (offset, _) = self
                    .context
                    .types
                    .lookup_instance_var(self_ty, name)
                    .ok_or_else(|| self.bug(node, format!("undefined instance var {}", name)))?;
                self.instructions.pointerof_self_ivar(offset);
                Ok(())
            }
            NodeKind::ClassVar(name) => {
                let name = name.clone();
                let (offset, slot_ty, initializer) = self.ensure_class_var(&name, exp.ty)?;
                let size = self.aligned(slot_ty);
                self.emit_class_var_guard(offset, size, initializer);
                self.instructions.pointerof_class_var(offset);
                Ok(())
            }
            _ => Err(self.bug(node, "can't take the address of this expression")),
        }
    }

    fn compile_cast(&mut self, _node: &Node, receiver: &Node, target: TypeId) -> CompileResult {
        self.visit_value(receiver)?;
        let from = receiver.ty;
        let widening = {
            let types = &self.context.types;
            types.remove_indirection(from) == types.remove_indirection(target)
                || types.is_subtype(from, target)
        };
        if widening {
            self.upcast(from, target)?;
        } else if self.context.types.filter_by(from, target).is_some() {
            self.write_dup(self.aligned(from));
            self.write_is_a(from, target);
            self.instructions.branch_if(0);
            let ok = self.instructions.patch_location();
            let message = self.context.intern_string("cast failed");
            self.instructions.unreachable(message.0);
            self.instructions.patch_jump(ok);
            self.downcast(from, target)?;
        } else {
            // statically impossible cast; dead filler keeps stack widths
            // consistent for whatever follows the raise
            self.write_pop(self.aligned(from));
            let message = self.context.intern_string("cast failed");
            self.instructions.unreachable(message.0);
            self.write_push_zeros(self.aligned(target));
        }
        if !self.wants_value {
            self.write_pop(self.aligned(target));
        }
        Ok(())
    }

    fn compile_nilable_cast(&mut self, node: &Node, receiver: &Node, target: TypeId) -> CompileResult {
        self.visit_value(receiver)?;
        let from = receiver.ty;
        let to = node.ty;
        if self.context.types.is_subtype(from, target) {
            self.upcast(from, target)?;
            self.upcast(target, to)?;
        } else if self.context.types.filter_by(from, target).is_some() {
            self.write_dup(self.aligned(from));
            self.write_is_a(from, target);
            self.instructions.branch_unless(0);
            let fail = self.instructions.patch_location();
            self.downcast(from, target)?;
            self.upcast(target, to)?;
            self.instructions.jump(0);
            let end = self.instructions.patch_location();
            self.instructions.patch_jump(fail);
            self.write_pop(self.aligned(from));
            self.upcast(TypeTable::NIL, to)?;
            self.instructions.patch_jump(end);
        } else {
            // can't ever match: the fall-through yields nil
            self.write_pop(self.aligned(from));
            self.upcast(TypeTable::NIL, to)?;
        }
        if !self.wants_value {
            self.write_pop(self.aligned(to));
        }
        Ok(())
    }

    fn compile_read_instance_var(&mut self, node: &Node, receiver: &Node, name: &str) -> CompileResult {
        let (offset, ivar_ty) = self
            .context
            .types
            .lookup_instance_var(receiver.ty, name)
            .ok_or_else(|| self.bug(node, format!("undefined instance var {}", name)))?;
        let size = self.aligned(ivar_ty);
        if self.context.types.passed_by_value(receiver.ty) {
            self.visit_struct_pointer(receiver)?;
            self.instructions.get_ivar(offset, size);
            let region = self.aligned(receiver.ty);
            self.instructions.pop_from_offset(region, size);
        } else {
            self.visit_value(receiver)?;
            self.instructions.get_ivar(offset, size);
        }
        self.downcast(ivar_ty, node.ty)?;
        if !self.wants_value {
            self.write_pop(self.aligned(node.ty));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // emit helpers

    fn aligned(&self, ty: TypeId) -> u32 {
        self.context.types.aligned_size(ty)
    }

    fn write_pop(&mut self, size: u32) {
        if size > 0 {
            self.instructions.pop(size);
        }
    }

    fn write_dup(&mut self, size: u32) {
        if size > 0 {
            self.instructions.dup(size);
        }
    }

    fn write_push_zeros(&mut self, amount: u32) {
        if amount > 0 {
            self.instructions.push_zeros(amount);
        }
    }

    fn write_number(&mut self, node: &Node, ty: TypeId, value: NumberValue) -> CompileResult {
        let kind = self
            .context
            .types
            .num_kind(ty)
            .ok_or_else(|| self.bug(node, "number literal with non-numeric type"))?;
        match (kind, value) {
            (NumKind::I8 | NumKind::U8, NumberValue::Int(v)) => self.instructions.put_i8(v as i8),
            (NumKind::I16 | NumKind::U16, NumberValue::Int(v)) => self.instructions.put_i16(v as i16),
            (NumKind::I32 | NumKind::U32, NumberValue::Int(v)) => self.instructions.put_i32(v as i32),
            (NumKind::I64 | NumKind::U64, NumberValue::Int(v)) => self.instructions.put_i64(v),
            (NumKind::F32, NumberValue::Int(v)) => self.instructions.put_f32(v as f32),
            (NumKind::F32, NumberValue::Float(v)) => self.instructions.put_f32(v as f32),
            (NumKind::F64, NumberValue::Int(v)) => self.instructions.put_f64(v as f64),
            (NumKind::F64, NumberValue::Float(v)) => self.instructions.put_f64(v),
            (_, NumberValue::Float(_)) => {
                return Err(self.bug(node, "float literal with integer type"))
            }
        };
        Ok(())
    }

    /// Coerces the value on top of the stack to a 1-byte bool for a branch.
    fn write_value_to_bool(&mut self, ty: TypeId) {
        let types = &self.context.types;
        let ty = types.remove_indirection(ty);
        if ty == TypeTable::BOOL {
            return;
        }
        let size = types.aligned_size(ty);
        if types.is_nil(ty) || types.is_no_return(ty) {
            self.instructions.put_false();
        } else if types.is_pointer(ty) || types.nilable_pointer(ty) {
            self.instructions.pointer_is_not_null();
        } else if types.is_mixed_union(ty) {
            self.instructions.union_truthy(size);
        } else {
            // non-nilable references and plain values are always truthy
            self.instructions.pop(size);
            self.instructions.put_true();
        }
    }

    /// Emits a runtime type test against the value on top of the stack,
    /// leaving a bool. Statically-decidable tests collapse to a constant.
    fn write_is_a(&mut self, from: TypeId, target: TypeId) {
        let from = self.context.types.remove_indirection(from);
        let target = self.context.types.remove_indirection(target);
        let from_size = self.aligned(from);
        if self.context.types.is_mixed_union(from) {
            self.instructions.union_is_a(from_size, target.0);
            return;
        }
        if self.context.types.nilable_pointer(from) {
            if self.context.types.is_nil(target) {
                self.instructions.pointer_is_null();
                return;
            }
            let all_non_nil_match = match self.context.types.kind(from) {
                TypeKind::NilableReference { reference } => {
                    self.context.types.is_subtype(*reference, target)
                }
                TypeKind::NilableReferenceUnion { variants } => variants
                    .iter()
                    .all(|&variant| self.context.types.is_subtype(variant, target)),
                _ => false,
            };
            if all_non_nil_match {
                self.instructions.pointer_is_not_null();
            } else {
                // a null pointer matches nothing but nil
                self.instructions.reference_is_a(target.0);
            }
            return;
        }
        if self.context.types.reference_like(from) {
            if self.context.types.is_subtype(from, target) {
                self.instructions.pop(8);
                self.instructions.put_true();
            } else {
                self.instructions.reference_is_a(target.0);
            }
            return;
        }
        // plain value types are decided at compile time
        let verdict = self.context.types.is_subtype(from, target);
        self.write_pop(from_size);
        if verdict {
            self.instructions.put_true();
        } else {
            self.instructions.put_false();
        }
    }

    /// Picks the typed opcode for a binary primitive from the operand type.
    fn write_binary(&mut self, node: &Node, op: &str, operand_ty: TypeId) -> CompileResult {
        let kind = self
            .context
            .types
            .num_kind(operand_ty)
            .ok_or_else(|| self.bug(node, "binary primitive on non-numeric type"))?;
        let buf = &mut self.instructions;
        let handled = match kind {
            NumKind::I32 | NumKind::U32 => {
                let signed = kind == NumKind::I32;
                match op {
                    "add" => { buf.add_i32(); true }
                    "sub" => { buf.sub_i32(); true }
                    "mul" => { buf.mul_i32(); true }
                    "div" => { if signed { buf.div_i32(); } else { buf.div_u32(); } true }
                    "rem" => { if signed { buf.rem_i32(); } else { buf.rem_u32(); } true }
                    "and" => { buf.and_i32(); true }
                    "or" => { buf.or_i32(); true }
                    "xor" => { buf.xor_i32(); true }
                    "shl" => { buf.shl_i32(); true }
                    "shr" => { buf.shr_i32(); true }
                    "lt" => { if signed { buf.lt_i32(); } else { buf.lt_u32(); } true }
                    "le" => { if signed { buf.le_i32(); } else { buf.le_u32(); } true }
                    "gt" => { if signed { buf.gt_i32(); } else { buf.gt_u32(); } true }
                    "ge" => { if signed { buf.ge_i32(); } else { buf.ge_u32(); } true }
                    "eq" => { buf.eq_i32(); true }
                    "ne" => { buf.ne_i32(); true }
                    _ => false,
                }
            }
            NumKind::I64 | NumKind::U64 => {
                let signed = kind == NumKind::I64;
                match op {
                    "add" => { buf.add_i64(); true }
                    "sub" => { buf.sub_i64(); true }
                    "mul" => { buf.mul_i64(); true }
                    "div" => { if signed { buf.div_i64(); } else { buf.div_u64(); } true }
                    "rem" => { if signed { buf.rem_i64(); } else { buf.rem_u64(); } true }
                    "and" => { buf.and_i64(); true }
                    "or" => { buf.or_i64(); true }
                    "xor" => { buf.xor_i64(); true }
                    "shl" => { buf.shl_i64(); true }
                    "shr" => { buf.shr_i64(); true }
                    "lt" => { if signed { buf.lt_i64(); } else { buf.lt_u64(); } true }
                    "le" => { if signed { buf.le_i64(); } else { buf.le_u64(); } true }
                    "gt" => { if signed { buf.gt_i64(); } else { buf.gt_u64(); } true }
                    "ge" => { if signed { buf.ge_i64(); } else { buf.ge_u64(); } true }
                    "eq" => { buf.eq_i64(); true }
                    "ne" => { buf.ne_i64(); true }
                    _ => false,
                }
            }
            NumKind::F64 => match op {
                "add" => { buf.add_f64(); true }
                "sub" => { buf.sub_f64(); true }
                "mul" => { buf.mul_f64(); true }
                "div" => { buf.div_f64(); true }
                "lt" => { buf.lt_f64(); true }
                "le" => { buf.le_f64(); true }
                "gt" => { buf.gt_f64(); true }
                "ge" => { buf.ge_f64(); true }
                "eq" => { buf.eq_f64(); true }
                "ne" => { buf.ne_f64(); true }
                _ => false,
            },
            // sub-word and f32 arithmetic go through convert upstream
            _ => false,
        };
        if handled {
            Ok(())
        } else {
            Err(self.bug(node, format!("unsupported '{}' on {}", op, self.context.types.name(operand_ty))))
        }
    }

    // ------------------------------------------------------------------
    // errors

    fn error(&self, location: Location, kind: CompileErrorKind) -> CompileError {
        CompileError::new(location, kind)
    }

    fn bug(&self, node: &Node, message: impl Into<String>) -> CompileError {
        CompileError::new(node.location, CompileErrorKind::Bug(message.into()))
    }
}
