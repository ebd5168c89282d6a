//! Multidispatch trampoline builder.
//!
//! A call with several candidate targets compiles to one synthesized
//! dispatch def: its body tests the runtime type of the receiver and the
//! dispatching arguments against each candidate in source order
//! (most-specific first, as the frontend guarantees) and invokes the first
//! match; the final candidate runs unconditionally. The trampoline is
//! cached per candidate list and call-site argument types, so every later
//! call site with the same shape reuses it.

use crate::prelude::*;
use crate::ast::{Call, Def, Node, NodeKind};
use crate::types::{TypeId, TypeKind, TypeTable};
use super::{lower_def, Compiler};
use super::error::{CompileErrorKind, CompileResult};
use super::frame::LocalFrame;
use crate::bytecode::{Buffer, DefHandle, NodeMap};

/// One argument slot of a dispatch frame.
struct DispatchSlot {
    /// Parameter name for named arguments; `None` for positional slots.
    name: Option<String>,
    ty: TypeId,
    offset: u32,
    width: u32,
}

impl<'ctx> Compiler<'ctx> {
    pub(super) fn compile_dispatch_call(&mut self, node: &Node, call: &Call) -> CompileResult {
        if call.block.is_some() || call.block_arg.is_some() {
            return Err(self.error(
                node.location,
                CompileErrorKind::Unsupported("multidispatch with a block".into()),
            ));
        }

        let key_defs: Vec<usize> = call
            .target_defs
            .iter()
            .map(|def| Rc::as_ptr(def) as usize)
            .collect();
        let mut key_types: Vec<TypeId> = Vec::new();
        if let Some(receiver) = &call.receiver {
            key_types.push(receiver.ty);
        }
        key_types.extend(call.args.iter().map(|arg| arg.ty));
        key_types.extend(call.named_args.iter().map(|(_, arg)| arg.ty));
        let key = (key_defs, key_types);

        let handle = match self.context.cached_dispatch(&key) {
            Some(handle) => handle,
            None => {
                let handle = self.build_dispatch_def(node, call)?;
                self.context.cache_dispatch(key, handle);
                handle
            }
        };

        // arguments travel at their call-site static types; the trampoline
        // narrows them per candidate
        let mut receiver_struct_bytes = 0u32;
        if let Some(receiver) = &call.receiver {
            if self.context.types.passed_by_value(receiver.ty) {
                receiver_struct_bytes = self.compile_struct_receiver(receiver)?;
            } else {
                self.visit_value(receiver)?;
            }
        }
        for arg in &call.args {
            self.visit_value(arg)?;
        }
        for (_, arg) in &call.named_args {
            self.visit_value(arg)?;
        }
        self.instructions.call(handle.0);

        let result_size = self.aligned(node.ty);
        if receiver_struct_bytes > 0 {
            self.instructions.pop_from_offset(receiver_struct_bytes, result_size);
        }
        if !self.wants_value {
            self.write_pop(result_size);
        }
        Ok(())
    }

    fn build_dispatch_def(&mut self, node: &Node, call: &Call) -> CompileResult<DefHandle> {
        let mut locals = LocalFrame::new();
        let mut args_bytesize = 0u32;

        let receiver_slot = call.receiver.as_ref().map(|receiver| {
            let width = if self.context.types.passed_by_value(receiver.ty) {
                8
            } else {
                self.aligned(receiver.ty)
            };
            let offset = locals.declare_raw("self", receiver.ty, width);
            args_bytesize += width;
            DispatchSlot { name: None, ty: receiver.ty, offset, width }
        });
        let mut param_slots = Vec::with_capacity(call.args.len() + call.named_args.len());
        for (index, arg) in call.args.iter().enumerate() {
            let width = self.aligned(arg.ty);
            let offset = locals.declare_raw(format!("%arg{}", index), arg.ty, width);
            args_bytesize += width;
            param_slots.push(DispatchSlot { name: None, ty: arg.ty, offset, width });
        }
        for (name, arg) in &call.named_args {
            let width = self.aligned(arg.ty);
            let offset = locals.declare_raw(name.clone(), arg.ty, width);
            args_bytesize += width;
            param_slots.push(DispatchSlot { name: Some(name.clone()), ty: arg.ty, offset, width });
        }

        let shell = Rc::new(Def {
            name: format!("{}:dispatch", call.name),
            owner: None,
            params: Vec::new(),
            vars: Vec::new(),
            body: Node::new(NodeKind::Unreachable, TypeTable::NO_RETURN, node.location),
            ty: node.ty,
            accepts_block: false,
            block_param: None,
            closure: false,
            external: None,
        });
        let handle = self.context.reserve_def(shell.clone());

        let (instructions, node_map, locals, result) = {
            let mut compiler = Compiler {
                context: &mut *self.context,
                instructions: Buffer::new(),
                node_map: NodeMap::new(),
                locals,
                def: shell,
                merged_return_ty: node.ty,
                self_type: None,
                wants_value: true,
                wants_struct_pointer: false,
                whiles: Vec::new(),
                compiling_block: None,
                attached_block: None,
                location: node.location,
            };
            let result =
                compiler.emit_dispatch_cascade(node, call, receiver_slot.as_ref(), &param_slots);
            (compiler.instructions, compiler.node_map, compiler.locals, result)
        };
        result?;
        self.context.finish_def(handle, instructions, node_map, locals, args_bytesize);
        Ok(handle)
    }

    fn emit_dispatch_cascade(
        &mut self,
        node: &Node,
        call: &Call,
        receiver_slot: Option<&DispatchSlot>,
        param_slots: &[DispatchSlot],
    ) -> CompileResult {
        let result_ty = node.ty;
        let result_size = self.aligned(result_ty);
        let positional = call.args.len();
        let count = call.target_defs.len();

        'candidates: for (index, candidate) in call.target_defs.iter().cloned().enumerate() {
            let last = index + 1 == count;
            let mut fail_patches = Vec::new();

            if !last {
                if let (Some(slot), Some(owner)) = (receiver_slot, candidate.owner) {
                    match self.statically_matches(slot.ty, owner) {
                        Some(true) => {}
                        // most-specific-first ordering can leave shadowed
                        // candidates that never apply at this site
                        Some(false) => continue 'candidates,
                        None => {
                            self.instructions.get_local(slot.offset, slot.width);
                            self.write_is_a(slot.ty, owner);
                            self.instructions.branch_unless(0);
                            fail_patches.push(self.instructions.patch_location());
                        }
                    }
                }
                for (pi, param) in candidate.params.iter().enumerate() {
                    let slot = self.dispatch_slot(node, param_slots, positional, pi, &param.name)?;
                    match self.statically_matches(slot.ty, param.ty) {
                        Some(true) => {}
                        Some(false) => {
                            for patch in fail_patches.drain(..) {
                                self.instructions.patch_jump(patch);
                            }
                            continue 'candidates;
                        }
                        None => {
                            let (offset, width, slot_ty) = (slot.offset, slot.width, slot.ty);
                            self.instructions.get_local(offset, width);
                            self.write_is_a(slot_ty, param.ty);
                            self.instructions.branch_unless(0);
                            fail_patches.push(self.instructions.patch_location());
                        }
                    }
                }
            }

            // invoke the candidate with each argument narrowed to its
            // declared parameter type
            let compiled = lower_def(self.context, candidate.clone(), None)?;
            if let Some(owner) = candidate.owner {
                let slot = receiver_slot
                    .ok_or_else(|| self.bug(node, "candidate expects a receiver"))?;
                if self.context.types.passed_by_value(owner) {
                    self.instructions.get_local(slot.offset, 8);
                } else {
                    self.instructions.get_local(slot.offset, slot.width);
                    self.downcast(slot.ty, owner)?;
                }
            }
            for (pi, param) in candidate.params.iter().enumerate() {
                let slot = self.dispatch_slot(node, param_slots, positional, pi, &param.name)?;
                let (offset, width, slot_ty) = (slot.offset, slot.width, slot.ty);
                self.instructions.get_local(offset, width);
                self.downcast(slot_ty, param.ty)?;
            }
            self.instructions.call(compiled.0);
            self.upcast(candidate.ty, result_ty)?;
            self.instructions.leave(result_size);

            for patch in fail_patches {
                self.instructions.patch_jump(patch);
            }
        }
        Ok(())
    }

    fn dispatch_slot<'s>(
        &self,
        node: &Node,
        param_slots: &'s [DispatchSlot],
        positional: usize,
        index: usize,
        name: &str,
    ) -> CompileResult<&'s DispatchSlot> {
        if index < positional {
            return Ok(&param_slots[index]);
        }
        param_slots[positional..]
            .iter()
            .find(|slot| slot.name.as_deref() == Some(name))
            .ok_or_else(|| self.bug(node, format!("missing dispatch argument '{}'", name)))
    }

    /// `Some` when the test is decidable at compile time.
    fn statically_matches(&self, static_ty: TypeId, target: TypeId) -> Option<bool> {
        let types = &self.context.types;
        let static_ty = types.remove_indirection(static_ty);
        if types.is_subtype(static_ty, target) {
            return Some(true);
        }
        match types.kind(static_ty) {
            TypeKind::MixedUnion { .. }
            | TypeKind::ReferenceUnion { .. }
            | TypeKind::NilableReference { .. }
            | TypeKind::NilableReferenceUnion { .. }
            | TypeKind::Virtual { .. } => None,
            _ => Some(false),
        }
    }
}
