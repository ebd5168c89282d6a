//! Value-width adapter: upcasts and downcasts at type-boundary crossings.
//!
//! Every adaptation preserves one contract: what leaves the stack for the
//! target type is exactly its aligned size. Mixed unions carry an 8-byte
//! type-id tag at the bottom of their slot; reference unions, nilables and
//! virtual types are bare pointers whose pointee header carries the id, so
//! converting between them is width-neutral.

use crate::types::{TypeId, TypeKind, UNION_TAG_SIZE};
use super::Compiler;
use super::error::{CompileError, CompileErrorKind, CompileResult};

enum Widen {
    /// Representations already agree.
    Keep,
    /// Mixed union to a wider mixed union: the payload grows in place.
    GrowUnion(u32),
    /// Value or reference boxed into a mixed union.
    TagUnion { tag: u32, from_size: u32, union_size: u32 },
    /// Nil becoming a nilable pointer.
    NullPointer,
    Invalid,
}

enum Narrow {
    Keep,
    /// Mixed union to a narrower mixed union: payload shrinks in place.
    ShrinkUnion(u32),
    /// Mixed union unboxed to a plain value or reference.
    Untag { union_size: u32, value_size: u32 },
    /// Pointer representation narrowed to nil.
    DropPointer,
    Invalid,
}

impl<'ctx> Compiler<'ctx> {
    /// Widens the value on top of the stack from `from` to `to`.
    pub(crate) fn upcast(&mut self, from: TypeId, to: TypeId) -> CompileResult {
        let action = {
            let types = &self.context.types;
            let from = types.remove_indirection(from);
            let to = types.remove_indirection(to);
            if from == to || types.is_no_return(from) || types.is_no_return(to) {
                Widen::Keep
            } else {
                let from_size = types.aligned_size(from);
                let to_size = types.aligned_size(to);
                match types.kind(to) {
                    TypeKind::MixedUnion { .. } => {
                        if types.is_mixed_union(from) {
                            Widen::GrowUnion(to_size - from_size)
                        } else if types.nilable_pointer(from)
                            || matches!(types.kind(from), TypeKind::ReferenceUnion { .. } | TypeKind::Virtual { .. })
                        {
                            // the source tag only exists in the pointee
                            // header; boxing it needs a runtime-read tag
                            Widen::Invalid
                        } else {
                            Widen::TagUnion { tag: from.0, from_size, union_size: to_size }
                        }
                    }
                    TypeKind::NilableReference { .. } | TypeKind::NilableReferenceUnion { .. } => {
                        if types.is_nil(from) {
                            Widen::NullPointer
                        } else if types.reference_like(from) {
                            Widen::Keep
                        } else {
                            Widen::Invalid
                        }
                    }
                    TypeKind::ReferenceUnion { .. }
                    | TypeKind::Virtual { .. }
                    | TypeKind::Module { .. }
                    | TypeKind::Class { value_struct: false, .. } => {
                        if types.reference_like(from) {
                            Widen::Keep
                        } else {
                            Widen::Invalid
                        }
                    }
                    TypeKind::VirtualMetaclass { .. } => {
                        if matches!(types.kind(from), TypeKind::Metaclass { .. }) {
                            Widen::Keep
                        } else {
                            Widen::Invalid
                        }
                    }
                    _ => Widen::Invalid,
                }
            }
        };
        match action {
            Widen::Keep => Ok(()),
            Widen::GrowUnion(amount) => {
                self.write_push_zeros(amount);
                Ok(())
            }
            Widen::TagUnion { tag, from_size, union_size } => {
                self.instructions.put_in_union(tag, from_size, union_size);
                Ok(())
            }
            Widen::NullPointer => {
                self.instructions.put_i64(0);
                Ok(())
            }
            Widen::Invalid => Err(self.widen_bug("upcast", from, to)),
        }
    }

    /// Narrows the value on top of the stack from `from` to `to`.
    /// `upcast` then `downcast` is the identity whenever the dynamic value
    /// is representable in the narrower type.
    pub(crate) fn downcast(&mut self, from: TypeId, to: TypeId) -> CompileResult {
        let action = {
            let types = &self.context.types;
            let from = types.remove_indirection(from);
            let to = types.remove_indirection(to);
            if from == to || types.is_no_return(from) || types.is_no_return(to) {
                Narrow::Keep
            } else {
                let from_size = types.aligned_size(from);
                let to_size = types.aligned_size(to);
                match types.kind(from) {
                    TypeKind::MixedUnion { .. } => {
                        if types.is_mixed_union(to) {
                            Narrow::ShrinkUnion(from_size - to_size)
                        } else {
                            Narrow::Untag { union_size: from_size, value_size: to_size }
                        }
                    }
                    TypeKind::NilableReference { .. }
                    | TypeKind::NilableReferenceUnion { .. }
                    | TypeKind::ReferenceUnion { .. }
                    | TypeKind::Virtual { .. }
                    | TypeKind::Module { .. }
                    | TypeKind::Class { value_struct: false, .. }
                    | TypeKind::String => {
                        if types.is_nil(to) {
                            Narrow::DropPointer
                        } else if types.reference_like(to) {
                            Narrow::Keep
                        } else {
                            Narrow::Invalid
                        }
                    }
                    TypeKind::VirtualMetaclass { .. } => {
                        if matches!(types.kind(to), TypeKind::Metaclass { .. }) {
                            Narrow::Keep
                        } else {
                            Narrow::Invalid
                        }
                    }
                    _ => Narrow::Invalid,
                }
            }
        };
        match action {
            Narrow::Keep => Ok(()),
            Narrow::ShrinkUnion(amount) => {
                self.write_pop(amount);
                Ok(())
            }
            Narrow::Untag { union_size, value_size } => {
                self.instructions.remove_from_union(union_size, value_size);
                Ok(())
            }
            Narrow::DropPointer => {
                self.write_pop(8);
                Ok(())
            }
            Narrow::Invalid => Err(self.widen_bug("downcast", from, to)),
        }
    }

    fn widen_bug(&self, direction: &str, from: TypeId, to: TypeId) -> CompileError {
        CompileError::new(
            self.location,
            CompileErrorKind::Bug(format!(
                "cannot {} {} to {}",
                direction,
                self.context.types.name(from),
                self.context.types.name(to),
            )),
        )
    }
}

// keeps the tag constant aligned with the layout the adapter assumes
const _: () = assert!(UNION_TAG_SIZE == 8);
