//! Type table and layout queries.
//!
//! The inference frontend owns typing; the compiler only asks layout and
//! classification questions. `TypeId` doubles as the runtime type id embedded
//! in instructions and object headers.

use crate::prelude::*;

/// Index into the [`TypeTable`], also used as the runtime type id.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub struct TypeId(pub u32);

impl Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// Integer kinds, sized 1/2/4/8 bytes.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum IntKind {
    I8, I16, I32, I64,
    U8, U16, U32, U64,
}

impl IntKind {
    pub fn size(self) -> u32 {
        match self {
            Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 => 4,
            Self::I64 | Self::U64 => 8,
        }
    }
    pub fn signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }
}

/// Float kinds.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FloatKind {
    F32, F64,
}

impl FloatKind {
    pub fn size(self) -> u32 {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Numeric kind code carried by the `convert` instruction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum NumKind {
    I8 = 0, I16 = 1, I32 = 2, I64 = 3,
    U8 = 4, U16 = 5, U32 = 6, U64 = 7,
    F32 = 8, F64 = 9,
}

impl NumKind {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl From<IntKind> for NumKind {
    fn from(kind: IntKind) -> Self {
        match kind {
            IntKind::I8 => Self::I8, IntKind::I16 => Self::I16,
            IntKind::I32 => Self::I32, IntKind::I64 => Self::I64,
            IntKind::U8 => Self::U8, IntKind::U16 => Self::U16,
            IntKind::U32 => Self::U32, IntKind::U64 => Self::U64,
        }
    }
}

impl From<FloatKind> for NumKind {
    fn from(kind: FloatKind) -> Self {
        match kind {
            FloatKind::F32 => Self::F32,
            FloatKind::F64 => Self::F64,
        }
    }
}

/// Argument/return classification for foreign calls.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FfiType {
    Void,
    SInt8, SInt16, SInt32, SInt64,
    UInt8, UInt16, UInt32, UInt64,
    Float, Double,
    Pointer,
}

/// An instance variable of a class or struct.
#[derive(Clone, Debug)]
pub struct InstanceVar {
    pub name: String,
    pub ty: TypeId,
}

/// The discriminants the compiler distinguishes between.
#[derive(Clone, Debug)]
pub enum TypeKind {
    Nil,
    Bool,
    Char,
    Symbol,
    Int(IntKind),
    Float(FloatKind),
    String,
    NoReturn,
    Pointer { element: TypeId },
    Proc { params: Vec<TypeId>, ret: TypeId },
    Tuple { elements: Vec<TypeId> },
    NamedTuple { entries: Vec<(String, TypeId)> },
    Enum { base: TypeId, members: Vec<(String, i64)> },
    StaticArray { element: TypeId, len: u32 },
    /// Class or struct instance type. Generic instances carry their type
    /// arguments; layout questions never depend on them directly.
    Class {
        value_struct: bool,
        ivars: Vec<InstanceVar>,
        superclass: Option<TypeId>,
        type_vars: Vec<TypeId>,
    },
    Module { struct_includers: bool },
    Metaclass { instance: TypeId },
    VirtualMetaclass { base: TypeId },
    Virtual { base: TypeId, concrete: Vec<TypeId> },
    ReferenceUnion { variants: Vec<TypeId> },
    MixedUnion { variants: Vec<TypeId> },
    NilableReference { reference: TypeId },
    NilableReferenceUnion { variants: Vec<TypeId> },
    TypeDef { underlying: TypeId },
    Alias { underlying: TypeId },
    Lib,
}

/// A named entry in the type table.
#[derive(Clone, Debug)]
pub struct TypeDecl {
    pub name: String,
    pub kind: TypeKind,
}

/// Append-only arena of type declarations with the layout/classification
/// queries the lowering pass depends on. Object headers of reference types
/// store the `TypeId` of the concrete type in their first 8 bytes.
pub struct TypeTable {
    types: Vec<TypeDecl>,
}

/// Byte size of the type-id header at the start of every heap object.
pub const HEADER_SIZE: u32 = 8;

/// Byte size of the type-id tag at the start of a mixed union.
pub const UNION_TAG_SIZE: u32 = 8;

impl TypeTable {
    pub const NIL: TypeId = TypeId(0);
    pub const BOOL: TypeId = TypeId(1);
    pub const CHAR: TypeId = TypeId(2);
    pub const SYMBOL: TypeId = TypeId(3);
    pub const I8: TypeId = TypeId(4);
    pub const I16: TypeId = TypeId(5);
    pub const I32: TypeId = TypeId(6);
    pub const I64: TypeId = TypeId(7);
    pub const U8: TypeId = TypeId(8);
    pub const U16: TypeId = TypeId(9);
    pub const U32: TypeId = TypeId(10);
    pub const U64: TypeId = TypeId(11);
    pub const F32: TypeId = TypeId(12);
    pub const F64: TypeId = TypeId(13);
    pub const STRING: TypeId = TypeId(14);
    pub const NO_RETURN: TypeId = TypeId(15);

    /// Creates a table pre-seeded with the primitive types at their
    /// well-known ids.
    pub fn new() -> Self {
        let mut table = TypeTable { types: Vec::new() };
        table.add("Nil", TypeKind::Nil);
        table.add("Bool", TypeKind::Bool);
        table.add("Char", TypeKind::Char);
        table.add("Symbol", TypeKind::Symbol);
        table.add("Int8", TypeKind::Int(IntKind::I8));
        table.add("Int16", TypeKind::Int(IntKind::I16));
        table.add("Int32", TypeKind::Int(IntKind::I32));
        table.add("Int64", TypeKind::Int(IntKind::I64));
        table.add("UInt8", TypeKind::Int(IntKind::U8));
        table.add("UInt16", TypeKind::Int(IntKind::U16));
        table.add("UInt32", TypeKind::Int(IntKind::U32));
        table.add("UInt64", TypeKind::Int(IntKind::U64));
        table.add("Float32", TypeKind::Float(FloatKind::F32));
        table.add("Float64", TypeKind::Float(FloatKind::F64));
        table.add("String", TypeKind::String);
        table.add("NoReturn", TypeKind::NoReturn);
        table
    }

    /// Registers a type and returns its id.
    pub fn add(&mut self, name: impl Into<String>, kind: TypeKind) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDecl { name: name.into(), kind });
        id
    }

    pub fn name(&self, ty: TypeId) -> &str {
        &self.types[ty.0 as usize].name
    }

    pub fn kind(&self, ty: TypeId) -> &TypeKind {
        &self.types[ty.0 as usize].kind
    }

    /// Strips typedefs and aliases down to the underlying type.
    pub fn remove_indirection(&self, ty: TypeId) -> TypeId {
        match self.kind(ty) {
            TypeKind::TypeDef { underlying } | TypeKind::Alias { underlying } => {
                self.remove_indirection(*underlying)
            }
            _ => ty,
        }
    }

    /// Alignment a value of this type requires on the stack or in a field.
    pub fn align_of(&self, ty: TypeId) -> u32 {
        let ty = self.remove_indirection(ty);
        match self.kind(ty) {
            TypeKind::Nil | TypeKind::NoReturn | TypeKind::Lib => 1,
            TypeKind::Tuple { elements } => {
                elements.iter().map(|&e| self.align_of(e)).max().unwrap_or(1)
            }
            TypeKind::NamedTuple { entries } => {
                entries.iter().map(|&(_, e)| self.align_of(e)).max().unwrap_or(1)
            }
            TypeKind::Class { value_struct: true, .. } => {
                self.all_ivars(ty).iter().map(|iv| self.align_of(iv.ty)).max().unwrap_or(1)
            }
            TypeKind::StaticArray { element, .. } => self.align_of(*element),
            TypeKind::Enum { base, .. } => self.align_of(*base),
            TypeKind::MixedUnion { .. } => 8,
            _ => self.aligned_size(ty).clamp(1, 8),
        }
    }

    /// Bytes the value occupies on the stack, trailing padding included.
    pub fn aligned_size(&self, ty: TypeId) -> u32 {
        let ty = self.remove_indirection(ty);
        match self.kind(ty) {
            TypeKind::Nil | TypeKind::NoReturn | TypeKind::Lib => 0,
            TypeKind::Bool => 1,
            TypeKind::Char | TypeKind::Symbol => 4,
            TypeKind::Int(kind) => kind.size(),
            TypeKind::Float(kind) => kind.size(),
            TypeKind::Metaclass { .. } | TypeKind::VirtualMetaclass { .. } => 4,
            TypeKind::String
            | TypeKind::Pointer { .. }
            | TypeKind::Module { .. }
            | TypeKind::Virtual { .. }
            | TypeKind::ReferenceUnion { .. }
            | TypeKind::NilableReference { .. }
            | TypeKind::NilableReferenceUnion { .. } => 8,
            TypeKind::Class { value_struct: false, .. } => 8,
            TypeKind::Proc { .. } => 16,
            TypeKind::Enum { base, .. } => self.aligned_size(*base),
            TypeKind::StaticArray { element, len } => self.aligned_size(*element) * len,
            TypeKind::Tuple { elements } => {
                let align = self.align_of(ty);
                let end = elements.iter().fold(0, |offset, &e| {
                    round_up(offset, self.align_of(e)) + self.aligned_size(e)
                });
                round_up(end, align)
            }
            TypeKind::NamedTuple { entries } => {
                let align = self.align_of(ty);
                let end = entries.iter().fold(0, |offset, &(_, e)| {
                    round_up(offset, self.align_of(e)) + self.aligned_size(e)
                });
                round_up(end, align)
            }
            TypeKind::Class { value_struct: true, .. } => {
                let align = self.align_of(ty);
                let end = self
                    .all_ivars(ty)
                    .iter()
                    .fold(0, |offset, iv| {
                        round_up(offset, self.align_of(iv.ty)) + self.aligned_size(iv.ty)
                    });
                round_up(end, align).max(1)
            }
            TypeKind::MixedUnion { variants } => {
                let payload = variants.iter().map(|&v| self.aligned_size(v)).max().unwrap_or(0);
                UNION_TAG_SIZE + round_up(payload, 8)
            }
            TypeKind::TypeDef { .. } | TypeKind::Alias { .. } => unreachable!(),
        }
    }

    /// Payload size: the aligned size minus the union tag, if any.
    pub fn inner_size(&self, ty: TypeId) -> u32 {
        let ty = self.remove_indirection(ty);
        match self.kind(ty) {
            TypeKind::MixedUnion { .. } => self.aligned_size(ty) - UNION_TAG_SIZE,
            _ => self.aligned_size(ty),
        }
    }

    /// Heap footprint of a reference class instance, type-id header included.
    pub fn instance_size(&self, ty: TypeId) -> u32 {
        let ty = self.remove_indirection(ty);
        let base = if self.is_struct(ty) { 0 } else { HEADER_SIZE };
        let end = self.all_ivars(ty).iter().fold(base, |offset, iv| {
            round_up(offset, self.align_of(iv.ty)) + self.aligned_size(iv.ty)
        });
        round_up(end, 8).max(HEADER_SIZE)
    }

    pub fn is_nil(&self, ty: TypeId) -> bool {
        matches!(self.kind(self.remove_indirection(ty)), TypeKind::Nil)
    }

    pub fn is_no_return(&self, ty: TypeId) -> bool {
        matches!(self.kind(self.remove_indirection(ty)), TypeKind::NoReturn)
    }

    pub fn is_pointer(&self, ty: TypeId) -> bool {
        matches!(self.kind(self.remove_indirection(ty)), TypeKind::Pointer { .. })
    }

    pub fn is_struct(&self, ty: TypeId) -> bool {
        matches!(self.kind(self.remove_indirection(ty)), TypeKind::Class { value_struct: true, .. })
    }

    pub fn is_mixed_union(&self, ty: TypeId) -> bool {
        matches!(self.kind(self.remove_indirection(ty)), TypeKind::MixedUnion { .. })
    }

    /// Structs, tuples, named tuples and static arrays are copied by value
    /// into call frames; everything else travels as a scalar or pointer.
    pub fn passed_by_value(&self, ty: TypeId) -> bool {
        matches!(
            self.kind(self.remove_indirection(ty)),
            TypeKind::Class { value_struct: true, .. }
                | TypeKind::Tuple { .. }
                | TypeKind::NamedTuple { .. }
                | TypeKind::StaticArray { .. }
        )
    }

    /// Whether the representation is a single heap pointer.
    pub fn reference_like(&self, ty: TypeId) -> bool {
        matches!(
            self.kind(self.remove_indirection(ty)),
            TypeKind::String
                | TypeKind::Class { value_struct: false, .. }
                | TypeKind::Module { .. }
                | TypeKind::Virtual { .. }
                | TypeKind::ReferenceUnion { .. }
                | TypeKind::NilableReference { .. }
                | TypeKind::NilableReferenceUnion { .. }
        )
    }

    /// Nilable representations discriminated by pointer null-ness.
    pub fn nilable_pointer(&self, ty: TypeId) -> bool {
        matches!(
            self.kind(self.remove_indirection(ty)),
            TypeKind::NilableReference { .. } | TypeKind::NilableReferenceUnion { .. }
        )
    }

    /// Mutable aggregates that must reach their methods through a pointer:
    /// structs, static arrays, struct-backed virtuals and modules, and
    /// typedefs/aliases of any of those.
    pub fn needs_struct_pointer(&self, ty: TypeId) -> bool {
        match self.kind(ty) {
            TypeKind::StaticArray { .. } => true,
            TypeKind::Class { value_struct, .. } => *value_struct,
            TypeKind::Virtual { base, .. } => self.is_struct(*base),
            TypeKind::Module { struct_includers } => *struct_includers,
            TypeKind::TypeDef { underlying } | TypeKind::Alias { underlying } => {
                self.needs_struct_pointer(*underlying)
            }
            _ => false,
        }
    }

    pub fn num_kind(&self, ty: TypeId) -> Option<NumKind> {
        match self.kind(self.remove_indirection(ty)) {
            TypeKind::Int(kind) => Some((*kind).into()),
            TypeKind::Float(kind) => Some((*kind).into()),
            _ => None,
        }
    }

    pub fn ffi_type(&self, ty: TypeId) -> FfiType {
        match self.kind(self.remove_indirection(ty)) {
            TypeKind::Nil | TypeKind::NoReturn => FfiType::Void,
            TypeKind::Bool => FfiType::UInt8,
            TypeKind::Char => FfiType::UInt32,
            TypeKind::Int(kind) => match kind {
                IntKind::I8 => FfiType::SInt8,
                IntKind::I16 => FfiType::SInt16,
                IntKind::I32 => FfiType::SInt32,
                IntKind::I64 => FfiType::SInt64,
                IntKind::U8 => FfiType::UInt8,
                IntKind::U16 => FfiType::UInt16,
                IntKind::U32 => FfiType::UInt32,
                IntKind::U64 => FfiType::UInt64,
            },
            TypeKind::Float(FloatKind::F32) => FfiType::Float,
            TypeKind::Float(FloatKind::F64) => FfiType::Double,
            TypeKind::Enum { base, .. } => self.ffi_type(*base),
            _ => FfiType::Pointer,
        }
    }

    /// Instance vars of a class, superclass chain first, in layout order.
    pub fn all_ivars(&self, ty: TypeId) -> Vec<&InstanceVar> {
        let ty = self.remove_indirection(ty);
        let mut out = Vec::new();
        if let TypeKind::Class { ivars, superclass, .. } = self.kind(ty) {
            if let Some(superclass) = superclass {
                out = self.all_ivars(*superclass);
            }
            out.extend(ivars.iter());
        }
        out
    }

    /// Byte offset and type of an instance var, header included for
    /// reference classes.
    pub fn lookup_instance_var(&self, ty: TypeId, name: &str) -> Option<(u32, TypeId)> {
        let ty = self.remove_indirection(ty);
        let base = if self.is_struct(ty) { 0 } else { HEADER_SIZE };
        let mut offset = base;
        for ivar in self.all_ivars(ty) {
            offset = round_up(offset, self.align_of(ivar.ty));
            if ivar.name == name {
                return Some((offset, ivar.ty));
            }
            offset += self.aligned_size(ivar.ty);
        }
        None
    }

    /// Byte offset of tuple element `index` within the tuple's stack slot.
    pub fn tuple_offset(&self, ty: TypeId, index: usize) -> u32 {
        let element_types: Vec<TypeId> = match self.kind(self.remove_indirection(ty)) {
            TypeKind::Tuple { elements } => elements.clone(),
            TypeKind::NamedTuple { entries } => entries.iter().map(|&(_, e)| e).collect(),
            _ => panic!("tuple_offset on non-tuple {}", self.name(ty)),
        };
        let mut offset = 0;
        for (i, &e) in element_types.iter().enumerate() {
            offset = round_up(offset, self.align_of(e));
            if i == index {
                return offset;
            }
            offset += self.aligned_size(e);
        }
        panic!("tuple_offset {} out of range for {}", index, self.name(ty));
    }

    /// Whether a value statically typed `sub` is acceptable where `sup` is
    /// expected.
    pub fn is_subtype(&self, sub: TypeId, sup: TypeId) -> bool {
        let sub = self.remove_indirection(sub);
        let sup = self.remove_indirection(sup);
        if sub == sup {
            return true;
        }
        if self.is_no_return(sub) {
            return true;
        }
        match self.kind(sup) {
            TypeKind::Virtual { base, concrete } => {
                sub == *base || concrete.iter().any(|&c| self.is_subtype(sub, c))
            }
            TypeKind::MixedUnion { variants }
            | TypeKind::ReferenceUnion { variants }
            | TypeKind::NilableReferenceUnion { variants } => {
                let nilable = matches!(self.kind(sup), TypeKind::NilableReferenceUnion { .. });
                (nilable && self.is_nil(sub))
                    || variants.iter().any(|&v| self.is_subtype(sub, v))
            }
            TypeKind::NilableReference { reference } => {
                self.is_nil(sub) || self.is_subtype(sub, *reference)
            }
            TypeKind::Class { .. } => {
                // superclass chain walk
                let mut current = sub;
                loop {
                    match self.kind(current) {
                        TypeKind::Class { superclass: Some(parent), .. } => {
                            if *parent == sup {
                                return true;
                            }
                            current = *parent;
                        }
                        _ => return false,
                    }
                }
            }
            _ => false,
        }
    }

    /// Narrows `ty` to its part compatible with `target`, if any.
    pub fn filter_by(&self, ty: TypeId, target: TypeId) -> Option<TypeId> {
        let ty = self.remove_indirection(ty);
        let target = self.remove_indirection(target);
        if ty == target || self.is_subtype(ty, target) {
            return Some(ty);
        }
        match self.kind(ty) {
            TypeKind::MixedUnion { variants }
            | TypeKind::ReferenceUnion { variants }
            | TypeKind::NilableReferenceUnion { variants } => {
                let matching: Vec<TypeId> = variants
                    .iter()
                    .copied()
                    .filter(|&v| self.is_subtype(v, target))
                    .collect();
                match matching.len() {
                    0 => None,
                    1 => Some(matching[0]),
                    _ => Some(target),
                }
            }
            TypeKind::NilableReference { reference } => {
                if self.is_nil(target) {
                    Some(TypeTable::NIL)
                } else if self.is_subtype(*reference, target) {
                    Some(*reference)
                } else {
                    None
                }
            }
            TypeKind::Virtual { base, concrete } => {
                if target == *base || concrete.contains(&target) {
                    Some(target)
                } else {
                    None
                }
            }
            _ => {
                if self.is_subtype(target, ty) {
                    Some(target)
                } else {
                    None
                }
            }
        }
    }

    /// Merges two observable types into one already present in the table.
    /// The frontend interns every union the program's control flow can
    /// produce, so a missing merge target is a compiler bug upstream.
    pub fn type_merge(&self, a: TypeId, b: TypeId) -> Option<TypeId> {
        let a = self.remove_indirection(a);
        let b = self.remove_indirection(b);
        if a == b || self.is_no_return(b) {
            return Some(a);
        }
        if self.is_no_return(a) {
            return Some(b);
        }
        if self.is_subtype(a, b) {
            return Some(b);
        }
        if self.is_subtype(b, a) {
            return Some(a);
        }
        for id in 0..self.types.len() {
            let candidate = TypeId(id as u32);
            let covers = match self.kind(candidate) {
                TypeKind::NilableReference { .. }
                | TypeKind::NilableReferenceUnion { .. }
                | TypeKind::ReferenceUnion { .. }
                | TypeKind::MixedUnion { .. }
                | TypeKind::Virtual { .. } => {
                    self.is_subtype(a, candidate) && self.is_subtype(b, candidate)
                }
                _ => false,
            };
            if covers {
                return Some(candidate);
            }
        }
        None
    }

    /// Resolves a symbol against an enum's members by underscored name.
    pub fn lookup_enum_member(&self, ty: TypeId, symbol: &str) -> Option<i64> {
        if let TypeKind::Enum { members, .. } = self.kind(self.remove_indirection(ty)) {
            members
                .iter()
                .find(|(name, _)| name == symbol || underscore(name) == symbol)
                .map(|&(_, value)| value)
        } else {
            None
        }
    }
}

fn round_up(value: u32, align: u32) -> u32 {
    debug_assert!(align > 0);
    (value + align - 1) / align * align
}

/// CamelCase to snake_case, for symbol-to-enum autocasts.
fn underscore(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    for (i, c) in name.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}
