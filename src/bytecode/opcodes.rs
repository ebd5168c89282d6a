//! Opcode definitions.
//!
//! The instruction set is generated from one descriptor table: each entry
//! names the emit method, the enum variant, and the typed operand list. The
//! macro derives the opcode enum, per-opcode operand widths for decoding,
//! and the typed emit methods on [`Buffer`]. Emit methods return the buffer
//! offset of the emitted opcode.
//!
//! Stack effects are described per opcode; sizes are in bytes. `call`-family
//! operands are handles into the [`Context`](super::Context) side tables
//! rather than raw pointers.

use std::fmt::Write;
use super::buffer::Buffer;

macro_rules! opcodes {
    ( $( $(#[$meta:meta])* $snake:ident $variant:ident ( $( $arg:ident : $ty:ty ),* ) ),+ $(,)? ) => {

        /// One-byte operation codes, in descriptor-table order.
        #[repr(u8)]
        #[derive(Copy, Clone, PartialEq, Eq, Debug)]
        pub enum OpCode {
            $( $(#[$meta])* $variant ),+
        }

        impl OpCode {
            /// Mnemonic as printed by [`dump`].
            pub fn mnemonic(self) -> &'static str {
                match self {
                    $( OpCode::$variant => stringify!($snake) ),+
                }
            }

            /// Fixed operand widths in bytes, in operand order.
            pub fn operand_widths(self) -> &'static [usize] {
                match self {
                    $( OpCode::$variant => &[ $( core::mem::size_of::<$ty>() ),* ] ),+
                }
            }

            /// Decodes an opcode byte.
            pub fn from_byte(byte: u8) -> Option<OpCode> {
                $( if byte == OpCode::$variant as u8 { return Some(OpCode::$variant); } )+
                None
            }
        }

        impl Buffer {
            $(
                $(#[$meta])*
                pub fn $snake(&mut self $(, $arg: $ty )*) -> u32 {
                    let at = self.len();
                    self.push_op(OpCode::$variant);
                    $( self.push_operand($arg); )*
                    at
                }
            )+
        }
    }
}

opcodes! {
    /// Pushes nil: zero bytes. Emitted as an explicit marker instruction.
    put_nil PutNil(),
    /// Pushes true (1 byte).
    put_true PutTrue(),
    /// Pushes false (1 byte).
    put_false PutFalse(),
    /// Pushes a 1-byte integer.
    put_i8 PutI8(value: i8),
    /// Pushes a 2-byte integer.
    put_i16 PutI16(value: i16),
    /// Pushes a 4-byte integer.
    put_i32 PutI32(value: i32),
    /// Pushes an 8-byte integer.
    put_i64 PutI64(value: i64),
    /// Pushes a 4-byte float.
    put_f32 PutF32(value: f32),
    /// Pushes an 8-byte float.
    put_f64 PutF64(value: f64),
    /// Pushes a type id (4 bytes), the value of a metaclass expression.
    put_type PutType(ty: u32),
    /// Pushes a symbol-table index (4 bytes).
    put_symbol PutSymbol(symbol: u32),
    /// Pushes a 4-byte interned-string table handle.
    put_string PutString(string: u32),

    /// Copies `size` bytes from frame offset onto the stack top.
    get_local GetLocal(offset: u32, size: u32),
    /// Pops `size` bytes into the slot at frame offset.
    set_local SetLocal(offset: u32, size: u32),
    /// Pushes the address of the slot at frame offset (8 bytes).
    pointerof_var PointerofVar(offset: u32),

    /// Reads `size` bytes at `offset` within the receiver `self` points to.
    get_self_ivar GetSelfIvar(offset: u32, size: u32),
    /// Pops `size` bytes into `offset` within the receiver.
    set_self_ivar SetSelfIvar(offset: u32, size: u32),
    /// Pushes the address of the ivar at `offset` within the receiver.
    pointerof_self_ivar PointerofSelfIvar(offset: u32),
    /// Pops an object pointer, reads `size` bytes at `offset` within it.
    get_ivar GetIvar(offset: u32, size: u32),

    /// Reads `size` bytes from the class-var slot payload.
    get_class_var GetClassVar(slot: u32, size: u32),
    /// Pops `size` bytes into the class-var slot payload; sets its flag.
    set_class_var SetClassVar(slot: u32, size: u32),
    /// Pushes the slot's 1-byte initialized flag.
    class_var_initialized ClassVarInitialized(slot: u32),
    /// Pushes the address of the class-var slot payload.
    pointerof_class_var PointerofClassVar(slot: u32),

    /// Reads `size` bytes from the constant slot payload.
    get_const GetConst(slot: u32, size: u32),
    /// Pops `size` bytes into the constant slot payload; sets its flag.
    set_const SetConst(slot: u32, size: u32),
    /// Pushes the slot's 1-byte initialized flag.
    const_initialized ConstInitialized(slot: u32),
    /// Pushes the address of the constant slot payload.
    get_const_pointer GetConstPointer(slot: u32),

    /// Duplicates the top `size` bytes.
    dup Dup(size: u32),
    /// Discards the top `size` bytes.
    pop Pop(size: u32),
    /// Removes `offset` bytes located below the top `size` bytes.
    pop_from_offset PopFromOffset(offset: u32, size: u32),
    /// Pushes `amount` zero bytes.
    push_zeros PushZeros(amount: u32),
    /// Pushes the address of the value occupying the top `size` bytes.
    put_stack_top_pointer PutStackTopPointer(size: u32),
    /// Pops a tuple and stores its elements into block-arg slots per the
    /// unpack descriptor.
    unpack_tuple UnpackTuple(unpack: u32),
    /// Pops a tuple of `tuple_size` bytes, pushes the `size`-byte element at
    /// `offset` within it.
    tuple_get TupleGet(tuple_size: u32, offset: u32, size: u32),

    /// Calls a compiled def; its args are already on the stack.
    call Call(def: u32),
    /// Like `call` for a def compiled against a block.
    call_with_block CallWithBlock(def: u32),
    /// Invokes the compiled block of the enclosing call frame.
    call_block CallBlock(block: u32),
    /// Invokes a foreign function through its descriptor.
    lib_call LibCall(fun: u32),

    /// Returns from a def or block invocation with a `size`-byte value.
    leave Leave(size: u32),
    /// Returns from the def enclosing the current block with a `size`-byte value.
    leave_def LeaveDef(size: u32),
    /// Breaks out of the call that yielded to this block with a `size`-byte value.
    break_block BreakBlock(size: u32),

    /// Unconditional jump to an absolute buffer offset.
    jump Jump(target: u32),
    /// Pops a 1-byte bool; jumps when true.
    branch_if BranchIf(target: u32),
    /// Pops a 1-byte bool; jumps when false.
    branch_unless BranchUnless(target: u32),

    /// Wraps the top `from_size` bytes into a mixed union: grows the slot to
    /// `union_size` bytes total, zeroes the spare payload and writes the
    /// type id tag at the bottom.
    put_in_union PutInUnion(ty: u32, from_size: u32, union_size: u32),
    /// Unwraps a mixed union: drops the tag, keeps `size` payload bytes.
    remove_from_union RemoveFromUnion(union_size: u32, size: u32),
    /// Pops a mixed union, pushes whether its tag denotes a subtype of `ty`.
    union_is_a UnionIsA(union_size: u32, ty: u32),
    /// Pops a mixed union, pushes its truthiness (nil/false variants are falsy).
    union_truthy UnionTruthy(union_size: u32),
    /// Pops an object pointer, pushes whether its header type id denotes a
    /// subtype of `ty`.
    reference_is_a ReferenceIsA(ty: u32),
    /// Pops a pointer, pushes whether it is null.
    pointer_is_null PointerIsNull(),
    /// Pops a pointer, pushes whether it is non-null.
    pointer_is_not_null PointerIsNotNull(),
    /// Pops a bool, pushes its negation.
    logical_not LogicalNot(),
    /// Raises at runtime with the interned message. Placeholder for paths
    /// the type system proves impossible and for failed casts.
    unreachable Unreachable(message: u32),
    /// Does nothing.
    nop Nop(),

    /// Pops two i32, pushes their sum.
    add_i32 AddI32(),
    sub_i32 SubI32(),
    mul_i32 MulI32(),
    div_i32 DivI32(),
    rem_i32 RemI32(),
    /// Unsigned 32-bit division.
    div_u32 DivU32(),
    rem_u32 RemU32(),
    add_i64 AddI64(),
    sub_i64 SubI64(),
    mul_i64 MulI64(),
    div_i64 DivI64(),
    rem_i64 RemI64(),
    div_u64 DivU64(),
    rem_u64 RemU64(),
    add_f64 AddF64(),
    sub_f64 SubF64(),
    mul_f64 MulF64(),
    div_f64 DivF64(),

    /// Pops two i32, pushes a 1-byte bool.
    lt_i32 LtI32(),
    le_i32 LeI32(),
    gt_i32 GtI32(),
    ge_i32 GeI32(),
    eq_i32 EqI32(),
    ne_i32 NeI32(),
    lt_u32 LtU32(),
    le_u32 LeU32(),
    gt_u32 GtU32(),
    ge_u32 GeU32(),
    lt_i64 LtI64(),
    le_i64 LeI64(),
    gt_i64 GtI64(),
    ge_i64 GeI64(),
    eq_i64 EqI64(),
    ne_i64 NeI64(),
    lt_u64 LtU64(),
    le_u64 LeU64(),
    gt_u64 GtU64(),
    ge_u64 GeU64(),
    lt_f64 LtF64(),
    le_f64 LeF64(),
    gt_f64 GtF64(),
    ge_f64 GeF64(),
    eq_f64 EqF64(),
    ne_f64 NeF64(),

    and_i32 AndI32(),
    or_i32 OrI32(),
    xor_i32 XorI32(),
    shl_i32 ShlI32(),
    shr_i32 ShrI32(),
    and_i64 AndI64(),
    or_i64 OrI64(),
    xor_i64 XorI64(),
    shl_i64 ShlI64(),
    shr_i64 ShrI64(),

    /// Pops a number of the `from` kind, pushes it converted to the `to`
    /// kind. Kind codes are `NumKind` values.
    convert Convert(from: u8, to: u8),

    /// Heap-allocates a zeroed instance of `size` bytes, writes the type id
    /// header and pushes the pointer.
    allocate_class AllocateClass(size: u32, ty: u32),
    /// Pops an element count (u64), allocates that many zeroed elements and
    /// pushes the pointer.
    pointer_malloc PointerMalloc(element_size: u32),
    /// Pops a pointer, pushes the `size` bytes it points at.
    pointer_get PointerGet(size: u32),
    /// Pops a pointer, then pops `size` bytes and stores them through it.
    pointer_set PointerSet(size: u32),
    /// Pops an offset (i64) and a pointer, pushes the advanced pointer.
    pointer_add PointerAdd(element_size: u32),
}

/// Renders an instruction buffer one instruction per line: offset, mnemonic,
/// operands. Test and diagnostics helper; the REPL's disassembler proper
/// lives with the shell.
pub fn dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let op = OpCode::from_byte(bytes[pos]).expect("invalid opcode byte in buffer");
        write!(out, "{:>5} {}", pos, op.mnemonic()).unwrap();
        pos += 1;
        for (index, &width) in op.operand_widths().iter().enumerate() {
            let chunk = &bytes[pos..pos + width];
            pos += width;
            let rendered = match (op, index) {
                (OpCode::PutI8, _) => (chunk[0] as i8).to_string(),
                (OpCode::PutI16, _) => i16::from_le_bytes(chunk.try_into().unwrap()).to_string(),
                (OpCode::PutI32, _) => i32::from_le_bytes(chunk.try_into().unwrap()).to_string(),
                (OpCode::PutI64, _) => i64::from_le_bytes(chunk.try_into().unwrap()).to_string(),
                (OpCode::PutF32, _) => f32::from_le_bytes(chunk.try_into().unwrap()).to_string(),
                (OpCode::PutF64, _) => f64::from_le_bytes(chunk.try_into().unwrap()).to_string(),
                _ => {
                    let mut value = 0u64;
                    for (i, &byte) in chunk.iter().enumerate() {
                        value |= (byte as u64) << (8 * i);
                    }
                    value.to_string()
                }
            };
            out.push(' ');
            out.push_str(&rendered);
        }
        out.push('\n');
    }
    out
}
