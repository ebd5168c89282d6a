//! Bytecode compiler for the Opal REPL.
//!
//! Opal is a statically-typed, object-oriented language with full type
//! inference, generics, union types and blocks. This crate is the REPL's
//! lowering core: it takes the frontend's fully type-annotated AST and emits
//! a linear instruction stream for the stack-based interpreter, laying out
//! heterogeneous, variably-sized values directly on the operand stack.
//!
//! The parser/inference frontend, the interpreter and the REPL shell are
//! separate components; [`ast`] and [`types`] pin down the data they
//! exchange with the compiler. Compilation is entered per top-level
//! expression through [`compile_program`], sharing one [`Context`] per
//! session.

pub mod ast;
pub mod bytecode;
pub mod types;
mod prelude;

pub use bytecode::compiler::error::{CompileError, CompileErrorKind, CompileResult};
pub use bytecode::{compile_program, dump, Context};
