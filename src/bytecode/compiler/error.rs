//! Compiler errors.
//!
//! The compiler has no recovery path: the first error unwinds to the driver
//! and the partially written instruction buffer is discarded. Emit-time
//! width-contract violations are compiler bugs, not user errors.

use thiserror::Error;
use crate::ast::Location;

/// Represents the various possible compiler error-kinds.
#[derive(Clone, Debug, Error)]
pub enum CompileErrorKind {
    /// A case the lowering pass cannot handle; always a bug in the compiler
    /// or the frontend contract, never in the user program.
    #[error("BUG: {0}")]
    Bug(String),
    /// A construct the compiler does not support yet.
    #[error("can't compile {0} yet")]
    Unsupported(String),
    #[error("undefined constant {0}")]
    UndefinedConstant(String),
    #[error("undefined local variable {0}")]
    UndefinedLocal(String),
    /// The frontend produced a call without candidate targets.
    #[error("no target defs for call '{0}'")]
    MissingTargets(String),
    #[error("invalid break")]
    InvalidBreak,
    #[error("invalid next")]
    InvalidNext,
}

/// An error reported by the compiler, located at the offending node.
#[derive(Clone, Debug, Error)]
#[error("{kind} (at {location})")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub location: Location,
}

impl CompileError {
    pub fn new(location: Location, kind: CompileErrorKind) -> Self {
        CompileError { kind, location }
    }
}

pub type CompileResult<T = ()> = Result<T, CompileError>;
