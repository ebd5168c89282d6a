//! The type-annotated AST the inference frontend hands to the compiler.
//!
//! Nodes are immutable during lowering. The frontend may re-type a tree
//! between compilations, so the compiler reads `ty` on every visit and never
//! memoizes it. Defs and blocks are `Rc`-shared because compiled artifacts
//! and the def cache refer back to them by identity.

use crate::prelude::*;
use crate::types::TypeId;

/// Source position attached to every node, carried into the node map for
/// runtime error reporting.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Location {
    pub line: u32,
    pub column: u32,
}

impl Location {
    pub fn new(line: u32, column: u32) -> Self {
        Location { line, column }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A numeric literal value; the node's type selects the target kind.
#[derive(Copy, Clone, Debug)]
pub enum NumberValue {
    Int(i64),
    Float(f64),
}

/// A def or block parameter.
#[derive(Clone, Debug)]
pub struct Param {
    pub name: String,
    pub ty: TypeId,
}

/// Foreign linkage of a `fun` declared inside a lib.
#[derive(Clone, Debug)]
pub struct External {
    pub lib: String,
    pub symbol: String,
    pub variadic: bool,
}

/// A method instantiation. `owner` is `None` for program (top-level) scope.
/// `vars` is the frontend's local-variable table: every local the body
/// assigns, at its merged type.
#[derive(Clone, Debug)]
pub struct Def {
    pub name: String,
    pub owner: Option<TypeId>,
    pub params: Vec<Param>,
    pub vars: Vec<(String, TypeId)>,
    pub body: Node,
    pub ty: TypeId,
    pub accepts_block: bool,
    /// Explicit `&block` parameter when the def captures its block as a
    /// proc instead of yielding to it.
    pub block_param: Option<Param>,
    /// Marks a proc-literal def that captures outer variables.
    pub closure: bool,
    pub external: Option<External>,
}

/// A block passed to a call and invoked via `yield`. Compiled inline into
/// the caller's frame.
#[derive(Clone, Debug)]
pub struct Block {
    pub params: Vec<Param>,
    pub vars: Vec<(String, TypeId)>,
    pub body: Node,
    pub ty: TypeId,
    pub break_type: Option<TypeId>,
}

/// A call with its frontend-resolved candidate targets, most-specific first
/// and never empty for a well-typed tree.
#[derive(Clone, Debug)]
pub struct Call {
    pub receiver: Option<Node>,
    pub name: String,
    pub args: Vec<Node>,
    pub named_args: Vec<(String, Node)>,
    pub block: Option<Rc<Block>>,
    /// Captured-proc argument (`&proc`), passed in the trailing proc slot.
    pub block_arg: Option<Node>,
    pub target_defs: Vec<Rc<Def>>,
}

/// One AST node: a kind, the resolved type, and the source position.
#[derive(Clone, Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub ty: TypeId,
    pub location: Location,
}

impl Node {
    pub fn new(kind: NodeKind, ty: TypeId, location: Location) -> Self {
        Node { kind, ty, location }
    }

    /// Literals that constant slots inline at their use sites instead of
    /// going through the lazy-init guard.
    pub fn simple_literal(&self) -> bool {
        matches!(
            self.kind,
            NodeKind::NilLiteral
                | NodeKind::BoolLiteral(_)
                | NodeKind::NumberLiteral(_)
                | NodeKind::CharLiteral(_)
                | NodeKind::StringLiteral(_)
                | NodeKind::SymbolLiteral(_)
        )
    }
}

/// The closed set of node kinds the lowering pass handles.
#[derive(Clone, Debug)]
pub enum NodeKind {
    NilLiteral,
    BoolLiteral(bool),
    NumberLiteral(NumberValue),
    CharLiteral(char),
    StringLiteral(String),
    SymbolLiteral(String),
    TupleLiteral(Vec<Node>),
    NamedTupleLiteral(Vec<(String, Node)>),

    Var(String),
    InstanceVar(String),
    ClassVar(String),
    /// Resolved constant reference.
    Path(String),
    /// Discarding assignment target.
    Underscore,

    Assign {
        target: Box<Node>,
        value: Box<Node>,
    },
    If {
        cond: Box<Node>,
        then_branch: Box<Node>,
        else_branch: Box<Node>,
        /// Frontend-computed condition truthiness; the dead branch is elided.
        truthiness: Option<bool>,
    },
    While {
        cond: Box<Node>,
        body: Box<Node>,
    },
    Return(Option<Box<Node>>),
    Break(Option<Box<Node>>),
    Next(Option<Box<Node>>),
    Yield(Vec<Node>),
    Call(Box<Call>),
    Expressions(Vec<Node>),

    PointerOf(Box<Node>),
    SizeOf(TypeId),
    TypeOf(TypeId),
    IsA {
        receiver: Box<Node>,
        target: TypeId,
    },
    Cast {
        receiver: Box<Node>,
        target: TypeId,
    },
    NilableCast {
        receiver: Box<Node>,
        target: TypeId,
    },
    Not(Box<Node>),
    ReadInstanceVar {
        receiver: Box<Node>,
        name: String,
    },
    /// FFI out-parameter wrapper around a variable.
    Out(Box<Node>),
    UninitializedVar(String),
    ProcLiteral(Rc<Def>),
    ExceptionHandler {
        body: Box<Node>,
        rescues: Vec<Node>,
        else_branch: Option<Box<Node>>,
        ensure: Option<Box<Node>>,
    },
    /// Intrinsic def body; the name selects the emit rule.
    Primitive(String),

    ClassDef { body: Option<Box<Node>> },
    ModuleDef { body: Option<Box<Node>> },
    EnumDef,
    LibDef,
    FunDef,
    MacroDef,
    AliasDef,
    AnnotationDef,
    Include,
    Extend,
    TypeDeclaration { name: String },
    VisibilityModifier(Box<Node>),

    FileNode {
        body: Box<Node>,
        filename: String,
        /// File-scope local table, hoisted into the synthetic wrapper def.
        vars: Vec<(String, TypeId)>,
    },
    Unreachable,
}
