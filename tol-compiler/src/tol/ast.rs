//! AST of the TOL surface.

use tol_types::Uint256;

/// A parsed module: header version plus at most one contract.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Version literal of the `tol` header.
    pub version: String,
    /// Line of the header.
    pub version_line: u32,
    /// The contract, when declared.
    pub contract: Option<Contract>,
}

/// A contract declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Contract {
    /// Contract name.
    pub name: String,
    /// Declaration line.
    pub line: u32,
    /// Declared storage slots, in declaration order.
    pub storage: Vec<SlotDecl>,
    /// Declared events.
    pub events: Vec<EventDecl>,
    /// User functions.
    pub functions: Vec<FnDecl>,
    /// The constructor, when declared.
    pub constructor: Option<FnDecl>,
    /// The fallback, when declared.
    pub fallback: Option<FnDecl>,
}

/// A storage slot declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotDecl {
    /// Slot name.
    pub name: String,
    /// Slot type.
    pub ty: Type,
    /// Declaration line.
    pub line: u32,
}

/// TOL types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Type {
    /// `uint256`
    Uint256,
    /// `bool`
    Bool,
    /// `address`
    Address,
    /// `string`
    Str,
    /// `mapping(K => V)`
    Mapping(Box<Type>, Box<Type>),
    /// `T[]`, a dynamic array.
    Array(Box<Type>),
}

impl Type {
    /// Canonical text used in signatures (`uint256`, `address`, `T[]`).
    pub fn canonical(&self) -> String {
        match self {
            Type::Uint256 => "uint256".into(),
            Type::Bool => "bool".into(),
            Type::Address => "address".into(),
            Type::Str => "string".into(),
            Type::Array(inner) => format!("{}[]", inner.canonical()),
            Type::Mapping(k, v) => {
                format!("mapping({}=>{})", k.canonical(), v.canonical())
            }
        }
    }

    /// Nesting depth of a mapping; the number of keys an access requires.
    pub fn mapping_depth(&self) -> usize {
        match self {
            Type::Mapping(_, v) => 1 + v.mapping_depth(),
            _ => 0,
        }
    }
}

/// An event declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct EventDecl {
    /// Event name.
    pub name: String,
    /// Parameters; `indexed` is carried but does not change lowering.
    pub params: Vec<Param>,
    /// Declaration line.
    pub line: u32,
}

/// A parameter or named return.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    /// Name.
    pub name: String,
    /// Type.
    pub ty: Type,
    /// `indexed` marker (event parameters only).
    pub indexed: bool,
    /// Declaration line.
    pub line: u32,
}

/// What a function declaration is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FnKind {
    /// Ordinary `fn`.
    Normal,
    /// `constructor`.
    Constructor,
    /// `fallback`.
    Fallback,
}

/// A function declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FnDecl {
    /// Function name (`constructor`/`fallback` carry their keyword name).
    pub name: String,
    /// Kind.
    pub kind: FnKind,
    /// Parameters.
    pub params: Vec<Param>,
    /// Named returns; empty for void.
    pub returns: Vec<Param>,
    /// Modifier words with their lines, as written.
    pub modifiers: Vec<(String, u32)>,
    /// `@selector("0x...")` override, when present.
    pub selector_override: Option<(String, u32)>,
    /// Body statements.
    pub body: Vec<TStatNode>,
    /// Declaration line.
    pub line: u32,
}

/// A statement with its line.
#[derive(Debug, Clone, PartialEq)]
pub struct TStatNode {
    /// The statement.
    pub stat: TStat,
    /// One-based source line.
    pub line: u32,
}

/// TOL statements.
#[derive(Debug, Clone, PartialEq)]
pub enum TStat {
    /// `let name[: ty] = value`
    Let {
        /// Declared name.
        name: String,
        /// Optional annotation.
        ty: Option<Type>,
        /// Initializer.
        value: TExprNode,
    },
    /// `set target = value`
    SetStat {
        /// Assignment target.
        target: TExprNode,
        /// Value.
        value: TExprNode,
    },
    /// `if cond { } [else { } | else if ...]`
    If {
        /// Condition.
        cond: TExprNode,
        /// Then-branch.
        then_block: Vec<TStatNode>,
        /// Else-branch (an `else if` nests as a single `If` statement).
        else_block: Option<Vec<TStatNode>>,
    },
    /// `while cond { }`
    While {
        /// Condition.
        cond: TExprNode,
        /// Body.
        body: Vec<TStatNode>,
    },
    /// `for var in start .. stop { }` (upper bound exclusive)
    For {
        /// Loop variable.
        var: String,
        /// Lower bound, inclusive.
        start: TExprNode,
        /// Upper bound, exclusive.
        stop: TExprNode,
        /// Body.
        body: Vec<TStatNode>,
    },
    /// `break`
    Break,
    /// `continue`
    Continue,
    /// `return [expr]`
    Return(Option<TExprNode>),
    /// `require(cond[, "msg"])`
    Require {
        /// Condition.
        cond: TExprNode,
        /// Optional message.
        message: Option<String>,
    },
    /// `assert(cond[, "msg"])`
    Assert {
        /// Condition.
        cond: TExprNode,
        /// Optional message.
        message: Option<String>,
    },
    /// `revert ["msg"]`
    Revert(Option<String>),
    /// `emit Event(args)`
    EmitStat {
        /// Event name.
        name: String,
        /// Arguments.
        args: Vec<TExprNode>,
    },
    /// Expression statement; must be a call.
    Expr(TExprNode),
}

/// An expression with its line.
#[derive(Debug, Clone, PartialEq)]
pub struct TExprNode {
    /// The expression.
    pub expr: TExpr,
    /// One-based source line.
    pub line: u32,
}

impl TExprNode {
    /// Construct a node.
    pub fn new(expr: TExpr, line: u32) -> Self {
        Self { expr, line }
    }
}

/// TOL binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TBinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `&&`
    And,
    /// `||`
    Or,
}

/// TOL unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TUnOp {
    /// `!`
    Not,
    /// `-` (wraps modulo 2^256)
    Neg,
}

/// TOL expressions.
#[derive(Debug, Clone, PartialEq)]
pub enum TExpr {
    /// Decimal integer literal.
    Number(Uint256),
    /// Boolean literal.
    Bool(bool),
    /// String literal.
    Str(String),
    /// `0x...` hex literal, normalized to an address by the lowering.
    Hex(String),
    /// Identifier (local, parameter, named return, storage slot, or
    /// function reference inside a call).
    Ident(String),
    /// `this`
    This,
    /// `value.field` (`.length`, `.selector`, contract member access).
    Member(Box<TExprNode>, String),
    /// `value[key]`
    Index(Box<TExprNode>, Box<TExprNode>),
    /// `f(args)`; also `slot.push(v)` and the `selector("sig")` builtin.
    Call(Box<TExprNode>, Vec<TExprNode>),
    /// Binary operation.
    Bin(TBinOp, Box<TExprNode>, Box<TExprNode>),
    /// Unary operation.
    Un(TUnOp, Box<TExprNode>),
}
