//! AST produced by the parser and consumed by the compiler.
//!
//! Statements and expressions are closed enums; every node that can fail
//! at runtime carries the 1-based source line for diagnostics. Expression
//! nodes survive into the compiled unit, statement nodes do not.

use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Stmt {
    Text(String),
    Output {
        expr: Expr,
        line: u32,
    },
    /// `if`/`elsif` chains; `unless` arrives here with a negated head.
    If {
        arms: Vec<(Expr, Vec<Stmt>)>,
        otherwise: Option<Vec<Stmt>>,
        line: u32,
    },
    For(ForStmt),
    Set(SetStmt),
    FilterBlock {
        filters: Vec<FilterCall>,
        body: Vec<Stmt>,
        line: u32,
    },
    Macro(MacroStmt),
    CallBlock {
        params: Vec<Param>,
        callee: Expr,
        args: Vec<Arg>,
        body: Vec<Stmt>,
        line: u32,
    },
    Block {
        name: String,
        body: Vec<Stmt>,
        line: u32,
    },
    Extends {
        name: String,
        line: u32,
    },
    Include {
        name: Expr,
        line: u32,
    },
    /// `from "template" import name [as alias], ...`
    Import {
        template: String,
        names: Vec<(String, String)>,
        line: u32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ForStmt {
    pub targets: Vec<String>,
    pub iter: Expr,
    pub filter: Option<Expr>,
    pub recursive: bool,
    pub body: Vec<Stmt>,
    pub otherwise: Option<Vec<Stmt>>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SetStmt {
    pub target: String,
    pub source: SetSource,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SetSource {
    Expr(Expr),
    /// Block form: the body renders into a string.
    Block(Vec<Stmt>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MacroStmt {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Param {
    pub name: String,
    pub default: Option<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FilterCall {
    pub name: String,
    pub args: Vec<Arg>,
    pub line: u32,
}

/// One argument in a call, filter or test argument list.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Arg {
    Pos(Expr),
    /// `*expr`, spliced into the positional arguments.
    Splat(Expr),
    Kw(String, Expr),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Const(Value),
    Name {
        name: String,
        line: u32,
    },
    List {
        items: Vec<Expr>,
        line: u32,
    },
    MapLit {
        entries: Vec<(Expr, Expr)>,
        line: u32,
    },
    Getattr {
        base: Box<Expr>,
        name: String,
        line: u32,
    },
    Getitem {
        base: Box<Expr>,
        index: Box<Expr>,
        line: u32,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
        line: u32,
    },
    Filter {
        base: Box<Expr>,
        call: FilterCall,
    },
    Test {
        base: Box<Expr>,
        name: String,
        args: Vec<Arg>,
        negated: bool,
        line: u32,
    },
    BinOp {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        line: u32,
    },
    UnaryOp {
        op: UnaryOp,
        expr: Box<Expr>,
        line: u32,
    },
    /// `then if test [else otherwise]`; a missing else yields Undefined.
    Cond {
        then: Box<Expr>,
        test: Box<Expr>,
        otherwise: Option<Box<Expr>>,
        line: u32,
    },
}

impl Expr {
    pub fn line(&self) -> u32 {
        match self {
            Self::Const(_) => 0,
            Self::Name { line, .. }
            | Self::List { line, .. }
            | Self::MapLit { line, .. }
            | Self::Getattr { line, .. }
            | Self::Getitem { line, .. }
            | Self::Call { line, .. }
            | Self::Test { line, .. }
            | Self::BinOp { line, .. }
            | Self::UnaryOp { line, .. }
            | Self::Cond { line, .. } => *line,
            Self::Filter { call, .. } => call.line,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Rem,
    Pow,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnaryOp {
    Not,
    Neg,
}
