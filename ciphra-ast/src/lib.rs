#![forbid(unsafe_code)]

//! AST handed to the semantic core by the (external) parser.
//!
//! Every node carries a [`Span`]; doc comments ride along as opaque strings
//! on the declaration they precede. The constructor helpers on the node types
//! exist so embedders and tests can build trees without a parser.

use miette::SourceSpan;

pub type Span = SourceSpan;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spanned<T> {
    pub span: Span,
    pub node: T,
}

impl<T> Spanned<T> {
    pub fn new(span: Span, node: T) -> Self {
        Self { span, node }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Spanned<U> {
        Spanned {
            span: self.span,
            node: f(self.node),
        }
    }
}

pub fn span(start: usize, len: usize) -> Span {
    SourceSpan::new(start.into(), len)
}

pub fn span_between(start: usize, end: usize) -> Span {
    debug_assert!(end >= start);
    span(start, end - start)
}

pub type Ident = Spanned<String>;

pub fn ident(sp: Span, name: &str) -> Ident {
    Spanned::new(sp, name.to_string())
}

#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    pub modules: Vec<Module>,
}

/// A named scope with an explicit export list. Modules form a DAG via
/// imports; the resolver rejects cycles.
#[derive(Clone, Debug, PartialEq)]
pub struct Module {
    pub span: Span,
    pub name: Ident,
    pub exports: Vec<Ident>,
    pub decls: Vec<Decl>,
    pub doc: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Decl {
    Import(ImportDecl),
    Let(LetDecl),
    Var(VarDecl),
    Const(ConstDecl),
    Ring(RingDecl),
    Def(DefDecl),
}

/// `import fhe.bgv (enc, dec, add) using BGV(q=2^60, p=257, n=2^15, λ=128)`
/// or `import util (clamp)`.
#[derive(Clone, Debug, PartialEq)]
pub struct ImportDecl {
    pub span: Span,
    pub path: Vec<Ident>,
    pub items: Vec<Ident>,
    pub using: Option<UsingClause>,
    pub doc: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct UsingClause {
    pub span: Span,
    pub family: Ident,
    pub params: Vec<SchemeParam>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SchemeParam {
    pub span: Span,
    pub name: Ident,
    pub value: NatRef,
}

/// Grouped `let` introduces one binding per name with a shared annotation.
#[derive(Clone, Debug, PartialEq)]
pub struct LetDecl {
    pub span: Span,
    pub names: Vec<Ident>,
    pub ty: Option<TypeRef>,
    pub init: Expr,
    pub doc: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct VarDecl {
    pub span: Span,
    pub name: Ident,
    pub ty: Option<TypeRef>,
    pub init: Expr,
    pub doc: Option<String>,
}

/// A compile-time natural usable in nat positions (levels, lengths).
#[derive(Clone, Debug, PartialEq)]
pub struct ConstDecl {
    pub span: Span,
    pub name: Ident,
    pub value: NatRef,
    pub doc: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RingDecl {
    pub span: Span,
    pub name: Ident,
    pub dimension: NatRef,
    pub doc: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DefDecl {
    pub span: Span,
    pub name: Ident,
    /// Symbolic naturals scoped to this declaration, e.g. the `L` in
    /// `def rescale[L](x: CT[L]) : CT[L-1] where L > 0`.
    pub nat_params: Vec<Ident>,
    pub params: Vec<Param>,
    pub ret: Option<TypeRef>,
    pub where_clauses: Vec<WhereClause>,
    /// `None` means unannotated (defaults to pure); `Some(vec![])` is an
    /// explicit pure annotation.
    pub effects: Option<Vec<EffectName>>,
    pub body: Block,
    pub doc: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub span: Span,
    pub name: Ident,
    pub ty: TypeRef,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WhereClause {
    pub span: Span,
    pub lhs: NatRef,
    pub op: CmpOp,
    pub rhs: NatRef,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    pub fn display(&self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EffectName {
    Keyed,
    Random,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub span: Span,
    pub stmts: Vec<Stmt>,
    /// Final expression; its value is the block's value. `None` means the
    /// block yields unit.
    pub tail: Option<Box<Expr>>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    Let(LetDecl),
    Var(VarDecl),
    Assign(AssignStmt),
    Expr(Expr),
}

#[derive(Clone, Debug, PartialEq)]
pub struct AssignStmt {
    pub span: Span,
    pub target: Ident,
    pub expr: Expr,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Expr {
    pub span: Span,
    pub kind: ExprKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExprKind {
    Ident(Ident),
    IntLit(u64),
    BoolLit(bool),
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    Binary {
        left: Box<Expr>,
        op: BinOp,
        right: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        nat_args: Vec<NatRef>,
        args: Vec<Expr>,
    },
    If {
        cond: Box<Expr>,
        then_block: Box<Block>,
        elifs: Vec<(Expr, Block)>,
        else_block: Option<Box<Block>>,
    },
    /// `[body for binder in iter]`
    Comprehension {
        body: Box<Expr>,
        binder: Ident,
        iter: Box<Expr>,
    },
    /// `left |> right`, checked as `right(left)`.
    Pipe {
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Tuple(Vec<Expr>),
    RecordLit {
        fields: Vec<(Ident, Expr)>,
    },
    VectorLit(Vec<Expr>),
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,

    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,

    And,
    Or,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TypeRef {
    pub span: Span,
    pub kind: TypeRefKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum TypeRefKind {
    /// `Int`, `Bool`, `CT[L]`, `PT[L]`, or a declared ring name.
    Name {
        name: Ident,
        nat_args: Vec<NatRef>,
    },
    Vector {
        elem: Box<TypeRef>,
        len: NatRef,
    },
    Tuple(Vec<TypeRef>),
    Record(Vec<(Ident, TypeRef)>),
    Fn {
        params: Vec<TypeRef>,
        ret: Box<TypeRef>,
        effects: Vec<EffectName>,
    },
}

/// A compile-time natural expression as written in source. `2^k` keeps its
/// power-of-two shape so scheme parameter validation can see it.
#[derive(Clone, Debug, PartialEq)]
pub struct NatRef {
    pub span: Span,
    pub kind: NatRefKind,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NatRefKind {
    Num(u64),
    Pow2(u32),
    Sym(Ident),
    Add(Box<NatRef>, Box<NatRef>),
    Sub(Box<NatRef>, Box<NatRef>),
}

impl Expr {
    pub fn int(sp: Span, value: u64) -> Expr {
        Expr {
            span: sp,
            kind: ExprKind::IntLit(value),
        }
    }

    pub fn bool(sp: Span, value: bool) -> Expr {
        Expr {
            span: sp,
            kind: ExprKind::BoolLit(value),
        }
    }

    pub fn name(sp: Span, name: &str) -> Expr {
        Expr {
            span: sp,
            kind: ExprKind::Ident(ident(sp, name)),
        }
    }

    pub fn binary(sp: Span, left: Expr, op: BinOp, right: Expr) -> Expr {
        Expr {
            span: sp,
            kind: ExprKind::Binary {
                left: Box::new(left),
                op,
                right: Box::new(right),
            },
        }
    }

    pub fn unary(sp: Span, op: UnaryOp, expr: Expr) -> Expr {
        Expr {
            span: sp,
            kind: ExprKind::Unary {
                op,
                expr: Box::new(expr),
            },
        }
    }

    pub fn call(sp: Span, callee: &str, args: Vec<Expr>) -> Expr {
        Expr {
            span: sp,
            kind: ExprKind::Call {
                callee: Box::new(Expr::name(sp, callee)),
                nat_args: Vec::new(),
                args,
            },
        }
    }

    pub fn pipe(sp: Span, left: Expr, right: Expr) -> Expr {
        Expr {
            span: sp,
            kind: ExprKind::Pipe {
                left: Box::new(left),
                right: Box::new(right),
            },
        }
    }

    pub fn index(sp: Span, base: Expr, idx: Expr) -> Expr {
        Expr {
            span: sp,
            kind: ExprKind::Index {
                base: Box::new(base),
                index: Box::new(idx),
            },
        }
    }
}

impl Block {
    pub fn value(sp: Span, tail: Expr) -> Block {
        Block {
            span: sp,
            stmts: Vec::new(),
            tail: Some(Box::new(tail)),
        }
    }

    pub fn unit(sp: Span) -> Block {
        Block {
            span: sp,
            stmts: Vec::new(),
            tail: None,
        }
    }
}

impl TypeRef {
    pub fn name(sp: Span, name: &str) -> TypeRef {
        TypeRef {
            span: sp,
            kind: TypeRefKind::Name {
                name: ident(sp, name),
                nat_args: Vec::new(),
            },
        }
    }

    pub fn name_with(sp: Span, name: &str, nat_args: Vec<NatRef>) -> TypeRef {
        TypeRef {
            span: sp,
            kind: TypeRefKind::Name {
                name: ident(sp, name),
                nat_args,
            },
        }
    }

    pub fn vector(sp: Span, elem: TypeRef, len: NatRef) -> TypeRef {
        TypeRef {
            span: sp,
            kind: TypeRefKind::Vector {
                elem: Box::new(elem),
                len,
            },
        }
    }
}

impl NatRef {
    pub fn num(sp: Span, value: u64) -> NatRef {
        NatRef {
            span: sp,
            kind: NatRefKind::Num(value),
        }
    }

    pub fn pow2(sp: Span, exp: u32) -> NatRef {
        NatRef {
            span: sp,
            kind: NatRefKind::Pow2(exp),
        }
    }

    pub fn sym(sp: Span, name: &str) -> NatRef {
        NatRef {
            span: sp,
            kind: NatRefKind::Sym(ident(sp, name)),
        }
    }

    pub fn sub(sp: Span, lhs: NatRef, rhs: NatRef) -> NatRef {
        NatRef {
            span: sp,
            kind: NatRefKind::Sub(Box::new(lhs), Box::new(rhs)),
        }
    }

    pub fn add(sp: Span, lhs: NatRef, rhs: NatRef) -> NatRef {
        NatRef {
            span: sp,
            kind: NatRefKind::Add(Box::new(lhs), Box::new(rhs)),
        }
    }
}

impl UsingClause {
    pub fn new(sp: Span, family: &str, params: Vec<(&str, NatRef)>) -> UsingClause {
        UsingClause {
            span: sp,
            family: ident(sp, family),
            params: params
                .into_iter()
                .map(|(name, value)| SchemeParam {
                    span: sp,
                    name: ident(sp, name),
                    value,
                })
                .collect(),
        }
    }
}
