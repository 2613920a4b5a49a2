#![allow(dead_code)]

//! Shared AST builders for the integration tests. The parser is an external
//! collaborator, so tests assemble trees directly through the `ciphra-ast`
//! constructor helpers.

use ciphra_ast::{
    ident, span, Decl, Expr, ImportDecl, LetDecl, Module, NatRef, Program, Span, TypeRef,
    UsingClause,
};

pub fn bgv_clause(sp: Span) -> UsingClause {
    bgv_clause_n(sp, 15)
}

pub fn bgv_clause_n(sp: Span, n_exp: u32) -> UsingClause {
    UsingClause::new(
        sp,
        "BGV",
        vec![
            ("q", NatRef::pow2(sp, 60)),
            ("p", NatRef::num(sp, 257)),
            ("n", NatRef::pow2(sp, n_exp)),
            ("lambda", NatRef::num(sp, 128)),
        ],
    )
}

/// `import fhe.bgv (items…) using BGV(…)`
pub fn bgv_import(offset: usize, items: &[&str]) -> Decl {
    bgv_import_n(offset, items, 15)
}

pub fn bgv_import_n(offset: usize, items: &[&str], n_exp: u32) -> Decl {
    let sp = span(offset, 6);
    Decl::Import(ImportDecl {
        span: sp,
        path: vec![ident(sp, "fhe"), ident(sp, "bgv")],
        items: items.iter().map(|i| ident(sp, i)).collect(),
        using: Some(bgv_clause_n(sp, n_exp)),
        doc: None,
    })
}

/// `import <module> (items…)`
pub fn user_import(offset: usize, module: &str, items: &[&str]) -> Decl {
    let sp = span(offset, module.len());
    Decl::Import(ImportDecl {
        span: sp,
        path: vec![ident(sp, module)],
        items: items.iter().map(|i| ident(sp, i)).collect(),
        using: None,
        doc: None,
    })
}

pub fn let_decl(offset: usize, name: &str, init: Expr) -> Decl {
    let sp = span(offset, name.len());
    Decl::Let(LetDecl {
        span: sp,
        names: vec![ident(sp, name)],
        ty: None,
        init,
        doc: None,
    })
}

pub fn let_decl_typed(offset: usize, name: &str, ty: TypeRef, init: Expr) -> Decl {
    let sp = span(offset, name.len());
    Decl::Let(LetDecl {
        span: sp,
        names: vec![ident(sp, name)],
        ty: Some(ty),
        init,
        doc: None,
    })
}

pub fn module(name: &str, exports: &[&str], decls: Vec<Decl>) -> Module {
    let sp = span(0, name.len());
    Module {
        span: sp,
        name: ident(sp, name),
        exports: exports.iter().map(|e| ident(sp, e)).collect(),
        decls,
        doc: None,
    }
}

pub fn program(modules: Vec<Module>) -> Program {
    Program { modules }
}

pub fn program_of(decls: Vec<Decl>) -> Program {
    program(vec![module("main", &[], decls)])
}
