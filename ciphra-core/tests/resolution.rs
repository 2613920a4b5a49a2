mod common;

use ciphra_ast::{
    ident, span, BinOp, Block, ConstDecl, Decl, DefDecl, Expr, ExprKind, ImportDecl, LetDecl,
    NatRef, Param, RingDecl, Stmt, TypeRef,
};
use ciphra_core::{check_program, DiagnosticKind, Severity, Type};
use common::*;

#[test]
fn unbound_names_are_reported_once() {
    let program = program_of(vec![let_decl(
        100,
        "x",
        Expr::binary(
            span(110, 9),
            Expr::name(span(110, 7), "missing"),
            BinOp::Add,
            Expr::int(span(118, 1), 1),
        ),
    )]);
    let checked = check_program(&program);
    let main = checked.module("main").unwrap();
    // One UnboundName; the addition propagates the error silently.
    assert_eq!(main.diagnostics.len(), 1, "{:?}", main.diagnostics);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::UnboundName);
}

#[test]
fn grouped_let_binds_each_name_freshly() {
    let sp = span(100, 4);
    let grouped = Decl::Let(LetDecl {
        span: sp,
        names: vec![ident(span(104, 1), "a"), ident(span(107, 1), "b")],
        ty: Some(TypeRef::name(span(110, 3), "Int")),
        init: Expr::int(span(116, 1), 0),
        doc: None,
    });
    let use_both = let_decl(
        200,
        "sum",
        Expr::binary(
            span(210, 5),
            Expr::name(span(210, 1), "a"),
            BinOp::Add,
            Expr::name(span(214, 1), "b"),
        ),
    );
    let checked = check_program(&program_of(vec![grouped, use_both]));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
    assert_eq!(main.type_at(span(210, 5)), Some(&Type::Int));
}

#[test]
fn grouped_let_rejects_a_repeated_name() {
    let sp = span(100, 4);
    let grouped = Decl::Let(LetDecl {
        span: sp,
        names: vec![ident(span(104, 1), "a"), ident(span(107, 1), "a")],
        ty: Some(TypeRef::name(span(110, 3), "Int")),
        init: Expr::int(span(116, 1), 0),
        doc: None,
    });
    let checked = check_program(&program_of(vec![grouped]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::DuplicateBinding);
    assert_eq!(main.diagnostics[0].span.offset(), 107);
}

#[test]
fn exporting_an_undeclared_name_is_unknown_export() {
    let checked = check_program(&program(vec![module(
        "lib",
        &["ghost"],
        vec![let_decl(100, "real", Expr::int(span(110, 1), 1))],
    )]));
    let lib = checked.module("lib").unwrap();
    assert_eq!(lib.diagnostics.len(), 1);
    assert_eq!(lib.diagnostics[0].kind, DiagnosticKind::UnknownExport);
}

#[test]
fn import_cycles_name_the_cycle_and_spare_bystanders() {
    let a = module("a", &[], vec![user_import(10, "b", &[])]);
    let b = module("b", &[], vec![user_import(10, "a", &[])]);
    let free = module("free", &[], vec![let_decl(100, "x", Expr::int(span(110, 1), 1))]);

    let checked = check_program(&program(vec![a, b, free]));
    for name in ["a", "b"] {
        let m = checked.module(name).unwrap();
        assert!(!m.is_codegen_eligible());
        assert_eq!(m.diagnostics.len(), 1);
        assert_eq!(m.diagnostics[0].kind, DiagnosticKind::CyclicImport);
        assert!(m.diagnostics[0].message.contains("a -> b -> a"));
    }
    assert!(checked.module("free").unwrap().is_codegen_eligible());
    assert_eq!(checked.codegen_modules(), vec!["free"]);
}

#[test]
fn importing_from_a_cyclic_module_does_not_cascade() {
    let a = module("a", &["x"], vec![user_import(10, "b", &[])]);
    let b = module("b", &[], vec![user_import(10, "a", &[])]);
    let user = module(
        "user",
        &[],
        vec![
            user_import(10, "a", &["x"]),
            let_decl(100, "y", Expr::name(span(110, 1), "x")),
        ],
    );

    let checked = check_program(&program(vec![a, b, user]));
    // The cycle is the root cause; `user` gets no second-hand diagnostics.
    let user = checked.module("user").unwrap();
    assert!(user.diagnostics.is_empty(), "{:?}", user.diagnostics);
}

#[test]
fn importing_a_name_the_module_does_not_export() {
    let lib = module(
        "lib",
        &["shared"],
        vec![
            let_decl(100, "shared", Expr::int(span(110, 1), 1)),
            let_decl(200, "private", Expr::int(span(210, 1), 2)),
        ],
    );
    let main = module(
        "main",
        &[],
        vec![
            user_import(10, "lib", &["private"]),
            let_decl(100, "y", Expr::name(span(110, 7), "private")),
        ],
    );
    let checked = check_program(&program(vec![lib, main]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1, "{:?}", main.diagnostics);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::UnboundName);
    assert!(main.diagnostics[0].message.contains("does not export"));
}

#[test]
fn functions_cross_module_boundaries_with_their_signatures() {
    let sp = span(100, 6);
    let double = Decl::Def(DefDecl {
        span: sp,
        name: ident(sp, "double"),
        nat_params: vec![],
        params: vec![Param {
            span: sp,
            name: ident(sp, "x"),
            ty: TypeRef::name(sp, "Int"),
        }],
        ret: Some(TypeRef::name(sp, "Int")),
        where_clauses: vec![],
        effects: None,
        body: Block::value(
            span(150, 5),
            Expr::binary(
                span(150, 5),
                Expr::name(span(150, 1), "x"),
                BinOp::Add,
                Expr::name(span(154, 1), "x"),
            ),
        ),
        doc: None,
    });
    let util = module("util", &["double"], vec![double]);
    let main = module(
        "main",
        &[],
        vec![
            user_import(10, "util", &["double"]),
            let_decl(
                100,
                "d",
                Expr::call(span(110, 10), "double", vec![Expr::int(span(117, 2), 21)]),
            ),
        ],
    );
    let checked = check_program(&program(vec![util, main]));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
    assert_eq!(main.type_at(span(110, 10)), Some(&Type::Int));
}

#[test]
fn unused_locals_warn_without_blocking_codegen() {
    let sp = span(100, 5);
    let with_dead_local = Decl::Def(DefDecl {
        span: sp,
        name: ident(sp, "answer"),
        nat_params: vec![],
        params: vec![],
        ret: Some(TypeRef::name(sp, "Int")),
        where_clauses: vec![],
        effects: None,
        body: Block {
            span: span(150, 30),
            stmts: vec![Stmt::Let(LetDecl {
                span: span(150, 8),
                names: vec![ident(span(154, 4), "dead")],
                ty: None,
                init: Expr::int(span(160, 1), 0),
                doc: None,
            })],
            tail: Some(Box::new(Expr::int(span(170, 2), 42))),
        },
        doc: None,
    });
    let checked = check_program(&program_of(vec![with_dead_local]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1);
    let diag = &main.diagnostics[0];
    assert_eq!(diag.kind, DiagnosticKind::UnusedSymbol);
    assert_eq!(diag.severity, Severity::Warning);
    assert!(main.is_codegen_eligible());
}

#[test]
fn ring_declarations_introduce_a_nominal_type() {
    let ring = Decl::Ring(RingDecl {
        span: span(100, 4),
        name: ident(span(105, 1), "R"),
        dimension: NatRef::pow2(span(109, 4), 10),
        doc: None,
    });
    let identity = Decl::Def(DefDecl {
        span: span(200, 2),
        name: ident(span(200, 2), "id"),
        nat_params: vec![],
        params: vec![Param {
            span: span(210, 4),
            name: ident(span(210, 1), "x"),
            ty: TypeRef::name(span(213, 1), "R"),
        }],
        ret: Some(TypeRef::name(span(220, 1), "R")),
        where_clauses: vec![],
        effects: None,
        body: Block::value(span(230, 1), Expr::name(span(230, 1), "x")),
        doc: None,
    });
    let checked = check_program(&program_of(vec![ring, identity]));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
    assert_eq!(
        main.type_at(span(230, 1)),
        Some(&Type::Ring {
            name: "R".to_string(),
            dim: 1024,
        })
    );
}

#[test]
fn ring_dimension_must_be_a_power_of_two() {
    let ring = Decl::Ring(RingDecl {
        span: span(100, 4),
        name: ident(span(105, 1), "R"),
        dimension: NatRef::num(span(109, 4), 1000),
        doc: None,
    });
    let checked = check_program(&program_of(vec![ring]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::InvalidParameter);
}

#[test]
fn consts_feed_both_nat_and_value_positions() {
    let n = Decl::Const(ConstDecl {
        span: span(100, 5),
        name: ident(span(106, 1), "N"),
        value: NatRef::num(span(110, 1), 3),
        doc: None,
    });
    // `let v : Vec[Int; N] = [1, 2, 3]` checks its literal length against N.
    let annotated = Decl::Let(LetDecl {
        span: span(200, 1),
        names: vec![ident(span(204, 1), "v")],
        ty: Some(TypeRef::vector(
            span(208, 11),
            TypeRef::name(span(212, 3), "Int"),
            NatRef::sym(span(217, 1), "N"),
        )),
        init: Expr {
            span: span(222, 9),
            kind: ExprKind::VectorLit(vec![
                Expr::int(span(223, 1), 1),
                Expr::int(span(226, 1), 2),
                Expr::int(span(229, 1), 3),
            ]),
        },
        doc: None,
    });
    // `N` also reads as an Int value.
    let as_value = let_decl(
        300,
        "m",
        Expr::binary(
            span(310, 5),
            Expr::name(span(310, 1), "N"),
            BinOp::Add,
            Expr::int(span(314, 1), 1),
        ),
    );
    let checked = check_program(&program_of(vec![n, annotated, as_value]));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
    assert_eq!(main.type_at(span(310, 5)), Some(&Type::Int));
}

#[test]
fn unknown_fhe_primitive_is_rejected_with_help() {
    let checked = check_program(&program_of(vec![bgv_import(0, &["enc", "bootstrap"])]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::UnboundName);
    assert!(main.diagnostics[0].help.is_some());
}

#[test]
fn fhe_import_without_using_clause_is_missing_parameter() {
    let sp = span(0, 6);
    let bare = Decl::Import(ImportDecl {
        span: sp,
        path: vec![ident(sp, "fhe"), ident(sp, "bgv")],
        items: vec![ident(sp, "enc")],
        using: None,
        doc: None,
    });
    let checked = check_program(&program_of(vec![
        bare,
        let_decl(100, "c", Expr::call(span(110, 6), "enc", vec![Expr::int(span(114, 1), 1)])),
    ]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1, "{:?}", main.diagnostics);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::MissingParameter);
}
