mod common;

use ciphra_ast::{
    ident, span, AssignStmt, BinOp, Block, Decl, DefDecl, Expr, ExprKind, LetDecl, NatRef, Stmt,
    TypeRef, TypeRefKind, VarDecl,
};
use ciphra_core::{check_program, DiagnosticKind, Nat, Type};
use common::*;

fn vector_lit(offset: usize, values: &[u64]) -> Expr {
    Expr {
        span: span(offset, values.len() * 3),
        kind: ExprKind::VectorLit(
            values
                .iter()
                .enumerate()
                .map(|(i, v)| Expr::int(span(offset + 1 + i * 3, 1), *v))
                .collect(),
        ),
    }
}

#[test]
fn vector_literals_synthesize_element_type_and_length() {
    let checked = check_program(&program_of(vec![let_decl(100, "v", vector_lit(110, &[1, 2, 3]))]));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
    assert_eq!(
        main.type_at(span(110, 9)),
        Some(&Type::Vector {
            elem: Box::new(Type::Int),
            len: Nat::Const(3),
        })
    );
}

#[test]
fn declared_vector_length_must_match() {
    let sp = span(100, 1);
    let annotated = Decl::Let(LetDecl {
        span: sp,
        names: vec![ident(sp, "v")],
        ty: Some(TypeRef::vector(
            span(104, 11),
            TypeRef::name(span(108, 3), "Int"),
            NatRef::num(span(113, 1), 4),
        )),
        init: vector_lit(120, &[1, 2, 3]),
        doc: None,
    });
    let checked = check_program(&program_of(vec![annotated]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::LengthMismatch);
}

#[test]
fn constant_indexing_is_bounds_checked() {
    let decls = vec![
        let_decl(100, "v", vector_lit(110, &[1, 2, 3])),
        let_decl(
            200,
            "ok",
            Expr::index(
                span(210, 4),
                Expr::name(span(210, 1), "v"),
                Expr::int(span(212, 1), 2),
            ),
        ),
        let_decl(
            300,
            "oob",
            Expr::index(
                span(310, 4),
                Expr::name(span(310, 1), "v"),
                Expr::int(span(312, 1), 3),
            ),
        ),
    ];
    let checked = check_program(&program_of(decls));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::LengthMismatch);
    assert_eq!(main.diagnostics[0].span.offset(), 312);
    assert_eq!(main.type_at(span(210, 4)), Some(&Type::Int));
}

#[test]
fn comprehensions_map_over_vectors() {
    let body = Expr::binary(
        span(211, 5),
        Expr::name(span(211, 1), "x"),
        BinOp::Mul,
        Expr::int(span(215, 1), 2),
    );
    let comp = Expr {
        span: span(210, 20),
        kind: ExprKind::Comprehension {
            body: Box::new(body),
            binder: ident(span(221, 1), "x"),
            iter: Box::new(Expr::name(span(226, 1), "v")),
        },
    };
    let decls = vec![
        let_decl(100, "v", vector_lit(110, &[1, 2, 3])),
        let_decl(200, "w", comp),
    ];
    let checked = check_program(&program_of(decls));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
    assert_eq!(
        main.type_at(span(210, 20)),
        Some(&Type::Vector {
            elem: Box::new(Type::Int),
            len: Nat::Const(3),
        })
    );
}

#[test]
fn pipelines_check_as_calls() {
    let piped = Expr::pipe(
        span(200, 18),
        Expr::call(span(200, 6), "enc", vec![Expr::int(span(204, 1), 9)]),
        Expr::name(span(210, 7), "rescale"),
    );
    let checked = check_program(&program_of(vec![
        bgv_import(0, &["enc", "rescale"]),
        let_decl(190, "out", piped),
    ]));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
    let Type::Cipher { level, .. } = main.type_at(span(200, 18)).unwrap() else {
        panic!("expected a ciphertext");
    };
    assert_eq!(level.as_const(), Some(4));
}

fn if_expr(offset: usize, with_else: bool) -> Expr {
    Expr {
        span: span(offset, 20),
        kind: ExprKind::If {
            cond: Box::new(Expr::bool(span(offset + 3, 4), true)),
            then_block: Box::new(Block::value(span(offset + 8, 3), Expr::int(span(offset + 9, 1), 1))),
            elifs: vec![],
            else_block: with_else.then(|| {
                Box::new(Block::value(span(offset + 14, 3), Expr::int(span(offset + 15, 1), 2)))
            }),
        },
    }
}

#[test]
fn conditional_in_value_position_requires_else() {
    let checked = check_program(&program_of(vec![let_decl(100, "x", if_expr(110, false))]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1);
    assert_eq!(
        main.diagnostics[0].kind,
        DiagnosticKind::NonExhaustiveConditional
    );

    let checked = check_program(&program_of(vec![let_decl(100, "x", if_expr(110, true))]));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
    assert_eq!(main.type_at(span(110, 20)), Some(&Type::Int));
}

#[test]
fn conditional_in_statement_position_may_omit_else() {
    let sp = span(100, 4);
    let body = Block {
        span: span(150, 40),
        stmts: vec![Stmt::Expr(if_expr(160, false))],
        tail: Some(Box::new(Expr::int(span(185, 1), 0))),
    };
    let wrapper = Decl::Def(DefDecl {
        span: sp,
        name: ident(sp, "side"),
        nat_params: vec![],
        params: vec![],
        ret: Some(TypeRef::name(sp, "Int")),
        where_clauses: vec![],
        effects: None,
        body,
        doc: None,
    });
    let checked = check_program(&program_of(vec![wrapper]));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
}

#[test]
fn conditional_branches_must_join() {
    let mixed = Expr {
        span: span(110, 20),
        kind: ExprKind::If {
            cond: Box::new(Expr::bool(span(113, 4), true)),
            then_block: Box::new(Block::value(span(118, 3), Expr::int(span(119, 1), 1))),
            elifs: vec![],
            else_block: Some(Box::new(Block::value(span(124, 4), Expr::bool(span(125, 4), false)))),
        },
    };
    let checked = check_program(&program_of(vec![let_decl(100, "x", mixed)]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::TypeMismatch);
    assert!(main.diagnostics[0].message.contains("branches disagree"));
}

#[test]
fn record_annotations_check_shape() {
    let sp = span(100, 1);
    let annotated = Decl::Let(LetDecl {
        span: sp,
        names: vec![ident(sp, "r")],
        ty: Some(TypeRef {
            span: span(104, 20),
            kind: TypeRefKind::Record(vec![
                (ident(span(105, 1), "x"), TypeRef::name(span(108, 3), "Int")),
                (ident(span(113, 1), "y"), TypeRef::name(span(116, 4), "Bool")),
            ]),
        }),
        init: Expr {
            span: span(130, 8),
            kind: ExprKind::RecordLit {
                fields: vec![(ident(span(131, 1), "x"), Expr::int(span(134, 1), 1))],
            },
        },
        doc: None,
    });
    let checked = check_program(&program_of(vec![annotated]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::RecordShapeMismatch);
}

#[test]
fn tuples_check_positionally() {
    let sp = span(100, 1);
    let annotated = Decl::Let(LetDecl {
        span: sp,
        names: vec![ident(sp, "t")],
        ty: Some(TypeRef {
            span: span(104, 11),
            kind: TypeRefKind::Tuple(vec![
                TypeRef::name(span(105, 3), "Int"),
                TypeRef::name(span(110, 4), "Bool"),
            ]),
        }),
        init: Expr {
            span: span(120, 9),
            kind: ExprKind::Tuple(vec![
                Expr::int(span(121, 1), 1),
                Expr::bool(span(124, 4), true),
            ]),
        },
        doc: None,
    });
    let checked = check_program(&program_of(vec![annotated]));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
}

#[test]
fn assignment_respects_mutability_and_type() {
    let sp = span(100, 4);
    let body = Block {
        span: span(150, 60),
        stmts: vec![
            Stmt::Var(VarDecl {
                span: span(150, 9),
                name: ident(span(154, 1), "v"),
                ty: None,
                init: Expr::int(span(158, 1), 1),
                doc: None,
            }),
            Stmt::Let(LetDecl {
                span: span(160, 9),
                names: vec![ident(span(164, 1), "k")],
                ty: None,
                init: Expr::int(span(168, 1), 2),
                doc: None,
            }),
            // v = 3 is fine; k = 4 is not; v = true changes the type.
            Stmt::Assign(AssignStmt {
                span: span(170, 5),
                target: ident(span(170, 1), "v"),
                expr: Expr::int(span(174, 1), 3),
            }),
            Stmt::Assign(AssignStmt {
                span: span(180, 5),
                target: ident(span(180, 1), "k"),
                expr: Expr::int(span(184, 1), 4),
            }),
            Stmt::Assign(AssignStmt {
                span: span(190, 8),
                target: ident(span(190, 1), "v"),
                expr: Expr::bool(span(194, 4), true),
            }),
        ],
        tail: Some(Box::new(Expr::binary(
            span(200, 5),
            Expr::name(span(200, 1), "v"),
            BinOp::Add,
            Expr::name(span(204, 1), "k"),
        ))),
    };
    let wrapper = Decl::Def(DefDecl {
        span: sp,
        name: ident(sp, "bump"),
        nat_params: vec![],
        params: vec![],
        ret: Some(TypeRef::name(sp, "Int")),
        where_clauses: vec![],
        effects: None,
        body,
        doc: None,
    });
    let checked = check_program(&program_of(vec![wrapper]));
    let main = checked.module("main").unwrap();
    let kinds: Vec<_> = main.diagnostics.iter().map(|d| d.kind).collect();
    assert_eq!(
        kinds,
        vec![
            DiagnosticKind::AssignToImmutable,
            DiagnosticKind::TypeMismatch,
        ]
    );
}

#[test]
fn plaintext_operands_must_share_the_ciphertext_level() {
    let encoded = Expr::call(span(200, 9), "encode", vec![Expr::int(span(207, 1), 5)]);
    let mixed = Expr::binary(
        span(300, 7),
        Expr::name(span(300, 1), "c"),
        BinOp::Mul,
        Expr::name(span(304, 2), "pt"),
    );
    let checked = check_program(&program_of(vec![
        bgv_import(0, &["enc", "encode"]),
        let_decl(100, "c", Expr::call(span(110, 6), "enc", vec![Expr::int(span(114, 1), 1)])),
        let_decl(190, "pt", encoded),
        let_decl(290, "prod", mixed),
    ]));
    let main = checked.module("main").unwrap();
    assert!(main.diagnostics.is_empty(), "{:?}", main.diagnostics);
    // The encoded plaintext's flexible level snapped to the ciphertext's.
    let Type::Cipher { level, .. } = main.type_at(span(300, 7)).unwrap() else {
        panic!("expected ciphertext product");
    };
    assert_eq!(level.as_const(), Some(5));
}

#[test]
fn ciphertext_division_has_no_overload() {
    let division = Expr::binary(
        span(200, 5),
        Expr::name(span(200, 1), "c"),
        BinOp::Div,
        Expr::name(span(204, 1), "c"),
    );
    let checked = check_program(&program_of(vec![
        bgv_import(0, &["enc"]),
        let_decl(100, "c", Expr::call(span(110, 6), "enc", vec![Expr::int(span(114, 1), 1)])),
        let_decl(190, "bad", division),
    ]));
    let main = checked.module("main").unwrap();
    assert_eq!(main.diagnostics.len(), 1);
    assert_eq!(main.diagnostics[0].kind, DiagnosticKind::NoApplicableOverload);
}
