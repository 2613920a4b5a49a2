#![forbid(unsafe_code)]

//! Semantic core of the ciphra language: context resolution, refined type
//! checking, compile-time natural constraints, and effect propagation.
//! Consumes the AST produced by the external parser and emits a typed,
//! effect-annotated result plus per-module diagnostics for the external
//! code generator.

mod context;
mod diagnostics;
mod effects;
mod nat;
mod pipeline;
mod refine;
mod resolve;
mod sema;
mod types;
mod unify;

pub use context::{Context, ContextRegistry, Contexts, CtxId, SchemeFamily};
pub use diagnostics::{Diag, DiagnosticKind, Diagnostics, Severity};
pub use effects::{Effect, EffectSet};
pub use nat::{Constraint, Nat, NatTable, NatVarId};
pub use pipeline::{check_program, check_program_with, CheckOptions, Checked};
pub use refine::{CipherBinOp, DepthBudget, NoiseModel, Refine};
pub use resolve::{build_graph, ModuleGraph};
pub use sema::{Builtin, CheckedModule, Checker, ExportEntry, FnScheme, ModuleExports};
pub use types::{Type, TypeVarId};
pub use unify::{Unifier, UnifyError};
