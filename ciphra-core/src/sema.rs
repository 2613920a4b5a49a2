#![forbid(unsafe_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ciphra_ast::{
    AssignStmt, BinOp, Block, Decl, Expr, ExprKind, Ident, ImportDecl, LetDecl, Module, NatRef,
    NatRefKind, Span, Stmt, TypeRef, TypeRefKind, UnaryOp, VarDecl,
};

use crate::context::{Contexts, CtxId, SchemeFamily};
use crate::diagnostics::{Diag, DiagnosticKind, Diagnostics};
use crate::effects::{Effect, EffectSet};
use crate::nat::{check_call_constraints, entails, Constraint, Nat, NatTable, NatVarId};
use crate::refine::{CipherBinOp, NoiseModel, Refine};
use crate::types::Type;
use crate::unify::{Unifier, UnifyError};

/// FHE primitives injected by `import fhe.<family> (…) using …`. Their
/// level/noise transfer rules live in the refinement checker rather than in
/// an ordinary signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Builtin {
    Enc,
    Dec,
    Encode,
    Add,
    Mul,
    ModUp,
    ModDown,
    Rescale,
    Keyswitch,
}

impl Builtin {
    fn parse(name: &str) -> Option<Builtin> {
        match name {
            "enc" => Some(Builtin::Enc),
            "dec" => Some(Builtin::Dec),
            "encode" => Some(Builtin::Encode),
            "add" => Some(Builtin::Add),
            "mul" => Some(Builtin::Mul),
            "mod_up" => Some(Builtin::ModUp),
            "mod_down" => Some(Builtin::ModDown),
            "rescale" => Some(Builtin::Rescale),
            "keyswitch" => Some(Builtin::Keyswitch),
            _ => None,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Builtin::Add | Builtin::Mul => 2,
            _ => 1,
        }
    }

    fn effects(&self) -> EffectSet {
        match self {
            Builtin::Enc => EffectSet::of(Effect::Random),
            Builtin::Dec | Builtin::Mul | Builtin::Keyswitch => EffectSet::of(Effect::Keyed),
            _ => EffectSet::PURE,
        }
    }
}

/// A callable known to the module: a local `def`, an imported function, or a
/// context-bound FHE primitive.
#[derive(Clone, Debug)]
pub struct FnScheme {
    pub nat_params: Vec<(String, NatVarId)>,
    pub params: Vec<Type>,
    pub ret: Type,
    pub effects: EffectSet,
    pub where_clauses: Vec<Constraint>,
    pub ret_noise: u32,
    pub builtin: Option<(Builtin, CtxId)>,
    pub span: Span,
}

#[derive(Clone, Debug)]
pub enum ExportEntry {
    Value { ty: Type },
    Nat { value: u64 },
    Fn(FnScheme),
    Ring { dim: u64 },
}

/// The symbols a completed module offers to its importers.
#[derive(Clone, Debug, Default)]
pub struct ModuleExports {
    pub symbols: BTreeMap<String, ExportEntry>,
}

/// Per-module checking result: accumulated diagnostics plus the resolved
/// type and effect annotation for every expression node, keyed by span.
#[derive(Debug)]
pub struct CheckedModule {
    pub name: String,
    pub diagnostics: Vec<Diag>,
    pub types: BTreeMap<(usize, usize), Type>,
    pub effects: BTreeMap<(usize, usize), EffectSet>,
    pub exports: Arc<ModuleExports>,
}

impl CheckedModule {
    /// Only modules without fatal diagnostics are handed to code generation.
    pub fn is_codegen_eligible(&self) -> bool {
        !self
            .diagnostics
            .iter()
            .any(|d| d.severity == crate::diagnostics::Severity::Error)
    }

    pub fn type_at(&self, span: Span) -> Option<&Type> {
        self.types.get(&(span.offset(), span.len()))
    }

    pub fn effects_at(&self, span: Span) -> Option<EffectSet> {
        self.effects.get(&(span.offset(), span.len())).copied()
    }
}

#[derive(Clone, Debug)]
struct Binding {
    ty: Type,
    noise: u32,
    mutable: bool,
    span: Span,
    used: bool,
}

struct FnCtx {
    declared_effects: Option<EffectSet>,
    inferred_effects: EffectSet,
    where_clauses: Vec<Constraint>,
}

#[derive(Clone, Copy)]
enum UnifyPosition {
    Annotation,
    Argument,
    Return,
    Branch,
    Element,
    Index,
}

struct Inferred {
    ty: Type,
    noise: u32,
    effects: EffectSet,
}

impl Inferred {
    fn error() -> Self {
        Self {
            ty: Type::Error,
            noise: 0,
            effects: EffectSet::PURE,
        }
    }

    fn pure(ty: Type) -> Self {
        Self {
            ty,
            noise: 0,
            effects: EffectSet::PURE,
        }
    }
}

/// Checks one module. Owns the module's symbol tables and nat intern table;
/// borrows the frozen context registry and the exports of already-completed
/// modules.
pub struct Checker<'a> {
    contexts: &'a Contexts,
    model: &'a dyn NoiseModel,
    deps: &'a HashMap<String, Arc<ModuleExports>>,
    /// Modules that exist but produced no usable exports (cyclic or failed);
    /// importing from them poisons silently instead of re-reporting.
    unavailable: &'a std::collections::HashSet<String>,
    import_ctxs: &'a [Option<CtxId>],

    nats: NatTable,
    unifier: Unifier,
    diags: Diagnostics,

    functions: HashMap<String, FnScheme>,
    consts: HashMap<String, u64>,
    rings: HashMap<String, u64>,
    module_ctxs: Vec<CtxId>,

    scopes: Vec<HashMap<String, Binding>>,
    rigid_nats: HashMap<String, NatVarId>,
    current: Option<FnCtx>,

    types_out: BTreeMap<(usize, usize), Type>,
    effects_out: BTreeMap<(usize, usize), EffectSet>,
}

impl<'a> Checker<'a> {
    pub fn new(
        contexts: &'a Contexts,
        model: &'a dyn NoiseModel,
        deps: &'a HashMap<String, Arc<ModuleExports>>,
        unavailable: &'a std::collections::HashSet<String>,
        import_ctxs: &'a [Option<CtxId>],
        diags: Diagnostics,
    ) -> Self {
        Self {
            contexts,
            model,
            deps,
            unavailable,
            import_ctxs,
            nats: NatTable::new(),
            unifier: Unifier::new(),
            diags,
            functions: HashMap::new(),
            consts: HashMap::new(),
            rings: HashMap::new(),
            module_ctxs: Vec::new(),
            scopes: vec![HashMap::new()],
            rigid_nats: HashMap::new(),
            current: None,
            types_out: BTreeMap::new(),
            effects_out: BTreeMap::new(),
        }
    }

    pub fn check_module(mut self, module: &Module) -> CheckedModule {
        // Imports and headers first, then signatures, then bodies in source
        // order.
        let mut import_index = 0;
        for decl in &module.decls {
            if let Decl::Import(import) = decl {
                self.process_import(import, import_index);
                import_index += 1;
            }
        }

        for decl in &module.decls {
            match decl {
                Decl::Const(c) => self.register_const(c),
                Decl::Ring(r) => self.register_ring(r),
                Decl::Def(d) => self.register_def(d),
                _ => {}
            }
        }

        for decl in &module.decls {
            if self.diags.overflowed() {
                break;
            }
            match decl {
                Decl::Import(_) | Decl::Const(_) | Decl::Ring(_) => {}
                Decl::Let(l) => self.check_let(l),
                Decl::Var(v) => self.check_var(v),
                Decl::Def(d) => self.check_def_body(d),
            }
        }

        let exports = self.collect_exports(module);

        // Final substitution pass so recorded node types are concrete.
        let types = self
            .types_out
            .iter()
            .map(|(k, t)| (*k, self.unifier.resolve(t)))
            .collect();

        CheckedModule {
            name: module.name.node.clone(),
            diagnostics: self.diags.into_sorted(),
            types,
            effects: self.effects_out,
            exports: Arc::new(exports),
        }
    }

    // ---- imports -------------------------------------------------------

    fn process_import(&mut self, import: &ImportDecl, index: usize) {
        let path: Vec<&str> = import.path.iter().map(|p| p.node.as_str()).collect();
        if path.first() == Some(&"fhe") {
            self.process_fhe_import(import, index, &path);
            return;
        }

        let module_name = path.join(".");
        let Some(exports) = self.deps.get(&module_name) else {
            // A module that failed or sits on an import cycle was already
            // reported; only a genuinely unknown name is a fresh error.
            if !self.unavailable.contains(&module_name) {
                self.diags.error(
                    DiagnosticKind::UnboundName,
                    import.span,
                    format!("unknown module '{module_name}'"),
                );
            }
            self.poison_items(&import.items);
            return;
        };
        let exports = Arc::clone(exports);
        for item in &import.items {
            match exports.symbols.get(&item.node) {
                Some(ExportEntry::Value { ty }) => {
                    let ty = ty.clone();
                    self.define(item, ty, 1, false);
                }
                Some(ExportEntry::Nat { value }) => {
                    self.consts.insert(item.node.clone(), *value);
                }
                Some(ExportEntry::Ring { dim }) => {
                    self.rings.insert(item.node.clone(), *dim);
                }
                Some(ExportEntry::Fn(scheme)) => {
                    let renamed = self.rename_scheme(scheme);
                    self.functions.insert(item.node.clone(), renamed);
                }
                None => {
                    self.diags.error(
                        DiagnosticKind::UnboundName,
                        item.span,
                        format!("module '{module_name}' does not export '{}'", item.node),
                    );
                    self.poison_items(std::slice::from_ref(item));
                }
            }
        }
    }

    fn process_fhe_import(&mut self, import: &ImportDecl, index: usize, path: &[&str]) {
        let Some(ctx) = self.import_ctxs.get(index).copied().flatten() else {
            if import.using.is_none() {
                self.diags.error_help(
                    DiagnosticKind::MissingParameter,
                    import.span,
                    "importing an fhe namespace requires a `using` clause",
                    "for example: using BGV(q=2^60, p=257, n=2^15, λ=128)",
                );
            }
            // A failed `using` clause was already reported during context
            // resolution; either way the items are unusable.
            self.poison_items(&import.items);
            return;
        };

        if let Some(family_seg) = path.get(1) {
            let declared = self.contexts.get(ctx).family;
            let matches = SchemeFamily::parse(&family_seg.to_uppercase())
                .map(|f| f == declared)
                .unwrap_or(false);
            if !matches {
                self.diags.error(
                    DiagnosticKind::InvalidParameter,
                    import.span,
                    format!(
                        "namespace 'fhe.{family_seg}' does not match the {} context of its \
                         using clause",
                        declared.display()
                    ),
                );
                self.poison_items(&import.items);
                return;
            }
        }

        if !self.module_ctxs.contains(&ctx) {
            self.module_ctxs.push(ctx);
        }

        for item in &import.items {
            let Some(builtin) = Builtin::parse(&item.node) else {
                self.diags.error_help(
                    DiagnosticKind::UnboundName,
                    item.span,
                    format!("'{}' is not an fhe primitive", item.node),
                    "available: enc, dec, encode, add, mul, mod_up, mod_down, rescale, keyswitch",
                );
                continue;
            };
            self.functions.insert(
                item.node.clone(),
                FnScheme {
                    nat_params: Vec::new(),
                    params: Vec::new(),
                    ret: Type::Error,
                    effects: builtin.effects(),
                    where_clauses: Vec::new(),
                    ret_noise: 1,
                    builtin: Some((builtin, ctx)),
                    span: item.span,
                },
            );
        }
    }

    fn poison_items(&mut self, items: &[Ident]) {
        for item in items {
            let span = item.span;
            self.scopes[0].insert(
                item.node.clone(),
                Binding {
                    ty: Type::Error,
                    noise: 0,
                    mutable: false,
                    span,
                    used: true,
                },
            );
        }
    }

    /// Re-intern an imported scheme's symbolic naturals into this module's
    /// table.
    fn rename_scheme(&mut self, scheme: &FnScheme) -> FnScheme {
        let mut map = HashMap::new();
        let mut nat_params = Vec::new();
        for (name, old_id) in &scheme.nat_params {
            let new_id = self.nats.fresh(name);
            map.insert(*old_id, Nat::Sym(new_id));
            nat_params.push((name.clone(), new_id));
        }
        FnScheme {
            nat_params,
            params: scheme.params.iter().map(|t| t.subst_nats(&map)).collect(),
            ret: scheme.ret.subst_nats(&map),
            effects: scheme.effects,
            where_clauses: scheme.where_clauses.iter().map(|c| c.subst(&map)).collect(),
            ret_noise: scheme.ret_noise,
            builtin: scheme.builtin,
            span: scheme.span,
        }
    }

    // ---- declaration headers ------------------------------------------

    fn register_const(&mut self, decl: &ciphra_ast::ConstDecl) {
        if self.consts.contains_key(&decl.name.node) || self.functions.contains_key(&decl.name.node)
        {
            self.diags.error(
                DiagnosticKind::DuplicateBinding,
                decl.name.span,
                format!("'{}' is already bound in this module", decl.name.node),
            );
            return;
        }
        let Some(value) = self.eval_nat_ref(&decl.value) else {
            return;
        };
        self.consts.insert(decl.name.node.clone(), value);
    }

    fn register_ring(&mut self, decl: &ciphra_ast::RingDecl) {
        let Some(dim) = self.eval_nat_ref(&decl.dimension) else {
            return;
        };
        if !dim.is_power_of_two() {
            self.diags.error(
                DiagnosticKind::InvalidParameter,
                decl.dimension.span,
                format!("ring dimension {dim} must be a power of two"),
            );
            return;
        }
        if self.rings.insert(decl.name.node.clone(), dim).is_some() {
            self.diags.error(
                DiagnosticKind::DuplicateBinding,
                decl.name.span,
                format!("ring '{}' is already declared", decl.name.node),
            );
        }
    }

    fn register_def(&mut self, decl: &ciphra_ast::DefDecl) {
        if self.functions.contains_key(&decl.name.node) {
            self.diags.error(
                DiagnosticKind::DuplicateBinding,
                decl.name.span,
                format!("'{}' is already defined", decl.name.node),
            );
            return;
        }

        self.rigid_nats.clear();
        let mut nat_params = Vec::new();
        for p in &decl.nat_params {
            let id = self.nats.fresh(&p.node);
            if self.rigid_nats.insert(p.node.clone(), id).is_some() {
                self.diags.error(
                    DiagnosticKind::DuplicateBinding,
                    p.span,
                    format!("duplicate level parameter '{}'", p.node),
                );
            }
            nat_params.push((p.node.clone(), id));
        }

        let params: Vec<Type> = decl
            .params
            .iter()
            .map(|p| self.resolve_type_ref(&p.ty))
            .collect();
        let ret = match &decl.ret {
            Some(tr) => self.resolve_type_ref(tr),
            None => self.unifier.fresh_var(),
        };

        let mut where_clauses = Vec::new();
        for clause in &decl.where_clauses {
            let (Some(lhs), Some(rhs)) = (
                self.resolve_nat_expr(&clause.lhs),
                self.resolve_nat_expr(&clause.rhs),
            ) else {
                continue;
            };
            where_clauses.push(Constraint::new(clause.span, lhs, clause.op, rhs, &self.nats));
        }

        let effects = decl
            .effects
            .as_ref()
            .map(|names| EffectSet::from_annotation(names));

        self.functions.insert(
            decl.name.node.clone(),
            FnScheme {
                nat_params,
                params,
                ret,
                // Callers rely on the declared annotation; unannotated
                // functions are contractually pure.
                effects: effects.unwrap_or(EffectSet::PURE),
                where_clauses,
                ret_noise: 1,
                builtin: None,
                span: decl.span,
            },
        );
        self.rigid_nats.clear();
    }

    // ---- declaration bodies -------------------------------------------

    fn check_let(&mut self, decl: &LetDecl) {
        let inferred = match &decl.ty {
            Some(tr) => {
                let expected = self.resolve_type_ref(tr);
                self.check_expr(&decl.init, &expected, UnifyPosition::Annotation)
            }
            None => self.infer_expr(&decl.init),
        };
        for name in &decl.names {
            self.define(name, inferred.ty.clone(), inferred.noise, false);
        }
    }

    fn check_var(&mut self, decl: &VarDecl) {
        let inferred = match &decl.ty {
            Some(tr) => {
                let expected = self.resolve_type_ref(tr);
                self.check_expr(&decl.init, &expected, UnifyPosition::Annotation)
            }
            None => self.infer_expr(&decl.init),
        };
        self.define(&decl.name, inferred.ty, inferred.noise, true);
    }

    fn check_def_body(&mut self, decl: &ciphra_ast::DefDecl) {
        let Some(scheme) = self.functions.get(&decl.name.node).cloned() else {
            return;
        };
        if scheme.params.len() != decl.params.len() {
            // Header registration failed part-way; already reported.
            return;
        }

        self.rigid_nats.clear();
        for (name, id) in &scheme.nat_params {
            self.rigid_nats.insert(name.clone(), *id);
        }

        self.push_scope();
        for (param, ty) in decl.params.iter().zip(scheme.params.iter()) {
            let noise = self.entry_noise(ty);
            self.define_param(&param.name, ty.clone(), noise);
        }

        self.current = Some(FnCtx {
            declared_effects: decl.effects.as_ref().map(|n| EffectSet::from_annotation(n)),
            inferred_effects: EffectSet::PURE,
            where_clauses: scheme.where_clauses.clone(),
        });

        let body = self.check_block(&decl.body);

        // The declared result level is contractual; mismatches surface at
        // the final-expression position.
        let ret_span = decl
            .body
            .tail
            .as_ref()
            .map(|e| e.span)
            .unwrap_or(decl.body.span);
        if let Err(err) = self.unifier.unify(&scheme.ret, &body.ty) {
            self.report_unify(err, ret_span, UnifyPosition::Return);
        }

        let ctx = self.current.take().expect("function context");
        match ctx.declared_effects {
            None => {
                if !ctx.inferred_effects.is_pure() {
                    self.diags.error_help(
                        DiagnosticKind::MissingEffectAnnotation,
                        decl.name.span,
                        format!(
                            "'{}' uses {} but has no effect annotation",
                            decl.name.node,
                            ctx.inferred_effects.display()
                        ),
                        format!("annotate the definition with {}", ctx.inferred_effects.display()),
                    );
                }
            }
            Some(declared) => {
                if !ctx.inferred_effects.is_subset_of(&declared) {
                    self.diags.error(
                        DiagnosticKind::EffectAnnotationTooNarrow,
                        decl.name.span,
                        format!(
                            "'{}' is annotated {} but its body requires {}",
                            decl.name.node,
                            declared.display(),
                            ctx.inferred_effects.display()
                        ),
                    );
                }
            }
        }

        self.pop_scope();
        self.rigid_nats.clear();

        // Record what the body actually produced for callers' noise
        // tracking, and keep recovery callers seeing the inferred effects.
        if let Some(scheme) = self.functions.get_mut(&decl.name.node) {
            scheme.ret_noise = body.noise;
            if decl.effects.is_none() && !ctx.inferred_effects.is_pure() {
                scheme.effects = ctx.inferred_effects;
            }
        }
    }

    fn entry_noise(&self, ty: &Type) -> u32 {
        match ty {
            Type::Cipher { ctx, level, .. } => {
                let level = level.as_const().unwrap_or(0) as u32;
                self.model.baseline(self.contexts.get(*ctx), level)
            }
            _ => 0,
        }
    }

    // ---- exports -------------------------------------------------------

    fn collect_exports(&mut self, module: &Module) -> ModuleExports {
        let mut exports = ModuleExports::default();
        for name in &module.exports {
            if let Some(scheme) = self.functions.get(&name.node) {
                let mut scheme = scheme.clone();
                let params: Vec<Type> =
                    scheme.params.iter().map(|t| self.unifier.resolve(t)).collect();
                scheme.params = params;
                scheme.ret = self.unifier.resolve(&scheme.ret);
                exports
                    .symbols
                    .insert(name.node.clone(), ExportEntry::Fn(scheme));
            } else if let Some(value) = self.consts.get(&name.node) {
                exports
                    .symbols
                    .insert(name.node.clone(), ExportEntry::Nat { value: *value });
            } else if let Some(dim) = self.rings.get(&name.node) {
                exports
                    .symbols
                    .insert(name.node.clone(), ExportEntry::Ring { dim: *dim });
            } else if let Some(binding) = self.scopes[0].get(&name.node) {
                let ty = self.unifier.resolve(&binding.ty);
                exports
                    .symbols
                    .insert(name.node.clone(), ExportEntry::Value { ty });
            } else {
                self.diags.error(
                    DiagnosticKind::UnknownExport,
                    name.span,
                    format!("'{}' is exported but never declared", name.node),
                );
            }
        }
        exports
    }

    // ---- scopes --------------------------------------------------------

    fn push_scope(&mut self) {
        self.scopes.push(HashMap::new());
    }

    fn pop_scope(&mut self) {
        let scope = self.scopes.pop().expect("scope underflow");
        for (name, binding) in scope {
            if !binding.used && !name.starts_with('_') {
                self.diags.warn(
                    DiagnosticKind::UnusedSymbol,
                    binding.span,
                    format!("'{name}' is never used"),
                );
            }
        }
    }

    fn define(&mut self, name: &Ident, ty: Type, noise: u32, mutable: bool) {
        self.define_inner(name, ty, noise, mutable, false);
    }

    /// Parameters are part of the signature contract and never warn as
    /// unused.
    fn define_param(&mut self, name: &Ident, ty: Type, noise: u32) {
        self.define_inner(name, ty, noise, false, true);
    }

    fn define_inner(&mut self, name: &Ident, ty: Type, noise: u32, mutable: bool, used: bool) {
        let scope = self.scopes.last_mut().expect("scope underflow");
        if scope.contains_key(&name.node) {
            self.diags.error(
                DiagnosticKind::DuplicateBinding,
                name.span,
                format!("'{}' is already bound in this scope", name.node),
            );
            return;
        }
        scope.insert(
            name.node.clone(),
            Binding {
                ty,
                noise,
                mutable,
                span: name.span,
                used,
            },
        );
    }

    fn lookup(&mut self, name: &str) -> Option<Binding> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(binding) = scope.get_mut(name) {
                binding.used = true;
                return Some(binding.clone());
            }
        }
        None
    }

    // ---- type references ----------------------------------------------

    fn resolve_type_ref(&mut self, tr: &TypeRef) -> Type {
        match &tr.kind {
            TypeRefKind::Name { name, nat_args } => match name.node.as_str() {
                "Int" => Type::Int,
                "Bool" => Type::Bool,
                "Unit" => Type::Unit,
                "CT" => self.resolve_cipher_ref(tr.span, name, nat_args, false),
                "PT" => self.resolve_cipher_ref(tr.span, name, nat_args, true),
                other => {
                    if let Some(dim) = self.rings.get(other) {
                        return Type::Ring {
                            name: other.to_string(),
                            dim: *dim,
                        };
                    }
                    self.diags.error(
                        DiagnosticKind::UnboundName,
                        name.span,
                        format!("unknown type '{other}'"),
                    );
                    Type::Error
                }
            },
            TypeRefKind::Vector { elem, len } => {
                let elem = self.resolve_type_ref(elem);
                let Some(len) = self.resolve_nat_expr(len) else {
                    return Type::Error;
                };
                Type::Vector {
                    elem: Box::new(elem),
                    len,
                }
            }
            TypeRefKind::Tuple(items) => {
                Type::Tuple(items.iter().map(|t| self.resolve_type_ref(t)).collect())
            }
            TypeRefKind::Record(fields) => Type::record(
                fields
                    .iter()
                    .map(|(n, t)| (n.node.clone(), self.resolve_type_ref(t)))
                    .collect(),
            ),
            TypeRefKind::Fn {
                params,
                ret,
                effects,
            } => Type::Fn {
                params: params.iter().map(|t| self.resolve_type_ref(t)).collect(),
                ret: Box::new(self.resolve_type_ref(ret)),
                effects: EffectSet::from_annotation(effects),
            },
        }
    }

    fn resolve_cipher_ref(
        &mut self,
        span: Span,
        name: &Ident,
        nat_args: &[NatRef],
        plain: bool,
    ) -> Type {
        let Some(ctx) = self.scoped_context(span) else {
            return Type::Error;
        };
        let level = match nat_args.first() {
            Some(nr) => match self.resolve_nat_expr(nr) {
                Some(level) => level,
                None => return Type::Error,
            },
            None => {
                self.diags.error_help(
                    DiagnosticKind::TypeMismatch,
                    name.span,
                    format!("{} requires an explicit level argument", name.node),
                    "levels are never implicit: write CT[L] or CT[3]",
                );
                return Type::Error;
            }
        };
        if nat_args.len() > 1 {
            self.diags.error(
                DiagnosticKind::ArityMismatch,
                span,
                format!("{} takes exactly one level argument", name.node),
            );
        }
        if plain {
            Type::Plain { ctx, level }
        } else {
            let scale = self
                .contexts
                .get(ctx)
                .scale_bits
                .map(|bits| Nat::Const(bits as u64));
            Type::Cipher {
                ctx,
                level,
                scale,
                raised: 0,
            }
        }
    }

    fn scoped_context(&mut self, span: Span) -> Option<CtxId> {
        match self.module_ctxs.len() {
            0 => {
                self.diags.error_help(
                    DiagnosticKind::UnboundName,
                    span,
                    "no FHE context is in scope",
                    "import an fhe namespace with a using clause first",
                );
                None
            }
            1 => Some(self.module_ctxs[0]),
            _ => {
                self.diags.error_help(
                    DiagnosticKind::AmbiguousContext,
                    span,
                    "multiple FHE contexts are in scope; the ciphertext type is ambiguous",
                    "split the declarations into modules with one context each",
                );
                None
            }
        }
    }

    /// Nat expression in a type or `where` position: symbols resolve to the
    /// declaration's level parameters or module consts.
    fn resolve_nat_expr(&mut self, nr: &NatRef) -> Option<Nat> {
        match &nr.kind {
            NatRefKind::Num(v) => Some(Nat::Const(*v)),
            NatRefKind::Pow2(exp) if *exp < 63 => Some(Nat::Const(1u64 << exp)),
            NatRefKind::Pow2(_) => {
                self.diags.error(
                    DiagnosticKind::InvalidParameter,
                    nr.span,
                    "power-of-two literal is too large for a type-level natural",
                );
                None
            }
            NatRefKind::Sym(name) => {
                if let Some(id) = self.rigid_nats.get(&name.node) {
                    return Some(Nat::Sym(*id));
                }
                if let Some(value) = self.consts.get(&name.node) {
                    return Some(Nat::Const(*value));
                }
                self.diags.error(
                    DiagnosticKind::UnboundName,
                    name.span,
                    format!("unknown type-level natural '{}'", name.node),
                );
                None
            }
            NatRefKind::Add(a, b) => Some(
                Nat::Add(
                    Box::new(self.resolve_nat_expr(a)?),
                    Box::new(self.resolve_nat_expr(b)?),
                )
                .fold(),
            ),
            NatRefKind::Sub(a, b) => Some(
                Nat::Sub(
                    Box::new(self.resolve_nat_expr(a)?),
                    Box::new(self.resolve_nat_expr(b)?),
                )
                .fold(),
            ),
        }
    }

    /// Fully concrete nat (scheme parameters, const initializers).
    fn eval_nat_ref(&mut self, nr: &NatRef) -> Option<u64> {
        match self.resolve_nat_expr(nr)? {
            Nat::Const(v) => Some(v),
            other => {
                self.diags.error(
                    DiagnosticKind::UnderconstrainedNatural,
                    nr.span,
                    format!(
                        "expected a constant here, found symbolic '{}'",
                        other.display(&self.nats)
                    ),
                );
                None
            }
        }
    }

    // ---- blocks and statements ----------------------------------------

    fn check_block(&mut self, block: &Block) -> Inferred {
        self.push_scope();
        let mut effects = EffectSet::PURE;
        for stmt in &block.stmts {
            if self.diags.overflowed() {
                break;
            }
            effects = effects.union(self.check_stmt(stmt));
        }
        let result = match &block.tail {
            Some(expr) => self.infer_expr(expr),
            None => Inferred::pure(Type::Unit),
        };
        self.pop_scope();
        Inferred {
            ty: result.ty,
            noise: result.noise,
            effects: effects.union(result.effects),
        }
    }

    fn check_stmt(&mut self, stmt: &Stmt) -> EffectSet {
        match stmt {
            Stmt::Let(decl) => self.stmt_let(decl),
            Stmt::Var(decl) => {
                let inferred = match &decl.ty {
                    Some(tr) => {
                        let expected = self.resolve_type_ref(tr);
                        self.check_expr(&decl.init, &expected, UnifyPosition::Annotation)
                    }
                    None => self.infer_expr(&decl.init),
                };
                let effects = inferred.effects;
                self.define(&decl.name, inferred.ty, inferred.noise, true);
                effects
            }
            Stmt::Assign(assign) => self.check_assign(assign),
            Stmt::Expr(expr) => {
                // Statement position: a conditional may omit its else arm
                // because the result is discarded.
                if let ExprKind::If { .. } = &expr.kind {
                    self.infer_if(expr, false).effects
                } else {
                    self.infer_expr(expr).effects
                }
            }
        }
    }

    fn stmt_let(&mut self, decl: &LetDecl) -> EffectSet {
        let inferred = match &decl.ty {
            Some(tr) => {
                let expected = self.resolve_type_ref(tr);
                self.check_expr(&decl.init, &expected, UnifyPosition::Annotation)
            }
            None => self.infer_expr(&decl.init),
        };
        let effects = inferred.effects;
        for name in &decl.names {
            self.define(name, inferred.ty.clone(), inferred.noise, false);
        }
        effects
    }

    fn check_assign(&mut self, assign: &AssignStmt) -> EffectSet {
        let Some(binding) = self.lookup(&assign.target.node) else {
            self.diags.error(
                DiagnosticKind::UnboundName,
                assign.target.span,
                format!("unknown identifier '{}'", assign.target.node),
            );
            return self.infer_expr(&assign.expr).effects;
        };
        if !binding.mutable {
            self.diags.error_help(
                DiagnosticKind::AssignToImmutable,
                assign.target.span,
                format!("cannot assign to immutable binding '{}'", assign.target.node),
                "declare it with `var` to allow reassignment",
            );
        }
        // A `var`'s value may change but its type does not.
        let inferred = self.check_expr(&assign.expr, &binding.ty.clone(), UnifyPosition::Annotation);
        for scope in self.scopes.iter_mut().rev() {
            if let Some(b) = scope.get_mut(&assign.target.node) {
                b.noise = inferred.noise;
                break;
            }
        }
        inferred.effects
    }

    // ---- expressions ---------------------------------------------------

    fn record_node(&mut self, span: Span, inferred: &Inferred) {
        self.types_out
            .insert((span.offset(), span.len()), inferred.ty.clone());
        self.effects_out
            .insert((span.offset(), span.len()), inferred.effects);
    }

    fn check_expr(&mut self, expr: &Expr, expected: &Type, pos: UnifyPosition) -> Inferred {
        // Forms that profit from pushing the expectation inward.
        match &expr.kind {
            ExprKind::If { .. } => {
                let inferred = self.infer_if(expr, true);
                if let Err(err) = self.unifier.unify(expected, &inferred.ty) {
                    self.report_unify(err, expr.span, pos);
                    return Inferred::error();
                }
                inferred
            }
            _ => {
                let inferred = self.infer_expr(expr);
                if let Err(err) = self.unifier.unify(expected, &inferred.ty) {
                    self.report_unify(err, expr.span, pos);
                    return Inferred {
                        ty: Type::Error,
                        noise: 0,
                        effects: inferred.effects,
                    };
                }
                inferred
            }
        }
    }

    fn infer_expr(&mut self, expr: &Expr) -> Inferred {
        let inferred = self.infer_expr_inner(expr);
        self.record_node(expr.span, &inferred);
        inferred
    }

    fn infer_expr_inner(&mut self, expr: &Expr) -> Inferred {
        match &expr.kind {
            ExprKind::IntLit(_) => Inferred::pure(Type::Int),
            ExprKind::BoolLit(_) => Inferred::pure(Type::Bool),
            ExprKind::Ident(id) => self.infer_ident(id),
            ExprKind::Unary { op, expr: inner } => self.infer_unary(expr.span, *op, inner),
            ExprKind::Binary { left, op, right } => self.infer_binary(expr.span, left, *op, right),
            ExprKind::Call {
                callee,
                nat_args,
                args,
            } => self.infer_call(expr.span, callee, nat_args, args),
            ExprKind::If { .. } => self.infer_if(expr, true),
            ExprKind::Comprehension { body, binder, iter } => {
                self.infer_comprehension(body, binder, iter)
            }
            ExprKind::Pipe { left, right } => {
                // `x |> f` is `f(x)`.
                let piped = [left.as_ref()];
                self.infer_call_with_args(expr.span, right, &[], &piped)
            }
            ExprKind::Tuple(items) => {
                let mut tys = Vec::with_capacity(items.len());
                let mut effects = EffectSet::PURE;
                let mut noise = 0;
                for item in items {
                    let inferred = self.infer_expr(item);
                    effects = effects.union(inferred.effects);
                    noise = noise.max(inferred.noise);
                    tys.push(inferred.ty);
                }
                Inferred {
                    ty: Type::Tuple(tys),
                    noise,
                    effects,
                }
            }
            ExprKind::RecordLit { fields } => self.infer_record(fields),
            ExprKind::VectorLit(items) => self.infer_vector(items),
            ExprKind::Index { base, index } => self.infer_index(base, index),
        }
    }

    fn infer_ident(&mut self, id: &Ident) -> Inferred {
        if let Some(binding) = self.lookup(&id.node) {
            return Inferred {
                ty: binding.ty,
                noise: binding.noise,
                effects: EffectSet::PURE,
            };
        }
        if let Some(scheme) = self.functions.get(&id.node) {
            if scheme.builtin.is_none() && scheme.nat_params.is_empty() {
                return Inferred::pure(Type::Fn {
                    params: scheme.params.clone(),
                    ret: Box::new(scheme.ret.clone()),
                    effects: scheme.effects,
                });
            }
            self.diags.error(
                DiagnosticKind::TypeMismatch,
                id.span,
                format!(
                    "'{}' is level-polymorphic and can only be called directly",
                    id.node
                ),
            );
            return Inferred::error();
        }
        if self.consts.contains_key(&id.node) {
            return Inferred::pure(Type::Int);
        }
        self.diags.error(
            DiagnosticKind::UnboundName,
            id.span,
            format!("unknown identifier '{}'", id.node),
        );
        Inferred::error()
    }

    fn infer_unary(&mut self, span: Span, op: UnaryOp, inner: &Expr) -> Inferred {
        let operand = self.infer_expr(inner);
        if operand.ty.is_error() {
            return Inferred::error();
        }
        let expected = match op {
            UnaryOp::Neg => Type::Int,
            UnaryOp::Not => Type::Bool,
        };
        if self.unifier.unify(&expected, &operand.ty).is_err() {
            let shown = self.unifier.resolve(&operand.ty).display(&self.nats);
            self.diags.error(
                DiagnosticKind::NoApplicableOverload,
                span,
                format!(
                    "unary '{}' is not defined for {shown}",
                    match op {
                        UnaryOp::Neg => "-",
                        UnaryOp::Not => "not",
                    }
                ),
            );
            return Inferred::error();
        }
        Inferred {
            ty: expected,
            noise: 0,
            effects: operand.effects,
        }
    }

    fn infer_binary(&mut self, span: Span, left: &Expr, op: BinOp, right: &Expr) -> Inferred {
        let l = self.infer_expr(left);
        let r = self.infer_expr(right);
        let effects = l.effects.union(r.effects);
        let lt = self.unifier.resolve(&l.ty);
        let rt = self.unifier.resolve(&r.ty);
        if lt.is_error() || rt.is_error() {
            return Inferred {
                ty: Type::Error,
                noise: 0,
                effects,
            };
        }

        match op {
            BinOp::And | BinOp::Or => {
                if lt != Type::Bool || rt != Type::Bool {
                    self.no_overload(span, op, &lt, &rt);
                    return Inferred::error();
                }
                Inferred {
                    ty: Type::Bool,
                    noise: 0,
                    effects,
                }
            }
            BinOp::Eq | BinOp::Ne => {
                let comparable = matches!(
                    (&lt, &rt),
                    (Type::Int, Type::Int) | (Type::Bool, Type::Bool)
                );
                if !comparable {
                    self.no_overload(span, op, &lt, &rt);
                    return Inferred::error();
                }
                Inferred {
                    ty: Type::Bool,
                    noise: 0,
                    effects,
                }
            }
            BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
                if lt != Type::Int || rt != Type::Int {
                    self.no_overload(span, op, &lt, &rt);
                    return Inferred::error();
                }
                Inferred {
                    ty: Type::Bool,
                    noise: 0,
                    effects,
                }
            }
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => {
                self.infer_arith(span, op, &lt, l.noise, &rt, r.noise, effects)
            }
        }
    }

    fn infer_arith(
        &mut self,
        span: Span,
        op: BinOp,
        lt: &Type,
        lnoise: u32,
        rt: &Type,
        rnoise: u32,
        effects: EffectSet,
    ) -> Inferred {
        let cipher_op = match op {
            BinOp::Add => CipherBinOp::Add,
            BinOp::Sub => CipherBinOp::Sub,
            BinOp::Mul => CipherBinOp::Mul,
            _ => CipherBinOp::Add, // Div never reaches the cipher paths below
        };
        let refine = Refine {
            contexts: self.contexts,
            model: self.model,
        };

        match (lt, rt) {
            (Type::Int, Type::Int) => Inferred {
                ty: Type::Int,
                noise: 0,
                effects,
            },
            (Type::Cipher { .. }, Type::Cipher { .. }) => {
                if op == BinOp::Div {
                    self.no_overload(span, op, lt, rt);
                    return Inferred::error();
                }
                let (ty, noise) =
                    refine.combine(cipher_op, lt, lnoise, rt, rnoise, span, &self.nats, &mut self.diags);
                let effects = if op == BinOp::Mul {
                    // Ciphertext multiplication goes through the evaluation
                    // key.
                    self.note_effect(Effect::Keyed);
                    effects.union(EffectSet::of(Effect::Keyed))
                } else {
                    effects
                };
                Inferred { ty, noise, effects }
            }
            (Type::Cipher { .. }, Type::Int) | (Type::Int, Type::Cipher { .. }) => {
                if op == BinOp::Div {
                    self.no_overload(span, op, lt, rt);
                    return Inferred::error();
                }
                let (cipher, cnoise) = if matches!(lt, Type::Cipher { .. }) {
                    (lt, lnoise)
                } else {
                    (rt, rnoise)
                };
                let (ty, noise) =
                    refine.combine_plain(cipher_op, cipher, cnoise, span, &self.nats, &mut self.diags);
                Inferred { ty, noise, effects }
            }
            (Type::Cipher { .. }, Type::Plain { .. }) | (Type::Plain { .. }, Type::Cipher { .. }) => {
                if op == BinOp::Div {
                    self.no_overload(span, op, lt, rt);
                    return Inferred::error();
                }
                let (cipher, cnoise, plain) = if matches!(lt, Type::Cipher { .. }) {
                    (lt, lnoise, rt)
                } else {
                    (rt, rnoise, lt)
                };
                if !self.plain_compatible(cipher, plain, span) {
                    return Inferred::error();
                }
                let (ty, noise) =
                    refine.combine_plain(cipher_op, cipher, cnoise, span, &self.nats, &mut self.diags);
                Inferred { ty, noise, effects }
            }
            _ => {
                self.no_overload(span, op, lt, rt);
                Inferred::error()
            }
        }
    }

    fn plain_compatible(&mut self, cipher: &Type, plain: &Type, span: Span) -> bool {
        let (
            Type::Cipher {
                ctx: cc, level: cl, ..
            },
            Type::Plain {
                ctx: pc, level: pl, ..
            },
        ) = (cipher, plain)
        else {
            return false;
        };
        if cc != pc {
            self.diags.error(
                DiagnosticKind::IncompatibleModuli,
                span,
                format!(
                    "plaintext was encoded under {} but the ciphertext uses {}",
                    self.contexts.get(*pc).display(),
                    self.contexts.get(*cc).display()
                ),
            );
            return false;
        }
        // Encoded plaintexts with a flexible level snap to the ciphertext's.
        if self.unifier_unify_nat_levels(cl, pl).is_err() {
            self.diags.error(
                DiagnosticKind::IncompatibleLevels,
                span,
                format!(
                    "plaintext level {} does not match ciphertext level {}",
                    pl.display(&self.nats),
                    cl.display(&self.nats)
                ),
            );
            return false;
        }
        true
    }

    fn unifier_unify_nat_levels(&mut self, a: &Nat, b: &Nat) -> Result<(), ()> {
        // Route through full cipher unification to reuse the flexible-nat
        // binding rules.
        let probe_a = Type::Plain {
            ctx: CtxId(u32::MAX),
            level: a.clone(),
        };
        let probe_b = Type::Plain {
            ctx: CtxId(u32::MAX),
            level: b.clone(),
        };
        self.unifier.unify(&probe_a, &probe_b).map_err(|_| ())
    }

    fn no_overload(&mut self, span: Span, op: BinOp, lt: &Type, rt: &Type) {
        let op_text = match op {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Le => "<=",
            BinOp::Ge => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
        };
        let lhs = lt.display(&self.nats);
        let rhs = rt.display(&self.nats);
        self.diags.error(
            DiagnosticKind::NoApplicableOverload,
            span,
            format!("operator '{op_text}' is not defined for {lhs} and {rhs}"),
        );
    }

    fn note_effect(&mut self, effect: Effect) {
        if let Some(current) = &mut self.current {
            current.inferred_effects.insert(effect);
        }
    }

    fn note_effects(&mut self, effects: EffectSet) {
        if let Some(current) = &mut self.current {
            current.inferred_effects = current.inferred_effects.union(effects);
        }
    }

    // ---- calls ---------------------------------------------------------

    fn infer_call(
        &mut self,
        span: Span,
        callee: &Expr,
        nat_args: &[NatRef],
        args: &[Expr],
    ) -> Inferred {
        let arg_refs: Vec<&Expr> = args.iter().collect();
        self.infer_call_refs(span, callee, nat_args, &arg_refs)
    }

    fn infer_call_with_args(
        &mut self,
        span: Span,
        callee: &Expr,
        nat_args: &[NatRef],
        args: &[&Expr],
    ) -> Inferred {
        self.infer_call_refs(span, callee, nat_args, args)
    }

    fn infer_call_refs(
        &mut self,
        span: Span,
        callee: &Expr,
        nat_args: &[NatRef],
        args: &[&Expr],
    ) -> Inferred {
        if let ExprKind::Ident(id) = &callee.kind {
            // Local bindings shadow module functions.
            let is_local = self.scopes.iter().rev().any(|s| s.contains_key(&id.node));
            if !is_local {
                if let Some(scheme) = self.functions.get(&id.node).cloned() {
                    return match scheme.builtin {
                        Some((builtin, ctx)) => {
                            self.infer_builtin_call(span, id, builtin, ctx, args)
                        }
                        None => self.infer_scheme_call(span, &scheme, nat_args, args),
                    };
                }
            }
        }

        let callee_ty = {
            let inferred = self.infer_expr(callee);
            self.unifier.resolve(&inferred.ty)
        };
        match callee_ty {
            Type::Error => {
                for arg in args {
                    let _ = self.infer_expr(arg);
                }
                Inferred::error()
            }
            Type::Fn {
                params,
                ret,
                effects,
            } => {
                if params.len() != args.len() {
                    self.diags.error(
                        DiagnosticKind::ArityMismatch,
                        span,
                        format!("expected {} arguments, got {}", params.len(), args.len()),
                    );
                    return Inferred::error();
                }
                let mut call_effects = effects;
                for (arg, expected) in args.iter().zip(params.iter()) {
                    let inferred = self.check_expr(arg, expected, UnifyPosition::Argument);
                    call_effects = call_effects.union(inferred.effects);
                }
                self.note_effects(effects);
                Inferred {
                    ty: self.unifier.resolve(&ret),
                    noise: 1,
                    effects: call_effects,
                }
            }
            other => {
                let shown = other.display(&self.nats);
                self.diags.error(
                    DiagnosticKind::NoApplicableOverload,
                    callee.span,
                    format!("{shown} is not callable"),
                );
                for arg in args {
                    let _ = self.infer_expr(arg);
                }
                Inferred::error()
            }
        }
    }

    fn infer_scheme_call(
        &mut self,
        span: Span,
        scheme: &FnScheme,
        nat_args: &[NatRef],
        args: &[&Expr],
    ) -> Inferred {
        if args.len() != scheme.params.len() {
            self.diags.error(
                DiagnosticKind::ArityMismatch,
                span,
                format!(
                    "expected {} arguments, got {}",
                    scheme.params.len(),
                    args.len()
                ),
            );
            for arg in args {
                let _ = self.infer_expr(arg);
            }
            return Inferred::error();
        }
        if nat_args.len() > scheme.nat_params.len() {
            self.diags.error(
                DiagnosticKind::ArityMismatch,
                span,
                format!(
                    "expected at most {} level arguments, got {}",
                    scheme.nat_params.len(),
                    nat_args.len()
                ),
            );
            return Inferred::error();
        }

        // Instantiate: fresh flexible symbol per level parameter, explicit
        // level arguments bound up front.
        let mut inst: HashMap<NatVarId, Nat> = HashMap::new();
        let mut fresh_ids = Vec::new();
        for (i, (name, id)) in scheme.nat_params.iter().enumerate() {
            if let Some(nr) = nat_args.get(i) {
                if let Some(nat) = self.resolve_nat_expr(nr) {
                    inst.insert(*id, nat);
                    fresh_ids.push(None);
                    continue;
                }
            }
            let fresh = self.nats.fresh(name);
            self.unifier.mark_flexible(fresh);
            inst.insert(*id, Nat::Sym(fresh));
            fresh_ids.push(Some(fresh));
        }

        let mut call_effects = scheme.effects;
        for (arg, param) in args.iter().zip(scheme.params.iter()) {
            let expected = param.subst_nats(&inst);
            let inferred = self.check_expr(arg, &expected, UnifyPosition::Argument);
            call_effects = call_effects.union(inferred.effects);
        }

        // Whatever unification decided, feed back into the substitution so
        // clauses and the result type see concrete levels.
        let mut clause_binds: HashMap<NatVarId, Nat> = HashMap::new();
        for ((_, orig_id), fresh) in scheme.nat_params.iter().zip(fresh_ids.iter()) {
            let value = match fresh {
                None => inst[orig_id].clone(),
                Some(fresh_id) => self
                    .unifier
                    .nat_binding(*fresh_id)
                    .unwrap_or(Nat::Sym(*fresh_id)),
            };
            clause_binds.insert(*orig_id, value);
        }

        let enclosing = self
            .current
            .as_ref()
            .map(|c| c.where_clauses.clone())
            .unwrap_or_default();
        let constraints_ok = check_call_constraints(
            &scheme.where_clauses,
            &clause_binds,
            &enclosing,
            &self.nats,
            span,
            &mut self.diags,
        );
        if !constraints_ok {
            self.note_effects(scheme.effects);
            return Inferred::error();
        }

        self.note_effects(scheme.effects);
        let ret = scheme.ret.subst_nats(&clause_binds);
        let ret = self.unifier.resolve(&ret);
        if let Some(level) = cipher_level(&ret) {
            if level_is_negative(level) {
                self.diags.error(
                    DiagnosticKind::ConstraintViolation,
                    span,
                    format!(
                        "result level '{}' is negative under this substitution",
                        level.display(&self.nats)
                    ),
                );
                return Inferred::error();
            }
        }
        Inferred {
            ty: ret,
            noise: scheme.ret_noise,
            effects: call_effects,
        }
    }

    fn infer_builtin_call(
        &mut self,
        span: Span,
        name: &Ident,
        builtin: Builtin,
        ctx: CtxId,
        args: &[&Expr],
    ) -> Inferred {
        if args.len() != builtin.arity() {
            self.diags.error(
                DiagnosticKind::ArityMismatch,
                span,
                format!(
                    "'{}' expects {} argument(s), got {}",
                    name.node,
                    builtin.arity(),
                    args.len()
                ),
            );
            for arg in args {
                let _ = self.infer_expr(arg);
            }
            return Inferred::error();
        }
        self.note_effects(builtin.effects());

        let refine = Refine {
            contexts: self.contexts,
            model: self.model,
        };

        match builtin {
            Builtin::Enc => {
                let arg = self.check_expr(args[0], &Type::Int, UnifyPosition::Argument);
                let context = self.contexts.get(ctx);
                let ty = Type::Cipher {
                    ctx,
                    level: Nat::Const(context.max_level as u64),
                    scale: context.scale_bits.map(|b| Nat::Const(b as u64)),
                    raised: 0,
                };
                Inferred {
                    noise: self.model.fresh(context),
                    effects: arg.effects.union(builtin.effects()),
                    ty,
                }
            }
            Builtin::Encode => {
                let arg = self.check_expr(args[0], &Type::Int, UnifyPosition::Argument);
                // Level left flexible so the encoding snaps to its use site.
                let fresh = self.nats.fresh("P");
                self.unifier.mark_flexible(fresh);
                Inferred {
                    ty: Type::Plain {
                        ctx,
                        level: Nat::Sym(fresh),
                    },
                    noise: 0,
                    effects: arg.effects,
                }
            }
            Builtin::Dec => {
                let arg = self.cipher_arg(args[0], ctx, &name.node);
                let effects = arg.effects.union(builtin.effects());
                if arg.ty.is_error() {
                    return Inferred {
                        ty: Type::Error,
                        noise: 0,
                        effects,
                    };
                }
                Inferred {
                    ty: Type::Int,
                    noise: 0,
                    effects,
                }
            }
            Builtin::Add | Builtin::Mul => {
                let l = self.cipher_arg(args[0], ctx, &name.node);
                let r = self.cipher_arg(args[1], ctx, &name.node);
                let effects = l.effects.union(r.effects).union(builtin.effects());
                if l.ty.is_error() || r.ty.is_error() {
                    return Inferred {
                        ty: Type::Error,
                        noise: 0,
                        effects,
                    };
                }
                let op = if builtin == Builtin::Add {
                    CipherBinOp::Add
                } else {
                    CipherBinOp::Mul
                };
                let (ty, noise) = refine.combine(
                    op,
                    &l.ty,
                    l.noise,
                    &r.ty,
                    r.noise,
                    span,
                    &self.nats,
                    &mut self.diags,
                );
                Inferred { ty, noise, effects }
            }
            Builtin::ModUp => {
                let arg = self.cipher_arg(args[0], ctx, &name.node);
                if arg.ty.is_error() {
                    return arg;
                }
                let (ty, noise) = refine.mod_up(&arg.ty, arg.noise);
                Inferred {
                    ty,
                    noise,
                    effects: arg.effects,
                }
            }
            Builtin::ModDown | Builtin::Rescale => {
                let arg = self.cipher_arg(args[0], ctx, &name.node);
                if arg.ty.is_error() {
                    return arg;
                }
                self.guard_symbolic_level(&arg.ty, span);
                let (ty, noise) = refine.mod_down(&arg.ty, span, &mut self.diags);
                Inferred {
                    ty,
                    noise,
                    effects: arg.effects,
                }
            }
            Builtin::Keyswitch => {
                let arg = self.cipher_arg(args[0], ctx, &name.node);
                let effects = arg.effects.union(builtin.effects());
                if arg.ty.is_error() {
                    return Inferred {
                        ty: Type::Error,
                        noise: 0,
                        effects,
                    };
                }
                self.guard_symbolic_level(&arg.ty, span);
                let (ty, noise) = refine.keyswitch(&arg.ty, arg.noise, span, &mut self.diags);
                Inferred { ty, noise, effects }
            }
        }
    }

    /// Level-reducing primitives applied at a symbolic level need the
    /// enclosing declaration to guarantee the level is positive.
    fn guard_symbolic_level(&mut self, cipher: &Type, span: Span) {
        let Type::Cipher { level, .. } = cipher else {
            return;
        };
        if level.as_const().is_some() {
            return;
        }
        let required = Constraint::new(
            span,
            level.clone(),
            ciphra_ast::CmpOp::Gt,
            Nat::Const(0),
            &self.nats,
        );
        let enclosing = self
            .current
            .as_ref()
            .map(|c| c.where_clauses.clone())
            .unwrap_or_default();
        if !entails(&enclosing, &required) {
            self.diags.error_help(
                DiagnosticKind::UnderconstrainedNatural,
                span,
                format!(
                    "cannot prove level '{}' is positive at this call",
                    level.display(&self.nats)
                ),
                format!("add `where {} > 0` to the enclosing declaration", level.display(&self.nats)),
            );
        }
    }

    fn cipher_arg(&mut self, arg: &Expr, ctx: CtxId, callee: &str) -> Inferred {
        let inferred = self.infer_expr(arg);
        let ty = self.unifier.resolve(&inferred.ty);
        match &ty {
            Type::Error => Inferred {
                ty: Type::Error,
                noise: 0,
                effects: inferred.effects,
            },
            Type::Cipher { ctx: actual, .. } => {
                if *actual != ctx {
                    self.diags.error(
                        DiagnosticKind::IncompatibleModuli,
                        arg.span,
                        format!(
                            "'{callee}' is bound to {} but its argument was encrypted under {}",
                            self.contexts.get(ctx).display(),
                            self.contexts.get(*actual).display()
                        ),
                    );
                    return Inferred {
                        ty: Type::Error,
                        noise: 0,
                        effects: inferred.effects,
                    };
                }
                Inferred {
                    ty,
                    noise: inferred.noise,
                    effects: inferred.effects,
                }
            }
            other => {
                let shown = other.display(&self.nats);
                self.diags.error(
                    DiagnosticKind::TypeMismatch,
                    arg.span,
                    format!("'{callee}' expects a ciphertext, found {shown}"),
                );
                Inferred {
                    ty: Type::Error,
                    noise: 0,
                    effects: inferred.effects,
                }
            }
        }
    }

    // ---- structured expressions ---------------------------------------

    fn infer_if(&mut self, expr: &Expr, value_position: bool) -> Inferred {
        let ExprKind::If {
            cond,
            then_block,
            elifs,
            else_block,
        } = &expr.kind
        else {
            unreachable!("infer_if on non-if");
        };

        let mut effects = self
            .check_expr(cond, &Type::Bool, UnifyPosition::Annotation)
            .effects;

        let then = self.check_block(then_block);
        effects = effects.union(then.effects);
        let mut joined = then.ty;
        let mut noise = then.noise;

        for (elif_cond, elif_block) in elifs {
            effects = effects.union(
                self.check_expr(elif_cond, &Type::Bool, UnifyPosition::Annotation)
                    .effects,
            );
            let branch = self.check_block(elif_block);
            effects = effects.union(branch.effects);
            noise = noise.max(branch.noise);
            if value_position {
                if let Err(err) = self.unifier.unify(&joined, &branch.ty) {
                    self.report_unify(err, elif_block.span, UnifyPosition::Branch);
                    joined = Type::Error;
                }
            }
        }

        match else_block {
            Some(block) => {
                let branch = self.check_block(block);
                effects = effects.union(branch.effects);
                noise = noise.max(branch.noise);
                if value_position {
                    if let Err(err) = self.unifier.unify(&joined, &branch.ty) {
                        self.report_unify(err, block.span, UnifyPosition::Branch);
                        joined = Type::Error;
                    }
                }
            }
            None if value_position => {
                self.diags.error_help(
                    DiagnosticKind::NonExhaustiveConditional,
                    expr.span,
                    "conditional used for its value must have an else arm",
                    "add an else branch, or discard the result",
                );
                joined = Type::Error;
            }
            None => {}
        }

        let inferred = Inferred {
            ty: if value_position { joined } else { Type::Unit },
            noise,
            effects,
        };
        self.record_node(expr.span, &inferred);
        inferred
    }

    fn infer_comprehension(&mut self, body: &Expr, binder: &Ident, iter: &Expr) -> Inferred {
        let iter_inferred = self.infer_expr(iter);
        let iter_ty = self.unifier.resolve(&iter_inferred.ty);
        let (elem_ty, len) = match iter_ty {
            Type::Error => (Type::Error, Nat::Const(0)),
            Type::Vector { elem, len } => (*elem, len),
            other => {
                let shown = other.display(&self.nats);
                self.diags.error(
                    DiagnosticKind::TypeMismatch,
                    iter.span,
                    format!("comprehension source must be a vector, found {shown}"),
                );
                (Type::Error, Nat::Const(0))
            }
        };

        self.push_scope();
        let noise = self.entry_noise(&elem_ty);
        self.define(binder, elem_ty, noise, false);
        let body_inferred = self.infer_expr(body);
        self.pop_scope();

        Inferred {
            ty: Type::Vector {
                elem: Box::new(body_inferred.ty),
                len,
            },
            noise: body_inferred.noise,
            effects: iter_inferred.effects.union(body_inferred.effects),
        }
    }

    fn infer_record(&mut self, fields: &[(Ident, Expr)]) -> Inferred {
        let mut seen: HashMap<&str, Span> = HashMap::new();
        let mut out = Vec::with_capacity(fields.len());
        let mut effects = EffectSet::PURE;
        let mut noise = 0;
        for (name, value) in fields {
            if seen.insert(name.node.as_str(), name.span).is_some() {
                self.diags.error(
                    DiagnosticKind::RecordShapeMismatch,
                    name.span,
                    format!("field '{}' appears more than once", name.node),
                );
                continue;
            }
            let inferred = self.infer_expr(value);
            effects = effects.union(inferred.effects);
            noise = noise.max(inferred.noise);
            out.push((name.node.clone(), inferred.ty));
        }
        Inferred {
            ty: Type::record(out),
            noise,
            effects,
        }
    }

    fn infer_vector(&mut self, items: &[Expr]) -> Inferred {
        let mut elem_ty = self.unifier.fresh_var();
        let mut effects = EffectSet::PURE;
        let mut noise = 0;
        for item in items {
            let inferred = self.check_expr(item, &elem_ty.clone(), UnifyPosition::Element);
            effects = effects.union(inferred.effects);
            noise = noise.max(inferred.noise);
            if inferred.ty.is_error() {
                elem_ty = Type::Error;
            }
        }
        Inferred {
            ty: Type::Vector {
                elem: Box::new(self.unifier.resolve(&elem_ty)),
                len: Nat::Const(items.len() as u64),
            },
            noise,
            effects,
        }
    }

    fn infer_index(&mut self, base: &Expr, index: &Expr) -> Inferred {
        let base_inferred = self.infer_expr(base);
        let idx = self.check_expr(index, &Type::Int, UnifyPosition::Index);
        let effects = base_inferred.effects.union(idx.effects);
        let base_ty = self.unifier.resolve(&base_inferred.ty);
        match base_ty {
            Type::Error => Inferred {
                ty: Type::Error,
                noise: 0,
                effects,
            },
            Type::Vector { elem, len } => {
                if let (Some(n), ExprKind::IntLit(i)) = (len.as_const(), &index.kind) {
                    if *i >= n {
                        self.diags.error(
                            DiagnosticKind::LengthMismatch,
                            index.span,
                            format!("index {i} is out of bounds for a vector of length {n}"),
                        );
                    }
                }
                Inferred {
                    ty: *elem,
                    noise: base_inferred.noise,
                    effects,
                }
            }
            other => {
                let shown = other.display(&self.nats);
                self.diags.error(
                    DiagnosticKind::NoApplicableOverload,
                    base.span,
                    format!("{shown} cannot be indexed"),
                );
                Inferred {
                    ty: Type::Error,
                    noise: 0,
                    effects,
                }
            }
        }
    }

    // ---- diagnostics ---------------------------------------------------

    fn report_unify(&mut self, err: UnifyError, span: Span, pos: UnifyPosition) {
        match err {
            UnifyError::Mismatch { expected, found } => {
                let expected = self.unifier.resolve(&expected).display(&self.nats);
                let found = self.unifier.resolve(&found).display(&self.nats);
                let message = match pos {
                    UnifyPosition::Return => {
                        format!("declared return type {expected}, but the body produces {found}")
                    }
                    UnifyPosition::Branch => {
                        format!("conditional branches disagree: {expected} vs {found}")
                    }
                    UnifyPosition::Element => {
                        format!("vector elements disagree: {expected} vs {found}")
                    }
                    _ => format!("expected {expected}, found {found}"),
                };
                self.diags.error(DiagnosticKind::TypeMismatch, span, message);
            }
            UnifyError::Occurs => {
                self.diags.error(
                    DiagnosticKind::OccursCheck,
                    span,
                    "cannot construct an infinite type",
                );
            }
            UnifyError::Length { expected, found } => {
                self.diags.error(
                    DiagnosticKind::LengthMismatch,
                    span,
                    format!(
                        "vector length mismatch: expected {}, found {}",
                        expected.display(&self.nats),
                        found.display(&self.nats)
                    ),
                );
            }
            UnifyError::Level { expected, found } => {
                let kind = match pos {
                    UnifyPosition::Return => DiagnosticKind::SignatureLevelMismatch,
                    _ => DiagnosticKind::IncompatibleLevels,
                };
                self.diags.error(
                    kind,
                    span,
                    format!(
                        "level mismatch: expected {}, found {}",
                        expected.display(&self.nats),
                        found.display(&self.nats)
                    ),
                );
            }
            UnifyError::Modulus => {
                self.diags.error(
                    DiagnosticKind::IncompatibleModuli,
                    span,
                    "operands refer to different scheme contexts or modulus chains",
                );
            }
            UnifyError::Shape => {
                self.diags.error(
                    DiagnosticKind::RecordShapeMismatch,
                    span,
                    "record or tuple shape does not match",
                );
            }
            UnifyError::Arity { expected, found } => {
                self.diags.error(
                    DiagnosticKind::ArityMismatch,
                    span,
                    format!("expected {expected} parameters, found {found}"),
                );
            }
        }
    }
}

fn cipher_level(ty: &Type) -> Option<&Nat> {
    match ty {
        Type::Cipher { level, .. } | Type::Plain { level, .. } => Some(level),
        _ => None,
    }
}

fn level_is_negative(level: &Nat) -> bool {
    level.eval(&HashMap::new()).map(|v| v < 0).unwrap_or(false)
}
