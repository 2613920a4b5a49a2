#![forbid(unsafe_code)]

//! Whole-program driver.
//!
//! Resolves every `using` clause into the context registry, freezes it,
//! orders modules into dependency waves, and checks each wave's modules in
//! parallel. Workers own a private checker; the frozen context table and the
//! exports of completed modules are shared read-only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ciphra_ast::{Decl, Program};
use rayon::prelude::*;

use crate::context::{ContextRegistry, Contexts, CtxId};
use crate::diagnostics::Diagnostics;
use crate::refine::{DepthBudget, NoiseModel};
use crate::resolve::build_graph;
use crate::sema::{CheckedModule, Checker, ModuleExports};

#[derive(Clone, Copy, Debug)]
pub struct CheckOptions {
    /// Abort a module's checking once this many errors accumulate. The rest
    /// of the program is unaffected.
    pub fatal_limit: usize,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self { fatal_limit: 25 }
    }
}

/// Result of checking a whole program; modules appear in source order.
#[derive(Debug)]
pub struct Checked {
    pub modules: Vec<CheckedModule>,
}

impl Checked {
    pub fn module(&self, name: &str) -> Option<&CheckedModule> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Names of the modules eligible for code generation.
    pub fn codegen_modules(&self) -> Vec<&str> {
        self.modules
            .iter()
            .filter(|m| m.is_codegen_eligible())
            .map(|m| m.name.as_str())
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.modules.iter().any(|m| !m.is_codegen_eligible())
    }
}

pub fn check_program(program: &Program) -> Checked {
    check_program_with(program, &CheckOptions::default(), &DepthBudget::default())
}

pub fn check_program_with(
    program: &Program,
    opts: &CheckOptions,
    model: &dyn NoiseModel,
) -> Checked {
    let n = program.modules.len();
    let mut diags: Vec<Diagnostics> = (0..n).map(|_| Diagnostics::new(opts.fatal_limit)).collect();

    // Resolve and intern every using clause up front, then freeze: checking
    // only ever reads the registry.
    let registry = ContextRegistry::new();
    let mut import_ctxs: Vec<Vec<Option<CtxId>>> = Vec::with_capacity(n);
    for (i, module) in program.modules.iter().enumerate() {
        let mut per_module = Vec::new();
        for decl in &module.decls {
            if let Decl::Import(import) = decl {
                let resolved = import
                    .using
                    .as_ref()
                    .and_then(|clause| registry.resolve(clause, &mut diags[i]));
                per_module.push(resolved);
            }
        }
        import_ctxs.push(per_module);
    }
    let contexts: Contexts = registry.freeze();

    let graph = build_graph(program, &mut diags);

    let mut unavailable: HashSet<String> = graph
        .cyclic
        .iter()
        .map(|i| program.modules[*i].name.node.clone())
        .collect();
    let mut completed: HashMap<String, Arc<ModuleExports>> = HashMap::new();

    let mut slots: Vec<Option<Diagnostics>> = diags.into_iter().map(Some).collect();
    let mut results: Vec<Option<CheckedModule>> = (0..n).map(|_| None).collect();

    // Cycle members are not checked; their diagnostics stand alone.
    for &i in &graph.cyclic {
        let diags = slots[i].take().expect("cyclic module diagnostics");
        results[i] = Some(CheckedModule {
            name: program.modules[i].name.node.clone(),
            diagnostics: diags.into_sorted(),
            types: Default::default(),
            effects: Default::default(),
            exports: Arc::new(ModuleExports::default()),
        });
    }

    for wave in &graph.waves {
        let work: Vec<(usize, Diagnostics)> = wave
            .iter()
            .map(|&i| (i, slots[i].take().expect("module diagnostics")))
            .collect();

        let checked: Vec<(usize, CheckedModule)> = work
            .into_par_iter()
            .map(|(i, diags)| {
                let checker = Checker::new(
                    &contexts,
                    model,
                    &completed,
                    &unavailable,
                    &import_ctxs[i],
                    diags,
                );
                (i, checker.check_module(&program.modules[i]))
            })
            .collect();

        for (i, module) in checked {
            if module.is_codegen_eligible() {
                completed.insert(module.name.clone(), Arc::clone(&module.exports));
            } else {
                unavailable.insert(module.name.clone());
            }
            results[i] = Some(module);
        }
    }

    Checked {
        modules: results.into_iter().flatten().collect(),
    }
}
