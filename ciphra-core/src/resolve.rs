#![forbid(unsafe_code)]

//! Module dependency resolution.
//!
//! Imports form a DAG; the resolver groups modules into *waves* such that a
//! module's imports are all satisfied by earlier waves. Waves are the unit
//! of parallel checking. Cycles are fatal to their members and reported with
//! the full cycle path.

use std::collections::{HashMap, HashSet};

use ciphra_ast::{Decl, Module, Program, Span};

use crate::diagnostics::{DiagnosticKind, Diagnostics};

#[derive(Debug)]
pub struct ModuleGraph {
    /// Indices into `program.modules`, grouped into dependency waves; each
    /// wave is sorted by module name for deterministic scheduling.
    pub waves: Vec<Vec<usize>>,
    /// Members of import cycles, excluded from the waves.
    pub cyclic: Vec<usize>,
}

/// User-module dependencies of a module: `(target name, import span)`.
/// Builtin `fhe.*` namespaces are not modules and never form edges.
fn dependencies(module: &Module) -> Vec<(String, Span)> {
    let mut out = Vec::new();
    for decl in &module.decls {
        if let Decl::Import(import) = decl {
            let path: Vec<&str> = import.path.iter().map(|p| p.node.as_str()).collect();
            if path.first() == Some(&"fhe") {
                continue;
            }
            out.push((path.join("."), import.span));
        }
    }
    out
}

pub fn build_graph(program: &Program, diags: &mut [Diagnostics]) -> ModuleGraph {
    let n = program.modules.len();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for (i, module) in program.modules.iter().enumerate() {
        if index.contains_key(module.name.node.as_str()) {
            diags[i].error(
                DiagnosticKind::DuplicateBinding,
                module.name.span,
                format!("module '{}' is declared more than once", module.name.node),
            );
            continue;
        }
        index.insert(module.name.node.as_str(), i);
    }

    // adjacency: edges[i] = modules i imports from
    let mut edges: Vec<Vec<(usize, Span)>> = vec![Vec::new(); n];
    for (i, module) in program.modules.iter().enumerate() {
        for (target, span) in dependencies(module) {
            if let Some(&t) = index.get(target.as_str()) {
                if t != i {
                    edges[i].push((t, span));
                }
            }
            // Unknown targets are the checker's UnboundName, not an edge.
        }
    }

    let cyclic = find_cycle_members(program, &edges, diags);
    let cyclic_set: HashSet<usize> = cyclic.iter().copied().collect();

    // Kahn's algorithm over the acyclic remainder, wave by wave.
    let mut indeg = vec![0usize; n];
    for (i, targets) in edges.iter().enumerate() {
        if cyclic_set.contains(&i) {
            continue;
        }
        for (t, _) in targets {
            if !cyclic_set.contains(t) {
                indeg[i] += 1;
            }
        }
    }
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, targets) in edges.iter().enumerate() {
        for (t, _) in targets {
            dependents[*t].push(i);
        }
    }

    let mut waves = Vec::new();
    let mut placed: HashSet<usize> = cyclic_set.clone();
    let mut ready: Vec<usize> = (0..n)
        .filter(|i| !cyclic_set.contains(i) && indeg[*i] == 0)
        .collect();
    while !ready.is_empty() {
        ready.sort_by(|a, b| program.modules[*a].name.node.cmp(&program.modules[*b].name.node));
        let wave = ready.clone();
        let mut next = Vec::new();
        for &done in &wave {
            placed.insert(done);
            for &dep in &dependents[done] {
                if placed.contains(&dep) || cyclic_set.contains(&dep) {
                    continue;
                }
                indeg[dep] -= 1;
                if indeg[dep] == 0 {
                    next.push(dep);
                }
            }
        }
        waves.push(wave);
        ready = next;
    }

    ModuleGraph { waves, cyclic }
}

/// Three-color DFS; every node found on a back-edge path is a cycle member
/// and gets a `CyclicImport` diagnostic naming the cycle.
fn find_cycle_members(
    program: &Program,
    edges: &[Vec<(usize, Span)>],
    diags: &mut [Diagnostics],
) -> Vec<usize> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let n = edges.len();
    let mut color = vec![Color::White; n];
    let mut stack: Vec<usize> = Vec::new();
    let mut members: HashSet<usize> = HashSet::new();

    fn dfs(
        node: usize,
        edges: &[Vec<(usize, Span)>],
        color: &mut [Color],
        stack: &mut Vec<usize>,
        members: &mut HashSet<usize>,
        program: &Program,
        diags: &mut [Diagnostics],
    ) {
        color[node] = Color::Gray;
        stack.push(node);
        for (target, span) in &edges[node] {
            match color[*target] {
                Color::Gray => {
                    // Back edge: everything from `target` to `node` cycles.
                    let start = stack.iter().position(|s| s == target).unwrap_or(0);
                    let cycle: Vec<usize> = stack[start..].to_vec();
                    let mut names: Vec<&str> = cycle
                        .iter()
                        .map(|i| program.modules[*i].name.node.as_str())
                        .collect();
                    names.push(names[0]);
                    let path = names.join(" -> ");
                    for member in &cycle {
                        if members.insert(*member) {
                            let at = if *member == node { *span } else {
                                program.modules[*member].name.span
                            };
                            diags[*member].error(
                                DiagnosticKind::CyclicImport,
                                at,
                                format!("import cycle: {path}"),
                            );
                        }
                    }
                }
                Color::White => {
                    dfs(*target, edges, color, stack, members, program, diags);
                }
                Color::Black => {}
            }
        }
        stack.pop();
        color[node] = Color::Black;
    }

    for node in 0..n {
        if color[node] == Color::White {
            dfs(node, edges, &mut color, &mut stack, &mut members, program, diags);
        }
    }

    let mut out: Vec<usize> = members.into_iter().collect();
    out.sort_unstable();
    out
}
