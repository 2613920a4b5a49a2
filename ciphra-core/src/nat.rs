#![forbid(unsafe_code)]

//! Type-level naturals and the `where`-clause solver.
//!
//! Symbolic naturals are interned per declaration and substituted at call
//! sites. The solver only evaluates linear integer forms over bound symbols;
//! a clause left with unbound symbols is discharged against the enclosing
//! declaration's own clauses by subsumption, never by proof search.

use std::collections::{BTreeMap, HashMap, HashSet};

use ciphra_ast::{CmpOp, Span};

use crate::diagnostics::{DiagnosticKind, Diagnostics};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NatVarId(pub u32);

/// Intern table for symbolic naturals. Owned by the checker of the module
/// that declared them; ids in exported signatures are replaced with fresh
/// local ids on instantiation.
#[derive(Clone, Debug, Default)]
pub struct NatTable {
    names: Vec<String>,
}

impl NatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh(&mut self, name: &str) -> NatVarId {
        let id = NatVarId(self.names.len() as u32);
        self.names.push(name.to_string());
        id
    }

    pub fn name(&self, id: NatVarId) -> &str {
        self.names
            .get(id.0 as usize)
            .map(String::as_str)
            .unwrap_or("?")
    }
}

/// A compile-time natural: a constant, an interned symbol, or a linear
/// combination of the two.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Nat {
    Const(u64),
    Sym(NatVarId),
    Add(Box<Nat>, Box<Nat>),
    Sub(Box<Nat>, Box<Nat>),
}

impl Nat {
    pub fn as_const(&self) -> Option<u64> {
        match self {
            Nat::Const(v) => Some(*v),
            _ => None,
        }
    }

    pub fn eval(&self, binds: &HashMap<NatVarId, i64>) -> Option<i64> {
        match self {
            Nat::Const(v) => Some(*v as i64),
            Nat::Sym(id) => binds.get(id).copied(),
            Nat::Add(a, b) => Some(a.eval(binds)? + b.eval(binds)?),
            Nat::Sub(a, b) => Some(a.eval(binds)? - b.eval(binds)?),
        }
    }

    /// Replace symbols per `map`, folding to a constant when closed.
    pub fn subst(&self, map: &HashMap<NatVarId, Nat>) -> Nat {
        let out = match self {
            Nat::Const(v) => Nat::Const(*v),
            Nat::Sym(id) => map.get(id).cloned().unwrap_or(Nat::Sym(*id)),
            Nat::Add(a, b) => Nat::Add(Box::new(a.subst(map)), Box::new(b.subst(map))),
            Nat::Sub(a, b) => Nat::Sub(Box::new(a.subst(map)), Box::new(b.subst(map))),
        };
        out.fold()
    }

    /// Fold a closed expression to `Const`; leave open expressions alone.
    pub fn fold(&self) -> Nat {
        match self.eval(&HashMap::new()) {
            Some(v) if v >= 0 => Nat::Const(v as u64),
            _ => self.clone(),
        }
    }

    pub fn syms(&self, out: &mut HashSet<NatVarId>) {
        match self {
            Nat::Const(_) => {}
            Nat::Sym(id) => {
                out.insert(*id);
            }
            Nat::Add(a, b) | Nat::Sub(a, b) => {
                a.syms(out);
                b.syms(out);
            }
        }
    }

    pub fn contains(&self, id: NatVarId) -> bool {
        match self {
            Nat::Const(_) => false,
            Nat::Sym(s) => *s == id,
            Nat::Add(a, b) | Nat::Sub(a, b) => a.contains(id) || b.contains(id),
        }
    }

    pub fn display(&self, table: &NatTable) -> String {
        match self {
            Nat::Const(v) => v.to_string(),
            Nat::Sym(id) => table.name(*id).to_string(),
            Nat::Add(a, b) => format!("{} + {}", a.display(table), b.display(table)),
            Nat::Sub(a, b) => format!("{} - {}", a.display(table), b.display(table)),
        }
    }
}

/// A `where` clause: a comparison between two linear nat expressions,
/// owned by the declaration it guards. `text` is the rendered clause, kept
/// so call-site reports in other modules stay readable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Constraint {
    pub span: Span,
    pub lhs: Nat,
    pub op: CmpOp,
    pub rhs: Nat,
    pub text: String,
}

impl Constraint {
    pub fn new(span: Span, lhs: Nat, op: CmpOp, rhs: Nat, table: &NatTable) -> Self {
        let text = format!(
            "{} {} {}",
            lhs.display(table),
            op.display(),
            rhs.display(table)
        );
        Self {
            span,
            lhs,
            op,
            rhs,
            text,
        }
    }

    pub fn subst(&self, map: &HashMap<NatVarId, Nat>) -> Constraint {
        Constraint {
            span: self.span,
            lhs: self.lhs.subst(map),
            op: self.op,
            rhs: self.rhs.subst(map),
            text: self.text.clone(),
        }
    }

    fn syms(&self) -> HashSet<NatVarId> {
        let mut out = HashSet::new();
        self.lhs.syms(&mut out);
        self.rhs.syms(&mut out);
        out
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClauseOutcome {
    Satisfied,
    Violated,
    /// At least one symbol had no concrete value.
    Unbound,
}

pub fn eval_clause(clause: &Constraint, binds: &HashMap<NatVarId, i64>) -> ClauseOutcome {
    let (Some(l), Some(r)) = (clause.lhs.eval(binds), clause.rhs.eval(binds)) else {
        return ClauseOutcome::Unbound;
    };
    let holds = match clause.op {
        CmpOp::Lt => l < r,
        CmpOp::Le => l <= r,
        CmpOp::Gt => l > r,
        CmpOp::Ge => l >= r,
        CmpOp::Eq => l == r,
        CmpOp::Ne => l != r,
    };
    if holds {
        ClauseOutcome::Satisfied
    } else {
        ClauseOutcome::Violated
    }
}

/// Linear-form equality: `(L - 1) - 1` and `L - 2` denote the same natural.
pub fn linear_eq(a: &Nat, b: &Nat) -> bool {
    let mut fa = LinearForm::zero();
    fa.accumulate(a, 1);
    let mut fb = LinearForm::zero();
    fb.accumulate(b, 1);
    fa == fb
}

/// `Σ coeffs·sym + konst`, compared against zero.
#[derive(Clone, Debug, PartialEq, Eq)]
struct LinearForm {
    coeffs: BTreeMap<NatVarId, i64>,
    konst: i64,
}

impl LinearForm {
    fn zero() -> Self {
        Self {
            coeffs: BTreeMap::new(),
            konst: 0,
        }
    }

    fn accumulate(&mut self, nat: &Nat, sign: i64) {
        match nat {
            Nat::Const(v) => self.konst += sign * *v as i64,
            Nat::Sym(id) => {
                let entry = self.coeffs.entry(*id).or_insert(0);
                *entry += sign;
            }
            Nat::Add(a, b) => {
                self.accumulate(a, sign);
                self.accumulate(b, sign);
            }
            Nat::Sub(a, b) => {
                self.accumulate(a, sign);
                self.accumulate(b, -sign);
            }
        }
        self.coeffs.retain(|_, c| *c != 0);
    }
}

/// A clause normalized to `form ≥ 0` (or `form ≠ 0` when `ne`).
#[derive(Clone, Debug)]
struct NormClause {
    form: LinearForm,
    ne: bool,
}

fn normalize(clause: &Constraint) -> Vec<NormClause> {
    let mut diff = LinearForm::zero();
    diff.accumulate(&clause.lhs, 1);
    diff.accumulate(&clause.rhs, -1);
    let negated = |d: &LinearForm| {
        let mut n = LinearForm::zero();
        for (id, c) in &d.coeffs {
            n.coeffs.insert(*id, -c);
        }
        n.konst = -d.konst;
        n
    };
    match clause.op {
        // lhs - rhs > 0  ⇔  lhs - rhs - 1 ≥ 0 over the integers
        CmpOp::Gt => {
            let mut f = diff;
            f.konst -= 1;
            vec![NormClause { form: f, ne: false }]
        }
        CmpOp::Ge => vec![NormClause { form: diff, ne: false }],
        CmpOp::Lt => {
            let mut f = negated(&diff);
            f.konst -= 1;
            vec![NormClause { form: f, ne: false }]
        }
        CmpOp::Le => vec![NormClause {
            form: negated(&diff),
            ne: false,
        }],
        CmpOp::Eq => vec![
            NormClause {
                form: diff.clone(),
                ne: false,
            },
            NormClause {
                form: negated(&diff),
                ne: false,
            },
        ],
        CmpOp::Ne => vec![NormClause { form: diff, ne: true }],
    }
}

/// Does the declared clause set syntactically subsume `required`?
///
/// Both sides are normalized to `Q + k ≥ 0`; a declared clause with the same
/// symbol part and a smaller-or-equal constant implies the required one. This
/// lets a body guarded by `where L > 1` apply an operation that itself
/// requires `L > 0`.
pub fn entails(declared: &[Constraint], required: &Constraint) -> bool {
    let reqs = normalize(required);
    let mut decls = Vec::new();
    for d in declared {
        decls.extend(normalize(d));
    }
    reqs.iter().all(|req| {
        decls.iter().any(|d| {
            if d.form.coeffs != req.form.coeffs {
                return false;
            }
            if req.ne {
                // Q ≠ -k_r is implied by a matching Ne, or by Q ≥ -k_d with
                // -k_d > -k_r.
                (d.ne && d.form.konst == req.form.konst) || (!d.ne && d.form.konst < req.form.konst)
            } else {
                !d.ne && d.form.konst <= req.form.konst
            }
        })
    })
}

/// Evaluate a callee's clauses under the call-site substitution.
///
/// Closed clauses are decided outright; open clauses must be subsumed by the
/// enclosing declaration's clauses or they are underconstrained.
pub fn check_call_constraints(
    clauses: &[Constraint],
    binds: &HashMap<NatVarId, Nat>,
    enclosing: &[Constraint],
    table: &NatTable,
    call_span: Span,
    diags: &mut Diagnostics,
) -> bool {
    let mut ok = true;
    for clause in clauses {
        let substituted = clause.subst(binds);
        match eval_clause(&substituted, &HashMap::new()) {
            ClauseOutcome::Satisfied => {}
            ClauseOutcome::Violated => {
                ok = false;
                let subst_text = describe_substitution(clause, binds, table);
                diags.error(
                    DiagnosticKind::ConstraintViolation,
                    call_span,
                    format!("constraint `{}` is not satisfied{subst_text}", clause.text),
                );
            }
            ClauseOutcome::Unbound => {
                if !entails(enclosing, &substituted) {
                    ok = false;
                    diags.error_help(
                        DiagnosticKind::UnderconstrainedNatural,
                        call_span,
                        format!(
                            "constraint `{}` cannot be decided here: no concrete value for `{}`",
                            clause.text,
                            substituted
                                .syms()
                                .iter()
                                .map(|id| table.name(*id))
                                .collect::<Vec<_>>()
                                .join("`, `"),
                        ),
                        format!("add `where {}` to the enclosing declaration", clause.text),
                    );
                }
            }
        }
    }
    ok
}

fn describe_substitution(
    clause: &Constraint,
    binds: &HashMap<NatVarId, Nat>,
    table: &NatTable,
) -> String {
    let mut parts: Vec<String> = clause
        .syms()
        .into_iter()
        .filter_map(|id| {
            binds
                .get(&id)
                .map(|n| format!("{} = {}", table.name(id), n.display(table)))
        })
        .collect();
    if parts.is_empty() {
        return String::new();
    }
    parts.sort();
    format!(" (with {})", parts.join(", "))
}
