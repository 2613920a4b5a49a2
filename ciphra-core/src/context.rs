#![forbid(unsafe_code)]

//! Scheme contexts: named, immutable parameter bindings resolved from
//! `using` clauses and interned so structurally equal clauses share one
//! canonical entry. The registry is created per compilation run, frozen once
//! every clause is resolved, and passed by reference from then on.

use std::collections::HashMap;
use std::sync::Mutex;

use ciphra_ast::{NatRef, NatRefKind, UsingClause};

use crate::diagnostics::{DiagnosticKind, Diagnostics};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CtxId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SchemeFamily {
    Bgv,
    Bfv,
    Ckks,
    Lwe,
}

impl SchemeFamily {
    pub fn parse(name: &str) -> Option<SchemeFamily> {
        match name {
            "BGV" => Some(SchemeFamily::Bgv),
            "BFV" => Some(SchemeFamily::Bfv),
            "CKKS" => Some(SchemeFamily::Ckks),
            "LWE" => Some(SchemeFamily::Lwe),
            _ => None,
        }
    }

    pub fn display(&self) -> &'static str {
        match self {
            SchemeFamily::Bgv => "BGV",
            SchemeFamily::Bfv => "BFV",
            SchemeFamily::Ckks => "CKKS",
            SchemeFamily::Lwe => "LWE",
        }
    }

    fn required_params(&self) -> &'static [&'static str] {
        match self {
            SchemeFamily::Bgv | SchemeFamily::Bfv | SchemeFamily::Lwe => {
                &["q", "p", "n", "lambda"]
            }
            SchemeFamily::Ckks => &["q", "n", "lambda", "scale"],
        }
    }

    fn is_rlwe(&self) -> bool {
        !matches!(self, SchemeFamily::Lwe)
    }
}

/// One resolved scheme parameterization. Two contexts are equal iff all
/// parameters are structurally equal; `max_level` is derived from them, so
/// derived equality and structural equality coincide.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Context {
    pub family: SchemeFamily,
    /// Ciphertext modulus exponent: `q = 2^log_q`.
    pub log_q: u32,
    /// Plaintext modulus `p` (absent for CKKS).
    pub plain_modulus: Option<u64>,
    /// Ring dimension `n`, a power of two.
    pub ring_dim: u64,
    /// Security parameter λ.
    pub security: u32,
    /// CKKS rescaling scale exponent.
    pub scale_bits: Option<u32>,
    /// Top of the modulus chain; fresh encryptions start here.
    pub max_level: u32,
}

impl Context {
    pub fn display(&self) -> String {
        format!(
            "{}(q=2^{}, n={}, λ={})",
            self.family.display(),
            self.log_q,
            self.ring_dim,
            self.security
        )
    }
}

#[derive(Default)]
struct RegistryInner {
    contexts: Vec<Context>,
    index: HashMap<Context, CtxId>,
}

/// Mutex-guarded intern table: at most one canonical entry per structurally
/// equal context, even when modules resolve clauses from worker threads.
pub struct ContextRegistry {
    inner: Mutex<RegistryInner>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Resolve a `using` clause against its family's required parameter set.
    /// All violations in the clause are reported before giving up on it.
    pub fn resolve(&self, clause: &UsingClause, diags: &mut Diagnostics) -> Option<CtxId> {
        let Some(family) = SchemeFamily::parse(&clause.family.node) else {
            diags.error_help(
                DiagnosticKind::UnknownScheme,
                clause.family.span,
                format!("unknown scheme family '{}'", clause.family.node),
                "known families: BGV, BFV, CKKS, LWE",
            );
            return None;
        };

        let mut params: HashMap<&str, &NatRef> = HashMap::new();
        let mut ok = true;
        for param in &clause.params {
            let canonical = canonical_param_name(&param.name.node);
            if !family.required_params().contains(&canonical) {
                diags.error(
                    DiagnosticKind::InvalidParameter,
                    param.name.span,
                    format!(
                        "'{}' is not a parameter of {}",
                        param.name.node,
                        family.display()
                    ),
                );
                ok = false;
                continue;
            }
            if params.insert(canonical, &param.value).is_some() {
                diags.error(
                    DiagnosticKind::InvalidParameter,
                    param.name.span,
                    format!("parameter '{canonical}' given more than once"),
                );
                ok = false;
            }
        }
        for required in family.required_params() {
            if !params.contains_key(required) {
                diags.error(
                    DiagnosticKind::MissingParameter,
                    clause.span,
                    format!("{} requires parameter '{required}'", family.display()),
                );
                ok = false;
            }
        }
        if !ok {
            return None;
        }

        let log_q = self.validate_q(family, params["q"], diags)?;
        let ring_dim = self.validate_n(params["n"], diags)?;
        let security = self.validate_lambda(params["lambda"], diags)?;
        let plain_modulus = match params.get("p") {
            Some(value) => Some(self.validate_p(value, diags)?),
            None => None,
        };
        let scale_bits = match params.get("scale") {
            Some(value) => Some(self.validate_scale(value, log_q, diags)?),
            None => None,
        };

        let max_level = max_level_for(family, log_q, scale_bits);
        let context = Context {
            family,
            log_q,
            plain_modulus,
            ring_dim,
            security,
            scale_bits,
            max_level,
        };

        let mut inner = self.inner.lock().expect("context registry poisoned");
        if let Some(id) = inner.index.get(&context) {
            return Some(*id);
        }
        let id = CtxId(inner.contexts.len() as u32);
        inner.contexts.push(context.clone());
        inner.index.insert(context, id);
        Some(id)
    }

    /// End the resolution phase; the returned table is immutable and shared
    /// by every checker worker.
    pub fn freeze(self) -> Contexts {
        let inner = self.inner.into_inner().expect("context registry poisoned");
        Contexts {
            contexts: inner.contexts,
        }
    }

    fn validate_q(
        &self,
        family: SchemeFamily,
        value: &NatRef,
        diags: &mut Diagnostics,
    ) -> Option<u32> {
        let NatRefKind::Pow2(exp) = value.kind else {
            diags.error_help(
                DiagnosticKind::InvalidParameter,
                value.span,
                "ciphertext modulus q must be written in the form 2^k",
                "for example q=2^60",
            );
            return None;
        };
        let range = if family.is_rlwe() { 30..=120 } else { 10..=64 };
        if !range.contains(&exp) {
            diags.error(
                DiagnosticKind::InvalidParameter,
                value.span,
                format!(
                    "q=2^{exp} is outside the supported range 2^{}..2^{} for {}",
                    range.start(),
                    range.end(),
                    family.display()
                ),
            );
            return None;
        }
        Some(exp)
    }

    fn validate_n(&self, value: &NatRef, diags: &mut Diagnostics) -> Option<u64> {
        let n = match value.kind {
            NatRefKind::Pow2(exp) if exp < 63 => 1u64 << exp,
            NatRefKind::Num(n) => n,
            _ => {
                diags.error(
                    DiagnosticKind::InvalidParameter,
                    value.span,
                    "ring dimension n must be a constant",
                );
                return None;
            }
        };
        if n < 2 || !n.is_power_of_two() {
            diags.error(
                DiagnosticKind::InvalidParameter,
                value.span,
                format!("ring dimension n={n} must be a power of two"),
            );
            return None;
        }
        Some(n)
    }

    fn validate_lambda(&self, value: &NatRef, diags: &mut Diagnostics) -> Option<u32> {
        let lambda = concrete_value(value);
        match lambda {
            Some(128) | Some(192) | Some(256) => lambda.map(|v| v as u32),
            _ => {
                diags.error(
                    DiagnosticKind::InvalidParameter,
                    value.span,
                    "security parameter λ must be 128, 192 or 256",
                );
                None
            }
        }
    }

    fn validate_p(&self, value: &NatRef, diags: &mut Diagnostics) -> Option<u64> {
        match concrete_value(value) {
            Some(p) if p >= 2 && p % 2 == 1 => Some(p),
            _ => {
                diags.error_help(
                    DiagnosticKind::InvalidParameter,
                    value.span,
                    "plaintext modulus p must be an odd constant ≥ 2",
                    "p must be coprime to the power-of-two ciphertext modulus",
                );
                None
            }
        }
    }

    fn validate_scale(&self, value: &NatRef, log_q: u32, diags: &mut Diagnostics) -> Option<u32> {
        let NatRefKind::Pow2(exp) = value.kind else {
            diags.error(
                DiagnosticKind::InvalidParameter,
                value.span,
                "scale must be written in the form 2^k",
            );
            return None;
        };
        if exp == 0 || exp > log_q {
            diags.error(
                DiagnosticKind::InvalidParameter,
                value.span,
                format!("scale 2^{exp} must be positive and no larger than q"),
            );
            return None;
        }
        Some(exp)
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Frozen, read-only context table shared across checker workers.
#[derive(Clone, Debug, Default)]
pub struct Contexts {
    contexts: Vec<Context>,
}

impl Contexts {
    pub fn get(&self, id: CtxId) -> &Context {
        &self.contexts[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

fn canonical_param_name(name: &str) -> &str {
    match name {
        "λ" => "lambda",
        other => other,
    }
}

fn concrete_value(value: &NatRef) -> Option<u64> {
    match &value.kind {
        NatRefKind::Num(n) => Some(*n),
        NatRefKind::Pow2(exp) if *exp < 63 => Some(1u64 << exp),
        NatRefKind::Add(a, b) => Some(concrete_value(a)?.checked_add(concrete_value(b)?)?),
        NatRefKind::Sub(a, b) => concrete_value(a)?.checked_sub(concrete_value(b)?),
        _ => None,
    }
}

/// Chain length per family. RLWE chains spend roughly ten modulus bits per
/// rung; CKKS spends one scale per rescale; LWE has no chain.
fn max_level_for(family: SchemeFamily, log_q: u32, scale_bits: Option<u32>) -> u32 {
    const RLWE_BITS_PER_LEVEL: u32 = 10;
    match family {
        SchemeFamily::Bgv | SchemeFamily::Bfv => (log_q / RLWE_BITS_PER_LEVEL).saturating_sub(1),
        SchemeFamily::Ckks => {
            let scale = scale_bits.unwrap_or(log_q);
            (log_q / scale.max(1)).saturating_sub(1)
        }
        SchemeFamily::Lwe => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ciphra_ast::{span, NatRef, UsingClause};

    fn bgv_clause(n_exp: u32) -> UsingClause {
        let sp = span(0, 10);
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

    #[test]
    fn structurally_equal_clauses_intern_to_one_entry() {
        let registry = ContextRegistry::new();
        let mut diags = Diagnostics::new(32);
        let a = registry.resolve(&bgv_clause(15), &mut diags).unwrap();
        let b = registry.resolve(&bgv_clause(15), &mut diags).unwrap();
        let c = registry.resolve(&bgv_clause(14), &mut diags).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        let contexts = registry.freeze();
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts.get(a).max_level, 5);
    }

    #[test]
    fn unknown_family_is_rejected() {
        let registry = ContextRegistry::new();
        let mut diags = Diagnostics::new(32);
        let sp = span(0, 3);
        let clause = UsingClause::new(sp, "TFHE", vec![]);
        assert!(registry.resolve(&clause, &mut diags).is_none());
        assert_eq!(diags.into_sorted()[0].kind, DiagnosticKind::UnknownScheme);
    }

    #[test]
    fn missing_parameter_is_reported_per_name() {
        let registry = ContextRegistry::new();
        let mut diags = Diagnostics::new(32);
        let sp = span(0, 10);
        let clause = UsingClause::new(sp, "BGV", vec![("q", NatRef::pow2(sp, 60))]);
        assert!(registry.resolve(&clause, &mut diags).is_none());
        let kinds: Vec<_> = diags.into_sorted().into_iter().map(|d| d.kind).collect();
        assert_eq!(kinds.len(), 3);
        assert!(kinds.iter().all(|k| *k == DiagnosticKind::MissingParameter));
    }

    #[test]
    fn q_must_keep_its_power_of_two_shape() {
        let registry = ContextRegistry::new();
        let mut diags = Diagnostics::new(32);
        let sp = span(0, 10);
        let clause = UsingClause::new(
            sp,
            "BGV",
            vec![
                ("q", NatRef::num(sp, 1_152_921_504_606_846_976)),
                ("p", NatRef::num(sp, 257)),
                ("n", NatRef::pow2(sp, 15)),
                ("lambda", NatRef::num(sp, 128)),
            ],
        );
        assert!(registry.resolve(&clause, &mut diags).is_none());
        assert_eq!(diags.into_sorted()[0].kind, DiagnosticKind::InvalidParameter);
    }

    #[test]
    fn even_plaintext_modulus_is_rejected() {
        let registry = ContextRegistry::new();
        let mut diags = Diagnostics::new(32);
        let sp = span(0, 10);
        let clause = UsingClause::new(
            sp,
            "BGV",
            vec![
                ("q", NatRef::pow2(sp, 60)),
                ("p", NatRef::num(sp, 256)),
                ("n", NatRef::pow2(sp, 15)),
                ("lambda", NatRef::num(sp, 128)),
            ],
        );
        assert!(registry.resolve(&clause, &mut diags).is_none());
        assert_eq!(diags.into_sorted()[0].kind, DiagnosticKind::InvalidParameter);
    }

    #[test]
    fn lambda_accepts_the_standard_security_levels() {
        let registry = ContextRegistry::new();
        let sp = span(0, 10);
        for (lambda, ok) in [(128, true), (192, true), (256, true), (80, false)] {
            let mut diags = Diagnostics::new(32);
            let clause = UsingClause::new(
                sp,
                "BGV",
                vec![
                    ("q", NatRef::pow2(sp, 60)),
                    ("p", NatRef::num(sp, 257)),
                    ("n", NatRef::pow2(sp, 15)),
                    ("lambda", NatRef::num(sp, lambda)),
                ],
            );
            assert_eq!(registry.resolve(&clause, &mut diags).is_some(), ok);
        }
    }
}
