#![forbid(unsafe_code)]

//! Level and noise-budget transfer rules for the FHE primitives.
//!
//! The checker tracks a symbolic noise-budget upper bound per value, not the
//! numeric noise itself. Capacity is enforced wherever the ciphertext level
//! is concrete; bodies generic over a level assume baseline noise on entry
//! and are re-checked per concrete call site through the constraint solver.
//! Refinement failures produce one diagnostic and an `Error` type so the
//! fault does not cascade.

use ciphra_ast::Span;

use crate::context::{Context, Contexts};
use crate::diagnostics::{DiagnosticKind, Diagnostics};
use crate::nat::{linear_eq, Nat, NatTable};
use crate::types::Type;

/// Family-specific noise growth, pluggable per compilation run.
pub trait NoiseModel: Sync {
    /// Budget units consumed by a fresh encryption.
    fn fresh(&self, ctx: &Context) -> u32;
    /// Budget after a level-reducing operation lands on `level`.
    fn baseline(&self, ctx: &Context, level: u32) -> u32;
    /// Homomorphic addition/subtraction.
    fn add(&self, a: u32, b: u32) -> u32;
    /// Ciphertext-ciphertext multiplication (via the evaluation key).
    fn multiply(&self, a: u32, b: u32) -> u32;
    /// Plaintext-ciphertext multiplication.
    fn plain_multiply(&self, a: u32) -> u32;
    /// Total budget available at `level` with `raised` extra chain steps.
    fn capacity(&self, ctx: &Context, level: u32, raised: u32) -> u32;
}

/// Default model: a monotonically consumed depth budget. Multiplication sums
/// the operand bounds (log-domain growth), additions keep the larger bound,
/// and every chain rung grants a fixed number of units.
pub struct DepthBudget {
    pub units_per_level: u32,
}

impl Default for DepthBudget {
    fn default() -> Self {
        Self { units_per_level: 8 }
    }
}

impl NoiseModel for DepthBudget {
    fn fresh(&self, _ctx: &Context) -> u32 {
        1
    }

    fn baseline(&self, _ctx: &Context, _level: u32) -> u32 {
        1
    }

    fn add(&self, a: u32, b: u32) -> u32 {
        a.max(b)
    }

    fn multiply(&self, a: u32, b: u32) -> u32 {
        a.saturating_add(b)
    }

    fn plain_multiply(&self, a: u32) -> u32 {
        a.saturating_add(1)
    }

    fn capacity(&self, _ctx: &Context, level: u32, raised: u32) -> u32 {
        self.units_per_level.saturating_mul(level + 1 + raised)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherBinOp {
    Add,
    Sub,
    Mul,
}

/// Stateless refinement service; borrows the frozen context table and the
/// run's noise model, retains nothing across calls.
pub struct Refine<'a> {
    pub contexts: &'a Contexts,
    pub model: &'a dyn NoiseModel,
}

impl<'a> Refine<'a> {
    /// Cipher ⊗ cipher. Operands must share context, level and modulus
    /// chain; multiplication additionally consumes noise budget.
    pub fn combine(
        &self,
        op: CipherBinOp,
        lhs: &Type,
        lnoise: u32,
        rhs: &Type,
        rnoise: u32,
        span: Span,
        table: &NatTable,
        diags: &mut Diagnostics,
    ) -> (Type, u32) {
        let (
            Type::Cipher {
                ctx: ca,
                level: la,
                scale: _,
                raised: ra,
            },
            Type::Cipher {
                ctx: cb,
                level: lb,
                raised: rb,
                ..
            },
        ) = (lhs, rhs)
        else {
            // Shape errors belong to overload resolution, not here.
            return (Type::Error, 0);
        };

        if ca != cb {
            diags.error(
                DiagnosticKind::IncompatibleModuli,
                span,
                format!(
                    "operands were encrypted under different contexts: {} vs {}",
                    self.contexts.get(*ca).display(),
                    self.contexts.get(*cb).display()
                ),
            );
            return (Type::Error, 0);
        }
        if ra != rb {
            diags.error_help(
                DiagnosticKind::IncompatibleModuli,
                span,
                "operands sit on different modulus chains",
                "apply mod_down to the raised operand first",
            );
            return (Type::Error, 0);
        }
        if !linear_eq(la, lb) {
            diags.error_help(
                DiagnosticKind::IncompatibleLevels,
                span,
                format!(
                    "operand levels differ: {} vs {}",
                    la.display(table),
                    lb.display(table)
                ),
                "bring both operands to the same level with mod_down",
            );
            return (Type::Error, 0);
        }

        let noise = match op {
            CipherBinOp::Add | CipherBinOp::Sub => self.model.add(lnoise, rnoise),
            CipherBinOp::Mul => {
                let grown = self.model.multiply(lnoise, rnoise);
                if self.exceeds_capacity(*ca, la, *ra, grown) {
                    diags.error_help(
                        DiagnosticKind::NoiseBudgetExceeded,
                        span,
                        format!(
                            "multiplication would consume {grown} budget units, beyond the \
                             chain capacity at level {}",
                            la.display(table)
                        ),
                        "insert mod_down to reset the noise budget before multiplying again",
                    );
                    return (Type::Error, 0);
                }
                grown
            }
        };
        (lhs.clone(), noise)
    }

    /// Cipher ⊗ plaintext/int. Level and chain carry through unchanged.
    pub fn combine_plain(
        &self,
        op: CipherBinOp,
        cipher: &Type,
        cnoise: u32,
        span: Span,
        table: &NatTable,
        diags: &mut Diagnostics,
    ) -> (Type, u32) {
        let Type::Cipher {
            ctx, level, raised, ..
        } = cipher
        else {
            return (Type::Error, 0);
        };
        let noise = match op {
            CipherBinOp::Add | CipherBinOp::Sub => cnoise,
            CipherBinOp::Mul => {
                let grown = self.model.plain_multiply(cnoise);
                if self.exceeds_capacity(*ctx, level, *raised, grown) {
                    diags.error(
                        DiagnosticKind::NoiseBudgetExceeded,
                        span,
                        format!(
                            "plaintext multiplication exceeds the noise budget at level {}",
                            level.display(table)
                        ),
                    );
                    return (Type::Error, 0);
                }
                grown
            }
        };
        (cipher.clone(), noise)
    }

    /// `mod_up`: level unchanged, chain widened one step. The bound is
    /// unchanged numerically but now measured against a larger modulus.
    pub fn mod_up(&self, cipher: &Type, noise: u32) -> (Type, u32) {
        let Type::Cipher {
            ctx,
            level,
            scale,
            raised,
        } = cipher
        else {
            return (Type::Error, 0);
        };
        (
            Type::Cipher {
                ctx: *ctx,
                level: level.clone(),
                scale: scale.clone(),
                raised: raised + 1,
            },
            noise,
        )
    }

    /// `mod_down`/`rescale`: level − 1, chain reset, noise back to the new
    /// level's baseline. Rescaling at level 0 exhausts the chain.
    pub fn mod_down(&self, cipher: &Type, span: Span, diags: &mut Diagnostics) -> (Type, u32) {
        let Type::Cipher {
            ctx, level, scale, ..
        } = cipher
        else {
            return (Type::Error, 0);
        };
        let new_level = match level.as_const() {
            Some(0) => {
                diags.error_help(
                    DiagnosticKind::LevelExhausted,
                    span,
                    "cannot rescale: the modulus chain is exhausted at level 0",
                    "the ciphertext has no multiplicative budget left",
                );
                return (Type::Error, 0);
            }
            Some(l) => Nat::Const(l - 1),
            None => Nat::Sub(Box::new(level.clone()), Box::new(Nat::Const(1))).fold(),
        };
        let baseline = match new_level.as_const() {
            Some(l) => self.model.baseline(self.contexts.get(*ctx), l as u32),
            None => self.model.baseline(self.contexts.get(*ctx), 0),
        };
        (
            Type::Cipher {
                ctx: *ctx,
                level: new_level,
                scale: scale.clone(),
                raised: 0,
            },
            baseline,
        )
    }

    /// `keyswitch` = `mod_up` → eval-key multiply → `mod_down`; the net
    /// effect is one level down with baseline noise on the original chain.
    pub fn keyswitch(
        &self,
        cipher: &Type,
        noise: u32,
        span: Span,
        diags: &mut Diagnostics,
    ) -> (Type, u32) {
        let (up, up_noise) = self.mod_up(cipher, noise);
        let Type::Cipher {
            ctx, level, raised, ..
        } = &up
        else {
            return (Type::Error, 0);
        };
        let key_noise = self.model.fresh(self.contexts.get(*ctx));
        let mixed = self.model.multiply(up_noise, key_noise);
        if self.exceeds_capacity(*ctx, level, *raised, mixed) {
            diags.error(
                DiagnosticKind::NoiseBudgetExceeded,
                span,
                "key switching exceeds the noise budget even on the widened chain",
            );
            return (Type::Error, 0);
        }
        self.mod_down(&up, span, diags)
    }

    fn exceeds_capacity(&self, ctx: crate::context::CtxId, level: &Nat, raised: u32, noise: u32) -> bool {
        let Some(level) = level.as_const() else {
            // Symbolic level: capacity is unknown here; call sites with
            // concrete levels re-run this check.
            return false;
        };
        noise > self.model.capacity(self.contexts.get(ctx), level as u32, raised)
    }
}
