#![forbid(unsafe_code)]

//! Structural unification over refined types.
//!
//! Convention: `unify(expected, found)`. Symbolic naturals are rigid inside
//! the declaration that introduced them and only bind when explicitly marked
//! flexible (call-site instantiation); type variables always bind, guarded by
//! the occurs check. `Error` unifies with everything so one root cause does
//! not cascade.

use std::collections::{HashMap, HashSet};

use crate::nat::{linear_eq, Nat, NatVarId};
use crate::types::{Type, TypeVarId};

#[derive(Clone, Debug, PartialEq)]
pub enum UnifyError {
    Mismatch { expected: Type, found: Type },
    Occurs,
    Length { expected: Nat, found: Nat },
    Level { expected: Nat, found: Nat },
    Modulus,
    Shape,
    Arity { expected: usize, found: usize },
}

#[derive(Debug, Default)]
pub struct Unifier {
    subst: HashMap<TypeVarId, Type>,
    nat_subst: HashMap<NatVarId, Nat>,
    flexible_nats: HashSet<NatVarId>,
    next_type_var: u32,
}

impl Unifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fresh_var(&mut self) -> Type {
        let id = TypeVarId(self.next_type_var);
        self.next_type_var += 1;
        Type::Var(id)
    }

    /// Allow a symbolic natural to be bound by unification (call-site
    /// instantiation marks the callee's fresh copies this way).
    pub fn mark_flexible(&mut self, id: NatVarId) {
        self.flexible_nats.insert(id);
    }

    pub fn nat_binding(&self, id: NatVarId) -> Option<Nat> {
        self.nat_subst.get(&id).map(|n| self.resolve_nat(n))
    }

    pub fn resolve_nat(&self, nat: &Nat) -> Nat {
        let out = match nat {
            Nat::Const(v) => Nat::Const(*v),
            Nat::Sym(id) => match self.nat_subst.get(id) {
                Some(bound) => self.resolve_nat(bound),
                None => Nat::Sym(*id),
            },
            Nat::Add(a, b) => Nat::Add(Box::new(self.resolve_nat(a)), Box::new(self.resolve_nat(b))),
            Nat::Sub(a, b) => Nat::Sub(Box::new(self.resolve_nat(a)), Box::new(self.resolve_nat(b))),
        };
        out.fold()
    }

    /// Deeply apply the current substitution.
    pub fn resolve(&self, ty: &Type) -> Type {
        match ty {
            Type::Var(id) => match self.subst.get(id) {
                Some(bound) => self.resolve(bound),
                None => Type::Var(*id),
            },
            Type::Cipher {
                ctx,
                level,
                scale,
                raised,
            } => Type::Cipher {
                ctx: *ctx,
                level: self.resolve_nat(level),
                scale: scale.as_ref().map(|s| self.resolve_nat(s)),
                raised: *raised,
            },
            Type::Plain { ctx, level } => Type::Plain {
                ctx: *ctx,
                level: self.resolve_nat(level),
            },
            Type::Vector { elem, len } => Type::Vector {
                elem: Box::new(self.resolve(elem)),
                len: self.resolve_nat(len),
            },
            Type::Tuple(items) => Type::Tuple(items.iter().map(|t| self.resolve(t)).collect()),
            Type::Record(fields) => Type::Record(
                fields
                    .iter()
                    .map(|(n, t)| (n.clone(), self.resolve(t)))
                    .collect(),
            ),
            Type::Fn {
                params,
                ret,
                effects,
            } => Type::Fn {
                params: params.iter().map(|t| self.resolve(t)).collect(),
                ret: Box::new(self.resolve(ret)),
                effects: *effects,
            },
            other => other.clone(),
        }
    }

    pub fn unify(&mut self, expected: &Type, found: &Type) -> Result<(), UnifyError> {
        let expected = self.shallow(expected);
        let found = self.shallow(found);
        match (&expected, &found) {
            (Type::Error, _) | (_, Type::Error) => Ok(()),

            (Type::Var(a), Type::Var(b)) if a == b => Ok(()),
            (Type::Var(id), other) | (other, Type::Var(id)) => {
                let resolved = self.resolve(other);
                if resolved.contains_var(*id) {
                    return Err(UnifyError::Occurs);
                }
                self.subst.insert(*id, resolved);
                Ok(())
            }

            (Type::Unit, Type::Unit)
            | (Type::Int, Type::Int)
            | (Type::Bool, Type::Bool) => Ok(()),

            (
                Type::Cipher {
                    ctx: ca,
                    level: la,
                    scale: sa,
                    raised: ra,
                },
                Type::Cipher {
                    ctx: cb,
                    level: lb,
                    scale: sb,
                    raised: rb,
                },
            ) => {
                if ca != cb || ra != rb {
                    return Err(UnifyError::Modulus);
                }
                match (sa, sb) {
                    (None, None) => {}
                    (Some(a), Some(b)) => self.unify_nat(a, b, NatPosition::Level)?,
                    _ => {
                        return Err(UnifyError::Mismatch {
                            expected: expected.clone(),
                            found: found.clone(),
                        })
                    }
                }
                self.unify_nat(la, lb, NatPosition::Level)
            }

            (Type::Plain { ctx: ca, level: la }, Type::Plain { ctx: cb, level: lb }) => {
                if ca != cb {
                    return Err(UnifyError::Modulus);
                }
                self.unify_nat(la, lb, NatPosition::Level)
            }

            (
                Type::Vector { elem: ea, len: la },
                Type::Vector { elem: eb, len: lb },
            ) => {
                self.unify(ea, eb)?;
                self.unify_nat(la, lb, NatPosition::Length)
            }

            (Type::Tuple(a), Type::Tuple(b)) => {
                if a.len() != b.len() {
                    return Err(UnifyError::Shape);
                }
                for (x, y) in a.iter().zip(b.iter()) {
                    self.unify(x, y)?;
                }
                Ok(())
            }

            (Type::Record(a), Type::Record(b)) => {
                if a.len() != b.len() || a.iter().zip(b.iter()).any(|((n, _), (m, _))| n != m) {
                    return Err(UnifyError::Shape);
                }
                for ((_, x), (_, y)) in a.iter().zip(b.iter()) {
                    self.unify(x, y)?;
                }
                Ok(())
            }

            (
                Type::Fn {
                    params: pa,
                    ret: ra,
                    effects: ea,
                },
                Type::Fn {
                    params: pb,
                    ret: rb,
                    effects: eb,
                },
            ) => {
                if pa.len() != pb.len() {
                    return Err(UnifyError::Arity {
                        expected: pa.len(),
                        found: pb.len(),
                    });
                }
                // A function value may carry fewer effects than the position
                // expects, never more.
                if !eb.is_subset_of(ea) {
                    return Err(UnifyError::Mismatch {
                        expected: expected.clone(),
                        found: found.clone(),
                    });
                }
                for (x, y) in pa.iter().zip(pb.iter()) {
                    self.unify(x, y)?;
                }
                self.unify(ra, rb)
            }

            (Type::Ring { name: na, .. }, Type::Ring { name: nb, .. }) if na == nb => Ok(()),

            _ => Err(UnifyError::Mismatch {
                expected: expected.clone(),
                found: found.clone(),
            }),
        }
    }

    fn shallow(&self, ty: &Type) -> Type {
        match ty {
            Type::Var(id) => match self.subst.get(id) {
                Some(bound) => self.shallow(bound),
                None => ty.clone(),
            },
            other => other.clone(),
        }
    }

    fn unify_nat(&mut self, a: &Nat, b: &Nat, pos: NatPosition) -> Result<(), UnifyError> {
        let ra = self.resolve_nat(a);
        let rb = self.resolve_nat(b);
        if linear_eq(&ra, &rb) {
            return Ok(());
        }
        match (&ra, &rb) {
            (Nat::Sym(id), other) if self.flexible_nats.contains(id) => {
                if other.contains(*id) {
                    return Err(UnifyError::Occurs);
                }
                self.nat_subst.insert(*id, other.clone());
                Ok(())
            }
            (other, Nat::Sym(id)) if self.flexible_nats.contains(id) => {
                if other.contains(*id) {
                    return Err(UnifyError::Occurs);
                }
                self.nat_subst.insert(*id, other.clone());
                Ok(())
            }
            _ => Err(match pos {
                NatPosition::Length => UnifyError::Length {
                    expected: ra,
                    found: rb,
                },
                NatPosition::Level => UnifyError::Level {
                    expected: ra,
                    found: rb,
                },
            }),
        }
    }
}

#[derive(Clone, Copy)]
enum NatPosition {
    Level,
    Length,
}
