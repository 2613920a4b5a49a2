#![forbid(unsafe_code)]

use std::collections::HashMap;

use crate::context::CtxId;
use crate::effects::EffectSet;
use crate::nat::{Nat, NatTable, NatVarId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TypeVarId(pub u32);

/// The refined type language. Ciphertext and plaintext types always carry a
/// level; it is a constant, or a symbolic natural bound by inference, never
/// implicit.
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    /// Recovery placeholder: already diagnosed, propagates silently.
    Error,
    Unit,
    Int,
    Bool,
    Cipher {
        ctx: CtxId,
        level: Nat,
        scale: Option<Nat>,
        /// `mod_up` widenings of the tracked modulus chain.
        raised: u32,
    },
    Plain {
        ctx: CtxId,
        level: Nat,
    },
    Vector {
        elem: Box<Type>,
        len: Nat,
    },
    Tuple(Vec<Type>),
    /// Structural record; fields kept sorted by name.
    Record(Vec<(String, Type)>),
    Fn {
        params: Vec<Type>,
        ret: Box<Type>,
        effects: EffectSet,
    },
    Ring {
        name: String,
        dim: u64,
    },
    Var(TypeVarId),
}

impl Type {
    pub fn record(mut fields: Vec<(String, Type)>) -> Type {
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        Type::Record(fields)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Type::Error)
    }

    pub fn contains_var(&self, id: TypeVarId) -> bool {
        match self {
            Type::Var(v) => *v == id,
            Type::Vector { elem, .. } => elem.contains_var(id),
            Type::Tuple(items) => items.iter().any(|t| t.contains_var(id)),
            Type::Record(fields) => fields.iter().any(|(_, t)| t.contains_var(id)),
            Type::Fn { params, ret, .. } => {
                params.iter().any(|t| t.contains_var(id)) || ret.contains_var(id)
            }
            _ => false,
        }
    }

    /// Substitute symbolic naturals throughout the type, folding closed
    /// level/length expressions to constants.
    pub fn subst_nats(&self, map: &HashMap<NatVarId, Nat>) -> Type {
        match self {
            Type::Cipher {
                ctx,
                level,
                scale,
                raised,
            } => Type::Cipher {
                ctx: *ctx,
                level: level.subst(map),
                scale: scale.as_ref().map(|s| s.subst(map)),
                raised: *raised,
            },
            Type::Plain { ctx, level } => Type::Plain {
                ctx: *ctx,
                level: level.subst(map),
            },
            Type::Vector { elem, len } => Type::Vector {
                elem: Box::new(elem.subst_nats(map)),
                len: len.subst(map),
            },
            Type::Tuple(items) => Type::Tuple(items.iter().map(|t| t.subst_nats(map)).collect()),
            Type::Record(fields) => Type::Record(
                fields
                    .iter()
                    .map(|(n, t)| (n.clone(), t.subst_nats(map)))
                    .collect(),
            ),
            Type::Fn {
                params,
                ret,
                effects,
            } => Type::Fn {
                params: params.iter().map(|t| t.subst_nats(map)).collect(),
                ret: Box::new(ret.subst_nats(map)),
                effects: *effects,
            },
            other => other.clone(),
        }
    }

    pub fn display(&self, nats: &NatTable) -> String {
        match self {
            Type::Error => "<error>".to_string(),
            Type::Unit => "Unit".to_string(),
            Type::Int => "Int".to_string(),
            Type::Bool => "Bool".to_string(),
            Type::Cipher {
                level,
                scale,
                raised,
                ..
            } => {
                let mut s = format!("CT[{}]", level.display(nats));
                if let Some(scale) = scale {
                    s.push_str(&format!("@2^{}", scale.display(nats)));
                }
                if *raised > 0 {
                    s.push_str(&format!("^{raised}"));
                }
                s
            }
            Type::Plain { level, .. } => format!("PT[{}]", level.display(nats)),
            Type::Vector { elem, len } => {
                format!("Vec[{}; {}]", elem.display(nats), len.display(nats))
            }
            Type::Tuple(items) => {
                let inner = items
                    .iter()
                    .map(|t| t.display(nats))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("({inner})")
            }
            Type::Record(fields) => {
                let inner = fields
                    .iter()
                    .map(|(n, t)| format!("{n}: {}", t.display(nats)))
                    .collect::<Vec<_>>()
                    .join(", ");
                format!("{{{inner}}}")
            }
            Type::Fn {
                params,
                ret,
                effects,
            } => {
                let inner = params
                    .iter()
                    .map(|t| t.display(nats))
                    .collect::<Vec<_>>()
                    .join(", ");
                let eff = if effects.is_pure() {
                    String::new()
                } else {
                    format!(" {}", effects.display())
                };
                format!("fn({inner}) -> {}{eff}", ret.display(nats))
            }
            Type::Ring { name, .. } => name.clone(),
            Type::Var(id) => format!("?{}", id.0),
        }
    }
}
