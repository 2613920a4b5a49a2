#![forbid(unsafe_code)]

use ciphra_ast::EffectName;

/// One side-effect class a function may carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Effect {
    /// Depends on secret or evaluation key material.
    Keyed,
    /// Draws randomness.
    Random,
}

impl Effect {
    pub fn display(&self) -> &'static str {
        match self {
            Effect::Keyed => "Keyed",
            Effect::Random => "Random",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            Effect::Keyed => 0b01,
            Effect::Random => 0b10,
        }
    }
}

/// Bit-set over the closed effect enumeration. The empty set is `Pure`.
///
/// Effects propagate by union through call chains and never attenuate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct EffectSet(u8);

impl EffectSet {
    pub const PURE: EffectSet = EffectSet(0);

    pub fn of(effect: Effect) -> EffectSet {
        EffectSet(effect.bit())
    }

    pub fn from_annotation(names: &[EffectName]) -> EffectSet {
        let mut set = EffectSet::PURE;
        for name in names {
            set.insert(match name {
                EffectName::Keyed => Effect::Keyed,
                EffectName::Random => Effect::Random,
            });
        }
        set
    }

    pub fn insert(&mut self, effect: Effect) {
        self.0 |= effect.bit();
    }

    pub fn union(self, other: EffectSet) -> EffectSet {
        EffectSet(self.0 | other.0)
    }

    pub fn contains(&self, effect: Effect) -> bool {
        self.0 & effect.bit() != 0
    }

    pub fn is_pure(&self) -> bool {
        self.0 == 0
    }

    /// `self ⊆ other`.
    pub fn is_subset_of(&self, other: &EffectSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn display(&self) -> String {
        if self.is_pure() {
            return "pure".to_string();
        }
        let mut parts = Vec::new();
        for effect in [Effect::Keyed, Effect::Random] {
            if self.contains(effect) {
                parts.push(format!("!{}", effect.display()));
            }
        }
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_is_pure() {
        assert!(EffectSet::PURE.is_pure());
        assert_eq!(EffectSet::PURE.display(), "pure");
    }

    #[test]
    fn union_and_subset() {
        let keyed = EffectSet::of(Effect::Keyed);
        let random = EffectSet::of(Effect::Random);
        let both = keyed.union(random);
        assert!(keyed.is_subset_of(&both));
        assert!(random.is_subset_of(&both));
        assert!(!both.is_subset_of(&keyed));
        assert_eq!(both.display(), "!Keyed !Random");
    }

    #[test]
    fn annotation_round_trip() {
        let set = EffectSet::from_annotation(&[EffectName::Random]);
        assert!(set.contains(Effect::Random));
        assert!(!set.contains(Effect::Keyed));
    }
}
