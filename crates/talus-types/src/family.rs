//! Family records: motion prescriptions, contact-disable pairs, and
//! conditional family-change rules.
//!
//! Families are user-chosen integers; the preprocessor remaps them to a
//! dense 0-based range at initialization. Records here carry user-level
//! numbers; remapping happens when the family table is compiled.

use serde::{Deserialize, Serialize};

/// One prescribed channel: absent, or a closed-form expression in simulation
/// time and per-body state (`t`, `X`, `Y`, `Z`, `vX`, ..., `omgZ`).
pub type PrescribedChannel = Option<String>;

/// An unordered pair of user-level family numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyPair {
    /// First family number.
    pub a: u32,
    /// Second family number. May equal `a` to address self-contact.
    pub b: u32,
}

/// Conditional family reassignment: owners in `from` move to `to` whenever
/// `condition` evaluates true for them. Evaluated every step, in declaration
/// order, first match wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyChangeRule {
    /// Family the rule watches.
    pub from: u32,
    /// Family matching owners are moved to.
    pub to: u32,
    /// Boolean expression over per-body state.
    pub condition: String,
}

/// Per-family motion prescription, as supplied by the user.
///
/// Multiple records addressed to the same family merge at initialization:
/// concrete channels win over absent ones, and the dictate booleans
/// OR-combine. A dictated channel group overrides integration entirely; a
/// non-dictated one merely seeds it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyPrescription {
    /// User-level family number this record addresses.
    pub family: u32,
    /// Linear velocity expressions, per axis.
    pub lin_vel: [PrescribedChannel; 3],
    /// Angular velocity expressions (owner local frame), per axis.
    pub ang_vel: [PrescribedChannel; 3],
    /// Position expressions, per axis.
    pub lin_pos: [PrescribedChannel; 3],
    /// Orientation quaternion expression (w, x, y, z).
    pub quat: PrescribedChannel,
    /// Prescribed linear velocity overrides integration.
    pub lin_vel_dictated: bool,
    /// Prescribed angular velocity overrides integration.
    pub rot_vel_dictated: bool,
    /// Prescribed position overrides integration.
    pub lin_pos_dictated: bool,
    /// Prescribed orientation overrides integration.
    pub rot_pos_dictated: bool,
    /// Velocity channels come from an external co-simulation source rather
    /// than expressions.
    pub external_vel: bool,
    /// Position channels come from an external co-simulation source.
    pub external_pos: bool,
    /// Whether any user call populated this record.
    pub used: bool,
}

impl FamilyPrescription {
    /// The all-channels-zero, fully dictated prescription that pins a family
    /// in place.
    #[must_use]
    pub fn fixed(family: u32) -> Self {
        let zero = || Some("0".to_string());
        Self {
            family,
            lin_vel: [zero(), zero(), zero()],
            ang_vel: [zero(), zero(), zero()],
            lin_pos: [None, None, None],
            quat: None,
            lin_vel_dictated: true,
            rot_vel_dictated: true,
            lin_pos_dictated: true,
            rot_pos_dictated: true,
            external_vel: false,
            external_pos: false,
            used: true,
        }
    }

    /// Merges `other` into `self` field-wise: concrete channels replace
    /// absent ones, dictate flags OR-combine.
    pub fn merge_from(&mut self, other: &Self) {
        for i in 0..3 {
            if other.lin_vel[i].is_some() {
                self.lin_vel[i].clone_from(&other.lin_vel[i]);
            }
            if other.ang_vel[i].is_some() {
                self.ang_vel[i].clone_from(&other.ang_vel[i]);
            }
            if other.lin_pos[i].is_some() {
                self.lin_pos[i].clone_from(&other.lin_pos[i]);
            }
        }
        if other.quat.is_some() {
            self.quat.clone_from(&other.quat);
        }
        self.lin_vel_dictated |= other.lin_vel_dictated;
        self.rot_vel_dictated |= other.rot_vel_dictated;
        self.lin_pos_dictated |= other.lin_pos_dictated;
        self.rot_pos_dictated |= other.rot_pos_dictated;
        self.external_vel |= other.external_vel;
        self.external_pos |= other.external_pos;
        self.used |= other.used;
    }

    /// True when every velocity channel is prescribed and dictated: the
    /// marker the broad phase uses to skip fixed-fixed pairs.
    #[must_use]
    pub fn pins_all_velocities(&self) -> bool {
        self.lin_vel_dictated
            && self.rot_vel_dictated
            && self.lin_vel.iter().all(Option::is_some)
            && self.ang_vel.iter().all(Option::is_some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_prescription_pins_all_velocities() {
        assert!(FamilyPrescription::fixed(255).pins_all_velocities());
        assert!(!FamilyPrescription::default().pins_all_velocities());
    }

    #[test]
    fn merge_keeps_concrete_channels_and_ors_dictates() {
        let mut base = FamilyPrescription {
            family: 3,
            lin_vel: [Some("1".into()), None, None],
            used: true,
            ..Default::default()
        };
        let other = FamilyPrescription {
            family: 3,
            lin_vel: [None, Some("2".into()), None],
            lin_vel_dictated: true,
            used: true,
            ..Default::default()
        };
        base.merge_from(&other);
        assert_eq!(base.lin_vel[0].as_deref(), Some("1"));
        assert_eq!(base.lin_vel[1].as_deref(), Some("2"));
        assert!(base.lin_vel[2].is_none());
        assert!(base.lin_vel_dictated);
    }
}
