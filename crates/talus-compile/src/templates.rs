//! Kernel source templates.
//!
//! Each template is the skeleton of one specializable kernel class; the
//! registry fills the placeholders with emitted strategy text or literal
//! data at initialization. Templates double as documentation of the locals
//! a kernel class may read and write.

/// Velocity-prescription kernel.
///
/// Bound on entry: `family`, `t`, `X`, `Y`, `Z`, `vX`, `vY`, `vZ`, `omgX`,
/// `omgY`, `omgZ`, `LinPrescribed = 0`, `RotPrescribed = 0`. The strategy
/// cases overwrite the velocity locals and set the prescribed markers.
pub const VELOCITY_PRESCRIPTION: &str = "\
switch (family) {
_velPrescriptionStrategy_
default: { break; }
}
";

/// Position-prescription kernel.
///
/// Bound on entry: `family`, `t`, `X`, `Y`, `Z`, `oriW`, `oriX`, `oriY`,
/// `oriZ`, `LinPrescribed = 0`, `RotPrescribed = 0`.
pub const POSITION_PRESCRIPTION: &str = "\
switch (family) {
_posPrescriptionStrategy_
default: { break; }
}
";

/// Conditional family-change kernel.
///
/// Bound on entry: `family`, `newFamily = family`, `t`, `X`, `Y`, `Z`,
/// `vX`, `vY`, `vZ`, `omgX`, `omgY`, `omgZ`. Each rule guards on its source
/// family and assigns `newFamily` when its condition holds; a reassignment
/// outside the internal family range (the `_nFamilies_` literal spliced at
/// specialization) falls back to the unchanged tag.
pub const FAMILY_CHANGE: &str = "\
_familyChangeRules_
if (newFamily >= _nFamilies_) { newFamily = family; }
";

/// Custom contact force model kernel.
///
/// Bound on entry: `overlap`, `dt`, `normalX/Y/Z` (contact normal, a→b),
/// `velNormal` (relative normal speed, positive = approaching),
/// `velTanX/Y/Z`, `EStar`, `GStar`, `RStar`, `mStar`, `CoR`, `mu`, `Crr`,
/// `hisX/Y/Z` (tangential history carried across steps). The model writes
/// `forceX/Y/Z` (force on body a; b receives the negation) and may update
/// the history locals.
pub const FORCE_MODEL: &str = "\
_forceModel_
";

/// Inspector element-predicate kernel: a single expression over per-owner
/// locals (`X`, `Y`, `Z`, `vX`, `vY`, `vZ`, `absv`, `family`, `mass`),
/// reduced by the inspector's reduction flavour.
pub const INSPECTOR_PREDICATE: &str = "\
value = _inspectorPredicate_;
";

#[cfg(test)]
mod tests {
    use crate::{specialize, Program, Scope, SubstitutionMap};

    #[test]
    fn velocity_template_specializes_and_compiles() {
        let mut map = SubstitutionMap::new();
        map.insert(
            "velPrescriptionStrategy",
            "case 1: { vX = 0; vY = 0; vZ = 0; LinPrescribed = 1; break; }",
        );
        let source = specialize(super::VELOCITY_PRESCRIPTION, &map);
        let prog = Program::compile(&source).unwrap();

        let mut scope = Scope::new();
        for (k, v) in [
            ("family", 1.0),
            ("t", 0.0),
            ("X", 0.0),
            ("Y", 0.0),
            ("Z", 0.0),
            ("vX", 3.0),
            ("vY", 0.0),
            ("vZ", 0.0),
            ("omgX", 0.0),
            ("omgY", 0.0),
            ("omgZ", 0.0),
            ("LinPrescribed", 0.0),
            ("RotPrescribed", 0.0),
        ] {
            scope.set(k, v);
        }
        prog.run(&mut scope).unwrap();
        assert_eq!(scope.get("vX"), Some(0.0));
        assert_eq!(scope.get("LinPrescribed"), Some(1.0));
    }

    #[test]
    fn empty_strategy_still_compiles() {
        let mut map = SubstitutionMap::new();
        map.insert("velPrescriptionStrategy", " ");
        let source = specialize(super::VELOCITY_PRESCRIPTION, &map);
        let prog = Program::compile(&source).unwrap();
        let mut scope = Scope::new();
        scope.set("family", 9.0);
        prog.run(&mut scope).unwrap();
    }
}
