//! Family remapping, the packed contact mask, and compilation of motion
//! prescriptions and family-change rules into specialized kernels.
//!
//! User-chosen family numbers are remapped to a dense 0-based internal
//! range. The symmetric contact-allow matrix is stored as its packed upper
//! triangle. Prescriptions and change rules become kernel text (a
//! switch-case over internal family ids, and a chain of guarded mutations)
//! which the specialization pipeline compiles into executable programs.

use std::collections::HashMap;
use std::sync::Arc;

use talus_compile::{
    compact_code, csv_literals, specialize, templates, KernelCache, Program, SubstitutionMap,
};
use talus_types::{
    FamilyChangeRule, FamilyId, FamilyPair, FamilyPrescription, Warning, MAX_FAMILIES,
    RESERVED_FAMILY,
};

use crate::anomaly::AnomalyLog;
use crate::error::DemError;

/// The compiled family table, shared read-only by both workers.
#[derive(Debug)]
pub struct FamilyTable {
    user_to_internal: HashMap<u32, FamilyId>,
    internal_to_user: Vec<u32>,
    /// Packed upper triangle of the symmetric allow matrix.
    mask: Vec<bool>,
    /// Per internal family: all six velocity channels prescribed-to-zero
    /// and dictated.
    fixed: Vec<bool>,
    /// Per internal family: some prescription exists.
    has_prescription: Vec<bool>,
    /// Compiled velocity-prescription kernel.
    pub(crate) vel_kernel: Arc<Program>,
    /// Compiled position-prescription kernel.
    pub(crate) pos_kernel: Arc<Program>,
    /// Compiled family-change kernel, when any rule exists.
    pub(crate) change_kernel: Option<Arc<Program>>,
    /// Whether any family prescribes anything at all (skip flag for dT).
    pub(crate) any_prescription: bool,
}

impl FamilyTable {
    /// Number of distinct (internal) families.
    #[must_use]
    pub fn len(&self) -> usize {
        self.internal_to_user.len()
    }

    /// Whether the table is empty (never true after compilation: the
    /// reserved family always exists).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.internal_to_user.is_empty()
    }

    /// Internal id of a user family number.
    pub fn internal(&self, user: u32) -> Result<FamilyId, DemError> {
        self.user_to_internal
            .get(&user)
            .copied()
            .ok_or(DemError::UnknownFamily { family: user })
    }

    /// User family number of an internal id.
    #[must_use]
    pub fn user(&self, internal: FamilyId) -> u32 {
        self.internal_to_user
            .get(internal as usize)
            .copied()
            .unwrap_or(u32::from(internal))
    }

    /// Position of the unordered pair `(i, j)` in the packed upper
    /// triangle.
    #[inline]
    #[must_use]
    pub fn mask_index(i: FamilyId, j: FamilyId, n_families: usize) -> usize {
        let (lo, hi) = if i <= j {
            (i as usize, j as usize)
        } else {
            (j as usize, i as usize)
        };
        lo * n_families + hi - lo * (lo + 1) / 2
    }

    /// Whether contacts between two internal families are allowed.
    #[inline]
    #[must_use]
    pub fn allowed(&self, i: FamilyId, j: FamilyId) -> bool {
        self.mask[Self::mask_index(i, j, self.len())]
    }

    /// Whether an internal family is completely fixed.
    #[inline]
    #[must_use]
    pub fn is_fixed(&self, i: FamilyId) -> bool {
        self.fixed.get(i as usize).copied().unwrap_or(false)
    }

    /// Whether an internal family carries any prescription.
    #[inline]
    #[must_use]
    pub fn has_prescription(&self, i: FamilyId) -> bool {
        self.has_prescription.get(i as usize).copied().unwrap_or(false)
    }

    /// Whether a per-step family-change sweep is needed.
    #[must_use]
    pub fn has_change_rules(&self) -> bool {
        self.change_kernel.is_some()
    }
}

/// Compiles the family table from the registry's raw records.
///
/// `user_families` is the union of family numbers appearing anywhere in the
/// configuration; `present_families` those actually carried by some owner
/// (prescribed-but-absent families warn).
pub fn compile_family_table(
    user_families: &[u32],
    present_families: &[u32],
    prescriptions: &[FamilyPrescription],
    no_contact_pairs: &[FamilyPair],
    change_rules: &[FamilyChangeRule],
    cache: &KernelCache,
    ensure_line_numbers: bool,
    log: &AnomalyLog,
) -> Result<FamilyTable, DemError> {
    let n = user_families.len();
    if n > MAX_FAMILIES {
        return Err(DemError::Capacity {
            what: "family",
            count: n,
            max: MAX_FAMILIES,
            hint: "widen the family-id type",
        });
    }

    let mut user_to_internal = HashMap::with_capacity(n);
    let mut internal_to_user = Vec::with_capacity(n);
    for (i, &user) in user_families.iter().enumerate() {
        user_to_internal.insert(user, i as FamilyId);
        internal_to_user.push(user);
    }

    // Mask starts all-true; each disable call flips one unordered pair.
    let mut mask = vec![true; n * (n + 1) / 2];
    for pair in no_contact_pairs {
        let i = lookup(&user_to_internal, pair.a)?;
        let j = lookup(&user_to_internal, pair.b)?;
        mask[FamilyTable::mask_index(i, j, n)] = false;
    }

    // Merge prescriptions per user family; the reserved family is always
    // fixed, whatever else the user said about it.
    let mut merged: HashMap<u32, FamilyPrescription> = HashMap::new();
    for p in prescriptions {
        merged
            .entry(p.family)
            .or_insert_with(|| FamilyPrescription {
                family: p.family,
                ..Default::default()
            })
            .merge_from(p);
    }
    merged
        .entry(RESERVED_FAMILY)
        .or_insert_with(|| FamilyPrescription::fixed(RESERVED_FAMILY))
        .merge_from(&FamilyPrescription::fixed(RESERVED_FAMILY));

    for p in merged.values() {
        if p.used && p.family != RESERVED_FAMILY && !present_families.contains(&p.family) {
            log.record(
                Warning::UnusedPrescribedFamily,
                i64::from(p.family),
                format!(
                    "family {} carries a motion prescription but no simulation entity belongs to it",
                    p.family
                ),
            );
        }
    }

    let mut fixed = vec![false; n];
    let mut has_prescription = vec![false; n];
    for (user, p) in &merged {
        if let Some(&i) = user_to_internal.get(user) {
            fixed[i as usize] = p.pins_all_velocities();
            has_prescription[i as usize] = p.used;
        }
    }

    // Weave prescriptions into kernel text: one case per prescribing
    // internal family.
    let mut vel_cases = String::new();
    let mut pos_cases = String::new();
    let mut ordered: Vec<_> = merged.values().collect();
    ordered.sort_by_key(|p| p.family);
    for p in ordered {
        let Some(&internal) = user_to_internal.get(&p.family) else {
            continue;
        };
        if !p.used {
            continue;
        }
        emit_velocity_case(&mut vel_cases, internal, p);
        emit_position_case(&mut pos_cases, internal, p);
    }

    let mut map = SubstitutionMap::new();
    map.insert("velPrescriptionStrategy", vel_cases);
    map.insert("posPrescriptionStrategy", pos_cases);
    // Dense registry data rides in the same map as literals: the change
    // kernel splices the family count as its reassignment bound, and a
    // compile failure surfaces the mask alongside the failing strategy
    // text in the snapshot.
    map.insert("nFamilies", n.to_string());
    map.insert(
        "familyMasks",
        csv_literals(mask.iter().map(|&allowed| u8::from(allowed))),
    );

    // Family-change rules become a chain of guarded mutations over internal
    // ids, in declaration order (first match wins because later guards test
    // the still-unchanged `family` local while `newFamily` only tracks the
    // first assignment).
    let mut rules_text = String::new();
    for rule in change_rules {
        let from = lookup(&user_to_internal, rule.from)?;
        let to = lookup(&user_to_internal, rule.to)?;
        let cond = rule.condition.replace("return", "changed = ");
        rules_text.push_str(&format!(
            "if (family == {from}) {{ if (newFamily == family) {{ changed = 0; {} if (changed) {{ newFamily = {to}; }} }} }}\n",
            ensure_statement(&cond)
        ));
    }
    map.insert("familyChangeRules", rules_text);

    if ensure_line_numbers {
        map.compact_all();
    }

    let compile = |template: &str| -> Result<Arc<Program>, DemError> {
        let source = specialize(template, &map);
        cache
            .compile(&source)
            .map_err(|e| DemError::compile(e, map.snapshot()))
    };

    let vel_kernel = compile(templates::VELOCITY_PRESCRIPTION)?;
    let pos_kernel = compile(templates::POSITION_PRESCRIPTION)?;
    let change_kernel = if change_rules.is_empty() {
        None
    } else {
        Some(compile(templates::FAMILY_CHANGE)?)
    };

    let any_prescription = merged.values().any(|p| p.used);

    Ok(FamilyTable {
        user_to_internal,
        internal_to_user,
        mask,
        fixed,
        has_prescription,
        vel_kernel,
        pos_kernel,
        change_kernel,
        any_prescription,
    })
}

fn lookup(map: &HashMap<u32, FamilyId>, user: u32) -> Result<FamilyId, DemError> {
    map.get(&user)
        .copied()
        .ok_or(DemError::UnknownFamily { family: user })
}

/// Makes a user condition snippet a well-formed statement. Conditions
/// written in `return <expr>;` style were already rewritten to assign
/// `changed`; bare expressions get wrapped into that assignment here.
fn ensure_statement(cond: &str) -> String {
    let trimmed = cond.trim().trim_end_matches(';').trim_end();
    let mut s = if trimmed.contains("changed") {
        trimmed.to_string()
    } else {
        format!("changed = {trimmed}")
    };
    s.push(';');
    s
}

fn emit_velocity_case(out: &mut String, internal: FamilyId, p: &FamilyPrescription) {
    out.push_str(&format!("case {internal}: {{ "));
    if !p.external_vel {
        let names = ["vX", "vY", "vZ"];
        for (i, name) in names.iter().enumerate() {
            if let Some(expr) = &p.lin_vel[i] {
                out.push_str(&format!("{name} = {};\n", compact_code(expr)));
            }
        }
        let omg = ["omgX", "omgY", "omgZ"];
        for (i, name) in omg.iter().enumerate() {
            if let Some(expr) = &p.ang_vel[i] {
                out.push_str(&format!("{name} = {};\n", compact_code(expr)));
            }
        }
        out.push_str(&format!(
            "LinPrescribed = {}; RotPrescribed = {};\n",
            u8::from(p.lin_vel_dictated),
            u8::from(p.rot_vel_dictated)
        ));
    }
    out.push_str("break; }\n");
}

fn emit_position_case(out: &mut String, internal: FamilyId, p: &FamilyPrescription) {
    out.push_str(&format!("case {internal}: {{ "));
    if !p.external_pos {
        let names = ["X", "Y", "Z"];
        for (i, name) in names.iter().enumerate() {
            if let Some(expr) = &p.lin_pos[i] {
                out.push_str(&format!("{name} = {};\n", compact_code(expr)));
            }
        }
        if let Some(q) = &p.quat {
            // The quaternion formula is statement text assigning
            // oriW/oriX/oriY/oriZ directly.
            out.push_str(&format!("{}\n", compact_code(q)));
        }
        out.push_str(&format!(
            "LinPrescribed = {}; RotPrescribed = {};\n",
            u8::from(p.lin_pos_dictated),
            u8::from(p.rot_pos_dictated)
        ));
    }
    out.push_str("break; }\n");
}

#[cfg(test)]
mod tests {
    use super::*;
    use talus_compile::Scope;

    fn compile(
        families: &[u32],
        prescriptions: &[FamilyPrescription],
        pairs: &[FamilyPair],
        rules: &[FamilyChangeRule],
    ) -> FamilyTable {
        compile_family_table(
            families,
            families,
            prescriptions,
            pairs,
            rules,
            &KernelCache::new(),
            false,
            &AnomalyLog::new(),
        )
        .unwrap()
    }

    #[test]
    fn remap_is_dense_and_bijective() {
        let table = compile(&[1, 7, 42, RESERVED_FAMILY], &[], &[], &[]);
        assert_eq!(table.len(), 4);
        assert_eq!(table.internal(7).unwrap(), 1);
        assert_eq!(table.user(2), 42);
        assert_eq!(table.internal(RESERVED_FAMILY).unwrap(), 3);
    }

    #[test]
    fn mask_is_symmetric_and_disable_works() {
        let table = compile(
            &[0, 1, 2, RESERVED_FAMILY],
            &[],
            &[FamilyPair { a: 0, b: 2 }, FamilyPair { a: 1, b: 1 }],
            &[],
        );
        for i in 0..table.len() as FamilyId {
            for j in 0..table.len() as FamilyId {
                assert_eq!(table.allowed(i, j), table.allowed(j, i));
            }
        }
        let f0 = table.internal(0).unwrap();
        let f1 = table.internal(1).unwrap();
        let f2 = table.internal(2).unwrap();
        assert!(!table.allowed(f0, f2));
        assert!(!table.allowed(f1, f1));
        assert!(table.allowed(f0, f1));
    }

    #[test]
    fn reserved_family_is_always_fixed() {
        let table = compile(&[0, RESERVED_FAMILY], &[], &[], &[]);
        let r = table.internal(RESERVED_FAMILY).unwrap();
        assert!(table.is_fixed(r));
        assert!(!table.is_fixed(table.internal(0).unwrap()));
    }

    #[test]
    fn velocity_kernel_applies_prescription() {
        let p = FamilyPrescription {
            family: 5,
            lin_vel: [Some("-sin(t)".into()), Some("0".into()), Some("0".into())],
            lin_vel_dictated: true,
            used: true,
            ..Default::default()
        };
        let table = compile(&[0, 5, RESERVED_FAMILY], &[p], &[], &[]);
        let internal = table.internal(5).unwrap();

        let mut scope = Scope::new();
        for (k, v) in [
            ("family", f64::from(internal)),
            ("t", std::f64::consts::FRAC_PI_2),
            ("X", 0.0),
            ("Y", 0.0),
            ("Z", 0.0),
            ("vX", 9.0),
            ("vY", 9.0),
            ("vZ", 9.0),
            ("omgX", 0.0),
            ("omgY", 0.0),
            ("omgZ", 0.0),
            ("LinPrescribed", 0.0),
            ("RotPrescribed", 0.0),
        ] {
            scope.set(k, v);
        }
        table.vel_kernel.run(&mut scope).unwrap();
        assert!((scope.get("vX").unwrap() + 1.0).abs() < 1e-12);
        assert_eq!(scope.get("vY"), Some(0.0));
        assert_eq!(scope.get("LinPrescribed"), Some(1.0));
    }

    #[test]
    fn change_rule_kernel_reassigns_family() {
        let rule = FamilyChangeRule {
            from: 1,
            to: 2,
            condition: "Z < 0.05".into(),
        };
        let table = compile(&[1, 2, RESERVED_FAMILY], &[], &[], &[rule]);
        let kernel = table.change_kernel.as_ref().unwrap();
        let from = table.internal(1).unwrap();
        let to = table.internal(2).unwrap();

        let mut scope = Scope::new();
        for (k, v) in [
            ("family", f64::from(from)),
            ("newFamily", f64::from(from)),
            ("t", 0.0),
            ("X", 0.0),
            ("Y", 0.0),
            ("Z", 0.01),
            ("vX", 0.0),
            ("vY", 0.0),
            ("vZ", 0.0),
            ("omgX", 0.0),
            ("omgY", 0.0),
            ("omgZ", 0.0),
        ] {
            scope.set(k, v);
        }
        kernel.run(&mut scope).unwrap();
        assert_eq!(scope.get("newFamily"), Some(f64::from(to)));
    }

    #[test]
    fn too_many_families_is_a_capacity_error() {
        let families: Vec<u32> = (0..300).collect();
        let err = compile_family_table(
            &families,
            &families,
            &[],
            &[],
            &[],
            &KernelCache::new(),
            false,
            &AnomalyLog::new(),
        );
        assert!(matches!(err, Err(DemError::Capacity { what: "family", .. })));
    }
}
