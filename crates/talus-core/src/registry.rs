//! User-facing caches: everything loaded between solver construction and
//! initialization lives here in raw form.
//!
//! The registry exclusively owns templates and materials; users hold cheap
//! index handles. At initialization the preprocessor ([`crate::flatten`])
//! turns these caches into the flattened arrays the workers consume; the
//! caches themselves survive so re-initialization and mid-run additions work
//! from the same source of truth.

use nalgebra::{UnitQuaternion, Vector3};
use talus_types::{
    AnalyticalKind, FamilyChangeRule, FamilyPair, FamilyPrescription, Material, MaterialSet,
    NormalSign, Warning, RESERVED_FAMILY, TINY,
};

use crate::anomaly::AnomalyLog;
use crate::error::DemError;

/// Handle to a loaded clump template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClumpTemplateHandle(pub(crate) u32);

/// Handle to a batch of clumps added together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClumpBatchHandle(pub(crate) u32);

/// Handle to an external (analytical) object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalObjectHandle(pub(crate) u32);

/// Handle to a mesh object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshHandle(pub(crate) u32);

/// A clump topology: masses, principal moments, and component spheres.
#[derive(Debug, Clone)]
pub struct ClumpTemplate {
    /// User-visible template mark; renumbered to the post-sort index at
    /// initialization so re-initialization is idempotent.
    pub mark: u32,
    /// Total mass.
    pub mass: f64,
    /// Principal moments of inertia.
    pub moi: Vector3<f64>,
    /// Component radii.
    pub radii: Vec<f64>,
    /// Component centers relative to the clump CoM.
    pub rel_pos: Vec<Vector3<f64>>,
    /// Component material indices into the registry's material table.
    pub materials: Vec<u32>,
}

impl ClumpTemplate {
    /// Number of component spheres.
    #[must_use]
    pub fn n_comp(&self) -> usize {
        self.radii.len()
    }
}

/// One analytical component row of an external object.
#[derive(Debug, Clone)]
pub struct AnalyticalComponent {
    /// Geometry kind.
    pub kind: AnalyticalKind,
    /// Material index.
    pub material: u32,
    /// Component position relative to the owner CoM.
    pub pos: Vector3<f64>,
    /// Orientation carrier: unit normal for planes/plates, axis direction
    /// for cylinders.
    pub rot: Vector3<f64>,
    /// First size scalar (plate half-extent u / cylinder radius).
    pub size1: f64,
    /// Second size scalar (plate half-extent v / cylinder half-length,
    /// 0 = unbounded).
    pub size2: f64,
    /// Third size scalar (reserved per kind).
    pub size3: f64,
    /// Which side of the surface pushes back.
    pub normal: NormalSign,
}

/// An external object: one owner carrying analytical components.
#[derive(Debug, Clone)]
pub struct ExternalObject {
    /// Load order, for tracker resolution.
    pub load_order: u32,
    /// Initial CoM position.
    pub pos: Vector3<f64>,
    /// Initial orientation.
    pub rot: UnitQuaternion<f64>,
    /// User family number.
    pub family: u32,
    /// Mass (boundaries default to 1; they are normally fixed).
    pub mass: f64,
    /// Principal moments of inertia.
    pub moi: Vector3<f64>,
    /// Analytical components.
    pub components: Vec<AnalyticalComponent>,
}

/// One triangle facet in owner-local frame.
#[derive(Debug, Clone, Copy)]
pub struct Facet {
    /// Vertices, in owner-local frame.
    pub vertices: [Vector3<f64>; 3],
    /// Material index.
    pub material: u32,
}

/// A mesh object: one owner carrying triangle facets.
#[derive(Debug, Clone)]
pub struct MeshObject {
    /// Load order, for tracker resolution.
    pub load_order: u32,
    /// Initial CoM position.
    pub pos: Vector3<f64>,
    /// Initial orientation.
    pub rot: UnitQuaternion<f64>,
    /// User family number.
    pub family: u32,
    /// Mass.
    pub mass: f64,
    /// Principal moments of inertia.
    pub moi: Vector3<f64>,
    /// Facets.
    pub facets: Vec<Facet>,
    /// Reference normals; when present, facet vertex order is corrected at
    /// flattening so the right-hand-rule normal aligns with them.
    pub reference_normals: Option<Vec<Vector3<f64>>>,
}

/// A batch of clumps loaded together: per-clump template, position, and
/// optional velocity/orientation/family overrides.
#[derive(Debug, Clone)]
pub struct ClumpBatch {
    /// Load order, for tracker resolution.
    pub load_order: u32,
    /// Template handle per clump.
    pub templates: Vec<ClumpTemplateHandle>,
    /// Initial CoM positions.
    pub positions: Vec<Vector3<f64>>,
    /// Initial velocities (zero when absent).
    pub velocities: Option<Vec<Vector3<f64>>>,
    /// Initial angular velocities, owner-local frame (zero when absent).
    pub ang_velocities: Option<Vec<Vector3<f64>>>,
    /// Initial orientations (identity when absent).
    pub orientations: Option<Vec<UnitQuaternion<f64>>>,
    /// User family numbers (defaulted to 0 with a warning when absent).
    pub families: Option<Vec<u32>>,
}

impl ClumpBatch {
    /// Number of clumps in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// The registry: everything the user loaded, in input order.
#[derive(Debug, Default)]
pub struct Registry {
    /// Canonical material table.
    pub materials: MaterialSet,
    /// Clump templates, in load order (re-sorted at initialization).
    pub templates: Vec<ClumpTemplate>,
    /// Clump batches.
    pub batches: Vec<ClumpBatch>,
    /// External objects.
    pub external_objects: Vec<ExternalObject>,
    /// Mesh objects.
    pub meshes: Vec<MeshObject>,
    /// Family prescriptions, raw (merged at initialization).
    pub prescriptions: Vec<FamilyPrescription>,
    /// No-contact family pairs.
    pub no_contact_pairs: Vec<FamilyPair>,
    /// Conditional family-change rules.
    pub change_rules: Vec<FamilyChangeRule>,
    /// Families whose entities stay out of dump files.
    pub no_output_families: Vec<u32>,
}

impl Registry {
    /// Loads a material, deduplicating under tolerance equivalence, and
    /// warns about non-physical restitution.
    pub fn load_material(&mut self, mat: Material, log: &AnomalyLog) -> u32 {
        if mat.cor < TINY {
            log.record(
                Warning::RestitutionRange,
                self.materials.len() as i64,
                format!(
                    "material {} has zero restitution; make sure this is intentional",
                    self.materials.len()
                ),
            );
        } else if mat.cor > 1.0 {
            log.record(
                Warning::RestitutionRange,
                self.materials.len() as i64,
                format!(
                    "material {} has restitution {} > 1; this is typically not physical and can destabilize the run",
                    self.materials.len(),
                    mat.cor
                ),
            );
        }
        self.materials.insert_or_find(mat)
    }

    /// Loads a clump template. Component arrays must agree in length; a
    /// degenerate mass or inertia is warned about, not rejected.
    pub fn load_clump_template(
        &mut self,
        mass: f64,
        moi: Vector3<f64>,
        radii: Vec<f64>,
        rel_pos: Vec<Vector3<f64>>,
        materials: Vec<u32>,
        log: &AnomalyLog,
    ) -> Result<ClumpTemplateHandle, DemError> {
        if radii.len() != rel_pos.len() || radii.len() != materials.len() {
            return Err(DemError::LengthMismatch(format!(
                "clump component radii ({}), positions ({}) and materials ({}) must agree",
                radii.len(),
                rel_pos.len(),
                materials.len()
            )));
        }
        if radii.is_empty() {
            return Err(DemError::config("a clump template needs at least one component"));
        }
        for m in &materials {
            if self.materials.get(*m).is_none() {
                return Err(DemError::config(format!(
                    "clump component references material index {m}, but only {} materials are loaded",
                    self.materials.len()
                )));
            }
        }
        let mark = self.templates.len() as u32;
        if mass < TINY || moi.norm() < TINY {
            log.record(
                Warning::DegenerateClump,
                i64::from(mark),
                format!("clump template {mark} has (near-)zero mass or moment of inertia"),
            );
        }
        for (i, r) in radii.iter().enumerate() {
            if *r < TINY {
                log.record(
                    Warning::ZeroRadius,
                    i as i64,
                    format!("component {i} of clump template {mark} has (near-)zero radius"),
                );
            }
        }
        self.templates.push(ClumpTemplate {
            mark,
            mass,
            moi,
            radii,
            rel_pos,
            materials,
        });
        Ok(ClumpTemplateHandle(mark))
    }

    /// Adds a batch of clumps; templates and positions pair up one-to-one.
    pub fn add_clumps(
        &mut self,
        templates: Vec<ClumpTemplateHandle>,
        positions: Vec<Vector3<f64>>,
    ) -> Result<ClumpBatchHandle, DemError> {
        if templates.len() != positions.len() {
            return Err(DemError::LengthMismatch(format!(
                "add_clumps got {} templates and {} positions",
                templates.len(),
                positions.len()
            )));
        }
        for t in &templates {
            if t.0 as usize >= self.templates.len() {
                return Err(DemError::config(format!(
                    "clump batch references template {} which is not loaded",
                    t.0
                )));
            }
        }
        let handle = ClumpBatchHandle(self.batches.len() as u32);
        self.batches.push(ClumpBatch {
            load_order: handle.0,
            templates,
            positions,
            velocities: None,
            ang_velocities: None,
            orientations: None,
            families: None,
        });
        Ok(handle)
    }

    /// Adds an empty external object; components are attached through the
    /// solver's builder methods.
    pub fn add_external_object(&mut self) -> ExternalObjectHandle {
        let handle = ExternalObjectHandle(self.external_objects.len() as u32);
        self.external_objects.push(ExternalObject {
            load_order: handle.0,
            pos: Vector3::zeros(),
            rot: UnitQuaternion::identity(),
            family: RESERVED_FAMILY,
            mass: 1.0,
            moi: Vector3::new(1.0, 1.0, 1.0),
            components: Vec::new(),
        });
        handle
    }

    /// Adds a mesh object from facet rows.
    pub fn add_mesh_object(
        &mut self,
        facets: Vec<Facet>,
        reference_normals: Option<Vec<Vector3<f64>>>,
        mass: f64,
        moi: Vector3<f64>,
        log: &AnomalyLog,
    ) -> Result<MeshHandle, DemError> {
        if let Some(ns) = &reference_normals {
            if ns.len() != facets.len() {
                return Err(DemError::LengthMismatch(format!(
                    "mesh has {} facets but {} reference normals",
                    facets.len(),
                    ns.len()
                )));
            }
        }
        let handle = MeshHandle(self.meshes.len() as u32);
        if facets.is_empty() {
            log.record(
                Warning::EmptyMesh,
                i64::from(handle.0),
                format!("mesh {} contains zero triangle facets", handle.0),
            );
        }
        self.meshes.push(MeshObject {
            load_order: handle.0,
            pos: Vector3::zeros(),
            rot: UnitQuaternion::identity(),
            family: 0,
            mass,
            moi,
            facets,
            reference_normals,
        });
        Ok(handle)
    }

    /// The union of user family numbers appearing anywhere in the
    /// configuration: on clumps, external objects, meshes, prescriptions,
    /// no-contact pairs, and change rules. The reserved family is always a
    /// member.
    #[must_use]
    pub fn user_families(&self) -> Vec<u32> {
        let mut all: Vec<u32> = Vec::new();
        for batch in &self.batches {
            match &batch.families {
                Some(fams) => all.extend(fams.iter().copied()),
                None => all.push(0),
            }
        }
        all.extend(self.external_objects.iter().map(|o| o.family));
        all.extend(self.meshes.iter().map(|m| m.family));
        all.extend(self.prescriptions.iter().map(|p| p.family));
        for pair in &self.no_contact_pairs {
            all.push(pair.a);
            all.push(pair.b);
        }
        for rule in &self.change_rules {
            all.push(rule.from);
            all.push(rule.to);
        }
        all.push(RESERVED_FAMILY);
        all.sort_unstable();
        all.dedup();
        all
    }

    /// Drops all cached inputs, returning the registry to its constructed
    /// state.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> AnomalyLog {
        AnomalyLog::new()
    }

    #[test]
    fn clump_template_validates_component_lengths() {
        let mut reg = Registry::default();
        let log = log();
        let m = reg.load_material(Material::new(1e9, 0.3, 0.8, 0.5, 0.0), &log);
        let err = reg.load_clump_template(
            1.0,
            Vector3::new(1.0, 1.0, 1.0),
            vec![0.1, 0.1],
            vec![Vector3::zeros()],
            vec![m, m],
            &log,
        );
        assert!(matches!(err, Err(DemError::LengthMismatch(_))));
    }

    #[test]
    fn user_families_unions_all_sources() {
        let mut reg = Registry::default();
        let log = log();
        let m = reg.load_material(Material::new(1e9, 0.3, 0.8, 0.5, 0.0), &log);
        let t = reg
            .load_clump_template(
                1.0,
                Vector3::new(1.0, 1.0, 1.0),
                vec![0.1],
                vec![Vector3::zeros()],
                vec![m],
                &log,
            )
            .unwrap();
        let b = reg.add_clumps(vec![t], vec![Vector3::zeros()]).unwrap();
        reg.batches[b.0 as usize].families = Some(vec![3]);
        reg.change_rules.push(FamilyChangeRule {
            from: 3,
            to: 9,
            condition: "Z < 0".into(),
        });
        let fams = reg.user_families();
        assert!(fams.contains(&3));
        assert!(fams.contains(&9));
        assert!(fams.contains(&RESERVED_FAMILY));
    }

    #[test]
    fn zero_restitution_warns_but_loads() {
        let mut reg = Registry::default();
        let log = log();
        let _ = reg.load_material(Material::new(1e9, 0.3, 0.0, 0.5, 0.0), &log);
        assert_eq!(log.total(), 1);
        assert_eq!(reg.materials.len(), 1);
    }
}
