//! The initialization preprocessor: turns registry caches into the
//! flattened arrays both workers consume.
//!
//! Work happens in dependency order: clump templates are sorted by
//! component count (ascending, so the small ones fall inside the
//! specialization budget and the big ones stay in global tables), template
//! marks are renumbered to their sorted positions (making
//! re-initialization idempotent), templates flatten into parallel arrays,
//! analytical and mesh objects append their mass properties and emit
//! per-component rows, and the derived counts are checked against their
//! index-type ceilings.

use nalgebra::{UnitQuaternion, Vector3};
use talus_types::{
    AnalyticalKind, NormalSign, Warning, RESERVED_FAMILY, SPECIALIZATION_COMPONENT_BUDGET, TINY,
};

use crate::anomaly::AnomalyLog;
use crate::error::DemError;
use crate::registry::Registry;

/// What kind of body an owner is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerKind {
    /// A clump instance; payload is the internal (sorted) template index.
    Clump(u32),
    /// An external analytical object; payload is its registry index.
    Analytical(u32),
    /// A mesh object; payload is its registry index.
    Mesh(u32),
}

/// The flattened model: immutable after initialization, shared read-only by
/// both workers.
#[derive(Debug, Clone)]
pub struct FlatModel {
    // ==================== Counts ====================
    /// Number of owners (clumps + external objects + meshes).
    pub n_owners: usize,
    /// Number of clump owners.
    pub n_clump_owners: usize,
    /// Number of component spheres across clump owners.
    pub n_spheres: usize,
    /// Number of analytical geometry rows.
    pub n_anal: usize,
    /// Number of triangle facets.
    pub n_tri: usize,

    // ==================== Mass properties ====================
    // Clump templates first, then one entry per external object, then one
    // per mesh. Indexed by `owner_prop`.
    /// Mass per property entry.
    pub prop_mass: Vec<f64>,
    /// Principal moments per property entry.
    pub prop_moi: Vec<Vector3<f64>>,

    // ==================== Clump templates (sorted) ====================
    /// First component index per template (length = template count).
    pub tpl_comp_adr: Vec<usize>,
    /// Component count per template.
    pub tpl_comp_num: Vec<usize>,
    /// Component radii, all templates concatenated.
    pub comp_radius: Vec<f64>,
    /// Component centers relative to the clump CoM.
    pub comp_rel_pos: Vec<Vector3<f64>>,
    /// Component material indices.
    pub comp_mat: Vec<u32>,
    /// How many leading templates fit the specialization budget.
    pub n_specializable_templates: usize,

    // ==================== Per owner ====================
    /// Mass-property index per owner.
    pub owner_prop: Vec<u32>,
    /// Owner kind per owner.
    pub owner_kind: Vec<OwnerKind>,

    // ==================== Spheres (per clump-owner instance) ====================
    /// Owning owner per sphere.
    pub sphere_owner: Vec<u32>,
    /// Sphere center relative to the owner CoM.
    pub sphere_rel_pos: Vec<Vector3<f64>>,
    /// Sphere radius.
    pub sphere_radius: Vec<f64>,
    /// Sphere material index.
    pub sphere_mat: Vec<u32>,

    // ==================== Analytical rows ====================
    /// Owning owner per analytical component.
    pub anal_owner: Vec<u32>,
    /// Geometry kind per component.
    pub anal_kind: Vec<AnalyticalKind>,
    /// Material index per component.
    pub anal_mat: Vec<u32>,
    /// Component position relative to the owner CoM.
    pub anal_pos: Vec<Vector3<f64>>,
    /// Orientation carrier (normal or axis) per component.
    pub anal_rot: Vec<Vector3<f64>>,
    /// First size scalar.
    pub anal_size1: Vec<f64>,
    /// Second size scalar.
    pub anal_size2: Vec<f64>,
    /// Third size scalar.
    pub anal_size3: Vec<f64>,
    /// Normal orientation flag.
    pub anal_normal: Vec<NormalSign>,

    // ==================== Triangle facets ====================
    /// Owning owner per facet.
    pub tri_owner: Vec<u32>,
    /// Material index per facet.
    pub tri_mat: Vec<u32>,
    /// Vertices in owner-local frame (order possibly corrected against the
    /// mesh's reference normals; the vertex set itself never changes).
    pub tri_vertices: Vec<[Vector3<f64>; 3]>,

    // ==================== Materials ====================
    /// Young's modulus per material.
    pub mat_e: Vec<f64>,
    /// Poisson ratio per material.
    pub mat_nu: Vec<f64>,
    /// Restitution per material.
    pub mat_cor: Vec<f64>,
    /// Friction per material.
    pub mat_mu: Vec<f64>,
    /// Rolling resistance per material.
    pub mat_crr: Vec<f64>,

    /// Smallest component sphere radius (drives the default bin size).
    pub smallest_radius: f64,
}

/// Initial owner state, consumed by the dynamic worker's array upload.
#[derive(Debug, Clone)]
pub struct InitialState {
    /// CoM positions.
    pub pos: Vec<Vector3<f64>>,
    /// Linear velocities.
    pub vel: Vec<Vector3<f64>>,
    /// Angular velocities (owner-local frame).
    pub ang_vel: Vec<Vector3<f64>>,
    /// Orientations.
    pub quat: Vec<UnitQuaternion<f64>>,
    /// User-level family numbers.
    pub family_user: Vec<u32>,
}

impl InitialState {
    /// The distinct user family numbers actually present on owners.
    #[must_use]
    pub fn present_families(&self) -> Vec<u32> {
        let mut f = self.family_user.clone();
        f.sort_unstable();
        f.dedup();
        f
    }
}

/// Runs the preprocessor. Mutates the registry only to renumber template
/// marks to their sorted positions.
pub fn flatten(reg: &mut Registry, log: &AnomalyLog) -> Result<(FlatModel, InitialState), DemError> {
    // ---- Sort clump templates by component count, stable on (count, mark).
    let n_tpl = reg.templates.len();
    let mut order: Vec<usize> = (0..n_tpl).collect();
    order.sort_by_key(|&i| (reg.templates[i].n_comp(), reg.templates[i].mark));
    // handle index -> internal (sorted) template index
    let mut handle_to_internal = vec![0u32; n_tpl];
    for (internal, &load_idx) in order.iter().enumerate() {
        handle_to_internal[load_idx] = internal as u32;
        reg.templates[load_idx].mark = internal as u32;
    }

    // ---- Flatten templates.
    let mut prop_mass = Vec::with_capacity(n_tpl);
    let mut prop_moi = Vec::with_capacity(n_tpl);
    let mut tpl_comp_adr = Vec::with_capacity(n_tpl);
    let mut tpl_comp_num = Vec::with_capacity(n_tpl);
    let mut comp_radius = Vec::new();
    let mut comp_rel_pos = Vec::new();
    let mut comp_mat = Vec::new();
    let mut smallest_radius = f64::MAX;
    for &load_idx in &order {
        let tpl = &reg.templates[load_idx];
        tpl_comp_adr.push(comp_radius.len());
        tpl_comp_num.push(tpl.n_comp());
        prop_mass.push(tpl.mass);
        prop_moi.push(tpl.moi);
        comp_radius.extend_from_slice(&tpl.radii);
        comp_rel_pos.extend_from_slice(&tpl.rel_pos);
        comp_mat.extend_from_slice(&tpl.materials);
        for &r in &tpl.radii {
            if r < smallest_radius {
                smallest_radius = r;
            }
        }
    }

    // ---- Specialization budget: mark the tail non-specializable.
    let mut n_specializable_templates = n_tpl;
    let mut acc = 0usize;
    for (i, num) in tpl_comp_num.iter().enumerate() {
        acc += num;
        if acc > SPECIALIZATION_COMPONENT_BUDGET {
            n_specializable_templates = i;
            log.record(
                Warning::SpecializationBudget,
                i as i64,
                format!(
                    "{n_tpl} clump templates loaded, but only {i} (totalling {} components) can be \
                     specialized; the rest stay in worker global tables",
                    acc - num
                ),
            );
            break;
        }
    }

    // ---- Owners: clumps first, then external objects, then meshes.
    let mut owner_prop = Vec::new();
    let mut owner_kind = Vec::new();
    let mut pos = Vec::new();
    let mut vel = Vec::new();
    let mut ang_vel = Vec::new();
    let mut quat = Vec::new();
    let mut family_user = Vec::new();

    let mut sphere_owner = Vec::new();
    let mut sphere_rel_pos = Vec::new();
    let mut sphere_radius = Vec::new();
    let mut sphere_mat = Vec::new();

    for batch in &reg.batches {
        let n = batch.len();
        if let Some(v) = &batch.velocities {
            if v.len() != n {
                return Err(DemError::LengthMismatch(format!(
                    "batch {} has {n} clumps but {} velocities",
                    batch.load_order,
                    v.len()
                )));
            }
        }
        if batch.families.is_none() && n > 0 {
            log.record(
                Warning::DefaultedFamily,
                i64::from(batch.load_order),
                format!(
                    "batch {} was loaded without family numbers; defaulting to family 0",
                    batch.load_order
                ),
            );
        }
        for i in 0..n {
            let internal_tpl = handle_to_internal[batch.templates[i].0 as usize];
            let owner = owner_prop.len() as u32;
            owner_prop.push(internal_tpl);
            owner_kind.push(OwnerKind::Clump(internal_tpl));
            pos.push(batch.positions[i]);
            vel.push(batch.velocities.as_ref().map_or(Vector3::zeros(), |v| v[i]));
            ang_vel.push(
                batch
                    .ang_velocities
                    .as_ref()
                    .map_or(Vector3::zeros(), |v| v[i]),
            );
            quat.push(
                batch
                    .orientations
                    .as_ref()
                    .map_or(UnitQuaternion::identity(), |q| q[i]),
            );
            let fam = batch.families.as_ref().map_or(0, |f| f[i]);
            if fam >= RESERVED_FAMILY {
                log.record(
                    Warning::ReservedFamilyUse,
                    i64::from(fam),
                    format!(
                        "a clump is assigned family {fam}, at or above the reserved fixed family \
                         {RESERVED_FAMILY}; it will be completely fixed"
                    ),
                );
            }
            family_user.push(fam);

            let adr = tpl_comp_adr[internal_tpl as usize];
            let num = tpl_comp_num[internal_tpl as usize];
            for c in adr..adr + num {
                sphere_owner.push(owner);
                sphere_rel_pos.push(comp_rel_pos[c]);
                sphere_radius.push(comp_radius[c]);
                sphere_mat.push(comp_mat[c]);
            }
        }
    }
    let n_clump_owners = owner_prop.len();

    // ---- External objects: each is its own mass property.
    let mut anal_owner = Vec::new();
    let mut anal_kind = Vec::new();
    let mut anal_mat = Vec::new();
    let mut anal_pos = Vec::new();
    let mut anal_rot = Vec::new();
    let mut anal_size1 = Vec::new();
    let mut anal_size2 = Vec::new();
    let mut anal_size3 = Vec::new();
    let mut anal_normal = Vec::new();

    for (i, obj) in reg.external_objects.iter().enumerate() {
        let owner = owner_prop.len() as u32;
        let prop = prop_mass.len() as u32;
        prop_mass.push(obj.mass);
        prop_moi.push(obj.moi);
        owner_prop.push(prop);
        owner_kind.push(OwnerKind::Analytical(i as u32));
        pos.push(obj.pos);
        vel.push(Vector3::zeros());
        ang_vel.push(Vector3::zeros());
        quat.push(obj.rot);
        family_user.push(obj.family);
        for comp in &obj.components {
            anal_owner.push(owner);
            anal_kind.push(comp.kind);
            anal_mat.push(comp.material);
            anal_pos.push(comp.pos);
            anal_rot.push(normalize_or(comp.rot, Vector3::z()));
            anal_size1.push(comp.size1);
            anal_size2.push(comp.size2);
            anal_size3.push(comp.size3);
            anal_normal.push(comp.normal);
        }
    }

    // ---- Meshes: owner per mesh, one row per facet, vertex order
    // corrected against reference normals.
    let mut tri_owner = Vec::new();
    let mut tri_mat = Vec::new();
    let mut tri_vertices = Vec::new();
    for (i, mesh) in reg.meshes.iter().enumerate() {
        let owner = owner_prop.len() as u32;
        let prop = prop_mass.len() as u32;
        prop_mass.push(mesh.mass);
        prop_moi.push(mesh.moi);
        owner_prop.push(prop);
        owner_kind.push(OwnerKind::Mesh(i as u32));
        pos.push(mesh.pos);
        vel.push(Vector3::zeros());
        ang_vel.push(Vector3::zeros());
        quat.push(mesh.rot);
        family_user.push(mesh.family);
        for (f, facet) in mesh.facets.iter().enumerate() {
            let mut v = facet.vertices;
            if let Some(refs) = &mesh.reference_normals {
                let n = (v[1] - v[0]).cross(&(v[2] - v[0]));
                if n.dot(&refs[f]) < 0.0 {
                    v.swap(1, 2);
                }
            }
            tri_owner.push(owner);
            tri_mat.push(facet.material);
            tri_vertices.push(v);
        }
    }

    // ---- Materials.
    let mats = reg.materials.entries();
    let mat_e: Vec<f64> = mats.iter().map(|m| m.e).collect();
    let mat_nu: Vec<f64> = mats.iter().map(|m| m.nu).collect();
    let mat_cor: Vec<f64> = mats.iter().map(|m| m.cor).collect();
    let mat_mu: Vec<f64> = mats.iter().map(|m| m.mu).collect();
    let mat_crr: Vec<f64> = mats.iter().map(|m| m.crr).collect();

    // ---- Capacity checks.
    let n_owners = owner_prop.len();
    check_capacity("owner", n_owners, u32::MAX as usize, "widen the owner-id type")?;
    check_capacity(
        "sphere component",
        sphere_owner.len(),
        u32::MAX as usize,
        "widen the geometry-id type",
    )?;
    check_capacity(
        "mass property",
        prop_mass.len(),
        u32::MAX as usize,
        "widen the mass-property index type",
    )?;

    let model = FlatModel {
        n_owners,
        n_clump_owners,
        n_spheres: sphere_owner.len(),
        n_anal: anal_owner.len(),
        n_tri: tri_owner.len(),
        prop_mass,
        prop_moi,
        tpl_comp_adr,
        tpl_comp_num,
        comp_radius,
        comp_rel_pos,
        comp_mat,
        n_specializable_templates,
        owner_prop,
        owner_kind,
        sphere_owner,
        sphere_rel_pos,
        sphere_radius,
        sphere_mat,
        anal_owner,
        anal_kind,
        anal_mat,
        anal_pos,
        anal_rot,
        anal_size1,
        anal_size2,
        anal_size3,
        anal_normal,
        tri_owner,
        tri_mat,
        tri_vertices,
        mat_e,
        mat_nu,
        mat_cor,
        mat_mu,
        mat_crr,
        smallest_radius: if smallest_radius == f64::MAX {
            0.0
        } else {
            smallest_radius
        },
    };
    let state = InitialState {
        pos,
        vel,
        ang_vel,
        quat,
        family_user,
    };
    Ok((model, state))
}

/// Decides the broad-phase bin size: the user's explicit choice, or twice
/// the smallest sphere radius. Fatal when neither is available.
pub fn decide_bin_size(user_bin_size: Option<f64>, smallest_radius: f64) -> Result<f64, DemError> {
    if let Some(s) = user_bin_size {
        if s <= 0.0 {
            return Err(DemError::config(format!("bin size must be positive, got {s}")));
        }
        return Ok(s);
    }
    if smallest_radius <= TINY {
        return Err(DemError::config(
            "cannot default the bin size: the smallest sphere radius is not positive; \
             set one explicitly via set_bin_size",
        ));
    }
    Ok(2.0 * smallest_radius)
}

fn check_capacity(
    what: &'static str,
    count: usize,
    max: usize,
    hint: &'static str,
) -> Result<(), DemError> {
    if count > max {
        return Err(DemError::Capacity {
            what,
            count,
            max,
            hint,
        });
    }
    Ok(())
}

fn normalize_or(v: Vector3<f64>, fallback: Vector3<f64>) -> Vector3<f64> {
    let n = v.norm();
    if n > TINY {
        v / n
    } else {
        fallback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use talus_types::Material;

    fn two_template_registry() -> (Registry, AnomalyLog) {
        let mut reg = Registry::default();
        let log = AnomalyLog::new();
        let m = reg.load_material(Material::new(1e9, 0.3, 0.8, 0.5, 0.0), &log);
        // Load the 3-component template first so sorting has work to do.
        let big = reg
            .load_clump_template(
                3.0,
                Vector3::new(1.0, 1.0, 1.0),
                vec![0.1, 0.1, 0.1],
                vec![
                    Vector3::new(-0.1, 0.0, 0.0),
                    Vector3::zeros(),
                    Vector3::new(0.1, 0.0, 0.0),
                ],
                vec![m, m, m],
                &log,
            )
            .unwrap();
        let small = reg
            .load_clump_template(
                1.0,
                Vector3::new(0.4, 0.4, 0.4),
                vec![0.05],
                vec![Vector3::zeros()],
                vec![m],
                &log,
            )
            .unwrap();
        let _ = reg
            .add_clumps(vec![big, small], vec![Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0)])
            .unwrap();
        (reg, log)
    }

    #[test]
    fn templates_sort_by_component_count() {
        let (mut reg, log) = two_template_registry();
        let (model, _) = flatten(&mut reg, &log).unwrap();
        assert_eq!(model.tpl_comp_num, vec![1, 3]);
        // Marks renumbered to sorted positions: the single-sphere template
        // is now first.
        assert_eq!(reg.templates[1].mark, 0);
        assert_eq!(reg.templates[0].mark, 1);
    }

    #[test]
    fn flatten_is_idempotent_across_reinit() {
        let (mut reg, log) = two_template_registry();
        let (a, _) = flatten(&mut reg, &log).unwrap();
        let (b, _) = flatten(&mut reg, &log).unwrap();
        assert_eq!(a.tpl_comp_num, b.tpl_comp_num);
        assert_eq!(a.owner_prop, b.owner_prop);
        assert_eq!(a.comp_radius, b.comp_radius);
    }

    #[test]
    fn sphere_count_matches_component_sum() {
        let (mut reg, log) = two_template_registry();
        let (model, _) = flatten(&mut reg, &log).unwrap();
        assert_eq!(model.n_spheres, 4);
        assert_eq!(model.n_clump_owners, 2);
        assert_eq!(model.smallest_radius, 0.05);
    }

    #[test]
    fn mesh_reorientation_preserves_vertex_set() {
        let mut reg = Registry::default();
        let log = AnomalyLog::new();
        let m = reg.load_material(Material::new(1e9, 0.3, 0.8, 0.5, 0.0), &log);
        let verts = [
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        ];
        // Right-hand normal is +Z; the reference says -Z, so the order must
        // swap.
        let _ = reg
            .add_mesh_object(
                vec![crate::registry::Facet {
                    vertices: verts,
                    material: m,
                }],
                Some(vec![Vector3::new(0.0, 0.0, -1.0)]),
                1.0,
                Vector3::new(1.0, 1.0, 1.0),
                &log,
            )
            .unwrap();
        let (model, _) = flatten(&mut reg, &log).unwrap();
        let out = model.tri_vertices[0];
        let n = (out[1] - out[0]).cross(&(out[2] - out[0]));
        assert!(n.z < 0.0);
        let mut orig: Vec<_> = verts.iter().map(|v| (v.x, v.y, v.z)).collect();
        let mut got: Vec<_> = out.iter().map(|v| (v.x, v.y, v.z)).collect();
        orig.sort_by(|a, b| a.partial_cmp(b).unwrap());
        got.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(orig, got);
    }

    #[test]
    fn bin_size_defaults_to_twice_smallest_radius() {
        assert_eq!(decide_bin_size(None, 0.05).unwrap(), 0.1);
        assert_eq!(decide_bin_size(Some(0.3), 0.05).unwrap(), 0.3);
        assert!(decide_bin_size(None, 0.0).is_err());
    }
}
