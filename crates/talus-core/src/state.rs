//! Worker-owned state and the dynamic worker's per-step kernels.
//!
//! [`DynamicState`] is the SoA owner state written exclusively by dT;
//! [`KinematicState`] is kT's scratch (bin grid, governor, stats). The
//! solver reaches either only between runs, through its mutex.

use std::collections::HashMap;
use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector3};
use rayon::prelude::*;
use talus_compile::{Program, Scope};
use talus_types::{
    AccumulationMode, FamilyId, ForceModelKind, IntegratorKind, SortDiscipline, VoxelId,
};

use crate::broad::{BroadPhaseStats, ContactKind, ContactPair};
use crate::error::DemError;
use crate::family::FamilyTable;
use crate::flatten::{FlatModel, InitialState, OwnerKind};
use crate::force::{self, ContactInput, ContactOutput};
use crate::handshake::{OwnerSnapshot, PairList};
use crate::integrate::{advance_angular, advance_linear};
use crate::margin::MarginGovernor;
use crate::narrow;
use crate::world::{BinGrid, WorldParams};

/// Everything shared read-only by both workers after initialization.
#[derive(Debug)]
pub(crate) struct EngineShared {
    pub world: WorldParams,
    pub model: Arc<FlatModel>,
    pub family: Arc<FamilyTable>,
    pub force_kind: ForceModelKind,
    pub custom_force: Option<Arc<Program>>,
    pub historyless: bool,
    pub accumulation: AccumulationMode,
    pub integrator: IntegratorKind,
    pub sort_pairs: bool,
    pub max_per_bin: usize,
    /// Contact-detection update frequency in dT steps; doubles as the
    /// drift bound (0 = lockstep).
    pub update_freq: u64,
    /// Threads in each worker's compute pool (its "stream").
    pub worker_threads: usize,
}

impl EngineShared {
    /// The effective drift bound (`update_freq`, floored at 1).
    pub(crate) fn max_drift(&self) -> u64 {
        self.update_freq.max(1)
    }
}

/// Named wall-time accumulators, one set per worker.
#[derive(Debug, Clone)]
pub(crate) struct TimerSet {
    names: Vec<&'static str>,
    acc: Vec<f64>,
}

impl TimerSet {
    pub(crate) fn new(names: &[&'static str]) -> Self {
        Self {
            names: names.to_vec(),
            acc: vec![0.0; names.len()],
        }
    }

    #[inline]
    pub(crate) fn add(&mut self, idx: usize, seconds: f64) {
        if let Some(slot) = self.acc.get_mut(idx) {
            *slot += seconds;
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<(String, f64)> {
        self.names
            .iter()
            .zip(&self.acc)
            .map(|(n, a)| ((*n).to_string(), *a))
            .collect()
    }

    pub(crate) fn clear(&mut self) {
        self.acc.iter_mut().for_each(|a| *a = 0.0);
    }
}

/// dT timer indices.
pub(crate) const DT_TIMER_NAMES: &[&str] = &["narrow phase and force", "integration"];
pub(crate) const DT_TIMER_FORCE: usize = 0;
pub(crate) const DT_TIMER_INTEGRATE: usize = 1;

/// kT timer indices.
pub(crate) const KT_TIMER_NAMES: &[&str] = &["geometry transform", "binning and sweep"];
pub(crate) const KT_TIMER_TRANSFORM: usize = 0;
pub(crate) const KT_TIMER_DETECT: usize = 1;

/// Owner state arrays, write-owned by the dynamic worker.
#[derive(Debug, Default)]
pub(crate) struct DynamicState {
    pub n_owners: usize,
    /// Packed voxel id per owner.
    pub voxel: Vec<VoxelId>,
    /// Sub-voxel offset per owner.
    pub sub: Vec<Vector3<f64>>,
    /// Orientation per owner.
    pub quat: Vec<UnitQuaternion<f64>>,
    /// Linear velocity per owner, world frame.
    pub vel: Vec<Vector3<f64>>,
    /// Angular velocity per owner, owner-local frame.
    pub ang_vel: Vec<Vector3<f64>>,
    /// Internal family tag per owner.
    pub family: Vec<FamilyId>,
    /// Active flag per owner (purged owners are dropped, not flagged, but
    /// live additions may deactivate slots transiently).
    pub active: Vec<bool>,

    /// Per-step force accumulator, world frame.
    pub force: Vec<Vector3<f64>>,
    /// Per-step torque accumulator, world frame.
    pub torque: Vec<Vector3<f64>>,
    /// User-applied extra force, consumed by the next step.
    pub extra_force: Vec<Vector3<f64>>,
    /// Acceleration of the last completed step (for output).
    pub acc_last: Vec<Vector3<f64>>,

    /// Tangential history per contact-pair identity.
    pub history: HashMap<ContactPair, Vector3<f64>>,

    /// The pair list currently integrated against.
    pub pairs: PairList,
    /// Step counter.
    pub step: u64,
    /// Simulated time.
    pub time: f64,

    pub timers: TimerSet,
}

impl Default for TimerSet {
    fn default() -> Self {
        Self::new(&[])
    }
}

impl DynamicState {
    /// Builds the initial dynamic state from the preprocessor outputs.
    pub(crate) fn from_initial(
        shared: &EngineShared,
        init: &InitialState,
    ) -> Result<Self, DemError> {
        let n = init.pos.len();
        let codec = &shared.world.codec;
        let mut voxel = Vec::with_capacity(n);
        let mut sub = Vec::with_capacity(n);
        for p in &init.pos {
            let (v, s) = codec.encode(*p);
            voxel.push(v);
            sub.push(s);
        }
        let mut family = Vec::with_capacity(n);
        for f in &init.family_user {
            family.push(shared.family.internal(*f)?);
        }
        Ok(Self {
            n_owners: n,
            voxel,
            sub,
            quat: init.quat.clone(),
            vel: init.vel.clone(),
            ang_vel: init.ang_vel.clone(),
            family,
            active: vec![true; n],
            force: vec![Vector3::zeros(); n],
            torque: vec![Vector3::zeros(); n],
            extra_force: vec![Vector3::zeros(); n],
            acc_last: vec![Vector3::zeros(); n],
            history: HashMap::new(),
            pairs: PairList::default(),
            step: 0,
            time: 0.0,
            timers: TimerSet::new(DT_TIMER_NAMES),
        })
    }

    /// Decoded world position of one owner.
    #[inline]
    pub(crate) fn world_pos(&self, shared: &EngineShared, i: usize) -> Vector3<f64> {
        shared.world.codec.decode(self.voxel[i], self.sub[i])
    }

    /// Takes a state snapshot for the kinematic worker.
    pub(crate) fn snapshot(&self) -> OwnerSnapshot {
        OwnerSnapshot {
            voxel: self.voxel.clone(),
            sub: self.sub.clone(),
            quat: self.quat.clone(),
            vel: self.vel.clone(),
            ang_vel: self.ang_vel.clone(),
            family: self.family.clone(),
            step: self.step,
        }
    }

    /// Adopts a freshly delivered pair list.
    pub(crate) fn adopt_pairs(&mut self, pairs: PairList) {
        self.pairs = pairs;
    }

    /// Drift of the current pair list behind the step counter.
    #[inline]
    pub(crate) fn drift(&self) -> u64 {
        self.step.saturating_sub(self.pairs.based_on_step)
    }

    /// Narrow phase + force evaluation over the current pair list, filling
    /// the force/torque accumulators and advancing contact history.
    pub(crate) fn compute_forces(&mut self, shared: &EngineShared) -> Result<(), DemError> {
        let model = &shared.model;
        let n = self.n_owners;
        debug_assert_eq!(model.n_owners, n);

        // World positions, decoded once.
        let world_pos: Vec<Vector3<f64>> = (0..n)
            .into_par_iter()
            .map(|i| self.world_pos(shared, i))
            .collect();
        // World-frame angular velocity per owner.
        let w_world: Vec<Vector3<f64>> = (0..n)
            .into_par_iter()
            .map(|i| self.quat[i] * self.ang_vel[i])
            .collect();
        // Sphere world centers.
        let sphere_pos: Vec<Vector3<f64>> = (0..model.n_spheres)
            .into_par_iter()
            .map(|s| {
                let o = model.sphere_owner[s] as usize;
                world_pos[o] + self.quat[o] * model.sphere_rel_pos[s]
            })
            .collect();

        struct Contribution {
            owner_a: u32,
            owner_b: u32,
            out: ContactOutput,
            point: Vector3<f64>,
            key: ContactPair,
        }

        let dt = shared.world.dt;
        let family = &shared.family;
        let history = &self.history;
        let kernel_error = std::sync::Mutex::new(None::<talus_compile::CompileError>);

        let evaluate = |input: &ContactInput, w_rel: Vector3<f64>| -> ContactOutput {
            match shared.force_kind {
                ForceModelKind::FrictionlessHertzian => force::hertz_frictionless(input),
                ForceModelKind::FrictionalHertzian => force::hertz_mindlin(input, w_rel),
                ForceModelKind::Custom => match &shared.custom_force {
                    Some(program) => match force::custom_force(program, input) {
                        Ok(out) => out,
                        Err(e) => {
                            if let Ok(mut slot) = kernel_error.lock() {
                                slot.get_or_insert(e);
                            }
                            ContactOutput::default()
                        }
                    },
                    None => ContactOutput::default(),
                },
            }
        };

        let contribs: Vec<Option<Contribution>> = self
            .pairs
            .pairs
            .par_iter()
            .map(|pair| {
                let key = *pair;
                match pair.kind {
                    ContactKind::SphereSphere => {
                        let (sa, sb) = (pair.a as usize, pair.b as usize);
                        let (oa, ob) = (
                            model.sphere_owner[sa] as usize,
                            model.sphere_owner[sb] as usize,
                        );
                        // Families may have changed since the broad phase;
                        // re-check against the current mask.
                        if !family.allowed(self.family[oa], self.family[ob]) {
                            return None;
                        }
                        let geom = narrow::sphere_sphere(
                            sphere_pos[sa],
                            model.sphere_radius[sa],
                            sphere_pos[sb],
                            model.sphere_radius[sb],
                        )?;
                        let (ra, rb) = (model.sphere_radius[sa], model.sphere_radius[sb]);
                        let (ma, mb) = (
                            model.prop_mass[model.owner_prop[oa] as usize],
                            model.prop_mass[model.owner_prop[ob] as usize],
                        );
                        let fixed_a = family.is_fixed(self.family[oa]);
                        let fixed_b = family.is_fixed(self.family[ob]);
                        let m_eff = effective_mass(ma, mb, fixed_a, fixed_b);
                        let va = self.vel[oa] + w_world[oa].cross(&(geom.point - world_pos[oa]));
                        let vb = self.vel[ob] + w_world[ob].cross(&(geom.point - world_pos[ob]));
                        let mat = pair_materials(model, model.sphere_mat[sa], model.sphere_mat[sb]);
                        let input = ContactInput {
                            depth: geom.depth,
                            normal: geom.normal,
                            rel_vel: va - vb,
                            r_eff: ra * rb / (ra + rb),
                            m_eff,
                            mat,
                            dt,
                            history: history.get(&key).copied().unwrap_or_default(),
                        };
                        let out = evaluate(&input, w_world[oa] - w_world[ob]);
                        Some(Contribution {
                            owner_a: oa as u32,
                            owner_b: ob as u32,
                            out,
                            point: geom.point,
                            key,
                        })
                    }
                    ContactKind::SphereAnalytical => {
                        let s = pair.a as usize;
                        let a = pair.b as usize;
                        let (os, oa) = (
                            model.sphere_owner[s] as usize,
                            model.anal_owner[a] as usize,
                        );
                        if !family.allowed(self.family[os], self.family[oa]) {
                            return None;
                        }
                        let comp_pos = world_pos[oa] + self.quat[oa] * model.anal_pos[a];
                        let comp_dir = self.quat[oa] * model.anal_rot[a];
                        let geom = narrow::sphere_analytical(
                            sphere_pos[s],
                            model.sphere_radius[s],
                            model.anal_kind[a],
                            comp_pos,
                            comp_dir,
                            model.anal_size1[a],
                            model.anal_size2[a],
                            model.anal_normal[a],
                        )?;
                        let ms = model.prop_mass[model.owner_prop[os] as usize];
                        let mo = model.prop_mass[model.owner_prop[oa] as usize];
                        let m_eff = effective_mass(
                            ms,
                            mo,
                            family.is_fixed(self.family[os]),
                            family.is_fixed(self.family[oa]),
                        );
                        let va = self.vel[os] + w_world[os].cross(&(geom.point - world_pos[os]));
                        let vb = self.vel[oa] + w_world[oa].cross(&(geom.point - world_pos[oa]));
                        let mat = pair_materials(model, model.sphere_mat[s], model.anal_mat[a]);
                        let input = ContactInput {
                            depth: geom.depth,
                            normal: geom.normal,
                            rel_vel: va - vb,
                            r_eff: model.sphere_radius[s],
                            m_eff,
                            mat,
                            dt,
                            history: history.get(&key).copied().unwrap_or_default(),
                        };
                        let out = evaluate(&input, w_world[os] - w_world[oa]);
                        Some(Contribution {
                            owner_a: os as u32,
                            owner_b: oa as u32,
                            out,
                            point: geom.point,
                            key,
                        })
                    }
                    ContactKind::SphereTriangle => {
                        let s = pair.a as usize;
                        let t = pair.b as usize;
                        let (os, ot) = (
                            model.sphere_owner[s] as usize,
                            model.tri_owner[t] as usize,
                        );
                        if !family.allowed(self.family[os], self.family[ot]) {
                            return None;
                        }
                        let verts = model.tri_vertices[t];
                        let vw: Vec<Vector3<f64>> = verts
                            .iter()
                            .map(|v| world_pos[ot] + self.quat[ot] * v)
                            .collect();
                        let geom = narrow::sphere_triangle(
                            sphere_pos[s],
                            model.sphere_radius[s],
                            vw[0],
                            vw[1],
                            vw[2],
                        )?;
                        let ms = model.prop_mass[model.owner_prop[os] as usize];
                        let mo = model.prop_mass[model.owner_prop[ot] as usize];
                        let m_eff = effective_mass(
                            ms,
                            mo,
                            family.is_fixed(self.family[os]),
                            family.is_fixed(self.family[ot]),
                        );
                        let va = self.vel[os] + w_world[os].cross(&(geom.point - world_pos[os]));
                        let vb = self.vel[ot] + w_world[ot].cross(&(geom.point - world_pos[ot]));
                        let mat = pair_materials(model, model.sphere_mat[s], model.tri_mat[t]);
                        let input = ContactInput {
                            depth: geom.depth,
                            normal: geom.normal,
                            rel_vel: va - vb,
                            r_eff: model.sphere_radius[s],
                            m_eff,
                            mat,
                            dt,
                            history: history.get(&key).copied().unwrap_or_default(),
                        };
                        let out = evaluate(&input, w_world[os] - w_world[ot]);
                        Some(Contribution {
                            owner_a: os as u32,
                            owner_b: ot as u32,
                            out,
                            point: geom.point,
                            key,
                        })
                    }
                }
            })
            .collect();

        if let Ok(mut slot) = kernel_error.lock() {
            if let Some(e) = slot.take() {
                return Err(DemError::compile(e, "custom force model".to_string()));
            }
        }

        // Reset accumulators, then land contributions.
        self.force.iter_mut().for_each(|f| *f = Vector3::zeros());
        self.torque.iter_mut().for_each(|t| *t = Vector3::zeros());

        let mut next_history = HashMap::new();
        let keep_history =
            shared.force_kind == ForceModelKind::FrictionalHertzian && !shared.historyless
                || shared.force_kind == ForceModelKind::Custom;

        let force = &mut self.force;
        let torque = &mut self.torque;
        let mut land = |owner_a: u32, owner_b: u32, out: &ContactOutput, point: Vector3<f64>| {
            let oa = owner_a as usize;
            let ob = owner_b as usize;
            force[oa] += out.force;
            force[ob] -= out.force;
            torque[oa] += (point - world_pos[oa]).cross(&out.force) + out.torque_a;
            torque[ob] += (point - world_pos[ob]).cross(&(-out.force)) + out.torque_b;
        };

        match shared.accumulation {
            AccumulationMode::Scatter => {
                for c in contribs.iter().flatten() {
                    land(c.owner_a, c.owner_b, &c.out, c.point);
                }
            }
            AccumulationMode::SortReduce => {
                // Sort contribution indices by the lower owner id, then
                // land in that order; the per-owner sums are identical, the
                // traversal order is the sorted one.
                let mut order: Vec<usize> = (0..contribs.len())
                    .filter(|&i| contribs[i].is_some())
                    .collect();
                order.sort_by_key(|&i| {
                    contribs[i]
                        .as_ref()
                        .map_or((u32::MAX, u32::MAX), |c| {
                            (c.owner_a.min(c.owner_b), c.owner_a.max(c.owner_b))
                        })
                });
                for i in order {
                    if let Some(c) = &contribs[i] {
                        land(c.owner_a, c.owner_b, &c.out, c.point);
                    }
                }
            }
        }

        if keep_history {
            for c in contribs.iter().flatten() {
                next_history.insert(c.key, c.out.history);
            }
        }
        self.history = next_history;
        Ok(())
    }

    /// One integration step: prescriptions, scheme update, re-encode,
    /// family-change sweep, time advance.
    pub(crate) fn integrate(&mut self, shared: &EngineShared) {
        let model = &shared.model;
        let codec = &shared.world.codec;
        let dt = shared.world.dt;
        let g = shared.world.gravity;
        let t_next = self.time + dt;
        let family = &shared.family;

        for i in 0..self.n_owners {
            if !self.active[i] {
                continue;
            }
            let prop = model.owner_prop[i] as usize;
            let m = model.prop_mass[prop];
            let moi = model.prop_moi[prop];
            let fam = self.family[i];
            let x = codec.decode(self.voxel[i], self.sub[i]);
            let a = if m > 0.0 {
                (self.force[i] + self.extra_force[i]) / m + g
            } else {
                g
            };
            self.acc_last[i] = a;

            let mut v_seed = self.vel[i];
            let mut w_seed = self.ang_vel[i];
            let mut lin_dictated = false;
            let mut rot_dictated = false;

            let prescribing = family.any_prescription && family.has_prescription(fam);
            if prescribing {
                let mut scope = Scope::new();
                scope.set("family", f64::from(fam));
                scope.set("t", t_next);
                scope.set("X", x.x);
                scope.set("Y", x.y);
                scope.set("Z", x.z);
                scope.set("vX", v_seed.x);
                scope.set("vY", v_seed.y);
                scope.set("vZ", v_seed.z);
                scope.set("omgX", w_seed.x);
                scope.set("omgY", w_seed.y);
                scope.set("omgZ", w_seed.z);
                scope.set("LinPrescribed", 0.0);
                scope.set("RotPrescribed", 0.0);
                if family.vel_kernel.run(&mut scope).is_ok() {
                    let get = |k: &str, d: f64| scope.get(k).unwrap_or(d);
                    v_seed = Vector3::new(
                        get("vX", v_seed.x),
                        get("vY", v_seed.y),
                        get("vZ", v_seed.z),
                    );
                    w_seed = Vector3::new(
                        get("omgX", w_seed.x),
                        get("omgY", w_seed.y),
                        get("omgZ", w_seed.z),
                    );
                    lin_dictated = get("LinPrescribed", 0.0) != 0.0;
                    rot_dictated = get("RotPrescribed", 0.0) != 0.0;
                }
            }

            // Linear update.
            let (mut x1, v1) = if lin_dictated {
                (x + v_seed * dt, v_seed)
            } else {
                advance_linear(shared.integrator, x, v_seed, a, dt)
            };

            // Angular update, in the owner-local frame.
            let torque_local = self.quat[i].inverse_transform_vector(&self.torque[i]);
            let (mut q1, w1) = if rot_dictated {
                let mut q = self.quat[i]
                    * UnitQuaternion::from_scaled_axis(w_seed * dt);
                q.renormalize_fast();
                (q, w_seed)
            } else {
                advance_angular(self.quat[i], w_seed, torque_local, moi, dt)
            };

            // Positional prescription overrides the integrated values
            // channel-wise.
            if prescribing {
                let mut scope = Scope::new();
                scope.set("family", f64::from(fam));
                scope.set("t", t_next);
                scope.set("X", x1.x);
                scope.set("Y", x1.y);
                scope.set("Z", x1.z);
                let q = q1.quaternion();
                scope.set("oriW", q.w);
                scope.set("oriX", q.i);
                scope.set("oriY", q.j);
                scope.set("oriZ", q.k);
                scope.set("LinPrescribed", 0.0);
                scope.set("RotPrescribed", 0.0);
                if family.pos_kernel.run(&mut scope).is_ok() {
                    let get = |k: &str, d: f64| scope.get(k).unwrap_or(d);
                    if get("LinPrescribed", 0.0) != 0.0 {
                        x1 = Vector3::new(get("X", x1.x), get("Y", x1.y), get("Z", x1.z));
                    }
                    if get("RotPrescribed", 0.0) != 0.0 {
                        let nq = nalgebra::Quaternion::new(
                            get("oriW", q.w),
                            get("oriX", q.i),
                            get("oriY", q.j),
                            get("oriZ", q.k),
                        );
                        q1 = UnitQuaternion::new_normalize(nq);
                    }
                }
            }

            let (voxel, sub) = codec.encode(x1);
            self.voxel[i] = voxel;
            self.sub[i] = sub;
            self.vel[i] = v1;
            self.ang_vel[i] = w1;
            self.quat[i] = q1;
            self.extra_force[i] = Vector3::zeros();
        }

        // Family-change sweep: rules in declaration order, first match
        // wins, applied after integration.
        if let Some(kernel) = &family.change_kernel {
            for i in 0..self.n_owners {
                if !self.active[i] {
                    continue;
                }
                let x = codec.decode(self.voxel[i], self.sub[i]);
                let mut scope = Scope::new();
                scope.set("family", f64::from(self.family[i]));
                scope.set("newFamily", f64::from(self.family[i]));
                scope.set("changed", 0.0);
                scope.set("t", t_next);
                scope.set("X", x.x);
                scope.set("Y", x.y);
                scope.set("Z", x.z);
                scope.set("vX", self.vel[i].x);
                scope.set("vY", self.vel[i].y);
                scope.set("vZ", self.vel[i].z);
                scope.set("omgX", self.ang_vel[i].x);
                scope.set("omgY", self.ang_vel[i].y);
                scope.set("omgZ", self.ang_vel[i].z);
                if kernel.run(&mut scope).is_ok() {
                    if let Some(nf) = scope.get("newFamily") {
                        let nf = nf.round();
                        if nf >= 0.0 && nf <= f64::from(FamilyId::MAX) {
                            self.family[i] = nf as FamilyId;
                        }
                    }
                }
            }
        }

        self.step += 1;
        self.time = t_next;
    }

    /// Total kinetic energy over active clump owners.
    pub(crate) fn kinetic_energy(&self, shared: &EngineShared) -> f64 {
        let model = &shared.model;
        (0..self.n_owners)
            .filter(|&i| self.active[i] && matches!(model.owner_kind[i], OwnerKind::Clump(_)))
            .map(|i| {
                let prop = model.owner_prop[i] as usize;
                let m = model.prop_mass[prop];
                let moi = model.prop_moi[prop];
                let w = self.ang_vel[i];
                0.5 * m * self.vel[i].norm_squared()
                    + 0.5 * (moi.x * w.x * w.x + moi.y * w.y * w.y + moi.z * w.z * w.z)
            })
            .sum()
    }
}

/// Effective two-body mass; a fixed partner counts as infinite.
#[inline]
fn effective_mass(ma: f64, mb: f64, fixed_a: bool, fixed_b: bool) -> f64 {
    match (fixed_a, fixed_b) {
        (false, false) => ma * mb / (ma + mb),
        (true, false) => mb,
        (false, true) => ma,
        (true, true) => ma.min(mb),
    }
}

#[inline]
fn pair_materials(model: &FlatModel, a: u32, b: u32) -> force::MaterialPair {
    let (a, b) = (a as usize, b as usize);
    force::combine_materials(
        model.mat_e[a],
        model.mat_nu[a],
        model.mat_cor[a],
        model.mat_mu[a],
        model.mat_crr[a],
        model.mat_e[b],
        model.mat_nu[b],
        model.mat_cor[b],
        model.mat_mu[b],
        model.mat_crr[b],
    )
}

/// Kinematic worker scratch: bin grid, governor, stats, and the last
/// fatal error (runtime saturation aborts the cycle through here).
#[derive(Debug)]
pub(crate) struct KinematicState {
    pub grid: BinGrid,
    pub governor: MarginGovernor,
    pub last_stats: BroadPhaseStats,
    pub last_error: Option<DemError>,
    pub sort_discipline: SortDiscipline,
    pub timers: TimerSet,
}

impl KinematicState {
    pub(crate) fn new(grid: BinGrid, governor: MarginGovernor, sort_pairs: bool) -> Self {
        Self {
            grid,
            governor,
            last_stats: BroadPhaseStats::default(),
            last_error: None,
            sort_discipline: if sort_pairs {
                SortDiscipline::ByIdentity
            } else {
                SortDiscipline::Unsorted
            },
            timers: TimerSet::new(KT_TIMER_NAMES),
        }
    }
}
