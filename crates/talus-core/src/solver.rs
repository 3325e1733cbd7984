//! The solver facade: configuration surface, the forward-only
//! initialization state machine, and the runtime API.
//!
//! A [`DemSolver`] is the root of everything: it owns the registry, both
//! worker threads and their handshake hub, and the shared tables built at
//! initialization. Configuration mutates only through this handle; no
//! process-wide state exists. Construction spawns the workers, dropping the
//! solver tears them down.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nalgebra::{UnitQuaternion, Vector3};
use talus_compile::{specialize, templates, KernelCache, SubstitutionMap};
use talus_types::{
    AccumulationMode, AnalyticalKind, BoundingBoxMode, FamilyChangeRule, FamilyPair,
    FamilyPrescription, ForceModelKind, IntegratorKind, Material, NormalSign, OutputFormat,
    OutputMode, Verbosity, Warning, DEFAULT_MAX_GEOMETRIES_PER_BIN, OUT_ABSV, OUT_POSITION,
    OUT_QUATERNION, RESERVED_FAMILY,
};

use crate::anomaly::{Anomaly, AnomalyLog};
use crate::codec::VoxelCodec;
use crate::error::DemError;
use crate::family::compile_family_table;
use crate::flatten::{decide_bin_size, flatten, InitialState, OwnerKind};
use crate::handshake::{CollaborationStats, SyncHub};
use crate::inspect::{Inspector, InspectorQuantity};
use crate::margin::{AdaptivePolicy, MarginGovernor};
use crate::output::{write_clump_dump, ClumpRecord};
use crate::registry::{
    AnalyticalComponent, ClumpBatchHandle, ClumpTemplateHandle, ExternalObjectHandle, Facet,
    MeshHandle, Registry,
};
use crate::state::{DynamicState, EngineShared, KinematicState};
use crate::worker::{broad_phase_round, spawn_dynamic, spawn_kinematic, Command, WorkerHandle};
use crate::world::{BinGrid, WorldParams};

/// Initialization progress. Forward-only; re-initialization starts over
/// from `Validated`. Only `Ready` accepts `do_dynamics` calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InitStage {
    /// Nothing processed yet.
    Uninitialized,
    /// User inputs passed validation.
    Validated,
    /// Templates sorted and flattened.
    TemplatesFlat,
    /// Family remap, mask, and prescriptions compiled.
    FamiliesCompiled,
    /// Worker arrays allocated and populated.
    ArraysAllocated,
    /// Kernels specialized and cached.
    KernelsSpecialized,
    /// Accepting dynamics calls.
    Ready,
}

/// Tracker target kinds (resolved to an owner range at query time).
#[derive(Debug, Clone, Copy)]
enum TrackTarget {
    Batch(u32),
    External(u32),
    Mesh(u32),
}

/// Handle to a tracked entity; resolves to a contiguous owner range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerHandle(usize);

#[derive(Debug, Clone)]
struct Tracked {
    target: TrackTarget,
    valid: bool,
}

/// How the world origin is placed.
#[derive(Debug, Clone, Copy)]
enum OriginSpec {
    Explicit(Vector3<f64>),
    Center,
}

/// Raw solver configuration, consumed at initialization.
#[derive(Debug, Clone)]
struct SolverConfig {
    world_dims: Option<Vector3<f64>>,
    explicit_nv: Option<((u32, u32, u32), f64)>,
    origin: OriginSpec,
    gravity: Vector3<f64>,
    dt: Option<f64>,
    update_freq: u64,
    bin_size: Option<f64>,
    force_kind: ForceModelKind,
    custom_force_src: Option<String>,
    historyless: bool,
    accumulation: AccumulationMode,
    integrator: IntegratorKind,
    sort_pairs: bool,
    bbox: BoundingBoxMode,
    bbox_material: Option<u32>,
    out_mode: OutputMode,
    out_format: OutputFormat,
    out_content: u32,
    ensure_line_numbers: bool,
    max_per_bin: usize,
    worker_threads: usize,
    adaptive: Option<AdaptivePolicy>,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            world_dims: None,
            explicit_nv: None,
            origin: OriginSpec::Explicit(Vector3::zeros()),
            gravity: Vector3::zeros(),
            dt: None,
            update_freq: 0,
            bin_size: None,
            force_kind: ForceModelKind::FrictionalHertzian,
            custom_force_src: None,
            historyless: false,
            accumulation: AccumulationMode::Scatter,
            integrator: IntegratorKind::CenteredDifference,
            sort_pairs: true,
            bbox: BoundingBoxMode::None,
            bbox_material: None,
            out_mode: OutputMode::Sphere,
            out_format: OutputFormat::Csv,
            out_content: OUT_POSITION | OUT_QUATERNION | OUT_ABSV,
            ensure_line_numbers: false,
            max_per_bin: DEFAULT_MAX_GEOMETRIES_PER_BIN,
            worker_threads: 2,
            adaptive: None,
        }
    }
}

/// The DEM solver instance.
pub struct DemSolver {
    verbosity: Verbosity,
    registry: Registry,
    cfg: SolverConfig,
    governor: MarginGovernor,
    anomalies: Arc<AnomalyLog>,
    cache: KernelCache,
    stage: InitStage,

    hub: Arc<SyncHub>,
    abort: Arc<AtomicBool>,
    dyn_state: Arc<Mutex<DynamicState>>,
    kin_state: Arc<Mutex<KinematicState>>,
    dt_worker: WorkerHandle,
    kt_worker: WorkerHandle,
    shared: Option<Arc<EngineShared>>,

    trackers: Vec<Tracked>,
    bbox_object: Option<ExternalObjectHandle>,
    /// Base owner id per batch, in upload order (init-time batches first,
    /// then live additions at the tail).
    batch_base: Vec<u32>,
    /// First external-object owner id.
    ext_base: u32,
    /// First mesh owner id.
    mesh_base: u32,
    /// Number of clump batches already uploaded to the workers.
    batches_uploaded: usize,
    /// Flattening staging kept for mid-run uploads; released on demand.
    staging: Option<InitialState>,
}

impl DemSolver {
    /// Constructs the solver and spawns both workers.
    #[must_use]
    pub fn new() -> Self {
        let hub = Arc::new(SyncHub::new(1));
        let abort = Arc::new(AtomicBool::new(false));
        let dyn_state = Arc::new(Mutex::new(DynamicState::default()));
        let kin_state = Arc::new(Mutex::new(KinematicState::new(
            BinGrid {
                bin_size: 1.0,
                nb: (1, 1, 1),
                num_bins: 1,
            },
            MarginGovernor::new(),
            true,
        )));
        let dt_worker = spawn_dynamic(
            Arc::clone(&hub),
            Arc::clone(&dyn_state),
            Arc::clone(&abort),
            2,
        );
        let kt_worker = spawn_kinematic(
            Arc::clone(&hub),
            Arc::clone(&kin_state),
            Arc::clone(&abort),
            2,
        );
        Self {
            verbosity: Verbosity::Info,
            registry: Registry::default(),
            cfg: SolverConfig::default(),
            governor: MarginGovernor::new(),
            anomalies: Arc::new(AnomalyLog::new()),
            cache: KernelCache::new(),
            stage: InitStage::Uninitialized,
            hub,
            abort,
            dyn_state,
            kin_state,
            dt_worker,
            kt_worker,
            shared: None,
            trackers: Vec::new(),
            bbox_object: None,
            batch_base: Vec::new(),
            ext_base: 0,
            mesh_base: 0,
            batches_uploaded: 0,
            staging: None,
        }
    }

    // ==================== Configuration ====================

    /// Sets the output detail level.
    pub fn set_verbosity(&mut self, v: Verbosity) {
        self.verbosity = v;
    }

    /// Instructs the dimensions of the simulation world box. Exactly one of
    /// this or [`set_num_voxels`](Self::set_num_voxels) must be called.
    pub fn set_world_box(&mut self, x: f64, y: f64, z: f64) {
        self.cfg.world_dims = Some(Vector3::new(x, y, z));
    }

    /// Explicitly instructs the per-axis voxel counts (as powers of two,
    /// summing to the voxel-id bit width) and the base length unit.
    pub fn set_num_voxels(&mut self, x: u32, y: u32, z: u32, length_unit: f64) {
        self.cfg.explicit_nv = Some(((x, y, z), length_unit));
    }

    /// Places the world origin explicitly (the left-bottom-front corner).
    pub fn set_world_origin(&mut self, origin: Vector3<f64>) {
        self.cfg.origin = OriginSpec::Explicit(origin);
    }

    /// Centers the world box on the coordinate origin.
    pub fn set_world_origin_center(&mut self) {
        self.cfg.origin = OriginSpec::Center;
    }

    /// Sets the gravity vector.
    pub fn set_gravity(&mut self, g: Vector3<f64>) {
        self.cfg.gravity = g;
    }

    /// Sets the constant time step size.
    pub fn set_time_step(&mut self, dt: f64) {
        self.cfg.dt = Some(dt);
    }

    /// The currently configured time step size, if set.
    #[must_use]
    pub fn time_step(&self) -> Option<f64> {
        self.cfg.dt
    }

    /// Number of dT steps between contact-detection updates; this is also
    /// the drift bound. `0` means lockstep: every step waits for a freshly
    /// produced pair list.
    pub fn set_cd_update_freq(&mut self, freq: u64) {
        self.cfg.update_freq = freq;
    }

    /// Explicitly instructs the broad-phase bin size.
    pub fn set_bin_size(&mut self, size: f64) {
        self.cfg.bin_size = Some(size);
    }

    /// Explicitly sets the geometry expansion margin β.
    pub fn set_expand_factor(&mut self, beta: f64) {
        self.governor.set_expand_factor(beta);
    }

    /// Derives β from the expected maximum velocity and the maximum time
    /// one contact detection may cover.
    pub fn suggest_expand_factor(&mut self, max_vel: f64, max_time_per_cd: f64) {
        self.governor.suggest(max_vel, max_time_per_cd);
    }

    /// Derives β from the expected maximum velocity alone; requires the
    /// time step and update frequency to be configured.
    pub fn suggest_expand_factor_from_velocity(&mut self, max_vel: f64) -> Result<(), DemError> {
        let dt = self.cfg.dt.unwrap_or(-1.0);
        self.governor
            .suggest_from_velocity(max_vel, dt, self.cfg.update_freq)
    }

    /// Over-expansion multiplier on derived margins (safety against missed
    /// contacts at the cost of more false positives).
    pub fn suggest_expand_safety_multiplier(&mut self, param: f64) {
        self.governor.set_safety_multiplier(param);
    }

    /// Enables adaptive bin-size tuning.
    pub fn set_adaptive_binning(&mut self, policy: AdaptivePolicy) {
        self.cfg.adaptive = Some(policy);
    }

    /// Selects the frictional (history-based) Hertzian force model.
    pub fn use_frictional_hertzian_model(&mut self) {
        self.cfg.force_kind = ForceModelKind::FrictionalHertzian;
        self.cfg.historyless = false;
        self.cfg.custom_force_src = None;
    }

    /// Selects the frictionless Hertzian force model (historyless).
    pub fn use_frictionless_hertzian_model(&mut self) {
        self.cfg.force_kind = ForceModelKind::FrictionlessHertzian;
        self.cfg.historyless = true;
        self.cfg.custom_force_src = None;
    }

    /// Manually flags the solver historyless (requires a compatible model).
    pub fn set_solver_historyless(&mut self, historyless: bool) {
        self.cfg.historyless = historyless;
    }

    /// Supplies a custom contact force model as kernel text.
    pub fn define_force_model(&mut self, model: impl Into<String>) {
        self.cfg.force_kind = ForceModelKind::Custom;
        self.cfg.custom_force_src = Some(model.into());
    }

    /// Whether kT sorts pair lists before delivery (required for
    /// history-based models).
    pub fn set_sort_contact_pairs(&mut self, sort: bool) {
        self.cfg.sort_pairs = sort;
    }

    /// Selects the force-accumulation strategy. The sort-then-reduce path
    /// exists behind the same results as the scatter path.
    pub fn set_accumulation_mode(&mut self, mode: AccumulationMode) {
        self.cfg.accumulation = mode;
        if mode == AccumulationMode::SortReduce {
            // The reduce pattern needs stable pair identities.
            self.cfg.sort_pairs = true;
        }
    }

    /// Selects the integration scheme.
    pub fn set_integrator(&mut self, kind: IntegratorKind) {
        self.cfg.integrator = kind;
    }

    /// One-to-one-line substitution mode so kernel compile errors report
    /// the emission site's line number.
    pub fn ensure_kernel_error_line_numbers(&mut self, flag: bool) {
        self.cfg.ensure_line_numbers = flag;
    }

    /// Per-bin geometry ceiling for the broad phase.
    pub fn set_max_geometries_per_bin(&mut self, max: usize) {
        self.cfg.max_per_bin = max;
    }

    /// Threads in each worker's compute pool.
    pub fn set_worker_threads(&mut self, threads: usize) {
        self.cfg.worker_threads = threads.max(1);
    }

    /// Adds boundary planes around the world at initialization: `All` = 6
    /// planes, `TopOpen` leaves +Z open.
    pub fn set_bounding_box(&mut self, mode: BoundingBoxMode, material: u32) {
        self.cfg.bbox = mode;
        self.cfg.bbox_material = Some(material);
    }

    /// Chooses row granularity of clump dumps.
    pub fn set_output_mode(&mut self, mode: OutputMode) {
        self.cfg.out_mode = mode;
    }

    /// Chooses the dump file format.
    pub fn set_output_format(&mut self, format: OutputFormat) {
        self.cfg.out_format = format;
    }

    /// Chooses the dump column set (bitmask over `OUT_*`).
    pub fn set_output_content(&mut self, content: u32) {
        self.cfg.out_content = content;
    }

    /// Excludes a family's entities from dump files.
    pub fn disable_family_output(&mut self, family: u32) {
        self.registry.no_output_families.push(family);
    }

    // ==================== Loading ====================

    /// Loads a material into the canonical table (deduplicated under
    /// tolerance equivalence) and returns its index.
    pub fn load_material(&mut self, mat: Material) -> u32 {
        self.registry.load_material(mat, &self.anomalies)
    }

    /// Loads a clump template from component arrays.
    pub fn load_clump_template(
        &mut self,
        mass: f64,
        moi: Vector3<f64>,
        radii: Vec<f64>,
        rel_pos: Vec<Vector3<f64>>,
        materials: Vec<u32>,
    ) -> Result<ClumpTemplateHandle, DemError> {
        self.registry
            .load_clump_template(mass, moi, radii, rel_pos, materials, &self.anomalies)
    }

    /// Loads a one-sphere clump template with the solid-sphere moment of
    /// inertia.
    pub fn load_simple_sphere(
        &mut self,
        mass: f64,
        radius: f64,
        material: u32,
    ) -> Result<ClumpTemplateHandle, DemError> {
        let i = 0.4 * mass * radius * radius;
        self.load_clump_template(
            mass,
            Vector3::new(i, i, i),
            vec![radius],
            vec![Vector3::zeros()],
            vec![material],
        )
    }

    /// Adds a batch of clumps (template/position pairs); returns the batch
    /// handle for follow-up velocity/family assignment.
    pub fn add_clumps(
        &mut self,
        templates: Vec<ClumpTemplateHandle>,
        positions: Vec<Vector3<f64>>,
    ) -> Result<ClumpBatchHandle, DemError> {
        self.registry.add_clumps(templates, positions)
    }

    /// Assigns initial velocities to a batch.
    pub fn set_batch_velocities(
        &mut self,
        batch: ClumpBatchHandle,
        velocities: Vec<Vector3<f64>>,
    ) -> Result<(), DemError> {
        let b = self.batch_mut(batch)?;
        if velocities.len() != b.len() {
            return Err(DemError::LengthMismatch(format!(
                "batch holds {} clumps, got {} velocities",
                b.len(),
                velocities.len()
            )));
        }
        b.velocities = Some(velocities);
        Ok(())
    }

    /// Assigns initial angular velocities (owner-local) to a batch.
    pub fn set_batch_ang_velocities(
        &mut self,
        batch: ClumpBatchHandle,
        ang_velocities: Vec<Vector3<f64>>,
    ) -> Result<(), DemError> {
        let b = self.batch_mut(batch)?;
        if ang_velocities.len() != b.len() {
            return Err(DemError::LengthMismatch(format!(
                "batch holds {} clumps, got {} angular velocities",
                b.len(),
                ang_velocities.len()
            )));
        }
        b.ang_velocities = Some(ang_velocities);
        Ok(())
    }

    /// Assigns initial orientations to a batch.
    pub fn set_batch_orientations(
        &mut self,
        batch: ClumpBatchHandle,
        orientations: Vec<UnitQuaternion<f64>>,
    ) -> Result<(), DemError> {
        let b = self.batch_mut(batch)?;
        if orientations.len() != b.len() {
            return Err(DemError::LengthMismatch(format!(
                "batch holds {} clumps, got {} orientations",
                b.len(),
                orientations.len()
            )));
        }
        b.orientations = Some(orientations);
        Ok(())
    }

    /// Assigns user family numbers to a batch.
    pub fn set_batch_families(
        &mut self,
        batch: ClumpBatchHandle,
        families: Vec<u32>,
    ) -> Result<(), DemError> {
        let b = self.batch_mut(batch)?;
        if families.len() != b.len() {
            return Err(DemError::LengthMismatch(format!(
                "batch holds {} clumps, got {} family numbers",
                b.len(),
                families.len()
            )));
        }
        b.families = Some(families);
        Ok(())
    }

    /// Assigns one family number to the whole batch.
    pub fn set_batch_family(&mut self, batch: ClumpBatchHandle, family: u32) -> Result<(), DemError> {
        let b = self.batch_mut(batch)?;
        let n = b.len();
        b.families = Some(vec![family; n]);
        Ok(())
    }

    /// Re-adds clumps from checkpoint records (see
    /// [`read_clump_csv`](crate::read_clump_csv)); template marks in the
    /// records resolve against the current template set.
    pub fn add_clumps_from_records(
        &mut self,
        records: &[ClumpRecord],
    ) -> Result<ClumpBatchHandle, DemError> {
        let mut templates = Vec::with_capacity(records.len());
        for r in records {
            let idx = self
                .registry
                .templates
                .iter()
                .position(|t| t.mark == r.template)
                .ok_or_else(|| {
                    DemError::Checkpoint(format!(
                        "checkpoint references template mark {}, which is not loaded",
                        r.template
                    ))
                })?;
            templates.push(ClumpTemplateHandle(idx as u32));
        }
        let positions = records.iter().map(|r| r.pos).collect();
        let handle = self.registry.add_clumps(templates, positions)?;
        let b = &mut self.registry.batches[handle.0 as usize];
        b.velocities = Some(records.iter().map(|r| r.vel).collect());
        b.ang_velocities = Some(records.iter().map(|r| r.ang_vel).collect());
        b.orientations = Some(records.iter().map(|r| r.quat).collect());
        b.families = Some(records.iter().map(|r| r.family).collect());
        Ok(handle)
    }

    /// Adds an empty external object.
    pub fn add_external_object(&mut self) -> ExternalObjectHandle {
        self.registry.add_external_object()
    }

    /// Sets an external object's initial position.
    pub fn set_external_object_position(
        &mut self,
        obj: ExternalObjectHandle,
        pos: Vector3<f64>,
    ) -> Result<(), DemError> {
        self.external_mut(obj)?.pos = pos;
        Ok(())
    }

    /// Sets an external object's family.
    pub fn set_external_object_family(
        &mut self,
        obj: ExternalObjectHandle,
        family: u32,
    ) -> Result<(), DemError> {
        self.external_mut(obj)?.family = family;
        Ok(())
    }

    /// Attaches a plane to an external object.
    pub fn add_plane(
        &mut self,
        obj: ExternalObjectHandle,
        pos: Vector3<f64>,
        normal: Vector3<f64>,
        material: u32,
    ) -> Result<(), DemError> {
        self.external_mut(obj)?.components.push(AnalyticalComponent {
            kind: AnalyticalKind::Plane,
            material,
            pos,
            rot: normal,
            size1: 0.0,
            size2: 0.0,
            size3: 0.0,
            normal: NormalSign::Outward,
        });
        Ok(())
    }

    /// Attaches a finite plate (`half_u × half_v`) to an external object.
    pub fn add_plate(
        &mut self,
        obj: ExternalObjectHandle,
        pos: Vector3<f64>,
        normal: Vector3<f64>,
        half_u: f64,
        half_v: f64,
        material: u32,
    ) -> Result<(), DemError> {
        self.external_mut(obj)?.components.push(AnalyticalComponent {
            kind: AnalyticalKind::Plate,
            material,
            pos,
            rot: normal,
            size1: half_u,
            size2: half_v,
            size3: 0.0,
            normal: NormalSign::Outward,
        });
        Ok(())
    }

    /// Attaches a cylinder around `axis` to an external object.
    pub fn add_cylinder(
        &mut self,
        obj: ExternalObjectHandle,
        pos: Vector3<f64>,
        axis: Vector3<f64>,
        radius: f64,
        half_len: f64,
        normal: NormalSign,
        material: u32,
    ) -> Result<(), DemError> {
        self.external_mut(obj)?.components.push(AnalyticalComponent {
            kind: AnalyticalKind::Cylinder,
            material,
            pos,
            rot: axis,
            size1: radius,
            size2: half_len,
            size3: 0.0,
            normal,
        });
        Ok(())
    }

    /// Convenience: a standalone boundary plane (its own fixed external
    /// object).
    pub fn add_bc_plane(
        &mut self,
        pos: Vector3<f64>,
        normal: Vector3<f64>,
        material: u32,
    ) -> Result<ExternalObjectHandle, DemError> {
        let obj = self.add_external_object();
        self.add_plane(obj, pos, normal, material)?;
        Ok(obj)
    }

    /// Adds a mesh object from facet rows, optionally with reference
    /// normals for vertex-order correction.
    pub fn add_mesh_object(
        &mut self,
        facets: Vec<Facet>,
        reference_normals: Option<Vec<Vector3<f64>>>,
        mass: f64,
        moi: Vector3<f64>,
    ) -> Result<MeshHandle, DemError> {
        self.registry
            .add_mesh_object(facets, reference_normals, mass, moi, &self.anomalies)
    }

    // ==================== Families ====================

    /// Disables contacts between two families (they may be equal, which
    /// disables self-contact within the family).
    pub fn disable_contact_between_families(&mut self, a: u32, b: u32) {
        self.registry.no_contact_pairs.push(FamilyPair { a, b });
    }

    /// Fixes all entities of a family (all velocity channels prescribed to
    /// zero, dictated).
    pub fn set_family_fixed(&mut self, family: u32) {
        self.registry
            .prescriptions
            .push(FamilyPrescription::fixed(family));
    }

    /// Prescribes a family's linear velocity; `"none"` leaves a channel
    /// unprescribed. With `dictate`, the prescription overrides integration.
    pub fn set_family_prescribed_lin_vel(
        &mut self,
        family: u32,
        vx: &str,
        vy: &str,
        vz: &str,
        dictate: bool,
    ) {
        self.registry.prescriptions.push(FamilyPrescription {
            family,
            lin_vel: [channel(vx), channel(vy), channel(vz)],
            lin_vel_dictated: dictate,
            rot_vel_dictated: dictate,
            used: true,
            ..Default::default()
        });
    }

    /// Prescribes a family's angular velocity (owner-local frame).
    pub fn set_family_prescribed_ang_vel(
        &mut self,
        family: u32,
        wx: &str,
        wy: &str,
        wz: &str,
        dictate: bool,
    ) {
        self.registry.prescriptions.push(FamilyPrescription {
            family,
            ang_vel: [channel(wx), channel(wy), channel(wz)],
            lin_vel_dictated: dictate,
            rot_vel_dictated: dictate,
            used: true,
            ..Default::default()
        });
    }

    /// Prescribes a family's position channels (dictated).
    pub fn set_family_prescribed_position(&mut self, family: u32, x: &str, y: &str, z: &str) {
        self.registry.prescriptions.push(FamilyPrescription {
            family,
            lin_pos: [channel(x), channel(y), channel(z)],
            lin_pos_dictated: true,
            rot_pos_dictated: true,
            used: true,
            ..Default::default()
        });
    }

    /// Prescribes a family's orientation. The formula is kernel statement
    /// text assigning `oriW`, `oriX`, `oriY`, `oriZ`.
    pub fn set_family_prescribed_quaternion(&mut self, family: u32, formula: &str) {
        self.registry.prescriptions.push(FamilyPrescription {
            family,
            quat: channel(formula),
            lin_pos_dictated: true,
            rot_pos_dictated: true,
            used: true,
            ..Default::default()
        });
    }

    /// Registers a conditional family change, evaluated every step once
    /// initialized.
    pub fn change_family_when(&mut self, from: u32, to: u32, condition: impl Into<String>) {
        self.registry.change_rules.push(FamilyChangeRule {
            from,
            to,
            condition: condition.into(),
        });
    }

    /// Immediately moves every owner of `from` into `to`. Requires idle
    /// workers (any time between `do_dynamics` calls) and an initialized
    /// system.
    pub fn change_family_now(&mut self, from: u32, to: u32) -> Result<(), DemError> {
        let shared = self.shared()?;
        let from_i = shared.family.internal(from)?;
        let to_i = shared.family.internal(to)?;
        let mut st = self.lock_dynamic()?;
        for f in &mut st.family {
            if *f == from_i {
                *f = to_i;
            }
        }
        Ok(())
    }

    // ==================== Trackers ====================

    /// Tracks a clump batch; the tracker resolves to its contiguous owner
    /// range.
    pub fn track_clump_batch(&mut self, batch: ClumpBatchHandle) -> TrackerHandle {
        self.trackers.push(Tracked {
            target: TrackTarget::Batch(batch.0),
            valid: true,
        });
        TrackerHandle(self.trackers.len() - 1)
    }

    /// Tracks an external object.
    pub fn track_external_object(&mut self, obj: ExternalObjectHandle) -> TrackerHandle {
        self.trackers.push(Tracked {
            target: TrackTarget::External(obj.0),
            valid: true,
        });
        TrackerHandle(self.trackers.len() - 1)
    }

    /// Tracks a mesh object.
    pub fn track_mesh(&mut self, mesh: MeshHandle) -> TrackerHandle {
        self.trackers.push(Tracked {
            target: TrackTarget::Mesh(mesh.0),
            valid: true,
        });
        TrackerHandle(self.trackers.len() - 1)
    }

    /// Resolves a tracker (plus offset into its range) to an owner id.
    pub fn tracker_owner(&self, tracker: TrackerHandle, offset: usize) -> Result<u32, DemError> {
        let t = self
            .trackers
            .get(tracker.0)
            .ok_or_else(|| DemError::config("unknown tracker handle"))?;
        if !t.valid {
            return Err(DemError::config(
                "tracker was invalidated (the owner layout was compacted)",
            ));
        }
        self.shared()?;
        let base = match t.target {
            TrackTarget::Batch(b) => {
                *self
                    .batch_base
                    .get(b as usize)
                    .ok_or_else(|| DemError::config("tracked batch is not uploaded yet"))?
                    as usize
            }
            TrackTarget::External(e) => self.ext_base as usize + e as usize,
            TrackTarget::Mesh(m) => self.mesh_base as usize + m as usize,
        };
        Ok((base + offset) as u32)
    }

    // ==================== Owner state access ====================

    /// Gets an owner's CoM position.
    pub fn owner_position(&self, owner: u32) -> Result<Vector3<f64>, DemError> {
        let shared = self.shared()?;
        let st = self.lock_dynamic()?;
        check_owner(owner, st.n_owners)?;
        Ok(st.world_pos(&shared, owner as usize))
    }

    /// Gets an owner's orientation.
    pub fn owner_orientation(&self, owner: u32) -> Result<UnitQuaternion<f64>, DemError> {
        let st = self.lock_dynamic()?;
        check_owner(owner, st.n_owners)?;
        Ok(st.quat[owner as usize])
    }

    /// Gets an owner's linear velocity.
    pub fn owner_velocity(&self, owner: u32) -> Result<Vector3<f64>, DemError> {
        let st = self.lock_dynamic()?;
        check_owner(owner, st.n_owners)?;
        Ok(st.vel[owner as usize])
    }

    /// Gets an owner's angular velocity (owner-local frame).
    pub fn owner_ang_velocity(&self, owner: u32) -> Result<Vector3<f64>, DemError> {
        let st = self.lock_dynamic()?;
        check_owner(owner, st.n_owners)?;
        Ok(st.ang_vel[owner as usize])
    }

    /// Gets an owner's current user-level family number.
    pub fn owner_family(&self, owner: u32) -> Result<u32, DemError> {
        let shared = self.shared()?;
        let st = self.lock_dynamic()?;
        check_owner(owner, st.n_owners)?;
        Ok(shared.family.user(st.family[owner as usize]))
    }

    /// Sets an owner's CoM position.
    pub fn set_owner_position(&self, owner: u32, pos: Vector3<f64>) -> Result<(), DemError> {
        let shared = self.shared()?;
        let mut st = self.lock_dynamic()?;
        check_owner(owner, st.n_owners)?;
        let (voxel, sub) = shared.world.codec.encode(pos);
        st.voxel[owner as usize] = voxel;
        st.sub[owner as usize] = sub;
        Ok(())
    }

    /// Sets an owner's orientation.
    pub fn set_owner_orientation(
        &self,
        owner: u32,
        quat: UnitQuaternion<f64>,
    ) -> Result<(), DemError> {
        let mut st = self.lock_dynamic()?;
        check_owner(owner, st.n_owners)?;
        st.quat[owner as usize] = quat;
        Ok(())
    }

    /// Sets an owner's linear velocity.
    pub fn set_owner_velocity(&self, owner: u32, vel: Vector3<f64>) -> Result<(), DemError> {
        let mut st = self.lock_dynamic()?;
        check_owner(owner, st.n_owners)?;
        st.vel[owner as usize] = vel;
        Ok(())
    }

    /// Sets an owner's angular velocity (owner-local frame).
    pub fn set_owner_ang_velocity(&self, owner: u32, w: Vector3<f64>) -> Result<(), DemError> {
        let mut st = self.lock_dynamic()?;
        check_owner(owner, st.n_owners)?;
        st.ang_vel[owner as usize] = w;
        Ok(())
    }

    /// Applies an extra force to an owner for the next time step.
    pub fn add_force(&self, owner: u32, force: Vector3<f64>) -> Result<(), DemError> {
        let mut st = self.lock_dynamic()?;
        check_owner(owner, st.n_owners)?;
        st.extra_force[owner as usize] += force;
        Ok(())
    }

    // ==================== Initialization ====================

    /// Initializes the system: validation, preprocessing, family
    /// compilation, array allocation, kernel specialization. Callable again
    /// after configuration changes; the state machine restarts from
    /// `Validated`.
    pub fn initialize(&mut self) -> Result<(), DemError> {
        // ---- Validation.
        self.validate_inputs()?;
        self.stage = InitStage::Validated;

        // ---- World geometry.
        let codec = self.build_codec()?;

        // ---- Boundary planes from the bounding-box instruction.
        self.add_world_bounding_box(&codec)?;

        // ---- Flatten templates and objects.
        let (model, init_state) = flatten(&mut self.registry, &self.anomalies)?;
        self.stage = InitStage::TemplatesFlat;

        // ---- Families.
        let family = Arc::new(compile_family_table(
            &self.registry.user_families(),
            &init_state.present_families(),
            &self.registry.prescriptions,
            &self.registry.no_contact_pairs,
            &self.registry.change_rules,
            &self.cache,
            self.cfg.ensure_line_numbers,
            &self.anomalies,
        )?);
        self.stage = InitStage::FamiliesCompiled;

        // ---- Bin grid.
        let bin_size = decide_bin_size(self.cfg.bin_size, model.smallest_radius)?;
        let grid = BinGrid::derive(&codec, bin_size)?;

        // ---- Drift / margin coupling check.
        if self.cfg.update_freq > 0 && self.governor.beta() <= 0.0 {
            self.anomalies.record(
                Warning::NoExpandFactor,
                self.cfg.update_freq as i64,
                format!(
                    "physics may stretch {} steps ahead of contact detection but no geometry \
                     expansion is configured; contacts can be missed",
                    self.cfg.update_freq
                ),
            );
        }

        // ---- Custom force model specialization.
        let custom_force = match (&self.cfg.force_kind, &self.cfg.custom_force_src) {
            (ForceModelKind::Custom, Some(src)) => {
                let mut map = SubstitutionMap::new();
                map.insert("forceModel", src.clone());
                if self.cfg.ensure_line_numbers {
                    map.compact_all();
                }
                let source = specialize(templates::FORCE_MODEL, &map);
                Some(
                    self.cache
                        .compile(&source)
                        .map_err(|e| DemError::compile(e, map.snapshot()))?,
                )
            }
            (ForceModelKind::Custom, None) => {
                return Err(DemError::config(
                    "a custom force model was selected but no model text was supplied",
                ))
            }
            _ => None,
        };

        let dt = self.cfg.dt.unwrap_or(0.0);
        let world = WorldParams {
            codec,
            dims: self.cfg.world_dims.unwrap_or_else(|| codec.coverage()),
            gravity: self.cfg.gravity,
            dt,
        };
        let shared = Arc::new(EngineShared {
            world,
            model: Arc::new(model),
            family,
            force_kind: self.cfg.force_kind,
            custom_force,
            historyless: self.cfg.historyless,
            accumulation: self.cfg.accumulation,
            integrator: self.cfg.integrator,
            sort_pairs: self.cfg.sort_pairs,
            max_per_bin: self.cfg.max_per_bin,
            update_freq: self.cfg.update_freq,
            worker_threads: self.cfg.worker_threads,
        });

        // ---- Allocate and populate worker arrays.
        let mut new_dyn = DynamicState::from_initial(&shared, &init_state)?;
        {
            let mut kin = self
                .kin_state
                .lock()
                .map_err(|_| DemError::config("kinematic state mutex poisoned"))?;
            *kin = KinematicState::new(grid, self.governor.clone(), self.cfg.sort_pairs);
            if let Some(policy) = self.cfg.adaptive {
                kin.governor.set_adaptive(policy);
            }
            self.stage = InitStage::ArraysAllocated;

            // ---- Seed the first pair list synchronously so the first dT
            // step never integrates blind.
            let snapshot = new_dyn.snapshot();
            let pairs = broad_phase_round(&self.hub, &shared, &mut kin, &snapshot)?;
            new_dyn.adopt_pairs(pairs);
        }
        {
            let mut st = self.lock_dynamic()?;
            *st = new_dyn;
        }
        self.stage = InitStage::KernelsSpecialized;

        // ---- Hand the workers their context.
        self.hub.drain();
        self.hub.clear_stats();
        self.hub.set_max_drift(shared.max_drift());
        self.abort.store(false, Ordering::Release);
        self.dt_worker.send(Command::Install(Arc::clone(&shared)));
        self.kt_worker.send(Command::Install(Arc::clone(&shared)));
        self.dt_worker.wait_idle();
        self.kt_worker.wait_idle();

        self.shared = Some(shared);
        self.batches_uploaded = self.registry.batches.len();
        // Owner layout: batches in load order, then external objects, then
        // meshes; trackers resolve against these bases.
        self.batch_base.clear();
        let mut base = 0u32;
        for batch in &self.registry.batches {
            self.batch_base.push(base);
            base += batch.len() as u32;
        }
        self.ext_base = base;
        self.mesh_base = base + self.registry.external_objects.len() as u32;
        self.staging = Some(init_state);
        self.stage = InitStage::Ready;

        if self.verbosity >= Verbosity::Info {
            if let Some(s) = &self.shared {
                tracing::info!(
                    owners = s.model.n_owners,
                    spheres = s.model.n_spheres,
                    analytical = s.model.n_anal,
                    facets = s.model.n_tri,
                    families = s.family.len(),
                    "initialized"
                );
            }
        }
        Ok(())
    }

    /// Current initialization stage.
    #[must_use]
    pub fn init_stage(&self) -> InitStage {
        self.stage
    }

    // ==================== Dynamics ====================

    /// Advances the simulation by `duration` seconds of simulated time
    /// (`round(duration / dt)` integrator steps) without forcing a final
    /// kT/dT synchronization.
    pub fn do_dynamics(&mut self, duration: f64) -> Result<(), DemError> {
        if self.stage != InitStage::Ready {
            return Err(DemError::NotInitialized);
        }
        let dt = self.cfg.dt.unwrap_or(0.0);
        if dt <= 0.0 {
            return Err(DemError::config("time step size is not positive"));
        }
        let cycles = (duration / dt).round() as u64;
        if cycles == 0 {
            return Ok(());
        }

        self.hub.set_dynamic_done(false);
        self.hub.clear_breaks();
        self.abort.store(false, Ordering::Release);

        self.kt_worker.send(Command::Run { cycles });
        self.dt_worker.send(Command::Run { cycles });

        // Block until dT reports the run complete; kT winds down on the
        // done flag right after.
        self.dt_worker.wait_idle();
        if self.abort.load(Ordering::Acquire) {
            // An aborted run may leave kT blocked on its input; release it
            // before waiting.
            self.hub.break_waiting(true);
        }
        self.kt_worker.wait_idle();

        if self.abort.load(Ordering::Acquire) {
            // Surface the kinematic worker's fatal error when it has one;
            // dT aborts land here too.
            let mut kin = self
                .kin_state
                .lock()
                .map_err(|_| DemError::config("kinematic state mutex poisoned"))?;
            if let Some(e) = kin.last_error.take() {
                return Err(e);
            }
            return Err(DemError::config(
                "the dynamic run aborted; see the log for the failing kernel",
            ));
        }
        Ok(())
    }

    /// Advances the simulation and synchronizes both workers on return: kT
    /// has observed and acknowledged dT's final state, and both buffers are
    /// drained.
    pub fn do_dynamics_then_sync(&mut self, duration: f64) -> Result<(), DemError> {
        self.do_dynamics(duration)?;
        self.reset_worker_threads();
        Ok(())
    }

    /// Equivalent to one `do_dynamics(dt)` step.
    pub fn do_step_dynamics(&mut self) -> Result<(), DemError> {
        let dt = self.cfg.dt.unwrap_or(0.0);
        self.do_dynamics(dt)
    }

    /// Tears down any in-flight worker iteration (releasing blocked waits),
    /// drains the handshake buffers, and leaves both workers idle. The
    /// collaboration statistics survive.
    pub fn reset_worker_threads(&mut self) {
        self.hub.break_waiting(true);
        self.hub.break_waiting(false);
        self.dt_worker.wait_idle();
        self.kt_worker.wait_idle();
        self.hub.clear_breaks();
        self.hub.drain();
        self.abort.store(false, Ordering::Release);
    }

    // ==================== Mid-run maintenance ====================

    /// Pushes changed solver preferences (gravity, time step, update
    /// frequency, accumulation, integrator) to the workers without
    /// reallocation or respecialization.
    pub fn update_sim_params(&mut self) -> Result<(), DemError> {
        let old = self.shared()?;
        let shared = Arc::new(EngineShared {
            world: WorldParams {
                codec: old.world.codec,
                dims: old.world.dims,
                gravity: self.cfg.gravity,
                dt: self.cfg.dt.unwrap_or(old.world.dt),
            },
            model: Arc::clone(&old.model),
            family: Arc::clone(&old.family),
            force_kind: self.cfg.force_kind,
            custom_force: old.custom_force.clone(),
            historyless: self.cfg.historyless,
            accumulation: self.cfg.accumulation,
            integrator: self.cfg.integrator,
            sort_pairs: self.cfg.sort_pairs,
            max_per_bin: self.cfg.max_per_bin,
            update_freq: self.cfg.update_freq,
            worker_threads: self.cfg.worker_threads,
        });
        self.install(shared);
        Ok(())
    }

    /// Transfers clump batches added since initialization to the workers,
    /// allocating their owners and spheres. New templates or materials
    /// require a full re-initialization instead.
    pub fn update_worker_arrays(&mut self) -> Result<(), DemError> {
        let old = self.shared()?;
        if self.batches_uploaded == self.registry.batches.len() {
            return Ok(());
        }
        let mut model = (*old.model).clone();
        let mut new_bases = Vec::new();
        let mut st = self.lock_dynamic()?;

        for batch in &self.registry.batches[self.batches_uploaded..] {
            new_bases.push(model.n_owners as u32);
            for i in 0..batch.len() {
                let tpl_handle = batch.templates[i].0 as usize;
                let internal = self.registry.templates[tpl_handle].mark;
                let owner = model.n_owners as u32;
                model.owner_prop.push(internal);
                model.owner_kind.push(OwnerKind::Clump(internal));
                model.n_owners += 1;
                model.n_clump_owners += 1;

                let adr = model.tpl_comp_adr[internal as usize];
                let num = model.tpl_comp_num[internal as usize];
                for c in adr..adr + num {
                    model.sphere_owner.push(owner);
                    model.sphere_rel_pos.push(model.comp_rel_pos[c]);
                    model.sphere_radius.push(model.comp_radius[c]);
                    model.sphere_mat.push(model.comp_mat[c]);
                    model.n_spheres += 1;
                }

                let fam_user = batch.families.as_ref().map_or(0, |f| f[i]);
                let fam = old.family.internal(fam_user)?;
                let (voxel, sub) = old.world.codec.encode(batch.positions[i]);
                st.voxel.push(voxel);
                st.sub.push(sub);
                st.quat.push(
                    batch
                        .orientations
                        .as_ref()
                        .map_or(UnitQuaternion::identity(), |q| q[i]),
                );
                st.vel
                    .push(batch.velocities.as_ref().map_or(Vector3::zeros(), |v| v[i]));
                st.ang_vel.push(
                    batch
                        .ang_velocities
                        .as_ref()
                        .map_or(Vector3::zeros(), |v| v[i]),
                );
                st.family.push(fam);
                st.active.push(true);
                st.force.push(Vector3::zeros());
                st.torque.push(Vector3::zeros());
                st.extra_force.push(Vector3::zeros());
                st.acc_last.push(Vector3::zeros());
                st.n_owners += 1;
            }
        }
        drop(st);

        let shared = Arc::new(EngineShared {
            world: WorldParams {
                codec: old.world.codec,
                dims: old.world.dims,
                gravity: old.world.gravity,
                dt: old.world.dt,
            },
            model: Arc::new(model),
            family: Arc::clone(&old.family),
            force_kind: old.force_kind,
            custom_force: old.custom_force.clone(),
            historyless: old.historyless,
            accumulation: old.accumulation,
            integrator: old.integrator,
            sort_pairs: old.sort_pairs,
            max_per_bin: old.max_per_bin,
            update_freq: old.update_freq,
            worker_threads: old.worker_threads,
        });
        self.install(shared);
        self.batch_base.extend(new_bases);
        self.batches_uploaded = self.registry.batches.len();
        Ok(())
    }

    /// Drops all owners of a family and reclaims their array slots.
    /// Requires idle workers; trackers into the purged set invalidate.
    pub fn purge_family(&mut self, family: u32) -> Result<(), DemError> {
        let old = self.shared()?;
        let fam = old.family.internal(family)?;
        let mut st = self.lock_dynamic()?;

        let keep: Vec<bool> = st.family.iter().map(|&f| f != fam).collect();
        if keep.iter().all(|&k| k) {
            return Ok(());
        }
        // Owner id remap: old -> new.
        let mut remap = vec![u32::MAX; st.n_owners];
        let mut next = 0u32;
        for (i, &k) in keep.iter().enumerate() {
            if k {
                remap[i] = next;
                next += 1;
            }
        }

        let mut model = (*old.model).clone();
        filter_in_place(&mut model.owner_prop, &keep);
        filter_in_place(&mut model.owner_kind, &keep);
        model.n_owners = next as usize;
        model.n_clump_owners = model
            .owner_kind
            .iter()
            .filter(|k| matches!(k, OwnerKind::Clump(_)))
            .count();

        let sphere_keep: Vec<bool> = model
            .sphere_owner
            .iter()
            .map(|&o| keep[o as usize])
            .collect();
        filter_in_place(&mut model.sphere_owner, &sphere_keep);
        filter_in_place(&mut model.sphere_rel_pos, &sphere_keep);
        filter_in_place(&mut model.sphere_radius, &sphere_keep);
        filter_in_place(&mut model.sphere_mat, &sphere_keep);
        for o in &mut model.sphere_owner {
            *o = remap[*o as usize];
        }
        model.n_spheres = model.sphere_owner.len();

        let anal_keep: Vec<bool> = model.anal_owner.iter().map(|&o| keep[o as usize]).collect();
        filter_in_place(&mut model.anal_owner, &anal_keep);
        filter_in_place(&mut model.anal_kind, &anal_keep);
        filter_in_place(&mut model.anal_mat, &anal_keep);
        filter_in_place(&mut model.anal_pos, &anal_keep);
        filter_in_place(&mut model.anal_rot, &anal_keep);
        filter_in_place(&mut model.anal_size1, &anal_keep);
        filter_in_place(&mut model.anal_size2, &anal_keep);
        filter_in_place(&mut model.anal_size3, &anal_keep);
        filter_in_place(&mut model.anal_normal, &anal_keep);
        for o in &mut model.anal_owner {
            *o = remap[*o as usize];
        }
        model.n_anal = model.anal_owner.len();

        let tri_keep: Vec<bool> = model.tri_owner.iter().map(|&o| keep[o as usize]).collect();
        filter_in_place(&mut model.tri_owner, &tri_keep);
        filter_in_place(&mut model.tri_mat, &tri_keep);
        filter_in_place(&mut model.tri_vertices, &tri_keep);
        for o in &mut model.tri_owner {
            *o = remap[*o as usize];
        }
        model.n_tri = model.tri_owner.len();

        filter_in_place(&mut st.voxel, &keep);
        filter_in_place(&mut st.sub, &keep);
        filter_in_place(&mut st.quat, &keep);
        filter_in_place(&mut st.vel, &keep);
        filter_in_place(&mut st.ang_vel, &keep);
        filter_in_place(&mut st.family, &keep);
        filter_in_place(&mut st.active, &keep);
        filter_in_place(&mut st.force, &keep);
        filter_in_place(&mut st.torque, &keep);
        filter_in_place(&mut st.extra_force, &keep);
        filter_in_place(&mut st.acc_last, &keep);
        st.n_owners = next as usize;
        // Geometry ids shifted; stale identities must not leak.
        st.history.clear();
        st.pairs.pairs.clear();
        drop(st);

        // Compaction shifts the owner layout under every tracker; all of
        // them invalidate (re-track after a purge).
        for t in &mut self.trackers {
            t.valid = false;
        }

        let shared = Arc::new(EngineShared {
            world: WorldParams {
                codec: old.world.codec,
                dims: old.world.dims,
                gravity: old.world.gravity,
                dt: old.world.dt,
            },
            model: Arc::new(model),
            family: Arc::clone(&old.family),
            force_kind: old.force_kind,
            custom_force: old.custom_force.clone(),
            historyless: old.historyless,
            accumulation: old.accumulation,
            integrator: old.integrator,
            sort_pairs: old.sort_pairs,
            max_per_bin: old.max_per_bin,
            update_freq: old.update_freq,
            worker_threads: old.worker_threads,
        });
        // Reseed the pair list against the compacted geometry.
        {
            let mut kin = self
                .kin_state
                .lock()
                .map_err(|_| DemError::config("kinematic state mutex poisoned"))?;
            let mut st = self.lock_dynamic()?;
            let snapshot = st.snapshot();
            let pairs = broad_phase_round(&self.hub, &shared, &mut kin, &snapshot)?;
            st.adopt_pairs(pairs);
        }
        self.install(shared);
        Ok(())
    }

    /// Drops host-side cached inputs so the system can be re-defined and
    /// re-initialized from scratch.
    pub fn clear_cache(&mut self) {
        self.registry.clear();
        self.cache.clear();
        self.trackers.clear();
        self.bbox_object = None;
        self.batches_uploaded = 0;
        self.staging = None;
        self.stage = InitStage::Uninitialized;
    }

    /// Releases the flattening staging kept from initialization (only
    /// needed again by the next re-initialization, which regenerates it).
    pub fn release_flattened_arrays(&mut self) {
        self.staging = None;
    }

    // ==================== Queries ====================

    /// Total kinetic energy of all clumps.
    pub fn total_kinetic_energy(&self) -> Result<f64, DemError> {
        let shared = self.shared()?;
        let st = self.lock_dynamic()?;
        Ok(st.kinetic_energy(&shared))
    }

    /// Builds an inspector over the dynamic state.
    pub fn inspector(&self, quantity: InspectorQuantity) -> Result<Inspector, DemError> {
        let shared = self.shared()?;
        let program = match &quantity {
            InspectorQuantity::Custom { predicate, .. } => {
                let mut map = SubstitutionMap::new();
                map.insert("inspectorPredicate", predicate.clone());
                let source = specialize(templates::INSPECTOR_PREDICATE, &map);
                Some(
                    self.cache
                        .compile(&source)
                        .map_err(|e| DemError::compile(e, map.snapshot()))?,
                )
            }
            _ => None,
        };
        Ok(Inspector {
            shared,
            state: Arc::clone(&self.dyn_state),
            quantity,
            program,
        })
    }

    /// The contact pairs dT currently integrates against, as owner-id
    /// pairs. Meaningful on a synchronized system.
    pub fn contact_pairs(&self) -> Result<Vec<(u32, u32)>, DemError> {
        let shared = self.shared()?;
        let st = self.lock_dynamic()?;
        let model = &shared.model;
        Ok(st
            .pairs
            .pairs
            .iter()
            .map(|p| {
                let a = model.sphere_owner[p.a as usize];
                let b = match p.kind {
                    crate::broad::ContactKind::SphereSphere => model.sphere_owner[p.b as usize],
                    crate::broad::ContactKind::SphereAnalytical => model.anal_owner[p.b as usize],
                    crate::broad::ContactKind::SphereTriangle => model.tri_owner[p.b as usize],
                };
                (a, b)
            })
            .collect())
    }

    /// Collaboration statistics of the kT/dT pair.
    #[must_use]
    pub fn collaboration_stats(&self) -> CollaborationStats {
        self.hub.stats()
    }

    /// Clears the collaboration statistics back to zero.
    pub fn clear_collaboration_stats(&self) {
        self.hub.clear_stats();
    }

    /// Wall-time accumulators of both workers: `(worker, [(task, secs)])`.
    #[must_use]
    pub fn timing_stats(&self) -> Vec<(String, Vec<(String, f64)>)> {
        let mut out = Vec::new();
        if let Ok(st) = self.dyn_state.lock() {
            out.push(("dT".to_string(), st.timers.snapshot()));
        }
        if let Ok(st) = self.kin_state.lock() {
            out.push(("kT".to_string(), st.timers.snapshot()));
        }
        out
    }

    /// Clears the wall-time accumulators.
    pub fn clear_timing_stats(&self) {
        if let Ok(mut st) = self.dyn_state.lock() {
            st.timers.clear();
        }
        if let Ok(mut st) = self.kin_state.lock() {
            st.timers.clear();
        }
    }

    /// Recent anomaly records, oldest first.
    #[must_use]
    pub fn anomalies(&self) -> Vec<Anomaly> {
        self.anomalies.recent()
    }

    /// Clears anomaly statistics and the ring.
    pub fn clear_anomalies(&self) {
        self.anomalies.clear();
    }

    /// Internal family id of a user family number (post-initialization).
    pub fn internal_family_of(&self, user: u32) -> Result<u8, DemError> {
        Ok(self.shared()?.family.internal(user)?)
    }

    /// Internal (sorted) index of a clump template (post-initialization).
    pub fn template_internal_index(&self, handle: ClumpTemplateHandle) -> Result<u32, DemError> {
        if self.stage < InitStage::TemplatesFlat {
            return Err(DemError::NotInitialized);
        }
        self.registry
            .templates
            .get(handle.0 as usize)
            .map(|t| t.mark)
            .ok_or_else(|| DemError::config("unknown template handle"))
    }

    /// Simulated time on the dynamic worker.
    pub fn simulated_time(&self) -> Result<f64, DemError> {
        Ok(self.lock_dynamic()?.time)
    }

    // ==================== Persistence ====================

    /// Writes the current clump state to `path` in the configured
    /// mode/format/content.
    pub fn write_clump_file(&self, path: impl AsRef<Path>) -> Result<(), DemError> {
        let shared = self.shared()?;
        let st = self.lock_dynamic()?;
        let no_output: Vec<u8> = self
            .registry
            .no_output_families
            .iter()
            .filter_map(|f| shared.family.internal(*f).ok())
            .collect();
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        write_clump_dump(
            &mut file,
            &shared,
            &st,
            self.cfg.out_mode,
            self.cfg.out_format,
            self.cfg.out_content,
            &no_output,
        )
    }

    // ==================== Internals ====================

    fn validate_inputs(&mut self) -> Result<(), DemError> {
        if self.registry.materials.is_empty() {
            return Err(DemError::config(
                "at least one material must be loaded via load_material before initialization",
            ));
        }
        if self.registry.templates.is_empty() {
            return Err(DemError::config(
                "at least one clump template must be defined via load_clump_template before \
                 initialization",
            ));
        }
        match self.cfg.dt {
            Some(dt) if dt > 0.0 => {}
            Some(dt) => {
                return Err(DemError::config(format!(
                    "time step size is {dt}; supply a positive number via set_time_step"
                )))
            }
            None => {
                return Err(DemError::config(
                    "time step size was never set; supply one via set_time_step",
                ))
            }
        }
        match (self.cfg.world_dims, self.cfg.explicit_nv) {
            (None, None) => Err(DemError::config(
                "world geometry is unset; call set_world_box or set_num_voxels",
            )),
            (Some(d), None) if d.x <= 0.0 || d.y <= 0.0 || d.z <= 0.0 => {
                Err(DemError::config(format!(
                    "the simulation world is {} by {} by {}; it is impossibly small",
                    d.x, d.y, d.z
                )))
            }
            _ => Ok(()),
        }
    }

    fn build_codec(&mut self) -> Result<VoxelCodec, DemError> {
        if let Some(((x, y, z), l)) = self.cfg.explicit_nv {
            let codec = VoxelCodec::from_powers(Vector3::zeros(), (x, y, z), l)?;
            // Explicit voxel counts define the world size.
            let cov = codec.coverage();
            let origin = match self.cfg.origin {
                OriginSpec::Explicit(o) => o,
                OriginSpec::Center => -cov / 2.0,
            };
            self.cfg.world_dims = Some(cov);
            VoxelCodec::from_powers(origin, (x, y, z), l)
        } else {
            let dims = self
                .cfg
                .world_dims
                .ok_or_else(|| DemError::config("world geometry is unset"))?;
            let origin = match self.cfg.origin {
                OriginSpec::Explicit(o) => o,
                OriginSpec::Center => -dims / 2.0,
            };
            VoxelCodec::from_box(origin, dims)
        }
    }

    /// Adds (or refreshes) the boundary planes of the bounding-box
    /// instruction on a dedicated fixed external object.
    fn add_world_bounding_box(&mut self, codec: &VoxelCodec) -> Result<(), DemError> {
        if self.cfg.bbox == BoundingBoxMode::None {
            return Ok(());
        }
        let material = self.cfg.bbox_material.ok_or_else(|| {
            DemError::config("bounding-box planes need a material; pass one to set_bounding_box")
        })?;
        let dims = self
            .cfg
            .world_dims
            .ok_or_else(|| DemError::config("world geometry is unset"))?;
        let o = codec.origin;

        let obj = match self.bbox_object {
            Some(h) => {
                self.external_mut(h)?.components.clear();
                h
            }
            None => {
                let h = self.registry.add_external_object();
                self.bbox_object = Some(h);
                h
            }
        };
        self.registry.external_objects[obj.0 as usize].family = RESERVED_FAMILY;

        let mut planes = vec![
            (o, Vector3::z()),                                     // bottom
            (o, Vector3::x()),                                     // -x side
            (o, Vector3::y()),                                     // -y side
            (o + Vector3::new(dims.x, 0.0, 0.0), -Vector3::x()),   // +x side
            (o + Vector3::new(0.0, dims.y, 0.0), -Vector3::y()),   // +y side
        ];
        if self.cfg.bbox == BoundingBoxMode::All {
            planes.push((o + Vector3::new(0.0, 0.0, dims.z), -Vector3::z())); // top
        }
        for (pos, normal) in planes {
            self.add_plane(obj, pos, normal, material)?;
        }
        Ok(())
    }

    fn install(&mut self, shared: Arc<EngineShared>) {
        self.hub.set_max_drift(shared.max_drift());
        self.dt_worker.send(Command::Install(Arc::clone(&shared)));
        self.kt_worker.send(Command::Install(Arc::clone(&shared)));
        self.dt_worker.wait_idle();
        self.kt_worker.wait_idle();
        self.shared = Some(shared);
    }

    fn shared(&self) -> Result<Arc<EngineShared>, DemError> {
        self.shared.clone().ok_or(DemError::NotInitialized)
    }

    fn lock_dynamic(&self) -> Result<std::sync::MutexGuard<'_, DynamicState>, DemError> {
        self.dyn_state
            .lock()
            .map_err(|_| DemError::config("dynamic state mutex poisoned"))
    }

    fn batch_mut(
        &mut self,
        handle: ClumpBatchHandle,
    ) -> Result<&mut crate::registry::ClumpBatch, DemError> {
        self.registry
            .batches
            .get_mut(handle.0 as usize)
            .ok_or_else(|| DemError::config("unknown clump batch handle"))
    }

    fn external_mut(
        &mut self,
        handle: ExternalObjectHandle,
    ) -> Result<&mut crate::registry::ExternalObject, DemError> {
        self.registry
            .external_objects
            .get_mut(handle.0 as usize)
            .ok_or_else(|| DemError::config("unknown external object handle"))
    }
}

impl Default for DemSolver {
    fn default() -> Self {
        Self::new()
    }
}

fn channel(s: &str) -> Option<String> {
    if s == "none" {
        None
    } else {
        Some(s.to_string())
    }
}

fn check_owner(owner: u32, count: usize) -> Result<(), DemError> {
    if (owner as usize) < count {
        Ok(())
    } else {
        Err(DemError::OwnerOutOfRange { id: owner, count })
    }
}

fn filter_in_place<T: Clone>(v: &mut Vec<T>, keep: &[bool]) {
    let mut i = 0;
    v.retain(|_| {
        let k = keep[i];
        i += 1;
        k
    });
}
