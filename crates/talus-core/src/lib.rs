//! Talus: a discrete element method engine for large granular populations.
//!
//! The engine simulates rigid granular bodies (spherical clumps, analytical
//! boundaries, triangle meshes) interacting through contact forces under
//! gravity and user-prescribed motion. Its load-bearing idea is an
//! asynchronous pair of workers:
//!
//! - **kT**, the kinematic worker: spatial binning, candidate contact-pair
//!   production, sorted pair delivery;
//! - **dT**, the dynamic worker: narrow-phase force computation, velocity and
//!   position integration, owner-state updates.
//!
//! The two run on separate OS threads and exchange data through single-slot
//! handshake buffers with fresh flags. dT may run ahead of kT by a bounded
//! number of steps (the *drift*); geometries are inflated by a safety margin
//! during binning so no contact forms undetected while kT lags. Within each
//! worker, kernels are data-parallel over a worker-owned thread pool.
//!
//! # Quick start
//!
//! ```no_run
//! use talus_core::{DemSolver, Material};
//! use nalgebra::Vector3;
//!
//! let mut sim = DemSolver::new();
//! sim.set_world_box(1.0, 1.0, 1.0);
//! sim.set_time_step(1e-5);
//! sim.set_gravity(Vector3::new(0.0, 0.0, -9.81));
//!
//! let mat = sim.load_material(Material::new(1e7, 0.3, 0.8, 0.5, 0.0));
//! let ball = sim.load_simple_sphere(0.01, 0.005, mat)?;
//! let batch = sim.add_clumps(vec![ball], vec![Vector3::new(0.5, 0.5, 0.5)])?;
//! # let _ = batch;
//!
//! sim.initialize()?;
//! sim.do_dynamics_then_sync(0.1)?;
//! # Ok::<(), talus_core::DemError>(())
//! ```
//!
//! # Module organization
//!
//! - [`solver`]: the [`DemSolver`] facade: configuration, the forward-only
//!   initialization state machine, and the runtime API
//! - [`codec`]: voxel + sub-voxel position encoding
//! - [`registry`]: user-facing caches for templates, materials, batches
//! - [`flatten`]: the initialization preprocessor (template sorting and
//!   flattening, capacity checks)
//! - [`family`]: family remapping, the packed contact mask, prescription and
//!   family-change compilation
//! - [`broad`]: the kT broad phase
//! - [`narrow`] / [`force`]: contact geometry and the force laws
//! - [`integrate`]: explicit time stepping
//! - [`handshake`]: the kT/dT buffer exchange and drift accounting
//! - [`inspect`]: lazy reduction queries
//! - [`output`]: clump dump writers and the CSV checkpoint loader

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_docs)]
#![allow(clippy::too_many_arguments)]

mod anomaly;
pub mod broad;
pub mod codec;
mod error;
pub mod family;
pub mod flatten;
pub mod force;
pub mod handshake;
pub mod inspect;
pub mod integrate;
pub mod margin;
pub mod narrow;
pub mod output;
pub mod registry;
pub mod solver;
mod state;
mod worker;
pub mod world;

pub use anomaly::{Anomaly, AnomalyLog};
pub use broad::{ContactKind, ContactPair};
pub use error::DemError;
pub use handshake::CollaborationStats;
pub use inspect::{Inspector, InspectorQuantity, Reduction};
pub use margin::{AdaptivePolicy, Retune};
pub use output::{read_clump_csv, ClumpRecord};
pub use registry::{ClumpBatchHandle, ClumpTemplateHandle, ExternalObjectHandle, Facet, MeshHandle};
pub use solver::{DemSolver, InitStage, TrackerHandle};

// The shared data types, re-exported so most users only import talus-core.
pub use talus_types::{
    AccumulationMode, AnalyticalKind, BoundingBoxMode, FamilyChangeRule, FamilyPair,
    FamilyPrescription, ForceModelKind, IntegratorKind, Material, NormalSign, OutputFormat,
    OutputMode, Verbosity, Warning, OUT_ABSV, OUT_ACCELERATION, OUT_ANG_VELOCITY, OUT_FAMILY,
    OUT_MATERIAL, OUT_POSITION, OUT_QUATERNION, OUT_VELOCITY, RESERVED_FAMILY,
};
