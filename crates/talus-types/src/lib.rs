//! Shared data types for the Talus DEM engine.
//!
//! This is the leaf crate of the workspace: index types and their width
//! ceilings, the material tuple and its tolerance-equivalence set, family
//! records (prescriptions, contact-disable pairs, conditional change rules),
//! the enums that configure solver behavior, and the warning taxonomy.
//!
//! Everything here is plain data: no threads, no kernels. The engine core
//! (`talus-core`) and the kernel-specialization pipeline (`talus-compile`)
//! both consume these types; users mostly meet them through re-exports on
//! the solver facade.

#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![warn(missing_docs)]

mod enums;
mod family;
mod ids;
mod material;
mod warning;

pub use enums::{
    AccumulationMode, AnalyticalKind, BoundingBoxMode, ForceModelKind, IntegratorKind, NormalSign,
    OutputFormat, OutputMode, SortDiscipline, Verbosity, OUT_ABSV, OUT_ACCELERATION,
    OUT_ANG_VELOCITY, OUT_FAMILY, OUT_MATERIAL, OUT_POSITION, OUT_QUATERNION, OUT_VELOCITY,
};
pub use family::{FamilyChangeRule, FamilyPair, FamilyPrescription, PrescribedChannel};
pub use ids::{
    BinId, FamilyId, MatIndex, OwnerId, VoxelId, DEFAULT_MAX_GEOMETRIES_PER_BIN, MAX_FAMILIES,
    RESERVED_FAMILY, SPECIALIZATION_COMPONENT_BUDGET, TINY, VOXEL_ID_BITS, VOXEL_RES_POWER,
};
pub use material::{Material, MaterialSet, MATERIAL_EQ_TOL};
pub use warning::{Warning, WarningStat, NUM_WARNINGS};
