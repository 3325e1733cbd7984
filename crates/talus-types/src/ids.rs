//! Index types and the width ceilings the preprocessor checks against.
//!
//! The engine addresses large populations through compact integer ids; each
//! id has a fixed width, and the initialization preprocessor errors out with
//! a remediation hint when a derived count would overflow its type. Widening
//! a type here (and recompiling) is the documented remedy.

/// Identifies a rigid body (owner). One owner groups all geometries of a
/// single body: a clump, an analytical object, or a mesh.
pub type OwnerId = u32;

/// Identifies a spatial bin used by broad-phase contact detection.
pub type BinId = u32;

/// Packed voxel index: three per-axis voxel coordinates packed into one
/// integer, low bits = X, middle = Y, high = Z.
pub type VoxelId = u64;

/// Index into the canonical material table.
pub type MatIndex = u32;

/// Internal (remapped, dense, 0-based) family tag stored on owners.
pub type FamilyId = u8;

/// Total bits in [`VoxelId`]. The per-axis voxel-count powers must sum to
/// exactly this when the user sets them explicitly.
pub const VOXEL_ID_BITS: u32 = VoxelId::BITS;

/// A voxel edge is `2^VOXEL_RES_POWER` base length units: sub-voxel offsets
/// keep this many bits of precision below the voxel lattice.
pub const VOXEL_RES_POWER: u32 = 16;

/// Number of distinct internal families the [`FamilyId`] width can address.
pub const MAX_FAMILIES: usize = FamilyId::MAX as usize + 1;

/// The user-level family number reserved for completely fixed bodies.
/// Assigning it to ordinary simulation entities makes them fixed too.
pub const RESERVED_FAMILY: u32 = 255;

/// Upper bound on the total component count across clump templates that the
/// specialization pipeline will inline; templates past this budget stay in
/// worker global tables and are fetched at run time.
pub const SPECIALIZATION_COMPONENT_BUDGET: usize = 512;

/// Default ceiling on geometries binned into a single broad-phase cell.
/// Exceeding it aborts the cycle rather than silently corrupting the sweep.
pub const DEFAULT_MAX_GEOMETRIES_PER_BIN: usize = 768;

/// Smallest quantity treated as meaningfully non-zero in user input checks.
pub const TINY: f64 = 1e-12;
