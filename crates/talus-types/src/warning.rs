//! Warning taxonomy and per-warning statistics.
//!
//! Physical anomalies are warned, counted, and kept in a small in-memory
//! ring by the engine core: never fatal. Each kind logs through `tracing`
//! on first occurrence only; later hits just bump the counter.

/// Warning kinds. `repr(u8)` for compact storage; cast to `usize` for array
/// indexing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Warning {
    /// Restitution coefficient outside `(0, 1]`.
    RestitutionRange = 0,
    /// Clump template with (near-)zero mass or inertia.
    DegenerateClump = 1,
    /// Component sphere with (near-)zero radius.
    ZeroRadius = 2,
    /// A family carries a prescription but no owner belongs to it.
    UnusedPrescribedFamily = 3,
    /// Entities assigned the reserved (fixed) family number or above.
    ReservedFamilyUse = 4,
    /// Clumps loaded without an explicit family; defaulted to family 0.
    DefaultedFamily = 5,
    /// Contact detection may lag while no safety margin is configured.
    NoExpandFactor = 6,
    /// Clump templates past the specialization budget stay in global tables.
    SpecializationBudget = 7,
    /// A mesh was added with zero triangle facets.
    EmptyMesh = 8,
}

/// Number of warning kinds.
pub const NUM_WARNINGS: usize = 9;

/// Per-warning statistics: how often, and which entity last triggered it.
#[derive(Debug, Clone, Copy, Default)]
pub struct WarningStat {
    /// Index of the entity that last triggered the warning (template,
    /// material, family: whichever the kind concerns).
    pub last_info: i64,
    /// Cumulative count since the last clear.
    pub count: u64,
}
