//! Behavior-selecting enums and the output-content bitmask.

use serde::{Deserialize, Serialize};

/// What one row of a clump dump describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    /// One row per component sphere (larger files, less post-processing).
    Sphere,
    /// One row per owner clump (CoM-level state).
    Clump,
}

/// On-disk format of a clump dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Text, header line + one comma-separated row per entity.
    Csv,
    /// Magic header + packed binary rows.
    Binary,
    /// Accepted as a format name; maps onto the binary row layout.
    Chpf,
}

/// Output-content bit: CoM / sphere position columns.
pub const OUT_POSITION: u32 = 1;
/// Output-content bit: orientation quaternion columns.
pub const OUT_QUATERNION: u32 = 1 << 1;
/// Output-content bit: linear velocity columns.
pub const OUT_VELOCITY: u32 = 1 << 2;
/// Output-content bit: angular velocity columns.
pub const OUT_ANG_VELOCITY: u32 = 1 << 3;
/// Output-content bit: absolute velocity column.
pub const OUT_ABSV: u32 = 1 << 4;
/// Output-content bit: acceleration columns (from the last force pass).
pub const OUT_ACCELERATION: u32 = 1 << 5;
/// Output-content bit: user-level family number column.
pub const OUT_FAMILY: u32 = 1 << 6;
/// Output-content bit: material index column (sphere mode only).
pub const OUT_MATERIAL: u32 = 1 << 7;

/// Which contact force law the dynamic worker evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ForceModelKind {
    /// Hertz-Mindlin with tangential history and rolling resistance.
    FrictionalHertzian,
    /// Normal-only Hertzian; historyless.
    FrictionlessHertzian,
    /// User-supplied model text, compiled by the specialization pipeline.
    Custom,
}

/// Explicit time stepping scheme of the dynamic worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntegratorKind {
    /// Semi-implicit forward Euler: velocity first, then position with the
    /// new velocity.
    ForwardEuler,
    /// Centred difference: position advances with the half-step velocity.
    CenteredDifference,
    /// Taylor expansion including the acceleration term in the position
    /// update.
    ExtendedTaylor,
    /// Chung's scheme with its fixed weighting coefficients.
    Chung,
}

/// Analytical boundary geometry kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalyticalKind {
    /// Infinite plane; orientation given by its rotation vector.
    Plane,
    /// Finite rectangular plate; `size1 × size2` in its local frame.
    Plate,
    /// Cylinder aligned with the world Z axis.
    ZCylinder,
    /// Cylinder around an arbitrary local axis.
    Cylinder,
}

/// Which side of an analytical surface pushes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalSign {
    /// Contact normal points into the enclosed region (containers).
    Inward,
    /// Contact normal points away from the surface (obstacles).
    Outward,
}

/// Whether and how boundary planes are added around the simulation world at
/// initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoundingBoxMode {
    /// No automatic boundaries.
    None,
    /// All six planes.
    All,
    /// Five planes, leaving the +Z top open.
    TopOpen,
}

/// How per-pair force contributions land on owner accumulators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccumulationMode {
    /// Scatter each contribution onto its owners directly.
    Scatter,
    /// Sort contributions by owner, then segment-reduce.
    SortReduce,
}

/// Ordering guarantee of a published contact pair list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDiscipline {
    /// Pairs appear in bin-sweep emission order.
    #[default]
    Unsorted,
    /// Pairs sorted by (kind, a, b) so identities are stable across rounds.
    ByIdentity,
}

/// Solver chattiness, mapped onto `tracing` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Verbosity {
    /// Nothing but fatal errors.
    Quiet,
    /// Errors only.
    Error,
    /// Errors and warnings.
    Warn,
    /// Initialization reports and run summaries.
    Info,
    /// Per-step scheduling events.
    StepInfo,
    /// Everything, including kernel specialization dumps.
    Debug,
}
