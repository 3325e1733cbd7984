//! World geometry: the simulation box, the voxel lattice, and the bin grid.

use nalgebra::Vector3;
use talus_types::BinId;

use crate::codec::VoxelCodec;
use crate::error::DemError;

/// Immutable world parameters, fixed at initialization and shared read-only
/// by both workers.
#[derive(Debug, Clone, Copy)]
pub struct WorldParams {
    /// Position codec (origin, voxel edge, axis powers).
    pub codec: VoxelCodec,
    /// User-requested box dimensions.
    pub dims: Vector3<f64>,
    /// Gravitational acceleration.
    pub gravity: Vector3<f64>,
    /// Constant time step size.
    pub dt: f64,
}

/// Bin-grid geometry. kT owns a mutable copy: the adaptive governor may
/// re-derive it between broad-phase rounds; the voxel lattice never changes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinGrid {
    /// Bin edge length.
    pub bin_size: f64,
    /// Bin counts along each axis.
    pub nb: (u32, u32, u32),
    /// Total bin count.
    pub num_bins: u64,
}

impl BinGrid {
    /// Derives the grid for `bin_size` over the codec's voxel lattice:
    /// `⌈voxel_edge * 2^nv / bin_size⌉` bins per axis. Errors when the bin
    /// count no longer fits the bin-id width.
    pub fn derive(codec: &VoxelCodec, bin_size: f64) -> Result<Self, DemError> {
        if bin_size <= 0.0 {
            return Err(DemError::config(format!(
                "bin size must be positive, got {bin_size}"
            )));
        }
        let cov = codec.coverage();
        let nb = (
            axis_bins(cov.x, bin_size),
            axis_bins(cov.y, bin_size),
            axis_bins(cov.z, bin_size),
        );
        let num_bins = u128::from(nb.0) * u128::from(nb.1) * u128::from(nb.2);
        if num_bins > u128::from(BinId::MAX) {
            return Err(DemError::Capacity {
                what: "bin",
                count: usize::try_from(num_bins).unwrap_or(usize::MAX),
                max: BinId::MAX as usize,
                hint: "make bins larger via set_bin_size, or widen the bin-id type",
            });
        }
        let num_bins = num_bins as u64;
        Ok(Self {
            bin_size,
            nb,
            num_bins,
        })
    }

    /// Linearizes a 3-D bin index.
    #[inline]
    #[must_use]
    pub fn bin_index(&self, bx: u32, by: u32, bz: u32) -> u64 {
        u64::from(bx) + u64::from(self.nb.0) * (u64::from(by) + u64::from(self.nb.1) * u64::from(bz))
    }

    /// The bin containing a world-space point (relative to the codec
    /// origin), clamped into the grid.
    #[inline]
    #[must_use]
    pub fn bin_of(&self, rel: Vector3<f64>) -> (u32, u32, u32) {
        (
            clamp_axis(rel.x / self.bin_size, self.nb.0),
            clamp_axis(rel.y / self.bin_size, self.nb.1),
            clamp_axis(rel.z / self.bin_size, self.nb.2),
        )
    }

    /// The inclusive bin range covered by an axis-aligned box (already
    /// relative to the codec origin).
    #[must_use]
    pub fn bin_range(&self, lo: Vector3<f64>, hi: Vector3<f64>) -> ((u32, u32, u32), (u32, u32, u32)) {
        (self.bin_of(lo), self.bin_of(hi))
    }
}

#[inline]
fn axis_bins(coverage: f64, bin_size: f64) -> u32 {
    let n = (coverage / bin_size).ceil();
    if n < 1.0 {
        1
    } else if n >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        n as u32
    }
}

#[inline]
fn clamp_axis(x: f64, n: u32) -> u32 {
    if x < 0.0 {
        0
    } else {
        (x as u32).min(n.saturating_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> VoxelCodec {
        VoxelCodec::from_box(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0)).unwrap()
    }

    #[test]
    fn grid_covers_the_lattice() {
        let c = codec();
        let grid = BinGrid::derive(&c, 0.05).unwrap();
        let cov = c.coverage();
        assert!(f64::from(grid.nb.0) * grid.bin_size >= cov.x);
        assert!(f64::from(grid.nb.2) * grid.bin_size >= cov.z);
    }

    #[test]
    fn bin_of_clamps_to_grid() {
        let c = codec();
        let grid = BinGrid::derive(&c, 0.25).unwrap();
        let (bx, _, _) = grid.bin_of(Vector3::new(-1.0, 0.0, 0.0));
        assert_eq!(bx, 0);
        let far = c.coverage().x * 2.0;
        let (bx, _, _) = grid.bin_of(Vector3::new(far, 0.0, 0.0));
        assert_eq!(bx, grid.nb.0 - 1);
    }

    #[test]
    fn zero_bin_size_is_fatal() {
        assert!(BinGrid::derive(&codec(), 0.0).is_err());
    }

    #[test]
    fn bin_count_overflow_is_a_capacity_error() {
        // A bin size tiny enough to overflow the 32-bit bin-id width.
        let err = BinGrid::derive(&codec(), 1e-9).unwrap_err();
        assert!(matches!(err, DemError::Capacity { what: "bin", .. }));
    }
}
