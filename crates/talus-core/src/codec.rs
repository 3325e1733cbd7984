//! Voxel + sub-voxel position encoding.
//!
//! Owner CoM positions are stored as an integer voxel index packed into a
//! single 64-bit id plus a floating sub-voxel offset in `[0, voxel_edge)`
//! per axis. Splitting the position this way keeps precision uniform across
//! arbitrarily large worlds and lets the broad phase bin with pure integer
//! arithmetic. A position decomposes exactly as
//! `world = origin + voxel_index * voxel_edge + sub_voxel_offset`.

use nalgebra::Vector3;
use talus_types::{VoxelId, VOXEL_ID_BITS, VOXEL_RES_POWER};

use crate::error::DemError;

/// The position codec: world origin, voxel edge, and per-axis voxel-count
/// powers (the three powers sum to the voxel-id width).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoxelCodec {
    /// World origin: the left-bottom-front corner of the domain.
    pub origin: Vector3<f64>,
    /// Edge length of one voxel: `2^VOXEL_RES_POWER * l`.
    pub voxel_edge: f64,
    /// Per-axis voxel counts, as powers of two.
    pub nv: (u32, u32, u32),
}

impl VoxelCodec {
    /// Builds a codec from explicit per-axis powers and the base length
    /// unit `l`. The powers must sum to the voxel-id bit width.
    pub fn from_powers(
        origin: Vector3<f64>,
        nv: (u32, u32, u32),
        l: f64,
    ) -> Result<Self, DemError> {
        if nv.0 + nv.1 + nv.2 != VOXEL_ID_BITS {
            return Err(DemError::config(format!(
                "voxel counts (as powers of 2) along each direction must add up to {VOXEL_ID_BITS}, got {} + {} + {}",
                nv.0, nv.1, nv.2
            )));
        }
        if l <= 0.0 {
            return Err(DemError::config(format!(
                "base length unit must be positive, got {l}"
            )));
        }
        Ok(Self {
            origin,
            voxel_edge: f64::from(1u32 << VOXEL_RES_POWER) * l,
            nv,
        })
    }

    /// Derives per-axis powers and the base length unit from the user's box
    /// dimensions: bits are handed out greedily to the axis whose coverage
    /// ratio is worst, then `l` is the smallest unit whose voxel lattice
    /// still covers the box.
    pub fn from_box(origin: Vector3<f64>, dims: Vector3<f64>) -> Result<Self, DemError> {
        if dims.x <= 0.0 || dims.y <= 0.0 || dims.z <= 0.0 {
            return Err(DemError::config(format!(
                "the simulation world is {} by {} by {}; it is impossibly small",
                dims.x, dims.y, dims.z
            )));
        }
        let mut p = [0u32; 3];
        let d = [dims.x, dims.y, dims.z];
        for _ in 0..VOXEL_ID_BITS {
            // Next bit goes to the axis with the largest per-voxel extent.
            let mut worst = 0;
            for i in 1..3 {
                if d[i] / exp2(p[i]) > d[worst] / exp2(p[worst]) {
                    worst = i;
                }
            }
            p[worst] += 1;
        }
        let mut l = 0.0f64;
        for i in 0..3 {
            l = l.max(d[i] / (exp2(p[i]) * exp2(VOXEL_RES_POWER)));
        }
        Self::from_powers(origin, (p[0], p[1], p[2]), l)
    }

    /// The base length unit `l` this codec was built with.
    #[must_use]
    pub fn length_unit(&self) -> f64 {
        self.voxel_edge / exp2(VOXEL_RES_POWER)
    }

    /// Extent the voxel lattice can address along each axis.
    #[must_use]
    pub fn coverage(&self) -> Vector3<f64> {
        Vector3::new(
            exp2(self.nv.0) * self.voxel_edge,
            exp2(self.nv.1) * self.voxel_edge,
            exp2(self.nv.2) * self.voxel_edge,
        )
    }

    /// Encodes a world position into (packed voxel id, sub-voxel offset).
    /// Positions outside the lattice clamp to its boundary.
    #[must_use]
    pub fn encode(&self, world: Vector3<f64>) -> (VoxelId, Vector3<f64>) {
        let rel = world - self.origin;
        let mut idx = [0u64; 3];
        let mut sub = Vector3::zeros();
        let caps = [self.nv.0, self.nv.1, self.nv.2];
        for axis in 0..3 {
            let cap = (1u64 << caps[axis]) - 1;
            let i = (rel[axis] / self.voxel_edge).floor();
            let i = if i < 0.0 { 0 } else { (i as u64).min(cap) };
            idx[axis] = i;
            sub[axis] = (rel[axis] - i as f64 * self.voxel_edge).clamp(0.0, self.voxel_edge);
        }
        (self.pack(idx[0], idx[1], idx[2]), sub)
    }

    /// Decodes (packed voxel id, sub-voxel offset) back to a world position.
    #[must_use]
    pub fn decode(&self, voxel: VoxelId, sub: Vector3<f64>) -> Vector3<f64> {
        let (ix, iy, iz) = self.unpack(voxel);
        self.origin
            + Vector3::new(
                ix as f64 * self.voxel_edge + sub.x,
                iy as f64 * self.voxel_edge + sub.y,
                iz as f64 * self.voxel_edge + sub.z,
            )
    }

    /// Packs per-axis voxel indices: X in the low bits, then Y, then Z.
    #[must_use]
    pub fn pack(&self, ix: u64, iy: u64, iz: u64) -> VoxelId {
        ix | (iy << self.nv.0) | (iz << (self.nv.0 + self.nv.1))
    }

    /// Unpacks a voxel id into per-axis indices.
    #[must_use]
    pub fn unpack(&self, voxel: VoxelId) -> (u64, u64, u64) {
        let mx = (1u64 << self.nv.0) - 1;
        let my = (1u64 << self.nv.1) - 1;
        (
            voxel & mx,
            (voxel >> self.nv.0) & my,
            voxel >> (self.nv.0 + self.nv.1),
        )
    }
}

#[inline]
fn exp2(p: u32) -> f64 {
    f64::from(p).exp2()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn round_trip_within_length_unit() {
        let codec =
            VoxelCodec::from_box(Vector3::new(-0.5, -0.5, 0.0), Vector3::new(1.0, 1.0, 2.0))
                .unwrap();
        let l = codec.length_unit();
        for p in [
            Vector3::new(0.0, 0.0, 0.1),
            Vector3::new(0.49, -0.49, 1.99),
            Vector3::new(-0.5, -0.5, 0.0),
            Vector3::new(0.123_456_789, 0.4, 1.0),
        ] {
            let (voxel, sub) = codec.encode(p);
            let back = codec.decode(voxel, sub);
            for axis in 0..3 {
                assert!(
                    (back[axis] - p[axis]).abs() <= l,
                    "axis {axis}: {} vs {}",
                    back[axis],
                    p[axis]
                );
                assert!(sub[axis] >= 0.0 && sub[axis] <= codec.voxel_edge);
            }
        }
    }

    #[test]
    fn derived_powers_sum_to_id_width_and_cover_the_box() {
        let dims = Vector3::new(3.0, 1.0, 20.0);
        let codec = VoxelCodec::from_box(Vector3::zeros(), dims).unwrap();
        assert_eq!(codec.nv.0 + codec.nv.1 + codec.nv.2, VOXEL_ID_BITS);
        let cov = codec.coverage();
        for axis in 0..3 {
            assert!(cov[axis] >= dims[axis]);
        }
        // The skewed axis gets more bits.
        assert!(codec.nv.2 > codec.nv.1);
    }

    #[test]
    fn explicit_powers_must_sum_to_width() {
        let bad = VoxelCodec::from_powers(Vector3::zeros(), (21, 21, 21), 1e-10);
        assert!(bad.is_err());
        let good = VoxelCodec::from_powers(Vector3::zeros(), (21, 21, 22), 1e-10);
        assert!(good.is_ok());
    }

    #[test]
    fn pack_unpack_is_identity() {
        let codec = VoxelCodec::from_powers(Vector3::zeros(), (21, 21, 22), 1e-10).unwrap();
        let id = codec.pack(123_456, 7, (1 << 22) - 1);
        assert_eq!(codec.unpack(id), (123_456, 7, (1 << 22) - 1));
    }

    #[test]
    fn out_of_box_positions_clamp() {
        let codec =
            VoxelCodec::from_box(Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0)).unwrap();
        let (voxel, sub) = codec.encode(Vector3::new(-5.0, 0.5, 0.5));
        let back = codec.decode(voxel, sub);
        assert_relative_eq!(back.x, 0.0, epsilon = 1e-12);
    }
}
