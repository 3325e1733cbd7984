//! Broad-phase contact detection (the kinematic worker's kernels).
//!
//! Produces *candidate* pairs such that no true contact is missed, by
//! testing inflated bounding radii (`r + β`):
//!
//! 1. per-geometry bin overlap counting,
//! 2. exclusive prefix scan to allocate the flat bin-entry stream,
//! 3. sort by bin id,
//! 4. run-length encode into per-bin runs,
//! 5. per-bin sweep with cheap inflated overlap tests and family-mask
//!    rejection,
//! 6. optional sort of survivors so pair identities are stable for
//!    history-based force models.
//!
//! A pair is emitted by exactly one bin: the one containing an owning
//! point chosen inside both inflated bounding regions: so survivors need
//! no deduplication. Analytical geometries are not binned; every sphere
//! tests directly against each of them (their count is small).

use nalgebra::Vector3;
use rayon::prelude::*;
use talus_types::{AnalyticalKind, FamilyId, NormalSign};

use crate::error::DemError;
use crate::family::FamilyTable;
use crate::narrow;
use crate::world::BinGrid;

/// Contact pair kind. The ordering (spheres first) is also the sort order
/// of published pair lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ContactKind {
    /// Two component spheres.
    SphereSphere,
    /// A component sphere against an analytical geometry.
    SphereAnalytical,
    /// A component sphere against a mesh facet.
    SphereTriangle,
}

/// One candidate contact pair: geometry ids, not owner ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContactPair {
    /// Pair kind.
    pub kind: ContactKind,
    /// First geometry id (sphere index).
    pub a: u32,
    /// Second geometry id (sphere, analytical row, or facet index by kind).
    pub b: u32,
}

/// Broad-phase observability counters, fed to the adaptive governor.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadPhaseStats {
    /// Bin-entry stream length.
    pub n_entries: usize,
    /// Populated bin count.
    pub n_populated_bins: usize,
    /// Average geometries per populated bin.
    pub avg_geometries_per_bin: f64,
    /// Largest single-bin population.
    pub max_geometries_per_bin: usize,
    /// Candidate pairs produced.
    pub n_pairs: usize,
}

/// World-frame geometry the broad phase consumes; assembled by the
/// kinematic worker from the latest owner snapshot.
#[derive(Debug)]
pub struct BroadInput<'a> {
    /// Sphere centers, world frame.
    pub sphere_pos: &'a [Vector3<f64>],
    /// Un-inflated sphere radii.
    pub sphere_radius: &'a [f64],
    /// Owning owner per sphere.
    pub sphere_owner: &'a [u32],
    /// Facet vertices, world frame.
    pub tri_vertices: &'a [[Vector3<f64>; 3]],
    /// Owning owner per facet.
    pub tri_owner: &'a [u32],
    /// Analytical component positions, world frame.
    pub anal_pos: &'a [Vector3<f64>],
    /// Analytical orientation carriers (normal/axis), world frame.
    pub anal_dir: &'a [Vector3<f64>],
    /// Analytical kinds.
    pub anal_kind: &'a [AnalyticalKind],
    /// Analytical size scalars.
    pub anal_size1: &'a [f64],
    /// Analytical size scalars.
    pub anal_size2: &'a [f64],
    /// Analytical normal flags.
    pub anal_normal: &'a [NormalSign],
    /// Owning owner per analytical component.
    pub anal_owner: &'a [u32],
    /// Current internal family per owner.
    pub owner_family: &'a [FamilyId],
}

/// Broad-phase tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct BroadConfig {
    /// Bin grid geometry.
    pub grid: BinGrid,
    /// World origin (bin coordinates are relative to it).
    pub origin: Vector3<f64>,
    /// Safety margin β added to every bounding radius.
    pub margin: f64,
    /// Per-bin population ceiling; exceeding it aborts the cycle.
    pub max_per_bin: usize,
    /// Sort survivors by identity (required for history-based models).
    pub sort_pairs: bool,
    /// dT step stamp for error reporting.
    pub cycle: u64,
}

/// Runs the broad phase. Candidate pairs reference geometry ids; the
/// narrow phase re-checks owners, families, and exact overlap.
pub fn detect_pairs(
    cfg: &BroadConfig,
    input: &BroadInput<'_>,
    family: &FamilyTable,
) -> Result<(Vec<ContactPair>, BroadPhaseStats), DemError> {
    let ns = input.sphere_pos.len();
    let nt = input.tri_vertices.len();
    let grid = cfg.grid;
    let origin = cfg.origin;

    // ---- 1. Per-geometry bin-range overlap counts.
    let ranges: Vec<((u32, u32, u32), (u32, u32, u32))> = (0..ns + nt)
        .into_par_iter()
        .map(|g| {
            let (lo, hi) = geometry_aabb(input, g, ns, cfg.margin);
            grid.bin_range(lo - origin, hi - origin)
        })
        .collect();
    let counts: Vec<usize> = ranges
        .par_iter()
        .map(|(lo, hi)| {
            ((hi.0 - lo.0 + 1) as usize) * ((hi.1 - lo.1 + 1) as usize) * ((hi.2 - lo.2 + 1) as usize)
        })
        .collect();

    // ---- 2. Exclusive prefix scan allocates the flat entry stream.
    let mut offsets = vec![0usize; counts.len() + 1];
    for i in 0..counts.len() {
        offsets[i + 1] = offsets[i] + counts[i];
    }
    let total = offsets[counts.len()];
    let mut entries = vec![(0u64, 0u32); total];
    for g in 0..ns + nt {
        let (lo, hi) = ranges[g];
        let mut w = offsets[g];
        for bz in lo.2..=hi.2 {
            for by in lo.1..=hi.1 {
                for bx in lo.0..=hi.0 {
                    entries[w] = (grid.bin_index(bx, by, bz), g as u32);
                    w += 1;
                }
            }
        }
    }

    // ---- 3. Sort by (bin, geometry): a stable total order.
    entries.par_sort_unstable();

    // ---- 4. Run-length encode the sorted bin-id stream.
    let mut runs: Vec<(usize, usize)> = Vec::new(); // (start, len)
    let mut i = 0;
    let mut max_run = 0usize;
    while i < entries.len() {
        let bin = entries[i].0;
        let mut j = i + 1;
        while j < entries.len() && entries[j].0 == bin {
            j += 1;
        }
        let len = j - i;
        if len > 1 {
            runs.push((i, len));
        }
        if len > max_run {
            max_run = len;
        }
        if len > cfg.max_per_bin {
            return Err(DemError::BinOverflow {
                bin,
                count: len,
                max: cfg.max_per_bin,
                cycle: cfg.cycle,
            });
        }
        i = j;
    }

    // ---- 5. Per-bin sweep.
    let fam_of = |owner: u32| input.owner_family[owner as usize];
    let mut pairs: Vec<ContactPair> = runs
        .par_iter()
        .flat_map_iter(|&(start, len)| {
            let slice = &entries[start..start + len];
            let bin = slice[0].0;
            let mut local = Vec::new();
            for x in 0..len {
                for y in x + 1..len {
                    let ga = slice[x].1;
                    let gb = slice[y].1;
                    if let Some(pair) =
                        test_candidate(cfg, input, family, &fam_of, bin, ga, gb, ns)
                    {
                        local.push(pair);
                    }
                }
            }
            local.into_iter()
        })
        .collect();

    // ---- Sphere × analytical candidates (analytical geometry is not
    // binned).
    let na = input.anal_pos.len();
    if na > 0 {
        let extra: Vec<ContactPair> = (0..ns)
            .into_par_iter()
            .flat_map_iter(|s| {
                let mut local = Vec::new();
                let fam_s = fam_of(input.sphere_owner[s]);
                for a in 0..na {
                    let fam_a = fam_of(input.anal_owner[a]);
                    if input.sphere_owner[s] == input.anal_owner[a] {
                        continue;
                    }
                    if !family.allowed(fam_s, fam_a) {
                        continue;
                    }
                    if family.is_fixed(fam_s) && family.is_fixed(fam_a) {
                        continue;
                    }
                    if narrow::sphere_analytical_proximate(
                        input.sphere_pos[s],
                        input.sphere_radius[s],
                        cfg.margin,
                        input.anal_kind[a],
                        input.anal_pos[a],
                        input.anal_dir[a],
                        input.anal_size1[a],
                        input.anal_size2[a],
                        input.anal_normal[a],
                    ) {
                        local.push(ContactPair {
                            kind: ContactKind::SphereAnalytical,
                            a: s as u32,
                            b: a as u32,
                        });
                    }
                }
                local.into_iter()
            })
            .collect();
        pairs.extend(extra);
    }

    // ---- 6. Sort survivors for stable identities.
    if cfg.sort_pairs {
        pairs.par_sort_unstable();
    }

    let n_populated = runs.len();
    let stats = BroadPhaseStats {
        n_entries: total,
        n_populated_bins: n_populated,
        avg_geometries_per_bin: if n_populated == 0 {
            0.0
        } else {
            runs.iter().map(|r| r.1).sum::<usize>() as f64 / n_populated as f64
        },
        max_geometries_per_bin: max_run,
        n_pairs: pairs.len(),
    };
    Ok((pairs, stats))
}

/// Inflated AABB of geometry `g` (spheres first, then facets).
fn geometry_aabb(
    input: &BroadInput<'_>,
    g: usize,
    ns: usize,
    margin: f64,
) -> (Vector3<f64>, Vector3<f64>) {
    if g < ns {
        let c = input.sphere_pos[g];
        let r = input.sphere_radius[g] + margin;
        (c.map(|x| x - r), c.map(|x| x + r))
    } else {
        let v = &input.tri_vertices[g - ns];
        let mut lo = v[0];
        let mut hi = v[0];
        for p in &v[1..] {
            lo = lo.inf(p);
            hi = hi.sup(p);
        }
        (lo.map(|x| x - margin), hi.map(|x| x + margin))
    }
}

/// Cheap candidate test inside one bin; returns the pair when this bin owns
/// it and every rejection rule passes.
fn test_candidate(
    cfg: &BroadConfig,
    input: &BroadInput<'_>,
    family: &FamilyTable,
    fam_of: &impl Fn(u32) -> FamilyId,
    bin: u64,
    ga: u32,
    gb: u32,
    ns: usize,
) -> Option<ContactPair> {
    let (ga, gb) = if ga <= gb { (ga, gb) } else { (gb, ga) };
    let a_is_sphere = (ga as usize) < ns;
    let b_is_sphere = (gb as usize) < ns;
    match (a_is_sphere, b_is_sphere) {
        (true, true) => {
            let (sa, sb) = (ga as usize, gb as usize);
            let (oa, ob) = (input.sphere_owner[sa], input.sphere_owner[sb]);
            if oa == ob {
                return None;
            }
            let (fa, fb) = (fam_of(oa), fam_of(ob));
            if !family.allowed(fa, fb) {
                return None;
            }
            if family.is_fixed(fa) && family.is_fixed(fb) {
                return None;
            }
            let (ca, cb) = (input.sphere_pos[sa], input.sphere_pos[sb]);
            let (ra, rb) = (
                input.sphere_radius[sa] + cfg.margin,
                input.sphere_radius[sb] + cfg.margin,
            );
            let reach = ra + rb;
            let d = cb - ca;
            if d.norm_squared() > reach * reach {
                return None;
            }
            // The owning point sits on the center segment, split by the
            // inflated radii, so it lies inside both bounding regions and
            // exactly one overlapped bin claims the pair.
            let own = ca + d * (ra / reach);
            if !owns_bin(cfg, bin, own) {
                return None;
            }
            Some(ContactPair {
                kind: ContactKind::SphereSphere,
                a: ga,
                b: gb,
            })
        }
        (true, false) | (false, true) => {
            let (s, t) = if a_is_sphere {
                (ga as usize, gb as usize - ns)
            } else {
                (gb as usize, ga as usize - ns)
            };
            let (os, ot) = (input.sphere_owner[s], input.tri_owner[t]);
            if os == ot {
                return None;
            }
            let (fs, ft) = (fam_of(os), fam_of(ot));
            if !family.allowed(fs, ft) {
                return None;
            }
            if family.is_fixed(fs) && family.is_fixed(ft) {
                return None;
            }
            let v = &input.tri_vertices[t];
            let c = input.sphere_pos[s];
            let closest = narrow::closest_point_on_triangle(c, v[0], v[1], v[2]);
            let reach = input.sphere_radius[s] + 2.0 * cfg.margin;
            let dist = (closest - c).norm();
            if dist > reach {
                return None;
            }
            // Owning point: the triangle's closest point nudged toward the
            // sphere by at most the margin: inside both bounding regions.
            let own = if dist > 1e-12 {
                closest + (c - closest) * (cfg.margin.min(dist) / dist)
            } else {
                closest
            };
            if !owns_bin(cfg, bin, own) {
                return None;
            }
            Some(ContactPair {
                kind: ContactKind::SphereTriangle,
                a: s as u32,
                b: t as u32,
            })
        }
        // Facet-facet contact is not a supported pair kind.
        (false, false) => None,
    }
}

/// Single-emission rule: the pair belongs to the bin containing its owning
/// point.
#[inline]
fn owns_bin(cfg: &BroadConfig, bin: u64, point: Vector3<f64>) -> bool {
    let (bx, by, bz) = cfg.grid.bin_of(point - cfg.origin);
    cfg.grid.bin_index(bx, by, bz) == bin
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::AnomalyLog;
    use crate::codec::VoxelCodec;
    use crate::family::compile_family_table;
    use talus_compile::KernelCache;
    use talus_types::{FamilyPair, RESERVED_FAMILY};

    fn family_table(pairs: &[FamilyPair]) -> FamilyTable {
        compile_family_table(
            &[0, 1, RESERVED_FAMILY],
            &[0, 1],
            &[],
            pairs,
            &[],
            &KernelCache::new(),
            false,
            &AnomalyLog::new(),
        )
        .unwrap()
    }

    fn config(bin_size: f64) -> BroadConfig {
        let codec =
            VoxelCodec::from_box(Vector3::zeros(), Vector3::new(2.0, 2.0, 2.0)).unwrap();
        BroadConfig {
            grid: crate::world::BinGrid::derive(&codec, bin_size).unwrap(),
            origin: Vector3::zeros(),
            margin: 0.0,
            max_per_bin: 64,
            sort_pairs: true,
            cycle: 0,
        }
    }

    fn empty_anal<'a>() -> BroadInput<'a> {
        BroadInput {
            sphere_pos: &[],
            sphere_radius: &[],
            sphere_owner: &[],
            tri_vertices: &[],
            tri_owner: &[],
            anal_pos: &[],
            anal_dir: &[],
            anal_kind: &[],
            anal_size1: &[],
            anal_size2: &[],
            anal_normal: &[],
            anal_owner: &[],
            owner_family: &[],
        }
    }

    #[test]
    fn overlapping_spheres_pair_exactly_once() {
        let cfg = config(0.25);
        let pos = vec![
            Vector3::new(1.0, 1.0, 1.0),
            // Overlapping the first, and straddling a bin boundary.
            Vector3::new(1.12, 1.0, 1.0),
            // Far away.
            Vector3::new(0.2, 0.2, 0.2),
        ];
        let radius = vec![0.1, 0.1, 0.1];
        let owner = vec![0, 1, 2];
        let families = vec![0 as FamilyId, 0, 0];
        let input = BroadInput {
            sphere_pos: &pos,
            sphere_radius: &radius,
            sphere_owner: &owner,
            owner_family: &families,
            ..empty_anal()
        };
        let table = family_table(&[]);
        let (pairs, stats) = detect_pairs(&cfg, &input, &table).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0], ContactPair { kind: ContactKind::SphereSphere, a: 0, b: 1 });
        assert!(stats.n_entries > 0);
    }

    #[test]
    fn family_mask_suppresses_pairs() {
        let cfg = config(0.25);
        let pos = vec![Vector3::new(1.0, 1.0, 1.0), Vector3::new(1.1, 1.0, 1.0)];
        let radius = vec![0.1, 0.1];
        let owner = vec![0, 1];
        let table = family_table(&[FamilyPair { a: 0, b: 1 }]);
        let f0 = table.internal(0).unwrap();
        let f1 = table.internal(1).unwrap();
        let families = vec![f0, f1];
        let input = BroadInput {
            sphere_pos: &pos,
            sphere_radius: &radius,
            sphere_owner: &owner,
            owner_family: &families,
            ..empty_anal()
        };
        let (pairs, _) = detect_pairs(&cfg, &input, &table).unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn margin_finds_near_misses() {
        let mut cfg = config(0.25);
        let pos = vec![Vector3::new(1.0, 1.0, 1.0), Vector3::new(1.25, 1.0, 1.0)];
        let radius = vec![0.1, 0.1];
        let owner = vec![0, 1];
        let families = vec![0 as FamilyId, 0];
        let input = BroadInput {
            sphere_pos: &pos,
            sphere_radius: &radius,
            sphere_owner: &owner,
            owner_family: &families,
            ..empty_anal()
        };
        let table = family_table(&[]);
        let (pairs, _) = detect_pairs(&cfg, &input, &table).unwrap();
        assert!(pairs.is_empty());

        cfg.margin = 0.05;
        let (pairs, _) = detect_pairs(&cfg, &input, &table).unwrap();
        assert_eq!(pairs.len(), 1);
    }

    #[test]
    fn same_owner_spheres_never_pair() {
        let cfg = config(0.25);
        let pos = vec![Vector3::new(1.0, 1.0, 1.0), Vector3::new(1.05, 1.0, 1.0)];
        let radius = vec![0.1, 0.1];
        let owner = vec![7, 7];
        let families = vec![0 as FamilyId; 8];
        let input = BroadInput {
            sphere_pos: &pos,
            sphere_radius: &radius,
            sphere_owner: &owner,
            owner_family: &families,
            ..empty_anal()
        };
        let table = family_table(&[]);
        let (pairs, _) = detect_pairs(&cfg, &input, &table).unwrap();
        assert!(pairs.is_empty());
    }

    #[test]
    fn bin_overflow_is_fatal_with_diagnostics() {
        let mut cfg = config(0.25);
        cfg.max_per_bin = 3;
        let pos: Vec<_> = (0..8).map(|_| Vector3::new(1.0, 1.0, 1.0)).collect();
        let radius = vec![0.01; 8];
        let owner: Vec<u32> = (0..8).collect();
        let families = vec![0 as FamilyId; 8];
        let input = BroadInput {
            sphere_pos: &pos,
            sphere_radius: &radius,
            sphere_owner: &owner,
            owner_family: &families,
            ..empty_anal()
        };
        let table = family_table(&[]);
        let err = detect_pairs(&cfg, &input, &table).unwrap_err();
        assert!(matches!(err, DemError::BinOverflow { count: 8, .. }));
    }

    #[test]
    fn sphere_vs_plane_candidates_come_from_direct_tests() {
        let cfg = config(0.25);
        let pos = vec![Vector3::new(1.0, 1.0, 0.05)];
        let radius = vec![0.1];
        let owner = vec![0];
        let anal_pos = vec![Vector3::zeros()];
        let anal_dir = vec![Vector3::z()];
        let anal_kind = vec![AnalyticalKind::Plane];
        let s1 = vec![0.0];
        let s2 = vec![0.0];
        let anal_normal = vec![NormalSign::Outward];
        let anal_owner = vec![1];
        let table = family_table(&[]);
        let reserved = table.internal(RESERVED_FAMILY).unwrap();
        let families = vec![table.internal(0).unwrap(), reserved];
        let input = BroadInput {
            sphere_pos: &pos,
            sphere_radius: &radius,
            sphere_owner: &owner,
            anal_pos: &anal_pos,
            anal_dir: &anal_dir,
            anal_kind: &anal_kind,
            anal_size1: &s1,
            anal_size2: &s2,
            anal_normal: &anal_normal,
            anal_owner: &anal_owner,
            owner_family: &families,
            ..empty_anal()
        };
        let (pairs, _) = detect_pairs(&cfg, &input, &table).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].kind, ContactKind::SphereAnalytical);
    }
}
