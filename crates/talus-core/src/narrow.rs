//! Narrow-phase contact geometry.
//!
//! Exact overlap predicates per pair kind, evaluated on the *un-inflated*
//! geometry. Each returns the contact point, the unit normal (pointing from
//! body a toward body b), and the penetration depth, or `None` when there
//! is no actual overlap.

use nalgebra::Vector3;
use talus_types::{AnalyticalKind, NormalSign, TINY};

/// Geometric description of one contact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContactGeom {
    /// Contact point, world frame.
    pub point: Vector3<f64>,
    /// Unit normal, from body a toward body b.
    pub normal: Vector3<f64>,
    /// Penetration depth (positive in contact).
    pub depth: f64,
}

/// Sphere-sphere overlap.
#[must_use]
pub fn sphere_sphere(
    ca: Vector3<f64>,
    ra: f64,
    cb: Vector3<f64>,
    rb: f64,
) -> Option<ContactGeom> {
    let d = cb - ca;
    let dist = d.norm();
    let depth = ra + rb - dist;
    if depth <= 0.0 || dist <= TINY {
        return None;
    }
    let normal = d / dist;
    Some(ContactGeom {
        point: ca + normal * (ra - 0.5 * depth),
        normal,
        depth,
    })
}

/// Sphere against an infinite one-sided plane. `n` is the plane's unit
/// normal; contact exists on the side `n` points toward.
#[must_use]
pub fn sphere_plane(
    c: Vector3<f64>,
    r: f64,
    plane_point: Vector3<f64>,
    n: Vector3<f64>,
) -> Option<ContactGeom> {
    let d = (c - plane_point).dot(&n);
    let depth = r - d;
    if depth <= 0.0 || d < -r {
        return None;
    }
    Some(ContactGeom {
        point: c - n * d,
        // Normal from the sphere (body a) toward the plane (body b).
        normal: -n,
        depth,
    })
}

/// Sphere against a finite rectangular plate centered at `center` with unit
/// normal `n` and half-extents `(hu, hv)` along an orthonormal in-plane
/// basis derived from `n`.
#[must_use]
pub fn sphere_plate(
    c: Vector3<f64>,
    r: f64,
    center: Vector3<f64>,
    n: Vector3<f64>,
    hu: f64,
    hv: f64,
) -> Option<ContactGeom> {
    let (u, v) = plane_basis(n);
    let rel = c - center;
    let pu = rel.dot(&u).clamp(-hu, hu);
    let pv = rel.dot(&v).clamp(-hv, hv);
    let closest = center + u * pu + v * pv;
    let d = c - closest;
    let dist = d.norm();
    let depth = r - dist;
    if depth <= 0.0 || dist <= TINY {
        return None;
    }
    let normal = -(d / dist);
    Some(ContactGeom {
        point: closest,
        normal,
        depth,
    })
}

/// Sphere against a cylinder around `axis` through `axis_point`, radius
/// `rad`, half-length `half_len` (`0` = unbounded). `Inward` means the
/// cylinder is a container pushing enclosed spheres away from its wall.
#[must_use]
pub fn sphere_cylinder(
    c: Vector3<f64>,
    r: f64,
    axis_point: Vector3<f64>,
    axis: Vector3<f64>,
    rad: f64,
    half_len: f64,
    sign: NormalSign,
) -> Option<ContactGeom> {
    let rel = c - axis_point;
    let along = rel.dot(&axis);
    if half_len > 0.0 && along.abs() > half_len + r {
        return None;
    }
    let radial = rel - axis * along;
    let dist = radial.norm();
    if dist <= TINY {
        return None;
    }
    let radial_dir = radial / dist;
    match sign {
        NormalSign::Inward => {
            // Container: contact when the sphere reaches the wall from
            // inside.
            let depth = r - (rad - dist);
            if depth <= 0.0 || dist > rad {
                return None;
            }
            Some(ContactGeom {
                point: axis_point + axis * along + radial_dir * rad,
                normal: radial_dir,
                depth,
            })
        }
        NormalSign::Outward => {
            // Solid cylinder: contact when the sphere touches it from
            // outside.
            let depth = r - (dist - rad);
            if depth <= 0.0 || dist < rad {
                return None;
            }
            Some(ContactGeom {
                point: axis_point + axis * along + radial_dir * rad,
                normal: -radial_dir,
                depth,
            })
        }
    }
}

/// Sphere against a triangle (one-sided contact is not assumed; the normal
/// takes the side the sphere center is on).
#[must_use]
pub fn sphere_triangle(
    c: Vector3<f64>,
    r: f64,
    v0: Vector3<f64>,
    v1: Vector3<f64>,
    v2: Vector3<f64>,
) -> Option<ContactGeom> {
    let closest = closest_point_on_triangle(c, v0, v1, v2);
    let d = c - closest;
    let dist = d.norm();
    let depth = r - dist;
    if depth <= 0.0 || dist <= TINY {
        return None;
    }
    Some(ContactGeom {
        point: closest,
        normal: -(d / dist),
        depth,
    })
}

/// Closest point on triangle `(a, b, c)` to point `p`: Voronoi-region
/// walk over vertices, edges, and face.
#[must_use]
pub fn closest_point_on_triangle(
    p: Vector3<f64>,
    a: Vector3<f64>,
    b: Vector3<f64>,
    c: Vector3<f64>,
) -> Vector3<f64> {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;

    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let t = d1 / (d1 - d3);
        return a + ab * t;
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let t = d2 / (d2 - d6);
        return a + ac * t;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let t = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * t;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

/// Generic analytical dispatch used by the narrow phase; geometry inputs
/// are already in world frame.
#[must_use]
pub fn sphere_analytical(
    c: Vector3<f64>,
    r: f64,
    kind: AnalyticalKind,
    comp_pos: Vector3<f64>,
    comp_dir: Vector3<f64>,
    size1: f64,
    size2: f64,
    sign: NormalSign,
) -> Option<ContactGeom> {
    match kind {
        AnalyticalKind::Plane => sphere_plane(c, r, comp_pos, comp_dir),
        AnalyticalKind::Plate => sphere_plate(c, r, comp_pos, comp_dir, size1, size2),
        AnalyticalKind::ZCylinder => sphere_cylinder(
            c,
            r,
            comp_pos,
            Vector3::z(),
            size1,
            size2,
            sign,
        ),
        AnalyticalKind::Cylinder => sphere_cylinder(c, r, comp_pos, comp_dir, size1, size2, sign),
    }
}

/// A cheap inflated proximity test used by the broad phase: whether the
/// sphere inflated by `margin` could touch the analytical surface.
#[must_use]
pub fn sphere_analytical_proximate(
    c: Vector3<f64>,
    r: f64,
    margin: f64,
    kind: AnalyticalKind,
    comp_pos: Vector3<f64>,
    comp_dir: Vector3<f64>,
    size1: f64,
    size2: f64,
    sign: NormalSign,
) -> bool {
    let r = r + margin;
    match kind {
        AnalyticalKind::Plane => (c - comp_pos).dot(&comp_dir) <= r,
        AnalyticalKind::Plate => {
            let (u, v) = plane_basis(comp_dir);
            let rel = c - comp_pos;
            rel.dot(&comp_dir).abs() <= r
                && rel.dot(&u).abs() <= size1 + r
                && rel.dot(&v).abs() <= size2 + r
        }
        AnalyticalKind::ZCylinder | AnalyticalKind::Cylinder => {
            let axis = if kind == AnalyticalKind::ZCylinder {
                Vector3::z()
            } else {
                comp_dir
            };
            let rel = c - comp_pos;
            let along = rel.dot(&axis);
            if size2 > 0.0 && along.abs() > size2 + r {
                return false;
            }
            let dist = (rel - axis * along).norm();
            match sign {
                NormalSign::Inward => dist >= size1 - r,
                NormalSign::Outward => dist <= size1 + r,
            }
        }
    }
}

/// Deterministic orthonormal basis of the plane orthogonal to unit `n`.
#[must_use]
pub fn plane_basis(n: Vector3<f64>) -> (Vector3<f64>, Vector3<f64>) {
    let pick = if n.x.abs() < 0.9 {
        Vector3::x()
    } else {
        Vector3::y()
    };
    let u = n.cross(&pick).normalize();
    let v = n.cross(&u);
    (u, v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn sphere_sphere_overlap_geometry() {
        let g = sphere_sphere(
            Vector3::zeros(),
            0.1,
            Vector3::new(0.15, 0.0, 0.0),
            0.1,
        )
        .unwrap();
        assert_relative_eq!(g.depth, 0.05, epsilon = 1e-12);
        assert_relative_eq!(g.normal.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(g.point.x, 0.075, epsilon = 1e-12);
        assert!(sphere_sphere(Vector3::zeros(), 0.1, Vector3::new(0.3, 0.0, 0.0), 0.1).is_none());
    }

    #[test]
    fn sphere_plane_contact_is_one_sided() {
        let g = sphere_plane(
            Vector3::new(0.0, 0.0, 0.05),
            0.1,
            Vector3::zeros(),
            Vector3::z(),
        )
        .unwrap();
        assert_relative_eq!(g.depth, 0.05, epsilon = 1e-12);
        assert_relative_eq!(g.normal.z, -1.0, epsilon = 1e-12);
        // Deep below the plane: no contact reported.
        assert!(sphere_plane(
            Vector3::new(0.0, 0.0, -0.5),
            0.1,
            Vector3::zeros(),
            Vector3::z()
        )
        .is_none());
    }

    #[test]
    fn sphere_triangle_face_contact() {
        let g = sphere_triangle(
            Vector3::new(0.25, 0.25, 0.05),
            0.1,
            Vector3::zeros(),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        )
        .unwrap();
        assert_relative_eq!(g.depth, 0.05, epsilon = 1e-12);
        assert_relative_eq!(g.point.z, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn closest_point_hits_vertices_edges_face() {
        let a = Vector3::zeros();
        let b = Vector3::new(1.0, 0.0, 0.0);
        let c = Vector3::new(0.0, 1.0, 0.0);
        assert_relative_eq!(
            (closest_point_on_triangle(Vector3::new(-1.0, -1.0, 0.0), a, b, c) - a).norm(),
            0.0
        );
        assert_relative_eq!(
            (closest_point_on_triangle(Vector3::new(0.5, -1.0, 0.0), a, b, c)
                - Vector3::new(0.5, 0.0, 0.0))
            .norm(),
            0.0,
            epsilon = 1e-12
        );
        assert_relative_eq!(
            (closest_point_on_triangle(Vector3::new(0.25, 0.25, 1.0), a, b, c)
                - Vector3::new(0.25, 0.25, 0.0))
            .norm(),
            0.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn inward_cylinder_contains_spheres() {
        // Sphere near the wall of a radius-1 container.
        let g = sphere_cylinder(
            Vector3::new(0.95, 0.0, 0.0),
            0.1,
            Vector3::zeros(),
            Vector3::z(),
            1.0,
            0.0,
            NormalSign::Inward,
        )
        .unwrap();
        assert!(g.depth > 0.0);
        assert_relative_eq!(g.normal.x, 1.0, epsilon = 1e-12);
        // Sphere in the middle: free.
        assert!(sphere_cylinder(
            Vector3::zeros() + Vector3::new(0.2, 0.0, 0.0),
            0.1,
            Vector3::zeros(),
            Vector3::z(),
            1.0,
            0.0,
            NormalSign::Inward
        )
        .is_none());
    }
}
