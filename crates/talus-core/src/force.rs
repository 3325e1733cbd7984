//! Contact force evaluation: material-pair combination, the built-in
//! Hertzian laws, and the compiled custom-model path.
//!
//! The frictional law is Hertz-Mindlin: nonlinear normal stiffness in
//! penetration with restitution-linked damping, a tangential spring on the
//! accumulated slip history capped by Coulomb friction, and a rolling
//! resistance torque. The frictionless law keeps only the normal terms and
//! carries no history.

use std::sync::Arc;

use nalgebra::Vector3;
use talus_compile::{Program, Scope};
use talus_types::TINY;

/// Combined (effective) material properties of one contact pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaterialPair {
    /// Effective Young's modulus `E*`.
    pub e_star: f64,
    /// Effective shear modulus `G*`.
    pub g_star: f64,
    /// Combined restitution.
    pub cor: f64,
    /// Combined sliding friction.
    pub mu: f64,
    /// Combined rolling resistance.
    pub crr: f64,
}

/// Combines two materials' properties into the pair's effective tuple:
/// `1/E* = (1-ν₁²)/E₁ + (1-ν₂²)/E₂`, shear analogously, and the scalar
/// coefficients by averaging.
#[must_use]
pub fn combine_materials(
    e1: f64,
    nu1: f64,
    cor1: f64,
    mu1: f64,
    crr1: f64,
    e2: f64,
    nu2: f64,
    cor2: f64,
    mu2: f64,
    crr2: f64,
) -> MaterialPair {
    let inv_e = (1.0 - nu1 * nu1) / e1 + (1.0 - nu2 * nu2) / e2;
    let g1 = e1 / (2.0 * (1.0 + nu1));
    let g2 = e2 / (2.0 * (1.0 + nu2));
    let inv_g = (2.0 - nu1) / g1 + (2.0 - nu2) / g2;
    MaterialPair {
        e_star: 1.0 / inv_e,
        g_star: 1.0 / inv_g,
        cor: 0.5 * (cor1 + cor2),
        mu: 0.5 * (mu1 + mu2),
        crr: 0.5 * (crr1 + crr2),
    }
}

/// Restitution-linked damping ratio: `β = ln e / sqrt(ln²e + π²)`, negative
/// for dissipation. A (clamped) tiny restitution stands in for zero.
#[must_use]
pub fn damping_beta(cor: f64) -> f64 {
    let e = cor.clamp(1e-6, 1.0);
    let ln_e = e.ln();
    ln_e / (ln_e * ln_e + std::f64::consts::PI * std::f64::consts::PI).sqrt()
}

/// Inputs to one pairwise force evaluation, all in world frame.
#[derive(Debug, Clone, Copy)]
pub struct ContactInput {
    /// Penetration depth.
    pub depth: f64,
    /// Unit normal from body a toward body b.
    pub normal: Vector3<f64>,
    /// Relative velocity of the contact material points (a relative to b).
    pub rel_vel: Vector3<f64>,
    /// Effective contact radius `R* = ra rb / (ra + rb)` (or the sphere
    /// radius against boundaries).
    pub r_eff: f64,
    /// Effective mass `m* = ma mb / (ma + mb)` (or the sphere's own mass
    /// against fixed boundaries).
    pub m_eff: f64,
    /// Combined materials.
    pub mat: MaterialPair,
    /// Time step (advances tangential history).
    pub dt: f64,
    /// Tangential slip history carried from the previous step.
    pub history: Vector3<f64>,
}

/// One pairwise force evaluation result.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContactOutput {
    /// Force on body a (body b receives the negation).
    pub force: Vector3<f64>,
    /// Rolling-resistance torque on body a, world frame.
    pub torque_a: Vector3<f64>,
    /// Rolling-resistance torque on body b, world frame.
    pub torque_b: Vector3<f64>,
    /// Updated tangential history (zero when the model is historyless).
    pub history: Vector3<f64>,
}

/// Normal-only Hertzian law.
#[must_use]
pub fn hertz_frictionless(input: &ContactInput) -> ContactOutput {
    let ContactInput {
        depth,
        normal,
        rel_vel,
        r_eff,
        m_eff,
        mat,
        ..
    } = *input;
    let sqrt_r_delta = (r_eff * depth).max(0.0).sqrt();
    let k_n = (4.0 / 3.0) * mat.e_star * sqrt_r_delta;
    let beta = damping_beta(mat.cor);
    let s_n = 2.0 * mat.e_star * sqrt_r_delta;
    let c_n = -2.0 * (5.0f64 / 6.0).sqrt() * beta * (s_n * m_eff).max(0.0).sqrt();

    // Approach speed along the normal: positive when a moves toward b.
    let v_n = rel_vel.dot(&normal);
    let f_n = k_n * depth + c_n * v_n;
    // The normal force pushes a away from b, i.e. along -normal.
    ContactOutput {
        force: -normal * f_n.max(0.0),
        ..Default::default()
    }
}

/// Frictional Hertz-Mindlin law with tangential history and rolling
/// resistance.
#[must_use]
pub fn hertz_mindlin(input: &ContactInput, ang_vel_rel: Vector3<f64>) -> ContactOutput {
    let base = hertz_frictionless(input);
    let f_n_mag = base.force.norm();
    let ContactInput {
        depth,
        normal,
        rel_vel,
        r_eff,
        m_eff,
        mat,
        dt,
        history,
    } = *input;

    // Tangential relative velocity and advanced slip history, projected
    // back into the current tangent plane.
    let v_t = rel_vel - normal * rel_vel.dot(&normal);
    let mut delta_t = history + v_t * dt;
    delta_t -= normal * delta_t.dot(&normal);

    let sqrt_r_delta = (r_eff * depth).max(0.0).sqrt();
    let k_t = 8.0 * mat.g_star * sqrt_r_delta;
    let beta = damping_beta(mat.cor);
    let c_t = -2.0 * (5.0f64 / 6.0).sqrt() * beta * (k_t * m_eff).max(0.0).sqrt();

    // Tangential spring on the accumulated slip, plus a dashpot.
    let mut f_t = -(delta_t * k_t) - v_t * c_t;

    // Coulomb cap: slip beyond the cone truncates the spring history so the
    // stored stretch stays consistent with the force actually applied.
    let cap = mat.mu * f_n_mag;
    let f_t_mag = f_t.norm();
    if f_t_mag > cap && f_t_mag > TINY {
        f_t *= cap / f_t_mag;
        if k_t > TINY {
            delta_t = -(f_t / k_t);
        }
    }

    // Rolling resistance: a torque opposing the relative rotation.
    let mut torque_a = Vector3::zeros();
    let mut torque_b = Vector3::zeros();
    let w_rel = ang_vel_rel;
    let w_mag = w_rel.norm();
    if mat.crr > 0.0 && w_mag > TINY {
        let t_roll = -(w_rel / w_mag) * (mat.crr * f_n_mag * r_eff);
        torque_a = t_roll;
        torque_b = -t_roll;
    }

    ContactOutput {
        force: base.force + f_t,
        torque_a,
        torque_b,
        history: delta_t,
    }
}

/// Evaluates a user-compiled force model. The program reads the bound
/// contact locals and writes `forceX/Y/Z`; it may carry history through
/// `hisX/Y/Z`.
pub fn custom_force(
    program: &Arc<Program>,
    input: &ContactInput,
) -> Result<ContactOutput, talus_compile::CompileError> {
    let mut scope = Scope::new();
    let v_n = input.rel_vel.dot(&input.normal);
    let v_t = input.rel_vel - input.normal * v_n;
    scope.set("overlap", input.depth);
    scope.set("dt", input.dt);
    scope.set("normalX", input.normal.x);
    scope.set("normalY", input.normal.y);
    scope.set("normalZ", input.normal.z);
    scope.set("velNormal", v_n);
    scope.set("velTanX", v_t.x);
    scope.set("velTanY", v_t.y);
    scope.set("velTanZ", v_t.z);
    scope.set("EStar", input.mat.e_star);
    scope.set("GStar", input.mat.g_star);
    scope.set("RStar", input.r_eff);
    scope.set("mStar", input.m_eff);
    scope.set("CoR", input.mat.cor);
    scope.set("mu", input.mat.mu);
    scope.set("Crr", input.mat.crr);
    scope.set("hisX", input.history.x);
    scope.set("hisY", input.history.y);
    scope.set("hisZ", input.history.z);
    scope.set("forceX", 0.0);
    scope.set("forceY", 0.0);
    scope.set("forceZ", 0.0);
    program.run(&mut scope)?;
    let get = |k: &str| scope.get(k).unwrap_or(0.0);
    Ok(ContactOutput {
        force: Vector3::new(get("forceX"), get("forceY"), get("forceZ")),
        torque_a: Vector3::zeros(),
        torque_b: Vector3::zeros(),
        history: Vector3::new(get("hisX"), get("hisY"), get("hisZ")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn pair() -> MaterialPair {
        combine_materials(
            1e7, 0.3, 1.0, 0.5, 0.0, //
            1e7, 0.3, 1.0, 0.5, 0.0,
        )
    }

    #[test]
    fn effective_modulus_of_identical_materials() {
        let p = pair();
        // 1/E* = 2 (1-ν²)/E  →  E* = E / (2 (1-ν²))
        assert_relative_eq!(p.e_star, 1e7 / (2.0 * (1.0 - 0.09)), epsilon = 1.0);
    }

    #[test]
    fn restitution_one_means_no_normal_damping() {
        assert_relative_eq!(damping_beta(1.0), 0.0, epsilon = 1e-12);
        assert!(damping_beta(0.5) < 0.0);
    }

    #[test]
    fn normal_force_pushes_bodies_apart() {
        let input = ContactInput {
            depth: 1e-4,
            normal: Vector3::x(),
            rel_vel: Vector3::new(1.0, 0.0, 0.0),
            r_eff: 0.05,
            m_eff: 0.5,
            mat: pair(),
            dt: 1e-5,
            history: Vector3::zeros(),
        };
        let out = hertz_frictionless(&input);
        // Normal points a→b, so the force on a is along -x.
        assert!(out.force.x < 0.0);
        assert_relative_eq!(out.force.y, 0.0);
    }

    #[test]
    fn tangential_force_is_coulomb_capped() {
        let mut mat = pair();
        mat.mu = 0.2;
        mat.cor = 0.8;
        let input = ContactInput {
            depth: 1e-4,
            normal: Vector3::x(),
            rel_vel: Vector3::new(0.0, 10.0, 0.0),
            r_eff: 0.05,
            m_eff: 0.5,
            mat,
            dt: 1e-3,
            history: Vector3::new(0.0, 1e-3, 0.0),
        };
        let out = hertz_mindlin(&input, Vector3::zeros());
        let f_n = (out.force.dot(&input.normal) * input.normal).norm();
        let f_t = (out.force - input.normal * out.force.dot(&input.normal)).norm();
        assert!(f_t <= mat.mu * f_n + 1e-9, "f_t {f_t} vs cap {}", mat.mu * f_n);
    }

    #[test]
    fn history_projects_into_tangent_plane() {
        let input = ContactInput {
            depth: 1e-4,
            normal: Vector3::z(),
            rel_vel: Vector3::new(0.1, 0.0, 0.0),
            r_eff: 0.05,
            m_eff: 0.5,
            mat: pair(),
            dt: 1e-4,
            history: Vector3::new(1e-4, 0.0, 5e-4),
        };
        let out = hertz_mindlin(&input, Vector3::zeros());
        assert_relative_eq!(out.history.dot(&Vector3::z()), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn custom_model_reads_locals_and_writes_force() {
        let cache = talus_compile::KernelCache::new();
        let prog = cache
            .compile("forceX = -(1e5 * overlap) * normalX; hisX = hisX + velTanX * dt;")
            .unwrap();
        let input = ContactInput {
            depth: 1e-3,
            normal: Vector3::x(),
            rel_vel: Vector3::new(0.0, 2.0, 0.0),
            r_eff: 0.05,
            m_eff: 0.5,
            mat: pair(),
            dt: 0.5,
            history: Vector3::zeros(),
        };
        let out = custom_force(&prog, &input).unwrap();
        assert_relative_eq!(out.force.x, -100.0, epsilon = 1e-9);
        assert_relative_eq!(out.history.x, 1.0, epsilon = 1e-12);
    }
}
