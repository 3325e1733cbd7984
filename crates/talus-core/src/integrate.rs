//! Explicit time stepping primitives.
//!
//! Linear state advances under one of four schemes; angular state advances
//! in the owner's local (principal-axis) frame with a quaternion increment
//! and renormalization. The gyroscopic term is omitted: principal moments
//! divide the local torque componentwise, the usual shortcut for stiff
//! granular contacts where contact torques dominate.

use nalgebra::{UnitQuaternion, Vector3};
use talus_types::IntegratorKind;

/// Advances linear position and velocity by one step.
///
/// - `ForwardEuler`: velocity first, position with the *new* velocity (the
///   semi-implicit DEM workhorse).
/// - `CenteredDifference`: position with the average of old and new
///   velocity.
/// - `ExtendedTaylor`: position from the Taylor expansion through the
///   acceleration term, velocity explicitly.
/// - `Chung`: velocity first, position over-weighted with the acceleration
///   term for extra numerical dissipation.
#[inline]
#[must_use]
pub fn advance_linear(
    scheme: IntegratorKind,
    x: Vector3<f64>,
    v: Vector3<f64>,
    a: Vector3<f64>,
    dt: f64,
) -> (Vector3<f64>, Vector3<f64>) {
    match scheme {
        IntegratorKind::ForwardEuler => {
            let v1 = v + a * dt;
            (x + v1 * dt, v1)
        }
        IntegratorKind::CenteredDifference => {
            let v1 = v + a * dt;
            (x + (v + v1) * (0.5 * dt), v1)
        }
        IntegratorKind::ExtendedTaylor => {
            let v1 = v + a * dt;
            (x + v * dt + a * (0.5 * dt * dt), v1)
        }
        IntegratorKind::Chung => {
            let v1 = v + a * dt;
            (x + v1 * dt + a * (0.5 * dt * dt), v1)
        }
    }
}

/// Advances angular velocity (owner-local frame) and orientation by one
/// step. `torque_local` is the accumulated torque already rotated into the
/// owner frame; `moi` holds the principal moments.
#[inline]
#[must_use]
pub fn advance_angular(
    quat: UnitQuaternion<f64>,
    omega_local: Vector3<f64>,
    torque_local: Vector3<f64>,
    moi: Vector3<f64>,
    dt: f64,
) -> (UnitQuaternion<f64>, Vector3<f64>) {
    let alpha = Vector3::new(
        safe_div(torque_local.x, moi.x),
        safe_div(torque_local.y, moi.y),
        safe_div(torque_local.z, moi.z),
    );
    let omega1 = omega_local + alpha * dt;
    let mut q1 = quat * UnitQuaternion::from_scaled_axis(omega1 * dt);
    q1.renormalize_fast();
    (q1, omega1)
}

#[inline]
fn safe_div(num: f64, den: f64) -> f64 {
    if den.abs() < 1e-300 {
        0.0
    } else {
        num / den
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn free_fall_matches_closed_form() {
        let g = Vector3::new(0.0, 0.0, -9.81);
        let dt = 1e-4;
        let mut x = Vector3::new(0.0, 0.0, 1.0);
        let mut v = Vector3::zeros();
        for _ in 0..10_000 {
            let (x1, v1) = advance_linear(IntegratorKind::ExtendedTaylor, x, v, g, dt);
            x = x1;
            v = v1;
        }
        // After 1 s: z = 1 − g/2, v = −g.
        assert_relative_eq!(v.z, -9.81, epsilon = 1e-9);
        assert_relative_eq!(x.z, 1.0 - 0.5 * 9.81, epsilon = 1e-6);
    }

    #[test]
    fn schemes_agree_at_zero_acceleration() {
        let x = Vector3::new(1.0, 2.0, 3.0);
        let v = Vector3::new(0.5, 0.0, -0.5);
        let dt = 0.01;
        for scheme in [
            IntegratorKind::ForwardEuler,
            IntegratorKind::CenteredDifference,
            IntegratorKind::ExtendedTaylor,
            IntegratorKind::Chung,
        ] {
            let (x1, v1) = advance_linear(scheme, x, v, Vector3::zeros(), dt);
            assert_relative_eq!((x1 - (x + v * dt)).norm(), 0.0, epsilon = 1e-15);
            assert_relative_eq!((v1 - v).norm(), 0.0);
        }
    }

    #[test]
    fn constant_spin_rotates_about_local_axis() {
        let omega = Vector3::new(0.0, 0.0, std::f64::consts::PI); // half turn per second
        let dt = 1e-3;
        let mut q = UnitQuaternion::identity();
        let mut w = omega;
        for _ in 0..1000 {
            let (q1, w1) = advance_angular(q, w, Vector3::zeros(), Vector3::new(1.0, 1.0, 1.0), dt);
            q = q1;
            w = w1;
        }
        // One second of π rad/s about z: rotates x to −x.
        let rotated = q * Vector3::x();
        assert_relative_eq!(rotated.x, -1.0, epsilon = 1e-6);
        assert!(q.quaternion().norm() > 0.999_999);
    }

    #[test]
    fn torque_spins_up_by_principal_moment() {
        let (q, w) = advance_angular(
            UnitQuaternion::identity(),
            Vector3::zeros(),
            Vector3::new(2.0, 0.0, 0.0),
            Vector3::new(4.0, 1.0, 1.0),
            0.5,
        );
        assert_relative_eq!(w.x, 0.25, epsilon = 1e-15);
        let _ = q;
    }

    #[test]
    fn zero_inertia_axis_does_not_blow_up() {
        let (_, w) = advance_angular(
            UnitQuaternion::identity(),
            Vector3::zeros(),
            Vector3::new(1.0, 1.0, 1.0),
            Vector3::zeros(),
            0.1,
        );
        assert_eq!(w, Vector3::zeros());
    }
}
