//! Two equal spheres on a head-on elastic collision course: after the
//! bounce the centres separate symmetrically, relative speed and kinetic
//! energy recover to within 1%.

use nalgebra::Vector3;
use talus_core::{DemSolver, Material};

#[test]
fn elastic_bounce_conserves_energy_and_symmetry() {
    let mut sim = DemSolver::new();
    sim.set_world_box(2.0, 2.0, 2.0);
    sim.set_world_origin_center();
    sim.set_gravity(Vector3::zeros());
    sim.set_time_step(2e-5);
    sim.set_cd_update_freq(5);
    sim.use_frictionless_hertzian_model();
    sim.suggest_expand_factor(2.5, 5.0 * 2e-5);

    let mat = sim.load_material(Material::new(1e7, 0.3, 1.0, 0.5, 0.0));
    let ball = sim.load_simple_sphere(1.0, 0.1, mat).unwrap();
    let batch = sim
        .add_clumps(
            vec![ball, ball],
            vec![Vector3::new(-0.2, 0.0, 0.0), Vector3::new(0.2, 0.0, 0.0)],
        )
        .unwrap();
    sim.set_batch_velocities(
        batch,
        vec![Vector3::new(1.0, 0.0, 0.0), Vector3::new(-1.0, 0.0, 0.0)],
    )
    .unwrap();
    sim.set_batch_family(batch, 0).unwrap();

    sim.initialize().unwrap();
    let ke0 = sim.total_kinetic_energy().unwrap();
    assert!((ke0 - 1.0).abs() < 1e-9, "initial KE should be 1 J, got {ke0}");

    sim.do_dynamics_then_sync(0.5).unwrap();

    let xa = sim.owner_position(0).unwrap();
    let xb = sim.owner_position(1).unwrap();
    let va = sim.owner_velocity(0).unwrap();
    let vb = sim.owner_velocity(1).unwrap();

    // Separated symmetrically about the origin.
    assert!(xa.x < -0.2, "left ball should have rebounded, at {}", xa.x);
    assert!(xb.x > 0.2, "right ball should have rebounded, at {}", xb.x);
    assert!(
        (xa.x + xb.x).abs() < 1e-3,
        "centres should be symmetric: {} vs {}",
        xa.x,
        xb.x
    );

    // Relative speed recovered within 1%.
    let v_rel = (va - vb).norm();
    assert!(
        (v_rel - 2.0).abs() < 0.02,
        "relative speed should recover to 2 m/s, got {v_rel}"
    );

    // Kinetic energy preserved within 1%.
    let ke1 = sim.total_kinetic_energy().unwrap();
    assert!(
        (ke1 - ke0).abs() / ke0 < 0.01,
        "kinetic energy drifted: {ke0} -> {ke1}"
    );

    // The co-simulation honored its drift bound throughout.
    let stats = sim.collaboration_stats();
    assert!(stats.max_observed_drift <= 5, "drift bound violated: {stats}");
    assert_eq!(stats.dynamic_updates, 25_000);
}
