//! The asynchronous drift bound: with a contact-detection update frequency
//! of 8, every pair list dT consumes is at most 8 steps behind, and the
//! kinematic worker runs roughly one round per 8 integrator steps.

use nalgebra::Vector3;
use talus_core::{DemSolver, Material};

#[test]
fn drift_never_exceeds_the_bound_and_kt_runs_at_cadence() {
    let mut sim = DemSolver::new();
    sim.set_world_box(1.0, 1.0, 1.0);
    sim.set_gravity(Vector3::zeros());
    sim.set_time_step(1e-4);
    sim.set_cd_update_freq(8);
    sim.use_frictionless_hertzian_model();
    sim.suggest_expand_factor(0.2, 8.0 * 1e-4);

    let mat = sim.load_material(Material::new(1e6, 0.3, 0.9, 0.5, 0.0));
    let ball = sim.load_simple_sphere(0.01, 0.02, mat).unwrap();
    let batch = sim
        .add_clumps(
            vec![ball, ball],
            vec![Vector3::new(0.3, 0.5, 0.5), Vector3::new(0.7, 0.5, 0.5)],
        )
        .unwrap();
    // Slow drift toward each other keeps kT genuinely busy.
    sim.set_batch_velocities(
        batch,
        vec![Vector3::new(0.05, 0.0, 0.0), Vector3::new(-0.05, 0.0, 0.0)],
    )
    .unwrap();
    sim.set_batch_family(batch, 0).unwrap();

    sim.initialize().unwrap();
    sim.do_dynamics_then_sync(0.4).unwrap();

    let stats = sim.collaboration_stats();
    assert_eq!(stats.dynamic_updates, 4000);
    assert!(
        stats.max_observed_drift <= 8,
        "drift bound violated:\n{stats}"
    );
    // kT updates ~ steps / frequency, within ±20% (plus the final wind-down
    // rounds of each call).
    let expected = 4000.0 / 8.0;
    let got = stats.kinematic_updates as f64;
    assert!(
        got > expected * 0.8 && got < expected * 1.2 + 4.0,
        "kinematic update count off: got {got}, expected about {expected}\n{stats}"
    );
    // The average drift sits somewhere inside (0, 8].
    assert!(stats.average_recent_drift > 0.0 && stats.average_recent_drift <= 8.0);
}

#[test]
#[ignore = "full-scale drift soak (100k steps)"]
fn drift_bound_soak() {
    let mut sim = DemSolver::new();
    sim.set_world_box(1.0, 1.0, 1.0);
    sim.set_gravity(Vector3::zeros());
    sim.set_time_step(1e-5);
    sim.set_cd_update_freq(8);
    sim.use_frictionless_hertzian_model();
    sim.suggest_expand_factor(0.2, 8.0 * 1e-5);
    let mat = sim.load_material(Material::new(1e6, 0.3, 0.9, 0.5, 0.0));
    let ball = sim.load_simple_sphere(0.01, 0.02, mat).unwrap();
    let batch = sim
        .add_clumps(
            vec![ball, ball],
            vec![Vector3::new(0.3, 0.5, 0.5), Vector3::new(0.7, 0.5, 0.5)],
        )
        .unwrap();
    sim.set_batch_family(batch, 0).unwrap();
    sim.initialize().unwrap();
    sim.do_dynamics_then_sync(1.0).unwrap();
    let stats = sim.collaboration_stats();
    assert_eq!(stats.dynamic_updates, 100_000);
    assert!(stats.max_observed_drift <= 8);
    let expected = 100_000.0 / 8.0;
    let got = stats.kinematic_updates as f64;
    assert!(got > expected * 0.8 && got < expected * 1.2);
}
