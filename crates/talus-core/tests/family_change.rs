//! Conditional family reassignment: spheres crossing a plane move to a
//! family whose contacts with (and within) the old family are disabled, so
//! they stop appearing in pair lists together on the next broad-phase
//! round.

use nalgebra::Vector3;
use talus_core::{BoundingBoxMode, DemSolver, Material};

#[test]
fn crossing_the_plane_reassigns_and_silences_contacts() {
    let mut sim = DemSolver::new();
    sim.set_world_box(1.0, 1.0, 1.0);
    sim.set_gravity(Vector3::new(0.0, 0.0, -9.81));
    sim.set_time_step(1e-4);
    sim.set_cd_update_freq(4);
    sim.use_frictional_hertzian_model();
    sim.suggest_expand_factor(3.5, 4.0 * 1e-4);

    let mat = sim.load_material(Material::new(1e5, 0.3, 0.3, 0.4, 0.0));
    sim.set_bounding_box(BoundingBoxMode::All, mat);
    let ball = sim.load_simple_sphere(0.01, 0.03, mat).unwrap();

    // Two spheres stacked so they keep touching while they fall.
    let batch = sim
        .add_clumps(
            vec![ball, ball],
            vec![Vector3::new(0.5, 0.5, 0.50), Vector3::new(0.5, 0.5, 0.555)],
        )
        .unwrap();
    sim.set_batch_family(batch, 1).unwrap();

    // Below z = 0.25 a sphere leaves family 1 for family 2; family 2 talks
    // to nobody but the fixed boundaries.
    sim.change_family_when(1, 2, "Z < 0.25");
    sim.disable_contact_between_families(1, 2);
    sim.disable_contact_between_families(2, 2);

    sim.initialize().unwrap();
    assert_eq!(sim.owner_family(0).unwrap(), 1);
    assert_eq!(sim.owner_family(1).unwrap(), 1);

    // Long enough for both spheres to fall past the threshold and land.
    sim.do_dynamics_then_sync(0.5).unwrap();

    assert_eq!(sim.owner_family(0).unwrap(), 2);
    assert_eq!(sim.owner_family(1).unwrap(), 2);

    // Both rest on the floor, overlapping, but family 2 self-contact is
    // masked: no sphere-sphere pair between them survives the sweep.
    let pairs = sim.contact_pairs().unwrap();
    assert!(
        !pairs.contains(&(0, 1)) && !pairs.contains(&(1, 0)),
        "masked family pair leaked into the pair list: {pairs:?}"
    );
    // They still contact the boundary planes.
    assert!(
        pairs.iter().any(|&(a, _)| a == 0) || pairs.iter().any(|&(a, _)| a == 1),
        "spheres should rest on the floor: {pairs:?}"
    );

    let za = sim.owner_position(0).unwrap().z;
    let zb = sim.owner_position(1).unwrap().z;
    assert!(za < 0.25 && zb < 0.25);
}
