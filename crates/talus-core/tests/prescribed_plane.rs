//! Boundary planes are completely fixed: the plane owner never moves, and
//! no dropped sphere ends up below it.

use nalgebra::Vector3;
use talus_core::{BoundingBoxMode, DemSolver, InspectorQuantity, Material};

#[test]
fn boundary_plane_stays_put_and_holds_the_spheres() {
    let mut sim = DemSolver::new();
    sim.set_world_box(1.0, 1.0, 1.0);
    sim.set_gravity(Vector3::new(0.0, 0.0, -9.81));
    sim.set_time_step(5e-5);
    sim.set_cd_update_freq(4);
    sim.use_frictional_hertzian_model();
    sim.suggest_expand_factor(3.5, 4.0 * 5e-5);

    let stiff = sim.load_material(Material::new(1e9, 0.3, 0.5, 0.5, 0.0));
    let soft = sim.load_material(Material::new(1e6, 0.3, 0.5, 0.5, 0.0));
    sim.set_bounding_box(BoundingBoxMode::TopOpen, stiff);

    let ball = sim.load_simple_sphere(0.01, 0.02, soft).unwrap();
    let mut templates = Vec::new();
    let mut positions = Vec::new();
    for i in 0..3 {
        for j in 0..3 {
            templates.push(ball);
            positions.push(Vector3::new(
                0.3 + i as f64 * 0.2,
                0.3 + j as f64 * 0.2,
                0.5,
            ));
        }
    }
    let batch = sim.add_clumps(templates, positions).unwrap();
    sim.set_batch_family(batch, 0).unwrap();

    sim.initialize().unwrap();

    // The bounding-box owner comes right after the 9 clump owners.
    let plane_owner = 9u32;
    let plane_pos0 = sim.owner_position(plane_owner).unwrap();

    // Sample the plane position during the run, not just at the end.
    for _ in 0..5 {
        sim.do_dynamics_then_sync(0.1).unwrap();
        let p = sim.owner_position(plane_owner).unwrap();
        assert_eq!(
            p, plane_pos0,
            "boundary owner moved: {plane_pos0:?} -> {p:?}"
        );
        let v = sim.owner_velocity(plane_owner).unwrap();
        assert_eq!(v, Vector3::zeros(), "boundary owner gained velocity");
    }

    // Spheres never sink below the floor plane (small Hertzian penetration
    // allowed).
    let min_z = sim
        .inspector(InspectorQuantity::ClumpMinZ)
        .unwrap()
        .get_value()
        .unwrap();
    assert!(
        min_z > 0.02 - 5e-3,
        "a sphere fell through the floor: min z = {min_z}"
    );
}
