//! Re-initialization idempotence and the mid-run maintenance surface:
//! template order and family remaps are stable across a second
//! `initialize`, live additions land in the workers, purging reclaims
//! slots, and immediate family changes apply.

use nalgebra::Vector3;
use talus_core::{BoundingBoxMode, DemSolver, Material, RESERVED_FAMILY};

fn build() -> (DemSolver, Vec<talus_core::ClumpTemplateHandle>) {
    let mut sim = DemSolver::new();
    sim.set_world_box(1.0, 1.0, 1.0);
    sim.set_gravity(Vector3::new(0.0, 0.0, -9.81));
    sim.set_time_step(1e-4);
    sim.use_frictional_hertzian_model();

    let mat = sim.load_material(Material::new(1e6, 0.3, 0.5, 0.5, 0.0));
    sim.set_bounding_box(BoundingBoxMode::All, mat);
    // Loaded big-first so the preprocessor has to re-order.
    let trio = sim
        .load_clump_template(
            0.03,
            Vector3::new(1e-5, 1e-5, 1e-5),
            vec![0.02, 0.02, 0.02],
            vec![
                Vector3::new(-0.02, 0.0, 0.0),
                Vector3::zeros(),
                Vector3::new(0.02, 0.0, 0.0),
            ],
            vec![mat, mat, mat],
        )
        .unwrap();
    let single = sim.load_simple_sphere(0.01, 0.02, mat).unwrap();
    // Resting into the floor, so the seeded pair list is non-trivial.
    let b1 = sim
        .add_clumps(vec![trio], vec![Vector3::new(0.3, 0.3, 0.015)])
        .unwrap();
    sim.set_batch_family(b1, 1).unwrap();
    let b2 = sim
        .add_clumps(vec![single], vec![Vector3::new(0.7, 0.7, 0.3)])
        .unwrap();
    sim.set_batch_family(b2, 4).unwrap();
    (sim, vec![trio, single])
}

#[test]
fn reinitialization_is_idempotent() {
    let (mut sim, handles) = build();
    sim.initialize().unwrap();

    // The single-sphere template sorts ahead of the trio.
    let order1: Vec<u32> = handles
        .iter()
        .map(|h| sim.template_internal_index(*h).unwrap())
        .collect();
    assert_eq!(order1, vec![1, 0]);
    let fam1 = (
        sim.internal_family_of(1).unwrap(),
        sim.internal_family_of(4).unwrap(),
        sim.internal_family_of(RESERVED_FAMILY).unwrap(),
    );
    let pairs1 = sim.contact_pairs().unwrap();

    sim.initialize().unwrap();
    let order2: Vec<u32> = handles
        .iter()
        .map(|h| sim.template_internal_index(*h).unwrap())
        .collect();
    let fam2 = (
        sim.internal_family_of(1).unwrap(),
        sim.internal_family_of(4).unwrap(),
        sim.internal_family_of(RESERVED_FAMILY).unwrap(),
    );
    assert_eq!(order1, order2, "template order changed across re-init");
    assert_eq!(fam1, fam2, "family remap changed across re-init");
    assert_eq!(
        pairs1,
        sim.contact_pairs().unwrap(),
        "initial pair output changed across re-init"
    );
}

#[test]
fn live_addition_purge_and_immediate_family_change() {
    let (mut sim, handles) = build();
    sim.initialize().unwrap();
    sim.do_dynamics_then_sync(0.02).unwrap();

    // Live addition: a third clump enters mid-simulation, appended after
    // the existing owners (clumps 0-1, boundary object 2).
    let b3 = sim
        .add_clumps(vec![handles[1]], vec![Vector3::new(0.5, 0.5, 0.5)])
        .unwrap();
    sim.set_batch_family(b3, 4).unwrap();
    sim.update_worker_arrays().unwrap();
    assert_eq!(sim.owner_family(3).unwrap(), 4);
    sim.do_dynamics_then_sync(0.02).unwrap();

    // Immediate family change moves every member of family 4 to family 1.
    sim.change_family_now(4, 1).unwrap();
    assert_eq!(sim.owner_family(1).unwrap(), 1);
    assert_eq!(sim.owner_family(3).unwrap(), 1);

    // Purge family 1: both remaining clumps and the trio go; the boundary
    // object survives.
    sim.purge_family(1).unwrap();
    sim.do_dynamics_then_sync(0.02).unwrap();
    assert!(sim.owner_position(0).is_ok());
    assert_eq!(sim.owner_family(0).unwrap(), RESERVED_FAMILY);
    assert!(sim.owner_position(1).is_err(), "purged owners must be gone");
}

#[test]
fn tracker_resolves_batch_owner_ranges() {
    let (mut sim, _) = build();
    let tpl = sim_template(&mut sim);
    let b3 = sim
        .add_clumps(vec![tpl], vec![Vector3::new(0.5, 0.5, 0.6)])
        .unwrap();
    let tracker = sim.track_clump_batch(b3);
    sim.initialize().unwrap();
    // Two batches of one clump each precede the tracked batch.
    assert_eq!(sim.tracker_owner(tracker, 0).unwrap(), 2);

    let owner = sim.tracker_owner(tracker, 0).unwrap();
    sim.add_force(owner, Vector3::new(0.0, 0.0, 0.5)).unwrap();
    sim.do_dynamics_then_sync(0.01).unwrap();
}

fn sim_template(sim: &mut DemSolver) -> talus_core::ClumpTemplateHandle {
    let mat = sim.load_material(Material::new(1e6, 0.3, 0.5, 0.5, 0.0));
    sim.load_simple_sphere(0.01, 0.02, mat).unwrap()
}
