//! Test the computation of a global bounding box across MPI ranks.

use cornerstone_domain::{
    geometry::PhysicalBox,
    global::compute_global_bounding_box,
    tools::{gather_to_root, generate_random_particles, seeded_rng},
};
use mpi::traits::Communicator;

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let comm = universe.world();

    // Initialise a seeded Rng.
    let mut rng = seeded_rng(comm.rank() as usize);

    // Create `npoints` per rank, shifted so that each rank covers a different region.
    let npoints = 10;
    let shift = comm.rank() as f64;

    let particles = generate_random_particles(npoints, shift, shift + 1.0, 0.1, &mut rng);

    // Compute the distributed bounding box.

    let bounding_box = compute_global_bounding_box(
        &particles.x,
        &particles.y,
        &particles.z,
        None,
        [false; 3],
        &comm,
    )
    .unwrap();

    // Copy all points to root and compare local bounding box there.

    let x_root = gather_to_root(&particles.x, &comm);
    let y_root = gather_to_root(&particles.y, &comm);
    let z_root = gather_to_root(&particles.z, &comm);

    if let (Some(x), Some(y), Some(z)) = (x_root, y_root, z_root) {
        // Compute the bounding box on root.

        let expected = PhysicalBox::from_points(&x, &y, &z);
        assert_eq!(expected.coordinates(), bounding_box.coordinates());

        println!("Global bounding box: {}", bounding_box);
    }

    // A periodic axis takes its extent from the configured bounds.

    let bounds = PhysicalBox::new([0.0, 0.0, 0.0, 0.5, 0.5, 0.5]);
    let periodic_box = compute_global_bounding_box(
        &particles.x,
        &particles.y,
        &particles.z,
        Some(&bounds),
        [false, true, false],
        &comm,
    )
    .unwrap();

    assert_eq!(periodic_box.min()[1], 0.0);
    assert_eq!(periodic_box.max()[1], 0.5);
    assert_eq!(periodic_box.min()[0], 0.0);
    assert_eq!(periodic_box.max()[0], bounding_box.max()[0]);
}
