//! Decompose a random particle distribution and check owned and halo particles.

use std::collections::HashMap;

use cornerstone_domain::{
    cornerstone::{is_cornerstone, n_nodes},
    domain::{Domain, DomainConfig},
    geometry::PhysicalBox,
    tools::{
        gather_to_all, gather_to_root, generate_random_particles, is_identical_on_all_ranks,
        seeded_rng,
    },
    vtk::export_tree,
};
use itertools::izip;
use mpi::traits::Communicator;

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let comm = universe.world();
    let rank = comm.rank() as usize;
    let size = comm.size() as usize;

    // Initialise a seeded Rng.
    let mut rng = seeded_rng(rank);

    // Create `npoints` per rank.
    let npoints = 2000;
    let h = 0.02;

    let particles = generate_random_particles(npoints, 0.0, 1.0, h, &mut rng);
    let (mut x, mut y, mut z, mut hs) = (particles.x, particles.y, particles.z, particles.h);

    // A global particle id travels with the particles.
    let mut ids: Vec<f64> = (0..npoints).map(|i| (rank * npoints + i) as f64).collect();

    let config = DomainConfig::default()
        .with_bucket_size(32)
        .with_periodicity([true, false, false])
        .with_bounds(PhysicalBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]));

    let mut domain = Domain::<u64, _>::new(config, &comm);

    for step in 0..3 {
        domain
            .sync_with_attributes(&mut x, &mut y, &mut z, &mut hs, &mut [&mut ids])
            .unwrap();

        let owned = domain.start_index()..domain.end_index();

        // No particle is lost or duplicated.

        let owned_ids = ids[owned.clone()].to_vec();
        if let Some(mut all_ids) = gather_to_root(&owned_ids, &comm) {
            all_ids.sort_by(f64::total_cmp);
            assert_eq!(all_ids.len(), size * npoints);
            assert!(all_ids
                .iter()
                .enumerate()
                .all(|(index, &id)| id == index as f64));
        }

        // All ranks agree on the tree.

        assert!(is_cornerstone(domain.tree()));
        assert!(is_identical_on_all_ranks(domain.tree(), &comm));
        assert!(domain.assignment().is_partition(n_nodes(domain.tree())));
        assert_eq!(x.len(), domain.n_particles_with_halos());

        // Every halo particle is an exact copy of a particle owned by another rank.

        let all_owned_ids = gather_to_all(&owned_ids, &comm);
        let all_owned_x = gather_to_all(&x[owned.clone()], &comm);
        let all_owned_y = gather_to_all(&y[owned.clone()], &comm);
        let positions: HashMap<u64, (f64, f64)> =
            izip!(&all_owned_ids, &all_owned_x, &all_owned_y)
                .map(|(&id, &xi, &yi)| (id as u64, (xi, yi)))
                .collect();

        let mut nhalos = 0;
        for range in domain.halo_ranges() {
            for index in range.clone() {
                assert!(!owned.contains(&index));
                let expected = positions[&(ids[index] as u64)];
                assert_eq!((x[index], y[index]), expected);
                nhalos += 1;
            }
        }

        println!(
            "Step {}, rank {}: {} owned particles, {} halos.",
            step,
            rank,
            domain.n_particles(),
            nhalos
        );

        // Move the owned particles before the next step. Halos are dropped by the next sync.
        for xi in x[owned.clone()].iter_mut() {
            *xi += 0.1;
        }
    }

    if rank == 0 {
        let bounding_box = domain.bounding_box().unwrap();
        export_tree(
            domain.tree(),
            domain.node_counts(),
            &bounding_box,
            "decomposition.vtu",
        )
        .unwrap();
    }
}
