//! Build a global cornerstone tree from keys distributed over all ranks.

use cornerstone_domain::{
    assignment::single_range_sfc_split,
    cornerstone::{compute_octree, is_cornerstone, n_nodes},
    global::compute_octree_global,
    tools::{
        gather_to_root, generate_random_keys, global_size, is_identical_on_all_ranks, seeded_rng,
    },
};
use mpi::traits::Communicator;

pub fn main() {
    // Initialise MPI
    let universe = mpi::initialize().unwrap();

    // Get the world communicator
    let comm = universe.world();

    // Initialise a seeded Rng.
    let mut rng = seeded_rng(comm.rank() as usize);

    // Create `nkeys` per rank. The key sets of the ranks interleave in key space.
    let nkeys = 10000;
    let bucket_size = 50;

    let mut keys = generate_random_keys::<u64, _>(nkeys, &mut rng);
    keys.sort_unstable();

    let (tree, counts) = compute_octree_global(&keys, bucket_size, &comm);

    assert!(is_cornerstone(&tree));
    assert!(counts.iter().all(|&count| count <= bucket_size));
    assert_eq!(counts.iter().sum::<usize>(), global_size(&keys, &comm));

    // Every rank must hold the same tree.
    assert!(is_identical_on_all_ranks(&tree, &comm));
    assert!(is_identical_on_all_ranks(&counts, &comm));

    let assignment = single_range_sfc_split(&counts, comm.size() as usize);
    assert!(assignment.is_partition(n_nodes(&tree)));

    // Building the tree from all keys on a single rank gives the same result.

    if let Some(mut all_keys) = gather_to_root(&keys, &comm) {
        all_keys.sort_unstable();
        let (expected_tree, expected_counts) = compute_octree(&all_keys, bucket_size);

        assert_eq!(tree, expected_tree);
        assert_eq!(counts, expected_counts);

        println!(
            "Global tree with {} leaves is identical on all ranks.",
            n_nodes(&tree)
        );
        for rank in 0..assignment.n_ranks() {
            println!(
                "Rank {}: leaves {:?}, {} keys.",
                rank,
                assignment.ranges(rank),
                assignment.total_count(rank)
            );
        }
    }
}
