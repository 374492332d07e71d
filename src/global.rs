//! Global assembly of the bounding box, the cornerstone tree and per-leaf radii.
//!
//! Every routine here is collective. The results are bit-identical on all ranks because
//! they are computed from the outcome of the same reductions.

use mpi::{collective::SystemOperation, traits::CommunicatorCollectives};
use rayon::prelude::*;

use crate::{
    cornerstone::{compute_node_counts, is_cornerstone, n_nodes, root_tree, update_octree},
    error::DomainError,
    geometry::PhysicalBox,
    morton::SfcKey,
};

/// Combine the box spanned by the particles with the configured bounds.
///
/// Periodic axes take their extent from `bounds`. Open axes take the union of the particle
/// extent and `bounds`, if given.
pub fn merge_bounds(
    particle_box: &PhysicalBox,
    bounds: Option<&PhysicalBox>,
    periodic: [bool; 3],
) -> Result<PhysicalBox, DomainError> {
    let merged = match bounds {
        Some(bounds) => particle_box.union(bounds),
        None => *particle_box,
    };

    let mut coords = merged.coordinates();

    for axis in 0..3 {
        if periodic[axis] {
            let bounds = bounds.ok_or(DomainError::MissingPeriodicBounds { axis })?;
            let fixed = bounds.coordinates();
            coords[axis] = fixed[axis];
            coords[axis + 3] = fixed[axis + 3];
        }
    }

    let bounding_box = PhysicalBox::new(coords).with_periodicity(periodic);
    bounding_box.validate()?;

    Ok(bounding_box)
}

/// Compute the bounding box of the particles on all ranks.
///
/// See [merge_bounds] for how the configured `bounds` are taken into account.
pub fn compute_global_bounding_box<C: CommunicatorCollectives>(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    bounds: Option<&PhysicalBox>,
    periodic: [bool; 3],
    comm: &C,
) -> Result<PhysicalBox, DomainError> {
    let local = PhysicalBox::from_points(x, y, z);

    let mut global_min = [0.0; 3];
    let mut global_max = [0.0; 3];

    comm.all_reduce_into(&local.min()[..], &mut global_min[..], SystemOperation::min());
    comm.all_reduce_into(&local.max()[..], &mut global_max[..], SystemOperation::max());

    let [xmin, ymin, zmin] = global_min;
    let [xmax, ymax, zmax] = global_max;

    merge_bounds(
        &PhysicalBox::new([xmin, ymin, zmin, xmax, ymax, zmax]),
        bounds,
        periodic,
    )
}

/// Build the global cornerstone tree from the locally sorted keys of every rank.
///
/// Each iteration counts the local keys per leaf, sums the counts over all ranks and
/// applies one refine/coarsen step. Since every rank sees the same global counts, the trees
/// stay identical. Returns the converged tree and its global leaf counts.
pub fn compute_octree_global<K: SfcKey, C: CommunicatorCollectives>(
    sorted_keys: &[K],
    bucket_size: usize,
    comm: &C,
) -> (Vec<K>, Vec<usize>) {
    assert!(bucket_size > 0);

    let mut tree = root_tree::<K>();
    let mut iteration = 0;

    loop {
        let local_counts = compute_node_counts(&tree, sorted_keys);
        let mut counts = vec![0usize; local_counts.len()];
        comm.all_reduce_into(&local_counts[..], &mut counts[..], SystemOperation::sum());

        if update_octree(&mut tree, &counts, bucket_size) {
            assert!(is_cornerstone(&tree));
            log::trace!(
                "Global tree converged after {} iterations with {} leaves.",
                iteration,
                n_nodes(&tree)
            );
            return (tree, counts);
        }

        iteration += 1;
        log::trace!(
            "Global tree rebalance iteration {}: {} leaves.",
            iteration,
            n_nodes(&tree)
        );
    }
}

/// Maximum interaction radius `radius_factor * h` of the local particles in every leaf.
///
/// Leaves without local particles get a radius of zero.
pub fn local_node_max<K: SfcKey>(
    tree: &[K],
    sorted_keys: &[K],
    h: &[f64],
    radius_factor: f64,
) -> Vec<f64> {
    assert_eq!(sorted_keys.len(), h.len());

    (0..n_nodes(tree))
        .into_par_iter()
        .map(|leaf| {
            let first = sorted_keys.partition_point(|&key| key < tree[leaf]);
            let last = sorted_keys.partition_point(|&key| key < tree[leaf + 1]);
            h[first..last]
                .iter()
                .fold(0.0, |acc, &hi| f64::max(acc, radius_factor * hi))
        })
        .collect()
}

/// Maximum interaction radius per leaf over all ranks.
pub fn compute_node_max_global<K: SfcKey, C: CommunicatorCollectives>(
    tree: &[K],
    sorted_keys: &[K],
    h: &[f64],
    radius_factor: f64,
    comm: &C,
) -> Vec<f64> {
    let local = local_node_max(tree, sorted_keys, h, radius_factor);
    let mut global = vec![0.0; local.len()];

    comm.all_reduce_into(&local[..], &mut global[..], SystemOperation::max());

    global
}
