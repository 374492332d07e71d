//! Discovery of the leaves that have to be exchanged as halos.
//!
//! Two leaves interact if their cells, each expanded by its own interaction radius,
//! overlap. The test is symmetric, so the leaves a rank receives from a peer are exactly
//! the leaves that the peer decides to send.

use itertools::Itertools;
use rayon::prelude::*;

use crate::{
    assignment::SpaceCurveAssignment,
    constants::NSIBLINGS,
    error::DomainError,
    geometry::PhysicalBox,
    morton::{grid_size, IBox, SfcKey},
    octree::Octree,
};

/// Check that `radius` is smaller than half the box length on every periodic axis.
///
/// Beyond that bound a particle could interact with more than one image of a neighbour.
pub fn validate_radius(radius: f64, bounding_box: &PhysicalBox) -> Result<(), DomainError> {
    let lengths = bounding_box.lengths();
    for axis in 0..3 {
        if bounding_box.periodic()[axis] && 2.0 * radius >= lengths[axis] {
            return Err(DomainError::RadiusTooLarge {
                axis,
                radius,
                length: lengths[axis],
            });
        }
    }
    Ok(())
}

/// Convert a physical radius into a number of cells on the deepest level, rounded up.
///
/// The margin is capped at the number of cells per axis, which already covers the whole axis.
pub fn radius_margin<K: SfcKey>(radius: f64, bounding_box: &PhysicalBox) -> [i64; 3] {
    let n = grid_size::<K>() as i64;
    let lengths = bounding_box.lengths();
    [0usize, 1, 2].map(|d| ((radius / lengths[d] * n as f64).ceil() as i64).min(n))
}

/// Test whether `a` expanded by `margin` overlaps `b` or one of its periodic images.
///
/// `n` is the number of cells per axis.
pub fn overlaps(a: &IBox, b: &IBox, margin: [i64; 3], periodic: [bool; 3], n: i64) -> bool {
    (0..3).all(|d| {
        let shifts: &[i64] = if periodic[d] { &[-n, 0, n] } else { &[0] };
        shifts.iter().any(|&shift| {
            a.min[d] - margin[d] < b.max[d] + shift && b.min[d] + shift < a.max[d] + margin[d]
        })
    })
}

fn add_margins(a: [i64; 3], b: [i64; 3]) -> [i64; 3] {
    [0usize, 1, 2].map(|d| a[d].saturating_add(b[d]))
}

/// Find all pairs `(local leaf, remote leaf)` of interacting leaves for `rank`.
///
/// `node_radii` holds the maximum interaction radius of every node of `octree`, i.e. the
/// upswept leaf radii. Subtrees are skipped if even their maximum radius does not lead to an
/// overlap, or if they lie entirely inside the key ranges of `rank`.
pub fn find_halos<K: SfcKey>(
    octree: &Octree<K>,
    node_radii: &[f64],
    bounding_box: &PhysicalBox,
    assignment: &SpaceCurveAssignment,
    rank: usize,
) -> Vec<(usize, usize)> {
    assert_eq!(node_radii.len(), octree.num_tree_nodes());

    let n = grid_size::<K>() as i64;
    let periodic = bounding_box.periodic();

    let owned_keys = assignment
        .ranges(rank)
        .iter()
        .filter(|range| !range.is_empty())
        .map(|range| {
            (
                octree.code_start(octree.to_internal(range.start)),
                octree.code_end(octree.to_internal(range.end - 1)),
            )
        })
        .collect_vec();

    let is_owned = |node| {
        owned_keys.iter().any(|&(first, last)| {
            first <= octree.code_start(node) && octree.code_end(node) <= last
        })
    };

    let local_leaves = assignment
        .ranges(rank)
        .iter()
        .flat_map(|range| range.clone())
        .collect_vec();

    local_leaves
        .par_iter()
        .flat_map_iter(|&leaf| {
            let leaf_node = octree.to_internal(leaf);
            let leaf_box = octree.node_box(leaf_node);
            let leaf_margin = radius_margin::<K>(node_radii[leaf_node], bounding_box);

            let mut pairs = Vec::new();
            let mut stack = vec![0];

            while let Some(node) = stack.pop() {
                let margin = add_margins(
                    leaf_margin,
                    radius_margin::<K>(node_radii[node], bounding_box),
                );
                if is_owned(node)
                    || !overlaps(&leaf_box, &octree.node_box(node), margin, periodic, n)
                {
                    continue;
                }
                if octree.is_leaf(node) {
                    pairs.push((leaf, octree.cstone_index(node)));
                } else {
                    stack.extend((0..NSIBLINGS).map(|octant| octree.child(node, octant)));
                }
            }

            pairs
        })
        .collect()
}

/// Leaves to receive from and to send to every rank.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HaloNodeLists {
    /// `incoming[r]` lists the sorted leaves owned by `r` that are needed locally.
    pub incoming: Vec<Vec<usize>>,
    /// `outgoing[r]` lists the sorted local leaves that `r` needs.
    pub outgoing: Vec<Vec<usize>>,
}

/// Sort the halo pairs by the rank owning the remote leaf.
pub fn compute_send_recv_node_lists(
    pairs: &[(usize, usize)],
    assignment: &SpaceCurveAssignment,
) -> HaloNodeLists {
    let n_ranks = assignment.n_ranks();
    let mut incoming = vec![Vec::new(); n_ranks];
    let mut outgoing = vec![Vec::new(); n_ranks];

    for &(local, remote) in pairs {
        let remote_rank = assignment
            .find_rank(remote)
            .expect("the assignment covers every leaf");
        incoming[remote_rank].push(remote);
        outgoing[remote_rank].push(local);
    }

    for list in incoming.iter_mut().chain(outgoing.iter_mut()) {
        list.sort_unstable();
        list.dedup();
    }

    HaloNodeLists { incoming, outgoing }
}

#[cfg(test)]
mod test {
    use rand::Rng;
    use rand_distr::{Distribution, Normal};

    use super::*;
    use crate::{
        assignment::single_range_sfc_split,
        cornerstone::{compute_octree, n_nodes, uniform_tree},
        morton::encode_morton,
        tools::seeded_rng,
    };

    fn unit_box(periodic: [bool; 3]) -> PhysicalBox {
        PhysicalBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]).with_periodicity(periodic)
    }

    fn halo_lists<K: SfcKey>(
        tree: &[K],
        leaf_radii: &[f64],
        bounding_box: &PhysicalBox,
        assignment: &SpaceCurveAssignment,
    ) -> Vec<HaloNodeLists> {
        let octree = Octree::new(tree);
        let mut node_radii = vec![0.0; octree.num_tree_nodes()];
        octree.upsweep_max(leaf_radii, &mut node_radii);

        (0..assignment.n_ranks())
            .map(|rank| {
                let pairs = find_halos(&octree, &node_radii, bounding_box, assignment, rank);
                compute_send_recv_node_lists(&pairs, assignment)
            })
            .collect()
    }

    #[test]
    fn test_validate_radius() {
        let open = unit_box([false; 3]);
        assert!(validate_radius(10.0, &open).is_ok());

        let periodic = unit_box([false, true, false]);
        assert!(validate_radius(0.49, &periodic).is_ok());
        assert_eq!(
            validate_radius(0.5, &periodic),
            Err(DomainError::RadiusTooLarge {
                axis: 1,
                radius: 0.5,
                length: 1.0
            })
        );
    }

    #[test]
    fn test_radius_larger_than_box() {
        let bounding_box = unit_box([false; 3]);
        let n = grid_size::<u64>() as i64;
        assert_eq!(radius_margin::<u64>(1e13, &bounding_box), [n; 3]);
        assert_eq!(radius_margin::<u64>(f64::MAX, &bounding_box), [n; 3]);

        // Every leaf of the other rank is a halo.
        let tree = uniform_tree::<u64>(1);
        let assignment = single_range_sfc_split(&[1; 8], 2);
        let lists = halo_lists(&tree, &[1e13; 8], &bounding_box, &assignment);

        assert_eq!(lists[0].incoming[1], vec![4, 5, 6, 7]);
        assert_eq!(lists[1].incoming[0], vec![0, 1, 2, 3]);
        assert_eq!(lists[0].outgoing[1], vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_overlaps_periodic_image() {
        let n = 16;
        let low = IBox::new([0, 0, 0], [2, 2, 2]);
        let high = IBox::new([14, 0, 0], [16, 2, 2]);

        assert!(!overlaps(&low, &high, [1, 1, 1], [false; 3], n));
        assert!(overlaps(&low, &high, [1, 1, 1], [true, false, false], n));
        assert!(overlaps(&high, &low, [1, 1, 1], [true, false, false], n));

        // Touching faces do not overlap without a margin.
        let next = IBox::new([2, 0, 0], [4, 2, 2]);
        assert!(!overlaps(&low, &next, [0, 0, 0], [false; 3], n));
        assert!(overlaps(&low, &next, [1, 0, 0], [false; 3], n));
    }

    #[test]
    fn test_halos_across_periodic_boundary() {
        // Rank 0 owns the 32 level-2 cells with x < 1/2, rank 1 the others.
        let tree = uniform_tree::<u32>(2);
        let counts = vec![1; 64];
        let assignment = single_range_sfc_split(&counts, 2);
        assert_eq!(assignment.ranges(0), &[0..32]);

        let radii = vec![0.01; 64];

        let open = halo_lists(&tree, &radii, &unit_box([false; 3]), &assignment);
        assert_eq!(open[0].incoming[1].len(), 16);
        assert_eq!(open[1].incoming[0].len(), 16);

        let periodic = halo_lists(&tree, &radii, &unit_box([true, false, false]), &assignment);
        assert_eq!(periodic[0].incoming[1].len(), 32);
        assert_eq!(periodic[1].incoming[0].len(), 32);

        assert!(open[0].incoming[0].is_empty());
        assert!(open[0].outgoing[0].is_empty());
    }

    #[test]
    fn test_halo_symmetry_and_completeness() {
        let mut rng = seeded_rng(3);
        let normal = Normal::new(0.5, 0.15).unwrap();
        let n = grid_size::<u64>();

        let mut keys: Vec<u64> = (0..4000)
            .map(|_| {
                let mut coord = || {
                    let value: f64 = normal.sample(&mut rng);
                    ((value.clamp(0.0, 0.999) * n as f64) as u64).min(n - 1)
                };
                encode_morton([coord(), coord(), coord()])
            })
            .collect();
        keys.sort_unstable();

        let (tree, counts) = compute_octree(&keys, 32);
        let n_leaves = n_nodes(&tree);
        let radii: Vec<f64> = (0..n_leaves).map(|_| rng.gen_range(0.0..0.05)).collect();

        let bounding_box = unit_box([true, false, true]);
        let n_ranks = 5;
        let assignment = single_range_sfc_split(&counts, n_ranks);
        let lists = halo_lists(&tree, &radii, &bounding_box, &assignment);

        for a in 0..n_ranks {
            for b in 0..n_ranks {
                assert_eq!(lists[a].incoming[b], lists[b].outgoing[a]);
            }
        }

        // Compare with a brute force search over all leaf pairs.
        let octree = Octree::new(&tree);
        let cell = |leaf| octree.node_box(octree.to_internal(leaf));
        let margin = |leaf| radius_margin::<u64>(radii[leaf], &bounding_box);

        for a in 0..n_ranks {
            for b in (0..n_ranks).filter(|&b| b != a) {
                let expected = assignment.ranges(b)[0]
                    .clone()
                    .filter(|&remote| {
                        assignment.ranges(a)[0].clone().any(|local| {
                            overlaps(
                                &cell(local),
                                &cell(remote),
                                add_margins(margin(local), margin(remote)),
                                bounding_box.periodic(),
                                n as i64,
                            )
                        })
                    })
                    .collect_vec();
                assert_eq!(lists[a].incoming[b], expected);
            }
        }
    }
}
