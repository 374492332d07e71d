//! Leaf-only octrees in cornerstone format.
//!
//! A cornerstone tree is a strictly increasing array of keys that starts with zero and
//! ends with the size of the key space. Each pair of adjacent keys `tree[i], tree[i + 1]`
//! is the half-open key range of leaf `i`. The leaves tile the whole key space.

use itertools::Itertools;
use rayon::prelude::*;

use crate::{
    constants::NSIBLINGS,
    morton::{enclosing_box_code, key_space_size, node_range, octal_digit, tree_level, SfcKey},
};

/// The tree consisting of the root node only.
pub fn root_tree<K: SfcKey>() -> Vec<K> {
    vec![K::zero(), key_space_size::<K>()]
}

/// Number of leaves of a cornerstone tree.
pub fn n_nodes<K>(tree: &[K]) -> usize {
    tree.len() - 1
}

/// Check the cornerstone invariants.
///
/// The first key is zero, the last key is the key space size, keys are strictly
/// increasing and each leaf is a valid octree node, i.e. its range is a power of eight
/// and its start is aligned to that range.
pub fn is_cornerstone<K: SfcKey>(tree: &[K]) -> bool {
    if tree.len() < 2 {
        return false;
    }
    if *tree.first().unwrap() != K::zero() || *tree.last().unwrap() != key_space_size::<K>() {
        return false;
    }

    for (&start, &end) in tree.iter().tuple_windows() {
        if start >= end {
            return false;
        }
        let range = end - start;
        if range.count_ones() != 1 || range.trailing_zeros() % 3 != 0 {
            return false;
        }
        if start % range != K::zero() {
            return false;
        }
    }

    true
}

/// Count the keys that fall into each leaf.
///
/// `sorted_keys` must be sorted in ascending order.
pub fn compute_node_counts<K: SfcKey>(tree: &[K], sorted_keys: &[K]) -> Vec<usize> {
    debug_assert!(sorted_keys.windows(2).all(|w| w[0] <= w[1]));

    tree.par_windows(2)
        .map(|bounds| {
            let first = sorted_keys.partition_point(|&key| key < bounds[0]);
            let last = sorted_keys.partition_point(|&key| key < bounds[1]);
            last - first
        })
        .collect()
}

/// Decide what happens with leaf `index` in the next rebalance step.
///
/// Returns 8 if the leaf is split, 0 if it is merged into its parent by its first sibling,
/// and 1 if it stays (or, for the first of eight merged siblings, becomes the parent).
fn node_op<K: SfcKey>(tree: &[K], counts: &[usize], bucket_size: usize, index: usize) -> usize {
    let start = tree[index];
    let level = tree_level(tree[index + 1] - start);

    if level > 0 {
        let sibling = octal_digit(start, level);
        if index >= sibling {
            let first = index - sibling;
            let parent_start = enclosing_box_code(start, level - 1);
            // All eight siblings are leaves exactly if they occupy eight consecutive
            // slots that span the parent.
            if first + NSIBLINGS <= n_nodes(tree)
                && tree[first] == parent_start
                && tree[first + NSIBLINGS] == parent_start + node_range::<K>(level - 1)
            {
                let group_count: usize = counts[first..first + NSIBLINGS].iter().sum();
                if group_count <= bucket_size {
                    return if sibling == 0 { 1 } else { 0 };
                }
            }
        }
    }

    if counts[index] > bucket_size && level < K::MAX_LEVEL {
        NSIBLINGS
    } else {
        1
    }
}

/// Compute the operation for every leaf.
///
/// Returns the operations and whether the tree is already converged, i.e. no leaf is split
/// or merged.
pub fn rebalance_decision<K: SfcKey>(
    tree: &[K],
    counts: &[usize],
    bucket_size: usize,
) -> (Vec<usize>, bool) {
    assert_eq!(n_nodes(tree), counts.len());

    let ops: Vec<usize> = (0..n_nodes(tree))
        .into_par_iter()
        .map(|index| node_op(tree, counts, bucket_size, index))
        .collect();

    let converged = ops.iter().all(|&op| op == 1);

    (ops, converged)
}

/// Apply the leaf operations computed by [rebalance_decision].
pub fn rebalance_tree<K: SfcKey>(tree: &[K], ops: &[usize]) -> Vec<K> {
    assert_eq!(n_nodes(tree), ops.len());

    let new_len = ops.iter().sum::<usize>() + 1;
    let mut new_tree = Vec::<K>::with_capacity(new_len);

    for (index, &op) in ops.iter().enumerate() {
        match op {
            0 => {}
            1 => new_tree.push(tree[index]),
            _ => {
                let level = tree_level(tree[index + 1] - tree[index]);
                let child_range = node_range::<K>(level + 1);
                for octant in 0..NSIBLINGS as u64 {
                    new_tree.push(tree[index] + K::from_u64(octant) * child_range);
                }
            }
        }
    }
    new_tree.push(*tree.last().unwrap());

    debug_assert_eq!(new_tree.len(), new_len);

    new_tree
}

/// Perform one refine/coarsen step. Returns `true` if the tree did not change.
pub fn update_octree<K: SfcKey>(tree: &mut Vec<K>, counts: &[usize], bucket_size: usize) -> bool {
    let (ops, converged) = rebalance_decision(tree, counts, bucket_size);
    if !converged {
        *tree = rebalance_tree(tree, &ops);
    }
    converged
}

/// Build a cornerstone tree whose leaves hold at most `bucket_size` keys.
///
/// Starting from `tree`, leaves with too many keys are split and groups of eight sibling leaves
/// whose combined count fits into a bucket are merged until a fixed point is reached.
/// Returns the tree and the number of keys per leaf.
pub fn compute_octree_from<K: SfcKey>(
    mut tree: Vec<K>,
    sorted_keys: &[K],
    bucket_size: usize,
) -> (Vec<K>, Vec<usize>) {
    assert!(bucket_size > 0);
    debug_assert!(is_cornerstone(&tree));

    let mut iteration = 0;
    loop {
        let counts = compute_node_counts(&tree, sorted_keys);
        if update_octree(&mut tree, &counts, bucket_size) {
            debug_assert!(is_cornerstone(&tree));
            return (tree, counts);
        }
        iteration += 1;
        log::trace!(
            "Local tree rebalance iteration {}: {} leaves.",
            iteration,
            n_nodes(&tree)
        );
    }
}

/// Build a cornerstone tree for `sorted_keys` starting from the root.
pub fn compute_octree<K: SfcKey>(sorted_keys: &[K], bucket_size: usize) -> (Vec<K>, Vec<usize>) {
    compute_octree_from(root_tree(), sorted_keys, bucket_size)
}

/// A uniform tree with all leaves on `level`, i.e. `8^level` leaves.
pub fn uniform_tree<K: SfcKey>(level: u32) -> Vec<K> {
    let range = node_range::<K>(level);
    let n_leaves = 1u64 << (3 * level);

    (0..=n_leaves).map(|i| K::from_u64(i) * range).collect()
}

/// The coarsest cornerstone tree in which every key of `keys` is a leaf boundary.
///
/// `keys` must be sorted, start with zero and end with the key space size.
pub fn spanning_tree<K: SfcKey>(keys: &[K]) -> Vec<K> {
    assert_eq!(*keys.first().unwrap(), K::zero());
    assert_eq!(*keys.last().unwrap(), key_space_size::<K>());

    let mut tree = Vec::<K>::new();

    for (&start, &end) in keys.iter().tuple_windows() {
        let mut current = start;
        while current < end {
            // Take the largest node that starts at `current` and does not cross `end`.
            let level = (0..=K::MAX_LEVEL)
                .find(|&level| {
                    let range = node_range::<K>(level);
                    current % range == K::zero() && end - current >= range
                })
                .unwrap_or(K::MAX_LEVEL);
            tree.push(current);
            current = current + node_range::<K>(level);
        }
    }
    tree.push(*keys.last().unwrap());

    tree
}

/// Builder for irregular cornerstone trees, mostly used in tests.
///
/// ```
/// use cornerstone_domain::cornerstone::OctreeMaker;
///
/// // Split the root, then split its first octant.
/// let tree = OctreeMaker::<u32>::new().divide(&[]).divide(&[0]).make_tree();
/// assert_eq!(tree.len(), 16);
/// ```
pub struct OctreeMaker<K: SfcKey> {
    tree: Vec<K>,
}

impl<K: SfcKey> Default for OctreeMaker<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: SfcKey> OctreeMaker<K> {
    /// Start with the root tree.
    pub fn new() -> Self {
        Self { tree: root_tree() }
    }

    /// Split the leaf addressed by the octant path `path` into its eight children.
    ///
    /// The empty path denotes the root. The leaf must exist.
    pub fn divide(mut self, path: &[usize]) -> Self {
        let level = path.len() as u32;
        assert!(level < K::MAX_LEVEL);

        let start = path
            .iter()
            .enumerate()
            .fold(K::zero(), |acc, (index, &octant)| {
                assert!(octant < NSIBLINGS);
                acc + K::from_u64(octant as u64) * node_range::<K>(index as u32 + 1)
            });

        let index = self
            .tree
            .binary_search(&start)
            .unwrap_or_else(|_| panic!("node {:?} is not a leaf", path));
        assert_eq!(
            self.tree[index + 1] - start,
            node_range::<K>(level),
            "node {:?} is not a leaf",
            path
        );

        let child_range = node_range::<K>(level + 1);
        let children =
            (1..NSIBLINGS as u64).map(|octant| start + K::from_u64(octant) * child_range);
        self.tree.splice(index + 1..index + 1, children);

        self
    }

    /// Return the cornerstone tree.
    pub fn make_tree(self) -> Vec<K> {
        self.tree
    }
}
