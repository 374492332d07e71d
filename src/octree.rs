//! Fully linked octree built on top of a cornerstone leaf array.
//!
//! All nodes, internal and leaf, live in one flat array ordered by level and, within a
//! level, by key. The root has index 0, the nodes on level 1 follow, and so on. Parent and
//! child relations are plain indices into this array. The eight children of an internal
//! node are stored consecutively on the next level.

use std::ops::Range;

use num::traits::Zero;
use rayon::prelude::*;

use crate::{
    constants::NSIBLINGS,
    cornerstone::{is_cornerstone, n_nodes},
    morton::{enclosing_box_code, node_range, tree_level, IBox, SfcKey},
};

/// Index of a node in the flat node array of an [Octree].
pub type TreeNodeIndex = usize;

const NO_INDEX: usize = usize::MAX;

/// An octree with internal nodes reconstructed from a cornerstone tree.
pub struct Octree<K: SfcKey> {
    prefixes: Vec<K>,
    levels: Vec<u32>,
    parents: Vec<TreeNodeIndex>,
    first_child: Vec<TreeNodeIndex>,
    node_to_leaf: Vec<usize>,
    leaf_to_node: Vec<TreeNodeIndex>,
    level_offsets: Vec<usize>,
}

impl<K: SfcKey> Octree<K> {
    /// Build the octree for the cornerstone tree `tree`.
    pub fn new(tree: &[K]) -> Self {
        assert!(is_cornerstone(tree), "input is not a cornerstone tree");

        let n_leaves = n_nodes(tree);

        // Every internal node starts at the same key as its first descendant leaf. So each
        // leaf contributes itself and all ancestors that share its start key.
        let mut nodes: Vec<(u32, K, usize)> = (0..n_leaves)
            .into_par_iter()
            .flat_map_iter(|leaf| {
                let start = tree[leaf];
                let level = tree_level(tree[leaf + 1] - start);
                (0..level)
                    .filter(move |&ancestor_level| {
                        start % node_range::<K>(ancestor_level) == K::zero()
                    })
                    .map(move |ancestor_level| (ancestor_level, start, NO_INDEX))
                    .chain(std::iter::once((level, start, leaf)))
            })
            .collect();

        nodes.par_sort_unstable_by_key(|&(level, start, _)| (level, start));

        let n_total = nodes.len();
        debug_assert_eq!(n_total - n_leaves, (n_leaves - 1) / 7);

        let levels: Vec<u32> = nodes.iter().map(|node| node.0).collect();
        let prefixes: Vec<K> = nodes.iter().map(|node| node.1).collect();
        let node_to_leaf: Vec<usize> = nodes.iter().map(|node| node.2).collect();

        let level_offsets: Vec<usize> = (0..=K::MAX_LEVEL + 1)
            .map(|level| levels.partition_point(|&l| l < level))
            .collect();

        let mut leaf_to_node = vec![NO_INDEX; n_leaves];
        for (node, &leaf) in node_to_leaf.iter().enumerate() {
            if leaf != NO_INDEX {
                leaf_to_node[leaf] = node;
            }
        }

        let mut octree = Self {
            prefixes,
            levels,
            parents: Vec::new(),
            first_child: Vec::new(),
            node_to_leaf,
            leaf_to_node,
            level_offsets,
        };

        let parents: Vec<TreeNodeIndex> = (0..n_total)
            .into_par_iter()
            .map(|node| {
                let level = octree.levels[node];
                if level == 0 {
                    0
                } else {
                    let parent_start = enclosing_box_code(octree.prefixes[node], level - 1);
                    octree
                        .find_on_level(parent_start, level - 1)
                        .expect("every node has a parent")
                }
            })
            .collect();

        let first_child: Vec<TreeNodeIndex> = (0..n_total)
            .into_par_iter()
            .map(|node| {
                if octree.node_to_leaf[node] != NO_INDEX {
                    NO_INDEX
                } else {
                    octree
                        .find_on_level(octree.prefixes[node], octree.levels[node] + 1)
                        .expect("every internal node has children")
                }
            })
            .collect();

        octree.parents = parents;
        octree.first_child = first_child;

        octree
    }

    fn level_range(&self, level: u32) -> Range<usize> {
        self.level_offsets[level as usize]..self.level_offsets[level as usize + 1]
    }

    fn find_on_level(&self, start: K, level: u32) -> Option<TreeNodeIndex> {
        let range = self.level_range(level);
        self.prefixes[range.clone()]
            .binary_search(&start)
            .ok()
            .map(|position| range.start + position)
    }

    /// Total number of nodes.
    pub fn num_tree_nodes(&self) -> usize {
        self.prefixes.len()
    }

    /// Number of nodes on `level`.
    pub fn num_tree_nodes_on_level(&self, level: u32) -> usize {
        if level > K::MAX_LEVEL {
            return 0;
        }
        self.level_range(level).len()
    }

    /// Number of leaves.
    pub fn num_leaf_nodes(&self) -> usize {
        self.leaf_to_node.len()
    }

    /// Number of internal nodes. Equals `(num_leaf_nodes() - 1) / 7`.
    pub fn num_internal_nodes(&self) -> usize {
        self.num_tree_nodes() - self.num_leaf_nodes()
    }

    /// First key of the node.
    pub fn code_start(&self, node: TreeNodeIndex) -> K {
        self.prefixes[node]
    }

    /// One past the last key of the node.
    pub fn code_end(&self, node: TreeNodeIndex) -> K {
        self.prefixes[node] + node_range::<K>(self.levels[node])
    }

    /// Level of the node. The root has level 0.
    pub fn level(&self, node: TreeNodeIndex) -> u32 {
        self.levels[node]
    }

    /// True if the node has no children.
    pub fn is_leaf(&self, node: TreeNodeIndex) -> bool {
        self.node_to_leaf[node] != NO_INDEX
    }

    /// True for the root node.
    pub fn is_root(&self, node: TreeNodeIndex) -> bool {
        node == 0
    }

    /// Parent of the node. The root is its own parent.
    pub fn parent(&self, node: TreeNodeIndex) -> TreeNodeIndex {
        self.parents[node]
    }

    /// Child `octant` of an internal node.
    pub fn child(&self, node: TreeNodeIndex, octant: usize) -> TreeNodeIndex {
        assert!(octant < NSIBLINGS);
        assert!(!self.is_leaf(node), "leaf {} has no children", node);
        self.first_child[node] + octant
    }

    /// Integer box covered by the node.
    pub fn node_box(&self, node: TreeNodeIndex) -> IBox {
        IBox::from_key_range(self.code_start(node), self.code_end(node))
    }

    /// Find the node that exactly spans the key range `[start, end)`.
    pub fn locate(&self, start: K, end: K) -> Option<TreeNodeIndex> {
        if end <= start {
            return None;
        }
        let range = end - start;
        if range.count_ones() != 1 || range.trailing_zeros() % 3 != 0 {
            return None;
        }
        if start % range != K::zero() {
            return None;
        }
        self.find_on_level(start, tree_level(range))
    }

    /// Position of a leaf in the cornerstone array that the octree was built from.
    pub fn cstone_index(&self, node: TreeNodeIndex) -> usize {
        assert!(self.is_leaf(node), "node {} is not a leaf", node);
        self.node_to_leaf[node]
    }

    /// Node index of leaf `leaf` of the cornerstone array.
    pub fn to_internal(&self, leaf: usize) -> TreeNodeIndex {
        self.leaf_to_node[leaf]
    }

    /// Copy the values of the leaf nodes into an array ordered like the cornerstone leaves.
    pub fn extract_leaves<T: Copy>(&self, node_values: &[T], leaf_values: &mut [T]) {
        assert_eq!(node_values.len(), self.num_tree_nodes());
        assert_eq!(leaf_values.len(), self.num_leaf_nodes());

        for (value, &node) in leaf_values.iter_mut().zip(self.leaf_to_node.iter()) {
            *value = node_values[node];
        }
    }

    /// Aggregate leaf values bottom-up.
    ///
    /// Leaf nodes receive their value from `leaf_values` (ordered like the cornerstone
    /// leaves). Each internal node receives `combine` of its eight children. Levels are
    /// processed from the deepest to the root, so every node sees complete subtrees.
    pub fn upsweep<T, F>(&self, leaf_values: &[T], node_values: &mut [T], combine: F)
    where
        T: Copy + Send + Sync,
        F: Fn(&[T]) -> T + Send + Sync,
    {
        assert_eq!(leaf_values.len(), self.num_leaf_nodes());
        assert_eq!(node_values.len(), self.num_tree_nodes());

        for (&value, &node) in leaf_values.iter().zip(self.leaf_to_node.iter()) {
            node_values[node] = value;
        }

        for level in (0..K::MAX_LEVEL).rev() {
            let range = self.level_range(level);
            if range.is_empty() {
                continue;
            }
            let child_offset = range.end;
            let (parents, children) = node_values.split_at_mut(child_offset);
            let children: &[T] = children;

            parents[range.clone()]
                .par_iter_mut()
                .zip(&self.first_child[range])
                .for_each(|(value, &first)| {
                    if first != NO_INDEX {
                        let first = first - child_offset;
                        *value = combine(&children[first..first + NSIBLINGS]);
                    }
                });
        }
    }

    /// Upsweep with summation, e.g. for particle counts.
    pub fn upsweep_sum<T>(&self, leaf_values: &[T], node_values: &mut [T])
    where
        T: Copy + Send + Sync + Zero,
    {
        self.upsweep(leaf_values, node_values, |children| {
            children.iter().fold(T::zero(), |acc, &value| acc + value)
        });
    }

    /// Upsweep with the maximum, e.g. for interaction radii.
    pub fn upsweep_max(&self, leaf_values: &[f64], node_values: &mut [f64]) {
        self.upsweep(leaf_values, node_values, |children| {
            children.iter().copied().fold(f64::MIN, f64::max)
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cornerstone::{root_tree, spanning_tree, uniform_tree, OctreeMaker},
        morton::key_space_size,
    };

    fn check_connectivity<K: SfcKey>(octree: &Octree<K>) {
        assert!(octree.is_root(0));
        assert_eq!(octree.code_start(0), K::zero());
        assert_eq!(octree.level(0), 0);

        for node in 0..octree.num_tree_nodes() {
            let prefix = octree.code_start(node);
            let level = octree.level(node);

            assert_eq!(octree.code_end(node), prefix + node_range::<K>(level));

            if !octree.is_leaf(node) {
                for octant in 0..NSIBLINGS {
                    let child = octree.child(node, octant);
                    assert_eq!(
                        prefix + K::from_u64(octant as u64) * node_range::<K>(level + 1),
                        octree.code_start(child)
                    );
                    assert_eq!(
                        octree.code_end(child) - octree.code_start(child),
                        node_range::<K>(level + 1)
                    );
                    assert_eq!(octree.parent(child), node);
                }
            }

            if !octree.is_root(node) {
                let parent = octree.parent(node);
                assert_eq!(octree.level(parent), level - 1);
                assert_eq!(octree.code_start(parent), enclosing_box_code(prefix, level - 1));
            } else {
                assert_eq!(octree.parent(node), 0);
            }
        }
    }

    fn max_depth_tree<K: SfcKey>() -> Vec<K> {
        spanning_tree(&[
            K::zero(),
            K::one(),
            key_space_size::<K>() - K::one(),
            key_space_size::<K>(),
        ])
    }

    fn irregular_l3<K: SfcKey>() -> Vec<K> {
        OctreeMaker::<K>::new()
            .divide(&[])
            .divide(&[0])
            .divide(&[0, 2])
            .divide(&[3])
            .make_tree()
    }

    #[test]
    fn test_root_node() {
        let octree = Octree::new(&root_tree::<u32>());

        assert_eq!(octree.num_leaf_nodes(), 1);
        assert_eq!(octree.num_tree_nodes(), 1);
        assert_eq!(octree.num_internal_nodes(), 0);
        assert_eq!(octree.code_start(0), 0);
        assert_eq!(octree.code_end(0), node_range::<u32>(0));
        assert_eq!(octree.parent(0), 0);
        assert!(octree.is_leaf(0));
    }

    fn octree_4x4x4<K: SfcKey>() {
        let tree = uniform_tree::<K>(2);
        let octree = Octree::new(&tree);

        assert_eq!(octree.num_internal_nodes(), (64 - 1) / 7);
        assert_eq!(octree.num_leaf_nodes(), 64);

        assert_eq!(octree.num_tree_nodes_on_level(0), 1);
        assert_eq!(octree.num_tree_nodes_on_level(1), 8);
        assert_eq!(octree.num_tree_nodes_on_level(2), 64);

        assert_eq!(
            octree.code_end(octree.to_internal(n_nodes(&tree) - 1)),
            node_range::<K>(0)
        );

        check_connectivity(&octree);
    }

    #[test]
    fn test_octree_4x4x4() {
        octree_4x4x4::<u32>();
        octree_4x4x4::<u64>();
    }

    fn irregular_l2<K: SfcKey>() {
        let tree = OctreeMaker::<K>::new().divide(&[]).divide(&[0]).make_tree();
        let octree = Octree::new(&tree);

        assert_eq!(octree.num_internal_nodes(), (15 - 1) / 7);
        assert_eq!(octree.num_leaf_nodes(), 15);

        assert_eq!(octree.num_tree_nodes_on_level(0), 1);
        assert_eq!(octree.num_tree_nodes_on_level(1), 8);
        assert_eq!(octree.num_tree_nodes_on_level(2), 8);

        check_connectivity(&octree);
    }

    #[test]
    fn test_irregular_l2() {
        irregular_l2::<u32>();
        irregular_l2::<u64>();
    }

    fn irregular<K: SfcKey>() {
        let octree = Octree::new(&irregular_l3::<K>());

        assert_eq!(octree.num_tree_nodes(), 33);
        assert_eq!(octree.num_leaf_nodes(), 29);
        assert_eq!(octree.num_internal_nodes(), 4);

        assert_eq!(octree.num_tree_nodes_on_level(0), 1);
        assert_eq!(octree.num_tree_nodes_on_level(1), 8);
        assert_eq!(octree.num_tree_nodes_on_level(2), 16);
        assert_eq!(octree.num_tree_nodes_on_level(3), 8);

        check_connectivity(&octree);
    }

    #[test]
    fn test_irregular_l3() {
        irregular::<u32>();
        irregular::<u64>();
    }

    #[test]
    fn test_max_depth_tree() {
        let octree = Octree::new(&max_depth_tree::<u32>());
        check_connectivity(&octree);
        assert_eq!(
            octree.num_internal_nodes(),
            (octree.num_leaf_nodes() - 1) / 7
        );

        let octree = Octree::new(&max_depth_tree::<u64>());
        check_connectivity(&octree);
    }

    fn locate<K: SfcKey>() {
        for tree in [max_depth_tree::<K>(), uniform_tree::<K>(4)] {
            let octree = Octree::new(&tree);
            for node in 0..octree.num_tree_nodes() {
                assert_eq!(
                    octree.locate(octree.code_start(node), octree.code_end(node)),
                    Some(node)
                );
            }
        }

        // A level-1 node that is not part of a root-only tree.
        let octree = Octree::new(&root_tree::<K>());
        assert_eq!(octree.locate(K::zero(), node_range::<K>(1)), None);
        // Not a valid node range.
        assert_eq!(octree.locate(K::zero(), K::from_u64(3)), None);
    }

    #[test]
    fn test_locate() {
        locate::<u32>();
        locate::<u64>();
    }

    fn cstone_index<K: SfcKey>() {
        let tree = max_depth_tree::<K>();
        let octree = Octree::new(&tree);

        for node in 0..octree.num_tree_nodes() {
            if octree.is_leaf(node) {
                let index = octree.cstone_index(node);
                assert_eq!(octree.code_start(node), tree[index]);
                assert_eq!(octree.to_internal(index), node);
            }
        }
    }

    #[test]
    fn test_cstone_index() {
        cstone_index::<u32>();
        cstone_index::<u64>();
    }

    fn extract_leaves<K: SfcKey>() {
        let tree = max_depth_tree::<K>();
        let octree = Octree::new(&tree);

        let prefixes: Vec<K> = (0..octree.num_tree_nodes())
            .map(|node| octree.code_start(node))
            .collect();

        let mut leaves = vec![K::zero(); octree.num_leaf_nodes()];
        octree.extract_leaves(&prefixes, &mut leaves);

        assert_eq!(leaves.as_slice(), &tree[..n_nodes(&tree)]);
    }

    #[test]
    fn test_extract_leaves() {
        extract_leaves::<u32>();
        extract_leaves::<u64>();
    }

    fn upsweep_sum_irregular<K: SfcKey>() {
        let tree = irregular_l3::<K>();
        let octree = Octree::new(&tree);

        let leaf_counts = vec![1u32; n_nodes(&tree)];
        let mut node_counts = vec![0u32; octree.num_tree_nodes()];

        octree.upsweep_sum(&leaf_counts, &mut node_counts);

        #[rustfmt::skip]
        let reference: Vec<u32> = vec![
            // L0
            29,
            // L1
            15, 1, 1, 8, 1, 1, 1, 1,
            // L2, children of 0 then children of 3
            1, 1, 8, 1, 1, 1, 1, 1,
            1, 1, 1, 1, 1, 1, 1, 1,
            // L3, children of 02
            1, 1, 1, 1, 1, 1, 1, 1,
        ];

        assert_eq!(node_counts, reference);
        assert_eq!(node_counts[0], 29);
    }

    #[test]
    fn test_upsweep_sum_irregular() {
        upsweep_sum_irregular::<u32>();
        upsweep_sum_irregular::<u64>();
    }

    #[test]
    fn test_upsweep_max() {
        let tree = irregular_l3::<u64>();
        let octree = Octree::new(&tree);

        let radii: Vec<f64> = (0..n_nodes(&tree)).map(|i| i as f64).collect();
        let mut node_radii = vec![0.0; octree.num_tree_nodes()];
        octree.upsweep_max(&radii, &mut node_radii);

        // The last leaf is the largest value and lies under the root only.
        assert_eq!(node_radii[0], (n_nodes(&tree) - 1) as f64);

        for node in 0..octree.num_tree_nodes() {
            if !octree.is_leaf(node) {
                let expected = (0..NSIBLINGS)
                    .map(|octant| node_radii[octree.child(node, octant)])
                    .fold(f64::MIN, f64::max);
                assert_eq!(node_radii[node], expected);
            }
        }
    }
}
