//! Placement of owned and halo particles in the local arrays.
//!
//! After a sync the local arrays hold the particles of every present leaf, that is of every
//! assigned leaf and every incoming halo leaf, ordered by leaf index. The particles of the
//! present leaf `present_nodes[i]` occupy `offsets[i]..offsets[i + 1]`.

use std::ops::Range;

use itertools::Itertools;

/// Node-to-offset table of the local arrays.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Layout {
    /// Sorted indices of the leaves with particles present on this rank.
    pub present_nodes: Vec<usize>,
    /// Exclusive prefix sum of the leaf counts over `present_nodes`, one entry longer.
    pub offsets: Vec<usize>,
}

impl Layout {
    /// Total number of particles, owned and halo.
    pub fn total(&self) -> usize {
        *self.offsets.last().unwrap_or(&0)
    }

    /// Index range of the particles of `leaf`, or `None` if the leaf is not present.
    pub fn node_range(&self, leaf: usize) -> Option<Range<usize>> {
        self.present_nodes
            .binary_search(&leaf)
            .ok()
            .map(|position| self.offsets[position]..self.offsets[position + 1])
    }

    /// Index range covering the particles of the leaves `leaves`, all of which must be present.
    ///
    /// An empty leaf range maps to an empty index range at the position where its leaves would
    /// be stored.
    pub fn leaf_range_to_indices(&self, leaves: &Range<usize>) -> Range<usize> {
        let first = self.present_nodes.partition_point(|&node| node < leaves.start);
        let last = self.present_nodes.partition_point(|&node| node < leaves.end);
        debug_assert_eq!(last - first, leaves.len());
        self.offsets[first]..self.offsets[last]
    }
}

/// Merge the per-rank leaf lists into one sorted list without duplicates.
pub fn flatten_node_list(lists: &[Vec<usize>]) -> Vec<usize> {
    lists
        .iter()
        .kmerge()
        .copied()
        .dedup()
        .collect()
}

/// The leaves of the assigned ranges in ascending order.
pub fn compute_local_node_ranges(ranges: &[Range<usize>]) -> Vec<usize> {
    ranges
        .iter()
        .sorted_by_key(|range| range.start)
        .flat_map(|range| range.clone())
        .collect()
}

/// Compute the layout of the assigned leaves and the incoming halo leaves.
///
/// `counts` are the global particle counts of all leaves.
pub fn compute_layout_offsets(
    local_nodes: &[usize],
    halo_nodes: &[usize],
    counts: &[usize],
) -> Layout {
    let present_nodes = local_nodes
        .iter()
        .merge(halo_nodes.iter())
        .copied()
        .dedup()
        .collect_vec();

    debug_assert_eq!(present_nodes.len(), local_nodes.len() + halo_nodes.len());

    let offsets = std::iter::once(0)
        .chain(present_nodes.iter().scan(0, |acc, &node| {
            *acc += counts[node];
            Some(*acc)
        }))
        .collect_vec();

    Layout {
        present_nodes,
        offsets,
    }
}

/// Translate per-rank leaf lists into per-rank index ranges of the local arrays.
///
/// Consecutive leaves whose particles are adjacent in memory are merged into one range.
/// Leaves without particles are dropped.
pub fn create_halo_exchange_list(
    node_lists: &[Vec<usize>],
    layout: &Layout,
) -> Vec<Vec<Range<usize>>> {
    node_lists
        .iter()
        .map(|nodes| {
            let mut ranges: Vec<Range<usize>> = Vec::with_capacity(nodes.len());
            for &node in nodes {
                let range = layout
                    .node_range(node)
                    .expect("halo leaves are part of the layout");
                if range.is_empty() {
                    continue;
                }
                match ranges.last_mut() {
                    Some(last) if last.end == range.start => last.end = range.end,
                    _ => ranges.push(range),
                }
            }
            ranges
        })
        .collect()
}

/// Total number of elements in a list of ranges.
pub fn range_count(ranges: &[Range<usize>]) -> usize {
    ranges.iter().map(|range| range.len()).sum()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_flatten_node_list() {
        let lists = vec![vec![1, 4, 9], vec![], vec![2, 4, 10]];
        assert_eq!(flatten_node_list(&lists), vec![1, 2, 4, 9, 10]);
    }

    #[test]
    fn test_local_node_ranges() {
        assert_eq!(compute_local_node_ranges(&[5..7, 1..3]), vec![1, 2, 5, 6]);
        assert!(compute_local_node_ranges(&[4..4]).is_empty());
    }

    #[test]
    fn test_layout_offsets() {
        // Leaves 0..10, owned leaves 4..7, halos below and above.
        let counts = vec![3, 1, 0, 2, 5, 4, 6, 2, 2, 7];
        let local = compute_local_node_ranges(&[4..7]);
        let halos = vec![1, 2, 3, 8];

        let layout = compute_layout_offsets(&local, &halos, &counts);
        assert_eq!(layout.present_nodes, vec![1, 2, 3, 4, 5, 6, 8]);
        assert_eq!(layout.offsets, vec![0, 1, 1, 3, 8, 12, 18, 20]);
        assert_eq!(layout.total(), 20);

        assert_eq!(layout.leaf_range_to_indices(&(4..7)), 3..18);
        assert_eq!(layout.node_range(8), Some(18..20));
        assert_eq!(layout.node_range(7), None);
    }

    #[test]
    fn test_owned_range_without_lower_halos() {
        let counts = vec![3, 1, 2];
        let layout = compute_layout_offsets(&[0, 1], &[2], &counts);
        assert_eq!(layout.leaf_range_to_indices(&(0..2)), 0..4);
        assert_eq!(layout.leaf_range_to_indices(&(0..0)), 0..0);
    }

    #[test]
    fn test_halo_exchange_list() {
        let counts = vec![3, 1, 0, 2, 5, 4, 6, 2, 2, 7];
        let layout = compute_layout_offsets(&[4, 5, 6], &[1, 2, 3, 8], &counts);

        let incoming = vec![vec![1, 2, 3], vec![], vec![8]];
        let ranges = create_halo_exchange_list(&incoming, &layout);
        assert_eq!(ranges, vec![vec![0..3], vec![], vec![18..20]]);

        let outgoing = vec![vec![4, 6], vec![5]];
        let ranges = create_halo_exchange_list(&outgoing, &layout);
        assert_eq!(ranges, vec![vec![3..8, 12..18], vec![8..12]]);
        assert_eq!(range_count(&ranges[0]), 11);
    }
}
