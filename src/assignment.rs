//! Assignment of the global leaf sequence to ranks.

use std::ops::Range;

use itertools::Itertools;

use crate::{cornerstone::n_nodes, morton::SfcKey, tools::sort_to_bins};

/// Leaf ranges and particle counts assigned to each rank.
///
/// A rank may own several ranges of leaves. The ranges of all ranks together partition
/// the leaves of the global cornerstone tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpaceCurveAssignment {
    ranges: Vec<Vec<Range<usize>>>,
    counts: Vec<usize>,
}

impl SpaceCurveAssignment {
    /// An assignment for `n_ranks` ranks without any leaves.
    pub fn new(n_ranks: usize) -> Self {
        Self {
            ranges: vec![Vec::new(); n_ranks],
            counts: vec![0; n_ranks],
        }
    }

    /// Assign the leaves `range` holding `count` particles to `rank`.
    pub fn add_range(&mut self, rank: usize, range: Range<usize>, count: usize) {
        self.ranges[rank].push(range);
        self.counts[rank] += count;
    }

    /// Number of ranks.
    pub fn n_ranks(&self) -> usize {
        self.ranges.len()
    }

    /// Leaf ranges of `rank`.
    pub fn ranges(&self, rank: usize) -> &[Range<usize>] {
        &self.ranges[rank]
    }

    /// Number of particles assigned to `rank`.
    pub fn total_count(&self, rank: usize) -> usize {
        self.counts[rank]
    }

    /// Number of leaves assigned to `rank`.
    pub fn n_leaves(&self, rank: usize) -> usize {
        self.ranges[rank].iter().map(|range| range.len()).sum()
    }

    /// The smallest range of leaves containing everything assigned to `rank`.
    pub fn span(&self, rank: usize) -> Range<usize> {
        let ranges = &self.ranges[rank];
        match (ranges.first(), ranges.last()) {
            (Some(first), Some(last)) => first.start..last.end,
            _ => 0..0,
        }
    }

    /// The rank owning `leaf`, if any.
    pub fn find_rank(&self, leaf: usize) -> Option<usize> {
        self.ranges
            .iter()
            .position(|ranges| ranges.iter().any(|range| range.contains(&leaf)))
    }

    /// Check that the ranges of all ranks cover `[0, n_leaves)` exactly once.
    pub fn is_partition(&self, n_leaves: usize) -> bool {
        let sorted = self
            .ranges
            .iter()
            .flatten()
            .filter(|range| !range.is_empty())
            .sorted_by_key(|range| range.start)
            .collect_vec();

        let mut expected_start = 0;
        for range in sorted {
            if range.start != expected_start {
                return false;
            }
            expected_start = range.end;
        }

        expected_start == n_leaves
    }
}

/// Split the leaves into one contiguous range per rank with balanced particle counts.
///
/// The boundary between rank `r - 1` and rank `r` is placed at the leaf boundary whose
/// prefix count is closest to `r * total / n_ranks`. Each rank therefore deviates from the
/// average by at most the largest leaf count.
pub fn single_range_sfc_split(counts: &[usize], n_ranks: usize) -> SpaceCurveAssignment {
    assert!(n_ranks > 0);

    let n_leaves = counts.len();

    // prefix[i] is the number of particles in leaves 0..i.
    let prefix: Vec<usize> = std::iter::once(0)
        .chain(counts.iter().scan(0, |acc, &count| {
            *acc += count;
            Some(*acc)
        }))
        .collect();

    let total = prefix[n_leaves] as i128;
    let ranks = n_ranks as i128;

    // Signed distance of prefix[i] to the target of boundary r, scaled by n_ranks.
    let distance = |i: usize, r: usize| prefix[i] as i128 * ranks - r as i128 * total;

    let mut cuts = vec![0; n_ranks + 1];
    cuts[n_ranks] = n_leaves;

    for r in 1..n_ranks {
        let above = prefix.partition_point(|&p| (p as i128) * ranks < r as i128 * total);
        let cut = if above == 0 {
            0
        } else if above > n_leaves {
            n_leaves
        } else if -distance(above - 1, r) <= distance(above, r) {
            above - 1
        } else {
            above
        };
        cuts[r] = cut.max(cuts[r - 1]);
    }

    let mut assignment = SpaceCurveAssignment::new(n_ranks);
    for (rank, (&first, &last)) in cuts.iter().tuple_windows().enumerate() {
        assignment.add_range(rank, first..last, prefix[last] - prefix[first]);
    }

    debug_assert!(assignment.is_partition(n_leaves));

    assignment
}

/// Index ranges into a locally sorted particle array destined for one rank.
pub type SendManifest = Vec<Range<usize>>;

/// One [SendManifest] per destination rank.
pub type SendList = Vec<SendManifest>;

/// Total number of particles in a manifest.
pub fn manifest_count(manifest: &SendManifest) -> usize {
    manifest.iter().map(|range| range.len()).sum()
}

/// Determine for every rank which of the local particles fall into its assigned key ranges.
///
/// `sorted_keys` are the keys of the local particles in ascending order. The index ranges of
/// the returned list refer to positions in `sorted_keys`.
pub fn create_send_list<K: SfcKey>(
    assignment: &SpaceCurveAssignment,
    tree: &[K],
    sorted_keys: &[K],
) -> SendList {
    debug_assert!(assignment.is_partition(n_nodes(tree)));

    let n_ranks = assignment.n_ranks();

    // Non-empty leaf ranges of all ranks in key order, tagged with their rank.
    let ranges = (0..n_ranks)
        .flat_map(|rank| {
            assignment
                .ranges(rank)
                .iter()
                .filter(|range| !range.is_empty())
                .map(move |range| (rank, range.start))
        })
        .sorted_unstable_by_key(|&(_, start)| start)
        .collect_vec();

    let bins = ranges.iter().map(|&(_, start)| tree[start]).collect_vec();
    let counts = sort_to_bins(sorted_keys, &bins);

    let mut send_list = vec![SendManifest::new(); n_ranks];
    let mut offset = 0;

    for (&(rank, _), count) in ranges.iter().zip(counts) {
        if count > 0 {
            send_list[rank].push(offset..offset + count);
        }
        offset += count;
    }

    send_list
}
