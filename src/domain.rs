//! The domain decomposition driver.

use std::ops::Range;

use mpi::traits::CommunicatorCollectives;

use crate::{
    assignment::{create_send_list, single_range_sfc_split, SpaceCurveAssignment},
    constants::{DEFAULT_BUCKET_SIZE, DEFAULT_RADIUS_FACTOR},
    cornerstone::n_nodes,
    error::{DomainError, Phase, SyncError},
    exchange::{exchange_particles, halo_exchange},
    geometry::PhysicalBox,
    global::{compute_global_bounding_box, compute_node_max_global, compute_octree_global},
    halos::{compute_send_recv_node_lists, find_halos, validate_radius},
    layout::{
        compute_layout_offsets, compute_local_node_ranges, create_halo_exchange_list,
        flatten_node_list, Layout,
    },
    morton::{compute_keys, SfcKey},
    octree::Octree,
    tools::{argsort, global_all, reorder, reorder_from},
};

const X: usize = 0;
const Y: usize = 1;
const Z: usize = 2;
const H: usize = 3;

/// Parameters of a [Domain].
#[derive(Clone, Debug, PartialEq)]
pub struct DomainConfig {
    /// Maximum number of particles per leaf of the global tree.
    pub bucket_size: usize,
    /// Periodicity of each axis.
    pub periodic: [bool; 3],
    /// Fixed extent of periodic axes and minimum extent of open axes.
    pub bounds: Option<PhysicalBox>,
    /// The interaction radius of a particle is `radius_factor * h`.
    pub radius_factor: f64,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            periodic: [false; 3],
            bounds: None,
            radius_factor: DEFAULT_RADIUS_FACTOR,
        }
    }
}

impl DomainConfig {
    /// Set the bucket size.
    pub fn with_bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = bucket_size;
        self
    }

    /// Set the periodicity of each axis.
    pub fn with_periodicity(mut self, periodic: [bool; 3]) -> Self {
        self.periodic = periodic;
        self
    }

    /// Set the box bounds.
    pub fn with_bounds(mut self, bounds: PhysicalBox) -> Self {
        self.bounds = Some(bounds);
        self
    }

    /// Set the ratio between interaction radius and smoothing length.
    pub fn with_radius_factor(mut self, radius_factor: f64) -> Self {
        self.radius_factor = radius_factor;
        self
    }
}

/// Checks that a rank can perform without communication.
///
/// `owned` is the range of the arrays holding the particles owned by this rank.
pub fn validate_input(
    config: &DomainConfig,
    arrays: [&[f64]; 4],
    extra: &[&mut Vec<f64>],
    owned: &Range<usize>,
) -> Result<(), DomainError> {
    let [x, y, z, h] = arrays;

    if x.len() != y.len() || x.len() != z.len() || x.len() != h.len() {
        return Err(DomainError::MismatchedLengths {
            x: x.len(),
            y: y.len(),
            z: z.len(),
            h: h.len(),
        });
    }

    if let Some((index, attribute)) = extra
        .iter()
        .enumerate()
        .find(|(_, attribute)| attribute.len() != x.len())
    {
        return Err(DomainError::MismatchedAttributeLength {
            index,
            len: attribute.len(),
            expected: x.len(),
        });
    }

    if owned.end > x.len() {
        return Err(DomainError::OwnedRangeOutOfBounds {
            end: owned.end,
            len: x.len(),
        });
    }

    if config.bucket_size == 0 {
        return Err(DomainError::InvalidBucketSize);
    }

    let periodic_box = config
        .bounds
        .map(|bounds| bounds.with_periodicity(config.periodic));

    for axis in 0..3 {
        if config.periodic[axis] {
            let bounds = periodic_box.ok_or(DomainError::MissingPeriodicBounds { axis })?;
            let length = bounds.lengths()[axis];
            if !(length.is_finite() && length > 0.0) {
                return Err(DomainError::DegenerateBox { axis, length });
            }
        }
    }

    let mut max_h: f64 = 0.0;
    for index in owned.clone() {
        if ![x[index], y[index], z[index], h[index]]
            .iter()
            .all(|value| value.is_finite())
        {
            return Err(DomainError::NonFiniteCoordinate { index });
        }
        max_h = max_h.max(h[index]);
    }

    if let Some(bounds) = periodic_box {
        validate_radius(config.radius_factor * max_h, &bounds)?;
    }

    Ok(())
}

/// A distributed set of particles, decomposed along a space-filling curve.
///
/// Every call of [Domain::sync] is collective over the communicator.
pub struct Domain<'c, K: SfcKey, C: CommunicatorCollectives> {
    config: DomainConfig,
    comm: &'c C,
    rank: usize,
    n_ranks: usize,
    owned: Option<Range<usize>>,
    bounding_box: Option<PhysicalBox>,
    tree: Vec<K>,
    node_counts: Vec<usize>,
    assignment: SpaceCurveAssignment,
    layout: Layout,
    halo_ranges: Vec<Range<usize>>,
}

impl<'c, K: SfcKey, C: CommunicatorCollectives> Domain<'c, K, C> {
    /// Create a new domain. No particles are owned before the first sync.
    pub fn new(config: DomainConfig, comm: &'c C) -> Self {
        let rank = comm.rank() as usize;
        let n_ranks = comm.size() as usize;

        Self {
            config,
            comm,
            rank,
            n_ranks,
            owned: None,
            bounding_box: None,
            tree: Vec::new(),
            node_counts: Vec::new(),
            assignment: SpaceCurveAssignment::new(n_ranks),
            layout: Layout::default(),
            halo_ranges: Vec::new(),
        }
    }

    /// First index of the owned particles.
    pub fn start_index(&self) -> usize {
        self.owned.as_ref().map_or(0, |owned| owned.start)
    }

    /// One past the last index of the owned particles.
    pub fn end_index(&self) -> usize {
        self.owned.as_ref().map_or(0, |owned| owned.end)
    }

    /// Number of owned particles.
    pub fn n_particles(&self) -> usize {
        self.end_index() - self.start_index()
    }

    /// Number of particles including halos, i.e. the length of the arrays after a sync.
    pub fn n_particles_with_halos(&self) -> usize {
        self.layout.total()
    }

    /// The global cornerstone tree of the last sync.
    pub fn tree(&self) -> &[K] {
        &self.tree
    }

    /// Global particle count of every leaf of [Domain::tree].
    pub fn node_counts(&self) -> &[usize] {
        &self.node_counts
    }

    /// Leaf ranges of all ranks.
    pub fn assignment(&self) -> &SpaceCurveAssignment {
        &self.assignment
    }

    /// The global bounding box of the last sync.
    pub fn bounding_box(&self) -> Option<PhysicalBox> {
        self.bounding_box
    }

    /// Offsets of the owned and halo leaves in the local arrays.
    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Index ranges of the local arrays that hold halo copies.
    pub fn halo_ranges(&self) -> &[Range<usize>] {
        &self.halo_ranges
    }

    /// The domain configuration.
    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    fn agree<T>(
        &self,
        phase: Phase,
        result: Result<T, DomainError>,
        peer_error: DomainError,
    ) -> Result<T, SyncError> {
        let all_ok = global_all(result.is_ok(), self.comm);
        match result {
            Err(cause) => Err(SyncError::new(self.rank, phase, cause)),
            Ok(_) if !all_ok => Err(SyncError::new(self.rank, phase, peer_error)),
            Ok(value) => Ok(value),
        }
    }

    /// Redistribute the particles and refresh the halos.
    ///
    /// On the first call all particles in the arrays are owned by the calling rank. Afterwards
    /// the arrays hold the owned particles in `start_index()..end_index()`, sorted by key,
    /// surrounded by halo copies.
    pub fn sync(
        &mut self,
        x: &mut Vec<f64>,
        y: &mut Vec<f64>,
        z: &mut Vec<f64>,
        h: &mut Vec<f64>,
    ) -> Result<(), SyncError> {
        self.sync_with_attributes(x, y, z, h, &mut [])
    }

    /// Like [Domain::sync], but also moves the arrays in `extra` along with the particles.
    ///
    /// If the halo exchange fails with [DomainError::MessageSizeMismatch] (or
    /// [DomainError::PeerFailed] on the other ranks), the owned particles have already been
    /// redistributed and the halo slots of every array are zero.
    pub fn sync_with_attributes(
        &mut self,
        x: &mut Vec<f64>,
        y: &mut Vec<f64>,
        z: &mut Vec<f64>,
        h: &mut Vec<f64>,
        extra: &mut [&mut Vec<f64>],
    ) -> Result<(), SyncError> {
        let rank = self.rank;
        let comm = self.comm;

        let input = self.owned.clone().unwrap_or(0..x.len());

        let validation = validate_input(
            &self.config,
            [&x[..], &y[..], &z[..], &h[..]],
            extra,
            &input,
        );
        self.agree(
            Phase::Validation,
            validation,
            DomainError::PeerValidationFailed,
        )?;

        let mut arrays: Vec<&mut Vec<f64>> = Vec::with_capacity(4 + extra.len());
        arrays.extend([x, y, z, h]);
        arrays.extend(extra.iter_mut().map(|attribute| &mut **attribute));

        let bounding_box = compute_global_bounding_box(
            &arrays[X][input.clone()],
            &arrays[Y][input.clone()],
            &arrays[Z][input.clone()],
            self.config.bounds.as_ref(),
            self.config.periodic,
            comm,
        )
        .map_err(|cause| SyncError::new(rank, Phase::BoundingBox, cause))?;

        log::debug!("Rank {} {}: {}", rank, Phase::BoundingBox, bounding_box);

        let keys: Vec<K> = compute_keys(
            &arrays[X][input.clone()],
            &arrays[Y][input.clone()],
            &arrays[Z][input.clone()],
            &bounding_box,
        );
        let order = argsort(&keys);
        let sorted_keys = reorder(&keys, &order);
        for array in arrays.iter_mut() {
            reorder_from(&mut array[..], &order, input.start);
        }

        let (tree, counts) = compute_octree_global(&sorted_keys, self.config.bucket_size, comm);
        let assignment = single_range_sfc_split(&counts, self.n_ranks);

        log::debug!(
            "Rank {} {}: {} leaves, {} particles assigned to leaves {:?}.",
            rank,
            Phase::GlobalTree,
            n_nodes(&tree),
            assignment.total_count(rank),
            assignment.ranges(rank)
        );
        if assignment.n_leaves(rank) == 0 {
            log::warn!("Rank {} has not been assigned any leaves.", rank);
        }

        let leaf_radii = compute_node_max_global(
            &tree,
            &sorted_keys,
            &arrays[H][input.clone()],
            self.config.radius_factor,
            comm,
        );
        let octree = Octree::new(&tree);
        let mut node_radii = vec![0.0; octree.num_tree_nodes()];
        octree.upsweep_max(&leaf_radii, &mut node_radii);

        let pairs = find_halos(&octree, &node_radii, &bounding_box, &assignment, rank);
        let node_lists = compute_send_recv_node_lists(&pairs, &assignment);

        let local_nodes = compute_local_node_ranges(assignment.ranges(rank));
        let halo_nodes = flatten_node_list(&node_lists.incoming);
        let layout = compute_layout_offsets(&local_nodes, &halo_nodes, &counts);
        let owned = layout.leaf_range_to_indices(&assignment.span(rank));

        log::debug!(
            "Rank {} {}: {} halo leaves, {} halo particles.",
            rank,
            Phase::HaloDiscovery,
            halo_nodes.len(),
            layout.total() - owned.len()
        );

        let send_list = create_send_list(&assignment, &tree, &sorted_keys);
        exchange_particles(
            &send_list,
            rank,
            input,
            owned.clone(),
            layout.total(),
            &mut arrays,
            comm,
        );

        let keys: Vec<K> = compute_keys(
            &arrays[X][owned.clone()],
            &arrays[Y][owned.clone()],
            &arrays[Z][owned.clone()],
            &bounding_box,
        );
        let order = argsort(&keys);
        for array in arrays.iter_mut() {
            reorder_from(&mut array[..], &order, owned.start);
        }

        debug_assert!({
            let range = assignment.span(rank);
            keys.iter()
                .all(|&key| tree[range.start] <= key && key < tree[range.end])
        });

        self.owned = Some(owned);
        self.bounding_box = Some(bounding_box);

        let incoming = create_halo_exchange_list(&node_lists.incoming, &layout);
        let outgoing = create_halo_exchange_list(&node_lists.outgoing, &layout);

        let result = halo_exchange(&incoming, &outgoing, &mut arrays, comm);

        self.tree = tree;
        self.node_counts = counts;
        self.assignment = assignment;
        self.layout = layout;
        self.halo_ranges = incoming.into_iter().flatten().collect();

        self.agree(Phase::HaloExchange, result, DomainError::PeerFailed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn particles(n: usize) -> [Vec<f64>; 4] {
        let values = (0..n).map(|i| i as f64 / n as f64).collect::<Vec<_>>();
        [values.clone(), values.clone(), values, vec![0.01; n]]
    }

    fn check(
        config: &DomainConfig,
        data: &[Vec<f64>; 4],
        owned: Range<usize>,
    ) -> Result<(), DomainError> {
        validate_input(
            config,
            [&data[0][..], &data[1][..], &data[2][..], &data[3][..]],
            &[],
            &owned,
        )
    }

    #[test]
    fn test_config_builder() {
        let bounds = PhysicalBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let config = DomainConfig::default()
            .with_bucket_size(16)
            .with_periodicity([true, false, false])
            .with_bounds(bounds)
            .with_radius_factor(1.5);

        assert_eq!(config.bucket_size, 16);
        assert_eq!(config.periodic, [true, false, false]);
        assert_eq!(config.bounds, Some(bounds));
        assert_eq!(config.radius_factor, 1.5);

        let default = DomainConfig::default();
        assert_eq!(default.bucket_size, DEFAULT_BUCKET_SIZE);
        assert_eq!(default.radius_factor, DEFAULT_RADIUS_FACTOR);
        assert!(default.bounds.is_none());
    }

    #[test]
    fn test_validate_lengths() {
        let config = DomainConfig::default();
        let mut data = particles(10);
        assert!(check(&config, &data, 0..10).is_ok());

        data[3].pop();
        assert_eq!(
            check(&config, &data, 0..10),
            Err(DomainError::MismatchedLengths {
                x: 10,
                y: 10,
                z: 10,
                h: 9
            })
        );

        let data = particles(10);
        assert_eq!(
            check(&config, &data, 2..12),
            Err(DomainError::OwnedRangeOutOfBounds { end: 12, len: 10 })
        );

        let mut attribute = vec![0.0; 9];
        let extra = [&mut attribute];
        assert_eq!(
            validate_input(
                &config,
                [&data[0][..], &data[1][..], &data[2][..], &data[3][..]],
                &extra,
                &(0..10)
            ),
            Err(DomainError::MismatchedAttributeLength {
                index: 0,
                len: 9,
                expected: 10
            })
        );
    }

    #[test]
    fn test_validate_configuration() {
        let data = particles(10);

        let config = DomainConfig::default().with_bucket_size(0);
        assert_eq!(check(&config, &data, 0..10), Err(DomainError::InvalidBucketSize));

        let config = DomainConfig::default().with_periodicity([false, true, false]);
        assert_eq!(
            check(&config, &data, 0..10),
            Err(DomainError::MissingPeriodicBounds { axis: 1 })
        );
    }

    #[test]
    fn test_validate_values() {
        let config = DomainConfig::default();
        let mut data = particles(10);
        data[1][7] = f64::NAN;
        assert_eq!(
            check(&config, &data, 0..10),
            Err(DomainError::NonFiniteCoordinate { index: 7 })
        );
        // Only the owned range is checked.
        assert!(check(&config, &data, 0..7).is_ok());
    }

    #[test]
    fn test_validate_radius_against_periodic_length() {
        let bounds = PhysicalBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let config = DomainConfig::default()
            .with_periodicity([false, false, true])
            .with_bounds(bounds);

        let mut data = particles(10);
        assert!(check(&config, &data, 0..10).is_ok());

        // With the default radius factor of 2 the box must be longer than 4 h.
        data[3][4] = 0.25;
        assert!(matches!(
            check(&config, &data, 0..10),
            Err(DomainError::RadiusTooLarge { axis: 2, .. })
        ));

        data[3][4] = 0.249;
        assert!(check(&config, &data, 0..10).is_ok());
    }
}
