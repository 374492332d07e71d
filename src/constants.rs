//! Global constants.

/// Number of children of an internal octree node.
pub const NSIBLINGS: usize = 8;

/// Number of spatial dimensions.
pub const NDIM: usize = 3;

/// Deepest level of an octree with 32 bit keys (3 * 10 = 30 key bits).
pub const MAX_LEVEL_32: u32 = 10;

/// Deepest level of an octree with 64 bit keys (3 * 21 = 63 key bits).
pub const MAX_LEVEL_64: u32 = 21;

/// Default maximum number of particles per leaf.
pub const DEFAULT_BUCKET_SIZE: usize = 64;

/// Default ratio between the interaction radius and the smoothing length.
///
/// SPH kernels have compact support of two smoothing lengths.
pub const DEFAULT_RADIUS_FACTOR: f64 = 2.0;
