//! Error types of the domain decomposition.

use thiserror::Error;

/// Failures that abort a [crate::domain::Domain::sync] call.
#[allow(missing_docs)]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("array lengths do not match: x = {x}, y = {y}, z = {z}, h = {h}")]
    MismatchedLengths {
        x: usize,
        y: usize,
        z: usize,
        h: usize,
    },
    #[error("attribute array {index} has length {len}, expected {expected}")]
    MismatchedAttributeLength {
        index: usize,
        len: usize,
        expected: usize,
    },
    #[error("owned range ends at {end} but the arrays hold only {len} particles")]
    OwnedRangeOutOfBounds { end: usize, len: usize },
    #[error("bucket size must be at least one")]
    InvalidBucketSize,
    #[error("bounding box has degenerate extent {length} along axis {axis}")]
    DegenerateBox { axis: usize, length: f64 },
    #[error("axis {axis} is periodic but no fixed bounds were configured")]
    MissingPeriodicBounds { axis: usize },
    #[error(
        "interaction radius {radius} is not smaller than half the periodic length {length} along axis {axis}"
    )]
    RadiusTooLarge {
        axis: usize,
        radius: f64,
        length: f64,
    },
    #[error("particle {index} has a non-finite coordinate or smoothing length")]
    NonFiniteCoordinate { index: usize },
    #[error("input validation failed on another rank")]
    PeerValidationFailed,
    #[error("another rank failed in the same phase")]
    PeerFailed,
    #[error("expected {expected} elements from rank {rank}, received {received}")]
    MessageSizeMismatch {
        rank: usize,
        expected: usize,
        received: usize,
    },
}

/// The phases of a synchronization step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Local input checks and their global agreement.
    Validation,
    /// Global bounding box reduction.
    BoundingBox,
    /// Global cornerstone tree and leaf counts.
    GlobalTree,
    /// Halo radius reduction and collision detection.
    HaloDiscovery,
    /// Refresh of halo copies.
    HaloExchange,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Validation => "validation",
            Phase::BoundingBox => "bounding box",
            Phase::GlobalTree => "global tree",
            Phase::HaloDiscovery => "halo discovery",
            Phase::HaloExchange => "halo exchange",
        };
        write!(f, "{}", name)
    }
}

/// A [DomainError] together with the rank and the phase in which it occurred.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("sync failed on rank {rank} during {phase}: {cause}")]
pub struct SyncError {
    /// Rank reporting the error.
    pub rank: usize,
    /// Phase in which the error occurred.
    pub phase: Phase,
    /// The underlying error.
    #[source]
    pub cause: DomainError,
}

impl SyncError {
    /// Attach rank and phase to an error.
    pub fn new(rank: usize, phase: Phase, cause: DomainError) -> Self {
        Self { rank, phase, cause }
    }
}
