//! Routines for working with Morton keys.
//!
//! A key of width `w` bits stores `MAX_LEVEL` octal digits. The most significant
//! octal digit selects the octant on level 1, the least significant one the octant
//! on the deepest level. Within each digit the x-bit is the most significant one,
//! followed by the y-bit and the z-bit.

use std::fmt::{Debug, Display};

use mpi::traits::Equivalence;
use num::{PrimInt, Unsigned};
use rayon::prelude::*;

use crate::{
    constants::{MAX_LEVEL_32, MAX_LEVEL_64, NDIM},
    geometry::PhysicalBox,
};

/// Integer type that can serve as a space-filling-curve key.
pub trait SfcKey:
    PrimInt + Unsigned + Equivalence + Debug + Display + Default + Send + Sync + 'static
{
    /// The deepest octree level that can be represented.
    const MAX_LEVEL: u32;

    /// Convert from `u64`, truncating bits that do not fit.
    fn from_u64(value: u64) -> Self;

    /// Convert to `u64`.
    fn to_u64(self) -> u64;
}

impl SfcKey for u32 {
    const MAX_LEVEL: u32 = MAX_LEVEL_32;

    fn from_u64(value: u64) -> Self {
        value as u32
    }

    fn to_u64(self) -> u64 {
        self as u64
    }
}

impl SfcKey for u64 {
    const MAX_LEVEL: u32 = MAX_LEVEL_64;

    fn from_u64(value: u64) -> Self {
        value
    }

    fn to_u64(self) -> u64 {
        self
    }
}

/// Extent of the key range of a single octree node on `level`.
pub fn node_range<K: SfcKey>(level: u32) -> K {
    assert!(level <= K::MAX_LEVEL);
    K::one() << (3 * (K::MAX_LEVEL - level)) as usize
}

/// The number of keys in the key space, i.e. the last element of every cornerstone tree.
pub fn key_space_size<K: SfcKey>() -> K {
    node_range::<K>(0)
}

/// Number of cells along one axis on the deepest level.
pub fn grid_size<K: SfcKey>() -> u64 {
    1 << K::MAX_LEVEL
}

/// Return the level of a node whose key range has length `range`.
///
/// The range must be a power of 8.
pub fn tree_level<K: SfcKey>(range: K) -> u32 {
    debug_assert!(range.count_ones() == 1 && range.trailing_zeros() % 3 == 0);
    K::MAX_LEVEL - range.trailing_zeros() / 3
}

/// Round `key` down to the first key of its ancestor cell on `level`.
pub fn enclosing_box_code<K: SfcKey>(key: K, level: u32) -> K {
    key & !(node_range::<K>(level) - K::one())
}

/// Return the octal digit of `key` on `level` (1-based), i.e. the octant of
/// the level-`level` ancestor of `key` within its parent.
pub fn octal_digit<K: SfcKey>(key: K, level: u32) -> usize {
    debug_assert!(level >= 1 && level <= K::MAX_LEVEL);
    ((key >> (3 * (K::MAX_LEVEL - level)) as usize).to_u64() & 7) as usize
}

/// Spread the lower 21 bits of `x` so that two zero bits separate each pair of bits.
fn expand_bits(mut x: u64) -> u64 {
    x &= 0x1fffff;
    x = (x | x << 32) & 0x1f00000000ffff;
    x = (x | x << 16) & 0x1f0000ff0000ff;
    x = (x | x << 8) & 0x100f00f00f00f00f;
    x = (x | x << 4) & 0x10c30c30c30c30c3;
    x = (x | x << 2) & 0x1249249249249249;
    x
}

/// Inverse of [expand_bits].
fn compact_bits(mut x: u64) -> u64 {
    x &= 0x1249249249249249;
    x = (x ^ (x >> 2)) & 0x10c30c30c30c30c3;
    x = (x ^ (x >> 4)) & 0x100f00f00f00f00f;
    x = (x ^ (x >> 8)) & 0x1f0000ff0000ff;
    x = (x ^ (x >> 16)) & 0x1f00000000ffff;
    x = (x ^ (x >> 32)) & 0x1fffff;
    x
}

/// Encode integer coordinates on the deepest level into a key.
pub fn encode_morton<K: SfcKey>(index: [u64; 3]) -> K {
    let max_index = grid_size::<K>();
    assert!(index.iter().all(|&i| i < max_index));

    K::from_u64(expand_bits(index[0]) << 2 | expand_bits(index[1]) << 1 | expand_bits(index[2]))
}

/// Decode a key into the integer coordinates of its anchor on the deepest level.
pub fn decode_key<K: SfcKey>(key: K) -> [u64; 3] {
    let key = key.to_u64();
    [
        compact_bits(key >> 2),
        compact_bits(key >> 1),
        compact_bits(key),
    ]
}

/// Compute the key of a physical point.
///
/// Coordinates on periodic axes are first mapped into the primary image of the box,
/// so that all periodic images of a point share one key. On open axes a coordinate
/// outside of `[min, max]` is clamped to the boundary cell.
pub fn encode<K: SfcKey>(point: [f64; 3], bounding_box: &PhysicalBox) -> K {
    let reference = bounding_box.physical_to_reference(bounding_box.wrap(point));
    let n = grid_size::<K>();

    let mut index = [0u64; 3];
    for (i, r) in index.iter_mut().zip(reference) {
        let scaled = (r * n as f64).floor();
        *i = if scaled <= 0.0 {
            0
        } else {
            (scaled as u64).min(n - 1)
        };
    }

    encode_morton(index)
}

/// Return the physical position of the anchor (lowest corner) of the deepest-level
/// cell addressed by `key`.
pub fn decode<K: SfcKey>(key: K, bounding_box: &PhysicalBox) -> [f64; 3] {
    let n = grid_size::<K>() as f64;
    let index = decode_key(key);
    bounding_box.reference_to_physical([
        index[0] as f64 / n,
        index[1] as f64 / n,
        index[2] as f64 / n,
    ])
}

/// Compute the keys of all particles in parallel.
pub fn compute_keys<K: SfcKey>(
    x: &[f64],
    y: &[f64],
    z: &[f64],
    bounding_box: &PhysicalBox,
) -> Vec<K> {
    assert!(x.len() == y.len() && x.len() == z.len());

    (0..x.len())
        .into_par_iter()
        .map(|i| encode([x[i], y[i], z[i]], bounding_box))
        .collect()
}

/// A half-open box of integer coordinates on the deepest level.
///
/// Boxes may extend beyond `[0, grid_size)` on periodic axes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IBox {
    /// Lower corner (inclusive).
    pub min: [i64; NDIM],
    /// Upper corner (exclusive).
    pub max: [i64; NDIM],
}

impl IBox {
    /// Create a new box.
    pub fn new(min: [i64; NDIM], max: [i64; NDIM]) -> Self {
        Self { min, max }
    }

    /// The box covered by the octree node with key range `[start, end)`.
    pub fn from_key_range<K: SfcKey>(start: K, end: K) -> Self {
        let level = tree_level(end - start);
        let width = 1i64 << (K::MAX_LEVEL - level);
        let anchor = decode_key(start);

        Self {
            min: [anchor[0] as i64, anchor[1] as i64, anchor[2] as i64],
            max: [
                anchor[0] as i64 + width,
                anchor[1] as i64 + width,
                anchor[2] as i64 + width,
            ],
        }
    }

    /// Grow the box by `margin[d]` cells on both sides along every axis.
    pub fn expand(&self, margin: [i64; NDIM]) -> Self {
        Self {
            min: [
                self.min[0] - margin[0],
                self.min[1] - margin[1],
                self.min[2] - margin[2],
            ],
            max: [
                self.max[0] + margin[0],
                self.max[1] + margin[1],
                self.max[2] + margin[2],
            ],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_node_range_and_level() {
        assert_eq!(node_range::<u32>(0), 1 << 30);
        assert_eq!(node_range::<u64>(0), 1 << 63);
        assert_eq!(node_range::<u32>(10), 1);
        assert_eq!(node_range::<u64>(1), 1 << 60);

        for level in 0..=10 {
            assert_eq!(tree_level(node_range::<u32>(level)), level);
        }
        for level in 0..=21 {
            assert_eq!(tree_level(node_range::<u64>(level)), level);
        }
    }

    #[test]
    fn test_enclosing_box_code() {
        let key: u32 = 3 * node_range::<u32>(1) + 5 * node_range::<u32>(2) + 17;
        assert_eq!(enclosing_box_code(key, 0), 0);
        assert_eq!(enclosing_box_code(key, 1), 3 * node_range::<u32>(1));
        assert_eq!(
            enclosing_box_code(key, 2),
            3 * node_range::<u32>(1) + 5 * node_range::<u32>(2)
        );

        assert_eq!(octal_digit(key, 1), 3);
        assert_eq!(octal_digit(key, 2), 5);
    }

    #[test]
    fn test_encode_decode_index() {
        let index = [1023, 0, 517];
        let key: u32 = encode_morton(index);
        assert_eq!(decode_key(key), index);

        let index = [(1 << 21) - 1, 12345, 1];
        let key: u64 = encode_morton(index);
        assert_eq!(decode_key(key), index);

        // The x-bit is the most significant bit of each octal digit.
        let key: u32 = encode_morton([1 << 9, 0, 0]);
        assert_eq!(key, 4 * node_range::<u32>(1));
        let key: u32 = encode_morton([0, 0, 1 << 9]);
        assert_eq!(key, node_range::<u32>(1));
    }

    #[test]
    fn test_physical_roundtrip() {
        let bounding_box = PhysicalBox::new([-1.0, 0.0, 2.0, 1.0, 4.0, 3.0]);
        let point = [0.3, 2.7, 2.25];

        let key: u64 = encode(point, &bounding_box);
        let decoded = decode(key, &bounding_box);

        let lengths = bounding_box.lengths();
        for d in 0..3 {
            let cell = lengths[d] / grid_size::<u64>() as f64;
            assert!(decoded[d] <= point[d]);
            assert!(point[d] - decoded[d] < cell);
        }
    }

    #[test]
    fn test_periodic_images_share_key() {
        let bounding_box =
            PhysicalBox::new([0.0, 0.0, 0.0, 2.0, 2.0, 2.0]).with_periodicity([true, true, false]);

        let key: u32 = encode([0.5, 1.5, 1.0], &bounding_box);
        assert_eq!(key, encode([2.5, -0.5, 1.0], &bounding_box));
        assert_eq!(key, encode([-3.5, 3.5, 1.0], &bounding_box));
    }

    #[test]
    fn test_open_axis_clamps() {
        let bounding_box = PhysicalBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);

        let below: u32 = encode([-0.5, 0.5, 0.5], &bounding_box);
        let at_min: u32 = encode([0.0, 0.5, 0.5], &bounding_box);
        assert_eq!(below, at_min);

        let above: u32 = encode([1.5, 0.5, 0.5], &bounding_box);
        let at_max: u32 = encode([1.0, 0.5, 0.5], &bounding_box);
        assert_eq!(above, at_max);
        assert_eq!(decode_key(at_max)[0], grid_size::<u32>() - 1);
    }

    #[test]
    fn test_keys_preserve_octant_order() {
        // Points in octant 0 of the root have smaller keys than points in octant 7.
        let bounding_box = PhysicalBox::new([0.0, 0.0, 0.0, 1.0, 1.0, 1.0]);
        let low: u64 = encode([0.4, 0.4, 0.4], &bounding_box);
        let high: u64 = encode([0.6, 0.6, 0.6], &bounding_box);
        assert!(low < node_range::<u64>(1));
        assert!(high >= 7 * node_range::<u64>(1));
    }

    #[test]
    fn test_ibox_from_key_range() {
        let start: u32 = 7 * node_range::<u32>(1);
        let ibox = IBox::from_key_range(start, start + node_range::<u32>(1));
        assert_eq!(ibox.min, [512, 512, 512]);
        assert_eq!(ibox.max, [1024, 1024, 1024]);

        let ibox = IBox::from_key_range(0u64, node_range::<u64>(0));
        assert_eq!(ibox.min, [0, 0, 0]);
        assert_eq!(ibox.max, [1 << 21; 3]);
    }
}
