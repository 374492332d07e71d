//! Geometry information

use crate::error::DomainError;

/// A bounding box describes the geometry onto which the key space is mapped.
///
/// Every axis can be open or periodic. On a periodic axis a position and all of its
/// images shifted by multiples of the box length describe the same point.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct PhysicalBox {
    coords: [f64; 6],
    periodic: [bool; 3],
}

impl PhysicalBox {
    /// Create a new bounding box with open boundaries.
    ///
    /// The coordinates are given by `[xmin, ymin, zmin, xmax, ymax, zmax]`.
    pub fn new(coords: [f64; 6]) -> Self {
        Self {
            coords,
            periodic: [false; 3],
        }
    }

    /// Set the periodicity of each axis.
    pub fn with_periodicity(mut self, periodic: [bool; 3]) -> Self {
        self.periodic = periodic;
        self
    }

    /// Compute the bounding box of a set of points given by their coordinate arrays.
    ///
    /// An empty point set returns an inverted box (min larger than max) that acts as the
    /// neutral element of [PhysicalBox::union].
    pub fn from_points(x: &[f64], y: &[f64], z: &[f64]) -> PhysicalBox {
        let mut xmin = f64::MAX;
        let mut xmax = f64::MIN;

        let mut ymin = f64::MAX;
        let mut ymax = f64::MIN;

        let mut zmin = f64::MAX;
        let mut zmax = f64::MIN;

        for (&xi, &yi, &zi) in itertools::izip!(x, y, z) {
            xmin = f64::min(xmin, xi);
            xmax = f64::max(xmax, xi);

            ymin = f64::min(ymin, yi);
            ymax = f64::max(ymax, yi);

            zmin = f64::min(zmin, zi);
            zmax = f64::max(zmax, zi);
        }

        PhysicalBox::new([xmin, ymin, zmin, xmax, ymax, zmax])
    }

    /// Return coordinates
    pub fn coordinates(&self) -> [f64; 6] {
        self.coords
    }

    /// Return the periodicity flags.
    pub fn periodic(&self) -> [bool; 3] {
        self.periodic
    }

    /// Lower corner.
    pub fn min(&self) -> [f64; 3] {
        [self.coords[0], self.coords[1], self.coords[2]]
    }

    /// Upper corner.
    pub fn max(&self) -> [f64; 3] {
        [self.coords[3], self.coords[4], self.coords[5]]
    }

    /// Edge lengths along each axis.
    pub fn lengths(&self) -> [f64; 3] {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;
        [xmax - xmin, ymax - ymin, zmax - zmin]
    }

    /// The smallest box containing `self` and `other`. Periodicity is taken from `self`.
    pub fn union(&self, other: &PhysicalBox) -> PhysicalBox {
        let mut coords = self.coords;
        for d in 0..3 {
            coords[d] = f64::min(coords[d], other.coords[d]);
            coords[d + 3] = f64::max(coords[d + 3], other.coords[d + 3]);
        }
        PhysicalBox {
            coords,
            periodic: self.periodic,
        }
    }

    /// Check that every axis has a finite, positive extent.
    pub fn validate(&self) -> Result<(), DomainError> {
        for (axis, length) in self.lengths().into_iter().enumerate() {
            if !(length.is_finite() && length > 0.0) {
                return Err(DomainError::DegenerateBox { axis, length });
            }
        }
        Ok(())
    }

    /// Map a point on periodic axes into the primary image `[min, max)`.
    ///
    /// Coordinates on open axes are returned unchanged.
    pub fn wrap(&self, point: [f64; 3]) -> [f64; 3] {
        let mut wrapped = point;
        let min = self.min();
        let lengths = self.lengths();
        for d in 0..3 {
            if self.periodic[d] {
                let periods = ((wrapped[d] - min[d]) / lengths[d]).floor();
                let shifted = wrapped[d] - periods * lengths[d];
                // Rounding can push a point just below max onto max itself.
                wrapped[d] = if shifted >= min[d] + lengths[d] {
                    min[d]
                } else {
                    shifted
                };
            }
        }
        wrapped
    }

    /// Map a point from the reference box [0, 1]^3 to the bounding box.
    pub fn reference_to_physical(&self, point: [f64; 3]) -> [f64; 3] {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        [
            xmin + (xmax - xmin) * point[0],
            ymin + (ymax - ymin) * point[1],
            zmin + (zmax - zmin) * point[2],
        ]
    }

    /// Map a point from the physical domain to the reference box.
    pub fn physical_to_reference(&self, point: [f64; 3]) -> [f64; 3] {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;

        [
            (point[0] - xmin) / (xmax - xmin),
            (point[1] - ymin) / (ymax - ymin),
            (point[2] - zmin) / (zmax - zmin),
        ]
    }
}

impl std::fmt::Display for PhysicalBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [xmin, ymin, zmin, xmax, ymax, zmax] = self.coords;
        let [px, py, pz] = self.periodic;

        write!(
            f,
            "(xmin: {}, ymin: {}, zmin: {}, xmax: {}, ymax: {}, zmax: {}, periodic: [{}, {}, {}])",
            xmin, ymin, zmin, xmax, ymax, zmax, px, py, pz
        )
    }
}
