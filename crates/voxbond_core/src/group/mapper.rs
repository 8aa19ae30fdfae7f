//! # Coordinate Mapper
//!
//! Bijection between group-local 3D coordinates and flat map indices.
//!
//! ```text
//! index = x + dim_x * (y + dim_y * z)
//!
//!   z=0          z=1
//!   y=1 [3][4][5]  [ 9][10][11]
//!   y=0 [0][1][2]  [ 6][ 7][ 8]      dims = (3, 2, 2)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

use crate::lattice::LinkDirection;

/// Integer coordinate in a group's frame.
///
/// Members of a rebuilt group always have non-negative coordinates inside
/// the bounding box; intermediate values (traversal, translated probes) may
/// be negative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridCoord {
    /// X component.
    pub x: i32,
    /// Y component.
    pub y: i32,
    /// Z component.
    pub z: i32,
}

impl GridCoord {
    /// The group origin.
    pub const ORIGIN: Self = Self::new(0, 0, 0);

    /// Creates a coordinate.
    #[inline]
    #[must_use]
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Converts to an array.
    #[inline]
    #[must_use]
    pub const fn to_array(self) -> [i32; 3] {
        [self.x, self.y, self.z]
    }

    /// Component-wise minimum.
    #[inline]
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y), self.z.min(other.z))
    }

    /// Component-wise maximum.
    #[inline]
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y), self.z.max(other.z))
    }

    /// The coordinate `n` cells away along `dir`.
    ///
    /// Not range checked: stepping out of a box is how callers translate
    /// between a voxel's frame and a neighbour's.
    #[inline]
    #[must_use]
    pub const fn step(self, dir: LinkDirection, n: i32) -> Self {
        let [dx, dy, dz] = dir.offset();
        Self::new(self.x + dx * n, self.y + dy * n, self.z + dz * n)
    }
}

impl Add for GridCoord {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for GridCoord {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl fmt::Display for GridCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

/// Flat indexing over a group's bounding box.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoordMapper {
    dims: [u32; 3],
}

impl CoordMapper {
    /// The trivial 1×1×1 box of a singleton group.
    pub const UNIT: Self = Self { dims: [1, 1, 1] };

    /// Creates a mapper for a box of `dims`. Every dimension must be positive.
    ///
    /// # Panics
    ///
    /// Panics if a dimension is zero or exceeds `i32::MAX`.
    #[must_use]
    pub fn new(dims: [u32; 3]) -> Self {
        assert!(
            dims.iter().all(|&d| d > 0 && i32::try_from(d).is_ok()),
            "Box dimensions must be in 1..=i32::MAX, got {dims:?}"
        );
        Self { dims }
    }

    /// Box dimensions.
    #[inline]
    #[must_use]
    pub const fn dims(&self) -> [u32; 3] {
        self.dims
    }

    /// Number of cells in the box, `None` if it overflows `usize`.
    #[inline]
    #[must_use]
    pub fn checked_volume(dims: [u32; 3]) -> Option<usize> {
        let [x, y, z] = dims.map(|d| d as usize);
        x.checked_mul(y)?.checked_mul(z)
    }

    /// Number of cells in the box.
    #[inline]
    #[must_use]
    pub fn volume(&self) -> usize {
        self.dims.iter().map(|&d| d as usize).product()
    }

    /// Returns whether `coord` lies inside the box.
    #[inline]
    #[must_use]
    pub fn contains(&self, coord: GridCoord) -> bool {
        coord
            .to_array()
            .iter()
            .zip(self.dims)
            .all(|(&c, d)| c >= 0 && (c as u32) < d)
    }

    /// Flat index of `coord`, `None` outside the box.
    #[inline]
    #[must_use]
    pub fn to_flat(&self, coord: GridCoord) -> Option<usize> {
        if !self.contains(coord) {
            return None;
        }
        let [dx, dy, _] = self.dims.map(|d| d as usize);
        let [x, y, z] = coord.to_array().map(|c| c as usize);
        Some(x + dx * (y + dy * z))
    }

    /// Coordinate of flat index `index`, `None` past the end of the box.
    #[inline]
    #[must_use]
    pub fn to_coord(&self, index: usize) -> Option<GridCoord> {
        if index >= self.volume() {
            return None;
        }
        let [dx, dy, _] = self.dims.map(|d| d as usize);
        let x = index % dx;
        let y = (index / dx) % dy;
        let z = index / (dx * dy);
        // Each component is below its dimension, which fits in i32
        Some(GridCoord::new(x as i32, y as i32, z as i32))
    }
}

impl Default for CoordMapper {
    fn default() -> Self {
        Self::UNIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_layout() {
        let mapper = CoordMapper::new([3, 2, 2]);
        assert_eq!(mapper.volume(), 12);
        assert_eq!(mapper.to_flat(GridCoord::new(0, 0, 0)), Some(0));
        assert_eq!(mapper.to_flat(GridCoord::new(2, 0, 0)), Some(2));
        assert_eq!(mapper.to_flat(GridCoord::new(0, 1, 0)), Some(3));
        assert_eq!(mapper.to_flat(GridCoord::new(1, 0, 1)), Some(7));
        assert_eq!(mapper.to_flat(GridCoord::new(2, 1, 1)), Some(11));
    }

    #[test]
    fn test_roundtrip_every_cell() {
        let mapper = CoordMapper::new([4, 3, 5]);
        for index in 0..mapper.volume() {
            let coord = mapper.to_coord(index).unwrap();
            assert_eq!(mapper.to_flat(coord), Some(index));
        }
        for z in 0..5 {
            for y in 0..3 {
                for x in 0..4 {
                    let c = GridCoord::new(x, y, z);
                    assert_eq!(mapper.to_coord(mapper.to_flat(c).unwrap()), Some(c));
                }
            }
        }
    }

    #[test]
    fn test_out_of_range() {
        let mapper = CoordMapper::new([2, 2, 2]);
        assert_eq!(mapper.to_flat(GridCoord::new(-1, 0, 0)), None);
        assert_eq!(mapper.to_flat(GridCoord::new(0, 2, 0)), None);
        assert_eq!(mapper.to_flat(GridCoord::new(0, 0, 2)), None);
        assert_eq!(mapper.to_coord(8), None);
    }

    #[test]
    fn test_step_inverse() {
        let start = GridCoord::new(3, -2, 7);
        for dir in LinkDirection::ALL {
            for n in 0..5 {
                assert_eq!(start.step(dir, n).step(dir.opposite(), n), start);
            }
        }
        assert_eq!(GridCoord::ORIGIN.step(LinkDirection::NegZ, 3), GridCoord::new(0, 0, -3));
    }

    #[test]
    fn test_checked_volume_overflow() {
        assert_eq!(CoordMapper::checked_volume([2, 3, 4]), Some(24));
        #[cfg(target_pointer_width = "32")]
        assert_eq!(CoordMapper::checked_volume([u32::MAX, u32::MAX, 2]), None);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(CoordMapper::checked_volume([u32::MAX, u32::MAX, u32::MAX]), None);
    }

    #[test]
    #[should_panic(expected = "Box dimensions must be")]
    fn test_zero_dimension_panics() {
        let _ = CoordMapper::new([1, 0, 1]);
    }
}
