//! # Link Directions
//!
//! The six axis-aligned neighbour slots of a voxel.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the six axis-aligned link directions.
///
/// The discriminant doubles as the link-slot index on a voxel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum LinkDirection {
    /// +X
    PosX = 0,
    /// -X
    NegX = 1,
    /// +Y
    PosY = 2,
    /// -Y
    NegY = 3,
    /// +Z
    PosZ = 4,
    /// -Z
    NegZ = 5,
}

impl LinkDirection {
    /// All directions in slot order.
    pub const ALL: [Self; 6] = [
        Self::PosX,
        Self::NegX,
        Self::PosY,
        Self::NegY,
        Self::PosZ,
        Self::NegZ,
    ];

    /// Returns the slot index (0-5).
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Converts a slot index back into a direction.
    #[inline]
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Self::PosX),
            1 => Some(Self::NegX),
            2 => Some(Self::PosY),
            3 => Some(Self::NegY),
            4 => Some(Self::PosZ),
            5 => Some(Self::NegZ),
            _ => None,
        }
    }

    /// Returns the direction pointing the other way.
    #[inline]
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::PosX => Self::NegX,
            Self::NegX => Self::PosX,
            Self::PosY => Self::NegY,
            Self::NegY => Self::PosY,
            Self::PosZ => Self::NegZ,
            Self::NegZ => Self::PosZ,
        }
    }

    /// Unit offset of this direction.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> [i32; 3] {
        match self {
            Self::PosX => [1, 0, 0],
            Self::NegX => [-1, 0, 0],
            Self::PosY => [0, 1, 0],
            Self::NegY => [0, -1, 0],
            Self::PosZ => [0, 0, 1],
            Self::NegZ => [0, 0, -1],
        }
    }

    /// Axis this direction runs along (0 = X, 1 = Y, 2 = Z).
    #[inline]
    #[must_use]
    pub const fn axis(self) -> usize {
        self.index() / 2
    }

    /// Picks the direction of the dominant component of a displacement.
    ///
    /// This is how a proposed link direction is derived from the world-space
    /// positions of two touching voxels. Ties resolve X before Y before Z.
    /// Returns `None` for a zero (or non-finite) displacement.
    #[must_use]
    pub fn dominant(displacement: [f32; 3]) -> Option<Self> {
        if !displacement.iter().all(|c| c.is_finite()) {
            return None;
        }
        let mut axis = 0;
        for candidate in 1..3 {
            if displacement[candidate].abs() > displacement[axis].abs() {
                axis = candidate;
            }
        }
        let value = displacement[axis];
        if value == 0.0 {
            return None;
        }
        let positive = value > 0.0;
        Some(match (axis, positive) {
            (0, true) => Self::PosX,
            (0, false) => Self::NegX,
            (1, true) => Self::PosY,
            (1, false) => Self::NegY,
            (_, true) => Self::PosZ,
            (_, false) => Self::NegZ,
        })
    }
}

impl fmt::Display for LinkDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::PosX => "+X",
            Self::NegX => "-X",
            Self::PosY => "+Y",
            Self::NegY => "-Y",
            Self::PosZ => "+Z",
            Self::NegZ => "-Z",
        };
        f.write_str(name)
    }
}
