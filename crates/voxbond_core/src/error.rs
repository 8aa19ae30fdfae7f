//! # Group Error Types
//!
//! Contention and incompatibility are *outcomes*, not errors. What lands here
//! is either a caller mistake or a condition the lattice cannot recover from.

use thiserror::Error;

use crate::group::{GridCoord, GroupId};
use crate::lattice::VoxelId;

/// Errors raised by group maintenance.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    /// The rebuilt bounding box needs more map cells than configured.
    #[error("spatial map capacity exceeded: {requested} cells requested, limit {limit}")]
    MapCapacityExceeded {
        /// Cells the bounding box needs.
        requested: usize,
        /// Configured `max_map_cells`.
        limit: usize,
    },

    /// The bounding-box volume does not fit in `usize`.
    #[error("bounding box {dims:?} overflows the addressable map size")]
    DimensionOverflow {
        /// Box dimensions that overflowed.
        dims: [u64; 3],
    },

    /// The allocator refused the spatial map.
    #[error("failed to allocate spatial map of {cells} cells")]
    AllocationFailed {
        /// Cells that were requested.
        cells: usize,
    },

    /// Two reached voxels resolved to the same group-local coordinate.
    ///
    /// Only possible when links were wired without a compatibility check.
    #[error("inconsistent topology in group {group}: voxels {first} and {second} both map to {at}")]
    InconsistentTopology {
        /// Group being rebuilt.
        group: GroupId,
        /// Voxel that claimed the cell first.
        first: VoxelId,
        /// Voxel that collided with it.
        second: VoxelId,
        /// The contested coordinate.
        at: GridCoord,
    },

    /// A voxel handle outside the lattice.
    #[error("unknown voxel: {0}")]
    UnknownVoxel(VoxelId),

    /// A group handle outside the lattice.
    #[error("unknown group: {0}")]
    UnknownGroup(GroupId),
}

impl GroupError {
    /// Returns whether the owning simulation must stop.
    ///
    /// Unknown handles are caller bugs and leave the lattice untouched; every
    /// other variant means a rebuild could not produce a consistent group.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(self, Self::UnknownVoxel(_) | Self::UnknownGroup(_))
    }
}

/// Result type for group operations.
pub type GroupResult<T> = Result<T, GroupError>;
