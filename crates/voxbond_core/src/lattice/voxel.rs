//! # Voxel Records
//!
//! Voxels are lightweight records addressed by a [`VoxelId`]:
//! - an owning-group back-reference
//! - a group-local coordinate
//! - six link slots, one per axis-aligned neighbour
//!
//! Every field is atomic so workers can read a voxel without a lock. Which
//! lock must be held to *write* a field is documented per method.

use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use super::direction::LinkDirection;
use crate::group::{GridCoord, GroupId};

/// Raw value of an empty link slot.
const NO_LINK: u32 = u32::MAX;

/// Handle of a voxel inside a [`Lattice`](super::Lattice).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct VoxelId(u32);

impl VoxelId {
    /// Creates a handle from a raw index.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the index into voxel storage.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for VoxelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// One cell of the physics lattice, as far as group bookkeeping is concerned.
#[derive(Debug)]
pub struct Voxel {
    /// Owning group. Changed only by merge and split under rebuild locks.
    group: AtomicU32,
    /// Group-local coordinate, published by rebuild under the check lock.
    coord: [AtomicI32; 3],
    /// Neighbour per direction, `NO_LINK` when empty.
    links: [AtomicU32; 6],
}

impl Voxel {
    /// Creates an unlinked voxel owned by `group` at the group origin.
    #[must_use]
    pub fn new(group: GroupId) -> Self {
        Self {
            group: AtomicU32::new(group.raw()),
            coord: [AtomicI32::new(0), AtomicI32::new(0), AtomicI32::new(0)],
            links: std::array::from_fn(|_| AtomicU32::new(NO_LINK)),
        }
    }

    /// Returns the owning group.
    #[inline]
    #[must_use]
    pub fn group(&self) -> GroupId {
        GroupId::new(self.group.load(Ordering::Acquire))
    }

    /// Reassigns the owning group.
    ///
    /// Callers hold the rebuild locks of both the old and the new group.
    #[inline]
    pub(crate) fn set_group(&self, group: GroupId) {
        self.group.store(group.raw(), Ordering::Release);
    }

    /// Returns the group-local coordinate.
    ///
    /// Consistent with the group's map only while its check lock is held.
    #[inline]
    #[must_use]
    pub fn coord(&self) -> GridCoord {
        GridCoord::new(
            self.coord[0].load(Ordering::Acquire),
            self.coord[1].load(Ordering::Acquire),
            self.coord[2].load(Ordering::Acquire),
        )
    }

    /// Writes the group-local coordinate. Callers hold the group's check lock.
    #[inline]
    pub(crate) fn set_coord(&self, coord: GridCoord) {
        self.coord[0].store(coord.x, Ordering::Release);
        self.coord[1].store(coord.y, Ordering::Release);
        self.coord[2].store(coord.z, Ordering::Release);
    }

    /// Returns the neighbour held in slot `dir`, if any.
    #[inline]
    #[must_use]
    pub fn link(&self, dir: LinkDirection) -> Option<VoxelId> {
        match self.links[dir.index()].load(Ordering::Acquire) {
            NO_LINK => None,
            raw => Some(VoxelId::new(raw)),
        }
    }

    /// Returns whether slot `dir` is empty.
    #[inline]
    #[must_use]
    pub fn is_slot_free(&self, dir: LinkDirection) -> bool {
        self.link(dir).is_none()
    }

    /// Claims slot `dir` for `neighbor` if it is empty.
    #[inline]
    pub(crate) fn claim_slot(&self, dir: LinkDirection, neighbor: VoxelId) -> bool {
        self.links[dir.index()]
            .compare_exchange(NO_LINK, neighbor.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Empties slot `dir` if it still points at `neighbor`.
    #[inline]
    pub(crate) fn release_slot(&self, dir: LinkDirection, neighbor: VoxelId) -> bool {
        self.links[dir.index()]
            .compare_exchange(neighbor.raw(), NO_LINK, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Iterates over occupied slots.
    pub fn links(&self) -> impl Iterator<Item = (LinkDirection, VoxelId)> + '_ {
        LinkDirection::ALL
            .into_iter()
            .filter_map(move |dir| self.link(dir).map(|n| (dir, n)))
    }
}
