//! # Compatibility Check
//!
//! Decides whether a link from a host voxel to a remote voxel can be formed
//! without two distinct voxels landing on one cell once the groups share a
//! frame.
//!
//! ```text
//!   host group              remote group             overlay
//!   [h][.]       +X   +     [r][q]          =        [h][r][q]
//!
//!   offset = step(coord(h), +X) - coord(r)
//!   every remote cell c: host.map[c + offset] must be empty
//! ```
//!
//! Runs under the check locks of both groups, never the rebuild locks. A
//! stale or contended layout is a deferral, not an answer.

use std::fmt;

use super::{lock_layouts, DeferReason, Group, GridCoord, GroupLayout, LayoutLocks};
use crate::error::GroupResult;
use crate::lattice::{Lattice, LinkDirection, VoxelId};

/// Slot directions to wire for an accepted link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LinkPair {
    /// Slot on the host voxel (host → remote).
    pub host_dir: LinkDirection,
    /// Slot on the remote voxel (remote → host).
    pub remote_dir: LinkDirection,
}

impl LinkPair {
    /// The pair for a link leaving the host along `dir`.
    #[inline]
    #[must_use]
    pub const fn along(dir: LinkDirection) -> Self {
        Self {
            host_dir: dir,
            remote_dir: dir.opposite(),
        }
    }
}

/// Why a link cannot be formed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Incompatibility {
    /// Host and remote are the same voxel.
    SameVoxel,
    /// The host already links something in the proposed direction.
    HostSlotOccupied,
    /// The remote already links something in the opposite direction.
    RemoteSlotOccupied,
    /// Overlaying the remote group puts two voxels on one cell.
    Collision {
        /// Host-frame coordinate of the contested cell.
        at: GridCoord,
        /// Host group voxel already there.
        occupant: VoxelId,
        /// Remote group voxel that would land there.
        incoming: VoxelId,
    },
    /// Same group, but the remote does not sit next to the host.
    FrameMismatch,
}

impl fmt::Display for Incompatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SameVoxel => f.write_str("same voxel"),
            Self::HostSlotOccupied => f.write_str("host slot occupied"),
            Self::RemoteSlotOccupied => f.write_str("remote slot occupied"),
            Self::Collision {
                at,
                occupant,
                incoming,
            } => write!(f, "{incoming} would land on {occupant} at {at}"),
            Self::FrameMismatch => f.write_str("remote is not adjacent in the group frame"),
        }
    }
}

/// Answer of a compatibility check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CheckOutcome {
    /// The link can be wired with these directions.
    Compatible(LinkPair),
    /// The link can never be wired in the current layouts.
    Incompatible(Incompatibility),
    /// Not decidable right now; ask again next step.
    Deferred(DeferReason),
}

impl CheckOutcome {
    /// Returns whether the link may be wired.
    #[inline]
    #[must_use]
    pub const fn is_compatible(&self) -> bool {
        matches!(self, Self::Compatible(_))
    }

    /// Directions to wire, if compatible.
    #[inline]
    #[must_use]
    pub const fn link_pair(&self) -> Option<LinkPair> {
        match self {
            Self::Compatible(pair) => Some(*pair),
            _ => None,
        }
    }
}

impl Lattice {
    /// Checks whether `host` may link `remote` along `dir`.
    ///
    /// Takes only the check locks of the two groups (bounded spin); mutates
    /// nothing.
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownVoxel`](crate::GroupError::UnknownVoxel) for a
    /// handle outside the lattice.
    pub fn check(
        &self,
        host: VoxelId,
        remote: VoxelId,
        dir: LinkDirection,
    ) -> GroupResult<CheckOutcome> {
        if host == remote {
            return Ok(CheckOutcome::Incompatible(Incompatibility::SameVoxel));
        }
        let host_group = self.group_of(host)?;
        let remote_group = self.group_of(remote)?;

        // Cheap peeks first; repeated under the locks
        if let Some(reason) = busy(host_group).or_else(|| busy(remote_group)) {
            return Ok(CheckOutcome::Deferred(reason));
        }

        let locks = match lock_layouts(host_group, remote_group, self.config().lock_spin_limit) {
            Ok(locks) => locks,
            Err(reason) => return Ok(CheckOutcome::Deferred(reason)),
        };
        if host_group.is_rebuilding() || remote_group.is_rebuilding() {
            return Ok(CheckOutcome::Deferred(DeferReason::RebuildInProgress));
        }

        self.evaluate(host, remote, dir, host_group, remote_group, &locks)
    }

    /// The check proper. The caller holds both check locks.
    ///
    /// Also used by attach, which holds the rebuild locks itself and so
    /// skips the in-progress test.
    pub(crate) fn evaluate(
        &self,
        host: VoxelId,
        remote: VoxelId,
        dir: LinkDirection,
        host_group: &Group,
        remote_group: &Group,
        locks: &LayoutLocks<'_>,
    ) -> GroupResult<CheckOutcome> {
        let host_voxel = self.voxel(host)?;
        let remote_voxel = self.voxel(remote)?;

        if host_voxel.group() != host_group.id() || remote_voxel.group() != remote_group.id() {
            return Ok(CheckOutcome::Deferred(DeferReason::GroupChanged));
        }
        if !host_group.is_live() || !remote_group.is_live() {
            return Ok(CheckOutcome::Deferred(DeferReason::NotLive));
        }
        if host_group.needs_rebuild() || remote_group.needs_rebuild() {
            return Ok(CheckOutcome::Deferred(DeferReason::StaleLayout));
        }
        if !host_voxel.is_slot_free(dir) {
            return Ok(CheckOutcome::Incompatible(Incompatibility::HostSlotOccupied));
        }
        if !remote_voxel.is_slot_free(dir.opposite()) {
            return Ok(CheckOutcome::Incompatible(Incompatibility::RemoteSlotOccupied));
        }

        let host_layout = locks.get(host_group.id());
        let remote_layout = locks.get(remote_group.id());
        let host_coord = host_voxel.coord();
        let remote_coord = remote_voxel.coord();
        if !is_placed(host_layout, host, host_coord) || !is_placed(remote_layout, remote, remote_coord) {
            return Ok(CheckOutcome::Deferred(DeferReason::StaleLayout));
        }

        let target = host_coord.step(dir, 1);
        if host_group.id() == remote_group.id() {
            return Ok(match host_layout.voxel_at(target) {
                Some(found) if found == remote => CheckOutcome::Compatible(LinkPair::along(dir)),
                Some(occupant) => CheckOutcome::Incompatible(Incompatibility::Collision {
                    at: target,
                    occupant,
                    incoming: remote,
                }),
                None => CheckOutcome::Incompatible(Incompatibility::FrameMismatch),
            });
        }

        if let Some(collision) = overlay_collision(host_layout, remote_layout, target - remote_coord) {
            return Ok(CheckOutcome::Incompatible(collision));
        }
        Ok(CheckOutcome::Compatible(LinkPair::along(dir)))
    }
}

/// Reason to defer without taking any lock.
fn busy(group: &Group) -> Option<DeferReason> {
    if !group.is_live() {
        Some(DeferReason::NotLive)
    } else if group.is_rebuilding() {
        Some(DeferReason::RebuildInProgress)
    } else if group.needs_rebuild() {
        Some(DeferReason::StaleLayout)
    } else {
        None
    }
}

#[inline]
fn is_placed(layout: &GroupLayout, voxel: VoxelId, coord: GridCoord) -> bool {
    layout.pending.is_empty() && layout.voxel_at(coord) == Some(voxel)
}

/// First remote cell that lands on an occupied host cell after translation.
fn overlay_collision(
    host: &GroupLayout,
    remote: &GroupLayout,
    offset: GridCoord,
) -> Option<Incompatibility> {
    remote
        .map
        .iter()
        .enumerate()
        .filter_map(|(index, cell)| cell.map(|voxel| (index, voxel)))
        .find_map(|(index, incoming)| {
            let at = remote.mapper.to_coord(index)? + offset;
            host.voxel_at(at).map(|occupant| Incompatibility::Collision {
                at,
                occupant,
                incoming,
            })
        })
}
