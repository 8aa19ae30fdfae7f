//! # Lattice Context
//!
//! The owning context every group operation receives explicitly. It holds:
//! - voxel storage, indexed by [`VoxelId`]
//! - group storage, indexed by [`GroupId`] (one slot per voxel, pre-allocated)
//! - the free pool of group slots available for splits
//!
//! ## Slot Budget
//!
//! ```text
//! live groups + merged groups + free groups == voxel count
//! ```
//!
//! A live group always owns at least one voxel, so the pre-allocated slots
//! always suffice once merged slots have been reclaimed.

mod builder;
mod direction;
mod voxel;

pub use builder::LatticeBuilder;
pub use direction::LinkDirection;
pub use voxel::{Voxel, VoxelId};

use crossbeam_channel::{Receiver, Sender};

use crate::config::GroupConfig;
use crate::error::{GroupError, GroupResult};
use crate::group::{Group, GroupId, GroupLayout, RebuildOutcome, SkipReason, SlotState};

/// Voxels, groups and the free-slot pool.
#[derive(Debug)]
pub struct Lattice {
    voxels: Box<[Voxel]>,
    groups: Box<[Group]>,
    free_tx: Sender<GroupId>,
    free_rx: Receiver<GroupId>,
    config: GroupConfig,
}

impl Lattice {
    /// Creates `voxel_count` unlinked voxels, each in its own 1×1×1 group.
    ///
    /// # Panics
    ///
    /// Panics if `voxel_count` does not fit in a `u32` handle.
    #[must_use]
    pub fn new(voxel_count: usize, config: GroupConfig) -> Self {
        let count = u32::try_from(voxel_count).expect("voxel count must fit in a u32 handle");
        let voxels = (0..count).map(|i| Voxel::new(GroupId::new(i))).collect();
        let groups = (0..count)
            .map(|i| Group::singleton(GroupId::new(i), VoxelId::new(i)))
            .collect();
        let (free_tx, free_rx) = crossbeam_channel::bounded(voxel_count.max(1));

        Self {
            voxels,
            groups,
            free_tx,
            free_rx,
            config,
        }
    }

    /// Number of voxels.
    #[inline]
    #[must_use]
    pub fn voxel_count(&self) -> usize {
        self.voxels.len()
    }

    /// Group maintenance configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Looks up a voxel.
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownVoxel`] for a handle outside the lattice.
    #[inline]
    pub fn voxel(&self, id: VoxelId) -> GroupResult<&Voxel> {
        self.voxels.get(id.index()).ok_or(GroupError::UnknownVoxel(id))
    }

    /// Looks up a group slot.
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownGroup`] for a handle outside the lattice.
    #[inline]
    pub fn group(&self, id: GroupId) -> GroupResult<&Group> {
        self.groups.get(id.index()).ok_or(GroupError::UnknownGroup(id))
    }

    /// The group `voxel` currently belongs to.
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownVoxel`] for a handle outside the lattice.
    #[inline]
    pub fn group_of(&self, voxel: VoxelId) -> GroupResult<&Group> {
        let group = self.voxel(voxel)?.group();
        self.group(group)
    }

    /// All voxel handles.
    pub fn voxel_ids(&self) -> impl Iterator<Item = VoxelId> + '_ {
        (0..self.voxels.len()).map(|i| VoxelId::new(i as u32))
    }

    /// All group slots, whatever their state.
    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter()
    }

    /// Live groups only.
    pub fn live_groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().filter(|g| g.is_live())
    }

    /// Number of group slots waiting in the free pool.
    #[inline]
    #[must_use]
    pub fn free_group_count(&self) -> usize {
        self.free_rx.len()
    }

    // ------------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------------

    /// Wires a link from `a` to `b` in direction `dir` (and back).
    ///
    /// Returns `false`, leaving both voxels untouched, if either slot is
    /// taken. Marks both groups dirty on success. No compatibility check is
    /// made: use [`Lattice::try_attach`] to join groups safely.
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownVoxel`] for a handle outside the lattice.
    pub fn link(&self, a: VoxelId, b: VoxelId, dir: LinkDirection) -> GroupResult<bool> {
        if a == b {
            return Ok(false);
        }
        if !self.wire(a, b, dir)? {
            return Ok(false);
        }
        self.group_of(a)?.mark_dirty();
        self.group_of(b)?.mark_dirty();
        Ok(true)
    }

    /// Breaks the link in slot `dir` of `voxel`, returning the former neighbour.
    ///
    /// Marks the groups on both ends dirty.
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownVoxel`] for a handle outside the lattice.
    pub fn unlink(&self, voxel: VoxelId, dir: LinkDirection) -> GroupResult<Option<VoxelId>> {
        let near = self.voxel(voxel)?;
        let Some(neighbor) = near.link(dir) else {
            return Ok(None);
        };
        if !near.release_slot(dir, neighbor) {
            // Someone else broke it first
            return Ok(None);
        }
        self.voxel(neighbor)?.release_slot(dir.opposite(), voxel);
        self.group_of(voxel)?.mark_dirty();
        self.group_of(neighbor)?.mark_dirty();
        Ok(Some(neighbor))
    }

    /// Signals that the links of `voxel` changed outside this API.
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownVoxel`] for a handle outside the lattice.
    pub fn mark_dirty(&self, voxel: VoxelId) -> GroupResult<()> {
        self.group_of(voxel)?.mark_dirty();
        Ok(())
    }

    /// Returns whether `from` and `to` hold each other in `dir` / `opposite(dir)`.
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownVoxel`] for a handle outside the lattice.
    #[inline]
    pub fn is_live_link(&self, from: VoxelId, dir: LinkDirection, to: VoxelId) -> GroupResult<bool> {
        Ok(self.voxel(from)?.link(dir) == Some(to)
            && self.voxel(to)?.link(dir.opposite()) == Some(from))
    }

    /// Returns whether `voxel` has a slot that is empty, half-linked, or
    /// linked to a voxel for which `in_group` is false.
    pub(crate) fn is_exposed(
        &self,
        voxel: VoxelId,
        in_group: impl Fn(VoxelId) -> bool,
    ) -> GroupResult<bool> {
        let record = self.voxel(voxel)?;
        for dir in LinkDirection::ALL {
            let linked = match record.link(dir) {
                Some(neighbor) => in_group(neighbor) && self.is_live_link(voxel, dir, neighbor)?,
                None => false,
            };
            if !linked {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Claims both slots of a new link, all or nothing.
    pub(crate) fn wire(&self, a: VoxelId, b: VoxelId, dir: LinkDirection) -> GroupResult<bool> {
        let near = self.voxel(a)?;
        let far = self.voxel(b)?;
        if !near.claim_slot(dir, b) {
            return Ok(false);
        }
        if !far.claim_slot(dir.opposite(), a) {
            near.release_slot(dir, b);
            return Ok(false);
        }
        Ok(true)
    }

    // ------------------------------------------------------------------------
    // Group maintenance entry points
    // ------------------------------------------------------------------------

    /// Rebuilds the group `voxel` belongs to, starting the traversal at `voxel`.
    ///
    /// # Errors
    ///
    /// See [`Group::rebuild`].
    pub fn rebuild(&self, voxel: VoxelId) -> GroupResult<RebuildOutcome> {
        self.group_of(voxel)?.rebuild(self, voxel)
    }

    /// Rebuilds every dirty live group from its anchor, one after another.
    ///
    /// Meant for single-threaded phases (initialisation, tests). Returns how
    /// many groups were rebuilt.
    ///
    /// # Errors
    ///
    /// The first fatal [`GroupError`].
    pub fn rebuild_dirty(&self) -> GroupResult<usize> {
        let mut rebuilt = 0;
        for group in self.groups.iter() {
            if !group.is_live() || !group.needs_rebuild() {
                continue;
            }
            let mut outcome = group.rebuild(self, group.anchor())?;
            if outcome == RebuildOutcome::Skipped(SkipReason::StartMoved) {
                if let Some(start) = self.any_claimant(group) {
                    outcome = group.rebuild(self, start)?;
                }
            }
            if let RebuildOutcome::Rebuilt(_) = outcome {
                rebuilt += 1;
            }
        }
        Ok(rebuilt)
    }

    /// A listed member or pending voxel that still claims `group`.
    fn any_claimant(&self, group: &Group) -> Option<VoxelId> {
        let layout = group.layout_bounded(self.config.lock_spin_limit)?;
        layout
            .members
            .iter()
            .chain(&layout.pending)
            .copied()
            .find(|&v| self.voxel(v).map_or(false, |voxel| voxel.group() == group.id()))
    }

    /// Clones the layout of `group` under its check lock.
    ///
    /// `None` if the lock stays contended for the whole spin budget or the
    /// handle is unknown.
    #[must_use]
    pub fn snapshot(&self, group: GroupId) -> Option<GroupLayout> {
        let group = self.group(group).ok()?;
        group
            .layout_bounded(self.config.lock_spin_limit)
            .map(|layout| layout.clone())
    }

    /// Returns every merged group slot to the free pool.
    ///
    /// Call between steps. Returns the number of slots reclaimed.
    pub fn reclaim_merged(&self) -> usize {
        let mut reclaimed = 0;
        for group in self.groups.iter() {
            if group.transition_slot(SlotState::Merged, SlotState::Free) {
                group.clear_dirty();
                if self.free_tx.try_send(group.id()).is_ok() {
                    reclaimed += 1;
                }
            }
        }
        if reclaimed > 0 {
            tracing::debug!(reclaimed, "merged groups reclaimed");
        }
        reclaimed
    }

    /// Hands `orphans` (unreached claimants of `from`) to a free group slot.
    ///
    /// The caller holds the rebuild lock of `from`. A slot popped from the
    /// pool is unreachable by any other worker until the orphans point at it,
    /// so its locks cannot be contended.
    pub(crate) fn split_off(&self, from: &Group, orphans: &[VoxelId]) -> Option<GroupId> {
        let &first = orphans.first()?;
        let id = self.free_rx.try_recv().ok()?;
        let Ok(target) = self.group(id) else {
            return None;
        };

        let spins = self.config.lock_spin_limit;
        let handed_over = match (target.rebuild_lock_bounded(spins), target.layout_bounded(spins)) {
            (Some(_rebuild_lock), Some(mut layout)) => {
                *layout = GroupLayout::empty();
                layout.pending.extend_from_slice(orphans);
                target.set_anchor(first);
                target.set_slot_state(SlotState::Live);
                for &voxel in orphans {
                    if let Ok(record) = self.voxel(voxel) {
                        record.set_group(id);
                    }
                }
                target.mark_dirty();
                true
            }
            _ => false,
        };

        if handed_over {
            tracing::trace!(from = %from.id(), to = %id, "orphans handed over");
            Some(id)
        } else {
            let _ = self.free_tx.try_send(id);
            None
        }
    }
}
