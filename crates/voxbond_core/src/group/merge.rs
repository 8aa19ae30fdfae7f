//! # Group Merge
//!
//! Folds one group into another after a link between them was accepted.
//!
//! ```text
//! lock order: rebuild(low id) → rebuild(high id) → check(low id) → check(high id)
//!
//! source                         target
//!   members + pending  ───────>    pending      (placed by the next rebuild)
//!   map, surface       cleared
//!   slot               Merged      marked dirty
//! ```
//!
//! The merge never lays the target out; its next rebuild does.

use super::compat::{CheckOutcome, Incompatibility, LinkPair};
use super::{lock_layouts, lock_rebuilds, DeferReason, Group, GroupId, LayoutLocks, SlotState};
use crate::error::GroupResult;
use crate::lattice::{Lattice, LinkDirection, VoxelId};

/// What a merge moved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MergeReport {
    /// The emptied group.
    pub source: GroupId,
    /// The group that absorbed it.
    pub target: GroupId,
    /// Voxels reassigned.
    pub moved: usize,
}

/// Result of a merge request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The source is now empty and marked merged.
    Merged(MergeReport),
    /// Source and target are the same group.
    Unchanged,
    /// Not now; retry next step.
    Deferred(DeferReason),
}

/// Result of an attach request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The link is wired.
    Attached {
        /// Slots that were wired.
        pair: LinkPair,
        /// The merge it caused, if the voxels were in different groups.
        merged: Option<MergeReport>,
    },
    /// The link can never be wired in the current layouts.
    Incompatible(Incompatibility),
    /// Not now; retry next step.
    Deferred(DeferReason),
}

impl AttachOutcome {
    /// Returns whether the link was wired.
    #[inline]
    #[must_use]
    pub const fn is_attached(&self) -> bool {
        matches!(self, Self::Attached { .. })
    }
}

impl Lattice {
    /// Moves every voxel of `source` into `target`.
    ///
    /// Call only after a successful [`Lattice::check`] for the link joining
    /// them; prefer [`Lattice::try_attach`], which cannot be raced between
    /// the check and the merge.
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownGroup`](crate::GroupError::UnknownGroup) for a
    /// handle outside the lattice.
    pub fn merge(&self, source: GroupId, target: GroupId) -> GroupResult<MergeOutcome> {
        if source == target {
            return Ok(MergeOutcome::Unchanged);
        }
        let source = self.group(source)?;
        let target = self.group(target)?;
        let spins = self.config().lock_spin_limit;

        let _rebuild_locks = match lock_rebuilds(source, target, spins) {
            Ok(locks) => locks,
            Err(reason) => return Ok(MergeOutcome::Deferred(reason)),
        };
        let mut layouts = match lock_layouts(source, target, spins) {
            Ok(locks) => locks,
            Err(reason) => return Ok(MergeOutcome::Deferred(reason)),
        };
        if !source.is_live() || !target.is_live() {
            return Ok(MergeOutcome::Deferred(DeferReason::NotLive));
        }

        Ok(MergeOutcome::Merged(self.merge_locked(source, target, &mut layouts)))
    }

    /// Checks, wires and merges in one critical section.
    ///
    /// Holds the rebuild and check locks of both groups from the check until
    /// the merge is done. The smaller group is merged into the larger one;
    /// on a tie the remote's group goes into the host's.
    ///
    /// # Errors
    ///
    /// [`GroupError::UnknownVoxel`](crate::GroupError::UnknownVoxel) for a
    /// handle outside the lattice.
    pub fn try_attach(
        &self,
        host: VoxelId,
        remote: VoxelId,
        dir: LinkDirection,
    ) -> GroupResult<AttachOutcome> {
        if host == remote {
            return Ok(AttachOutcome::Incompatible(Incompatibility::SameVoxel));
        }
        let host_group = self.group_of(host)?;
        let remote_group = self.group_of(remote)?;
        let spins = self.config().lock_spin_limit;

        let _rebuild_locks = match lock_rebuilds(host_group, remote_group, spins) {
            Ok(locks) => locks,
            Err(reason) => return Ok(AttachOutcome::Deferred(reason)),
        };
        let mut layouts = match lock_layouts(host_group, remote_group, spins) {
            Ok(locks) => locks,
            Err(reason) => return Ok(AttachOutcome::Deferred(reason)),
        };

        let pair = match self.evaluate(host, remote, dir, host_group, remote_group, &layouts)? {
            CheckOutcome::Compatible(pair) => pair,
            CheckOutcome::Incompatible(why) => return Ok(AttachOutcome::Incompatible(why)),
            CheckOutcome::Deferred(reason) => return Ok(AttachOutcome::Deferred(reason)),
        };
        // A raw `link` elsewhere may still have claimed a slot
        if !self.wire(host, remote, pair.host_dir)? {
            return Ok(AttachOutcome::Deferred(DeferReason::GroupChanged));
        }

        if host_group.id() == remote_group.id() {
            host_group.mark_dirty();
            return Ok(AttachOutcome::Attached { pair, merged: None });
        }

        let host_size = group_size(&layouts, host_group.id());
        let remote_size = group_size(&layouts, remote_group.id());
        let (source, target) = if remote_size > host_size {
            (host_group, remote_group)
        } else {
            (remote_group, host_group)
        };
        let report = self.merge_locked(source, target, &mut layouts);
        Ok(AttachOutcome::Attached {
            pair,
            merged: Some(report),
        })
    }

    /// The merge proper. The caller holds all four locks of both groups.
    pub(crate) fn merge_locked(
        &self,
        source: &Group,
        target: &Group,
        layouts: &mut LayoutLocks<'_>,
    ) -> MergeReport {
        let drained = std::mem::take(layouts.get_mut(source.id()));
        let moved: Vec<VoxelId> = drained
            .members
            .into_iter()
            .chain(drained.pending)
            .filter(|&voxel| {
                self.voxel(voxel)
                    .map_or(false, |record| record.group() == source.id())
            })
            .collect();

        for &voxel in &moved {
            if let Ok(record) = self.voxel(voxel) {
                record.set_group(target.id());
            }
        }
        let count = moved.len();
        layouts.get_mut(target.id()).pending.extend(moved);

        source.clear_dirty();
        source.set_slot_state(SlotState::Merged);
        target.mark_dirty();

        tracing::debug!(source = %source.id(), target = %target.id(), moved = count, "groups merged");
        MergeReport {
            source: source.id(),
            target: target.id(),
            moved: count,
        }
    }
}

#[inline]
fn group_size(layouts: &LayoutLocks<'_>, id: GroupId) -> usize {
    let layout = layouts.get(id);
    layout.members.len() + layout.pending.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;
    use crate::group::{GridCoord, GroupState};
    use crate::lattice::LatticeBuilder;

    #[test]
    fn test_merge_empties_source() {
        let lattice = Lattice::new(2, GroupConfig::default());
        let [a, b] = [0, 1].map(VoxelId::new);
        let source = lattice.voxel(b).unwrap().group();
        let target = lattice.voxel(a).unwrap().group();

        let outcome = lattice.merge(source, target).unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Merged(MergeReport {
                source,
                target,
                moved: 1
            })
        );

        let source_group = lattice.group(source).unwrap();
        assert_eq!(source_group.state(), GroupState::Merged);
        assert!(lattice.snapshot(source).unwrap().is_empty());
        assert_eq!(lattice.voxel(b).unwrap().group(), target);
        assert_eq!(lattice.group(target).unwrap().state(), GroupState::Dirty);
        assert_eq!(lattice.snapshot(target).unwrap().pending(), &[b]);

        assert_eq!(lattice.merge(target, target).unwrap(), MergeOutcome::Unchanged);
        assert_eq!(
            lattice.merge(source, target).unwrap(),
            MergeOutcome::Deferred(DeferReason::NotLive)
        );
    }

    #[test]
    fn test_attach_two_singletons() {
        let lattice = Lattice::new(2, GroupConfig::default());
        let [a, b] = [0, 1].map(VoxelId::new);

        let outcome = lattice.try_attach(a, b, LinkDirection::PosX).unwrap();
        let AttachOutcome::Attached { pair, merged } = outcome else {
            panic!("expected attach, got {outcome:?}");
        };
        assert_eq!(pair, LinkPair::along(LinkDirection::PosX));
        assert_eq!(merged.unwrap().target, lattice.voxel(a).unwrap().group());

        let report = lattice.rebuild(a).unwrap().report().cloned().unwrap();
        assert_eq!(report.members, 2);
        assert_eq!(report.dims, [2, 1, 1]);
        assert_eq!(lattice.voxel(a).unwrap().coord(), GridCoord::new(0, 0, 0));
        assert_eq!(lattice.voxel(b).unwrap().coord(), GridCoord::new(1, 0, 0));

        assert_eq!(lattice.reclaim_merged(), 1);
        assert!(lattice.audit().is_consistent());
    }

    #[test]
    fn test_attach_merges_smaller_into_larger() {
        let mut builder = LatticeBuilder::new(GroupConfig::default());
        let lone = builder.add_voxel([0, 0, 0]).unwrap();
        let first = builder.add_voxel([5, 0, 0]).unwrap();
        builder.add_voxel([6, 0, 0]).unwrap();
        builder.add_voxel([7, 0, 0]).unwrap();
        builder.link_adjacent();
        let lattice = builder.build().unwrap();
        let big = lattice.voxel(first).unwrap().group();

        let outcome = lattice.try_attach(lone, first, LinkDirection::PosX).unwrap();
        let AttachOutcome::Attached { merged: Some(report), .. } = outcome else {
            panic!("expected a merge, got {outcome:?}");
        };
        assert_eq!(report.target, big);
        assert_eq!(report.moved, 1);

        lattice.rebuild_dirty().unwrap();
        let layout = lattice.snapshot(big).unwrap();
        assert_eq!(layout.dims(), [4, 1, 1]);
        assert_eq!(layout.voxel_at(GridCoord::new(0, 0, 0)), Some(lone));
        assert_eq!(layout.voxel_at(GridCoord::new(1, 0, 0)), Some(first));
        assert_eq!(lattice.voxel(lone).unwrap().group(), big);
    }

    #[test]
    fn test_attach_defers_on_dirty_group() {
        let lattice = Lattice::new(3, GroupConfig::default());
        let [a, b, c] = [0, 1, 2].map(VoxelId::new);

        assert!(lattice.try_attach(a, b, LinkDirection::PosY).unwrap().is_attached());
        // a's group has not been rebuilt yet
        assert_eq!(
            lattice.try_attach(b, c, LinkDirection::PosY).unwrap(),
            AttachOutcome::Deferred(DeferReason::StaleLayout)
        );
        assert!(lattice.voxel(c).unwrap().is_slot_free(LinkDirection::NegY));

        lattice.rebuild(a).unwrap();
        assert!(lattice.try_attach(b, c, LinkDirection::PosY).unwrap().is_attached());
    }

    #[test]
    fn test_attach_closes_loop_in_one_group() {
        let mut builder = LatticeBuilder::new(GroupConfig::default());
        let a = builder.add_voxel([0, 0, 0]).unwrap();
        let b = builder.add_voxel([1, 0, 0]).unwrap();
        let c = builder.add_voxel([0, 1, 0]).unwrap();
        let d = builder.add_voxel([1, 1, 0]).unwrap();
        builder
            .link(a, b, LinkDirection::PosX)
            .link(b, d, LinkDirection::PosY)
            .link(c, d, LinkDirection::PosX);
        let lattice = builder.build().unwrap();
        let group = lattice.group_of(a).unwrap();

        let outcome = lattice.try_attach(c, a, LinkDirection::NegY).unwrap();
        assert_eq!(
            outcome,
            AttachOutcome::Attached {
                pair: LinkPair::along(LinkDirection::NegY),
                merged: None
            }
        );
        assert!(group.needs_rebuild());
        lattice.rebuild(a).unwrap();
        assert!(lattice.audit().is_consistent());
    }

    /// Both singletons untouched: own groups, no link, no merge, no reclaim.
    fn assert_untouched(lattice: &Lattice, [a, b]: [VoxelId; 2], [ga, gb]: [GroupId; 2]) {
        assert_eq!(lattice.voxel(a).unwrap().group(), ga);
        assert_eq!(lattice.voxel(b).unwrap().group(), gb);
        assert!(lattice.voxel(a).unwrap().is_slot_free(LinkDirection::PosX));
        assert!(lattice.voxel(b).unwrap().is_slot_free(LinkDirection::NegX));
        for (group, voxel) in [(ga, a), (gb, b)] {
            assert_eq!(lattice.group(group).unwrap().state(), GroupState::Stable);
            let layout = lattice.snapshot(group).unwrap();
            assert_eq!(layout.members(), &[voxel]);
            assert!(layout.pending().is_empty());
        }
        assert_eq!(lattice.reclaim_merged(), 0);
    }

    #[test]
    fn test_merge_and_attach_defer_while_rebuild_lock_held() {
        let lattice = Lattice::new(2, GroupConfig::default());
        let voxels = [0, 1].map(VoxelId::new);
        let groups = voxels.map(|v| lattice.voxel(v).unwrap().group());
        let free = lattice.free_group_count();

        // Source side, then target side
        for held in groups {
            let rebuilding = lattice.group(held).unwrap().try_rebuild_lock().unwrap();
            assert_eq!(
                lattice.merge(groups[1], groups[0]).unwrap(),
                MergeOutcome::Deferred(DeferReason::Contended)
            );
            assert_eq!(
                lattice.try_attach(voxels[0], voxels[1], LinkDirection::PosX).unwrap(),
                AttachOutcome::Deferred(DeferReason::Contended)
            );
            drop(rebuilding);
            assert_untouched(&lattice, voxels, groups);
            assert_eq!(lattice.free_group_count(), free);
        }
    }

    #[test]
    fn test_merge_and_attach_defer_while_check_lock_held() {
        let lattice = Lattice::new(2, GroupConfig::default());
        let voxels = [0, 1].map(VoxelId::new);
        let groups = voxels.map(|v| lattice.voxel(v).unwrap().group());
        let free = lattice.free_group_count();

        for held in groups {
            let checking = lattice.group(held).unwrap().layout_bounded(1).unwrap();
            assert_eq!(
                lattice.merge(groups[1], groups[0]).unwrap(),
                MergeOutcome::Deferred(DeferReason::Contended)
            );
            assert_eq!(
                lattice.try_attach(voxels[0], voxels[1], LinkDirection::PosX).unwrap(),
                AttachOutcome::Deferred(DeferReason::Contended)
            );
            drop(checking);
            assert_untouched(&lattice, voxels, groups);
            assert_eq!(lattice.free_group_count(), free);
        }

        // Released: the same request goes through
        assert!(lattice
            .try_attach(voxels[0], voxels[1], LinkDirection::PosX)
            .unwrap()
            .is_attached());
    }
}
