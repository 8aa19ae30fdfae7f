//! # Voxel Groups
//!
//! A group is a maximal set of rigidly linked voxels sharing one coordinate
//! frame.
//!
//! ## Locks
//!
//! Every group carries two locks, both only ever *try*-acquired:
//!
//! ```text
//! rebuild lock  SpinFlag                 held for a whole rebuild, merge or attach
//! check lock    Mutex<GroupLayout>       held to read the layout, or (with the
//!                                        rebuild lock) to replace it
//! ```
//!
//! ## Acquisition Order
//!
//! All rebuild locks before any check lock; within one kind, ascending
//! [`GroupId`]. Every multi-lock operation in this crate goes through
//! [`lock_rebuilds`] and [`lock_layouts`], which enforce it.
//!
//! ## State Machine
//!
//! ```text
//!            mark_dirty             rebuild lock            settled
//!   Stable ─────────────> Dirty ───────────────> Rebuilding ───────> Stable
//!     │                     │                        │
//!     └──────── merge source ──────────────────────────────> Merged ── reclaim ──> Free
//!                                                                                   │
//!   Dirty <──────────────────────────── split reuses the slot ─────────────────────┘
//! ```

pub mod audit;
pub mod compat;
pub mod mapper;
pub mod merge;
pub mod rebuild;

use parking_lot::{Mutex, MutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::lattice::VoxelId;
use crate::sync::{spin_until, SpinFlag, SpinGuard, SpinStats};

pub use audit::{AuditReport, AuditViolation};
pub use compat::{CheckOutcome, Incompatibility, LinkPair};
pub use mapper::{CoordMapper, GridCoord};
pub use merge::{AttachOutcome, MergeOutcome, MergeReport};
pub use rebuild::{RebuildOutcome, RebuildReport, SkipReason};

/// Handle of a group slot inside a [`Lattice`](crate::Lattice).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct GroupId(u32);

impl GroupId {
    /// Creates a handle from a raw index.
    #[inline]
    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the index into group storage.
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

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Observable state of a group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GroupState {
    /// Layout matches the link topology as of the last rebuild.
    Stable,
    /// Links changed since the last rebuild.
    Dirty,
    /// A worker holds the rebuild lock.
    Rebuilding,
    /// Emptied by a merge; waiting to be reclaimed.
    Merged,
    /// In the free pool.
    Free,
}

/// Lifecycle of a group slot. Stored as `u8`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum SlotState {
    Live = 0,
    Merged = 1,
    Free = 2,
}

impl SlotState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Live,
            1 => Self::Merged,
            _ => Self::Free,
        }
    }
}

/// Why an operation answered "not now".
///
/// Deferral is never an error: the caller retries on a later step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeferReason {
    /// A lock could not be acquired within the spin budget.
    Contended,
    /// Another worker is rebuilding one of the groups.
    RebuildInProgress,
    /// One of the groups is dirty; its map cannot be trusted yet.
    StaleLayout,
    /// A voxel changed group between lookup and locking.
    GroupChanged,
    /// One of the groups is merged or free.
    NotLive,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Contended => "lock contended",
            Self::RebuildInProgress => "rebuild in progress",
            Self::StaleLayout => "layout stale",
            Self::GroupChanged => "group changed",
            Self::NotLive => "group not live",
        };
        f.write_str(text)
    }
}

/// Spatial structure of a group: bounding box, dense map, member and surface sets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupLayout {
    pub(crate) mapper: CoordMapper,
    pub(crate) map: Vec<Option<VoxelId>>,
    pub(crate) members: Vec<VoxelId>,
    pub(crate) surface: Vec<VoxelId>,
    /// Voxels that joined (merge) or were handed over (split) since the last
    /// rebuild and are not placed in the map yet.
    pub(crate) pending: Vec<VoxelId>,
}

impl GroupLayout {
    /// Layout of an empty (merged or free) group.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            mapper: CoordMapper::UNIT,
            map: vec![None],
            members: Vec::new(),
            surface: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Layout of a single unlinked voxel at the origin.
    #[must_use]
    pub fn singleton(voxel: VoxelId) -> Self {
        Self {
            mapper: CoordMapper::UNIT,
            map: vec![Some(voxel)],
            members: vec![voxel],
            surface: vec![voxel],
            pending: Vec::new(),
        }
    }

    /// Bounding-box dimensions.
    #[inline]
    #[must_use]
    pub fn dims(&self) -> [u32; 3] {
        self.mapper.dims()
    }

    /// Coordinate mapper for this box.
    #[inline]
    #[must_use]
    pub fn mapper(&self) -> CoordMapper {
        self.mapper
    }

    /// Dense map, indexed by [`CoordMapper::to_flat`].
    #[inline]
    #[must_use]
    pub fn map(&self) -> &[Option<VoxelId>] {
        &self.map
    }

    /// Voxel occupying `coord`, if any.
    #[inline]
    #[must_use]
    pub fn voxel_at(&self, coord: GridCoord) -> Option<VoxelId> {
        self.mapper.to_flat(coord).and_then(|i| self.map[i])
    }

    /// Placed members.
    #[inline]
    #[must_use]
    pub fn members(&self) -> &[VoxelId] {
        &self.members
    }

    /// Members with at least one exposed link slot.
    #[inline]
    #[must_use]
    pub fn surface(&self) -> &[VoxelId] {
        &self.surface
    }

    /// Voxels waiting for the next rebuild to be placed.
    #[inline]
    #[must_use]
    pub fn pending(&self) -> &[VoxelId] {
        &self.pending
    }

    /// Returns whether the group has neither members nor pending voxels.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty() && self.pending.is_empty()
    }
}

impl Default for GroupLayout {
    fn default() -> Self {
        Self::empty()
    }
}

/// Rebuild instrumentation of a group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RebuildStats {
    /// Completed rebuild calls.
    pub rebuilds: u64,
    /// Rebuild passes (a call may loop when dirtied mid-run).
    pub passes: u64,
    /// Most rebuilds ever observed running at once. Must never exceed 1.
    pub peak_concurrent: u32,
    /// Rebuild lock counters.
    pub rebuild_lock: SpinStats,
    /// Failed check-lock attempts.
    pub check_contentions: u64,
}

/// A connectivity group.
#[derive(Debug)]
pub struct Group {
    id: GroupId,
    /// The rebuild lock.
    rebuild_lock: SpinFlag,
    /// The check lock, and the data it guards.
    layout: Mutex<GroupLayout>,
    /// Link changes signalled since the last rebuild started.
    dirty_links: AtomicU32,
    needs_rebuild: AtomicBool,
    slot: AtomicU8,
    /// Default traversal root.
    anchor: AtomicU32,
    rebuilds: AtomicU64,
    passes: AtomicU64,
    active_rebuilds: AtomicU32,
    peak_active_rebuilds: AtomicU32,
    check_contentions: AtomicU64,
}

impl Group {
    /// Creates a live group holding exactly `voxel`.
    #[must_use]
    pub(crate) fn singleton(id: GroupId, voxel: VoxelId) -> Self {
        Self {
            id,
            rebuild_lock: SpinFlag::new(),
            layout: Mutex::new(GroupLayout::singleton(voxel)),
            dirty_links: AtomicU32::new(0),
            needs_rebuild: AtomicBool::new(false),
            slot: AtomicU8::new(SlotState::Live as u8),
            anchor: AtomicU32::new(voxel.raw()),
            rebuilds: AtomicU64::new(0),
            passes: AtomicU64::new(0),
            active_rebuilds: AtomicU32::new(0),
            peak_active_rebuilds: AtomicU32::new(0),
            check_contentions: AtomicU64::new(0),
        }
    }

    /// This group's handle.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> GroupId {
        self.id
    }

    /// Current state. A snapshot; may be stale immediately.
    #[must_use]
    pub fn state(&self) -> GroupState {
        match self.slot_state() {
            SlotState::Merged => GroupState::Merged,
            SlotState::Free => GroupState::Free,
            SlotState::Live if self.rebuild_lock.is_held() => GroupState::Rebuilding,
            SlotState::Live if self.needs_rebuild() => GroupState::Dirty,
            SlotState::Live => GroupState::Stable,
        }
    }

    /// Returns whether the slot holds a live group.
    #[inline]
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.slot_state() == SlotState::Live
    }

    /// Returns whether links changed since the last rebuild.
    #[inline]
    #[must_use]
    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::Acquire)
    }

    /// Link changes signalled since the last rebuild started.
    #[inline]
    #[must_use]
    pub fn dirty_links(&self) -> u32 {
        self.dirty_links.load(Ordering::Acquire)
    }

    /// Returns whether a rebuild, merge or attach holds the rebuild lock.
    #[inline]
    #[must_use]
    pub fn is_rebuilding(&self) -> bool {
        self.rebuild_lock.is_held()
    }

    /// The voxel rebuilds start from when no worker supplies one.
    #[inline]
    #[must_use]
    pub fn anchor(&self) -> VoxelId {
        VoxelId::new(self.anchor.load(Ordering::Acquire))
    }

    /// Signals that a link of one of this group's voxels formed or broke.
    ///
    /// Any number of signals between two rebuilds coalesce into one traversal.
    #[inline]
    pub fn mark_dirty(&self) {
        self.dirty_links.fetch_add(1, Ordering::AcqRel);
        self.needs_rebuild.store(true, Ordering::Release);
    }

    /// Rebuild instrumentation.
    #[must_use]
    pub fn rebuild_stats(&self) -> RebuildStats {
        RebuildStats {
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            passes: self.passes.load(Ordering::Relaxed),
            peak_concurrent: self.peak_active_rebuilds.load(Ordering::Relaxed),
            rebuild_lock: self.rebuild_lock.stats(),
            check_contentions: self.check_contentions.load(Ordering::Relaxed),
        }
    }

    // ------------------------------------------------------------------------
    // Crate-internal plumbing
    // ------------------------------------------------------------------------

    #[inline]
    pub(crate) fn slot_state(&self) -> SlotState {
        SlotState::from_u8(self.slot.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_slot_state(&self, state: SlotState) {
        self.slot.store(state as u8, Ordering::Release);
    }

    /// Moves the slot from `from` to `to` if nobody else did first.
    #[inline]
    pub(crate) fn transition_slot(&self, from: SlotState, to: SlotState) -> bool {
        self.slot
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub(crate) fn set_anchor(&self, voxel: VoxelId) {
        self.anchor.store(voxel.raw(), Ordering::Release);
    }

    /// Clears the dirty flag and counter at the start of a rebuild pass.
    #[inline]
    pub(crate) fn begin_pass(&self) -> u32 {
        self.needs_rebuild.store(false, Ordering::Release);
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.dirty_links.swap(0, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn clear_dirty(&self) {
        self.needs_rebuild.store(false, Ordering::Release);
        self.dirty_links.store(0, Ordering::Release);
    }

    #[inline]
    pub(crate) fn record_rebuild(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn try_rebuild_lock(&self) -> Option<SpinGuard<'_>> {
        self.rebuild_lock.try_acquire()
    }

    #[inline]
    pub(crate) fn rebuild_lock_bounded(&self, spins: u32) -> Option<SpinGuard<'_>> {
        self.rebuild_lock.acquire_bounded(spins)
    }

    /// Try-locks the check lock up to `spins` times.
    pub(crate) fn layout_bounded(&self, spins: u32) -> Option<MutexGuard<'_, GroupLayout>> {
        spin_until(spins, || {
            let guard = self.layout.try_lock();
            if guard.is_none() {
                self.check_contentions.fetch_add(1, Ordering::Relaxed);
            }
            guard
        })
    }

    /// Marks one rebuild as running until the returned token drops.
    pub(crate) fn enter_rebuild(&self) -> ActiveRebuild<'_> {
        let now = self.active_rebuilds.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_active_rebuilds.fetch_max(now, Ordering::AcqRel);
        ActiveRebuild { group: self }
    }
}

/// Token counting a running rebuild.
pub(crate) struct ActiveRebuild<'a> {
    group: &'a Group,
}

impl Drop for ActiveRebuild<'_> {
    fn drop(&mut self) {
        self.group.active_rebuilds.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// LOCK SETS - the only way to hold locks on two groups
// ============================================================================

/// Rebuild locks of one or two groups, taken in ascending id order.
pub(crate) struct RebuildLocks<'g> {
    _first: SpinGuard<'g>,
    _second: Option<SpinGuard<'g>>,
}

/// Takes the rebuild locks of `a` and `b` (one lock if they are the same group).
pub(crate) fn lock_rebuilds<'g>(
    a: &'g Group,
    b: &'g Group,
    spins: u32,
) -> Result<RebuildLocks<'g>, DeferReason> {
    let (low, high) = ordered(a, b);
    let first = low
        .rebuild_lock_bounded(spins)
        .ok_or(DeferReason::Contended)?;
    let second = match high {
        Some(group) => Some(
            group
                .rebuild_lock_bounded(spins)
                .ok_or(DeferReason::Contended)?,
        ),
        None => None,
    };
    Ok(RebuildLocks {
        _first: first,
        _second: second,
    })
}

/// Layouts of one or two groups, locked in ascending id order.
pub(crate) struct LayoutLocks<'g> {
    first: (GroupId, MutexGuard<'g, GroupLayout>),
    second: Option<(GroupId, MutexGuard<'g, GroupLayout>)>,
}

impl LayoutLocks<'_> {
    /// Layout of `id`, which must be one of the locked groups.
    pub(crate) fn get(&self, id: GroupId) -> &GroupLayout {
        match &self.second {
            Some((second_id, layout)) if *second_id == id => layout,
            _ => {
                debug_assert_eq!(self.first.0, id, "group {id} is not locked");
                &self.first.1
            }
        }
    }

    /// Mutable layout of `id`, which must be one of the locked groups.
    pub(crate) fn get_mut(&mut self, id: GroupId) -> &mut GroupLayout {
        match &mut self.second {
            Some((second_id, layout)) if *second_id == id => layout,
            _ => {
                debug_assert_eq!(self.first.0, id, "group {id} is not locked");
                &mut self.first.1
            }
        }
    }
}

/// Takes the check locks of `a` and `b` (one lock if they are the same group).
pub(crate) fn lock_layouts<'g>(
    a: &'g Group,
    b: &'g Group,
    spins: u32,
) -> Result<LayoutLocks<'g>, DeferReason> {
    let (low, high) = ordered(a, b);
    let first = low.layout_bounded(spins).ok_or(DeferReason::Contended)?;
    let second = match high {
        Some(group) => Some((
            group.id,
            group.layout_bounded(spins).ok_or(DeferReason::Contended)?,
        )),
        None => None,
    };
    Ok(LayoutLocks {
        first: (low.id, first),
        second,
    })
}

/// Orders two groups by id; `None` second when they are the same group.
fn ordered<'g>(a: &'g Group, b: &'g Group) -> (&'g Group, Option<&'g Group>) {
    match a.id.cmp(&b.id) {
        std::cmp::Ordering::Equal => (a, None),
        std::cmp::Ordering::Less => (a, Some(b)),
        std::cmp::Ordering::Greater => (b, Some(a)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singleton_layout() {
        let layout = GroupLayout::singleton(VoxelId::new(4));
        assert_eq!(layout.dims(), [1, 1, 1]);
        assert_eq!(layout.voxel_at(GridCoord::ORIGIN), Some(VoxelId::new(4)));
        assert_eq!(layout.members(), &[VoxelId::new(4)]);
        assert_eq!(layout.surface(), &[VoxelId::new(4)]);
        assert!(!layout.is_empty());
    }

    #[test]
    fn test_state_transitions() {
        let group = Group::singleton(GroupId::new(0), VoxelId::new(0));
        assert_eq!(group.state(), GroupState::Stable);

        group.mark_dirty();
        group.mark_dirty();
        assert_eq!(group.state(), GroupState::Dirty);
        assert_eq!(group.dirty_links(), 2);

        {
            let _lock = group.try_rebuild_lock().unwrap();
            assert_eq!(group.state(), GroupState::Rebuilding);
            assert_eq!(group.begin_pass(), 2);
        }
        assert_eq!(group.state(), GroupState::Stable);

        assert!(group.transition_slot(SlotState::Live, SlotState::Merged));
        assert_eq!(group.state(), GroupState::Merged);
        assert!(!group.transition_slot(SlotState::Live, SlotState::Free));
    }

    #[test]
    fn test_layout_locks_follow_id_order() {
        let a = Group::singleton(GroupId::new(3), VoxelId::new(3));
        let b = Group::singleton(GroupId::new(1), VoxelId::new(1));

        let locks = lock_layouts(&a, &b, 1).unwrap();
        assert_eq!(locks.first.0, GroupId::new(1));
        assert_eq!(locks.get(GroupId::new(3)).members(), &[VoxelId::new(3)]);
        assert_eq!(locks.get(GroupId::new(1)).members(), &[VoxelId::new(1)]);

        // Both held: a second attempt defers
        assert_eq!(
            lock_layouts(&b, &a, 1).err(),
            Some(DeferReason::Contended)
        );
    }

    #[test]
    fn test_same_group_takes_one_lock() {
        let a = Group::singleton(GroupId::new(2), VoxelId::new(2));
        let locks = lock_rebuilds(&a, &a, 1);
        assert!(locks.is_ok());
        assert!(a.is_rebuilding());
        drop(locks);
        assert!(!a.is_rebuilding());
    }

    #[test]
    fn test_peak_concurrency_tracking() {
        let group = Group::singleton(GroupId::new(0), VoxelId::new(0));
        {
            let _one = group.enter_rebuild();
            let _two = group.enter_rebuild();
        }
        let _three = group.enter_rebuild();
        assert_eq!(group.rebuild_stats().peak_concurrent, 2);
    }
}
