//! # Group Rebuild
//!
//! Breadth-first reconstruction of a group from the live link topology.
//!
//! ## Protocol
//!
//! ```text
//! try rebuild lock ── fail ──> Contended (dirty flag persists)
//!       │
//!  ┌──> clear dirty flag/counter
//!  │    BFS from start voxel over live links to voxels claiming this group
//!  │    size box, allocate map, place members, derive surface
//!  │    try check lock ── fail ──> re-mark dirty, Contended
//!  │    publish coordinates + layout
//!  │    hand unreached claimants to a free group (split)
//!  └─── dirtied meanwhile? (bounded by max_rebuild_passes)
//! ```
//!
//! A link is live when both slots agree: A holds B in `d` and B holds A in
//! `opposite(d)`. The start voxel sits at the origin during traversal; the
//! finished frame is shifted so the box minimum is `(0, 0, 0)`.

use std::collections::{HashMap, HashSet, VecDeque};

use super::mapper::{CoordMapper, GridCoord};
use super::{Group, GroupId, GroupLayout, SlotState};
use crate::error::{GroupError, GroupResult};
use crate::lattice::{Lattice, VoxelId};

/// Result of a rebuild request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RebuildOutcome {
    /// This caller rebuilt the group.
    Rebuilt(RebuildReport),
    /// Another worker holds a lock; the dirty flag stays set for later.
    Contended,
    /// Nothing to do for this caller.
    Skipped(SkipReason),
}

impl RebuildOutcome {
    /// Returns the report if this caller performed the rebuild.
    #[must_use]
    pub fn report(&self) -> Option<&RebuildReport> {
        match self {
            Self::Rebuilt(report) => Some(report),
            _ => None,
        }
    }
}

/// Why a rebuild request did nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    /// The group was merged away or is free.
    NotLive,
    /// The start voxel belongs to another group by now.
    StartMoved,
}

/// What a completed rebuild produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RebuildReport {
    /// The rebuilt group.
    pub group: GroupId,
    /// Bounding-box dimensions.
    pub dims: [u32; 3],
    /// Member count.
    pub members: usize,
    /// Surface voxel count.
    pub surface: usize,
    /// Traversal passes run (more than one when dirtied mid-run).
    pub passes: u32,
    /// Group that received unreached voxels, if the group split.
    pub split_off: Option<GroupId>,
    /// Unreached voxels that could not be handed over (no free group slot).
    pub stranded: usize,
    /// False when the pass budget ran out with dirtying still outstanding.
    pub settled: bool,
}

impl Group {
    /// Rebuilds this group by traversal from `start`.
    ///
    /// Safe to call redundantly from any number of workers: only the one that
    /// wins the rebuild lock traverses, the rest get
    /// [`RebuildOutcome::Contended`] at once.
    ///
    /// # Errors
    ///
    /// Fatal [`GroupError`]s when the map cannot be sized or allocated, or the
    /// links place two voxels on one cell. [`GroupError::UnknownVoxel`] when
    /// `start` is not a lattice voxel.
    pub fn rebuild(&self, lattice: &Lattice, start: VoxelId) -> GroupResult<RebuildOutcome> {
        lattice.voxel(start)?;

        let Some(_rebuild_lock) = self.try_rebuild_lock() else {
            return Ok(RebuildOutcome::Contended);
        };
        if self.slot_state() != SlotState::Live {
            return Ok(RebuildOutcome::Skipped(SkipReason::NotLive));
        }
        if lattice.voxel(start)?.group() != self.id() {
            return Ok(RebuildOutcome::Skipped(SkipReason::StartMoved));
        }

        let _active = self.enter_rebuild();
        let config = lattice.config();
        let max_passes = config.max_rebuild_passes.max(1);
        let mut passes = 0;
        let mut split_off = None;

        let (summary, stranded) = loop {
            passes += 1;
            let signals = self.begin_pass();
            tracing::trace!(group = %self.id(), pass = passes, signals, "rebuild pass");

            let traversal = Traversal::run(lattice, self.id(), start)?;
            let fresh = match traversal.place(self.id(), config.max_map_cells) {
                Ok(fresh) => fresh,
                // Links moved under the traversal; the next pass sees them settled
                Err(GroupError::InconsistentTopology { .. })
                    if self.needs_rebuild() && passes < max_passes =>
                {
                    continue;
                }
                Err(err) => {
                    if err.is_fatal() {
                        self.mark_dirty();
                        tracing::error!(group = %self.id(), error = %err, "rebuild failed");
                    }
                    return Err(err);
                }
            };

            let Some(mut layout) = self.layout_bounded(config.lock_spin_limit) else {
                self.mark_dirty();
                tracing::debug!(group = %self.id(), "rebuild could not publish: check lock contended");
                return Ok(RebuildOutcome::Contended);
            };

            let orphans: Vec<VoxelId> = layout
                .members
                .iter()
                .chain(&layout.pending)
                .copied()
                .filter(|v| !traversal.reached(*v))
                .filter(|v| {
                    lattice
                        .voxel(*v)
                        .map_or(false, |voxel| voxel.group() == self.id())
                })
                .collect();

            for (voxel, coord) in &fresh.placements {
                lattice.voxel(*voxel)?.set_coord(*coord);
            }
            let summary = (
                fresh.layout.dims(),
                fresh.layout.members.len(),
                fresh.layout.surface.len(),
            );
            *layout = fresh.layout;
            // Unreached claimants wait as pending until they are handed over
            layout.pending.clone_from(&orphans);
            drop(layout);
            self.set_anchor(start);

            let mut stranded = 0;
            if !orphans.is_empty() {
                if let Some(target) = lattice.split_off(self, &orphans) {
                    tracing::debug!(
                        group = %self.id(),
                        split_off = %target,
                        voxels = orphans.len(),
                        "group split"
                    );
                    split_off = Some(target);
                    match self.layout_bounded(config.lock_spin_limit) {
                        Some(mut layout) => layout.pending.clear(),
                        None => self.mark_dirty(),
                    }
                } else {
                    stranded = orphans.len();
                    self.mark_dirty();
                    tracing::debug!(group = %self.id(), stranded, "split deferred: no free group slot");
                }
            }

            if stranded > 0 || !self.needs_rebuild() {
                break (summary, stranded);
            }
            if passes >= max_passes {
                tracing::warn!(
                    group = %self.id(),
                    passes,
                    "rebuild pass budget spent; leaving dirty group for the next step"
                );
                break (summary, stranded);
            }
        };

        self.record_rebuild();
        let (dims, members, surface) = summary;
        Ok(RebuildOutcome::Rebuilt(RebuildReport {
            group: self.id(),
            dims,
            members,
            surface,
            passes,
            split_off,
            stranded,
            settled: !self.needs_rebuild(),
        }))
    }
}

/// Breadth-first walk over live links.
struct Traversal {
    /// Reached voxels in visiting order, with their traversal-frame coordinate.
    order: Vec<(VoxelId, GridCoord)>,
    coords: HashMap<VoxelId, GridCoord>,
    min: GridCoord,
    max: GridCoord,
    /// Voxels with at least one exposed slot.
    surface: Vec<VoxelId>,
}

/// A layout ready to publish plus the coordinates to write back.
struct Placement {
    layout: GroupLayout,
    placements: Vec<(VoxelId, GridCoord)>,
}

impl Traversal {
    fn run(lattice: &Lattice, group: GroupId, start: VoxelId) -> GroupResult<Self> {
        let mut order = Vec::new();
        let mut coords = HashMap::new();
        let mut queue = VecDeque::new();
        let mut min = GridCoord::ORIGIN;
        let mut max = GridCoord::ORIGIN;

        coords.insert(start, GridCoord::ORIGIN);
        queue.push_back(start);

        while let Some(current) = queue.pop_front() {
            let coord = coords[&current];
            order.push((current, coord));

            for (dir, neighbor) in lattice.voxel(current)?.links() {
                if !lattice.is_live_link(current, dir, neighbor)? {
                    continue;
                }
                if lattice.voxel(neighbor)?.group() != group {
                    continue;
                }
                let expected = coord.step(dir, 1);
                match coords.get(&neighbor) {
                    Some(&seen) if seen != expected => {
                        return Err(GroupError::InconsistentTopology {
                            group,
                            first: current,
                            second: neighbor,
                            at: expected,
                        });
                    }
                    Some(_) => {}
                    None => {
                        coords.insert(neighbor, expected);
                        min = min.min(expected);
                        max = max.max(expected);
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        let reached: HashSet<VoxelId> = coords.keys().copied().collect();
        let mut surface = Vec::new();
        for &(voxel, _) in &order {
            if lattice.is_exposed(voxel, |n| reached.contains(&n))? {
                surface.push(voxel);
            }
        }

        Ok(Self {
            order,
            coords,
            min,
            max,
            surface,
        })
    }

    #[inline]
    fn reached(&self, voxel: VoxelId) -> bool {
        self.coords.contains_key(&voxel)
    }

    /// Sizes the box, allocates the map and places every reached voxel.
    fn place(&self, group: GroupId, max_cells: usize) -> GroupResult<Placement> {
        let extent = self.max - self.min;
        // Extents are differences of i32 values, so each fits in u64 after +1
        let dims_wide = extent.to_array().map(|e| u64::from(e.unsigned_abs()) + 1);
        let dims = match dims_wide.map(|d| u32::try_from(d).ok().filter(|&d| d <= i32::MAX as u32)) {
            [Some(x), Some(y), Some(z)] => [x, y, z],
            _ => return Err(GroupError::DimensionOverflow { dims: dims_wide }),
        };
        let cells = CoordMapper::checked_volume(dims)
            .ok_or(GroupError::DimensionOverflow { dims: dims_wide })?;
        if cells > max_cells {
            return Err(GroupError::MapCapacityExceeded {
                requested: cells,
                limit: max_cells,
            });
        }

        let mut map: Vec<Option<VoxelId>> = Vec::new();
        map.try_reserve_exact(cells)
            .map_err(|_| GroupError::AllocationFailed { cells })?;
        map.resize(cells, None);

        let mapper = CoordMapper::new(dims);
        let mut placements = Vec::with_capacity(self.order.len());
        for &(voxel, coord) in &self.order {
            let local = coord - self.min;
            let Some(index) = mapper.to_flat(local) else {
                return Err(GroupError::DimensionOverflow { dims: dims_wide });
            };
            if let Some(first) = map[index] {
                return Err(GroupError::InconsistentTopology {
                    group,
                    first,
                    second: voxel,
                    at: local,
                });
            }
            map[index] = Some(voxel);
            placements.push((voxel, local));
        }

        Ok(Placement {
            layout: GroupLayout {
                mapper,
                map,
                members: self.order.iter().map(|&(voxel, _)| voxel).collect(),
                surface: self.surface.clone(),
                pending: Vec::new(),
            },
            placements,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;
    use crate::lattice::{LatticeBuilder, LinkDirection};

    fn line_of_three() -> (Lattice, [VoxelId; 3]) {
        let mut builder = LatticeBuilder::new(GroupConfig::default());
        let a = builder.add_voxel([0, 0, 0]).unwrap();
        let b = builder.add_voxel([1, 0, 0]).unwrap();
        let c = builder.add_voxel([2, 0, 0]).unwrap();
        builder.link_adjacent();
        (builder.build().unwrap(), [a, b, c])
    }

    #[test]
    fn test_line_rebuild_from_each_voxel() {
        let (lattice, voxels) = line_of_three();

        for start in voxels {
            let group = lattice.group_of(start).unwrap();
            group.mark_dirty();
            let outcome = lattice.rebuild(start).unwrap();
            let report = outcome.report().unwrap();
            assert_eq!(report.dims, [3, 1, 1]);
            assert_eq!(report.members, 3);
            assert_eq!(report.surface, 3);
            assert!(report.settled);

            let layout = lattice.snapshot(group.id()).unwrap();
            assert_eq!(layout.map(), &[Some(voxels[0]), Some(voxels[1]), Some(voxels[2])]);
            let mut members = layout.members().to_vec();
            members.sort();
            assert_eq!(members, voxels.to_vec());
        }
    }

    #[test]
    fn test_rebuild_is_idempotent() {
        let (lattice, voxels) = line_of_three();
        let group = lattice.group_of(voxels[1]).unwrap().id();

        lattice.rebuild(voxels[1]).unwrap();
        let before = lattice.snapshot(group).unwrap();
        let coords_before: Vec<_> = voxels.iter().map(|v| lattice.voxel(*v).unwrap().coord()).collect();

        lattice.rebuild(voxels[1]).unwrap();
        let after = lattice.snapshot(group).unwrap();
        let coords_after: Vec<_> = voxels.iter().map(|v| lattice.voxel(*v).unwrap().coord()).collect();

        assert_eq!(before.map(), after.map());
        assert_eq!(before.dims(), after.dims());
        assert_eq!(coords_before, coords_after);
    }

    #[test]
    fn test_contended_rebuild_leaves_dirty_flag() {
        let (lattice, voxels) = line_of_three();
        let group = lattice.group_of(voxels[0]).unwrap();
        group.mark_dirty();

        let _held = group.try_rebuild_lock().unwrap();
        assert_eq!(lattice.rebuild(voxels[0]).unwrap(), RebuildOutcome::Contended);
        assert!(group.needs_rebuild());
    }

    #[test]
    fn test_break_splits_group() {
        let (lattice, [a, b, c]) = line_of_three();
        let original = lattice.group_of(a).unwrap().id();

        assert_eq!(lattice.unlink(b, LinkDirection::PosX).unwrap(), Some(c));
        let report = lattice.rebuild(a).unwrap().report().cloned().unwrap();

        assert_eq!(report.members, 2);
        assert_eq!(report.dims, [2, 1, 1]);
        let split = report.split_off.expect("c must be handed to a free group");
        assert_eq!(lattice.voxel(c).unwrap().group(), split);
        assert_eq!(lattice.voxel(a).unwrap().group(), original);

        let second = lattice.rebuild(c).unwrap().report().cloned().unwrap();
        assert_eq!(second.members, 1);
        assert_eq!(second.dims, [1, 1, 1]);
        assert!(lattice.audit().is_consistent());
    }

    #[test]
    fn test_capacity_exceeded_is_fatal() {
        let config = GroupConfig {
            max_map_cells: 2,
            ..GroupConfig::default()
        };
        let lattice = Lattice::new(3, config);
        let [a, b, c] = [0, 1, 2].map(VoxelId::new);

        assert!(lattice.try_attach(a, b, LinkDirection::PosX).unwrap().is_attached());
        assert!(lattice.rebuild(a).unwrap().report().is_some());
        assert!(lattice.try_attach(b, c, LinkDirection::PosX).unwrap().is_attached());

        let err = lattice.rebuild(a).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(
            err,
            GroupError::MapCapacityExceeded {
                requested: 3,
                limit: 2
            }
        );
        assert!(lattice.group_of(a).unwrap().needs_rebuild());
    }

    #[test]
    fn test_start_moved_is_skipped() {
        let lattice = Lattice::new(2, GroupConfig::default());
        let [a, b] = [0, 1].map(VoxelId::new);
        let group_b = lattice.voxel(b).unwrap().group();

        let outcome = lattice
            .group(group_b)
            .unwrap()
            .rebuild(&lattice, a)
            .unwrap();
        assert_eq!(outcome, RebuildOutcome::Skipped(SkipReason::StartMoved));
    }
}
