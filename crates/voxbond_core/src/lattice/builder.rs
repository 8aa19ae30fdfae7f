//! # Lattice Builder
//!
//! Lays voxels out on integer cells, wires links, and produces a [`Lattice`]
//! whose groups are already rebuilt: one group per connected component,
//! anchored at the component's lowest voxel id. Group slots not needed by a
//! component start out in the free pool.

use std::collections::{HashMap, VecDeque};

use super::{Lattice, LinkDirection, VoxelId};
use crate::config::GroupConfig;
use crate::error::GroupResult;
use crate::group::{GroupId, GroupLayout, SlotState};

/// Positive directions; wiring these per voxel covers every face pair once.
const FORWARD: [LinkDirection; 3] = [LinkDirection::PosX, LinkDirection::PosY, LinkDirection::PosZ];

/// Incremental [`Lattice`] construction.
#[derive(Debug, Default)]
pub struct LatticeBuilder {
    config: GroupConfig,
    positions: Vec<[i32; 3]>,
    cells: HashMap<[i32; 3], VoxelId>,
    links: Vec<(VoxelId, VoxelId, LinkDirection)>,
}

impl LatticeBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new(config: GroupConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// A fully linked solid block of `dims` voxels, x varying fastest.
    #[must_use]
    pub fn block(dims: [u32; 3], config: GroupConfig) -> Self {
        let mut builder = Self::new(config);
        let [nx, ny, nz] = dims.map(|d| i32::try_from(d).unwrap_or(i32::MAX));
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    builder.add_voxel([x, y, z]);
                }
            }
        }
        builder.link_adjacent();
        builder
    }

    /// Places a voxel on `cell`. `None` if the cell is taken.
    pub fn add_voxel(&mut self, cell: [i32; 3]) -> Option<VoxelId> {
        if self.cells.contains_key(&cell) {
            return None;
        }
        let id = VoxelId::new(u32::try_from(self.positions.len()).ok()?);
        self.positions.push(cell);
        self.cells.insert(cell, id);
        Some(id)
    }

    /// Requests a link from `a` to `b` along `dir`.
    ///
    /// Requests whose slots are already taken when the lattice is built are
    /// dropped.
    pub fn link(&mut self, a: VoxelId, b: VoxelId, dir: LinkDirection) -> &mut Self {
        self.links.push((a, b, dir));
        self
    }

    /// Requests a link between every pair of face-adjacent voxels.
    ///
    /// Returns the number of links requested.
    pub fn link_adjacent(&mut self) -> usize {
        let mut added = 0;
        for (index, cell) in self.positions.iter().enumerate() {
            let id = VoxelId::new(index as u32);
            for dir in FORWARD {
                let [dx, dy, dz] = dir.offset();
                let next = [cell[0] + dx, cell[1] + dy, cell[2] + dz];
                if let Some(&neighbor) = self.cells.get(&next) {
                    self.links.push((id, neighbor, dir));
                    added += 1;
                }
            }
        }
        added
    }

    /// Number of voxels placed so far.
    #[inline]
    #[must_use]
    pub fn voxel_count(&self) -> usize {
        self.positions.len()
    }

    /// Cell of a placed voxel.
    #[inline]
    #[must_use]
    pub fn position(&self, voxel: VoxelId) -> Option<[i32; 3]> {
        self.positions.get(voxel.index()).copied()
    }

    /// Voxel on `cell`, if any.
    #[inline]
    #[must_use]
    pub fn voxel_at(&self, cell: [i32; 3]) -> Option<VoxelId> {
        self.cells.get(&cell).copied()
    }

    /// Wires the requested links, forms the groups and rebuilds each one.
    ///
    /// # Errors
    ///
    /// A fatal [`GroupError`](crate::GroupError) if a component cannot be
    /// laid out (explicit links that contradict each other, or a component
    /// larger than `max_map_cells`).
    pub fn build(self) -> GroupResult<Lattice> {
        let lattice = Lattice::new(self.positions.len(), self.config);

        let mut wired = 0;
        for &(a, b, dir) in &self.links {
            if a != b && lattice.wire(a, b, dir)? {
                wired += 1;
            }
        }

        let mut visited = vec![false; lattice.voxel_count()];
        let mut components = 0;
        for root in lattice.voxel_ids() {
            if visited[root.index()] {
                continue;
            }
            components += 1;
            let others = collect_component(&lattice, root, &mut visited)?;
            if others.is_empty() {
                continue;
            }

            let root_group = GroupId::new(root.raw());
            for &voxel in &others {
                lattice.voxel(voxel)?.set_group(root_group);
                let spare = lattice.group(GroupId::new(voxel.raw()))?;
                spare.set_slot_state(SlotState::Free);
                if let Some(mut layout) = spare.layout_bounded(1) {
                    *layout = GroupLayout::empty();
                }
                let _ = lattice.free_tx.try_send(spare.id());
            }

            let group = lattice.group(root_group)?;
            if let Some(mut layout) = group.layout_bounded(1) {
                layout.pending = others;
            }
            group.mark_dirty();
        }

        lattice.rebuild_dirty()?;
        tracing::debug!(
            voxels = lattice.voxel_count(),
            links = wired,
            groups = components,
            "lattice built"
        );
        Ok(lattice)
    }
}

/// Voxels linked to `root`, excluding `root`, in ascending id order.
fn collect_component(
    lattice: &Lattice,
    root: VoxelId,
    visited: &mut [bool],
) -> GroupResult<Vec<VoxelId>> {
    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    visited[root.index()] = true;

    while let Some(current) = queue.pop_front() {
        for (dir, neighbor) in lattice.voxel(current)?.links() {
            if visited[neighbor.index()] || !lattice.is_live_link(current, dir, neighbor)? {
                continue;
            }
            visited[neighbor.index()] = true;
            found.push(neighbor);
            queue.push_back(neighbor);
        }
    }

    found.sort_unstable();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupState;

    #[test]
    fn test_cells_are_unique() {
        let mut builder = LatticeBuilder::new(GroupConfig::default());
        assert_eq!(builder.add_voxel([0, 0, 0]), Some(VoxelId::new(0)));
        assert_eq!(builder.add_voxel([0, 0, 0]), None);
        assert_eq!(builder.add_voxel([5, -1, 2]), Some(VoxelId::new(1)));
        assert_eq!(builder.voxel_at([5, -1, 2]), Some(VoxelId::new(1)));
        assert_eq!(builder.position(VoxelId::new(0)), Some([0, 0, 0]));
    }

    #[test]
    fn test_block_is_one_group() {
        let lattice = LatticeBuilder::block([3, 2, 2], GroupConfig::default())
            .build()
            .unwrap();

        assert_eq!(lattice.live_groups().count(), 1);
        assert_eq!(lattice.free_group_count(), 11);

        let group = lattice.group_of(VoxelId::new(0)).unwrap();
        assert_eq!(group.state(), GroupState::Stable);
        let layout = lattice.snapshot(group.id()).unwrap();
        assert_eq!(layout.dims(), [3, 2, 2]);
        assert_eq!(layout.members().len(), 12);
        // Every voxel of a 3x2x2 block touches the outside
        assert_eq!(layout.surface().len(), 12);
        assert!(lattice.audit().is_consistent());
    }

    #[test]
    fn test_components_anchor_at_lowest_id() {
        let mut builder = LatticeBuilder::new(GroupConfig::default());
        let a = builder.add_voxel([0, 0, 0]).unwrap();
        let b = builder.add_voxel([1, 0, 0]).unwrap();
        let c = builder.add_voxel([5, 5, 5]).unwrap();
        let d = builder.add_voxel([5, 6, 5]).unwrap();
        assert_eq!(builder.link_adjacent(), 2);
        let lattice = builder.build().unwrap();

        assert_eq!(lattice.live_groups().count(), 2);
        assert_eq!(lattice.voxel(b).unwrap().group(), GroupId::new(a.raw()));
        assert_eq!(lattice.voxel(d).unwrap().group(), GroupId::new(c.raw()));
        assert_eq!(lattice.group_of(d).unwrap().anchor(), c);
    }

    #[test]
    fn test_builder_coordinates_follow_cells() {
        let mut builder = LatticeBuilder::new(GroupConfig::default());
        let a = builder.add_voxel([4, 4, 4]).unwrap();
        let b = builder.add_voxel([4, 3, 4]).unwrap();
        let c = builder.add_voxel([4, 3, 5]).unwrap();
        builder.link_adjacent();
        let lattice = builder.build().unwrap();

        let layout = lattice.snapshot(lattice.group_of(a).unwrap().id()).unwrap();
        assert_eq!(layout.dims(), [1, 2, 2]);
        for voxel in [a, b, c] {
            let coord = lattice.voxel(voxel).unwrap().coord();
            assert_eq!(layout.voxel_at(coord), Some(voxel));
        }
        assert_eq!(lattice.voxel(b).unwrap().coord(), crate::GridCoord::new(0, 0, 0));
    }
}
